//! File parsing and content interpretation.
//!
//! `lexer` tokenizes COS syntax, `reader` turns whole files into an object
//! store, `filters` decodes stream filter chains and `interp` executes page
//! content against a device.

pub(crate) mod filters;
pub(crate) mod interp;
pub(crate) mod lexer;
pub(crate) mod reader;
