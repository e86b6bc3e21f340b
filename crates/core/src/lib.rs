//! Handle-based document engine for hosting PDF rendering inside managed
//! runtimes.
//!
//! Every resource a host touches lives in an [`Engine`] arena slot behind a
//! reference-counted handle; the typed wrappers here ([`Document`],
//! [`Pixmap`], [`PdfObject`], ...) are copies of those handles with an
//! explicit, idempotent `destroy()`. Boundary crossings stay cheap: plain
//! geometry by value, bytes through the engine scratch pad, callbacks
//! through traits registered on the engine. Rendering off the host thread
//! goes through [`worker`], which ships only plain values and byte buffers.

pub mod content;
pub mod device;
pub mod display;
pub mod document;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod object;
pub mod outline;
pub mod pixmap;
pub mod stream;
pub mod worker;
pub mod write;

mod crypt;
mod handle;
mod parse;

pub use error::{Error, Result};

// The shared engine and the one flag that crosses threads.
pub use engine::{CancelFlag, Engine, FontLoaderFn, FontRequest};

// Geometry crosses every boundary by value.
pub use geometry::{Color, Matrix, Point, Quad, Rect};

// Documents, pages, authentication.
pub use document::{AuthOutcome, Document, Page};

// The object graph and cross-document grafting.
pub use object::{GraftMap, PdfObject};

// Content resources captured from or fed into pages.
pub use content::{
    ColorSpace, Font, Image, Path, PathWalker, Shade, StrokeState, Text, TextGlyph, TextWalker,
};

// Devices: the native implementations and the host-facing trait.
pub use device::{BlendMode, Device, NativeDevice};
pub use display::DisplayList;
pub use pixmap::Pixmap;

// Bookmark editing.
pub use outline::{OutlineEntry, OutlineItem, OutlineIterator, OutlinePosition};

// Progressive opening over partial byte ranges.
pub use stream::{ByteSource, ChunkedSource, OpenProgress, ProgressiveOpen, SourceRead};

// Serialization options and the offscreen render worker.
pub use worker::{RenderFormat, RenderReply, RenderRequest, spawn_render};
pub use write::SaveOptions;
