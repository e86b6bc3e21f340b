//! Ownership wrappers around raw engine handles.
//!
//! Every public resource type is a thin newtype over [`Binding`]: the engine
//! reference, the raw handle, and the resource kind used in error messages.
//! A binding owns exactly one reference on its slot. `destroy` releases it
//! and zeroes the stored handle so later calls fail with a typed
//! use-after-destroy error instead of touching recycled storage; dropping a
//! wrapper that was never destroyed is the backstop that releases anyway.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::engine::Engine;
use crate::engine::arena::{NULL_HANDLE, RawHandle};
use crate::error::{Error, Result};

pub struct Binding {
    engine: Rc<Engine>,
    handle: Cell<RawHandle>,
    kind: &'static str,
}

impl Binding {
    /// Wraps a handle the caller already owns a reference on. Used for
    /// freshly created resources; does not retain.
    pub(crate) fn adopt(engine: Rc<Engine>, handle: RawHandle, kind: &'static str) -> Binding {
        Binding {
            engine,
            handle: Cell::new(handle),
            kind,
        }
    }

    /// Wraps a handle someone else owns. Retains, so the new binding owns
    /// its own reference.
    pub(crate) fn from_borrowed(
        engine: Rc<Engine>,
        handle: RawHandle,
        kind: &'static str,
    ) -> Result<Binding> {
        engine.retain(handle)?;
        Ok(Binding::adopt(engine, handle, kind))
    }

    /// The raw handle, or the use-after-destroy error once zeroed.
    pub(crate) fn raw(&self) -> Result<RawHandle> {
        let h = self.handle.get();
        if h == NULL_HANDLE {
            Err(Error::UseAfterDestroy(self.kind))
        } else {
            Ok(h)
        }
    }

    pub(crate) fn engine(&self) -> &Rc<Engine> {
        &self.engine
    }

    pub(crate) fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle.get() == NULL_HANDLE
    }

    /// Releases the owned reference exactly once. Calling again is a no-op.
    pub fn destroy(&self) {
        let h = self.handle.replace(NULL_HANDLE);
        if h != NULL_HANDLE {
            self.engine.release_handle(h);
        }
    }

    /// A second, independently owned binding on the same resource.
    pub(crate) fn keep_binding(&self) -> Result<Binding> {
        Binding::from_borrowed(Rc::clone(&self.engine), self.raw()?, self.kind)
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let h = self.handle.get();
        if h == NULL_HANDLE {
            write!(f, "{}(destroyed)", self.kind)
        } else {
            write!(f, "{}({:#x})", self.kind, h)
        }
    }
}

/// Implements the surface shared by every handle wrapper: `keep`,
/// `destroy`, `is_destroyed`, plus the crate-internal accessors.
macro_rules! handle_wrapper {
    ($type:ident, $kind:literal) => {
        impl $type {
            pub(crate) const KIND: &'static str = $kind;

            /// Returns a new wrapper owning its own reference on the same
            /// underlying resource.
            pub fn keep(&self) -> crate::error::Result<$type> {
                Ok($type {
                    bind: self.bind.keep_binding()?,
                })
            }

            /// Releases this wrapper's reference. Idempotent; any other
            /// method afterwards fails with a use-after-destroy error.
            pub fn destroy(&self) {
                self.bind.destroy();
            }

            pub fn is_destroyed(&self) -> bool {
                self.bind.is_destroyed()
            }

            #[allow(dead_code)]
            pub(crate) fn engine(&self) -> &std::rc::Rc<crate::engine::Engine> {
                self.bind.engine()
            }

            pub(crate) fn raw(&self) -> crate::error::Result<crate::engine::arena::RawHandle> {
                self.bind.raw()
            }
        }

        impl std::fmt::Debug for $type {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.bind.fmt(f)
            }
        }
    };
}

pub(crate) use handle_wrapper;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ColorSpaceData;
    use crate::engine::data::Resource;

    fn sample_handle(engine: &Rc<Engine>) -> RawHandle {
        engine.insert(Resource::ColorSpace(ColorSpaceData::device_rgb()))
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let engine = Engine::new();
        let b = Binding::adopt(Rc::clone(&engine), sample_handle(&engine), "colorspace");
        assert!(!b.is_destroyed());
        b.destroy();
        assert!(b.is_destroyed());
        b.destroy();
        assert_eq!(engine.live_resources(), 0);
    }

    #[test]
    fn test_use_after_destroy_error() {
        let engine = Engine::new();
        let b = Binding::adopt(Rc::clone(&engine), sample_handle(&engine), "colorspace");
        b.destroy();
        match b.raw() {
            Err(Error::UseAfterDestroy(kind)) => assert_eq!(kind, "colorspace"),
            other => panic!("expected use-after-destroy, got {other:?}"),
        }
        assert!(b.keep_binding().is_err());
    }

    #[test]
    fn test_drop_backstop_releases() {
        let engine = Engine::new();
        {
            let _b = Binding::adopt(Rc::clone(&engine), sample_handle(&engine), "colorspace");
            assert_eq!(engine.live_resources(), 1);
        }
        assert_eq!(engine.live_resources(), 0);
    }

    #[test]
    fn test_borrowed_binding_retains() {
        let engine = Engine::new();
        let owner = Binding::adopt(Rc::clone(&engine), sample_handle(&engine), "colorspace");
        let borrowed =
            Binding::from_borrowed(Rc::clone(&engine), owner.raw().unwrap(), "colorspace")
                .unwrap();
        owner.destroy();
        // The borrowed binding still holds the resource alive.
        assert_eq!(engine.live_resources(), 1);
        assert!(borrowed.raw().is_ok());
        borrowed.destroy();
        assert_eq!(engine.live_resources(), 0);
    }

    #[test]
    fn test_keep_outlives_original() {
        let engine = Engine::new();
        let a = Binding::adopt(Rc::clone(&engine), sample_handle(&engine), "colorspace");
        let b = a.keep_binding().unwrap();
        a.destroy();
        assert!(b.raw().is_ok());
    }
}
