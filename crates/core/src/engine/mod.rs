//! The engine instance every wrapper hangs off.
//!
//! One `Engine` owns the resource arena plus the small side tables used by
//! boundary crossings: registered device sinks, active content walks, the
//! scratch marshalling pad and the optional font loader hook. Engines are
//! single-threaded by construction; wrappers share one via `Rc` and nothing
//! here is Send. Rendering on another thread means building a second engine
//! there and shipping plain bytes across (see the worker module).

pub mod arena;
pub mod data;
pub mod scratch;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::device::Device;
use crate::error::{Error, Result};
use arena::{Arena, RawHandle};
use data::Resource;
use scratch::ScratchPad;

/// Request passed to the host font hook when a document needs a face the
/// file does not embed. `None` from the hook means no substitute exists.
#[derive(Debug, Clone, PartialEq)]
pub struct FontRequest {
    pub name: String,
    pub script: Option<String>,
    pub bold: bool,
    pub italic: bool,
}

pub type FontLoaderFn = Box<dyn FnMut(&FontRequest) -> Option<Vec<u8>>>;

pub(crate) type SinkRef = Rc<RefCell<Box<dyn Device>>>;

/// Cooperative cancellation flag, shared with render calls and pollable
/// from any thread. The only state that legitimately crosses threads.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<CancelInner>);

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    progress: AtomicU64,
}

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(Ordering::Relaxed)
    }

    /// Count of interpreter steps completed so far, for host progress UI.
    pub fn progress(&self) -> u64 {
        self.0.progress.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_progress(&self) {
        self.0.progress.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }
}

pub struct Engine {
    pub(crate) res: RefCell<Arena<Resource>>,
    sinks: RefCell<FxHashMap<u32, SinkRef>>,
    walks: RefCell<FxHashSet<u32>>,
    pub(crate) scratch: RefCell<ScratchPad>,
    font_loader: RefCell<Option<FontLoaderFn>>,
    next_sink: Cell<u32>,
    next_walk: Cell<u32>,
}

impl Engine {
    pub fn new() -> Rc<Engine> {
        Rc::new(Engine {
            res: RefCell::new(Arena::new()),
            sinks: RefCell::new(FxHashMap::default()),
            walks: RefCell::new(FxHashSet::default()),
            scratch: RefCell::new(ScratchPad::new()),
            font_loader: RefCell::new(None),
            next_sink: Cell::new(1),
            next_walk: Cell::new(1),
        })
    }

    /// Occupied arena slots. Mostly useful to assert teardown in tests.
    pub fn live_resources(&self) -> usize {
        self.res.borrow().live()
    }

    pub(crate) fn insert(&self, res: Resource) -> RawHandle {
        self.res.borrow_mut().insert(res)
    }

    pub(crate) fn retain(&self, handle: RawHandle) -> Result<()> {
        self.res.borrow_mut().retain(handle)?;
        Ok(())
    }

    /// Drops one reference and cascades into child handles of any payload
    /// that reached zero. Bridge sinks are unregistered here so a destroyed
    /// device cannot call back out. Stale handles are ignored: this runs
    /// from Drop backstops during teardown in arbitrary order.
    pub(crate) fn release_handle(&self, handle: RawHandle) {
        let mut queue = vec![handle];
        let mut dead_sinks: Vec<SinkRef> = Vec::new();
        while let Some(h) = queue.pop() {
            let freed = self.res.borrow_mut().release(h).ok().flatten();
            if let Some(res) = freed {
                queue.extend(res.child_handles());
                if let Resource::Device(dev) = &res {
                    if let crate::device::DeviceKind::Bridge { sink } = dev.kind {
                        if let Some(s) = self.sinks.borrow_mut().remove(&sink) {
                            dead_sinks.push(s);
                        }
                    }
                }
            }
        }
        // Sink boxes can run arbitrary Drop code; all borrows are back.
        drop(dead_sinks);
    }

    /// Runs `f` with the payload behind `handle`. The arena stays borrowed
    /// for the duration, so `f` must not call back into the engine.
    pub(crate) fn with<R>(
        &self,
        handle: RawHandle,
        f: impl FnOnce(&Resource) -> Result<R>,
    ) -> Result<R> {
        let res = self.res.borrow();
        f(res.get(handle)?)
    }

    pub(crate) fn with_mut<R>(
        &self,
        handle: RawHandle,
        f: impl FnOnce(&mut Resource) -> Result<R>,
    ) -> Result<R> {
        let mut res = self.res.borrow_mut();
        f(res.get_mut(handle)?)
    }

    pub(crate) fn register_sink(&self, sink: Box<dyn Device>) -> u32 {
        let id = self.next_sink.get();
        self.next_sink.set(id + 1);
        self.sinks
            .borrow_mut()
            .insert(id, Rc::new(RefCell::new(sink)));
        id
    }

    /// Clones the sink reference out of the table so the table borrow is
    /// released before any sink method runs.
    pub(crate) fn sink(&self, id: u32) -> Result<SinkRef> {
        self.sinks
            .borrow()
            .get(&id)
            .cloned()
            .ok_or(Error::StaleHandle("device sink"))
    }

    /// Registers an active content walk and returns the guard that
    /// unregisters it, error or not.
    pub(crate) fn begin_walk(self: &Rc<Self>) -> WalkGuard {
        let id = self.next_walk.get();
        self.next_walk.set(id + 1);
        self.walks.borrow_mut().insert(id);
        WalkGuard {
            engine: Rc::clone(self),
            id,
        }
    }

    /// Number of walks currently registered. Zero between calls.
    pub fn active_walks(&self) -> usize {
        self.walks.borrow().len()
    }

    pub fn set_font_loader(&self, loader: FontLoaderFn) {
        *self.font_loader.borrow_mut() = Some(loader);
    }

    pub fn clear_font_loader(&self) {
        *self.font_loader.borrow_mut() = None;
    }

    /// Asks the host hook for a substitute face. The closure is moved out
    /// for the call so it may itself use the engine.
    pub(crate) fn request_font(&self, req: &FontRequest) -> Option<Vec<u8>> {
        let mut loader = self.font_loader.borrow_mut().take()?;
        let data = loader(req);
        // A hook installed by the callback itself wins over the old one.
        let mut slot = self.font_loader.borrow_mut();
        if slot.is_none() {
            *slot = Some(loader);
        }
        data
    }
}

pub(crate) struct WalkGuard {
    engine: Rc<Engine>,
    id: u32,
}

impl Drop for WalkGuard {
    fn drop(&mut self) {
        self.engine.walks.borrow_mut().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_crosses_threads() {
        let flag = CancelFlag::new();
        let other = flag.clone();
        std::thread::spawn(move || other.cancel()).join().unwrap();
        assert!(flag.is_cancelled());
        assert!(matches!(flag.check(), Err(Error::Aborted)));
    }

    #[test]
    fn test_walk_guard_unregisters_on_drop() {
        let engine = Engine::new();
        assert_eq!(engine.active_walks(), 0);
        {
            let _g1 = engine.begin_walk();
            let _g2 = engine.begin_walk();
            assert_eq!(engine.active_walks(), 2);
        }
        assert_eq!(engine.active_walks(), 0);
    }

    #[test]
    fn test_font_loader_called_and_restored() {
        let engine = Engine::new();
        engine.set_font_loader(Box::new(|req| {
            if req.name == "Helvetica" {
                Some(vec![1, 2, 3])
            } else {
                None
            }
        }));
        let req = FontRequest {
            name: "Helvetica".into(),
            script: None,
            bold: false,
            italic: false,
        };
        assert_eq!(engine.request_font(&req), Some(vec![1, 2, 3]));
        // Still installed after the call.
        assert_eq!(engine.request_font(&req), Some(vec![1, 2, 3]));
        let req = FontRequest {
            name: "NoSuchFace".into(),
            ..req
        };
        assert_eq!(engine.request_font(&req), None);
    }
}
