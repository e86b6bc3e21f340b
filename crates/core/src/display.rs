//! Display lists: recorded device operations for repeated playback.

use std::rc::Rc;

use crate::device::{DevOp, NativeDevice};
use crate::engine::Engine;
use crate::engine::arena::RawHandle;
use crate::engine::data::Resource;
use crate::error::{Error, Result};
use crate::geometry::Rect;
use crate::handle::{Binding, handle_wrapper};

pub struct DisplayListData {
    pub(crate) mediabox: Rect,
    pub(crate) ops: Vec<DevOp>,
}

impl DisplayListData {
    /// References held by recorded operations. The list owns one reference
    /// per mention, mirroring what the recorder retained.
    pub(crate) fn captured_handles(&self) -> Vec<RawHandle> {
        self.ops.iter().flat_map(|op| op.handles()).collect()
    }
}

/// A recorded operation stream with the bounds it was recorded for.
/// Resources named by the ops stay alive as long as the list does.
pub struct DisplayList {
    pub(crate) bind: Binding,
}

handle_wrapper!(DisplayList, "display list");

impl DisplayList {
    pub fn new(engine: &Rc<Engine>, mediabox: Rect) -> DisplayList {
        let h = engine.insert(Resource::DisplayList(DisplayListData {
            mediabox,
            ops: Vec::new(),
        }));
        DisplayList {
            bind: Binding::adopt(Rc::clone(engine), h, DisplayList::KIND),
        }
    }

    pub fn bounds(&self) -> Result<Rect> {
        self.engine().with(self.raw()?, |res| match res {
            Resource::DisplayList(dl) => Ok(dl.mediabox),
            other => Err(Error::Type {
                expected: "display list",
                got: other.kind_name(),
            }),
        })
    }

    /// Number of recorded operations.
    pub fn op_count(&self) -> Result<usize> {
        self.engine().with(self.raw()?, |res| match res {
            Resource::DisplayList(dl) => Ok(dl.ops.len()),
            other => Err(Error::Type {
                expected: "display list",
                got: other.kind_name(),
            }),
        })
    }

    /// Replays every recorded operation into `device`.
    ///
    /// When the device answers `begin_tile` with a cached id, the cell
    /// content is skipped and only the matching `end_tile` is delivered.
    /// The first error from the device aborts the replay.
    pub fn run(&self, device: &NativeDevice) -> Result<()> {
        // Ops are cloned out so the device may re-enter the engine while
        // the replay is in flight.
        let ops: Vec<DevOp> = self.engine().with(self.raw()?, |res| match res {
            Resource::DisplayList(dl) => Ok(dl.ops.clone()),
            other => Err(Error::Type {
                expected: "display list",
                got: other.kind_name(),
            }),
        })?;
        let mut i = 0;
        while i < ops.len() {
            let op = ops[i].clone();
            let is_tile = matches!(op, DevOp::BeginTile { .. });
            let ret = device.run_op(op)?;
            i += 1;
            if is_tile && ret != 0 {
                // Cached: drop the cell content, deliver the balancing
                // end_tile.
                let mut depth = 1;
                while i < ops.len() {
                    match &ops[i] {
                        DevOp::BeginTile { .. } => depth += 1,
                        DevOp::EndTile => {
                            depth -= 1;
                            if depth == 0 {
                                device.run_op(DevOp::EndTile)?;
                                i += 1;
                                break;
                            }
                        }
                        _ => {}
                    }
                    i += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ColorSpace, Path};
    use crate::device::Device;
    use crate::geometry::{Color, Matrix};
    use crate::pixmap::Pixmap;

    #[derive(Default)]
    struct Names {
        seen: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
        cached_tile: i32,
    }

    impl Device for Names {
        fn fill_path(
            &mut self,
            _p: &Path,
            _eo: bool,
            _m: Matrix,
            _cs: &ColorSpace,
            _c: &Color,
            _a: f64,
        ) -> Result<()> {
            self.seen.borrow_mut().push("fill_path");
            Ok(())
        }

        fn begin_tile(
            &mut self,
            _area: Rect,
            _view: Rect,
            _xs: f64,
            _ys: f64,
            _m: Matrix,
            _id: i32,
        ) -> Result<i32> {
            self.seen.borrow_mut().push("begin_tile");
            Ok(self.cached_tile)
        }

        fn end_tile(&mut self) -> Result<()> {
            self.seen.borrow_mut().push("end_tile");
            Ok(())
        }
    }

    fn record_tile_list(engine: &Rc<Engine>) -> DisplayList {
        let list = DisplayList::new(engine, Rect::new(0.0, 0.0, 100.0, 100.0));
        let rec = NativeDevice::new_recorder(engine, &list).unwrap();
        let cs = ColorSpace::device_gray(engine);
        let path = Path::new(engine);
        path.rect(Rect::new(0.0, 0.0, 10.0, 10.0)).unwrap();
        let area = Rect::new(0.0, 0.0, 10.0, 10.0);
        rec.begin_tile(area, area, 10.0, 10.0, Matrix::IDENTITY, 0)
            .unwrap();
        rec.fill_path(&path, false, Matrix::IDENTITY, &cs, &Color::Gray(0.0), 1.0)
            .unwrap();
        rec.end_tile().unwrap();
        rec.close_device().unwrap();
        rec.destroy();
        list
    }

    #[test]
    fn test_replay_preserves_order() {
        let engine = Engine::new();
        let list = record_tile_list(&engine);
        assert_eq!(list.op_count().unwrap(), 3);
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = NativeDevice::from_sink(
            &engine,
            Box::new(Names {
                seen: std::rc::Rc::clone(&seen),
                cached_tile: 0,
            }),
        );
        list.run(&sink).unwrap();
        assert_eq!(*seen.borrow(), vec!["begin_tile", "fill_path", "end_tile"]);
    }

    #[test]
    fn test_cached_tile_skips_cell_content() {
        let engine = Engine::new();
        let list = record_tile_list(&engine);
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = NativeDevice::from_sink(
            &engine,
            Box::new(Names {
                seen: std::rc::Rc::clone(&seen),
                cached_tile: 9,
            }),
        );
        list.run(&sink).unwrap();
        // Content suppressed, end_tile still balances.
        assert_eq!(*seen.borrow(), vec!["begin_tile", "end_tile"]);
    }

    #[test]
    fn test_list_keeps_resources_alive() {
        let engine = Engine::new();
        let list = DisplayList::new(&engine, Rect::new(0.0, 0.0, 50.0, 50.0));
        let rec = NativeDevice::new_recorder(&engine, &list).unwrap();
        let cs = ColorSpace::device_rgb(&engine);
        let path = Path::new(&engine);
        path.rect(Rect::new(5.0, 5.0, 25.0, 25.0)).unwrap();
        rec.fill_path(
            &path,
            false,
            Matrix::IDENTITY,
            &cs,
            &Color::Rgb(0.0, 0.0, 1.0),
            1.0,
        )
        .unwrap();
        rec.destroy();
        // Dropping the wrappers must not kill the recorded resources.
        path.destroy();
        cs.destroy();
        let px = Pixmap::new_with_bbox(
            &engine,
            &ColorSpace::device_rgb(&engine),
            Rect::new(0.0, 0.0, 50.0, 50.0),
            false,
        )
        .unwrap();
        px.clear().unwrap();
        let draw = NativeDevice::new_draw(&engine, &px).unwrap();
        list.run(&draw).unwrap();
        assert_eq!(px.pixel(10, 10).unwrap(), vec![0, 0, 255]);
        // Releasing the list releases the captured resources too.
        let before = engine.live_resources();
        list.destroy();
        assert!(engine.live_resources() < before);
    }

    #[test]
    fn test_bounds_and_empty_replay() {
        let engine = Engine::new();
        let list = DisplayList::new(&engine, Rect::new(0.0, 0.0, 612.0, 792.0));
        assert_eq!(list.bounds().unwrap(), Rect::new(0.0, 0.0, 612.0, 792.0));
        assert_eq!(list.op_count().unwrap(), 0);
        let sink = NativeDevice::from_sink(&engine, Box::new(Names::default()));
        list.run(&sink).unwrap();
    }
}
