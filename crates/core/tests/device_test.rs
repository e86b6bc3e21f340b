//! Host-side device sinks: a page replay crosses the bridge as typed
//! operations, operands are loans the host can escalate with `keep`, and a
//! sink error stops the replay.

use std::cell::RefCell;
use std::rc::Rc;

use vellum_core::{
    Color, ColorSpace, Device, Document, Engine, Matrix, NativeDevice, Page, Path, Rect,
};

fn one_page(engine: &Rc<Engine>, content: &[u8]) -> (Document, Page) {
    let doc = Document::create(engine).unwrap();
    let p = doc
        .add_page(Rect::new(0.0, 0.0, 100.0, 100.0), 0, None, content)
        .unwrap();
    doc.insert_page(0, &p).unwrap();
    p.destroy();
    let page = doc.load_page(0).unwrap();
    (doc, page)
}

fn fmt_rect(r: Rect) -> String {
    format!("[{} {} {} {}]", r.x0, r.y0, r.x1, r.y1)
}

// === Operation order and operand values ===

struct LogSink {
    log: Rc<RefCell<Vec<String>>>,
}

impl Device for LogSink {
    fn fill_path(
        &mut self,
        path: &Path,
        even_odd: bool,
        ctm: Matrix,
        cs: &ColorSpace,
        color: &Color,
        alpha: f64,
    ) -> vellum_core::Result<()> {
        let bounds = path.bounds(ctm).unwrap();
        self.log.borrow_mut().push(format!(
            "fill{} {} n={} {:?} a={}",
            if even_odd { " eo" } else { "" },
            fmt_rect(bounds),
            cs.n().unwrap(),
            color,
            alpha,
        ));
        Ok(())
    }

    fn clip_path(
        &mut self,
        path: &Path,
        _even_odd: bool,
        ctm: Matrix,
        _scissor: Rect,
    ) -> vellum_core::Result<()> {
        let bounds = path.bounds(ctm).unwrap();
        self.log.borrow_mut().push(format!("clip {}", fmt_rect(bounds)));
        Ok(())
    }

    fn pop_clip(&mut self) -> vellum_core::Result<()> {
        self.log.borrow_mut().push("pop".into());
        Ok(())
    }
}

#[test]
fn test_replay_crosses_bridge_in_content_order() {
    let engine = Engine::new();
    let (doc, page) = one_page(&engine, b"q 0 0 50 50 re W n 1 0 0 rg 10 10 5 5 re f Q");

    let log = Rc::new(RefCell::new(Vec::new()));
    let dev = NativeDevice::from_sink(&engine, Box::new(LogSink { log: Rc::clone(&log) }));
    page.run(&dev, Matrix::IDENTITY).unwrap();
    dev.close_device().unwrap();
    dev.destroy();

    // The page transform flips y, so content y=10..15 lands at device
    // y=85..90 on a 100 unit page.
    assert_eq!(
        *log.borrow(),
        vec![
            "clip [0 50 50 100]".to_string(),
            "fill [10 85 15 90] n=3 Rgb(1.0, 0.0, 0.0) a=1".to_string(),
            "pop".to_string(),
        ]
    );

    page.destroy();
    doc.destroy();
    assert_eq!(engine.live_resources(), 0);
}

// === Escalating a loaned operand ===

struct KeepSink {
    kept: Rc<RefCell<Option<Path>>>,
}

impl Device for KeepSink {
    fn fill_path(
        &mut self,
        path: &Path,
        _even_odd: bool,
        _ctm: Matrix,
        _cs: &ColorSpace,
        _color: &Color,
        _alpha: f64,
    ) -> vellum_core::Result<()> {
        *self.kept.borrow_mut() = Some(path.keep()?);
        Ok(())
    }
}

#[test]
fn test_kept_path_outlives_the_replay() {
    let engine = Engine::new();
    let (doc, page) = one_page(&engine, b"1 0 0 rg 10 10 5 5 re f");

    let kept = Rc::new(RefCell::new(None));
    let dev = NativeDevice::from_sink(&engine, Box::new(KeepSink { kept: Rc::clone(&kept) }));
    page.run(&dev, Matrix::IDENTITY).unwrap();
    dev.close_device().unwrap();
    dev.destroy();
    page.destroy();
    doc.destroy();

    // The loan the bridge handed out was destroyed when the callback
    // returned; the kept alias still resolves.
    let path = kept.borrow_mut().take().unwrap();
    assert_eq!(path.bounds(Matrix::IDENTITY).unwrap(), Rect::new(10.0, 10.0, 15.0, 15.0));
    path.destroy();
    assert_eq!(engine.live_resources(), 0);
}

// === Sink errors abort the replay ===

struct FailSink {
    log: Rc<RefCell<Vec<String>>>,
}

impl Device for FailSink {
    fn clip_path(
        &mut self,
        _path: &Path,
        _even_odd: bool,
        _ctm: Matrix,
        _scissor: Rect,
    ) -> vellum_core::Result<()> {
        self.log.borrow_mut().push("clip".into());
        Ok(())
    }

    fn fill_path(
        &mut self,
        _path: &Path,
        _even_odd: bool,
        _ctm: Matrix,
        _cs: &ColorSpace,
        _color: &Color,
        _alpha: f64,
    ) -> vellum_core::Result<()> {
        Err(vellum_core::Error::Argument("host gave up".into()))
    }

    fn pop_clip(&mut self) -> vellum_core::Result<()> {
        self.log.borrow_mut().push("pop".into());
        Ok(())
    }
}

#[test]
fn test_sink_error_stops_the_replay() {
    let engine = Engine::new();
    let (_doc, page) = one_page(&engine, b"q 0 0 50 50 re W n 1 0 0 rg 10 10 5 5 re f Q");

    let log = Rc::new(RefCell::new(Vec::new()));
    let dev = NativeDevice::from_sink(&engine, Box::new(FailSink { log: Rc::clone(&log) }));
    let err = page.run(&dev, Matrix::IDENTITY).unwrap_err();
    assert_eq!(err.name(), "bad-argument");
    // The clip arrived, the failing fill did, and nothing after it.
    assert_eq!(*log.borrow(), vec!["clip".to_string()]);
}

// === Tile caching handshake ===

struct TileSink {
    seen_ids: Rc<RefCell<Vec<i32>>>,
}

impl Device for TileSink {
    fn begin_tile(
        &mut self,
        _area: Rect,
        _view: Rect,
        _xstep: f64,
        _ystep: f64,
        _ctm: Matrix,
        id: i32,
    ) -> vellum_core::Result<i32> {
        self.seen_ids.borrow_mut().push(id);
        Ok(7)
    }
}

#[test]
fn test_begin_tile_returns_the_sink_id() {
    let engine = Engine::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let dev = NativeDevice::from_sink(&engine, Box::new(TileSink { seen_ids: Rc::clone(&seen) }));

    let area = Rect::new(0.0, 0.0, 32.0, 32.0);
    let cached = dev
        .begin_tile(area, area, 16.0, 16.0, Matrix::IDENTITY, 0)
        .unwrap();
    assert_eq!(cached, 7);
    dev.end_tile().unwrap();

    // Passing the id back in reaches the sink unchanged.
    let again = dev
        .begin_tile(area, area, 16.0, 16.0, Matrix::IDENTITY, cached)
        .unwrap();
    assert_eq!(again, 7);
    dev.end_tile().unwrap();
    assert_eq!(*seen.borrow(), vec![0, 7]);

    dev.close_device().unwrap();
    dev.destroy();
    assert_eq!(engine.live_resources(), 0);
}
