//! Content resources: paths, text runs, images, colorspaces, stroke state,
//! fonts and shadings, plus the walker interfaces that replay path and text
//! primitives to a visitor.
//!
//! Walkers follow the device convention: every method has a default no-op
//! body, so a visitor only overrides what it cares about and the replay
//! skips the rest. Stored order is replay order.

use std::rc::Rc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smol_str::SmolStr;

use crate::engine::Engine;
use crate::engine::arena::RawHandle;
use crate::engine::data::Resource;
use crate::error::{Error, Result};
use crate::geometry::{Matrix, Point, Rect};
use crate::handle::{Binding, handle_wrapper};
use crate::object::NodeId;

/// One stored path primitive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PathCmd {
    MoveTo(Point),
    LineTo(Point),
    CurveTo(Point, Point, Point),
    Close,
}

pub struct PathData {
    /// Shared so a walk can iterate a cheap clone without holding the
    /// arena borrow across visitor calls.
    pub(crate) cmds: Rc<Vec<PathCmd>>,
    pub(crate) current: Point,
    pub(crate) start: Point,
}

impl PathData {
    pub(crate) fn new() -> PathData {
        PathData {
            cmds: Rc::new(Vec::new()),
            current: Point::ORIGIN,
            start: Point::ORIGIN,
        }
    }

    fn push(&mut self, cmd: PathCmd) {
        Rc::make_mut(&mut self.cmds).push(cmd);
    }

    pub(crate) fn bounds(&self) -> Rect {
        let mut r = Rect::new(
            f64::INFINITY,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NEG_INFINITY,
        );
        let mut seen = false;
        for cmd in self.cmds.iter() {
            match *cmd {
                PathCmd::MoveTo(p) | PathCmd::LineTo(p) => {
                    r = r.include(p);
                    seen = true;
                }
                PathCmd::CurveTo(c1, c2, end) => {
                    // Control points bound the curve, good enough here.
                    r = r.include(c1).include(c2).include(end);
                    seen = true;
                }
                PathCmd::Close => {}
            }
        }
        if seen { r } else { Rect::EMPTY }
    }

    pub(crate) fn transform(&mut self, m: Matrix) {
        let cmds = Rc::make_mut(&mut self.cmds);
        for cmd in cmds.iter_mut() {
            *cmd = match *cmd {
                PathCmd::MoveTo(p) => PathCmd::MoveTo(p.transform(m)),
                PathCmd::LineTo(p) => PathCmd::LineTo(p.transform(m)),
                PathCmd::CurveTo(a, b, c) => {
                    PathCmd::CurveTo(a.transform(m), b.transform(m), c.transform(m))
                }
                PathCmd::Close => PathCmd::Close,
            };
        }
        self.current = self.current.transform(m);
        self.start = self.start.transform(m);
    }
}

/// Visitor over stored path primitives. Override only what you need; the
/// default bodies skip the call.
pub trait PathWalker {
    fn move_to(&mut self, _p: Point) -> Result<()> {
        Ok(())
    }

    fn line_to(&mut self, _p: Point) -> Result<()> {
        Ok(())
    }

    fn curve_to(&mut self, _c1: Point, _c2: Point, _end: Point) -> Result<()> {
        Ok(())
    }

    fn close_path(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A geometric path under construction or captured from content.
pub struct Path {
    pub(crate) bind: Binding,
}

handle_wrapper!(Path, "path");

fn with_path<R>(
    engine: &Engine,
    h: RawHandle,
    f: impl FnOnce(&PathData) -> R,
) -> Result<R> {
    engine.with(h, |res| match res {
        Resource::Path(p) => Ok(f(p)),
        other => Err(Error::Type {
            expected: "path",
            got: other.kind_name(),
        }),
    })
}

fn with_path_mut<R>(
    engine: &Engine,
    h: RawHandle,
    f: impl FnOnce(&mut PathData) -> R,
) -> Result<R> {
    engine.with_mut(h, |res| match res {
        Resource::Path(p) => Ok(f(p)),
        other => Err(Error::Type {
            expected: "path",
            got: other.kind_name(),
        }),
    })
}

impl Path {
    pub fn new(engine: &Rc<Engine>) -> Path {
        let h = engine.insert(Resource::Path(PathData::new()));
        Path {
            bind: Binding::adopt(Rc::clone(engine), h, Path::KIND),
        }
    }

    pub fn move_to(&self, p: Point) -> Result<()> {
        with_path_mut(self.engine(), self.raw()?, |d| {
            d.push(PathCmd::MoveTo(p));
            d.current = p;
            d.start = p;
        })
    }

    pub fn line_to(&self, p: Point) -> Result<()> {
        with_path_mut(self.engine(), self.raw()?, |d| {
            d.push(PathCmd::LineTo(p));
            d.current = p;
        })
    }

    pub fn curve_to(&self, c1: Point, c2: Point, end: Point) -> Result<()> {
        with_path_mut(self.engine(), self.raw()?, |d| {
            d.push(PathCmd::CurveTo(c1, c2, end));
            d.current = end;
        })
    }

    pub fn close(&self) -> Result<()> {
        with_path_mut(self.engine(), self.raw()?, |d| {
            d.push(PathCmd::Close);
            d.current = d.start;
        })
    }

    /// Appends a whole rectangle as a closed subpath.
    pub fn rect(&self, r: Rect) -> Result<()> {
        self.move_to(Point::new(r.x0, r.y0))?;
        self.line_to(Point::new(r.x1, r.y0))?;
        self.line_to(Point::new(r.x1, r.y1))?;
        self.line_to(Point::new(r.x0, r.y1))?;
        self.close()
    }

    pub fn current_point(&self) -> Result<Point> {
        with_path(self.engine(), self.raw()?, |d| d.current)
    }

    /// Axis-aligned bounds of the path under `ctm`.
    pub fn bounds(&self, ctm: Matrix) -> Result<Rect> {
        with_path(self.engine(), self.raw()?, |d| d.bounds().transform(ctm))
    }

    /// Transforms every stored point in place.
    pub fn transform(&self, m: Matrix) -> Result<()> {
        with_path_mut(self.engine(), self.raw()?, |d| d.transform(m))
    }

    /// Replays the stored primitives, in stored order, into `walker`.
    ///
    /// A visitor error aborts the walk; the active-walk registration is
    /// removed either way.
    pub fn walk(&self, walker: &mut dyn PathWalker) -> Result<()> {
        let cmds = with_path(self.engine(), self.raw()?, |d| Rc::clone(&d.cmds))?;
        let _guard = self.engine().begin_walk();
        for cmd in cmds.iter() {
            match *cmd {
                PathCmd::MoveTo(p) => walker.move_to(p)?,
                PathCmd::LineTo(p) => walker.line_to(p)?,
                PathCmd::CurveTo(c1, c2, end) => walker.curve_to(c1, c2, end)?,
                PathCmd::Close => walker.close_path()?,
            }
        }
        Ok(())
    }

    pub(crate) fn adopt(engine: &Rc<Engine>, data: PathData) -> Path {
        let h = engine.insert(Resource::Path(data));
        Path {
            bind: Binding::adopt(Rc::clone(engine), h, Path::KIND),
        }
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<Path> {
        Ok(Path {
            bind: Binding::from_borrowed(Rc::clone(engine), h, Path::KIND)?,
        })
    }

    pub(crate) fn snapshot(&self) -> Result<PathData> {
        with_path(self.engine(), self.raw()?, |d| PathData {
            cmds: Rc::clone(&d.cmds),
            current: d.current,
            start: d.start,
        })
    }
}

/// One positioned glyph inside a span.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextGlyph {
    pub glyph_id: u32,
    pub unicode: u32,
    /// Pen position in text space, folded into the span matrix on replay.
    pub x: f64,
    pub y: f64,
    /// Advance in unscaled glyph units.
    pub advance: f64,
}

#[derive(Clone)]
pub struct TextSpan {
    pub(crate) font: RawHandle,
    pub(crate) trm: Matrix,
    pub(crate) wmode: u8,
    pub(crate) bidi_level: u8,
    pub(crate) glyphs: Vec<TextGlyph>,
}

pub struct TextData {
    pub(crate) spans: Rc<Vec<TextSpan>>,
}

impl TextData {
    pub(crate) fn new() -> TextData {
        TextData {
            spans: Rc::new(Vec::new()),
        }
    }
}

/// Visitor over stored text spans and glyphs. Fonts handed to the visitor
/// are valid for the duration of the call; `keep` one to hold it longer.
pub trait TextWalker {
    fn begin_span(
        &mut self,
        _font: &Font,
        _trm: Matrix,
        _wmode: u8,
        _bidi_level: u8,
    ) -> Result<()> {
        Ok(())
    }

    fn show_glyph(
        &mut self,
        _font: &Font,
        _trm: Matrix,
        _glyph: TextGlyph,
    ) -> Result<()> {
        Ok(())
    }

    fn end_span(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A text object: a list of spans, each a run of glyphs in one font.
pub struct Text {
    pub(crate) bind: Binding,
}

handle_wrapper!(Text, "text");

fn with_text<R>(
    engine: &Engine,
    h: RawHandle,
    f: impl FnOnce(&TextData) -> R,
) -> Result<R> {
    engine.with(h, |res| match res {
        Resource::Text(t) => Ok(f(t)),
        other => Err(Error::Type {
            expected: "text",
            got: other.kind_name(),
        }),
    })
}

impl Text {
    pub fn new(engine: &Rc<Engine>) -> Text {
        let h = engine.insert(Resource::Text(TextData::new()));
        Text {
            bind: Binding::adopt(Rc::clone(engine), h, Text::KIND),
        }
    }

    /// Starts a new span in `font`. The text object takes its own reference
    /// on the font.
    pub fn begin_span(
        &self,
        font: &Font,
        trm: Matrix,
        wmode: u8,
        bidi_level: u8,
    ) -> Result<()> {
        let fh = font.raw()?;
        self.engine().retain(fh)?;
        self.engine().with_mut(self.raw()?, |res| match res {
            Resource::Text(t) => {
                Rc::make_mut(&mut t.spans).push(TextSpan {
                    font: fh,
                    trm,
                    wmode,
                    bidi_level,
                    glyphs: Vec::new(),
                });
                Ok(())
            }
            other => Err(Error::Type {
                expected: "text",
                got: other.kind_name(),
            }),
        })
    }

    /// Appends a glyph to the current span.
    pub fn show_glyph(&self, glyph: TextGlyph) -> Result<()> {
        self.engine().with_mut(self.raw()?, |res| match res {
            Resource::Text(t) => {
                let spans = Rc::make_mut(&mut t.spans);
                let span = spans
                    .last_mut()
                    .ok_or_else(|| Error::Argument("show_glyph before begin_span".into()))?;
                span.glyphs.push(glyph);
                Ok(())
            }
            other => Err(Error::Type {
                expected: "text",
                got: other.kind_name(),
            }),
        })
    }

    pub fn bounds(&self, ctm: Matrix) -> Result<Rect> {
        let engine = self.engine();
        let h = self.raw()?;
        engine.with(h, |res| match res {
            Resource::Text(t) => {
                let mut r = Rect::new(
                    f64::INFINITY,
                    f64::INFINITY,
                    f64::NEG_INFINITY,
                    f64::NEG_INFINITY,
                );
                let mut seen = false;
                for span in t.spans.iter() {
                    for g in &span.glyphs {
                        let p = Point::new(g.x, g.y).transform(span.trm).transform(ctm);
                        r = r.include(p);
                        seen = true;
                    }
                }
                Ok(if seen { r } else { Rect::EMPTY })
            }
            other => Err(Error::Type {
                expected: "text",
                got: other.kind_name(),
            }),
        })
    }

    /// Replays spans and glyphs in stored order. The font wrapper passed to
    /// the visitor is destroyed when the span ends.
    pub fn walk(&self, walker: &mut dyn TextWalker) -> Result<()> {
        let spans = with_text(self.engine(), self.raw()?, |t| Rc::clone(&t.spans))?;
        let _guard = self.engine().begin_walk();
        for span in spans.iter() {
            let font = Font::from_borrowed(self.engine(), span.font)?;
            let run = (|| -> Result<()> {
                walker.begin_span(&font, span.trm, span.wmode, span.bidi_level)?;
                for g in &span.glyphs {
                    let trm = span.trm.pre_translate(g.x, g.y);
                    walker.show_glyph(&font, trm, *g)?;
                }
                walker.end_span()
            })();
            // Borrowed-for-the-call rule: the span font dies here whether or
            // not the visitor failed.
            font.destroy();
            run?;
        }
        Ok(())
    }

    pub(crate) fn adopt(engine: &Rc<Engine>, data: TextData) -> Text {
        let h = engine.insert(Resource::Text(data));
        Text {
            bind: Binding::adopt(Rc::clone(engine), h, Text::KIND),
        }
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<Text> {
        Ok(Text {
            bind: Binding::from_borrowed(Rc::clone(engine), h, Text::KIND)?,
        })
    }
}

pub struct ColorSpaceData {
    pub(crate) name: SmolStr,
    pub(crate) n: usize,
}

impl ColorSpaceData {
    pub(crate) fn device_gray() -> ColorSpaceData {
        ColorSpaceData {
            name: SmolStr::new_static("DeviceGray"),
            n: 1,
        }
    }

    pub(crate) fn device_rgb() -> ColorSpaceData {
        ColorSpaceData {
            name: SmolStr::new_static("DeviceRGB"),
            n: 3,
        }
    }

    pub(crate) fn device_cmyk() -> ColorSpaceData {
        ColorSpaceData {
            name: SmolStr::new_static("DeviceCMYK"),
            n: 4,
        }
    }
}

/// A color space: a name and a component count.
pub struct ColorSpace {
    pub(crate) bind: Binding,
}

handle_wrapper!(ColorSpace, "colorspace");

impl ColorSpace {
    pub fn device_gray(engine: &Rc<Engine>) -> ColorSpace {
        ColorSpace::adopt(engine, ColorSpaceData::device_gray())
    }

    pub fn device_rgb(engine: &Rc<Engine>) -> ColorSpace {
        ColorSpace::adopt(engine, ColorSpaceData::device_rgb())
    }

    pub fn device_cmyk(engine: &Rc<Engine>) -> ColorSpace {
        ColorSpace::adopt(engine, ColorSpaceData::device_cmyk())
    }

    pub fn name(&self) -> Result<SmolStr> {
        self.with(|cs| cs.name.clone())
    }

    /// Number of components a color in this space carries.
    pub fn n(&self) -> Result<usize> {
        self.with(|cs| cs.n)
    }

    fn with<R>(&self, f: impl FnOnce(&ColorSpaceData) -> R) -> Result<R> {
        self.engine().with(self.raw()?, |res| match res {
            Resource::ColorSpace(cs) => Ok(f(cs)),
            other => Err(Error::Type {
                expected: "colorspace",
                got: other.kind_name(),
            }),
        })
    }

    pub(crate) fn adopt(engine: &Rc<Engine>, data: ColorSpaceData) -> ColorSpace {
        let h = engine.insert(Resource::ColorSpace(data));
        ColorSpace {
            bind: Binding::adopt(Rc::clone(engine), h, ColorSpace::KIND),
        }
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<ColorSpace> {
        Ok(ColorSpace {
            bind: Binding::from_borrowed(Rc::clone(engine), h, ColorSpace::KIND)?,
        })
    }
}

/// Stroking parameters for stroke and clip-stroke operations.
#[derive(Debug, Clone, PartialEq)]
pub struct StrokeData {
    pub line_cap: u8,
    pub line_join: u8,
    pub line_width: f64,
    pub miter_limit: f64,
    pub dash_phase: f64,
    pub dashes: SmallVec<[f64; 8]>,
}

impl Default for StrokeData {
    fn default() -> Self {
        StrokeData {
            line_cap: 0,
            line_join: 0,
            line_width: 1.0,
            miter_limit: 10.0,
            dash_phase: 0.0,
            dashes: SmallVec::new(),
        }
    }
}

pub struct StrokeState {
    pub(crate) bind: Binding,
}

handle_wrapper!(StrokeState, "stroke state");

impl StrokeState {
    pub fn new(engine: &Rc<Engine>, data: StrokeData) -> StrokeState {
        let h = engine.insert(Resource::StrokeState(data));
        StrokeState {
            bind: Binding::adopt(Rc::clone(engine), h, StrokeState::KIND),
        }
    }

    pub fn data(&self) -> Result<StrokeData> {
        self.engine().with(self.raw()?, |res| match res {
            Resource::StrokeState(s) => Ok(s.clone()),
            other => Err(Error::Type {
                expected: "stroke state",
                got: other.kind_name(),
            }),
        })
    }

    pub fn line_width(&self) -> Result<f64> {
        Ok(self.data()?.line_width)
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<StrokeState> {
        Ok(StrokeState {
            bind: Binding::from_borrowed(Rc::clone(engine), h, StrokeState::KIND)?,
        })
    }
}

pub struct FontData {
    pub(crate) name: SmolStr,
    pub(crate) data: Option<Bytes>,
    pub(crate) bold: bool,
    pub(crate) italic: bool,
    /// Width per character code in 1000-unit glyph space (simple fonts).
    pub(crate) widths: FxHashMap<u32, f64>,
    pub(crate) default_width: f64,
}

impl FontData {
    pub(crate) fn named(name: &str) -> FontData {
        let lower = name.to_ascii_lowercase();
        FontData {
            name: SmolStr::new(name),
            data: None,
            bold: lower.contains("bold"),
            italic: lower.contains("italic") || lower.contains("oblique"),
            widths: FxHashMap::default(),
            default_width: 500.0,
        }
    }

    /// Advance for a character code, in text-space units per em.
    pub(crate) fn advance(&self, code: u32) -> f64 {
        self.widths.get(&code).copied().unwrap_or(self.default_width) / 1000.0
    }
}

/// A font resource, embedded or substituted through the engine's font hook.
pub struct Font {
    pub(crate) bind: Binding,
}

handle_wrapper!(Font, "font");

impl Font {
    pub fn new_from_data(engine: &Rc<Engine>, name: &str, data: Vec<u8>) -> Font {
        let mut fd = FontData::named(name);
        fd.data = Some(Bytes::from(data));
        Font::adopt(engine, fd)
    }

    pub fn name(&self) -> Result<SmolStr> {
        self.with(|f| f.name.clone())
    }

    pub fn is_bold(&self) -> Result<bool> {
        self.with(|f| f.bold)
    }

    pub fn is_italic(&self) -> Result<bool> {
        self.with(|f| f.italic)
    }

    pub fn is_embedded(&self) -> Result<bool> {
        self.with(|f| f.data.is_some())
    }

    /// Advance width for a character code, in ems.
    pub fn advance(&self, code: u32) -> Result<f64> {
        self.with(|f| f.advance(code))
    }

    fn with<R>(&self, f: impl FnOnce(&FontData) -> R) -> Result<R> {
        self.engine().with(self.raw()?, |res| match res {
            Resource::Font(fd) => Ok(f(fd)),
            other => Err(Error::Type {
                expected: "font",
                got: other.kind_name(),
            }),
        })
    }

    pub(crate) fn adopt(engine: &Rc<Engine>, data: FontData) -> Font {
        let h = engine.insert(Resource::Font(data));
        Font {
            bind: Binding::adopt(Rc::clone(engine), h, Font::KIND),
        }
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<Font> {
        Ok(Font {
            bind: Binding::from_borrowed(Rc::clone(engine), h, Font::KIND)?,
        })
    }
}

pub struct ImageData {
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Components per pixel of the decoded samples.
    pub(crate) n: u32,
    pub(crate) bpc: u32,
    pub(crate) colorspace: Option<RawHandle>,
    pub(crate) samples: Bytes,
    pub(crate) is_mask: bool,
    pub(crate) interpolate: bool,
}

/// A raster image resource with decoded samples.
pub struct Image {
    pub(crate) bind: Binding,
}

handle_wrapper!(Image, "image");

impl Image {
    pub fn width(&self) -> Result<u32> {
        self.with(|im| im.width)
    }

    pub fn height(&self) -> Result<u32> {
        self.with(|im| im.height)
    }

    pub fn n(&self) -> Result<u32> {
        self.with(|im| im.n)
    }

    pub fn is_mask(&self) -> Result<bool> {
        self.with(|im| im.is_mask)
    }

    pub fn samples(&self) -> Result<Bytes> {
        self.with(|im| im.samples.clone())
    }

    /// The image's colorspace, as a fresh owned wrapper.
    pub fn colorspace(&self) -> Result<Option<ColorSpace>> {
        let cs = self.with(|im| im.colorspace)?;
        match cs {
            Some(h) => Ok(Some(ColorSpace::from_borrowed(self.engine(), h)?)),
            None => Ok(None),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&ImageData) -> R) -> Result<R> {
        self.engine().with(self.raw()?, |res| match res {
            Resource::Image(im) => Ok(f(im)),
            other => Err(Error::Type {
                expected: "image",
                got: other.kind_name(),
            }),
        })
    }

    pub(crate) fn adopt(engine: &Rc<Engine>, data: ImageData) -> Image {
        let h = engine.insert(Resource::Image(data));
        Image {
            bind: Binding::adopt(Rc::clone(engine), h, Image::KIND),
        }
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<Image> {
        Ok(Image {
            bind: Binding::from_borrowed(Rc::clone(engine), h, Image::KIND)?,
        })
    }
}

pub struct ShadeData {
    pub(crate) doc: RawHandle,
    pub(crate) node: NodeId,
    pub(crate) kind: u8,
    pub(crate) bounds: Rect,
}

/// A shading resource. Geometry only; evaluation is a device concern.
pub struct Shade {
    pub(crate) bind: Binding,
}

handle_wrapper!(Shade, "shade");

impl Shade {
    pub fn bounds(&self, ctm: Matrix) -> Result<Rect> {
        self.with(|sh| sh.bounds.transform(ctm))
    }

    /// Shading type number from the defining dictionary.
    pub fn shading_kind(&self) -> Result<u8> {
        self.with(|sh| sh.kind)
    }

    pub(crate) fn node(&self) -> Result<NodeId> {
        self.with(|sh| sh.node)
    }

    fn with<R>(&self, f: impl FnOnce(&ShadeData) -> R) -> Result<R> {
        self.engine().with(self.raw()?, |res| match res {
            Resource::Shade(sh) => Ok(f(sh)),
            other => Err(Error::Type {
                expected: "shade",
                got: other.kind_name(),
            }),
        })
    }

    pub(crate) fn adopt(engine: &Rc<Engine>, data: ShadeData) -> Shade {
        let h = engine.insert(Resource::Shade(data));
        Shade {
            bind: Binding::adopt(Rc::clone(engine), h, Shade::KIND),
        }
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<Shade> {
        Ok(Shade {
            bind: Binding::from_borrowed(Rc::clone(engine), h, Shade::KIND)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct SegmentLog {
        ops: Vec<String>,
    }

    impl PathWalker for SegmentLog {
        fn move_to(&mut self, p: Point) -> Result<()> {
            self.ops.push(format!("m {} {}", p.x, p.y));
            Ok(())
        }

        fn line_to(&mut self, p: Point) -> Result<()> {
            self.ops.push(format!("l {} {}", p.x, p.y));
            Ok(())
        }

        fn close_path(&mut self) -> Result<()> {
            self.ops.push("h".into());
            Ok(())
        }
    }

    /// Only overrides close_path; everything else takes the default no-op.
    #[derive(Default)]
    struct CloseCounter {
        closes: usize,
    }

    impl PathWalker for CloseCounter {
        fn close_path(&mut self) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
    }

    struct FailingWalker;

    impl PathWalker for FailingWalker {
        fn line_to(&mut self, _p: Point) -> Result<()> {
            Err(Error::Argument("stop".into()))
        }
    }

    #[test]
    fn test_walk_replays_in_stored_order() {
        let engine = Engine::new();
        let path = Path::new(&engine);
        path.move_to(Point::new(0.0, 0.0)).unwrap();
        path.line_to(Point::new(10.0, 0.0)).unwrap();
        path.line_to(Point::new(10.0, 10.0)).unwrap();
        path.close().unwrap();

        let mut log = SegmentLog::default();
        path.walk(&mut log).unwrap();
        assert_eq!(log.ops, vec!["m 0 0", "l 10 0", "l 10 10", "h"]);
    }

    #[test]
    fn test_unimplemented_visitor_methods_are_skipped() {
        let engine = Engine::new();
        let path = Path::new(&engine);
        path.rect(Rect::new(0.0, 0.0, 5.0, 5.0)).unwrap();
        let mut counter = CloseCounter::default();
        path.walk(&mut counter).unwrap();
        assert_eq!(counter.closes, 1);
    }

    #[test]
    fn test_walk_error_still_clears_registration() {
        let engine = Engine::new();
        let path = Path::new(&engine);
        path.move_to(Point::new(0.0, 0.0)).unwrap();
        path.line_to(Point::new(1.0, 1.0)).unwrap();
        assert!(path.walk(&mut FailingWalker).is_err());
        assert_eq!(engine.active_walks(), 0);
    }

    #[test]
    fn test_path_bounds_and_transform() {
        let engine = Engine::new();
        let path = Path::new(&engine);
        path.rect(Rect::new(1.0, 1.0, 4.0, 3.0)).unwrap();
        assert_eq!(
            path.bounds(Matrix::IDENTITY).unwrap(),
            Rect::new(1.0, 1.0, 4.0, 3.0)
        );
        path.transform(Matrix::scale(2.0, 2.0)).unwrap();
        assert_eq!(
            path.bounds(Matrix::IDENTITY).unwrap(),
            Rect::new(2.0, 2.0, 8.0, 6.0)
        );
    }

    #[test]
    fn test_text_walk_hands_out_live_fonts() {
        struct Collect {
            names: Vec<String>,
            glyphs: usize,
            kept: Option<Font>,
        }

        impl TextWalker for Collect {
            fn begin_span(
                &mut self,
                font: &Font,
                _trm: Matrix,
                _wmode: u8,
                _bidi: u8,
            ) -> Result<()> {
                self.names.push(font.name()?.to_string());
                if self.kept.is_none() {
                    self.kept = Some(font.keep()?);
                }
                Ok(())
            }

            fn show_glyph(&mut self, _font: &Font, _trm: Matrix, _g: TextGlyph) -> Result<()> {
                self.glyphs += 1;
                Ok(())
            }
        }

        let engine = Engine::new();
        let font = Font::new_from_data(&engine, "Helvetica", vec![0u8; 4]);
        let text = Text::new(&engine);
        text.begin_span(&font, Matrix::IDENTITY, 0, 0).unwrap();
        text.show_glyph(TextGlyph {
            glyph_id: 43,
            unicode: 'H' as u32,
            x: 0.0,
            y: 0.0,
            advance: 0.722,
        })
        .unwrap();
        text.show_glyph(TextGlyph {
            glyph_id: 76,
            unicode: 'i' as u32,
            x: 0.722,
            y: 0.0,
            advance: 0.278,
        })
        .unwrap();

        let mut c = Collect {
            names: Vec::new(),
            glyphs: 0,
            kept: None,
        };
        text.walk(&mut c).unwrap();
        assert_eq!(c.names, vec!["Helvetica"]);
        assert_eq!(c.glyphs, 2);
        // The kept font outlives the walk.
        let kept = c.kept.take().unwrap();
        assert_eq!(kept.name().unwrap(), "Helvetica");
        assert_eq!(engine.active_walks(), 0);
    }

    #[test]
    fn test_colorspace_components() {
        let engine = Engine::new();
        assert_eq!(ColorSpace::device_gray(&engine).n().unwrap(), 1);
        assert_eq!(ColorSpace::device_rgb(&engine).n().unwrap(), 3);
        assert_eq!(ColorSpace::device_cmyk(&engine).n().unwrap(), 4);
        assert_eq!(
            ColorSpace::device_rgb(&engine).name().unwrap(),
            "DeviceRGB"
        );
    }

    #[test]
    fn test_font_advance_defaults() {
        let engine = Engine::new();
        let font = Font::new_from_data(&engine, "Courier-Bold", Vec::new());
        assert!(font.is_bold().unwrap());
        assert!(!font.is_italic().unwrap());
        // No widths table: everything falls back to the default width.
        assert!((font.advance('A' as u32).unwrap() - 0.5).abs() < 1e-9);
    }
}
