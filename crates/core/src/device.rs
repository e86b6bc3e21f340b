//! Devices: the sink interface content is replayed into, and the built-in
//! device kinds.
//!
//! A device is a flat stream of drawing operations. Implementors override
//! only the operations they care about; defaults are no-ops, except
//! `begin_tile` which defaults to "no caching". Operations arrive in content
//! order. Nesting of groups, masks, tiles and layers is forwarded exactly as
//! produced and never validated here.
//!
//! Three kinds back the `NativeDevice` wrapper: a painting device targeting
//! a pixmap (deterministic dimensions and op ordering; not a rasterizer), a
//! recorder filling a display list, and a bridge forwarding every op to a
//! registered host sink through per-operation trampolines. Resource wrappers
//! handed to a sink are valid only for the call; the sink keeps what it
//! wants to hold.

use std::rc::Rc;

use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use tracing::debug;

use crate::content::{ColorSpace, Image, Path, Shade, StrokeState, Text};
use crate::engine::Engine;
use crate::engine::arena::RawHandle;
use crate::engine::data::Resource;
use crate::engine::scratch::SlotSet;
use crate::error::{Error, Result};
use crate::geometry::{Color, Matrix, Rect};
use crate::handle::{Binding, handle_wrapper};
use crate::pixmap::with_pixmap_mut;

/// Compositing mode for transparency groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
    ColorDodge,
    ColorBurn,
    HardLight,
    SoftLight,
    Difference,
    Exclusion,
    Hue,
    Saturation,
    Color,
    Luminosity,
}

impl BlendMode {
    /// Maps a /BM name; unknown names paint as Normal.
    pub fn from_name(name: &str) -> BlendMode {
        match name {
            "Multiply" => BlendMode::Multiply,
            "Screen" => BlendMode::Screen,
            "Overlay" => BlendMode::Overlay,
            "Darken" => BlendMode::Darken,
            "Lighten" => BlendMode::Lighten,
            "ColorDodge" => BlendMode::ColorDodge,
            "ColorBurn" => BlendMode::ColorBurn,
            "HardLight" => BlendMode::HardLight,
            "SoftLight" => BlendMode::SoftLight,
            "Difference" => BlendMode::Difference,
            "Exclusion" => BlendMode::Exclusion,
            "Hue" => BlendMode::Hue,
            "Saturation" => BlendMode::Saturation,
            "Color" => BlendMode::Color,
            "Luminosity" => BlendMode::Luminosity,
            _ => BlendMode::Normal,
        }
    }
}

/// The operation sink. Every method has a default body so an implementation
/// overrides only what it consumes; a returned error aborts the replay that
/// delivered the operation.
pub trait Device {
    fn fill_path(
        &mut self,
        _path: &Path,
        _even_odd: bool,
        _ctm: Matrix,
        _cs: &ColorSpace,
        _color: &Color,
        _alpha: f64,
    ) -> Result<()> {
        Ok(())
    }

    fn stroke_path(
        &mut self,
        _path: &Path,
        _stroke: &StrokeState,
        _ctm: Matrix,
        _cs: &ColorSpace,
        _color: &Color,
        _alpha: f64,
    ) -> Result<()> {
        Ok(())
    }

    fn clip_path(
        &mut self,
        _path: &Path,
        _even_odd: bool,
        _ctm: Matrix,
        _scissor: Rect,
    ) -> Result<()> {
        Ok(())
    }

    fn clip_stroke_path(
        &mut self,
        _path: &Path,
        _stroke: &StrokeState,
        _ctm: Matrix,
        _scissor: Rect,
    ) -> Result<()> {
        Ok(())
    }

    fn fill_text(
        &mut self,
        _text: &Text,
        _ctm: Matrix,
        _cs: &ColorSpace,
        _color: &Color,
        _alpha: f64,
    ) -> Result<()> {
        Ok(())
    }

    fn stroke_text(
        &mut self,
        _text: &Text,
        _stroke: &StrokeState,
        _ctm: Matrix,
        _cs: &ColorSpace,
        _color: &Color,
        _alpha: f64,
    ) -> Result<()> {
        Ok(())
    }

    fn clip_text(&mut self, _text: &Text, _ctm: Matrix, _scissor: Rect) -> Result<()> {
        Ok(())
    }

    fn clip_stroke_text(
        &mut self,
        _text: &Text,
        _stroke: &StrokeState,
        _ctm: Matrix,
        _scissor: Rect,
    ) -> Result<()> {
        Ok(())
    }

    /// Text with render mode 3: positioned but never painted.
    fn ignore_text(&mut self, _text: &Text, _ctm: Matrix) -> Result<()> {
        Ok(())
    }

    fn fill_shade(&mut self, _shade: &Shade, _ctm: Matrix, _alpha: f64) -> Result<()> {
        Ok(())
    }

    fn fill_image(&mut self, _image: &Image, _ctm: Matrix, _alpha: f64) -> Result<()> {
        Ok(())
    }

    fn fill_image_mask(
        &mut self,
        _image: &Image,
        _ctm: Matrix,
        _cs: &ColorSpace,
        _color: &Color,
        _alpha: f64,
    ) -> Result<()> {
        Ok(())
    }

    fn clip_image_mask(&mut self, _image: &Image, _ctm: Matrix, _scissor: Rect) -> Result<()> {
        Ok(())
    }

    fn pop_clip(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_mask(
        &mut self,
        _area: Rect,
        _luminosity: bool,
        _cs: &ColorSpace,
        _color: &Color,
    ) -> Result<()> {
        Ok(())
    }

    fn end_mask(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_group(
        &mut self,
        _area: Rect,
        _cs: &ColorSpace,
        _isolated: bool,
        _knockout: bool,
        _blend: BlendMode,
        _alpha: f64,
    ) -> Result<()> {
        Ok(())
    }

    fn end_group(&mut self) -> Result<()> {
        Ok(())
    }

    /// Starts a tile cell. `id` is the caller's hint from a previous
    /// recording, zero when unknown. Returning nonzero declares the tile
    /// already cached under that id, telling the caller to skip the cell
    /// content up to the matching `end_tile`. Returning zero asks for the
    /// content.
    fn begin_tile(
        &mut self,
        _area: Rect,
        _view: Rect,
        _xstep: f64,
        _ystep: f64,
        _ctm: Matrix,
        _id: i32,
    ) -> Result<i32> {
        Ok(0)
    }

    fn end_tile(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin_layer(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn end_layer(&mut self) -> Result<()> {
        Ok(())
    }

    /// Flush; delivered once, after the last drawing operation.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One recorded device operation with owned operands. Resource fields are
/// raw handles; whoever stores ops long-term owns a reference on each (the
/// display list does, transient dispatch does not).
#[derive(Clone)]
pub(crate) enum DevOp {
    FillPath {
        path: RawHandle,
        even_odd: bool,
        ctm: Matrix,
        cs: RawHandle,
        color: Color,
        alpha: f64,
    },
    StrokePath {
        path: RawHandle,
        stroke: RawHandle,
        ctm: Matrix,
        cs: RawHandle,
        color: Color,
        alpha: f64,
    },
    ClipPath {
        path: RawHandle,
        even_odd: bool,
        ctm: Matrix,
        scissor: Rect,
    },
    ClipStrokePath {
        path: RawHandle,
        stroke: RawHandle,
        ctm: Matrix,
        scissor: Rect,
    },
    FillText {
        text: RawHandle,
        ctm: Matrix,
        cs: RawHandle,
        color: Color,
        alpha: f64,
    },
    StrokeText {
        text: RawHandle,
        stroke: RawHandle,
        ctm: Matrix,
        cs: RawHandle,
        color: Color,
        alpha: f64,
    },
    ClipText {
        text: RawHandle,
        ctm: Matrix,
        scissor: Rect,
    },
    ClipStrokeText {
        text: RawHandle,
        stroke: RawHandle,
        ctm: Matrix,
        scissor: Rect,
    },
    IgnoreText {
        text: RawHandle,
        ctm: Matrix,
    },
    FillShade {
        shade: RawHandle,
        ctm: Matrix,
        alpha: f64,
    },
    FillImage {
        image: RawHandle,
        ctm: Matrix,
        alpha: f64,
    },
    FillImageMask {
        image: RawHandle,
        ctm: Matrix,
        cs: RawHandle,
        color: Color,
        alpha: f64,
    },
    ClipImageMask {
        image: RawHandle,
        ctm: Matrix,
        scissor: Rect,
    },
    PopClip,
    BeginMask {
        area: Rect,
        luminosity: bool,
        cs: RawHandle,
        color: Color,
    },
    EndMask,
    BeginGroup {
        area: Rect,
        cs: RawHandle,
        isolated: bool,
        knockout: bool,
        blend: BlendMode,
        alpha: f64,
    },
    EndGroup,
    BeginTile {
        area: Rect,
        view: Rect,
        xstep: f64,
        ystep: f64,
        ctm: Matrix,
        id: i32,
    },
    EndTile,
    BeginLayer {
        name: SmolStr,
    },
    EndLayer,
    Close,
}

impl DevOp {
    /// Resource handles referenced by this op.
    pub(crate) fn handles(&self) -> Vec<RawHandle> {
        match self {
            DevOp::FillPath { path, cs, .. } => vec![*path, *cs],
            DevOp::StrokePath {
                path, stroke, cs, ..
            } => vec![*path, *stroke, *cs],
            DevOp::ClipPath { path, .. } => vec![*path],
            DevOp::ClipStrokePath { path, stroke, .. } => vec![*path, *stroke],
            DevOp::FillText { text, cs, .. } => vec![*text, *cs],
            DevOp::StrokeText {
                text, stroke, cs, ..
            } => vec![*text, *stroke, *cs],
            DevOp::ClipText { text, .. } => vec![*text],
            DevOp::ClipStrokeText { text, stroke, .. } => vec![*text, *stroke],
            DevOp::IgnoreText { text, .. } => vec![*text],
            DevOp::FillShade { shade, .. } => vec![*shade],
            DevOp::FillImage { image, .. } => vec![*image],
            DevOp::FillImageMask { image, cs, .. } => vec![*image, *cs],
            DevOp::ClipImageMask { image, .. } => vec![*image],
            DevOp::BeginMask { cs, .. } => vec![*cs],
            DevOp::BeginGroup { cs, .. } => vec![*cs],
            DevOp::PopClip
            | DevOp::EndMask
            | DevOp::EndGroup
            | DevOp::BeginTile { .. }
            | DevOp::EndTile
            | DevOp::BeginLayer { .. }
            | DevOp::EndLayer
            | DevOp::Close => Vec::new(),
        }
    }
}

/// Cache key for tile cells, rounded so float jitter does not defeat reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TileKey {
    area: [i64; 4],
    view: [i64; 4],
    step: [i64; 2],
    ctm: [i64; 6],
}

fn q(v: f64) -> i64 {
    (v * 1e6).round() as i64
}

impl TileKey {
    fn new(area: Rect, view: Rect, xstep: f64, ystep: f64, ctm: Matrix) -> TileKey {
        TileKey {
            area: [q(area.x0), q(area.y0), q(area.x1), q(area.y1)],
            view: [q(view.x0), q(view.y0), q(view.x1), q(view.y1)],
            step: [q(xstep), q(ystep)],
            ctm: [q(ctm.a), q(ctm.b), q(ctm.c), q(ctm.d), q(ctm.e), q(ctm.f)],
        }
    }
}

/// State of the built-in painting device.
pub struct DrawDevice {
    pub(crate) pixmap: RawHandle,
    /// Intersected scissor stack; top applies to every paint.
    clip_stack: Vec<Rect>,
    /// Nonzero while generating a soft mask, which is not visible output.
    mask_depth: u32,
    tile_cache: FxHashMap<TileKey, i32>,
    next_tile_id: i32,
}

pub(crate) enum DeviceKind {
    Draw(DrawDevice),
    Recorder { list: RawHandle },
    Bridge { sink: u32 },
}

pub struct DeviceData {
    pub(crate) kind: DeviceKind,
}

/// A device handle. Drives one of the built-in device kinds, or a host sink
/// registered for bridging.
pub struct NativeDevice {
    pub(crate) bind: Binding,
}

handle_wrapper!(NativeDevice, "device");

impl NativeDevice {
    /// Painting device over a pixmap. The device takes its own reference on
    /// the pixmap.
    pub fn new_draw(engine: &Rc<Engine>, pixmap: &crate::pixmap::Pixmap) -> Result<NativeDevice> {
        let pxh = pixmap.raw()?;
        engine.retain(pxh)?;
        let bounds = pixmap.bounds()?;
        let data = DeviceData {
            kind: DeviceKind::Draw(DrawDevice {
                pixmap: pxh,
                clip_stack: vec![bounds],
                mask_depth: 0,
                tile_cache: FxHashMap::default(),
                next_tile_id: 1,
            }),
        };
        let h = engine.insert(Resource::Device(data));
        Ok(NativeDevice {
            bind: Binding::adopt(Rc::clone(engine), h, NativeDevice::KIND),
        })
    }

    /// Recording device appending to a display list.
    pub fn new_recorder(
        engine: &Rc<Engine>,
        list: &crate::display::DisplayList,
    ) -> Result<NativeDevice> {
        let lh = list.raw()?;
        engine.retain(lh)?;
        let data = DeviceData {
            kind: DeviceKind::Recorder { list: lh },
        };
        let h = engine.insert(Resource::Device(data));
        Ok(NativeDevice {
            bind: Binding::adopt(Rc::clone(engine), h, NativeDevice::KIND),
        })
    }

    /// Bridges every operation out to a host sink. The sink entry lives in
    /// the engine's table until this device is destroyed.
    pub fn from_sink(engine: &Rc<Engine>, sink: Box<dyn Device>) -> NativeDevice {
        let sink_id = engine.register_sink(sink);
        let data = DeviceData {
            kind: DeviceKind::Bridge { sink: sink_id },
        };
        let h = engine.insert(Resource::Device(data));
        NativeDevice {
            bind: Binding::adopt(Rc::clone(engine), h, NativeDevice::KIND),
        }
    }

    pub fn fill_path(
        &self,
        path: &Path,
        even_odd: bool,
        ctm: Matrix,
        cs: &ColorSpace,
        color: &Color,
        alpha: f64,
    ) -> Result<()> {
        // Value operands cross through the scratch pad like every boundary
        // call; decode happens before any sink can overwrite the slots.
        let (ctm, color) = marshal_ctm_color(self.engine(), ctm, color)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::FillPath {
                path: path.raw()?,
                even_odd,
                ctm,
                cs: cs.raw()?,
                color,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn stroke_path(
        &self,
        path: &Path,
        stroke: &StrokeState,
        ctm: Matrix,
        cs: &ColorSpace,
        color: &Color,
        alpha: f64,
    ) -> Result<()> {
        let (ctm, color) = marshal_ctm_color(self.engine(), ctm, color)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::StrokePath {
                path: path.raw()?,
                stroke: stroke.raw()?,
                ctm,
                cs: cs.raw()?,
                color,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn clip_path(
        &self,
        path: &Path,
        even_odd: bool,
        ctm: Matrix,
        scissor: Rect,
    ) -> Result<()> {
        let (ctm, scissor) = marshal_ctm_rect(self.engine(), ctm, scissor)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::ClipPath {
                path: path.raw()?,
                even_odd,
                ctm,
                scissor,
            },
        )
        .map(|_| ())
    }

    pub fn clip_stroke_path(
        &self,
        path: &Path,
        stroke: &StrokeState,
        ctm: Matrix,
        scissor: Rect,
    ) -> Result<()> {
        let (ctm, scissor) = marshal_ctm_rect(self.engine(), ctm, scissor)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::ClipStrokePath {
                path: path.raw()?,
                stroke: stroke.raw()?,
                ctm,
                scissor,
            },
        )
        .map(|_| ())
    }

    pub fn fill_text(
        &self,
        text: &Text,
        ctm: Matrix,
        cs: &ColorSpace,
        color: &Color,
        alpha: f64,
    ) -> Result<()> {
        let (ctm, color) = marshal_ctm_color(self.engine(), ctm, color)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::FillText {
                text: text.raw()?,
                ctm,
                cs: cs.raw()?,
                color,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn stroke_text(
        &self,
        text: &Text,
        stroke: &StrokeState,
        ctm: Matrix,
        cs: &ColorSpace,
        color: &Color,
        alpha: f64,
    ) -> Result<()> {
        let (ctm, color) = marshal_ctm_color(self.engine(), ctm, color)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::StrokeText {
                text: text.raw()?,
                stroke: stroke.raw()?,
                ctm,
                cs: cs.raw()?,
                color,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn clip_text(&self, text: &Text, ctm: Matrix, scissor: Rect) -> Result<()> {
        let (ctm, scissor) = marshal_ctm_rect(self.engine(), ctm, scissor)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::ClipText {
                text: text.raw()?,
                ctm,
                scissor,
            },
        )
        .map(|_| ())
    }

    pub fn clip_stroke_text(
        &self,
        text: &Text,
        stroke: &StrokeState,
        ctm: Matrix,
        scissor: Rect,
    ) -> Result<()> {
        let (ctm, scissor) = marshal_ctm_rect(self.engine(), ctm, scissor)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::ClipStrokeText {
                text: text.raw()?,
                stroke: stroke.raw()?,
                ctm,
                scissor,
            },
        )
        .map(|_| ())
    }

    pub fn ignore_text(&self, text: &Text, ctm: Matrix) -> Result<()> {
        let ctm = marshal_ctm(self.engine(), ctm)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::IgnoreText {
                text: text.raw()?,
                ctm,
            },
        )
        .map(|_| ())
    }

    pub fn fill_shade(&self, shade: &Shade, ctm: Matrix, alpha: f64) -> Result<()> {
        let ctm = marshal_ctm(self.engine(), ctm)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::FillShade {
                shade: shade.raw()?,
                ctm,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn fill_image(&self, image: &Image, ctm: Matrix, alpha: f64) -> Result<()> {
        let ctm = marshal_ctm(self.engine(), ctm)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::FillImage {
                image: image.raw()?,
                ctm,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn fill_image_mask(
        &self,
        image: &Image,
        ctm: Matrix,
        cs: &ColorSpace,
        color: &Color,
        alpha: f64,
    ) -> Result<()> {
        let (ctm, color) = marshal_ctm_color(self.engine(), ctm, color)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::FillImageMask {
                image: image.raw()?,
                ctm,
                cs: cs.raw()?,
                color,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn clip_image_mask(&self, image: &Image, ctm: Matrix, scissor: Rect) -> Result<()> {
        let (ctm, scissor) = marshal_ctm_rect(self.engine(), ctm, scissor)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::ClipImageMask {
                image: image.raw()?,
                ctm,
                scissor,
            },
        )
        .map(|_| ())
    }

    pub fn pop_clip(&self) -> Result<()> {
        dispatch(self.engine(), self.raw()?, DevOp::PopClip).map(|_| ())
    }

    pub fn begin_mask(
        &self,
        area: Rect,
        luminosity: bool,
        cs: &ColorSpace,
        color: &Color,
    ) -> Result<()> {
        let (area, color) = marshal_rect_color(self.engine(), area, color)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::BeginMask {
                area,
                luminosity,
                cs: cs.raw()?,
                color,
            },
        )
        .map(|_| ())
    }

    pub fn end_mask(&self) -> Result<()> {
        dispatch(self.engine(), self.raw()?, DevOp::EndMask).map(|_| ())
    }

    pub fn begin_group(
        &self,
        area: Rect,
        cs: &ColorSpace,
        isolated: bool,
        knockout: bool,
        blend: BlendMode,
        alpha: f64,
    ) -> Result<()> {
        let area = marshal_rect(self.engine(), area)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::BeginGroup {
                area,
                cs: cs.raw()?,
                isolated,
                knockout,
                blend,
                alpha,
            },
        )
        .map(|_| ())
    }

    pub fn end_group(&self) -> Result<()> {
        dispatch(self.engine(), self.raw()?, DevOp::EndGroup).map(|_| ())
    }

    /// See [`Device::begin_tile`] for the id contract.
    pub fn begin_tile(
        &self,
        area: Rect,
        view: Rect,
        xstep: f64,
        ystep: f64,
        ctm: Matrix,
        id: i32,
    ) -> Result<i32> {
        let scratch = &self.engine().scratch;
        let (area, view) = {
            let mut pad = scratch.borrow_mut();
            let a = pad.write_rect(area, SlotSet::First);
            let v = pad.write_rect(view, SlotSet::Second);
            (a, v)
        };
        let (area, view) = {
            let pad = scratch.borrow();
            (pad.read_rect(area)?, pad.read_rect(view)?)
        };
        let ctm = marshal_ctm(self.engine(), ctm)?;
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::BeginTile {
                area,
                view,
                xstep,
                ystep,
                ctm,
                id,
            },
        )
    }

    pub fn end_tile(&self) -> Result<()> {
        dispatch(self.engine(), self.raw()?, DevOp::EndTile).map(|_| ())
    }

    pub fn begin_layer(&self, name: &str) -> Result<()> {
        dispatch(
            self.engine(),
            self.raw()?,
            DevOp::BeginLayer {
                name: SmolStr::new(name),
            },
        )
        .map(|_| ())
    }

    pub fn end_layer(&self) -> Result<()> {
        dispatch(self.engine(), self.raw()?, DevOp::EndLayer).map(|_| ())
    }

    pub fn close_device(&self) -> Result<()> {
        debug!("closing device");
        dispatch(self.engine(), self.raw()?, DevOp::Close).map(|_| ())
    }

    pub(crate) fn run_op(&self, op: DevOp) -> Result<i32> {
        dispatch(self.engine(), self.raw()?, op)
    }
}

fn marshal_ctm(engine: &Engine, ctm: Matrix) -> Result<Matrix> {
    let slot = engine.scratch.borrow_mut().write_matrix(ctm, SlotSet::First);
    engine.scratch.borrow().read_matrix(slot)
}

fn marshal_rect(engine: &Engine, r: Rect) -> Result<Rect> {
    let slot = engine.scratch.borrow_mut().write_rect(r, SlotSet::First);
    engine.scratch.borrow().read_rect(slot)
}

fn marshal_ctm_color(engine: &Engine, ctm: Matrix, color: &Color) -> Result<(Matrix, Color)> {
    let (m_slot, c_slot) = {
        let mut pad = engine.scratch.borrow_mut();
        (pad.write_matrix(ctm, SlotSet::First), pad.write_color(color))
    };
    let pad = engine.scratch.borrow();
    Ok((pad.read_matrix(m_slot)?, pad.read_color(c_slot)?))
}

fn marshal_ctm_rect(engine: &Engine, ctm: Matrix, r: Rect) -> Result<(Matrix, Rect)> {
    let (m_slot, r_slot) = {
        let mut pad = engine.scratch.borrow_mut();
        (
            pad.write_matrix(ctm, SlotSet::First),
            pad.write_rect(r, SlotSet::First),
        )
    };
    let pad = engine.scratch.borrow();
    Ok((pad.read_matrix(m_slot)?, pad.read_rect(r_slot)?))
}

fn marshal_rect_color(engine: &Engine, r: Rect, color: &Color) -> Result<(Rect, Color)> {
    let (r_slot, c_slot) = {
        let mut pad = engine.scratch.borrow_mut();
        (pad.write_rect(r, SlotSet::First), pad.write_color(color))
    };
    let pad = engine.scratch.borrow();
    Ok((pad.read_rect(r_slot)?, pad.read_color(c_slot)?))
}

enum Target {
    Draw,
    Recorder { list: RawHandle },
    Bridge { sink: u32 },
}

/// Routes one operation into the device behind `dev`. Returns the tile id
/// for `BeginTile`, zero for everything else.
pub(crate) fn dispatch(engine: &Rc<Engine>, dev: RawHandle, op: DevOp) -> Result<i32> {
    let target = engine.with(dev, |res| match res {
        Resource::Device(d) => Ok(match &d.kind {
            DeviceKind::Draw(_) => Target::Draw,
            DeviceKind::Recorder { list } => Target::Recorder { list: *list },
            DeviceKind::Bridge { sink } => Target::Bridge { sink: *sink },
        }),
        other => Err(Error::Type {
            expected: "device",
            got: other.kind_name(),
        }),
    })?;
    match target {
        Target::Draw => draw_op(engine, dev, op),
        Target::Recorder { list } => record_op(engine, list, op),
        Target::Bridge { sink } => bridge_op(engine, sink, op),
    }
}

/// Appends the op to a display list, taking a reference on every resource
/// it names. Close ends the recording and is not part of the list.
fn record_op(engine: &Rc<Engine>, list: RawHandle, op: DevOp) -> Result<i32> {
    if matches!(op, DevOp::Close) {
        return Ok(0);
    }
    for h in op.handles() {
        engine.retain(h)?;
    }
    engine.with_mut(list, |res| match res {
        Resource::DisplayList(dl) => {
            dl.ops.push(op);
            Ok(0)
        }
        other => Err(Error::Type {
            expected: "display list",
            got: other.kind_name(),
        }),
    })
}

/// Forwards the op to a registered host sink. Resource operands are wrapped
/// as owned-for-the-call bindings and destroyed when the sink returns,
/// error or not; the sink escalates with `keep` if it wants one.
fn bridge_op(engine: &Rc<Engine>, sink_id: u32, op: DevOp) -> Result<i32> {
    let sink = engine.sink(sink_id)?;
    let mut sink = sink.borrow_mut();
    let sink = &mut **sink;
    match op {
        DevOp::FillPath {
            path,
            even_odd,
            ctm,
            cs,
            color,
            alpha,
        } => {
            let path = Path::from_borrowed(engine, path)?;
            let cs = ColorSpace::from_borrowed(engine, cs)?;
            let r = sink.fill_path(&path, even_odd, ctm, &cs, &color, alpha);
            path.destroy();
            cs.destroy();
            r.map(|_| 0)
        }
        DevOp::StrokePath {
            path,
            stroke,
            ctm,
            cs,
            color,
            alpha,
        } => {
            let path = Path::from_borrowed(engine, path)?;
            let stroke = StrokeState::from_borrowed(engine, stroke)?;
            let cs = ColorSpace::from_borrowed(engine, cs)?;
            let r = sink.stroke_path(&path, &stroke, ctm, &cs, &color, alpha);
            path.destroy();
            stroke.destroy();
            cs.destroy();
            r.map(|_| 0)
        }
        DevOp::ClipPath {
            path,
            even_odd,
            ctm,
            scissor,
        } => {
            let path = Path::from_borrowed(engine, path)?;
            let r = sink.clip_path(&path, even_odd, ctm, scissor);
            path.destroy();
            r.map(|_| 0)
        }
        DevOp::ClipStrokePath {
            path,
            stroke,
            ctm,
            scissor,
        } => {
            let path = Path::from_borrowed(engine, path)?;
            let stroke = StrokeState::from_borrowed(engine, stroke)?;
            let r = sink.clip_stroke_path(&path, &stroke, ctm, scissor);
            path.destroy();
            stroke.destroy();
            r.map(|_| 0)
        }
        DevOp::FillText {
            text,
            ctm,
            cs,
            color,
            alpha,
        } => {
            let text = Text::from_borrowed(engine, text)?;
            let cs = ColorSpace::from_borrowed(engine, cs)?;
            let r = sink.fill_text(&text, ctm, &cs, &color, alpha);
            text.destroy();
            cs.destroy();
            r.map(|_| 0)
        }
        DevOp::StrokeText {
            text,
            stroke,
            ctm,
            cs,
            color,
            alpha,
        } => {
            let text = Text::from_borrowed(engine, text)?;
            let stroke = StrokeState::from_borrowed(engine, stroke)?;
            let cs = ColorSpace::from_borrowed(engine, cs)?;
            let r = sink.stroke_text(&text, &stroke, ctm, &cs, &color, alpha);
            text.destroy();
            stroke.destroy();
            cs.destroy();
            r.map(|_| 0)
        }
        DevOp::ClipText { text, ctm, scissor } => {
            let text = Text::from_borrowed(engine, text)?;
            let r = sink.clip_text(&text, ctm, scissor);
            text.destroy();
            r.map(|_| 0)
        }
        DevOp::ClipStrokeText {
            text,
            stroke,
            ctm,
            scissor,
        } => {
            let text = Text::from_borrowed(engine, text)?;
            let stroke = StrokeState::from_borrowed(engine, stroke)?;
            let r = sink.clip_stroke_text(&text, &stroke, ctm, scissor);
            text.destroy();
            stroke.destroy();
            r.map(|_| 0)
        }
        DevOp::IgnoreText { text, ctm } => {
            let text = Text::from_borrowed(engine, text)?;
            let r = sink.ignore_text(&text, ctm);
            text.destroy();
            r.map(|_| 0)
        }
        DevOp::FillShade { shade, ctm, alpha } => {
            let shade = Shade::from_borrowed(engine, shade)?;
            let r = sink.fill_shade(&shade, ctm, alpha);
            shade.destroy();
            r.map(|_| 0)
        }
        DevOp::FillImage { image, ctm, alpha } => {
            let image = Image::from_borrowed(engine, image)?;
            let r = sink.fill_image(&image, ctm, alpha);
            image.destroy();
            r.map(|_| 0)
        }
        DevOp::FillImageMask {
            image,
            ctm,
            cs,
            color,
            alpha,
        } => {
            let image = Image::from_borrowed(engine, image)?;
            let cs = ColorSpace::from_borrowed(engine, cs)?;
            let r = sink.fill_image_mask(&image, ctm, &cs, &color, alpha);
            image.destroy();
            cs.destroy();
            r.map(|_| 0)
        }
        DevOp::ClipImageMask {
            image,
            ctm,
            scissor,
        } => {
            let image = Image::from_borrowed(engine, image)?;
            let r = sink.clip_image_mask(&image, ctm, scissor);
            image.destroy();
            r.map(|_| 0)
        }
        DevOp::PopClip => sink.pop_clip().map(|_| 0),
        DevOp::BeginMask {
            area,
            luminosity,
            cs,
            color,
        } => {
            let cs = ColorSpace::from_borrowed(engine, cs)?;
            let r = sink.begin_mask(area, luminosity, &cs, &color);
            cs.destroy();
            r.map(|_| 0)
        }
        DevOp::EndMask => sink.end_mask().map(|_| 0),
        DevOp::BeginGroup {
            area,
            cs,
            isolated,
            knockout,
            blend,
            alpha,
        } => {
            let cs = ColorSpace::from_borrowed(engine, cs)?;
            let r = sink.begin_group(area, &cs, isolated, knockout, blend, alpha);
            cs.destroy();
            r.map(|_| 0)
        }
        DevOp::EndGroup => sink.end_group().map(|_| 0),
        DevOp::BeginTile {
            area,
            view,
            xstep,
            ystep,
            ctm,
            id,
        } => sink.begin_tile(area, view, xstep, ystep, ctm, id),
        DevOp::EndTile => sink.end_tile().map(|_| 0),
        DevOp::BeginLayer { name } => sink.begin_layer(&name).map(|_| 0),
        DevOp::EndLayer => sink.end_layer().map(|_| 0),
        DevOp::Close => sink.close().map(|_| 0),
    }
}

/// Converts color components into the pixmap's color model, 0..255.
fn color_bytes(color: &Color, pix_components: u32) -> [u8; 4] {
    fn b(v: f64) -> u8 {
        (v.clamp(0.0, 1.0) * 255.0).round() as u8
    }
    let rgb = match *color {
        Color::Gray(g) => (g, g, g),
        Color::Rgb(r, g, bl) => (r, g, bl),
        Color::Cmyk(c, m, y, k) => (
            (1.0 - c) * (1.0 - k),
            (1.0 - m) * (1.0 - k),
            (1.0 - y) * (1.0 - k),
        ),
    };
    match pix_components {
        1 => {
            let luma = 0.3 * rgb.0 + 0.59 * rgb.1 + 0.11 * rgb.2;
            [b(luma), 0, 0, 0]
        }
        3 => [b(rgb.0), b(rgb.1), b(rgb.2), 0],
        4 => {
            // Naive CMYK without black generation.
            [b(1.0 - rgb.0), b(1.0 - rgb.1), b(1.0 - rgb.2), 0]
        }
        _ => [b(rgb.0), b(rgb.1), b(rgb.2), 0],
    }
}

/// What the draw device paints for one op: a solid block over the clipped
/// bounds. Dimensions and ordering are the contract; shading is not.
struct Paint {
    rect: Rect,
    color: Color,
    alpha: f64,
}

fn draw_op(engine: &Rc<Engine>, dev: RawHandle, op: DevOp) -> Result<i32> {
    // Stage 1: compute operand bounds without touching device state, one
    // borrow at a time.
    let paint: Option<Paint> = match &op {
        DevOp::FillPath {
            path, ctm, color, alpha, ..
        } => Some(Paint {
            rect: path_bounds(engine, *path, *ctm)?,
            color: color.clone(),
            alpha: *alpha,
        }),
        DevOp::StrokePath {
            path,
            stroke,
            ctm,
            color,
            alpha,
            ..
        } => {
            let mut r = path_bounds(engine, *path, *ctm)?;
            let w = stroke_width(engine, *stroke)? * ctm.expansion() * 0.5;
            r = Rect::new(r.x0 - w, r.y0 - w, r.x1 + w, r.y1 + w);
            Some(Paint {
                rect: r,
                color: color.clone(),
                alpha: *alpha,
            })
        }
        DevOp::FillText {
            text, ctm, color, alpha, ..
        }
        | DevOp::StrokeText {
            text, ctm, color, alpha, ..
        } => Some(Paint {
            rect: text_bounds(engine, *text, *ctm)?,
            color: color.clone(),
            alpha: *alpha,
        }),
        DevOp::FillShade { shade, ctm, alpha } => Some(Paint {
            rect: shade_bounds(engine, *shade, *ctm)?,
            color: Color::Gray(0.5),
            alpha: *alpha,
        }),
        DevOp::FillImage { ctm, alpha, .. } => Some(Paint {
            rect: unit_bounds(*ctm),
            color: Color::Gray(0.5),
            alpha: *alpha,
        }),
        DevOp::FillImageMask {
            ctm, color, alpha, ..
        } => Some(Paint {
            rect: unit_bounds(*ctm),
            color: color.clone(),
            alpha: *alpha,
        }),
        _ => None,
    };

    enum Decision {
        Skip,
        Tile(i32),
        Paint(RawHandle, Rect),
    }

    // Stage 2: update device state and decide what actually lands.
    let decision = engine.with_mut(dev, |res| {
        let d = match res {
            Resource::Device(DeviceData {
                kind: DeviceKind::Draw(d),
            }) => d,
            _ => {
                return Err(Error::Type {
                    expected: "draw device",
                    got: "device",
                });
            }
        };
        let top = *d.clip_stack.last().unwrap_or(&Rect::INFINITE);
        match &op {
            DevOp::ClipPath { scissor, .. }
            | DevOp::ClipStrokePath { scissor, .. }
            | DevOp::ClipText { scissor, .. }
            | DevOp::ClipStrokeText { scissor, .. }
            | DevOp::ClipImageMask { scissor, .. } => {
                d.clip_stack.push(intersect(top, *scissor));
                Ok(Decision::Skip)
            }
            DevOp::PopClip => {
                if d.clip_stack.len() > 1 {
                    d.clip_stack.pop();
                }
                Ok(Decision::Skip)
            }
            DevOp::BeginMask { .. } => {
                d.mask_depth += 1;
                Ok(Decision::Skip)
            }
            DevOp::EndMask => {
                d.mask_depth = d.mask_depth.saturating_sub(1);
                Ok(Decision::Skip)
            }
            DevOp::BeginTile {
                area,
                view,
                xstep,
                ystep,
                ctm,
                ..
            } => {
                let key = TileKey::new(*area, *view, *xstep, *ystep, *ctm);
                if let Some(id) = d.tile_cache.get(&key) {
                    return Ok(Decision::Tile(*id));
                }
                let id = d.next_tile_id;
                d.next_tile_id += 1;
                d.tile_cache.insert(key, id);
                Ok(Decision::Tile(0))
            }
            _ => {
                if d.mask_depth > 0 {
                    return Ok(Decision::Skip);
                }
                match &paint {
                    Some(p) => Ok(Decision::Paint(d.pixmap, intersect(top, p.rect))),
                    None => Ok(Decision::Skip),
                }
            }
        }
    })?;

    // Stage 3: touch the pixmap, the last independent borrow.
    match decision {
        Decision::Tile(id) => Ok(id),
        Decision::Paint(pixmap, rect) => {
            if let Some(p) = paint {
                fill_block(engine, pixmap, rect, &p.color, p.alpha)?;
            }
            Ok(0)
        }
        Decision::Skip => Ok(0),
    }
}

fn intersect(a: Rect, b: Rect) -> Rect {
    if a.is_infinite() {
        return b;
    }
    if b.is_infinite() {
        return a;
    }
    Rect::new(
        a.x0.max(b.x0),
        a.y0.max(b.y0),
        a.x1.min(b.x1),
        a.y1.min(b.y1),
    )
}

fn unit_bounds(ctm: Matrix) -> Rect {
    Rect::new(0.0, 0.0, 1.0, 1.0).transform(ctm)
}

fn path_bounds(engine: &Engine, path: RawHandle, ctm: Matrix) -> Result<Rect> {
    engine.with(path, |res| match res {
        Resource::Path(p) => Ok(p.bounds().transform(ctm)),
        other => Err(Error::Type {
            expected: "path",
            got: other.kind_name(),
        }),
    })
}

fn text_bounds(engine: &Engine, text: RawHandle, ctm: Matrix) -> Result<Rect> {
    engine.with(text, |res| match res {
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
                    let p = crate::geometry::Point::new(g.x, g.y)
                        .transform(span.trm)
                        .transform(ctm);
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

fn shade_bounds(engine: &Engine, shade: RawHandle, ctm: Matrix) -> Result<Rect> {
    engine.with(shade, |res| match res {
        Resource::Shade(sh) => Ok(sh.bounds.transform(ctm)),
        other => Err(Error::Type {
            expected: "shade",
            got: other.kind_name(),
        }),
    })
}

fn stroke_width(engine: &Engine, stroke: RawHandle) -> Result<f64> {
    engine.with(stroke, |res| match res {
        Resource::StrokeState(s) => Ok(s.line_width),
        other => Err(Error::Type {
            expected: "stroke state",
            got: other.kind_name(),
        }),
    })
}

/// Writes a solid block into the pixmap over `rect` (device space), scaled
/// by `alpha` against the existing samples.
fn fill_block(
    engine: &Engine,
    pixmap: RawHandle,
    rect: Rect,
    color: &Color,
    alpha: f64,
) -> Result<()> {
    with_pixmap_mut(engine, pixmap, |p| {
        if rect.is_empty() || !rect.is_valid() {
            return;
        }
        let x0 = ((rect.x0 - p.x as f64).floor().max(0.0)) as usize;
        let y0 = ((rect.y0 - p.y as f64).floor().max(0.0)) as usize;
        let x1 = ((rect.x1 - p.x as f64).ceil().min(p.width as f64)) as usize;
        let y1 = ((rect.y1 - p.y as f64).ceil().min(p.height as f64)) as usize;
        if x0 >= x1 || y0 >= y1 {
            return;
        }
        let value_n = p.n - p.alpha as u32;
        let src = color_bytes(color, value_n);
        let a = alpha.clamp(0.0, 1.0);
        for y in y0..y1 {
            let row = y * p.stride;
            for x in x0..x1 {
                let off = row + x * p.n as usize;
                for c in 0..value_n as usize {
                    let dst = p.samples[off + c] as f64;
                    p.samples[off + c] =
                        (dst * (1.0 - a) + src[c] as f64 * a).round() as u8;
                }
                if p.alpha {
                    let slot = off + value_n as usize;
                    let dst = p.samples[slot] as f64;
                    p.samples[slot] = (dst * (1.0 - a) + 255.0 * a).round() as u8;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixmap::Pixmap;

    /// Sink that logs operation names in arrival order.
    #[derive(Default)]
    struct OpLog {
        ops: std::rc::Rc<std::cell::RefCell<Vec<String>>>,
    }

    impl Device for OpLog {
        fn fill_path(
            &mut self,
            _path: &Path,
            _eo: bool,
            _ctm: Matrix,
            _cs: &ColorSpace,
            _color: &Color,
            _alpha: f64,
        ) -> Result<()> {
            self.ops.borrow_mut().push("fill_path".into());
            Ok(())
        }

        fn clip_path(
            &mut self,
            _path: &Path,
            _eo: bool,
            _ctm: Matrix,
            _scissor: Rect,
        ) -> Result<()> {
            self.ops.borrow_mut().push("clip_path".into());
            Ok(())
        }

        fn pop_clip(&mut self) -> Result<()> {
            self.ops.borrow_mut().push("pop_clip".into());
            Ok(())
        }

        fn begin_layer(&mut self, name: &str) -> Result<()> {
            self.ops.borrow_mut().push(format!("begin_layer {name}"));
            Ok(())
        }

        fn end_layer(&mut self) -> Result<()> {
            self.ops.borrow_mut().push("end_layer".into());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.ops.borrow_mut().push("close".into());
            Ok(())
        }
    }

    fn square_path(engine: &Rc<Engine>) -> Path {
        let p = Path::new(engine);
        p.rect(Rect::new(10.0, 10.0, 20.0, 20.0)).unwrap();
        p
    }

    #[test]
    fn test_bridge_forwards_in_content_order() {
        let engine = Engine::new();
        let ops = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let dev = NativeDevice::from_sink(
            &engine,
            Box::new(OpLog {
                ops: std::rc::Rc::clone(&ops),
            }),
        );
        let path = square_path(&engine);
        let cs = ColorSpace::device_rgb(&engine);
        dev.begin_layer("page").unwrap();
        dev.clip_path(&path, false, Matrix::IDENTITY, Rect::new(0.0, 0.0, 50.0, 50.0))
            .unwrap();
        dev.fill_path(
            &path,
            false,
            Matrix::IDENTITY,
            &cs,
            &Color::Rgb(1.0, 0.0, 0.0),
            1.0,
        )
        .unwrap();
        dev.pop_clip().unwrap();
        dev.end_layer().unwrap();
        dev.close_device().unwrap();
        assert_eq!(
            *ops.borrow(),
            vec![
                "begin_layer page",
                "clip_path",
                "fill_path",
                "pop_clip",
                "end_layer",
                "close"
            ]
        );
    }

    #[test]
    fn test_bridge_sink_error_aborts() {
        struct Failing;
        impl Device for Failing {
            fn fill_path(
                &mut self,
                _p: &Path,
                _eo: bool,
                _m: Matrix,
                _cs: &ColorSpace,
                _c: &Color,
                _a: f64,
            ) -> Result<()> {
                Err(Error::Argument("sink says no".into()))
            }
        }
        let engine = Engine::new();
        let dev = NativeDevice::from_sink(&engine, Box::new(Failing));
        let path = square_path(&engine);
        let cs = ColorSpace::device_gray(&engine);
        let err = dev
            .fill_path(&path, false, Matrix::IDENTITY, &cs, &Color::Gray(0.0), 1.0)
            .unwrap_err();
        assert_eq!(err.name(), "bad-argument");
    }

    #[test]
    fn test_borrowed_wrapper_dies_after_callback() {
        struct Stash {
            kept: std::rc::Rc<std::cell::RefCell<Option<Path>>>,
        }
        impl Device for Stash {
            fn fill_path(
                &mut self,
                path: &Path,
                _eo: bool,
                _m: Matrix,
                _cs: &ColorSpace,
                _c: &Color,
                _a: f64,
            ) -> Result<()> {
                // Usable during the call.
                assert!(path.bounds(Matrix::IDENTITY).is_ok());
                *self.kept.borrow_mut() = Some(path.keep()?);
                Ok(())
            }
        }
        let engine = Engine::new();
        let kept = std::rc::Rc::new(std::cell::RefCell::new(None));
        let dev = NativeDevice::from_sink(
            &engine,
            Box::new(Stash {
                kept: std::rc::Rc::clone(&kept),
            }),
        );
        let path = square_path(&engine);
        let cs = ColorSpace::device_gray(&engine);
        dev.fill_path(&path, false, Matrix::IDENTITY, &cs, &Color::Gray(0.0), 1.0)
            .unwrap();
        // The kept copy still works after the dispatch returned.
        let kept = kept.borrow_mut().take().unwrap();
        assert_eq!(
            kept.bounds(Matrix::IDENTITY).unwrap(),
            Rect::new(10.0, 10.0, 20.0, 20.0)
        );
    }

    #[test]
    fn test_draw_device_paints_clipped_block() {
        let engine = Engine::new();
        let cs = ColorSpace::device_rgb(&engine);
        let px =
            Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 40.0, 40.0), false)
                .unwrap();
        px.clear().unwrap();
        let dev = NativeDevice::new_draw(&engine, &px).unwrap();
        let path = square_path(&engine);
        dev.fill_path(
            &path,
            false,
            Matrix::IDENTITY,
            &cs,
            &Color::Rgb(1.0, 0.0, 0.0),
            1.0,
        )
        .unwrap();
        dev.close_device().unwrap();
        // Inside the square: red. Outside: still white.
        assert_eq!(px.pixel(15, 15).unwrap(), vec![255, 0, 0]);
        assert_eq!(px.pixel(5, 5).unwrap(), vec![255, 255, 255]);
    }

    #[test]
    fn test_draw_device_respects_clip_stack() {
        let engine = Engine::new();
        let cs = ColorSpace::device_gray(&engine);
        let px =
            Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 30.0, 30.0), false)
                .unwrap();
        px.clear().unwrap();
        let dev = NativeDevice::new_draw(&engine, &px).unwrap();
        let clip = Path::new(&engine);
        clip.rect(Rect::new(0.0, 0.0, 12.0, 12.0)).unwrap();
        dev.clip_path(&clip, false, Matrix::IDENTITY, Rect::new(0.0, 0.0, 12.0, 12.0))
            .unwrap();
        let fill = Path::new(&engine);
        fill.rect(Rect::new(0.0, 0.0, 30.0, 30.0)).unwrap();
        dev.fill_path(&fill, false, Matrix::IDENTITY, &cs, &Color::Gray(0.0), 1.0)
            .unwrap();
        dev.pop_clip().unwrap();
        assert_eq!(px.pixel(5, 5).unwrap(), vec![0]);
        assert_eq!(px.pixel(20, 20).unwrap(), vec![255]);
    }

    #[test]
    fn test_draw_device_tile_cache_ids() {
        let engine = Engine::new();
        let cs = ColorSpace::device_gray(&engine);
        let px = Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 8.0, 8.0), false)
            .unwrap();
        let dev = NativeDevice::new_draw(&engine, &px).unwrap();
        let area = Rect::new(0.0, 0.0, 4.0, 4.0);
        // First sighting: content requested.
        let first = dev
            .begin_tile(area, area, 4.0, 4.0, Matrix::IDENTITY, 0)
            .unwrap();
        assert_eq!(first, 0);
        dev.end_tile().unwrap();
        // Same parameters again: cached, stable id.
        let second = dev
            .begin_tile(area, area, 4.0, 4.0, Matrix::IDENTITY, 0)
            .unwrap();
        let third = dev
            .begin_tile(area, area, 4.0, 4.0, Matrix::IDENTITY, 0)
            .unwrap();
        assert_ne!(second, 0);
        assert_eq!(second, third);
        // Different parameters allocate separately.
        let other = dev
            .begin_tile(area, area, 8.0, 8.0, Matrix::IDENTITY, 0)
            .unwrap();
        assert_eq!(other, 0);
    }

    #[test]
    fn test_unbalanced_nesting_is_forwarded_not_validated() {
        let engine = Engine::new();
        let ops = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let dev = NativeDevice::from_sink(
            &engine,
            Box::new(OpLog {
                ops: std::rc::Rc::clone(&ops),
            }),
        );
        // end_layer without begin_layer, pop_clip without clip: delivered
        // verbatim.
        dev.end_layer().unwrap();
        dev.pop_clip().unwrap();
        assert_eq!(*ops.borrow(), vec!["end_layer", "pop_clip"]);
    }

    #[test]
    fn test_destroying_bridge_removes_sink() {
        let engine = Engine::new();
        let dev = NativeDevice::from_sink(&engine, Box::new(OpLog::default()));
        let h = dev.raw().unwrap();
        dev.destroy();
        assert!(engine.with(h, |_| Ok(())).is_err());
    }

    #[test]
    fn test_mask_content_not_painted() {
        let engine = Engine::new();
        let cs = ColorSpace::device_gray(&engine);
        let px = Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 10.0, 10.0), false)
            .unwrap();
        px.clear().unwrap();
        let dev = NativeDevice::new_draw(&engine, &px).unwrap();
        dev.begin_mask(Rect::new(0.0, 0.0, 10.0, 10.0), false, &cs, &Color::Gray(0.0))
            .unwrap();
        let p = Path::new(&engine);
        p.rect(Rect::new(0.0, 0.0, 10.0, 10.0)).unwrap();
        dev.fill_path(&p, false, Matrix::IDENTITY, &cs, &Color::Gray(0.0), 1.0)
            .unwrap();
        dev.end_mask().unwrap();
        // Mask generation leaves the visible surface untouched.
        assert_eq!(px.pixel(5, 5).unwrap(), vec![255]);
    }
}
