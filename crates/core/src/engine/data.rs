//! Resource payloads stored in the engine arena.

use crate::content::{
    ColorSpaceData, FontData, ImageData, PathData, ShadeData, StrokeData, TextData,
};
use crate::device::{DeviceData, DeviceKind};
use crate::display::DisplayListData;
use crate::document::{DocumentData, PageData};
use crate::engine::arena::RawHandle;
use crate::object::GraftMapData;
use crate::pixmap::PixmapData;

/// Everything a handle can name. One arena slot holds one of these.
pub enum Resource {
    Document(Box<DocumentData>),
    Page(PageData),
    Pixmap(PixmapData),
    Path(PathData),
    Text(TextData),
    Image(ImageData),
    ColorSpace(ColorSpaceData),
    StrokeState(StrokeData),
    Font(FontData),
    Shade(ShadeData),
    DisplayList(DisplayListData),
    Device(DeviceData),
    GraftMap(GraftMapData),
}

impl Resource {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Resource::Document(_) => "document",
            Resource::Page(_) => "page",
            Resource::Pixmap(_) => "pixmap",
            Resource::Path(_) => "path",
            Resource::Text(_) => "text",
            Resource::Image(_) => "image",
            Resource::ColorSpace(_) => "colorspace",
            Resource::StrokeState(_) => "stroke state",
            Resource::Font(_) => "font",
            Resource::Shade(_) => "shade",
            Resource::DisplayList(_) => "display list",
            Resource::Device(_) => "device",
            Resource::GraftMap(_) => "graft map",
        }
    }

    /// Handles this resource owns a reference on. Collected when the slot is
    /// vacated so the release cascades without recursion.
    pub fn child_handles(&self) -> Vec<RawHandle> {
        match self {
            Resource::Document(_) => Vec::new(),
            Resource::Page(p) => vec![p.doc],
            Resource::Pixmap(px) => px.colorspace.into_iter().collect(),
            Resource::Path(_) => Vec::new(),
            Resource::Text(t) => t.spans.iter().map(|s| s.font).collect(),
            Resource::Image(im) => im.colorspace.into_iter().collect(),
            Resource::ColorSpace(_) => Vec::new(),
            Resource::StrokeState(_) => Vec::new(),
            Resource::Font(_) => Vec::new(),
            Resource::Shade(sh) => vec![sh.doc],
            Resource::DisplayList(dl) => dl.captured_handles(),
            Resource::Device(dev) => match &dev.kind {
                DeviceKind::Draw(draw) => vec![draw.pixmap],
                DeviceKind::Recorder { list } => vec![*list],
                DeviceKind::Bridge { .. } => Vec::new(),
            },
            Resource::GraftMap(gm) => vec![gm.src_doc, gm.dst_doc],
        }
    }
}
