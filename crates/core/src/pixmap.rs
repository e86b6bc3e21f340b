//! Pixel buffers produced by rendering.
//!
//! Samples are row-major u8, `n` components per pixel with alpha last when
//! present. The painting device only guarantees deterministic dimensions
//! and sample layout; it is not a rasterizer.

use std::rc::Rc;

use crate::content::ColorSpace;
use crate::engine::Engine;
use crate::engine::arena::RawHandle;
use crate::engine::data::Resource;
use crate::error::{Error, Result};
use crate::geometry::Rect;
use crate::handle::{Binding, handle_wrapper};

/// Integer device-space bounds of a pixmap, rounded from a real rect.
pub(crate) fn irect_from_rect(r: Rect) -> (i32, i32, i32, i32) {
    (
        r.x0.round() as i32,
        r.y0.round() as i32,
        r.x1.round() as i32,
        r.y1.round() as i32,
    )
}

pub struct PixmapData {
    pub(crate) x: i32,
    pub(crate) y: i32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    /// Components per pixel including alpha when present.
    pub(crate) n: u32,
    pub(crate) alpha: bool,
    pub(crate) stride: usize,
    pub(crate) colorspace: Option<RawHandle>,
    pub(crate) samples: Vec<u8>,
}

pub struct Pixmap {
    pub(crate) bind: Binding,
}

handle_wrapper!(Pixmap, "pixmap");

fn with_pixmap<R>(
    engine: &Engine,
    h: RawHandle,
    f: impl FnOnce(&PixmapData) -> R,
) -> Result<R> {
    engine.with(h, |res| match res {
        Resource::Pixmap(px) => Ok(f(px)),
        other => Err(Error::Type {
            expected: "pixmap",
            got: other.kind_name(),
        }),
    })
}

pub(crate) fn with_pixmap_mut<R>(
    engine: &Engine,
    h: RawHandle,
    f: impl FnOnce(&mut PixmapData) -> R,
) -> Result<R> {
    engine.with_mut(h, |res| match res {
        Resource::Pixmap(px) => Ok(f(px)),
        other => Err(Error::Type {
            expected: "pixmap",
            got: other.kind_name(),
        }),
    })
}

impl Pixmap {
    /// Allocates a pixmap covering `bbox` (rounded to whole pixels) in the
    /// given colorspace. The pixmap takes its own reference on the space.
    pub fn new_with_bbox(
        engine: &Rc<Engine>,
        colorspace: &ColorSpace,
        bbox: Rect,
        alpha: bool,
    ) -> Result<Pixmap> {
        if !bbox.is_valid() || bbox.is_infinite() {
            return Err(Error::Argument("pixmap bbox must be finite".into()));
        }
        let (x0, y0, x1, y1) = irect_from_rect(bbox);
        let width = (x1 - x0).max(0) as u32;
        let height = (y1 - y0).max(0) as u32;
        let n = colorspace.n()? as u32 + alpha as u32;
        let stride = (width * n) as usize;
        let csh = colorspace.raw()?;
        engine.retain(csh)?;
        let data = PixmapData {
            x: x0,
            y: y0,
            width,
            height,
            n,
            alpha,
            stride,
            colorspace: Some(csh),
            samples: vec![0; stride * height as usize],
        };
        let h = engine.insert(Resource::Pixmap(data));
        Ok(Pixmap {
            bind: Binding::adopt(Rc::clone(engine), h, Pixmap::KIND),
        })
    }

    pub fn width(&self) -> Result<u32> {
        with_pixmap(self.engine(), self.raw()?, |p| p.width)
    }

    pub fn height(&self) -> Result<u32> {
        with_pixmap(self.engine(), self.raw()?, |p| p.height)
    }

    pub fn x(&self) -> Result<i32> {
        with_pixmap(self.engine(), self.raw()?, |p| p.x)
    }

    pub fn y(&self) -> Result<i32> {
        with_pixmap(self.engine(), self.raw()?, |p| p.y)
    }

    pub fn n(&self) -> Result<u32> {
        with_pixmap(self.engine(), self.raw()?, |p| p.n)
    }

    pub fn alpha(&self) -> Result<bool> {
        with_pixmap(self.engine(), self.raw()?, |p| p.alpha)
    }

    pub fn stride(&self) -> Result<usize> {
        with_pixmap(self.engine(), self.raw()?, |p| p.stride)
    }

    pub fn bounds(&self) -> Result<Rect> {
        with_pixmap(self.engine(), self.raw()?, |p| {
            Rect::new(
                p.x as f64,
                p.y as f64,
                (p.x + p.width as i32) as f64,
                (p.y + p.height as i32) as f64,
            )
        })
    }

    pub fn colorspace(&self) -> Result<Option<ColorSpace>> {
        let cs = with_pixmap(self.engine(), self.raw()?, |p| p.colorspace)?;
        match cs {
            Some(h) => Ok(Some(ColorSpace::from_borrowed(self.engine(), h)?)),
            None => Ok(None),
        }
    }

    /// Copy of the sample buffer.
    pub fn samples(&self) -> Result<Vec<u8>> {
        with_pixmap(self.engine(), self.raw()?, |p| p.samples.clone())
    }

    /// Component values of the pixel at (x, y) relative to the pixmap
    /// origin.
    pub fn pixel(&self, x: u32, y: u32) -> Result<Vec<u8>> {
        with_pixmap(self.engine(), self.raw()?, |p| {
            if x >= p.width || y >= p.height {
                return Err(Error::Argument(format!("pixel ({x}, {y}) out of range")));
            }
            let off = y as usize * p.stride + (x * p.n) as usize;
            Ok(p.samples[off..off + p.n as usize].to_vec())
        })?
    }

    /// Fills with transparent black when the pixmap has alpha, white
    /// otherwise.
    pub fn clear(&self) -> Result<()> {
        let v = if self.alpha()? { 0x00 } else { 0xff };
        self.clear_with_value(v)
    }

    pub fn clear_with_value(&self, value: u8) -> Result<()> {
        with_pixmap_mut(self.engine(), self.raw()?, |p| {
            p.samples.fill(value);
        })
    }

    pub(crate) fn from_borrowed(engine: &Rc<Engine>, h: RawHandle) -> Result<Pixmap> {
        Ok(Pixmap {
            bind: Binding::from_borrowed(Rc::clone(engine), h, Pixmap::KIND)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_round_from_bbox() {
        let engine = Engine::new();
        let cs = ColorSpace::device_rgb(&engine);
        let px =
            Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 612.0, 792.0), false)
                .unwrap();
        assert_eq!(px.width().unwrap(), 612);
        assert_eq!(px.height().unwrap(), 792);
        assert_eq!(px.n().unwrap(), 3);
        assert_eq!(px.stride().unwrap(), 612 * 3);
        assert_eq!(px.samples().unwrap().len(), 612 * 792 * 3);
    }

    #[test]
    fn test_fractional_bbox_rounds() {
        let engine = Engine::new();
        let cs = ColorSpace::device_gray(&engine);
        let px =
            Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 100.4, 99.6), true)
                .unwrap();
        assert_eq!(px.width().unwrap(), 100);
        assert_eq!(px.height().unwrap(), 100);
        assert_eq!(px.n().unwrap(), 2);
        assert!(px.alpha().unwrap());
    }

    #[test]
    fn test_clear_values() {
        let engine = Engine::new();
        let cs = ColorSpace::device_gray(&engine);
        let px = Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 2.0, 2.0), false)
            .unwrap();
        px.clear().unwrap();
        assert_eq!(px.pixel(0, 0).unwrap(), vec![0xff]);
        px.clear_with_value(0x7f).unwrap();
        assert_eq!(px.pixel(1, 1).unwrap(), vec![0x7f]);
    }

    #[test]
    fn test_infinite_bbox_rejected() {
        let engine = Engine::new();
        let cs = ColorSpace::device_rgb(&engine);
        assert!(Pixmap::new_with_bbox(&engine, &cs, Rect::INFINITE, false).is_err());
    }

    #[test]
    fn test_colorspace_kept_alive_by_pixmap() {
        let engine = Engine::new();
        let cs = ColorSpace::device_rgb(&engine);
        let px = Pixmap::new_with_bbox(&engine, &cs, Rect::new(0.0, 0.0, 4.0, 4.0), false)
            .unwrap();
        cs.destroy();
        let got = px.colorspace().unwrap().unwrap();
        assert_eq!(got.name().unwrap(), "DeviceRGB");
    }
}
