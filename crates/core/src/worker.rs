//! Offscreen rendering on a second engine.
//!
//! Engines are single-threaded and nothing wrapping one is Send, so work
//! cannot move to another thread as handles. What can move is plain data:
//! file bytes, a page index and a transform go out, raw samples come back.
//! [`spawn_render`] packages that exchange: a dedicated thread builds its
//! own [`Engine`], opens the document, renders one page and sends exactly
//! one reply. The shared [`CancelFlag`] is the only live state on both
//! sides.

use std::sync::mpsc;
use std::thread;

use tracing::debug;

use crate::content::ColorSpace;
use crate::device::NativeDevice;
use crate::document::{AuthOutcome, Document};
use crate::engine::{CancelFlag, Engine};
use crate::error::{Error, Result};
use crate::geometry::Matrix;
use crate::pixmap::Pixmap;

/// Target pixel layout for an offscreen render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    Gray,
    Rgb,
    /// RGB plus an alpha channel; the surface starts transparent instead
    /// of white.
    Rgba,
}

/// Everything a worker needs to render one page. Plain values only; the
/// request is built on one thread and consumed on another.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub data: Vec<u8>,
    pub password: Option<String>,
    pub page_index: usize,
    /// Applied on top of the page transform; identity renders at 72 dpi.
    pub transform: Matrix,
    pub format: RenderFormat,
}

/// A rendered page as raw samples. `stride` is the row pitch in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderReply {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub samples: Vec<u8>,
}

/// Renders `req` on its own thread and delivers one `Result` on the
/// returned channel. Cancelling the flag aborts the render between
/// operators; a flag cancelled up front aborts before the file is opened.
pub fn spawn_render(
    req: RenderRequest,
    cancel: CancelFlag,
) -> mpsc::Receiver<Result<RenderReply>> {
    let (tx, rx) = mpsc::channel();
    let worker_tx = tx.clone();
    let spawned = thread::Builder::new()
        .name("offscreen-render".into())
        .spawn(move || {
            let _ = worker_tx.send(render_page(&req, &cancel));
        });
    if let Err(e) = spawned {
        let _ = tx.send(Err(Error::Io(e)));
    }
    rx
}

fn render_page(req: &RenderRequest, cancel: &CancelFlag) -> Result<RenderReply> {
    cancel.check()?;
    let engine = Engine::new();
    let doc = Document::open(&engine, &req.data)?;
    if doc.needs_password()? {
        let password = req.password.as_deref().ok_or(Error::NeedsPassword)?;
        if doc.authenticate(password)? == AuthOutcome::Failed {
            return Err(Error::NeedsPassword);
        }
    }
    let page = doc.load_page(req.page_index)?;

    let (colorspace, alpha) = match req.format {
        RenderFormat::Gray => (ColorSpace::device_gray(&engine), false),
        RenderFormat::Rgb => (ColorSpace::device_rgb(&engine), false),
        RenderFormat::Rgba => (ColorSpace::device_rgb(&engine), true),
    };
    let bbox = page.bounds()?.transform(req.transform);
    let pix = Pixmap::new_with_bbox(&engine, &colorspace, bbox, alpha)?;
    if alpha {
        pix.clear()?;
    } else {
        pix.clear_with_value(0xFF)?;
    }
    let dev = NativeDevice::new_draw(&engine, &pix)?;
    page.run_with_cancel(&dev, req.transform, Some(cancel))?;
    dev.close_device()?;
    dev.destroy();

    let reply = RenderReply {
        width: pix.width()?,
        height: pix.height()?,
        stride: pix.stride()?,
        samples: pix.samples()?,
    };
    debug!(
        page = req.page_index,
        width = reply.width,
        height = reply.height,
        "worker rendered page"
    );
    Ok(reply)
}
