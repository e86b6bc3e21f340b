//! Byte sources that may not have all their data yet.
//!
//! A [`ByteSource`] answers range reads either with bytes or with a
//! [`SourceRead::TryLater`] naming the exact missing range. Operations built
//! on top retry wholesale: there is no partial resumption, an interrupted
//! open starts over once the host has fed the missing bytes. That keeps the
//! retry contract trivial for hosts at the cost of re-reading prefixes,
//! which are cheap in-memory copies.

use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use crate::document::Document;
use crate::engine::Engine;
use crate::error::{Error, Result};

/// Outcome of one range read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRead {
    /// That many bytes were copied into the buffer. Short reads are normal;
    /// zero means end of data.
    Read(usize),
    /// The range starting at `position` is not available yet. Feed it and
    /// retry the whole operation.
    TryLater { position: u64, length: u64 },
}

/// Random-access byte supplier, possibly incomplete.
pub trait ByteSource {
    /// Total size when known. Opening a document requires it.
    fn len(&self) -> Option<u64>;

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<SourceRead>;
}

/// An in-memory source assembled from ranges the host feeds in as they
/// arrive, typical for byte-range downloads.
///
/// Missing reads are recorded so the host can ask which ranges to fetch;
/// repeated misses on the same range are reported once until drained with
/// [`ChunkedSource::take_requests`].
pub struct ChunkedSource {
    chunks: BTreeMap<u64, Vec<u8>>,
    total: Option<u64>,
    requests: Vec<(u64, u64)>,
}

impl ChunkedSource {
    pub fn new() -> ChunkedSource {
        ChunkedSource {
            chunks: BTreeMap::new(),
            total: None,
            requests: Vec::new(),
        }
    }

    pub fn with_len(total: u64) -> ChunkedSource {
        ChunkedSource {
            chunks: BTreeMap::new(),
            total: Some(total),
            requests: Vec::new(),
        }
    }

    pub fn set_len(&mut self, total: u64) {
        self.total = Some(total);
    }

    /// Stores a range of bytes. Overlapping and adjacent chunks are merged;
    /// fresh data wins on overlap.
    pub fn feed(&mut self, pos: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut lo = pos;
        let mut hi = pos + data.len() as u64;
        if let Some((&k, v)) = self.chunks.range(..pos).next_back() {
            if k + v.len() as u64 >= pos {
                lo = k;
            }
        }
        let mut absorbed: Vec<(u64, Vec<u8>)> = Vec::new();
        loop {
            let keys: Vec<u64> = self.chunks.range(lo..=hi).map(|(&k, _)| k).collect();
            if keys.is_empty() {
                break;
            }
            for k in keys {
                if let Some(v) = self.chunks.remove(&k) {
                    hi = hi.max(k + v.len() as u64);
                    absorbed.push((k, v));
                }
            }
        }
        let mut buf = vec![0u8; (hi - lo) as usize];
        for (k, v) in absorbed {
            let off = (k - lo) as usize;
            buf[off..off + v.len()].copy_from_slice(&v);
        }
        let off = (pos - lo) as usize;
        buf[off..off + data.len()].copy_from_slice(data);
        self.chunks.insert(lo, buf);
    }

    /// True once a single chunk covers the whole declared length.
    pub fn is_complete(&self) -> bool {
        match (self.total, self.chunks.iter().next()) {
            (Some(t), Some((&0, v))) => v.len() as u64 >= t,
            (Some(0), None) => true,
            _ => false,
        }
    }

    /// Missing ranges reported since the last call, oldest first.
    pub fn take_requests(&mut self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.requests)
    }
}

impl Default for ChunkedSource {
    fn default() -> Self {
        ChunkedSource::new()
    }
}

impl ByteSource for ChunkedSource {
    fn len(&self) -> Option<u64> {
        self.total
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<SourceRead> {
        let mut want = buf.len();
        if let Some(t) = self.total {
            if pos >= t {
                return Ok(SourceRead::Read(0));
            }
            want = want.min((t - pos) as usize);
        }
        if want == 0 {
            return Ok(SourceRead::Read(0));
        }
        if let Some((&k, v)) = self.chunks.range(..=pos).next_back() {
            if k + v.len() as u64 > pos {
                let off = (pos - k) as usize;
                let n = want.min(v.len() - off);
                buf[..n].copy_from_slice(&v[off..off + n]);
                return Ok(SourceRead::Read(n));
            }
        }
        // Nothing at pos: report the gap up to the next chunk (or the whole
        // requested span), once.
        let next = self.chunks.range(pos..).next().map(|(&k, _)| k);
        let gap_end = match next {
            Some(k) => k.min(pos + want as u64),
            None => pos + want as u64,
        };
        let req = (pos, gap_end - pos);
        if !self.requests.contains(&req) {
            self.requests.push(req);
        }
        Ok(SourceRead::TryLater {
            position: req.0,
            length: req.1,
        })
    }
}

/// Attempts before a progressive open gives up.
pub const MAX_OPEN_RETRIES: u32 = 100;

pub enum OpenProgress {
    Ready(Document),
    /// Feed this range, then call `advance` again.
    Waiting { position: u64, length: u64 },
}

/// Opens a document over a source that is still downloading.
///
/// Every `advance` restarts the open from the beginning of the source; a
/// miss surfaces as [`OpenProgress::Waiting`] with the range to feed. A
/// source may report the miss either as [`SourceRead::TryLater`] or as
/// [`Error::TryLater`]; both count against the same budget. After
/// [`MAX_OPEN_RETRIES`] misses the open fails for good.
pub struct ProgressiveOpen<S> {
    engine: Rc<Engine>,
    source: S,
    attempts: u32,
}

impl<S: ByteSource> ProgressiveOpen<S> {
    pub fn new(engine: &Rc<Engine>, source: S) -> ProgressiveOpen<S> {
        ProgressiveOpen {
            engine: Rc::clone(engine),
            source,
            attempts: 0,
        }
    }

    /// The underlying source, for feeding data between attempts.
    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn advance(&mut self) -> Result<OpenProgress> {
        let total = self.source.len().ok_or_else(|| {
            Error::Argument("progressive open requires a source with a known length".into())
        })?;
        let mut buf = vec![0u8; total as usize];
        let mut filled: u64 = 0;
        while filled < total {
            let read = match self.source.read_at(filled, &mut buf[filled as usize..]) {
                Err(Error::TryLater { position, length }) => {
                    SourceRead::TryLater { position, length }
                }
                other => other?,
            };
            match read {
                SourceRead::Read(0) => return Err(Error::UnexpectedEof),
                SourceRead::Read(n) => filled += n as u64,
                SourceRead::TryLater { position, length } => {
                    self.attempts += 1;
                    debug!(
                        attempt = self.attempts,
                        position, length, "open waiting for data"
                    );
                    if self.attempts >= MAX_OPEN_RETRIES {
                        return Err(Error::RetriesExhausted(self.attempts));
                    }
                    return Ok(OpenProgress::Waiting { position, length });
                }
            }
        }
        let doc = Document::open(&self.engine, &buf)?;
        Ok(OpenProgress::Ready(doc))
    }
}
