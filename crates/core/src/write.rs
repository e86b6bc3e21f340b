//! Writing documents back to bytes.
//!
//! A full save rebuilds the file from the object graph: header, every live
//! object in number order, one classic cross-reference table, trailer. An
//! incremental save leaves the original bytes untouched and appends only
//! the objects changed since open, chaining the tables through `/Prev`.
//! Output from an authenticated encrypted document is written decrypted,
//! with the `/Encrypt` entry dropped from the trailer.

use std::borrow::Cow;
use std::collections::hash_map::Entry;
use std::io::Write as _;

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::document::{AuthLevel, DocumentData, with_document};
use crate::engine::Engine;
use crate::engine::arena::RawHandle;
use crate::error::{Error, Result};
use crate::object::{GraphNode, NodeId, ObjectStore, XrefSlot};
use crate::parse::filters;
use crate::parse::lexer::is_delimiter;

/// Nesting bound while serializing values. The object API can build direct
/// cycles; anything deeper than this writes null instead of recursing.
const MAX_WRITE_DEPTH: u32 = 256;

/// Parsed form of the comma separated option string accepted by
/// [`crate::document::Document::save`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOptions {
    /// Flate-compress every stream that is currently unfiltered.
    pub compress: bool,
    /// Compress image streams only.
    pub compress_images: bool,
    /// Compress embedded font files only.
    pub compress_fonts: bool,
    /// Strip decodable filters and write streams in plain form.
    pub decompress: bool,
    /// Keep every byte of the file 7-bit clean: hex strings, hex-encoded
    /// stream bodies, no binary marker line.
    pub ascii: bool,
    /// Indent dictionaries one entry per line.
    pub pretty: bool,
    /// 0 keeps every object, 1 drops unreachable ones, 2 also renumbers
    /// densely, 3 also merges duplicate non-stream objects.
    pub garbage: u8,
    /// Append changed objects to the original bytes instead of rewriting.
    pub incremental: bool,
}

impl SaveOptions {
    /// Parses `"compress,garbage=2,ascii"` style option lists. Empty parts
    /// are skipped; an unknown keyword is an argument error.
    pub fn parse(options: &str) -> Result<SaveOptions> {
        let mut o = SaveOptions::default();
        for part in options.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (part, None),
            };
            if value.is_some() && key != "garbage" {
                return Err(Error::Argument(format!(
                    "save option {key:?} takes no value"
                )));
            }
            match key {
                "compress" => o.compress = true,
                "compress-images" => o.compress_images = true,
                "compress-fonts" => o.compress_fonts = true,
                "decompress" => o.decompress = true,
                "ascii" => o.ascii = true,
                "pretty" => o.pretty = true,
                "incremental" => o.incremental = true,
                "garbage" => {
                    o.garbage = match value {
                        None => 1,
                        Some(v) => v
                            .parse::<u8>()
                            .map_err(|_| {
                                Error::Argument(format!("bad garbage level {v:?}"))
                            })?
                            .min(3),
                    }
                }
                other => {
                    return Err(Error::Argument(format!("unknown save option {other:?}")));
                }
            }
        }
        if o.incremental && o.garbage > 0 {
            return Err(Error::Argument(
                "garbage collection rewrites object numbers and cannot be \
                 combined with an incremental save"
                    .into(),
            ));
        }
        Ok(o)
    }
}

/// Serializes the document behind `doc`. An encrypted document must be
/// authenticated first; the output is always plaintext.
pub(crate) fn save_document(
    engine: &Engine,
    doc: RawHandle,
    opts: &SaveOptions,
) -> Result<Vec<u8>> {
    with_document(engine, doc, |d| {
        if d.crypt.is_some() && matches!(d.auth, AuthLevel::Pending) {
            return Err(Error::NeedsPassword);
        }
        debug!(
            incremental = opts.incremental,
            garbage = opts.garbage,
            "saving document"
        );
        if opts.incremental {
            incremental_save(d, opts)
        } else {
            full_save(d, opts)
        }
    })
}

fn full_save(d: &DocumentData, opts: &SaveOptions) -> Result<Vec<u8>> {
    let s = &d.store;
    if s.dict_get(s.trailer, "Root") == NodeId::NULL {
        return Err(Error::Corrupt("document has no catalog".into()));
    }

    let mut live: Vec<(u32, NodeId, u16)> = s
        .xref
        .iter()
        .filter_map(|(&num, &slot)| match slot {
            XrefSlot::Loaded { node, gen } => Some((num, node, gen)),
            _ => None,
        })
        .collect();
    live.sort_unstable_by_key(|e| e.0);
    // Cross-reference streams describe the layout of the file they came
    // from, which this save replaces with a classic table.
    live.retain(|&(_, node, _)| !is_xref_stream(s, node));

    if opts.garbage >= 1 {
        let reached = mark_reachable(s);
        live.retain(|&(num, ..)| reached.contains(&num));
    }

    let no_alias = FxHashMap::default();
    let mut alias: FxHashMap<u32, u32> = FxHashMap::default();
    if opts.garbage >= 3 {
        // One pass over serialized bodies. Twins whose bodies differ only
        // through references to other twins stay separate.
        let mut seen: FxHashMap<Vec<u8>, u32> = FxHashMap::default();
        for &(num, node, _) in &live {
            if matches!(s.node(node), GraphNode::Stream { .. }) {
                continue;
            }
            let mut body = Vec::new();
            let mut em = Emitter {
                s,
                alias: &no_alias,
                renumber: None,
                kept: None,
                pretty: false,
                ascii: false,
                out: &mut body,
            };
            em.value(node, 0);
            match seen.entry(body) {
                Entry::Occupied(e) => {
                    alias.insert(num, *e.get());
                }
                Entry::Vacant(e) => {
                    e.insert(num);
                }
            }
        }
        live.retain(|&(num, ..)| !alias.contains_key(&num));
    }

    let renumber: Option<FxHashMap<u32, u32>> = (opts.garbage >= 2).then(|| {
        live.iter()
            .enumerate()
            .map(|(i, e)| (e.0, i as u32 + 1))
            .collect()
    });
    let kept: Option<FxHashSet<u32>> =
        (opts.garbage >= 1).then(|| live.iter().map(|e| e.0).collect());

    let mut out = Vec::new();
    let (major, minor) = d.version;
    let _ = write!(out, "%PDF-{major}.{minor}\n");
    if !opts.ascii {
        // Binary marker so transfer tools treat the file as binary.
        out.extend_from_slice(b"%\xe2\xe3\xcf\xd3\n");
    }

    let mut entries: Vec<(u32, u64, u16)> = Vec::with_capacity(live.len());
    {
        let mut em = Emitter {
            s,
            alias: &alias,
            renumber: renumber.as_ref(),
            kept: kept.as_ref(),
            pretty: opts.pretty,
            ascii: opts.ascii,
            out: &mut out,
        };
        for &(num, node, gen) in &live {
            let out_num = match renumber.as_ref() {
                Some(m) => m[&num],
                None => num,
            };
            let out_gen = if renumber.is_some() { 0 } else { gen };
            entries.push((out_num, em.out.len() as u64, out_gen));
            let _ = write!(em.out, "{out_num} {out_gen} obj\n");
            emit_body(&mut em, node, opts);
            em.raw(b"\nendobj\n");
        }
    }

    // Renumbered output is dense, so either way `entries` is ascending.
    let size = entries.last().map(|e| e.0 + 1).unwrap_or(1);
    let xref_pos = out.len();
    out.extend_from_slice(b"xref\n");
    let _ = write!(out, "0 {size}\n");
    let mut next = entries.iter().peekable();
    for num in 0..size {
        match next.peek() {
            Some(&&(n, pos, gen)) if n == num => {
                let _ = write!(out, "{pos:010} {gen:05} n \n");
                next.next();
            }
            _ => out.extend_from_slice(b"0000000000 65535 f \n"),
        }
    }

    let id = md5::compute(&out);
    out.extend_from_slice(b"trailer\n");
    {
        let mut em = Emitter {
            s,
            alias: &alias,
            renumber: renumber.as_ref(),
            kept: kept.as_ref(),
            pretty: opts.pretty,
            ascii: opts.ascii,
            out: &mut out,
        };
        em.raw(b"<<");
        if let GraphNode::Dict(map) = s.node(s.trailer) {
            for (key, &value) in map {
                // The identifier is regenerated below.
                if is_trailer_machinery(key) || key == "ID" {
                    continue;
                }
                em.name(key);
                em.raw(b" ");
                em.value(value, 1);
            }
        }
        let _ = write!(em.out, "/Size {size}/ID [<{id:x}> <{id:x}>]");
        em.raw(b">>");
    }
    let _ = write!(out, "\nstartxref\n{xref_pos}\n%%EOF\n");
    Ok(out)
}

fn incremental_save(d: &DocumentData, opts: &SaveOptions) -> Result<Vec<u8>> {
    let s = &d.store;
    let Some(source) = d.source.as_ref() else {
        return Err(Error::Argument(
            "incremental save needs the original file bytes".into(),
        ));
    };
    if d.crypt.is_some() {
        return Err(Error::Argument(
            "cannot append plaintext objects to an encrypted file".into(),
        ));
    }
    if d.repaired {
        return Err(Error::Argument(
            "the file was repaired at open; an appended table would chain \
             to a broken one"
                .into(),
        ));
    }

    let mut out = source.to_vec();
    if out.last() != Some(&b'\n') {
        out.push(b'\n');
    }
    let mut dirty: Vec<u32> = s.dirty.iter().copied().collect();
    dirty.sort_unstable();
    debug!(objects = dirty.len(), "incremental save");

    let no_alias = FxHashMap::default();
    // (number, offset, generation, free)
    let mut entries: Vec<(u32, u64, u16, bool)> = Vec::with_capacity(dirty.len());
    {
        let mut em = Emitter {
            s,
            alias: &no_alias,
            renumber: None,
            kept: None,
            pretty: opts.pretty,
            ascii: opts.ascii,
            out: &mut out,
        };
        for num in dirty {
            match s.xref.get(&num) {
                Some(&XrefSlot::Loaded { node, gen }) => {
                    entries.push((num, em.out.len() as u64, gen, false));
                    let _ = write!(em.out, "{num} {gen} obj\n");
                    emit_body(&mut em, node, opts);
                    em.raw(b"\nendobj\n");
                }
                Some(&XrefSlot::Free { gen }) => {
                    entries.push((num, 0, gen, true));
                }
                other => {
                    warn!(num, slot = ?other, "dirty object has no body");
                }
            }
        }
    }

    let xref_pos = out.len();
    out.extend_from_slice(b"xref\n");
    let mut i = 0;
    while i < entries.len() {
        let mut j = i;
        while j + 1 < entries.len() && entries[j + 1].0 == entries[j].0 + 1 {
            j += 1;
        }
        let _ = write!(out, "{} {}\n", entries[i].0, j - i + 1);
        for e in &entries[i..=j] {
            if e.3 {
                out.extend_from_slice(b"0000000000 65535 f \n");
            } else {
                let _ = write!(out, "{:010} {:05} n \n", e.1, e.2);
            }
        }
        i = j + 1;
    }

    out.extend_from_slice(b"trailer\n");
    {
        let mut em = Emitter {
            s,
            alias: &no_alias,
            renumber: None,
            kept: None,
            pretty: opts.pretty,
            ascii: opts.ascii,
            out: &mut out,
        };
        em.raw(b"<<");
        if let GraphNode::Dict(map) = s.node(s.trailer) {
            for (key, &value) in map {
                // The original identifier stays; readers use it to match
                // the update to its base file.
                if is_trailer_machinery(key) {
                    continue;
                }
                em.name(key);
                em.raw(b" ");
                em.value(value, 1);
            }
        }
        let _ = write!(em.out, "/Size {}/Prev {}", s.next_num, d.orig_startxref);
        em.raw(b">>");
    }
    let _ = write!(out, "\nstartxref\n{xref_pos}\n%%EOF\n");
    Ok(out)
}

/// Object numbers reachable from the trailer. Layout keys are not
/// followed, so a stale `/Encrypt` or xref-stream dictionary drops out.
fn mark_reachable(s: &ObjectStore) -> FxHashSet<u32> {
    let mut reached: FxHashSet<u32> = FxHashSet::default();
    let mut seen: FxHashSet<NodeId> = FxHashSet::default();
    let mut stack: Vec<NodeId> = Vec::new();
    if let GraphNode::Dict(map) = s.node(s.trailer) {
        for (key, &value) in map {
            if !is_trailer_machinery(key) {
                stack.push(value);
            }
        }
    }
    while let Some(id) = stack.pop() {
        if id == NodeId::NULL || !seen.insert(id) {
            continue;
        }
        match s.node(id) {
            GraphNode::Ref(num, _) => {
                if reached.insert(*num) {
                    if let Some(body) = s.object_node(*num) {
                        stack.push(body);
                    }
                }
            }
            GraphNode::Array(items) => stack.extend(items.iter().copied()),
            GraphNode::Dict(map) => stack.extend(map.values().copied()),
            GraphNode::Stream { dict, .. } => stack.push(*dict),
            _ => {}
        }
    }
    reached
}

/// Trailer keys that describe file layout or encryption rather than
/// document content. Every save regenerates or drops these.
fn is_trailer_machinery(key: &str) -> bool {
    matches!(
        key,
        "Size"
            | "Prev"
            | "XRefStm"
            | "Encrypt"
            | "Type"
            | "Filter"
            | "DecodeParms"
            | "Length"
            | "W"
            | "Index"
    )
}

fn is_xref_stream(s: &ObjectStore, node: NodeId) -> bool {
    matches!(s.node(node), GraphNode::Stream { .. })
        && s.name_value(s.dict_get(node, "Type")).map(|n| n.as_str()) == Some("XRef")
}

/// Serializes values out of one store. The three maps rewrite references
/// when a garbage-collecting save drops, merges, or renumbers objects.
struct Emitter<'a> {
    s: &'a ObjectStore,
    alias: &'a FxHashMap<u32, u32>,
    renumber: Option<&'a FxHashMap<u32, u32>>,
    kept: Option<&'a FxHashSet<u32>>,
    pretty: bool,
    ascii: bool,
    out: &'a mut Vec<u8>,
}

impl Emitter<'_> {
    fn raw(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }

    /// Output number for a reference, or None when the target is gone and
    /// the reference must become null.
    fn map_ref(&self, num: u32) -> Option<u32> {
        let num = *self.alias.get(&num).unwrap_or(&num);
        if let Some(kept) = self.kept {
            if !kept.contains(&num) {
                return None;
            }
        }
        match self.renumber {
            Some(m) => m.get(&num).copied(),
            None => Some(num),
        }
    }

    fn value(&mut self, id: NodeId, depth: u32) {
        if depth > MAX_WRITE_DEPTH {
            warn!("value nesting too deep, writing null");
            self.raw(b"null");
            return;
        }
        match self.s.node(id) {
            GraphNode::Null => self.raw(b"null"),
            GraphNode::Bool(v) => self.raw(if *v { b"true" } else { b"false" }),
            GraphNode::Int(v) => {
                // Writing into a Vec cannot fail.
                let _ = write!(self.out, "{v}");
            }
            GraphNode::Real(v) => self.real(*v),
            GraphNode::Name(n) => self.name(n),
            GraphNode::String(bytes) => self.string(bytes),
            GraphNode::Array(items) => {
                self.raw(b"[");
                for (i, &item) in items.iter().enumerate() {
                    if i > 0 {
                        self.raw(b" ");
                    }
                    self.value(item, depth + 1);
                }
                self.raw(b"]");
            }
            GraphNode::Dict(map) => self.dict(map, depth),
            GraphNode::Stream { dict, .. } => {
                // Streams are only legal as whole objects; in value
                // position the dictionary part is all there is to write.
                let dict = *dict;
                self.value(dict, depth);
            }
            GraphNode::Ref(num, gen) => match self.map_ref(*num) {
                Some(n) => {
                    let gen = if self.renumber.is_some() { 0 } else { *gen };
                    let _ = write!(self.out, "{n} {gen} R");
                }
                None => self.raw(b"null"),
            },
        }
    }

    fn dict(&mut self, map: &IndexMap<SmolStr, NodeId>, depth: u32) {
        if self.pretty {
            self.raw(b"<<\n");
            for (key, &value) in map {
                self.indent(depth + 1);
                self.name(key);
                self.raw(b" ");
                self.value(value, depth + 1);
                self.raw(b"\n");
            }
            self.indent(depth);
            self.raw(b">>");
        } else {
            self.raw(b"<<");
            for (key, &value) in map {
                self.name(key);
                self.raw(b" ");
                self.value(value, depth + 1);
            }
            self.raw(b">>");
        }
    }

    fn indent(&mut self, depth: u32) {
        for _ in 0..depth {
            self.raw(b"  ");
        }
    }

    fn real(&mut self, v: f64) {
        if !v.is_finite() {
            self.raw(b"0");
        } else if v == v.trunc() && v.abs() < 1e15 {
            let _ = write!(self.out, "{}", v as i64);
        } else {
            let _ = write!(self.out, "{v}");
        }
    }

    fn name(&mut self, n: &str) {
        self.out.push(b'/');
        for &b in n.as_bytes() {
            if (0x21..=0x7e).contains(&b) && b != b'#' && !is_delimiter(b) {
                self.out.push(b);
            } else {
                let _ = write!(self.out, "#{b:02X}");
            }
        }
    }

    fn string(&mut self, s: &[u8]) {
        if self.ascii {
            self.out.push(b'<');
            for &b in s {
                let _ = write!(self.out, "{b:02X}");
            }
            self.out.push(b'>');
            return;
        }
        // Literal syntax. Binary bytes pass through; the parentheses are
        // kept balanced by escaping both of them.
        self.out.push(b'(');
        for &b in s {
            match b {
                b'(' | b')' | b'\\' => {
                    self.out.push(b'\\');
                    self.out.push(b);
                }
                b'\r' => self.raw(b"\\r"),
                _ => self.out.push(b),
            }
        }
        self.out.push(b')');
    }

    /// Stream dictionary with `/Length`, `/Filter` and `/DecodeParms`
    /// rewritten to match the body actually being written.
    fn stream_dict(
        &mut self,
        dict: NodeId,
        len: usize,
        over: Option<&(Vec<SmolStr>, Vec<NodeId>)>,
    ) {
        let GraphNode::Dict(map) = self.s.node(dict) else {
            let _ = write!(self.out, "<</Length {len}>>");
            return;
        };
        self.raw(b"<<");
        for (key, &value) in map {
            if key == "Length" {
                continue;
            }
            if over.is_some() && (key == "Filter" || key == "DecodeParms") {
                continue;
            }
            self.name(key);
            self.raw(b" ");
            self.value(value, 1);
        }
        let _ = write!(self.out, "/Length {len}");
        if let Some((names, parms)) = over {
            if !names.is_empty() {
                self.raw(b"/Filter ");
                if names.len() == 1 {
                    self.name(&names[0]);
                } else {
                    self.raw(b"[");
                    for n in names {
                        self.name(n);
                    }
                    self.raw(b"]");
                }
                if parms.iter().any(|&p| p != NodeId::NULL) {
                    self.raw(b"/DecodeParms ");
                    if parms.len() == 1 {
                        self.value(parms[0], 1);
                    } else {
                        self.raw(b"[");
                        for (i, &p) in parms.iter().enumerate() {
                            if i > 0 {
                                self.raw(b" ");
                            }
                            self.value(p, 1);
                        }
                        self.raw(b"]");
                    }
                }
            }
        }
        self.raw(b">>");
    }
}

fn emit_body(em: &mut Emitter<'_>, node: NodeId, opts: &SaveOptions) {
    match em.s.node(node) {
        GraphNode::Stream { dict, raw } => emit_stream(em, *dict, raw.as_ref(), opts),
        _ => em.value(node, 0),
    }
}

fn emit_stream(em: &mut Emitter<'_>, dict: NodeId, raw: &[u8], opts: &SaveOptions) {
    let s = em.s;
    let (body, over) = plan_stream(s, dict, raw, opts);
    let (body, over) = if opts.ascii {
        let (mut names, mut parms) = match over {
            Some(o) => o,
            None => stored_filters(s, dict),
        };
        names.insert(0, SmolStr::new("ASCIIHexDecode"));
        parms.insert(0, NodeId::NULL);
        (Cow::Owned(ahx_encode(&body)), Some((names, parms)))
    } else {
        (body, over)
    };
    em.stream_dict(dict, body.len(), over.as_ref());
    em.raw(b"\nstream\n");
    em.raw(&body);
    em.raw(b"\nendstream");
}

/// Body and filter override for one stream. `None` for the override means
/// the stored `/Filter` and `/DecodeParms` entries are still accurate.
fn plan_stream<'x>(
    s: &ObjectStore,
    dict: NodeId,
    raw: &'x [u8],
    opts: &SaveOptions,
) -> (Cow<'x, [u8]>, Option<(Vec<SmolStr>, Vec<NodeId>)>) {
    let chain = filters::filter_chain(s, dict);
    let has_image = chain.iter().any(|(n, _)| filters::is_image_filter(n));
    if opts.decompress && !chain.is_empty() && !has_image {
        match filters::decode_stream(s, dict, raw) {
            Ok(body) => return (Cow::Owned(body), Some((Vec::new(), Vec::new()))),
            Err(e) => {
                warn!(error = %e, "stream does not decode, keeping it as stored");
                return (Cow::Borrowed(raw), None);
            }
        }
    }
    if chain.is_empty() && !raw.is_empty() && wants_compression(s, dict, opts) {
        let body = filters::flate_encode(raw);
        return (
            Cow::Owned(body),
            Some((vec![SmolStr::new("FlateDecode")], vec![NodeId::NULL])),
        );
    }
    (Cow::Borrowed(raw), None)
}

/// The stored filter chain as name and parameter lists, for prepending a
/// hex layer in ascii mode.
fn stored_filters(s: &ObjectStore, dict: NodeId) -> (Vec<SmolStr>, Vec<NodeId>) {
    let names: Vec<SmolStr> = filters::filter_chain(s, dict)
        .into_iter()
        .map(|(n, _)| n)
        .collect();
    let parms_val = s.dict_get_resolved(dict, "DecodeParms");
    let mut parms: Vec<NodeId> = match s.node(parms_val) {
        GraphNode::Array(items) => items.clone(),
        GraphNode::Null => Vec::new(),
        _ => vec![parms_val],
    };
    parms.resize(names.len(), NodeId::NULL);
    (names, parms)
}

fn wants_compression(s: &ObjectStore, dict: NodeId, opts: &SaveOptions) -> bool {
    if opts.compress {
        return true;
    }
    let subtype = s.name_value(s.dict_get(dict, "Subtype")).map(|n| n.as_str());
    if opts.compress_images && subtype == Some("Image") {
        return true;
    }
    opts.compress_fonts && (is_font_stream(s, dict) || matches!(subtype, Some("Type1C" | "CIDFontType0C" | "OpenType")))
}

/// Embedded font programs carry `/Length1..3` segment sizes.
fn is_font_stream(s: &ObjectStore, dict: NodeId) -> bool {
    ["Length1", "Length2", "Length3"]
        .iter()
        .any(|key| s.dict_get(dict, key) != NodeId::NULL)
}

fn ahx_encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2 + data.len() / 32 + 1);
    for (i, &b) in data.iter().enumerate() {
        if i > 0 && i % 32 == 0 {
            out.push(b'\n');
        }
        let _ = write!(out, "{b:02X}");
    }
    out.push(b'>');
    out
}
