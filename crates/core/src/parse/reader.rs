//! Whole-file reading: header, cross-reference chains, object bodies.
//!
//! The reader walks the xref chain newest-first, so the first slot seen
//! for an object number wins, then materializes every directly-stored
//! object eagerly. Object streams are expanded separately (after
//! decryption, for encrypted files). When the chain is missing or
//! unusable the reader falls back to scanning the whole file for object
//! headers, the same objects a rebuild tool would find.

use bytes::Bytes;
use byteorder::{BigEndian, ByteOrder};
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::object::{GraphNode, NodeId, ObjectStore, XrefSlot};
use crate::parse::filters;
use crate::parse::lexer::{Lexer, Token, is_whitespace};

const MAX_PARSE_DEPTH: u32 = 512;

/// Keys that describe the xref machinery itself and never belong in the
/// merged trailer.
const TRAILER_SKIP: &[&str] = &[
    "Prev", "XRefStm", "Length", "Filter", "DecodeParms", "W", "Index", "Type", "First", "N",
];

pub(crate) struct ParsedDocument {
    pub store: ObjectStore,
    pub version: (u8, u8),
    pub startxref: u64,
    pub repaired: bool,
    /// Object numbers of xref streams; they are never encrypted.
    pub xref_stream_nums: FxHashSet<u32>,
}

pub(crate) fn read_document(data: &[u8]) -> Result<ParsedDocument> {
    let version = find_header(data).unwrap_or((1, 4));
    match read_via_xref(data) {
        Ok(mut parsed) => {
            parsed.version = version;
            Ok(parsed)
        }
        Err(e) => {
            debug!(error = %e, "xref chain unusable, scanning for objects");
            let mut parsed = read_via_scan(data)?;
            parsed.version = version;
            Ok(parsed)
        }
    }
}

fn read_via_xref(data: &[u8]) -> Result<ParsedDocument> {
    let start =
        find_startxref(data).ok_or_else(|| Error::Corrupt("startxref not found".into()))?;
    let mut store = ObjectStore::new();
    let mut trailer = IndexMap::new();
    let mut xref_stream_nums = FxHashSet::default();
    load_xref_chain(&mut store, data, start, &mut trailer, &mut xref_stream_nums)?;
    materialize_objects(&mut store, data);
    store.trailer = store.add(GraphNode::Dict(trailer));
    let root = store.dict_get_resolved(store.trailer, "Root");
    if !matches!(store.node(root), GraphNode::Dict(_)) {
        return Err(Error::Corrupt("trailer has no catalog".into()));
    }
    debug!(objects = store.xref.len(), "read xref chain");
    Ok(ParsedDocument {
        store,
        version: (1, 4),
        startxref: start as u64,
        repaired: false,
        xref_stream_nums,
    })
}

fn read_via_scan(data: &[u8]) -> Result<ParsedDocument> {
    let mut store = ObjectStore::new();
    let mut trailer = IndexMap::new();
    scan_objects(&mut store, data, &mut trailer);
    materialize_objects(&mut store, data);
    recover_root(&mut store, &mut trailer);
    let mut xref_stream_nums = FxHashSet::default();
    for (&num, slot) in store.xref.iter() {
        if let XrefSlot::Loaded { node, .. } = slot {
            if store.name_value(store.dict_get(*node, "Type")).map(|n| n.as_str()) == Some("XRef")
            {
                xref_stream_nums.insert(num);
            }
        }
    }
    store.trailer = store.add(GraphNode::Dict(trailer));
    let root = store.dict_get_resolved(store.trailer, "Root");
    if !matches!(store.node(root), GraphNode::Dict(_)) {
        return Err(Error::Corrupt("no catalog found in file".into()));
    }
    warn!(objects = store.xref.len(), "recovered document by scanning");
    Ok(ParsedDocument {
        store,
        version: (1, 4),
        startxref: 0,
        repaired: true,
        xref_stream_nums,
    })
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

fn rfind(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).rposition(|w| w == needle)
}

/// `%PDF-M.m` anywhere in the first kilobyte.
fn find_header(data: &[u8]) -> Option<(u8, u8)> {
    let window = &data[..data.len().min(1024)];
    let at = find(window, b"%PDF-")?;
    let rest = &data[at + 5..];
    let mut i = 0;
    while i < rest.len() && rest[i].is_ascii_digit() {
        i += 1;
    }
    let major: u8 = std::str::from_utf8(&rest[..i]).ok()?.parse().ok()?;
    if rest.get(i) != Some(&b'.') {
        return None;
    }
    let rest = &rest[i + 1..];
    let mut j = 0;
    while j < rest.len() && rest[j].is_ascii_digit() {
        j += 1;
    }
    let minor: u8 = std::str::from_utf8(&rest[..j]).ok()?.parse().ok()?;
    Some((major, minor))
}

/// The last `startxref NNN` in the final kilobyte.
fn find_startxref(data: &[u8]) -> Option<usize> {
    let tail_start = data.len().saturating_sub(1024);
    let tail = &data[tail_start..];
    let at = tail_start + rfind(tail, b"startxref")?;
    let rest = &data[at + 9..];
    let mut i = 0;
    while i < rest.len() && is_whitespace(rest[i]) {
        i += 1;
    }
    let mut j = i;
    while j < rest.len() && rest[j].is_ascii_digit() {
        j += 1;
    }
    if j == i {
        return None;
    }
    std::str::from_utf8(&rest[i..j]).ok()?.parse().ok()
}

fn load_xref_chain(
    store: &mut ObjectStore,
    data: &[u8],
    start: usize,
    trailer: &mut IndexMap<SmolStr, NodeId>,
    xref_stream_nums: &mut FxHashSet<u32>,
) -> Result<()> {
    let mut visited: FxHashSet<usize> = FxHashSet::default();
    let mut pos = start;
    loop {
        if !visited.insert(pos) {
            break;
        }
        if pos >= data.len() {
            return Err(Error::Corrupt(format!("xref offset {pos} past end of file")));
        }
        let at = skip_ws_at(data, pos);
        let (prev, hybrid) = if data[at..].starts_with(b"xref") {
            load_classic_xref(store, data, at, trailer)?
        } else {
            (load_xref_stream(store, data, at, trailer, xref_stream_nums)?, None)
        };
        // Hybrid files put newer entries in an xref stream the classic
        // table points at; it loses ties but fills gaps.
        if let Some(h) = hybrid {
            let h = h as usize;
            if visited.insert(h) && h < data.len() {
                if let Err(e) = load_xref_stream(store, data, h, trailer, xref_stream_nums) {
                    warn!(error = %e, "ignoring broken hybrid xref stream");
                }
            }
        }
        match prev {
            Some(p) => pos = p as usize,
            None => break,
        }
    }
    Ok(())
}

fn skip_ws_at(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() && is_whitespace(data[pos]) {
        pos += 1;
    }
    pos
}

type ClassicResult = (Option<u64>, Option<u64>);

fn load_classic_xref(
    store: &mut ObjectStore,
    data: &[u8],
    pos: usize,
    trailer: &mut IndexMap<SmolStr, NodeId>,
) -> Result<ClassicResult> {
    let mut lx = Lexer::new(data);
    lx.seek(pos);
    if !lx.next()?.is_keyword("xref") {
        return Err(Error::Syntax {
            pos,
            msg: "expected xref keyword".into(),
        });
    }
    loop {
        let t = lx.next()?;
        if t.is_keyword("trailer") {
            break;
        }
        let Token::Int(start) = t else {
            return Err(Error::Syntax {
                pos: lx.pos(),
                msg: "expected xref subsection start".into(),
            });
        };
        let Token::Int(count) = lx.next()? else {
            return Err(Error::Syntax {
                pos: lx.pos(),
                msg: "expected xref subsection count".into(),
            });
        };
        let mut base = start.max(0) as u32;
        for i in 0..count.max(0) {
            let Token::Int(offset) = lx.next()? else {
                return Err(Error::Syntax {
                    pos: lx.pos(),
                    msg: "expected xref entry offset".into(),
                });
            };
            let Token::Int(gen) = lx.next()? else {
                return Err(Error::Syntax {
                    pos: lx.pos(),
                    msg: "expected xref entry generation".into(),
                });
            };
            let marker = lx.next()?;
            let in_use = if marker.is_keyword("n") {
                true
            } else if marker.is_keyword("f") {
                false
            } else {
                return Err(Error::Syntax {
                    pos: lx.pos(),
                    msg: "expected xref entry marker".into(),
                });
            };
            // Some writers start the first subsection at 1 yet still emit
            // the object 0 free entry; shift so the entries line up.
            if i == 0 && base > 0 && !in_use && offset == 0 && gen == 65535 {
                base -= 1;
            }
            let num = base + i as u32;
            if store.xref.contains_key(&num) {
                continue;
            }
            let gen = gen.clamp(0, 65535) as u16;
            let slot = if in_use && offset >= 0 {
                XrefSlot::Offset {
                    pos: offset as u64,
                    gen,
                }
            } else {
                XrefSlot::Free { gen }
            };
            store.set_slot(num, slot);
        }
    }
    let dict = parse_value(store, &mut lx, 0)?;
    if !matches!(store.node(dict), GraphNode::Dict(_)) {
        return Err(Error::Syntax {
            pos: lx.pos(),
            msg: "expected trailer dictionary".into(),
        });
    }
    let prev = store.int_value(store.dict_get(dict, "Prev")).map(|v| v as u64);
    let hybrid = store
        .int_value(store.dict_get(dict, "XRefStm"))
        .map(|v| v as u64);
    merge_trailer(store, dict, trailer);
    Ok((prev, hybrid))
}

fn merge_trailer(
    store: &ObjectStore,
    dict: NodeId,
    trailer: &mut IndexMap<SmolStr, NodeId>,
) {
    let map = match store.node(dict) {
        GraphNode::Dict(m) => m.clone(),
        _ => return,
    };
    for (k, v) in map {
        if TRAILER_SKIP.contains(&k.as_str()) {
            continue;
        }
        trailer.entry(k).or_insert(v);
    }
}

fn load_xref_stream(
    store: &mut ObjectStore,
    data: &[u8],
    pos: usize,
    trailer: &mut IndexMap<SmolStr, NodeId>,
    xref_stream_nums: &mut FxHashSet<u32>,
) -> Result<Option<u64>> {
    let (num, gen, node) = parse_object_at(store, data, pos)?;
    let (dict, raw) = match store.node(node) {
        GraphNode::Stream { dict, raw } => (*dict, raw.clone()),
        other => {
            return Err(Error::Syntax {
                pos,
                msg: format!("expected xref stream, got {}", other.kind_name()),
            });
        }
    };
    if !store.xref.contains_key(&num) {
        store.set_slot(num, XrefSlot::Loaded { node, gen });
    }
    xref_stream_nums.insert(num);
    let content = filters::decode_stream(store, dict, &raw)?;

    let w_node = store.dict_get_resolved(dict, "W");
    let widths: Vec<usize> = match store.node(w_node) {
        GraphNode::Array(items) => items
            .iter()
            .map(|&i| store.int_value(i).unwrap_or(0).clamp(0, 8) as usize)
            .collect(),
        _ => Vec::new(),
    };
    if widths.len() < 3 {
        return Err(Error::Syntax {
            pos,
            msg: "xref stream /W must have three fields".into(),
        });
    }
    let size = store.int_value(store.dict_get(dict, "Size")).unwrap_or(0);
    let index_node = store.dict_get_resolved(dict, "Index");
    let mut ranges: Vec<(u32, u32)> = Vec::new();
    if let GraphNode::Array(items) = store.node(index_node) {
        let vals: Vec<i64> = items
            .iter()
            .map(|&i| store.int_value(i).unwrap_or(0))
            .collect();
        for pair in vals.chunks_exact(2) {
            ranges.push((pair[0].max(0) as u32, pair[1].max(0) as u32));
        }
    }
    if ranges.is_empty() {
        ranges.push((0, size.max(0) as u32));
    }

    let row_len: usize = widths.iter().sum();
    let mut off = 0usize;
    'ranges: for (start, count) in ranges {
        for i in 0..count {
            if off + row_len > content.len() {
                warn!("xref stream ends mid-subsection");
                break 'ranges;
            }
            let row = &content[off..off + row_len];
            off += row_len;
            let f1 = read_field(row, 0, widths[0]).unwrap_or(1);
            let f2 = read_field(row, widths[0], widths[1]).unwrap_or(0);
            let f3 = read_field(row, widths[0] + widths[1], widths[2]).unwrap_or(0);
            let obj = start + i;
            if store.xref.contains_key(&obj) {
                continue;
            }
            let slot = match f1 {
                0 => XrefSlot::Free {
                    gen: f3.min(65535) as u16,
                },
                1 => XrefSlot::Offset {
                    pos: f2,
                    gen: f3.min(65535) as u16,
                },
                2 => XrefSlot::InStream {
                    container: f2 as u32,
                    index: f3 as u32,
                },
                other => {
                    warn!(kind = other, obj, "unknown xref entry type");
                    continue;
                }
            };
            store.set_slot(obj, slot);
        }
    }

    let prev = store.int_value(store.dict_get(dict, "Prev")).map(|v| v as u64);
    merge_trailer(store, dict, trailer);
    Ok(prev)
}

/// Big-endian field of `width` bytes; zero width means "absent".
fn read_field(row: &[u8], at: usize, width: usize) -> Option<u64> {
    if width == 0 {
        return None;
    }
    Some(BigEndian::read_uint(&row[at..at + width], width))
}

/// Parses every object the xref lists by offset. A bad body frees the
/// slot rather than failing the whole file.
fn materialize_objects(store: &mut ObjectStore, data: &[u8]) {
    let mut pending: Vec<(u32, u64)> = store
        .xref
        .iter()
        .filter_map(|(&num, slot)| match slot {
            XrefSlot::Offset { pos, .. } => Some((num, *pos)),
            _ => None,
        })
        .collect();
    pending.sort_unstable();
    for (num, pos) in pending {
        if pos as usize >= data.len() {
            warn!(num, pos, "object offset past end of file");
            store.set_slot(num, XrefSlot::Free { gen: 0 });
            continue;
        }
        match parse_object_at(store, data, pos as usize) {
            Ok((got, gen, node)) if got == num => {
                store.set_slot(num, XrefSlot::Loaded { node, gen });
            }
            Ok((got, ..)) => {
                warn!(num, got, "object header does not match xref");
                store.set_slot(num, XrefSlot::Free { gen: 0 });
            }
            Err(e) => {
                warn!(num, error = %e, "failed to load object");
                store.set_slot(num, XrefSlot::Free { gen: 0 });
            }
        }
    }
}

/// Parses `N G obj <body>` at a byte offset, including a trailing stream
/// when one follows.
fn parse_object_at(
    store: &mut ObjectStore,
    data: &[u8],
    pos: usize,
) -> Result<(u32, u16, NodeId)> {
    let mut lx = Lexer::new(data);
    lx.seek(pos);
    let Token::Int(num) = lx.next()? else {
        return Err(Error::Syntax {
            pos,
            msg: "expected object number".into(),
        });
    };
    let Token::Int(gen) = lx.next()? else {
        return Err(Error::Syntax {
            pos,
            msg: "expected object generation".into(),
        });
    };
    if !lx.next()?.is_keyword("obj") {
        return Err(Error::Syntax {
            pos,
            msg: "expected obj keyword".into(),
        });
    }
    if num < 0 || gen < 0 || gen > 65535 {
        return Err(Error::Syntax {
            pos,
            msg: "object header out of range".into(),
        });
    }
    let value = parse_value(store, &mut lx, 0)?;
    let mark = lx.pos();
    if lx.next()?.is_keyword("stream") {
        lx.skip_stream_eol();
        let start = lx.pos();
        // /Length may be an indirect reference to an object that is not
        // materialized yet; the endstream scan covers that case.
        let end = match store.int_value(store.dict_get(value, "Length")) {
            Some(n) if n >= 0 && start + n as usize <= data.len() => {
                let cand = start + n as usize;
                if endstream_follows(data, cand) {
                    cand
                } else {
                    scan_endstream(data, start)?
                }
            }
            _ => scan_endstream(data, start)?,
        };
        let raw = Bytes::copy_from_slice(&data[start..end]);
        let stream = store.add(GraphNode::Stream { dict: value, raw });
        return Ok((num as u32, gen as u16, stream));
    }
    lx.seek(mark);
    Ok((num as u32, gen as u16, value))
}

fn endstream_follows(data: &[u8], mut pos: usize) -> bool {
    let limit = (pos + 4).min(data.len());
    while pos < limit && is_whitespace(data[pos]) {
        pos += 1;
    }
    data[pos..].starts_with(b"endstream")
}

fn scan_endstream(data: &[u8], start: usize) -> Result<usize> {
    let rel = find(&data[start..], b"endstream")
        .ok_or_else(|| Error::Corrupt("unterminated stream".into()))?;
    let mut end = start + rel;
    if end > start && data[end - 1] == b'\n' {
        end -= 1;
    }
    if end > start && data[end - 1] == b'\r' {
        end -= 1;
    }
    Ok(end)
}

/// Recursive-descent parse of one value into graph nodes.
pub(crate) fn parse_value(store: &mut ObjectStore, lx: &mut Lexer<'_>, depth: u32) -> Result<NodeId> {
    if depth > MAX_PARSE_DEPTH {
        return Err(Error::Syntax {
            pos: lx.pos(),
            msg: "objects nested too deeply".into(),
        });
    }
    match lx.next()? {
        Token::Int(a) => {
            // Three-token lookahead for `N G R` references.
            let mark = lx.pos();
            if a >= 0 && a <= u32::MAX as i64 {
                if let Token::Int(g) = lx.next().unwrap_or(Token::Eof) {
                    if (0..=65535).contains(&g) && lx.next().unwrap_or(Token::Eof).is_keyword("R")
                    {
                        return Ok(store.add(GraphNode::Ref(a as u32, g as u16)));
                    }
                }
            }
            lx.seek(mark);
            Ok(store.add(GraphNode::Int(a)))
        }
        Token::Real(v) => Ok(store.add(GraphNode::Real(v))),
        Token::Name(n) => Ok(store.add(GraphNode::Name(n))),
        Token::Str(s) => Ok(store.add(GraphNode::String(s))),
        Token::ArrayOpen => {
            let mut items = Vec::new();
            loop {
                let mark = lx.pos();
                match lx.next()? {
                    Token::ArrayClose => break,
                    Token::Eof => return Err(Error::UnexpectedEof),
                    _ => {
                        lx.seek(mark);
                        items.push(parse_value(store, lx, depth + 1)?);
                    }
                }
            }
            Ok(store.add(GraphNode::Array(items)))
        }
        Token::DictOpen => {
            let mut map = IndexMap::new();
            loop {
                match lx.next()? {
                    Token::DictClose => break,
                    Token::Name(key) => {
                        let value = parse_value(store, lx, depth + 1)?;
                        map.insert(key, value);
                    }
                    Token::Eof => return Err(Error::UnexpectedEof),
                    other => {
                        return Err(Error::Syntax {
                            pos: lx.pos(),
                            msg: format!("dictionary key must be a name, got {other:?}"),
                        });
                    }
                }
            }
            Ok(store.add(GraphNode::Dict(map)))
        }
        Token::Keyword(k) if k == "true" => Ok(store.add(GraphNode::Bool(true))),
        Token::Keyword(k) if k == "false" => Ok(store.add(GraphNode::Bool(false))),
        Token::Keyword(k) if k == "null" => Ok(NodeId::NULL),
        Token::Eof => Err(Error::UnexpectedEof),
        other => Err(Error::Syntax {
            pos: lx.pos(),
            msg: format!("unexpected token {other:?}"),
        }),
    }
}

/// Expands object streams into individual xref slots and frees the
/// container numbers. Runs after decryption so compressed objects are
/// never double-decrypted.
pub(crate) fn expand_object_streams(store: &mut ObjectStore) -> Result<()> {
    let mut containers: FxHashSet<u32> = FxHashSet::default();
    for slot in store.xref.values() {
        if let XrefSlot::InStream { container, .. } = slot {
            containers.insert(*container);
        }
    }
    // Repaired files have no type-2 entries; find containers by type.
    for (&num, slot) in store.xref.iter() {
        if let XrefSlot::Loaded { node, .. } = slot {
            if matches!(store.node(*node), GraphNode::Stream { .. })
                && store.name_value(store.dict_get(*node, "Type")).map(|n| n.as_str())
                    == Some("ObjStm")
            {
                containers.insert(num);
            }
        }
    }
    let mut containers: Vec<u32> = containers.into_iter().collect();
    containers.sort_unstable();

    for c in containers {
        let Some(node) = store.object_node(c) else {
            warn!(container = c, "object stream is missing");
            continue;
        };
        let (dict, raw) = match store.node(node) {
            GraphNode::Stream { dict, raw } => (*dict, raw.clone()),
            other => {
                warn!(container = c, kind = other.kind_name(), "object stream is not a stream");
                continue;
            }
        };
        let content = match filters::decode_stream(store, dict, &raw) {
            Ok(d) => d,
            Err(e) => {
                warn!(container = c, error = %e, "cannot decode object stream");
                continue;
            }
        };
        let n = store.int_value(store.dict_get(dict, "N")).unwrap_or(0).max(0) as usize;
        let first = store
            .int_value(store.dict_get(dict, "First"))
            .unwrap_or(0)
            .max(0) as usize;
        if first > content.len() {
            warn!(container = c, "object stream /First past end");
            continue;
        }
        let mut header = Lexer::new(&content[..first]);
        let mut pairs: Vec<(u32, usize)> = Vec::with_capacity(n);
        for _ in 0..n {
            let (Ok(Token::Int(objnum)), Ok(Token::Int(off))) = (header.next(), header.next())
            else {
                warn!(container = c, "truncated object stream header");
                break;
            };
            if objnum >= 0 && off >= 0 {
                pairs.push((objnum as u32, off as usize));
            }
        }
        for (objnum, off) in pairs {
            let bind = match store.xref.get(&objnum) {
                None | Some(XrefSlot::Free { .. }) => true,
                Some(XrefSlot::InStream { container, .. }) => *container == c,
                // A direct body or newer stream already claimed it.
                _ => false,
            };
            if !bind {
                continue;
            }
            let at = first + off;
            if at > content.len() {
                warn!(container = c, obj = objnum, "compressed object offset past end");
                continue;
            }
            let mut lx = Lexer::new(&content);
            lx.seek(at);
            match parse_value(store, &mut lx, 0) {
                Ok(value) => store.set_slot(objnum, XrefSlot::Loaded { node: value, gen: 0 }),
                Err(e) => {
                    warn!(container = c, obj = objnum, error = %e, "bad compressed object");
                    store.set_slot(objnum, XrefSlot::Free { gen: 0 });
                }
            }
        }
        store.free_object(c);
    }
    Ok(())
}

/// Scans for `N G obj` headers across the whole file, later bodies
/// superseding earlier ones, and collects trailer dictionaries.
fn scan_objects(
    store: &mut ObjectStore,
    data: &[u8],
    trailer: &mut IndexMap<SmolStr, NodeId>,
) {
    let mut found: FxHashMap<u32, u64> = FxHashMap::default();
    let mut i = 0usize;
    while let Some(rel) = find(&data[i..], b"obj") {
        let at = i + rel;
        i = at + 3;
        let after_ok = match data.get(at + 3) {
            None => true,
            Some(&b) => is_whitespace(b) || crate::parse::lexer::is_delimiter(b),
        };
        if !after_ok {
            continue;
        }
        if let Some((num, start)) = backtrack_obj_header(data, at) {
            found.insert(num, start as u64);
        }
    }
    for (num, pos) in found {
        store.set_slot(num, XrefSlot::Offset { pos, gen: 0 });
    }

    // Trailer dicts: the last one in the file wins each key.
    let mut j = 0usize;
    while let Some(rel) = find(&data[j..], b"trailer") {
        let at = j + rel;
        j = at + 7;
        let mut lx = Lexer::new(data);
        lx.seek(at + 7);
        if let Ok(dict) = parse_value(store, &mut lx, 0) {
            if let GraphNode::Dict(map) = store.node(dict) {
                let map = map.clone();
                for (k, v) in map {
                    if !TRAILER_SKIP.contains(&k.as_str()) {
                        trailer.insert(k, v);
                    }
                }
            }
        }
    }
}

/// Reads the `N G ` part backwards from an `obj` keyword.
fn backtrack_obj_header(data: &[u8], kw_pos: usize) -> Option<(u32, usize)> {
    let mut p = kw_pos;
    let e = p;
    while p > 0 && is_whitespace(data[p - 1]) {
        p -= 1;
    }
    if p == e {
        return None;
    }
    let gen_end = p;
    while p > 0 && data[p - 1].is_ascii_digit() {
        p -= 1;
    }
    if p == gen_end {
        return None;
    }
    let e = p;
    while p > 0 && is_whitespace(data[p - 1]) {
        p -= 1;
    }
    if p == e {
        return None;
    }
    let num_end = p;
    while p > 0 && data[p - 1].is_ascii_digit() {
        p -= 1;
    }
    if p == num_end {
        return None;
    }
    let num: u32 = std::str::from_utf8(&data[p..num_end]).ok()?.parse().ok()?;
    if num == 0 {
        return None;
    }
    Some((num, p))
}

/// When the scan found no usable /Root, look for a catalog among the
/// loaded objects.
fn recover_root(store: &mut ObjectStore, trailer: &mut IndexMap<SmolStr, NodeId>) {
    if let Some(&r) = trailer.get("Root") {
        if matches!(store.node(store.resolve(r)), GraphNode::Dict(_)) {
            return;
        }
    }
    let mut catalog: Option<(u32, u16)> = None;
    for (&num, slot) in store.xref.iter() {
        if let XrefSlot::Loaded { node, gen } = slot {
            if store.name_value(store.dict_get(*node, "Type")).map(|n| n.as_str())
                == Some("Catalog")
            {
                catalog = Some((num, *gen));
            }
        }
    }
    if let Some((num, gen)) = catalog {
        warn!(num, "recovered catalog by type scan");
        let r = store.add(GraphNode::Ref(num, gen));
        trailer.insert(SmolStr::new("Root"), r);
    }
}
