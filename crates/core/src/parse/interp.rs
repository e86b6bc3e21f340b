//! Content stream interpretation.
//!
//! One tolerant operator loop in the classic save/restore model drives a
//! device from page description operators. Junk operands and unknown
//! operators are skipped the way viewers treat real-world content; device
//! errors and cancellation abort the run.

use std::rc::Rc;

use bytes::Bytes;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::content::{
    ColorSpace, ColorSpaceData, Font, FontData, Image, ImageData, Path, Shade, ShadeData,
    StrokeData, StrokeState, Text, TextGlyph,
};
use crate::device::{BlendMode, NativeDevice};
use crate::document::with_document;
use crate::engine::arena::RawHandle;
use crate::engine::data::Resource;
use crate::engine::{CancelFlag, Engine, FontRequest};
use crate::error::{Error, Result};
use crate::geometry::{Color, Matrix, Point, Rect};
use crate::object::{GraphNode, NodeId, ObjectStore, decode_text};
use crate::parse::filters::{self, FilterParams};
use crate::parse::lexer::{Lexer, Token, is_delimiter, is_whitespace};

/// Nesting cap for form XObjects and tiling pattern cells.
const MAX_XOBJECT_DEPTH: u32 = 16;
/// Operand stack cap; content past this is garbage, not a deeper grammar.
const MAX_OPERANDS: usize = 128;
/// How often the cancel flag is polled, in executed operators.
const CANCEL_CHECK_INTERVAL: u64 = 32;
/// Resolution limit for /Parent chains when hunting inherited /Resources.
const MAX_PARENT_HOPS: u32 = 32;

/// Runs the content of page object `page_num` into `device`. `ctm` already
/// carries the page transform; cancellation is polled between operators.
pub(crate) fn run_page(
    engine: &Rc<Engine>,
    doc: RawHandle,
    page_num: u32,
    device: &NativeDevice,
    ctm: Matrix,
    cancel: Option<&CancelFlag>,
) -> Result<()> {
    let (content, res) = with_document(engine, doc, |d| {
        let s = &d.store;
        let page = s
            .object_node(page_num)
            .ok_or(Error::ObjectNotFound(page_num))?;
        let mut buf = Vec::new();
        gather_content(s, s.dict_get(page, "Contents"), &mut buf);
        Ok((buf, page_resources(s, page_num)))
    })?;
    debug!(page = page_num, bytes = content.len(), "running page content");

    let mut interp = Interp {
        engine,
        doc,
        dev: device,
        cancel,
        gs: GState::new(ctm),
        stack: Vec::new(),
        fonts: FxHashMap::default(),
        path: None,
        pending_clip: None,
        tm: Matrix::IDENTITY,
        tlm: Matrix::IDENTITY,
        clip_text: None,
        ops_run: 0,
        xobject_depth: 0,
    };
    interp.execute(&content, res)?;
    interp.finish()
}

/// Concatenates the streams under /Contents, newline-separated so operators
/// split across stream boundaries still lex. Undecodable streams are skipped.
fn gather_content(s: &ObjectStore, contents: NodeId, out: &mut Vec<u8>) {
    let node = s.resolve(contents);
    match s.node(node) {
        GraphNode::Stream { dict, raw } => match filters::decode_stream(s, *dict, raw) {
            Ok(data) => {
                out.extend_from_slice(&data);
                out.push(b'\n');
            }
            Err(e) => warn!(error = %e, "skipping undecodable content stream"),
        },
        GraphNode::Array(items) => {
            for item in items {
                gather_content(s, *item, out);
            }
        }
        _ => {}
    }
}

/// /Resources for a page, walking /Parent when the page inherits it.
fn page_resources(s: &ObjectStore, page_num: u32) -> NodeId {
    let mut cur = match s.object_node(page_num) {
        Some(n) => n,
        None => return NodeId::NULL,
    };
    for _ in 0..MAX_PARENT_HOPS {
        let res = s.dict_get_resolved(cur, "Resources");
        if res != NodeId::NULL {
            return res;
        }
        let parent = s.dict_get_resolved(cur, "Parent");
        if parent == NodeId::NULL {
            break;
        }
        cur = parent;
    }
    NodeId::NULL
}

/// An operand on the content stack, already parsed into a plain value.
#[derive(Debug, Clone)]
enum Operand {
    Num(f64),
    Name(SmolStr),
    Str(Vec<u8>),
    Bool(bool),
    Null,
    Array(Vec<Operand>),
    Dict(IndexMap<SmolStr, Operand>),
}

impl Operand {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Operand::Num(v) => Some(*v),
            _ => None,
        }
    }
}

/// Builds an operand from a token, consuming nested array and dict bodies.
fn parse_operand(lx: &mut Lexer<'_>, t: Token) -> Result<Operand> {
    Ok(match t {
        Token::Int(v) => Operand::Num(v as f64),
        Token::Real(v) => Operand::Num(v),
        Token::Name(n) => Operand::Name(n),
        Token::Str(s) => Operand::Str(s),
        Token::ArrayOpen => {
            let mut items = Vec::new();
            loop {
                match lx.next()? {
                    Token::ArrayClose | Token::Eof => break,
                    inner => items.push(parse_operand(lx, inner)?),
                }
            }
            Operand::Array(items)
        }
        Token::DictOpen => {
            let mut map = IndexMap::new();
            loop {
                match lx.next()? {
                    Token::DictClose | Token::Eof => break,
                    Token::Name(key) => match lx.next()? {
                        Token::DictClose | Token::Eof => break,
                        inner => {
                            let v = parse_operand(lx, inner)?;
                            map.insert(key, v);
                        }
                    },
                    _ => {}
                }
            }
            Operand::Dict(map)
        }
        Token::Keyword(k) if k == "true" => Operand::Bool(true),
        Token::Keyword(k) if k == "false" => Operand::Bool(false),
        _ => Operand::Null,
    })
}

/// The last `N` operands as numbers, PDF postfix style.
fn take<const N: usize>(ops: &[Operand]) -> Option<[f64; N]> {
    if ops.len() < N {
        return None;
    }
    let mut out = [0.0; N];
    for (slot, op) in out.iter_mut().zip(&ops[ops.len() - N..]) {
        *slot = op.as_f64()?;
    }
    Some(out)
}

/// A colorspace shape: enough structure to turn operand components into a
/// device color. Anything calibrated collapses onto its device analogue.
#[derive(Debug, Clone)]
enum CsKind {
    Gray,
    Rgb,
    Cmyk,
    Indexed {
        base: Box<CsKind>,
        hival: i64,
        lookup: Rc<Vec<u8>>,
    },
    /// Separation and DeviceN, painted through a tint approximation.
    Tint { base: Box<CsKind>, n: usize },
    Pattern,
}

impl CsKind {
    fn ncomp(&self) -> usize {
        match self {
            CsKind::Gray | CsKind::Indexed { .. } | CsKind::Pattern => 1,
            CsKind::Rgb => 3,
            CsKind::Cmyk => 4,
            CsKind::Tint { n, .. } => (*n).max(1),
        }
    }

    /// Initial color per colorspace family: black everywhere.
    fn initial_ops(&self) -> SmallVec<[f64; 4]> {
        match self {
            CsKind::Gray | CsKind::Indexed { .. } => SmallVec::from_slice(&[0.0]),
            CsKind::Rgb => SmallVec::from_slice(&[0.0, 0.0, 0.0]),
            CsKind::Cmyk => SmallVec::from_slice(&[0.0, 0.0, 0.0, 1.0]),
            CsKind::Tint { n, .. } => {
                let mut v = SmallVec::new();
                v.resize((*n).max(1), 1.0);
                v
            }
            CsKind::Pattern => SmallVec::new(),
        }
    }

    fn color(&self, ops: &[f64]) -> Color {
        fn at(ops: &[f64], i: usize) -> f64 {
            ops.get(i).copied().unwrap_or(0.0)
        }
        match self {
            CsKind::Gray => Color::Gray(at(ops, 0)),
            CsKind::Rgb => Color::Rgb(at(ops, 0), at(ops, 1), at(ops, 2)),
            CsKind::Cmyk => Color::Cmyk(at(ops, 0), at(ops, 1), at(ops, 2), at(ops, 3)),
            CsKind::Indexed { base, hival, lookup } => {
                let idx = (at(ops, 0).round() as i64).clamp(0, (*hival).max(0)) as usize;
                let n = base.ncomp().min(4);
                let mut vals = [0.0f64; 4];
                for (k, slot) in vals.iter_mut().take(n).enumerate() {
                    *slot = lookup
                        .get(idx * n + k)
                        .map(|&b| f64::from(b) / 255.0)
                        .unwrap_or(0.0);
                }
                base.color(&vals[..n])
            }
            CsKind::Tint { base, .. } => {
                let t = ops.iter().copied().fold(0.0f64, f64::max).clamp(0.0, 1.0);
                match &**base {
                    CsKind::Cmyk => Color::Cmyk(0.0, 0.0, 0.0, t),
                    CsKind::Rgb => Color::Rgb(1.0 - t, 1.0 - t, 1.0 - t),
                    _ => Color::Gray(1.0 - t),
                }
            }
            CsKind::Pattern => Color::Gray(0.0),
        }
    }
}

/// A colorspace from its defining object. Unknown families paint gray.
fn cs_from_node(s: &ObjectStore, node: NodeId, depth: u32) -> CsKind {
    if depth > 4 {
        return CsKind::Gray;
    }
    let node = s.resolve(node);
    if let Some(name) = s.name_value(node) {
        return match name.as_str() {
            "DeviceRGB" | "CalRGB" | "Lab" | "RGB" => CsKind::Rgb,
            "DeviceCMYK" | "CMYK" => CsKind::Cmyk,
            "Pattern" => CsKind::Pattern,
            _ => CsKind::Gray,
        };
    }
    let family = match s.name_value(s.array_get(node, 0)) {
        Some(f) => f.clone(),
        None => return CsKind::Gray,
    };
    match family.as_str() {
        "ICCBased" => {
            let n = s
                .int_value(s.dict_get(s.array_get(node, 1), "N"))
                .unwrap_or(3);
            match n {
                1 => CsKind::Gray,
                4 => CsKind::Cmyk,
                _ => CsKind::Rgb,
            }
        }
        "Indexed" | "I" => {
            let base = Box::new(cs_from_node(s, s.array_get(node, 1), depth + 1));
            let hival = s.int_value(s.array_get(node, 2)).unwrap_or(0).clamp(0, 255);
            let table = s.resolve(s.array_get(node, 3));
            let lookup = match s.node(table) {
                GraphNode::String(bytes) => Rc::new(bytes.clone()),
                GraphNode::Stream { dict, raw } => Rc::new(
                    filters::decode_stream(s, *dict, raw).unwrap_or_default(),
                ),
                _ => Rc::new(Vec::new()),
            };
            CsKind::Indexed { base, hival, lookup }
        }
        "Separation" => CsKind::Tint {
            base: Box::new(cs_from_node(s, s.array_get(node, 2), depth + 1)),
            n: 1,
        },
        "DeviceN" => CsKind::Tint {
            base: Box::new(cs_from_node(s, s.array_get(node, 2), depth + 1)),
            n: s.array_len(s.array_get(node, 1)).max(1),
        },
        "CalRGB" | "Lab" => CsKind::Rgb,
        "Pattern" => CsKind::Pattern,
        _ => CsKind::Gray,
    }
}

fn matrix_from(s: &ObjectStore, arr: NodeId) -> Option<Matrix> {
    if s.array_len(arr) < 6 {
        return None;
    }
    let mut v = [0.0f64; 6];
    for (i, slot) in v.iter_mut().enumerate() {
        *slot = s.real_value(s.array_get(arr, i))?;
    }
    Some(Matrix::new(v[0], v[1], v[2], v[3], v[4], v[5]))
}

fn rect_from(s: &ObjectStore, arr: NodeId) -> Option<Rect> {
    if s.array_len(arr) < 4 {
        return None;
    }
    let mut v = [0.0f64; 4];
    for (i, slot) in v.iter_mut().enumerate() {
        *slot = s.real_value(s.array_get(arr, i))?;
    }
    Some(Rect::new(
        v[0].min(v[2]),
        v[1].min(v[3]),
        v[0].max(v[2]),
        v[1].max(v[3]),
    ))
}

/// Everything q/Q saves. `clip_depth` counts device clips pushed since the
/// run began so restore knows how many to pop.
#[derive(Clone)]
struct GState {
    ctm: Matrix,
    stroke: StrokeData,
    fill_cs: CsKind,
    fill_ops: SmallVec<[f64; 4]>,
    fill_pattern: Option<SmolStr>,
    stroke_cs: CsKind,
    stroke_ops: SmallVec<[f64; 4]>,
    stroke_pattern: Option<SmolStr>,
    fill_alpha: f64,
    stroke_alpha: f64,
    blend: BlendMode,
    clip_depth: u32,
    font: Option<NodeId>,
    size: f64,
    char_spacing: f64,
    word_spacing: f64,
    hscale: f64,
    leading: f64,
    rise: f64,
    render_mode: u8,
}

impl GState {
    fn new(ctm: Matrix) -> GState {
        GState {
            ctm,
            stroke: StrokeData::default(),
            fill_cs: CsKind::Gray,
            fill_ops: SmallVec::from_slice(&[0.0]),
            fill_pattern: None,
            stroke_cs: CsKind::Gray,
            stroke_ops: SmallVec::from_slice(&[0.0]),
            stroke_pattern: None,
            fill_alpha: 1.0,
            stroke_alpha: 1.0,
            blend: BlendMode::Normal,
            clip_depth: 0,
            font: None,
            size: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            hscale: 1.0,
            leading: 0.0,
            rise: 0.0,
            render_mode: 0,
        }
    }
}

struct CachedFont {
    font: Font,
    /// Type0 fonts consume two bytes per code.
    two_byte: bool,
}

struct Interp<'a> {
    engine: &'a Rc<Engine>,
    doc: RawHandle,
    dev: &'a NativeDevice,
    cancel: Option<&'a CancelFlag>,
    gs: GState,
    stack: Vec<GState>,
    /// Fonts keyed by their resolved dictionary node.
    fonts: FxHashMap<NodeId, CachedFont>,
    path: Option<Path>,
    /// Set by W/W*, applied by the next painting operator.
    pending_clip: Option<bool>,
    tm: Matrix,
    tlm: Matrix,
    /// Accumulates glyphs from clipping render modes until ET.
    clip_text: Option<Text>,
    ops_run: u64,
    xobject_depth: u32,
}

impl<'a> Interp<'a> {
    fn execute(&mut self, content: &[u8], res: NodeId) -> Result<()> {
        if let Some(c) = self.cancel {
            c.check()?;
        }
        let mut lx = Lexer::new(content);
        let mut operands: Vec<Operand> = Vec::new();
        loop {
            let t = match lx.next() {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "content lex error, stopping stream");
                    break;
                }
            };
            match t {
                Token::Eof => break,
                Token::Keyword(k) => match k.as_str() {
                    "true" => operands.push(Operand::Bool(true)),
                    "false" => operands.push(Operand::Bool(false)),
                    "null" => operands.push(Operand::Null),
                    op => {
                        self.ops_run += 1;
                        if let Some(c) = self.cancel {
                            c.bump_progress();
                            if self.ops_run % CANCEL_CHECK_INTERVAL == 0 {
                                c.check()?;
                            }
                        }
                        self.op(op, &operands, &mut lx, res)?;
                        operands.clear();
                    }
                },
                other => {
                    if operands.len() >= MAX_OPERANDS {
                        warn!("content operand stack overflow");
                        operands.clear();
                    }
                    match parse_operand(&mut lx, other) {
                        Ok(v) => operands.push(v),
                        Err(e) => {
                            warn!(error = %e, "content operand error, stopping stream");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Pops every clip still outstanding and drops per-run scratch state.
    /// Not called when a device error aborted the run; an aborted replay
    /// receives no further operations.
    fn finish(&mut self) -> Result<()> {
        if let Some(t) = self.clip_text.take() {
            t.destroy();
        }
        if let Some(p) = self.path.take() {
            p.destroy();
        }
        self.stack.clear();
        while self.gs.clip_depth > 0 {
            self.dev.pop_clip()?;
            self.gs.clip_depth -= 1;
        }
        for (_, cached) in self.fonts.drain() {
            cached.font.destroy();
        }
        Ok(())
    }

    fn op(&mut self, op: &str, ops: &[Operand], lx: &mut Lexer<'_>, res: NodeId) -> Result<()> {
        match op {
            "q" => {
                self.stack.push(self.gs.clone());
                Ok(())
            }
            "Q" => self.restore(),
            "cm" => {
                if let Some([a, b, c, d, e, f]) = take::<6>(ops) {
                    self.gs.ctm = Matrix::new(a, b, c, d, e, f).concat(self.gs.ctm);
                }
                Ok(())
            }

            "w" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.stroke.line_width = v;
                }
                Ok(())
            }
            "J" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.stroke.line_cap = (v as i64).clamp(0, 2) as u8;
                }
                Ok(())
            }
            "j" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.stroke.line_join = (v as i64).clamp(0, 2) as u8;
                }
                Ok(())
            }
            "M" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.stroke.miter_limit = v;
                }
                Ok(())
            }
            "d" => {
                if ops.len() >= 2 {
                    if let (Operand::Array(items), Some(phase)) =
                        (&ops[ops.len() - 2], ops[ops.len() - 1].as_f64())
                    {
                        self.gs.stroke.dashes =
                            items.iter().filter_map(Operand::as_f64).collect();
                        self.gs.stroke.dash_phase = phase;
                    }
                }
                Ok(())
            }
            "gs" => {
                if let Some(Operand::Name(name)) = ops.last() {
                    let name = name.clone();
                    self.ext_gstate(res, &name)?;
                }
                Ok(())
            }
            // Rendering intent and flatness have no effect here.
            "ri" | "i" => Ok(()),

            "m" => {
                if let Some([x, y]) = take::<2>(ops) {
                    self.cur_path().move_to(Point::new(x, y))?;
                }
                Ok(())
            }
            "l" => {
                if let Some([x, y]) = take::<2>(ops) {
                    self.cur_path().line_to(Point::new(x, y))?;
                }
                Ok(())
            }
            "c" => {
                if let Some([x1, y1, x2, y2, x3, y3]) = take::<6>(ops) {
                    self.cur_path().curve_to(
                        Point::new(x1, y1),
                        Point::new(x2, y2),
                        Point::new(x3, y3),
                    )?;
                }
                Ok(())
            }
            "v" => {
                if let Some([x2, y2, x3, y3]) = take::<4>(ops) {
                    let p = self.cur_path();
                    let cur = p.current_point().unwrap_or(Point::ORIGIN);
                    p.curve_to(cur, Point::new(x2, y2), Point::new(x3, y3))?;
                }
                Ok(())
            }
            "y" => {
                if let Some([x1, y1, x3, y3]) = take::<4>(ops) {
                    let end = Point::new(x3, y3);
                    self.cur_path().curve_to(Point::new(x1, y1), end, end)?;
                }
                Ok(())
            }
            "h" => {
                self.cur_path().close()?;
                Ok(())
            }
            "re" => {
                if let Some([x, y, w, h]) = take::<4>(ops) {
                    self.cur_path().rect(Rect::new(x, y, x + w, y + h))?;
                }
                Ok(())
            }

            "W" => {
                self.pending_clip = Some(false);
                Ok(())
            }
            "W*" => {
                self.pending_clip = Some(true);
                Ok(())
            }
            "S" => self.paint_path(false, false, true, false, res),
            "s" => self.paint_path(false, false, true, true, res),
            "f" | "F" => self.paint_path(true, false, false, false, res),
            "f*" => self.paint_path(true, true, false, false, res),
            "B" => self.paint_path(true, false, true, false, res),
            "B*" => self.paint_path(true, true, true, false, res),
            "b" => self.paint_path(true, false, true, true, res),
            "b*" => self.paint_path(true, true, true, true, res),
            "n" => self.paint_path(false, false, false, false, res),

            "g" => {
                if let Some([v]) = take::<1>(ops) {
                    self.set_fill(CsKind::Gray, &[v]);
                }
                Ok(())
            }
            "G" => {
                if let Some([v]) = take::<1>(ops) {
                    self.set_stroke(CsKind::Gray, &[v]);
                }
                Ok(())
            }
            "rg" => {
                if let Some(v) = take::<3>(ops) {
                    self.set_fill(CsKind::Rgb, &v);
                }
                Ok(())
            }
            "RG" => {
                if let Some(v) = take::<3>(ops) {
                    self.set_stroke(CsKind::Rgb, &v);
                }
                Ok(())
            }
            "k" => {
                if let Some(v) = take::<4>(ops) {
                    self.set_fill(CsKind::Cmyk, &v);
                }
                Ok(())
            }
            "K" => {
                if let Some(v) = take::<4>(ops) {
                    self.set_stroke(CsKind::Cmyk, &v);
                }
                Ok(())
            }
            "cs" => {
                if let Some(Operand::Name(name)) = ops.last() {
                    let kind = self.lookup_colorspace(res, name);
                    self.gs.fill_ops = kind.initial_ops();
                    self.gs.fill_cs = kind;
                    self.gs.fill_pattern = None;
                }
                Ok(())
            }
            "CS" => {
                if let Some(Operand::Name(name)) = ops.last() {
                    let kind = self.lookup_colorspace(res, name);
                    self.gs.stroke_ops = kind.initial_ops();
                    self.gs.stroke_cs = kind;
                    self.gs.stroke_pattern = None;
                }
                Ok(())
            }
            "sc" => {
                self.gs.fill_ops = ops.iter().filter_map(Operand::as_f64).collect();
                Ok(())
            }
            "SC" => {
                self.gs.stroke_ops = ops.iter().filter_map(Operand::as_f64).collect();
                Ok(())
            }
            "scn" => {
                if let Some(Operand::Name(name)) = ops.last() {
                    self.gs.fill_pattern = Some(name.clone());
                } else {
                    self.gs.fill_pattern = None;
                }
                self.gs.fill_ops = ops.iter().filter_map(Operand::as_f64).collect();
                Ok(())
            }
            "SCN" => {
                if let Some(Operand::Name(name)) = ops.last() {
                    self.gs.stroke_pattern = Some(name.clone());
                } else {
                    self.gs.stroke_pattern = None;
                }
                self.gs.stroke_ops = ops.iter().filter_map(Operand::as_f64).collect();
                Ok(())
            }

            "BT" => {
                self.tm = Matrix::IDENTITY;
                self.tlm = Matrix::IDENTITY;
                Ok(())
            }
            "ET" => self.end_text(),
            "Tc" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.char_spacing = v;
                }
                Ok(())
            }
            "Tw" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.word_spacing = v;
                }
                Ok(())
            }
            "Tz" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.hscale = v / 100.0;
                }
                Ok(())
            }
            "TL" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.leading = v;
                }
                Ok(())
            }
            "Ts" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.rise = v;
                }
                Ok(())
            }
            "Tr" => {
                if let Some([v]) = take::<1>(ops) {
                    self.gs.render_mode = (v as i64).clamp(0, 7) as u8;
                }
                Ok(())
            }
            "Tf" => {
                let (name, size) = match ops {
                    [.., Operand::Name(n), Operand::Num(s)] => (n.clone(), *s),
                    _ => {
                        warn!("malformed Tf operands");
                        return Ok(());
                    }
                };
                self.gs.size = size;
                let node = self.res_child(res, "Font", &name)?;
                if node == NodeId::NULL {
                    warn!(font = %name, "font resource missing");
                    self.gs.font = None;
                    return Ok(());
                }
                self.ensure_font(node)?;
                self.gs.font = self.fonts.contains_key(&node).then_some(node);
                Ok(())
            }
            "Td" => {
                if let Some([tx, ty]) = take::<2>(ops) {
                    self.tlm = Matrix::translate(tx, ty).concat(self.tlm);
                    self.tm = self.tlm;
                }
                Ok(())
            }
            "TD" => {
                if let Some([tx, ty]) = take::<2>(ops) {
                    self.gs.leading = -ty;
                    self.tlm = Matrix::translate(tx, ty).concat(self.tlm);
                    self.tm = self.tlm;
                }
                Ok(())
            }
            "Tm" => {
                if let Some([a, b, c, d, e, f]) = take::<6>(ops) {
                    self.tlm = Matrix::new(a, b, c, d, e, f);
                    self.tm = self.tlm;
                }
                Ok(())
            }
            "T*" => {
                self.next_line();
                Ok(())
            }
            "Tj" => {
                if let Some(Operand::Str(s)) = ops.last() {
                    self.show_text(s)?;
                }
                Ok(())
            }
            "TJ" => {
                let Some(Operand::Array(items)) = ops.last() else {
                    return Ok(());
                };
                for item in items {
                    match item {
                        Operand::Str(s) => self.show_text(s)?,
                        Operand::Num(n) => {
                            let tx = -n / 1000.0 * self.gs.size * self.gs.hscale;
                            self.tm = Matrix::translate(tx, 0.0).concat(self.tm);
                        }
                        _ => {}
                    }
                }
                Ok(())
            }
            "'" => {
                self.next_line();
                if let Some(Operand::Str(s)) = ops.last() {
                    self.show_text(s)?;
                }
                Ok(())
            }
            "\"" => {
                if ops.len() >= 3 {
                    if let (Some(aw), Some(ac)) =
                        (ops[ops.len() - 3].as_f64(), ops[ops.len() - 2].as_f64())
                    {
                        self.gs.word_spacing = aw;
                        self.gs.char_spacing = ac;
                    }
                }
                self.next_line();
                if let Some(Operand::Str(s)) = ops.last() {
                    self.show_text(s)?;
                }
                Ok(())
            }

            "Do" => {
                let Some(Operand::Name(name)) = ops.last() else {
                    return Ok(());
                };
                let name = name.clone();
                let node = self.res_child(res, "XObject", &name)?;
                if node == NodeId::NULL {
                    warn!(name = %name, "xobject not found");
                    return Ok(());
                }
                let subtype = with_document(self.engine, self.doc, |d| {
                    Ok(d.store.name_value(d.store.dict_get(node, "Subtype")).cloned())
                })?;
                match subtype.as_deref() {
                    Some("Image") => self.draw_image(node),
                    Some("Form") => self.run_form(node, res),
                    other => {
                        debug!(subtype = ?other, "skipping xobject");
                        Ok(())
                    }
                }
            }
            "BI" => self.inline_image(lx, res),
            "sh" => {
                let Some(Operand::Name(name)) = ops.last() else {
                    return Ok(());
                };
                let node = self.res_child(res, "Shading", name)?;
                if node == NodeId::NULL {
                    warn!(name = %name, "shading not found");
                    return Ok(());
                }
                let shade = self.build_shade(node)?;
                let r = self.dev.fill_shade(&shade, self.gs.ctm, self.gs.fill_alpha);
                shade.destroy();
                r
            }

            "BMC" => {
                if let Some(Operand::Name(tag)) = ops.last() {
                    self.dev.begin_layer(tag)?;
                }
                Ok(())
            }
            "BDC" => self.begin_marked(ops, res),
            "EMC" => self.dev.end_layer(),
            // Marked-content points and Type 3 glyph metrics carry no paint.
            "MP" | "DP" | "d0" | "d1" | "BX" | "EX" => Ok(()),

            other => {
                debug!(op = other, "skipping unknown operator");
                Ok(())
            }
        }
    }

    fn restore(&mut self) -> Result<()> {
        let Some(prev) = self.stack.pop() else {
            warn!("unbalanced restore in content");
            return Ok(());
        };
        while self.gs.clip_depth > prev.clip_depth {
            self.dev.pop_clip()?;
            self.gs.clip_depth -= 1;
        }
        self.gs = prev;
        Ok(())
    }

    fn cur_path(&mut self) -> &Path {
        let engine = self.engine;
        self.path.get_or_insert_with(|| Path::new(engine))
    }

    fn set_fill(&mut self, cs: CsKind, ops: &[f64]) {
        self.gs.fill_cs = cs;
        self.gs.fill_ops = SmallVec::from_slice(ops);
        self.gs.fill_pattern = None;
    }

    fn set_stroke(&mut self, cs: CsKind, ops: &[f64]) {
        self.gs.stroke_cs = cs;
        self.gs.stroke_ops = SmallVec::from_slice(ops);
        self.gs.stroke_pattern = None;
    }

    /// Resolves a named colorspace. Device names short-circuit; the rest go
    /// through the resource dictionary.
    fn lookup_colorspace(&self, res: NodeId, name: &str) -> CsKind {
        match name {
            "DeviceGray" | "CalGray" | "G" => return CsKind::Gray,
            "DeviceRGB" | "CalRGB" | "Lab" | "RGB" => return CsKind::Rgb,
            "DeviceCMYK" | "CMYK" => return CsKind::Cmyk,
            "Pattern" => return CsKind::Pattern,
            _ => {}
        }
        let looked = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let cat = s.dict_get_resolved(res, "ColorSpace");
            Ok(cs_from_node(s, s.dict_get(cat, name), 0))
        });
        match looked {
            Ok(kind) => kind,
            Err(e) => {
                warn!(name, error = %e, "colorspace lookup failed");
                CsKind::Gray
            }
        }
    }

    /// Color plus a matching device colorspace wrapper for a device call.
    /// The caller destroys the wrapper once the call returns.
    fn brush(&self, cs: &CsKind, ops: &[f64]) -> (ColorSpace, Color) {
        let color = cs.color(ops);
        let wrapper = match color {
            Color::Gray(_) => ColorSpace::device_gray(self.engine),
            Color::Rgb(..) => ColorSpace::device_rgb(self.engine),
            Color::Cmyk(..) => ColorSpace::device_cmyk(self.engine),
        };
        (wrapper, color)
    }

    fn res_child(&self, res: NodeId, category: &str, name: &str) -> Result<NodeId> {
        with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            Ok(s.dict_get_resolved(s.dict_get_resolved(res, category), name))
        })
    }

    /// Paints the current path, then applies any pending clip. The path is
    /// consumed either way; `n` with a pending clip is the bare-clip idiom.
    fn paint_path(
        &mut self,
        fill: bool,
        even_odd: bool,
        stroke: bool,
        close: bool,
        res: NodeId,
    ) -> Result<()> {
        let Some(path) = self.path.take() else {
            self.pending_clip = None;
            return Ok(());
        };
        let ctm = self.gs.ctm;
        let r = (|| -> Result<()> {
            if close {
                path.close()?;
            }
            if fill {
                if matches!(self.gs.fill_cs, CsKind::Pattern) {
                    if let Some(name) = self.gs.fill_pattern.clone() {
                        self.run_pattern(&path, even_odd, &name, res)?;
                    }
                } else {
                    let (cs, color) = self.brush(&self.gs.fill_cs, &self.gs.fill_ops);
                    let r = self
                        .dev
                        .fill_path(&path, even_odd, ctm, &cs, &color, self.gs.fill_alpha);
                    cs.destroy();
                    r?;
                }
            }
            if stroke {
                let ss = StrokeState::new(self.engine, self.gs.stroke.clone());
                let (cs, color) = if matches!(self.gs.stroke_cs, CsKind::Pattern) {
                    // Stroked patterns paint flat; the tile machinery only
                    // runs for fills.
                    (ColorSpace::device_gray(self.engine), Color::Gray(0.0))
                } else {
                    self.brush(&self.gs.stroke_cs, &self.gs.stroke_ops)
                };
                let r = self
                    .dev
                    .stroke_path(&path, &ss, ctm, &cs, &color, self.gs.stroke_alpha);
                ss.destroy();
                cs.destroy();
                r?;
            }
            if let Some(clip_eo) = self.pending_clip.take() {
                let scissor = path.bounds(ctm)?;
                self.dev.clip_path(&path, clip_eo, ctm, scissor)?;
                self.gs.clip_depth += 1;
            }
            Ok(())
        })();
        path.destroy();
        r
    }

    /// Fill through a pattern: clip to the path, run the pattern paint,
    /// release the clip.
    fn run_pattern(
        &mut self,
        path: &Path,
        even_odd: bool,
        name: &SmolStr,
        res: NodeId,
    ) -> Result<()> {
        let node = self.res_child(res, "Pattern", name)?;
        if node == NodeId::NULL {
            warn!(name = %name, "pattern not found");
            return Ok(());
        }
        let kind = with_document(self.engine, self.doc, |d| {
            Ok(d.store
                .int_value(d.store.dict_get(node, "PatternType"))
                .unwrap_or(1))
        })?;
        let ctm = self.gs.ctm;
        let scissor = path.bounds(ctm)?;
        self.dev.clip_path(path, even_odd, ctm, scissor)?;
        let body = if kind == 2 {
            self.shading_pattern(node)
        } else {
            self.run_tiling(node, res)
        };
        body?;
        self.dev.pop_clip()
    }

    fn shading_pattern(&mut self, node: NodeId) -> Result<()> {
        let (shading, matrix) = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            Ok((
                s.dict_get_resolved(node, "Shading"),
                matrix_from(s, s.dict_get_resolved(node, "Matrix")).unwrap_or(Matrix::IDENTITY),
            ))
        })?;
        if shading == NodeId::NULL {
            return Ok(());
        }
        let shade = self.build_shade(shading)?;
        let r = self
            .dev
            .fill_shade(&shade, matrix.concat(self.gs.ctm), self.gs.fill_alpha);
        shade.destroy();
        r
    }

    fn run_tiling(&mut self, node: NodeId, inherited_res: NodeId) -> Result<()> {
        if self.xobject_depth >= MAX_XOBJECT_DEPTH {
            warn!("tiling pattern nested too deep");
            return Ok(());
        }
        let built = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let GraphNode::Stream { dict, raw } = s.node(s.resolve(node)) else {
                return Ok(None);
            };
            let content = match filters::decode_stream(s, *dict, raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "pattern content undecodable");
                    return Ok(None);
                }
            };
            Ok(Some((
                content,
                rect_from(s, s.dict_get_resolved(node, "BBox")),
                matrix_from(s, s.dict_get_resolved(node, "Matrix")).unwrap_or(Matrix::IDENTITY),
                s.dict_get_resolved(node, "Resources"),
                s.real_value(s.dict_get(node, "XStep")),
                s.real_value(s.dict_get(node, "YStep")),
            )))
        })?;
        let Some((content, bbox, matrix, pres, xstep, ystep)) = built else {
            return Ok(());
        };
        let Some(bbox) = bbox else {
            warn!("tiling pattern without bbox");
            return Ok(());
        };
        let xstep = xstep.unwrap_or_else(|| bbox.width());
        let ystep = ystep.unwrap_or_else(|| bbox.height());
        let ptm = matrix.concat(self.gs.ctm);
        let cached = self.dev.begin_tile(bbox, bbox, xstep, ystep, ptm, 0)?;
        if cached == 0 {
            let saved_path = self.path.take();
            let saved_clip = self.pending_clip.take();
            self.stack.push(self.gs.clone());
            self.gs.ctm = ptm;
            // Cell content starts from default colors; carrying the pattern
            // brush into the cell would re-enter it.
            self.set_fill(CsKind::Gray, &[0.0]);
            self.set_stroke(CsKind::Gray, &[0.0]);
            self.xobject_depth += 1;
            let res = if pres != NodeId::NULL { pres } else { inherited_res };
            let run = self.execute(&content, res);
            self.xobject_depth -= 1;
            let out = match run {
                Ok(()) => self.restore(),
                Err(e) => {
                    self.stack.pop();
                    Err(e)
                }
            };
            self.path = saved_path;
            self.pending_clip = saved_clip;
            out?;
        }
        self.dev.end_tile()
    }

    fn build_shade(&self, node: NodeId) -> Result<Shade> {
        let (kind, bounds) = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let kind = s
                .int_value(s.dict_get(node, "ShadingType"))
                .unwrap_or(0)
                .clamp(0, 255) as u8;
            let bounds = rect_from(s, s.dict_get_resolved(node, "BBox")).unwrap_or(Rect::INFINITE);
            Ok((kind, bounds))
        })?;
        // The shade resource holds a reference on the document it reads.
        self.engine.retain(self.doc)?;
        Ok(Shade::adopt(
            self.engine,
            ShadeData {
                doc: self.doc,
                node,
                kind,
                bounds,
            },
        ))
    }

    fn ensure_font(&mut self, node: NodeId) -> Result<()> {
        if self.fonts.contains_key(&node) {
            return Ok(());
        }
        let built =
            with_document(self.engine, self.doc, |d| Ok(build_font_data(&d.store, node)))?;
        let Some((mut fd, two_byte)) = built else {
            warn!(node = node.0, "unusable font dictionary");
            return Ok(());
        };
        if fd.data.is_none() {
            let req = FontRequest {
                name: fd.name.to_string(),
                script: None,
                bold: fd.bold,
                italic: fd.italic,
            };
            if let Some(bytes) = self.engine.request_font(&req) {
                fd.data = Some(Bytes::from(bytes));
            }
        }
        let font = Font::adopt(self.engine, fd);
        self.fonts.insert(node, CachedFont { font, two_byte });
        Ok(())
    }

    fn next_line(&mut self) {
        self.tlm = Matrix::translate(0.0, -self.gs.leading).concat(self.tlm);
        self.tm = self.tlm;
    }

    /// Shows one string: builds a span at the current text matrix, paints
    /// it per the render mode, and advances the pen. Glyph positions are in
    /// em units; the span matrix carries size, horizontal scale and rise.
    fn show_text(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(font_node) = self.gs.font else {
            return Ok(());
        };
        let (font, two_byte) = {
            let Some(cached) = self.fonts.get(&font_node) else {
                return Ok(());
            };
            (cached.font.keep()?, cached.two_byte)
        };
        let mode = self.gs.render_mode;
        let size = self.gs.size;
        let div = if size.abs() > 1e-9 { size } else { 1.0 };
        let ctm = self.gs.ctm;
        let trm = Matrix::new(size * self.gs.hscale, 0.0, 0.0, size, 0.0, self.gs.rise)
            .concat(self.tm);

        let mut glyphs: Vec<TextGlyph> = Vec::new();
        let mut pen = 0.0f64;
        if two_byte {
            for pair in bytes.chunks_exact(2) {
                let code = u32::from(u16::from_be_bytes([pair[0], pair[1]]));
                let adv = font.advance(code)?;
                glyphs.push(TextGlyph {
                    glyph_id: code,
                    unicode: code,
                    x: pen,
                    y: 0.0,
                    advance: adv,
                });
                pen += adv + self.gs.char_spacing / div;
            }
        } else {
            for &b in bytes {
                let code = u32::from(b);
                let adv = font.advance(code)?;
                glyphs.push(TextGlyph {
                    glyph_id: code,
                    unicode: code,
                    x: pen,
                    y: 0.0,
                    advance: adv,
                });
                let mut extra = self.gs.char_spacing;
                if b == b' ' {
                    extra += self.gs.word_spacing;
                }
                pen += adv + extra / div;
            }
        }

        let wants_fill = matches!(mode, 0 | 2 | 4 | 6);
        let wants_stroke = matches!(mode, 1 | 2 | 5 | 6);
        let fill_brush = wants_fill.then(|| self.brush(&self.gs.fill_cs, &self.gs.fill_ops));
        let stroke_brush = wants_stroke.then(|| {
            (
                StrokeState::new(self.engine, self.gs.stroke.clone()),
                self.brush(&self.gs.stroke_cs, &self.gs.stroke_ops),
            )
        });
        if mode >= 4 && self.clip_text.is_none() {
            self.clip_text = Some(Text::new(self.engine));
        }

        let text = Text::new(self.engine);
        let r = (|| -> Result<()> {
            text.begin_span(&font, trm, 0, 0)?;
            for g in &glyphs {
                text.show_glyph(*g)?;
            }
            if let Some((cs, color)) = &fill_brush {
                self.dev.fill_text(&text, ctm, cs, color, self.gs.fill_alpha)?;
            }
            if let Some((ss, (cs, color))) = &stroke_brush {
                self.dev
                    .stroke_text(&text, ss, ctm, cs, color, self.gs.stroke_alpha)?;
            }
            if mode == 3 {
                self.dev.ignore_text(&text, ctm)?;
            }
            if mode >= 4 {
                if let Some(ct) = &self.clip_text {
                    ct.begin_span(&font, trm, 0, 0)?;
                    for g in &glyphs {
                        ct.show_glyph(*g)?;
                    }
                }
            }
            Ok(())
        })();
        text.destroy();
        if let Some((cs, _)) = &fill_brush {
            cs.destroy();
        }
        if let Some((ss, (cs, _))) = &stroke_brush {
            ss.destroy();
            cs.destroy();
        }
        font.destroy();
        r?;

        let tx = pen * size * self.gs.hscale;
        self.tm = Matrix::translate(tx, 0.0).concat(self.tm);
        Ok(())
    }

    /// ET: flush any accumulated text clip as one device clip.
    fn end_text(&mut self) -> Result<()> {
        let Some(t) = self.clip_text.take() else {
            return Ok(());
        };
        let r = (|| -> Result<()> {
            let scissor = t.bounds(self.gs.ctm)?;
            self.dev.clip_text(&t, self.gs.ctm, scissor)?;
            self.gs.clip_depth += 1;
            Ok(())
        })();
        t.destroy();
        r
    }

    fn draw_image(&mut self, node: NodeId) -> Result<()> {
        let built = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let GraphNode::Stream { dict, raw } = s.node(s.resolve(node)) else {
                return Ok(None);
            };
            let (dict, raw) = (*dict, raw);
            let width = s.int_value(s.dict_get(node, "Width")).unwrap_or(0);
            let height = s.int_value(s.dict_get(node, "Height")).unwrap_or(0);
            if width <= 0 || height <= 0 {
                return Ok(None);
            }
            let is_mask = matches!(
                s.node(s.dict_get_resolved(node, "ImageMask")),
                GraphNode::Bool(true)
            );
            let interpolate = matches!(
                s.node(s.dict_get_resolved(node, "Interpolate")),
                GraphNode::Bool(true)
            );
            let bpc = if is_mask {
                1
            } else {
                s.int_value(s.dict_get(node, "BitsPerComponent"))
                    .unwrap_or(8)
                    .clamp(1, 32) as u32
            };
            let n = if is_mask {
                1
            } else {
                cs_from_node(s, s.dict_get(node, "ColorSpace"), 0).ncomp() as u32
            };
            let samples = match filters::decode_stream(s, dict, raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "image stream undecodable");
                    return Ok(None);
                }
            };
            Ok(Some((
                width as u32,
                height as u32,
                n,
                bpc,
                is_mask,
                interpolate,
                samples,
            )))
        })?;
        let Some((width, height, n, bpc, is_mask, interpolate, samples)) = built else {
            return Ok(());
        };
        self.emit_image(ImageData {
            width,
            height,
            n,
            bpc,
            colorspace: self.image_colorspace(n, is_mask),
            samples: Bytes::from(samples),
            is_mask,
            interpolate,
        })
    }

    /// A device colorspace handle for an image; the image resource owns the
    /// single reference `insert` creates.
    fn image_colorspace(&self, n: u32, is_mask: bool) -> Option<RawHandle> {
        if is_mask {
            return None;
        }
        let data = match n {
            1 => ColorSpaceData::device_gray(),
            4 => ColorSpaceData::device_cmyk(),
            _ => ColorSpaceData::device_rgb(),
        };
        Some(self.engine.insert(Resource::ColorSpace(data)))
    }

    fn emit_image(&mut self, data: ImageData) -> Result<()> {
        let is_mask = data.is_mask;
        let image = Image::adopt(self.engine, data);
        let ctm = self.gs.ctm;
        let r = if is_mask {
            let (cs, color) = self.brush(&self.gs.fill_cs, &self.gs.fill_ops);
            let r = self
                .dev
                .fill_image_mask(&image, ctm, &cs, &color, self.gs.fill_alpha);
            cs.destroy();
            r
        } else {
            self.dev.fill_image(&image, ctm, self.gs.fill_alpha)
        };
        image.destroy();
        r
    }

    fn run_form(&mut self, node: NodeId, inherited_res: NodeId) -> Result<()> {
        if self.xobject_depth >= MAX_XOBJECT_DEPTH {
            warn!("form xobject nested too deep");
            return Ok(());
        }
        let built = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let GraphNode::Stream { dict, raw } = s.node(s.resolve(node)) else {
                return Ok(None);
            };
            let content = match filters::decode_stream(s, *dict, raw) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "form content undecodable");
                    return Ok(None);
                }
            };
            let group_dict = s.dict_get_resolved(node, "Group");
            let group = if matches!(s.node(group_dict), GraphNode::Dict(_)) {
                Some((
                    matches!(
                        s.node(s.dict_get_resolved(group_dict, "I")),
                        GraphNode::Bool(true)
                    ),
                    matches!(
                        s.node(s.dict_get_resolved(group_dict, "K")),
                        GraphNode::Bool(true)
                    ),
                    cs_from_node(s, s.dict_get(group_dict, "CS"), 0).ncomp(),
                ))
            } else {
                None
            };
            Ok(Some((
                content,
                matrix_from(s, s.dict_get_resolved(node, "Matrix")).unwrap_or(Matrix::IDENTITY),
                rect_from(s, s.dict_get_resolved(node, "BBox")),
                s.dict_get_resolved(node, "Resources"),
                group,
            )))
        })?;
        let Some((content, matrix, bbox, form_res, group)) = built else {
            return Ok(());
        };

        let saved_path = self.path.take();
        let saved_clip = self.pending_clip.take();
        self.stack.push(self.gs.clone());
        self.gs.ctm = matrix.concat(self.gs.ctm);
        let res = if form_res != NodeId::NULL {
            form_res
        } else {
            inherited_res
        };

        let run = (|| -> Result<()> {
            if let Some(bb) = bbox {
                let p = Path::new(self.engine);
                let r = (|| -> Result<()> {
                    p.rect(bb)?;
                    self.dev
                        .clip_path(&p, false, self.gs.ctm, bb.transform(self.gs.ctm))?;
                    self.gs.clip_depth += 1;
                    Ok(())
                })();
                p.destroy();
                r?;
            }
            if let Some((isolated, knockout, n)) = group {
                let cs = match n {
                    1 => ColorSpace::device_gray(self.engine),
                    4 => ColorSpace::device_cmyk(self.engine),
                    _ => ColorSpace::device_rgb(self.engine),
                };
                let area = bbox
                    .map(|b| b.transform(self.gs.ctm))
                    .unwrap_or(Rect::INFINITE);
                let r = self.dev.begin_group(
                    area,
                    &cs,
                    isolated,
                    knockout,
                    self.gs.blend,
                    self.gs.fill_alpha,
                );
                cs.destroy();
                r?;
            }
            self.xobject_depth += 1;
            let r = self.execute(&content, res);
            self.xobject_depth -= 1;
            r?;
            if group.is_some() {
                self.dev.end_group()?;
            }
            Ok(())
        })();

        let out = match run {
            Ok(()) => self.restore(),
            Err(e) => {
                self.stack.pop();
                Err(e)
            }
        };
        self.path = saved_path;
        self.pending_clip = saved_clip;
        out
    }

    fn ext_gstate(&mut self, res: NodeId, name: &str) -> Result<()> {
        struct Ext {
            line_width: Option<f64>,
            line_cap: Option<i64>,
            line_join: Option<i64>,
            miter: Option<f64>,
            dashes: Option<(SmallVec<[f64; 8]>, f64)>,
            fill_alpha: Option<f64>,
            stroke_alpha: Option<f64>,
            blend: Option<SmolStr>,
            font: Option<(NodeId, f64)>,
        }
        let node = self.res_child(res, "ExtGState", name)?;
        if node == NodeId::NULL {
            warn!(name, "extgstate not found");
            return Ok(());
        }
        let ext = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let dashes = {
                let v = s.dict_get_resolved(node, "D");
                if s.array_len(v) >= 2 {
                    let arr = s.array_get(v, 0);
                    let mut pat = SmallVec::new();
                    for i in 0..s.array_len(arr).min(16) {
                        if let Some(x) = s.real_value(s.array_get(arr, i)) {
                            pat.push(x);
                        }
                    }
                    Some((pat, s.real_value(s.array_get(v, 1)).unwrap_or(0.0)))
                } else {
                    None
                }
            };
            let blend = {
                let v = s.dict_get_resolved(node, "BM");
                s.name_value(v)
                    .cloned()
                    .or_else(|| s.name_value(s.array_get(v, 0)).cloned())
            };
            let font = {
                let v = s.dict_get_resolved(node, "Font");
                if s.array_len(v) >= 2 {
                    let f = s.resolve(s.array_get(v, 0));
                    let size = s.real_value(s.array_get(v, 1)).unwrap_or(0.0);
                    matches!(s.node(f), GraphNode::Dict(_)).then_some((f, size))
                } else {
                    None
                }
            };
            Ok(Ext {
                line_width: s.real_value(s.dict_get(node, "LW")),
                line_cap: s.int_value(s.dict_get(node, "LC")),
                line_join: s.int_value(s.dict_get(node, "LJ")),
                miter: s.real_value(s.dict_get(node, "ML")),
                dashes,
                fill_alpha: s.real_value(s.dict_get(node, "ca")),
                stroke_alpha: s.real_value(s.dict_get(node, "CA")),
                blend,
                font,
            })
        })?;
        if let Some(v) = ext.line_width {
            self.gs.stroke.line_width = v;
        }
        if let Some(v) = ext.line_cap {
            self.gs.stroke.line_cap = v.clamp(0, 2) as u8;
        }
        if let Some(v) = ext.line_join {
            self.gs.stroke.line_join = v.clamp(0, 2) as u8;
        }
        if let Some(v) = ext.miter {
            self.gs.stroke.miter_limit = v;
        }
        if let Some((pat, phase)) = ext.dashes {
            self.gs.stroke.dashes = pat;
            self.gs.stroke.dash_phase = phase;
        }
        if let Some(v) = ext.fill_alpha {
            self.gs.fill_alpha = v.clamp(0.0, 1.0);
        }
        if let Some(v) = ext.stroke_alpha {
            self.gs.stroke_alpha = v.clamp(0.0, 1.0);
        }
        if let Some(b) = ext.blend {
            self.gs.blend = BlendMode::from_name(&b);
        }
        if let Some((f, size)) = ext.font {
            self.ensure_font(f)?;
            if self.fonts.contains_key(&f) {
                self.gs.font = Some(f);
                self.gs.size = size;
            }
        }
        Ok(())
    }

    fn begin_marked(&mut self, ops: &[Operand], res: NodeId) -> Result<()> {
        if ops.len() < 2 {
            if let Some(Operand::Name(tag)) = ops.last() {
                return self.dev.begin_layer(tag);
            }
            return Ok(());
        }
        let Operand::Name(tag) = &ops[ops.len() - 2] else {
            return Ok(());
        };
        let label = match ops.last() {
            Some(Operand::Name(prop)) if tag == "OC" => self.ocg_label(res, prop)?,
            Some(Operand::Dict(d)) => match d.get("Name") {
                Some(Operand::Str(s)) => Some(decode_text(s)),
                Some(Operand::Name(n)) => Some(n.to_string()),
                _ => None,
            },
            _ => None,
        };
        self.dev.begin_layer(label.as_deref().unwrap_or(tag.as_str()))
    }

    /// /Name of an optional content group referenced through /Properties.
    fn ocg_label(&self, res: NodeId, prop: &SmolStr) -> Result<Option<String>> {
        with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let node = s.dict_get_resolved(s.dict_get_resolved(res, "Properties"), prop);
            Ok(s.string_value(s.dict_get(node, "Name")).map(decode_text))
        })
    }

    /// BI .. ID .. EI. The dict uses abbreviated keys; the binary payload
    /// ends at a whitespace-delimited EI.
    fn inline_image(&mut self, lx: &mut Lexer<'_>, res: NodeId) -> Result<()> {
        let mut dict: IndexMap<SmolStr, Operand> = IndexMap::new();
        loop {
            let t = match lx.next() {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "inline image header unreadable");
                    return Ok(());
                }
            };
            match t {
                Token::Keyword(k) if k == "ID" => break,
                Token::Eof => return Ok(()),
                Token::Name(key) => {
                    let vt = match lx.next() {
                        Ok(Token::Eof) | Err(_) => return Ok(()),
                        Ok(t) => t,
                    };
                    match parse_operand(lx, vt) {
                        Ok(v) => {
                            dict.insert(key, v);
                        }
                        Err(_) => return Ok(()),
                    }
                }
                _ => {}
            }
        }
        let data = lx.data();
        let mut start = lx.pos();
        if start < data.len() && is_whitespace(data[start]) {
            start += 1;
        }
        let mut end = None;
        let mut i = start;
        while i + 2 <= data.len() {
            if data[i] == b'E'
                && data[i + 1] == b'I'
                && i > start
                && is_whitespace(data[i - 1])
                && data
                    .get(i + 2)
                    .map_or(true, |&b| is_whitespace(b) || is_delimiter(b))
            {
                end = Some(i - 1);
                break;
            }
            i += 1;
        }
        let Some(end) = end else {
            warn!("inline image without terminator");
            lx.seek(data.len());
            return Ok(());
        };
        let raw = &data[start..end];
        lx.seek((end + 3).min(data.len()));

        let geti = |k1: &str, k2: &str| -> Option<i64> {
            match dict.get(k1).or_else(|| dict.get(k2)) {
                Some(Operand::Num(v)) => Some(*v as i64),
                _ => None,
            }
        };
        let getb = |k1: &str, k2: &str| -> bool {
            matches!(
                dict.get(k1).or_else(|| dict.get(k2)),
                Some(Operand::Bool(true))
            )
        };
        let width = geti("Width", "W").unwrap_or(0);
        let height = geti("Height", "H").unwrap_or(0);
        if width <= 0 || height <= 0 {
            warn!("inline image without dimensions");
            return Ok(());
        }
        let is_mask = getb("ImageMask", "IM");
        let interpolate = getb("Interpolate", "I");
        let bpc = if is_mask {
            1
        } else {
            geti("BitsPerComponent", "BPC").unwrap_or(8).clamp(1, 32) as u32
        };
        let n = if is_mask {
            1
        } else {
            match dict.get("ColorSpace").or_else(|| dict.get("CS")) {
                Some(Operand::Name(cs)) => match cs.as_str() {
                    "DeviceGray" | "G" | "CalGray" | "I" | "Indexed" => 1,
                    "DeviceRGB" | "RGB" | "CalRGB" => 3,
                    "DeviceCMYK" | "CMYK" => 4,
                    other => self.named_cs_components(res, other)?,
                },
                _ => 1,
            }
        };

        let mut names: Vec<SmolStr> = Vec::new();
        match dict.get("Filter").or_else(|| dict.get("F")) {
            Some(Operand::Name(f)) => names.push(f.clone()),
            Some(Operand::Array(items)) => {
                for item in items {
                    if let Operand::Name(f) = item {
                        names.push(f.clone());
                    }
                }
            }
            _ => {}
        }
        let parms: Vec<Option<&IndexMap<SmolStr, Operand>>> =
            match dict.get("DecodeParms").or_else(|| dict.get("DP")) {
                Some(Operand::Dict(d)) => vec![Some(d)],
                Some(Operand::Array(items)) => items
                    .iter()
                    .map(|item| match item {
                        Operand::Dict(d) => Some(d),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            };
        let mut payload = raw.to_vec();
        for (idx, fname) in names.iter().enumerate() {
            // Image codecs terminate the chain; the device gets the encoded
            // payload.
            if filters::is_image_filter(fname) {
                break;
            }
            let p = inline_params(parms.get(idx).copied().flatten());
            payload = match filters::apply_filter(fname, p, &payload) {
                Ok(v) => v,
                Err(e) => {
                    warn!(filter = %fname, error = %e, "inline image filter failed");
                    return Ok(());
                }
            };
        }

        self.emit_image(ImageData {
            width: width as u32,
            height: height as u32,
            n,
            bpc,
            colorspace: self.image_colorspace(n, is_mask),
            samples: Bytes::from(payload),
            is_mask,
            interpolate,
        })
    }

    fn named_cs_components(&self, res: NodeId, name: &str) -> Result<u32> {
        let n = with_document(self.engine, self.doc, |d| {
            let s = &d.store;
            let cat = s.dict_get_resolved(res, "ColorSpace");
            Ok(cs_from_node(s, s.dict_get(cat, name), 0).ncomp())
        })?;
        Ok(n as u32)
    }
}

/// Inline image /DP parameters mapped onto the shared filter knobs.
fn inline_params(d: Option<&IndexMap<SmolStr, Operand>>) -> FilterParams {
    let mut p = FilterParams::default();
    let Some(d) = d else {
        return p;
    };
    let get = |key: &str| -> Option<i64> {
        match d.get(key) {
            Some(Operand::Num(v)) => Some(*v as i64),
            _ => None,
        }
    };
    if let Some(v) = get("Predictor") {
        p.predictor = v;
    }
    if let Some(v) = get("Columns") {
        p.columns = v;
    }
    if let Some(v) = get("Colors") {
        p.colors = v;
    }
    if let Some(v) = get("BitsPerComponent") {
        p.bits = v;
    }
    if let Some(v) = get("EarlyChange") {
        p.early_change = v;
    }
    p
}

/// Width tables and the embedded program for a font dictionary. `None`
/// when the node is not a dict at all.
fn build_font_data(s: &ObjectStore, font: NodeId) -> Option<(FontData, bool)> {
    if !matches!(s.node(s.resolve(font)), GraphNode::Dict(_)) {
        return None;
    }
    let subtype = s.name_value(s.dict_get(font, "Subtype")).cloned();
    let two_byte = subtype.as_deref() == Some("Type0");
    let base = s
        .name_value(s.dict_get(font, "BaseFont"))
        .map(|n| n.as_str().to_string())
        .unwrap_or_else(|| String::from("Unknown"));
    let mut fd = FontData::named(strip_subset_tag(&base));

    // Type0 metrics live on the descendant font.
    let mut target = font;
    if two_byte {
        let desc = s.resolve(s.array_get(s.dict_get(font, "DescendantFonts"), 0));
        if matches!(s.node(desc), GraphNode::Dict(_)) {
            target = desc;
        }
        fd.default_width = s.real_value(s.dict_get(target, "DW")).unwrap_or(1000.0);
        parse_cid_widths(s, s.dict_get_resolved(target, "W"), &mut fd.widths);
    } else {
        let first = s
            .int_value(s.dict_get(font, "FirstChar"))
            .unwrap_or(0)
            .clamp(0, 65535) as u32;
        let widths = s.dict_get_resolved(font, "Widths");
        for i in 0..s.array_len(widths).min(65536) {
            if let Some(w) = s.real_value(s.array_get(widths, i)) {
                fd.widths.insert(first + i as u32, w);
            }
        }
    }

    let descr = s.dict_get_resolved(target, "FontDescriptor");
    if matches!(s.node(descr), GraphNode::Dict(_)) {
        if let Some(mw) = s.real_value(s.dict_get(descr, "MissingWidth")) {
            fd.default_width = mw;
        }
        let flags = s.int_value(s.dict_get(descr, "Flags")).unwrap_or(0);
        fd.italic = fd.italic || flags & (1 << 6) != 0;
        fd.bold = fd.bold || flags & (1 << 18) != 0;
        for key in ["FontFile2", "FontFile3", "FontFile"] {
            let file = s.dict_get_resolved(descr, key);
            if let GraphNode::Stream { dict, raw } = s.node(file) {
                match filters::decode_stream(s, *dict, raw) {
                    Ok(data) => {
                        fd.data = Some(Bytes::from(data));
                        break;
                    }
                    Err(e) => warn!(key, error = %e, "embedded font program undecodable"),
                }
            }
        }
    }
    Some((fd, two_byte))
}

/// Strips the six-letter subset prefix from names like `ABCDEF+Helvetica`.
fn strip_subset_tag(name: &str) -> &str {
    match name.split_once('+') {
        Some((tag, rest)) if tag.len() == 6 && tag.bytes().all(|b| b.is_ascii_uppercase()) => rest,
        _ => name,
    }
}

/// CID /W entries: either `c [w1 w2 ..]` or `cFirst cLast w`.
fn parse_cid_widths(s: &ObjectStore, w: NodeId, out: &mut FxHashMap<u32, f64>) {
    let len = s.array_len(w);
    let mut i = 0;
    while i < len {
        let Some(first) = s.int_value(s.array_get(w, i)) else {
            break;
        };
        i += 1;
        let next = s.resolve(s.array_get(w, i));
        if matches!(s.node(next), GraphNode::Array(_)) {
            for k in 0..s.array_len(next) {
                if let Some(v) = s.real_value(s.array_get(next, k)) {
                    out.insert((first + k as i64).clamp(0, 65535) as u32, v);
                }
            }
            i += 1;
        } else {
            let Some(last) = s.int_value(next) else {
                break;
            };
            let Some(v) = s.real_value(s.array_get(w, i + 1)) else {
                break;
            };
            i += 2;
            let a = first.clamp(0, 65535);
            let b = last.clamp(0, 65535).max(a);
            for code in a..=b {
                out.insert(code as u32, v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::content::TextWalker;
    use crate::device::Device;
    use crate::document::Document;
    use crate::object::PdfObject;

    #[derive(Clone, Default)]
    struct RecordSink {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl RecordSink {
        fn push(&self, s: String) {
            self.log.borrow_mut().push(s);
        }
    }

    struct SpanCollect {
        lines: Vec<String>,
    }

    impl TextWalker for SpanCollect {
        fn begin_span(&mut self, _font: &Font, trm: Matrix, _wmode: u8, _bidi: u8) -> Result<()> {
            self.lines
                .push(format!("span a={} e={} f={}", trm.a, trm.e, trm.f));
            Ok(())
        }

        fn show_glyph(&mut self, _font: &Font, trm: Matrix, _glyph: TextGlyph) -> Result<()> {
            self.lines.push(format!("glyph e={}", trm.e));
            Ok(())
        }
    }

    impl Device for RecordSink {
        fn fill_path(
            &mut self,
            path: &Path,
            even_odd: bool,
            ctm: Matrix,
            _cs: &ColorSpace,
            color: &Color,
            alpha: f64,
        ) -> Result<()> {
            let b = path.bounds(ctm)?;
            self.push(format!(
                "fill eo={} [{} {} {} {}] {:?} a={}",
                even_odd,
                b.x0.round(),
                b.y0.round(),
                b.x1.round(),
                b.y1.round(),
                color,
                alpha
            ));
            Ok(())
        }

        fn stroke_path(
            &mut self,
            _path: &Path,
            stroke: &StrokeState,
            _ctm: Matrix,
            _cs: &ColorSpace,
            color: &Color,
            _alpha: f64,
        ) -> Result<()> {
            self.push(format!("stroke w={} {:?}", stroke.line_width()?, color));
            Ok(())
        }

        fn clip_path(
            &mut self,
            _path: &Path,
            _even_odd: bool,
            _ctm: Matrix,
            _scissor: Rect,
        ) -> Result<()> {
            self.push("clip".into());
            Ok(())
        }

        fn fill_text(
            &mut self,
            text: &Text,
            _ctm: Matrix,
            _cs: &ColorSpace,
            color: &Color,
            _alpha: f64,
        ) -> Result<()> {
            let mut c = SpanCollect { lines: Vec::new() };
            text.walk(&mut c)?;
            self.push(format!("text {:?}", color));
            for line in c.lines {
                self.push(line);
            }
            Ok(())
        }

        fn clip_text(&mut self, _text: &Text, _ctm: Matrix, _scissor: Rect) -> Result<()> {
            self.push("cliptext".into());
            Ok(())
        }

        fn ignore_text(&mut self, _text: &Text, _ctm: Matrix) -> Result<()> {
            self.push("ignoretext".into());
            Ok(())
        }

        fn fill_shade(&mut self, shade: &Shade, _ctm: Matrix, _alpha: f64) -> Result<()> {
            self.push(format!("shade kind={}", shade.shading_kind()?));
            Ok(())
        }

        fn fill_image(&mut self, image: &Image, _ctm: Matrix, _alpha: f64) -> Result<()> {
            self.push(format!(
                "image {}x{} n={} len={}",
                image.width()?,
                image.height()?,
                image.n()?,
                image.samples()?.len()
            ));
            Ok(())
        }

        fn fill_image_mask(
            &mut self,
            image: &Image,
            _ctm: Matrix,
            _cs: &ColorSpace,
            color: &Color,
            _alpha: f64,
        ) -> Result<()> {
            self.push(format!(
                "imagemask {}x{} {:?}",
                image.width()?,
                image.height()?,
                color
            ));
            Ok(())
        }

        fn pop_clip(&mut self) -> Result<()> {
            self.push("popclip".into());
            Ok(())
        }

        fn begin_group(
            &mut self,
            _area: Rect,
            _cs: &ColorSpace,
            isolated: bool,
            _knockout: bool,
            _blend: BlendMode,
            _alpha: f64,
        ) -> Result<()> {
            self.push(format!("group iso={isolated}"));
            Ok(())
        }

        fn end_group(&mut self) -> Result<()> {
            self.push("endgroup".into());
            Ok(())
        }

        fn begin_tile(
            &mut self,
            _area: Rect,
            _view: Rect,
            xstep: f64,
            ystep: f64,
            _ctm: Matrix,
            _id: i32,
        ) -> Result<i32> {
            self.push(format!("tile {xstep}x{ystep}"));
            Ok(0)
        }

        fn end_tile(&mut self) -> Result<()> {
            self.push("endtile".into());
            Ok(())
        }

        fn begin_layer(&mut self, name: &str) -> Result<()> {
            self.push(format!("layer {name}"));
            Ok(())
        }

        fn end_layer(&mut self) -> Result<()> {
            self.push("endlayer".into());
            Ok(())
        }
    }

    fn page_doc(engine: &Rc<Engine>, res: Option<&PdfObject>, content: &[u8]) -> Document {
        let doc = Document::create(engine).unwrap();
        let page = doc
            .add_page(Rect::new(0.0, 0.0, 100.0, 100.0), 0, res, content)
            .unwrap();
        doc.insert_page(0, &page).unwrap();
        doc
    }

    fn run_content(content: &[u8]) -> Vec<String> {
        run_with_res(|_| Ok(None), content)
    }

    fn run_with_res(
        build: impl FnOnce(&Document) -> Result<Option<PdfObject>>,
        content: &[u8],
    ) -> Vec<String> {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let res = build(&doc).unwrap();
        let page = doc
            .add_page(Rect::new(0.0, 0.0, 100.0, 100.0), 0, res.as_ref(), content)
            .unwrap();
        doc.insert_page(0, &page).unwrap();

        let sink = RecordSink::default();
        let log = Rc::clone(&sink.log);
        let dev = NativeDevice::from_sink(&engine, Box::new(sink));
        let p = doc.load_page(0).unwrap();
        p.run(&dev, Matrix::IDENTITY).unwrap();
        dev.close_device().unwrap();
        let out = log.borrow().clone();
        out
    }

    fn simple_font(doc: &Document) -> PdfObject {
        // Helvetica-ish metrics: A=600, B=700, everything else default.
        let font = doc.new_dict().unwrap();
        font.put("Type", &doc.new_name("Font").unwrap()).unwrap();
        font.put("Subtype", &doc.new_name("Type1").unwrap()).unwrap();
        font.put("BaseFont", &doc.new_name("Helvetica").unwrap())
            .unwrap();
        font.put("FirstChar", &doc.new_int(65).unwrap()).unwrap();
        let widths = doc.new_array().unwrap();
        widths.push(&doc.new_int(600).unwrap()).unwrap();
        widths.push(&doc.new_int(700).unwrap()).unwrap();
        font.put("Widths", &widths).unwrap();
        let fonts = doc.new_dict().unwrap();
        fonts.put("F1", &font).unwrap();
        let res = doc.new_dict().unwrap();
        res.put("Font", &fonts).unwrap();
        res
    }

    #[test]
    fn test_fill_path_color_and_bounds() {
        // Page space y grows up; identity render flips onto a 100-high page.
        let log = run_content(b"0 0 1 rg 10 10 30 20 re f");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0], "fill eo=false [10 70 40 90] Rgb(0.0, 0.0, 1.0) a=1");
    }

    #[test]
    fn test_eo_fill_and_stroke_ops() {
        let log = run_content(b"2 w 1 0 0 RG 0 0 10 10 re f* 0 0 10 10 re S");
        assert!(log[0].starts_with("fill eo=true"));
        assert_eq!(log[1], "stroke w=2 Rgb(1.0, 0.0, 0.0)");
    }

    #[test]
    fn test_q_restores_color_and_pops_clip() {
        let log = run_content(
            b"1 0 0 rg q 0 1 0 rg 20 20 40 40 re W n 5 5 10 10 re f Q 5 5 10 10 re f",
        );
        assert_eq!(log[0], "clip");
        assert!(log[1].contains("Rgb(0.0, 1.0, 0.0)"));
        assert_eq!(log[2], "popclip");
        assert!(log[3].contains("Rgb(1.0, 0.0, 0.0)"));
        assert_eq!(log.len(), 4);
    }

    #[test]
    fn test_unbalanced_clip_popped_at_end() {
        let log = run_content(b"0 0 50 50 re W n 1 1 2 2 re f");
        assert_eq!(log.first().map(String::as_str), Some("clip"));
        assert_eq!(log.last().map(String::as_str), Some("popclip"));
    }

    #[test]
    fn test_text_span_matrix_and_glyph_advances() {
        let log = run_with_res(
            |doc| Ok(Some(simple_font(doc))),
            b"BT /F1 10 Tf 20 30 Td (AB) Tj ET",
        );
        assert!(log.contains(&"text Gray(0.0)".to_string()));
        assert!(log.contains(&"span a=10 e=20 f=30".to_string()));
        // A advances 600/1000 em, so B sits at 20 + 0.6 * 10.
        assert!(log.contains(&"glyph e=20".to_string()));
        assert!(log.contains(&"glyph e=26".to_string()));
    }

    #[test]
    fn test_tj_adjustment_moves_pen() {
        let log = run_with_res(
            |doc| Ok(Some(simple_font(doc))),
            b"BT /F1 10 Tf [(A) -500 (B)] TJ ET",
        );
        let spans: Vec<&String> = log.iter().filter(|l| l.starts_with("span")).collect();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].as_str(), "span a=10 e=0 f=0");
        // 0.6 em advance plus the 0.5 em adjustment at size 10.
        assert_eq!(spans[1].as_str(), "span a=10 e=11 f=0");
    }

    #[test]
    fn test_text_clip_mode_flushes_at_et() {
        let log = run_with_res(
            |doc| Ok(Some(simple_font(doc))),
            b"BT 7 Tr /F1 10 Tf (A) Tj ET 0 0 5 5 re f",
        );
        assert_eq!(log[0], "cliptext");
        assert!(log[1].starts_with("fill"));
        assert_eq!(log.last().map(String::as_str), Some("popclip"));
    }

    #[test]
    fn test_form_xobject_clip_group_and_restore() {
        let log = run_with_res(
            |doc| {
                let form = doc.add_stream(b"0 0 40 40 re f").unwrap();
                form.put("Subtype", &doc.new_name("Form").unwrap()).unwrap();
                let bbox = doc.new_array().unwrap();
                for v in [0, 0, 50, 50] {
                    bbox.push(&doc.new_int(v).unwrap()).unwrap();
                }
                form.put("BBox", &bbox).unwrap();
                let group = doc.new_dict().unwrap();
                group.put("S", &doc.new_name("Transparency").unwrap()).unwrap();
                group.put("I", &doc.new_bool(true).unwrap()).unwrap();
                form.put("Group", &group).unwrap();
                let xo = doc.new_dict().unwrap();
                xo.put("Fm1", &form).unwrap();
                let res = doc.new_dict().unwrap();
                res.put("XObject", &xo).unwrap();
                Ok(Some(res))
            },
            b"q /Fm1 Do Q",
        );
        assert_eq!(log[0], "clip");
        assert_eq!(log[1], "group iso=true");
        assert!(log[2].starts_with("fill"));
        assert_eq!(log[3], "endgroup");
        assert_eq!(log[4], "popclip");
    }

    #[test]
    fn test_tiling_pattern_runs_cell_content() {
        let log = run_with_res(
            |doc| {
                let pat = doc.add_stream(b"0 0 2 2 re f").unwrap();
                pat.put("PatternType", &doc.new_int(1).unwrap()).unwrap();
                let bbox = doc.new_array().unwrap();
                for v in [0, 0, 4, 4] {
                    bbox.push(&doc.new_int(v).unwrap()).unwrap();
                }
                pat.put("BBox", &bbox).unwrap();
                pat.put("XStep", &doc.new_int(4).unwrap()).unwrap();
                pat.put("YStep", &doc.new_int(4).unwrap()).unwrap();
                let pats = doc.new_dict().unwrap();
                pats.put("P1", &pat).unwrap();
                let res = doc.new_dict().unwrap();
                res.put("Pattern", &pats).unwrap();
                Ok(Some(res))
            },
            b"/Pattern cs /P1 scn 0 0 8 8 re f",
        );
        assert_eq!(log[0], "clip");
        assert_eq!(log[1], "tile 4x4");
        assert!(log[2].starts_with("fill"));
        assert_eq!(log[3], "endtile");
        assert_eq!(log[4], "popclip");
    }

    #[test]
    fn test_shading_operator() {
        let log = run_with_res(
            |doc| {
                let sh = doc.new_dict().unwrap();
                sh.put("ShadingType", &doc.new_int(2).unwrap()).unwrap();
                let shs = doc.new_dict().unwrap();
                shs.put("Sh0", &sh).unwrap();
                let res = doc.new_dict().unwrap();
                res.put("Shading", &shs).unwrap();
                Ok(Some(res))
            },
            b"/Sh0 sh",
        );
        assert_eq!(log, vec!["shade kind=2".to_string()]);
    }

    #[test]
    fn test_ext_gstate_sets_alpha() {
        let log = run_with_res(
            |doc| {
                let gs = doc.new_dict().unwrap();
                gs.put("ca", &doc.new_real(0.5).unwrap()).unwrap();
                let states = doc.new_dict().unwrap();
                states.put("GS1", &gs).unwrap();
                let res = doc.new_dict().unwrap();
                res.put("ExtGState", &states).unwrap();
                Ok(Some(res))
            },
            b"/GS1 gs 0 0 10 10 re f",
        );
        assert!(log[0].ends_with("a=0.5"), "{}", log[0]);
    }

    #[test]
    fn test_inline_image() {
        let mut content = b"BI /W 2 /H 2 /BPC 8 /CS /G ID ".to_vec();
        content.extend_from_slice(&[0x00, 0x01, 0x02, 0x03]);
        content.extend_from_slice(b" EI");
        let log = run_content(&content);
        assert_eq!(log, vec!["image 2x2 n=1 len=4".to_string()]);
    }

    #[test]
    fn test_marked_content_layers() {
        let log = run_content(b"/Header BMC 0 0 5 5 re f EMC");
        assert_eq!(log[0], "layer Header");
        assert!(log[1].starts_with("fill"));
        assert_eq!(log[2], "endlayer");
    }

    #[test]
    fn test_unknown_operators_skipped() {
        let log = run_content(b"/Foo bar 1 2 zz 10 10 20 20 re f");
        assert_eq!(log.len(), 1);
        assert!(log[0].starts_with("fill"));
    }

    #[test]
    fn test_cancel_aborts_run() {
        let engine = Engine::new();
        let doc = page_doc(&engine, None, &b"0 0 1 1 re f ".repeat(64));
        let sink = RecordSink::default();
        let dev = NativeDevice::from_sink(&engine, Box::new(sink));
        let flag = CancelFlag::new();
        flag.cancel();
        let p = doc.load_page(0).unwrap();
        let err = p.run_with_cancel(&dev, Matrix::IDENTITY, Some(&flag)).unwrap_err();
        assert!(matches!(err, Error::Aborted));
    }

    #[test]
    fn test_cid_width_forms() {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let w = doc.new_array().unwrap();
        // 1 [500 600] 10 12 250
        w.push(&doc.new_int(1).unwrap()).unwrap();
        let inner = doc.new_array().unwrap();
        inner.push(&doc.new_int(500).unwrap()).unwrap();
        inner.push(&doc.new_int(600).unwrap()).unwrap();
        w.push(&inner).unwrap();
        w.push(&doc.new_int(10).unwrap()).unwrap();
        w.push(&doc.new_int(12).unwrap()).unwrap();
        w.push(&doc.new_int(250).unwrap()).unwrap();

        let raw = doc.raw().unwrap();
        let node = w.node;
        let widths = crate::document::with_document(doc.engine(), raw, |d| {
            let mut out = FxHashMap::default();
            parse_cid_widths(&d.store, node, &mut out);
            Ok(out)
        })
        .unwrap();
        assert_eq!(widths.get(&1), Some(&500.0));
        assert_eq!(widths.get(&2), Some(&600.0));
        assert_eq!(widths.get(&10), Some(&250.0));
        assert_eq!(widths.get(&12), Some(&250.0));
        assert_eq!(widths.get(&13), None);
    }

    #[test]
    fn test_indexed_colorspace_lookup() {
        let lookup = vec![255, 0, 0, 0, 0, 255];
        let kind = CsKind::Indexed {
            base: Box::new(CsKind::Rgb),
            hival: 1,
            lookup: Rc::new(lookup),
        };
        assert_eq!(kind.color(&[0.0]), Color::Rgb(1.0, 0.0, 0.0));
        assert_eq!(kind.color(&[1.0]), Color::Rgb(0.0, 0.0, 1.0));
        // Out of range clamps to hival.
        assert_eq!(kind.color(&[9.0]), Color::Rgb(0.0, 0.0, 1.0));
    }

    #[test]
    fn test_subset_tag_stripped() {
        assert_eq!(strip_subset_tag("ABCDEF+Times"), "Times");
        assert_eq!(strip_subset_tag("AbCDEF+Times"), "AbCDEF+Times");
        assert_eq!(strip_subset_tag("Times"), "Times");
    }
}
