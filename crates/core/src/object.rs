//! The object graph: typed access to a document's body.
//!
//! Every document owns one [`ObjectStore`], an append-only arena of graph
//! nodes plus the cross-reference table mapping object numbers to nodes.
//! [`PdfObject`] is the host-facing wrapper: a document reference plus a
//! node id. Reads resolve indirect references and never fail on absent
//! keys; asking for a missing or mistyped path yields the null object, so
//! hosts probe with chained lookups instead of try/catch pyramids.
//! Mutations are strict and report type errors.
//!
//! Copying objects between documents goes through grafting, which rewrites
//! object numbers and memoizes the mapping before descending so reference
//! cycles terminate.

use std::rc::Rc;

use bytes::Bytes;
use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use crate::document::Document;
use crate::engine::Engine;
use crate::engine::arena::RawHandle;
use crate::engine::data::Resource;
use crate::error::{Error, Result};
use crate::handle::{Binding, handle_wrapper};

/// Index of a node in a document's object store. Only meaningful together
/// with the store that minted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// The shared null node present in every store.
    pub(crate) const NULL: NodeId = NodeId(0);
}

/// One node of the object graph.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GraphNode {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Name(SmolStr),
    String(Vec<u8>),
    Array(Vec<NodeId>),
    Dict(IndexMap<SmolStr, NodeId>),
    Stream { dict: NodeId, raw: Bytes },
    Ref(u32, u16),
}

impl GraphNode {
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            GraphNode::Null => "null",
            GraphNode::Bool(_) => "boolean",
            GraphNode::Int(_) => "integer",
            GraphNode::Real(_) => "real",
            GraphNode::Name(_) => "name",
            GraphNode::String(_) => "string",
            GraphNode::Array(_) => "array",
            GraphNode::Dict(_) => "dictionary",
            GraphNode::Stream { .. } => "stream",
            GraphNode::Ref(..) => "reference",
        }
    }
}

/// Cross-reference slot for one object number.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum XrefSlot {
    Free { gen: u16 },
    /// Byte offset in the source, not yet materialized.
    Offset { pos: u64, gen: u16 },
    /// Inside an object stream, not yet materialized.
    InStream { container: u32, index: u32 },
    /// Materialized into the node arena.
    Loaded { node: NodeId, gen: u16 },
}

/// Per-document node arena and cross-reference table.
///
/// Nodes are appended and never reclaimed individually; they die with the
/// document. Node 0 is the shared null.
pub(crate) struct ObjectStore {
    nodes: Vec<GraphNode>,
    /// Object number owning each node, zero for the trailer and loose nodes.
    owner: Vec<u32>,
    pub(crate) xref: FxHashMap<u32, XrefSlot>,
    pub(crate) trailer: NodeId,
    /// One past the highest object number in use.
    pub(crate) next_num: u32,
    /// Object numbers mutated since tracking was switched on. Incremental
    /// saves append exactly these.
    pub(crate) dirty: FxHashSet<u32>,
    pub(crate) track_dirty: bool,
}

const MAX_RESOLVE_HOPS: u32 = 32;
const MAX_TAG_DEPTH: u32 = 256;

impl ObjectStore {
    pub(crate) fn new() -> ObjectStore {
        ObjectStore {
            nodes: vec![GraphNode::Null],
            owner: vec![0],
            xref: FxHashMap::default(),
            trailer: NodeId::NULL,
            next_num: 1,
            dirty: FxHashSet::default(),
            track_dirty: false,
        }
    }

    pub(crate) fn add(&mut self, node: GraphNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        self.owner.push(0);
        id
    }

    pub(crate) fn node(&self, id: NodeId) -> &GraphNode {
        self.nodes.get(id.0 as usize).unwrap_or(&GraphNode::Null)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut GraphNode> {
        if id == NodeId::NULL {
            return None;
        }
        self.nodes.get_mut(id.0 as usize)
    }

    /// Follows reference chains to the node they name. Dangling or circular
    /// chains end at the null node.
    pub(crate) fn resolve(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        for _ in 0..MAX_RESOLVE_HOPS {
            match self.node(cur) {
                GraphNode::Ref(num, _) => match self.xref.get(num) {
                    Some(XrefSlot::Loaded { node, .. }) => cur = *node,
                    _ => return NodeId::NULL,
                },
                _ => return cur,
            }
        }
        NodeId::NULL
    }

    /// Resolves, then steps from a stream to its dictionary so key lookups
    /// treat streams as their dicts.
    fn container_of(&self, id: NodeId) -> NodeId {
        let r = self.resolve(id);
        match self.node(r) {
            GraphNode::Stream { dict, .. } => *dict,
            _ => r,
        }
    }

    /// Allocates a fresh object number pointing at the null node.
    pub(crate) fn allocate_number(&mut self) -> u32 {
        let num = self.next_num;
        self.next_num += 1;
        self.xref.insert(
            num,
            XrefSlot::Loaded {
                node: NodeId::NULL,
                gen: 0,
            },
        );
        num
    }

    /// Points an object number at a node, claiming the number if needed.
    pub(crate) fn update_object(&mut self, num: u32, node: NodeId) {
        let gen = match self.xref.get(&num) {
            Some(XrefSlot::Loaded { gen, .. }) | Some(XrefSlot::Offset { gen, .. }) => *gen,
            _ => 0,
        };
        self.xref.insert(num, XrefSlot::Loaded { node, gen });
        if num >= self.next_num {
            self.next_num = num + 1;
        }
        self.tag_subtree(node, num, 0);
        self.mark_dirty(num);
    }

    pub(crate) fn set_slot(&mut self, num: u32, slot: XrefSlot) {
        self.xref.insert(num, slot);
        if num >= self.next_num {
            self.next_num = num + 1;
        }
    }

    pub(crate) fn free_object(&mut self, num: u32) {
        self.xref.insert(num, XrefSlot::Free { gen: 0 });
        self.mark_dirty(num);
    }

    /// Records `num` as the owner of a direct subtree. References are not
    /// followed; their targets are objects of their own.
    fn tag_subtree(&mut self, id: NodeId, num: u32, depth: u32) {
        if id == NodeId::NULL || depth > MAX_TAG_DEPTH {
            return;
        }
        if let Some(slot) = self.owner.get_mut(id.0 as usize) {
            *slot = num;
        }
        let children: Vec<NodeId> = match self.node(id) {
            GraphNode::Array(items) => items.clone(),
            GraphNode::Dict(map) => map.values().copied().collect(),
            GraphNode::Stream { dict, .. } => vec![*dict],
            _ => return,
        };
        for c in children {
            self.tag_subtree(c, num, depth + 1);
        }
    }

    /// Notes a mutation through `container`: newly attached children take
    /// its owner and the owning object goes dirty.
    pub(crate) fn note_write(&mut self, container: NodeId, new_child: Option<NodeId>) {
        let num = self.owner.get(container.0 as usize).copied().unwrap_or(0);
        if num == 0 {
            return;
        }
        if let Some(child) = new_child {
            self.tag_subtree(child, num, 0);
        }
        self.mark_dirty(num);
    }

    pub(crate) fn mark_dirty(&mut self, num: u32) {
        if self.track_dirty {
            self.dirty.insert(num);
        }
    }

    pub(crate) fn object_node(&self, num: u32) -> Option<NodeId> {
        match self.xref.get(&num) {
            Some(XrefSlot::Loaded { node, .. }) => Some(*node),
            _ => None,
        }
    }

    // Convenience reads used across the parser, interpreter and writer.
    // All of them resolve their argument first.

    pub(crate) fn dict_get(&self, dict: NodeId, key: &str) -> NodeId {
        match self.node(self.container_of(dict)) {
            GraphNode::Dict(map) => map.get(key).copied().unwrap_or(NodeId::NULL),
            _ => NodeId::NULL,
        }
    }

    pub(crate) fn dict_get_resolved(&self, dict: NodeId, key: &str) -> NodeId {
        self.resolve(self.dict_get(dict, key))
    }

    pub(crate) fn array_len(&self, arr: NodeId) -> usize {
        match self.node(self.resolve(arr)) {
            GraphNode::Array(items) => items.len(),
            _ => 0,
        }
    }

    pub(crate) fn array_get(&self, arr: NodeId, index: usize) -> NodeId {
        match self.node(self.resolve(arr)) {
            GraphNode::Array(items) => items.get(index).copied().unwrap_or(NodeId::NULL),
            _ => NodeId::NULL,
        }
    }

    pub(crate) fn int_value(&self, id: NodeId) -> Option<i64> {
        match self.node(self.resolve(id)) {
            GraphNode::Int(v) => Some(*v),
            GraphNode::Real(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub(crate) fn real_value(&self, id: NodeId) -> Option<f64> {
        match self.node(self.resolve(id)) {
            GraphNode::Int(v) => Some(*v as f64),
            GraphNode::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn name_value(&self, id: NodeId) -> Option<&SmolStr> {
        match self.node(self.resolve(id)) {
            GraphNode::Name(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn string_value(&self, id: NodeId) -> Option<&[u8]> {
        match self.node(self.resolve(id)) {
            GraphNode::String(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn dict_set(&mut self, dict: NodeId, key: &str, value: NodeId) {
        let c = self.container_of(dict);
        let mut changed = false;
        if let Some(GraphNode::Dict(map)) = self.node_mut(c) {
            map.insert(SmolStr::new(key), value);
            changed = true;
        }
        if changed {
            self.note_write(c, Some(value));
        }
    }

    pub(crate) fn dict_set_int(&mut self, dict: NodeId, key: &str, value: i64) {
        let v = self.add(GraphNode::Int(value));
        self.dict_set(dict, key, v);
    }

    pub(crate) fn dict_set_name(&mut self, dict: NodeId, key: &str, value: &str) {
        let v = self.add(GraphNode::Name(SmolStr::new(value)));
        self.dict_set(dict, key, v);
    }

    pub(crate) fn dict_remove(&mut self, dict: NodeId, key: &str) {
        let c = self.container_of(dict);
        let mut changed = false;
        if let Some(GraphNode::Dict(map)) = self.node_mut(c) {
            changed = map.shift_remove(key).is_some();
        }
        if changed {
            self.note_write(c, None);
        }
    }

    pub(crate) fn array_push(&mut self, arr: NodeId, value: NodeId) {
        let c = self.resolve(arr);
        let mut changed = false;
        if let Some(GraphNode::Array(items)) = self.node_mut(c) {
            items.push(value);
            changed = true;
        }
        if changed {
            self.note_write(c, Some(value));
        }
    }

    /// Inserts into an array; the index is clamped to the length.
    pub(crate) fn array_insert(&mut self, arr: NodeId, index: usize, value: NodeId) {
        let c = self.resolve(arr);
        let mut changed = false;
        if let Some(GraphNode::Array(items)) = self.node_mut(c) {
            let at = index.min(items.len());
            items.insert(at, value);
            changed = true;
        }
        if changed {
            self.note_write(c, Some(value));
        }
    }

    pub(crate) fn array_remove(&mut self, arr: NodeId, index: usize) {
        let c = self.resolve(arr);
        let mut changed = false;
        if let Some(GraphNode::Array(items)) = self.node_mut(c) {
            if index < items.len() {
                items.remove(index);
                changed = true;
            }
        }
        if changed {
            self.note_write(c, None);
        }
    }
}

pub(crate) fn with_store<T>(
    engine: &Engine,
    doc: RawHandle,
    f: impl FnOnce(&ObjectStore) -> Result<T>,
) -> Result<T> {
    engine.with(doc, |res| match res {
        Resource::Document(d) => f(&d.store),
        other => Err(Error::Type {
            expected: "document",
            got: other.kind_name(),
        }),
    })
}

pub(crate) fn with_store_mut<T>(
    engine: &Engine,
    doc: RawHandle,
    f: impl FnOnce(&mut ObjectStore) -> Result<T>,
) -> Result<T> {
    engine.with_mut(doc, |res| match res {
        Resource::Document(d) => f(&mut d.store),
        other => Err(Error::Type {
            expected: "document",
            got: other.kind_name(),
        }),
    })
}

/// PDF text string to Rust string: UTF-16BE when the BOM is present,
/// byte-per-char otherwise.
pub(crate) fn decode_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

/// Text to PDF string bytes, UTF-16BE with BOM when ASCII does not cover it.
pub(crate) fn encode_text(text: &str) -> Vec<u8> {
    if text.is_ascii() {
        return text.as_bytes().to_vec();
    }
    let mut bytes = vec![0xFE, 0xFF];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_be_bytes());
    }
    bytes
}

/// A node of some document's object graph. Holds a reference on the
/// document, so the graph outlives the wrapper chain that reached it.
pub struct PdfObject {
    pub(crate) bind: Binding,
    pub(crate) node: NodeId,
}

impl PdfObject {
    pub(crate) const KIND: &'static str = "pdf object";

    pub(crate) fn from_parts(
        engine: &Rc<Engine>,
        doc: RawHandle,
        node: NodeId,
    ) -> Result<PdfObject> {
        Ok(PdfObject {
            bind: Binding::from_borrowed(Rc::clone(engine), doc, PdfObject::KIND)?,
            node,
        })
    }

    /// Escalates to an owned reference of its own.
    pub fn keep(&self) -> Result<PdfObject> {
        let doc = self.bind.raw()?;
        PdfObject::from_parts(self.bind.engine(), doc, self.node)
    }

    pub fn destroy(&self) {
        self.bind.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.bind.is_destroyed()
    }

    pub(crate) fn doc_raw(&self) -> Result<RawHandle> {
        self.bind.raw()
    }

    fn store<T>(&self, f: impl FnOnce(&ObjectStore) -> Result<T>) -> Result<T> {
        with_store(self.bind.engine(), self.bind.raw()?, f)
    }

    fn store_mut<T>(&self, f: impl FnOnce(&mut ObjectStore) -> Result<T>) -> Result<T> {
        with_store_mut(self.bind.engine(), self.bind.raw()?, f)
    }

    fn wrap(&self, node: NodeId) -> Result<PdfObject> {
        PdfObject::from_parts(self.bind.engine(), self.bind.raw()?, node)
    }

    /// Name of the resolved node's type.
    pub fn kind_name(&self) -> Result<&'static str> {
        self.store(|s| Ok(s.node(s.resolve(self.node)).kind_name()))
    }

    pub fn is_null(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::Null)))
    }

    pub fn is_bool(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::Bool(_))))
    }

    pub fn is_int(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::Int(_))))
    }

    pub fn is_real(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::Real(_))))
    }

    pub fn is_number(&self) -> Result<bool> {
        self.store(|s| {
            Ok(matches!(
                s.node(s.resolve(self.node)),
                GraphNode::Int(_) | GraphNode::Real(_)
            ))
        })
    }

    pub fn is_name(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::Name(_))))
    }

    pub fn is_string(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::String(_))))
    }

    pub fn is_array(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::Array(_))))
    }

    pub fn is_dict(&self) -> Result<bool> {
        self.store(|s| {
            Ok(matches!(
                s.node(s.resolve(self.node)),
                GraphNode::Dict(_) | GraphNode::Stream { .. }
            ))
        })
    }

    pub fn is_stream(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(s.resolve(self.node)), GraphNode::Stream { .. })))
    }

    /// True when this wrapper names an indirect reference itself; resolution
    /// is never applied here.
    pub fn is_indirect(&self) -> Result<bool> {
        self.store(|s| Ok(matches!(s.node(self.node), GraphNode::Ref(..))))
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::Bool(b) => Ok(*b),
            other => Err(Error::Type {
                expected: "boolean",
                got: other.kind_name(),
            }),
        })
    }

    pub fn as_int(&self) -> Result<i64> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::Int(v) => Ok(*v),
            other => Err(Error::Type {
                expected: "integer",
                got: other.kind_name(),
            }),
        })
    }

    /// Numeric value of an integer or real node.
    pub fn as_f64(&self) -> Result<f64> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::Int(v) => Ok(*v as f64),
            GraphNode::Real(v) => Ok(*v),
            other => Err(Error::Type {
                expected: "number",
                got: other.kind_name(),
            }),
        })
    }

    pub fn as_name(&self) -> Result<SmolStr> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::Name(n) => Ok(n.clone()),
            other => Err(Error::Type {
                expected: "name",
                got: other.kind_name(),
            }),
        })
    }

    /// Raw string bytes, unconverted.
    pub fn as_bytes(&self) -> Result<Vec<u8>> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::String(b) => Ok(b.clone()),
            other => Err(Error::Type {
                expected: "string",
                got: other.kind_name(),
            }),
        })
    }

    /// Text content of a string node, honoring the UTF-16BE marker.
    pub fn as_string(&self) -> Result<String> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::String(b) => Ok(decode_text(b)),
            other => Err(Error::Type {
                expected: "string",
                got: other.kind_name(),
            }),
        })
    }

    /// Object and generation number of an indirect reference.
    pub fn as_indirect(&self) -> Result<(u32, u16)> {
        self.store(|s| match s.node(self.node) {
            GraphNode::Ref(num, gen) => Ok((*num, *gen)),
            other => Err(Error::Type {
                expected: "reference",
                got: other.kind_name(),
            }),
        })
    }

    /// Element count of an array or dictionary; zero for anything else.
    pub fn len(&self) -> Result<usize> {
        self.store(|s| match s.node(s.container_of(self.node)) {
            GraphNode::Dict(m) => Ok(m.len()),
            GraphNode::Array(a) => Ok(a.len()),
            _ => Ok(0),
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Dictionary keys in insertion order; empty for non-dicts.
    pub fn keys(&self) -> Result<Vec<SmolStr>> {
        self.store(|s| match s.node(s.container_of(self.node)) {
            GraphNode::Dict(m) => Ok(m.keys().cloned().collect()),
            _ => Ok(Vec::new()),
        })
    }

    /// Dictionary lookup. The receiver is resolved; the returned value is
    /// the stored node, references included. Missing keys and non-dict
    /// receivers come back as the null object.
    pub fn get(&self, key: &str) -> Result<PdfObject> {
        let node = self.store(|s| Ok(s.dict_get(self.node, key)))?;
        self.wrap(node)
    }

    /// Array index lookup with the same null-for-missing contract.
    pub fn get_at(&self, index: usize) -> Result<PdfObject> {
        let node = self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::Array(items) => Ok(items.get(index).copied().unwrap_or(NodeId::NULL)),
            _ => Ok(NodeId::NULL),
        })?;
        self.wrap(node)
    }

    /// Walks a key path, resolving references at every step. Segments that
    /// parse as numbers index arrays. The first missing or unindexable step
    /// short-circuits to the null object; no error is raised for absent
    /// structure.
    pub fn get_path(&self, path: &[&str]) -> Result<PdfObject> {
        let node = self.store(|s| {
            let mut cur = s.resolve(self.node);
            for seg in path {
                if let GraphNode::Stream { dict, .. } = s.node(cur) {
                    cur = *dict;
                }
                let next = match s.node(cur) {
                    GraphNode::Dict(map) => map.get(*seg).copied().unwrap_or(NodeId::NULL),
                    GraphNode::Array(items) => match seg.parse::<usize>() {
                        Ok(i) => items.get(i).copied().unwrap_or(NodeId::NULL),
                        Err(_) => NodeId::NULL,
                    },
                    _ => NodeId::NULL,
                };
                if next == NodeId::NULL {
                    return Ok(NodeId::NULL);
                }
                cur = s.resolve(next);
            }
            Ok(cur)
        })?;
        self.wrap(node)
    }

    /// Follows this reference to its target; a non-reference resolves to
    /// itself.
    pub fn resolve(&self) -> Result<PdfObject> {
        let node = self.store(|s| Ok(s.resolve(self.node)))?;
        self.wrap(node)
    }

    fn check_same_document(&self, value: &PdfObject) -> Result<()> {
        if self.bind.raw()? != value.bind.raw()? {
            return Err(Error::Argument(
                "value belongs to a different document; graft it first".into(),
            ));
        }
        Ok(())
    }

    /// Sets a dictionary entry. The receiver must resolve to a dictionary
    /// (or stream) and the value must live in the same document.
    pub fn put(&self, key: &str, value: &PdfObject) -> Result<()> {
        self.check_same_document(value)?;
        self.store_mut(|s| {
            let c = s.container_of(self.node);
            match s.node(c) {
                GraphNode::Dict(_) => {
                    s.dict_set(c, key, value.node);
                    Ok(())
                }
                other => Err(Error::Type {
                    expected: "dictionary",
                    got: other.kind_name(),
                }),
            }
        })
    }

    /// Replaces an array element in place.
    pub fn put_at(&self, index: usize, value: &PdfObject) -> Result<()> {
        self.check_same_document(value)?;
        self.store_mut(|s| {
            let c = s.resolve(self.node);
            let kind = s.node(c).kind_name();
            match s.node_mut(c) {
                Some(GraphNode::Array(items)) => {
                    if index >= items.len() {
                        return Err(Error::Argument(format!(
                            "array index {index} out of range"
                        )));
                    }
                    items[index] = value.node;
                }
                _ => {
                    return Err(Error::Type {
                        expected: "array",
                        got: kind,
                    });
                }
            }
            s.note_write(c, Some(value.node));
            Ok(())
        })
    }

    /// Appends to an array.
    pub fn push(&self, value: &PdfObject) -> Result<()> {
        self.check_same_document(value)?;
        self.store_mut(|s| {
            let c = s.resolve(self.node);
            match s.node(c) {
                GraphNode::Array(_) => {
                    s.array_push(c, value.node);
                    Ok(())
                }
                other => Err(Error::Type {
                    expected: "array",
                    got: other.kind_name(),
                }),
            }
        })
    }

    /// Removes a dictionary key; absent keys are ignored.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.store_mut(|s| {
            let c = s.container_of(self.node);
            match s.node(c) {
                GraphNode::Dict(_) => {
                    s.dict_remove(c, key);
                    Ok(())
                }
                other => Err(Error::Type {
                    expected: "dictionary",
                    got: other.kind_name(),
                }),
            }
        })
    }

    /// Removes an array element, shifting the tail down.
    pub fn delete_at(&self, index: usize) -> Result<()> {
        self.store_mut(|s| {
            let c = s.resolve(self.node);
            let kind = s.node(c).kind_name();
            match s.node_mut(c) {
                Some(GraphNode::Array(items)) => {
                    if index < items.len() {
                        items.remove(index);
                    }
                }
                _ => {
                    return Err(Error::Type {
                        expected: "array",
                        got: kind,
                    });
                }
            }
            s.note_write(c, None);
            Ok(())
        })
    }

    /// Repoints this indirect reference at a new value. The receiver must
    /// be an indirect reference; every other path into the object keeps a
    /// node id and would not see a swap.
    pub fn write_object(&self, value: &PdfObject) -> Result<()> {
        self.check_same_document(value)?;
        self.store_mut(|s| {
            let (num, _) = match s.node(self.node) {
                GraphNode::Ref(num, gen) => (*num, *gen),
                _ => {
                    return Err(Error::Argument(
                        "write_object requires an indirect reference".into(),
                    ));
                }
            };
            s.update_object(num, value.node);
            Ok(())
        })
    }

    fn update_stream(&self, data: &[u8], raw: bool) -> Result<()> {
        self.store_mut(|s| {
            if !matches!(s.node(self.node), GraphNode::Ref(..)) {
                return Err(Error::Argument(
                    "stream updates require an indirect reference".into(),
                ));
            }
            let target = s.resolve(self.node);
            let dict = match s.node(target) {
                GraphNode::Stream { dict, .. } => *dict,
                other => {
                    return Err(Error::Type {
                        expected: "stream",
                        got: other.kind_name(),
                    });
                }
            };
            s.dict_set_int(dict, "Length", data.len() as i64);
            if !raw {
                // The new body is plain; stale filters would misdescribe it.
                s.dict_remove(dict, "Filter");
                s.dict_remove(dict, "DecodeParms");
            }
            if let Some(node) = s.node_mut(target) {
                *node = GraphNode::Stream {
                    dict,
                    raw: Bytes::copy_from_slice(data),
                };
            }
            Ok(())
        })
    }

    /// Replaces stream contents with plain bytes, dropping filter entries.
    pub fn write_stream(&self, data: &[u8]) -> Result<()> {
        self.update_stream(data, false)
    }

    /// Replaces stream contents verbatim; the dict's filters must already
    /// describe the encoding.
    pub fn write_raw_stream(&self, data: &[u8]) -> Result<()> {
        self.update_stream(data, true)
    }

    /// Stream contents with filters applied.
    pub fn read_stream(&self) -> Result<Vec<u8>> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::Stream { dict, raw } => {
                crate::parse::filters::decode_stream(s, *dict, raw)
            }
            other => Err(Error::Type {
                expected: "stream",
                got: other.kind_name(),
            }),
        })
    }

    /// Stream contents as stored, filters untouched.
    pub fn read_raw_stream(&self) -> Result<Vec<u8>> {
        self.store(|s| match s.node(s.resolve(self.node)) {
            GraphNode::Stream { raw, .. } => Ok(raw.to_vec()),
            other => Err(Error::Type {
                expected: "stream",
                got: other.kind_name(),
            }),
        })
    }

    /// Converts the subtree into a plain JSON value.
    ///
    /// With `resolve_refs` set, references are chased and a reference cycle
    /// collapses to null at the point of re-entry. Without it, references
    /// render as `"N G R"` tokens and the structure stays one level deep in
    /// the graph sense.
    pub fn to_plain(&self, resolve_refs: bool) -> Result<serde_json::Value> {
        self.store(|s| {
            let mut seen = FxHashSet::default();
            Ok(plain_value(s, self.node, resolve_refs, &mut seen))
        })
    }
}

impl std::fmt::Debug for PdfObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PdfObject(node {}, {:?})", self.node.0, self.bind)
    }
}

fn plain_value(
    s: &ObjectStore,
    id: NodeId,
    resolve_refs: bool,
    seen: &mut FxHashSet<u32>,
) -> serde_json::Value {
    use serde_json::Value;
    match s.node(id) {
        GraphNode::Null => Value::Null,
        GraphNode::Bool(b) => Value::Bool(*b),
        GraphNode::Int(v) => Value::from(*v),
        GraphNode::Real(v) => serde_json::Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        GraphNode::Name(n) => Value::String(n.to_string()),
        GraphNode::String(b) => Value::String(decode_text(b)),
        GraphNode::Array(items) => Value::Array(
            items
                .iter()
                .map(|&c| plain_value(s, c, resolve_refs, seen))
                .collect(),
        ),
        GraphNode::Dict(map) => {
            let mut out = serde_json::Map::new();
            for (k, &v) in map {
                out.insert(k.to_string(), plain_value(s, v, resolve_refs, seen));
            }
            Value::Object(out)
        }
        GraphNode::Stream { dict, .. } => plain_value(s, *dict, resolve_refs, seen),
        GraphNode::Ref(num, gen) => {
            if !resolve_refs {
                return Value::String(format!("{num} {gen} R"));
            }
            if !seen.insert(*num) {
                // Already on the path from the root: a cycle.
                return Value::Null;
            }
            let v = plain_value(s, s.resolve(id), resolve_refs, seen);
            seen.remove(num);
            v
        }
    }
}

// Object construction hangs off the document: every node needs a store to
// live in.
impl Document {
    fn make(&self, node: GraphNode) -> Result<PdfObject> {
        let doc = self.raw()?;
        let id = with_store_mut(self.engine(), doc, |s| Ok(s.add(node)))?;
        PdfObject::from_parts(self.engine(), doc, id)
    }

    pub fn new_null(&self) -> Result<PdfObject> {
        let doc = self.raw()?;
        PdfObject::from_parts(self.engine(), doc, NodeId::NULL)
    }

    pub fn new_bool(&self, v: bool) -> Result<PdfObject> {
        self.make(GraphNode::Bool(v))
    }

    pub fn new_int(&self, v: i64) -> Result<PdfObject> {
        self.make(GraphNode::Int(v))
    }

    pub fn new_real(&self, v: f64) -> Result<PdfObject> {
        self.make(GraphNode::Real(v))
    }

    pub fn new_name(&self, name: &str) -> Result<PdfObject> {
        self.make(GraphNode::Name(SmolStr::new(name)))
    }

    /// A string node from raw bytes; no text conversion is applied.
    pub fn new_string(&self, bytes: &[u8]) -> Result<PdfObject> {
        self.make(GraphNode::String(bytes.to_vec()))
    }

    /// A string node carrying text, UTF-16BE encoded when needed.
    pub fn new_text_string(&self, text: &str) -> Result<PdfObject> {
        self.make(GraphNode::String(encode_text(text)))
    }

    pub fn new_array(&self) -> Result<PdfObject> {
        self.make(GraphNode::Array(Vec::new()))
    }

    pub fn new_dict(&self) -> Result<PdfObject> {
        self.make(GraphNode::Dict(IndexMap::new()))
    }

    /// A reference to object `num`; nothing checks that the target exists
    /// until the reference is resolved.
    pub fn new_indirect(&self, num: u32, gen: u16) -> Result<PdfObject> {
        self.make(GraphNode::Ref(num, gen))
    }

    /// Allocates a fresh empty indirect object, returned as a reference.
    pub fn create_object(&self) -> Result<PdfObject> {
        let doc = self.raw()?;
        let id = with_store_mut(self.engine(), doc, |s| {
            let num = s.allocate_number();
            Ok(s.add(GraphNode::Ref(num, 0)))
        })?;
        PdfObject::from_parts(self.engine(), doc, id)
    }

    /// Marks an object number free. Dangling references to it resolve to
    /// null afterwards.
    pub fn delete_object(&self, num: u32) -> Result<()> {
        with_store_mut(self.engine(), self.raw()?, |s| {
            s.free_object(num);
            Ok(())
        })
    }

    /// A new indirect stream object holding `data` unencoded.
    pub fn add_stream(&self, data: &[u8]) -> Result<PdfObject> {
        let doc = self.raw()?;
        let id = with_store_mut(self.engine(), doc, |s| {
            let num = s.allocate_number();
            let len = s.add(GraphNode::Int(data.len() as i64));
            let mut dict = IndexMap::new();
            dict.insert(SmolStr::new("Length"), len);
            let dict = s.add(GraphNode::Dict(dict));
            let stream = s.add(GraphNode::Stream {
                dict,
                raw: Bytes::copy_from_slice(data),
            });
            s.update_object(num, stream);
            Ok(s.add(GraphNode::Ref(num, 0)))
        })?;
        PdfObject::from_parts(self.engine(), doc, id)
    }

    /// The trailer dictionary.
    pub fn trailer(&self) -> Result<PdfObject> {
        let doc = self.raw()?;
        let node = with_store(self.engine(), doc, |s| Ok(s.trailer))?;
        PdfObject::from_parts(self.engine(), doc, node)
    }

    /// One past the highest object number in use.
    pub fn count_objects(&self) -> Result<u32> {
        with_store(self.engine(), self.raw()?, |s| Ok(s.next_num))
    }

    /// Deep-copies an object from another document into this one with a
    /// throwaway mapping. Use a [`GraftMap`] when grafting several objects
    /// that share structure.
    pub fn graft_object(&self, src: &PdfObject) -> Result<PdfObject> {
        let dst_doc = self.raw()?;
        let src_doc = src.doc_raw()?;
        if dst_doc == src_doc {
            return Err(Error::Argument(
                "cannot graft an object into its own document".into(),
            ));
        }
        let mut memo = FxHashMap::default();
        let node = graft_with_memo(self.engine(), dst_doc, src_doc, &mut memo, src.node)?;
        PdfObject::from_parts(self.engine(), dst_doc, node)
    }

    /// A reusable graft mapping from `src` into this document.
    pub fn new_graft_map(&self, src: &Document) -> Result<GraftMap> {
        GraftMap::new(self, src)
    }
}

/// Owned snapshot of a source subtree, detached from any store so the two
/// documents are never borrowed at once.
enum Carried {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Name(SmolStr),
    Str(Vec<u8>),
    Array(Vec<Carried>),
    Dict(Vec<(SmolStr, Carried)>),
    Stream { dict: Box<Carried>, raw: Bytes },
    Ref(u32, u16),
}

fn carry(s: &ObjectStore, id: NodeId) -> Carried {
    match s.node(id) {
        GraphNode::Null => Carried::Null,
        GraphNode::Bool(b) => Carried::Bool(*b),
        GraphNode::Int(v) => Carried::Int(*v),
        GraphNode::Real(v) => Carried::Real(*v),
        GraphNode::Name(n) => Carried::Name(n.clone()),
        GraphNode::String(b) => Carried::Str(b.clone()),
        GraphNode::Array(items) => Carried::Array(items.iter().map(|&c| carry(s, c)).collect()),
        GraphNode::Dict(map) => Carried::Dict(
            map.iter()
                .map(|(k, &v)| (k.clone(), carry(s, v)))
                .collect(),
        ),
        GraphNode::Stream { dict, raw } => Carried::Stream {
            dict: Box::new(carry(s, *dict)),
            raw: raw.clone(),
        },
        GraphNode::Ref(num, gen) => Carried::Ref(*num, *gen),
    }
}

/// Rebuilds a carried subtree inside the destination store. References to
/// unseen source numbers claim a destination number immediately and queue
/// the source object, so cycles find their mapping already in place.
fn plant(
    s: &mut ObjectStore,
    c: &Carried,
    memo: &mut FxHashMap<u32, u32>,
    pending: &mut Vec<u32>,
) -> NodeId {
    match c {
        Carried::Null => NodeId::NULL,
        Carried::Bool(b) => s.add(GraphNode::Bool(*b)),
        Carried::Int(v) => s.add(GraphNode::Int(*v)),
        Carried::Real(v) => s.add(GraphNode::Real(*v)),
        Carried::Name(n) => s.add(GraphNode::Name(n.clone())),
        Carried::Str(b) => s.add(GraphNode::String(b.clone())),
        Carried::Array(items) => {
            let ids = items.iter().map(|i| plant(s, i, memo, pending)).collect();
            s.add(GraphNode::Array(ids))
        }
        Carried::Dict(entries) => {
            let mut map = IndexMap::with_capacity(entries.len());
            for (k, v) in entries {
                let id = plant(s, v, memo, pending);
                map.insert(k.clone(), id);
            }
            s.add(GraphNode::Dict(map))
        }
        Carried::Stream { dict, raw } => {
            let dict = plant(s, dict, memo, pending);
            s.add(GraphNode::Stream {
                dict,
                raw: raw.clone(),
            })
        }
        Carried::Ref(num, _) => {
            let dst = match memo.get(num) {
                Some(&d) => d,
                None => {
                    let d = s.allocate_number();
                    memo.insert(*num, d);
                    pending.push(*num);
                    d
                }
            };
            s.add(GraphNode::Ref(dst, 0))
        }
    }
}

pub(crate) fn graft_with_memo(
    engine: &Rc<Engine>,
    dst_doc: RawHandle,
    src_doc: RawHandle,
    memo: &mut FxHashMap<u32, u32>,
    src_node: NodeId,
) -> Result<NodeId> {
    let mut pending = Vec::new();
    let top = with_store(engine, src_doc, |s| Ok(carry(s, src_node)))?;
    let planted = with_store_mut(engine, dst_doc, |s| {
        Ok(plant(s, &top, memo, &mut pending))
    })?;
    while let Some(src_num) = pending.pop() {
        let carried = with_store(engine, src_doc, |s| {
            Ok(match s.object_node(src_num) {
                Some(id) => carry(s, id),
                None => Carried::Null,
            })
        })?;
        with_store_mut(engine, dst_doc, |s| {
            let node = plant(s, &carried, memo, &mut pending);
            if let Some(&dst_num) = memo.get(&src_num) {
                s.update_object(dst_num, node);
            }
            Ok(())
        })?;
    }
    Ok(planted)
}

pub struct GraftMapData {
    pub(crate) src_doc: RawHandle,
    pub(crate) dst_doc: RawHandle,
    pub(crate) memo: FxHashMap<u32, u32>,
}

/// Remembers which source objects already exist in the destination, so a
/// sequence of grafts shares structure instead of duplicating it.
pub struct GraftMap {
    pub(crate) bind: Binding,
}

handle_wrapper!(GraftMap, "graft map");

impl GraftMap {
    pub fn new(dst: &Document, src: &Document) -> Result<GraftMap> {
        if !Rc::ptr_eq(dst.engine(), src.engine()) {
            return Err(Error::Argument(
                "graft map requires documents from the same engine".into(),
            ));
        }
        let engine = dst.engine();
        let dst_doc = dst.raw()?;
        let src_doc = src.raw()?;
        if dst_doc == src_doc {
            return Err(Error::Argument(
                "cannot graft an object into its own document".into(),
            ));
        }
        engine.retain(dst_doc)?;
        engine.retain(src_doc)?;
        let h = engine.insert(Resource::GraftMap(GraftMapData {
            src_doc,
            dst_doc,
            memo: FxHashMap::default(),
        }));
        Ok(GraftMap {
            bind: Binding::adopt(Rc::clone(engine), h, GraftMap::KIND),
        })
    }

    /// Grafts one object, reusing every mapping this map has made so far.
    pub fn graft(&self, src: &PdfObject) -> Result<PdfObject> {
        let engine = self.engine();
        let h = self.raw()?;
        let (src_doc, dst_doc) = engine.with(h, |res| match res {
            Resource::GraftMap(gm) => Ok((gm.src_doc, gm.dst_doc)),
            other => Err(Error::Type {
                expected: "graft map",
                got: other.kind_name(),
            }),
        })?;
        if src.doc_raw()? != src_doc {
            return Err(Error::Argument(
                "object does not belong to this map's source document".into(),
            ));
        }
        let mut memo = engine.with_mut(h, |res| match res {
            Resource::GraftMap(gm) => Ok(std::mem::take(&mut gm.memo)),
            other => Err(Error::Type {
                expected: "graft map",
                got: other.kind_name(),
            }),
        })?;
        let grafted = graft_with_memo(engine, dst_doc, src_doc, &mut memo, src.node);
        // Put the mapping back even when the graft failed partway.
        engine.with_mut(h, |res| match res {
            Resource::GraftMap(gm) => {
                gm.memo = memo;
                Ok(())
            }
            other => Err(Error::Type {
                expected: "graft map",
                got: other.kind_name(),
            }),
        })?;
        PdfObject::from_parts(engine, dst_doc, grafted?)
    }
}
