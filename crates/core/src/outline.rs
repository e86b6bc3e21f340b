//! Cursor-based editor over the bookmark tree.
//!
//! Outline nodes are ordinary graph dictionaries linked through `/First
//! /Last /Next /Prev /Parent`, so edits made here round-trip through save.
//! The iterator is a transient cursor over that structure; it owns a
//! reference on the document and nothing else.

use std::rc::Rc;

use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use smol_str::SmolStr;

use crate::document::{AuthLevel, Document, DocumentData, with_document, with_document_mut};
use crate::error::{Error, Result};
use crate::handle::Binding;
use crate::object::{GraphNode, NodeId, ObjectStore, decode_text, encode_text};

const MAX_OUTLINE_DEPTH: usize = 64;

/// One bookmark. `uri` is either an external link or a `#page=N` fragment
/// (1-based) for internal destinations.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineItem {
    pub title: Option<String>,
    pub uri: Option<String>,
    pub is_open: bool,
}

/// Where a cursor move ended up: on an item, on a valid but empty
/// insertion slot, or nowhere because the move was impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlinePosition {
    Item,
    Empty,
    Boundary,
}

/// A bookmark with its subtree, as returned by [`Document::outline`].
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineEntry {
    pub item: OutlineItem,
    pub children: Vec<OutlineEntry>,
}

pub struct OutlineIterator {
    bind: Binding,
    /// The catalog's stored /Outlines value, created lazily on first
    /// insert.
    root_ref: Option<NodeId>,
    /// Ancestor items of the current sibling list, innermost last.
    parents: Vec<u32>,
    /// Current item, or `None` for an empty position in the current list.
    current: Option<u32>,
    /// When at an empty position: the sibling the cursor sits after.
    after: Option<u32>,
}

fn link_of(s: &ObjectStore, num: u32, key: &str) -> Option<u32> {
    let node = s.object_node(num)?;
    match s.node(s.dict_get(node, key)) {
        GraphNode::Ref(n, _) => Some(*n),
        _ => None,
    }
}

fn first_of(s: &ObjectStore, container: NodeId) -> Option<u32> {
    match s.node(s.dict_get(container, "First")) {
        GraphNode::Ref(n, _) => Some(*n),
        _ => None,
    }
}

fn set_link(s: &mut ObjectStore, dict: NodeId, key: &str, to: Option<u32>) {
    match to {
        Some(t) => {
            let r = s.add(GraphNode::Ref(t, 0));
            s.dict_set(dict, key, r);
        }
        None => s.dict_remove(dict, key),
    }
}

/// Changes a container's child count, keeping the open/closed sign.
fn adjust_count(s: &mut ObjectStore, container: NodeId, delta: i64) {
    if container == NodeId::NULL {
        return;
    }
    let count = s.int_value(s.dict_get(container, "Count")).unwrap_or(0);
    let negative = count < 0;
    let mag = count.abs() + delta;
    if mag <= 0 {
        s.dict_remove(container, "Count");
    } else {
        s.dict_set_int(container, "Count", if negative { -mag } else { mag });
    }
}

/// Replaces a node's destination with one derived from a uri. `#page=N`
/// fragments become direct /Dest arrays; everything else becomes a /URI
/// action.
fn write_target(s: &mut ObjectStore, pages: &[u32], node: NodeId, uri: Option<&str>) {
    s.dict_remove(node, "Dest");
    s.dict_remove(node, "A");
    let Some(u) = uri else {
        return;
    };
    let page_num = u
        .strip_prefix("#page=")
        .and_then(|t| t.parse::<usize>().ok())
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| pages.get(i))
        .copied();
    if let Some(pn) = page_num {
        let r = s.add(GraphNode::Ref(pn, 0));
        let fit = s.add(GraphNode::Name(SmolStr::new("Fit")));
        let arr = s.add(GraphNode::Array(vec![r, fit]));
        s.dict_set(node, "Dest", arr);
    } else {
        let mut action = IndexMap::new();
        action.insert(SmolStr::new("S"), s.add(GraphNode::Name(SmolStr::new("URI"))));
        action.insert(
            SmolStr::new("URI"),
            s.add(GraphNode::String(u.as_bytes().to_vec())),
        );
        let a = s.add(GraphNode::Dict(action));
        s.dict_set(node, "A", a);
    }
}

fn read_item(d: &DocumentData, num: u32) -> OutlineItem {
    let s = &d.store;
    let Some(node) = s.object_node(num) else {
        return OutlineItem {
            title: None,
            uri: None,
            is_open: false,
        };
    };
    let title = s.string_value(s.dict_get(node, "Title")).map(decode_text);
    let mut dest = s.dict_get_resolved(node, "Dest");
    let mut uri = None;
    let a = s.dict_get_resolved(node, "A");
    if matches!(s.node(a), GraphNode::Dict(_)) {
        match s.name_value(s.dict_get(a, "S")).map(|n| n.as_str()) {
            Some("URI") => uri = s.string_value(s.dict_get(a, "URI")).map(decode_text),
            Some("GoTo") => dest = s.dict_get_resolved(a, "D"),
            _ => {}
        }
    }
    if uri.is_none() {
        // Direct destination arrays only; named destinations would need
        // the catalog name tree.
        if let GraphNode::Array(items) = s.node(dest) {
            if let Some(GraphNode::Ref(pn, _)) = items.first().map(|&i| s.node(i)) {
                if let Some(idx) = d.page_list.iter().position(|&p| p == *pn) {
                    uri = Some(format!("#page={}", idx + 1));
                }
            }
        }
    }
    let is_open = s.int_value(s.dict_get(node, "Count")).unwrap_or(0) > 0;
    OutlineItem {
        title,
        uri,
        is_open,
    }
}

impl OutlineIterator {
    /// The item under the cursor, `None` at an empty position.
    pub fn item(&self) -> Result<Option<OutlineItem>> {
        let Some(num) = self.current else {
            return Ok(None);
        };
        with_document(self.bind.engine(), self.bind.raw()?, |d| {
            Ok(Some(read_item(d, num)))
        })
    }

    /// Moves to the next sibling.
    pub fn next(&mut self) -> Result<OutlinePosition> {
        let doc = self.bind.raw()?;
        let Some(cur) = self.current else {
            return Ok(OutlinePosition::Boundary);
        };
        let nxt = with_document(self.bind.engine(), doc, |d| Ok(link_of(&d.store, cur, "Next")))?;
        match nxt {
            Some(n) => {
                self.current = Some(n);
                Ok(OutlinePosition::Item)
            }
            None => Ok(OutlinePosition::Boundary),
        }
    }

    /// Moves to the previous sibling; from the empty end-of-list position
    /// this reaches the last item.
    pub fn prev(&mut self) -> Result<OutlinePosition> {
        let doc = self.bind.raw()?;
        match self.current {
            Some(cur) => {
                let prv =
                    with_document(self.bind.engine(), doc, |d| Ok(link_of(&d.store, cur, "Prev")))?;
                match prv {
                    Some(p) => {
                        self.current = Some(p);
                        Ok(OutlinePosition::Item)
                    }
                    None => Ok(OutlinePosition::Boundary),
                }
            }
            None => match self.after.take() {
                Some(p) => {
                    self.current = Some(p);
                    Ok(OutlinePosition::Item)
                }
                None => Ok(OutlinePosition::Boundary),
            },
        }
    }

    /// Moves to the parent item.
    pub fn up(&mut self) -> Result<OutlinePosition> {
        match self.parents.pop() {
            Some(p) => {
                self.current = Some(p);
                self.after = None;
                Ok(OutlinePosition::Item)
            }
            None => Ok(OutlinePosition::Boundary),
        }
    }

    /// Moves to the first child; an item without children yields the empty
    /// child slot, ready for insertion.
    pub fn down(&mut self) -> Result<OutlinePosition> {
        let doc = self.bind.raw()?;
        let Some(cur) = self.current else {
            return Ok(OutlinePosition::Boundary);
        };
        let first =
            with_document(self.bind.engine(), doc, |d| Ok(link_of(&d.store, cur, "First")))?;
        self.parents.push(cur);
        match first {
            Some(f) => {
                self.current = Some(f);
                self.after = None;
                Ok(OutlinePosition::Item)
            }
            None => {
                self.current = None;
                self.after = None;
                Ok(OutlinePosition::Empty)
            }
        }
    }

    /// Splices a new node immediately before the cursor and leaves the
    /// cursor just past it, so `prev` reaches the inserted item.
    pub fn insert(&mut self, item: &OutlineItem) -> Result<OutlinePosition> {
        let doc = self.bind.raw()?;
        let container_item = self.parents.last().copied();
        let cur = self.current;
        let aft = self.after;
        let root_slot = &mut self.root_ref;
        let new_num = with_document_mut(self.bind.engine(), doc, |d| {
            let DocumentData {
                store: s,
                page_list,
                ..
            } = d;
            // Container dict plus the node to store as /Parent.
            let (container, parent_val) = match container_item {
                Some(p) => {
                    let dict = s.object_node(p).ok_or(Error::ObjectNotFound(p))?;
                    let r = s.add(GraphNode::Ref(p, 0));
                    (dict, r)
                }
                None => {
                    if root_slot.is_none() {
                        let num = s.allocate_number();
                        let mut od = IndexMap::new();
                        od.insert(
                            SmolStr::new("Type"),
                            s.add(GraphNode::Name(SmolStr::new("Outlines"))),
                        );
                        let dict = s.add(GraphNode::Dict(od));
                        s.update_object(num, dict);
                        let catalog = s.dict_get_resolved(s.trailer, "Root");
                        if catalog == NodeId::NULL {
                            return Err(Error::Corrupt("document has no catalog".into()));
                        }
                        let r = s.add(GraphNode::Ref(num, 0));
                        s.dict_set(catalog, "Outlines", r);
                        *root_slot = Some(r);
                    }
                    let r = root_slot.ok_or_else(|| Error::Corrupt("no outline root".into()))?;
                    (s.resolve(r), r)
                }
            };
            let num = s.allocate_number();
            let mut nd = IndexMap::new();
            if let Some(t) = &item.title {
                nd.insert(SmolStr::new("Title"), s.add(GraphNode::String(encode_text(t))));
            }
            nd.insert(SmolStr::new("Parent"), parent_val);
            let dict = s.add(GraphNode::Dict(nd));
            s.update_object(num, dict);
            write_target(s, page_list, dict, item.uri.as_deref());
            // Splice before the cursor.
            match (cur, aft) {
                (Some(x), _) => {
                    let px = link_of(s, x, "Prev");
                    set_link(s, dict, "Prev", px);
                    set_link(s, dict, "Next", Some(x));
                    if let Some(xd) = s.object_node(x) {
                        set_link(s, xd, "Prev", Some(num));
                    }
                    match px.and_then(|p| s.object_node(p)) {
                        Some(pd) => set_link(s, pd, "Next", Some(num)),
                        None => set_link(s, container, "First", Some(num)),
                    }
                }
                (None, Some(p)) => {
                    set_link(s, dict, "Prev", Some(p));
                    if let Some(pd) = s.object_node(p) {
                        set_link(s, pd, "Next", Some(num));
                    }
                    set_link(s, container, "Last", Some(num));
                }
                (None, None) => {
                    set_link(s, container, "First", Some(num));
                    set_link(s, container, "Last", Some(num));
                }
            }
            adjust_count(s, container, 1);
            Ok(num)
        })?;
        if self.current.is_some() {
            Ok(OutlinePosition::Item)
        } else {
            self.after = Some(new_num);
            Ok(OutlinePosition::Empty)
        }
    }

    /// Removes the current node and its whole subtree; the cursor moves to
    /// the following sibling when there is one.
    pub fn delete(&mut self) -> Result<OutlinePosition> {
        let doc = self.bind.raw()?;
        let del = self
            .current
            .ok_or_else(|| Error::Argument("outline cursor is not on an item".into()))?;
        let container_item = self.parents.last().copied();
        let root_ref = self.root_ref;
        let (prev, next) = with_document_mut(self.bind.engine(), doc, |d| {
            let s = &mut d.store;
            let prev = link_of(s, del, "Prev");
            let next = link_of(s, del, "Next");
            let container = match container_item {
                Some(p) => s.object_node(p).unwrap_or(NodeId::NULL),
                None => root_ref.map(|r| s.resolve(r)).unwrap_or(NodeId::NULL),
            };
            match prev.and_then(|p| s.object_node(p)) {
                Some(pd) => set_link(s, pd, "Next", next),
                None => set_link(s, container, "First", next),
            }
            match next.and_then(|n| s.object_node(n)) {
                Some(nd) => set_link(s, nd, "Prev", prev),
                None => set_link(s, container, "Last", prev),
            }
            adjust_count(s, container, -1);
            // Free the node and everything below it so dangling references
            // resolve to null.
            let mut freed = vec![del];
            let mut stack = vec![del];
            let mut seen: FxHashSet<u32> = FxHashSet::default();
            seen.insert(del);
            while let Some(n) = stack.pop() {
                let mut child = link_of(s, n, "First");
                while let Some(c) = child {
                    if !seen.insert(c) {
                        break;
                    }
                    freed.push(c);
                    stack.push(c);
                    child = link_of(s, c, "Next");
                }
            }
            for n in freed {
                s.free_object(n);
            }
            Ok((prev, next))
        })?;
        match next {
            Some(x) => {
                self.current = Some(x);
                Ok(OutlinePosition::Item)
            }
            None => {
                self.current = None;
                self.after = prev;
                Ok(OutlinePosition::Boundary)
            }
        }
    }

    /// Rewrites title, destination and open flag in place.
    pub fn update(&mut self, item: &OutlineItem) -> Result<()> {
        let doc = self.bind.raw()?;
        let num = self
            .current
            .ok_or_else(|| Error::Argument("outline cursor is not on an item".into()))?;
        let open = item.is_open;
        let title = item.title.clone();
        let uri = item.uri.clone();
        with_document_mut(self.bind.engine(), doc, |d| {
            let DocumentData {
                store: s,
                page_list,
                ..
            } = d;
            let node = s.object_node(num).ok_or(Error::ObjectNotFound(num))?;
            match &title {
                Some(t) => {
                    let v = s.add(GraphNode::String(encode_text(t)));
                    s.dict_set(node, "Title", v);
                }
                None => s.dict_remove(node, "Title"),
            }
            write_target(s, page_list, node, uri.as_deref());
            let count = s.int_value(s.dict_get(node, "Count")).unwrap_or(0);
            if count != 0 {
                let mag = count.abs();
                s.dict_set_int(node, "Count", if open { mag } else { -mag });
            }
            Ok(())
        })
    }

    /// Releases the document reference early; the drop backstop would do
    /// the same.
    pub fn destroy(&self) {
        self.bind.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.bind.is_destroyed()
    }
}

impl std::fmt::Debug for OutlineIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "OutlineIterator(depth {}, at {:?})",
            self.parents.len(),
            self.current
        )
    }
}

impl Document {
    /// Cursor over this document's bookmark tree, starting on the first
    /// top level item when there is one.
    pub fn outline_iterator(&self) -> Result<OutlineIterator> {
        let doc = self.raw()?;
        let engine = self.engine();
        let (root_ref, first) = with_document(engine, doc, |d| {
            if matches!(d.auth, AuthLevel::Pending) {
                return Err(Error::NeedsPassword);
            }
            let s = &d.store;
            let catalog = s.dict_get_resolved(s.trailer, "Root");
            let or = s.dict_get(catalog, "Outlines");
            let root_ref = if s.resolve(or) == NodeId::NULL {
                None
            } else {
                Some(or)
            };
            let first = root_ref.and_then(|r| {
                let dict = s.resolve(r);
                first_of(s, dict)
            });
            Ok((root_ref, first))
        })?;
        Ok(OutlineIterator {
            bind: Binding::from_borrowed(Rc::clone(engine), doc, "outline iterator")?,
            root_ref,
            parents: Vec::new(),
            current: first,
            after: None,
        })
    }

    /// Materializes the whole bookmark tree.
    pub fn outline(&self) -> Result<Vec<OutlineEntry>> {
        with_document(self.engine(), self.raw()?, |d| {
            if matches!(d.auth, AuthLevel::Pending) {
                return Err(Error::NeedsPassword);
            }
            let s = &d.store;
            let catalog = s.dict_get_resolved(s.trailer, "Root");
            let root = s.dict_get_resolved(catalog, "Outlines");
            let mut seen = FxHashSet::default();
            Ok(read_list(d, first_of(s, root), &mut seen, 0))
        })
    }
}

fn read_list(
    d: &DocumentData,
    first: Option<u32>,
    seen: &mut FxHashSet<u32>,
    depth: usize,
) -> Vec<OutlineEntry> {
    let mut out = Vec::new();
    let mut cur = first;
    while let Some(n) = cur {
        if !seen.insert(n) || depth >= MAX_OUTLINE_DEPTH {
            break;
        }
        let item = read_item(d, n);
        let children = read_list(d, link_of(&d.store, n, "First"), seen, depth + 1);
        out.push(OutlineEntry { item, children });
        cur = link_of(&d.store, n, "Next");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::geometry::Rect;

    fn item(title: &str, uri: Option<&str>) -> OutlineItem {
        OutlineItem {
            title: Some(title.into()),
            uri: uri.map(|u| u.into()),
            is_open: true,
        }
    }

    fn doc_with_pages(engine: &std::rc::Rc<Engine>, n: usize) -> Document {
        let doc = Document::create(engine).unwrap();
        for _ in 0..n {
            let p = doc
                .add_page(Rect::new(0.0, 0.0, 100.0, 100.0), 0, None, b"")
                .unwrap();
            doc.insert_page(doc.page_count().unwrap(), &p).unwrap();
        }
        doc
    }

    #[test]
    fn test_empty_outline_is_all_boundary() {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let mut it = doc.outline_iterator().unwrap();
        assert_eq!(it.item().unwrap(), None);
        assert_eq!(it.next().unwrap(), OutlinePosition::Boundary);
        assert_eq!(it.prev().unwrap(), OutlinePosition::Boundary);
        assert_eq!(it.up().unwrap(), OutlinePosition::Boundary);
        assert_eq!(it.down().unwrap(), OutlinePosition::Boundary);
        assert!(doc.outline().unwrap().is_empty());
    }

    #[test]
    fn test_insert_then_navigate() {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let mut it = doc.outline_iterator().unwrap();
        assert_eq!(it.insert(&item("A", None)).unwrap(), OutlinePosition::Empty);
        assert_eq!(it.insert(&item("B", None)).unwrap(), OutlinePosition::Empty);
        // Cursor sits past B; prev walks back through the list.
        assert_eq!(it.prev().unwrap(), OutlinePosition::Item);
        assert_eq!(it.item().unwrap().unwrap().title.unwrap(), "B");
        assert_eq!(it.prev().unwrap(), OutlinePosition::Item);
        assert_eq!(it.item().unwrap().unwrap().title.unwrap(), "A");
        assert_eq!(it.prev().unwrap(), OutlinePosition::Boundary);
        assert_eq!(it.next().unwrap(), OutlinePosition::Item);
        assert_eq!(it.next().unwrap(), OutlinePosition::Boundary);
        // The links landed in the catalog.
        let outlines = doc.trailer().unwrap().get_path(&["Root", "Outlines"]).unwrap();
        assert_eq!(outlines.get("Count").unwrap().as_int().unwrap(), 2);
    }

    #[test]
    fn test_insert_before_item_reached_by_prev_once() {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let mut it = doc.outline_iterator().unwrap();
        it.insert(&item("A", None)).unwrap();
        it.insert(&item("C", None)).unwrap();
        it.prev().unwrap();
        // Cursor on C; X goes between A and C and the cursor stays on C.
        assert_eq!(it.insert(&item("X", None)).unwrap(), OutlinePosition::Item);
        assert_eq!(it.item().unwrap().unwrap().title.unwrap(), "C");
        assert_eq!(it.prev().unwrap(), OutlinePosition::Item);
        assert_eq!(it.item().unwrap().unwrap().title.unwrap(), "X");
        assert_eq!(it.prev().unwrap(), OutlinePosition::Item);
        assert_eq!(it.item().unwrap().unwrap().title.unwrap(), "A");
    }

    #[test]
    fn test_down_into_children() {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let mut it = doc.outline_iterator().unwrap();
        it.insert(&item("A", None)).unwrap();
        it.prev().unwrap();
        assert_eq!(it.down().unwrap(), OutlinePosition::Empty);
        assert_eq!(it.insert(&item("A1", None)).unwrap(), OutlinePosition::Empty);
        assert_eq!(it.up().unwrap(), OutlinePosition::Item);
        // The child count made A an open item.
        let a = it.item().unwrap().unwrap();
        assert_eq!(a.title.unwrap(), "A");
        assert!(a.is_open);
        assert_eq!(it.down().unwrap(), OutlinePosition::Item);
        assert_eq!(it.item().unwrap().unwrap().title.unwrap(), "A1");
        let tree = doc.outline().unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children.len(), 1);
        assert_eq!(tree[0].children[0].item.title.as_deref(), Some("A1"));
    }

    #[test]
    fn test_delete_advances_and_prunes_subtree() {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let mut it = doc.outline_iterator().unwrap();
        it.insert(&item("A", None)).unwrap();
        it.insert(&item("B", None)).unwrap();
        it.prev().unwrap();
        it.prev().unwrap();
        // Give A a child, then delete A with its subtree.
        it.down().unwrap();
        it.insert(&item("A1", None)).unwrap();
        it.up().unwrap();
        assert_eq!(it.delete().unwrap(), OutlinePosition::Item);
        assert_eq!(it.item().unwrap().unwrap().title.unwrap(), "B");
        let tree = doc.outline().unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].item.title.as_deref(), Some("B"));
        assert!(tree[0].children.is_empty());
        // Deleting the last item leaves the list edge.
        assert_eq!(it.delete().unwrap(), OutlinePosition::Boundary);
        assert_eq!(it.item().unwrap(), None);
        assert!(doc.outline().unwrap().is_empty());
        // Deleting with no item under the cursor is an argument error.
        assert_eq!(it.delete().unwrap_err().name(), "bad-argument");
    }

    #[test]
    fn test_update_in_place() {
        let engine = Engine::new();
        let doc = Document::create(&engine).unwrap();
        let mut it = doc.outline_iterator().unwrap();
        it.insert(&item("Draft", Some("https://example.com"))).unwrap();
        it.prev().unwrap();
        it.update(&OutlineItem {
            title: Some("Final".into()),
            uri: None,
            is_open: false,
        })
        .unwrap();
        let got = it.item().unwrap().unwrap();
        assert_eq!(got.title.as_deref(), Some("Final"));
        assert_eq!(got.uri, None);
    }

    #[test]
    fn test_page_destination_roundtrip() {
        let engine = Engine::new();
        let doc = doc_with_pages(&engine, 2);
        let mut it = doc.outline_iterator().unwrap();
        it.insert(&item("Second page", Some("#page=2"))).unwrap();
        it.prev().unwrap();
        assert_eq!(it.item().unwrap().unwrap().uri.as_deref(), Some("#page=2"));
        // The stored destination references the real page object.
        let first = doc
            .trailer()
            .unwrap()
            .get_path(&["Root", "Outlines", "First"])
            .unwrap();
        let dest_target = first.get("Dest").unwrap().get_at(0).unwrap();
        let page_obj = doc.load_page(1).unwrap().object().unwrap();
        assert_eq!(
            dest_target.as_indirect().unwrap().0,
            page_obj.as_indirect().unwrap().0
        );
        // An external link stays a URI action.
        it.insert(&item("Site", Some("https://example.com"))).unwrap();
        it.prev().unwrap();
        assert_eq!(
            it.item().unwrap().unwrap().uri.as_deref(),
            Some("https://example.com")
        );
    }
}
