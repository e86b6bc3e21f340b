//! Documents and pages.
//!
//! Opening parses the whole cross-reference chain and materializes every
//! object eagerly; a document handle therefore never touches its source
//! bytes again except for incremental saves. Encrypted files come up in a
//! locked state where only identity metadata is readable; the first
//! successful [`Document::authenticate`] decrypts the store in place and
//! unlocks the page tree.

use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use bytes::Bytes;
use indexmap::IndexMap;
use memmap2::Mmap;
use rustc_hash::FxHashSet;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::content::ColorSpace;
use crate::crypt::{CryptState, PasswordKind};
use crate::device::NativeDevice;
use crate::display::DisplayList;
use crate::engine::arena::RawHandle;
use crate::engine::data::Resource;
use crate::engine::{CancelFlag, Engine};
use crate::error::{Error, Result};
use crate::geometry::{Matrix, Rect};
use crate::handle::{Binding, handle_wrapper};
use crate::object::{
    GraphNode, NodeId, ObjectStore, PdfObject, decode_text, encode_text, with_store_mut,
};
use crate::parse::reader;
use crate::pixmap::Pixmap;

const MAX_TREE_DEPTH: u32 = 32;

/// How far a password has taken this document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthLevel {
    NotRequired,
    /// Encrypted and still locked.
    Pending,
    User,
    Owner,
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Failed,
    /// The document is not encrypted.
    NotNeeded,
    User,
    Owner,
}

pub struct DocumentData {
    pub(crate) store: ObjectStore,
    pub(crate) version: (u8, u8),
    /// Original bytes, kept for incremental saves. Created documents have
    /// none.
    pub(crate) source: Option<Bytes>,
    pub(crate) crypt: Option<CryptState>,
    pub(crate) auth: AuthLevel,
    /// Object numbers of the page leaves, in document order.
    pub(crate) page_list: Vec<u32>,
    /// Objects whose strings were never encrypted: cross-reference streams.
    pub(crate) decrypt_skip: FxHashSet<u32>,
    pub(crate) repaired: bool,
    pub(crate) orig_startxref: u64,
}

pub struct PageData {
    pub(crate) doc: RawHandle,
    /// Object number of the page dictionary.
    pub(crate) num: u32,
    pub(crate) index: usize,
    pub(crate) mediabox: Rect,
    pub(crate) rotate: i32,
}

pub(crate) fn with_document<T>(
    engine: &Engine,
    doc: RawHandle,
    f: impl FnOnce(&DocumentData) -> Result<T>,
) -> Result<T> {
    engine.with(doc, |res| match res {
        Resource::Document(d) => f(d),
        other => Err(Error::Type {
            expected: "document",
            got: other.kind_name(),
        }),
    })
}

pub(crate) fn with_document_mut<T>(
    engine: &Engine,
    doc: RawHandle,
    f: impl FnOnce(&mut DocumentData) -> Result<T>,
) -> Result<T> {
    engine.with_mut(doc, |res| match res {
        Resource::Document(d) => f(d),
        other => Err(Error::Type {
            expected: "document",
            got: other.kind_name(),
        }),
    })
}

pub struct Document {
    pub(crate) bind: Binding,
}

handle_wrapper!(Document, "document");

impl Document {
    /// A fresh document with an empty page tree.
    pub fn create(engine: &Rc<Engine>) -> Result<Document> {
        let mut store = ObjectStore::new();
        let pages_num = store.allocate_number();
        let root_num = store.allocate_number();

        let kids = store.add(GraphNode::Array(Vec::new()));
        let mut pages = IndexMap::new();
        pages.insert(SmolStr::new("Type"), store.add(GraphNode::Name(SmolStr::new("Pages"))));
        pages.insert(SmolStr::new("Kids"), kids);
        pages.insert(SmolStr::new("Count"), store.add(GraphNode::Int(0)));
        let pages = store.add(GraphNode::Dict(pages));
        store.update_object(pages_num, pages);

        let mut root = IndexMap::new();
        root.insert(SmolStr::new("Type"), store.add(GraphNode::Name(SmolStr::new("Catalog"))));
        root.insert(SmolStr::new("Pages"), store.add(GraphNode::Ref(pages_num, 0)));
        let root = store.add(GraphNode::Dict(root));
        store.update_object(root_num, root);

        let size = store.next_num as i64;
        let mut trailer = IndexMap::new();
        trailer.insert(SmolStr::new("Size"), store.add(GraphNode::Int(size)));
        trailer.insert(SmolStr::new("Root"), store.add(GraphNode::Ref(root_num, 0)));
        store.trailer = store.add(GraphNode::Dict(trailer));

        store.dirty.clear();
        store.track_dirty = true;
        let data = DocumentData {
            store,
            version: (1, 7),
            source: None,
            crypt: None,
            auth: AuthLevel::NotRequired,
            page_list: Vec::new(),
            decrypt_skip: FxHashSet::default(),
            repaired: false,
            orig_startxref: 0,
        };
        let h = engine.insert(Resource::Document(Box::new(data)));
        Ok(Document {
            bind: Binding::adopt(Rc::clone(engine), h, Document::KIND),
        })
    }

    pub fn open(engine: &Rc<Engine>, data: &[u8]) -> Result<Document> {
        Document::open_with_hint(engine, data, "")
    }

    /// Opens from bytes. `magic` is the MIME type when the host knows it; an
    /// empty hint is taken as PDF.
    pub fn open_with_hint(engine: &Rc<Engine>, data: &[u8], magic: &str) -> Result<Document> {
        match magic {
            "" | "application/pdf" | "application/x-pdf" => {}
            other => return Err(Error::UnsupportedFormat(other.into())),
        }
        let parsed = reader::read_document(data)?;
        let mut dd = DocumentData {
            store: parsed.store,
            version: parsed.version,
            source: Some(Bytes::copy_from_slice(data)),
            crypt: None,
            auth: AuthLevel::NotRequired,
            page_list: Vec::new(),
            decrypt_skip: parsed.xref_stream_nums,
            repaired: parsed.repaired,
            orig_startxref: parsed.startxref,
        };
        match CryptState::from_store(&dd.store)? {
            Some(mut crypt) => {
                dd.auth = AuthLevel::Pending;
                // Many "encrypted" files only restrict permissions and open
                // with the empty user password.
                let empty = crypt.authenticate(b"");
                dd.crypt = Some(crypt);
                if let Some(kind) = empty {
                    unlock(&mut dd, kind)?;
                }
            }
            None => {
                reader::expand_object_streams(&mut dd.store)?;
                dd.page_list = collect_pages(&dd.store);
            }
        }
        // The catalog may declare a later version than the header.
        if let Some(v) = catalog_version(&dd.store) {
            if v > dd.version {
                dd.version = v;
            }
        }
        dd.store.dirty.clear();
        dd.store.track_dirty = true;
        debug!(
            version = format_args!("{}.{}", dd.version.0, dd.version.1),
            pages = dd.page_list.len(),
            repaired = dd.repaired,
            locked = matches!(dd.auth, AuthLevel::Pending),
            "opened document"
        );
        let h = engine.insert(Resource::Document(Box::new(dd)));
        Ok(Document {
            bind: Binding::adopt(Rc::clone(engine), h, Document::KIND),
        })
    }

    /// Opens a document by path through a read-only memory map.
    pub fn open_file(engine: &Rc<Engine>, path: &Path) -> Result<Document> {
        let file = File::open(path)?;
        // Safety: the map is only read inside this call; mutating the file
        // while it is being opened is the host's hazard, as with any mmap.
        let map = unsafe { Mmap::map(&file)? };
        Document::open(engine, &map)
    }

    /// True when the file is encrypted and no password has worked yet.
    pub fn needs_password(&self) -> Result<bool> {
        with_document(self.engine(), self.raw()?, |d| {
            Ok(matches!(d.auth, AuthLevel::Pending))
        })
    }

    /// Tries a password. The first success decrypts the document in place
    /// and unlocks the page tree.
    pub fn authenticate(&self, password: &str) -> Result<AuthOutcome> {
        with_document_mut(self.engine(), self.raw()?, |d| {
            let Some(crypt) = d.crypt.as_mut() else {
                return Ok(AuthOutcome::NotNeeded);
            };
            match crypt.authenticate(password.as_bytes()) {
                None => Ok(AuthOutcome::Failed),
                Some(kind) => {
                    unlock(d, kind)?;
                    Ok(match kind {
                        PasswordKind::User => AuthOutcome::User,
                        PasswordKind::Owner => AuthOutcome::Owner,
                    })
                }
            }
        })
    }

    /// Checks a permission flag against the encryption dictionary:
    /// `p` print, `e` edit, `c` copy, `n` annotate, `f` fill forms,
    /// `y` accessibility, `a` assemble, `h` print high quality.
    ///
    /// Unencrypted documents and owner-authenticated ones allow everything.
    pub fn has_permission(&self, flag: char) -> Result<bool> {
        with_document(self.engine(), self.raw()?, |d| {
            let Some(crypt) = d.crypt.as_ref() else {
                return Ok(true);
            };
            if matches!(d.auth, AuthLevel::Owner) {
                return Ok(true);
            }
            let bit = match flag {
                'p' => 2,
                'e' => 3,
                'c' => 4,
                'n' => 5,
                'f' => 8,
                'y' => 9,
                'a' => 10,
                'h' => 11,
                _ => return Ok(false),
            };
            Ok(crypt.permissions() >> bit & 1 == 1)
        })
    }

    /// Reads a metadata key: `"format"`, `"encryption"`, or `"info:Title"`
    /// style entries from the info dictionary.
    pub fn metadata(&self, key: &str) -> Result<Option<String>> {
        with_document(self.engine(), self.raw()?, |d| match key {
            "format" => Ok(Some(format!("PDF {}.{}", d.version.0, d.version.1))),
            "encryption" => Ok(d.crypt.as_ref().map(|c| c.describe())),
            _ => match key.strip_prefix("info:") {
                Some(name) => {
                    if matches!(d.auth, AuthLevel::Pending) {
                        return Ok(None);
                    }
                    let info = d.store.dict_get_resolved(d.store.trailer, "Info");
                    let v = d.store.dict_get(info, name);
                    Ok(d.store.string_value(v).map(decode_text))
                }
                None => Ok(None),
            },
        })
    }

    /// Writes an `info:` metadata entry, creating the info dictionary on
    /// first use. Other keys are derived and cannot be set.
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let Some(name) = key.strip_prefix("info:") else {
            return Err(Error::Argument(format!(
                "metadata key {key:?} is not writable"
            )));
        };
        with_document_mut(self.engine(), self.raw()?, |d| {
            if matches!(d.auth, AuthLevel::Pending) {
                return Err(Error::NeedsPassword);
            }
            let s = &mut d.store;
            let mut info = s.dict_get_resolved(s.trailer, "Info");
            if info == NodeId::NULL {
                // Indirect, so incremental saves can carry a replacement.
                let num = s.allocate_number();
                let dict = s.add(GraphNode::Dict(IndexMap::new()));
                s.update_object(num, dict);
                let r = s.add(GraphNode::Ref(num, 0));
                s.dict_set(s.trailer, "Info", r);
                info = dict;
            }
            let v = s.add(GraphNode::String(encode_text(value)));
            s.dict_set(info, name, v);
            Ok(())
        })
    }

    /// True when opening had to fall back to scanning for objects.
    pub fn was_repaired(&self) -> Result<bool> {
        with_document(self.engine(), self.raw()?, |d| Ok(d.repaired))
    }

    pub fn page_count(&self) -> Result<usize> {
        with_document(self.engine(), self.raw()?, |d| {
            if matches!(d.auth, AuthLevel::Pending) {
                return Err(Error::NeedsPassword);
            }
            Ok(d.page_list.len())
        })
    }

    /// Loads the page at `index`. The page holds its own reference on the
    /// document.
    pub fn load_page(&self, index: usize) -> Result<Page> {
        let doc = self.raw()?;
        let engine = self.engine();
        let (num, mediabox, rotate) = with_document(engine, doc, |d| {
            if matches!(d.auth, AuthLevel::Pending) {
                return Err(Error::NeedsPassword);
            }
            let num = *d
                .page_list
                .get(index)
                .ok_or_else(|| Error::Argument(format!("page {index} out of range")))?;
            let mediabox = inherited_rect(&d.store, num, "MediaBox")
                .unwrap_or(Rect::new(0.0, 0.0, 612.0, 792.0));
            let r = d
                .store
                .int_value(inherited_attr(&d.store, num, "Rotate"))
                .unwrap_or(0);
            let rotate = ((((r % 360) + 360) % 360) / 90 * 90) as i32;
            Ok((num, mediabox, rotate))
        })?;
        engine.retain(doc)?;
        let data = PageData {
            doc,
            num,
            index,
            mediabox,
            rotate,
        };
        let h = engine.insert(Resource::Page(data));
        Ok(Page {
            bind: Binding::adopt(Rc::clone(engine), h, Page::KIND),
        })
    }

    /// Builds a page object carrying `contents` as its content stream;
    /// [`Document::insert_page`] links it into the tree.
    pub fn add_page(
        &self,
        mediabox: Rect,
        rotate: i32,
        resources: Option<&PdfObject>,
        contents: &[u8],
    ) -> Result<PdfObject> {
        let doc = self.raw()?;
        if let Some(r) = resources {
            if r.doc_raw()? != doc {
                return Err(Error::Argument(
                    "resources must belong to this document".into(),
                ));
            }
        }
        let contents_node = self.add_stream(contents)?.node;
        let res_node = resources.map(|r| r.node);
        let node = with_store_mut(self.engine(), doc, |s| {
            let num = s.allocate_number();
            let mut pd = IndexMap::new();
            pd.insert(SmolStr::new("Type"), s.add(GraphNode::Name(SmolStr::new("Page"))));
            let corners = [mediabox.x0, mediabox.y0, mediabox.x1, mediabox.y1];
            let mb: Vec<NodeId> = corners.iter().map(|&v| s.add(GraphNode::Real(v))).collect();
            pd.insert(SmolStr::new("MediaBox"), s.add(GraphNode::Array(mb)));
            if rotate != 0 {
                pd.insert(SmolStr::new("Rotate"), s.add(GraphNode::Int(rotate as i64)));
            }
            let res = match res_node {
                Some(n) => n,
                None => s.add(GraphNode::Dict(IndexMap::new())),
            };
            pd.insert(SmolStr::new("Resources"), res);
            pd.insert(SmolStr::new("Contents"), contents_node);
            let dict = s.add(GraphNode::Dict(pd));
            s.update_object(num, dict);
            Ok(s.add(GraphNode::Ref(num, 0)))
        })?;
        PdfObject::from_parts(self.engine(), doc, node)
    }

    /// Links a page object into the tree so it shows up at `index`;
    /// `page_count()` appends.
    pub fn insert_page(&self, index: usize, page: &PdfObject) -> Result<()> {
        let doc = self.raw()?;
        if page.doc_raw()? != doc {
            return Err(Error::Argument(
                "page belongs to a different document".into(),
            ));
        }
        let page_node = page.node;
        with_document_mut(self.engine(), doc, |d| {
            let count = d.page_list.len();
            if index > count {
                return Err(Error::Argument(format!("page index {index} out of range")));
            }
            let s = &mut d.store;
            let num = match s.node(page_node) {
                GraphNode::Ref(n, _) => *n,
                _ => {
                    return Err(Error::Argument(
                        "insert_page requires an indirect page object".into(),
                    ));
                }
            };
            // Land next to the page currently at `index`, or after the last
            // page when appending.
            let (parent_ref, kids, pos) = if count == 0 {
                let root = s.dict_get_resolved(s.trailer, "Root");
                let parent_ref = s.dict_get(root, "Pages");
                let parent = s.resolve(parent_ref);
                if parent == NodeId::NULL {
                    return Err(Error::Corrupt("document has no page tree".into()));
                }
                let mut kids = s.dict_get(parent, "Kids");
                if s.resolve(kids) == NodeId::NULL {
                    kids = s.add(GraphNode::Array(Vec::new()));
                    s.dict_set(parent, "Kids", kids);
                }
                (parent_ref, kids, 0)
            } else {
                let (anchor, after) = if index == count {
                    (d.page_list[count - 1], true)
                } else {
                    (d.page_list[index], false)
                };
                let anchor_dict = s.object_node(anchor).ok_or(Error::ObjectNotFound(anchor))?;
                let parent_ref = s.dict_get(anchor_dict, "Parent");
                let parent = s.resolve(parent_ref);
                let kids = s.dict_get(parent, "Kids");
                let pos = kid_position(s, kids, anchor)
                    .ok_or_else(|| Error::Corrupt("page missing from its parent".into()))?;
                (parent_ref, kids, pos + after as usize)
            };
            let r = s.add(GraphNode::Ref(num, 0));
            s.array_insert(kids, pos, r);
            let page_dict = s.object_node(num).ok_or(Error::ObjectNotFound(num))?;
            s.dict_set(page_dict, "Parent", parent_ref);
            let parent = s.resolve(parent_ref);
            bump_counts(s, parent, 1);
            d.page_list = collect_pages(s);
            Ok(())
        })
    }

    /// Unlinks the page at `index`. The page object itself stays in the
    /// file until a garbage-collecting save.
    pub fn delete_page(&self, index: usize) -> Result<()> {
        with_document_mut(self.engine(), self.raw()?, |d| {
            let num = *d
                .page_list
                .get(index)
                .ok_or_else(|| Error::Argument(format!("page {index} out of range")))?;
            let s = &mut d.store;
            let page_dict = s.object_node(num).ok_or(Error::ObjectNotFound(num))?;
            let parent = s.dict_get_resolved(page_dict, "Parent");
            let kids = s.dict_get(parent, "Kids");
            if let Some(pos) = kid_position(s, kids, num) {
                s.array_remove(kids, pos);
                bump_counts(s, parent, -1);
            }
            d.page_list = collect_pages(s);
            Ok(())
        })
    }

    /// Serializes the document. `options` is a comma separated list like
    /// `"compress,garbage=2"`; see [`crate::write::SaveOptions`].
    pub fn save(&self, options: &str) -> Result<Vec<u8>> {
        let opts = crate::write::SaveOptions::parse(options)?;
        crate::write::save_document(self.engine(), self.raw()?, &opts)
    }
}

/// First successful authentication: decrypt in place, then expand the
/// object streams the password unlocked and build the page list.
fn unlock(d: &mut DocumentData, kind: PasswordKind) -> Result<()> {
    if matches!(d.auth, AuthLevel::Pending) {
        // Decryption and expansion are not edits.
        d.store.track_dirty = false;
        if let Some(crypt) = d.crypt.as_ref() {
            crypt.decrypt_all(&mut d.store, &d.decrypt_skip)?;
        }
        reader::expand_object_streams(&mut d.store)?;
        d.page_list = collect_pages(&d.store);
        d.store.track_dirty = true;
    }
    d.auth = match (d.auth, kind) {
        (AuthLevel::Owner, _) | (_, PasswordKind::Owner) => AuthLevel::Owner,
        _ => AuthLevel::User,
    };
    Ok(())
}

fn catalog_version(s: &ObjectStore) -> Option<(u8, u8)> {
    let root = s.dict_get_resolved(s.trailer, "Root");
    let v = s.name_value(s.dict_get(root, "Version"))?;
    let (major, minor) = v.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Walks the tree collecting page leaves in document order. Cycles and
/// malformed nodes are skipped rather than fatal.
fn collect_pages(s: &ObjectStore) -> Vec<u32> {
    let mut pages = Vec::new();
    let root = s.dict_get_resolved(s.trailer, "Root");
    let mut stack = vec![s.dict_get(root, "Pages")];
    let mut visited = FxHashSet::default();
    while let Some(id) = stack.pop() {
        let num = match s.node(id) {
            GraphNode::Ref(n, _) => {
                if !visited.insert(*n) {
                    continue;
                }
                Some(*n)
            }
            _ => None,
        };
        let node = s.resolve(id);
        if !matches!(s.node(node), GraphNode::Dict(_)) {
            continue;
        }
        let kids = s.dict_get_resolved(node, "Kids");
        if let GraphNode::Array(items) = s.node(kids) {
            for &k in items.iter().rev() {
                stack.push(k);
            }
        } else if let Some(n) = num {
            pages.push(n);
        } else {
            warn!("page tree leaf is not an indirect object; skipped");
        }
    }
    pages
}

/// Walks the parent chain for an attribute pages inherit.
fn inherited_attr(s: &ObjectStore, num: u32, key: &str) -> NodeId {
    let mut cur = match s.object_node(num) {
        Some(n) => n,
        None => return NodeId::NULL,
    };
    for _ in 0..MAX_TREE_DEPTH {
        let v = s.dict_get(cur, key);
        if s.resolve(v) != NodeId::NULL {
            return v;
        }
        let parent = s.dict_get_resolved(cur, "Parent");
        if parent == NodeId::NULL {
            break;
        }
        cur = parent;
    }
    NodeId::NULL
}

fn inherited_rect(s: &ObjectStore, num: u32, key: &str) -> Option<Rect> {
    let r = rect_from_array(s, inherited_attr(s, num, key))?;
    // Degenerate boxes fall back to the default.
    if r.x1 - r.x0 < 1.0 || r.y1 - r.y0 < 1.0 {
        return None;
    }
    Some(r)
}

fn rect_from_array(s: &ObjectStore, arr: NodeId) -> Option<Rect> {
    if s.array_len(arr) != 4 {
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

fn kid_position(s: &ObjectStore, kids: NodeId, num: u32) -> Option<usize> {
    let arr = s.resolve(kids);
    if let GraphNode::Array(items) = s.node(arr) {
        items
            .iter()
            .position(|&k| matches!(s.node(k), GraphNode::Ref(n, _) if *n == num))
    } else {
        None
    }
}

/// Adjusts /Count up the ancestor chain after linking or unlinking a leaf.
fn bump_counts(s: &mut ObjectStore, mut node: NodeId, delta: i64) {
    for _ in 0..MAX_TREE_DEPTH {
        if node == NodeId::NULL {
            return;
        }
        let count = s.int_value(s.dict_get(node, "Count")).unwrap_or(0);
        s.dict_set_int(node, "Count", count + delta);
        node = s.dict_get_resolved(node, "Parent");
    }
}

/// Maps page space (y up, mediabox origin) onto device space (y down,
/// origin top left), honoring /Rotate.
fn page_transform(mediabox: Rect, rotate: i32) -> Matrix {
    let w = mediabox.x1 - mediabox.x0;
    let h = mediabox.y1 - mediabox.y0;
    let flip = Matrix::new(1.0, 0.0, 0.0, -1.0, -mediabox.x0, mediabox.y1);
    match ((rotate % 360) + 360) % 360 {
        90 => flip.concat(Matrix::new(0.0, 1.0, -1.0, 0.0, h, 0.0)),
        180 => flip.concat(Matrix::new(-1.0, 0.0, 0.0, -1.0, w, h)),
        270 => flip.concat(Matrix::new(0.0, -1.0, 1.0, 0.0, 0.0, w)),
        _ => flip,
    }
}

pub struct Page {
    pub(crate) bind: Binding,
}

handle_wrapper!(Page, "page");

fn with_page<T>(
    engine: &Engine,
    h: RawHandle,
    f: impl FnOnce(&PageData) -> Result<T>,
) -> Result<T> {
    engine.with(h, |res| match res {
        Resource::Page(p) => f(p),
        other => Err(Error::Type {
            expected: "page",
            got: other.kind_name(),
        }),
    })
}

impl Page {
    /// Zero-based index this page was loaded at.
    pub fn number(&self) -> Result<usize> {
        with_page(self.engine(), self.raw()?, |p| Ok(p.index))
    }

    /// Page rectangle in device space with a zero origin; /Rotate of 90 or
    /// 270 swaps the sides.
    pub fn bounds(&self) -> Result<Rect> {
        with_page(self.engine(), self.raw()?, |p| {
            let w = p.mediabox.x1 - p.mediabox.x0;
            let h = p.mediabox.y1 - p.mediabox.y0;
            let (w, h) = if p.rotate == 90 || p.rotate == 270 {
                (h, w)
            } else {
                (w, h)
            };
            Ok(Rect::new(0.0, 0.0, w, h))
        })
    }

    /// The page dictionary as an object graph handle.
    pub fn object(&self) -> Result<PdfObject> {
        let (doc, num) = with_page(self.engine(), self.raw()?, |p| Ok((p.doc, p.num)))?;
        let node = with_store_mut(self.engine(), doc, |s| Ok(s.add(GraphNode::Ref(num, 0))))?;
        PdfObject::from_parts(self.engine(), doc, node)
    }

    pub fn run(&self, device: &NativeDevice, ctm: Matrix) -> Result<()> {
        self.run_with_cancel(device, ctm, None)
    }

    /// Interprets the content streams into `device`. `ctm` is applied on
    /// top of the page transform, so identity renders at 72 dpi.
    pub fn run_with_cancel(
        &self,
        device: &NativeDevice,
        ctm: Matrix,
        cancel: Option<&CancelFlag>,
    ) -> Result<()> {
        let (doc, num, mediabox, rotate) = with_page(self.engine(), self.raw()?, |p| {
            Ok((p.doc, p.num, p.mediabox, p.rotate))
        })?;
        let base = page_transform(mediabox, rotate).concat(ctm);
        crate::parse::interp::run_page(self.engine(), doc, num, device, base, cancel)
    }

    /// Renders into a fresh pixmap through a draw device.
    pub fn to_pixmap(&self, ctm: Matrix, colorspace: &ColorSpace, alpha: bool) -> Result<Pixmap> {
        let bbox = self.bounds()?.transform(ctm);
        let pix = Pixmap::new_with_bbox(self.engine(), colorspace, bbox, alpha)?;
        if alpha {
            pix.clear()?;
        } else {
            pix.clear_with_value(0xFF)?;
        }
        let dev = NativeDevice::new_draw(self.engine(), &pix)?;
        self.run(&dev, ctm)?;
        dev.close_device()?;
        dev.destroy();
        Ok(pix)
    }

    /// Records the page content into a display list for later replay.
    pub fn to_display_list(&self) -> Result<DisplayList> {
        let list = DisplayList::new(self.engine(), self.bounds()?);
        let dev = NativeDevice::new_recorder(self.engine(), &list)?;
        self.run(&dev, Matrix::IDENTITY)?;
        dev.close_device()?;
        dev.destroy();
        Ok(list)
    }
}
