//! Bookmark editing end to end: cursor edits, the snapshot tree, and
//! survival through a save/reopen cycle.

use vellum_core::{Document, Engine, OutlineItem, OutlinePosition, Rect};

fn item(title: &str, uri: Option<&str>) -> OutlineItem {
    OutlineItem {
        title: Some(title.into()),
        uri: uri.map(Into::into),
        is_open: false,
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
fn test_build_two_level_tree() {
    let engine = Engine::new();
    let doc = doc_with_pages(&engine, 2);
    let mut it = doc.outline_iterator().unwrap();
    it.insert(&item("Intro", Some("#page=1"))).unwrap();
    it.insert(&item("Chapter", Some("#page=2"))).unwrap();
    it.prev().unwrap();
    it.down().unwrap();
    it.insert(&item("Section", None)).unwrap();
    it.destroy();

    let tree = doc.outline().unwrap();
    assert_eq!(tree.len(), 2);
    assert_eq!(tree[0].item.title.as_deref(), Some("Intro"));
    assert_eq!(tree[0].item.uri.as_deref(), Some("#page=1"));
    assert!(tree[0].children.is_empty());
    assert_eq!(tree[1].item.title.as_deref(), Some("Chapter"));
    assert_eq!(tree[1].children.len(), 1);
    assert_eq!(tree[1].children[0].item.title.as_deref(), Some("Section"));
}

#[test]
fn test_outline_survives_save_and_reopen() {
    let engine = Engine::new();
    let doc = doc_with_pages(&engine, 3);
    let mut it = doc.outline_iterator().unwrap();
    it.insert(&item("One", Some("#page=1"))).unwrap();
    it.insert(&item("Three", Some("#page=3"))).unwrap();
    it.prev().unwrap();
    it.down().unwrap();
    it.insert(&item("Detail", Some("https://example.com/doc"))).unwrap();
    it.destroy();
    let before = doc.outline().unwrap();

    let bytes = doc.save("").unwrap();
    let back = Document::open(&engine, &bytes).unwrap();
    assert_eq!(back.outline().unwrap(), before);

    // And again through a compressed save.
    let bytes = back.save("compress,garbage=1").unwrap();
    let again = Document::open(&engine, &bytes).unwrap();
    assert_eq!(again.outline().unwrap(), before);
}

#[test]
fn test_delete_subtree_then_save() {
    let engine = Engine::new();
    let doc = doc_with_pages(&engine, 1);
    let mut it = doc.outline_iterator().unwrap();
    it.insert(&item("Keep", None)).unwrap();
    it.insert(&item("Drop", None)).unwrap();
    it.prev().unwrap();
    it.down().unwrap();
    it.insert(&item("Drop child", None)).unwrap();
    it.up().unwrap();
    assert_eq!(it.delete().unwrap(), OutlinePosition::Boundary);
    it.destroy();

    let bytes = doc.save("garbage=2").unwrap();
    let back = Document::open(&engine, &bytes).unwrap();
    let tree = back.outline().unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].item.title.as_deref(), Some("Keep"));
    assert!(tree[0].children.is_empty());
}

#[test]
fn test_update_persists() {
    let engine = Engine::new();
    let doc = doc_with_pages(&engine, 1);
    let mut it = doc.outline_iterator().unwrap();
    it.insert(&item("Draft", Some("#page=1"))).unwrap();
    it.prev().unwrap();
    it.down().unwrap();
    it.insert(&item("Note", None)).unwrap();
    it.up().unwrap();
    // A fresh child leaves the parent open; fold it and retitle.
    it.update(&OutlineItem {
        title: Some("Final".into()),
        uri: Some("#page=1".into()),
        is_open: false,
    })
    .unwrap();
    it.destroy();

    let bytes = doc.save("").unwrap();
    let back = Document::open(&engine, &bytes).unwrap();
    let tree = back.outline().unwrap();
    assert_eq!(tree[0].item.title.as_deref(), Some("Final"));
    assert!(!tree[0].item.is_open);
    assert_eq!(tree[0].children.len(), 1);
    assert_eq!(tree[0].children[0].item.title.as_deref(), Some("Note"));
}
