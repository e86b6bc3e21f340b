//! Opening, metadata, saving and repair at the document level.

use vellum_core::{Document, Engine, Rect};

// === Fixture: a classic xref table file written by hand ===

fn assemble(objects: &[String], trailer: &str) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");
    let mut offsets = Vec::new();
    for (i, body) in objects.iter().enumerate() {
        offsets.push(out.len());
        out.extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", i + 1, body).as_bytes());
    }
    let xref_pos = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", objects.len() + 1).as_bytes());
    out.extend_from_slice(b"0000000000 65535 f \n");
    for pos in &offsets {
        out.extend_from_slice(format!("{pos:010} 00000 n \n").as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer\n<< /Size {} {} >>\nstartxref\n{}\n%%EOF\n",
            objects.len() + 1,
            trailer,
            xref_pos
        )
        .as_bytes(),
    );
    out
}

fn three_page_file() -> Vec<u8> {
    let stream = |body: &str| format!("<< /Length {} >>\nstream\n{}\nendstream", body.len(), body);
    let objects = vec![
        "<< /Type /Catalog /Pages 2 0 R >>".to_string(),
        "<< /Type /Pages /Kids [3 0 R 4 0 R 5 0 R] /Count 3 >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 100 200] /Contents 6 0 R >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 300 300] /Contents 7 0 R >>".to_string(),
        "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Rotate 90 /Contents 8 0 R >>"
            .to_string(),
        stream("q Q"),
        stream("0 0 1 rg 10 10 30 20 re f"),
        stream("q Q"),
        "<< /Title (Hand built) >>".to_string(),
    ];
    assemble(
        &objects,
        "/Root 1 0 R /Info 9 0 R",
    )
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

// === Opening ===

#[test]
fn test_open_classic_xref_file() {
    let engine = Engine::new();
    let doc = Document::open(&engine, &three_page_file()).unwrap();
    assert!(!doc.was_repaired().unwrap());
    assert_eq!(doc.page_count().unwrap(), 3);
    assert_eq!(doc.metadata("format").unwrap().as_deref(), Some("PDF 1.4"));
    assert_eq!(
        doc.metadata("info:Title").unwrap().as_deref(),
        Some("Hand built")
    );
    // No encryption dictionary, no "encryption" value.
    assert_eq!(doc.metadata("encryption").unwrap(), None);

    let first = doc.load_page(0).unwrap();
    assert_eq!(first.bounds().unwrap(), Rect::new(0.0, 0.0, 100.0, 200.0));
    let second = doc.load_page(1).unwrap();
    assert_eq!(second.bounds().unwrap(), Rect::new(0.0, 0.0, 300.0, 300.0));
    // /Rotate 90 swaps the reported extent.
    let third = doc.load_page(2).unwrap();
    assert_eq!(third.bounds().unwrap(), Rect::new(0.0, 0.0, 792.0, 612.0));
}

#[test]
fn test_page_index_out_of_range() {
    let engine = Engine::new();
    let doc = Document::open(&engine, &three_page_file()).unwrap();
    assert_eq!(doc.load_page(3).unwrap_err().name(), "bad-argument");
}

#[test]
fn test_unknown_magic_is_rejected() {
    let engine = Engine::new();
    let err = Document::open_with_hint(&engine, &three_page_file(), "text/html").unwrap_err();
    assert_eq!(err.name(), "unsupported-format");
    // The accepted hints all open the same bytes.
    for magic in ["", "application/pdf", "application/x-pdf"] {
        Document::open_with_hint(&engine, &three_page_file(), magic).unwrap();
    }
}

// === Build, save, reopen ===

#[test]
fn test_roundtrip_with_compression() {
    let engine = Engine::new();
    let doc = Document::create(&engine).unwrap();
    let blue = b"0 0 1 rg 10 10 30 20 re f";
    let red = b"1 0 0 rg 0 0 10 10 re f";
    for content in [blue.as_slice(), red.as_slice()] {
        let p = doc
            .add_page(Rect::new(0.0, 0.0, 200.0, 200.0), 0, None, content)
            .unwrap();
        doc.insert_page(doc.page_count().unwrap(), &p).unwrap();
        p.destroy();
    }
    doc.set_metadata("info:Title", "Round trip").unwrap();

    let bytes = doc.save("compress").unwrap();
    // Compressed output hides the operator text and names the filter.
    assert!(!contains(&bytes, blue));
    assert!(contains(&bytes, b"FlateDecode"));

    let back = Document::open(&engine, &bytes).unwrap();
    assert!(!back.was_repaired().unwrap());
    assert_eq!(back.page_count().unwrap(), 2);
    assert_eq!(
        back.metadata("info:Title").unwrap().as_deref(),
        Some("Round trip")
    );
    let page = back.load_page(0).unwrap();
    let content = page
        .object()
        .unwrap()
        .get("Contents")
        .unwrap()
        .read_stream()
        .unwrap();
    assert_eq!(content, blue);
}

#[test]
fn test_derived_metadata_is_not_writable() {
    let engine = Engine::new();
    let doc = Document::create(&engine).unwrap();
    assert_eq!(
        doc.set_metadata("format", "PDF 2.0").unwrap_err().name(),
        "bad-argument"
    );
}

// === Repair ===

#[test]
fn test_broken_startxref_triggers_repair() {
    let engine = Engine::new();
    let mut bytes = three_page_file();
    let pos = bytes
        .windows(9)
        .rposition(|w| w == b"startxref")
        .unwrap();
    for b in bytes[pos + 9..].iter_mut() {
        if b.is_ascii_digit() {
            *b = b'9';
        }
    }

    let doc = Document::open(&engine, &bytes).unwrap();
    assert!(doc.was_repaired().unwrap());
    assert_eq!(doc.page_count().unwrap(), 3);
    // Objects found by the scan still resolve with their content.
    let page = doc.load_page(1).unwrap();
    let content = page
        .object()
        .unwrap()
        .get("Contents")
        .unwrap()
        .read_stream()
        .unwrap();
    assert_eq!(content, b"0 0 1 rg 10 10 30 20 re f");
    assert_eq!(
        doc.metadata("info:Title").unwrap().as_deref(),
        Some("Hand built")
    );
}
