//! Progressive open over a source that fills in while parsing retries.

use vellum_core::{ChunkedSource, Document, Engine, OpenProgress, ProgressiveOpen, Rect};

// Feeds at most this much per round so one open takes several attempts.
const FEED_CAP: u64 = 256;

fn saved_doc(engine: &std::rc::Rc<Engine>, pages: usize) -> Vec<u8> {
    let doc = Document::create(engine).unwrap();
    for _ in 0..pages {
        let p = doc
            .add_page(
                Rect::new(0.0, 0.0, 200.0, 200.0),
                0,
                None,
                b"0 0 1 rg 10 10 30 20 re f",
            )
            .unwrap();
        doc.insert_page(doc.page_count().unwrap(), &p).unwrap();
    }
    doc.save("").unwrap()
}

#[test]
fn test_open_completes_as_data_arrives() {
    let engine = Engine::new();
    let bytes = saved_doc(&engine, 3);
    let len = bytes.len() as u64;

    let mut open = ProgressiveOpen::new(&engine, ChunkedSource::with_len(len));
    let doc = loop {
        match open.advance().unwrap() {
            OpenProgress::Ready(doc) => break doc,
            OpenProgress::Waiting { position, length } => {
                let n = length.min(FEED_CAP);
                let start = position as usize;
                let end = (position + n) as usize;
                open.source_mut().feed(position, &bytes[start..end]);
            }
        }
    };
    assert!(open.attempts() >= 2, "fixture too small to exercise retries");
    assert_eq!(doc.page_count().unwrap(), 3);
    let page = doc.load_page(0).unwrap();
    assert_eq!(page.bounds().unwrap(), Rect::new(0.0, 0.0, 200.0, 200.0));
}

#[test]
fn test_requests_list_drives_the_same_loop() {
    let engine = Engine::new();
    let bytes = saved_doc(&engine, 1);
    let len = bytes.len() as u64;

    let mut open = ProgressiveOpen::new(&engine, ChunkedSource::with_len(len));
    let doc = loop {
        match open.advance().unwrap() {
            OpenProgress::Ready(doc) => break doc,
            OpenProgress::Waiting { .. } => {
                let requests = open.source_mut().take_requests();
                assert!(!requests.is_empty());
                for (pos, n) in requests {
                    let n = n.min(FEED_CAP);
                    let start = pos as usize;
                    open.source_mut().feed(pos, &bytes[start..start + n as usize]);
                }
            }
        }
    };
    assert_eq!(doc.page_count().unwrap(), 1);
    // Everything asked for was handed over; nothing left pending.
    assert!(open.source_mut().take_requests().is_empty());
}

#[test]
fn test_open_gives_up_after_too_many_misses() {
    let engine = Engine::new();
    // A source that never receives anything: every attempt misses.
    let mut open = ProgressiveOpen::new(&engine, ChunkedSource::with_len(4096));
    let mut last = None;
    for _ in 0..200 {
        match open.advance() {
            Ok(OpenProgress::Waiting { .. }) => continue,
            Ok(OpenProgress::Ready(_)) => panic!("no data was ever fed"),
            Err(e) => {
                last = Some(e);
                break;
            }
        }
    }
    let err = last.unwrap();
    assert_eq!(err.name(), "retries-exhausted");
    assert_eq!(open.attempts(), 100);
}

#[test]
fn test_unknown_length_is_rejected() {
    let engine = Engine::new();
    let mut open = ProgressiveOpen::new(&engine, ChunkedSource::new());
    let err = match open.advance() {
        Err(e) => e,
        Ok(_) => panic!("length is unknown"),
    };
    assert_eq!(err.name(), "bad-argument");
}
