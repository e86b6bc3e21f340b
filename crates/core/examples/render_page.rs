//! Render one page of a PDF file to a binary PPM image.
//!
//! Usage: cargo run --example render_page <file.pdf> [page] [zoom]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use vellum_core::{ColorSpace, Document, Engine, Matrix, Result};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: cargo run --example render_page <file.pdf> [page] [zoom]");
        std::process::exit(1);
    }
    let path = &args[1];
    let index: usize = args.get(2).map_or(0, |a| a.parse().expect("page index"));
    let zoom: f64 = args.get(3).map_or(1.0, |a| a.parse().expect("zoom factor"));

    let engine = Engine::new();
    let doc = Document::open_file(&engine, Path::new(path))?;
    if doc.needs_password()? {
        eprintln!("{path}: password required");
        std::process::exit(1);
    }
    println!(
        "{}: {} pages, {}",
        path,
        doc.page_count()?,
        doc.metadata("format")?.unwrap_or_else(|| "unknown format".into())
    );

    let page = doc.load_page(index)?;
    let pix = page.to_pixmap(
        Matrix::scale(zoom, zoom),
        &ColorSpace::device_rgb(&engine),
        false,
    )?;
    let (w, h) = (pix.width()?, pix.height()?);

    let out_path = format!("page{index}.ppm");
    let mut out = BufWriter::new(File::create(&out_path).expect("create output file"));
    write!(out, "P6\n{w} {h}\n255\n").expect("write header");
    out.write_all(&pix.samples()?).expect("write samples");
    println!("{out_path}: {w}x{h}");

    pix.destroy();
    page.destroy();
    doc.destroy();
    Ok(())
}
