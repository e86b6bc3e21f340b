//! Stream filter chains.
//!
//! Decodes the transport filters (Flate, LZW, ASCIIHex, ASCII85,
//! RunLength) including predictors. Image codecs (DCT, JPX, JBIG2,
//! CCITTFax) are not decoded here; a chain ending in one of them returns
//! the still-encoded payload for the image layer to hand through.

use std::io::Read;

use smol_str::SmolStr;
use tracing::warn;

use crate::error::{Error, Result};
use crate::object::{GraphNode, NodeId, ObjectStore};

/// Filter parameters from /DecodeParms, with standard defaults filled in.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FilterParams {
    pub predictor: i64,
    pub columns: i64,
    pub colors: i64,
    pub bits: i64,
    pub early_change: i64,
}

impl Default for FilterParams {
    fn default() -> Self {
        FilterParams {
            predictor: 1,
            columns: 1,
            colors: 1,
            bits: 8,
            early_change: 1,
        }
    }
}

impl FilterParams {
    pub(crate) fn from_store(s: &ObjectStore, parms: NodeId) -> FilterParams {
        let mut p = FilterParams::default();
        if !matches!(s.node(parms), GraphNode::Dict(_)) {
            return p;
        }
        if let Some(v) = s.int_value(s.dict_get(parms, "Predictor")) {
            p.predictor = v;
        }
        if let Some(v) = s.int_value(s.dict_get(parms, "Columns")) {
            p.columns = v;
        }
        if let Some(v) = s.int_value(s.dict_get(parms, "Colors")) {
            p.colors = v;
        }
        if let Some(v) = s.int_value(s.dict_get(parms, "BitsPerComponent")) {
            p.bits = v;
        }
        if let Some(v) = s.int_value(s.dict_get(parms, "EarlyChange")) {
            p.early_change = v;
        }
        p
    }
}

pub(crate) fn is_image_filter(name: &str) -> bool {
    matches!(
        name,
        "DCTDecode" | "DCT" | "JPXDecode" | "JBIG2Decode" | "CCITTFaxDecode" | "CCF"
    )
}

/// Lists a stream dict's filters with resolved parameter dicts.
pub(crate) fn filter_chain(s: &ObjectStore, dict: NodeId) -> Vec<(SmolStr, FilterParams)> {
    let filter = s.dict_get_resolved(dict, "Filter");
    let parms = s.dict_get_resolved(dict, "DecodeParms");
    let names: Vec<SmolStr> = match s.node(filter) {
        GraphNode::Name(n) => vec![n.clone()],
        GraphNode::Array(items) => items
            .iter()
            .filter_map(|&i| s.name_value(i).cloned())
            .collect(),
        _ => Vec::new(),
    };
    names
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let parm_node = match s.node(parms) {
                GraphNode::Array(items) => items
                    .get(i)
                    .map(|&n| s.resolve(n))
                    .unwrap_or(NodeId::NULL),
                _ if i == 0 => parms,
                _ => NodeId::NULL,
            };
            let p = FilterParams::from_store(s, parm_node);
            (name, p)
        })
        .collect()
}

/// Decodes a stream's raw bytes through its /Filter chain.
pub(crate) fn decode_stream(s: &ObjectStore, dict: NodeId, raw: &[u8]) -> Result<Vec<u8>> {
    let mut data = raw.to_vec();
    for (name, p) in filter_chain(s, dict) {
        if is_image_filter(&name) {
            return Ok(data);
        }
        data = apply_filter(&name, p, &data)?;
    }
    Ok(data)
}

pub(crate) fn apply_filter(name: &str, p: FilterParams, data: &[u8]) -> Result<Vec<u8>> {
    let out = match name {
        "FlateDecode" | "Fl" => flate_decode(data),
        "LZWDecode" | "LZW" => lzw_decode(data, p.early_change != 0)?,
        "ASCIIHexDecode" | "AHx" => asciihex_decode(data),
        "ASCII85Decode" | "A85" => ascii85_decode(data),
        "RunLengthDecode" | "RL" => runlength_decode(data),
        // Crypt filters are applied by the security handler before any
        // transport filter runs.
        "Crypt" => data.to_vec(),
        _ => {
            warn!(filter = name, "unknown stream filter");
            return Err(Error::Decode(format!("unknown filter /{name}")));
        }
    };
    if matches!(name, "FlateDecode" | "Fl" | "LZWDecode" | "LZW") && p.predictor > 1 {
        undo_predictor(&out, p)
    } else {
        Ok(out)
    }
}

fn flate_decode(data: &[u8]) -> Vec<u8> {
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    if decoder.read_to_end(&mut out).is_err() {
        out = flate_decode_partial(data);
    }
    out
}

/// Best-effort inflation of damaged streams: keep whatever came out before
/// the decoder gave up, which is usually everything minus a bad checksum.
fn flate_decode_partial(data: &[u8]) -> Vec<u8> {
    use flate2::{Decompress, FlushDecompress, Status};
    let mut decoder = Decompress::new(true);
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut buf = [0u8; 4096];
    let mut i = 0usize;
    while i < data.len() {
        let before_out = decoder.total_out();
        let before_in = decoder.total_in();
        let res = decoder.decompress(&data[i..i + 1], &mut buf, FlushDecompress::None);
        let produced = (decoder.total_out() - before_out) as usize;
        if produced > 0 {
            out.extend_from_slice(&buf[..produced]);
        }
        let consumed = (decoder.total_in() - before_in) as usize;
        i += consumed.max(1);
        match res {
            Ok(Status::StreamEnd) | Err(_) => break,
            Ok(_) => {}
        }
    }
    out
}

pub(crate) fn flate_encode(data: &[u8]) -> Vec<u8> {
    use flate2::Compression;
    use std::io::Write;
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn lzw_decode(data: &[u8], early_change: bool) -> Result<Vec<u8>> {
    let mut decoder = if early_change {
        weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
    } else {
        weezl::decode::Decoder::new(weezl::BitOrder::Msb, 8)
    };
    decoder
        .decode(data)
        .map_err(|_| Error::Decode("lzw stream is invalid".into()))
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn asciihex_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() / 2);
    let mut pending: Option<u8> = None;
    for &b in data {
        if b == b'>' {
            break;
        }
        if let Some(n) = hex_nibble(b) {
            match pending.take() {
                Some(high) => out.push((high << 4) | n),
                None => pending = Some(n),
            }
        }
    }
    if let Some(high) = pending {
        out.push(high << 4);
    }
    out
}

fn ascii85_decode(data: &[u8]) -> Vec<u8> {
    let data = data.strip_prefix(b"<~").unwrap_or(data);
    let data = match data.iter().position(|&b| b == b'~') {
        Some(end) => &data[..end],
        None => data,
    };
    // Strip whitespace and expand 'z' groups before the base-85 math.
    let mut filtered = Vec::with_capacity(data.len());
    for &b in data {
        match b {
            b' ' | b'\t' | b'\r' | b'\n' | b'\x00' | b'\x0c' => {}
            b'z' => filtered.extend_from_slice(b"!!!!!"),
            b'!'..=b'u' => filtered.push(b),
            _ => {}
        }
    }
    let mut out = Vec::with_capacity(filtered.len() * 4 / 5);
    for chunk in filtered.chunks(5) {
        if chunk.len() == 5 {
            let mut v: u32 = 0;
            for &b in chunk {
                v = v.wrapping_mul(85).wrapping_add((b - b'!') as u32);
            }
            out.extend_from_slice(&v.to_be_bytes());
        } else if chunk.len() > 1 {
            let mut padded = [b'u'; 5];
            padded[..chunk.len()].copy_from_slice(chunk);
            let mut v: u32 = 0;
            for &b in &padded {
                v = v.wrapping_mul(85).wrapping_add((b - b'!') as u32);
            }
            out.extend_from_slice(&v.to_be_bytes()[..chunk.len() - 1]);
        }
    }
    out
}

fn runlength_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        let n = data[i] as usize;
        i += 1;
        if n == 128 {
            break;
        }
        if n < 128 {
            let take = (n + 1).min(data.len() - i);
            out.extend_from_slice(&data[i..i + take]);
            i += take;
        } else if i < data.len() {
            out.resize(out.len() + (257 - n), data[i]);
            i += 1;
        }
    }
    out
}

fn undo_predictor(data: &[u8], p: FilterParams) -> Result<Vec<u8>> {
    if p.predictor == 2 {
        return Ok(undo_tiff_predictor(data, p));
    }
    if p.predictor >= 10 {
        return undo_png_predictor(
            data,
            p.columns.max(1) as usize,
            p.colors.max(1) as usize,
            p.bits.max(1) as usize,
        );
    }
    Ok(data.to_vec())
}

fn undo_tiff_predictor(data: &[u8], p: FilterParams) -> Vec<u8> {
    // Horizontal differencing; only the 8-bit case is handled, other
    // depths pass through untouched.
    if p.bits != 8 {
        return data.to_vec();
    }
    let colors = p.colors.max(1) as usize;
    let row_bytes = (p.columns.max(1) as usize) * colors;
    let mut out = data.to_vec();
    for row in out.chunks_mut(row_bytes) {
        for i in colors..row.len() {
            row[i] = row[i].wrapping_add(row[i - colors]);
        }
    }
    out
}

const fn paeth(left: u8, above: u8, upper_left: u8) -> u8 {
    let a = left as i16;
    let b = above as i16;
    let c = upper_left as i16;
    let pr = a + b - c;
    let pa = (pr - a).abs();
    let pb = (pr - b).abs();
    let pc = (pr - c).abs();
    if pa <= pb && pa <= pc {
        left
    } else if pb <= pc {
        above
    } else {
        upper_left
    }
}

/// Reverses PNG row prediction. Each row carries a leading filter byte.
fn undo_png_predictor(data: &[u8], columns: usize, colors: usize, bits: usize) -> Result<Vec<u8>> {
    let row_bytes = (colors * columns * bits).div_ceil(8);
    let bpp = std::cmp::max(1, colors * bits / 8);
    let row_size = row_bytes + 1;
    let mut out = Vec::with_capacity(data.len());
    let mut prev_row = vec![0u8; row_bytes];
    for row_start in (0..data.len()).step_by(row_size) {
        if row_start + row_size > data.len() {
            break;
        }
        let filter_type = data[row_start];
        let row_data = &data[row_start + 1..row_start + row_size];
        let mut row = vec![0u8; row_bytes];
        match filter_type {
            0 => row.copy_from_slice(row_data),
            1 => {
                for i in 0..row_bytes {
                    let left = if i >= bpp { row[i - bpp] } else { 0 };
                    row[i] = row_data[i].wrapping_add(left);
                }
            }
            2 => {
                for i in 0..row_bytes {
                    row[i] = row_data[i].wrapping_add(prev_row[i]);
                }
            }
            3 => {
                for i in 0..row_bytes {
                    let left = if i >= bpp { row[i - bpp] as u16 } else { 0 };
                    let above = prev_row[i] as u16;
                    row[i] = row_data[i].wrapping_add(((left + above) / 2) as u8);
                }
            }
            4 => {
                for i in 0..row_bytes {
                    let left = if i >= bpp { row[i - bpp] } else { 0 };
                    let above = prev_row[i];
                    let upper_left = if i >= bpp { prev_row[i - bpp] } else { 0 };
                    row[i] = row_data[i].wrapping_add(paeth(left, above, upper_left));
                }
            }
            _ => row.copy_from_slice(row_data),
        }
        out.extend_from_slice(&row);
        prev_row = row;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flate_roundtrip() {
        let data = b"q 100 0 0 100 0 0 cm /Im0 Do Q".repeat(8);
        let packed = flate_encode(&data);
        assert!(packed.len() < data.len());
        assert_eq!(flate_decode(&packed), data);
    }

    #[test]
    fn test_flate_damaged_tail_keeps_prefix() {
        let data = vec![7u8; 4096];
        let mut packed = flate_encode(&data);
        let n = packed.len();
        packed[n - 2] ^= 0xFF; // break the adler checksum
        let out = flate_decode(&packed);
        assert!(!out.is_empty());
        assert!(out.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_asciihex() {
        assert_eq!(asciihex_decode(b"48 65 6C 6C 6F>"), b"Hello");
        // Odd digit count pads the low nibble with zero.
        assert_eq!(asciihex_decode(b"7>"), vec![0x70]);
    }

    #[test]
    fn test_ascii85() {
        assert_eq!(ascii85_decode(b"<~87cURD]j7BEbo7~>"), b"Hello world");
        assert_eq!(ascii85_decode(b"z~>"), vec![0, 0, 0, 0]);
    }

    #[test]
    fn test_runlength() {
        // 2 literal bytes, a run of 4, EOD.
        let encoded = [1u8, b'a', b'b', 253, b'c', 128];
        assert_eq!(runlength_decode(&encoded), b"abcccc");
    }

    #[test]
    fn test_png_up_predictor() {
        // Two rows of four bytes, both filtered with Up.
        let raw = [2u8, 1, 1, 1, 1, 2, 1, 1, 1, 1];
        let out = undo_png_predictor(&raw, 4, 1, 8).unwrap();
        assert_eq!(out, vec![1, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn test_png_sub_predictor() {
        let raw = [1u8, 10, 5, 5];
        let out = undo_png_predictor(&raw, 3, 1, 8).unwrap();
        assert_eq!(out, vec![10, 15, 20]);
    }

    #[test]
    fn test_tiff_predictor() {
        let p = FilterParams {
            predictor: 2,
            columns: 4,
            ..FilterParams::default()
        };
        assert_eq!(undo_tiff_predictor(&[10, 1, 1, 1], p), vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_unknown_filter_is_an_error() {
        let err = apply_filter("Bogus", FilterParams::default(), b"x").unwrap_err();
        assert_eq!(err.name(), "decode-error");
    }
}
