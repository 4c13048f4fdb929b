//! Helpers for the serialized payloads crossing the connector boundary.
//! Bodies may arrive gzip-compressed; detection is by magic bytes, not by
//! headers, since not every transport preserves them.

use std::io::Read;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzipped(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0..2] == GZIP_MAGIC
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .context("decompressing gzip payload")?;
    Ok(out)
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    use flate2::{write::GzEncoder, Compression};

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

/// Truncated preview of a request body for diagnostics. Lossy on purpose;
/// never used for anything but logging.
pub fn preview(bytes: &[u8], max_len: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_len {
        return text.into_owned();
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
