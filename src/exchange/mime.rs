//! Content-type sniffing from leading file bytes.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Bytes examined when sniffing
pub const SNIFF_LEN: usize = 512;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Content type for the leading bytes of a file.
pub fn sniff(data: &[u8]) -> &'static str {
    let head = &data[..data.len().min(SNIFF_LEN)];

    if head.starts_with(&[0x1f, 0x8b, 0x08]) {
        return "application/x-gzip";
    }
    if head.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }

    let trimmed = trim_leading_whitespace(head);
    if trimmed.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if is_text(head) {
        return "text/plain; charset=utf-8";
    }
    OCTET_STREAM
}

/// Content type and length of a file, reading only its first bytes.
pub fn sniff_file(path: &Path) -> io::Result<(&'static str, u64)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head)?;
    Ok((sniff(&head), len))
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
    let start = data
        .iter()
        .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
        .unwrap_or(data.len());
    &data[start..]
}

fn is_text(data: &[u8]) -> bool {
    let valid = match std::str::from_utf8(data) {
        Ok(_) => data,
        // A multi-byte character cut off by the sniff window still counts
        Err(e) if e.error_len().is_none() => &data[..e.valid_up_to()],
        Err(_) => return false,
    };
    !valid
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | 0x1b))
}
