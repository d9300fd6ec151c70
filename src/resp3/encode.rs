//! Client-to-server RESP3 encoding primitives.
//!
//! Everything the client sends is an array of blob strings, so the encoder
//! only needs headers and blobs. Numeric arguments are formatted with `itoa`
//! and `ryu` to avoid going through `fmt`.

use super::NodeKind;

pub(crate) const SEPARATOR: &[u8] = b"\r\n";

fn type_byte(kind: NodeKind) -> u8 {
    match kind {
        NodeKind::SimpleString => b'+',
        NodeKind::SimpleError => b'-',
        NodeKind::Number => b':',
        NodeKind::Double => b',',
        NodeKind::Boolean => b'#',
        NodeKind::BigNumber => b'(',
        NodeKind::BlobString => b'$',
        NodeKind::BlobError => b'!',
        NodeKind::VerbatimString => b'=',
        NodeKind::Null => b'_',
        NodeKind::Array => b'*',
        NodeKind::Set => b'~',
        NodeKind::Map => b'%',
        NodeKind::Attribute => b'|',
        NodeKind::Push => b'>',
        NodeKind::StreamedString | NodeKind::StreamedStringPart => b';',
    }
}

/// Writes `<type><size>\r\n`.
pub(crate) fn add_header(out: &mut Vec<u8>, kind: NodeKind, size: usize) {
    let mut buf = itoa::Buffer::new();
    out.push(type_byte(kind));
    out.extend_from_slice(buf.format(size).as_bytes());
    out.extend_from_slice(SEPARATOR);
}

/// Writes `$<len>\r\n<data>\r\n`.
pub(crate) fn add_blob(out: &mut Vec<u8>, data: &[u8]) {
    let mut buf = itoa::Buffer::new();
    out.push(b'$');
    out.extend_from_slice(buf.format(data.len()).as_bytes());
    out.extend_from_slice(SEPARATOR);
    out.extend_from_slice(data);
    out.extend_from_slice(SEPARATOR);
}

pub(crate) fn add_blob_i64(out: &mut Vec<u8>, value: i64) {
    let mut buf = itoa::Buffer::new();
    add_blob(out, buf.format(value).as_bytes());
}

pub(crate) fn add_blob_u64(out: &mut Vec<u8>, value: u64) {
    let mut buf = itoa::Buffer::new();
    add_blob(out, buf.format(value).as_bytes());
}

pub(crate) fn add_blob_f64(out: &mut Vec<u8>, value: f64) {
    let mut buf = ryu::Buffer::new();
    add_blob(out, buf.format(value).as_bytes());
}
