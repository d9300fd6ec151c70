//! Resumable RESP3 parser.
//!
//! The parser is fed the committed region of the read buffer and keeps its
//! own offset into it, so the caller can append bytes at any time and resume.
//! It performs no allocation: every emitted [`Node`] borrows from the input.

use super::{Node, NodeKind, MAX_NESTED_DEPTH};
use crate::error::{Error, Result};

/// Streaming parser for one RESP3 frame tree.
///
/// `sizes[d]` counts the children still expected at depth `d`. The entry at
/// depth zero is a sentinel and must stay above one until the root node has
/// been seen, which is how [`Parser::done`] distinguishes a fresh parser
/// from a finished one.
#[derive(Debug, Clone)]
pub struct Parser {
    depth: usize,
    sizes: [u64; MAX_NESTED_DEPTH + 1],
    bulk: Option<NodeKind>,
    bulk_len: usize,
    consumed: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

const SIZES_SENTINEL: u64 = 2;

impl Parser {
    pub fn new() -> Parser {
        let mut sizes = [1; MAX_NESTED_DEPTH + 1];
        sizes[0] = SIZES_SENTINEL;
        Parser {
            depth: 0,
            sizes,
            bulk: None,
            bulk_len: 0,
            consumed: 0,
        }
    }

    /// Consumes bytes from `data`, the committed-but-unconsumed region of
    /// the read buffer, starting at this parser's internal offset.
    ///
    /// Returns `Ok(None)` when more bytes are required to make progress and
    /// `Ok(Some(node))` for each parsed node. After [`Parser::done`] turns
    /// true the caller must consume [`Parser::consumed`] bytes from the
    /// buffer and [`reset`](Parser::reset) the parser.
    pub fn consume<'a>(&mut self, data: &'a [u8]) -> Result<Option<Node<'a>>> {
        loop {
            let rest = &data[self.consumed..];

            if let Some(kind) = self.bulk {
                // A length header was seen, the body plus separator is owed.
                let needed = self.bulk_len + 2;
                if rest.len() < needed {
                    return Ok(None);
                }
                let node = Node::leaf(kind, self.depth, &rest[..self.bulk_len]);
                self.consumed += needed;
                self.bulk = None;
                self.sizes[self.depth] -= 1;
                self.pop_filled();
                return Ok(Some(node));
            }

            let Some(line) = split_line(rest) else {
                return Ok(None);
            };
            let advance = line.len() + 2;
            let (&type_byte, payload) = line.split_first().ok_or(Error::InvalidDataType)?;
            let kind = NodeKind::from_byte(type_byte).ok_or(Error::InvalidDataType)?;

            match kind {
                NodeKind::StreamedStringPart => {
                    let len = parse_length(payload)?;
                    if len == 0 {
                        // Stream terminator: emit an empty part and close
                        // the streamed level.
                        let node = Node::leaf(NodeKind::StreamedStringPart, self.depth, &[]);
                        self.consumed += advance;
                        self.sizes[self.depth] = 0;
                        self.pop_filled();
                        return Ok(Some(node));
                    }
                    self.bulk = Some(NodeKind::StreamedStringPart);
                    self.bulk_len = len;
                    self.consumed += advance;
                }
                NodeKind::BlobString | NodeKind::BlobError | NodeKind::VerbatimString => {
                    if kind == NodeKind::BlobString && payload == b"?" {
                        // A streamed string is read as an aggregate of
                        // unknown length; the server terminates it with a
                        // zero-length part.
                        let node = Node {
                            kind: NodeKind::StreamedString,
                            aggregate_size: 0,
                            depth: self.depth,
                            value: &[],
                        };
                        self.push_level(u64::MAX)?;
                        self.consumed += advance;
                        return Ok(Some(node));
                    }
                    self.bulk = Some(kind);
                    self.bulk_len = parse_length(payload)?;
                    self.consumed += advance;
                }
                NodeKind::Boolean => {
                    if payload.is_empty() {
                        return Err(Error::EmptyField);
                    }
                    if payload != b"t" && payload != b"f" {
                        return Err(Error::UnexpectedBoolValue);
                    }
                    return Ok(Some(self.emit_leaf(kind, payload, advance)));
                }
                NodeKind::Number | NodeKind::Double | NodeKind::BigNumber => {
                    if payload.is_empty() {
                        return Err(Error::EmptyField);
                    }
                    return Ok(Some(self.emit_leaf(kind, payload, advance)));
                }
                NodeKind::SimpleString | NodeKind::SimpleError => {
                    return Ok(Some(self.emit_leaf(kind, payload, advance)));
                }
                NodeKind::Null => {
                    return Ok(Some(self.emit_leaf(kind, &[], advance)));
                }
                NodeKind::Array
                | NodeKind::Set
                | NodeKind::Map
                | NodeKind::Attribute
                | NodeKind::Push => {
                    let len = parse_length(payload)?;
                    let node = Node {
                        kind,
                        aggregate_size: len,
                        depth: self.depth,
                        value: &[],
                    };
                    if len == 0 {
                        self.consumed += advance;
                        self.sizes[self.depth] -= 1;
                        self.pop_filled();
                    } else {
                        self.push_level(len as u64 * kind.multiplicity())?;
                        self.consumed += advance;
                    }
                    return Ok(Some(node));
                }
                NodeKind::StreamedString => unreachable!("never produced by from_byte"),
            }
        }
    }

    /// True when the current frame tree is complete. Also true on a fresh
    /// parser, so only meaningful after at least one node was emitted.
    pub fn done(&self) -> bool {
        self.depth == 0 && self.bulk.is_none() && self.sizes[0] < SIZES_SENTINEL
    }

    /// First not-yet-consumed byte of the current frame, if any.
    pub fn peek_byte(&self, data: &[u8]) -> Option<u8> {
        data.get(self.consumed).copied()
    }

    /// Bytes of the input this parser has consumed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Prepares for the next frame.
    pub fn reset(&mut self) {
        *self = Parser::new();
    }

    fn emit_leaf<'a>(&mut self, kind: NodeKind, value: &'a [u8], advance: usize) -> Node<'a> {
        let node = Node::leaf(kind, self.depth, value);
        self.consumed += advance;
        self.sizes[self.depth] -= 1;
        self.pop_filled();
        node
    }

    fn push_level(&mut self, expected: u64) -> Result<()> {
        if self.depth == MAX_NESTED_DEPTH {
            return Err(Error::ExceedsMaxNestedDepth);
        }
        self.depth += 1;
        self.sizes[self.depth] = expected;
        Ok(())
    }

    fn pop_filled(&mut self) {
        while self.sizes[self.depth] == 0 && self.depth > 0 {
            self.depth -= 1;
            self.sizes[self.depth] -= 1;
        }
    }
}

/// Returns the bytes before the first `\r\n`, or `None` if no full line is
/// buffered yet.
fn split_line(data: &[u8]) -> Option<&[u8]> {
    let mut start = 0;
    while let Some(offset) = data[start..].iter().position(|&b| b == b'\r') {
        let at = start + offset;
        match data.get(at + 1) {
            Some(b'\n') => return Some(&data[..at]),
            Some(_) => start = at + 1,
            None => return None,
        }
    }
    None
}

fn parse_length(payload: &[u8]) -> Result<usize> {
    if payload.is_empty() {
        return Err(Error::NotANumber);
    }
    let mut value: usize = 0;
    for &byte in payload {
        if !byte.is_ascii_digit() {
            return Err(Error::NotANumber);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((byte - b'0') as usize))
            .ok_or(Error::NotANumber)?;
    }
    Ok(value)
}
