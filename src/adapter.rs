//! Node sinks: the protocol-to-value boundary.
//!
//! The multiplexer does not know what a response means; it only pushes parser
//! nodes into an [`Adapter`] together with the ordinal of the command the
//! node belongs to. The known sinks are carried as a sum type
//! ([`ResponseSink`]) with a boxed escape hatch for custom consumers.

use crate::error::{Error, Result};
use crate::resp3::{Node, NodeKind};
use crate::response::Response;
use crate::value::{PushKind, Value, VerbatimFormat};

/// Consumer of parser nodes.
///
/// `index` is the ordinal of the command inside its request whose reply the
/// node belongs to. `on_done` fires once that command's reply tree is
/// complete.
pub trait Adapter {
    fn on_node(&mut self, index: usize, node: &Node<'_>) -> Result<()>;

    fn on_done(&mut self, index: usize) {
        let _ = index;
    }
}

/// Drops every node but still surfaces server error replies.
#[derive(Debug, Default)]
pub struct Ignore {
    error: Option<Error>,
}

impl Ignore {
    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }
}

impl Adapter for Ignore {
    fn on_node(&mut self, _index: usize, node: &Node<'_>) -> Result<()> {
        if self.error.is_none() {
            if let Some(err) = node_error(node) {
                self.error = Some(err);
            }
        }
        Ok(())
    }
}

/// Owned copy of a parser node, the building block of the generic response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedNode {
    pub kind: NodeKind,
    pub aggregate_size: usize,
    pub depth: usize,
    pub value: Vec<u8>,
}

/// Collects the raw pre-order node sequence of one or more replies.
///
/// Unlike [`ValueBuilder`] it does not reject error nodes; consumers that
/// need to allow errors in the middle of a reply (the Sentinel resolver)
/// inspect the collected list themselves.
#[derive(Debug, Default)]
pub struct NodeCollector {
    pub nodes: Vec<OwnedNode>,
}

impl Adapter for NodeCollector {
    fn on_node(&mut self, _index: usize, node: &Node<'_>) -> Result<()> {
        self.nodes.push(OwnedNode {
            kind: node.kind,
            aggregate_size: node.aggregate_size,
            depth: node.depth,
            value: node.value.to_vec(),
        });
        Ok(())
    }
}

fn node_error(node: &Node<'_>) -> Option<Error> {
    if !node.kind.is_error() {
        return None;
    }
    let text = String::from_utf8_lossy(node.value).into_owned();
    Some(match node.kind {
        NodeKind::SimpleError => Error::Resp3SimpleError(text),
        _ => Error::Resp3BlobError(text),
    })
}

enum Frame {
    Aggregate {
        kind: NodeKind,
        expected: usize,
        items: Vec<Value>,
    },
    Streamed(Vec<u8>),
}

/// Builds one owned [`Value`] tree out of a node sequence.
///
/// Node values are views into the read buffer, so everything retained is
/// copied here. The first error node of a reply poisons the builder: the
/// remaining nodes of that reply are swallowed and the result is the error.
#[derive(Default)]
pub struct ValueBuilder {
    stack: Vec<Frame>,
    root: Option<Value>,
    error: Option<Error>,
}

impl ValueBuilder {
    pub fn new() -> ValueBuilder {
        ValueBuilder::default()
    }

    pub fn on_node(&mut self, node: &Node<'_>) -> Result<()> {
        if self.error.is_some() {
            return Ok(());
        }
        if let Some(err) = node_error(node) {
            self.error = Some(err);
            return Ok(());
        }

        match node.kind {
            NodeKind::StreamedString => {
                self.stack.push(Frame::Streamed(Vec::new()));
                Ok(())
            }
            NodeKind::StreamedStringPart => {
                if !matches!(self.stack.last(), Some(Frame::Streamed(_))) {
                    return Err(Error::IncompatibleNodeDepth);
                }
                if node.value.is_empty() {
                    // Terminator part: the stream becomes a bulk string.
                    let Some(Frame::Streamed(buf)) = self.stack.pop() else {
                        unreachable!()
                    };
                    self.place(Value::BulkString(buf));
                } else if let Some(Frame::Streamed(buf)) = self.stack.last_mut() {
                    buf.extend_from_slice(node.value);
                }
                Ok(())
            }
            kind if kind.is_aggregate() => {
                let expected = node.aggregate_size * kind.multiplicity() as usize;
                if expected == 0 {
                    let empty = finish_aggregate(kind, Vec::new());
                    self.place(empty);
                } else {
                    self.stack.push(Frame::Aggregate {
                        kind,
                        expected,
                        items: Vec::with_capacity(expected),
                    });
                }
                Ok(())
            }
            _ => {
                let value = leaf_value(node)?;
                self.place(value);
                Ok(())
            }
        }
    }

    fn place(&mut self, value: Value) {
        let mut value = value;
        loop {
            match self.stack.last_mut() {
                Some(Frame::Aggregate {
                    kind,
                    expected,
                    items,
                }) => {
                    items.push(value);
                    if items.len() < *expected {
                        return;
                    }
                    let kind = *kind;
                    let Some(Frame::Aggregate { items, .. }) = self.stack.pop() else {
                        unreachable!()
                    };
                    value = finish_aggregate(kind, items);
                }
                Some(Frame::Streamed(_)) | None => {
                    self.root = Some(value);
                    return;
                }
            }
        }
    }

    /// Finishes the current reply, leaving the builder ready for the next.
    pub fn take_result(&mut self) -> Result<Value> {
        self.stack.clear();
        match self.error.take() {
            Some(err) => {
                self.root = None;
                Err(err)
            }
            None => Ok(self.root.take().unwrap_or(Value::Null)),
        }
    }
}

fn leaf_value(node: &Node<'_>) -> Result<Value> {
    Ok(match node.kind {
        NodeKind::SimpleString => Value::SimpleString(
            std::str::from_utf8(node.value)
                .map_err(|_| Error::InvalidDataType)?
                .to_owned(),
        ),
        NodeKind::Number => Value::Int(
            std::str::from_utf8(node.value)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(Error::NotANumber)?,
        ),
        NodeKind::Double => Value::Double(
            std::str::from_utf8(node.value)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(Error::NotANumber)?,
        ),
        NodeKind::Boolean => Value::Boolean(node.value == b"t"),
        NodeKind::BigNumber => Value::BigNumber(
            num_bigint::BigInt::parse_bytes(node.value, 10).ok_or(Error::NotANumber)?,
        ),
        NodeKind::BlobString => Value::BulkString(node.value.to_vec()),
        NodeKind::VerbatimString => {
            // Payload is `<fmt>:<text>` with a three-letter format.
            if node.value.len() < 4 || node.value[3] != b':' {
                return Err(Error::InvalidDataType);
            }
            Value::VerbatimString {
                format: VerbatimFormat::from_prefix(&node.value[..3]),
                text: String::from_utf8_lossy(&node.value[4..]).into_owned(),
            }
        }
        NodeKind::Null => Value::Null,
        _ => return Err(Error::InvalidDataType),
    })
}

fn finish_aggregate(kind: NodeKind, items: Vec<Value>) -> Value {
    match kind {
        NodeKind::Array => Value::Array(items),
        NodeKind::Set => Value::Set(items),
        NodeKind::Map | NodeKind::Attribute => {
            let mut items = items.into_iter();
            let mut pairs = Vec::with_capacity(items.len() / 2);
            while let (Some(k), Some(v)) = (items.next(), items.next()) {
                pairs.push((k, v));
            }
            if kind == NodeKind::Map {
                Value::Map(pairs)
            } else {
                Value::Attribute(pairs)
            }
        }
        NodeKind::Push => {
            let mut items = items.into_iter();
            let kind = match items.next() {
                Some(Value::SimpleString(name)) => PushKind::from_name(&name),
                Some(Value::BulkString(name)) => {
                    PushKind::from_name(&String::from_utf8_lossy(&name))
                }
                _ => PushKind::Other(String::new()),
            };
            Value::Push {
                kind,
                data: items.collect(),
            }
        }
        _ => unreachable!("not an aggregate"),
    }
}

/// Per-command response sink: one [`Value`] slot per expected reply.
#[derive(Default)]
pub struct ValuesSink {
    builder: ValueBuilder,
    slots: Vec<Result<Value>>,
}

impl ValuesSink {
    pub fn with_expected(expected: usize) -> ValuesSink {
        ValuesSink {
            builder: ValueBuilder::new(),
            slots: Vec::with_capacity(expected),
        }
    }

    pub fn into_response(self) -> Response {
        Response::from_slots(self.slots)
    }
}

impl Adapter for ValuesSink {
    fn on_node(&mut self, _index: usize, node: &Node<'_>) -> Result<()> {
        self.builder.on_node(node)
    }

    fn on_done(&mut self, _index: usize) {
        self.slots.push(self.builder.take_result());
    }
}

/// Decodes one complete RESP3 frame from `wire` into an owned [`Value`].
///
/// Fails with the parser's error on malformed input and with
/// [`Error::IncompatibleSize`] when the input ends before the frame does.
/// Server error frames come back as `Resp3SimpleError`/`Resp3BlobError`.
/// Trailing bytes after the first frame are ignored.
///
/// ```
/// use redis_mux::{deserialize, Value};
///
/// let value = deserialize(b"*2\r\n$2\r\nhi\r\n:1\r\n").unwrap();
/// assert_eq!(
///     value,
///     Value::Array(vec![Value::BulkString(b"hi".to_vec()), Value::Int(1)])
/// );
/// ```
pub fn deserialize(wire: &[u8]) -> crate::error::Result<Value> {
    let mut parser = crate::resp3::Parser::new();
    let mut builder = ValueBuilder::new();
    loop {
        match parser.consume(wire)? {
            Some(node) => {
                builder.on_node(&node)?;
                if parser.done() {
                    return builder.take_result();
                }
            }
            None => return Err(Error::IncompatibleSize),
        }
    }
}

/// Sum of the known sinks plus a trait-object escape hatch.
pub enum ResponseSink {
    Ignore(Ignore),
    Values(ValuesSink),
    Nodes(NodeCollector),
    Custom(Box<dyn Adapter + Send>),
}

impl Adapter for ResponseSink {
    fn on_node(&mut self, index: usize, node: &Node<'_>) -> Result<()> {
        match self {
            ResponseSink::Ignore(sink) => sink.on_node(index, node),
            ResponseSink::Values(sink) => sink.on_node(index, node),
            ResponseSink::Nodes(sink) => sink.on_node(index, node),
            ResponseSink::Custom(sink) => sink.on_node(index, node),
        }
    }

    fn on_done(&mut self, index: usize) {
        match self {
            ResponseSink::Ignore(sink) => sink.on_done(index),
            ResponseSink::Values(sink) => sink.on_done(index),
            ResponseSink::Nodes(sink) => sink.on_done(index),
            ResponseSink::Custom(sink) => sink.on_done(index),
        }
    }
}
