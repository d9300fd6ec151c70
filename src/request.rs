//! Client requests: one or more commands serialized into a pipeline.

use crate::resp3::encode;
use crate::resp3::NodeKind;

/// Commands whose reply arrives as a push frame instead of a response.
const PUSH_REPLY_COMMANDS: [&str; 6] = [
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "SSUBSCRIBE",
    "SUNSUBSCRIBE",
];

fn receives_push_reply(cmd: &str) -> bool {
    PUSH_REPLY_COMMANDS
        .iter()
        .any(|push_cmd| cmd.eq_ignore_ascii_case(push_cmd))
}

/// Per-request behavior under connection loss and during handshake.
#[derive(Debug, Clone, Copy)]
pub struct RequestConfig {
    /// If `true`, `exec` completes with `Cancelled` when the connection is
    /// lost while this request is still waiting to be written.
    pub cancel_on_connection_lost: bool,
    /// If `true`, `exec` fails with `NotConnected` when called before the
    /// connection is established.
    pub cancel_if_not_connected: bool,
    /// If `true`, `exec` completes with `Cancelled` when the connection is
    /// lost after the request was written but before it was answered.
    pub cancel_if_unresponded: bool,
    /// If the request contains a `HELLO` command, move it ahead of every
    /// request still waiting to be written.
    pub hello_with_priority: bool,
}

impl Default for RequestConfig {
    fn default() -> Self {
        RequestConfig {
            cancel_on_connection_lost: true,
            cancel_if_not_connected: false,
            cancel_if_unresponded: true,
            hello_with_priority: true,
        }
    }
}

/// A pipeline of commands plus the bookkeeping the multiplexer needs.
///
/// ```
/// use redis_mux::Request;
///
/// let mut req = Request::new();
/// req.push("HELLO", &["3"]);
/// req.push("SET", &["key", "value"]);
/// req.push("PING", &[] as &[&str]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Request {
    payload: Vec<u8>,
    commands: usize,
    expected_responses: usize,
    has_hello_priority: bool,
    config: RequestConfig,
}

impl Request {
    pub fn new() -> Request {
        Request::default()
    }

    pub fn with_config(config: RequestConfig) -> Request {
        Request {
            config,
            ..Request::default()
        }
    }

    /// Serialized wire bytes of this pipeline.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Number of commands in this request.
    pub fn commands(&self) -> usize {
        self.commands
    }

    /// Number of replies the server will send as responses. Commands that
    /// are confirmed via push frames do not count.
    pub fn expected_responses(&self) -> usize {
        self.expected_responses
    }

    pub fn has_hello_priority(&self) -> bool {
        self.has_hello_priority
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut RequestConfig {
        &mut self.config
    }

    /// Clears the request, preserving allocated memory.
    pub fn clear(&mut self) {
        self.payload.clear();
        self.commands = 0;
        self.expected_responses = 0;
        self.has_hello_priority = false;
    }

    /// Reserves payload capacity.
    pub fn reserve(&mut self, additional: usize) {
        self.payload.reserve(additional);
    }

    /// Appends a command with the given arguments.
    pub fn push<A: ToBulk>(&mut self, cmd: &str, args: &[A]) {
        let bulks: usize = args.iter().map(ToBulk::bulk_count).sum();
        encode::add_header(&mut self.payload, NodeKind::Array, 1 + bulks);
        encode::add_blob(&mut self.payload, cmd.as_bytes());
        for arg in args {
            arg.write_bulk(&mut self.payload);
        }
        self.record(cmd);
    }

    /// Appends a command with a key followed by a dynamic range of
    /// arguments. An empty range appends nothing.
    pub fn push_range<I>(&mut self, cmd: &str, key: &str, range: I)
    where
        I: IntoIterator,
        I::Item: ToBulk,
    {
        let mut bulks = 0;
        let mut tail = Vec::new();
        for item in range {
            bulks += item.bulk_count();
            item.write_bulk(&mut tail);
        }
        if bulks == 0 {
            return;
        }
        encode::add_header(&mut self.payload, NodeKind::Array, 2 + bulks);
        encode::add_blob(&mut self.payload, cmd.as_bytes());
        encode::add_blob(&mut self.payload, key.as_bytes());
        self.payload.extend_from_slice(&tail);
        self.record(cmd);
    }

    /// Appends a command with a dynamic range of arguments and no key.
    /// An empty range appends nothing.
    pub fn push_range_without_key<I>(&mut self, cmd: &str, range: I)
    where
        I: IntoIterator,
        I::Item: ToBulk,
    {
        let mut bulks = 0;
        let mut tail = Vec::new();
        for item in range {
            bulks += item.bulk_count();
            item.write_bulk(&mut tail);
        }
        if bulks == 0 {
            return;
        }
        encode::add_header(&mut self.payload, NodeKind::Array, 1 + bulks);
        encode::add_blob(&mut self.payload, cmd.as_bytes());
        self.payload.extend_from_slice(&tail);
        self.record(cmd);
    }

    /// Appends another request's commands to this one.
    pub(crate) fn append(&mut self, other: &Request) {
        self.payload.extend_from_slice(&other.payload);
        self.commands += other.commands;
        self.expected_responses += other.expected_responses;
        self.has_hello_priority |= other.has_hello_priority;
    }

    fn record(&mut self, cmd: &str) {
        self.commands += 1;
        if !receives_push_reply(cmd) {
            self.expected_responses += 1;
        }
        if cmd.eq_ignore_ascii_case("HELLO") && self.config.hello_with_priority {
            self.has_hello_priority = true;
        }
    }
}

/// Serialization of one command argument into RESP3 bulk strings.
///
/// Implemented for the usual string, byte and numeric types; pairs write two
/// bulks, which makes maps usable with `HSET`-shaped commands:
///
/// ```
/// use redis_mux::Request;
/// use std::collections::BTreeMap;
///
/// let map = BTreeMap::from([("f1", "v1"), ("f2", "v2")]);
/// let mut req = Request::new();
/// req.push_range("HSET", "key", &map);
/// ```
pub trait ToBulk {
    fn write_bulk(&self, out: &mut Vec<u8>);

    /// Number of bulk strings this argument expands to.
    fn bulk_count(&self) -> usize {
        1
    }
}

impl ToBulk for str {
    fn write_bulk(&self, out: &mut Vec<u8>) {
        encode::add_blob(out, self.as_bytes());
    }
}

impl ToBulk for String {
    fn write_bulk(&self, out: &mut Vec<u8>) {
        encode::add_blob(out, self.as_bytes());
    }
}

impl ToBulk for [u8] {
    fn write_bulk(&self, out: &mut Vec<u8>) {
        encode::add_blob(out, self);
    }
}

impl ToBulk for Vec<u8> {
    fn write_bulk(&self, out: &mut Vec<u8>) {
        encode::add_blob(out, self);
    }
}

macro_rules! int_to_bulk {
    ($($ty:ty => $write:ident),*) => {
        $(impl ToBulk for $ty {
            fn write_bulk(&self, out: &mut Vec<u8>) {
                encode::$write(out, *self as _);
            }
        })*
    };
}

int_to_bulk!(
    i64 => add_blob_i64,
    i32 => add_blob_i64,
    u64 => add_blob_u64,
    u32 => add_blob_u64,
    usize => add_blob_u64
);

impl ToBulk for f64 {
    fn write_bulk(&self, out: &mut Vec<u8>) {
        encode::add_blob_f64(out, *self);
    }
}

impl<T: ToBulk + ?Sized> ToBulk for &T {
    fn write_bulk(&self, out: &mut Vec<u8>) {
        (**self).write_bulk(out);
    }

    fn bulk_count(&self) -> usize {
        (**self).bulk_count()
    }
}

impl<A: ToBulk, B: ToBulk> ToBulk for (A, B) {
    fn write_bulk(&self, out: &mut Vec<u8>) {
        self.0.write_bulk(out);
        self.1.write_bulk(out);
    }

    fn bulk_count(&self) -> usize {
        self.0.bulk_count() + self.1.bulk_count()
    }
}
