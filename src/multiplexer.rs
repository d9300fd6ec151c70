//! The multiplexer: pending-request bookkeeping, write coalescing, response
//! routing and cancellation.
//!
//! This is plain state driven by the reader and writer loops; it performs no
//! I/O itself, which keeps every routing and cancellation rule unit-testable
//! without a socket or executor.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::adapter::{Adapter, Ignore, ResponseSink};
use crate::buffer::ReadBuffer;
use crate::error::{Error, Result};
use crate::request::RequestConfig;
use crate::resp3::Parser;
use crate::value::Value;

/// What one call to [`Multiplexer::consume_next`] achieved.
#[derive(Debug)]
pub(crate) enum ConsumeOutcome {
    /// The committed bytes do not contain a complete node.
    NeedMore,
    /// A response frame completed and was routed to the front entry.
    Response { bytes: usize },
    /// A push frame completed; the caller must deliver it.
    Push { message: PushMessage },
}

/// A parsed push frame on its way to the push consumer.
///
/// Unsolicited error frames (`-MISCONF ...` while nothing is pending) are
/// delivered as the `Err` variant; they belong to the receiver, not to the
/// run.
#[derive(Debug)]
pub(crate) struct PushMessage {
    pub result: Result<Value>,
    pub read_size: usize,
}

/// Everything `exec` gets back when its entry completes.
pub(crate) struct ExecOutcome {
    pub sink: ResponseSink,
    pub read_size: usize,
}

pub(crate) type Completion = oneshot::Sender<Result<ExecOutcome>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryStatus {
    /// Queued, not yet picked up by the writer.
    Waiting,
    /// Copied into the write buffer, write still in flight.
    Staged,
    /// On the wire; the next responses belong to the queue front.
    Written,
}

pub(crate) struct PendingEntry {
    id: u64,
    payload: Bytes,
    commands: usize,
    expected_responses: usize,
    remaining: usize,
    status: EntryStatus,
    sink: ResponseSink,
    read_size: usize,
    config: RequestConfig,
    completion: Option<Completion>,
}

impl PendingEntry {
    fn complete(&mut self, result: Result<ExecOutcome>) {
        if let Some(tx) = self.completion.take() {
            // The receiver may be gone; that only means nobody is waiting.
            let _ = tx.send(result);
        }
    }

    fn complete_ok(&mut self) {
        let sink = std::mem::replace(&mut self.sink, ResponseSink::Ignore(Ignore::default()));
        let read_size = self.read_size;
        self.complete(Ok(ExecOutcome { sink, read_size }));
    }

    fn complete_err(&mut self, err: Error) {
        self.complete(Err(err));
    }

    fn is_waiting(&self) -> bool {
        self.status == EntryStatus::Waiting
    }
}

/// Traffic counters, exposed through the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct Usage {
    pub commands_sent: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub responses_received: u64,
    pub pushes_received: u64,
}

/// Parameters of a new pending entry.
pub(crate) struct AddEntry {
    pub payload: Bytes,
    pub commands: usize,
    pub expected_responses: usize,
    pub hello_priority: bool,
    pub config: RequestConfig,
    pub sink: ResponseSink,
    pub completion: Completion,
}

#[derive(Default)]
pub(crate) struct Multiplexer {
    read_buffer: ReadBuffer,
    write_buffer: Vec<u8>,
    pending: VecDeque<PendingEntry>,
    parser: Parser,
    push_builder: crate::adapter::ValueBuilder,
    parsing_push: bool,
    cancel_run_called: bool,
    next_id: u64,
    usage: Usage,
}

impl Multiplexer {
    pub fn new() -> Multiplexer {
        Multiplexer::default()
    }

    /// Enqueues a request. Returns the entry id used by [`remove`].
    ///
    /// An entry with HELLO priority is rotated to the front of the Waiting
    /// partition so it hits the wire before any queued user request without
    /// disturbing requests already staged or written.
    pub fn add(&mut self, params: AddEntry) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let hello_priority = params.hello_priority;
        let expected = params.expected_responses;
        self.pending.push_back(PendingEntry {
            id,
            payload: params.payload,
            commands: params.commands,
            expected_responses: expected,
            remaining: expected,
            status: EntryStatus::Waiting,
            sink: params.sink,
            read_size: 0,
            config: params.config,
            completion: Some(params.completion),
        });

        if hello_priority {
            let entry = self.pending.pop_back().expect("just pushed");
            let front_of_waiting = self
                .pending
                .iter()
                .position(PendingEntry::is_waiting)
                .unwrap_or(self.pending.len());
            self.pending.insert(front_of_waiting, entry);
        }

        id
    }

    pub fn has_waiting(&self) -> bool {
        self.pending.iter().any(PendingEntry::is_waiting)
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Copies every Waiting entry's payload into the write buffer and marks
    /// it Staged. Returns the number of entries staged.
    pub fn prepare_write(&mut self) -> usize {
        let mut staged = 0;
        for entry in self.pending.iter_mut().filter(|e| e.is_waiting()) {
            self.write_buffer.extend_from_slice(&entry.payload);
            entry.status = EntryStatus::Staged;
            staged += 1;
        }
        staged
    }

    /// The coalesced bytes of the outstanding write. Non-empty exactly while
    /// a write is in flight.
    pub fn write_buffer(&self) -> &[u8] {
        &self.write_buffer
    }

    /// Marks the outstanding write as flushed: Staged entries become
    /// Written, and entries that expect no response (pure SUBSCRIBE-style
    /// requests) complete immediately. Returns how many were released.
    pub fn commit_write(&mut self) -> usize {
        self.usage.bytes_written += self.write_buffer.len() as u64;
        self.write_buffer.clear();

        let mut released = 0;
        for entry in &mut self.pending {
            if entry.status == EntryStatus::Staged {
                entry.status = EntryStatus::Written;
                self.usage.commands_sent += entry.commands as u64;
            }
        }
        self.pending.retain_mut(|entry| {
            if entry.status == EntryStatus::Written && entry.expected_responses == 0 {
                entry.complete_ok();
                released += 1;
                false
            } else {
                true
            }
        });
        released
    }

    pub fn prepare_read(&mut self) -> Result<()> {
        self.read_buffer.prepare()
    }

    /// Hands the read buffer to the reader for the duration of a socket
    /// read; the reader puts it back before touching the queue again.
    pub fn take_read_buffer(&mut self) -> ReadBuffer {
        std::mem::take(&mut self.read_buffer)
    }

    pub fn put_read_buffer(&mut self, buffer: ReadBuffer) {
        self.read_buffer = buffer;
    }

    pub fn commit_read(&mut self, n: usize) {
        self.read_buffer.commit(n);
    }

    /// Dispatch decision for the frame starting at the committed bytes.
    ///
    /// A frame is a push when any of these holds, checked in order: it has
    /// the push type byte; nothing is pending (covers unsolicited errors
    /// like `-MISCONF` and late pub/sub deliveries); the front request
    /// expects no response (malformed SUBSCRIBE); the front request is
    /// still Waiting, so its bytes are not on the wire and the frame cannot
    /// be its reply (MONITOR traffic, responses racing the writer on a
    /// local server). A Staged front is NOT a push owner: its bytes may
    /// already be flushed while the writer is between `prepare_write` and
    /// `commit_write`, so a reply arriving in that window belongs to it.
    fn is_next_push(&self) -> bool {
        if self.parser.peek_byte(self.read_buffer.committed()) == Some(b'>') {
            return true;
        }
        match self.pending.front() {
            None => true,
            Some(entry) => entry.expected_responses == 0 || entry.status == EntryStatus::Waiting,
        }
    }

    /// Parses as much of the committed bytes as possible.
    ///
    /// Stops after one complete frame so the caller can deliver pushes with
    /// back-pressure between frames. Parse failures complete the owning
    /// entry and are returned; they are terminal for the run.
    pub fn consume_next(&mut self) -> Result<ConsumeOutcome> {
        loop {
            if self.read_buffer.committed().len() <= self.parser.consumed() {
                return Ok(ConsumeOutcome::NeedMore);
            }
            if !self.parsing_push && self.parser.consumed() == 0 {
                self.parsing_push = self.is_next_push();
            }

            let node = match self.parser.consume(self.read_buffer.committed()) {
                Ok(Some(node)) => node,
                Ok(None) => return Ok(ConsumeOutcome::NeedMore),
                Err(err) => return self.fail_parse(err),
            };

            let route_result = if self.parsing_push {
                self.push_builder.on_node(&node)
            } else {
                match self.pending.front_mut() {
                    Some(entry) => {
                        let index = entry.expected_responses - entry.remaining;
                        entry.sink.on_node(index, &node)
                    }
                    // is_next_push routed a frame to an entry that has
                    // since disappeared; treat the rest as push data.
                    None => self.push_builder.on_node(&node),
                }
            };
            if let Err(err) = route_result {
                return self.fail_parse(err);
            }

            if !self.parser.done() {
                continue;
            }

            let bytes = self.parser.consumed();
            self.parser.reset();
            self.read_buffer.consume(bytes);
            self.usage.bytes_read += bytes as u64;

            if self.parsing_push {
                self.parsing_push = false;
                self.usage.pushes_received += 1;
                let result = self.push_builder.take_result();
                return Ok(ConsumeOutcome::Push {
                    message: PushMessage {
                        result,
                        read_size: bytes,
                    },
                });
            }

            self.usage.responses_received += 1;
            if let Some(entry) = self.pending.front_mut() {
                entry.read_size += bytes;
                let index = entry.expected_responses - entry.remaining;
                entry.sink.on_done(index);
                entry.remaining -= 1;
                if entry.remaining == 0 {
                    entry.complete_ok();
                    self.pending.pop_front();
                }
            }
            return Ok(ConsumeOutcome::Response { bytes });
        }
    }

    fn fail_parse(&mut self, err: Error) -> Result<ConsumeOutcome> {
        if !self.parsing_push {
            if let Some(mut entry) = self.pending.pop_front() {
                entry.complete_err(err.clone());
            }
        }
        Err(err)
    }

    /// Removes an entry that has not been picked up by the writer.
    pub fn remove(&mut self, id: u64) -> bool {
        let before = self.pending.len();
        self.pending
            .retain(|entry| entry.id != id || !entry.is_waiting());
        self.pending.len() != before
    }

    /// Whether the entry is still queued and already on the wire (or staged
    /// for it).
    pub fn is_written(&self, id: u64) -> bool {
        self.pending
            .iter()
            .any(|entry| entry.id == id && entry.status != EntryStatus::Waiting)
    }

    /// Completes every Waiting entry with `Cancelled`.
    pub fn cancel_waiting(&mut self) -> usize {
        let mut cancelled = 0;
        self.pending.retain_mut(|entry| {
            if entry.is_waiting() {
                entry.complete_err(Error::Cancelled);
                cancelled += 1;
                false
            } else {
                true
            }
        });
        cancelled
    }

    /// Applies the per-request connection-loss policy.
    ///
    /// Written entries survive when `cancel_if_unresponded` is off, waiting
    /// ones when `cancel_on_connection_lost` is off; survivors are reset to
    /// Waiting so the next run cycle re-sends them. Idempotent within one
    /// run cycle.
    pub fn cancel_on_conn_lost(&mut self) -> usize {
        if self.cancel_run_called {
            return 0;
        }
        self.cancel_run_called = true;

        let mut cancelled = 0;
        self.pending.retain_mut(|entry| {
            let keep = if entry.status == EntryStatus::Written {
                !entry.config.cancel_if_unresponded
            } else {
                !entry.config.cancel_on_connection_lost
            };
            if keep {
                entry.status = EntryStatus::Waiting;
                entry.remaining = entry.expected_responses;
                entry.read_size = 0;
                true
            } else {
                entry.complete_err(Error::Cancelled);
                cancelled += 1;
                false
            }
        });
        cancelled
    }

    /// Prepares for a fresh run cycle. Buffers and parser state are cleared
    /// but retained; the pending queue is untouched.
    pub fn reset(&mut self) {
        self.read_buffer.clear();
        self.write_buffer.clear();
        self.parser.reset();
        self.push_builder = crate::adapter::ValueBuilder::new();
        self.parsing_push = false;
        self.cancel_run_called = false;
    }

    pub fn reserve(&mut self, read: usize, write: usize) {
        self.read_buffer.reserve(read);
        self.write_buffer.reserve(write);
    }

    pub fn set_max_read_size(&mut self, max: usize) {
        self.read_buffer.set_max_size(max);
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    #[cfg(test)]
    fn statuses(&self) -> Vec<(u64, EntryStatus)> {
        self.pending.iter().map(|e| (e.id, e.status)).collect()
    }
}
