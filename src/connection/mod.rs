//! The connection: public API and the reconnection supervisor.

mod core;
mod handshake;
mod stream;

pub(crate) use self::stream::resolve as resolve_endpoints;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapter::{ResponseSink, ValuesSink};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::multiplexer::{AddEntry, Multiplexer, PushMessage, Usage};
use crate::request::Request;
use crate::response::Response;
use crate::sentinel;

/// Cancellation targets for [`Connection::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Cancel every request still waiting to be written.
    Exec,
    /// Close the connection and stop [`Connection::run`].
    Run,
    /// Cancel an in-flight [`Connection::receive`].
    Receive,
    /// Run, then Receive, then Exec.
    All,
}

pub(crate) struct ConnectionInner {
    pub(super) cfg: Mutex<Config>,
    pub(super) mpx: Mutex<Multiplexer>,
    pub(super) writer_wakeup: Notify,
    pub(super) push_tx: mpsc::Sender<PushMessage>,
    pub(super) push_rx: tokio::sync::Mutex<mpsc::Receiver<PushMessage>>,
    pub(super) receive_cancel: Notify,
    pub(super) run_token: CancellationToken,
    pub(super) cycle_token: Mutex<CancellationToken>,
    pub(super) run_lock: tokio::sync::Mutex<()>,
    pub(super) open: AtomicBool,
}

impl ConnectionInner {
    pub(super) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Queues a request without waiting. The returned receiver completes
    /// when the entry does.
    pub(super) fn enqueue(&self, req: &Request) -> (u64, ExecReceiver) {
        let (tx, rx) = oneshot::channel();
        let expected = req.expected_responses();
        let id = self.mpx.lock().unwrap().add(AddEntry {
            payload: Bytes::copy_from_slice(req.payload()),
            commands: req.commands(),
            expected_responses: expected,
            hello_priority: req.has_hello_priority(),
            config: *req.config(),
            sink: ResponseSink::Values(ValuesSink::with_expected(expected)),
            completion: tx,
        });
        self.writer_wakeup.notify_one();
        (id, rx)
    }

    /// Enqueues a request and waits for its responses.
    pub(super) async fn exec(self: &Arc<Self>, req: &Request) -> Result<(Response, usize)> {
        if req.commands() == 0 {
            return Ok((Response::new(), 0));
        }
        if req.config().cancel_if_not_connected && !self.is_open() {
            return Err(Error::NotConnected);
        }

        let (id, rx) = self.enqueue(req);

        let mut guard = ExecGuard {
            inner: Arc::clone(self),
            id,
            armed: true,
        };
        let outcome = rx.await;
        guard.armed = false;

        into_exec_result(outcome)
    }
}

pub(super) type ExecReceiver = oneshot::Receiver<Result<crate::multiplexer::ExecOutcome>>;

pub(super) fn into_exec_result(
    outcome: std::result::Result<Result<crate::multiplexer::ExecOutcome>, oneshot::error::RecvError>,
) -> Result<(Response, usize)> {
    match outcome {
        Ok(Ok(outcome)) => {
            let response = match outcome.sink {
                ResponseSink::Values(sink) => sink.into_response(),
                _ => Response::new(),
            };
            Ok((response, outcome.read_size))
        }
        Ok(Err(err)) => Err(err),
        // The completion sender vanished with its run cycle.
        Err(_) => Err(Error::Cancelled),
    }
}

/// Unwinds an abandoned exec.
///
/// Dropping the exec future while the request is still waiting simply
/// removes it. Once the bytes are on the wire the reply cannot be un-asked
/// for, so the current cycle's connection is torn down instead; the
/// supervisor reconnects if configured to.
struct ExecGuard {
    inner: Arc<ConnectionInner>,
    id: u64,
    armed: bool,
}

impl Drop for ExecGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = {
            let mut mpx = self.inner.mpx.lock().unwrap();
            mpx.remove(self.id) || !mpx.is_written(self.id)
        };
        if !removed {
            self.inner.cycle_token.lock().unwrap().cancel();
        }
    }
}

/// A multiplexed RESP3 connection.
///
/// Cloning is cheap and every clone drives the same connection, so requests
/// from any number of tasks share one transport. [`run`](Connection::run)
/// must be running (typically in its own task) for any traffic to flow.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(config: Config) -> Connection {
        let (push_tx, push_rx) = mpsc::channel(1);
        let mut mpx = Multiplexer::new();
        mpx.set_max_read_size(config.max_read_buffer);
        Connection {
            inner: Arc::new(ConnectionInner {
                cfg: Mutex::new(config),
                mpx: Mutex::new(mpx),
                writer_wakeup: Notify::new(),
                push_tx,
                push_rx: tokio::sync::Mutex::new(push_rx),
                receive_cancel: Notify::new(),
                run_token: CancellationToken::new(),
                cycle_token: Mutex::new(CancellationToken::new()),
                run_lock: tokio::sync::Mutex::new(()),
                open: AtomicBool::new(false),
            }),
        }
    }

    /// Drives the connection: resolve, connect, handshake, run, and (when
    /// `reconnect_wait_interval` is non-zero) reconnect after failures.
    ///
    /// Returns when cancelled, on a handshake failure, or on the first
    /// error with reconnection disabled. A server-initiated close with
    /// reconnection disabled returns `Ok(())`.
    pub async fn run(&self) -> Result<()> {
        let _running = self.inner.run_lock.lock().await;
        loop {
            if self.inner.run_token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let outcome = self.run_cycle().await;
            let wait = self.inner.cfg.lock().unwrap().reconnect_wait_interval;
            match outcome {
                Err(err) if !err.is_reconnectable() => return Err(err),
                outcome => {
                    if wait.is_zero() {
                        return outcome;
                    }
                    if let Err(err) = &outcome {
                        warn!(%err, "connection lost, reconnecting");
                    } else {
                        debug!("connection closed, reconnecting");
                    }
                    tokio::select! {
                        _ = self.inner.run_token.cancelled() => return Err(Error::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn run_cycle(&self) -> Result<()> {
        let mut cfg = self.inner.cfg.lock().unwrap().clone();
        {
            let mut mpx = self.inner.mpx.lock().unwrap();
            mpx.reset();
            mpx.set_max_read_size(cfg.max_read_buffer);
        }
        let cycle = self.inner.run_token.child_token();
        *self.inner.cycle_token.lock().unwrap() = cycle.clone();

        if !cfg.sentinel.addresses.is_empty() {
            let resolution = sentinel::resolve(&cfg).await?;
            debug!(
                prefix = %cfg.log_prefix,
                server = %resolution.server_addr,
                "sentinel resolution done"
            );
            cfg.addr = resolution.server_addr.clone();
            self.inner.cfg.lock().unwrap().sentinel.addresses = resolution.sentinels;
        }

        let addr = cfg.addr.clone();
        let transport = stream::connect(&cfg, &addr).await?;

        self.inner.open.store(true, Ordering::Release);
        // Requests kept across the reconnect are waiting again.
        self.inner.writer_wakeup.notify_one();

        let result = core::run_core(&self.inner, transport, &cfg, cycle).await;

        self.inner.open.store(false, Ordering::Release);
        self.inner.mpx.lock().unwrap().cancel_on_conn_lost();
        result
    }

    /// Executes a request and fills `response` with one slot per command
    /// that expects a reply. Returns the number of response bytes read.
    ///
    /// Dropping the returned future cancels the request: a request not yet
    /// written is removed, a written one tears the connection down (the
    /// in-flight reply cannot be discarded any other way).
    pub async fn exec(&self, req: &Request, response: &mut Response) -> Result<usize> {
        let (resp, read_size) = self.inner.exec(req).await?;
        *response = resp;
        Ok(read_size)
    }

    /// Waits for the next server push and stores it as the single slot of
    /// `response`. Returns the number of bytes the push occupied.
    ///
    /// Unsolicited error frames are returned as errors of this call; they
    /// do not affect the run.
    pub async fn receive(&self, response: &mut Response) -> Result<usize> {
        let mut rx = self.inner.push_rx.lock().await;
        tokio::select! {
            _ = self.inner.receive_cancel.notified() => Err(Error::Cancelled),
            message = rx.recv() => {
                let message = message.ok_or(Error::Cancelled)?;
                let value = message.result?;
                *response = Response::from_slots(vec![Ok(value)]);
                Ok(message.read_size)
            }
        }
    }

    /// Cancels the given operation; returns how many waiters were affected.
    pub fn cancel(&self, op: Operation) -> usize {
        match op {
            Operation::Exec => self.inner.mpx.lock().unwrap().cancel_waiting(),
            Operation::Run => {
                self.inner.run_token.cancel();
                self.inner.writer_wakeup.notify_one();
                self.inner.mpx.lock().unwrap().cancel_on_conn_lost()
            }
            Operation::Receive => {
                self.inner.receive_cancel.notify_waiters();
                1
            }
            Operation::All => {
                let mut n = self.cancel(Operation::Run);
                n += self.cancel(Operation::Receive);
                n += self.cancel(Operation::Exec);
                n
            }
        }
    }

    /// Whether the connection is established and running.
    pub fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    /// Reserves read and write buffer capacity.
    pub fn reserve(&self, read: usize, write: usize) {
        self.inner.mpx.lock().unwrap().reserve(read, write);
    }

    /// Caps read-buffer growth; exceeding the cap fails the run with
    /// [`Error::ExceedsMaximumReadBufferSize`].
    pub fn set_max_buffer_read_size(&self, max: usize) {
        self.inner.cfg.lock().unwrap().max_read_buffer = max;
        self.inner.mpx.lock().unwrap().set_max_read_size(max);
    }

    /// Traffic counters since the connection object was created.
    pub fn usage(&self) -> Usage {
        self.inner.mpx.lock().unwrap().usage()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.is_open())
            .finish()
    }
}
