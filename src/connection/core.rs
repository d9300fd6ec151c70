//! The run cycle: reader, writer, health checker and handshake running
//! cooperatively over one transport.
//!
//! The four tasks are joined with first-exit-cancels-the-rest semantics:
//! each wraps itself so that finishing (for the handshake: failing) cancels
//! the cycle token every other task selects on. The multiplexer lock is
//! never held across an await.

use std::sync::Arc;

use futures_util::future;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::handshake;
use super::stream::Transport;
use super::ConnectionInner;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::multiplexer::ConsumeOutcome;
use crate::request::Request;

pub(super) async fn run_core(
    inner: &Arc<ConnectionInner>,
    transport: Transport,
    cfg: &Config,
    cycle: CancellationToken,
) -> Result<()> {
    let (read_half, write_half) = tokio::io::split(transport);

    // Enqueue the setup request before the writer can run: HELLO priority
    // only reorders the waiting partition, so the handshake must be queued
    // before anything is staged or authentication breaks.
    let setup = handshake::setup_request(cfg);
    let (_, setup_rx) = inner.enqueue(&setup);

    let (reader_res, writer_res, health_res, setup_res) = future::join4(
        async {
            let result = reader_loop(inner, read_half, &cycle).await;
            cycle.cancel();
            result
        },
        async {
            let result = writer_loop(inner, write_half, &cycle).await;
            cycle.cancel();
            result
        },
        async {
            let result = health_loop(inner, cfg, &cycle).await;
            cycle.cancel();
            result
        },
        async {
            let result = run_handshake(cfg, setup_rx, &cycle).await;
            if result.is_err() {
                cycle.cancel();
            }
            result
        },
    )
    .await;

    // Exit reasons ranked: explicit cancel, handshake failure, pong
    // timeout, I/O errors, clean EOF. A handshake that was merely cancelled
    // defers to whatever interrupted it.
    if inner.run_token.is_cancelled() {
        debug!(prefix = %cfg.log_prefix, "run finished: cancelled");
        return Err(Error::Cancelled);
    }
    if let Err(err) = setup_res {
        if !matches!(err, Error::Cancelled) {
            warn!(prefix = %cfg.log_prefix, %err, "run finished: handshake failed");
            return Err(err);
        }
    }
    if let Err(err) = health_res {
        warn!(prefix = %cfg.log_prefix, %err, "run finished: health check failed");
        return Err(err);
    }
    if let Err(err) = reader_res {
        warn!(prefix = %cfg.log_prefix, %err, "run finished: read failed");
        return Err(err);
    }
    if let Err(err) = writer_res {
        warn!(prefix = %cfg.log_prefix, %err, "run finished: write failed");
        return Err(err);
    }
    debug!(prefix = %cfg.log_prefix, "run finished: connection closed");
    Ok(())
}

/// Feeds socket bytes into the multiplexer and routes the results.
///
/// The read buffer is taken out of the multiplexer for the duration of the
/// socket read and put back before the queue is touched again, so buffer
/// reuse survives cancellation. EOF is a clean exit, not an error.
async fn reader_loop(
    inner: &Arc<ConnectionInner>,
    mut read_half: ReadHalf<Transport>,
    cycle: &CancellationToken,
) -> Result<()> {
    loop {
        let mut buffer = {
            let mut mpx = inner.mpx.lock().unwrap();
            mpx.prepare_read()?;
            mpx.take_read_buffer()
        };

        let read_result = tokio::select! {
            _ = cycle.cancelled() => None,
            result = read_half.read(buffer.writable()) => Some(result),
        };

        let n = {
            let mut mpx = inner.mpx.lock().unwrap();
            mpx.put_read_buffer(buffer);
            let Some(result) = read_result else {
                return Ok(());
            };
            let n = result?;
            if n == 0 {
                trace!("reader: EOF");
                return Ok(());
            }
            mpx.commit_read(n);
            n
        };
        trace!(bytes = n, "reader: committed");

        loop {
            let outcome = inner.mpx.lock().unwrap().consume_next()?;
            match outcome {
                ConsumeOutcome::NeedMore => break,
                ConsumeOutcome::Response { .. } => continue,
                ConsumeOutcome::Push { message } => {
                    // Single-slot channel: parsing stalls here until the
                    // push consumer takes the previous frame.
                    tokio::select! {
                        _ = cycle.cancelled() => return Ok(()),
                        sent = inner.push_tx.send(message) => {
                            if sent.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Coalesces waiting requests and writes them, one outstanding write at a
/// time.
async fn writer_loop(
    inner: &Arc<ConnectionInner>,
    mut write_half: WriteHalf<Transport>,
    cycle: &CancellationToken,
) -> Result<()> {
    loop {
        loop {
            let wakeup = inner.writer_wakeup.notified();
            if inner.mpx.lock().unwrap().has_waiting() {
                break;
            }
            tokio::select! {
                _ = cycle.cancelled() => return Ok(()),
                _ = wakeup => {}
            }
        }

        // Snapshot the coalesced bytes; the buffer itself stays behind the
        // lock and is cleared on commit.
        let chunk = {
            let mut mpx = inner.mpx.lock().unwrap();
            mpx.prepare_write();
            mpx.write_buffer().to_vec()
        };
        if !chunk.is_empty() {
            let write_result = tokio::select! {
                _ = cycle.cancelled() => return Ok(()),
                result = write_half.write_all(&chunk) => result,
            };
            write_result?;
            trace!(bytes = chunk.len(), "writer: flushed");
        }
        inner.mpx.lock().unwrap().commit_write();
    }
}

/// Periodic PING with a reply deadline of twice the interval.
async fn health_loop(
    inner: &Arc<ConnectionInner>,
    cfg: &Config,
    cycle: &CancellationToken,
) -> Result<()> {
    let interval = cfg.health_check_interval;
    if interval.is_zero() {
        cycle.cancelled().await;
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = cycle.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
        }

        let mut ping = Request::new();
        ping.push("PING", &[cfg.health_check_id.as_str()]);

        let exec = inner.exec(&ping);
        tokio::select! {
            _ = cycle.cancelled() => return Ok(()),
            result = tokio::time::timeout(interval.saturating_mul(2), exec) => match result {
                Err(_) => {
                    warn!(prefix = %cfg.log_prefix, "health check: no PONG in time");
                    return Err(Error::PongTimeout);
                }
                // The connection is going down; the reader reports why.
                Ok(Err(_)) => return Ok(()),
                Ok(Ok(_)) => trace!("health check: PONG"),
            }
        }
    }
}

/// Waits for the setup request and validates the reply.
async fn run_handshake(
    cfg: &Config,
    setup_rx: super::ExecReceiver,
    cycle: &CancellationToken,
) -> Result<()> {
    let result = tokio::select! {
        _ = cycle.cancelled() => Err(Error::Cancelled),
        outcome = setup_rx => {
            super::into_exec_result(outcome)
                .and_then(|(response, _)| handshake::check_setup_response(&response))
        }
    };
    match result {
        Ok(()) => {
            debug!(prefix = %cfg.log_prefix, "HELLO ok");
            Ok(())
        }
        Err(err) => {
            if !matches!(err, Error::Cancelled) {
                warn!(prefix = %cfg.log_prefix, %err, "HELLO failed");
            }
            Err(err)
        }
    }
}
