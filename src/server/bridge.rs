//! Serialized request/reply bridge over a subprocess's stdin and stdout.
//!
//! One worker task per running subprocess drains a FIFO queue of jobs. For a
//! call it writes the payload as a single JSON line, then waits for the next
//! decoded line from stdout and hands it to the caller. Replies are matched to
//! calls purely by order; the protocol's own `id` is never consulted.
//!
//! A separate reader task decodes stdout. When a call times out the reader keeps
//! running, so a reply that arrives late stays queued and is handed to the next
//! call that waits for one. A request line is always written in full, even
//! after its caller has timed out. Subprocesses must answer in receipt order
//! and must not emit unsolicited messages between a request and its reply.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::GatewayError;

/// Pending jobs per server before submitters start waiting.
const QUEUE_CAPACITY: usize = 64;

/// Decoded replies buffered between the reader and the worker.
const REPLY_BUFFER: usize = 64;

enum Job {
    Call {
        payload: Value,
        reply_tx: oneshot::Sender<crate::Result<Value>>,
    },
    Notify {
        payload: Value,
    },
}

/// Submission handle for a server's call worker.
///
/// Cloning is cheap; the worker runs until every handle is dropped.
#[derive(Clone)]
pub struct CallQueue {
    server_id: String,
    job_tx: mpsc::Sender<Job>,
}

impl CallQueue {
    /// Start the reader and worker tasks over the given streams.
    ///
    /// `timeout` bounds the write plus wait-for-reply cycle of each call. A
    /// write still in progress at the deadline is finished in the background
    /// so the next request starts on a line boundary.
    pub fn spawn<W, R>(server_id: String, writer: W, reader: R, timeout: Duration) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (job_tx, job_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);

        tokio::spawn(run_reader(server_id.clone(), reader, reply_tx));
        tokio::spawn(run_worker(
            server_id.clone(),
            writer,
            reply_rx,
            job_rx,
            timeout,
        ));

        Self { server_id, job_tx }
    }

    /// Send a reply-expecting message and wait for the next reply line.
    pub async fn call(&self, payload: Value) -> crate::Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.job_tx
            .send(Job::Call { payload, reply_tx })
            .await
            .map_err(|_| self.closed())?;
        reply_rx.await.map_err(|_| {
            GatewayError::Transport(self.server_id.clone(), "call worker dropped the reply".into())
        })?
    }

    /// Queue a fire-and-forget message. Returns once it is queued, not written.
    pub async fn notify(&self, payload: Value) -> crate::Result<()> {
        self.job_tx
            .send(Job::Notify { payload })
            .await
            .map_err(|_| self.closed())
    }

    fn closed(&self) -> GatewayError {
        GatewayError::Transport(self.server_id.clone(), "call queue closed".into())
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, payload: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(payload).map_err(std::io::Error::other)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Decode stdout line by line. Lines that are not JSON, including ones that are
/// not valid UTF-8, are noise from the server and are dropped.
async fn run_reader<R: AsyncRead + Unpin>(
    server_id: String,
    reader: R,
    reply_tx: mpsc::Sender<Value>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!(server = %server_id, "stdout closed");
                break;
            }
            Ok(_) => {
                let line = buf.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<Value>(line) {
                    Ok(value) => {
                        if reply_tx.send(value).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        tracing::debug!(
                            server = %server_id,
                            line = %String::from_utf8_lossy(line),
                            "discarding non-JSON stdout line"
                        );
                    }
                }
            }
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "stdout read failed");
                break;
            }
        }
    }
    // reply_tx dropped here: waiting calls see the stream as closed
}

fn log_timeout(server_id: &str, timeout: Duration) {
    tracing::warn!(
        server = %server_id,
        timeout_ms = timeout.as_millis() as u64,
        "call timed out; a late reply will be handed to the next call"
    );
}

async fn run_worker<W: AsyncWrite + Unpin>(
    server_id: String,
    mut writer: W,
    mut reply_rx: mpsc::Receiver<Value>,
    mut job_rx: mpsc::Receiver<Job>,
    timeout: Duration,
) {
    while let Some(job) = job_rx.recv().await {
        match job {
            Job::Notify { payload } => {
                if let Err(e) = write_line(&mut writer, &payload).await {
                    tracing::warn!(server = %server_id, error = %e, "failed to write notification");
                }
            }
            Job::Call { payload, reply_tx } => {
                if reply_tx.is_closed() {
                    tracing::debug!(server = %server_id, "caller went away before dispatch, skipping");
                    continue;
                }

                let deadline = Instant::now() + timeout;
                let write = write_line(&mut writer, &payload);
                tokio::pin!(write);
                let written = match tokio::time::timeout_at(deadline, &mut write).await {
                    Ok(written) => written,
                    Err(_) => {
                        log_timeout(&server_id, timeout);
                        let _ = reply_tx.send(Err(GatewayError::CallTimeout(server_id.clone())));
                        // a partial line would corrupt the next request
                        if let Err(e) = write.await {
                            tracing::warn!(server = %server_id, error = %e, "failed to finish request write");
                        }
                        continue;
                    }
                };

                let result = match written {
                    Err(e) => Err(GatewayError::Transport(server_id.clone(), e.to_string())),
                    Ok(()) => match tokio::time::timeout_at(deadline, reply_rx.recv()).await {
                        Ok(Some(reply)) => Ok(reply),
                        Ok(None) => Err(GatewayError::Transport(
                            server_id.clone(),
                            "stdout closed before reply".into(),
                        )),
                        Err(_) => {
                            log_timeout(&server_id, timeout);
                            Err(GatewayError::CallTimeout(server_id.clone()))
                        }
                    },
                };

                let _ = reply_tx.send(result);
            }
        }
    }
    tracing::debug!(server = %server_id, "call worker stopped");
}
