//! Symmetric RPC connection over any byte stream.
//!
//! [`RpcConnection::open`] splits the stream, spawns a reader task and a
//! writer task, and hands back the connection plus a receiver of incoming
//! calls. Outgoing calls are matched to answers by `call_id`. When the
//! stream ends or [`RpcConnection::close`] is called, every outstanding call
//! fails with [`RpcError::ConnectionLost`] and the incoming receiver closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;
use crate::protocol::{codec, decode_frame, encode_frame, Command, Frame};

type PendingCalls = HashMap<u64, oneshot::Sender<Result<(), RpcError>>>;

/// One end of an RPC link.
pub struct RpcConnection {
    label: String,
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: Mutex<PendingCalls>,
    next_call_id: AtomicU64,
    closed: CancellationToken,
}

/// A call received from the remote side, awaiting a response.
pub struct IncomingCall {
    pub command: Command,
    call_id: u64,
    outgoing: mpsc::UnboundedSender<Frame>,
}

impl IncomingCall {
    /// Answer the call. Errors are sent to the caller as their message.
    pub fn respond(self, result: Result<(), String>) {
        let frame = match result {
            Ok(()) => Frame::Answer {
                call_id: self.call_id,
            },
            Err(message) => Frame::Error {
                call_id: self.call_id,
                message,
            },
        };
        // A closed connection has nobody left to answer.
        let _ = self.outgoing.send(frame);
    }
}

impl RpcConnection {
    /// Start serving `stream`.
    pub fn open<S>(
        stream: S,
        label: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<IncomingCall>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            label: label.into(),
            outgoing,
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });

        let frames_out = FramedWrite::new(writer, codec());
        let frames_in = FramedRead::new(reader, codec());
        tokio::spawn(Arc::clone(&connection).write_loop(frames_out, outgoing_rx));
        tokio::spawn(Arc::clone(&connection).read_loop(frames_in, incoming_tx));

        tracing::debug!(connection = %connection.label, "RPC connection opened");
        (connection, incoming_rx)
    }

    /// Human-readable name of the remote end, for logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Issue `command` and wait for the remote answer.
    pub async fn call(&self, command: Command) -> Result<(), RpcError> {
        if self.closed.is_cancelled() {
            return Err(RpcError::Closed);
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(call_id, tx);

        // Shutdown may have drained the pending map before our insert.
        if self.closed.is_cancelled() {
            self.pending.lock().await.remove(&call_id);
            return Err(RpcError::ConnectionLost);
        }

        tracing::trace!(connection = %self.label, call_id, command = command.name(), "Sending call");
        if self.outgoing.send(Frame::Call { call_id, command }).is_err() {
            self.pending.lock().await.remove(&call_id);
            return Err(RpcError::ConnectionLost);
        }

        rx.await.unwrap_or(Err(RpcError::ConnectionLost))
    }

    /// Close the link, failing all outstanding calls.
    pub async fn close(&self) {
        self.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the link is closed, from either side.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    async fn shutdown(&self) {
        let first = !self.closed.is_cancelled();
        self.closed.cancel();
        let pending = std::mem::take(&mut *self.pending.lock().await);
        for (_, tx) in pending {
            let _ = tx.send(Err(RpcError::ConnectionLost));
        }
        if first {
            tracing::debug!(connection = %self.label, "RPC connection closed");
        }
    }

    async fn resolve(&self, call_id: u64, result: Result<(), RpcError>) {
        match self.pending.lock().await.remove(&call_id) {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => {
                tracing::warn!(connection = %self.label, call_id, "Response for unknown call");
            }
        }
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut frames: FramedWrite<W, LengthDelimitedCodec>,
        mut outgoing: mpsc::UnboundedReceiver<Frame>,
    ) where
        W: AsyncWrite + Send + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = outgoing.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let bytes = match encode_frame(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(connection = %self.label, error = %e, "Failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = frames.send(bytes).await {
                tracing::warn!(connection = %self.label, error = %e, "Write failed");
                break;
            }
        }
        self.shutdown().await;
    }

    async fn read_loop<R>(
        self: Arc<Self>,
        mut frames: FramedRead<R, LengthDelimitedCodec>,
        incoming: mpsc::UnboundedSender<IncomingCall>,
    ) where
        R: AsyncRead + Send + Unpin,
    {
        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => break,
                next = frames.next() => next,
            };
            let bytes = match next {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    tracing::warn!(connection = %self.label, error = %e, "Read failed");
                    break;
                }
                None => {
                    tracing::debug!(connection = %self.label, "Remote closed the connection");
                    break;
                }
            };

            match decode_frame(&bytes) {
                Ok(Frame::Call { call_id, command }) => {
                    let call = IncomingCall {
                        command,
                        call_id,
                        outgoing: self.outgoing.clone(),
                    };
                    if let Err(rejected) = incoming.send(call) {
                        rejected
                            .0
                            .respond(Err("Calls are not accepted on this connection".into()));
                    }
                }
                Ok(Frame::Answer { call_id }) => self.resolve(call_id, Ok(())).await,
                Ok(Frame::Error { call_id, message }) => {
                    self.resolve(call_id, Err(RpcError::Remote(message))).await
                }
                Err(e) => {
                    tracing::warn!(connection = %self.label, error = %e, "Malformed frame, closing");
                    break;
                }
            }
        }
        self.shutdown().await;
    }
}
