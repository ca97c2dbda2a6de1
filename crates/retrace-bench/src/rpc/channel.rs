// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client-side transport: one channel per target address, shared by
//! every handler on the server and by the load-generating client.
//! Calls register a pending entry keyed by frame id; the connection's
//! reader task matches responses back to whichever completion queue
//! issued the call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::{Completion, ConnWrite, CqSender, Payload, RpcError, Tag};
use crate::wire::{decode_frame, encode_frame, ExecRequest, Frame};

struct PendingCall {
    cq: CqSender,
    tag: Tag,
}

struct ChannelInner {
    addr: String,
    writer: mpsc::UnboundedSender<ConnWrite>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
}

/// A connection to one remote service. Cheap to clone; the underlying
/// connection is shared and thread-safe.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Opens a channel. The connection is established in the background;
    /// calls issued before it is up are queued, and calls issued after a
    /// connection failure complete with a transport error.
    pub fn connect(handle: &Handle, addr: &str) -> Channel {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ChannelInner {
            addr: addr.to_string(),
            writer: writer_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        handle.spawn(run_connection(Arc::clone(&inner), writer_rx));
        Channel { inner }
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Issues an `Exec` call. The response (or failure) is posted to
    /// `tag` on `cq` as a `ChildReply` completion.
    pub fn call(&self, request: &ExecRequest, cq: &CqSender, tag: Tag) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = match encode_frame(&Frame::Request {
            id,
            body: request.clone(),
        }) {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = cq.send(Completion {
                    tag,
                    ok: true,
                    payload: Payload::ChildReply(Err(RpcError::Encode(e.to_string()))),
                });
                return;
            }
        };
        self.inner.pending.lock().unwrap().insert(
            id,
            PendingCall {
                cq: cq.clone(),
                tag,
            },
        );
        if self.inner.writer.send(ConnWrite { bytes, done: None }).is_err() {
            if let Some(pending) = self.inner.pending.lock().unwrap().remove(&id) {
                let _ = pending.cq.send(Completion {
                    tag: pending.tag,
                    ok: true,
                    payload: Payload::ChildReply(Err(RpcError::ChannelClosed)),
                });
            }
        }
    }
}

async fn run_connection(inner: Arc<ChannelInner>, mut writer_rx: mpsc::UnboundedReceiver<ConnWrite>) {
    let stream = match TcpStream::connect(&inner.addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("failed to connect to {}: {e}", inner.addr);
            writer_rx.close();
            while writer_rx.try_recv().is_ok() {}
            fail_pending(&inner, &format!("connect to {} failed: {e}", inner.addr));
            return;
        }
    };

    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut source) = framed.split();

    loop {
        tokio::select! {
            op = writer_rx.recv() => match op {
                Some(op) => {
                    let ok = sink.send(Bytes::from(op.bytes)).await.is_ok();
                    if let Some((cq, tag)) = op.done {
                        let _ = cq.send(Completion::finished(tag, ok));
                    }
                    if !ok {
                        break;
                    }
                }
                // Every Channel clone is gone; nothing left to serve.
                None => return,
            },
            next = source.next() => match next {
                Some(Ok(bytes)) => match decode_frame(&bytes) {
                    Ok(Frame::Response { id, body }) => {
                        let pending = inner.pending.lock().unwrap().remove(&id);
                        match pending {
                            Some(pending) => {
                                let _ = pending.cq.send(Completion {
                                    tag: pending.tag,
                                    ok: true,
                                    payload: Payload::ChildReply(Ok(body)),
                                });
                            }
                            None => debug!("response for unknown call {id}"),
                        }
                    }
                    Ok(Frame::Request { .. }) => {
                        warn!("unexpected request frame on client connection");
                    }
                    Err(e) => {
                        warn!("malformed frame: {e}");
                        break;
                    }
                },
                Some(Err(e)) => {
                    debug!("connection read error: {e}");
                    break;
                }
                None => break,
            },
        }
    }

    writer_rx.close();
    while writer_rx.try_recv().is_ok() {}
    fail_pending(&inner, "connection closed");
}

fn fail_pending(inner: &ChannelInner, reason: &str) {
    let drained: Vec<PendingCall> = inner
        .pending
        .lock()
        .unwrap()
        .drain()
        .map(|(_, pending)| pending)
        .collect();
    for pending in drained {
        let _ = pending.cq.send(Completion {
            tag: pending.tag,
            ok: true,
            payload: Payload::ChildReply(Err(RpcError::Transport(reason.to_string()))),
        });
    }
}
