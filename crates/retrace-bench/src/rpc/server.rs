// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Server-side transport: accepts connections, decodes request frames,
//! and pairs each inbound request with a receive slot some handler
//! posted. No slot means no delivery, which is what admission control
//! leans on for backpressure.

use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::{Completion, ConnWrite, CqSender, InboundCall, Payload, ReplyHandle, Tag};
use crate::wire::{decode_frame, Frame};

struct Slot {
    cq: CqSender,
    tag: Tag,
}

/// Posts receive slots against a running [`RpcServer`]. Clone one per
/// handler.
#[derive(Clone)]
pub struct Registrar {
    slots: mpsc::UnboundedSender<Slot>,
}

impl Registrar {
    /// Registers interest in the next inbound request: it will be
    /// delivered to `tag` on `cq`. If the server is gone the slot
    /// completes immediately with `ok = false`.
    pub fn request_exec(&self, cq: &CqSender, tag: Tag) {
        let slot = Slot {
            cq: cq.clone(),
            tag,
        };
        if self.slots.send(slot).is_err() {
            let _ = cq.send(Completion::finished(tag, false));
        }
    }
}

/// A bound listener plus its dispatcher. Dropping it (or calling
/// [`RpcServer::shutdown`]) stops accepting and fails outstanding slots
/// so parked continuations can tear down.
pub struct RpcServer {
    registrar: Registrar,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl RpcServer {
    pub fn bind(handle: &Handle, addr: &str) -> io::Result<RpcServer> {
        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let local_addr = std_listener.local_addr()?;
        let _guard = handle.enter();
        let listener = TcpListener::from_std(std_listener)?;

        let (slots_tx, slots_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        handle.spawn(accept_loop(listener, inbound_tx, shutdown_rx.clone()));
        handle.spawn(dispatch_loop(slots_rx, inbound_rx, shutdown_rx));

        Ok(RpcServer {
            registrar: Registrar { slots: slots_tx },
            shutdown: shutdown_tx,
            local_addr,
        })
    }

    pub fn registrar(&self) -> Registrar {
        self.registrar.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::UnboundedSender<InboundCall>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    tokio::spawn(serve_connection(stream, inbound.clone()));
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_connection(stream: TcpStream, inbound: mpsc::UnboundedSender<InboundCall>) {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut source) = framed.split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<ConnWrite>();

    let writer = tokio::spawn(async move {
        while let Some(op) = writer_rx.recv().await {
            let ok = sink.send(Bytes::from(op.bytes)).await.is_ok();
            if let Some((cq, tag)) = op.done {
                let _ = cq.send(Completion::finished(tag, ok));
            }
            if !ok {
                break;
            }
        }
        // The connection is gone; fail anything still queued so the
        // requests waiting on those replies are released.
        writer_rx.close();
        while let Ok(op) = writer_rx.try_recv() {
            if let Some((cq, tag)) = op.done {
                let _ = cq.send(Completion::finished(tag, false));
            }
        }
    });

    while let Some(next) = source.next().await {
        let bytes = match next {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("connection read error: {e}");
                break;
            }
        };
        match decode_frame(&bytes) {
            Ok(Frame::Request { id, body }) => {
                let call = InboundCall {
                    request: body,
                    reply: ReplyHandle::new(id, writer_tx.clone()),
                };
                if inbound.send(call).is_err() {
                    break;
                }
            }
            Ok(Frame::Response { .. }) => warn!("unexpected response frame on server connection"),
            Err(e) => {
                warn!("malformed frame: {e}");
                break;
            }
        }
    }
    drop(writer_tx);
    let _ = writer.await;
}

/// Pairs posted receive slots with inbound requests, in order. On
/// shutdown every parked slot completes with `ok = false`, the signal
/// a continuation takes to deallocate.
async fn dispatch_loop(
    mut slots: mpsc::UnboundedReceiver<Slot>,
    mut inbound: mpsc::UnboundedReceiver<InboundCall>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let slot = tokio::select! {
            slot = slots.recv() => match slot {
                Some(slot) => slot,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        let call = tokio::select! {
            call = inbound.recv() => match call {
                Some(call) => call,
                None => {
                    fail_slot(slot);
                    break;
                }
            },
            _ = shutdown.changed() => {
                fail_slot(slot);
                break;
            }
        };
        let _ = slot.cq.send(Completion {
            tag: slot.tag,
            ok: true,
            payload: Payload::Inbound(call),
        });
    }
    slots.close();
    while let Ok(slot) = slots.try_recv() {
        fail_slot(slot);
    }
}

fn fail_slot(slot: Slot) {
    let _ = slot.cq.send(Completion::finished(slot.tag, false));
}
