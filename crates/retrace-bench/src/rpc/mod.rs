// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Completion-queue RPC plumbing.
//!
//! Handlers and clients own private completion queues and park request
//! state machines keyed by [`Tag`] until the transport posts a
//! completion. The transport itself is a thin tokio layer: framed
//! MessagePack over TCP, with per-connection reader/writer tasks that
//! post completions into whichever queue registered interest.

pub mod channel;
pub mod server;

pub use channel::Channel;
pub use server::{Registrar, RpcServer};

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::wire::{encode_frame, ExecReply, ExecRequest, Frame};

/// Identifies the continuation a completion belongs to: an index into
/// the owner's request arena or child-call arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Request(usize),
    Child(usize),
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel closed")]
    ChannelClosed,
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// One event from a completion queue. `ok` mirrors the queue contract:
/// `false` means the queue is draining and the tagged continuation
/// should tear itself down.
#[derive(Debug)]
pub struct Completion {
    pub tag: Tag,
    pub ok: bool,
    pub payload: Payload,
}

#[derive(Debug)]
pub enum Payload {
    /// Reply flushed (or queue shutdown); nothing to carry.
    None,
    /// An inbound request delivered to a posted receive slot.
    Inbound(InboundCall),
    /// A child RPC finished; transport failures surface as `Err`.
    ChildReply(Result<ExecReply, RpcError>),
}

impl Completion {
    pub fn finished(tag: Tag, ok: bool) -> Completion {
        Completion {
            tag,
            ok,
            payload: Payload::None,
        }
    }
}

pub type CqSender = Sender<Completion>;

/// Result of polling a completion queue with a deadline, mirroring the
/// three-way contract of async RPC completion queues.
#[derive(Debug)]
pub enum NextStatus {
    Event(Completion),
    Timeout,
    Shutdown,
}

/// A private completion queue. The owner is the only consumer; the
/// transport holds sender clones.
pub struct CompletionQueue {
    rx: Receiver<Completion>,
}

pub fn completion_queue() -> (CqSender, CompletionQueue) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (tx, CompletionQueue { rx })
}

impl CompletionQueue {
    pub fn next_deadline(&self, timeout: Duration) -> NextStatus {
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => NextStatus::Event(completion),
            Err(RecvTimeoutError::Timeout) => NextStatus::Timeout,
            Err(RecvTimeoutError::Disconnected) => NextStatus::Shutdown,
        }
    }

    /// Zero-deadline poll, used to probe for quiescence while draining.
    pub fn try_next(&self) -> NextStatus {
        match self.rx.try_recv() {
            Ok(completion) => NextStatus::Event(completion),
            Err(TryRecvError::Empty) => NextStatus::Timeout,
            Err(TryRecvError::Disconnected) => NextStatus::Shutdown,
        }
    }
}

/// A write handed to a connection's writer task. `done` posts a
/// completion once the frame has been flushed (or failed).
pub(crate) struct ConnWrite {
    pub bytes: Vec<u8>,
    pub done: Option<(CqSender, Tag)>,
}

/// An inbound request paired with the handle for answering it.
#[derive(Debug)]
pub struct InboundCall {
    pub request: ExecRequest,
    pub reply: ReplyHandle,
}

/// Answers one inbound call on its originating connection. Consuming it
/// posts a completion to `tag` when the reply has been flushed.
pub struct ReplyHandle {
    call_id: u64,
    conn: UnboundedSender<ConnWrite>,
}

impl std::fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyHandle")
            .field("call_id", &self.call_id)
            .finish()
    }
}

impl ReplyHandle {
    pub(crate) fn new(call_id: u64, conn: UnboundedSender<ConnWrite>) -> ReplyHandle {
        ReplyHandle { call_id, conn }
    }

    pub fn finish(self, reply: ExecReply, cq: &CqSender, tag: Tag) {
        match encode_frame(&Frame::Response {
            id: self.call_id,
            body: reply,
        }) {
            Ok(bytes) => {
                if self
                    .conn
                    .send(ConnWrite {
                        bytes,
                        done: Some((cq.clone(), tag)),
                    })
                    .is_err()
                {
                    let _ = cq.send(Completion::finished(tag, false));
                }
            }
            Err(_) => {
                let _ = cq.send(Completion::finished(tag, false));
            }
        }
    }
}
