//! Logical endpoints multiplexed over one connection.
//!
//! A session is identified by its [`Path`]: the demultiplexer routes every
//! inbound frame whose To-Path head matches one of the session's URIs to
//! that session's [`SessionHandler`]. Sessions are created from a
//! [`Connection`](crate::connection::Connection); dropping the last
//! [`SessionHandle`] closes the connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::connection::{Command, CommandSender};
use crate::message::Message;
use crate::transfer::{IncomingHandler, OutgoingHandler, OutgoingId};
use crate::uri::Path;

pub(crate) type SessionId = u64;

/// Application-side view of a session, invoked from the connection task.
pub trait SessionHandler: Send {
    /// A complete frame (a response, or a request that is not starting a
    /// message session) was routed to this session.
    fn on_message(&mut self, _message: &Message) {}

    /// A peer opened a new inbound message session with a SEND. Return a
    /// handler to accept the transfer, or `None` to ignore it. `controls`
    /// allows cancelling the transfer later (a 413 is streamed back).
    fn on_message_session(
        &mut self,
        _message: &Message,
        _controls: IncomingHandle,
    ) -> Option<Box<dyn IncomingHandler>> {
        None
    }
}

/// Connection-task-side session record.
pub(crate) struct SessionState {
    pub path: Path,
    pub handler: Box<dyn SessionHandler>,
    pub outgoing: Vec<OutgoingId>,
}

/// Owning handle to a session.
///
/// The handle is the session's lifetime: dropping it unregisters the
/// session, and when the last session of a connection goes away the
/// connection closes.
pub struct SessionHandle {
    tx: CommandSender,
    id: SessionId,
    ids: Arc<AtomicU64>,
}

impl SessionHandle {
    pub(crate) fn new(tx: CommandSender, id: SessionId, ids: Arc<AtomicU64>) -> SessionHandle {
        SessionHandle { tx, id, ids }
    }

    /// Queue an outgoing message session.
    ///
    /// The template's paths and identifiers are filled in on the connection
    /// task if absent; the handler is consulted before each chunk header
    /// goes out and supplies body data on demand. Data can also be queued
    /// through the returned handle.
    pub fn stream(&self, template: Message, handler: Box<dyn OutgoingHandler>) -> OutgoingHandle {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);

        let _ = self.tx.send(Command::Stream {
            session: self.id,
            id,
            template,
            handler,
        });

        OutgoingHandle { tx: self.tx.clone(), id }
    }

    /// Send a single frame outside the scheduler (responses and other
    /// frames that must not wait behind streaming transfers).
    pub fn send(&self, message: Message) {
        let _ = self.tx.send(Command::SendMessage {
            session: self.id,
            message,
        });
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::CloseSession { id: self.id });
    }
}

/// Handle to an outbound transfer created by [`SessionHandle::stream`].
///
/// Dropping the handle does not abort the transfer.
#[derive(Clone)]
pub struct OutgoingHandle {
    tx: CommandSender,
    id: OutgoingId,
}

impl OutgoingHandle {
    /// Queue body bytes; they are drained as one chunk on the message's
    /// next scheduling turn.
    pub fn queue(&self, data: Bytes) {
        let _ = self.tx.send(Command::QueueData { id: self.id, data });
    }

    /// Interrupt the transfer: the next delimiter emitted is `#`.
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::CancelOutgoing { id: self.id });
    }
}

/// Handle to an inbound transfer, given to
/// [`SessionHandler::on_message_session`].
#[derive(Clone)]
pub struct IncomingHandle {
    tx: CommandSender,
    message_id: String,
}

impl IncomingHandle {
    pub(crate) fn new(tx: CommandSender, message_id: String) -> IncomingHandle {
        IncomingHandle { tx, message_id }
    }

    /// Refuse the rest of the transfer: a 413 response is streamed to the
    /// peer.
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::CancelIncoming {
            message_id: self.message_id.clone(),
        });
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}
