//! The synchronous heart of a connection.
//!
//! [`ConnectionCore`] owns everything a connection multiplexes: the frame
//! decoder, the egress queue, the demultiplexer with its sessions and
//! inbound transfers, and the scheduler with its outbound transfers. The
//! driver task feeds it socket bytes and write completions; everything in
//! here runs on that task, which is what lets the whole structure live
//! without locks.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, warn};

use super::{Command, CommandSender};
use crate::codec::{BufferState, MessageBuffer, ParseMode};
use crate::demux::Demultiplexer;
use crate::egress::EgressBuffer;
use crate::error::Result;
use crate::headers;
use crate::message::{Message, Method};
use crate::scheduler::{Scheduler, StreamContext};
use crate::session::{SessionHandler, SessionId, SessionState};
use crate::transfer::{OutgoingHandler, OutgoingId, OutgoingMessage, ReportDefaults};
use crate::uri::{Path, Uri};

/// Whether a command ended the connection's reason to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CoreFlow {
    Continue,
    CloseConnection,
}

pub(crate) struct ConnectionCore {
    pub(crate) buffer: MessageBuffer,
    pub(crate) egress: EgressBuffer,
    demux: Demultiplexer,
    scheduler: Scheduler,
    context: StreamContext,
    sessions: HashMap<SessionId, SessionState>,
    outgoing: HashMap<OutgoingId, OutgoingMessage>,
    defaults: ReportDefaults,
    commands: CommandSender,
    buffer_size: usize,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    tls: bool,
}

impl ConnectionCore {
    pub(crate) fn new(
        buffer_size: usize,
        defaults: ReportDefaults,
        tls: bool,
        commands: CommandSender,
    ) -> ConnectionCore {
        ConnectionCore {
            buffer: MessageBuffer::new(buffer_size),
            egress: EgressBuffer::new(),
            demux: Demultiplexer::new(),
            scheduler: Scheduler::new(),
            context: StreamContext::new(),
            sessions: HashMap::new(),
            outgoing: HashMap::new(),
            defaults,
            commands,
            buffer_size,
            local: None,
            peer: None,
            tls,
        }
    }

    pub(crate) fn set_local(&mut self, local: SocketAddr) {
        self.local = Some(local);
    }

    pub(crate) fn on_connected(&mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) {
        if local.is_some() {
            self.local = local;
        }
        self.peer = peer;
    }

    pub(crate) fn on_disconnected(&mut self) {
        // A new stream starts from a clean parse state; egress survives so
        // queued frames go out after a reconnect.
        self.buffer = MessageBuffer::new(self.buffer_size);
        self.peer = None;
    }

    /// Session-level commands; the driver handles transport-level ones.
    pub(crate) fn handle_command(&mut self, command: Command) -> CoreFlow {
        match command {
            Command::OpenSession { id, path, handler } => self.open_session(id, path, handler),
            Command::CloseSession { id } => {
                if self.close_session(id) {
                    return CoreFlow::CloseConnection;
                }
            }
            Command::Stream {
                session,
                id,
                template,
                handler,
            } => self.stream(session, id, template, handler),
            Command::QueueData { id, data } => {
                if let Some(transfer) = self.outgoing.get_mut(&id) {
                    transfer.queue(data);
                }
            }
            Command::CancelOutgoing { id } => {
                if let Some(transfer) = self.outgoing.get_mut(&id) {
                    transfer.cancel();
                }
            }
            Command::CancelIncoming { message_id } => self.cancel_incoming(&message_id),
            Command::SendMessage { session, message } => self.send_message(session, message),
            // Transport commands never reach the core.
            Command::PushTargets { .. } | Command::Connect | Command::Close => {}
        }

        CoreFlow::Continue
    }

    fn open_session(&mut self, id: SessionId, mut path: Path, handler: Box<dyn SessionHandler>) {
        if path.is_empty() {
            if let Some(local) = self.local {
                path.push(Uri::from_endpoint(local, self.tls));
            } else {
                warn!("session opened with an empty path before the local endpoint is known");
            }
        }

        debug!(session = id, path = %path, "session registered");

        self.demux.insert_session(id, &path);
        self.sessions.insert(
            id,
            SessionState {
                path,
                handler,
                outgoing: Vec::new(),
            },
        );
    }

    /// Returns `true` when the last session went away and the connection
    /// should close.
    fn close_session(&mut self, id: SessionId) -> bool {
        if let Some(finished) = self.context.clear(&mut self.scheduler, &mut self.outgoing, &mut self.egress) {
            self.finish_outgoing(finished);
        }

        self.demux.remove_session(id);

        if let Some(state) = self.sessions.remove(&id) {
            for outgoing_id in state.outgoing {
                self.scheduler.erase(outgoing_id);
                if let Some(transfer) = self.outgoing.remove(&outgoing_id) {
                    self.demux.remove_report(transfer.message_id());
                }
            }
        }

        self.sessions.is_empty()
    }

    fn stream(
        &mut self,
        session: SessionId,
        id: OutgoingId,
        mut template: Message,
        handler: Box<dyn OutgoingHandler>,
    ) {
        if !self.sessions.contains_key(&session) {
            warn!(session, "stream on an unknown session; dropped");
            return;
        }

        self.prepare_outbound(session, &mut template);

        let message_id = template.message_id().unwrap_or_default().to_string();
        let transfer = OutgoingMessage::new(id, session, template, handler);

        self.demux.insert_report(message_id, id);
        self.scheduler.queue(id);
        self.outgoing.insert(id, transfer);

        if let Some(state) = self.sessions.get_mut(&session) {
            state.outgoing.push(id);
        }
    }

    fn send_message(&mut self, session: SessionId, mut message: Message) {
        if !self.sessions.contains_key(&session) {
            warn!(session, "send on an unknown session; dropped");
            return;
        }

        self.prepare_outbound(session, &mut message);
        self.transmit(message);
    }

    fn cancel_incoming(&mut self, message_id: &str) {
        let response = self.demux.incoming(message_id).map(|incoming| incoming.cancel_response());

        match response {
            Some(Ok(response)) => self.transmit(response),
            Some(Err(e)) => warn!(message = message_id, "cannot build cancellation response: {e}"),
            None => {}
        }
    }

    /// Fill in what the application left open: identifiers, its own
    /// From-Path, and a peer-derived To-Path.
    fn prepare_outbound(&mut self, session: SessionId, message: &mut Message) {
        if message.method() != Method::Response {
            message.prepare();
        }

        let Some(state) = self.sessions.get(&session) else {
            return;
        };

        if !message.headers().contains(headers::FROM_PATH) {
            if let Some(own) = state.path.first() {
                message.set_from_path(&Path::from(own.clone()));
            }
        }

        if !message.headers().contains(headers::TO_PATH) {
            if let Some(peer) = self.peer {
                message.set_to_path(&Path::from(Uri::from_endpoint(peer, self.tls)));
            }
        }
    }

    /// Declare freshly read socket bytes and run the decode/dispatch cycle,
    /// draining any additional frames that were already buffered.
    pub(crate) fn on_read(&mut self, n: usize) -> Result<()> {
        let mut fresh = n;

        loop {
            self.buffer.read(fresh)?;
            fresh = 0;

            match self.buffer.state() {
                BufferState::Content => {
                    // Only SEND bodies are worth delivering before the end
                    // delimiter; anything else must fit the buffer whole.
                    if self.buffer.method() == Method::Send {
                        self.process();
                    }
                    return Ok(());
                }
                BufferState::Complete => self.process(),
                _ => return Ok(()),
            }
        }
    }

    /// Bridge the decoder to the demultiplexer, then release consumed
    /// buffer space.
    fn process(&mut self) {
        if self.demux.streaming() {
            let status = self.buffer.status();
            let (_, reports) = self.demux.process_stream(self.buffer.contents(), status);
            for report in reports {
                self.transmit(report);
            }
        } else {
            match self.buffer.state() {
                BufferState::Complete => match self.buffer.parse(ParseMode::CopyContents) {
                    Ok(message) => {
                        self.dispatch(&message);
                    }
                    Err(e) => warn!("dropping unparseable frame: {e}"),
                },
                BufferState::Content => match self.buffer.parse(ParseMode::NoContents) {
                    Ok(message) => {
                        if self.dispatch(&message) && self.demux.streaming() {
                            let status = self.buffer.status();
                            let (_, reports) = self.demux.process_stream(self.buffer.contents(), status);
                            for report in reports {
                                self.transmit(report);
                            }
                        }
                    }
                    Err(e) => warn!("dropping unparseable frame: {e}"),
                },
                _ => {}
            }
        }

        match self.buffer.state() {
            BufferState::Content => self.buffer.erase(),
            BufferState::Complete => self.buffer.reset(),
            _ => {}
        }
    }

    fn dispatch(&mut self, message: &Message) -> bool {
        let routed = self.demux.process_frame(
            message,
            &mut self.sessions,
            &mut self.outgoing,
            self.defaults,
            &self.commands,
        );

        for report in routed.reports {
            self.transmit(report);
        }

        if let Some(id) = routed.evict_outgoing {
            self.evict_outgoing(id);
        }

        if !routed.accepted {
            self.reject(message, 481);
        }

        routed.accepted
    }

    fn reject(&mut self, message: &Message, code: u16) {
        debug!("rejecting message with code {code}");

        match message.response(code, "Rejected") {
            Ok(response) => self.transmit(response),
            Err(e) => warn!("cannot build rejection response: {e}"),
        }
    }

    /// Send one whole frame outside the scheduler. The stream context is
    /// flushed first so the frame never lands inside another message's
    /// chunk.
    fn transmit(&mut self, message: Message) {
        if let Some(finished) = self.context.clear(&mut self.scheduler, &mut self.outgoing, &mut self.egress) {
            self.finish_outgoing(finished);
        }

        match message.to_bytes() {
            Ok(bytes) => self.egress.write(bytes),
            Err(e) => warn!("cannot encode outbound frame: {e}"),
        }
    }

    /// The write side drained `n` bytes; refill from the scheduler once the
    /// queue runs dry.
    pub(crate) fn on_write_complete(&mut self, n: usize) {
        self.egress.shift(n);

        if self.egress.is_empty() {
            self.select_outgoing();
        }
    }

    pub(crate) fn select_outgoing(&mut self) {
        if let Some(finished) = self.context.select(&mut self.scheduler, &mut self.outgoing, &mut self.egress) {
            self.finish_outgoing(finished);
        }
    }

    /// A transfer finished on the wire: drop its state unless late REPORTs
    /// are still expected.
    fn finish_outgoing(&mut self, id: OutgoingId) {
        if self.outgoing.get(&id).is_some_and(OutgoingMessage::keep_for_reports) {
            return;
        }

        self.evict_outgoing(id);
    }

    fn evict_outgoing(&mut self, id: OutgoingId) {
        self.scheduler.erase(id);

        if let Some(transfer) = self.outgoing.remove(&id) {
            self.demux.remove_report(transfer.message_id());

            if let Some(state) = self.sessions.get_mut(&transfer.session()) {
                state.outgoing.retain(|&outgoing_id| outgoing_id != id);
            }
        }
    }
}
