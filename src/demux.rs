//! Routing of inbound frames to sessions and in-flight transfers.
//!
//! Three indexes drive dispatch: session URIs (from each session's path),
//! inbound message sessions by Message-ID, and outstanding outbound
//! transfers awaiting REPORTs. A streaming cursor tracks the SEND whose
//! body bytes are currently arriving, so chunks can be fed to the
//! application before the end delimiter is seen.
//!
//! Index entries can outlive their owners (a session closes, a transfer is
//! dropped); such stale entries are evicted when a lookup hits them.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::connection::CommandSender;
use crate::message::{Message, Method, MsgStatus};
use crate::session::{IncomingHandle, SessionId, SessionState};
use crate::transfer::{IncomingMessage, OutgoingId, OutgoingMessage, ReportDefaults};
use crate::uri::Uri;

/// What frame routing produced, beyond accept/reject.
#[derive(Default)]
pub(crate) struct Routed {
    pub accepted: bool,
    /// Success REPORTs generated by the routed frame's lifecycle.
    pub reports: Vec<Message>,
    /// An outbound transfer whose final REPORT arrived; the caller drops
    /// its remaining state.
    pub evict_outgoing: Option<OutgoingId>,
}

impl Routed {
    fn rejected() -> Routed {
        Routed::default()
    }

    fn accepted() -> Routed {
        Routed {
            accepted: true,
            ..Routed::default()
        }
    }
}

#[derive(Default)]
pub(crate) struct Demultiplexer {
    targets: HashMap<Uri, SessionId>,
    messages: HashMap<String, IncomingMessage>,
    reports: HashMap<String, OutgoingId>,
    streaming: Option<String>,
}

impl Demultiplexer {
    pub(crate) fn new() -> Demultiplexer {
        Demultiplexer::default()
    }

    /// Register a session under every URI of its path.
    pub(crate) fn insert_session(&mut self, id: SessionId, path: &[Uri]) {
        for uri in path {
            self.targets.insert(uri.clone(), id);
        }
    }

    /// Drop a session's URIs and interrupt its in-flight inbound transfers.
    pub(crate) fn remove_session(&mut self, id: SessionId) {
        self.targets.retain(|_, session| *session != id);

        let stale: Vec<String> = self
            .messages
            .iter()
            .filter(|(_, message)| message.session() == id)
            .map(|(message_id, _)| message_id.clone())
            .collect();

        for message_id in stale {
            if let Some(mut message) = self.messages.remove(&message_id) {
                message.interrupt();
            }
            if self.streaming.as_deref() == Some(message_id.as_str()) {
                self.streaming = None;
            }
        }
    }

    pub(crate) fn insert_report(&mut self, message_id: String, id: OutgoingId) {
        self.reports.insert(message_id, id);
    }

    pub(crate) fn remove_report(&mut self, message_id: &str) {
        self.reports.remove(message_id);
    }

    /// A SEND is mid-body: subsequent raw bytes belong to it.
    pub(crate) fn streaming(&self) -> bool {
        self.streaming.is_some()
    }

    pub(crate) fn incoming(&self, message_id: &str) -> Option<&IncomingMessage> {
        self.messages.get(message_id)
    }

    /// Route one frame. `false` means the caller answers with a 481.
    pub(crate) fn process_frame(
        &mut self,
        message: &Message,
        sessions: &mut HashMap<SessionId, SessionState>,
        outgoing: &mut HashMap<OutgoingId, OutgoingMessage>,
        defaults: ReportDefaults,
        commands: &CommandSender,
    ) -> Routed {
        // The To-Path must name a session on this connection.
        let to = match message.to_path() {
            Ok(path) => path,
            Err(e) => {
                warn!("frame without usable To-Path: {e}; rejected");
                return Routed::rejected();
            }
        };

        let Some(target) = to.first() else {
            warn!("frame with empty To-Path; rejected");
            return Routed::rejected();
        };

        let Some(&session_id) = self.targets.get(target) else {
            warn!(target = %target, "unknown target; rejected");
            return Routed::rejected();
        };

        if !sessions.contains_key(&session_id) {
            // Session owner is gone; evict its routing entries.
            self.targets.retain(|_, id| *id != session_id);
            warn!(target = %target, "session defunct; rejected");
            return Routed::rejected();
        }

        if let Some(message_id) = message.message_id().map(str::to_string) {
            if self.messages.contains_key(&message_id) {
                let mut outcome = Routed::accepted();

                if let Some(incoming) = self.messages.get_mut(&message_id) {
                    incoming.process_frame(message);
                }

                if message.method() == Method::Send {
                    self.streaming = Some(message_id.clone());
                    self.apply_known_status(&message_id, message, &mut outcome);
                }

                return outcome;
            }

            if message.method() == Method::Report {
                if let Some(&outgoing_id) = self.reports.get(&message_id) {
                    match outgoing.get_mut(&outgoing_id) {
                        Some(transfer) => {
                            let mut outcome = Routed::accepted();
                            transfer.process_report(message);

                            if transfer.transfer_finished() && transfer.final_report_seen() {
                                self.reports.remove(&message_id);
                                outcome.evict_outgoing = Some(outgoing_id);
                            }

                            return outcome;
                        }
                        None => {
                            warn!(message = %message_id, "outgoing transfer defunct, report dropped");
                            self.reports.remove(&message_id);
                        }
                    }
                }
            }
        } else if message.method() == Method::Send {
            warn!("SEND request lacks a Message-ID; rejected");
            return Routed::rejected();
        }

        self.process_session_level(message, session_id, sessions, defaults, commands)
    }

    fn process_session_level(
        &mut self,
        message: &Message,
        session_id: SessionId,
        sessions: &mut HashMap<SessionId, SessionState>,
        defaults: ReportDefaults,
        commands: &CommandSender,
    ) -> Routed {
        let Some(session) = sessions.get_mut(&session_id) else {
            return Routed::rejected();
        };

        let mut outcome = Routed::accepted();

        if message.status() == MsgStatus::Complete {
            session.handler.on_message(message);
        }

        // Only SENDs open message sessions; responses, REPORTs with no
        // matching transfer and AUTH frames stop at the session handler.
        if message.method() != Method::Send {
            return outcome;
        }

        let Some(message_id) = message.message_id().map(str::to_string) else {
            return outcome;
        };

        let controls = IncomingHandle::new(commands.clone(), message_id.clone());
        match session.handler.on_message_session(message, controls) {
            Some(handler) => {
                let mut incoming = IncomingMessage::new(session_id, message, handler, defaults);
                incoming.process_frame(message);

                self.messages.insert(message_id.clone(), incoming);
                self.streaming = Some(message_id.clone());

                self.apply_known_status(&message_id, message, &mut outcome);
            }
            None => {
                debug!(message = %message_id, "message session not accepted; dropped");
            }
        }

        outcome
    }

    /// When the routed frame already carries its terminator (it was fully
    /// buffered), apply body and lifecycle immediately so the streaming
    /// cursor never leaks into the next frame.
    fn apply_known_status(&mut self, message_id: &str, message: &Message, outcome: &mut Routed) {
        if message.status() == MsgStatus::Streaming {
            return;
        }

        let mut drop_entry = false;

        if let Some(incoming) = self.messages.get_mut(message_id) {
            if !message.body().is_empty() {
                incoming.process_chunk(message.body());
            }

            match message.status() {
                MsgStatus::Continued => outcome.reports.extend(incoming.continued()),
                MsgStatus::Complete => {
                    outcome.reports.extend(incoming.completed());
                    drop_entry = true;
                }
                MsgStatus::Interrupted => {
                    incoming.interrupt();
                    drop_entry = true;
                }
                MsgStatus::Streaming => {}
            }
        }

        if drop_entry {
            self.messages.remove(message_id);
        }

        self.streaming = None;
    }

    /// Deliver streamed body bytes (and, at the end of the frame, the
    /// terminator) to the message under the streaming cursor.
    pub(crate) fn process_stream(&mut self, bytes: &[u8], status: MsgStatus) -> (bool, Vec<Message>) {
        let Some(message_id) = self.streaming.clone() else {
            return (false, Vec::new());
        };

        let Some(incoming) = self.messages.get_mut(&message_id) else {
            // Transfer owner vanished mid-stream.
            self.streaming = None;
            return (false, Vec::new());
        };

        if !bytes.is_empty() {
            incoming.process_chunk(bytes);
        }

        let mut reports = Vec::new();

        match status {
            MsgStatus::Streaming => {}
            MsgStatus::Continued => {
                reports.extend(incoming.continued());
                self.streaming = None;
            }
            MsgStatus::Complete => {
                reports.extend(incoming.completed());
                self.messages.remove(&message_id);
                self.streaming = None;
            }
            MsgStatus::Interrupted => {
                incoming.interrupt();
                self.messages.remove(&message_id);
                self.streaming = None;
            }
        }

        (true, reports)
    }
}
