//! Per-message transfer state: inbound and outbound message sessions.
//!
//! A *message session* is the stream of SEND chunks sharing one Message-ID.
//! [`IncomingMessage`] accumulates inbound chunks and produces success
//! REPORTs; [`OutgoingMessage`] feeds the scheduler one chunk at a time.
//! Applications observe both through the [`IncomingHandler`] and
//! [`OutgoingHandler`] traits, which the connection task invokes.

use std::time::Instant;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::egress::EgressBuffer;
use crate::error::Result;
use crate::headers::{ByteRange, FailureReport, StatusHeader};
use crate::message::{Message, Method, MsgStatus};
use crate::scheduler::Scheduler;
use crate::session::SessionId;

pub(crate) type OutgoingId = u64;

/// When to emit success REPORTs for an inbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuccessReportMode {
    /// Never report.
    None,
    /// Report on completion and on each continued chunk.
    #[default]
    Automatic,
    /// Report per received fragment.
    Fragmented,
    /// Report only when the whole message has arrived.
    Final,
}

/// Connection-wide reporting defaults, overridable per message by the
/// Success-Report / Failure-Report headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportDefaults {
    pub success: SuccessReportMode,
    pub failure: FailureReport,
}

/// Events of an inbound message session.
///
/// Body bytes always arrive through [`on_contents`](Self::on_contents),
/// whether the SEND was streamed or fit in a single frame. All methods run
/// on the connection task; anything beyond consuming the data should go
/// through the handles.
pub trait IncomingHandler: Send {
    /// A frame of this message session arrived (headers may change between
    /// chunks, e.g. the peer may revise Success-Report).
    fn on_context(&mut self, _message: &Message) {}

    /// A slice of body bytes, in order.
    fn on_contents(&mut self, _chunk: &[u8]) {}

    /// A success REPORT is about to be sent; the template may be amended.
    fn on_send_report(&mut self, _report: &mut Message) {}

    /// The final byte arrived.
    fn on_complete(&mut self) {}

    /// The sender aborted the transfer (`#` terminator).
    fn on_interrupt(&mut self) {
        self.on_complete();
    }
}

/// Events and data supply of an outbound message session.
pub trait OutgoingHandler: Send {
    /// The chunk header is about to be emitted; the template (Byte-Range,
    /// transaction id, extension headers) may be amended.
    fn on_context_required(&mut self, _template: &mut Message) {}

    /// Whether this handler streams data through
    /// [`on_data_required`](Self::on_data_required). Return `false` for
    /// queue-only messages so the scheduler does not consider the message
    /// runnable while its queue is empty.
    fn supplies_data(&self) -> bool {
        true
    }

    /// The scheduler selected this message and its queue is empty: write
    /// the next chunk into `sink`. `required` is the number of bytes left
    /// of the announced total, when one was announced. Writing nothing is
    /// fine; the message is revisited on the next scheduling round.
    fn on_data_required(&mut self, _required: Option<u64>, _sink: &mut ChunkSink<'_>) {}

    /// A REPORT for this message arrived.
    fn on_report(&mut self, _report: &Message) {}

    /// The transfer finished (complete or interrupted).
    fn on_complete(&mut self) {}
}

/// Counters shared by both transfer directions.
#[derive(Debug)]
pub(crate) struct TransferState {
    pub message_id: String,
    pub transferred: u64,
    pub size: Option<u64>,
    pub complete: bool,
    pub interrupted: bool,
    pub last_transfer: Instant,
}

impl TransferState {
    fn new(message_id: String, size: Option<u64>) -> TransferState {
        TransferState {
            message_id,
            transferred: 0,
            size,
            complete: false,
            interrupted: false,
            last_transfer: Instant::now(),
        }
    }
}

/// Total announced by the sender: Byte-Range total, else Content-Length.
fn announced_size(message: &Message) -> Option<u64> {
    if let Ok(Some(range)) = message.byte_range() {
        if range.total.is_some() {
            return range.total;
        }
    }

    message.content_length().ok().flatten()
}

pub(crate) struct IncomingMessage {
    state: TransferState,
    template: Message,
    handler: Box<dyn IncomingHandler>,
    fragment_start: u64,
    fragment_size: u64,
    success_reports: SuccessReportMode,
    failure_reports: FailureReport,
    session: SessionId,
}

impl IncomingMessage {
    pub(crate) fn new(
        session: SessionId,
        message: &Message,
        handler: Box<dyn IncomingHandler>,
        defaults: ReportDefaults,
    ) -> IncomingMessage {
        let message_id = message.message_id().unwrap_or_default().to_string();

        let mut success_reports = defaults.success;
        match message.success_report() {
            Ok(Some(true)) => {
                if success_reports == SuccessReportMode::None {
                    success_reports = SuccessReportMode::Automatic;
                }
            }
            Ok(Some(false)) => success_reports = SuccessReportMode::None,
            _ => {}
        }

        let failure_reports = message.failure_report().ok().flatten().unwrap_or(defaults.failure);

        IncomingMessage {
            state: TransferState::new(message_id, announced_size(message)),
            template: message.clone(),
            handler,
            fragment_start: 0,
            fragment_size: 0,
            success_reports,
            failure_reports,
            session,
        }
    }

    pub(crate) fn session(&self) -> SessionId {
        self.session
    }

    /// A new chunk header for this message session arrived. Later chunks
    /// may revise the reporting headers.
    pub(crate) fn process_frame(&mut self, message: &Message) {
        self.template = message.clone();
        self.state.last_transfer = Instant::now();
        self.fragment_size = 0;

        match message.success_report() {
            Ok(Some(true)) => {
                if self.success_reports == SuccessReportMode::None {
                    self.success_reports = SuccessReportMode::Automatic;
                }
            }
            Ok(Some(false)) => self.success_reports = SuccessReportMode::None,
            _ => {}
        }

        if let Ok(Some(mode)) = message.failure_report() {
            self.failure_reports = mode;
        }

        self.handler.on_context(message);
    }

    /// Body bytes for the current fragment.
    pub(crate) fn process_chunk(&mut self, chunk: &[u8]) {
        if self.fragment_size == 0 {
            self.fragment_start = self.state.transferred;
        }

        self.fragment_size += chunk.len() as u64;
        self.state.transferred += chunk.len() as u64;
        self.state.last_transfer = Instant::now();

        self.handler.on_contents(chunk);
    }

    /// The chunk ended with `+`: more to come. May yield a REPORT to send.
    pub(crate) fn continued(&mut self) -> Option<Message> {
        match self.success_reports {
            SuccessReportMode::Automatic | SuccessReportMode::Fragmented => Some(self.success_report()),
            _ => None,
        }
    }

    /// The message ended with `$`.
    pub(crate) fn completed(&mut self) -> Option<Message> {
        self.state.complete = true;
        self.handler.on_complete();

        if self.success_reports != SuccessReportMode::None {
            Some(self.success_report())
        } else {
            None
        }
    }

    /// The sender gave up (`#`).
    pub(crate) fn interrupt(&mut self) {
        self.state.interrupted = true;
        self.handler.on_interrupt();
    }

    /// A 413 response template refusing the rest of this transfer.
    pub(crate) fn cancel_response(&self) -> Result<Message> {
        self.template.response(413, "Cancelled")
    }

    fn success_report(&mut self) -> Message {
        let mut report = Message::new(Method::Report);

        report.set_message_id(self.state.message_id.clone());
        report.set_status_header(&StatusHeader::ok());
        report.set_failure_report(FailureReport::No);
        report.set_byte_range(&ByteRange {
            start: self.fragment_start + 1,
            end: Some(self.fragment_start + self.fragment_size),
            total: self.state.size,
        });

        // REPORTs travel the full reverse path.
        if let Ok(from) = self.template.from_path() {
            report.set_to_path(&from.reversed());
        }
        if let Ok(to) = self.template.to_path() {
            if let Some(first) = to.first() {
                report.set_from_path(&crate::uri::Path::from(first.clone()));
            }
        }

        report.prepare();
        report.set_status(MsgStatus::Complete);

        self.handler.on_send_report(&mut report);

        report
    }
}

pub(crate) struct OutgoingMessage {
    id: OutgoingId,
    state: TransferState,
    template: Message,
    handler: Box<dyn OutgoingHandler>,
    queued: Vec<Bytes>,
    fragment: u64,
    ended: bool,
    final_report_seen: bool,
    session: SessionId,
}

impl OutgoingMessage {
    pub(crate) fn new(
        id: OutgoingId,
        session: SessionId,
        template: Message,
        handler: Box<dyn OutgoingHandler>,
    ) -> OutgoingMessage {
        let message_id = template.message_id().unwrap_or_default().to_string();
        let size = announced_size(&template);

        OutgoingMessage {
            id,
            state: TransferState::new(message_id, size),
            template,
            handler,
            queued: Vec::new(),
            fragment: 0,
            ended: false,
            final_report_seen: false,
            session,
        }
    }

    pub(crate) fn id(&self) -> OutgoingId {
        self.id
    }

    pub(crate) fn session(&self) -> SessionId {
        self.session
    }

    pub(crate) fn message_id(&self) -> &str {
        &self.state.message_id
    }

    pub(crate) fn transferred(&self) -> u64 {
        self.state.transferred
    }

    /// Append application data; drained in one piece on the next turn.
    pub(crate) fn queue(&mut self, data: Bytes) {
        if self.transfer_finished() {
            warn!(message = %self.state.message_id, "data queued on a finished transfer; dropped");
            return;
        }

        self.queued.push(data);
    }

    /// Abort: the next delimiter emitted for this message will be `#`.
    pub(crate) fn cancel(&mut self) {
        if !self.state.complete {
            self.state.interrupted = true;
        }
    }

    /// There is something to put on the wire: queued bytes, a connected
    /// data source, or an interruption that must be signalled.
    pub(crate) fn runnable(&self) -> bool {
        if self.state.complete || self.ended {
            return false;
        }

        !self.queued.is_empty() || self.state.interrupted || self.handler.supplies_data()
    }

    /// Emit this chunk's header block and the blank line before the body.
    pub(crate) fn start(&mut self, egress: &mut EgressBuffer) {
        let range = ByteRange {
            start: self.state.transferred + 1,
            end: None,
            total: self.state.size,
        };
        self.template.set_byte_range(&range);

        self.handler.on_context_required(&mut self.template);

        let mut buf = BytesMut::new();
        match self.template.encode_header(&mut buf) {
            Ok(()) => {
                buf.put_slice(b"\r\n");
                egress.write(buf.freeze());
            }
            Err(e) => warn!(message = %self.state.message_id, "cannot encode chunk header: {e}"),
        }

        self.fragment = 0;
    }

    /// Emit exactly one body chunk: the whole queue if non-empty, otherwise
    /// one application-supplied chunk.
    pub(crate) fn run(&mut self, egress: &mut EgressBuffer) {
        if !self.queued.is_empty() {
            let chunks: Vec<Bytes> = self.queued.drain(..).collect();
            for data in chunks {
                let n = data.len() as u64;
                egress.write(data);
                self.account(n);
            }
            return;
        }

        if self.state.interrupted {
            return;
        }

        let required = self.state.size.map(|total| total.saturating_sub(self.state.transferred));

        let mut sink = ChunkSink {
            egress,
            transferred: &mut self.state.transferred,
            fragment: &mut self.fragment,
            complete: &mut self.state.complete,
            last_transfer: &mut self.state.last_transfer,
            size: self.state.size,
        };

        self.handler.on_data_required(required, &mut sink);
    }

    /// Emit the end delimiter for the current chunk. For a finished
    /// transfer this also retires the message from the scheduler and fires
    /// `on_complete`.
    pub(crate) fn end(&mut self, egress: &mut EgressBuffer, scheduler: &mut Scheduler) {
        if self.ended {
            return;
        }

        let terminator = if self.state.complete {
            b'$'
        } else if self.state.interrupted {
            b'#'
        } else {
            b'+'
        };

        let mut buf = BytesMut::with_capacity(8 + self.template.transaction().len());
        buf.put_slice(b"-------");
        buf.put_slice(self.template.transaction().as_bytes());
        buf.put_u8(terminator);
        egress.write(buf.freeze());

        if self.state.complete || self.state.interrupted {
            scheduler.erase(self.id);
            self.ended = true;
            self.handler.on_complete();
        }
    }

    pub(crate) fn transfer_finished(&self) -> bool {
        self.state.complete || self.state.interrupted
    }

    /// Incoming REPORT for this message.
    pub(crate) fn process_report(&mut self, report: &Message) {
        if self.is_final_report(report) {
            self.final_report_seen = true;
        }

        self.handler.on_report(report);
    }

    pub(crate) fn final_report_seen(&self) -> bool {
        self.final_report_seen
    }

    /// Whether the message must stay registered for late REPORTs after the
    /// transfer itself finished.
    pub(crate) fn keep_for_reports(&self) -> bool {
        matches!(self.template.success_report(), Ok(Some(true))) && !self.final_report_seen
    }

    fn is_final_report(&self, report: &Message) -> bool {
        let Some(total) = self.state.size else {
            return true;
        };

        matches!(report.byte_range(), Ok(Some(range)) if range.end.is_some_and(|end| end >= total))
    }

    fn account(&mut self, n: u64) {
        self.state.transferred += n;
        self.fragment += n;
        self.state.last_transfer = Instant::now();

        if self.state.size.is_some_and(|total| self.state.transferred >= total) {
            self.state.complete = true;
        }
    }
}

/// Write half handed to [`OutgoingHandler::on_data_required`]: each `write`
/// puts bytes on the connection and advances the transfer counters. When
/// the announced total is reached the transfer marks itself complete.
pub struct ChunkSink<'a> {
    egress: &'a mut EgressBuffer,
    transferred: &'a mut u64,
    fragment: &'a mut u64,
    complete: &'a mut bool,
    last_transfer: &'a mut Instant,
    size: Option<u64>,
}

impl ChunkSink<'_> {
    /// Queue an owned span without copying.
    pub fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }

        let n = data.len() as u64;
        self.egress.write(data);
        self.account(n);
    }

    /// Copy borrowed bytes in.
    pub fn write_slice(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        self.egress.write_copy(data);
        self.account(data.len() as u64);
    }

    fn account(&mut self, n: u64) {
        *self.transferred += n;
        *self.fragment += n;
        *self.last_transfer = Instant::now();

        if self.size.is_some_and(|total| *self.transferred >= total) {
            *self.complete = true;
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records everything an incoming transfer delivers.
    #[derive(Default)]
    pub struct Recorded {
        pub contents: Vec<u8>,
        pub frames: usize,
        pub complete: bool,
        pub interrupted: bool,
    }

    #[derive(Clone, Default)]
    pub struct Recorder(pub Arc<Mutex<Recorded>>);

    impl IncomingHandler for Recorder {
        fn on_context(&mut self, _message: &Message) {
            self.0.lock().unwrap().frames += 1;
        }

        fn on_contents(&mut self, chunk: &[u8]) {
            self.0.lock().unwrap().contents.extend_from_slice(chunk);
        }

        fn on_complete(&mut self) {
            self.0.lock().unwrap().complete = true;
        }

        fn on_interrupt(&mut self) {
            self.0.lock().unwrap().interrupted = true;
        }
    }

    /// Streams `chunk`-sized pieces of repeated `fill` bytes on demand.
    pub struct Feeder {
        pub fill: u8,
        pub chunk: usize,
    }

    impl OutgoingHandler for Feeder {
        fn on_data_required(&mut self, required: Option<u64>, sink: &mut ChunkSink<'_>) {
            let len = required.map_or(self.chunk as u64, |r| r.min(self.chunk as u64));
            sink.write(Bytes::from(vec![self.fill; len as usize]));
        }
    }

    /// Queue-only handler: no data source.
    pub struct QueueOnly;

    impl OutgoingHandler for QueueOnly {
        fn supplies_data(&self) -> bool {
            false
        }
    }

    pub fn send_template(tid: &str, message_id: &str, total: Option<u64>) -> Message {
        let mut m = Message::new(Method::Send);
        m.set_transaction(tid);
        m.set_message_id(message_id);
        m.set_to_path(&"msrp:b.example.com/peer".parse().unwrap());
        m.set_from_path(&"msrp:a.example.com/self".parse().unwrap());
        if let Some(total) = total {
            m.set_byte_range(&ByteRange { start: 1, end: None, total: Some(total) });
        }
        m
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn incoming_frame(message_id: &str, total: Option<u64>, success: Option<bool>) -> Message {
        let mut m = send_template("t1", message_id, total);
        if let Some(wanted) = success {
            m.set_success_report(wanted);
        }
        m.set_status(MsgStatus::Streaming);
        m
    }

    #[test]
    fn incoming_counts_fragments_and_reports() {
        let recorder = Recorder::default();
        let frame = incoming_frame("m1", Some(10), Some(true));

        let mut incoming = IncomingMessage::new(1, &frame, Box::new(recorder.clone()), ReportDefaults::default());
        incoming.process_frame(&frame);

        incoming.process_chunk(b"hello");
        let report = incoming.continued().expect("continued chunk reports");

        assert_eq!(report.method(), Method::Report);
        assert_eq!(report.message_id(), Some("m1"));
        let range = report.byte_range().unwrap().unwrap();
        assert_eq!((range.start, range.end, range.total), (1, Some(5), Some(10)));
        assert_eq!(report.failure_report().unwrap(), Some(FailureReport::No));

        // REPORT goes back along the sender's path.
        assert_eq!(report.to_path().unwrap()[0].host(), "a.example.com");

        // Second fragment starts where the first ended.
        incoming.process_frame(&frame);
        incoming.process_chunk(b"world");
        let report = incoming.completed().expect("completion reports");
        let range = report.byte_range().unwrap().unwrap();
        assert_eq!((range.start, range.end), (6, Some(10)));

        let recorded = recorder.0.lock().unwrap();
        assert_eq!(recorded.contents, b"helloworld");
        assert!(recorded.complete);
    }

    #[test]
    fn incoming_success_report_no_suppresses_reports() {
        let frame = incoming_frame("m2", None, Some(false));
        let mut incoming =
            IncomingMessage::new(1, &frame, Box::new(Recorder::default()), ReportDefaults::default());

        incoming.process_chunk(b"x");
        assert!(incoming.continued().is_none());
        assert!(incoming.completed().is_none());
    }

    #[test]
    fn incoming_interrupt_fires_handler() {
        let recorder = Recorder::default();
        let frame = incoming_frame("m3", None, None);
        let mut incoming = IncomingMessage::new(1, &frame, Box::new(recorder.clone()), ReportDefaults::default());

        incoming.interrupt();
        assert!(recorder.0.lock().unwrap().interrupted);
    }

    #[test]
    fn incoming_cancel_builds_413() {
        let frame = incoming_frame("m4", None, None);
        let incoming = IncomingMessage::new(1, &frame, Box::new(Recorder::default()), ReportDefaults::default());

        let response = incoming.cancel_response().unwrap();
        assert_eq!(response.status_code(), 413);
        assert_eq!(response.status_phrase(), "Cancelled");
        assert_eq!(response.transaction(), "t1");
    }

    #[test]
    fn outgoing_completes_at_announced_size() {
        let mut egress = EgressBuffer::new();
        let mut scheduler = Scheduler::new();

        let template = send_template("to1", "om1", Some(6));
        let mut outgoing = OutgoingMessage::new(7, 1, template, Box::new(Feeder { fill: b'z', chunk: 4 }));
        scheduler.queue(7);

        outgoing.start(&mut egress);
        let header = String::from_utf8(egress.take_all()).unwrap();
        assert!(header.starts_with("MSRP to1 SEND\r\n"));
        assert!(header.contains("Byte-Range: 1-*/6\r\n"));
        assert!(header.ends_with("\r\n\r\n"));

        outgoing.run(&mut egress);
        assert_eq!(egress.take_all(), b"zzzz");
        assert!(!outgoing.transfer_finished());

        outgoing.run(&mut egress);
        assert_eq!(egress.take_all(), b"zz");
        assert!(outgoing.transfer_finished());

        outgoing.end(&mut egress, &mut scheduler);
        assert_eq!(egress.take_all(), b"-------to1$");
        assert!(scheduler.is_empty());
    }

    #[test]
    fn outgoing_queue_only_runnable_while_data_queued() {
        let template = send_template("to2", "om2", None);
        let mut outgoing = OutgoingMessage::new(8, 1, template, Box::new(QueueOnly));

        assert!(!outgoing.runnable());

        outgoing.queue(Bytes::from_static(b"payload"));
        assert!(outgoing.runnable());

        let mut egress = EgressBuffer::new();
        outgoing.run(&mut egress);
        assert_eq!(egress.take_all(), b"payload");
        assert_eq!(outgoing.transferred(), 7);
        assert!(!outgoing.runnable());
    }

    #[test]
    fn outgoing_cancel_emits_interrupt_delimiter() {
        let mut egress = EgressBuffer::new();
        let mut scheduler = Scheduler::new();

        let template = send_template("to3", "om3", Some(100));
        let mut outgoing = OutgoingMessage::new(9, 1, template, Box::new(Feeder { fill: b'q', chunk: 10 }));
        scheduler.queue(9);

        outgoing.start(&mut egress);
        outgoing.run(&mut egress);
        egress.take_all();

        outgoing.cancel();
        assert!(outgoing.runnable());

        outgoing.end(&mut egress, &mut scheduler);
        assert_eq!(egress.take_all(), b"-------to3#");
        assert!(scheduler.is_empty());
    }

    #[test]
    fn outgoing_report_retention() {
        let mut template = send_template("to4", "om4", Some(4));
        template.set_success_report(true);
        let mut outgoing = OutgoingMessage::new(10, 1, template, Box::new(QueueOnly));

        assert!(outgoing.keep_for_reports());

        let mut report = Message::new(Method::Report);
        report.set_transaction("r1");
        report.set_message_id("om4");
        report.set_byte_range(&ByteRange { start: 1, end: Some(4), total: Some(4) });

        outgoing.process_report(&report);
        assert!(outgoing.final_report_seen());
        assert!(!outgoing.keep_for_reports());
    }
}
