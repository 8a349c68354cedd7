//! End-to-end exercises over real sockets: an offer endpoint and an answer
//! endpoint on localhost, streaming messages both through the happy path
//! and through rejection and interruption.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use msrp::{
    ChunkSink, Connection, ConnectionEvent, ConnectionOptions, IncomingHandle, IncomingHandler,
    Message, Method, OutgoingHandler, Path, SessionHandler,
};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>, what: F) -> ConnectionEvent
where
    F: Fn(&ConnectionEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed");

        if what(&event) {
            return event;
        }
    }
}

async fn signalled(rx: &mut mpsc::UnboundedReceiver<()>) {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a signal")
        .expect("signal channel closed");
}

/// Collects one inbound transfer.
struct Collect {
    contents: Arc<Mutex<Vec<u8>>>,
    complete: mpsc::UnboundedSender<()>,
    interrupted: mpsc::UnboundedSender<()>,
}

impl IncomingHandler for Collect {
    fn on_contents(&mut self, chunk: &[u8]) {
        self.contents.lock().unwrap().extend_from_slice(chunk);
    }

    fn on_complete(&mut self) {
        let _ = self.complete.send(());
    }

    fn on_interrupt(&mut self) {
        let _ = self.interrupted.send(());
    }
}

/// Accepts every message session with a fresh [`Collect`].
struct Accept {
    contents: Arc<Mutex<Vec<u8>>>,
    complete: mpsc::UnboundedSender<()>,
    interrupted: mpsc::UnboundedSender<()>,
}

impl SessionHandler for Accept {
    fn on_message_session(
        &mut self,
        _message: &Message,
        _controls: IncomingHandle,
    ) -> Option<Box<dyn IncomingHandler>> {
        Some(Box::new(Collect {
            contents: self.contents.clone(),
            complete: self.complete.clone(),
            interrupted: self.interrupted.clone(),
        }))
    }
}

/// Session handler that only records complete frames (responses).
struct Watch {
    responses: mpsc::UnboundedSender<u16>,
}

impl SessionHandler for Watch {
    fn on_message(&mut self, message: &Message) {
        if message.method() == Method::Response {
            let _ = self.responses.send(message.status_code());
        }
    }
}

/// Streams a byte vector in fixed-size chunks and reports progress.
struct Source {
    data: Vec<u8>,
    offset: usize,
    chunk: usize,
    reports: mpsc::UnboundedSender<()>,
    complete: mpsc::UnboundedSender<()>,
}

impl OutgoingHandler for Source {
    fn on_data_required(&mut self, _required: Option<u64>, sink: &mut ChunkSink<'_>) {
        let end = (self.offset + self.chunk).min(self.data.len());
        if self.offset < end {
            sink.write_slice(&self.data[self.offset..end]);
            self.offset = end;
        }
    }

    fn on_report(&mut self, _report: &Message) {
        let _ = self.reports.send(());
    }

    fn on_complete(&mut self) {
        let _ = self.complete.send(());
    }
}

/// Queue-fed handler with no pull data source.
struct Queued;

impl OutgoingHandler for Queued {
    fn supplies_data(&self) -> bool {
        false
    }
}

struct Receiver {
    _connection: Connection,
    _session: msrp::SessionHandle,
    addr: std::net::SocketAddr,
    contents: Arc<Mutex<Vec<u8>>>,
    complete: mpsc::UnboundedReceiver<()>,
    interrupted: mpsc::UnboundedReceiver<()>,
}

/// Offer side: listen, register a catch-all session named after the local
/// endpoint.
async fn receiver() -> Receiver {
    let mut connection = Connection::offer(ConnectionOptions {
        bind: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    })
    .await
    .expect("bind offer");

    let mut events = connection.events().unwrap();
    let ConnectionEvent::Listening(addr) =
        wait_for(&mut events, |e| matches!(e, ConnectionEvent::Listening(_))).await
    else {
        unreachable!()
    };

    let contents = Arc::new(Mutex::new(Vec::new()));
    let (complete_tx, complete) = mpsc::unbounded_channel();
    let (interrupted_tx, interrupted) = mpsc::unbounded_channel();

    let session = connection.session(
        Path::new(),
        Box::new(Accept {
            contents: contents.clone(),
            complete: complete_tx,
            interrupted: interrupted_tx,
        }),
    );

    Receiver {
        _connection: connection,
        _session: session,
        addr,
        contents,
        complete,
        interrupted,
    }
}

async fn connected_answer(addr: std::net::SocketAddr) -> Connection {
    let mut connection = Connection::answer(ConnectionOptions {
        targets: vec![addr],
        ..Default::default()
    });

    let mut events = connection.events().unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Connected(_))).await;

    connection
}

#[tokio::test]
async fn stream_large_message_end_to_end() {
    let _ = tracing_subscriber::fmt().try_init();

    let mut receiver = receiver().await;
    let sender = connected_answer(receiver.addr).await;

    let session = sender.session(
        "msrp:alicepc.example.com:7777/iau39;tcp".parse().unwrap(),
        Box::new(Watch {
            responses: mpsc::unbounded_channel().0,
        }),
    );

    // 100 KiB body, streamed in 4 KiB chunks through an 8 KiB parse buffer
    // on the receiving side.
    let body: Vec<u8> = (0..100 * 1024u32).map(|i| b'a' + (i % 23) as u8).collect();

    let (reports_tx, mut reports) = mpsc::unbounded_channel();
    let (complete_tx, mut sent) = mpsc::unbounded_channel();

    let mut template = Message::new(Method::Send);
    template.set_content_type("text/plain");
    template.set_success_report(true);
    template.set_byte_range(&msrp::ByteRange {
        start: 1,
        end: None,
        total: Some(body.len() as u64),
    });

    session.stream(
        template,
        Box::new(Source {
            data: body.clone(),
            offset: 0,
            chunk: 4096,
            reports: reports_tx,
            complete: complete_tx,
        }),
    );

    // The receiver sees the whole body, in order.
    signalled(&mut receiver.complete).await;
    assert_eq!(*receiver.contents.lock().unwrap(), body);

    // The sender finished and got the success REPORT back.
    signalled(&mut sent).await;
    signalled(&mut reports).await;
}

#[tokio::test]
async fn cancelled_transfer_interrupts_the_receiver() {
    let _ = tracing_subscriber::fmt().try_init();

    let mut receiver = receiver().await;
    let sender = connected_answer(receiver.addr).await;

    let session = sender.session(
        "msrp:alicepc.example.com:7777/iau39;tcp".parse().unwrap(),
        Box::new(Watch {
            responses: mpsc::unbounded_channel().0,
        }),
    );

    // Unknown total: queued bytes alone never complete the transfer.
    let mut template = Message::new(Method::Send);
    template.set_content_type("text/plain");

    let transfer = session.stream(template, Box::new(Queued));
    transfer.queue(Bytes::from_static(b"hello"));
    transfer.cancel();

    signalled(&mut receiver.interrupted).await;
    assert_eq!(*receiver.contents.lock().unwrap(), b"hello");
}

#[tokio::test]
async fn closing_before_a_peer_arrives_fires_final_disconnect() {
    let _ = tracing_subscriber::fmt().try_init();

    let mut connection = Connection::offer(ConnectionOptions {
        bind: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    })
    .await
    .expect("bind offer");

    let mut events = connection.events().unwrap();
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Listening(_))).await;

    // No peer ever connects; close() must still produce exactly one final
    // disconnect event rather than silently dropping the event channel.
    connection.close();

    let event = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Disconnected { .. })).await;
    let ConnectionEvent::Disconnected { error, reconnecting } = event else {
        unreachable!()
    };
    assert!(error.is_none());
    assert!(!reconnecting);
}

#[tokio::test]
async fn send_to_unknown_session_is_rejected_with_481() {
    let _ = tracing_subscriber::fmt().try_init();

    let receiver = receiver().await;
    let sender = connected_answer(receiver.addr).await;

    let (responses_tx, mut responses) = mpsc::unbounded_channel();
    let session = sender.session(
        "msrp:alicepc.example.com:7777/iau39;tcp".parse().unwrap(),
        Box::new(Watch { responses: responses_tx }),
    );

    // Explicit To-Path that no session on the receiver owns.
    let mut template = Message::new(Method::Send);
    template.set_content_type("text/plain");
    template.set_to_path(&format!("msrp://{}/not-a-session", receiver.addr).parse().unwrap());
    template.set_byte_range(&msrp::ByteRange {
        start: 1,
        end: None,
        total: Some(4),
    });

    let transfer = session.stream(template, Box::new(Queued));
    transfer.queue(Bytes::from_static(b"ping"));

    let code = timeout(WAIT, responses.recv())
        .await
        .expect("timed out waiting for the rejection")
        .expect("response channel closed");
    assert_eq!(code, 481);
}
