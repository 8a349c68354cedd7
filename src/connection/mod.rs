//! Connection lifecycle and the application-facing handle.
//!
//! A [`Connection`] owns one framed byte stream (TCP, or TLS for `msrps`)
//! and multiplexes any number of [`SessionHandle`]s over it. All parsing,
//! routing and scheduling happens on a dedicated task; the handle talks to
//! that task over a command channel and observes it through
//! [`ConnectionEvent`]s.
//!
//! Three construction modes mirror how MSRP endpoints meet:
//!
//! * [`Connection::offer`] — bind locally and accept one peer.
//! * [`Connection::answer`] — connect outward along a target list, failing
//!   over and reconnecting as targets die.
//! * [`Connection::adopt`] — wrap a socket accepted elsewhere.

mod core;
mod driver;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use self::core::ConnectionCore;
use self::driver::{Driver, Mode};
use crate::codec::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::headers::FailureReport;
use crate::message::Message;
use crate::session::{SessionHandle, SessionHandler, SessionId};
use crate::transfer::{OutgoingHandler, OutgoingId, ReportDefaults, SuccessReportMode};
use crate::uri::Path;

/// TLS material for `msrps` connections. Presence selects TLS; absence
/// selects plain TCP.
#[derive(Clone)]
pub struct TlsConfig {
    /// Used when connecting outward.
    pub client: Option<Arc<rustls::ClientConfig>>,
    /// Used when accepting.
    pub server: Option<Arc<rustls::ServerConfig>>,
    /// SNI name for outbound handshakes; defaults to the target IP.
    pub server_name: Option<String>,
}

/// Caller-supplied construction options.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Local listen address for [`Connection::offer`].
    pub bind: Option<SocketAddr>,
    /// Initial peer list for [`Connection::answer`].
    pub targets: Vec<SocketAddr>,
    /// TLS material; `None` means plain TCP.
    pub tls: Option<TlsConfig>,
    /// Per-connection parse buffer size.
    pub buffer_size: usize,
    /// Back-off between reconnect attempts; zero reconnects immediately.
    pub reconnect_delay: Duration,
    /// Default success-report behaviour for inbound transfers.
    pub success_reports: SuccessReportMode,
    /// Default failure-report behaviour for inbound transfers.
    pub failure_reports: FailureReport,
}

impl Default for ConnectionOptions {
    fn default() -> ConnectionOptions {
        ConnectionOptions {
            bind: None,
            targets: Vec::new(),
            tls: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reconnect_delay: Duration::ZERO,
            success_reports: SuccessReportMode::default(),
            failure_reports: FailureReport::default(),
        }
    }
}

/// Lifecycle notifications, in order of occurrence.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// An offer is bound and awaiting its peer.
    Listening(SocketAddr),
    /// An outward connect to this target started.
    Connecting(SocketAddr),
    /// The transport is up.
    Connected(SocketAddr),
    /// The transport went down. `reconnecting` distinguishes a transient
    /// failover (another target will be tried) from a final disconnect.
    Disconnected {
        error: Option<Error>,
        reconnecting: bool,
    },
}

/// Messages from handles to the connection task.
pub(crate) enum Command {
    OpenSession {
        id: SessionId,
        path: Path,
        handler: Box<dyn SessionHandler>,
    },
    CloseSession {
        id: SessionId,
    },
    Stream {
        session: SessionId,
        id: OutgoingId,
        template: Message,
        handler: Box<dyn OutgoingHandler>,
    },
    QueueData {
        id: OutgoingId,
        data: Bytes,
    },
    CancelOutgoing {
        id: OutgoingId,
    },
    CancelIncoming {
        message_id: String,
    },
    SendMessage {
        session: SessionId,
        message: Message,
    },
    PushTargets {
        targets: Vec<SocketAddr>,
    },
    Connect,
    Close,
}

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;

/// Handle to a running connection task.
pub struct Connection {
    tx: CommandSender,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    ids: Arc<AtomicU64>,
}

impl Connection {
    /// Passive open: bind, listen, accept one peer.
    pub async fn offer(options: ConnectionOptions) -> Result<Connection> {
        let bind = options
            .bind
            .ok_or(Error::InvalidState("offer requires a bind endpoint"))?;

        let listener = TcpListener::bind(bind).await?;

        Ok(Connection::spawn(options, Mode::Offer(listener)))
    }

    /// Active open: connect to the head of the target list, failing over
    /// through the rest.
    pub fn answer(options: ConnectionOptions) -> Connection {
        Connection::spawn(options, Mode::Answer)
    }

    /// Wrap an already-accepted socket.
    pub fn adopt(stream: TcpStream, options: ConnectionOptions) -> Connection {
        Connection::spawn(options, Mode::Adopt(Some(stream)))
    }

    fn spawn(options: ConnectionOptions, mode: Mode) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let defaults = ReportDefaults {
            success: options.success_reports,
            failure: options.failure_reports,
        };
        let core = ConnectionCore::new(options.buffer_size, defaults, options.tls.is_some(), tx.clone());

        let driver = Driver::new(options, core, rx, events_tx);
        tokio::spawn(driver.run(mode));

        Connection {
            tx,
            events: Some(events_rx),
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Take the event stream. Yields `None` after the first call.
    pub fn events(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.take()
    }

    /// Open a session identified by `path`. With an empty path the session
    /// names itself after the connection's local endpoint.
    ///
    /// The connection stays alive as long as at least one session does;
    /// dropping the last [`SessionHandle`] closes it.
    pub fn session(&self, path: Path, handler: Box<dyn SessionHandler>) -> SessionHandle {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);

        let _ = self.tx.send(Command::OpenSession {
            id,
            path,
            handler,
        });

        SessionHandle::new(self.tx.clone(), id, self.ids.clone())
    }

    /// Add reconnect candidates. While disconnected with an exhausted
    /// target list, this immediately triggers a reconnect.
    pub fn push_targets(&self, targets: Vec<SocketAddr>) {
        let _ = self.tx.send(Command::PushTargets { targets });
    }

    /// Manually (re)connect, cancelling a pending reconnect timer.
    pub fn connect(&self) {
        let _ = self.tx.send(Command::Connect);
    }

    /// Close the connection. Idempotent; the final disconnect event fires
    /// at most once.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}
