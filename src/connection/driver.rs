//! The per-connection tokio task.
//!
//! One task owns the socket, the reconnect state and the
//! [`ConnectionCore`]; a small companion task owns the write half so that
//! exactly one gather write is in flight at any time. Scheduler selection
//! happens when that write's completion is reported back, never while
//! bytes are still leaving.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use super::core::{ConnectionCore, CoreFlow};
use super::{Command, ConnectionEvent, ConnectionOptions};
use crate::error::Error;

/// Transport states of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Listening,
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
}

/// How the connection comes to own a socket.
pub(crate) enum Mode {
    /// Bind and accept one peer.
    Offer(TcpListener),
    /// Connect outward to the target list.
    Answer,
    /// Wrap an externally accepted stream.
    Adopt(Option<TcpStream>),
}

/// Plain or TLS-wrapped socket.
enum NetStream {
    Tcp(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl NetStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.tcp().local_addr().ok()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.tcp().peer_addr().ok()
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            NetStream::Tcp(stream) => stream,
            NetStream::TlsClient(stream) => stream.get_ref().0,
            NetStream::TlsServer(stream) => stream.get_ref().0,
        }
    }
}

impl AsyncRead for NetStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            NetStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            NetStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for NetStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            NetStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            NetStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            NetStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            NetStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            NetStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            NetStream::TlsClient(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            NetStream::TlsServer(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Why `serve` returned.
enum ServeEnd {
    /// `close()` was requested, or the last session went away.
    Closed,
    /// Every handle is gone; nobody is left to talk to.
    HandlesDropped,
    /// Transport failure: candidates for failover.
    Error(Error),
}

enum Flow {
    Continue,
    Close,
}

pub(crate) struct Driver {
    core: ConnectionCore,
    rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    options: ConnectionOptions,
    targets: Vec<SocketAddr>,
    cursor: usize,
    state: ConnState,
    attempted: bool,
}

impl Driver {
    pub(crate) fn new(
        options: ConnectionOptions,
        core: ConnectionCore,
        rx: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Driver {
        let targets = options.targets.clone();

        Driver {
            core,
            rx,
            events,
            options,
            targets,
            cursor: 0,
            state: ConnState::Disconnected,
            attempted: false,
        }
    }

    pub(crate) async fn run(mut self, mut mode: Mode) {
        if let Mode::Offer(listener) = &mode {
            if let Ok(local) = listener.local_addr() {
                self.core.set_local(local);
                let _ = self.events.send(ConnectionEvent::Listening(local));
                info!("listening on {local}");
            }
        }

        loop {
            let Some(stream) = self.establish(&mut mode).await else {
                return;
            };

            match self.serve(stream).await {
                ServeEnd::HandlesDropped => return,
                ServeEnd::Closed => {
                    self.announce_close();
                    return;
                }
                ServeEnd::Error(error) => {
                    self.cursor += 1;
                    let reconnecting = self.cursor < self.targets.len();
                    warn!("disconnected: {error} (reconnecting: {reconnecting})");

                    let _ = self.events.send(ConnectionEvent::Disconnected {
                        error: Some(error),
                        reconnecting,
                    });

                    if !reconnecting && !self.dormant().await {
                        return;
                    }
                }
            }
        }
    }

    /// Produce a connected stream, processing commands meanwhile. `None`
    /// means the connection is done for good.
    async fn establish(&mut self, mode: &mut Mode) -> Option<NetStream> {
        match mode {
            Mode::Adopt(slot) => {
                if let Some(tcp) = slot.take() {
                    // Remember the peer so a later push_targets can revive
                    // the connection toward it.
                    if let Ok(peer) = tcp.peer_addr() {
                        if !self.targets.contains(&peer) {
                            self.targets.push(peer);
                        }
                    }
                    return self.rig_inbound(tcp).await;
                }

                self.connect_loop().await
            }
            Mode::Offer(listener) => {
                self.state = ConnState::Listening;

                let accepted = loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((tcp, peer)) => {
                                info!("accepted connection from {peer}");
                                break tcp;
                            }
                            Err(e) => {
                                warn!("accept failed: {e}");
                                let _ = self.events.send(ConnectionEvent::Disconnected {
                                    error: Some(Error::Transport(e)),
                                    reconnecting: false,
                                });
                                return None;
                            }
                        },
                        command = self.rx.recv() => match command {
                            None => return None,
                            Some(command) => {
                                if matches!(self.background_command(command), Flow::Close) {
                                    self.announce_close();
                                    return None;
                                }
                            }
                        },
                    }
                };

                // Single-shot accept: further establishment goes through
                // the target list.
                *mode = Mode::Answer;

                self.rig_inbound(accepted).await
            }
            Mode::Answer => self.connect_loop().await,
        }
    }

    /// Walk the target list until something connects.
    async fn connect_loop(&mut self) -> Option<NetStream> {
        loop {
            if self.attempted && !self.options.reconnect_delay.is_zero() {
                debug!("reconnect in {:?}", self.options.reconnect_delay);
                if !self.pause().await {
                    return None;
                }
            }
            self.attempted = true;

            if self.cursor >= self.targets.len() {
                // Cycle back when a manual connect restarted the walk.
                self.cursor = 0;
            }

            let Some(&target) = self.targets.get(self.cursor) else {
                if !self.dormant().await {
                    return None;
                }
                continue;
            };

            self.state = ConnState::Connecting;
            let _ = self.events.send(ConnectionEvent::Connecting(target));
            info!("connecting to {target}");

            tokio::select! {
                connected = TcpStream::connect(target) => match connected {
                    Ok(tcp) => {
                        if let Err(e) = tcp.set_nodelay(true) {
                            debug!("set_nodelay: {e}");
                        }

                        match self.rig_outbound(tcp, target).await {
                            Some(stream) => return Some(stream),
                            None => {
                                if !self.next_target().await {
                                    return None;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("connect to {target} failed: {e}");
                        let _ = self.events.send(ConnectionEvent::Disconnected {
                            error: Some(Error::Transport(e)),
                            reconnecting: self.cursor + 1 < self.targets.len(),
                        });

                        if !self.next_target().await {
                            return None;
                        }
                    }
                },
                command = self.rx.recv() => match command {
                    None => return None,
                    Some(command) => {
                        if matches!(self.background_command(command), Flow::Close) {
                            self.announce_close();
                            return None;
                        }
                    }
                },
            }
        }
    }

    /// Advance the target cursor; when the list is exhausted, go dormant
    /// until new targets arrive. `false` ends the connection.
    async fn next_target(&mut self) -> bool {
        self.cursor += 1;

        if self.cursor < self.targets.len() {
            return true;
        }

        self.dormant().await
    }

    /// Disconnected with nowhere to go: wait for `push_targets`, a manual
    /// `connect`, or the end.
    async fn dormant(&mut self) -> bool {
        self.state = ConnState::Disconnected;

        loop {
            match self.rx.recv().await {
                None => return false,
                Some(Command::PushTargets { targets }) => {
                    self.push_targets(targets);
                    if self.cursor < self.targets.len() {
                        return true;
                    }
                }
                Some(Command::Connect) => {
                    if !self.targets.is_empty() {
                        self.cursor = 0;
                        return true;
                    }
                }
                Some(Command::Close) => return false,
                Some(command) => {
                    if matches!(self.background_command(command), Flow::Close) {
                        return false;
                    }
                }
            }
        }
    }

    /// Reconnect back-off; a manual `connect` cancels the timer.
    async fn pause(&mut self) -> bool {
        let sleep = tokio::time::sleep(self.options.reconnect_delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.rx.recv() => match command {
                    None => return false,
                    Some(Command::Connect) => return true,
                    Some(command) => {
                        if matches!(self.background_command(command), Flow::Close) {
                            self.announce_close();
                            return false;
                        }
                    }
                },
            }
        }
    }

    /// The application closed the connection (or the last session went
    /// away): exactly one final disconnect event, whatever phase the
    /// transport was in.
    fn announce_close(&mut self) {
        let _ = self.events.send(ConnectionEvent::Disconnected {
            error: None,
            reconnecting: false,
        });
    }

    /// Commands handled while no socket is being served.
    fn background_command(&mut self, command: Command) -> Flow {
        match command {
            Command::PushTargets { targets } => {
                self.push_targets(targets);
                Flow::Continue
            }
            Command::Connect => Flow::Continue,
            Command::Close => Flow::Close,
            other => match self.core.handle_command(other) {
                CoreFlow::CloseConnection => Flow::Close,
                CoreFlow::Continue => Flow::Continue,
            },
        }
    }

    /// Append reconnect candidates, deduplicated. If the cursor had
    /// exhausted the list it repositions to the first pushed entry.
    fn push_targets(&mut self, new: Vec<SocketAddr>) {
        let reposition = self.cursor >= self.targets.len();
        let first = new.first().copied();

        for addr in new {
            if !self.targets.contains(&addr) {
                self.targets.push(addr);
            }
        }

        if reposition {
            if let Some(first) = first {
                if let Some(at) = self.targets.iter().position(|&addr| addr == first) {
                    self.cursor = at;
                }
            }
        }
    }

    /// TLS-wrap an accepted socket when configured.
    async fn rig_inbound(&mut self, tcp: TcpStream) -> Option<NetStream> {
        if let Err(e) = tcp.set_nodelay(true) {
            debug!("set_nodelay: {e}");
        }

        let Some(tls) = &self.options.tls else {
            return Some(NetStream::Tcp(tcp));
        };

        let Some(server) = tls.server.clone() else {
            warn!("TLS requested for an inbound connection but no server config present");
            let _ = self.events.send(ConnectionEvent::Disconnected {
                error: Some(Error::InvalidState("missing TLS server configuration")),
                reconnecting: false,
            });
            return None;
        };

        self.state = ConnState::Handshaking;
        match TlsAcceptor::from(server).accept(tcp).await {
            Ok(stream) => Some(NetStream::TlsServer(Box::new(stream))),
            Err(e) => {
                warn!("TLS accept failed: {e}");
                let _ = self.events.send(ConnectionEvent::Disconnected {
                    error: Some(Error::Transport(e)),
                    reconnecting: false,
                });
                None
            }
        }
    }

    /// TLS-wrap an outbound socket when configured. `None` sends the
    /// caller on to the next target.
    async fn rig_outbound(&mut self, tcp: TcpStream, target: SocketAddr) -> Option<NetStream> {
        let Some(tls) = &self.options.tls else {
            return Some(NetStream::Tcp(tcp));
        };

        let Some(client) = tls.client.clone() else {
            warn!("TLS target but no client config present");
            return None;
        };

        let name = match &tls.server_name {
            Some(name) => match ServerName::try_from(name.clone()) {
                Ok(name) => name,
                Err(e) => {
                    warn!("bad TLS server name {name:?}: {e}");
                    return None;
                }
            },
            None => ServerName::IpAddress(target.ip().into()),
        };

        self.state = ConnState::Handshaking;
        match TlsConnector::from(client).connect(name, tcp).await {
            Ok(stream) => Some(NetStream::TlsClient(Box::new(stream))),
            Err(e) => {
                warn!("TLS handshake with {target} failed: {e}");
                None
            }
        }
    }

    /// Drive one connected socket until it dies or the connection closes.
    async fn serve(&mut self, stream: NetStream) -> ServeEnd {
        let local = stream.local_addr();
        let peer = stream.peer_addr();

        self.state = ConnState::Connected;
        self.core.on_connected(local, peer);

        if let Some(peer) = peer {
            info!("connected to {peer}");
            let _ = self.events.send(ConnectionEvent::Connected(peer));
        }

        let (mut read_half, write_half) = tokio::io::split(stream);

        let (write_tx, write_rx) = mpsc::channel::<Vec<Bytes>>(1);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<io::Result<usize>>();
        let writer = tokio::spawn(write_loop(write_half, write_rx, done_tx));

        // Frames queued before the socket was up go out now.
        self.core.select_outgoing();

        let mut writing = false;

        let end = loop {
            if !writing && !self.core.egress.is_empty() {
                let batch: Vec<Bytes> = self.core.egress.spans().cloned().collect();
                if write_tx.send(batch).await.is_err() {
                    break ServeEnd::Error(Error::Transport(io::ErrorKind::BrokenPipe.into()));
                }
                writing = true;
            }

            if self.core.buffer.writable().is_empty() {
                // A non-SEND frame outgrew the parse buffer.
                break ServeEnd::Error(Error::BufferExhausted);
            }

            tokio::select! {
                read = read_half.read(self.core.buffer.writable()) => match read {
                    Ok(0) => break ServeEnd::Error(Error::Transport(io::ErrorKind::UnexpectedEof.into())),
                    Ok(n) => {
                        debug!("received {n} bytes");
                        if let Err(e) = self.core.on_read(n) {
                            break ServeEnd::Error(e);
                        }
                    }
                    Err(e) => break ServeEnd::Error(Error::Transport(e)),
                },
                done = done_rx.recv() => match done {
                    Some(Ok(n)) => {
                        debug!("sent {n} bytes");
                        writing = false;
                        self.core.on_write_complete(n);
                    }
                    Some(Err(e)) => break ServeEnd::Error(Error::Transport(e)),
                    None => break ServeEnd::Error(Error::Transport(io::ErrorKind::BrokenPipe.into())),
                },
                command = self.rx.recv() => match command {
                    None => break ServeEnd::HandlesDropped,
                    Some(Command::Close) => break ServeEnd::Closed,
                    Some(Command::Connect) => {}
                    Some(Command::PushTargets { targets }) => self.push_targets(targets),
                    Some(command) => {
                        if matches!(self.core.handle_command(command), CoreFlow::CloseConnection) {
                            break ServeEnd::Closed;
                        }

                        // A new transfer may be ready while the wire is idle.
                        if !writing && self.core.egress.is_empty() {
                            self.core.select_outgoing();
                        }
                    }
                },
            }
        };

        writer.abort();
        self.state = ConnState::Disconnected;
        self.core.on_disconnected();

        debug!(state = ?self.state, "socket released");

        end
    }
}

/// Owns the write half: one gather batch in flight at a time, completion
/// reported back with the byte count.
async fn write_loop(
    mut half: WriteHalf<NetStream>,
    mut batches: mpsc::Receiver<Vec<Bytes>>,
    done: mpsc::UnboundedSender<io::Result<usize>>,
) {
    while let Some(batch) = batches.recv().await {
        let mut total = 0;

        for chunk in &batch {
            if let Err(e) = half.write_all(chunk).await {
                let _ = done.send(Err(e));
                return;
            }
            total += chunk.len();
        }

        if let Err(e) = half.flush().await {
            let _ = done.send(Err(e));
            return;
        }

        if done.send(Ok(total)).is_err() {
            return;
        }
    }
}
