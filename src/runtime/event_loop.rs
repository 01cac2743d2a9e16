//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking reads. Uses epoll on Linux, kqueue on macOS.
//!
//! One thread drives every connection. Each turn runs three phases in a
//! fixed order:
//!
//! 1. accept at most one new connection into the pending set
//! 2. read one chunk from each ready pending connection and try to log it in
//! 3. read one chunk from each ready active connection and dispatch commands
//!
//! Readiness is sticky per connection until a read reports `WouldBlock`, so
//! a peer with more queued bytes than one chunk is serviced again on the
//! next turn without waiting for a fresh event.

use crate::commands::{CommandRegistry, Dispatch};
use crate::config::Config;
use crate::directory::CredentialGate;
use crate::protocol::{self, DecodeError, Decoded};
use crate::runtime::connection::{
    ActiveVisit, ConnId, Connection, ConnectionPool, PendingVisit,
};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

const EVENTS_CAPACITY: usize = 1024;

/// Loop limits, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_connections: usize,
    pub read_buffer_size: usize,
    pub max_frame_size: usize,
    pub poll_timeout: Duration,
    pub login_timeout: Option<Duration>,
    pub max_login_attempts: Option<u32>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_connections: 1024,
            read_buffer_size: 1024,
            max_frame_size: 4 * 1024,
            poll_timeout: Duration::from_millis(10),
            login_timeout: Some(Duration::from_secs(30)),
            max_login_attempts: Some(5),
        }
    }
}

impl From<&Config> for LoopSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            read_buffer_size: config.read_buffer_size,
            max_frame_size: config.max_frame_size,
            poll_timeout: config.poll_timeout,
            login_timeout: config.login_timeout,
            max_login_attempts: config.max_login_attempts,
        }
    }
}

/// Result of one bounded read.
enum ReadOutcome {
    /// Bytes were appended to the inbound buffer.
    Data,
    /// Nothing to read right now.
    Idle,
    /// Peer closed or the stream failed.
    Closed,
}

/// The login-gated server loop.
pub struct Server<G> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    /// Set by a listener event, cleared once accept would block.
    listener_ready: bool,
    /// When to retry accepting after a hard accept error.
    accept_retry_at: Option<Instant>,
    pool: ConnectionPool<TcpStream>,
    gate: G,
    registry: CommandRegistry,
    read_buf: Vec<u8>,
    settings: LoopSettings,
}

impl<G: CredentialGate> Server<G> {
    /// Bind the listening socket and set up the poller.
    ///
    /// Failure here is a startup failure; nothing has been accepted yet.
    pub fn bind(
        addr: SocketAddr,
        settings: LoopSettings,
        gate: G,
        registry: CommandRegistry,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            listener_ready: false,
            accept_retry_at: None,
            pool: ConnectionPool::with_capacity(settings.max_connections),
            gate,
            registry,
            read_buf: vec![0u8; settings.read_buffer_size],
            settings,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn pool(&self) -> &ConnectionPool<TcpStream> {
        &self.pool
    }

    /// Run turns until the poller itself fails.
    pub fn run_forever(&mut self) -> io::Result<()> {
        loop {
            self.turn()?;
        }
    }

    /// Run turns until `shutdown` is set.
    pub fn run_until(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            self.turn()?;
        }
        info!(connections = self.pool.len(), "Server loop stopped");
        Ok(())
    }

    /// Run a single iteration: wait for readiness, then accept, then the
    /// pending pass, then the active pass.
    ///
    /// Only a poller failure is returned; every per-connection failure is
    /// handled by closing or keeping that connection.
    pub fn turn(&mut self) -> io::Result<()> {
        self.wait_for_readiness()?;
        self.accept_phase();
        self.pending_phase();
        self.active_phase();
        Ok(())
    }

    fn wait_for_readiness(&mut self) -> io::Result<()> {
        // Don't sleep while some source still has unread data.
        let timeout = if self.listener_ready || self.pool.any_readable() {
            Duration::ZERO
        } else {
            self.settings.poll_timeout
        };

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => self.listener_ready = true,
                Token(conn_id) => {
                    if let Some(conn) = self.pool.get_mut(conn_id) {
                        conn.readable = true;
                    }
                }
            }
        }

        // The backlog may still hold connections no new event will report.
        if self
            .accept_retry_at
            .is_some_and(|at| Instant::now() >= at)
        {
            self.accept_retry_at = None;
            self.listener_ready = true;
        }
        Ok(())
    }

    fn accept_phase(&mut self) {
        if !self.listener_ready {
            return;
        }

        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.listener_ready = false;
                return;
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return,
            Err(e) => {
                self.accept_failed(&e);
                return;
            }
        };

        if self.pool.len() >= self.settings.max_connections {
            warn!(peer = %peer, "Connection limit reached, rejecting");
            return;
        }

        let conn_id = self.pool.add_pending(stream, peer);
        let Some(conn) = self.pool.get_mut(conn_id) else {
            return;
        };

        if let Err(e) =
            self.poll
                .registry()
                .register(&mut conn.stream, Token(conn_id), Interest::READABLE)
        {
            warn!(conn_id, peer = %peer, error = %e, "Failed to register connection");
            self.pool.remove(conn_id);
            return;
        }

        // The peer may have written its login before registration.
        conn.readable = true;
        info!(conn_id, peer = %peer, "A client has connected");
    }

    /// Stop accepting until the next listener event or one poll timeout,
    /// whichever comes first.
    fn accept_failed(&mut self, e: &io::Error) {
        error!(error = %e, "Accept error");
        self.listener_ready = false;
        self.accept_retry_at = Some(Instant::now() + self.settings.poll_timeout);
    }

    fn pending_phase(&mut self) {
        let now = Instant::now();
        let Self {
            pool,
            gate,
            read_buf,
            settings,
            ..
        } = self;
        let gate = &*gate;
        let settings = &*settings;

        let closed = pool.for_each_pending(|conn_id, conn| {
            if let Some(limit) = settings.login_timeout {
                if conn.login_expired(now, limit) {
                    info!(conn_id, peer = %conn.peer, "Login timed out");
                    send_reply(conn_id, conn, &protocol::response_error("login timed out"));
                    return PendingVisit::Close;
                }
            }

            if !conn.readable {
                return PendingVisit::Keep;
            }

            match read_chunk(conn_id, conn, &mut read_buf[..]) {
                ReadOutcome::Closed => PendingVisit::Close,
                ReadOutcome::Data | ReadOutcome::Idle => {
                    process_login(conn_id, conn, gate, settings)
                }
            }
        });

        self.release(closed);
    }

    fn active_phase(&mut self) {
        let Self {
            pool,
            registry,
            read_buf,
            settings,
            ..
        } = self;
        let registry = &*registry;
        let settings = &*settings;

        let closed = pool.for_each_active(|conn_id, conn| {
            if !conn.readable {
                return ActiveVisit::Keep;
            }

            match read_chunk(conn_id, conn, &mut read_buf[..]) {
                ReadOutcome::Closed => ActiveVisit::Close,
                ReadOutcome::Data | ReadOutcome::Idle => {
                    process_commands(conn_id, conn, registry, settings)
                }
            }
        });

        self.release(closed);
    }

    /// Deregister and drop closed connections, releasing their sockets.
    fn release(&mut self, closed: Vec<Connection<TcpStream>>) {
        for mut conn in closed {
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                debug!(peer = %conn.peer, error = %e, "Deregister failed");
            }
            match conn.identity() {
                Some(identity) => {
                    info!(peer = %conn.peer, email = %identity.email, "Connection closed")
                }
                None => info!(peer = %conn.peer, "Connection closed before login"),
            }
        }
    }
}

/// Read at most one buffer's worth of bytes into the connection.
fn read_chunk<S: Read>(conn_id: ConnId, conn: &mut Connection<S>, buf: &mut [u8]) -> ReadOutcome {
    match conn.stream.read(buf) {
        Ok(0) => {
            debug!(conn_id, peer = %conn.peer, "Peer closed connection");
            ReadOutcome::Closed
        }
        Ok(n) => {
            trace!(conn_id, bytes = n, "Read chunk");
            conn.push_chunk(&buf[..n]);
            ReadOutcome::Data
        }
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            conn.readable = false;
            ReadOutcome::Idle
        }
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => ReadOutcome::Idle,
        Err(e) => {
            debug!(conn_id, peer = %conn.peer, error = %e, "Read error");
            ReadOutcome::Closed
        }
    }
}

/// Try every complete login frame buffered on a pending connection.
fn process_login<S, G>(
    conn_id: ConnId,
    conn: &mut Connection<S>,
    gate: &G,
    settings: &LoopSettings,
) -> PendingVisit
where
    S: Write,
    G: CredentialGate + ?Sized,
{
    loop {
        let failure = match protocol::decode_login(conn.inbound()) {
            Decoded::Incomplete if conn.inbound().len() <= settings.max_frame_size => {
                return PendingVisit::Keep;
            }
            Decoded::Incomplete => {
                let e = DecodeError::TooLarge(settings.max_frame_size);
                warn!(conn_id, peer = %conn.peer, error = %e, "Login parsing failed");
                conn.discard_all();
                e.to_string()
            }
            Decoded::Invalid(e) => {
                warn!(conn_id, peer = %conn.peer, error = %e, "Login parsing failed");
                conn.discard_invalid();
                e.to_string()
            }
            Decoded::Complete(login, consumed) => {
                conn.consume(consumed);
                match gate.verify(&login.email, &login.password) {
                    Some(identity) => {
                        info!(
                            conn_id,
                            peer = %conn.peer,
                            user = %identity.id,
                            email = %identity.email,
                            "User has logged in"
                        );
                        send_reply(conn_id, conn, protocol::response_ok());
                        return PendingVisit::Promote(identity);
                    }
                    None => {
                        warn!(conn_id, peer = %conn.peer, email = %login.email, "Login failed");
                        "login failed".to_string()
                    }
                }
            }
        };

        let attempts = conn.record_failed_login();
        send_reply(conn_id, conn, &protocol::response_error(&failure));

        if let Some(max) = settings.max_login_attempts {
            if attempts >= max {
                warn!(conn_id, peer = %conn.peer, attempts, "Too many failed logins");
                return PendingVisit::Close;
            }
        }
    }
}

/// Dispatch every complete command frame buffered on an active connection.
fn process_commands<S: Write>(
    conn_id: ConnId,
    conn: &mut Connection<S>,
    registry: &CommandRegistry,
    settings: &LoopSettings,
) -> ActiveVisit {
    let Some(identity) = conn.identity().cloned() else {
        error!(conn_id, peer = %conn.peer, "Active connection without identity");
        return ActiveVisit::Close;
    };

    loop {
        match protocol::decode_command(conn.inbound()) {
            Decoded::Incomplete if conn.inbound().len() <= settings.max_frame_size => {
                return ActiveVisit::Keep;
            }
            Decoded::Incomplete => {
                let e = DecodeError::TooLarge(settings.max_frame_size);
                warn!(conn_id, peer = %conn.peer, error = %e, "Could not parse command");
                conn.discard_all();
                send_reply(conn_id, conn, &protocol::response_error(&e.to_string()));
                return ActiveVisit::Keep;
            }
            Decoded::Invalid(e) => {
                // Name the action when the code itself is what's wrong.
                let code = conn.inbound().iter().copied().find(|b| !b.is_ascii_whitespace());
                let reason = match code {
                    Some(code) if !registry.contains(code) => {
                        let action = char::from(code);
                        warn!(conn_id, email = %identity.email, %action, error = %e, "Unknown action");
                        "unknown action".to_string()
                    }
                    _ => {
                        warn!(conn_id, peer = %conn.peer, error = %e, "Could not parse command");
                        e.to_string()
                    }
                };
                let retry = conn.discard_invalid();
                send_reply(conn_id, conn, &protocol::response_error(&reason));
                if !retry {
                    return ActiveVisit::Keep;
                }
            }
            Decoded::Complete(envelope, consumed) => {
                conn.consume(consumed);
                let action = char::from(envelope.action);

                match registry.dispatch(envelope.action, &identity, &envelope.payload) {
                    Dispatch::Executed => {
                        debug!(conn_id, email = %identity.email, %action, "Command executed");
                    }
                    Dispatch::Failed(e) => {
                        warn!(conn_id, email = %identity.email, %action, error = %e, "Could not execute command");
                        send_reply(conn_id, conn, &protocol::response_error(&e.to_string()));
                    }
                    Dispatch::Unknown => {
                        warn!(conn_id, email = %identity.email, %action, "Unknown action");
                        send_reply(conn_id, conn, &protocol::response_error("unknown action"));
                    }
                }
            }
        }
    }
}

/// Best-effort status reply. Never blocks; a reply that doesn't fit in the
/// socket buffer is dropped.
fn send_reply<S: Write>(conn_id: ConnId, conn: &mut Connection<S>, reply: &[u8]) {
    match conn.stream.write(reply) {
        Ok(n) if n == reply.len() => {}
        Ok(n) => debug!(conn_id, written = n, total = reply.len(), "Reply truncated"),
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
            debug!(conn_id, "Reply dropped, peer not writable");
        }
        Err(e) => debug!(conn_id, error = %e, "Reply failed"),
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}
