//! Connection pool for the server loop.
//!
//! Each connection is either pending (accepted, not logged in) or active
//! (logged in, identity attached). Both sets keep insertion order so the
//! loop services earlier peers first on every pass.
//!
//! ```text
//!  accept   ┌─────────┐  valid credentials  ┌────────┐
//! ────────> │ Pending │───────────────────> │ Active │
//!           └─────────┘                     └────────┘
//!                │ close/error                   │ close/error
//!                ↓                               ↓
//!           ┌────────┐                      ┌────────┐
//!           │ Closed │                      │ Closed │
//!           └────────┘                      └────────┘
//! ```

use crate::directory::Identity;
use bytes::{Buf, BytesMut};
use slab::Slab;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Key of a connection in the pool. Doubles as its mio token.
pub type ConnId = usize;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, waiting for a login frame.
    Pending,
    /// Logged in; frames are dispatched as commands.
    Active,
    /// Removed from the pool. Terminal.
    Closed,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    pub stream: S,
    pub peer: SocketAddr,
    state: ConnState,
    identity: Option<Identity>,
    accepted_at: Instant,
    failed_logins: u32,
    /// Bytes received but not yet decoded into a frame.
    inbound: BytesMut,
    /// Offset in `inbound` where the most recent read begins.
    chunk_start: usize,
    /// Set by a readiness event, cleared once a read would block.
    pub readable: bool,
}

impl<S> Connection<S> {
    fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Pending,
            identity: None,
            accepted_at: Instant::now(),
            failed_logins: 0,
            inbound: BytesMut::new(),
            chunk_start: 0,
            readable: false,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Buffered bytes not yet consumed by a frame.
    pub fn inbound(&self) -> &[u8] {
        &self.inbound
    }

    /// Append one read's worth of bytes.
    pub fn push_chunk(&mut self, bytes: &[u8]) {
        self.chunk_start = self.inbound.len();
        self.inbound.extend_from_slice(bytes);
    }

    /// Drop `n` bytes of a decoded frame from the front of the buffer.
    pub fn consume(&mut self, n: usize) {
        self.inbound.advance(n);
        self.chunk_start = self.chunk_start.saturating_sub(n);
    }

    /// Discard bytes that can never form a frame.
    ///
    /// An unfinished frame left over from earlier reads is dropped on its
    /// own, keeping the most recent read for another decode attempt, and
    /// `true` is returned. Otherwise the whole buffer is cleared.
    pub fn discard_invalid(&mut self) -> bool {
        let stale = self.chunk_start;
        self.chunk_start = 0;
        if stale > 0 && stale < self.inbound.len() {
            self.inbound.advance(stale);
            true
        } else {
            self.inbound.clear();
            false
        }
    }

    /// Discard everything buffered.
    pub fn discard_all(&mut self) {
        self.inbound.clear();
        self.chunk_start = 0;
    }

    /// Record a failed login and return the running total.
    pub fn record_failed_login(&mut self) -> u32 {
        self.failed_logins += 1;
        self.failed_logins
    }

    pub fn failed_logins(&self) -> u32 {
        self.failed_logins
    }

    /// Whether this connection has been waiting to log in longer than `limit`.
    pub fn login_expired(&self, now: Instant, limit: Duration) -> bool {
        self.state == ConnState::Pending && now.duration_since(self.accepted_at) >= limit
    }
}

/// What the pending-phase visitor wants done with the current connection.
#[derive(Debug)]
pub enum PendingVisit {
    /// Leave it pending.
    Keep,
    /// Move it to the active set with this identity.
    Promote(Identity),
    /// Drop it from the pool.
    Close,
}

/// What the active-phase visitor wants done with the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveVisit {
    Keep,
    Close,
}

/// Pool errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("connection {id} is {state:?}, expected Pending")]
    InvalidState { id: ConnId, state: ConnState },
}

/// Pending and active connections, keyed by slab slot.
///
/// The two order vectors are disjoint: a key sits in exactly one of them
/// for as long as its connection is in the slab.
pub struct ConnectionPool<S> {
    connections: Slab<Connection<S>>,
    pending: Vec<ConnId>,
    active: Vec<ConnId>,
}

impl<S> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ConnectionPool<S> {
    pub fn new() -> Self {
        Self {
            connections: Slab::new(),
            pending: Vec::new(),
            active: Vec::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            connections: Slab::with_capacity(capacity),
            pending: Vec::with_capacity(capacity),
            active: Vec::with_capacity(capacity),
        }
    }

    /// Add a freshly accepted connection to the end of the pending set.
    pub fn add_pending(&mut self, stream: S, peer: SocketAddr) -> ConnId {
        let id = self.connections.insert(Connection::new(stream, peer));
        self.pending.push(id);
        id
    }

    /// Move a pending connection to the end of the active set.
    pub fn promote(&mut self, id: ConnId, identity: Identity) -> Result<(), PoolError> {
        let state = self.state(id).unwrap_or(ConnState::Closed);
        let Some(pos) = self.pending.iter().position(|&p| p == id) else {
            return Err(PoolError::InvalidState { id, state });
        };

        self.pending.remove(pos);
        let conn = &mut self.connections[id];
        conn.state = ConnState::Active;
        conn.identity = Some(identity);
        self.active.push(id);
        Ok(())
    }

    /// Remove a connection from whichever set holds it.
    ///
    /// Returns `None` if it is already gone.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection<S>> {
        let mut conn = self.connections.try_remove(id)?;
        match conn.state {
            ConnState::Pending => self.pending.retain(|&p| p != id),
            ConnState::Active => self.active.retain(|&a| a != id),
            ConnState::Closed => {}
        }
        conn.state = ConnState::Closed;
        Some(conn)
    }

    /// Visit every pending connection in insertion order.
    ///
    /// The visitor may promote or close the current connection; the walk
    /// then continues with the next one without skipping it. Promoted
    /// connections are appended to the active set. Closed connections are
    /// handed back for the caller to release.
    pub fn for_each_pending<F>(&mut self, mut visit: F) -> Vec<Connection<S>>
    where
        F: FnMut(ConnId, &mut Connection<S>) -> PendingVisit,
    {
        let Self {
            connections,
            pending,
            active,
        } = self;

        let mut closed = Vec::new();
        let mut i = 0;
        while i < pending.len() {
            let id = pending[i];
            let conn = &mut connections[id];
            match visit(id, conn) {
                PendingVisit::Keep => i += 1,
                PendingVisit::Promote(identity) => {
                    conn.state = ConnState::Active;
                    conn.identity = Some(identity);
                    pending.remove(i);
                    active.push(id);
                }
                PendingVisit::Close => {
                    pending.remove(i);
                    let mut conn = connections.remove(id);
                    conn.state = ConnState::Closed;
                    closed.push(conn);
                }
            }
        }
        closed
    }

    /// Visit every active connection in insertion order.
    ///
    /// Same removal rules as [`for_each_pending`](Self::for_each_pending).
    pub fn for_each_active<F>(&mut self, mut visit: F) -> Vec<Connection<S>>
    where
        F: FnMut(ConnId, &mut Connection<S>) -> ActiveVisit,
    {
        let Self {
            connections,
            active,
            ..
        } = self;

        let mut closed = Vec::new();
        let mut i = 0;
        while i < active.len() {
            let id = active[i];
            match visit(id, &mut connections[id]) {
                ActiveVisit::Keep => i += 1,
                ActiveVisit::Close => {
                    active.remove(i);
                    let mut conn = connections.remove(id);
                    conn.state = ConnState::Closed;
                    closed.push(conn);
                }
            }
        }
        closed
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection<S>> {
        self.connections.get(id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    pub fn state(&self, id: ConnId) -> Option<ConnState> {
        self.connections.get(id).map(|conn| conn.state)
    }

    pub fn identity(&self, id: ConnId) -> Option<&Identity> {
        self.connections.get(id).and_then(|conn| conn.identity.as_ref())
    }

    pub fn is_pending(&self, id: ConnId) -> bool {
        self.state(id) == Some(ConnState::Pending)
    }

    pub fn is_active(&self, id: ConnId) -> bool {
        self.state(id) == Some(ConnState::Active)
    }

    /// Pending connection ids in insertion order.
    pub fn pending_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.pending.iter().copied()
    }

    /// Active connection ids in insertion order.
    pub fn active_ids(&self) -> impl Iterator<Item = ConnId> + '_ {
        self.active.iter().copied()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Whether any connection still has unread readiness.
    pub fn any_readable(&self) -> bool {
        self.connections.iter().any(|(_, conn)| conn.readable)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{Role, UserDirectory};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn identity(email: &str) -> Identity {
        let mut directory = UserDirectory::new();
        directory.provision_admin(email, "pw").unwrap()
    }

    fn assert_disjoint<S>(pool: &ConnectionPool<S>) {
        for id in pool.pending_ids() {
            assert!(pool.active_ids().all(|a| a != id));
            assert!(pool.is_pending(id));
        }
        for id in pool.active_ids() {
            assert!(pool.is_active(id));
        }
        assert_eq!(pool.pending_len() + pool.active_len(), pool.len());
    }

    #[test]
    fn test_add_and_promote() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let b = pool.add_pending((), peer());

        assert_eq!(pool.pending_ids().collect::<Vec<_>>(), vec![a, b]);
        assert!(pool.identity(a).is_none());

        pool.promote(a, identity("a@b.com")).unwrap();
        assert!(pool.is_active(a));
        assert_eq!(pool.identity(a).unwrap().email, "a@b.com");
        assert_eq!(pool.identity(a).unwrap().role, Role::Admin);
        assert_eq!(pool.pending_ids().collect::<Vec<_>>(), vec![b]);
        assert_disjoint(&pool);
    }

    #[test]
    fn test_promote_requires_pending() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        pool.promote(a, identity("a@b.com")).unwrap();

        assert_eq!(
            pool.promote(a, identity("a@b.com")),
            Err(PoolError::InvalidState {
                id: a,
                state: ConnState::Active
            })
        );
        assert_eq!(
            pool.promote(99, identity("a@b.com")),
            Err(PoolError::InvalidState {
                id: 99,
                state: ConnState::Closed
            })
        );
        assert_disjoint(&pool);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let b = pool.add_pending((), peer());
        pool.promote(b, identity("b@b.com")).unwrap();

        let removed = pool.remove(a).unwrap();
        assert_eq!(removed.state(), ConnState::Closed);
        assert!(pool.remove(a).is_none());

        assert!(pool.remove(b).is_some());
        assert!(pool.remove(b).is_none());
        assert!(pool.is_empty());
        assert_disjoint(&pool);
    }

    #[test]
    fn test_promotion_mid_pass_visits_each_once() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let b = pool.add_pending((), peer());
        let c = pool.add_pending((), peer());

        let mut visited = Vec::new();
        let closed = pool.for_each_pending(|id, _| {
            visited.push(id);
            if id == b {
                PendingVisit::Promote(identity("b@b.com"))
            } else {
                PendingVisit::Keep
            }
        });

        assert!(closed.is_empty());
        assert_eq!(visited, vec![a, b, c]);
        assert_eq!(pool.pending_ids().collect::<Vec<_>>(), vec![a, c]);
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![b]);
        assert_disjoint(&pool);
    }

    #[test]
    fn test_consecutive_promotions_and_closes() {
        let mut pool = ConnectionPool::new();
        let ids: Vec<_> = (0..5).map(|_| pool.add_pending((), peer())).collect();

        let mut visited = Vec::new();
        let closed = pool.for_each_pending(|id, _| {
            visited.push(id);
            match id {
                _ if id == ids[0] || id == ids[1] => PendingVisit::Promote(identity("x@y.z")),
                _ if id == ids[3] => PendingVisit::Close,
                _ => PendingVisit::Keep,
            }
        });

        assert_eq!(visited, ids);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].state(), ConnState::Closed);
        assert_eq!(pool.pending_ids().collect::<Vec<_>>(), vec![ids[2], ids[4]]);
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![ids[0], ids[1]]);
        assert_disjoint(&pool);
    }

    #[test]
    fn test_active_pass_close() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let b = pool.add_pending((), peer());
        pool.promote(a, identity("a@b.com")).unwrap();
        pool.promote(b, identity("b@b.com")).unwrap();

        let mut visited = Vec::new();
        let closed = pool.for_each_active(|id, _| {
            visited.push(id);
            if id == a {
                ActiveVisit::Close
            } else {
                ActiveVisit::Keep
            }
        });

        assert_eq!(visited, vec![a, b]);
        assert_eq!(closed.len(), 1);
        assert_eq!(pool.active_ids().collect::<Vec<_>>(), vec![b]);
        assert!(pool.state(a).is_none());
        assert_disjoint(&pool);
    }

    #[test]
    fn test_login_expiry_only_while_pending() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let later = Instant::now() + Duration::from_secs(60);

        assert!(pool.get(a).unwrap().login_expired(later, Duration::from_secs(30)));
        assert!(!pool.get(a).unwrap().login_expired(Instant::now(), Duration::from_secs(30)));

        pool.promote(a, identity("a@b.com")).unwrap();
        assert!(!pool.get(a).unwrap().login_expired(later, Duration::from_secs(30)));
    }

    #[test]
    fn test_failed_login_count() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let conn = pool.get_mut(a).unwrap();
        assert_eq!(conn.record_failed_login(), 1);
        assert_eq!(conn.record_failed_login(), 2);
        assert_eq!(conn.failed_logins(), 2);
    }

    #[test]
    fn test_discard_invalid_keeps_latest_read() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let conn = pool.get_mut(a).unwrap();

        conn.push_chunk(br#"1{"Content":"oops"#);
        conn.push_chunk(br#"1{"Content":"good"}"#);
        assert!(conn.discard_invalid());
        assert_eq!(conn.inbound(), br#"1{"Content":"good"}"#);

        // Nothing older than the latest read is left to blame.
        assert!(!conn.discard_invalid());
        assert!(conn.inbound().is_empty());
    }

    #[test]
    fn test_consume_tracks_chunk_boundary() {
        let mut pool = ConnectionPool::new();
        let a = pool.add_pending((), peer());
        let conn = pool.get_mut(a).unwrap();

        conn.push_chunk(b"abc");
        conn.push_chunk(b"def");
        conn.consume(4);
        assert_eq!(conn.inbound(), b"ef");
        assert!(!conn.discard_invalid());
        assert!(conn.inbound().is_empty());

        conn.push_chunk(b"xy");
        conn.discard_all();
        assert!(conn.inbound().is_empty());
    }
}
