//! Registry of connected sockets.
//!
//! The registry owns admission control: a connection is only handed to the
//! strategy once it has a slot, and the slot count never exceeds
//! `max_clients` (0 means unbounded). Admission checks the limit and inserts
//! under one write lock, so concurrent accepts cannot overshoot.
//!
//! Sockets live in an index-linked list stored in an arena. Freed nodes go to
//! a free list, and swept sockets go back to the socket [`Pool`] when the
//! registry held the last reference.

use std::{
    net::SocketAddr,
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::warn;

use crate::{
    pool::Pool,
    socket::{Connection, Socket},
    util::{read, write},
};

/// Idle sockets kept for reuse.
const DEFAULT_POOL_CAPACITY: usize = 256;

struct Node {
    socket: Option<Arc<Socket>>,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct SocketList {
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl SocketList {
    fn push_back(&mut self, socket: Arc<Socket>) {
        let node = Node { socket: Some(socket), prev: self.tail, next: None };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = node;
                idx
            },
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            },
        };

        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    fn unlink(&mut self, idx: usize) -> Option<Arc<Socket>> {
        let node = self.nodes.get_mut(idx)?;
        let socket = node.socket.take()?;
        let prev = node.prev.take();
        let next = node.next.take();

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        self.free.push(idx);
        self.len -= 1;
        Some(socket)
    }

    fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head, |&idx| self.nodes[idx].next)
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<Socket>> + '_ {
        self.indices().filter_map(|idx| self.nodes[idx].socket.as_ref())
    }
}

/// Bounded set of live client sockets.
pub struct SocketRegistry {
    list: RwLock<SocketList>,
    max_size: usize,
    pool: Pool<Arc<Socket>>,
    next_id: AtomicU64,
}

impl SocketRegistry {
    /// Create a registry admitting at most `max_size` sockets (0 = unbounded).
    pub fn new(max_size: usize) -> Self {
        Self {
            list: RwLock::new(SocketList::default()),
            max_size,
            pool: Pool::new(DEFAULT_POOL_CAPACITY),
            next_id: AtomicU64::new(1),
        }
    }

    /// Admission limit, 0 when unbounded.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Registered sockets, including closed ones not yet swept.
    pub fn len(&self) -> usize {
        read(&self.list).len
    }

    /// True if no socket is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Idle sockets waiting in the pool.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Register a new connection.
    ///
    /// Returns `None` when the registry is full; the connection is dropped,
    /// which closes it.
    pub fn admit(
        &self,
        conn: impl Connection,
        peer: Option<SocketAddr>,
        tls: bool,
    ) -> Option<Arc<Socket>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut socket = self.pool.acquire().unwrap_or_default();
        match Arc::get_mut(&mut socket) {
            Some(inner) => inner.attach(id, Box::new(conn), peer, tls),
            None => {
                let mut fresh = Socket::default();
                fresh.attach(id, Box::new(conn), peer, tls);
                socket = Arc::new(fresh);
            },
        }

        let mut list = write(&self.list);
        if self.max_size > 0 && list.len >= self.max_size {
            drop(list);
            warn!(
                remote = %socket.remote_address(),
                max_clients = self.max_size,
                "Rejecting TCP connection: server is full"
            );
            self.pool.recycle_shared(socket);
            return None;
        }
        list.push_back(Arc::clone(&socket));
        Some(socket)
    }

    /// Remove closed sockets, recycling them where possible.
    ///
    /// Returns the number of sockets removed.
    pub fn sweep(&self) -> usize {
        let mut list = write(&self.list);
        let closed: Vec<usize> = list
            .indices()
            .filter(|&idx| list.nodes[idx].socket.as_ref().is_some_and(|s| s.is_closed()))
            .collect();

        let mut removed = 0;
        for idx in closed {
            if let Some(socket) = list.unlink(idx) {
                self.pool.recycle_shared(socket);
                removed += 1;
            }
        }
        removed
    }

    /// Live (not closed) sockets at the time of the call.
    pub fn snapshot(&self) -> Vec<Arc<Socket>> {
        read(&self.list).iter().filter(|socket| !socket.is_closed()).cloned().collect()
    }

    /// Visit every registered socket under the read lock.
    pub fn for_each(&self, mut f: impl FnMut(&Socket)) {
        for socket in read(&self.list).iter() {
            f(socket);
        }
    }

    /// Remove every socket, open or not. Returns how many were removed.
    pub fn drain(&self) -> usize {
        let mut list = write(&self.list);
        let removed = list.len;
        let sockets: Vec<Arc<Socket>> = list.iter().cloned().collect();
        *list = SocketList::default();
        drop(list);

        for socket in sockets {
            self.pool.recycle_shared(socket);
        }
        removed
    }
}

impl std::fmt::Debug for SocketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketRegistry")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, DuplexStream};

    use super::*;

    fn connection() -> (DuplexStream, DuplexStream) {
        tokio::io::duplex(64)
    }

    fn peer(port: u16) -> Option<SocketAddr> {
        Some(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn admits_up_to_limit() {
        let registry = SocketRegistry::new(2);
        let (a, _a) = connection();
        let (b, _b) = connection();
        let (c, _c) = connection();

        assert!(registry.admit(a, peer(1), false).is_some());
        assert!(registry.admit(b, peer(2), false).is_some());
        assert!(registry.admit(c, peer(3), false).is_none());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn rejected_connection_is_closed() {
        let registry = SocketRegistry::new(1);
        let (a, _a) = connection();
        let (b, mut client) = connection();

        registry.admit(a, peer(1), false).unwrap();
        assert!(registry.admit(b, peer(2), false).is_none());

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn zero_limit_is_unbounded() {
        let registry = SocketRegistry::new(0);
        let mut peers = Vec::new();
        for port in 0..100 {
            let (conn, client) = connection();
            peers.push(client);
            assert!(registry.admit(conn, peer(port), false).is_some());
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let registry = SocketRegistry::new(0);
        let (a, _a) = connection();
        let (b, _b) = connection();

        let first = registry.admit(a, peer(1), false).unwrap();
        let second = registry.admit(b, peer(2), false).unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
    }

    #[tokio::test]
    async fn sweep_removes_closed_and_recycles() {
        let registry = SocketRegistry::new(0);
        let (a, _a) = connection();
        let (b, _b) = connection();
        let (c, _c) = connection();

        let first = registry.admit(a, peer(1), false).unwrap();
        let second = registry.admit(b, peer(2), false).unwrap();
        let third = registry.admit(c, peer(3), false).unwrap();

        second.close().await;
        drop(second);
        assert_eq!(registry.snapshot().len(), 2);

        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.pooled(), 1);

        let ids: Vec<u64> = registry.snapshot().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![first.id(), third.id()]);

        // The recycled socket comes back fully reset.
        let (d, _d) = connection();
        let reused = registry.admit(d, peer(4), false).unwrap();
        assert_eq!(registry.pooled(), 0);
        assert!(!reused.is_closed());
        assert_eq!(reused.id(), 4);
        assert_eq!(reused.remote_address(), "127.0.0.1");
        assert_eq!(reused.read_counter().total(), 0);
    }

    #[tokio::test]
    async fn swept_socket_still_held_elsewhere_is_not_pooled() {
        let registry = SocketRegistry::new(0);
        let (a, _a) = connection();
        let socket = registry.admit(a, peer(1), false).unwrap();
        socket.close().await;

        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.pooled(), 0);
        assert!(socket.is_closed());
    }

    #[test]
    fn drain_empties_the_registry() {
        let registry = SocketRegistry::new(0);
        let mut peers = Vec::new();
        for port in 0..5 {
            let (conn, client) = connection();
            peers.push(client);
            registry.admit(conn, peer(port), false);
        }

        assert_eq!(registry.drain(), 5);
        assert!(registry.is_empty());
        assert_eq!(registry.pooled(), 5);
    }

    #[test]
    fn freed_nodes_are_reused() {
        let mut list = SocketList::default();
        for _ in 0..3 {
            list.push_back(Arc::new(Socket::default()));
        }

        assert!(list.unlink(1).is_some());
        assert!(list.unlink(1).is_none());
        list.push_back(Arc::new(Socket::default()));

        assert_eq!(list.nodes.len(), 3);
        assert_eq!(list.len, 3);
        assert_eq!(list.indices().collect::<Vec<_>>(), vec![0, 2, 1]);
    }
}
