//! Idle outbound sockets kept for reuse, keyed by `address:port`.
//!
//! Entries leave the pool when they are taken, when their idle timer fires, or when
//! the pool is full and a newer socket arrives, in which case the oldest entry is
//! closed. Eviction follows insertion order.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::task::noop_waker_ref;
use indexmap::IndexMap;
use log::debug;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::task::JoinHandle;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::stats::{Stats, incr};

pub const POOL_MAX_SIZE: usize = 20;
pub const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

pub trait Poolable: Send + 'static {
    /// Whether the peer has gone away. May consume pending input.
    fn is_closed(&mut self) -> bool;

    fn close(self);
}

/// An idle outbound stream. Dropping it closes the underlying connection.
pub struct OutboundSocket {
    stream: Box<dyn AsyncStream>,
}

impl OutboundSocket {
    pub fn new(stream: Box<dyn AsyncStream>) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> Box<dyn AsyncStream> {
        self.stream
    }
}

impl std::fmt::Debug for OutboundSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("OutboundSocket")
    }
}

impl Poolable for OutboundSocket {
    // An idle stream must have nothing to read. EOF, an error, or unsolicited bytes
    // all make it unusable.
    fn is_closed(&mut self) -> bool {
        let mut probe = [0u8; 1];
        let mut read_buf = ReadBuf::new(&mut probe);
        let mut cx = Context::from_waker(noop_waker_ref());
        match Pin::new(&mut self.stream).poll_read(&mut cx, &mut read_buf) {
            Poll::Pending => false,
            Poll::Ready(_) => true,
        }
    }

    fn close(self) {
        drop(self.stream);
    }
}

struct PoolEntry<S> {
    socket: S,
    id: u64,
    expiry: JoinHandle<()>,
}

struct PoolInner<S> {
    entries: IndexMap<String, PoolEntry<S>>,
    next_id: u64,
}

pub struct ConnectionPool<S: Poolable> {
    inner: Arc<Mutex<PoolInner<S>>>,
    max_size: usize,
    idle_timeout: Duration,
    stats: Arc<Stats>,
}

impl<S: Poolable> ConnectionPool<S> {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self::with_limits(POOL_MAX_SIZE, POOL_IDLE_TIMEOUT, stats)
    }

    pub fn with_limits(max_size: usize, idle_timeout: Duration, stats: Arc<Stats>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                entries: IndexMap::new(),
                next_id: 0,
            })),
            max_size,
            idle_timeout,
            stats,
        }
    }

    /// Takes the pooled socket for `location`, if there is one that is still open.
    pub fn get(&self, location: &NetLocation) -> Option<S> {
        let key = location.to_string();
        let entry = self.inner.lock().entries.shift_remove(&key);

        let Some(PoolEntry {
            mut socket, expiry, ..
        }) = entry
        else {
            incr(&self.stats.pool.misses);
            return None;
        };
        expiry.abort();

        if socket.is_closed() {
            debug!("pool entry for {key} was closed by the peer");
            socket.close();
            incr(&self.stats.pool.misses);
            return None;
        }

        incr(&self.stats.pool.hits);
        debug!("pool hit: {key}");
        Some(socket)
    }

    /// Returns `socket` to the pool. Closed sockets are refused and closed. Must be
    /// called from within a tokio runtime.
    pub fn put(&self, location: &NetLocation, mut socket: S) -> bool {
        if socket.is_closed() {
            socket.close();
            return false;
        }

        let key = location.to_string();
        let mut displaced = Vec::with_capacity(1);
        let size = {
            let mut inner = self.inner.lock();

            if let Some(previous) = inner.entries.shift_remove(&key) {
                previous.expiry.abort();
                displaced.push(previous.socket);
            } else if inner.entries.len() >= self.max_size
                && let Some((oldest_key, oldest)) = inner.entries.shift_remove_index(0)
            {
                oldest.expiry.abort();
                displaced.push(oldest.socket);
                incr(&self.stats.pool.evictions);
                debug!("pool full, evicted {oldest_key}");
            }

            let id = inner.next_id;
            inner.next_id += 1;
            let expiry = self.spawn_expiry(key.clone(), id);
            inner.entries.insert(key.clone(), PoolEntry { socket, id, expiry });
            inner.entries.len()
        };

        for socket in displaced {
            socket.close();
        }
        debug!("returned to pool: {key} (pool size: {size}/{})", self.max_size);
        true
    }

    fn spawn_expiry(&self, key: String, id: u64) -> JoinHandle<()> {
        let inner: Weak<Mutex<PoolInner<S>>> = Arc::downgrade(&self.inner);
        let idle_timeout = self.idle_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let expired = {
                let mut inner = inner.lock();
                match inner.entries.get(&key) {
                    Some(entry) if entry.id == id => inner.entries.shift_remove(&key),
                    _ => None,
                }
            };
            if let Some(entry) = expired {
                entry.socket.close();
                debug!("pool cleanup: {key} (idle timeout)");
            }
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, location: &NetLocation) -> bool {
        self.inner.lock().entries.contains_key(&location.to_string())
    }
}
