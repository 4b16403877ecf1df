//! # Connection Pool
//!
//! Outbound connections keyed by remote address and shared by reference count,
//! so a burst of calls to one peer pays for a single handshake.
//!
//! ## Invariants
//! - At most one live entry per address. Concurrent [`ConnectionPool::get_or_create`]
//!   calls for an address that is not yet connected dial at most once, and every
//!   waiter sees the same connection or the same error.
//! - A freshly dialed entry starts at two references: the pool's own and the
//!   caller's borrow. Callers hand their borrow back with `release` (or by
//!   dropping a [`Lease`]).
//! - A connection is closed exactly once: when its count reaches zero, on
//!   `destroy`, or on `close_all`. `close` is always called outside the lock.
//! - One mutex guards the whole table. It is never held across a dial.

use std::collections::HashMap;
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::Span;

/// A pooled handle. The pool decides when it is closed.
pub trait Connection: Send + Sync + 'static {
    /// Closes the handle. Subsequent calls through it must fail.
    fn close(&self);
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

type DialSlot<C> = Arc<OnceCell<Result<Arc<C>>>>;

struct Entry<C> {
    conn: Arc<C>,
    refs: usize,
}

struct Table<C> {
    live: HashMap<String, Entry<C>>,
    /// Entries replaced by `register` while callers still borrowed them.
    retired: Vec<(String, Entry<C>)>,
    dialing: HashMap<String, DialSlot<C>>,
}

impl<C> Table<C> {
    /// Drops one reference to `conn`, returning it if that was the last one.
    fn release(&mut self, address: &str, conn: &Arc<C>) -> Option<Arc<C>> {
        if let Some(entry) = self.live.get_mut(address) {
            if Arc::ptr_eq(&entry.conn, conn) {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs == 0 {
                    return self.live.remove(address).map(|e| e.conn);
                }
                return None;
            }
        }

        let idx = self
            .retired
            .iter()
            .position(|(a, e)| a == address && Arc::ptr_eq(&e.conn, conn))?;
        let entry = &mut self.retired[idx].1;
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            return Some(self.retired.swap_remove(idx).1.conn);
        }
        None
    }

    fn remove(&mut self, address: &str, conn: &Arc<C>) -> Option<Arc<C>> {
        if self
            .live
            .get(address)
            .is_some_and(|e| Arc::ptr_eq(&e.conn, conn))
        {
            return self.live.remove(address).map(|e| e.conn);
        }
        let idx = self
            .retired
            .iter()
            .position(|(a, e)| a == address && Arc::ptr_eq(&e.conn, conn))?;
        Some(self.retired.swap_remove(idx).1.conn)
    }
}

/// Reference-counted outbound connections keyed by address.
pub struct ConnectionPool<C: Connection> {
    table: Mutex<Table<C>>,
    span: Span,
}

impl<C: Connection> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> ConnectionPool<C> {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                live: HashMap::new(),
                retired: Vec::new(),
                dialing: HashMap::new(),
            }),
            span: tracing::info_span!("connection_pool"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Returns the shared connection for `address`, dialing it if needed.
    ///
    /// The returned handle carries one reference that the caller must give back
    /// with [`release`](Self::release) or [`destroy`](Self::destroy).
    pub async fn get_or_create<F, Fut>(&self, address: &str, dial: F) -> Result<Arc<C>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        loop {
            let slot = {
                let mut table = self.table.lock();
                if let Some(entry) = table.live.get_mut(address) {
                    entry.refs += 1;
                    return Ok(entry.conn.clone());
                }
                table
                    .dialing
                    .entry(address.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            let outcome = slot
                .get_or_init(|| async {
                    tracing::debug!(parent: &self.span, %address, "dialing");
                    dial().await.map(Arc::new)
                })
                .await
                .clone();

            // Whoever locks first after the dial settles owns the slot and
            // installs the result; everyone else joins it.
            let mut table = self.table.lock();
            let owns_slot = table
                .dialing
                .get(address)
                .is_some_and(|s| Arc::ptr_eq(s, &slot));
            if owns_slot {
                table.dialing.remove(address);
            }

            let conn = match outcome {
                Ok(conn) => conn,
                Err(e) => {
                    drop(table);
                    if owns_slot {
                        tracing::warn!(parent: &self.span, %address, error = %e, "dial failed");
                    }
                    return Err(e);
                }
            };

            if owns_slot {
                if let Some(existing) = table.live.get_mut(address) {
                    // A register() landed while we were dialing; keep it.
                    existing.refs += 1;
                    let kept = existing.conn.clone();
                    drop(table);
                    conn.close();
                    return Ok(kept);
                }
                table.live.insert(
                    address.to_string(),
                    Entry {
                        conn: conn.clone(),
                        refs: 2,
                    },
                );
                drop(table);
                tracing::info!(parent: &self.span, %address, "connection established");
                return Ok(conn);
            }

            if let Some(entry) = table.live.get_mut(address) {
                if Arc::ptr_eq(&entry.conn, &conn) {
                    entry.refs += 1;
                    return Ok(conn);
                }
            }
            // The dialed connection was destroyed or replaced before we could
            // join it; start over.
        }
    }

    /// Borrows a connection behind a guard that releases it on drop.
    pub async fn lease<F, Fut>(&self, address: &str, dial: F) -> Result<Lease<'_, C>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let conn = self.get_or_create(address, dial).await?;
        Ok(Lease {
            pool: self,
            address: address.to_string(),
            conn: Some(conn),
        })
    }

    /// Adds a reference to an existing entry.
    pub fn share(&self, address: &str) -> Option<Arc<C>> {
        let mut table = self.table.lock();
        let entry = table.live.get_mut(address)?;
        entry.refs += 1;
        Some(entry.conn.clone())
    }

    /// Gives back one reference; the connection closes when none remain.
    /// Unknown addresses and stale handles are ignored.
    pub fn release(&self, address: &str, conn: &Arc<C>) {
        let closing = self.table.lock().release(address, conn);
        if let Some(conn) = closing {
            conn.close();
            tracing::debug!(parent: &self.span, %address, "connection closed");
        }
    }

    /// Closes and forgets the connection regardless of outstanding references.
    pub fn destroy(&self, address: &str, conn: &Arc<C>) {
        let removed = self.table.lock().remove(address, conn);
        if let Some(conn) = removed {
            conn.close();
            tracing::info!(parent: &self.span, %address, "connection destroyed");
        }
    }

    /// Installs `conn` as the entry for `address`, holding the pool's reference.
    ///
    /// The previous entry, if any, loses the pool's reference first: it closes
    /// now if nobody borrowed it, or when its last borrower releases it.
    pub fn register(&self, address: &str, conn: C) -> Arc<C> {
        let conn = Arc::new(conn);
        let closing = {
            let mut table = self.table.lock();
            let prior = table.live.insert(
                address.to_string(),
                Entry {
                    conn: conn.clone(),
                    refs: 1,
                },
            );
            match prior {
                Some(mut prior) => {
                    prior.refs = prior.refs.saturating_sub(1);
                    if prior.refs == 0 {
                        Some(prior.conn)
                    } else {
                        table.retired.push((address.to_string(), prior));
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(prior) = closing {
            prior.close();
        }
        tracing::debug!(parent: &self.span, %address, "connection registered");
        conn
    }

    /// Closes every connection and empties the pool.
    pub fn close_all(&self) {
        let drained: Vec<Arc<C>> = {
            let mut table = self.table.lock();
            table.dialing.clear();
            let live = std::mem::take(&mut table.live);
            let retired = std::mem::take(&mut table.retired);
            live.into_values()
                .chain(retired.into_iter().map(|(_, e)| e))
                .map(|e| e.conn)
                .collect()
        };
        let count = drained.len();
        for conn in drained {
            conn.close();
        }
        tracing::info!(parent: &self.span, count, "pool closed");
    }

    /// Current reference count of the live entry for `address`.
    pub fn ref_count(&self, address: &str) -> Option<usize> {
        self.table.lock().live.get(address).map(|e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.table.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A borrowed pool connection, released when dropped.
pub struct Lease<'a, C: Connection> {
    pool: &'a ConnectionPool<C>,
    address: String,
    conn: Option<Arc<C>>,
}

impl<C: Connection> Lease<'_, C> {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Destroys the connection instead of releasing it, forcing a redial on
    /// the next borrow.
    pub fn destroy(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.destroy(&self.address, &conn);
        }
    }
}

impl<C: Connection> Deref for Lease<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        // Only `destroy` and `drop` empty the slot, and both consume the lease.
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("lease used after release"),
        }
    }
}

impl<C: Connection> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(&self.address, &conn);
        }
    }
}
