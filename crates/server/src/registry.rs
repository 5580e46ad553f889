use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::connection::Connection;

/// Generate a session id: 32 lower-case hex characters from 16
/// cryptographically random bytes.
pub fn new_session_id() -> String {
    use std::fmt::Write;
    use std::io::Read;
    let mut bytes = [0u8; 16];
    let f = std::fs::File::open("/dev/urandom").expect("Failed to open /dev/urandom");
    (&f).read_exact(&mut bytes)
        .expect("Failed to read random bytes");
    let mut hex = String::with_capacity(32);
    for b in &bytes {
        write!(hex, "{b:02x}").unwrap();
    }
    hex
}

#[derive(Debug, thiserror::Error)]
#[error("session id already registered: {0}")]
pub struct SessionIdCollision(pub String);

/// Live session directories: by numeric connection id and by session id.
/// Both maps share one lock so membership stays pairwise consistent.
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

struct Inner {
    by_conn_id: HashMap<u32, Arc<Connection>>,
    by_session_id: HashMap<String, Arc<Connection>>,
    next_conn_id: u32,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_conn_id: HashMap::new(),
                by_session_id: HashMap::new(),
                next_conn_id: 1,
            }),
        }
    }

    /// Hand out the next connection id. The counter wraps at u32::MAX and
    /// skips 0 and any id still live.
    pub fn allocate_id(&self) -> u32 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        loop {
            let id = inner.next_conn_id;
            inner.next_conn_id = inner.next_conn_id.wrapping_add(1);
            if id != 0 && !inner.by_conn_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Insert into both directories. A session-id collision leaves the
    /// registry untouched; the caller must close and discard the
    /// connection.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), SessionIdCollision> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.by_session_id.contains_key(conn.session_id())
            || inner.by_conn_id.contains_key(&conn.id())
        {
            return Err(SessionIdCollision(conn.session_id().to_string()));
        }
        inner.by_conn_id.insert(conn.id(), Arc::clone(&conn));
        inner
            .by_session_id
            .insert(conn.session_id().to_string(), conn);
        Ok(())
    }

    pub fn lookup_by_session(&self, session_id: &str) -> Option<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_session_id.get(session_id).cloned()
    }

    /// Point-in-time view ordered by ascending connection id, so listings
    /// are deterministic.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut conns: Vec<_> = inner.by_conn_id.values().cloned().collect();
        conns.sort_by_key(|c| c.id());
        conns
    }

    /// Live consumer connections, in listing order.
    pub fn consumers(&self) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.is_consumer())
            .collect()
    }

    /// Remove from both directories. Idempotent.
    pub fn unregister(&self, conn: &Connection) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.by_conn_id.remove(&conn.id());
        inner.by_session_id.remove(conn.session_id());
        debug!(session_id = %conn.session_id(), "Session unregistered");
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_conn_id.len()
    }

    #[cfg(test)]
    fn maps_consistent(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if inner.by_conn_id.len() != inner.by_session_id.len() {
            return false;
        }
        inner.by_conn_id.values().all(|c| {
            inner
                .by_session_id
                .get(c.session_id())
                .is_some_and(|other| other.id() == c.id())
        })
    }

    #[cfg(test)]
    fn set_next_conn_id(&self, next: u32) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .next_conn_id = next;
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
