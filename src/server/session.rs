//! Server-side session tracking.
//!
//! A session is the logical byte stream named by a client-chosen opaque id,
//! realized here as exactly one back-end TCP connection. The table is the
//! unique owner of every back-end; request handlers take a short-lived
//! borrow for the duration of one transaction and never keep a reference
//! back into the table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::Result;

/// One live session.
pub struct Session {
    /// The back-end stream. Locked across a whole transaction so uplink and
    /// drain from concurrent requests for the same id cannot interleave.
    backend: tokio::sync::Mutex<TcpStream>,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn new(backend: TcpStream) -> Self {
        Self {
            backend: tokio::sync::Mutex::new(backend),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// Mark the session as just used.
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    /// True once the session has been idle for longer than `staleness`.
    pub fn expired(&self, staleness: Duration) -> bool {
        self.last_seen.lock().elapsed() > staleness
    }

    /// Exclusive use of the back-end for one transaction.
    pub async fn backend(&self) -> tokio::sync::MutexGuard<'_, TcpStream> {
        self.backend.lock().await
    }
}

/// Maps session ids to their back-end connections.
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    backend_addr: SocketAddr,
    staleness: Duration,
}

impl SessionTable {
    /// An empty table whose sessions dial `backend_addr` and expire after
    /// `staleness` of idleness.
    pub fn new(backend_addr: SocketAddr, staleness: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            backend_addr,
            staleness,
        }
    }

    /// Look up a session, dialing a fresh back-end for an unknown id.
    ///
    /// The table lock is never held across the dial. If a concurrent
    /// request installs the same id first, that session wins and the extra
    /// connection is dropped; an id collision therefore degrades to session
    /// reuse.
    pub async fn get_or_dial(&self, session_id: &str, peer: SocketAddr) -> Result<Arc<Session>> {
        if let Some(session) = self.sessions.lock().get(session_id) {
            session.touch();
            return Ok(Arc::clone(session));
        }

        debug!("unknown session id; dialing back-end for {peer}");
        let backend = TcpStream::connect(self.backend_addr).await?;
        backend.set_nodelay(true)?;

        let session = {
            let mut sessions = self.sessions.lock();
            Arc::clone(
                sessions
                    .entry(session_id.to_owned())
                    .or_insert_with(|| Arc::new(Session::new(backend))),
            )
        };
        session.touch();
        Ok(session)
    }

    /// Drop a session from the table. The back-end closes as soon as the
    /// last in-flight borrow ends.
    pub fn close(&self, session_id: &str) {
        if self.sessions.lock().remove(session_id).is_some() {
            trace!("closed session");
        }
    }

    /// Whether the table currently knows `session_id`.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// True when no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// One expiration pass: evict every session idle beyond the staleness
    /// bound.
    pub fn sweep(&self) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, session| !session.expired(self.staleness));
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!("expired {evicted} idle sessions");
        }
    }

    /// Sweep forever, twice per staleness window.
    pub async fn expire_sessions(&self) {
        loop {
            tokio::time::sleep(self.staleness / 2).await;
            self.sweep();
        }
    }
}
