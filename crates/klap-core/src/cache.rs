//! Per-address cache of established sessions.
//!
//! Each device address maps to at most one [`ProtocolSession`], shared behind
//! an async mutex so concurrent callers targeting the same device are
//! serialized and can never race on its sequence counter. Entries live for a
//! fixed TTL from the moment they are created.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    Credentials,
    error::Error,
    session::ProtocolSession,
    transport::TransportFactory,
};

/// Default lifetime of a cached session.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// A session shared between callers; lock it for the duration of a request.
pub type SharedSession = Arc<tokio::sync::Mutex<ProtocolSession>>;

/// Bookkeeping about a cached session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Device address.
    pub address: String,
    /// When the entry was created.
    pub created_at: DateTime<Utc>,
    /// When the entry stops being reused.
    pub expires_at: DateTime<Utc>,
}

struct CacheEntry {
    session: SharedSession,
    deadline: Instant,
    info: SessionInfo,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.deadline
    }
}

/// Cache of live sessions keyed by device address.
pub struct SessionCache {
    factory: TransportFactory,
    credentials: Credentials,
    timeout: Duration,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SessionCache {
    /// Creates an empty cache that builds transports with `factory`.
    pub fn new(
        factory: TransportFactory,
        credentials: Credentials,
        timeout: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            factory,
            credentials,
            timeout,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, CacheEntry>>, Error> {
        self.entries
            .lock()
            .map_err(|_| Error::Protocol("session cache lock poisoned".into()))
    }

    /// Returns a ready session for `address`.
    ///
    /// Reuses the cached session while its TTL lasts; otherwise creates one,
    /// caches it, and handshakes. A session whose handshake fails is removed
    /// again so the next call starts clean.
    pub async fn get(&self, address: &str) -> Result<SharedSession, Error> {
        let session = {
            let mut entries = self.lock()?;
            match entries.get(address) {
                Some(entry) if entry.is_live(Instant::now()) => {
                    debug!(address, "Reusing cached session");
                    Arc::clone(&entry.session)
                }
                _ => {
                    let entry = self.new_entry(address);
                    let session = Arc::clone(&entry.session);
                    entries.insert(address.to_string(), entry);
                    session
                }
            }
        };

        let mut guard = session.lock().await;
        if !guard.is_ready() {
            if let Err(e) = guard.handshake().await {
                drop(guard);
                self.remove_entry(address, &session)?;
                return Err(e);
            }
        }
        drop(guard);

        Ok(session)
    }

    fn new_entry(&self, address: &str) -> CacheEntry {
        let transport = (self.factory)(address);
        let session = ProtocolSession::new(transport, self.credentials.clone(), self.timeout);

        let created_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .unwrap_or(created_at);

        debug!(address, ttl_secs = self.ttl.as_secs(), "Caching new session");

        CacheEntry {
            session: Arc::new(tokio::sync::Mutex::new(session)),
            deadline: Instant::now() + self.ttl,
            info: SessionInfo {
                address: address.to_string(),
                created_at,
                expires_at,
            },
        }
    }

    /// Removes the entry for `address` only if it still holds `session`.
    pub(crate) fn remove_entry(&self, address: &str, session: &SharedSession) -> Result<(), Error> {
        let mut entries = self.lock()?;
        if entries
            .get(address)
            .is_some_and(|entry| Arc::ptr_eq(&entry.session, session))
        {
            entries.remove(address);
        }
        Ok(())
    }

    /// Drops the cached session for `address`, forcing a fresh handshake next time.
    ///
    /// Returns `true` if an entry was removed.
    pub fn invalidate(&self, address: &str) -> Result<bool, Error> {
        let removed = self.lock()?.remove(address).is_some();
        if removed {
            debug!(address, "Invalidated cached session");
        }
        Ok(removed)
    }

    /// Bookkeeping for the live entry at `address`, if any.
    pub fn info(&self, address: &str) -> Result<Option<SessionInfo>, Error> {
        let now = Instant::now();
        Ok(self
            .lock()?
            .get(address)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.info.clone()))
    }

    /// Number of cached entries, expired ones included until purged.
    pub fn len(&self) -> Result<usize, Error> {
        Ok(self.lock()?.len())
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.lock()?.is_empty())
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize, Error> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        Ok(before - entries.len())
    }

    /// Configured entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
