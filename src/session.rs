//! Session cache binding validated claims to a backend client.
//!
//! Sessions expire after `session_timeout` of inactivity. Expiry is checked
//! lazily on every read and by a periodic sweep; both use
//! [`UserSession::is_expired`]. At capacity the session with the oldest
//! activity is evicted before a new one is inserted.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::auth::Claims;
use crate::config::SessionConfig;
use crate::service_accounts::BackendClient;

/// One authenticated session.
#[derive(Clone)]
pub struct UserSession {
    /// Opaque session id
    pub id: String,
    /// Claims of the token that opened the session
    pub claims: Arc<Claims>,
    /// Backend client bound to this session
    pub client: Arc<dyn BackendClient>,
    /// Service account the client acts as
    pub service_account_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    last_activity: Instant,
}

impl UserSession {
    /// Token subject.
    #[must_use]
    pub fn subject(&self) -> &str {
        &self.claims.sub
    }

    /// Returns `true` if the session was opened by `subject` at `issuer`.
    #[must_use]
    pub fn belongs_to(&self, issuer: &str, subject: &str) -> bool {
        self.claims.iss == issuer && self.claims.sub == subject
    }

    /// Time since the last access.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns `true` once `timeout` has passed since the last access.
    #[must_use]
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }
}

impl fmt::Debug for UserSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserSession")
            .field("id", &self.id)
            .field("subject", &self.claims.sub)
            .field("service_account_id", &self.service_account_id)
            .field("created_at", &self.created_at)
            .field("idle_for", &self.idle_for())
            .finish_non_exhaustive()
    }
}

/// Session counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// Sessions currently held
    pub active: usize,
    /// Capacity
    pub max_sessions: usize,
    /// Sessions created since start
    pub created: u64,
    /// Sessions evicted at capacity
    pub evictions: u64,
    /// Sessions removed for inactivity
    pub expirations: u64,
}

/// Owns every session.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, UserSession>>,
    timeout: Duration,
    max_sessions: usize,
    cleanup_interval: Duration,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    created: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl SessionManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout: config.session_timeout,
            max_sessions: config.max_sessions.max(1),
            cleanup_interval: config.cleanup_interval,
            cleanup: Mutex::new(None),
            created: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Generate a random opaque session id.
    ///
    /// Format: `sess_<43-char URL-safe base64>` (256 bits of entropy).
    #[must_use]
    pub fn generate_id() -> String {
        let random_bytes: [u8; 32] = rand::random();
        format!(
            "sess_{}",
            base64::Engine::encode(
                &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                random_bytes,
            )
        )
    }

    /// Open a session and return its id.
    pub fn create_session(
        &self,
        claims: Arc<Claims>,
        client: Arc<dyn BackendClient>,
        service_account_id: Option<String>,
    ) -> String {
        let id = Self::generate_id();
        let session = UserSession {
            id: id.clone(),
            claims,
            client,
            service_account_id,
            created_at: Utc::now(),
            last_activity: Instant::now(),
        };

        let mut sessions = self.sessions.lock();
        if sessions.len() >= self.max_sessions {
            let oldest = sessions
                .values()
                .min_by_key(|s| s.last_activity)
                .map(|s| s.id.clone());
            if let Some(oldest) = oldest {
                sessions.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(session = %oldest, "Evicted least recently active session");
            }
        }
        debug!(session = %id, sub = %session.claims.sub, "Session created");
        sessions.insert(id.clone(), session);
        self.created.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Look up a session and mark it active.
    ///
    /// An expired session is removed and reported as missing.
    pub fn get_session(&self, id: &str) -> Option<UserSession> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(id)?;

        if session.is_expired(self.timeout) {
            sessions.remove(id);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            debug!(session = %id, "Lazy-evicted expired session");
            return None;
        }

        session.last_activity = Instant::now();
        Some(session.clone())
    }

    /// Remove one session. Returns `true` if it existed.
    pub fn remove_session(&self, id: &str) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    /// Remove every session of the user `(issuer, subject)`. Returns how
    /// many were removed.
    ///
    /// Subjects are only unique per issuer, so both must match.
    pub fn remove_user_sessions(&self, issuer: &str, subject: &str) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.belongs_to(issuer, subject));
        let removed = before - sessions.len();
        if removed > 0 {
            debug!(iss = %issuer, sub = %subject, removed, "Removed user sessions");
        }
        removed
    }

    /// Live sessions of the user `(issuer, subject)`.
    #[must_use]
    pub fn get_user_sessions(&self, issuer: &str, subject: &str) -> Vec<UserSession> {
        self.sessions
            .lock()
            .values()
            .filter(|s| s.belongs_to(issuer, subject) && !s.is_expired(self.timeout))
            .cloned()
            .collect()
    }

    /// Remove every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_expired(self.timeout));
        let removed = before - sessions.len();
        if removed > 0 {
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(removed, "Swept expired sessions");
        }
        removed
    }

    /// Number of sessions held, expired ones included until swept.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Returns `true` if no sessions are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            active: self.len(),
            max_sessions: self.max_sessions,
            created: self.created.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Start the periodic sweep. No-op when already running or outside a
    /// tokio runtime.
    pub fn start_cleanup(self: &Arc<Self>) {
        let mut guard = self.cleanup.lock();
        if guard.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime; session sweep not started");
            return;
        };

        let manager: Weak<Self> = Arc::downgrade(self);
        let period = self.cleanup_interval;
        *guard = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.sweep_expired();
            }
        }));
        info!(interval_secs = period.as_secs(), "Started session sweep");
    }

    /// Stop the periodic sweep.
    pub fn stop_cleanup(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
            info!("Stopped session sweep");
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.get_mut().take() {
            handle.abort();
        }
    }
}
