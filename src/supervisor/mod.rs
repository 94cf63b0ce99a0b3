//! Supervisor - process-wide session registry
//!
//! Maps each user to at most one live session, coordinates restore from
//! disk, evicts idle sessions, and drives startup and shutdown. Restoration
//! is single-flight per user: a per-key lock prevents two concurrent calls
//! from opening two stores for the same user.
//!
//! ## Thread safety
//!
//! The registry is a DashMap for lock-free concurrent reads - every HTTP
//! request resolves its session through it. Mutations take the shard lock
//! plus the per-key restore lock.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::events::EventBus;
use crate::session::reconnect::{connect_with_retry, ReconnectObserver};
use crate::session::{Session, SessionConfig, SessionState};
use crate::store::StoreManager;
use crate::transport::{Transport, TransportFactory};
use crate::types::{PosternError, Result};

/// A registered session plus its event pump task
struct Entry {
    session: Arc<Session>,
    pump: JoinHandle<()>,
}

/// Process-wide registry and lifecycle coordinator for sessions
pub struct Supervisor {
    sessions: DashMap<String, Entry>,
    restore_locks: DashMap<String, Arc<Mutex<()>>>,
    stores: StoreManager,
    factory: Arc<dyn TransportFactory>,
    bus: Arc<EventBus>,
    session_config: Arc<SessionConfig>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new(
        stores: StoreManager,
        factory: Arc<dyn TransportFactory>,
        bus: Arc<EventBus>,
        session_config: SessionConfig,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            sessions: DashMap::new(),
            restore_locks: DashMap::new(),
            stores,
            factory,
            bus,
            session_config: Arc::new(session_config),
            shutting_down: AtomicBool::new(false),
        });

        // The engine looks sessions up by user; it never owns them
        supervisor
            .bus
            .subscribe(Arc::new(ReconnectObserver::new(&supervisor)));

        supervisor
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Map a raw user identifier onto its filesystem-safe form used as the
    /// registry and store key. Fails on empty input.
    pub fn sanitize_user(user: &str) -> Result<String> {
        if user.trim().is_empty() {
            return Err(PosternError::MissingUser);
        }
        Ok(user
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@' | '+') {
                    c
                } else {
                    '_'
                }
            })
            .collect())
    }

    /// Look up a live session without touching disk
    pub fn get(&self, user: &str) -> Option<Arc<Session>> {
        let key = Self::sanitize_user(user).ok()?;
        self.sessions.get(&key).map(|e| Arc::clone(&e.session))
    }

    /// Create a new session in `Fresh`. Does not connect.
    pub async fn add_session(&self, user: &str) -> Result<Arc<Session>> {
        self.check_accepting()?;
        let key = Self::sanitize_user(user)?;

        if self.sessions.contains_key(&key) {
            return Err(PosternError::AlreadyExists(key));
        }

        let lock = self.restore_lock(&key);
        let _guard = lock.lock().await;
        if self.sessions.contains_key(&key) {
            return Err(PosternError::AlreadyExists(key));
        }

        let session = self.create_session(&key).await?;
        info!("Added session for {}", key);
        Ok(session)
    }

    /// Return the live session for a user, restoring it from disk if
    /// necessary. Creates a fresh unlinked store when none exists.
    pub async fn find_or_restore(&self, user: &str) -> Result<Arc<Session>> {
        let key = Self::sanitize_user(user)?;

        if let Some(entry) = self.sessions.get(&key) {
            return Ok(Arc::clone(&entry.session));
        }

        let lock = self.restore_lock(&key);
        let _guard = lock.lock().await;

        // Another caller may have finished restoring while we waited
        if let Some(entry) = self.sessions.get(&key) {
            return Ok(Arc::clone(&entry.session));
        }

        self.check_accepting()?;
        info!("Session {} not in registry, restoring from store", key);
        let session = self.create_session(&key).await?;

        // A linked device reconnects immediately; a failed attempt leaves
        // the session disconnected so a later explicit connect works.
        if session.is_linked() {
            info!("Device for {} is linked, attempting to connect", key);
            if let Err(e) =
                connect_with_retry(&session, self.session_config.connect_max_retries).await
            {
                warn!("Failed to connect restored session {}: {}", key, e);
                session.settle_disconnected().await;
            }
        } else {
            info!("Device for {} not yet linked, QR code needed", key);
        }

        Ok(session)
    }

    /// Like [`find_or_restore`](Self::find_or_restore) but never fabricates
    /// state for unknown users: `None` unless the user is live in the
    /// registry or has a store file on disk.
    pub async fn find_existing(&self, user: &str) -> Result<Option<Arc<Session>>> {
        let key = Self::sanitize_user(user)?;
        if self.sessions.contains_key(&key) {
            return self.find_or_restore(&key).await.map(Some);
        }
        if self.stores.store_path(&key).exists() {
            return self.find_or_restore(&key).await.map(Some);
        }
        Ok(None)
    }

    /// Destroy a session and drop it from the registry. The on-disk store
    /// file is kept; use [`logout`](Self::logout) to delete it.
    pub async fn remove_session(&self, user: &str) -> Result<()> {
        let key = Self::sanitize_user(user)?;
        let Some((_, entry)) = self.sessions.remove(&key) else {
            return Err(PosternError::SessionNotFound(key));
        };

        entry.session.destroy().await;
        entry.pump.abort();
        self.release_restore_lock(&key);
        info!("Removed session for {}", key);
        Ok(())
    }

    /// Acknowledge a logout and finalize it asynchronously: upstream
    /// logout, store close, store file deletion, then deregistration.
    /// Finalization failures are logged, never surfaced.
    pub async fn logout(self: &Arc<Self>, user: &str) -> Result<()> {
        let key = Self::sanitize_user(user)?;
        let Some(session) = self.find_existing(&key).await? else {
            return Err(PosternError::SessionNotFound(key));
        };

        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            session.finalize_logout().await;
            if let Some((_, entry)) = supervisor.sessions.remove(&key) {
                entry.pump.abort();
            }
            supervisor.release_restore_lock(&key);
            info!("Logout finalized for {}", session.user());
        });
        Ok(())
    }

    /// Tear a session down and bring it back from its on-disk store
    pub async fn restart(&self, user: &str) -> Result<Arc<Session>> {
        let key = Self::sanitize_user(user)?;

        if let Some((_, entry)) = self.sessions.remove(&key) {
            info!("Disconnecting existing session for {} before restart", key);
            entry.session.destroy().await;
            entry.pump.abort();
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let session = self.find_or_restore(&key).await?;
        if !session.transport().is_connected() {
            connect_with_retry(&session, self.session_config.connect_max_retries)
                .await
                .map_err(|e| {
                    PosternError::Transport(format!("failed to connect after restart: {}", e))
                })?;
        }
        info!("Session restarted for {}", key);
        Ok(session)
    }

    /// Read-only snapshot of the current sessions
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .map(|e| Arc::clone(&e.session))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions currently logged in
    pub async fn active_count(&self) -> usize {
        let mut active = 0;
        for session in self.sessions() {
            if session.state().await == SessionState::LoggedIn {
                active += 1;
            }
        }
        active
    }

    /// Evict sessions that have been disconnected or errored and idle for
    /// longer than `max_idle`. Returns how many were removed.
    pub async fn reap_idle(&self, max_idle: Duration) -> usize {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_idle).unwrap_or(chrono::Duration::zero());
        let mut reaped = 0;

        for session in self.sessions() {
            let state = session.state().await;
            let stale = matches!(
                state,
                SessionState::Disconnected | SessionState::Errored
            ) && session.last_activity_at() < cutoff;
            if stale {
                info!("Reaping idle session {}", session.user());
                if self.remove_session(session.user()).await.is_ok() {
                    reaped += 1;
                }
            }
        }
        reaped
    }

    /// Periodic idle-reaper task
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if supervisor.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let reaped = supervisor.reap_idle(max_idle).await;
                if reaped > 0 {
                    info!("Idle reaper removed {} sessions", reaped);
                }
            }
        })
    }

    /// Restore every latent session found in the data directory. Individual
    /// failures are logged and do not abort the others. Returns how many
    /// sessions were restored.
    pub async fn restore_all(&self) -> usize {
        let users = self.stores.scan();
        if users.is_empty() {
            info!("No existing sessions in data directory");
            return 0;
        }

        info!("Found {} latent sessions in data directory", users.len());
        let mut restored = 0;
        for user in users {
            match self.find_or_restore(&user).await {
                Ok(_) => {
                    restored += 1;
                    info!("Restored session for {}", user);
                }
                Err(e) => error!("Failed to restore session for {}: {}", user, e),
            }
        }
        info!("Restored {} sessions", restored);
        restored
    }

    /// Stop accepting sessions, drain the event bus, and release every
    /// session's resources.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        info!("Supervisor shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.bus.shutdown(drain_deadline).await;

        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.sessions.remove(&key) {
                entry.session.destroy().await;
                entry.pump.abort();
            }
        }
        self.restore_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        info!("Supervisor shutdown complete");
    }

    fn check_accepting(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(PosternError::Internal("gateway is shutting down".into()));
        }
        Ok(())
    }

    fn restore_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.restore_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a user's restore lock once nothing holds it. Callers still
    /// waiting keep their clone alive (strong count > 1), so an in-flight
    /// restore never races a freshly created lock.
    fn release_restore_lock(&self, key: &str) {
        self.restore_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Open the store, build the transport, register the session, and start
    /// its event pump. Caller holds the per-key restore lock.
    async fn create_session(&self, key: &str) -> Result<Arc<Session>> {
        let store = Arc::new(self.stores.open(key)?);
        let transport = self
            .factory
            .create(key, Arc::clone(&store))
            .await
            .inspect_err(|_| store.close())?;

        let session = Arc::new(Session::new(
            key,
            Arc::clone(&transport),
            store,
            Arc::clone(&self.bus),
            Arc::clone(&self.session_config),
        ));
        let pump = session.spawn_pump(transport.event_stream().await);

        self.sessions.insert(
            key.to_string(),
            Entry {
                session: Arc::clone(&session),
                pump,
            },
        );
        Ok(session)
    }
}
