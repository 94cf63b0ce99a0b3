//! Session - one linked account
//!
//! A session owns its transport and device store, runs the state machine,
//! and coordinates the QR linking and logout protocols. All state
//! transitions happen under the session mutex; the mutex is held across
//! connect/disconnect but never across long upstream sends.

pub mod reconnect;
mod state;

pub use state::SessionState;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::events::{EventBus, SessionEvent};
use crate::store::DeviceStore;
use crate::transport::{InboundEvent, Transport, TransportError};
use crate::types::{PosternError, Result};

/// Timing knobs shared by every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Deadline for a single QR code to arrive
    pub qr_code_timeout: Duration,
    /// Overall deadline for the QR linking protocol
    pub qr_overall_timeout: Duration,
    /// Settling interval after a disconnect before reconnecting
    pub settle_delay: Duration,
    /// Longer pause after an already-connected rejection
    pub already_connected_pause: Duration,
    /// Cap on exponential reconnect backoff
    pub reconnect_max_backoff: Duration,
    /// Soft ceiling on reconnect attempts: the engine keeps retrying past
    /// it but logs each excess attempt
    pub reconnect_max_attempts: u32,
    /// Attempts per connect-with-retry cycle
    pub connect_max_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            qr_code_timeout: Duration::from_secs(30),
            qr_overall_timeout: Duration::from_secs(60),
            settle_delay: Duration::from_millis(500),
            already_connected_pause: Duration::from_secs(1),
            reconnect_max_backoff: Duration::from_secs(30),
            reconnect_max_attempts: 20,
            connect_max_retries: 3,
        }
    }
}

/// Snapshot returned by [`Session::status`]
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub logged_in: bool,
    pub connected: bool,
    pub needs_qr: bool,
    pub last_activity_at: DateTime<Utc>,
}

/// State guarded by the session mutex
struct StateCell {
    state: SessionState,
    reconnect_attempts: u32,
    last_reconnect_at: Option<Instant>,
    /// Set when the last drop came from an active state; cleared by
    /// explicit disconnects and logout so the engine leaves them alone
    reconnect_on_drop: bool,
}

/// One linked account: transport + store + state machine
pub struct Session {
    user: String,
    transport: Arc<dyn Transport>,
    store: Arc<DeviceStore>,
    bus: Arc<EventBus>,
    config: Arc<SessionConfig>,
    cell: Mutex<StateCell>,
    latest_qr: RwLock<Option<String>>,
    last_activity: AtomicI64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("store", &self.store)
            .field("config", &self.config)
            .field("latest_qr", &self.latest_qr)
            .field("last_activity", &self.last_activity)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        user: &str,
        transport: Arc<dyn Transport>,
        store: Arc<DeviceStore>,
        bus: Arc<EventBus>,
        config: Arc<SessionConfig>,
    ) -> Self {
        Self {
            user: user.to_string(),
            transport,
            store,
            bus,
            config,
            cell: Mutex::new(StateCell {
                state: SessionState::Fresh,
                reconnect_attempts: 0,
                last_reconnect_at: None,
                reconnect_on_drop: false,
            }),
            latest_qr: RwLock::new(None),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn store(&self) -> &Arc<DeviceStore> {
        &self.store
    }

    /// Whether the persisted device has completed linking
    pub fn is_linked(&self) -> bool {
        self.transport.device_id().is_some()
    }

    pub async fn state(&self) -> SessionState {
        self.cell.lock().await.state
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        let secs = self.last_activity.load(Ordering::Relaxed);
        Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
    }

    pub fn latest_qr(&self) -> Option<String> {
        self.latest_qr.read().expect("qr lock poisoned").clone()
    }

    pub async fn status(&self) -> SessionStatus {
        let state = self.state().await;
        let connected = self.transport.is_connected();
        let logged_in = state == SessionState::LoggedIn;
        SessionStatus {
            state,
            logged_in,
            connected,
            needs_qr: !logged_in || !connected,
            last_activity_at: self.last_activity_at(),
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Apply a state transition under the mutex and publish it
    async fn transition(&self, cell: &mut MutexGuard<'_, StateCell>, next: SessionState) {
        if cell.state == next {
            return;
        }
        debug!("Session {} {} -> {}", self.user, cell.state, next);
        cell.state = next;
        self.touch();
        self.bus
            .publish(SessionEvent::Status {
                user: self.user.clone(),
                state: next,
            })
            .await;
    }

    /// Connect the transport, tracking state. Success when already up.
    pub async fn connect(&self) -> Result<()> {
        self.try_connect().await.map_err(Into::into)
    }

    /// Typed variant of [`connect`](Self::connect) used by the retry helper,
    /// which needs to tell an already-connected rejection apart.
    pub(crate) async fn try_connect(&self) -> std::result::Result<(), TransportError> {
        let mut cell = self.cell.lock().await;
        self.touch();

        if self.transport.is_connected() {
            return Ok(());
        }

        self.transition(&mut cell, SessionState::Connecting).await;
        match self.transport.connect().await {
            Ok(()) => {
                cell.reconnect_attempts = 0;
                self.transition(&mut cell, SessionState::Connected).await;
                Ok(())
            }
            Err(e) => {
                warn!("Error connecting session {}: {}", self.user, e);
                self.transition(&mut cell, SessionState::Errored).await;
                Err(e)
            }
        }
    }

    /// Disconnect and settle in `Disconnected`. Idempotent and safe to call
    /// concurrently; an explicit disconnect never schedules reconnection.
    pub async fn disconnect(&self) {
        let mut cell = self.cell.lock().await;
        self.touch();
        cell.reconnect_on_drop = false;
        if self.transport.is_connected() {
            self.transport.disconnect().await;
        }
        self.transition(&mut cell, SessionState::Disconnected).await;
    }

    /// Handle one upstream event from the transport pump
    pub async fn handle_event(&self, event: InboundEvent) {
        self.touch();
        match event {
            InboundEvent::Connected => {
                info!("Session {} connected and logged in", self.user);
                let mut cell = self.cell.lock().await;
                self.transition(&mut cell, SessionState::LoggedIn).await;
            }
            InboundEvent::LoggedOut { reason, on_connect } => {
                if on_connect {
                    info!("Session {} logged out on connect; reason={}", self.user, reason);
                } else {
                    info!("Session {} logged out (stream error)", self.user);
                }
                let mut cell = self.cell.lock().await;
                cell.reconnect_on_drop = false;
                self.transition(&mut cell, SessionState::LoggedOut).await;
            }
            InboundEvent::Disconnected => {
                info!("Session {} disconnected", self.user);
                let mut cell = self.cell.lock().await;
                let was_active = cell.state.is_active();
                cell.reconnect_on_drop = was_active;
                self.transition(&mut cell, SessionState::Disconnected).await;
            }
            InboundEvent::StreamError { detail } => {
                warn!("Session {} stream error: {}", self.user, detail);
                self.bus
                    .publish(SessionEvent::Error {
                        user: self.user.clone(),
                        detail: format!("Stream error: {}", detail),
                    })
                    .await;
            }
            InboundEvent::Qr { code } => {
                debug!("Session {} received QR code", self.user);
                *self.latest_qr.write().expect("qr lock poisoned") = Some(code.clone());
                self.bus
                    .publish(SessionEvent::Qr {
                        user: self.user.clone(),
                        code,
                    })
                    .await;
            }
            InboundEvent::PushName { name } => {
                debug!("Session {} push name updated: {}", self.user, name);
                self.bus
                    .publish(SessionEvent::Raw {
                        user: self.user.clone(),
                        payload: serde_json::json!({ "type": "push_name", "name": name }),
                    })
                    .await;
            }
            InboundEvent::Raw { payload } => {
                self.bus
                    .publish(SessionEvent::Raw {
                        user: self.user.clone(),
                        payload,
                    })
                    .await;
            }
        }
    }

    /// Spawn the event pump feeding this session from its transport
    pub fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<InboundEvent>) -> JoinHandle<()> {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                session.handle_event(event).await;
            }
            debug!("Event pump for {} stopped", session.user());
        })
    }

    /// Run the QR linking protocol and return the first code.
    ///
    /// Fails with `AlreadyLoggedIn` without touching the socket when the
    /// session is authenticated and connected. Any timeout leaves the
    /// session in `Disconnected`.
    pub async fn request_qr(&self) -> Result<String> {
        {
            let cell = self.cell.lock().await;
            if cell.state == SessionState::LoggedIn && self.transport.is_connected() {
                info!("Session {} already logged in, no QR needed", self.user);
                return Err(PosternError::AlreadyLoggedIn);
            }
        }

        match timeout(self.config.qr_overall_timeout, self.qr_link_inner()).await {
            Ok(result) => result,
            Err(_) => {
                self.settle_disconnected().await;
                Err(PosternError::Timeout(format!(
                    "QR code not available after waiting {} seconds",
                    self.config.qr_overall_timeout.as_secs()
                )))
            }
        }
    }

    async fn qr_link_inner(&self) -> Result<String> {
        // A lingering socket makes connect fail with already-connected;
        // drop it and let the upstream settle before retrying.
        if self.transport.is_connected() {
            info!(
                "Disconnecting existing connection for {} before generating QR",
                self.user
            );
            self.transport.disconnect().await;
            tokio::time::sleep(self.config.settle_delay).await;
        }

        {
            let mut cell = self.cell.lock().await;
            cell.reconnect_on_drop = false;
            self.transition(&mut cell, SessionState::Fresh).await;
        }
        *self.latest_qr.write().expect("qr lock poisoned") = None;

        // The QR sequence must be subscribed before the socket opens or the
        // first code is lost.
        let mut qr_rx = self.transport.qr_channel().await.map_err(|e| {
            PosternError::Transport(format!("failed to open QR channel: {}", e))
        })?;

        match self.try_connect().await {
            Ok(()) => {}
            Err(TransportError::AlreadyConnected) => {
                warn!(
                    "Got already-connected error for {} during QR link, retrying after disconnect",
                    self.user
                );
                self.transport.disconnect().await;
                tokio::time::sleep(self.config.already_connected_pause).await;
                self.try_connect().await.map_err(PosternError::from)?;
            }
            Err(e) => return Err(e.into()),
        }

        match timeout(self.config.qr_code_timeout, qr_rx.recv()).await {
            Ok(Some(qr)) => {
                info!("Generated QR code for {}", self.user);
                *self.latest_qr.write().expect("qr lock poisoned") = Some(qr.code.clone());
                self.bus
                    .publish(SessionEvent::Qr {
                        user: self.user.clone(),
                        code: qr.code.clone(),
                    })
                    .await;
                Ok(qr.code)
            }
            Ok(None) => {
                self.settle_disconnected().await;
                Err(PosternError::Transport(
                    "QR channel closed before a code arrived".into(),
                ))
            }
            Err(_) => {
                self.settle_disconnected().await;
                Err(PosternError::Timeout(format!(
                    "timed out waiting {} seconds for QR code",
                    self.config.qr_code_timeout.as_secs()
                )))
            }
        }
    }

    pub(crate) async fn settle_disconnected(&self) {
        if self.transport.is_connected() {
            self.transport.disconnect().await;
        }
        let mut cell = self.cell.lock().await;
        cell.reconnect_on_drop = false;
        self.transition(&mut cell, SessionState::Disconnected).await;
    }

    /// Reconnect after an unexpected drop, honoring exponential backoff.
    /// No-op unless the last drop came from an active state.
    pub async fn maybe_reconnect(&self) {
        let wait = {
            let cell = self.cell.lock().await;
            if cell.state != SessionState::Disconnected || !cell.reconnect_on_drop {
                return;
            }
            let backoff = reconnect::backoff_delay(
                cell.reconnect_attempts,
                self.config.reconnect_max_backoff,
            );
            match cell.last_reconnect_at {
                Some(last) if last.elapsed() < backoff => backoff - last.elapsed(),
                _ => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            info!(
                "Waiting {:?} before reconnecting session {}",
                wait, self.user
            );
            tokio::time::sleep(wait).await;
        }

        let attempt = {
            let mut cell = self.cell.lock().await;
            // The drop may have resolved while we slept
            if cell.state != SessionState::Disconnected || !cell.reconnect_on_drop {
                return;
            }
            cell.last_reconnect_at = Some(Instant::now());
            cell.reconnect_attempts += 1;
            cell.reconnect_attempts
        };

        if attempt > self.config.reconnect_max_attempts {
            warn!(
                "Session {} has exceeded {} reconnect attempts, still retrying",
                self.user, self.config.reconnect_max_attempts
            );
        }
        info!(
            "Attempting to reconnect session {} (attempt {})",
            self.user, attempt
        );
        match self.connect().await {
            Ok(()) => info!(
                "Successfully reconnected session {} after {} attempts",
                self.user, attempt
            ),
            Err(e) => warn!(
                "Reconnection attempt {} for session {} failed: {}",
                attempt, self.user, e
            ),
        }
    }

    /// Logout steps owned by the session: upstream logout while connected,
    /// close the store, delete the store file. Every step runs regardless
    /// of earlier failures.
    pub async fn finalize_logout(&self) {
        if self.transport.is_connected() {
            match self.transport.logout().await {
                Ok(()) => info!("Successfully logged out {}", self.user),
                Err(e) => warn!("Error during logout for {}: {}", self.user, e),
            }
            self.transport.disconnect().await;
        } else {
            info!(
                "Transport for {} is not connected, skipping upstream logout",
                self.user
            );
        }

        {
            let mut cell = self.cell.lock().await;
            cell.reconnect_on_drop = false;
            self.transition(&mut cell, SessionState::LoggedOut).await;
        }

        self.store.close();

        match std::fs::remove_file(self.store.path()) {
            Ok(()) => info!("Deleted store file for {}", self.user),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Error deleting store file for {}: {}", self.user, e),
        }
    }

    /// Release resources without touching the on-disk store: disconnect
    /// and close. Used by eviction and shutdown.
    pub async fn destroy(&self) {
        {
            let mut cell = self.cell.lock().await;
            cell.reconnect_on_drop = false;
            if self.transport.is_connected() {
                self.transport.disconnect().await;
            }
            self.transition(&mut cell, SessionState::Disconnected).await;
        }
        self.store.close();
    }
}
