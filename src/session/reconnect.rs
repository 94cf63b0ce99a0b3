//! Reconnect engine
//!
//! An internal observer on the event bus watches for sessions that dropped
//! out of an active state and drives them back through `connect` with
//! exponential backoff. Engine failures are logged, never surfaced.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;

use super::{Session, SessionState};
use crate::events::{Observer, SessionEvent};
use crate::supervisor::Supervisor;
use crate::transport::{Transport, TransportError};
use crate::types::{PosternError, Result};

/// Settling interval after a disconnect before connecting again
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Longer pause after an already-connected rejection
const ALREADY_CONNECTED_PAUSE: Duration = Duration::from_secs(1);

/// Pause between plain failed attempts
const RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Exponential reconnect backoff: `min(cap, 2^attempts seconds)`
pub fn backoff_delay(attempts: u32, cap: Duration) -> Duration {
    let exp = Duration::from_secs(2u64.saturating_pow(attempts.min(32)));
    exp.min(cap)
}

/// Observer that schedules reconnection when a session drops.
///
/// Holds only a weak supervisor handle: the supervisor owns the sessions,
/// observers never do.
pub struct ReconnectObserver {
    supervisor: Weak<Supervisor>,
}

impl ReconnectObserver {
    pub fn new(supervisor: &Arc<Supervisor>) -> Self {
        Self {
            supervisor: Arc::downgrade(supervisor),
        }
    }
}

impl Observer for ReconnectObserver {
    fn on_event(&self, event: &SessionEvent) {
        let SessionEvent::Status { user, state } = event else {
            return;
        };
        if *state != SessionState::Disconnected {
            return;
        }
        let Some(supervisor) = self.supervisor.upgrade() else {
            return;
        };

        // The backoff wait must not stall the dispatch worker
        let user = user.clone();
        tokio::spawn(async move {
            match supervisor.get(&user) {
                Some(session) => session.maybe_reconnect().await,
                None => debug!("Reconnect skipped, session {} is gone", user),
            }
        });
    }
}

/// Connect a session, retrying transient failures.
///
/// Used by startup restore and restart. A lingering socket is dropped and
/// allowed to settle first; an already-connected rejection gets a longer
/// pause before the next attempt.
pub async fn connect_with_retry(session: &Arc<Session>, max_retries: u32) -> Result<()> {
    let transport = session.transport();
    let mut last_err = TransportError::NotConnected;

    for attempt in 1..=max_retries.max(1) {
        if transport.is_connected() {
            debug!(
                "Session {} already connected, disconnecting before attempt {}",
                session.user(),
                attempt
            );
            transport.disconnect().await;
            tokio::time::sleep(SETTLE_DELAY).await;
        }

        match session.try_connect().await {
            Ok(()) => return Ok(()),
            Err(TransportError::AlreadyConnected) => {
                debug!(
                    "Got already-connected error for {} (attempt {}/{})",
                    session.user(),
                    attempt,
                    max_retries
                );
                transport.disconnect().await;
                tokio::time::sleep(ALREADY_CONNECTED_PAUSE).await;
                last_err = TransportError::AlreadyConnected;
            }
            Err(e) => {
                debug!(
                    "Connection error for {}: {} (attempt {}/{})",
                    session.user(),
                    e,
                    attempt,
                    max_retries
                );
                last_err = e;
                tokio::time::sleep(RETRY_PAUSE).await;
            }
        }
    }

    Err(PosternError::from(last_err))
}
