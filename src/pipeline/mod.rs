//! Send pipeline
//!
//! Every send and mark-read operation passes through here, in order:
//! recipient validation, session gate, per-user rate spacing, duplicate
//! suppression, connection ensure, then execution under a deadline with
//! websocket-drop retry. Mark-read skips the limiter and the suppressor,
//! matching the upstream service this gateway fronts.

pub mod dedup;
pub mod rate_limit;

pub use dedup::{duplicate_key, DuplicateLimiter};
pub use rate_limit::RateLimiter;

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

use crate::media::{self, thumb};
use crate::session::{Session, SessionState};
use crate::supervisor::Supervisor;
use crate::transport::{MediaKind, MediaMessage, SendAck, Transport, TransportError};
use crate::types::{PosternError, Result};

/// Tunables for the send pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Minimum spacing between consecutive sends per user
    pub send_spacing: Duration,
    /// Duplicate suppression window
    pub duplicate_window: Duration,
    /// Identical sends allowed inside one window
    pub duplicate_max: u32,
    /// Per-call deadline for sends
    pub send_timeout: Duration,
    /// Per-call deadline for mark-read
    pub mark_read_timeout: Duration,
    /// Deadline for media URL fetches
    pub fetch_timeout: Duration,
    /// Total send attempts, including websocket-drop retries
    pub max_send_attempts: u32,
    /// Pause between disconnect and reconnect during drop recovery
    pub reconnect_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            send_spacing: Duration::from_secs(6),
            duplicate_window: Duration::from_secs(6),
            duplicate_max: 1,
            send_timeout: Duration::from_secs(60),
            mark_read_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            max_send_attempts: 3,
            reconnect_pause: Duration::from_secs(1),
        }
    }
}

/// A media send request as it arrives from the HTTP layer
#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub user: String,
    pub recipient: String,
    pub kind: MediaKind,
    /// Inline base64 payload
    pub data: Option<String>,
    /// HTTP source to fetch instead of inline bytes
    pub url: Option<String>,
    pub caption: Option<String>,
    pub file_name: Option<String>,
}

/// Result of a media send
#[derive(Debug, Clone)]
pub struct MediaOutcome {
    pub ack: SendAck,
    /// Filename the message was delivered with, when one was resolved
    pub file_name: Option<String>,
}

/// The pipeline every outbound operation flows through
pub struct SendPipeline {
    supervisor: Arc<Supervisor>,
    limiter: RateLimiter,
    dedup: DuplicateLimiter,
    http: reqwest::Client,
    config: PipelineConfig,
}

impl SendPipeline {
    pub fn new(supervisor: Arc<Supervisor>, config: PipelineConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| PosternError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            supervisor,
            limiter: RateLimiter::new(config.send_spacing),
            dedup: DuplicateLimiter::new(config.duplicate_window, config.duplicate_max),
            http,
            config,
        })
    }

    /// Recipient must be digits, optionally with a leading `+`
    pub fn validate_recipient(recipient: &str) -> Result<()> {
        let trimmed = recipient.trim();
        if trimmed.is_empty() {
            return Err(PosternError::InvalidRecipient(
                "phone number is empty".into(),
            ));
        }
        let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PosternError::InvalidRecipient(
                "must be all digits or start with '+' followed by digits".into(),
            ));
        }
        Ok(())
    }

    /// Send a text message through the full pipeline
    pub async fn send_text(&self, user: &str, recipient: &str, body: &str) -> Result<SendAck> {
        Self::validate_recipient(recipient)?;
        if body.is_empty() {
            return Err(PosternError::InvalidRequest("message is empty".into()));
        }

        let session = self.session_gate(user).await?;
        self.limiter.wait(user).await;

        let recipient = recipient.trim().to_string();
        let key = duplicate_key(user, &recipient, "text", body.as_bytes());
        self.dedup.check(&key)?;

        let message_id = Uuid::new_v4().to_string();
        let transport = Arc::clone(session.transport());
        let body = body.to_string();
        let op_recipient = recipient.clone();

        let ack = self
            .execute_with_retry(&session, "message send", self.config.send_timeout, move || {
                let transport = Arc::clone(&transport);
                let recipient = op_recipient.clone();
                let body = body.clone();
                let id = message_id.clone();
                async move { transport.send_text(&recipient, &body, &id).await }
            })
            .await?;

        info!("Message sent successfully to {} from user {}", recipient, user);
        Ok(ack)
    }

    /// Resolve, upload, and send a media message
    pub async fn send_media(&self, request: MediaRequest) -> Result<MediaOutcome> {
        Self::validate_recipient(&request.recipient)?;
        let source = request
            .url
            .as_deref()
            .or(request.data.as_deref())
            .unwrap_or("");
        if source.is_empty() {
            return Err(PosternError::InvalidRequest(
                "either media or url must be provided".into(),
            ));
        }

        let session = self.session_gate(&request.user).await?;
        self.limiter.wait(&request.user).await;

        let recipient = request.recipient.trim().to_string();
        // Key on the media reference so duplicates are caught before any fetch
        let key = duplicate_key(
            &request.user,
            &recipient,
            request.kind.as_str(),
            source.as_bytes(),
        );
        self.dedup.check(&key)?;

        let resolved = if let Some(ref url) = request.url {
            media::fetch_url(&self.http, url, request.file_name.as_deref()).await?
        } else {
            media::from_base64(source, request.file_name.as_deref())?
        };

        self.ensure_connected(&session).await?;
        let media_ref = session
            .transport()
            .upload_media(&resolved.bytes, request.kind)
            .await
            .map_err(|e| PosternError::Upload(format!("failed to upload media: {}", e)))?;

        let thumbnail = if request.kind == MediaKind::Video {
            match thumb::video_thumbnail(&resolved.bytes).await {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Failed to generate video thumbnail: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let message = Arc::new(MediaMessage {
            kind: request.kind,
            media: media_ref,
            mime_type: resolved.mime_type.clone(),
            caption: request.caption.clone(),
            file_name: resolved.file_name.clone(),
            thumbnail,
        });

        let message_id = Uuid::new_v4().to_string();
        let transport = Arc::clone(session.transport());
        let op_recipient = recipient.clone();

        let ack = self
            .execute_with_retry(&session, "media send", self.config.send_timeout, move || {
                let transport = Arc::clone(&transport);
                let recipient = op_recipient.clone();
                let message = Arc::clone(&message);
                let id = message_id.clone();
                async move { transport.send_media(&recipient, &message, &id).await }
            })
            .await?;

        info!(
            "Media sent successfully to {} from user {}",
            recipient, request.user
        );
        Ok(MediaOutcome {
            ack,
            file_name: resolved.file_name,
        })
    }

    /// Mark messages as read. No rate spacing or duplicate suppression.
    pub async fn mark_read(
        &self,
        user: &str,
        message_ids: &[String],
        from: &str,
        to: &str,
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Err(PosternError::InvalidRequest("message_ids is empty".into()));
        }

        let session = self.session_gate(user).await?;
        self.ensure_connected(&session).await?;

        let result = timeout(
            self.config.mark_read_timeout,
            session
                .transport()
                .mark_read(message_ids, from, to, Utc::now()),
        )
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PosternError::Transport(format!(
                "failed to mark as read: {}",
                e
            ))),
            Err(_) => Err(PosternError::Timeout("mark-read deadline expired".into())),
        }
    }

    /// Resolve the live session for a user; restore failures read as the
    /// session being unavailable.
    async fn session_gate(&self, user: &str) -> Result<Arc<Session>> {
        match self.supervisor.find_existing(user).await {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(PosternError::SessionNotFound(user.to_string())),
            Err(PosternError::MissingUser) => Err(PosternError::MissingUser),
            Err(e) => {
                warn!("Failed to restore session for {}: {}", user, e);
                Err(PosternError::SessionNotFound(user.to_string()))
            }
        }
    }

    async fn ensure_connected(&self, session: &Arc<Session>) -> Result<()> {
        if session.transport().is_connected() {
            return Ok(());
        }
        session.connect().await
    }

    /// Run an upstream operation under a deadline, recovering from
    /// websocket drops with one disconnect-reconnect cycle per attempt.
    /// Non-drop errors and deadline expiry are surfaced immediately.
    async fn execute_with_retry<T, F, Fut>(
        &self,
        session: &Arc<Session>,
        op_name: &str,
        deadline: Duration,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<T, TransportError>>,
    {
        let max_attempts = self.config.max_send_attempts.max(1);
        let mut last_err = PosternError::Transport(format!("{} failed", op_name));

        for attempt in 1..=max_attempts {
            self.ensure_connected(session).await?;

            match timeout(deadline, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if e.is_websocket_dropped() => {
                    // Without an authenticated session a reconnect cannot
                    // succeed; the device has to relink first
                    if session.state().await != SessionState::LoggedIn {
                        info!(
                            "User {} is not logged in, not attempting to reconnect",
                            session.user()
                        );
                        return Err(PosternError::NotLoggedIn);
                    }

                    warn!(
                        "Websocket dropped during {} (attempt {}/{}), reconnecting",
                        op_name, attempt, max_attempts
                    );
                    session.transport().disconnect().await;
                    tokio::time::sleep(self.config.reconnect_pause).await;
                    if let Err(ce) = session.connect().await {
                        warn!("Failed to reconnect during {} retry: {}", op_name, ce);
                    }
                    last_err = PosternError::Transport(e.to_string());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(PosternError::Timeout(format!(
                        "{} deadline of {}s expired",
                        op_name,
                        deadline.as_secs()
                    )))
                }
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::session::SessionConfig;
    use crate::store::StoreManager;
    use crate::transport::{InboundEvent, MemoryTransport, MemoryTransportFactory, TransportFactory};
    use base64::Engine;
    use tempfile::TempDir;
    use tokio::time::Instant;

    struct Fixture {
        _dir: TempDir,
        supervisor: Arc<Supervisor>,
        factory: Arc<MemoryTransportFactory>,
        pipeline: SendPipeline,
    }

    fn quick_config() -> PipelineConfig {
        PipelineConfig {
            send_spacing: Duration::ZERO,
            duplicate_window: Duration::from_millis(200),
            duplicate_max: 1,
            send_timeout: Duration::from_secs(5),
            mark_read_timeout: Duration::from_secs(5),
            fetch_timeout: Duration::from_secs(5),
            max_send_attempts: 3,
            reconnect_pause: Duration::from_millis(20),
        }
    }

    fn fixture(config: PipelineConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        let factory = Arc::new(MemoryTransportFactory::new(false));
        let supervisor = Supervisor::new(
            StoreManager::new(dir.path().to_path_buf()),
            Arc::clone(&factory) as Arc<dyn TransportFactory>,
            Arc::new(EventBus::new(64, 2)),
            SessionConfig::default(),
        );
        let pipeline = SendPipeline::new(Arc::clone(&supervisor), config).unwrap();
        Fixture {
            _dir: dir,
            supervisor,
            factory,
            pipeline,
        }
    }

    /// Create a session, connect it, and promote it to logged-in
    async fn logged_in_session(f: &Fixture, user: &str) -> Arc<MemoryTransport> {
        let session = f.supervisor.add_session(user).await.unwrap();
        session.connect().await.unwrap();
        let transport = f.factory.get(user).unwrap();
        transport.emit(InboundEvent::Connected).await;
        for _ in 0..50 {
            if session.state().await == SessionState::LoggedIn {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport
    }

    #[test]
    fn test_recipient_validation() {
        assert!(SendPipeline::validate_recipient("12025550100").is_ok());
        assert!(SendPipeline::validate_recipient("+12025550100").is_ok());
        assert!(SendPipeline::validate_recipient(" 12025550100 ").is_ok());

        assert!(SendPipeline::validate_recipient("").is_err());
        assert!(SendPipeline::validate_recipient("   ").is_err());
        assert!(SendPipeline::validate_recipient("not-a-number").is_err());
        assert!(SendPipeline::validate_recipient("+").is_err());
        assert!(SendPipeline::validate_recipient("+1202abc").is_err());
        assert!(SendPipeline::validate_recipient("1202-555-0100").is_err());
    }

    #[tokio::test]
    async fn test_invalid_recipient_never_reaches_transport() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;

        let err = f
            .pipeline
            .send_text("dan", "not-a-number", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::InvalidRecipient(_)));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let f = fixture(quick_config());
        let err = f
            .pipeline
            .send_text("ghost", "12025550100", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_text_happy_path() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;

        let ack = f
            .pipeline
            .send_text("dan", "+12025550100", "hi")
            .await
            .unwrap();
        assert!(!ack.message_id.is_empty());

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "+12025550100");
        assert_eq!(sent[0].body, "hi");
    }

    #[tokio::test]
    async fn test_sends_observe_per_user_spacing() {
        let mut config = quick_config();
        config.send_spacing = Duration::from_millis(80);
        config.duplicate_max = 0;
        let f = fixture(config);
        let transport = logged_in_session(&f, "dan").await;

        let started = Instant::now();
        for _ in 0..3 {
            f.pipeline
                .send_text("dan", "+12025550100", "hi")
                .await
                .unwrap();
        }

        // Third completion lands two spacings after the first
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(transport.sent_count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_send_is_suppressed() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;

        f.pipeline
            .send_text("dan", "12025550100", "hi")
            .await
            .unwrap();
        let err = f
            .pipeline
            .send_text("dan", "12025550100", "hi")
            .await
            .unwrap_err();

        match err {
            PosternError::Duplicate { retry_after } => {
                assert!(retry_after <= Duration::from_millis(200));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.sent_count(), 1);

        // A different body is not a duplicate
        f.pipeline
            .send_text("dan", "12025550100", "something else")
            .await
            .unwrap();
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_websocket_drop_recovers_when_logged_in() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;
        transport.fail_next_send(TransportError::WebsocketDropped("mid-send".into()));

        let ack = f
            .pipeline
            .send_text("dan", "12025550100", "hi")
            .await
            .unwrap();
        assert!(!ack.message_id.is_empty());
        assert!(transport.is_connected());
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_websocket_drop_without_login_fails_fast() {
        let f = fixture(quick_config());
        let session = f.supervisor.add_session("dan").await.unwrap();
        session.connect().await.unwrap();
        let transport = f.factory.get("dan").unwrap();
        transport.fail_next_send(TransportError::WebsocketDropped("mid-send".into()));

        let err = f
            .pipeline
            .send_text("dan", "12025550100", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::NotLoggedIn));
        // No reconnect was attempted
        assert!(!transport.is_connected());
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_non_drop_error_is_surfaced_without_retry() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;
        transport.fail_next_send(TransportError::Upstream("server refused".into()));

        let err = f
            .pipeline
            .send_text("dan", "12025550100", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::Transport(_)));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_send_deadline_expiry_is_timeout() {
        let mut config = quick_config();
        config.send_timeout = Duration::from_millis(40);
        let f = fixture(config);
        let transport = logged_in_session(&f, "dan").await;
        transport.set_send_delay(Some(Duration::from_millis(200)));

        let err = f
            .pipeline
            .send_text("dan", "12025550100", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_send_reconnects_disconnected_session() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;
        transport.disconnect().await;
        assert!(!transport.is_connected());

        f.pipeline
            .send_text("dan", "12025550100", "hi")
            .await
            .unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_send_media_from_base64() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;

        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 1, 2, 3];
        let outcome = f
            .pipeline
            .send_media(MediaRequest {
                user: "dan".into(),
                recipient: "12025550100".into(),
                kind: MediaKind::Image,
                data: Some(base64::engine::general_purpose::STANDARD.encode(png)),
                url: None,
                caption: Some("a pixel".into()),
                file_name: Some("pixel.png".into()),
            })
            .await
            .unwrap();

        assert_eq!(outcome.file_name.as_deref(), Some("pixel.png"));
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, Some(MediaKind::Image));
        assert_eq!(sent[0].mime_type.as_deref(), Some("image/png"));
        assert_eq!(sent[0].caption.as_deref(), Some("a pixel"));
    }

    #[tokio::test]
    async fn test_send_media_requires_a_source() {
        let f = fixture(quick_config());
        logged_in_session(&f, "dan").await;

        let err = f
            .pipeline
            .send_media(MediaRequest {
                user: "dan".into(),
                recipient: "12025550100".into(),
                kind: MediaKind::File,
                data: None,
                url: None,
                caption: None,
                file_name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_send_media_upload_failure() {
        let f = fixture(quick_config());
        let transport = logged_in_session(&f, "dan").await;
        transport.fail_next_upload(TransportError::Upload("quota exceeded".into()));

        let err = f
            .pipeline
            .send_media(MediaRequest {
                user: "dan".into(),
                recipient: "12025550100".into(),
                kind: MediaKind::File,
                data: Some(base64::engine::general_purpose::STANDARD.encode(b"hello")),
                url: None,
                caption: None,
                file_name: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::Upload(_)));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_mark_read_skips_rate_limiting() {
        let mut config = quick_config();
        config.send_spacing = Duration::from_millis(500);
        let f = fixture(config);
        logged_in_session(&f, "dan").await;

        let ids = vec!["m1".to_string(), "m2".to_string()];
        let started = Instant::now();
        f.pipeline
            .mark_read("dan", &ids, "12025550100", "12025550101")
            .await
            .unwrap();
        f.pipeline
            .mark_read("dan", &ids, "12025550100", "12025550101")
            .await
            .unwrap();
        // Two back-to-back mark-reads never wait out the send spacing
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_full_session_round_trip() {
        // add -> QR -> link -> send -> mark read -> logout leaves neither a
        // registry entry nor a store file behind
        let f = fixture(quick_config());
        let session = f.supervisor.add_session("alice").await.unwrap();
        let store_path = session.store().path().to_path_buf();

        let transport = f.factory.get("alice").unwrap();
        transport.push_qr("round-trip-code");
        let code = session.request_qr().await.unwrap();
        assert_eq!(code, "round-trip-code");

        // The caller scans; the upstream reports the authenticated socket
        transport.complete_link("device-alice").await;
        for _ in 0..50 {
            if session.state().await == SessionState::LoggedIn {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.state().await, SessionState::LoggedIn);

        let ack = f
            .pipeline
            .send_text("alice", "12025550100", "hello")
            .await
            .unwrap();
        f.pipeline
            .mark_read("alice", &[ack.message_id], "12025550100", "12025550101")
            .await
            .unwrap();

        f.supervisor.logout("alice").await.unwrap();
        for _ in 0..100 {
            if f.supervisor.session_count() == 0 && !store_path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.supervisor.session_count(), 0);
        assert!(!store_path.exists());
    }

    #[tokio::test]
    async fn test_mark_read_rejects_empty_ids() {
        let f = fixture(quick_config());
        logged_in_session(&f, "dan").await;

        let err = f
            .pipeline
            .mark_read("dan", &[], "12025550100", "12025550101")
            .await
            .unwrap_err();
        assert!(matches!(err, PosternError::InvalidRequest(_)));
    }
}
