//! Transport seam over the upstream client library
//!
//! The gateway core never talks to the upstream protocol directly; it sees
//! the capability set below. Production deployments supply a
//! [`TransportFactory`] backed by the vendor client; the in-tree
//! [`memory::MemoryTransport`] loopback serves dev mode and the test suite.

pub mod memory;

pub use memory::{MemoryTransport, MemoryTransportFactory};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::store::DeviceStore;
use crate::types::PosternError;

/// Transport-level errors.
///
/// `AlreadyConnected` and `WebsocketDropped` are recovery signals for the
/// session layer and are never surfaced to HTTP callers as-is.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("websocket is already connected")]
    AlreadyConnected,

    #[error("transport is not connected")]
    NotConnected,

    #[error("websocket disconnected: {0}")]
    WebsocketDropped(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("operation timed out")]
    Timeout,
}

impl TransportError {
    /// Whether this error indicates the socket dropped mid-operation.
    ///
    /// Upstream detail strings are matched by substring as well, since some
    /// client libraries report drops as generic errors.
    pub fn is_websocket_dropped(&self) -> bool {
        match self {
            Self::WebsocketDropped(_) => true,
            Self::Upstream(detail) => detail.contains("websocket"),
            _ => false,
        }
    }
}

impl From<TransportError> for PosternError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => PosternError::Timeout("upstream operation".into()),
            TransportError::Upload(detail) => PosternError::Upload(detail),
            other => PosternError::Transport(other.to_string()),
        }
    }
}

/// A QR linking code with its expiry
#[derive(Debug, Clone)]
pub struct QrCode {
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

/// Typed events delivered by the upstream transport, in delivery order
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// Authenticated socket established
    Connected,
    /// The upstream logged this device out
    LoggedOut { reason: String, on_connect: bool },
    /// The socket dropped
    Disconnected,
    /// Upstream stream-level error
    StreamError { detail: String },
    /// A fresh QR linking code
    Qr { code: String },
    /// Account display name update
    PushName { name: String },
    /// Any other upstream event, passed through opaquely
    Raw { payload: serde_json::Value },
}

/// Kinds of media message the gateway can send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    File,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to media uploaded to the upstream, used to build the message
#[derive(Debug, Clone)]
pub struct MediaRef {
    pub url: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_length: u64,
}

/// Delivery acknowledgement for a sent message
#[derive(Debug, Clone, Serialize)]
pub struct SendAck {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A contact known to the linked account
#[derive(Debug, Clone, Serialize)]
pub struct Contact {
    /// Upstream JID (e.g. "1234567890@s.whatsapp.net")
    pub jid: String,
    /// Phone number without country-code formatting
    pub phone_number: String,
    /// Contact name (empty if not saved)
    pub name: Option<String>,
    /// Name set by the contact themselves
    pub push_name: Option<String>,
    /// Business name if it's a business contact
    pub business_name: Option<String>,
    /// Whether this contact is saved in the phone
    pub is_saved: bool,
    /// Whether this is a business contact
    pub is_business: bool,
}

/// Outgoing media message assembled by the send pipeline
#[derive(Debug, Clone)]
pub struct MediaMessage {
    pub kind: MediaKind,
    pub media: MediaRef,
    pub mime_type: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
    /// Best-effort preview, video only
    pub thumbnail: Option<Vec<u8>>,
}

/// Capability set exposed by the upstream client library.
///
/// One active socket at a time: callers must disconnect before reconnecting.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the socket. Fails with [`TransportError::AlreadyConnected`] if
    /// a socket is already up.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tear the socket down. Idempotent; returns only once the socket is
    /// fully closed.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Subscribe to the QR linking sequence. Finite and non-restartable:
    /// the channel closes when linking succeeds or the attempt is abandoned.
    /// Must be called before `connect` or the first code may be lost.
    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrCode>, TransportError>;

    /// Subscribe to upstream events for the life of this transport.
    /// Delivery order is preserved.
    async fn event_stream(&self) -> mpsc::Receiver<InboundEvent>;

    async fn send_text(
        &self,
        recipient: &str,
        body: &str,
        message_id: &str,
    ) -> Result<SendAck, TransportError>;

    async fn upload_media(
        &self,
        bytes: &[u8],
        kind: MediaKind,
    ) -> Result<MediaRef, TransportError>;

    async fn send_media(
        &self,
        recipient: &str,
        message: &MediaMessage,
        message_id: &str,
    ) -> Result<SendAck, TransportError>;

    async fn mark_read(
        &self,
        message_ids: &[String],
        from: &str,
        to: &str,
        at: DateTime<Utc>,
    ) -> Result<(), TransportError>;

    /// Log the device out upstream. Requires a connected socket.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Present iff the device has completed linking at least once
    fn device_id(&self) -> Option<String>;

    /// All contacts known to the linked account
    async fn contacts(&self) -> Result<Vec<Contact>, TransportError>;

    /// Ask the upstream to resync the contact list
    async fn refresh_contacts(&self) -> Result<(), TransportError>;
}

/// Constructs a transport for one (user, store) pair.
///
/// The supervisor owns a factory rather than a concrete transport type so
/// tests and dev mode can swap in the loopback implementation.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        user: &str,
        store: Arc<DeviceStore>,
    ) -> Result<Arc<dyn Transport>, PosternError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_drop_detection() {
        assert!(TransportError::WebsocketDropped("gone".into()).is_websocket_dropped());
        assert!(TransportError::Upstream("websocket closed by peer".into()).is_websocket_dropped());
        assert!(!TransportError::Upstream("server rate limit".into()).is_websocket_dropped());
        assert!(!TransportError::NotConnected.is_websocket_dropped());
        assert!(!TransportError::Timeout.is_websocket_dropped());
    }

    #[test]
    fn test_media_kind_round_trip() {
        for kind in [MediaKind::Image, MediaKind::Video, MediaKind::File] {
            assert_eq!(MediaKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::parse("audio"), None);
    }

    #[test]
    fn test_transport_error_mapping() {
        let err: PosternError = TransportError::Timeout.into();
        assert!(matches!(err, PosternError::Timeout(_)));

        let err: PosternError = TransportError::Upload("too large".into()).into();
        assert!(matches!(err, PosternError::Upload(_)));

        let err: PosternError = TransportError::NotConnected.into();
        assert!(matches!(err, PosternError::Transport(_)));
    }
}
