//! In-process loopback transport
//!
//! Stands in for the upstream client library in dev mode and in the test
//! suite. Behaves like the real thing at the seam: one socket at a time,
//! QR sequences subscribed before connect, events in order, and scriptable
//! failures for exercising the recovery paths.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Contact, InboundEvent, MediaKind, MediaMessage, MediaRef, QrCode, SendAck, Transport,
    TransportError, TransportFactory,
};
use crate::store::{Device, DeviceStore};
use crate::types::PosternError;

/// How long a generated QR code stays valid, in seconds
const QR_TTL_SECS: i64 = 60;

/// Delay before auto-linking completes in dev mode
const AUTO_LINK_DELAY: Duration = Duration::from_secs(2);

/// A message recorded by the loopback transport
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub recipient: String,
    pub kind: Option<MediaKind>,
    pub body: String,
    pub message_id: String,
    pub caption: Option<String>,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Default)]
struct Script {
    qr_codes: VecDeque<String>,
    stall_qr: bool,
    connect_failures: VecDeque<TransportError>,
    send_failures: VecDeque<TransportError>,
    upload_failures: VecDeque<TransportError>,
    send_delay: Option<Duration>,
}

/// Loopback transport for one user
pub struct MemoryTransport {
    user: String,
    store: Arc<DeviceStore>,
    auto_link: bool,
    connected: AtomicBool,
    events_tx: Mutex<Option<mpsc::Sender<InboundEvent>>>,
    script: Mutex<Script>,
    sent: Mutex<Vec<SentMessage>>,
    contacts: Mutex<Vec<Contact>>,
}

impl MemoryTransport {
    pub fn new(user: &str, store: Arc<DeviceStore>, auto_link: bool) -> Self {
        Self {
            user: user.to_string(),
            store,
            auto_link,
            connected: AtomicBool::new(false),
            events_tx: Mutex::new(None),
            script: Mutex::new(Script::default()),
            sent: Mutex::new(Vec::new()),
            contacts: Mutex::new(Vec::new()),
        }
    }

    /// Deliver an event to the session pump, observing queue backpressure
    pub async fn emit(&self, event: InboundEvent) {
        let tx = self.events_tx.lock().expect("events lock poisoned").clone();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Queue a QR code for the next linking attempt
    pub fn push_qr(&self, code: &str) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .qr_codes
            .push_back(code.to_string());
    }

    /// Make the next QR sequence emit nothing (the code never arrives)
    pub fn stall_qr(&self) {
        self.script.lock().expect("script lock poisoned").stall_qr = true;
    }

    /// Fail the next connect attempt with the given error
    pub fn fail_next_connect(&self, err: TransportError) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .connect_failures
            .push_back(err);
    }

    /// Fail the next send attempt with the given error.
    /// A websocket-drop error also tears the socket down, like the real one.
    pub fn fail_next_send(&self, err: TransportError) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .send_failures
            .push_back(err);
    }

    /// Stall every send by the given duration (None clears)
    pub fn set_send_delay(&self, delay: Option<Duration>) {
        self.script.lock().expect("script lock poisoned").send_delay = delay;
    }

    /// Fail the next media upload
    pub fn fail_next_upload(&self, err: TransportError) {
        self.script
            .lock()
            .expect("script lock poisoned")
            .upload_failures
            .push_back(err);
    }

    /// Complete linking: persist the device identity and report the
    /// authenticated socket.
    pub async fn complete_link(&self, device_id: &str) {
        let _ = self.store.save(Device {
            id: Some(device_id.to_string()),
            push_name: None,
            platform: Some("loopback".to_string()),
            registered_at: Some(Utc::now()),
        });
        info!("Loopback link completed for {}", self.user);
        self.emit(InboundEvent::Connected).await;
    }

    /// Drop the socket as if the upstream closed it
    pub async fn simulate_drop(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(InboundEvent::Disconnected).await;
    }

    /// Seed the contact list returned by `contacts()`
    pub fn set_contacts(&self, contacts: Vec<Contact>) {
        *self.contacts.lock().expect("contacts lock poisoned") = contacts;
    }

    /// Messages recorded so far
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().expect("sent lock poisoned").len()
    }

    fn record(&self, message: SentMessage) {
        self.sent.lock().expect("sent lock poisoned").push(message);
    }

    fn send_delay(&self) -> Option<Duration> {
        self.script.lock().expect("script lock poisoned").send_delay
    }

    fn take_send_failure(&self) -> Option<TransportError> {
        let err = self
            .script
            .lock()
            .expect("script lock poisoned")
            .send_failures
            .pop_front();
        if let Some(ref e) = err {
            if e.is_websocket_dropped() {
                self.connected.store(false, Ordering::SeqCst);
            }
        }
        err
    }

    fn ack() -> SendAck {
        SendAck {
            message_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        if let Some(err) = self
            .script
            .lock()
            .expect("script lock poisoned")
            .connect_failures
            .pop_front()
        {
            return Err(err);
        }

        self.connected.store(true, Ordering::SeqCst);
        debug!("Loopback transport connected for {}", self.user);

        // A linked device authenticates as soon as the socket is up
        if self.auto_link && self.device_id().is_some() {
            self.emit(InboundEvent::Connected).await;
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            debug!("Loopback transport disconnected for {}", self.user);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn qr_channel(&self) -> Result<mpsc::Receiver<QrCode>, TransportError> {
        if self.device_id().is_some() {
            return Err(TransportError::Upstream("device already linked".into()));
        }

        let (tx, rx) = mpsc::channel(8);
        let codes: Vec<String> = {
            let mut script = self.script.lock().expect("script lock poisoned");
            if script.stall_qr {
                script.stall_qr = false;
                // Hold the sender so the sequence stays open without a code
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    drop(tx);
                });
                Vec::new()
            } else if script.qr_codes.is_empty() {
                vec![format!("postern-link:{}", Uuid::new_v4())]
            } else {
                script.qr_codes.drain(..).collect()
            }
        };

        for code in codes {
            let _ = tx
                .send(QrCode {
                    code,
                    expires_at: Utc::now() + ChronoDuration::seconds(QR_TTL_SECS),
                })
                .await;
        }

        // Dev mode: pretend the phone scans the code shortly after connect
        if self.auto_link {
            let store = Arc::clone(&self.store);
            let user = self.user.clone();
            let events_tx = self.events_tx.lock().expect("events lock poisoned").clone();
            tokio::spawn(async move {
                tokio::time::sleep(AUTO_LINK_DELAY).await;
                let _ = store.save(Device {
                    id: Some(format!("loopback:{}", Uuid::new_v4())),
                    push_name: None,
                    platform: Some("loopback".to_string()),
                    registered_at: Some(Utc::now()),
                });
                info!("Loopback auto-link completed for {}", user);
                if let Some(tx) = events_tx {
                    let _ = tx.send(InboundEvent::Connected).await;
                }
            });
        }

        Ok(rx)
    }

    async fn event_stream(&self) -> mpsc::Receiver<InboundEvent> {
        let (tx, rx) = mpsc::channel(64);
        *self.events_tx.lock().expect("events lock poisoned") = Some(tx);
        rx
    }

    async fn send_text(
        &self,
        recipient: &str,
        body: &str,
        message_id: &str,
    ) -> Result<SendAck, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(delay) = self.send_delay() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.take_send_failure() {
            return Err(err);
        }

        self.record(SentMessage {
            recipient: recipient.to_string(),
            kind: None,
            body: body.to_string(),
            message_id: message_id.to_string(),
            caption: None,
            file_name: None,
            mime_type: None,
        });
        Ok(Self::ack())
    }

    async fn upload_media(
        &self,
        bytes: &[u8],
        _kind: MediaKind,
    ) -> Result<MediaRef, TransportError> {
        if let Some(err) = self
            .script
            .lock()
            .expect("script lock poisoned")
            .upload_failures
            .pop_front()
        {
            return Err(err);
        }

        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(bytes);
        Ok(MediaRef {
            url: format!("loopback://media/{}", Uuid::new_v4()),
            direct_path: "/loopback".to_string(),
            media_key: digest[..16].to_vec(),
            file_sha256: digest.to_vec(),
            file_length: bytes.len() as u64,
        })
    }

    async fn send_media(
        &self,
        recipient: &str,
        message: &MediaMessage,
        message_id: &str,
    ) -> Result<SendAck, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if let Some(err) = self.take_send_failure() {
            return Err(err);
        }

        self.record(SentMessage {
            recipient: recipient.to_string(),
            kind: Some(message.kind),
            body: message.media.url.clone(),
            message_id: message_id.to_string(),
            caption: message.caption.clone(),
            file_name: message.file_name.clone(),
            mime_type: Some(message.mime_type.clone()),
        });
        Ok(Self::ack())
    }

    async fn mark_read(
        &self,
        _message_ids: &[String],
        _from: &str,
        _to: &str,
        _at: DateTime<Utc>,
    ) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    async fn logout(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        // Upstream logout wipes the device credentials
        let _ = self.store.save(Device::default());
        self.emit(InboundEvent::LoggedOut {
            reason: "user initiated".to_string(),
            on_connect: false,
        })
        .await;
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn device_id(&self) -> Option<String> {
        self.store.first_device().ok().and_then(|d| d.id)
    }

    async fn contacts(&self) -> Result<Vec<Contact>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(self.contacts.lock().expect("contacts lock poisoned").clone())
    }

    async fn refresh_contacts(&self) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        // The loopback list is whatever was seeded; nothing to resync
        debug!("Contact refresh requested for {}", self.user);
        Ok(())
    }
}

/// Factory for loopback transports.
///
/// Keeps a handle to every transport it creates so tests can script
/// failures and inspect recorded sends.
pub struct MemoryTransportFactory {
    auto_link: bool,
    created: Mutex<HashMap<String, Vec<Arc<MemoryTransport>>>>,
}

impl MemoryTransportFactory {
    pub fn new(auto_link: bool) -> Self {
        Self {
            auto_link,
            created: Mutex::new(HashMap::new()),
        }
    }

    /// The most recent transport created for a user, if any
    pub fn get(&self, user: &str) -> Option<Arc<MemoryTransport>> {
        self.created
            .lock()
            .expect("created lock poisoned")
            .get(user)
            .and_then(|v| v.last().cloned())
    }

    /// How many transports have been created for a user
    pub fn create_count(&self, user: &str) -> usize {
        self.created
            .lock()
            .expect("created lock poisoned")
            .get(user)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn create(
        &self,
        user: &str,
        store: Arc<DeviceStore>,
    ) -> Result<Arc<dyn Transport>, PosternError> {
        let transport = Arc::new(MemoryTransport::new(user, store, self.auto_link));
        self.created
            .lock()
            .expect("created lock poisoned")
            .entry(user.to_string())
            .or_default()
            .push(Arc::clone(&transport));
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreManager;
    use tempfile::TempDir;

    fn transport() -> (TempDir, Arc<MemoryTransport>) {
        let dir = TempDir::new().unwrap();
        let manager = StoreManager::new(dir.path().to_path_buf());
        let store = Arc::new(manager.open("alice").unwrap());
        (dir, Arc::new(MemoryTransport::new("alice", store, false)))
    }

    #[tokio::test]
    async fn test_connect_is_exclusive() {
        let (_dir, t) = transport();
        t.connect().await.unwrap();
        assert!(t.is_connected());
        assert!(matches!(
            t.connect().await,
            Err(TransportError::AlreadyConnected)
        ));

        t.disconnect().await;
        assert!(!t.is_connected());
        t.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (_dir, t) = transport();
        assert!(matches!(
            t.send_text("12025550100", "hi", "m1").await,
            Err(TransportError::NotConnected)
        ));

        t.connect().await.unwrap();
        t.send_text("12025550100", "hi", "m1").await.unwrap();
        assert_eq!(t.sent_count(), 1);
        assert_eq!(t.sent()[0].recipient, "12025550100");
    }

    #[tokio::test]
    async fn test_scripted_drop_tears_socket_down() {
        let (_dir, t) = transport();
        t.connect().await.unwrap();
        t.fail_next_send(TransportError::WebsocketDropped("mid-send".into()));

        let err = t.send_text("12025550100", "hi", "m1").await.unwrap_err();
        assert!(err.is_websocket_dropped());
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_qr_channel_rejects_linked_device() {
        let (_dir, t) = transport();
        t.complete_link("device-1").await;
        assert!(t.qr_channel().await.is_err());
    }

    #[tokio::test]
    async fn test_qr_channel_emits_scripted_codes_in_order() {
        let (_dir, t) = transport();
        t.push_qr("code-1");
        t.push_qr("code-2");
        let mut rx = t.qr_channel().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().code, "code-1");
        assert_eq!(rx.recv().await.unwrap().code, "code-2");
    }

    #[tokio::test]
    async fn test_logout_unlinks_device() {
        let (_dir, t) = transport();
        t.complete_link("device-1").await;
        assert!(t.device_id().is_some());

        t.connect().await.unwrap();
        t.logout().await.unwrap();
        assert!(t.device_id().is_none());
        assert!(!t.is_connected());
    }

    #[tokio::test]
    async fn test_event_stream_preserves_order() {
        let (_dir, t) = transport();
        let mut rx = t.event_stream().await;
        t.emit(InboundEvent::Connected).await;
        t.emit(InboundEvent::Disconnected).await;

        assert!(matches!(rx.recv().await.unwrap(), InboundEvent::Connected));
        assert!(matches!(
            rx.recv().await.unwrap(),
            InboundEvent::Disconnected
        ));
    }
}
