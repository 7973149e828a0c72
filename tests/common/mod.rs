#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

use rust_dating_chat::common::{
    Attachment, ConversationDetails, ConversationId, ConversationSummary, MessageId,
    OutgoingMessage, Participant, ServerMessage, SyncEvent, UserId,
};
use rust_dating_chat::error::{ApiError, TransportError};
use rust_dating_chat::network::{ChatApi, RealtimeTransport};
use rust_dating_chat::sync::{ConversationSync, SyncSettings};

pub const LOCAL_USER: UserId = 1;
pub const PEER: UserId = 2;

pub fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

pub fn server_message(id: i64, conversation: ConversationId, text: &str, sender: UserId, secs: i64) -> ServerMessage {
    ServerMessage {
        id,
        conversation_id: Some(conversation),
        content: text.to_string(),
        sender_id: Some(sender),
        timestamp: Some(at(secs)),
        created_at: None,
        read: false,
        kind: Some("text".to_string()),
        attachment_url: None,
        deleted: false,
        edited: false,
    }
}

/// How the mock answers an acknowledged emit.
#[derive(Debug, Clone)]
pub enum AckPolicy {
    /// `{"ok": true}`, plus a server copy of the message for sends.
    Auto,
    Reply(Value),
    /// Never answers.
    Never,
    /// Waits for [`MockTransport::release`], then answers like `Auto`.
    Gated,
    /// The connection drops before the answer.
    Fail,
}

struct TransportInner {
    connected: AtomicBool,
    emits: Mutex<Vec<(String, Value)>>,
    policies: Mutex<HashMap<String, AckPolicy>>,
    gate: Notify,
    next_message_id: AtomicI64,
}

/// In-memory transport recording every emit in order.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<TransportInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TransportInner {
                connected: AtomicBool::new(true),
                emits: Mutex::new(Vec::new()),
                policies: Mutex::new(HashMap::new()),
                gate: Notify::new(),
                next_message_id: AtomicI64::new(100),
            }),
        }
    }

    pub fn set_policy(&self, event: &str, policy: AckPolicy) {
        self.inner
            .policies
            .lock()
            .unwrap()
            .insert(event.to_string(), policy);
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_next_message_id(&self, id: i64) {
        self.inner.next_message_id.store(id, Ordering::SeqCst);
    }

    /// Let one gated emit answer.
    pub fn release(&self) {
        self.inner.gate.notify_one();
    }

    pub fn emitted(&self) -> Vec<String> {
        self.inner
            .emits
            .lock()
            .unwrap()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn payloads(&self, event: &str) -> Vec<Value> {
        self.inner
            .emits
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn count(&self, event: &str) -> usize {
        self.payloads(event).len()
    }

    fn record(&self, event: &str, payload: &Value) {
        self.inner
            .emits
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
    }

    fn policy(&self, event: &str) -> AckPolicy {
        self.inner
            .policies
            .lock()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or(AckPolicy::Auto)
    }

    fn auto_reply(&self, event: &str, payload: &Value) -> Value {
        if event != "send_message" {
            return json!({ "ok": true });
        }
        let id = self.inner.next_message_id.fetch_add(1, Ordering::SeqCst);
        json!({
            "ok": true,
            "message": {
                "id": id,
                "conversation_id": payload["conversation_id"],
                "content": payload["content"],
                "sender_id": LOCAL_USER,
                "timestamp": Utc::now(),
                "type": payload["type"],
                "attachment_url": payload.get("attachment_url").cloned().unwrap_or(Value::Null),
            }
        })
    }
}

impl RealtimeTransport for MockTransport {
    async fn emit_with_ack(&self, event: &str, payload: Value) -> Result<Value, TransportError> {
        self.record(event, &payload);
        match self.policy(event) {
            AckPolicy::Auto => Ok(self.auto_reply(event, &payload)),
            AckPolicy::Reply(reply) => Ok(reply),
            AckPolicy::Never => std::future::pending::<Result<Value, TransportError>>().await,
            AckPolicy::Gated => {
                self.inner.gate.notified().await;
                Ok(self.auto_reply(event, &payload))
            }
            AckPolicy::Fail => Err(TransportError::ConnectionLost),
        }
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.record(event, &payload);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct ApiInner {
    history: Mutex<HashMap<ConversationId, Vec<ServerMessage>>>,
    summaries: Mutex<Vec<ConversationSummary>>,
    existing: Mutex<HashMap<UserId, ConversationId>>,
    calls: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutgoingMessage>>,
    uploaded: Mutex<Vec<Attachment>>,
    failing: AtomicBool,
    expired: AtomicBool,
    upload_fails: AtomicBool,
    held: Mutex<HashSet<ConversationId>>,
    history_gate: Notify,
    next_message_id: AtomicI64,
}

/// In-memory REST backend.
#[derive(Clone, Default)]
pub struct MockApi {
    inner: Arc<ApiInner>,
}

impl MockApi {
    pub fn new() -> Self {
        let api = Self::default();
        api.inner.next_message_id.store(500, Ordering::SeqCst);
        api
    }

    pub fn set_history(&self, id: ConversationId, messages: Vec<ServerMessage>) {
        self.inner.history.lock().unwrap().insert(id, messages);
    }

    pub fn set_summaries(&self, summaries: Vec<ConversationSummary>) {
        *self.inner.summaries.lock().unwrap() = summaries;
    }

    pub fn add_existing(&self, peer: UserId, id: ConversationId) {
        self.inner.existing.lock().unwrap().insert(peer, id);
    }

    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    pub fn expire_session(&self) {
        self.inner.expired.store(true, Ordering::SeqCst);
    }

    pub fn fail_uploads(&self) {
        self.inner.upload_fails.store(true, Ordering::SeqCst);
    }

    /// Hold history fetches for `id` until [`release_history`](Self::release_history).
    pub fn hold_history(&self, id: ConversationId) {
        self.inner.held.lock().unwrap().insert(id);
    }

    pub fn release_history(&self) {
        self.inner.history_gate.notify_one();
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> usize {
        self.inner.uploaded.lock().unwrap().len()
    }

    fn call(&self, name: String) -> Result<(), ApiError> {
        self.inner.calls.lock().unwrap().push(name);
        if self.inner.expired.load(Ordering::SeqCst) {
            return Err(ApiError::SessionExpired);
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                message: "HTTP error! status: 503".to_string(),
            });
        }
        Ok(())
    }

    fn details(id: ConversationId) -> ConversationDetails {
        ConversationDetails {
            id,
            participants: vec![
                Participant {
                    id: LOCAL_USER,
                    name: "Me".to_string(),
                    is_online: true,
                    last_seen: None,
                    profile_picture: None,
                },
                Participant {
                    id: PEER,
                    name: "Alex".to_string(),
                    is_online: false,
                    last_seen: None,
                    profile_picture: None,
                },
            ],
            is_match: true,
        }
    }
}

impl ChatApi for MockApi {
    async fn conversation(&self, id: ConversationId) -> Result<ConversationDetails, ApiError> {
        self.call(format!("conversation:{id}"))?;
        Ok(Self::details(id))
    }

    async fn messages(&self, id: ConversationId) -> Result<Vec<ServerMessage>, ApiError> {
        let held = self.inner.held.lock().unwrap().remove(&id);
        self.inner.calls.lock().unwrap().push(format!("messages:{id}"));
        if held {
            self.inner.history_gate.notified().await;
        }
        if self.inner.expired.load(Ordering::SeqCst) {
            return Err(ApiError::SessionExpired);
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 503,
                message: "HTTP error! status: 503".to_string(),
            });
        }
        Ok(self
            .inner
            .history
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .unwrap_or_default())
    }

    async fn conversations(&self) -> Result<Vec<ConversationSummary>, ApiError> {
        self.call("conversations".to_string())?;
        Ok(self.inner.summaries.lock().unwrap().clone())
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<ServerMessage, ApiError> {
        self.call(format!("send:{}", message.conversation_id))?;
        self.inner.sent.lock().unwrap().push(message.clone());
        let id = self.inner.next_message_id.fetch_add(1, Ordering::SeqCst);
        let mut reply = server_message(id, message.conversation_id, &message.content, LOCAL_USER, 0);
        reply.timestamp = Some(Utc::now());
        reply.attachment_url = message.attachment_url.clone();
        Ok(reply)
    }

    async fn mark_read(&self, id: ConversationId) -> Result<(), ApiError> {
        self.call(format!("mark_read:{id}"))
    }

    async fn clear_conversation(&self, id: ConversationId) -> Result<(), ApiError> {
        self.call(format!("clear:{id}"))
    }

    async fn delete_conversation(&self, id: ConversationId) -> Result<(), ApiError> {
        self.call(format!("delete:{id}"))
    }

    async fn upload(
        &self,
        conversation_id: ConversationId,
        attachment: Attachment,
    ) -> Result<String, ApiError> {
        self.call(format!("upload:{conversation_id}"))?;
        if self.inner.upload_fails.load(Ordering::SeqCst) {
            return Err(ApiError::Status {
                status: 413,
                message: "file rejected".to_string(),
            });
        }
        let url = format!("https://cdn.test/{}", attachment.file_name);
        self.inner.uploaded.lock().unwrap().push(attachment);
        Ok(url)
    }

    async fn find_conversation_with(
        &self,
        user_id: UserId,
    ) -> Result<Option<ConversationId>, ApiError> {
        self.call(format!("exists:{user_id}"))?;
        Ok(self.inner.existing.lock().unwrap().get(&user_id).copied())
    }

    async fn create_conversation(&self, user_id: UserId) -> Result<ConversationDetails, ApiError> {
        self.call(format!("create:{user_id}"))?;
        let id = 900 + user_id;
        self.inner.existing.lock().unwrap().insert(user_id, id);
        Ok(Self::details(id))
    }
}

pub type TestSync = ConversationSync<MockTransport, MockApi>;

pub struct Harness {
    pub sync: Arc<TestSync>,
    pub transport: MockTransport,
    pub api: MockApi,
    pub events: mpsc::Receiver<SyncEvent>,
}

pub fn harness() -> Harness {
    harness_with(SyncSettings {
        join_timeout: Duration::from_secs(8),
        send_timeout: Duration::from_secs(8),
        http_fallback: true,
        max_upload_bytes: 10 * 1024 * 1024,
        surface_after_failures: None,
    })
}

pub fn harness_with(settings: SyncSettings) -> Harness {
    let transport = MockTransport::new();
    let api = MockApi::new();
    let (tx, events) = mpsc::channel(1024);
    let sync = ConversationSync::new(transport.clone(), api.clone(), LOCAL_USER, settings, tx);
    Harness {
        sync,
        transport,
        api,
        events,
    }
}

/// Yield until `check` holds; panics if it never does.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

pub fn drain(events: &mut mpsc::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

pub fn local_ids(ids: &[MessageId]) -> usize {
    ids.iter().filter(|id| id.is_local()).count()
}
