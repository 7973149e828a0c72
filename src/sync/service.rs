use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::common::events::{MessageEdit, MessageRemoval, ReadReceipt};
use crate::common::{
    AckReply, Attachment, ConversationDetails, ConversationId, ConversationSummary, Message,
    MessageId, MessageKind, OutgoingMessage, Participant, Presence, PushEvent, ServerMessage,
    SyncEvent, TransportEvent, UserId,
};
use crate::config::AppConfig;
use crate::error::{ApiError, Result, SyncError};
use crate::network::api::ChatApi;
use crate::network::transport::{self, RealtimeTransport};

use super::inbox::Inbox;
use super::room::{RoomMembership, RoomPhase};
use super::send::{SendMachine, SendPhase};
use super::timeline::{MessageRevision, Timeline};

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub join_timeout: Duration,
    pub send_timeout: Duration,
    pub http_fallback: bool,
    pub max_upload_bytes: u64,
    /// Surface history errors after this many failures in a row even
    /// while messages are shown. `None` keeps them quiet.
    pub surface_after_failures: Option<u32>,
}

impl From<&AppConfig> for SyncSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            join_timeout: config.join_timeout(),
            send_timeout: config.send_timeout(),
            http_fallback: config.http_fallback,
            max_upload_bytes: config.max_upload_bytes,
            surface_after_failures: config.surface_history_errors_after,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    Applied { messages: usize },
    /// The user moved on before the fetch finished; nothing was changed.
    Stale,
}

/// Snapshot of one conversation for display.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationView {
    pub id: ConversationId,
    pub peer: Option<Participant>,
    pub is_match: bool,
    pub room_joined: bool,
    pub messages: Vec<Message>,
}

#[derive(Debug, Default)]
struct Conversation {
    details: Option<ConversationDetails>,
    timeline: Timeline,
}

#[derive(Debug, Clone, Copy)]
struct LoadTicket {
    focus_epoch: u64,
    seq: u64,
}

#[derive(Default)]
struct SyncState {
    conversations: HashMap<ConversationId, Conversation>,
    active: Option<ConversationId>,
    /// Bumped whenever the active conversation changes.
    focus_epoch: u64,
    room: RoomMembership,
    sends: HashMap<MessageId, SendMachine>,
    /// Optimistic ids already replaced by a push of the same message.
    echoes: HashMap<MessageId, MessageId>,
    inbox: Inbox,
    load_seq: HashMap<ConversationId, u64>,
    failed_loads: HashMap<ConversationId, u32>,
}

impl SyncState {
    fn is_active(&self, id: ConversationId) -> bool {
        self.active == Some(id)
    }

    fn advance(&mut self, id: &MessageId, to: SendPhase) {
        if let Some(machine) = self.sends.get_mut(id) {
            if let Err(err) = machine.advance(to) {
                log::error!("Message {id}: {err}");
            }
        }
    }

    /// Mark a send confirmed and stop tracking it.
    fn finish(&mut self, id: &MessageId) {
        self.advance(id, SendPhase::Confirmed);
        self.sends.remove(id);
        self.echoes.remove(id);
    }

    /// Forget the sends behind any local message in `messages`.
    fn forget_sends(&mut self, messages: &[Message]) {
        for message in messages.iter().filter(|m| m.id.is_local()) {
            self.sends.remove(&message.id);
            self.echoes.remove(&message.id);
        }
    }

    /// Optimistic messages whose send is waiting on its ack.
    fn awaiting_ack(&self) -> HashSet<MessageId> {
        self.sends
            .iter()
            .filter(|(_, machine)| machine.phase() == SendPhase::AwaitingAck)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn is_current_load(&self, id: ConversationId, ticket: LoadTicket) -> bool {
        self.focus_epoch == ticket.focus_epoch && self.load_seq.get(&id) == Some(&ticket.seq)
    }

    /// Conversation holding `message`, preferring the one the event named.
    fn locate(&self, hint: Option<ConversationId>, message: &MessageId) -> Option<ConversationId> {
        let holds = |id: &ConversationId| {
            self.conversations
                .get(id)
                .is_some_and(|c| c.timeline.contains(message))
        };
        hint.filter(holds)
            .or_else(|| self.conversations.keys().copied().find(|id| holds(id)))
    }
}

/// Keeps one message list per conversation in step with REST history,
/// optimistic sends and socket pushes, and keeps the live connection
/// subscribed to the room of the conversation in use.
///
/// Shared as `Arc<ConversationSync<..>>`. State sits behind a single
/// mutex that is never held across network calls, so pushes and user
/// actions interleave freely at every await point.
pub struct ConversationSync<T, A> {
    transport: T,
    api: A,
    local_user: UserId,
    settings: SyncSettings,
    state: Mutex<SyncState>,
    join_lock: Mutex<()>,
    events: mpsc::Sender<SyncEvent>,
}

impl<T: RealtimeTransport, A: ChatApi> ConversationSync<T, A> {
    pub fn new(
        transport: T,
        api: A,
        local_user: UserId,
        settings: SyncSettings,
        events: mpsc::Sender<SyncEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            api,
            local_user,
            settings,
            state: Mutex::new(SyncState::default()),
            join_lock: Mutex::new(()),
            events,
        })
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    // ----- conversation focus -----

    /// Make `id` the active conversation: leave the previous room, load
    /// history, then join the room and mark it read in the background.
    pub async fn open_conversation(self: &Arc<Self>, id: ConversationId) -> Result<HistoryOutcome> {
        let previous = {
            let mut state = self.state.lock().await;
            if state.active != Some(id) {
                state.active = Some(id);
                state.focus_epoch += 1;
            }
            // A join still in flight keeps its room; the next join for
            // `id` leaves it.
            state.room.leave_joined_other_than(id)
        };
        if let Some(previous) = previous {
            self.emit_leave(previous);
        }
        log::info!("Opened conversation {id}");

        let outcome = self.load_history(id).await;
        if !matches!(&outcome, Err(err) if err.is_session_expired()) {
            self.mark_read(id);
        }
        outcome
    }

    /// Stop following the active conversation. In-flight sends still
    /// finish and update its list in the background.
    pub async fn close_conversation(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            state.active = None;
            state.focus_epoch += 1;
            state.room.leave_joined()
        };
        if let Some(previous) = previous {
            self.emit_leave(previous);
        }
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.state.lock().await.active
    }

    // ----- history -----

    /// Fetch metadata and history and replace the local list with them.
    ///
    /// On failure the list is left alone. The returned
    /// [`SyncError::HistoryUnavailable`] says whether the failure should
    /// be shown: when nothing is displayed yet, or, if
    /// `surface_after_failures` is set, once failures have repeated that
    /// many times in a row.
    pub async fn load_history(&self, id: ConversationId) -> Result<HistoryOutcome> {
        let ticket = {
            let mut state = self.state.lock().await;
            let focus_epoch = state.focus_epoch;
            let seq = state.load_seq.entry(id).or_insert(0);
            *seq += 1;
            LoadTicket {
                focus_epoch,
                seq: *seq,
            }
        };

        let fetched = tokio::try_join!(self.api.conversation(id), self.api.messages(id));

        let mut state = self.state.lock().await;
        if let Err(ApiError::SessionExpired) = &fetched {
            drop(state);
            self.notify(SyncEvent::SessionExpired);
            return Err(SyncError::SessionExpired);
        }
        if !state.is_current_load(id, ticket) {
            log::warn!("Discarding stale history for conversation {id}");
            return Ok(HistoryOutcome::Stale);
        }

        match fetched {
            Ok((details, history)) => {
                state.failed_loads.remove(&id);
                let messages: Vec<Message> = history
                    .into_iter()
                    .map(|m| m.into_message(self.local_user))
                    .collect();
                let conversation = state.conversations.entry(id).or_default();
                conversation.details = Some(details);
                conversation.timeline.replace_with_history(messages);
                let count = conversation.timeline.len();
                drop(state);

                log::info!("Loaded {count} messages for conversation {id}");
                self.notify(SyncEvent::MessagesChanged(id));
                Ok(HistoryOutcome::Applied { messages: count })
            }
            Err(err) => {
                let failures = state.failed_loads.entry(id).or_insert(0);
                *failures += 1;
                let consecutive_failures = *failures;
                let displayed = state
                    .conversations
                    .get(&id)
                    .map_or(0, |c| c.timeline.len());
                let surface = displayed == 0
                    || self
                        .settings
                        .surface_after_failures
                        .is_some_and(|after| consecutive_failures >= after);
                log::warn!(
                    "History for conversation {id} failed ({consecutive_failures} in a row, {displayed} shown): {err}"
                );
                Err(SyncError::HistoryUnavailable {
                    conversation_id: id,
                    displayed,
                    consecutive_failures,
                    surface,
                    reason: err.to_string(),
                })
            }
        }
    }

    pub async fn load_inbox(&self) -> Result<usize> {
        let entries = self
            .api
            .conversations()
            .await
            .map_err(|err| self.api_failure(err))?;
        let count = entries.len();
        self.state.lock().await.inbox.replace(entries);
        log::info!("Loaded {count} conversations");
        self.notify(SyncEvent::InboxChanged);
        Ok(count)
    }

    /// Find the conversation with `peer`, creating it if there is none.
    pub async fn start_conversation(&self, peer: UserId) -> Result<ConversationId> {
        if let Some(id) = self
            .api
            .find_conversation_with(peer)
            .await
            .map_err(|err| self.api_failure(err))?
        {
            return Ok(id);
        }
        let details = self
            .api
            .create_conversation(peer)
            .await
            .map_err(|err| self.api_failure(err))?;
        log::info!("Started conversation {} with user {peer}", details.id);
        Ok(details.id)
    }

    // ----- room membership -----

    /// Join the room for `id` unless the current connection already has.
    /// Concurrent callers wait for a single join request.
    pub async fn ensure_room_joined(&self, id: ConversationId) -> Result<()> {
        let _guard = self.join_lock.lock().await;

        let (ticket, previous) = {
            let mut state = self.state.lock().await;
            if state.room.is_joined(id) {
                return Ok(());
            }
            let previous = state.room.other_than(id);
            (state.room.begin_join(id), previous)
        };
        if let Some(previous) = previous {
            self.emit_leave(previous);
        }

        log::info!("Joining conversation {id}");
        let reply = timeout(
            self.settings.join_timeout,
            self.transport
                .emit_with_ack(transport::JOIN_CONVERSATION, json!({ "conversation_id": id })),
        )
        .await;
        let result = match reply {
            Err(_) => Err(SyncError::JoinTimeout {
                conversation_id: id,
            }),
            Ok(Err(err)) => {
                log::warn!("join_conversation {id} failed: {err}");
                Err(SyncError::JoinTimeout {
                    conversation_id: id,
                })
            }
            Ok(Ok(value)) => {
                let ack = AckReply::from_value(value);
                if ack.ok {
                    Ok(())
                } else {
                    Err(SyncError::JoinRejected {
                        conversation_id: id,
                        reason: ack.rejection_reason("join refused by server"),
                    })
                }
            }
        };

        let mut state = self.state.lock().await;
        match result {
            Ok(()) if state.room.complete_join(ticket) => {
                drop(state);
                log::info!("Joined conversation {id}");
                self.notify(SyncEvent::RoomJoined(id));
                Ok(())
            }
            Ok(()) => {
                log::warn!("Join ack for conversation {id} arrived after the connection dropped");
                Err(SyncError::JoinTimeout {
                    conversation_id: id,
                })
            }
            Err(err) => {
                state.room.abort_join(ticket);
                drop(state);
                log::warn!("{err}");
                Err(err)
            }
        }
    }

    pub async fn is_room_joined(&self, id: ConversationId) -> bool {
        self.state.lock().await.room.is_joined(id)
    }

    pub async fn room_phase(&self) -> RoomPhase {
        self.state.lock().await.room.phase()
    }

    /// Notify the server that `id` has been read. Runs in the background
    /// and never holds up a send.
    pub fn mark_read(self: &Arc<Self>, id: ConversationId) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.deliver_read_receipt(id).await })
    }

    async fn deliver_read_receipt(&self, id: ConversationId) {
        let (inbox_changed, active) = {
            let mut state = self.state.lock().await;
            (state.inbox.mark_read(id), state.is_active(id))
        };
        if inbox_changed {
            self.notify(SyncEvent::InboxChanged);
        }

        if self.transport.is_connected() {
            if active {
                if let Err(err) = self.ensure_room_joined(id).await {
                    log::warn!("mark_read {id} skipped: {err}");
                    return;
                }
            }
            match self
                .transport
                .emit(transport::MARK_READ, json!({ "conversation_id": id }))
            {
                Ok(()) => log::debug!("Marked conversation {id} read"),
                Err(err) => log::warn!("mark_read {id} not sent: {err}"),
            }
        } else if self.settings.http_fallback {
            match self.api.mark_read(id).await {
                Ok(()) => log::debug!("Marked conversation {id} read over HTTP"),
                Err(err) => {
                    let err = self.api_failure(err);
                    log::warn!("mark_read {id} over HTTP failed: {err}");
                }
            }
        } else {
            log::debug!("mark_read {id} skipped while offline");
        }
    }

    // ----- sending -----

    /// Show `text` immediately as a pending message, then join the room
    /// and send it. On failure the message stays in the list, flagged
    /// failed, and only an explicit [`resend`](Self::resend) retries it.
    pub async fn send_message(&self, id: ConversationId, text: &str) -> Result<MessageId> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let local_id = self
            .insert_optimistic(id, Message::optimistic(text, MessageKind::Text))
            .await;
        self.deliver(id, local_id, OutgoingMessage::text(id, text)).await
    }

    pub async fn send_attachment(
        &self,
        id: ConversationId,
        attachment: Attachment,
    ) -> Result<MessageId> {
        let size = attachment.size();
        let limit = self.settings.max_upload_bytes;
        if size > limit {
            return Err(SyncError::AttachmentTooLarge { size, limit });
        }

        let label = attachment.label();
        let local_id = self
            .insert_optimistic(id, Message::optimistic(label, MessageKind::Attachment))
            .await;

        log::info!(
            "Uploading {} ({size} bytes) for conversation {id}",
            attachment.file_name
        );
        let url = match self.api.upload(id, attachment).await {
            Ok(url) => url,
            Err(ApiError::SessionExpired) => {
                return self.settle_failure(id, &local_id, SyncError::SessionExpired).await;
            }
            Err(err) => {
                let err = SyncError::UploadFailed {
                    reason: err.to_string(),
                };
                return self.settle_failure(id, &local_id, err).await;
            }
        };

        if let Some(conversation) = self.state.lock().await.conversations.get_mut(&id) {
            conversation.timeline.set_attachment_url(&local_id, url.clone());
        }
        self.deliver(id, local_id, OutgoingMessage::attachment(id, label, url))
            .await
    }

    /// Replace a failed message with a fresh send of the same content.
    pub async fn resend(&self, id: ConversationId, failed_id: &MessageId) -> Result<MessageId> {
        let (local_id, outgoing, active) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let unknown = || SyncError::UnknownMessage(failed_id.clone());

            let conversation = state.conversations.get_mut(&id).ok_or_else(unknown)?;
            let failed = conversation.timeline.get(failed_id).ok_or_else(unknown)?;
            if !failed.is_failed() {
                return Err(SyncError::NotResendable(failed_id.clone()));
            }
            let outgoing = match (failed.kind, &failed.attachment_url) {
                (MessageKind::Text, _) => OutgoingMessage::text(id, failed.text.clone()),
                (MessageKind::Attachment, Some(url)) => {
                    OutgoingMessage::attachment(id, failed.text.clone(), url.clone())
                }
                // The upload never finished; the file has to be picked again.
                (MessageKind::Attachment, None) => {
                    return Err(SyncError::NotResendable(failed_id.clone()));
                }
            };
            let mut retry = Message::optimistic(failed.text.clone(), failed.kind);
            retry.attachment_url = failed.attachment_url.clone();
            let local_id = retry.id.clone();

            conversation.timeline.remove(failed_id);
            conversation.timeline.insert(retry);
            state.sends.remove(failed_id);
            state.sends.insert(local_id.clone(), SendMachine::new());
            (local_id, outgoing, state.is_active(id))
        };

        log::info!("Resending {failed_id} as {local_id}");
        if active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        self.deliver(id, local_id, outgoing).await
    }

    /// Phase of a send still in flight or failed. Confirmed sends are
    /// no longer tracked.
    pub async fn send_phase(&self, id: &MessageId) -> Option<SendPhase> {
        self.state
            .lock()
            .await
            .sends
            .get(id)
            .map(SendMachine::phase)
    }

    /// Number of sends still in flight or failed.
    pub async fn tracked_sends(&self) -> usize {
        self.state.lock().await.sends.len()
    }

    async fn insert_optimistic(&self, id: ConversationId, message: Message) -> MessageId {
        let local_id = message.id.clone();
        let active = {
            let mut state = self.state.lock().await;
            state
                .conversations
                .entry(id)
                .or_default()
                .timeline
                .insert(message);
            state.sends.insert(local_id.clone(), SendMachine::new());
            state.is_active(id)
        };
        if active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        local_id
    }

    async fn deliver(
        &self,
        id: ConversationId,
        local_id: MessageId,
        outgoing: OutgoingMessage,
    ) -> Result<MessageId> {
        self.advance(&local_id, SendPhase::AwaitingJoin).await;

        let over_http = self.settings.http_fallback && !self.transport.is_connected();
        if !over_http {
            if let Err(err) = self.ensure_room_joined(id).await {
                return self.settle_failure(id, &local_id, err).await;
            }
        }

        self.advance(&local_id, SendPhase::AwaitingAck).await;
        let sent = if over_http {
            log::info!("Socket down, sending {local_id} over HTTP");
            self.send_over_http(&outgoing).await
        } else {
            self.send_over_socket(&outgoing).await
        };

        match sent {
            Ok(server) => Ok(self.confirm_send(id, &local_id, server).await),
            Err(err) => self.settle_failure(id, &local_id, err).await,
        }
    }

    async fn send_over_socket(&self, outgoing: &OutgoingMessage) -> Result<ServerMessage> {
        let conversation_id = outgoing.conversation_id;
        let reply = timeout(
            self.settings.send_timeout,
            self.transport
                .emit_with_ack(transport::SEND_MESSAGE, outgoing.to_payload()),
        )
        .await;

        let ack = match reply {
            Err(_) => return Err(SyncError::SendTimeout { conversation_id }),
            Ok(Err(err)) => {
                log::warn!("send_message to conversation {conversation_id} failed: {err}");
                return Err(SyncError::SendTimeout { conversation_id });
            }
            Ok(Ok(value)) => AckReply::from_value(value),
        };
        if !ack.ok {
            return Err(SyncError::SendRejected {
                reason: ack.rejection_reason("send rejected by server"),
            });
        }
        ack.message.ok_or_else(|| SyncError::SendRejected {
            reason: "acknowledgement carried no message".to_string(),
        })
    }

    async fn send_over_http(&self, outgoing: &OutgoingMessage) -> Result<ServerMessage> {
        match timeout(self.settings.send_timeout, self.api.send_message(outgoing)).await {
            Err(_) => Err(SyncError::SendTimeout {
                conversation_id: outgoing.conversation_id,
            }),
            Ok(Ok(message)) => Ok(message),
            Ok(Err(ApiError::SessionExpired)) => Err(SyncError::SessionExpired),
            Ok(Err(err)) => Err(SyncError::SendRejected {
                reason: err.to_string(),
            }),
        }
    }

    async fn confirm_send(
        &self,
        id: ConversationId,
        local_id: &MessageId,
        server: ServerMessage,
    ) -> MessageId {
        let mut message = server.into_message(self.local_user);
        message.sender_is_local_user = true;
        let server_id = message.id.clone();
        let (preview, at) = (message.text.clone(), message.timestamp);

        let (active, inbox_changed) = {
            let mut state = self.state.lock().await;
            state.echoes.remove(local_id);
            state.finish(local_id);
            if let Some(conversation) = state.conversations.get_mut(&id) {
                if !conversation.timeline.confirm(local_id, message) {
                    log::debug!("Message {server_id} was already delivered by push");
                }
            }
            (state.is_active(id), state.inbox.touch(id, &preview, at))
        };

        log::info!("Message {local_id} confirmed as {server_id} in conversation {id}");
        if active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        if inbox_changed {
            self.notify(SyncEvent::InboxChanged);
        }
        server_id
    }

    async fn settle_failure(
        &self,
        id: ConversationId,
        local_id: &MessageId,
        err: SyncError,
    ) -> Result<MessageId> {
        let mut state = self.state.lock().await;

        // A push already showed the message as delivered; the ack was lost.
        if let Some(server_id) = state.echoes.remove(local_id) {
            if state.sends.get(local_id).map(SendMachine::phase) == Some(SendPhase::AwaitingAck) {
                state.finish(local_id);
                log::info!("Message {local_id} arrived as {server_id} despite: {err}");
                return Ok(server_id);
            }
        }

        let reason = err.to_string();
        state.advance(local_id, SendPhase::Failed);
        if let Some(conversation) = state.conversations.get_mut(&id) {
            conversation.timeline.mark_failed(local_id, reason.clone());
        }
        let active = state.is_active(id);
        drop(state);

        log::warn!("Send of {local_id} to conversation {id} failed: {reason}");
        if err.is_session_expired() {
            self.notify(SyncEvent::SessionExpired);
        }
        if active {
            self.notify(SyncEvent::SendFailed {
                conversation_id: id,
                message_id: local_id.clone(),
                reason,
            });
        }
        Err(err)
    }

    async fn advance(&self, id: &MessageId, to: SendPhase) {
        self.state.lock().await.advance(id, to);
    }

    // ----- edits and deletes -----

    /// Change the text of one of our messages right away; the change is
    /// undone if the server refuses it or does not answer in time.
    pub async fn edit_message(
        &self,
        id: ConversationId,
        message_id: &MessageId,
        text: &str,
    ) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        let (server_id, revision, active) = {
            let mut state = self.state.lock().await;
            let timeline = &mut state
                .conversations
                .get_mut(&id)
                .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?
                .timeline;
            let server_id = mutable_target(timeline, message_id)?;
            let revision = timeline
                .apply_edit(message_id, text)
                .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?;
            (server_id, revision, state.is_active(id))
        };
        if active {
            self.notify(SyncEvent::MessagesChanged(id));
        }

        let payload = json!({
            "conversation_id": id,
            "message_id": server_id,
            "content": text,
        });
        self.settle_mutation(id, message_id, transport::EDIT_MESSAGE, payload, revision)
            .await
    }

    /// Replace one of our messages with the deleted placeholder; undone
    /// like [`edit_message`](Self::edit_message) on refusal.
    pub async fn delete_message(&self, id: ConversationId, message_id: &MessageId) -> Result<()> {
        let (server_id, revision, active) = {
            let mut state = self.state.lock().await;
            let timeline = &mut state
                .conversations
                .get_mut(&id)
                .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?
                .timeline;
            let server_id = mutable_target(timeline, message_id)?;
            let revision = timeline
                .apply_delete(message_id)
                .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?;
            (server_id, revision, state.is_active(id))
        };
        if active {
            self.notify(SyncEvent::MessagesChanged(id));
        }

        let payload = json!({ "conversation_id": id, "message_id": server_id });
        self.settle_mutation(id, message_id, transport::DELETE_MESSAGE, payload, revision)
            .await
    }

    async fn settle_mutation(
        &self,
        id: ConversationId,
        message_id: &MessageId,
        event: &str,
        payload: Value,
        revision: MessageRevision,
    ) -> Result<()> {
        let reply = timeout(
            self.settings.send_timeout,
            self.transport.emit_with_ack(event, payload),
        )
        .await;
        let refusal = match reply {
            Err(_) => Some("no acknowledgement from server".to_string()),
            Ok(Err(err)) => Some(err.to_string()),
            Ok(Ok(value)) => {
                let ack = AckReply::from_value(value);
                (!ack.ok).then(|| ack.rejection_reason("rejected by server"))
            }
        };
        let Some(reason) = refusal else {
            log::info!("{event} for message {message_id} acknowledged");
            return Ok(());
        };

        let active = {
            let mut state = self.state.lock().await;
            if let Some(conversation) = state.conversations.get_mut(&id) {
                conversation.timeline.restore(message_id, revision);
            }
            state.is_active(id)
        };
        log::warn!("{event} for message {message_id} reverted: {reason}");
        if active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        self.notify(SyncEvent::MutationReverted {
            conversation_id: id,
            message_id: message_id.clone(),
            reason: reason.clone(),
        });
        Err(SyncError::MutationRejected {
            message_id: message_id.clone(),
            reason,
        })
    }

    // ----- whole-conversation actions -----

    pub async fn clear_conversation(&self, id: ConversationId) -> Result<()> {
        self.api
            .clear_conversation(id)
            .await
            .map_err(|err| self.api_failure(err))?;
        let active = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if let Some(conversation) = state.conversations.get_mut(&id) {
                let cleared = conversation.timeline.clear();
                state.forget_sends(&cleared);
            }
            state.is_active(id)
        };
        log::info!("Cleared conversation {id}");
        if active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        Ok(())
    }

    pub async fn delete_conversation(&self, id: ConversationId) -> Result<()> {
        self.api
            .delete_conversation(id)
            .await
            .map_err(|err| self.api_failure(err))?;
        let left = {
            let mut state = self.state.lock().await;
            if let Some(conversation) = state.conversations.remove(&id) {
                state.forget_sends(conversation.timeline.messages());
            }
            state.failed_loads.remove(&id);
            state.inbox.remove(id);
            if state.is_active(id) {
                state.active = None;
                state.focus_epoch += 1;
                state.room.leave()
            } else {
                None
            }
        };
        if let Some(room) = left {
            self.emit_leave(room);
        }
        log::info!("Deleted conversation {id}");
        self.notify(SyncEvent::InboxChanged);
        Ok(())
    }

    // ----- transport events -----

    /// Consume transport events until the socket client goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event).await;
        }
        log::info!("Transport event stream closed");
    }

    pub async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                log::info!("Transport connected");
                // Membership was dropped on disconnect; rejoin before marking read.
                if let Some(id) = self.active_conversation().await {
                    self.mark_read(id);
                }
            }
            TransportEvent::ServerReady => self.notify(SyncEvent::ServerReady),
            TransportEvent::Disconnected { reason } => {
                self.state.lock().await.room.on_disconnect();
                log::warn!("Transport disconnected: {reason}");
                self.notify(SyncEvent::ConnectionLost(reason));
            }
            TransportEvent::ConnectError(err) => {
                self.state.lock().await.room.on_disconnect();
                log::warn!("Transport connect error: {err}");
            }
            TransportEvent::Push(push) => self.apply_push(push).await,
        }
    }

    async fn apply_push(self: &Arc<Self>, push: PushEvent) {
        match push {
            PushEvent::NewMessage(message) => {
                let from_peer = message.sender_id != Some(self.local_user);
                let target = match message.conversation_id {
                    Some(id) => Some(id),
                    None => self.active_conversation().await,
                };
                if self.on_push_message(message).await && from_peer {
                    if let Some(id) = target {
                        if self.active_conversation().await == Some(id) {
                            self.mark_read(id);
                        }
                    }
                }
            }
            PushEvent::MessageEdited(edit) => {
                self.on_message_edited(edit).await;
            }
            PushEvent::MessageDeleted(removal) => {
                self.on_message_deleted(removal).await;
            }
            PushEvent::ConversationUpdated(summary) => self.on_conversation_updated(summary).await,
            PushEvent::ConversationRead(receipt) => self.on_conversation_read(receipt).await,
            PushEvent::PresenceUpdate(presence) => self.on_presence(presence).await,
        }
    }

    /// Merge a pushed message. Ids already in the list are ignored.
    /// Returns whether a loaded conversation gained the message.
    pub async fn on_push_message(&self, server: ServerMessage) -> bool {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let Some(id) = server.conversation_id.or(state.active) else {
            log::debug!("Dropping message {} with no conversation", server.id);
            return false;
        };
        let message = server.into_message(self.local_user);
        let message_id = message.id.clone();
        if state
            .conversations
            .get(&id)
            .is_some_and(|c| c.timeline.contains(&message_id))
        {
            log::debug!("Ignoring duplicate message {message_id} in conversation {id}");
            return false;
        }

        let from_peer = !message.sender_is_local_user;
        let (preview, at) = (message.text.clone(), message.timestamp);
        let active = state.is_active(id);
        let awaiting_ack = state.awaiting_ack();

        let inserted = match state.conversations.get_mut(&id) {
            Some(conversation) => {
                match conversation.timeline.adopt_echo(&message, &awaiting_ack) {
                    Some(local_id) => {
                        log::debug!("Push {message_id} stands in for pending {local_id}");
                        state.echoes.insert(local_id, message_id.clone());
                        true
                    }
                    None => conversation.timeline.insert(message),
                }
            }
            None => false,
        };

        let mut inbox_changed = state.inbox.touch(id, &preview, at);
        if from_peer && !active {
            inbox_changed |= state.inbox.bump_unread(id);
        }
        drop(guard);

        if inserted && active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        if inbox_changed {
            self.notify(SyncEvent::InboxChanged);
        }
        inserted
    }

    pub async fn on_message_edited(&self, edit: MessageEdit) -> bool {
        let message_id = MessageId::Server(edit.id);
        let mut state = self.state.lock().await;
        let Some(id) = state.locate(edit.conversation_id, &message_id) else {
            return false;
        };
        let changed = state
            .conversations
            .get_mut(&id)
            .and_then(|c| c.timeline.apply_edit(&message_id, edit.content))
            .is_some();
        let active = state.is_active(id);
        drop(state);

        if changed && active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        changed
    }

    pub async fn on_message_deleted(&self, removal: MessageRemoval) -> bool {
        let message_id = MessageId::Server(removal.id);
        let mut state = self.state.lock().await;
        let Some(id) = state.locate(removal.conversation_id, &message_id) else {
            return false;
        };
        let changed = state
            .conversations
            .get_mut(&id)
            .and_then(|c| c.timeline.apply_delete(&message_id))
            .is_some();
        let active = state.is_active(id);
        drop(state);

        if changed && active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
        changed
    }

    async fn on_conversation_read(&self, receipt: ReadReceipt) {
        let id = receipt.conversation_id;
        let mut state = self.state.lock().await;
        if receipt.reader_id == Some(self.local_user) {
            // Read on another device.
            let changed = state.inbox.mark_read(id);
            drop(state);
            if changed {
                self.notify(SyncEvent::InboxChanged);
            }
            return;
        }

        let changed = state
            .conversations
            .get_mut(&id)
            .map_or(0, |c| c.timeline.mark_read_by_peer());
        let active = state.is_active(id);
        drop(state);
        if changed > 0 && active {
            self.notify(SyncEvent::MessagesChanged(id));
        }
    }

    async fn on_conversation_updated(&self, summary: ConversationSummary) {
        self.state.lock().await.inbox.upsert(summary);
        self.notify(SyncEvent::InboxChanged);
    }

    async fn on_presence(&self, presence: Presence) {
        let mut state = self.state.lock().await;
        let mut changed = state.inbox.apply_presence(&presence);
        for participant in state
            .conversations
            .values_mut()
            .filter_map(|c| c.details.as_mut())
            .flat_map(|d| d.participants.iter_mut())
            .filter(|p| p.id == presence.user_id)
        {
            participant.is_online = presence.is_online;
            if presence.last_seen.is_some() {
                participant.last_seen = presence.last_seen;
            }
            changed = true;
        }
        drop(state);

        if changed {
            self.notify(SyncEvent::PresenceChanged(presence.user_id));
        }
    }

    // ----- views -----

    pub async fn messages(&self, id: ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .await
            .conversations
            .get(&id)
            .map(|c| c.timeline.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn conversation(&self, id: ConversationId) -> Option<ConversationView> {
        let state = self.state.lock().await;
        let conversation = state.conversations.get(&id)?;
        let details = conversation.details.as_ref();
        Some(ConversationView {
            id,
            peer: details.and_then(|d| d.peer_of(self.local_user)).cloned(),
            is_match: details.is_some_and(|d| d.is_match),
            room_joined: state.room.is_joined(id),
            messages: conversation.timeline.messages().to_vec(),
        })
    }

    pub async fn inbox(&self) -> Vec<ConversationSummary> {
        self.state.lock().await.inbox.entries().to_vec()
    }

    pub async fn total_unread(&self) -> u32 {
        self.state.lock().await.inbox.total_unread()
    }

    // ----- helpers -----

    fn emit_leave(&self, id: ConversationId) {
        match self
            .transport
            .emit(transport::LEAVE_CONVERSATION, json!({ "conversation_id": id }))
        {
            Ok(()) => log::debug!("Left conversation {id}"),
            Err(err) => log::debug!("leave_conversation {id} not sent: {err}"),
        }
    }

    fn api_failure(&self, err: ApiError) -> SyncError {
        let err = SyncError::from(err);
        if err.is_session_expired() {
            self.notify(SyncEvent::SessionExpired);
        }
        err
    }

    fn notify(&self, event: SyncEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Sync event channel full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Server id of a message the local user may edit or delete.
fn mutable_target(timeline: &Timeline, message_id: &MessageId) -> Result<i64> {
    let message = timeline
        .get(message_id)
        .ok_or_else(|| SyncError::UnknownMessage(message_id.clone()))?;
    let refuse = |reason: &str| SyncError::MutationRejected {
        message_id: message_id.clone(),
        reason: reason.to_string(),
    };
    if !message.sender_is_local_user {
        return Err(refuse("only your own messages can be changed"));
    }
    if message.deleted {
        return Err(refuse("message was deleted"));
    }
    message
        .id
        .server_id()
        .ok_or_else(|| refuse("message has not been delivered yet"))
}
