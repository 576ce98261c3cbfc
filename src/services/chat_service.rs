//! Delivery coordinator: turns frames into message state transitions.
//!
//! Sits above the connection supervisor, the outbound queue and the message
//! store. Inbound frames and timer expiries reach it as [`CoordinatorEvent`]s
//! through the session's event loop, so all state changes happen one at a
//! time on that loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::chat_connection::{ConnectionState, ConnectionSupervisor};
use super::chat_delivery_queue::DeliveryQueue;
use super::chat_message_store::SharedStore;
use super::chat_types::*;
use super::config::ChatConfig;
use crate::error::{ChatError, Result};

/// Input to the coordinator, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    Frame(String),
    ConnectionChanged(ConnectionState),
    /// `token` identifies the timer so a stale expiry is ignored after re-arming.
    DeliveryTimeout { message_id: String, token: u64 },
}

struct PendingAck {
    token: u64,
    timer: JoinHandle<()>,
}

pub struct ChatService {
    local_id: String,
    store: SharedStore,
    queue: DeliveryQueue,
    supervisor: Arc<ConnectionSupervisor>,
    /// Ids of data messages already stored; replays are dropped.
    seen: HashSet<String>,
    /// Sent messages waiting for a delivery receipt.
    awaiting: HashMap<String, PendingAck>,
    next_token: u64,
    presence: HashMap<String, bool>,
    visible_peer: Option<String>,
    events: mpsc::UnboundedSender<ChatEvent>,
    loopback: mpsc::UnboundedSender<CoordinatorEvent>,
    delivery_timeout: Duration,
    max_message_size: usize,
}

impl ChatService {
    pub fn new(
        local_id: &str,
        store: SharedStore,
        supervisor: Arc<ConnectionSupervisor>,
        config: &ChatConfig,
        events: mpsc::UnboundedSender<ChatEvent>,
        loopback: mpsc::UnboundedSender<CoordinatorEvent>,
    ) -> Self {
        Self {
            local_id: local_id.to_string(),
            queue: DeliveryQueue::new(local_id, store.clone()),
            store,
            supervisor,
            seen: HashSet::new(),
            awaiting: HashMap::new(),
            next_token: 0,
            presence: HashMap::new(),
            visible_peer: None,
            events,
            loopback,
            delivery_timeout: config.delivery_timeout(),
            max_message_size: config.delivery.max_message_size,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Seed the dedup set from stored history and reload the persisted queue.
    pub async fn warm_up(&mut self) -> Result<()> {
        let history = self.store.read().await.read_all(&self.local_id);
        self.seen.extend(history.into_iter().map(|m| m.id));
        self.queue.load().await?;
        log::info!(
            "Coordinator for {} ready: {} known messages, {} queued",
            self.local_id,
            self.seen.len(),
            self.queue.len()
        );
        Ok(())
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    // ── Outbound ───────────────────────────────────────────────

    /// Persist, then transmit (arming the delivery timeout) or queue.
    pub async fn submit(&mut self, mut message: Message) -> Result<Message> {
        self.validate_outbound(&message)?;
        message.status = MessageStatus::Sent;

        self.store.write().await.append(&message)?;
        self.seen.insert(message.id.clone());
        self.dispatch(message.clone()).await?;
        Ok(message)
    }

    fn validate_outbound(&self, message: &Message) -> Result<()> {
        if message.from_id != self.local_id {
            return Err(ChatError::InvalidMessage(format!(
                "Message {} is not from the local user",
                message.id
            )));
        }
        if message.id.is_empty() || message.to_id.is_empty() {
            return Err(ChatError::InvalidMessage(
                "Message needs an id and a recipient".to_string(),
            ));
        }
        if message.content.len() > self.max_message_size {
            return Err(ChatError::InvalidMessage(format!(
                "Message too large: {} bytes (max {})",
                message.content.len(),
                self.max_message_size
            )));
        }
        if is_reserved_content(&message.content) {
            return Err(ChatError::InvalidMessage(format!(
                "'{}' is reserved for control frames",
                message.content
            )));
        }
        Ok(())
    }

    /// Send now if the link is up, otherwise leave it in `pending`.
    async fn dispatch(&mut self, message: Message) -> Result<()> {
        if self.supervisor.is_connected() {
            match self.transmit(&Frame::Data(message.clone())) {
                Ok(()) => {
                    self.queue.remove(&message.id).await?;
                    self.arm_timeout(&message.id);
                    return Ok(());
                }
                Err(e) => log::warn!("Send of {} failed, queueing: {}", message.id, e),
            }
        }
        self.queue.enqueue(message).await
    }

    fn transmit(&self, frame: &Frame) -> Result<()> {
        self.supervisor.send(&frame.encode()?)
    }

    /// `failed` → `retrying` → resubmitted.
    pub async fn retry(&mut self, message_id: &str) -> Result<Message> {
        let Some(message) = self.queue.begin_retry(message_id).await? else {
            return Err(ChatError::InvalidMessage(format!(
                "Message {} is not in the failed queue",
                message_id
            )));
        };
        log::info!("Retrying message {}", message_id);
        self.dispatch(message.clone()).await?;
        Ok(message)
    }

    pub async fn remove_from_queue(&mut self, message_id: &str) -> Result<Option<Message>> {
        self.disarm(message_id);
        self.queue.remove(message_id).await
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    // ── Delivery timeouts ──────────────────────────────────────

    fn arm_timeout(&mut self, message_id: &str) {
        self.disarm(message_id);
        self.next_token += 1;
        let token = self.next_token;
        let tx = self.loopback.clone();
        let id = message_id.to_string();
        let timeout = self.delivery_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(CoordinatorEvent::DeliveryTimeout {
                message_id: id,
                token,
            });
        });
        self.awaiting
            .insert(message_id.to_string(), PendingAck { token, timer });
    }

    fn disarm(&mut self, message_id: &str) {
        if let Some(pending) = self.awaiting.remove(message_id) {
            pending.timer.abort();
        }
    }

    pub fn cancel_all_timeouts(&mut self) {
        for (_, pending) in self.awaiting.drain() {
            pending.timer.abort();
        }
    }

    pub fn awaiting_receipt(&self, message_id: &str) -> bool {
        self.awaiting.contains_key(message_id)
    }

    async fn handle_delivery_timeout(&mut self, message_id: &str, token: u64) -> Result<()> {
        match self.awaiting.get(message_id) {
            Some(pending) if pending.token == token => {
                self.awaiting.remove(message_id);
            }
            _ => return Ok(()),
        }

        let stored = self.store.read().await.get(message_id);
        let Some(message) = stored else {
            return Ok(());
        };
        if message.status != MessageStatus::Sent {
            return Ok(());
        }

        log::warn!(
            "No delivery receipt for {} within {:?}",
            message_id,
            self.delivery_timeout
        );
        self.queue.fail(message).await?;
        self.emit(ChatEvent::DeliveryFailed {
            message_id: message_id.to_string(),
            reason: ChatError::DeliveryTimeout(message_id.to_string()).to_string(),
        });
        Ok(())
    }

    // ── Inbound ────────────────────────────────────────────────

    pub async fn handle_event(&mut self, event: CoordinatorEvent) -> Result<()> {
        match event {
            CoordinatorEvent::Frame(text) => self.handle_frame(&text).await,
            CoordinatorEvent::ConnectionChanged(state) => self.on_connection_changed(state).await,
            CoordinatorEvent::DeliveryTimeout { message_id, token } => {
                self.handle_delivery_timeout(&message_id, token).await
            }
        }
    }

    pub async fn handle_frame(&mut self, text: &str) -> Result<()> {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping malformed frame: {}", e);
                return Ok(());
            }
        };

        match frame {
            Frame::Presence { user_id, online } => {
                self.set_presence(&user_id, online);
                Ok(())
            }
            Frame::DeliveryReceipt(receipt) => {
                log::debug!("Delivery receipt for {} from {}", receipt.message_id, receipt.from_id);
                self.apply_status(&receipt.message_id, MessageStatus::Delivered)
                    .await
            }
            Frame::ReadReceipt(receipt) => {
                log::debug!("Read receipt for {} from {}", receipt.message_id, receipt.from_id);
                self.apply_status(&receipt.message_id, MessageStatus::Read).await
            }
            Frame::Data(message) => self.handle_data(message).await,
        }
    }

    /// A receipt settles the message: stop the timer, drop it from the queue,
    /// and move its status forward.
    async fn apply_status(&mut self, message_id: &str, status: MessageStatus) -> Result<()> {
        self.disarm(message_id);
        self.queue.remove(message_id).await?;
        let changed = self.store.write().await.update_status(message_id, status)?;
        if changed {
            self.emit(ChatEvent::StatusChanged {
                message_id: message_id.to_string(),
                status,
            });
        }
        Ok(())
    }

    async fn handle_data(&mut self, mut message: Message) -> Result<()> {
        if self.seen.contains(&message.id) {
            log::debug!(
                "{}",
                ChatError::DuplicateMessage(message.id.clone())
            );
            return Ok(());
        }
        if !message.involves(&self.local_id) {
            log::warn!(
                "Ignoring message {} between {} and {}",
                message.id,
                message.from_id,
                message.to_id
            );
            return Ok(());
        }

        let inbound = message.to_id == self.local_id && message.from_id != self.local_id;
        if inbound {
            message.advance(MessageStatus::Delivered);
        }
        self.store.write().await.append(&message)?;
        self.seen.insert(message.id.clone());
        log::info!("Received message {} from {}", message.id, message.from_id);
        self.emit(ChatEvent::MessageReceived {
            message: message.clone(),
        });

        if message.to_id == self.local_id {
            let receipt = Frame::DeliveryReceipt(Receipt {
                message_id: message.id.clone(),
                from_id: self.local_id.clone(),
                to_id: message.from_id.clone(),
            });
            // Receipts are not queued; the relay replays undelivered messages on reconnect.
            if let Err(e) = self.transmit(&receipt) {
                log::warn!("Delivery receipt for {} not sent: {}", message.id, e);
            }
        }

        if inbound && self.visible_peer.as_deref() == Some(message.from_id.as_str()) {
            self.send_read_receipt(&message).await?;
        }
        Ok(())
    }

    async fn on_connection_changed(&mut self, state: ConnectionState) -> Result<()> {
        self.emit(ChatEvent::ConnectionChanged {
            state: state.clone(),
        });
        if !state.is_connected() {
            return Ok(());
        }

        let supervisor = self.supervisor.clone();
        let report = self
            .queue
            .drain(|m| supervisor.send(&Frame::Data(m.clone()).encode()?))
            .await?;
        for message in &report.sent {
            self.arm_timeout(&message.id);
        }
        for (message, reason) in report.failed {
            self.emit(ChatEvent::DeliveryFailed {
                message_id: message.id,
                reason,
            });
        }

        if let Some(peer) = self.visible_peer.clone() {
            self.send_read_receipts(&peer).await?;
        }
        Ok(())
    }

    // ── Visibility & read receipts ─────────────────────────────

    /// The conversation with `peer` is on screen: acknowledge everything
    /// unread in it now, and anything that arrives while it stays visible.
    /// Returns the number of read receipts sent.
    pub async fn mark_conversation_visible(&mut self, peer_id: &str) -> Result<usize> {
        self.visible_peer = Some(peer_id.to_string());
        self.send_read_receipts(peer_id).await
    }

    pub fn mark_conversation_hidden(&mut self) {
        self.visible_peer = None;
    }

    pub fn visible_peer(&self) -> Option<&str> {
        self.visible_peer.as_deref()
    }

    /// Read receipts for the whole stored history with `peer`. Offline, nothing
    /// is sent; the rescan on reconnect picks the messages up.
    async fn send_read_receipts(&mut self, peer_id: &str) -> Result<usize> {
        if !self.supervisor.is_connected() {
            log::debug!("Offline, deferring read receipts for {}", peer_id);
            return Ok(0);
        }

        let key = ConversationKey::new(&self.local_id, peer_id);
        let unread: Vec<Message> = self
            .store
            .read()
            .await
            .read(&key)
            .into_iter()
            .filter(|m| self.is_unread_from(m, peer_id))
            .collect();

        let mut sent = 0;
        for message in &unread {
            if !self.send_read_receipt(message).await? {
                break;
            }
            sent += 1;
        }
        if sent > 0 {
            log::info!("Sent {} read receipts to {}", sent, peer_id);
        }
        Ok(sent)
    }

    fn is_unread_from(&self, message: &Message, peer_id: &str) -> bool {
        message.from_id == peer_id
            && message.to_id == self.local_id
            && message.status >= MessageStatus::Delivered
            && message.status < MessageStatus::Read
    }

    /// Returns false when the receipt could not be sent (message left unread).
    async fn send_read_receipt(&mut self, message: &Message) -> Result<bool> {
        let receipt = Frame::ReadReceipt(Receipt {
            message_id: message.id.clone(),
            from_id: self.local_id.clone(),
            to_id: message.from_id.clone(),
        });
        if let Err(e) = self.transmit(&receipt) {
            log::warn!("Read receipt for {} not sent: {}", message.id, e);
            return Ok(false);
        }
        if self
            .store
            .write()
            .await
            .update_status(&message.id, MessageStatus::Read)?
        {
            self.emit(ChatEvent::StatusChanged {
                message_id: message.id.clone(),
                status: MessageStatus::Read,
            });
        }
        Ok(true)
    }

    pub async fn unread_count(&self, peer_id: &str) -> usize {
        let key = ConversationKey::new(&self.local_id, peer_id);
        self.store
            .read()
            .await
            .read(&key)
            .iter()
            .filter(|m| m.from_id == peer_id && m.to_id == self.local_id && m.status < MessageStatus::Read)
            .count()
    }

    // ── Presence ───────────────────────────────────────────────

    pub fn set_presence(&mut self, user_id: &str, online: bool) {
        if user_id.is_empty() || user_id == self.local_id {
            return;
        }
        let previous = self.presence.insert(user_id.to_string(), online);
        if previous != Some(online) {
            log::info!("{} is {}", user_id, if online { "online" } else { "offline" });
            self.emit(ChatEvent::PresenceChanged {
                user_id: user_id.to_string(),
                online,
            });
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.get(user_id).copied().unwrap_or(false)
    }

    // ── Erasure ────────────────────────────────────────────────

    /// Drop queued and in-flight state for messages to `peer_id`.
    pub async fn forget_peer(&mut self, peer_id: &str) -> Result<()> {
        let snapshot = self.queue.snapshot();
        let ids: Vec<String> = snapshot
            .pending
            .iter()
            .chain(snapshot.retrying.iter())
            .chain(snapshot.failed.iter())
            .filter(|m| m.to_id == peer_id)
            .map(|m| m.id.clone())
            .collect();
        for id in ids {
            self.remove_from_queue(&id).await?;
        }
        Ok(())
    }

    /// Drop all queued and in-flight state; storage has already been wiped.
    pub fn forget_all(&mut self) {
        self.cancel_all_timeouts();
        self.queue.reset();
    }
}

impl Drop for ChatService {
    fn drop(&mut self) {
        self.cancel_all_timeouts();
    }
}
