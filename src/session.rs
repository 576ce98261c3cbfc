use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::services::chat_connection::{ConnectionState, ConnectionSupervisor, NORMAL_CLOSURE};
use crate::services::chat_delivery_queue::QueueSnapshot;
use crate::services::chat_directory::DirectoryClient;
use crate::services::chat_message_store::SharedStore;
use crate::services::chat_service::{ChatService, CoordinatorEvent};
use crate::services::chat_transport::Connector;
use crate::services::chat_types::{ChatEvent, ConversationKey, Message, RecentContact, UserRecord};
use crate::services::config::ChatConfig;

/// Everything one local identity needs: supervisor, coordinator, queue and a
/// store handle. Built on login, torn down with [`ChatSession::shutdown`].
pub struct ChatSession {
    local_id: String,
    store: SharedStore,
    supervisor: Arc<ConnectionSupervisor>,
    chat: Arc<RwLock<ChatService>>,
    directory: Option<DirectoryClient>,
    events: Option<mpsc::UnboundedReceiver<ChatEvent>>,
    driver: JoinHandle<()>,
}

impl ChatSession {
    /// Log in as `local_id`: record the user, restore dedup and queue state
    /// from the store, and start connecting.
    pub async fn start(
        local_id: &str,
        config: &ChatConfig,
        store: SharedStore,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        store.write().await.upsert_user(local_id)?;

        let (loop_tx, mut loop_rx) = mpsc::unbounded_channel::<CoordinatorEvent>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ChatEvent>();

        let supervisor = Arc::new(ConnectionSupervisor::new(connector, config));
        let frame_tx = loop_tx.clone();
        supervisor.on_frame(move |text| {
            let _ = frame_tx.send(CoordinatorEvent::Frame(text.to_string()));
        });
        let state_tx = loop_tx.clone();
        supervisor.on_state_change(move |state| {
            let _ = state_tx.send(CoordinatorEvent::ConnectionChanged(state.clone()));
        });

        let mut service = ChatService::new(
            local_id,
            store.clone(),
            supervisor.clone(),
            config,
            events_tx,
            loop_tx,
        );
        service.warm_up().await?;
        let chat = Arc::new(RwLock::new(service));

        let driver_chat = chat.clone();
        let driver = tokio::spawn(async move {
            while let Some(event) = loop_rx.recv().await {
                let mut chat = driver_chat.write().await;
                if let Err(e) = chat.handle_event(event).await {
                    log::warn!("Chat event failed: {}", e);
                }
            }
        });

        let directory = match DirectoryClient::new(config) {
            Ok(client) => Some(client),
            Err(e) => {
                log::warn!("Directory unavailable: {}", e);
                None
            }
        };

        supervisor.connect(local_id)?;
        log::info!("Chat session started for {}", local_id);

        Ok(Self {
            local_id: local_id.to_string(),
            store,
            supervisor,
            chat,
            directory,
            events: Some(events_rx),
            driver,
        })
    }

    /// Replace the directory client (`None` disables presence lookups).
    pub fn with_directory(mut self, directory: Option<DirectoryClient>) -> Self {
        self.directory = directory;
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// The host's event stream. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ChatEvent>> {
        self.events.take()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Re-arm the connection after it gave up.
    pub fn reconnect(&self) -> Result<()> {
        self.supervisor.reconnect()
    }

    // ── Sending ────────────────────────────────────────────────

    pub async fn send_text(&self, to_id: &str, content: &str) -> Result<Message> {
        self.submit(Message::new(&self.local_id, to_id, content)).await
    }

    pub async fn submit(&self, message: Message) -> Result<Message> {
        self.chat.write().await.submit(message).await
    }

    pub async fn retry(&self, message_id: &str) -> Result<Message> {
        self.chat.write().await.retry(message_id).await
    }

    pub async fn remove_from_queue(&self, message_id: &str) -> Result<Option<Message>> {
        self.chat.write().await.remove_from_queue(message_id).await
    }

    pub async fn queue_snapshot(&self) -> QueueSnapshot {
        self.chat.read().await.queue().snapshot()
    }

    // ── Conversations ──────────────────────────────────────────

    /// Probe the peer's presence, record them as a recent contact and return
    /// the conversation history.
    pub async fn open_conversation(&self, peer_id: &str) -> Result<Vec<Message>> {
        if let Some(directory) = &self.directory {
            let online = match directory.user_status(peer_id).await {
                Ok(online) => online,
                Err(e) => {
                    log::warn!("Presence lookup for {} failed: {}", peer_id, e);
                    false
                }
            };
            self.chat.write().await.set_presence(peer_id, online);
        }

        let mut store = self.store.write().await;
        store.upsert_recent_contact(&self.local_id, peer_id)?;
        Ok(store.read(&ConversationKey::new(&self.local_id, peer_id)))
    }

    /// Returns the number of read receipts sent.
    pub async fn mark_conversation_visible(&self, peer_id: &str) -> Result<usize> {
        self.chat
            .write()
            .await
            .mark_conversation_visible(peer_id)
            .await
    }

    pub async fn mark_conversation_hidden(&self) {
        self.chat.write().await.mark_conversation_hidden();
    }

    pub async fn history(&self, peer_id: &str) -> Vec<Message> {
        self.store
            .read()
            .await
            .read(&ConversationKey::new(&self.local_id, peer_id))
    }

    pub async fn all_messages(&self) -> Vec<Message> {
        self.store.read().await.read_all(&self.local_id)
    }

    pub async fn unread_count(&self, peer_id: &str) -> usize {
        self.chat.read().await.unread_count(peer_id).await
    }

    pub async fn is_online(&self, peer_id: &str) -> bool {
        self.chat.read().await.is_online(peer_id)
    }

    pub async fn recent_users(&self) -> Vec<UserRecord> {
        self.store.read().await.recent_users()
    }

    pub async fn recent_contacts(&self) -> Vec<RecentContact> {
        self.store.read().await.recent_contacts(&self.local_id)
    }

    // ── Erasure ────────────────────────────────────────────────

    /// Erase the history with `peer_id` and drop them from recent contacts.
    pub async fn delete_conversation(&self, peer_id: &str) -> Result<()> {
        let mut chat = self.chat.write().await;
        self.store
            .write()
            .await
            .delete_contact_history(&self.local_id, peer_id)?;
        chat.forget_peer(peer_id).await
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        let mut chat = self.chat.write().await;
        self.store.write().await.delete_user(user_id)?;
        if user_id == self.local_id {
            chat.forget_all();
            Ok(())
        } else {
            chat.forget_peer(user_id).await
        }
    }

    pub async fn delete_all(&self) -> Result<()> {
        let mut chat = self.chat.write().await;
        self.store.write().await.delete_all()?;
        chat.forget_all();
        Ok(())
    }

    // ── Teardown ───────────────────────────────────────────────

    /// Cancel delivery timers, close the socket and stop the event loop.
    pub async fn shutdown(self) {
        self.chat.write().await.cancel_all_timeouts();
        self.supervisor.close(NORMAL_CLOSURE, "logout");
        self.driver.abort();
        log::info!("Chat session for {} closed", self.local_id);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.driver.abort();
        self.supervisor.close(NORMAL_CLOSURE, "session dropped");
    }
}
