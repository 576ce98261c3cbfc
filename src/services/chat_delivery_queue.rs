//! Outbound queue for messages that could not be handed to the transport.
//!
//! Entries live in exactly one of three partitions. `pending` is replayed in
//! FIFO order when the connection comes up, `failed` holds messages whose
//! send errored or whose delivery receipt never arrived, and `retrying` holds
//! failed entries while they are being resubmitted. The partitions are
//! persisted per local identity through the message store.

use serde::{Deserialize, Serialize};

use super::chat_message_store::SharedStore;
use super::chat_types::Message;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueuePartition {
    Pending,
    Retrying,
    Failed,
}

/// Persisted form of the queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub pending: Vec<Message>,
    #[serde(default)]
    pub retrying: Vec<Message>,
    #[serde(default)]
    pub failed: Vec<Message>,
}

/// Outcome of one drain pass.
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Handed to the transport, in queue order.
    pub sent: Vec<Message>,
    /// Moved to `failed`, with the send error.
    pub failed: Vec<(Message, String)>,
}

pub struct DeliveryQueue {
    owner_id: String,
    store: SharedStore,
    pending: Vec<Message>,
    retrying: Vec<Message>,
    failed: Vec<Message>,
}

impl DeliveryQueue {
    pub fn new(owner_id: &str, store: SharedStore) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            store,
            pending: Vec::new(),
            retrying: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Reload the persisted snapshot. An entry caught mid-retry goes back to `failed`.
    pub async fn load(&mut self) -> Result<()> {
        let snapshot: Option<QueueSnapshot> = self.store.read().await.load_queue(&self.owner_id)?;
        let Some(snapshot) = snapshot else {
            return Ok(());
        };
        self.pending = snapshot.pending;
        self.failed = snapshot.failed;
        for msg in snapshot.retrying {
            if !self.failed.iter().any(|m| m.id == msg.id) {
                self.failed.push(msg);
            }
        }
        self.retrying.clear();
        log::info!(
            "Restored queue for {}: {} pending, {} failed",
            self.owner_id,
            self.pending.len(),
            self.failed.len()
        );
        Ok(())
    }

    /// Queue a message for the next drain and make sure it is stored.
    pub async fn enqueue(&mut self, message: Message) -> Result<()> {
        self.take(&message.id);
        self.store.write().await.append(&message)?;
        log::info!("Queued message {} for {}", message.id, message.to_id);
        self.pending.push(message);
        self.persist().await
    }

    /// Hand every pending entry to `send` in FIFO order. A failed send moves
    /// that entry to `failed` and the drain carries on with the next one.
    pub async fn drain<F>(&mut self, mut send: F) -> Result<DrainReport>
    where
        F: FnMut(&Message) -> Result<()>,
    {
        let mut report = DrainReport::default();
        if self.pending.is_empty() {
            return Ok(report);
        }

        for msg in std::mem::take(&mut self.pending) {
            match send(&msg) {
                Ok(()) => {
                    log::debug!("Drained message {}", msg.id);
                    report.sent.push(msg);
                }
                Err(e) => {
                    log::warn!("Send of queued message {} failed: {}", msg.id, e);
                    self.failed.push(msg.clone());
                    report.failed.push((msg, e.to_string()));
                }
            }
        }

        log::info!(
            "Drained queue for {}: {} sent, {} failed",
            self.owner_id,
            report.sent.len(),
            report.failed.len()
        );
        self.persist().await?;
        Ok(report)
    }

    /// Move a message to `failed`, wherever it currently is.
    pub async fn fail(&mut self, message: Message) -> Result<()> {
        self.take(&message.id);
        log::warn!("Message {} moved to failed queue", message.id);
        self.failed.push(message);
        self.persist().await
    }

    /// `failed` → `retrying`. Returns the entry, or `None` if it is not in `failed`.
    pub async fn begin_retry(&mut self, message_id: &str) -> Result<Option<Message>> {
        let Some(pos) = self.failed.iter().position(|m| m.id == message_id) else {
            return Ok(None);
        };
        let msg = self.failed.remove(pos);
        self.retrying.push(msg.clone());
        self.persist().await?;
        Ok(Some(msg))
    }

    /// Remove from whichever partition holds the message.
    pub async fn remove(&mut self, message_id: &str) -> Result<Option<Message>> {
        let removed = self.take(message_id);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.pending.clear();
        self.retrying.clear();
        self.failed.clear();
        self.persist().await
    }

    /// Forget in-memory state without touching storage.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.retrying.clear();
        self.failed.clear();
    }

    pub fn partition_of(&self, message_id: &str) -> Option<QueuePartition> {
        if self.pending.iter().any(|m| m.id == message_id) {
            Some(QueuePartition::Pending)
        } else if self.retrying.iter().any(|m| m.id == message_id) {
            Some(QueuePartition::Retrying)
        } else if self.failed.iter().any(|m| m.id == message_id) {
            Some(QueuePartition::Failed)
        } else {
            None
        }
    }

    pub fn pending(&self) -> &[Message] {
        &self.pending
    }

    pub fn failed(&self) -> &[Message] {
        &self.failed
    }

    pub fn retrying(&self) -> &[Message] {
        &self.retrying
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.retrying.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.pending.clone(),
            retrying: self.retrying.clone(),
            failed: self.failed.clone(),
        }
    }

    fn take(&mut self, message_id: &str) -> Option<Message> {
        for partition in [&mut self.pending, &mut self.retrying, &mut self.failed] {
            if let Some(pos) = partition.iter().position(|m| m.id == message_id) {
                return Some(partition.remove(pos));
            }
        }
        None
    }

    async fn persist(&self) -> Result<()> {
        self.store
            .read()
            .await
            .save_queue(&self.owner_id, &self.snapshot())
    }
}
