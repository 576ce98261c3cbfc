use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::chat_types::{
    encode_file_component, ConversationKey, Message, MessageStatus, RecentContact, UserRecord,
};
use crate::error::{ChatError, Result};

/// Bound of the recent-users and recent-contacts lists.
pub const RECENT_CAP: usize = 5;

/// Store handle shared between the coordinator, the queue and the session.
pub type SharedStore = Arc<RwLock<MessageStore>>;

/// One conversation log as written to `messages/msg_<a>_to_<b>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationFile {
    key: ConversationKey,
    messages: Vec<Message>,
}

/// Table file replaced as one step of a staged removal.
struct TableRewrite {
    path: PathBuf,
    data: String,
}

impl TableRewrite {
    fn json<T: Serialize>(path: PathBuf, value: &T) -> Result<Self> {
        Ok(Self {
            path,
            data: serde_json::to_string_pretty(value)?,
        })
    }
}

/// Durable keyed log of messages plus the user and recent-contact tables.
///
/// Every mutation re-reads the file it touches before writing so that other
/// handles on the same directory are merged rather than overwritten.
pub struct MessageStore {
    conversations: HashMap<ConversationKey, Vec<Message>>,
    users: Vec<UserRecord>,
    contacts: HashMap<String, Vec<RecentContact>>,
    base_dir: PathBuf,
}

impl MessageStore {
    pub fn new(base_dir: &Path) -> Result<Self> {
        for dir in ["messages", "users", "contacts", "queue"] {
            std::fs::create_dir_all(base_dir.join(dir))
                .map_err(|e| ChatError::storage(&format!("Create {} dir", dir), e))?;
        }

        let mut store = Self {
            conversations: HashMap::new(),
            users: Vec::new(),
            contacts: HashMap::new(),
            base_dir: base_dir.to_path_buf(),
        };
        store.load_conversations()?;
        store.users = read_json_or_default(&store.users_path())?;
        store.contacts = read_json_or_default(&store.contacts_path())?;

        // Re-create missing tables empty.
        if !store.users_path().exists() {
            write_atomic(&store.users_path(), &serde_json::to_string_pretty(&store.users)?)?;
        }
        if !store.contacts_path().exists() {
            write_atomic(
                &store.contacts_path(),
                &serde_json::to_string_pretty(&store.contacts)?,
            )?;
        }

        log::info!(
            "Loaded {} conversations and {} users from {:?}",
            store.conversations.len(),
            store.users.len(),
            base_dir
        );
        Ok(store)
    }

    /// Open a store and wrap it for sharing.
    pub fn open_shared(base_dir: &Path) -> Result<SharedStore> {
        Ok(Arc::new(RwLock::new(Self::new(base_dir)?)))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn load_conversations(&mut self) -> Result<()> {
        let entries = std::fs::read_dir(self.messages_dir())
            .map_err(|e| ChatError::storage("List messages dir", e))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            match read_conversation_file(&path) {
                Ok(Some(file)) if path != self.conversation_path(&file.key) => {
                    log::warn!("Skipping {:?}: holds conversation {}", path, file.key);
                }
                Ok(Some(file)) => {
                    let merged = match self.conversations.remove(&file.key) {
                        Some(existing) => merge_messages(file.messages, existing),
                        None => file.messages,
                    };
                    self.conversations.insert(file.key, merged);
                }
                Ok(None) => {}
                Err(e) => log::warn!("Skipping conversation {:?}: {}", path, e),
            }
        }
        Ok(())
    }

    // ── Message log ────────────────────────────────────────────

    /// Append a message to its conversation. Returns false when a message
    /// with the same id is already stored (nothing is written).
    pub fn append(&mut self, message: &Message) -> Result<bool> {
        let key = message.conversation_key();
        self.refresh(&key)?;

        let mut messages = self.conversations.get(&key).cloned().unwrap_or_default();
        if messages.iter().any(|m| m.id == message.id) {
            log::debug!("Message {} already stored", message.id);
            return Ok(false);
        }
        messages.push(message.clone());
        // Memory only changes once the write has landed.
        self.write_conversation(&key, &messages)?;
        self.conversations.insert(key, messages);
        Ok(true)
    }

    /// Conversation history ordered by timestamp, ties in insertion order.
    pub fn read(&self, key: &ConversationKey) -> Vec<Message> {
        let mut messages = self.conversations.get(key).cloned().unwrap_or_default();
        messages.sort_by_key(|m| m.timestamp);
        messages
    }

    /// Every message in every conversation `user_id` takes part in, ordered by timestamp.
    pub fn read_all(&self, user_id: &str) -> Vec<Message> {
        let mut keys: Vec<&ConversationKey> = self
            .conversations
            .keys()
            .filter(|k| k.involves(user_id))
            .collect();
        keys.sort();

        let mut messages: Vec<Message> = keys
            .into_iter()
            .flat_map(|k| self.conversations[k].iter().cloned())
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        messages
    }

    pub fn get(&self, message_id: &str) -> Option<Message> {
        self.conversations
            .values()
            .flat_map(|msgs| msgs.iter())
            .find(|m| m.id == message_id)
            .cloned()
    }

    /// Keys of every conversation `user_id` takes part in.
    pub fn conversations_of(&self, user_id: &str) -> Vec<ConversationKey> {
        let mut keys: Vec<ConversationKey> = self
            .conversations
            .keys()
            .filter(|k| k.involves(user_id))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Move a stored message's status forward. Returns whether anything changed;
    /// unknown ids and backward transitions are no-ops.
    pub fn update_status(&mut self, message_id: &str, status: MessageStatus) -> Result<bool> {
        let key = match self.locate(message_id) {
            Some(key) => key,
            None => {
                // Possibly appended through another handle.
                self.load_conversations()?;
                match self.locate(message_id) {
                    Some(key) => key,
                    None => {
                        log::debug!("Status update for unknown message {}", message_id);
                        return Ok(false);
                    }
                }
            }
        };
        self.refresh(&key)?;

        let Some(mut messages) = self.conversations.get(&key).cloned() else {
            return Ok(false);
        };
        let changed = messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .is_some_and(|m| m.advance(status));
        if changed {
            self.write_conversation(&key, &messages)?;
            self.conversations.insert(key, messages);
        }
        Ok(changed)
    }

    fn locate(&self, message_id: &str) -> Option<ConversationKey> {
        self.conversations
            .iter()
            .find(|(_, msgs)| msgs.iter().any(|m| m.id == message_id))
            .map(|(k, _)| k.clone())
    }

    /// Merge the on-disk copy of a conversation into memory.
    fn refresh(&mut self, key: &ConversationKey) -> Result<()> {
        let path = self.conversation_path(key);
        let Some(file) = read_conversation_file(&path)? else {
            return Ok(());
        };
        if file.key != *key {
            log::warn!("Ignoring {:?}: holds conversation {}", path, file.key);
            return Ok(());
        }
        let merged = match self.conversations.remove(key) {
            Some(ours) => merge_messages(file.messages, ours),
            None => file.messages,
        };
        self.conversations.insert(key.clone(), merged);
        Ok(())
    }

    // ── Bulk erasure ───────────────────────────────────────────

    pub fn delete_conversation(&mut self, key: &ConversationKey) -> Result<()> {
        self.erase_conversation(key, None)
    }

    /// Remove the conversation between `owner_id` and `peer_id` and drop the
    /// peer from the owner's recent contacts. All or nothing.
    pub fn delete_contact_history(&mut self, owner_id: &str, peer_id: &str) -> Result<()> {
        self.erase_conversation(&ConversationKey::new(owner_id, peer_id), Some((owner_id, peer_id)))
    }

    fn erase_conversation(
        &mut self,
        key: &ConversationKey,
        contact: Option<(&str, &str)>,
    ) -> Result<()> {
        let mut rewrites = Vec::new();
        let mut contacts = None;
        if let Some((owner_id, peer_id)) = contact {
            let mut table: HashMap<String, Vec<RecentContact>> =
                read_json_or_default(&self.contacts_path())?;
            if let Some(list) = table.get_mut(owner_id) {
                list.retain(|c| c.user_id != peer_id);
            }
            rewrites.push(TableRewrite::json(self.contacts_path(), &table)?);
            contacts = Some(table);
        }

        let staged = self.stage_removal(&[self.conversation_path(key)], &rewrites)?;
        self.conversations.remove(key);
        if let Some(table) = contacts {
            self.contacts = table;
        }
        self.finish_removal(staged);
        log::info!("Deleted conversation {}", key);
        Ok(())
    }

    /// Remove every conversation `user_id` takes part in, the user's record,
    /// recent-contacts list and queue snapshot. All or nothing.
    pub fn delete_user(&mut self, user_id: &str) -> Result<()> {
        self.load_conversations()?;
        let keys = self.conversations_of(user_id);
        let mut paths: Vec<PathBuf> = keys.iter().map(|k| self.conversation_path(k)).collect();
        paths.push(self.queue_path(user_id));

        let mut contacts: HashMap<String, Vec<RecentContact>> =
            read_json_or_default(&self.contacts_path())?;
        contacts.remove(user_id);
        let mut users: Vec<UserRecord> = read_json_or_default(&self.users_path())?;
        users.retain(|u| u.id != user_id);
        let rewrites = [
            TableRewrite::json(self.contacts_path(), &contacts)?,
            TableRewrite::json(self.users_path(), &users)?,
        ];
        let staged = self.stage_removal(&paths, &rewrites)?;

        for key in &keys {
            self.conversations.remove(key);
        }
        self.contacts = contacts;
        self.users = users;
        self.finish_removal(staged);
        log::info!(
            "Deleted data of user {} ({} conversations)",
            user_id,
            keys.len()
        );
        Ok(())
    }

    /// Remove every conversation and queue snapshot and empty both reference
    /// tables. All or nothing.
    pub fn delete_all(&mut self) -> Result<()> {
        let mut paths = list_json_files(&self.messages_dir())?;
        paths.extend(list_json_files(&self.base_dir.join("queue"))?);

        let rewrites = [
            TableRewrite::json(self.users_path(), &Vec::<UserRecord>::new())?,
            TableRewrite::json(
                self.contacts_path(),
                &HashMap::<String, Vec<RecentContact>>::new(),
            )?,
        ];
        let staged = self.stage_removal(&paths, &rewrites)?;

        self.conversations.clear();
        self.users.clear();
        self.contacts.clear();
        self.finish_removal(staged);
        log::info!("Deleted all chat data in {:?}", self.base_dir);
        Ok(())
    }

    /// Move `paths` into a trash directory and replace the `rewrites` tables.
    /// On any failure everything already touched is put back.
    fn stage_removal(&self, paths: &[PathBuf], rewrites: &[TableRewrite]) -> Result<PathBuf> {
        let trash = self
            .base_dir
            .join(format!(".trash-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&trash).map_err(|e| ChatError::storage("Create trash dir", e))?;

        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut created: Vec<PathBuf> = Vec::new();
        let result = (|| -> Result<()> {
            for (i, path) in paths.iter().enumerate() {
                if !path.exists() {
                    continue;
                }
                let target = trash.join(format!("{}.json", i));
                std::fs::rename(path, &target)
                    .map_err(|e| ChatError::storage(&format!("Remove {:?}", path), e))?;
                moved.push((path.clone(), target));
            }
            for (i, table) in rewrites.iter().enumerate() {
                if table.path.exists() {
                    let backup = trash.join(format!("table-{}.json", i));
                    std::fs::copy(&table.path, &backup)
                        .map_err(|e| ChatError::storage("Back up table", e))?;
                    moved.push((table.path.clone(), backup));
                } else {
                    created.push(table.path.clone());
                }
                write_atomic(&table.path, &table.data)?;
            }
            Ok(())
        })();

        if let Err(e) = result {
            for (original, staged) in moved.into_iter().rev() {
                if let Err(re) = std::fs::rename(&staged, &original) {
                    log::warn!("Rollback of {:?} failed: {}", original, re);
                }
            }
            for path in created {
                let _ = std::fs::remove_file(&path);
            }
            let _ = std::fs::remove_dir_all(&trash);
            return Err(e);
        }
        Ok(trash)
    }

    fn finish_removal(&self, trash: PathBuf) {
        if let Err(e) = std::fs::remove_dir_all(&trash) {
            log::warn!("Failed to clear {:?}: {}", trash, e);
        }
    }

    // ── Reference tables ───────────────────────────────────────

    /// Record `user_id` as the most recently active local identity.
    pub fn upsert_user(&mut self, user_id: &str) -> Result<()> {
        self.users = read_json_or_default(&self.users_path())?;
        self.users.retain(|u| u.id != user_id);
        self.users.insert(
            0,
            UserRecord {
                id: user_id.to_string(),
                last_active_at: Utc::now(),
            },
        );
        self.users.truncate(RECENT_CAP);
        write_atomic(&self.users_path(), &serde_json::to_string_pretty(&self.users)?)
    }

    /// Most recently active users first, at most five.
    pub fn recent_users(&self) -> Vec<UserRecord> {
        let mut users = self.users.clone();
        users.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
        users.truncate(RECENT_CAP);
        users
    }

    pub fn upsert_recent_contact(&mut self, owner_id: &str, contact_id: &str) -> Result<()> {
        self.contacts = read_json_or_default(&self.contacts_path())?;
        let list = self.contacts.entry(owner_id.to_string()).or_default();
        list.retain(|c| c.user_id != contact_id);
        list.insert(
            0,
            RecentContact {
                user_id: contact_id.to_string(),
                last_interaction_at: Utc::now(),
            },
        );
        list.truncate(RECENT_CAP);
        write_atomic(
            &self.contacts_path(),
            &serde_json::to_string_pretty(&self.contacts)?,
        )
    }

    pub fn recent_contacts(&self, owner_id: &str) -> Vec<RecentContact> {
        self.contacts.get(owner_id).cloned().unwrap_or_default()
    }

    // ── Queue snapshots ────────────────────────────────────────

    pub fn save_queue<T: Serialize>(&self, owner_id: &str, snapshot: &T) -> Result<()> {
        write_atomic(
            &self.queue_path(owner_id),
            &serde_json::to_string_pretty(snapshot)?,
        )
    }

    pub fn load_queue<T: DeserializeOwned>(&self, owner_id: &str) -> Result<Option<T>> {
        let path = self.queue_path(owner_id);
        if !path.exists() {
            return Ok(None);
        }
        let data =
            std::fs::read_to_string(&path).map_err(|e| ChatError::storage("Read queue", e))?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    // ── Paths & persistence ────────────────────────────────────

    fn messages_dir(&self) -> PathBuf {
        self.base_dir.join("messages")
    }

    fn conversation_path(&self, key: &ConversationKey) -> PathBuf {
        self.messages_dir().join(format!("{}.json", key.file_stem()))
    }

    fn users_path(&self) -> PathBuf {
        self.base_dir.join("users").join("users.json")
    }

    fn contacts_path(&self) -> PathBuf {
        self.base_dir.join("contacts").join("contacts.json")
    }

    fn queue_path(&self, owner_id: &str) -> PathBuf {
        self.base_dir
            .join("queue")
            .join(format!("{}.json", encode_file_component(owner_id)))
    }

    fn write_conversation(&self, key: &ConversationKey, messages: &[Message]) -> Result<()> {
        let file = ConversationFile {
            key: key.clone(),
            messages: messages.to_vec(),
        };
        let data = serde_json::to_string_pretty(&file)
            .map_err(|e| ChatError::Serialization(format!("Serialize conversation: {}", e)))?;
        write_atomic(&self.conversation_path(key), &data)
    }
}

/// Union by id: `base` order first, then ids only present in `other`.
/// Where both hold a message the further-advanced status wins.
fn merge_messages(base: Vec<Message>, other: Vec<Message>) -> Vec<Message> {
    let mut merged = base;
    for msg in other {
        match merged.iter_mut().find(|m| m.id == msg.id) {
            Some(existing) => {
                existing.advance(msg.status);
            }
            None => merged.push(msg),
        }
    }
    merged
}

fn read_conversation_file(path: &Path) -> Result<Option<ConversationFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)
        .map_err(|e| ChatError::storage("Read conversation", e))?;
    let file = serde_json::from_str(&data)
        .map_err(|e| ChatError::StorageFailure(format!("Parse {:?}: {}", path, e)))?;
    Ok(Some(file))
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let data = std::fs::read_to_string(path).map_err(|e| ChatError::storage("Read table", e))?;
    if data.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(&data)
        .map_err(|e| ChatError::StorageFailure(format!("Parse {:?}: {}", path, e)))
}

fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| ChatError::storage("List dir", e))?;
    Ok(entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
        .collect())
}

/// Write through a temp file and rename so readers never see a partial file.
fn write_atomic(path: &Path, data: &str) -> Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, data).map_err(|e| ChatError::storage("Write temp file", e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        ChatError::storage(&format!("Replace {:?}", path), e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration};
    use tempfile::TempDir;

    fn msg(id: &str, from: &str, to: &str, secs: i64) -> Message {
        let base = DateTime::parse_from_rfc3339("2024-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Message {
            id: id.to_string(),
            from_id: from.to_string(),
            to_id: to.to_string(),
            content: format!("content of {}", id),
            timestamp: base + Duration::seconds(secs),
            status: MessageStatus::Sent,
        }
    }

    #[test]
    fn test_creates_empty_layout() {
        let tmp = TempDir::new().unwrap();
        let store = MessageStore::new(tmp.path()).unwrap();
        assert!(tmp.path().join("messages").is_dir());
        assert!(tmp.path().join("users/users.json").is_file());
        assert!(tmp.path().join("contacts/contacts.json").is_file());
        assert!(store.recent_users().is_empty());
    }

    #[test]
    fn test_append_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        let m = msg("m1", "alice", "bob", 0);

        assert!(store.append(&m).unwrap());
        assert!(!store.append(&m).unwrap());
        assert_eq!(store.read(&ConversationKey::new("bob", "alice")).len(), 1);
        assert!(tmp.path().join("messages/msg_alice_to_bob.json").is_file());
    }

    #[test]
    fn test_read_orders_by_timestamp_with_stable_ties() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("late", "alice", "bob", 10)).unwrap();
        store.append(&msg("tie-a", "bob", "alice", 5)).unwrap();
        store.append(&msg("tie-b", "alice", "bob", 5)).unwrap();
        store.append(&msg("early", "bob", "alice", 1)).unwrap();

        let ids: Vec<String> = store
            .read(&ConversationKey::new("alice", "bob"))
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["early", "tie-a", "tie-b", "late"]);
    }

    #[test]
    fn test_read_all_merges_conversations() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("m1", "alice", "bob", 3)).unwrap();
        store.append(&msg("m2", "carol", "alice", 1)).unwrap();
        store.append(&msg("m3", "bob", "carol", 2)).unwrap();

        let ids: Vec<String> = store.read_all("alice").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m2", "m1"]);
    }

    #[test]
    fn test_status_is_monotonic_and_persisted() {
        let tmp = TempDir::new().unwrap();
        {
            let mut store = MessageStore::new(tmp.path()).unwrap();
            store.append(&msg("m1", "alice", "bob", 0)).unwrap();
            assert!(store.update_status("m1", MessageStatus::Read).unwrap());
            assert!(!store.update_status("m1", MessageStatus::Delivered).unwrap());
            assert!(!store.update_status("missing", MessageStatus::Read).unwrap());
        }
        let store = MessageStore::new(tmp.path()).unwrap();
        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_two_handles_merge_instead_of_overwrite() {
        let tmp = TempDir::new().unwrap();
        let mut tab_a = MessageStore::new(tmp.path()).unwrap();
        let mut tab_b = MessageStore::new(tmp.path()).unwrap();

        tab_a.append(&msg("m1", "alice", "bob", 0)).unwrap();
        tab_b.append(&msg("m2", "bob", "alice", 1)).unwrap();
        tab_a.update_status("m2", MessageStatus::Delivered).unwrap();

        let reopened = MessageStore::new(tmp.path()).unwrap();
        let history = reopened.read(&ConversationKey::new("alice", "bob"));
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, MessageStatus::Delivered);
    }

    #[test]
    fn test_delete_user_removes_exactly_their_data() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("ab", "A", "B", 0)).unwrap();
        store.append(&msg("ca", "C", "A", 1)).unwrap();
        store.append(&msg("bc", "B", "C", 2)).unwrap();
        store.upsert_recent_contact("A", "B").unwrap();
        store.upsert_recent_contact("B", "C").unwrap();
        store.upsert_user("A").unwrap();
        store.upsert_user("B").unwrap();

        store.delete_user("A").unwrap();

        assert!(store.read(&ConversationKey::new("A", "B")).is_empty());
        assert!(store.read(&ConversationKey::new("A", "C")).is_empty());
        assert_eq!(store.read(&ConversationKey::new("B", "C")).len(), 1);
        assert!(store.recent_contacts("A").is_empty());
        assert_eq!(store.recent_contacts("B").len(), 1);
        let ids: Vec<String> = store.recent_users().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["B"]);

        let reopened = MessageStore::new(tmp.path()).unwrap();
        assert!(reopened.read_all("A").is_empty());
        assert_eq!(reopened.read_all("B").len(), 1);
        assert!(reopened.recent_contacts("A").is_empty());
        let ids: Vec<String> = reopened.recent_users().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["B"]);
    }

    #[test]
    fn test_delete_contact_history_drops_recent_contact() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("ab", "A", "B", 0)).unwrap();
        store.append(&msg("ac", "A", "C", 1)).unwrap();
        store.upsert_recent_contact("A", "B").unwrap();
        store.upsert_recent_contact("A", "C").unwrap();
        store.upsert_recent_contact("B", "A").unwrap();

        store.delete_contact_history("A", "B").unwrap();

        assert!(store.read(&ConversationKey::new("A", "B")).is_empty());
        assert_eq!(store.read(&ConversationKey::new("A", "C")).len(), 1);
        let contacts: Vec<String> = store
            .recent_contacts("A")
            .into_iter()
            .map(|c| c.user_id)
            .collect();
        assert_eq!(contacts, vec!["C"]);
        // The peer's own list is theirs to keep.
        assert_eq!(store.recent_contacts("B").len(), 1);

        let reopened = MessageStore::new(tmp.path()).unwrap();
        assert_eq!(reopened.recent_contacts("A").len(), 1);
        assert!(reopened.read(&ConversationKey::new("A", "B")).is_empty());
    }

    #[test]
    fn test_lookalike_keys_keep_separate_files() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("m1", "a", "b_to_c", 0)).unwrap();
        store.append(&msg("m2", "a_to_b", "c", 1)).unwrap();
        store.append(&msg("m3", "x/y", "z", 2)).unwrap();
        store.append(&msg("m4", "x_y", "z", 3)).unwrap();

        let reopened = MessageStore::new(tmp.path()).unwrap();
        for (a, b, id) in [
            ("a", "b_to_c", "m1"),
            ("a_to_b", "c", "m2"),
            ("x/y", "z", "m3"),
            ("x_y", "z", "m4"),
        ] {
            let ids: Vec<String> = reopened
                .read(&ConversationKey::new(a, b))
                .into_iter()
                .map(|m| m.id)
                .collect();
            assert_eq!(ids, vec![id], "conversation {}:{}", a, b);
        }

        let mut store = reopened;
        store.delete_conversation(&ConversationKey::new("a", "b_to_c")).unwrap();
        assert_eq!(store.read(&ConversationKey::new("a_to_b", "c")).len(), 1);
    }

    #[test]
    fn test_misplaced_conversation_file_is_ignored() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("m1", "alice", "bob", 0)).unwrap();
        std::fs::copy(
            tmp.path().join("messages/msg_alice_to_bob.json"),
            tmp.path().join("messages/msg_alice_to_carol.json"),
        )
        .unwrap();

        let mut reopened = MessageStore::new(tmp.path()).unwrap();
        assert!(reopened.read(&ConversationKey::new("alice", "carol")).is_empty());
        assert!(reopened.append(&msg("m2", "alice", "carol", 1)).unwrap());
        let ids: Vec<String> = reopened
            .read(&ConversationKey::new("alice", "carol"))
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m2"]);
        assert_eq!(reopened.read(&ConversationKey::new("alice", "bob")).len(), 1);
    }

    /// Swap `messages/` for a plain file so every conversation write fails.
    fn break_messages_dir(root: &Path) -> PathBuf {
        let aside = root.join("messages.aside");
        std::fs::rename(root.join("messages"), &aside).unwrap();
        std::fs::write(root.join("messages"), "not a directory").unwrap();
        aside
    }

    fn restore_messages_dir(root: &Path, aside: &Path) {
        std::fs::remove_file(root.join("messages")).unwrap();
        std::fs::rename(aside, root.join("messages")).unwrap();
    }

    #[test]
    fn test_failed_append_leaves_nothing_behind() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        let m = msg("m1", "alice", "bob", 0);

        let aside = break_messages_dir(tmp.path());
        let err = store.append(&m).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageFailure);
        assert!(store.get("m1").is_none());
        restore_messages_dir(tmp.path(), &aside);

        assert!(store.append(&m).unwrap());
        let reopened = MessageStore::new(tmp.path()).unwrap();
        assert_eq!(reopened.read(&ConversationKey::new("alice", "bob")), vec![m]);
    }

    #[test]
    fn test_failed_status_update_is_not_applied() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("m1", "alice", "bob", 0)).unwrap();

        let aside = break_messages_dir(tmp.path());
        assert!(store.update_status("m1", MessageStatus::Delivered).is_err());
        assert_eq!(store.get("m1").unwrap().status, MessageStatus::Sent);
        restore_messages_dir(tmp.path(), &aside);

        assert!(store.update_status("m1", MessageStatus::Delivered).unwrap());
        let reopened = MessageStore::new(tmp.path()).unwrap();
        assert_eq!(reopened.get("m1").unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn test_delete_conversation_and_all() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        store.append(&msg("ab", "A", "B", 0)).unwrap();
        store.append(&msg("bc", "B", "C", 1)).unwrap();
        store.upsert_user("A").unwrap();

        store.delete_conversation(&ConversationKey::new("B", "A")).unwrap();
        assert!(store.read_all("A").is_empty());
        assert_eq!(store.read_all("C").len(), 1);

        store.delete_all().unwrap();
        assert!(store.read_all("C").is_empty());
        assert!(store.recent_users().is_empty());
        let reopened = MessageStore::new(tmp.path()).unwrap();
        assert!(reopened.read_all("C").is_empty());
        assert!(reopened.recent_users().is_empty());
    }

    #[test]
    fn test_recent_tables_are_bounded_mru() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        for id in ["u1", "u2", "u3", "u4", "u5", "u6"] {
            store.upsert_user(id).unwrap();
        }
        store.upsert_user("u3").unwrap();
        let ids: Vec<String> = store.recent_users().into_iter().map(|u| u.id).collect();
        assert_eq!(ids, vec!["u3", "u6", "u5", "u4", "u2"]);

        for c in ["c1", "c2", "c3", "c4", "c5", "c6", "c2"] {
            store.upsert_recent_contact("me", c).unwrap();
        }
        let ids: Vec<String> = store
            .recent_contacts("me")
            .into_iter()
            .map(|c| c.user_id)
            .collect();
        assert_eq!(ids, vec!["c2", "c6", "c5", "c4", "c3"]);
    }

    #[test]
    fn test_corrupt_conversation_is_reported_not_clobbered() {
        let tmp = TempDir::new().unwrap();
        let mut store = MessageStore::new(tmp.path()).unwrap();
        let path = tmp.path().join("messages/msg_alice_to_bob.json");
        std::fs::write(&path, "{ broken").unwrap();

        let err = store.append(&msg("m1", "alice", "bob", 0)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StorageFailure);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ broken");
    }
}
