use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::error::StoreError;

const DEFAULT_TITLE: &str = "New Conversation";

/// Metadata about a conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
}

impl ConversationMetadata {
    fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
            created_at: now,
            updated_at: now,
            message_count: 0,
        }
    }

    /// Bookkeeping after a message is appended; names untitled conversations
    /// after their first user message.
    fn record_message(&mut self, message: &Value) {
        self.message_count += 1;
        self.updated_at = Utc::now();
        if self.title == DEFAULT_TITLE && message["role"] == "user" {
            if let Some(text) = message["content"].as_str() {
                let title = generate_title(text);
                if !title.is_empty() {
                    self.title = title;
                }
            }
        }
    }
}

/// A complete conversation with metadata and messages.
///
/// Messages are opaque to the bridge; the webview owns their shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredConversation {
    pub metadata: ConversationMetadata,
    pub messages: Vec<Value>,
}

/// Conversation persistence used by the `conversation.*` handlers.
pub trait ConversationStore: Send + Sync {
    /// All conversations, most recently updated first.
    fn list(&self) -> Result<Vec<ConversationMetadata>, StoreError>;
    fn create(&self, title: Option<String>) -> Result<ConversationMetadata, StoreError>;
    fn delete(&self, id: &str) -> Result<(), StoreError>;
    fn messages(&self, id: &str) -> Result<Vec<Value>, StoreError>;
    fn append(&self, id: &str, message: Value) -> Result<ConversationMetadata, StoreError>;
}

fn sorted_recent_first(mut conversations: Vec<ConversationMetadata>) -> Vec<ConversationMetadata> {
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    conversations
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ids are uuids in practice; accept any stem that cannot leave the storage
/// dir or clobber the index.
fn is_plain_id(id: &str) -> bool {
    !id.is_empty()
        && id != "index"
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Index of all conversations
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ConversationIndex {
    conversations: Vec<ConversationMetadata>,
}

/// File-backed store: `index.json` plus one `<id>.json` per conversation.
pub struct JsonConversationStore {
    storage_path: PathBuf,
    index: Mutex<ConversationIndex>,
}

impl JsonConversationStore {
    pub fn new(storage_path: PathBuf) -> Result<Self, StoreError> {
        if !storage_path.exists() {
            fs::create_dir_all(&storage_path)?;
        }

        let index_path = storage_path.join("index.json");
        let index = if index_path.exists() {
            let content = fs::read_to_string(&index_path)?;
            serde_json::from_str(&content)?
        } else {
            ConversationIndex::default()
        };

        Ok(Self {
            storage_path,
            index: Mutex::new(index),
        })
    }

    /// `<id>.json` inside the storage dir. Ids come from the webview, so
    /// anything but a plain file stem is refused.
    fn conversation_path(&self, id: &str) -> Result<PathBuf, StoreError> {
        if !is_plain_id(id) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.storage_path.join(format!("{}.json", id)))
    }

    fn load(&self, id: &str) -> Result<StoredConversation, StoreError> {
        let path = self.conversation_path(id)?;
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, conv: &StoredConversation) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(conv)?;
        fs::write(self.conversation_path(&conv.metadata.id)?, content)?;
        Ok(())
    }

    fn save_index(&self, index: &ConversationIndex) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(index)?;
        fs::write(self.storage_path.join("index.json"), content)?;
        Ok(())
    }
}

impl ConversationStore for JsonConversationStore {
    fn list(&self) -> Result<Vec<ConversationMetadata>, StoreError> {
        Ok(sorted_recent_first(lock(&self.index).conversations.clone()))
    }

    fn create(&self, title: Option<String>) -> Result<ConversationMetadata, StoreError> {
        let metadata = ConversationMetadata::new(title);
        self.write(&StoredConversation {
            metadata: metadata.clone(),
            messages: Vec::new(),
        })?;

        let mut index = lock(&self.index);
        index.conversations.push(metadata.clone());
        self.save_index(&index)?;
        Ok(metadata)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.conversation_path(id)?;
        let mut index = lock(&self.index);
        let known = index.conversations.iter().any(|m| m.id == id);
        if !known && !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        if path.exists() {
            fs::remove_file(&path)?;
        }
        index.conversations.retain(|m| m.id != id);
        self.save_index(&index)
    }

    fn messages(&self, id: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self.load(id)?.messages)
    }

    fn append(&self, id: &str, message: Value) -> Result<ConversationMetadata, StoreError> {
        let mut index = lock(&self.index);
        let mut conv = self.load(id)?;
        conv.metadata.record_message(&message);
        conv.messages.push(message);
        self.write(&conv)?;

        match index.conversations.iter_mut().find(|m| m.id == id) {
            Some(existing) => *existing = conv.metadata.clone(),
            None => index.conversations.push(conv.metadata.clone()),
        }
        self.save_index(&index)?;
        Ok(conv.metadata)
    }
}

/// Non-persistent store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<String, StoredConversation>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryConversationStore {
    fn list(&self) -> Result<Vec<ConversationMetadata>, StoreError> {
        let conversations = lock(&self.conversations)
            .values()
            .map(|c| c.metadata.clone())
            .collect();
        Ok(sorted_recent_first(conversations))
    }

    fn create(&self, title: Option<String>) -> Result<ConversationMetadata, StoreError> {
        let metadata = ConversationMetadata::new(title);
        lock(&self.conversations).insert(
            metadata.id.clone(),
            StoredConversation {
                metadata: metadata.clone(),
                messages: Vec::new(),
            },
        );
        Ok(metadata)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        lock(&self.conversations)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn messages(&self, id: &str) -> Result<Vec<Value>, StoreError> {
        lock(&self.conversations)
            .get(id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn append(&self, id: &str, message: Value) -> Result<ConversationMetadata, StoreError> {
        let mut conversations = lock(&self.conversations);
        let conv = conversations
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conv.metadata.record_message(&message);
        conv.messages.push(message);
        Ok(conv.metadata.clone())
    }
}

/// Generate a title from the first user message
pub fn generate_title(first_message: &str) -> String {
    let trimmed = first_message.trim();

    // Slash commands read better capitalised without the slash
    if let Some(without_slash) = trimmed.strip_prefix('/') {
        let mut chars = without_slash.chars();
        return match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
    }

    if trimmed.chars().count() <= 50 {
        return trimmed.to_string();
    }

    let truncated: String = trimmed.chars().take(50).collect();
    match truncated.rfind(' ') {
        Some(last_space) => format!("{}...", &truncated[..last_space]),
        None => format!("{}...", truncated),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_generate_title_short() {
        assert_eq!(generate_title("Hello world"), "Hello world");
    }

    #[test]
    fn test_generate_title_long() {
        let long =
            "This is a very long message that exceeds fifty characters and should be truncated";
        let title = generate_title(long);
        assert!(title.len() <= 53); // 50 + "..."
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_generate_title_slash_command() {
        assert_eq!(generate_title("/fix the bug"), "Fix the bug");
        assert_eq!(generate_title("/help"), "Help");
        assert_eq!(generate_title("/"), "");
    }

    #[test]
    fn test_generate_title_multibyte() {
        let text = "ñ".repeat(60);
        let title = generate_title(&text);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), 53);
    }

    #[test]
    fn test_json_store_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = JsonConversationStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.list().unwrap().is_empty());

        let meta = store.create(None).unwrap();
        store
            .append(&meta.id, json!({"role": "user", "content": "Explain lifetimes"}))
            .unwrap();
        store
            .append(&meta.id, json!({"role": "assistant", "content": "Sure."}))
            .unwrap();

        // a fresh store sees what the first one persisted
        let reopened = JsonConversationStore::new(dir.path().to_path_buf()).unwrap();
        let listed = reopened.list().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].title, "Explain lifetimes");
        assert_eq!(listed[0].message_count, 2);
        assert_eq!(reopened.messages(&meta.id).unwrap().len(), 2);
    }

    #[test]
    fn test_json_store_delete() {
        let dir = TempDir::new().unwrap();
        let store = JsonConversationStore::new(dir.path().to_path_buf()).unwrap();
        let meta = store.create(Some("Scratch".to_string())).unwrap();

        store.delete(&meta.id).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(matches!(
            store.messages(&meta.id),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(store.delete(&meta.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_json_store_refuses_ids_outside_storage() {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("store");
        let store = JsonConversationStore::new(storage).unwrap();
        let victim = dir.path().join("victim.json");
        fs::write(&victim, "{}").unwrap();

        for id in ["../victim", "..", "a/b", "", "index"] {
            assert!(
                matches!(store.delete(id), Err(StoreError::InvalidId(_))),
                "delete accepted {:?}",
                id
            );
            assert!(matches!(store.messages(id), Err(StoreError::InvalidId(_))));
            assert!(matches!(
                store.append(id, json!({"role": "user", "content": "x"})),
                Err(StoreError::InvalidId(_))
            ));
        }
        assert!(victim.exists());
    }

    #[test]
    fn test_memory_store_orders_by_recent_update() {
        let store = MemoryConversationStore::new();
        let older = store.create(Some("older".to_string())).unwrap();
        let newer = store.create(Some("newer".to_string())).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.append(&older.id, json!({"role": "user", "content": "bump"})).unwrap();

        let ids: Vec<String> = store.list().unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);
    }

    #[test]
    fn test_append_to_missing_conversation() {
        let store = MemoryConversationStore::new();
        assert!(matches!(
            store.append("missing", json!({})),
            Err(StoreError::NotFound(_))
        ));
    }
}
