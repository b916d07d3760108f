//! Conversation storage
//!
//! The relay only talks to storage through the [`ChatStore`] trait. [`InMemoryStore`] is the
//! implementation the binary ships with; a relational backend can be plugged in by
//! implementing the trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    fn not_found(kind: &'static str, id: &str) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        })
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub user_id: Option<String>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which conversations a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility<'a> {
    All,
    /// Conversations nobody owns.
    Ownerless,
    /// The user's own conversations plus the ownerless ones.
    OwnedBy(&'a str),
}

impl Visibility<'_> {
    pub fn admits(&self, conversation: &Conversation) -> bool {
        match (self, conversation.user_id.as_deref()) {
            (Visibility::All, _) | (_, None) => true,
            (Visibility::Ownerless, Some(_)) => false,
            (Visibility::OwnedBy(user), Some(owner)) => owner == *user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub file_path: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub id: String,
    pub message_id: String,
    pub filename: String,
    pub file_path: String,
    pub mime_type: String,
    pub format: String,
    pub created_at: DateTime<Utc>,
}

/// How often an assistant message has been copied by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopyStat {
    pub copy_count: u64,
    pub last_copied_at: Option<DateTime<Utc>>,
}

/// A message together with the files hanging off it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_files: Vec<GeneratedFile>,
    #[serde(default)]
    pub copy_stat: CopyStat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub conversations: usize,
    pub messages: usize,
    pub attachments: usize,
    pub generated_files: usize,
}

/// Fields of a generated file before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewGeneratedFile<'a> {
    pub message_id: &'a str,
    pub filename: &'a str,
    pub file_path: &'a str,
    pub mime_type: &'a str,
    pub format: &'a str,
}

/// Storage for conversations, messages and the files attached to them.
///
/// Implementations own their own transaction discipline; every method may be called
/// concurrently from many in-flight chats.
#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_conversation(
        &self,
        title: &str,
        model: &str,
        owner: Option<&str>,
    ) -> Result<String, StoreError>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    /// Most recently updated first, filtered by `visibility` before paging.
    async fn list_conversations(
        &self,
        visibility: Visibility<'_>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>, StoreError>;

    /// Returns `false` if the conversation does not exist.
    async fn update_conversation_title(&self, id: &str, title: &str) -> Result<bool, StoreError>;

    /// Deletes the conversation together with its messages and their files.
    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError>;

    /// Appends a message and bumps the conversation's `updated_at`.
    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<String, StoreError>;

    /// The conversation a message belongs to; `None` if the message does not exist.
    async fn message_conversation(&self, message_id: &str) -> Result<Option<String>, StoreError>;

    /// Messages of a conversation in creation order.
    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError>;

    async fn add_attachment(
        &self,
        message_id: &str,
        filename: &str,
        file_path: &str,
        mime_type: &str,
    ) -> Result<String, StoreError>;

    async fn add_generated_file(&self, file: NewGeneratedFile<'_>) -> Result<String, StoreError>;

    /// Increment the copy count of a message; `None` if the message does not exist.
    async fn record_copy(&self, message_id: &str) -> Result<Option<CopyStat>, StoreError>;

    async fn copy_stat(&self, message_id: &str) -> Result<Option<CopyStat>, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    id: String,
    conversation_id: String,
    role: Role,
    content: String,
    created_at: DateTime<Utc>,
    copy_stat: CopyStat,
}

/// A [`ChatStore`] that keeps everything in concurrent maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    conversations: Arc<DashMap<String, Conversation>>,
    messages: Arc<DashMap<String, StoredMessage>>,
    attachments: Arc<DashMap<String, Attachment>>,
    generated_files: Arc<DashMap<String, GeneratedFile>>,
    seq: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn message_exists(&self, message_id: &str) -> Result<(), StoreError> {
        if self.messages.contains_key(message_id) {
            Ok(())
        } else {
            Err(StoreError::not_found("message", message_id))
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl ChatStore for InMemoryStore {
    async fn create_conversation(
        &self,
        title: &str,
        model: &str,
        owner: Option<&str>,
    ) -> Result<String, StoreError> {
        let id = new_id();
        let now = Utc::now();
        self.conversations.insert(
            id.clone(),
            Conversation {
                id: id.clone(),
                title: title.to_string(),
                user_id: owner.map(str::to_owned),
                model: model.to_string(),
                created_at: now,
                updated_at: now,
            },
        );
        debug!(conversation_id = %id, "Created conversation");
        Ok(id)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(id).map(|c| c.value().clone()))
    }

    async fn list_conversations(
        &self,
        visibility: Visibility<'_>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Conversation>, StoreError> {
        let mut conversations: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| visibility.admits(c))
            .map(|c| c.value().clone())
            .collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(conversations.into_iter().skip(offset).take(limit).collect())
    }

    async fn update_conversation_title(&self, id: &str, title: &str) -> Result<bool, StoreError> {
        match self.conversations.get_mut(id) {
            Some(mut conversation) => {
                conversation.title = title.to_string();
                conversation.updated_at = Utc::now().max(conversation.created_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool, StoreError> {
        if self.conversations.remove(id).is_none() {
            return Ok(false);
        }
        let message_ids: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == id)
            .map(|m| m.id.clone())
            .collect();
        for message_id in &message_ids {
            self.messages.remove(message_id);
            self.attachments.retain(|_, a| &a.message_id != message_id);
            self.generated_files.retain(|_, f| &f.message_id != message_id);
        }
        debug!(conversation_id = %id, messages = message_ids.len(), "Deleted conversation");
        Ok(true)
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<String, StoreError> {
        let now = Utc::now();
        // The conversation stays locked until the message is in, so a concurrent delete
        // either runs first (and this fails) or sees the message and cascades to it.
        let mut conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;
        conversation.updated_at = now.max(conversation.created_at);

        let id = new_id();
        self.messages.insert(
            id.clone(),
            StoredMessage {
                seq: self.seq.fetch_add(1, Ordering::SeqCst),
                id: id.clone(),
                conversation_id: conversation_id.to_string(),
                role,
                content: content.to_string(),
                created_at: now,
                copy_stat: CopyStat::default(),
            },
        );
        drop(conversation);
        Ok(id)
    }

    async fn message_conversation(&self, message_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .messages
            .get(message_id)
            .map(|m| m.conversation_id.clone()))
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, StoreError> {
        let mut stored: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.value().clone())
            .collect();
        stored.sort_by_key(|m| m.seq);

        let messages = stored
            .into_iter()
            .map(|m| {
                let mut attachments: Vec<Attachment> = self
                    .attachments
                    .iter()
                    .filter(|a| a.message_id == m.id)
                    .map(|a| a.value().clone())
                    .collect();
                attachments.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let mut generated_files: Vec<GeneratedFile> = self
                    .generated_files
                    .iter()
                    .filter(|f| f.message_id == m.id)
                    .map(|f| f.value().clone())
                    .collect();
                generated_files.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Message {
                    id: m.id,
                    conversation_id: m.conversation_id,
                    role: m.role,
                    content: m.content,
                    created_at: m.created_at,
                    attachments,
                    generated_files,
                    copy_stat: m.copy_stat,
                }
            })
            .collect();
        Ok(messages)
    }

    async fn add_attachment(
        &self,
        message_id: &str,
        filename: &str,
        file_path: &str,
        mime_type: &str,
    ) -> Result<String, StoreError> {
        self.message_exists(message_id)?;
        let id = new_id();
        self.attachments.insert(
            id.clone(),
            Attachment {
                id: id.clone(),
                message_id: message_id.to_string(),
                filename: filename.to_string(),
                file_path: file_path.to_string(),
                mime_type: mime_type.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn add_generated_file(&self, file: NewGeneratedFile<'_>) -> Result<String, StoreError> {
        self.message_exists(file.message_id)?;
        let id = new_id();
        self.generated_files.insert(
            id.clone(),
            GeneratedFile {
                id: id.clone(),
                message_id: file.message_id.to_string(),
                filename: file.filename.to_string(),
                file_path: file.file_path.to_string(),
                mime_type: file.mime_type.to_string(),
                format: file.format.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn record_copy(&self, message_id: &str) -> Result<Option<CopyStat>, StoreError> {
        Ok(self.messages.get_mut(message_id).map(|mut m| {
            m.copy_stat.copy_count += 1;
            m.copy_stat.last_copied_at = Some(Utc::now());
            m.copy_stat.clone()
        }))
    }

    async fn copy_stat(&self, message_id: &str) -> Result<Option<CopyStat>, StoreError> {
        Ok(self.messages.get(message_id).map(|m| m.copy_stat.clone()))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(StoreStats {
            conversations: self.conversations.len(),
            messages: self.messages.len(),
            attachments: self.attachments.len(),
            generated_files: self.generated_files.len(),
        })
    }
}
