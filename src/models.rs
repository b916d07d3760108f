//! Request and response bodies for the client-facing API.

use crate::render::OutputFormat;
use crate::store::{Conversation, CopyStat, Message, Role};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Conversation titles are cut to this many characters.
pub const TITLE_CHARS: usize = 30;

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub upstream_conversation_id: Option<String>,
}

impl ChatRequest {
    /// The question to send upstream: the content of the last user message.
    pub fn query(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }
}

/// Title for a new conversation, taken from its first question.
pub fn conversation_title(query: &str) -> String {
    let trimmed = query.trim();
    let mut chars = trimmed.chars();
    let title: String = chars.by_ref().take(TITLE_CHARS).collect();
    if chars.next().is_some() {
        format!("{title}...")
    } else {
        title
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: String,
}

/// Non-streaming answer, shaped like a chat completion plus the conversation ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: serde_json::Value,
    pub conversation_id: String,
    pub upstream_conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<crate::relay::frames::FileBlock>,
}

/// The returned models from the /api/models endpoint.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Model {
    /// The model identifier, which can be passed as `model` in chat requests.
    pub id: String,
    /// The Unix timestamp (in seconds) when the model was created.
    pub created: Option<u32>,
    /// The object type, which is always "model".
    pub object: String,
    /// The organization that owns the model.
    pub owned_by: String,
}

impl Model {
    pub fn new(id: &str) -> Self {
        Model {
            id: id.to_owned(),
            created: None,
            object: "model".into(),
            owned_by: "gateway".into(),
        }
    }
}

/// The response from the /api/models endpoint, which is a list of models.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ListModelResponse {
    /// The object type, which is always "list".
    pub object: String,
    /// A list of model objects.
    pub data: Vec<Model>,
}

impl ListModelResponse {
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        ListModelResponse {
            object: "list".into(),
            data: names.iter().map(|n| Model::new(n.as_ref())).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopResponse {
    pub success: bool,
    pub result: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file_id: String,
    /// Name the client uploaded the file under.
    pub filename: String,
    pub size: usize,
    #[serde(rename = "type")]
    pub mime_type: String,
    pub uploaded_at: chrono::DateTime<chrono::Utc>,
    pub attachment_id: Option<String>,
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
}

/// Body of `POST /api/auth/token`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRequest {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationList {
    pub conversations: Vec<Conversation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// Acknowledgement for updates and deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn success() -> Self {
        Self {
            status: "success".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleUpdate {
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ListQuery {
    #[serde(default = "ListQuery::default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl ListQuery {
    pub const MAX_LIMIT: usize = 100;

    fn default_limit() -> usize {
        20
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: Self::default_limit(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyResponse {
    pub message_id: String,
    #[serde(flatten)]
    pub stat: CopyStat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_request_defaults() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();
        assert_eq!(request.model, "deepseek-chat");
        assert!(request.stream);
        assert_eq!(request.output_format, OutputFormat::Text);
        assert_eq!(request.conversation_id, None);
    }

    #[test]
    fn test_query_is_last_user_message() {
        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "answer"},
                {"role": "user", "content": "second"},
                {"role": "assistant", "content": "pending"}
            ]
        }))
        .unwrap();
        assert_eq!(request.query(), Some("second"));

        let request: ChatRequest = serde_json::from_value(json!({
            "messages": [{"role": "system", "content": "be nice"}]
        }))
        .unwrap();
        assert_eq!(request.query(), None);
    }

    #[test]
    fn test_conversation_title() {
        assert_eq!(conversation_title("  short question "), "short question");
        let long = "a".repeat(31);
        assert_eq!(conversation_title(&long), format!("{}...", "a".repeat(30)));
        assert_eq!(conversation_title(&"a".repeat(30)), "a".repeat(30));
        // Cut on characters, not bytes
        let title = conversation_title(&"é".repeat(40));
        assert_eq!(title.chars().count(), 33);
    }

    #[test]
    fn test_list_models_from_names() {
        let response = ListModelResponse::from_names(&["deepseek-chat", "deepseek-coder"]);
        assert_eq!(response.object, "list");
        assert_eq!(response.data.len(), 2);
        assert_eq!(response.data[1].id, "deepseek-coder");
        assert_eq!(response.data[1].object, "model");
    }
}
