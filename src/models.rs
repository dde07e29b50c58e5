use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Conversation session ─────────────────────────────────────────────────────

/// The gateway's view of one logical conversation.
///
/// `backend_chat_id` never changes once set. `current_parent_ref` is `None` only
/// until the first exchange completes, and `conversation_fingerprint` is written
/// exactly once, alongside that first commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub session_id: String,
    pub backend_chat_id: String,
    pub current_parent_ref: Option<String>,
    pub first_user_message_text: String,
    pub conversation_fingerprint: Option<String>,
    pub message_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn new(backend_chat_id: String, first_user_message_text: String, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            backend_chat_id,
            current_parent_ref: None,
            first_user_message_text,
            conversation_fingerprint: None,
            message_count: 0,
            created_at: now,
            last_accessed_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_first_exchange(&self) -> bool {
        self.current_parent_ref.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn touch(&mut self, ttl: Duration) {
        let now = Utc::now();
        self.last_accessed_at = now;
        self.expires_at = now + ttl;
    }
}

/// How a session is looked up in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKey {
    Id(String),
    Fingerprint(String),
}

// ── Backend wire protocol ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireRole {
    System,
    User,
    Assistant,
}

/// One message as sent to the backend. A system message never carries a parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: WireRole,
    pub content: String,
    #[serde(rename = "parent_id")]
    pub parent_ref: Option<String>,
}

impl WireMessage {
    pub fn system(content: String) -> Self {
        Self { role: WireRole::System, content, parent_ref: None }
    }
}

/// Body of one backend exchange.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WireRequest {
    #[serde(skip)]
    pub chat_id: String,
    pub model: String,
    pub stream: bool,
    pub messages: Vec<WireMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreatedChat {
    pub chat_id: String,
}

/// A complete (non-streamed) backend reply.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendReply {
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// One decoded frame of a streamed backend reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendEvent {
    Delta {
        #[serde(default)]
        content: String,
    },
    Done {
        message_id: String,
        #[serde(default)]
        usage: Option<Usage>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

// ── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub param_type: String,
    pub required: bool,
    pub description: String,
}

/// One callable function exposed by the client. Parameters keep declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// An invocation detected in model output.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    /// Exact source text consumed, opening tag through closing tag.
    pub raw_span: String,
}

impl ParsedToolCall {
    pub fn arguments_json(&self) -> String {
        Value::Object(self.arguments.clone()).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    #[serde(rename = "tool_calls")]
    ToolCall,
}

/// The client-visible result of one assistant turn, shared by both response paths.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantOutcome {
    pub content: Option<String>,
    pub tool_call: Option<ParsedToolCall>,
    pub finish_reason: FinishReason,
}

impl AssistantOutcome {
    /// Tool names in the order they appear in the turn.
    pub fn tool_names(&self) -> Vec<String> {
        self.tool_call.iter().map(|c| c.name.clone()).collect()
    }
}
