use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================
// Core Domain Models
// ============================================================

/// A registered user. The password hash never leaves the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    #[serde(default)]
    pub profile: HashMap<String, String>,
    #[serde(default)]
    pub emotional_log: Vec<EmotionEntry>,
    #[serde(default)]
    pub subscribed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Safe projection for `/profile`: no hash, no internal log dump.
    pub fn safe(&self) -> SafeUser {
        SafeUser {
            id: self.id,
            email: self.email.clone(),
            profile: self.profile.clone(),
            subscribed: self.subscribed,
            created_at: self.created_at,
        }
    }
}

/// Public view of a user returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeUser {
    pub id: Uuid,
    pub email: String,
    pub profile: HashMap<String, String>,
    pub subscribed: bool,
    pub created_at: DateTime<Utc>,
}

/// One append-only entry in a user's emotional log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmotionEntry {
    pub emotion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Short-term conversational memory. Rows older than the retention
/// window are swept by the background purge loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMessage {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role: String, // "user" or "assistant"
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Task lifecycle: queued → processing → completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "processing" => Some(TaskStatus::Processing),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A deferred unit of work inferred from a completion (or enqueued directly).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub user_id: Uuid,
    pub task_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i32, // 0-10, higher runs first
    pub created_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

// ============================================================
// In-band Marker Payloads
// ============================================================

/// Emotion inferred by the model via an `EMOTION_LOG` marker,
/// normalized by the extractor (intensity clamped to 1-10).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredEmotion {
    pub emotion: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intensity: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Task inferred by the model via a `TASK_INFERENCE` marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredTask {
    pub task_type: String,
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

// ============================================================
// Intelligence Context (opaque to everything except the compressor)
// ============================================================

pub type LayerMap = serde_json::Map<String, serde_json::Value>;

/// Four analytical layers of behavioral context. The gateway treats the
/// contents as opaque JSON; only the compressor interprets them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntelligenceContext {
    #[serde(default)]
    pub micro: LayerMap,
    #[serde(default)]
    pub medium: LayerMap,
    #[serde(rename = "macro", default)]
    pub macro_layer: LayerMap,
    #[serde(default)]
    pub synthesis: LayerMap,
}

impl IntelligenceContext {
    pub fn is_empty(&self) -> bool {
        self.micro.is_empty()
            && self.medium.is_empty()
            && self.macro_layer.is_empty()
            && self.synthesis.is_empty()
    }
}

// ============================================================
// API Request/Response Types
// ============================================================

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: SafeUser,
}

/// Request body for `POST /completion`.
#[derive(Debug, Clone, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_model")]
    pub model: String,
    /// Budget hint for the compressor; see recognized values in the compressor.
    #[serde(default = "default_message_type")]
    pub message_type: String,
    /// 0-10 scale; feeds the compressor's complexity factor.
    #[serde(default)]
    pub complexity: f64,
    pub context: Option<IntelligenceContext>,
}

fn default_stream() -> bool {
    true
}

fn default_model() -> String {
    "solace-chat".to_string()
}

fn default_message_type() -> String {
    "standard".to_string()
}

/// Response body for a non-streaming completion.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
}

/// Request body for `POST /emotions`.
#[derive(Debug, Deserialize)]
pub struct LogEmotionRequest {
    pub mood: String,
    pub intensity: i32,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Request body for `PUT /profile`: entries are merged into the profile.
#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub profile: HashMap<String, String>,
}

// ============================================================
// SSE Wire Payloads
// ============================================================

/// JSON payload of one SSE frame. The wire carries exactly two shapes:
/// `{"content": "..."}` and `{"error": true, "message": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Content { content: String },
    Error { error: bool, message: String },
}

impl StreamEvent {
    pub fn content(text: impl Into<String>) -> Self {
        StreamEvent::Content { content: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error { error: true, message: message.into() }
    }
}

// ============================================================
// Tests
// ============================================================
