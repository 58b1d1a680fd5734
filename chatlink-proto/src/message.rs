//! Application payloads carried inside [`Frame::Event`](crate::frame::Frame::Event).
//!
//! Only the handful of shapes the session layer needs to track generation
//! state are modelled here. Everything else travels as opaque JSON.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content marker the backend sends when a streamed response is finished.
pub const DONE_MARKER: &str = "<done>";

/// Identifies one conversation.
///
/// Opaque on the wire. Fresh ids are random UUIDs; ids received from a
/// shared link are taken verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Creates a new random conversation identifier (UUID v4).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Wraps an externally supplied identifier.
    pub fn from_external(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chunk of a streamed assistant response (`server_message`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Message id; repeated chunks of one response share it.
    #[serde(default)]
    pub id: String,
    /// Conversation the chunk belongs to.
    pub chat_id: ConversationId,
    /// Accumulated content, or [`DONE_MARKER`] when the response ended.
    pub content: String,
    /// Retrieval context attached to the response, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ServerMessage {
    /// Whether this message signals the end of generation.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.content == DONE_MARKER
    }
}

/// A user submission (`chat_message`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    /// Client-generated message id.
    pub id: String,
    /// Conversation the message is posted to.
    pub chat_id: ConversationId,
    /// Always `"user"` for submissions.
    pub role: String,
    /// Message text.
    pub content: String,
}

impl UserMessage {
    /// Creates a user message with a fresh random id.
    pub fn new(chat_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id,
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Request to join the broadcast room of a conversation (`join_chat_room`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRoom {
    /// Conversation to join.
    pub room_id: ConversationId,
}

/// A generated title for a conversation (`autogen_chat_title`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTitle {
    /// Conversation the title belongs to.
    pub chat_id: ConversationId,
    /// The new title.
    #[serde(alias = "title")]
    pub new_title: String,
}
