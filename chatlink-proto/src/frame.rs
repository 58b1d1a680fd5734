//! Channel frame envelope.
//!
//! Every WebSocket text frame carries exactly one JSON-encoded [`Frame`].
//! A client opens with [`Frame::Auth`]; the server answers with
//! [`Frame::Accepted`] or [`Frame::Rejected`]. After that both sides exchange
//! [`Frame::Event`]s until either closes.

use serde::{Deserialize, Serialize};

/// Handshake credentials sent as the first frame of every connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    /// The acting user.
    pub identity: String,
    /// Bearer token bound to `identity`.
    pub credential: String,
}

impl AuthPayload {
    /// Builds an auth payload from its two parts.
    pub fn new(identity: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            credential: credential.into(),
        }
    }
}

// Credentials must never show up in logs.
impl std::fmt::Debug for AuthPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthPayload")
            .field("identity", &self.identity)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client authenticates. Must be the first frame after connecting.
    Auth(AuthPayload),

    /// Server accepted the handshake; the channel is open for events.
    Accepted,

    /// Server refused the handshake.
    Rejected {
        /// Human-readable refusal reason.
        reason: String,
    },

    /// A named application event with an arbitrary JSON body.
    Event {
        /// Event name, see [`crate::event`].
        event: String,
        /// Event body.
        #[serde(default)]
        data: serde_json::Value,
    },

    /// Server is deliberately closing the channel.
    ///
    /// Distinct from a transport drop: the client does not wait for backoff
    /// before reconnecting.
    Close {
        /// Why the server disconnected.
        reason: String,
    },
}

impl Frame {
    /// Shorthand for an [`Frame::Event`] with a serializable body.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Encode`] if `data` cannot be represented as JSON.
    pub fn event<T: Serialize>(event: impl Into<String>, data: &T) -> Result<Self, FrameError> {
        Ok(Self::Event {
            event: event.into(),
            data: serde_json::to_value(data).map_err(FrameError::Encode)?,
        })
    }
}

/// Errors produced while encoding or decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame could not be serialized.
    #[error("frame encode error: {0}")]
    Encode(serde_json::Error),

    /// The bytes were not a valid frame.
    #[error("frame decode error: {0}")]
    Decode(serde_json::Error),
}

/// Encodes a [`Frame`] as a JSON string.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if serialization fails.
pub fn encode(frame: &Frame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(FrameError::Encode)
}

/// Decodes a [`Frame`] from JSON text.
///
/// # Errors
///
/// Returns [`FrameError::Decode`] for malformed input or unknown frame types.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    serde_json::from_str(text).map_err(FrameError::Decode)
}
