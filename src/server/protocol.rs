//! Protocol message definitions
//!
//! Defines the JSON messages exchanged between chat clients and the relay.
//! Inbound messages are a loose record keyed by `type`; outbound shapes are
//! fixed by the existing client and must not change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text of the welcome acknowledgment sent on connect
pub const WELCOME_TEXT: &str = "Welcome new client";

/// Text of the malformed-input acknowledgment
pub const INVALID_FORMAT_TEXT: &str = "Invalid message format";

/// Query parameter carrying the connection identity on the handshake URL
pub const IDENTITY_PARAM: &str = "user";

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Wire form of an inbound message before the routing variant is chosen
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

/// Messages sent from a client to the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEnvelope {
    /// Broadcast chat text (`type: "send"`, or the `chat` alias)
    Send {
        /// Free text to relay
        message: String,
    },

    /// Broadcast of a user identifier (`type: "receive"`)
    Receive {
        /// Content relayed under the `received` key
        user: String,
    },

    /// Any other tag: private delivery to one identity
    Direct {
        /// Identity of the recipient
        target: String,
        /// Content to deliver
        message: String,
    },
}

impl ClientEnvelope {
    /// Parse and validate a client envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let raw: RawEnvelope = serde_json::from_str(json)?;

        match raw.kind.as_deref() {
            Some("send") | Some("chat") => Ok(ClientEnvelope::Send {
                message: required(raw.message, "message", "send")?,
            }),
            Some("receive") => Ok(ClientEnvelope::Receive {
                user: required(raw.user, "user", "receive")?,
            }),
            _ => Ok(ClientEnvelope::Direct {
                target: required(raw.user, "user", "direct")?,
                message: required(raw.message, "message", "direct")?,
            }),
        }
    }

    /// Short name of the routing variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::Send { .. } => "send",
            ClientEnvelope::Receive { .. } => "receive",
            ClientEnvelope::Direct { .. } => "direct",
        }
    }
}

fn required(value: Option<String>, field: &str, variant: &str) -> ProtocolResult<String> {
    value.ok_or_else(|| {
        ProtocolError::InvalidMessage(format!("missing field `{}` for {} message", field, variant))
    })
}

// ============================================================================
// Server Messages
// ============================================================================

/// Relayed chat payload. The content key differs per tag (`sent` vs
/// `received`); clients depend on this.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayPayload {
    Send { sent: String },
    Receive { received: String },
}

impl RelayPayload {
    /// Create a `send`-tagged payload
    pub fn sent(content: impl Into<String>) -> Self {
        RelayPayload::Send {
            sent: content.into(),
        }
    }

    /// Create a `receive`-tagged payload
    pub fn received(content: impl Into<String>) -> Self {
        RelayPayload::Receive {
            received: content.into(),
        }
    }
}

/// Messages sent from the relay to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ServerMessage {
    /// Broadcast or directed chat content
    Relay(RelayPayload),

    /// Malformed-input acknowledgment
    Error { error: String },

    /// Welcome message sent on connection
    Welcome { message: String },
}

impl ServerMessage {
    /// Create the Welcome message
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            message: WELCOME_TEXT.to_string(),
        }
    }

    /// Create the malformed-input acknowledgment
    pub fn invalid_format() -> Self {
        ServerMessage::Error {
            error: INVALID_FORMAT_TEXT.to_string(),
        }
    }

    /// Serialize to the JSON text frame body
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<RelayPayload> for ServerMessage {
    fn from(payload: RelayPayload) -> Self {
        ServerMessage::Relay(payload)
    }
}

/// Extract the identity from a handshake query string (`user=alex&...`).
///
/// Returns `None` when the parameter is absent or empty. The value is taken
/// verbatim; identities are opaque.
pub fn identity_from_query(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .find(|(key, _)| *key == IDENTITY_PARAM)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
