//! Envelope types emitted per decoded stream unit.

use serde::{Deserialize, Serialize};

use crate::content::{text_or_blocks, ContentBlock, ToolInput};
use crate::request::Role;

/// Coarse discriminant callers switch on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Message lifecycle marker (start, delta, stop) or a complete message.
    #[default]
    Lifecycle,
    /// A content fragment: text delta, finished tool use, block boundary.
    Content,
    /// Heartbeat.
    Ping,
    /// Upstream error, either inline in the stream or from a failed request.
    Error,
}

/// Why generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
    PauseTurn,
    Refusal,
    #[serde(other)]
    Other,
}

/// Token usage counters. Values on the wire are cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_creation_input_tokens: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cache_read_input_tokens: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Usage {
    /// Fold a later report into this one.
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .max(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .max(other.cache_read_input_tokens);
    }
}

/// Error body returned by the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

/// One decoded unit: metadata plus any content fragments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip)]
    pub kind: EnvelopeKind,
    /// Raw wire event name that produced this envelope.
    #[serde(skip)]
    pub event: Option<String>,
    /// Stream-local block index for content events.
    #[serde(skip)]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(
        default,
        deserialize_with = "text_or_blocks",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
    /// HTTP status, set when the envelope was built from a whole response.
    #[serde(skip)]
    pub status: Option<u16>,
    /// Value of the `request-id` response header, when known.
    #[serde(skip)]
    pub request_id: Option<String>,
}

impl Envelope {
    /// Parse a whole response document (a finished message or an error body).
    pub fn from_document(json: &str) -> Result<Self, serde_json::Error> {
        let mut envelope: Envelope = serde_json::from_str(json)?;
        envelope.kind = if envelope.error.is_some() {
            EnvelopeKind::Error
        } else {
            EnvelopeKind::Lifecycle
        };
        Ok(envelope)
    }

    pub fn ping(event: impl Into<String>) -> Self {
        Self {
            kind: EnvelopeKind::Ping,
            event: Some(event.into()),
            ..Default::default()
        }
    }

    pub fn content(event: impl Into<String>, block: ContentBlock) -> Self {
        Self {
            kind: EnvelopeKind::Content,
            event: Some(event.into()),
            content: vec![block],
            ..Default::default()
        }
    }

    pub fn error(error: ApiError) -> Self {
        Self {
            kind: EnvelopeKind::Error,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn is_delta(&self) -> bool {
        self.event.as_deref().is_some_and(|e| e.ends_with("delta"))
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Concatenated text of all text fragments.
    pub fn text(&self) -> String {
        self.content.iter().filter_map(ContentBlock::as_text).collect()
    }

    /// Finished tool uses carried by this envelope as `(id, name, input)`.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &ToolInput)> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
            _ => None,
        })
    }
}
