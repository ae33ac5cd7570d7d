//! Content fragments carried inside messages and stream envelopes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// One typed piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        #[serde(default)]
        id: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: ToolInput,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(
            default,
            deserialize_with = "text_or_blocks",
            skip_serializing_if = "Vec::is_empty"
        )]
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    /// A content type this client does not model (thinking, server tools, ...).
    #[serde(other)]
    Unknown,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Build a base64 image fragment from raw bytes.
    pub fn image(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Image {
            source: ImageSource::base64(media_type, STANDARD.encode(bytes)),
        }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: ToolInput) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Vec<ContentBlock>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error: false,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text { .. })
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, Self::ToolUse { .. })
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Wire name of this fragment's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::Unknown => "unknown",
        }
    }
}

/// Inline image payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type", default = "default_source_type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

fn default_source_type() -> String {
    "base64".to_string()
}

impl ImageSource {
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            source_type: default_source_type(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    /// Decode the base64 payload back to bytes.
    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(self.data.as_bytes())
    }
}

/// Tool input kept as raw JSON text until a caller asks for a concrete shape.
///
/// The text is always exactly one JSON value; constructors reject anything else.
#[derive(Debug, Clone)]
pub struct ToolInput {
    raw: String,
}

impl ToolInput {
    /// Wrap JSON text, validating that it holds a single JSON value.
    pub fn from_json(raw: impl Into<String>) -> Result<Self, serde_json::Error> {
        let raw = raw.into();
        serde_json::from_str::<IgnoredAny>(&raw)?;
        Ok(Self { raw })
    }

    pub fn from_value(value: &Value) -> Self {
        Self {
            raw: value.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Deserialize the input into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.raw)
    }

    pub fn to_value(&self) -> Value {
        serde_json::from_str(&self.raw).unwrap_or(Value::Null)
    }
}

impl Default for ToolInput {
    fn default() -> Self {
        Self {
            raw: "{}".to_string(),
        }
    }
}

impl PartialEq for ToolInput {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw || self.to_value() == other.to_value()
    }
}

impl Serialize for ToolInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ToolInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

/// Accept either a bare string or a list of fragments.
pub(crate) fn text_or_blocks<'de, D>(deserializer: D) -> Result<Vec<ContentBlock>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrBlocks {
        Text(String),
        Blocks(Vec<ContentBlock>),
    }

    Ok(match Option::<TextOrBlocks>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(TextOrBlocks::Text(text)) => vec![ContentBlock::text(text)],
        Some(TextOrBlocks::Blocks(blocks)) => blocks,
    })
}
