//! Event name classification.
//!
//! Wire event names are `<category>_<phase>` where the category itself may
//! contain underscores (`content_block_delta`), so the split is anchored on
//! the last underscore.

/// Lifecycle position encoded in an event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Delta,
    Stop,
    None,
}

/// What an event is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Ping,
    Message,
    ContentBlock,
    /// Anything else, kept verbatim for the generic fallback.
    Other(String),
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Ping => "ping",
            Category::Message => "message",
            Category::ContentBlock => "content_block",
            Category::Other(name) => name,
        }
    }
}

/// A classified event name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKind {
    pub category: Category,
    pub phase: Phase,
}

impl EventKind {
    pub fn classify(name: &str) -> Self {
        if name == "ping" {
            return Self {
                category: Category::Ping,
                phase: Phase::None,
            };
        }

        let (prefix, phase) = split_phase(name);
        let category = match prefix {
            "message" => Category::Message,
            "content_block" => Category::ContentBlock,
            other => Category::Other(other.to_string()),
        };
        Self { category, phase }
    }
}

/// Split `name` on its last underscore when the suffix is a known phase.
///
/// Unknown suffixes leave the whole name as the prefix with [`Phase::None`].
pub fn split_phase(name: &str) -> (&str, Phase) {
    if let Some((prefix, suffix)) = name.rsplit_once('_') {
        let phase = match suffix {
            "start" => Some(Phase::Start),
            "delta" => Some(Phase::Delta),
            "stop" => Some(Phase::Stop),
            _ => None,
        };
        if let Some(phase) = phase {
            return (prefix, phase);
        }
    }
    (name, Phase::None)
}

/// Kind of a `content_block_delta` payload, from the delta's own `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaKind {
    Text,
    InputJson,
    Other(String),
}

impl DeltaKind {
    pub fn classify(delta_type: &str) -> Self {
        match split_phase(delta_type) {
            ("text", Phase::Delta) => DeltaKind::Text,
            ("input_json", Phase::Delta) => DeltaKind::InputJson,
            _ => DeltaKind::Other(delta_type.to_string()),
        }
    }
}
