//! Routing of event payloads to envelopes.
//!
//! One [`Dispatcher`] lives for one stream session. It remembers the most
//! recent `event:` name, owns the tool-use accumulator, and keeps the
//! message-level state (usage, stop reason) that later events refine.

use ms_protocol::{ContentBlock, Envelope, EnvelopeKind, StopReason, Usage};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::accumulator::ToolUseAccumulator;
use crate::error::StreamError;
use crate::event::{Category, DeltaKind, EventKind, Phase};

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: Envelope,
}

#[derive(Debug, Deserialize)]
struct BlockStart {
    index: Option<u32>,
    content_block: ContentBlock,
}

#[derive(Debug, Deserialize)]
struct BlockDelta {
    index: Option<u32>,
    delta: Option<DeltaBody>,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(rename = "type", default)]
    delta_type: String,
    text: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockStop {
    index: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: Option<MessageDeltaBody>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
}

/// Per-session payload router.
#[derive(Default)]
pub struct Dispatcher {
    /// Name from the last `event:` line, consumed by the next `data:` line.
    current_event: Option<String>,
    accumulator: ToolUseAccumulator,
    usage: Option<Usage>,
    message_id: Option<String>,
    model: Option<String>,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the name from an `event:` line.
    pub fn on_event(&mut self, name: &str) {
        self.current_event = Some(name.to_string());
    }

    /// Decode the payload of a `data:` line.
    ///
    /// `Ok(None)` means the payload was absorbed without producing output
    /// (a tool input fragment, an empty delta).
    pub fn on_data(&mut self, payload: &str) -> Result<Option<Envelope>, StreamError> {
        let named = self.current_event.take();
        if let Some(name) = named.as_deref() {
            if EventKind::classify(name).category == Category::Ping {
                return Ok(Some(Envelope::ping(name)));
            }
        }

        let value: Value = serde_json::from_str(payload)?;
        let payload_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(StreamError::MissingType)?;
        let event = named.unwrap_or_else(|| payload_type.to_string());
        let kind = EventKind::classify(&event);
        debug!(event = %event, "dispatching event");

        match (&kind.category, kind.phase) {
            (Category::Ping, _) => Ok(Some(Envelope::ping(event))),
            (Category::Message, Phase::Start) => self.message_start(event, value),
            (Category::Message, Phase::Delta) => self.message_delta(event, value),
            (Category::ContentBlock, Phase::Start) => self.block_start(event, value),
            (Category::ContentBlock, Phase::Delta) => self.block_delta(event, value),
            (Category::ContentBlock, Phase::Stop) => self.block_stop(event, value),
            _ => self.generic(event, &kind, value).map(Some),
        }
    }

    /// Drop any unfinished tool blocks. Partial input is never parsed.
    pub fn finish(&mut self) {
        self.accumulator.clear();
    }

    pub fn open_blocks(&self) -> usize {
        self.accumulator.open_blocks()
    }

    /// Cumulative usage seen so far.
    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    fn merge_usage(&mut self, usage: Option<Usage>) -> Option<Usage> {
        if let Some(report) = usage {
            self.usage.get_or_insert_with(Usage::default).merge(&report);
        }
        self.usage
    }

    fn message_start(&mut self, event: String, value: Value) -> Result<Option<Envelope>, StreamError> {
        let MessageStart { mut message } = serde_json::from_value(value)?;
        self.message_id = message.id.clone();
        self.model = message.model.clone();
        message.usage = self.merge_usage(message.usage);
        message.kind = EnvelopeKind::Lifecycle;
        message.event = Some(event);
        Ok(Some(message))
    }

    fn message_delta(&mut self, event: String, value: Value) -> Result<Option<Envelope>, StreamError> {
        let MessageDelta { delta, usage } = serde_json::from_value(value)?;
        if delta.is_none() && usage.is_none() {
            return Ok(None);
        }

        let mut envelope = Envelope {
            kind: EnvelopeKind::Lifecycle,
            event: Some(event),
            id: self.message_id.clone(),
            usage: self.merge_usage(usage),
            ..Default::default()
        };
        if let Some(delta) = delta {
            if delta.stop_reason.is_some() {
                self.stop_reason = delta.stop_reason;
            }
            if delta.stop_sequence.is_some() {
                self.stop_sequence = delta.stop_sequence.clone();
            }
            envelope.stop_reason = delta.stop_reason;
            envelope.stop_sequence = delta.stop_sequence;
        }
        Ok(Some(envelope))
    }

    fn block_start(&mut self, event: String, value: Value) -> Result<Option<Envelope>, StreamError> {
        let BlockStart {
            index,
            content_block,
        } = serde_json::from_value(value)?;

        if content_block.is_tool_use() {
            self.accumulator.start_block(index, content_block);
            return Ok(None);
        }

        let mut envelope = Envelope::content(event, content_block);
        envelope.index = index;
        Ok(Some(envelope))
    }

    fn block_delta(&mut self, event: String, value: Value) -> Result<Option<Envelope>, StreamError> {
        let BlockDelta { index, delta } = serde_json::from_value(value.clone())?;
        let Some(delta) = delta else {
            return Ok(None);
        };

        match DeltaKind::classify(&delta.delta_type) {
            DeltaKind::Text => {
                let text = delta.text.unwrap_or_default();
                let mut envelope = Envelope::content(event, ContentBlock::text(text));
                envelope.index = index;
                Ok(Some(envelope))
            }
            DeltaKind::InputJson => {
                self.accumulator
                    .append_json(index, delta.partial_json.as_deref());
                Ok(None)
            }
            DeltaKind::Other(delta_type) => {
                debug!(delta_type = %delta_type, "unrecognized delta type, generic parse");
                let kind = EventKind::classify(&event);
                self.generic(event, &kind, value).map(Some)
            }
        }
    }

    fn block_stop(&mut self, event: String, value: Value) -> Result<Option<Envelope>, StreamError> {
        let BlockStop { index } = serde_json::from_value(value.clone())?;

        if self.accumulator.is_active(index) {
            if let Some(block) = self.accumulator.finish_block(index)? {
                let mut envelope = Envelope::content(event, block);
                envelope.index = index;
                return Ok(Some(envelope));
            }
        }

        let kind = EventKind::classify(&event);
        self.generic(event, &kind, value).map(Some)
    }

    /// Best-effort parse of any payload as an envelope.
    fn generic(&mut self, event: String, kind: &EventKind, value: Value) -> Result<Envelope, StreamError> {
        let index = value
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| u32::try_from(i).ok());
        let mut envelope: Envelope = serde_json::from_value(value)?;

        envelope.kind = if envelope.error.is_some() {
            EnvelopeKind::Error
        } else {
            match kind.category {
                Category::ContentBlock => EnvelopeKind::Content,
                Category::Ping => EnvelopeKind::Ping,
                Category::Message | Category::Other(_) => EnvelopeKind::Lifecycle,
            }
        };

        if let Some(error) = &envelope.error {
            warn!(error_type = %error.error_type, message = %error.message, "upstream error event");
        }

        if kind.category == Category::Message && kind.phase == Phase::Stop {
            // The stop event closes the message: carry its final state.
            envelope.id = envelope.id.or_else(|| self.message_id.clone());
            envelope.model = envelope.model.or_else(|| self.model.clone());
            envelope.stop_reason = envelope.stop_reason.or(self.stop_reason);
            envelope.stop_sequence = envelope.stop_sequence.or_else(|| self.stop_sequence.clone());
            envelope.usage = self.merge_usage(envelope.usage);
        }

        envelope.event = Some(event);
        envelope.index = index;
        Ok(envelope)
    }
}
