//! Mock response bodies for testing.
//!
//! Renders scripted frames to the exact event-stream text the API sends and
//! hands it out as a byte stream, split at arbitrary boundaries, so every
//! layer above the transport can be tested without real HTTP.

use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures::Stream;
use serde_json::{json, Value};
use tokio::time::sleep;

/// One scripted unit of a mock response body.
#[derive(Debug, Clone)]
pub enum MockFrame {
    MessageStart {
        id: String,
        model: String,
        input_tokens: u32,
    },
    TextStart {
        index: u32,
    },
    TextDelta {
        index: u32,
        text: String,
    },
    ToolStart {
        index: u32,
        id: String,
        name: String,
    },
    InputJson {
        index: u32,
        partial: String,
    },
    BlockStop {
        index: u32,
    },
    MessageDelta {
        stop_reason: String,
        output_tokens: u32,
    },
    MessageStop,
    Ping,
    /// Inline upstream error event.
    Error {
        error_type: String,
        message: String,
    },
    /// Wire text emitted verbatim.
    Raw(String),
    /// Transport failure; nothing after it is sent.
    Disconnect,
    /// Pause before the next frame.
    Delay {
        ms: u64,
    },
}

fn event(name: &str, data: Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

impl MockFrame {
    /// Wire text for this frame. Control frames render as nothing.
    pub fn render(&self) -> String {
        match self {
            MockFrame::MessageStart {
                id,
                model,
                input_tokens,
            } => event(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": id,
                        "type": "message",
                        "role": "assistant",
                        "model": model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": input_tokens, "output_tokens": 1}
                    }
                }),
            ),
            MockFrame::TextStart { index } => event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "text", "text": ""}
                }),
            ),
            MockFrame::TextDelta { index, text } => event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": text}
                }),
            ),
            MockFrame::ToolStart { index, id, name } => event(
                "content_block_start",
                json!({
                    "type": "content_block_start",
                    "index": index,
                    "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}}
                }),
            ),
            MockFrame::InputJson { index, partial } => event(
                "content_block_delta",
                json!({
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "input_json_delta", "partial_json": partial}
                }),
            ),
            MockFrame::BlockStop { index } => event(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": index}),
            ),
            MockFrame::MessageDelta {
                stop_reason,
                output_tokens,
            } => event(
                "message_delta",
                json!({
                    "type": "message_delta",
                    "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                    "usage": {"output_tokens": output_tokens}
                }),
            ),
            MockFrame::MessageStop => event("message_stop", json!({"type": "message_stop"})),
            MockFrame::Ping => event("ping", json!({"type": "ping"})),
            MockFrame::Error {
                error_type,
                message,
            } => event(
                "error",
                json!({
                    "type": "error",
                    "error": {"type": error_type, "message": message}
                }),
            ),
            MockFrame::Raw(text) => text.clone(),
            MockFrame::Disconnect | MockFrame::Delay { .. } => String::new(),
        }
    }
}

/// Configuration for a mock body.
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    /// Frames to emit, in order.
    pub frames: Vec<MockFrame>,
    /// Split each frame into chunks of at most this many bytes.
    pub chunk_size: Option<usize>,
    /// Optional delay before each chunk (ms).
    pub chunk_delay_ms: Option<u64>,
    /// Keep the body open after the last frame instead of ending it.
    pub hold_open: bool,
}

impl MockConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frames(mut self, frames: Vec<MockFrame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = Some(bytes.max(1));
        self
    }

    pub fn with_chunk_delay(mut self, ms: u64) -> Self {
        self.chunk_delay_ms = Some(ms);
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    /// The whole body as one string, ignoring control frames.
    pub fn wire_text(&self) -> String {
        self.frames.iter().map(MockFrame::render).collect()
    }
}

/// Create a response body from mock config.
pub fn mock_body(config: MockConfig) -> impl Stream<Item = Result<Bytes, std::io::Error>> {
    stream! {
        for frame in &config.frames {
            match frame {
                MockFrame::Delay { ms } => {
                    sleep(Duration::from_millis(*ms)).await;
                    continue;
                }
                MockFrame::Disconnect => {
                    yield Err(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        "mock connection reset",
                    ));
                    return;
                }
                _ => {}
            }

            let text = frame.render();
            let size = config.chunk_size.unwrap_or(text.len()).max(1);
            for chunk in text.as_bytes().chunks(size) {
                if let Some(delay_ms) = config.chunk_delay_ms {
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                yield Ok(Bytes::copy_from_slice(chunk));
            }
        }

        if config.hold_open {
            futures::future::pending::<()>().await;
        }
    }
}

/// Built-in test fixtures for common scenarios.
pub mod fixtures {
    use super::*;

    pub const MODEL: &str = "claude-3-5-sonnet-20240620";

    fn opening() -> MockFrame {
        MockFrame::MessageStart {
            id: "msg_mock".to_string(),
            model: MODEL.to_string(),
            input_tokens: 25,
        }
    }

    fn closing(stop_reason: &str, output_tokens: u32) -> [MockFrame; 2] {
        [
            MockFrame::MessageDelta {
                stop_reason: stop_reason.to_string(),
                output_tokens,
            },
            MockFrame::MessageStop,
        ]
    }

    /// A plain text reply streamed in the given pieces.
    pub fn text_reply(chunks: &[&str]) -> MockConfig {
        let mut frames = vec![opening(), MockFrame::TextStart { index: 0 }];
        frames.extend(chunks.iter().map(|chunk| MockFrame::TextDelta {
            index: 0,
            text: (*chunk).to_string(),
        }));
        frames.push(MockFrame::BlockStop { index: 0 });
        frames.extend(closing("end_turn", 15));

        MockConfig::new().with_frames(frames)
    }

    /// Text followed by one tool use whose input arrives in `fragments`.
    pub fn tool_use_reply(text: &str, name: &str, fragments: &[&str]) -> MockConfig {
        let mut frames = vec![
            opening(),
            MockFrame::TextStart { index: 0 },
            MockFrame::TextDelta {
                index: 0,
                text: text.to_string(),
            },
            MockFrame::BlockStop { index: 0 },
            MockFrame::ToolStart {
                index: 1,
                id: "toolu_mock".to_string(),
                name: name.to_string(),
            },
        ];
        frames.extend(fragments.iter().map(|partial| MockFrame::InputJson {
            index: 1,
            partial: (*partial).to_string(),
        }));
        frames.push(MockFrame::BlockStop { index: 1 });
        frames.extend(closing("tool_use", 89));

        MockConfig::new().with_frames(frames)
    }

    /// Text, then an inline error event, then nothing.
    pub fn error_mid_stream(text_before: &str, error_type: &str, message: &str) -> MockConfig {
        MockConfig::new().with_frames(vec![
            opening(),
            MockFrame::TextStart { index: 0 },
            MockFrame::TextDelta {
                index: 0,
                text: text_before.to_string(),
            },
            MockFrame::Error {
                error_type: error_type.to_string(),
                message: message.to_string(),
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn body_text(config: MockConfig) -> String {
        let chunks: Vec<_> = mock_body(config).collect().await;
        let bytes: Vec<u8> = chunks
            .into_iter()
            .flat_map(|chunk| chunk.unwrap().to_vec())
            .collect();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn frames_render_as_event_and_data_lines() {
        let text = MockFrame::TextDelta {
            index: 2,
            text: "hi".to_string(),
        }
        .render();
        assert!(text.starts_with("event: content_block_delta\ndata: {"));
        assert!(text.ends_with("}\n\n"));
        assert!(text.contains(r#""text_delta""#));
        assert!(text.contains(r#""index":2"#));
    }

    #[test]
    fn control_frames_render_empty() {
        assert!(MockFrame::Delay { ms: 5 }.render().is_empty());
        assert!(MockFrame::Disconnect.render().is_empty());
    }

    #[tokio::test]
    async fn chunking_preserves_body() {
        let config = fixtures::text_reply(&["Hello", " wörld"]);
        let whole = config.wire_text();
        assert_eq!(body_text(config.clone().with_chunk_size(3)).await, whole);
        assert_eq!(body_text(config).await, whole);
    }

    #[tokio::test]
    async fn chunk_size_bounds_every_chunk() {
        let config = fixtures::text_reply(&["abc"]).with_chunk_size(4);
        let chunks: Vec<_> = mock_body(config).collect().await;
        assert!(chunks.len() > 10);
        assert!(chunks.iter().all(|c| c.as_ref().unwrap().len() <= 4));
    }

    #[tokio::test]
    async fn disconnect_ends_body_with_error() {
        let config = MockConfig::new().with_frames(vec![
            MockFrame::Ping,
            MockFrame::Disconnect,
            MockFrame::Ping,
        ]);
        let chunks: Vec<_> = mock_body(config).collect().await;
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].is_ok());
        assert_eq!(
            chunks[1].as_ref().unwrap_err().kind(),
            std::io::ErrorKind::ConnectionReset
        );
    }

    #[tokio::test]
    async fn fixture_tool_use_reply() {
        let text = fixtures::tool_use_reply("Checking.", "get_weather", &[r#"{"a":"#, "1}"]).wire_text();
        assert!(text.contains("event: message_start"));
        assert!(text.contains(r#""name":"get_weather""#));
        assert_eq!(text.matches("input_json_delta").count(), 2);
        assert!(text.contains(r#""stop_reason":"tool_use""#));
        assert!(text.ends_with("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"));
    }
}
