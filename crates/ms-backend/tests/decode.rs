//! End-to-end decoding properties over scripted response bodies.

use std::time::Duration;

use futures::{Stream, StreamExt};
use ms_backend::accumulator::ToolUseAccumulator;
use ms_backend::event::{Category, EventKind, Phase};
use ms_backend::mock::{fixtures, mock_body, MockConfig, MockFrame};
use ms_backend::{decode_response, decode_sse, StreamError};
use ms_protocol::{ContentBlock, Envelope, EnvelopeKind, StopReason};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn decode(config: MockConfig) -> Vec<Envelope> {
    decode_sse(mock_body(config), CancellationToken::new())
        .map(|item| item.expect("decode error"))
        .collect()
        .await
}

fn tool_inputs(envelopes: &[Envelope]) -> Vec<(String, serde_json::Value)> {
    envelopes
        .iter()
        .flat_map(|e| e.tool_uses())
        .map(|(_, name, input)| (name.to_string(), input.to_value()))
        .collect()
}

#[tokio::test]
async fn interleaved_tool_blocks_keep_their_own_fragments() {
    let config = MockConfig::new()
        .with_frames(vec![
            MockFrame::ToolStart {
                index: 1,
                id: "a".to_string(),
                name: "first".to_string(),
            },
            MockFrame::ToolStart {
                index: 2,
                id: "b".to_string(),
                name: "second".to_string(),
            },
            MockFrame::InputJson {
                index: 2,
                partial: r#"{"city":"#.to_string(),
            },
            MockFrame::InputJson {
                index: 1,
                partial: r#"{"n":"#.to_string(),
            },
            MockFrame::InputJson {
                index: 1,
                partial: "1}".to_string(),
            },
            MockFrame::BlockStop { index: 1 },
            MockFrame::InputJson {
                index: 2,
                partial: r#""Oslo"}"#.to_string(),
            },
            MockFrame::BlockStop { index: 2 },
        ])
        .with_chunk_size(1);

    let envelopes = decode(config).await;
    assert_eq!(
        tool_inputs(&envelopes),
        vec![
            ("first".to_string(), json!({"n": 1})),
            ("second".to_string(), json!({"city": "Oslo"})),
        ]
    );
}

#[tokio::test]
async fn text_and_pings_stream_through_an_open_tool_block() {
    let config = MockConfig::new()
        .with_frames(vec![
            MockFrame::ToolStart {
                index: 1,
                id: "toolu_1".to_string(),
                name: "get_weather".to_string(),
            },
            MockFrame::InputJson {
                index: 1,
                partial: r#"{"location":"#.to_string(),
            },
            MockFrame::Ping,
            MockFrame::TextDelta {
                index: 0,
                text: "x".to_string(),
            },
            MockFrame::InputJson {
                index: 1,
                partial: r#""SF"}"#.to_string(),
            },
            MockFrame::BlockStop { index: 1 },
        ])
        .with_chunk_size(3);

    let envelopes = decode(config).await;

    assert_eq!(envelopes.len(), 3);
    assert_eq!(envelopes[0].kind, EnvelopeKind::Ping);
    assert_eq!(envelopes[1].kind, EnvelopeKind::Content);
    assert_eq!(envelopes[1].text(), "x");
    assert_eq!(envelopes[1].index, Some(0));
    assert_eq!(envelopes[2].kind, EnvelopeKind::Content);
    assert_eq!(envelopes[2].index, Some(1));
    assert_eq!(
        tool_inputs(&envelopes),
        vec![("get_weather".to_string(), json!({"location": "SF"}))]
    );
}

#[test]
fn dangling_indices_are_no_ops() {
    let mut acc = ToolUseAccumulator::new();
    acc.append_json(Some(9), Some(r#"{"x":1}"#));
    assert_eq!(acc.finish_block(Some(9)).unwrap(), None);
    assert_eq!(acc.finish_block(None).unwrap(), None);
}

#[tokio::test]
async fn stop_without_start_is_a_plain_content_event() {
    let config = MockConfig::new().with_frames(vec![MockFrame::BlockStop { index: 4 }]);
    let envelopes = decode(config).await;
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind, EnvelopeKind::Content);
    assert!(envelopes[0].content.is_empty());
}

#[test]
fn classifier_splits_on_last_underscore() {
    let cases = [
        ("ping", Category::Ping, Phase::None),
        ("message_start", Category::Message, Phase::Start),
        ("content_block_delta", Category::ContentBlock, Phase::Delta),
        (
            "unknown_thing",
            Category::Other("unknown_thing".to_string()),
            Phase::None,
        ),
    ];
    for (name, category, phase) in cases {
        let kind = EventKind::classify(name);
        assert_eq!(kind.category, category, "{name}");
        assert_eq!(kind.phase, phase, "{name}");
    }
}

#[tokio::test]
async fn text_reply_round_trip() {
    let envelopes = decode(fixtures::text_reply(&["Hi", " there"]).with_chunk_size(7)).await;

    let text: String = envelopes.iter().map(Envelope::text).collect();
    assert_eq!(text, "Hi there");

    let last = envelopes.last().unwrap();
    assert_eq!(last.event.as_deref(), Some("message_stop"));
    assert_eq!(last.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(last.id.as_deref(), Some("msg_mock"));
    let usage = last.usage.unwrap();
    assert_eq!((usage.input_tokens, usage.output_tokens), (25, 15));
}

#[tokio::test]
async fn tool_input_split_across_frames() {
    let config = fixtures::tool_use_reply(
        "Let me check.",
        "get_weather",
        &[r#"{"loc"#, r#"ation":"SF"#, r#""}"#],
    );
    let envelopes = decode(config).await;

    assert_eq!(
        tool_inputs(&envelopes),
        vec![("get_weather".to_string(), json!({"location": "SF"}))]
    );

    #[derive(serde::Deserialize)]
    struct Weather {
        location: String,
    }
    let (_, _, input) = envelopes.iter().flat_map(|e| e.tool_uses()).next().unwrap();
    assert_eq!(input.decode::<Weather>().unwrap().location, "SF");

    assert_eq!(
        envelopes.last().unwrap().stop_reason,
        Some(StopReason::ToolUse)
    );
}

#[tokio::test]
async fn error_status_yields_one_error_and_no_decoding() {
    let response = http::Response::builder()
        .status(429)
        .header("content-type", "application/json")
        .header("request-id", "req_rate")
        .body(
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#
                .to_string(),
        )
        .unwrap();

    let items: Vec<_> = decode_response(response.into(), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(items.len(), 1);
    let envelope = items[0].as_ref().unwrap();
    assert_eq!(envelope.kind, EnvelopeKind::Error);
    assert_eq!(envelope.status, Some(429));
    assert_eq!(envelope.request_id.as_deref(), Some("req_rate"));
    assert_eq!(envelope.error.as_ref().unwrap().error_type, "rate_limit_error");
}

#[tokio::test]
async fn blank_lines_do_not_change_output() {
    let baseline = decode(fixtures::tool_use_reply("ok", "get_weather", &[r#"{"a":1}"#])).await;

    let mut padded = Vec::new();
    for frame in fixtures::tool_use_reply("ok", "get_weather", &[r#"{"a":1}"#]).frames {
        padded.push(MockFrame::Raw("\n\r\n\n".to_string()));
        padded.push(frame);
    }
    padded.push(MockFrame::Raw("\n\n".to_string()));
    let padded = decode(MockConfig::new().with_frames(padded).with_chunk_size(5)).await;

    assert_eq!(padded, baseline);
}

#[tokio::test]
async fn cancellation_mid_stream_ends_quietly() {
    let cancel = CancellationToken::new();
    let config = fixtures::text_reply(&["one", "two", "three"]).hold_open();
    let mut stream = Box::pin(decode_sse(mock_body(config), cancel.clone()));

    // message_start, content_block_start, first delta
    let mut seen = Vec::new();
    while let Some(item) = stream.next().await {
        let envelope = item.unwrap();
        let done = envelope.text() == "one";
        seen.push(envelope);
        if done {
            break;
        }
    }
    assert_eq!(seen.len(), 3);

    cancel.cancel();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn cancellation_unblocks_a_stalled_body() {
    let cancel = CancellationToken::new();
    let config = fixtures::text_reply(&["partial"]).hold_open();
    let stream = decode_sse(mock_body(config), cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let items: Vec<Result<Envelope, StreamError>> =
        tokio::time::timeout(Duration::from_secs(5), collect(stream))
            .await
            .expect("cancellation did not end the stream");
    assert!(items.iter().all(Result::is_ok));
    let text: String = items.iter().map(|r| r.as_ref().unwrap().text()).collect();
    assert_eq!(text, "partial");
}

async fn collect(
    stream: impl Stream<Item = Result<Envelope, StreamError>>,
) -> Vec<Result<Envelope, StreamError>> {
    stream.collect().await
}

#[tokio::test]
async fn inline_error_event_is_tagged_in_sequence() {
    let envelopes = decode(fixtures::error_mid_stream("Processing...", "overloaded_error", "Overloaded")).await;

    let last = envelopes.last().unwrap();
    assert_eq!(last.kind, EnvelopeKind::Error);
    assert_eq!(last.error.as_ref().unwrap().message, "Overloaded");
    assert!(envelopes[..envelopes.len() - 1]
        .iter()
        .all(|e| e.kind != EnvelopeKind::Error));
}

#[tokio::test]
async fn truncated_tool_input_is_reported_then_decoding_continues() {
    let config = MockConfig::new().with_frames(vec![
        MockFrame::ToolStart {
            index: 0,
            id: "t".to_string(),
            name: "broken".to_string(),
        },
        MockFrame::InputJson {
            index: 0,
            partial: r#"{"unterminated"#.to_string(),
        },
        MockFrame::BlockStop { index: 0 },
        MockFrame::TextDelta {
            index: 1,
            text: "still here".to_string(),
        },
    ]);
    let items: Vec<_> = decode_sse(mock_body(config), CancellationToken::new())
        .collect()
        .await;

    assert_eq!(items.len(), 2);
    assert!(matches!(items[0], Err(StreamError::ToolInput { index: 0, .. })));
    assert_eq!(items[1].as_ref().unwrap().text(), "still here");
}

#[tokio::test]
async fn disconnect_is_reported_once() {
    let mut frames = fixtures::text_reply(&["half"]).frames;
    frames.truncate(3);
    frames.push(MockFrame::Disconnect);
    let items: Vec<_> = decode_sse(
        mock_body(MockConfig::new().with_frames(frames)),
        CancellationToken::new(),
    )
    .collect()
    .await;

    let (last, rest) = items.split_last().unwrap();
    assert!(matches!(last, Err(StreamError::Io(_))));
    assert!(rest.iter().all(Result::is_ok));
    assert!(!last.as_ref().unwrap_err().is_recoverable());
}

#[test]
fn finished_tool_fragment_serializes_as_object() {
    let block = ContentBlock::tool_use(
        "toolu_1",
        "get_weather",
        ms_protocol::ToolInput::from_json(r#"{"location":"SF"}"#).unwrap(),
    );
    assert_eq!(
        serde_json::to_value(&block).unwrap(),
        json!({"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"location": "SF"}})
    );
}
