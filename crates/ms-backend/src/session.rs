//! Stream sessions: one response body decoded into envelopes.

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use ms_protocol::{ApiError, Envelope, EnvelopeKind};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::StreamError;
use crate::sse::{lines, WireLine};

/// Counters reported when a session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub lines: usize,
    pub events: usize,
    pub emitted: usize,
    pub errors: usize,
    pub cancelled: bool,
}

/// Decode an event-stream body.
///
/// Line and payload decode failures are yielded inline and decoding
/// continues with the next event. A transport error is yielded once and
/// ends the stream. Cancellation ends the stream without yielding anything
/// further.
pub fn decode_sse<S, E>(
    body: S,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Envelope, StreamError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<StreamError> + Send + 'static,
{
    stream! {
        let mut lines = lines(Box::pin(body));
        let mut dispatcher = Dispatcher::new();
        let mut stats = SessionStats::default();
        debug!("stream session started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stats.cancelled = true;
                    break;
                }
                next = lines.next() => next,
            };

            let line = match next {
                Some(Ok(line)) => line,
                Some(Err(e)) if e.is_recoverable() => {
                    warn!(error = %e, "skipping undecodable line");
                    stats.errors += 1;
                    yield Err(e);
                    continue;
                }
                Some(Err(e)) => {
                    stats.errors += 1;
                    yield Err(e);
                    break;
                }
                None => break,
            };
            stats.lines += 1;

            let payload = match WireLine::parse(&line) {
                Some(WireLine::Event(name)) => {
                    dispatcher.on_event(name);
                    continue;
                }
                Some(WireLine::Data(payload)) => payload,
                None => continue,
            };
            stats.events += 1;

            let result = dispatcher.on_data(payload);
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            match result {
                Ok(Some(envelope)) => {
                    stats.emitted += 1;
                    yield Ok(envelope);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "skipping undecodable event");
                    stats.errors += 1;
                    yield Err(e);
                }
            }
        }

        if dispatcher.open_blocks() > 0 {
            debug!(open = dispatcher.open_blocks(), "stream ended with unfinished tool blocks");
        }
        dispatcher.finish();
        info!(
            lines = stats.lines,
            events = stats.events,
            emitted = stats.emitted,
            errors = stats.errors,
            cancelled = stats.cancelled,
            "stream session ended"
        );
    }
}

/// Decode a whole HTTP response.
///
/// A non-success status yields exactly one error envelope. A success with a
/// JSON body (the server declined to stream) yields one complete envelope.
/// Anything else is decoded as an event stream.
pub fn decode_response(
    response: reqwest::Response,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<Envelope, StreamError>> + Send + 'static {
    stream! {
        let status = response.status();
        let request_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        if !status.is_success() || is_json {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                body = response.text() => body,
            };
            let body = match body {
                Ok(body) => body,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };

            if !status.is_success() {
                warn!(status = status.as_u16(), "request failed before streaming");
                yield Ok(error_envelope(status, request_id, &body));
                return;
            }

            debug!("server answered with a single JSON document");
            match Envelope::from_document(&body) {
                Ok(mut envelope) => {
                    envelope.status = Some(status.as_u16());
                    envelope.request_id = request_id;
                    yield Ok(envelope);
                }
                Err(e) => yield Err(e.into()),
            }
            return;
        }

        let mut envelopes = Box::pin(decode_sse(response.bytes_stream(), cancel));
        while let Some(item) = envelopes.next().await {
            yield item;
        }
    }
}

/// Build the single envelope reported for a failed request.
///
/// Bodies that are not a JSON error document are reported verbatim as an
/// `invalid_error`.
pub fn error_envelope(status: StatusCode, request_id: Option<String>, body: &str) -> Envelope {
    let mut envelope = Envelope::from_document(body)
        .ok()
        .filter(|e| e.error.is_some())
        .unwrap_or_else(|| Envelope::error(ApiError::new("invalid_error", body)));
    envelope.kind = EnvelopeKind::Error;
    envelope.status = Some(status.as_u16());
    envelope.request_id = request_id;
    envelope
}
