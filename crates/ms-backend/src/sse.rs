//! Line framing for event-stream response bodies.
//!
//! Turns a chunked byte stream into complete, trimmed, non-empty protocol
//! lines. Chunk boundaries may fall anywhere, including inside a multi-byte
//! UTF-8 sequence; bytes are buffered until a newline completes the line.
//! A completed line that is not valid UTF-8 is reported as an error for
//! that line only.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::error::StreamError;

const EVENT_PREFIX: &str = "event: ";
const DATA_PREFIX: &str = "data: ";

/// A recognized protocol line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireLine<'a> {
    /// Text following `event: `.
    Event(&'a str),
    /// Text following `data: `.
    Data(&'a str),
}

impl<'a> WireLine<'a> {
    /// Recognize an `event: ` or `data: ` line. Anything else is ignored.
    pub fn parse(line: &'a str) -> Option<Self> {
        if let Some(name) = line.strip_prefix(EVENT_PREFIX) {
            Some(WireLine::Event(name.trim()))
        } else {
            line.strip_prefix(DATA_PREFIX).map(WireLine::Data)
        }
    }
}

/// Stream wrapper yielding complete lines from a byte stream.
pub struct LineStream<S> {
    inner: S,
    /// Bytes of the line currently being assembled
    buf: Vec<u8>,
    /// Complete lines not yet handed out
    pending: VecDeque<Result<String, StreamError>>,
    done: bool,
}

impl<S> LineStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn push_line(&mut self, raw: &[u8]) {
        let line = match String::from_utf8(raw.to_vec()) {
            Ok(line) => line,
            Err(e) => {
                self.pending.push_back(Err(StreamError::Utf8(e)));
                return;
            }
        };
        let line = line.trim();
        // Blank lines separate events; they carry nothing.
        if !line.is_empty() {
            self.pending.push_back(Ok(line.to_string()));
        }
    }

    fn feed(&mut self, chunk: &[u8]) {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            if self.buf.is_empty() {
                self.push_line(&rest[..pos]);
            } else {
                self.buf.extend_from_slice(&rest[..pos]);
                let line = std::mem::take(&mut self.buf);
                self.push_line(&line);
            }
            rest = &rest[pos + 1..];
        }
        self.buf.extend_from_slice(rest);
    }
}

impl<S, E> Stream for LineStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<StreamError>,
{
    type Item = Result<String, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(line) = this.pending.pop_front() {
                return Poll::Ready(Some(line));
            }
            if this.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.feed(&bytes),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e.into()))),
                Poll::Ready(None) => {
                    // Source exhausted: a final unterminated line is still a line.
                    this.done = true;
                    let tail = std::mem::take(&mut this.buf);
                    this.push_line(&tail);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Frame a byte stream into protocol lines.
pub fn lines<S, E>(stream: S) -> LineStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<StreamError>,
{
    LineStream::new(stream)
}
