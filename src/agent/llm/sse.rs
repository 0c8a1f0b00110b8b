//! Server-sent events decoding for streaming model responses.
//!
//! Turns a raw byte stream into the `data:` payload of each event.
//! Lines are split on bytes before UTF-8 decoding, so multi-byte
//! characters cut across network chunks survive intact.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::{Stream, StreamExt};

use crate::error::Error;
use crate::Result;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Stream of SSE event payloads.
pub struct SseStream {
    inner: ByteStream,
    buffer: Vec<u8>,
    data_lines: Vec<String>,
    finished: bool,
}

impl SseStream {
    pub fn new<S, B, E>(byte_stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
        B: AsRef<[u8]> + 'static,
        E: Into<Error> + 'static,
    {
        let inner = byte_stream.map(|chunk| match chunk {
            Ok(bytes) => Ok(bytes.as_ref().to_vec()),
            Err(e) => Err(e.into()),
        });
        Self {
            inner: Box::pin(inner),
            buffer: Vec::new(),
            data_lines: Vec::new(),
            finished: false,
        }
    }

    /// Pop complete lines off the buffer until an event is complete.
    fn next_event(&mut self) -> Option<Result<String>> {
        loop {
            let newline = self.buffer.iter().position(|b| *b == b'\n')?;
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = match String::from_utf8(line) {
                Ok(line) => line,
                Err(e) => {
                    return Some(Err(Error::Model(format!("Invalid UTF-8 in stream: {e}"))));
                }
            };

            // blank line terminates an event
            if line.is_empty() {
                if let Some(data) = self.take_data() {
                    return Some(Ok(data));
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("data:") {
                let value = rest.strip_prefix(' ').unwrap_or(rest);
                self.data_lines.push(value.to_string());
            }
            // comments, "event:", "id:" and "retry:" lines carry nothing we use
        }
    }

    fn take_data(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let data = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(data)
    }
}

impl Stream for SseStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.next_event() {
                return Poll::Ready(Some(event));
            }

            if this.finished {
                return Poll::Ready(this.take_data().map(Ok));
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.buffer.extend_from_slice(&bytes),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    this.finished = true;
                    if !this.buffer.is_empty() {
                        this.buffer.push(b'\n');
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
