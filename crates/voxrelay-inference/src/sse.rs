//! Server-Sent Events parser for streaming HTTP responses.

use std::fmt::Display;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

type ByteStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

struct SseState<E> {
    bytes: ByteStream<E>,
    /// Raw bytes not yet split into lines; lines may straddle chunks.
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl<E> SseState<E> {
    fn next_line(&mut self) -> Option<String> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = self.data.join("\n");
        self.data.clear();
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }

    fn field(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }
        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match name {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
    }
}

/// Parse a streaming HTTP body as SSE.
pub fn parse_sse_stream<S, E>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    futures::stream::unfold(
        SseState {
            bytes: Box::pin(bytes) as ByteStream<E>,
            buffer: Vec::new(),
            event: None,
            data: Vec::new(),
        },
        |mut state| async move {
            loop {
                if let Some(line) = state.next_line() {
                    if line.is_empty() {
                        if let Some(event) = state.dispatch() {
                            return Some((Ok(event), state));
                        }
                    } else {
                        state.field(&line);
                    }
                    continue;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        if !state.buffer.is_empty() {
                            let rest = String::from_utf8_lossy(&state.buffer).into_owned();
                            state.buffer.clear();
                            state.field(rest.trim_end_matches('\r'));
                        }
                        return state.dispatch().map(|event| (Ok(event), state));
                    }
                }
            }
        },
    )
}
