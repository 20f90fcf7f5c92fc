//! Inference stage abstraction.
//!
//! Each external stage (recognition, reasoning, synthesis) is driven through a
//! [`StageBackend`] running under a supervised [`link`]. The session router
//! only ever talks to the typed input/event enums below, never to a backend
//! directly.

use bytes::Bytes;

use voxrelay_core::frame::AudioFrame;

pub mod builder;
pub mod elevenlabs;
pub mod gating;
pub mod link;
pub mod loopback;
pub mod openai;
pub mod retry;
mod speech;
pub mod sse;
pub mod whisper;

pub use builder::{StageBackends, build_backends};
pub use link::{EventSink, LinkControl, LinkEvent, StageBackend, StageHandle, StreamIo};
pub use retry::RetryPolicy;

/// Input to the recognition stage.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionInput {
    /// Ordered, concealed-where-lost client audio.
    Audio(AudioFrame),
    /// The user stopped speaking; produce the final transcript.
    EndOfUtterance,
    /// Abandon the current utterance without a final transcript.
    Cancel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// A hypothesis that later events may revise.
    Partial { text: String, confidence: f32 },
    /// Exactly one per `EndOfUtterance`. May be empty.
    Final { text: String },
}

/// Input to the reasoning stage.
#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningInput {
    Prompt { turn: u64, text: String },
    Cancel { turn: u64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReasoningEvent {
    Token { turn: u64, text: String },
    EndOfTurn { turn: u64 },
    /// Acknowledges `Cancel`.
    Cancelled { turn: u64 },
}

/// Voice parameters carried with every synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceParams {
    pub voice: Option<String>,
    /// Output rate of the PCM16 audio the stage must produce.
    pub sample_rate: u32,
}

/// Input to the synthesis stage.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisInput {
    Speak {
        utterance: u64,
        text: String,
        voice: VoiceParams,
    },
    /// No more text follows for this utterance.
    Finish { utterance: u64 },
    Cancel { utterance: u64 },
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SynthesisEvent {
    /// Mono little-endian PCM16 at the requested rate, in order.
    Audio { utterance: u64, payload: Bytes },
    Complete { utterance: u64 },
    /// Acknowledges `Cancel`. No audio for the utterance follows.
    Cancelled { utterance: u64 },
}

#[cfg(test)]
pub(crate) mod testing {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    /// Answer one HTTP request with a canned body. Returns the base URL and
    /// the raw request as received.
    pub async fn serve_once(content_type: &'static str, body: Vec<u8>) -> (String, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let Some(end) = request.windows(4).position(|w| w == b"\r\n\r\n") else {
                    continue;
                };
                let head = String::from_utf8_lossy(&request[..end]).to_ascii_lowercase();
                if head.contains("transfer-encoding: chunked") {
                    if request.ends_with(b"0\r\n\r\n") {
                        break;
                    }
                    continue;
                }
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if request.len() >= end + 4 + length {
                    break;
                }
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
            socket.shutdown().await.ok();
            let _ = tx.send(request);
        });
        (format!("http://{addr}"), rx)
    }
}
