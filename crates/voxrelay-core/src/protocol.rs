//! Control message protocol.
//!
//! Control messages travel as JSON text over the same transport as the
//! binary audio frames. Every message is tagged by `type`; unknown tags and
//! messages sent in the wrong direction fail closed.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxRelayError};
use crate::frame::Codec;
use crate::session::SessionState;

/// Which side of the connection originates a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Tagged control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client -> Server: open a session with negotiated media parameters.
    Start {
        codec: Codec,
        sample_rate: u32,
        bitrate: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<AuthClaim>,
    },

    /// Client -> Server: voice activity transition observed at `seq`.
    Vad { speech: bool, seq: u16 },

    /// Client -> Server: close the current session.
    End {},

    /// Server -> Client: recognition hypothesis, may be revised.
    PartialTranscript { text: String, ts: u64 },

    /// Server -> Client: recognition result for a completed user turn.
    FinalTranscript { text: String, ts: u64 },

    /// Server -> Client: synthesized speech state.
    TtsState { status: TtsStatus },

    /// Server -> Client: session lifecycle acknowledgement.
    Session { session_id: u32, state: SessionState },

    /// Server -> Client: soft backpressure signal.
    Flow {
        state: FlowSignalState,
        action: FlowAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bitrate: Option<u32>,
    },

    /// Server -> Client: inference stage availability.
    Status {
        stage: StageKind,
        state: StageStatus,
        message: String,
    },

    /// Server -> Client: a unit of client input was rejected.
    Error { code: String, message: String },
}

impl ControlMessage {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Start { .. } | Self::Vad { .. } | Self::End {} => Direction::ClientToServer,
            _ => Direction::ServerToClient,
        }
    }

    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Vad { .. } => "vad",
            Self::End {} => "end",
            Self::PartialTranscript { .. } => "partial_transcript",
            Self::FinalTranscript { .. } => "final_transcript",
            Self::TtsState { .. } => "tts_state",
            Self::Session { .. } => "session",
            Self::Flow { .. } => "flow",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
        }
    }

    /// Parse a message received from a client.
    pub fn parse_client(text: &str) -> Result<Self> {
        let msg: Self = serde_json::from_str(text)?;
        if msg.direction() != Direction::ClientToServer {
            return Err(VoxRelayError::Protocol(format!(
                "'{}' is not a client message",
                msg.kind()
            )));
        }
        Ok(msg)
    }

    /// Parse a message received from the server.
    pub fn parse_server(text: &str) -> Result<Self> {
        let msg: Self = serde_json::from_str(text)?;
        if msg.direction() != Direction::ServerToClient {
            return Err(VoxRelayError::Protocol(format!(
                "'{}' is not a server message",
                msg.kind()
            )));
        }
        Ok(msg)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Credentials presented with `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthClaim {
    Token { token: String },
    Password { password: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsStatus {
    Speaking,
    Interrupted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowSignalState {
    Asserted,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    ReduceBitrate,
    Pause,
    Resume,
}

/// External inference stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Recognition,
    Reasoning,
    Synthesis,
}

impl StageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recognition => "recognition",
            Self::Reasoning => "reasoning",
            Self::Synthesis => "synthesis",
        }
    }

    /// Client-facing description used when the stage is degraded.
    pub fn unavailable_message(self) -> &'static str {
        match self {
            Self::Recognition => "transcription unavailable",
            Self::Reasoning => "responses unavailable",
            Self::Synthesis => "speech output unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Degraded,
    Restored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_start() {
        let msg = ControlMessage::parse_client(
            r#"{"type":"start","codec":"opus","sample_rate":48000,"bitrate":24000}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ControlMessage::Start {
                codec: Codec::Opus,
                sample_rate: 48000,
                bitrate: 24000,
                auth: None,
            }
        );
    }

    #[test]
    fn test_parse_start_with_token() {
        let msg = ControlMessage::parse_client(
            r#"{"type":"start","codec":"pcm16","sample_rate":16000,"bitrate":256000,
                "auth":{"type":"token","token":"abc"}}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::Start { auth, .. } => {
                assert_eq!(auth, Some(AuthClaim::Token { token: "abc".into() }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_vad_and_end() {
        assert_eq!(
            ControlMessage::parse_client(r#"{"type":"vad","speech":true,"seq":12}"#).unwrap(),
            ControlMessage::Vad { speech: true, seq: 12 }
        );
        assert_eq!(
            ControlMessage::parse_client(r#"{"type":"end"}"#).unwrap(),
            ControlMessage::End {}
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let err = ControlMessage::parse_client(r#"{"type":"reboot"}"#).unwrap_err();
        assert!(matches!(err, VoxRelayError::Json(_)));
    }

    #[test]
    fn test_missing_tag_and_bad_shape_rejected() {
        assert!(ControlMessage::parse_client(r#"{"speech":true}"#).is_err());
        assert!(ControlMessage::parse_client(r#"{"type":"vad","speech":"yes","seq":1}"#).is_err());
        assert!(ControlMessage::parse_client(r#"{"type":"start","codec":"mp3","sample_rate":1,"bitrate":1}"#).is_err());
        assert!(ControlMessage::parse_client("not json").is_err());
    }

    #[test]
    fn test_server_message_from_client_rejected() {
        let err = ControlMessage::parse_client(r#"{"type":"final_transcript","text":"hi","ts":1}"#)
            .unwrap_err();
        assert!(matches!(err, VoxRelayError::Protocol(_)));
    }

    #[test]
    fn test_server_messages_serialize_with_tag() {
        let msg = ControlMessage::TtsState {
            status: TtsStatus::Speaking,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "tts_state", "status": "speaking"}));

        let msg = ControlMessage::Status {
            stage: StageKind::Recognition,
            state: StageStatus::Degraded,
            message: StageKind::Recognition.unavailable_message().into(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["stage"], "recognition");
        assert_eq!(value["message"], "transcription unavailable");
    }

    #[test]
    fn test_parse_server_round_trip() {
        let msg = ControlMessage::Flow {
            state: FlowSignalState::Asserted,
            action: FlowAction::ReduceBitrate,
            bitrate: Some(12000),
        };
        let parsed = ControlMessage::parse_server(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
        assert!(ControlMessage::parse_server(r#"{"type":"end"}"#).is_err());
    }
}
