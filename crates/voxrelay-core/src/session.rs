//! Session identity, negotiated media parameters and lifecycle.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MediaConfig;
use crate::error::{Result, VoxRelayError};
use crate::frame::Codec;

/// Sample rates an Opus encoder can be negotiated at.
const OPUS_SAMPLE_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Server-assigned session identifier carried in every frame header.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Handshaking,
    Active,
    Draining,
    Closed,
}

/// How the session's client authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Anonymous,
    Token,
    Password,
}

/// Media parameters negotiated by `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaParams {
    pub codec: Codec,
    pub sample_rate: u32,
    pub bitrate: u32,
}

impl MediaParams {
    /// Check the negotiated parameters against what the server accepts.
    pub fn validate(&self, media: &MediaConfig) -> Result<()> {
        if !media.sample_rates.contains(&self.sample_rate) {
            return Err(VoxRelayError::Protocol(format!(
                "unsupported sample rate {}",
                self.sample_rate
            )));
        }

        match self.codec {
            Codec::Opus => {
                if !OPUS_SAMPLE_RATES.contains(&self.sample_rate) {
                    return Err(VoxRelayError::Protocol(format!(
                        "opus cannot run at {} Hz",
                        self.sample_rate
                    )));
                }
                if self.bitrate < media.min_bitrate || self.bitrate > media.max_bitrate {
                    return Err(VoxRelayError::Protocol(format!(
                        "bitrate {} outside {}..={}",
                        self.bitrate, media.min_bitrate, media.max_bitrate
                    )));
                }
            }
            Codec::Pcm16 => {
                // Mono 16-bit PCM has exactly one valid bitrate.
                let expected = self.sample_rate * 16;
                if self.bitrate != expected {
                    return Err(VoxRelayError::Protocol(format!(
                        "pcm16 at {} Hz requires bitrate {expected}",
                        self.sample_rate
                    )));
                }
            }
        }

        Ok(())
    }

    /// Samples per frame of `frame_ms` milliseconds.
    pub fn samples_per_frame(&self, frame_ms: u32) -> usize {
        (self.sample_rate as usize * frame_ms as usize) / 1000
    }
}

/// Per-session record held by the session registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub conn_id: String,
    pub auth: AuthKind,
    pub params: MediaParams,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, conn_id: String, auth: AuthKind, params: MediaParams) -> Self {
        let now = Utc::now();
        Self {
            id,
            conn_id,
            auth,
            params,
            state: SessionState::Handshaking,
            created_at: now,
            last_activity: now,
        }
    }

    /// Handshaking -> Active.
    pub fn activate(&mut self) -> Result<()> {
        self.transition(SessionState::Handshaking, SessionState::Active)
    }

    /// Active -> Draining. Draining an already-draining session is a no-op.
    pub fn begin_drain(&mut self) -> Result<()> {
        if self.state == SessionState::Draining {
            return Ok(());
        }
        self.transition(SessionState::Active, SessionState::Draining)
    }

    /// Move to Closed from any state. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        self.last_activity = Utc::now();
        true
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Active | SessionState::Draining)
    }

    fn transition(&mut self, from: SessionState, to: SessionState) -> Result<()> {
        if self.state != from {
            return Err(VoxRelayError::Session(format!(
                "session {} cannot move {:?} -> {:?} from {:?}",
                self.id, from, to, self.state
            )));
        }
        self.state = to;
        self.touch();
        Ok(())
    }
}
