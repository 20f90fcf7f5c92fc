//! Gateway integration tests: start a real gateway and talk to it over
//! WebSocket + HTTP.
//!
//! Run with: `cargo test -p voxrelay-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use voxrelay_core::config::{AuthConfig, Config, ServerConfig};
use voxrelay_core::frame::{AudioFrame, Codec, FrameFlags};
use voxrelay_core::protocol::{ControlMessage, TtsStatus};
use voxrelay_core::session::SessionState;
use voxrelay_gateway::GatewayState;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_test_gateway(mut config: Config) -> (Arc<GatewayState>, u16) {
    let port = find_free_port();
    let mut server = config.server.take().unwrap_or_default();
    server.bind = Some("127.0.0.1".into());
    config.server = Some(server);

    let state = Arc::new(GatewayState::new(config));
    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = voxrelay_gateway::start_gateway(state_clone, port).await;
    });

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }
    (state, port)
}

async fn connect(port: u16) -> Ws {
    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("Failed to connect");
    ws
}

async fn send_json(ws: &mut Ws, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next data message; `None` once the server closes.
async fn next_message(ws: &mut Ws) -> Option<Message> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("Timeout waiting for gateway");
        match msg {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(msg @ (Message::Text(_) | Message::Binary(_)))) => return Some(msg),
            Some(Ok(_)) => continue,
        }
    }
}

async fn next_control(ws: &mut Ws) -> ControlMessage {
    loop {
        match next_message(ws).await.expect("Connection closed") {
            Message::Text(text) => return ControlMessage::parse_server(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

async fn start_session(ws: &mut Ws, start: serde_json::Value) -> u32 {
    send_json(ws, start).await;
    match next_control(ws).await {
        ControlMessage::Session {
            session_id,
            state: SessionState::Active,
        } => session_id,
        other => panic!("Expected session active, got {other:?}"),
    }
}

fn opus_frame(session_id: u32, seq: u16, speech: bool) -> Message {
    let frame = AudioFrame::new(
        session_id,
        seq as u64 * 20_000_000,
        seq,
        Codec::Opus,
        FrameFlags::new(false, speech),
        Bytes::from_static(&[0xfc; 60]),
    )
    .unwrap();
    Message::Binary(frame.encode())
}

#[tokio::test]
async fn test_health_endpoint() {
    let (state, port) = start_test_gateway(Config::default()).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");
    assert_eq!(resp.status(), 200);

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["sessions"], 0);

    state.shutdown.cancel();
}

#[tokio::test]
async fn test_voice_turn_end_to_end() {
    let (state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;

    let session_id = start_session(
        &mut ws,
        json!({"type": "start", "codec": "opus", "sample_rate": 48000, "bitrate": 24000}),
    )
    .await;
    assert_ne!(session_id, 0);

    for seq in 0..50u16 {
        ws.send(opus_frame(session_id, seq, true)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    send_json(&mut ws, json!({"type": "vad", "speech": false, "seq": 50})).await;

    let mut partials: Vec<String> = Vec::new();
    let mut final_text = None;
    let mut speaking = false;
    let mut audio_seqs: Vec<u16> = Vec::new();

    while audio_seqs.len() < 20 {
        match next_message(&mut ws).await.expect("Connection closed early") {
            Message::Text(text) => match ControlMessage::parse_server(text.as_str()).unwrap() {
                ControlMessage::PartialTranscript { text, .. } => {
                    assert!(final_text.is_none(), "partial after final");
                    partials.push(text);
                }
                ControlMessage::FinalTranscript { text, .. } => final_text = Some(text),
                ControlMessage::TtsState {
                    status: TtsStatus::Speaking,
                } => {
                    assert!(final_text.is_some(), "speech before final transcript");
                    speaking = true;
                }
                ControlMessage::Error { code, message } => panic!("{code}: {message}"),
                _ => {}
            },
            Message::Binary(data) => {
                assert!(speaking, "audio before tts_state speaking");
                let frame = AudioFrame::decode(Bytes::from(data.to_vec())).unwrap();
                assert_eq!(frame.session_id(), session_id);
                assert_eq!(frame.codec(), Codec::Pcm16);
                assert!(frame.is_speech());
                assert_eq!(frame.payload().len(), 1920);
                audio_seqs.push(frame.seq());
            }
            _ => unreachable!(),
        }
    }

    assert!(!partials.is_empty());
    assert!(partials.windows(2).all(|w| w[1].starts_with(w[0].as_str())));
    assert_eq!(
        final_text.as_deref(),
        Some("hello voice relay how are you today")
    );
    assert!(audio_seqs.windows(2).all(|w| w[1] == w[0].wrapping_add(1)));

    let health: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["sessions"], 1);

    state.shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_input_closes_after_limit() {
    let (state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    ws.send(Message::Text("not json".into())).await.unwrap();
    send_json(&mut ws, json!({"type": "final_transcript", "text": "x", "ts": 0})).await;
    send_json(&mut ws, json!({"type": "vad", "speech": true, "seq": 0})).await;
    send_json(
        &mut ws,
        json!({"type": "start", "codec": "pcm16", "sample_rate": 11025, "bitrate": 176400}),
    )
    .await;

    let mut codes = Vec::new();
    while let Some(msg) = next_message(&mut ws).await {
        if let Message::Text(text) = msg {
            if let ControlMessage::Error { code, .. } =
                ControlMessage::parse_server(text.as_str()).unwrap()
            {
                codes.push(code);
            }
        }
    }
    assert_eq!(
        codes,
        vec![
            "frame_error",
            "parse_error",
            "protocol_violation",
            "protocol_violation",
            "protocol_violation",
        ]
    );
    assert!(state.registry.is_empty().await);

    state.shutdown.cancel();
}

#[tokio::test]
async fn test_end_twice_is_harmless() {
    let (state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;
    let start = json!({"type": "start", "codec": "pcm16", "sample_rate": 16000, "bitrate": 256000});

    let first = start_session(&mut ws, start.clone()).await;
    send_json(&mut ws, json!({"type": "end"})).await;
    match next_control(&mut ws).await {
        ControlMessage::Session {
            session_id,
            state: SessionState::Closed,
        } => assert_eq!(session_id, first),
        other => panic!("Expected session closed, got {other:?}"),
    }
    send_json(&mut ws, json!({"type": "end"})).await;

    // The connection survives and accepts a fresh session.
    let second = start_session(&mut ws, start).await;
    assert_ne!(second, first);
    assert_eq!(state.registry.len().await, 1);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if state.registry.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(state.registry.is_empty().await);

    state.shutdown.cancel();
}

#[tokio::test]
async fn test_frame_for_wrong_session_rejected() {
    let (state, port) = start_test_gateway(Config::default()).await;
    let mut ws = connect(port).await;

    let session_id = start_session(
        &mut ws,
        json!({"type": "start", "codec": "opus", "sample_rate": 48000, "bitrate": 24000}),
    )
    .await;
    ws.send(opus_frame(session_id.wrapping_add(1), 0, true))
        .await
        .unwrap();

    match next_control(&mut ws).await {
        ControlMessage::Error { code, .. } => assert_eq!(code, "protocol_violation"),
        other => panic!("Expected error, got {other:?}"),
    }

    state.shutdown.cancel();
}

#[tokio::test]
async fn test_auth_failure_closes_connection() {
    let config = Config {
        server: Some(ServerConfig {
            auth: Some(AuthConfig {
                mode: Some("token".into()),
                token: Some("s3cret".into()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let (state, port) = start_test_gateway(config).await;

    let mut ws = connect(port).await;
    send_json(
        &mut ws,
        json!({"type": "start", "codec": "pcm16", "sample_rate": 16000, "bitrate": 256000,
               "auth": {"type": "token", "token": "wrong"}}),
    )
    .await;
    match next_control(&mut ws).await {
        ControlMessage::Error { code, .. } => assert_eq!(code, "auth_failed"),
        other => panic!("Expected auth error, got {other:?}"),
    }
    assert!(next_message(&mut ws).await.is_none());
    assert!(state.registry.is_empty().await);

    let mut ws = connect(port).await;
    let session_id = start_session(
        &mut ws,
        json!({"type": "start", "codec": "pcm16", "sample_rate": 16000, "bitrate": 256000,
               "auth": {"type": "token", "token": "s3cret"}}),
    )
    .await;
    let session = state
        .registry
        .lookup(voxrelay_core::session::SessionId(session_id))
        .await
        .unwrap();
    assert_eq!(session.auth, voxrelay_core::session::AuthKind::Token);

    state.shutdown.cancel();
}

#[tokio::test]
async fn test_handshake_timeout() {
    let config = Config {
        server: Some(ServerConfig {
            handshake_timeout_ms: 200,
            ..Default::default()
        }),
        ..Default::default()
    };
    let (state, port) = start_test_gateway(config).await;
    let mut ws = connect(port).await;

    match next_control(&mut ws).await {
        ControlMessage::Error { code, .. } => assert_eq!(code, "protocol_violation"),
        other => panic!("Expected error, got {other:?}"),
    }
    assert!(next_message(&mut ws).await.is_none());

    state.shutdown.cancel();
}
