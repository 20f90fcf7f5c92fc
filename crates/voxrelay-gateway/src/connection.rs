//! WebSocket connection lifecycle: handshake, read loop, writer task.
//!
//! The reader validates every inbound unit before it reaches a session.
//! Malformed input is answered with an `error` message and counted; the
//! connection closes once the count reaches the configured limit.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voxrelay_core::config::{MediaConfig, ServerConfig};
use voxrelay_core::frame::AudioFrame;
use voxrelay_core::protocol::{AuthClaim, ControlMessage};
use voxrelay_core::session::{MediaParams, SessionId, SessionState};
use voxrelay_inference::build_backends;

use crate::admission::ConnectionPermit;
use crate::auth::authenticate;
use crate::pipeline::{Inbound, Outbound, SessionPipeline};
use crate::state::GatewayState;

struct ActiveSession {
    id: SessionId,
    params: MediaParams,
    inbound: mpsc::Sender<Inbound>,
    task: JoinHandle<()>,
}

struct Connection {
    state: Arc<GatewayState>,
    conn_id: String,
    server: ServerConfig,
    media: MediaConfig,
    outbound: mpsc::Sender<Outbound>,
    session: Option<ActiveSession>,
    violations: u32,
}

/// Whether the read loop keeps going after handling a message.
enum Flow {
    Continue,
    Close,
}

/// Handle an admitted WebSocket connection until it closes.
pub async fn handle_ws_connection(
    state: Arc<GatewayState>,
    ws: WebSocket,
    permit: ConnectionPermit,
) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, ip = %permit.ip(), "New WebSocket connection");

    let server = state.config.server();
    let (ws_tx, mut ws_rx) = ws.split();
    let (out_tx, out_rx) = mpsc::channel(server.outbound_queue.max(1));
    let writer = tokio::spawn(write_loop(ws_tx, out_rx));

    let mut conn = Connection {
        media: state.config.media(),
        state,
        conn_id: conn_id.clone(),
        server,
        outbound: out_tx,
        session: None,
        violations: 0,
    };
    conn.run(&mut ws_rx).await;
    conn.close_session().await;

    // The writer exits once every sender is gone and the queue is flushed.
    drop(conn);
    if let Err(e) = writer.await {
        error!(conn_id = %conn_id, %e, "Writer task failed");
    }
    drop(permit);
    info!(conn_id = %conn_id, "WebSocket connection closed");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        let msg = match out {
            Outbound::Text(text) => Message::Text(text.into()),
            Outbound::Binary(data) => Message::Binary(data),
            Outbound::Close => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        };
        if ws_tx.send(msg).await.is_err() {
            break;
        }
    }
}

/// Resolves when the session's pipeline task ends on its own.
async fn pipeline_exit(session: &mut Option<ActiveSession>) {
    match session {
        Some(active) => {
            if let Err(e) = (&mut active.task).await {
                error!(session_id = %active.id, %e, "Session pipeline panicked");
            }
        }
        None => std::future::pending().await,
    }
}

impl Connection {
    async fn run(&mut self, ws_rx: &mut SplitStream<WebSocket>) {
        let handshake = tokio::time::sleep(Duration::from_millis(self.server.handshake_timeout_ms));
        tokio::pin!(handshake);
        let mut handshaken = false;

        loop {
            tokio::select! {
                _ = self.state.shutdown.cancelled() => {
                    debug!(conn_id = %self.conn_id, "Gateway shutting down, closing connection");
                    self.close_session().await;
                    self.send(Outbound::Close).await;
                    return;
                }
                _ = &mut handshake, if !handshaken => {
                    warn!(conn_id = %self.conn_id, "Handshake timeout");
                    self.send_control(ControlMessage::error("protocol_violation", "no start received"))
                        .await;
                    self.send(Outbound::Close).await;
                    return;
                }
                _ = pipeline_exit(&mut self.session), if self.session.is_some() => {
                    self.session = None;
                }
                msg = ws_rx.next() => {
                    let flow = match msg {
                        Some(Ok(Message::Text(text))) => self.on_text(text.as_str()).await,
                        Some(Ok(Message::Binary(data))) => self.on_binary(data).await,
                        Some(Ok(Message::Close(_))) => {
                            debug!(conn_id = %self.conn_id, "Client requested close");
                            Flow::Close
                        }
                        // Axum answers pings itself.
                        Some(Ok(_)) => Flow::Continue,
                        Some(Err(e)) => {
                            debug!(conn_id = %self.conn_id, %e, "WebSocket error");
                            Flow::Close
                        }
                        None => Flow::Close,
                    };
                    if matches!(flow, Flow::Close) {
                        return;
                    }
                    if self.violations >= self.server.max_violations {
                        warn!(conn_id = %self.conn_id, violations = self.violations,
                            "Too many malformed messages, closing connection");
                        self.send(Outbound::Close).await;
                        return;
                    }
                    handshaken |= self.session.is_some();
                }
            }
        }
    }

    async fn on_text(&mut self, text: &str) -> Flow {
        let msg = match ControlMessage::parse_client(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.violation(e.code(), e.to_string()).await;
                return Flow::Continue;
            }
        };

        match msg {
            ControlMessage::Start {
                codec,
                sample_rate,
                bitrate,
                auth,
            } => {
                let params = MediaParams {
                    codec,
                    sample_rate,
                    bitrate,
                };
                return self.on_start(params, auth.as_ref()).await;
            }
            ControlMessage::Vad { speech, seq } => match self.session.as_ref().map(|a| a.inbound.clone()) {
                Some(inbound) => {
                    let _ = inbound.send(Inbound::Vad { speech, seq }).await;
                }
                None => {
                    self.violation("protocol_violation", "vad without an active session")
                        .await
                }
            },
            ControlMessage::End {} => self.on_end().await,
            other => {
                self.violation(
                    "protocol_violation",
                    format!("unexpected '{}' message", other.kind()),
                )
                .await
            }
        }
        Flow::Continue
    }

    async fn on_start(&mut self, params: MediaParams, claim: Option<&AuthClaim>) -> Flow {
        if self.session.is_some() {
            self.violation("protocol_violation", "session already active")
                .await;
            return Flow::Continue;
        }

        let auth = match authenticate(self.server.auth.as_ref(), claim) {
            Ok(kind) => kind,
            Err(reason) => {
                warn!(conn_id = %self.conn_id, %reason, "Authentication failed");
                self.send_control(ControlMessage::error("auth_failed", reason))
                    .await;
                self.send(Outbound::Close).await;
                return Flow::Close;
            }
        };

        if let Err(e) = params.validate(&self.media) {
            self.violation(e.code(), e.to_string()).await;
            return Flow::Continue;
        }

        let backends = match build_backends(&self.state.config.inference(), &params) {
            Ok(backends) => backends,
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "Inference backends unavailable");
                self.send_control(ControlMessage::error("inference_error", e.to_string()))
                    .await;
                return Flow::Continue;
            }
        };

        let cancel = self.state.shutdown.child_token();
        let registry = &self.state.registry;
        let session = match registry
            .create(&self.conn_id, auth, params, cancel.clone())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(conn_id = %self.conn_id, error = %e, "Session rejected");
                self.send_control(ControlMessage::error(e.code(), e.to_string()))
                    .await;
                return Flow::Continue;
            }
        };
        let session = match registry.activate(session.id).await {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %session.id, error = %e, "Session activation failed");
                registry.remove(session.id).await;
                self.send_control(ControlMessage::error(e.code(), e.to_string()))
                    .await;
                return Flow::Continue;
            }
        };

        self.send_control(ControlMessage::Session {
            session_id: session.id.0,
            state: SessionState::Active,
        })
        .await;

        let (inbound, task) = SessionPipeline::spawn(
            self.state.clone(),
            &session,
            backends,
            self.outbound.clone(),
            cancel,
        );
        self.session = Some(ActiveSession {
            id: session.id,
            params,
            inbound,
            task,
        });
        Flow::Continue
    }

    async fn on_binary(&mut self, data: Bytes) -> Flow {
        let frame = match AudioFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.violation("frame_error", e.to_string()).await;
                return Flow::Continue;
            }
        };
        if let Err(reason) = self.check_frame(&frame) {
            self.violation("protocol_violation", reason).await;
            return Flow::Continue;
        }
        if let Some(active) = &self.session {
            if active.inbound.send(Inbound::Frame(frame)).await.is_err() {
                debug!(session_id = %active.id, "Pipeline gone, frame dropped");
            }
        }
        Flow::Continue
    }

    fn check_frame(&self, frame: &AudioFrame) -> Result<(), String> {
        let Some(active) = &self.session else {
            return Err("audio frame without an active session".into());
        };
        if frame.payload().len() > self.media.max_payload {
            return Err(format!(
                "payload of {} bytes exceeds {}",
                frame.payload().len(),
                self.media.max_payload
            ));
        }
        if frame.session_id() != active.id.0 {
            return Err(format!(
                "frame for session {:08x} on session {}",
                frame.session_id(),
                active.id
            ));
        }
        if frame.codec() != active.params.codec {
            return Err(format!(
                "codec {} does not match negotiated {}",
                frame.codec().as_str(),
                active.params.codec.as_str()
            ));
        }
        Ok(())
    }

    async fn on_end(&mut self) {
        let Some(active) = self.session.take() else {
            debug!(conn_id = %self.conn_id, "End without a session, ignored");
            return;
        };
        let _ = active.inbound.send(Inbound::End).await;
        drop(active.inbound);
        if let Err(e) = active.task.await {
            error!(session_id = %active.id, %e, "Session pipeline panicked");
        }
    }

    /// End the session, if any, as if the transport had dropped.
    async fn close_session(&mut self) {
        if let Some(active) = self.session.take() {
            drop(active.inbound);
            if let Err(e) = active.task.await {
                error!(session_id = %active.id, %e, "Session pipeline panicked");
            }
        }
    }

    async fn violation(&mut self, code: &str, message: impl Into<String>) {
        let message = message.into();
        self.violations += 1;
        warn!(conn_id = %self.conn_id, code, %message, violations = self.violations,
            "Rejected client input");
        self.send_control(ControlMessage::error(code, message)).await;
    }

    async fn send_control(&self, msg: ControlMessage) {
        if let Some(out) = Outbound::control(&msg) {
            self.send(out).await;
        }
    }

    async fn send(&self, out: Outbound) {
        if self.outbound.send(out).await.is_err() {
            debug!(conn_id = %self.conn_id, "Writer gone, message dropped");
        }
    }
}
