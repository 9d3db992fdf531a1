//! Streaming chat endpoint.
//!
//! One WebSocket connection serves one authenticated principal. Each
//! inbound `message` frame starts a pipeline task that writes outbound
//! frames to a bounded channel; a `cancel` frame (or disconnect) cancels
//! the in-flight query via its CancellationToken.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use base64::Engine;
use cortex_core::config::MAX_FRAME_BYTES;
use cortex_core::types::Principal;
use cortex_protocol::frames::{ClientFrame, ServerFrame};
use cortex_tenants::TenantProfile;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::{bearer_token, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Browser WebSocket clients cannot set headers; allow ?token=.
    pub token: Option<String>,
    /// Client-supplied session id; a fresh one is minted when absent.
    pub session: Option<String>,
}

/// Axum handler — authenticates, then upgrades GET /ws/chat.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tenant = state.tenant_for(&headers);

    let bearer = bearer_token(&headers)
        .map(str::to_string)
        .or(query.token.clone())
        .ok_or_else(|| {
            cortex_core::CortexError::Unauthenticated("missing bearer token".into())
        })?;
    let principal = state
        .auth
        .authenticate(&bearer, tenant.id, tenant.mode)
        .await
        .map_err(cortex_core::CortexError::from)?;

    let session_id = query
        .session
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!(
        user_id = %principal.user_id,
        tenant = %tenant.slug,
        session = %session_id,
        "chat connection authenticated"
    );

    Ok(ws.on_upgrade(move |socket| {
        handle_connection(socket, state, tenant, principal, session_id, addr)
    }))
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    tenant: Arc<TenantProfile>,
    principal: Principal,
    session_id: String,
    addr: SocketAddr,
) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(256);

    // In-flight query, if any. A new message supersedes nothing: queries
    // in one session run one at a time; the previous one is canceled.
    let mut active: Option<CancellationToken> = None;
    // Buffered voice chunks between voice_start/voice_stop.
    let mut voice_bytes: Option<usize> = None;

    loop {
        tokio::select! {
            frame = out_rx.recv() => {
                let Some(frame) = frame else { break };
                let json = serde_json::to_string(&frame).unwrap_or_default();
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text: &str = &text;
                        if text.len() > MAX_FRAME_BYTES {
                            warn!(size = text.len(), "frame too large, dropping connection");
                            break;
                        }
                        let frame: ClientFrame = match serde_json::from_str(text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "malformed frame, ignoring");
                                continue;
                            }
                        };
                        handle_frame(
                            frame,
                            &state,
                            &tenant,
                            &principal,
                            &session_id,
                            addr,
                            &out_tx,
                            &mut active,
                            &mut voice_bytes,
                        )
                        .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    // Disconnect aborts the in-flight query; the pipeline still writes a
    // canceled QueryRecord with partial timings.
    if let Some(token) = active {
        token.cancel();
    }
    info!(user_id = %principal.user_id, session = %session_id, "chat connection closed");
}

#[allow(clippy::too_many_arguments)]
async fn handle_frame(
    frame: ClientFrame,
    state: &Arc<AppState>,
    tenant: &Arc<TenantProfile>,
    principal: &Principal,
    session_id: &str,
    addr: SocketAddr,
    out_tx: &mpsc::Sender<ServerFrame>,
    active: &mut Option<CancellationToken>,
    voice_bytes: &mut Option<usize>,
) {
    match frame {
        ClientFrame::Message {
            content,
            department,
            language: _,
            attachments: _,
        } => {
            if !state.rate.allow_ip(addr.ip())
                || !state.rate.allow_user(principal.tenant_id, principal.user_id)
            {
                let _ = out_tx
                    .send(ServerFrame::error("RATE_LIMITED", "slow down"))
                    .await;
                return;
            }

            // One query at a time per connection.
            if let Some(previous) = active.take() {
                previous.cancel();
            }
            let token = CancellationToken::new();
            *active = Some(token.clone());

            let request = cortex_agent::QueryRequest {
                principal: principal.clone(),
                tenant: Arc::clone(tenant),
                query_text: content,
                session_id: session_id.to_string(),
                department_override: department,
            };
            let state = Arc::clone(state);
            let out = out_tx.clone();
            tokio::spawn(async move {
                state.pipeline.handle_query(request, out, token).await;
            });
        }

        ClientFrame::Cancel => {
            if let Some(token) = active.take() {
                token.cancel();
            }
        }

        ClientFrame::VoiceStart => {
            *voice_bytes = Some(0);
        }

        ClientFrame::VoiceChunk { data } => {
            match voice_bytes {
                Some(total) => match base64::engine::general_purpose::STANDARD.decode(&data) {
                    Ok(bytes) => *total += bytes.len(),
                    Err(_) => {
                        let _ = out_tx
                            .send(ServerFrame::error("BAD_VOICE_CHUNK", "invalid base64"))
                            .await;
                    }
                },
                None => {
                    let _ = out_tx
                        .send(ServerFrame::error(
                            "PROTOCOL_ERROR",
                            "voice_chunk before voice_start",
                        ))
                        .await;
                }
            }
        }

        ClientFrame::VoiceStop => {
            // Speech-to-text is an external collaborator; only the frame
            // shapes are fixed here.
            let received = voice_bytes.take().unwrap_or(0);
            let _ = out_tx
                .send(ServerFrame::error(
                    "STT_UNCONFIGURED",
                    format!(
                        "no speech-to-text provider configured ({} bytes discarded)",
                        received
                    ),
                ))
                .await;
        }
    }
}
