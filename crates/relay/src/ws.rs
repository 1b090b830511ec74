//! WebSocket surface: frame format, origin allow-listing, and the per-socket
//! pump that bridges an agent's live connection into the shared registry
//! (spec §4.8, §4.8.1).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::model::{BufferedMessage, Envelope};
use crate::server::RelayState;

/// The minimal canonical JSON-framed WebSocket protocol (§4.8.1): `register`,
/// `message`, `ack`, `error`. Internally tagged on `type` so the wire shape
/// matches the spec's `{ type: "..." }` framing exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Register {
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Message {
        from: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Recipient public key. Present on client submission (substitutes
        /// for `POST /v1/send`'s `to` field, since the envelope itself
        /// carries no destination per §3); omitted on server push, where the
        /// frame's recipient is already implicit in which socket it's sent to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        envelope: Envelope,
    },
    Ack {
        id: String,
    },
    Error {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

/// True when the upgrade request's `Origin` is acceptable: absent entirely
/// (non-browser clients) or its hostname is in the configured allow-list.
pub fn origin_allowed(headers: &HeaderMap, allowlist: &[String]) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };

    let host = origin
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split(['/', ':'])
        .next()
        .unwrap_or("");

    allowlist.iter().any(|allowed| allowed == host)
}

pub async fn ws_upgrade_handler(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    if !origin_allowed(&headers, &state.config.origin_allowlist) {
        return (axum::http::StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut registered_as: Option<String> = None;

    let forward = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        let Message::Text(text) = message else { continue };
        let frame: Result<Frame, _> = serde_json::from_str(&text);

        match frame {
            Ok(Frame::Register { public_key, name }) => {
                state.registry.register_ws_agent(public_key.clone(), name, tx.clone()).await;
                registered_as = Some(public_key);
            }
            Ok(Frame::Message { envelope, to, .. }) => {
                handle_incoming_envelope(&state, &tx, envelope, to).await;
            }
            Ok(Frame::Ack { .. }) | Ok(Frame::Error { .. }) => {
                // Clients only ever receive these; ignore if echoed back.
            }
            Err(err) => {
                debug!(%err, "malformed websocket frame");
                let error = Frame::Error { reason: "malformed frame".to_string(), id: None };
                if let Ok(rendered) = serde_json::to_string(&error) {
                    let _ = tx.send(rendered);
                }
            }
        }
    }

    if let Some(public_key) = registered_as {
        state.registry.drop_ws_agent(&public_key).await;
    }
    forward.abort();
}

/// Verifies, dedups, and routes an envelope submitted over the socket
/// (§4.8 signature verification, I4). Integrity failures are silently
/// dropped per spec — no `error` frame is sent for them (§4.8.1).
async fn handle_incoming_envelope(
    state: &Arc<RelayState>,
    reply_to: &mpsc::UnboundedSender<String>,
    envelope: Envelope,
    to: Option<String>,
) {
    if !state.verifier.verify(&envelope.sender, &envelope.signable_bytes(), &envelope.signature) {
        debug!(envelope_id = %envelope.id, "dropping envelope with invalid signature");
        return;
    }
    if !state.registry.mark_seen(&envelope.id).await {
        debug!(envelope_id = %envelope.id, "dropping replayed envelope");
        return;
    }

    let Some(to) = to else {
        let error = Frame::Error { reason: "missing recipient".to_string(), id: Some(envelope.id.clone()) };
        if let Ok(rendered) = serde_json::to_string(&error) {
            let _ = reply_to.send(rendered);
        }
        return;
    };

    push_or_buffer(state, &envelope, &to).await;

    let ack = Frame::Ack { id: envelope.id.clone() };
    if let Ok(rendered) = serde_json::to_string(&ack) {
        let _ = reply_to.send(rendered);
    }
}

/// Pushes a verified envelope to its recipient's live socket, or buffers it
/// if the recipient is only reachable via REST polling.
pub(crate) async fn push_or_buffer(state: &RelayState, envelope: &Envelope, to: &str) -> bool {
    let push_frame = Frame::Message { from: envelope.sender.clone(), name: None, envelope: envelope.clone() };
    if let Ok(rendered) = serde_json::to_string(&push_frame) {
        if state.registry.push_to_ws_agent(to, &rendered).await {
            return true;
        }
    }

    state.registry.buffer(to, BufferedMessage::from(envelope)).await;
    false
}

pub fn new_envelope_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_origin(origin: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::ORIGIN, HeaderValue::from_str(origin).unwrap());
        headers
    }

    #[test]
    fn origin_allowed_without_header_is_permissive() {
        assert!(origin_allowed(&HeaderMap::new(), &["example.com".to_string()]));
    }

    #[test]
    fn origin_allowed_checks_hostname_against_allowlist() {
        let allowlist = vec!["localhost".to_string(), "127.0.0.1".to_string()];
        assert!(origin_allowed(&headers_with_origin("http://localhost:3000"), &allowlist));
        assert!(origin_allowed(&headers_with_origin("https://127.0.0.1"), &allowlist));
        assert!(!origin_allowed(&headers_with_origin("https://evil.example"), &allowlist));
    }

    #[test]
    fn register_frame_round_trips_through_json() {
        let frame = Frame::Register { public_key: "pk-1".to_string(), name: Some("agent-a".to_string()) };
        let rendered = serde_json::to_string(&frame).unwrap();
        assert!(rendered.contains(r#""type":"register""#));
        assert!(rendered.contains(r#""publicKey":"pk-1""#));

        let parsed: Frame = serde_json::from_str(&rendered).unwrap();
        match parsed {
            Frame::Register { public_key, name } => {
                assert_eq!(public_key, "pk-1");
                assert_eq!(name.as_deref(), Some("agent-a"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn message_frame_omits_to_when_absent() {
        let envelope = Envelope {
            id: "env-1".to_string(),
            kind: "ping".to_string(),
            sender: "pk-1".to_string(),
            timestamp: Utc::now(),
            payload: serde_json::json!({}),
            signature: "sig".to_string(),
            in_reply_to: None,
        };
        let frame = Frame::Message { from: "pk-1".to_string(), name: None, to: None, envelope };
        let rendered = serde_json::to_string(&frame).unwrap();
        assert!(!rendered.contains("\"to\""));
    }
}
