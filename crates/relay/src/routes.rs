//! REST surface: `/v1/register`, `/v1/send`, `/v1/peers`, `/v1/messages`,
//! `/v1/disconnect` (spec §4.8, §6).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use axum::routing::{delete, get, post};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{self, AuthError, Claims};
use crate::error::RelayError;
use crate::model::{Envelope, Peer};
use crate::server::RelayState;
use crate::signing::Ed25519Signer;
use crate::ws::{push_or_buffer, Frame};

pub fn router(state: Arc<RelayState>) -> Router {
    let authenticated = Router::new()
        .route("/v1/send", post(send))
        .route("/v1/peers", get(peers))
        .route("/v1/messages", get(messages))
        .route("/v1/disconnect", delete(disconnect))
        .layer(axum::middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new().route("/v1/register", post(register)).merge(authenticated).with_state(state)
}

/// Decoded bearer claims, attached to the request by [`require_auth`].
#[derive(Clone)]
pub struct AuthedAgent(pub Claims);

async fn require_auth(
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    mut request: axum::extract::Request,
    next: Next,
) -> Result<Response, AuthError> {
    let header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let token = auth::extract_bearer(header)?;

    let Some(secret) = state.config.jwt_secret.as_deref() else {
        return Err(AuthError::Invalid);
    };
    let claims = auth::decode_token(secret, token)?;

    if state.registry.is_revoked(&claims.jti).await {
        return Err(AuthError::Revoked);
    }

    request.extensions_mut().insert(AuthedAgent(claims));
    Ok(next.run(request).await)
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(rename = "privateKey")]
    private_key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: chrono::DateTime<Utc>,
    peers: Vec<Peer>,
}

async fn register(
    State(state): State<Arc<RelayState>>,
    Json(body): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, RelayError> {
    if body.public_key.trim().is_empty() {
        return Err(RelayError::MissingField("publicKey"));
    }
    if body.private_key.trim().is_empty() {
        return Err(RelayError::MissingField("privateKey"));
    }

    // Prove the caller controls the key pair: sign a test envelope and
    // verify it under the supplied public key (§4.8 register contract).
    let signer = Ed25519Signer::from_hex(&body.private_key).map_err(|_| RelayError::InvalidKeyPair)?;
    if signer.public_key_hex() != body.public_key {
        return Err(RelayError::InvalidKeyPair);
    }
    let test_bytes = Envelope::canonical_bytes(
        "proof",
        "register_proof",
        &body.public_key,
        &Utc::now(),
        &serde_json::json!({}),
        None,
    );
    let signature = signer.sign(&test_bytes);
    if !state.verifier.verify(&body.public_key, &test_bytes, &signature) {
        return Err(RelayError::InvalidKeyPair);
    }

    let Some(secret) = state.config.jwt_secret.as_deref() else {
        return Err(RelayError::Unauthorized("relay REST API disabled (no AGORA_RELAY_JWT_SECRET)"));
    };

    let (token, expires_at, jti) =
        auth::mint_token(secret, &body.public_key, body.name.as_deref(), state.config.jwt_expiry_seconds)
            .map_err(|err| RelayError::DeliveryFailed(err.to_string()))?;

    state
        .registry
        .register_session(crate::model::Session {
            public_key: body.public_key.clone(),
            private_key_hex: body.private_key,
            name: body.name,
            metadata: body.metadata,
            registered_at: Utc::now(),
            expires_at,
            token_jti: jti,
        })
        .await;

    let peers = state.registry.peers(&body.public_key).await;
    info!(public_key = %body.public_key, "agent registered with relay");
    Ok(Json(RegisterResponse { token, expires_at, peers }))
}

#[derive(Debug, Deserialize)]
struct SendRequest {
    to: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default, rename = "inReplyTo")]
    in_reply_to: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    ok: bool,
    #[serde(rename = "envelopeId")]
    envelope_id: String,
}

async fn send(
    State(state): State<Arc<RelayState>>,
    axum::Extension(AuthedAgent(claims)): axum::Extension<AuthedAgent>,
    Json(body): Json<SendRequest>,
) -> Result<Json<SendResponse>, RelayError> {
    if body.to.trim().is_empty() {
        return Err(RelayError::MissingField("to"));
    }
    if body.kind.trim().is_empty() {
        return Err(RelayError::MissingField("type"));
    }

    let session = state.registry.session(&claims.public_key).await.ok_or(RelayError::Unauthorized("session lost"))?;
    let signer = Ed25519Signer::from_hex(&session.private_key_hex).map_err(|err| RelayError::DeliveryFailed(err.to_string()))?;

    let id = crate::ws::new_envelope_id();
    let timestamp = Utc::now();
    let bytes = Envelope::canonical_bytes(&id, &body.kind, &claims.public_key, &timestamp, &body.payload, body.in_reply_to.as_deref());
    let signature = signer.sign(&bytes);

    let envelope = Envelope {
        id: id.clone(),
        kind: body.kind,
        sender: claims.public_key,
        timestamp,
        payload: body.payload,
        signature,
        in_reply_to: body.in_reply_to,
    };

    // Priority routing (§4.8 send contract): WS agent OPEN, else REST
    // buffer, else unknown recipient. A WS recipient that's no longer OPEN
    // gets no buffer write — that buffer is REST-poll-only, and the spec's
    // 503 boundary (§8) requires the send to fail clean, not fall back to it.
    let is_ws_recipient = state.registry.is_ws_agent_open(&body.to).await;
    if is_ws_recipient {
        let push_frame = Frame::Message { from: envelope.sender.clone(), name: None, to: None, envelope: envelope.clone() };
        let rendered = serde_json::to_string(&push_frame).map_err(|err| RelayError::DeliveryFailed(err.to_string()))?;
        if !state.registry.push_to_ws_agent(&body.to, &rendered).await {
            return Err(RelayError::RecipientNotOpen);
        }
        return Ok(Json(SendResponse { ok: true, envelope_id: id }));
    }

    if state.registry.session(&body.to).await.is_some() {
        push_or_buffer(&state, &envelope, &body.to).await;
        return Ok(Json(SendResponse { ok: true, envelope_id: id }));
    }

    Err(RelayError::UnknownRecipient)
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    since: Option<i64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct MessagesResponse {
    messages: Vec<crate::model::BufferedMessage>,
    #[serde(rename = "hasMore")]
    has_more: bool,
}

async fn messages(
    State(state): State<Arc<RelayState>>,
    axum::Extension(AuthedAgent(claims)): axum::Extension<AuthedAgent>,
    Query(query): Query<MessagesQuery>,
) -> Json<MessagesResponse> {
    let limit = query.limit.unwrap_or(50).min(100);
    let (messages, has_more) = state.registry.poll(&claims.public_key, query.since, limit).await;
    Json(MessagesResponse { messages, has_more })
}

#[derive(Debug, Serialize)]
struct PeersResponse {
    peers: Vec<Peer>,
}

async fn peers(
    State(state): State<Arc<RelayState>>,
    axum::Extension(AuthedAgent(claims)): axum::Extension<AuthedAgent>,
) -> Json<PeersResponse> {
    Json(PeersResponse { peers: state.registry.peers(&claims.public_key).await })
}

async fn disconnect(
    State(state): State<Arc<RelayState>>,
    axum::Extension(AuthedAgent(claims)): axum::Extension<AuthedAgent>,
) -> impl IntoResponse {
    let expiry = chrono::DateTime::from_timestamp(claims.exp as i64, 0).unwrap_or_else(Utc::now);
    state.registry.revoke(&claims.jti, expiry).await;
    state.registry.drop_session(&claims.public_key).await;
    (StatusCode::OK, Json(serde_json::json!({ "ok": true })))
}
