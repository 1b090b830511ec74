use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The canonical signed unit transported between agents via the relay (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "inReplyTo")]
    pub in_reply_to: Option<String>,
}

impl Envelope {
    /// Bytes signed/verified over: every field except `signature`, in a
    /// fixed order, so both sides compute the same canonical form.
    pub fn canonical_bytes(
        id: &str,
        kind: &str,
        sender: &str,
        timestamp: &DateTime<Utc>,
        payload: &serde_json::Value,
        in_reply_to: Option<&str>,
    ) -> Vec<u8> {
        let canonical = serde_json::json!({
            "id": id,
            "type": kind,
            "sender": sender,
            "timestamp": timestamp.to_rfc3339(),
            "payload": payload,
            "inReplyTo": in_reply_to,
        });
        serde_json::to_vec(&canonical).expect("canonical envelope is always serializable")
    }

    pub fn signable_bytes(&self) -> Vec<u8> {
        Self::canonical_bytes(
            &self.id,
            &self.kind,
            &self.sender,
            &self.timestamp,
            &self.payload,
            self.in_reply_to.as_deref(),
        )
    }
}

/// An agent session owned by the registry (§3). `private_key_hex` is held
/// only in process memory, used to sign envelopes the relay sends on this
/// REST session's behalf, and is never logged or persisted.
#[derive(Debug, Clone)]
pub struct Session {
    pub public_key: String,
    pub private_key_hex: String,
    pub name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub registered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub token_jti: String,
}

/// A message sitting in a recipient's bounded buffer, awaiting poll (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub id: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_name: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "inReplyTo")]
    pub in_reply_to: Option<String>,
}

impl From<&Envelope> for BufferedMessage {
    fn from(envelope: &Envelope) -> Self {
        Self {
            id: envelope.id.clone(),
            from: envelope.sender.clone(),
            from_name: None,
            kind: envelope.kind.clone(),
            payload: envelope.payload.clone(),
            timestamp: envelope.timestamp,
            in_reply_to: envelope.in_reply_to.clone(),
        }
    }
}

/// A peer as listed in `/v1/peers` — WebSocket agents win over REST sessions
/// when the same `publicKey` appears in both sets (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub transport: PeerTransport,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerTransport {
    WebSocket,
    Rest,
}
