//! Session registry, per-recipient buffers, and the revocation set — the
//! relay's process-wide shared state (spec §3, §4.8, §9 "Global mutable
//! state"). Each map is guarded by its own `tokio::sync::Mutex`, matching the
//! parallel-runtime guidance in spec §5.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

use crate::model::{BufferedMessage, Peer, PeerTransport, Session};

/// A connected WebSocket agent — tracked purely as a live socket keyed by
/// `publicKey`, per §4.8.1 (no JWT is involved for the WS transport itself).
pub struct WsAgent {
    pub name: Option<String>,
    pub sender: mpsc::UnboundedSender<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    DeliveredLive,
    Buffered,
    UnknownRecipient,
    RecipientNotOpen,
}

/// Bounded FIFO buffer of undelivered messages for one REST recipient (I5).
struct Buffer {
    capacity: usize,
    messages: VecDeque<BufferedMessage>,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self { capacity, messages: VecDeque::new() }
    }

    fn push(&mut self, message: BufferedMessage) {
        if self.messages.len() >= self.capacity {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }
}

/// The relay's shared state: session registry, per-agent buffers, the
/// revocation set, connected WebSocket agents, and the envelope dedup set.
pub struct Registry {
    buffer_capacity: usize,
    sessions: Mutex<HashMap<String, Session>>,
    buffers: Mutex<HashMap<String, Buffer>>,
    revoked: Mutex<HashMap<String, DateTime<Utc>>>,
    ws_agents: Mutex<HashMap<String, WsAgent>>,
    dedup: Mutex<HashSet<String>>,
}

impl Registry {
    pub fn new(buffer_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_capacity,
            sessions: Mutex::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            revoked: Mutex::new(HashMap::new()),
            ws_agents: Mutex::new(HashMap::new()),
            dedup: Mutex::new(HashSet::new()),
        })
    }

    // ── session registry ────────────────────────────────────────────────

    pub async fn register_session(&self, session: Session) {
        self.prune_expired().await;
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.public_key.clone(), session);
    }

    pub async fn session(&self, public_key: &str) -> Option<Session> {
        self.sessions.lock().await.get(public_key).cloned()
    }

    pub async fn drop_session(&self, public_key: &str) {
        self.sessions.lock().await.remove(public_key);
        self.buffers.lock().await.remove(public_key);
    }

    async fn prune_expired(&self) {
        let now = Utc::now();
        self.sessions.lock().await.retain(|_, session| session.expires_at > now);
    }

    // ── revocation set ──────────────────────────────────────────────────

    pub async fn revoke(&self, jti: &str, expiry: DateTime<Utc>) {
        let now = Utc::now();
        let mut revoked = self.revoked.lock().await;
        revoked.retain(|_, exp| *exp > now);
        revoked.insert(jti.to_string(), expiry);
    }

    pub async fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.lock().await.contains_key(jti)
    }

    // ── WebSocket agent registry ────────────────────────────────────────

    pub async fn register_ws_agent(&self, public_key: String, name: Option<String>, sender: mpsc::UnboundedSender<String>) {
        self.ws_agents.lock().await.insert(public_key, WsAgent { name, sender });
    }

    pub async fn drop_ws_agent(&self, public_key: &str) {
        self.ws_agents.lock().await.remove(public_key);
    }

    /// Pushes a frame directly to an OPEN WebSocket agent. Returns `false`
    /// when no such agent is connected (the caller falls back to buffering).
    pub async fn push_to_ws_agent(&self, public_key: &str, frame: &str) -> bool {
        let agents = self.ws_agents.lock().await;
        match agents.get(public_key) {
            Some(agent) => agent.sender.send(frame.to_string()).is_ok(),
            None => false,
        }
    }

    pub async fn is_ws_agent_open(&self, public_key: &str) -> bool {
        self.ws_agents.lock().await.contains_key(public_key)
    }

    // ── per-recipient buffer ────────────────────────────────────────────

    pub async fn buffer(&self, public_key: &str, message: BufferedMessage) {
        let mut buffers = self.buffers.lock().await;
        buffers.entry(public_key.to_string()).or_insert_with(|| Buffer::new(self.buffer_capacity)).push(message);
    }

    /// Returns messages strictly newer than `since` (ms since epoch), newest
    /// `limit`-bounded, and whether more matching entries existed. When
    /// `since` is `None` the buffer is cleared after the response is built
    /// (§4.8 poll contract).
    pub async fn poll(&self, public_key: &str, since_ms: Option<i64>, limit: usize) -> (Vec<BufferedMessage>, bool) {
        let mut buffers = self.buffers.lock().await;
        let Some(buffer) = buffers.get_mut(public_key) else {
            return (Vec::new(), false);
        };

        let matching: Vec<BufferedMessage> = match since_ms {
            Some(since) => buffer
                .messages
                .iter()
                .filter(|m| m.timestamp.timestamp_millis() > since)
                .cloned()
                .collect(),
            None => buffer.messages.iter().cloned().collect(),
        };

        let has_more = matching.len() > limit;
        let page: Vec<BufferedMessage> = matching.into_iter().take(limit).collect();

        if since_ms.is_none() {
            buffer.messages.clear();
        }

        (page, has_more)
    }

    // ── envelope dedup set (I4) ─────────────────────────────────────────

    /// Returns `true` if `id` was newly inserted (i.e. not previously seen).
    pub async fn mark_seen(&self, id: &str) -> bool {
        self.dedup.lock().await.insert(id.to_string())
    }

    pub async fn load_dedup_seed(&self, ids: HashSet<String>) {
        *self.dedup.lock().await = ids;
    }

    pub async fn dedup_snapshot(&self) -> HashSet<String> {
        self.dedup.lock().await.clone()
    }

    // ── peers ────────────────────────────────────────────────────────────

    /// Merged peer set minus `exclude`, WebSocket winning over REST on
    /// conflict (§4.8 peers contract).
    pub async fn peers(&self, exclude: &str) -> Vec<Peer> {
        let mut merged: HashMap<String, Peer> = HashMap::new();

        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            if session.public_key == exclude {
                continue;
            }
            merged.insert(
                session.public_key.clone(),
                Peer { public_key: session.public_key.clone(), name: session.name.clone(), transport: PeerTransport::Rest },
            );
        }
        drop(sessions);

        let ws_agents = self.ws_agents.lock().await;
        for (public_key, agent) in ws_agents.iter() {
            if public_key == exclude {
                continue;
            }
            merged.insert(
                public_key.clone(),
                Peer { public_key: public_key.clone(), name: agent.name.clone(), transport: PeerTransport::WebSocket },
            );
        }

        merged.into_values().collect()
    }
}
