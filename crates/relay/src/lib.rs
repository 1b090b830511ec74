//! Agent-to-agent relay: signed envelopes exchanged over a JWT-authenticated
//! REST API (poll/send) and a live WebSocket push channel (§4.8).

pub mod auth;
pub mod error;
pub mod model;
pub mod registry;
pub mod routes;
pub mod server;
pub mod signing;
pub mod ws;

pub use error::RelayError;
pub use model::{BufferedMessage, Envelope, Peer, PeerTransport, Session};
pub use registry::Registry;
pub use server::{run, RelayState};
pub use signing::{generate_keypair, Ed25519Signer, Ed25519Verifier, Signer, Verifier};
