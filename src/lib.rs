//! Axi-Match: client-side connection orchestration for anonymous 1:1 video chat
//!
//! A session registers a display name with the matching service, waits for a
//! pairing, then walks the matched pair through the signaling handshake and
//! into a direct peer-to-peer media connection. Chat is relayed through the
//! matching service once connected.

pub mod config;
pub mod error;
pub mod matching;
pub mod media;
pub mod models;
pub mod orchestrator;
pub mod peer;
pub mod queue;
pub mod rtc;
pub mod session;
pub mod signaling;
mod ws;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Notice, SessionHandle, SessionUpdate, SessionUpdates, Severity, spawn};
pub use session::{Role, SessionSnapshot, SessionState};
pub use ws::WsUpdate;
