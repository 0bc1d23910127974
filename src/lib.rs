//! Peer-to-peer audio/video call negotiation over a shared document relay.
//!
//! The pure call model and wire documents live in [`lumicore`]; this crate
//! adds the async session machinery, relay backends, media and link seams.

pub use lumicore;
pub use lumicore::types::call::{
    CallRole, CallStatus, ConversationId, EndCallReason, MediaKind, PeerId, SessionId,
};

pub mod calls;
pub mod config;
pub mod media;
pub mod relay;

pub mod types {
    pub mod events;
}

pub use calls::{CallError, CallManager, CallManagerConfig, CallSession};
pub use config::Config;
