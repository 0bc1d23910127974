//! Audio/video calls between two chat participants.
//!
//! Offers, answers and connectivity candidates travel through a
//! [`DocumentRelay`](crate::relay::DocumentRelay); media flows directly
//! between the two [`PeerLink`]s once negotiated.
//!
//! # Architecture
//!
//! - [`CallSession`]: one conversation's call lifecycle on the local side
//! - [`CallManager`]: sessions of one participant across conversations
//! - [`PeerLink`] & [`PeerLinkFactory`]: the negotiation backend
//! - [`SimulatedPeerLinkFactory`]: in-process backend for tests and demos

pub mod error;
mod handler;
pub mod link;
pub mod manager;
pub mod session;
pub mod simulated;
#[cfg(feature = "webrtc")]
pub mod webrtc;

pub use error::CallError;
pub use link::{LinkError, LinkEvent, LinkState, PeerLink, PeerLinkFactory};
pub use manager::{CallManager, CallManagerConfig};
pub use session::{CallSession, CallSessionBuilder, CallSnapshot};
pub use simulated::{LinkOp, SimulatedPeerLink, SimulatedPeerLinkFactory};
#[cfg(feature = "webrtc")]
pub use webrtc::{WebRtcPeerLink, WebRtcPeerLinkFactory};
