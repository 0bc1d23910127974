//! Peer link: the negotiation and connectivity object of one call.
//!
//! A link is created fresh for every call attempt, fed the remote description
//! and candidates by the session, and reports its own candidates and
//! connectivity state through an event channel.

use std::sync::Arc;

use async_trait::async_trait;
use lumicore::signaling::{IceCandidateInit, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::media::LocalMedia;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("invalid remote description: {0}")]
    InvalidDescription(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("peer link closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// Terminal failure; the call cannot recover.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Discovered locally; goes out through the candidate collection.
    LocalCandidate(IceCandidateInit),
    StateChanged(LinkState),
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Hand the captured tracks to the link.
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), LinkError>;

    /// Create an offer and install it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, LinkError>;

    /// Create an answer to the remote offer and install it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, LinkError>;

    async fn set_remote_description(&self, description: SessionDescription)
    -> Result<(), LinkError>;

    /// Only valid once a remote description is set.
    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> Result<(), LinkError>;

    /// The event receiver. Returns `Some` once.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>>;

    async fn close(&self);
}

#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerLink>, LinkError>;
}
