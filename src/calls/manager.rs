//! Call manager: the call sessions of one local participant.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use lumicore::types::call::{ConversationId, MediaKind, PeerId};

use super::error::CallError;
use super::link::PeerLinkFactory;
use super::session::{CallSession, CallSnapshot};
use crate::config::CallConfig;
use crate::media::MediaDevices;
use crate::relay::DocumentRelay;

/// Configuration for the call manager.
#[derive(Clone, Debug)]
pub struct CallManagerConfig {
    pub call: CallConfig,
    /// Calls that may be ringing or connected at once across conversations.
    /// Zero refuses every call.
    pub max_concurrent_calls: usize,
}

impl Default for CallManagerConfig {
    fn default() -> Self {
        Self {
            call: CallConfig::default(),
            max_concurrent_calls: 1,
        }
    }
}

/// Attaches one [`CallSession`] per conversation on first use and shares the
/// relay, media devices and link factory between them.
pub struct CallManager {
    local_peer: PeerId,
    relay: Arc<dyn DocumentRelay>,
    media: Arc<dyn MediaDevices>,
    links: Arc<dyn PeerLinkFactory>,
    config: CallManagerConfig,
    sessions: DashMap<ConversationId, Arc<CallSession>>,
}

impl CallManager {
    pub fn new(
        local_peer: impl Into<PeerId>,
        relay: Arc<dyn DocumentRelay>,
        media: Arc<dyn MediaDevices>,
        links: Arc<dyn PeerLinkFactory>,
        config: CallManagerConfig,
    ) -> Self {
        Self {
            local_peer: local_peer.into(),
            relay,
            media,
            links,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn get(&self, conversation: &ConversationId) -> Option<Arc<CallSession>> {
        self.sessions.get(conversation).map(|s| s.value().clone())
    }

    /// The conversation's session, attaching it if needed.
    pub async fn session(
        &self,
        conversation: &ConversationId,
    ) -> Result<Arc<CallSession>, CallError> {
        if let Some(session) = self.get(conversation) {
            return Ok(session);
        }
        let session = CallSession::builder(conversation.clone(), self.local_peer.clone())
            .with_relay(self.relay.clone())
            .with_media_devices(self.media.clone())
            .with_peer_links(self.links.clone())
            .with_config(self.config.call.clone())
            .attach()
            .await?;

        let entry = self
            .sessions
            .entry(conversation.clone())
            .or_insert_with(|| session.clone())
            .value()
            .clone();
        if !Arc::ptr_eq(&entry, &session) {
            debug!("Session for {conversation} attached concurrently, dropping ours");
            session.detach().await;
        }
        Ok(entry)
    }

    /// Snapshots of every session that is not idle.
    pub async fn active_calls(&self) -> Vec<CallSnapshot> {
        let sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        let mut active = Vec::new();
        for session in sessions {
            let snapshot = session.snapshot().await;
            if !snapshot.status.is_idle() {
                active.push(snapshot);
            }
        }
        active
    }

    async fn check_capacity(&self, conversation: &ConversationId) -> Result<(), CallError> {
        let busy: Vec<_> = self
            .active_calls()
            .await
            .into_iter()
            .filter(|s| &s.conversation_id != conversation)
            .collect();
        if busy.len() < self.config.max_concurrent_calls {
            return Ok(());
        }
        let Some(other) = busy.first() else {
            info!("Refusing call in {conversation}: calls are disabled");
            return Err(CallError::CallsDisabled);
        };
        info!(
            "Refusing call in {conversation}: already {} in {}",
            other.status, other.conversation_id
        );
        Err(CallError::Busy(other.status))
    }

    pub async fn start_call(
        &self,
        conversation: &ConversationId,
        media_kind: MediaKind,
    ) -> Result<Arc<CallSession>, CallError> {
        self.check_capacity(conversation).await?;
        let session = self.session(conversation).await?;
        session.start_call(media_kind).await?;
        Ok(session)
    }

    pub async fn answer_call(
        &self,
        conversation: &ConversationId,
    ) -> Result<Arc<CallSession>, CallError> {
        self.check_capacity(conversation).await?;
        let session = self.session(conversation).await?;
        session.answer_call().await?;
        Ok(session)
    }

    /// Hang up in `conversation`, if a session exists there.
    pub async fn hang_up(&self, conversation: &ConversationId) {
        if let Some(session) = self.get(conversation) {
            session.hang_up().await;
        }
    }

    pub async fn detach(&self, conversation: &ConversationId) {
        if let Some((_, session)) = self.sessions.remove(conversation) {
            session.detach().await;
        }
    }

    /// Hang up everywhere and stop watching every conversation.
    pub async fn shutdown(&self) {
        let conversations: Vec<_> = self.sessions.iter().map(|s| s.key().clone()).collect();
        info!("Shutting down {} call sessions", conversations.len());
        for conversation in conversations {
            self.detach(&conversation).await;
        }
    }
}
