//! Call session for one conversation.
//!
//! All state lives behind a single tokio mutex: user operations, relay
//! notifications and link events take turns on it. Each call attempt runs
//! under an epoch number; any continuation that finds the epoch moved on
//! (because the call was hung up or replaced while it was suspended)
//! discards what it was holding instead of applying it.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use log::{debug, info, warn};
use lumicore::signaling::{
    self, CandidateQueue, IceCandidateInit, SignalingDocument,
};
use lumicore::state::{CallState, CallTransition, EndedCall};
use lumicore::types::call::{
    CallRole, CallStatus, ConversationId, EndCallReason, MediaKind, PeerId, SessionId,
};
use scopeguard::ScopeGuard;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::error::CallError;
use super::link::{PeerLink, PeerLinkFactory};
use crate::config::CallConfig;
use crate::media::{LocalMedia, MediaDevices};
use crate::relay::{DocumentRelay, RelayError};
use crate::types::events::{CallEnded, CallEventBus, CallFailed, CallStatusChanged};

#[derive(Default)]
pub(super) struct SessionInner {
    pub(super) call: CallState,
    pub(super) epoch: u64,
    /// The offer being rung: ours when calling, the remote one when incoming.
    pub(super) offer: Option<SignalingDocument>,
    /// Our offer write was started, so ending the call must withdraw it.
    pub(super) published: bool,
    /// Our own offer came back through the watcher.
    pub(super) offer_seen: bool,
    pub(super) local_media: Option<LocalMedia>,
    pub(super) peer_link: Option<Arc<dyn PeerLink>>,
    pub(super) pending: CandidateQueue<IceCandidateInit>,
    /// Relay ids of remote candidates already queued or applied this attempt.
    pub(super) seen_candidates: HashSet<String>,
    pub(super) tasks: Vec<JoinHandle<()>>,
    pub(super) last_end: Option<(SessionId, EndCallReason)>,
}

impl SessionInner {
    /// The queue drains exactly when the remote description is accepted.
    pub(super) fn remote_accepted(&self) -> bool {
        self.pending.is_drained()
    }

    pub(super) fn reset_candidates(&mut self) {
        self.pending.reset();
        self.seen_candidates.clear();
    }
}

/// What a teardown detached from the state; released once the lock is gone.
pub(super) struct Released {
    ended: EndedCall,
    media: Option<LocalMedia>,
    link: Option<Arc<dyn PeerLink>>,
    tasks: Vec<JoinHandle<()>>,
    withdraw: Option<SessionId>,
}

/// Point-in-time view of a session, for rendering.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub conversation_id: ConversationId,
    pub status: CallStatus,
    pub role: Option<CallRole>,
    pub media_kind: Option<MediaKind>,
    pub session_id: Option<SessionId>,
    pub remote_peer: Option<PeerId>,
    pub has_local_media: bool,
    pub has_peer_link: bool,
    pub remote_description_set: bool,
    pub pending_candidates: usize,
    pub muted: bool,
    pub video_enabled: bool,
}

pub struct CallSessionBuilder {
    conversation_id: ConversationId,
    local_peer: PeerId,
    relay: Option<Arc<dyn DocumentRelay>>,
    media: Option<Arc<dyn MediaDevices>>,
    links: Option<Arc<dyn PeerLinkFactory>>,
    config: CallConfig,
}

impl CallSessionBuilder {
    pub fn with_relay(mut self, relay: Arc<dyn DocumentRelay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_media_devices(mut self, media: Arc<dyn MediaDevices>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_peer_links(mut self, links: Arc<dyn PeerLinkFactory>) -> Self {
        self.links = Some(links);
        self
    }

    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the session and start watching the conversation's call document.
    pub async fn attach(self) -> Result<Arc<CallSession>, CallError> {
        let relay = self
            .relay
            .ok_or(CallError::MissingDependency("document relay"))?;
        let media = self
            .media
            .ok_or(CallError::MissingDependency("media devices"))?;
        let links = self
            .links
            .ok_or(CallError::MissingDependency("peer link factory"))?;

        let session = Arc::new(CallSession {
            document_key: signaling::call_document_key(&self.conversation_id),
            candidates_key: signaling::candidate_collection_key(&self.conversation_id),
            conversation_id: self.conversation_id,
            local_peer: self.local_peer,
            config: self.config,
            relay,
            media,
            links,
            inner: Mutex::new(SessionInner::default()),
            events: CallEventBus::new(),
            watcher: std::sync::Mutex::new(None),
        });

        let changes = session
            .relay
            .subscribe_document(&session.document_key)
            .await?;
        let watcher = tokio::spawn(CallSession::watch_document(
            Arc::downgrade(&session),
            changes,
        ));
        if let Ok(mut slot) = session.watcher.lock() {
            *slot = Some(watcher);
        }
        info!(
            "Call session attached to {} as {}",
            session.conversation_id, session.local_peer
        );
        Ok(session)
    }
}

pub struct CallSession {
    pub(super) conversation_id: ConversationId,
    pub(super) local_peer: PeerId,
    pub(super) document_key: String,
    pub(super) candidates_key: String,
    pub(super) config: CallConfig,
    pub(super) relay: Arc<dyn DocumentRelay>,
    pub(super) media: Arc<dyn MediaDevices>,
    pub(super) links: Arc<dyn PeerLinkFactory>,
    pub(super) inner: Mutex<SessionInner>,
    pub(super) events: CallEventBus,
    watcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CallSession {
    pub fn builder(
        conversation_id: impl Into<ConversationId>,
        local_peer: impl Into<PeerId>,
    ) -> CallSessionBuilder {
        CallSessionBuilder {
            conversation_id: conversation_id.into(),
            local_peer: local_peer.into(),
            relay: None,
            media: None,
            links: None,
            config: CallConfig::default(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn events(&self) -> &CallEventBus {
        &self.events
    }

    pub async fn status(&self) -> CallStatus {
        self.inner.lock().await.call.status
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let inner = self.inner.lock().await;
        let media = inner.local_media.as_ref();
        CallSnapshot {
            conversation_id: self.conversation_id.clone(),
            status: inner.call.status,
            role: inner.call.role,
            media_kind: inner.call.media_kind,
            session_id: inner.call.session_id.clone(),
            remote_peer: inner.call.remote_peer.clone(),
            has_local_media: media.is_some(),
            has_peer_link: inner.peer_link.is_some(),
            remote_description_set: inner.remote_accepted(),
            pending_candidates: inner.pending.len(),
            muted: media.is_some_and(|m| !m.is_audio_enabled()),
            video_enabled: media.is_some_and(|m| m.is_video_enabled()),
        }
    }

    /// Call the other participant.
    ///
    /// Rejected with [`CallError::Busy`] unless idle and with
    /// [`CallError::CallInProgress`] while the other side's offer is pending.
    /// On any other failure the session is back to idle before this returns.
    pub async fn start_call(self: &Arc<Self>, media_kind: MediaKind) -> Result<(), CallError> {
        {
            let inner = self.inner.lock().await;
            if !inner.call.is_idle() {
                return Err(CallError::Busy(inner.call.status));
            }
        }
        if let Some(raw) = self.relay.get(&self.document_key).await? {
            match SignalingDocument::from_document(&raw) {
                Ok(doc) if doc.is_pending_offer_for(&self.local_peer) => {
                    info!(
                        "Not calling in {}: {} is already calling",
                        self.conversation_id, doc.initiator_id
                    );
                    return Err(CallError::CallInProgress);
                }
                Ok(doc) => debug!(
                    "Replacing leftover call document {} in {}",
                    doc.session_id, self.conversation_id
                ),
                Err(e) => warn!(
                    "Replacing unreadable call document in {}: {e}",
                    self.conversation_id
                ),
            }
        }

        let session_id = SessionId::generate();
        let epoch = {
            let mut inner = self.inner.lock().await;
            if !inner.call.is_idle() {
                return Err(CallError::Busy(inner.call.status));
            }
            inner.call.apply_transition(CallTransition::Dial {
                session_id: session_id.clone(),
                media_kind,
            })?;
            inner.epoch += 1;
            inner.reset_candidates();
            self.emit_status(&inner);
            inner.epoch
        };
        info!(
            "Calling in {} ({media_kind}, session {session_id})",
            self.conversation_id
        );

        let media = match self.media.acquire(media_kind).await {
            Ok(media) => media,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        let link = self.connect_link(epoch, &session_id, media).await?;

        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        let doc = SignalingDocument::offer(
            session_id.clone(),
            offer,
            media_kind,
            self.local_peer.clone(),
        );
        let raw = match doc.to_document() {
            Ok(raw) => raw,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Err(CallError::Cancelled);
            }
            inner.published = true;
            inner.offer = Some(doc);
        }
        if let Err(e) = self.relay.put(&self.document_key, raw).await {
            return Err(self.abort(epoch, e.into()).await);
        }
        let candidates = match self.relay.subscribe_collection(&self.candidates_key).await {
            Ok(candidates) => candidates,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            let withdraw = match &inner.last_end {
                Some((ended, reason)) if ended == &session_id => reason.deletes_signal(),
                _ => true,
            };
            drop(inner);
            // ended while the offer was in flight; the teardown may have run
            // before the write landed
            if withdraw {
                self.withdraw_document(&session_id).await;
            }
            return Err(CallError::Cancelled);
        }
        inner
            .tasks
            .push(self.spawn_remote_candidates(epoch, session_id.clone(), candidates));
        if let Some(timeout) = self.config.ring_timeout() {
            inner.tasks.push(self.spawn_ring_timeout(epoch, timeout));
        }
        info!("Offer {session_id} published in {}", self.conversation_id);
        Ok(())
    }

    /// Accept the ringing offer.
    ///
    /// Fails with [`CallError::StaleOffer`] if the offer was withdrawn or
    /// replaced since it started ringing.
    pub async fn answer_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (epoch, offer) = {
            let inner = self.inner.lock().await;
            match (inner.call.status, &inner.offer) {
                (CallStatus::Incoming, Some(offer)) => (inner.epoch, offer.clone()),
                (status, _) => return Err(CallError::NotRinging(status)),
            }
        };
        info!(
            "Answering {} call {} from {} in {}",
            offer.media_kind, offer.session_id, offer.initiator_id, self.conversation_id
        );

        match self.relay.get(&self.document_key).await {
            Ok(Some(raw)) => match SignalingDocument::from_document(&raw) {
                Ok(current)
                    if current.session_id == offer.session_id && !current.is_answered() => {}
                _ => return Err(self.abort(epoch, CallError::StaleOffer).await),
            },
            Ok(None) => return Err(self.abort(epoch, CallError::StaleOffer).await),
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        }

        let media = match self.media.acquire(offer.media_kind).await {
            Ok(media) => media,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        let link = self.connect_link(epoch, &offer.session_id, media).await?;

        let negotiated = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return Err(CallError::Cancelled);
            }
            match self
                .accept_remote(&mut inner, link.as_ref(), offer.offer_description())
                .await
            {
                Ok(()) => link.create_answer().await,
                Err(e) => Err(e),
            }
        };
        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };

        let patch = match SignalingDocument::answer_patch(&answer, &self.local_peer) {
            Ok(patch) => patch,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        match self.relay.update(&self.document_key, patch).await {
            Ok(()) => {}
            Err(RelayError::NotFound(_)) => {
                return Err(self.abort(epoch, CallError::StaleOffer).await);
            }
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return Err(CallError::Cancelled);
        }
        inner.call.apply_transition(CallTransition::Answer)?;
        self.emit_status(&inner);
        info!("Connected in {} as callee", self.conversation_id);
        Ok(())
    }

    /// End the call from this side. Safe in any state and never fails;
    /// relay errors while withdrawing the document are only logged.
    pub async fn hang_up(&self) {
        let released = {
            let mut inner = self.inner.lock().await;
            self.end_locked(&mut inner, EndCallReason::LocalHangup)
        };
        match released {
            Some(released) => self.release(released).await,
            None => debug!("Hang up in {} while idle", self.conversation_id),
        }
    }

    /// Flip the microphone. Returns whether it is now muted.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let inner = self.inner.lock().await;
        let media = inner.local_media.as_ref().ok_or(CallError::NoLocalMedia)?;
        let muted = media.is_audio_enabled();
        media.set_audio_enabled(!muted);
        debug!("Microphone in {} muted: {muted}", self.conversation_id);
        Ok(muted)
    }

    /// Flip the camera. Returns whether video is now sent; always `false` for
    /// audio calls.
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let inner = self.inner.lock().await;
        let media = inner.local_media.as_ref().ok_or(CallError::NoLocalMedia)?;
        let enabled = !media.is_video_enabled();
        media.set_video_enabled(enabled);
        Ok(enabled && media.has_video())
    }

    /// Stop watching the conversation and end any call in it.
    pub async fn detach(&self) {
        if let Ok(mut slot) = self.watcher.lock()
            && let Some(watcher) = slot.take()
        {
            watcher.abort();
        }
        self.hang_up().await;
    }

    /// Create a fresh link, give it the media and make both part of the
    /// current attempt.
    async fn connect_link(
        self: &Arc<Self>,
        epoch: u64,
        session_id: &SessionId,
        media: LocalMedia,
    ) -> Result<Arc<dyn PeerLink>, CallError> {
        let link = match self.links.create(&self.config.ice_servers).await {
            Ok(link) => link,
            Err(e) => return Err(self.abort(epoch, e.into()).await),
        };
        let link = scopeguard::guard(link, |link| {
            tokio::spawn(async move { link.close().await });
        });
        if let Err(e) = link.attach_media(&media).await {
            return Err(self.abort(epoch, e.into()).await);
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return Err(CallError::Cancelled);
        }
        let link = ScopeGuard::into_inner(link);
        if let Some(events) = link.take_events() {
            inner
                .tasks
                .push(self.spawn_link_events(epoch, session_id.clone(), events));
        }
        inner.local_media = Some(media);
        inner.peer_link = Some(link.clone());
        Ok(link)
    }

    /// Move the call to idle and detach its resources. `None` when already idle.
    pub(super) fn end_locked(
        &self,
        inner: &mut SessionInner,
        reason: EndCallReason,
    ) -> Option<Released> {
        let ended = match inner.call.apply_transition(CallTransition::Ended { reason }) {
            Ok(Some(ended)) => ended,
            Ok(None) | Err(_) => return None,
        };
        inner.epoch += 1;

        let owns_document = inner.published || ended.role == Some(CallRole::Callee);
        let withdraw = if reason.deletes_signal() && owns_document {
            ended.session_id.clone()
        } else {
            None
        };
        inner.last_end = ended.session_id.clone().map(|id| (id, reason));
        inner.offer = None;
        inner.published = false;
        inner.offer_seen = false;
        inner.reset_candidates();
        self.emit_status(inner);

        Some(Released {
            ended,
            media: inner.local_media.take(),
            link: inner.peer_link.take(),
            tasks: mem::take(&mut inner.tasks),
            withdraw,
        })
    }

    pub(super) fn fail_locked(
        &self,
        inner: &mut SessionInner,
        error: &CallError,
    ) -> Option<Released> {
        let reason = error.end_reason();
        let released = self.end_locked(inner, reason)?;
        warn!("Call in {} failed: {error}", self.conversation_id);
        let _ = self.events.call_failed.send(Arc::new(CallFailed {
            conversation_id: self.conversation_id.clone(),
            reason,
            message: error.to_string(),
        }));
        Some(released)
    }

    /// End the attempt `epoch` because of `error`. `false` if that attempt
    /// was already over.
    pub(super) async fn fail(&self, epoch: u64, error: &CallError) -> bool {
        let released = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch {
                return false;
            }
            self.fail_locked(&mut inner, error)
        };
        match released {
            Some(released) => {
                self.release(released).await;
                true
            }
            None => false,
        }
    }

    async fn abort(&self, epoch: u64, error: CallError) -> CallError {
        if self.fail(epoch, &error).await {
            error
        } else {
            CallError::Cancelled
        }
    }

    pub(super) async fn release(&self, released: Released) {
        let Released {
            ended,
            media,
            link,
            tasks,
            withdraw,
        } = released;
        for task in tasks {
            task.abort();
        }
        if let Some(media) = media {
            media.stop();
        }
        if let Some(link) = link {
            link.close().await;
        }
        if let Some(session_id) = withdraw {
            self.withdraw_document(&session_id).await;
        }
        info!(
            "Call in {} ended: {:?} (connected {}s)",
            self.conversation_id,
            ended.reason,
            ended.duration_secs.unwrap_or(0)
        );
        let _ = self.events.call_ended.send(Arc::new(CallEnded {
            conversation_id: self.conversation_id.clone(),
            reason: ended.reason,
            role: ended.role,
            duration_secs: ended.duration_secs,
        }));
    }

    /// Delete the call document and its candidates, unless the document
    /// already belongs to a different attempt.
    pub(super) async fn withdraw_document(&self, session_id: &SessionId) {
        match self.relay.get(&self.document_key).await {
            Ok(None) => return,
            Ok(Some(raw)) => {
                if let Ok(doc) = SignalingDocument::from_document(&raw)
                    && &doc.session_id != session_id
                {
                    debug!(
                        "Call document in {} now belongs to {}, leaving it",
                        self.conversation_id, doc.session_id
                    );
                    return;
                }
            }
            Err(e) => warn!(
                "Could not read call document in {} before deleting it: {e}",
                self.conversation_id
            ),
        }
        if let Err(e) = self.relay.delete_collection(&self.candidates_key).await {
            warn!(
                "Failed to clear candidates in {}: {e}",
                self.conversation_id
            );
        }
        if let Err(e) = self.relay.delete(&self.document_key).await {
            warn!(
                "Failed to delete call document in {}: {e}",
                self.conversation_id
            );
        }
    }

    pub(super) fn emit_status(&self, inner: &SessionInner) {
        let _ = self.events.status_changed.send(Arc::new(CallStatusChanged {
            conversation_id: self.conversation_id.clone(),
            status: inner.call.status,
            role: inner.call.role,
            media_kind: inner.call.media_kind,
        }));
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.watcher.lock()
            && let Some(watcher) = slot.take()
        {
            watcher.abort();
        }
    }
}
