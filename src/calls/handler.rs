//! Reactions to relay notifications and link events.
//!
//! Every handler takes the session lock for its whole run, so candidate
//! application and the remote description never interleave.

use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use lumicore::signaling::{
    GlareOutcome, IceCandidateInit, SessionDescription, SignalingCandidate, SignalingDocument,
    resolve_glare,
};
use lumicore::state::CallTransition;
use lumicore::types::call::{CallStatus, EndCallReason, SessionId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::error::CallError;
use super::link::{LinkError, LinkEvent, PeerLink};
use super::session::{CallSession, Released, SessionInner};
use crate::relay::{CollectionItem, Document, DocumentChange, Subscription};
use crate::types::events::{IncomingCall, LinkStateChanged};

/// Work left over once the lock is released.
#[derive(Default)]
struct Followup {
    released: Option<Released>,
    republish: Option<Document>,
}

impl From<Option<Released>> for Followup {
    fn from(released: Option<Released>) -> Self {
        Self {
            released,
            republish: None,
        }
    }
}

impl CallSession {
    pub(super) async fn watch_document(
        session: Weak<CallSession>,
        mut changes: Subscription<DocumentChange>,
    ) {
        while let Some(change) = changes.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.on_document_change(change).await;
        }
        debug!("Call document watcher stopped");
    }

    async fn on_document_change(self: &Arc<Self>, change: DocumentChange) {
        let mut inner = self.inner.lock().await;
        let followup: Followup = match change.document {
            None => self.on_document_deleted(&mut inner).into(),
            Some(raw) => match SignalingDocument::from_document(&raw) {
                Ok(doc) => self.on_document_updated(&mut inner, doc).await,
                Err(e) => {
                    warn!(
                        "Ignoring malformed call document in {}: {e}",
                        self.conversation_id
                    );
                    Followup::default()
                }
            },
        };
        drop(inner);

        if let Some(released) = followup.released {
            self.release(released).await;
        }
        if let Some(offer) = followup.republish
            && let Err(e) = self.relay.put(&self.document_key, offer).await
        {
            warn!(
                "Failed to republish offer in {}: {e}",
                self.conversation_id
            );
        }
    }

    fn on_document_deleted(&self, inner: &mut SessionInner) -> Option<Released> {
        match inner.call.status {
            CallStatus::Idle => {
                debug!("Call document in {} removed while idle", self.conversation_id);
                None
            }
            // our own offer has not landed yet
            CallStatus::Calling if !inner.offer_seen => None,
            _ => {
                info!(
                    "Call in {} ended by the other participant",
                    self.conversation_id
                );
                self.end_locked(inner, EndCallReason::RemoteHangup)
            }
        }
    }

    async fn on_document_updated(
        self: &Arc<Self>,
        inner: &mut SessionInner,
        doc: SignalingDocument,
    ) -> Followup {
        let current = inner.call.is_current(&doc.session_id);
        let pending_offer = doc.is_pending_offer_for(&self.local_peer);

        if !current && doc.is_authored_by(&self.local_peer) {
            // a write of ours from an attempt that is already over
            debug!(
                "Ignoring our own call document {} in {}",
                doc.session_id, self.conversation_id
            );
            return Followup::default();
        }

        match inner.call.status {
            CallStatus::Idle if pending_offer => {
                self.enter_incoming(inner, doc).await;
                Followup::default()
            }
            CallStatus::Calling if current => {
                inner.offer_seen = true;
                if doc.is_answered() && !inner.remote_accepted() {
                    self.on_answer(inner, doc).await.into()
                } else {
                    Followup::default()
                }
            }
            CallStatus::Calling if pending_offer => self.on_glare(inner, doc).await,
            CallStatus::Incoming | CallStatus::Connected if !current && pending_offer => {
                // the other side started over without us seeing the old
                // attempt end
                let reason = if inner.call.status == CallStatus::Incoming {
                    EndCallReason::StaleOffer
                } else {
                    EndCallReason::RemoteHangup
                };
                info!(
                    "Offer {} replaced call {:?} in {}",
                    doc.session_id, inner.call.session_id, self.conversation_id
                );
                let released = self.end_locked(inner, reason);
                self.enter_incoming(inner, doc).await;
                released.into()
            }
            status => {
                // our own writes echoed back, duplicates, and leftovers
                debug!(
                    "No reaction to call document {} in {} while {status}",
                    doc.session_id, self.conversation_id
                );
                Followup::default()
            }
        }
    }

    async fn enter_incoming(self: &Arc<Self>, inner: &mut SessionInner, doc: SignalingDocument) {
        let transition = CallTransition::OfferObserved {
            session_id: doc.session_id.clone(),
            media_kind: doc.media_kind,
            caller: doc.initiator_id.clone(),
        };
        if let Err(e) = inner.call.apply_transition(transition) {
            warn!("Dropping offer in {}: {e}", self.conversation_id);
            return;
        }
        inner.epoch += 1;
        inner.reset_candidates();
        inner.offer = Some(doc.clone());

        // queue the caller's candidates while ringing
        match self.relay.subscribe_collection(&self.candidates_key).await {
            Ok(candidates) => {
                let task =
                    self.spawn_remote_candidates(inner.epoch, doc.session_id.clone(), candidates);
                inner.tasks.push(task);
            }
            Err(e) => warn!(
                "Could not watch candidates in {}: {e}",
                self.conversation_id
            ),
        }

        info!(
            "Incoming {} call {} from {} in {}",
            doc.media_kind, doc.session_id, doc.initiator_id, self.conversation_id
        );
        self.emit_status(inner);
        let _ = self.events.incoming_call.send(Arc::new(IncomingCall {
            conversation_id: self.conversation_id.clone(),
            caller: doc.initiator_id,
            media_kind: doc.media_kind,
            session_id: doc.session_id,
        }));
    }

    async fn on_answer(&self, inner: &mut SessionInner, doc: SignalingDocument) -> Option<Released> {
        let (Some(link), Some(answer)) = (inner.peer_link.clone(), doc.answer.clone()) else {
            debug!("Answer in {} arrived before the link exists", self.conversation_id);
            return None;
        };
        if let Err(e) = self.accept_remote(inner, link.as_ref(), answer).await {
            return self.fail_locked(inner, &CallError::NegotiationFailed(e));
        }
        match inner.call.apply_transition(CallTransition::AnswerObserved {
            callee: doc.answered_by,
        }) {
            Ok(_) => {
                info!("Connected in {} as caller", self.conversation_id);
                self.emit_status(inner);
            }
            Err(e) => warn!("Answer in {} not applied: {e}", self.conversation_id),
        }
        None
    }

    async fn on_glare(self: &Arc<Self>, inner: &mut SessionInner, doc: SignalingDocument) -> Followup {
        match resolve_glare(&self.local_peer, &doc.initiator_id) {
            GlareOutcome::KeepCalling => {
                info!(
                    "{} dialed too in {}; keeping the caller role",
                    doc.initiator_id, self.conversation_id
                );
                let republish = match (&inner.offer, inner.published) {
                    (Some(offer), true) => offer.to_document().ok(),
                    _ => None,
                };
                Followup {
                    released: None,
                    republish,
                }
            }
            GlareOutcome::YieldToRemote => {
                info!(
                    "{} dialed too in {}; answering their call instead",
                    doc.initiator_id, self.conversation_id
                );
                let released = self.end_locked(inner, EndCallReason::GlareLost);
                self.enter_incoming(inner, doc).await;
                released.into()
            }
        }
    }

    /// Install the remote description, then apply every queued candidate in
    /// arrival order.
    pub(super) async fn accept_remote(
        &self,
        inner: &mut SessionInner,
        link: &dyn PeerLink,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        link.set_remote_description(description).await?;
        let queued = inner.pending.drain();
        debug!(
            "Remote description set in {}, applying {} queued candidates",
            self.conversation_id,
            queued.len()
        );
        for candidate in queued {
            if let Err(e) = link.add_remote_candidate(candidate).await {
                warn!("Failed to apply queued candidate: {e}");
            }
        }
        Ok(())
    }

    pub(super) fn spawn_remote_candidates(
        self: &Arc<Self>,
        epoch: u64,
        session_id: SessionId,
        mut candidates: Subscription<CollectionItem>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(item) = candidates.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.on_remote_candidate(epoch, &session_id, item).await;
            }
        })
    }

    async fn on_remote_candidate(&self, epoch: u64, session_id: &SessionId, item: CollectionItem) {
        let candidate = match SignalingCandidate::from_document(&item.item) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("Ignoring malformed candidate {}: {e}", item.id);
                return;
            }
        };
        if !candidate.is_applicable(&self.local_peer, session_id) {
            return;
        }

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch {
            return;
        }
        if !inner.seen_candidates.insert(item.id.clone()) {
            debug!("Candidate {} delivered again, skipping", item.id);
            return;
        }
        match inner.pending.push(candidate.payload) {
            Ok(()) => debug!(
                "Queued candidate {} in {} ({} waiting)",
                item.id,
                self.conversation_id,
                inner.pending.len()
            ),
            Err(payload) => {
                let Some(link) = inner.peer_link.clone() else {
                    return;
                };
                if let Err(e) = link.add_remote_candidate(payload).await {
                    warn!("Failed to apply candidate {}: {e}", item.id);
                }
            }
        }
    }

    pub(super) fn spawn_link_events(
        self: &Arc<Self>,
        epoch: u64,
        session_id: SessionId,
        mut events: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match event {
                    LinkEvent::LocalCandidate(candidate) => {
                        session.publish_candidate(&session_id, candidate).await;
                    }
                    LinkEvent::StateChanged(state) => {
                        debug!("Link in {} is {state:?}", session.conversation_id);
                        let _ = session.events.link_state.send(Arc::new(LinkStateChanged {
                            conversation_id: session.conversation_id.clone(),
                            state,
                        }));
                        if state.is_failed() {
                            // the teardown aborts this task, so it runs apart
                            tokio::spawn(async move {
                                let error = CallError::NegotiationFailed(LinkError::Negotiation(
                                    "peer link reported a terminal failure".into(),
                                ));
                                session.fail(epoch, &error).await;
                            });
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn publish_candidate(&self, session_id: &SessionId, candidate: IceCandidateInit) {
        let item = SignalingCandidate::new(candidate, self.local_peer.clone(), session_id.clone());
        let doc = match item.to_document() {
            Ok(doc) => doc,
            Err(e) => {
                warn!("Could not encode local candidate: {e}");
                return;
            }
        };
        if let Err(e) = self.relay.append(&self.candidates_key, doc).await {
            warn!(
                "Failed to publish local candidate in {}: {e}",
                self.conversation_id
            );
        }
    }

    pub(super) fn spawn_ring_timeout(self: &Arc<Self>, epoch: u64, timeout: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                tokio::spawn(async move { session.expire(epoch).await });
            }
        })
    }

    async fn expire(&self, epoch: u64) {
        let released = {
            let mut inner = self.inner.lock().await;
            if inner.epoch != epoch || inner.call.status != CallStatus::Calling {
                return;
            }
            info!("No answer in {}, withdrawing the call", self.conversation_id);
            self.end_locked(&mut inner, EndCallReason::Timeout)
        };
        if let Some(released) = released {
            self.release(released).await;
        }
    }
}
