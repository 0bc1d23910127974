//! In-process peer link that negotiates nothing but follows the rules a real
//! one enforces, and records what it was asked to do.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use lumicore::signaling::{IceCandidateInit, SdpKind, SessionDescription};
use tokio::sync::mpsc;

use super::link::{LinkError, LinkEvent, LinkState, PeerLink, PeerLinkFactory};
use crate::config::IceServer;
use crate::media::LocalMedia;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// One recorded call into a [`SimulatedPeerLink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    AttachMedia { tracks: usize },
    LocalDescription(SdpKind),
    RemoteDescription(SdpKind),
    Candidate(String),
    Close,
}

pub struct SimulatedPeerLink {
    id: u64,
    label: String,
    local_candidates: usize,
    ops: Mutex<Vec<LinkOp>>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkEvent>>>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    closed: AtomicBool,
}

impl SimulatedPeerLink {
    fn new(label: &str, local_candidates: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::SeqCst),
            label: label.to_string(),
            local_candidates,
            ops: Mutex::new(Vec::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ops(&self) -> Vec<LinkOp> {
        self.ops.lock().map(|ops| ops.clone()).unwrap_or_default()
    }

    /// Remote candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                LinkOp::Candidate(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report a terminal connectivity failure.
    pub fn fail(&self) {
        self.emit(LinkEvent::StateChanged(LinkState::Failed));
    }

    fn record(&self, op: LinkOp) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(op);
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events_tx.send(event);
    }

    fn check_open(&self) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        Ok(())
    }

    fn sdp(&self, kind: SdpKind) -> String {
        format!(
            "v=0\r\no={} {} 2 IN IP4 127.0.0.1\r\ns=-\r\na=type:{:?}\r\n",
            self.label, self.id, kind
        )
    }

    fn gather(&self) {
        for n in 0..self.local_candidates {
            let candidate = format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
                n,
                50000 + n,
                self.label
            );
            self.emit(LinkEvent::LocalCandidate(IceCandidateInit::new(candidate)));
        }
    }

    fn maybe_connected(&self) {
        if self.local_set.load(Ordering::SeqCst) && self.remote_set.load(Ordering::SeqCst) {
            self.emit(LinkEvent::StateChanged(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerLink for SimulatedPeerLink {
    async fn attach_media(&self, media: &LocalMedia) -> Result<(), LinkError> {
        self.check_open()?;
        self.record(LinkOp::AttachMedia {
            tracks: media.tracks().len(),
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, LinkError> {
        self.check_open()?;
        self.record(LinkOp::LocalDescription(SdpKind::Offer));
        self.local_set.store(true, Ordering::SeqCst);
        self.emit(LinkEvent::StateChanged(LinkState::Connecting));
        self.gather();
        Ok(SessionDescription::offer(self.sdp(SdpKind::Offer)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, LinkError> {
        self.check_open()?;
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(LinkError::Negotiation(
                "answer requested without a remote offer".into(),
            ));
        }
        self.record(LinkOp::LocalDescription(SdpKind::Answer));
        self.local_set.store(true, Ordering::SeqCst);
        self.gather();
        self.maybe_connected();
        Ok(SessionDescription::answer(self.sdp(SdpKind::Answer)))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), LinkError> {
        self.check_open()?;
        if self.remote_set.swap(true, Ordering::SeqCst) {
            return Err(LinkError::InvalidDescription(
                "remote description already set".into(),
            ));
        }
        self.record(LinkOp::RemoteDescription(description.kind));
        self.maybe_connected();
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateInit) -> Result<(), LinkError> {
        self.check_open()?;
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(LinkError::InvalidCandidate(
                "candidate applied before remote description".into(),
            ));
        }
        self.record(LinkOp::Candidate(candidate.candidate));
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        self.events_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing simulated link {}", self.id);
            self.record(LinkOp::Close);
            self.emit(LinkEvent::StateChanged(LinkState::Closed));
        }
    }
}

/// Builds [`SimulatedPeerLink`]s and keeps them for inspection.
#[derive(Clone)]
pub struct SimulatedPeerLinkFactory {
    label: String,
    local_candidates: usize,
    links: Arc<Mutex<Vec<Arc<SimulatedPeerLink>>>>,
    fail_create: Arc<AtomicBool>,
}

impl SimulatedPeerLinkFactory {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            local_candidates: 2,
            links: Arc::new(Mutex::new(Vec::new())),
            fail_create: Arc::new(AtomicBool::new(false)),
        }
    }

    /// How many local candidates each link trickles after producing a description.
    pub fn with_local_candidates(mut self, count: usize) -> Self {
        self.local_candidates = count;
        self
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn links(&self) -> Vec<Arc<SimulatedPeerLink>> {
        self.links
            .lock()
            .map(|links| links.clone())
            .unwrap_or_default()
    }

    pub fn last_link(&self) -> Option<Arc<SimulatedPeerLink>> {
        self.links().pop()
    }
}

#[async_trait]
impl PeerLinkFactory for SimulatedPeerLinkFactory {
    async fn create(&self, ice_servers: &[IceServer]) -> Result<Arc<dyn PeerLink>, LinkError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(LinkError::Negotiation("link construction refused".into()));
        }
        let link = Arc::new(SimulatedPeerLink::new(&self.label, self.local_candidates));
        debug!(
            "Created simulated link {} for {} ({} ice servers)",
            link.id,
            self.label,
            ice_servers.len()
        );
        if let Ok(mut links) = self.links.lock() {
            links.push(link.clone());
        }
        Ok(link)
    }
}
