//! Call state machine.
//!
//! Pure bookkeeping: which phase the local participant is in and what it knows
//! about the current attempt. Resource ownership lives with the session that
//! drives these transitions.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use crate::types::call::{CallRole, CallStatus, EndCallReason, MediaKind, PeerId, SessionId};

#[derive(Debug, Clone, Serialize, Default)]
pub struct CallState {
    pub status: CallStatus,
    pub role: Option<CallRole>,
    pub media_kind: Option<MediaKind>,
    pub session_id: Option<SessionId>,
    /// The caller when incoming, unknown for an outgoing call until answered.
    pub remote_peer: Option<PeerId>,
    pub since: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local `start_call`.
    Dial {
        session_id: SessionId,
        media_kind: MediaKind,
    },
    /// A remote offer was seen on the shared document.
    OfferObserved {
        session_id: SessionId,
        media_kind: MediaKind,
        caller: PeerId,
    },
    /// Local `answer_call` completed.
    Answer,
    /// The callee's answer was seen on the shared document.
    AnswerObserved { callee: Option<PeerId> },
    Ended { reason: EndCallReason },
}

/// Summary of a finished attempt.
#[derive(Debug, Clone, Serialize)]
pub struct EndedCall {
    pub reason: EndCallReason,
    pub role: Option<CallRole>,
    pub session_id: Option<SessionId>,
    pub duration_secs: Option<i64>,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        self.status.is_idle()
    }

    pub fn is_current(&self, session_id: &SessionId) -> bool {
        self.session_id.as_ref() == Some(session_id)
    }

    /// Apply a state transition. Returns error if transition is invalid.
    ///
    /// `Ended` yields the summary of the attempt it closed.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<Option<EndedCall>, InvalidTransition> {
        let now = Utc::now();
        match (self.status, transition) {
            (CallStatus::Idle, CallTransition::Dial { session_id, media_kind }) => {
                *self = Self {
                    status: CallStatus::Calling,
                    role: Some(CallRole::Caller),
                    media_kind: Some(media_kind),
                    session_id: Some(session_id),
                    remote_peer: None,
                    since: Some(now),
                    connected_at: None,
                };
            }
            (
                CallStatus::Idle | CallStatus::Incoming,
                CallTransition::OfferObserved {
                    session_id,
                    media_kind,
                    caller,
                },
            ) => {
                *self = Self {
                    status: CallStatus::Incoming,
                    role: Some(CallRole::Callee),
                    media_kind: Some(media_kind),
                    session_id: Some(session_id),
                    remote_peer: Some(caller),
                    since: Some(now),
                    connected_at: None,
                };
            }
            (CallStatus::Incoming, CallTransition::Answer) => {
                self.status = CallStatus::Connected;
                self.connected_at = Some(now);
            }
            (CallStatus::Calling, CallTransition::AnswerObserved { callee }) => {
                self.status = CallStatus::Connected;
                self.connected_at = Some(now);
                if callee.is_some() {
                    self.remote_peer = callee;
                }
            }
            (status, CallTransition::Ended { reason }) if !status.is_idle() => {
                let ended = EndedCall {
                    reason,
                    role: self.role,
                    session_id: self.session_id.take(),
                    duration_secs: self
                        .connected_at
                        .map(|at| now.signed_duration_since(at).num_seconds()),
                };
                *self = Self::default();
                return Ok(Some(ended));
            }
            (current, transition) => {
                debug!("Rejected {transition:?} while {current}");
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        }
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
