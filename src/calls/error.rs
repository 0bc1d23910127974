//! Call-related error types.

use lumicore::signaling::ProtocolError;
use lumicore::state::InvalidTransition;
use lumicore::types::call::{CallStatus, EndCallReason};
use thiserror::Error;

use super::link::LinkError;
use crate::media::MediaError;
use crate::relay::RelayError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("media access denied: {0}")]
    MediaAccessDenied(#[from] MediaError),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(#[from] RelayError),

    #[error("the offer was withdrawn or replaced")]
    StaleOffer,

    #[error("negotiation failed: {0}")]
    NegotiationFailed(#[from] LinkError),

    #[error("malformed signaling data: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("another call is already in progress in this conversation")]
    CallInProgress,

    #[error("a call is already {0}")]
    Busy(CallStatus),

    #[error("calls are disabled")]
    CallsDisabled,

    #[error("no incoming call to answer (state {0})")]
    NotRinging(CallStatus),

    #[error("no local media")]
    NoLocalMedia,

    #[error("call was hung up before the operation completed")]
    Cancelled,

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("call session is missing its {0}")]
    MissingDependency(&'static str),
}

impl CallError {
    /// The end reason a failed operation records for its call.
    pub fn end_reason(&self) -> EndCallReason {
        match self {
            Self::MediaAccessDenied(_) => EndCallReason::MediaAccessDenied,
            Self::StaleOffer => EndCallReason::StaleOffer,
            Self::NegotiationFailed(_) => EndCallReason::NegotiationFailed,
            _ => EndCallReason::SignalingUnavailable,
        }
    }
}
