use std::sync::Arc;

use lumicore::types::call::{
    CallRole, CallStatus, ConversationId, EndCallReason, MediaKind, PeerId, SessionId,
};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::calls::link::LinkState;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct CallStatusChanged {
    pub conversation_id: ConversationId,
    pub status: CallStatus,
    pub role: Option<CallRole>,
    pub media_kind: Option<MediaKind>,
}

/// A remote offer is ringing locally.
#[derive(Debug, Clone, Serialize)]
pub struct IncomingCall {
    pub conversation_id: ConversationId,
    pub caller: PeerId,
    pub media_kind: MediaKind,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub conversation_id: ConversationId,
    pub reason: EndCallReason,
    pub role: Option<CallRole>,
    /// Seconds spent connected, if the call ever connected.
    pub duration_secs: Option<i64>,
}

/// A call attempt failed; worth a transient notice in the UI.
#[derive(Debug, Clone, Serialize)]
pub struct CallFailed {
    pub conversation_id: ConversationId,
    pub reason: EndCallReason,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct LinkStateChanged {
    pub conversation_id: ConversationId,
    pub state: LinkState,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed call event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct CallEventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl CallEventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (status_changed, Arc<CallStatusChanged>),
    (incoming_call, Arc<IncomingCall>),
    (call_ended, Arc<CallEnded>),
    (call_failed, Arc<CallFailed>),
    (link_state, Arc<LinkStateChanged>),
}

impl Default for CallEventBus {
    fn default() -> Self {
        Self::new()
    }
}
