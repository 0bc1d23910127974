//! Wire contract for carrying a call over a generic document relay.
//!
//! One document per conversation holds the offer and, once answered, the
//! answer. Connectivity candidates trickle through an append-only child
//! collection of that document. Deleting the document ends the call.

mod candidate;
mod document;
mod error;
mod glare;
mod queue;

pub use candidate::{IceCandidateInit, SignalingCandidate};
pub use document::{SdpKind, SessionDescription, SignalingDocument};
pub use error::ProtocolError;
pub use glare::{GlareOutcome, resolve_glare};
pub use queue::CandidateQueue;

use crate::types::call::ConversationId;

/// A relay document: a JSON object with top-level fields.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Top-level collection holding one signaling document per conversation.
pub const CALLS_COLLECTION: &str = "calls";

/// Child collection of a signaling document holding its candidates.
pub const CANDIDATES_COLLECTION: &str = "candidates";

pub fn call_document_key(conversation: &ConversationId) -> String {
    format!("{CALLS_COLLECTION}/{conversation}")
}

pub fn candidate_collection_key(conversation: &ConversationId) -> String {
    format!(
        "{}/{CANDIDATES_COLLECTION}",
        call_document_key(conversation)
    )
}

fn into_document(value: serde_json::Value) -> Result<Document, ProtocolError> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::NotAnObject),
    }
}
