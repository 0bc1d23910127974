use serde::{Deserialize, Serialize};

use super::{Document, ProtocolError, into_document};
use crate::types::call::{MediaKind, PeerId, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A session description as produced by the negotiation layer. The `sdp`
/// text is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// The per-conversation call document.
///
/// `kind` flips from `offer` to `answer` when the callee publishes its answer
/// into the same document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingDocument {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// The offer description.
    #[serde(rename = "sdp")]
    pub description: String,
    #[serde(rename = "callType")]
    pub media_kind: MediaKind,
    #[serde(rename = "callerId")]
    pub initiator_id: PeerId,
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_by: Option<PeerId>,
}

impl SignalingDocument {
    pub fn offer(
        session_id: SessionId,
        offer: SessionDescription,
        media_kind: MediaKind,
        initiator_id: PeerId,
    ) -> Self {
        Self {
            kind: SdpKind::Offer,
            description: offer.sdp,
            media_kind,
            initiator_id,
            session_id,
            answer: None,
            answered_by: None,
        }
    }

    pub fn offer_description(&self) -> SessionDescription {
        SessionDescription::offer(self.description.clone())
    }

    pub fn is_answered(&self) -> bool {
        self.kind == SdpKind::Answer
    }

    /// Whether `peer` wrote this document's current content.
    pub fn is_authored_by(&self, peer: &PeerId) -> bool {
        match &self.answered_by {
            Some(answerer) if self.is_answered() => answerer == peer,
            _ => &self.initiator_id == peer,
        }
    }

    /// Whether this is an offer from someone else that nobody answered yet.
    pub fn is_pending_offer_for(&self, peer: &PeerId) -> bool {
        !self.is_answered() && &self.initiator_id != peer
    }

    pub fn to_document(&self) -> Result<Document, ProtocolError> {
        into_document(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: &Document) -> Result<Self, ProtocolError> {
        let parsed: Self = serde_json::from_value(serde_json::Value::Object(doc.clone()))?;
        if let Some(answer) = &parsed.answer
            && answer.kind != SdpKind::Answer
        {
            return Err(ProtocolError::UnexpectedKind {
                expected: SdpKind::Answer,
                actual: answer.kind,
            });
        }
        if parsed.is_answered() && parsed.answer.is_none() {
            return Err(ProtocolError::MissingAnswer);
        }
        Ok(parsed)
    }

    /// Fields the callee merges into the document to publish its answer.
    pub fn answer_patch(
        answer: &SessionDescription,
        answerer: &PeerId,
    ) -> Result<Document, ProtocolError> {
        if answer.kind != SdpKind::Answer {
            return Err(ProtocolError::UnexpectedKind {
                expected: SdpKind::Answer,
                actual: answer.kind,
            });
        }
        let mut patch = Document::new();
        patch.insert("type".into(), serde_json::to_value(SdpKind::Answer)?);
        patch.insert("answer".into(), serde_json::to_value(answer)?);
        patch.insert("answeredBy".into(), serde_json::to_value(answerer)?);
        Ok(patch)
    }
}
