use serde::{Deserialize, Serialize};

use super::{Document, ProtocolError, into_document};
use crate::types::call::{PeerId, SessionId};

/// A trickled connectivity candidate in the shape the negotiation layer
/// exports it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// One item of a call document's candidate collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingCandidate {
    #[serde(flatten)]
    pub payload: IceCandidateInit,
    pub originator_id: PeerId,
    pub session_id: SessionId,
}

impl SignalingCandidate {
    pub fn new(payload: IceCandidateInit, originator_id: PeerId, session_id: SessionId) -> Self {
        Self {
            payload,
            originator_id,
            session_id,
        }
    }

    pub fn to_document(&self) -> Result<Document, ProtocolError> {
        into_document(serde_json::to_value(self)?)
    }

    pub fn from_document(doc: &Document) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_value(serde_json::Value::Object(
            doc.clone(),
        ))?)
    }

    /// Whether the local peer should feed this candidate to its link for
    /// the given session.
    pub fn is_applicable(&self, local: &PeerId, session: &SessionId) -> bool {
        &self.originator_id != local && &self.session_id == session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_candidate_wire_shape() {
        let cand = SignalingCandidate::new(
            IceCandidateInit {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: Some("u1".into()),
            },
            "A".into(),
            "s1".into(),
        );
        let doc = cand.to_document().unwrap();
        assert_eq!(
            serde_json::Value::Object(doc.clone()),
            json!({
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": "u1",
                "originatorId": "A",
                "sessionId": "s1",
            })
        );
        assert_eq!(SignalingCandidate::from_document(&doc).unwrap(), cand);
    }

    #[test]
    fn test_null_fields_accepted() {
        let raw = json!({
            "candidate": "candidate:2",
            "sdpMid": null,
            "sdpMLineIndex": null,
            "usernameFragment": null,
            "originatorId": "B",
            "sessionId": "s1",
        });
        let parsed = SignalingCandidate::from_document(raw.as_object().unwrap()).unwrap();
        assert_eq!(parsed.payload.sdp_mid, None);
        assert_eq!(parsed.payload.username_fragment, None);
    }

    #[test]
    fn test_applicability() {
        let cand = SignalingCandidate::new(IceCandidateInit::new("c"), "B".into(), "s1".into());
        assert!(cand.is_applicable(&"A".into(), &"s1".into()));
        assert!(!cand.is_applicable(&"B".into(), &"s1".into()));
        assert!(!cand.is_applicable(&"A".into(), &"s0".into()));
    }
}
