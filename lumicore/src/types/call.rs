use std::fmt;

use serde::{Deserialize, Serialize};

/// Media captured and negotiated for a call. Fixed when the offer is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone only.
    Audio,
    /// Microphone and camera.
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    pub fn has_video(&self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    Calling,
    Incoming,
    Connected,
}

impl CallStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Calling => "calling",
            Self::Incoming => "incoming",
            Self::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Which side published the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallRole {
    Caller,
    Callee,
}

/// Why a call returned to idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndCallReason {
    LocalHangup,
    /// The signaling document was deleted by the other participant.
    RemoteHangup,
    /// Nobody answered before the ring timeout.
    Timeout,
    MediaAccessDenied,
    SignalingUnavailable,
    StaleOffer,
    NegotiationFailed,
    /// Both sides dialed at once and the other side kept the caller role.
    GlareLost,
}

impl EndCallReason {
    /// Whether ending for this reason removes the shared signaling document.
    ///
    /// A remote hangup already removed it, a stale offer may have been replaced
    /// by a newer one, and a lost glare leaves the winner's offer in place.
    pub fn deletes_signal(&self) -> bool {
        !matches!(self, Self::RemoteHangup | Self::StaleOffer | Self::GlareLost)
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Identity of a chat participant.
    PeerId
);
string_id!(
    /// Shared key of the conversation both participants observe.
    ConversationId
);
string_id!(
    /// Identity of one offer. Minted fresh for every call attempt.
    SessionId
);

impl SessionId {
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode(bytes))
    }
}
