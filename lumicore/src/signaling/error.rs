use thiserror::Error;

use super::SdpKind;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("signaling payload is not a JSON object")]
    NotAnObject,

    #[error("answer document carries no answer description")]
    MissingAnswer,

    #[error("unexpected description kind: expected {expected:?}, got {actual:?}")]
    UnexpectedKind { expected: SdpKind, actual: SdpKind },
}
