use crate::types::call::PeerId;

/// What the local side does when it sees the other participant's offer while
/// its own is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlareOutcome {
    /// Keep the caller role and publish the local offer again.
    KeepCalling,
    /// Abandon the local attempt and take the remote offer as incoming.
    YieldToRemote,
}

/// The lexicographically lower peer id keeps the caller role.
pub fn resolve_glare(local: &PeerId, remote: &PeerId) -> GlareOutcome {
    if local < remote {
        GlareOutcome::KeepCalling
    } else {
        GlareOutcome::YieldToRemote
    }
}
