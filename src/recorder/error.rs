use thiserror::Error;

/// Stack recorder errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    /// Neither slot could be locked after retrying
    #[error("Failed to grab either mutex in sampler_lock_active_profile")]
    BothSlotsLocked,

    /// Serializer bookkeeping holds an impossible slot index
    #[error("Unexpected active_slot state {0} in serializer_flip_active_and_inactive_slots")]
    UnexpectedActiveSlot(u8),

    /// Sample rejected by the profile
    #[error("Failed to record sample: {0}")]
    InvalidSample(String),

    /// Profile could not be encoded
    #[error("Failed to serialize profile: {0}")]
    Serialization(String),
}

impl RecorderError {
    /// Whether this error means the slot protocol itself is broken
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            RecorderError::BothSlotsLocked | RecorderError::UnexpectedActiveSlot(_)
        )
    }
}
