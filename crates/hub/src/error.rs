//! Named errors returned by the command surface. A command that fails with
//! one of these has not mutated any state.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("room '{0}' already exists")]
    DuplicateRoom(String),

    #[error("preset '{0}' already exists")]
    DuplicatePreset(String),

    #[error("unknown room '{0}'")]
    UnknownRoom(String),

    #[error("unknown preset '{0}'")]
    UnknownPreset(String),

    #[error("preset name '{0}' is reserved")]
    ReservedPresetName(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid override mode '{0}' (use auto, on or off)")]
    InvalidMode(String),
}

impl CommandError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
