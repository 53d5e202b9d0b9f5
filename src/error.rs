use thiserror::Error;

/// Failures specific to a rotation run.
///
/// Anything that is not a sequencing decision (I/O, HTTP, SDK errors) travels
/// as `anyhow::Error` with context attached at the call site.
#[derive(Debug, Error)]
pub enum RotateError {
    #[error("Incorrect number of access keys for user '{user}': expected 1, found {count}")]
    UnexpectedKeyCount { user: String, count: usize },

    #[error("Please update your configuration before running again ({0})")]
    PlaceholderConfig(String),

    #[error("Invalid ISO-8601 duration '{0}'")]
    InvalidDuration(String),

    #[error("Failed to persist new access key {access_key_id}: {reason}")]
    PersistFailed {
        access_key_id: String,
        reason: String,
    },

    #[error("Failed to update {} destination(s): {}", failed.len(), failed.join(", "))]
    PropagationFailed { failed: Vec<String> },

    #[error("Failed to delete old access key {access_key_id}: {reason}")]
    DeleteFailed {
        access_key_id: String,
        reason: String,
    },
}
