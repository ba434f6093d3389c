//! Client-side error types.

use bidroom_shared::BackendError;

/// A host capability (sound, native notifications, focus) that could not be used.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    #[error("capability not supported by this host")]
    Unsupported,
    #[error("permission denied")]
    PermissionDenied,
    #[error("host failure: {0}")]
    Failed(String),
}

/// Why a send did not produce a persisted message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    #[error("message has neither text nor attachment")]
    Empty,
    #[error("no failed message `{0}` to retry")]
    NotRetryable(String),
    /// The write failed; the optimistic record `temp_id` is now FAILED.
    #[error("send failed for `{temp_id}`: {source}")]
    Backend {
        temp_id: String,
        #[source]
        source: BackendError,
    },
}
