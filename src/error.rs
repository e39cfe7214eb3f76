//! Error taxonomy shared by the loader, the capture sources and the session.

use std::io;

use crate::lifecycle::InvalidTransition;

/// An error that ends a session in the terminal [`LoadState::Error`] state.
///
/// The `Display` output of each variant is the user-facing message published in the session's
/// [`Status`].
///
/// [`LoadState::Error`]: crate::lifecycle::LoadState::Error
/// [`Status`]: crate::lifecycle::Status
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The inference runtime could not be resolved. There is no fallback for this.
    #[error("failed to load the vision runtime: {0}")]
    RuntimeLoad(String),

    /// The model asset could not be turned into an inference engine.
    #[error("failed to load the hand landmark model: {0}")]
    ModelLoad(String),

    /// The environment has no usable camera support at all.
    #[error("camera capture is not supported here: {0}")]
    UnsupportedEnvironment(String),

    /// Camera access was refused.
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    /// The camera was opened but failed before delivering a decodable frame.
    #[error("camera failed: {0}")]
    Capture(String),

    /// The session was driven out of order, e.g. started twice.
    #[error(transparent)]
    Lifecycle(#[from] InvalidTransition),
}

impl Error {
    pub(crate) fn runtime_load(err: anyhow::Error) -> Self {
        Self::RuntimeLoad(format!("{err:#}"))
    }

    pub(crate) fn model_load(err: anyhow::Error) -> Self {
        Self::ModelLoad(format!("{err:#}"))
    }
}

/// Returns whether any error in `err`'s chain is an [`io::Error`] of kind `PermissionDenied`.
pub(crate) fn is_permission_denied(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<io::Error>()
            .map_or(false, |e| e.kind() == io::ErrorKind::PermissionDenied)
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn permission_denied_is_found_in_chain() {
        let err = Err::<(), _>(io::Error::from(io::ErrorKind::PermissionDenied))
            .context("opening /dev/video0")
            .unwrap_err();
        assert!(is_permission_denied(&err));

        let err = anyhow::Error::from(io::Error::from(io::ErrorKind::NotFound));
        assert!(!is_permission_denied(&err));
        assert!(!is_permission_denied(&anyhow::anyhow!("no devices")));
    }

    #[test]
    fn messages_keep_context() {
        let err = Err::<(), _>(anyhow::anyhow!("connection reset"))
            .context("fetching model")
            .unwrap_err();
        let err = Error::model_load(err);
        assert_eq!(
            err.to_string(),
            "failed to load the hand landmark model: fetching model: connection reset"
        );
    }
}
