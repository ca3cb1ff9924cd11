//! Error types for control-plane calls.

/// Errors returned by [`ControlPlane`](crate::ControlPlane) calls.
///
/// None of these are fatal once the node is running: a failed ping is
/// retried on the next cycle and a failed shutdown is ignored.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// The control plane could not be reached, or the call timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// The control plane answered with a non-success status.
    #[error("control plane rejected request: {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },

    /// The control plane does not want this node to serve right now.
    #[error("control plane did not hand out an assignment")]
    NotWanted,

    /// The response could not be decoded.
    #[error("invalid control plane response: {0}")]
    Decode(String),

    /// The configured control plane URL is unusable.
    #[error("invalid control plane url: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for ControlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}
