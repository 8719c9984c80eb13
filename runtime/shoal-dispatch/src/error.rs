use shoal_ipc::{CallError, ErrorCode};

pub use crate::launcher::LaunchError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Call(#[from] CallError),
    #[error("failed to decode worker reply: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to encode query options: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("dispatcher has stopped")]
    Stopped,
}

impl DispatchError {
    /// Code of the worker-side error, if the worker answered with one.
    pub fn remote_code(&self) -> Option<ErrorCode> {
        match self {
            DispatchError::Call(err) => err.remote_code(),
            _ => None,
        }
    }
}
