//! Object store error types.

use snafu::Snafu;

/// Errors from object store operations.
///
/// Variants mirror the terminal messages of the store protocol so the state
/// machines can tell retryable failures from collisions and redirects.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// Store unreachable or I/O failure on the socket.
    #[snafu(display("network error: {message}"))]
    Network { message: String },

    /// Protocol-level failure, including a dropped socket.
    #[snafu(display("protocol error: {message}"))]
    Protocol { message: String },

    /// The store could not find the data.
    #[snafu(display("data not found: {uri}"))]
    NotFound { uri: String },

    /// Insert collided with different data already at that key.
    #[snafu(display("insert collision at {uri}"))]
    Collision { uri: String },

    /// The request was redirected and redirects are exhausted.
    #[snafu(display("redirected to {uri}"))]
    Redirect { uri: String },

    /// The data is larger than the request allows.
    #[snafu(display("data size {size} exceeds maximum {max}"))]
    TooLarge { size: u64, max: u64 },

    /// Any other non-success terminal message.
    #[snafu(display("request failed with code {code}: {description}"))]
    Failed { code: u32, description: String },

    /// The request was cancelled by the scheduler.
    #[snafu(display("request {tag} cancelled"))]
    Cancelled { tag: String },

    /// A key returned by the store could not be parsed.
    #[snafu(display("invalid key from store: {source}"))]
    InvalidKey { source: infocalypse_keys::KeyError },
}

impl StoreError {
    /// True for failures worth retrying against the same or an alternate key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Network { .. }
                | StoreError::NotFound { .. }
                | StoreError::Failed { .. }
                | StoreError::Cancelled { .. }
        )
    }

    /// The protocol failure code, where one exists.
    pub fn code(&self) -> Option<u32> {
        use crate::constants::*;
        match self {
            StoreError::NotFound { .. } => Some(FCP_CODE_DATA_NOT_FOUND),
            StoreError::Collision { .. } => Some(FCP_CODE_COLLISION),
            StoreError::Redirect { .. } => Some(FCP_CODE_PERMANENT_REDIRECT),
            StoreError::TooLarge { .. } => Some(FCP_CODE_TOO_BIG),
            StoreError::Failed { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn socket_closed() -> Self {
        StoreError::Protocol {
            message: "Socket closed".to_string(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Network {
            message: err.to_string(),
        }
    }
}

impl From<infocalypse_keys::KeyError> for StoreError {
    fn from(source: infocalypse_keys::KeyError) -> Self {
        StoreError::InvalidKey { source }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
