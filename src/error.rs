use std::sync::Arc;

/// Error type returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// Non-success HTTP status code with raw response body.
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    /// Response body could not be decoded into the expected shape.
    #[error("decode error: {0}")]
    Decode(String),
    /// The configured transformer rejected the payload.
    #[error("transform error: {0}")]
    Transform(String),
    /// The attempt was superseded or explicitly cancelled.
    ///
    /// Never surfaced through [`FetchState::error`](crate::FetchState) or
    /// `on_error`.
    #[error("request cancelled")]
    Cancelled,
    /// Invalid controller or transport configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl FetchError {
    /// Builds a [`FetchError::Transform`] from any displayable reason.
    pub fn transform(reason: impl std::fmt::Display) -> Self {
        Self::Transform(reason.to_string())
    }

    /// Returns `true` for [`FetchError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// HTTP status code, when the failure carries one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Failure information published to consumers.
pub type ErrorInfo = Arc<FetchError>;
