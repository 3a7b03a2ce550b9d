#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{operation} failed{}: {detail}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Provider {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    /// An outbound call exceeded its time bound.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Identity assertion rejected: {0}")]
    Assertion(String),
    #[error("Authorization state rejected: {0}")]
    State(String),
    #[error("Key error: {0}")]
    Key(String),
}

impl Error {
    /// Timeout, failed connect or provider 5xx: the request itself may be fine.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Provider {
                status: Some(status),
                ..
            } => *status >= 500,
            _ => false,
        }
    }
}
