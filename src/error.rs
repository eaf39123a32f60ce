use thiserror::Error;

/// Failure reported by a remote collaborator (data API, auth, change feed).
///
/// `code` carries the provider's machine-readable code verbatim (for
/// example `email_not_confirmed`) so callers can branch on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    pub code: Option<String>,
    pub status: Option<u16>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        let mut err = RemoteError::new(format!("Request failed: {}", e));
        if let Some(status) = e.status() {
            err.status = Some(status.as_u16());
        }
        err
    }
}

/// Why a gateway operation did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("{kind} {id} not found in cache")]
    NotFound { kind: &'static str, id: String },
    #[error("Not signed in")]
    NotAuthenticated,
    #[error("Realtime updates are not available")]
    RealtimeUnavailable,
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl GatewayError {
    /// Machine-readable code surfaced next to the message.
    pub fn code(&self) -> Option<String> {
        match self {
            Self::NotFound { .. } => Some("not_found".to_string()),
            Self::NotAuthenticated => Some("not_authenticated".to_string()),
            Self::RealtimeUnavailable => Some("realtime_unavailable".to_string()),
            Self::Remote(e) => e.code.clone(),
        }
    }
}
