use thiserror::Error;

/// Failures reported by the page host (webview/tab).
#[derive(Debug, Error)]
pub enum HostError {
    /// The page has not fired its first readiness event, or is mid-navigation.
    #[error("page not ready: {0}")]
    NotReady(String),

    #[error("page surface detached")]
    Detached,

    /// The injected script threw or the host could not evaluate it.
    #[error("script failed: {0}")]
    Script(String),

    #[error("navigation failed: {0}")]
    Navigation(String),
}

impl HostError {
    /// True for the class of errors that a fresh readiness wait can fix.
    pub fn is_not_ready(&self) -> bool {
        match self {
            HostError::NotReady(_) => true,
            HostError::Script(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("not ready")
                    || message.contains("dom-ready")
                    || message.contains("not attached")
                    || message.contains("execution context was destroyed")
            }
            HostError::Detached | HostError::Navigation(_) => false,
        }
    }
}

/// Failures reported by the LLM text service.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    #[error("oracle returned an error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("oracle reply had no content")]
    Empty,
}

/// Failures reading or writing a persistent record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed store document {path}: missing `{key}` array")]
    Malformed { path: String, key: String },
}

/// Errors that can escape a goal-loop turn.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The turn was stopped by the user or superseded by a new message.
    #[error("turn cancelled")]
    Cancelled,

    #[error(transparent)]
    Surface(#[from] HostError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
