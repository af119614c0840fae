use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarborError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("deadline exceeded after {elapsed_ms}ms: {call}")]
    DeadlineExceeded { call: String, elapsed_ms: u64 },

    #[error("{operation} partially failed: {}", format_failures(.failures))]
    PartialFailure {
        operation: String,
        failures: Vec<StepFailure>,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("application error {code}: {detail}")]
    Application { code: i32, detail: String },

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One failed sub-step of a best-effort operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// What the step acted on, e.g. `"worker#2"` for instance 2 of backend `worker`.
    pub target: String,
    pub reason: String,
}

fn format_failures(failures: &[StepFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.target, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

impl HarborError {
    /// HTTP status the original caller sees when this error ends a request.
    pub fn status_code(&self) -> u16 {
        match self {
            HarborError::NotFound(_) => 404,
            HarborError::AlreadyExists(_) => 409,
            HarborError::PreconditionFailed(_) => 412,
            HarborError::ServiceUnavailable(_) => 503,
            HarborError::DeadlineExceeded { .. } => 504,
            HarborError::Transport(_) => 502,
            _ => 500,
        }
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, HarborError::DeadlineExceeded { .. })
    }
}
