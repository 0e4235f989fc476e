/// Sentinel cause used by the probe handler when a Run is paused (§4.4
/// step 2, §7): not a real failure, it just instructs the queue to
/// redeliver the job later.
pub const RUN_PAUSED: &str = "RUN_PAUSED";

/// Error taxonomy (§7), kept as kinds rather than a type per external
/// collaborator so handler code can match on it without caring which
/// producer or store raised it.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("illegal run state transition: {0}")]
    RunState(String),

    #[error("retryable: {0}")]
    Retryable(String),

    #[error("non-retryable: {0}")]
    NonRetryable { code: Option<String>, message: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EvalError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EvalError::Retryable(_))
    }
}
