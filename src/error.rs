/// Error taxonomy for the context-optimization pipeline.
///
/// `InvalidInput` and `ExecutorFailure` are surfaced synchronously to the
/// caller. `StorageError` is swallowed by `ContextWindowManager` — the
/// offending stage is skipped and the pipeline continues.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("executor failed: {0}")]
    ExecutorFailure(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("deduplication error: {0}")]
    Dedup(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
