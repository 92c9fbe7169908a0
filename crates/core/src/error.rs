#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unknown execution status: {0}")]
    UnknownStatus(String),

    #[error("Invalid execution id: {0:?}")]
    InvalidExecutionId(String),

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
}
