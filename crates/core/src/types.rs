/// Executions are addressed by the server-assigned string identifier.
pub type ExecutionId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
