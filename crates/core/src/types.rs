/// Queue-assigned job identifier, monotonically increasing per process.
pub type JobId = u64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
