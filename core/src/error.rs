use thiserror::Error;

/// Reasons a bucket cannot be constructed.
#[derive(Debug, Error)]
pub enum BucketError {
    #[error("bucket capacity must be greater than zero")]
    ZeroCapacity,
    #[error("refill period must be greater than zero")]
    ZeroRefillPeriod,
    #[error("no tokio runtime is running")]
    NoRuntime,
    #[error("failed to start refill thread: {0}")]
    Spawn(#[source] std::io::Error),
}
