//! Core token-bucket limiter shared by the tokenbucket CLI.

pub mod error;
pub mod ratelimiter;
#[cfg(feature = "tokio")]
pub mod async_bucket;

pub use error::BucketError;
pub use ratelimiter::TokenBucket;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
