//! External results source used when local events are insufficient.

pub mod client;
pub mod rate_limiter;
pub mod reconstructor;

pub use client::{ExternalResult, HttpResultsSource, ResultsPage, ResultsSource};
pub use rate_limiter::RateLimiter;
pub use reconstructor::ExternalReconstructor;
