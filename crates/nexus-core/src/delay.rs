//! Injectable delay used by every bounded retry loop.
//!
//! Production code sleeps on the tokio timer; tests swap in a recorder so
//! backoff schedules can be asserted without waiting.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

/// Async delay function: `delay(duration).await`.
pub type DelayFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// The default delay: `tokio::time::sleep`.
pub fn tokio_delay() -> DelayFn {
    Arc::new(|duration| Box::pin(tokio::time::sleep(duration)))
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`.
///
/// `attempt` is 1-based; attempt 0 is treated as attempt 1.
pub fn exponential_backoff(base: Duration, attempt: u32, max: Option<Duration>) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = base.saturating_mul(1u32 << exponent);
    match max {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}
