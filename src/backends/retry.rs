use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::canonical::CanonicalRequest;
use crate::error::{ApiError, ErrorKind};

use super::{EventStream, ModelDescriptor, Provider};

const BASE_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Wraps any `Provider` with the overload retry/backoff contract (spec.md
/// §4.2): up to `max_attempts` retries on an `overloaded` error, exponential
/// backoff starting at 500ms and doubling each attempt, capped at 5s. All
/// other error kinds propagate immediately. Streaming retry applies only to
/// the initial connection attempt; once `inner.stream` has returned a live
/// stream, in-stream errors are not retried here (spec.md §4.2).
///
/// Cancellation: this wrapper holds no explicit cancellation token. Dropping
/// the future returned by `complete`/`stream` (as axum does when a client
/// disconnects mid-wait) drops the in-progress `tokio::time::sleep` and
/// aborts the retry loop, which is the same "cancellation aborts the wait"
/// contract spec.md §4.2 describes, expressed through Rust's normal future
/// cancellation rather than an explicit context object.
pub struct RetryingProvider<P: ?Sized> {
    max_attempts: u32,
    inner: Arc<P>,
}

impl<P: ?Sized> RetryingProvider<P> {
    pub fn new(inner: Arc<P>, max_attempts: u32) -> Self {
        RetryingProvider {
            inner,
            max_attempts,
        }
    }

    fn backoff_for(attempt: u32) -> Duration {
        let millis = BASE_BACKOFF.as_millis().saturating_mul(1u128 << attempt);
        Duration::from_millis(millis.min(MAX_BACKOFF.as_millis()) as u64)
    }
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for RetryingProvider<P> {
    async fn complete(&self, request: CanonicalRequest) -> Result<crate::canonical::CanonicalResponse, ApiError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.kind == ErrorKind::Overloaded && attempt < self.max_attempts => {
                    tokio::time::sleep(Self::backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(err) if err.kind == ErrorKind::Overloaded => {
                    return Err(ApiError::new(
                        ErrorKind::Overloaded,
                        format!("upstream overloaded after {} attempts: {}", attempt + 1, err.message),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn stream(&self, request: CanonicalRequest) -> Result<EventStream, ApiError> {
        let mut attempt = 0;
        loop {
            match self.inner.stream(request.clone()).await {
                Ok(stream) => return Ok(stream),
                Err(err) if err.kind == ErrorKind::Overloaded && attempt < self.max_attempts => {
                    tokio::time::sleep(Self::backoff_for(attempt)).await;
                    attempt += 1;
                }
                Err(err) if err.kind == ErrorKind::Overloaded => {
                    return Err(ApiError::new(
                        ErrorKind::Overloaded,
                        format!("upstream overloaded after {} attempts: {}", attempt + 1, err.message),
                    ));
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, ApiError> {
        self.inner.list_models().await
    }
}

/// Drain a stream to completion without surfacing its items — used by the
/// streaming handler when a client disconnects mid-stream (spec.md §4.4,
/// §5): the producer must be allowed to reach a terminal state so the
/// upstream connection is closed, but nothing further needs to reach the
/// client.
pub async fn drain(mut stream: EventStream) {
    while stream.next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(RetryingProvider::<()>::backoff_for(0), Duration::from_millis(500));
        assert_eq!(RetryingProvider::<()>::backoff_for(1), Duration::from_millis(1000));
        assert_eq!(RetryingProvider::<()>::backoff_for(2), Duration::from_millis(2000));
        assert_eq!(RetryingProvider::<()>::backoff_for(4), Duration::from_millis(5000));
        assert_eq!(RetryingProvider::<()>::backoff_for(10), Duration::from_millis(5000));
    }
}
