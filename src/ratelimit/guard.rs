//! Gate arbitrary async operations behind a limiter.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

use super::limiter::Limiter;
use super::request::RateLimitRequest;
use crate::error::{Result, TurnstileError};

/// Wrap `op` so every call first acquires budget from `limiter`.
///
/// `request_fn` builds the admission request from the call's argument. When the
/// budget is exhausted the wrapped call resolves to
/// [`crate::error::TurnstileError::RateLimitExceeded`] and `op` is not run. A
/// queued request counts as not admitted, so its queue entry is withdrawn
/// before the error is returned.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use turnstile::ratelimit::{with_rate_limit, Limiter, RateLimitRequest};
/// # async fn demo(limiter: Arc<Limiter>) -> turnstile::error::Result<()> {
/// let fetch = with_rate_limit(
///     limiter,
///     |user: &String| RateLimitRequest::new(user.clone()),
///     |user: String| async move { format!("profile of {}", user) },
/// );
/// let profile = fetch("alice".to_string()).await?;
/// # Ok(())
/// # }
/// ```
pub fn with_rate_limit<A, T, K, F, Fut>(
    limiter: Arc<Limiter>,
    request_fn: K,
    op: F,
) -> impl Fn(A) -> BoxFuture<'static, Result<T>>
where
    A: Send + 'static,
    T: Send + 'static,
    K: Fn(&A) -> RateLimitRequest,
    F: Fn(A) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    move |arg: A| {
        let request = request_fn(&arg);
        let limiter = limiter.clone();
        let op = op.clone();
        Box::pin(async move {
            let result = limiter.acquire(&request).await?;
            if !result.allowed {
                limiter.withdraw(&request.key, &result);
                return Err(TurnstileError::RateLimitExceeded {
                    key: request.key,
                    result: Box::new(result),
                });
            }
            Ok(op(arg).await)
        })
    }
}
