use crate::error::ReconcilerError;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Process-wide token bucket in front of the operator API.
#[derive(Clone)]
pub struct OperatorRateLimit {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl OperatorRateLimit {
    /// Zero is treated as one request per second.
    pub fn per_second(requests: u32) -> Self {
        let requests = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(requests))),
        }
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

pub async fn rate_limit(
    State(limit): State<OperatorRateLimit>,
    req: Request,
    next: Next,
) -> Result<Response, ReconcilerError> {
    if !limit.check() {
        return Err(ReconcilerError::RateLimitExceeded);
    }
    Ok(next.run(req).await)
}
