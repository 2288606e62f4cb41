//! Retry, timeout and rate-limit middleware for HTTP clients.
//!
//! Every request made by the transport goes through [`PolicyClient`]. It
//! waits for a rate-limit token, bounds the call with the request timeout,
//! maps the status to an error and retries transient failures with
//! exponential backoff. A `Retry-After` hint replaces the computed backoff.

use crate::config::{Configuration, RetryConfig};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::limiter::RateLimiter;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Decides whether an error is worth another attempt.
pub type Classifier = fn(&SyncError) -> bool;

/// [`HttpClient`] wrapper applying the session's request policy.
///
/// Unlike plain clients, `send` returns `Err` for every non-2xx status.
pub struct PolicyClient<C: HttpClient> {
    inner: C,
    retry: RetryConfig,
    timeout: Duration,
    limiter: Option<Arc<RateLimiter>>,
    classifier: Classifier,
}

impl<C: HttpClient> PolicyClient<C> {
    /// Wraps `inner` with the given retry policy and request timeout.
    pub fn new(inner: C, retry: RetryConfig, timeout: Duration) -> Self {
        Self {
            inner,
            retry,
            timeout,
            limiter: None,
            classifier: SyncError::is_retryable,
        }
    }

    /// Wraps `inner` with the policy from `config`.
    pub fn from_config(inner: C, config: &Configuration) -> Self {
        let client = Self::new(inner, config.retry.clone(), config.timeout);
        match &config.rate_limit {
            Some(limit) => client.with_limiter(Arc::new(RateLimiter::new(limit))),
            None => client,
        }
    }

    /// Shares `limiter` with this client.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Replaces the retry classifier.
    pub fn with_classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// The wrapped client.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn attempt(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        if let Some(limiter) = &self.limiter {
            tokio::time::timeout(self.timeout, limiter.acquire())
                .await
                .map_err(|_| SyncError::Timeout)?;
        }
        tokio::time::timeout(self.timeout, self.inner.send(request))
            .await
            .map_err(|_| SyncError::Timeout)??
            .error_for_status()
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for PolicyClient<C> {
    async fn send(&self, request: HttpRequest) -> SyncResult<HttpResponse> {
        let mut attempt = 0;
        loop {
            let error = match self.attempt(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            attempt += 1;

            if !self.retry.allows_another(attempt) || !(self.classifier)(&error) {
                if attempt > 1 {
                    warn!(
                        method = %request.method,
                        url = %request.url,
                        attempts = attempt,
                        error = %error,
                        "request failed"
                    );
                }
                return Err(error);
            }

            let delay = self.retry.wait_after(attempt, error.retry_after());
            debug!(
                method = %request.method,
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
