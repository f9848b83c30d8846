//! Tower middleware applying one limiter to every request of a router.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::http::Request;
use axum::response::{IntoResponse, Response};
use tower::{Layer, Service};
use tracing::debug;

use super::client_ip::{extract_ip, peer_addr};
use super::response::{apply_rate_limit_headers, RateLimited, TooManyRequests};
use crate::ratelimit::{check_with_config, Limiter};

/// Retry hint for requests that could not be keyed.
const UNKEYED_RETRY_AFTER_SECS: u64 = 60;

/// Derives the limiter key for a request.
pub trait KeyExtractor: Clone + Send + Sync + 'static {
    /// `None` when the request carries nothing to key on.
    fn extract<B>(&self, request: &Request<B>) -> Option<String>;
}

/// Keys requests by the connection's peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpKey;

impl KeyExtractor for ClientIpKey {
    fn extract<B>(&self, request: &Request<B>) -> Option<String> {
        peer_addr(request.extensions()).map(|addr| extract_ip(&addr))
    }
}

/// Layer that rate limits requests before they reach the wrapped service.
#[derive(Clone)]
pub struct RateLimitLayer<K = ClientIpKey> {
    limiter: Arc<dyn Limiter>,
    extractor: K,
    message: Arc<str>,
}

impl RateLimitLayer<ClientIpKey> {
    /// Limit by client address.
    pub fn new(limiter: Arc<dyn Limiter>) -> Self {
        Self::with_extractor(limiter, ClientIpKey)
    }
}

impl<K: KeyExtractor> RateLimitLayer<K> {
    /// Limit by whatever `extractor` derives from the request.
    pub fn with_extractor(limiter: Arc<dyn Limiter>, extractor: K) -> Self {
        Self {
            limiter,
            extractor,
            message: Arc::from("Rate limit exceeded. Please try again later."),
        }
    }

    /// Error message used in the 429 body.
    pub fn message(mut self, message: impl AsRef<str>) -> Self {
        self.message = Arc::from(message.as_ref());
        self
    }
}

impl<S, K: Clone> Layer<S> for RateLimitLayer<K> {
    type Service = RateLimitService<S, K>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            extractor: self.extractor.clone(),
            message: self.message.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
#[derive(Clone)]
pub struct RateLimitService<S, K> {
    inner: S,
    limiter: Arc<dyn Limiter>,
    extractor: K,
    message: Arc<str>,
}

impl<S, K, ReqBody> Service<Request<ReqBody>> for RateLimitService<S, K>
where
    S: Service<Request<ReqBody>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    K: KeyExtractor,
    ReqBody: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        let limiter = self.limiter.clone();
        let message = self.message.clone();
        let key = self.extractor.extract(&req);

        Box::pin(async move {
            let Some(key) = key else {
                debug!(path = %req.uri().path(), "No rate limit key for request");
                return Ok(TooManyRequests {
                    retry_after: UNKEYED_RETRY_AFTER_SECS,
                    message: message.to_string(),
                }
                .into_response());
            };

            let info = check_with_config(limiter.as_ref(), &key, limiter.config()).await;
            if !info.allowed {
                debug!(key = %key, path = %req.uri().path(), "Request rate limited");
                return Ok(RateLimited::new(info, message.to_string()).into_response());
            }

            let mut response = inner.call(req).await?;
            apply_rate_limit_headers(response.headers_mut(), &info);
            Ok(response)
        })
    }
}
