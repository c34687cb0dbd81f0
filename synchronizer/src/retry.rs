//! JSON-RPC transport that retries failed and rate-limited requests.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use alloy::{
    providers::{ProviderBuilder, RootProvider},
    rpc::{
        client::ClientBuilder,
        json_rpc::{RequestPacket, Response, ResponsePacket, ResponsePayload},
    },
    transports::TransportError,
};
use tower::{retry::Policy, Layer, Service};
use tracing::warn;

/// JSON-RPC error codes node providers use for "too many requests".
const RATE_LIMIT_CODES: [i64; 2] = [429, -32005];

/// Longest sleep between two attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    backoff: Duration,
    retries: u32,
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Duration, max_retries: u32) -> Self {
        Self {
            backoff,
            retries: 0,
            max_retries,
        }
    }

    /// Sleep before the next attempt: doubles with every retry, up to
    /// [`MAX_BACKOFF`].
    pub fn delay(&self) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(self.retries))
            .min(MAX_BACKOFF)
    }

    pub fn exhausted(&self) -> bool {
        self.retries >= self.max_retries
    }
}

fn is_rate_limited(response: &Response) -> bool {
    matches!(&response.payload, ResponsePayload::Failure(e) if RATE_LIMIT_CODES.contains(&e.code))
}

fn should_retry(result: Result<&ResponsePacket, &TransportError>) -> bool {
    match result {
        Err(_) => true,
        Ok(ResponsePacket::Single(response)) => is_rate_limited(response),
        Ok(ResponsePacket::Batch(responses)) => responses.iter().any(is_rate_limited),
    }
}

impl Policy<RequestPacket, ResponsePacket, TransportError> for RetryPolicy {
    type Future = Pin<Box<dyn Future<Output = Self> + Send + 'static>>;

    fn retry(
        &self,
        _req: &RequestPacket,
        result: Result<&ResponsePacket, &TransportError>,
    ) -> Option<Self::Future> {
        if !should_retry(result) || self.exhausted() {
            return None;
        }
        let mut policy = self.clone();
        let delay = policy.delay();
        warn!(
            attempt = policy.retries + 1,
            max_retries = policy.max_retries,
            ?delay,
            "retrying RPC request"
        );
        Some(Box::pin(async move {
            tokio::time::sleep(delay).await;
            policy.retries += 1;
            policy
        }))
    }

    fn clone_request(&self, req: &RequestPacket) -> Option<RequestPacket> {
        Some(req.clone())
    }
}

pub struct RetryLayer {
    policy: RetryPolicy,
}

impl RetryLayer {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            policy: self.policy.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryService<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> Service<RequestPacket> for RetryService<S>
where
    S: Service<RequestPacket, Response = ResponsePacket, Error = TransportError>
        + Send
        + 'static
        + Clone,
    S::Future: Send + 'static,
{
    type Response = ResponsePacket;
    type Error = TransportError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: RequestPacket) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let mut policy = self.policy.clone();

        Box::pin(async move {
            let mut res = inner.call(req.clone()).await;
            while let Some(next) = policy.retry(&req, res.as_ref()) {
                policy = next.await;
                res = inner.call(req.clone()).await;
            }
            res
        })
    }
}

/// HTTP provider for `rpc_url` whose requests are retried up to
/// `max_retries` times, starting `backoff` milliseconds apart.
pub fn build_http_retry_provider(
    rpc_url: url::Url,
    backoff: u64,
    max_retries: u32,
) -> RootProvider<RetryService<alloy::transports::http::ReqwestTransport>> {
    let retry = RetryLayer::new(RetryPolicy::new(
        Duration::from_millis(backoff),
        max_retries,
    ));
    let client = ClientBuilder::default().layer(retry).http(rpc_url);
    ProviderBuilder::new().on_client(client)
}

#[cfg(test)]
mod tests {
    use alloy::transports::TransportErrorKind;

    use super::*;

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let mut policy = RetryPolicy::new(Duration::from_millis(100), 20);
        assert_eq!(policy.delay(), Duration::from_millis(100));
        policy.retries = 3;
        assert_eq!(policy.delay(), Duration::from_millis(800));
        policy.retries = 19;
        assert_eq!(policy.delay(), MAX_BACKOFF);
        policy.retries = 20;
        assert!(policy.exhausted());
    }

    #[test]
    fn transport_errors_are_retried() {
        let err = TransportErrorKind::custom_str("connection reset");
        assert!(should_retry(Err(&err)));
    }

    #[test]
    fn rate_limit_responses_are_retried() {
        let limited: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"limit exceeded"}}"#,
        )
        .unwrap();
        let reverted: Response = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":3,"message":"execution reverted"}}"#,
        )
        .unwrap();
        let ok: Response =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":3,"result":"0x10"}"#).unwrap();

        assert!(should_retry(Ok(&ResponsePacket::Single(limited.clone()))));
        assert!(!should_retry(Ok(&ResponsePacket::Single(reverted))));
        assert!(!should_retry(Ok(&ResponsePacket::Single(ok.clone()))));
        assert!(should_retry(Ok(&ResponsePacket::Batch(vec![ok, limited]))));
    }
}
