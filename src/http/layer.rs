//! Tower middleware that gates requests through a [`RateLimiter`].

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::future::BoxFuture;
use serde::Serialize;
use tower::{Layer, Service};
use tracing::debug;

use crate::ratelimit::{Decision, RateLimiter, Verdict, FALLBACK_CLIENT};

/// Body message returned with every 429.
pub const REJECTION_MESSAGE: &str = "Too many requests, please try again later.";

const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Authenticated caller, inserted as a request extension by the auth layer.
///
/// When present, requests are counted per user instead of per address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: String,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Rejection {
    message: &'static str,
    retry_after: u64,
}

/// Layer applying [`RateLimitService`] to an inner service.
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    trust_proxy_headers: bool,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            trust_proxy_headers: false,
        }
    }

    /// Read the client address from `X-Forwarded-For` / `X-Real-IP`.
    ///
    /// Only enable behind a proxy that overwrites these headers.
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, next: S) -> Self::Service {
        RateLimitService {
            next,
            limiter: self.limiter.clone(),
            trust_proxy_headers: self.trust_proxy_headers,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<S> {
    next: S,
    limiter: Arc<RateLimiter>,
    trust_proxy_headers: bool,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Use the instance that was polled ready and leave a fresh clone behind
        let clone = self.next.clone();
        let mut next = std::mem::replace(&mut self.next, clone);
        let limiter = self.limiter.clone();
        let client = client_id(&req, self.trust_proxy_headers);

        Box::pin(async move {
            let method = req.method().clone();
            let path = req.uri().path().to_string();

            match limiter.check(&client, &method, &path).await {
                Verdict::Exempt | Verdict::Unavailable => next.call(req).await,
                Verdict::Decided { decision, .. } if !decision.allowed => {
                    debug!(client = %client, path = %path, "Request rejected by rate limit");
                    Ok(too_many_requests(&decision))
                }
                Verdict::Decided { decision, refund } => {
                    let mut response = next.call(req).await?;
                    apply_headers(response.headers_mut(), &decision);

                    if let Some(ticket) = refund {
                        limiter.settle(ticket, response.status()).await;
                    }

                    Ok(response)
                }
            }
        })
    }
}

/// Identify the caller: user id, then trusted proxy headers, then peer address.
fn client_id<B>(req: &Request<B>, trust_proxy_headers: bool) -> String {
    if let Some(identity) = req.extensions().get::<ClientIdentity>() {
        let user_id = identity.user_id.trim();
        if !user_id.is_empty() {
            return format!("user:{}", user_id);
        }
    }

    if trust_proxy_headers {
        if let Some(ip) = forwarded_ip(req.headers()) {
            return ip.to_string();
        }
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| FALLBACK_CLIENT.to_string())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok());

    forwarded.or_else(|| {
        headers
            .get(X_REAL_IP)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
    })
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(X_RATELIMIT_RESET, HeaderValue::from(decision.reset_at_secs()));
}

fn too_many_requests(decision: &Decision) -> Response {
    let body = Rejection {
        message: REJECTION_MESSAGE,
        retry_after: decision.retry_after_secs,
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    apply_headers(headers, decision);
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{RateKey, Ticket};

    fn request() -> Request<()> {
        Request::builder().uri("/api/posts").body(()).unwrap()
    }

    #[test]
    fn test_user_identity_takes_precedence() {
        let mut req = request();
        req.extensions_mut().insert(ClientIdentity::new("u-42"));
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.0.0.7:5555".parse().unwrap()));

        assert_eq!(client_id(&req, false), "user:u-42");
    }

    #[test]
    fn test_blank_user_identity_falls_through() {
        let mut req = request();
        req.extensions_mut().insert(ClientIdentity::new("  "));
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.0.0.7:5555".parse().unwrap()));

        assert_eq!(client_id(&req, false), "10.0.0.7");
    }

    #[test]
    fn test_peer_address_used_without_identity() {
        let mut req = request();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("[2001:db8::1]:443".parse().unwrap()));

        assert_eq!(client_id(&req, false), "2001:db8::1");
    }

    #[test]
    fn test_fallback_when_nothing_known() {
        assert_eq!(client_id(&request(), false), FALLBACK_CLIENT);
    }

    #[test]
    fn test_proxy_headers_ignored_unless_trusted() {
        let mut req = Request::builder()
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo::<SocketAddr>("10.0.0.1:8080".parse().unwrap()));

        assert_eq!(client_id(&req, false), "10.0.0.1");
        assert_eq!(client_id(&req, true), "203.0.113.9");
    }

    #[test]
    fn test_real_ip_when_forwarded_for_unusable() {
        let req = Request::builder()
            .header("x-forwarded-for", "garbage")
            .header("x-real-ip", "198.51.100.4")
            .body(())
            .unwrap();

        assert_eq!(client_id(&req, true), "198.51.100.4");
    }

    #[test]
    fn test_rejection_response() {
        let decision = Decision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at_millis: 1_700_000_000_500,
            retry_after_secs: 42,
            ticket: None,
        };

        let response = too_many_requests(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let headers = response.headers();
        assert_eq!(headers["retry-after"], "42");
        assert_eq!(headers["x-ratelimit-limit"], "5");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "1700000001");
    }

    #[test]
    fn test_allowed_headers() {
        let decision = Decision {
            allowed: true,
            limit: 100,
            remaining: 99,
            reset_at_millis: 2_000,
            retry_after_secs: 0,
            ticket: Some(Ticket {
                key: RateKey::new("10.0.0.1", "default"),
                at_millis: 1_000,
            }),
        };

        let mut headers = HeaderMap::new();
        apply_headers(&mut headers, &decision);

        assert_eq!(headers["x-ratelimit-limit"], "100");
        assert_eq!(headers["x-ratelimit-remaining"], "99");
        assert_eq!(headers["x-ratelimit-reset"], "2");
        assert!(headers.get(RETRY_AFTER).is_none());
    }

    #[test]
    fn test_rejection_body_shape() {
        let body = serde_json::to_value(Rejection {
            message: REJECTION_MESSAGE,
            retry_after: 7,
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "message": "Too many requests, please try again later.",
                "retryAfter": 7
            })
        );
    }
}
