//! Core rate limiter implementation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode};
use tracing::{debug, trace, warn};

use super::backend::{Decision, RateStore, StoreError, Ticket};
use super::key::{KeyGenerator, RateKey, RequestIdentity};
use super::rules::{RouteRules, Rule};
use crate::config::RateLimitingConfig;

/// Default bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Result of gating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The method is exempt; nothing was counted.
    Exempt,
    /// The store could not decide; the request is let through.
    Unavailable,
    /// The store decided.
    Decided {
        /// What the store reported
        decision: Decision,
        /// Hit to take back if the response turns out not to be an error
        refund: Option<Ticket>,
    },
}

impl Verdict {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        match self {
            Verdict::Exempt | Verdict::Unavailable => true,
            Verdict::Decided { decision, .. } => decision.allowed,
        }
    }
}

/// The rate limiter that gates requests against a [`RateStore`].
///
/// This struct is thread-safe and can be shared across request tasks.
pub struct RateLimiter {
    /// Backing accounting strategy
    store: Arc<dyn RateStore>,
    /// Default rule and per-route overrides
    rules: RouteRules,
    /// Methods that bypass accounting entirely
    skip_methods: HashSet<Method>,
    /// Optional override for bucket key derivation
    key_generator: Option<KeyGenerator>,
    /// Bound on every store call
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter exempting only `OPTIONS`.
    pub fn new(store: Arc<dyn RateStore>, rules: RouteRules) -> Self {
        Self {
            store,
            rules,
            skip_methods: HashSet::from([Method::OPTIONS]),
            key_generator: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Build a limiter from the rate limiting section of the configuration.
    pub fn from_config(store: Arc<dyn RateStore>, config: &RateLimitingConfig) -> crate::error::Result<Self> {
        Ok(Self::new(store, config.rules()?)
            .with_skip_methods(config.skip_methods()?)
            .with_store_timeout(config.store_timeout()))
    }

    /// Replace the set of exempt methods.
    pub fn with_skip_methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.skip_methods = methods.into_iter().collect();
        self
    }

    /// Install a bucket key override.
    pub fn with_key_generator(mut self, generator: KeyGenerator) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Bound every store call by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Name of the active store strategy.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    /// The configured rules.
    pub fn rules(&self) -> &RouteRules {
        &self.rules
    }

    /// Gate a request from `client` for `method` and `path`.
    ///
    /// Never fails: store errors and timeouts resolve to
    /// [`Verdict::Unavailable`].
    pub async fn check(&self, client: &str, method: &Method, path: &str) -> Verdict {
        if self.skip_methods.contains(method) {
            trace!(method = %method, path = %path, "Method exempt from rate limiting");
            return Verdict::Exempt;
        }

        let rule = self.rules.resolve(path);
        let identity = RequestIdentity {
            client,
            route: &rule.name,
            method,
            path,
        };
        let key = match &self.key_generator {
            Some(generator) => generator(&identity),
            None => identity.default_key(),
        };

        match self.check_key(&key, rule).await {
            Ok(decision) => {
                let refund = match &decision.ticket {
                    Some(ticket) if decision.allowed && rule.count_only_failures => {
                        Some(ticket.clone())
                    }
                    _ => None,
                };
                Verdict::Decided { decision, refund }
            }
            Err(e) => {
                warn!(
                    key = %key,
                    store = self.store.name(),
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                Verdict::Unavailable
            }
        }
    }

    /// Count one hit against `key` under `rule`.
    ///
    /// The store call runs on its own task so that a caller dropping this
    /// future cannot interrupt it between steps.
    pub async fn check_key(&self, key: &RateKey, rule: &Rule) -> Result<Decision, StoreError> {
        trace!(key = %key, limit = rule.max_requests, window = ?rule.window, "Checking rate limit");

        let store = Arc::clone(&self.store);
        let timeout = self.store_timeout;
        let task_key = key.clone();
        let task_rule = rule.clone();

        let task = tokio::spawn(async move {
            tokio::time::timeout(timeout, store.hit(&task_key, &task_rule)).await
        });

        let decision = match task.await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(StoreError::Timeout(timeout)),
            Err(e) => return Err(StoreError::Backend(format!("accounting task failed: {e}"))),
        };

        if !decision.allowed {
            debug!(
                key = %key,
                limit = decision.limit,
                retry_after = decision.retry_after_secs,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    /// Settle a request admitted under a failure-only rule.
    ///
    /// Responses below 400 are not failures, so their hit is taken back.
    /// Best effort: a failed refund is logged and otherwise ignored.
    pub async fn settle(&self, ticket: Ticket, status: StatusCode) {
        if is_failure(status) {
            return;
        }

        let store = Arc::clone(&self.store);
        let timeout = self.store_timeout;
        let key = ticket.key.clone();

        let task = tokio::spawn(async move { tokio::time::timeout(timeout, store.refund(&ticket)).await });

        match task.await {
            Ok(Ok(Ok(()))) => trace!(key = %key, status = %status, "Refunded successful request"),
            Ok(Ok(Err(e))) => warn!(key = %key, error = %e, "Failed to refund successful request"),
            Ok(Err(_)) => warn!(key = %key, timeout = ?timeout, "Refund timed out"),
            Err(e) => warn!(key = %key, error = %e, "Refund task failed"),
        }
    }
}

fn is_failure(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}
