//! Rate limit rules and per-route matching.
//!
//! A deployment carries one default rule plus optional overrides keyed by
//! path prefix (stricter limits for authentication endpoints, looser
//! failure-only limits for search, and so on). The most specific matching
//! prefix wins.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{GateError, Result};

/// Name of the scope used when no route override matches.
pub const DEFAULT_SCOPE: &str = "default";

/// Limit settings as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Maximum requests allowed in the window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Only requests that end in an error status count long-term
    #[serde(default)]
    pub count_only_failures: bool,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 15 * 60 * 1000,
            count_only_failures: false,
        }
    }
}

/// A per-route override as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path prefix the override applies to (e.g. `/api/auth`)
    pub path: String,
    /// Maximum requests allowed in the window
    pub max_requests: u32,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Only requests that end in an error status count long-term
    #[serde(default)]
    pub count_only_failures: bool,
}

/// A resolved rate limit rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// Scope name; the route key for buckets counted under this rule
    pub name: String,
    /// Maximum requests allowed in the window
    pub max_requests: u32,
    /// Sliding window length
    pub window: Duration,
    /// Refund hits whose response was not an error
    pub count_only_failures: bool,
}

impl Rule {
    /// Create a rule counting every request.
    pub fn new(name: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            name: name.into(),
            max_requests,
            window,
            count_only_failures: false,
        }
    }

    /// Switch failure-only counting on or off.
    pub fn with_count_only_failures(mut self, enabled: bool) -> Self {
        self.count_only_failures = enabled;
        self
    }

    /// Window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window.as_millis() as u64
    }

    /// Window length in whole seconds, rounded up and at least one.
    pub fn window_secs(&self) -> u64 {
        self.window_millis().div_ceil(1_000).max(1)
    }

    fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(GateError::Config(format!(
                "rule '{}': max_requests must be positive",
                self.name
            )));
        }
        if self.window.is_zero() {
            return Err(GateError::Config(format!(
                "rule '{}': window_ms must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// The default rule plus path-prefix overrides.
#[derive(Debug, Clone)]
pub struct RouteRules {
    default: Rule,
    /// Overrides ordered from the longest prefix to the shortest
    routes: Vec<Rule>,
}

impl RouteRules {
    /// Rules with only a default and no overrides.
    pub fn new(default: Rule) -> Self {
        Self {
            default,
            routes: Vec::new(),
        }
    }

    /// Add an override for the path prefix named by `rule.name`.
    pub fn with_route(mut self, rule: Rule) -> Self {
        self.routes.push(rule);
        self.routes
            .sort_by(|a, b| b.name.len().cmp(&a.name.len()).then_with(|| a.name.cmp(&b.name)));
        self
    }

    /// Build and validate rules from configuration.
    pub fn from_config(default: &RuleConfig, routes: &[RouteConfig]) -> Result<Self> {
        let default_rule = Rule::new(
            DEFAULT_SCOPE,
            default.max_requests,
            Duration::from_millis(default.window_ms),
        )
        .with_count_only_failures(default.count_only_failures);
        default_rule.validate()?;

        let mut rules = Self::new(default_rule);
        for route in routes {
            if !route.path.starts_with('/') {
                return Err(GateError::Config(format!(
                    "route '{}': path must start with '/'",
                    route.path
                )));
            }

            let rule = Rule::new(
                route.path.clone(),
                route.max_requests,
                Duration::from_millis(route.window_ms),
            )
            .with_count_only_failures(route.count_only_failures);
            rule.validate()?;

            rules = rules.with_route(rule);
        }

        Ok(rules)
    }

    /// Find the rule governing `path`.
    pub fn resolve(&self, path: &str) -> &Rule {
        self.routes
            .iter()
            .find(|rule| prefix_matches(&rule.name, path))
            .unwrap_or(&self.default)
    }

    /// The rule used when no override matches.
    pub fn default_rule(&self) -> &Rule {
        &self.default
    }

    /// Iterate over every rule, default first.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        std::iter::once(&self.default).chain(self.routes.iter())
    }

    /// The longest window of any rule.
    pub fn longest_window(&self) -> Duration {
        self.iter().map(|rule| rule.window).max().unwrap_or_default()
    }
}

/// Prefix match that respects path segment boundaries.
fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RouteRules {
        RouteRules::from_config(
            &RuleConfig::default(),
            &[
                RouteConfig {
                    path: "/api/auth".to_string(),
                    max_requests: 5,
                    window_ms: 900_000,
                    count_only_failures: false,
                },
                RouteConfig {
                    path: "/api/search".to_string(),
                    max_requests: 30,
                    window_ms: 60_000,
                    count_only_failures: true,
                },
                RouteConfig {
                    path: "/api/auth/refresh".to_string(),
                    max_requests: 20,
                    window_ms: 60_000,
                    count_only_failures: false,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_default_rule_when_no_route_matches() {
        let rules = rules();
        let rule = rules.resolve("/api/posts/12");

        assert_eq!(rule.name, DEFAULT_SCOPE);
        assert_eq!(rule.max_requests, 100);
        assert_eq!(rule.window, Duration::from_secs(900));
    }

    #[test]
    fn test_route_prefix_match() {
        let rules = rules();

        assert_eq!(rules.resolve("/api/auth").max_requests, 5);
        assert_eq!(rules.resolve("/api/auth/login").max_requests, 5);

        let search = rules.resolve("/api/search/sneakers");
        assert_eq!(search.max_requests, 30);
        assert!(search.count_only_failures);
    }

    #[test]
    fn test_prefix_respects_segment_boundaries() {
        let rules = rules();
        assert_eq!(rules.resolve("/api/authors").name, DEFAULT_SCOPE);
    }

    #[test]
    fn test_most_specific_route_wins() {
        let rules = rules();

        let rule = rules.resolve("/api/auth/refresh");
        assert_eq!(rule.name, "/api/auth/refresh");
        assert_eq!(rule.max_requests, 20);
    }

    #[test]
    fn test_longest_window() {
        assert_eq!(rules().longest_window(), Duration::from_secs(900));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let config = RuleConfig {
            max_requests: 0,
            ..RuleConfig::default()
        };
        assert!(RouteRules::from_config(&config, &[]).is_err());
    }

    #[test]
    fn test_zero_window_rejected() {
        let route = RouteConfig {
            path: "/api/auth".to_string(),
            max_requests: 5,
            window_ms: 0,
            count_only_failures: false,
        };
        assert!(RouteRules::from_config(&RuleConfig::default(), &[route]).is_err());
    }

    #[test]
    fn test_relative_route_path_rejected() {
        let route = RouteConfig {
            path: "api/auth".to_string(),
            max_requests: 5,
            window_ms: 1_000,
            count_only_failures: false,
        };
        assert!(RouteRules::from_config(&RuleConfig::default(), &[route]).is_err());
    }

    #[test]
    fn test_window_secs_rounds_up() {
        let rule = Rule::new("r", 1, Duration::from_millis(1_500));
        assert_eq!(rule.window_secs(), 2);

        let rule = Rule::new("r", 1, Duration::from_millis(10));
        assert_eq!(rule.window_secs(), 1);
    }
}
