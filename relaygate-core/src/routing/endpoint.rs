//! Endpoint resolution: one endpoint, or a failover-managed candidate set.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::context::expand::is_static;
use crate::failover::{self, Candidate, FailoverStrategy, StrategyKind};

/// Where a routing node sends its request.
///
/// Candidates are templates; they are expanded against the context at
/// dispatch time, once per attempt.
pub enum EndpointSet<T: Candidate> {
    /// Exactly one attempt per exchange, no failover.
    Single(T),
    /// Candidates selected by a shared strategy.
    Failover(Arc<dyn FailoverStrategy<T>>),
}

impl<T: Candidate> EndpointSet<T> {
    /// Build from a candidate list. One candidate and no strategy gives a
    /// single endpoint; an unknown strategy name degrades to sticky.
    pub fn from_candidates(
        mut candidates: Vec<T>,
        strategy: Option<&str>,
        retry_interval: Duration,
    ) -> Option<Self> {
        if candidates.len() == 1 && strategy.is_none() {
            return candidates.pop().map(Self::Single);
        }
        let kind = StrategyKind::parse_or_sticky(strategy.unwrap_or("sticky"));
        match failover::create(kind, candidates, retry_interval) {
            Ok(strategy) => Some(Self::Failover(strategy)),
            Err(e) => {
                warn!(error = %e, "No endpoints configured");
                None
            }
        }
    }

    /// Upper bound on attempts per exchange.
    pub fn max_attempts(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Failover(strategy) => strategy.len().max(1),
        }
    }

    pub fn strategy(&self) -> Option<&Arc<dyn FailoverStrategy<T>>> {
        match self {
            Self::Single(_) => None,
            Self::Failover(strategy) => Some(strategy),
        }
    }
}

impl<T: Candidate> fmt::Debug for EndpointSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(c) => f.debug_tuple("Single").field(c).finish(),
            Self::Failover(s) => f
                .debug_struct("Failover")
                .field("strategy", &s.name())
                .field("candidates", &s.len())
                .finish(),
        }
    }
}

/// Check a static URL at construction. Templated URLs are checked per
/// attempt instead. Returns a warning message for invalid URLs; an invalid
/// URL degrades to a per-attempt `bad-url` failure rather than refusing to
/// start.
pub fn check_static_url(template: &str) -> Option<String> {
    if !is_static(template) {
        return None;
    }
    match Url::parse(template) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => None,
        Ok(url) => Some(format!("unsupported scheme '{}' in {template}", url.scheme())),
        Err(e) => Some(format!("invalid URL {template}: {e}")),
    }
}

/// URL parts published as routing variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub url: String,
    pub host: String,
    pub protocol: String,
    pub port: u16,
    pub path: String,
    /// With the leading `?`, or empty.
    pub query: String,
    pub fragment: String,
}

impl UrlParts {
    pub fn of(url: &Url) -> Self {
        Self {
            url: url.to_string(),
            host: url.host_str().unwrap_or_default().to_string(),
            protocol: url.scheme().to_string(),
            port: url.port_or_known_default().unwrap_or(80),
            path: url.path().to_string(),
            query: url.query().map(|q| format!("?{q}")).unwrap_or_default(),
            fragment: url.fragment().unwrap_or_default().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::DEFAULT_RETRY_INTERVAL;

    #[test]
    fn single_candidate_without_strategy_is_single() {
        let set = EndpointSet::from_candidates(vec!["http://a".to_string()], None, DEFAULT_RETRY_INTERVAL)
            .unwrap();
        assert!(matches!(set, EndpointSet::Single(_)));
        assert_eq!(set.max_attempts(), 1);
    }

    #[test]
    fn unknown_strategy_degrades_to_sticky() {
        let set = EndpointSet::from_candidates(
            vec!["a".to_string(), "b".to_string()],
            Some("weighted"),
            DEFAULT_RETRY_INTERVAL,
        )
        .unwrap();
        assert_eq!(set.strategy().unwrap().name(), "sticky");
        assert_eq!(set.max_attempts(), 2);
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(EndpointSet::<String>::from_candidates(Vec::new(), None, DEFAULT_RETRY_INTERVAL).is_none());
    }

    #[test]
    fn static_url_checks() {
        assert!(check_static_url("http://backend:8080/svc").is_none());
        assert!(check_static_url("http://${host}/svc").is_none());
        assert!(check_static_url("not a url").is_some());
        assert!(check_static_url("ftp://backend/").is_some());
    }

    #[test]
    fn url_parts_default_port_and_query() {
        let url = Url::parse("https://api.example.com/v1/orders?id=7#top").unwrap();
        let parts = UrlParts::of(&url);
        assert_eq!(parts.host, "api.example.com");
        assert_eq!(parts.protocol, "https");
        assert_eq!(parts.port, 443);
        assert_eq!(parts.path, "/v1/orders");
        assert_eq!(parts.query, "?id=7");
        assert_eq!(parts.fragment, "top");
    }
}
