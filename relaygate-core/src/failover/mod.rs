//! Failover strategies: stateful selection among candidate endpoints.
//!
//! A strategy answers three calls: [`FailoverStrategy::select`],
//! [`FailoverStrategy::report_success`] and
//! [`FailoverStrategy::report_failure`]. Algorithms differ in which candidate
//! `select` prefers:
//!
//! | Name | Behaviour |
//! |------|-----------|
//! | `sticky` / `ordered` | Stay on the last good candidate; otherwise the first available in list order |
//! | `round-robin` / `robin` | Rotate; never the same candidate twice in a row while another is available |
//! | `random` | Uniform among available candidates, avoiding an immediate repeat |
//!
//! A candidate reported as failed is blacklisted. Blacklisted candidates are
//! skipped until the retry interval passes, after which one may be tried
//! again. When every candidate is blacklisted and none is due for a retry,
//! `select` returns `None`.
//!
//! # Thread Safety
//!
//! One strategy instance is shared by every concurrent exchange routed
//! through the same node. All bookkeeping sits behind a single mutex per
//! strategy; each call holds it only for the selection itself.

pub mod random;
pub mod round_robin;
pub mod sticky;

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

pub use random::RandomStrategy;
pub use round_robin::RoundRobinStrategy;
pub use sticky::StickyStrategy;

/// Default time a failed candidate stays out of rotation.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(300);

/// Bound for candidate identities.
pub trait Candidate: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static {}

impl<T> Candidate for T where T: Clone + Eq + Hash + Display + Debug + Send + Sync + 'static {}

/// Stateful endpoint selector.
pub trait FailoverStrategy<T: Candidate>: Send + Sync + Debug {
    /// Algorithm name, for logs.
    fn name(&self) -> &'static str;

    /// Next candidate, or `None` when every candidate is blacklisted.
    fn select(&self) -> Option<T>;

    fn report_success(&self, candidate: &T);

    fn report_failure(&self, candidate: &T);

    /// Number of candidates managed.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Errors from strategy construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("unknown failover strategy '{name}'")]
    UnknownStrategy { name: String },

    #[error("failover strategy has no candidates")]
    NoCandidates,
}

/// Strategy algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Sticky,
    RoundRobin,
    Random,
}

impl StrategyKind {
    /// Parse a configured name.
    ///
    /// # Errors
    ///
    /// Returns [`StrategyError::UnknownStrategy`] for unrecognized names.
    pub fn parse(name: &str) -> Result<Self, StrategyError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sticky" | "ordered" => Ok(Self::Sticky),
            "round-robin" | "round_robin" | "robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            _ => Err(StrategyError::UnknownStrategy {
                name: name.to_string(),
            }),
        }
    }

    /// Parse a configured name, degrading to sticky with a warning.
    pub fn parse_or_sticky(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to sticky failover");
            Self::Sticky
        })
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sticky => "sticky",
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
        })
    }
}

/// Build a strategy over `candidates`.
///
/// # Errors
///
/// Returns [`StrategyError::NoCandidates`] for an empty candidate list.
pub fn create<T: Candidate>(
    kind: StrategyKind,
    candidates: Vec<T>,
    retry_interval: Duration,
) -> Result<Arc<dyn FailoverStrategy<T>>, StrategyError> {
    if candidates.is_empty() {
        return Err(StrategyError::NoCandidates);
    }
    debug!(strategy = %kind, candidates = candidates.len(), "Failover strategy created");
    Ok(match kind {
        StrategyKind::Sticky => Arc::new(StickyStrategy::new(candidates, retry_interval)),
        StrategyKind::RoundRobin => Arc::new(RoundRobinStrategy::new(candidates, retry_interval)),
        StrategyKind::Random => Arc::new(RandomStrategy::new(candidates, retry_interval)),
    })
}

// ============================================================================
// Shared bookkeeping
// ============================================================================

/// Candidate list plus blacklist timestamps, guarded by the owning
/// strategy's mutex.
#[derive(Debug)]
pub(crate) struct Roster<T: Candidate> {
    candidates: Vec<T>,
    index: HashMap<T, usize>,
    blacklisted_at: Vec<Option<Instant>>,
    retry_interval: Duration,
}

impl<T: Candidate> Roster<T> {
    pub(crate) fn new(candidates: Vec<T>, retry_interval: Duration) -> Self {
        let mut index = HashMap::with_capacity(candidates.len());
        for (i, c) in candidates.iter().enumerate() {
            index.entry(c.clone()).or_insert(i);
        }
        let blacklisted_at = vec![None; candidates.len()];
        Self {
            candidates,
            index,
            blacklisted_at,
            retry_interval,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.candidates.len()
    }

    pub(crate) fn get(&self, i: usize) -> Option<&T> {
        self.candidates.get(i)
    }

    pub(crate) fn position(&self, candidate: &T) -> Option<usize> {
        self.index.get(candidate).copied()
    }

    /// Not blacklisted.
    pub(crate) fn is_healthy(&self, i: usize) -> bool {
        matches!(self.blacklisted_at.get(i), Some(None))
    }

    /// Blacklisted, but long enough ago to be retried.
    fn is_retry_due(&self, i: usize, now: Instant) -> bool {
        matches!(self.blacklisted_at.get(i), Some(Some(at)) if now.duration_since(*at) >= self.retry_interval)
    }

    /// Indices that may be selected now. Healthy candidates win; retry-due
    /// ones are offered only when nothing is healthy.
    pub(crate) fn available(&self) -> Vec<usize> {
        let healthy: Vec<usize> = (0..self.len()).filter(|&i| self.is_healthy(i)).collect();
        if !healthy.is_empty() {
            return healthy;
        }
        let now = Instant::now();
        (0..self.len()).filter(|&i| self.is_retry_due(i, now)).collect()
    }

    /// Mark success. Returns the candidate's index.
    pub(crate) fn succeed(&mut self, candidate: &T) -> Option<usize> {
        let i = self.position(candidate)?;
        if self.blacklisted_at[i].take().is_some() {
            debug!(candidate = %candidate, "Candidate restored");
        }
        Some(i)
    }

    /// Mark failure. Returns the candidate's index.
    pub(crate) fn fail(&mut self, candidate: &T) -> Option<usize> {
        let Some(i) = self.position(candidate) else {
            warn!(candidate = %candidate, "Failure reported for unknown candidate");
            return None;
        };
        self.blacklisted_at[i] = Some(Instant::now());
        debug!(candidate = %candidate, "Candidate blacklisted");
        Some(i)
    }
}
