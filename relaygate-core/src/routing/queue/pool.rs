//! Per-endpoint session pool.
//!
//! # Connection Pooling
//!
//! Sessions are opened lazily through the node's [`QueueConnector`] and kept
//! idle per endpoint after use. Each endpoint allows at most `max_sessions`
//! sessions in use at once; waiting for one is bounded by `acquire_timeout`.
//!
//! A session that failed is discarded instead of returned. After
//! [`MAX_OOPSES`] consecutive failures on an endpoint, its idle sessions are
//! flushed too, since they likely share the broken connection.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::provider::{QueueConnector, QueueError, QueueSession};

/// Consecutive failures tolerated per endpoint before idle sessions are
/// flushed. Also bounds pre-send attempts.
pub const MAX_OOPSES: u32 = 5;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_sessions: usize,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct EndpointPool {
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn QueueSession>>>,
    oopses: AtomicU32,
}

/// Sessions for every endpoint a routing node sends to.
pub struct SessionPool {
    connector: Arc<dyn QueueConnector>,
    settings: PoolSettings,
    endpoints: DashMap<String, Arc<EndpointPool>>,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("connector", &self.connector)
            .field("settings", &self.settings)
            .field("endpoints", &self.endpoints.len())
            .finish()
    }
}

impl SessionPool {
    pub fn new(connector: Arc<dyn QueueConnector>, settings: PoolSettings) -> Self {
        Self {
            connector,
            settings,
            endpoints: DashMap::new(),
        }
    }

    fn endpoint(&self, endpoint: &str) -> Arc<EndpointPool> {
        self.endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(EndpointPool {
                    permits: Arc::new(Semaphore::new(self.settings.max_sessions.max(1))),
                    idle: Mutex::new(Vec::new()),
                    oopses: AtomicU32::new(0),
                })
            })
            .clone()
    }

    /// Check out a session for `endpoint`, reusing an idle one when present.
    ///
    /// # Errors
    ///
    /// [`QueueError::PoolExhausted`] when no slot frees up within the
    /// acquire timeout; connector errors when a new session cannot be opened.
    pub async fn acquire(&self, endpoint: &str) -> Result<PooledSession, QueueError> {
        let pool = self.endpoint(endpoint);
        let waited = self.settings.acquire_timeout;
        let permit = match tokio::time::timeout(waited, pool.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            _ => {
                return Err(QueueError::PoolExhausted {
                    endpoint: endpoint.to_string(),
                    waited,
                });
            }
        };

        let reused = pool.idle.lock().pop();
        let session = match reused {
            Some(session) => session,
            None => {
                debug!(endpoint = %endpoint, "Opening queue session");
                self.connector.connect(endpoint).await?
            }
        };
        Ok(PooledSession {
            session: Some(session),
            pool,
            broken: false,
            _permit: permit,
        })
    }

    pub fn record_success(&self, endpoint: &str) {
        if let Some(pool) = self.endpoints.get(endpoint) {
            pool.oopses.store(0, Ordering::Relaxed);
        }
    }

    /// Count a failure; flushes the endpoint's idle sessions once
    /// [`MAX_OOPSES`] consecutive failures are reached.
    pub fn record_failure(&self, endpoint: &str) {
        let pool = self.endpoint(endpoint);
        let oopses = pool.oopses.fetch_add(1, Ordering::Relaxed) + 1;
        if oopses >= MAX_OOPSES {
            let flushed = std::mem::take(&mut *pool.idle.lock()).len();
            pool.oopses.store(0, Ordering::Relaxed);
            warn!(endpoint = %endpoint, oopses, flushed, "Too many queue failures; idle sessions flushed");
        }
    }

    /// Idle sessions currently held for `endpoint`.
    pub fn idle_count(&self, endpoint: &str) -> usize {
        self.endpoints
            .get(endpoint)
            .map_or(0, |pool| pool.idle.lock().len())
    }

    /// Drop every idle session.
    pub fn close(&self) {
        for pool in self.endpoints.iter() {
            pool.idle.lock().clear();
        }
    }
}

/// A checked-out session. Returned to the idle list on drop unless marked
/// broken.
#[derive(Debug)]
pub struct PooledSession {
    session: Option<Box<dyn QueueSession>>,
    pool: Arc<EndpointPool>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub fn session(&mut self) -> Option<&mut (dyn QueueSession + 'static)> {
        self.session.as_deref_mut()
    }

    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take()
            && !self.broken
        {
            self.pool.idle.lock().push(session);
        }
    }
}
