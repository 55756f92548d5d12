//! In-process broker.
//!
//! Backs queue routing in tests and single-process deployments. Queues must
//! be declared before use; sending to an unknown queue is a naming error,
//! like a failed directory lookup.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use super::provider::{QueueConnector, QueueError, QueueMessage, QueueSession};

#[derive(Debug, Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, VecDeque<QueueMessage>>>,
    arrived: Notify,
    next_id: AtomicU64,
}

/// Shared handle to an in-memory broker. Clones see the same queues.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `name` if it does not exist.
    pub fn declare_queue(&self, name: &str) {
        self.state.queues.lock().entry(name.to_string()).or_default();
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state.queues.lock().contains_key(name)
    }

    /// Messages waiting on `name`.
    pub fn depth(&self, name: &str) -> usize {
        self.state.queues.lock().get(name).map_or(0, VecDeque::len)
    }

    /// Put a message on `name`, assigning its message id.
    ///
    /// # Errors
    ///
    /// [`QueueError::Naming`] when the queue was never declared.
    pub fn publish(&self, name: &str, mut message: QueueMessage) -> Result<String, QueueError> {
        let id = format!("ID:{}", self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        message.message_id = Some(id.clone());
        {
            let mut queues = self.state.queues.lock();
            let Some(queue) = queues.get_mut(name) else {
                return Err(QueueError::Naming {
                    name: name.to_string(),
                    detail: "no such queue".to_string(),
                    transient: false,
                });
            };
            queue.push_back(message);
        }
        trace!(queue = %name, message_id = %id, "Message enqueued");
        self.state.arrived.notify_waiters();
        Ok(id)
    }

    /// Remove the first message on `name` matching `correlation_id`.
    pub fn take(&self, name: &str, correlation_id: Option<&str>) -> Option<QueueMessage> {
        let mut queues = self.state.queues.lock();
        let queue = queues.get_mut(name)?;
        let index = match correlation_id {
            Some(wanted) => queue
                .iter()
                .position(|m| m.correlation_id.as_deref() == Some(wanted))?,
            None => 0,
        };
        queue.remove(index)
    }

    /// Wait for a matching message until `timeout` elapses.
    pub async fn wait_for(
        &self,
        name: &str,
        correlation_id: Option<&str>,
        timeout: Duration,
    ) -> Option<QueueMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a publish in between still wakes us.
            let arrived = self.state.arrived.notified();
            if let Some(message) = self.take(name, correlation_id) {
                return Some(message);
            }
            if tokio::time::timeout_at(deadline, arrived).await.is_err() {
                return None;
            }
        }
    }

    fn remove_queue(&self, name: &str) {
        self.state.queues.lock().remove(name);
    }

    fn next_temporary_name(&self) -> String {
        format!("tmp-{}", self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl QueueConnector for InMemoryBroker {
    async fn connect(&self, _endpoint: &str) -> Result<Box<dyn QueueSession>, QueueError> {
        Ok(Box::new(MemorySession {
            broker: self.clone(),
            temporaries: HashSet::new(),
        }))
    }
}

/// Session on an [`InMemoryBroker`]. Temporary queues it created are removed
/// when it is dropped.
#[derive(Debug)]
pub struct MemorySession {
    broker: InMemoryBroker,
    temporaries: HashSet<String>,
}

#[async_trait]
impl QueueSession for MemorySession {
    async fn send(&mut self, destination: &str, message: QueueMessage) -> Result<String, QueueError> {
        self.broker.publish(destination, message)
    }

    async fn create_temporary_queue(&mut self) -> Result<String, QueueError> {
        let name = self.broker.next_temporary_name();
        self.broker.declare_queue(&name);
        self.temporaries.insert(name.clone());
        Ok(name)
    }

    async fn delete_temporary_queue(&mut self, name: &str) -> Result<(), QueueError> {
        if self.temporaries.remove(name) {
            self.broker.remove_queue(name);
        }
        Ok(())
    }

    async fn receive(
        &mut self,
        destination: &str,
        correlation_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        if !self.broker.has_queue(destination) {
            return Err(QueueError::Receive {
                destination: destination.to_string(),
                detail: "no such queue".to_string(),
            });
        }
        Ok(self.broker.wait_for(destination, correlation_id, timeout).await)
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        for name in self.temporaries.drain() {
            self.broker.remove_queue(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_queue_is_a_naming_error() {
        let broker = InMemoryBroker::new();
        let err = broker.publish("nowhere", QueueMessage::text("x")).unwrap_err();
        assert!(matches!(err, QueueError::Naming { transient: false, .. }));
    }

    #[tokio::test]
    async fn receive_filters_by_correlation() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("replies");
        let mut other = QueueMessage::text("other");
        other.correlation_id = Some("corr-1".into());
        let mut mine = QueueMessage::text("mine");
        mine.correlation_id = Some("corr-2".into());
        broker.publish("replies", other).unwrap();
        broker.publish("replies", mine).unwrap();

        let got = broker
            .wait_for("replies", Some("corr-2"), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(got.body, crate::routing::queue::QueueBody::Text("mine".into()));
        assert_eq!(broker.depth("replies"), 1);
    }

    #[tokio::test]
    async fn receive_wakes_on_late_publish() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("replies");
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("replies", QueueMessage::text("late")).unwrap();
        });
        let got = broker.wait_for("replies", None, Duration::from_secs(2)).await;
        assert!(got.is_some());
    }

    #[tokio::test]
    async fn receive_times_out() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("replies");
        let got = broker.wait_for("replies", None, Duration::from_millis(20)).await;
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn temporary_queues_are_session_owned() {
        let broker = InMemoryBroker::new();
        let mut session = broker.connect("local").await.unwrap();
        let tmp = session.create_temporary_queue().await.unwrap();
        assert!(broker.has_queue(&tmp));
        session.delete_temporary_queue(&tmp).await.unwrap();
        assert!(!broker.has_queue(&tmp));

        let leaked = session.create_temporary_queue().await.unwrap();
        drop(session);
        assert!(!broker.has_queue(&leaked));
    }
}
