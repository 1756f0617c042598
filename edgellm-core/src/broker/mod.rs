//! In-memory publish/subscribe keyed by job id.
//!
//! A job can have several listeners at once: the request that enqueued it
//! and any client that reconnected later. Callbacks run synchronously on the
//! notifying task, in registration order. A panicking callback is logged
//! and skipped; it never reaches the publisher.

mod events;

pub use events::StreamEvent;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::jobs::JobId;

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

type Registry = HashMap<JobId, Vec<(u64, Callback)>>;

#[derive(Default)]
struct BrokerInner {
    subscribers: Mutex<Registry>,
    next_id: AtomicU64,
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, job_id: JobId, id: u64) -> bool {
        let mut subscribers = self.lock();
        let Some(list) = subscribers.get_mut(&job_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(&job_id);
        }
        removed
    }
}

/// Per-job subscriber registry
#[derive(Clone, Default)]
pub struct StreamBroker {
    inner: Arc<BrokerInner>,
}

/// Handle for one registration
#[derive(Debug, Clone)]
pub struct Subscription {
    job_id: JobId,
    id: u64,
    broker: Weak<BrokerInner>,
}

impl Subscription {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Remove this registration. Returns `false` if it was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.broker.upgrade() {
            Some(broker) => broker.remove(self.job_id, self.id),
            None => false,
        }
    }
}

impl StreamBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every future event of `job_id`
    pub fn subscribe<F>(&self, job_id: JobId, callback: F) -> Subscription
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.subscribe_callback(job_id, Arc::new(callback))
    }

    pub fn subscribe_callback(&self, job_id: JobId, callback: Callback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().entry(job_id).or_default().push((id, callback));
        debug!(job_id = %job_id, subscription = id, "Subscriber registered");
        Subscription { job_id, id, broker: Arc::downgrade(&self.inner) }
    }

    /// Subscribe through an unbounded channel instead of a callback
    pub fn subscribe_channel(
        &self,
        job_id: JobId,
    ) -> (Subscription, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(job_id, move |event| {
            // Receiver gone means the listener left; nothing to do.
            let _ = tx.send(event.clone());
        });
        (subscription, rx)
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn remove(&self, subscription: &Subscription) -> bool {
        self.inner.remove(subscription.job_id, subscription.id)
    }

    /// Deliver `event` to every subscriber of `job_id`, in registration order
    pub fn notify_subscribers(&self, job_id: JobId, event: &StreamEvent) {
        let callbacks: Vec<Callback> = match self.inner.lock().get(&job_id) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => return,
        };

        for callback in &callbacks {
            deliver(job_id, callback, event);
        }
    }

    /// Detach every subscriber of `job_id` and hand them the closing events.
    ///
    /// Returns the number of subscribers that were attached.
    pub fn finish_job(&self, job_id: JobId, events: &[StreamEvent]) -> usize {
        let detached = self.inner.lock().remove(&job_id).unwrap_or_default();

        for (_, callback) in &detached {
            for event in events {
                deliver(job_id, callback, event);
            }
        }
        detached.len()
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.inner.lock().get(&job_id).map_or(0, Vec::len)
    }

    pub fn has_subscribers(&self, job_id: JobId) -> bool {
        self.subscriber_count(job_id) > 0
    }
}

/// Run one callback, containing a panic
pub fn deliver(job_id: JobId, callback: &Callback, event: &StreamEvent) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        error!(job_id = %job_id, event = event.kind(), "Stream subscriber panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Callback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |name: &str| -> Callback {
            let log = log_clone.clone();
            let name = name.to_string();
            Arc::new(move |event: &StreamEvent| {
                log.lock().unwrap().push(format!("{}:{}", name, event.kind()));
            })
        };
        (log, make)
    }

    #[test]
    fn test_notify_in_registration_order() {
        let broker = StreamBroker::new();
        let job_id = JobId::new();
        let (log, make) = recorder();

        broker.subscribe_callback(job_id, make("a"));
        broker.subscribe_callback(job_id, make("b"));
        broker.subscribe_callback(JobId::new(), make("other"));

        broker.notify_subscribers(job_id, &StreamEvent::response("x", None));

        assert_eq!(*log.lock().unwrap(), vec!["a:response", "b:response"]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let broker = StreamBroker::new();
        let job_id = JobId::new();
        let (log, make) = recorder();

        broker.subscribe_callback(job_id, make("first"));
        broker.subscribe(job_id, |_| panic!("subscriber bug"));
        broker.subscribe_callback(job_id, make("last"));

        broker.notify_subscribers(job_id, &StreamEvent::status("searching", None));

        assert_eq!(*log.lock().unwrap(), vec!["first:status", "last:status"]);
        assert_eq!(broker.subscriber_count(job_id), 3);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let broker = StreamBroker::new();
        let job_id = JobId::new();
        let (log, make) = recorder();

        let keep = broker.subscribe_callback(job_id, make("keep"));
        let leave = broker.subscribe_callback(job_id, make("leave"));

        assert!(leave.unsubscribe());
        assert!(!leave.unsubscribe());
        assert!(!broker.remove(&leave));

        broker.notify_subscribers(job_id, &StreamEvent::response("x", None));
        assert_eq!(*log.lock().unwrap(), vec!["keep:response"]);
        assert_eq!(keep.job_id(), job_id);
    }

    #[test]
    fn test_finish_job_detaches_everyone() {
        let broker = StreamBroker::new();
        let job_id = JobId::new();
        let (log, make) = recorder();
        let sub = broker.subscribe_callback(job_id, make("a"));

        let events = [StreamEvent::Error { message: "boom".into() }, StreamEvent::response("", None)];
        assert_eq!(broker.finish_job(job_id, &events), 1);
        assert_eq!(broker.finish_job(job_id, &events), 0);

        assert_eq!(*log.lock().unwrap(), vec!["a:error", "a:response"]);
        assert!(!broker.has_subscribers(job_id));
        assert!(!sub.unsubscribe());
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let broker = StreamBroker::new();
        let job_id = JobId::new();
        let (_sub, mut rx) = broker.subscribe_channel(job_id);

        broker.notify_subscribers(job_id, &StreamEvent::response("Hi", None));
        broker.finish_job(job_id, &[]);

        assert_eq!(rx.recv().await, Some(StreamEvent::response("Hi", None)));
        // Sender dropped with the registration
        assert_eq!(rx.recv().await, None);
    }
}
