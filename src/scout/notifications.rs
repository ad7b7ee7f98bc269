//! Update subscriptions, deferred notifications, and the listener executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, unbounded};

use crate::core::{CrdtId, CrdtValue, TimestampMapping, VersionClock};
use super::cache::TxnSerial;

/// Application callback attached to a read. Fires at most once, when the
/// first update strictly newer than the read's version becomes globally
/// visible.
pub trait UpdateListener: Send + Sync {
    fn on_update(&self, id: &CrdtId, previous: &CrdtValue);
}

pub(crate) struct SubscriptionWithListener {
    pub serial: TxnSerial,
    pub listener: Arc<dyn UpdateListener>,
    /// Version the application saw; anything newer triggers the listener.
    pub read_version: VersionClock,
    /// View returned to the application, handed back on notification.
    pub view: CrdtValue,
    pub fired: Arc<AtomicBool>,
}

/// Per-object, per-session listener registry. The presence of an object key
/// alone means the scout wants to keep receiving that object's updates; a
/// session entry additionally holds a listener awaiting notification.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    objects: HashMap<CrdtId, HashMap<String, SubscriptionWithListener>>,
}

impl SubscriptionRegistry {
    /// Mark the object as subscribed. Returns true when this is a new
    /// subscription (the caller then arranges a subscribing fetch).
    pub fn ensure_subscribed(&mut self, id: &CrdtId) -> bool {
        if self.objects.contains_key(id) {
            return false;
        }
        self.objects.insert(id.clone(), HashMap::new());
        true
    }

    pub fn is_subscribed(&self, id: &CrdtId) -> bool {
        self.objects.contains_key(id)
    }

    /// Install a listener for (object, session), replacing any previous one:
    /// the latest read wins.
    pub fn add_listener(
        &mut self,
        id: &CrdtId,
        session_id: &str,
        subscription: SubscriptionWithListener,
    ) {
        self.objects
            .entry(id.clone())
            .or_default()
            .insert(session_id.to_string(), subscription);
    }

    pub fn sessions_with_listeners(&self, id: &CrdtId) -> Vec<String> {
        self.objects
            .get(id)
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listener(&self, id: &CrdtId, session_id: &str) -> Option<&SubscriptionWithListener> {
        self.objects.get(id)?.get(session_id)
    }

    pub fn listener_mut(
        &mut self,
        id: &CrdtId,
        session_id: &str,
    ) -> Option<&mut SubscriptionWithListener> {
        self.objects.get_mut(id)?.get_mut(session_id)
    }

    pub fn take_listener(
        &mut self,
        id: &CrdtId,
        session_id: &str,
    ) -> Option<SubscriptionWithListener> {
        self.objects.get_mut(id)?.remove(session_id)
    }

    pub fn has_listeners(&self, id: &CrdtId) -> bool {
        self.objects
            .get(id)
            .is_some_and(|sessions| !sessions.is_empty())
    }

    /// Drop the object subscription entirely (eviction, shutdown).
    pub fn remove_object(&mut self, id: &CrdtId) {
        self.objects.remove(id);
    }

    pub fn subscribed_ids(&self) -> Vec<CrdtId> {
        self.objects.keys().cloned().collect()
    }
}

/// Updates whose listeners wait for a global commit: mapping of the update to
/// the objects interested in it. Drained when the committed version grows to
/// cover a mapping.
#[derive(Default)]
pub(crate) struct PendingNotifications {
    entries: Vec<(TimestampMapping, Vec<CrdtId>)>,
}

impl PendingNotifications {
    pub fn add(&mut self, mapping: &TimestampMapping, id: &CrdtId) {
        for (existing, ids) in &mut self.entries {
            if existing.client() == mapping.client() {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
                for ts in mapping.system_timestamps() {
                    existing.add_system_timestamp(ts.clone());
                }
                return;
            }
        }
        self.entries.push((mapping.clone(), vec![id.clone()]));
    }

    /// Remove and return every entry whose mapping is covered by `clock`.
    pub fn drain_included(&mut self, clock: &VersionClock) -> Vec<(TimestampMapping, Vec<CrdtId>)> {
        let mut due = Vec::new();
        self.entries.retain(|(mapping, ids)| {
            if mapping.any_timestamp_included(clock) {
                due.push((mapping.clone(), ids.clone()));
                false
            } else {
                true
            }
        });
        due
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

type Task = Box<dyn FnOnce() + Send>;

/// Small fixed pool running listener callbacks and background fetches off
/// the caller threads.
pub(crate) struct ListenerExecutor {
    tx: std::sync::Mutex<Option<Sender<Task>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ListenerExecutor {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let workers = (0..threads.max(1))
            .map(|i| {
                let rx = rx.clone();
                std::thread::Builder::new()
                    .name(format!("scout-executor-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    })
                    .expect("spawn executor thread")
            })
            .collect();
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: std::sync::Mutex::new(workers),
        }
    }

    /// Schedule a task; dropped silently after shutdown.
    pub fn execute(&self, task: Task) {
        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(task);
        }
    }

    /// Stop accepting tasks, run out the queue, join the workers.
    pub fn shutdown(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for ListenerExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run the listener of a taken subscription, honoring the at-most-once flag.
pub(crate) fn listener_task(subscription: SubscriptionWithListener, id: CrdtId) -> Task {
    Box::new(move || {
        if subscription.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(object = %id, "notifying listener of update");
        subscription.listener.on_update(&id, &subscription.view);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CrdtKind, SourceId, Timestamp};
    use std::sync::atomic::AtomicUsize;

    fn id(key: &str) -> CrdtId {
        CrdtId::new("t", key, CrdtKind::Counter).unwrap()
    }

    struct CountingListener(AtomicUsize);

    impl UpdateListener for CountingListener {
        fn on_update(&self, _id: &CrdtId, _previous: &CrdtValue) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn subscription(listener: Arc<CountingListener>) -> SubscriptionWithListener {
        SubscriptionWithListener {
            serial: 1,
            listener,
            read_version: VersionClock::new(),
            view: CrdtValue::new(CrdtKind::Counter),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn listener_task_fires_at_most_once() {
        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        let fired = Arc::new(AtomicBool::new(false));

        let mut sub_a = subscription(Arc::clone(&listener));
        sub_a.fired = Arc::clone(&fired);
        let mut sub_b = subscription(Arc::clone(&listener));
        sub_b.fired = fired;

        listener_task(sub_a, id("a"))();
        listener_task(sub_b, id("a"))();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_tracks_subscription_and_listeners_separately() {
        let mut registry = SubscriptionRegistry::default();
        assert!(registry.ensure_subscribed(&id("a")));
        assert!(!registry.ensure_subscribed(&id("a")));
        assert!(registry.is_subscribed(&id("a")));
        assert!(!registry.has_listeners(&id("a")));

        let listener = Arc::new(CountingListener(AtomicUsize::new(0)));
        registry.add_listener(&id("a"), "s1", subscription(listener));
        assert!(registry.has_listeners(&id("a")));

        assert!(registry.take_listener(&id("a"), "s1").is_some());
        assert!(registry.take_listener(&id("a"), "s1").is_none());
        // Object stays subscribed after its listener fired.
        assert!(registry.is_subscribed(&id("a")));
    }

    #[test]
    fn pending_notifications_drain_on_coverage() {
        let scout = SourceId::parse("other").unwrap();
        let mapping = TimestampMapping::new(Timestamp::new(scout.clone(), 1));
        let mut pending = PendingNotifications::default();
        pending.add(&mapping, &id("a"));
        pending.add(&mapping, &id("b"));
        pending.add(&mapping, &id("a"));
        assert_eq!(pending.len(), 1);

        let mut clock = VersionClock::new();
        assert!(pending.drain_included(&clock).is_empty());

        clock.record(&Timestamp::new(scout, 1));
        let due = pending.drain_included(&clock);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1.len(), 2);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn executor_runs_tasks_and_drains_on_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = ListenerExecutor::new(2);
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            executor.execute(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        executor.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
