//! The per-pool work queue.
//!
//! Every device worker of a pool pulls from one shared [`WorkQueue`]. The
//! queue is not FIFO across devices: a poll scans items in insertion order
//! and hands out the first one the requesting device is allowed to run.
//!
//! # Termination protocol
//!
//! The queue counts items that are *in flight* (claimed by a worker and not
//! yet finished). [`WorkQueue::offer`] only succeeds while that count is at
//! least one, so new work can only appear as a side effect of processing
//! existing work. Once a worker observes
//! [`has_no_potential_events_for`](WorkQueue::has_no_potential_events_for)
//! (nothing compatible queued, nothing in flight anywhere), no other worker
//! can still produce an item it could take, and it is safe for it to stop.
//!
//! ```text
//!   poll_for_device(dev) ──► Task ──► do_work(|item| ...) ──► released
//!          ▲                                   │
//!          │                                   │ offer(successor)
//!          └───────────── queued items ◄───────┘   (only while in flight)
//! ```
//!
//! The in-flight claim is taken under the same lock that removes the item,
//! so there is no window in which an item is neither queued nor counted.

pub mod item;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::device::DeviceId;

pub use item::{BackendAssignments, WorkItem};

/// How long a poll sleeps between re-checks when nothing matches.
pub const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(100);

/// Errors returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// `offer` was called while no item was being processed.
    #[error("cannot offer {test}: no work item is in flight")]
    NotInFlight { test: String },

    /// An item for the same test is already waiting in the queue.
    #[error("{test} is already queued")]
    Duplicate { test: String },
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<WorkItem>,
    in_flight: usize,
}

/// Multi-consumer blocking queue with per-device compatibility filtering.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Notify,
    slice: Duration,
}

impl WorkQueue {
    /// Seeds a queue. Items repeating an earlier test identity are dropped.
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let mut queued: VecDeque<WorkItem> = VecDeque::new();
        for item in items {
            if queued.contains(&item) {
                warn!("Dropping duplicate work item for {}", item.test());
                continue;
            }
            queued.push_back(item);
        }

        Self {
            state: Mutex::new(QueueState {
                items: queued,
                in_flight: 0,
            }),
            changed: Notify::new(),
            slice: DEFAULT_POLL_SLICE,
        }
    }

    /// Overrides the re-check interval used while polling.
    pub fn with_poll_slice(mut self, slice: Duration) -> Self {
        self.slice = slice.max(Duration::from_millis(1));
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes and returns the first queued item `device` may run.
    ///
    /// Blocks in slices until a compatible item appears or `timeout` elapses.
    /// A zero timeout waits for a single slice. Returns `None` early once the
    /// queue can no longer produce anything for `device` (nothing compatible
    /// queued and nothing in flight).
    pub async fn poll_for_device(&self, device: &DeviceId, timeout: Duration) -> Option<Task<'_>> {
        let deadline = Instant::now() + timeout.max(self.slice);

        loop {
            // Registered before inspecting the state so a change made between
            // the check and the wait still wakes us.
            let notified = self.changed.notified();

            {
                let mut state = self.lock();
                let position = state
                    .items
                    .iter()
                    .position(|item| item.is_compatible_with(device));
                if let Some(item) = position.and_then(|pos| state.items.remove(pos)) {
                    state.in_flight += 1;
                    trace!(device = %device, test = %item.test(), "Claimed work item");
                    return Some(Task {
                        item,
                        claim: Claim { queue: self },
                    });
                }
                if state.in_flight == 0 {
                    return None;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = self.slice.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// True iff nothing queued is compatible with `device` and nothing is in
    /// flight anywhere in the pool.
    pub fn has_no_potential_events_for(&self, device: &DeviceId) -> bool {
        let state = self.lock();
        state.in_flight == 0 && !state.items.iter().any(|item| item.is_compatible_with(device))
    }

    /// Re-offers an item. Only legal from inside [`Task::do_work`].
    pub fn offer(&self, item: WorkItem) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.in_flight == 0 {
            return Err(QueueError::NotInFlight {
                test: item.test().to_string(),
            });
        }
        if state.items.contains(&item) {
            return Err(QueueError::Duplicate {
                test: item.test().to_string(),
            });
        }
        trace!(test = %item.test(), failures = item.failure_count(), "Offered work item");
        state.items.push_back(item);
        drop(state);

        self.changed.notify_waiters();
        Ok(())
    }

    /// Number of queued (not in-flight) items.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Removes every queued item. Used once all workers have stopped, to
    /// account for items no remaining device could take.
    pub fn drain(&self) -> Vec<WorkItem> {
        self.lock().items.drain(..).collect()
    }

    fn release(&self) {
        let mut state = self.lock();
        assert!(state.in_flight > 0, "in-flight counter went negative");
        state.in_flight -= 1;
        drop(state);

        self.changed.notify_waiters();
    }
}

/// Marks one in-flight item; released on drop, including during unwinding.
#[derive(Debug)]
struct Claim<'q> {
    queue: &'q WorkQueue,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.queue.release();
    }
}

/// A claimed work item.
#[derive(Debug)]
pub struct Task<'q> {
    item: WorkItem,
    claim: Claim<'q>,
}

impl<'q> Task<'q> {
    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    /// The queue this task was claimed from.
    pub fn queue(&self) -> &'q WorkQueue {
        self.claim.queue
    }

    /// Runs `work` with the item while it counts as in flight.
    ///
    /// The in-flight count is released when `work` completes, fails, panics,
    /// or is dropped.
    pub async fn do_work<F, Fut, T>(self, work: F) -> T
    where
        F: FnOnce(WorkItem) -> Fut,
        Fut: Future<Output = T>,
    {
        let Task { item, claim } = self;
        let output = work(item).await;
        drop(claim);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::TestCase;
    use std::collections::HashMap;
    use std::sync::Arc;

    use futures::FutureExt;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn item(name: &str) -> WorkItem {
        WorkItem::new(TestCase::new("pkg", "C", name))
    }

    fn dev(serial: &str) -> DeviceId {
        DeviceId::new(serial)
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_poll_skips_excluded_items() {
        let queue = WorkQueue::new([
            item("A"),
            item("B").with_excluded([dev("dev1")]),
        ]);

        let a = queue.poll_for_device(&dev("dev1"), SHORT).await.unwrap();
        assert_eq!(a.item().test().method, "A");

        let b = queue.poll_for_device(&dev("dev2"), SHORT).await.unwrap();
        assert_eq!(b.item().test().method, "B");
    }

    #[tokio::test]
    async fn test_poll_never_hands_excluded_item_to_device() {
        let queue = WorkQueue::new([item("B").with_excluded([dev("dev1")]), item("A")]).with_poll_slice(SHORT);

        let first = queue.poll_for_device(&dev("dev1"), SHORT).await.unwrap();
        assert_eq!(first.item().test().method, "A");

        // B is still queued but dev1 may not take it, and A is in flight.
        assert!(queue.poll_for_device(&dev("dev1"), SHORT).await.is_none());
        assert!(!queue.has_no_potential_events_for(&dev("dev1")));

        first.do_work(|_| async {}).await;
        assert!(queue.has_no_potential_events_for(&dev("dev1")));
        assert!(!queue.has_no_potential_events_for(&dev("dev2")));
    }

    #[tokio::test]
    async fn test_poll_returns_immediately_when_exhausted() {
        let queue = WorkQueue::new(Vec::new());
        let started = std::time::Instant::now();
        assert!(queue.poll_for_device(&dev("d"), Duration::from_secs(10)).await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_offer_requires_in_flight_item() {
        let queue = WorkQueue::new([item("A")]);
        let err = queue.offer(item("B")).unwrap_err();
        assert!(matches!(err, QueueError::NotInFlight { .. }));

        let task = queue.poll_for_device(&dev("d"), SHORT).await.unwrap();
        let offered = task
            .do_work(|current| {
                let queue = &queue;
                async move {
                    assert_eq!(queue.in_flight(), 1);
                    queue.offer(current.successor())
                }
            })
            .await;
        tokio_test::assert_ok!(offered);
        assert_eq!(queue.in_flight(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_offer_rejects_duplicate_of_queued_item() {
        let queue = WorkQueue::new([item("A"), item("B")]);
        let task = queue.poll_for_device(&dev("d"), SHORT).await.unwrap();
        let queue_ref = &queue;
        let result = task
            .do_work(|_| async move { queue_ref.offer(item("B")) })
            .await;
        assert!(matches!(result, Err(QueueError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn test_new_drops_duplicates() {
        let queue = WorkQueue::new([item("A"), item("A").with_excluded([dev("x")]), item("B")]);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiting_poll_receives_offered_item() {
        let queue = Arc::new(WorkQueue::new([item("A")]).with_poll_slice(Duration::from_millis(10)));
        let task = queue.poll_for_device(&dev("d1"), SHORT).await.unwrap();

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                queue
                    .poll_for_device(&dev("d2"), Duration::from_secs(5))
                    .await
                    .map(|t| t.item().failure_count())
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        task.do_work(|current| {
            let queue = Arc::clone(&queue);
            async move { queue.offer(current.successor()).unwrap() }
        })
        .await;

        assert_eq!(waiter.await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_claim_released_when_work_panics() {
        let queue = WorkQueue::new([item("A")]);
        let task = queue.poll_for_device(&dev("d"), SHORT).await.unwrap();
        assert_eq!(queue.in_flight(), 1);

        let outcome = std::panic::AssertUnwindSafe(task.do_work(|_| async {
            let _: () = panic!("backend exploded");
        }))
        .catch_unwind()
        .await;

        assert!(outcome.is_err());
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.has_no_potential_events_for(&dev("d")));
    }

    #[tokio::test]
    async fn test_dropped_task_releases_claim() {
        let queue = WorkQueue::new([item("A")]);
        let task = queue.poll_for_device(&dev("d"), SHORT).await.unwrap();
        drop(task);
        assert_eq!(queue.in_flight(), 0);
    }

    /// Devices race for items with random exclusions while items randomly
    /// re-offer themselves. Every item must be finished exactly once, never
    /// by an excluded device, and every worker must terminate.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_randomized_interleavings_lose_nothing() {
        let devices: Vec<DeviceId> = (0..4).map(|i| dev(&format!("dev{i}"))).collect();

        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut items = Vec::new();
            let mut planned_retries = HashMap::new();
            for i in 0..40 {
                let name = format!("t{i}");
                // Exclude up to three of the four devices.
                let excluded: Vec<DeviceId> = devices
                    .iter()
                    .filter(|_| rng.gen_bool(0.4))
                    .take(3)
                    .cloned()
                    .collect();
                planned_retries.insert(name.clone(), rng.gen_range(0..3u32));
                items.push(item(&name).with_excluded(excluded));
            }

            let queue = Arc::new(WorkQueue::new(items).with_poll_slice(Duration::from_millis(5)));
            let planned = Arc::new(planned_retries);
            let finished = Arc::new(Mutex::new(Vec::new()));

            let mut workers = tokio::task::JoinSet::new();
            for device in devices.clone() {
                let queue = Arc::clone(&queue);
                let planned = Arc::clone(&planned);
                let finished = Arc::clone(&finished);
                workers.spawn(async move {
                    loop {
                        match queue.poll_for_device(&device, Duration::from_millis(50)).await {
                            Some(task) => {
                                let queue = &queue;
                                let device = &device;
                                let planned = &planned;
                                let finished = &finished;
                                task.do_work(|current| async move {
                                    assert!(current.is_compatible_with(device));
                                    tokio::task::yield_now().await;
                                    let name = current.test().method.clone();
                                    if current.failure_count() < planned[&name] {
                                        queue.offer(current.successor()).unwrap();
                                    } else {
                                        finished.lock().unwrap().push(name);
                                    }
                                })
                                .await;
                            }
                            None if queue.has_no_potential_events_for(&device) => break,
                            None => continue,
                        }
                    }
                });
            }

            let joined = tokio::time::timeout(Duration::from_secs(30), async {
                while let Some(joined) = workers.join_next().await {
                    joined.unwrap();
                }
            })
            .await;
            assert!(joined.is_ok(), "workers deadlocked with seed {seed}");

            let mut names = finished.lock().unwrap().clone();
            names.sort();
            let mut expected: Vec<String> = planned.keys().cloned().collect();
            expected.sort();
            assert_eq!(names, expected, "seed {seed}");
            assert_eq!(queue.in_flight(), 0);
            assert!(queue.is_empty());
        }
    }
}
