//! Schedulable work items.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::device::DeviceId;
use crate::testcase::TestCase;

/// Per-device list of backend identifiers able to run a test.
pub type BackendAssignments = BTreeMap<DeviceId, Vec<String>>;

/// One test case plus its device eligibility and retry state.
///
/// Equality and hashing only look at the wrapped [`TestCase`] identity, so a
/// retried successor compares equal to the item it replaces.
///
/// # Example
///
/// ```
/// use poolrun::device::DeviceId;
/// use poolrun::queue::WorkItem;
/// use poolrun::testcase::TestCase;
///
/// let item = WorkItem::new(TestCase::new("pkg", "C", "m"))
///     .with_excluded([DeviceId::new("dev1")]);
///
/// assert!(!item.is_compatible_with(&DeviceId::new("dev1")));
/// assert!(item.is_compatible_with(&DeviceId::new("dev2")));
///
/// let retry = item.successor();
/// assert_eq!(retry.failure_count(), 1);
/// assert_eq!(retry, item);
/// ```
#[derive(Debug, Clone)]
pub struct WorkItem {
    test: TestCase,
    included: BTreeSet<DeviceId>,
    excluded: BTreeSet<DeviceId>,
    failure_count: u32,
    backends: Arc<BackendAssignments>,
}

impl WorkItem {
    pub fn new(test: TestCase) -> Self {
        Self {
            test,
            included: BTreeSet::new(),
            excluded: BTreeSet::new(),
            failure_count: 0,
            backends: Arc::new(BackendAssignments::new()),
        }
    }

    /// Restricts the item to these devices. An empty allow-list means all.
    pub fn with_included(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.included.extend(devices);
        self
    }

    pub fn with_excluded(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.excluded.extend(devices);
        self
    }

    /// Sets the device → backend registry. Done once, before scheduling.
    pub fn with_backends(mut self, backends: BackendAssignments) -> Self {
        self.backends = Arc::new(backends);
        self
    }

    pub fn test(&self) -> &TestCase {
        &self.test
    }

    pub fn included(&self) -> &BTreeSet<DeviceId> {
        &self.included
    }

    pub fn excluded(&self) -> &BTreeSet<DeviceId> {
        &self.excluded
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn backends(&self) -> &BackendAssignments {
        &self.backends
    }

    pub fn backends_for(&self, device: &DeviceId) -> &[String] {
        self.backends.get(device).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `device` may take this item right now.
    pub fn is_compatible_with(&self, device: &DeviceId) -> bool {
        !self.excluded.contains(device)
            && (self.included.is_empty() || self.included.contains(device))
    }

    /// The retry successor: failure count + 1, eligibility carried forward.
    pub fn successor(&self) -> Self {
        Self {
            test: self.test.clone(),
            included: self.included.clone(),
            excluded: self.excluded.clone(),
            failure_count: self.failure_count + 1,
            backends: Arc::clone(&self.backends),
        }
    }

    /// Like [`successor`](Self::successor), additionally excluding `device`.
    pub fn successor_excluding(&self, device: &DeviceId) -> Self {
        let mut next = self.successor();
        next.excluded.insert(device.clone());
        next
    }
}

impl PartialEq for WorkItem {
    fn eq(&self, other: &Self) -> bool {
        self.test == other.test
    }
}

impl Eq for WorkItem {}

impl Hash for WorkItem {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.test.hash(state);
    }
}
