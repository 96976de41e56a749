//! The authoritative identity → instance map, the FIFO wait list and the
//! port set.
//!
//! Everything in here is plain data guarded by the orchestrator's single
//! state lock; no method awaits.

use crate::backend::{SandboxRef, TunnelRef};
use crate::instance::{
    Identity, InstanceId, InstanceState, InstanceStatus, InterfaceKind, QueueInfo,
};
use crate::ports::PortAllocator;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A request waiting for a provisioning slot.
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    pub identity: Identity,
    pub instance_id: InstanceId,
    pub profile: String,
    pub interface: InterfaceKind,
    pub enqueued_at: Instant,
}

/// Mutable record of a live instance.
pub(crate) struct InstanceRecord {
    pub id: InstanceId,
    pub identity: Identity,
    pub profile: String,
    pub interface: InterfaceKind,
    pub state: InstanceState,
    pub port: Option<u16>,
    pub sandbox: Option<SandboxRef>,
    pub tunnel: Option<TunnelRef>,
    pub public_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Last heartbeat or status poll; the idle deadline is derived from it.
    pub last_activity: Instant,
    /// Provisioning slot, held from promotion until ready or cleanup.
    pub slot: Option<OwnedSemaphorePermit>,
    /// Cancels the provisioning task and the idle timer.
    pub cancel: CancellationToken,
    /// Handle of the running provisioning task.
    pub provisioner: Option<JoinHandle<()>>,
    /// Set once cleanup has claimed the record.
    pub tearing_down: bool,
    /// A backend create is running on the record's port.
    pub create_in_flight: bool,
}

impl InstanceRecord {
    pub fn new(
        identity: Identity,
        profile: String,
        interface: InterfaceKind,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id: InstanceId::new(),
            identity,
            profile,
            interface,
            state: InstanceState::Queued,
            port: None,
            sandbox: None,
            tunnel: None,
            public_url: None,
            created_at: Utc::now(),
            last_error: None,
            last_activity: Instant::now(),
            slot: None,
            cancel,
            provisioner: None,
            tearing_down: false,
            create_in_flight: false,
        }
    }

    /// Whether the record is live and still represents `id`.
    pub fn is_current(&self, id: InstanceId) -> bool {
        self.id == id && !self.tearing_down
    }

    pub fn status(&self, queue: Option<QueueInfo>) -> InstanceStatus {
        InstanceStatus {
            instance_id: self.id,
            profile: self.profile.clone(),
            interface: self.interface,
            state: self.state,
            public_url: self.public_url.clone(),
            port: self.port,
            last_error: self.last_error.clone(),
            created_at: self.created_at,
            queue,
        }
    }
}

/// Outcome of a finished instance, kept so its owner can still read it.
#[derive(Debug, Clone)]
pub(crate) struct Tombstone {
    pub status: InstanceStatus,
    pub finished_at: Instant,
}

/// Registry, wait list and port set.
pub(crate) struct Registry {
    instances: HashMap<Identity, InstanceRecord>,
    queue: VecDeque<QueueEntry>,
    ports: PortAllocator,
    /// Ports of removed instances whose create has not returned yet.
    held: HashMap<InstanceId, u16>,
    tombstones: HashMap<Identity, Tombstone>,
}

impl Registry {
    pub fn new(base_port: u16) -> Self {
        Self {
            instances: HashMap::new(),
            queue: VecDeque::new(),
            ports: PortAllocator::new(base_port),
            held: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    /// Number of tracked instances, including ones still being torn down.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.instances.contains_key(identity)
    }

    pub fn get(&self, identity: &Identity) -> Option<&InstanceRecord> {
        self.instances.get(identity)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut InstanceRecord> {
        self.instances.get_mut(identity)
    }

    /// The live record of `identity`, if it is instance `id`.
    pub fn current_mut(&mut self, identity: &Identity, id: InstanceId) -> Option<&mut InstanceRecord> {
        self.instances
            .get_mut(identity)
            .filter(|record| record.is_current(id))
    }

    /// Track a new instance. Any tombstone of the identity is dropped.
    pub fn insert(&mut self, record: InstanceRecord) {
        self.tombstones.remove(&record.identity);
        self.instances.insert(record.identity.clone(), record);
    }

    /// Remove the record and release everything it holds in the registry:
    /// its port, its slot and its wait-list entry.
    ///
    /// While a create is in flight the port stays allocated until
    /// [`Registry::release_held`] is called for the instance.
    pub fn remove(&mut self, identity: &Identity) -> Option<InstanceRecord> {
        let mut record = self.instances.remove(identity)?;
        self.remove_queued(record.id);
        if let Some(port) = record.port.take() {
            if record.create_in_flight {
                self.held.insert(record.id, port);
            } else {
                self.ports.release(port);
            }
        }
        record.slot = None;
        record.sandbox = None;
        record.tunnel = None;
        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.instances.values()
    }

    // ------------------------------------------------------------------
    // Wait list
    // ------------------------------------------------------------------

    /// Append to the wait list and return the entry's position.
    pub fn enqueue(&mut self, entry: QueueEntry) -> usize {
        self.queue.push_back(entry);
        self.queue.len()
    }

    pub fn pop_queue(&mut self) -> Option<QueueEntry> {
        self.queue.pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Drop the wait-list entry of `id`. Returns whether one existed.
    pub fn remove_queued(&mut self, id: InstanceId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|entry| entry.instance_id != id);
        self.queue.len() != before
    }

    /// Current 1-based position of `id` and its wait estimate.
    pub fn queue_info(&self, id: InstanceId, seconds_per_slot: u64) -> Option<QueueInfo> {
        let index = self.queue.iter().position(|entry| entry.instance_id == id)?;
        let position = index + 1;
        Some(QueueInfo {
            position,
            estimated_wait_seconds: position as u64 * seconds_per_slot,
        })
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    pub fn allocate_port(&mut self) -> Option<u16> {
        self.ports.allocate()
    }

    #[cfg(test)]
    pub fn port_in_use(&self, port: u16) -> bool {
        self.ports.is_used(port)
    }

    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use()
    }

    /// Release the port held for a removed instance's create.
    pub fn release_held(&mut self, id: InstanceId) -> bool {
        match self.held.remove(&id) {
            Some(port) => {
                self.ports.release(port);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Tombstones
    // ------------------------------------------------------------------

    pub fn bury(&mut self, identity: Identity, status: InstanceStatus) {
        self.tombstones.insert(
            identity,
            Tombstone {
                status,
                finished_at: Instant::now(),
            },
        );
    }

    pub fn tombstone(&self, identity: &Identity) -> Option<&Tombstone> {
        self.tombstones.get(identity)
    }

    /// Forget tombstones older than `ttl`. Returns how many were dropped.
    pub fn prune_tombstones(&mut self, ttl: Duration) -> usize {
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, tombstone| tombstone.finished_at.elapsed() < ttl);
        before - self.tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(identity: &str) -> InstanceRecord {
        InstanceRecord::new(
            Identity::new(identity),
            "24v64g".into(),
            InterfaceKind::Desktop,
            CancellationToken::new(),
        )
    }

    fn entry(record: &InstanceRecord) -> QueueEntry {
        QueueEntry {
            identity: record.identity.clone(),
            instance_id: record.id,
            profile: record.profile.clone(),
            interface: record.interface,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut registry = Registry::new(6080);
        let rec = record("alice");
        let id = rec.id;
        registry.insert(rec);

        let alice = Identity::new("alice");
        assert_eq!(registry.len(), 1);
        assert!(registry.contains(&alice));
        assert!(registry.current_mut(&alice, id).is_some());
        assert!(registry.current_mut(&alice, InstanceId::new()).is_none());
    }

    #[test]
    fn test_current_skips_records_being_torn_down() {
        let mut registry = Registry::new(6080);
        let rec = record("alice");
        let id = rec.id;
        registry.insert(rec);

        let alice = Identity::new("alice");
        registry.get_mut(&alice).unwrap().tearing_down = true;
        assert!(registry.current_mut(&alice, id).is_none());
        assert!(registry.contains(&alice));
    }

    #[test]
    fn test_queue_positions_follow_enqueue_order() {
        let mut registry = Registry::new(6080);
        let a = record("a");
        let b = record("b");
        let c = record("c");
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);

        assert_eq!(registry.enqueue(entry(&a)), 1);
        assert_eq!(registry.enqueue(entry(&b)), 2);
        assert_eq!(registry.enqueue(entry(&c)), 3);

        assert_eq!(
            registry.queue_info(c_id, 60),
            Some(QueueInfo {
                position: 3,
                estimated_wait_seconds: 180
            })
        );

        assert_eq!(registry.pop_queue().unwrap().instance_id, a_id);
        assert_eq!(registry.queue_info(b_id, 60).unwrap().position, 1);
        assert_eq!(registry.queue_info(c_id, 60).unwrap().position, 2);

        assert!(registry.remove_queued(b_id));
        assert!(!registry.remove_queued(b_id));
        assert_eq!(registry.queue_info(c_id, 60).unwrap().position, 1);
        assert!(registry.queue_info(a_id, 60).is_none());
    }

    #[test]
    fn test_remove_releases_port_and_queue_entry() {
        let mut registry = Registry::new(6080);
        let mut rec = record("alice");
        let port = registry.allocate_port().unwrap();
        rec.port = Some(port);
        rec.sandbox = Some(SandboxRef::new("c1"));
        let queued = entry(&rec);
        registry.enqueue(queued);
        registry.insert(rec);

        let removed = registry.remove(&Identity::new("alice")).unwrap();
        assert!(removed.port.is_none());
        assert!(removed.sandbox.is_none());
        assert!(!registry.port_in_use(port));
        assert_eq!(registry.queue_len(), 0);
        assert_eq!(registry.len(), 0);
        assert!(registry.remove(&Identity::new("alice")).is_none());
    }

    #[test]
    fn test_remove_holds_port_of_inflight_create() {
        let mut registry = Registry::new(6080);
        let mut rec = record("alice");
        let id = rec.id;
        let port = registry.allocate_port().unwrap();
        rec.port = Some(port);
        rec.create_in_flight = true;
        registry.insert(rec);

        registry.remove(&Identity::new("alice")).unwrap();
        assert!(registry.port_in_use(port));
        assert_ne!(registry.allocate_port(), Some(port));

        assert!(registry.release_held(id));
        assert!(!registry.port_in_use(port));
        assert!(!registry.release_held(id));
    }

    #[test]
    fn test_insert_clears_tombstone() {
        let mut registry = Registry::new(6080);
        let rec = record("alice");
        let status = rec.status(None);
        registry.bury(Identity::new("alice"), status);
        assert!(registry.tombstone(&Identity::new("alice")).is_some());

        registry.insert(record("alice"));
        assert!(registry.tombstone(&Identity::new("alice")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_tombstones() {
        let mut registry = Registry::new(6080);
        let status = record("alice").status(None);
        registry.bury(Identity::new("alice"), status);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(registry.prune_tombstones(Duration::from_secs(60)), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(registry.prune_tombstones(Duration::from_secs(60)), 1);
        assert!(registry.tombstone(&Identity::new("alice")).is_none());
    }
}
