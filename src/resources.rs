//! Shared resource values and their per-resource lock state.

use std::collections::{HashMap, VecDeque};

use crate::error::{Error, Result};
use crate::peer::{DeviceId, RemoteDevice};

/// Lock state of a resource *as seen by one device*. RELEASED here says
/// nothing about other devices, which may well report WANTED or HELD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Released,
    Wanted,
    Held,
}

impl std::fmt::Display for LockState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockState::Released => write!(f, "RELEASED"),
            LockState::Wanted => write!(f, "WANTED"),
            LockState::Held => write!(f, "HELD"),
        }
    }
}

/// One vote record / queue entry: who asked, and the wall-clock millisecond
/// timestamp of their request. Clocks are device-local, not synchronized.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub requester: RemoteDevice,
    pub timestamp: u64,
}

/// Lock machinery for a single resource: the state, the queue of deferred
/// requesters, and the count of acks gathered while WANTED.
///
/// Invariant: while WANTED or HELD, the first queue entry is this device's
/// own claim (requester [`DeviceId::Local`]), kept only so the local
/// request's timestamp can be compared against incoming ones. It is not a
/// competing entry in the voting sense.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub state: LockState,
    pub queue: VecDeque<ResourceRequest>,
    pub acks: usize,
}

impl ResourceState {
    fn new() -> Self {
        Self {
            state: LockState::Released,
            queue: VecDeque::new(),
            acks: 0,
        }
    }

    /// Timestamp of this device's own pending claim, if any.
    pub fn local_timestamp(&self) -> Option<u64> {
        self.queue
            .iter()
            .find(|request| request.requester.id == DeviceId::Local)
            .map(|request| request.timestamp)
    }
}

/// Mapping from resource name to value, plus the lock state per resource.
/// The two are independent: the value may be read or written once created,
/// while the lock only governs exclusive update rights.
#[derive(Debug, Default)]
pub struct SharedResourceStore {
    values: HashMap<String, i64>,
    locks: HashMap<String, ResourceState>,
}

impl SharedResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resource with a RELEASED lock.
    pub fn create(&mut self, name: &str, value: i64) -> Result<()> {
        if self.values.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_owned()));
        }
        self.values.insert(name.to_owned(), value);
        self.locks.insert(name.to_owned(), ResourceState::new());
        Ok(())
    }

    /// Overwrites (or creates) the value, making sure a lock exists for it.
    pub fn set_value(&mut self, name: &str, value: i64) {
        self.values.insert(name.to_owned(), value);
        self.locks
            .entry(name.to_owned())
            .or_insert_with(ResourceState::new);
    }

    pub fn value(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn lock(&self, name: &str) -> Option<&ResourceState> {
        self.locks.get(name)
    }

    pub fn lock_mut(&mut self, name: &str) -> Option<&mut ResourceState> {
        self.locks.get_mut(name)
    }

    /// Every resource as `(name, value)`, for the ask-state reply.
    pub fn entries(&self) -> Vec<(String, i64)> {
        self.values
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect()
    }

    /// Every resource as `(name, value, lock state)`, for display.
    pub fn list(&self) -> Vec<(String, i64, LockState)> {
        self.values
            .iter()
            .map(|(name, value)| {
                let state = self
                    .locks
                    .get(name)
                    .map(|lock| lock.state)
                    .unwrap_or(LockState::Released);
                (name.clone(), *value, state)
            })
            .collect()
    }
}
