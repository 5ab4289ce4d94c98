//! Peer identity and the directory of known remote devices.

use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{Error, Result};

/// Tagged identity of a device, replacing the raw integers the wire uses.
///
/// `Local` only ever appears as the sentinel queue entry marking this
/// device's own pending lock claim; `Tracker` is the rendezvous process,
/// which never participates in the resource protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceId {
    Local,
    Tracker,
    Peer(u32),
}

impl DeviceId {
    pub fn to_wire(self) -> i32 {
        match self {
            DeviceId::Local => -1,
            DeviceId::Tracker => -2,
            DeviceId::Peer(id) => id as i32,
        }
    }

    pub fn from_wire(raw: i32) -> Result<Self> {
        match raw {
            -1 => Ok(DeviceId::Local),
            -2 => Ok(DeviceId::Tracker),
            id if id >= 0 => Ok(DeviceId::Peer(id as u32)),
            id => Err(Error::MalformedMessage(format!("bad sender id: {id}"))),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Local => write!(f, "local"),
            DeviceId::Tracker => write!(f, "tracker"),
            DeviceId::Peer(id) => write!(f, "{id}"),
        }
    }
}

/// Identity of a remote peer: id plus the address/port its listener is
/// reachable on. Equality and hashing are by id only.
#[derive(Debug, Clone)]
pub struct RemoteDevice {
    pub id: DeviceId,
    pub address: String,
    pub port: u16,
}

impl RemoteDevice {
    pub fn new(id: DeviceId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
        }
    }

    /// The sentinel placeholder for this device's own queue entry.
    pub fn local() -> Self {
        Self::new(DeviceId::Local, "", 0)
    }

    /// `host:port` form usable by a connector.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl PartialEq for RemoteDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RemoteDevice {}

impl Hash for RemoteDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Ordered collection of known peers, unique by id. Insertion order is
/// preserved for display only; the algorithm never depends on it.
///
/// Every broadcast iterates a [`snapshot`](PeerDirectory::snapshot) taken
/// up front, never the live structure, so a concurrent join or leave can
/// neither corrupt the iteration nor hand a new joiner a partial broadcast.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    peers: Vec<RemoteDevice>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer; a no-op if the id is already present.
    pub fn add(&mut self, peer: RemoteDevice) -> bool {
        if self.lookup(peer.id).is_some() {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn remove(&mut self, id: DeviceId) -> Option<RemoteDevice> {
        let index = self.peers.iter().position(|peer| peer.id == id)?;
        Some(self.peers.remove(index))
    }

    pub fn lookup(&self, id: DeviceId) -> Option<&RemoteDevice> {
        self.peers.iter().find(|peer| peer.id == id)
    }

    /// An independent copy, safe to iterate while the directory mutates.
    pub fn snapshot(&self) -> Vec<RemoteDevice> {
        self.peers.clone()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
