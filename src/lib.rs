//! Peer-to-peer overlay of devices sharing named numeric resources, with
//! exclusive access coordinated by the Ricart-Agrawala mutual-exclusion
//! algorithm and membership bootstrapped through a rendezvous tracker.

use std::time::Duration;

pub mod device;
pub mod error;
pub mod message;
pub mod peer;
pub mod resources;
pub mod tracker;
pub mod wire;

pub use device::{Device, DeviceEvent};
pub use error::{Error, Result};
pub use message::Payload;
pub use peer::{DeviceId, PeerDirectory, RemoteDevice};
pub use resources::LockState;
pub use tracker::Tracker;

/// Fixed port the tracker listens on. Every other listener uses an
/// ephemeral port announced through the registration handshake.
pub const TRACKER_PORT: u16 = 12345;

/// Timeout applied to every socket operation (connect, read, write).
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Period of the tracker's liveness probe cycle.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);

/// Headers carrying this prefix expect a synchronous reply on the same
/// connection before it closes.
pub const SYNC_PREFIX: &str = "sync-";
