//! The peer node: owns the shared resource store and the Ricart-Agrawala
//! mutual-exclusion engine, runs the inbound listen loop, dispatches
//! messages by header, and exposes the operation set front ends consume.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::message::Payload;
use crate::peer::{DeviceId, PeerDirectory, RemoteDevice};
use crate::resources::{LockState, ResourceRequest, SharedResourceStore};
use crate::wire::{self, CallerCodec, Envelope, ListenerCodec, SyncReply};
use crate::IO_TIMEOUT;

/// Asynchronous notifications delivered to the front end. Each is sent only
/// after the causing state transition has been committed, over a channel,
/// so the receiver can never re-enter the engine's lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A previously requested lock reached HELD.
    LockGranted { name: String },
    /// A resource was created or overwritten by someone else.
    ResourceUpdated { name: String, value: i64 },
}

/// A peer node in the overlay. Cheap to clone; every clone shares the same
/// underlying state.
#[derive(Clone)]
pub struct Device {
    state: Arc<Mutex<DeviceState>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

/// Everything mutable on a device, behind one lock: message handling and
/// front-end operations on the same device serialize with each other.
struct DeviceState {
    /// Assigned by the tracker at join time; 0 until then.
    id: u32,
    listen_port: u16,
    /// Counter stamped on outbound envelopes, logging identity only.
    next_seq: i32,
    peers: PeerDirectory,
    resources: SharedResourceStore,
}

impl Device {
    /// Binds the inbound listener on an ephemeral port of `host` and spawns
    /// the accept loop. Returns the device plus the event stream.
    pub async fn bind(host: &str) -> Result<(Self, mpsc::UnboundedReceiver<DeviceEvent>)> {
        let listener = TcpListener::bind((host, 0)).await?;
        let listen_port = listener.local_addr()?.port();
        let (events, event_rx) = mpsc::unbounded_channel();

        let device = Device {
            state: Arc::new(Mutex::new(DeviceState {
                id: 0,
                listen_port,
                next_seq: 0,
                peers: PeerDirectory::new(),
                resources: SharedResourceStore::new(),
            })),
            events,
        };

        let accepting = device.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let device = accepting.clone();
                        tokio::spawn(async move {
                            if let Err(e) = device.handle_connection(stream, addr).await {
                                debug!(peer = %addr, error = %e, "dropped inbound connection");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });

        info!(port = listen_port, "device listening");
        Ok((device, event_rx))
    }

    /// Port the inbound listener is bound to.
    pub async fn local_port(&self) -> u16 {
        self.state.lock().await.listen_port
    }

    /// Id assigned by the tracker, 0 before [`join`](Device::join).
    pub async fn id(&self) -> u32 {
        self.state.lock().await.id
    }

    /// Registers with the tracker: announces the listening port, receives
    /// the assigned id and a snapshot of the current peer list.
    pub async fn join(&self, tracker_addr: &str) -> Result<(u32, Vec<RemoteDevice>)> {
        let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(tracker_addr)).await??;
        let listen_port = self.state.lock().await.listen_port;

        let (assigned, peers) = timeout(IO_TIMEOUT, async {
            stream.write_i32(i32::from(listen_port)).await?;

            let assigned = stream.read_i32().await?;
            let assigned = u32::try_from(assigned)
                .map_err(|_| Error::MalformedMessage(format!("bad assigned id: {assigned}")))?;

            let mut peers = Vec::new();
            while stream.read_u8().await? != 0 {
                let id = DeviceId::from_wire(stream.read_i32().await?)?;
                let address = wire::read_string(&mut stream).await?;
                let port = stream.read_i32().await?;
                let port = u16::try_from(port)
                    .map_err(|_| Error::MalformedMessage(format!("bad peer port: {port}")))?;
                peers.push(RemoteDevice::new(id, address, port));
            }
            Ok::<_, Error>((assigned, peers))
        })
        .await??;

        let mut state = self.state.lock().await;
        state.id = assigned;
        for peer in &peers {
            state.peers.add(peer.clone());
        }
        info!(id = assigned, peers = peers.len(), "joined the network");
        Ok((assigned, peers))
    }

    /// Announces presence to every known peer.
    pub async fn broadcast_hello(&self) {
        self.broadcast(&Payload::Hello).await;
    }

    /// Announces departure to every known peer.
    pub async fn broadcast_goodbye(&self) {
        self.broadcast(&Payload::Goodbye).await;
    }

    /// Creates a resource locally and announces it to every peer.
    pub async fn create_resource(&self, name: &str, value: i64) -> Result<()> {
        self.state.lock().await.resources.create(name, value)?;
        self.broadcast(&Payload::NewResource {
            name: name.to_owned(),
            value,
        })
        .await;
        Ok(())
    }

    /// Starts the lock procedure for a resource: state moves to WANTED and
    /// a timestamped request goes out to a snapshot of the directory. The
    /// grant arrives asynchronously as [`DeviceEvent::LockGranted`] once
    /// every current peer has acked. An unreachable peer counts as an
    /// implicit yes-vote rather than blocking the request forever.
    pub async fn lock_resource(&self, name: &str) -> Result<()> {
        let timestamp = now_millis();
        let snapshot = {
            let mut state = self.state.lock().await;
            let snapshot = state.peers.snapshot();
            let Some(lock) = state.resources.lock_mut(name) else {
                return Err(Error::NotFound(name.to_owned()));
            };
            match lock.state {
                LockState::Wanted | LockState::Held => {
                    return Err(Error::AlreadyRequested(name.to_owned()))
                }
                LockState::Released => {}
            }
            lock.state = LockState::Wanted;
            lock.acks = 0;
            // The local claim rides at the head of the queue so incoming
            // requests can be compared against its timestamp.
            lock.queue.push_front(ResourceRequest {
                requester: RemoteDevice::local(),
                timestamp,
            });
            if snapshot.is_empty() {
                // No one to ask.
                lock.state = LockState::Held;
                self.emit(DeviceEvent::LockGranted {
                    name: name.to_owned(),
                });
                return Ok(());
            }
            snapshot
        };

        let payload = Payload::LockResource {
            name: name.to_owned(),
            timestamp,
        };
        for peer in snapshot {
            if let Err(e) = self.send(&peer, &payload).await {
                warn!(peer = %peer.id, resource = %name, error = %e,
                    "peer unreachable, counting an implicit ack");
                self.record_ack(name).await;
            }
        }
        Ok(())
    }

    /// Releases a held lock and drains the deferred queue in FIFO order,
    /// acking each waiter. Every waiter is attempted even when an earlier
    /// one is unreachable; the first send failure is surfaced to the caller
    /// after the drain completes.
    pub async fn release_resource(&self, name: &str) -> Result<()> {
        let drained = {
            let mut state = self.state.lock().await;
            let Some(lock) = state.resources.lock_mut(name) else {
                return Err(Error::NotFound(name.to_owned()));
            };
            if lock.state != LockState::Held {
                return Err(Error::NotHeld(name.to_owned()));
            }
            lock.state = LockState::Released;
            lock.acks = 0;
            let sentinel = lock.queue.pop_front();
            debug_assert!(
                matches!(sentinel, Some(ref claim) if claim.requester.id == DeviceId::Local),
                "queue head while HELD must be the local claim"
            );
            lock.queue.drain(..).collect::<Vec<_>>()
        };

        let payload = Payload::LockAck {
            name: name.to_owned(),
        };
        let mut first_error = None;
        for request in drained {
            if let Err(e) = self.send(&request.requester, &payload).await {
                warn!(peer = %request.requester.id, resource = %name, error = %e,
                    "failed to ack a queued requester");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Overwrites the value of a resource this device currently holds the
    /// lock for, then announces the new value to every peer.
    pub async fn update_resource(&self, name: &str, value: i64) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            match state.resources.lock(name).map(|lock| lock.state) {
                None => return Err(Error::NotFound(name.to_owned())),
                Some(LockState::Held) => {}
                Some(_) => return Err(Error::NotHeld(name.to_owned())),
            }
            state.resources.set_value(name, value);
        }
        self.broadcast(&Payload::UpdateResource {
            name: name.to_owned(),
            value,
        })
        .await;
        Ok(())
    }

    /// Asks peers one at a time for their resource set, stopping at the
    /// first that answers, and merges it into the local store. A resource
    /// already known locally is never overwritten.
    pub async fn request_state_sync(&self) -> Result<()> {
        let snapshot = self.state.lock().await.peers.snapshot();
        if snapshot.is_empty() {
            return Ok(());
        }

        let mut last_error = Error::Timeout;
        for peer in snapshot {
            match self.call(&peer, &Payload::AskState).await {
                Ok(reply) => match Payload::decode(&reply.header, &reply.payload)? {
                    Payload::AskStateReply { entries } => {
                        self.merge_state(entries).await;
                        return Ok(());
                    }
                    other => {
                        return Err(Error::MalformedMessage(format!(
                            "unexpected reply header: {}",
                            other.header()
                        )))
                    }
                },
                Err(e) => {
                    warn!(peer = %peer.id, error = %e, "state sync attempt failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// A snapshot of the known peers.
    pub async fn list_peers(&self) -> Vec<RemoteDevice> {
        self.state.lock().await.peers.snapshot()
    }

    /// Every resource as `(name, value, lock state)`.
    pub async fn list_resources(&self) -> Vec<(String, i64, LockState)> {
        self.state.lock().await.resources.list()
    }

    pub async fn lookup_peer(&self, id: DeviceId) -> Option<RemoteDevice> {
        self.state.lock().await.peers.lookup(id).cloned()
    }

    /// Services one accepted connection: exactly one envelope in, and for a
    /// synchronous header exactly one reply out before closing.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let mut framed = Framed::new(stream, ListenerCodec);
        let envelope = match timeout(IO_TIMEOUT, framed.next()).await? {
            Some(frame) => frame?,
            // Closed without delivering a frame.
            None => return Ok(()),
        };

        let payload = Payload::decode(&envelope.header, &envelope.payload)?;
        let sender = self.resolve_sender(&envelope, addr).await?;
        debug!(
            peer = %sender.id, seq = envelope.seq,
            header = %envelope.header, payload = %envelope.payload,
            "received message"
        );

        if payload.is_synchronous() {
            let reply = self.handle_sync(payload).await;
            timeout(IO_TIMEOUT, framed.send(reply)).await??;
        } else {
            self.handle_message(sender, payload).await;
        }
        Ok(())
    }

    /// Maps an envelope's announced id to a known peer, registering unknown
    /// senders on first contact. The tracker is never added to the
    /// directory.
    async fn resolve_sender(&self, envelope: &Envelope, addr: SocketAddr) -> Result<RemoteDevice> {
        match DeviceId::from_wire(envelope.sender_id)? {
            DeviceId::Local => Err(Error::MalformedMessage(
                "local sentinel id on the wire".into(),
            )),
            DeviceId::Tracker => Ok(RemoteDevice::new(
                DeviceId::Tracker,
                addr.ip().to_string(),
                envelope.listen_port,
            )),
            id @ DeviceId::Peer(_) => {
                let mut state = self.state.lock().await;
                if let Some(peer) = state.peers.lookup(id) {
                    return Ok(peer.clone());
                }
                let peer = RemoteDevice::new(id, addr.ip().to_string(), envelope.listen_port);
                state.peers.add(peer.clone());
                Ok(peer)
            }
        }
    }

    /// Asynchronous message handlers, by kind.
    async fn handle_message(&self, sender: RemoteDevice, payload: Payload) {
        match payload {
            Payload::Hello => {
                self.state.lock().await.peers.add(sender);
            }
            Payload::Goodbye => {
                self.state.lock().await.peers.remove(sender.id);
            }
            Payload::NewResource { name, value } => {
                let mut state = self.state.lock().await;
                if !state.resources.contains(&name) {
                    state.resources.set_value(&name, value);
                }
            }
            Payload::LockResource { name, timestamp } => {
                self.handle_lock_request(sender, name, timestamp).await;
            }
            Payload::LockAck { name } => {
                self.record_ack(&name).await;
            }
            Payload::Ping { evicted } => {
                let mut state = self.state.lock().await;
                for id in evicted {
                    if state.peers.remove(DeviceId::Peer(id)).is_some() {
                        info!(peer = id, "removed evicted peer");
                    }
                }
            }
            Payload::AskStateReply { entries } => {
                self.merge_state(entries).await;
            }
            Payload::UpdateResource { name, value } => {
                let mut state = self.state.lock().await;
                state.resources.set_value(&name, value);
                self.emit(DeviceEvent::ResourceUpdated { name, value });
            }
            Payload::AskState => {
                warn!(peer = %sender.id, "synchronous header on the asynchronous path");
            }
        }
    }

    /// Synchronous handlers: produce the single reply for the connection.
    async fn handle_sync(&self, payload: Payload) -> SyncReply {
        let state = self.state.lock().await;
        let reply = match payload {
            Payload::AskState => Payload::AskStateReply {
                entries: state.resources.entries(),
            },
            other => {
                warn!(header = other.header(), "unhandled synchronous header");
                Payload::AskStateReply { entries: vec![] }
            }
        };
        SyncReply {
            replier_id: state.id as i32,
            header: reply.header().to_owned(),
            payload: reply.encode(),
        }
    }

    /// Ricart-Agrawala request handling: defer the requester while this
    /// device holds the lock or wants it with an earlier claim, otherwise
    /// ack immediately. Ties on the millisecond are broken by requester id,
    /// lower id winning the round.
    async fn handle_lock_request(&self, sender: RemoteDevice, name: String, timestamp: u64) {
        let ack_target = {
            let mut state = self.state.lock().await;
            let my_wire_id = state.id as i32;
            let Some(lock) = state.resources.lock_mut(&name) else {
                warn!(resource = %name, "lock request for unknown resource");
                return;
            };
            let defer = match lock.state {
                LockState::Held => true,
                LockState::Wanted => match lock.local_timestamp() {
                    Some(local_ts) => {
                        (local_ts, my_wire_id) < (timestamp, sender.id.to_wire())
                    }
                    None => false,
                },
                LockState::Released => false,
            };
            if defer {
                lock.queue.push_back(ResourceRequest {
                    requester: sender,
                    timestamp,
                });
                None
            } else {
                Some(sender)
            }
        };

        if let Some(peer) = ack_target {
            let ack = Payload::LockAck { name: name.clone() };
            if let Err(e) = self.send(&peer, &ack).await {
                warn!(peer = %peer.id, resource = %name, error = %e, "failed to send lock ack");
            }
        }
    }

    /// Counts one yes-vote for a WANTED resource; reaching the directory's
    /// current size transitions to HELD and notifies the front end.
    async fn record_ack(&self, name: &str) {
        let mut state = self.state.lock().await;
        let peer_count = state.peers.len();
        let Some(lock) = state.resources.lock_mut(name) else {
            warn!(resource = %name, "ack for unknown resource");
            return;
        };
        if lock.state != LockState::Wanted {
            return;
        }
        lock.acks += 1;
        if lock.acks >= peer_count {
            lock.state = LockState::Held;
            self.emit(DeviceEvent::LockGranted {
                name: name.to_owned(),
            });
        }
    }

    /// Merges a peer's resource set: first writer for a name wins at this
    /// node, so known resources are never overwritten.
    async fn merge_state(&self, entries: Vec<(String, i64)>) {
        let mut state = self.state.lock().await;
        for (name, value) in entries {
            if !state.resources.contains(&name) {
                state.resources.set_value(&name, value);
                self.emit(DeviceEvent::ResourceUpdated { name, value });
            }
        }
    }

    /// Sends one message to every peer in a directory snapshot, absorbing
    /// per-peer failures so one unreachable peer never blocks the rest.
    async fn broadcast(&self, payload: &Payload) {
        let snapshot = self.state.lock().await.peers.snapshot();
        for peer in snapshot {
            if let Err(e) = self.send(&peer, payload).await {
                warn!(peer = %peer.id, header = payload.header(), error = %e,
                    "broadcast send failed");
            }
        }
    }

    /// Sends one message on a fresh connection, no reply expected.
    async fn send(&self, peer: &RemoteDevice, payload: &Payload) -> Result<()> {
        let envelope = self.next_envelope(payload).await;
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(peer.socket_addr())).await??;
        let mut framed = Framed::new(stream, CallerCodec);
        timeout(IO_TIMEOUT, framed.send(envelope)).await??;
        Ok(())
    }

    /// Sends one synchronous message and blocks for its single reply.
    async fn call(&self, peer: &RemoteDevice, payload: &Payload) -> Result<SyncReply> {
        let envelope = self.next_envelope(payload).await;
        let stream = timeout(IO_TIMEOUT, TcpStream::connect(peer.socket_addr())).await??;
        let mut framed = Framed::new(stream, CallerCodec);
        timeout(IO_TIMEOUT, framed.send(envelope)).await??;
        match timeout(IO_TIMEOUT, framed.next()).await? {
            Some(reply) => reply,
            None => Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::UnexpectedEof,
            ))),
        }
    }

    async fn next_envelope(&self, payload: &Payload) -> Envelope {
        let mut state = self.state.lock().await;
        state.next_seq += 1;
        Envelope {
            sender_id: state.id as i32,
            listen_port: state.listen_port,
            seq: state.next_seq,
            header: payload.header().to_owned(),
            payload: payload.encode(),
        }
    }

    fn emit(&self, event: DeviceEvent) {
        // The front end may have dropped its receiver; that is its choice.
        let _ = self.events.send(event);
    }
}

/// Device-local wall-clock milliseconds, the request timestamp source.
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
