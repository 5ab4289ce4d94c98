//! The rendezvous tracker: hands out ids, seeds each newcomer with the
//! current peer list, and probes peers for liveness. It never takes part
//! in the resource lock protocol.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::message::Payload;
use crate::peer::{DeviceId, PeerDirectory, RemoteDevice};
use crate::wire::{self, CallerCodec, Envelope};
use crate::{IO_TIMEOUT, KEEPALIVE_PERIOD};

/// The tracker process. Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct Tracker {
    state: Arc<Mutex<TrackerState>>,
    port: u16,
}

struct TrackerState {
    /// Ids are sequential from 1 and never reused within a run.
    next_id: u32,
    next_seq: i32,
    peers: PeerDirectory,
    /// Ids evicted since the last fully delivered probe round.
    pending_evictions: Vec<u32>,
}

impl Tracker {
    /// Binds the registration listener and spawns the accept loop plus the
    /// periodic keepalive loop.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();
        let tracker = Tracker {
            state: Arc::new(Mutex::new(TrackerState {
                next_id: 0,
                next_seq: 0,
                peers: PeerDirectory::new(),
                pending_evictions: Vec::new(),
            })),
            port,
        };

        let accepting = tracker.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let tracker = accepting.clone();
                        tokio::spawn(async move {
                            if let Err(e) = tracker.register(stream, addr).await {
                                warn!(peer = %addr, error = %e, "registration failed");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        });

        let probing = tracker.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
            // The first tick of an interval fires immediately; swallow it
            // so each round follows a full period, like a sleep-then-probe.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                probing.probe_peers().await;
            }
        });

        info!(port, "tracker listening");
        Ok(tracker)
    }

    /// Port the registration listener is bound to.
    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// A snapshot of the registered peers.
    pub async fn peers(&self) -> Vec<RemoteDevice> {
        self.state.lock().await.peers.snapshot()
    }

    /// The registration handshake: read the client's announced listening
    /// port, assign the next id, stream the directory snapshot, then append
    /// the newcomer, so a client never sees itself in its own initial list.
    async fn register(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        timeout(IO_TIMEOUT, async {
            let announced = stream.read_i32().await?;
            let announced = u16::try_from(announced)
                .map_err(|_| Error::MalformedMessage(format!("bad listen port: {announced}")))?;

            let (id, snapshot) = {
                let mut state = self.state.lock().await;
                state.next_id += 1;
                (state.next_id, state.peers.snapshot())
            };

            stream.write_i32(id as i32).await?;
            for peer in &snapshot {
                stream.write_u8(1).await?;
                stream.write_i32(peer.id.to_wire()).await?;
                wire::write_string(&mut stream, &peer.address).await?;
                stream.write_i32(i32::from(peer.port)).await?;
            }
            stream.write_u8(0).await?;
            stream.flush().await?;

            let client = RemoteDevice::new(DeviceId::Peer(id), addr.ip().to_string(), announced);
            self.state.lock().await.peers.add(client);
            info!(id, peer = %addr, "registered peer");
            Ok(())
        })
        .await?
    }

    /// One liveness round: probe every peer in a directory snapshot,
    /// carrying the ids evicted since the last fully delivered batch. A
    /// peer that fails its probe is removed and seeds the next batch.
    pub async fn probe_peers(&self) {
        let (snapshot, batch) = {
            let mut state = self.state.lock().await;
            let batch = std::mem::take(&mut state.pending_evictions);
            (state.peers.snapshot(), batch)
        };

        let mut newly_evicted = Vec::new();
        for peer in snapshot {
            if let Err(e) = self.ping(&peer, &batch).await {
                info!(peer = %peer.id, error = %e, "peer is no longer responding");
                self.state.lock().await.peers.remove(peer.id);
                if let DeviceId::Peer(id) = peer.id {
                    newly_evicted.push(id);
                }
            }
        }

        if !newly_evicted.is_empty() {
            self.state.lock().await.pending_evictions = newly_evicted;
        }
    }

    /// Probes one peer under the tracker's reserved identity.
    async fn ping(&self, peer: &RemoteDevice, evicted: &[u32]) -> Result<()> {
        let payload = Payload::Ping {
            evicted: evicted.to_vec(),
        };
        let seq = {
            let mut state = self.state.lock().await;
            state.next_seq += 1;
            state.next_seq
        };
        let envelope = Envelope {
            sender_id: DeviceId::Tracker.to_wire(),
            listen_port: self.port,
            seq,
            header: payload.header().to_owned(),
            payload: payload.encode(),
        };

        let stream = timeout(IO_TIMEOUT, TcpStream::connect(peer.socket_addr())).await??;
        let mut framed = Framed::new(stream, CallerCodec);
        timeout(IO_TIMEOUT, framed.send(envelope)).await??;
        Ok(())
    }
}
