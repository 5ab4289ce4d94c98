//! End-to-end scenarios over loopback: a tracker plus real devices talking
//! TCP, exercising join, hello, resource replication, the distributed lock
//! cycle, state sync, and liveness eviction.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use peerlock::{Device, DeviceEvent, DeviceId, LockState, Tracker};

/// Initialize tracing for tests. Uses RUST_LOG for filtering.
fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peerlock=debug")),
        )
        .with_test_writer()
        .finish();
    tracing::dispatcher::set_default(&Dispatch::new(subscriber))
}

async fn expect_event(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

async fn resource_on(device: &Device, name: &str) -> Option<(i64, LockState)> {
    device
        .list_resources()
        .await
        .into_iter()
        .find(|(n, _, _)| n == name)
        .map(|(_, value, state)| (value, state))
}

async fn wait_for_resource(device: &Device, name: &str, value: i64) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if resource_on(device, name).await.map(|(v, _)| v) == Some(value) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {name}={value}"
        );
        sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_peer(device: &Device, id: u32) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if device.lookup_peer(DeviceId::Peer(id)).await.is_some() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for peer {id}");
        sleep(Duration::from_millis(25)).await;
    }
}

/// Runs the registration handshake announcing a port nothing listens on,
/// then walks the streamed peer list. Returns the assigned id.
async fn register_dead_port(tracker_addr: &str, dead_port: u16) -> i32 {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(tracker_addr).await.unwrap();
    stream.write_i32(i32::from(dead_port)).await.unwrap();
    let id = stream.read_i32().await.unwrap();
    while stream.read_u8().await.unwrap() != 0 {
        let _ = stream.read_i32().await.unwrap();
        let len = stream.read_u32().await.unwrap() as usize;
        let mut skip = vec![0u8; len];
        stream.read_exact(&mut skip).await.unwrap();
        let _ = stream.read_i32().await.unwrap();
    }
    id
}

struct Pair {
    a: Device,
    a_events: mpsc::UnboundedReceiver<DeviceEvent>,
    b: Device,
    b_events: mpsc::UnboundedReceiver<DeviceEvent>,
}

/// A tracker with two joined devices that have exchanged hellos.
async fn two_device_network() -> (Tracker, Pair) {
    let tracker = Tracker::bind("127.0.0.1:0").await.unwrap();
    let tracker_addr = format!("127.0.0.1:{}", tracker.local_port());

    let (a, a_events) = Device::bind("127.0.0.1").await.unwrap();
    let (a_id, a_list) = a.join(&tracker_addr).await.unwrap();
    assert_eq!(a_id, 1);
    assert!(a_list.is_empty());
    a.broadcast_hello().await;

    let (b, b_events) = Device::bind("127.0.0.1").await.unwrap();
    let (b_id, b_list) = b.join(&tracker_addr).await.unwrap();
    assert_eq!(b_id, 2);
    assert_eq!(b_list.len(), 1);
    assert_eq!(b_list[0].id, DeviceId::Peer(1));
    b.broadcast_hello().await;

    wait_for_peer(&a, 2).await;
    wait_for_peer(&b, 1).await;

    (
        tracker,
        Pair {
            a,
            a_events,
            b,
            b_events,
        },
    )
}

#[tokio::test]
async fn end_to_end_lock_cycle() {
    let _guard = init_tracing();
    let (_tracker, mut pair) = two_device_network().await;

    // A creates a resource and the notice reaches B.
    pair.a.create_resource("gold", 10).await.unwrap();
    wait_for_resource(&pair.b, "gold", 10).await;
    assert_eq!(
        resource_on(&pair.b, "gold").await,
        Some((10, LockState::Released))
    );

    // With B released, A's request is acked immediately and the lock is
    // granted.
    pair.a.lock_resource("gold").await.unwrap();
    assert_eq!(
        expect_event(&mut pair.a_events).await,
        DeviceEvent::LockGranted {
            name: "gold".into()
        }
    );
    assert_eq!(
        resource_on(&pair.a, "gold").await,
        Some((10, LockState::Held))
    );

    // Release with no queued requesters: state returns to RELEASED.
    pair.a.release_resource("gold").await.unwrap();
    assert_eq!(
        resource_on(&pair.a, "gold").await,
        Some((10, LockState::Released))
    );
}

#[tokio::test]
async fn contending_request_is_deferred_until_release() {
    let _guard = init_tracing();
    let (_tracker, mut pair) = two_device_network().await;

    pair.a.create_resource("gold", 10).await.unwrap();
    wait_for_resource(&pair.b, "gold", 10).await;

    pair.a.lock_resource("gold").await.unwrap();
    expect_event(&mut pair.a_events).await;

    // B's request reaches A while A holds the lock, so B is queued.
    pair.b.lock_resource("gold").await.unwrap();
    sleep(Duration::from_millis(300)).await;
    assert_eq!(
        resource_on(&pair.b, "gold").await,
        Some((10, LockState::Wanted))
    );
    assert!(pair.b_events.try_recv().is_err());

    // Releasing drains the queue and B's own cycle reaches HELD.
    pair.a.release_resource("gold").await.unwrap();
    assert_eq!(
        expect_event(&mut pair.b_events).await,
        DeviceEvent::LockGranted {
            name: "gold".into()
        }
    );
    assert_eq!(
        resource_on(&pair.b, "gold").await,
        Some((10, LockState::Held))
    );

    pair.b.release_resource("gold").await.unwrap();
    assert_eq!(
        resource_on(&pair.b, "gold").await,
        Some((10, LockState::Released))
    );
}

#[tokio::test]
async fn held_update_propagates_to_peers() {
    let _guard = init_tracing();
    let (_tracker, mut pair) = two_device_network().await;

    pair.a.create_resource("gold", 10).await.unwrap();
    wait_for_resource(&pair.b, "gold", 10).await;

    pair.a.lock_resource("gold").await.unwrap();
    expect_event(&mut pair.a_events).await;

    pair.a.update_resource("gold", 42).await.unwrap();
    assert_eq!(
        expect_event(&mut pair.b_events).await,
        DeviceEvent::ResourceUpdated {
            name: "gold".into(),
            value: 42
        }
    );
    assert_eq!(resource_on(&pair.b, "gold").await.map(|(v, _)| v), Some(42));
}

#[tokio::test]
async fn late_joiner_pulls_state_from_the_first_responder() {
    let _guard = init_tracing();
    let tracker = Tracker::bind("127.0.0.1:0").await.unwrap();
    let tracker_addr = format!("127.0.0.1:{}", tracker.local_port());

    let (a, _a_events) = Device::bind("127.0.0.1").await.unwrap();
    a.join(&tracker_addr).await.unwrap();
    a.create_resource("gold", 10).await.unwrap();
    a.create_resource("silver", 4).await.unwrap();

    let (b, mut b_events) = Device::bind("127.0.0.1").await.unwrap();
    b.join(&tracker_addr).await.unwrap();
    b.broadcast_hello().await;
    b.request_state_sync().await.unwrap();

    let mut merged = vec![
        expect_event(&mut b_events).await,
        expect_event(&mut b_events).await,
    ];
    merged.sort_by_key(|event| match event {
        DeviceEvent::ResourceUpdated { name, .. } => name.clone(),
        DeviceEvent::LockGranted { name } => name.clone(),
    });
    assert_eq!(
        merged,
        vec![
            DeviceEvent::ResourceUpdated {
                name: "gold".into(),
                value: 10
            },
            DeviceEvent::ResourceUpdated {
                name: "silver".into(),
                value: 4
            },
        ]
    );

    let mut resources = b.list_resources().await;
    resources.sort_by(|left, right| left.0.cmp(&right.0));
    assert_eq!(
        resources,
        vec![
            ("gold".into(), 10, LockState::Released),
            ("silver".into(), 4, LockState::Released),
        ]
    );
}

#[tokio::test]
async fn goodbye_shrinks_the_quorum() {
    let _guard = init_tracing();
    let (_tracker, mut pair) = two_device_network().await;

    pair.a.create_resource("gold", 10).await.unwrap();
    pair.b.broadcast_goodbye().await;

    let deadline = Instant::now() + Duration::from_secs(5);
    while pair.a.lookup_peer(DeviceId::Peer(2)).await.is_some() {
        assert!(Instant::now() < deadline, "goodbye never reached A");
        sleep(Duration::from_millis(25)).await;
    }

    // With the directory empty again, the grant is immediate.
    pair.a.lock_resource("gold").await.unwrap();
    assert_eq!(
        expect_event(&mut pair.a_events).await,
        DeviceEvent::LockGranted {
            name: "gold".into()
        }
    );
}

#[tokio::test]
async fn eviction_reaches_the_surviving_peers() {
    let _guard = init_tracing();
    let tracker = Tracker::bind("127.0.0.1:0").await.unwrap();
    let tracker_addr = format!("127.0.0.1:{}", tracker.local_port());

    // A ghost registers on a port nothing listens on, then a live device
    // joins and learns about it from its initial peer list.
    let ghost_listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .unwrap();
    let ghost_port = ghost_listener.local_addr().unwrap().port();
    drop(ghost_listener);

    let ghost_id = register_dead_port(&tracker_addr, ghost_port).await;
    assert_eq!(ghost_id, 1);

    let (survivor, _events) = Device::bind("127.0.0.1").await.unwrap();
    let (survivor_id, initial) = survivor.join(&tracker_addr).await.unwrap();
    assert_eq!(survivor_id, 2);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].id, DeviceId::Peer(1));

    // First round: the ghost fails its probe and is evicted.
    tracker.probe_peers().await;
    let remaining = tracker.peers().await;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, DeviceId::Peer(2));

    // Second round: the eviction batch rides the ping to the survivor,
    // which drops the ghost from its own directory.
    tracker.probe_peers().await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while survivor.lookup_peer(DeviceId::Peer(1)).await.is_some() {
        assert!(Instant::now() < deadline, "eviction never reached survivor");
        sleep(Duration::from_millis(25)).await;
    }
}
