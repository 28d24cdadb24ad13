use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::*;
use crate::config::Config;
use crate::message::{Message, MessageType, PeerId};
use crate::transport::mem::{MemNetwork, MemSignalHub};
use crate::transport::{IceCandidate, LinkEvent};

fn no_extensions() -> Config {
    Config {
        extensions: Vec::new(),
        ..Config::default()
    }
}

/// Builds a peer on the shared fabric, registers it with the rendezvous,
/// and spawns its loop.
fn spawn_peer(net: &MemNetwork, hub: &MemSignalHub, id: &str) -> PeerHandle {
    let builder = Peer::builder(id, Arc::new(net.transport(id))).config(no_extensions());
    let signal = hub.register(&PeerId::new(id), builder.link_events());
    let peer = builder.signal(signal).build();
    let handle = peer.handle();
    tokio::spawn(peer.run());
    handle
}

/// Lets every queued message and task drain. Under the paused clock this
/// returns as soon as the system is quiescent.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Records every dispatch of one message type.
fn record(handle: &PeerHandle, kind: MessageType) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    handle.bus().on(kind, move |message| {
        sink.lock().push(message.clone());
    });
    seen
}

fn queue_message(from: &PeerHandle, to: &str) -> Message {
    Message::new(
        MessageType::Other("queuetest".to_string()),
        from.id().clone(),
        PeerId::new(to),
    )
}

/// Joins the mesh the way a fresh peer does: a broadcast peer request
/// through the rendezvous.
fn join(handle: &PeerHandle) {
    let request = Message::broadcast(MessageType::RequestPeer, handle.id().clone(), 3);
    handle.send(request);
}

#[tokio::test(start_paused = true)]
async fn test_two_peers_connect_through_signaling() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();

    let a = spawn_peer(&net, &hub, "a");
    let connected_on_a = record(&a, MessageType::Connected);
    let b = spawn_peer(&net, &hub, "b");

    join(&b);
    settle().await;

    let connected = connected_on_a.lock();
    assert_eq!(connected.len(), 1);
    assert_eq!(connected[0].from, PeerId::new("b"));
    drop(connected);

    let stats = a.stats().await.unwrap();
    assert_eq!(stats.open_connections, 1);
    let stats = b.stats().await.unwrap();
    assert_eq!(stats.open_connections, 1);
}

#[tokio::test(start_paused = true)]
async fn test_stale_request_from_smaller_id_is_discarded() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();

    let a = spawn_peer(&net, &hub, "a");
    let b = spawn_peer(&net, &hub, "b");

    // "a" joining is older than "b"; b must not answer the replay.
    join(&a);
    settle().await;

    assert_eq!(a.stats().await.unwrap().open_connections, 0);
    assert_eq!(b.stats().await.unwrap().open_connections, 0);
}

/// Builds the chain a - b - c with no a - c edge.
async fn chain_of_three(
    net: &MemNetwork,
    hub: &MemSignalHub,
) -> (PeerHandle, PeerHandle, PeerHandle) {
    let a = spawn_peer(net, hub, "a");
    let b = spawn_peer(net, hub, "b");
    let c = spawn_peer(net, hub, "c");

    // b requests a directly; c reaches b through a targeted request. The
    // rendezvous replay guard keeps c out of the first handshake.
    let mut request = Message::new(MessageType::RequestPeer, b.id().clone(), PeerId::new("a"));
    request.ttl = Some(3);
    b.send(request);
    settle().await;

    let mut request = Message::new(MessageType::RequestPeer, c.id().clone(), PeerId::new("b"));
    request.ttl = Some(3);
    c.send(request);
    settle().await;

    assert_eq!(a.stats().await.unwrap().open_connections, 1);
    assert_eq!(b.stats().await.unwrap().open_connections, 2);
    assert_eq!(c.stats().await.unwrap().open_connections, 1);
    (a, b, c)
}

#[tokio::test(start_paused = true)]
async fn test_three_peer_mesh_forwards_with_ttl_and_history() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();
    let (a, _b, c) = chain_of_three(&net, &hub).await;

    let observed = record(&c, MessageType::RequestPeer);

    let mut request = Message::new(MessageType::RequestPeer, a.id().clone(), c.id().clone());
    request.ttl = Some(3);
    a.send(request);
    settle().await;

    let observed = observed.lock();
    assert_eq!(observed.len(), 1);
    assert_eq!(observed[0].forward_by, vec![PeerId::new("b")]);
    assert_eq!(observed[0].ttl, Some(2));
}

#[tokio::test(start_paused = true)]
async fn test_simultaneous_open_resolves_to_one_connection() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();
    let (a, _b, c) = chain_of_three(&net, &hub).await;

    // Both ends of the chain request each other at once.
    let mut request = Message::new(MessageType::RequestPeer, a.id().clone(), c.id().clone());
    request.ttl = Some(3);
    a.send(request);
    let mut request = Message::new(MessageType::RequestPeer, c.id().clone(), a.id().clone());
    request.ttl = Some(3);
    c.send(request);
    settle().await;

    // One a-c connection, not two: each side holds b plus exactly one
    // link to the other.
    let stats = a.stats().await.unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.open_connections, 2);
    let stats = c.stats().await.unwrap();
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.open_connections, 2);
}

#[tokio::test(start_paused = true)]
async fn test_queued_until_connected() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();

    // A raw observer on the rendezvous, to watch what "a" broadcasts.
    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    hub.register(&PeerId::new("zz-observer"), observer_tx);

    let a = spawn_peer(&net, &hub, "a");
    let message = queue_message(&a, "b");
    a.send(message);
    settle().await;

    // Queued, and a peer request targeting "b" went out.
    assert_eq!(a.stats().await.unwrap().queued_messages, 1);
    let mut saw_request = false;
    while let Ok((_, event)) = observer_rx.try_recv() {
        if let LinkEvent::Message(frame) = event {
            let message = Message::decode(&frame).unwrap();
            if message.kind == MessageType::RequestPeer && message.to == PeerId::new("b") {
                saw_request = true;
            }
        }
    }
    assert!(saw_request);

    // "b" joins; the handshake completes and the queue drains into it.
    let b = spawn_peer(&net, &hub, "b");
    let delivered = record(&b, MessageType::Other("queuetest".to_string()));
    join(&b);
    settle().await;

    assert_eq!(a.stats().await.unwrap().queued_messages, 0);
    let delivered = delivered.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].from, a.id().clone());
}

#[tokio::test(start_paused = true)]
async fn test_queue_drains_in_enqueue_order() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();

    let a = spawn_peer(&net, &hub, "a");
    for sequence in 0..3 {
        let mut message = queue_message(&a, "b");
        message.number = Some(sequence.to_string());
        a.send(message);
    }
    settle().await;
    assert_eq!(a.stats().await.unwrap().queued_messages, 3);

    let b = spawn_peer(&net, &hub, "b");
    let delivered = record(&b, MessageType::Other("queuetest".to_string()));
    join(&b);
    settle().await;

    let numbers: Vec<String> = delivered
        .lock()
        .iter()
        .map(|message| message.number.clone().unwrap())
        .collect();
    assert_eq!(numbers, vec!["0", "1", "2"]);
}

#[tokio::test(start_paused = true)]
async fn test_retry_timeout_fires_callback_once() {
    let net = MemNetwork::new();
    // No signaling link and no peers: the message can only wait.
    let peer = Peer::builder("a", Arc::new(net.transport("a")))
        .config(no_extensions())
        .build();
    let handle = peer.handle();
    tokio::spawn(peer.run());
    settle().await;

    let message = queue_message(&handle, "b");
    let outcome = handle.send_with_timeout(message, Duration::from_millis(1500));

    // After the first tick (t = 1000) the entry is still parked.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(handle.stats().await.unwrap().queued_messages, 1);

    // The second tick (t = 2000) is past the 1500 ms deadline.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(handle.stats().await.unwrap().queued_messages, 0);
    assert_eq!(outcome.await.unwrap(), DeliveryStatus::TimedOut);
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_fallback_zeroes_ttl_for_signaling() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();

    let (observer_tx, mut observer_rx) = mpsc::unbounded_channel();
    hub.register(&PeerId::new("zz-observer"), observer_tx);

    let a = spawn_peer(&net, &hub, "a");
    let mut request = Message::new(MessageType::RequestPeer, a.id().clone(), PeerId::new("b"));
    request.ttl = Some(3);
    a.send(request);
    settle().await;

    let mut ttls = Vec::new();
    while let Ok((_, event)) = observer_rx.try_recv() {
        if let LinkEvent::Message(frame) = event {
            let message = Message::decode(&frame).unwrap();
            if message.kind == MessageType::RequestPeer {
                ttls.push(message.ttl);
            }
        }
    }
    assert_eq!(ttls, vec![Some(0)]);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_exhausted_messages_are_dropped() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();
    let (a, b, c) = chain_of_three(&net, &hub).await;

    let _ = b;
    let observed = record(&c, MessageType::RequestPeer);

    // A targeted forwardable with no hop budget left dies at the first
    // relay instead of reaching c.
    let mut request = Message::new(MessageType::RequestPeer, a.id().clone(), c.id().clone());
    request.ttl = Some(0);
    a.send(request);
    settle().await;

    assert!(observed.lock().is_empty());
}

#[test]
fn test_ice_candidates_buffer_until_remote_description() {
    let mut links = Links::new();
    let remote = PeerId::new("r");

    links.buffer_candidate(&remote, IceCandidate { blob: "one".to_string() });
    links.buffer_candidate(&remote, IceCandidate { blob: "two".to_string() });
    assert_eq!(links.buffered_candidate_count(&remote), 2);

    let drained = links.drain_candidates(&remote);
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].blob, "one");
    assert_eq!(links.buffered_candidate_count(&remote), 0);
    assert!(links.drain_candidates(&remote).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_event_on_peer_shutdown() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();

    let a = spawn_peer(&net, &hub, "a");
    let disconnects = record(&a, MessageType::Disconnected);
    let b = spawn_peer(&net, &hub, "b");
    join(&b);
    settle().await;
    assert_eq!(a.stats().await.unwrap().open_connections, 1);

    b.shutdown();
    settle().await;

    assert_eq!(a.stats().await.unwrap().open_connections, 0);
    let disconnects = disconnects.lock();
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0].from, PeerId::new("b"));
}
