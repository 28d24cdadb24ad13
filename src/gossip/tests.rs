use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::*;
use crate::config::{Config, ExtensionConfig, RpsConfig, SelectionPolicy};
use crate::message::{Message, MessageType, PeerId};
use crate::peer::Peer;
use crate::transport::mem::{MemNetwork, MemSignalHub};

/// Seven descriptors aged 1 through 7.
fn seven_view() -> View {
    View::from_descriptors(
        [
            ("a", 1),
            ("b", 2),
            ("c", 3),
            ("d", 4),
            ("e", 5),
            ("f", 6),
            ("g", 7),
        ]
        .into_iter()
        .map(|(id, age)| Descriptor::with_age(id, age))
        .collect(),
    )
}

fn rps(view_size: usize, heal: usize, swap: usize) -> RpsConfig {
    RpsConfig {
        view_size,
        heal,
        swap,
        ..RpsConfig::default()
    }
}

#[test]
fn test_active_buffer_bounds_and_own_descriptor() {
    let view = seven_view();
    let own = Descriptor::new("self");
    let config = rps(10, 0, 0);

    let buffer = gen_buffer(
        ExchangeRole::Active,
        &PeerId::new("d"),
        &view,
        &own,
        &config,
    );

    // C/2 - 1 sampled descriptors plus this node's own entry.
    assert!(buffer.len() <= 5);
    assert!(!buffer.iter().any(|descriptor| descriptor.id == PeerId::new("d")));
    let own_entry = buffer
        .iter()
        .find(|descriptor| descriptor.id == PeerId::new("self"))
        .unwrap();
    assert_eq!(own_entry.age, 0);
}

#[test]
fn test_passive_buffer_excludes_partner_only() {
    let view = seven_view();
    let own = Descriptor::new("self");
    let config = rps(10, 0, 0);

    let buffer = gen_buffer(
        ExchangeRole::Passive,
        &PeerId::new("g"),
        &view,
        &own,
        &config,
    );

    assert_eq!(buffer.len(), 5);
    assert!(!buffer.iter().any(|descriptor| descriptor.id == PeerId::new("g")));
    assert!(!buffer.iter().any(|descriptor| descriptor.id == PeerId::new("self")));
}

#[test]
fn test_small_view_is_returned_whole() {
    let view = View::from_descriptors(vec![
        Descriptor::with_age("a", 1),
        Descriptor::with_age("b", 2),
    ]);
    let own = Descriptor::new("self");
    let config = rps(10, 0, 0);

    let buffer = gen_buffer(
        ExchangeRole::Passive,
        &PeerId::new("zz"),
        &view,
        &own,
        &config,
    );
    assert_eq!(buffer.len(), 2);
}

#[test]
fn test_healing_prefers_younger_descriptors() {
    let view = seven_view();
    let own = Descriptor::new("self");
    // With H = 2 the two oldest (f, g) form the tail and a target of 3
    // must come entirely from the younger head.
    let config = rps(6, 2, 0);

    for _ in 0..50 {
        let buffer = gen_buffer(
            ExchangeRole::Passive,
            &PeerId::new("zz"),
            &view,
            &own,
            &config,
        );
        assert_eq!(buffer.len(), 3);
        assert!(!buffer.iter().any(|descriptor| descriptor.age >= 6));
    }
}

#[test]
fn test_oldest_descriptor() {
    let view = seven_view();
    assert_eq!(view.oldest().unwrap().id, PeerId::new("g"));
}

#[test]
fn test_random_selection_covers_the_view() {
    let view = seven_view();
    let mut seen = HashSet::new();
    for _ in 0..1000 {
        if let Some(id) = select_remote(SelectionPolicy::Random, &view) {
            seen.insert(id);
        }
    }
    assert_eq!(seen.len(), 7);

    assert_eq!(
        select_remote(SelectionPolicy::Oldest, &view),
        Some(PeerId::new("g"))
    );
    assert_eq!(select_remote(SelectionPolicy::Random, &View::new()), None);
}

#[test]
fn test_merge_appends_unknown_and_heals_known() {
    let mut view = View::from_descriptors(vec![
        Descriptor::with_age("a", 5),
        Descriptor::with_age("b", 1),
    ]);
    let received = vec![
        Descriptor::with_age("a", 2),
        Descriptor::with_age("b", 4),
        Descriptor::with_age("c", 0),
    ];
    let config = rps(10, 0, 0);

    merge_view(&received, &[], &mut view, &PeerId::new("self"), &config);

    assert_eq!(view.len(), 3);
    // "a" healed to the younger copy, "b" kept its own younger entry.
    let age_of = |id: &str| {
        view.iter()
            .find(|descriptor| descriptor.id == PeerId::new(id))
            .unwrap()
            .age
    };
    assert_eq!(age_of("a"), 2);
    assert_eq!(age_of("b"), 1);
    assert_eq!(age_of("c"), 0);
}

#[test]
fn test_merge_never_admits_own_id() {
    let mut view = View::new();
    let received = vec![Descriptor::with_age("self", 0), Descriptor::with_age("x", 1)];
    merge_view(
        &received,
        &[],
        &mut view,
        &PeerId::new("self"),
        &rps(10, 0, 0),
    );

    assert_eq!(view.len(), 1);
    assert!(!view.contains(&PeerId::new("self")));
}

#[test]
fn test_merge_bounds_view_at_capacity() {
    let config = rps(4, 1, 1);
    for _ in 0..100 {
        let mut view = seven_view();
        let sent = vec![Descriptor::with_age("a", 1), Descriptor::with_age("b", 2)];
        let received: Vec<Descriptor> = (0..5)
            .map(|index| Descriptor::with_age(format!("n{}", index), index))
            .collect();

        merge_view(&received, &sent, &mut view, &PeerId::new("self"), &config);

        assert!(view.len() <= 4);
        let ids: HashSet<&PeerId> = view.iter().map(|descriptor| &descriptor.id).collect();
        assert_eq!(ids.len(), view.len());
    }
}

#[test]
fn test_merge_healing_drops_the_oldest() {
    // H large enough to cover the whole overflow: the survivors must be
    // exactly the youngest C descriptors.
    let mut view = seven_view();
    let config = rps(4, 10, 0);
    merge_view(&[], &[], &mut view, &PeerId::new("self"), &config);

    assert_eq!(view.len(), 4);
    assert!(view.iter().all(|descriptor| descriptor.age <= 4));
}

#[test]
fn test_aging_is_monotone() {
    let mut view = seven_view();
    view.age_all();
    let ages: Vec<u32> = view.iter().map(|descriptor| descriptor.age).collect();
    assert_eq!(ages, vec![2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn test_descriptor_paths_hold_media_availability() {
    let mut descriptor = Descriptor::new("a");
    let path = vec!["media".to_string(), "https://cdn.example/v.webm".to_string()];
    descriptor.set_path(&path, serde_json::json!([0, 3, 4]));

    let value = descriptor
        .get_path(&["media", "https://cdn.example/v.webm"])
        .unwrap();
    assert_eq!(value, &serde_json::json!([0, 3, 4]));

    // Round-trips through the wire representation, extras included.
    let encoded = serde_json::to_value(&descriptor).unwrap();
    let decoded: Descriptor = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, descriptor);
}

#[tokio::test(start_paused = true)]
async fn test_two_peers_exchange_views() {
    let net = MemNetwork::new();
    let hub = MemSignalHub::new();

    let gossip_only = || Config {
        extensions: vec![ExtensionConfig::Gossip(RpsConfig::default())],
        ..Config::default()
    };

    let spawn = |id: &str| {
        let builder = Peer::builder(id, Arc::new(net.transport(id))).config(gossip_only());
        let signal = hub.register(&PeerId::new(id), builder.link_events());
        let peer = builder.signal(signal).build();
        let handle = peer.handle();
        tokio::spawn(peer.run());
        handle
    };

    let a = spawn("a");
    let b = spawn("b");

    // Views published on a, as the media integrator would observe them.
    let updates = Arc::new(Mutex::new(Vec::<View>::new()));
    let sink = Arc::clone(&updates);
    a.bus().on(MessageType::GossipViewUpdate, move |message| {
        if let Ok(view) = message.typed_data::<View>() {
            sink.lock().push(view);
        }
    });

    // b joins the mesh and is seeded with a bootstrap view naming a.
    let request = Message::broadcast(MessageType::RequestPeer, b.id().clone(), 3);
    b.send(request);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let mut first_view = Message::new(MessageType::FirstView, PeerId::signal(), b.id().clone());
    first_view.data = serde_json::to_value(vec![Descriptor::new("a")]).ok();
    hub.deliver(b.id(), first_view.encode().unwrap());

    // One active gossip period later, b has initiated an exchange and a
    // has learned about b from the active buffer.
    tokio::time::sleep(Duration::from_millis(3000)).await;

    let updates = updates.lock();
    assert!(!updates.is_empty());
    let latest = updates.last().unwrap();
    assert!(latest.contains(&PeerId::new("b")));
    assert!(!latest.contains(&PeerId::new("a")));
}
