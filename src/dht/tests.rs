use super::message::new_message_id;
use super::*;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::sleep;

use crate::constants::{BUCKET_SIZE, NODE_ID_BITS, NODE_ID_LENGTH};

// === Bitmap ===

#[test]
fn test_bitmap_random_distinct() {
    assert_ne!(Bitmap::random(), Bitmap::random());
}

#[test]
fn test_bitmap_from_bytes() {
    let bytes = [7u8; NODE_ID_LENGTH];
    let id = Bitmap::from_bytes(&bytes).unwrap();
    assert_eq!(id.as_bytes(), &bytes);

    assert!(Bitmap::from_bytes(&[7u8; 20]).is_err());
    assert!(Bitmap::from_bytes(&[]).is_err());
}

#[test]
fn test_bitmap_hex_roundtrip() {
    let id = Bitmap::random();
    let hex = id.to_hex();
    assert_eq!(hex.len(), 96);
    assert_eq!(Bitmap::from_hex(&hex).unwrap(), id);

    assert!(Bitmap::from_hex("abcd").is_err());
    assert!(Bitmap::from_hex(&"zz".repeat(48)).is_err());
}

#[test]
fn test_bitmap_distance_laws() {
    let a = Bitmap::random();
    let b = Bitmap::random();

    assert_eq!(a.distance(&a), Bitmap::from([0u8; NODE_ID_LENGTH]));
    assert_eq!(a.distance(&b), b.distance(&a));
    assert_eq!(a.prefix_len(&a), NODE_ID_BITS);
}

#[test]
fn test_bitmap_prefix_len() {
    let zero = Bitmap::from([0u8; NODE_ID_LENGTH]);

    let mut top = [0u8; NODE_ID_LENGTH];
    top[0] = 0x80;
    assert_eq!(zero.prefix_len(&Bitmap::from(top)), 0);

    let mut low = [0u8; NODE_ID_LENGTH];
    low[NODE_ID_LENGTH - 1] = 0x01;
    assert_eq!(zero.prefix_len(&Bitmap::from(low)), NODE_ID_BITS - 1);

    let mut mid = [0u8; NODE_ID_LENGTH];
    mid[1] = 0x10;
    assert_eq!(zero.prefix_len(&Bitmap::from(mid)), 11);
}

#[test]
fn test_bitmap_ordering_is_big_endian() {
    let mut high = [0u8; NODE_ID_LENGTH];
    high[0] = 1;
    let mut low = [0u8; NODE_ID_LENGTH];
    low[NODE_ID_LENGTH - 1] = 0xff;

    assert!(Bitmap::from(low) < Bitmap::from(high));
}

#[test]
fn test_bitmap_prefix_suffix() {
    let id = Bitmap::from([0u8; NODE_ID_LENGTH]);

    let prefixed = id.prefix(12, true);
    assert_eq!(prefixed.as_bytes()[0], 0xff);
    assert_eq!(prefixed.as_bytes()[1], 0xf0);
    assert_eq!(prefixed.as_bytes()[2], 0x00);

    let all = Bitmap::from([0xffu8; NODE_ID_LENGTH]);
    let suffixed = all.suffix(12, false);
    assert_eq!(suffixed.as_bytes()[NODE_ID_LENGTH - 1], 0x00);
    assert_eq!(suffixed.as_bytes()[NODE_ID_LENGTH - 2], 0xf0);
    assert_eq!(suffixed.as_bytes()[NODE_ID_LENGTH - 3], 0xff);
}

#[test]
fn test_bitmap_closer_to() {
    let target = Bitmap::from([0u8; NODE_ID_LENGTH]);
    let mut near = [0u8; NODE_ID_LENGTH];
    near[NODE_ID_LENGTH - 1] = 1;
    let mut far = [0u8; NODE_ID_LENGTH];
    far[0] = 1;

    let near = Bitmap::from(near);
    let far = Bitmap::from(far);
    assert!(near.closer_to(&far, &target));
    assert!(!far.closer_to(&near, &target));
}

// === Contact ===

fn contact(id: Bitmap, port: u16) -> Contact {
    Contact::new(id, Ipv4Addr::LOCALHOST, port)
}

#[test]
fn test_contact_compact_roundtrip() {
    let c = Contact::new(Bitmap::random(), Ipv4Addr::new(10, 1, 2, 3), 4444);

    let compact = c.to_compact();
    assert_eq!(compact.len(), 54);

    let parsed = Contact::from_compact(&compact).unwrap();
    assert_eq!(parsed, c);
}

#[test]
fn test_contact_compact_rejects_bad_length() {
    assert!(Contact::from_compact(&[0u8; 26]).is_err());
    assert!(Contact::from_compact(&[0u8; 55]).is_err());
    assert!(Contact::from_compact(&[]).is_err());
}

// === Messages ===

#[test]
fn test_message_id_random() {
    assert_ne!(new_message_id(), new_message_id());
}

fn roundtrip(message: Message) {
    let encoded = message.encode();
    assert_eq!(Message::parse(&encoded).unwrap(), message);
}

#[test]
fn test_message_roundtrip_requests() {
    let node_id = Bitmap::random();

    roundtrip(Message::Request {
        message_id: new_message_id(),
        node_id,
        request: Request::Ping,
    });
    roundtrip(Message::Request {
        message_id: new_message_id(),
        node_id,
        request: Request::FindNode {
            target: Bitmap::random(),
        },
    });
    roundtrip(Message::Request {
        message_id: new_message_id(),
        node_id,
        request: Request::FindValue {
            blob_hash: Bitmap::random(),
        },
    });
    roundtrip(Message::Request {
        message_id: new_message_id(),
        node_id,
        request: Request::Store {
            blob_hash: Bitmap::random(),
            token: Bytes::from_static(b"some token"),
            port: 3333,
            node_id: Bitmap::random(),
            self_store: true,
        },
    });
    roundtrip(Message::Request {
        message_id: new_message_id(),
        node_id,
        request: Request::Store {
            blob_hash: Bitmap::random(),
            token: Bytes::from_static(b"some token"),
            port: 3333,
            node_id: Bitmap::random(),
            self_store: false,
        },
    });
}

#[test]
fn test_message_roundtrip_responses() {
    let node_id = Bitmap::random();
    let contacts = vec![
        contact(Bitmap::random(), 1000),
        contact(Bitmap::random(), 2000),
    ];

    roundtrip(Message::Response {
        message_id: new_message_id(),
        node_id,
        payload: ResponsePayload::Pong,
    });
    roundtrip(Message::Response {
        message_id: new_message_id(),
        node_id,
        payload: ResponsePayload::StoreOk,
    });
    roundtrip(Message::Response {
        message_id: new_message_id(),
        node_id,
        payload: ResponsePayload::Contacts(contacts.clone()),
    });
    roundtrip(Message::Response {
        message_id: new_message_id(),
        node_id,
        payload: ResponsePayload::CloserContacts {
            contacts: contacts.clone(),
            token: Bytes::from_static(b"tok"),
        },
    });
    roundtrip(Message::Response {
        message_id: new_message_id(),
        node_id,
        payload: ResponsePayload::Value {
            blob_hash: Bitmap::random(),
            contacts,
            token: Bytes::from_static(b"tok"),
        },
    });
}

#[test]
fn test_message_roundtrip_error() {
    roundtrip(Message::Error {
        message_id: new_message_id(),
        node_id: Bitmap::random(),
        code: 203,
        text: "invalid token".to_string(),
        extra: vec![Bytes::from_static(b"detail")],
    });
}

#[test]
fn test_message_parse_rejects_malformed() {
    assert!(Message::parse(b"junk").is_err());
    assert!(Message::parse(b"i42e").is_err());
    // missing everything but the type
    assert!(Message::parse(b"d1:0i0ee").is_err());

    // correct frame shape but a short node id
    let mut dict = std::collections::BTreeMap::new();
    dict.insert(Bytes::from_static(b"0"), crate::bencode::Value::Integer(0));
    dict.insert(
        Bytes::from_static(b"1"),
        crate::bencode::Value::Bytes(Bytes::from_static(&[1u8; 20])),
    );
    dict.insert(
        Bytes::from_static(b"2"),
        crate::bencode::Value::Bytes(Bytes::from_static(&[2u8; 10])),
    );
    dict.insert(Bytes::from_static(b"3"), crate::bencode::Value::string("ping"));
    dict.insert(Bytes::from_static(b"4"), crate::bencode::Value::List(Vec::new()));
    let encoded = crate::bencode::encode(&crate::bencode::Value::Dict(dict));
    assert!(matches!(
        Message::parse(&encoded),
        Err(DhtError::InvalidIdLength(10))
    ));
}

// === Routing table ===

/// An id landing in `bucket` of `base`'s table, salted for uniqueness.
fn id_in_bucket(base: &Bitmap, bucket: usize, salt: u8) -> Bitmap {
    let mut bytes = *base.as_bytes();
    bytes[bucket / 8] ^= 0x80 >> (bucket % 8);
    bytes[NODE_ID_LENGTH - 1] = salt;
    Bitmap::from(bytes)
}

#[test]
fn test_routing_rejects_self() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);

    assert_eq!(table.insert(contact(id, 4444)), InsertOutcome::Ignored);
    assert!(table.is_empty());
}

#[test]
fn test_routing_insert_and_refresh() {
    let table = RoutingTable::new(Bitmap::random());
    let c = contact(Bitmap::random(), 4444);

    assert_eq!(table.insert(c), InsertOutcome::Added);
    assert_eq!(table.insert(c), InsertOutcome::Refreshed);
    assert_eq!(table.len(), 1);
    assert!(table.contains(&c.id));
}

#[test]
fn test_routing_bucket_index_matches_prefix_len() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);

    for bucket in [0, 1, 7, 100, NODE_ID_BITS - 1] {
        let other = id_in_bucket(&id, bucket, 0xAB);
        assert_eq!(table.bucket_index(&other), id.prefix_len(&other));
        assert_eq!(table.bucket_index(&other), bucket);
    }
}

#[test]
fn test_routing_bucket_capacity() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);

    for i in 0..BUCKET_SIZE {
        let c = contact(id_in_bucket(&id, 0, i as u8), 1000 + i as u16);
        assert_eq!(table.insert(c), InsertOutcome::Added);
    }
    assert_eq!(table.len(), BUCKET_SIZE);

    let overflow = contact(id_in_bucket(&id, 0, 0xFF), 2000);
    let first = contact(id_in_bucket(&id, 0, 0), 1000);
    match table.insert(overflow) {
        InsertOutcome::Full { oldest } => assert_eq!(oldest.id, first.id),
        other => panic!("expected Full, got {:?}", other),
    }
    assert_eq!(table.len(), BUCKET_SIZE);
}

#[test]
fn test_routing_replace_after_failed_probe() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);

    for i in 0..BUCKET_SIZE {
        table.insert(contact(id_in_bucket(&id, 0, i as u8), 1000 + i as u16));
    }
    let newcomer = contact(id_in_bucket(&id, 0, 0xFF), 2000);
    let InsertOutcome::Full { oldest } = table.insert(newcomer) else {
        panic!("bucket should be full");
    };

    table.replace(&oldest.id, &newcomer);
    assert!(!table.contains(&oldest.id));
    assert!(table.contains(&newcomer.id));
    assert_eq!(table.len(), BUCKET_SIZE);
}

#[test]
fn test_routing_failures_evict_and_promote_backup() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);

    for i in 0..BUCKET_SIZE {
        table.insert(contact(id_in_bucket(&id, 0, i as u8), 1000 + i as u16));
    }
    // lands in backup since the bucket is full
    let backup = contact(id_in_bucket(&id, 0, 0xFF), 2000);
    table.insert(backup);

    let victim = id_in_bucket(&id, 0, 3);
    for _ in 0..3 {
        assert!(table.contains(&victim));
        table.record_failure(&victim);
    }
    assert!(!table.contains(&victim));
    assert!(table.contains(&backup.id));
    assert_eq!(table.len(), BUCKET_SIZE);
}

#[test]
fn test_routing_closest_sorted_and_bounded() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);

    for i in 0..20u8 {
        table.insert(contact(Bitmap::random(), 1000 + u16::from(i)));
    }

    let target = Bitmap::random();
    let closest = table.closest(&target, BUCKET_SIZE);
    assert!(closest.len() <= BUCKET_SIZE);
    for pair in closest.windows(2) {
        assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
    }
}

#[test]
fn test_routing_refresh_target_in_bucket_range() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);

    for bucket in [0, 5, 42, 383] {
        let target = table.refresh_target(bucket);
        assert_eq!(id.prefix_len(&target), bucket);
    }
}

#[test]
fn test_routing_stale_buckets() {
    let id = Bitmap::random();
    let table = RoutingTable::new(id);
    table.insert(contact(Bitmap::random(), 4444));

    assert!(table.stale_buckets(Duration::from_secs(60)).is_empty());
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(table.stale_buckets(Duration::from_millis(10)).len(), 1);
}

// === Contact store ===

#[test]
fn test_store_upsert_and_get() {
    let store = ContactStore::new(Duration::from_secs(60));
    let hash = Bitmap::random();
    let a = contact(Bitmap::random(), 1000);
    let b = contact(Bitmap::random(), 2000);

    assert!(store.get(&hash).is_empty());

    store.upsert(hash, a);
    store.upsert(hash, b);
    store.upsert(hash, a); // refresh, not duplicate

    let mut holders = store.get(&hash);
    holders.sort_by_key(|c| c.port);
    assert_eq!(holders, vec![a, b]);
    assert_eq!(store.hash_count(), 1);
    assert!(store.has(&hash));
}

#[test]
fn test_store_expiration() {
    let store = ContactStore::new(Duration::from_millis(40));
    let hash = Bitmap::random();
    store.upsert(hash, contact(Bitmap::random(), 1000));

    std::thread::sleep(Duration::from_millis(60));
    assert!(store.get(&hash).is_empty());

    store.remove_expired();
    assert_eq!(store.hash_count(), 0);
}

// === Token manager ===

#[test]
fn test_token_verify() {
    let tm = TokenManager::new();
    let id = Bitmap::random();
    let addr: SocketAddr = "127.0.0.1:4444".parse().unwrap();

    let token = tm.get(&id, addr);
    assert!(tm.verify(&token, &id, addr));
    assert!(!tm.verify(&token, &Bitmap::random(), addr));
    assert!(!tm.verify(&token, &id, "127.0.0.1:4445".parse().unwrap()));
    assert!(!tm.verify(b"bogus", &id, addr));
}

#[test]
fn test_token_survives_one_rotation_not_two() {
    let tm = TokenManager::new();
    let id = Bitmap::random();
    let addr: SocketAddr = "127.0.0.1:4444".parse().unwrap();

    let token = tm.get(&id, addr);
    tm.rotate();
    assert!(tm.verify(&token, &id, addr));
    tm.rotate();
    assert!(!tm.verify(&token, &id, addr));
    assert!(tm.verify(&tm.get(&id, addr), &id, addr));
}

#[tokio::test(start_paused = true)]
async fn test_token_background_rotation() {
    let tm = TokenManager::new();
    tm.start(Duration::from_millis(10));
    let id = Bitmap::random();
    let addr: SocketAddr = "127.0.0.1:4444".parse().unwrap();

    let token = tm.get(&id, addr);
    sleep(Duration::from_millis(15)).await;
    assert!(tm.verify(&token, &id, addr));

    sleep(Duration::from_millis(15)).await;
    assert!(!tm.verify(&token, &id, addr));
    assert!(tm.verify(&tm.get(&id, addr), &id, addr));

    tm.stop();
}

// === Node scenarios ===

fn test_config(seed_nodes: Vec<String>) -> Config {
    Config {
        interface_ip: Ipv4Addr::LOCALHOST,
        external_ip: Ipv4Addr::LOCALHOST,
        dht_port: 0,
        seed_nodes,
        udp_timeout: Duration::from_millis(300),
        udp_retry: 0,
        ..Config::default()
    }
}

#[tokio::test]
async fn test_self_ping_leaves_table_unchanged() {
    let node = Node::start(test_config(Vec::new())).await.unwrap();

    tokio::time::timeout(Duration::from_secs(1), node.ping(node.local_addr()))
        .await
        .expect("self ping should answer within a second")
        .unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(node.routing_table().len(), 0);

    node.shutdown().await;
}

#[tokio::test]
async fn test_two_node_find() {
    let a = Node::start(test_config(Vec::new())).await.unwrap();
    let b = Node::start(test_config(vec![a.local_addr().to_string()]))
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert!(a.routing_table().contains(&b.id()));
    assert!(b.routing_table().contains(&a.id()));

    let closest = a.find_node(b.id()).await.unwrap();
    assert!(closest.iter().any(|c| c.id == b.id()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_announce_and_lookup() {
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(4);

    let a_config = Config {
        announce_notifications: Some(notify_tx),
        ..test_config(Vec::new())
    };
    let a = Node::start(a_config).await.unwrap();
    let b = Node::start(test_config(vec![a.local_addr().to_string()]))
        .await
        .unwrap();
    sleep(Duration::from_millis(100)).await;

    let hash = Bitmap::from([0xAA; NODE_ID_LENGTH]);
    let stored = a.announce(hash).await.unwrap();
    // b accepted the store, and a indexed itself as one of the k closest
    assert_eq!(stored, 2);
    assert_eq!(a.announced_hashes(), vec![hash]);

    let notification = notify_rx.recv().await.unwrap();
    assert_eq!(notification.blob_hash, hash);
    assert_eq!(notification.stored, 2);

    // b accepted and indexed the announcement
    assert!(b.contact_store().has(&hash));

    let holders = b.get(hash).await.unwrap();
    assert!(holders.iter().any(|c| c.id == a.id()));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_bucket_eviction_after_ping_timeout() {
    let node = Node::start(test_config(Vec::new())).await.unwrap();
    let id = node.id();

    // fill one bucket with peers that will never answer a ping; ports
    // below 1024 stay outside the ephemeral range other tests bind in
    for i in 0..BUCKET_SIZE {
        let dead = Contact::new(
            id_in_bucket(&id, 0, i as u8),
            Ipv4Addr::LOCALHOST,
            500 + i as u16,
        );
        node.add_contact(dead).await;
    }
    assert_eq!(node.routing_table().len(), BUCKET_SIZE);

    let first = id_in_bucket(&id, 0, 0);
    let newcomer = Contact::new(id_in_bucket(&id, 0, 0xFF), Ipv4Addr::LOCALHOST, 510);
    node.add_contact(newcomer).await;

    assert!(!node.routing_table().contains(&first));
    assert!(node.routing_table().contains(&newcomer.id));
    assert_eq!(node.routing_table().len(), BUCKET_SIZE);

    node.shutdown().await;
}

#[tokio::test]
async fn test_lookup_terminates_without_closer_contacts() {
    let main = Node::start(test_config(Vec::new())).await.unwrap();

    // helpers have empty routing tables, so every probe returns no contacts
    let mut helpers = Vec::new();
    for _ in 0..10 {
        let helper = Node::start(test_config(Vec::new())).await.unwrap();
        let c = Contact::new(
            helper.id(),
            Ipv4Addr::LOCALHOST,
            helper.local_addr().port(),
        );
        main.add_contact(c).await;
        helpers.push(helper);
    }

    let started = std::time::Instant::now();
    let closest = main.find_node(Bitmap::random()).await.unwrap();
    // one round of alpha probes, all answering "nothing closer"
    assert!(started.elapsed() < Duration::from_millis(250));
    assert!(!closest.is_empty());

    main.shutdown().await;
    for helper in helpers {
        helper.shutdown().await;
    }
}

#[tokio::test]
async fn test_shutdown_refuses_operations() {
    let node = Node::start(test_config(Vec::new())).await.unwrap();
    let addr = node.local_addr();
    node.shutdown().await;

    assert!(matches!(
        node.ping(addr).await,
        Err(DhtError::ShuttingDown)
    ));
    assert!(matches!(
        node.get(Bitmap::random()).await,
        Err(DhtError::ShuttingDown)
    ));
    assert!(matches!(
        node.announce(Bitmap::random()).await,
        Err(DhtError::ShuttingDown)
    ));

    // idempotent
    node.shutdown().await;
}

#[tokio::test]
async fn test_config_validation() {
    let config = Config {
        expire_time: Duration::from_secs(60),
        reannounce_time: Duration::from_secs(3000),
        ..test_config(Vec::new())
    };
    assert!(matches!(
        Node::start(config).await,
        Err(DhtError::InvalidConfig(_))
    ));

    let config = Config {
        node_id: Some("not hex".to_string()),
        ..test_config(Vec::new())
    };
    assert!(matches!(
        Node::start(config).await,
        Err(DhtError::InvalidHexId)
    ));
}

#[tokio::test]
async fn test_configured_node_id() {
    let id = Bitmap::random();
    let config = Config {
        node_id: Some(id.to_hex()),
        ..test_config(Vec::new())
    };
    let node = Node::start(config).await.unwrap();
    assert_eq!(node.id(), id);
    node.shutdown().await;
}

// === Bootstrap node ===

#[tokio::test]
async fn test_bootstrap_ping_and_seed() {
    let bootstrap = BootstrapNode::start(
        Bitmap::random(),
        "127.0.0.1:0".parse().unwrap(),
        10,
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    let a = Node::start(test_config(Vec::new())).await.unwrap();
    let b = Node::start(test_config(Vec::new())).await.unwrap();

    a.ping(bootstrap.local_addr()).await.unwrap();
    b.ping(bootstrap.local_addr()).await.unwrap();
    assert_eq!(bootstrap.contact_count(), 2);

    // the bootstrap node seeds a with some peer other than a itself
    let (_, payload) = a
        .send_request(
            bootstrap.local_addr(),
            Request::FindNode {
                target: Bitmap::random(),
            },
        )
        .await
        .unwrap();
    match payload {
        ResponsePayload::Contacts(contacts) => {
            assert_eq!(contacts.len(), 1);
            assert_eq!(contacts[0].id, b.id());
        }
        other => panic!("expected contacts, got {:?}", other),
    }

    bootstrap.shutdown().await;
    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_connect_seeds() {
    let a = Node::start(test_config(Vec::new())).await.unwrap();

    let bootstrap = BootstrapNode::start(
        Bitmap::random(),
        "127.0.0.1:0".parse().unwrap(),
        10,
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    bootstrap.connect(&[a.local_addr().to_string()]).await;
    assert_eq!(bootstrap.contact_count(), 1);

    bootstrap.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_rejects_store() {
    let bootstrap = BootstrapNode::start(
        Bitmap::random(),
        "127.0.0.1:0".parse().unwrap(),
        10,
        Duration::from_secs(60),
    )
    .await
    .unwrap();
    let node = Node::start(test_config(Vec::new())).await.unwrap();

    let result = node
        .send_request(
            bootstrap.local_addr(),
            Request::Store {
                blob_hash: Bitmap::random(),
                token: Bytes::from_static(b"tok"),
                port: 3333,
                node_id: node.id(),
                self_store: true,
            },
        )
        .await;
    assert!(matches!(result, Err(DhtError::Remote { .. })));

    bootstrap.shutdown().await;
    node.shutdown().await;
}
