//! End-to-end pipeline scenarios: retention, sequence healing, dynamic
//! resolution, co-signing, and strike unload.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use overmesh_core::authentication::{Authentication, AuthenticationImpl, KeyEncoding};
use overmesh_core::destination::{Destination, DestinationImpl};
use overmesh_core::distribution::{Direction, Distribution, DistributionImpl};
use overmesh_core::member::{Cid, KeyStrength, Member};
use overmesh_core::message::Message;
use overmesh_core::payload::{TextPayload, TextPayloadCodec};
use overmesh_core::resolution::{Resolution, ResolutionImpl, ResolutionVariant};
use overmesh_net::endpoint::RecordingEndpoint;
use parking_lot::Mutex;

use crate::builtin;
use crate::community::{MetaDef, MetaHandlers};
use crate::engine::{Engine, OverlayBlueprint};
use crate::store::{SyncSelection, SyncStore};
use crate::BloomFilter;

type TextLog = Arc<Mutex<Vec<String>>>;

fn recording_handlers(log: TextLog) -> MetaHandlers {
    MetaHandlers {
        check: Arc::new(builtin::check_timeline),
        on_accept: Arc::new(move |_scope, messages| {
            let mut log = log.lock();
            for message in messages {
                if let Some(text) = message.payload_as::<TextPayload>() {
                    log.push(text.text.clone());
                }
            }
        }),
        undo: None,
    }
}

fn text_defs(log: TextLog) -> Vec<MetaDef> {
    vec![
        MetaDef {
            name: "last-1-test",
            tag: 100,
            authentication: Authentication::member(KeyEncoding::Sha1),
            resolution: Resolution::Public,
            distribution: Distribution::last_sync(Direction::Ascending, 128, 1).unwrap(),
            destination: Destination::Community { node_count: 10 },
            codec: Box::new(TextPayloadCodec),
            handlers: recording_handlers(log.clone()),
        },
        MetaDef {
            name: "sequence-text",
            tag: 101,
            authentication: Authentication::member(KeyEncoding::Sha1),
            resolution: Resolution::Public,
            distribution: Distribution::full_sync(Direction::Ascending, 128, true),
            destination: Destination::Community { node_count: 10 },
            codec: Box::new(TextPayloadCodec),
            handlers: recording_handlers(log.clone()),
        },
        MetaDef {
            name: "dynamic-resolution-text",
            tag: 102,
            authentication: Authentication::member(KeyEncoding::Sha1),
            resolution: Resolution::dynamic(vec![
                ResolutionVariant::Public,
                ResolutionVariant::Linear,
            ])
            .unwrap(),
            distribution: Distribution::full_sync(Direction::Ascending, 128, false),
            destination: Destination::Community { node_count: 10 },
            codec: Box::new(TextPayloadCodec),
            handlers: recording_handlers(log.clone()),
        },
        MetaDef {
            name: "double-signed-text",
            tag: 103,
            authentication: Authentication::double_member(
                KeyEncoding::Sha1,
                Arc::new(|message: &Message| {
                    message
                        .payload_as::<TextPayload>()
                        .is_some_and(|p| p.text == "Allow=True")
                }),
            ),
            resolution: Resolution::Public,
            distribution: Distribution::Direct,
            destination: Destination::Member,
            codec: Box::new(TextPayloadCodec),
            handlers: recording_handlers(log),
        },
    ]
}

struct TestBed {
    engine: Engine,
    endpoint: Arc<RecordingEndpoint>,
    log: TextLog,
    cid: Cid,
}

fn testbed() -> TestBed {
    let store = Arc::new(SyncStore::temporary().unwrap());
    let endpoint = RecordingEndpoint::new();
    let mut engine = Engine::new(store, endpoint.clone(), KeyStrength::Medium).unwrap();
    let log: TextLog = Arc::new(Mutex::new(Vec::new()));
    let cid = engine
        .create_overlay(OverlayBlueprint::standard().with_defs(text_defs(log.clone())))
        .unwrap();
    TestBed {
        engine,
        endpoint,
        log,
        cid,
    }
}

fn join_same_overlay(cid: Cid) -> TestBed {
    let store = Arc::new(SyncStore::temporary().unwrap());
    let endpoint = RecordingEndpoint::new();
    let mut engine = Engine::new(store, endpoint.clone(), KeyStrength::Medium).unwrap();
    let log: TextLog = Arc::new(Mutex::new(Vec::new()));
    engine
        .join_overlay(
            cid,
            OverlayBlueprint::standard().with_defs(text_defs(log.clone())),
        )
        .unwrap();
    TestBed {
        engine,
        endpoint,
        log,
        cid,
    }
}

/// Craft a packet the way a remote node would.
fn craft_text(
    engine: &Engine,
    cid: &Cid,
    name: &str,
    author: &Arc<Member>,
    global_time: u64,
    sequence: u32,
    variant_index: u8,
    text: &str,
) -> Vec<u8> {
    let overlay = engine.overlay(cid).unwrap();
    let meta = overlay.table().get(name).unwrap().clone();
    let resolution = match meta.resolution() {
        Resolution::Public => ResolutionImpl::Public,
        Resolution::Linear => ResolutionImpl::Linear,
        Resolution::Dynamic { .. } => {
            ResolutionImpl::dynamic(meta.resolution(), variant_index).unwrap()
        }
    };
    let message = Message::new(
        meta,
        AuthenticationImpl::single(author.clone()),
        resolution,
        DistributionImpl::with_sequence(global_time, sequence),
        DestinationImpl::Community,
        Box::new(TextPayload::new(text)),
    )
    .unwrap();
    overlay.default_conversion().unwrap().encode(&message).unwrap()
}

fn addr(n: u8) -> SocketAddr {
    format!("10.1.0.{n}:6421").parse().unwrap()
}

#[test]
fn test_last_1_retention() {
    let mut bed = testbed();
    let author = bed.engine.registry().new_random(KeyStrength::Medium).unwrap();

    let now = Instant::now();
    let mut final_packet = Vec::new();
    for global_time in [5u64, 3, 7] {
        let packet = craft_text(
            &bed.engine,
            &bed.cid,
            "last-1-test",
            &author,
            global_time,
            0,
            0,
            &format!("message at {global_time}"),
        );
        if global_time == 7 {
            final_packet = packet.clone();
        }
        bed.engine.on_incoming_packets(now, vec![(addr(1), packet)]);
    }

    // All three were admitted in arrival order...
    assert_eq!(
        *bed.log.lock(),
        vec!["message at 5", "message at 3", "message at 7"]
    );
    // ...but retention keeps exactly the row at global time 7.
    let meta_id = bed
        .engine
        .overlay(&bed.cid)
        .unwrap()
        .table()
        .get("last-1-test")
        .unwrap()
        .database_id();
    let store = bed.engine.store();
    assert_eq!(store.count_member(&bed.cid, &author.mid(), meta_id).unwrap(), 1);
    assert_eq!(
        store
            .latest_packets(&bed.cid, &author.mid(), meta_id, 10)
            .unwrap(),
        vec![final_packet]
    );
}

#[test]
fn test_sequence_healing() {
    let mut bed = testbed();
    let author = bed.engine.registry().new_random(KeyStrength::Medium).unwrap();
    let now = Instant::now();

    for sequence in [2u32, 3, 1] {
        let packet = craft_text(
            &bed.engine,
            &bed.cid,
            "sequence-text",
            &author,
            10 + sequence as u64,
            sequence,
            0,
            &format!("sequence {sequence}"),
        );
        bed.engine.on_incoming_packets(now, vec![(addr(1), packet)]);
    }

    // Handlers ran in dense order once the gap closed.
    assert_eq!(
        *bed.log.lock(),
        vec!["sequence 1", "sequence 2", "sequence 3"]
    );
    let meta_id = bed
        .engine
        .overlay(&bed.cid)
        .unwrap()
        .table()
        .get("sequence-text")
        .unwrap()
        .database_id();
    assert_eq!(
        bed.engine
            .store()
            .count_member(&bed.cid, &author.mid(), meta_id)
            .unwrap(),
        3
    );
    assert_eq!(
        bed.engine
            .store()
            .last_sequence(&bed.cid, &author.mid(), meta_id)
            .unwrap(),
        3
    );
    // The out-of-order arrivals asked the source for the missing range.
    assert!(bed.endpoint.sent_count() > 0);
}

#[test]
fn test_dynamic_resolution_switch() {
    let mut bed = testbed();
    let author = bed.engine.registry().new_random(KeyStrength::Medium).unwrap();
    let now = Instant::now();

    // Before any switch the first variant (public) applies.
    let packet = craft_text(
        &bed.engine,
        &bed.cid,
        "dynamic-resolution-text",
        &author,
        9,
        0,
        0,
        "before switch",
    );
    bed.engine.on_incoming_packets(now, vec![(addr(1), packet)]);
    assert_eq!(*bed.log.lock(), vec!["before switch"]);

    // The master switches to linear at global time 10.
    let master = bed.engine.overlay(&bed.cid).unwrap().master().clone();
    let overlay = bed.engine.overlay(&bed.cid).unwrap();
    let settings_meta = overlay.table().get(builtin::DYNAMIC_SETTINGS).unwrap().clone();
    let switch = Message::new(
        settings_meta,
        AuthenticationImpl::single(master),
        ResolutionImpl::Linear,
        DistributionImpl::new(10),
        DestinationImpl::Community,
        Box::new(builtin::DynamicSettingsPayload {
            switches: vec![(102, 1)],
        }),
    )
    .unwrap();
    let switch_packet = overlay.default_conversion().unwrap().encode(&switch).unwrap();
    bed.engine
        .on_incoming_packets(now, vec![(addr(2), switch_packet)]);

    // An identical message after the switch is no longer admitted: the
    // unauthorized author is delayed pending proof.
    let delayed_before = bed.engine.stats().delayed;
    for variant_index in [0u8, 1] {
        let packet = craft_text(
            &bed.engine,
            &bed.cid,
            "dynamic-resolution-text",
            &author,
            11,
            0,
            variant_index,
            "after switch",
        );
        bed.engine.on_incoming_packets(now, vec![(addr(1), packet)]);
    }
    assert!(!bed.log.lock().contains(&"after switch".to_string()));
    assert!(bed.engine.stats().delayed > delayed_before);

    // Messages dated before the switch still pass.
    let packet = craft_text(
        &bed.engine,
        &bed.cid,
        "dynamic-resolution-text",
        &author,
        9,
        0,
        0,
        "still public at 9",
    );
    bed.engine.on_incoming_packets(now, vec![(addr(1), packet)]);
    assert!(bed.log.lock().contains(&"still public at 9".to_string()));
}

#[test]
fn test_double_signed_flow() {
    let mut alice = testbed();
    let mut bob = join_same_overlay(alice.cid);
    let now = Instant::now();

    // Teach each engine the other's key and address.
    let alice_key = alice.engine.my_member().public_key_bytes().unwrap();
    let bob_key = bob.engine.my_member().public_key_bytes().unwrap();
    let bob_at_alice = alice.engine.registry().get_or_create(&bob_key).unwrap();
    bob.engine.registry().get_or_create(&alice_key).unwrap();
    {
        let overlay = alice.engine.overlay_mut(&alice.cid).unwrap();
        let candidate = overlay.candidates.get_or_insert(addr(2));
        candidate.mark_stumble(now);
        candidate.associate(bob_at_alice.mid());
    }

    // Alice asks Bob to countersign.
    alice.endpoint.take_sent();
    alice
        .engine
        .create_double_signed(
            &alice.cid,
            "double-signed-text",
            bob_at_alice.clone(),
            Box::new(TextPayload::new("Allow=True")),
        )
        .unwrap();
    let request: Vec<Vec<u8>> = alice
        .endpoint
        .take_sent()
        .into_iter()
        .map(|(_, packet)| packet)
        .collect();
    assert_eq!(request.len(), 1);

    // Bob receives the request; his allow callback approves and he
    // countersigns.
    bob.engine
        .on_incoming_packets(now, vec![(addr(1), request[0].clone())]);
    let response: Vec<Vec<u8>> = bob
        .endpoint
        .take_sent()
        .into_iter()
        .map(|(_, packet)| packet)
        .collect();
    assert_eq!(response.len(), 1, "bob must answer with a countersignature");

    // Alice ingests the response: the twice-signed message is admitted.
    alice
        .engine
        .on_incoming_packets(now, vec![(addr(2), response[0].clone())]);
    assert_eq!(*alice.log.lock(), vec!["Allow=True"]);

    // A refused payload produces no countersignature.
    alice
        .engine
        .create_double_signed(
            &alice.cid,
            "double-signed-text",
            bob_at_alice,
            Box::new(TextPayload::new("Allow=False")),
        )
        .unwrap();
    let request: Vec<Vec<u8>> = alice
        .endpoint
        .take_sent()
        .into_iter()
        .map(|(_, packet)| packet)
        .collect();
    bob.engine
        .on_incoming_packets(now, vec![(addr(1), request[0].clone())]);
    assert_eq!(bob.endpoint.sent_count(), 0);
    assert_eq!(*alice.log.lock(), vec!["Allow=True"]);
}

#[test]
fn test_idempotent_delivery() {
    let mut bed = testbed();
    let author = bed.engine.registry().new_random(KeyStrength::Medium).unwrap();
    let now = Instant::now();

    let packet = craft_text(
        &bed.engine,
        &bed.cid,
        "last-1-test",
        &author,
        5,
        0,
        0,
        "once",
    );
    bed.engine
        .on_incoming_packets(now, vec![(addr(1), packet.clone())]);
    bed.engine.on_incoming_packets(now, vec![(addr(1), packet)]);

    assert_eq!(*bed.log.lock(), vec!["once"]);
    let meta_id = bed
        .engine
        .overlay(&bed.cid)
        .unwrap()
        .table()
        .get("last-1-test")
        .unwrap()
        .database_id();
    assert_eq!(
        bed.engine
            .store()
            .count_member(&bed.cid, &author.mid(), meta_id)
            .unwrap(),
        1
    );
    assert_eq!(bed.engine.stats().duplicates, 1);
}

#[test]
fn test_strike_unload() {
    let mut bed = testbed();
    let now = Instant::now();
    assert_eq!(bed.engine.overlay_count(), 1);

    // Three silent intervals unload the overlay.
    assert!(bed.engine.tick_strikes(now).is_empty());
    assert!(bed.engine.tick_strikes(now).is_empty());
    let unloaded = bed.engine.tick_strikes(now);
    assert_eq!(unloaded, vec![bed.cid]);
    assert_eq!(bed.engine.overlay_count(), 0);
}

#[test]
fn test_strike_reset_by_active_candidate() {
    let mut bed = testbed();
    let now = Instant::now();
    bed.engine
        .overlay_mut(&bed.cid)
        .unwrap()
        .candidates
        .get_or_insert(addr(1))
        .mark_stumble(now);

    for _ in 0..5 {
        assert!(bed.engine.tick_strikes(now).is_empty());
    }
    assert_eq!(bed.engine.overlay_count(), 1);
}

#[test]
fn test_sync_selection_skips_low_priority() {
    let mut bed = testbed();
    let author = bed.engine.registry().new_random(KeyStrength::Medium).unwrap();
    let now = Instant::now();

    let packet = craft_text(
        &bed.engine,
        &bed.cid,
        "last-1-test",
        &author,
        5,
        0,
        0,
        "syncable",
    );
    bed.engine
        .on_incoming_packets(now, vec![(addr(1), packet.clone())]);

    let selection = SyncSelection {
        time_low: 1,
        time_high: 0,
        bloom: BloomFilter::new(1024, 4),
        members: Vec::new(),
        byte_budget: 64 * 1024,
    };
    let packets = bed.engine.select_sync_response(&bed.cid, &selection);
    // The identity announcement sits below the sync floor; only the text
    // message is eligible.
    assert_eq!(packets, vec![packet]);
}

#[test]
fn test_hard_kill_via_destroy_message() {
    let mut bed = testbed();
    let now = Instant::now();

    let master = bed.engine.overlay(&bed.cid).unwrap().master().clone();
    let overlay = bed.engine.overlay(&bed.cid).unwrap();
    let destroy_meta = overlay.table().get(builtin::DESTROY_OVERLAY).unwrap().clone();
    let destroy = Message::new(
        destroy_meta,
        AuthenticationImpl::single(master),
        ResolutionImpl::Linear,
        DistributionImpl::new(20),
        DestinationImpl::Community,
        Box::new(builtin::DestroyOverlayPayload {
            degree: builtin::DestroyDegree::Hard,
        }),
    )
    .unwrap();
    let packet = overlay.default_conversion().unwrap().encode(&destroy).unwrap();

    bed.engine
        .on_incoming_packets(now, vec![(addr(3), packet.clone())]);
    let overlay = bed.engine.overlay(&bed.cid).unwrap();
    assert!(overlay.is_hard_killed());
    assert_eq!(overlay.destroy_proof(), Some(packet.as_slice()));

    // The shell refuses further sync traffic.
    let author = bed.engine.registry().new_random(KeyStrength::Medium).unwrap();
    let text = craft_text(&bed.engine, &bed.cid, "last-1-test", &author, 25, 0, 0, "late");
    bed.engine.on_incoming_packets(now, vec![(addr(1), text)]);
    assert!(bed.log.lock().is_empty());
}
