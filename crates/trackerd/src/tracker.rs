//! Tracker specialization of the engine.
//!
//! A tracker auto-joins any overlay it hears about, loads only the
//! rendezvous meta subset, never syncs, accepts the full global-time range,
//! and records destroy proofs in a plain text file that is replayed
//! (reversed) at startup.
//!
//! Protocol events go to stdout, one space-separated line each:
//! `BANDWIDTH`/`COMMUNITY`/`CANDIDATE` every statistics tick, `REQ_IN2` /
//! `RES_IN2` per introduction, `DESTROY_IN` on a received destroy, and
//! `DESTROY_OUT` when a destroyed overlay is still being asked for
//! introductions.

use std::fs::OpenOptions;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use overmesh_core::error::DropMessage;
use overmesh_core::member::Cid;
use overmesh_core::message::Message;
use overmesh_engine::builtin::{
    self, DESTROY_OVERLAY, IDENTITY, INTRODUCTION_REQUEST, INTRODUCTION_RESPONSE,
};
use overmesh_engine::community::{Disposition, MetaDef};
use overmesh_engine::engine::{Engine, HandlerScope, OverlayBlueprint};
use tracing::{info, warn};

/// Shared tracker context captured by the wrapped handlers.
pub struct TrackerShared {
    pub silent: bool,
    pub storage_path: PathBuf,
}

/// One `<TAG> <CID> <MID> <proto> <conversion> <host> <port>` stdout line.
fn print_peer_line(tag: &str, cid: &Cid, message: &Message) {
    let Some(packet) = message.packet() else { return };
    let Some(source) = message.source() else { return };
    if packet.len() < 2 {
        return;
    }
    println!(
        "{} {} {} {} {} {} {}",
        tag,
        cid,
        message.author().mid(),
        packet[0],
        packet[1],
        source.ip(),
        source.port()
    );
}

/// Append the destroy proof chain to the persistent storage file:
/// `# comment` lines plus `<name> <hex-packet>` lines.
fn persist_destroy(shared: &TrackerShared, scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    let cid = scope.overlay.cid();
    let mut out = String::new();
    let mut stored: Vec<Vec<u8>> = Vec::new();

    for message in messages {
        let source = message
            .source()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "local".to_string());
        out.push_str(&format!("# received {DESTROY_OVERLAY} from {source}\n"));

        if let Some(packet) = message.packet() {
            if !stored.contains(&packet.to_vec()) {
                stored.push(packet.to_vec());
                out.push_str(&format!("{} {}\n", DESTROY_OVERLAY, hex::encode(packet)));
            }
        }

        // The author's identity packet, so the proof verifies after a
        // reload from an empty member table.
        let author = message.author().mid();
        if let Some(identity) = scope.overlay.table().get(IDENTITY) {
            if let Ok(packets) =
                scope
                    .store
                    .latest_packets(&cid, &author, identity.database_id(), 1)
            {
                for packet in packets {
                    if !stored.contains(&packet) {
                        out.push_str(&format!("{} {}\n", IDENTITY, hex::encode(&packet)));
                        stored.push(packet);
                    }
                }
            }
        }

        // Any permission chain backing the destroy.
        for proof in scope.overlay.timeline().proofs_for(
            author,
            message.meta().database_id(),
            message.global_time(),
        ) {
            if !stored.contains(&proof) {
                out.push_str(&format!("{} {}\n", builtin::AUTHORIZE, hex::encode(&proof)));
                stored.push(proof);
            }
        }
    }

    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&shared.storage_path)
        .and_then(|mut file| file.write_all(out.as_bytes()));
    if let Err(e) = result {
        warn!("failed to persist destroy proof: {e}");
    }
}

/// The overlay recipe a tracker instantiates for every CID it hears about.
pub fn tracker_blueprint(shared: Arc<TrackerShared>) -> OverlayBlueprint {
    let mut defs: Vec<MetaDef> = builtin::tracker_meta_defs();

    for def in &mut defs {
        match def.name {
            INTRODUCTION_REQUEST => {
                // Never answer another tracker's walker.
                let inner_check = def.handlers.check.clone();
                def.handlers.check = Arc::new(move |scope, message| {
                    let from_bootstrap = message
                        .source()
                        .and_then(|addr| scope.overlay.candidates.get(&addr))
                        .is_some_and(|candidate| candidate.is_bootstrap());
                    if from_bootstrap {
                        return Disposition::Drop(DropMessage::new(
                            "introduction request from a bootstrap peer",
                        ));
                    }
                    inner_check(scope, message)
                });

                let inner = def.handlers.on_accept.clone();
                let shared = shared.clone();
                def.handlers.on_accept = Arc::new(move |scope, messages| {
                    let cid = scope.overlay.cid();
                    if scope.overlay.is_hard_killed() {
                        // Requests for a destroyed overlay are always
                        // reported; there is no REQ_IN2 for them.
                        for message in messages {
                            print_peer_line("DESTROY_OUT", &cid, message);
                        }
                    } else if !shared.silent {
                        for message in messages {
                            print_peer_line("REQ_IN2", &cid, message);
                        }
                    }
                    inner(scope, messages);
                });
            }
            INTRODUCTION_RESPONSE => {
                let inner = def.handlers.on_accept.clone();
                let shared = shared.clone();
                def.handlers.on_accept = Arc::new(move |scope, messages| {
                    if !shared.silent {
                        let cid = scope.overlay.cid();
                        for message in messages {
                            print_peer_line("RES_IN2", &cid, message);
                        }
                    }
                    inner(scope, messages);
                });
            }
            DESTROY_OVERLAY => {
                let inner = def.handlers.on_accept.clone();
                let shared = shared.clone();
                def.handlers.on_accept = Arc::new(move |scope, messages| {
                    let cid = scope.overlay.cid();
                    for message in messages {
                        print_peer_line("DESTROY_IN", &cid, message);
                    }
                    persist_destroy(&shared, scope, messages);
                    inner(scope, messages);
                });
            }
            _ => {}
        }
    }

    OverlayBlueprint {
        defs,
        // Relay for any conversion version the protocol knows.
        conversion_versions: vec![0x01, 0x02],
        // A tracker never learns most member keys; it relays unverified.
        verify_signatures: false,
        accept_full_time_range: true,
        enable_sync: false,
    }
}

/// Replay the persistent destroy storage, newest lines first.
pub fn load_persistent_storage(engine: &mut Engine, path: &Path) {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return,
    };
    let mut packets = Vec::new();
    for line in content.lines() {
        if line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(_name), Some(hex_packet)) = (parts.next(), parts.next()) else {
            continue;
        };
        match hex::decode(hex_packet) {
            Ok(packet) => packets.push(packet),
            Err(e) => warn!("skipping corrupt storage line: {e}"),
        }
    }
    info!(count = packets.len(), "replaying persistent destroy storage");

    let loopback: SocketAddr = "127.0.0.1:0".parse().expect("static address");
    for packet in packets.into_iter().rev() {
        engine.on_incoming_packets(Instant::now(), vec![(loopback, packet)]);
    }
}

/// `BANDWIDTH` / `COMMUNITY` / `CANDIDATE` statistics lines.
pub fn print_statistics(engine: &Engine) {
    let stats = engine.endpoint().stats();
    println!("BANDWIDTH {} {}", stats.total_up(), stats.total_down());
    let killed = engine.overlays().filter(|o| o.is_hard_killed()).count();
    let live = engine.overlay_count() - killed;
    println!("COMMUNITY {live} {killed}");
    println!("CANDIDATE {}", engine.candidate_count());
}

#[cfg(test)]
mod tests {
    use super::*;
    use overmesh_core::authentication::AuthenticationImpl;
    use overmesh_core::codec::Conversion;
    use overmesh_core::destination::DestinationImpl;
    use overmesh_core::distribution::DistributionImpl;
    use overmesh_core::member::{KeyStrength, Member, MemberRegistry, MemoryMemberStore, Mid};
    use overmesh_core::resolution::ResolutionImpl;
    use overmesh_engine::builtin::{
        DestroyDegree, DestroyOverlayPayload, IntroductionRequestPayload,
    };
    use overmesh_engine::engine::Engine;
    use overmesh_engine::store::SyncStore;
    use overmesh_net::endpoint::RecordingEndpoint;
    use tempfile::tempdir;

    struct Node {
        registry: MemberRegistry,
        member: Arc<Member>,
    }

    impl Node {
        fn new() -> Self {
            let registry = MemberRegistry::new(Arc::new(MemoryMemberStore::default())).unwrap();
            let member = registry.new_random(KeyStrength::Low).unwrap();
            Self { registry, member }
        }
    }

    fn tracker_engine(storage: PathBuf) -> (Engine, Arc<RecordingEndpoint>) {
        let store = Arc::new(SyncStore::temporary().unwrap());
        let endpoint = RecordingEndpoint::new();
        let mut engine = Engine::new(store, endpoint.clone(), KeyStrength::VeryLow).unwrap();
        let shared = Arc::new(TrackerShared {
            silent: true,
            storage_path: storage,
        });
        engine.set_auto_join(Box::new(move |_| tracker_blueprint(shared.clone())));
        (engine, endpoint)
    }

    /// Craft the packets a remote overlay member would send to a tracker.
    fn craft(
        node: &Node,
        tracker: &Engine,
        cid: &Cid,
        name: &str,
        global_time: u64,
        payload: Box<dyn overmesh_core::payload::Payload>,
    ) -> Vec<u8> {
        let overlay = tracker.overlay(cid).expect("overlay loaded");
        let meta = overlay.table().get(name).unwrap().clone();
        let resolution = match meta.resolution() {
            overmesh_core::resolution::Resolution::Linear => ResolutionImpl::Linear,
            _ => ResolutionImpl::Public,
        };
        let destination = match meta.destination() {
            overmesh_core::destination::Destination::Member => {
                DestinationImpl::Member { targets: vec![] }
            }
            _ => DestinationImpl::Community,
        };
        let message = Message::new(
            meta,
            AuthenticationImpl::single(node.member.clone()),
            resolution,
            DistributionImpl::new(global_time),
            destination,
            payload,
        )
        .unwrap();
        Conversion::new(*cid, 0x01).encode(&message).unwrap();
        message.packet().unwrap().to_vec()
    }

    fn intro_request(node: &Node, tracker: &Engine, cid: &Cid, global_time: u64) -> Vec<u8> {
        craft(
            node,
            tracker,
            cid,
            INTRODUCTION_REQUEST,
            global_time,
            Box::new(IntroductionRequestPayload {
                destination: "5.6.7.8:6421".parse().unwrap(),
                source_lan: "192.168.0.2:6421".parse().unwrap(),
                source_wan: "1.2.3.4:6421".parse().unwrap(),
                advice: true,
                identifier: 99,
            }),
        )
    }

    fn peer_addr() -> SocketAddr {
        "1.2.3.4:6421".parse().unwrap()
    }

    /// A bare header: enough to trigger auto-join, dropped right after.
    fn probe_packet(cid: &Cid) -> Vec<u8> {
        let mut probe = vec![0x00, 0x01];
        probe.extend_from_slice(&cid.0);
        probe.push(3);
        probe
    }

    #[test]
    fn test_auto_join_and_introduction() {
        let dir = tempdir().unwrap();
        let (mut engine, endpoint) = tracker_engine(dir.path().join("persistent-storage.data"));
        let node = Node::new();
        let master = node.registry.new_random(KeyStrength::Low).unwrap();
        let cid = Cid::from(master.mid());

        // The tracker has never heard of this overlay; a first packet makes
        // it join.  Crafting needs the meta table, so join with a probe
        // packet first.
        assert!(engine.overlay(&cid).is_none());
        engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), probe_packet(&cid))]);
        assert!(engine.overlay(&cid).is_some(), "auto-join on first packet");

        let packet = intro_request(&node, &engine, &cid, 5);
        engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), packet)]);

        // The tracker answered with an introduction response.
        let sent = endpoint.take_sent();
        assert!(
            sent.iter().any(|(addr, _)| *addr == peer_addr()),
            "tracker must answer the walker"
        );
        let overlay = engine.overlay(&cid).unwrap();
        assert!(overlay.candidates.get(&peer_addr()).is_some());
        assert!(!overlay.sync_enabled());
    }

    #[test]
    fn test_destroy_lifecycle_and_storage() {
        let dir = tempdir().unwrap();
        let storage = dir.path().join("persistent-storage.data");
        let (mut engine, endpoint) = tracker_engine(storage.clone());
        let node = Node::new();
        // The destroyer must be the overlay master.
        let cid = Cid::from(node.member.mid());

        // Prime the overlay via auto-join, then walk in.
        engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), probe_packet(&cid))]);
        let first = intro_request(&node, &engine, &cid, 5);
        engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), first)]);
        endpoint.take_sent();

        // Destroy the overlay.
        let destroy = craft(
            &node,
            &engine,
            &cid,
            DESTROY_OVERLAY,
            9,
            Box::new(DestroyOverlayPayload {
                degree: DestroyDegree::Hard,
            }),
        );
        engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), destroy.clone())]);

        let overlay = engine.overlay(&cid).unwrap();
        assert!(overlay.is_hard_killed());

        // The proof reached the storage file.
        let content = std::fs::read_to_string(&storage).unwrap();
        assert!(content.contains(&hex::encode(&destroy)));
        assert!(content.lines().any(|l| l.starts_with('#')));

        // A later introduction request is answered with the destroy proof.
        endpoint.take_sent();
        let late = intro_request(&node, &engine, &cid, 11);
        engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), late)]);
        let sent = endpoint.take_sent();
        assert!(
            sent.iter().any(|(_, packet)| *packet == destroy),
            "shell must answer with the destroy proof"
        );
    }

    #[test]
    fn test_storage_reload_reapplies_destroy() {
        let dir = tempdir().unwrap();
        let storage = dir.path().join("persistent-storage.data");
        let node = Node::new();
        let cid = Cid::from(node.member.mid());

        let destroy_packet;
        {
            let (mut engine, _endpoint) = tracker_engine(storage.clone());
            engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), probe_packet(&cid))]);
            destroy_packet = craft(
                &node,
                &engine,
                &cid,
                DESTROY_OVERLAY,
                9,
                Box::new(DestroyOverlayPayload {
                    degree: DestroyDegree::Hard,
                }),
            );
            engine.on_incoming_packets(Instant::now(), vec![(peer_addr(), destroy_packet.clone())]);
            assert!(engine.overlay(&cid).unwrap().is_hard_killed());
        }

        // A fresh tracker replays the file and ends up hard-killed again.
        let (mut engine, _endpoint) = tracker_engine(storage.clone());
        load_persistent_storage(&mut engine, &storage);
        let overlay = engine.overlay(&cid).expect("reload rejoins the overlay");
        assert!(overlay.is_hard_killed());
    }

    #[test]
    fn test_mid_display_matches_hex() {
        let mid = Mid([0xab; 20]);
        assert_eq!(mid.to_string(), "ab".repeat(20));
    }
}
