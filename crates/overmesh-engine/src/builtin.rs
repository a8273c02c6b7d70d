//! The built-in meta message set every overlay carries: identity exchange,
//! candidate walking, permission management, destruction, and the co-sign
//! protocol.

use std::any::Any;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use overmesh_core::authentication::{Authentication, AuthenticationImpl, KeyEncoding};
use overmesh_core::codec::{countersign_packet, peek_conversion_version};
use overmesh_core::destination::{Destination, DestinationImpl};
use overmesh_core::distribution::{Direction, Distribution, DistributionImpl};
use overmesh_core::error::{DropMessage, DropPacket, PolicyMismatch};
use overmesh_core::member::{Member, Mid};
use overmesh_core::message::Message;
use overmesh_core::payload::{payload_as, FnCodec, Payload};
use overmesh_core::resolution::Resolution;
use overmesh_core::timeline::Permission;
use overmesh_core::wire::{put_addr, put_u16, put_u32, put_u64, Reader};
use overmesh_core::ResolutionImpl;
use tracing::{debug, warn};

use crate::community::{Disposition, MetaDef, MetaHandlers};
use crate::engine::{EngineEvent, HandlerScope, Outgoing};

pub const IDENTITY: &str = "identity";
pub const MISSING_IDENTITY: &str = "missing-identity";
pub const INTRODUCTION_REQUEST: &str = "introduction-request";
pub const INTRODUCTION_RESPONSE: &str = "introduction-response";
pub const PUNCTURE_REQUEST: &str = "puncture-request";
pub const PUNCTURE: &str = "puncture";
pub const AUTHORIZE: &str = "authorize";
pub const REVOKE: &str = "revoke";
pub const MISSING_PROOF: &str = "missing-proof";
pub const MISSING_SEQUENCE: &str = "missing-sequence";
pub const DYNAMIC_SETTINGS: &str = "dynamic-settings";
pub const DESTROY_OVERLAY: &str = "destroy-overlay";
pub const SIGNATURE_REQUEST: &str = "signature-request";
pub const SIGNATURE_RESPONSE: &str = "signature-response";

const UNSPECIFIED: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

// ======================================================================
// payloads
// ======================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingIdentityPayload {
    pub mid: Mid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionRequestPayload {
    /// Where the sender believes it is sending this request.
    pub destination: SocketAddrV4,
    pub source_lan: SocketAddrV4,
    pub source_wan: SocketAddrV4,
    /// Whether the sender wants to be introduced to a third peer.
    pub advice: bool,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionResponsePayload {
    pub destination: SocketAddrV4,
    pub source_lan: SocketAddrV4,
    pub source_wan: SocketAddrV4,
    pub lan_introduction: SocketAddrV4,
    pub wan_introduction: SocketAddrV4,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunctureRequestPayload {
    pub lan_walker: SocketAddrV4,
    pub wan_walker: SocketAddrV4,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PuncturePayload {
    pub source_lan: SocketAddrV4,
    pub source_wan: SocketAddrV4,
    pub identifier: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionTriplet {
    pub public_key: Vec<u8>,
    pub meta_tag: u8,
    pub permission: Permission,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizePayload {
    pub triplets: Vec<PermissionTriplet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokePayload {
    pub triplets: Vec<PermissionTriplet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingProofPayload {
    pub mid: Mid,
    pub global_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingSequencePayload {
    pub mid: Mid,
    pub meta_tag: u8,
    pub low: u32,
    pub high: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicSettingsPayload {
    /// `(meta tag, resolution variant index)` pairs.
    pub switches: Vec<(u8, u8)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyDegree {
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestroyOverlayPayload {
    pub degree: DestroyDegree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequestPayload {
    pub identifier: u16,
    /// The half-signed packet awaiting a countersign.
    pub packet: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureResponsePayload {
    pub identifier: u16,
    pub signature: Vec<u8>,
}

macro_rules! impl_payload {
    ($($ty:ty),* $(,)?) => {
        $(impl Payload for $ty {
            fn as_any(&self) -> &dyn Any {
                self
            }
        })*
    };
}

impl_payload!(
    MissingIdentityPayload,
    IntroductionRequestPayload,
    IntroductionResponsePayload,
    PunctureRequestPayload,
    PuncturePayload,
    AuthorizePayload,
    RevokePayload,
    MissingProofPayload,
    MissingSequencePayload,
    DynamicSettingsPayload,
    DestroyOverlayPayload,
    SignatureRequestPayload,
    SignatureResponsePayload,
);

// ======================================================================
// payload codecs
// ======================================================================

fn expected<T: Payload>(payload: &dyn Payload) -> Result<&T, PolicyMismatch> {
    payload_as::<T>(payload)
        .ok_or_else(|| PolicyMismatch::new("payload type does not match the meta"))
}

fn encode_empty(_: &dyn Payload, _: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    Ok(())
}

fn decode_empty(_: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(overmesh_core::payload::EmptyPayload))
}

fn encode_missing_identity(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<MissingIdentityPayload>(p)?;
    buf.extend_from_slice(p.mid.as_bytes());
    Ok(())
}

fn decode_missing_identity(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(MissingIdentityPayload {
        mid: Mid(r.take_array::<20>()?),
    }))
}

fn encode_introduction_request(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<IntroductionRequestPayload>(p)?;
    put_addr(buf, &p.destination);
    put_addr(buf, &p.source_lan);
    put_addr(buf, &p.source_wan);
    buf.push(p.advice as u8);
    put_u16(buf, p.identifier);
    Ok(())
}

fn decode_introduction_request(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(IntroductionRequestPayload {
        destination: r.take_addr()?,
        source_lan: r.take_addr()?,
        source_wan: r.take_addr()?,
        advice: r.take_u8()? != 0,
        identifier: r.take_u16()?,
    }))
}

fn encode_introduction_response(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<IntroductionResponsePayload>(p)?;
    put_addr(buf, &p.destination);
    put_addr(buf, &p.source_lan);
    put_addr(buf, &p.source_wan);
    put_addr(buf, &p.lan_introduction);
    put_addr(buf, &p.wan_introduction);
    put_u16(buf, p.identifier);
    Ok(())
}

fn decode_introduction_response(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(IntroductionResponsePayload {
        destination: r.take_addr()?,
        source_lan: r.take_addr()?,
        source_wan: r.take_addr()?,
        lan_introduction: r.take_addr()?,
        wan_introduction: r.take_addr()?,
        identifier: r.take_u16()?,
    }))
}

fn encode_puncture_request(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<PunctureRequestPayload>(p)?;
    put_addr(buf, &p.lan_walker);
    put_addr(buf, &p.wan_walker);
    put_u16(buf, p.identifier);
    Ok(())
}

fn decode_puncture_request(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(PunctureRequestPayload {
        lan_walker: r.take_addr()?,
        wan_walker: r.take_addr()?,
        identifier: r.take_u16()?,
    }))
}

fn encode_puncture(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<PuncturePayload>(p)?;
    put_addr(buf, &p.source_lan);
    put_addr(buf, &p.source_wan);
    put_u16(buf, p.identifier);
    Ok(())
}

fn decode_puncture(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(PuncturePayload {
        source_lan: r.take_addr()?,
        source_wan: r.take_addr()?,
        identifier: r.take_u16()?,
    }))
}

fn encode_triplets(triplets: &[PermissionTriplet], buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    if triplets.len() > u8::MAX as usize {
        return Err(PolicyMismatch::new("too many permission triplets"));
    }
    buf.push(triplets.len() as u8);
    for triplet in triplets {
        if triplet.public_key.len() > u16::MAX as usize {
            return Err(PolicyMismatch::new("oversized public key in triplet"));
        }
        put_u16(buf, triplet.public_key.len() as u16);
        buf.extend_from_slice(&triplet.public_key);
        buf.push(triplet.meta_tag);
        buf.push(triplet.permission.database_value());
    }
    Ok(())
}

fn decode_triplets(r: &mut Reader<'_>) -> Result<Vec<PermissionTriplet>, DropPacket> {
    let count = r.take_u8()? as usize;
    let mut triplets = Vec::with_capacity(count);
    for _ in 0..count {
        let key_len = r.take_u16()? as usize;
        let public_key = r.take(key_len)?.to_vec();
        let meta_tag = r.take_u8()?;
        let permission = Permission::from_database_value(r.take_u8()?)
            .ok_or_else(|| DropPacket::new("unknown permission"))?;
        triplets.push(PermissionTriplet {
            public_key,
            meta_tag,
            permission,
        });
    }
    Ok(triplets)
}

fn encode_authorize(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    encode_triplets(&expected::<AuthorizePayload>(p)?.triplets, buf)
}

fn decode_authorize(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(AuthorizePayload {
        triplets: decode_triplets(r)?,
    }))
}

fn encode_revoke(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    encode_triplets(&expected::<RevokePayload>(p)?.triplets, buf)
}

fn decode_revoke(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(RevokePayload {
        triplets: decode_triplets(r)?,
    }))
}

fn encode_missing_proof(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<MissingProofPayload>(p)?;
    buf.extend_from_slice(p.mid.as_bytes());
    put_u64(buf, p.global_time);
    Ok(())
}

fn decode_missing_proof(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    Ok(Box::new(MissingProofPayload {
        mid: Mid(r.take_array::<20>()?),
        global_time: r.take_u64()?,
    }))
}

fn encode_missing_sequence(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<MissingSequencePayload>(p)?;
    buf.extend_from_slice(p.mid.as_bytes());
    buf.push(p.meta_tag);
    put_u32(buf, p.low);
    put_u32(buf, p.high);
    Ok(())
}

fn decode_missing_sequence(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    let mid = Mid(r.take_array::<20>()?);
    let meta_tag = r.take_u8()?;
    let low = r.take_u32()?;
    let high = r.take_u32()?;
    if low == 0 || low > high {
        return Err(DropPacket::new("invalid sequence range"));
    }
    Ok(Box::new(MissingSequencePayload {
        mid,
        meta_tag,
        low,
        high,
    }))
}

fn encode_dynamic_settings(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<DynamicSettingsPayload>(p)?;
    if p.switches.len() > u8::MAX as usize {
        return Err(PolicyMismatch::new("too many resolution switches"));
    }
    buf.push(p.switches.len() as u8);
    for (tag, index) in &p.switches {
        buf.push(*tag);
        buf.push(*index);
    }
    Ok(())
}

fn decode_dynamic_settings(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    let count = r.take_u8()? as usize;
    let mut switches = Vec::with_capacity(count);
    for _ in 0..count {
        switches.push((r.take_u8()?, r.take_u8()?));
    }
    Ok(Box::new(DynamicSettingsPayload { switches }))
}

fn encode_destroy(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<DestroyOverlayPayload>(p)?;
    buf.push(match p.degree {
        DestroyDegree::Soft => b's',
        DestroyDegree::Hard => b'h',
    });
    Ok(())
}

fn decode_destroy(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    let degree = match r.take_u8()? {
        b's' => DestroyDegree::Soft,
        b'h' => DestroyDegree::Hard,
        other => return Err(DropPacket::new(format!("unknown destroy degree {other:#04x}"))),
    };
    Ok(Box::new(DestroyOverlayPayload { degree }))
}

fn encode_signature_request(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<SignatureRequestPayload>(p)?;
    put_u16(buf, p.identifier);
    buf.extend_from_slice(&p.packet);
    Ok(())
}

fn decode_signature_request(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    let identifier = r.take_u16()?;
    let packet = r.take_rest().to_vec();
    if packet.is_empty() {
        return Err(DropPacket::new("empty embedded packet"));
    }
    Ok(Box::new(SignatureRequestPayload { identifier, packet }))
}

fn encode_signature_response(p: &dyn Payload, buf: &mut Vec<u8>) -> Result<(), PolicyMismatch> {
    let p = expected::<SignatureResponsePayload>(p)?;
    put_u16(buf, p.identifier);
    buf.extend_from_slice(&p.signature);
    Ok(())
}

fn decode_signature_response(r: &mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket> {
    let identifier = r.take_u16()?;
    let signature = r.take(64)?.to_vec();
    Ok(Box::new(SignatureResponsePayload {
        identifier,
        signature,
    }))
}

// ======================================================================
// handlers
// ======================================================================

/// Default check handler: consult the timeline at the message's global
/// time; missing proof delays the message.
pub fn check_timeline(scope: &mut HandlerScope<'_>, message: &Arc<Message>) -> Disposition {
    if scope.overlay.timeline().check(message).allowed {
        Disposition::Admit
    } else {
        Disposition::DelayByProof
    }
}

/// Queue a direct message from `my_member` onto the handler's outgoing
/// list.  Builtin direct metas are public, so no resolution state is
/// needed.
pub fn push_direct(
    scope: &mut HandlerScope<'_>,
    name: &str,
    payload: Box<dyn Payload>,
    targets: Vec<Arc<Member>>,
    to: Option<SocketAddr>,
) {
    let Some(meta) = scope.overlay.table().get(name).cloned() else {
        debug!("meta {name} not registered in this overlay");
        return;
    };
    let message = Message::new(
        meta,
        AuthenticationImpl::single(scope.overlay.my_member().clone()),
        ResolutionImpl::Public,
        DistributionImpl::new(scope.overlay.global_time()),
        DestinationImpl::Member { targets },
        payload,
    );
    match message {
        Ok(message) => scope.outgoing.push(Outgoing {
            message,
            to,
            store: false,
        }),
        Err(e) => warn!("failed to compose {name}: {e}"),
    }
}

fn as_v4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    }
}

pub fn on_identity(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    // The bin binding already taught the registry the key; remember which
    // address the member uses.
    for message in messages {
        if let Some(source) = message.source() {
            scope
                .overlay
                .candidates
                .get_or_insert(source)
                .associate(message.author().mid());
        }
    }
}

pub fn on_missing_identity(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(source) = message.source() else { continue };
        let Some(payload) = message.payload_as::<MissingIdentityPayload>() else {
            continue;
        };
        let Some(identity) = scope.overlay.table().get(IDENTITY) else {
            continue;
        };
        let cid = scope.overlay.cid();
        match scope
            .store
            .latest_packets(&cid, &payload.mid, identity.database_id(), 1)
        {
            Ok(packets) if !packets.is_empty() => {
                scope.events.push(EngineEvent::SendPackets {
                    to: source,
                    packets,
                });
            }
            Ok(_) => {}
            Err(e) => warn!("identity lookup failed: {e}"),
        }
    }
}

pub fn on_introduction_request(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(source) = message.source() else { continue };
        let now = scope.now;
        {
            let candidate = scope.overlay.candidates.get_or_insert(source);
            candidate.mark_stumble(now);
            candidate.associate(message.author().mid());
        }

        if scope.overlay.is_hard_killed() {
            // The shell's only answer is the destroy proof.
            if let Some(proof) = scope.overlay.destroy_proof() {
                scope.events.push(EngineEvent::SendPackets {
                    to: source,
                    packets: vec![proof.to_vec()],
                });
            }
            continue;
        }

        let Some(payload) = message.payload_as::<IntroductionRequestPayload>() else {
            continue;
        };
        let Some(source_v4) = as_v4(source) else { continue };

        let introduced = if payload.advice {
            scope.overlay.candidates.next_introduction(now, Some(source))
        } else {
            None
        };
        let introduced_v4 = introduced.and_then(as_v4).unwrap_or(UNSPECIFIED);

        let local = scope.local_addr;
        let response = IntroductionResponsePayload {
            destination: source_v4,
            source_lan: local,
            source_wan: local,
            lan_introduction: introduced_v4,
            wan_introduction: introduced_v4,
            identifier: payload.identifier,
        };
        push_direct(
            scope,
            INTRODUCTION_RESPONSE,
            Box::new(response),
            vec![message.author().clone()],
            Some(source),
        );

        if let Some(target) = introduced {
            let puncture = PunctureRequestPayload {
                lan_walker: source_v4,
                wan_walker: source_v4,
                identifier: payload.identifier,
            };
            push_direct(scope, PUNCTURE_REQUEST, Box::new(puncture), vec![], Some(target));
        }
    }
}

pub fn on_introduction_response(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let now = scope.now;
        if let Some(source) = message.source() {
            let candidate = scope.overlay.candidates.get_or_insert(source);
            candidate.mark_walk(now);
            candidate.associate(message.author().mid());
        }
        let Some(payload) = message.payload_as::<IntroductionResponsePayload>() else {
            continue;
        };
        for introduced in [payload.lan_introduction, payload.wan_introduction] {
            if introduced != UNSPECIFIED {
                scope
                    .overlay
                    .candidates
                    .get_or_insert(introduced.into())
                    .mark_intro(now);
            }
        }
    }
}

pub fn on_puncture_request(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(payload) = message.payload_as::<PunctureRequestPayload>() else {
            continue;
        };
        if payload.lan_walker == UNSPECIFIED {
            continue;
        }
        let local = scope.local_addr;
        let puncture = PuncturePayload {
            source_lan: local,
            source_wan: local,
            identifier: payload.identifier,
        };
        push_direct(
            scope,
            PUNCTURE,
            Box::new(puncture),
            vec![],
            Some(payload.lan_walker.into()),
        );
    }
}

pub fn on_puncture(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        if let Some(source) = message.source() {
            scope
                .overlay
                .candidates
                .get_or_insert(source)
                .mark_intro(scope.now);
        }
    }
}

fn check_grant(
    scope: &mut HandlerScope<'_>,
    message: &Arc<Message>,
    triplets: &[PermissionTriplet],
    revoking: bool,
) -> Disposition {
    let granter = message.author().mid();
    for triplet in triplets {
        let Some(meta) = scope.overlay.table().by_tag(triplet.meta_tag) else {
            return Disposition::Drop(DropMessage::new("grant names an unknown meta"));
        };
        let timeline = scope.overlay.timeline();
        let allowed = if revoking {
            timeline.may_revoke(granter, meta.database_id(), message.global_time())
        } else {
            timeline.may_authorize(granter, meta.database_id(), message.global_time())
        };
        if !allowed {
            return Disposition::DelayByProof;
        }
    }
    Disposition::Admit
}

pub fn check_authorize(scope: &mut HandlerScope<'_>, message: &Arc<Message>) -> Disposition {
    match message.payload_as::<AuthorizePayload>() {
        Some(payload) => check_grant(scope, message, &payload.triplets, false),
        None => Disposition::Drop(DropMessage::new("malformed authorize payload")),
    }
}

pub fn check_revoke(scope: &mut HandlerScope<'_>, message: &Arc<Message>) -> Disposition {
    match message.payload_as::<RevokePayload>() {
        Some(payload) => check_grant(scope, message, &payload.triplets, true),
        None => Disposition::Drop(DropMessage::new("malformed revoke payload")),
    }
}

fn resolve_triplets(
    scope: &mut HandlerScope<'_>,
    triplets: &[PermissionTriplet],
) -> Vec<(Mid, overmesh_core::meta::MetaId, Permission)> {
    let mut resolved = Vec::with_capacity(triplets.len());
    for triplet in triplets {
        let member = match scope.registry.get_or_create(&triplet.public_key) {
            Ok(member) => member,
            Err(e) => {
                warn!("grant names an invalid member: {e}");
                continue;
            }
        };
        let Some(meta) = scope.overlay.table().by_tag(triplet.meta_tag) else {
            continue;
        };
        resolved.push((member.mid(), meta.database_id(), triplet.permission));
    }
    resolved
}

pub fn on_authorize(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(payload) = message.payload_as::<AuthorizePayload>() else {
            continue;
        };
        let Some(packet) = message.packet().map(<[u8]>::to_vec) else {
            continue;
        };
        let triplets = resolve_triplets(scope, &payload.triplets);
        scope
            .overlay
            .timeline_mut()
            .authorize(&triplets, message.global_time(), &packet);
    }
    scope.events.push(EngineEvent::ReleaseProofDelayed {
        cid: scope.overlay.cid(),
    });
}

pub fn on_revoke(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(payload) = message.payload_as::<RevokePayload>() else {
            continue;
        };
        let Some(packet) = message.packet().map(<[u8]>::to_vec) else {
            continue;
        };
        let triplets = resolve_triplets(scope, &payload.triplets);
        scope
            .overlay
            .timeline_mut()
            .revoke(&triplets, message.global_time(), &packet);
    }
}

pub fn on_missing_proof(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(source) = message.source() else { continue };
        let Some(payload) = message.payload_as::<MissingProofPayload>() else {
            continue;
        };
        let cid = scope.overlay.cid();
        let rows = match scope
            .store
            .packets_by_member_at(&cid, &payload.mid, payload.global_time)
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("proof lookup failed: {e}");
                continue;
            }
        };
        let mut proofs: Vec<Vec<u8>> = Vec::new();
        for (meta_id, _) in rows {
            for proof in scope
                .overlay
                .timeline()
                .proofs_for(payload.mid, meta_id, payload.global_time)
            {
                if !proofs.contains(&proof) {
                    proofs.push(proof);
                }
            }
        }
        if !proofs.is_empty() {
            scope.events.push(EngineEvent::SendPackets {
                to: source,
                packets: proofs,
            });
        }
    }
}

pub fn on_missing_sequence(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(source) = message.source() else { continue };
        let Some(payload) = message.payload_as::<MissingSequencePayload>() else {
            continue;
        };
        let Some(meta) = scope.overlay.table().by_tag(payload.meta_tag) else {
            continue;
        };
        let cid = scope.overlay.cid();
        match scope.store.packets_for_sequence(
            &cid,
            &payload.mid,
            meta.database_id(),
            payload.low,
            payload.high,
        ) {
            Ok(packets) if !packets.is_empty() => {
                scope.events.push(EngineEvent::SendPackets {
                    to: source,
                    packets,
                });
            }
            Ok(_) => {}
            Err(e) => warn!("sequence lookup failed: {e}"),
        }
    }
}

pub fn on_dynamic_settings(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(payload) = message.payload_as::<DynamicSettingsPayload>() else {
            continue;
        };
        let Some(packet) = message.packet().map(<[u8]>::to_vec) else {
            continue;
        };
        let mut switches = Vec::with_capacity(payload.switches.len());
        for (tag, index) in &payload.switches {
            let Some(meta) = scope.overlay.table().by_tag(*tag) else {
                continue;
            };
            if (*index as usize) < meta.resolution().variants().len() {
                switches.push((meta.database_id(), *index));
            }
        }
        scope
            .overlay
            .timeline_mut()
            .apply_dynamic_settings(&switches, message.global_time(), &packet);
    }
    scope.events.push(EngineEvent::ReleaseProofDelayed {
        cid: scope.overlay.cid(),
    });
}

pub fn on_destroy_overlay(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(payload) = message.payload_as::<DestroyOverlayPayload>() else {
            continue;
        };
        let Some(packet) = message.packet().map(<[u8]>::to_vec) else {
            continue;
        };
        scope.events.push(EngineEvent::HardKill {
            cid: scope.overlay.cid(),
            degree: payload.degree,
            proof: packet,
            source: message.source(),
        });
    }
}

pub fn on_signature_request(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(source) = message.source() else { continue };
        let Some(payload) = message.payload_as::<SignatureRequestPayload>() else {
            continue;
        };

        let Ok(version) = peek_conversion_version(&payload.packet) else {
            continue;
        };
        let Some(conversion) = scope.overlay.conversion_for(version) else {
            continue;
        };
        let embedded =
            match conversion.decode(scope.overlay.table(), scope.registry, &payload.packet, None) {
                Ok(embedded) => embedded,
                Err(e) => {
                    debug!("undecodable co-sign request: {e}");
                    continue;
                }
            };

        let Authentication::DoubleMember {
            allow_signature, ..
        } = embedded.meta().authentication()
        else {
            continue;
        };
        let AuthenticationImpl::Double { members, .. } = embedded.authentication() else {
            continue;
        };
        if members[1].mid() != scope.overlay.my_member().mid() {
            debug!("co-sign request for a different member");
            continue;
        }
        if !allow_signature(&embedded) {
            debug!("co-sign request refused");
            continue;
        }

        let signed = match countersign_packet(&payload.packet, scope.overlay.my_member()) {
            Ok(signed) => signed,
            Err(e) => {
                warn!("countersign failed: {e}");
                continue;
            }
        };
        let signature = signed[signed.len() - 64..].to_vec();
        let response = SignatureResponsePayload {
            identifier: payload.identifier,
            signature,
        };
        let requester = embedded.author().clone();
        push_direct(
            scope,
            SIGNATURE_RESPONSE,
            Box::new(response),
            vec![requester],
            Some(source),
        );
    }
}

pub fn on_signature_response(scope: &mut HandlerScope<'_>, messages: &[Arc<Message>]) {
    for message in messages {
        let Some(payload) = message.payload_as::<SignatureResponsePayload>() else {
            continue;
        };
        scope.events.push(EngineEvent::SignatureResponse {
            cid: scope.overlay.cid(),
            identifier: payload.identifier,
            signature: payload.signature.clone(),
        });
    }
}

// ======================================================================
// the definition table
// ======================================================================

fn handlers(
    check: fn(&mut HandlerScope<'_>, &Arc<Message>) -> Disposition,
    on_accept: fn(&mut HandlerScope<'_>, &[Arc<Message>]),
) -> MetaHandlers {
    MetaHandlers {
        check: Arc::new(check),
        on_accept: Arc::new(on_accept),
        undo: None,
    }
}

fn direct_def(
    name: &'static str,
    tag: u8,
    encode: fn(&dyn Payload, &mut Vec<u8>) -> Result<(), PolicyMismatch>,
    decode: fn(&mut Reader<'_>) -> Result<Box<dyn Payload>, DropPacket>,
    on_accept: fn(&mut HandlerScope<'_>, &[Arc<Message>]),
) -> MetaDef {
    MetaDef {
        name,
        tag,
        authentication: Authentication::member(KeyEncoding::Sha1),
        resolution: Resolution::Public,
        distribution: Distribution::Direct,
        destination: Destination::Member,
        codec: Box::new(FnCodec { encode, decode }),
        handlers: handlers(check_timeline, on_accept),
    }
}

/// The full built-in meta set.  Trackers register the subset returned by
/// [`tracker_meta_defs`] instead.
pub fn default_meta_defs() -> Vec<MetaDef> {
    let mut defs = vec![MetaDef {
        name: IDENTITY,
        tag: 1,
        authentication: Authentication::member(KeyEncoding::Bin),
        resolution: Resolution::Public,
        // Below the sync floor: identities are pulled via missing-identity.
        distribution: Distribution::LastSync {
            direction: Direction::Ascending,
            priority: 16,
            history_size: 1,
            pruning: overmesh_core::distribution::Pruning::None,
        },
        destination: Destination::Community { node_count: 10 },
        codec: Box::new(FnCodec {
            encode: encode_empty,
            decode: decode_empty,
        }),
        handlers: handlers(check_timeline, on_identity),
    }];
    defs.push(direct_def(
        MISSING_IDENTITY,
        2,
        encode_missing_identity,
        decode_missing_identity,
        on_missing_identity,
    ));
    defs.push(direct_def(
        INTRODUCTION_REQUEST,
        3,
        encode_introduction_request,
        decode_introduction_request,
        on_introduction_request,
    ));
    defs.push(direct_def(
        INTRODUCTION_RESPONSE,
        4,
        encode_introduction_response,
        decode_introduction_response,
        on_introduction_response,
    ));
    defs.push(direct_def(
        PUNCTURE_REQUEST,
        5,
        encode_puncture_request,
        decode_puncture_request,
        on_puncture_request,
    ));
    defs.push(direct_def(
        PUNCTURE,
        6,
        encode_puncture,
        decode_puncture,
        on_puncture,
    ));
    defs.push(MetaDef {
        name: AUTHORIZE,
        tag: 7,
        authentication: Authentication::member(KeyEncoding::Sha1),
        resolution: Resolution::Linear,
        distribution: Distribution::full_sync(Direction::Ascending, 224, true),
        destination: Destination::Community { node_count: 10 },
        codec: Box::new(FnCodec {
            encode: encode_authorize,
            decode: decode_authorize,
        }),
        handlers: handlers(check_authorize, on_authorize),
    });
    defs.push(MetaDef {
        name: REVOKE,
        tag: 8,
        authentication: Authentication::member(KeyEncoding::Sha1),
        resolution: Resolution::Linear,
        distribution: Distribution::full_sync(Direction::Ascending, 224, true),
        destination: Destination::Community { node_count: 10 },
        codec: Box::new(FnCodec {
            encode: encode_revoke,
            decode: decode_revoke,
        }),
        handlers: handlers(check_revoke, on_revoke),
    });
    defs.push(direct_def(
        MISSING_PROOF,
        9,
        encode_missing_proof,
        decode_missing_proof,
        on_missing_proof,
    ));
    defs.push(direct_def(
        MISSING_SEQUENCE,
        10,
        encode_missing_sequence,
        decode_missing_sequence,
        on_missing_sequence,
    ));
    defs.push(MetaDef {
        name: DYNAMIC_SETTINGS,
        tag: 11,
        authentication: Authentication::member(KeyEncoding::Sha1),
        resolution: Resolution::Linear,
        distribution: Distribution::full_sync(Direction::Ascending, 191, false),
        destination: Destination::Community { node_count: 10 },
        codec: Box::new(FnCodec {
            encode: encode_dynamic_settings,
            decode: decode_dynamic_settings,
        }),
        handlers: handlers(check_timeline, on_dynamic_settings),
    });
    defs.push(MetaDef {
        name: DESTROY_OVERLAY,
        tag: 12,
        authentication: Authentication::member(KeyEncoding::Sha1),
        resolution: Resolution::Linear,
        distribution: Distribution::full_sync(Direction::Ascending, 192, false),
        destination: Destination::Community { node_count: 10 },
        codec: Box::new(FnCodec {
            encode: encode_destroy,
            decode: decode_destroy,
        }),
        handlers: handlers(check_timeline, on_destroy_overlay),
    });
    defs.push(direct_def(
        SIGNATURE_REQUEST,
        13,
        encode_signature_request,
        decode_signature_request,
        on_signature_request,
    ));
    defs.push(direct_def(
        SIGNATURE_RESPONSE,
        14,
        encode_signature_response,
        decode_signature_response,
        on_signature_response,
    ));
    defs
}

/// The rendezvous subset a tracker loads: candidate exchange, identity,
/// permission management, missing-proof service, and destruction.
pub fn tracker_meta_defs() -> Vec<MetaDef> {
    let keep = [
        INTRODUCTION_REQUEST,
        INTRODUCTION_RESPONSE,
        PUNCTURE_REQUEST,
        PUNCTURE,
        IDENTITY,
        MISSING_IDENTITY,
        AUTHORIZE,
        REVOKE,
        MISSING_PROOF,
        DESTROY_OVERLAY,
    ];
    default_meta_defs()
        .into_iter()
        .filter(|def| keep.contains(&def.name))
        .collect()
}
