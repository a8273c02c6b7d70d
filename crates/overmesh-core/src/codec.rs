//! Binary packet codec.
//!
//! Wire layout of one packet:
//!
//! ```text
//! [0]      protocol version (0x00)
//! [1]      conversion version, registered per overlay
//! [2..22]  community id (CID)
//! [22]     meta message tag
//! ...      authentication binding (MID or length-prefixed key, x1 or x2)
//! ...      8-byte global time, then 4-byte sequence number when enabled
//! ...      resolution byte (dynamic metas only)
//! ...      payload
//! ...      64-byte Ed25519 signature(s), one per signer
//! ```
//!
//! Signatures cover all bytes before the signature block.  Every read is
//! bounds-checked; adversarial input yields [`DropPacket`], never a panic.

use std::net::SocketAddr;
use std::sync::Arc;

use ed25519_dalek::{Signature, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use thiserror::Error;

use crate::authentication::{Authentication, AuthenticationImpl, KeyEncoding};
use crate::destination::{Destination, DestinationImpl};
use crate::distribution::DistributionImpl;
use crate::error::{DropPacket, PolicyMismatch, StoreError};
use crate::member::{Cid, Member, MemberError, MemberRegistry, Mid};
use crate::message::Message;
use crate::meta::MessageTable;
use crate::resolution::{Resolution, ResolutionImpl};
use crate::wire::{put_u16, put_u32, put_u64, Reader};

/// Protocol version byte; the only one currently understood.
pub const PROTOCOL_VERSION: u8 = 0x00;

/// Conversion version of the built-in meta set.
pub const BUILTIN_CONVERSION_VERSION: u8 = 0x01;

/// Bytes before the authentication binding.
pub const HEADER_LEN: usize = 23;

/// Decode failure, translated by the engine into a drop (optionally paired
/// with an identity request) or an exception report.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error(transparent)]
    Drop(#[from] DropPacket),
    /// A SHA-1 binding named a member whose key we do not have; the packet
    /// cannot be verified until an identity packet arrives.
    #[error("unknown member {mid}")]
    UnknownMember { mid: Mid },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-overlay packet codec for one conversion version.
pub struct Conversion {
    cid: Cid,
    community_version: u8,
    verify_signatures: bool,
}

impl Conversion {
    pub fn new(cid: Cid, community_version: u8) -> Self {
        Self {
            cid,
            community_version,
            verify_signatures: true,
        }
    }

    /// Codec that skips signature verification.  Trackers relay for
    /// overlays whose member keys they never learn.
    pub fn without_verification(cid: Cid, community_version: u8) -> Self {
        Self {
            cid,
            community_version,
            verify_signatures: false,
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn community_version(&self) -> u8 {
        self.community_version
    }

    /// Encode `message`, signing with every member that holds a private key,
    /// and cache the bytes on the message.  Already-encoded messages return
    /// the cached packet.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, PolicyMismatch> {
        if let Some(packet) = message.packet() {
            return Ok(packet.to_vec());
        }

        let meta = message.meta().clone();
        let mut buf = Vec::with_capacity(128);
        buf.push(PROTOCOL_VERSION);
        buf.push(self.community_version);
        buf.extend_from_slice(self.cid.as_bytes());
        buf.push(meta.tag());

        let encoding = meta.authentication().encoding();
        for member in message.authentication().members() {
            encode_binding(&mut buf, member, encoding)?;
        }

        put_u64(&mut buf, message.global_time());
        if meta.distribution().enable_sequence_number() {
            put_u32(&mut buf, message.sequence_number());
        }

        if let Some(index) = message.resolution().index() {
            buf.push(index);
        }

        meta.codec().encode(message.payload(), &mut buf)?;

        // Signature block: sign with what we have, zero-fill the rest.  A
        // zero slot marks the message unsigned pending a countersign.
        let body_len = buf.len();
        match message.authentication() {
            AuthenticationImpl::Single { member, .. } => {
                let signature = member
                    .sign(&buf[..body_len])
                    .map_err(|e| PolicyMismatch::new(e.to_string()))?;
                buf.extend_from_slice(&signature.to_bytes());
            }
            AuthenticationImpl::Double {
                members,
                signatures,
            } => {
                for (member, existing) in members.iter().zip(signatures.iter()) {
                    if let Some(signature) = existing {
                        buf.extend_from_slice(&signature.to_bytes());
                    } else if member.has_private_key() {
                        let signature = member
                            .sign(&buf[..body_len])
                            .map_err(|e| PolicyMismatch::new(e.to_string()))?;
                        buf.extend_from_slice(&signature.to_bytes());
                    } else {
                        buf.extend_from_slice(&[0u8; SIGNATURE_LENGTH]);
                    }
                }
            }
        }

        message.set_packet(buf.clone());
        Ok(buf)
    }

    /// Decode one packet into a message implementation.
    pub fn decode(
        &self,
        table: &MessageTable,
        registry: &MemberRegistry,
        data: &[u8],
        source: Option<SocketAddr>,
    ) -> Result<Message, DecodeError> {
        let mut reader = Reader::new(data);

        let version = reader.take_u8()?;
        if version != PROTOCOL_VERSION {
            return Err(DropPacket::new(format!("unknown protocol version {version:#04x}")).into());
        }
        let community_version = reader.take_u8()?;
        if community_version != self.community_version {
            return Err(DropPacket::new(format!(
                "unknown conversion version {community_version:#04x}"
            ))
            .into());
        }
        let cid = Cid(reader.take_array::<20>()?);
        if cid != self.cid {
            return Err(DropPacket::new("community id mismatch").into());
        }

        let tag = reader.take_u8()?;
        let meta = table
            .by_tag(tag)
            .ok_or_else(|| DropPacket::new(format!("unknown message tag {tag}")))?
            .clone();

        let encoding = meta.authentication().encoding();
        let authentication = match meta.authentication() {
            Authentication::Member { .. } => {
                let member = self.decode_binding(&mut reader, registry, encoding)?;
                AuthenticationImpl::Single {
                    member,
                    signature: None,
                }
            }
            Authentication::DoubleMember { .. } => {
                let first = self.decode_binding(&mut reader, registry, encoding)?;
                let second = self.decode_binding(&mut reader, registry, encoding)?;
                if first.mid() == second.mid() {
                    return Err(DropPacket::new("double-member binding repeats a member").into());
                }
                AuthenticationImpl::Double {
                    members: [first, second],
                    signatures: [None, None],
                }
            }
        };

        let global_time = reader.take_u64()?;
        if global_time == 0 {
            return Err(DropPacket::new("zero global time").into());
        }
        let sequence_number = if meta.distribution().enable_sequence_number() {
            let sequence = reader.take_u32()?;
            if sequence == 0 {
                return Err(DropPacket::new("zero sequence number").into());
            }
            sequence
        } else {
            0
        };

        let resolution = match meta.resolution() {
            Resolution::Public => ResolutionImpl::Public,
            Resolution::Linear => ResolutionImpl::Linear,
            Resolution::Dynamic { .. } => {
                let index = reader.take_u8()?;
                ResolutionImpl::dynamic(meta.resolution(), index)
                    .map_err(|e| DropPacket::new(e.to_string()))?
            }
        };

        // Everything between here and the signature block is payload.
        let signature_len = meta.authentication().signature_count() * SIGNATURE_LENGTH;
        let payload_end = data
            .len()
            .checked_sub(signature_len)
            .filter(|end| *end >= reader.offset())
            .ok_or_else(|| DropPacket::new("insufficient packet size for signatures"))?;
        let mut payload_reader = Reader::new(&data[reader.offset()..payload_end]);
        let payload = meta.codec().decode(&mut payload_reader)?;
        if !payload_reader.is_empty() {
            return Err(DropPacket::new("trailing payload bytes").into());
        }

        let body = &data[..payload_end];
        let mut authentication = authentication;
        self.decode_signatures(&mut authentication, body, &data[payload_end..])?;

        let destination = match meta.destination() {
            Destination::Community { .. } => DestinationImpl::Community,
            Destination::Member => DestinationImpl::Member { targets: vec![] },
        };

        let message = Message::new(
            meta,
            authentication,
            resolution,
            DistributionImpl {
                global_time,
                sequence_number,
            },
            destination,
            payload,
        )
        .map_err(|e| DropPacket::new(e.to_string()))?;
        message.set_packet(data.to_vec());

        Ok(match source {
            Some(addr) => message.with_source(addr),
            None => message,
        })
    }

    fn decode_binding(
        &self,
        reader: &mut Reader<'_>,
        registry: &MemberRegistry,
        encoding: KeyEncoding,
    ) -> Result<Arc<Member>, DecodeError> {
        match encoding {
            KeyEncoding::Sha1 => {
                let mid = Mid(reader.take_array::<20>()?);
                let member = registry.get_by_mid(&mid);
                if member.is_dummy() && self.verify_signatures {
                    return Err(DecodeError::UnknownMember { mid });
                }
                Ok(member)
            }
            KeyEncoding::Bin => {
                let len = reader.take_u16()? as usize;
                if len != PUBLIC_KEY_LENGTH {
                    return Err(
                        DropPacket::new(format!("unsupported public key length {len}")).into(),
                    );
                }
                let key_bytes = reader.take(len)?;
                registry.get_or_create(key_bytes).map_err(|e| match e {
                    MemberError::Store(e) => DecodeError::Store(e),
                    other => DropPacket::new(other.to_string()).into(),
                })
            }
        }
    }

    fn decode_signatures(
        &self,
        authentication: &mut AuthenticationImpl,
        body: &[u8],
        block: &[u8],
    ) -> Result<(), DecodeError> {
        let members: Vec<Arc<Member>> = authentication.members().into_iter().cloned().collect();
        for (slot, member) in members.iter().enumerate() {
            let mut bytes = [0u8; SIGNATURE_LENGTH];
            bytes.copy_from_slice(&block[slot * SIGNATURE_LENGTH..(slot + 1) * SIGNATURE_LENGTH]);
            if bytes == [0u8; SIGNATURE_LENGTH] {
                // An empty slot is only meaningful while a countersign is
                // pending; the author's own slot must always be filled.
                if slot == 0 && self.verify_signatures {
                    return Err(DropPacket::new("missing author signature").into());
                }
                continue;
            }
            let signature = Signature::from_bytes(&bytes);
            if self.verify_signatures && !member.verify(body, &signature) {
                return Err(DropPacket::new("invalid signature").into());
            }
            authentication.set_signature(slot, signature);
        }
        Ok(())
    }
}

fn encode_binding(
    buf: &mut Vec<u8>,
    member: &Arc<Member>,
    encoding: KeyEncoding,
) -> Result<(), PolicyMismatch> {
    match encoding {
        KeyEncoding::Sha1 => {
            buf.extend_from_slice(member.mid().as_bytes());
            Ok(())
        }
        KeyEncoding::Bin => {
            let key = member.public_key_bytes().ok_or_else(|| {
                PolicyMismatch::new("cannot encode a key binding for a dummy member")
            })?;
            put_u16(buf, key.len() as u16);
            buf.extend_from_slice(&key);
            Ok(())
        }
    }
}

/// True when every signature slot at the packet tail is non-zero.  Unsigned
/// double-member messages may not be stored or forwarded.
pub fn is_fully_signed(packet: &[u8], signature_count: usize) -> bool {
    let block_len = signature_count * SIGNATURE_LENGTH;
    if packet.len() < block_len {
        return false;
    }
    let block = &packet[packet.len() - block_len..];
    block
        .chunks(SIGNATURE_LENGTH)
        .all(|chunk| chunk.iter().any(|b| *b != 0))
}

/// Replace the second signature slot with `signer`'s signature over the
/// packet body.  Used to answer a signature request.
pub fn countersign_packet(packet: &[u8], signer: &Arc<Member>) -> Result<Vec<u8>, DropPacket> {
    let double_block = 2 * SIGNATURE_LENGTH;
    if packet.len() <= double_block {
        return Err(DropPacket::new("packet too short to countersign"));
    }
    let body_end = packet.len() - double_block;
    let signature = signer
        .sign(&packet[..body_end])
        .map_err(|e| DropPacket::new(e.to_string()))?;
    let mut out = packet[..packet.len() - SIGNATURE_LENGTH].to_vec();
    out.extend_from_slice(&signature.to_bytes());
    Ok(out)
}

/// Extract the CID from a raw packet without decoding it.
pub fn peek_cid(packet: &[u8]) -> Result<Cid, DropPacket> {
    if packet.len() < HEADER_LEN {
        return Err(DropPacket::new("packet shorter than header"));
    }
    let mut cid = [0u8; 20];
    cid.copy_from_slice(&packet[2..22]);
    Ok(Cid(cid))
}

/// Extract the conversion version byte from a raw packet.
pub fn peek_conversion_version(packet: &[u8]) -> Result<u8, DropPacket> {
    if packet.len() < HEADER_LEN {
        return Err(DropPacket::new("packet shorter than header"));
    }
    Ok(packet[1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{Direction, Distribution};
    use crate::member::{KeyStrength, MemoryMemberStore};
    use crate::meta::MetaMessage;
    use crate::payload::{TextPayload, TextPayloadCodec};
    use crate::resolution::ResolutionVariant;

    fn registry() -> MemberRegistry {
        MemberRegistry::new(Arc::new(MemoryMemberStore::default())).unwrap()
    }

    fn test_table(cid: Cid) -> (MessageTable, Conversion) {
        let mut table = MessageTable::new();
        table
            .register(
                MetaMessage::new(
                    "text",
                    1,
                    1,
                    Authentication::member(KeyEncoding::Sha1),
                    Resolution::Public,
                    Distribution::full_sync(Direction::Ascending, 128, false),
                    Destination::Community { node_count: 10 },
                    Box::new(TextPayloadCodec),
                )
                .unwrap(),
            )
            .unwrap();
        table
            .register(
                MetaMessage::new(
                    "sequence-text",
                    2,
                    2,
                    Authentication::member(KeyEncoding::Sha1),
                    Resolution::Public,
                    Distribution::full_sync(Direction::Ascending, 128, true),
                    Destination::Community { node_count: 10 },
                    Box::new(TextPayloadCodec),
                )
                .unwrap(),
            )
            .unwrap();
        table
            .register(
                MetaMessage::new(
                    "keyed-text",
                    3,
                    3,
                    Authentication::member(KeyEncoding::Bin),
                    Resolution::Public,
                    Distribution::full_sync(Direction::Ascending, 128, false),
                    Destination::Community { node_count: 10 },
                    Box::new(TextPayloadCodec),
                )
                .unwrap(),
            )
            .unwrap();
        table
            .register(
                MetaMessage::new(
                    "dynamic-text",
                    4,
                    4,
                    Authentication::member(KeyEncoding::Sha1),
                    Resolution::dynamic(vec![
                        ResolutionVariant::Public,
                        ResolutionVariant::Linear,
                    ])
                    .unwrap(),
                    Distribution::full_sync(Direction::Ascending, 128, false),
                    Destination::Community { node_count: 10 },
                    Box::new(TextPayloadCodec),
                )
                .unwrap(),
            )
            .unwrap();
        (table, Conversion::new(cid, BUILTIN_CONVERSION_VERSION))
    }

    fn text_message(
        table: &MessageTable,
        name: &str,
        member: Arc<Member>,
        global_time: u64,
        sequence: u32,
        text: &str,
    ) -> Message {
        let meta = table.get(name).unwrap().clone();
        let resolution = match meta.resolution() {
            Resolution::Dynamic { .. } => ResolutionImpl::dynamic(meta.resolution(), 1).unwrap(),
            Resolution::Linear => ResolutionImpl::Linear,
            Resolution::Public => ResolutionImpl::Public,
        };
        Message::new(
            meta,
            AuthenticationImpl::single(member),
            resolution,
            DistributionImpl {
                global_time,
                sequence_number: sequence,
            },
            DestinationImpl::Community,
            Box::new(TextPayload::new(text)),
        )
        .unwrap()
    }

    #[test]
    fn test_roundtrip_sha1() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "text", member.clone(), 42, 0, "hello");
        let packet = conversion.encode(&message).unwrap();

        let decoded = conversion.decode(&table, &registry, &packet, None).unwrap();
        assert_eq!(decoded.name(), "text");
        assert_eq!(decoded.global_time(), 42);
        assert_eq!(decoded.author().mid(), member.mid());
        assert_eq!(
            decoded.payload_as::<TextPayload>().unwrap().text,
            "hello"
        );
        assert_eq!(decoded.packet().unwrap(), packet.as_slice());
    }

    #[test]
    fn test_roundtrip_sequence_number() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "sequence-text", member, 9, 3, "ordered");
        let packet = conversion.encode(&message).unwrap();
        let decoded = conversion.decode(&table, &registry, &packet, None).unwrap();
        assert_eq!(decoded.sequence_number(), 3);
    }

    #[test]
    fn test_bin_encoding_teaches_key() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "keyed-text", member.clone(), 5, 0, "identity");
        let packet = conversion.encode(&message).unwrap();

        // A fresh registry has never seen this member; the bin binding
        // carries the key and creates it.
        let stranger = self::registry();
        let decoded = conversion
            .decode(&table, &stranger, &packet, None)
            .unwrap();
        assert_eq!(decoded.author().mid(), member.mid());
        assert!(!stranger.get_by_mid(&member.mid()).is_dummy());
    }

    #[test]
    fn test_sha1_unknown_member() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "text", member.clone(), 5, 0, "who");
        let packet = conversion.encode(&message).unwrap();

        let stranger = self::registry();
        match conversion.decode(&table, &stranger, &packet, None) {
            Err(DecodeError::UnknownMember { mid }) => assert_eq!(mid, member.mid()),
            other => panic!("expected unknown member, got {other:?}"),
        }
    }

    #[test]
    fn test_dynamic_resolution_byte() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "dynamic-text", member, 5, 0, "policy");
        let packet = conversion.encode(&message).unwrap();
        let decoded = conversion.decode(&table, &registry, &packet, None).unwrap();
        assert_eq!(decoded.resolution().index(), Some(1));
        assert_eq!(decoded.resolution().variant(), ResolutionVariant::Linear);

        // An out-of-range index must drop, not panic.
        let resolution_offset = HEADER_LEN + 20 + 8;
        let mut bad = packet.clone();
        bad[resolution_offset] = 9;
        assert!(conversion.decode(&table, &registry, &bad, None).is_err());
    }

    #[test]
    fn test_tampered_packet_drops() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "text", member, 42, 0, "signed");
        let mut packet = conversion.encode(&message).unwrap();
        // Flip the low global-time byte: still structurally valid, but the
        // signature no longer covers the bytes.
        let global_time_low = HEADER_LEN + 20 + 7;
        packet[global_time_low] ^= 0xff;
        match conversion.decode(&table, &registry, &packet, None) {
            Err(DecodeError::Drop(e)) => assert!(e.0.contains("signature"), "{e}"),
            other => panic!("expected drop, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_tag_drops() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "text", member, 42, 0, "x");
        let mut packet = conversion.encode(&message).unwrap();
        packet[22] = 0xee;
        assert!(conversion.decode(&table, &registry, &packet, None).is_err());
    }

    #[test]
    fn test_truncation_never_panics() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "sequence-text", member, 42, 1, "truncate me");
        let packet = conversion.encode(&message).unwrap();
        for len in 0..packet.len() {
            assert!(
                conversion
                    .decode(&table, &registry, &packet[..len], None)
                    .is_err(),
                "truncated packet of {len} bytes must not decode"
            );
        }
    }

    #[test]
    fn test_peek_helpers() {
        let registry = registry();
        let member = registry.new_random(KeyStrength::Medium).unwrap();
        let cid = Cid([7; 20]);
        let (table, conversion) = test_table(cid);

        let message = text_message(&table, "text", member, 1, 0, "peek");
        let packet = conversion.encode(&message).unwrap();
        assert_eq!(peek_cid(&packet).unwrap(), cid);
        assert_eq!(
            peek_conversion_version(&packet).unwrap(),
            BUILTIN_CONVERSION_VERSION
        );
        assert!(peek_cid(&packet[..10]).is_err());
    }
}
