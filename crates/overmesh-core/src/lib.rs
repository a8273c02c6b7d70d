//! Overmesh protocol core.
//!
//! This crate provides the pieces of the overlay protocol that carry no
//! I/O: member identity, the five policy axes composed into meta messages,
//! the binary packet codec, and the permission timeline.
//!
//! # Modules
//!
//! - [`member`]: members, MIDs/CIDs, and the member registry
//! - [`authentication`] / [`resolution`] / [`distribution`] / [`destination`]
//!   / [`payload`]: policy objects, one tagged enum per axis
//! - [`meta`] / [`message`]: meta messages and message implementations
//! - [`codec`]: the length-checked binary packet codec
//! - [`timeline`]: the permission state machine over logical time
//! - [`error`]: error kinds shared across the protocol

pub mod authentication;
pub mod codec;
pub mod destination;
pub mod distribution;
pub mod error;
pub mod member;
pub mod message;
pub mod meta;
pub mod payload;
pub mod resolution;
pub mod timeline;
pub mod wire;

pub use authentication::{Authentication, AuthenticationImpl, KeyEncoding};
pub use codec::{Conversion, DecodeError, BUILTIN_CONVERSION_VERSION, PROTOCOL_VERSION};
pub use destination::{Destination, DestinationImpl};
pub use distribution::{
    Direction, Distribution, DistributionImpl, PruneState, Pruning, MIN_SYNC_PRIORITY,
};
pub use error::{DropMessage, DropPacket, PolicyMismatch, StoreError};
pub use member::{Cid, KeyStrength, Member, MemberRegistry, MemberStore, Mid};
pub use message::Message;
pub use meta::{MessageTable, MetaId, MetaMessage};
pub use payload::{
    EmptyPayload, EmptyPayloadCodec, FnCodec, Payload, PayloadCodec, TextPayload, TextPayloadCodec,
};
pub use resolution::{Resolution, ResolutionImpl, ResolutionVariant};
pub use timeline::{CheckResult, Permission, Timeline};
