//! Message implementations: a concrete instance of a meta message.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::authentication::{Authentication, AuthenticationImpl};
use crate::destination::{Destination, DestinationImpl};
use crate::distribution::{Distribution, DistributionImpl};
use crate::error::PolicyMismatch;
use crate::member::Member;
use crate::meta::MetaMessage;
use crate::payload::{payload_as, Payload};
use crate::resolution::{Resolution, ResolutionImpl};

/// A concrete message: one variant per policy axis plus the decoded payload.
/// Once encoded, the immutable on-wire bytes are cached on the instance.
pub struct Message {
    meta: Arc<MetaMessage>,
    authentication: AuthenticationImpl,
    resolution: ResolutionImpl,
    distribution: DistributionImpl,
    destination: DestinationImpl,
    payload: Box<dyn Payload>,
    packet: OnceLock<Vec<u8>>,
    source: Option<SocketAddr>,
}

impl Message {
    /// Compose a message, validating the policy tuple against the meta.
    pub fn new(
        meta: Arc<MetaMessage>,
        authentication: AuthenticationImpl,
        resolution: ResolutionImpl,
        distribution: DistributionImpl,
        destination: DestinationImpl,
        payload: Box<dyn Payload>,
    ) -> Result<Self, PolicyMismatch> {
        match (meta.authentication(), &authentication) {
            (Authentication::Member { .. }, AuthenticationImpl::Single { .. }) => {}
            (Authentication::DoubleMember { .. }, AuthenticationImpl::Double { members, .. }) => {
                if members[0].mid() == members[1].mid() {
                    return Err(PolicyMismatch::new(
                        "double-member authentication needs two distinct members",
                    ));
                }
            }
            _ => {
                return Err(PolicyMismatch::new(format!(
                    "authentication implementation does not match meta {:?}",
                    meta.name()
                )))
            }
        }

        match (meta.resolution(), &resolution) {
            (Resolution::Public, ResolutionImpl::Public) => {}
            (Resolution::Linear, ResolutionImpl::Linear) => {}
            (Resolution::Dynamic { variants }, ResolutionImpl::Dynamic { index, variant }) => {
                if variants.get(*index as usize) != Some(variant) {
                    return Err(PolicyMismatch::new(
                        "dynamic resolution variant not in the declared set",
                    ));
                }
            }
            _ => {
                return Err(PolicyMismatch::new(format!(
                    "resolution implementation does not match meta {:?}",
                    meta.name()
                )))
            }
        }

        if distribution.global_time == 0 {
            return Err(PolicyMismatch::new("global time must be positive"));
        }
        match meta.distribution() {
            Distribution::FullSync {
                enable_sequence_number,
                ..
            } => {
                if *enable_sequence_number && distribution.sequence_number == 0 {
                    return Err(PolicyMismatch::new(
                        "sequence number required but not claimed",
                    ));
                }
                if !enable_sequence_number && distribution.sequence_number != 0 {
                    return Err(PolicyMismatch::new(
                        "sequence number claimed but not enabled",
                    ));
                }
            }
            _ => {
                if distribution.sequence_number != 0 {
                    return Err(PolicyMismatch::new(
                        "sequence number claimed but not enabled",
                    ));
                }
            }
        }

        // A member destination with no targets is legal: inbound messages
        // carry no target list (the destination is a local routing fact).
        match (meta.destination(), &destination) {
            (Destination::Community { .. }, DestinationImpl::Community) => {}
            (Destination::Member, DestinationImpl::Member { .. }) => {}
            _ => {
                return Err(PolicyMismatch::new(format!(
                    "destination implementation does not match meta {:?}",
                    meta.name()
                )))
            }
        }

        Ok(Self {
            meta,
            authentication,
            resolution,
            distribution,
            destination,
            payload,
            packet: OnceLock::new(),
            source: None,
        })
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn meta(&self) -> &Arc<MetaMessage> {
        &self.meta
    }

    pub fn name(&self) -> &str {
        self.meta.name()
    }

    pub fn authentication(&self) -> &AuthenticationImpl {
        &self.authentication
    }

    pub fn authentication_mut(&mut self) -> &mut AuthenticationImpl {
        &mut self.authentication
    }

    pub fn resolution(&self) -> &ResolutionImpl {
        &self.resolution
    }

    pub fn distribution(&self) -> &DistributionImpl {
        &self.distribution
    }

    pub fn destination(&self) -> &DestinationImpl {
        &self.destination
    }

    /// The message author (sole signer, or first of the pair).
    pub fn author(&self) -> &Arc<Member> {
        self.authentication.member()
    }

    pub fn global_time(&self) -> u64 {
        self.distribution.global_time
    }

    pub fn sequence_number(&self) -> u32 {
        self.distribution.sequence_number
    }

    pub fn payload(&self) -> &dyn Payload {
        self.payload.as_ref()
    }

    /// Typed payload access for handlers.
    pub fn payload_as<T: Payload>(&self) -> Option<&T> {
        payload_as::<T>(self.payload.as_ref())
    }

    /// The address this message arrived from, if it came off the wire.
    pub fn source(&self) -> Option<SocketAddr> {
        self.source
    }

    /// Cached wire bytes, set exactly once by the codec.
    pub fn packet(&self) -> Option<&[u8]> {
        self.packet.get().map(Vec::as_slice)
    }

    pub fn set_packet(&self, packet: Vec<u8>) {
        let _ = self.packet.set(packet);
    }

    /// Content hash of the wire bytes, used for deduplication.
    pub fn packet_hash(&self) -> Option<[u8; 32]> {
        self.packet().map(|bytes| *blake3::hash(bytes).as_bytes())
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("name", &self.meta.name())
            .field("author", &self.author().mid())
            .field("global_time", &self.distribution.global_time)
            .field("sequence_number", &self.distribution.sequence_number)
            .finish()
    }
}
