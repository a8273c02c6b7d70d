//! Meta messages and the per-overlay message table.

use std::collections::HashMap;
use std::sync::Arc;

use crate::authentication::Authentication;
use crate::destination::Destination;
use crate::distribution::Distribution;
use crate::error::PolicyMismatch;
use crate::payload::PayloadCodec;
use crate::resolution::Resolution;

/// Database id of a registered meta message, stable across reloads of the
/// same overlay.
pub type MetaId = u16;

/// Immutable composition of one policy per axis plus the payload codec.
/// Registered once at overlay construction.
pub struct MetaMessage {
    name: String,
    tag: u8,
    database_id: MetaId,
    authentication: Authentication,
    resolution: Resolution,
    distribution: Distribution,
    destination: Destination,
    codec: Box<dyn PayloadCodec>,
}

impl MetaMessage {
    pub fn new(
        name: impl Into<String>,
        tag: u8,
        database_id: MetaId,
        authentication: Authentication,
        resolution: Resolution,
        distribution: Distribution,
        destination: Destination,
        codec: Box<dyn PayloadCodec>,
    ) -> Result<Self, PolicyMismatch> {
        let name = name.into();
        if name.is_empty() {
            return Err(PolicyMismatch::new("meta message name must not be empty"));
        }
        // A claimed sequence number may go unused when a co-signer refuses,
        // which would leave a hole in the dense sequence.
        if authentication.is_double() && distribution.enable_sequence_number() {
            return Err(PolicyMismatch::new(
                "double-member authentication cannot combine with sequence numbers",
            ));
        }
        Ok(Self {
            name,
            tag,
            database_id,
            authentication,
            resolution,
            distribution,
            destination,
            codec,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wire tag dispatching this meta within its conversion.
    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn database_id(&self) -> MetaId {
        self.database_id
    }

    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    pub fn distribution(&self) -> &Distribution {
        &self.distribution
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.codec.as_ref()
    }

    /// Sync priority; `None` for direct distribution.
    pub fn priority(&self) -> Option<u8> {
        self.distribution.priority()
    }
}

impl std::fmt::Debug for MetaMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaMessage")
            .field("name", &self.name)
            .field("tag", &self.tag)
            .field("database_id", &self.database_id)
            .finish()
    }
}

/// Per-overlay registry: unique name and unique wire tag, each mapping to a
/// meta in O(1).
#[derive(Default)]
pub struct MessageTable {
    by_name: HashMap<String, Arc<MetaMessage>>,
    by_tag: HashMap<u8, Arc<MetaMessage>>,
    by_id: HashMap<MetaId, Arc<MetaMessage>>,
}

impl MessageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-shot registration at overlay construction.
    pub fn register(&mut self, meta: MetaMessage) -> Result<Arc<MetaMessage>, PolicyMismatch> {
        if self.by_name.contains_key(meta.name()) {
            return Err(PolicyMismatch::new(format!(
                "duplicate meta message name {:?}",
                meta.name()
            )));
        }
        if self.by_tag.contains_key(&meta.tag()) {
            return Err(PolicyMismatch::new(format!(
                "duplicate meta message tag {}",
                meta.tag()
            )));
        }
        let meta = Arc::new(meta);
        self.by_name.insert(meta.name().to_string(), meta.clone());
        self.by_tag.insert(meta.tag(), meta.clone());
        self.by_id.insert(meta.database_id(), meta.clone());
        Ok(meta)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<MetaMessage>> {
        self.by_name.get(name)
    }

    pub fn by_tag(&self, tag: u8) -> Option<&Arc<MetaMessage>> {
        self.by_tag.get(&tag)
    }

    pub fn by_id(&self, id: MetaId) -> Option<&Arc<MetaMessage>> {
        self.by_id.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MetaMessage>> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
