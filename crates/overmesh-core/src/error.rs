//! Error types shared across the Overmesh protocol core.

use thiserror::Error;

/// Malformed or unverifiable wire input.  The offending packet is discarded
/// and counted; it never reaches a handler.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("drop packet: {0}")]
pub struct DropPacket(pub String);

impl DropPacket {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Admissible wire input that a policy forbids (for example an introduction
/// request from a bootstrap peer at a tracker).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("drop message: {0}")]
pub struct DropMessage(pub String);

impl DropMessage {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Programmer error composing a message from policies that do not fit
/// together.  Fatal for the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("policy mismatch: {0}")]
pub struct PolicyMismatch(pub String);

impl PolicyMismatch {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Persistence failure.  Surfaced to the engine's exception hook; member and
/// packet writes are never silently dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("store error: {0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
