//! Networking primitives for the Overmesh overlay protocol.
//!
//! This crate provides:
//! - Candidate bookkeeping (walk/stumble/intro categories and liveness)
//! - The UDP endpoint with non-blocking sends and byte counters

pub mod candidate;
pub mod endpoint;

pub use candidate::{Candidate, CandidateKind, CandidateTable, Category};
pub use endpoint::{Endpoint, EndpointStats, NullEndpoint, RecordingEndpoint, UdpEndpoint};
