//! chanmux Protocol - Wire envelope for channel traffic
//!
//! This crate provides the envelope types exchanged between peers and the
//! server over one multiplexed connection, and the reserved type tags the
//! connection handles itself.

pub mod envelope;

pub use envelope::{is_reserved, Builtin, Envelope, EnvelopeError, InboundEnvelope};
