//! Message model for agent communication.
//!
//! - Data-described schemas with a stable digest used for dispatch
//! - The `Model` trait for typed messages validated against their schema
//! - Signed envelopes carrying encoded payloads between addresses

pub mod envelope;
pub mod schema;

pub use envelope::{Envelope, EnvelopeBuilder};
pub use schema::{Field, FieldKind, Model, Schema, SchemaBuilder, SchemaDigest};
