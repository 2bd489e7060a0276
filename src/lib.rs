//! tinybureau library root.
//!
//! A runtime for autonomous agents: ed25519 identities, schema-validated
//! messages in signed envelopes, per-agent key/value storage, protocol
//! tables with reply contracts, and a bureau hosting many agents behind
//! one HTTP listener.

pub mod agent;
pub mod bureau;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod logging;
pub mod message;
pub mod protocol;
pub mod storage;
pub mod transport;
pub mod web;

pub use agent::{Agent, AgentManifest, AgentState, LifecycleEvent, SHUTDOWN, STARTUP};
pub use bureau::{Bureau, BureauState, RunningBureau};
pub use config::{load_settings, AgentConfig, BureauConfig, Settings, StorageConfig, StorageKind};
pub use context::Context;
pub use error::{Error, Result};
pub use identity::{Address, Identity, KeyMaterial};
pub use message::{Envelope, FieldKind, Model, Schema, SchemaDigest};
pub use protocol::{HandlerResult, Protocol, ProtocolManifest};
pub use storage::Storage;
pub use transport::{DeliveryStatus, Endpoint};
