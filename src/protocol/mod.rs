//! Protocols: closed tables mapping schema digests to handlers.
//!
//! A protocol carries `(name, version)` and, for each request schema, the
//! reply schemas it is expected to produce. Reply declarations are advisory:
//! sending an undeclared reply type only emits a warning.

pub mod handler;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::message::{Model, Schema, SchemaDigest};

pub use handler::{handler, task, typed, HandlerResult, MessageHandler, TaskHandler};

/// Textual prefix of protocol digests.
pub const PROTOCOL_DIGEST_PREFIX: &str = "proto:";

/// One request type, its handler and the reply types it may produce.
#[derive(Clone)]
pub struct Interaction {
    pub schema: Schema,
    pub handler: Arc<dyn MessageHandler>,
    pub replies: Vec<Schema>,
}

/// Named, versioned handler table.
#[derive(Clone)]
pub struct Protocol {
    name: String,
    version: String,
    interactions: BTreeMap<SchemaDigest, Interaction>,
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("schemas", &self.interactions.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Protocol {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            interactions: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Register `handler` for `schema`. A second handler for the same digest is a conflict.
    pub fn register(
        &mut self,
        schema: Schema,
        handler: Arc<dyn MessageHandler>,
        replies: impl IntoIterator<Item = Schema>,
    ) -> Result<()> {
        let digest = schema.digest();
        if self.interactions.contains_key(&digest) {
            return Err(self.conflict(&schema));
        }
        self.interactions.insert(
            digest,
            Interaction {
                schema,
                handler,
                replies: replies.into_iter().collect(),
            },
        );
        Ok(())
    }

    /// Register a typed handler for `M`.
    pub fn on<M, F, Fut>(&mut self, replies: Vec<Schema>, f: F) -> Result<()>
    where
        M: Model,
        F: Fn(Context, Address, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(M::schema(), typed::<M, F, Fut>(f), replies)
    }

    /// Combine two tables. Fails without merging anything if any digest collides.
    pub fn merge(&self, other: &Protocol) -> Result<Protocol> {
        if let Some(interaction) = other
            .interactions
            .values()
            .find(|i| self.interactions.contains_key(&i.schema.digest()))
        {
            return Err(self.conflict(&interaction.schema));
        }

        let mut merged = self.clone();
        merged
            .interactions
            .extend(other.interactions.iter().map(|(d, i)| (*d, i.clone())));
        Ok(merged)
    }

    fn conflict(&self, schema: &Schema) -> Error {
        Error::ProtocolConflict {
            protocol: self.name.clone(),
            digest: format!("{} ({})", schema.digest(), schema.name()),
        }
    }

    pub fn handler_for(&self, digest: &SchemaDigest) -> Option<&Interaction> {
        self.interactions.get(digest)
    }

    pub fn digests(&self) -> impl Iterator<Item = &SchemaDigest> {
        self.interactions.keys()
    }

    pub fn declared_replies(&self, request: &SchemaDigest) -> Option<&[Schema]> {
        self.interactions.get(request).map(|i| i.replies.as_slice())
    }

    /// Whether `reply` may answer `request`. Requests without declared replies accept anything.
    pub fn is_valid_reply(&self, request: &SchemaDigest, reply: &SchemaDigest) -> bool {
        match self.declared_replies(request) {
            Some(replies) if !replies.is_empty() => replies.iter().any(|r| r.digest() == *reply),
            _ => true,
        }
    }

    /// Digest over name, version and the request/reply structure.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.version.as_bytes());
        hasher.update([0u8]);
        for (digest, interaction) in &self.interactions {
            hasher.update(digest.as_bytes());
            let mut replies: Vec<SchemaDigest> =
                interaction.replies.iter().map(|r| r.digest()).collect();
            replies.sort();
            replies.dedup();
            hasher.update((replies.len() as u32).to_be_bytes());
            for reply in replies {
                hasher.update(reply.as_bytes());
            }
        }
        format!("{}{}", PROTOCOL_DIGEST_PREFIX, hex::encode(hasher.finalize()))
    }

    pub fn manifest(&self) -> ProtocolManifest {
        let mut models: BTreeMap<SchemaDigest, ModelManifest> = BTreeMap::new();
        let mut interactions = Vec::new();

        for (digest, interaction) in &self.interactions {
            for schema in std::iter::once(&interaction.schema).chain(interaction.replies.iter()) {
                models.entry(schema.digest()).or_insert_with(|| ModelManifest {
                    name: schema.name().to_string(),
                    digest: schema.digest(),
                    schema: schema.canonical(),
                });
            }
            interactions.push(InteractionManifest {
                request: *digest,
                replies: interaction.replies.iter().map(|r| r.digest()).collect(),
            });
        }

        ProtocolManifest {
            name: self.name.clone(),
            version: self.version.clone(),
            digest: self.digest(),
            models: models.into_values().collect(),
            interactions,
        }
    }

    /// Opt-in compatibility check against a peer's advertised manifest.
    pub fn is_compatible(&self, manifest: &ProtocolManifest) -> bool {
        self.name == manifest.name && self.version == manifest.version && self.digest() == manifest.digest
    }
}

/// Serializable description of a protocol, advertised by agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolManifest {
    pub name: String,
    pub version: String,
    pub digest: String,
    pub models: Vec<ModelManifest>,
    pub interactions: Vec<InteractionManifest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelManifest {
    pub name: String,
    pub digest: SchemaDigest,
    pub schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionManifest {
    pub request: SchemaDigest,
    pub replies: Vec<SchemaDigest>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FieldKind;

    fn schema(name: &str) -> Schema {
        Schema::builder(name).field("message", FieldKind::String).build()
    }

    fn noop() -> Arc<dyn MessageHandler> {
        handler(|_ctx, _sender, _msg| async { Ok(()) })
    }

    #[test]
    fn test_register_duplicate_conflicts() {
        let mut proto = Protocol::new("greeting", "1.0");
        proto.register(schema("Request"), noop(), []).unwrap();

        let err = proto.register(schema("Request"), noop(), []).unwrap_err();
        assert!(matches!(err, Error::ProtocolConflict { .. }));
        assert_eq!(proto.len(), 1);
    }

    #[test]
    fn test_merge() {
        let mut a = Protocol::new("a", "1.0");
        a.register(schema("Request"), noop(), [schema("Response")]).unwrap();
        let mut b = Protocol::new("b", "1.0");
        b.register(schema("Ping"), noop(), []).unwrap();

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.handler_for(&schema("Ping").digest()).is_some());
        assert!(merged.handler_for(&schema("Request").digest()).is_some());
        assert_eq!(merged.name(), "a");
    }

    #[test]
    fn test_merge_conflict_is_atomic() {
        let mut a = Protocol::new("a", "1.0");
        a.register(schema("Request"), noop(), []).unwrap();
        let mut b = Protocol::new("b", "1.0");
        b.register(schema("Other"), noop(), []).unwrap();
        b.register(schema("Request"), noop(), []).unwrap();

        assert!(matches!(a.merge(&b), Err(Error::ProtocolConflict { .. })));
        assert_eq!(a.len(), 1);
        assert!(a.handler_for(&schema("Other").digest()).is_none());
    }

    #[test]
    fn test_reply_declarations() {
        let mut proto = Protocol::new("greeting", "1.0");
        proto.register(schema("Request"), noop(), [schema("Response")]).unwrap();
        proto.register(schema("Ping"), noop(), []).unwrap();

        let request = schema("Request").digest();
        assert!(proto.is_valid_reply(&request, &schema("Response").digest()));
        assert!(!proto.is_valid_reply(&request, &schema("Ping").digest()));
        assert!(proto.is_valid_reply(&schema("Ping").digest(), &schema("Anything").digest()));
        assert!(proto.is_valid_reply(&schema("Unknown").digest(), &request));
        assert_eq!(proto.declared_replies(&request).unwrap().len(), 1);
    }

    #[test]
    fn test_protocol_digest() {
        let build = |version: &str, reply: &str| {
            let mut proto = Protocol::new("greeting", version);
            proto.register(schema("Request"), noop(), [schema(reply)]).unwrap();
            proto
        };

        assert_eq!(build("1.0", "Response").digest(), build("1.0", "Response").digest());
        assert_ne!(build("1.0", "Response").digest(), build("1.1", "Response").digest());
        assert_ne!(build("1.0", "Response").digest(), build("1.0", "Other").digest());
        assert!(build("1.0", "Response").digest().starts_with("proto:"));
    }

    #[test]
    fn test_manifest_and_compatibility() {
        let mut proto = Protocol::new("greeting", "1.0");
        proto.register(schema("Request"), noop(), [schema("Response")]).unwrap();

        let manifest = proto.manifest();
        assert_eq!(manifest.models.len(), 2);
        assert_eq!(manifest.interactions.len(), 1);
        assert_eq!(manifest.interactions[0].replies, vec![schema("Response").digest()]);
        assert!(proto.is_compatible(&manifest));

        let json = serde_json::to_string(&manifest).unwrap();
        let back: ProtocolManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);

        let mut newer = Protocol::new("greeting", "2.0");
        newer.register(schema("Request"), noop(), [schema("Response")]).unwrap();
        assert!(!newer.is_compatible(&manifest));
    }
}
