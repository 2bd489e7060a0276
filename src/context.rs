//! Per-invocation context handed to every handler.
//!
//! Exposes the owning agent's address, name, storage and log span, plus
//! `send` for producing signed outbound envelopes.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::Span;
use uuid::Uuid;

use crate::error::Result;
use crate::identity::{Address, Identity};
use crate::message::{Envelope, Model, Schema, SchemaDigest};
use crate::protocol::Protocol;
use crate::storage::Storage;
use crate::transport::{DeliveryStatus, Dispatcher};

/// State shared by every context of one agent.
pub(crate) struct AgentCore {
    pub identity: Identity,
    pub name: String,
    pub storage: Storage,
    pub table: Arc<Protocol>,
    pub dispatcher: Arc<Dispatcher>,
    pub send_timeout: Duration,
    pub envelope_ttl: Option<u64>,
    pub span: Span,
}

/// The message a context was created for.
#[derive(Debug, Clone, Copy)]
struct Inbound {
    sender: Address,
    schema: SchemaDigest,
}

#[derive(Clone)]
pub struct Context {
    core: Arc<AgentCore>,
    session: Uuid,
    inbound: Option<Inbound>,
}

impl Context {
    /// Context for an interval task or lifecycle hook; starts a new session.
    pub(crate) fn for_task(core: Arc<AgentCore>) -> Self {
        Self {
            core,
            session: Uuid::new_v4(),
            inbound: None,
        }
    }

    /// Context for an inbound message; replies stay in the sender's session.
    pub(crate) fn for_message(core: Arc<AgentCore>, envelope: &Envelope) -> Self {
        Self {
            core,
            session: envelope.session_id,
            inbound: Some(Inbound {
                sender: envelope.sender,
                schema: envelope.schema_digest,
            }),
        }
    }

    pub fn address(&self) -> Address {
        self.core.identity.address()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn storage(&self) -> &Storage {
        &self.core.storage
    }

    /// Span carrying the agent name and address.
    pub fn logger(&self) -> &Span {
        &self.core.span
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Sender of the message being handled, if any.
    pub fn sender(&self) -> Option<Address> {
        self.inbound.map(|i| i.sender)
    }

    /// Send a typed message with the agent's default timeout.
    pub async fn send<M: Model>(&self, destination: &Address, message: &M) -> Result<DeliveryStatus> {
        self.send_with_timeout(destination, message, self.core.send_timeout).await
    }

    pub async fn send_with_timeout<M: Model>(
        &self,
        destination: &Address,
        message: &M,
        timeout: Duration,
    ) -> Result<DeliveryStatus> {
        let value = serde_json::to_value(message)?;
        self.deliver(destination, &M::schema(), &value, timeout).await
    }

    /// Send an untyped value validated against `schema`.
    pub async fn send_raw(
        &self,
        destination: &Address,
        schema: &Schema,
        value: &Value,
    ) -> Result<DeliveryStatus> {
        self.deliver(destination, schema, value, self.core.send_timeout).await
    }

    async fn deliver(
        &self,
        destination: &Address,
        schema: &Schema,
        value: &Value,
        timeout: Duration,
    ) -> Result<DeliveryStatus> {
        let payload = schema.encode(value)?;
        self.check_reply(destination, schema);

        let mut builder = Envelope::builder(self.address())
            .to(*destination)
            .schema(schema.digest())
            .session(self.session)
            .payload(payload);
        if let Some(ttl) = self.core.envelope_ttl {
            builder = builder.ttl(ttl);
        }
        let envelope = builder.build_signed(&self.core.identity)?;

        match self.core.dispatcher.dispatch(envelope, timeout).await {
            Ok(status) => {
                tracing::debug!(parent: &self.core.span, "Sent {} to {}: {:?}", schema.name(), destination.short(), status);
                Ok(status)
            }
            Err(e) => {
                tracing::warn!(parent: &self.core.span, "Failed to send {} to {}: {}", schema.name(), destination.short(), e);
                Err(e)
            }
        }
    }

    /// Warn (never block) when a reply to the current sender is not a declared reply type.
    fn check_reply(&self, destination: &Address, schema: &Schema) {
        let Some(inbound) = self.inbound else {
            return;
        };
        if inbound.sender != *destination {
            return;
        }
        if !self.core.table.is_valid_reply(&inbound.schema, &schema.digest()) {
            tracing::warn!(
                parent: &self.core.span,
                "Outgoing {} to {} is not a declared reply to {}",
                schema.name(),
                destination.short(),
                inbound.schema
            );
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.core.name)
            .field("address", &self.address())
            .field("session", &self.session)
            .finish()
    }
}
