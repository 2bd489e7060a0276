//! Agents: an identity, a handler table, interval tasks and lifecycle hooks.
//!
//! An [`Agent`] is configured up front and then handed to a
//! [`Bureau`](crate::bureau::Bureau), which owns it for the rest of its life.
//! Registration is therefore impossible once the agent is running.

pub mod runtime;
pub mod scheduler;

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bureau::Bureau;
use crate::config::{AgentConfig, BureauConfig};
use crate::context::{AgentCore, Context};
use crate::error::{Error, Result};
use crate::identity::{Address, Identity};
use crate::message::{Envelope, Model, Schema, SchemaDigest};
use crate::protocol::{task, HandlerResult, Protocol, ProtocolManifest, TaskHandler};
use crate::storage::Storage;
use crate::transport::Dispatcher;

pub use runtime::AgentHandle;
use runtime::AgentRuntime;
use scheduler::{IntervalTask, Scheduler};

pub const STARTUP: &str = "startup";
pub const SHUTDOWN: &str = "shutdown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Recognized lifecycle hook names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Startup,
    Shutdown,
}

impl FromStr for LifecycleEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            STARTUP => Ok(Self::Startup),
            SHUTDOWN => Ok(Self::Shutdown),
            other => Err(Error::UnknownEvent(other.to_string())),
        }
    }
}

/// What an agent advertises about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentManifest {
    pub name: String,
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox: Option<String>,
    pub handles: Vec<SchemaDigest>,
    pub protocols: Vec<ProtocolManifest>,
}

pub struct Agent {
    config: AgentConfig,
    identity: Identity,
    name: String,
    storage: Storage,
    table: Protocol,
    protocols: Vec<ProtocolManifest>,
    intervals: Vec<IntervalTask>,
    startup: Vec<Arc<dyn TaskHandler>>,
    shutdown: Vec<Arc<dyn TaskHandler>>,
    /// First handler conflict hit while registering; such an agent never starts.
    conflict: Option<(String, String)>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("address", &self.identity.address())
            .field("handlers", &self.table.len())
            .field("intervals", &self.intervals.len())
            .finish()
    }
}

impl Agent {
    /// Build an agent. Bad key material or an unreadable store fails here.
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let identity = Identity::generate_or_load(&config.key_material())?;
        let address = identity.address();
        let name = config.name.clone().unwrap_or_else(|| address.short());
        let storage = Storage::open(address, &config.storage)?;

        tracing::debug!("Created agent {} ({})", name, address);
        Ok(Self {
            table: Protocol::new(name.clone(), env!("CARGO_PKG_VERSION")),
            config,
            identity,
            name,
            storage,
            protocols: Vec::new(),
            intervals: Vec::new(),
            startup: Vec::new(),
            shutdown: Vec::new(),
            conflict: None,
        })
    }

    pub fn address(&self) -> Address {
        self.identity.address()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Handle to the agent's store, e.g. for inspecting it from outside the loop.
    pub fn storage(&self) -> Storage {
        self.storage.clone()
    }

    /// The merged handler table.
    pub fn protocol(&self) -> &Protocol {
        &self.table
    }

    /// Run `f` every `period`, first one period after the agent starts.
    pub fn on_interval<F, Fut>(&mut self, period: Duration, f: F) -> Result<()>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if period.is_zero() {
            return Err(Error::Config("interval period must be greater than zero".to_string()));
        }
        self.intervals.push(IntervalTask {
            period,
            handler: task(f),
        });
        Ok(())
    }

    /// Register a `startup` or `shutdown` hook; other names are rejected.
    pub fn on_event<F, Fut>(&mut self, event: &str, f: F) -> Result<()>
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        match event.parse::<LifecycleEvent>()? {
            LifecycleEvent::Startup => self.startup.push(task(f)),
            LifecycleEvent::Shutdown => self.shutdown.push(task(f)),
        }
        Ok(())
    }

    pub fn on_message<M, F, Fut>(&mut self, f: F) -> Result<()>
    where
        M: Model,
        F: Fn(Context, Address, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let result = self.table.on::<M, F, Fut>(Vec::new(), f);
        self.note_conflict(result)
    }

    pub fn on_message_with_replies<M, F, Fut>(&mut self, replies: Vec<Schema>, f: F) -> Result<()>
    where
        M: Model,
        F: Fn(Context, Address, M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let result = self.table.on::<M, F, Fut>(replies, f);
        self.note_conflict(result)
    }

    /// Attach a protocol. On a digest collision nothing is attached and the
    /// agent is refused by [`Bureau::add`].
    pub fn include(&mut self, protocol: Protocol) -> Result<()> {
        let merged = self.table.merge(&protocol);
        self.table = self.note_conflict(merged)?;
        tracing::debug!(
            "Agent {} includes protocol {} v{} ({})",
            self.name,
            protocol.name(),
            protocol.version(),
            protocol.digest()
        );
        self.protocols.push(protocol.manifest());
        Ok(())
    }

    fn note_conflict<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::ProtocolConflict { protocol, digest }) = &result {
            self.conflict
                .get_or_insert_with(|| (protocol.clone(), digest.clone()));
        }
        result
    }

    /// Fails with the recorded conflict if any handler registration collided.
    pub fn ensure_startable(&self) -> Result<()> {
        match &self.conflict {
            Some((protocol, digest)) => Err(Error::ProtocolConflict {
                protocol: protocol.clone(),
                digest: digest.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn manifest(&self) -> AgentManifest {
        AgentManifest {
            name: self.name.clone(),
            address: self.address(),
            endpoint: self.config.endpoint.clone(),
            mailbox: self.config.mailbox.clone(),
            handles: self.table.digests().copied().collect(),
            protocols: self.protocols.clone(),
        }
    }

    /// Run standalone as a one-agent bureau until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let config = BureauConfig {
            port: self.config.mailbox.is_none().then_some(self.config.port),
            endpoint: self.config.endpoint.clone(),
            ..Default::default()
        };
        let mut bureau = Bureau::new(config);
        bureau.add(self)?;
        bureau.run().await
    }

    pub(crate) fn into_runtime(
        self,
        dispatcher: Arc<Dispatcher>,
        inbox: mpsc::Receiver<Envelope>,
    ) -> AgentRuntime {
        let span = tracing::info_span!(
            "agent",
            agent = %self.name,
            address = %self.identity.address().short()
        );
        let core = Arc::new(AgentCore {
            identity: self.identity,
            name: self.name,
            storage: self.storage,
            table: Arc::new(self.table),
            dispatcher,
            send_timeout: self.config.send_timeout(),
            envelope_ttl: self.config.envelope_ttl_secs,
            span,
        });
        AgentRuntime::new(
            core,
            Scheduler::new(self.intervals),
            self.startup,
            self.shutdown,
            inbox,
            self.config.storage.flush_interval(),
        )
    }
}
