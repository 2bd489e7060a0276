//! Bureau: hosts several agents behind one listener.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::agent::{Agent, AgentHandle, AgentManifest, AgentState};
use crate::config::BureauConfig;
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::message::Envelope;
use crate::transport::{Directory, Dispatcher, LocalRouter, MailboxClient, MailboxStore};

/// State shared between the bureau and its HTTP surface.
pub struct BureauState {
    router: LocalRouter,
    agents: Vec<AgentManifest>,
    states: HashMap<Address, watch::Receiver<AgentState>>,
    submit_timeout: Duration,
    mailbox: Option<Arc<MailboxStore>>,
}

impl BureauState {
    /// Inbound path: verify, resolve the target, enqueue.
    pub async fn submit(&self, envelope: Envelope) -> Result<()> {
        envelope.verify()?;
        if !self.router.contains(&envelope.target) {
            return Err(Error::Routing(envelope.target.to_string()));
        }
        self.router.deliver(envelope, self.submit_timeout).await
    }

    pub fn agents(&self) -> &[AgentManifest] {
        &self.agents
    }

    pub fn agent(&self, address: &Address) -> Option<&AgentManifest> {
        self.agents.iter().find(|a| a.address == *address)
    }

    pub fn agent_state(&self, address: &Address) -> Option<AgentState> {
        self.states.get(address).map(|rx| *rx.borrow())
    }

    /// The relay store, when this bureau serves mailboxes.
    pub fn mailbox(&self) -> Option<&Arc<MailboxStore>> {
        self.mailbox.as_ref()
    }
}

pub struct Bureau {
    config: BureauConfig,
    agents: Vec<Agent>,
}

impl Bureau {
    pub fn new(config: BureauConfig) -> Self {
        Self {
            config,
            agents: Vec::new(),
        }
    }

    /// Add an agent. Addresses must be distinct and the agent's handler
    /// table free of conflicts.
    pub fn add(&mut self, agent: Agent) -> Result<()> {
        agent.ensure_startable()?;
        if self.agents.iter().any(|a| a.address() == agent.address()) {
            return Err(Error::DuplicateAgent(agent.address().to_string()));
        }
        self.agents.push(agent);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Start every agent, then open the listener.
    ///
    /// All startup hooks run, in registration order, before any loop is
    /// spawned or any inbound traffic is accepted.
    pub async fn start(self) -> Result<RunningBureau> {
        let directory = Directory::from_entries(&self.config.directory)?;
        let mailbox = if self.config.relay {
            Some(Arc::new(match &self.config.relay_dir {
                Some(dir) => MailboxStore::new(dir)?,
                None => MailboxStore::in_memory(),
            }))
        } else {
            None
        };

        let mut inboxes = HashMap::new();
        let mut receivers = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let (tx, rx) = mpsc::channel(agent.config().inbox_capacity);
            inboxes.insert(agent.address(), tx);
            receivers.push(rx);
        }
        let router = LocalRouter::new(inboxes);
        let dispatcher = Arc::new(Dispatcher::new(router.clone(), directory));

        let mut manifests = Vec::with_capacity(self.agents.len());
        let mut clients = Vec::new();
        let mut runtimes = Vec::with_capacity(self.agents.len());
        for (agent, inbox) in self.agents.into_iter().zip(receivers) {
            let mut manifest = agent.manifest();
            if manifest.endpoint.is_none() {
                manifest.endpoint = self.config.endpoint.clone();
            }
            manifests.push(manifest);

            if let Some(relay) = agent.config().mailbox.clone() {
                clients.push((
                    MailboxClient::new(relay, agent.identity().clone()),
                    agent.config().mailbox_poll_interval(),
                ));
            }
            runtimes.push(agent.into_runtime(dispatcher.clone(), inbox));
        }

        for runtime in &mut runtimes {
            runtime.startup().await;
        }
        let handles: Vec<AgentHandle> = runtimes.into_iter().map(|r| r.spawn()).collect();

        let state = Arc::new(BureauState {
            router: router.clone(),
            agents: manifests,
            states: handles
                .iter()
                .map(|h| (h.address(), h.state_receiver()))
                .collect(),
            submit_timeout: self.config.submit_timeout(),
            mailbox,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (server, local_addr) = match self.config.port {
            Some(port) => {
                let addr = format!("{}:{}", self.config.host, port);
                let listener = match tokio::net::TcpListener::bind(&addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        stop_agents(handles).await;
                        return Err(Error::Web(format!("failed to bind {}: {}", addr, e)));
                    }
                };
                let local_addr = listener.local_addr()?;
                tracing::info!("Bureau listening on {}", local_addr);
                let server = crate::web::serve(
                    listener,
                    state.clone(),
                    self.config.relay,
                    shutdown_rx.clone(),
                );
                (Some(server), Some(local_addr))
            }
            None => (None, None),
        };

        let pollers = clients
            .into_iter()
            .map(|(client, interval)| spawn_poller(client, interval, state.clone(), shutdown_rx.clone()))
            .collect();

        tracing::info!("Bureau started with {} agents", handles.len());
        Ok(RunningBureau {
            state,
            handles,
            server,
            pollers,
            shutdown: shutdown_tx,
            local_addr,
        })
    }

    /// Start, wait for Ctrl-C, shut down.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl-C, shutting down");
        running.shutdown().await
    }
}

pub struct RunningBureau {
    state: Arc<BureauState>,
    handles: Vec<AgentHandle>,
    server: Option<JoinHandle<()>>,
    pollers: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    local_addr: Option<SocketAddr>,
}

impl RunningBureau {
    pub async fn submit(&self, envelope: Envelope) -> Result<()> {
        self.state.submit(envelope).await
    }

    pub fn agent_state(&self, address: &Address) -> Option<AgentState> {
        self.state.agent_state(address)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<BureauState> {
        &self.state
    }

    /// Stop the listener and pollers, then every agent in registration order.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send_replace(true);
        if let Some(server) = self.server {
            if let Err(e) = server.await {
                tracing::error!("Web server task failed: {}", e);
            }
        }
        for poller in self.pollers {
            if let Err(e) = poller.await {
                tracing::error!("Mailbox poller failed: {}", e);
            }
        }
        stop_agents(self.handles).await;
        tracing::info!("Bureau stopped");
        Ok(())
    }
}

async fn stop_agents(handles: Vec<AgentHandle>) {
    for handle in handles {
        handle.stop();
        if let Err(e) = handle.join().await {
            tracing::error!("{}", e);
        }
    }
}

fn spawn_poller(
    client: MailboxClient,
    interval: Duration,
    state: Arc<BureauState>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("Polling mailbox at {} every {:?}", client.base_url(), interval);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match client.poll().await {
                Ok(envelopes) => {
                    for envelope in envelopes {
                        if let Err(e) = state.submit(envelope).await {
                            tracing::warn!("Dropped relayed envelope: {}", e);
                        }
                    }
                }
                Err(e) => tracing::warn!("{}", e),
            }
        }
    })
}
