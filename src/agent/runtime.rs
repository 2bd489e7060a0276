//! The per-agent scheduling loop.
//!
//! One task per agent multiplexes the stop signal, the inbox, the next
//! interval deadline and the storage flush ticker. Handler invocations are
//! awaited one at a time, each in its own tokio task so that an error or a
//! panic is contained to that invocation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

use super::scheduler::Scheduler;
use super::AgentState;
use crate::context::{AgentCore, Context};
use crate::error::{Error, Result};
use crate::identity::Address;
use crate::message::Envelope;
use crate::protocol::{HandlerResult, TaskHandler};

pub(crate) struct AgentRuntime {
    core: Arc<AgentCore>,
    scheduler: Scheduler,
    startup: Vec<Arc<dyn TaskHandler>>,
    shutdown: Vec<Arc<dyn TaskHandler>>,
    inbox: mpsc::Receiver<Envelope>,
    state: watch::Sender<AgentState>,
    flush_interval: Duration,
}

impl AgentRuntime {
    pub fn new(
        core: Arc<AgentCore>,
        scheduler: Scheduler,
        startup: Vec<Arc<dyn TaskHandler>>,
        shutdown: Vec<Arc<dyn TaskHandler>>,
        inbox: mpsc::Receiver<Envelope>,
        flush_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(AgentState::Created);
        Self {
            core,
            scheduler,
            startup,
            shutdown,
            inbox,
            state,
            flush_interval,
        }
    }

    pub fn address(&self) -> Address {
        self.core.identity.address()
    }

    /// Run startup hooks in registration order, then mark the agent running.
    pub async fn startup(&mut self) {
        for hook in self.startup.clone() {
            let ctx = Context::for_task(self.core.clone());
            self.invoke("startup hook", async move { hook.run(ctx).await }).await;
        }
        self.state.send_replace(AgentState::Running);
        tracing::info!(parent: &self.core.span, "Agent {} is running", self.core.name);
    }

    pub fn spawn(self) -> AgentHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let address = self.address();
        let name = self.core.name.clone();
        let state = self.state.subscribe();
        let join = tokio::spawn(self.run(stop_rx));
        AgentHandle {
            address,
            name,
            state,
            stop: stop_tx,
            join,
        }
    }

    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        self.scheduler.start(Instant::now());

        let period = self.flush_interval;
        let mut flush = tokio::time::interval_at(Instant::now() + period, period);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *stop.borrow() {
                break;
            }
            let deadline = self.scheduler.next_deadline();

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(envelope) = self.inbox.recv() => {
                    self.handle_envelope(envelope).await;
                }
                _ = sleep_until(deadline) => {
                    self.run_due_tasks(&stop).await;
                }
                _ = flush.tick() => {
                    self.flush_storage();
                }
            }
        }

        self.stop().await;
    }

    async fn handle_envelope(&self, envelope: Envelope) {
        let span = &self.core.span;

        if let Err(e) = envelope.verify() {
            tracing::warn!(parent: span, "Rejected envelope from {}: {}", envelope.sender.short(), e);
            return;
        }
        if envelope.target != self.address() {
            tracing::warn!(parent: span, "Dropping envelope addressed to {}", envelope.target.short());
            return;
        }

        let Some(interaction) = self.core.table.handler_for(&envelope.schema_digest) else {
            tracing::debug!(
                parent: span,
                "No handler for {} from {}, dropping",
                envelope.schema_digest,
                envelope.sender.short()
            );
            return;
        };

        let message = match interaction.schema.decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    parent: span,
                    "Dropping undecodable {} from {}: {}",
                    interaction.schema.name(),
                    envelope.sender.short(),
                    e
                );
                return;
            }
        };

        let label = format!("{} handler", interaction.schema.name());
        let handler = interaction.handler.clone();
        let ctx = Context::for_message(self.core.clone(), &envelope);
        let sender = envelope.sender;
        self.invoke(&label, async move { handler.handle(ctx, sender, message).await })
            .await;
    }

    async fn run_due_tasks(&mut self, stop: &watch::Receiver<bool>) {
        let now = Instant::now();
        while !*stop.borrow() {
            let Some(id) = self.scheduler.pop_due(now) else {
                break;
            };
            let Some(task) = self.scheduler.task(id).cloned() else {
                continue;
            };
            let ctx = Context::for_task(self.core.clone());
            self.invoke("interval task", async move { task.handler.run(ctx).await })
                .await;
            self.scheduler.reschedule(id, Instant::now());
        }
    }

    /// Run one handler future to completion, logging errors and panics.
    async fn invoke<F>(&self, label: &str, fut: F)
    where
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        let span = &self.core.span;
        match tokio::spawn(fut.instrument(span.clone())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(parent: span, "{} failed: {:#}", label, e),
            Err(e) if e.is_panic() => tracing::error!(parent: span, "{} panicked", label),
            Err(e) => tracing::error!(parent: span, "{} did not complete: {}", label, e),
        }
    }

    fn flush_storage(&self) {
        if let Err(e) = self.core.storage.flush() {
            tracing::error!(parent: &self.core.span, "Storage flush failed: {}", e);
        }
    }

    /// Running -> Stopping -> Stopped.
    async fn stop(mut self) {
        self.state.send_replace(AgentState::Stopping);

        let cancelled = self.scheduler.clear();
        self.inbox.close();
        let mut dropped = 0usize;
        while self.inbox.try_recv().is_ok() {
            dropped += 1;
        }
        tracing::info!(
            parent: &self.core.span,
            "Stopping agent {} ({} queued envelopes dropped, {} ticks cancelled)",
            self.core.name,
            dropped,
            cancelled
        );

        for hook in self.shutdown.clone() {
            let ctx = Context::for_task(self.core.clone());
            self.invoke("shutdown hook", async move { hook.run(ctx).await }).await;
        }

        self.flush_storage();
        self.state.send_replace(AgentState::Stopped);
        tracing::info!(parent: &self.core.span, "Agent {} stopped", self.core.name);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Control handle for a spawned agent loop.
pub struct AgentHandle {
    address: Address,
    name: String,
    state: watch::Receiver<AgentState>,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl AgentHandle {
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<AgentState> {
        self.state.clone()
    }

    /// Ask the loop to stop after the current invocation.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait for the loop to reach `Stopped`.
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::Other(format!("agent {} loop failed: {}", self.name, e)))
    }
}
