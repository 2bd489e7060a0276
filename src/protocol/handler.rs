//! Handler interfaces for inbound messages, interval tasks and lifecycle hooks.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::Context;
use crate::identity::Address;
use crate::message::Model;

/// Outcome of a handler invocation. Errors are logged by the agent loop.
pub type HandlerResult = anyhow::Result<()>;

/// Handles one inbound message of a known schema.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: Context, sender: Address, message: Value) -> HandlerResult;
}

/// Runs on a schedule or on a lifecycle event.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: Context) -> HandlerResult;
}

/// Untyped message handler backed by a closure.
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Context, Address, Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: Context, sender: Address, message: Value) -> HandlerResult {
        (self.f)(ctx, sender, message).await
    }
}

/// Message handler that deserializes the payload into `M` first.
pub struct TypedHandler<M, F> {
    f: F,
    _model: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, F, Fut> MessageHandler for TypedHandler<M, F>
where
    M: Model,
    F: Fn(Context, Address, M) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, ctx: Context, sender: Address, message: Value) -> HandlerResult {
        let message = M::from_value(message)?;
        (self.f)(ctx, sender, message).await
    }
}

/// Task handler backed by a closure.
pub struct FnTask<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> TaskHandler for FnTask<F>
where
    F: Fn(Context) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn run(&self, ctx: Context) -> HandlerResult {
        (self.f)(ctx).await
    }
}

pub fn handler<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Context, Address, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

pub fn typed<M, F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    M: Model,
    F: Fn(Context, Address, M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(TypedHandler {
        f,
        _model: PhantomData,
    })
}

pub fn task<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnTask { f })
}
