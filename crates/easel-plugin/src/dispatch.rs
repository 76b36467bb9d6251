//! Command dispatch.
//!
//! A [`Registry`] maps command names to handlers. It is assembled once from
//! `(name, handler)` pairs through a [`RegistryBuilder`] and is read-only
//! afterwards, so it can be shared behind an `Arc` without locking.

use crate::error::RegistryError;
use async_trait::async_trait;
use easel_core::{CommandReply, CommandRequest, ProgressUpdate};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A command implementation.
///
/// Handlers deserialize their own params and fail with a descriptive error
/// on bad input. The error's top-level message becomes the reply's `error`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn call(&self, ctx: HandlerContext, params: Value) -> anyhow::Result<Value>;
}

/// Adapter that turns an async function or closure into a [`CommandHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wrap an async function or closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F, Fut>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: HandlerContext, params: Value) -> anyhow::Result<Value> {
        (self.f)(ctx, params).await
    }
}

/// Where a handler's progress updates go.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    sink: Option<Arc<dyn Fn(ProgressUpdate) + Send + Sync>>,
}

impl ProgressReporter {
    pub fn new(sink: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    /// A reporter that drops every update.
    pub fn noop() -> Self {
        Self::default()
    }

    /// Emit an update. Best effort.
    pub fn report(&self, update: ProgressUpdate) {
        if let Some(sink) = &self.sink {
            sink(update);
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}

/// Per-request context handed to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Correlation id of the request.
    pub command_id: String,
    /// Command name.
    pub command: String,
    /// Channel the request arrived on, if any.
    pub channel: Option<String>,
    /// Names of every registered command.
    pub commands: Arc<[String]>,
    progress: ProgressReporter,
}

impl HandlerContext {
    /// Context for invoking a handler outside a channel, e.g. in tests.
    pub fn detached(command_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            command: command.into(),
            channel: None,
            commands: Arc::from(Vec::new()),
            progress: ProgressReporter::noop(),
        }
    }

    /// Send a progress update for this command.
    pub fn report(&self, update: ProgressUpdate) {
        self.progress.report(update);
    }
}

/// Builds a [`Registry`].
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`.
    ///
    /// # Errors
    ///
    /// Fails with [`RegistryError::DuplicateCommand`] if the name is taken.
    pub fn register(
        mut self,
        name: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) -> Result<Self, RegistryError> {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(RegistryError::DuplicateCommand(name));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(self)
    }

    pub fn build(self) -> Registry {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        tracing::debug!(commands = ?names, "Command registry built");
        Registry {
            handlers: self.handlers,
            names: names.into(),
        }
    }
}

/// Immutable command table.
pub struct Registry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    names: Arc<[String]>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("commands", &self.names)
            .finish()
    }
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the handler for `request` and build its reply.
    ///
    /// Never fails: unknown commands, handler errors and handler panics all
    /// become error replies carrying the request id.
    pub async fn dispatch(
        &self,
        request: CommandRequest,
        channel: Option<String>,
        progress: ProgressReporter,
    ) -> CommandReply {
        let CommandRequest {
            id,
            command,
            params,
        } = request;
        tracing::debug!(id = %id, command = %command, "Dispatching command");

        let Some(handler) = self.handlers.get(&command) else {
            tracing::warn!(id = %id, command = %command, "Unknown command");
            return CommandReply::failure(id, format!("Unknown command: {command}"));
        };

        let ctx = HandlerContext {
            command_id: id.clone(),
            command: command.clone(),
            channel,
            commands: Arc::clone(&self.names),
            progress,
        };

        match AssertUnwindSafe(handler.call(ctx, params))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => {
                tracing::debug!(id = %id, command = %command, "Command succeeded");
                CommandReply::success(id, result)
            }
            Ok(Err(e)) => {
                tracing::debug!(id = %id, command = %command, error = %e, "Command failed");
                CommandReply::failure(id, e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(id = %id, command = %command, panic = %message, "Handler panicked");
                CommandReply::failure(id, message)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easel_core::ProgressStatus;
    use parking_lot::Mutex;
    use serde_json::json;

    fn registry() -> Registry {
        Registry::builder()
            .register("echo", handler_fn(|_, params| async move { Ok(params) }))
            .unwrap()
            .register(
                "fail",
                handler_fn(|_, _| async { Err(anyhow::anyhow!("boom")) }),
            )
            .unwrap()
            .register("panic", Explodes)
            .unwrap()
            .build()
    }

    struct Explodes;

    #[async_trait]
    impl CommandHandler for Explodes {
        async fn call(&self, _ctx: HandlerContext, _params: Value) -> anyhow::Result<Value> {
            panic!("handler exploded")
        }
    }

    fn request(id: &str, command: &str, params: Value) -> CommandRequest {
        CommandRequest::new(id, command, params)
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let result = Registry::builder()
            .register("echo", handler_fn(|_, p| async move { Ok(p) }))
            .unwrap()
            .register("echo", handler_fn(|_, p| async move { Ok(p) }));
        assert_eq!(
            result.err(),
            Some(RegistryError::DuplicateCommand("echo".into()))
        );
    }

    #[test]
    fn test_commands_are_sorted() {
        assert_eq!(registry().commands(), ["echo", "fail", "panic"]);
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let reply = registry()
            .dispatch(request("a1", "echo", json!({"v": 1})), None, ProgressReporter::noop())
            .await;
        assert_eq!(reply, CommandReply::success("a1", json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_command() {
        let reply = registry()
            .dispatch(request("a2", "not_registered", Value::Null), None, ProgressReporter::noop())
            .await;
        assert_eq!(reply.id, "a2");
        assert_eq!(reply.error.as_deref(), Some("Unknown command: not_registered"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_reply() {
        let reply = registry()
            .dispatch(request("a3", "fail", Value::Null), None, ProgressReporter::noop())
            .await;
        assert_eq!(reply, CommandReply::failure("a3", "boom"));
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let registry = registry();
        let reply = registry
            .dispatch(request("a4", "panic", Value::Null), None, ProgressReporter::noop())
            .await;
        assert_eq!(reply, CommandReply::failure("a4", "handler exploded"));

        // The registry keeps serving.
        let reply = registry
            .dispatch(request("a5", "echo", json!(7)), None, ProgressReporter::noop())
            .await;
        assert_eq!(reply.into_result(), Ok(json!(7)));
    }

    #[tokio::test]
    async fn test_context_carries_request_details() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let registry = Registry::builder()
            .register(
                "inspect",
                handler_fn(|ctx: HandlerContext, _| async move {
                    ctx.report(ProgressUpdate::new(
                        &ctx.command_id,
                        &ctx.command,
                        ProgressStatus::Started,
                        "go",
                    ));
                    Ok(json!({"id": ctx.command_id, "channel": ctx.channel}))
                }),
            )
            .unwrap()
            .build();

        let reporter = ProgressReporter::new(move |update| sink.lock().push(update));
        let reply = registry
            .dispatch(request("c1", "inspect", Value::Null), Some("room".into()), reporter)
            .await;

        assert_eq!(reply.into_result(), Ok(json!({"id": "c1", "channel": "room"})));
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].command_id, "c1");
    }
}
