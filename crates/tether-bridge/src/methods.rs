//! Local method table and invocation.
//!
//! Methods are registered by name before the bridge is built and frozen
//! afterwards. Invocation always produces exactly one outcome: a missing
//! method, a returned error and a panic all become an [`ErrorBody`].

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tether_core::errors::PANIC;
use tether_core::{BridgeError, ErrorBody};

/// Trait implemented by every locally exposed method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Run the method with positional `args`.
    async fn handle(&self, args: Vec<Value>) -> Result<Value, ErrorBody>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> MethodHandler for FnHandler<F>
where
    F: Fn(Vec<Value>) -> Result<Value, ErrorBody> + Send + Sync,
{
    async fn handle(&self, args: Vec<Value>) -> Result<Value, ErrorBody> {
        (self.0)(args)
    }
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> MethodHandler for AsyncFnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ErrorBody>> + Send + 'static,
{
    async fn handle(&self, args: Vec<Value>) -> Result<Value, ErrorBody> {
        (self.0)(args).await
    }
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

impl MethodRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under `name`.
    pub fn register(&mut self, name: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(name.to_owned(), Arc::new(handler));
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Vec<Value>) -> Result<Value, ErrorBody> + Send + Sync + 'static,
    {
        self.register(name, FnHandler(f));
    }

    /// Register a closure returning a future.
    pub fn register_async<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorBody>> + Send + 'static,
    {
        self.register(name, AsyncFnHandler(f));
    }

    /// Builder-style [`register_fn`](Self::register_fn).
    #[must_use]
    pub fn with_fn<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, ErrorBody> + Send + Sync + 'static,
    {
        self.register_fn(name, f);
        self
    }

    /// Builder-style [`register_async`](Self::register_async).
    #[must_use]
    pub fn with_async<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ErrorBody>> + Send + 'static,
    {
        self.register_async(name, f);
        self
    }

    /// Run `name` with `args`.
    ///
    /// An unknown name answers with the `UnknownMethod` body; a panicking
    /// handler answers with a `Panic` body.
    pub async fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Value, ErrorBody> {
        let Some(handler) = self.handlers.get(name).cloned() else {
            return Err(BridgeError::UnknownMethod {
                method: name.to_owned(),
            }
            .to_error_body());
        };

        match AssertUnwindSafe(handler.handle(args)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(method = name, %message, "method panicked");
                Err(ErrorBody::new(PANIC, message))
            }
        }
    }

    /// All registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` is registered.
    pub fn has_method(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no method is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_owned()
    }
}

/// Decode positional argument `index`, answering with a `TypeError` body on
/// a missing or mistyped argument.
pub fn parse_arg<T: DeserializeOwned>(args: &[Value], index: usize) -> Result<T, ErrorBody> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| ErrorBody::new("TypeError", format!("argument {index}: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
