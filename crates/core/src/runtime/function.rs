use async_trait::async_trait;
use dashmap::DashMap;
use lavs_shared::{FunctionHandler, LavsError, LavsResult};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::ExecutionContext;
use crate::permissions::{cap_timeout, DEFAULT_TIMEOUT_MS};

/// An in-process endpoint implementation.
///
/// Returning a [`LavsError`] (directly or inside the anyhow chain) keeps its
/// code; any other error surfaces as `HandlerError`.
#[async_trait]
pub trait EndpointFunction: Send + Sync {
    async fn call(&self, input: Value, ctx: &ExecutionContext) -> anyhow::Result<Value>;
}

struct FnAdapter<F>(F);

#[async_trait]
impl<F, Fut> EndpointFunction for FnAdapter<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, input: Value, ctx: &ExecutionContext) -> anyhow::Result<Value> {
        (self.0)(input, ctx.clone()).await
    }
}

/// Named in-process handlers, keyed by `module:function` or a bare `function`.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<dyn EndpointFunction>>,
}

impl FunctionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, function: Arc<dyn EndpointFunction>) {
        let name = name.into();
        if self.functions.insert(name.clone(), function).is_some() {
            warn!(function = %name, "Replaced previously registered function");
        }
    }

    /// Register an async closure.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, Arc::new(FnAdapter(f)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.functions.remove(name).is_some()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn EndpointFunction>> {
        self.functions.get(name).map(|f| f.value().clone())
    }

    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Runs `function` handlers from a [`FunctionRegistry`] under the same
/// timeout rule as scripts.
pub struct FunctionExecutor {
    registry: Arc<FunctionRegistry>,
    default_timeout_ms: u64,
}

impl FunctionExecutor {
    #[must_use]
    pub fn new(registry: Arc<FunctionRegistry>, default_timeout_ms: u64) -> Self {
        Self {
            registry,
            default_timeout_ms,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub async fn execute(
        &self,
        handler: &FunctionHandler,
        input: &Value,
        ctx: &ExecutionContext,
    ) -> LavsResult<Value> {
        let name = handler.qualified_name();
        let function = self
            .registry
            .get(&name)
            .ok_or_else(|| LavsError::handler(format!("Function not registered: {}", name)))?;

        let timeout_ms = cap_timeout(handler.timeout, &ctx.permissions, self.default_timeout_ms);
        debug!(
            agent_id = %ctx.agent_id,
            endpoint_id = %ctx.endpoint_id,
            function = %name,
            timeout_ms,
            "Invoking function handler"
        );

        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            function.call(input.clone(), ctx),
        )
        .await
        {
            Err(_) => Err(LavsError::timeout(format!(
                "Function '{}' timed out after {}ms",
                name, timeout_ms
            ))
            .with_data(serde_json::json!({ "timeoutMs": timeout_ms }))),
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => match e.downcast::<LavsError>() {
                Ok(lavs) => Err(lavs),
                Err(other) => Err(LavsError::handler(format!(
                    "Function '{}' failed: {:#}",
                    name, other
                ))),
            },
        }
    }
}

impl Default for FunctionExecutor {
    fn default() -> Self {
        Self::new(Arc::new(FunctionRegistry::new()), DEFAULT_TIMEOUT_MS)
    }
}
