use lavs_shared::{
    Endpoint, EndpointMethod, Handler, LavsError, LavsErrorCode, LavsResult, Manifest,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::agents::AgentDirectory;
use crate::manifest::{ManifestLoader, MANIFEST_FILE_NAME};
use crate::permissions::{assert_allowed, merge_permissions, DEFAULT_TIMEOUT_MS};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::runtime::{
    ExecutionContext, FunctionExecutor, FunctionRegistry, ProcessArena, ScriptExecutor,
};
use crate::schema::SchemaValidator;
use crate::subscriptions::{SubscriptionConfig, SubscriptionManager, SubscriptionSink};
use crate::tools::{tool_definitions, ToolDefinition};
use crate::validation::{validate_agent_id, validate_endpoint_id};

/// Options for [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub default_timeout_ms: u64,
    pub manifest_file: String,
    pub rate_limit: RateLimitConfig,
    pub subscriptions: SubscriptionConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            manifest_file: MANIFEST_FILE_NAME.to_string(),
            rate_limit: RateLimitConfig::default(),
            subscriptions: SubscriptionConfig::default(),
        }
    }
}

/// A manifest endpoint resolved for one agent.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub agent_dir: PathBuf,
    pub manifest: Arc<Manifest>,
    pub endpoint: Endpoint,
}

/// Request lifecycle for endpoint calls and subscriptions.
pub struct Dispatcher {
    agents: Arc<dyn AgentDirectory>,
    manifests: ManifestLoader,
    schemas: Arc<SchemaValidator>,
    rate_limiter: RateLimiter,
    scripts: ScriptExecutor,
    functions: FunctionExecutor,
    subscriptions: Arc<SubscriptionManager>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(agents: Arc<dyn AgentDirectory>, config: DispatcherConfig) -> Self {
        let schemas = Arc::new(SchemaValidator::new());
        let manifests =
            ManifestLoader::new(schemas.clone()).with_file_name(config.manifest_file.clone());
        Self {
            agents,
            manifests,
            schemas,
            rate_limiter: RateLimiter::new(config.rate_limit),
            scripts: ScriptExecutor::new(Arc::new(ProcessArena::new()), config.default_timeout_ms),
            functions: FunctionExecutor::new(
                Arc::new(FunctionRegistry::new()),
                config.default_timeout_ms,
            ),
            subscriptions: SubscriptionManager::new(config.subscriptions),
        }
    }

    /// Registry for `function` handlers.
    #[must_use]
    pub fn functions(&self) -> &Arc<FunctionRegistry> {
        self.functions.registry()
    }

    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaValidator> {
        &self.schemas
    }

    #[must_use]
    pub fn process_arena(&self) -> &Arc<ProcessArena> {
        self.scripts.arena()
    }

    /// Cached manifest of `agent_id`.
    pub async fn manifest(&self, agent_id: &str) -> LavsResult<Arc<Manifest>> {
        validate_agent_id(agent_id)?;
        let agent_dir = self.agents.resolve(agent_id).await?;
        self.manifests.load_for_agent(agent_id, &agent_dir).await
    }

    pub async fn resolve_endpoint(
        &self,
        agent_id: &str,
        endpoint_id: &str,
    ) -> LavsResult<ResolvedEndpoint> {
        validate_agent_id(agent_id)?;
        validate_endpoint_id(endpoint_id)?;

        let agent_dir = self.agents.resolve(agent_id).await?;
        let manifest = self.manifests.load_for_agent(agent_id, &agent_dir).await?;
        let endpoint = manifest
            .endpoint(endpoint_id)
            .cloned()
            .ok_or_else(|| LavsError::method_not_found(endpoint_id))?;

        Ok(ResolvedEndpoint {
            agent_dir,
            manifest,
            endpoint,
        })
    }

    /// Run one query or mutation endpoint.
    ///
    /// Order: rate limit, manifest, endpoint, input schema, permissions,
    /// handler, output schema, then the `<endpointId>:mutated` broadcast for
    /// mutations.
    pub async fn call_endpoint(
        &self,
        agent_id: &str,
        endpoint_id: &str,
        input: Value,
        caller_env: Option<HashMap<String, String>>,
    ) -> LavsResult<Value> {
        let span = info_span!("lavs_call", agent_id = %agent_id, endpoint_id = %endpoint_id);
        async move {
            let started = std::time::Instant::now();
            let result = self
                .call_inner(agent_id, endpoint_id, input, caller_env.unwrap_or_default())
                .await;
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match &result {
                Ok(_) => debug!(elapsed_ms, "Endpoint call succeeded"),
                Err(e) if e.code == LavsErrorCode::InternalError => {
                    error!(elapsed_ms, code = %e.code, "Endpoint call failed: {}", e.message);
                }
                Err(e) => warn!(elapsed_ms, code = %e.code, "Endpoint call failed: {}", e.message),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn call_inner(
        &self,
        agent_id: &str,
        endpoint_id: &str,
        input: Value,
        caller_env: HashMap<String, String>,
    ) -> LavsResult<Value> {
        validate_agent_id(agent_id)?;
        validate_endpoint_id(endpoint_id)?;

        let key = RateLimiter::key(agent_id, endpoint_id);
        let decision = self.rate_limiter.check(&key);
        if !decision.allowed {
            return Err(LavsError::new(
                LavsErrorCode::RateLimited,
                format!("Rate limit exceeded for {}", key),
            )
            .with_data(json!({
                "retryAfterMs": u64::try_from(decision.retry_after.as_millis()).unwrap_or(u64::MAX),
                "resetAt": decision.reset_at.to_rfc3339(),
            })));
        }

        let ResolvedEndpoint {
            agent_dir,
            manifest,
            endpoint,
        } = self.resolve_endpoint(agent_id, endpoint_id).await?;

        if endpoint.method == EndpointMethod::Subscription {
            return Err(LavsError::invalid_request(format!(
                "Endpoint '{}' is a subscription; open it with subscribe",
                endpoint_id
            )));
        }

        self.schemas.assert_valid_input(agent_id, &endpoint, &input)?;

        let permissions =
            merge_permissions(manifest.permissions.as_ref(), endpoint.permissions.as_ref());
        let ctx = ExecutionContext::new(agent_id, endpoint_id, agent_dir.clone(), permissions)
            .with_env(caller_env);

        let output = match &endpoint.handler {
            Handler::Script(script) => {
                assert_allowed(&endpoint.handler, &ctx.permissions, &agent_dir)?;
                self.scripts.execute(script, &input, &ctx).await?
            }
            Handler::Function(function) => self.functions.execute(function, &input, &ctx).await?,
            Handler::Http(_) | Handler::Mcp(_) => {
                return Err(LavsError::handler(format!(
                    "Handler type '{}' is not supported",
                    endpoint.handler.kind()
                )));
            }
        };

        self.schemas.assert_valid_output(agent_id, &endpoint, &output)?;

        if endpoint.method == EndpointMethod::Mutation {
            let event = format!("{}:mutated", endpoint_id);
            let notified = self.subscriptions.publish_to_agent(
                agent_id,
                &event,
                &json!({ "endpointId": endpoint_id, "result": output }),
            );
            if notified > 0 {
                debug!(notified, event = %event, "Published mutation event");
            }
        }

        Ok(output)
    }

    /// Open a push channel on a `subscription` endpoint.
    pub async fn subscribe(
        &self,
        agent_id: &str,
        endpoint_id: &str,
        sink: Arc<dyn SubscriptionSink>,
    ) -> LavsResult<String> {
        let resolved = self.resolve_endpoint(agent_id, endpoint_id).await?;
        if resolved.endpoint.method != EndpointMethod::Subscription {
            return Err(LavsError::invalid_request(format!(
                "Endpoint '{}' is not a subscription",
                endpoint_id
            )));
        }
        self.subscriptions.subscribe(agent_id, endpoint_id, sink)
    }

    pub async fn tool_definitions(&self, agent_id: &str) -> LavsResult<Vec<ToolDefinition>> {
        let manifest = self.manifest(agent_id).await?;
        Ok(tool_definitions(agent_id, &manifest))
    }

    /// Drop cached manifests and compiled schemas for one agent, or all.
    pub fn clear_cache(&self, agent_id: Option<&str>) {
        self.manifests.clear_cache(agent_id);
        info!(agent_id = ?agent_id, "🧹 LAVS caches cleared");
    }

    pub fn cleanup_rate_limits(&self) -> usize {
        self.rate_limiter.cleanup()
    }

    /// Close every subscription and kill running scripts.
    pub fn shutdown(&self) {
        self.subscriptions.destroy();
        self.scripts.arena().kill_all();
    }
}
