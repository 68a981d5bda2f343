//! HTTP glue over the [`Dispatcher`](crate::dispatcher::Dispatcher).
//!
//! Every response body is the JSON-RPC style envelope. Errors are rendered by
//! [`AppError`](crate::AppError).

use axum::{
    body::Bytes,
    extract::{Path, State},
    response::sse::{Event, Sse},
    Json,
};
use futures::Stream;
use lavs_shared::{LavsError, RpcResponse};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

use crate::subscriptions::{ChannelSink, SubscriptionManager};
use crate::validation::{validate_request, CallEndpointRequest, ClearCacheRequest};
use crate::{AppResult, AppState};

/// Frames buffered per SSE connection before new ones are dropped.
const SSE_CHANNEL_CAPACITY: usize = 64;

/// Empty body means "all defaults"; anything else must be valid JSON.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, LavsError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| LavsError::parse_error(format!("Invalid JSON body: {}", e)))
}

async fn call(
    state: &AppState,
    agent_id: &str,
    endpoint_id: &str,
    body: &Bytes,
) -> AppResult<Json<RpcResponse>> {
    let req: CallEndpointRequest = parse_body(body)?;
    validate_request(&req)?;

    let caller_env = req.project_path.map(|path| {
        let mut env = HashMap::new();
        env.insert("LAVS_PROJECT_PATH".to_string(), path);
        env
    });

    let result = state
        .dispatcher
        .call_endpoint(agent_id, endpoint_id, req.input, caller_env)
        .await?;
    Ok(Json(RpcResponse::success(result)))
}

/// Call a query or mutation endpoint.
///
/// **Route:** `POST /api/lavs/:agent/:endpoint`
///
/// Body: `{ "input": <any>, "projectPath"?: string }`. `projectPath` reaches
/// scripts as `LAVS_PROJECT_PATH`.
pub async fn call_endpoint_handler(
    State(state): State<Arc<AppState>>,
    Path((agent_id, endpoint_id)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<Json<RpcResponse>> {
    call(&state, &agent_id, &endpoint_id, &body).await
}

/// `POST /api/lavs/:agent/tools` shares its path with the tool listing; it
/// still calls an endpoint named `tools`.
pub async fn call_tools_endpoint_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    body: Bytes,
) -> AppResult<Json<RpcResponse>> {
    call(&state, &agent_id, "tools", &body).await
}

/// Releases the subscription when the client goes away and axum drops the stream.
struct SubscriptionGuard {
    manager: Arc<SubscriptionManager>,
    id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if self.manager.release(&self.id) {
            debug!(subscription_id = %self.id, "SSE client disconnected");
        }
    }
}

/// Open a subscription as a Server-Sent Events stream.
///
/// **Route:** `GET /api/lavs/:agent/:endpoint/subscribe`
///
/// # Behavior
/// 1. Sends a `connected` event carrying the subscription id
/// 2. Streams published events as `event: <name>` frames
/// 3. Heartbeats arrive as SSE comments
/// 4. A `disconnected` event precedes any server-side close
pub async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Path((agent_id, endpoint_id)): Path<(String, String)>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let (sink, mut rx) = ChannelSink::channel(SSE_CHANNEL_CAPACITY);
    let id = state
        .dispatcher
        .subscribe(&agent_id, &endpoint_id, sink)
        .await?;

    let guard = SubscriptionGuard {
        manager: state.dispatcher.subscriptions().clone(),
        id,
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        while let Some(frame) = rx.recv().await {
            yield Ok(frame.to_axum_event());
        }
    };
    Ok(Sse::new(stream))
}

/// **Route:** `GET /api/lavs/:agent`
pub async fn manifest_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> AppResult<Json<RpcResponse>> {
    let manifest = state.dispatcher.manifest(&agent_id).await?;
    let value = serde_json::to_value(&*manifest)?;
    Ok(Json(RpcResponse::success(value)))
}

/// Function-tool definitions for the agent's query and mutation endpoints.
///
/// **Route:** `GET /api/lavs/:agent/tools`
pub async fn tools_handler(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> AppResult<Json<RpcResponse>> {
    let tools = state.dispatcher.tool_definitions(&agent_id).await?;
    Ok(Json(RpcResponse::success(serde_json::to_value(tools)?)))
}

/// Drop cached manifests and schemas, for one agent or all of them.
///
/// **Route:** `POST /api/lavs/cache/clear`
pub async fn clear_cache_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> AppResult<Json<RpcResponse>> {
    let req: ClearCacheRequest = parse_body(&body)?;
    validate_request(&req)?;

    state.dispatcher.clear_cache(req.agent_id.as_deref());
    Ok(Json(RpcResponse::success(json!({
        "cleared": req.agent_id.unwrap_or_else(|| "all".to_string()),
    }))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lavs_shared::LavsErrorCode;

    #[test]
    fn test_parse_body_empty_is_default() {
        let req: ClearCacheRequest = parse_body(&Bytes::from_static(b"  \n")).unwrap();
        assert!(req.agent_id.is_none());
    }

    #[test]
    fn test_parse_body_malformed_is_parse_error() {
        let err = parse_body::<CallEndpointRequest>(&Bytes::from_static(b"{ nope")).unwrap_err();
        assert_eq!(err.code, LavsErrorCode::ParseError);
        assert_eq!(err.http_status(), 400);
    }
}
