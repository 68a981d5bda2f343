pub mod manifest;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use manifest::{
    is_valid_identifier, Endpoint, EndpointMethod, EndpointSchema, FunctionHandler, Handler,
    HttpHandler, InputMode, Manifest, McpHandler, Permissions, ScriptHandler, ViewConfig,
    MAX_IDENTIFIER_LEN,
};

/// Protocol version carried in every response envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error taxonomy shared by every component of the gateway.
///
/// The first five codes are the standard JSON-RPC 2.0 codes; the rest live in the
/// implementation-defined `-32000..-32099` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LavsErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    PermissionDenied,
    Timeout,
    HandlerError,
    RateLimited,
    CapacityExceeded,
}

impl LavsErrorCode {
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::PermissionDenied => -32001,
            Self::Timeout => -32002,
            Self::HandlerError => -32003,
            Self::RateLimited => -32029,
            Self::CapacityExceeded => -32030,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        [
            Self::ParseError,
            Self::InvalidRequest,
            Self::MethodNotFound,
            Self::InvalidParams,
            Self::InternalError,
            Self::PermissionDenied,
            Self::Timeout,
            Self::HandlerError,
            Self::RateLimited,
            Self::CapacityExceeded,
        ]
        .into_iter()
        .find(|c| c.code() == code)
    }

    /// Transport status used by the HTTP layer.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::ParseError | Self::InvalidRequest | Self::InvalidParams => 400,
            Self::MethodNotFound => 404,
            Self::PermissionDenied => 403,
            Self::Timeout => 504,
            Self::HandlerError | Self::InternalError => 500,
            Self::RateLimited => 429,
            Self::CapacityExceeded => 503,
        }
    }
}

impl std::fmt::Display for LavsErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Serialize for LavsErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for LavsErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Self::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown LAVS error code {}", code)))
    }
}

/// The only error type crossing the gateway's public boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct LavsError {
    pub code: LavsErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Set when an `InvalidRequest` refers to something absent on disk
    /// (agent directory or manifest), so the transport answers 404 instead of 400.
    #[serde(skip)]
    pub not_found: bool,
}

impl LavsError {
    pub fn new(code: LavsErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
            not_found: false,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(LavsErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(LavsErrorCode::InvalidRequest, message)
    }

    /// `InvalidRequest` for a resource that does not exist (404 on the wire).
    pub fn not_found(message: impl Into<String>) -> Self {
        let mut err = Self::new(LavsErrorCode::InvalidRequest, message);
        err.not_found = true;
        err
    }

    pub fn method_not_found(endpoint_id: &str) -> Self {
        Self::new(
            LavsErrorCode::MethodNotFound,
            format!("Endpoint not found: {}", endpoint_id),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(LavsErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(LavsErrorCode::InternalError, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(LavsErrorCode::PermissionDenied, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LavsErrorCode::Timeout, message)
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(LavsErrorCode::HandlerError, message)
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        if self.code == LavsErrorCode::InvalidRequest && self.not_found {
            404
        } else {
            self.code.http_status()
        }
    }

    /// Error object as it appears inside the response envelope.
    #[must_use]
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.code.code(),
            message: self.message.clone(),
            data: self.data.clone(),
        }
    }
}

pub type LavsResult<T> = std::result::Result<T, LavsError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 style response envelope: exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    #[must_use]
    pub fn success(result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(error: &LavsError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error.to_rpc_error()),
        }
    }

    #[must_use]
    pub fn from_result(result: &LavsResult<Value>) -> Self {
        match result {
            Ok(value) => Self::success(value.clone()),
            Err(e) => Self::failure(e),
        }
    }
}
