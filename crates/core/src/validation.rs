use lavs_shared::{is_valid_identifier, LavsError, LavsResult};
use serde::Deserialize;
use serde_json::Value;
use validator::Validate;

pub fn validate_identifier(kind: &str, value: &str) -> LavsResult<()> {
    if is_valid_identifier(value) {
        Ok(())
    } else {
        Err(LavsError::invalid_request(format!("Invalid {}: '{}'", kind, value)))
    }
}

pub fn validate_agent_id(agent_id: &str) -> LavsResult<()> {
    validate_identifier("agent id", agent_id)
}

pub fn validate_endpoint_id(endpoint_id: &str) -> LavsResult<()> {
    validate_identifier("endpoint id", endpoint_id)
}

/// Body of `POST /api/lavs/:agent/:endpoint`.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CallEndpointRequest {
    #[serde(default)]
    pub input: Value,

    #[validate(length(min = 1, max = 4096, message = "Project path must be 1-4096 characters"))]
    pub project_path: Option<String>,
}

/// Body of `POST /api/lavs/cache/clear`.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheRequest {
    #[validate(length(min = 1, max = 128, message = "Agent ID must be 1-128 characters"))]
    pub agent_id: Option<String>,
}

/// Validation helper function
pub fn validate_request<T: Validate>(req: &T) -> LavsResult<()> {
    req.validate()
        .map_err(|e| LavsError::invalid_request(format!("Validation error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lavs_shared::LavsErrorCode;
    use serde_json::json;

    #[test]
    fn test_identifier_rules() {
        let longest = "x".repeat(128);
        let too_long = "x".repeat(129);

        for ok in ["notes", "todo-app", "agent.v2", "a_b", longest.as_str()] {
            assert!(validate_agent_id(ok).is_ok(), "{} should be valid", ok);
        }
        for bad in ["", ".", "..", "../etc", "a/b", "a b", "naïve", too_long.as_str()] {
            let err = validate_agent_id(bad).unwrap_err();
            assert_eq!(err.code, LavsErrorCode::InvalidRequest);
        }
    }

    #[test]
    fn test_call_request_defaults_input_to_null() {
        let req: CallEndpointRequest = serde_json::from_value(json!({})).unwrap();
        assert_eq!(req.input, Value::Null);
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn test_call_request_rejects_empty_project_path() {
        let req: CallEndpointRequest =
            serde_json::from_value(json!({ "input": {"a": 1}, "projectPath": "" })).unwrap();
        assert!(validate_request(&req).is_err());
    }

    #[test]
    fn test_clear_cache_request() {
        let all: ClearCacheRequest = serde_json::from_value(json!({})).unwrap();
        assert!(validate_request(&all).is_ok());

        let too_long = ClearCacheRequest {
            agent_id: Some("a".repeat(200)),
        };
        assert!(validate_request(&too_long).is_err());
    }
}
