use lavs_shared::{Endpoint, LavsError, LavsResult, Manifest};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

use crate::cache::{KeyedStore, MemoryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDirection {
    Input,
    Output,
}

impl SchemaDirection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.path, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<SchemaViolation>,
}

impl ValidationOutcome {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// `path message; path message; ...`
    #[must_use]
    pub fn summary(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Compiles and caches JSON Schema validators for endpoint input and output.
///
/// Validation is opt-in: an endpoint without a schema on one side is always
/// valid on that side. Compilation is lazy and fails closed.
pub struct SchemaValidator {
    store: Arc<dyn KeyedStore<CompiledSchema>>,
}

/// A validator together with the schema document it was compiled from.
pub struct CompiledSchema {
    source: Value,
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    #[must_use]
    pub fn source(&self) -> &Value {
        &self.source
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn KeyedStore<CompiledSchema>>) -> Self {
        Self { store }
    }

    fn cache_key(agent_id: &str, direction: SchemaDirection, endpoint_id: &str) -> String {
        format!("{}:{}:{}", agent_id, direction.as_str(), endpoint_id)
    }

    fn schema_for(endpoint: &Endpoint, direction: SchemaDirection) -> Option<&Value> {
        let schema = endpoint.schema.as_ref()?;
        match direction {
            SchemaDirection::Input => schema.input.as_ref(),
            SchemaDirection::Output => schema.output.as_ref(),
        }
    }

    /// Fetch (or compile and cache) the validator for one side of an endpoint.
    /// A compile failure is raised immediately and never cached.
    ///
    /// A cached entry is only reused when it was compiled from the same schema
    /// document the caller holds, so a call still running against a replaced
    /// manifest can never leave its schema behind for later calls.
    fn compiled(
        &self,
        agent_id: &str,
        endpoint: &Endpoint,
        direction: SchemaDirection,
    ) -> LavsResult<Option<Arc<CompiledSchema>>> {
        let Some(schema) = Self::schema_for(endpoint, direction) else {
            return Ok(None);
        };

        let key = Self::cache_key(agent_id, direction, &endpoint.id);
        if let Some(compiled) = self.store.get(&key) {
            if compiled.source == *schema {
                return Ok(Some(compiled));
            }
            debug!(key = %key, "Cached validator is for a different schema; recompiling");
        }

        let validator = jsonschema::validator_for(schema).map_err(|e| {
            error!(
                agent_id = %agent_id,
                endpoint_id = %endpoint.id,
                direction = direction.as_str(),
                "Schema compilation failed: {}",
                e
            );
            LavsError::internal(format!(
                "Invalid {} schema for endpoint '{}': {}",
                direction.as_str(),
                endpoint.id,
                e
            ))
        })?;
        debug!(key = %key, "Compiled schema validator");

        let compiled = Arc::new(CompiledSchema {
            source: schema.clone(),
            validator,
        });
        self.store.put(&key, compiled.clone());
        Ok(Some(compiled))
    }

    fn validate(
        &self,
        agent_id: &str,
        endpoint: &Endpoint,
        direction: SchemaDirection,
        value: &Value,
    ) -> LavsResult<ValidationOutcome> {
        let Some(compiled) = self.compiled(agent_id, endpoint, direction)? else {
            return Ok(ValidationOutcome::ok());
        };

        let errors: Vec<SchemaViolation> = compiled
            .validator
            .iter_errors(value)
            .map(|e| {
                let path = e.instance_path.to_string();
                SchemaViolation {
                    path: if path.is_empty() { "/".to_string() } else { path },
                    message: e.to_string(),
                }
            })
            .collect();

        Ok(ValidationOutcome {
            valid: errors.is_empty(),
            errors,
        })
    }

    pub fn validate_input(
        &self,
        agent_id: &str,
        endpoint: &Endpoint,
        value: &Value,
    ) -> LavsResult<ValidationOutcome> {
        self.validate(agent_id, endpoint, SchemaDirection::Input, value)
    }

    pub fn validate_output(
        &self,
        agent_id: &str,
        endpoint: &Endpoint,
        value: &Value,
    ) -> LavsResult<ValidationOutcome> {
        self.validate(agent_id, endpoint, SchemaDirection::Output, value)
    }

    /// Invalid input is the caller's fault: `InvalidParams`.
    pub fn assert_valid_input(
        &self,
        agent_id: &str,
        endpoint: &Endpoint,
        value: &Value,
    ) -> LavsResult<()> {
        let outcome = self.validate_input(agent_id, endpoint, value)?;
        if outcome.valid {
            return Ok(());
        }
        Err(LavsError::invalid_params(format!(
            "Input validation failed: {}",
            outcome.summary()
        ))
        .with_data(serde_json::json!({ "errors": outcome.errors })))
    }

    /// Invalid output is the handler's bug: `InternalError`.
    pub fn assert_valid_output(
        &self,
        agent_id: &str,
        endpoint: &Endpoint,
        value: &Value,
    ) -> LavsResult<()> {
        let outcome = self.validate_output(agent_id, endpoint, value)?;
        if outcome.valid {
            return Ok(());
        }
        Err(LavsError::internal(format!(
            "Output validation failed: {}",
            outcome.summary()
        ))
        .with_data(serde_json::json!({ "errors": outcome.errors })))
    }

    /// Compile every schema a manifest declares. Returns the number compiled.
    pub fn compile_manifest(&self, agent_id: &str, manifest: &Manifest) -> LavsResult<usize> {
        let mut count = 0;
        for endpoint in &manifest.endpoints {
            for direction in [SchemaDirection::Input, SchemaDirection::Output] {
                if self.compiled(agent_id, endpoint, direction)?.is_some() {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    pub fn clear_agent(&self, agent_id: &str) {
        let prefix = format!("{}:", agent_id);
        self.store.retain(&|k| !k.starts_with(&prefix));
    }

    pub fn clear_all(&self) {
        self.store.clear();
    }

    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lavs_shared::LavsErrorCode;
    use serde_json::json;

    fn endpoint(schema: Value) -> Endpoint {
        serde_json::from_value(json!({
            "id": "addTodo",
            "method": "mutation",
            "handler": { "type": "script", "command": "true" },
            "schema": schema
        }))
        .unwrap()
    }

    fn todo_endpoint() -> Endpoint {
        endpoint(json!({
            "input": {
                "type": "object",
                "properties": { "title": { "type": "string" } },
                "required": ["title"]
            },
            "output": { "type": "object", "required": ["id"] }
        }))
    }

    #[test]
    fn test_missing_schema_is_always_valid() {
        let validator = SchemaValidator::new();
        let ep: Endpoint = serde_json::from_value(json!({
            "id": "free",
            "method": "query",
            "handler": { "type": "script", "command": "true" }
        }))
        .unwrap();

        assert!(validator.validate_input("a", &ep, &json!(42)).unwrap().valid);
        assert!(validator.validate_output("a", &ep, &json!(null)).unwrap().valid);
        assert_eq!(validator.cached_count(), 0);
    }

    #[test]
    fn test_invalid_input_raises_invalid_params() {
        let validator = SchemaValidator::new();
        let ep = todo_endpoint();

        assert!(validator
            .assert_valid_input("a", &ep, &json!({"title": "milk"}))
            .is_ok());

        let err = validator
            .assert_valid_input("a", &ep, &json!({"title": 7}))
            .unwrap_err();
        assert_eq!(err.code, LavsErrorCode::InvalidParams);
        assert!(err.message.contains("/title"), "message: {}", err.message);
    }

    #[test]
    fn test_invalid_output_raises_internal_error() {
        let validator = SchemaValidator::new();
        let ep = todo_endpoint();

        let err = validator
            .assert_valid_output("a", &ep, &json!({"title": "x"}))
            .unwrap_err();
        assert_eq!(err.code, LavsErrorCode::InternalError);
        assert!(err.message.starts_with("Output validation failed"));
    }

    #[test]
    fn test_compile_failure_is_internal_error_and_not_cached() {
        let validator = SchemaValidator::new();
        let ep = endpoint(json!({ "input": { "type": "no-such-type" } }));

        let err = validator.validate_input("a", &ep, &json!({})).unwrap_err();
        assert_eq!(err.code, LavsErrorCode::InternalError);
        assert_eq!(validator.cached_count(), 0);
    }

    #[test]
    fn test_validators_are_cached_per_agent_and_cleared() {
        let validator = SchemaValidator::new();
        let ep = todo_endpoint();

        validator.validate_input("a", &ep, &json!({"title": "x"})).unwrap();
        validator.validate_input("a", &ep, &json!({"title": "y"})).unwrap();
        validator.validate_output("a", &ep, &json!({"id": 1})).unwrap();
        validator.validate_input("b", &ep, &json!({"title": "z"})).unwrap();
        assert_eq!(validator.cached_count(), 3);

        validator.clear_agent("a");
        assert_eq!(validator.cached_count(), 1);

        validator.clear_all();
        assert_eq!(validator.cached_count(), 0);
    }

    #[test]
    fn test_outdated_endpoint_cannot_poison_the_cache() {
        let validator = SchemaValidator::new();
        let old = endpoint(json!({ "output": { "type": "object", "required": ["a"] } }));
        let new = endpoint(json!({ "output": { "type": "object", "required": ["zzz"] } }));

        // a call holding the old manifest compiles after the cache was cleared
        validator.clear_agent("m");
        assert!(validator.validate_output("m", &old, &json!({"a": 1})).unwrap().valid);

        let outcome = validator.validate_output("m", &new, &json!({"a": 1})).unwrap();
        assert!(!outcome.valid);

        // and again in the other order
        assert!(validator.validate_output("m", &old, &json!({"a": 1})).unwrap().valid);
        assert!(!validator.validate_output("m", &new, &json!({"a": 1})).unwrap().valid);
        assert_eq!(validator.cached_count(), 1);
    }
}
