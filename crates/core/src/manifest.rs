use lavs_shared::{LavsError, LavsResult, Manifest};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::cache::{KeyedStore, MemoryStore};
use crate::schema::SchemaValidator;

/// Default manifest file name inside an agent directory.
pub const MANIFEST_FILE_NAME: &str = "lavs.json";

/// Reads, parses and caches manifests by agent id.
///
/// The cache is only invalidated explicitly through [`ManifestLoader::clear_cache`],
/// which also drops the compiled schema validators of the affected agents.
pub struct ManifestLoader {
    store: Arc<dyn KeyedStore<Manifest>>,
    schemas: Arc<SchemaValidator>,
    file_name: String,
    /// Bumped by every clear. A load only caches its result if no clear
    /// happened while it was reading.
    generation: Mutex<u64>,
}

impl ManifestLoader {
    #[must_use]
    pub fn new(schemas: Arc<SchemaValidator>) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), schemas)
    }

    #[must_use]
    pub fn with_store(store: Arc<dyn KeyedStore<Manifest>>, schemas: Arc<SchemaValidator>) -> Self {
        Self {
            store,
            schemas,
            file_name: MANIFEST_FILE_NAME.to_string(),
            generation: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = file_name.into();
        self
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Read and parse a manifest file without touching the cache.
    pub async fn load(&self, path: &Path) -> LavsResult<Manifest> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LavsError::not_found(format!(
                    "Manifest not found: {}",
                    path.display()
                )));
            }
            Err(e) => {
                return Err(LavsError::internal(format!(
                    "Failed to read manifest {}: {}",
                    path.display(),
                    e
                )));
            }
        };
        Manifest::from_json_str(&text)
    }

    /// Cached load of `<agent_dir>/<file_name>`.
    pub async fn load_for_agent(&self, agent_id: &str, agent_dir: &Path) -> LavsResult<Arc<Manifest>> {
        if let Some(manifest) = self.store.get(agent_id) {
            return Ok(manifest);
        }

        let generation = self.generation();
        let path = agent_dir.join(&self.file_name);
        let manifest = Arc::new(self.load(&path).await?);
        info!(
            agent_id = %agent_id,
            endpoints = manifest.endpoints.len(),
            "📄 Loaded LAVS manifest from {}",
            path.display()
        );
        if !self.cache_if_current(agent_id, generation, manifest.clone()) {
            debug!(agent_id = %agent_id, "Cache cleared during load; result not cached");
        }
        Ok(manifest)
    }

    fn generation(&self) -> u64 {
        *self.generation.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `manifest` unless a clear happened since `generation` was read.
    /// The check and the insert happen under the same lock as the clear.
    fn cache_if_current(&self, agent_id: &str, generation: u64, manifest: Arc<Manifest>) -> bool {
        let current = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            return false;
        }
        self.store.put(agent_id, manifest);
        true
    }

    /// Drop one agent's manifest (or all manifests) plus the matching validators.
    pub fn clear_cache(&self, agent_id: Option<&str>) {
        let mut generation = self.generation.lock().unwrap_or_else(PoisonError::into_inner);
        *generation = generation.wrapping_add(1);
        match agent_id {
            Some(id) => {
                self.store.remove(id);
                self.schemas.clear_agent(id);
                debug!(agent_id = %id, "Cleared manifest cache");
            }
            None => {
                self.store.clear();
                self.schemas.clear_all();
                debug!("Cleared all manifest caches");
            }
        }
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

    fn write_manifest(dir: &Path, body: &serde_json::Value) {
        std::fs::write(dir.join(MANIFEST_FILE_NAME), body.to_string()).unwrap();
    }

    fn sample() -> serde_json::Value {
        json!({
            "name": "notes",
            "endpoints": [{
                "id": "list",
                "method": "query",
                "handler": { "type": "script", "command": "cat" },
                "schema": { "input": { "type": "object" } }
            }]
        })
    }

    #[tokio::test]
    async fn test_missing_manifest_is_invalid_request() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ManifestLoader::new(Arc::new(SchemaValidator::new()));

        let err = loader.load_for_agent("notes", dir.path()).await.unwrap_err();
        assert_eq!(err.code, LavsErrorCode::InvalidRequest);
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_malformed_manifest_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_NAME), "{ \"name\": ").unwrap();
        let loader = ManifestLoader::new(Arc::new(SchemaValidator::new()));

        let err = loader.load_for_agent("notes", dir.path()).await.unwrap_err();
        assert_eq!(err.code, LavsErrorCode::ParseError);
        assert_eq!(loader.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_survives_file_edit_until_cleared() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), &sample());
        let schemas = Arc::new(SchemaValidator::new());
        let loader = ManifestLoader::new(schemas.clone());

        let first = loader.load_for_agent("notes", dir.path()).await.unwrap();
        assert_eq!(first.name, "notes");
        schemas
            .validate_input("notes", &first.endpoints[0], &json!({}))
            .unwrap();
        assert_eq!(schemas.cached_count(), 1);

        let mut edited = sample();
        edited["name"] = json!("notes-v2");
        write_manifest(dir.path(), &edited);

        let cached = loader.load_for_agent("notes", dir.path()).await.unwrap();
        assert_eq!(cached.name, "notes");

        loader.clear_cache(Some("notes"));
        assert_eq!(schemas.cached_count(), 0);
        let reloaded = loader.load_for_agent("notes", dir.path()).await.unwrap();
        assert_eq!(reloaded.name, "notes-v2");
    }

    #[tokio::test]
    async fn test_clear_all() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        write_manifest(a.path(), &sample());
        write_manifest(b.path(), &sample());
        let loader = ManifestLoader::new(Arc::new(SchemaValidator::new()));

        loader.load_for_agent("a", a.path()).await.unwrap();
        loader.load_for_agent("b", b.path()).await.unwrap();
        assert_eq!(loader.cached_count(), 2);

        loader.clear_cache(None);
        assert_eq!(loader.cached_count(), 0);
    }

    #[tokio::test]
    async fn test_load_racing_a_clear_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), &sample());
        let loader = ManifestLoader::new(Arc::new(SchemaValidator::new()));

        // the read happens between taking the generation and caching the result
        let generation = loader.generation();
        let stale = Arc::new(loader.load(&dir.path().join(MANIFEST_FILE_NAME)).await.unwrap());

        let mut edited = sample();
        edited["name"] = json!("notes-v2");
        write_manifest(dir.path(), &edited);
        loader.clear_cache(Some("notes"));

        assert!(!loader.cache_if_current("notes", generation, stale));
        assert_eq!(loader.cached_count(), 0);

        let fresh = loader.load_for_agent("notes", dir.path()).await.unwrap();
        assert_eq!(fresh.name, "notes-v2");
        assert_eq!(loader.cached_count(), 1);
    }
}
