//! Where things live in the document store.
//!
//! Codes are documents in one collection keyed by the code itself. Each code
//! may name the document holding its connection descriptor; codes that do
//! not fall back to a shared default.

use svpn_core::config::StoreConfig;
use svpn_core::document::{DocPath, DocumentStore, StoreError};
use tracing::debug;

/// Descriptor field names, newest first.
pub const DESCRIPTOR_FIELDS: [&str; 2] = ["descriptor", "vless"];

/// Errors resolving a connection descriptor.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Connection document {0} not found")]
    MissingDocument(String),

    #[error("Connection document {0} has no descriptor")]
    MissingDescriptor(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Document path layout.
#[derive(Debug, Clone)]
pub struct Catalog {
    codes_collection: String,
    default_connection: String,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

impl Catalog {
    pub fn new(codes_collection: impl Into<String>, default_connection: impl Into<String>) -> Self {
        Self {
            codes_collection: codes_collection.into(),
            default_connection: default_connection.into(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.codes_collection.clone(),
            config.default_connection_path.clone(),
        )
    }

    /// Document path of a code.
    pub fn code_path(&self, code: &str) -> Result<DocPath, StoreError> {
        let code = code.trim();
        if code.contains('/') {
            return Err(StoreError::InvalidPath(format!(
                "code {code:?} must not contain '/'"
            )));
        }
        DocPath::new(&self.codes_collection, code)
    }

    /// Connection document for a code's configured path, or the default.
    pub fn connection_path(&self, configured: Option<&str>) -> Result<DocPath, StoreError> {
        let raw = configured
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.default_connection);
        raw.parse()
    }

    /// Read the descriptor string stored at `path`.
    pub async fn fetch_descriptor<S>(&self, store: &S, path: &DocPath) -> Result<String, CatalogError>
    where
        S: DocumentStore + ?Sized,
    {
        let doc = store
            .get(path)
            .await?
            .ok_or_else(|| CatalogError::MissingDocument(path.to_string()))?;

        let descriptor = DESCRIPTOR_FIELDS
            .iter()
            .filter_map(|field| doc.get(*field).and_then(|v| v.as_str()))
            .map(str::trim)
            .find(|s| !s.is_empty())
            .ok_or_else(|| CatalogError::MissingDescriptor(path.to_string()))?;

        debug!(path = %path, "Fetched connection descriptor");
        Ok(descriptor.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[test]
    fn code_paths_live_in_codes_collection() {
        let catalog = Catalog::default();
        assert_eq!(catalog.code_path(" ABC-123 ").unwrap().to_string(), "codes/ABC-123");
        assert!(catalog.code_path("a/b").is_err());
        assert!(catalog.code_path("").is_err());
    }

    #[test]
    fn connection_path_defaults_to_current() {
        let catalog = Catalog::default();
        assert_eq!(catalog.connection_path(None).unwrap().to_string(), "configs/current");
        assert_eq!(catalog.connection_path(Some("  ")).unwrap().to_string(), "configs/current");
        assert_eq!(
            catalog
                .connection_path(Some("configs/eu/servers/u08"))
                .unwrap()
                .to_string(),
            "configs/eu/servers/u08"
        );
        assert!(catalog.connection_path(Some("configs")).is_err());
    }

    #[tokio::test]
    async fn fetch_descriptor_reads_either_field() {
        let store = MemoryStore::new();
        let catalog = Catalog::default();
        let current: DocPath = "configs/current".parse().unwrap();
        let legacy: DocPath = "configs/legacy".parse().unwrap();

        let mut doc = svpn_core::Document::new();
        doc.insert("descriptor".into(), json!(" vless://u@h:443 "));
        store.insert(&current, doc).await;
        let mut doc = svpn_core::Document::new();
        doc.insert("vless".into(), json!("vless://u@old:443"));
        store.insert(&legacy, doc).await;

        assert_eq!(catalog.fetch_descriptor(&store, &current).await.unwrap(), "vless://u@h:443");
        assert_eq!(catalog.fetch_descriptor(&store, &legacy).await.unwrap(), "vless://u@old:443");
    }

    #[tokio::test]
    async fn missing_descriptor_is_reported() {
        let store = MemoryStore::new();
        let catalog = Catalog::default();
        let path: DocPath = "configs/current".parse().unwrap();
        assert!(matches!(
            catalog.fetch_descriptor(&store, &path).await,
            Err(CatalogError::MissingDocument(_))
        ));

        store.insert(&path, svpn_core::Document::new()).await;
        assert!(matches!(
            catalog.fetch_descriptor(&store, &path).await,
            Err(CatalogError::MissingDescriptor(_))
        ));
    }
}
