//! Administrative operations on codes and connection descriptors.
//!
//! Codes and descriptors are owned by the operator; clients only read them.
//! These helpers write the documents the lease coordinator expects.

use serde_json::{Value, json};
use tracing::info;

use svpn_core::document::{DocPath, Document, DocumentStore, StoreError, TxWrite};
use svpn_core::time::Timestamp;
use svpn_core::tunnel_config::{DescriptorError, compile};

use crate::storage::Catalog;

const CONNECTION_FIELD: &str = "connectionPath";
const LEGACY_CONNECTION_FIELD: &str = "vlessPath";

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("Code {0} not found")]
    NotFound(String),

    #[error("Refusing to store descriptor: {0}")]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fields of a new or updated code.
#[derive(Debug, Clone)]
pub struct CodeSpec {
    pub active: bool,
    pub expires_at: Option<Timestamp>,
    pub connection_path: Option<String>,
}

impl Default for CodeSpec {
    fn default() -> Self {
        Self {
            active: true,
            expires_at: None,
            connection_path: None,
        }
    }
}

fn object(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Create a code or update its settings. An existing lease is kept.
pub async fn add_code<S: DocumentStore>(
    store: &S,
    catalog: &Catalog,
    code: &str,
    spec: &CodeSpec,
) -> Result<DocPath, AdminError> {
    let path = catalog.code_path(code)?;
    let mut fields = object(json!({ "active": spec.active }));
    let mut mask = vec!["active"];
    if let Some(expires_at) = spec.expires_at {
        fields.insert("expiresAt".into(), json!(expires_at));
        mask.push("expiresAt");
    }
    if let Some(connection) = &spec.connection_path {
        // Validate before storing.
        catalog.connection_path(Some(connection.as_str()))?;
        fields.insert(CONNECTION_FIELD.into(), json!(connection));
        // Masked out of `fields`, so the legacy name is removed.
        mask.extend([CONNECTION_FIELD, LEGACY_CONNECTION_FIELD]);
    }
    store.patch(&path, fields, Some(mask.as_slice())).await?;
    info!(code, active = spec.active, "Code saved");
    Ok(path)
}

/// Deactivate a code. A connected holder is evicted on its next heartbeat.
pub async fn revoke_code<S: DocumentStore>(
    store: &S,
    catalog: &Catalog,
    code: &str,
) -> Result<(), AdminError> {
    let path = catalog.code_path(code)?;
    let found = store
        .transact(&path, |doc| match doc {
            Some(doc) => {
                let mut updated = doc.clone();
                updated.insert("active".into(), Value::Bool(false));
                TxWrite::Commit(updated, true)
            }
            None => TxWrite::Abort(false),
        })
        .await?;
    if !found {
        return Err(AdminError::NotFound(code.trim().to_string()));
    }
    info!(code, "Code revoked");
    Ok(())
}

/// Store a connection descriptor after checking that it compiles.
pub async fn set_connection<S: DocumentStore>(
    store: &S,
    catalog: &Catalog,
    path: Option<&str>,
    descriptor: &str,
) -> Result<DocPath, AdminError> {
    let descriptor = descriptor.trim();
    compile(descriptor)?;
    let path = catalog.connection_path(path)?;
    store
        .patch(&path, object(json!({ "descriptor": descriptor })), Some(&["descriptor"]))
        .await?;
    info!(path = %path, "Connection descriptor saved");
    Ok(path)
}
