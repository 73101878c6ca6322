//! Document store contract.
//!
//! The lease coordinator only needs a key-addressed document store with point
//! reads, field-level merge writes and an atomic read-modify-write primitive
//! scoped to a single document. Documents are JSON objects addressed by
//! slash-delimited `collection/document[/collection/document...]` paths.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::time::Timestamp;

/// A stored document: a JSON object.
pub type Document = Map<String, Value>;

/// Errors surfaced by document store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid document path: {0}")]
    InvalidPath(String),

    #[error("Transaction on {path} gave up after {attempts} conflicting attempts")]
    Conflict { path: String, attempts: u32 },

    #[error("Store operation timed out: {0}")]
    Timeout(String),

    #[error("Store transport error: {0}")]
    Transport(String),

    #[error("Failed to decode document {path}: {reason}")]
    Decode { path: String, reason: String },
}

/// Validated slash-delimited document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocPath {
    segments: Vec<String>,
}

impl DocPath {
    /// Build a top-level `collection/id` path.
    pub fn new(collection: &str, id: &str) -> Result<Self, StoreError> {
        format!("{collection}/{id}").parse()
    }

    /// Name of the collection directly containing the document.
    pub fn collection(&self) -> &str {
        &self.segments[self.segments.len() - 2]
    }

    /// Document id (last segment).
    pub fn id(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }
}

impl FromStr for DocPath {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches('/');
        let segments: Vec<String> = trimmed.split('/').map(str::to_string).collect();
        if trimmed.is_empty() || segments.iter().any(|seg| seg.trim().is_empty()) {
            return Err(StoreError::InvalidPath(s.to_string()));
        }
        if segments.len() % 2 != 0 {
            return Err(StoreError::InvalidPath(format!(
                "{s} (expected collection/document pairs)"
            )));
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

/// Outcome of a transaction body.
#[derive(Debug)]
pub enum TxWrite<R> {
    /// Replace the document with the given contents and return `R`.
    Commit(Document, R),
    /// Leave the document untouched and return `R`.
    Abort(R),
}

/// Key-addressed document storage.
///
/// `transact` must run its body against a consistent snapshot of one
/// document and commit atomically; implementations may re-run the body when
/// a concurrent writer wins, so it must be free of side effects.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read.
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError>;

    /// Field-level merge write, creating the document when missing.
    ///
    /// Without a mask every field in `fields` is deep-merged. With a mask only
    /// the listed (dotted) field paths are touched: present ones are set,
    /// absent ones are removed.
    async fn patch(
        &self,
        path: &DocPath,
        fields: Document,
        mask: Option<&[&str]>,
    ) -> Result<(), StoreError>;

    /// Atomic read-modify-write of a single document.
    async fn transact<F, R>(&self, path: &DocPath, f: F) -> Result<R, StoreError>
    where
        F: FnMut(Option<&Document>) -> TxWrite<R> + Send,
        R: Send;

    /// Store-assigned current time, used for every staleness comparison.
    async fn server_time(&self) -> Result<Timestamp, StoreError>;
}

/// Apply `patch` semantics to an in-memory document.
pub fn apply_patch(target: &mut Document, fields: &Document, mask: Option<&[&str]>) {
    match mask {
        None => deep_merge(target, fields),
        Some(mask) => {
            for field in mask {
                match lookup(fields, field) {
                    Some(value) => set_field(target, field, value.clone()),
                    None => remove_field(target, field),
                }
            }
        }
    }
}

fn deep_merge(target: &mut Document, overlay: &Document) {
    for (key, value) in overlay {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Look up a dotted field path inside a document.
pub fn lookup<'a>(doc: &'a Document, field: &str) -> Option<&'a Value> {
    let mut parts = field.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn set_field(doc: &mut Document, field: &str, value: Value) {
    let parts: Vec<&str> = field.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = doc;
    for part in parents {
        let entry = current
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert((*last).to_string(), value);
}

fn remove_field(doc: &mut Document, field: &str) {
    let parts: Vec<&str> = field.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };
    let mut current = doc;
    for part in parents {
        match current.get_mut(*part) {
            Some(Value::Object(next)) => current = next,
            _ => return,
        }
    }
    current.remove(*last);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test fixture must be an object"),
        }
    }

    #[test]
    fn parses_collection_document_pairs() {
        let path: DocPath = "configs/current".parse().unwrap();
        assert_eq!(path.collection(), "configs");
        assert_eq!(path.id(), "current");

        let nested: DocPath = "/configs/eu/servers/u08/".parse().unwrap();
        assert_eq!(nested.collection(), "servers");
        assert_eq!(nested.id(), "u08");
        assert_eq!(nested.to_string(), "configs/eu/servers/u08");
    }

    #[test]
    fn rejects_odd_or_empty_paths() {
        assert!("configs".parse::<DocPath>().is_err());
        assert!("".parse::<DocPath>().is_err());
        assert!("codes//abc".parse::<DocPath>().is_err());
        assert!(DocPath::new("codes", "").is_err());
    }

    #[test]
    fn patch_without_mask_deep_merges() {
        let mut target = doc(json!({"active": true, "lock": {"holderId": "a", "platform": "linux"}}));
        let fields = doc(json!({"lock": {"holderId": "b"}}));
        apply_patch(&mut target, &fields, None);
        assert_eq!(
            Value::Object(target),
            json!({"active": true, "lock": {"holderId": "b", "platform": "linux"}})
        );
    }

    #[test]
    fn patch_with_mask_sets_and_removes() {
        let mut target = doc(json!({"active": true, "expiresAt": 10, "lock": {"holderId": "a"}}));
        let fields = doc(json!({"lock": {"renewedAt": 99}, "ignored": 1}));
        apply_patch(&mut target, &fields, Some(&["lock.renewedAt", "expiresAt"]));
        assert_eq!(
            Value::Object(target),
            json!({"active": true, "lock": {"holderId": "a", "renewedAt": 99}})
        );
    }

    #[test]
    fn lookup_follows_dotted_paths() {
        let d = doc(json!({"lock": {"holderId": "a"}}));
        assert_eq!(lookup(&d, "lock.holderId"), Some(&json!("a")));
        assert!(lookup(&d, "lock.missing").is_none());
        assert!(lookup(&d, "active.nested").is_none());
    }
}
