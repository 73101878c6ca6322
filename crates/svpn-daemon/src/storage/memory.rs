//! In-process [`DocumentStore`] with a manual clock.
//!
//! Transactions run under one lock, so they are trivially serializable.
//! Tests drive staleness by moving the clock and simulate outages with
//! injected failures or latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use svpn_core::document::{DocPath, Document, DocumentStore, StoreError, TxWrite, apply_patch};
use svpn_core::time::Timestamp;

/// Clock origin for new stores: 2023-11-14T22:13:20Z.
pub const DEFAULT_START: Timestamp = Timestamp::from_millis(1_700_000_000_000);

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, Document>>,
    now_ms: AtomicI64,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::starting_at(DEFAULT_START)
    }

    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            now_ms: AtomicI64::new(start.as_millis()),
            ..Self::default()
        }
    }

    /// Current value of the store clock.
    pub fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.now_ms.load(Ordering::SeqCst))
    }

    pub fn set_time(&self, now: Timestamp) {
        self.now_ms.store(now.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.set_time(self.now() + by);
    }

    /// Make the next `n` operations fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Replace a document outright.
    pub async fn insert(&self, path: &DocPath, doc: Document) {
        self.docs.lock().await.insert(path.to_string(), doc);
    }

    /// Remove a document.
    pub async fn remove(&self, path: &DocPath) -> Option<Document> {
        self.docs.lock().await.remove(&path.to_string())
    }

    async fn enter(&self, op: &str) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transport(format!("{op}: injected failure")));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        self.enter("get").await?;
        Ok(self.docs.lock().await.get(&path.to_string()).cloned())
    }

    async fn patch(
        &self,
        path: &DocPath,
        fields: Document,
        mask: Option<&[&str]>,
    ) -> Result<(), StoreError> {
        self.enter("patch").await?;
        let mut docs = self.docs.lock().await;
        let doc = docs.entry(path.to_string()).or_default();
        apply_patch(doc, &fields, mask);
        Ok(())
    }

    async fn transact<F, R>(&self, path: &DocPath, mut f: F) -> Result<R, StoreError>
    where
        F: FnMut(Option<&Document>) -> TxWrite<R> + Send,
        R: Send,
    {
        self.enter("transact").await?;
        let key = path.to_string();
        let mut docs = self.docs.lock().await;
        match f(docs.get(&key)) {
            TxWrite::Commit(doc, result) => {
                docs.insert(key, doc);
                Ok(result)
            }
            TxWrite::Abort(result) => Ok(result),
        }
    }

    async fn server_time(&self) -> Result<Timestamp, StoreError> {
        self.enter("server_time").await?;
        Ok(self.now())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(s: &str) -> DocPath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn clock_is_manual() {
        let store = MemoryStore::new();
        let start = store.server_time().await.unwrap();
        assert_eq!(start, DEFAULT_START);
        store.advance(Duration::from_secs(3));
        assert_eq!(
            store.server_time().await.unwrap().saturating_since(start),
            Duration::from_secs(3)
        );
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(matches!(
            store.get(&path("codes/a")).await,
            Err(StoreError::Transport(_))
        ));
        assert!(store.server_time().await.is_err());
        assert!(store.get(&path("codes/a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transact_commit_and_abort() {
        let store = MemoryStore::new();
        let p = path("codes/a");
        let mut doc = Document::new();
        doc.insert("n".into(), json!(1));

        let created = store
            .transact(&p, |current| {
                assert!(current.is_none());
                TxWrite::Commit(doc.clone(), true)
            })
            .await
            .unwrap();
        assert!(created);

        let untouched = store
            .transact(&p, |current| TxWrite::Abort(current.cloned()))
            .await
            .unwrap();
        assert_eq!(untouched, Some(doc));
    }
}
