use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use super::{LogCursor, LogStore, RawLogDocument};
use crate::error::Result;
use crate::models::LogCriteria;

/// In-process log collection. Documents are matched on their `event`,
/// `component` and `container` fields.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    documents: Arc<RwLock<Vec<RawLogDocument>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, document: RawLogDocument) {
        self.documents.write().push(document);
    }

    /// Appends a well-formed entry for `criteria`.
    pub fn append_line(&self, criteria: &LogCriteria, message: impl Into<String>) {
        self.append(serde_json::json!({
            "event": criteria.event_id,
            "component": criteria.component,
            "container": criteria.container,
            "time": chrono::Utc::now(),
            "message": message.into(),
        }));
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn find(&self, criteria: &LogCriteria) -> Result<Vec<RawLogDocument>> {
        Ok(self
            .documents
            .read()
            .iter()
            .filter(|doc| criteria.matches(doc))
            .cloned()
            .collect())
    }

    async fn tail(&self, criteria: &LogCriteria) -> Result<Box<dyn LogCursor>> {
        let dead = !self.documents.read().iter().any(|doc| criteria.matches(doc));
        Ok(Box::new(MemoryLogCursor {
            documents: Arc::clone(&self.documents),
            criteria: criteria.clone(),
            position: 0,
            dead,
        }))
    }
}

struct MemoryLogCursor {
    documents: Arc<RwLock<Vec<RawLogDocument>>>,
    criteria: LogCriteria,
    position: usize,
    dead: bool,
}

#[async_trait]
impl LogCursor for MemoryLogCursor {
    fn is_dead(&self) -> bool {
        self.dead
    }

    async fn try_next(&mut self) -> Result<Option<RawLogDocument>> {
        if self.dead {
            return Ok(None);
        }
        let documents = self.documents.read();
        while self.position < documents.len() {
            let doc = &documents[self.position];
            self.position += 1;
            if self.criteria.matches(doc) {
                return Ok(Some(doc.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogsSelector;

    #[tokio::test]
    async fn test_find_filters_and_keeps_order() {
        let store = MemoryLogStore::new();
        let worker = LogsSelector::worker().criteria("e1");
        let other = LogsSelector::worker().criteria("e2");
        store.append_line(&worker, "one");
        store.append_line(&other, "elsewhere");
        store.append_line(&worker, "two");

        let found = store.find(&worker).await.unwrap();
        let messages: Vec<_> = found.iter().map(|d| d["message"].as_str().unwrap()).collect();
        assert_eq!(messages, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_cursor_is_dead_until_first_match() {
        let store = MemoryLogStore::new();
        let criteria = LogsSelector::job("build").criteria("e1");
        let mut cursor = store.tail(&criteria).await.unwrap();
        assert!(cursor.is_dead());
        store.append_line(&criteria, "late");
        assert!(cursor.try_next().await.unwrap().is_none());

        let mut cursor = store.tail(&criteria).await.unwrap();
        assert!(!cursor.is_dead());
        assert!(cursor.try_next().await.unwrap().is_some());
        assert!(cursor.try_next().await.unwrap().is_none());
        store.append_line(&criteria, "later");
        assert_eq!(cursor.try_next().await.unwrap().unwrap()["message"], "later");
    }
}
