use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::models::GameRecord;

/// Storage collaborator supplying the raw game data consumed by the
/// format-analysis stage. Persistence itself is the host application's
/// concern; the engine only reads through this boundary.
#[async_trait]
pub trait GameRecordStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> EngineResult<GameRecord>;

    /// Fetch many records at once. Ids missing from the store are simply
    /// absent from the result; callers decide how to treat the gap.
    async fn batch_get(&self, ids: &[String]) -> EngineResult<Vec<GameRecord>>;
}

/// In-memory store used for embedding and tests.
#[derive(Default)]
pub struct InMemoryGameRecordStore {
    records: Mutex<HashMap<String, GameRecord>>,
}

impl InMemoryGameRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: GameRecord) {
        let mut records = self.records.lock().await;
        records.insert(record.id.clone(), record);
    }

    pub fn with_records(records: Vec<GameRecord>) -> Arc<Self> {
        let map = records
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<HashMap<_, _>>();
        Arc::new(Self {
            records: Mutex::new(map),
        })
    }
}

#[async_trait]
impl GameRecordStore for InMemoryGameRecordStore {
    async fn get_by_id(&self, id: &str) -> EngineResult<GameRecord> {
        let records = self.records.lock().await;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::RecordNotFound(format!("Game record not found: {}", id)))
    }

    async fn batch_get(&self, ids: &[String]) -> EngineResult<Vec<GameRecord>> {
        let records = self.records.lock().await;
        Ok(ids.iter().filter_map(|id| records.get(id).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> GameRecord {
        GameRecord {
            id: id.to_string(),
            title: format!("Game {}", id),
            payload: json!({ "homeScore": 3, "awayScore": 1 }),
        }
    }

    #[tokio::test]
    async fn get_by_id_returns_inserted_record() {
        let store = InMemoryGameRecordStore::new();
        store.insert(record("g1")).await;
        let fetched = store.get_by_id("g1").await.unwrap();
        assert_eq!(fetched.title, "Game g1");
    }

    #[tokio::test]
    async fn get_by_id_reports_missing_record() {
        let store = InMemoryGameRecordStore::new();
        let err = store.get_by_id("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::RecordNotFound(_)));
    }

    #[tokio::test]
    async fn batch_get_skips_missing_ids() {
        let store = InMemoryGameRecordStore::with_records(vec![record("g1"), record("g3")]);
        let got = store
            .batch_get(&["g1".to_string(), "g2".to_string(), "g3".to_string()])
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
    }
}
