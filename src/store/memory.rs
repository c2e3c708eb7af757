use super::{failed_record, ok_record};
use crate::models::{CacheEntry, RunRecord, RunStatus};
use crate::ports::{ProductCache, RunLedger, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Process-local cache and ledger, used when no Redis is configured.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cache: Mutex<HashMap<(String, u64), CacheEntry>>,
    runs: Mutex<HashMap<(String, String), RunRecord>>,
    last_day: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn write_run(&self, record: RunRecord) {
        let scope = record.scope_id.clone();
        let day_key = record.day_key.clone();
        self.runs
            .lock()
            .await
            .insert((scope.clone(), day_key.clone()), record);
        self.last_day.lock().await.insert(scope, day_key);
    }
}

#[async_trait]
impl ProductCache for MemoryStore {
    async fn get(&self, scope: &str, product_id: u64) -> Result<Option<CacheEntry>, StoreError> {
        let guard = self.cache.lock().await;
        Ok(guard.get(&(scope.to_string(), product_id)).cloned())
    }

    async fn set(
        &self,
        scope: &str,
        product_id: u64,
        title: &str,
        color: Option<&str>,
    ) -> Result<(), StoreError> {
        let entry = CacheEntry {
            scope_id: scope.to_string(),
            product_id,
            title: title.to_string(),
            color: color.map(str::to_string),
            updated_at: Utc::now(),
        };
        self.cache
            .lock()
            .await
            .insert((scope.to_string(), product_id), entry);
        Ok(())
    }
}

#[async_trait]
impl RunLedger for MemoryStore {
    async fn already_ran(&self, scope: &str, day_key: &str) -> Result<bool, StoreError> {
        let guard = self.runs.lock().await;
        Ok(guard
            .get(&(scope.to_string(), day_key.to_string()))
            .is_some_and(|record| record.status == RunStatus::Ok))
    }

    async fn mark_ok(
        &self,
        scope: &str,
        day_key: &str,
        supply_id: Option<&str>,
        at: DateTime<Utc>,
        order_count: usize,
        report_text: &str,
    ) -> Result<(), StoreError> {
        let record = ok_record(scope, day_key, supply_id, at, order_count, report_text);
        self.write_run(record).await;
        Ok(())
    }

    async fn mark_failed(
        &self,
        scope: &str,
        day_key: &str,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let existing = self
            .runs
            .lock()
            .await
            .get(&(scope.to_string(), day_key.to_string()))
            .cloned();
        let record = failed_record(existing, scope, day_key, at, error);
        self.write_run(record).await;
        Ok(())
    }

    async fn last_report(&self, scope: &str) -> Result<Option<RunRecord>, StoreError> {
        let Some(day_key) = self.last_day.lock().await.get(scope).cloned() else {
            return Ok(None);
        };
        Ok(self.runs.lock().await.get(&(scope.to_string(), day_key)).cloned())
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn seed_cache(&self, scope: &str, product_id: u64, title: &str, color: Option<&str>) {
        let _ = ProductCache::set(self, scope, product_id, title, color).await;
    }

    pub async fn cached(&self, scope: &str, product_id: u64) -> Option<CacheEntry> {
        self.cache
            .lock()
            .await
            .get(&(scope.to_string(), product_id))
            .cloned()
    }

    pub async fn run(&self, scope: &str, day_key: &str) -> Option<RunRecord> {
        self.runs
            .lock()
            .await
            .get(&(scope.to_string(), day_key.to_string()))
            .cloned()
    }
}
