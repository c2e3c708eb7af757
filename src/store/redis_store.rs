use super::{cache_key, failed_record, last_run_key, ok_record, run_key};
use crate::models::{CacheEntry, RunRecord, RunStatus};
use crate::ports::{ProductCache, RunLedger, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, aio::MultiplexedConnection};
use serde::{Serialize, de::DeserializeOwned};

/// Cache and ledger persisted in Redis as JSON documents.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|err| StoreError::Backend(err.to_string()))?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        raw.map(|value| {
            serde_json::from_str(&value).map_err(|err| StoreError::Corrupt(format!("{key}: {err}")))
        })
        .transpose()
    }

    async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(value).map_err(|err| StoreError::Corrupt(err.to_string()))?;
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(key, json)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }

    async fn write_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.write_json(&run_key(&record.scope_id, &record.day_key), record)
            .await?;
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(last_run_key(&record.scope_id), &record.day_key)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))
    }
}

#[async_trait]
impl ProductCache for RedisStore {
    async fn get(&self, scope: &str, product_id: u64) -> Result<Option<CacheEntry>, StoreError> {
        self.read_json(&cache_key(scope, product_id)).await
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
        self.write_json(&cache_key(scope, product_id), &entry).await
    }
}

#[async_trait]
impl RunLedger for RedisStore {
    async fn already_ran(&self, scope: &str, day_key: &str) -> Result<bool, StoreError> {
        let record: Option<RunRecord> = self.read_json(&run_key(scope, day_key)).await?;
        Ok(record.is_some_and(|r| r.status == RunStatus::Ok))
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
        self.write_run(&record).await
    }

    async fn mark_failed(
        &self,
        scope: &str,
        day_key: &str,
        at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let existing: Option<RunRecord> = self.read_json(&run_key(scope, day_key)).await?;
        let record = failed_record(existing, scope, day_key, at, error);
        self.write_run(&record).await
    }

    async fn last_report(&self, scope: &str) -> Result<Option<RunRecord>, StoreError> {
        let mut conn = self.connection().await?;
        let day_key: Option<String> = conn
            .get(last_run_key(scope))
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        match day_key {
            Some(day_key) => self.read_json(&run_key(scope, &day_key)).await,
            None => Ok(None),
        }
    }
}
