pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use crate::models::{RunRecord, RunStatus};
use chrono::{DateTime, Utc};

fn cache_key(scope: &str, product_id: u64) -> String {
    format!("supply:cache:{scope}:{product_id}")
}

fn run_key(scope: &str, day_key: &str) -> String {
    format!("supply:run:{scope}:{day_key}")
}

fn last_run_key(scope: &str) -> String {
    format!("supply:last:{scope}")
}

/// A successful run replaces whatever was stored for the day.
fn ok_record(
    scope: &str,
    day_key: &str,
    supply_id: Option<&str>,
    at: DateTime<Utc>,
    order_count: usize,
    report_text: &str,
) -> RunRecord {
    RunRecord {
        scope_id: scope.to_string(),
        day_key: day_key.to_string(),
        supply_id: supply_id.map(str::to_string),
        created_at: at,
        order_count,
        report_text: Some(report_text.to_string()),
        status: RunStatus::Ok,
        error: None,
    }
}

/// A failure keeps earlier supply id and report text for the day. A day that
/// already succeeded stays `Ok`; the error is only attached to it.
fn failed_record(
    existing: Option<RunRecord>,
    scope: &str,
    day_key: &str,
    at: DateTime<Utc>,
    error: &str,
) -> RunRecord {
    let mut record = existing.unwrap_or_else(|| RunRecord {
        scope_id: scope.to_string(),
        day_key: day_key.to_string(),
        supply_id: None,
        created_at: at,
        order_count: 0,
        report_text: None,
        status: RunStatus::Failed,
        error: None,
    });
    record.created_at = at;
    if record.status != RunStatus::Ok {
        record.status = RunStatus::Failed;
    }
    record.error = Some(error.to_string());
    record
}
