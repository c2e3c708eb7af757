use crate::pipeline::{DailySupplyPipeline, RunOutcome};
use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeDelta, TimeZone, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::sleep,
};
use tracing::{error, info};
use uuid::Uuid;

/// One bounded queue and one worker per scope: runs for a scope are serialized,
/// different scopes proceed in parallel.
#[derive(Clone)]
pub struct JobQueue {
    senders: Arc<HashMap<String, mpsc::Sender<Job>>>,
    statuses: Arc<Mutex<HashMap<Uuid, JobInfo>>>,
}

#[derive(Debug, Clone)]
struct Job {
    id: Uuid,
    trigger: Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Schedule,
    Manual,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { result: Box<RunOutcome> },
    Failed { error: String, stage: Option<String> },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub scope: String,
    pub trigger: Trigger,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("unknown scope `{0}`")]
    UnknownScope(String),
    #[error("worker for `{0}` is not running")]
    WorkerGone(String),
}

impl JobQueue {
    pub fn spawn(
        pipelines: Vec<DailySupplyPipeline>,
        capacity: usize,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let statuses: Arc<Mutex<HashMap<Uuid, JobInfo>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut senders = HashMap::new();
        let mut handles = Vec::new();

        for pipeline in pipelines {
            let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
            senders.insert(pipeline.scope().to_string(), tx);
            handles.push(tokio::spawn(work(pipeline, rx, statuses.clone())));
        }

        let queue = Self {
            senders: Arc::new(senders),
            statuses,
        };
        (queue, handles)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.senders.contains_key(scope)
    }

    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.senders.keys().map(String::as_str)
    }

    pub async fn enqueue(&self, scope: &str, trigger: Trigger) -> Result<Uuid, EnqueueError> {
        let tx = self
            .senders
            .get(scope)
            .ok_or_else(|| EnqueueError::UnknownScope(scope.to_string()))?;
        let id = Uuid::new_v4();
        {
            let mut guard = self.statuses.lock().await;
            guard.insert(
                id,
                JobInfo {
                    id: id.to_string(),
                    scope: scope.to_string(),
                    trigger,
                    state: JobState::Queued,
                },
            );
        }
        if tx.send(Job { id, trigger }).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(EnqueueError::WorkerGone(scope.to_string()));
        }
        info!(target = "supply.jobs", %scope, job_id = %id, ?trigger, "run enqueued");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.statuses.lock().await.get(&id).cloned()
    }
}

async fn work(
    pipeline: DailySupplyPipeline,
    mut rx: mpsc::Receiver<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobInfo>>>,
) {
    while let Some(job) = rx.recv().await {
        set_state(&statuses, job.id, JobState::Running).await;
        info!(target = "supply.jobs", scope = %pipeline.scope(), job_id = %job.id, trigger = ?job.trigger, "run starting");

        let run = pipeline.clone();
        let state = match tokio::spawn(async move { run.run().await }).await {
            Ok(outcome) => match &outcome.failure {
                Some(failure) => JobState::Failed {
                    error: failure.message.clone(),
                    stage: Some(failure.stage.to_string()),
                },
                None => JobState::Completed {
                    result: Box::new(outcome),
                },
            },
            Err(err) => {
                error!(target = "supply.jobs", scope = %pipeline.scope(), job_id = %job.id, error = %err, "run aborted");
                JobState::Failed {
                    error: format!("run aborted: {err}"),
                    stage: None,
                }
            }
        };
        set_state(&statuses, job.id, state).await;
    }
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, JobInfo>>, id: Uuid, state: JobState) {
    if let Some(info) = statuses.lock().await.get_mut(&id) {
        info.state = state;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DailySchedule {
    pub hour: u32,
    pub minute: u32,
    pub offset: FixedOffset,
}

impl DailySchedule {
    /// First `hour:minute` in the schedule's offset strictly after `now`.
    pub fn next_fire_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset).naive_local();
        let at = NaiveTime::from_hms_opt(self.hour.min(23), self.minute.min(59), 0)
            .unwrap_or(NaiveTime::MIN);
        let mut fire = local.date().and_time(at);
        if fire <= local {
            fire = fire
                .checked_add_days(Days::new(1))
                .unwrap_or(fire + TimeDelta::days(1));
        }
        let utc = fire - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc)
    }
}

/// Enqueues one scheduled run per scope every day at the configured time.
pub fn spawn_daily_trigger(
    queue: JobQueue,
    scopes: Vec<String>,
    schedule: DailySchedule,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = schedule.next_fire_after(now);
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
            info!(target = "supply.jobs", next_run = %next, scopes = scopes.len(), "daily trigger armed");
            sleep(wait).await;

            for scope in &scopes {
                if let Err(err) = queue.enqueue(scope, Trigger::Schedule).await {
                    error!(target = "supply.jobs", %scope, error = %err, "scheduled run not enqueued");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SkipReason;
    use crate::pipeline::RunState;
    use crate::store::MemoryStore;
    use crate::testing::{FakeMarketplace, order, pipeline_fixture};

    fn moscow_ten() -> DailySchedule {
        DailySchedule {
            hour: 10,
            minute: 0,
            offset: FixedOffset::east_opt(3 * 3600).unwrap(),
        }
    }

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn fires_later_today_when_time_not_reached() {
        let next = moscow_ten().next_fire_after(utc(2026, 10, 16, 5, 30));
        assert_eq!(next, utc(2026, 10, 16, 7, 0));
    }

    #[test]
    fn fires_tomorrow_once_time_passed_or_reached() {
        assert_eq!(
            moscow_ten().next_fire_after(utc(2026, 10, 16, 7, 0)),
            utc(2026, 10, 17, 7, 0)
        );
        assert_eq!(
            moscow_ten().next_fire_after(utc(2026, 10, 16, 12, 0)),
            utc(2026, 10, 17, 7, 0)
        );
    }

    #[test]
    fn local_day_is_used_across_utc_midnight() {
        // 23:30 UTC is already 02:30 on the next local day.
        assert_eq!(
            moscow_ten().next_fire_after(utc(2026, 12, 31, 23, 30)),
            utc(2027, 1, 1, 7, 0)
        );
    }

    async fn wait_for_finish(queue: &JobQueue, id: Uuid) -> JobInfo {
        for _ in 0..200 {
            if let Some(info) = queue.get(id).await
                && matches!(
                    info.state,
                    JobState::Completed { .. } | JobState::Failed { .. }
                )
            {
                return info;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn queued_run_completes_with_outcome() {
        let fixture = pipeline_fixture(
            "shop",
            Arc::new(MemoryStore::new()),
            FakeMarketplace::new(vec![order(1, 10, 2, Some("Redmi 12 blue"))]),
        );
        let (queue, _workers) = JobQueue::spawn(vec![fixture.pipeline.clone()], 4);

        let id = queue.enqueue("shop", Trigger::Manual).await.unwrap();
        let info = wait_for_finish(&queue, id).await;

        assert_eq!(info.scope, "shop");
        assert_eq!(info.trigger, Trigger::Manual);
        match info.state {
            JobState::Completed { result } => {
                assert_eq!(result.state, RunState::Done);
                assert_eq!(result.total_qty, 2);
            }
            _ => panic!("expected completed job"),
        }
        assert_eq!(fixture.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn same_scope_runs_are_serialized() {
        let fixture = pipeline_fixture(
            "shop",
            Arc::new(MemoryStore::new()),
            FakeMarketplace::new(vec![order(1, 10, 1, None)]),
        );
        let (queue, _workers) = JobQueue::spawn(vec![fixture.pipeline.clone()], 4);

        let first = queue.enqueue("shop", Trigger::Schedule).await.unwrap();
        let second = queue.enqueue("shop", Trigger::Manual).await.unwrap();
        wait_for_finish(&queue, first).await;
        let info = wait_for_finish(&queue, second).await;

        match info.state {
            JobState::Completed { result } => {
                assert_eq!(result.skipped, Some(SkipReason::AlreadyRan));
            }
            _ => panic!("expected completed job"),
        }
        assert_eq!(fixture.market.supply_names().len(), 1);
    }

    #[tokio::test]
    async fn failed_run_records_stage() {
        let fixture = pipeline_fixture(
            "shop",
            Arc::new(MemoryStore::new()),
            FakeMarketplace::new(Vec::new()).failing_fetch(),
        );
        let (queue, _workers) = JobQueue::spawn(vec![fixture.pipeline.clone()], 4);

        let id = queue.enqueue("shop", Trigger::Manual).await.unwrap();

        match wait_for_finish(&queue, id).await.state {
            JobState::Failed { stage, .. } => assert_eq!(stage.as_deref(), Some("fetch_orders")),
            _ => panic!("expected failed job"),
        }
    }

    #[tokio::test]
    async fn unknown_scope_is_rejected() {
        let (queue, _workers) = JobQueue::spawn(Vec::new(), 4);
        assert!(matches!(
            queue.enqueue("ghost", Trigger::Manual).await,
            Err(EnqueueError::UnknownScope(scope)) if scope == "ghost"
        ));
        assert_eq!(queue.scopes().count(), 0);
    }

    #[tokio::test]
    async fn panicking_run_fails_the_job_and_keeps_the_worker() {
        let fixture = pipeline_fixture(
            "shop",
            Arc::new(MemoryStore::new()),
            FakeMarketplace::new(vec![order(1, 10, 1, None)]).panicking_fetches(1),
        );
        let (queue, _workers) = JobQueue::spawn(vec![fixture.pipeline.clone()], 4);

        let first = queue.enqueue("shop", Trigger::Manual).await.unwrap();
        match wait_for_finish(&queue, first).await.state {
            JobState::Failed { error, stage } => {
                assert!(error.starts_with("run aborted"));
                assert_eq!(stage, None);
            }
            _ => panic!("expected failed job"),
        }

        let second = queue.enqueue("shop", Trigger::Manual).await.unwrap();
        match wait_for_finish(&queue, second).await.state {
            JobState::Completed { result } => assert_eq!(result.total_qty, 1),
            _ => panic!("expected completed job"),
        }
    }
}
