use crate::db::{self, Database};
use crate::errors::{AppError, AppResult};
use crate::executor::JobExecutor;
use crate::insight_tree::load_insight_tree;
use crate::models::JobStatus;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    LostClaim { job_id: String },
    Processed { job_id: String, status: JobStatus },
}

/// Claim loop over the `insight_jobs` queue.
#[derive(Clone)]
pub struct Worker {
    db: Arc<Database>,
    executor: JobExecutor,
    poll_interval: Duration,
}

pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signals the loop and waits for it; an in-flight job finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.task.await {
            tracing::warn!(error = %error, "worker task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Worker {
    pub fn new(db: Arc<Database>, executor: JobExecutor, poll_interval: Duration) -> Self {
        Self {
            db,
            executor,
            poll_interval,
        }
    }

    pub fn start(&self) -> WorkerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let worker = self.clone();
        let task = tokio::spawn(async move {
            worker.run_loop(receiver).await;
        });
        WorkerHandle { shutdown, task }
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(poll_interval_ms = self.poll_interval.as_millis() as u64, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(PollOutcome::Idle) => true,
                Ok(_) => false,
                Err(error) => {
                    tracing::warn!(error = %error, "worker loop error");
                    true
                }
            };
            if !idle {
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("worker stopped");
    }

    /// One iteration: take the oldest queued job, claim it, run it.
    pub async fn run_once(&self) -> AppResult<PollOutcome> {
        let Some(job) = db::blocking(&self.db, |db| db.next_queued_job()).await? else {
            tracing::debug!("no queued jobs");
            return Ok(PollOutcome::Idle);
        };

        let claim_id = job.id.clone();
        if !db::blocking(&self.db, move |db| db.claim_job(&claim_id)).await? {
            tracing::debug!(job_id = %job.id, "job claimed by another worker");
            return Ok(PollOutcome::LostClaim { job_id: job.id });
        }
        tracing::info!(job_id = %job.id, insight_id = %job.insight_id, frequency = %job.frequency, "job claimed");

        let root_id = job.insight_id.clone();
        let status = match db::blocking(&self.db, move |db| load_insight_tree(db, &root_id)).await {
            Ok(tree) => self.executor.process_job(&job, Some(tree)).await?,
            Err(AppError::NotFound(_)) => self.executor.process_job(&job, None).await?,
            Err(error) => self.executor.record_failure(&job, &error).await?,
        };
        Ok(PollOutcome::Processed { job_id: job.id, status })
    }
}

#[cfg(test)]
mod tests {
    use super::{PollOutcome, Worker};
    use crate::db::Database;
    use crate::executor::tests::{daily_job, seed, three_rows, FakeToolProvider, FixedClock};
    use crate::executor::JobExecutor;
    use crate::models::{JobStatus, NewJob};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tokio::time::Duration;

    fn worker(db: &Arc<Database>, poll_interval: Duration) -> Worker {
        let executor = JobExecutor::with_clock(
            db.clone(),
            Arc::new(FakeToolProvider::returning("SELECT 1", three_rows())),
            Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap())),
        );
        Worker::new(db.clone(), executor, poll_interval)
    }

    #[tokio::test]
    async fn run_once_is_idle_on_empty_queue() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("state.sqlite")).expect("db"));
        let outcome = worker(&db, Duration::from_millis(10)).run_once().await.expect("poll");
        assert_eq!(outcome, PollOutcome::Idle);
    }

    #[tokio::test]
    async fn run_once_takes_oldest_job_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("state.sqlite")).expect("db"));
        let seeded = seed(&db);
        let first = db.insert_job(&daily_job(&seeded)).expect("first");
        let second = db.insert_job(&daily_job(&seeded)).expect("second");
        let worker = worker(&db, Duration::from_millis(10));

        let outcome = worker.run_once().await.expect("poll");
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                job_id: first.id.clone(),
                status: JobStatus::Completed
            }
        );
        let untouched = db.get_job(&second.id).expect("get").expect("second row");
        assert_eq!(untouched.status, JobStatus::Queued);
        assert!(untouched.claimed_at.is_none());

        let stored = db.get_job(&first.id).expect("get").expect("first row");
        assert!(stored.claimed_at.is_some());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn job_for_missing_insight_is_failed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("state.sqlite")).expect("db"));
        let job = db
            .insert_job(&NewJob {
                insight_id: "gone".to_string(),
                kpi_id: Some("kpi".to_string()),
                frequency: "daily".to_string(),
                schedule_time: Some("06:00".to_string()),
                ..NewJob::default()
            })
            .expect("job");

        let outcome = worker(&db, Duration::from_millis(10)).run_once().await.expect("poll");
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                job_id: job.id.clone(),
                status: JobStatus::Failed
            }
        );
        let stored = db.get_job(&job.id).expect("get").expect("row");
        assert!(stored.error_log.expect("error").contains("Insight not found"));
    }

    #[tokio::test]
    async fn cyclic_hierarchy_fails_the_claimed_job() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("state.sqlite")).expect("db"));
        let seeded = seed(&db);
        let child = db
            .insert_insight("app", Some(&seeded.insight_id), None)
            .expect("child");
        db.set_insight_parent(&seeded.insight_id, Some(&child)).expect("cycle");
        let job = db.insert_job(&daily_job(&seeded)).expect("job");

        worker(&db, Duration::from_millis(10)).run_once().await.expect("poll");
        let stored = db.get_job(&job.id).expect("get").expect("row");
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error_log.expect("error").contains("CYCLIC_HIERARCHY"));
    }

    #[tokio::test]
    async fn loop_survives_storage_errors_and_resumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.sqlite");
        let db = Arc::new(Database::new(&path).expect("db"));
        let seeded = seed(&db);
        rusqlite::Connection::open(&path)
            .expect("side connection")
            .execute_batch("DROP TABLE insight_jobs")
            .expect("drop table");

        let handle = worker(&db, Duration::from_millis(10)).start();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished(), "loop exited on a storage error");

        let restored = Database::new(&path).expect("recreate schema");
        let job = restored.insert_job(&daily_job(&seeded)).expect("job");
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = db.get_job(&job.id).expect("get").map(|row| row.status);
            if let Some(status) = status.filter(|status| status.is_terminal()) {
                assert_eq!(status, JobStatus::Completed);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job queued after the error was never run");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
    }

    #[tokio::test]
    async fn started_worker_drains_queue_and_stops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("state.sqlite")).expect("db"));
        let seeded = seed(&db);
        let jobs = (0..2)
            .map(|_| db.insert_job(&daily_job(&seeded)).expect("job"))
            .collect::<Vec<_>>();

        let handle = worker(&db, Duration::from_millis(10)).start();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let done = jobs.iter().all(|job| {
                db.get_job(&job.id)
                    .expect("get")
                    .map(|row| row.status.is_terminal())
                    .unwrap_or(false)
            });
            if done {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "worker did not drain the queue");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop().await;
        for job in &jobs {
            let stored = db.get_job(&job.id).expect("get").expect("row");
            assert_eq!(stored.status, JobStatus::Completed);
        }
        assert_eq!(db.list_execution_logs(&seeded.insight_id, Some("daily")).expect("logs").len(), 6);
        assert_eq!(db.count_prescriptive_records(&seeded.insight_id).expect("count"), 2);
    }
}
