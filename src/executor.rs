use crate::aggregate::{collect_logs_for_tree, truncate_logs};
use crate::connection::{resolve_connection, ConnectionContext};
use crate::db::{self, Database};
use crate::errors::{AppError, AppResult};
use crate::insight_tree::load_insight_tree;
use crate::models::{InsightNode, Job, JobCompletion, JobStatus, NewExecutionLog, PrescriptiveRecord};
use crate::payload::{build_forecast_payload, build_kpi_payload};
use crate::prompt::build_ai_prompt;
use crate::schedule::{generate_windows, run_count, RecurrenceRule};
use crate::tools::{ForecastRequest, TableSchema, ToolProvider};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;

pub const FORECAST_HORIZON: u32 = 14;
const DIAGNOSTIC_LOGS_PER_KPI: usize = 2;
const FORECAST_LOGS_PER_KPI: usize = 10;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Runs one claimed job to a terminal state.
#[derive(Clone)]
pub struct JobExecutor {
    db: Arc<Database>,
    tools: Arc<dyn ToolProvider>,
    clock: Arc<dyn Clock>,
}

impl JobExecutor {
    pub fn new(db: Arc<Database>, tools: Arc<dyn ToolProvider>) -> Self {
        Self::with_clock(db, tools, Arc::new(SystemClock))
    }

    pub fn with_clock(db: Arc<Database>, tools: Arc<dyn ToolProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { db, tools, clock }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Drives the job to `completed` or `failed` and returns which. Errors
    /// from the job itself are stored on the row; only a failed terminal
    /// write is returned.
    pub async fn process_job(&self, job: &Job, tree: Option<InsightNode>) -> AppResult<JobStatus> {
        match self.execute(job, tree).await {
            Ok(()) => {
                tracing::info!(job_id = %job.id, insight_id = %job.insight_id, "job completed");
                Ok(JobStatus::Completed)
            }
            Err(error) => self.record_failure(job, &error).await,
        }
    }

    /// Stores `error` as the job's error payload (a JSON string) and marks it
    /// failed.
    pub async fn record_failure(&self, job: &Job, error: &AppError) -> AppResult<JobStatus> {
        tracing::warn!(job_id = %job.id, insight_id = %job.insight_id, error = %error, "job failed");
        let error_log = serde_json::to_string(&error.to_string())?;
        let job_id = job.id.clone();
        db::blocking(&self.db, move |db| db.fail_job(&job_id, &error_log)).await?;
        Ok(JobStatus::Failed)
    }

    async fn execute(&self, job: &Job, tree: Option<InsightNode>) -> AppResult<()> {
        let tree = tree.ok_or_else(|| AppError::NotFound("Insight not found".to_string()))?;
        let kpi_id = job
            .kpi_id
            .as_deref()
            .ok_or_else(|| AppError::NotFound(format!("Job {} has no KPI", job.id)))?;
        let binding = tree
            .binding_for_kpi(kpi_id)
            .ok_or_else(|| AppError::NotFound("KPI not found in insight".to_string()))?;
        let kpi = &binding.kpi;

        let runs = run_count(&job.frequency);
        let tables = TableSchema::for_kpi(kpi);
        let context = self.connection_for(&tree.application_id).await?;

        let windows = if runs == 0 {
            tracing::debug!(job_id = %job.id, frequency = %job.frequency, "frequency has no windows");
            Vec::new()
        } else {
            let rule = RecurrenceRule::from_parts(
                &job.frequency,
                job.schedule_time.as_deref(),
                job.weekly_day.as_deref(),
                job.monthly_day,
            )?;
            generate_windows(self.clock.now(), &rule, runs)?
        };
        let prompt = build_ai_prompt(&kpi.sql_query, &windows)?;

        let generated = self.tools.generate_sql(&prompt, &tables, &context).await?;
        let execution = self.tools.execute_sql(&generated.sql, &context).await?;
        if !execution.success {
            return Err(AppError::ToolExecution("Execution failed".to_string()));
        }

        let kpi_name = job
            .kpi_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| kpi.name.clone());
        let logs = execution
            .rows
            .iter()
            .map(|row| NewExecutionLog {
                insight_id: tree.id.clone(),
                frequency: job.frequency.clone(),
                kpi_name: kpi_name.clone(),
                kpi_value: row_value(row),
                occurred_at: row_time(row).unwrap_or_else(|| self.clock.now()),
                weekly_day: job.weekly_day.clone(),
                monthly_day: job.monthly_day,
                sql_query: generated.sql.clone(),
                sql_execution_data: Value::Object(row.clone()),
            })
            .collect::<Vec<_>>();
        let row_count = logs.len();
        db::blocking(&self.db, move |db| db.insert_execution_logs(&logs)).await?;
        tracing::info!(job_id = %job.id, rows = row_count, "execution logs stored");

        let root_id = tree.id.clone();
        let frequency = job.frequency.clone();
        let (tree, records) = db::blocking(&self.db, move |db| {
            let tree = load_insight_tree(db, &root_id)?;
            let records = collect_logs_for_tree(db, &tree, Some(&frequency))?;
            Ok((tree, records))
        })
        .await?;

        let payload = build_kpi_payload(&tree, &truncate_logs(&records, DIAGNOSTIC_LOGS_PER_KPI));
        let raw_json = serde_json::to_string(&json!({ "kpi_data": [payload] }))?;
        let diagnostic = self.tools.diagnose(&raw_json, &context).await?;
        tracing::debug!(job_id = %job.id, diagnostic = %diagnostic, "diagnostic received");

        let (points, kpi_names) = build_forecast_payload(&records, FORECAST_LOGS_PER_KPI);
        let request = ForecastRequest {
            kpi_names,
            forecast_horizon: FORECAST_HORIZON,
            payload: points,
        };
        let forecast = self.tools.forecast(&request, &context).await?;

        let record = PrescriptiveRecord {
            insight_id: tree.id.clone(),
            kpi_name: job.kpi_name.clone(),
            frequency: job.frequency.clone(),
            summary: forecast.summary.clone(),
            recommendations: forecast.perspective.recommendations.clone(),
            forecasts: forecast.forecasts.clone(),
            highlights: forecast.highlights.clone(),
            generated_metadata: serde_json::to_value(&request.payload)?,
            executed_metadata: forecast.raw.clone(),
        };
        let completion = JobCompletion {
            sql_query: generated.sql.clone(),
            sql_execution_data: serde_json::to_string(&execution.rows)?,
            generated_metadata: serde_json::to_string(&generated.raw)?,
            executed_metadata: serde_json::to_string(&execution.raw)?,
            success_log: serde_json::to_string(&json!({ "message": "Job completed successfully" }))?,
        };
        // The terminal write comes last; nothing may follow `completed`.
        let job_id = job.id.clone();
        db::blocking(&self.db, move |db| {
            db.insert_prescriptive_record(&record)?;
            db.complete_job(&job_id, &completion)
        })
        .await?;
        Ok(())
    }

    async fn connection_for(&self, application_id: &str) -> AppResult<ConnectionContext> {
        let lookup_id = application_id.to_string();
        let application = db::blocking(&self.db, move |db| db.get_application(&lookup_id))
            .await?
            .ok_or_else(|| {
                AppError::ConnectionConfig(format!("Application {} not found", application_id))
            })?;
        resolve_connection(&application)
    }
}

/// First column other than `window_date`, as a number. Anything non-numeric
/// counts as 0.
fn row_value(row: &Map<String, Value>) -> f64 {
    let value = row
        .iter()
        .find(|(key, _)| key.as_str() != "window_date")
        .map(|(_, value)| value);
    match value {
        Some(Value::Number(number)) => number.as_f64().unwrap_or(0.0),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0),
        _ => 0.0,
    }
}

fn row_time(row: &Map<String, Value>) -> Option<DateTime<Utc>> {
    let raw = row.get("window_date")?.as_str()?.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}
