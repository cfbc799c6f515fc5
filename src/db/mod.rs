use crate::errors::{AppError, AppResult};
use crate::models::{
    Application, ExecutionLogEntry, InsightRecord, Job, JobCompletion, JobStatus, KpiBinding, KpiColumn,
    KpiDefinition, KpiTable, NewExecutionLog, NewJob, NewKpiTable, PrescriptiveRecord,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const JOB_COLUMNS: &str = "id, insight_id, kpi_id, kpi_name, frequency, schedule_time, weekly_day, monthly_day,
     status, sql_query, sql_execution_data, generated_metadata, executed_metadata, success_log, error_log,
     created_at, claimed_at, finished_at";

const LOG_COLUMNS: &str = "id, insight_id, frequency, kpi_name, kpi_value, created_at, weekly_day, monthly_day,
     sql_query, sql_execution_data";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn insert_application(&self, meta: &serde_json::Value) -> AppResult<Application> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO applications (id, meta_json, created_at) VALUES (?1, ?2, ?3)",
            params![id, serde_json::to_string(meta)?, format_time(Utc::now())],
        )?;
        Ok(Application {
            id,
            meta: meta.clone(),
        })
    }

    pub fn get_application(&self, application_id: &str) -> AppResult<Option<Application>> {
        let conn = self.conn()?;
        let raw: Option<(String, String)> = conn
            .query_row(
                "SELECT id, meta_json FROM applications WHERE id = ?1",
                [application_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        raw.map(|(id, meta_json)| {
            Ok(Application {
                id,
                meta: serde_json::from_str(&meta_json)?,
            })
        })
        .transpose()
    }

    pub fn insert_kpi(&self, name: &str, sql_query: &str, tables: &[NewKpiTable]) -> AppResult<KpiDefinition> {
        let kpi_id = Uuid::new_v4().to_string();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO kpis (id, name, sql_query, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![kpi_id, name, sql_query, format_time(Utc::now())],
        )?;

        let mut stored_tables = Vec::with_capacity(tables.len());
        for (table_pos, table) in tables.iter().enumerate() {
            let table_id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO kpi_tables (id, kpi_id, table_name, schema_name, position) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![table_id, kpi_id, table.table_name, table.schema_name, table_pos as i64],
            )?;
            for (column_pos, column) in table.columns.iter().enumerate() {
                tx.execute(
                    "INSERT INTO kpi_columns (id, kpi_table_id, column_name, data_type, position)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        Uuid::new_v4().to_string(),
                        table_id,
                        column.name,
                        column.data_type,
                        column_pos as i64
                    ],
                )?;
            }
            stored_tables.push(KpiTable {
                id: table_id,
                table_name: table.table_name.clone(),
                schema_name: table.schema_name.clone(),
                columns: table.columns.clone(),
            });
        }
        tx.commit()?;

        Ok(KpiDefinition {
            id: kpi_id,
            name: name.to_string(),
            sql_query: sql_query.to_string(),
            tables: stored_tables,
        })
    }

    pub fn insert_insight(
        &self,
        application_id: &str,
        parent_id: Option<&str>,
        kpi_id: Option<&str>,
    ) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO insights (id, application_id, parent_id, kpi_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, application_id, parent_id, kpi_id, format_time(Utc::now())],
        )?;
        Ok(id)
    }

    /// Re-points an insight at a new parent. Storage does not reject cycles;
    /// the tree loader does.
    pub fn set_insight_parent(&self, insight_id: &str, parent_id: Option<&str>) -> AppResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE insights SET parent_id = ?1 WHERE id = ?2",
            params![parent_id, insight_id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("Insight {} not found", insight_id)));
        }
        Ok(())
    }

    pub fn bind_kpi(&self, insight_id: &str, kpi_id: &str) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        let position: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM insight_kpis WHERE insight_id = ?1",
            [insight_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO insight_kpis (id, insight_id, kpi_id, position) VALUES (?1, ?2, ?3, ?4)",
            params![id, insight_id, kpi_id, position],
        )?;
        Ok(id)
    }

    /// One insight with bindings, primary KPI, tables and columns, plus the ids
    /// of its direct children in creation order.
    pub fn get_insight(&self, insight_id: &str) -> AppResult<Option<InsightRecord>> {
        let conn = self.conn()?;
        let row: Option<(String, String, Option<String>)> = conn
            .query_row(
                "SELECT id, application_id, kpi_id FROM insights WHERE id = ?1",
                [insight_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((id, application_id, primary_kpi_id)) = row else {
            return Ok(None);
        };

        let kpi = match primary_kpi_id {
            Some(kpi_id) => load_kpi(&conn, &kpi_id)?,
            None => None,
        };

        let binding_rows = {
            let mut stmt = conn.prepare(
                "SELECT id, kpi_id FROM insight_kpis WHERE insight_id = ?1 ORDER BY position ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map([&id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let mut kpis = Vec::with_capacity(binding_rows.len());
        for (binding_id, kpi_id) in binding_rows {
            if let Some(kpi) = load_kpi(&conn, &kpi_id)? {
                kpis.push(KpiBinding {
                    id: binding_id,
                    kpi_id,
                    kpi,
                });
            }
        }

        let mut stmt = conn.prepare(
            "SELECT id FROM insights WHERE parent_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let child_ids = stmt
            .query_map([&id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(InsightRecord {
            id,
            application_id,
            kpi,
            kpis,
            child_ids,
        }))
    }

    pub fn insert_job(&self, job: &NewJob) -> AppResult<Job> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO insight_jobs (
               id, insight_id, kpi_id, kpi_name, frequency, schedule_time, weekly_day, monthly_day, status, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                id,
                job.insight_id,
                job.kpi_id,
                job.kpi_name,
                job.frequency,
                job.schedule_time,
                job.weekly_day,
                job.monthly_day,
                JobStatus::Queued.as_str(),
                format_time(now),
            ],
        )?;

        Ok(Job {
            id,
            insight_id: job.insight_id.clone(),
            kpi_id: job.kpi_id.clone(),
            kpi_name: job.kpi_name.clone(),
            frequency: job.frequency.clone(),
            schedule_time: job.schedule_time.clone(),
            weekly_day: job.weekly_day.clone(),
            monthly_day: job.monthly_day,
            status: JobStatus::Queued,
            sql_query: None,
            sql_execution_data: None,
            generated_metadata: None,
            executed_metadata: None,
            success_log: None,
            error_log: None,
            created_at: parse_time(&format_time(now))?,
            claimed_at: None,
            finished_at: None,
        })
    }

    pub fn get_job(&self, job_id: &str) -> AppResult<Option<Job>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {} FROM insight_jobs WHERE id = ?1", JOB_COLUMNS),
            [job_id],
            parse_job_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Oldest job still waiting to be claimed.
    pub fn next_queued_job(&self) -> AppResult<Option<Job>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM insight_jobs WHERE status = ?1 ORDER BY created_at ASC, rowid ASC LIMIT 1",
                JOB_COLUMNS
            ),
            [JobStatus::Queued.as_str()],
            parse_job_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Compare-and-set `queued -> processing`. Returns false when another
    /// worker got there first.
    pub fn claim_job(&self, job_id: &str) -> AppResult<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE insight_jobs SET status = ?1, claimed_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                JobStatus::Processing.as_str(),
                format_time(Utc::now()),
                job_id,
                JobStatus::Queued.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(changed == 1)
    }

    pub fn complete_job(&self, job_id: &str, completion: &JobCompletion) -> AppResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE insight_jobs
             SET status = ?1, sql_query = ?2, sql_execution_data = ?3, generated_metadata = ?4,
                 executed_metadata = ?5, success_log = ?6, error_log = NULL, finished_at = ?7
             WHERE id = ?8",
            params![
                JobStatus::Completed.as_str(),
                completion.sql_query,
                completion.sql_execution_data,
                completion.generated_metadata,
                completion.executed_metadata,
                completion.success_log,
                format_time(Utc::now()),
                job_id
            ],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("Job {} not found", job_id)));
        }
        Ok(())
    }

    pub fn fail_job(&self, job_id: &str, error_log: &str) -> AppResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE insight_jobs SET status = ?1, error_log = ?2, finished_at = ?3 WHERE id = ?4",
            params![JobStatus::Failed.as_str(), error_log, format_time(Utc::now()), job_id],
        )?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("Job {} not found", job_id)));
        }
        Ok(())
    }

    /// Appends all rows of one run atomically.
    pub fn insert_execution_logs(&self, logs: &[NewExecutionLog]) -> AppResult<Vec<ExecutionLogEntry>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stored = Vec::with_capacity(logs.len());
        for log in logs {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO insight_execution_logs (
                   id, insight_id, frequency, kpi_name, kpi_value, weekly_day, monthly_day,
                   sql_query, sql_execution_data, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    log.insight_id,
                    log.frequency,
                    log.kpi_name,
                    log.kpi_value,
                    log.weekly_day,
                    log.monthly_day,
                    log.sql_query,
                    serde_json::to_string(&log.sql_execution_data)?,
                    format_time(log.occurred_at),
                ],
            )?;
            stored.push(ExecutionLogEntry {
                id,
                insight_id: log.insight_id.clone(),
                frequency: log.frequency.clone(),
                kpi_name: log.kpi_name.clone(),
                kpi_value: log.kpi_value,
                occurred_at: log.occurred_at,
                weekly_day: log.weekly_day.clone(),
                monthly_day: log.monthly_day,
                sql_query: log.sql_query.clone(),
                sql_execution_data: log.sql_execution_data.clone(),
            });
        }
        tx.commit()?;
        Ok(stored)
    }

    /// Logs of one insight, newest first.
    pub fn list_execution_logs(&self, insight_id: &str, frequency: Option<&str>) -> AppResult<Vec<ExecutionLogEntry>> {
        let conn = self.conn()?;
        let mut query = format!("SELECT {} FROM insight_execution_logs WHERE insight_id = ?", LOG_COLUMNS);
        let mut params_vec: Vec<String> = vec![insight_id.to_string()];
        if let Some(frequency) = frequency {
            query.push_str(" AND frequency = ?");
            params_vec.push(frequency.to_string());
        }
        query.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params_vec.iter()), parse_log_row)?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    pub fn insert_prescriptive_record(&self, record: &PrescriptiveRecord) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO insight_prescriptive_logs (
               id, insight_id, kpi_name, frequency, summary_json, recommendations_json, forecasts_json,
               highlights_json, generated_metadata, executed_metadata, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                record.insight_id,
                record.kpi_name,
                record.frequency,
                serde_json::to_string(&record.summary)?,
                serde_json::to_string(&record.recommendations)?,
                serde_json::to_string(&record.forecasts)?,
                serde_json::to_string(&record.highlights)?,
                serde_json::to_string(&record.generated_metadata)?,
                serde_json::to_string(&record.executed_metadata)?,
                format_time(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    pub fn count_prescriptive_records(&self, insight_id: &str) -> AppResult<u64> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM insight_prescriptive_logs WHERE insight_id = ?1",
            [insight_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Runs a storage call on tokio's blocking pool so a busy SQLite lock never
/// stalls an async worker thread.
pub async fn blocking<T, F>(db: &Arc<Database>, call: F) -> AppResult<T>
where
    F: FnOnce(&Database) -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || call(&db))
        .await
        .map_err(|error| AppError::Internal(format!("storage task failed: {}", error)))?
}

fn load_kpi(conn: &Connection, kpi_id: &str) -> AppResult<Option<KpiDefinition>> {
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, name, sql_query FROM kpis WHERE id = ?1",
            [kpi_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((id, name, sql_query)) = row else {
        return Ok(None);
    };

    let mut table_stmt = conn.prepare(
        "SELECT id, table_name, schema_name FROM kpi_tables WHERE kpi_id = ?1 ORDER BY position ASC, rowid ASC",
    )?;
    let table_rows = table_stmt
        .query_map([&id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut column_stmt = conn.prepare(
        "SELECT column_name, data_type FROM kpi_columns WHERE kpi_table_id = ?1 ORDER BY position ASC, rowid ASC",
    )?;
    let mut tables = Vec::with_capacity(table_rows.len());
    for (table_id, table_name, schema_name) in table_rows {
        let columns = column_stmt
            .query_map([&table_id], |row| {
                Ok(KpiColumn {
                    name: row.get(0)?,
                    data_type: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        tables.push(KpiTable {
            id: table_id,
            table_name,
            schema_name,
            columns,
        });
    }

    Ok(Some(KpiDefinition {
        id,
        name,
        sql_query,
        tables,
    }))
}

fn parse_job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get(0)?,
        insight_id: row.get(1)?,
        kpi_id: row.get(2)?,
        kpi_name: row.get(3)?,
        frequency: row.get(4)?,
        schedule_time: row.get(5)?,
        weekly_day: row.get(6)?,
        monthly_day: row.get(7)?,
        status: parse_status(&row.get::<_, String>(8)?)?,
        sql_query: row.get(9)?,
        sql_execution_data: row.get(10)?,
        generated_metadata: row.get(11)?,
        executed_metadata: row.get(12)?,
        success_log: row.get(13)?,
        error_log: row.get(14)?,
        created_at: parse_time(&row.get::<_, String>(15)?)?,
        claimed_at: row
            .get::<_, Option<String>>(16)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        finished_at: row
            .get::<_, Option<String>>(17)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
    })
}

fn parse_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLogEntry> {
    let raw_data: String = row.get(9)?;
    Ok(ExecutionLogEntry {
        id: row.get(0)?,
        insight_id: row.get(1)?,
        frequency: row.get(2)?,
        kpi_name: row.get(3)?,
        kpi_value: row.get(4)?,
        occurred_at: parse_time(&row.get::<_, String>(5)?)?,
        weekly_day: row.get(6)?,
        monthly_day: row.get(7)?,
        sql_query: row.get(8)?,
        sql_execution_data: serde_json::from_str(&raw_data).unwrap_or(serde_json::Value::String(raw_data)),
    })
}

fn parse_status(raw: &str) -> rusqlite::Result<JobStatus> {
    JobStatus::parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid job status: {}", raw),
            )),
        )
    })
}

/// Fixed-width UTC form so lexical order in SQLite matches time order.
pub(crate) fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
        })
}
