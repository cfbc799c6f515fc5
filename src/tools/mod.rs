pub mod http;

use crate::connection::ConnectionContext;
use crate::errors::{AppError, AppResult};
use crate::models::{ForecastPoint, KpiDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

pub const SQL_GENERATION: &str = "sql-generation";
pub const SQL_EXECUTION: &str = "sql-execution";
pub const KPI_DIAGNOSTIC: &str = "kpi-diagnostic";
pub const MULTI_KPI_FORECASTING: &str = "multi-kpi-predictive-forecasting";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableField {
    pub field_name: String,
    pub field_type: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub schema_name: String,
    pub fields: Vec<TableField>,
}

impl TableSchema {
    pub fn for_kpi(kpi: &KpiDefinition) -> Vec<TableSchema> {
        kpi.tables
            .iter()
            .map(|table| TableSchema {
                name: table.table_name.clone(),
                schema_name: if table.schema_name.is_empty() {
                    "public".to_string()
                } else {
                    table.schema_name.clone()
                },
                fields: table
                    .columns
                    .iter()
                    .map(|column| TableField {
                        field_name: column.name.clone(),
                        field_type: if column.data_type.is_empty() {
                            "string".to_string()
                        } else {
                            column.data_type.clone()
                        },
                    })
                    .collect(),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub raw: Value,
}

#[derive(Debug, Clone)]
pub struct SqlExecution {
    pub success: bool,
    pub rows: Vec<Map<String, Value>>,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForecastRequest {
    pub kpi_names: Vec<String>,
    pub forecast_horizon: u32,
    pub payload: Vec<ForecastPoint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Perspective {
    #[serde(default)]
    pub recommendations: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForecastResult {
    #[serde(default)]
    pub summary: Value,
    #[serde(default)]
    pub perspective: Perspective,
    #[serde(default)]
    pub forecasts: Value,
    #[serde(default)]
    pub highlights: Value,
    #[serde(skip)]
    pub raw: Value,
}

/// Remote compute used by the job executor. Every call is opaque; any error
/// fails the job.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn generate_sql(
        &self,
        prompt: &str,
        tables: &[TableSchema],
        context: &ConnectionContext,
    ) -> AppResult<GeneratedSql>;

    async fn execute_sql(&self, sql: &str, context: &ConnectionContext) -> AppResult<SqlExecution>;

    async fn diagnose(&self, raw_json: &str, context: &ConnectionContext) -> AppResult<Value>;

    async fn forecast(&self, request: &ForecastRequest, context: &ConnectionContext) -> AppResult<ForecastResult>;
}

pub fn parse_generated_sql(raw: Value) -> AppResult<GeneratedSql> {
    validate_response(
        SQL_GENERATION,
        &raw,
        &json!({
            "type": "object",
            "properties": { "sql": { "type": ["string", "null"] } }
        }),
    )?;
    let sql = raw
        .get("sql")
        .and_then(Value::as_str)
        .filter(|sql| !sql.trim().is_empty())
        .ok_or_else(|| AppError::ToolExecution("No SQL generated".to_string()))?
        .to_string();
    Ok(GeneratedSql { sql, raw })
}

pub fn parse_sql_execution(raw: Value) -> AppResult<SqlExecution> {
    validate_response(
        SQL_EXECUTION,
        &raw,
        &json!({
            "type": "object",
            "properties": {
                "success": { "type": "boolean" },
                "data": { "type": ["array", "null"], "items": { "type": "object" } }
            },
            "required": ["success"]
        }),
    )?;
    let success = raw.get("success").and_then(Value::as_bool).unwrap_or(false);
    let rows = match raw.get("data").and_then(Value::as_array) {
        Some(rows) => rows.iter().filter_map(|row| row.as_object().cloned()).collect(),
        // A failed run may omit its data; a successful one must carry an array.
        None if success => return Err(AppError::ToolExecution("Execution returned no data".to_string())),
        None => Vec::new(),
    };
    Ok(SqlExecution { success, rows, raw })
}

pub fn parse_forecast(raw: Value) -> AppResult<ForecastResult> {
    validate_response(
        MULTI_KPI_FORECASTING,
        &raw,
        &json!({
            "type": "object",
            "properties": {
                "perspective": { "type": "object" }
            }
        }),
    )?;
    let mut result: ForecastResult = serde_json::from_value(raw.clone())?;
    result.raw = raw;
    Ok(result)
}

fn validate_response(tool_id: &str, value: &Value, schema: &Value) -> AppResult<()> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|error| AppError::Internal(format!("Invalid response schema for {}: {}", tool_id, error)))?;

    let errors: Vec<String> = compiled
        .validate(value)
        .err()
        .map(|errors| {
            errors
                .map(|error| {
                    let path = error.instance_path.to_string();
                    if path.is_empty() {
                        error.to_string()
                    } else {
                        format!("{}: {}", path, error)
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::ToolExecution(format!(
            "{} returned an unexpected response: {}",
            tool_id,
            errors.join("; ")
        )))
    }
}
