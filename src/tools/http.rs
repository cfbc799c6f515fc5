use super::{
    parse_forecast, parse_generated_sql, parse_sql_execution, ForecastRequest, ForecastResult, GeneratedSql,
    SqlExecution, TableSchema, ToolProvider, KPI_DIAGNOSTIC, MULTI_KPI_FORECASTING, SQL_EXECUTION, SQL_GENERATION,
};
use crate::connection::ConnectionContext;
use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

/// Tool Provider reached over HTTP: `POST {base}/api/tools/{tool}/execute`
/// with `{ data, runtimeContext }`.
#[derive(Debug, Clone)]
pub struct HttpToolProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpToolProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn tool_url(&self, tool_id: &str) -> String {
        format!("{}/api/tools/{}/execute", self.base_url, tool_id)
    }

    async fn call(&self, tool_id: &str, data: Value, context: &ConnectionContext) -> AppResult<Value> {
        tracing::debug!(tool = tool_id, "calling tool provider");
        let response = self
            .client
            .post(self.tool_url(tool_id))
            .json(&request_body(data, context))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AppError::ToolExecution(format!(
                "{} returned HTTP {}: {}",
                tool_id,
                status.as_u16(),
                truncate(&body, 500)
            )));
        }
        serde_json::from_str(&body)
            .map_err(|error| AppError::ToolExecution(format!("{} returned invalid JSON: {}", tool_id, error)))
    }
}

#[async_trait]
impl ToolProvider for HttpToolProvider {
    async fn generate_sql(
        &self,
        prompt: &str,
        tables: &[TableSchema],
        context: &ConnectionContext,
    ) -> AppResult<GeneratedSql> {
        let raw = self
            .call(SQL_GENERATION, json!({ "expandedQuery": prompt, "tables": tables }), context)
            .await?;
        parse_generated_sql(raw)
    }

    async fn execute_sql(&self, sql: &str, context: &ConnectionContext) -> AppResult<SqlExecution> {
        let raw = self
            .call(SQL_EXECUTION, json!({ "query": sql, "generateChart": true }), context)
            .await?;
        parse_sql_execution(raw)
    }

    async fn diagnose(&self, raw_json: &str, context: &ConnectionContext) -> AppResult<Value> {
        self.call(KPI_DIAGNOSTIC, json!({ "raw_json": raw_json }), context).await
    }

    async fn forecast(&self, request: &ForecastRequest, context: &ConnectionContext) -> AppResult<ForecastResult> {
        let raw = self
            .call(
                MULTI_KPI_FORECASTING,
                json!({
                    "kpi_names": request.kpi_names,
                    "forecast_horizon": request.forecast_horizon,
                    "parallel": true,
                    "include_perspective": true,
                    "data_source": { "mode": "payload", "payload": request.payload },
                }),
                context,
            )
            .await?;
        parse_forecast(raw)
    }
}

fn request_body(data: Value, context: &ConnectionContext) -> Value {
    json!({ "data": data, "runtimeContext": context })
}

fn truncate(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut out = value.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::{request_body, truncate, HttpToolProvider};
    use crate::connection::ConnectionContext;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn tool_url_strips_trailing_slash() {
        let provider = HttpToolProvider::new("http://localhost:4111/", Duration::from_secs(5)).expect("client");
        assert_eq!(
            provider.tool_url("sql-generation"),
            "http://localhost:4111/api/tools/sql-generation/execute"
        );
    }

    #[test]
    fn request_body_wraps_data_with_runtime_context() {
        let context = ConnectionContext {
            connection_string: "postgresql://u:p@h:5432/db".to_string(),
            database_type: "postgresql".to_string(),
            tenant_id: "app".to_string(),
            application_id: "app".to_string(),
        };
        let body = request_body(json!({ "query": "SELECT 1" }), &context);
        assert_eq!(body["data"]["query"], "SELECT 1");
        assert_eq!(body["runtimeContext"]["connectionString"], "postgresql://u:p@h:5432/db");
        assert_eq!(body["runtimeContext"]["tenantId"], "app");
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }
}
