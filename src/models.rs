use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub const ALL: [Frequency; 3] = [Self::Daily, Self::Weekly, Self::Monthly];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "daily" => Some(Self::Daily),
            "weekly" => Some(Self::Weekly),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiColumn {
    pub name: String,
    pub data_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiTable {
    pub id: String,
    pub table_name: String,
    pub schema_name: String,
    pub columns: Vec<KpiColumn>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiDefinition {
    pub id: String,
    pub name: String,
    pub sql_query: String,
    pub tables: Vec<KpiTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiBinding {
    pub id: String,
    pub kpi_id: String,
    pub kpi: KpiDefinition,
}

#[derive(Debug, Clone)]
pub struct NewKpiTable {
    pub table_name: String,
    pub schema_name: String,
    pub columns: Vec<KpiColumn>,
}

/// One insight with its KPI bindings and, once loaded by the tree loader,
/// its whole subtree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InsightNode {
    pub id: String,
    pub application_id: String,
    pub kpi: Option<KpiDefinition>,
    pub kpis: Vec<KpiBinding>,
    pub children: Vec<InsightNode>,
}

impl InsightNode {
    pub fn binding_for_kpi(&self, kpi_id: &str) -> Option<&KpiBinding> {
        self.kpis.iter().find(|binding| binding.kpi_id == kpi_id)
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(InsightNode::node_count).sum::<usize>()
    }
}

/// Row of `insights` before children are resolved.
#[derive(Debug, Clone)]
pub struct InsightRecord {
    pub id: String,
    pub application_id: String,
    pub kpi: Option<KpiDefinition>,
    pub kpis: Vec<KpiBinding>,
    pub child_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: String,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub insight_id: String,
    pub kpi_id: Option<String>,
    pub kpi_name: Option<String>,
    pub frequency: String,
    pub schedule_time: Option<String>,
    pub weekly_day: Option<String>,
    pub monthly_day: Option<u32>,
    pub status: JobStatus,
    pub sql_query: Option<String>,
    pub sql_execution_data: Option<String>,
    pub generated_metadata: Option<String>,
    pub executed_metadata: Option<String>,
    pub success_log: Option<String>,
    pub error_log: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub insight_id: String,
    pub kpi_id: Option<String>,
    pub kpi_name: Option<String>,
    pub frequency: String,
    pub schedule_time: Option<String>,
    pub weekly_day: Option<String>,
    pub monthly_day: Option<u32>,
}

/// Fields written together with the `completed` transition.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub sql_query: String,
    pub sql_execution_data: String,
    pub generated_metadata: String,
    pub executed_metadata: String,
    pub success_log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLogEntry {
    pub id: String,
    pub insight_id: String,
    pub frequency: String,
    pub kpi_name: String,
    pub kpi_value: f64,
    pub occurred_at: DateTime<Utc>,
    pub weekly_day: Option<String>,
    pub monthly_day: Option<u32>,
    pub sql_query: String,
    pub sql_execution_data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub insight_id: String,
    pub frequency: String,
    pub kpi_name: String,
    pub kpi_value: f64,
    pub occurred_at: DateTime<Utc>,
    pub weekly_day: Option<String>,
    pub monthly_day: Option<u32>,
    pub sql_query: String,
    pub sql_execution_data: serde_json::Value,
}

/// One interval `[start_ts, end_ts)`; `window_date` equals `start_ts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "iso_millis")]
    pub window_date: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub start_ts: DateTime<Utc>,
    #[serde(with = "iso_millis")]
    pub end_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KpiLogs {
    pub kpi_name: String,
    pub entries: Vec<ExecutionLogEntry>,
}

pub type LogsByFrequency = BTreeMap<Frequency, Vec<KpiLogs>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeLogs {
    pub insight_id: String,
    pub logs: LogsByFrequency,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiSummary {
    pub kpi_name: String,
    pub kpi_value: Vec<f64>,
    pub executed_at: Vec<DateTime<Utc>>,
    pub frequency: Frequency,
    pub sql_query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KpiPayload {
    pub parent: Vec<KpiSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<KpiPayload>>,
}

impl KpiPayload {
    pub fn is_empty(&self) -> bool {
        self.parent.is_empty() && self.children.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastPoint {
    pub kpi_name: String,
    pub kpi_value: f64,
    pub executed_at: DateTime<Utc>,
    pub frequency: String,
}

#[derive(Debug, Clone)]
pub struct PrescriptiveRecord {
    pub insight_id: String,
    pub kpi_name: Option<String>,
    pub frequency: String,
    pub summary: serde_json::Value,
    pub recommendations: serde_json::Value,
    pub forecasts: serde_json::Value,
    pub highlights: serde_json::Value,
    pub generated_metadata: serde_json::Value,
    pub executed_metadata: serde_json::Value,
}

mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::{Frequency, JobStatus, KpiPayload, TimeWindow};
    use chrono::{TimeZone, Utc};

    #[test]
    fn time_window_serializes_with_millisecond_utc_timestamps() {
        let start = Utc.with_ymd_and_hms(2024, 3, 9, 9, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 10, 9, 30, 0).unwrap();
        let window = TimeWindow {
            window_date: start,
            start_ts: start,
            end_ts: end,
        };
        let value = serde_json::to_value(window).expect("serialize window");
        assert_eq!(value["window_date"], "2024-03-09T09:30:00.000Z");
        assert_eq!(value["end_ts"], "2024-03-10T09:30:00.000Z");

        let back: TimeWindow = serde_json::from_value(value).expect("deserialize window");
        assert_eq!(back, window);
    }

    #[test]
    fn empty_payload_omits_children_key() {
        let payload = KpiPayload {
            parent: vec![],
            children: None,
        };
        assert!(payload.is_empty());
        let value = serde_json::to_value(&payload).expect("serialize payload");
        assert!(value.get("children").is_none());
    }

    #[test]
    fn status_and_frequency_tags_parse() {
        assert_eq!(JobStatus::parse("processing"), Some(JobStatus::Processing));
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert_eq!(Frequency::parse("weekly"), Some(Frequency::Weekly));
        assert_eq!(Frequency::parse("hourly"), None);
    }
}
