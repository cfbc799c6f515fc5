use crate::models::{ForecastPoint, Frequency, InsightNode, KpiDefinition, KpiPayload, KpiSummary, NodeLogs};

/// Folds per-node log records into a payload shaped like the insight tree.
/// Descendants that contribute no summaries anywhere below them are dropped.
pub fn build_kpi_payload(node: &InsightNode, records: &[NodeLogs]) -> KpiPayload {
    let mut parent: Vec<KpiSummary> = Vec::new();
    // Summaries are keyed on the stored name; trimming is for display only.
    let mut keys: Vec<(&str, Frequency)> = Vec::new();

    if let Some(record) = records.iter().find(|record| record.insight_id == node.id) {
        for (frequency, groups) in &record.logs {
            for group in groups {
                let key = (group.kpi_name.as_str(), *frequency);
                let position = match keys.iter().position(|existing| *existing == key) {
                    Some(position) => position,
                    None => {
                        let definition = resolve_definition(node, &group.kpi_name);
                        keys.push(key);
                        parent.push(KpiSummary {
                            kpi_name: display_name(node, &group.kpi_name),
                            kpi_value: Vec::new(),
                            executed_at: Vec::new(),
                            frequency: *frequency,
                            sql_query: definition.map(|kpi| kpi.sql_query.clone()),
                        });
                        parent.len() - 1
                    }
                };
                let summary = &mut parent[position];
                for entry in &group.entries {
                    summary.kpi_value.push(entry.kpi_value);
                    summary.executed_at.push(entry.occurred_at);
                }
            }
        }
    }

    let children = node
        .children
        .iter()
        .map(|child| build_kpi_payload(child, records))
        .filter(|payload| !payload.is_empty())
        .collect::<Vec<_>>();

    KpiPayload {
        parent,
        children: if children.is_empty() { None } else { Some(children) },
    }
}

/// Exact-name match against the node's bindings, then its primary KPI.
fn resolve_definition<'a>(node: &'a InsightNode, kpi_name: &str) -> Option<&'a KpiDefinition> {
    node.kpis
        .iter()
        .map(|binding| &binding.kpi)
        .find(|kpi| kpi.name == kpi_name)
        .or_else(|| node.kpi.as_ref().filter(|kpi| kpi.name == kpi_name))
}

fn display_name(node: &InsightNode, kpi_name: &str) -> String {
    let trimmed = kpi_name.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    resolve_definition(node, kpi_name)
        .map(|kpi| kpi.name.clone())
        .unwrap_or_else(|| "Unnamed KPI".to_string())
}

/// Flattens the newest `per_kpi` entries of every (frequency, KPI) list into
/// forecast input, plus the distinct KPI names in first-seen order.
pub fn build_forecast_payload(records: &[NodeLogs], per_kpi: usize) -> (Vec<ForecastPoint>, Vec<String>) {
    let mut points = Vec::new();
    let mut names: Vec<String> = Vec::new();

    for record in records {
        for groups in record.logs.values() {
            for group in groups {
                for entry in group.entries.iter().take(per_kpi) {
                    points.push(ForecastPoint {
                        kpi_name: entry.kpi_name.clone(),
                        kpi_value: entry.kpi_value,
                        executed_at: entry.occurred_at,
                        frequency: entry.frequency.clone(),
                    });
                    if !names.iter().any(|name| name == &entry.kpi_name) {
                        names.push(entry.kpi_name.clone());
                    }
                }
            }
        }
    }

    (points, names)
}
