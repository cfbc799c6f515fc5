use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{ExecutionLogEntry, Frequency, InsightNode, KpiLogs, LogsByFrequency, NodeLogs};

/// Groups newest-first entries into frequency -> KPI name -> entries. Entries
/// with an unrecognized frequency are dropped; KPI groups keep first-seen order.
pub fn group_logs(entries: Vec<ExecutionLogEntry>) -> LogsByFrequency {
    let mut grouped: LogsByFrequency = Frequency::ALL.iter().map(|frequency| (*frequency, Vec::new())).collect();

    for entry in entries {
        let Some(frequency) = Frequency::parse(&entry.frequency) else {
            continue;
        };
        let groups = grouped.entry(frequency).or_default();
        match groups.iter_mut().find(|group| group.kpi_name == entry.kpi_name) {
            Some(group) => group.entries.push(entry),
            None => groups.push(KpiLogs {
                kpi_name: entry.kpi_name.clone(),
                entries: vec![entry],
            }),
        }
    }

    grouped
}

/// One record per node of `root`, in preorder.
pub fn collect_logs_for_tree(db: &Database, root: &InsightNode, frequency: Option<&str>) -> AppResult<Vec<NodeLogs>> {
    let mut records = Vec::with_capacity(root.node_count());
    collect_into(db, root, frequency, &mut records)?;
    Ok(records)
}

fn collect_into(
    db: &Database,
    node: &InsightNode,
    frequency: Option<&str>,
    records: &mut Vec<NodeLogs>,
) -> AppResult<()> {
    let entries = db.list_execution_logs(&node.id, frequency)?;
    records.push(NodeLogs {
        insight_id: node.id.clone(),
        logs: group_logs(entries),
    });
    for child in &node.children {
        collect_into(db, child, frequency, records)?;
    }
    Ok(())
}

/// Keeps only the newest `max_per_kpi` entries of every (frequency, KPI) list.
pub fn truncate_logs(records: &[NodeLogs], max_per_kpi: usize) -> Vec<NodeLogs> {
    records
        .iter()
        .map(|record| NodeLogs {
            insight_id: record.insight_id.clone(),
            logs: record
                .logs
                .iter()
                .map(|(frequency, groups)| {
                    let groups = groups
                        .iter()
                        .map(|group| KpiLogs {
                            kpi_name: group.kpi_name.clone(),
                            entries: group.entries.iter().take(max_per_kpi).cloned().collect(),
                        })
                        .collect();
                    (*frequency, groups)
                })
                .collect(),
        })
        .collect()
}
