use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::InsightNode;
use std::collections::HashSet;

/// Materializes `root_id` and every descendant with their KPI definitions.
pub fn load_insight_tree(db: &Database, root_id: &str) -> AppResult<InsightNode> {
    let mut visited = HashSet::new();
    load_node(db, root_id, &mut visited)?
        .ok_or_else(|| AppError::NotFound(format!("Insight {} not found", root_id)))
}

fn load_node(db: &Database, insight_id: &str, visited: &mut HashSet<String>) -> AppResult<Option<InsightNode>> {
    if !visited.insert(insight_id.to_string()) {
        return Err(AppError::CyclicHierarchy(format!(
            "Insight {} appears more than once in its own hierarchy",
            insight_id
        )));
    }

    let Some(record) = db.get_insight(insight_id)? else {
        return Ok(None);
    };

    let mut children = Vec::with_capacity(record.child_ids.len());
    for child_id in &record.child_ids {
        // Dangling child ids are skipped.
        if let Some(child) = load_node(db, child_id, visited)? {
            children.push(child);
        }
    }

    Ok(Some(InsightNode {
        id: record.id,
        application_id: record.application_id,
        kpi: record.kpi,
        kpis: record.kpis,
        children,
    }))
}

/// Preorder list of the ids in a loaded tree.
pub fn preorder_ids(root: &InsightNode) -> Vec<&str> {
    let mut ids = Vec::with_capacity(root.node_count());
    collect_ids(root, &mut ids);
    ids
}

fn collect_ids<'a>(node: &'a InsightNode, ids: &mut Vec<&'a str>) {
    ids.push(node.id.as_str());
    for child in &node.children {
        collect_ids(child, ids);
    }
}

#[cfg(test)]
mod tests {
    use super::{load_insight_tree, preorder_ids};
    use crate::db::Database;
    use crate::errors::AppError;

    #[test]
    fn loads_nested_children_in_preorder() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("state.sqlite")).expect("db");
        let kpi = db.insert_kpi("Churn", "SELECT 1", &[]).expect("kpi");
        let root = db.insert_insight("app", None, None).expect("root");
        let a = db.insert_insight("app", Some(&root), None).expect("a");
        let a1 = db.insert_insight("app", Some(&a), None).expect("a1");
        let b = db.insert_insight("app", Some(&root), None).expect("b");
        db.bind_kpi(&a1, &kpi.id).expect("bind");

        let tree = load_insight_tree(&db, &root).expect("tree");
        assert_eq!(tree.node_count(), 4);
        assert_eq!(preorder_ids(&tree), vec![root.as_str(), a.as_str(), a1.as_str(), b.as_str()]);
        assert!(tree.kpis.is_empty());
        assert_eq!(tree.children[0].children[0].kpis[0].kpi.name, "Churn");
        assert!(tree.children[1].children.is_empty());
    }

    #[test]
    fn leaf_without_bindings_is_a_valid_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("state.sqlite")).expect("db");
        let root = db.insert_insight("app", None, None).expect("root");
        let tree = load_insight_tree(&db, &root).expect("tree");
        assert_eq!(tree.node_count(), 1);
        assert!(tree.kpis.is_empty());
        assert!(tree.kpi.is_none());
    }

    #[test]
    fn missing_root_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("state.sqlite")).expect("db");
        let err = load_insight_tree(&db, "nope").expect_err("missing root");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn cycles_are_reported_instead_of_looping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("state.sqlite")).expect("db");
        let root = db.insert_insight("app", None, None).expect("root");
        let child = db.insert_insight("app", Some(&root), None).expect("child");
        db.set_insight_parent(&root, Some(&child)).expect("reparent");

        let err = load_insight_tree(&db, &root).expect_err("cycle");
        assert!(matches!(err, AppError::CyclicHierarchy(_)));
    }
}
