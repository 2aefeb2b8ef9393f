//! Pipeline construction: run this before executing or rendering a pipeline.
//!
//! Rules enforced, in order:
//! 1. Dataset and pipeline names are non-empty and dot-free.
//! 2. Task IDs must be unique within the pipeline.
//! 3. Every edge must reference valid task IDs (both `from` and `to`).
//! 4. The directed graph must be acyclic (topological sort must succeed).
//! 5. Table schemas have unique column names; table ids are `dataset.table`.
//! 6. Container jobs carry the transform image's env contract.
//! 7. Every variable referenced by a template exists.
//!
//! Construction is pure: nothing is rendered or executed.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use tracing::debug;

use crate::models::{
    parse_table_id, ContainerJobParams, Edge, PipelineDeclaration, PipelineSpec, TaskKind,
};
use crate::variables::Variables;
use crate::EngineError;

/// Validate a declaration and freeze it into a [`PipelineSpec`].
///
/// # Errors
/// - [`EngineError::DuplicateTaskId`] if two tasks share an ID.
/// - [`EngineError::UnknownTaskReference`] if an edge references a missing task.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
/// - [`EngineError::DuplicateColumn`] if a table schema repeats a column.
/// - [`EngineError::InvalidDeclaration`] for malformed names, table ids or
///   container env contracts.
/// - [`EngineError::UnresolvedVariable`] if a template reads a missing variable.
pub fn build_pipeline(
    declaration: PipelineDeclaration,
    variables: &Variables,
) -> Result<PipelineSpec, EngineError> {
    for (field, value) in [("dataset", &declaration.dataset), ("pipeline", &declaration.pipeline)] {
        if value.is_empty() || value.contains('.') {
            return Err(EngineError::InvalidDeclaration(format!(
                "{field} name '{value}' must be non-empty and contain no '.'"
            )));
        }
    }

    let edges = dedup_edges(declaration.all_edges());
    let ids: Vec<&str> = declaration.tasks.iter().map(|t| t.id.as_str()).collect();
    let order = topological_order(&ids, &edges)?;

    for task in &declaration.tasks {
        match &task.kind {
            TaskKind::TableLoad(load) => {
                if let Some(column) = load.schema.duplicate_name() {
                    return Err(EngineError::DuplicateColumn {
                        task_id: task.id.clone(),
                        column: column.to_owned(),
                    });
                }
                parse_table_id(&task.id, &load.destination_table)?;
                if load.schema.is_empty() {
                    return Err(EngineError::InvalidDeclaration(format!(
                        "task '{}': schema has no columns",
                        task.id
                    )));
                }
                if load.source_objects.is_empty() {
                    return Err(EngineError::InvalidDeclaration(format!(
                        "task '{}': no source objects",
                        task.id
                    )));
                }
                if !load.source_format.eq_ignore_ascii_case("csv") {
                    return Err(EngineError::InvalidDeclaration(format!(
                        "task '{}': unsupported source format '{}'",
                        task.id, load.source_format
                    )));
                }
            }
            TaskKind::ContainerJob(job) => check_container_contract(&task.id, job)?,
            TaskKind::ShellCommand(_) | TaskKind::ObjectMove(_) => {}
        }
    }

    for task in &declaration.tasks {
        for (param, template) in task.parameters() {
            if let Some(missing) = template.variables().find(|v| !variables.contains(v)) {
                debug!(
                    "task '{}' parameter '{}' reads missing variable '{}'",
                    task.id, param, missing
                );
                return Err(EngineError::UnresolvedVariable(missing.to_owned()));
            }
        }
    }

    let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
    let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
    for edge in &edges {
        upstream.entry(edge.to.clone()).or_default().push(edge.from.clone());
        downstream.entry(edge.from.clone()).or_default().push(edge.to.clone());
    }

    Ok(PipelineSpec {
        dataset: declaration.dataset,
        pipeline: declaration.pipeline,
        description: declaration.description,
        schedule: declaration.schedule,
        start_date: declaration.start_date,
        tasks: declaration.tasks,
        edges,
        order,
        upstream,
        downstream,
    })
}

/// Validate task ids and edges, returning ids in topological order.
///
/// Ties are broken by the position of the task in `ids`, so the result is
/// deterministic for a given declaration.
pub fn topological_order(ids: &[&str], edges: &[Edge]) -> Result<Vec<String>, EngineError> {
    // -----------------------------------------------------------------------
    // 1. Ensure task IDs are unique
    // -----------------------------------------------------------------------
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(ids.len());
    for (i, &id) in ids.iter().enumerate() {
        if index.insert(id, i).is_some() {
            return Err(EngineError::DuplicateTaskId(id.to_owned()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in edges {
        if !index.contains_key(edge.from.as_str()) {
            return Err(EngineError::UnknownTaskReference {
                task_id: edge.from.clone(),
                side: "from",
            });
        }
        if !index.contains_key(edge.to.as_str()) {
            return Err(EngineError::UnknownTaskReference {
                task_id: edge.to.clone(),
                side: "to",
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    let mut in_degree: Vec<usize> = vec![0; ids.len()];
    for edge in edges {
        let (from, to) = (index[edge.from.as_str()], index[edge.to.as_str()]);
        adjacency[from].push(to);
        in_degree[to] += 1;
    }
    for neighbours in &mut adjacency {
        neighbours.sort_unstable();
    }

    // Seed the queue with tasks that have no incoming edges.
    let mut queue: VecDeque<usize> = (0..ids.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut sorted: Vec<String> = Vec::with_capacity(ids.len());

    while let Some(i) = queue.pop_front() {
        sorted.push(ids[i].to_owned());
        for &next in &adjacency[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    // If we didn't visit every task the graph contains a cycle.
    if sorted.len() != ids.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(sorted)
}

fn dedup_edges(edges: Vec<Edge>) -> Vec<Edge> {
    let mut seen = HashSet::new();
    edges.into_iter().filter(|e| seen.insert(e.clone())).collect()
}

/// Check the transform env contract with templated values stood in for by
/// placeholders. JSON-valued keys are only checked when written literally.
fn check_container_contract(task_id: &str, job: &ContainerJobParams) -> Result<(), EngineError> {
    let stand_in_env: BTreeMap<String, String> = job
        .env_vars
        .iter()
        .filter_map(|(key, value)| match value.as_literal() {
            Some(text) => Some((key.clone(), text.to_owned())),
            None if matches!(key.as_str(), "CSV_HEADERS" | "RENAME_MAPPINGS") => None,
            None => Some((key.clone(), String::new())),
        })
        .collect();

    nodes::container::validate_contract(&stand_in_env)
        .map_err(|e| EngineError::InvalidDeclaration(format!("task '{task_id}': {e}")))
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::{ObjectMoveParams, ShellCommandParams, TaskDescriptor};
    use crate::template::Template;

    fn make_task(id: &str) -> TaskDescriptor {
        TaskDescriptor::new(
            id,
            TaskKind::ShellCommand(ShellCommandParams {
                command: Template::literal("true"),
                env: BTreeMap::new(),
            }),
        )
    }

    fn make_declaration(tasks: Vec<TaskDescriptor>, edges: Vec<Edge>) -> PipelineDeclaration {
        PipelineDeclaration {
            dataset: "test".into(),
            pipeline: "dag".into(),
            description: None,
            schedule: None,
            start_date: None,
            tasks,
            edges,
            chain: Vec::new(),
        }
    }

    fn build(decl: PipelineDeclaration) -> Result<PipelineSpec, EngineError> {
        build_pipeline(decl, &Variables::new())
    }

    #[test]
    fn valid_linear_dag_returns_sorted_order() {
        // A → B → C
        let spec = build(make_declaration(
            vec![make_task("a"), make_task("b"), make_task("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        ))
        .expect("should be valid");
        assert_eq!(spec.topological_order(), ["a", "b", "c"]);
        assert_eq!(spec.upstream("c"), ["b"]);
        assert_eq!(spec.descendants("a").len(), 2);
    }

    #[test]
    fn valid_diamond_dag() {
        //   A
        //  / \
        // B   C
        //  \ /
        //   D
        let spec = build(make_declaration(
            vec![make_task("a"), make_task("c"), make_task("b"), make_task("d")],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        ))
        .expect("should be valid");
        // Ties follow declaration order: c was declared before b.
        assert_eq!(spec.topological_order(), ["a", "c", "b", "d"]);
    }

    #[test]
    fn chain_shorthand_and_repeated_edges() {
        let mut decl = make_declaration(
            vec![make_task("x"), make_task("y"), make_task("z")],
            vec![Edge::new("x", "y")],
        );
        decl.chain = vec!["x".into(), "y".into(), "z".into()];
        let spec = build(decl).unwrap();
        assert_eq!(spec.edges().len(), 2);
        assert_eq!(spec.topological_order(), ["x", "y", "z"]);
    }

    #[test]
    fn duplicate_task_id_is_rejected() {
        let decl = make_declaration(vec![make_task("a"), make_task("a")], vec![]);
        assert!(matches!(
            build(decl),
            Err(EngineError::DuplicateTaskId(id)) if id == "a"
        ));
    }

    #[test]
    fn edge_referencing_missing_task_is_rejected() {
        let decl = make_declaration(vec![make_task("a")], vec![Edge::new("a", "ghost")]);
        assert!(matches!(
            build(decl),
            Err(EngineError::UnknownTaskReference { task_id, side: "to" }) if task_id == "ghost"
        ));
    }

    #[test]
    fn cycle_is_detected() {
        // A → B → C → A
        let decl = make_declaration(
            vec![make_task("a"), make_task("b"), make_task("c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c"), Edge::new("c", "a")],
        );
        assert!(matches!(build(decl), Err(EngineError::CycleDetected)));

        let self_loop = make_declaration(vec![make_task("a")], vec![Edge::new("a", "a")]);
        assert!(matches!(build(self_loop), Err(EngineError::CycleDetected)));
    }

    #[test]
    fn single_task_no_edges_is_valid() {
        let spec = build(make_declaration(vec![make_task("solo")], vec![])).unwrap();
        assert_eq!(spec.topological_order(), ["solo"]);
        assert_eq!(spec.key(), "test.dag");
    }

    #[test]
    fn dotted_pipeline_name_is_rejected() {
        let mut decl = make_declaration(vec![make_task("a")], vec![]);
        decl.pipeline = "a.b".into();
        assert!(matches!(build(decl), Err(EngineError::InvalidDeclaration(_))));
    }

    fn load_task(schema: serde_json::Value, table: &str) -> TaskDescriptor {
        serde_json::from_value(json!({
            "id": "load",
            "kind": "table_load",
            "bucket": "bkt",
            "source_objects": ["data/out.csv"],
            "destination_table": table,
            "schema": schema
        }))
        .unwrap()
    }

    #[test]
    fn duplicate_schema_column_is_rejected() {
        let decl = make_declaration(
            vec![load_task(
                json!([{ "name": "id", "type": "INTEGER" }, { "name": "id", "type": "STRING" }]),
                "ds.table",
            )],
            vec![],
        );
        assert!(matches!(
            build(decl),
            Err(EngineError::DuplicateColumn { column, .. }) if column == "id"
        ));
    }

    #[test]
    fn malformed_table_id_is_rejected() {
        let decl = make_declaration(
            vec![load_task(json!([{ "name": "id", "type": "INTEGER" }]), "just_a_table")],
            vec![],
        );
        assert!(matches!(build(decl), Err(EngineError::InvalidDeclaration(_))));
    }

    #[test]
    fn container_contract_is_checked_at_construction() {
        let container = |env: serde_json::Value| -> TaskDescriptor {
            serde_json::from_value(json!({
                "id": "transform",
                "kind": "container_job",
                "name": "transform",
                "image": "img",
                "env_vars": env
            }))
            .unwrap()
        };

        let missing_target = container(json!({ "SOURCE_URL": "https://x", "TARGET_FILE": "f" }));
        assert!(matches!(
            build(make_declaration(vec![missing_target], vec![])),
            Err(EngineError::InvalidDeclaration(msg)) if msg.contains("TARGET_GCS_BUCKET")
        ));

        let templated = container(json!({
            "SOURCE_URL": "https://x/{{ ds }}.csv",
            "TARGET_FILE": "f",
            "TARGET_GCS_BUCKET": "{{ var.value.composer_bucket }}",
            "TARGET_GCS_PATH": "p",
            "CSV_HEADERS": "[\"a\",\"b\"]"
        }));
        let vars = Variables::from_value(json!({ "composer_bucket": "bkt" })).unwrap();
        build_pipeline(make_declaration(vec![templated], vec![]), &vars).unwrap();
    }

    #[test]
    fn missing_variable_is_rejected_at_construction() {
        let task = TaskDescriptor::new(
            "archive",
            TaskKind::ObjectMove(ObjectMoveParams {
                source_bucket: Template::parse("{{ var.value.composer_bucket }}").unwrap(),
                source_object: Template::literal("data/*.csv"),
                destination_bucket: Template::parse("{{ var.json.archive.bucket }}").unwrap(),
                destination_object: Template::literal("archive/"),
            }),
        );
        let vars = Variables::from_value(json!({ "composer_bucket": "bkt" })).unwrap();
        assert!(matches!(
            build_pipeline(make_declaration(vec![task], vec![]), &vars),
            Err(EngineError::UnresolvedVariable(v)) if v == "archive.bucket"
        ));
    }
}
