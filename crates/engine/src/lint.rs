//! Non-fatal consistency checks over a built pipeline.
//!
//! Loads are positional, so a transform container whose `CSV_HEADERS`
//! disagree with the schema of the table load reading its output will put
//! values in the wrong columns without any error. This module reports such
//! pairs.

use std::fmt;

use serde::Serialize;

use crate::models::{PipelineSpec, TaskKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    /// The container job declaring the headers.
    pub producer: String,
    /// The table load reading the container's output.
    pub consumer: String,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.producer, self.consumer, self.message)
    }
}

/// Compare each container job's literal `CSV_HEADERS` with the schema of
/// every downstream table load whose source objects include the job's
/// `TARGET_GCS_PATH`.
pub fn lint(spec: &PipelineSpec) -> Vec<Finding> {
    let mut findings = Vec::new();

    for task in spec.tasks() {
        let TaskKind::ContainerJob(job) = &task.kind else {
            continue;
        };
        let Some(headers) = job
            .env_vars
            .get("CSV_HEADERS")
            .and_then(|t| t.as_literal())
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
        else {
            continue;
        };
        let Some(target) = job.env_vars.get("TARGET_GCS_PATH") else {
            continue;
        };

        let descendants = spec.descendants(&task.id);
        for consumer in spec.tasks().iter().filter(|t| descendants.contains(&t.id)) {
            let TaskKind::TableLoad(load) = &consumer.kind else {
                continue;
            };
            if !load.source_objects.iter().any(|s| s.source() == target.source()) {
                continue;
            }

            let columns: Vec<&str> = load.schema.names().collect();
            let message = if headers.len() != columns.len() {
                Some(format!(
                    "CSV_HEADERS has {} columns but the schema of {} has {}",
                    headers.len(),
                    load.destination_table,
                    columns.len()
                ))
            } else {
                headers
                    .iter()
                    .zip(&columns)
                    .position(|(h, c)| h != c)
                    .map(|i| {
                        format!(
                            "column {} is '{}' in CSV_HEADERS but '{}' in the schema of {}",
                            i + 1,
                            headers[i],
                            columns[i],
                            load.destination_table
                        )
                    })
            };

            if let Some(message) = message {
                findings.push(Finding {
                    producer: task.id.clone(),
                    consumer: consumer.id.clone(),
                    message,
                });
            }
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::dag::build_pipeline;
    use crate::models::PipelineDeclaration;
    use crate::variables::Variables;

    fn spec(headers: &str, schema: serde_json::Value, source: &str) -> PipelineSpec {
        let decl: PipelineDeclaration = serde_json::from_value(json!({
            "dataset": "race_and_economic_opportunity",
            "pipeline": "national_statistics",
            "tasks": [
                {
                    "id": "transform",
                    "kind": "container_job",
                    "name": "transform",
                    "image": "img",
                    "env_vars": {
                        "SOURCE_URL": "https://example.org/table.csv",
                        "TARGET_FILE": "files/data_output.csv",
                        "TARGET_GCS_BUCKET": "bkt",
                        "TARGET_GCS_PATH": "data/out/data_output.csv",
                        "CSV_HEADERS": headers
                    }
                },
                {
                    "id": "load",
                    "kind": "table_load",
                    "bucket": "bkt",
                    "source_objects": [source],
                    "destination_table": "race_and_economic_opportunity.national_statistics",
                    "skip_leading_rows": 1,
                    "schema": schema
                }
            ],
            "chain": ["transform", "load"]
        }))
        .unwrap();
        build_pipeline(decl, &Variables::new()).unwrap()
    }

    fn columns(names: &[&str]) -> serde_json::Value {
        json!(names
            .iter()
            .map(|n| json!({ "name": n, "type": "FLOAT" }))
            .collect::<Vec<_>>())
    }

    #[test]
    fn reordered_headers_are_reported() {
        let spec = spec(
            r#"["par_black", "par_hisp", "par_white"]"#,
            columns(&["par_black", "par_white", "par_hisp"]),
            "data/out/data_output.csv",
        );
        let findings = lint(&spec);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].producer, "transform");
        assert_eq!(findings[0].consumer, "load");
        assert!(findings[0].message.contains("column 2"));
    }

    #[test]
    fn count_mismatch_is_reported() {
        let spec = spec(r#"["a", "b"]"#, columns(&["a"]), "data/out/data_output.csv");
        assert!(lint(&spec)[0].message.contains("2 columns"));
    }

    #[test]
    fn aligned_or_unrelated_loads_are_clean() {
        let aligned = spec(r#"["a", "b"]"#, columns(&["a", "b"]), "data/out/data_output.csv");
        assert!(lint(&aligned).is_empty());
        assert!(lint(&spec(r#"["a", "b"]"#, columns(&["b", "a"]), "data/other.csv")).is_empty());
    }

    #[test]
    fn shipped_declarations_build_and_lint() {
        let root = concat!(env!("CARGO_MANIFEST_DIR"), "/../../pipelines");
        let variables = Variables::from_path(format!("{root}/variables.example.json")).unwrap();
        let declarations = PipelineDeclaration::load_dir(root).unwrap();
        assert_eq!(declarations.len(), 6);

        let mut findings = Vec::new();
        for (path, decl) in declarations {
            let spec = build_pipeline(decl, &variables)
                .unwrap_or_else(|e| panic!("{} does not build: {e}", path.display()));
            findings.extend(lint(&spec));
        }

        assert_eq!(findings.len(), 1, "{findings:?}");
        assert!(findings[0].message.contains("column 5"));
        assert!(findings[0].message.contains("cz_pop_hisp2000"));
    }
}
