//! `TableLoadHandler`: loads CSV objects into a warehouse table.
//!
//! Records are matched to the schema by position. Every source object is
//! parsed and validated before anything reaches the warehouse, so a bad file
//! never leaves a half-loaded table behind.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::schema::{Cell, ColumnSchema};
use crate::storage::ObjectStore;
use crate::traits::{unexpected_operation, ExecutionContext};
use crate::warehouse::Warehouse;
use crate::{NodeError, Operation, TaskHandler};

pub struct TableLoadHandler {
    store: Arc<dyn ObjectStore>,
    warehouse: Arc<dyn Warehouse>,
}

impl TableLoadHandler {
    pub fn new(store: Arc<dyn ObjectStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        Self { store, warehouse }
    }
}

#[async_trait]
impl TaskHandler for TableLoadHandler {
    #[instrument(skip_all, fields(task_id = %ctx.task_id))]
    async fn execute(
        &self,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let Operation::TableLoad(load) = operation else {
            return Err(unexpected_operation("table load", operation));
        };

        let mut rows = Vec::new();
        for object in &load.source_objects {
            let data = self.store.get(&load.bucket, object).await?;
            let parsed = parse_rows(
                &data,
                &load.schema,
                load.skip_leading_rows,
                load.allow_quoted_newlines,
            )
            .map_err(|e| match e {
                NodeError::SchemaMismatch(msg) => {
                    NodeError::SchemaMismatch(format!("{}/{object}: {msg}", load.bucket))
                }
                other => other,
            })?;
            rows.extend(parsed);
        }

        let loaded = rows.len() as u64;
        let total = self
            .warehouse
            .load(&load.destination_table, &load.schema, rows, load.write_mode)
            .await?;

        info!(
            "loaded {} rows into {} ({:?}), table now has {} rows",
            loaded, load.destination_table, load.write_mode, total
        );

        Ok(json!({
            "table": load.destination_table.to_string(),
            "rows_loaded": loaded,
            "table_rows": total,
        }))
    }
}

/// Parse and coerce every data record of one CSV object.
pub fn parse_rows(
    data: &[u8],
    schema: &ColumnSchema,
    skip_leading_rows: u64,
    allow_quoted_newlines: bool,
) -> Result<Vec<Vec<Cell>>, NodeError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(data);

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| NodeError::SchemaMismatch(format!("unreadable CSV: {e}")))?;
        if (index as u64) < skip_leading_rows {
            continue;
        }
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        if !allow_quoted_newlines && record.iter().any(|f| f.contains(['\n', '\r'])) {
            return Err(NodeError::SchemaMismatch(format!(
                "line {line}: quoted newline found but allow_quoted_newlines is false"
            )));
        }

        rows.push(schema.coerce_record(&record, line)?);
    }
    Ok(rows)
}
