//! Warehouse seam for table loads.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::operation::{TableId, WriteMode};
use crate::schema::{Cell, ColumnSchema};
use crate::NodeError;

/// A structured table store.
///
/// `load` receives rows that were already coerced against `schema` and must
/// apply them as one batch: on error the table is left as it was.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Apply `rows` to `table`; returns the table's row count afterwards.
    async fn load(
        &self,
        table: &TableId,
        schema: &ColumnSchema,
        rows: Vec<Vec<Cell>>,
        mode: WriteMode,
    ) -> Result<u64, NodeError>;

    /// Current row count, `None` if the table does not exist.
    async fn row_count(&self, table: &TableId) -> Result<Option<u64>, NodeError>;
}

#[derive(Debug, Clone)]
struct StoredTable {
    schema: ColumnSchema,
    rows: Vec<Vec<Cell>>,
}

/// In-process warehouse. Tables are created on first load.
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<TableId, StoredTable>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &TableId) -> Option<Vec<Vec<Cell>>> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).map(|t| t.rows.clone())
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn load(
        &self,
        table: &TableId,
        schema: &ColumnSchema,
        rows: Vec<Vec<Cell>>,
        mode: WriteMode,
    ) -> Result<u64, NodeError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);

        match (tables.get_mut(table), mode) {
            (Some(existing), WriteMode::Append) => {
                if existing.schema != *schema {
                    return Err(NodeError::SchemaMismatch(format!(
                        "cannot append to {table}: schema differs from the existing table"
                    )));
                }
                existing.rows.extend(rows);
                Ok(existing.rows.len() as u64)
            }
            _ => {
                let count = rows.len() as u64;
                tables.insert(
                    table.clone(),
                    StoredTable {
                        schema: schema.clone(),
                        rows,
                    },
                );
                Ok(count)
            }
        }
    }

    async fn row_count(&self, table: &TableId) -> Result<Option<u64>, NodeError> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(table).map(|t| t.rows.len() as u64))
    }
}
