//! `nodes` crate: the `TaskHandler` trait and the built-in task handlers.
//!
//! Every task kind (shell command, container job, table load, object move)
//! is executed through [`TaskHandler`]. The engine crate dispatches through
//! this trait object and never inlines the work itself.

pub mod error;
pub mod traits;
pub mod operation;
pub mod schema;
pub mod storage;
pub mod warehouse;
pub mod shell;
pub mod container;
pub mod table_load;
pub mod object_move;
pub mod mock;

pub use error::NodeError;
pub use traits::{ExecutionContext, TaskHandler};
pub use operation::{Operation, OperationKind};
pub use schema::{ColumnDef, ColumnMode, ColumnSchema, ColumnType};
pub use storage::{LocalObjectStore, ObjectStore};
pub use warehouse::{MemoryWarehouse, Warehouse};
