//! `ObjectMoveHandler`: archives processed objects into long-term storage.
//!
//! Source objects may be named exactly or with a single `*` wildcard. For a
//! wildcard the text before `*` is the prefix, and every match is moved to
//! `destination_object` followed by the part of its name after the prefix.

use std::sync::Arc;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::operation::ObjectMove;
use crate::storage::ObjectStore;
use crate::traits::{unexpected_operation, ExecutionContext};
use crate::{NodeError, Operation, TaskHandler};

pub struct ObjectMoveHandler {
    store: Arc<dyn ObjectStore>,
}

impl ObjectMoveHandler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// (source, destination) pairs for the objects currently matching.
    async fn plan(&self, mv: &ObjectMove) -> Result<Vec<(String, String)>, NodeError> {
        let Some((prefix, _)) = mv.source_object.split_once('*') else {
            let into_folder =
                mv.destination_object.ends_with('/') || mv.destination_object.is_empty();
            let destination = if into_folder {
                let file_name = mv.source_object.rsplit('/').next().unwrap_or(&mv.source_object);
                format!("{}{file_name}", mv.destination_object)
            } else {
                mv.destination_object.clone()
            };
            return Ok(vec![(mv.source_object.clone(), destination)]);
        };

        let pattern = Pattern::new(&mv.source_object).map_err(|e| {
            NodeError::InvalidContract(format!("bad source pattern '{}': {e}", mv.source_object))
        })?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };

        Ok(self
            .store
            .list(&mv.source_bucket, prefix)
            .await?
            .into_iter()
            .filter(|name| pattern.matches_with(name, options))
            .map(|name| {
                let destination = format!("{}{}", mv.destination_object, &name[prefix.len()..]);
                (name, destination)
            })
            .collect())
    }
}

#[async_trait]
impl TaskHandler for ObjectMoveHandler {
    #[instrument(skip_all, fields(task_id = %ctx.task_id))]
    async fn execute(
        &self,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let Operation::ObjectMove(mv) = operation else {
            return Err(unexpected_operation("object move", operation));
        };

        let plan = self.plan(mv).await?;
        let mut moved = Vec::with_capacity(plan.len());

        for (source, destination) in plan {
            match self
                .store
                .move_object(&mv.source_bucket, &source, &mv.destination_bucket, &destination)
                .await
            {
                Ok(()) => {
                    info!(
                        "moved {}/{} -> {}/{}",
                        mv.source_bucket, source, mv.destination_bucket, destination
                    );
                    moved.push(destination);
                }
                // Already archived or never produced: nothing to retire.
                Err(NodeError::SourceNotFound(what)) => {
                    warn!("nothing to move at {what}");
                }
                Err(other) => return Err(other),
            }
        }

        if moved.is_empty() {
            warn!(
                "no objects matched {}/{}; archival is a no-op",
                mv.source_bucket, mv.source_object
            );
        }

        Ok(json!({
            "destination_bucket": mv.destination_bucket,
            "moved": moved,
        }))
    }
}
