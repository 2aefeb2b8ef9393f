//! Named configuration variables (bucket names, registry paths, shared folders).
//!
//! The store is a JSON object. Top-level keys are variable names; nested
//! objects are addressed with dotted paths, so `shared.airflow_data_folder`
//! reads `{"shared": {"airflow_data_folder": ...}}`. It is passed explicitly
//! to pipeline construction and rendering; there is no global lookup.

use std::path::Path;

use serde_json::{Map, Value};

use crate::EngineError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    root: Map<String, Value>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, EngineError> {
        match value {
            Value::Object(root) => Ok(Self { root }),
            other => Err(EngineError::InvalidDeclaration(format!(
                "variables must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_value(serde_json::from_str(&text)?)
    }

    /// Look up a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = self.root.get(segments.next()?)?;
        segments.try_fold(first, |value, segment| value.get(segment))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Look up a dotted path that must hold a string.
    pub fn get_str(&self, path: &str) -> Result<&str, EngineError> {
        self.get(path)
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::UnresolvedVariable(path.to_owned()))
    }

    /// Render a variable as text: strings verbatim, anything else as JSON.
    pub fn render(&self, path: &str) -> Result<String, EngineError> {
        match self.get(path) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Null) | None => Err(EngineError::UnresolvedVariable(path.to_owned())),
            Some(other) => Ok(other.to_string()),
        }
    }
}
