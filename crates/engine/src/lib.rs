//! `engine` crate: pipeline declarations, construction, templating and the runner.

pub mod error;
pub mod variables;
pub mod template;
pub mod models;
pub mod dag;
pub mod lint;
pub mod config;
pub mod runner;

pub use error::EngineError;
pub use variables::Variables;
pub use template::{RenderContext, Template};
pub use models::{Edge, PipelineDeclaration, PipelineSpec, TaskDescriptor, TaskKind};
pub use dag::build_pipeline;
pub use lint::{lint, Finding};
pub use config::RunnerConfig;
pub use runner::{HandlerRegistry, PipelineRunner, RunReport, TaskReport};
