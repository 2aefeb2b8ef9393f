//! `ContainerHandler`: runs a transform image through a container runtime CLI.
//!
//! Lifecycle for one dispatch:
//! - check the environment contract of the transform image
//! - `create` + `start` the container, bounded by the startup timeout
//! - `wait` for it to exit (killing it if the run is cancelled)
//! - collect the log tail on failure
//! - remove the container, whichever way the dispatch ended
//!
//! `podman` and `docker` accept the same sub-commands used here.

use std::collections::BTreeMap;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::operation::{ContainerJob, PullPolicy};
use crate::shell::{tail, OUTPUT_TAIL_LINES};
use crate::traits::{unexpected_operation, ExecutionContext};
use crate::{NodeError, Operation, TaskHandler};

/// Env vars every transform container must receive.
pub const REQUIRED_ENV: [&str; 3] = ["TARGET_FILE", "TARGET_GCS_BUCKET", "TARGET_GCS_PATH"];

// ---------------------------------------------------------------------------
// Environment contract
// ---------------------------------------------------------------------------

/// Check the transform image's input contract.
///
/// The source is either `SOURCE_URL` or the `SOURCE_GCS_BUCKET` +
/// `SOURCE_GCS_OBJECT` pair; `CSV_HEADERS` must be a JSON array of strings and
/// `RENAME_MAPPINGS` a JSON object of strings when present.
pub fn validate_contract(env: &BTreeMap<String, String>) -> Result<(), NodeError> {
    let has_url = env.contains_key("SOURCE_URL");
    let has_gcs = env.contains_key("SOURCE_GCS_BUCKET") && env.contains_key("SOURCE_GCS_OBJECT");
    if !has_url && !has_gcs {
        return Err(NodeError::InvalidContract(
            "either SOURCE_URL or SOURCE_GCS_BUCKET and SOURCE_GCS_OBJECT must be set".into(),
        ));
    }

    if let Some(missing) = REQUIRED_ENV.iter().find(|key| !env.contains_key(**key)) {
        return Err(NodeError::InvalidContract(format!("{missing} must be set")));
    }

    csv_headers(env)?;

    if let Some(raw) = env.get("RENAME_MAPPINGS") {
        serde_json::from_str::<BTreeMap<String, String>>(raw).map_err(|e| {
            NodeError::InvalidContract(format!(
                "RENAME_MAPPINGS is not a JSON object of strings: {e}"
            ))
        })?;
    }

    Ok(())
}

/// Output column names declared through `CSV_HEADERS`, if any.
pub fn csv_headers(env: &BTreeMap<String, String>) -> Result<Option<Vec<String>>, NodeError> {
    env.get("CSV_HEADERS")
        .map(|raw| {
            serde_json::from_str::<Vec<String>>(raw).map_err(|e| {
                NodeError::InvalidContract(format!(
                    "CSV_HEADERS is not a JSON array of strings: {e}"
                ))
            })
        })
        .transpose()
}

// ---------------------------------------------------------------------------
// ContainerHandler
// ---------------------------------------------------------------------------

pub struct ContainerHandler {
    runtime: String,
}

impl ContainerHandler {
    /// `runtime` is the CLI binary, e.g. `podman` or `docker`.
    pub fn new(runtime: impl Into<String>) -> Self {
        Self { runtime: runtime.into() }
    }

    async fn cli(&self, args: &[String]) -> Result<Output, NodeError> {
        Command::new(&self.runtime)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| NodeError::Fatal(format!("failed to execute '{}': {e}", self.runtime)))
    }

    /// Run a CLI command that must succeed; failures are retryable.
    async fn cli_ok(&self, args: &[String]) -> Result<String, NodeError> {
        let output = self.cli(args).await?;
        if !output.status.success() {
            return Err(NodeError::Retryable(format!(
                "{} {} failed: {}",
                self.runtime,
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn create_and_start(&self, name: &str, job: &ContainerJob) -> Result<(), NodeError> {
        self.cli_ok(&create_args(name, job)).await?;
        self.cli_ok(&["start".to_string(), name.to_string()]).await?;
        Ok(())
    }

    /// Start the container and wait for a zero exit.
    async fn run_container(
        &self,
        name: &str,
        job: &ContainerJob,
        ctx: &ExecutionContext,
    ) -> Result<(), NodeError> {
        let startup = tokio::time::timeout(job.startup_timeout, self.create_and_start(name, job));
        let started = tokio::select! {
            started = startup => started,
            _ = ctx.cancel.cancelled() => return Err(NodeError::Cancelled),
        };
        match started {
            Ok(result) => result?,
            Err(_) => {
                return Err(NodeError::PodStartupTimeout {
                    container: name.to_string(),
                    timeout: job.startup_timeout,
                })
            }
        }

        let wait_args = ["wait".to_string(), name.to_string()];
        let waited = tokio::select! {
            waited = self.cli_ok(&wait_args) => waited?,
            _ = ctx.cancel.cancelled() => {
                warn!("run cancelled, killing container {}", name);
                let _ = self.cli(&["kill".to_string(), name.to_string()]).await;
                return Err(NodeError::Cancelled);
            }
        };

        let code: i64 = waited
            .lines()
            .last()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| NodeError::Retryable(format!("unexpected wait output: '{waited}'")))?;

        if code != 0 {
            let logs = self
                .cli(&[
                    "logs".to_string(),
                    "--tail".to_string(),
                    OUTPUT_TAIL_LINES.to_string(),
                    name.to_string(),
                ])
                .await
                .map(|o| {
                    let mut text = String::from_utf8_lossy(&o.stdout).into_owned();
                    text.push_str(&String::from_utf8_lossy(&o.stderr));
                    tail(&text, OUTPUT_TAIL_LINES)
                })
                .unwrap_or_default();
            return Err(NodeError::ContainerNonZeroExit {
                container: name.to_string(),
                code,
                logs,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for ContainerHandler {
    #[instrument(skip_all, fields(task_id = %ctx.task_id))]
    async fn execute(
        &self,
        operation: &Operation,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let Operation::ContainerJob(job) = operation else {
            return Err(unexpected_operation("container", operation));
        };

        validate_contract(&job.env_vars)?;

        if let Some(storage) = &job.resources.request_ephemeral_storage {
            debug!("ephemeral storage request {storage} is advisory and not enforced");
        }

        let name = container_name(&job.name, ctx.run_id);
        let mut container = RemoveOnDrop::new(&self.runtime, &name);

        info!("starting container {} from {}", name, job.image);
        let outcome = self.run_container(&name, job, ctx).await;
        container.remove().await;
        outcome?;

        info!("container {} completed", name);
        Ok(json!({
            "container": name,
            "image": job.image,
            "exit_code": 0,
            "target": format!(
                "{}/{}",
                job.env_vars.get("TARGET_GCS_BUCKET").map(String::as_str).unwrap_or_default(),
                job.env_vars.get("TARGET_GCS_PATH").map(String::as_str).unwrap_or_default()
            ),
        }))
    }
}

/// Arguments for `<runtime> create`.
pub fn create_args(name: &str, job: &ContainerJob) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), name.to_string()];

    let pull = match job.image_pull_policy {
        PullPolicy::Always => "always",
        PullPolicy::IfNotPresent => "missing",
        PullPolicy::Never => "never",
    };
    args.push(format!("--pull={pull}"));

    if let Some(memory) = job.resources.memory() {
        args.push("--memory".to_string());
        args.push(memory.trim_end_matches('i').to_lowercase());
    }
    if let Some(cpus) = job.resources.cpus() {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }

    for (key, value) in &job.env_vars {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push(job.image.clone());
    args
}

/// Unique, runtime-safe container name for one dispatch.
fn container_name(job_name: &str, run_id: uuid::Uuid) -> String {
    let base: String = job_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{base}-{}-{}", &run_id.simple().to_string()[..8], &suffix[..8])
}

/// Force-removes the container.
///
/// The handler removes it explicitly once the dispatch ends; if the dispatch
/// future is dropped first, removal is spawned onto the runtime instead.
struct RemoveOnDrop {
    runtime: String,
    name: String,
    armed: bool,
}

impl RemoveOnDrop {
    fn new(runtime: &str, name: &str) -> Self {
        Self {
            runtime: runtime.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    async fn remove(&mut self) {
        self.armed = false;
        remove_container(&self.runtime, &self.name).await;
    }
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (runtime, name) = (std::mem::take(&mut self.runtime), std::mem::take(&mut self.name));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove_container(&runtime, &name).await });
            }
            Err(_) => warn!("container {} left behind: no runtime to remove it on", name),
        }
    }
}

async fn remove_container(runtime: &str, name: &str) {
    let removed = Command::new(runtime)
        .args(["rm", "-f", name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match removed {
        Ok(status) if status.success() => debug!("container {} removed", name),
        Ok(status) => debug!("container {} not removed ({status})", name),
        Err(e) => warn!("failed to remove container {}: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::operation::ResourceHints;

    fn env(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn committee_env() -> BTreeMap<String, String> {
        env(&[
            ("SOURCE_URL", "https://www.fec.gov/files/bulk-downloads/2020/cm20.zip"),
            ("SOURCE_FILE", "files/cm.txt"),
            ("TARGET_FILE", "files/data_output.csv"),
            ("TARGET_GCS_BUCKET", "composer"),
            ("TARGET_GCS_PATH", "data/fec/committee_2020/data_output.csv"),
            ("PIPELINE_NAME", "committee_2020"),
            ("CSV_HEADERS", r#"["cmte_id","cmte_nm"]"#),
            ("RENAME_MAPPINGS", r#"{"0":"cmte_id","1":"cmte_nm"}"#),
        ])
    }

    #[test]
    fn accepts_url_or_bucket_sources() {
        assert!(validate_contract(&committee_env()).is_ok());

        let mut gcs = committee_env();
        gcs.remove("SOURCE_URL");
        gcs.insert("SOURCE_GCS_BUCKET".into(), "composer".into());
        gcs.insert("SOURCE_GCS_OBJECT".into(), "data/fec/individuals/F1.txt".into());
        assert!(validate_contract(&gcs).is_ok());
    }

    #[test]
    fn rejects_missing_source_or_target() {
        let mut no_source = committee_env();
        no_source.remove("SOURCE_URL");
        no_source.insert("SOURCE_GCS_BUCKET".into(), "composer".into());
        assert!(matches!(validate_contract(&no_source), Err(NodeError::InvalidContract(_))));

        let mut no_target = committee_env();
        no_target.remove("TARGET_GCS_PATH");
        assert!(matches!(
            validate_contract(&no_target),
            Err(NodeError::InvalidContract(msg)) if msg.contains("TARGET_GCS_PATH")
        ));
    }

    #[test]
    fn rejects_malformed_json_literals() {
        let mut bad_headers = committee_env();
        bad_headers.insert("CSV_HEADERS".into(), "cmte_id,cmte_nm".into());
        assert!(validate_contract(&bad_headers).is_err());

        let mut bad_mappings = committee_env();
        bad_mappings.insert("RENAME_MAPPINGS".into(), r#"["cmte_id"]"#.into());
        assert!(validate_contract(&bad_mappings).is_err());
    }

    #[test]
    fn headers_are_exposed_in_order() {
        assert_eq!(
            csv_headers(&committee_env()).unwrap(),
            Some(vec!["cmte_id".to_string(), "cmte_nm".to_string()])
        );
    }

    #[test]
    fn create_args_carry_env_and_resources() {
        let job = ContainerJob {
            name: "committee_2020".into(),
            image: "gcr.io/project/run_csv_transform_kub:latest".into(),
            env_vars: env(&[("PIPELINE_NAME", "committee_2020")]),
            resources: ResourceHints {
                request_memory: Some("3G".into()),
                request_cpu: Some("1".into()),
                request_ephemeral_storage: Some("5G".into()),
                ..Default::default()
            },
            startup_timeout: Duration::from_secs(600),
            image_pull_policy: PullPolicy::Always,
        };

        let args = create_args("c1", &job);
        assert_eq!(
            args,
            vec![
                "create", "--name", "c1", "--pull=always", "--memory", "3g", "--cpus", "1",
                "-e", "PIPELINE_NAME=committee_2020",
                "gcr.io/project/run_csv_transform_kub:latest",
            ]
        );
    }

    #[test]
    fn container_names_are_sanitised_and_unique() {
        let run = uuid::Uuid::new_v4();
        let a = container_name("race_and.economic opportunity", run);
        let b = container_name("race_and.economic opportunity", run);
        assert!(a.starts_with("race_and-economic-opportunity-"));
        assert_ne!(a, b);
    }

    /// Container lifecycle against a stand-in runtime script that logs each
    /// sub-command it receives.
    #[cfg(unix)]
    mod lifecycle {
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        use super::*;

        fn runtime(dir: &Path, start: &str, wait: &str) -> ContainerHandler {
            let script = dir.join("runtime.sh");
            let log = dir.join("calls.log");
            let body = [
                "#!/bin/sh".to_string(),
                format!("echo \"$1\" >> '{}'", log.display()),
                "case \"$1\" in".to_string(),
                format!("  start) {start} ;;"),
                format!("  wait) {wait} ;;"),
                "  logs) echo boom-log ;;".to_string(),
                "esac".to_string(),
            ]
            .join("\n");
            std::fs::write(&script, body).unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            ContainerHandler::new(script.display().to_string())
        }

        fn calls(dir: &Path) -> Vec<String> {
            std::fs::read_to_string(dir.join("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(String::from)
                .collect()
        }

        fn job(startup_timeout: Duration) -> Operation {
            Operation::ContainerJob(ContainerJob {
                name: "committee_2020".into(),
                image: "run_csv_transform_kub:latest".into(),
                env_vars: committee_env(),
                resources: ResourceHints::default(),
                startup_timeout,
                image_pull_policy: PullPolicy::IfNotPresent,
            })
        }

        fn ctx(dir: &Path) -> ExecutionContext {
            ExecutionContext {
                pipeline: "fec.committee_2020".into(),
                run_id: uuid::Uuid::new_v4(),
                task_id: "committee_2020_transform_csv".into(),
                logical_date: chrono::NaiveDate::from_ymd_opt(2021, 3, 1).unwrap(),
                work_dir: dir.to_path_buf(),
                cancel: Default::default(),
            }
        }

        #[tokio::test]
        async fn zero_exit_reports_target_and_removes_container() {
            let tmp = tempfile::tempdir().unwrap();
            let handler = runtime(tmp.path(), "true", "echo pulling; echo 0");

            let out = handler
                .execute(&job(Duration::from_secs(10)), &ctx(tmp.path()))
                .await
                .unwrap();

            assert_eq!(out["exit_code"], 0);
            assert_eq!(out["target"], "composer/data/fec/committee_2020/data_output.csv");
            assert_eq!(calls(tmp.path()), ["create", "start", "wait", "rm"]);
        }

        #[tokio::test]
        async fn non_zero_exit_carries_log_tail() {
            let tmp = tempfile::tempdir().unwrap();
            let handler = runtime(tmp.path(), "true", "echo 3");

            let err = handler
                .execute(&job(Duration::from_secs(10)), &ctx(tmp.path()))
                .await
                .unwrap_err();

            let NodeError::ContainerNonZeroExit { code, logs, .. } = err else {
                panic!("expected a non-zero exit, got {err:?}");
            };
            assert_eq!(code, 3);
            assert!(logs.contains("boom-log"));
            assert_eq!(calls(tmp.path()), ["create", "start", "wait", "logs", "rm"]);
        }

        #[tokio::test]
        async fn slow_start_times_out() {
            let tmp = tempfile::tempdir().unwrap();
            let handler = runtime(tmp.path(), "exec sleep 5", "echo 0");

            let err = handler
                .execute(&job(Duration::from_millis(200)), &ctx(tmp.path()))
                .await
                .unwrap_err();

            assert!(matches!(err, NodeError::PodStartupTimeout { .. }));
            assert_eq!(calls(tmp.path()), ["create", "start", "rm"]);
        }

        #[tokio::test]
        async fn cancellation_kills_running_container() {
            let tmp = tempfile::tempdir().unwrap();
            let handler = runtime(tmp.path(), "true", "exec sleep 30");
            let ctx = ctx(tmp.path());
            let trigger = ctx.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                trigger.cancel();
            });

            let err = handler.execute(&job(Duration::from_secs(10)), &ctx).await.unwrap_err();

            assert!(matches!(err, NodeError::Cancelled));
            assert_eq!(calls(tmp.path()), ["create", "start", "wait", "kill", "rm"]);
        }

        #[tokio::test]
        async fn dropped_dispatch_still_removes_container() {
            let tmp = tempfile::tempdir().unwrap();
            let handler = runtime(tmp.path(), "true", "exec sleep 30");
            let ctx = ctx(tmp.path());

            let job = job(Duration::from_secs(10));
            let dispatch = handler.execute(&job, &ctx);
            assert!(tokio::time::timeout(Duration::from_millis(300), dispatch).await.is_err());

            tokio::time::timeout(Duration::from_secs(5), async {
                while !calls(tmp.path()).iter().any(|c| c == "rm") {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("container was not removed");
        }
    }
}
