use super::{check_access, check_run_access, page_size_arg, str_arg};
use crate::platform::{rbac, Caller, ListOptions, NewRun, PipelinePlatform, Run, RunFilter};
use crate::tools::{Tool, ToolArgs, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Cap applied to `get_run_logs` output so a noisy run cannot blow out the
/// model context.
const RUN_LOG_CAP_BYTES: usize = 16 * 1024;

fn format_run_summary(run: &Run) -> serde_json::Value {
    json!({
        "id": run.id,
        "name": run.name,
        "state": run.state.as_str(),
        "namespace": run.namespace,
        "experiment_id": run.experiment_id,
        "created_at": run.created_at,
        "finished_at": run.finished_at,
    })
}

// ---------------------------------------------------------------------------
// list_runs
// ---------------------------------------------------------------------------

pub struct ListRunsTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl ListRunsTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for ListRunsTool {
    fn name(&self) -> &str {
        "list_runs"
    }

    fn description(&self) -> &str {
        "List pipeline runs with optional filtering by namespace or experiment. Returns run IDs, names, statuses, and timestamps."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "namespace": {
                    "type": "string",
                    "description": "Filter runs by namespace"
                },
                "experiment_id": {
                    "type": "string",
                    "description": "Filter runs by experiment ID"
                },
                "page_size": {
                    "type": "integer",
                    "description": "Maximum number of runs to return (default 10)"
                }
            }
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let mut filter = RunFilter::default();
        if let Some(ns) = str_arg(args, "namespace") {
            if let Err(e) = check_access(
                self.platform.as_ref(),
                caller,
                ns,
                rbac::VERB_LIST,
                rbac::RESOURCE_RUNS,
            )
            .await
            {
                return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
            }
            filter.namespace = Some(ns.to_string());
        }
        if let Some(exp) = str_arg(args, "experiment_id") {
            if let Err(e) = super::check_experiment_access(
                self.platform.as_ref(),
                caller,
                exp,
                rbac::VERB_LIST,
            )
            .await
            {
                return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
            }
            filter.experiment_id = Some(exp.to_string());
        }

        let opts = ListOptions {
            page_size: page_size_arg(args),
        };
        let (runs, total) = match self.platform.list_runs(&filter, &opts).await {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error(format!("Failed to list runs: {}", e))),
        };

        let result = json!({
            "total_count": total,
            "runs": runs.iter().map(format_run_summary).collect::<Vec<_>>(),
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

// ---------------------------------------------------------------------------
// get_run
// ---------------------------------------------------------------------------

pub struct GetRunTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl GetRunTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for GetRunTool {
    fn name(&self) -> &str {
        "get_run"
    }

    fn description(&self) -> &str {
        "Get detailed information about a specific pipeline run by its ID, including status, parameters, and state history."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "run_id": {
                    "type": "string",
                    "description": "The ID of the run to retrieve"
                }
            },
            "required": ["run_id"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let Some(run_id) = str_arg(args, "run_id") else {
            return Ok(ToolResult::error("run_id is required"));
        };

        if let Err(e) =
            check_run_access(self.platform.as_ref(), caller, run_id, rbac::VERB_GET).await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        let run = match self.platform.get_run(run_id).await {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error(format!("Failed to get run: {}", e))),
        };

        let result = json!({
            "id": run.id,
            "name": run.name,
            "description": run.description,
            "state": run.state.as_str(),
            "namespace": run.namespace,
            "experiment_id": run.experiment_id,
            "pipeline_version_id": run.pipeline_version_id,
            "state_history": run.state_history,
            "created_at": run.created_at,
            "scheduled_at": run.scheduled_at,
            "finished_at": run.finished_at,
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

// ---------------------------------------------------------------------------
// get_run_logs
// ---------------------------------------------------------------------------

pub struct GetRunLogsTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl GetRunLogsTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for GetRunLogsTool {
    fn name(&self) -> &str {
        "get_run_logs"
    }

    fn description(&self) -> &str {
        "Fetch execution logs for a pipeline run. Useful when diagnosing failed runs."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "run_id": {
                    "type": "string",
                    "description": "The ID of the run whose logs to fetch"
                }
            },
            "required": ["run_id"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let Some(run_id) = str_arg(args, "run_id") else {
            return Ok(ToolResult::error("run_id is required"));
        };

        if let Err(e) =
            check_run_access(self.platform.as_ref(), caller, run_id, rbac::VERB_GET).await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        let mut logs = match self.platform.get_run_logs(run_id).await {
            Ok(l) => l,
            Err(e) => return Ok(ToolResult::error(format!("Failed to get run logs: {}", e))),
        };
        let mut truncated = false;
        if logs.len() > RUN_LOG_CAP_BYTES {
            // Keep the tail: failures show up at the end of the log.
            let cut = logs.len() - RUN_LOG_CAP_BYTES;
            let boundary = (cut..logs.len())
                .find(|i| logs.is_char_boundary(*i))
                .unwrap_or(logs.len());
            logs = logs.split_off(boundary);
            truncated = true;
        }

        let result = json!({
            "run_id": run_id,
            "logs": logs,
            "truncated": truncated,
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

// ---------------------------------------------------------------------------
// create_run
// ---------------------------------------------------------------------------

pub struct CreateRunTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl CreateRunTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for CreateRunTool {
    fn name(&self) -> &str {
        "create_run"
    }

    fn description(&self) -> &str {
        "Create and start a new pipeline run. Requires a pipeline version ID and experiment ID. This is a mutating operation that requires user confirmation in Agent mode."
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Display name for the run"
                },
                "description": {
                    "type": "string",
                    "description": "Description of the run"
                },
                "pipeline_version_id": {
                    "type": "string",
                    "description": "The pipeline version ID to run"
                },
                "experiment_id": {
                    "type": "string",
                    "description": "The experiment ID to associate with the run"
                },
                "namespace": {
                    "type": "string",
                    "description": "The namespace to create the run in"
                },
                "parameters": {
                    "type": "object",
                    "description": "Runtime parameters as key-value pairs"
                }
            },
            "required": ["name", "pipeline_version_id", "experiment_id"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let name = str_arg(args, "name");
        let pipeline_version_id = str_arg(args, "pipeline_version_id");
        let experiment_id = str_arg(args, "experiment_id");
        let (Some(name), Some(pipeline_version_id), Some(experiment_id)) =
            (name, pipeline_version_id, experiment_id)
        else {
            return Ok(ToolResult::error(
                "name, pipeline_version_id, and experiment_id are required",
            ));
        };
        let namespace = str_arg(args, "namespace").unwrap_or_default();

        if let Err(e) = check_access(
            self.platform.as_ref(),
            caller,
            namespace,
            rbac::VERB_CREATE,
            rbac::RESOURCE_RUNS,
        )
        .await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        let new_run = NewRun {
            name: name.to_string(),
            description: str_arg(args, "description").unwrap_or_default().to_string(),
            experiment_id: experiment_id.to_string(),
            namespace: namespace.to_string(),
            pipeline_version_id: pipeline_version_id.to_string(),
            parameters: args
                .get("parameters")
                .filter(|v| v.is_object())
                .cloned()
                .unwrap_or_else(|| json!({})),
        };

        let created = match self.platform.create_run(caller, new_run).await {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error(format!("Failed to create run: {}", e))),
        };

        let result = json!({
            "id": created.id,
            "name": created.name,
            "state": created.state.as_str(),
            "namespace": created.namespace,
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

// ---------------------------------------------------------------------------
// stop_run
// ---------------------------------------------------------------------------

pub struct StopRunTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl StopRunTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for StopRunTool {
    fn name(&self) -> &str {
        "stop_run"
    }

    fn description(&self) -> &str {
        "Stop/terminate a running pipeline run. This is a mutating operation that requires user confirmation in Agent mode."
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "run_id": {
                    "type": "string",
                    "description": "The ID of the run to stop"
                }
            },
            "required": ["run_id"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let Some(run_id) = str_arg(args, "run_id") else {
            return Ok(ToolResult::error("run_id is required"));
        };

        if let Err(e) =
            check_run_access(self.platform.as_ref(), caller, run_id, rbac::VERB_TERMINATE).await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        if let Err(e) = self.platform.terminate_run(caller, run_id).await {
            return Ok(ToolResult::error(format!("Failed to stop run: {}", e)));
        }

        let result = json!({
            "run_id": run_id,
            "message": "Run terminated successfully",
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

// ---------------------------------------------------------------------------
// delete_run
// ---------------------------------------------------------------------------

pub struct DeleteRunTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl DeleteRunTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for DeleteRunTool {
    fn name(&self) -> &str {
        "delete_run"
    }

    fn description(&self) -> &str {
        "Permanently delete a pipeline run. This is a destructive mutating operation that requires user confirmation in Agent mode."
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "run_id": {
                    "type": "string",
                    "description": "The ID of the run to delete"
                }
            },
            "required": ["run_id"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let Some(run_id) = str_arg(args, "run_id") else {
            return Ok(ToolResult::error("run_id is required"));
        };

        if let Err(e) =
            check_run_access(self.platform.as_ref(), caller, run_id, rbac::VERB_DELETE).await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        if let Err(e) = self.platform.delete_run(caller, run_id).await {
            return Ok(ToolResult::error(format!("Failed to delete run: {}", e)));
        }

        let result = json!({
            "run_id": run_id,
            "message": "Run deleted successfully",
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::InMemoryPlatform;
    use crate::platform::{RunState, StateTransition};

    fn seeded_platform() -> Arc<InMemoryPlatform> {
        let platform = Arc::new(InMemoryPlatform::single_user());
        platform.seed_run(crate::platform::Run {
            id: "r1".to_string(),
            name: "train-model".to_string(),
            description: String::new(),
            state: RunState::Failed,
            namespace: "team-a".to_string(),
            experiment_id: "e1".to_string(),
            pipeline_version_id: "v1".to_string(),
            state_history: vec![StateTransition {
                state: RunState::Failed,
                transitioned_at: 100,
            }],
            created_at: 100,
            scheduled_at: 100,
            finished_at: 110,
        });
        platform
    }

    fn args(value: serde_json::Value) -> ToolArgs {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn get_run_requires_run_id() {
        let tool = GetRunTool::new(seeded_platform());
        let result = tool
            .execute(&Caller::default(), &ToolArgs::new())
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("run_id is required"));
    }

    #[tokio::test]
    async fn get_run_serializes_state() {
        let tool = GetRunTool::new(seeded_platform());
        let result = tool
            .execute(&Caller::default(), &args(serde_json::json!({"run_id": "r1"})))
            .await
            .unwrap();
        assert!(!result.is_error);
        let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["state"], "FAILED");
        assert_eq!(parsed["state_history"][0]["state"], "FAILED");
    }

    #[tokio::test]
    async fn list_runs_reports_total_count() {
        let tool = ListRunsTool::new(seeded_platform());
        let result = tool
            .execute(&Caller::default(), &ToolArgs::new())
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["total_count"], 1);
        assert_eq!(parsed["runs"][0]["id"], "r1");
    }

    #[tokio::test]
    async fn get_run_logs_keeps_the_tail_when_truncating() {
        let platform = seeded_platform();
        let big = format!("{}END-OF-LOG", "x".repeat(RUN_LOG_CAP_BYTES + 100));
        platform.seed_run_logs("r1", &big);
        let tool = GetRunLogsTool::new(platform);
        let result = tool
            .execute(&Caller::default(), &args(serde_json::json!({"run_id": "r1"})))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["truncated"], true);
        assert!(parsed["logs"].as_str().unwrap().ends_with("END-OF-LOG"));
    }

    #[tokio::test]
    async fn delete_run_round_trip() {
        let platform = seeded_platform();
        let tool = DeleteRunTool::new(platform.clone());
        let result = tool
            .execute(&Caller::default(), &args(serde_json::json!({"run_id": "r1"})))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert!(platform.get_run("r1").await.is_err());

        // Second delete surfaces a tool-level error, not a panic or Err.
        let result = tool
            .execute(&Caller::default(), &args(serde_json::json!({"run_id": "r1"})))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn create_run_validates_required_fields() {
        let tool = CreateRunTool::new(seeded_platform());
        let result = tool
            .execute(
                &Caller::default(),
                &args(serde_json::json!({"name": "only-a-name"})),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("required"));
    }
}
