mod experiments;
mod pipelines;
mod runs;

pub use experiments::{CreateExperimentTool, ListExperimentsTool};
pub use pipelines::{
    CreatePipelineVersionTool, GetPipelineSpecTool, GetPipelineTool, ListPipelinesTool,
};
pub use runs::{
    CreateRunTool, DeleteRunTool, GetRunLogsTool, GetRunTool, ListRunsTool, StopRunTool,
};

use crate::platform::{rbac, Caller, PipelinePlatform};
use crate::tools::{ToolArgs, ToolRegistry};
use anyhow::{bail, Result};
use std::sync::Arc;

/// Register every built-in tool with the registry.
pub fn register_all(registry: &ToolRegistry, platform: Arc<dyn PipelinePlatform>) {
    // Read-only tools
    registry.register(Arc::new(ListRunsTool::new(platform.clone())));
    registry.register(Arc::new(GetRunTool::new(platform.clone())));
    registry.register(Arc::new(GetRunLogsTool::new(platform.clone())));
    registry.register(Arc::new(ListPipelinesTool::new(platform.clone())));
    registry.register(Arc::new(GetPipelineTool::new(platform.clone())));
    registry.register(Arc::new(GetPipelineSpecTool::new(platform.clone())));
    registry.register(Arc::new(ListExperimentsTool::new(platform.clone())));

    // Mutating tools
    registry.register(Arc::new(CreateRunTool::new(platform.clone())));
    registry.register(Arc::new(CreateExperimentTool::new(platform.clone())));
    registry.register(Arc::new(CreatePipelineVersionTool::new(platform.clone())));
    registry.register(Arc::new(StopRunTool::new(platform.clone())));
    registry.register(Arc::new(DeleteRunTool::new(platform)));
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

pub(crate) fn str_arg<'a>(args: &'a ToolArgs, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str()).filter(|s| !s.is_empty())
}

pub(crate) fn page_size_arg(args: &ToolArgs) -> usize {
    args.get("page_size")
        .and_then(|v| v.as_u64())
        .filter(|&v| v > 0)
        .map(|v| v as usize)
        .unwrap_or(10)
}

// ---------------------------------------------------------------------------
// RBAC helpers. No-ops in single-tenant mode.
// ---------------------------------------------------------------------------

pub(crate) async fn check_access(
    platform: &dyn PipelinePlatform,
    caller: &Caller,
    namespace: &str,
    verb: &str,
    resource: &str,
) -> Result<()> {
    if !platform.is_multi_user_mode() {
        return Ok(());
    }
    if namespace.is_empty() {
        bail!("namespace is required in multi-user mode");
    }
    platform.is_authorized(caller, namespace, verb, resource).await
}

/// Authorize against a run, resolving its namespace (falling back to the
/// owning experiment's namespace when the run carries none).
pub(crate) async fn check_run_access(
    platform: &dyn PipelinePlatform,
    caller: &Caller,
    run_id: &str,
    verb: &str,
) -> Result<()> {
    if !platform.is_multi_user_mode() {
        return Ok(());
    }
    let run = platform
        .get_run(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("failed to get run for authorization: {}", e))?;
    let namespace = if platform.is_empty_namespace(&run.namespace) {
        let experiment = platform
            .get_experiment(&run.experiment_id)
            .await
            .map_err(|e| anyhow::anyhow!("failed to get experiment for authorization: {}", e))?;
        experiment.namespace
    } else {
        run.namespace
    };
    check_access(platform, caller, &namespace, verb, rbac::RESOURCE_RUNS).await
}

pub(crate) async fn check_pipeline_access(
    platform: &dyn PipelinePlatform,
    caller: &Caller,
    pipeline_id: &str,
    verb: &str,
) -> Result<()> {
    if !platform.is_multi_user_mode() {
        return Ok(());
    }
    let pipeline = platform
        .get_pipeline(pipeline_id)
        .await
        .map_err(|e| anyhow::anyhow!("failed to get pipeline for authorization: {}", e))?;
    check_access(
        platform,
        caller,
        &pipeline.namespace,
        verb,
        rbac::RESOURCE_PIPELINES,
    )
    .await
}

pub(crate) async fn check_experiment_access(
    platform: &dyn PipelinePlatform,
    caller: &Caller,
    experiment_id: &str,
    verb: &str,
) -> Result<()> {
    if !platform.is_multi_user_mode() {
        return Ok(());
    }
    let experiment = platform
        .get_experiment(experiment_id)
        .await
        .map_err(|e| anyhow::anyhow!("failed to get experiment for authorization: {}", e))?;
    check_access(
        platform,
        caller,
        &experiment.namespace,
        verb,
        rbac::RESOURCE_EXPERIMENTS,
    )
    .await
}
