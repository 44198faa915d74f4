pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// RBAC vocabulary
// ---------------------------------------------------------------------------

pub mod rbac {
    pub const VERB_GET: &str = "get";
    pub const VERB_LIST: &str = "list";
    pub const VERB_CREATE: &str = "create";
    pub const VERB_DELETE: &str = "delete";
    pub const VERB_TERMINATE: &str = "terminate";

    pub const RESOURCE_RUNS: &str = "runs";
    pub const RESOURCE_PIPELINES: &str = "pipelines";
    pub const RESOURCE_EXPERIMENTS: &str = "experiments";
}

/// Identity of the caller on whose behalf a platform operation runs.
/// `user_id` is `None` in single-tenant deployments.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    pub user_id: Option<String>,
}

impl Caller {
    pub fn from_user_id(user_id: &str) -> Self {
        Self {
            user_id: if user_id.is_empty() {
                None
            } else {
                Some(user_id.to_string())
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Control-plane data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Running => "RUNNING",
            RunState::Succeeded => "SUCCEEDED",
            RunState::Failed => "FAILED",
            RunState::Canceled => "CANCELED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: RunState,
    pub transitioned_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub state: RunState,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub experiment_id: String,
    #[serde(default)]
    pub pipeline_version_id: String,
    #[serde(default)]
    pub state_history: Vec<StateTransition>,
    pub created_at: i64,
    #[serde(default)]
    pub scheduled_at: i64,
    #[serde(default)]
    pub finished_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub namespace: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineVersion {
    pub id: String,
    pub pipeline_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Serialized pipeline spec (the template the runtime executes).
    pub spec: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub namespace: String,
    pub created_at: i64,
}

/// Pagination knobs for list operations.
#[derive(Debug, Clone)]
pub struct ListOptions {
    pub page_size: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self { page_size: 10 }
    }
}

/// Server-side filter for run listings. Both fields optional; when both are
/// set the experiment filter wins (it is the narrower reference).
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub namespace: Option<String>,
    pub experiment_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub name: String,
    pub description: String,
    pub experiment_id: String,
    pub namespace: String,
    pub pipeline_version_id: String,
    /// Runtime parameters as a JSON object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct NewExperiment {
    pub name: String,
    pub description: String,
    pub namespace: String,
}

#[derive(Debug, Clone)]
pub struct NewPipelineVersion {
    pub pipeline_id: String,
    pub name: String,
    pub description: String,
    pub spec: String,
}

// ---------------------------------------------------------------------------
// Platform trait
// ---------------------------------------------------------------------------

/// Narrow surface of the pipeline resource manager the copilot core consumes.
///
/// Deployments embed the crate and provide their own implementation; the
/// bundled [`memory::InMemoryPlatform`] serves standalone mode and tests.
#[async_trait]
pub trait PipelinePlatform: Send + Sync {
    fn is_multi_user_mode(&self) -> bool;

    /// HTTP header carrying the authenticated user identity.
    fn user_id_header(&self) -> &str;

    /// Prefix stripped from the identity header value.
    fn user_id_prefix(&self) -> &str;

    fn is_empty_namespace(&self, namespace: &str) -> bool {
        namespace.trim().is_empty()
    }

    async fn get_run(&self, id: &str) -> Result<Run>;

    async fn get_run_logs(&self, id: &str) -> Result<String>;

    /// Returns the page of runs plus the total matching count.
    async fn list_runs(&self, filter: &RunFilter, opts: &ListOptions) -> Result<(Vec<Run>, usize)>;

    async fn get_pipeline(&self, id: &str) -> Result<Pipeline>;

    async fn list_pipelines(
        &self,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> Result<(Vec<Pipeline>, usize)>;

    async fn get_pipeline_latest_template(&self, pipeline_id: &str) -> Result<String>;

    async fn get_pipeline_version_template(&self, version_id: &str) -> Result<String>;

    async fn get_experiment(&self, id: &str) -> Result<Experiment>;

    async fn list_experiments(
        &self,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> Result<(Vec<Experiment>, usize)>;

    async fn create_run(&self, caller: &Caller, run: NewRun) -> Result<Run>;

    async fn create_experiment(&self, caller: &Caller, exp: NewExperiment) -> Result<Experiment>;

    async fn create_pipeline_version(
        &self,
        caller: &Caller,
        pv: NewPipelineVersion,
    ) -> Result<PipelineVersion>;

    async fn terminate_run(&self, caller: &Caller, id: &str) -> Result<()>;

    async fn delete_run(&self, caller: &Caller, id: &str) -> Result<()>;

    /// RBAC check. `Ok(())` means allowed; any error is treated as a denial.
    async fn is_authorized(
        &self,
        caller: &Caller,
        namespace: &str,
        verb: &str,
        resource: &str,
    ) -> Result<()>;
}
