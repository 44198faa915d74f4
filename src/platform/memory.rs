use super::*;
use crate::config::AuthConfig;
use anyhow::{anyhow, bail};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

/// In-memory implementation of [`PipelinePlatform`].
///
/// Backs standalone/dev mode and the test suite. All stores live behind one
/// `RwLock`; contention is irrelevant at this scale.
pub struct InMemoryPlatform {
    auth: AuthConfig,
    inner: RwLock<Stores>,
}

#[derive(Default)]
struct Stores {
    runs: HashMap<String, Run>,
    run_logs: HashMap<String, String>,
    pipelines: HashMap<String, Pipeline>,
    versions: HashMap<String, PipelineVersion>,
    experiments: HashMap<String, Experiment>,
    /// Namespaces every caller is denied access to (test hook for RBAC paths).
    denied_namespaces: HashSet<String>,
    next_id: u64,
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl InMemoryPlatform {
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            auth,
            inner: RwLock::new(Stores::default()),
        }
    }

    pub fn single_user() -> Self {
        Self::new(AuthConfig::default())
    }

    fn next_id(stores: &mut Stores, prefix: &str) -> String {
        stores.next_id += 1;
        format!("{}-{:04}", prefix, stores.next_id)
    }

    // --- Seeding helpers (standalone mode + tests) ---

    pub fn seed_run(&self, run: Run) {
        let mut inner = self.inner.write().unwrap();
        inner.runs.insert(run.id.clone(), run);
    }

    pub fn seed_run_logs(&self, run_id: &str, logs: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.run_logs.insert(run_id.to_string(), logs.to_string());
    }

    pub fn seed_pipeline(&self, pipeline: Pipeline) {
        let mut inner = self.inner.write().unwrap();
        inner.pipelines.insert(pipeline.id.clone(), pipeline);
    }

    pub fn seed_pipeline_version(&self, version: PipelineVersion) {
        let mut inner = self.inner.write().unwrap();
        inner.versions.insert(version.id.clone(), version);
    }

    pub fn seed_experiment(&self, experiment: Experiment) {
        let mut inner = self.inner.write().unwrap();
        inner.experiments.insert(experiment.id.clone(), experiment);
    }

    pub fn deny_namespace(&self, namespace: &str) {
        let mut inner = self.inner.write().unwrap();
        inner.denied_namespaces.insert(namespace.to_string());
    }
}

#[async_trait]
impl PipelinePlatform for InMemoryPlatform {
    fn is_multi_user_mode(&self) -> bool {
        self.auth.multi_user
    }

    fn user_id_header(&self) -> &str {
        &self.auth.user_id_header
    }

    fn user_id_prefix(&self) -> &str {
        &self.auth.user_id_prefix
    }

    async fn get_run(&self, id: &str) -> Result<Run> {
        let inner = self.inner.read().unwrap();
        inner
            .runs
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("run {} not found", id))
    }

    async fn get_run_logs(&self, id: &str) -> Result<String> {
        let inner = self.inner.read().unwrap();
        if !inner.runs.contains_key(id) {
            bail!("run {} not found", id);
        }
        Ok(inner.run_logs.get(id).cloned().unwrap_or_default())
    }

    async fn list_runs(&self, filter: &RunFilter, opts: &ListOptions) -> Result<(Vec<Run>, usize)> {
        let inner = self.inner.read().unwrap();
        let mut matched: Vec<Run> = inner
            .runs
            .values()
            .filter(|r| {
                if let Some(exp) = &filter.experiment_id {
                    return &r.experiment_id == exp;
                }
                if let Some(ns) = &filter.namespace {
                    return &r.namespace == ns;
                }
                true
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        let total = matched.len();
        matched.truncate(opts.page_size);
        Ok((matched, total))
    }

    async fn get_pipeline(&self, id: &str) -> Result<Pipeline> {
        let inner = self.inner.read().unwrap();
        inner
            .pipelines
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("pipeline {} not found", id))
    }

    async fn list_pipelines(
        &self,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> Result<(Vec<Pipeline>, usize)> {
        let inner = self.inner.read().unwrap();
        let mut matched: Vec<Pipeline> = inner
            .pipelines
            .values()
            .filter(|p| namespace.map(|ns| p.namespace == ns).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        let total = matched.len();
        matched.truncate(opts.page_size);
        Ok((matched, total))
    }

    async fn get_pipeline_latest_template(&self, pipeline_id: &str) -> Result<String> {
        let inner = self.inner.read().unwrap();
        inner
            .versions
            .values()
            .filter(|v| v.pipeline_id == pipeline_id)
            .max_by_key(|v| v.created_at)
            .map(|v| v.spec.clone())
            .ok_or_else(|| anyhow!("pipeline {} has no versions", pipeline_id))
    }

    async fn get_pipeline_version_template(&self, version_id: &str) -> Result<String> {
        let inner = self.inner.read().unwrap();
        inner
            .versions
            .get(version_id)
            .map(|v| v.spec.clone())
            .ok_or_else(|| anyhow!("pipeline version {} not found", version_id))
    }

    async fn get_experiment(&self, id: &str) -> Result<Experiment> {
        let inner = self.inner.read().unwrap();
        inner
            .experiments
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow!("experiment {} not found", id))
    }

    async fn list_experiments(
        &self,
        namespace: Option<&str>,
        opts: &ListOptions,
    ) -> Result<(Vec<Experiment>, usize)> {
        let inner = self.inner.read().unwrap();
        let mut matched: Vec<Experiment> = inner
            .experiments
            .values()
            .filter(|e| namespace.map(|ns| e.namespace == ns).unwrap_or(true))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name));
        let total = matched.len();
        matched.truncate(opts.page_size);
        Ok((matched, total))
    }

    async fn create_run(&self, _caller: &Caller, run: NewRun) -> Result<Run> {
        let mut inner = self.inner.write().unwrap();
        if !inner.versions.contains_key(&run.pipeline_version_id) {
            bail!("pipeline version {} not found", run.pipeline_version_id);
        }
        if !inner.experiments.contains_key(&run.experiment_id) {
            bail!("experiment {} not found", run.experiment_id);
        }
        let id = Self::next_id(&mut inner, "run");
        let created = Run {
            id: id.clone(),
            name: run.name,
            description: run.description,
            state: RunState::Pending,
            namespace: run.namespace,
            experiment_id: run.experiment_id,
            pipeline_version_id: run.pipeline_version_id,
            state_history: vec![StateTransition {
                state: RunState::Pending,
                transitioned_at: now_ts(),
            }],
            created_at: now_ts(),
            scheduled_at: now_ts(),
            finished_at: 0,
        };
        inner.runs.insert(id, created.clone());
        Ok(created)
    }

    async fn create_experiment(&self, _caller: &Caller, exp: NewExperiment) -> Result<Experiment> {
        let mut inner = self.inner.write().unwrap();
        let id = Self::next_id(&mut inner, "exp");
        let created = Experiment {
            id: id.clone(),
            name: exp.name,
            description: exp.description,
            namespace: exp.namespace,
            created_at: now_ts(),
        };
        inner.experiments.insert(id, created.clone());
        Ok(created)
    }

    async fn create_pipeline_version(
        &self,
        _caller: &Caller,
        pv: NewPipelineVersion,
    ) -> Result<PipelineVersion> {
        let mut inner = self.inner.write().unwrap();
        if !inner.pipelines.contains_key(&pv.pipeline_id) {
            bail!("pipeline {} not found", pv.pipeline_id);
        }
        let id = Self::next_id(&mut inner, "pv");
        let created = PipelineVersion {
            id: id.clone(),
            pipeline_id: pv.pipeline_id,
            name: pv.name,
            description: pv.description,
            spec: pv.spec,
            created_at: now_ts(),
        };
        inner.versions.insert(id, created.clone());
        Ok(created)
    }

    async fn terminate_run(&self, _caller: &Caller, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let run = inner
            .runs
            .get_mut(id)
            .ok_or_else(|| anyhow!("run {} not found", id))?;
        match run.state {
            RunState::Pending | RunState::Running => {
                run.state = RunState::Canceled;
                run.finished_at = now_ts();
                run.state_history.push(StateTransition {
                    state: RunState::Canceled,
                    transitioned_at: now_ts(),
                });
                Ok(())
            }
            _ => bail!("run {} is not running (state: {})", id, run.state.as_str()),
        }
    }

    async fn delete_run(&self, _caller: &Caller, id: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.runs.remove(id).is_none() {
            bail!("run {} not found", id);
        }
        inner.run_logs.remove(id);
        Ok(())
    }

    async fn is_authorized(
        &self,
        caller: &Caller,
        namespace: &str,
        _verb: &str,
        _resource: &str,
    ) -> Result<()> {
        if !self.auth.multi_user {
            return Ok(());
        }
        let user = caller
            .user_id
            .as_deref()
            .ok_or_else(|| anyhow!("no caller identity"))?;
        let inner = self.inner.read().unwrap();
        if inner.denied_namespaces.contains(namespace) {
            bail!("user {} is not allowed to access namespace {}", user, namespace);
        }
        Ok(())
    }
}
