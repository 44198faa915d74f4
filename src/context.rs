use crate::platform::{rbac, Caller, PipelinePlatform};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

const SYSTEM_PROMPT_BASE: &str = "You are an AI assistant embedded in an ML pipeline platform. You help users understand, manage, and troubleshoot their ML pipelines.

Your capabilities include:
- Viewing and analyzing pipeline runs, their statuses, and logs
- Browsing pipeline definitions and specifications
- Listing and managing experiments
- Creating runs, experiments, and pipeline versions (in Agent mode with user confirmation)
- Analyzing failures and suggesting fixes
- Generating documentation for pipelines

Guidelines:
- Be concise and specific in your responses
- When analyzing failures, look at run details, task states, and error messages
- When suggesting fixes, provide actionable steps
- Reference specific run IDs, pipeline IDs, and other identifiers when relevant
- Format responses with markdown for readability
- Use tools to gather information before making conclusions";

/// Where the user currently is in the UI, sent along with the chat request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageContext {
    #[serde(default)]
    pub page_type: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub pipeline_id: String,
    #[serde(default)]
    pub pipeline_version_id: String,
    #[serde(default)]
    pub experiment_id: String,
    #[serde(default)]
    pub namespace: String,
}

/// Assembles the system prompt from the base prompt, the current page
/// context, and the enabled rules.
#[derive(Clone)]
pub struct ContextBuilder {
    platform: Arc<dyn PipelinePlatform>,
}

impl ContextBuilder {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }

    pub async fn build_system_prompt(
        &self,
        caller: &Caller,
        page_context: Option<&PageContext>,
        rules_content: &str,
    ) -> String {
        let mut parts = vec![SYSTEM_PROMPT_BASE.to_string()];

        if let Some(page) = page_context {
            let page_section = self.gather_page_context(caller, page).await;
            if !page_section.is_empty() {
                parts.push(format!("\n## Current Page Context\n{}", page_section));
            }
        }

        if !rules_content.is_empty() {
            parts.push(format!("\n## Custom Rules\n{}", rules_content));
        }

        parts.join("\n")
    }

    /// Fetch page-specific platform data. RBAC-guarded in multi-user mode:
    /// on denial or fetch failure only a generic one-liner with the id is
    /// produced, never the resource contents.
    async fn gather_page_context(&self, caller: &Caller, page: &PageContext) -> String {
        match page.page_type.as_str() {
            "run_details" => self.gather_run_context(caller, &page.run_id).await,
            "pipeline_details" => self.gather_pipeline_context(caller, &page.pipeline_id).await,
            "run_list" => {
                let mut section = "The user is viewing a list of pipeline runs.".to_string();
                if !page.namespace.is_empty() {
                    section.push_str(&format!("\n- Namespace: {}", page.namespace));
                }
                if !page.experiment_id.is_empty() {
                    section.push_str(&format!("\n- Experiment ID: {}", page.experiment_id));
                }
                section
            }
            "pipeline_list" => {
                let mut section = "The user is viewing a list of pipelines.".to_string();
                if !page.namespace.is_empty() {
                    section.push_str(&format!("\n- Namespace: {}", page.namespace));
                }
                section
            }
            "" => String::new(),
            other => format!("The user is on a {} page.", other),
        }
    }

    async fn gather_run_context(&self, caller: &Caller, run_id: &str) -> String {
        if run_id.is_empty() {
            return "The user is viewing run details but no run ID is available.".to_string();
        }

        if let Err(e) = self.check_run_access(caller, run_id).await {
            warn!("run context access denied for {}: {}", run_id, e);
            return format!("The user is viewing run {}.", run_id);
        }

        let run = match self.platform.get_run(run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!("failed to fetch run context for {}: {}", run_id, e);
                return format!("The user is viewing run {}.", run_id);
            }
        };

        let mut section = format!(
            "The user is viewing run details:\n- Run ID: {}\n- Name: {}\n- State: {}",
            run.id,
            run.name,
            run.state.as_str()
        );
        if run.state == crate::platform::RunState::Failed {
            section.push_str(
                "\n- **This run has FAILED.** The user may want help debugging the failure.",
            );
            if !run.state_history.is_empty() {
                let history =
                    serde_json::to_string(&run.state_history).unwrap_or_else(|_| "[]".to_string());
                section.push_str(&format!("\n- State History: {}", history));
            }
        }
        section
    }

    async fn gather_pipeline_context(&self, caller: &Caller, pipeline_id: &str) -> String {
        if pipeline_id.is_empty() {
            return "The user is viewing pipeline details but no pipeline ID is available."
                .to_string();
        }

        if let Err(e) = self.check_pipeline_access(caller, pipeline_id).await {
            warn!("pipeline context access denied for {}: {}", pipeline_id, e);
            return format!("The user is viewing pipeline {}.", pipeline_id);
        }

        match self.platform.get_pipeline(pipeline_id).await {
            Ok(pipeline) => format!(
                "The user is viewing pipeline details:\n- Pipeline ID: {}\n- Name: {}\n- Description: {}",
                pipeline.id, pipeline.name, pipeline.description
            ),
            Err(e) => {
                warn!("failed to fetch pipeline context for {}: {}", pipeline_id, e);
                format!("The user is viewing pipeline {}.", pipeline_id)
            }
        }
    }

    async fn check_run_access(&self, caller: &Caller, run_id: &str) -> anyhow::Result<()> {
        if !self.platform.is_multi_user_mode() {
            return Ok(());
        }
        let run = self.platform.get_run(run_id).await?;
        let namespace = if self.platform.is_empty_namespace(&run.namespace) {
            self.platform
                .get_experiment(&run.experiment_id)
                .await?
                .namespace
        } else {
            run.namespace
        };
        self.platform
            .is_authorized(caller, &namespace, rbac::VERB_GET, rbac::RESOURCE_RUNS)
            .await
    }

    async fn check_pipeline_access(&self, caller: &Caller, pipeline_id: &str) -> anyhow::Result<()> {
        if !self.platform.is_multi_user_mode() {
            return Ok(());
        }
        let pipeline = self.platform.get_pipeline(pipeline_id).await?;
        self.platform
            .is_authorized(
                caller,
                &pipeline.namespace,
                rbac::VERB_GET,
                rbac::RESOURCE_PIPELINES,
            )
            .await
    }
}
