use super::{check_access, page_size_arg, str_arg};
use crate::platform::{rbac, Caller, ListOptions, NewExperiment, PipelinePlatform};
use crate::tools::{Tool, ToolArgs, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

pub struct ListExperimentsTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl ListExperimentsTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for ListExperimentsTool {
    fn name(&self) -> &str {
        "list_experiments"
    }

    fn description(&self) -> &str {
        "List experiments with optional filtering by namespace. Returns experiment IDs, names, and descriptions."
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
                    "description": "Filter experiments by namespace"
                },
                "page_size": {
                    "type": "integer",
                    "description": "Maximum number of experiments to return (default 10)"
                }
            }
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let namespace = str_arg(args, "namespace");
        if let Some(ns) = namespace {
            if let Err(e) = check_access(
                self.platform.as_ref(),
                caller,
                ns,
                rbac::VERB_LIST,
                rbac::RESOURCE_EXPERIMENTS,
            )
            .await
            {
                return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
            }
        }

        let opts = ListOptions {
            page_size: page_size_arg(args),
        };
        let (experiments, total) = match self.platform.list_experiments(namespace, &opts).await {
            Ok(r) => r,
            Err(e) => {
                return Ok(ToolResult::error(format!(
                    "Failed to list experiments: {}",
                    e
                )))
            }
        };

        let result = json!({
            "total_count": total,
            "experiments": experiments
                .iter()
                .map(|e| json!({
                    "id": e.id,
                    "name": e.name,
                    "description": e.description,
                    "namespace": e.namespace,
                    "created_at": e.created_at,
                }))
                .collect::<Vec<_>>(),
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

pub struct CreateExperimentTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl CreateExperimentTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for CreateExperimentTool {
    fn name(&self) -> &str {
        "create_experiment"
    }

    fn description(&self) -> &str {
        "Create a new experiment to organize pipeline runs. This is a mutating operation that requires user confirmation in Agent mode."
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
                    "description": "Display name for the experiment"
                },
                "description": {
                    "type": "string",
                    "description": "Description of the experiment"
                },
                "namespace": {
                    "type": "string",
                    "description": "The namespace to create the experiment in"
                }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let Some(name) = str_arg(args, "name") else {
            return Ok(ToolResult::error("name is required"));
        };
        let namespace = str_arg(args, "namespace").unwrap_or_default();

        if let Err(e) = check_access(
            self.platform.as_ref(),
            caller,
            namespace,
            rbac::VERB_CREATE,
            rbac::RESOURCE_EXPERIMENTS,
        )
        .await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        let new_experiment = NewExperiment {
            name: name.to_string(),
            description: str_arg(args, "description").unwrap_or_default().to_string(),
            namespace: namespace.to_string(),
        };

        let created = match self.platform.create_experiment(caller, new_experiment).await {
            Ok(e) => e,
            Err(e) => {
                return Ok(ToolResult::error(format!(
                    "Failed to create experiment: {}",
                    e
                )))
            }
        };

        let result = json!({
            "id": created.id,
            "name": created.name,
            "namespace": created.namespace,
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::platform::memory::InMemoryPlatform;

    fn args(value: serde_json::Value) -> ToolArgs {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn create_then_list_round_trip() {
        let platform = Arc::new(InMemoryPlatform::single_user());
        let create = CreateExperimentTool::new(platform.clone());
        let list = ListExperimentsTool::new(platform);

        let result = create
            .execute(
                &Caller::default(),
                &args(serde_json::json!({"name": "tuning", "namespace": "team-a"})),
            )
            .await
            .unwrap();
        assert!(!result.is_error);

        let result = list
            .execute(&Caller::default(), &ToolArgs::new())
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["total_count"], 1);
        assert_eq!(parsed["experiments"][0]["name"], "tuning");
    }

    #[tokio::test]
    async fn create_denied_in_foreign_namespace() {
        let platform = Arc::new(InMemoryPlatform::new(AuthConfig {
            multi_user: true,
            ..AuthConfig::default()
        }));
        platform.deny_namespace("team-b");
        let tool = CreateExperimentTool::new(platform);

        let result = tool
            .execute(
                &Caller::from_user_id("alice"),
                &args(serde_json::json!({"name": "x", "namespace": "team-b"})),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("Authorization failed"));
    }
}
