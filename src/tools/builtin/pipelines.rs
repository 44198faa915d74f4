use super::{check_access, check_pipeline_access, page_size_arg, str_arg};
use crate::platform::{rbac, Caller, ListOptions, NewPipelineVersion, PipelinePlatform};
use crate::tools::{Tool, ToolArgs, ToolResult};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// list_pipelines
// ---------------------------------------------------------------------------

pub struct ListPipelinesTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl ListPipelinesTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for ListPipelinesTool {
    fn name(&self) -> &str {
        "list_pipelines"
    }

    fn description(&self) -> &str {
        "List registered pipelines with optional filtering by namespace. Returns pipeline IDs, names, and descriptions."
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
                    "description": "Filter pipelines by namespace"
                },
                "page_size": {
                    "type": "integer",
                    "description": "Maximum number of pipelines to return (default 10)"
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
                rbac::RESOURCE_PIPELINES,
            )
            .await
            {
                return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
            }
        }

        let opts = ListOptions {
            page_size: page_size_arg(args),
        };
        let (pipelines, total) = match self.platform.list_pipelines(namespace, &opts).await {
            Ok(r) => r,
            Err(e) => return Ok(ToolResult::error(format!("Failed to list pipelines: {}", e))),
        };

        let result = json!({
            "total_count": total,
            "pipelines": pipelines
                .iter()
                .map(|p| json!({
                    "id": p.id,
                    "name": p.name,
                    "description": p.description,
                    "namespace": p.namespace,
                    "created_at": p.created_at,
                }))
                .collect::<Vec<_>>(),
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

// ---------------------------------------------------------------------------
// get_pipeline
// ---------------------------------------------------------------------------

pub struct GetPipelineTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl GetPipelineTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for GetPipelineTool {
    fn name(&self) -> &str {
        "get_pipeline"
    }

    fn description(&self) -> &str {
        "Get metadata for a specific pipeline by its ID."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pipeline_id": {
                    "type": "string",
                    "description": "The ID of the pipeline to retrieve"
                }
            },
            "required": ["pipeline_id"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let Some(pipeline_id) = str_arg(args, "pipeline_id") else {
            return Ok(ToolResult::error("pipeline_id is required"));
        };

        if let Err(e) =
            check_pipeline_access(self.platform.as_ref(), caller, pipeline_id, rbac::VERB_GET)
                .await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        let pipeline = match self.platform.get_pipeline(pipeline_id).await {
            Ok(p) => p,
            Err(e) => return Ok(ToolResult::error(format!("Failed to get pipeline: {}", e))),
        };

        let result = json!({
            "id": pipeline.id,
            "name": pipeline.name,
            "description": pipeline.description,
            "namespace": pipeline.namespace,
            "created_at": pipeline.created_at,
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

// ---------------------------------------------------------------------------
// get_pipeline_spec
// ---------------------------------------------------------------------------

pub struct GetPipelineSpecTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl GetPipelineSpecTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for GetPipelineSpecTool {
    fn name(&self) -> &str {
        "get_pipeline_spec"
    }

    fn description(&self) -> &str {
        "Get the spec/template of a pipeline. Provide pipeline_version_id for a specific version, or pipeline_id for the latest version."
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pipeline_id": {
                    "type": "string",
                    "description": "The pipeline ID (latest version is used)"
                },
                "pipeline_version_id": {
                    "type": "string",
                    "description": "A specific pipeline version ID"
                }
            }
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let pipeline_id = str_arg(args, "pipeline_id");
        let version_id = str_arg(args, "pipeline_version_id");

        if let Some(pid) = pipeline_id {
            if let Err(e) =
                check_pipeline_access(self.platform.as_ref(), caller, pid, rbac::VERB_GET).await
            {
                return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
            }
        }

        let spec = match (version_id, pipeline_id) {
            (Some(vid), _) => self.platform.get_pipeline_version_template(vid).await,
            (None, Some(pid)) => self.platform.get_pipeline_latest_template(pid).await,
            (None, None) => {
                return Ok(ToolResult::error(
                    "pipeline_id or pipeline_version_id is required",
                ))
            }
        };

        match spec {
            Ok(spec) => Ok(ToolResult::ok(
                json!({ "pipeline_spec": spec }).to_string(),
            )),
            Err(e) => Ok(ToolResult::error(format!(
                "Failed to get pipeline spec: {}",
                e
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// create_pipeline_version
// ---------------------------------------------------------------------------

pub struct CreatePipelineVersionTool {
    platform: Arc<dyn PipelinePlatform>,
}

impl CreatePipelineVersionTool {
    pub fn new(platform: Arc<dyn PipelinePlatform>) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl Tool for CreatePipelineVersionTool {
    fn name(&self) -> &str {
        "create_pipeline_version"
    }

    fn description(&self) -> &str {
        "Register a new version of an existing pipeline from a serialized pipeline spec. This is a mutating operation that requires user confirmation in Agent mode."
    }

    fn is_read_only(&self) -> bool {
        false
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pipeline_id": {
                    "type": "string",
                    "description": "The pipeline to attach the version to"
                },
                "name": {
                    "type": "string",
                    "description": "Display name for the new version"
                },
                "description": {
                    "type": "string",
                    "description": "Description of the version"
                },
                "pipeline_spec": {
                    "type": "string",
                    "description": "The serialized pipeline spec"
                }
            },
            "required": ["pipeline_id", "name", "pipeline_spec"]
        })
    }

    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        let pipeline_id = str_arg(args, "pipeline_id");
        let name = str_arg(args, "name");
        let spec = str_arg(args, "pipeline_spec");
        let (Some(pipeline_id), Some(name), Some(spec)) = (pipeline_id, name, spec) else {
            return Ok(ToolResult::error(
                "pipeline_id, name, and pipeline_spec are required",
            ));
        };

        if let Err(e) = check_pipeline_access(
            self.platform.as_ref(),
            caller,
            pipeline_id,
            rbac::VERB_CREATE,
        )
        .await
        {
            return Ok(ToolResult::error(format!("Authorization failed: {}", e)));
        }

        let new_version = NewPipelineVersion {
            pipeline_id: pipeline_id.to_string(),
            name: name.to_string(),
            description: str_arg(args, "description").unwrap_or_default().to_string(),
            spec: spec.to_string(),
        };

        let created = match self.platform.create_pipeline_version(caller, new_version).await {
            Ok(v) => v,
            Err(e) => {
                return Ok(ToolResult::error(format!(
                    "Failed to create pipeline version: {}",
                    e
                )))
            }
        };

        let result = json!({
            "id": created.id,
            "pipeline_id": created.pipeline_id,
            "name": created.name,
        });
        Ok(ToolResult::ok(result.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::memory::InMemoryPlatform;
    use crate::platform::{Pipeline, PipelineVersion};

    fn seeded_platform() -> Arc<InMemoryPlatform> {
        let platform = Arc::new(InMemoryPlatform::single_user());
        platform.seed_pipeline(Pipeline {
            id: "p1".to_string(),
            name: "train".to_string(),
            description: "training pipeline".to_string(),
            namespace: "team-a".to_string(),
            created_at: 1,
        });
        platform.seed_pipeline_version(PipelineVersion {
            id: "v1".to_string(),
            pipeline_id: "p1".to_string(),
            name: "v1".to_string(),
            description: String::new(),
            spec: "{\"steps\":[]}".to_string(),
            created_at: 1,
        });
        platform
    }

    fn args(value: serde_json::Value) -> ToolArgs {
        value.as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn spec_tool_prefers_explicit_version() {
        let platform = seeded_platform();
        platform.seed_pipeline_version(PipelineVersion {
            id: "v2".to_string(),
            pipeline_id: "p1".to_string(),
            name: "v2".to_string(),
            description: String::new(),
            spec: "{\"steps\":[\"new\"]}".to_string(),
            created_at: 2,
        });
        let tool = GetPipelineSpecTool::new(platform);

        let result = tool
            .execute(
                &Caller::default(),
                &args(serde_json::json!({"pipeline_id": "p1", "pipeline_version_id": "v1"})),
            )
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["pipeline_spec"], "{\"steps\":[]}");

        let result = tool
            .execute(
                &Caller::default(),
                &args(serde_json::json!({"pipeline_id": "p1"})),
            )
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(parsed["pipeline_spec"], "{\"steps\":[\"new\"]}");
    }

    #[tokio::test]
    async fn spec_tool_needs_some_id() {
        let tool = GetPipelineSpecTool::new(seeded_platform());
        let result = tool
            .execute(&Caller::default(), &ToolArgs::new())
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn create_version_rejects_unknown_pipeline() {
        let tool = CreatePipelineVersionTool::new(seeded_platform());
        let result = tool
            .execute(
                &Caller::default(),
                &args(serde_json::json!({
                    "pipeline_id": "ghost",
                    "name": "v9",
                    "pipeline_spec": "{}"
                })),
            )
            .await
            .unwrap();
        assert!(result.is_error);
        assert!(result.content.contains("ghost"));
    }
}
