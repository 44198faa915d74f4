use crate::context::{ContextBuilder, PageContext};
use crate::platform::Caller;
use crate::provider::{ChatModel, ContentBlock, Delta, Message, StreamEvent};
use crate::rules::RuleManager;
use crate::session::{PendingToolCall, SessionManager, ToolCallDecision};
use crate::tools::{ChatMode, SecuredTool, ToolArgs, ToolRegistry, ToolResult};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

/// Hard cap on model→tools→model round trips per request. Turns a misbehaving
/// model's liveness failure into a bounded one.
pub const MAX_AGENTIC_LOOP_ITERATIONS: usize = 20;

/// Longest the engine waits for a user to approve or deny a mutating tool
/// call before treating it as failed.
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// An incoming chat turn.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: String,
    /// 1 = Ask, 2 = Agent; anything else collapses to Ask.
    #[serde(default)]
    pub mode: i64,
    #[serde(default)]
    pub page_context: Option<PageContext>,
    /// Set by the HTTP layer from the identity header, never from the body.
    #[serde(skip)]
    pub user_id: String,
}

/// Event streamed back to the client, framed as `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ChatResponseEvent {
    SessionMetadata {
        session_id: String,
        model: String,
        available_tools: Vec<String>,
    },
    Progress {
        message: String,
        /// -1 for indeterminate.
        percentage: i32,
    },
    MarkdownChunk {
        content: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        read_only: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_json: Option<String>,
    },
    ToolResult {
        tool_call_id: String,
        result_json: String,
        success: bool,
    },
    ConfirmationRequest {
        tool_call_id: String,
        tool_name: String,
        description: String,
        arguments_json: String,
    },
    Error {
        message: String,
        code: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproveToolCallRequest {
    pub session_id: String,
    pub tool_call_id: String,
    pub approved: bool,
}

/// A tool invocation collected from the model's stream.
struct CollectedToolCall {
    id: String,
    name: String,
    input: ToolArgs,
}

/// The agentic chat engine: drives the provider stream, collects tool calls
/// inline, executes them under the mode policy, and loops until the model
/// produces a final text answer.
pub struct ChatEngine {
    chat_model: Arc<dyn ChatModel>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<SessionManager>,
    context_builder: ContextBuilder,
    rules: Arc<RuleManager>,
}

impl ChatEngine {
    pub fn new(
        chat_model: Arc<dyn ChatModel>,
        registry: Arc<ToolRegistry>,
        sessions: Arc<SessionManager>,
        context_builder: ContextBuilder,
        rules: Arc<RuleManager>,
    ) -> Self {
        Self {
            chat_model,
            registry,
            sessions,
            context_builder,
            rules,
        }
    }

    pub fn model_name(&self) -> &str {
        self.chat_model.model_name()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn rules(&self) -> &RuleManager {
        &self.rules
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn approve_tool_call(&self, req: &ApproveToolCallRequest) -> Result<()> {
        self.sessions
            .resolve_confirmation(&req.session_id, &req.tool_call_id, req.approved)
    }

    pub fn validate_session_owner(&self, session_id: &str, user_id: &str) -> Result<()> {
        self.sessions.validate_session_owner(session_id, user_id)
    }

    /// Run one user turn, streaming events into `events`. Returns `Err` when
    /// the turn failed (provider error, client disconnect); every failure
    /// that can still reach the client has already been surfaced as a single
    /// sanitized `error` event by then.
    pub async fn stream_chat(
        &self,
        req: ChatRequest,
        events: mpsc::Sender<ChatResponseEvent>,
    ) -> Result<()> {
        let mode = ChatMode::from_wire(req.mode);
        let caller = Caller::from_user_id(&req.user_id);

        let session_id = self
            .sessions
            .get_or_create(&req.session_id, mode, &req.user_id);

        self.send(
            &events,
            ChatResponseEvent::SessionMetadata {
                session_id: session_id.clone(),
                model: self.chat_model.model_name().to_string(),
                available_tools: self.registry.tool_names(),
            },
        )
        .await?;

        let rules_content = self.rules.active_content();
        let system_prompt = self
            .context_builder
            .build_system_prompt(&caller, req.page_context.as_ref(), &rules_content)
            .await;

        if let Err(e) = self
            .sessions
            .add_message(&session_id, Message::user_text(req.message))
        {
            warn!("failed to add user message to session {}: {}", session_id, e);
        }

        let tool_defs = self.registry.list_for_mode(mode);

        for _iteration in 0..MAX_AGENTIC_LOOP_ITERATIONS {
            self.send(
                &events,
                ChatResponseEvent::Progress {
                    message: "Thinking...".to_string(),
                    percentage: -1,
                },
            )
            .await?;

            // Snapshot: the provider worker must never observe concurrent
            // appends to the session log.
            let messages = match self.sessions.get_messages(&session_id) {
                Ok(m) => m,
                Err(e) => {
                    let _ = self.send_internal_error(&events).await;
                    return Err(e.context("failed to get session messages"));
                }
            };

            let (mut event_rx, err_rx) =
                self.chat_model
                    .stream_chat(messages, tool_defs.clone(), system_prompt.clone());

            let mut text_content = String::new();
            let mut current_tool_call: Option<(String, String)> = None;
            let mut tool_call_json = String::new();
            let mut tool_calls: Vec<CollectedToolCall> = Vec::new();
            let mut stop_reason: Option<String> = None;

            while let Some(event) = event_rx.recv().await {
                match event {
                    StreamEvent::ContentBlockStart { content_block, .. } => {
                        if let ContentBlock::ToolUse { id, name, .. } = content_block {
                            self.send(
                                &events,
                                ChatResponseEvent::ToolCall {
                                    tool_call_id: id.clone(),
                                    tool_name: name.clone(),
                                    read_only: self.is_tool_read_only(&name),
                                    arguments_json: None,
                                },
                            )
                            .await?;
                            current_tool_call = Some((id, name));
                            tool_call_json.clear();
                        }
                    }
                    StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                        Delta::TextDelta { text } => {
                            if !text.is_empty() {
                                text_content.push_str(&text);
                                self.send(&events, ChatResponseEvent::MarkdownChunk { content: text })
                                    .await?;
                            }
                        }
                        Delta::InputJsonDelta { partial_json } => {
                            tool_call_json.push_str(&partial_json);
                        }
                    },
                    StreamEvent::ContentBlockStop { .. } => {
                        if let Some((id, name)) = current_tool_call.take() {
                            let input = parse_tool_input(&tool_call_json);
                            let arguments_json = serde_json::to_string(&input)
                                .unwrap_or_else(|_| "{}".to_string());
                            self.send(
                                &events,
                                ChatResponseEvent::ToolCall {
                                    tool_call_id: id.clone(),
                                    tool_name: name.clone(),
                                    read_only: self.is_tool_read_only(&name),
                                    arguments_json: Some(arguments_json),
                                },
                            )
                            .await?;
                            tool_calls.push(CollectedToolCall { id, name, input });
                        }
                    }
                    StreamEvent::MessageDelta { delta, .. } => {
                        if let Some(reason) = delta.stop_reason {
                            stop_reason = Some(reason);
                        }
                    }
                    StreamEvent::MessageStart { .. }
                    | StreamEvent::MessageStop
                    | StreamEvent::Ping => {}
                }
            }

            // The event channel is closed, so the worker is done; now check
            // whether it ended with an error.
            if let Ok(err) = err_rx.await {
                // Full detail stays server-side; the client gets a sanitized event.
                error!("AI provider error: {:#}", err);
                let _ = self
                    .send(
                        &events,
                        ChatResponseEvent::Error {
                            message:
                                "An error occurred communicating with the AI provider. Please try again."
                                    .to_string(),
                            code: "provider_error".to_string(),
                            retryable: true,
                        },
                    )
                    .await;
                return Err(err);
            }

            let mut content_blocks: Vec<ContentBlock> = Vec::new();
            if !text_content.is_empty() {
                content_blocks.push(ContentBlock::Text {
                    text: std::mem::take(&mut text_content),
                });
            }
            for tc in &tool_calls {
                content_blocks.push(ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: serde_json::Value::Object(tc.input.clone()),
                });
            }
            if !content_blocks.is_empty() {
                if let Err(e) = self
                    .sessions
                    .add_message(&session_id, Message::assistant_blocks(content_blocks))
                {
                    warn!(
                        "failed to add assistant message to session {}: {}",
                        session_id, e
                    );
                }
            }

            if stop_reason.as_deref() != Some("tool_use") || tool_calls.is_empty() {
                break;
            }

            let mut tool_results: Vec<ContentBlock> = Vec::new();
            for tc in &tool_calls {
                let result = self
                    .execute_tool_call(&session_id, &caller, mode, tc, &events)
                    .await?;
                tool_results.push(ContentBlock::ToolResult {
                    tool_use_id: tc.id.clone(),
                    content: result.content,
                    is_error: result.is_error,
                });
            }

            if let Err(e) = self
                .sessions
                .add_message(&session_id, Message::user_blocks(tool_results))
            {
                warn!("failed to add tool results to session {}: {}", session_id, e);
            }
        }

        Ok(())
    }

    /// Execute one collected tool call under the mode policy. Every expected
    /// failure comes back as a `ToolResult` with `is_error = true` so the
    /// model can recover; `Err` is reserved for client disconnect.
    async fn execute_tool_call(
        &self,
        session_id: &str,
        caller: &Caller,
        mode: ChatMode,
        tc: &CollectedToolCall,
        events: &mpsc::Sender<ChatResponseEvent>,
    ) -> Result<ToolResult> {
        let Some(secured) = self.registry.get(&tc.name) else {
            return Ok(ToolResult::error(format!("Unknown tool: {}", tc.name)));
        };

        if secured.is_blocked(mode) {
            return Ok(ToolResult::error(format!(
                "Tool {} is not available in Ask mode. Switch to Agent mode to use mutating tools.",
                tc.name
            )));
        }

        if secured.needs_confirmation(mode) {
            match self
                .await_confirmation(session_id, tc, &secured, events)
                .await?
            {
                ConfirmationOutcome::Approved => {}
                ConfirmationOutcome::Resolved(result) => return Ok(result),
            }
        }

        self.send(
            events,
            ChatResponseEvent::Progress {
                message: format!("Executing {}...", tc.name),
                percentage: -1,
            },
        )
        .await?;

        let result = match secured.execute(caller, &tc.input).await {
            Ok(result) => result,
            Err(e) => ToolResult::error(format!("Tool execution error: {:#}", e)),
        };

        self.send(
            events,
            ChatResponseEvent::ToolResult {
                tool_call_id: tc.id.clone(),
                result_json: result.content.clone(),
                success: !result.is_error,
            },
        )
        .await?;

        Ok(result)
    }

    /// Park the tool call and wait for the user, the clock, or the client:
    /// whichever resolves first wins.
    async fn await_confirmation(
        &self,
        session_id: &str,
        tc: &CollectedToolCall,
        secured: &SecuredTool,
        events: &mpsc::Sender<ChatResponseEvent>,
    ) -> Result<ConfirmationOutcome> {
        let arguments_json = serde_json::to_string(&tc.input).unwrap_or_else(|_| "{}".to_string());

        // Register the pending call before telling the client, so an approval
        // arriving immediately after the event cannot miss it.
        let (decision_tx, decision_rx) = oneshot::channel::<ToolCallDecision>();
        let pending = PendingToolCall {
            tool_call_id: tc.id.clone(),
            tool_name: tc.name.clone(),
            arguments: tc.input.clone(),
            decision_tx,
        };
        if let Err(e) = self.sessions.add_pending_confirmation(session_id, pending) {
            // The session vanished under us (evicted); surface it to the model.
            warn!("failed to register pending confirmation: {}", e);
            return Ok(ConfirmationOutcome::Resolved(ToolResult::error(format!(
                "Tool call {} could not await confirmation: session expired.",
                tc.name
            ))));
        }

        self.send(
            events,
            ChatResponseEvent::ConfirmationRequest {
                tool_call_id: tc.id.clone(),
                tool_name: tc.name.clone(),
                description: format!(
                    "Execute {} with the provided arguments: {}",
                    tc.name,
                    secured.description()
                ),
                arguments_json,
            },
        )
        .await?;

        tokio::select! {
            decision = decision_rx => {
                match decision {
                    Ok(ToolCallDecision { approved: true }) => Ok(ConfirmationOutcome::Approved),
                    // A denial, or a dropped sender (session evicted), both read as no.
                    _ => Ok(ConfirmationOutcome::Resolved(ToolResult::error(format!(
                        "Tool call {} was denied by the user.",
                        tc.name
                    )))),
                }
            }
            _ = events.closed() => {
                Err(anyhow!("client disconnected while awaiting confirmation"))
            }
            _ = tokio::time::sleep(CONFIRMATION_TIMEOUT) => {
                Ok(ConfirmationOutcome::Resolved(ToolResult::error(format!(
                    "Tool call {} timed out waiting for user confirmation.",
                    tc.name
                ))))
            }
        }
    }

    fn is_tool_read_only(&self, name: &str) -> bool {
        self.registry
            .get(name)
            .map(|t| t.is_read_only())
            .unwrap_or(false)
    }

    async fn send(
        &self,
        events: &mpsc::Sender<ChatResponseEvent>,
        event: ChatResponseEvent,
    ) -> Result<()> {
        events
            .send(event)
            .await
            .map_err(|_| anyhow!("client disconnected"))
    }

    async fn send_internal_error(&self, events: &mpsc::Sender<ChatResponseEvent>) -> Result<()> {
        self.send(
            events,
            ChatResponseEvent::Error {
                message: "An error occurred processing your request. Please try again."
                    .to_string(),
                code: "internal_error".to_string(),
                retryable: false,
            },
        )
        .await
    }
}

enum ConfirmationOutcome {
    Approved,
    Resolved(ToolResult),
}

/// Parse the JSON accumulated from `input_json_delta` fragments. Empty or
/// malformed input degrades to an empty object.
fn parse_tool_input(raw: &str) -> ToolArgs {
    if raw.is_empty() {
        return ToolArgs::new();
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(other) => {
            warn!("tool call input is not a JSON object: {}", other);
            ToolArgs::new()
        }
        Err(e) => {
            warn!("failed to parse tool call input JSON: {}", e);
            ToolArgs::new()
        }
    }
}
