pub mod anthropic;

use crate::config::ProviderConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

// ---------------------------------------------------------------------------
// Conversation wire types (messages-API shape)
// ---------------------------------------------------------------------------

/// One message in the conversation history sent to the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Tool results go back to the provider as a user-role message; the
    /// messages API requires this exact role, not "tool" or "system".
    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// Tagged content block. Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// Tool made available to the model for this turn.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Streaming event types
// ---------------------------------------------------------------------------

/// One typed event decoded from the provider's SSE stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        #[serde(default)]
        message: Option<MessageResponse>,
    },
    ContentBlockStart {
        #[serde(default)]
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: usize,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    /// Keep-alive frame; carries nothing.
    Ping,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

/// Payload of a `message_delta` frame. Untyped on the wire (no `type` tag).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDelta {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

// ---------------------------------------------------------------------------
// ChatModel trait + factory
// ---------------------------------------------------------------------------

/// A streaming chat-completion backend.
///
/// `stream_chat` spawns one worker per call and returns immediately. The
/// consumer drains the event receiver until it yields `None`, then awaits the
/// error receiver: `Ok(err)` is a failed turn, a dropped sender (`Err`) means
/// the stream completed cleanly. Dropping the event receiver cancels the
/// worker at its next send.
pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    fn stream_chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        system_prompt: String,
    ) -> (
        mpsc::Receiver<StreamEvent>,
        oneshot::Receiver<anyhow::Error>,
    );
}

/// Instantiate the configured provider backend.
pub fn new_chat_model(cfg: &ProviderConfig) -> Result<Arc<dyn ChatModel>> {
    match cfg.kind.as_str() {
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(cfg)?)),
        other => anyhow::bail!("unsupported chat provider: {}", other),
    }
}

// ---------------------------------------------------------------------------
// Scripted model for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) struct ScriptedTurn {
        pub events: Vec<StreamEvent>,
        pub error: Option<anyhow::Error>,
    }

    impl ScriptedTurn {
        pub fn events(events: Vec<StreamEvent>) -> Self {
            Self {
                events,
                error: None,
            }
        }

        pub fn failure(error: anyhow::Error) -> Self {
            Self {
                events: Vec::new(),
                error: Some(error),
            }
        }
    }

    /// ChatModel that replays pre-scripted turns, one per `stream_chat` call.
    pub(crate) struct ScriptedModel {
        turns: Mutex<VecDeque<ScriptedTurn>>,
        pub calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedModel {
        pub fn new(turns: Vec<ScriptedTurn>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
                calls: std::sync::atomic::AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    impl ChatModel for ScriptedModel {
        fn model_name(&self) -> &str {
            "scripted-model"
        }

        fn stream_chat(
            &self,
            _messages: Vec<Message>,
            _tools: Vec<ToolDefinition>,
            _system_prompt: String,
        ) -> (
            mpsc::Receiver<StreamEvent>,
            oneshot::Receiver<anyhow::Error>,
        ) {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let turn = self
                .turns
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ScriptedTurn::events(Vec::new()));
            let (event_tx, event_rx) = mpsc::channel(64);
            let (err_tx, err_rx) = oneshot::channel();
            tokio::spawn(async move {
                for event in turn.events {
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
                if let Some(err) = turn.error {
                    let _ = err_tx.send(err);
                }
            });
            (event_rx, err_rx)
        }
    }

    // --- Event constructors used by engine/provider tests ---

    pub(crate) fn text_block_start() -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Text {
                text: String::new(),
            },
        }
    }

    pub(crate) fn tool_use_start(index: usize, id: &str, name: &str) -> StreamEvent {
        StreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: serde_json::json!({}),
            },
        }
    }

    pub(crate) fn text_delta(index: usize, text: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    pub(crate) fn input_json_delta(index: usize, fragment: &str) -> StreamEvent {
        StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::InputJsonDelta {
                partial_json: fragment.to_string(),
            },
        }
    }

    pub(crate) fn block_stop(index: usize) -> StreamEvent {
        StreamEvent::ContentBlockStop { index }
    }

    pub(crate) fn stop_reason(reason: &str) -> StreamEvent {
        StreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(reason.to_string()),
                stop_sequence: None,
            },
            usage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_serializes_to_messages_api_shape() {
        let block = ContentBlock::ToolUse {
            id: "tc-1".to_string(),
            name: "list_runs".to_string(),
            input: serde_json::json!({"page_size": 5}),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_use");
        assert_eq!(json["name"], "list_runs");
        assert_eq!(json["input"]["page_size"], 5);

        let block = ContentBlock::ToolResult {
            tool_use_id: "tc-1".to_string(),
            content: "{}".to_string(),
            is_error: false,
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "tool_result");
        assert_eq!(json["tool_use_id"], "tc-1");
    }

    #[test]
    fn message_content_is_untagged() {
        let msg = Message::user_text("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "hello");

        let msg = Message::assistant_blocks(vec![ContentBlock::Text {
            text: "hi".to_string(),
        }]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let cfg = ProviderConfig {
            kind: "parrot".to_string(),
            ..ProviderConfig::default()
        };
        assert!(new_chat_model(&cfg).is_err());
    }
}
