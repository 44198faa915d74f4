use super::{ChatModel, Message, StreamEvent, ToolDefinition};
use crate::config::ProviderConfig;
use anyhow::{anyhow, Result};
use futures_util::StreamExt;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Buffer for the event channel; a slow consumer back-pressures the worker
/// rather than growing memory.
const EVENT_CHANNEL_BUFFER: usize = 64;

/// Streaming adapter for the Anthropic messages API.
#[derive(Clone)]
pub struct AnthropicProvider {
    http: Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl AnthropicProvider {
    pub fn new(cfg: &ProviderConfig) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("provider API key is not configured"))?;
        let http = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self {
            http,
            api_url: cfg
                .api_url
                .clone()
                .unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            api_key,
            model: cfg.model.clone(),
            max_tokens: if cfg.max_tokens > 0 {
                cfg.max_tokens
            } else {
                DEFAULT_MAX_TOKENS
            },
        })
    }

    async fn run_stream(
        self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        system_prompt: String,
        event_tx: mpsc::Sender<StreamEvent>,
    ) -> Result<()> {
        let req = ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system: if system_prompt.is_empty() {
                None
            } else {
                Some(&system_prompt)
            },
            messages: &messages,
            tools: if tools.is_empty() { None } else { Some(&tools) },
            stream: true,
        };

        debug!(
            "provider request: model={} messages={} tools={}",
            self.model,
            messages.len(),
            tools.len()
        );

        let resp = self
            .http
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("provider API error (status {}): {}", status, body);
        }

        // Frame the body into lines; each payload line is `data: <json>`.
        let byte_stream = resp
            .bytes_stream()
            .map(|item| item.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let reader = StreamReader::new(byte_stream);
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(1024 * 1024));

        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| anyhow!("SSE stream error: {}", e))?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let Some(data) = trimmed.strip_prefix("data: ") else {
                // `event:` lines and comments carry no payload.
                continue;
            };
            if data == "[DONE]" {
                break;
            }
            let event = match parse_stream_event(data) {
                Ok(event) => event,
                Err(e) => {
                    warn!("skipping unparseable SSE event: {} (data: {:.200})", e, data);
                    continue;
                }
            };
            // A dropped receiver means the request was cancelled; stop quietly.
            if event_tx.send(event).await.is_err() {
                return Ok(());
            }
        }

        Ok(())
    }
}

impl ChatModel for AnthropicProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn stream_chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        system_prompt: String,
    ) -> (
        mpsc::Receiver<StreamEvent>,
        oneshot::Receiver<anyhow::Error>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let (err_tx, err_rx) = oneshot::channel();
        let provider = self.clone();
        tokio::spawn(async move {
            if let Err(e) = provider
                .run_stream(messages, tools, system_prompt, event_tx)
                .await
            {
                // At most one error per turn; the receiver may already be gone.
                let _ = err_tx.send(e);
            }
        });
        (event_rx, err_rx)
    }
}

fn parse_stream_event(data: &str) -> Result<StreamEvent> {
    serde_json::from_str(data).map_err(|e| anyhow!("bad SSE payload: {}", e))
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
    stream: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ContentBlock, Delta};

    #[test]
    fn parses_text_delta() {
        let event = parse_stream_event(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::ContentBlockDelta {
                index: 0,
                delta: Delta::TextDelta { text },
            } => assert_eq!(text, "Hello"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_tool_use_block_start() {
        let event = parse_stream_event(
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_01","name":"list_runs","input":{}}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: ContentBlock::ToolUse { id, name, .. },
            } => {
                assert_eq!(id, "toolu_01");
                assert_eq!(name, "list_runs");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_input_json_delta() {
        let event = parse_stream_event(
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"run_id\":"}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::ContentBlockDelta {
                delta: Delta::InputJsonDelta { partial_json },
                ..
            } => assert_eq!(partial_json, "{\"run_id\":"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_message_delta_stop_reason() {
        let event = parse_stream_event(
            r#"{"type":"message_delta","delta":{"stop_reason":"tool_use","stop_sequence":null},"usage":{"output_tokens":42}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason.as_deref(), Some("tool_use"));
                assert_eq!(usage.unwrap().output_tokens, Some(42));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn parses_lifecycle_frames() {
        assert!(matches!(
            parse_stream_event(r#"{"type":"message_start","message":{"id":"msg_01","role":"assistant","model":"m","content":[],"usage":{"input_tokens":12}}}"#).unwrap(),
            StreamEvent::MessageStart { .. }
        ));
        assert!(matches!(
            parse_stream_event(r#"{"type":"message_stop"}"#).unwrap(),
            StreamEvent::MessageStop
        ));
        assert!(matches!(
            parse_stream_event(r#"{"type":"ping"}"#).unwrap(),
            StreamEvent::Ping
        ));
    }

    #[test]
    fn rejects_garbage_payload() {
        assert!(parse_stream_event("not json").is_err());
        assert!(parse_stream_event(r#"{"type":"no_such_frame"}"#).is_err());
    }
}
