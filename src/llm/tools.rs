//! Tool-calling chat completions (OpenAI-compatible `tools` API) for the agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::llm::chat_stream::openai_deltas;
use crate::llm::{check_status, once_text, TextStream};

/// A function the model may call.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One model turn: optional text and zero or more tool calls.
#[derive(Debug, Clone, Default)]
pub struct AgentTurn {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl AgentTurn {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

/// Conversation entries exchanged with a tool-calling model.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    System(String),
    User(String),
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

#[async_trait]
pub trait ToolCallingModel: Send + Sync {
    /// Run one completion. An empty `tools` slice means the model must answer
    /// in text.
    async fn complete(&self, messages: &[AgentMessage], tools: &[ToolSpec]) -> Result<AgentTurn>;

    /// Text-only completion delivered as it is generated. The default runs
    /// [`Self::complete`] with no tools and yields its text in one piece.
    async fn stream_text(&self, messages: &[AgentMessage]) -> Result<TextStream> {
        let turn = self.complete(messages, &[]).await?;
        Ok(match turn.content {
            Some(text) => once_text(text),
            None => Box::pin(futures_util::stream::empty()),
        })
    }
}

/// OpenAI-compatible tool-calling endpoint (Groq, OpenAI, vLLM, ...).
pub struct OpenAiToolModel {
    client: reqwest::Client,
    config: AgentConfig,
}

impl OpenAiToolModel {
    pub fn new(client: reqwest::Client, config: AgentConfig) -> Self {
        Self { client, config }
    }
}

impl OpenAiToolModel {
    fn api_key(&self) -> Result<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::ProviderAuth {
                service: "agent".to_string(),
                message: "AGENT_API_KEY is not set".to_string(),
            })
    }

    async fn send(&self, req: &WireRequest) -> Result<reqwest::Response> {
        let api_key = self.api_key()?;
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(300))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(req)
            .send()
            .await?;
        check_status("agent", resp).await
    }
}

#[async_trait]
impl ToolCallingModel for OpenAiToolModel {
    async fn complete(&self, messages: &[AgentMessage], tools: &[ToolSpec]) -> Result<AgentTurn> {
        let req = build_request(&self.config.model, self.config.max_tokens, messages, tools);
        let body: WireResponse = self.send(&req).await?.json().await?;
        Ok(parse_response(body))
    }

    async fn stream_text(&self, messages: &[AgentMessage]) -> Result<TextStream> {
        let req = WireRequest {
            stream: true,
            ..build_request(&self.config.model, self.config.max_tokens, messages, &[])
        };
        let resp = self.send(&req).await?;
        Ok(openai_deltas("agent", resp))
    }
}

// ─── Wire format ─────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionSpec,
}

#[derive(Serialize)]
struct WireFunctionSpec {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments object.
    #[serde(default)]
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

fn build_request(
    model: &str,
    max_tokens: u32,
    messages: &[AgentMessage],
    tools: &[ToolSpec],
) -> WireRequest {
    let messages = messages
        .iter()
        .map(|m| match m {
            AgentMessage::System(text) => WireMessage {
                role: "system",
                content: Some(text.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            AgentMessage::User(text) => WireMessage {
                role: "user",
                content: Some(text.clone()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
            AgentMessage::Assistant {
                content,
                tool_calls,
            } => WireMessage {
                role: "assistant",
                content: content.clone(),
                tool_calls: tool_calls
                    .iter()
                    .map(|c| WireToolCall {
                        id: c.id.clone(),
                        kind: function_kind(),
                        function: WireFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect(),
                tool_call_id: None,
            },
            AgentMessage::Tool { call_id, content } => WireMessage {
                role: "tool",
                content: Some(content.clone()),
                tool_calls: Vec::new(),
                tool_call_id: Some(call_id.clone()),
            },
        })
        .collect();

    let wire_tools: Vec<WireTool> = tools
        .iter()
        .map(|t| WireTool {
            kind: "function",
            function: WireFunctionSpec {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            },
        })
        .collect();
    let tool_choice = (!wire_tools.is_empty()).then_some("auto");

    WireRequest {
        model: model.to_string(),
        messages,
        tools: wire_tools,
        tool_choice,
        max_tokens,
        stream: false,
    }
}

fn parse_response(body: WireResponse) -> AgentTurn {
    let Some(choice) = body.choices.into_iter().next() else {
        return AgentTurn::default();
    };

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|c| {
            let arguments = if c.function.arguments.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&c.function.arguments).unwrap_or_else(|e| {
                    tracing::warn!(tool = %c.function.name, "Unparseable tool arguments: {e}");
                    Value::Object(Default::default())
                })
            };
            ToolCall {
                id: c.id,
                name: c.function.name,
                arguments,
            }
        })
        .collect();

    AgentTurn {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
    }
}
