use serde::Deserialize;
use serde_json::{Value, json};

use super::protocol::{self, PromptTemplate, TOOL_NAME};
use super::retry::{format_error_parts, http_error, transport_error};
use super::{ProviderFuture, ProviderRequest, TranslationProvider};
use crate::error::{ProviderError, ProviderErrorKind};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
pub(crate) const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
const MAX_TOKENS: u32 = 8192;

#[derive(Debug, Clone)]
pub struct Claude {
    client: reqwest::Client,
    model: String,
    base_url: Option<String>,
    prompt: PromptTemplate,
}

impl Claude {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            model: DEFAULT_MODEL.to_string(),
            base_url: None,
            prompt: PromptTemplate::default(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        if !model.trim().is_empty() {
            self.model = model;
        }
        self
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url.filter(|url| !url.trim().is_empty());
        self
    }

    pub fn with_prompt(mut self, prompt: PromptTemplate) -> Self {
        self.prompt = prompt;
        self
    }

    fn url(&self) -> String {
        self.base_url
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }
}

impl TranslationProvider for Claude {
    fn id(&self) -> String {
        self.prompt.tag(format!("claude:{}", self.model))
    }

    fn translate(&self, request: ProviderRequest) -> ProviderFuture {
        let provider = self.clone();
        Box::pin(async move {
            let system = provider.prompt.render(&request).map_err(|err| {
                ProviderError::new(ProviderErrorKind::InvalidRequest, format!("{:#}", err))
            })?;
            let tool = protocol::tool_spec();
            let body = json!({
                "model": provider.model,
                "max_tokens": MAX_TOKENS,
                "system": system,
                "messages": [
                    {
                        "role": "user",
                        "content": [
                            {"type": "text", "text": protocol::render_user_input(&request.texts)}
                        ]
                    }
                ],
                "tools": [
                    {
                        "name": tool.name,
                        "description": tool.description,
                        "input_schema": tool.parameters
                    }
                ],
                "tool_choice": {"type": "tool", "name": tool.name}
            });

            let response = provider
                .client
                .post(provider.url())
                .header("x-api-key", request.secret.as_str())
                .header("anthropic-version", "2023-06-01")
                .json(&body)
                .send()
                .await
                .map_err(|err| transport_error("Claude", err))?;

            let status = response.status();
            let headers = response.headers().clone();
            let text = response
                .text()
                .await
                .map_err(|err| transport_error("Claude", err))?;
            if !status.is_success() {
                let detail = extract_claude_error(&text);
                return Err(http_error("Claude", status, &headers, &text, detail));
            }
            let args = extract_tool_input(&text)?;
            protocol::parse_tool_args(args, request.texts.len())
        })
    }
}

fn extract_tool_input(text: &str) -> Result<Value, ProviderError> {
    let payload: ClaudeResponse = serde_json::from_str(text).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("failed to parse Claude response JSON: {}", err),
        )
    })?;
    payload
        .content
        .into_iter()
        .find(|block| block.kind == "tool_use" && block.name.as_deref() == Some(TOOL_NAME))
        .and_then(|block| block.input)
        .ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::Unknown, "no tool call returned from Claude")
        })
}

fn extract_claude_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<ClaudeError>,
    }

    #[derive(Deserialize)]
    struct ClaudeError {
        #[serde(rename = "type")]
        kind: Option<String>,
        message: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, None))
}

#[derive(Debug, Deserialize)]
struct ClaudeResponse {
    content: Vec<ClaudeContent>,
}

#[derive(Debug, Deserialize)]
struct ClaudeContent {
    #[serde(rename = "type")]
    kind: String,
    name: Option<String>,
    input: Option<Value>,
}
