use futures_util::FutureExt;
use serde::Deserialize;
use serde_json::{Value, json};

use super::protocol::{self, PromptTemplate, TOOL_NAME};
use super::retry::{format_error_parts, http_error, transport_error};
use super::{ProviderFuture, ProviderRequest, TranslationProvider};
use crate::error::{ProviderError, ProviderErrorKind};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub(crate) const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct OpenAI {
    client: reqwest::Client,
    model: String,
    base_url: Option<String>,
    prompt: PromptTemplate,
}

impl OpenAI {
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

    fn base_url(&self) -> String {
        self.base_url
            .clone()
            .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

impl TranslationProvider for OpenAI {
    fn id(&self) -> String {
        self.prompt.tag(format!("openai:{}", self.model))
    }

    fn translate(&self, request: ProviderRequest) -> ProviderFuture {
        let provider = self.clone();
        async move { call_chat_completions(provider, request).await }.boxed()
    }
}

async fn call_chat_completions(
    provider: OpenAI,
    request: ProviderRequest,
) -> Result<Vec<super::ItemResult>, ProviderError> {
    let system = provider.prompt.render(&request)
        .map_err(|err| ProviderError::new(ProviderErrorKind::InvalidRequest, format!("{:#}", err)))?;
    let tool = protocol::tool_spec();
    let body = json!({
        "model": provider.model,
        "messages": [
            {"role": "system", "content": system},
            {"role": "user", "content": protocol::render_user_input(&request.texts)}
        ],
        "tools": [
            {
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters
                }
            }
        ],
        "tool_choice": {"type": "function", "function": {"name": tool.name}}
    });

    let url = format!("{}/chat/completions", provider.base_url());
    let response = provider
        .client
        .post(&url)
        .bearer_auth(&request.secret)
        .json(&body)
        .send()
        .await
        .map_err(|err| transport_error("OpenAI", err))?;

    let status = response.status();
    let headers = response.headers().clone();
    let text = response
        .text()
        .await
        .map_err(|err| transport_error("OpenAI", err))?;
    if !status.is_success() {
        let detail = extract_openai_error(&text);
        return Err(http_error("OpenAI", status, &headers, &text, detail));
    }
    let args = extract_tool_args(&text)?;
    protocol::parse_tool_args(args, request.texts.len())
}

fn extract_tool_args(text: &str) -> Result<Value, ProviderError> {
    let payload: OpenAIResponse = serde_json::from_str(text).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("failed to parse OpenAI response JSON: {}", err),
        )
    })?;
    let tool_call = payload
        .choices
        .first()
        .and_then(|choice| choice.message.tool_calls.first())
        .ok_or_else(|| {
            ProviderError::new(ProviderErrorKind::Unknown, "no tool call returned from OpenAI")
        })?;
    if tool_call.function.name != TOOL_NAME {
        return Err(ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("unexpected tool name '{}' from OpenAI", tool_call.function.name),
        ));
    }
    serde_json::from_str(&tool_call.function.arguments).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("failed to parse OpenAI tool arguments: {}", err),
        )
    })
}

fn extract_openai_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: Option<OpenAIError>,
    }

    #[derive(Deserialize)]
    struct OpenAIError {
        message: Option<String>,
        #[serde(rename = "type")]
        kind: Option<String>,
        code: Option<String>,
    }

    let parsed: ErrorBody = serde_json::from_str(body).ok()?;
    let error = parsed.error?;
    Some(format_error_parts(error.message, error.kind, error.code))
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}
