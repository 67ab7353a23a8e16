use anyhow::{Result, anyhow};
use futures_util::future::BoxFuture;
use std::time::Duration;

use crate::error::ProviderError;
use crate::settings::Settings;

mod claude;
mod deepl;
mod openai;
pub mod protocol;
pub(crate) mod retry;

pub use claude::Claude;
pub use deepl::DeepL;
pub use openai::OpenAI;
pub use protocol::PromptTemplate;

pub type ItemResult = Result<String, ProviderError>;
pub type ProviderFuture = BoxFuture<'static, Result<Vec<ItemResult>, ProviderError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Claude,
    DeepL,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Claude => "claude",
            ProviderKind::DeepL => "deepl",
        }
    }

    pub fn key_env(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::Claude => "ANTHROPIC_API_KEY",
            ProviderKind::DeepL => "DEEPL_API_KEY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderSelection {
    pub provider: ProviderKind,
    pub requested_model: Option<String>,
}

/// One batch call. Texts are already masked; the response must keep their order.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub texts: Vec<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub secret: String,
    pub glossary_hint: Option<String>,
}

pub trait TranslationProvider: Clone + Send + Sync + 'static {
    /// Stable identifier that enters every cache key.
    fn id(&self) -> String;
    fn translate(&self, request: ProviderRequest) -> ProviderFuture;
}

#[derive(Debug, Clone)]
pub enum ProviderImpl {
    OpenAI(OpenAI),
    Claude(Claude),
    DeepL(DeepL),
}

impl TranslationProvider for ProviderImpl {
    fn id(&self) -> String {
        match self {
            ProviderImpl::OpenAI(provider) => provider.id(),
            ProviderImpl::Claude(provider) => provider.id(),
            ProviderImpl::DeepL(provider) => provider.id(),
        }
    }

    fn translate(&self, request: ProviderRequest) -> ProviderFuture {
        match self {
            ProviderImpl::OpenAI(provider) => provider.translate(request),
            ProviderImpl::Claude(provider) => provider.translate(request),
            ProviderImpl::DeepL(provider) => provider.translate(request),
        }
    }
}

/// Builds the client for `selection`. DeepL has no system prompt, so `prompt` only
/// reaches the LLM providers.
pub fn build_provider(
    selection: &ProviderSelection,
    settings: &Settings,
    timeout: Duration,
    prompt: &PromptTemplate,
) -> Result<ProviderImpl> {
    let endpoint = settings.providers.get(selection.provider.as_str());
    let base_url = endpoint.and_then(|endpoint| endpoint.base_url.clone());
    let model = selection
        .requested_model
        .clone()
        .or_else(|| endpoint.and_then(|endpoint| endpoint.model.clone()))
        .unwrap_or_default();
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| anyhow!("failed to build HTTP client: {}", err))?;

    let provider = match selection.provider {
        ProviderKind::OpenAI => ProviderImpl::OpenAI(
            OpenAI::new(client)
                .with_model(model)
                .with_base_url(base_url)
                .with_prompt(prompt.clone()),
        ),
        ProviderKind::Claude => ProviderImpl::Claude(
            Claude::new(client)
                .with_model(model)
                .with_base_url(base_url)
                .with_prompt(prompt.clone()),
        ),
        ProviderKind::DeepL => ProviderImpl::DeepL(DeepL::new(client).with_base_url(base_url)),
    };
    Ok(provider)
}

pub fn resolve_provider_selection(provider_arg: Option<&str>) -> Result<ProviderSelection> {
    match provider_arg {
        Some(provider) => parse_provider_arg(provider),
        None => Ok(default_provider_selection()),
    }
}

/// Keys from the command line win, then settings, then the provider's env var.
pub fn resolve_keys(
    provider: ProviderKind,
    cli_keys: &[String],
    settings_keys: &[String],
) -> Vec<String> {
    let pick = |keys: &[String]| {
        keys.iter()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .collect::<Vec<_>>()
    };
    let keys = pick(cli_keys);
    if !keys.is_empty() {
        return keys;
    }
    let keys = pick(settings_keys);
    if !keys.is_empty() {
        return keys;
    }
    get_env(provider.key_env())
        .map(|value| {
            value
                .split(',')
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn default_provider_selection() -> ProviderSelection {
    let provider = [ProviderKind::OpenAI, ProviderKind::Claude, ProviderKind::DeepL]
        .into_iter()
        .find(|kind| get_env(kind.key_env()).is_some())
        .unwrap_or(ProviderKind::OpenAI);
    ProviderSelection {
        provider,
        requested_model: None,
    }
}

pub fn parse_provider_arg(provider_arg: &str) -> Result<ProviderSelection> {
    let raw = provider_arg.trim();
    if raw.is_empty() {
        return Err(anyhow!("provider argument is empty"));
    }

    if let Some(provider) = provider_from_name(&raw.to_lowercase()) {
        return Ok(ProviderSelection {
            provider,
            requested_model: None,
        });
    }

    if let Some((provider_part, model_part)) = raw.split_once(':')
        && let Some(provider) = provider_from_name(&provider_part.to_lowercase())
    {
        let model = Some(model_part.trim().to_string()).filter(|model| !model.is_empty());
        return Ok(ProviderSelection {
            provider,
            requested_model: model,
        });
    }

    Err(anyhow!(
        "unknown provider '{}'. Use provider[:model] (openai, claude, deepl)",
        raw
    ))
}

fn provider_from_name(name: &str) -> Option<ProviderKind> {
    match name {
        "openai" | "gpt" => Some(ProviderKind::OpenAI),
        "claude" | "anthropic" => Some(ProviderKind::Claude),
        "deepl" => Some(ProviderKind::DeepL),
        _ => None,
    }
}

fn get_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}
