use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Value, json};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tera::{Context as TeraContext, Tera};

use super::{ItemResult, ProviderRequest};
use crate::error::{ProviderError, ProviderErrorKind};

pub const TOOL_NAME: &str = "deliver_translations";

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/batch_system.tera");

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

pub fn tool_spec() -> ToolSpec {
    ToolSpec {
        name: TOOL_NAME.to_string(),
        description: "Return one translation per input item.".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "translations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "index": {"type": "integer"},
                            "text": {"type": "string"}
                        },
                        "required": ["index", "text"]
                    }
                }
            },
            "required": ["translations"]
        }),
    }
}

/// Tera source of the system prompt: the built-in one or a user override.
#[derive(Debug, Clone, Default)]
pub struct PromptTemplate {
    custom: Option<Arc<str>>,
}

impl PromptTemplate {
    /// Parses and test-renders `source` so a broken template fails before any request.
    pub fn custom(source: impl Into<String>) -> Result<Self> {
        let template = Self {
            custom: Some(Arc::from(source.into())),
        };
        template.render(&ProviderRequest {
            texts: Vec::new(),
            source_lang: "auto".to_string(),
            target_lang: "english".to_string(),
            secret: String::new(),
            glossary_hint: Some("glossary".to_string()),
        })?;
        Ok(template)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt template: {}", path.display()))?;
        Self::custom(source)
            .with_context(|| format!("invalid prompt template: {}", path.display()))
    }

    /// Appends a digest of a custom template, so its translations get their own cache keys.
    pub fn tag(&self, provider_id: String) -> String {
        match &self.custom {
            Some(source) => {
                let digest = format!("{:x}", md5::compute(source.as_bytes()));
                format!("{}+prompt-{}", provider_id, &digest[..8])
            }
            None => provider_id,
        }
    }

    pub fn render(&self, request: &ProviderRequest) -> Result<String> {
        let source = self.custom.as_deref().unwrap_or(SYSTEM_PROMPT_TEMPLATE);
        let mut context = TeraContext::new();
        context.insert("source_lang", display_lang(&request.source_lang));
        context.insert("target_lang", display_lang(&request.target_lang));
        context.insert("glossary_hint", &request.glossary_hint);
        context.insert("tool_name", TOOL_NAME);
        Tera::one_off(source, &context, false)
            .map(|prompt| prompt.trim().to_string())
            .with_context(|| "failed to render system prompt")
    }
}

pub fn render_user_input(texts: &[String]) -> String {
    let items = texts
        .iter()
        .enumerate()
        .map(|(index, text)| json!({"index": index, "text": text}))
        .collect::<Vec<_>>();
    serde_json::to_string_pretty(&items).unwrap_or_default()
}

/// Maps tool arguments onto request order. Unindexed output is returned as is,
/// so a count mismatch stays visible to the caller.
pub fn parse_tool_args(value: Value, expected: usize) -> Result<Vec<ItemResult>, ProviderError> {
    let args: ToolArgs = serde_json::from_value(value).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("malformed tool arguments: {}", err),
        )
    })?;

    let indexed = !args.translations.is_empty()
        && args
            .translations
            .iter()
            .all(|item| item.index.is_some_and(|index| index < expected));
    if !indexed {
        return Ok(args.translations.into_iter().map(|item| Ok(item.text)).collect());
    }

    let mut slots: Vec<Option<String>> = vec![None; expected];
    for item in args.translations {
        if let Some(index) = item.index {
            slots[index].get_or_insert(item.text);
        }
    }
    Ok(slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| {
                ProviderError::new(
                    ProviderErrorKind::Unknown,
                    format!("item {} missing from response", index),
                )
            })
        })
        .collect())
}

fn display_lang(lang: &str) -> &str {
    let trimmed = lang.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
        "the source language"
    } else {
        trimmed
    }
}

#[derive(Debug, Deserialize)]
struct ToolArgs {
    #[serde(default)]
    translations: Vec<ToolItem>,
}

#[derive(Debug, Deserialize)]
struct ToolItem {
    index: Option<usize>,
    text: String,
}
