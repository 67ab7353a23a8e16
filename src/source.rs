use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::placeholders::PlaceholderRules;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceString {
    id: String,
    text: String,
    placeholders: Vec<String>,
}

impl SourceString {
    pub fn new(id: impl Into<String>, text: impl Into<String>, rules: &PlaceholderRules) -> Self {
        let text = text.into();
        let placeholders = rules.extract(&text);
        Self {
            id: id.into(),
            text,
            placeholders,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }
}

pub fn content_id(text: &str) -> String {
    format!("{:x}", md5::compute(text.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct ExtractedInput {
    pub strings: Vec<SourceString>,
    pub rules: PlaceholderRules,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputFile {
    Strings(Vec<InputEntry>),
    Document {
        #[serde(default)]
        placeholder_patterns: Vec<String>,
        strings: Vec<InputEntry>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InputEntry {
    Text(String),
    Record {
        id: Option<String>,
        text: String,
        file: Option<String>,
        line: Option<u64>,
    },
}

pub fn load_input(path: &Path, default_patterns: &[String]) -> Result<ExtractedInput> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read input: {}", path.display()))?;
    parse_input(&content, default_patterns)
        .with_context(|| format!("failed to parse input: {}", path.display()))
}

pub fn parse_input(content: &str, default_patterns: &[String]) -> Result<ExtractedInput> {
    let parsed: InputFile = serde_json::from_str(content)?;
    let (patterns, entries) = match parsed {
        InputFile::Strings(entries) => (Vec::new(), entries),
        InputFile::Document {
            placeholder_patterns,
            strings,
        } => (placeholder_patterns, strings),
    };
    let patterns = if patterns.is_empty() {
        default_patterns.to_vec()
    } else {
        patterns
    };
    let rules = PlaceholderRules::new(&patterns)
        .with_context(|| "invalid placeholder pattern")?;

    let mut strings: Vec<SourceString> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for entry in entries {
        let (id, text) = match entry {
            InputEntry::Text(text) => (content_id(&text), text),
            InputEntry::Record {
                id,
                text,
                file,
                line,
            } => (derive_id(id, file, line, &text), text),
        };
        if text.trim().is_empty() {
            debug!("skipping empty string {}", id);
            continue;
        }
        if let Some(&index) = seen.get(&id) {
            if strings[index].text() != text {
                return Err(anyhow!("duplicate string id '{}' with different text", id));
            }
            continue;
        }
        seen.insert(id.clone(), strings.len());
        strings.push(SourceString::new(id, text, &rules));
    }

    Ok(ExtractedInput { strings, rules })
}

fn derive_id(
    id: Option<String>,
    file: Option<String>,
    line: Option<u64>,
    text: &str,
) -> String {
    if let Some(id) = id.filter(|value| !value.trim().is_empty()) {
        return id;
    }
    match (file.filter(|value| !value.trim().is_empty()), line) {
        (Some(file), Some(line)) => format!("{}:{}", file, line),
        (Some(file), None) => format!("{}:{}", file, content_id(text)),
        _ => content_id(text),
    }
}
