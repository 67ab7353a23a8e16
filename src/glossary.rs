use anyhow::{Context, Result, anyhow};
use regex::{NoExpand, Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

const TOKEN_LETTERS: u32 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlossaryMode {
    Off,
    Hint,
    #[default]
    Mask,
}

impl FromStr for GlossaryMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(GlossaryMode::Off),
            "hint" | "prompt" => Ok(GlossaryMode::Hint),
            "mask" => Ok(GlossaryMode::Mask),
            other => Err(anyhow!("unknown glossary mode '{}'", other)),
        }
    }
}

impl fmt::Display for GlossaryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GlossaryMode::Off => "off",
            GlossaryMode::Hint => "hint",
            GlossaryMode::Mask => "mask",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GlossaryEntry {
    #[serde(alias = "src")]
    pub source: String,
    #[serde(alias = "dst")]
    pub target: String,
    #[serde(default, alias = "info")]
    pub context: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
    #[serde(default)]
    pub regex: bool,
}

impl GlossaryEntry {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            context: String::new(),
            category: default_category(),
            case_sensitive: true,
            regex: false,
        }
    }
}

fn default_category() -> String {
    "general".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GlossaryFile {
    Document { entries: Vec<GlossaryEntry> },
    Entries(Vec<GlossaryEntry>),
}

#[derive(Debug, Clone)]
struct CompiledEntry {
    entry: GlossaryEntry,
    matcher: Regex,
    token: String,
}

#[derive(Debug, Clone)]
pub struct Glossary {
    entries: Vec<CompiledEntry>,
    version: String,
}

/// Tokens inserted by [`Glossary::protect`] and the terms they stand for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlossaryContext {
    replacements: Vec<(String, String)>,
}

impl GlossaryContext {
    pub fn is_empty(&self) -> bool {
        self.replacements.is_empty()
    }

    /// Swaps each token (any case) for its target term.
    pub fn restore(&self, text: &str) -> String {
        let mut output = text.to_string();
        for (token, target) in &self.replacements {
            let Ok(pattern) = RegexBuilder::new(&regex::escape(token))
                .case_insensitive(true)
                .build()
            else {
                continue;
            };
            output = pattern.replace_all(&output, NoExpand(target)).into_owned();
        }
        output
    }
}

impl Default for Glossary {
    fn default() -> Self {
        Self::empty()
    }
}

impl Glossary {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            version: "none".to_string(),
        }
    }

    pub fn from_entries(entries: Vec<GlossaryEntry>) -> Result<Self> {
        let mut compiled = Vec::new();
        for entry in entries {
            if entry.source.trim().is_empty() {
                continue;
            }
            let pattern = if entry.regex {
                entry.source.clone()
            } else {
                regex::escape(&entry.source)
            };
            let matcher = RegexBuilder::new(&pattern)
                .case_insensitive(!entry.case_sensitive)
                .build()
                .with_context(|| format!("invalid glossary pattern: {}", entry.source))?;
            let token = glossary_token(compiled.len());
            compiled.push(CompiledEntry {
                entry,
                matcher,
                token,
            });
        }
        let version = if compiled.is_empty() {
            "none".to_string()
        } else {
            let material = compiled
                .iter()
                .map(|item| {
                    format!(
                        "{}\u{1f}{}\u{1f}{}\u{1f}{}",
                        item.entry.source,
                        item.entry.target,
                        item.entry.case_sensitive,
                        item.entry.regex
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{:x}", md5::compute(material.as_bytes()))
        };
        Ok(Self {
            entries: compiled,
            version,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read glossary: {}", path.display()))?;
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
        let glossary = if is_csv {
            Self::parse_csv(&content)
        } else {
            Self::parse_json(&content)
        }
        .with_context(|| format!("failed to parse glossary: {}", path.display()))?;
        debug!("loaded {} glossary entries from {}", glossary.len(), path.display());
        Ok(glossary)
    }

    pub fn parse_json(content: &str) -> Result<Self> {
        let entries = match serde_json::from_str::<GlossaryFile>(content)? {
            GlossaryFile::Document { entries } => entries,
            GlossaryFile::Entries(entries) => entries,
        };
        Self::from_entries(entries)
    }

    pub fn parse_csv(content: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let parts = line.split(',').map(str::trim).collect::<Vec<_>>();
            if parts.len() < 2 {
                continue;
            }
            let mut entry = GlossaryEntry::new(parts[0], parts[1]);
            if let Some(context) = parts.get(2) {
                entry.context = context.to_string();
            }
            if let Some(category) = parts.get(3).filter(|value| !value.is_empty()) {
                entry.category = category.to_string();
            }
            entries.push(entry);
        }
        Self::from_entries(entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifies the entry set; part of every cache key.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Replaces glossary terms with `ZX<letter>Z` tokens.
    pub fn protect(&self, text: &str) -> (String, GlossaryContext) {
        let mut output = text.to_string();
        let mut context = GlossaryContext::default();
        for item in &self.entries {
            if !item.matcher.is_match(&output) {
                continue;
            }
            output = item
                .matcher
                .replace_all(&output, NoExpand(&item.token))
                .into_owned();
            context
                .replacements
                .push((item.token.clone(), item.entry.target.clone()));
        }
        (output, context)
    }

    /// Glossary block for LLM prompts, or `None` when no entry applies.
    pub fn prompt_hint<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> Option<String> {
        let texts = texts.into_iter().collect::<Vec<_>>();
        let lines = self
            .entries
            .iter()
            .filter(|item| texts.iter().any(|text| item.matcher.is_match(text)))
            .map(|item| {
                let mut line = format!("- {} → {}", item.entry.source, item.entry.target);
                if !item.entry.context.trim().is_empty() {
                    line.push_str(&format!(" ({})", item.entry.context.trim()));
                }
                line
            })
            .collect::<Vec<_>>();
        if lines.is_empty() {
            return None;
        }
        Some(format!(
            "Translation glossary (use these exact translations):\n{}",
            lines.join("\n")
        ))
    }
}

fn glossary_token(index: usize) -> String {
    let letter = char::from_u32('B' as u32 + (index as u32 % TOKEN_LETTERS)).unwrap_or('B');
    if index >= TOKEN_LETTERS as usize {
        format!("ZX{}{}Z", letter, index / TOKEN_LETTERS as usize)
    } else {
        format!("ZX{}Z", letter)
    }
}
