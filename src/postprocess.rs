use anyhow::{Context, Result, anyhow};
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostProcessRule {
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    rules: Vec<PostProcessRule>,
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal(String),
    Pattern(Regex),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    matcher: Matcher,
    replacement: String,
}

#[derive(Debug, Clone)]
pub struct PostProcessor {
    enabled: bool,
    rules: Vec<CompiledRule>,
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

impl PostProcessor {
    pub fn new(rules: Vec<PostProcessRule>) -> Result<Self> {
        let mut compiled = Vec::new();
        for rule in rules.into_iter().filter(|rule| rule.enabled) {
            if rule.pattern.is_empty() {
                continue;
            }
            let compiled_rule = if rule.is_regex {
                let regex = Regex::new(&rule.pattern)
                    .with_context(|| format!("invalid post-processing regex: {}", rule.pattern))?;
                CompiledRule {
                    matcher: Matcher::Pattern(regex),
                    replacement: convert_replacement(&rule.replacement),
                }
            } else {
                CompiledRule {
                    matcher: Matcher::Literal(rule.pattern),
                    replacement: rule.replacement,
                }
            };
            compiled.push(compiled_rule);
        }
        Ok(Self {
            enabled: true,
            rules: compiled,
        })
    }

    /// Loads a JSON rule document, or a file of `s/pattern/replacement/` lines.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read post-processing rules: {}", path.display()))?;
        let processor = if content.trim_start().starts_with('{') {
            Self::parse_json(&content)
        } else {
            Self::parse_sed(&content)
        }
        .with_context(|| format!("failed to load post-processing rules: {}", path.display()))?;
        debug!(
            "loaded {} post-processing rules from {}",
            processor.len(),
            path.display()
        );
        Ok(processor)
    }

    pub fn parse_json(content: &str) -> Result<Self> {
        let file: RuleFile = serde_json::from_str(content)?;
        let mut processor = Self::new(file.rules)?;
        processor.enabled = file.enabled;
        Ok(processor)
    }

    pub fn parse_sed(content: &str) -> Result<Self> {
        let mut compiled = Vec::new();
        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rule = parse_sed_line(line)
                .with_context(|| format!("line {}: {}", number + 1, line))?;
            compiled.push(rule);
        }
        Ok(Self {
            enabled: true,
            rules: compiled,
        })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule in declared order, each over the full text.
    pub fn apply(&self, text: &str) -> String {
        if !self.enabled {
            return text.to_string();
        }
        let mut output = text.to_string();
        for rule in &self.rules {
            output = match &rule.matcher {
                Matcher::Literal(pattern) => output.replace(pattern.as_str(), &rule.replacement),
                Matcher::Pattern(regex) => regex
                    .replace_all(&output, rule.replacement.as_str())
                    .into_owned(),
            };
        }
        output
    }
}

fn parse_sed_line(line: &str) -> Result<CompiledRule> {
    let mut chars = line.chars();
    if chars.next() != Some('s') {
        return Err(anyhow!("expected a rule of the form s/pattern/replacement/"));
    }
    let delimiter = chars
        .next()
        .filter(|c| !c.is_alphanumeric() && *c != '\\' && !c.is_whitespace())
        .ok_or_else(|| anyhow!("missing rule delimiter"))?;
    let body = chars.as_str();
    let parts = split_unescaped(body, delimiter);
    if parts.len() < 2 {
        return Err(anyhow!("unterminated rule"));
    }
    let pattern = parts[0].clone();
    let replacement = parts[1].clone();
    let flags = parts.get(2).map(String::as_str).unwrap_or("");
    let case_insensitive = flags.contains('i');

    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(case_insensitive)
        .build()
        .with_context(|| format!("invalid post-processing regex: {}", pattern))?;
    Ok(CompiledRule {
        matcher: Matcher::Pattern(regex),
        replacement: convert_replacement(&replacement),
    })
}

/// Splits on `delimiter`, dropping the backslash of an escaped delimiter.
fn split_unescaped(body: &str, delimiter: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some(&next) if next == delimiter => {
                    current.push(next);
                    chars.next();
                }
                Some(&next) => {
                    current.push('\\');
                    current.push(next);
                    chars.next();
                }
                None => current.push('\\'),
            }
        } else if c == delimiter {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Rewrites sed/Python style `\1` and `&` into `regex` replacement syntax.
fn convert_replacement(replacement: &str) -> String {
    let mut output = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(digit) if digit.is_ascii_digit() => {
                    output.push_str(&format!("${{{}}}", digit));
                }
                Some('n') => output.push('\n'),
                Some('t') => output.push('\t'),
                Some('$') => output.push_str("$$"),
                Some(other) => output.push(other),
                None => output.push('\\'),
            },
            '&' => output.push_str("${0}"),
            '$' => output.push_str("$$"),
            _ => output.push(c),
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sed_rule_rewrites_honorific() {
        let processor = PostProcessor::parse_sed("# fixes\ns/\\bMr\\. /M. /\n").unwrap();
        assert_eq!(processor.apply("Mr. Smith"), "M. Smith");
    }

    #[test]
    fn sed_rules_support_groups_and_escaped_delimiters() {
        let processor =
            PostProcessor::parse_sed("s/(\\w+)\\/(\\w+)/\\2 \\/ \\1/g\ns|cost: (\\d+)|$\\1 total|").unwrap();
        assert_eq!(processor.apply("yes/no"), "no / yes");
        assert_eq!(processor.apply("cost: 5"), "$5 total");
    }

    #[test]
    fn rules_apply_in_declared_order_over_full_text() {
        let processor = PostProcessor::parse_json(
            r#"{
                "enabled": true,
                "rules": [
                    {"pattern": "...", "replacement": "…"},
                    {"pattern": "\\s+", "replacement": " ", "is_regex": true},
                    {"pattern": "…", "replacement": "!", "enabled": false}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(processor.len(), 2);
        assert_eq!(processor.apply("Well...   ok...  then"), "Well… ok… then");
    }

    #[test]
    fn disabled_processor_is_identity() {
        let processor = PostProcessor::parse_json(
            r#"{"enabled": false, "rules": [{"pattern": "a", "replacement": "b"}]}"#,
        )
        .unwrap();
        assert_eq!(processor.apply("banana"), "banana");
    }

    #[test]
    fn invalid_regex_is_a_load_error() {
        assert!(PostProcessor::parse_sed("s/(unclosed/x/").is_err());
        assert!(
            PostProcessor::parse_json(r#"{"rules": [{"pattern": "(", "is_regex": true}]}"#).is_err()
        );
        assert!(PostProcessor::parse_sed("not a rule").is_err());
    }
}
