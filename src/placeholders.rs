use regex::Regex;

use crate::error::ValidationError;

pub const DEFAULT_PATTERNS: [&str; 2] = [r"\[[^\]]+\]", r"\{[^{}]*\}"];

#[derive(Debug, Clone)]
pub struct PlaceholderRules {
    regex: Option<Regex>,
    patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedText {
    pub text: String,
    pub tokens: Vec<String>,
}

impl PlaceholderRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|pattern| pattern.as_ref().trim().to_string())
            .filter(|pattern| !pattern.is_empty())
            .collect::<Vec<_>>();
        let regex = if patterns.is_empty() {
            None
        } else {
            let joined = patterns
                .iter()
                .map(|pattern| format!("(?:{})", pattern))
                .collect::<Vec<_>>()
                .join("|");
            Some(Regex::new(&joined)?)
        };
        Ok(Self { regex, patterns })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn extract(&self, text: &str) -> Vec<String> {
        let Some(regex) = &self.regex else {
            return Vec::new();
        };
        regex
            .find_iter(text)
            .map(|found| found.as_str().to_string())
            .collect()
    }

    /// Replaces each placeholder with an indexed `<Pn>` token.
    pub fn mask(&self, text: &str) -> MaskedText {
        let Some(regex) = &self.regex else {
            return MaskedText {
                text: text.to_string(),
                tokens: Vec::new(),
            };
        };
        let mut tokens = Vec::new();
        let masked = regex.replace_all(text, |caps: &regex::Captures<'_>| {
            let token = mask_token(tokens.len());
            tokens.push(caps[0].to_string());
            token
        });
        MaskedText {
            text: masked.into_owned(),
            tokens,
        }
    }

    /// Checks that `translated` carries exactly the `expected` placeholders in order.
    pub fn validate(&self, expected: &[String], translated: &str) -> Result<(), ValidationError> {
        let found = self.extract(translated);
        if found == expected {
            return Ok(());
        }
        let placeholder = expected
            .iter()
            .zip(found.iter())
            .find(|(want, got)| want != got)
            .map(|(want, _)| want.clone())
            .or_else(|| expected.get(found.len()).cloned())
            .or_else(|| found.get(expected.len()).cloned())
            .unwrap_or_default();
        Err(ValidationError::PlaceholderMismatch {
            placeholder,
            expected: expected.to_vec(),
            found,
        })
    }
}

impl Default for PlaceholderRules {
    fn default() -> Self {
        Self::new(&DEFAULT_PATTERNS).expect("default placeholder patterns are valid")
    }
}

pub fn unmask(text: &str, tokens: &[String]) -> String {
    let mut output = text.to_string();
    for (index, original) in tokens.iter().enumerate().rev() {
        output = output.replace(&mask_token(index), original);
    }
    output
}

fn mask_token(index: usize) -> String {
    format!("<P{}>", index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_name_tags_and_formatting_codes_in_order() {
        let rules = PlaceholderRules::default();
        assert_eq!(
            rules.extract("Bye {i}end{/i}, [Name]"),
            vec!["{i}", "{/i}", "[Name]"]
        );
    }

    #[test]
    fn mask_and_unmask_restore_original_text() {
        let rules = PlaceholderRules::default();
        let masked = rules.mask("Hello [Name], {b}welcome{/b}");
        assert_eq!(masked.text, "Hello <P0>, <P1>welcome<P2>");
        assert_eq!(masked.tokens, vec!["[Name]", "{b}", "{/b}"]);
        assert_eq!(
            unmask("Bonjour <P0>, <P1>bienvenue<P2>", &masked.tokens),
            "Bonjour [Name], {b}bienvenue{/b}"
        );
    }

    #[test]
    fn unmask_handles_double_digit_tokens() {
        let tokens = (0..12).map(|i| format!("[v{}]", i)).collect::<Vec<_>>();
        assert_eq!(unmask("<P1> <P11>", &tokens), "[v1] [v11]");
    }

    #[test]
    fn validate_reports_reordered_placeholder() {
        let rules = PlaceholderRules::default();
        let expected = vec!["[A]".to_string(), "[B]".to_string()];
        let err = rules.validate(&expected, "[B] then [A]").unwrap_err();
        match err {
            ValidationError::PlaceholderMismatch { placeholder, .. } => {
                assert_eq!(placeholder, "[A]");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn validate_reports_missing_and_duplicated_placeholders() {
        let rules = PlaceholderRules::default();
        let expected = vec!["{i}".to_string(), "{/i}".to_string()];
        let missing = rules.validate(&expected, "Au revoir {i}fin").unwrap_err();
        assert!(matches!(
            missing,
            ValidationError::PlaceholderMismatch { ref placeholder, .. } if placeholder == "{/i}"
        ));

        let name = vec!["[Name]".to_string()];
        let duplicated = rules.validate(&name, "[Name] [Name]").unwrap_err();
        assert!(matches!(
            duplicated,
            ValidationError::PlaceholderMismatch { ref placeholder, .. } if placeholder == "[Name]"
        ));
        assert!(rules.validate(&name, "Bonjour [Name]").is_ok());
    }

    #[test]
    fn empty_pattern_list_protects_nothing() {
        let rules = PlaceholderRules::new::<&str>(&[]).unwrap();
        assert!(rules.extract("[Name]").is_empty());
        assert_eq!(rules.mask("[Name]").text, "[Name]");
    }
}
