use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batcher::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_CHARS};
use crate::credentials::{CooldownPolicy, DEFAULT_COOLDOWN_BASE, DEFAULT_COOLDOWN_CAP};
use crate::glossary::GlossaryMode;
use crate::orchestrator::ValidationPolicy;
use crate::paths;
use crate::placeholders::DEFAULT_PATTERNS;

const DEFAULT_SETTINGS_TOML: &str = include_str!("../settings.toml");

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Keys used when this provider serves as a fallback.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub provider: Option<String>,
    /// Providers tried in order once the primary is blocked or gives up on strings.
    pub fallbacks: Vec<String>,
    pub source_lang: String,
    pub target_lang: Option<String>,
    pub batch_size: usize,
    pub max_chars: usize,
    pub workers: usize,
    pub request_timeout: Duration,
    pub max_batch_retries: u32,
    pub flush_every: usize,
    pub mask_placeholders: bool,
    pub validation: ValidationPolicy,
    pub credential_keys: Vec<String>,
    pub cooldown: CooldownPolicy,
    pub cache_dir: Option<PathBuf>,
    pub glossary_path: Option<PathBuf>,
    pub glossary_mode: GlossaryMode,
    pub postprocess_path: Option<PathBuf>,
    pub prompt_template: Option<PathBuf>,
    pub placeholder_patterns: Vec<String>,
    pub providers: HashMap<String, ProviderEndpoint>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: None,
            fallbacks: Vec::new(),
            source_lang: "auto".to_string(),
            target_lang: None,
            batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_chars: DEFAULT_MAX_CHARS,
            workers: 5,
            request_timeout: Duration::from_secs(120),
            max_batch_retries: 8,
            flush_every: 10,
            mask_placeholders: true,
            validation: ValidationPolicy::default(),
            credential_keys: Vec::new(),
            cooldown: CooldownPolicy {
                base: DEFAULT_COOLDOWN_BASE,
                cap: DEFAULT_COOLDOWN_CAP,
            },
            cache_dir: None,
            glossary_path: None,
            glossary_mode: GlossaryMode::default(),
            postprocess_path: None,
            prompt_template: None,
            placeholder_patterns: DEFAULT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            providers: HashMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    provider: Option<String>,
    fallbacks: Option<Vec<String>>,
    engine: Option<EngineSettings>,
    credentials: Option<CredentialSettings>,
    cache: Option<CacheSettings>,
    glossary: Option<GlossarySettings>,
    postprocess: Option<PostprocessSettings>,
    prompt: Option<PromptSettings>,
    placeholders: Option<PlaceholderSettings>,
    providers: Option<HashMap<String, EndpointSettings>>,
}

#[derive(Debug, Default, Deserialize)]
struct EngineSettings {
    source_lang: Option<String>,
    target_lang: Option<String>,
    batch_size: Option<usize>,
    max_chars: Option<usize>,
    workers: Option<usize>,
    request_timeout_secs: Option<u64>,
    max_batch_retries: Option<u32>,
    flush_every: Option<usize>,
    mask_placeholders: Option<bool>,
    validation: Option<ValidationPolicy>,
}

#[derive(Debug, Default, Deserialize)]
struct CredentialSettings {
    keys: Option<Vec<String>>,
    cooldown_base_secs: Option<f64>,
    cooldown_cap_secs: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct CacheSettings {
    dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GlossarySettings {
    path: Option<String>,
    mode: Option<GlossaryMode>,
}

#[derive(Debug, Default, Deserialize)]
struct PostprocessSettings {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptSettings {
    template: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PlaceholderSettings {
    patterns: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointSettings {
    base_url: Option<String>,
    model: Option<String>,
    keys: Option<Vec<String>>,
}

pub fn load_settings(extra_path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();
    ensure_home_settings_file()?;

    let mut ordered_paths = Vec::new();
    ordered_paths.push(PathBuf::from("settings.toml"));
    ordered_paths.push(PathBuf::from("settings.local.toml"));

    if let Some(home) = paths::settings_dir() {
        ordered_paths.push(home.join("settings.toml"));
        ordered_paths.push(home.join("settings.local.toml"));
    }

    if let Some(extra) = extra_path {
        if !extra.exists() {
            return Err(anyhow!("settings file not found: {}", extra.display()));
        }
        ordered_paths.push(extra.to_path_buf());
    }

    for path in ordered_paths {
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read settings: {}", path.display()))?;
            settings
                .apply_toml(&content)
                .with_context(|| format!("failed to parse settings: {}", path.display()))?;
        }
    }

    Ok(settings)
}

impl Settings {
    pub fn apply_toml(&mut self, content: &str) -> Result<()> {
        let parsed: SettingsFile = toml::from_str(content)?;
        self.merge(parsed)
    }

    fn merge(&mut self, incoming: SettingsFile) -> Result<()> {
        if let Some(provider) = non_empty(incoming.provider) {
            self.provider = Some(provider);
        }
        if let Some(fallbacks) = incoming.fallbacks {
            self.fallbacks = non_blank(fallbacks);
        }
        if let Some(engine) = incoming.engine {
            if let Some(lang) = non_empty(engine.source_lang) {
                self.source_lang = lang;
            }
            if let Some(lang) = non_empty(engine.target_lang) {
                self.target_lang = Some(lang);
            }
            if let Some(size) = engine.batch_size {
                self.batch_size = size;
            }
            if let Some(chars) = engine.max_chars {
                self.max_chars = chars;
            }
            if let Some(workers) = engine.workers {
                self.workers = workers;
            }
            if let Some(secs) = engine.request_timeout_secs
                && secs > 0
            {
                self.request_timeout = Duration::from_secs(secs);
            }
            if let Some(retries) = engine.max_batch_retries {
                self.max_batch_retries = retries;
            }
            if let Some(every) = engine.flush_every
                && every > 0
            {
                self.flush_every = every;
            }
            if let Some(mask) = engine.mask_placeholders {
                self.mask_placeholders = mask;
            }
            if let Some(policy) = engine.validation {
                self.validation = policy;
            }
        }
        if let Some(credentials) = incoming.credentials {
            if let Some(keys) = credentials.keys {
                self.credential_keys = non_blank(keys);
            }
            let base = cooldown_duration("cooldown_base_secs", credentials.cooldown_base_secs)?;
            if let Some(base) = base {
                self.cooldown.base = base;
            }
            let cap = cooldown_duration("cooldown_cap_secs", credentials.cooldown_cap_secs)?;
            if let Some(cap) = cap {
                self.cooldown.cap = cap;
            }
        }
        if let Some(cache) = incoming.cache
            && let Some(dir) = cache.dir.as_deref().and_then(paths::resolve)
        {
            self.cache_dir = Some(dir);
        }
        if let Some(glossary) = incoming.glossary {
            if let Some(path) = glossary.path.as_deref().and_then(paths::resolve) {
                self.glossary_path = Some(path);
            }
            if let Some(mode) = glossary.mode {
                self.glossary_mode = mode;
            }
        }
        if let Some(postprocess) = incoming.postprocess
            && let Some(path) = postprocess.path.as_deref().and_then(paths::resolve)
        {
            self.postprocess_path = Some(path);
        }
        if let Some(prompt) = incoming.prompt
            && let Some(path) = prompt.template.as_deref().and_then(paths::resolve)
        {
            self.prompt_template = Some(path);
        }
        if let Some(placeholders) = incoming.placeholders
            && let Some(patterns) = placeholders.patterns
        {
            self.placeholder_patterns = patterns;
        }
        if let Some(providers) = incoming.providers {
            for (name, endpoint) in providers {
                let entry = self.providers.entry(name.to_lowercase()).or_default();
                if let Some(url) = non_empty(endpoint.base_url) {
                    entry.base_url = Some(url);
                }
                if let Some(model) = non_empty(endpoint.model) {
                    entry.model = Some(model);
                }
                if let Some(keys) = endpoint.keys {
                    entry.keys = non_blank(keys);
                }
            }
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(paths::cache_dir)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn non_blank(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .filter(|value| !value.trim().is_empty())
        .collect()
}

/// Non-positive values keep the current setting; values too large for a `Duration` are errors.
fn cooldown_duration(field: &str, secs: Option<f64>) -> Result<Option<Duration>> {
    let Some(secs) = secs.filter(|secs| !secs.is_nan() && *secs > 0.0) else {
        return Ok(None);
    };
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|err| anyhow!("[credentials] {} = {} is out of range: {}", field, secs, err))
}

fn ensure_home_settings_file() -> Result<()> {
    let Some(home) = paths::settings_dir() else {
        return Ok(());
    };
    fs::create_dir_all(&home)
        .with_context(|| format!("failed to create settings directory: {}", home.display()))?;
    let path = home.join("settings.toml");
    if !path.exists() {
        fs::write(&path, DEFAULT_SETTINGS_TOML)
            .with_context(|| format!("failed to write settings: {}", path.display()))?;
    }
    Ok(())
}
