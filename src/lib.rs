use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub mod batcher;
pub mod cache;
pub mod credentials;
mod dispatcher;
pub mod error;
pub mod glossary;
pub mod job;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod paths;
pub mod placeholders;
pub mod postprocess;
pub mod providers;
pub mod report;
pub mod settings;
pub mod source;
#[cfg(test)]
mod test_util;

pub use batcher::BatchLimits;
pub use cache::{CacheEntry, CacheKey, CacheStore, StoreOutcome};
pub use credentials::{CooldownPolicy, CredentialPool};
pub use error::{EngineError, EngineResult, ProviderError, ProviderErrorKind, ValidationError};
pub use glossary::{Glossary, GlossaryEntry, GlossaryMode};
pub use orchestrator::{EngineOptions, Orchestrator, RunState, StopHandle, ValidationPolicy};
pub use placeholders::PlaceholderRules;
pub use postprocess::PostProcessor;
pub use providers::{
    ItemResult, PromptTemplate, ProviderFuture, ProviderKind, ProviderRequest, TranslationProvider,
};
pub use report::{FailureReason, FailureRecord, RunReport};
pub use source::SourceString;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    pub lang: Option<String>,
    pub source_lang: Option<String>,
    pub provider: Option<String>,
    pub fallbacks: Vec<String>,
    pub keys: Vec<String>,
    pub batch: Option<usize>,
    pub max_chars: Option<usize>,
    pub workers: Option<usize>,
    pub glossary: Option<PathBuf>,
    pub glossary_mode: Option<GlossaryMode>,
    pub postprocess: Option<PathBuf>,
    pub prompt_template: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub skip_invalid: bool,
    pub settings_path: Option<String>,
}

/// Translates `config.input` and writes the mapping once the run completes.
pub async fn run(config: Config) -> Result<RunReport> {
    let settings_path = config.settings_path.as_deref().map(Path::new);
    let mut settings = settings::load_settings(settings_path)?;
    apply_overrides(&mut settings, &config);

    let target_lang = config
        .lang
        .clone()
        .or_else(|| settings.target_lang.clone())
        .filter(|lang| !lang.trim().is_empty())
        .ok_or_else(|| anyhow!("target language is required (--lang or [engine] target_lang)"))?;

    let input = source::load_input(&config.input, &settings.placeholder_patterns)?;
    if input.strings.is_empty() {
        return Err(anyhow!(
            "no translatable strings in {}",
            config.input.display()
        ));
    }

    let glossary = match settings.glossary_path.as_deref() {
        Some(path) if settings.glossary_mode != GlossaryMode::Off => Glossary::load(path)?,
        _ => Glossary::empty(),
    };
    let postprocess = match settings.postprocess_path.as_deref() {
        Some(path) => PostProcessor::load(path)?,
        None => PostProcessor::default(),
    };

    let selection = providers::resolve_provider_selection(
        config.provider.as_deref().or(settings.provider.as_deref()),
    )?;
    let keys = providers::resolve_keys(
        selection.provider,
        &config.keys,
        &settings.credential_keys,
    );
    if keys.is_empty() {
        return Err(anyhow!(
            "no API key found for {} (use --key, [credentials] keys or {})",
            selection.provider.as_str(),
            selection.provider.key_env()
        ));
    }
    let prompt = match settings.prompt_template.as_deref() {
        Some(path) => PromptTemplate::load(path)?,
        None => PromptTemplate::default(),
    };
    let provider =
        providers::build_provider(&selection, &settings, settings.request_timeout, &prompt)
            .with_context(|| "failed to build provider")?;
    let fallbacks = build_fallbacks(&settings, &prompt)?;

    let cache = Arc::new(CacheStore::open_for_input(
        &settings.cache_dir(),
        &config.input,
    ));
    let options = EngineOptions::from_settings(&settings, target_lang.clone());
    let mut orchestrator = Orchestrator::new(
        provider,
        CredentialPool::new(keys, settings.cooldown),
        cache,
        options,
    );
    for (provider, keys) in fallbacks {
        orchestrator =
            orchestrator.with_fallback(provider, CredentialPool::new(keys, settings.cooldown));
    }
    let orchestrator = orchestrator
        .with_glossary(glossary)
    .with_postprocessor(postprocess)
    .with_placeholder_rules(input.rules);

    let stop = orchestrator.stop_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted; finishing in-flight batches");
            stop.stop();
        }
    });
    let result = orchestrator.start(input.strings).await;
    interrupt.abort();

    let report = match result {
        Ok(report) => report,
        Err(EngineError::RunBlocked { report, .. }) => *report,
        Err(err) => return Err(err.into()),
    };

    if report.state == RunState::Completed {
        let output = config
            .output
            .clone()
            .unwrap_or_else(|| default_output_path(&config.input, &target_lang));
        output::write_mapping(&output, &report.output)?;
        info!(
            "wrote {} translations to {}",
            report.output.len(),
            output.display()
        );
    }
    Ok(report)
}

/// Builds each fallback provider with its own keys, in chain order.
fn build_fallbacks(
    settings: &settings::Settings,
    prompt: &PromptTemplate,
) -> Result<Vec<(providers::ProviderImpl, Vec<String>)>> {
    let mut chain = Vec::new();
    for name in &settings.fallbacks {
        let selection = providers::parse_provider_arg(name)?;
        let endpoint_keys = settings
            .providers
            .get(selection.provider.as_str())
            .map(|endpoint| endpoint.keys.as_slice())
            .unwrap_or_default();
        let keys = providers::resolve_keys(selection.provider, &[], endpoint_keys);
        if keys.is_empty() {
            return Err(anyhow!(
                "no API key found for fallback {} (use [providers.{}] keys or {})",
                name,
                selection.provider.as_str(),
                selection.provider.key_env()
            ));
        }
        let provider =
            providers::build_provider(&selection, settings, settings.request_timeout, prompt)
                .with_context(|| format!("failed to build fallback provider {}", name))?;
        info!("fallback provider {} with {} keys", provider.id(), keys.len());
        chain.push((provider, keys));
    }
    Ok(chain)
}

fn apply_overrides(settings: &mut settings::Settings, config: &Config) {
    if !config.fallbacks.is_empty() {
        settings.fallbacks = config.fallbacks.clone();
    }
    if let Some(mode) = config.glossary_mode {
        settings.glossary_mode = mode;
    }
    if let Some(path) = config.prompt_template.clone() {
        settings.prompt_template = Some(path);
    }
    if let Some(lang) = config.source_lang.clone() {
        settings.source_lang = lang;
    }
    if let Some(batch) = config.batch {
        settings.batch_size = batch;
    }
    if let Some(max_chars) = config.max_chars {
        settings.max_chars = max_chars;
    }
    if let Some(workers) = config.workers {
        settings.workers = workers;
    }
    if let Some(path) = config.glossary.clone() {
        settings.glossary_path = Some(path);
    }
    if let Some(path) = config.postprocess.clone() {
        settings.postprocess_path = Some(path);
    }
    if let Some(dir) = config.cache_dir.clone() {
        settings.cache_dir = Some(dir);
    }
    if config.skip_invalid {
        settings.validation = ValidationPolicy::Skip;
    }
}

/// `strings.json` translated to `french` lands in `strings.french.json`.
pub fn default_output_path(input: &Path, target_lang: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("strings");
    let lang = target_lang
        .trim()
        .to_lowercase()
        .replace(|c: char| !c.is_alphanumeric() && c != '-', "_");
    input.with_file_name(format!("{}.{}.json", stem, lang))
}
