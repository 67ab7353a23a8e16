use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

use crate::batcher::{BatchItem, BatchLimits, Batcher};
use crate::cache::{CacheKey, CacheStore};
use crate::credentials::CredentialPool;
use crate::dispatcher::{self, WorkerContext};
use crate::error::{EngineError, EngineResult};
use crate::glossary::{Glossary, GlossaryContext, GlossaryMode};
use crate::job::JobState;
use crate::placeholders::{MaskedText, PlaceholderRules};
use crate::postprocess::PostProcessor;
use crate::providers::TranslationProvider;
use crate::report::{FailureReason, FailureRecord, RunReport};
use crate::settings::Settings;
use crate::source::SourceString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Stopping => "stopping",
            RunState::Stopped => "stopped",
            RunState::Completed => "completed",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What happens to a string whose translation broke its placeholders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationPolicy {
    /// Leave it untranslated so the next run tries again.
    #[default]
    Retry,
    /// Remember the rejection in the cache and skip it from then on.
    Skip,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub source_lang: String,
    pub target_lang: String,
    pub limits: BatchLimits,
    pub workers: usize,
    pub request_timeout: Duration,
    pub max_batch_retries: u32,
    pub flush_every: usize,
    pub mask_placeholders: bool,
    pub validation: ValidationPolicy,
    pub glossary_mode: GlossaryMode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default(), "english")
    }
}

impl EngineOptions {
    pub fn from_settings(settings: &Settings, target_lang: impl Into<String>) -> Self {
        Self {
            source_lang: settings.source_lang.clone(),
            target_lang: target_lang.into(),
            limits: BatchLimits {
                max_items: settings.batch_size,
                max_chars: settings.max_chars,
            },
            workers: settings.workers,
            request_timeout: settings.request_timeout,
            max_batch_retries: settings.max_batch_retries,
            flush_every: settings.flush_every,
            mask_placeholders: settings.mask_placeholders,
            validation: settings.validation,
            glossary_mode: settings.glossary_mode,
        }
    }

    fn validate<'a>(
        &self,
        pools: impl IntoIterator<Item = &'a CredentialPool>,
    ) -> EngineResult<()> {
        if self.workers == 0 {
            return Err(EngineError::FatalConfig("worker count must be at least 1".into()));
        }
        if self.limits.max_items == 0 {
            return Err(EngineError::FatalConfig("batch size must be at least 1".into()));
        }
        if self.limits.max_chars == 0 {
            return Err(EngineError::FatalConfig(
                "max characters per batch must be at least 1".into(),
            ));
        }
        if self.target_lang.trim().is_empty() {
            return Err(EngineError::FatalConfig("target language is empty".into()));
        }
        if pools.into_iter().any(CredentialPool::is_empty) {
            return Err(EngineError::FatalConfig("no API keys configured".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    state: RunState,
    job: Option<Arc<JobState>>,
}

/// Stops a running translation from another task.
#[derive(Debug, Clone)]
pub struct StopHandle {
    shared: Arc<Mutex<Shared>>,
}

impl StopHandle {
    /// Returns `false` when no run is in progress.
    pub fn stop(&self) -> bool {
        let mut shared = lock(&self.shared);
        if shared.state != RunState::Running {
            return false;
        }
        shared.state = RunState::Stopping;
        if let Some(job) = &shared.job {
            job.request_stop();
        }
        info!("stop requested; waiting for in-flight batches");
        true
    }
}

/// One link of the provider chain with its own keys.
struct Stage<P> {
    provider: P,
    credentials: Arc<CredentialPool>,
}

struct Group<'a> {
    /// Cache key under each provider of the chain, in chain order.
    keys: Vec<CacheKey>,
    strings: Vec<&'a SourceString>,
}

impl Group<'_> {
    fn ids(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(|string| string.id())
    }

    fn cached_key(&self, cache: &CacheStore) -> Option<&CacheKey> {
        self.keys.iter().find(|key| cache.contains(key))
    }
}

pub struct Orchestrator<P> {
    stages: Vec<Stage<P>>,
    options: Arc<EngineOptions>,
    cache: Arc<CacheStore>,
    glossary: Arc<Glossary>,
    postprocess: PostProcessor,
    rules: Arc<PlaceholderRules>,
    shared: Arc<Mutex<Shared>>,
    extracted: Mutex<Vec<SourceString>>,
}

impl<P: TranslationProvider> Orchestrator<P> {
    pub fn new(
        provider: P,
        credentials: CredentialPool,
        cache: Arc<CacheStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            stages: vec![Stage {
                provider,
                credentials: Arc::new(credentials),
            }],
            options: Arc::new(options),
            cache,
            glossary: Arc::new(Glossary::empty()),
            postprocess: PostProcessor::default(),
            rules: Arc::new(PlaceholderRules::default()),
            shared: Arc::new(Mutex::new(Shared {
                state: RunState::Idle,
                job: None,
            })),
            extracted: Mutex::new(Vec::new()),
        }
    }

    /// Appends a provider that takes over strings the earlier ones could not translate.
    pub fn with_fallback(mut self, provider: P, credentials: CredentialPool) -> Self {
        self.stages.push(Stage {
            provider,
            credentials: Arc::new(credentials),
        });
        self
    }

    pub fn with_glossary(mut self, glossary: Glossary) -> Self {
        self.glossary = Arc::new(glossary);
        self
    }

    pub fn with_postprocessor(mut self, postprocess: PostProcessor) -> Self {
        self.postprocess = postprocess;
        self
    }

    pub fn with_placeholder_rules(mut self, rules: PlaceholderRules) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn state(&self) -> RunState {
        lock(&self.shared).state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn stop(&self) -> bool {
        self.stop_handle().stop()
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Keys of the primary provider.
    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.stages[0].credentials
    }

    /// Translates `strings`, serving cache hits first.
    pub async fn start(&self, strings: Vec<SourceString>) -> EngineResult<RunReport> {
        self.enter("start", &[RunState::Idle, RunState::Completed, RunState::Failed])?;
        *self
            .extracted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = strings;
        self.run_pass().await
    }

    /// Continues a stopped or failed run; the cache decides what is left.
    pub async fn resume(&self) -> EngineResult<RunReport> {
        self.enter("resume", &[RunState::Stopped, RunState::Failed])?;
        self.run_pass().await
    }

    fn enter(&self, action: &'static str, allowed: &[RunState]) -> EngineResult<()> {
        let mut shared = lock(&self.shared);
        if !allowed.contains(&shared.state) {
            return Err(EngineError::InvalidState {
                action,
                state: shared.state,
            });
        }
        let pools = self.stages.iter().map(|stage| stage.credentials.as_ref());
        if let Err(err) = self.options.validate(pools) {
            shared.state = RunState::Failed;
            return Err(err);
        }
        shared.state = RunState::Running;
        Ok(())
    }

    async fn run_pass(&self) -> EngineResult<RunReport> {
        for stage in &self.stages {
            stage.credentials.reset();
        }
        let extracted = self
            .extracted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let provider_ids = self
            .stages
            .iter()
            .map(|stage| stage.provider.id())
            .collect::<Vec<_>>();
        let glossary_version = match self.options.glossary_mode {
            GlossaryMode::Off => "none".to_string(),
            _ => self.glossary.version().to_string(),
        };

        let groups = group_by_key(&extracted, &self.options.target_lang, &provider_ids, &glossary_version);
        let mut report = RunReport::empty(RunState::Running);
        report.total = extracted.len();

        let mut failures: Vec<FailureRecord> = Vec::new();
        let mut queued = Vec::new();
        for group in &groups {
            if group.cached_key(&self.cache).is_some() {
                report.cached += group.strings.len();
                continue;
            }
            if self.options.validation == ValidationPolicy::Skip
                && group.keys.iter().any(|key| self.cache.is_rejected(key))
            {
                failures.extend(group.ids().map(|id| FailureRecord {
                    id: id.to_string(),
                    reason: FailureReason::Skipped {
                        message: "placeholder validation".to_string(),
                    },
                }));
                continue;
            }
            queued.push(group);
        }
        info!(
            "{} strings: {} cached, {} queued in {} unique texts",
            extracted.len(),
            report.cached,
            queued.iter().map(|group| group.strings.len()).sum::<usize>(),
            queued.len()
        );

        let mut stopped = false;
        for (position, stage) in self.stages.iter().enumerate() {
            let remaining = queued
                .iter()
                .copied()
                .filter(|group| group.cached_key(&self.cache).is_none())
                .collect::<Vec<_>>();
            if remaining.is_empty() {
                break;
            }
            if position > 0 {
                warn!(
                    "{} unique texts left; falling back to {}",
                    remaining.len(),
                    provider_ids[position]
                );
            }
            let handed = remaining
                .iter()
                .flat_map(|group| group.ids())
                .collect::<HashSet<_>>();
            failures.retain(|failure| !handed.contains(failure.id.as_str()));

            let job = self
                .run_stage(stage, position, &provider_ids[position], &remaining, &mut report)
                .await;
            report.translated += job.translated();
            report.provider_calls += job.provider_calls();
            failures.extend(job.failures());
            if job.stop_requested() {
                stopped = true;
                break;
            }
        }

        let failed_ids = failures
            .iter()
            .map(|failure| failure.id.as_str())
            .collect::<HashSet<_>>();
        let pending = groups
            .iter()
            .filter(|group| group.cached_key(&self.cache).is_none())
            .flat_map(|group| group.ids())
            .filter(|id| !failed_ids.contains(id))
            .map(str::to_string)
            .collect::<Vec<_>>();
        report.failed = failed_ids.len();
        report.failures = failures;
        report.cache_warnings = self.cache.warnings();

        let final_state = settle(stopped, &pending);
        report.pending = pending;
        report.state = final_state;
        if final_state == RunState::Completed {
            report.output = self.assemble_output(&groups);
        }

        {
            let mut shared = lock(&self.shared);
            shared.state = final_state;
            shared.job = None;
        }
        info!("{}", report.format_summary());

        if final_state == RunState::Failed {
            return Err(EngineError::RunBlocked {
                untranslated: report.pending.len(),
                report: Box::new(report),
            });
        }
        Ok(report)
    }

    /// Sends `groups` through one provider of the chain and returns the finished job.
    async fn run_stage(
        &self,
        stage: &Stage<P>,
        position: usize,
        provider_id: &str,
        groups: &[&Group<'_>],
        report: &mut RunReport,
    ) -> Arc<JobState> {
        let mut batcher = Batcher::new(self.options.limits, self.options.target_lang.clone());
        for group in groups {
            let item = self.build_item(group, &group.keys[position]);
            if position == 0 && item.char_len() > self.options.limits.max_chars {
                warn!(
                    "string {} has {} characters and will be sent alone",
                    item.ids.join(","),
                    item.char_len()
                );
                report.oversized.extend(item.ids.iter().cloned());
            }
            batcher.enqueue([item]);
        }

        let job = Arc::new(JobState::new(batcher));
        {
            let mut shared = lock(&self.shared);
            if shared.state == RunState::Stopping {
                job.request_stop();
            }
            shared.job = Some(job.clone());
        }

        let ctx = WorkerContext {
            provider: stage.provider.clone(),
            provider_id: provider_id.to_string(),
            credentials: stage.credentials.clone(),
            cache: self.cache.clone(),
            glossary: self.glossary.clone(),
            rules: self.rules.clone(),
            options: self.options.clone(),
        };
        dispatcher::run_workers(ctx, job.clone()).await;
        dispatcher::flush_cache(&self.cache);
        dispatcher::log_credentials(&stage.credentials);
        job
    }

    fn build_item(&self, group: &Group<'_>, key: &CacheKey) -> BatchItem {
        let first = group.strings[0];
        let masked = if self.options.mask_placeholders {
            self.rules.mask(first.text())
        } else {
            MaskedText {
                text: first.text().to_string(),
                tokens: Vec::new(),
            }
        };
        let (payload, glossary) = if self.options.glossary_mode == GlossaryMode::Mask {
            self.glossary.protect(&masked.text)
        } else {
            (masked.text, GlossaryContext::default())
        };
        BatchItem {
            key: key.clone(),
            ids: group.ids().map(str::to_string).collect(),
            source: first.text().to_string(),
            payload,
            placeholders: first.placeholders().to_vec(),
            tokens: masked.tokens,
            glossary,
        }
    }

    fn assemble_output(&self, groups: &[Group<'_>]) -> BTreeMap<String, String> {
        let mut output = BTreeMap::new();
        for group in groups {
            let Some(entry) = group
                .cached_key(&self.cache)
                .and_then(|key| self.cache.lookup(key))
            else {
                continue;
            };
            let text = self.postprocess.apply(&entry.translated);
            for string in &group.strings {
                output.insert(string.id().to_string(), text.clone());
            }
        }
        output
    }
}

/// A stop or an empty remainder ends the run cleanly; anything left otherwise is a failure.
fn settle(stopped: bool, pending: &[String]) -> RunState {
    if pending.is_empty() {
        RunState::Completed
    } else if stopped {
        RunState::Stopped
    } else {
        RunState::Failed
    }
}

fn group_by_key<'a>(
    strings: &'a [SourceString],
    target_lang: &str,
    provider_ids: &[String],
    glossary_version: &str,
) -> Vec<Group<'a>> {
    let mut groups: Vec<Group<'a>> = Vec::new();
    let mut index: HashMap<CacheKey, usize> = HashMap::new();
    for string in strings {
        let keys = provider_ids
            .iter()
            .map(|id| CacheKey::derive(string.text(), target_lang, id, glossary_version))
            .collect::<Vec<_>>();
        match index.get(&keys[0]) {
            Some(&position) => groups[position].strings.push(string),
            None => {
                index.insert(keys[0].clone(), groups.len());
                groups.push(Group {
                    keys,
                    strings: vec![string],
                });
            }
        }
    }
    groups
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CooldownPolicy;
    use crate::test_util::ScriptedProvider;

    fn options(batch: usize) -> EngineOptions {
        EngineOptions {
            limits: BatchLimits {
                max_items: batch,
                max_chars: 1_000,
            },
            workers: 2,
            request_timeout: Duration::from_secs(5),
            max_batch_retries: 2,
            ..EngineOptions::from_settings(&Settings::default(), "french")
        }
    }

    fn pool(keys: &[&str]) -> CredentialPool {
        CredentialPool::new(
            keys.iter().copied(),
            CooldownPolicy {
                base: Duration::from_millis(5),
                cap: Duration::from_millis(20),
            },
        )
    }

    fn strings(items: &[(&str, &str)]) -> Vec<SourceString> {
        let rules = PlaceholderRules::default();
        items
            .iter()
            .map(|(id, text)| SourceString::new(*id, *text, &rules))
            .collect()
    }

    #[tokio::test]
    async fn fatal_config_fails_before_dispatch() {
        let provider = ScriptedProvider::echo("[fr] ");
        let orchestrator = Orchestrator::new(
            provider.clone(),
            pool(&[]),
            Arc::new(CacheStore::in_memory()),
            options(10),
        );
        let err = orchestrator.start(strings(&[("s1", "Hello")])).await.unwrap_err();
        assert!(matches!(err, EngineError::FatalConfig(_)));
        assert_eq!(orchestrator.state(), RunState::Failed);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn resume_is_rejected_while_idle() {
        let orchestrator = Orchestrator::new(
            ScriptedProvider::echo(""),
            pool(&["k"]),
            Arc::new(CacheStore::in_memory()),
            options(10),
        );
        let err = orchestrator.resume().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                state: RunState::Idle,
                ..
            }
        ));
        assert!(!orchestrator.stop());
    }

    #[tokio::test]
    async fn duplicate_texts_are_translated_once() {
        let provider = ScriptedProvider::echo("[fr] ");
        let orchestrator = Orchestrator::new(
            provider.clone(),
            pool(&["k"]),
            Arc::new(CacheStore::in_memory()),
            options(10),
        );
        let report = orchestrator
            .start(strings(&[("a", "Hello"), ("b", "Hello "), ("c", "Bye")]))
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(provider.sent_texts(), vec!["Hello", "Bye"]);
        assert_eq!(report.output["a"], "[fr] Hello");
        assert_eq!(report.output["b"], "[fr] Hello");
        assert_eq!(report.translated, 3);
    }

    #[tokio::test]
    async fn glossary_terms_are_masked_and_restored() {
        let provider = ScriptedProvider::echo("");
        let orchestrator = Orchestrator::new(
            provider.clone(),
            pool(&["k"]),
            Arc::new(CacheStore::in_memory()),
            options(10),
        )
        .with_glossary(
            Glossary::from_entries(vec![crate::glossary::GlossaryEntry::new(
                "Sakura", "Sakura-san",
            )])
            .unwrap(),
        );
        let report = orchestrator
            .start(strings(&[("s1", "[Name] meets Sakura")]))
            .await
            .unwrap();
        assert_eq!(provider.sent_texts(), vec!["<P0> meets ZXBZ"]);
        assert_eq!(report.output["s1"], "[Name] meets Sakura-san");
    }

    #[tokio::test]
    async fn skip_policy_records_rejections() {
        let provider = ScriptedProvider::replying(|text| text.replace("<P0>", ""));
        let cache = Arc::new(CacheStore::in_memory());
        let orchestrator = Orchestrator::new(
            provider.clone(),
            pool(&["k"]),
            cache.clone(),
            EngineOptions {
                validation: ValidationPolicy::Skip,
                ..options(10)
            },
        );
        let report = orchestrator
            .start(strings(&[("s1", "Hi [Name]"), ("s2", "Plain")]))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!(!report.output.contains_key("s1"));
        assert_eq!(report.output["s2"], "Plain");

        let again = orchestrator
            .start(strings(&[("s1", "Hi [Name]"), ("s2", "Plain")]))
            .await
            .unwrap();
        assert_eq!(provider.calls(), 1);
        assert!(matches!(
            again.failures[0].reason,
            FailureReason::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn huge_retry_after_still_completes() {
        let provider = ScriptedProvider::new(|call, request| {
            if call == 0 {
                return Err(crate::error::ProviderError::new(
                    crate::error::ProviderErrorKind::RateLimited,
                    "slow down",
                )
                .with_retry_after(Some(Duration::from_secs(u64::MAX))));
            }
            Ok(request.texts.iter().map(|text| Ok(format!("fr {text}"))).collect())
        });
        let orchestrator = Orchestrator::new(
            provider.clone(),
            pool(&["k1", "k2"]),
            Arc::new(CacheStore::in_memory()),
            EngineOptions {
                workers: 1,
                ..options(10)
            },
        );
        let report = orchestrator
            .start(strings(&[("s1", "one"), ("s2", "two")]))
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert!(report.pending.is_empty());
        assert_eq!(report.output["s1"], "fr one");
        assert_eq!(report.output["s2"], "fr two");
        assert_eq!(provider.sent_secrets(), vec!["k1", "k1", "k2", "k2"]);
    }

    #[test]
    fn leftover_strings_never_complete() {
        let left = vec!["s1".to_string()];
        assert_eq!(settle(false, &[]), RunState::Completed);
        assert_eq!(settle(true, &[]), RunState::Completed);
        assert_eq!(settle(true, &left), RunState::Stopped);
        assert_eq!(settle(false, &left), RunState::Failed);
    }

    #[tokio::test]
    async fn blocked_primary_hands_over_to_the_fallback() {
        let primary = ScriptedProvider::new(|_, _| {
            Err(crate::error::ProviderError::new(
                crate::error::ProviderErrorKind::AuthError,
                "invalid api key",
            ))
        })
        .with_id("primary");
        let backup = ScriptedProvider::echo("[fb] ").with_id("backup");
        let cache = Arc::new(CacheStore::in_memory());
        let orchestrator = Orchestrator::new(primary.clone(), pool(&["p1"]), cache.clone(), options(10))
            .with_fallback(backup.clone(), pool(&["b1"]));

        let report = orchestrator
            .start(strings(&[("s1", "Hello"), ("s2", "Bye")]))
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.output["s1"], "[fb] Hello");
        assert_eq!(report.output["s2"], "[fb] Bye");
        assert!(report.failures.is_empty());
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.sent_secrets(), vec!["b1", "b1"]);
        let key = CacheKey::derive("Hello", "french", "backup", "none");
        assert_eq!(cache.lookup(&key).unwrap().provider, "backup");

        let again = Orchestrator::new(primary.clone(), pool(&["p1"]), cache, options(10))
            .with_fallback(backup.clone(), pool(&["b1"]))
            .start(strings(&[("s1", "Hello"), ("s2", "Bye")]))
            .await
            .unwrap();
        assert_eq!(again.cached, 2);
        assert_eq!(primary.calls(), 1);
        assert_eq!(backup.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_failures_go_to_the_next_provider() {
        let primary = ScriptedProvider::new(|_, request| {
            Ok(request
                .texts
                .iter()
                .map(|text| match text.as_str() {
                    "refused" => Err(crate::error::ProviderError::new(
                        crate::error::ProviderErrorKind::InvalidRequest,
                        "content filter",
                    )),
                    _ => Ok(format!("[p] {text}")),
                })
                .collect())
        })
        .with_id("primary");
        let backup = ScriptedProvider::echo("[fb] ").with_id("backup");
        let orchestrator = Orchestrator::new(
            primary.clone(),
            pool(&["p1"]),
            Arc::new(CacheStore::in_memory()),
            options(10),
        )
        .with_fallback(backup.clone(), pool(&["b1"]));

        let report = orchestrator
            .start(strings(&[("s1", "fine"), ("s2", "refused")]))
            .await
            .unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.output["s1"], "[p] fine");
        assert_eq!(report.output["s2"], "[fb] refused");
        assert_eq!(report.failed, 0);
        assert_eq!(report.translated, 2);
        assert_eq!(report.provider_calls, 2);
        assert_eq!(backup.sent_texts(), vec!["refused"]);
    }

    #[tokio::test]
    async fn exhausted_chain_keeps_the_last_outcome() {
        let refuse = |_: usize, _: &crate::providers::ProviderRequest| {
            Err(crate::error::ProviderError::new(
                crate::error::ProviderErrorKind::InvalidRequest,
                "content filter",
            ))
        };
        let blocked = |_: usize, _: &crate::providers::ProviderRequest| {
            Err(crate::error::ProviderError::new(
                crate::error::ProviderErrorKind::AuthError,
                "invalid api key",
            ))
        };
        let orchestrator = Orchestrator::new(
            ScriptedProvider::new(refuse).with_id("primary"),
            pool(&["p1"]),
            Arc::new(CacheStore::in_memory()),
            options(10),
        )
        .with_fallback(ScriptedProvider::new(blocked).with_id("backup"), pool(&["b1"]));

        let err = orchestrator
            .start(strings(&[("s1", "one")]))
            .await
            .unwrap_err();
        let EngineError::RunBlocked { report, .. } = err else {
            panic!("expected a blocked run");
        };
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.pending, vec!["s1"]);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn fallback_without_keys_is_a_config_error() {
        let orchestrator = Orchestrator::new(
            ScriptedProvider::echo(""),
            pool(&["k"]),
            Arc::new(CacheStore::in_memory()),
            options(10),
        )
        .with_fallback(ScriptedProvider::echo("").with_id("backup"), pool(&[]));
        let err = orchestrator.start(strings(&[("s1", "one")])).await.unwrap_err();
        assert!(matches!(err, EngineError::FatalConfig(_)));
    }
}
