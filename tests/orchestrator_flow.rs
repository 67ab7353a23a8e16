use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vn_translator_rust::{
    BatchLimits, CacheStore, CooldownPolicy, CredentialPool, EngineError, EngineOptions,
    ItemResult, Orchestrator, PlaceholderRules, PostProcessor, ProviderError, ProviderErrorKind,
    ProviderFuture, ProviderRequest, RunState, SourceString, TranslationProvider,
};

type Reply = dyn Fn(&str) -> Result<String, ProviderError> + Send + Sync;

#[derive(Clone)]
struct FakeProvider {
    reply: Arc<Reply>,
    requests: Arc<Mutex<Vec<Vec<String>>>>,
    calls: Arc<AtomicUsize>,
    delay: Duration,
    id: &'static str,
}

impl FakeProvider {
    fn new<F>(reply: F) -> Self
    where
        F: Fn(&str) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self {
            reply: Arc::new(reply),
            requests: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            id: "fake:v1",
        }
    }

    fn french() -> Self {
        Self::new(|text| {
            Ok(text
                .replace("Hello", "Bonjour")
                .replace("Bye", "Au revoir")
                .replace("end", "fin"))
        })
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_id(mut self, id: &'static str) -> Self {
        self.id = id;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }
}

impl TranslationProvider for FakeProvider {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn translate(&self, request: ProviderRequest) -> ProviderFuture {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.texts.clone());
        let reply = self.reply.clone();
        let delay = self.delay;
        async move {
            tokio::time::sleep(delay).await;
            let mut results: Vec<ItemResult> = Vec::new();
            for text in &request.texts {
                match reply(text) {
                    Ok(translated) => results.push(Ok(translated)),
                    Err(err) if err.kind == ProviderErrorKind::AuthError => return Err(err),
                    Err(err) => results.push(Err(err)),
                }
            }
            Ok(results)
        }
        .boxed()
    }
}

fn options(max_items: usize, max_chars: usize) -> EngineOptions {
    EngineOptions {
        target_lang: "french".to_string(),
        limits: BatchLimits {
            max_items,
            max_chars,
        },
        workers: 3,
        request_timeout: Duration::from_secs(5),
        ..EngineOptions::default()
    }
}

fn keys(secrets: &[&str]) -> CredentialPool {
    CredentialPool::new(
        secrets.iter().copied(),
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

fn mapping(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(id, text)| (id.to_string(), text.to_string()))
        .collect()
}

#[tokio::test]
async fn translates_and_restores_placeholders() {
    let provider = FakeProvider::french();
    let cache = Arc::new(CacheStore::in_memory());
    let orchestrator = Orchestrator::new(provider.clone(), keys(&["k1"]), cache.clone(), options(1, 1_000));

    let report = orchestrator
        .start(strings(&[("s1", "Hello [Name]"), ("s2", "Bye {i}end{/i}")]))
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(cache.len(), 2);
    let mut requests = provider.requests();
    requests.sort();
    assert_eq!(
        requests,
        vec![vec!["Bye <P0>end<P1>".to_string()], vec!["Hello <P0>".to_string()]]
    );
    assert_eq!(
        report.output,
        mapping(&[("s1", "Bonjour [Name]"), ("s2", "Au revoir {i}fin{/i}")])
    );
    assert_eq!(report.translated, 2);
    assert!(report.pending.is_empty());
}

#[tokio::test]
async fn second_run_is_served_from_the_cache_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.json");
    let input = strings(&[("a", "Hello"), ("b", "Bye"), ("c", "Hello [Name]")]);

    let first = FakeProvider::french();
    let report = Orchestrator::new(
        first.clone(),
        keys(&["k1"]),
        Arc::new(CacheStore::open(&path)),
        options(10, 1_000),
    )
    .start(input.clone())
    .await
    .unwrap();
    assert!(first.calls() > 0);

    let second = FakeProvider::french();
    let again = Orchestrator::new(
        second.clone(),
        keys(&["k1"]),
        Arc::new(CacheStore::open(&path)),
        options(10, 1_000),
    )
    .start(input)
    .await
    .unwrap();

    assert_eq!(second.calls(), 0);
    assert_eq!(again.cached, 3);
    assert_eq!(again.output, report.output);
}

#[tokio::test]
async fn stopped_run_resumes_with_the_remainder() {
    let provider = FakeProvider::new(|text| Ok(format!("fr {text}")))
        .with_delay(Duration::from_millis(40));
    let orchestrator = Arc::new(Orchestrator::new(
        provider.clone(),
        keys(&["k1"]),
        Arc::new(CacheStore::in_memory()),
        EngineOptions {
            workers: 1,
            ..options(1, 1_000)
        },
    ));
    let input = (0..6)
        .map(|i| (format!("s{i}"), format!("line {i}")))
        .collect::<Vec<_>>();
    let input = input
        .iter()
        .map(|(id, text)| (id.as_str(), text.as_str()))
        .collect::<Vec<_>>();

    let running = {
        let orchestrator = orchestrator.clone();
        let input = strings(&input);
        tokio::spawn(async move { orchestrator.start(input).await })
    };
    while provider.calls() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(orchestrator.stop_handle().stop());

    let stopped = running.await.unwrap().unwrap();
    assert_eq!(stopped.state, RunState::Stopped);
    assert_eq!(orchestrator.state(), RunState::Stopped);
    assert!(stopped.output.is_empty());
    assert_eq!(stopped.translated, 2);
    assert_eq!(stopped.pending.len(), 4);

    let resumed = orchestrator.resume().await.unwrap();
    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(resumed.cached, 2);
    assert_eq!(resumed.translated, 4);
    assert_eq!(provider.calls(), 6);
    let expected = input
        .iter()
        .map(|(id, text)| (id.to_string(), format!("fr {text}")))
        .collect::<BTreeMap<_, _>>();
    assert_eq!(resumed.output, expected);
}

#[tokio::test]
async fn rejected_keys_fail_the_run_with_everything_pending() {
    let provider = FakeProvider::new(|_| {
        Err(ProviderError::new(ProviderErrorKind::AuthError, "invalid api key"))
    });
    let orchestrator = Orchestrator::new(
        provider.clone(),
        keys(&["k1", "k2"]),
        Arc::new(CacheStore::in_memory()),
        options(1, 1_000),
    );

    let err = orchestrator
        .start(strings(&[("s1", "one"), ("s2", "two"), ("s3", "three")]))
        .await
        .unwrap_err();

    let EngineError::RunBlocked {
        untranslated,
        report,
    } = err
    else {
        panic!("expected a blocked run");
    };
    assert_eq!(untranslated, 3);
    assert_eq!(report.state, RunState::Failed);
    assert_eq!(report.pending, vec!["s1", "s2", "s3"]);
    assert_eq!(orchestrator.state(), RunState::Failed);
    assert!(provider.calls() >= 2);
}

#[tokio::test]
async fn batches_respect_count_and_character_limits() {
    let provider = FakeProvider::new(|text| Ok(text.to_string()));
    let long = "x".repeat(30);
    let orchestrator = Orchestrator::new(
        provider.clone(),
        keys(&["k1", "k2"]),
        Arc::new(CacheStore::in_memory()),
        options(3, 20),
    );

    let report = orchestrator
        .start(strings(&[
            ("a", "aaaa"),
            ("b", "bbbbbbbb"),
            ("c", "cc"),
            ("d", "dddd"),
            ("big", long.as_str()),
            ("e", "eeeeeeeeeeee"),
            ("f", "ffffffffff"),
        ]))
        .await
        .unwrap();

    assert_eq!(report.oversized, vec!["big"]);
    assert_eq!(report.output.len(), 7);
    for request in provider.requests() {
        let chars = request.iter().map(|text| text.chars().count()).sum::<usize>();
        assert!(!request.is_empty());
        assert!(request.len() <= 3);
        assert!(chars <= 20 || request.len() == 1, "{request:?}");
    }
}

#[tokio::test]
async fn post_processing_applies_before_emission() {
    let provider = FakeProvider::new(|_| Ok("Mr. Smith".to_string()));
    let cache = Arc::new(CacheStore::in_memory());
    let orchestrator = Orchestrator::new(provider, keys(&["k1"]), cache.clone(), options(10, 1_000))
        .with_postprocessor(PostProcessor::parse_sed(r"s/\bMr\. /M. /").unwrap());

    let report = orchestrator
        .start(strings(&[("s1", "Monsieur Smith")]))
        .await
        .unwrap();

    assert_eq!(report.output, mapping(&[("s1", "M. Smith")]));
    let cached = cache
        .lookup(&vn_translator_rust::CacheKey::derive(
            "Monsieur Smith",
            "french",
            "fake:v1",
            "none",
        ))
        .unwrap();
    assert_eq!(cached.translated, "Mr. Smith");
}

#[tokio::test]
async fn rejected_keys_fall_back_to_the_next_provider() {
    let primary = FakeProvider::new(|_| {
        Err(ProviderError::new(ProviderErrorKind::AuthError, "invalid api key"))
    });
    let backup = FakeProvider::french().with_id("fake:backup");
    let cache = Arc::new(CacheStore::in_memory());
    let orchestrator = Orchestrator::new(primary.clone(), keys(&["k1"]), cache.clone(), options(10, 1_000))
        .with_fallback(backup.clone(), keys(&["b1"]));

    let report = orchestrator
        .start(strings(&[("s1", "Hello [Name]"), ("s2", "Bye")]))
        .await
        .unwrap();

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(
        report.output,
        mapping(&[("s1", "Bonjour [Name]"), ("s2", "Au revoir")])
    );
    assert_eq!(primary.calls(), 1);
    assert_eq!(backup.calls(), 1);
    assert_eq!(orchestrator.credentials().active_count(), 0);
    let entry = cache
        .lookup(&vn_translator_rust::CacheKey::derive("Bye", "french", "fake:backup", "none"))
        .unwrap();
    assert_eq!(entry.provider, "fake:backup");
}
