use futures_util::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::ProviderError;
use crate::providers::{ItemResult, ProviderFuture, ProviderRequest, TranslationProvider};

type Reply = dyn Fn(usize, &ProviderRequest) -> Result<Vec<ItemResult>, ProviderError> + Send + Sync;

/// In-process provider whose answers come from a closure.
#[derive(Clone)]
pub(crate) struct ScriptedProvider {
    reply: Arc<Reply>,
    calls: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<(String, String)>>>,
    delays: Arc<Vec<Duration>>,
    id: String,
}

impl ScriptedProvider {
    /// `reply` gets the zero-based call number and the request.
    pub(crate) fn new<F>(reply: F) -> Self
    where
        F: Fn(usize, &ProviderRequest) -> Result<Vec<ItemResult>, ProviderError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            reply: Arc::new(reply),
            calls: Arc::new(AtomicUsize::new(0)),
            sent: Arc::new(Mutex::new(Vec::new())),
            delays: Arc::new(Vec::new()),
            id: "scripted".to_string(),
        }
    }

    /// Call `n` answers after `delays[n]`; later calls answer at once.
    pub(crate) fn with_delays(mut self, delays: Vec<Duration>) -> Self {
        self.delays = Arc::new(delays);
        self
    }

    pub(crate) fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub(crate) fn replying<F>(translate: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self::new(move |_, request| {
            Ok(request
                .texts
                .iter()
                .map(|text| Ok(translate(text)))
                .collect())
        })
    }

    pub(crate) fn echo(prefix: &str) -> Self {
        let prefix = prefix.to_string();
        Self::replying(move |text| format!("{prefix}{text}"))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, text)| text.clone())
            .collect()
    }

    /// Secrets used per sent text, in call order.
    pub(crate) fn sent_secrets(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(secret, _)| secret.clone())
            .collect()
    }
}

impl TranslationProvider for ScriptedProvider {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn translate(&self, request: ProviderRequest) -> ProviderFuture {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().extend(
            request
                .texts
                .iter()
                .map(|text| (request.secret.clone(), text.clone())),
        );
        let result = (self.reply)(call, &request);
        let delay = self.delays.get(call).copied().unwrap_or_default();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        }
        .boxed()
    }
}
