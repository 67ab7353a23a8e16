use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::batcher::{Batch, BatchItem};
use crate::cache::{CacheEntry, CacheStore};
use crate::credentials::{CredentialPool, Lease, ReleaseOutcome};
use crate::error::{ProviderError, ProviderErrorKind, ValidationError};
use crate::glossary::{Glossary, GlossaryMode};
use crate::job::{InFlight, JobState};
use crate::orchestrator::{EngineOptions, ValidationPolicy};
use crate::placeholders::{PlaceholderRules, unmask};
use crate::providers::{ItemResult, ProviderRequest, TranslationProvider};
use crate::report::FailureReason;

/// Everything a worker needs, cloned once per task.
#[derive(Debug, Clone)]
pub struct WorkerContext<P> {
    pub provider: P,
    pub provider_id: String,
    pub credentials: Arc<CredentialPool>,
    pub cache: Arc<CacheStore>,
    pub glossary: Arc<Glossary>,
    pub rules: Arc<PlaceholderRules>,
    pub options: Arc<EngineOptions>,
}

/// Runs the worker pool until the job drains or is cancelled.
pub async fn run_workers<P: TranslationProvider>(ctx: WorkerContext<P>, job: Arc<JobState>) {
    let mut workers = JoinSet::new();
    for worker in 0..ctx.options.workers.max(1) {
        workers.spawn(worker_loop(worker, ctx.clone(), job.clone()));
    }
    while let Some(result) = workers.join_next().await {
        if let Err(err) = result {
            error!("translation worker failed: {}", err);
        }
    }
}

async fn worker_loop<P: TranslationProvider>(
    worker: usize,
    ctx: WorkerContext<P>,
    job: Arc<JobState>,
) {
    debug!("worker {} started", worker);
    while let Some(batch) = job.next_batch().await {
        let _slot = InFlight::new(&job);
        let ids = batch.ids().map(str::to_string).collect::<Vec<_>>();
        let outcome = AssertUnwindSafe(process_batch(&ctx, &job, batch))
            .catch_unwind()
            .await;
        if let Err(panic) = outcome {
            let message = panic_message(panic.as_ref());
            error!(
                "worker {} panicked on a batch of {} items: {}",
                worker,
                ids.len(),
                message
            );
            job.record_failure(
                ids.iter().map(String::as_str),
                FailureReason::provider(
                    ProviderErrorKind::Unknown,
                    format!("worker panicked: {}", message),
                ),
            );
        }
    }
    debug!("worker {} finished", worker);
}

async fn process_batch<P: TranslationProvider>(
    ctx: &WorkerContext<P>,
    job: &JobState,
    batch: Batch,
) {
    let lease = tokio::select! {
        biased;
        _ = job.cancelled() => {
            job.requeue(batch);
            return;
        }
        lease = ctx.credentials.acquire() => lease,
    };
    let lease = match lease {
        Ok(lease) => lease,
        Err(blocked) => {
            warn!("{}; stopping the run", blocked);
            job.requeue(batch);
            job.mark_blocked();
            return;
        }
    };

    let request = ProviderRequest {
        texts: batch.items.iter().map(|item| item.payload.clone()).collect(),
        source_lang: ctx.options.source_lang.clone(),
        target_lang: batch.target_lang.clone(),
        secret: lease.secret.clone(),
        glossary_hint: glossary_hint(ctx, &batch),
    };
    job.record_call();
    debug!(
        "sending batch of {} items ({} chars) with {}",
        batch.len(),
        batch.char_count,
        lease.id
    );
    let response = match timeout(ctx.options.request_timeout, ctx.provider.translate(request)).await
    {
        Ok(response) => response,
        Err(_) => Err(ProviderError::new(
            ProviderErrorKind::Timeout,
            format!(
                "request timed out after {:.0}s",
                ctx.options.request_timeout.as_secs_f64()
            ),
        )),
    };

    match response {
        Err(err) => handle_call_error(ctx, job, batch, &lease, err),
        Ok(results) if results.len() != batch.len() => {
            ctx.credentials.release(&lease, release_outcome(&results));
            handle_count_mismatch(ctx, job, batch, results.len());
        }
        Ok(results) => {
            ctx.credentials.release(&lease, release_outcome(&results));
            apply_results(ctx, job, batch, results);
            let completed = job.complete_batch();
            if completed % ctx.options.flush_every.max(1) == 0 {
                flush_cache(&ctx.cache);
            }
        }
    }
}

/// A rate-limited item cools the key down just like a rate-limited call.
fn release_outcome(results: &[ItemResult]) -> ReleaseOutcome {
    results
        .iter()
        .find_map(|result| match result {
            Err(err) if err.kind == ProviderErrorKind::RateLimited => {
                Some(ReleaseOutcome::RateLimited {
                    retry_after: err.retry_after,
                })
            }
            _ => None,
        })
        .unwrap_or(ReleaseOutcome::Success)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn glossary_hint<P>(ctx: &WorkerContext<P>, batch: &Batch) -> Option<String> {
    if ctx.options.glossary_mode != GlossaryMode::Hint {
        return None;
    }
    ctx.glossary
        .prompt_hint(batch.items.iter().map(|item| item.source.as_str()))
}

fn handle_call_error<P>(
    ctx: &WorkerContext<P>,
    job: &JobState,
    batch: Batch,
    lease: &Lease,
    err: ProviderError,
) {
    match err.kind {
        ProviderErrorKind::RateLimited => {
            ctx.credentials.release(
                lease,
                ReleaseOutcome::RateLimited {
                    retry_after: err.retry_after,
                },
            );
            retry_batch(ctx, job, batch, &err);
        }
        ProviderErrorKind::AuthError => {
            ctx.credentials.release(lease, ReleaseOutcome::AuthError);
            warn!("{} rejected by provider: {}", lease.id, err.message);
            job.requeue(batch);
        }
        ProviderErrorKind::Timeout | ProviderErrorKind::Unknown => {
            ctx.credentials.release(lease, ReleaseOutcome::Transient);
            retry_batch(ctx, job, batch, &err);
        }
        ProviderErrorKind::InvalidRequest => {
            ctx.credentials.release(lease, ReleaseOutcome::Transient);
            let reason = if batch.oversized {
                let chars = batch.char_count;
                FailureReason::validation(&ValidationError::Oversized {
                    chars,
                    limit: ctx.options.limits.max_chars,
                })
            } else {
                FailureReason::provider(err.kind, err.message.clone())
            };
            error!("batch of {} items rejected: {}", batch.len(), err);
            job.record_failure(batch.ids(), reason);
        }
    }
}

fn retry_batch<P>(ctx: &WorkerContext<P>, job: &JobState, mut batch: Batch, err: &ProviderError) {
    batch.attempts += 1;
    if batch.attempts > ctx.options.max_batch_retries {
        error!(
            "giving up on batch of {} items after {} attempts: {}",
            batch.len(),
            batch.attempts,
            err
        );
        job.record_failure(
            batch.ids(),
            FailureReason::RetriesExhausted {
                attempts: batch.attempts,
            },
        );
        return;
    }
    warn!(
        "batch of {} items failed ({}); retry {}/{}",
        batch.len(),
        err,
        batch.attempts,
        ctx.options.max_batch_retries
    );
    job.requeue(batch);
}

fn handle_count_mismatch<P>(ctx: &WorkerContext<P>, job: &JobState, batch: Batch, received: usize) {
    if batch.len() < 2 {
        let err = ProviderError::new(
            ProviderErrorKind::Unknown,
            format!("provider returned {} items for a single string", received),
        );
        retry_batch(ctx, job, batch, &err);
        return;
    }
    warn!(
        "provider returned {} items for a batch of {}; splitting",
        received,
        batch.len()
    );
    if let Some((first, second)) = batch.split() {
        job.requeue(second);
        job.requeue(first);
    }
}

fn apply_results<P>(
    ctx: &WorkerContext<P>,
    job: &JobState,
    batch: Batch,
    results: Vec<ItemResult>,
) {
    let target_lang = batch.target_lang.clone();
    let attempts = batch.attempts;
    let mut retry: Vec<BatchItem> = Vec::new();
    let mut last_error: Option<ProviderError> = None;

    for (item, result) in batch.items.into_iter().zip(results) {
        match result {
            Ok(text) => accept_translation(ctx, job, &item, &text),
            Err(err) if err.kind.is_transient() => {
                debug!("item {} will be retried: {}", item.key.as_str(), err);
                last_error = Some(err);
                retry.push(item);
            }
            Err(err) => {
                warn!("item failed permanently: {}", err);
                job.record_failure(
                    item.ids.iter().map(String::as_str),
                    FailureReason::provider(err.kind, err.message),
                );
            }
        }
    }

    if let Some(err) = last_error {
        let retry = Batch::from_items(retry, &target_lang, attempts);
        retry_batch(ctx, job, retry, &err);
    }
}

fn accept_translation<P>(ctx: &WorkerContext<P>, job: &JobState, item: &BatchItem, text: &str) {
    let restored = unmask(&item.glossary.restore(text), &item.tokens);
    if let Err(err) = ctx.rules.validate(&item.placeholders, &restored) {
        warn!("translation of {} rejected: {}", item.ids.join(","), err);
        if ctx.options.validation == ValidationPolicy::Skip {
            ctx.cache.reject(&item.key, err.to_string());
        }
        job.record_failure(
            item.ids.iter().map(String::as_str),
            FailureReason::validation(&err),
        );
        return;
    }
    let outcome = ctx.cache.store(CacheEntry::new(
        item.key.clone(),
        restored,
        ctx.provider_id.clone(),
    ));
    if !outcome.is_success() {
        debug!("kept earlier translation for {}", item.key.as_str());
    }
    job.add_translated(item.ids.len());
}

pub(crate) fn flush_cache(cache: &CacheStore) {
    match cache.flush() {
        Ok(()) => {}
        Err(err) => warn!("cache flush failed: {:#}", err),
    }
}

pub(crate) fn log_credentials(credentials: &CredentialPool) {
    for credential in credentials.snapshot() {
        info!("{} is {:?}", credential.id, credential.state);
    }
}
