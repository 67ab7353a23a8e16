use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

pub const DEFAULT_COOLDOWN_BASE: Duration = Duration::from_secs(2);
pub const DEFAULT_COOLDOWN_CAP: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Active,
    CoolingDown,
    Exhausted,
}

#[derive(Clone)]
pub struct Credential {
    pub id: String,
    secret: String,
    pub state: CredentialState,
    pub cooldown_until: Option<Instant>,
    pub consecutive_rate_limits: u32,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("cooldown_until", &self.cooldown_until)
            .field("consecutive_rate_limits", &self.consecutive_rate_limits)
            .finish()
    }
}

#[derive(Clone)]
pub struct Lease {
    index: usize,
    pub id: String,
    pub secret: String,
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Success,
    RateLimited { retry_after: Option<Duration> },
    AuthError,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no usable credential: every key is exhausted")]
pub struct Blocked;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_COOLDOWN_BASE,
            cap: DEFAULT_COOLDOWN_CAP,
        }
    }
}

impl CooldownPolicy {
    /// Cooldown after `previous` consecutive rate limits; a longer `retry_after` wins,
    /// up to ten times the cap.
    pub fn window(&self, previous: u32, retry_after: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(previous.min(31)).unwrap_or(u32::MAX);
        let backoff = self.base.saturating_mul(factor).min(self.cap);
        match retry_after {
            Some(hint) if hint > backoff => hint.min(self.cap.saturating_mul(10)).max(backoff),
            _ => backoff,
        }
    }
}

#[derive(Debug)]
struct PoolInner {
    credentials: Vec<Credential>,
    cursor: usize,
}

enum Pick {
    Ready(Lease),
    WaitUntil(Instant),
    Blocked,
}

#[derive(Debug)]
pub struct CredentialPool {
    inner: Mutex<PoolInner>,
    changed: Notify,
    policy: CooldownPolicy,
}

impl CredentialPool {
    pub fn new<S: Into<String>>(secrets: impl IntoIterator<Item = S>, policy: CooldownPolicy) -> Self {
        let credentials = secrets
            .into_iter()
            .map(Into::into)
            .filter(|secret: &String| !secret.trim().is_empty())
            .enumerate()
            .map(|(index, secret)| Credential {
                id: credential_id(index, &secret),
                secret,
                state: CredentialState::Active,
                cooldown_until: None,
                consecutive_rate_limits: 0,
            })
            .collect();
        Self {
            inner: Mutex::new(PoolInner {
                credentials,
                cursor: 0,
            }),
            changed: Notify::new(),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .credentials
            .iter()
            .filter(|credential| credential.state != CredentialState::Exhausted)
            .count()
    }

    /// Waits for a usable credential. Returns `Blocked` once every key is exhausted.
    pub async fn acquire(&self) -> Result<Lease, Blocked> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.pick(Instant::now()) {
                Pick::Ready(lease) => return Ok(lease),
                Pick::Blocked => return Err(Blocked),
                Pick::WaitUntil(deadline) => {
                    debug!("all credentials cooling down; waiting");
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
            }
        }
    }

    pub fn release(&self, lease: &Lease, outcome: ReleaseOutcome) {
        let mut inner = self.lock();
        let Some(credential) = inner.credentials.get_mut(lease.index) else {
            return;
        };
        match outcome {
            ReleaseOutcome::Success => {
                credential.consecutive_rate_limits = 0;
            }
            ReleaseOutcome::RateLimited { retry_after } => {
                if credential.state == CredentialState::Exhausted {
                    return;
                }
                let window = self
                    .policy
                    .window(credential.consecutive_rate_limits, retry_after);
                credential.consecutive_rate_limits =
                    credential.consecutive_rate_limits.saturating_add(1);
                let now = Instant::now();
                let until = now
                    .checked_add(window)
                    .or_else(|| now.checked_add(self.policy.cap))
                    .unwrap_or(now);
                credential.cooldown_until = Some(match credential.cooldown_until {
                    Some(existing) if existing > until => existing,
                    _ => until,
                });
                credential.state = CredentialState::CoolingDown;
                warn!(
                    "credential {} rate limited; cooling down for {:.1}s",
                    credential.id,
                    window.as_secs_f64()
                );
            }
            ReleaseOutcome::AuthError => {
                if credential.state != CredentialState::Exhausted {
                    warn!("credential {} rejected; disabled for this run", credential.id);
                }
                credential.state = CredentialState::Exhausted;
                credential.cooldown_until = None;
            }
            ReleaseOutcome::Transient => {}
        }
        drop(inner);
        self.changed.notify_waiters();
    }

    /// Returns every credential to `Active`.
    pub fn reset(&self) {
        let mut inner = self.lock();
        for credential in inner.credentials.iter_mut() {
            credential.state = CredentialState::Active;
            credential.cooldown_until = None;
            credential.consecutive_rate_limits = 0;
        }
        inner.cursor = 0;
        drop(inner);
        self.changed.notify_waiters();
    }

    pub fn snapshot(&self) -> Vec<Credential> {
        self.lock().credentials.clone()
    }

    fn pick(&self, now: Instant) -> Pick {
        let mut inner = self.lock();
        let count = inner.credentials.len();
        let mut earliest: Option<Instant> = None;

        for credential in inner.credentials.iter_mut() {
            if credential.state != CredentialState::CoolingDown {
                continue;
            }
            match credential.cooldown_until {
                Some(until) if until > now => {
                    earliest = Some(earliest.map_or(until, |current| current.min(until)));
                }
                _ => {
                    credential.state = CredentialState::Active;
                    credential.cooldown_until = None;
                    info!("credential {} is active again", credential.id);
                }
            }
        }

        for offset in 0..count {
            let index = (inner.cursor + offset) % count;
            let credential = &inner.credentials[index];
            if credential.state == CredentialState::Active {
                let lease = Lease {
                    index,
                    id: credential.id.clone(),
                    secret: credential.secret.clone(),
                };
                inner.cursor = (index + 1) % count;
                return Pick::Ready(lease);
            }
        }

        match earliest {
            Some(deadline) => Pick::WaitUntil(deadline),
            None => Pick::Blocked,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn credential_id(index: usize, secret: &str) -> String {
    let chars = secret.chars().collect::<Vec<_>>();
    let tail = chars[chars.len().saturating_sub(4)..]
        .iter()
        .collect::<String>();
    format!("key#{}(…{})", index + 1, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy() -> CooldownPolicy {
        CooldownPolicy {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(80),
        }
    }

    #[test]
    fn cooldown_window_doubles_up_to_cap() {
        let policy = CooldownPolicy::default();
        assert_eq!(policy.window(0, None), Duration::from_secs(2));
        assert_eq!(policy.window(1, None), Duration::from_secs(4));
        assert_eq!(policy.window(5, None), Duration::from_secs(60));
        assert_eq!(policy.window(40, None), Duration::from_secs(60));
        assert_eq!(
            policy.window(0, Some(Duration::from_secs(30))),
            Duration::from_secs(30)
        );
        assert_eq!(
            policy.window(3, Some(Duration::from_secs(1))),
            Duration::from_secs(16)
        );
    }

    #[test]
    fn huge_retry_after_hint_is_capped() {
        let policy = CooldownPolicy::default();
        assert_eq!(
            policy.window(0, Some(Duration::from_secs(u64::MAX))),
            Duration::from_secs(600)
        );
        assert_eq!(policy.window(0, Some(Duration::MAX)), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn release_survives_huge_retry_after() {
        let pool = CredentialPool::new(["key-a", "key-b"], fast_policy());
        let lease = pool.acquire().await.unwrap();
        pool.release(
            &lease,
            ReleaseOutcome::RateLimited {
                retry_after: Some(Duration::from_secs(u64::MAX)),
            },
        );
        let credential = &pool.snapshot()[0];
        assert_eq!(credential.state, CredentialState::CoolingDown);
        let until = credential.cooldown_until.unwrap();
        assert!(until <= Instant::now() + Duration::from_millis(800));
        assert_eq!(pool.acquire().await.unwrap().secret, "key-b");
    }

    #[tokio::test]
    async fn acquire_rotates_round_robin() {
        let pool = CredentialPool::new(["key-a", "key-b"], fast_policy());
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        let third = pool.acquire().await.unwrap();
        assert_eq!(first.secret, "key-a");
        assert_eq!(second.secret, "key-b");
        assert_eq!(third.secret, "key-a");
    }

    #[tokio::test]
    async fn rate_limited_key_is_skipped_until_cooldown_elapses() {
        let pool = CredentialPool::new(["key-a", "key-b"], fast_policy());
        let a = pool.acquire().await.unwrap();
        pool.release(&a, ReleaseOutcome::RateLimited { retry_after: None });
        let next = pool.acquire().await.unwrap();
        assert_eq!(next.secret, "key-b");
        let again = pool.acquire().await.unwrap();
        assert_eq!(again.secret, "key-b");
        assert_eq!(pool.snapshot()[0].state, CredentialState::CoolingDown);
    }

    #[tokio::test]
    async fn acquire_waits_for_cooldown_instead_of_failing() {
        let pool = CredentialPool::new(["only"], fast_policy());
        let lease = pool.acquire().await.unwrap();
        pool.release(&lease, ReleaseOutcome::RateLimited { retry_after: None });
        let started = Instant::now();
        let lease = pool.acquire().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(15));
        assert_eq!(lease.secret, "only");
        pool.release(&lease, ReleaseOutcome::Success);
        assert_eq!(pool.snapshot()[0].consecutive_rate_limits, 0);
    }

    #[tokio::test]
    async fn auth_errors_exhaust_the_pool() {
        let pool = CredentialPool::new(["key-a", "key-b"], fast_policy());
        for _ in 0..2 {
            let lease = pool.acquire().await.unwrap();
            pool.release(&lease, ReleaseOutcome::AuthError);
        }
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.acquire().await.unwrap_err(), Blocked);

        pool.reset();
        assert_eq!(pool.active_count(), 2);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn empty_pool_is_blocked() {
        let pool = CredentialPool::new(Vec::<String>::new(), fast_policy());
        assert!(pool.is_empty());
        assert!(pool.acquire().await.is_err());
    }

    #[test]
    fn debug_output_hides_secret() {
        let pool = CredentialPool::new(["sk-secret-value-1234"], fast_policy());
        let rendered = format!("{:?}", pool.snapshot());
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("1234"));
    }
}
