//! Record store boundary for the reconciliation jobs: the `RecordStore`
//! seam, a Firestore REST client, and an in-memory store.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use roster_core::{MembershipRecord, MirrorRecord, Mutation};
use thiserror::Error;
use tokio::sync::Mutex;

pub mod codec;
pub mod credentials;
pub mod firestore;
pub mod memory;

pub use codec::CodecError;
pub use credentials::{load_service_account, CredentialsError, ServiceAccountKey};
pub use firestore::{FirestoreClient, FirestoreConfig};
pub use memory::MemoryStore;

pub const CRATE_NAME: &str = "roster-storage";

/// Hard per-commit write limit of the backing store.
pub const MAX_WRITES_PER_COMMIT: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Credentials(#[from] CredentialsError),
    #[error("authentication rejected: {0}")]
    Unauthenticated(String),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("malformed document {name}: {source}")]
    Codec {
        name: String,
        #[source]
        source: CodecError,
    },
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Errors that make every further call pointless.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Credentials(_) | Self::Unauthenticated(_))
    }
}

/// Everything the reconciliation engine needs from a store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Human-readable target, for logs and report headers.
    fn describe(&self) -> String;

    /// Read the whole membership collection in one pass.
    async fn list_members(&self) -> Result<Vec<MembershipRecord>, StoreError>;

    /// Fetch the authorization mirror for an organization/account pair.
    async fn get_mirror(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<MirrorRecord>, StoreError>;

    /// Apply the writes atomically. At most `MAX_WRITES_PER_COMMIT` writes.
    async fn commit(&self, writes: &[Mutation]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Single attempt, for requests that must not be replayed.
    pub fn without_retries(self) -> Self {
        Self {
            max_retries: 0,
            ..self
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Paces remote lookups to a fixed rate.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A bucket admitting `per_second` calls per second, with a burst of the same size.
    pub fn per_second(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self::new(per_second, Duration::from_secs(1) / per_second)
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}
