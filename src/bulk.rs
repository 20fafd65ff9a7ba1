//! Whole-season stream resolution
//!
//! Every episode of a season is resolved on a bounded worker pool. Each
//! episode is retried per [`RetryPolicy`]; an episode that keeps failing is
//! reported as `None` instead of failing the whole season.

use crate::providers::{Capability, EpisodeKey, Provider, ProviderError, TranslationChoice};
use crate::stream::StreamSet;
use indexmap::IndexMap;
use rayon::prelude::*;
use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicUsize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that abort a bulk run before any episode is resolved
#[derive(Debug, Error)]
pub enum BulkError {
    #[error("Failed to start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// How often a failing episode is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per episode; `None` keeps retrying forever
    pub max_attempts: Option<u32>,
    /// Pause between two attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Retries without an upper bound
    pub fn unbounded(backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(2),
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOptions {
    /// Upper bound on concurrently resolved episodes
    pub workers: usize,
    pub retry: RetryPolicy,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            workers: 6,
            retry: RetryPolicy::default(),
        }
    }
}

/// Resolves every id concurrently
///
/// `progress` is called once per settled id with `(completed, total)`.
/// The result is ordered by ascending numeric id; ids that are not numbers
/// follow in lexical order.
pub fn resolve_all<F, P>(
    ids: &[String],
    options: &BulkOptions,
    resolve: F,
    progress: P,
) -> Result<IndexMap<String, Option<StreamSet>>, BulkError>
where
    F: Fn(&str) -> Result<StreamSet, ProviderError> + Sync,
    P: Fn(usize, usize) + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.workers.max(1))
        .thread_name(|index| format!("bulk-resolver-{index}"))
        .build()?;

    let total = ids.len();
    let completed = AtomicUsize::new(0);

    let mut settled: Vec<(String, Option<StreamSet>)> = pool.install(|| {
        ids.par_iter()
            .map(|id| {
                let outcome = with_retry(&options.retry, id, || resolve(id));
                let done = completed.fetch_add(1, atomic::Ordering::SeqCst) + 1;
                progress(done, total);
                (id.clone(), outcome)
            })
            .collect()
    });

    settled.sort_by(|(a, _), (b, _)| episode_order(a, b));

    let failed = settled.iter().filter(|(_, s)| s.is_none()).count();
    info!(total, failed, "bulk resolution finished");

    Ok(settled.into_iter().collect())
}

/// Resolves every episode of `season` for one translation
///
/// The season is checked against the provider's structure before any
/// stream request is made.
pub fn resolve_season<P>(
    provider: &Provider,
    translation: &TranslationChoice,
    season: &str,
    options: &BulkOptions,
    progress: P,
) -> Result<IndexMap<String, Option<StreamSet>>, BulkError>
where
    P: Fn(usize, usize) + Sync,
{
    provider.require(Capability::Episodes)?;
    provider.require(Capability::Streams)?;

    let (label, translation_id) = provider.translations(None)?.resolve(translation)?;
    let episodes: Vec<String> = provider
        .episodes(&translation_id, season)?
        .into_keys()
        .collect();

    info!(
        title = %provider.content().display_name,
        translation = %label,
        season,
        episodes = episodes.len(),
        "resolving season"
    );

    resolve_all(
        &episodes,
        options,
        |episode| provider.streams(translation, Some(&EpisodeKey::new(season, episode))),
        progress,
    )
}

fn with_retry<F>(policy: &RetryPolicy, id: &str, attempt: F) -> Option<StreamSet>
where
    F: Fn() -> Result<StreamSet, ProviderError>,
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match attempt() {
            Ok(streams) => return Some(streams),
            Err(e) if policy.max_attempts.is_some_and(|max| attempts >= max) => {
                warn!(id, attempts, error = %e, "giving up");
                return None;
            }
            Err(e) => {
                debug!(id, attempts, error = %e, "attempt failed, retrying");
                std::thread::sleep(policy.backoff);
            }
        }
    }
}

fn episode_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
