//! One fetch cycle: download the feed, look up each entry's `og:image`,
//! and swap the stored snapshot for the result.
//!
//! A cycle either replaces the whole snapshot or leaves it untouched.
//! Nothing is written until every entry has been built, and the write
//! itself is a single transaction.

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::feed::{
    fetch_feed, parse_feed, parse_feed_lenient, resolve_image, FeedEntry, FetchError, ParseError,
};
use crate::storage::{Database, DatabaseError, NewsItemDraft};

/// What a cycle does when a single entry cannot be used: its date or
/// required fields are bad, or its article page cannot be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryFailurePolicy {
    /// Fail the whole cycle; the stored snapshot stays as it was.
    #[default]
    Abort,
    /// Log the entry, leave it out, and store the rest.
    Skip,
}

/// Everything that can end a cycle early.
#[derive(Debug, Error)]
pub enum CycleError {
    /// The feed itself could not be downloaded
    #[error("Feed fetch failed: {0}")]
    Fetch(#[from] FetchError),
    /// An article page could not be downloaded
    #[error("Article page {link} could not be fetched: {source}")]
    ArticlePage {
        link: String,
        #[source]
        source: FetchError,
    },
    /// Feed markup or an entry in it was invalid
    #[error("Feed parse failed: {0}")]
    Parse(#[from] ParseError),
    /// Writing the new snapshot failed
    #[error("Storing snapshot failed: {0}")]
    Store(#[from] DatabaseError),
}

/// Counts from a successful cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Items in the new snapshot
    pub stored: usize,
    /// Entries left out under [`EntryFailurePolicy::Skip`]
    pub skipped: usize,
}

/// Result of a cycle as seen by the scheduler and the manual trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded(CycleReport),
    Failed { reason: String },
}

impl CycleOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CycleOutcome::Succeeded(_))
    }
}

/// Knobs for a cycle, usually taken from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub feed_url: String,
    pub request_timeout: Duration,
    pub image_fetch_concurrency: usize,
    pub entry_failure_policy: EntryFailurePolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            feed_url: config.feed_url.clone(),
            request_timeout: config.request_timeout(),
            image_fetch_concurrency: config.image_fetch_concurrency,
            entry_failure_policy: config.entry_failure_policy,
        }
    }
}

/// Build the HTTP client shared by the feed and article requests.
pub fn http_client(user_agent: &str) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().user_agent(user_agent).build()
}

/// Runs fetch cycles against one feed and one store.
///
/// Clones share the same cycle lock, so no two cycles overlap no matter
/// how many handles call [`Pipeline::run`].
#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    client: reqwest::Client,
    settings: Arc<PipelineSettings>,
    cycle_lock: Arc<Mutex<()>>,
}

impl Pipeline {
    pub fn new(db: Database, client: reqwest::Client, settings: PipelineSettings) -> Self {
        Self {
            db,
            client,
            settings: Arc::new(settings),
            cycle_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Run one cycle and report its outcome. Errors are logged here and
    /// never returned, so a failing feed cannot take down the caller.
    pub async fn run(&self) -> CycleOutcome {
        let started = Instant::now();
        match self.try_run().await {
            Ok(report) => {
                tracing::info!(
                    stored = report.stored,
                    skipped = report.skipped,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Fetch cycle succeeded"
                );
                CycleOutcome::Succeeded(report)
            }
            Err(e) => {
                tracing::warn!(
                    feed = %self.settings.feed_url,
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Fetch cycle failed, snapshot left unchanged"
                );
                CycleOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Run one cycle, returning the first error that stopped it.
    ///
    /// # Errors
    ///
    /// - [`CycleError::Fetch`] - feed download failed
    /// - [`CycleError::Parse`] - feed markup invalid, or (under `Abort`) an entry invalid
    /// - [`CycleError::ArticlePage`] - (under `Abort`) an article page failed
    /// - [`CycleError::Store`] - the snapshot could not be written
    pub async fn try_run(&self) -> Result<CycleReport, CycleError> {
        let _cycle = self.cycle_lock.lock().await;
        let settings = &*self.settings;

        tracing::debug!(feed = %settings.feed_url, "Fetch cycle started");
        let bytes = fetch_feed(&self.client, &settings.feed_url, settings.request_timeout).await?;

        let (entries, rejected) = match settings.entry_failure_policy {
            EntryFailurePolicy::Abort => (parse_feed(&bytes)?, 0),
            EntryFailurePolicy::Skip => {
                let (entries, rejected) = parse_feed_lenient(&bytes)?;
                for e in &rejected {
                    tracing::warn!(error = %e, "Skipping feed entry");
                }
                (entries, rejected.len())
            }
        };

        let (drafts, unreachable) = self.enrich(entries).await?;
        let stored = self.db.replace_all(&drafts).await?;

        Ok(CycleReport {
            stored,
            skipped: rejected + unreachable,
        })
    }

    /// Resolve images for `entries`, at most `image_fetch_concurrency`
    /// pages at a time. Output keeps feed order whatever order the pages
    /// finish in. Returns the drafts and how many entries were skipped.
    async fn enrich(&self, entries: Vec<FeedEntry>) -> Result<(Vec<NewsItemDraft>, usize), CycleError> {
        let timeout = self.settings.request_timeout;
        let lookups = stream::iter(entries)
            .map(|entry| async move {
                let image = resolve_image(&self.client, &entry.link, timeout).await;
                (entry, image)
            })
            .buffered(self.settings.image_fetch_concurrency.max(1));

        match self.settings.entry_failure_policy {
            EntryFailurePolicy::Abort => {
                // try_collect stops at the first failure and drops in-flight lookups
                let drafts: Vec<NewsItemDraft> = lookups
                    .map(|(entry, image)| match image {
                        Ok(image) => Ok(into_draft(entry, image)),
                        Err(source) => Err(CycleError::ArticlePage {
                            link: entry.link,
                            source,
                        }),
                    })
                    .try_collect()
                    .await?;
                Ok((drafts, 0))
            }
            EntryFailurePolicy::Skip => {
                let results: Vec<_> = lookups.collect().await;
                let mut drafts = Vec::with_capacity(results.len());
                let mut skipped = 0;
                for (entry, image) in results {
                    match image {
                        Ok(image) => drafts.push(into_draft(entry, image)),
                        Err(e) => {
                            tracing::warn!(link = %entry.link, error = %e, "Skipping entry with unreachable article page");
                            skipped += 1;
                        }
                    }
                }
                Ok((drafts, skipped))
            }
        }
    }
}

fn into_draft(entry: FeedEntry, image: Option<String>) -> NewsItemDraft {
    NewsItemDraft {
        title: entry.title,
        description: entry.description,
        link: entry.link,
        published_at: entry.published_at,
        image,
    }
}
