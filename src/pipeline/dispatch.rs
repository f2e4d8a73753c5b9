// src/pipeline/dispatch.rs

//! Bucket discovery and dispatch into the work queue.

use std::collections::HashSet;

use futures::stream::{self, BoxStream, StreamExt};

use crate::error::{AppError, Result};
use crate::models::{BucketReference, DiscoveryConfig, QueueItem};
use crate::queue::WorkQueue;
use crate::services::BucketSearch;
use crate::storage::DocumentIndex;
use crate::utils::CancelSignal;

/// Outcome of one dispatch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub enqueued: usize,
    /// References already seen in this run
    pub duplicates: usize,
    /// References on the ignore list
    pub ignored: usize,
    /// Discovery did not see every bucket (page limit, bad allow-list entry)
    pub truncated: bool,
    /// Buckets whose documents were removed because they vanished
    pub pruned_buckets: usize,
    pub pruned_documents: usize,
}

/// One item of a topic search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Found {
    Bucket(BucketReference),
    /// `max_pages` was reached before `total` hits were seen. Always last.
    Truncated { seen: u64, total: Option<u64> },
}

#[derive(Clone, Copy)]
struct Cursor {
    page: u32,
    seen: u64,
    total: Option<u64>,
    done: bool,
}

/// Lazily page through the search results of one query.
///
/// Stops at the first empty page, once `total_count` hits were seen, or after
/// `max_pages`. Stopping at the page limit with hits left yields a final
/// [`Found::Truncated`]. A failed page ends the stream with that error.
pub fn discover<'a>(
    search: &'a dyn BucketSearch,
    query: String,
    per_page: u32,
    max_pages: u32,
) -> BoxStream<'a, Result<Found>> {
    let start = Cursor {
        page: 1,
        seen: 0,
        total: None,
        done: false,
    };
    stream::unfold(start, move |cursor| {
        let query = query.clone();
        async move {
            if cursor.done {
                return None;
            }
            if cursor.page > max_pages {
                let Cursor { seen, total, .. } = cursor;
                let done = Cursor {
                    done: true,
                    ..cursor
                };
                return Some((stream::iter(vec![Ok(Found::Truncated { seen, total })]), done));
            }
            match search.search_page(&query, cursor.page, per_page).await {
                Ok(result) => {
                    if result.buckets.is_empty() {
                        return None;
                    }
                    let seen = cursor.seen + result.buckets.len() as u64;
                    let next = Cursor {
                        page: cursor.page + 1,
                        seen,
                        total: Some(result.total_count),
                        done: seen >= result.total_count,
                    };
                    let items: Vec<Result<Found>> =
                        result.buckets.into_iter().map(|b| Ok(Found::Bucket(b))).collect();
                    Some((stream::iter(items), next))
                }
                Err(e) => {
                    let done = Cursor {
                        done: true,
                        ..cursor
                    };
                    Some((stream::iter(vec![Err(e)]), done))
                }
            }
        }
    })
    .flatten()
    .boxed()
}

/// Search query for one topic.
pub fn topic_query(topic: &str, extra: Option<&str>) -> String {
    match extra.map(str::trim).filter(|e| !e.is_empty()) {
        Some(extra) => format!("topic:{topic} {extra}"),
        None => format!("topic:{topic}"),
    }
}

struct Dispatch<'a> {
    queue: &'a dyn WorkQueue,
    ignored: HashSet<String>,
    seen: HashSet<String>,
    summary: DispatchSummary,
}

impl Dispatch<'_> {
    async fn offer(&mut self, bucket: BucketReference) -> Result<()> {
        if self.ignored.contains(&bucket.id) {
            self.summary.ignored += 1;
            return Ok(());
        }
        if !self.seen.insert(bucket.id.clone()) {
            self.summary.duplicates += 1;
            return Ok(());
        }
        log::debug!("Enqueue {}", bucket.id);
        self.queue.enqueue(QueueItem::new(bucket)).await?;
        self.summary.enqueued += 1;
        Ok(())
    }
}

/// Discover buckets and enqueue one item per bucket as soon as it is found.
///
/// The allow-list goes first, then every topic search. A search failure ends
/// the run with that error; whatever was enqueued stays enqueued. When `index`
/// is given and discovery saw every bucket, buckets present in the index but
/// no longer discovered have their documents deleted. A truncated search or an
/// unparsable allow-list entry skips that step.
pub async fn run_dispatcher(
    config: &DiscoveryConfig,
    search: &dyn BucketSearch,
    queue: &dyn WorkQueue,
    index: Option<&dyn DocumentIndex>,
    cancel: &CancelSignal,
) -> Result<DispatchSummary> {
    let mut dispatch = Dispatch {
        queue,
        ignored: config
            .ignored_buckets
            .iter()
            .map(|id| id.trim().trim_matches('/').to_lowercase())
            .collect(),
        seen: HashSet::new(),
        summary: DispatchSummary::default(),
    };

    for url in &config.manual_buckets {
        match BucketReference::from_url(url, None) {
            Ok(bucket) => dispatch.offer(bucket).await?,
            Err(e) => {
                log::warn!("Skipping allow-listed bucket {}: {}", url, e);
                dispatch.summary.truncated = true;
            }
        }
    }

    for topic in &config.topics {
        let query = topic_query(topic, config.extra_query.as_deref());
        log::info!("Searching '{}'", query);

        let mut results = discover(search, query.clone(), config.per_page, config.max_pages);
        while let Some(found) = cancel.guard(async { Ok(results.next().await) }).await? {
            match found? {
                Found::Bucket(bucket) => dispatch.offer(bucket).await?,
                Found::Truncated { seen, total } => {
                    log::warn!(
                        "'{}' stopped at {} pages with {} of {} hits seen",
                        query,
                        config.max_pages,
                        seen,
                        total.map_or_else(|| "?".to_string(), |t| t.to_string())
                    );
                    dispatch.summary.truncated = true;
                }
            }
        }
    }

    if config.prune_missing {
        if let Some(index) = index {
            if dispatch.summary.truncated {
                log::warn!("Discovery incomplete, not pruning vanished buckets");
            } else {
                prune_missing(index, &dispatch.seen, &mut dispatch.summary, cancel).await?;
            }
        }
    }

    log::info!(
        "Dispatch complete: {} enqueued, {} duplicates, {} ignored",
        dispatch.summary.enqueued,
        dispatch.summary.duplicates,
        dispatch.summary.ignored
    );
    Ok(dispatch.summary)
}

/// Delete documents of indexed buckets absent from `discovered`.
async fn prune_missing(
    index: &dyn DocumentIndex,
    discovered: &HashSet<String>,
    summary: &mut DispatchSummary,
    cancel: &CancelSignal,
) -> Result<()> {
    let mut vanished: Vec<String> = index
        .bucket_ids()
        .await?
        .into_iter()
        .filter(|id| !discovered.contains(id))
        .collect();
    vanished.sort();

    for bucket_id in vanished {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        let keys: Vec<_> = index.keys_for_bucket(&bucket_id).await?.into_iter().collect();
        index.delete(&bucket_id, &keys).await?;
        log::info!(
            "Pruned {} documents of vanished bucket {}",
            keys.len(),
            bucket_id
        );
        summary.pruned_buckets += 1;
        summary.pruned_documents += keys.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::models::{IndexDocument, ManifestRecord};
    use crate::queue::MemoryQueue;
    use crate::services::{KeyGenerator, SearchPage};
    use crate::storage::MemoryIndex;

    /// Serves fixed pages; `fail_on` makes that page fail.
    struct PagedSearch {
        pages: Vec<Vec<&'static str>>,
        fail_on: Option<u32>,
        calls: Mutex<Vec<(String, u32)>>,
    }

    impl PagedSearch {
        fn new(pages: Vec<Vec<&'static str>>) -> Self {
            Self {
                pages,
                fail_on: None,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BucketSearch for PagedSearch {
        async fn search_page(&self, query: &str, page: u32, _: u32) -> Result<SearchPage> {
            self.calls.lock().unwrap().push((query.to_string(), page));
            if self.fail_on == Some(page) {
                return Err(AppError::transient("search down"));
            }
            let total = self.pages.iter().map(Vec::len).sum::<usize>() as u64;
            let buckets = self
                .pages
                .get(page as usize - 1)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .map(|id| BucketReference::new(id, format!("https://github.com/{id}"), None))
                .collect();
            Ok(SearchPage {
                buckets,
                total_count: total,
            })
        }
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig {
            topics: vec!["scoop-bucket".into()],
            ..DiscoveryConfig::default()
        }
    }

    async fn drain(queue: &MemoryQueue) -> Vec<String> {
        let mut ids = Vec::new();
        while let Some(d) = queue.dequeue().await.unwrap() {
            ids.push(d.item.bucket.id.clone());
            queue.ack(&d).await.unwrap();
        }
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_pages_until_total_and_dedupes() {
        let search = PagedSearch::new(vec![vec!["a/one", "a/two"], vec!["a/three"]]);
        let queue = MemoryQueue::default();
        let mut cfg = config();
        cfg.manual_buckets = vec!["https://github.com/A/One".into()];
        cfg.ignored_buckets = vec!["a/two".into()];

        let summary = run_dispatcher(&cfg, &search, &queue, None, &CancelSignal::new())
            .await
            .unwrap();

        assert_eq!(summary.enqueued, 2);
        assert_eq!(summary.duplicates, 1);
        assert_eq!(summary.ignored, 1);
        assert_eq!(drain(&queue).await, vec!["a/one", "a/three"]);
        // Total reached on page 2, so page 3 is never requested.
        assert_eq!(search.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_search_failure_keeps_enqueued_items() {
        let mut search = PagedSearch::new(vec![vec!["a/one"], vec!["a/two"]]);
        search.fail_on = Some(2);
        let queue = MemoryQueue::default();

        let result = run_dispatcher(&config(), &search, &queue, None, &CancelSignal::new()).await;
        assert!(result.is_err());
        assert_eq!(drain(&queue).await, vec!["a/one"]);
    }

    fn doc(bucket: &str, path: &str) -> IndexDocument {
        let record = ManifestRecord::parse(bucket, path, br#"{"version":"1"}"#, Utc::now()).unwrap();
        IndexDocument::from_record(KeyGenerator::new().key(bucket, path), record)
    }

    #[tokio::test]
    async fn test_prunes_vanished_buckets_after_complete_discovery() {
        let index = MemoryIndex::new();
        index
            .upsert(&[doc("a/one", "x.json"), doc("gone/old", "y.json"), doc("gone/old", "z.json")])
            .await
            .unwrap();
        let search = PagedSearch::new(vec![vec!["a/one"]]);
        let queue = MemoryQueue::default();

        let summary = run_dispatcher(&config(), &search, &queue, Some(&index), &CancelSignal::new())
            .await
            .unwrap();
        assert_eq!(summary.pruned_buckets, 1);
        assert_eq!(summary.pruned_documents, 2);
        assert_eq!(index.bucket_ids().await.unwrap(), HashSet::from(["a/one".to_string()]));
    }

    #[tokio::test]
    async fn test_partial_discovery_never_prunes() {
        let index = MemoryIndex::new();
        index.upsert(&[doc("gone/old", "y.json")]).await.unwrap();
        let mut search = PagedSearch::new(vec![vec!["a/one"], vec!["a/two"]]);
        search.fail_on = Some(2);
        let queue = MemoryQueue::default();

        let result =
            run_dispatcher(&config(), &search, &queue, Some(&index), &CancelSignal::new()).await;
        assert!(result.is_err());
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_page_limit_reports_truncation() {
        let search = PagedSearch::new(vec![vec!["a/one"], vec!["b/two"]]);
        let found: Vec<Found> = discover(&search, "topic:x".into(), 1, 1)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(found.len(), 2);
        let first = BucketReference::new("a/one", "https://github.com/a/one", None);
        assert_eq!(found[0], Found::Bucket(first));
        assert_eq!(
            found[1],
            Found::Truncated {
                seen: 1,
                total: Some(2)
            }
        );
        assert_eq!(search.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_page_at_limit_is_not_truncated() {
        let search = PagedSearch::new(vec![vec!["a/one"], vec!["b/two"]]);
        let found: Vec<Found> = discover(&search, "topic:x".into(), 1, 2)
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|f| matches!(f, Found::Bucket(_))));
    }

    #[tokio::test]
    async fn test_truncated_discovery_keeps_live_buckets() {
        let index = MemoryIndex::new();
        index.upsert(&[doc("b/two", "app.json")]).await.unwrap();
        let search = PagedSearch::new(vec![vec!["a/one"], vec!["b/two"]]);
        let queue = MemoryQueue::default();
        let mut cfg = config();
        cfg.max_pages = 1;

        let summary = run_dispatcher(&cfg, &search, &queue, Some(&index), &CancelSignal::new())
            .await
            .unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(summary.pruned_buckets, 0);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_allow_list_entry_blocks_pruning() {
        let index = MemoryIndex::new();
        index.upsert(&[doc("gone/old", "y.json")]).await.unwrap();
        let search = PagedSearch::new(vec![vec!["a/one"]]);
        let queue = MemoryQueue::default();
        let mut cfg = config();
        cfg.manual_buckets = vec!["not a url".into()];

        let summary = run_dispatcher(&cfg, &search, &queue, Some(&index), &CancelSignal::new())
            .await
            .unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_topic_query() {
        assert_eq!(topic_query("scoop-bucket", None), "topic:scoop-bucket");
        assert_eq!(
            topic_query("scoop-bucket", Some(" fork:true ")),
            "topic:scoop-bucket fork:true"
        );
    }
}
