// src/services/manifests.rs

//! Manifest crawling over a local git clone of each bucket.
//!
//! | Step       | git command                                        |
//! |------------|----------------------------------------------------|
//! | sync       | `clone --single-branch` or `fetch` + `reset --hard` |
//! | enumerate  | `ls-tree -r --name-only HEAD`                      |
//! | timestamps | one `log --name-only` pass over the manifest paths |
//!
//! Files are read and parsed lazily while the stream is polled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{AppError, Result};
use crate::models::{BucketReference, CrawlerConfig, ManifestRecord};
use crate::services::ManifestCrawler;
use crate::utils::git::Git;
use crate::utils::short_hash;

/// Lazily produced manifests of one bucket.
///
/// Malformed manifests never reach the consumer; they are counted in
/// [`ManifestStream::skipped`].
pub struct ManifestStream {
    inner: BoxStream<'static, ManifestRecord>,
    skipped: Arc<AtomicUsize>,
}

impl ManifestStream {
    pub fn new(inner: BoxStream<'static, ManifestRecord>, skipped: Arc<AtomicUsize>) -> Self {
        Self { inner, skipped }
    }

    /// Stream over already parsed records.
    pub fn from_records(records: Vec<ManifestRecord>) -> Self {
        Self::new(stream::iter(records).boxed(), Arc::default())
    }

    /// Manifests skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Shared handle to the skip counter, readable after the stream is consumed.
    pub fn skip_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.skipped)
    }
}

impl Stream for ManifestStream {
    type Item = ManifestRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl std::fmt::Debug for ManifestStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStream")
            .field("skipped", &self.skipped())
            .finish_non_exhaustive()
    }
}

/// Where a bucket keeps its manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestLayout {
    /// `bucket/*.json`
    BucketDir,
    /// `*.json` at the repository root
    Root,
}

impl ManifestLayout {
    const BUCKET_DIR: &'static str = "bucket/";

    /// Pick the layout of a tree and return its manifest paths, sorted.
    ///
    /// The `bucket/` directory wins whenever it holds at least one manifest.
    pub fn select(files: &[String]) -> (Self, Vec<String>) {
        let in_bucket_dir: Vec<String> = files
            .iter()
            .filter(|path| Self::BucketDir.matches(path))
            .cloned()
            .collect();

        let (layout, mut paths) = if in_bucket_dir.is_empty() {
            let root = files
                .iter()
                .filter(|path| Self::Root.matches(path))
                .cloned()
                .collect();
            (Self::Root, root)
        } else {
            (Self::BucketDir, in_bucket_dir)
        };
        paths.sort();
        (layout, paths)
    }

    /// Whether `path` is a manifest under this layout.
    pub fn matches(&self, path: &str) -> bool {
        let file = match self {
            Self::BucketDir => match path.strip_prefix(Self::BUCKET_DIR) {
                Some(rest) => rest,
                None => return false,
            },
            Self::Root => path,
        };
        !file.contains('/') && file.len() > ".json".len() && file.ends_with(".json")
    }

    /// Pathspec limiting `git log` to this layout's files.
    pub fn pathspec(&self) -> &'static str {
        match self {
            Self::BucketDir => "bucket/*.json",
            Self::Root => "*.json",
        }
    }
}

/// Marks a commit header line in [`LOG_FORMAT`] output.
const COMMIT_MARKER: char = '\u{1}';
const LOG_FORMAT: &str = "--format=%x01%ct";

/// Parse `git log --name-only` output into the newest commit time per file.
///
/// Log output is newest first, so the first time seen for a path wins.
pub fn parse_commit_times(log: &str) -> HashMap<String, DateTime<Utc>> {
    let mut times = HashMap::new();
    let mut current: Option<DateTime<Utc>> = None;

    for line in log.lines() {
        if let Some(stamp) = line.strip_prefix(COMMIT_MARKER) {
            current = stamp
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0));
            continue;
        }
        let path = line.trim();
        if path.is_empty() {
            continue;
        }
        if let Some(time) = current {
            times.entry(path.to_string()).or_insert(time);
        }
    }
    times
}

/// Crawls buckets through the `git` executable.
pub struct GitManifestCrawler {
    git: Git,
    cache_dir: PathBuf,
}

impl GitManifestCrawler {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            git: Git::new(&config.git),
            cache_dir: config.cache_dir.clone(),
        }
    }

    /// Working tree of a bucket inside the cache directory.
    pub fn checkout_dir(&self, bucket: &BucketReference) -> PathBuf {
        self.cache_dir.join(short_hash(&bucket.id))
    }

    /// Clone the bucket, or bring an existing clone up to date.
    async fn sync(&self, bucket: &BucketReference, dir: &Path) -> Result<()> {
        if dir.join(".git").exists() {
            let target = bucket.branch.as_deref().unwrap_or("HEAD");
            let fetched = self
                .git
                .run(&bucket.id, Some(dir), &["fetch", "--quiet", "origin", target])
                .await;
            match fetched {
                Ok(_) => {
                    self.git
                        .run(
                            &bucket.id,
                            Some(dir),
                            &["reset", "--quiet", "--hard", "FETCH_HEAD"],
                        )
                        .await?;
                    return Ok(());
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    // A broken or re-pointed clone is discarded and cloned again.
                    log::warn!("[{}] Fetch failed, re-cloning: {}", bucket.id, e);
                    tokio::fs::remove_dir_all(dir).await?;
                }
            }
        }

        if let Some(parent) = dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest = dir.to_string_lossy();
        let mut args = vec!["clone", "--quiet", "--single-branch"];
        if let Some(branch) = bucket.branch.as_deref() {
            args.extend(["--branch", branch]);
        }
        args.extend(["--", bucket.url.as_str(), dest.as_ref()]);

        let cloned = self.git.run(&bucket.id, None, &args).await;
        if cloned.is_err() && dir.exists() {
            // Leave no half-written clone behind for the next attempt.
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
        cloned.map(|_| ())
    }

    async fn list_files(&self, bucket: &BucketReference, dir: &Path) -> Result<Vec<String>> {
        let out = self
            .git
            .run(
                &bucket.id,
                Some(dir),
                &["ls-tree", "-r", "--name-only", "HEAD"],
            )
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn commit_times(
        &self,
        bucket: &BucketReference,
        dir: &Path,
        layout: ManifestLayout,
    ) -> Result<HashMap<String, DateTime<Utc>>> {
        let out = self
            .git
            .run(
                &bucket.id,
                Some(dir),
                &[
                    "log",
                    LOG_FORMAT,
                    "--name-only",
                    "--no-renames",
                    "HEAD",
                    "--",
                    layout.pathspec(),
                ],
            )
            .await?;
        Ok(parse_commit_times(&out))
    }

    async fn head_time(&self, bucket: &BucketReference, dir: &Path) -> Result<DateTime<Utc>> {
        let out = self
            .git
            .run(&bucket.id, Some(dir), &["log", "-1", "--format=%ct", "HEAD"])
            .await?;
        out.trim()
            .parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| AppError::unavailable(&bucket.id, "HEAD has no commit time"))
    }
}

#[async_trait]
impl ManifestCrawler for GitManifestCrawler {
    async fn crawl(&self, bucket: &BucketReference) -> Result<ManifestStream> {
        let dir = self.checkout_dir(bucket);
        self.sync(bucket, &dir).await?;

        let files = self.list_files(bucket, &dir).await?;
        let (layout, paths) = ManifestLayout::select(&files);
        let mut times = self.commit_times(bucket, &dir, layout).await?;

        if paths.iter().any(|p| !times.contains_key(p)) {
            let head = self.head_time(bucket, &dir).await?;
            for path in &paths {
                times.entry(path.clone()).or_insert(head);
            }
        }

        log::info!(
            "[{}] {} manifests ({:?} layout)",
            bucket.id,
            paths.len(),
            layout
        );
        Ok(read_manifests(bucket.id.clone(), dir, paths, times))
    }
}

/// Stream that reads and parses `paths` below `root` one file at a time.
pub fn read_manifests(
    bucket_id: String,
    root: PathBuf,
    paths: Vec<String>,
    times: HashMap<String, DateTime<Utc>>,
) -> ManifestStream {
    let skipped = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&skipped);
    let root = Arc::new(root);
    let times = Arc::new(times);
    let bucket_id: Arc<str> = bucket_id.into();

    let records = stream::iter(paths).filter_map(move |path| {
        let root = Arc::clone(&root);
        let times = Arc::clone(&times);
        let bucket_id = Arc::clone(&bucket_id);
        let counter = Arc::clone(&counter);
        async move {
            let parsed = match tokio::fs::read(root.join(&path)).await {
                Ok(bytes) => {
                    let modified = times.get(&path).copied().unwrap_or(DateTime::UNIX_EPOCH);
                    ManifestRecord::parse(&bucket_id, &path, &bytes, modified)
                }
                Err(e) => Err(AppError::parse(&path, e)),
            };
            match parsed {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("[{}] Skipping manifest: {}", bucket_id, e);
                    counter.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
        }
    });

    ManifestStream::new(records.boxed(), skipped)
}
