//! Bucket identity and queue envelope.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{AppError, Result};

/// A repository hosting package manifests.
///
/// `id` is the normalized identity used for deduplication, index filtering
/// and key derivation. Two references describe the same bucket iff their ids
/// are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketReference {
    /// Lower-cased `owner/repo` (GitHub) or `host/path` (other hosts)
    pub id: String,

    /// Clone URL
    pub url: String,

    /// Branch to crawl; `None` follows the remote's default branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl BucketReference {
    /// Create a reference from already-known parts.
    pub fn new(id: &str, url: impl Into<String>, branch: Option<String>) -> Self {
        Self {
            id: id.trim_matches('/').to_lowercase(),
            url: url.into(),
            branch: branch.filter(|b| !b.trim().is_empty()),
        }
    }

    /// Build a reference from a repository URL, e.g. an allow-list entry.
    pub fn from_url(raw: &str, branch: Option<String>) -> Result<Self> {
        let raw = raw.trim();
        let id = bucket_id_from_url(raw)?;
        Ok(Self::new(&id, raw.trim_end_matches('/'), branch))
    }
}

/// Derive the normalized bucket id from a repository URL.
pub fn bucket_id_from_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw.trim())?;
    if !matches!(url.scheme(), "http" | "https" | "ssh" | "git") {
        return Err(AppError::validation(format!(
            "Unsupported bucket URL scheme '{}' in {raw}",
            url.scheme()
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::validation(format!("Bucket URL has no host: {raw}")))?
        .to_lowercase();

    let path = url.path().trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    if path.is_empty() {
        return Err(AppError::validation(format!(
            "Bucket URL has no repository path: {raw}"
        )));
    }

    let path = path.to_lowercase();
    if host == "github.com" || host == "www.github.com" {
        Ok(path)
    } else {
        Ok(format!("{host}/{path}"))
    }
}

/// Queue envelope carrying one unit of bucket work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub bucket: BucketReference,
}

impl QueueItem {
    pub fn new(bucket: BucketReference) -> Self {
        Self { bucket }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_github_url_to_id() {
        assert_eq!(
            bucket_id_from_url("https://github.com/ScoopInstaller/Extras").unwrap(),
            "scoopinstaller/extras"
        );
        assert_eq!(
            bucket_id_from_url("https://github.com/ScoopInstaller/Extras.git/").unwrap(),
            "scoopinstaller/extras"
        );
    }

    #[test]
    fn test_other_host_keeps_host_in_id() {
        assert_eq!(
            bucket_id_from_url("https://gitlab.com/Group/Sub/Bucket").unwrap(),
            "gitlab.com/group/sub/bucket"
        );
    }

    #[test]
    fn test_invalid_urls_are_rejected() {
        assert!(bucket_id_from_url("https://github.com/").is_err());
        assert!(bucket_id_from_url("ftp://github.com/a/b").is_err());
        assert!(bucket_id_from_url("not a url").is_err());
    }

    #[test]
    fn test_same_bucket_different_spelling() {
        let a = BucketReference::from_url("https://github.com/Foo/Bar", None).unwrap();
        let b = BucketReference::from_url("https://github.com/foo/bar.git", None).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_empty_branch_is_none() {
        let bucket = BucketReference::new("a/b", "https://github.com/a/b", Some(" ".into()));
        assert!(bucket.branch.is_none());
    }

    #[test]
    fn test_queue_item_json_shape() {
        let item = QueueItem::new(BucketReference::new(
            "a/b",
            "https://github.com/a/b",
            Some("main".into()),
        ));
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["bucket"]["id"], "a/b");
        assert_eq!(json["bucket"]["branch"], "main");

        let back: QueueItem = serde_json::from_value(json).unwrap();
        assert_eq!(back, item);
    }
}
