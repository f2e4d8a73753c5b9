// src/services/discovery.rs

//! Repository search against a GitHub-compatible API.

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;

use crate::error::Result;
use crate::models::{BucketReference, DiscoveryConfig, bucket_id_from_url};
use crate::services::{BucketSearch, SearchPage};
use crate::utils::http::check_status;

/// Topic search needs the preview media type on older API versions.
const SEARCH_MEDIA_TYPE: &str = "application/vnd.github.mercy-preview+json";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    total_count: u64,
    #[serde(default)]
    items: Vec<GitHubRepo>,
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    full_name: String,
    html_url: String,
    #[serde(default)]
    clone_url: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
}

/// GitHub repository search.
pub struct GitHubSearch {
    client: Client,
    api_url: String,
    token: Option<String>,
}

impl GitHubSearch {
    pub fn new(client: Client, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    fn parse_page(body: SearchResponse) -> SearchPage {
        let buckets = body
            .items
            .into_iter()
            .map(|repo| {
                let url = repo.clone_url.unwrap_or(repo.html_url);
                let id = bucket_id_from_url(&url)
                    .unwrap_or_else(|_| repo.full_name.to_lowercase());
                BucketReference::new(&id, url, repo.default_branch)
            })
            .filter(|bucket| !bucket.id.is_empty())
            .collect();

        SearchPage {
            buckets,
            total_count: body.total_count,
        }
    }
}

#[async_trait]
impl BucketSearch for GitHubSearch {
    async fn search_page(&self, query: &str, page: u32, per_page: u32) -> Result<SearchPage> {
        let url = format!("{}/search/repositories", self.api_url);
        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, SEARCH_MEDIA_TYPE)
            .query(&[
                ("q", query.to_string()),
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
            ]);
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Token {token}"));
        }

        let response = check_status(request.send().await?).await?;
        let body: SearchResponse = response.json().await?;
        let page_result = Self::parse_page(body);

        log::debug!(
            "Search '{}' page {}: {} buckets (total {})",
            query,
            page,
            page_result.buckets.len(),
            page_result.total_count
        );
        Ok(page_result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search_response() {
        let json = r#"{
            "total_count": 2,
            "incomplete_results": false,
            "items": [
                {
                    "full_name": "ScoopInstaller/Extras",
                    "html_url": "https://github.com/ScoopInstaller/Extras",
                    "clone_url": "https://github.com/ScoopInstaller/Extras.git",
                    "default_branch": "master"
                },
                {
                    "full_name": "someone/my-bucket",
                    "html_url": "https://github.com/someone/my-bucket"
                }
            ]
        }"#;
        let body: SearchResponse = serde_json::from_str(json).unwrap();
        let page = GitHubSearch::parse_page(body);

        assert_eq!(page.total_count, 2);
        assert_eq!(page.buckets.len(), 2);
        assert_eq!(page.buckets[0].id, "scoopinstaller/extras");
        assert_eq!(page.buckets[0].branch.as_deref(), Some("master"));
        assert_eq!(page.buckets[1].id, "someone/my-bucket");
        assert!(page.buckets[1].branch.is_none());
    }

    #[test]
    fn test_empty_items_is_empty_page() {
        let body: SearchResponse = serde_json::from_str(r#"{"total_count": 0}"#).unwrap();
        let page = GitHubSearch::parse_page(body);
        assert!(page.buckets.is_empty());
    }

    #[test]
    fn test_api_url_trailing_slash() {
        let config = DiscoveryConfig {
            api_url: "https://ghe.example.com/api/v3/".into(),
            ..DiscoveryConfig::default()
        };
        let search = GitHubSearch::new(Client::new(), &config);
        assert_eq!(search.api_url, "https://ghe.example.com/api/v3");
    }
}
