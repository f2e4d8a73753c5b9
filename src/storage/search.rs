// src/storage/search.rs

//! Hosted search service backend.
//!
//! Speaks the Azure Cognitive Search REST dialect:
//!
//! | Operation         | Request                                                |
//! |-------------------|--------------------------------------------------------|
//! | `upsert`          | `POST docs/index` with `@search.action: upload`        |
//! | `delete`          | `POST docs/index` with `@search.action: delete`        |
//! | `keys_for_bucket` | `POST docs/search`, filter `bucketId eq '<id>'`, paged |
//! | `bucket_ids`      | `POST docs/search`, facet on `bucketId`                |

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AppError, Result};
use crate::models::{IndexConfig, IndexDocument, Key};
use crate::storage::DocumentIndex;
use crate::utils::http::check_status;

/// Page size of key listing requests.
const LIST_PAGE_SIZE: usize = 1000;
/// Upper bound on distinct bucket ids returned by the facet query.
const FACET_LIMIT: usize = 100_000;

#[derive(Serialize)]
struct IndexAction<'a, T: Serialize> {
    #[serde(rename = "@search.action")]
    action: &'static str,
    #[serde(flatten)]
    doc: &'a T,
}

#[derive(Serialize)]
struct KeyOnly<'a> {
    key: &'a Key,
}

#[derive(Deserialize)]
struct IndexResponse {
    #[serde(default)]
    value: Vec<IndexResult>,
}

#[derive(Deserialize)]
struct IndexResult {
    key: String,
    status: bool,
    #[serde(default, rename = "errorMessage")]
    error_message: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    value: Vec<KeyHit>,
    #[serde(default, rename = "@search.facets")]
    facets: Option<Facets>,
}

#[derive(Deserialize)]
struct KeyHit {
    key: Key,
}

#[derive(Deserialize)]
struct Facets {
    #[serde(default, rename = "bucketId")]
    bucket_id: Vec<FacetValue>,
}

#[derive(Deserialize)]
struct FacetValue {
    value: Value,
}

/// Client of a hosted search index.
pub struct HttpSearchIndex {
    client: Client,
    base_url: String,
    api_version: String,
    api_key: Option<String>,
}

impl HttpSearchIndex {
    pub fn new(client: Client, config: &IndexConfig) -> Self {
        Self {
            client,
            base_url: format!(
                "{}/indexes/{}",
                config.endpoint.trim_end_matches('/'),
                config.name
            ),
            api_version: config.api_version.clone(),
            api_key: config.api_key.clone(),
        }
    }

    async fn post(&self, op: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/docs/{}", self.base_url, op);
        let mut request = self
            .client
            .post(&url)
            .query(&[("api-version", self.api_version.as_str())])
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        check_status(request.send().await?).await
    }

    /// Submit an index batch; partial failures (HTTP 207) become errors.
    async fn index_batch(&self, actions: Vec<Value>) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        let count = actions.len();
        let response = self.post("index", &json!({ "value": actions })).await?;
        let body: IndexResponse = response.json().await?;

        let failed: Vec<String> = body
            .value
            .into_iter()
            .filter(|r| !r.status)
            .map(|r| format!("{}: {}", r.key, r.error_message.unwrap_or_default()))
            .collect();
        if !failed.is_empty() {
            return Err(AppError::index_write(format!(
                "{} of {} actions failed ({})",
                failed.len(),
                count,
                failed.join("; ")
            )));
        }
        Ok(())
    }
}

/// OData string literal: single quotes are doubled.
pub fn odata_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl DocumentIndex for HttpSearchIndex {
    async fn upsert(&self, docs: &[IndexDocument]) -> Result<()> {
        let actions = docs
            .iter()
            .map(|doc| serde_json::to_value(IndexAction { action: "upload", doc }))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.index_batch(actions).await
    }

    async fn keys_for_bucket(&self, bucket_id: &str) -> Result<HashSet<Key>> {
        let filter = format!("bucketId eq {}", odata_string(bucket_id));
        let mut keys = HashSet::new();
        let mut skip = 0;

        loop {
            let body = json!({
                "search": "*",
                "filter": filter,
                "select": "key",
                "orderby": "key",
                "top": LIST_PAGE_SIZE,
                "skip": skip,
            });
            let page: SearchResponse = self.post("search", &body).await?.json().await?;
            let n = page.value.len();
            keys.extend(page.value.into_iter().map(|hit| hit.key));
            if n < LIST_PAGE_SIZE {
                break;
            }
            skip += n;
        }
        Ok(keys)
    }

    async fn delete(&self, _bucket_id: &str, keys: &[Key]) -> Result<()> {
        let actions = keys
            .iter()
            .map(|key| {
                serde_json::to_value(IndexAction {
                    action: "delete",
                    doc: &KeyOnly { key },
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.index_batch(actions).await
    }

    async fn bucket_ids(&self) -> Result<HashSet<String>> {
        let body = json!({
            "search": "*",
            "top": 0,
            "facets": [format!("bucketId,count:{FACET_LIMIT}")],
        });
        let page: SearchResponse = self.post("search", &body).await?.json().await?;
        Ok(page
            .facets
            .map(|f| f.bucket_id)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|facet| facet.value.as_str().map(String::from))
            .collect())
    }
}
