// src/lambda/mod.rs

//! AWS Lambda handler for the crawler.
//!
//! One function serves two triggers:
//! 1. Queue trigger (`Records[]` in the event): every record body is a
//!    `QueueItem`, crawled and indexed once. Failed records are reported
//!    in `batchItemFailures` so only they are redelivered.
//! 2. Anything else (e.g. a schedule): a bounded run that dispatches into an
//!    in-memory queue and drains it with the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use lambda_runtime::{Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::error::Result;
use crate::models::{Config, QueueBackend, QueueItem};
use crate::pipeline::{Services, run_pipeline};
use crate::utils::CancelSignal;

/// Queue-trigger event envelope.
#[derive(Debug, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "Records")]
    pub records: Vec<QueueRecord>,
}

#[derive(Debug, Deserialize)]
pub struct QueueRecord {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub body: String,
}

/// Partial batch response of the queue trigger.
#[derive(Debug, Default, Serialize)]
pub struct BatchResponse {
    #[serde(rename = "batchItemFailures")]
    pub batch_item_failures: Vec<ItemFailure>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ItemFailure {
    #[serde(rename = "itemIdentifier")]
    pub item_identifier: String,
}

/// Response of a scheduled run.
#[derive(Debug, Default, Serialize)]
pub struct RunResponse {
    pub success: bool,
    pub enqueued: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub upserted: usize,
    pub deleted: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub execution_time_ms: u64,
}

/// Records of one bucket, in arrival order.
type BucketGroup = Vec<(QueueRecord, QueueItem)>;

/// Group records by bucket id. Records whose body is not a `QueueItem` are
/// returned as failures.
fn group_by_bucket(records: Vec<QueueRecord>) -> (Vec<BucketGroup>, Vec<ItemFailure>) {
    let mut groups: Vec<BucketGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut failures = Vec::new();

    for record in records {
        let item: QueueItem = match serde_json::from_str(&record.body) {
            Ok(item) => item,
            Err(e) => {
                error!("Record {} is not a queue item: {}", record.message_id, e);
                failures.push(ItemFailure {
                    item_identifier: record.message_id,
                });
                continue;
            }
        };
        let slot = *index.entry(item.bucket.id.clone()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push((record, item));
    }
    (groups, failures)
}

/// Configuration for the Lambda environment: defaults plus environment.
pub fn load_lambda_config() -> Result<Config> {
    let mut config = Config::default();
    config.apply_env();
    // Scheduled runs own their queue for the length of one invocation.
    config.queue.backend = QueueBackend::Memory;
    config.validate()?;
    Ok(config)
}

/// Shared state of the function, built once per container.
pub struct CrawlerFunction {
    config: Config,
    services: Services,
}

impl CrawlerFunction {
    pub async fn new() -> Result<Self> {
        let config = load_lambda_config()?;
        let services = Services::build(&config).await?;
        Ok(Self { config, services })
    }

    /// Main Lambda handler function.
    #[instrument(skip(self, event))]
    pub async fn handle(
        self: Arc<Self>,
        event: LambdaEvent<Value>,
    ) -> std::result::Result<Value, LambdaError> {
        let (payload, _context) = event.into_parts();

        if payload.get("Records").is_some() {
            let batch: QueueEvent = serde_json::from_value(payload)?;
            let response = self.handle_batch(batch).await;
            return Ok(serde_json::to_value(response)?);
        }

        let response = self.handle_scheduled().await;
        Ok(serde_json::to_value(response)?)
    }

    async fn handle_batch(&self, batch: QueueEvent) -> BatchResponse {
        info!("Processing {} queued buckets", batch.records.len());
        let cancel = CancelSignal::new();
        let workers = self.config.crawler.worker_count();
        let (groups, mut batch_item_failures) = group_by_bucket(batch.records);

        // Groups run concurrently; duplicates of one bucket share a checkout
        // and run one after another.
        let failed: Vec<ItemFailure> = stream::iter(groups)
            .map(|group| {
                let cancel = cancel.clone();
                async move {
                    let mut failures = Vec::new();
                    for (record, item) in group {
                        if let Err(e) = self.services.crawler.run(&item, &cancel).await {
                            error!("Record {} failed: {}", record.message_id, e);
                            failures.push(ItemFailure {
                                item_identifier: record.message_id,
                            });
                        }
                    }
                    failures
                }
            })
            .buffer_unordered(workers)
            .flat_map(stream::iter)
            .collect()
            .await;
        batch_item_failures.extend(failed);

        BatchResponse {
            batch_item_failures,
        }
    }

    async fn handle_scheduled(&self) -> RunResponse {
        let start = std::time::Instant::now();
        let cancel = CancelSignal::new();

        let mut response = match run_pipeline(&self.config, &self.services, &cancel).await {
            Ok(summary) => {
                info!(
                    "Run completed: {} enqueued, {} succeeded, {} failed",
                    summary.dispatch.enqueued, summary.pool.succeeded, summary.pool.failed
                );
                RunResponse {
                    success: summary.pool.failed == 0,
                    enqueued: summary.dispatch.enqueued,
                    succeeded: summary.pool.succeeded,
                    failed: summary.pool.failed,
                    upserted: summary.pool.upserted,
                    deleted: summary.pool.deleted,
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!("Run failed: {}", e);
                RunResponse {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        response.execution_time_ms = start.elapsed().as_millis() as u64;
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_event_parsing() {
        let json = r#"{
            "Records": [
                {
                    "messageId": "m-1",
                    "receiptHandle": "r",
                    "body": "{\"bucket\":{\"id\":\"a/b\",\"url\":\"https://github.com/a/b\"}}",
                    "eventSource": "aws:sqs"
                }
            ]
        }"#;
        let event: QueueEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.records.len(), 1);

        let item: QueueItem = serde_json::from_str(&event.records[0].body).unwrap();
        assert_eq!(item.bucket.id, "a/b");
        assert!(item.bucket.branch.is_none());
    }

    fn record(id: &str, body: &str) -> QueueRecord {
        QueueRecord {
            message_id: id.into(),
            body: body.into(),
        }
    }

    #[test]
    fn test_duplicate_buckets_share_a_group() {
        let a = r#"{"bucket":{"id":"a/b","url":"https://github.com/a/b"}}"#;
        let c = r#"{"bucket":{"id":"c/d","url":"https://github.com/c/d"}}"#;
        let (groups, failures) = group_by_bucket(vec![
            record("m-1", a),
            record("m-2", c),
            record("m-3", a),
            record("m-4", "not json"),
        ]);

        assert_eq!(
            failures,
            vec![ItemFailure {
                item_identifier: "m-4".into()
            }]
        );
        let ids: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|(r, _)| r.message_id.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["m-1", "m-3"], vec!["m-2"]]);
    }

    #[test]
    fn test_batch_response_shape() {
        let response = BatchResponse {
            batch_item_failures: vec![ItemFailure {
                item_identifier: "m-1".into(),
            }],
        };
        let json = serde_json::to_value(response).unwrap();
        assert_eq!(json["batchItemFailures"][0]["itemIdentifier"], "m-1");
    }

    #[test]
    fn test_run_response_omits_empty_error() {
        let json = serde_json::to_value(RunResponse::default()).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["success"], false);
    }
}
