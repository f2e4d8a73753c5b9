//! AWS Lambda entry point for the bucket crawler
//!
//! Deploy with `cargo lambda build --release --features lambda`.

use std::sync::Arc;

use bucket_crawler::lambda::CrawlerFunction;
use lambda_runtime::{Error as LambdaError, LambdaEvent, service_fn};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the AWS Lambda function.
#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    // `init` also forwards `log` records from the library into tracing.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Bucket crawler function starting...");
    let function = Arc::new(CrawlerFunction::new().await?);

    lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
        Arc::clone(&function).handle(event)
    }))
    .await
}
