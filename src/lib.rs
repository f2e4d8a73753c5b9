// src/lib.rs

//! Bucket Crawler Library
//!
//! Discovers package-manifest buckets, crawls their manifests and keeps a
//! search index in sync with them.
//!
//! | Module     | Role                                                      |
//! |------------|-----------------------------------------------------------|
//! | `models`   | bucket references, manifest records, configuration        |
//! | `services` | bucket search, manifest crawling, index reconciliation    |
//! | `storage`  | document index backends                                   |
//! | `queue`    | at-least-once work queue                                  |
//! | `pipeline` | dispatcher, worker pool, retry and timing decorators      |
//! | `lambda`   | AWS Lambda handler (feature `lambda`)                     |

pub mod error;
#[cfg(feature = "lambda")]
pub mod lambda;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod services;
pub mod storage;
pub mod utils;
