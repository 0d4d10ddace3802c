//! Archive Shipper Library
//!
//! This library replays structured logs from test-run archives into a Seq
//! CLEF ingestion endpoint:
//!
//! - **archive**: tar (and tar.gz) reader yielding member streams lazily
//! - **filter**: member eligibility by component name and extension
//! - **decoder**: extraction of the `log` payload from JSON envelopes
//! - **batch**: byte- or line-bounded batching of payloads
//! - **client**: HTTP delivery with outcome classification and retry policy
//! - **pipeline**: the sequential driver wiring the stages together
//! - **config** / **cli**: environment and command-line configuration
//!
//! # Example
//!
//! ```no_run
//! use archive_shipper::client::HttpDelivery;
//! use archive_shipper::config::Config;
//! use archive_shipper::pipeline::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let client = HttpDelivery::new(&config).expect("Failed to create client");
//!
//!     let pipeline = Pipeline::new(PipelineConfig::from(&config), client);
//!     pipeline.run("end2end-logs.tar").await.ok();
//! }
//! ```

pub mod archive;
pub mod batch;
pub mod cli;
pub mod client;
pub mod config;
pub mod decoder;
pub mod filter;
pub mod pipeline;

pub use archive::{Archive, ArchiveError, Member, MemberCursor};
pub use batch::{Batch, BatchScope, Batcher, BatcherStats, FlushPolicy};
pub use client::{ClientError, Deliver, DeliveryOutcome, HttpDelivery, RetryPolicy};
pub use config::{Config, ConfigError};
pub use decoder::LineDecoder;
pub use filter::MemberFilter;
pub use pipeline::{MemberReport, Pipeline, PipelineConfig, PipelineError, RunReport};
