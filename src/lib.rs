//! Push-based processing of social-media event streams.
//!
//! Records flow through chains of [`Stage`]s: each stage receives one item at
//! a time, keeps whatever state it needs across items, and pushes to the
//! targets it owns. Around those chains sit two drivers:
//!
//! - [`Merge`] combines several chronologically ordered sources into one
//!   ordered stream, pulling from each source only on demand.
//! - [`Bridge`] decouples a live, interruption-prone feed from a chain with a
//!   bounded queue, reconnecting after transient failures.
//!
//! # Features
//!
//! - Deduplication, predicate routing, fan-out, batching, counting and
//!   time-bucketed grouping into gzip files
//! - Out-of-band batch boundary signals
//! - Deterministic resource release: closing a stage closes everything it owns
//! - Watermark-based backpressure reporting and ingestion metrics
//!
//! # Example
//!
//! ```ignore
//! use feed_pipeline::stages::{Dedup, GroupSink, ToRecord};
//! use feed_pipeline::{drive, read_lines, Feeder, Shutdown};
//!
//! let sink = GroupSink::new("%Y-%m-%d-%H.gz")?.in_dir("out");
//! let chain = ToRecord::new(Dedup::by_id(sink));
//! let mut feeder = Feeder::new(read_lines(Some("tweets/".as_ref()))?, chain);
//! drive(&mut feeder, &Shutdown::new())?;
//! ```

pub mod backpressure;
pub mod bridge;
pub mod buffer;
pub mod config;
pub mod error;
pub mod feed;
pub mod merge;
pub mod metrics;
pub mod record;
pub mod shutdown;
pub mod source;
pub mod stage;
pub mod stages;

// Re-exports for convenience
pub use backpressure::{BackpressureMonitor, Transition};
pub use bridge::{Bridge, ProducerExit, QueueSink, StreamConsumer, StreamProducer};
pub use buffer::{bounded_queue, Message, QueueReceiver, QueueSender};
pub use config::{BridgeConfig, FeedConfig, FilterConfig};
pub use error::{PipelineError, Result};
pub use feed::{FeedClient, FeedError, FeedParams, HttpFeedClient};
pub use merge::{Emission, Merge, MergeInput, MergeReport, Step, Tag};
pub use metrics::{FeedMetrics, MetricsSnapshot};
pub use record::{FilterPredicates, Record, Timestamped};
pub use shutdown::Shutdown;
pub use source::{drive, read_lines, DriveReport, Feeder, Pull, PullOutcome};
pub use stage::{BatchEnd, BoxStage, CollectSink, Outcome, SharedTarget, Signal, Stage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
