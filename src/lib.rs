//! Order-preserving, backpressure-aware concurrent data pipelines on tokio.
//!
//! A [`Pipeline`] chains stages over a single [`Source`]. Each stage may run many
//! invocations at once, yet every stage emits its outputs in the order its inputs arrived.
//! Stages are connected by bounded buffers, so a slow stage pauses the ones upstream of
//! it instead of letting work pile up.
//!
//! # Features
//!
//! - Per-stage concurrency (`max_parallel`) and buffering (`high_water_mark`) limits
//! - Async or sync transforms, filters, fan-out ([`Pipeline::split`]) and fan-in ([`Pipeline::batch`])
//! - Pre-built components through the [`Stage`] trait
//! - Lazy execution with auto-start, and a single multicast outcome per run
//! - First error wins: any failure halts the whole pipeline
//! - Per-stage metrics: throughput, latency percentiles, backpressure events
//!
//! # Example
//!
//! ```ignore
//! use parflow::Pipeline;
//!
//! let lengths = Pipeline::from_iter(vec!["alpha beta", "gamma"])
//!     .map(|line: &str| line.split_whitespace().map(str::to_owned).collect::<Vec<_>>(), 1)
//!     .split()
//!     .then(|word| async move { word.len() }, 8)
//!     .collect()
//!     .await?;
//!
//! assert_eq!(lengths, vec![5, 4, 5]);
//! ```

pub mod backpressure;
pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
mod outcome;
pub mod pipeline;
pub mod runner;
pub mod source;
pub mod stage;
pub mod structural;
pub mod transform;

// Re-exports for convenience
pub use config::{Limits, PipelineConfig, StageOptions};
pub use error::{BoxError, PanicError, PipelineError, Result};
pub use metrics::{LatencyPercentiles, MetricsSnapshot, StageMetrics};
pub use pipeline::{Pipeline, StageKind, StageSpec};
pub use runner::Execution;
pub use source::Source;
pub use stage::{Inlet, Outlet, PassthroughStage, Stage, StageContext};
pub use structural::{Batch, Split};
pub use transform::{Emitter, Invoke, KeepIf, ParallelTransform};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
