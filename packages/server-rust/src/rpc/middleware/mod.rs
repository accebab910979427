//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`timeout`]: Per-request handler deadline
//! - [`trace`]: Request timing and outcome via `tracing` spans
//! - [`pipeline`]: Composes all layers around the route table

pub mod pipeline;
pub mod timeout;
pub mod trace;

pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
pub use timeout::TimeoutLayer;
pub use trace::TraceLayer;
