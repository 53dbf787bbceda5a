// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable, resumable event sources.
//!
//! An [`EventSource`] long polls an upstream [`EventFetcher`] for new events, persists them and
//! drives every pending event through an ordered chain of [`EventStage`]s. Events stay in storage
//! until a stage removes them or the last stage marks them as processed, which makes the pipeline
//! survive crashes at any point: pending events are simply admitted again on the next cycle.
//!
//! Each stage runs with its own concurrency limit and a bounded input buffer. A slow stage fills up
//! its buffer and stalls the stages in front of it, up to the producer.
//!
//! Sources are created by an [`EventSourceManager`] which owns the storage and a shared
//! [`Shutdown`] handle. Any fatal error cancels the manager and is kept as cancellation cause.
mod chain;
pub mod error;
pub mod fetcher;
mod manager;
mod shutdown;
pub mod source;
pub mod stage;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;
#[cfg(test)]
mod tests;

pub use error::{PipelineError, ValidationError};
pub use fetcher::{EventFetcher, FetchError, FetchRequest, FetchResponse};
pub use manager::{EventSourceManager, ManagerBuilder};
pub use shutdown::Shutdown;
pub use source::{EventSource, SourceConfig, SourceStats};
pub use stage::{EventStage, StageError, StageInput, StageOptions, StageOutput};
