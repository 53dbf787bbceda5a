// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core data types of the eventpipe event-processing pipeline.
//!
//! Events are pulled from an upstream collaborator per _source_, a filtered subscription which
//! is identified by a [`SourceId`] and tracks its progress with an opaque [`Cursor`]. Every event
//! travels through a chain of processing stages together with a [`ProcessingContext`], a free-form
//! map stages use to keep track of their own progress across retries.
//!
//! All persisted values are encoded in the Concise Binary Object Representation (CBOR) format, see
//! [`cbor`].
pub mod cbor;
pub mod context;
pub mod cursor;
pub mod event;
mod serde;
pub mod source_id;

pub use context::{ContextError, ProcessingContext};
pub use cursor::Cursor;
pub use event::Event;
pub use source_id::SourceId;

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;
