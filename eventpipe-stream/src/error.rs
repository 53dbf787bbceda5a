// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error as StdError;
use std::sync::Arc;

use eventpipe_store::EventsStorageError;
use thiserror::Error;

use crate::fetcher::FetchError;

/// Invalid source or stage configuration, rejected before anything runs.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source id is required")]
    MissingSourceId,

    #[error("at least one of domain or address filter must be set")]
    MissingFilter,

    #[error("stage name must not be empty")]
    EmptyStageName,

    #[error("stage '{0}' needs a concurrency of at least 1")]
    ZeroConcurrency(String),

    #[error("stage '{0}' needs an input buffer size of at least 1")]
    ZeroInputBufferSize(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("source has no stages registered")]
    NoStages,
}

/// Fatal error aborting the run of a source.
///
/// The first error of a run is kept as the cancellation cause of the pipeline, see
/// [`Shutdown::cause`](crate::Shutdown::cause). Inner errors are reference counted so the cause can
/// be handed out to every interested party.
#[derive(Clone, Debug, Error)]
pub enum PipelineError {
    /// Storage failed while performing the described operation.
    #[error("storage failed to {0}: {1}")]
    Storage(&'static str, #[source] Arc<EventsStorageError>),

    /// Stage returned an error.
    #[error("stage '{0}' failed: {1}")]
    Stage(String, #[source] Arc<dyn StdError + Send + Sync>),

    /// Stage task panicked.
    #[error("stage '{0}' panicked")]
    StagePanicked(String),

    /// Upstream returned an error other than a timeout.
    #[error("fetching events from upstream failed: {0}")]
    Fetch(#[source] Arc<FetchError>),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl PipelineError {
    pub(crate) fn storage(operation: &'static str) -> impl FnOnce(EventsStorageError) -> Self {
        move |err| Self::Storage(operation, Arc::new(err))
    }
}
