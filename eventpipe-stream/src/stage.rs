// SPDX-License-Identifier: MIT OR Apache-2.0

//! Processing stages of a source.
use std::error::Error as StdError;

use async_trait::async_trait;
use eventpipe_core::{Event, ProcessingContext};
use tokio_util::sync::CancellationToken;

use crate::error::ValidationError;

/// Error returned by a stage. Any error is fatal for the run of the source.
pub type StageError = Box<dyn StdError + Send + Sync>;

/// Default number of items a stage processes at the same time.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default number of items which may queue up in front of a stage.
pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 1;

/// Event handed to a stage together with its current processing context.
#[derive(Clone, Debug, PartialEq)]
pub struct StageInput {
    pub event: Event,
    pub context: Option<ProcessingContext>,
}

/// Outcome of processing one event.
///
/// - `remove`: the event is deleted from storage and skips the rest of the chain.
/// - `processed`: the stage is done with the event for this pass and forwards it to the next
///   stage. When returned by the last stage the event is deleted.
/// - neither: the returned event and context are stored and the event waits for the next poll
///   cycle, where it is admitted at the first stage again.
///
/// `remove` wins over `processed`.
#[derive(Clone, Debug, PartialEq)]
pub struct StageOutput {
    pub event: Event,
    pub context: Option<ProcessingContext>,
    pub remove: bool,
    pub processed: bool,
}

impl StageOutput {
    /// Forward the event to the next stage.
    pub fn processed(event: Event, context: Option<ProcessingContext>) -> Self {
        Self {
            event,
            context,
            remove: false,
            processed: true,
        }
    }

    /// Keep the event pending and try again on the next poll cycle.
    pub fn pending(event: Event, context: Option<ProcessingContext>) -> Self {
        Self {
            event,
            context,
            remove: false,
            processed: false,
        }
    }

    /// Drop the event.
    pub fn remove(event: Event) -> Self {
        Self {
            event,
            context: None,
            remove: true,
            processed: false,
        }
    }
}

/// One unit in the processing chain of a source.
///
/// Every poll cycle admits all pending events at the first stage again, regardless of how far they
/// got earlier. Stages which can't safely redo their work have to keep track of it themselves, for
/// example with a marker in the processing context.
///
/// The cancellation token fires when the source shuts down. Long running stages should observe it
/// and return promptly, cancellation is cooperative.
#[async_trait]
pub trait EventStage: Send + Sync {
    async fn process(
        &self,
        token: &CancellationToken,
        input: StageInput,
    ) -> Result<StageOutput, StageError>;
}

/// Registration options of a stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageOptions {
    /// Display name, used in logs and errors.
    pub name: String,

    /// Number of events this stage may process simultaneously.
    pub concurrency: usize,

    /// Number of events which may wait in front of this stage.
    ///
    /// Together with the concurrency this bounds the memory of the chain: a stage with a full
    /// buffer stalls the stage before it, up to the producer.
    pub input_buffer_size: usize,
}

impl StageOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn input_buffer_size(mut self, size: usize) -> Self {
        self.input_buffer_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::EmptyStageName);
        }
        if self.concurrency == 0 {
            return Err(ValidationError::ZeroConcurrency(self.name.clone()));
        }
        if self.input_buffer_size == 0 {
            return Err(ValidationError::ZeroInputBufferSize(self.name.clone()));
        }
        Ok(())
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            concurrency: DEFAULT_CONCURRENCY,
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
        }
    }
}
