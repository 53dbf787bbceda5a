// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::error::PipelineError;

/// Cancellation token which remembers why it was cancelled.
///
/// Only the first cause is kept, errors following it are usually consequences of the first one.
#[derive(Clone, Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
    cause: Arc<OnceLock<PipelineError>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shutdown handle which is cancelled together with the given parent token.
    pub fn with_parent(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            cause: Arc::default(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel without a cause.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and keep the error as the cause if there is none yet.
    pub fn cancel_with(&self, err: PipelineError) {
        if self.cause.set(err.clone()).is_ok() {
            error!(%err, "pipeline cancelled");
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Error which caused the cancellation, if any.
    pub fn cause(&self) -> Option<PipelineError> {
        self.cause.get().cloned()
    }
}
