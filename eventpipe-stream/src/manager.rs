// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;

use eventpipe_store::{EventsStorage, ItemStore, MEMORY_STORE_PATH, Store, StoreError};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, info_span};

use crate::error::{PipelineError, ValidationError};
use crate::fetcher::EventFetcher;
use crate::shutdown::Shutdown;
use crate::source::{EventSource, SourceConfig};

/// Builder for an [`EventSourceManager`] backed by a [`Store`] selected from a storage path.
#[derive(Debug)]
pub struct ManagerBuilder {
    storage_path: String,
    parent_token: Option<CancellationToken>,
    span: Option<Span>,
}

impl ManagerBuilder {
    pub fn new() -> Self {
        Self {
            storage_path: MEMORY_STORE_PATH.to_string(),
            parent_token: None,
            span: None,
        }
    }

    /// Path of the SQLite database, `":memory:"` selects the in-memory store.
    ///
    /// Parent directories are created if they do not exist yet.
    pub fn storage_path(mut self, path: impl Into<String>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Cancelling the parent token shuts down the manager and all its sources.
    pub fn parent_token(mut self, token: CancellationToken) -> Self {
        self.parent_token = Some(token);
        self
    }

    /// Span all source spans are nested in. Defaults to the current span.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub async fn build<F>(self, fetcher: F) -> Result<EventSourceManager<Store>, StoreError>
    where
        F: EventFetcher + 'static,
    {
        let store = Store::open(&self.storage_path).await?;

        let shutdown = match &self.parent_token {
            Some(parent) => Shutdown::with_parent(parent),
            None => Shutdown::new(),
        };

        Ok(EventSourceManager {
            storage: EventsStorage::new(store),
            fetcher: Arc::new(fetcher),
            shutdown,
            span: self.span.unwrap_or_else(Span::current),
        })
    }
}

impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Owner of the storage, the upstream fetcher and the shutdown handle shared by all sources.
///
/// A fatal error in any source cancels the manager, the error is kept as the cancellation cause.
///
/// ```no_run
/// # use eventpipe_stream::{EventFetcher, ManagerBuilder, SourceConfig};
/// # async fn run(fetcher: impl EventFetcher + 'static) -> Result<(), Box<dyn std::error::Error>> {
/// let manager = ManagerBuilder::new()
///     .storage_path("/var/lib/eventpipe/items.sqlite")
///     .build(fetcher)
///     .await?;
///
/// let source = manager.create_source(SourceConfig::new("payments").with_domain("billing"))?;
/// // .. add stages and run the source
/// # Ok(())
/// # }
/// ```
pub struct EventSourceManager<S = Store> {
    storage: EventsStorage<S>,
    fetcher: Arc<dyn EventFetcher>,
    shutdown: Shutdown,
    span: Span,
}

impl<S> EventSourceManager<S>
where
    S: ItemStore + Clone + Send + Sync + 'static,
{
    /// Manager on top of an already opened store.
    pub fn new<F>(store: S, fetcher: F) -> Self
    where
        F: EventFetcher + 'static,
    {
        Self {
            storage: EventsStorage::new(store),
            fetcher: Arc::new(fetcher),
            shutdown: Shutdown::new(),
            span: Span::current(),
        }
    }

    pub fn storage(&self) -> &EventsStorage<S> {
        &self.storage
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Error which cancelled the manager, if any.
    pub fn cause(&self) -> Option<PipelineError> {
        self.shutdown.cause()
    }

    /// Stop all sources.
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Create a source, checking its configuration and applying defaults.
    pub fn create_source(&self, config: SourceConfig) -> Result<EventSource<S>, ValidationError> {
        let config = config.validate()?;

        let span = info_span!(
            parent: &self.span,
            "source",
            source_id = %config.id,
            domain = %config.domain,
            address = %config.address,
        );
        span.in_scope(|| debug!(event_type = %config.event_type, since = config.since, "create source"));

        Ok(EventSource::new(
            config,
            self.storage.clone(),
            self.fetcher.clone(),
            self.shutdown.clone(),
            span,
        ))
    }

    /// Stop all sources and close the storage.
    pub async fn close(&self) -> Result<(), PipelineError> {
        self.shutdown.cancel();
        self.storage
            .close()
            .await
            .map_err(PipelineError::storage("close storage"))?;
        info!("manager closed");
        Ok(())
    }

    /// Stop all sources and irrecoverably delete everything they persisted.
    pub async fn destroy(self) -> Result<(), PipelineError> {
        self.shutdown.cancel();
        self.storage
            .destroy()
            .await
            .map_err(PipelineError::storage("destroy storage"))?;
        info!("manager destroyed");
        Ok(())
    }
}
