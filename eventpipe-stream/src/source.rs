// SPDX-License-Identifier: MIT OR Apache-2.0

//! Producer loop of a single source.
use std::sync::Arc;
use std::time::Duration;

use eventpipe_core::{Cursor, SourceId, Timestamp};
use eventpipe_store::{DEFAULT_LIMIT, EventsStorage, ItemStore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info, trace, warn};

use crate::chain::{InFlight, RegisteredStage, StageChain};
use crate::error::{PipelineError, ValidationError};
use crate::fetcher::{EventFetcher, FetchError, FetchRequest};
use crate::shutdown::Shutdown;
use crate::stage::{EventStage, StageOptions};

/// Long poll timeout applied when none was configured.
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Time the producer waits between two cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Maximum number of events requested from upstream per cycle.
pub const DEFAULT_FETCH_LIMIT: usize = 100;

/// Extra time a long poll request gets on top of its timeout to return cleanly.
pub const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

/// Parameters of a source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceConfig {
    pub id: SourceId,
    pub domain: String,
    pub address: String,
    pub event_type: String,

    /// Lower time bound of the subscription, used as long as there is no cursor.
    pub since: Timestamp,

    /// How long upstream may hold a long poll open. Zero selects [`DEFAULT_LONG_POLL_TIMEOUT`].
    pub long_poll_timeout: Duration,

    pub poll_interval: Duration,
    pub fetch_limit: usize,

    /// Maximum number of pending events admitted per cycle. Zero selects
    /// [`DEFAULT_LIMIT`](eventpipe_store::DEFAULT_LIMIT).
    pub reload_limit: usize,
}

impl SourceConfig {
    pub fn new(id: impl Into<SourceId>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Source with an id derived from its filters.
    ///
    /// Creating a source from the same filters after a restart continues where it left off.
    pub fn derived(
        domain: impl Into<String>,
        address: impl Into<String>,
        event_type: impl Into<String>,
        since: Timestamp,
    ) -> Self {
        let domain = domain.into();
        let address = address.into();
        let event_type = event_type.into();
        Self {
            id: SourceId::derive(&domain, &address, &event_type, since),
            domain,
            address,
            event_type,
            since,
            ..Default::default()
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_since(mut self, since: Timestamp) -> Self {
        self.since = since;
        self
    }

    pub fn with_long_poll_timeout(mut self, long_poll_timeout: Duration) -> Self {
        self.long_poll_timeout = long_poll_timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_fetch_limit(mut self, fetch_limit: usize) -> Self {
        self.fetch_limit = fetch_limit;
        self
    }

    pub fn with_reload_limit(mut self, reload_limit: usize) -> Self {
        self.reload_limit = reload_limit;
        self
    }

    /// Check the configuration and fill in defaults for unset values.
    pub fn validate(mut self) -> Result<Self, ValidationError> {
        if self.id.is_empty() {
            return Err(ValidationError::MissingSourceId);
        }
        if self.domain.is_empty() && self.address.is_empty() {
            return Err(ValidationError::MissingFilter);
        }
        if self.poll_interval.is_zero() {
            return Err(ValidationError::Zero("poll interval"));
        }
        if self.fetch_limit == 0 {
            return Err(ValidationError::Zero("fetch limit"));
        }
        if self.long_poll_timeout.is_zero() {
            self.long_poll_timeout = DEFAULT_LONG_POLL_TIMEOUT;
        }
        Ok(self)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            id: SourceId::default(),
            domain: String::new(),
            address: String::new(),
            event_type: String::new(),
            since: 0,
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fetch_limit: DEFAULT_FETCH_LIMIT,
            reload_limit: DEFAULT_LIMIT,
        }
    }
}

/// Snapshot of the state of a source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Events waiting in storage, including the ones in flight.
    pub pending: usize,

    /// Events currently travelling through the stage chain.
    pub in_flight: usize,

    /// Highest order index among the pending events.
    pub last_index: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunMode {
    Forever,
    UntilDrained,
}

/// One filtered subscription to the upstream feed with its own chain of stages.
///
/// Created by [`EventSourceManager::create_source`](crate::EventSourceManager::create_source).
///
/// Every cycle of the producer:
///
/// 1. waits for the poll interval
/// 2. admits all pending events from storage at the first stage, oldest first
/// 3. long polls upstream for new events after the stored cursor
/// 4. persists new events, they get admitted in the next cycle
/// 5. advances the cursor if at least one event arrived
pub struct EventSource<S> {
    config: SourceConfig,
    storage: EventsStorage<S>,
    fetcher: Arc<dyn EventFetcher>,
    stages: Vec<RegisteredStage>,
    in_flight: InFlight,
    shutdown: Shutdown,
    span: Span,
}

impl<S> EventSource<S>
where
    S: ItemStore + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        config: SourceConfig,
        storage: EventsStorage<S>,
        fetcher: Arc<dyn EventFetcher>,
        shutdown: Shutdown,
        span: Span,
    ) -> Self {
        Self {
            config,
            storage,
            fetcher,
            stages: Vec::new(),
            in_flight: InFlight::default(),
            shutdown,
            span,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.config.id
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Append a stage to the end of the chain.
    pub fn add_stage<T>(&mut self, options: StageOptions, stage: T) -> Result<(), ValidationError>
    where
        T: EventStage + 'static,
    {
        options.validate()?;
        self.span.in_scope(|| debug!(stage = %options.name, "add stage"));
        self.stages.push(RegisteredStage {
            options,
            stage: Arc::new(stage),
        });
        Ok(())
    }

    /// Run the producer until the pipeline is cancelled.
    ///
    /// Returns the cancellation cause if the pipeline was cancelled because of an error.
    pub async fn run(&self) -> Result<(), PipelineError> {
        self.run_with(RunMode::Forever)
            .instrument(self.span.clone())
            .await
    }

    /// Run the producer until upstream has no new events and nothing is pending anymore.
    pub async fn run_until_drained(&self) -> Result<(), PipelineError> {
        self.run_with(RunMode::UntilDrained)
            .instrument(self.span.clone())
            .await
    }

    pub async fn stats(&self) -> Result<SourceStats, PipelineError> {
        let pending = self
            .storage
            .count(&self.config.id)
            .await
            .map_err(PipelineError::storage("count pending events"))?;
        let last_index = self
            .storage
            .get_index(&self.config.id)
            .await
            .map_err(PipelineError::storage("read order index"))?;

        Ok(SourceStats {
            pending,
            in_flight: self.in_flight.len(),
            last_index,
        })
    }

    async fn run_with(&self, mode: RunMode) -> Result<(), PipelineError> {
        if self.stages.is_empty() {
            return Err(ValidationError::NoStages.into());
        }

        // Source local token, stops the chain of this source without touching the others.
        let token = self.shutdown.token().child_token();
        let chain = StageChain::spawn(
            &self.config.id,
            &self.storage,
            &self.stages,
            self.in_flight.clone(),
            self.shutdown.clone(),
            token.clone(),
        )?;

        info!(stages = self.stages.len(), ?mode, "source started");
        let result = self.produce(&chain, &token, mode).await;
        chain.shutdown().await;

        match result {
            Err(err) => {
                self.shutdown.cancel_with(err.clone());
                Err(err)
            }
            Ok(()) => match self.shutdown.cause() {
                Some(cause) => Err(cause),
                None => {
                    info!("source stopped");
                    Ok(())
                }
            },
        }
    }

    async fn produce(
        &self,
        chain: &StageChain,
        token: &CancellationToken,
        mode: RunMode,
    ) -> Result<(), PipelineError> {
        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => return Ok(()),
                _ = sleep(self.config.poll_interval) => (),
            }

            let Some(fetched) = self.cycle(chain, token).await? else {
                return Ok(());
            };

            if mode == RunMode::UntilDrained && fetched == 0 && self.is_drained().await? {
                debug!("source drained");
                return Ok(());
            }
        }
    }

    /// Run one producer cycle, returns the number of fetched events or `None` when cancelled.
    async fn cycle(
        &self,
        chain: &StageChain,
        token: &CancellationToken,
    ) -> Result<Option<usize>, PipelineError> {
        let source_id = &self.config.id;

        let pending = self
            .storage
            .get_items(source_id, self.config.reload_limit)
            .await
            .map_err(PipelineError::storage("load pending events"))?;
        let reloaded = pending.len();

        let mut admitted = 0;
        for stored in pending {
            if chain.admit(stored.event, stored.context).await {
                admitted += 1;
            }
            if token.is_cancelled() {
                return Ok(None);
            }
        }
        if reloaded > 0 {
            debug!(pending = reloaded, admitted, "admitted pending events");
        }

        let cursor = self
            .storage
            .get_cursor(source_id)
            .await
            .map_err(PipelineError::storage("read cursor"))?
            .and_then(Cursor::non_empty);

        let request = FetchRequest {
            domain: self.config.domain.clone(),
            address: self.config.address.clone(),
            event_type: self.config.event_type.clone(),
            since: self.config.since,
            cursor,
            limit: self.config.fetch_limit,
            long_poll_timeout: self.config.long_poll_timeout,
        };
        let deadline = self.config.long_poll_timeout + LONG_POLL_GRACE;

        let response = tokio::select! {
            biased;

            _ = token.cancelled() => return Ok(None),
            response = timeout(deadline, self.fetcher.fetch_events(request)) => response,
        };

        let response = match response {
            Ok(Ok(response)) => response,
            Ok(Err(FetchError::Timeout)) => {
                trace!("long poll returned without new events");
                return Ok(Some(0));
            }
            Ok(Err(err)) => return Err(PipelineError::Fetch(Arc::new(err))),
            Err(_) => {
                warn!(?deadline, "upstream did not answer long poll in time");
                return Ok(Some(0));
            }
        };

        if response.events.is_empty() {
            return Ok(Some(0));
        }

        let fetched = response.events.len();
        let mut pushed = 0;
        for event in response.events {
            match self.storage.push(source_id, &event, None).await {
                Ok(_) => pushed += 1,
                // Redelivered after a crash between persisting and advancing the cursor.
                Err(err) if err.is_item_exists() => {
                    debug!(uid = %event.uid, "skip event which is already pending");
                }
                Err(err) => return Err(PipelineError::storage("persist event")(err)),
            }
        }

        self.storage
            .update_cursor(source_id, &response.next_cursor)
            .await
            .map_err(PipelineError::storage("update cursor"))?;
        debug!(fetched, pushed, cursor = %response.next_cursor, "persisted new events");

        Ok(Some(fetched))
    }

    async fn is_drained(&self) -> Result<bool, PipelineError> {
        if !self.in_flight.is_empty() {
            return Ok(false);
        }

        let pending = self
            .storage
            .count(&self.config.id)
            .await
            .map_err(PipelineError::storage("count pending events"))?;
        Ok(pending == 0)
    }
}
