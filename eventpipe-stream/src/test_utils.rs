// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scripted upstream and instrumented stages for testing pipelines.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventpipe_core::{Cursor, Event, ProcessingContext};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::fetcher::{EventFetcher, FetchError, FetchRequest, FetchResponse};
use crate::stage::{EventStage, StageError, StageInput, StageOutput};

/// Context key the [`CountingStage`] keeps its attempt counter under.
pub const ATTEMPTS_KEY: &str = "attempts";

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

pub fn test_event(uid: &str) -> Event {
    Event::new(uid, "invoice.created")
        .with_domain("billing")
        .with_payload(uid.as_bytes().to_vec())
        .with_timestamp(1_700_000_000_000)
}

/// Upstream answering long polls from a script.
///
/// Every call pops the next scripted answer. Once the script ran out every call times out.
#[derive(Clone, Debug, Default)]
pub struct MockFetcher {
    script: Arc<Mutex<VecDeque<Result<FetchResponse, FetchError>>>>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_events(&self, events: Vec<Event>, next_cursor: &str) {
        self.script.lock().unwrap().push_back(Ok(FetchResponse {
            events,
            next_cursor: Cursor::from(next_cursor),
        }));
    }

    pub fn push_timeout(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(FetchError::Timeout));
    }

    pub fn push_error(&self, message: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(FetchError::upstream(message.to_string())));
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventFetcher for MockFetcher {
    async fn fetch_events(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push(request);
        let answer = self.script.lock().unwrap().pop_front();
        answer.unwrap_or(Err(FetchError::Timeout))
    }
}

/// Upstream which accepts long polls but never answers them.
#[derive(Clone, Debug, Default)]
pub struct StallingFetcher {
    requests: Arc<Mutex<Vec<(Instant, FetchRequest)>>>,
}

impl StallingFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// All requests received so far, with the time they arrived.
    pub fn requests(&self) -> Vec<(Instant, FetchRequest)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventFetcher for StallingFetcher {
    async fn fetch_events(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.requests.lock().unwrap().push((Instant::now(), request));
        std::future::pending().await
    }
}

#[derive(Clone, Copy, Debug)]
enum Outcome {
    Processed,
    Remove,
}

/// Stage recording every call.
///
/// The stage can be configured to keep an event pending a number of times before it lets it pass,
/// attempts are counted in the processing context under [`ATTEMPTS_KEY`].
#[derive(Clone, Debug)]
pub struct CountingStage {
    outcome: Outcome,
    pending_attempts: u32,
    delay: Duration,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    contexts: Arc<Mutex<HashMap<String, Option<ProcessingContext>>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

impl CountingStage {
    /// Stage marking every event as processed.
    pub fn new() -> Self {
        Self {
            outcome: Outcome::Processed,
            pending_attempts: 0,
            delay: Duration::ZERO,
            calls: Arc::default(),
            contexts: Arc::default(),
            running: Arc::default(),
            max_running: Arc::default(),
        }
    }

    /// Stage keeping every event pending for the given number of attempts.
    pub fn retrying(pending_attempts: u32) -> Self {
        Self {
            pending_attempts,
            ..Self::new()
        }
    }

    /// Stage removing every event.
    pub fn removing() -> Self {
        Self {
            outcome: Outcome::Remove,
            ..Self::new()
        }
    }

    /// Sleep for the given duration on every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls for the given event.
    pub fn calls(&self, uid: &str) -> usize {
        self.calls.lock().unwrap().get(uid).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Context the event was handed in with on its last call.
    pub fn last_context(&self, uid: &str) -> Option<ProcessingContext> {
        self.contexts.lock().unwrap().get(uid).cloned().flatten()
    }

    /// Highest number of calls which were running at the same time.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl Default for CountingStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStage for CountingStage {
    async fn process(
        &self,
        token: &CancellationToken,
        input: StageInput,
    ) -> Result<StageOutput, StageError> {
        let StageInput { event, context } = input;

        *self
            .calls
            .lock()
            .unwrap()
            .entry(event.uid.clone())
            .or_default() += 1;
        self.contexts
            .lock()
            .unwrap()
            .insert(event.uid.clone(), context.clone());

        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = token.cancelled() => (),
                _ = tokio::time::sleep(self.delay) => (),
            }
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if let Outcome::Remove = self.outcome {
            return Ok(StageOutput::remove(event));
        }

        if self.pending_attempts == 0 {
            return Ok(StageOutput::processed(event, context));
        }

        let mut context = context.unwrap_or_default();
        let attempts = context.get::<u32>(ATTEMPTS_KEY)?.unwrap_or(0) + 1;
        context.insert(ATTEMPTS_KEY, &attempts)?;

        if attempts <= self.pending_attempts {
            Ok(StageOutput::pending(event, Some(context)))
        } else {
            Ok(StageOutput::processed(event, Some(context)))
        }
    }
}

/// Stage failing on every call.
#[derive(Clone, Debug, Default)]
pub struct FailingStage;

#[async_trait]
impl EventStage for FailingStage {
    async fn process(
        &self,
        _token: &CancellationToken,
        input: StageInput,
    ) -> Result<StageOutput, StageError> {
        Err(format!("can't handle event {}", input.event.uid).into())
    }
}
