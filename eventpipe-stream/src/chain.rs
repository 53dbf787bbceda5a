// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrent executor driving admitted events through the stages of a source.
//!
//! Every stage gets its own dispatcher task reading from a bounded channel. Each event is processed
//! in a separate task, the number of tasks running at the same time is limited by a semaphore sized
//! after the concurrency of the stage. A stage forwarding into the full input channel of the next
//! stage waits, which eventually stalls the producer admitting new events into the chain.
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use eventpipe_core::{Event, ProcessingContext, SourceId};
use eventpipe_store::{EventsStorage, ItemStore, normalize_context};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, debug_span, trace};

use crate::error::{PipelineError, ValidationError};
use crate::shutdown::Shutdown;
use crate::stage::{EventStage, StageInput, StageOptions, StageOutput};

/// Stage as it was added to a source.
#[derive(Clone)]
pub(crate) struct RegisteredStage {
    pub(crate) options: StageOptions,
    pub(crate) stage: Arc<dyn EventStage>,
}

/// Ids of events currently travelling through the chain.
#[derive(Clone, Debug, Default)]
pub(crate) struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// Mark an event as in flight. Returns `None` if it already is.
    fn claim(&self, uid: &str) -> Option<Claim> {
        let mut ids = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(uid.to_string()) {
            return None;
        }
        Some(Claim {
            uid: uid.to_string(),
            ids: self.0.clone(),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Event is in flight for as long as its claim is alive.
#[derive(Debug)]
struct Claim {
    uid: String,
    ids: Arc<Mutex<HashSet<String>>>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.uid);
    }
}

#[derive(Debug)]
struct Admitted {
    event: Event,
    context: Option<ProcessingContext>,
    claim: Claim,
}

pub(crate) struct StageChain {
    entry: mpsc::Sender<Admitted>,
    in_flight: InFlight,
    token: CancellationToken,
    dispatchers: Vec<JoinHandle<()>>,
}

impl StageChain {
    /// Spawn one dispatcher per stage.
    ///
    /// Dispatchers stop when the token is cancelled. Fatal errors are reported to the shutdown
    /// handle.
    pub(crate) fn spawn<S>(
        source_id: &SourceId,
        storage: &EventsStorage<S>,
        stages: &[RegisteredStage],
        in_flight: InFlight,
        shutdown: Shutdown,
        token: CancellationToken,
    ) -> Result<Self, ValidationError>
    where
        S: ItemStore + Clone + Send + Sync + 'static,
    {
        let mut dispatchers = Vec::with_capacity(stages.len());

        // Build back to front, every stage needs to know the input of the one after it.
        let mut next = None;
        for registered in stages.iter().rev() {
            let (tx, rx) = mpsc::channel(registered.options.input_buffer_size);
            let worker = Arc::new(StageWorker {
                name: registered.options.name.clone(),
                stage: registered.stage.clone(),
                source_id: source_id.clone(),
                storage: storage.clone(),
                next: next.take(),
                shutdown: shutdown.clone(),
                token: token.clone(),
            });
            let dispatcher = Dispatcher {
                worker,
                rx,
                semaphore: Arc::new(Semaphore::new(registered.options.concurrency)),
                token: token.clone(),
            };
            let span = debug_span!("stage", name = %registered.options.name);
            dispatchers.push(tokio::spawn(dispatcher.run().instrument(span)));
            next = Some(tx);
        }

        let entry = next.ok_or(ValidationError::NoStages)?;

        Ok(Self {
            entry,
            in_flight,
            token,
            dispatchers,
        })
    }

    /// Admit an event at the first stage, waiting while its input buffer is full.
    ///
    /// Returns `false` if the event was still in flight or the chain is shutting down.
    pub(crate) async fn admit(&self, event: Event, context: Option<ProcessingContext>) -> bool {
        let Some(claim) = self.in_flight.claim(&event.uid) else {
            trace!(uid = %event.uid, "event still in flight");
            return false;
        };

        let admitted = Admitted {
            event,
            context,
            claim,
        };

        tokio::select! {
            biased;

            _ = self.token.cancelled() => false,
            result = self.entry.send(admitted) => result.is_ok(),
        }
    }

    /// Stop all dispatchers and wait for the tasks they spawned.
    ///
    /// Events which were not processed yet stay pending in storage.
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        drop(self.entry);
        for dispatcher in self.dispatchers {
            let _ = dispatcher.await;
        }
    }
}

struct StageWorker<S> {
    name: String,
    stage: Arc<dyn EventStage>,
    source_id: SourceId,
    storage: EventsStorage<S>,
    next: Option<mpsc::Sender<Admitted>>,
    shutdown: Shutdown,
    token: CancellationToken,
}

impl<S> StageWorker<S>
where
    S: ItemStore + Send + Sync,
{
    async fn process(&self, admitted: Admitted) -> Result<(), PipelineError> {
        let Admitted {
            event,
            context,
            claim,
        } = admitted;

        let StageOutput {
            mut event,
            context,
            remove,
            processed,
        } = self
            .stage
            .process(&self.token, StageInput { event, context })
            .await
            .map_err(|err| PipelineError::Stage(self.name.clone(), Arc::from(err)))?;

        if remove || (processed && self.next.is_none()) {
            self.storage
                .delete(&self.source_id, &claim.uid)
                .await
                .map_err(PipelineError::storage("delete event"))?;
            debug!(uid = %claim.uid, removed = remove, "event done");
            return Ok(());
        }

        // Events keep the identity they were admitted with.
        event.uid.clone_from(&claim.uid);

        let context = normalize_context(context).map_err(PipelineError::storage("encode context"))?;
        self.storage
            .update(&self.source_id, &event, context.as_ref())
            .await
            .map_err(PipelineError::storage("update event"))?;

        let Some(next) = self.next.as_ref().filter(|_| processed) else {
            trace!(uid = %claim.uid, "event pending until next cycle");
            return Ok(());
        };

        let admitted = Admitted {
            event,
            context,
            claim,
        };

        tokio::select! {
            biased;

            _ = self.token.cancelled() => (),
            // Next dispatcher is gone when the chain is shutting down, the event stays pending.
            _ = next.send(admitted) => (),
        }

        Ok(())
    }
}

struct Dispatcher<S> {
    worker: Arc<StageWorker<S>>,
    rx: mpsc::Receiver<Admitted>,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
}

impl<S> Dispatcher<S>
where
    S: ItemStore + Clone + Send + Sync + 'static,
{
    async fn run(mut self) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break,
                Some(result) = tasks.join_next() => self.reap(result),
                admitted = self.rx.recv() => {
                    let Some(admitted) = admitted else {
                        break;
                    };
                    let Some(permit) = self.acquire().await else {
                        break;
                    };

                    let worker = self.worker.clone();
                    tasks.spawn(
                        async move {
                            let _permit = permit;
                            if let Err(err) = worker.process(admitted).await {
                                worker.shutdown.cancel_with(err);
                            }
                        }
                        .instrument(Span::current()),
                    );
                }
            }
        }

        // Stages observe the cancelled token, wait for them to return.
        while let Some(result) = tasks.join_next().await {
            self.reap(result);
        }
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;

            _ = self.token.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    fn reap(&self, result: Result<(), JoinError>) {
        match result {
            Err(err) if err.is_panic() => self
                .worker
                .shutdown
                .cancel_with(PipelineError::StagePanicked(self.worker.name.clone())),
            _ => (),
        }
    }
}
