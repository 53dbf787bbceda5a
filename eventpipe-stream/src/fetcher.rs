// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contract of the upstream collaborator events are pulled from.
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventpipe_core::{Cursor, Event, Timestamp};
use thiserror::Error;

/// Long poll for new events of one source.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchRequest {
    pub domain: String,
    pub address: String,
    pub event_type: String,

    /// Only consider events at or after this timestamp when no cursor is given.
    pub since: Timestamp,

    /// Position to continue from, `None` on the very first request of a source.
    pub cursor: Option<Cursor>,

    /// Maximum number of events to return.
    pub limit: usize,

    /// How long upstream may hold the request open while waiting for new events.
    pub long_poll_timeout: Duration,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchResponse {
    pub events: Vec<Event>,

    /// Cursor to continue from on the next request.
    pub next_cursor: Cursor,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// No new events arrived within the long poll timeout. Not a failure.
    #[error("long poll timed out without new events")]
    Timeout,

    #[error(transparent)]
    Upstream(Box<dyn StdError + Send + Sync>),
}

impl FetchError {
    pub fn upstream<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        Self::Upstream(err.into())
    }
}

/// Upstream collaborator delivering events with cursor based long polling.
#[async_trait]
pub trait EventFetcher: Send + Sync {
    async fn fetch_events(&self, request: FetchRequest) -> Result<FetchResponse, FetchError>;
}

#[async_trait]
impl<T> EventFetcher for Arc<T>
where
    T: EventFetcher + ?Sized,
{
    async fn fetch_events(&self, request: FetchRequest) -> Result<FetchResponse, FetchError> {
        self.as_ref().fetch_events(request).await
    }
}
