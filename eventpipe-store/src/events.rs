// SPDX-License-Identifier: MIT OR Apache-2.0

//! Conversion between events with their processing context and stored items.
use std::error::Error as StdError;

use eventpipe_core::cbor::{DecodeError, EncodeError, decode_cbor, encode_cbor};
use eventpipe_core::{Cursor, Event, ProcessingContext, SourceId};
use thiserror::Error;

use crate::items::{Item, ItemStore, ItemStoreError};

/// Pending event as it was read back from the store.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    pub event: Event,
    pub context: Option<ProcessingContext>,
    pub order_index: i64,
    pub locked: bool,
}

/// Encode a processing context.
///
/// A missing context is encoded as CBOR `null` and decodes back to `None`, not to an empty map.
pub fn encode_context(context: Option<&ProcessingContext>) -> Result<Vec<u8>, EncodeError> {
    encode_cbor(&context)
}

/// Decode a processing context. Empty input decodes to `None`.
pub fn decode_context(bytes: &[u8]) -> Result<Option<ProcessingContext>, DecodeError> {
    if bytes.is_empty() {
        return Ok(None);
    }
    decode_cbor(bytes)
}

/// Run a context through an encode and decode cycle.
///
/// Values inserted by stages end up exactly in the shape they would have after being read back
/// from the store, so a context compares equally whether it was just produced or reloaded.
pub fn normalize_context(
    context: Option<ProcessingContext>,
) -> Result<Option<ProcessingContext>, EventsStorageError> {
    let bytes = encode_context(context.as_ref())
        .map_err(|err| EventsStorageError::Encode("context", err))?;
    decode_context(&bytes)
        .map_err(|err| EventsStorageError::Decode("context", String::new(), err))
}

/// Façade over an [`ItemStore`] speaking in events instead of bytes.
///
/// Events and processing contexts are encoded as CBOR, the resulting bytes are the same for every
/// storage backend.
#[derive(Clone, Debug)]
pub struct EventsStorage<S> {
    store: S,
}

impl<S> EventsStorage<S>
where
    S: ItemStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Underlying item store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn to_item(
        source_id: &SourceId,
        event: &Event,
        context: Option<&ProcessingContext>,
    ) -> Result<Item, EventsStorageError> {
        let data = encode_cbor(event).map_err(|err| EventsStorageError::Encode("event", err))?;
        let context =
            encode_context(context).map_err(|err| EventsStorageError::Encode("context", err))?;
        Ok(Item::new(source_id.clone(), event.uid.clone(), data, context))
    }

    fn from_item(item: Item) -> Result<StoredEvent, EventsStorageError> {
        let event = decode_cbor(&item.data[..])
            .map_err(|err| EventsStorageError::Decode("event", item.id.clone(), err))?;
        let context = decode_context(&item.context)
            .map_err(|err| EventsStorageError::Decode("context", item.id.clone(), err))?;
        Ok(StoredEvent {
            event,
            context,
            order_index: item.order_index,
            locked: item.locked,
        })
    }

    fn from_items(items: Vec<Item>) -> Result<Vec<StoredEvent>, EventsStorageError> {
        items.into_iter().map(Self::from_item).collect()
    }

    /// Persist a newly fetched event, returning its order index.
    ///
    /// Fails with [`EventsStorageError::ItemExists`] if the event is already pending.
    pub async fn push(
        &self,
        source_id: &SourceId,
        event: &Event,
        context: Option<&ProcessingContext>,
    ) -> Result<i64, EventsStorageError> {
        let item = Self::to_item(source_id, event, context)?;
        self.store.push(&item).await.map_err(|err| {
            if err.is_item_exists() {
                EventsStorageError::ItemExists(source_id.clone(), event.uid.clone())
            } else {
                EventsStorageError::store(err)
            }
        })
    }

    /// Rewrite event and context of a pending event. Fails if it does not exist.
    pub async fn update(
        &self,
        source_id: &SourceId,
        event: &Event,
        context: Option<&ProcessingContext>,
    ) -> Result<(), EventsStorageError> {
        let item = Self::to_item(source_id, event, context)?;
        self.store.update(&item).await.map_err(EventsStorageError::store)
    }

    pub async fn delete(&self, source_id: &SourceId, uid: &str) -> Result<bool, EventsStorageError> {
        self.store
            .delete(source_id, uid)
            .await
            .map_err(EventsStorageError::store)
    }

    pub async fn lock(&self, source_id: &SourceId, uid: &str) -> Result<(), EventsStorageError> {
        self.store
            .lock(source_id, uid)
            .await
            .map_err(EventsStorageError::store)
    }

    pub async fn unlock(&self, source_id: &SourceId, uid: &str) -> Result<(), EventsStorageError> {
        self.store
            .unlock(source_id, uid)
            .await
            .map_err(EventsStorageError::store)
    }

    pub async fn get_items(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventsStorageError> {
        let items = self
            .store
            .get_items(source_id, limit)
            .await
            .map_err(EventsStorageError::store)?;
        Self::from_items(items)
    }

    pub async fn get_unlocked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventsStorageError> {
        let items = self
            .store
            .get_unlocked(source_id, limit)
            .await
            .map_err(EventsStorageError::store)?;
        Self::from_items(items)
    }

    pub async fn get_locked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<StoredEvent>, EventsStorageError> {
        let items = self
            .store
            .get_locked(source_id, limit)
            .await
            .map_err(EventsStorageError::store)?;
        Self::from_items(items)
    }

    pub async fn get_cursor(&self, source_id: &SourceId) -> Result<Option<Cursor>, EventsStorageError> {
        self.store
            .get_cursor(source_id)
            .await
            .map_err(EventsStorageError::store)
    }

    pub async fn update_cursor(
        &self,
        source_id: &SourceId,
        cursor: &Cursor,
    ) -> Result<(), EventsStorageError> {
        self.store
            .update_cursor(source_id, cursor)
            .await
            .map_err(EventsStorageError::store)
    }

    /// Number of pending events of a source.
    pub async fn count(&self, source_id: &SourceId) -> Result<usize, EventsStorageError> {
        self.store
            .count(source_id)
            .await
            .map_err(EventsStorageError::store)
    }

    pub async fn get_index(&self, source_id: &SourceId) -> Result<i64, EventsStorageError> {
        self.store
            .get_index(source_id)
            .await
            .map_err(EventsStorageError::store)
    }

    pub async fn close(&self) -> Result<(), EventsStorageError> {
        self.store.close().await.map_err(EventsStorageError::store)
    }

    /// Irrecoverably delete all sources, events and cursors.
    pub async fn destroy(&self) -> Result<(), EventsStorageError> {
        self.store.destroy().await.map_err(EventsStorageError::store)
    }
}

#[derive(Debug, Error)]
pub enum EventsStorageError {
    /// Storage backend failed.
    #[error("storage backend error: {0}")]
    Store(#[source] Box<dyn StdError + Send + Sync>),

    /// Event is already pending for this source.
    #[error("event '{1}' of source '{0}' is already pending")]
    ItemExists(SourceId, String),

    /// Encoding a value before storing it failed. This is a critical error.
    #[error("failed encoding '{0}' value before storing it: {1}")]
    Encode(&'static str, EncodeError),

    /// Invalid, corrupted data was found in the store. This is a critical error.
    #[error("could not decode corrupted '{0}' value of item '{1}': {2}")]
    Decode(&'static str, String, DecodeError),
}

impl EventsStorageError {
    pub fn is_item_exists(&self) -> bool {
        matches!(self, Self::ItemExists(..))
    }

    fn store<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Store(Box::new(err))
    }
}
