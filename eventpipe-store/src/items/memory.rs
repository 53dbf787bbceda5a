// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use eventpipe_core::{Cursor, SourceId};
use tokio::sync::RwLock;
use tracing::trace;

use crate::items::{Item, ItemStore, effective_limit};
use crate::memory::{MemoryStore, MemoryStoreError};

#[derive(Clone, Debug, Default)]
pub struct ItemsMemoryStore {
    sources: Arc<RwLock<HashMap<SourceId, SourceState>>>,
}

#[derive(Debug, Default)]
struct SourceState {
    cursor: Option<Cursor>,
    last_index: i64,
    /// Items keyed by their order index, iterating yields insertion order.
    items: BTreeMap<i64, StoredItem>,
    /// Lookup of order index by item id.
    ids: HashMap<String, i64>,
}

#[derive(Clone, Debug)]
struct StoredItem {
    id: String,
    data: Vec<u8>,
    context: Vec<u8>,
    locked: bool,
}

impl SourceState {
    fn get_mut(&mut self, id: &str) -> Option<&mut StoredItem> {
        let order_index = self.ids.get(id)?;
        self.items.get_mut(order_index)
    }

    fn collect(
        &self,
        source_id: &SourceId,
        limit: usize,
        filter: impl Fn(&StoredItem) -> bool,
    ) -> Vec<Item> {
        self.items
            .iter()
            .filter(|(_, item)| filter(item))
            .take(effective_limit(limit))
            .map(|(order_index, item)| Item {
                source_id: source_id.clone(),
                id: item.id.clone(),
                data: item.data.clone(),
                context: item.context.clone(),
                order_index: *order_index,
                locked: item.locked,
            })
            .collect()
    }
}

impl MemoryStore {
    async fn list(
        &self,
        source_id: &SourceId,
        limit: usize,
        filter: impl Fn(&StoredItem) -> bool,
    ) -> Vec<Item> {
        let sources = self.items.sources.read().await;
        match sources.get(source_id) {
            Some(state) => state.collect(source_id, limit, filter),
            None => Vec::new(),
        }
    }

    async fn set_locked(
        &self,
        source_id: &SourceId,
        id: &str,
        locked: bool,
    ) -> Result<(), MemoryStoreError> {
        let mut sources = self.items.sources.write().await;
        let item = sources
            .get_mut(source_id)
            .and_then(|state| state.get_mut(id))
            .ok_or_else(|| MemoryStoreError::ItemNotFound(source_id.clone(), id.to_string()))?;
        item.locked = locked;
        Ok(())
    }
}

impl ItemStore for MemoryStore {
    type Error = MemoryStoreError;

    async fn update_cursor(&self, source_id: &SourceId, cursor: &Cursor) -> Result<(), Self::Error> {
        let mut sources = self.items.sources.write().await;
        sources.entry(source_id.clone()).or_default().cursor = Some(cursor.clone());
        Ok(())
    }

    async fn get_cursor(&self, source_id: &SourceId) -> Result<Option<Cursor>, Self::Error> {
        let sources = self.items.sources.read().await;
        Ok(sources.get(source_id).and_then(|state| state.cursor.clone()))
    }

    async fn push(&self, item: &Item) -> Result<i64, Self::Error> {
        let mut sources = self.items.sources.write().await;
        let state = sources.entry(item.source_id.clone()).or_default();

        if state.ids.contains_key(&item.id) {
            return Err(MemoryStoreError::ItemExists(
                item.source_id.clone(),
                item.id.clone(),
            ));
        }

        if state.cursor.is_none() {
            state.cursor = Some(Cursor::default());
        }

        state.last_index += 1;
        let order_index = state.last_index;

        state.ids.insert(item.id.clone(), order_index);
        state.items.insert(
            order_index,
            StoredItem {
                id: item.id.clone(),
                data: item.data.clone(),
                context: item.context.clone(),
                locked: item.locked,
            },
        );

        trace!(source_id = %item.source_id, id = %item.id, order_index, "pushed item");
        Ok(order_index)
    }

    async fn update(&self, item: &Item) -> Result<(), Self::Error> {
        let mut sources = self.items.sources.write().await;
        let stored = sources
            .get_mut(&item.source_id)
            .and_then(|state| state.get_mut(&item.id))
            .ok_or_else(|| {
                MemoryStoreError::ItemNotFound(item.source_id.clone(), item.id.clone())
            })?;
        stored.data = item.data.clone();
        stored.context = item.context.clone();
        Ok(())
    }

    async fn delete(&self, source_id: &SourceId, id: &str) -> Result<bool, Self::Error> {
        let mut sources = self.items.sources.write().await;
        let Some(state) = sources.get_mut(source_id) else {
            return Ok(false);
        };
        match state.ids.remove(id) {
            Some(order_index) => {
                state.items.remove(&order_index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn lock(&self, source_id: &SourceId, id: &str) -> Result<(), Self::Error> {
        self.set_locked(source_id, id, true).await
    }

    async fn unlock(&self, source_id: &SourceId, id: &str) -> Result<(), Self::Error> {
        self.set_locked(source_id, id, false).await
    }

    async fn get_items(&self, source_id: &SourceId, limit: usize) -> Result<Vec<Item>, Self::Error> {
        Ok(self.list(source_id, limit, |_| true).await)
    }

    async fn get_unlocked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<Item>, Self::Error> {
        Ok(self.list(source_id, limit, |item| !item.locked).await)
    }

    async fn get_locked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<Item>, Self::Error> {
        Ok(self.list(source_id, limit, |item| item.locked).await)
    }

    async fn count(&self, source_id: &SourceId) -> Result<usize, Self::Error> {
        let sources = self.items.sources.read().await;
        Ok(sources.get(source_id).map_or(0, |state| state.items.len()))
    }

    async fn get_index(&self, source_id: &SourceId) -> Result<i64, Self::Error> {
        let sources = self.items.sources.read().await;
        Ok(sources
            .get(source_id)
            .and_then(|state| state.items.keys().next_back().copied())
            .unwrap_or(0))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Self::Error> {
        self.items.sources.write().await.clear();
        Ok(())
    }
}
