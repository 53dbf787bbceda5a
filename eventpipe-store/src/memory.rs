// SPDX-License-Identifier: MIT OR Apache-2.0

use eventpipe_core::SourceId;
use thiserror::Error;

use crate::items::{ItemStoreError, ItemsMemoryStore};

/// In-memory store.
///
/// This does not persist data permamently, all changes are lost when the process ends. Use this
/// only in development or test contexts.
///
/// Cloned instances share the same underlying state.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    pub(crate) items: ItemsMemoryStore,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// Trait implementations are in the regarding modules, see for example `items`.

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("item '{1}' of source '{0}' already exists")]
    ItemExists(SourceId, String),

    #[error("item '{1}' of source '{0}' not found")]
    ItemNotFound(SourceId, String),
}

impl ItemStoreError for MemoryStoreError {
    fn is_item_exists(&self) -> bool {
        matches!(self, Self::ItemExists(..))
    }
}
