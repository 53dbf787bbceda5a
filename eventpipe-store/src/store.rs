// SPDX-License-Identifier: MIT OR Apache-2.0

use eventpipe_core::{Cursor, SourceId};
use thiserror::Error;
use tracing::info;

use crate::items::{Item, ItemStore, ItemStoreError};
use crate::memory::{MemoryStore, MemoryStoreError};
use crate::sqlite::{SqliteError, SqliteStore, SqliteStoreBuilder};

/// Storage path selecting the in-memory backend.
pub const MEMORY_STORE_PATH: &str = ":memory:";

/// Storage backend selected at runtime.
///
/// ```no_run
/// # use eventpipe_store::Store;
/// # async fn run() -> Result<(), eventpipe_store::StoreError> {
/// // Durable SQLite database, parent directories are created as needed.
/// let store = Store::open("/var/lib/eventpipe/items.sqlite").await?;
///
/// // Ephemeral store, everything is gone when the process ends.
/// let store = Store::open(":memory:").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub enum Store {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl Store {
    /// Open the store at the given path.
    ///
    /// [`MEMORY_STORE_PATH`] selects the in-memory backend, any other value is treated as the
    /// filesystem path of a SQLite database which is created (and migrated) if needed.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        if path == MEMORY_STORE_PATH {
            info!("using in-memory store");
            return Ok(Self::Memory(MemoryStore::new()));
        }

        let store = SqliteStoreBuilder::new().database_path(path).build().await?;
        info!(path, "using sqlite store");
        Ok(Self::Sqlite(store))
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory(_))
    }
}

impl From<MemoryStore> for Store {
    fn from(value: MemoryStore) -> Self {
        Self::Memory(value)
    }
}

impl From<SqliteStore> for Store {
    fn from(value: SqliteStore) -> Self {
        Self::Sqlite(value)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Memory(#[from] MemoryStoreError),

    #[error(transparent)]
    Sqlite(#[from] SqliteError),
}

impl ItemStoreError for StoreError {
    fn is_item_exists(&self) -> bool {
        match self {
            Self::Memory(err) => err.is_item_exists(),
            Self::Sqlite(err) => err.is_item_exists(),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            Store::Memory($store) => Ok($call.await?),
            Store::Sqlite($store) => Ok($call.await?),
        }
    };
}

impl ItemStore for Store {
    type Error = StoreError;

    async fn update_cursor(&self, source_id: &SourceId, cursor: &Cursor) -> Result<(), Self::Error> {
        delegate!(self, store => store.update_cursor(source_id, cursor))
    }

    async fn get_cursor(&self, source_id: &SourceId) -> Result<Option<Cursor>, Self::Error> {
        delegate!(self, store => store.get_cursor(source_id))
    }

    async fn push(&self, item: &Item) -> Result<i64, Self::Error> {
        delegate!(self, store => store.push(item))
    }

    async fn update(&self, item: &Item) -> Result<(), Self::Error> {
        delegate!(self, store => store.update(item))
    }

    async fn delete(&self, source_id: &SourceId, id: &str) -> Result<bool, Self::Error> {
        delegate!(self, store => store.delete(source_id, id))
    }

    async fn lock(&self, source_id: &SourceId, id: &str) -> Result<(), Self::Error> {
        delegate!(self, store => store.lock(source_id, id))
    }

    async fn unlock(&self, source_id: &SourceId, id: &str) -> Result<(), Self::Error> {
        delegate!(self, store => store.unlock(source_id, id))
    }

    async fn get_items(&self, source_id: &SourceId, limit: usize) -> Result<Vec<Item>, Self::Error> {
        delegate!(self, store => store.get_items(source_id, limit))
    }

    async fn get_unlocked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<Item>, Self::Error> {
        delegate!(self, store => store.get_unlocked(source_id, limit))
    }

    async fn get_locked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<Item>, Self::Error> {
        delegate!(self, store => store.get_locked(source_id, limit))
    }

    async fn count(&self, source_id: &SourceId) -> Result<usize, Self::Error> {
        delegate!(self, store => store.count(source_id))
    }

    async fn get_index(&self, source_id: &SourceId) -> Result<i64, Self::Error> {
        delegate!(self, store => store.get_index(source_id))
    }

    async fn close(&self) -> Result<(), Self::Error> {
        delegate!(self, store => store.close())
    }

    async fn destroy(&self) -> Result<(), Self::Error> {
        delegate!(self, store => store.destroy())
    }
}
