// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;

use eventpipe_core::{Cursor, SourceId};

/// Number of items returned by listing methods when no (or a zero) limit was given.
pub const DEFAULT_LIMIT: usize = 1000;

/// Returns the limit to apply for a requested one, replacing `0` with [`DEFAULT_LIMIT`].
pub fn effective_limit(limit: usize) -> usize {
    if limit == 0 { DEFAULT_LIMIT } else { limit }
}

/// Pending item of a source.
///
/// `data` and `context` are opaque to the store. The order index is assigned by the store when
/// the item gets pushed, any value set by the caller is ignored on insertion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Item {
    pub source_id: SourceId,
    pub id: String,
    pub data: Vec<u8>,
    pub context: Vec<u8>,
    pub order_index: i64,
    pub locked: bool,
}

impl Item {
    pub fn new(
        source_id: SourceId,
        id: impl Into<String>,
        data: Vec<u8>,
        context: Vec<u8>,
    ) -> Self {
        Self {
            source_id,
            id: id.into(),
            data,
            context,
            order_index: 0,
            locked: false,
        }
    }
}

/// Error of an [`ItemStore`] backend.
pub trait ItemStoreError: Error + Send + Sync + 'static {
    /// Returns `true` if a push failed because the item already exists.
    fn is_item_exists(&self) -> bool;
}

/// Interface for persisting source cursors and pending items.
///
/// Implementations need to guarantee that:
///
/// - the order index per source is strictly increasing and never reused, even after deletions
/// - `(source_id, id)` is unique, pushing never overwrites an existing item
/// - listing methods return items ordered by their order index and never fail on unknown sources
///
/// All methods can be called concurrently from multiple tasks.
pub trait ItemStore {
    type Error: ItemStoreError;

    /// Insert or overwrite the cursor of a source.
    fn update_cursor(
        &self,
        source_id: &SourceId,
        cursor: &Cursor,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Get the cursor of a source.
    ///
    /// Returns `None` if no cursor row exists for this source yet. Pushing the first item of a
    /// source creates the row with an empty cursor.
    fn get_cursor(
        &self,
        source_id: &SourceId,
    ) -> impl Future<Output = Result<Option<Cursor>, Self::Error>> + Send;

    /// Insert a new item and return the order index it was assigned with.
    ///
    /// Fails if an item with the same id already exists for this source.
    fn push(&self, item: &Item) -> impl Future<Output = Result<i64, Self::Error>> + Send;

    /// Rewrite data and context of an existing item, preserving order index and lock flag.
    ///
    /// Fails if the item does not exist.
    fn update(&self, item: &Item) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Delete an item.
    ///
    /// Returns `true` when the removal occurred and `false` when the item was not found.
    fn delete(
        &self,
        source_id: &SourceId,
        id: &str,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Mark an item as claimed. Fails if the item does not exist.
    fn lock(
        &self,
        source_id: &SourceId,
        id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Release a claimed item. Fails if the item does not exist.
    fn unlock(
        &self,
        source_id: &SourceId,
        id: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Get up to `limit` items of a source, oldest first. A limit of `0` selects
    /// [`DEFAULT_LIMIT`].
    fn get_items(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Item>, Self::Error>> + Send;

    /// Same as [`ItemStore::get_items`] but only returns items which are not locked.
    fn get_unlocked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Item>, Self::Error>> + Send;

    /// Same as [`ItemStore::get_items`] but only returns locked items.
    fn get_locked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Item>, Self::Error>> + Send;

    /// Number of items of a source, `0` for unknown sources.
    fn count(
        &self,
        source_id: &SourceId,
    ) -> impl Future<Output = Result<usize, Self::Error>> + Send;

    /// Highest order index among the existing items of a source, `0` if it has none.
    fn get_index(
        &self,
        source_id: &SourceId,
    ) -> impl Future<Output = Result<i64, Self::Error>> + Send;

    /// Release all resources held by the store.
    fn close(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Irrecoverably delete all persisted state.
    fn destroy(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
