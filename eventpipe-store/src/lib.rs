// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persistence layer for eventpipe sources.
//!
//! Every source owns exactly two kinds of persisted state: a _cursor_, the opaque token telling
//! upstream how far the source has consumed the feed, and a set of _pending items_, events which
//! were accepted from upstream but are not fully processed yet. An item exists in the store if and
//! only if it still needs processing, this is what makes the pipeline resumable after a crash.
//!
//! Items are ordered per source by an order index assigned by the store on insertion. The index is
//! strictly increasing and never reused, listing items always returns them in insertion order.
//!
//! ## Backends
//!
//! The [`ItemStore`] trait is implemented by [`MemoryStore`](memory::MemoryStore) (tests and
//! ephemeral use) and [`SqliteStore`](sqlite::SqliteStore) (durable, write-ahead-logged). Use
//! [`Store::open`] to select one from a storage path.
//!
//! ## Encoding
//!
//! The store itself only deals with opaque bytes. [`EventsStorage`] sits on top of any backend and
//! converts events and their processing context to and from CBOR.
pub mod events;
pub mod items;
pub mod memory;
pub mod sqlite;
mod store;
#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use events::{EventsStorage, EventsStorageError, StoredEvent, normalize_context};
pub use items::{DEFAULT_LIMIT, Item, ItemStore, ItemStoreError};
pub use memory::{MemoryStore, MemoryStoreError};
pub use sqlite::{SqliteError, SqliteStore, SqliteStoreBuilder};
pub use store::{MEMORY_STORE_PATH, Store, StoreError};
