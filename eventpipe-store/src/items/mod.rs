// SPDX-License-Identifier: MIT OR Apache-2.0

mod memory;
mod sqlite;
mod traits;

pub use memory::ItemsMemoryStore;
pub use traits::{DEFAULT_LIMIT, Item, ItemStore, ItemStoreError, effective_limit};
