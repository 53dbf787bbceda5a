// SPDX-License-Identifier: MIT OR Apache-2.0

use eventpipe_core::SourceId;

use crate::items::Item;

/// Macro to run the same test logic against all store backend implementations.
///
/// This macro takes a closure that will be executed against each store type:
/// - In-memory store (`MemoryStore`)
/// - SQLite store (`SqliteStore`)
///
/// ## Example
///
/// ```rust
/// # use eventpipe_core::SourceId;
/// # use eventpipe_store::{assert_all_stores, ItemStore};
/// # async fn run() {
/// assert_all_stores!(|store| async {
///     let source_id = SourceId::from("orders");
///     assert!(store.get_items(&source_id, 0).await.unwrap().is_empty());
/// });
/// # }
/// ```
#[macro_export]
macro_rules! assert_all_stores {
    (|$store:ident| $test_body:expr) => {
        // Test with MemoryStore.
        {
            let $store = $crate::memory::MemoryStore::new();
            $test_body.await;
        }

        // Test with SqliteStore.
        {
            let $store = $crate::sqlite::SqliteStoreBuilder::new()
                .random_memory_url()
                .build()
                .await
                .unwrap();
            $test_body.await;
        }
    };
}

/// Item with the given id and some recognisable data.
pub fn test_item(source_id: &SourceId, id: &str) -> Item {
    Item::new(
        source_id.clone(),
        id,
        format!("data-{id}").into_bytes(),
        format!("context-{id}").into_bytes(),
    )
}
