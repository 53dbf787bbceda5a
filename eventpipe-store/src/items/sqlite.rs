// SPDX-License-Identifier: MIT OR Apache-2.0

use eventpipe_core::{Cursor, SourceId};
use sqlx::{FromRow, query, query_as};
use tracing::trace;

use crate::items::{Item, ItemStore, effective_limit};
use crate::sqlite::{SqliteError, SqliteStore, is_unique_violation};

/// Filter applied to the locked flag when listing items.
#[derive(Clone, Copy)]
enum LockFilter {
    Any,
    Locked,
    Unlocked,
}

impl SqliteStore {
    async fn list_items(
        &self,
        source_id: &SourceId,
        limit: usize,
        filter: LockFilter,
    ) -> Result<Vec<Item>, SqliteError> {
        let limit = i64::try_from(effective_limit(limit)).unwrap_or(i64::MAX);

        let rows = match filter {
            LockFilter::Any => {
                query_as::<_, ItemRow>(
                    "
                    SELECT
                        source_id,
                        id,
                        data,
                        context,
                        locked,
                        order_index
                    FROM
                        items_v1
                    WHERE
                        source_id = ?
                    ORDER BY
                        order_index ASC
                    LIMIT
                        ?
                    ",
                )
                .bind(source_id.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            LockFilter::Locked | LockFilter::Unlocked => {
                query_as::<_, ItemRow>(
                    "
                    SELECT
                        source_id,
                        id,
                        data,
                        context,
                        locked,
                        order_index
                    FROM
                        items_v1
                    WHERE
                        source_id = ?
                        AND locked = ?
                    ORDER BY
                        order_index ASC
                    LIMIT
                        ?
                    ",
                )
                .bind(source_id.as_str())
                .bind(matches!(filter, LockFilter::Locked))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(Item::from).collect())
    }

    async fn set_locked(
        &self,
        source_id: &SourceId,
        id: &str,
        locked: bool,
    ) -> Result<(), SqliteError> {
        let result = query(
            "
            UPDATE
                items_v1
            SET
                locked = ?
            WHERE
                source_id = ?
                AND id = ?
            ",
        )
        .bind(locked)
        .bind(source_id.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SqliteError::ItemNotFound(source_id.clone(), id.to_string()));
        }

        Ok(())
    }
}

impl ItemStore for SqliteStore {
    type Error = SqliteError;

    async fn update_cursor(&self, source_id: &SourceId, cursor: &Cursor) -> Result<(), Self::Error> {
        query(
            "
            INSERT INTO
                sources_v1 (
                    source_id,
                    cursor
                )
            VALUES
                (?, ?)
            ON CONFLICT(source_id) DO UPDATE SET
                cursor = excluded.cursor
            ",
        )
        .bind(source_id.as_str())
        .bind(cursor.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_cursor(&self, source_id: &SourceId) -> Result<Option<Cursor>, Self::Error> {
        let row: Option<(String,)> = query_as(
            "
            SELECT
                cursor
            FROM
                sources_v1
            WHERE
                source_id = ?
            ",
        )
        .bind(source_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(cursor,)| Cursor::from(cursor)))
    }

    async fn push(&self, item: &Item) -> Result<i64, Self::Error> {
        // Start a transaction.
        //
        // Creating the source row, bumping the order index and inserting the item are rolled back
        // together if any of them fails (the transaction is dropped without commit).
        let mut tx = self.pool.begin().await?;

        query(
            "
            INSERT OR IGNORE
            INTO
                sources_v1 (
                    source_id,
                    cursor,
                    last_index
                )
            VALUES
                (?, '', 0)
            ",
        )
        .bind(item.source_id.as_str())
        .execute(&mut *tx)
        .await?;

        // Counting on the source row instead of taking the maximum over all items makes sure an
        // index is never handed out twice, even after the newest item was deleted.
        let (order_index,): (i64,) = query_as(
            "
            UPDATE
                sources_v1
            SET
                last_index = last_index + 1
            WHERE
                source_id = ?
            RETURNING
                last_index
            ",
        )
        .bind(item.source_id.as_str())
        .fetch_one(&mut *tx)
        .await?;

        query(
            "
            INSERT INTO
                items_v1 (
                    source_id,
                    id,
                    data,
                    context,
                    locked,
                    order_index
                )
            VALUES
                (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(item.source_id.as_str())
        .bind(&item.id)
        .bind(&item.data)
        .bind(&item.context)
        .bind(item.locked)
        .bind(order_index)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                SqliteError::ItemExists(item.source_id.clone(), item.id.clone())
            } else {
                SqliteError::Sqlite(err)
            }
        })?;

        tx.commit().await?;

        trace!(source_id = %item.source_id, id = %item.id, order_index, "pushed item");
        Ok(order_index)
    }

    async fn update(&self, item: &Item) -> Result<(), Self::Error> {
        let result = query(
            "
            UPDATE
                items_v1
            SET
                data = ?,
                context = ?
            WHERE
                source_id = ?
                AND id = ?
            ",
        )
        .bind(&item.data)
        .bind(&item.context)
        .bind(item.source_id.as_str())
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SqliteError::ItemNotFound(
                item.source_id.clone(),
                item.id.clone(),
            ));
        }

        Ok(())
    }

    async fn delete(&self, source_id: &SourceId, id: &str) -> Result<bool, Self::Error> {
        let result = query(
            "
            DELETE FROM
                items_v1
            WHERE
                source_id = ?
                AND id = ?
            ",
        )
        .bind(source_id.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn lock(&self, source_id: &SourceId, id: &str) -> Result<(), Self::Error> {
        self.set_locked(source_id, id, true).await
    }

    async fn unlock(&self, source_id: &SourceId, id: &str) -> Result<(), Self::Error> {
        self.set_locked(source_id, id, false).await
    }

    async fn get_items(&self, source_id: &SourceId, limit: usize) -> Result<Vec<Item>, Self::Error> {
        self.list_items(source_id, limit, LockFilter::Any).await
    }

    async fn get_unlocked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<Item>, Self::Error> {
        self.list_items(source_id, limit, LockFilter::Unlocked).await
    }

    async fn get_locked(
        &self,
        source_id: &SourceId,
        limit: usize,
    ) -> Result<Vec<Item>, Self::Error> {
        self.list_items(source_id, limit, LockFilter::Locked).await
    }

    async fn count(&self, source_id: &SourceId) -> Result<usize, Self::Error> {
        let row: (i64,) = query_as(
            "
            SELECT
                COUNT(*)
            FROM
                items_v1
            WHERE
                source_id = ?
            ",
        )
        .bind(source_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(usize::try_from(row.0).unwrap_or_default())
    }

    async fn get_index(&self, source_id: &SourceId) -> Result<i64, Self::Error> {
        let row: (i64,) = query_as(
            "
            SELECT
                COALESCE(MAX(order_index), 0)
            FROM
                items_v1
            WHERE
                source_id = ?
            ",
        )
        .bind(source_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.close_pool().await;
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Self::Error> {
        if self.path().is_none() && !self.pool.is_closed() {
            // In-memory databases only exist as long as their connection does, clear the tables
            // explicitly before letting go.
            query("DELETE FROM items_v1").execute(&self.pool).await?;
            query("DELETE FROM sources_v1").execute(&self.pool).await?;
        }

        self.close_pool().await;
        self.remove_files().await
    }
}

/// Single item row as it is inserted in the SQLite database.
#[derive(Debug, FromRow)]
struct ItemRow {
    source_id: String,
    id: String,
    data: Vec<u8>,
    context: Vec<u8>,
    locked: bool,
    order_index: i64,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            source_id: SourceId::from(row.source_id),
            id: row.id,
            data: row.data,
            context: row.context,
            order_index: row.order_index,
            locked: row.locked,
        }
    }
}
