//! Collection repository implementation

use crate::error::{Error, Result};
use crate::models::{
    validate_items, Collection, CollectionId, CollectionItem, CollectionStatus, SyncMeta,
};
use libsql::{params, Connection, Row};

/// A collection row together with its child items and sync metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionRecord {
    /// The parent row
    pub collection: Collection,
    /// Child items in display order
    pub items: Vec<CollectionItem>,
    /// Sync bookkeeping
    pub meta: SyncMeta,
}

/// Trait for collection storage operations (async)
#[allow(async_fn_in_trait)]
pub trait CollectionRepository {
    /// Atomically replace a collection and its entire child item set.
    ///
    /// Child rows are deleted then reinserted in one transaction, so no
    /// partial child set is ever visible to a reader.
    async fn upsert(
        &self,
        collection: &Collection,
        items: &[CollectionItem],
        meta: &SyncMeta,
    ) -> Result<()>;

    /// Get a collection with its items by ID
    async fn get(&self, id: &CollectionId) -> Result<Option<CollectionRecord>>;

    /// List collections, most recently updated first
    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<CollectionRecord>>;

    /// Delete a collection; child items cascade
    async fn delete(&self, id: &CollectionId) -> Result<()>;

    /// Record a confirmed remote acknowledgement; touches only sync columns
    async fn mark_clean(&self, id: &CollectionId, at: i64) -> Result<()>;

    /// Record a push failure; touches only sync columns
    async fn mark_error(&self, id: &CollectionId, message: &str) -> Result<()>;

    /// List dirty collections, oldest update first, for deterministic resume
    async fn list_dirty(&self) -> Result<Vec<CollectionRecord>>;
}

/// libSQL implementation of `CollectionRepository`
pub struct LibSqlCollectionRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlCollectionRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_collection(row: &Row) -> Result<(Collection, SyncMeta)> {
        let id: String = row.get(0)?;
        let status: String = row.get(3)?;
        let customer_ids: String = row.get(4)?;

        let collection = Collection {
            id: id
                .parse()
                .map_err(|_| Error::Storage(format!("invalid collection id '{id}'")))?,
            owner_id: row.get(1)?,
            name: row.get(2)?,
            status: CollectionStatus::parse(&status)
                .ok_or_else(|| Error::Storage(format!("unknown collection status '{status}'")))?,
            customer_ids: serde_json::from_str(&customer_ids)?,
            template: row.get(5)?,
            chat_enabled: row.get::<i32>(6)? != 0,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        };
        let meta = SyncMeta {
            needs_sync: row.get::<i32>(9)? != 0,
            last_sync_error: row.get(10)?,
            synced_at: row.get(11)?,
        };
        Ok((collection, meta))
    }

    async fn items_for(&self, id: &CollectionId) -> Result<Vec<CollectionItem>> {
        let mut rows = self
            .conn
            .query(
                "SELECT product_id, position, override_price_cents, featured
                 FROM collection_items
                 WHERE collection_id = ?
                 ORDER BY position ASC",
                [id.as_str()],
            )
            .await?;

        let mut items = Vec::new();
        while let Some(row) = rows.next().await? {
            items.push(CollectionItem {
                product_id: row.get(0)?,
                position: u32::try_from(row.get::<i64>(1)?).unwrap_or(0),
                override_price_cents: row.get(2)?,
                featured: row.get::<i32>(3)? != 0,
            });
        }
        Ok(items)
    }

    async fn collect_records(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<CollectionRecord>> {
        let mut rows = self.conn.query(sql, args).await?;
        let mut parsed = Vec::new();
        while let Some(row) = rows.next().await? {
            parsed.push(Self::parse_collection(&row)?);
        }

        let mut records = Vec::with_capacity(parsed.len());
        for (collection, meta) in parsed {
            let items = self.items_for(&collection.id).await?;
            records.push(CollectionRecord {
                collection,
                items,
                meta,
            });
        }
        Ok(records)
    }
}

const SELECT_COLUMNS: &str = "id, owner_id, name, status, customer_ids, template, chat_enabled,
     created_at, updated_at, needs_sync, last_sync_error, synced_at";

impl CollectionRepository for LibSqlCollectionRepository<'_> {
    async fn upsert(
        &self,
        collection: &Collection,
        items: &[CollectionItem],
        meta: &SyncMeta,
    ) -> Result<()> {
        // Reject before any write
        validate_items(items)?;
        let customer_ids = serde_json::to_string(&collection.customer_ids)?;

        self.conn.execute("BEGIN TRANSACTION", ()).await?;

        let result = async {
            self.conn
                .execute(
                    "INSERT OR REPLACE INTO collections
                     (id, owner_id, name, status, customer_ids, template, chat_enabled,
                      created_at, updated_at, needs_sync, last_sync_error, synced_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    params![
                        collection.id.as_str(),
                        collection.owner_id.as_str(),
                        collection.name.as_str(),
                        collection.status.as_str(),
                        customer_ids,
                        collection.template.as_str(),
                        i32::from(collection.chat_enabled),
                        collection.created_at,
                        collection.updated_at,
                        i32::from(meta.needs_sync),
                        meta.last_sync_error.as_deref(),
                        meta.synced_at,
                    ],
                )
                .await?;

            self.conn
                .execute(
                    "DELETE FROM collection_items WHERE collection_id = ?",
                    [collection.id.as_str()],
                )
                .await?;

            for item in items {
                self.conn
                    .execute(
                        "INSERT INTO collection_items
                         (collection_id, product_id, position, override_price_cents, featured)
                         VALUES (?, ?, ?, ?, ?)",
                        params![
                            collection.id.as_str(),
                            item.product_id.as_str(),
                            i64::from(item.position),
                            item.override_price_cents,
                            i32::from(item.featured),
                        ],
                    )
                    .await?;
            }
            Ok::<(), Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.conn.execute("COMMIT", ()).await?;
                Ok(())
            }
            Err(e) => {
                self.conn.execute("ROLLBACK", ()).await.ok();
                Err(e)
            }
        }
    }

    async fn get(&self, id: &CollectionId) -> Result<Option<CollectionRecord>> {
        let mut records = self
            .collect_records(
                &format!("SELECT {SELECT_COLUMNS} FROM collections WHERE id = ?"),
                [id.as_str()],
            )
            .await?;
        Ok(records.pop())
    }

    async fn list(&self, owner_id: Option<&str>) -> Result<Vec<CollectionRecord>> {
        if let Some(owner) = owner_id {
            self.collect_records(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM collections
                     WHERE owner_id = ? ORDER BY updated_at DESC"
                ),
                [owner],
            )
            .await
        } else {
            self.collect_records(
                &format!("SELECT {SELECT_COLUMNS} FROM collections ORDER BY updated_at DESC"),
                (),
            )
            .await
        }
    }

    async fn delete(&self, id: &CollectionId) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM collections WHERE id = ?", [id.as_str()])
            .await?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_clean(&self, id: &CollectionId, at: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE collections
                 SET needs_sync = 0, last_sync_error = NULL, synced_at = ?
                 WHERE id = ?",
                params![at, id.as_str()],
            )
            .await?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_error(&self, id: &CollectionId, message: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE collections SET needs_sync = 1, last_sync_error = ? WHERE id = ?",
                params![message, id.as_str()],
            )
            .await?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_dirty(&self) -> Result<Vec<CollectionRecord>> {
        self.collect_records(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM collections
                 WHERE needs_sync = 1 ORDER BY updated_at ASC"
            ),
            (),
        )
        .await
    }
}
