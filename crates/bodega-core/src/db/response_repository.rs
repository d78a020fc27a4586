//! Order (collection response) repository implementation

use crate::error::{Error, Result};
use crate::models::{CollectionId, CollectionResponse, ResponseId, ResponseStatus, SyncMeta};
use libsql::{params, Connection, Row};

/// An order row together with its sync metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    /// The order
    pub response: CollectionResponse,
    /// Sync bookkeeping
    pub meta: SyncMeta,
}

/// Trait for order storage operations (async)
#[allow(async_fn_in_trait)]
pub trait ResponseRepository {
    /// Insert or replace an order row; the item map is embedded as JSON
    async fn upsert(&self, response: &CollectionResponse, meta: &SyncMeta) -> Result<()>;

    /// Get an order by ID
    async fn get(&self, id: &ResponseId) -> Result<Option<ResponseRecord>>;

    /// List orders for a collection, newest first
    async fn list_for_collection(&self, collection_id: &CollectionId)
        -> Result<Vec<ResponseRecord>>;

    /// Delete an order
    async fn delete(&self, id: &ResponseId) -> Result<()>;

    /// Record a confirmed remote acknowledgement; touches only sync columns
    async fn mark_clean(&self, id: &ResponseId, at: i64) -> Result<()>;

    /// Record a push failure; touches only sync columns
    async fn mark_error(&self, id: &ResponseId, message: &str) -> Result<()>;

    /// List dirty orders, oldest update first
    async fn list_dirty(&self) -> Result<Vec<ResponseRecord>>;
}

/// libSQL implementation of `ResponseRepository`
pub struct LibSqlResponseRepository<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "id, collection_id, customer_id, access_token, contact_name,
     contact_phone, delivery_method, payment_method, desired_date, items, item_count,
     subtotal_cents, status, created_at, updated_at, needs_sync, last_sync_error, synced_at";

impl<'a> LibSqlResponseRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_response(row: &Row) -> Result<ResponseRecord> {
        let id: String = row.get(0)?;
        let collection_id: String = row.get(1)?;
        let items: String = row.get(9)?;
        let status: String = row.get(12)?;

        let response = CollectionResponse {
            id: id
                .parse()
                .map_err(|_| Error::Storage(format!("invalid response id '{id}'")))?,
            collection_id: collection_id
                .parse()
                .map_err(|_| Error::Storage(format!("invalid collection id '{collection_id}'")))?,
            customer_id: row.get(2)?,
            access_token: row.get(3)?,
            contact_name: row.get(4)?,
            contact_phone: row.get(5)?,
            delivery_method: row.get(6)?,
            payment_method: row.get(7)?,
            desired_date: row.get(8)?,
            items: serde_json::from_str(&items)?,
            item_count: u32::try_from(row.get::<i64>(10)?).unwrap_or(0),
            subtotal_cents: row.get(11)?,
            status: ResponseStatus::parse(&status)
                .ok_or_else(|| Error::Storage(format!("unknown response status '{status}'")))?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        };
        let meta = SyncMeta {
            needs_sync: row.get::<i32>(15)? != 0,
            last_sync_error: row.get(16)?,
            synced_at: row.get(17)?,
        };
        Ok(ResponseRecord { response, meta })
    }

    async fn collect_records(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<ResponseRecord>> {
        let mut rows = self.conn.query(sql, args).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(Self::parse_response(&row)?);
        }
        Ok(records)
    }
}

impl ResponseRepository for LibSqlResponseRepository<'_> {
    async fn upsert(&self, response: &CollectionResponse, meta: &SyncMeta) -> Result<()> {
        // Derived fields must agree with the item map at rest
        let mut checked = response.clone();
        checked.recompute();
        if checked.item_count != response.item_count
            || checked.subtotal_cents != response.subtotal_cents
        {
            return Err(Error::Validation(format!(
                "derived fields out of date for response {}",
                response.id
            )));
        }

        let items = serde_json::to_string(&response.items)?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO responses
                 (id, collection_id, customer_id, access_token, contact_name, contact_phone,
                  delivery_method, payment_method, desired_date, items, item_count,
                  subtotal_cents, status, created_at, updated_at, needs_sync,
                  last_sync_error, synced_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    response.id.as_str(),
                    response.collection_id.as_str(),
                    response.customer_id.as_deref(),
                    response.access_token.as_deref(),
                    response.contact_name.as_str(),
                    response.contact_phone.as_deref(),
                    response.delivery_method.as_str(),
                    response.payment_method.as_str(),
                    response.desired_date,
                    items,
                    i64::from(response.item_count),
                    response.subtotal_cents,
                    response.status.as_str(),
                    response.created_at,
                    response.updated_at,
                    i32::from(meta.needs_sync),
                    meta.last_sync_error.as_deref(),
                    meta.synced_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &ResponseId) -> Result<Option<ResponseRecord>> {
        let mut records = self
            .collect_records(
                &format!("SELECT {SELECT_COLUMNS} FROM responses WHERE id = ?"),
                [id.as_str()],
            )
            .await?;
        Ok(records.pop())
    }

    async fn list_for_collection(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<ResponseRecord>> {
        self.collect_records(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM responses
                 WHERE collection_id = ? ORDER BY created_at DESC"
            ),
            [collection_id.as_str()],
        )
        .await
    }

    async fn delete(&self, id: &ResponseId) -> Result<()> {
        let rows = self
            .conn
            .execute("DELETE FROM responses WHERE id = ?", [id.as_str()])
            .await?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_clean(&self, id: &ResponseId, at: i64) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE responses
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

    async fn mark_error(&self, id: &ResponseId, message: &str) -> Result<()> {
        let rows = self
            .conn
            .execute(
                "UPDATE responses SET needs_sync = 1, last_sync_error = ? WHERE id = ?",
                params![message, id.as_str()],
            )
            .await?;
        if rows == 0 {
            return Err(Error::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn list_dirty(&self) -> Result<Vec<ResponseRecord>> {
        self.collect_records(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM responses
                 WHERE needs_sync = 1 ORDER BY updated_at ASC"
            ),
            (),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::OrderItem;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn sample() -> CollectionResponse {
        let mut response = CollectionResponse::new(CollectionId::new(), "Maria");
        response.customer_id = Some("c1".to_string());
        response.set_item("p1", OrderItem::new(2, 500));
        response.set_item("p2", OrderItem::new(1, 1200));
        response
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_and_get_roundtrip() {
        let db = setup().await;
        let repo = LibSqlResponseRepository::new(db.connection());

        let response = sample();
        repo.upsert(&response, &SyncMeta::dirty()).await.unwrap();

        let record = repo.get(&response.id).await.unwrap().unwrap();
        assert_eq!(record.response, response);
        assert_eq!(record.response.item_count, 3);
        assert_eq!(record.response.subtotal_cents, 2 * 500 + 1200);
        assert!(record.meta.needs_sync);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_upsert_rejects_stale_derived_fields() {
        let db = setup().await;
        let repo = LibSqlResponseRepository::new(db.connection());

        let mut response = sample();
        response.item_count = 99; // out of sync with the item map
        let err = repo
            .upsert(&response, &SyncMeta::dirty())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_for_collection_newest_first() {
        let db = setup().await;
        let repo = LibSqlResponseRepository::new(db.connection());

        let collection_id = CollectionId::new();
        let mut first = CollectionResponse::new(collection_id, "A");
        first.created_at = 100;
        let mut second = CollectionResponse::new(collection_id, "B");
        second.created_at = 200;

        repo.upsert(&first, &SyncMeta::dirty()).await.unwrap();
        repo.upsert(&second, &SyncMeta::dirty()).await.unwrap();

        let records = repo.list_for_collection(&collection_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].response.contact_name, "B");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_clean_then_error() {
        let db = setup().await;
        let repo = LibSqlResponseRepository::new(db.connection());

        let response = sample();
        repo.upsert(&response, &SyncMeta::dirty()).await.unwrap();

        repo.mark_clean(&response.id, 1000).await.unwrap();
        let record = repo.get(&response.id).await.unwrap().unwrap();
        assert!(record.meta.is_clean());

        repo.mark_error(&response.id, "timeout").await.unwrap();
        let record = repo.get(&response.id).await.unwrap().unwrap();
        assert!(record.meta.needs_sync);
        assert_eq!(record.meta.last_sync_error.as_deref(), Some("timeout"));
        // Business fields untouched
        assert_eq!(record.response, response);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_list_dirty_skips_clean() {
        let db = setup().await;
        let repo = LibSqlResponseRepository::new(db.connection());

        let dirty = sample();
        let clean = sample();
        repo.upsert(&dirty, &SyncMeta::dirty()).await.unwrap();
        repo.upsert(&clean, &SyncMeta::clean(5)).await.unwrap();

        let records = repo.list_dirty().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response.id, dirty.id);
    }
}
