//! Chat message repository implementation

use crate::error::{Error, Result};
use crate::models::{ChatMessage, CollectionId, MessageId, SenderRole};
use libsql::{params, Connection, Row};

/// Trait for chat message storage operations (async)
#[allow(async_fn_in_trait)]
pub trait MessageRepository {
    /// Insert a message; replaying the same id is a no-op.
    ///
    /// Local-origin messages come in with `needs_sync` set and are drained
    /// by the sync resume; remote-origin messages arrive pre-acknowledged.
    async fn insert(&self, message: &ChatMessage, needs_sync: bool) -> Result<bool>;

    /// Get a message by ID
    async fn get(&self, id: &MessageId) -> Result<Option<ChatMessage>>;

    /// Messages in a customer-centric thread, ascending by timestamp.
    ///
    /// Spans every collection the customer interacted with.
    async fn list_customer_thread(&self, customer_id: &str) -> Result<Vec<ChatMessage>>;

    /// Messages in a collection-centric thread, ascending by timestamp.
    ///
    /// Only holds messages from customers without an identified account;
    /// messages with a customer id live exclusively on the customer path.
    async fn list_collection_thread(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<ChatMessage>>;

    /// Mark the given messages read. Batch and idempotent; the read flag
    /// never transitions back to unread.
    async fn mark_read(&self, ids: &[MessageId]) -> Result<()>;

    /// Count unread messages addressed to the business for a collection
    async fn count_unread(&self, collection_id: &CollectionId) -> Result<u64>;

    /// List unpushed messages, oldest send first
    async fn list_dirty(&self) -> Result<Vec<ChatMessage>>;

    /// Record a confirmed remote acknowledgement for a message
    async fn mark_clean(&self, id: &MessageId) -> Result<()>;
}

/// libSQL implementation of `MessageRepository`
pub struct LibSqlMessageRepository<'a> {
    conn: &'a Connection,
}

const SELECT_COLUMNS: &str = "id, collection_id, customer_id, sender_role, sender_id,
     sender_name, body, attachments, sent_at, is_read";

impl<'a> LibSqlMessageRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_message(row: &Row) -> Result<ChatMessage> {
        let id: String = row.get(0)?;
        let collection_id: String = row.get(1)?;
        let sender_role: String = row.get(3)?;
        let attachments: String = row.get(7)?;

        Ok(ChatMessage {
            id: id
                .parse()
                .map_err(|_| Error::Storage(format!("invalid message id '{id}'")))?,
            collection_id: collection_id
                .parse()
                .map_err(|_| Error::Storage(format!("invalid collection id '{collection_id}'")))?,
            customer_id: row.get(2)?,
            sender_role: SenderRole::parse(&sender_role)
                .ok_or_else(|| Error::Storage(format!("unknown sender role '{sender_role}'")))?,
            sender_id: row.get(4)?,
            sender_name: row.get(5)?,
            body: row.get(6)?,
            attachments: serde_json::from_str(&attachments)?,
            sent_at: row.get(8)?,
            read: row.get::<i32>(9)? != 0,
        })
    }

    async fn collect_messages(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
    ) -> Result<Vec<ChatMessage>> {
        let mut rows = self.conn.query(sql, args).await?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next().await? {
            messages.push(Self::parse_message(&row)?);
        }
        Ok(messages)
    }
}

impl MessageRepository for LibSqlMessageRepository<'_> {
    async fn insert(&self, message: &ChatMessage, needs_sync: bool) -> Result<bool> {
        let attachments = serde_json::to_string(&message.attachments)?;
        let rows = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO messages
                 (id, collection_id, customer_id, sender_role, sender_id, sender_name,
                  body, attachments, sent_at, is_read, needs_sync)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                params![
                    message.id.as_str(),
                    message.collection_id.as_str(),
                    message.customer_id.as_deref(),
                    message.sender_role.as_str(),
                    message.sender_id.as_str(),
                    message.sender_name.as_str(),
                    message.body.as_str(),
                    attachments,
                    message.sent_at,
                    i32::from(message.read),
                    i32::from(needs_sync),
                ],
            )
            .await?;
        Ok(rows > 0)
    }

    async fn get(&self, id: &MessageId) -> Result<Option<ChatMessage>> {
        let mut messages = self
            .collect_messages(
                &format!("SELECT {SELECT_COLUMNS} FROM messages WHERE id = ?"),
                [id.as_str()],
            )
            .await?;
        Ok(messages.pop())
    }

    async fn list_customer_thread(&self, customer_id: &str) -> Result<Vec<ChatMessage>> {
        self.collect_messages(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM messages
                 WHERE customer_id = ? ORDER BY sent_at ASC, id ASC"
            ),
            [customer_id],
        )
        .await
    }

    async fn list_collection_thread(
        &self,
        collection_id: &CollectionId,
    ) -> Result<Vec<ChatMessage>> {
        self.collect_messages(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM messages
                 WHERE collection_id = ? AND customer_id IS NULL
                 ORDER BY sent_at ASC, id ASC"
            ),
            [collection_id.as_str()],
        )
        .await
    }

    async fn mark_read(&self, ids: &[MessageId]) -> Result<()> {
        for id in ids {
            self.conn
                .execute(
                    "UPDATE messages SET is_read = 1 WHERE id = ?",
                    [id.as_str()],
                )
                .await?;
        }
        Ok(())
    }

    async fn count_unread(&self, collection_id: &CollectionId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM messages
                 WHERE collection_id = ? AND is_read = 0 AND sender_role = 'client'",
                [collection_id.as_str()],
            )
            .await?;
        let count: i64 = if let Some(row) = rows.next().await? {
            row.get(0)?
        } else {
            0
        };
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn list_dirty(&self) -> Result<Vec<ChatMessage>> {
        self.collect_messages(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM messages
                 WHERE needs_sync = 1 ORDER BY sent_at ASC, id ASC"
            ),
            (),
        )
        .await
    }

    async fn mark_clean(&self, id: &MessageId) -> Result<()> {
        self.conn
            .execute(
                "UPDATE messages SET needs_sync = 0 WHERE id = ?",
                [id.as_str()],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    fn client_message(collection_id: CollectionId, customer_id: Option<&str>) -> ChatMessage {
        let mut message =
            ChatMessage::new(collection_id, SenderRole::Client, "c1", "Maria", "hola");
        message.customer_id = customer_id.map(ToString::to_string);
        message
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_insert_is_idempotent() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let message = client_message(CollectionId::new(), Some("c1"));
        assert!(repo.insert(&message, false).await.unwrap());
        assert!(!repo.insert(&message, false).await.unwrap());

        let thread = repo.list_customer_thread("c1").await.unwrap();
        assert_eq!(thread.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_thread_routing_does_not_duplicate() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let collection_id = CollectionId::new();
        let identified = client_message(collection_id, Some("c1"));
        let anonymous = client_message(collection_id, None);
        repo.insert(&identified, false).await.unwrap();
        repo.insert(&anonymous, false).await.unwrap();

        // The identified message lives only on the customer path
        let customer_thread = repo.list_customer_thread("c1").await.unwrap();
        assert_eq!(customer_thread.len(), 1);
        assert_eq!(customer_thread[0].id, identified.id);

        let collection_thread = repo.list_collection_thread(&collection_id).await.unwrap();
        assert_eq!(collection_thread.len(), 1);
        assert_eq!(collection_thread[0].id, anonymous.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_threads_ordered_by_timestamp() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let collection_id = CollectionId::new();
        let mut late = client_message(collection_id, Some("c1"));
        late.sent_at = 2000;
        let mut early = client_message(collection_id, Some("c1"));
        early.sent_at = 1000;

        repo.insert(&late, false).await.unwrap();
        repo.insert(&early, false).await.unwrap();

        let thread = repo.list_customer_thread("c1").await.unwrap();
        assert_eq!(thread[0].sent_at, 1000);
        assert_eq!(thread[1].sent_at, 2000);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mark_read_batch_idempotent() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let collection_id = CollectionId::new();
        let a = client_message(collection_id, Some("c1"));
        let b = client_message(collection_id, Some("c1"));
        repo.insert(&a, false).await.unwrap();
        repo.insert(&b, false).await.unwrap();

        let ids = vec![a.id, b.id];
        repo.mark_read(&ids).await.unwrap();
        repo.mark_read(&ids).await.unwrap(); // idempotent

        let thread = repo.list_customer_thread("c1").await.unwrap();
        assert!(thread.iter().all(|message| message.read));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_count_unread_ignores_business_messages() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let collection_id = CollectionId::new();
        repo.insert(&client_message(collection_id, None), false)
            .await
            .unwrap();
        let own = ChatMessage::new(collection_id, SenderRole::Business, "owner", "Me", "reply");
        repo.insert(&own, false).await.unwrap();

        assert_eq!(repo.count_unread(&collection_id).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dirty_messages_drain_on_mark_clean() {
        let db = setup().await;
        let repo = LibSqlMessageRepository::new(db.connection());

        let collection_id = CollectionId::new();
        let mut late = client_message(collection_id, Some("c1"));
        late.sent_at = 2000;
        let mut early = client_message(collection_id, Some("c1"));
        early.sent_at = 1000;
        repo.insert(&late, true).await.unwrap();
        repo.insert(&early, true).await.unwrap();
        repo.insert(&client_message(collection_id, None), false)
            .await
            .unwrap();

        let dirty = repo.list_dirty().await.unwrap();
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty[0].id, early.id);

        repo.mark_clean(&early.id).await.unwrap();
        let dirty = repo.list_dirty().await.unwrap();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].id, late.id);
    }
}
