//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }
    if version < 3 {
        migrate_v3(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    // libsql doesn't have execute_batch, so we run each statement separately
    // inside one transaction for atomicity
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }

    Ok(())
}

/// Migration to version 1: collections and their items
async fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            // Schema version tracking
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // Collections table; customer_ids is a JSON array
            "CREATE TABLE IF NOT EXISTS collections (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                customer_ids TEXT NOT NULL DEFAULT '[]',
                template TEXT NOT NULL,
                chat_enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                needs_sync INTEGER NOT NULL DEFAULT 0,
                last_sync_error TEXT,
                synced_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_collections_updated ON collections(updated_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_collections_needs_sync ON collections(needs_sync)",
            // Child rows; replaced wholesale on every parent upsert
            "CREATE TABLE IF NOT EXISTS collection_items (
                collection_id TEXT NOT NULL REFERENCES collections(id) ON DELETE CASCADE,
                product_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                override_price_cents INTEGER,
                featured INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (collection_id, product_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_collection_items_position
                ON collection_items(collection_id, position)",
            // Record migration version
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )
    .await?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: orders and chat messages
async fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            // Orders; the product id -> item map is embedded as JSON
            "CREATE TABLE IF NOT EXISTS responses (
                id TEXT PRIMARY KEY,
                collection_id TEXT NOT NULL,
                customer_id TEXT,
                access_token TEXT,
                contact_name TEXT NOT NULL,
                contact_phone TEXT,
                delivery_method TEXT NOT NULL,
                payment_method TEXT NOT NULL,
                desired_date INTEGER,
                items TEXT NOT NULL DEFAULT '{}',
                item_count INTEGER NOT NULL DEFAULT 0,
                subtotal_cents INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                needs_sync INTEGER NOT NULL DEFAULT 0,
                last_sync_error TEXT,
                synced_at INTEGER
            )",
            "CREATE INDEX IF NOT EXISTS idx_responses_collection
                ON responses(collection_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_responses_needs_sync ON responses(needs_sync)",
            // Chat messages; attachments is a JSON array
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                collection_id TEXT NOT NULL,
                customer_id TEXT,
                sender_role TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                body TEXT NOT NULL,
                attachments TEXT NOT NULL DEFAULT '[]',
                sent_at INTEGER NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0
            )",
            "CREATE INDEX IF NOT EXISTS idx_messages_collection
                ON messages(collection_id, sent_at ASC)",
            "CREATE INDEX IF NOT EXISTS idx_messages_customer
                ON messages(customer_id, sent_at ASC)",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )
    .await?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: outbound tracking for chat messages
async fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            // Local-origin messages keep needs_sync = 1 until the remote
            // acknowledges the push
            "ALTER TABLE messages ADD COLUMN needs_sync INTEGER NOT NULL DEFAULT 0",
            "CREATE INDEX IF NOT EXISTS idx_messages_needs_sync ON messages(needs_sync)",
            "INSERT INTO schema_version (version) VALUES (3)",
        ],
    )
    .await?;

    tracing::info!("Migrated database to version 3");
    Ok(())
}
