//! Bodega CLI - operator interface for the offline-first catalog engine
//!
//! Inspect collections and orders, chat with customers, and run the live
//! sync/notification loop from the terminal.

use std::env;
use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use bodega_core::chat::ChatChannel;
use bodega_core::config::EngineConfig;
use bodega_core::db::{CollectionRecord, ResponseRecord};
use bodega_core::models::{
    Alert, AlertKind, ChatMessage, Collection, ResponseStatus, SenderRole,
};
use bodega_core::notify::NotificationTrigger;
use bodega_core::remote::{HttpRemote, MemoryRemote, QueryPath, RemoteError};
use bodega_core::sync::SyncCoordinator;
use bodega_core::{CollectionId, LocalStore, ResponseId};

#[derive(Parser)]
#[command(name = "bodega")]
#[command(about = "Offline-first catalog manager for small businesses")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,

    /// Optional path to an engine config JSON file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Business account id (overrides config)
    #[arg(long, value_name = "ID")]
    owner: Option<String>,

    /// Remote endpoint URL (overrides config)
    #[arg(long, value_name = "URL")]
    remote: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and create collections
    Collections {
        #[command(subcommand)]
        command: CollectionCommands,
    },
    /// Inspect orders and move them through fulfilment
    Orders {
        #[command(subcommand)]
        command: OrderCommands,
    },
    /// Send and read chat threads
    Chat {
        #[command(subcommand)]
        command: ChatCommands,
    },
    /// Push every pending local change to the remote
    Sync,
    /// Run the live sync loop and print alerts until interrupted
    Watch,
}

#[derive(Subcommand)]
enum CollectionCommands {
    /// List collections, most recently updated first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one collection with its items
    Show {
        /// Collection ID
        id: String,
    },
    /// Create a new draft collection
    Create {
        /// Display name
        name: Vec<String>,
    },
}

#[derive(Subcommand)]
enum OrderCommands {
    /// List orders for a collection, newest first
    List {
        /// Collection ID
        collection_id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move an order to a new fulfilment status
    SetStatus {
        /// Order ID
        id: String,
        /// Target status
        #[arg(value_enum)]
        status: StatusArg,
    },
}

#[derive(Subcommand)]
enum ChatCommands {
    /// Send a message into a thread
    Send {
        /// Collection the conversation is about
        collection_id: String,
        /// Identified customer id; omit for the anonymous thread
        #[arg(long, value_name = "ID")]
        customer: Option<String>,
        /// Message body
        body: Vec<String>,
    },
    /// Print a thread, oldest first
    Log {
        /// Collection the conversation is about
        collection_id: String,
        /// Identified customer id; omit for the anonymous thread
        #[arg(long, value_name = "ID")]
        customer: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum StatusArg {
    InProduction,
    ReadyForDelivery,
    Delivered,
    Cancelled,
}

impl StatusArg {
    const fn to_status(self) -> ResponseStatus {
        match self {
            Self::InProduction => ResponseStatus::InProduction,
            Self::ReadyForDelivery => ResponseStatus::ReadyForDelivery,
            Self::Delivered => ResponseStatus::Delivered,
            Self::Cancelled => ResponseStatus::Cancelled,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] bodega_core::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid id '{0}'")]
    InvalidId(String),
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    #[error("No message body provided")]
    EmptyBody,
    #[error("Collection name cannot be empty")]
    EmptyName,
    #[error(
        "No remote configured. Pass --remote or set remote_endpoint in the config file to enable `bodega sync` and `bodega watch`."
    )]
    RemoteNotConfigured,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bodega=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path.clone());
    let config = resolve_config(&cli)?;
    tracing::debug!(path = %db_path.display(), owner = %config.owner_id, "opening local database");
    let store = LocalStore::open_path(&db_path).await?;

    match cli.command {
        Commands::Collections { command } => match command {
            CollectionCommands::List { json } => run_collections_list(&store, json).await?,
            CollectionCommands::Show { id } => run_collections_show(&store, &id).await?,
            CollectionCommands::Create { name } => {
                run_collections_create(&store, &config.owner_id, &name).await?;
            }
        },
        Commands::Orders { command } => match command {
            OrderCommands::List {
                collection_id,
                json,
            } => run_orders_list(&store, &collection_id, json).await?,
            OrderCommands::SetStatus { id, status } => {
                run_orders_set_status(&store, &id, status).await?;
            }
        },
        Commands::Chat { command } => match command {
            ChatCommands::Send {
                collection_id,
                customer,
                body,
            } => run_chat_send(&store, &config, &collection_id, customer.as_deref(), &body).await?,
            ChatCommands::Log {
                collection_id,
                customer,
            } => run_chat_log(&store, &collection_id, customer.as_deref()).await?,
        },
        Commands::Sync => run_sync(&store, &config).await?,
        Commands::Watch => run_watch(&store, &config).await?,
    }

    Ok(())
}

fn resolve_config(cli: &Cli) -> Result<EngineConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => {
            let owner = env::var("BODEGA_OWNER_ID").unwrap_or_else(|_| "local".to_string());
            EngineConfig::for_owner(owner)
        }
    };
    if let Some(owner) = &cli.owner {
        config.owner_id.clone_from(owner);
    }
    if let Some(remote) = &cli.remote {
        config.remote_endpoint = Some(remote.clone());
    }
    config.validate()?;
    Ok(config)
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("BODEGA_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("bodega")
        .join("bodega.db")
}

fn build_remote(config: &EngineConfig) -> Result<HttpRemote, CliError> {
    let endpoint = config
        .remote_endpoint
        .as_deref()
        .ok_or(CliError::RemoteNotConfigured)?;
    Ok(HttpRemote::new(endpoint)?.with_poll_interval(config.poll_interval()))
}

// ---------------------------------------------------------------------------
// Collections
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CollectionListItem {
    id: String,
    name: String,
    status: String,
    items: usize,
    needs_sync: bool,
    updated: String,
}

async fn run_collections_list(store: &LocalStore, as_json: bool) -> Result<(), CliError> {
    let records = store.list_collections(None).await?;

    if as_json {
        let items = records
            .iter()
            .map(collection_to_list_item)
            .collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_collection_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_collections_show(store: &LocalStore, id: &str) -> Result<(), CliError> {
    let collection_id = parse_collection_id(id)?;
    let record = store
        .get_collection(&collection_id)
        .await?
        .ok_or_else(|| CliError::CollectionNotFound(id.to_string()))?;

    println!("{}  {}", record.collection.id, record.collection.name);
    println!("status:  {}", record.collection.status.as_str());
    println!("chat:    {}", if record.collection.chat_enabled { "on" } else { "off" });
    println!("sync:    {}", sync_label(record.meta.needs_sync, record.meta.last_sync_error.as_deref()));
    println!("items:");
    for item in &record.items {
        let price = item
            .override_price_cents
            .map_or_else(|| "base price".to_string(), format_cents);
        let featured = if item.featured { "  *" } else { "" };
        println!("  {:>3}. {}  ({price}){featured}", item.position, item.product_id);
    }

    let unread = store.count_unread(&collection_id).await?;
    if unread > 0 {
        println!("unread messages: {unread}");
    }
    Ok(())
}

async fn run_collections_create(
    store: &LocalStore,
    owner_id: &str,
    name_parts: &[String],
) -> Result<(), CliError> {
    let name = name_parts.join(" ").trim().to_string();
    if name.is_empty() {
        return Err(CliError::EmptyName);
    }

    let collection = Collection::new(owner_id, name);
    store.upsert_collection(&collection, &[]).await?;
    println!("{}", collection.id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct OrderListItem {
    id: String,
    contact_name: String,
    status: String,
    item_count: u32,
    subtotal: String,
    needs_sync: bool,
    created: String,
}

async fn run_orders_list(
    store: &LocalStore,
    collection_id: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let collection_id = parse_collection_id(collection_id)?;
    let records = store.list_responses(&collection_id).await?;

    if as_json {
        let items = records.iter().map(order_to_list_item).collect::<Vec<_>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_order_lines(&records) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run_orders_set_status(
    store: &LocalStore,
    id: &str,
    status: StatusArg,
) -> Result<(), CliError> {
    let response_id = id
        .trim()
        .parse::<ResponseId>()
        .map_err(|_| CliError::InvalidId(id.to_string()))?;
    let updated = store
        .update_response_status(&response_id, status.to_status())
        .await?;
    println!("{}  {}", updated.id, updated.status.as_str());
    Ok(())
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

async fn run_chat_send(
    store: &LocalStore,
    config: &EngineConfig,
    collection_id: &str,
    customer_id: Option<&str>,
    body_parts: &[String],
) -> Result<(), CliError> {
    let collection_id = parse_collection_id(collection_id)?;
    let body = body_parts.join(" ").trim().to_string();
    if body.is_empty() {
        return Err(CliError::EmptyBody);
    }

    let message = ChatMessage::new(
        collection_id,
        SenderRole::Business,
        config.owner_id.clone(),
        config.owner_id.clone(),
        body,
    );

    // Without a remote the message still lands locally; the push is a no-op
    // sink until sync is configured.
    let sent = if let Ok(remote) = build_remote(config) {
        ChatChannel::new(store.clone(), remote)
            .send(message, customer_id)
            .await?
    } else {
        ChatChannel::new(store.clone(), MemoryRemote::new())
            .send(message, customer_id)
            .await?
    };
    println!("{}", sent.id);
    Ok(())
}

async fn run_chat_log(
    store: &LocalStore,
    collection_id: &str,
    customer_id: Option<&str>,
) -> Result<(), CliError> {
    let collection_id = parse_collection_id(collection_id)?;
    let thread = match customer_id {
        Some(customer) => store.customer_thread(customer).await?,
        None => store.collection_thread(&collection_id).await?,
    };

    let now_ms = Utc::now().timestamp_millis();
    for message in thread {
        let marker = match message.sender_role {
            SenderRole::Business => ">",
            SenderRole::Client => "<",
        };
        println!(
            "{marker} [{}] {}: {}",
            format_relative_time(message.sent_at, now_ms),
            message.sender_name,
            message.body
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync & watch
// ---------------------------------------------------------------------------

async fn run_sync(store: &LocalStore, config: &EngineConfig) -> Result<(), CliError> {
    let remote = build_remote(config)?;
    let coordinator = SyncCoordinator::new(store.clone(), remote, config.backoff.clone());
    coordinator.resume().await?;

    let still_dirty = store.dirty_collections().await?.len()
        + store.dirty_responses().await?.len()
        + store.dirty_messages().await?.len();
    if still_dirty == 0 {
        println!("Sync completed");
    } else {
        println!("Sync finished with {still_dirty} record(s) still pending");
    }
    Ok(())
}

async fn run_watch(store: &LocalStore, config: &EngineConfig) -> Result<(), CliError> {
    let remote = build_remote(config)?;

    let collections = store.list_collections(None).await?;
    let mut queries = vec![QueryPath::collections()];
    let mut collection_ids = Vec::new();
    let mut customer_ids: Vec<String> = Vec::new();
    for record in &collections {
        collection_ids.push(record.collection.id.as_str());
        queries.push(QueryPath::collection_responses(record.collection.id.as_str()));
        for customer in &record.collection.customer_ids {
            if !customer_ids.contains(customer) {
                customer_ids.push(customer.clone());
            }
        }
    }

    let coordinator = SyncCoordinator::new(store.clone(), remote.clone(), config.backoff.clone());
    let sync_handle = coordinator.spawn(queries);

    let (trigger, mut alerts) = NotificationTrigger::new(
        store.clone(),
        remote,
        config.owner_id.clone(),
        config.trigger_options(),
    );
    trigger.start(&collection_ids, &customer_ids);

    println!("Watching {} collection(s); Ctrl-C to stop", collections.len());
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
            alert = alerts.recv() => match alert {
                Some(alert) => println!("{}", format_alert(&alert)),
                None => break,
            },
        }
    }

    trigger.stop();
    coordinator.shutdown();
    let _ = sync_handle.await;
    println!("Stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

fn parse_collection_id(id: &str) -> Result<CollectionId, CliError> {
    id.trim()
        .parse::<CollectionId>()
        .map_err(|_| CliError::InvalidId(id.to_string()))
}

fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}

fn sync_label(needs_sync: bool, error: Option<&str>) -> String {
    match (needs_sync, error) {
        (false, _) => "clean".to_string(),
        (true, None) => "pending".to_string(),
        (true, Some(message)) => format!("pending ({message})"),
    }
}

fn format_cents(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, (cents % 100).abs())
}

fn format_alert(alert: &Alert) -> String {
    let label = match alert.kind {
        AlertKind::NewOrder => "order",
        AlertKind::ChatMessage => "chat",
        AlertKind::LowStock => "stock",
        AlertKind::UsageLimit => "usage",
        AlertKind::General => "info",
    };
    format!("[{label}] {}: {}", alert.title, alert.body)
}

fn collection_to_list_item(record: &CollectionRecord) -> CollectionListItem {
    let now_ms = Utc::now().timestamp_millis();
    CollectionListItem {
        id: record.collection.id.to_string(),
        name: record.collection.name.clone(),
        status: record.collection.status.as_str().to_string(),
        items: record.items.len(),
        needs_sync: record.meta.needs_sync,
        updated: format_relative_time(record.collection.updated_at, now_ms),
    }
}

fn format_collection_lines(records: &[CollectionRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = short_id(&record.collection.id.as_str());
            let sync = if record.meta.needs_sync { "~" } else { " " };
            format!(
                "{id:<8}{sync} {:<30} {:<10} {:>3} item(s)  {}",
                record.collection.name,
                record.collection.status.as_str(),
                record.items.len(),
                format_relative_time(record.collection.updated_at, now_ms),
            )
        })
        .collect()
}

fn order_to_list_item(record: &ResponseRecord) -> OrderListItem {
    let now_ms = Utc::now().timestamp_millis();
    OrderListItem {
        id: record.response.id.to_string(),
        contact_name: record.response.contact_name.clone(),
        status: record.response.status.as_str().to_string(),
        item_count: record.response.item_count,
        subtotal: format_cents(record.response.subtotal_cents),
        needs_sync: record.meta.needs_sync,
        created: format_relative_time(record.response.created_at, now_ms),
    }
}

fn format_order_lines(records: &[ResponseRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let id = short_id(&record.response.id.as_str());
            let sync = if record.meta.needs_sync { "~" } else { " " };
            format!(
                "{id:<8}{sync} {:<20} {:<18} {:>3} item(s)  {:>10}  {}",
                record.response.contact_name,
                record.response.status.as_str(),
                record.response.item_count,
                format_cents(record.response.subtotal_cents),
                format_relative_time(record.response.created_at, now_ms),
            )
        })
        .collect()
}

fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else {
        format!("{}w ago", diff / week)
    }
}
