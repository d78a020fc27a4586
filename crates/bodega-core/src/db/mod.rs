//! Database layer for Bodega

mod collection_repository;
mod connection;
mod message_repository;
mod migrations;
mod response_repository;

pub use collection_repository::{
    CollectionRecord, CollectionRepository, LibSqlCollectionRepository,
};
pub use connection::Database;
pub use message_repository::{LibSqlMessageRepository, MessageRepository};
pub use response_repository::{
    LibSqlResponseRepository, ResponseRecord, ResponseRepository,
};
