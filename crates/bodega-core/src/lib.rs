//! bodega-core - Core library for Bodega
//!
//! This crate contains the offline-first engine shared by all Bodega
//! interfaces: domain models, the local database layer, the remote bridge,
//! sync coordination, chat routing, and notification triggering.

pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod remote;
pub mod services;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{ChatMessage, Collection, CollectionId, CollectionResponse, ResponseId};
pub use services::LocalStore;
