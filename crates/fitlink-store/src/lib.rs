//! # fitlink-store
//!
//! Durable storage for conversations and messages, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle with typed helpers for
//! every table, and the async [`MessageStore`] service the server talks to.
//! `MessageStore` is the only writer of conversation rollups (preview,
//! counters) and message status; every committed write is published as a
//! [`StoreEvent`] in commit order.

pub mod conversations;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod service;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use service::{MessageStore, StoreEvent};
