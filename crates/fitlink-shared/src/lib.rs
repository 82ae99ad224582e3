//! # fitlink-shared
//!
//! Vocabulary shared by the store and the server: participant roles,
//! message kinds and statuses, attachment descriptors and the protocol
//! constants both sides agree on.

pub mod constants;
pub mod error;
pub mod types;

pub use error::SharedError;
pub use types::*;
