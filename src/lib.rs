//! plume: the synchronization and caching core of a mail client.
//!
//! The crate owns everything between the wire and the presentation layer:
//! pooled IMAP connections over TLS with XOAUTH2, a hand-rolled response
//! parser for ENVELOPE/BODYSTRUCTURE/FLAGS, conversation grouping, a SQLite
//! cache reconciled against server state, and a background sync scheduler
//! that reports progress over an event channel.
//!
//! Credentials never live here. Accounts and OAuth2 tokens are supplied by
//! an external broker through [`types::Account`] and [`types::TokenSource`].

pub mod config;
pub mod connection;
pub mod errors;
pub mod model;
pub mod parser;
pub mod storage;
pub mod sync;
pub mod threads;
pub mod types;

pub use config::EngineConfig;
pub use connection::{Connection, ConnectionManager, ImapTransport, TransportFactory};
pub use errors::{EngineError, EngineResult};
pub use model::{Address, Attachment, Message, Thread};
pub use storage::Store;
pub use sync::{SyncEvent, SyncService};
pub use threads::group_messages;
pub use types::{Account, SyncState, SyncStatus, TokenSource};
