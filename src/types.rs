use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::errors::EngineResult;

/// Immutable per-sync-session view of an account, supplied by the external
/// account broker. The engine never persists credentials; it only consumes
/// identity, server settings and (on demand) a bearer token.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Account {
    /// Stable account identity, e.g. the account's email address.
    pub id: String,
    pub imap_host: String,
    pub imap_port: u16,
    pub use_ssl: bool,
    pub use_tls: bool,
    pub username: String,
    pub oauth2_capable: bool,
}

/// Mints fresh OAuth2 bearer tokens for an account. Implemented by the
/// external account broker; the engine never runs its own OAuth2 flow.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self, account: &Account) -> EngineResult<String>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        }
    }

    pub fn from_str(raw: &str) -> Self {
        match raw {
            "syncing" => SyncState::Syncing,
            "error" => SyncState::Error,
            _ => SyncState::Idle,
        }
    }
}

/// Per (account, folder) synchronization bookkeeping.
#[derive(Clone, Debug)]
pub struct SyncStatus {
    pub account_id: String,
    pub folder: String,
    pub last_sync_ts: Option<i64>,
    pub highest_uid: u32,
    pub message_count: u32,
    pub error_count: u32,
    pub state: SyncState,
}

pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
