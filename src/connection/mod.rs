//! Authenticated IMAP sessions and their pooling.
//!
//! A [`Connection`] owns exactly one underlying transport at a time and runs
//! protocol commands with automatic reconnect-and-retry on transport
//! failures. The [`ConnectionManager`] keeps at most one connection per
//! account identity and evicts idle ones.

mod tls;

pub use tls::{TlsTransport, TlsTransportFactory};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::types::{Account, TokenSource};

/// One protocol command. Message-level operations address by UID.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    List,
    Select(String),
    Fetch { uid_set: String, items: String },
    Search(String),
    Store { uid_set: String, item: String, flags: String },
    Copy { uid_set: String, mailbox: String },
    Expunge,
    Close,
    Logout,
}

impl Command {
    /// Protocol text, without tag or CRLF.
    pub fn wire(&self) -> String {
        match self {
            Command::List => "LIST \"\" \"*\"".to_string(),
            Command::Select(mailbox) => format!("SELECT {}", quote_mailbox(mailbox)),
            Command::Fetch { uid_set, items } => format!("UID FETCH {} {}", uid_set, items),
            Command::Search(query) => format!("UID SEARCH {}", query),
            Command::Store { uid_set, item, flags } => {
                format!("UID STORE {} {} {}", uid_set, item, flags)
            }
            Command::Copy { uid_set, mailbox } => {
                format!("UID COPY {} {}", uid_set, quote_mailbox(mailbox))
            }
            Command::Expunge => "EXPUNGE".to_string(),
            Command::Close => "CLOSE".to_string(),
            Command::Logout => "LOGOUT".to_string(),
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::List => "LIST",
            Command::Select(_) => "SELECT",
            Command::Fetch { .. } => "FETCH",
            Command::Search(_) => "SEARCH",
            Command::Store { .. } => "STORE",
            Command::Copy { .. } => "COPY",
            Command::Expunge => "EXPUNGE",
            Command::Close => "CLOSE",
            Command::Logout => "LOGOUT",
        }
    }
}

fn quote_mailbox(name: &str) -> String {
    format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Raw session transport. Implementations speak the wire protocol; the
/// `Connection` above them owns state, retry and authentication policy.
#[async_trait]
pub trait ImapTransport: Send {
    async fn connect(&mut self) -> EngineResult<()>;
    async fn authenticate(&mut self, user: &str, access_token: &str) -> EngineResult<()>;
    /// Runs one command, returning the untagged response lines (with literal
    /// contents spliced in after their `{N}` markers).
    async fn execute(&mut self, command: &Command) -> EngineResult<Vec<String>>;
    /// Drops the underlying socket. Never fails.
    async fn disconnect(&mut self);
}

/// Builds fresh transports; a reconnect replaces the transport wholesale.
pub trait TransportFactory: Send + Sync {
    fn create(&self, account: &Account) -> Box<dyn ImapTransport>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    Idle,
    Error,
}

/// A single authenticated session to one account's server.
pub struct Connection {
    account: Account,
    transport: Box<dyn ImapTransport>,
    factory: Arc<dyn TransportFactory>,
    tokens: Arc<dyn TokenSource>,
    state: ConnectionState,
    last_used: Instant,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl Connection {
    pub fn new(
        account: Account,
        factory: Arc<dyn TransportFactory>,
        tokens: Arc<dyn TokenSource>,
        config: &EngineConfig,
    ) -> Self {
        let transport = factory.create(&account);
        Self {
            account,
            transport,
            factory,
            tokens,
            state: ConnectionState::Disconnected,
            last_used: Instant::now(),
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: config.retry_backoff,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Time since the last successfully executed command.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Opens the transport. Returns immediately when already connected.
    pub async fn connect(&mut self) -> EngineResult<()> {
        match self.state {
            ConnectionState::Authenticated | ConnectionState::Idle => return Ok(()),
            _ => {}
        }
        self.state = ConnectionState::Connecting;
        match self.transport.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    /// Authenticates the session. Idempotent. An account without OAuth2
    /// capability fails before any network exchange.
    pub async fn authenticate(&mut self) -> EngineResult<()> {
        if matches!(
            self.state,
            ConnectionState::Authenticated | ConnectionState::Idle
        ) {
            return Ok(());
        }
        if !self.account.oauth2_capable {
            return Err(EngineError::AuthUnsupported);
        }

        let token = self.tokens.access_token(&self.account).await?;
        self.state = ConnectionState::Authenticating;
        match self
            .transport
            .authenticate(&self.account.username, &token)
            .await
        {
            Ok(()) => {
                self.state = ConnectionState::Authenticated;
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Error;
                Err(e)
            }
        }
    }

    /// Runs one command, connecting and authenticating as needed.
    ///
    /// Transport failures are retried up to the attempt budget with a fixed
    /// backoff, forcing a full reconnect before each retry. A protocol error
    /// that looks like a desynchronized session gets exactly one forced
    /// reconnect-and-retry. Authentication failures propagate immediately.
    pub async fn execute(&mut self, command: &Command) -> EngineResult<Vec<String>> {
        let mut attempt = 1u32;
        let mut desync_retry_used = false;
        loop {
            let result = match self.ensure_ready().await {
                Ok(()) => self.transport.execute(command).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(lines) => {
                    self.state = ConnectionState::Idle;
                    self.last_used = Instant::now();
                    return Ok(lines);
                }
                Err(err) => {
                    let retry = match &err {
                        EngineError::Transport(_) => attempt < self.retry_attempts,
                        EngineError::Protocol(_)
                            if err.is_retryable_transport() && !desync_retry_used =>
                        {
                            desync_retry_used = true;
                            true
                        }
                        _ => false,
                    };
                    if !retry {
                        self.state = ConnectionState::Error;
                        return Err(err);
                    }
                    warn!(
                        account = %self.account.id,
                        command = command.name(),
                        attempt,
                        error = %err,
                        "Command failed; reconnecting before retry"
                    );
                    self.reset().await;
                    attempt += 1;
                    tokio::time::sleep(self.retry_backoff).await;
                }
            }
        }
    }

    async fn ensure_ready(&mut self) -> EngineResult<()> {
        self.connect().await?;
        self.authenticate().await
    }

    /// Tears the transport down and replaces it, forcing the next command to
    /// reconnect and reauthenticate.
    pub async fn reset(&mut self) {
        self.transport.disconnect().await;
        self.transport = self.factory.create(&self.account);
        self.state = ConnectionState::Disconnected;
    }

    /// Best-effort logout and teardown. Logout failures are swallowed so this
    /// is safe during shutdown.
    pub async fn close(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Authenticated | ConnectionState::Idle
        ) {
            if let Err(e) = self.transport.execute(&Command::Logout).await {
                debug!(account = %self.account.id, error = %e, "Logout failed during close");
            }
        }
        self.transport.disconnect().await;
        self.state = ConnectionState::Disconnected;
    }
}

/// Pools one [`Connection`] per account identity.
pub struct ConnectionManager {
    connections: Arc<Mutex<HashMap<String, Arc<Mutex<Connection>>>>>,
    factory: Arc<dyn TransportFactory>,
    tokens: Arc<dyn TokenSource>,
    config: EngineConfig,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        tokens: Arc<dyn TokenSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            factory,
            tokens,
            config,
            sweeper: std::sync::Mutex::new(None),
        }
    }

    /// Returns the account's pooled connection, replacing it if it has sat
    /// idle beyond the idle threshold. Creation is lazy: no network traffic
    /// happens until the first command.
    pub async fn get(&self, account: &Account) -> Arc<Mutex<Connection>> {
        let mut pool = self.connections.lock().await;

        if let Some(existing) = pool.get(&account.id) {
            // A connection we cannot try-lock is mid-command, hence not idle.
            let stale = existing
                .try_lock()
                .map(|guard| guard.idle_for() > self.config.idle_threshold)
                .unwrap_or(false);
            if !stale {
                return Arc::clone(existing);
            }
            debug!(account = %account.id, "Replacing idle connection");
            if let Some(old) = pool.remove(&account.id) {
                tokio::spawn(async move {
                    old.lock().await.close().await;
                });
            }
        }

        let conn = Arc::new(Mutex::new(Connection::new(
            account.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.tokens),
            &self.config,
        )));
        pool.insert(account.id.clone(), Arc::clone(&conn));
        conn
    }

    /// Starts the periodic sweep that force-closes connections idle beyond
    /// the hard threshold, bounding resource usage even when `get` is never
    /// called. Idempotent.
    pub fn start_sweep(&self) {
        let mut guard = self.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            return;
        }
        let connections = Arc::clone(&self.connections);
        let interval = self.config.sweep_interval;
        let limit = self.config.hard_idle_threshold;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut pool = connections.lock().await;
                let stale: Vec<String> = pool
                    .iter()
                    .filter_map(|(id, conn)| {
                        conn.try_lock()
                            .ok()
                            .filter(|c| c.idle_for() > limit)
                            .map(|_| id.clone())
                    })
                    .collect();
                for id in stale {
                    if let Some(conn) = pool.remove(&id) {
                        debug!(account = %id, "Sweeping connection past hard idle limit");
                        tokio::spawn(async move {
                            conn.lock().await.close().await;
                        });
                    }
                }
            }
        }));
    }

    pub fn stop_sweep(&self) {
        if let Some(handle) = self
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }
    }

    /// Tears down one account's connection immediately.
    pub async fn close(&self, account_id: &str) {
        let removed = self.connections.lock().await.remove(account_id);
        if let Some(conn) = removed {
            conn.lock().await.close().await;
        }
    }

    /// Tears down every pooled connection. Safe during shutdown: logout
    /// failures are swallowed, never propagated.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut pool = self.connections.lock().await;
            pool.drain().map(|(_, conn)| conn).collect()
        };
        futures::future::join_all(drained.into_iter().map(|conn| async move {
            conn.lock().await.close().await;
        }))
        .await;
    }

    /// Number of pooled connections (for diagnostics and tests).
    pub async fn pooled(&self) -> usize {
        self.connections.lock().await.len()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_sweep();
    }
}
