//! Background synchronization: folder discovery, the periodic sync loop,
//! manual refresh, body backfill and flag write-through.
//!
//! All failures inside the loop are reported through [`SyncEvent`]s and the
//! cache's error counters; they never tear the loop down.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::connection::{Command, ConnectionManager};
use crate::errors::{EngineError, EngineResult};
use crate::model::Message;
use crate::parser::{messages_from_fetch_lines, parse_folder_list, parse_search_uids};
use crate::storage::Store;
use crate::types::{now_ts, Account, SyncState, SyncStatus};

/// FETCH item list for a folder sync: enough for list rendering and
/// threading, bodies excluded.
const SYNC_FETCH_ITEMS: &str = "(UID FLAGS ENVELOPE BODYSTRUCTURE \
     BODY.PEEK[HEADER.FIELDS (REFERENCES IN-REPLY-TO MESSAGE-ID)])";

const UID_BATCH: usize = 50;

/// Notification from the background sync machinery. `folder` is empty for
/// discovery events; `payload` is presentation-ready text ("Error: ..." for
/// failures).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    FolderDiscoveryComplete {
        account_id: String,
        folders: Vec<String>,
    },
    FolderDiscoveryError {
        account_id: String,
        payload: String,
    },
    SyncComplete {
        account_id: String,
        folder: String,
        fetch_id: u64,
        message_count: usize,
    },
    SyncError {
        account_id: String,
        folder: String,
        fetch_id: u64,
        payload: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Discovery {
    NotStarted,
    InProgress,
    Complete,
}

struct AccountState {
    account: Account,
    discovery: Discovery,
    folders: Vec<String>,
    current_folder: String,
    /// Folders with a sync currently in flight. A manual and periodic sync
    /// for the same folder may still race past this via `force`; reconcile
    /// is idempotent so the cache converges either way.
    syncing: HashSet<String>,
}

/// Drives periodic and on-demand synchronization for registered accounts.
pub struct SyncService {
    store: Arc<Store>,
    manager: Arc<ConnectionManager>,
    events: mpsc::UnboundedSender<SyncEvent>,
    config: EngineConfig,
    accounts: Arc<Mutex<HashMap<String, AccountState>>>,
    running: Arc<AtomicBool>,
    stop_signal: Arc<Notify>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    fetch_seq: Arc<AtomicU64>,
}

impl SyncService {
    pub fn new(
        store: Arc<Store>,
        manager: Arc<ConnectionManager>,
        config: EngineConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SyncEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            store,
            manager,
            events: tx,
            config,
            accounts: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(Notify::new()),
            loop_handle: Mutex::new(None),
            fetch_seq: Arc::new(AtomicU64::new(0)),
        });
        (service, rx)
    }

    /// Registers an account and kicks off folder discovery in the background.
    /// Re-registering an account with discovery already in flight is a no-op.
    pub async fn register(self: &Arc<Self>, account: Account) {
        {
            let mut accounts = self.accounts.lock().await;
            match accounts.get(&account.id) {
                Some(state) if state.discovery != Discovery::NotStarted => return,
                _ => {}
            }
            accounts.insert(
                account.id.clone(),
                AccountState {
                    account: account.clone(),
                    discovery: Discovery::InProgress,
                    folders: Vec::new(),
                    current_folder: "INBOX".to_string(),
                    syncing: HashSet::new(),
                },
            );
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.discover_folders(account).await;
        });
    }

    async fn discover_folders(&self, account: Account) {
        info!(account = %account.id, "Starting folder discovery");
        let result = self.list_folders(&account).await;
        let mut accounts = self.accounts.lock().await;
        let Some(state) = accounts.get_mut(&account.id) else {
            return;
        };
        match result {
            Ok(folders) => {
                info!(account = %account.id, count = folders.len(), "Folder discovery complete");
                state.discovery = Discovery::Complete;
                state.folders = folders.clone();
                let _ = self.events.send(SyncEvent::FolderDiscoveryComplete {
                    account_id: account.id,
                    folders,
                });
            }
            Err(e) => {
                warn!(account = %account.id, error = %e, "Folder discovery failed");
                state.discovery = Discovery::NotStarted;
                let _ = self.events.send(SyncEvent::FolderDiscoveryError {
                    account_id: account.id,
                    payload: format!("Error: {}", e),
                });
            }
        }
    }

    async fn list_folders(&self, account: &Account) -> EngineResult<Vec<String>> {
        let conn = self.manager.get(account).await;
        let lines = conn.lock().await.execute(&Command::List).await?;
        Ok(parse_folder_list(&lines))
    }

    /// Starts the periodic loop and the pool sweep. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.start_sweep();

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.config.sync_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            while service.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = service.stop_signal.notified() => break,
                }
                if !service.running.load(Ordering::SeqCst) {
                    break;
                }
                service.sync_cycle().await;
            }
        });
        *self.loop_handle.lock().await = Some(handle);
        info!("Sync loop started");
    }

    /// One pass over every discovered account: INBOX plus the folder the
    /// presentation layer currently has focused.
    async fn sync_cycle(&self) {
        let targets: Vec<(Account, Vec<String>)> = {
            let accounts = self.accounts.lock().await;
            accounts
                .values()
                .filter(|s| s.discovery == Discovery::Complete)
                .map(|s| {
                    let mut folders = vec!["INBOX".to_string()];
                    if !s.current_folder.is_empty() && s.current_folder != "INBOX" {
                        folders.push(s.current_folder.clone());
                    }
                    (s.account.clone(), folders)
                })
                .collect()
        };

        for (account, folders) in targets {
            for folder in folders {
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                self.sync_folder(&account, &folder, false).await;
                tokio::time::sleep(self.config.folder_pause).await;
            }
        }
    }

    pub async fn set_current_folder(&self, account_id: &str, folder: &str) {
        let mut accounts = self.accounts.lock().await;
        if let Some(state) = accounts.get_mut(account_id) {
            state.current_folder = folder.to_string();
        }
    }

    /// Synchronizes one folder now. A sync already in flight for that same
    /// folder is skipped unless `force` is set; other folders of the account
    /// proceed independently. Failures go to the event channel and the
    /// cache's error counter; this never returns an error.
    pub async fn sync_folder(&self, account: &Account, folder: &str, force: bool) {
        {
            let mut accounts = self.accounts.lock().await;
            match accounts.get_mut(&account.id) {
                Some(state) => {
                    if !force && state.syncing.contains(folder) {
                        debug!(account = %account.id, folder = %folder, "Sync already in flight; skipping");
                        return;
                    }
                    state.syncing.insert(folder.to_string());
                }
                None => return,
            }
        }

        let fetch_id = self.fetch_seq.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(account = %account.id, folder = %folder, fetch_id, "Syncing folder");

        let result = self.sync_folder_inner(account, folder).await;

        {
            let mut accounts = self.accounts.lock().await;
            if let Some(state) = accounts.get_mut(&account.id) {
                state.syncing.remove(folder);
            }
        }

        match result {
            Ok(count) => {
                info!(account = %account.id, folder = %folder, count, "Folder sync complete");
                let _ = self.events.send(SyncEvent::SyncComplete {
                    account_id: account.id.clone(),
                    folder: folder.to_string(),
                    fetch_id,
                    message_count: count,
                });
            }
            Err(e) => {
                warn!(account = %account.id, folder = %folder, error = %e, "Folder sync failed");
                if let Err(db_err) = self.store.record_sync_error(&account.id, folder).await {
                    warn!(account = %account.id, error = %db_err, "Recording sync error failed");
                }
                let _ = self.events.send(SyncEvent::SyncError {
                    account_id: account.id.clone(),
                    folder: folder.to_string(),
                    fetch_id,
                    payload: format!("Error: {}", e),
                });
            }
        }
    }

    async fn sync_folder_inner(&self, account: &Account, folder: &str) -> EngineResult<usize> {
        let conn = self.manager.get(account).await;

        let uids = {
            let mut conn = conn.lock().await;
            conn.execute(&Command::Select(folder.to_string())).await?;
            let lines = conn.execute(&Command::Search("ALL".to_string())).await?;
            parse_search_uids(&lines)
        };

        // Most recent window only; the tail of a SEARCH ALL response is the
        // highest-UID end on every server we target.
        let window_start = uids.len().saturating_sub(self.config.fetch_window);
        let window = &uids[window_start..];

        let mut messages: Vec<Message> = Vec::with_capacity(window.len());
        for batch in window.chunks(UID_BATCH) {
            let uid_set = batch
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let lines = conn
                .lock()
                .await
                .execute(&Command::Fetch {
                    uid_set,
                    items: SYNC_FETCH_ITEMS.to_string(),
                })
                .await?;
            messages.extend(messages_from_fetch_lines(&lines, folder, &account.id));
        }

        self.store.reconcile(folder, &account.id, &messages).await?;

        let highest_uid = messages.iter().map(|m| m.uid).max().unwrap_or(0);
        self.store
            .upsert_sync_status(&SyncStatus {
                account_id: account.id.clone(),
                folder: folder.to_string(),
                last_sync_ts: Some(now_ts()),
                highest_uid,
                message_count: messages.len() as u32,
                error_count: 0,
                state: SyncState::Idle,
            })
            .await?;

        Ok(messages.len())
    }

    /// On-demand body download for one cached message, written through to the
    /// cache. Returns the (text, html) pair.
    pub async fn fetch_body(
        &self,
        account: &Account,
        folder: &str,
        uid: u32,
    ) -> EngineResult<(String, String)> {
        let conn = self.manager.get(account).await;
        let lines = {
            let mut conn = conn.lock().await;
            conn.execute(&Command::Select(folder.to_string())).await?;
            conn.execute(&Command::Fetch {
                uid_set: uid.to_string(),
                items: "(UID BODY.PEEK[])".to_string(),
            })
            .await?
        };

        let fetched = messages_from_fetch_lines(&lines, folder, &account.id)
            .into_iter()
            .find(|m| m.uid == uid)
            .ok_or_else(|| {
                EngineError::Protocol(format!("no body returned for uid {}", uid))
            })?;

        self.store
            .update_body(uid, folder, &account.id, &fetched.body_text, &fetched.body_html)
            .await?;
        Ok((fetched.body_text, fetched.body_html))
    }

    /// Read-flag write-through: STORE on the server first, then the cache.
    pub async fn mark_read(
        &self,
        account: &Account,
        folder: &str,
        uid: u32,
        read: bool,
    ) -> EngineResult<()> {
        let item = if read { "+FLAGS" } else { "-FLAGS" };
        let conn = self.manager.get(account).await;
        {
            let mut conn = conn.lock().await;
            conn.execute(&Command::Select(folder.to_string())).await?;
            conn.execute(&Command::Store {
                uid_set: uid.to_string(),
                item: item.to_string(),
                flags: "(\\Seen)".to_string(),
            })
            .await?;
        }
        self.store
            .update_read_status(uid, folder, &account.id, read)
            .await
    }

    /// Cached-message search for the presentation layer; no network traffic.
    pub async fn search(
        &self,
        query: &str,
        folder: &str,
        account_id: &str,
    ) -> EngineResult<Vec<Message>> {
        self.store.search(query, folder, account_id).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals the loop to stop and waits for it to drain, bounded by the
    /// configured stop timeout; a loop stuck past the bound is aborted. All
    /// pooled connections are closed afterwards.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_signal.notify_waiters();
        if let Some(mut handle) = self.loop_handle.lock().await.take() {
            if tokio::time::timeout(self.config.stop_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("Sync loop did not stop within the timeout; aborting");
                handle.abort();
            }
        }
        self.manager.stop_sweep();
        self.manager.close_all().await;
        info!("Sync loop stopped");
    }
}
