//! Durable local cache: messages, attachments and per-folder sync status in
//! SQLite, reconciled against freshly fetched server state.
//!
//! All mutating operations take a process-wide write lock so concurrent fetch
//! completions serialize their writes; reads go straight to the pool, which
//! the driver already serializes at the connection level.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::model::{Address, Attachment, Message};
use crate::types::{now_ts, SyncState, SyncStatus};

const DB_FILE_NAME: &str = "plume.db";

pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    path: Option<PathBuf>,
}

impl Store {
    /// Opens (creating if needed) the cache in the default data directory.
    pub async fn open_default() -> EngineResult<Self> {
        let base = default_data_dir()?;
        Self::open(&base.join(DB_FILE_NAME)).await
    }

    pub async fn open(db_path: &Path) -> EngineResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EngineError::Storage(format!("creating data directory {}: {}", parent.display(), e))
            })?;
        }
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&url).await?;
        let store = Store {
            pool,
            write_lock: Mutex::new(()),
            path: Some(db_path.to_path_buf()),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests. A single pooled connection keeps every
    /// handle on the same database.
    pub async fn open_in_memory() -> EngineResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Store {
            pool,
            write_lock: Mutex::new(()),
            path: None,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Idempotent schema creation; safe against an existing database.
    async fn migrate(&self) -> EngineResult<()> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                uid INTEGER NOT NULL,
                folder TEXT NOT NULL,
                account_id TEXT NOT NULL,
                message_id TEXT NOT NULL DEFAULT '',
                subject TEXT NOT NULL DEFAULT '',
                sender_name TEXT NOT NULL DEFAULT '',
                sender_email TEXT NOT NULL DEFAULT '',
                to_addrs TEXT NOT NULL DEFAULT '[]',
                cc_addrs TEXT NOT NULL DEFAULT '[]',
                bcc_addrs TEXT NOT NULL DEFAULT '[]',
                reply_to_addrs TEXT NOT NULL DEFAULT '[]',
                date_ts INTEGER,
                flags TEXT NOT NULL DEFAULT '[]',
                is_read INTEGER NOT NULL DEFAULT 0,
                is_flagged INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                is_draft INTEGER NOT NULL DEFAULT 0,
                is_answered INTEGER NOT NULL DEFAULT 0,
                has_attachments INTEGER NOT NULL DEFAULT 0,
                body_text TEXT NOT NULL DEFAULT '',
                body_html TEXT NOT NULL DEFAULT '',
                headers TEXT NOT NULL DEFAULT '',
                envelope TEXT NOT NULL DEFAULT '',
                bodystructure TEXT NOT NULL DEFAULT '',
                thread_subject TEXT NOT NULL DEFAULT '',
                references_json TEXT NOT NULL DEFAULT '[]',
                in_reply_to TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (uid, folder, account_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_account_folder
                ON messages(account_id, folder);
            CREATE INDEX IF NOT EXISTS idx_messages_date
                ON messages(account_id, folder, date_ts DESC);

            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uid INTEGER NOT NULL,
                folder TEXT NOT NULL,
                account_id TEXT NOT NULL,
                filename TEXT NOT NULL DEFAULT '',
                content_type TEXT NOT NULL DEFAULT '',
                size INTEGER NOT NULL DEFAULT 0,
                part_id TEXT NOT NULL DEFAULT '',
                is_inline INTEGER NOT NULL DEFAULT 0,
                content_id TEXT NOT NULL DEFAULT '',
                downloaded INTEGER NOT NULL DEFAULT 0,
                local_path TEXT NOT NULL DEFAULT '',
                FOREIGN KEY (uid, folder, account_id)
                    REFERENCES messages(uid, folder, account_id)
                    ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_attachments_message
                ON attachments(account_id, folder, uid);

            CREATE TABLE IF NOT EXISTS sync_status (
                account_id TEXT NOT NULL,
                folder TEXT NOT NULL,
                last_sync_ts INTEGER,
                highest_uid INTEGER NOT NULL DEFAULT 0,
                message_count INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL DEFAULT 'idle',
                PRIMARY KEY (account_id, folder)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert-or-replace by (uid, folder, account). Never errors on duplicate
    /// keys; attachments rows are replaced along with their message.
    pub async fn upsert_messages(
        &self,
        messages: &[Message],
        folder: &str,
        account_id: &str,
    ) -> EngineResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;
        for message in messages {
            upsert_message_tx(&mut tx, message, folder, account_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Non-deleted messages for one folder, newest first.
    pub async fn get_messages(
        &self,
        folder: &str,
        account_id: &str,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages \
             WHERE account_id = ?1 AND folder = ?2 AND is_deleted = 0 \
             ORDER BY date_ts DESC NULLS LAST \
             LIMIT ?3 OFFSET ?4;",
            MESSAGE_COLUMNS
        ))
        .bind(account_id)
        .bind(folder)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = message_from_row(&row);
            message.attachments = self
                .load_attachments(message.uid, folder, account_id)
                .await?;
            out.push(message);
        }
        Ok(out)
    }

    /// Point lookup. Absent (or reconciled-away) messages return None.
    pub async fn get_message(
        &self,
        uid: u32,
        folder: &str,
        account_id: &str,
    ) -> EngineResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM messages \
             WHERE uid = ?1 AND folder = ?2 AND account_id = ?3;",
            MESSAGE_COLUMNS
        ))
        .bind(uid as i64)
        .bind(folder)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut message = message_from_row(&row);
                message.attachments = self.load_attachments(uid, folder, account_id).await?;
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }

    /// Partial update: body columns only, everything else untouched.
    pub async fn update_body(
        &self,
        uid: u32,
        folder: &str,
        account_id: &str,
        text: &str,
        html: &str,
    ) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            "UPDATE messages SET body_text = ?1, body_html = ?2, updated_at = ?3 \
             WHERE uid = ?4 AND folder = ?5 AND account_id = ?6;",
        )
        .bind(text)
        .bind(html)
        .bind(now_ts())
        .bind(uid as i64)
        .bind(folder)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Partial update of the read flag, keeping the raw flag list consistent.
    pub async fn update_read_status(
        &self,
        uid: u32,
        folder: &str,
        account_id: &str,
        read: bool,
    ) -> EngineResult<()> {
        let current = self.get_message(uid, folder, account_id).await?;
        let Some(mut message) = current else {
            return Ok(());
        };
        let mut flags = message.flags.clone();
        flags.retain(|f| !f.eq_ignore_ascii_case("\\Seen"));
        if read {
            flags.push("\\Seen".to_string());
        }
        message.flags = flags;
        self.update_flags(uid, folder, account_id, &message.flags).await
    }

    /// Replaces the flag set and the booleans derived from it.
    pub async fn update_flags(
        &self,
        uid: u32,
        folder: &str,
        account_id: &str,
        flags: &[String],
    ) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        let flags_vec: Vec<String> = flags.to_vec();
        let mut probe = Message {
            flags: flags_vec.clone(),
            ..Message::default()
        };
        probe.derive_fields();

        sqlx::query(
            "UPDATE messages SET flags = ?1, is_read = ?2, is_flagged = ?3, \
             is_deleted = ?4, is_draft = ?5, is_answered = ?6, updated_at = ?7 \
             WHERE uid = ?8 AND folder = ?9 AND account_id = ?10;",
        )
        .bind(json_list(&flags_vec))
        .bind(probe.is_read as i64)
        .bind(probe.is_flagged as i64)
        .bind(probe.is_deleted as i64)
        .bind(probe.is_draft as i64)
        .bind(probe.is_answered as i64)
        .bind(now_ts())
        .bind(uid as i64)
        .bind(folder)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Diff-based reconciliation against a freshly fetched server set:
    /// messages cached but absent from `server_messages` are deleted (with
    /// their attachments); the rest are upserted. Idempotent, so racing
    /// periodic and manual syncs converge to server truth.
    pub async fn reconcile(
        &self,
        folder: &str,
        account_id: &str,
        server_messages: &[Message],
    ) -> EngineResult<u64> {
        let _guard = self.write_lock.lock().await;

        let cached_uids: HashSet<u32> = sqlx::query(
            "SELECT uid FROM messages WHERE account_id = ?1 AND folder = ?2;",
        )
        .bind(account_id)
        .bind(folder)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get::<i64, _>(0) as u32)
        .collect();

        let server_uids: HashSet<u32> = server_messages.iter().map(|m| m.uid).collect();
        let stale: Vec<u32> = cached_uids.difference(&server_uids).copied().collect();

        let mut tx = self.pool.begin().await?;

        if !stale.is_empty() {
            // Attachments go explicitly, staying correct even if cascading
            // was never enabled on this connection.
            delete_by_uids(&mut tx, "attachments", account_id, folder, &stale).await?;
            delete_by_uids(&mut tx, "messages", account_id, folder, &stale).await?;
        }

        for message in server_messages {
            upsert_message_tx(&mut tx, message, folder, account_id).await?;
        }

        tx.commit().await?;

        debug!(
            account = %account_id,
            folder = %folder,
            server = server_messages.len(),
            deleted = stale.len(),
            "Reconciled folder against server state"
        );
        Ok(stale.len() as u64)
    }

    /// Case-insensitive substring search across subject, sender name, sender
    /// email and body text. The query is matched literally; `%` and `_` in
    /// it are not wildcards.
    pub async fn search(
        &self,
        query: &str,
        folder: &str,
        account_id: &str,
    ) -> EngineResult<Vec<Message>> {
        let pattern = like_pattern(query);
        let rows = sqlx::query(&format!(
            "SELECT {} FROM messages \
             WHERE account_id = ?1 AND folder = ?2 AND is_deleted = 0 \
               AND (lower(subject) LIKE ?3 ESCAPE '\\' \
                    OR lower(sender_name) LIKE ?3 ESCAPE '\\' \
                    OR lower(sender_email) LIKE ?3 ESCAPE '\\' \
                    OR lower(body_text) LIKE ?3 ESCAPE '\\') \
             ORDER BY date_ts DESC NULLS LAST;",
            MESSAGE_COLUMNS
        ))
        .bind(account_id)
        .bind(folder)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut message = message_from_row(&row);
            message.attachments = self
                .load_attachments(message.uid, folder, account_id)
                .await?;
            out.push(message);
        }
        Ok(out)
    }

    pub async fn get_sync_status(
        &self,
        account_id: &str,
        folder: &str,
    ) -> EngineResult<Option<SyncStatus>> {
        let row = sqlx::query(
            "SELECT last_sync_ts, highest_uid, message_count, error_count, state \
             FROM sync_status WHERE account_id = ?1 AND folder = ?2;",
        )
        .bind(account_id)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SyncStatus {
            account_id: account_id.to_string(),
            folder: folder.to_string(),
            last_sync_ts: row.get(0),
            highest_uid: row.get::<i64, _>(1) as u32,
            message_count: row.get::<i64, _>(2) as u32,
            error_count: row.get::<i64, _>(3) as u32,
            state: SyncState::from_str(&row.get::<String, _>(4)),
        }))
    }

    pub async fn upsert_sync_status(&self, status: &SyncStatus) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO sync_status (account_id, folder, last_sync_ts, highest_uid, message_count, error_count, state)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(account_id, folder) DO UPDATE SET
                last_sync_ts = excluded.last_sync_ts,
                highest_uid = excluded.highest_uid,
                message_count = excluded.message_count,
                error_count = excluded.error_count,
                state = excluded.state;
            "#,
        )
        .bind(&status.account_id)
        .bind(&status.folder)
        .bind(status.last_sync_ts)
        .bind(status.highest_uid as i64)
        .bind(status.message_count as i64)
        .bind(status.error_count as i64)
        .bind(status.state.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bumps the consecutive error counter and marks the folder errored.
    pub async fn record_sync_error(&self, account_id: &str, folder: &str) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO sync_status (account_id, folder, error_count, state)
            VALUES (?1, ?2, 1, 'error')
            ON CONFLICT(account_id, folder) DO UPDATE SET
                error_count = sync_status.error_count + 1,
                state = 'error';
            "#,
        )
        .bind(account_id)
        .bind(folder)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attachment rows stored for one folder (for diagnostics and tests).
    pub async fn attachment_count(&self, folder: &str, account_id: &str) -> EngineResult<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM attachments WHERE account_id = ?1 AND folder = ?2;",
        )
        .bind(account_id)
        .bind(folder)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    async fn load_attachments(
        &self,
        uid: u32,
        folder: &str,
        account_id: &str,
    ) -> EngineResult<Vec<Attachment>> {
        let rows = sqlx::query(
            "SELECT filename, content_type, size, part_id, is_inline, content_id, downloaded, local_path \
             FROM attachments \
             WHERE uid = ?1 AND folder = ?2 AND account_id = ?3 \
             ORDER BY part_id ASC;",
        )
        .bind(uid as i64)
        .bind(folder)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| Attachment {
                filename: row.get(0),
                content_type: row.get(1),
                size: row.get::<i64, _>(2) as u32,
                part_id: row.get(3),
                is_inline: row.get::<i64, _>(4) == 1,
                content_id: row.get(5),
                downloaded: row.get::<i64, _>(6) == 1,
                local_path: row.get(7),
            })
            .collect())
    }
}

const MESSAGE_COLUMNS: &str = "uid, message_id, subject, sender_name, sender_email, \
    to_addrs, cc_addrs, bcc_addrs, reply_to_addrs, date_ts, flags, \
    is_read, is_flagged, is_deleted, is_draft, is_answered, has_attachments, \
    body_text, body_html, headers, envelope, bodystructure, \
    thread_subject, references_json, in_reply_to, folder, account_id";

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Message {
    let addr_list = |idx: usize| -> Vec<Address> {
        serde_json::from_str(&row.get::<String, _>(idx)).unwrap_or_default()
    };
    Message {
        uid: row.get::<i64, _>(0) as u32,
        message_id: row.get(1),
        subject: row.get(2),
        sender: Address {
            name: row.get(3),
            email: row.get(4),
        },
        to: addr_list(5),
        cc: addr_list(6),
        bcc: addr_list(7),
        reply_to: addr_list(8),
        date: row
            .get::<Option<i64>, _>(9)
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
        flags: serde_json::from_str(&row.get::<String, _>(10)).unwrap_or_default(),
        is_read: row.get::<i64, _>(11) == 1,
        is_flagged: row.get::<i64, _>(12) == 1,
        is_deleted: row.get::<i64, _>(13) == 1,
        is_draft: row.get::<i64, _>(14) == 1,
        is_answered: row.get::<i64, _>(15) == 1,
        has_attachments: row.get::<i64, _>(16) == 1,
        body_text: row.get(17),
        body_html: row.get(18),
        headers: row.get(19),
        envelope: row.get(20),
        bodystructure: row.get(21),
        thread_subject: row.get(22),
        references: serde_json::from_str(&row.get::<String, _>(23)).unwrap_or_default(),
        in_reply_to: row.get(24),
        folder: row.get(25),
        account_id: row.get(26),
        attachments: Vec::new(),
    }
}

fn like_pattern(query: &str) -> String {
    let escaped = query
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn json_list<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "[]".into())
}

async fn upsert_message_tx(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    message: &Message,
    folder: &str,
    account_id: &str,
) -> EngineResult<()> {
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO messages (
            uid, folder, account_id, message_id, subject, sender_name, sender_email,
            to_addrs, cc_addrs, bcc_addrs, reply_to_addrs, date_ts, flags,
            is_read, is_flagged, is_deleted, is_draft, is_answered, has_attachments,
            body_text, body_html, headers, envelope, bodystructure,
            thread_subject, references_json, in_reply_to, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)
        ON CONFLICT(uid, folder, account_id) DO UPDATE SET
            message_id = excluded.message_id,
            subject = excluded.subject,
            sender_name = excluded.sender_name,
            sender_email = excluded.sender_email,
            to_addrs = excluded.to_addrs,
            cc_addrs = excluded.cc_addrs,
            bcc_addrs = excluded.bcc_addrs,
            reply_to_addrs = excluded.reply_to_addrs,
            date_ts = excluded.date_ts,
            flags = excluded.flags,
            is_read = excluded.is_read,
            is_flagged = excluded.is_flagged,
            is_deleted = excluded.is_deleted,
            is_draft = excluded.is_draft,
            is_answered = excluded.is_answered,
            has_attachments = excluded.has_attachments,
            body_text = excluded.body_text,
            body_html = excluded.body_html,
            headers = excluded.headers,
            envelope = excluded.envelope,
            bodystructure = excluded.bodystructure,
            thread_subject = excluded.thread_subject,
            references_json = excluded.references_json,
            in_reply_to = excluded.in_reply_to,
            updated_at = excluded.updated_at;
        "#,
    )
    .bind(message.uid as i64)
    .bind(folder)
    .bind(account_id)
    .bind(&message.message_id)
    .bind(&message.subject)
    .bind(&message.sender.name)
    .bind(&message.sender.email)
    .bind(json_list(&message.to))
    .bind(json_list(&message.cc))
    .bind(json_list(&message.bcc))
    .bind(json_list(&message.reply_to))
    .bind(message.date.map(|d| d.timestamp()))
    .bind(json_list(&message.flags))
    .bind(message.is_read as i64)
    .bind(message.is_flagged as i64)
    .bind(message.is_deleted as i64)
    .bind(message.is_draft as i64)
    .bind(message.is_answered as i64)
    .bind(message.has_attachments as i64)
    .bind(&message.body_text)
    .bind(&message.body_html)
    .bind(&message.headers)
    .bind(&message.envelope)
    .bind(&message.bodystructure)
    .bind(&message.thread_subject)
    .bind(json_list(&message.references))
    .bind(&message.in_reply_to)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    // Attachment rows are replaced wholesale with their parent.
    sqlx::query("DELETE FROM attachments WHERE uid = ?1 AND folder = ?2 AND account_id = ?3;")
        .bind(message.uid as i64)
        .bind(folder)
        .bind(account_id)
        .execute(&mut **tx)
        .await?;

    for attachment in &message.attachments {
        sqlx::query(
            r#"
            INSERT INTO attachments (uid, folder, account_id, filename, content_type,
                                     size, part_id, is_inline, content_id, downloaded, local_path)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11);
            "#,
        )
        .bind(message.uid as i64)
        .bind(folder)
        .bind(account_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(attachment.size as i64)
        .bind(&attachment.part_id)
        .bind(attachment.is_inline as i64)
        .bind(&attachment.content_id)
        .bind(attachment.downloaded as i64)
        .bind(&attachment.local_path)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn delete_by_uids(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    table: &str,
    account_id: &str,
    folder: &str,
    uids: &[u32],
) -> EngineResult<()> {
    if uids.is_empty() {
        return Ok(());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("DELETE FROM {} WHERE account_id = ", table));
    qb.push_bind(account_id);
    qb.push(" AND folder = ");
    qb.push_bind(folder);
    qb.push(" AND uid IN (");
    {
        let mut separated = qb.separated(", ");
        for uid in uids {
            separated.push_bind(*uid as i64);
        }
    }
    qb.push(")");
    qb.build().execute(&mut **tx).await?;
    Ok(())
}

pub(crate) fn default_data_dir() -> EngineResult<PathBuf> {
    if let Ok(custom) = env::var("PLUME_DATA_DIR") {
        let path = PathBuf::from(custom);
        std::fs::create_dir_all(&path).map_err(|e| {
            EngineError::Storage(format!("creating PLUME_DATA_DIR at {}: {}", path.display(), e))
        })?;
        return Ok(path);
    }

    if let Some(home) = dirs::home_dir() {
        let path = home.join(".plume");
        if std::fs::create_dir_all(&path).is_ok() {
            return Ok(path);
        }
        warn!(
            "Unable to create {}/.plume; falling back to workspace-local storage",
            home.display()
        );
    }

    let cwd = env::current_dir()
        .map_err(|e| EngineError::Storage(format!("determining current directory: {}", e)))?;
    let path = cwd.join("plume-data");
    std::fs::create_dir_all(&path).map_err(|e| {
        EngineError::Storage(format!("creating fallback data directory {}: {}", path.display(), e))
    })?;
    Ok(path)
}
