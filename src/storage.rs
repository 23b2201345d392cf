use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::live::{Change, ChangeFeed, LiveQuery, QueryFn, Table};
use crate::models::{
    now, Message, MessagePart, MessageStats, MessageSummary, Role, Thread, DEFAULT_THREAD_TITLE,
};

/// Schema migrations applied in order; each entry is (version, sql).
/// Existing entries must never change: databases on disk depend on them.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE IF NOT EXISTS threads (
            id              TEXT    PRIMARY KEY NOT NULL, -- UUID
            title           TEXT    NOT NULL,
            created_at      INTEGER NOT NULL, -- Unix ms
            updated_at      INTEGER NOT NULL,
            last_message_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_threads_title ON threads(title);
        CREATE INDEX IF NOT EXISTS idx_threads_updated_at ON threads(updated_at);
        CREATE INDEX IF NOT EXISTS idx_threads_last_message_at ON threads(last_message_at);

        CREATE TABLE IF NOT EXISTS messages (
            id         TEXT    PRIMARY KEY NOT NULL,
            thread_id  TEXT    NOT NULL,
            parts      TEXT    NOT NULL, -- JSON array
            content    TEXT    NOT NULL,
            role       TEXT    NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_messages_thread_id ON messages(thread_id);
        CREATE INDEX IF NOT EXISTS idx_messages_created_at ON messages(created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_thread_created ON messages(thread_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_content ON messages(content);

        CREATE TABLE IF NOT EXISTS message_summaries (
            id         TEXT    PRIMARY KEY NOT NULL,
            thread_id  TEXT    NOT NULL,
            message_id TEXT    NOT NULL,
            content    TEXT    NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (thread_id) REFERENCES threads(id) ON DELETE CASCADE,
            FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
        );
        CREATE INDEX IF NOT EXISTS idx_summaries_thread_id ON message_summaries(thread_id);
        CREATE INDEX IF NOT EXISTS idx_summaries_message_id ON message_summaries(message_id);
        CREATE INDEX IF NOT EXISTS idx_summaries_created_at ON message_summaries(created_at);
        CREATE INDEX IF NOT EXISTS idx_summaries_thread_created ON message_summaries(thread_id, created_at);

        CREATE TABLE IF NOT EXISTS settings (
            key   TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        )
        ",
    ),
    (
        2,
        "
        ALTER TABLE messages ADD COLUMN stats TEXT;
        CREATE INDEX IF NOT EXISTS idx_messages_stats ON messages(stats)
        ",
    ),
];

const MESSAGE_COLUMNS: &str = "id, thread_id, parts, content, role, created_at, stats";

/// Persistence of a named JSON record, the contract the settings stores write through.
#[async_trait]
pub trait SettingsBackend: Send + Sync {
    async fn load(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn save(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// The local conversation store: threads, messages and message summaries.
///
/// Cheap to clone; clones share the pool and the change feed.
#[derive(Debug, Clone)]
pub struct StorageManager {
    pool: SqlitePool,
    changes: ChangeFeed,
}

impl StorageManager {
    /// Opens (or creates) the database file and brings its schema up to date.
    pub async fn open(db_path: &Path) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        log::info!("Opening conversation database: {}", db_path.display());

        let pool = Self::connect_file(db_path).await?;
        Self::run_migrations(&pool, Self::latest_version()).await?;
        Ok(Self::from_pool(pool))
    }

    /// A private database that lives as long as the returned manager.
    pub async fn open_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // A single, never-recycled connection: each connection would otherwise
        // see its own empty in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::run_migrations(&pool, Self::latest_version()).await?;
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            changes: ChangeFeed::new(),
        }
    }

    async fn connect_file(db_path: &Path) -> StorageResult<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        Ok(SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?)
    }

    fn latest_version() -> i64 {
        MIGRATIONS.last().map(|(version, _)| *version).unwrap_or(0)
    }

    /// Applies every pending migration up to and including `target`.
    async fn run_migrations(pool: &SqlitePool, target: i64) -> StorageResult<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
            .execute(pool)
            .await?;
        sqlx::query(
            "INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
        )
        .execute(pool)
        .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version <= current || *version > target {
                continue;
            }
            log::info!("Applying schema migration {}", version);
            let mut tx = pool.begin().await?;
            // One statement per query call.
            for statement in sql.split(';') {
                let statement = statement.trim();
                if !statement.is_empty() {
                    sqlx::query(statement).execute(&mut *tx).await?;
                }
            }
            sqlx::query("UPDATE schema_version SET version = ?")
                .bind(*version)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        log::debug!("Database schema is at version {}", target.max(current));
        Ok(())
    }

    /// Subscribes to committed changes.
    pub fn changes(&self) -> &ChangeFeed {
        &self.changes
    }

    // --- Threads ---

    /// Inserts a thread with the default title. A second call for the same id
    /// fails with [`StorageError::DuplicateThread`].
    pub async fn create_thread(&self, id: Uuid) -> StorageResult<Thread> {
        log::info!("Creating thread {}", id);
        let ts = now();
        let thread = Thread {
            id,
            title: DEFAULT_THREAD_TITLE.to_string(),
            created_at: ts,
            updated_at: ts,
            last_message_at: ts,
        };

        let result = sqlx::query(
            "INSERT INTO threads (id, title, created_at, updated_at, last_message_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&thread.title)
        .bind(ts.timestamp_millis())
        .bind(ts.timestamp_millis())
        .bind(ts.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(ref db)) if db.is_unique_violation() => {
                log::warn!("Thread {} already exists", id);
                return Err(StorageError::DuplicateThread(id));
            }
            Err(e) => return Err(e.into()),
        }

        self.changes.publish(Change::new(Table::Threads, id));
        Ok(thread)
    }

    pub async fn get_thread(&self, id: Uuid) -> StorageResult<Option<Thread>> {
        log::debug!("Fetching thread {}", id);
        let row = sqlx::query(
            "SELECT id, title, created_at, updated_at, last_message_at FROM threads WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(thread_from_row).transpose()
    }

    /// All threads, most recently active first.
    pub async fn get_threads(&self) -> StorageResult<Vec<Thread>> {
        log::debug!("Fetching all threads");
        let rows = sqlx::query(
            "SELECT id, title, created_at, updated_at, last_message_at
             FROM threads
             ORDER BY last_message_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(thread_from_row).collect()
    }

    /// Sets the title. An unknown id is logged and otherwise ignored.
    pub async fn update_thread(&self, id: Uuid, title: &str) -> StorageResult<()> {
        log::info!("Renaming thread {} to: {}", id, title);
        let result = sqlx::query("UPDATE threads SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(now().timestamp_millis())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            log::warn!("Attempted to rename non-existent thread: {}", id);
            return Ok(());
        }
        self.changes.publish(Change::new(Table::Threads, id));
        Ok(())
    }

    /// Removes the thread with its messages and summaries in one transaction.
    /// An unknown id is logged and otherwise ignored.
    pub async fn delete_thread(&self, id: Uuid) -> StorageResult<()> {
        log::warn!("Deleting thread {}", id);
        let id_text = id.to_string();

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM message_summaries WHERE thread_id = ?")
            .bind(&id_text)
            .execute(&mut *tx)
            .await?;
        let messages = sqlx::query("DELETE FROM messages WHERE thread_id = ?")
            .bind(&id_text)
            .execute(&mut *tx)
            .await?;
        let threads = sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(&id_text)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        if threads.rows_affected() == 0 {
            log::warn!("Attempted to delete non-existent thread: {}", id);
            return Ok(());
        }
        log::info!(
            "Deleted thread {} and {} messages",
            id,
            messages.rows_affected()
        );
        self.changes.publish(Change::new(Table::MessageSummaries, id));
        self.changes.publish(Change::new(Table::Messages, id));
        self.changes.publish(Change::new(Table::Threads, id));
        Ok(())
    }

    // --- Messages ---

    /// Inserts `message` (with optional stats) and bumps the parent thread's
    /// activity timestamps. Fails with [`StorageError::ThreadNotFound`] when the
    /// thread does not exist.
    pub async fn create_message(
        &self,
        message: &Message,
        stats: Option<&MessageStats>,
    ) -> StorageResult<()> {
        log::debug!(
            "Saving message {} to thread {}",
            message.id,
            message.thread_id
        );
        let thread_id = message.thread_id.to_string();
        let parts = serde_json::to_string(&message.parts)?;
        let stats = stats.or(message.stats.as_ref()).map(serde_json::to_string).transpose()?;

        let mut tx = self.pool.begin().await?;
        if !thread_exists(&mut *tx, &thread_id).await? {
            log::error!(
                "Refusing to save message {} for missing thread {}",
                message.id,
                message.thread_id
            );
            return Err(StorageError::ThreadNotFound(message.thread_id));
        }

        sqlx::query(
            "INSERT INTO messages (id, thread_id, parts, content, role, created_at, stats)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(message.id.to_string())
        .bind(&thread_id)
        .bind(parts)
        .bind(&message.content)
        .bind(message.role.as_str())
        .bind(message.created_at.timestamp_millis())
        .bind(stats)
        .execute(&mut *tx)
        .await?;

        // An older message never moves the thread back in the list.
        sqlx::query(
            "UPDATE threads SET last_message_at = MAX(last_message_at, ?), updated_at = ? WHERE id = ?",
        )
            .bind(message.created_at.timestamp_millis())
            .bind(now().timestamp_millis())
            .bind(&thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        log::info!("Saved {} message {}", message.role, message.id);
        self.changes.publish(Change::new(Table::Messages, message.thread_id));
        self.changes.publish(Change::new(Table::Threads, message.thread_id));
        Ok(())
    }

    /// Attaches stats to an already stored message. Returns false when the
    /// message does not exist.
    pub async fn attach_stats(&self, message_id: Uuid, stats: &MessageStats) -> StorageResult<bool> {
        let row = sqlx::query("UPDATE messages SET stats = ? WHERE id = ? RETURNING thread_id")
            .bind(serde_json::to_string(stats)?)
            .bind(message_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            log::warn!("Attempted to attach stats to non-existent message: {}", message_id);
            return Ok(false);
        };
        let thread_id = parse_uuid(&row.try_get::<String, _>("thread_id")?)?;
        self.changes.publish(Change::new(Table::Messages, thread_id));
        Ok(true)
    }

    /// Messages of a thread in creation order.
    pub async fn get_messages_by_thread_id(&self, thread_id: Uuid) -> StorageResult<Vec<Message>> {
        log::debug!("Fetching messages for thread {}", thread_id);
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE thread_id = ?
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(thread_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Case-insensitive substring search over message content. A blank query
    /// matches nothing.
    pub async fn search_messages(&self, query: &str) -> StorageResult<Vec<Message>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        log::debug!("Searching messages for: {}", query);
        let pattern = format!("%{}%", escape_like(query));
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE content LIKE ? ESCAPE '\\'
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(pattern)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    // --- Message summaries ---

    pub async fn create_message_summary(
        &self,
        thread_id: Uuid,
        message_id: Uuid,
        content: &str,
    ) -> StorageResult<MessageSummary> {
        let summary = MessageSummary {
            id: Uuid::new_v4(),
            thread_id,
            message_id,
            content: content.to_string(),
            created_at: now(),
        };

        let mut tx = self.pool.begin().await?;
        if !thread_exists(&mut *tx, &thread_id.to_string()).await? {
            log::error!("Refusing to save summary for missing thread {}", thread_id);
            return Err(StorageError::ThreadNotFound(thread_id));
        }
        sqlx::query(
            "INSERT INTO message_summaries (id, thread_id, message_id, content, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(summary.id.to_string())
        .bind(thread_id.to_string())
        .bind(message_id.to_string())
        .bind(&summary.content)
        .bind(summary.created_at.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        log::info!("Saved summary for message {}", message_id);
        self.changes.publish(Change::new(Table::MessageSummaries, thread_id));
        Ok(summary)
    }

    pub async fn get_message_summaries(&self, thread_id: Uuid) -> StorageResult<Vec<MessageSummary>> {
        let rows = sqlx::query(
            "SELECT id, thread_id, message_id, content, created_at
             FROM message_summaries
             WHERE thread_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(thread_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(MessageSummary {
                    id: parse_uuid(&row.try_get::<String, _>("id")?)?,
                    thread_id: parse_uuid(&row.try_get::<String, _>("thread_id")?)?,
                    message_id: parse_uuid(&row.try_get::<String, _>("message_id")?)?,
                    content: row.try_get("content")?,
                    created_at: parse_millis(row.try_get("created_at")?)?,
                })
            })
            .collect()
    }

    // --- Live queries ---

    pub async fn live_threads(&self) -> StorageResult<LiveQuery<Vec<Thread>>> {
        let store = self.clone();
        let query: QueryFn<Vec<Thread>> = Arc::new(move || {
            let store = store.clone();
            Box::pin(async move { store.get_threads().await })
        });
        LiveQuery::spawn(&self.changes, |c: &Change| c.table == Table::Threads, query).await
    }

    pub async fn live_messages(&self, thread_id: Uuid) -> StorageResult<LiveQuery<Vec<Message>>> {
        let store = self.clone();
        let query: QueryFn<Vec<Message>> = Arc::new(move || {
            let store = store.clone();
            Box::pin(async move { store.get_messages_by_thread_id(thread_id).await })
        });
        LiveQuery::spawn(
            &self.changes,
            move |c: &Change| c.touches(Table::Messages, thread_id),
            query,
        )
        .await
    }

    pub async fn live_message_summaries(
        &self,
        thread_id: Uuid,
    ) -> StorageResult<LiveQuery<Vec<MessageSummary>>> {
        let store = self.clone();
        let query: QueryFn<Vec<MessageSummary>> = Arc::new(move || {
            let store = store.clone();
            Box::pin(async move { store.get_message_summaries(thread_id).await })
        });
        LiveQuery::spawn(
            &self.changes,
            move |c: &Change| c.touches(Table::MessageSummaries, thread_id),
            query,
        )
        .await
    }

    // --- Settings ---

    pub async fn load_setting(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    pub async fn save_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        log::debug!("Saving setting {}", key);
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SettingsBackend for StorageManager {
    async fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.load_setting(key).await?)
    }

    async fn save(&self, key: &str, value: &str) -> anyhow::Result<()> {
        Ok(self.save_setting(key, value).await?)
    }
}

async fn thread_exists(conn: &mut SqliteConnection, thread_id: &str) -> StorageResult<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM threads WHERE id = ?")
        .bind(thread_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn parse_uuid(text: &str) -> StorageResult<Uuid> {
    Uuid::parse_str(text).map_err(|e| StorageError::InvalidRow(format!("bad id '{}': {}", text, e)))
}

fn parse_millis(ms: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::InvalidRow(format!("bad timestamp {}", ms)))
}

fn thread_from_row(row: &SqliteRow) -> StorageResult<Thread> {
    Ok(Thread {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        title: row.try_get("title")?,
        created_at: parse_millis(row.try_get("created_at")?)?,
        updated_at: parse_millis(row.try_get("updated_at")?)?,
        last_message_at: parse_millis(row.try_get("last_message_at")?)?,
    })
}

fn message_from_row(row: &SqliteRow) -> StorageResult<Message> {
    let parts: Vec<MessagePart> = serde_json::from_str(&row.try_get::<String, _>("parts")?)?;
    let role: String = row.try_get("role")?;
    let stats = row
        .try_get::<Option<String>, _>("stats")?
        .map(|json| serde_json::from_str::<MessageStats>(&json))
        .transpose()?;

    Ok(Message {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        thread_id: parse_uuid(&row.try_get::<String, _>("thread_id")?)?,
        parts,
        content: row.try_get("content")?,
        role: Role::from_str(&role).map_err(|e| StorageError::InvalidRow(e.to_string()))?,
        created_at: parse_millis(row.try_get("created_at")?)?,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn assistant(thread_id: Uuid, text: &str) -> Message {
        Message::new(
            Uuid::new_v4(),
            thread_id,
            Role::Assistant,
            vec![MessagePart::Text { text: text.into() }],
        )
    }

    fn sample_stats(model: &str) -> MessageStats {
        MessageStats {
            start_time: now(),
            model: model.into(),
            cost: 0.0001,
            tokens: 10,
            duration: 2000,
            tokens_per_second: 5.0,
        }
    }

    #[tokio::test]
    async fn create_thread_uses_default_title_and_rejects_duplicates() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let id = Uuid::new_v4();

        let thread = store.create_thread(id).await.unwrap();
        assert_eq!(thread.title, DEFAULT_THREAD_TITLE);
        assert_eq!(store.get_thread(id).await.unwrap(), Some(thread));

        let err = store.create_thread(id).await.unwrap_err();
        assert!(matches!(err, StorageError::DuplicateThread(dup) if dup == id));
    }

    #[tokio::test]
    async fn hello_scenario() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let t1 = Uuid::new_v4();
        store.create_thread(t1).await.unwrap();

        let m1 = Message::user(Uuid::new_v4(), t1, "Hello");
        store.create_message(&m1, None).await.unwrap();
        let m2 = assistant(t1, "Hi there");
        let stats = sample_stats("X");
        store.create_message(&m2, Some(&stats)).await.unwrap();

        let threads = store.get_threads().await.unwrap();
        let thread = threads.iter().find(|t| t.id == t1).unwrap();
        assert!(thread.last_message_at >= m2.created_at);

        let hits = store.search_messages("Hello").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, m1.id);
        assert!(store.search_messages("xyz").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn messages_round_trip_with_stats() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let thread_id = Uuid::new_v4();
        store.create_thread(thread_id).await.unwrap();

        let user = Message::user(Uuid::new_v4(), thread_id, "Question");
        store.create_message(&user, None).await.unwrap();
        let mut reply = Message::new(
            Uuid::new_v4(),
            thread_id,
            Role::Assistant,
            vec![
                MessagePart::Reasoning { reasoning: "hmm".into() },
                MessagePart::Text { text: "Answer".into() },
            ],
        );
        reply.created_at = user.created_at + ChronoDuration::milliseconds(5);
        let stats = sample_stats("GPT-4o");
        store.create_message(&reply, Some(&stats)).await.unwrap();

        let loaded = store.get_messages_by_thread_id(thread_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], user);
        assert_eq!(loaded[1].content, "Answer");
        assert_eq!(loaded[1].role, Role::Assistant);
        assert_eq!(loaded[1].stats.as_ref(), Some(&stats));
        assert_eq!(loaded[1].parts, reply.parts);
    }

    #[tokio::test]
    async fn messages_are_ordered_and_scoped_to_their_thread() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.create_thread(a).await.unwrap();
        store.create_thread(b).await.unwrap();

        let base = now();
        for offset in [30, 10, 20] {
            let mut message = Message::user(Uuid::new_v4(), a, format!("a{}", offset));
            message.created_at = base + ChronoDuration::milliseconds(offset);
            store.create_message(&message, None).await.unwrap();
        }
        store
            .create_message(&Message::user(Uuid::new_v4(), b, "b"), None)
            .await
            .unwrap();

        let loaded = store.get_messages_by_thread_id(a).await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert!(loaded.iter().all(|m| m.thread_id == a));
        assert!(loaded.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(loaded[0].content, "a10");
    }

    #[tokio::test]
    async fn create_message_requires_existing_thread() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let missing = Uuid::new_v4();
        let err = store
            .create_message(&Message::user(Uuid::new_v4(), missing, "orphan"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ThreadNotFound(id) if id == missing));
        assert!(store.search_messages("orphan").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn threads_order_by_last_message() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let older = Uuid::new_v4();
        let newer = Uuid::new_v4();
        store.create_thread(older).await.unwrap();
        store.create_thread(newer).await.unwrap();

        let mut message = Message::user(Uuid::new_v4(), older, "bump");
        message.created_at = now() + ChronoDuration::seconds(60);
        store.create_message(&message, None).await.unwrap();

        let threads = store.get_threads().await.unwrap();
        assert_eq!(threads[0].id, older);
        assert_eq!(threads[1].id, newer);
    }

    #[tokio::test]
    async fn older_message_keeps_last_message_at() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let thread_id = Uuid::new_v4();
        store.create_thread(thread_id).await.unwrap();

        let mut recent = Message::user(Uuid::new_v4(), thread_id, "recent");
        recent.created_at = now() + ChronoDuration::seconds(60);
        store.create_message(&recent, None).await.unwrap();
        let mut late = Message::user(Uuid::new_v4(), thread_id, "imported");
        late.created_at = now() - ChronoDuration::days(1);
        store.create_message(&late, None).await.unwrap();

        let thread = store.get_thread(thread_id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_at, recent.created_at);
    }

    #[tokio::test]
    async fn delete_thread_cascades() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.create_thread(id).await.unwrap();
        let message = Message::user(Uuid::new_v4(), id, "to be removed");
        store.create_message(&message, None).await.unwrap();
        store.create_message_summary(id, message.id, "Removal").await.unwrap();

        store.delete_thread(id).await.unwrap();

        assert!(store.get_threads().await.unwrap().is_empty());
        assert!(store.get_messages_by_thread_id(id).await.unwrap().is_empty());
        assert!(store.get_message_summaries(id).await.unwrap().is_empty());
        // Unknown ids are a logged no-op.
        store.delete_thread(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn update_thread_ignores_unknown_ids() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.create_thread(id).await.unwrap();

        store.update_thread(id, "Rust lifetimes").await.unwrap();
        store.update_thread(Uuid::new_v4(), "ghost").await.unwrap();

        let threads = store.get_threads().await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].title, "Rust lifetimes");
    }

    #[tokio::test]
    async fn search_is_opt_in_and_escapes_wildcards() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.create_thread(id).await.unwrap();
        store
            .create_message(&Message::user(Uuid::new_v4(), id, "100% sure"), None)
            .await
            .unwrap();
        store
            .create_message(&Message::user(Uuid::new_v4(), id, "1000 times"), None)
            .await
            .unwrap();

        assert!(store.search_messages("").await.unwrap().is_empty());
        assert!(store.search_messages("   ").await.unwrap().is_empty());
        assert_eq!(store.search_messages("0%").await.unwrap().len(), 1);
        assert_eq!(store.search_messages("SURE").await.unwrap().len(), 1);
        assert_eq!(store.search_messages("100").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn attach_stats_updates_existing_message() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.create_thread(id).await.unwrap();
        let reply = assistant(id, "late stats");
        store.create_message(&reply, None).await.unwrap();

        let stats = sample_stats("o3");
        assert!(store.attach_stats(reply.id, &stats).await.unwrap());
        assert!(!store.attach_stats(Uuid::new_v4(), &stats).await.unwrap());

        let loaded = store.get_messages_by_thread_id(id).await.unwrap();
        assert_eq!(loaded[0].stats, Some(stats));
    }

    #[tokio::test]
    async fn summaries_are_listed_per_thread() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.create_thread(id).await.unwrap();
        let message = Message::user(Uuid::new_v4(), id, "first");
        store.create_message(&message, None).await.unwrap();

        let summary = store.create_message_summary(id, message.id, "First").await.unwrap();
        assert_eq!(store.get_message_summaries(id).await.unwrap(), vec![summary]);

        let err = store
            .create_message_summary(Uuid::new_v4(), message.id, "nope")
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::ThreadNotFound(_)));
    }

    #[tokio::test]
    async fn live_messages_see_every_commit() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let id = Uuid::new_v4();
        store.create_thread(id).await.unwrap();

        let mut live = store.live_messages(id).await.unwrap();
        assert!(live.current().is_empty());

        store
            .create_message(&Message::user(Uuid::new_v4(), id, "ping"), None)
            .await
            .unwrap();
        let messages = tokio::time::timeout(Duration::from_secs(1), live.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(messages.len(), 1);

        store.delete_thread(id).await.unwrap();
        let messages = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let value = live.changed().await.unwrap();
                if value.is_empty() {
                    return value;
                }
            }
        })
        .await
        .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn live_threads_follow_titles() {
        let store = StorageManager::open_in_memory().await.unwrap();
        let mut live = store.live_threads().await.unwrap();
        let id = Uuid::new_v4();
        store.create_thread(id).await.unwrap();
        store.update_thread(id, "Titled").await.unwrap();

        let threads = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let value = live.changed().await.unwrap();
                if value.first().map(|t| t.title.as_str()) == Some("Titled") {
                    return value;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(threads.len(), 1);
    }

    #[tokio::test]
    async fn settings_upsert() {
        let store = StorageManager::open_in_memory().await.unwrap();
        assert_eq!(store.load_setting("k").await.unwrap(), None);
        store.save_setting("k", "1").await.unwrap();
        store.save_setting("k", "2").await.unwrap();
        assert_eq!(store.load_setting("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn migration_keeps_version_one_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat0.sqlite");
        let thread_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();

        {
            let pool = StorageManager::connect_file(&path).await.unwrap();
            StorageManager::run_migrations(&pool, 1).await.unwrap();
            sqlx::query(
                "INSERT INTO threads (id, title, created_at, updated_at, last_message_at)
                 VALUES (?, 'Old', 1000, 1000, 1000)",
            )
            .bind(thread_id.to_string())
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query(
                "INSERT INTO messages (id, thread_id, parts, content, role, created_at)
                 VALUES (?, ?, '[{\"type\":\"text\",\"text\":\"legacy\"}]', 'legacy', 'user', 1000)",
            )
            .bind(message_id.to_string())
            .bind(thread_id.to_string())
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;
        }

        let store = StorageManager::open(&path).await.unwrap();
        let version: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(version, 2);

        let messages = store.get_messages_by_thread_id(thread_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, message_id);
        assert_eq!(messages[0].content, "legacy");
        assert_eq!(messages[0].stats, None);
    }
}
