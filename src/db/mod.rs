use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use serenity::model::id::{ChannelId, GuildId, MessageId, UserId};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::model::{GuildState, MessageRef, Occurrence, RepostEntry, UrlHolder};

pub mod schema;

use schema::{ALL_TABLES, SCHEMA_SQL, SCHEMA_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to move old store aside: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where a guild's records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    pub fn for_guild(dir: &Path, guild_id: GuildId) -> Self {
        StoreLocation::File(dir.join(format!("{}.sqlite3", guild_id)))
    }
}

/// Values seeded into a freshly created (or reset) store.
#[derive(Debug, Clone)]
pub struct StoreDefaults {
    pub marker_emoji: String,
    pub url_blacklist: Vec<String>,
}

/// What `GuildStore::open` had to do to produce a usable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Created,
    Loaded,
    Rebuilt {
        found_version: i64,
        backup: Option<PathBuf>,
    },
}

/// A single mutation buffered for `GuildStore::commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    SetHolder(UrlHolder),
    AppendRepost(RepostEntry),
    AddMember(UserId),
    RemoveMember(UserId),
}

/// Everything one processed occurrence wants to write, applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    changes: Vec<Change>,
    watermark: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, change: Change) {
        self.changes.push(change);
    }

    /// Requests the watermark move to at least `ts`. Repeated calls keep the max.
    pub fn advance_watermark(&mut self, ts: DateTime<Utc>) {
        self.watermark = Some(self.watermark.map_or(ts, |current| current.max(ts)));
    }

    /// Drops any watermark advance; the changes are still applied on commit.
    pub fn hold_watermark(&mut self) {
        self.watermark = None;
    }

    pub fn merge(&mut self, other: Batch) {
        self.changes.extend(other.changes);
        if let Some(ts) = other.watermark {
            self.advance_watermark(ts);
        }
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.watermark.is_none()
    }
}

/// Query over repost history. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RepostFilter {
    pub url: Option<String>,
    pub message_id: Option<MessageId>,
    pub channel_id: Option<ChannelId>,
    pub author_id: Option<UserId>,
}

impl RepostFilter {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_message(mut self, message: MessageRef) -> Self {
        self.message_id = Some(message.message_id);
        self.channel_id = Some(message.channel_id);
        self
    }

    pub fn with_channel(mut self, channel_id: ChannelId) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn with_author(mut self, author_id: UserId) -> Self {
        self.author_id = Some(author_id);
        self
    }

    fn where_clause(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut sql = String::from(" WHERE 1 = 1");
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(url) = &self.url {
            sql.push_str(" AND url = ?");
            params.push(Box::new(url.clone()));
        }
        if let Some(id) = self.message_id {
            sql.push_str(" AND message_id = ?");
            params.push(Box::new(sql_id(id.get())));
        }
        if let Some(id) = self.channel_id {
            sql.push_str(" AND channel_id = ?");
            params.push(Box::new(sql_id(id.get())));
        }
        if let Some(id) = self.author_id {
            sql.push_str(" AND author_id = ?");
            params.push(Box::new(sql_id(id.get())));
        }
        (sql, params)
    }
}

/// Persistent repost state for one guild, backed by its own SQLite database.
pub struct GuildStore {
    guild_id: GuildId,
    conn: Connection,
    defaults: StoreDefaults,
}

impl GuildStore {
    pub fn open(
        guild_id: GuildId,
        location: &StoreLocation,
        defaults: StoreDefaults,
    ) -> StoreResult<(Self, OpenOutcome)> {
        let conn = open_connection(location)?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let has_state = conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'guild_state'")?
            .exists([])?;

        let (conn, outcome) = match (version, has_state) {
            (v, true) if v == SCHEMA_VERSION => (conn, OpenOutcome::Loaded),
            (0, false) => (conn, OpenOutcome::Created),
            (found_version, _) => {
                let (conn, backup) = rebuild(conn, location, guild_id, found_version)?;
                (
                    conn,
                    OpenOutcome::Rebuilt {
                        found_version,
                        backup,
                    },
                )
            }
        };

        let mut store = Self {
            guild_id,
            conn,
            defaults,
        };
        if outcome != OpenOutcome::Loaded {
            store.initialize()?;
        }
        info!("Store for guild {}: {:?}", guild_id, outcome);
        Ok((store, outcome))
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    fn initialize(&mut self) -> StoreResult<()> {
        let now = Utc::now();
        let tx = self.conn.transaction()?;
        tx.execute_batch(SCHEMA_SQL)?;
        tx.execute(
            "INSERT OR REPLACE INTO guild_state (id, active, marker_emoji, watermark, first_seen)
             VALUES (1, TRUE, ?1, ?2, ?2)",
            params![self.defaults.marker_emoji, now.timestamp_millis()],
        )?;
        for url in &self.defaults.url_blacklist {
            tx.execute("INSERT OR IGNORE INTO url_blacklist (url) VALUES (?1)", [url])?;
        }
        tx.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
        tx.commit()?;
        debug!("Store for guild {} initialized at schema v{}", self.guild_id, SCHEMA_VERSION);
        Ok(())
    }

    // --- Guild state ---

    pub fn state(&self) -> StoreResult<GuildState> {
        let (active, marker_emoji, watermark, first_seen) = self.conn.query_row(
            "SELECT active, marker_emoji, watermark, first_seen FROM guild_state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, bool>(0)?,
                    row.get::<_, String>(1)?,
                    timestamp_at(row, 2)?,
                    timestamp_at(row, 3)?,
                ))
            },
        )?;
        Ok(GuildState {
            active,
            marker_emoji,
            watermark,
            first_seen,
        })
    }

    pub fn is_active(&self) -> StoreResult<bool> {
        Ok(self.state()?.active)
    }

    pub fn set_active(&self, active: bool) -> StoreResult<()> {
        self.conn
            .execute("UPDATE guild_state SET active = ?1 WHERE id = 1", [active])?;
        Ok(())
    }

    pub fn marker_emoji(&self) -> StoreResult<String> {
        Ok(self.state()?.marker_emoji)
    }

    pub fn set_marker_emoji(&self, emoji: &str) -> StoreResult<()> {
        self.conn
            .execute("UPDATE guild_state SET marker_emoji = ?1 WHERE id = 1", [emoji])?;
        Ok(())
    }

    pub fn watermark(&self) -> StoreResult<DateTime<Utc>> {
        Ok(self.state()?.watermark)
    }

    /// Moves the watermark forward to `ts`; an older `ts` leaves it untouched.
    pub fn advance_watermark(&self, ts: DateTime<Utc>) -> StoreResult<DateTime<Utc>> {
        advance_watermark_in(&self.conn, ts)?;
        self.watermark()
    }

    /// Records that a scan started at `ts`, pulling `first_seen` back if needed.
    pub fn note_scan_start(&self, ts: DateTime<Utc>) -> StoreResult<()> {
        self.conn.execute(
            "UPDATE guild_state SET first_seen = MIN(first_seen, ?1) WHERE id = 1",
            [ts.timestamp_millis()],
        )?;
        Ok(())
    }

    // --- Blacklists ---

    pub fn channel_blacklist(&self) -> StoreResult<BTreeSet<ChannelId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT channel_id FROM channel_blacklist")?;
        let rows = stmt.query_map([], |row| Ok(ChannelId::new(id_at(row, 0)?)))?;
        let mut channels = BTreeSet::new();
        for row in rows {
            channels.insert(row?);
        }
        Ok(channels)
    }

    pub fn is_channel_blacklisted(&self, channel_id: ChannelId) -> StoreResult<bool> {
        Ok(self
            .conn
            .prepare("SELECT 1 FROM channel_blacklist WHERE channel_id = ?1")?
            .exists([sql_id(channel_id.get())])?)
    }

    /// Returns false if the channel was already blacklisted.
    pub fn blacklist_channel(&self, channel_id: ChannelId) -> StoreResult<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO channel_blacklist (channel_id) VALUES (?1)",
            [sql_id(channel_id.get())],
        )?;
        Ok(inserted > 0)
    }

    pub fn unblacklist_channel(&self, channel_id: ChannelId) -> StoreResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM channel_blacklist WHERE channel_id = ?1",
            [sql_id(channel_id.get())],
        )?;
        Ok(removed > 0)
    }

    pub fn url_blacklist(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT url FROM url_blacklist ORDER BY url")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut urls = Vec::new();
        for row in rows {
            urls.push(row?);
        }
        Ok(urls)
    }

    pub fn is_url_blacklisted(&self, url: &str) -> StoreResult<bool> {
        Ok(self
            .conn
            .prepare("SELECT 1 FROM url_blacklist WHERE url = ?1")?
            .exists([url])?)
    }

    pub fn blacklist_url(&self, url: &str) -> StoreResult<bool> {
        let inserted = self
            .conn
            .execute("INSERT OR IGNORE INTO url_blacklist (url) VALUES (?1)", [url])?;
        Ok(inserted > 0)
    }

    pub fn unblacklist_url(&self, url: &str) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM url_blacklist WHERE url = ?1", [url])?;
        Ok(removed > 0)
    }

    // --- Members ---

    pub fn members(&self) -> StoreResult<BTreeSet<UserId>> {
        let mut stmt = self.conn.prepare("SELECT member_id FROM members")?;
        let rows = stmt.query_map([], |row| Ok(UserId::new(id_at(row, 0)?)))?;
        let mut members = BTreeSet::new();
        for row in rows {
            members.insert(row?);
        }
        Ok(members)
    }

    pub fn has_member(&self, member_id: UserId) -> StoreResult<bool> {
        Ok(self
            .conn
            .prepare("SELECT 1 FROM members WHERE member_id = ?1")?
            .exists([sql_id(member_id.get())])?)
    }

    pub fn add_member(&self, member_id: UserId) -> StoreResult<bool> {
        Ok(insert_member(&self.conn, member_id)? > 0)
    }

    pub fn remove_member(&self, member_id: UserId) -> StoreResult<bool> {
        Ok(delete_member(&self.conn, member_id)? > 0)
    }

    // --- URL holders ---

    pub fn holder(&self, url: &str) -> StoreResult<Option<UrlHolder>> {
        let holder = self
            .conn
            .query_row(
                "SELECT message_id, channel_id, author_id, timestamp FROM url_holders WHERE url = ?1",
                [url],
                |row| occurrence_at(row, 0),
            )
            .optional()?;
        Ok(holder.map(|holder| UrlHolder {
            url: url.to_string(),
            holder,
        }))
    }

    pub fn set_holder(&self, holder: &UrlHolder) -> StoreResult<()> {
        upsert_holder(&self.conn, holder)?;
        Ok(())
    }

    pub fn remove_holder(&self, url: &str) -> StoreResult<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM url_holders WHERE url = ?1", [url])?;
        Ok(removed > 0)
    }

    pub fn holder_count(&self) -> StoreResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM url_holders", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn holder_count_for(&self, author_id: UserId) -> StoreResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM url_holders WHERE author_id = ?1",
            [sql_id(author_id.get())],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // --- Repost history ---

    /// Returns false if an entry with the same (url, message, channel) exists.
    pub fn append_repost(&self, entry: &RepostEntry) -> StoreResult<bool> {
        Ok(insert_repost(&self.conn, entry)? > 0)
    }

    pub fn reposts(&self, filter: &RepostFilter) -> StoreResult<Vec<RepostEntry>> {
        let (clause, params) = filter.where_clause();
        let sql = format!(
            "SELECT url, message_id, channel_id, author_id, timestamp FROM reposts{} ORDER BY timestamp, message_id",
            clause
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let params_slice: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(&params_slice[..], |row| {
            Ok(RepostEntry {
                url: row.get(0)?,
                occurrence: occurrence_at(row, 1)?,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    pub fn has_repost(&self, url: &str, message: MessageRef) -> StoreResult<bool> {
        Ok(self
            .conn
            .prepare("SELECT 1 FROM reposts WHERE url = ?1 AND message_id = ?2 AND channel_id = ?3")?
            .exists(params![
                url,
                sql_id(message.message_id.get()),
                sql_id(message.channel_id.get())
            ])?)
    }

    pub fn remove_reposts(&self, filter: &RepostFilter) -> StoreResult<usize> {
        let (clause, params) = filter.where_clause();
        let params_slice: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let removed = self
            .conn
            .execute(&format!("DELETE FROM reposts{}", clause), &params_slice[..])?;
        Ok(removed)
    }

    /// Repost counts per author, highest first.
    pub fn repost_leaderboard(&self, limit: usize) -> StoreResult<Vec<(UserId, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT author_id, COUNT(*) AS reposts FROM reposts
             GROUP BY author_id ORDER BY reposts DESC, author_id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok((UserId::new(id_at(row, 0)?), row.get::<_, i64>(1)? as u64))
        })?;
        let mut board = Vec::new();
        for row in rows {
            board.push(row?);
        }
        Ok(board)
    }

    // --- Commit / maintenance ---

    /// Applies every change in `batch` plus its watermark advance in one transaction.
    pub fn commit(&mut self, batch: &Batch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for change in batch.changes() {
            match change {
                Change::SetHolder(holder) => {
                    upsert_holder(&tx, holder)?;
                }
                Change::AppendRepost(entry) => {
                    if insert_repost(&tx, entry)? == 0 {
                        debug!(
                            "Repost of {} by message {} already recorded",
                            entry.url, entry.occurrence.message_id
                        );
                    }
                }
                Change::AddMember(member_id) => {
                    insert_member(&tx, *member_id)?;
                }
                Change::RemoveMember(member_id) => {
                    delete_member(&tx, *member_id)?;
                }
            }
        }
        if let Some(ts) = batch.watermark() {
            advance_watermark_in(&tx, ts)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Clears URL history and blacklists and restores default settings.
    /// Membership is kept.
    pub fn reset(&mut self) -> StoreResult<()> {
        {
            let tx = self.conn.transaction()?;
            tx.execute_batch(
                "DELETE FROM url_holders;
                 DELETE FROM reposts;
                 DELETE FROM channel_blacklist;
                 DELETE FROM url_blacklist;",
            )?;
            tx.commit()?;
        }
        self.initialize()?;
        warn!("Store for guild {} was reset", self.guild_id);
        Ok(())
    }

    /// Forces everything committed so far into the main database file.
    pub fn flush(&self) -> StoreResult<()> {
        let (busy, frames, checkpointed): (i64, i64, i64) = self.conn.query_row(
            "PRAGMA wal_checkpoint(TRUNCATE)",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        debug!(
            "Flushed guild {} (busy={}, log={}, checkpointed={})",
            self.guild_id, busy, frames, checkpointed
        );
        Ok(())
    }
}

fn open_connection(location: &StoreLocation) -> StoreResult<Connection> {
    match location {
        StoreLocation::Memory => Ok(Connection::open_in_memory()?),
        StoreLocation::File(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            let conn = Connection::open(path)?;
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            debug!("Opened {} (journal_mode={})", path.display(), mode);
            Ok(conn)
        }
    }
}

/// Explicit schema migration: the old store is set aside (file stores are renamed to a
/// `.bak` next to the original) and an empty one takes its place. History comes back
/// through reconciliation.
fn rebuild(
    conn: Connection,
    location: &StoreLocation,
    guild_id: GuildId,
    found_version: i64,
) -> StoreResult<(Connection, Option<PathBuf>)> {
    warn!(
        "Store for guild {} has schema v{}, expected v{}; rebuilding",
        guild_id, found_version, SCHEMA_VERSION
    );
    match location {
        StoreLocation::Memory => {
            for table in ALL_TABLES {
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", table))?;
            }
            Ok((conn, None))
        }
        StoreLocation::File(path) => {
            conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            let backup = path.with_extension(format!("sqlite3.v{}.bak", found_version));
            std::fs::rename(path, &backup)?;
            for suffix in ["-wal", "-shm"] {
                let sidecar = PathBuf::from(format!("{}{}", path.display(), suffix));
                if sidecar.exists() {
                    std::fs::remove_file(&sidecar)?;
                }
            }
            warn!("Old store for guild {} kept at {}", guild_id, backup.display());
            Ok((open_connection(location)?, Some(backup)))
        }
    }
}

fn advance_watermark_in(conn: &Connection, ts: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE guild_state SET watermark = MAX(watermark, ?1) WHERE id = 1",
        [ts.timestamp_millis()],
    )
}

fn upsert_holder(conn: &Connection, holder: &UrlHolder) -> rusqlite::Result<usize> {
    let occ = &holder.holder;
    conn.execute(
        "INSERT INTO url_holders (url, message_id, channel_id, author_id, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(url) DO UPDATE SET message_id = ?2, channel_id = ?3, author_id = ?4, timestamp = ?5",
        params![
            holder.url,
            sql_id(occ.message_id.get()),
            sql_id(occ.channel_id.get()),
            sql_id(occ.author_id.get()),
            occ.timestamp.timestamp_millis()
        ],
    )
}

fn insert_repost(conn: &Connection, entry: &RepostEntry) -> rusqlite::Result<usize> {
    let occ = &entry.occurrence;
    conn.execute(
        "INSERT OR IGNORE INTO reposts (url, message_id, channel_id, author_id, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            entry.url,
            sql_id(occ.message_id.get()),
            sql_id(occ.channel_id.get()),
            sql_id(occ.author_id.get()),
            occ.timestamp.timestamp_millis()
        ],
    )
}

fn insert_member(conn: &Connection, member_id: UserId) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO members (member_id) VALUES (?1)",
        [sql_id(member_id.get())],
    )
}

fn delete_member(conn: &Connection, member_id: UserId) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM members WHERE member_id = ?1",
        [sql_id(member_id.get())],
    )
}

/// Snowflakes stay below 2^63, so they round-trip through SQLite's signed integers.
fn sql_id(id: u64) -> i64 {
    id as i64
}

fn id_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let raw: i64 = row.get(idx)?;
    if raw <= 0 {
        return Err(rusqlite::Error::IntegralValueOutOfRange(idx, raw));
    }
    Ok(raw as u64)
}

fn timestamp_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

/// Reads `message_id, channel_id, author_id, timestamp` starting at column `start`.
fn occurrence_at(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<Occurrence> {
    Ok(Occurrence {
        message_id: MessageId::new(id_at(row, start)?),
        channel_id: ChannelId::new(id_at(row, start + 1)?),
        author_id: UserId::new(id_at(row, start + 2)?),
        timestamp: timestamp_at(row, start + 3)?,
    })
}
