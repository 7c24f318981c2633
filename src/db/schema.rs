/// Bumped whenever the table layout below changes. A store tagged with any other
/// version is moved aside and rebuilt on open.
pub const SCHEMA_VERSION: i64 = 2;

pub const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS guild_state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        active BOOLEAN NOT NULL DEFAULT TRUE,
        marker_emoji TEXT NOT NULL,
        watermark INTEGER NOT NULL,
        first_seen INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS channel_blacklist (
        channel_id INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS url_blacklist (
        url TEXT PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS members (
        member_id INTEGER PRIMARY KEY
    );

    CREATE TABLE IF NOT EXISTS url_holders (
        url TEXT PRIMARY KEY,
        message_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_url_holders_author ON url_holders (author_id);

    CREATE TABLE IF NOT EXISTS reposts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        url TEXT NOT NULL,
        message_id INTEGER NOT NULL,
        channel_id INTEGER NOT NULL,
        author_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        UNIQUE (url, message_id, channel_id)
    );
    CREATE INDEX IF NOT EXISTS idx_reposts_author ON reposts (author_id);
    CREATE INDEX IF NOT EXISTS idx_reposts_message ON reposts (message_id, channel_id);
";

/// Tables dropped when an in-memory store is rebuilt in place.
pub const ALL_TABLES: &[&str] = &[
    "guild_state",
    "channel_blacklist",
    "url_blacklist",
    "members",
    "url_holders",
    "reposts",
];
