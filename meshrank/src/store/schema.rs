//! Table definitions and additive migrations (`spec.md` §4.6/§6).
//!
//! Migration mechanism: a fixed list of `(version, sql)` steps applied in
//! order inside one startup transaction. `CREATE TABLE IF NOT EXISTS`
//! covers the base shape; `ADD COLUMN` steps are skipped when the column
//! already exists, probed via `PRAGMA table_info`, so re-running the
//! migration on an already-migrated database is a no-op (idempotent, per
//! `spec.md` §8).

use rusqlite::{Connection, Result as SqlResult};

const BASE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS devices (
        pub TEXT PRIMARY KEY,
        name TEXT,
        role TEXT NOT NULL DEFAULT 'unknown',
        is_repeater INTEGER NOT NULL DEFAULT 0,
        is_observer INTEGER NOT NULL DEFAULT 0,
        hidden_on_map INTEGER NOT NULL DEFAULT 0,
        implausible_gps INTEGER NOT NULL DEFAULT 0,
        gps_manual INTEGER NOT NULL DEFAULT 0,
        lat REAL,
        lon REAL,
        last_reported_lat REAL,
        last_reported_lon REAL,
        last_advert_heard_ms INTEGER NOT NULL DEFAULT 0,
        last_seen INTEGER NOT NULL DEFAULT 0,
        raw_advert BLOB
    )",
    "CREATE INDEX IF NOT EXISTS idx_devices_last_advert ON devices(last_advert_heard_ms)",
    "CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen)",
    "CREATE TABLE IF NOT EXISTS messages (
        message_hash TEXT PRIMARY KEY,
        frame_hash TEXT,
        channel_name TEXT,
        channel_hash TEXT,
        sender TEXT,
        sender_pub TEXT,
        body TEXT,
        ts INTEGER NOT NULL,
        path_json TEXT,
        path_text TEXT,
        path_length INTEGER NOT NULL DEFAULT 0,
        repeats INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel_name, ts)",
    "CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts)",
    "CREATE INDEX IF NOT EXISTS idx_messages_sender_channel_ts ON messages(sender, channel_name, ts)",
    "CREATE TABLE IF NOT EXISTS message_observers (
        message_hash TEXT NOT NULL,
        observer_id TEXT NOT NULL,
        ts INTEGER NOT NULL,
        observer_name TEXT,
        path_json TEXT,
        path_length INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (message_hash, observer_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_message_observers_hash ON message_observers(message_hash)",
    "CREATE TABLE IF NOT EXISTS observers (
        observer_id TEXT PRIMARY KEY,
        name TEXT,
        first_seen INTEGER NOT NULL,
        last_seen INTEGER NOT NULL,
        packet_count INTEGER NOT NULL DEFAULT 0,
        lat REAL,
        lon REAL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_observers_last_seen ON observers(last_seen)",
    "CREATE TABLE IF NOT EXISTS rf_packets (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        observer_id TEXT,
        payload_hex TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_rf_packets_ts ON rf_packets(ts)",
    "CREATE TABLE IF NOT EXISTS geoscore_routes (
        msg_key TEXT PRIMARY KEY,
        ts_ms INTEGER NOT NULL,
        observer_id TEXT,
        path_json TEXT,
        inferred_pub_json TEXT,
        hop_confidence_json TEXT,
        route_confidence REAL,
        unresolved INTEGER NOT NULL DEFAULT 1,
        teleport_max_km REAL,
        diagnostics_json TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_geoscore_routes_ts ON geoscore_routes(ts_ms)",
    "CREATE TABLE IF NOT EXISTS rejected_adverts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pub TEXT,
        observer_id TEXT,
        heard_ms INTEGER NOT NULL,
        reason TEXT NOT NULL,
        sample TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_rejected_adverts_heard ON rejected_adverts(heard_ms)",
    "CREATE TABLE IF NOT EXISTS ingest_metrics (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS route_edges (
        prev_pub TEXT NOT NULL,
        next_pub TEXT NOT NULL,
        transition_count INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (prev_pub, next_pub)
    )",
];

/// `(column, add_column_sql)` steps applied after the base tables exist,
/// each skipped if the column is already present.
const ADDITIVE_COLUMNS: &[(&str, &str, &str)] = &[
    // (table, column, full ADD COLUMN statement)
];

fn table_has_column(conn: &Connection, table: &str, column: &str) -> SqlResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn migrate(conn: &mut Connection) -> SqlResult<()> {
    let tx = conn.transaction()?;
    for stmt in BASE_TABLES {
        tx.execute(stmt, [])?;
    }
    for (table, column, add_sql) in ADDITIVE_COLUMNS {
        if !table_has_column(&tx, table, column)? {
            tx.execute(add_sql, [])?;
        }
    }
    tx.execute(
        "INSERT INTO schema_meta(key, value) VALUES ('schema_version', '1')
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [],
    )?;
    tx.commit()?;
    Ok(())
}
