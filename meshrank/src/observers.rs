//! Observer registry (`spec.md` §4.2/§4.6): per-observer liveness,
//! position, and packet counters.

use rusqlite::{params, Connection};

#[derive(Clone, Debug, Default)]
pub struct ObserverReport {
    pub observer_id: String,
    pub name: Option<String>,
    pub seen_ms: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Records an observer's liveness: creates the row on first sighting,
/// otherwise bumps `last_seen`/`packet_count` and refreshes GPS/name when
/// supplied.
pub fn record_observer_seen(conn: &Connection, report: &ObserverReport) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO observers(observer_id, name, first_seen, last_seen, packet_count, lat, lon, updated_at)
         VALUES (?1, ?2, ?3, ?3, 1, ?4, ?5, ?3)
         ON CONFLICT(observer_id) DO UPDATE SET
            name = COALESCE(?2, name),
            last_seen = MAX(last_seen, ?3),
            packet_count = packet_count + 1,
            lat = COALESCE(?4, lat),
            lon = COALESCE(?5, lon),
            updated_at = ?3",
        params![report.observer_id, report.name, report.seen_ms, report.lat, report.lon],
    )?;
    Ok(())
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct RankedObserver {
    pub id: String,
    pub name: Option<String>,
    pub packets: i64,
    pub last_seen: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// `getRankedObservers(windowHours=24)`: observers seen within the window,
/// ranked by packet count descending.
pub fn ranked_observers(
    conn: &Connection,
    now_ms: i64,
    window_hours: i64,
) -> rusqlite::Result<Vec<RankedObserver>> {
    let window_ms = window_hours * 3_600_000;
    let cutoff = now_ms - window_ms;
    let mut stmt = conn.prepare(
        "SELECT observer_id, name, packet_count, last_seen, lat, lon
         FROM observers WHERE last_seen >= ?1 ORDER BY packet_count DESC",
    )?;
    let rows = stmt.query_map(params![cutoff], |row| {
        Ok(RankedObserver {
            id: row.get(0)?,
            name: row.get(1)?,
            packets: row.get(2)?,
            last_seen: row.get(3)?,
            lat: row.get(4)?,
            lon: row.get(5)?,
        })
    })?;
    rows.collect()
}
