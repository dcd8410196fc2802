//! Datastore-facing glue around the pure Viterbi engine (`spec.md` §4.5,
//! §4.6): loads candidates and edge priors from the devices/route_edges
//! tables, runs inference, and persists the result to `geoscore_routes`.
//! Kept separate from `viterbi.rs` the same way `registry.rs` keeps SQL
//! out of pure validation logic.

use super::{infer_route, Candidate, RouteResult};
use crate::config::GeoscoreWeights;
use rusqlite::{params, Connection};

const MAX_CANDIDATES_PER_TOKEN: i64 = 25;

/// Devices whose public key starts with the given path-byte token,
/// freshest first, bounded to the top 25 (`spec.md` §4.5 truncation
/// rule applies again here so the SQL layer never hands Viterbi more
/// than it will keep).
fn candidates_for_token(conn: &Connection, token: &str, now_ms: i64) -> rusqlite::Result<Vec<Candidate>> {
    let mut stmt = conn.prepare(
        "SELECT pub, name, lat, lon, last_advert_heard_ms FROM devices
         WHERE substr(pub, 1, 2) = ?1
         ORDER BY last_advert_heard_ms DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![token.to_uppercase(), MAX_CANDIDATES_PER_TOKEN], |row| {
        let lat: Option<f64> = row.get(2)?;
        let lon: Option<f64> = row.get(3)?;
        Ok(Candidate {
            pub_key: row.get(0)?,
            name: row.get(1)?,
            gps: lat.zip(lon),
            last_seen_ms: row.get(4)?,
        })
    })?;
    let _ = now_ms;
    rows.collect()
}

fn edge_prior(conn: &Connection, prev_pub: &str, next_pub: &str) -> u32 {
    conn.query_row(
        "SELECT transition_count FROM route_edges WHERE prev_pub = ?1 AND next_pub = ?2",
        params![prev_pub, next_pub],
        |row| row.get::<_, i64>(0),
    )
    .unwrap_or(0)
    .max(0) as u32
}

/// Bumps the observed-transition counter for every adjacent pair in a
/// resolved route, so future inferences can use `edgePrior`.
fn record_edges(conn: &Connection, resolved_path: &[String]) -> rusqlite::Result<()> {
    for pair in resolved_path.windows(2) {
        conn.execute(
            "INSERT INTO route_edges(prev_pub, next_pub, transition_count) VALUES (?1, ?2, 1)
             ON CONFLICT(prev_pub, next_pub) DO UPDATE SET transition_count = transition_count + 1",
            params![pair[0], pair[1]],
        )?;
    }
    Ok(())
}

fn persist_route(conn: &Connection, msg_key: &str, result: &RouteResult) -> rusqlite::Result<()> {
    let path_json = serde_json::to_string(&result.path).unwrap_or_default();
    let inferred_pub_json = serde_json::to_string(&result.inferred_pub).unwrap_or_default();
    let hop_confidence_json = serde_json::to_string(&result.hop_confidence).unwrap_or_default();
    let diagnostics_json = serde_json::to_string(&result.diagnostics).unwrap_or_default();

    conn.execute(
        "INSERT INTO geoscore_routes(msg_key, ts_ms, observer_id, path_json, inferred_pub_json,
                                       hop_confidence_json, route_confidence, unresolved,
                                       teleport_max_km, diagnostics_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(msg_key) DO UPDATE SET
            ts_ms = excluded.ts_ms,
            observer_id = excluded.observer_id,
            path_json = excluded.path_json,
            inferred_pub_json = excluded.inferred_pub_json,
            hop_confidence_json = excluded.hop_confidence_json,
            route_confidence = excluded.route_confidence,
            unresolved = excluded.unresolved,
            teleport_max_km = excluded.teleport_max_km,
            diagnostics_json = excluded.diagnostics_json",
        params![
            msg_key,
            result.ts_ms,
            result.observer_id,
            path_json,
            inferred_pub_json,
            hop_confidence_json,
            result.route_confidence,
            result.unresolved as i64,
            result.teleport_max_km,
            diagnostics_json,
        ],
    )?;

    if !result.unresolved {
        let resolved_path: Vec<String> = result.inferred_pub.iter().filter_map(|p| p.clone()).collect();
        if resolved_path.len() == result.inferred_pub.len() {
            record_edges(conn, &resolved_path)?;
        }
    }
    Ok(())
}

/// Scores every message whose path has not yet been scored (no matching
/// `geoscore_routes` row) or whose observer report is newer than the last
/// score, using the observer's own GPS as `observerHome` when known.
/// Returns the number of routes written.
pub fn score_pending_messages(conn: &Connection, weights: &GeoscoreWeights, now_ms: i64) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(
        "SELECT m.message_hash, m.ts, m.path_json
         FROM messages m
         LEFT JOIN geoscore_routes g ON g.msg_key = m.message_hash
         WHERE m.path_length > 0 AND (g.msg_key IS NULL OR g.ts_ms < m.ts)",
    )?;
    let pending: Vec<(String, i64, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let mut scored = 0usize;
    for (message_hash, ts, path_json) in pending {
        let tokens: Vec<String> = serde_json::from_str(&path_json).unwrap_or_default();
        if tokens.is_empty() {
            continue;
        }
        let observer_id = conn
            .query_row(
                "SELECT observer_id FROM message_observers WHERE message_hash = ?1 ORDER BY ts ASC LIMIT 1",
                params![message_hash],
                |row| row.get::<_, String>(0),
            )
            .unwrap_or_default();
        let observer_home: Option<(f64, f64)> = conn
            .query_row(
                "SELECT lat, lon FROM observers WHERE observer_id = ?1",
                params![observer_id],
                |row| {
                    let lat: Option<f64> = row.get(0)?;
                    let lon: Option<f64> = row.get(1)?;
                    Ok(lat.zip(lon))
                },
            )
            .unwrap_or(None);

        let result = infer_route(
            &tokens,
            &observer_id,
            ts,
            now_ms,
            observer_home,
            |token| candidates_for_token(conn, token, now_ms).unwrap_or_default(),
            |prev, next| edge_prior(conn, prev, next),
            weights,
        );
        if let Some(result) = result {
            persist_route(conn, &message_hash, &result)?;
            scored += 1;
        }
    }
    Ok(scored)
}
