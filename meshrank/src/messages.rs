//! Message store (`spec.md` §4.3): per-message record with reconciling
//! upsert, and a many-to-many observer-witness table.

use rusqlite::{params, Connection, OptionalExtension};

#[derive(Clone, Debug, Default)]
pub struct MessageEvidence {
    pub message_hash: String,
    pub frame_hash: Option<String>,
    pub channel_name: Option<String>,
    pub channel_hash: Option<String>,
    pub sender: Option<String>,
    pub sender_pub: Option<String>,
    pub body: Option<String>,
    pub ts: i64,
    pub path: Vec<String>,
    pub repeats: i64,
}

/// `upsertMessage(record)`. ON-CONFLICT reconciliation: `ts` takes the
/// greater value; text fields prefer the existing non-null value; path
/// length and repeat count take the max; the path itself is replaced only
/// when the incoming path is strictly longer (more information).
pub fn upsert_message(conn: &Connection, ev: &MessageEvidence) -> rusqlite::Result<()> {
    let path_json = serde_json::to_string(&ev.path).unwrap_or_else(|_| "[]".to_string());
    let path_text = ev.path.join(",");
    let path_length = ev.path.len() as i64;

    conn.execute(
        "INSERT INTO messages(message_hash, frame_hash, channel_name, channel_hash, sender,
                               sender_pub, body, ts, path_json, path_text, path_length, repeats)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(message_hash) DO UPDATE SET
            ts = MAX(ts, excluded.ts),
            frame_hash = COALESCE(frame_hash, excluded.frame_hash),
            channel_name = COALESCE(channel_name, excluded.channel_name),
            channel_hash = COALESCE(channel_hash, excluded.channel_hash),
            sender = COALESCE(sender, excluded.sender),
            sender_pub = COALESCE(sender_pub, excluded.sender_pub),
            body = COALESCE(body, excluded.body),
            path_json = CASE WHEN excluded.path_length > path_length THEN excluded.path_json ELSE path_json END,
            path_text = CASE WHEN excluded.path_length > path_length THEN excluded.path_text ELSE path_text END,
            path_length = MAX(path_length, excluded.path_length),
            repeats = MAX(repeats, excluded.repeats)",
        params![
            ev.message_hash,
            ev.frame_hash,
            ev.channel_name,
            ev.channel_hash,
            ev.sender,
            ev.sender_pub,
            ev.body,
            ev.ts,
            path_json,
            path_text,
            path_length,
            ev.repeats,
        ],
    )?;
    Ok(())
}

#[derive(Clone, Debug, Default)]
pub struct WitnessEvidence {
    pub message_hash: String,
    pub observer_id: String,
    pub observer_name: Option<String>,
    pub ts: i64,
    pub path: Vec<String>,
}

/// `upsertObserverWitness`, keyed by the composite (message_hash,
/// observer_id) pair: max timestamp, richer observer name, max path
/// length with the longer path preferred.
pub fn upsert_observer_witness(conn: &Connection, ev: &WitnessEvidence) -> rusqlite::Result<()> {
    let path_json = serde_json::to_string(&ev.path).unwrap_or_else(|_| "[]".to_string());
    let path_length = ev.path.len() as i64;

    let existing_name: Option<Option<String>> = conn
        .query_row(
            "SELECT observer_name FROM message_observers WHERE message_hash = ?1 AND observer_id = ?2",
            params![ev.message_hash, ev.observer_id],
            |r| r.get(0),
        )
        .optional()?;
    let richer_name = match existing_name {
        Some(existing) => {
            let existing_len = existing.as_deref().map(str::len).unwrap_or(0);
            let incoming_len = ev.observer_name.as_deref().map(str::len).unwrap_or(0);
            if incoming_len > existing_len {
                ev.observer_name.clone()
            } else {
                existing
            }
        }
        None => ev.observer_name.clone(),
    };

    conn.execute(
        "INSERT INTO message_observers(message_hash, observer_id, ts, observer_name, path_json, path_length)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(message_hash, observer_id) DO UPDATE SET
            ts = MAX(ts, excluded.ts),
            observer_name = ?4,
            path_json = CASE WHEN excluded.path_length > path_length THEN excluded.path_json ELSE path_json END,
            path_length = MAX(path_length, excluded.path_length)",
        params![
            ev.message_hash,
            ev.observer_id,
            ev.ts,
            richer_name,
            path_json,
            path_length,
        ],
    )?;
    Ok(())
}
