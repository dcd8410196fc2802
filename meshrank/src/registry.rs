//! Node registry (`spec.md` §4.2). Reconciles partial, possibly
//! adversarial advert evidence into a trusted canonical node view.
//!
//! DESIGN NOTES §9: the source reconciles node objects by field-wise
//! overwrite; here that's a tagged `AdvertEvidence` update record reduced
//! into the canonical row via one SQL upsert built from explicit
//! per-field merge decisions, rather than a generic object-merge.

use rusqlite::{params, Connection, OptionalExtension};

const MAX_REJECTED_SAMPLE_BYTES: usize = 1024;
const MAX_NAME_CODEPOINTS: usize = 32;
const MIN_NAME_CODEPOINTS: usize = 2;
const MAX_NON_PRINTABLE_RATIO: f64 = 0.20;

#[derive(Clone, Debug, Default)]
pub struct AdvertEvidence {
    pub pub_raw: String,
    pub observer_id: String,
    pub heard_ms: i64,
    pub flags: Option<u8>,
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub legacy_is_repeater: Option<bool>,
    pub legacy_device_role: Option<i64>,
    pub legacy_node_type: Option<String>,
    pub legacy_type: Option<String>,
    pub raw_sample: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IngestAdvertOutcome {
    Accepted { pub_key: String, changed: bool },
    Rejected { reason: String },
}

struct ExistingNode {
    name: Option<String>,
    role: String,
    is_repeater: bool,
    hidden_on_map: bool,
    implausible_gps: bool,
    gps_manual: bool,
    lat: Option<f64>,
    lon: Option<f64>,
    last_reported_lat: Option<f64>,
    last_reported_lon: Option<f64>,
    last_advert_heard_ms: i64,
    raw_advert: Option<String>,
}

fn validate_pub(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(trimmed.to_uppercase())
}

/// Role + isRepeater, derived from `flags & 0x0F` when flags are present;
/// falling back to legacy hints only when flags are absent (`spec.md`
/// §4.2, point 3).
fn resolve_role(ev: &AdvertEvidence) -> Option<(&'static str, bool)> {
    if let Some(flags) = ev.flags {
        let role = crate::codec::NodeRole::from_flags_low_nibble(flags);
        return Some((role.as_str(), role.is_repeater()));
    }
    let is_repeater = ev.legacy_is_repeater == Some(true)
        || ev.legacy_device_role == Some(2)
        || ev.legacy_node_type.as_deref() == Some("repeater")
        || ev.legacy_type.as_deref() == Some("repeater");
    if is_repeater {
        return Some(("repeater", true));
    }
    None
}

enum NameOutcome {
    Valid(String),
    Invalid(&'static str),
    Absent,
}

fn validate_name(raw: &Option<String>) -> NameOutcome {
    let Some(raw) = raw else {
        return NameOutcome::Absent;
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return NameOutcome::Invalid("empty");
    }
    let codepoints: Vec<char> = trimmed.chars().collect();
    if codepoints.len() < MIN_NAME_CODEPOINTS {
        return NameOutcome::Invalid("too_short");
    }
    if codepoints.contains(&'\u{FFFD}') {
        return NameOutcome::Invalid("replacement_char");
    }
    let non_printable = codepoints
        .iter()
        .filter(|c| c.is_control() && **c != ' ')
        .count();
    if non_printable as f64 / codepoints.len() as f64 > MAX_NON_PRINTABLE_RATIO {
        return NameOutcome::Invalid("too_many_control_chars");
    }
    let truncated: String = codepoints.into_iter().take(MAX_NAME_CODEPOINTS).collect();
    NameOutcome::Valid(truncated)
}

enum GpsOutcome {
    Valid(f64, f64),
    Invalid(&'static str),
    Absent,
}

fn validate_gps(lat: Option<f64>, lon: Option<f64>) -> GpsOutcome {
    let (Some(lat), Some(lon)) = (lat, lon) else {
        return GpsOutcome::Absent;
    };
    if !lat.is_finite() || !lon.is_finite() {
        return GpsOutcome::Invalid("non_finite");
    }
    if lat == 0.0 && lon == 0.0 {
        return GpsOutcome::Invalid("zero_point");
    }
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return GpsOutcome::Invalid("out_of_range");
    }
    GpsOutcome::Valid(lat, lon)
}

fn truncate_sample(s: &str) -> String {
    if s.len() <= MAX_REJECTED_SAMPLE_BYTES {
        return s.to_string();
    }
    let mut end = MAX_REJECTED_SAMPLE_BYTES;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn record_rejection(
    conn: &Connection,
    pub_key: Option<&str>,
    observer_id: &str,
    heard_ms: i64,
    reason: &str,
    sample: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO rejected_adverts(pub, observer_id, heard_ms, reason, sample)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![pub_key, observer_id, heard_ms, reason, truncate_sample(sample)],
    )?;
    Ok(())
}

/// `ingestAdvert(observerReport) -> {accepted, changed} | Rejected{reason}`.
///
/// Each evidence field is applied independently where it validates; when
/// any field fails validation the overall call reports `Rejected` (and logs
/// exactly one `rejected_adverts` row) even though the fields that did
/// validate are still committed — `spec.md` §4.2 point 7 requires that
/// rejection logging never masks the data that *was* usable.
pub fn ingest_advert(conn: &Connection, ev: &AdvertEvidence) -> rusqlite::Result<IngestAdvertOutcome> {
    let Some(pub_key) = validate_pub(&ev.pub_raw) else {
        record_rejection(conn, None, &ev.observer_id, ev.heard_ms, "invalid_pub", &ev.raw_sample)?;
        return Ok(IngestAdvertOutcome::Rejected {
            reason: "invalid_pub".to_string(),
        });
    };

    let name_outcome = validate_name(&ev.name);
    let gps_outcome = validate_gps(ev.lat, ev.lon);
    let role_outcome = resolve_role(ev);

    let has_any_structure = ev.flags.is_some()
        || !matches!(name_outcome, NameOutcome::Absent)
        || matches!(gps_outcome, GpsOutcome::Valid(_, _));
    if !has_any_structure {
        record_rejection(
            conn,
            Some(&pub_key),
            &ev.observer_id,
            ev.heard_ms,
            "missing_structure",
            &ev.raw_sample,
        )?;
        return Ok(IngestAdvertOutcome::Rejected {
            reason: "missing_structure".to_string(),
        });
    }

    let existing: Option<ExistingNode> = conn
        .query_row(
            "SELECT name, role, is_repeater, hidden_on_map, implausible_gps, gps_manual,
                    lat, lon, last_reported_lat, last_reported_lon, last_advert_heard_ms, raw_advert
             FROM devices WHERE pub = ?1",
            params![pub_key],
            |row| {
                Ok(ExistingNode {
                    name: row.get(0)?,
                    role: row.get(1)?,
                    is_repeater: row.get::<_, i64>(2)? != 0,
                    hidden_on_map: row.get::<_, i64>(3)? != 0,
                    implausible_gps: row.get::<_, i64>(4)? != 0,
                    gps_manual: row.get::<_, i64>(5)? != 0,
                    lat: row.get(6)?,
                    lon: row.get(7)?,
                    last_reported_lat: row.get(8)?,
                    last_reported_lon: row.get(9)?,
                    last_advert_heard_ms: row.get(10)?,
                    raw_advert: row.get(11)?,
                })
            },
        )
        .optional()?;

    let (mut role, mut is_repeater) = existing
        .as_ref()
        .map(|e| (e.role.clone(), e.is_repeater))
        .unwrap_or_else(|| ("unknown".to_string(), false));
    if let Some((r, rep)) = role_outcome {
        role = r.to_string();
        is_repeater = rep;
    }

    let mut name = existing.as_ref().and_then(|e| e.name.clone());
    if let NameOutcome::Valid(n) = &name_outcome {
        name = Some(n.clone());
    }

    let (mut lat, mut lon, mut hidden_on_map, mut implausible_gps) = existing
        .as_ref()
        .map(|e| (e.lat, e.lon, e.hidden_on_map, e.implausible_gps))
        .unwrap_or((None, None, false, false));
    let (mut last_reported_lat, mut last_reported_lon) = existing
        .as_ref()
        .map(|e| (e.last_reported_lat, e.last_reported_lon))
        .unwrap_or((None, None));
    let gps_manual = existing.as_ref().map(|e| e.gps_manual).unwrap_or(false);

    if let GpsOutcome::Valid(new_lat, new_lon) = gps_outcome {
        let changed_from_previous =
            existing.is_none() || last_reported_lat != Some(new_lat) || last_reported_lon != Some(new_lon);
        if changed_from_previous {
            lat = Some(new_lat);
            lon = Some(new_lon);
            hidden_on_map = false;
            implausible_gps = false;
        } else if gps_manual {
            // unchanged report, manually-set canonical value wins — leave lat/lon untouched.
        } else {
            lat = Some(new_lat);
            lon = Some(new_lon);
        }
        last_reported_lat = Some(new_lat);
        last_reported_lon = Some(new_lon);
    }

    let previous_heard_ms = existing.as_ref().map(|e| e.last_advert_heard_ms).unwrap_or(0);
    let last_advert_heard_ms = previous_heard_ms.max(ev.heard_ms);

    let raw_advert = Some(ev.raw_sample.clone());
    let is_new = existing.is_none();

    let changed = match &existing {
        None => true,
        Some(e) => {
            e.name != name
                || e.role != role
                || e.is_repeater != is_repeater
                || e.hidden_on_map != hidden_on_map
                || e.implausible_gps != implausible_gps
                || e.lat != lat
                || e.lon != lon
                || e.last_advert_heard_ms != last_advert_heard_ms
                || e.raw_advert.as_deref() != Some(ev.raw_sample.as_str())
        }
    };

    conn.execute(
        "INSERT INTO devices(pub, name, role, is_repeater, hidden_on_map, implausible_gps,
                              gps_manual, lat, lon, last_reported_lat, last_reported_lon,
                              last_advert_heard_ms, last_seen, raw_advert)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(pub) DO UPDATE SET
            name = excluded.name,
            role = excluded.role,
            is_repeater = excluded.is_repeater,
            hidden_on_map = excluded.hidden_on_map,
            implausible_gps = excluded.implausible_gps,
            lat = excluded.lat,
            lon = excluded.lon,
            last_reported_lat = excluded.last_reported_lat,
            last_reported_lon = excluded.last_reported_lon,
            last_advert_heard_ms = excluded.last_advert_heard_ms,
            last_seen = excluded.last_seen,
            raw_advert = excluded.raw_advert",
        params![
            pub_key,
            name,
            role,
            is_repeater as i64,
            hidden_on_map as i64,
            implausible_gps as i64,
            gps_manual as i64,
            lat,
            lon,
            last_reported_lat,
            last_reported_lon,
            last_advert_heard_ms,
            ev.heard_ms,
            raw_advert,
        ],
    )?;
    let _ = is_new;

    let rejection_reason = match (&name_outcome, &gps_outcome) {
        (NameOutcome::Invalid(r), _) => Some(format!("invalid_name_{r}")),
        (_, GpsOutcome::Invalid(r)) => Some(r.to_string()),
        _ => None,
    };

    if let Some(reason) = rejection_reason {
        record_rejection(conn, Some(&pub_key), &ev.observer_id, ev.heard_ms, &reason, &ev.raw_sample)?;
        return Ok(IngestAdvertOutcome::Rejected { reason });
    }

    Ok(IngestAdvertOutcome::Accepted {
        pub_key,
        changed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::migrate;

    fn test_conn() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn
    }

    fn base_evidence() -> AdvertEvidence {
        AdvertEvidence {
            pub_raw: "ab".repeat(32),
            observer_id: "obs-1".to_string(),
            heard_ms: 1_000,
            flags: Some(0x92), // repeater + has_location + has_name
            name: Some("Heron Hill".to_string()),
            lat: Some(53.4),
            lon: Some(-2.2),
            raw_sample: "{}".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_well_formed_repeater_advert() {
        let conn = test_conn();
        let ev = base_evidence();
        let outcome = ingest_advert(&conn, &ev).unwrap();
        match outcome {
            IngestAdvertOutcome::Accepted { pub_key, changed } => {
                assert_eq!(pub_key, "AB".repeat(32));
                assert!(changed);
            }
            _ => panic!("expected accepted"),
        }
        let (role, is_repeater, heard): (String, i64, i64) = conn
            .query_row(
                "SELECT role, is_repeater, last_advert_heard_ms FROM devices WHERE pub = ?1",
                params!["AB".repeat(32)],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(role, "repeater");
        assert_eq!(is_repeater, 1);
        assert_eq!(heard, 1000);
    }

    #[test]
    fn duplicate_advert_is_idempotent() {
        let conn = test_conn();
        let ev = base_evidence();
        ingest_advert(&conn, &ev).unwrap();
        let outcome = ingest_advert(&conn, &ev).unwrap();
        match outcome {
            IngestAdvertOutcome::Accepted { changed, .. } => assert!(!changed),
            _ => panic!("expected accepted"),
        }
        let rejected_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rejected_adverts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rejected_count, 0);
    }

    #[test]
    fn rejects_invalid_pub() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.pub_raw = "not-hex".to_string();
        let outcome = ingest_advert(&conn, &ev).unwrap();
        assert_eq!(
            outcome,
            IngestAdvertOutcome::Rejected {
                reason: "invalid_pub".to_string()
            }
        );
    }

    #[test]
    fn rejects_missing_structure() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.flags = None;
        ev.name = None;
        ev.lat = None;
        ev.lon = None;
        let outcome = ingest_advert(&conn, &ev).unwrap();
        assert_eq!(
            outcome,
            IngestAdvertOutcome::Rejected {
                reason: "missing_structure".to_string()
            }
        );
    }

    #[test]
    fn name_exactly_32_codepoints_kept_verbatim() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.name = Some("A".repeat(32));
        let outcome = ingest_advert(&conn, &ev).unwrap();
        assert!(matches!(outcome, IngestAdvertOutcome::Accepted { .. }));
        let name: String = conn
            .query_row(
                "SELECT name FROM devices WHERE pub = ?1",
                params!["AB".repeat(32)],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(name.chars().count(), 32);
    }

    #[test]
    fn name_33_codepoints_truncated_to_32() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.name = Some("A".repeat(33));
        ingest_advert(&conn, &ev).unwrap();
        let name: String = conn
            .query_row(
                "SELECT name FROM devices WHERE pub = ?1",
                params!["AB".repeat(32)],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(name.chars().count(), 32);
    }

    #[test]
    fn name_with_too_many_control_chars_is_rejected_but_old_name_survives() {
        let conn = test_conn();
        let ev = base_evidence();
        ingest_advert(&conn, &ev).unwrap(); // establish valid name first

        let mut bad = base_evidence();
        bad.heard_ms = 2_000;
        bad.name = Some("\u{0001}\u{0002}\u{0003}ab".to_string());
        let outcome = ingest_advert(&conn, &bad).unwrap();
        assert_eq!(
            outcome,
            IngestAdvertOutcome::Rejected {
                reason: "invalid_name_too_many_control_chars".to_string()
            }
        );
        let name: String = conn
            .query_row(
                "SELECT name FROM devices WHERE pub = ?1",
                params!["AB".repeat(32)],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(name, "Heron Hill");
    }

    #[test]
    fn gps_zero_point_rejected() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.lat = Some(0.0);
        ev.lon = Some(0.0);
        let outcome = ingest_advert(&conn, &ev).unwrap();
        assert_eq!(
            outcome,
            IngestAdvertOutcome::Rejected {
                reason: "zero_point".to_string()
            }
        );
    }

    #[test]
    fn gps_boundary_90_180_accepted() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.lat = Some(90.0);
        ev.lon = Some(180.0);
        let outcome = ingest_advert(&conn, &ev).unwrap();
        assert!(matches!(outcome, IngestAdvertOutcome::Accepted { .. }));
    }

    #[test]
    fn gps_out_of_range_rejected() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.lat = Some(90.0001);
        ev.lon = Some(0.0);
        let outcome = ingest_advert(&conn, &ev).unwrap();
        assert_eq!(
            outcome,
            IngestAdvertOutcome::Rejected {
                reason: "out_of_range".to_string()
            }
        );
    }

    #[test]
    fn last_advert_heard_ms_is_monotonic() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.heard_ms = 5_000;
        ingest_advert(&conn, &ev).unwrap();
        ev.heard_ms = 1_000; // an older, late-arriving advert
        ingest_advert(&conn, &ev).unwrap();
        let heard: i64 = conn
            .query_row(
                "SELECT last_advert_heard_ms FROM devices WHERE pub = ?1",
                params!["AB".repeat(32)],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(heard, 5_000);
    }

    #[test]
    fn legacy_role_hints_only_honored_when_flags_absent() {
        let conn = test_conn();
        let mut ev = base_evidence();
        ev.flags = None;
        ev.legacy_node_type = Some("repeater".to_string());
        let outcome = ingest_advert(&conn, &ev).unwrap();
        assert!(matches!(outcome, IngestAdvertOutcome::Accepted { .. }));
        let role: String = conn
            .query_row(
                "SELECT role FROM devices WHERE pub = ?1",
                params!["AB".repeat(32)],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(role, "repeater");
    }
}
