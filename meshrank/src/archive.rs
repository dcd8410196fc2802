//! Ndjson durability archive (`spec.md` §6). Mirrors the teacher's
//! `PacketRecord`-to-ndjson persistence, but the archive is meshrank's
//! primary durability story rather than a crash backstop: every report is
//! archived before it touches the datastore, so a transient database
//! failure never loses the record.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

/// One observer report as received on the wire, recognized fields only
/// (`spec.md` §6); unknown fields are dropped at this boundary and never
/// reach the archive or the pipeline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ObserverReportPayload {
    #[serde(rename = "payloadHex")]
    pub payload_hex: String,
    #[serde(rename = "observerId")]
    pub observer_id: String,
    #[serde(rename = "observerName", skip_serializing_if = "Option::is_none")]
    pub observer_name: Option<String>,
    #[serde(rename = "observerPub", skip_serializing_if = "Option::is_none")]
    pub observer_pub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc: Option<i64>,
    #[serde(rename = "frameHash", skip_serializing_if = "Option::is_none")]
    pub frame_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_len: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gps: Option<ObserverGps>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ObserverGps {
    pub lat: f64,
    pub lon: f64,
}

/// The on-disk archived record: the payload plus `archivedAt`, the
/// authoritative heard-time for cross-observer replays (`spec.md` §4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchivedReport {
    #[serde(flatten)]
    pub payload: ObserverReportPayload,
    #[serde(rename = "archivedAt")]
    pub archived_at: String,
}

/// Parses one wire payload JSON object, normalizing `payloadHex` to
/// uppercase and dropping unrecognized fields (`serde`'s default
/// deny-nothing behavior already ignores them; we only rewrite the one
/// field the spec calls out as normalized).
pub fn parse_report(raw: &str) -> Result<ObserverReportPayload, serde_json::Error> {
    let mut payload: ObserverReportPayload = serde_json::from_str(raw)?;
    payload.payload_hex = payload.payload_hex.to_uppercase();
    Ok(payload)
}

/// Heard-time in epoch milliseconds: `archivedAt` is authoritative for
/// replays (`spec.md` §4.4), falling back to "now" for live ingest.
pub fn heard_at_ms(archived_at: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc3339(archived_at)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

pub struct Archive {
    path: String,
}

impl Archive {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// Appends one archived record as a single ndjson line, stamping
    /// `archivedAt` with the current time.
    pub async fn append(&self, payload: &ObserverReportPayload) -> std::io::Result<ArchivedReport> {
        let record = ArchivedReport {
            payload: payload.clone(),
            archived_at: Utc::now().to_rfc3339(),
        };
        let mut line = serde_json::to_string(&record).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(record)
    }
}

/// Reads every archived record from an ndjson file for the backfill tool,
/// tolerating blank lines but surfacing malformed ones as individual
/// errors rather than aborting the whole replay.
pub fn read_archive(contents: &str) -> Vec<Result<ArchivedReport, serde_json::Error>> {
    contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str::<Value>(l).and_then(|_| serde_json::from_str(l)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_report_uppercases_payload_hex() {
        let raw = r#"{"payloadHex":"abcd","observerId":"obs-1"}"#;
        let report = parse_report(raw).unwrap();
        assert_eq!(report.payload_hex, "ABCD");
    }

    #[test]
    fn parse_report_ignores_unknown_fields() {
        let raw = r#"{"payloadHex":"AB","observerId":"obs-1","someFutureField":42}"#;
        let report = parse_report(raw).unwrap();
        assert_eq!(report.observer_id, "obs-1");
    }

    #[tokio::test]
    async fn append_then_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.ndjson");
        let archive = Archive::new(path.to_str().unwrap());
        let payload = ObserverReportPayload {
            payload_hex: "AB".to_string(),
            observer_id: "obs-1".to_string(),
            ..Default::default()
        };
        archive.append(&payload).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let records = read_archive(&contents);
        assert_eq!(records.len(), 1);
        let record = records.into_iter().next().unwrap().unwrap();
        assert_eq!(record.payload.payload_hex, "AB");
        assert!(!record.archived_at.is_empty());
    }

    #[test]
    fn parse_report_retains_route_and_path_fields() {
        let raw = r#"{
            "payloadHex": "AB",
            "observerId": "obs-1",
            "route": "direct",
            "path": ["11", "A3"],
            "len": 42,
            "payload_len": 20,
            "packet_type": "GroupText"
        }"#;
        let report = parse_report(raw).unwrap();
        assert_eq!(report.route, Some(Value::String("direct".to_string())));
        assert_eq!(report.len, Some(42));
        assert_eq!(report.payload_len, Some(20));
        assert_eq!(report.packet_type, Some("GroupText".to_string()));

        let serialized = serde_json::to_string(&report).unwrap();
        assert!(serialized.contains("\"route\""));
        assert!(serialized.contains("\"path\""));
    }

    #[test]
    fn heard_at_ms_parses_rfc3339() {
        let ms = heard_at_ms("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(ms, 1_704_067_200_000);
    }
}
