//! Ingest pipeline (`spec.md` §4.4): subscribes to observer reports over
//! MQTT and runs each one through the five-step pipeline. The worker
//! loop's `Disconnected → Connecting → Subscribed → Running →
//! Reconnecting → Subscribed` state machine and its mpsc-channel split
//! between intake and durable persistence are grounded on the teacher's
//! `persist_worker`/`persist_tx` split in `sinyalist-ingest` — here the
//! archive append plays the role the teacher's ndjson flush played, but
//! happens inline and first, since meshrank's durability contract
//! requires the archive to hold the record *before* any datastore write
//! is attempted.

use crate::archive::{self, Archive, ArchivedReport};
use crate::codec::{self, DecodedPayload, KeyStore};
use crate::config::{Config, GeoscoreWeights};
use crate::error::{MeshrankError, Result};
use crate::messages::{self, MessageEvidence, WitnessEvidence};
use crate::metrics::IngestMetrics;
use crate::observers::{self, ObserverReport};
use crate::registry::{self, AdvertEvidence};
use crate::store::Datastore;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{info, instrument, warn};

const RF_PACKETS_CAP: i64 = 50_000;
const RF_PRUNE_EVERY: u64 = 500;

pub struct IngestContext {
    pub datastore: Arc<Datastore>,
    pub archive: Archive,
    pub metrics: Arc<IngestMetrics>,
    pub key_store: Arc<RwLock<KeyStore>>,
    pub weights: GeoscoreWeights,
    rf_packet_inserts: AtomicU64,
}

impl IngestContext {
    pub fn new(
        datastore: Arc<Datastore>,
        archive: Archive,
        metrics: Arc<IngestMetrics>,
        key_store: Arc<RwLock<KeyStore>>,
        weights: GeoscoreWeights,
    ) -> Self {
        Self {
            datastore,
            archive,
            metrics,
            key_store,
            weights,
            rf_packet_inserts: AtomicU64::new(0),
        }
    }

    /// Inserts the frame into the `rf_packets` rolling table and, every
    /// 500th insert, prunes rows below the 50,000-row cap (`spec.md`
    /// §4.4).
    async fn record_rf_packet(&self, ts: i64, observer_id: &str, payload_hex: &str) -> Result<()> {
        let observer_id = observer_id.to_string();
        let payload_hex = payload_hex.to_string();
        self.datastore
            .with_writer_retried(move |conn| {
                conn.execute(
                    "INSERT INTO rf_packets(ts, observer_id, payload_hex) VALUES (?1, ?2, ?3)",
                    rusqlite::params![ts, observer_id, payload_hex],
                )
            })
            .await?;

        let inserts = self.rf_packet_inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % RF_PRUNE_EVERY == 0 {
            self.datastore
                .with_writer_retried(|conn| {
                    conn.execute(
                        "DELETE FROM rf_packets WHERE id NOT IN
                         (SELECT id FROM rf_packets ORDER BY id DESC LIMIT ?1)",
                        rusqlite::params![RF_PACKETS_CAP],
                    )
                })
                .await?;
        }
        Ok(())
    }
}

/// Runs one observer report through the five-step pipeline in `spec.md`
/// §4.4. Malformed input (bad JSON, bad hex, unknown payload type) is
/// dropped silently and counted, per the error taxonomy in `spec.md` §7 —
/// it never propagates past this function.
#[instrument(skip(ctx, raw_json), fields(bytes = raw_json.len()))]
pub async fn process_report(ctx: &IngestContext, raw_json: &str) -> Result<()> {
    IngestMetrics::inc(&ctx.metrics.reports_received);

    let payload = match archive::parse_report(raw_json) {
        Ok(p) => p,
        Err(e) => {
            IngestMetrics::inc(&ctx.metrics.malformed);
            warn!(error = %e, "observer_report_malformed");
            return Ok(());
        }
    };

    // Step 1: archive first, so a downstream datastore failure never loses the record.
    let archived: ArchivedReport = match ctx.archive.append(&payload).await {
        Ok(a) => a,
        Err(e) => {
            IngestMetrics::inc(&ctx.metrics.archive_write_failures);
            warn!(error = %e, "archive_append_failed");
            ArchivedReport {
                payload: payload.clone(),
                archived_at: chrono::Utc::now().to_rfc3339(),
            }
        }
    };
    let heard_ms = archive::heard_at_ms(&archived.archived_at)
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let key_store_snapshot = ctx.key_store.read().await.clone();
    let decode_result = codec::decode(&payload.payload_hex, Some(&key_store_snapshot));

    let decoded = match decode_result {
        Ok(d) => d,
        Err(e) => {
            IngestMetrics::inc(&ctx.metrics.malformed);
            warn!(error = %e, "frame_decode_failed");
            return Ok(());
        }
    };

    // Step 2: advert payloads feed the node registry.
    if let DecodedPayload::Advert(advert) = &decoded.decoded {
        let ev = AdvertEvidence {
            pub_raw: advert.pub_key.clone(),
            observer_id: payload.observer_id.clone(),
            heard_ms,
            flags: Some(advert.flags_raw),
            name: advert.name.clone(),
            lat: advert.lat,
            lon: advert.lon,
            raw_sample: payload.payload_hex.clone(),
            ..Default::default()
        };
        let outcome = ctx
            .datastore
            .with_writer_retried(move |conn| registry::ingest_advert(conn, &ev))
            .await?;
        match outcome {
            registry::IngestAdvertOutcome::Accepted { .. } => {
                IngestMetrics::inc(&ctx.metrics.adverts_accepted)
            }
            registry::IngestAdvertOutcome::Rejected { reason } => {
                IngestMetrics::inc(&ctx.metrics.adverts_rejected);
                warn!(reason = %reason, "advert_rejected");
            }
        }
    }

    // Step 3: observer liveness is recorded for every successfully decoded frame.
    let observer_report = ObserverReport {
        observer_id: payload.observer_id.clone(),
        name: payload.observer_name.clone(),
        seen_ms: heard_ms,
        lat: payload.gps.map(|g| g.lat),
        lon: payload.gps.map(|g| g.lon),
    };
    ctx.datastore
        .with_writer_retried(move |conn| observers::record_observer_seen(conn, &observer_report))
        .await?;

    // Step 4: the raw frame always lands in the rolling rf_packets table.
    ctx.record_rf_packet(heard_ms, &payload.observer_id, &payload.payload_hex)
        .await?;

    // Step 5: group-text payloads feed the message store.
    if let DecodedPayload::GroupText(group_text) = &decoded.decoded {
        if let Some(decrypted) = &group_text.decrypted {
            let channel_name = u8::from_str_radix(&group_text.channel_hash, 16)
                .ok()
                .and_then(|b| key_store_snapshot.lookup(b))
                .map(|entry| entry.name.clone());

            let msg_ev = MessageEvidence {
                message_hash: decoded.message_hash.clone(),
                frame_hash: payload.frame_hash.clone(),
                channel_name,
                channel_hash: Some(group_text.channel_hash.clone()),
                sender: Some(decrypted.sender.clone()),
                sender_pub: None,
                body: Some(decrypted.message.clone()),
                ts: heard_ms,
                path: decoded.path.clone(),
                repeats: 0,
            };
            ctx.datastore
                .with_writer_retried(move |conn| messages::upsert_message(conn, &msg_ev))
                .await?;

            let witness_ev = WitnessEvidence {
                message_hash: decoded.message_hash.clone(),
                observer_id: payload.observer_id.clone(),
                observer_name: payload.observer_name.clone(),
                ts: heard_ms,
                path: decoded.path.clone(),
            };
            ctx.datastore
                .with_writer_retried(move |conn| messages::upsert_observer_witness(conn, &witness_ev))
                .await?;
            IngestMetrics::inc(&ctx.metrics.messages_upserted);
        }
    }

    Ok(())
}

fn parse_broker_addr(url: &str) -> (String, u16) {
    let without_scheme = url.split("://").last().unwrap_or(url);
    match without_scheme.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(1883)),
        None => (without_scheme.to_string(), 1883),
    }
}

/// The MQTT ingest worker. Runs until `shutdown` is set, reconnecting on
/// a fixed interval (`MESHRANK_MQTT_RECONNECT_SECS`) whenever the
/// connection drops — the `Disconnected → Connecting → Subscribed →
/// Running → Reconnecting` cycle of `spec.md` §4.4. In-memory derived
/// state (the key-store snapshot, the rf_packets insert counter) lives on
/// `IngestContext` and survives every reconnect.
pub async fn run_ingest_worker(config: Config, ctx: Arc<IngestContext>, mut shutdown: watch::Receiver<bool>) {
    let (host, port) = parse_broker_addr(&config.mqtt_url);

    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut mqtt_options = MqttOptions::new("meshrank-ingest", &host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        if let (Some(user), Some(pass)) = (&config.mqtt_user, &config.mqtt_pass) {
            mqtt_options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt_options, 256);
        if let Err(e) = client.subscribe(&config.mqtt_topic, QoS::AtMostOnce).await {
            warn!(error = %e, "mqtt_subscribe_failed");
            tokio::time::sleep(Duration::from_secs(config.mqtt_reconnect_secs)).await;
            continue;
        }
        info!(topic = %config.mqtt_topic, "ingest_subscribed");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            let raw = String::from_utf8_lossy(&publish.payload).to_string();
                            if let Err(e) = process_report(&ctx, &raw).await {
                                if matches!(e, MeshrankError::Transient(_)) {
                                    IngestMetrics::inc(&ctx.metrics.datastore_transient_errors);
                                }
                                warn!(error = %e, "ingest_process_failed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(error = %e, "mqtt_connection_error");
                            break;
                        }
                    }
                }
            }
        }

        if *shutdown.borrow() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(config.mqtt_reconnect_secs)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    fn test_ctx() -> (Arc<Datastore>, IngestContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meshrank.db");
        let datastore = Arc::new(Datastore::open(db_path.to_str().unwrap()).unwrap());
        let archive = Archive::new(dir.path().join("archive.ndjson").to_str().unwrap());
        let ctx = IngestContext::new(
            datastore.clone(),
            archive,
            Arc::new(IngestMetrics::new()),
            Arc::new(RwLock::new(KeyStore::default())),
            GeoscoreWeights::default(),
        );
        (datastore, ctx, dir)
    }

    fn build_advert_frame(flags: u8, lat_e7: i32, lon_e7: i32, name: &str) -> Vec<u8> {
        let mut buf = vec![0x00u8, 0]; // payload_type=advert, route=flood, path_len=0
        buf.extend_from_slice(&[0xAB; 32]);
        buf.extend_from_slice(&42u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 64]);
        buf.push(flags);
        if flags & 0x10 != 0 {
            buf.extend_from_slice(&lat_e7.to_le_bytes());
            buf.extend_from_slice(&lon_e7.to_le_bytes());
        }
        if flags & 0x80 != 0 {
            buf.extend_from_slice(name.as_bytes());
        }
        buf
    }

    #[tokio::test]
    async fn advert_report_populates_node_registry() {
        let (datastore, ctx, _dir) = test_ctx();
        let frame = build_advert_frame(0x92, 534_000_000, -22_000_000, "Heron Hill");
        let payload_hex = hex::encode_upper(&frame);
        let raw = format!(
            r#"{{"payloadHex":"{payload_hex}","observerId":"obs-1","observerName":"Tower A"}}"#
        );

        process_report(&ctx, &raw).await.unwrap();

        let conn = datastore.read_only_connection().unwrap();
        let (role, is_repeater): (String, i64) = conn
            .query_row(
                "SELECT role, is_repeater FROM devices WHERE pub = ?1",
                rusqlite::params!["AB".repeat(32)],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(role, "repeater");
        assert_eq!(is_repeater, 1);

        let observer_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observers WHERE observer_id = 'obs-1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(observer_count, 1);

        let rf_count: i64 = conn.query_row("SELECT COUNT(*) FROM rf_packets", [], |r| r.get(0)).unwrap();
        assert_eq!(rf_count, 1);
    }

    #[tokio::test]
    async fn duplicate_report_does_not_duplicate_node_row() {
        let (datastore, ctx, _dir) = test_ctx();
        let frame = build_advert_frame(0x92, 534_000_000, -22_000_000, "Heron Hill");
        let payload_hex = hex::encode_upper(&frame);
        let raw = format!(r#"{{"payloadHex":"{payload_hex}","observerId":"obs-1"}}"#);

        process_report(&ctx, &raw).await.unwrap();
        process_report(&ctx, &raw).await.unwrap();

        let conn = datastore.read_only_connection().unwrap();
        let node_count: i64 = conn.query_row("SELECT COUNT(*) FROM devices", [], |r| r.get(0)).unwrap();
        assert_eq!(node_count, 1);
        let rejected_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM rejected_adverts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rejected_count, 0);
    }

    #[tokio::test]
    async fn malformed_json_is_dropped_without_error() {
        let (_datastore, ctx, _dir) = test_ctx();
        let result = process_report(&ctx, "not json at all").await;
        assert!(result.is_ok());
    }

    #[test]
    fn parse_broker_addr_strips_scheme_and_splits_port() {
        assert_eq!(parse_broker_addr("tcp://broker.local:1883"), ("broker.local".to_string(), 1883));
        assert_eq!(parse_broker_addr("broker.local"), ("broker.local".to_string(), 1883));
    }
}
