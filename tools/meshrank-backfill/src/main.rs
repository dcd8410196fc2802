//! Offline replay of the ndjson observer-report archive through the
//! ingest pipeline. Grounded on the teacher's `sinyalist-loadtest` tool:
//! a `clap`-derived `Args`, an atomics-based `Counters` struct, and a
//! progress line printed every N records — but driving `process_report`
//! directly against a datastore instead of firing HTTP requests at one.

use clap::Parser;
use meshrank::archive::read_archive;
use meshrank::codec::KeyStore;
use meshrank::config::GeoscoreWeights;
use meshrank::ingest::IngestContext;
use meshrank::metrics::IngestMetrics;
use meshrank::store::Datastore;
use meshrank::{archive::Archive, process_report};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Parser)]
#[command(name = "meshrank-backfill")]
#[command(about = "Replays an ndjson observer-report archive through the ingest pipeline")]
struct Args {
    /// Path to the ndjson archive to replay
    #[arg(long)]
    archive: String,

    /// Datastore path to replay into (created if absent)
    #[arg(long, default_value = "meshrank-backfill.db")]
    db: String,

    /// Channel-keys JSON file, for decrypting group-text payloads
    #[arg(long)]
    keyfile: Option<String>,

    /// Print progress every N records
    #[arg(long, default_value_t = 1000)]
    progress_every: u64,
}

struct Counters {
    replayed: AtomicU64,
    malformed_lines: AtomicU64,
    pipeline_errors: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            replayed: AtomicU64::new(0),
            malformed_lines: AtomicU64::new(0),
            pipeline_errors: AtomicU64::new(0),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "meshrank_backfill=info".into()))
        .init();

    let args = Args::parse();

    println!("=== meshrank-backfill ===");
    println!("Archive: {}", args.archive);
    println!("Datastore: {}", args.db);
    println!();

    let contents = std::fs::read_to_string(&args.archive)?;
    let records = read_archive(&contents);
    println!("Parsed {} ndjson lines", records.len());

    let key_store = match &args.keyfile {
        Some(path) => KeyStore::build_from_json(&std::fs::read_to_string(path)?),
        None => KeyStore::default(),
    };

    let datastore = Arc::new(Datastore::open(&args.db)?);
    let archive = Archive::new(format!("{}.backfill-replay.ndjson", args.db));
    let ctx = IngestContext::new(
        datastore,
        archive,
        Arc::new(IngestMetrics::new()),
        Arc::new(RwLock::new(key_store)),
        GeoscoreWeights::default(),
    );

    let counters = Counters::new();
    let start = Instant::now();

    for record in records {
        let raw = match record {
            Ok(archived) => match serde_json::to_string(&archived.payload) {
                Ok(json) => json,
                Err(e) => {
                    counters.malformed_lines.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "archive_record_reserialize_failed");
                    continue;
                }
            },
            Err(e) => {
                counters.malformed_lines.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "archive_line_parse_failed");
                continue;
            }
        };

        if let Err(e) = process_report(&ctx, &raw).await {
            counters.pipeline_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "backfill_process_report_failed");
        }

        let replayed = counters.replayed.fetch_add(1, Ordering::Relaxed) + 1;
        if replayed % args.progress_every == 0 {
            let elapsed = start.elapsed().as_secs_f64();
            println!(
                "  [{:.1}s] replayed={} malformed={} errors={} ({:.0} rec/s)",
                elapsed,
                replayed,
                counters.malformed_lines.load(Ordering::Relaxed),
                counters.pipeline_errors.load(Ordering::Relaxed),
                replayed as f64 / elapsed.max(0.001),
            );
        }
    }

    let elapsed = start.elapsed();
    println!("\n=== Results ===");
    println!("Duration:  {:.2}s", elapsed.as_secs_f64());
    println!("Replayed:  {}", counters.replayed.load(Ordering::Relaxed));
    println!("Malformed: {}", counters.malformed_lines.load(Ordering::Relaxed));
    println!("Errors:    {}", counters.pipeline_errors.load(Ordering::Relaxed));

    Ok(())
}
