//! Telemetry and analytics pipeline for a low-power long-range mesh radio
//! network. Re-exports every component so `meshrank-server` and the
//! `meshrank-backfill` tool can both drive the same ingest path.

pub mod archive;
pub mod codec;
pub mod config;
pub mod error;
pub mod ingest;
pub mod messages;
pub mod metrics;
pub mod observers;
pub mod query;
pub mod registry;
pub mod route;
pub mod store;

pub use config::Config;
pub use error::{MeshrankError, Result};
pub use ingest::{process_report, IngestContext};
pub use store::Datastore;
