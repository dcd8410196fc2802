//! Error taxonomy for the pipeline.
//!
//! `spec.md` §7 names four error classes: malformed-input, validation-
//! rejection, downstream-transient, and configuration-fatal. `MeshrankError`
//! gives each a distinct variant so call sites match on class instead of
//! string-sniffing, as DESIGN NOTES §9 asks for explicit structure over the
//! source's catch-all error strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshrankError {
    /// Bad hex, unknown payload type, empty payload — dropped silently at
    /// the codec boundary, counted in metrics, never logged at `error`.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Node-registry validation rejection; carries the reason code written
    /// to `rejected_adverts`.
    #[error("advert rejected: {0}")]
    Rejected(String),

    /// Database busy, disk full, transient I/O — retried with backoff.
    #[error("transient failure: {0}")]
    Transient(#[from] rusqlite::Error),

    /// Cannot open datastore, missing topic, bad config — fail fast at
    /// startup.
    #[error("fatal configuration error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, MeshrankError>;

/// Retries a fallible operation with exponential backoff, per `spec.md` §7:
/// "retried with exponential backoff up to 3 attempts". Base delay 200ms,
/// doubling each attempt.
pub async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const MAX_ATTEMPTS: u32 = 3;
    const BASE_DELAY_MS: u64 = 200;

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e @ MeshrankError::Transient(_)) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(e);
                }
                let delay = BASE_DELAY_MS * (1 << (attempt - 1));
                tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
