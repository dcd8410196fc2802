//! Datastore (`spec.md` §4.6). Owns the single writer connection (mutex-
//! serialized) and hands out independent read-only connections for the
//! query API. Business logic (node reconciliation, message upserts, route
//! persistence) lives in sibling modules as plain functions over
//! `&rusqlite::Connection` so they're unit-testable against an in-memory
//! database; `Datastore` itself is just the async plumbing around that
//! single writer, per DESIGN NOTES §9 ("pass [globals] via an explicit
//! context structure threaded through component entry points").

pub mod schema;

use crate::error::{with_backoff, MeshrankError};
use rusqlite::{Connection, OpenFlags};
use std::sync::{Arc, Mutex};

pub struct Datastore {
    writer: Arc<Mutex<Connection>>,
    db_path: String,
}

impl Datastore {
    /// Opens (creating if absent) the datastore, enables WAL journaling and
    /// `synchronous=NORMAL` (`spec.md` §6), and runs migrations under a
    /// transaction.
    pub fn open(db_path: &str) -> Result<Self, MeshrankError> {
        let mut conn = Connection::open(db_path)
            .map_err(|e| MeshrankError::Fatal(format!("cannot open datastore {db_path}: {e}")))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| MeshrankError::Fatal(format!("cannot set WAL: {e}")))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| MeshrankError::Fatal(format!("cannot set synchronous: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(|e| MeshrankError::Fatal(format!("cannot set foreign_keys: {e}")))?;
        schema::migrate(&mut conn)
            .map_err(|e| MeshrankError::Fatal(format!("migration failed: {e}")))?;

        Ok(Self {
            writer: Arc::new(Mutex::new(conn)),
            db_path: db_path.to_string(),
        })
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// Opens an independent read-only connection, isolated from the
    /// writer's transactions beyond SQLite's normal WAL reader semantics.
    pub fn read_only_connection(&self) -> Result<Connection, MeshrankError> {
        Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(MeshrankError::Transient)
    }

    /// Runs `f` against the single writer connection on a blocking thread,
    /// holding the mutex only for the duration of the call (`spec.md` §5:
    /// "the datastore mutex wraps only the prepared-statement invocation").
    pub async fn with_writer<F, T>(&self, f: F) -> Result<T, MeshrankError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let conn = writer.lock().expect("writer mutex poisoned");
            f(&conn)
        })
        .await
        .map_err(|e| MeshrankError::Fatal(format!("writer task panicked: {e}")))?
        .map_err(MeshrankError::Transient)
    }

    /// Same as `with_writer`, but retries a transient failure with
    /// exponential backoff before giving up (`spec.md` §7: downstream-
    /// transient errors are "retried with exponential backoff up to 3
    /// attempts"). `f` must be reusable across attempts, so it takes `&self`
    /// rather than consuming state the way a one-shot `with_writer` closure
    /// can.
    pub async fn with_writer_retried<F, T>(&self, f: F) -> Result<T, MeshrankError>
    where
        F: Fn(&Connection) -> rusqlite::Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        with_backoff(|| {
            let f = f.clone();
            self.with_writer(move |conn| f(conn))
        })
        .await
    }
}
