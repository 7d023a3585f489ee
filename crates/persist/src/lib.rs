//! Jobsync persistence: SQLite store for the last-applied state of managed Jobs.
//! Small and synchronous; callers are not latency sensitive.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use jobsync_core::ResourceId;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rows kept per address; older ones are pruned on write.
pub const HISTORY_DEPTH: usize = 3;

/// What was last applied under one caller-chosen address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub address: String,
    pub id: ResourceId,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// Last-applied document as YAML.
    pub document: String,
    /// Unix millis.
    pub ts: i64,
}

impl StateRecord {
    pub fn new(address: impl Into<String>, id: ResourceId, uid: Option<String>, resource_version: Option<String>, document: impl Into<String>) -> Self {
        Self { address: address.into(), id, uid, resource_version, document: document.into(), ts: now_ts() }
    }

    pub fn applied_at(&self) -> String {
        chrono::DateTime::from_timestamp_millis(self.ts).map(|t| t.to_rfc3339()).unwrap_or_else(|| self.ts.to_string())
    }
}

pub trait StateStore {
    fn put(&self, rec: &StateRecord) -> Result<()>;
    /// Newest first, at most `limit` (default [`HISTORY_DEPTH`]).
    fn history(&self, address: &str, limit: Option<usize>) -> Result<Vec<StateRecord>>;
    fn latest(&self, address: &str) -> Result<Option<StateRecord>> {
        Ok(self.history(address, Some(1))?.into_iter().next())
    }
    /// Drop every row for `address`; returns how many were removed.
    fn forget(&self, address: &str) -> Result<usize>;
    fn addresses(&self) -> Result<Vec<String>>;
}

pub struct SqliteStateStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStateStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("JOBSYNC_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS managed_jobs (
                address TEXT NOT NULL,
                id      TEXT NOT NULL,
                uid     TEXT,
                rv      TEXT,
                ts      INTEGER NOT NULL,
                doc     BLOB NOT NULL
            )",
            [],
        )
        .context("creating managed_jobs table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_managed_jobs_addr_ts ON managed_jobs(address, ts DESC)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "state store open");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("state store lock poisoned"))
    }
}

impl StateStore for SqliteStateStore {
    fn put(&self, rec: &StateRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO managed_jobs(address, id, uid, rv, ts, doc) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (&rec.address, rec.id.encode(), &rec.uid, &rec.resource_version, rec.ts, maybe_compress(&rec.document)),
        )?;
        tx.execute(
            "DELETE FROM managed_jobs
             WHERE address = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM managed_jobs WHERE address = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&rec.address, HISTORY_DEPTH as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn history(&self, address: &str, limit: Option<usize>) -> Result<Vec<StateRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(HISTORY_DEPTH);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, uid, rv, ts, doc FROM managed_jobs WHERE address = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((address, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw_id: String = row.get(0)?;
            let id = ResourceId::decode(&raw_id).with_context(|| format!("stored identifier for {}", address))?;
            let doc: Vec<u8> = row.get(4)?;
            out.push(StateRecord {
                address: address.to_string(),
                id,
                uid: row.get(1)?,
                resource_version: row.get(2)?,
                ts: row.get(3)?,
                document: maybe_decompress(&doc),
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn forget(&self, address: &str) -> Result<usize> {
        let n = self.conn()?.execute("DELETE FROM managed_jobs WHERE address = ?1", [address])?;
        counter!("persist_forget_total", 1u64);
        Ok(n)
    }

    fn addresses(&self) -> Result<Vec<String>> {
        let db = self.conn()?;
        let mut stmt = db.prepare("SELECT DISTINCT address FROM managed_jobs ORDER BY address")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".jobsync");
        let _ = std::fs::create_dir_all(&p);
        p.push("state.db");
        return p.to_string_lossy().to_string();
    }
    "jobsync-state.db".to_string()
}

pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn maybe_compress(doc: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("JOBSYNC_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        if let Ok(packed) = zstd::encode_all(doc.as_bytes(), lvl) {
            return packed;
        }
    }
    doc.as_bytes().to_vec()
}

fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
