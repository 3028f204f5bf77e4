//! Keel persistence: SQLite audit log of bootstrap phase transitions and the
//! per-scope lease that keeps two runs off the same scope.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One phase transition of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub scope: String,
    /// Milliseconds since epoch.
    pub ts: i64,
    pub run_id: String,
    pub from_phase: String,
    pub to_phase: String,
    pub attempt: u32,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

pub trait AuditStore {
    fn append(&self, rec: AuditRecord) -> Result<()>;
    /// Newest first.
    fn history(&self, scope: &str, limit: Option<usize>) -> Result<Vec<AuditRecord>>;
}

/// SQLite-backed store. Simple, synchronous; one row per transition.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KEEL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS bootstrap_audit (
                scope      TEXT NOT NULL,
                ts         INTEGER NOT NULL,
                run_id     TEXT NOT NULL,
                from_phase TEXT NOT NULL,
                to_phase   TEXT NOT NULL,
                attempt    INTEGER NOT NULL,
                error_kind TEXT,
                error      TEXT
            )",
            [],
        )
        .context("creating bootstrap_audit table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_audit_scope_ts ON bootstrap_audit(scope, ts DESC)", []).ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS scope_lease (
                scope      TEXT PRIMARY KEY,
                holder     TEXT NOT NULL,
                expires_ts INTEGER NOT NULL
            )",
            [],
        )
        .context("creating scope_lease table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "store opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    /// Take the exclusive lease on `scope` for `ttl_secs`. Returns false while another
    /// holder's lease is live; an expired lease is taken over. Re-acquiring as the
    /// current holder extends it.
    pub fn try_acquire_lease(&self, scope: &str, holder: &str, ttl_secs: i64) -> Result<bool> {
        let now = now_ts();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let current: Option<(String, i64)> = tx
            .query_row("SELECT holder, expires_ts FROM scope_lease WHERE scope = ?1", [scope], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?;
        if let Some((h, expires)) = &current {
            if h != holder && *expires > now {
                debug!(scope, holder = %h, "lease held by another run");
                return Ok(false);
            }
        }
        tx.execute(
            "INSERT INTO scope_lease(scope, holder, expires_ts) VALUES (?1, ?2, ?3)
             ON CONFLICT(scope) DO UPDATE SET holder = excluded.holder, expires_ts = excluded.expires_ts",
            (scope, holder, now + ttl_secs),
        )?;
        tx.commit()?;
        counter!("persist_lease_acquired_total", 1u64);
        info!(scope, holder, ttl_secs, "lease acquired");
        Ok(true)
    }

    /// Release only if `holder` still owns the lease.
    pub fn release_lease(&self, scope: &str, holder: &str) -> Result<()> {
        let db = self.conn()?;
        db.execute("DELETE FROM scope_lease WHERE scope = ?1 AND holder = ?2", (scope, holder))?;
        Ok(())
    }
}

impl AuditStore for SqliteStore {
    fn append(&self, rec: AuditRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        db.execute(
            "INSERT INTO bootstrap_audit(scope, ts, run_id, from_phase, to_phase, attempt, error_kind, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            (&rec.scope, rec.ts, &rec.run_id, &rec.from_phase, &rec.to_phase, rec.attempt, &rec.error_kind, &rec.error),
        )?;
        histogram!("persist_append_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_append_total", 1u64);
        Ok(())
    }

    fn history(&self, scope: &str, limit: Option<usize>) -> Result<Vec<AuditRecord>> {
        let cap = limit.unwrap_or(50);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT scope, ts, run_id, from_phase, to_phase, attempt, error_kind, error
             FROM bootstrap_audit WHERE scope = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((scope, cap as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(AuditRecord {
                scope: row.get(0)?,
                ts: row.get(1)?,
                run_id: row.get(2)?,
                from_phase: row.get(3)?,
                to_phase: row.get(4)?,
                attempt: row.get(5)?,
                error_kind: row.get(6)?,
                error: row.get(7)?,
            });
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".keel");
        let _ = std::fs::create_dir_all(&p);
        p.push("keel.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "keel.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("keel-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn rec(scope: &str, ts: i64, from: &str, to: &str) -> AuditRecord {
        AuditRecord {
            scope: scope.into(),
            ts,
            run_id: "r1".into(),
            from_phase: from.into(),
            to_phase: to.into(),
            attempt: 1,
            error_kind: None,
            error: None,
        }
    }

    #[test]
    fn history_is_newest_first_and_scoped() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        s.append(rec("test", 1, "Provisioning", "AwaitingReadiness")).unwrap();
        s.append(rec("test", 2, "AwaitingReadiness", "AllocatingIdentities")).unwrap();
        s.append(rec("other", 3, "Provisioning", "Failed")).unwrap();
        let mut failed = rec("test", 4, "AllocatingIdentities", "Failed");
        failed.error_kind = Some("Timeout".into());
        failed.error = Some("timed out: readiness".into());
        s.append(failed.clone()).unwrap();

        let rows = s.history("test", None).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], failed);
        assert_eq!(rows[2].to_phase, "AwaitingReadiness");
        assert_eq!(s.history("test", Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn lease_is_exclusive_until_released_or_expired() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        assert!(s.try_acquire_lease("test", "run-a", 60).unwrap());
        assert!(!s.try_acquire_lease("test", "run-b", 60).unwrap());
        // same holder extends
        assert!(s.try_acquire_lease("test", "run-a", 60).unwrap());
        // other scopes are independent
        assert!(s.try_acquire_lease("prod", "run-b", 60).unwrap());
        // a non-holder cannot release
        s.release_lease("test", "run-b").unwrap();
        assert!(!s.try_acquire_lease("test", "run-b", 60).unwrap());
        s.release_lease("test", "run-a").unwrap();
        assert!(s.try_acquire_lease("test", "run-b", 60).unwrap());
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        assert!(s.try_acquire_lease("test", "crashed", -1).unwrap());
        assert!(s.try_acquire_lease("test", "fresh", 60).unwrap());
    }
}
