//! Spindle persistence: one audit record per cluster mutation.
//! Writes are synchronous; each record is committed before the call returns.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use spindle_core::{annotations, kinds, Manifest};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    Deploy,
    Delete,
    Cleanup,
    Scale,
    RollingRestart,
    Enable,
    Disable,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Deploy => "deploy",
            TaskType::Delete => "delete",
            TaskType::Cleanup => "cleanup",
            TaskType::Scale => "scale",
            TaskType::RollingRestart => "rollingRestart",
            TaskType::Enable => "enable",
            TaskType::Disable => "disable",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "deploy" => TaskType::Deploy,
            "delete" => TaskType::Delete,
            "cleanup" => TaskType::Cleanup,
            "scale" => TaskType::Scale,
            "rollingRestart" => TaskType::RollingRestart,
            "enable" => TaskType::Enable,
            "disable" => TaskType::Disable,
            other => anyhow::bail!("unknown task type {:?}", other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub account: String,
    pub task_id: String,
    pub task_type: TaskType,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub app: String,
    pub cluster: String,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

impl AuditRecord {
    /// Record for a mutation of `m`; app and cluster come from its moniker
    /// annotations, the resource from the static plural table.
    pub fn for_manifest(account: &str, task_id: &str, task_type: TaskType, m: &Manifest) -> Self {
        let (group, version) = match m.api_version().split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), m.api_version().to_string()),
        };
        Self {
            account: account.to_string(),
            task_id: task_id.to_string(),
            task_type,
            group,
            version,
            resource: kinds::default_plural(m.kind()),
            kind: m.kind().to_string(),
            name: m.name().to_string(),
            namespace: m.namespace().unwrap_or_default().to_string(),
            app: m.annotation(annotations::MONIKER_APPLICATION).unwrap_or_default().to_string(),
            cluster: m.annotation(annotations::MONIKER_CLUSTER).unwrap_or_default().to_string(),
            timestamp: now_rfc3339(),
        }
    }

    /// Override the resource with the one the cluster actually served.
    pub fn with_resource(mut self, resource: &str) -> Self {
        self.resource = resource.to_string();
        self
    }
}

/// One orchestrator task against one account; every mutation it makes is
/// recorded under the same task id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub account: String,
    pub id: String,
}

impl Task {
    pub fn new(account: &str) -> Self {
        Self { account: account.to_string(), id: new_task_id() }
    }

    pub fn with_id(account: &str, id: &str) -> Self {
        Self { account: account.to_string(), id: id.to_string() }
    }

    pub fn record(&self, task_type: TaskType, m: &Manifest) -> AuditRecord {
        AuditRecord::for_manifest(&self.account, &self.id, task_type, m)
    }
}

pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub trait AuditSink: Send + Sync {
    fn create(&self, rec: &AuditRecord) -> Result<()>;
}

/// SQLite-backed audit trail.
pub struct SqliteAuditStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteAuditStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("SPINDLE_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS audit (
                task_id   TEXT NOT NULL,
                task_type TEXT NOT NULL,
                account   TEXT NOT NULL,
                grp       TEXT NOT NULL,
                version   TEXT NOT NULL,
                resource  TEXT NOT NULL,
                kind      TEXT NOT NULL,
                name      TEXT NOT NULL,
                namespace TEXT NOT NULL,
                app       TEXT NOT NULL,
                cluster   TEXT NOT NULL,
                ts        TEXT NOT NULL
            )",
            [],
        )
        .context("creating audit table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_audit_account_ts ON audit(account, ts DESC)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Most recent records first, optionally for one account.
    pub fn recent(&self, account: Option<&str>, limit: usize) -> Result<Vec<AuditRecord>> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = db.prepare(
            "SELECT task_id, task_type, account, grp, version, resource, kind, name, namespace, app, cluster, ts
             FROM audit WHERE (?1 IS NULL OR account = ?1) ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((account, limit as i64))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let task_type: String = row.get(1)?;
            out.push(AuditRecord {
                task_id: row.get(0)?,
                task_type: task_type.parse()?,
                account: row.get(2)?,
                group: row.get(3)?,
                version: row.get(4)?,
                resource: row.get(5)?,
                kind: row.get(6)?,
                name: row.get(7)?,
                namespace: row.get(8)?,
                app: row.get(9)?,
                cluster: row.get(10)?,
                timestamp: row.get(11)?,
            });
        }
        Ok(out)
    }
}

impl AuditSink for SqliteAuditStore {
    fn create(&self, rec: &AuditRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        db.execute(
            "INSERT INTO audit(task_id, task_type, account, grp, version, resource, kind, name, namespace, app, cluster, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                rec.task_id,
                rec.task_type.as_str(),
                rec.account,
                rec.group,
                rec.version,
                rec.resource,
                rec.kind,
                rec.name,
                rec.namespace,
                rec.app,
                rec.cluster,
                rec.timestamp,
            ],
        )
        .with_context(|| format!("recording {} of {} {}", rec.task_type, rec.kind, rec.name))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("audit_records_total", 1u64);
        debug!(task = %rec.task_id, op = %rec.task_type, kind = %rec.kind, name = %rec.name, "audit recorded");
        Ok(())
    }
}

/// Keeps records in memory; used by tests and dry runs.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn create(&self, rec: &AuditRecord) -> Result<()> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).push(rec.clone());
        Ok(())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".spindle");
        let _ = std::fs::create_dir_all(&p);
        p.push("audit.db");
        return p.to_string_lossy().to_string();
    }
    "spindle-audit.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("spindle-test-{}.db", uuid::Uuid::new_v4());
        dir.join(f).to_string_lossy().to_string()
    }

    fn deployment() -> Manifest {
        Manifest::new(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "app",
                "namespace": "default",
                "annotations": {
                    "moniker.spinnaker.io/application": "shop",
                    "moniker.spinnaker.io/cluster": "deployment app"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn record_from_manifest() {
        let rec = AuditRecord::for_manifest("prod", "t1", TaskType::Deploy, &deployment());
        assert_eq!(rec.group, "apps");
        assert_eq!(rec.version, "v1");
        assert_eq!(rec.resource, "deployments");
        assert_eq!(rec.app, "shop");
        assert_eq!(rec.cluster, "deployment app");
        assert_eq!(rec.namespace, "default");
        assert!(rec.timestamp.ends_with('Z'));
    }

    #[test]
    fn sqlite_roundtrip_newest_first() {
        let store = SqliteAuditStore::open(&temp_db()).unwrap();
        let mut first = AuditRecord::for_manifest("prod", "t1", TaskType::Deploy, &deployment());
        first.timestamp = "2030-01-01T00:00:00.000Z".into();
        let mut second = AuditRecord::for_manifest("prod", "t2", TaskType::Cleanup, &deployment());
        second.timestamp = "2030-01-01T00:00:01.000Z".into();
        let other = AuditRecord::for_manifest("staging", "t3", TaskType::Scale, &deployment());
        for r in [&first, &second, &other] {
            store.create(r).unwrap();
        }
        let prod = store.recent(Some("prod"), 10).unwrap();
        assert_eq!(prod, vec![second, first]);
        assert_eq!(store.recent(None, 10).unwrap().len(), 3);
        assert_eq!(store.recent(None, 1).unwrap().len(), 1);
    }

    #[test]
    fn task_type_names() {
        assert_eq!("rollingRestart".parse::<TaskType>().unwrap(), TaskType::RollingRestart);
        assert!("nope".parse::<TaskType>().is_err());
        assert_eq!(TaskType::Cleanup.to_string(), "cleanup");
    }
}
