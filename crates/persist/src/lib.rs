//! dloop persistence: a tiny key/value session store (checked-out service and project).
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use dloop_core::{Project, Service};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::debug;

pub const SERVICE_KEY: &str = "service";
pub const PROJECT_KEY: &str = "project";

pub trait SessionStore: Send + Sync {
    fn put(&self, key: &str, value: &Value) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Value>>;
}

/// SQLite-backed store. Simple, synchronous. The CLI isn't latency sensitive here.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("DLOOP_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS session (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                ts    INTEGER NOT NULL
            )",
            [],
        )
        .context("creating session table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(%path, "session store opened");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, rusqlite::Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SessionStore for SqliteStore {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        let started = std::time::Instant::now();
        let text = serde_json::to_string(value)?;
        self.conn()
            .execute(
                "INSERT INTO session(key, value, ts) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, ts = excluded.ts",
                (key, &text, now_ts()),
            )
            .with_context(|| format!("writing session key {}", key))?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let started = std::time::Instant::now();
        let db = self.conn();
        let mut stmt = db.prepare("SELECT value FROM session WHERE key = ?1")?;
        let mut rows = stmt.query([key])?;
        let out = match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                Some(serde_json::from_str(&text).with_context(|| format!("decoding session key {}", key))?)
            }
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }
}

/// Process-local store, used by tests.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

impl SessionStore for MemoryStore {
    fn put(&self, key: &str, value: &Value) -> Result<()> {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.map.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned())
    }
}

/// Checkout state over any [`SessionStore`]. Last write wins per key.
pub struct Session {
    store: Box<dyn SessionStore>,
}

impl Session {
    pub fn new(store: impl SessionStore + 'static) -> Self {
        Self { store: Box::new(store) }
    }

    pub fn in_memory() -> Self { Self::new(MemoryStore::new()) }

    pub fn checkout_service(&self, service: &Service) -> Result<()> {
        self.store.put(SERVICE_KEY, &serde_json::to_value(service)?)
    }

    pub fn current_service(&self) -> Result<Option<Service>> {
        self.load(SERVICE_KEY)
    }

    pub fn checkout_project(&self, project: &Project) -> Result<()> {
        self.store.put(PROJECT_KEY, &serde_json::to_value(project)?)
    }

    pub fn current_project(&self) -> Result<Option<Project>> {
        self.load(PROJECT_KEY)
    }

    fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.store.get(key)? {
            Some(v) => Ok(Some(serde_json::from_value(v).with_context(|| format!("session key {} holds an unexpected shape", key))?)),
            None => Ok(None),
        }
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".dloop");
        let _ = std::fs::create_dir_all(&p);
        p.push("dloop.db");
        return p.to_string_lossy().to_string();
    }
    "dloop.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("dloop-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn svc(id: &str) -> Service {
        serde_json::from_value(json!({"id": id, "name": "svc", "runtime": {"gpu": false}})).unwrap()
    }

    #[test]
    fn put_overwrites_same_key() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        s.put("service", &json!({"id": "a"})).unwrap();
        s.put("service", &json!({"id": "b"})).unwrap();
        assert_eq!(s.get("service").unwrap(), Some(json!({"id": "b"})));
        assert_eq!(s.get("missing").unwrap(), None);
    }

    #[test]
    fn checkout_survives_reopen() {
        let path = temp_db();
        {
            let session = Session::new(SqliteStore::open(&path).unwrap());
            session.checkout_service(&svc("s1")).unwrap();
        }
        let session = Session::new(SqliteStore::open(&path).unwrap());
        let cur = session.current_service().unwrap().unwrap();
        assert_eq!(cur.id, "s1");
        assert_eq!(cur.runtime.get("gpu"), Some(&json!(false)));
    }

    #[test]
    fn empty_session_is_none() {
        let session = Session::in_memory();
        assert!(session.current_service().unwrap().is_none());
        assert!(session.current_project().unwrap().is_none());
    }

    #[test]
    fn last_checkout_wins() {
        let session = Session::in_memory();
        session.checkout_service(&svc("s1")).unwrap();
        session.checkout_service(&svc("s2")).unwrap();
        assert_eq!(session.current_service().unwrap().unwrap().id, "s2");
        let project: Project = serde_json::from_value(json!({"id": "p1", "name": "proj"})).unwrap();
        session.checkout_project(&project).unwrap();
        assert_eq!(session.current_project().unwrap().unwrap().name, "proj");
    }
}
