//! Key-value persistence layer for Miniroha
//!
//! Every component reads and writes through the [`KvStore`] trait. The single
//! contract a backend must honor: a [`WriteBatch`] commits in its entirety or
//! leaves the store untouched.

use crate::error::{StorageError, StorageResult};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// An ordered set of puts and deletes committed as one atomic unit.
///
/// Later operations on the same key win; the map representation collapses
/// them eagerly.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: BTreeMap<String, Option<String>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.ops.insert(key.into(), Some(value.into()));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.insert(key.into(), None);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Iterates `(key, Some(value))` puts and `(key, None)` deletes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.ops.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }
}

/// Abstraction over the embedded store. Implementations must provide point
/// lookups, prefix scans, and all-or-nothing batch commits.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn put(&self, key: &str, value: &str) -> StorageResult<()>;
    fn delete(&self, key: &str) -> StorageResult<()>;
    /// Returns `(key, value)` pairs whose key starts with `prefix`, in
    /// ascending key order.
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>>;
    /// Commits the batch atomically: either every operation applies or none.
    fn apply(&self, batch: WriteBatch) -> StorageResult<()>;
}

/// SQLite-backed store. A batch is one SQL transaction, which gives the
/// atomicity contract for free.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> StorageResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StorageError(format!("failed to open database: {}", e)))?;
        Self::init(conn)
    }

    /// In-memory SQLite database, used by tests that still want the SQL path.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError(format!("failed to open database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StorageResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| StorageError(format!("failed to create kv table: {}", e)))?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError("mutex poisoned".to_string()))
    }
}

impl KvStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        let conn = self.lock()?;
        // LIKE special characters in keys would corrupt the pattern; range
        // comparison avoids escaping entirely.
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE key >= ?1 AND key < ?2 ORDER BY key ASC",
        )?;
        let upper = prefix_upper_bound(prefix);
        let rows = stmt.query_map(params![prefix, upper], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        let conn = self.lock()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| StorageError(format!("failed to start transaction: {}", e)))?;
        for (key, value) in batch.iter() {
            match value {
                Some(value) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                        params![key, value],
                    )?;
                }
                None => {
                    tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                }
            }
        }
        tx.commit()
            .map_err(|e| StorageError(format!("failed to commit batch: {}", e)))?;
        Ok(())
    }
}

/// Smallest string strictly greater than every key with the given prefix.
fn prefix_upper_bound(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0xff {
            bytes.push(last + 1);
            break;
        }
    }
    // An all-0xff prefix degenerates to "scan everything from prefix"; keys
    // here are ASCII paths so this branch is unreachable in practice.
    if bytes.is_empty() {
        return String::from_utf8_lossy(&[0xffu8; 64]).into_owned();
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// In-memory store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.map
            .lock()
            .map_err(|_| StorageError("mutex poisoned".to_string()))
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply(&self, batch: WriteBatch) -> StorageResult<()> {
        let mut map = self.lock()?;
        for (key, value) in batch.iter() {
            match value {
                Some(value) => {
                    map.insert(key.to_string(), value.to_string());
                }
                None => {
                    map.remove(key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stores() -> Vec<Box<dyn KvStore>> {
        vec![
            Box::new(MemoryStore::new()),
            Box::new(SqliteStore::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn test_point_operations() {
        for store in stores() {
            assert_eq!(store.get("k").unwrap(), None);
            store.put("k", "v").unwrap();
            assert_eq!(store.get("k").unwrap(), Some("v".to_string()));
            store.put("k", "v2").unwrap();
            assert_eq!(store.get("k").unwrap(), Some("v2".to_string()));
            store.delete("k").unwrap();
            assert_eq!(store.get("k").unwrap(), None);
        }
    }

    #[test]
    fn test_scan_prefix_ordered() {
        for store in stores() {
            store.put("validators/node2", "b").unwrap();
            store.put("validators/node1", "a").unwrap();
            store.put("validators/node10", "c").unwrap();
            store.put("domains/root", "d").unwrap();

            let hits = store.scan_prefix("validators/").unwrap();
            let keys: Vec<_> = hits.iter().map(|(k, _)| k.as_str()).collect();
            assert_eq!(
                keys,
                vec!["validators/node1", "validators/node10", "validators/node2"]
            );
        }
    }

    #[test]
    fn test_batch_applies_all_operations() {
        for store in stores() {
            store.put("stale", "old").unwrap();

            let mut batch = WriteBatch::new();
            batch.put("a", "1");
            batch.put("b", "2");
            batch.delete("stale");
            store.apply(batch).unwrap();

            assert_eq!(store.get("a").unwrap(), Some("1".to_string()));
            assert_eq!(store.get("b").unwrap(), Some("2".to_string()));
            assert_eq!(store.get("stale").unwrap(), None);
        }
    }

    #[test]
    fn test_batch_last_write_wins() {
        let mut batch = WriteBatch::new();
        batch.put("k", "first");
        batch.delete("k");
        batch.put("k", "last");
        assert_eq!(batch.len(), 1);

        let store = MemoryStore::new();
        store.apply(batch).unwrap();
        assert_eq!(store.get("k").unwrap(), Some("last".to_string()));
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        let path = path.to_str().unwrap();

        {
            let store = SqliteStore::open(path).unwrap();
            let mut batch = WriteBatch::new();
            batch.put("last_height", "7");
            store.apply(batch).unwrap();
        }

        let store = SqliteStore::open(path).unwrap();
        assert_eq!(store.get("last_height").unwrap(), Some("7".to_string()));
    }
}
