// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::{hash_map, BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use tracing::debug;

use super::{StateStore, Transaction};
use crate::{Error, Result};

/// An in-memory [`StateStore`] with optimistic concurrency control.
///
/// Every committed write gets a new version. A transaction remembers the version of each key it
/// read and the version of each table it scanned, and the commit is rejected with `TxnConflict`
/// if any of them moved in the meantime. A missing key reads as version zero, so deleted keys are
/// dropped at once: a reader of the live key still conflicts, and a reader that saw the key
/// missing only commits if it is missing again at commit time.
///
/// Clones share the same data, which lets a test drop a processor and build a new one over the
/// same store to simulate a failover.
#[derive(Clone, Default)]
pub struct MemStore {
    core: Arc<Mutex<MemCore>>,
}

#[derive(Default)]
struct MemCore {
    tables: HashMap<String, BTreeMap<Vec<u8>, Versioned>>,
    table_versions: HashMap<String, u64>,
    next_version: u64,

    not_primary: bool,
    closed: bool,
    commit_failures: usize,
}

struct Versioned {
    version: u64,
    value: Vec<u8>,
}

struct MemTxn {
    core: Arc<Mutex<MemCore>>,
    reads: HashMap<(String, Vec<u8>), u64>,
    scans: HashMap<String, u64>,
    writes: BTreeMap<(String, Vec<u8>), Option<Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Simulates losing or regaining the primary role.
    pub fn set_primary(&self, primary: bool) {
        self.core.lock().unwrap().not_primary = !primary;
    }

    /// Simulates the replica being closed. All later operations fail with `ObjectClosed`.
    pub fn close(&self) {
        self.core.lock().unwrap().closed = true;
    }

    /// The next `n` commits fail with `TxnConflict`.
    pub fn inject_commit_failures(&self, n: usize) {
        self.core.lock().unwrap().commit_failures = n;
    }

    /// The number of live entries in the table, outside of any transaction.
    pub fn len(&self, table: &str) -> usize {
        let core = self.core.lock().unwrap();
        core.tables
            .get(table)
            .map(BTreeMap::len)
            .unwrap_or_default()
    }
}

impl MemCore {
    fn check_available(&self) -> Result<()> {
        if self.closed {
            return Err(Error::ObjectClosed);
        }
        if self.not_primary {
            return Err(Error::NotPrimary);
        }
        Ok(())
    }

    fn key_version(&self, table: &str, key: &[u8]) -> u64 {
        self.tables
            .get(table)
            .and_then(|t| t.get(key))
            .map(|v| v.version)
            .unwrap_or_default()
    }

    fn table_version(&self, table: &str) -> u64 {
        self.table_versions.get(table).cloned().unwrap_or_default()
    }
}

#[crate::async_trait]
impl StateStore for MemStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.core.lock().unwrap().check_available()?;
        Ok(Box::new(MemTxn {
            core: self.core.clone(),
            reads: HashMap::default(),
            scans: HashMap::default(),
            writes: BTreeMap::default(),
        }))
    }
}

#[crate::async_trait]
impl Transaction for MemTxn {
    async fn get(&mut self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(value) = self.writes.get(&(table.to_owned(), key.to_owned())) {
            return Ok(value.clone());
        }

        let core = self.core.lock().unwrap();
        core.check_available()?;
        let version = core.key_version(table, key);
        if let hash_map::Entry::Vacant(entry) =
            self.reads.entry((table.to_owned(), key.to_owned()))
        {
            entry.insert(version);
        }
        Ok(core
            .tables
            .get(table)
            .and_then(|t| t.get(key))
            .map(|v| v.value.clone()))
    }

    async fn put(&mut self, table: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.writes.insert((table.to_owned(), key), Some(value));
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: &[u8]) -> Result<()> {
        self.writes.insert((table.to_owned(), key.to_owned()), None);
        Ok(())
    }

    async fn scan(&mut self, table: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = {
            let core = self.core.lock().unwrap();
            core.check_available()?;
            let version = core.table_version(table);
            self.scans.entry(table.to_owned()).or_insert(version);
            core.tables
                .get(table)
                .map(|t| {
                    t.iter()
                        .map(|(k, v)| (k.clone(), v.value.clone()))
                        .collect::<BTreeMap<_, _>>()
                })
                .unwrap_or_default()
        };

        for ((t, key), value) in &self.writes {
            if t != table {
                continue;
            }
            match value {
                Some(value) => {
                    entries.insert(key.clone(), value.clone());
                }
                None => {
                    entries.remove(key);
                }
            }
        }
        Ok(entries.into_iter().collect())
    }

    async fn count(&mut self, table: &str) -> Result<usize> {
        Ok(self.scan(table).await?.len())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemTxn {
            core,
            reads,
            scans,
            writes,
        } = *self;

        let mut core = core.lock().unwrap();
        core.check_available()?;
        if core.commit_failures > 0 {
            core.commit_failures -= 1;
            return Err(Error::TxnConflict("injected commit failure".into()));
        }

        for ((table, key), version) in &reads {
            if core.key_version(table, key) != *version {
                debug!(table = %table, "read set changed before commit");
                return Err(Error::TxnConflict(table.clone()));
            }
        }
        for (table, version) in &scans {
            if core.table_version(table) != *version {
                debug!(table = %table, "scanned table changed before commit");
                return Err(Error::TxnConflict(table.clone()));
            }
        }

        if writes.is_empty() {
            return Ok(());
        }

        core.next_version += 1;
        let version = core.next_version;
        for ((table, key), value) in writes {
            core.table_versions.insert(table.clone(), version);
            let entries = core.tables.entry(table).or_default();
            match value {
                Some(value) => {
                    entries.insert(key, Versioned { version, value });
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExecutorOwner;

    const TABLE: &str = "table";

    #[test]
    fn read_own_writes() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let store = MemStore::new();
            let mut txn = store.begin().await.unwrap();
            txn.put(TABLE, b"a".to_vec(), b"1".to_vec()).await.unwrap();
            txn.put(TABLE, b"b".to_vec(), b"2".to_vec()).await.unwrap();
            txn.delete(TABLE, b"b").await.unwrap();
            assert_eq!(txn.get(TABLE, b"a").await.unwrap(), Some(b"1".to_vec()));
            assert_eq!(txn.get(TABLE, b"b").await.unwrap(), None);
            assert_eq!(txn.count(TABLE).await.unwrap(), 1);
            assert_eq!(store.len(TABLE), 0);
            txn.commit().await.unwrap();
            assert_eq!(store.len(TABLE), 1);
        });
    }

    #[test]
    fn conflicting_read_is_rejected() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let store = MemStore::new();
            let mut t1 = store.begin().await.unwrap();
            let mut t2 = store.begin().await.unwrap();
            assert_eq!(t1.get(TABLE, b"a").await.unwrap(), None);
            t1.put(TABLE, b"a".to_vec(), b"1".to_vec()).await.unwrap();
            assert_eq!(t2.get(TABLE, b"a").await.unwrap(), None);
            t2.put(TABLE, b"a".to_vec(), b"2".to_vec()).await.unwrap();

            t1.commit().await.unwrap();
            assert!(matches!(t2.commit().await, Err(Error::TxnConflict(_))));

            let mut t3 = store.begin().await.unwrap();
            assert_eq!(t3.get(TABLE, b"a").await.unwrap(), Some(b"1".to_vec()));
        });
    }

    #[test]
    fn scan_conflicts_with_insert() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let store = MemStore::new();
            let mut t1 = store.begin().await.unwrap();
            assert_eq!(t1.count(TABLE).await.unwrap(), 0);
            t1.put("other", b"x".to_vec(), b"x".to_vec()).await.unwrap();

            let mut t2 = store.begin().await.unwrap();
            t2.put(TABLE, b"a".to_vec(), b"1".to_vec()).await.unwrap();
            t2.commit().await.unwrap();

            assert!(matches!(t1.commit().await, Err(Error::TxnConflict(_))));
        });
    }

    #[test]
    fn delete_then_reinsert_is_a_conflict() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let store = MemStore::new();
            let mut txn = store.begin().await.unwrap();
            txn.put(TABLE, b"a".to_vec(), b"1".to_vec()).await.unwrap();
            txn.commit().await.unwrap();

            let mut reader = store.begin().await.unwrap();
            assert!(reader.get(TABLE, b"a").await.unwrap().is_some());
            reader.put(TABLE, b"b".to_vec(), b"2".to_vec()).await.unwrap();

            let mut writer = store.begin().await.unwrap();
            writer.delete(TABLE, b"a").await.unwrap();
            writer.commit().await.unwrap();

            assert!(matches!(reader.commit().await, Err(Error::TxnConflict(_))));
            assert_eq!(store.len(TABLE), 0);
        });
    }

    #[test]
    fn deleted_keys_are_dropped() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let store = MemStore::new();
            let mut txn = store.begin().await.unwrap();
            txn.put(TABLE, b"a".to_vec(), b"1".to_vec()).await.unwrap();
            txn.put(TABLE, b"b".to_vec(), b"2".to_vec()).await.unwrap();
            txn.commit().await.unwrap();

            let mut txn = store.begin().await.unwrap();
            txn.delete(TABLE, b"a").await.unwrap();
            txn.commit().await.unwrap();
            assert_eq!(store.core.lock().unwrap().tables[TABLE].len(), 1);

            // The key is missing again at commit time.
            let mut reader = store.begin().await.unwrap();
            assert_eq!(reader.get(TABLE, b"a").await.unwrap(), None);
            reader.put("other", b"x".to_vec(), b"x".to_vec()).await.unwrap();
            let mut txn = store.begin().await.unwrap();
            txn.put(TABLE, b"a".to_vec(), b"3".to_vec()).await.unwrap();
            txn.commit().await.unwrap();
            let mut txn = store.begin().await.unwrap();
            txn.delete(TABLE, b"a").await.unwrap();
            txn.commit().await.unwrap();
            reader.commit().await.unwrap();

            // The key exists at commit time.
            let mut reader = store.begin().await.unwrap();
            assert_eq!(reader.get(TABLE, b"a").await.unwrap(), None);
            reader.put("other", b"y".to_vec(), b"y".to_vec()).await.unwrap();
            let mut txn = store.begin().await.unwrap();
            txn.put(TABLE, b"a".to_vec(), b"4".to_vec()).await.unwrap();
            txn.commit().await.unwrap();
            assert!(matches!(reader.commit().await, Err(Error::TxnConflict(_))));

            assert_eq!(store.core.lock().unwrap().tables[TABLE].len(), 2);
        });
    }

    #[test]
    fn testing_knobs() {
        let owner = ExecutorOwner::new(1);
        owner.executor().block_on(async {
            let store = MemStore::new();
            store.inject_commit_failures(1);
            let mut txn = store.begin().await.unwrap();
            txn.put(TABLE, b"a".to_vec(), b"1".to_vec()).await.unwrap();
            assert!(matches!(txn.commit().await, Err(Error::TxnConflict(_))));

            store.set_primary(false);
            assert!(matches!(store.begin().await, Err(Error::NotPrimary)));
            store.set_primary(true);
            assert!(store.begin().await.is_ok());

            store.close();
            assert!(matches!(store.begin().await, Err(Error::ObjectClosed)));
        });
    }
}
