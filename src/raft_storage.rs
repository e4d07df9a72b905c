//! Persistent raft storage backed by redb.
//!
//! The raft log, hard state, conf state and the latest state-machine
//! snapshot each live in their own table. Hard/conf state and snapshot
//! metadata are additionally cached in memory since the `raft::Storage`
//! trait reads them on hot paths.

use std::path::Path;
use std::sync::{Arc, RwLock};

use raft::prelude::*;
use raft::{
    Error as RaftError, GetEntriesContext, RaftState, Storage as RaftStorageTrait, StorageError,
};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info};

use crate::error::{KronosError, Result};
use crate::raft_codec;

pub const RAFT_LOG_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("raft_log");
pub const RAFT_HARD_STATE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("raft_hard_state");
pub const RAFT_CONF_STATE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("raft_conf_state");
pub const RAFT_SNAPSHOT_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("raft_snapshot");

const HARD_STATE_KEY: &str = "hard_state";
const CONF_STATE_KEY: &str = "conf_state";
const SNAPSHOT_META_KEY: &str = "metadata";
const SNAPSHOT_DATA_KEY: &str = "data";

#[derive(Clone)]
pub struct RaftStorage {
    database: Arc<Database>,
    hard_state: Arc<RwLock<HardState>>,
    conf_state: Arc<RwLock<ConfState>>,
    snapshot_metadata: Arc<RwLock<SnapshotMetadata>>,
}

impl RaftStorage {
    pub fn open(path: &Path) -> Result<Self> {
        let database = Database::create(path)
            .map_err(|e| KronosError::storage("open raft database", e))?;

        // Make sure all tables exist before the first read transaction.
        let write_txn = database
            .begin_write()
            .map_err(|e| KronosError::storage("initialize raft tables", e))?;
        {
            write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| KronosError::storage("open raft log table", e))?;
            write_txn
                .open_table(RAFT_HARD_STATE_TABLE)
                .map_err(|e| KronosError::storage("open hard state table", e))?;
            write_txn
                .open_table(RAFT_CONF_STATE_TABLE)
                .map_err(|e| KronosError::storage("open conf state table", e))?;
            write_txn
                .open_table(RAFT_SNAPSHOT_TABLE)
                .map_err(|e| KronosError::storage("open snapshot table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| KronosError::storage("initialize raft tables", e))?;

        let storage = Self {
            database: Arc::new(database),
            hard_state: Arc::new(RwLock::new(HardState::default())),
            conf_state: Arc::new(RwLock::new(ConfState::default())),
            snapshot_metadata: Arc::new(RwLock::new(SnapshotMetadata::default())),
        };
        storage.reload_caches()?;
        Ok(storage)
    }

    fn reload_caches(&self) -> Result<()> {
        if let Some(data) = self.get_state(RAFT_HARD_STATE_TABLE, HARD_STATE_KEY)? {
            *self.hard_state.write().unwrap() = raft_codec::deserialize_hard_state(&data)?;
        }
        if let Some(data) = self.get_state(RAFT_CONF_STATE_TABLE, CONF_STATE_KEY)? {
            *self.conf_state.write().unwrap() = raft_codec::deserialize_conf_state(&data)?;
        }
        if let Some(data) = self.get_state(RAFT_SNAPSHOT_TABLE, SNAPSHOT_META_KEY)? {
            if data.len() >= 16 {
                let mut meta = SnapshotMetadata::default();
                meta.set_index(u64::from_le_bytes(data[0..8].try_into().unwrap()));
                meta.set_term(u64::from_le_bytes(data[8..16].try_into().unwrap()));
                *self.snapshot_metadata.write().unwrap() = meta;
            }
        }
        Ok(())
    }

    fn get_state(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| KronosError::storage("begin read", e))?;
        let table = read_txn
            .open_table(table)
            .map_err(|e| KronosError::storage("open table", e))?;
        let value = table
            .get(key)
            .map_err(|e| KronosError::storage("read state", e))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    fn put_state(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> Result<()> {
        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| KronosError::storage("begin write", e))?;
        {
            let mut table = write_txn
                .open_table(table)
                .map_err(|e| KronosError::storage("open table", e))?;
            table
                .insert(key, value)
                .map_err(|e| KronosError::storage("write state", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| KronosError::storage("commit state", e))?;
        Ok(())
    }

    /// Seed the conf state for a fresh single-node cluster. No-op when the
    /// storage was already initialized.
    pub fn initialize_single_node(&self, raft_id: u64) -> Result<()> {
        if self.get_state(RAFT_CONF_STATE_TABLE, CONF_STATE_KEY)?.is_some() {
            return Ok(());
        }
        let mut conf_state = ConfState::default();
        conf_state.set_voters(vec![raft_id]);
        self.save_conf_state(&conf_state)?;
        info!(raft_id, "initialized raft storage for a single-node cluster");
        Ok(())
    }

    /// A joining node starts with an empty configuration; it becomes a voter
    /// once the leader's conf change entry (or a snapshot) reaches it.
    pub fn initialize_joining_node(&self) -> Result<()> {
        if self.get_state(RAFT_CONF_STATE_TABLE, CONF_STATE_KEY)?.is_some() {
            return Ok(());
        }
        self.save_conf_state(&ConfState::default())?;
        self.save_hard_state(&HardState::default())?;
        info!("initialized raft storage for a joining node");
        Ok(())
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| KronosError::storage("begin write", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| KronosError::storage("open raft log table", e))?;

            // A leader change may overwrite a divergent suffix; drop any
            // entries past the new append point first.
            let from = entries[0].index;
            let stale: Vec<u64> = table
                .range(from..)
                .map_err(|e| KronosError::storage("scan raft log", e))?
                .map(|r| r.map(|(k, _)| k.value()))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| KronosError::storage("scan raft log", e))?;
            for key in stale {
                table
                    .remove(&key)
                    .map_err(|e| KronosError::storage("truncate raft log", e))?;
            }

            for entry in entries {
                let data = raft_codec::serialize_entry(entry)?;
                table
                    .insert(&entry.index, data.as_slice())
                    .map_err(|e| KronosError::storage("append raft log", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| KronosError::storage("commit raft log", e))?;
        debug!(count = entries.len(), "appended raft log entries");
        Ok(())
    }

    pub fn save_hard_state(&self, hs: &HardState) -> Result<()> {
        self.put_state(
            RAFT_HARD_STATE_TABLE,
            HARD_STATE_KEY,
            &raft_codec::serialize_hard_state(hs)?,
        )?;
        *self.hard_state.write().unwrap() = hs.clone();
        Ok(())
    }

    pub fn save_conf_state(&self, cs: &ConfState) -> Result<()> {
        self.put_state(
            RAFT_CONF_STATE_TABLE,
            CONF_STATE_KEY,
            &raft_codec::serialize_conf_state(cs)?,
        )?;
        *self.conf_state.write().unwrap() = cs.clone();
        Ok(())
    }

    pub fn hard_state(&self) -> HardState {
        self.hard_state.read().unwrap().clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.conf_state.read().unwrap().clone()
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hs = self.hard_state();
        hs.set_commit(commit);
        self.save_hard_state(&hs)
    }

    pub fn snapshot_index(&self) -> u64 {
        self.snapshot_metadata.read().unwrap().index
    }

    /// Install a snapshot received from the leader.
    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        self.put_state(RAFT_SNAPSHOT_TABLE, SNAPSHOT_DATA_KEY, snapshot.get_data())?;
        self.persist_snapshot_meta(meta.index, meta.term)?;
        if meta.get_conf_state() != &ConfState::default() {
            self.save_conf_state(meta.get_conf_state())?;
        }

        let mut hs = self.hard_state();
        if hs.commit < meta.index {
            hs.set_commit(meta.index);
            if hs.term < meta.term {
                hs.set_term(meta.term);
            }
            self.save_hard_state(&hs)?;
        }

        self.compact(meta.index)?;
        info!(index = meta.index, term = meta.term, "applied raft snapshot");
        Ok(())
    }

    /// Record a locally-taken snapshot of the state machine and drop the log
    /// prefix it covers.
    pub fn create_snapshot(&self, index: u64, cs: ConfState, data: Vec<u8>) -> Result<()> {
        let term = RaftStorageTrait::term(self, index)
            .map_err(|e| KronosError::raft("snapshot term lookup", e))?;
        self.put_state(RAFT_SNAPSHOT_TABLE, SNAPSHOT_DATA_KEY, &data)?;
        self.persist_snapshot_meta(index, term)?;
        self.save_conf_state(&cs)?;
        self.compact(index)?;
        debug!(index, term, "created raft snapshot");
        Ok(())
    }

    fn persist_snapshot_meta(&self, index: u64, term: u64) -> Result<()> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&index.to_le_bytes());
        buf.extend_from_slice(&term.to_le_bytes());
        self.put_state(RAFT_SNAPSHOT_TABLE, SNAPSHOT_META_KEY, &buf)?;

        let mut meta = SnapshotMetadata::default();
        meta.set_index(index);
        meta.set_term(term);
        *self.snapshot_metadata.write().unwrap() = meta;
        Ok(())
    }

    /// Drop log entries at or below `index`; they are covered by a snapshot.
    fn compact(&self, index: u64) -> Result<()> {
        let write_txn = self
            .database
            .begin_write()
            .map_err(|e| KronosError::storage("begin write", e))?;
        {
            let mut table = write_txn
                .open_table(RAFT_LOG_TABLE)
                .map_err(|e| KronosError::storage("open raft log table", e))?;
            let stale: Vec<u64> = table
                .range(..=index)
                .map_err(|e| KronosError::storage("scan raft log", e))?
                .map(|r| r.map(|(k, _)| k.value()))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| KronosError::storage("scan raft log", e))?;
            for key in stale {
                table
                    .remove(&key)
                    .map_err(|e| KronosError::storage("compact raft log", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| KronosError::storage("compact raft log", e))?;
        Ok(())
    }

    fn get_entry(&self, index: u64) -> Result<Option<Entry>> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| KronosError::storage("begin read", e))?;
        let table = read_txn
            .open_table(RAFT_LOG_TABLE)
            .map_err(|e| KronosError::storage("open raft log table", e))?;
        match table
            .get(&index)
            .map_err(|e| KronosError::storage("read raft log", e))?
        {
            Some(data) => Ok(Some(raft_codec::deserialize_entry(data.value())?)),
            None => Ok(None),
        }
    }

    fn stored_last_index(&self) -> Result<u64> {
        let read_txn = self
            .database
            .begin_read()
            .map_err(|e| KronosError::storage("begin read", e))?;
        let table = read_txn
            .open_table(RAFT_LOG_TABLE)
            .map_err(|e| KronosError::storage("open raft log table", e))?;
        let last = table
            .last()
            .map_err(|e| KronosError::storage("read raft log", e))?;
        Ok(last.map(|(k, _)| k.value()).unwrap_or(0))
    }
}

fn store_err<E>(e: E) -> RaftError
where
    E: std::error::Error + Send + Sync + 'static,
{
    RaftError::Store(StorageError::Other(Box::new(e)))
}

impl RaftStorageTrait for RaftStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(RaftState::new(self.hard_state(), self.conf_state()))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let max_size = max_size.into();
        let snapshot_index = self.snapshot_index();
        if low <= snapshot_index {
            return Err(RaftError::Store(StorageError::Compacted));
        }

        let read_txn = self.database.begin_read().map_err(store_err)?;
        let table = read_txn.open_table(RAFT_LOG_TABLE).map_err(store_err)?;

        let mut entries = Vec::new();
        let mut size = 0u64;
        let mut expected = low;
        for item in table.range(low..high).map_err(store_err)? {
            let (key, value) = item.map_err(store_err)?;
            if key.value() != expected {
                return Err(RaftError::Store(StorageError::Unavailable));
            }
            expected += 1;

            let entry = raft_codec::deserialize_entry(value.value())
                .map_err(|e| RaftError::Store(StorageError::Other(Box::new(e))))?;
            size += value.value().len() as u64;
            if let Some(max) = max_size {
                if size > max && !entries.is_empty() {
                    return Ok(entries);
                }
            }
            entries.push(entry);
        }
        if expected < high {
            return Err(RaftError::Store(StorageError::Unavailable));
        }
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let meta = self.snapshot_metadata.read().unwrap().clone();
        if idx == meta.index {
            return Ok(meta.term);
        }
        if idx < meta.index {
            return Err(RaftError::Store(StorageError::Compacted));
        }
        match self.get_entry(idx).map_err(store_err)? {
            Some(entry) => Ok(entry.term),
            None => Err(RaftError::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.snapshot_index() + 1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        let stored = self.stored_last_index().map_err(store_err)?;
        Ok(stored.max(self.snapshot_index()))
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let meta = self.snapshot_metadata.read().unwrap().clone();
        if meta.index < request_index {
            return Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable));
        }

        let mut snapshot = Snapshot::default();
        let data = self
            .get_state(RAFT_SNAPSHOT_TABLE, SNAPSHOT_DATA_KEY)
            .map_err(store_err)?;
        if let Some(data) = data {
            snapshot.set_data(data.into());
        }
        snapshot.mut_metadata().set_index(meta.index);
        snapshot.mut_metadata().set_term(meta.term);
        snapshot.mut_metadata().set_conf_state(self.conf_state());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.set_index(index);
        e.set_term(term);
        e.set_data(vec![index as u8].into());
        e
    }

    fn ctx() -> GetEntriesContext {
        GetEntriesContext::empty(false)
    }

    #[test]
    fn test_initial_state_after_single_node_init() {
        let dir = TempDir::new().unwrap();
        let storage = RaftStorage::open(&dir.path().join("raft.db")).unwrap();
        storage.initialize_single_node(7).unwrap();

        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![7]);
        assert_eq!(state.hard_state, HardState::default());
    }

    #[test]
    fn test_append_and_read_entries() {
        let dir = TempDir::new().unwrap();
        let storage = RaftStorage::open(&dir.path().join("raft.db")).unwrap();
        storage
            .append(&[entry(1, 1), entry(2, 1), entry(3, 2)])
            .unwrap();

        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(RaftStorageTrait::term(&storage, 3).unwrap(), 2);

        let entries = storage.entries(1, 4, None, ctx()).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].index, 3);
    }

    #[test]
    fn test_append_overwrites_divergent_suffix() {
        let dir = TempDir::new().unwrap();
        let storage = RaftStorage::open(&dir.path().join("raft.db")).unwrap();
        storage
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1)])
            .unwrap();
        // New leader rewrites from index 2 onward.
        storage.append(&[entry(2, 2)]).unwrap();

        assert_eq!(storage.last_index().unwrap(), 2);
        assert_eq!(RaftStorageTrait::term(&storage, 2).unwrap(), 2);
    }

    #[test]
    fn test_hard_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("raft.db");
        {
            let storage = RaftStorage::open(&path).unwrap();
            let mut hs = HardState::default();
            hs.set_term(5);
            hs.set_vote(2);
            hs.set_commit(9);
            storage.save_hard_state(&hs).unwrap();
        }
        let storage = RaftStorage::open(&path).unwrap();
        let hs = storage.hard_state();
        assert_eq!(hs.term, 5);
        assert_eq!(hs.vote, 2);
        assert_eq!(hs.commit, 9);
    }

    #[test]
    fn test_create_snapshot_compacts_log() {
        let dir = TempDir::new().unwrap();
        let storage = RaftStorage::open(&dir.path().join("raft.db")).unwrap();
        storage
            .append(&[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)])
            .unwrap();

        let mut cs = ConfState::default();
        cs.set_voters(vec![1]);
        storage.create_snapshot(3, cs, vec![9, 9, 9]).unwrap();

        assert_eq!(storage.first_index().unwrap(), 4);
        assert_eq!(storage.last_index().unwrap(), 4);
        assert!(matches!(
            storage.entries(2, 4, None, ctx()),
            Err(RaftError::Store(StorageError::Compacted))
        ));
        // Term at the snapshot boundary still answerable.
        assert_eq!(RaftStorageTrait::term(&storage, 3).unwrap(), 1);

        let snapshot = RaftStorageTrait::snapshot(&storage, 3, 0).unwrap();
        assert_eq!(snapshot.get_metadata().index, 3);
        assert_eq!(snapshot.get_data(), &[9, 9, 9]);
    }

    #[test]
    fn test_apply_snapshot_installs_state() {
        let dir = TempDir::new().unwrap();
        let storage = RaftStorage::open(&dir.path().join("raft.db")).unwrap();
        storage.initialize_joining_node().unwrap();

        let mut snapshot = Snapshot::default();
        snapshot.set_data(vec![1, 2, 3].into());
        snapshot.mut_metadata().set_index(10);
        snapshot.mut_metadata().set_term(3);
        let mut cs = ConfState::default();
        cs.set_voters(vec![1, 2]);
        snapshot.mut_metadata().set_conf_state(cs);

        storage.apply_snapshot(&snapshot).unwrap();
        assert_eq!(storage.first_index().unwrap(), 11);
        assert_eq!(storage.conf_state().voters, vec![1, 2]);
        assert_eq!(storage.hard_state().commit, 10);
        assert_eq!(RaftStorageTrait::term(&storage, 10).unwrap(), 3);
    }

    #[test]
    fn test_snapshot_unavailable_beyond_request() {
        let dir = TempDir::new().unwrap();
        let storage = RaftStorage::open(&dir.path().join("raft.db")).unwrap();
        assert!(matches!(
            RaftStorageTrait::snapshot(&storage, 5, 0),
            Err(RaftError::Store(StorageError::SnapshotTemporarilyUnavailable))
        ));
    }
}
