//! File-backed durable store: a MessagePack snapshot plus an append-only
//! write-ahead log of puts and deletes.

use super::DurableStore;
use crate::core::{EntityId, EntityRecord, PersistError, Result};
use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

const SNAPSHOT_FILE: &str = "vehicles.snapshot";
const WAL_FILE: &str = "vehicles.wal";
const JOURNAL_FORMAT_VERSION: u32 = 1;
const DEFAULT_CHECKPOINT_THRESHOLD: usize = 1_000;

// ============================================================================
// On-disk formats
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalEntry {
    Put(EntityRecord),
    Delete(EntityId),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreSnapshot {
    version: u32,
    created_at_unix_ms: i64,
    records: Vec<EntityRecord>,
}

// ============================================================================
// Journal state
// ============================================================================

struct JournalState {
    root: PathBuf,
    records: HashMap<EntityId, EntityRecord>,
    wal: BufWriter<File>,
    entries_since_checkpoint: usize,
    checkpoint_threshold: usize,
}

impl JournalState {
    fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILE)
    }

    fn wal_path(&self) -> PathBuf {
        self.root.join(WAL_FILE)
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let serialized = rmp_serde::to_vec_named(entry)?;
        let len = serialized.len() as u32;
        self.wal
            .write_all(&len.to_le_bytes())
            .map_err(|e| PersistError::DurableWrite(format!("write wal: {}", e)))?;
        self.wal
            .write_all(&serialized)
            .map_err(|e| PersistError::DurableWrite(format!("write wal: {}", e)))?;
        self.wal
            .flush()
            .map_err(|e| PersistError::DurableWrite(format!("flush wal: {}", e)))?;
        self.wal
            .get_mut()
            .sync_data()
            .map_err(|e| PersistError::DurableWrite(format!("sync wal: {}", e)))?;

        match entry {
            JournalEntry::Put(record) => {
                self.records.insert(record.id.clone(), record.clone());
            }
            JournalEntry::Delete(id) => {
                self.records.remove(id);
            }
        }

        self.entries_since_checkpoint += 1;
        if self.entries_since_checkpoint >= self.checkpoint_threshold {
            self.checkpoint()?;
        }
        Ok(())
    }

    /// Rewrites the snapshot from the in-memory mirror and truncates the WAL.
    fn checkpoint(&mut self) -> Result<()> {
        let mut records = self.records.values().cloned().collect::<Vec<_>>();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        let snapshot = StoreSnapshot {
            version: JOURNAL_FORMAT_VERSION,
            created_at_unix_ms: Utc::now().timestamp_millis(),
            records,
        };
        let serialized = rmp_serde::to_vec_named(&snapshot)?;

        let mut temp = NamedTempFile::new_in(&self.root)
            .map_err(|e| PersistError::DurableWrite(format!("create temp snapshot: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| PersistError::DurableWrite(format!("write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| PersistError::DurableWrite(format!("sync snapshot: {}", e)))?;
        temp.persist(self.snapshot_path())
            .map_err(|e| PersistError::DurableWrite(format!("rename snapshot: {}", e)))?;

        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.wal_path())
            .map_err(|e| PersistError::DurableWrite(format!("truncate wal: {}", e)))?;
        self.wal = BufWriter::new(file);
        self.entries_since_checkpoint = 0;
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<StoreSnapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)?;
    if snapshot.version != JOURNAL_FORMAT_VERSION {
        return Err(PersistError::Serialization(format!(
            "unsupported snapshot format version {}",
            snapshot.version
        )));
    }
    Ok(Some(snapshot))
}

/// Reads WAL entries until EOF. A torn or undecodable tail (crash mid-append)
/// ends the replay instead of failing recovery; the flag reports whether the
/// log ended cleanly.
fn read_wal(path: &Path) -> Result<(Vec<JournalEntry>, bool)> {
    if !path.exists() {
        return Ok((Vec::new(), true));
    }
    let mut reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut data = vec![0u8; len];
        if let Err(e) = reader.read_exact(&mut data) {
            warn!("ignoring torn wal entry in {}: {}", path.display(), e);
            return Ok((entries, false));
        }
        match rmp_serde::from_slice::<JournalEntry>(&data) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                warn!("ignoring undecodable wal entry in {}: {}", path.display(), e);
                return Ok((entries, false));
            }
        }
    }
    Ok((entries, true))
}

// ============================================================================
// Journal store
// ============================================================================

pub struct JournalStore {
    state: Arc<Mutex<JournalState>>,
}

impl JournalStore {
    /// Opens (or creates) a store rooted at `root` and recovers its contents.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with_threshold(root, DEFAULT_CHECKPOINT_THRESHOLD)
    }

    pub fn open_with_threshold<P: AsRef<Path>>(root: P, checkpoint_threshold: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut records = HashMap::new();
        if let Some(snapshot) = read_snapshot(&root.join(SNAPSHOT_FILE))? {
            for record in snapshot.records {
                records.insert(record.id.clone(), record);
            }
        }

        let (replayed, clean) = read_wal(&root.join(WAL_FILE))?;
        let entries_since_checkpoint = replayed.len();
        for entry in replayed {
            match entry {
                JournalEntry::Put(record) => {
                    records.insert(record.id.clone(), record);
                }
                JournalEntry::Delete(id) => {
                    records.remove(&id);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(WAL_FILE))?;

        let mut state = JournalState {
            root,
            records,
            wal: BufWriter::new(file),
            entries_since_checkpoint,
            checkpoint_threshold: checkpoint_threshold.max(1),
        };
        // New appends must not land behind a corrupt tail.
        if !clean {
            state.checkpoint()?;
        }

        Ok(Self {
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Folds the WAL into a fresh snapshot.
    pub async fn compact(&self) -> Result<()> {
        self.with_state(|state| state.checkpoint()).await
    }

    pub async fn entries_since_checkpoint(&self) -> Result<usize> {
        self.with_state(|state| Ok(state.entries_since_checkpoint)).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.with_state(|state| Ok(state.records.len())).await
    }

    /// The record stored under `id`, or `NotFound`.
    pub async fn get(&self, id: &EntityId) -> Result<EntityRecord> {
        let id = id.clone();
        self.with_state(move |state| {
            state
                .records
                .get(&id)
                .cloned()
                .ok_or_else(|| PersistError::NotFound(id.to_string()))
        })
        .await
    }

    /// Deletes `id` and returns what was stored. Unlike
    /// [`DurableStore::delete`], an absent id is `NotFound`.
    pub async fn take(&self, id: &EntityId) -> Result<EntityRecord> {
        let id = id.clone();
        self.with_state(move |state| {
            let record = state
                .records
                .get(&id)
                .cloned()
                .ok_or_else(|| PersistError::NotFound(id.to_string()))?;
            state.append(&JournalEntry::Delete(id))?;
            Ok(record)
        })
        .await
    }

    async fn with_state<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut JournalState) -> Result<T> + Send + 'static,
    {
        let state = self.state.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = state.lock()?;
            f(&mut guard)
        })
        .await
        .map_err(|e| PersistError::Worker(format!("journal task: {}", e)))?
    }
}

#[async_trait]
impl DurableStore for JournalStore {
    async fn put(&self, record: &EntityRecord) -> Result<()> {
        let mut record = record.clone();
        record.being_used = false;
        self.with_state(move |state| state.append(&JournalEntry::Put(record)))
            .await
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        let id = id.clone();
        self.with_state(move |state| {
            if !state.records.contains_key(&id) {
                return Ok(());
            }
            state.append(&JournalEntry::Delete(id))
        })
        .await
    }

    async fn load_all(&self) -> Result<Vec<EntityRecord>> {
        self.with_state(|state| Ok(state.records.values().cloned().collect()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Condition, Vec3};
    use tempfile::TempDir;

    fn record(plate: &str) -> EntityRecord {
        EntityRecord::new(EntityId::parse(plate).unwrap(), "char:1", "adder")
            .at(Vec3::new(1.0, 2.0, 3.0), 90.0)
            .with_configuration(vec![0, 159, 255, 7])
            .with_condition(Condition {
                fuel: 42.5,
                body_health: 800.0,
                engine_health: 950.0,
            })
            .saved_at(Utc::now())
    }

    #[tokio::test]
    async fn test_recovery_replays_wal() {
        let dir = TempDir::new().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store.put(&record("AAA111")).await.unwrap();
            store.put(&record("BBB222")).await.unwrap();
            store.delete(&EntityId::parse("AAA111").unwrap()).await.unwrap();
        }

        let reopened = JournalStore::open(dir.path()).unwrap();
        let loaded = reopened.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id.as_str(), "BBB222");
        assert_eq!(loaded[0].configuration, vec![0, 159, 255, 7]);
        assert_eq!(loaded[0].condition.fuel, 42.5);
        assert_eq!(loaded[0].position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[tokio::test]
    async fn test_checkpoint_truncates_wal() {
        let dir = TempDir::new().unwrap();
        let store = JournalStore::open_with_threshold(dir.path(), 3).unwrap();
        store.put(&record("AAA111")).await.unwrap();
        store.put(&record("BBB222")).await.unwrap();
        assert_eq!(store.entries_since_checkpoint().await.unwrap(), 2);

        store.put(&record("CCC333")).await.unwrap();
        assert_eq!(store.entries_since_checkpoint().await.unwrap(), 0);
        assert!(dir.path().join(SNAPSHOT_FILE).exists());
        drop(store);

        let reopened = JournalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_delete_of_absent_id_is_not_logged() {
        let dir = TempDir::new().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        store.delete(&EntityId::parse("NOPE").unwrap()).await.unwrap();
        assert_eq!(store.entries_since_checkpoint().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_take_requires_presence() {
        let dir = TempDir::new().unwrap();
        let store = JournalStore::open(dir.path()).unwrap();
        store.put(&record("AAA111")).await.unwrap();
        let id = EntityId::parse("AAA111").unwrap();

        assert_eq!(store.get(&id).await.unwrap().owner_id.as_str(), "char:1");
        assert_eq!(store.take(&id).await.unwrap().id, id);
        assert_eq!(
            store.take(&id).await,
            Err(PersistError::NotFound("AAA111".to_string()))
        );
        assert!(matches!(store.get(&id).await, Err(PersistError::NotFound(_))));
        assert_eq!(store.entries_since_checkpoint().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        {
            let store = JournalStore::open(dir.path()).unwrap();
            store.put(&record("AAA111")).await.unwrap();
        }
        {
            let mut wal = OpenOptions::new()
                .append(true)
                .open(dir.path().join(WAL_FILE))
                .unwrap();
            wal.write_all(&64u32.to_le_bytes()).unwrap();
            wal.write_all(&[1, 2, 3]).unwrap();
        }

        let reopened = JournalStore::open(dir.path()).unwrap();
        assert_eq!(reopened.len().await.unwrap(), 1);
        reopened.put(&record("BBB222")).await.unwrap();
        drop(reopened);

        let again = JournalStore::open(dir.path()).unwrap();
        assert_eq!(again.len().await.unwrap(), 2);
    }
}
