//! Ordered byte-map storage backing the synchronizer's checkpoint.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;

/// One write of a [`WriteBatch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Writes applied all together or not at all.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    fn apply_to(self, map: &mut BTreeMap<Vec<u8>, Vec<u8>>) {
        for op in self.ops {
            match op {
                WriteOp::Put(k, v) => {
                    map.insert(k, v);
                }
                WriteOp::Delete(k) => {
                    map.remove(&k);
                }
            }
        }
    }
}

/// An ordered byte mapping. Readers may run concurrently with the single
/// writer.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Applies every write of `batch` atomically.
    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

fn scan(map: &BTreeMap<Vec<u8>, Vec<u8>>, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
    map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Volatile store, used when no data directory is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(scan(&self.map.read(), prefix))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        batch.apply_to(&mut self.map.write());
        Ok(())
    }
}

/// Store kept in memory and mirrored to a single file. Every write batch
/// rewrites the file through a temporary file and a rename, so the file
/// always holds the state after some complete batch.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

const STORE_FILE_NAME: &str = "state.json";

impl FileStore {
    /// Opens the store in `dir`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        if fs::metadata(dir).is_err() {
            info!("Created store directory {}", dir.display());
            fs::create_dir_all(dir)?;
        }
        let path = dir.join(STORE_FILE_NAME);
        let map = match File::open(&path) {
            Ok(file) => {
                let des = &mut serde_json::Deserializer::from_reader(std::io::BufReader::new(file));
                let encoded: BTreeMap<String, String> = serde_path_to_error::deserialize(des)
                    .map_err(|e| StoreError::Corrupt {
                        key: format!("{}: {}", path.display(), e.path()),
                        source: e.into_inner(),
                    })?;
                decode_map(encoded)?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(entries = map.len(), path = %path.display(), "opened store");
        Ok(Self {
            path,
            map: RwLock::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, map: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StoreError> {
        let encoded: BTreeMap<String, String> = map
            .iter()
            .map(|(k, v)| (hex::encode(k), hex::encode(v)))
            .collect();
        let bytes = serde_json::to_vec(&encoded).map_err(|source| StoreError::Corrupt {
            key: self.path.display().to_string(),
            source,
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(&bytes)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn decode_map(encoded: BTreeMap<String, String>) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
    encoded
        .into_iter()
        .map(|(k, v)| {
            let key = hex::decode(&k).map_err(|e| StoreError::Inconsistent(format!("key {k}: {e}")))?;
            let value =
                hex::decode(&v).map_err(|e| StoreError::Inconsistent(format!("value of {k}: {e}")))?;
            Ok((key, value))
        })
        .collect()
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(scan(&self.map.read(), prefix))
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut map = self.map.write();
        let mut next = map.clone();
        batch.apply_to(&mut next);
        self.flush(&next)?;
        *map = next;
        Ok(())
    }
}

impl<S: KvStore + ?Sized> KvStore for std::sync::Arc<S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(key)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        (**self).scan_prefix(prefix)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }
}
