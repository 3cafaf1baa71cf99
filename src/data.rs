//! Output data handles and the content store they live in.
//!
//! The engine never touches bytes on disk directly. Every artifact hands its
//! output to a [`DataStore`] keyed by the artifact's cache key, and asks the
//! same store whether a key has been seen before.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::core::{Args, Hash32};
use crate::error::StoreError;

/// Data type used when a filter doesn't name one.
pub const GENERIC: &str = "generic";

/// Handle to the output of one artifact.
#[derive(Debug, Clone)]
pub struct Data {
    /// Key of the artifact which produced this data.
    pub key: String,
    /// Output extension, including the leading dot (e.g. `.html`).
    pub ext: String,
    /// Cache key of the producing artifact.
    pub hash: Hash32,
    /// Data class marker, e.g. `generic` or `sectioned`.
    pub data_type: String,
    /// Name of the store holding the bytes.
    pub storage_type: String,
    bytes: Option<Arc<[u8]>>,
}

impl Data {
    pub fn new(key: impl Into<String>, ext: impl Into<String>, hash: Hash32) -> Self {
        Self {
            key: key.into(),
            ext: ext.into(),
            hash,
            data_type: GENERIC.to_string(),
            storage_type: String::new(),
            bytes: None,
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    pub fn set_data(&mut self, bytes: impl Into<Arc<[u8]>>) {
        self.bytes = Some(bytes.into());
    }

    /// Raw bytes, empty if nothing was set.
    pub fn data(&self) -> &[u8] {
        self.bytes.as_deref().unwrap_or_default()
    }

    pub fn has_data(&self) -> bool {
        self.bytes.is_some()
    }

    /// Contents as UTF-8 text, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.data()).into_owned()
    }

    /// Name under which this output appears in the result set.
    pub fn name(&self) -> Utf8PathBuf {
        let base = self.key.split('|').next().unwrap_or(&self.key);
        let path = Utf8PathBuf::from(base);
        match self.ext.strip_prefix('.') {
            Some(ext) if !ext.is_empty() => path.with_extension(ext),
            _ => path,
        }
    }
}

/// Everything the run history knows about a stored output, enough to get
/// the handle back in a later process.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSpec {
    pub data_type: String,
    pub key: String,
    pub ext: String,
    pub hash: Hash32,
    pub args: Args,
    pub storage_type: String,
}

/// Content-addressed storage for artifact outputs.
pub trait DataStore: Send + Sync {
    /// Name recorded as `storage_type` in the run history.
    fn storage_type(&self) -> &'static str;

    /// Looks up a previously stored output by cache key.
    fn lookup(&self, hash: &Hash32) -> Result<Option<Data>, StoreError>;

    /// Persists an output under its cache key.
    fn store(&self, data: &Data) -> Result<(), StoreError>;

    /// Rebuilds a handle from persisted run information.
    fn retrieve(&self, spec: &DataSpec) -> Result<Data, StoreError> {
        if !spec.storage_type.is_empty() && spec.storage_type != self.storage_type() {
            return Err(StoreError::WrongStorage {
                expected: self.storage_type().to_string(),
                found: spec.storage_type.clone(),
            });
        }

        let mut data = self
            .lookup(&spec.hash)?
            .ok_or_else(|| StoreError::Missing(spec.hash.to_hex()))?;
        data.key = spec.key.clone();
        data.ext = spec.ext.clone();
        data.data_type = spec.data_type.clone();
        Ok(data)
    }

    fn contains(&self, hash: &Hash32) -> Result<bool, StoreError> {
        Ok(self.lookup(hash)?.is_some())
    }
}

/// Keeps outputs in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<Hash32, Data>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DataStore for MemoryStore {
    fn storage_type(&self) -> &'static str {
        "memory"
    }

    fn lookup(&self, hash: &Hash32) -> Result<Option<Data>, StoreError> {
        let map = self.map.read().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(hash).cloned())
    }

    fn store(&self, data: &Data) -> Result<(), StoreError> {
        let mut data = data.clone();
        data.storage_type = self.storage_type().to_string();

        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        map.insert(data.hash, data);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Meta {
    key: String,
    ext: String,
    data_type: String,
}

/// Stores outputs as files named by their cache key.
///
/// Each entry is a pair: `<hex>` with the raw bytes, and `<hex>.meta` with a
/// small CBOR record describing them.
pub struct FsStore {
    dir: Utf8PathBuf,
}

impl FsStore {
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    fn path_data(&self, hash: &Hash32) -> Utf8PathBuf {
        self.dir.join(hash.to_hex())
    }

    fn path_meta(&self, hash: &Hash32) -> Utf8PathBuf {
        self.dir.join(hash.to_hex()).with_extension("meta")
    }
}

impl DataStore for FsStore {
    fn storage_type(&self) -> &'static str {
        "fs"
    }

    fn lookup(&self, hash: &Hash32) -> Result<Option<Data>, StoreError> {
        let path_meta = self.path_meta(hash);
        let path_data = self.path_data(hash);

        if !path_meta.exists() || !path_data.exists() {
            return Ok(None);
        }

        let meta: Meta = ciborium::from_reader(fs::File::open(&path_meta)?)?;
        let bytes = fs::read(&path_data)?;

        let mut data = Data::new(meta.key, meta.ext, *hash).with_data_type(meta.data_type);
        data.storage_type = self.storage_type().to_string();
        data.set_data(bytes);
        Ok(Some(data))
    }

    /// Both files are written to a temporary name and renamed into place,
    /// the sidecar last, so a concurrent `lookup` never sees a partial entry.
    fn store(&self, data: &Data) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let path_data = self.path_data(&data.hash);
        if !path_data.exists() {
            let mut file = NamedTempFile::new_in(&self.dir)?;
            file.write_all(data.data())?;
            file.persist(&path_data).map_err(|e| e.error)?;
        }

        let meta = Meta {
            key: data.key.clone(),
            ext: data.ext.clone(),
            data_type: data.data_type.clone(),
        };
        let mut file = NamedTempFile::new_in(&self.dir)?;
        ciborium::into_writer(&meta, &mut file)?;
        file.persist(self.path_meta(&data.hash)).map_err(|e| e.error)?;

        Ok(())
    }
}
