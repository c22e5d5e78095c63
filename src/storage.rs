use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Context};

use crate::error::{CubeError, Result};

/// Blocking key-value blob store, the only shared mutable resource.
///
/// Keys are plain strings; there is no compare-and-swap primitive, so
/// concurrent writers to the same cube must be serialized by the caller.
/// Errors are propagated verbatim; retry policy belongs to implementations.
pub trait BlobStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>>;
    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, key: &str) -> anyhow::Result<()>;
    /// All keys starting with `prefix`, sorted.
    fn keys_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>>;
    fn exists(&self, key: &str) -> anyhow::Result<bool>;
}

/// Either an already-open store handle or a lazy factory for one.
///
/// Resolved exactly once at the entry boundary; the rest of the code always
/// works against the resolved handle.
pub enum StoreSource {
    Handle(Arc<dyn BlobStore>),
    Factory(Box<dyn Fn() -> anyhow::Result<Arc<dyn BlobStore>> + Send + Sync>),
}

impl StoreSource {
    pub fn handle(store: Arc<dyn BlobStore>) -> Self {
        StoreSource::Handle(store)
    }

    pub fn factory<F>(open: F) -> Self
    where
        F: Fn() -> anyhow::Result<Arc<dyn BlobStore>> + Send + Sync + 'static,
    {
        StoreSource::Factory(Box::new(open))
    }

    pub fn resolve(&self) -> Result<Arc<dyn BlobStore>> {
        match self {
            StoreSource::Handle(store) => Ok(store.clone()),
            StoreSource::Factory(open) => open().map_err(CubeError::Store),
        }
    }
}

/// In-memory store backed by an ordered map; primarily for tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("key not found: {key}"))
    }

    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries
            .write()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| anyhow!("key not found: {key}"))
    }

    fn keys_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.read().unwrap().contains_key(key))
    }
}

/// Filesystem store mapping keys to relative paths under a root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_context(|| format!("create store root {root:?}"))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl BlobStore for FileStore {
    fn get(&self, key: &str) -> anyhow::Result<Vec<u8>> {
        fs::read(self.path_for(key)).with_context(|| format!("read key {key}"))
    }

    fn put(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, value).with_context(|| format!("write key {key}"))
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        fs::remove_file(self.path_for(key)).with_context(|| format!("delete key {key}"))
    }

    fn keys_with_prefix(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let mut files = Vec::new();
        collect_files(&self.root, &self.root, &mut files)?;
        files.retain(|k| k.starts_with(prefix));
        files.sort();
        Ok(files)
    }

    fn exists(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.path_for(key).is_file())
    }
}

fn collect_files(root: &Path, dir: &Path, files: &mut Vec<String>) -> anyhow::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(root, &path, files)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(key);
        }
    }
    Ok(())
}
