use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use super::{Disk, DiskKind, normalize_key, normalize_prefix};
use crate::error::DiskError;
use crate::traits::DiskResult;

const TMP_SUFFIX: &str = ".tmp";

/// A directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalDisk {
    name: String,
    root: PathBuf,
    root_display: String,
    sync_on_write: bool,
}

impl LocalDisk {
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> DiskResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            name: name.into(),
            root_display: root.to_string_lossy().into_owned(),
            root,
            sync_on_write: true,
        })
    }

    pub fn with_sync_on_write(mut self, sync_on_write: bool) -> Self {
        self.sync_on_write = sync_on_write;
        self
    }

    fn path_for(&self, key: &str) -> DiskResult<PathBuf> {
        let key = normalize_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |path, part| path.join(part)))
    }

    async fn blocking<T, F>(&self, f: F) -> DiskResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> DiskResult<T> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| DiskError::Io(std::io::Error::other(format!("disk task failed: {}", e))))?
    }
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

fn write_atomic(path: &Path, data: &[u8], sync: bool) -> DiskResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DiskError::InvalidKey(path.to_string_lossy().into_owned()))?;
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}{}", file_name, TMP_SUFFIX));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    file.write_all(data)?;
    if sync {
        file.sync_all()?;
    }
    drop(file);

    fs::rename(&tmp_path, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp_path);
    })?;
    if sync {
        sync_dir(parent)?;
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        // in-flight atomic writes
        if name.starts_with('.') && name.ends_with(TMP_SUFFIX) {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(root) {
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push(key);
        }
    }
    Ok(())
}

#[async_trait]
impl Disk for LocalDisk {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DiskKind {
        DiskKind::Local
    }

    fn root_prefix(&self) -> &str {
        &self.root_display
    }

    fn supports_append(&self) -> bool {
        true
    }

    async fn put(&self, key: &str, data: Bytes) -> DiskResult<()> {
        let path = self.path_for(key)?;
        let sync = self.sync_on_write;
        debug!("disk {}: put {} ({} bytes)", self.name, key, data.len());
        self.blocking(move || write_atomic(&path, &data, sync)).await
    }

    async fn get(&self, key: &str) -> DiskResult<Bytes> {
        let path = self.path_for(key)?;
        let owned_key = key.to_string();
        self.blocking(move || match fs::read(&path) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(DiskError::NotFound(owned_key)),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn exists(&self, key: &str) -> DiskResult<bool> {
        let path = self.path_for(key)?;
        self.blocking(move || match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> DiskResult<Vec<String>> {
        let prefix = normalize_prefix(prefix)?;
        let root = self.root.clone();
        let base = prefix
            .split('/')
            .filter(|p| !p.is_empty())
            .fold(root.clone(), |path, part| path.join(part));

        self.blocking(move || {
            let mut keys = Vec::new();
            match fs::metadata(&base) {
                Ok(meta) if meta.is_dir() => collect_files(&root, &base, &mut keys)?,
                Ok(_) => keys.push(prefix),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            keys.sort();
            Ok(keys)
        })
        .await
    }

    async fn delete(&self, key: &str) -> DiskResult<()> {
        let path = self.path_for(key)?;
        let name = self.name.clone();
        let owned_key = key.to_string();
        self.blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("disk {}: delete of absent {}", name, owned_key);
                Ok(())
            }
            Err(e) => {
                warn!("disk {}: failed to delete {}: {}", name, owned_key, e);
                Err(e.into())
            }
        })
        .await
    }

    async fn append(&self, key: &str, data: Bytes) -> DiskResult<()> {
        let path = self.path_for(key)?;
        let sync = self.sync_on_write;
        self.blocking(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&data)?;
            if sync {
                file.sync_data()?;
            }
            Ok(())
        })
        .await
    }
}
