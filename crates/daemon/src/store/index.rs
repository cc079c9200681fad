// On-disk index for one entity type.
//
// Layout under the data directory:
//   <entity>/index.json        {"<collection>": [ ...records... ]}
//   <entity>/index.json.lock   empty; only ever flocked
//   <entity>/index.json.tmp    transient, renamed over index.json
//
// The lock lives on a separate file because index.json is replaced by
// rename, which would silently drop a lock held on the old inode.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde_json::{Map, Value};
use tracing::trace;
use workloop_common::error::StoreError;
use workloop_common::record::Record;

use super::hash::{sha256_hex, ContentHash};
use crate::fs_perms::{
    create_private_dir, ensure_owner_only_file, open_lock_file, open_private_truncate, sync_dir,
};

pub const INDEX_FILE_NAME: &str = "index.json";
const LOCK_SUFFIX: &str = ".lock";
const TMP_SUFFIX: &str = ".tmp";

/// Records read from disk together with the digest of the raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedIndex<R> {
    pub records: Vec<R>,
    /// `None` when the index file does not exist yet.
    pub digest: Option<ContentHash>,
}

/// Held flock on the index's lock file. Released on drop.
struct IndexLock {
    file: File,
}

impl IndexLock {
    fn exclusive(path: &Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self { file })
    }

    fn shared(path: &Path) -> io::Result<Self> {
        let file = open_lock_file(path)?;
        FileExt::lock_shared(&file)?;
        Ok(Self { file })
    }
}

impl Drop for IndexLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Paths and I/O for `<data_dir>/<entity>/index.json`.
#[derive(Debug, Clone)]
pub struct IndexFile {
    entity: &'static str,
    collection: &'static str,
    dir: PathBuf,
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
}

impl IndexFile {
    pub fn for_record<R: Record>(data_dir: &Path) -> Self {
        let dir = data_dir.join(R::ENTITY);
        let path = dir.join(INDEX_FILE_NAME);
        Self {
            entity: R::ENTITY,
            collection: R::COLLECTION,
            lock_path: with_suffix(&path, LOCK_SUFFIX),
            tmp_path: with_suffix(&path, TMP_SUFFIX),
            dir,
            path,
        }
    }

    /// Directory holding the index; the reconciler watches this.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        create_private_dir(&self.dir).map_err(|source| {
            StoreError::io(format!("failed to create directory `{}`", self.dir.display()), source)
        })
    }

    /// Read the index under a shared lock. A missing file is an empty index.
    pub fn read<R: Record>(&self) -> Result<LoadedIndex<R>, StoreError> {
        self.ensure_dir()?;
        let _lock = IndexLock::shared(&self.lock_path).map_err(|source| {
            StoreError::io(
                format!("failed to take shared lock `{}`", self.lock_path.display()),
                source,
            )
        })?;

        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Ok(LoadedIndex { records: Vec::new(), digest: None });
            }
            Err(source) => {
                return Err(StoreError::io(
                    format!("failed to read index `{}`", self.path.display()),
                    source,
                ))
            }
        };

        let records = self.decode(&bytes)?;
        Ok(LoadedIndex { records, digest: Some(sha256_hex(&bytes)) })
    }

    /// Persist `records` atomically under the exclusive lock.
    /// Returns the digest of the bytes written.
    pub fn write<R: Record>(&self, records: &[R]) -> Result<ContentHash, StoreError> {
        let bytes = self.encode(records)?;
        self.ensure_dir()?;

        let _lock = IndexLock::exclusive(&self.lock_path).map_err(|source| {
            StoreError::io(
                format!("failed to take exclusive lock `{}`", self.lock_path.display()),
                source,
            )
        })?;

        let mut file = open_private_truncate(&self.tmp_path).map_err(|source| {
            StoreError::io(format!("failed to open temp index `{}`", self.tmp_path.display()), source)
        })?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_all())
            .map_err(|source| StoreError::io("failed to write temp index", source))?;
        drop(file);

        if let Err(source) = fs::rename(&self.tmp_path, &self.path) {
            let _ = fs::remove_file(&self.tmp_path);
            return Err(StoreError::io(
                format!(
                    "failed to atomically move `{}` to `{}`",
                    self.tmp_path.display(),
                    self.path.display()
                ),
                source,
            ));
        }
        let _ = ensure_owner_only_file(&self.path);
        sync_dir(&self.dir);

        trace!(entity = self.entity, bytes = bytes.len(), "index persisted");
        Ok(sha256_hex(&bytes))
    }

    fn encode<R: Record>(&self, records: &[R]) -> Result<Vec<u8>, StoreError> {
        let encode_err = |source| StoreError::Encode { entity: self.entity, source };
        let mut doc = Map::new();
        doc.insert(self.collection.to_string(), serde_json::to_value(records).map_err(encode_err)?);
        let mut bytes = serde_json::to_vec_pretty(&Value::Object(doc)).map_err(encode_err)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode<R: Record>(&self, bytes: &[u8]) -> Result<Vec<R>, StoreError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        let decode_err = |source| StoreError::Decode { path: self.path.clone(), source };
        let mut doc: Map<String, Value> = serde_json::from_slice(bytes).map_err(decode_err)?;
        match doc.remove(self.collection) {
            Some(value) => serde_json::from_value(value).map_err(decode_err),
            None => Ok(Vec::new()),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
