// File-backed port store: JSON snapshot, sidecar lock file, atomic replace on write.
// Every mutation reloads and rewrites the whole snapshot, one bulk_upsert per batch included,
// so an upload costs batches x store size in I/O. Large stores want a bigger --batch-size.
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::debug;

use super::error::{Error, ErrorKind, map_io_error_kind};
use super::port::{Port, PortId, PortPatch};
use super::store::{PortStore, PortTable};

#[derive(Clone, Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    tmp_path: PathBuf,
}

impl FileStore {
    /// Opens (or prepares) the snapshot at `path`; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let Some(file_name) = path.file_name() else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("store path must name a file")
                .with_path(&path));
        };
        let sibling = |suffix: &str| {
            let mut name = OsString::from(file_name);
            name.push(suffix);
            path.with_file_name(name)
        };
        let store = Self {
            lock_path: sibling(".lock"),
            tmp_path: sibling(".tmp"),
            path,
        };
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| io_error(parent, err))?;
            }
        }
        // Surface a corrupt snapshot at open time rather than on first use.
        store.read(|_| Ok(()))?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock, Error> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|err| io_error(&self.lock_path, err))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(|err| io_error(&self.lock_path, err))?;
        Ok(StoreLock { file })
    }

    fn load(&self) -> Result<PortTable, Error> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(PortTable::default()),
            Err(err) => return Err(io_error(&self.path, err)),
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            Error::new(ErrorKind::Storage)
                .with_message("store snapshot is not valid JSON")
                .with_path(&self.path)
                .with_hint("Restore the file from a backup or remove it to start empty.")
                .with_source(err)
        })
    }

    fn save(&self, table: &PortTable) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(table).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to encode store snapshot")
                .with_source(err)
        })?;
        let mut tmp = File::create(&self.tmp_path).map_err(|err| io_error(&self.tmp_path, err))?;
        tmp.write_all(&bytes)
            .and_then(|()| tmp.sync_all())
            .map_err(|err| io_error(&self.tmp_path, err))?;
        drop(tmp);
        fs::rename(&self.tmp_path, &self.path).map_err(|err| io_error(&self.path, err))?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "store snapshot written");
        Ok(())
    }

    fn read<T>(&self, op: impl FnOnce(&PortTable) -> Result<T, Error>) -> Result<T, Error> {
        let _lock = self.lock(false)?;
        let table = self.load()?;
        op(&table)
    }

    fn write<T>(&self, op: impl FnOnce(&mut PortTable) -> Result<T, Error>) -> Result<T, Error> {
        let _lock = self.lock(true)?;
        let mut table = self.load()?;
        let result = op(&mut table)?;
        self.save(&table)?;
        Ok(result)
    }
}

struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn io_error(path: &Path, err: io::Error) -> Error {
    Error::new(map_io_error_kind(&err))
        .with_path(path)
        .with_source(err)
}

impl PortStore for FileStore {
    fn list(&self) -> Result<Vec<Port>, Error> {
        self.read(|table| Ok(table.list()))
    }

    fn fetch(&self, id: &PortId) -> Result<Port, Error> {
        self.read(|table| table.fetch(id))
    }

    fn create(&self, port: Port) -> Result<Port, Error> {
        self.write(|table| table.create(port))
    }

    fn upsert(&self, port: Port) -> Result<Port, Error> {
        self.write(|table| table.upsert(port))
    }

    fn bulk_upsert(&self, ports: Vec<Port>) -> Result<usize, Error> {
        self.write(|table| table.bulk_upsert(ports))
    }

    fn update(&self, id: &PortId, patch: PortPatch) -> Result<Port, Error> {
        self.write(|table| table.update(id, patch))
    }

    fn delete(&self, id: &PortId) -> Result<Port, Error> {
        self.write(|table| table.delete(id))
    }
}
