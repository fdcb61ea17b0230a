//! In-memory VFS for unit tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use decentdb_error::{DecentError, Result};
use decentdb_types::SyncMode;

use crate::{Vfs, VfsFile};

/// A process-local filesystem keyed by path. Cloning shares the namespace,
/// so a "reopened" database sees the bytes the previous handle wrote.
#[derive(Debug, Default, Clone)]
pub struct MemoryVfs {
    files: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>>>,
}

impl MemoryVfs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vfs for MemoryVfs {
    fn open(&self, path: &Path, create: bool) -> Result<Box<dyn VfsFile>> {
        let mut files = self.files.lock();
        let data = match files.get(path) {
            Some(data) => Arc::clone(data),
            None if create => {
                let data = Arc::new(Mutex::new(Vec::new()));
                files.insert(path.to_owned(), Arc::clone(&data));
                data
            }
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such file: {}", path.display()),
                )
                .into());
            }
        };
        Ok(Box::new(MemoryFile { data }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        if self.files.lock().remove(path).is_none() {
            return Err(DecentError::internal(format!(
                "delete of unknown file: {}",
                path.display()
            )));
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.files.lock().contains_key(path))
    }
}

#[derive(Debug)]
struct MemoryFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl VfsFile for MemoryFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let mut file = self.data.lock();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    fn sync(&self, _mode: SyncMode) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn truncate(&self, new_len: u64) -> Result<()> {
        self.data.lock().truncate(new_len as usize);
        Ok(())
    }
}
