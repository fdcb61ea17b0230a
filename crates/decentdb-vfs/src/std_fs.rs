//! Production VFS over `std::fs` with platform positional I/O.

use std::fs::{File, OpenOptions};
use std::path::Path;

use decentdb_error::{Result, ResultExt};
use decentdb_types::SyncMode;

use crate::{Vfs, VfsFile};

/// The default on-disk VFS.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdVfs;

impl StdVfs {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Vfs for StdVfs {
    fn open(&self, path: &Path, create: bool) -> Result<Box<dyn VfsFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .context("vfs open")?;
        Ok(Box::new(StdFile { file }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).context("vfs delete")
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(path.exists())
    }
}

#[derive(Debug)]
struct StdFile {
    file: File,
}

impl VfsFile for StdFile {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, offset)?)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        Ok(self.file.seek_read(buf, offset)?)
    }

    #[cfg(unix)]
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.write_at(data, offset)?)
    }

    #[cfg(windows)]
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        use std::os::windows::fs::FileExt;
        Ok(self.file.seek_write(data, offset)?)
    }

    fn sync(&self, mode: SyncMode) -> Result<()> {
        match mode {
            SyncMode::Full => self.file.sync_all().context("fsync"),
            SyncMode::Normal => self.file.sync_data().context("fdatasync"),
            SyncMode::NoSync => Ok(()),
        }
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, new_len: u64) -> Result<()> {
        self.file.set_len(new_len).context("truncate")
    }
}
