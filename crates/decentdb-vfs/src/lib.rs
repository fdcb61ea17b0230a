//! Byte-level file abstraction.
//!
//! The engine never touches `std::fs` directly; everything goes through the
//! object-safe [`Vfs`]/[`VfsFile`] traits so tests can substitute an
//! in-memory filesystem or a fault-injecting wrapper. I/O is positional
//! (offset-addressed), never seek-based.

mod faulty;
mod memory;
mod std_fs;

pub use faulty::{FaultPlan, FaultyVfs};
pub use memory::MemoryVfs;
pub use std_fs::StdVfs;

use std::path::Path;
use std::sync::Arc;

use decentdb_error::Result;
use decentdb_types::SyncMode;

/// Filesystem-level operations.
pub trait Vfs: Send + Sync {
    /// Open `path`, creating it when `create` is set and it does not exist.
    fn open(&self, path: &Path, create: bool) -> Result<Box<dyn VfsFile>>;

    fn delete(&self, path: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> Result<bool>;
}

/// An open file handle.
///
/// Reads may be partial at EOF (`bytes_read < buf.len()`); callers that need
/// an exact count use [`read_exact_at`]. Writes must not be partial unless
/// the underlying device fails mid-write.
pub trait VfsFile: Send + Sync + std::fmt::Debug {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize>;

    /// Durably persist all prior writes according to `mode`.
    fn sync(&self, mode: SyncMode) -> Result<()>;

    fn len(&self) -> Result<u64>;

    fn truncate(&self, new_len: u64) -> Result<()>;

    /// Labeled crash site consulted by the fault-injecting VFS. Production
    /// implementations return `Ok(())` unconditionally.
    fn fault_point(&self, _label: &str) -> Result<()> {
        Ok(())
    }
}

/// Read exactly `buf.len()` bytes at `offset` or fail with `Io`.
pub fn read_exact_at(file: &dyn VfsFile, offset: u64, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read at offset {offset}"),
            )
            .into());
        }
        filled += n;
    }
    Ok(())
}

/// Write all of `data` at `offset` or fail with `Io`.
pub fn write_all_at(file: &dyn VfsFile, offset: u64, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = file.write_at(offset + written as u64, &data[written..])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("zero-length write at offset {offset}"),
            )
            .into());
        }
        written += n;
    }
    Ok(())
}

/// Shared handle alias used where a file outlives one owner.
pub type SharedFile = Arc<dyn VfsFile>;
