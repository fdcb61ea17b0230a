//! Write-ahead log: append-only commit log with snapshot-consistent reads,
//! crash recovery, and checkpoint support.

pub mod format;
pub mod wal;

pub use format::{FRAME_HEADER_SIZE, FrameType, WAL_HEADER_SIZE, WAL_MAGIC, WalHeader};
pub use wal::{ReadTxn, ReaderState, Wal, WalWriter};
