//! Fault-injecting VFS for crash and torn-write tests.
//!
//! Wraps any inner VFS. A shared [`FaultPlan`] programs the failure
//! schedule:
//!
//! - `fail_write_after_bytes(n)`: the next writes succeed until `n` bytes
//!   have been consumed, then the write is torn at the budget boundary and
//!   every later write fails (simulated media death mid-write).
//! - `fail_nth_write(n)`: the n-th write call (1-based, counted across all
//!   wrapped files) fails outright.
//! - `drop_syncs()`: fsync calls silently succeed without being forwarded;
//!   the plan counts how many were swallowed.
//! - `crash_at(label)`: the first time a wrapped file passes the labeled
//!   [`VfsFile::fault_point`], the plan trips into a crashed state: that
//!   call and every subsequent operation fail with `Io`. Reopening through
//!   a fresh VFS observes exactly the bytes written before the crash.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use decentdb_error::Result;
use decentdb_types::SyncMode;

use crate::{Vfs, VfsFile};

#[derive(Debug, Default)]
struct FaultState {
    write_budget_bytes: Option<u64>,
    fail_at_write: Option<u64>,
    drop_syncs: bool,
    crash_label: Option<String>,
    crashed: bool,
    writes_seen: u64,
    syncs_seen: u64,
    syncs_dropped: u64,
}

/// Shared, programmable failure schedule.
#[derive(Debug, Default, Clone)]
pub struct FaultPlan {
    state: Arc<Mutex<FaultState>>,
}

impl FaultPlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `n` more bytes of writes, then tear and die.
    pub fn fail_write_after_bytes(&self, n: u64) {
        self.state.lock().write_budget_bytes = Some(n);
    }

    /// Fail the `n`-th write call (1-based) outright.
    pub fn fail_nth_write(&self, n: u64) {
        self.state.lock().fail_at_write = Some(n);
    }

    /// Swallow fsyncs silently from now on.
    pub fn drop_syncs(&self) {
        self.state.lock().drop_syncs = true;
    }

    /// Trip into the crashed state when `label` is reached.
    pub fn crash_at(&self, label: &str) {
        self.state.lock().crash_label = Some(label.to_owned());
    }

    /// Clear every armed fault (counters are kept).
    pub fn disarm(&self) {
        let mut st = self.state.lock();
        st.write_budget_bytes = None;
        st.fail_at_write = None;
        st.drop_syncs = false;
        st.crash_label = None;
        st.crashed = false;
    }

    #[must_use]
    pub fn writes_seen(&self) -> u64 {
        self.state.lock().writes_seen
    }

    #[must_use]
    pub fn syncs_dropped(&self) -> u64 {
        self.state.lock().syncs_dropped
    }

    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.state.lock().crashed
    }

    fn injected(kind: &str) -> decentdb_error::DecentError {
        std::io::Error::new(std::io::ErrorKind::Other, format!("injected fault: {kind}")).into()
    }
}

/// Fault-injecting wrapper VFS.
pub struct FaultyVfs<V> {
    inner: V,
    plan: FaultPlan,
}

impl<V: Vfs> FaultyVfs<V> {
    pub fn new(inner: V) -> Self {
        Self {
            inner,
            plan: FaultPlan::new(),
        }
    }

    #[must_use]
    pub fn plan(&self) -> FaultPlan {
        self.plan.clone()
    }
}

impl<V: Vfs> Vfs for FaultyVfs<V> {
    fn open(&self, path: &Path, create: bool) -> Result<Box<dyn VfsFile>> {
        if self.plan.state.lock().crashed {
            return Err(FaultPlan::injected("crashed"));
        }
        let inner = self.inner.open(path, create)?;
        Ok(Box::new(FaultyFile {
            inner,
            plan: self.plan.clone(),
        }))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.inner.delete(path)
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }
}

#[derive(Debug)]
struct FaultyFile {
    inner: Box<dyn VfsFile>,
    plan: FaultPlan,
}

impl VfsFile for FaultyFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if self.plan.state.lock().crashed {
            return Err(FaultPlan::injected("crashed"));
        }
        self.inner.read_at(offset, buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<usize> {
        let torn = {
            let mut st = self.plan.state.lock();
            if st.crashed {
                return Err(FaultPlan::injected("crashed"));
            }
            st.writes_seen += 1;
            if st.fail_at_write == Some(st.writes_seen) {
                return Err(FaultPlan::injected("write"));
            }
            match st.write_budget_bytes {
                Some(budget) if (data.len() as u64) > budget => {
                    st.write_budget_bytes = Some(0);
                    st.crashed = true;
                    Some(budget as usize)
                }
                Some(budget) => {
                    st.write_budget_bytes = Some(budget - data.len() as u64);
                    None
                }
                None => None,
            }
        };

        if let Some(keep) = torn {
            debug!(offset, keep, total = data.len(), "tearing write");
            if keep > 0 {
                let _ = self.inner.write_at(offset, &data[..keep])?;
            }
            return Err(FaultPlan::injected("torn write"));
        }
        self.inner.write_at(offset, data)
    }

    fn sync(&self, mode: SyncMode) -> Result<()> {
        {
            let mut st = self.plan.state.lock();
            if st.crashed {
                return Err(FaultPlan::injected("crashed"));
            }
            st.syncs_seen += 1;
            if st.drop_syncs {
                st.syncs_dropped += 1;
                return Ok(());
            }
        }
        self.inner.sync(mode)
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, new_len: u64) -> Result<()> {
        if self.plan.state.lock().crashed {
            return Err(FaultPlan::injected("crashed"));
        }
        self.inner.truncate(new_len)
    }

    fn fault_point(&self, label: &str) -> Result<()> {
        let mut st = self.plan.state.lock();
        if st.crashed {
            return Err(FaultPlan::injected("crashed"));
        }
        if st.crash_label.as_deref() == Some(label) {
            st.crashed = true;
            debug!(label, "crash point tripped");
            return Err(FaultPlan::injected("crash point"));
        }
        Ok(())
    }
}
