use std::sync::Arc;

use parking_lot::Mutex;

use crate::{BoundAccount, Error};

/// What a monitor accounts for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum MonitorResource {
    #[display(fmt = "memory")]
    Memory,
    #[display(fmt = "disk")]
    Disk,
}

/// Tracks bytes allocated by a component and its children.
#[derive(Debug)]
pub struct BytesMonitor {
    name: String,
    resource: MonitorResource,
    /// Maximum bytes this monitor may hand out. `None` means unlimited.
    limit: Option<u64>,
    parent: Option<Arc<BytesMonitor>>,
    state: Mutex<MonitorState>,
}

#[derive(Debug, Default)]
struct MonitorState {
    allocated: u64,
    max_allocated: u64,
    stopped: bool,
}

impl BytesMonitor {
    pub fn new_root(
        name: impl Into<String>,
        resource: MonitorResource,
        limit: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            resource,
            limit,
            parent: None,
            state: Mutex::default(),
        })
    }

    /// Creates a monitor drawing its bytes from `self`.
    pub fn new_child(self: &Arc<Self>, name: impl Into<String>, limit: Option<u64>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            resource: self.resource,
            limit,
            parent: Some(self.clone()),
            state: Mutex::default(),
        })
    }

    pub fn make_bound_account(self: &Arc<Self>) -> BoundAccount {
        BoundAccount::new(self.clone())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource(&self) -> MonitorResource {
        self.resource
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }

    /// The largest number of bytes allocated at any point.
    pub fn max_allocated(&self) -> u64 {
        self.state.lock().max_allocated
    }

    pub(crate) fn reserve(&self, bytes: u64) -> error_stack::Result<(), Error> {
        if bytes == 0 {
            return Ok(());
        }

        // Locks are taken child first, then parent, so the order is always
        // leaf to root.
        let mut state = self.state.lock();
        error_stack::ensure!(!state.stopped, Error::Stopped(self.name.clone()));
        if let Some(limit) = self.limit {
            error_stack::ensure!(
                state.allocated + bytes <= limit,
                Error::BudgetExceeded {
                    monitor: self.name.clone(),
                    resource: self.resource,
                    requested: bytes,
                    allocated: state.allocated,
                    limit,
                }
            );
        }
        if let Some(parent) = &self.parent {
            parent.reserve(bytes)?;
        }
        state.allocated += bytes;
        state.max_allocated = state.max_allocated.max(state.allocated);
        Ok(())
    }

    pub(crate) fn release(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let mut state = self.state.lock();
        debug_assert!(
            state.allocated >= bytes,
            "monitor '{}' releasing {bytes} bytes with only {} allocated",
            self.name,
            state.allocated
        );
        let released = bytes.min(state.allocated);
        state.allocated -= released;
        if let Some(parent) = &self.parent {
            parent.release(released);
        }
    }

    /// Stops the monitor. Further reservations fail.
    ///
    /// Bytes still allocated at this point are leaked by some account; they
    /// are reported and returned to the parent.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        if state.allocated > 0 {
            tracing::warn!(
                "{} monitor '{}' stopped with {} bytes still allocated",
                self.resource,
                self.name,
                state.allocated
            );
            if let Some(parent) = &self.parent {
                parent.release(state.allocated);
            }
            state.allocated = 0;
        }
        tracing::trace!(
            "{} monitor '{}' stopped, max allocated {} bytes",
            self.resource,
            self.name,
            state.max_allocated
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_reserves_in_parent() {
        let root = BytesMonitor::new_root("root", MonitorResource::Memory, Some(100));
        let child = root.new_child("child", None);
        let mut account = child.make_bound_account();

        account.grow(60).unwrap();
        assert_eq!(child.allocated(), 60);
        assert_eq!(root.allocated(), 60);

        let err = account.grow(50).unwrap_err();
        assert!(matches!(
            err.current_context(),
            Error::BudgetExceeded { limit: 100, .. }
        ));
        assert_eq!(child.allocated(), 60);

        account.close();
        assert_eq!(root.allocated(), 0);
        assert_eq!(child.max_allocated(), 60);
    }

    #[test]
    fn test_child_limit() {
        let root = BytesMonitor::new_root("root", MonitorResource::Disk, None);
        let child = root.new_child("child", Some(10));
        let mut account = child.make_bound_account();
        assert!(account.grow(11).is_err());
        assert_eq!(root.allocated(), 0);
    }

    #[test]
    fn test_stop_returns_leaked_bytes() {
        let root = BytesMonitor::new_root("root", MonitorResource::Memory, None);
        let child = root.new_child("child", None);
        let mut account = child.make_bound_account();
        account.grow(10).unwrap();
        child.stop();
        assert_eq!(root.allocated(), 0);
        assert!(matches!(
            account.grow(1).unwrap_err().current_context(),
            Error::Stopped(_)
        ));
        std::mem::forget(account);
    }
}
