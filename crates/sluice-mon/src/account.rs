use std::sync::Arc;

use crate::{BytesMonitor, Error};

/// A running total of bytes reserved from a single monitor.
///
/// Dropping the account returns its bytes.
#[derive(Debug)]
pub struct BoundAccount {
    monitor: Arc<BytesMonitor>,
    used: u64,
}

impl BoundAccount {
    pub(crate) fn new(monitor: Arc<BytesMonitor>) -> Self {
        Self { monitor, used: 0 }
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn monitor(&self) -> &Arc<BytesMonitor> {
        &self.monitor
    }

    /// Reserves `bytes` more. On failure nothing is reserved.
    pub fn grow(&mut self, bytes: u64) -> error_stack::Result<(), Error> {
        self.monitor.reserve(bytes)?;
        self.used += bytes;
        Ok(())
    }

    pub fn shrink(&mut self, bytes: u64) {
        let bytes = bytes.min(self.used);
        self.monitor.release(bytes);
        self.used -= bytes;
    }

    /// Adjusts the reservation from `old` to `new` bytes.
    pub fn resize(&mut self, old: u64, new: u64) -> error_stack::Result<(), Error> {
        if new > old {
            self.grow(new - old)
        } else {
            self.shrink(old - new);
            Ok(())
        }
    }

    /// Returns every reserved byte, keeping the account usable.
    pub fn clear(&mut self) {
        self.shrink(self.used);
    }

    pub fn close(&mut self) {
        self.clear();
    }
}

impl Drop for BoundAccount {
    fn drop(&mut self) {
        self.clear();
    }
}
