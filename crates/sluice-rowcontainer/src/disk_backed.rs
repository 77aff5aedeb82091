use std::collections::VecDeque;
use std::sync::Arc;

use error_stack::ResultExt;
use sluice_core::{ColumnType, Row};
use sluice_mon::{BoundAccount, BytesMonitor};

use crate::disk_store::DiskRowStore;
use crate::{Error, TempStorage};

/// An append-only sequence of rows kept in memory until the memory account
/// refuses to grow, and on disk from then on.
///
/// Rows are always read in insertion order. Once the container has spilled,
/// every later row is written to disk as well.
pub struct DiskBackedRowContainer {
    types: Vec<ColumnType>,
    mem_rows: VecDeque<Row>,
    mem_account: BoundAccount,
    disk_monitor: Arc<BytesMonitor>,
    temp_storage: Arc<TempStorage>,
    disk: Option<DiskRowStore>,
    closed: bool,
}

impl std::fmt::Debug for DiskBackedRowContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskBackedRowContainer")
            .field("mem_rows", &self.mem_rows.len())
            .field("mem_bytes", &self.mem_account.used())
            .field("disk_rows", &self.disk.as_ref().map(DiskRowStore::len))
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl DiskBackedRowContainer {
    pub fn new(
        types: Vec<ColumnType>,
        mem_monitor: &Arc<BytesMonitor>,
        disk_monitor: &Arc<BytesMonitor>,
        temp_storage: Arc<TempStorage>,
    ) -> Self {
        Self {
            types,
            mem_rows: VecDeque::new(),
            mem_account: mem_monitor.make_bound_account(),
            disk_monitor: disk_monitor.clone(),
            temp_storage,
            disk: None,
            closed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.mem_rows.len() + self.disk.as_ref().map_or(0, DiskRowStore::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether rows were ever written to disk.
    pub fn spilled(&self) -> bool {
        self.disk.is_some()
    }

    pub fn mem_bytes(&self) -> u64 {
        self.mem_account.used()
    }

    pub fn disk_bytes(&self) -> u64 {
        self.disk.as_ref().map_or(0, DiskRowStore::disk_bytes)
    }

    pub fn add(&mut self, row: Row) -> error_stack::Result<(), Error> {
        error_stack::ensure!(!self.closed, Error::Closed);
        if let Some(disk) = &mut self.disk {
            return disk.add(&row);
        }

        let size = row.mem_size() as u64;
        match self.mem_account.grow(size) {
            Ok(()) => {
                self.mem_rows.push_back(row);
                Ok(())
            }
            Err(report) => {
                let over_budget = matches!(
                    report.current_context(),
                    sluice_mon::Error::BudgetExceeded { .. }
                );
                if !over_budget {
                    return Err(report.change_context(Error::MemoryBudget));
                }
                self.spill_to_disk()?;
                self.add(row)
            }
        }
    }

    fn spill_to_disk(&mut self) -> error_stack::Result<(), Error> {
        tracing::debug!(
            "Spilling {} rows ({} bytes) to disk",
            self.mem_rows.len(),
            self.mem_account.used()
        );
        let mut disk = DiskRowStore::new(
            &self.temp_storage,
            self.types.clone(),
            self.disk_monitor.make_bound_account(),
        )?;
        for row in &self.mem_rows {
            disk.add(row)?;
        }
        self.mem_rows.clear();
        self.mem_account.clear();
        self.disk = Some(disk);
        Ok(())
    }

    /// Returns an iterator that removes rows from the front as it yields them.
    ///
    /// Rows not reached before the iterator is dropped stay in the container.
    pub fn new_final_iterator(&mut self) -> FinalIterator<'_> {
        FinalIterator { container: self }
    }

    /// Releases all memory and disk. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.mem_rows.clear();
        self.mem_account.close();
        if let Some(disk) = &mut self.disk {
            disk.close();
        }
    }
}

/// Consuming iterator over a [DiskBackedRowContainer].
pub struct FinalIterator<'a> {
    container: &'a mut DiskBackedRowContainer,
}

impl<'a> Iterator for FinalIterator<'a> {
    type Item = error_stack::Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let container = &mut *self.container;
        if let Some(row) = container.mem_rows.pop_front() {
            container.mem_account.shrink(row.mem_size() as u64);
            return Some(Ok(row));
        }
        container.disk.as_mut()?.next_row().transpose()
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::Datum;
    use sluice_mon::MonitorResource;

    use super::*;

    fn int_row(i: i64) -> Row {
        Row::new(vec![Datum::Int(i), Datum::String(format!("row {i}"))])
    }

    fn container(mem_limit: Option<u64>) -> (DiskBackedRowContainer, Arc<BytesMonitor>) {
        sluice_testing::init_test_logging();
        let mem = BytesMonitor::new_root("test-mem", MonitorResource::Memory, mem_limit);
        let disk = BytesMonitor::new_root("test-disk", MonitorResource::Disk, None);
        let temp = TempStorage::new(None).unwrap();
        let container = DiskBackedRowContainer::new(
            vec![ColumnType::Int, ColumnType::String],
            &mem,
            &disk,
            temp,
        );
        (container, disk)
    }

    #[test]
    fn test_in_memory() {
        let (mut container, disk) = container(None);
        for i in 0..10 {
            container.add(int_row(i)).unwrap();
        }
        assert!(!container.spilled());
        let rows: Vec<_> = container
            .new_final_iterator()
            .map(Result::unwrap)
            .collect();
        assert_eq!(rows, (0..10).map(int_row).collect::<Vec<_>>());
        assert_eq!(container.mem_bytes(), 0);
        assert_eq!(disk.allocated(), 0);
    }

    #[test]
    fn test_spill_preserves_order() {
        let limit = 3 * int_row(0).mem_size() as u64;
        let (mut container, disk) = container(Some(limit));
        for i in 0..10 {
            container.add(int_row(i)).unwrap();
        }
        assert!(container.spilled());
        assert_eq!(container.len(), 10);
        assert_eq!(container.mem_bytes(), 0);
        assert!(disk.allocated() > 0);

        let first: Vec<_> = container
            .new_final_iterator()
            .take(4)
            .map(Result::unwrap)
            .collect();
        assert_eq!(first, (0..4).map(int_row).collect::<Vec<_>>());

        // Interleave more writes with the remaining reads.
        container.add(int_row(10)).unwrap();
        let rest: Vec<_> = container
            .new_final_iterator()
            .map(Result::unwrap)
            .collect();
        assert_eq!(rest, (4..11).map(int_row).collect::<Vec<_>>());
        assert!(container.is_empty());

        // Reading everything truncates the file.
        assert_eq!(disk.allocated(), 0);
        container.add(int_row(11)).unwrap();
        assert_eq!(
            container.new_final_iterator().next().unwrap().unwrap(),
            int_row(11)
        );
    }

    #[test]
    fn test_disk_budget_exhausted() {
        let mem = BytesMonitor::new_root("test-mem", MonitorResource::Memory, Some(1));
        let disk = BytesMonitor::new_root("test-disk", MonitorResource::Disk, Some(10));
        let temp = TempStorage::new(None).unwrap();
        let mut container =
            DiskBackedRowContainer::new(vec![ColumnType::Int, ColumnType::String], &mem, &disk, temp);
        let err = container.add(int_row(1)).unwrap_err();
        assert!(matches!(err.current_context(), Error::DiskBudget));
    }

    #[test]
    fn test_close_is_idempotent() {
        let limit = int_row(0).mem_size() as u64;
        let (mut container, disk) = container(Some(limit));
        container.add(int_row(0)).unwrap();
        container.add(int_row(1)).unwrap();
        container.close();
        container.close();
        assert_eq!(disk.allocated(), 0);
        assert!(matches!(
            container.add(int_row(2)).unwrap_err().current_context(),
            Error::Closed
        ));
    }
}
