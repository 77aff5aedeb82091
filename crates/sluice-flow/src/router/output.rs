use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{ConsumerStatus, ProducerMetadata, Row, StreamId};
use sluice_execinfra::{FlowCtx, RowReceiver};
use sluice_mon::BytesMonitor;
use sluice_rowcontainer::DiskBackedRowContainer;
use tokio::sync::Notify;

/// Rows held in memory per output before older rows move to the row
/// container.
pub(crate) const OUTPUT_RING_SIZE: usize = 16;

/// Rows popped per lock acquisition by an output task.
pub(crate) const OUTPUT_BATCH_ROWS: usize = 16;

/// One downstream stream of a router.
pub(crate) struct RouterOutput {
    pub stream_id: StreamId,
    pub receiver: Arc<dyn RowReceiver>,
    pub state: Mutex<OutputState>,
    /// Wakes the output task when rows, metadata or producer-done arrive.
    pub wakeup: Notify,
    pub mem_monitor: Arc<BytesMonitor>,
    pub disk_monitor: Arc<BytesMonitor>,
}

/// Buffers of an output.
///
/// Rows live in a small ring and, once it is full, the oldest go to the row
/// container. If the ring is not full the container is empty, so rows are
/// read container first.
pub(crate) struct OutputState {
    /// Last status returned by the downstream receiver.
    pub status: ConsumerStatus,
    pub ring: VecDeque<Row>,
    pub container: DiskBackedRowContainer,
    pub metadata: VecDeque<ProducerMetadata>,
    pub producer_done: bool,
    pub rows_routed: u64,
}

impl std::fmt::Debug for RouterOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterOutput")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl RouterOutput {
    pub fn new(
        flow_ctx: &FlowCtx,
        stream_id: StreamId,
        receiver: Arc<dyn RowReceiver>,
        types: &[sluice_core::ColumnType],
    ) -> Self {
        let mem_monitor = flow_ctx.new_limited_monitor(format!("router-limited-{stream_id}"));
        let disk_monitor = flow_ctx
            .disk_monitor
            .new_child(format!("router-disk-{stream_id}"), None);
        let container = DiskBackedRowContainer::new(
            types.to_vec(),
            &mem_monitor,
            &disk_monitor,
            flow_ctx.cfg.temp_storage.clone(),
        );
        Self {
            stream_id,
            receiver,
            state: Mutex::new(OutputState {
                status: ConsumerStatus::NeedMoreRows,
                ring: VecDeque::with_capacity(OUTPUT_RING_SIZE),
                container,
                metadata: VecDeque::new(),
                producer_done: false,
                rows_routed: 0,
            }),
            wakeup: Notify::new(),
            mem_monitor,
            disk_monitor,
        }
    }

    /// Buffers `row`, dropping it if the output no longer accepts rows.
    pub fn add_row(&self, row: Row) -> error_stack::Result<(), sluice_rowcontainer::Error> {
        let mut state = self.state.lock();
        if state.status != ConsumerStatus::NeedMoreRows {
            return Ok(());
        }
        if state.ring.len() == OUTPUT_RING_SIZE {
            if let Some(oldest) = state.ring.pop_front() {
                state.container.add(oldest)?;
            }
        }
        state.ring.push_back(row);
        drop(state);
        self.wakeup.notify_one();
        Ok(())
    }

    /// Queues `meta` unless the output is closed, in which case it is
    /// handed back.
    pub fn add_metadata(&self, meta: ProducerMetadata) -> Result<(), ProducerMetadata> {
        let mut state = self.state.lock();
        if state.status == ConsumerStatus::ConsumerClosed {
            return Err(meta);
        }
        state.metadata.push_back(meta);
        drop(state);
        self.wakeup.notify_one();
        Ok(())
    }

    pub fn set_producer_done(&self) {
        self.state.lock().producer_done = true;
        self.wakeup.notify_one();
    }

    pub fn spilled(&self) -> bool {
        self.state.lock().container.spilled()
    }
}

impl OutputState {
    /// Pops up to `max` of the oldest rows into `buf`.
    pub fn pop_rows(
        &mut self,
        buf: &mut Vec<Row>,
        max: usize,
    ) -> error_stack::Result<(), sluice_rowcontainer::Error> {
        if !self.container.is_empty() {
            for row in self.container.new_final_iterator().take(max) {
                buf.push(row?);
            }
        }
        while buf.len() < max {
            match self.ring.pop_front() {
                Some(row) => buf.push(row),
                None => break,
            }
        }
        Ok(())
    }
}
