use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sluice_core::{ConsumerStatus, ProcessorId, ProducerMetadata, RecordedSpan, StreamId};

use crate::{RowMessage, RowReceiver};

pub const STAT_ROUTER_OUTPUT_ROWS_ROUTED: &str = "sluice.stat.routeroutput.rows_routed";
pub const STAT_ROUTER_OUTPUT_MEM_MAX: &str = "sluice.stat.routeroutput.mem.max";
pub const STAT_ROUTER_OUTPUT_DISK_MAX: &str = "sluice.stat.routeroutput.disk.max";
pub const STAT_PROCESSOR_ROWS_EMITTED: &str = "sluice.stat.processor.rows_emitted";
pub const STAT_PROCESSOR_STALL_TIME: &str = "sluice.stat.processor.stall_time_us";

/// Summary stats of one router output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouterOutputStats {
    pub rows_routed: u64,
    pub max_mem_bytes: u64,
    pub max_disk_bytes: u64,
}

impl RouterOutputStats {
    pub fn to_span(&self, stream_id: StreamId, duration: Duration) -> RecordedSpan {
        RecordedSpan {
            operation: format!("router output {stream_id}"),
            tags: BTreeMap::from([
                ("stream_id".to_owned(), stream_id.to_string()),
                (
                    STAT_ROUTER_OUTPUT_ROWS_ROUTED.to_owned(),
                    self.rows_routed.to_string(),
                ),
                (
                    STAT_ROUTER_OUTPUT_MEM_MAX.to_owned(),
                    self.max_mem_bytes.to_string(),
                ),
                (
                    STAT_ROUTER_OUTPUT_DISK_MAX.to_owned(),
                    self.max_disk_bytes.to_string(),
                ),
            ]),
            duration_micros: duration.as_micros() as u64,
        }
    }
}

/// Wraps a processor's output to count rows and time spent blocked in push.
///
/// `producer_done` is held back until [StatsRowReceiver::finish] has pushed
/// the processor's span.
pub struct StatsRowReceiver {
    inner: Arc<dyn RowReceiver>,
    started: Instant,
    rows: AtomicU64,
    stall_micros: AtomicU64,
    closed: AtomicBool,
}

impl StatsRowReceiver {
    pub fn new(inner: Arc<dyn RowReceiver>) -> Self {
        Self {
            inner,
            started: Instant::now(),
            rows: AtomicU64::new(0),
            stall_micros: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn processor_span(&self, id: ProcessorId) -> RecordedSpan {
        RecordedSpan {
            operation: format!("processor {id}"),
            tags: BTreeMap::from([
                ("processor_id".to_owned(), id.to_string()),
                (STAT_PROCESSOR_ROWS_EMITTED.to_owned(), self.rows().to_string()),
                (
                    STAT_PROCESSOR_STALL_TIME.to_owned(),
                    self.stall_micros.load(Ordering::Relaxed).to_string(),
                ),
            ]),
            duration_micros: self.started.elapsed().as_micros() as u64,
        }
    }

    /// Pushes `span` unless the consumer is closed, then signals
    /// producer-done.
    pub async fn finish(&self, span: RecordedSpan) {
        if !self.closed.load(Ordering::Acquire) {
            self.inner
                .push(RowMessage::Meta(ProducerMetadata::TraceData(vec![span])))
                .await;
        }
        self.inner.producer_done();
    }
}

#[async_trait::async_trait]
impl RowReceiver for StatsRowReceiver {
    async fn push(&self, msg: RowMessage) -> ConsumerStatus {
        let is_row = msg.is_row();
        let start = Instant::now();
        let status = self.inner.push(msg).await;
        self.stall_micros
            .fetch_add(start.elapsed().as_micros() as u64, Ordering::Relaxed);
        if is_row {
            self.rows.fetch_add(1, Ordering::Relaxed);
        }
        if status == ConsumerStatus::ConsumerClosed {
            self.closed.store(true, Ordering::Release);
        }
        status
    }

    fn producer_done(&self) {}
}
