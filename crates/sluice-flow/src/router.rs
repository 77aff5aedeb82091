use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use error_stack::ResultExt;
use sluice_core::{AtomicConsumerStatus, ColumnType, ConsumerStatus, ProducerMetadata, Row};
use sluice_execinfra::{FlowCtx, RouterOutputStats, RowMessage, RowReceiver};
use sluice_physical::OutputRouterSpec;
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::error::error_metadata;
use crate::{Error, StartCtx, Startable};

mod output;
mod strategy;

use output::{RouterOutput, OUTPUT_BATCH_ROWS};
pub(crate) use strategy::{hash_bucket_of, Destination, RouterStrategy};

/// Fans the rows of one producer out to several streams.
///
/// The producer pushes into the router; each output buffers its rows and is
/// drained by its own task. A semaphore shared by the output tasks is also
/// taken by the producer every few rows, so the producer blocks when every
/// output is blocked downstream.
pub struct Router {
    name: &'static str,
    flow_ctx: Arc<FlowCtx>,
    strategy: RouterStrategy,
    outputs: Vec<RouterOutput>,
    semaphore: Semaphore,
    semaphore_period: usize,
    num_rows: AtomicUsize,
    aggregated_status: AtomicConsumerStatus,
    /// Outputs whose status is still `NeedMoreRows`.
    num_non_draining: AtomicUsize,
    /// Outputs whose status is not `ConsumerClosed`.
    num_open: AtomicUsize,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("outputs", &self.outputs)
            .field("aggregated_status", &self.aggregated_status)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Creates a router for `spec` feeding `receivers`, one per stream.
    pub fn try_new(
        flow_ctx: Arc<FlowCtx>,
        spec: &OutputRouterSpec,
        receivers: Vec<Arc<dyn RowReceiver>>,
        types: &[ColumnType],
    ) -> error_stack::Result<Arc<Self>, Error> {
        let strategy = RouterStrategy::try_new(spec)?;
        debug_assert_eq!(spec.streams.len(), receivers.len());

        let outputs: Vec<_> = spec
            .streams
            .iter()
            .zip(receivers)
            .map(|(stream, receiver)| {
                RouterOutput::new(&flow_ctx, stream.stream_id, receiver, types)
            })
            .collect();
        let permits = if spec.disable_buffering {
            1
        } else {
            outputs.len()
        };

        Ok(Arc::new(Self {
            name: spec.router.name(),
            semaphore_period: flow_ctx.semaphore_period(),
            flow_ctx,
            strategy,
            semaphore: Semaphore::new(permits),
            num_rows: AtomicUsize::new(0),
            aggregated_status: AtomicConsumerStatus::new(ConsumerStatus::NeedMoreRows),
            num_non_draining: AtomicUsize::new(outputs.len()),
            num_open: AtomicUsize::new(outputs.len()),
            outputs,
        }))
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// The status reported to the producer.
    pub fn aggregated_status(&self) -> ConsumerStatus {
        self.aggregated_status.load()
    }

    /// Whether output `index` has spilled rows to disk.
    pub fn output_spilled(&self, index: usize) -> bool {
        self.outputs.get(index).map_or(false, RouterOutput::spilled)
    }

    fn route_row(&self, row: Row) -> error_stack::Result<(), Error> {
        match self.strategy.route(&row, self.outputs.len())? {
            Destination::One(index) => self.add_row(index, row),
            Destination::All => {
                let (last, rest) = self.outputs.split_last().ok_or(Error::NoStreams)?;
                for output in rest {
                    output
                        .add_row(row.clone())
                        .change_context(Error::RouterBuffer(output.stream_id))?;
                }
                last.add_row(row)
                    .change_context(Error::RouterBuffer(last.stream_id))
            }
        }
    }

    fn add_row(&self, index: usize, row: Row) -> error_stack::Result<(), Error> {
        let output = &self.outputs[index];
        output
            .add_row(row)
            .change_context(Error::RouterBuffer(output.stream_id))
    }

    /// Sends `meta` to the first output that is not closed.
    fn fwd_metadata(&self, mut meta: ProducerMetadata) {
        for output in &self.outputs {
            match output.add_metadata(meta) {
                Ok(()) => return,
                Err(rejected) => meta = rejected,
            }
        }
        tracing::debug!(
            "Dropping {} metadata, every output is closed",
            meta.kind_name()
        );
        self.aggregated_status.advance(ConsumerStatus::ConsumerClosed);
    }

    /// Records that an output's downstream moved from `current` to `new`.
    fn update_stream_state(&self, current: &mut ConsumerStatus, new: ConsumerStatus) {
        if new <= *current {
            return;
        }
        if *current == ConsumerStatus::NeedMoreRows
            && self.num_non_draining.fetch_sub(1, Ordering::AcqRel) == 1
        {
            let _ = self
                .aggregated_status
                .compare_exchange(ConsumerStatus::NeedMoreRows, ConsumerStatus::DrainRequested);
        }
        if new == ConsumerStatus::ConsumerClosed
            && self.num_open.fetch_sub(1, Ordering::AcqRel) == 1
        {
            self.aggregated_status.advance(ConsumerStatus::ConsumerClosed);
        }
        *current = new;
    }

    async fn run_output(self: Arc<Self>, index: usize) {
        let output = &self.outputs[index];
        let started = Instant::now();
        let mut status = ConsumerStatus::NeedMoreRows;
        let mut rows = Vec::with_capacity(OUTPUT_BATCH_ROWS);

        enum Work {
            Meta(ProducerMetadata),
            Rows,
            PopFailed(error_stack::Report<sluice_rowcontainer::Error>),
            Done,
            Wait,
        }

        loop {
            let work = {
                let mut state = output.state.lock();
                state.status = status;
                if let Some(meta) = state.metadata.pop_front() {
                    Work::Meta(meta)
                } else if status == ConsumerStatus::ConsumerClosed {
                    Work::Done
                } else if status == ConsumerStatus::NeedMoreRows {
                    match state.pop_rows(&mut rows, OUTPUT_BATCH_ROWS) {
                        Err(report) => Work::PopFailed(report),
                        Ok(()) if !rows.is_empty() => Work::Rows,
                        Ok(()) if state.producer_done => Work::Done,
                        Ok(()) => Work::Wait,
                    }
                } else if state.producer_done {
                    Work::Done
                } else {
                    Work::Wait
                }
            };

            match work {
                Work::Meta(meta) => {
                    let new = self
                        .flow_ctx
                        .or_canceled(async {
                            let _permit = self.semaphore.acquire().await.ok();
                            output.receiver.push(RowMessage::Meta(meta)).await
                        })
                        .await
                        .unwrap_or(ConsumerStatus::ConsumerClosed);
                    self.update_stream_state(&mut status, new);
                }
                Work::Rows => {
                    let acquired = self.flow_ctx.or_canceled(self.semaphore.acquire()).await;
                    let Some(_permit) = acquired else {
                        rows.clear();
                        self.update_stream_state(&mut status, ConsumerStatus::ConsumerClosed);
                        continue;
                    };
                    let mut routed = 0;
                    for row in rows.drain(..) {
                        if status != ConsumerStatus::NeedMoreRows {
                            break;
                        }
                        let new = self
                            .flow_ctx
                            .or_canceled(output.receiver.push(RowMessage::Row(row)))
                            .await
                            .unwrap_or(ConsumerStatus::ConsumerClosed);
                        self.update_stream_state(&mut status, new);
                        routed += 1;
                    }
                    rows.clear();
                    output.state.lock().rows_routed += routed;
                }
                Work::PopFailed(report) => {
                    let report = report.change_context(Error::RouterBuffer(output.stream_id));
                    tracing::warn!("Router output failed to read buffered rows: {report:?}");
                    self.fwd_metadata(error_metadata(&report));
                    self.aggregated_status.advance(ConsumerStatus::DrainRequested);
                    self.update_stream_state(&mut status, ConsumerStatus::DrainRequested);
                }
                Work::Done => break,
                Work::Wait => {
                    tokio::select! {
                        _ = output.wakeup.notified() => {}
                        _ = self.flow_ctx.cancel.cancelled() => {
                            tracing::debug!("Router output canceled");
                            self.update_stream_state(&mut status, ConsumerStatus::ConsumerClosed);
                        }
                    }
                }
            }
        }

        let rows_routed = {
            let mut state = output.state.lock();
            state.status = ConsumerStatus::ConsumerClosed;
            state.ring.clear();
            state.container.close();
            state.rows_routed
        };

        if self.flow_ctx.collect_stats && status != ConsumerStatus::ConsumerClosed {
            let stats = RouterOutputStats {
                rows_routed,
                max_mem_bytes: output.mem_monitor.max_allocated(),
                max_disk_bytes: output.disk_monitor.max_allocated(),
            };
            let span = stats.to_span(output.stream_id, started.elapsed());
            let new = self
                .flow_ctx
                .or_canceled(async {
                    let _permit = self.semaphore.acquire().await.ok();
                    output
                        .receiver
                        .push(RowMessage::Meta(ProducerMetadata::TraceData(vec![span])))
                        .await
                })
                .await
                .unwrap_or(ConsumerStatus::ConsumerClosed);
            self.update_stream_state(&mut status, new);
        }
        output.receiver.producer_done();

        output.mem_monitor.stop();
        output.disk_monitor.stop();
        tracing::trace!(rows_routed, "Router output done");
    }
}

#[async_trait::async_trait]
impl RowReceiver for Router {
    async fn push(&self, msg: RowMessage) -> ConsumerStatus {
        let row = match msg {
            RowMessage::Meta(meta) => {
                self.fwd_metadata(meta);
                return self.aggregated_status.load();
            }
            RowMessage::Row(row) => row,
        };

        let status = self.aggregated_status.load();
        if status != ConsumerStatus::NeedMoreRows {
            return status;
        }

        let _permit = if self.num_rows.fetch_add(1, Ordering::Relaxed) % self.semaphore_period == 0 {
            let Some(permit) = self.flow_ctx.or_canceled(self.semaphore.acquire()).await else {
                self.aggregated_status.advance(ConsumerStatus::ConsumerClosed);
                return ConsumerStatus::ConsumerClosed;
            };
            permit.ok()
        } else {
            None
        };

        if let Err(report) = self.route_row(row) {
            tracing::warn!("{} router failed to route row: {report:?}", self.name);
            self.fwd_metadata(error_metadata(&report));
            let status = match report.current_context() {
                Error::RouterBuffer(_) => ConsumerStatus::DrainRequested,
                _ => ConsumerStatus::ConsumerClosed,
            };
            self.aggregated_status.advance(status);
        }
        self.aggregated_status.load()
    }

    fn producer_done(&self) {
        for output in &self.outputs {
            output.set_producer_done();
        }
    }
}

impl Startable for Arc<Router> {
    fn start(self: Box<Self>, ctx: &StartCtx) {
        let router = *self;
        for (index, output) in router.outputs.iter().enumerate() {
            let span = tracing::debug_span!(
                "router output",
                flow_id = %ctx.flow_ctx.id,
                router = router.name,
                stream_id = %output.stream_id,
            );
            ctx.spawn(
                format!("router output {}", output.stream_id),
                router.clone().run_output(index).instrument(span),
            );
        }
    }
}
