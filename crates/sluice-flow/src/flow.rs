use std::future::Future;
use std::sync::Arc;

use hashbrown::HashMap;
use sluice_core::{FlowId, MetadataError};
use sluice_execinfra::{push_error_and_finish, FlowCtx, RowReceiver, ServerConfig};
use sluice_physical::FlowSpec;
use tracing::Instrument;

use crate::error::error_metadata;
use crate::pending::{spawn_participant, PendingSet};
use crate::setup::{setup_flow, FlowParts, ScheduledProcessor};
use crate::{Error, FlowRegistry, FlowSetupOptions, InboundStreamInfo, StartCtx};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowStatus {
    NotStarted,
    Running,
    Finished,
}

type DoneFn = Box<dyn FnOnce(FlowId) + Send>;

/// The portion of a query running on this node.
///
/// A flow is set up from its spec, started, waited for and cleaned up. Its
/// processors, router outputs, outboxes and inbound streams all count
/// towards the flow's pending set; the flow is done once that set is empty.
pub struct Flow {
    ctx: Arc<FlowCtx>,
    registry: Arc<FlowRegistry>,
    parts: FlowParts,
    sync_consumer: Option<Arc<dyn RowReceiver>>,
    pending: Arc<PendingSet>,
    status: FlowStatus,
    registered: bool,
    /// A setup error to report to the sync consumer once started.
    setup_error: Option<error_stack::Report<Error>>,
    done_fn: Option<DoneFn>,
    local: bool,
    span: tracing::Span,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.ctx.id)
            .field("status", &self.status)
            .field("parts", &self.parts)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

type Result<T> = error_stack::Result<T, Error>;

impl Flow {
    /// Sets up a flow without starting anything.
    ///
    /// With a sync consumer, setup errors are delivered to that consumer
    /// when the flow starts instead of being returned.
    pub fn setup(
        cfg: Arc<ServerConfig>,
        registry: Arc<FlowRegistry>,
        spec: &FlowSpec,
        sync_consumer: Option<Arc<dyn RowReceiver>>,
        options: &FlowSetupOptions,
    ) -> Result<Self> {
        let ctx = Arc::new(FlowCtx::new(spec.flow_id, cfg, options.collect_stats));
        let span = tracing::info_span!("flow", flow_id = %spec.flow_id, node_id = %ctx.node_id());

        let (parts, setup_error) = match span.in_scope(|| {
            setup_flow(&ctx, spec, sync_consumer.as_ref(), options)
        }) {
            Ok(parts) => (parts, None),
            Err(report) if sync_consumer.is_some() => {
                tracing::warn!(parent: &span, "Flow setup failed: {report:?}");
                (FlowParts::default(), Some(report))
            }
            Err(report) => return Err(report),
        };

        let local = parts.inbound_streams.is_empty();
        Ok(Self {
            ctx,
            registry,
            parts,
            sync_consumer,
            pending: Arc::new(PendingSet::default()),
            status: FlowStatus::NotStarted,
            registered: false,
            setup_error,
            done_fn: None,
            local,
            span,
        })
    }

    /// Sets a callback run once the flow is cleaned up.
    pub fn with_done_fn(mut self, done_fn: impl FnOnce(FlowId) + Send + 'static) -> Self {
        self.done_fn = Some(Box::new(done_fn));
        self
    }

    pub fn id(&self) -> FlowId {
        self.ctx.id
    }

    pub fn ctx(&self) -> &Arc<FlowCtx> {
        &self.ctx
    }

    pub fn status(&self) -> FlowStatus {
        self.status
    }

    /// Whether the flow has no inbound streams. Local flows are not
    /// registered, so nothing can connect to them and drains don't wait for
    /// them.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Number of processors, router outputs, outboxes and inbound streams
    /// still running.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    /// Registers the flow and starts every processor in its own task.
    pub async fn start(&mut self) -> Result<()> {
        self.start_internal(false).await.map(|_| ())
    }

    /// Starts the flow, runs its last processor in the calling task and
    /// waits for the rest.
    pub async fn run(&mut self) -> Result<()> {
        if let Some(last) = self.start_internal(true).await? {
            let ScheduledProcessor {
                id,
                processor,
                output,
            } = last;
            processor
                .run(self.ctx.clone(), output, id)
                .instrument(self.span.clone())
                .await;
        }
        self.wait().await;
        Ok(())
    }

    async fn start_internal(&mut self, run_last_inline: bool) -> Result<Option<ScheduledProcessor>> {
        debug_assert_eq!(self.status, FlowStatus::NotStarted, "flow started twice");
        error_stack::ensure!(
            self.status == FlowStatus::NotStarted,
            Error::Panic(format!("flow {} started twice", self.ctx.id))
        );
        self.status = FlowStatus::Running;

        if let Some(report) = self.setup_error.take() {
            report_error(self.sync_consumer.clone(), &report).await;
            return Ok(None);
        }

        if !self.local {
            let inbound_streams: HashMap<_, _> = self
                .parts
                .inbound_streams
                .iter()
                .map(|(stream_id, handler)| {
                    let participant = self.pending.add_pending(format!("inbound stream {stream_id}"));
                    (*stream_id, InboundStreamInfo::new(handler.clone(), participant))
                })
                .collect();
            let timeout = self.ctx.settings().flow_stream_timeout;
            if let Err(report) = self
                .registry
                .register_flow(self.ctx.clone(), inbound_streams, timeout)
            {
                if self.sync_consumer.is_some() {
                    report_error(self.sync_consumer.clone(), &report).await;
                    return Ok(None);
                }
                return Err(report);
            }
            self.registered = true;
        }

        let _enter = self.span.enter();
        tracing::debug!(
            processors = self.parts.processors.len(),
            startables = self.parts.startables.len(),
            inbound_streams = self.parts.inbound_streams.len(),
            local = self.local,
            "Starting flow"
        );
        let start_ctx = StartCtx::new(self.ctx.clone(), self.pending.clone());
        for startable in self.parts.startables.drain(..) {
            startable.start(&start_ctx);
        }

        let mut processors = std::mem::take(&mut self.parts.processors);
        let last = if run_last_inline { processors.pop() } else { None };
        for ScheduledProcessor {
            id,
            processor,
            output,
        } in processors
        {
            spawn_participant(
                &self.pending,
                format!("processor {id}"),
                processor.run(self.ctx.clone(), output, id),
            );
        }
        Ok(last)
    }

    /// Waits for every task and inbound stream of the flow.
    ///
    /// If the flow is canceled first, inbound streams that never connected
    /// are canceled so the wait can finish.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + 'static {
        let pending = self.pending.clone();
        let ctx = self.ctx.clone();
        let registry = self.registered.then(|| self.registry.clone());
        let span = self.span.clone();
        async move {
            tokio::select! {
                _ = pending.wait_idle() => {}
                _ = ctx.cancel.cancelled() => {
                    tracing::debug!(parent: &span, "Flow canceled, pending: {:?}", pending.describe());
                    if let Some(registry) = registry {
                        registry.cancel_pending_streams(ctx.id, MetadataError::query_canceled());
                    }
                    pending.wait_idle().await;
                }
            }
        }
    }

    /// Cancels every task of the flow.
    pub fn cancel(&self) {
        self.ctx.cancel.cancel();
    }

    /// Releases the flow's resources. Consumes the flow, so this happens
    /// once.
    pub fn cleanup(mut self) {
        let _enter = self.span.enter();
        if self.registered {
            self.registry.unregister_flow(self.ctx.id);
        }
        self.ctx.cancel.cancel();
        self.ctx.stop_monitors();
        self.status = FlowStatus::Finished;
        tracing::debug!(
            mem_max = self.ctx.mem_monitor.max_allocated(),
            disk_max = self.ctx.disk_monitor.max_allocated(),
            "Cleaned up flow"
        );
        if let Some(done_fn) = self.done_fn.take() {
            done_fn(self.ctx.id);
        }
    }
}

async fn report_error(consumer: Option<Arc<dyn RowReceiver>>, report: &error_stack::Report<Error>) {
    if let Some(consumer) = consumer {
        push_error_and_finish(consumer.as_ref(), error_metadata(report)).await;
    }
}
