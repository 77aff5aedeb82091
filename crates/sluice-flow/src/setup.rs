use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use error_stack::{ensure, ResultExt};
use hashbrown::{HashMap, HashSet};
use sluice_core::{ColumnOrdering, ColumnType, ProcessorId, StreamId};
use sluice_execinfra::{FlowCtx, Processor, RowChannel, RowChannelReceiver, RowReceiver, RowSource};
use sluice_physical::{FlowSpec, InputSyncSpec, RouterType, StreamEndpointSpec, StreamType, SyncType};

use crate::{
    vectorized, Error, InboundStreamHandler, OrderedSync, Outbox, Router, RowInboundStreamHandler,
    SerialUnorderedSync, Startable,
};

/// How eagerly setup fuses producers into their consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FuseOpt {
    /// Fuse into inputs with a single stream and into ordered
    /// synchronizers.
    #[default]
    Normal,
    /// Also fuse into unordered inputs with several streams. Such inputs
    /// read their streams one after another.
    Aggressive,
}

/// Whether a flow moves column batches instead of rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VectorizeMode {
    #[default]
    Off,
    /// Fail setup if the flow can't be vectorized.
    On,
    /// Vectorize when supported, otherwise fall back to rows.
    Auto,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FlowSetupOptions {
    pub fuse: FuseOpt,
    pub vectorize: VectorizeMode,
    /// Record per-processor and per-router-output stats.
    pub collect_stats: bool,
}

/// A processor that runs as its own task.
pub(crate) struct ScheduledProcessor {
    pub id: ProcessorId,
    pub processor: Processor,
    pub output: Arc<dyn RowReceiver>,
}

/// The runnable parts of a flow.
#[derive(Default)]
pub(crate) struct FlowParts {
    /// In topological order, leaves first.
    pub processors: Vec<ScheduledProcessor>,
    pub startables: Vec<Box<dyn Startable>>,
    pub inbound_streams: HashMap<StreamId, Arc<dyn InboundStreamHandler>>,
    pub num_fused: usize,
}

impl std::fmt::Debug for FlowParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowParts")
            .field(
                "processors",
                &self.processors.iter().map(|p| p.id).collect::<Vec<_>>(),
            )
            .field("startables", &self.startables.len())
            .field("inbound_streams", &self.inbound_streams.len())
            .field("num_fused", &self.num_fused)
            .finish()
    }
}

type Result<T> = error_stack::Result<T, Error>;

/// Builds the parts of a flow. Nothing is started.
pub(crate) fn setup_flow(
    flow_ctx: &Arc<FlowCtx>,
    spec: &FlowSpec,
    sync_consumer: Option<&Arc<dyn RowReceiver>>,
    options: &FlowSetupOptions,
) -> Result<FlowParts> {
    match options.vectorize {
        VectorizeMode::Off => RowFlowBuilder::new(flow_ctx, sync_consumer, options.fuse).build(spec),
        VectorizeMode::On => vectorized::setup_flow(flow_ctx, spec, sync_consumer),
        VectorizeMode::Auto => {
            match vectorized::setup_flow(flow_ctx, spec, sync_consumer) {
                Err(report) if matches!(report.current_context(), Error::Unsupported(_)) => {
                    tracing::debug!("Falling back to row execution: {}", report.current_context());
                    RowFlowBuilder::new(flow_ctx, sync_consumer, options.fuse).build(spec)
                }
                result => result,
            }
        }
    }
}

/// Orders processors so that every producer of a local stream comes before
/// its consumer.
pub(crate) fn topological_order(spec: &FlowSpec) -> Result<Vec<usize>> {
    let consumers: HashMap<StreamId, usize> = spec
        .processors
        .iter()
        .enumerate()
        .flat_map(|(index, processor)| {
            local_streams(processor.inputs.iter().flat_map(|i| i.streams.iter()))
                .map(move |stream_id| (stream_id, index))
        })
        .collect();

    let n = spec.processors.len();
    let mut edges = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];
    for (producer, processor) in spec.processors.iter().enumerate() {
        for stream_id in local_streams(processor.outputs.iter().flat_map(|o| o.streams.iter())) {
            if let Some(&consumer) = consumers.get(&stream_id) {
                edges[producer].push(consumer);
                in_degree[consumer] += 1;
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|i| in_degree[*i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(next) = ready.pop_front() {
        order.push(next);
        for &consumer in &edges[next] {
            in_degree[consumer] -= 1;
            if in_degree[consumer] == 0 {
                ready.push_back(consumer);
            }
        }
    }
    ensure!(order.len() == n, Error::Cycle);
    Ok(order)
}

fn local_streams<'a>(
    streams: impl Iterator<Item = &'a StreamEndpointSpec> + 'a,
) -> impl Iterator<Item = StreamId> + 'a {
    streams
        .filter(|s| s.stream_type == StreamType::Local)
        .map(|s| s.stream_id)
}

/// How the per-stream sources of an input are merged.
enum Merge {
    Single,
    Ordered(ColumnOrdering),
    Serial,
}

/// A processor input before its processor is created.
enum InputSlot {
    /// Every stream feeds one shared channel.
    Multiplexed(RowChannelReceiver),
    /// One source per stream. A source is a channel until a producer is
    /// fused into it.
    PerStream {
        types: Vec<ColumnType>,
        merge: Merge,
        sources: Vec<Box<dyn RowSource>>,
    },
}

impl InputSlot {
    fn into_source(self) -> Box<dyn RowSource> {
        match self {
            InputSlot::Multiplexed(receiver) => Box::new(receiver),
            InputSlot::PerStream {
                types,
                merge,
                mut sources,
            } => match merge {
                Merge::Single if sources.len() == 1 => sources.remove(0),
                Merge::Ordered(ordering) => Box::new(OrderedSync::new(types, ordering, sources)),
                Merge::Single | Merge::Serial => Box::new(SerialUnorderedSync::new(types, sources)),
            },
        }
    }
}

/// Where a fusible local stream is consumed: processor, input and source
/// index.
#[derive(Clone, Copy, Debug)]
struct SourceIndex {
    processor: usize,
    input: usize,
    source: usize,
}

struct RowFlowBuilder<'a> {
    flow_ctx: &'a Arc<FlowCtx>,
    sync_consumer: Option<&'a Arc<dyn RowReceiver>>,
    fuse: FuseOpt,
    /// Producer sides of local streams that have no producer yet.
    local_receivers: HashMap<StreamId, Arc<dyn RowReceiver>>,
    /// Local streams already bound to a producer.
    produced: HashSet<StreamId>,
    fusible: HashMap<StreamId, SourceIndex>,
    live_outboxes: Arc<AtomicUsize>,
    parts: FlowParts,
}

impl<'a> RowFlowBuilder<'a> {
    fn new(
        flow_ctx: &'a Arc<FlowCtx>,
        sync_consumer: Option<&'a Arc<dyn RowReceiver>>,
        fuse: FuseOpt,
    ) -> Self {
        Self {
            flow_ctx,
            sync_consumer,
            fuse,
            local_receivers: HashMap::new(),
            produced: HashSet::new(),
            fusible: HashMap::new(),
            live_outboxes: Arc::default(),
            parts: FlowParts::default(),
        }
    }

    fn build(mut self, spec: &FlowSpec) -> Result<FlowParts> {
        let mut slots = self.build_inputs(spec)?;
        let order = topological_order(spec)?;

        for index in order {
            let processor_spec = &spec.processors[index];
            let id = processor_spec.processor_id;
            ensure!(
                processor_spec.outputs.len() == 1,
                Error::OutputCount {
                    processor_id: id,
                    count: processor_spec.outputs.len(),
                }
            );
            let output = &processor_spec.outputs[0];

            let inputs = std::mem::take(&mut slots[index])
                .into_iter()
                .map(InputSlot::into_source)
                .collect();
            let processor = self
                .flow_ctx
                .cfg
                .processor_factory
                .new_processor(self.flow_ctx, processor_spec, inputs)
                .change_context(Error::CreateProcessor(id))?;
            let types = processor.output_types().to_vec();

            if output.router == RouterType::PassThrough {
                ensure!(
                    output.streams.len() == 1,
                    Error::PassThroughStreams(output.streams.len())
                );
            }

            let mut fuse_slot = None;
            if let Some(stream) = processor_spec
                .pass_through_stream()
                .filter(|s| s.stream_type == StreamType::Local)
            {
                if let Some(at) = self.fusible.get(&stream.stream_id).copied() {
                    if let InputSlot::PerStream { sources, .. } = &mut slots[at.processor][at.input] {
                        fuse_slot = sources
                            .get_mut(at.source)
                            .map(|slot| (stream.stream_id, at.processor, slot));
                    }
                }
            }
            let processor = match (processor, fuse_slot) {
                (Processor::Source(source), Some((stream_id, consumer, slot))) => {
                    tracing::debug!(
                        "Fusing processor {id} into processor {}",
                        spec.processors[consumer].processor_id
                    );
                    *slot = source;
                    self.fusible.remove(&stream_id);
                    self.local_receivers.remove(&stream_id);
                    self.produced.insert(stream_id);
                    self.parts.num_fused += 1;
                    continue;
                }
                (processor, _) => processor,
            };

            let mut receivers = output
                .streams
                .iter()
                .map(|stream| self.output_receiver(stream, &types))
                .collect::<Result<Vec<_>>>()?;
            let output: Arc<dyn RowReceiver> = if output.router == RouterType::PassThrough {
                receivers.remove(0)
            } else {
                let router = Router::try_new(self.flow_ctx.clone(), output, receivers, &types)
                    .change_context(Error::CreateRouter(id))?;
                self.parts.startables.push(Box::new(router.clone()));
                router
            };
            self.parts.processors.push(ScheduledProcessor {
                id,
                processor,
                output,
            });
        }

        if let Some(stream_id) = self.local_receivers.keys().min() {
            error_stack::bail!(Error::NoProducer(*stream_id));
        }
        tracing::debug!(flow_id = %self.flow_ctx.id, parts = ?self.parts, "Set up flow");
        Ok(self.parts)
    }

    /// Creates the channels behind every processor input.
    fn build_inputs(&mut self, spec: &FlowSpec) -> Result<Vec<Vec<InputSlot>>> {
        let mut seen = HashSet::new();
        let mut slots = Vec::with_capacity(spec.processors.len());
        for (processor, processor_spec) in spec.processors.iter().enumerate() {
            let mut inputs = Vec::with_capacity(processor_spec.inputs.len());
            for (input, sync) in processor_spec.inputs.iter().enumerate() {
                ensure!(
                    !sync.streams.is_empty(),
                    Error::EmptyInputSync(processor_spec.processor_id)
                );
                for stream in &sync.streams {
                    ensure!(
                        stream.stream_type != StreamType::SyncResponse,
                        Error::InboundSyncResponse(stream.stream_id)
                    );
                    ensure!(
                        seen.insert(stream.stream_id),
                        Error::DuplicateInboundStream(stream.stream_id)
                    );
                }
                inputs.push(self.input_slot(sync, processor, input));
            }
            slots.push(inputs);
        }
        Ok(slots)
    }

    fn input_slot(&mut self, sync: &InputSyncSpec, processor: usize, input: usize) -> InputSlot {
        let types = &sync.column_types;
        let merge = match (sync.sync_type, sync.streams.len(), self.fuse) {
            (_, 1, _) => Some(Merge::Single),
            (SyncType::Ordered, _, _) => Some(Merge::Ordered(sync.ordering.clone())),
            (SyncType::Unordered, _, FuseOpt::Aggressive) => Some(Merge::Serial),
            (SyncType::Unordered, _, FuseOpt::Normal) => None,
        };

        let Some(merge) = merge else {
            let (sender, receiver) = RowChannel::new(types.clone(), sync.streams.len());
            for stream in &sync.streams {
                self.bind_inbound(stream, sender.clone(), types);
            }
            return InputSlot::Multiplexed(receiver);
        };

        let sources = sync
            .streams
            .iter()
            .enumerate()
            .map(|(source, stream)| {
                let (sender, receiver) = RowChannel::new(types.clone(), 1);
                self.bind_inbound(stream, sender, types);
                if stream.stream_type == StreamType::Local {
                    self.fusible.insert(
                        stream.stream_id,
                        SourceIndex {
                            processor,
                            input,
                            source,
                        },
                    );
                }
                Box::new(receiver) as Box<dyn RowSource>
            })
            .collect();
        InputSlot::PerStream {
            types: types.clone(),
            merge,
            sources,
        }
    }

    fn bind_inbound(
        &mut self,
        stream: &StreamEndpointSpec,
        receiver: Arc<dyn RowReceiver>,
        types: &[ColumnType],
    ) {
        match stream.stream_type {
            StreamType::Local => {
                self.local_receivers.insert(stream.stream_id, receiver);
            }
            StreamType::Remote => {
                self.parts.inbound_streams.insert(
                    stream.stream_id,
                    Arc::new(RowInboundStreamHandler::new(receiver, types.to_vec())),
                );
            }
            StreamType::SyncResponse => {}
        }
    }

    fn output_receiver(
        &mut self,
        stream: &StreamEndpointSpec,
        types: &[ColumnType],
    ) -> Result<Arc<dyn RowReceiver>> {
        let stream_id = stream.stream_id;
        match stream.stream_type {
            StreamType::SyncResponse => self
                .sync_consumer
                .cloned()
                .ok_or_else(|| error_stack::Report::new(Error::MissingSyncConsumer)),
            StreamType::Remote => {
                let target = stream
                    .target_node
                    .ok_or(Error::MissingTargetNode(stream_id))?;
                let outbox = Outbox::new(
                    self.flow_ctx.clone(),
                    target,
                    stream_id,
                    types.to_vec(),
                    self.live_outboxes.clone(),
                );
                let receiver = outbox.receiver();
                self.parts.startables.push(Box::new(outbox));
                Ok(receiver)
            }
            StreamType::Local => match self.local_receivers.remove(&stream_id) {
                Some(receiver) => {
                    self.produced.insert(stream_id);
                    Ok(receiver)
                }
                None if self.produced.contains(&stream_id) => {
                    error_stack::bail!(Error::MultipleConnections(stream_id))
                }
                None => error_stack::bail!(Error::UnconnectedStream(stream_id)),
            },
        }
    }
}
