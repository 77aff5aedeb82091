use std::sync::Arc;

use error_stack::{ensure, ResultExt};
use hashbrown::{HashMap, HashSet};
use sluice_core::{ColumnType, StreamId};
use sluice_execinfra::{FlowCtx, MetadataSource, Processor, RowReceiver, RowSource};
use sluice_physical::{FlowSpec, OutputRouterSpec, RouterType, StreamEndpointSpec, StreamType, SyncType};

use super::{
    BatchChannel, BatchInbox, BatchOutbox, BatchReceiver, BatchSender, BatchSink, Columnarizer,
    HashBatchRouter, Materializer, MaterializerDriver, MetadataBuffer, ProcessorDriver,
    DEFAULT_BATCH_SIZE,
};
use crate::router::RouterStrategy;
use crate::setup::{topological_order, FlowParts};
use crate::Error;

type Result<T> = error_stack::Result<T, Error>;

/// Builds a flow whose processors exchange column batches.
///
/// Fails with [Error::Unsupported] before creating anything if the flow
/// uses ordered synchronizers or routers other than hash routing. Every
/// processor runs in a driver, so the returned parts hold only startables
/// and inbound streams.
pub(crate) fn setup_flow(
    flow_ctx: &Arc<FlowCtx>,
    spec: &FlowSpec,
    sync_consumer: Option<&Arc<dyn RowReceiver>>,
) -> Result<FlowParts> {
    check_supported(spec)?;
    BatchFlowBuilder::new(flow_ctx, sync_consumer).build(spec)
}

fn check_supported(spec: &FlowSpec) -> Result<()> {
    for processor in &spec.processors {
        let id = processor.processor_id;
        for sync in &processor.inputs {
            ensure!(
                sync.sync_type == SyncType::Unordered || sync.streams.len() <= 1,
                Error::Unsupported("ordered input synchronizers".to_owned())
            );
        }
        ensure!(
            processor.outputs.len() == 1,
            Error::OutputCount {
                processor_id: id,
                count: processor.outputs.len(),
            }
        );
        let output = &processor.outputs[0];
        match &output.router {
            RouterType::PassThrough => ensure!(
                output.streams.len() == 1,
                Error::PassThroughStreams(output.streams.len())
            ),
            RouterType::ByHash { .. } => {
                RouterStrategy::try_new(output).change_context(Error::CreateRouter(id))?;
            }
            other => error_stack::bail!(Error::Unsupported(format!("{} routers", other.name()))),
        }
    }
    Ok(())
}

/// A processor input: one channel every stream of the input feeds, and the
/// metadata of everything upstream of it.
struct BatchInput {
    types: Vec<ColumnType>,
    receiver: BatchReceiver,
    metadata: Vec<Box<dyn MetadataSource>>,
}

impl BatchInput {
    fn into_source(self) -> Box<dyn RowSource> {
        Box::new(Materializer::new(self.types, self.receiver, self.metadata))
    }
}

/// The consumer of a local stream, by processor and input index.
#[derive(Clone, Copy, Debug)]
struct InputIndex {
    processor: usize,
    input: usize,
}

struct BatchFlowBuilder<'a> {
    flow_ctx: &'a Arc<FlowCtx>,
    sync_consumer: Option<&'a Arc<dyn RowReceiver>>,
    /// Senders of local streams that have no producer yet.
    local_senders: HashMap<StreamId, (Arc<BatchSender>, InputIndex)>,
    produced: HashSet<StreamId>,
    parts: FlowParts,
}

impl<'a> BatchFlowBuilder<'a> {
    fn new(flow_ctx: &'a Arc<FlowCtx>, sync_consumer: Option<&'a Arc<dyn RowReceiver>>) -> Self {
        Self {
            flow_ctx,
            sync_consumer,
            local_senders: HashMap::new(),
            produced: HashSet::new(),
            parts: FlowParts::default(),
        }
    }

    fn build(mut self, spec: &FlowSpec) -> Result<FlowParts> {
        let mut inputs = self.build_inputs(spec)?;
        let order = topological_order(spec)?;

        for index in order {
            let processor_spec = &spec.processors[index];
            let id = processor_spec.processor_id;
            let sources = std::mem::take(&mut inputs[index])
                .into_iter()
                .map(BatchInput::into_source)
                .collect();
            let processor = self
                .flow_ctx
                .cfg
                .processor_factory
                .new_processor(self.flow_ctx, processor_spec, sources)
                .change_context(Error::CreateProcessor(id))?;
            let Processor::Source(source) = processor else {
                error_stack::bail!(Error::Unsupported(format!(
                    "processor {id}, which runs as its own task"
                )));
            };

            let columnarizer = Columnarizer::new(source, DEFAULT_BATCH_SIZE);
            let types = columnarizer.output_types().to_vec();
            let metadata = columnarizer.metadata();
            let output = &processor_spec.outputs[0];
            let sink = self.output_sink(output, &types, metadata, &mut inputs)?;
            self.parts
                .startables
                .push(Box::new(ProcessorDriver::new(id, columnarizer, sink)));
        }

        if let Some(stream_id) = self.local_senders.keys().min() {
            error_stack::bail!(Error::NoProducer(*stream_id));
        }
        tracing::debug!(flow_id = %self.flow_ctx.id, parts = ?self.parts, "Set up vectorized flow");
        Ok(self.parts)
    }

    fn build_inputs(&mut self, spec: &FlowSpec) -> Result<Vec<Vec<BatchInput>>> {
        let mut seen = HashSet::new();
        let mut inputs = Vec::with_capacity(spec.processors.len());
        for (processor, processor_spec) in spec.processors.iter().enumerate() {
            let mut processor_inputs = Vec::with_capacity(processor_spec.inputs.len());
            for (input, sync) in processor_spec.inputs.iter().enumerate() {
                ensure!(
                    !sync.streams.is_empty(),
                    Error::EmptyInputSync(processor_spec.processor_id)
                );
                let (sender, receiver) = BatchChannel::new(sync.streams.len());
                let mut metadata: Vec<Box<dyn MetadataSource>> = Vec::new();
                for stream in &sync.streams {
                    ensure!(
                        stream.stream_type != StreamType::SyncResponse,
                        Error::InboundSyncResponse(stream.stream_id)
                    );
                    ensure!(
                        seen.insert(stream.stream_id),
                        Error::DuplicateInboundStream(stream.stream_id)
                    );
                    if stream.stream_type == StreamType::Local {
                        self.local_senders.insert(
                            stream.stream_id,
                            (sender.clone(), InputIndex { processor, input }),
                        );
                    } else {
                        let inbox = BatchInbox::new(sender.clone(), sync.column_types.clone());
                        metadata.push(Box::new(inbox.metadata()));
                        self.parts
                            .inbound_streams
                            .insert(stream.stream_id, Arc::new(inbox));
                    }
                }
                processor_inputs.push(BatchInput {
                    types: sync.column_types.clone(),
                    receiver,
                    metadata,
                });
            }
            inputs.push(processor_inputs);
        }
        Ok(inputs)
    }

    /// The sink a processor's driver pushes to. The processor's metadata
    /// goes to the consumer of the first stream.
    fn output_sink(
        &mut self,
        output: &OutputRouterSpec,
        types: &[ColumnType],
        metadata: MetadataBuffer,
        inputs: &mut [Vec<BatchInput>],
    ) -> Result<Arc<dyn BatchSink>> {
        let mut metadata = Some(metadata);
        let sinks = output
            .streams
            .iter()
            .map(|stream| self.stream_sink(stream, types, metadata.take(), inputs))
            .collect::<Result<Vec<_>>>()?;
        match &output.router {
            RouterType::ByHash { hash_columns } => {
                if let Some(column) = hash_columns.iter().find(|column| **column >= types.len()) {
                    error_stack::bail!(Error::HashColumnOutOfRange {
                        column: *column,
                        width: types.len(),
                    });
                }
                Ok(Arc::new(HashBatchRouter::new(hash_columns.clone(), sinks)))
            }
            _ => sinks
                .into_iter()
                .next()
                .ok_or_else(|| error_stack::report!(Error::NoStreams)),
        }
    }

    fn stream_sink(
        &mut self,
        stream: &StreamEndpointSpec,
        types: &[ColumnType],
        metadata: Option<MetadataBuffer>,
        inputs: &mut [Vec<BatchInput>],
    ) -> Result<Arc<dyn BatchSink>> {
        let stream_id = stream.stream_id;
        match stream.stream_type {
            StreamType::SyncResponse => {
                let consumer = self.sync_consumer.ok_or(Error::MissingSyncConsumer)?;
                let (sender, receiver) = BatchChannel::new(1);
                let sources = metadata
                    .map(|m| Box::new(m) as Box<dyn MetadataSource>)
                    .into_iter()
                    .collect();
                let materializer = Materializer::new(types.to_vec(), receiver, sources);
                self.parts.startables.push(Box::new(MaterializerDriver::new(
                    materializer,
                    consumer.clone(),
                )));
                Ok(sender)
            }
            StreamType::Remote => {
                let target = stream
                    .target_node
                    .ok_or(Error::MissingTargetNode(stream_id))?;
                let (sender, receiver) = BatchChannel::new(1);
                let mut outbox = BatchOutbox::new(
                    self.flow_ctx.clone(),
                    target,
                    stream_id,
                    types.to_vec(),
                    receiver,
                );
                if let Some(metadata) = metadata {
                    outbox.add_metadata_source(Box::new(metadata));
                }
                self.parts.startables.push(Box::new(outbox));
                Ok(sender)
            }
            StreamType::Local => match self.local_senders.remove(&stream_id) {
                Some((sender, at)) => {
                    self.produced.insert(stream_id);
                    if let Some(metadata) = metadata {
                        inputs[at.processor][at.input]
                            .metadata
                            .push(Box::new(metadata));
                    }
                    Ok(sender)
                }
                None if self.produced.contains(&stream_id) => {
                    error_stack::bail!(Error::MultipleConnections(stream_id))
                }
                None => error_stack::bail!(Error::UnconnectedStream(stream_id)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use sluice_physical::{InputSyncSpec, OutputRouterSpec, StreamEndpointSpec};
    use sluice_testing::{int_rows, int_types};

    use super::*;
    use crate::tests::{flow_ctx, flow_spec, local_output, noop_spec, sync_output, unordered, values_spec};

    fn setup_err(spec: &FlowSpec) -> Error {
        let consumer: Arc<dyn RowReceiver> = sluice_execinfra::RowBuffer::new(int_types(1));
        setup_flow(&flow_ctx(), spec, Some(&consumer))
            .unwrap_err()
            .current_context()
            .clone()
    }

    #[test]
    fn test_every_processor_gets_a_driver() {
        let spec = flow_spec(vec![
            values_spec(1, 1, int_rows(3, 1), local_output(1)),
            values_spec(2, 1, int_rows(3, 1), local_output(2)),
            noop_spec(
                3,
                unordered(1, vec![StreamEndpointSpec::local(1u32), StreamEndpointSpec::local(2u32)]),
                sync_output(),
            ),
        ]);
        let consumer: Arc<dyn RowReceiver> = sluice_execinfra::RowBuffer::new(int_types(1));
        let parts = setup_flow(&flow_ctx(), &spec, Some(&consumer)).unwrap();
        assert!(parts.processors.is_empty());
        // Three drivers and the materializer feeding the consumer.
        assert_eq!(parts.startables.len(), 4);
        assert_eq!(parts.num_fused, 0);
    }

    #[test]
    fn test_remote_streams() {
        let spec = flow_spec(vec![noop_spec(
            1,
            unordered(1, vec![StreamEndpointSpec::remote(7u32, 2u32)]),
            OutputRouterSpec::pass_through(StreamEndpointSpec::remote(8u32, 2u32)),
        )]);
        let parts = setup_flow(&flow_ctx(), &spec, None).unwrap();
        assert_eq!(
            parts.inbound_streams.keys().copied().collect::<Vec<_>>(),
            vec![StreamId::from(7u32)]
        );
        // The driver and the outbox.
        assert_eq!(parts.startables.len(), 2);
    }

    #[test]
    fn test_unsupported_flows() {
        let ordered = flow_spec(vec![
            values_spec(1, 1, int_rows(3, 1), local_output(1)),
            values_spec(2, 1, int_rows(3, 1), local_output(2)),
            noop_spec(
                3,
                InputSyncSpec::ordered(
                    int_types(1),
                    sluice_core::ColumnOrdering(vec![sluice_core::ColumnOrder::asc(0)]),
                    vec![StreamEndpointSpec::local(1u32), StreamEndpointSpec::local(2u32)],
                ),
                sync_output(),
            ),
        ]);
        assert!(matches!(setup_err(&ordered), Error::Unsupported(_)));

        let mirror = flow_spec(vec![values_spec(
            1,
            1,
            int_rows(3, 1),
            OutputRouterSpec::new(
                RouterType::Mirror,
                vec![StreamEndpointSpec::sync_response(), StreamEndpointSpec::local(2u32)],
            ),
        )]);
        assert_eq!(
            setup_err(&mirror),
            Error::Unsupported("MIRROR routers".to_owned())
        );
    }

    #[test]
    fn test_invalid_flows() {
        let unconsumed = flow_spec(vec![values_spec(1, 1, int_rows(1, 1), local_output(4))]);
        assert_eq!(setup_err(&unconsumed), Error::UnconnectedStream(4u32.into()));

        let unproduced = flow_spec(vec![noop_spec(
            1,
            unordered(1, vec![StreamEndpointSpec::local(5u32)]),
            sync_output(),
        )]);
        assert_eq!(setup_err(&unproduced), Error::NoProducer(5u32.into()));

        let one_stream_hash = flow_spec(vec![values_spec(
            1,
            1,
            int_rows(1, 1),
            OutputRouterSpec::new(
                RouterType::ByHash {
                    hash_columns: vec![0],
                },
                vec![StreamEndpointSpec::sync_response()],
            ),
        )]);
        assert_eq!(setup_err(&one_stream_hash), Error::CreateRouter(1u32.into()));

        let wide_hash = flow_spec(vec![
            values_spec(
                1,
                1,
                int_rows(1, 1),
                OutputRouterSpec::new(
                    RouterType::ByHash {
                        hash_columns: vec![1],
                    },
                    vec![StreamEndpointSpec::local(1u32), StreamEndpointSpec::local(2u32)],
                ),
            ),
            noop_spec(
                2,
                unordered(1, vec![StreamEndpointSpec::local(1u32), StreamEndpointSpec::local(2u32)]),
                sync_output(),
            ),
        ]);
        assert_eq!(
            setup_err(&wide_hash),
            Error::HashColumnOutOfRange { column: 1, width: 1 }
        );
    }
}
