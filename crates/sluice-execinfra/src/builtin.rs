use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use sluice_core::{ColumnType, Row};
use sluice_physical::{ProcessorCoreSpec, ProcessorSpec};

use crate::{
    Error, FlowCtx, PostProcessor, PostResult, Processor, ProcessorFactory, RowMessage, RowSource,
};

/// Creates the built-in processors and delegates custom cores to factories
/// registered by name.
#[derive(Default)]
pub struct BuiltinProcessorFactory {
    custom: HashMap<String, Arc<dyn ProcessorFactory>>,
}

impl BuiltinProcessorFactory {
    pub fn with_custom(mut self, name: impl Into<String>, factory: Arc<dyn ProcessorFactory>) -> Self {
        self.custom.insert(name.into(), factory);
        self
    }
}

impl ProcessorFactory for BuiltinProcessorFactory {
    fn new_processor(
        &self,
        ctx: &Arc<FlowCtx>,
        spec: &ProcessorSpec,
        mut inputs: Vec<Box<dyn RowSource>>,
    ) -> error_stack::Result<Processor, Error> {
        let invalid = |reason: &str| Error::InvalidProcessor {
            processor_id: spec.processor_id,
            reason: reason.to_owned(),
        };
        match &spec.core {
            ProcessorCoreSpec::Values { column_types, rows } => {
                error_stack::ensure!(inputs.is_empty(), invalid("values takes no inputs"));
                Ok(Processor::Source(Box::new(ValuesProcessor::new(
                    column_types,
                    rows.clone(),
                    PostProcessor::new(&spec.post),
                ))))
            }
            ProcessorCoreSpec::Noop => {
                error_stack::ensure!(inputs.len() == 1, invalid("noop takes exactly one input"));
                let input = inputs.remove(0);
                Ok(Processor::Source(Box::new(NoopProcessor::new(
                    input,
                    PostProcessor::new(&spec.post),
                ))))
            }
            ProcessorCoreSpec::Custom { name, .. } => {
                let factory = self
                    .custom
                    .get(name)
                    .ok_or_else(|| Error::UnknownCore(name.clone()))?;
                factory.new_processor(ctx, spec, inputs)
            }
        }
    }
}

/// Emits a fixed list of rows.
pub struct ValuesProcessor {
    types: Vec<ColumnType>,
    rows: VecDeque<Row>,
    post: PostProcessor,
    done: bool,
}

impl ValuesProcessor {
    pub fn new(column_types: &[ColumnType], rows: Vec<Row>, post: PostProcessor) -> Self {
        Self {
            types: post.output_types(column_types),
            rows: rows.into(),
            post,
            done: false,
        }
    }
}

#[async_trait::async_trait]
impl RowSource for ValuesProcessor {
    fn output_types(&self) -> &[ColumnType] {
        &self.types
    }

    fn start(&mut self, _ctx: &Arc<FlowCtx>) {}

    async fn next(&mut self) -> Option<RowMessage> {
        while !self.done {
            let Some(row) = self.rows.pop_front() else {
                break;
            };
            match self.post.process(row) {
                PostResult::Emit(row) => return Some(RowMessage::Row(row)),
                PostResult::Skip => continue,
                PostResult::Done => self.done = true,
            }
        }
        None
    }

    fn consumer_done(&mut self) {
        self.done = true;
    }

    fn consumer_closed(&mut self) {
        self.done = true;
    }
}

/// Forwards its input, applying post-processing.
pub struct NoopProcessor {
    input: Box<dyn RowSource>,
    types: Vec<ColumnType>,
    post: PostProcessor,
    /// Set once the limit is reached; only metadata is forwarded after.
    draining: bool,
}

impl NoopProcessor {
    pub fn new(input: Box<dyn RowSource>, post: PostProcessor) -> Self {
        let types = post.output_types(input.output_types());
        Self {
            input,
            types,
            post,
            draining: false,
        }
    }
}

#[async_trait::async_trait]
impl RowSource for NoopProcessor {
    fn output_types(&self) -> &[ColumnType] {
        &self.types
    }

    fn start(&mut self, ctx: &Arc<FlowCtx>) {
        self.input.start(ctx);
    }

    async fn next(&mut self) -> Option<RowMessage> {
        loop {
            match self.input.next().await? {
                RowMessage::Row(_) if self.draining => continue,
                RowMessage::Row(row) => match self.post.process(row) {
                    PostResult::Emit(row) => return Some(RowMessage::Row(row)),
                    PostResult::Skip => continue,
                    PostResult::Done => self.consumer_done(),
                },
                meta @ RowMessage::Meta(_) => return Some(meta),
            }
        }
    }

    fn consumer_done(&mut self) {
        if !self.draining {
            self.draining = true;
            self.input.consumer_done();
        }
    }

    fn consumer_closed(&mut self) {
        self.input.consumer_closed();
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::ProcessorId;
    use sluice_physical::PostProcessSpec;
    use sluice_testing::{int_row, int_rows, int_types};

    use super::*;
    use crate::{RowBuffer, RowChannel, RowReceiver, ServerConfig, Settings};

    fn flow_ctx() -> Arc<FlowCtx> {
        let cfg = ServerConfig::new(1.into(), Settings::default(), None).unwrap();
        Arc::new(FlowCtx::new(sluice_core::FlowId::new_v4(), Arc::new(cfg), false))
    }

    fn spec(core: ProcessorCoreSpec, post: PostProcessSpec) -> ProcessorSpec {
        ProcessorSpec {
            processor_id: ProcessorId(7),
            inputs: vec![],
            core,
            post,
            outputs: vec![],
        }
    }

    #[tokio::test]
    async fn test_values_into_buffer() {
        sluice_testing::init_test_logging();
        let ctx = flow_ctx();
        let spec = spec(
            ProcessorCoreSpec::Values {
                column_types: int_types(2),
                rows: int_rows(5, 2),
            },
            PostProcessSpec::default(),
        );
        let processor = BuiltinProcessorFactory::default()
            .new_processor(&ctx, &spec, vec![])
            .unwrap();
        let buffer = RowBuffer::new(int_types(2));
        processor.run(ctx, buffer.clone(), ProcessorId(7)).await;

        assert!(buffer.is_producer_done());
        let (rows, metas) = buffer.take_all();
        assert_eq!(rows, int_rows(5, 2));
        assert!(metas.is_empty());
    }

    #[tokio::test]
    async fn test_noop_limit_drains_input() {
        let ctx = flow_ctx();
        let (tx, rx) = RowChannel::new(int_types(1), 1);
        let spec = spec(
            ProcessorCoreSpec::Noop,
            PostProcessSpec {
                limit: Some(2),
                ..Default::default()
            },
        );
        let processor = BuiltinProcessorFactory::default()
            .new_processor(&ctx, &spec, vec![Box::new(rx)])
            .unwrap();
        let buffer = RowBuffer::new(int_types(1));
        let run = tokio::spawn(processor.run(ctx, buffer.clone(), ProcessorId(7)));

        for i in 0..3 {
            tx.push(RowMessage::Row(int_row(&[i]))).await;
        }
        tx.producer_done();
        run.await.unwrap();

        let (rows, _) = buffer.take_all();
        assert_eq!(rows, vec![int_row(&[0]), int_row(&[1])]);
        assert_eq!(
            tx.consumer_status(),
            sluice_core::ConsumerStatus::DrainRequested
        );
    }

    #[tokio::test]
    async fn test_unknown_core() {
        let ctx = flow_ctx();
        let spec = spec(ProcessorCoreSpec::custom("sorter"), PostProcessSpec::default());
        let err = BuiltinProcessorFactory::default()
            .new_processor(&ctx, &spec, vec![])
            .unwrap_err();
        assert!(matches!(err.current_context(), Error::UnknownCore(name) if name == "sorter"));
    }

    #[tokio::test]
    async fn test_stats_are_forwarded() {
        let cfg = ServerConfig::new(1.into(), Settings::default(), None).unwrap();
        let ctx = Arc::new(FlowCtx::new(sluice_core::FlowId::new_v4(), Arc::new(cfg), true));
        let processor = Processor::Source(Box::new(ValuesProcessor::new(
            &int_types(1),
            int_rows(3, 1),
            PostProcessor::new(&PostProcessSpec::default()),
        )));
        let buffer = RowBuffer::new(int_types(1));
        processor.run(ctx, buffer.clone(), ProcessorId(3)).await;

        let (rows, metas) = buffer.take_all();
        assert_eq!(rows.len(), 3);
        let [sluice_core::ProducerMetadata::TraceData(spans)] = metas.as_slice() else {
            panic!("expected a single trace metadata, got {metas:?}")
        };
        assert_eq!(
            spans[0].tags[crate::STAT_PROCESSOR_ROWS_EMITTED],
            "3".to_owned()
        );
        assert!(buffer.is_producer_done());
    }
}
