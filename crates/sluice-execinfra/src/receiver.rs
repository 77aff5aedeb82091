use std::sync::Arc;

use sluice_core::{ColumnType, ConsumerStatus, MetadataError, ProducerMetadata, Row};

use crate::FlowCtx;

/// A single item on a stream: either a row or a metadata record.
#[derive(Clone, Debug, PartialEq, derive_more::From)]
pub enum RowMessage {
    Row(Row),
    Meta(ProducerMetadata),
}

impl RowMessage {
    pub fn is_row(&self) -> bool {
        matches!(self, RowMessage::Row(_))
    }

    pub fn into_meta(self) -> Option<ProducerMetadata> {
        match self {
            RowMessage::Meta(meta) => Some(meta),
            RowMessage::Row(_) => None,
        }
    }
}

/// The push side of a stream.
#[async_trait::async_trait]
pub trait RowReceiver: Send + Sync {
    /// Sends a row or metadata to the consumer, returning the consumer's
    /// current status.
    ///
    /// Once this returns [ConsumerStatus::ConsumerClosed], every later push
    /// returns it too.
    async fn push(&self, msg: RowMessage) -> ConsumerStatus;

    /// Signals that no more pushes follow. Calling it more than once has no
    /// further effect.
    fn producer_done(&self);
}

#[async_trait::async_trait]
impl<T: RowReceiver + ?Sized> RowReceiver for Arc<T> {
    async fn push(&self, msg: RowMessage) -> ConsumerStatus {
        self.as_ref().push(msg).await
    }

    fn producer_done(&self) {
        self.as_ref().producer_done()
    }
}

/// The pull side of a stream.
///
/// Fused processors, synchronizers and channel receivers all implement this,
/// so a consumer pulls from whichever is in its input slot.
#[async_trait::async_trait]
pub trait RowSource: Send {
    fn output_types(&self) -> &[ColumnType];

    /// Called once before the first `next`. Sources with inputs start them.
    fn start(&mut self, ctx: &Arc<FlowCtx>);

    /// The next row or metadata, or `None` once the source is exhausted.
    async fn next(&mut self) -> Option<RowMessage>;

    /// The consumer wants no more rows. The source keeps returning metadata
    /// until it is exhausted.
    fn consumer_done(&mut self);

    /// The consumer wants nothing more. `next` should not be called again.
    fn consumer_closed(&mut self);
}

/// Pulls everything from `source` and pushes it to `output`, honoring the
/// statuses `output` returns. Signals producer-done on `output` when done.
///
/// Once the flow is canceled the source is closed. A query-canceled error is
/// pushed unless `output` itself was what blocked.
pub async fn run_source<R: RowReceiver + ?Sized>(
    ctx: &FlowCtx,
    source: &mut dyn RowSource,
    output: &R,
) {
    loop {
        if ctx.cancel.is_cancelled() {
            cancel_source(source, Some(output)).await;
            break;
        }
        let msg = match ctx.or_canceled(source.next()).await {
            Some(Some(msg)) => msg,
            Some(None) => break,
            None => {
                cancel_source(source, Some(output)).await;
                break;
            }
        };
        match ctx.or_canceled(output.push(msg)).await {
            Some(ConsumerStatus::NeedMoreRows) => continue,
            Some(ConsumerStatus::DrainRequested) => {
                drain_and_forward_metadata(ctx, source, output).await;
                break;
            }
            Some(ConsumerStatus::ConsumerClosed) => {
                source.consumer_closed();
                break;
            }
            None => {
                cancel_source(source, None::<&R>).await;
                break;
            }
        }
    }
    output.producer_done();
}

async fn cancel_source<R: RowReceiver + ?Sized>(source: &mut dyn RowSource, output: Option<&R>) {
    tracing::debug!("Flow canceled, closing source");
    source.consumer_closed();
    if let Some(output) = output {
        let canceled = ProducerMetadata::Error(MetadataError::query_canceled());
        output.push(RowMessage::Meta(canceled)).await;
    }
}

/// Tells `source` the consumer is done and forwards only its remaining
/// metadata to `output`.
pub async fn drain_and_forward_metadata<R: RowReceiver + ?Sized>(
    ctx: &FlowCtx,
    source: &mut dyn RowSource,
    output: &R,
) {
    source.consumer_done();
    loop {
        let Some(next) = ctx.or_canceled(source.next()).await else {
            cancel_source(source, Some(output)).await;
            return;
        };
        let Some(msg) = next else {
            return;
        };
        let RowMessage::Meta(meta) = msg else {
            continue;
        };
        match ctx.or_canceled(output.push(RowMessage::Meta(meta))).await {
            Some(ConsumerStatus::ConsumerClosed) => {
                source.consumer_closed();
                return;
            }
            Some(_) => {}
            None => {
                cancel_source(source, None::<&R>).await;
                return;
            }
        }
    }
}

/// Pushes error metadata followed by producer-done.
pub async fn push_error_and_finish<R: RowReceiver + ?Sized>(output: &R, meta: ProducerMetadata) {
    debug_assert!(meta.error().is_some(), "expected error metadata");
    output.push(RowMessage::Meta(meta)).await;
    output.producer_done();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use sluice_core::ErrorKind;
    use sluice_testing::{int_row, int_types};

    use super::*;
    use crate::{RowBuffer, ServerConfig, Settings};

    fn flow_ctx() -> Arc<FlowCtx> {
        sluice_testing::init_test_logging();
        let cfg = ServerConfig::new(1u32.into(), Settings::default(), None).unwrap();
        Arc::new(FlowCtx::new(sluice_core::FlowId::new_v4(), Arc::new(cfg), false))
    }

    fn cancel_after(ctx: &FlowCtx, delay: Duration) {
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cancel.cancel();
        });
    }

    /// Emits `rows` rows, then never returns another.
    struct Stalled {
        types: Vec<ColumnType>,
        rows: i64,
        closed: bool,
    }

    impl Stalled {
        fn new(rows: i64) -> Self {
            Self {
                types: int_types(1),
                rows,
                closed: false,
            }
        }
    }

    #[async_trait::async_trait]
    impl RowSource for Stalled {
        fn output_types(&self) -> &[ColumnType] {
            &self.types
        }

        fn start(&mut self, _ctx: &Arc<FlowCtx>) {}

        async fn next(&mut self) -> Option<RowMessage> {
            if self.rows == 0 {
                std::future::pending::<()>().await;
            }
            self.rows -= 1;
            Some(RowMessage::Row(int_row(&[self.rows])))
        }

        fn consumer_done(&mut self) {}

        fn consumer_closed(&mut self) {
            self.closed = true;
        }
    }

    /// Never accepts a push.
    #[derive(Default)]
    struct Blocked {
        done: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RowReceiver for Blocked {
        async fn push(&self, _msg: RowMessage) -> ConsumerStatus {
            std::future::pending().await
        }

        fn producer_done(&self) {
            self.done.store(true, Ordering::Release);
        }
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_for_source() {
        let ctx = flow_ctx();
        let mut source = Stalled::new(2);
        let buffer = RowBuffer::new(int_types(1));
        cancel_after(&ctx, Duration::from_millis(50));

        tokio::time::timeout(
            Duration::from_secs(2),
            run_source(&ctx, &mut source, buffer.as_ref()),
        )
        .await
        .unwrap();

        assert!(source.closed);
        assert!(buffer.is_producer_done());
        let (rows, metas) = buffer.take_all();
        assert_eq!(rows, vec![int_row(&[1]), int_row(&[0])]);
        let errors: Vec<_> = metas.iter().filter_map(|m| m.error()).map(|e| e.kind).collect();
        assert_eq!(errors, vec![ErrorKind::QueryCanceled]);
    }

    #[tokio::test]
    async fn test_cancel_while_output_blocked() {
        let ctx = flow_ctx();
        let mut source = Stalled::new(5);
        let output = Blocked::default();
        cancel_after(&ctx, Duration::from_millis(50));

        tokio::time::timeout(Duration::from_secs(2), run_source(&ctx, &mut source, &output))
            .await
            .unwrap();

        assert!(source.closed);
        assert!(output.done.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_or_canceled_prefers_ready_output() {
        let ctx = flow_ctx();
        ctx.cancel.cancel();
        assert_eq!(ctx.or_canceled(async { 7 }).await, Some(7));
        assert_eq!(ctx.or_canceled(std::future::pending::<i32>()).await, None);
    }
}
