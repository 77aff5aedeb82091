use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use error_stack::ResultExt;
use sluice_api::{consumer_signal, ConsumerSignal, ProducerMessage};
use sluice_core::{ColumnType, MetadataError, NodeId, StreamId};
use sluice_execinfra::{
    FlowCtx, FlowStreamClient, FrameReceiver, FrameSender, MetadataSource, RowChannel,
    RowChannelReceiver, RowChannelSender, RowMessage, RowReceiver, RowSource,
};
use tracing::Instrument;

use crate::wire::DataEncoder;
use crate::{Error, StartCtx, Startable};

/// Rows buffered before a data message is sent.
const OUTBOX_BUF_ROWS: usize = 16;

/// Longest time rows stay buffered.
const OUTBOX_FLUSH_PERIOD: Duration = Duration::from_millis(100);

/// The sending side of a remote stream.
///
/// The producer pushes into [Outbox::receiver]; the outbox task ships the rows
/// to the consumer node and relays the consumer's drain and close signals
/// back through the channel status.
pub struct Outbox {
    flow_ctx: Arc<FlowCtx>,
    target: NodeId,
    stream_id: StreamId,
    types: Vec<ColumnType>,
    sender: Arc<RowChannelSender>,
    input: RowChannelReceiver,
    metadata_sources: Vec<Box<dyn MetadataSource>>,
    live_outboxes: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("target", &self.target)
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}

impl Outbox {
    /// Creates an outbox and counts it in `live_outboxes` until it exits.
    pub fn new(
        flow_ctx: Arc<FlowCtx>,
        target: NodeId,
        stream_id: StreamId,
        types: Vec<ColumnType>,
        live_outboxes: Arc<AtomicUsize>,
    ) -> Self {
        let (sender, input) = RowChannel::new(types.clone(), 1);
        live_outboxes.fetch_add(1, Ordering::AcqRel);
        Self {
            flow_ctx,
            target,
            stream_id,
            types,
            sender,
            input,
            metadata_sources: Vec::new(),
            live_outboxes,
        }
    }

    /// Where the producer pushes its rows.
    pub fn receiver(&self) -> Arc<dyn RowReceiver> {
        self.sender.clone()
    }

    /// Metadata drained from `source` is sent before the outbox exits.
    pub fn add_metadata_source(&mut self, source: Box<dyn MetadataSource>) {
        self.metadata_sources.push(source);
    }

    async fn run(mut self) {
        let result = self.main_loop().await;
        if let Err(report) = &result {
            tracing::warn!("Outbox to node {} failed: {report:?}", self.target);
            let error = MetadataError::from_report(report.current_context().kind(), report);
            fail_metadata_sources(&mut self.metadata_sources, &error).await;
        }
        // Unblock the producer.
        self.input.consumer_closed();

        let remaining = self.live_outboxes.fetch_sub(1, Ordering::AcqRel) - 1;
        if result.is_err() && remaining == 0 {
            tracing::info!("Last outbox failed, canceling flow {}", self.flow_ctx.id);
            self.flow_ctx.cancel.cancel();
        }
    }

    async fn main_loop(&mut self) -> error_stack::Result<(), Error> {
        let (messages, mut signals) = dial(&self.flow_ctx, self.target, self.stream_id).await?;

        let mut encoder = DataEncoder::new(self.types.clone());
        let mut flush = tokio::time::interval(OUTBOX_FLUSH_PERIOD);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut handshake_seen = false;

        loop {
            tokio::select! {
                _ = self.flow_ctx.cancel.cancelled() => error_stack::bail!(Error::QueryCanceled),
                signal = signals.recv() => {
                    let Some(signal) = signal.change_context(Error::Receive)? else {
                        error_stack::ensure!(handshake_seen, Error::Outbox(self.stream_id));
                        tracing::debug!("Consumer ended the stream");
                        return Ok(());
                    };
                    match signal.value {
                        Some(consumer_signal::Value::Handshake(handshake)) => {
                            handshake.check_compatible().change_context(Error::Handshake)?;
                            tracing::trace!(
                                consumer_scheduled = handshake.consumer_scheduled,
                                "Received handshake"
                            );
                            handshake_seen = true;
                        }
                        Some(consumer_signal::Value::DrainRequest(_)) => {
                            tracing::debug!("Consumer requested drain");
                            self.input.consumer_done();
                        }
                        Some(consumer_signal::Value::Close(_)) => {
                            tracing::debug!("Consumer closed the stream");
                            return Ok(());
                        }
                        None => error_stack::bail!(Error::UnexpectedMessage("empty signal")),
                    }
                }
                message = self.input.next() => match message {
                    Some(RowMessage::Row(row)) => {
                        encoder.add_row(&row);
                        if encoder.num_rows() >= OUTBOX_BUF_ROWS {
                            send_data(&self.flow_ctx, &messages, &mut encoder).await?;
                        }
                    }
                    Some(RowMessage::Meta(meta)) => {
                        send_data(&self.flow_ctx, &messages, &mut encoder).await?;
                        send(&self.flow_ctx, &messages, &ProducerMessage::metadata(&meta)).await?;
                    }
                    None => {
                        send_data(&self.flow_ctx, &messages, &mut encoder).await?;
                        for source in self.metadata_sources.iter_mut() {
                            for meta in source.drain_meta().await {
                                send(&self.flow_ctx, &messages, &ProducerMessage::metadata(&meta))
                                    .await?;
                            }
                        }
                        return Ok(());
                    }
                },
                _ = flush.tick() => send_data(&self.flow_ctx, &messages, &mut encoder).await?,
            }
        }
    }
}

/// Opens the stream to `target` and sends its header.
pub(crate) async fn dial(
    flow_ctx: &FlowCtx,
    target: NodeId,
    stream_id: StreamId,
) -> error_stack::Result<(FrameSender<ProducerMessage>, FrameReceiver<ConsumerSignal>), Error> {
    let dialer = flow_ctx.cfg.dialer.clone().ok_or(Error::Dial(target))?;
    let FlowStreamClient { messages, signals } = flow_ctx
        .or_canceled(dialer.flow_stream(target))
        .await
        .ok_or(Error::QueryCanceled)?
        .change_context(Error::Dial(target))?;
    send(
        flow_ctx,
        &messages,
        &ProducerMessage::header(flow_ctx.id, stream_id),
    )
    .await?;
    Ok((messages, signals))
}

/// Sends `message`, giving up if the flow is canceled while the stream is
/// full.
pub(crate) async fn send(
    flow_ctx: &FlowCtx,
    messages: &FrameSender<ProducerMessage>,
    message: &ProducerMessage,
) -> error_stack::Result<(), Error> {
    match flow_ctx.or_canceled(messages.send(message)).await {
        Some(sent) => sent.change_context(Error::Send),
        None => error_stack::bail!(Error::QueryCanceled),
    }
}

async fn send_data(
    flow_ctx: &FlowCtx,
    messages: &FrameSender<ProducerMessage>,
    encoder: &mut DataEncoder,
) -> error_stack::Result<(), Error> {
    if encoder.is_empty() {
        return Ok(());
    }
    send(flow_ctx, messages, &ProducerMessage::data(encoder.flush())).await
}

/// Tells every source that its stream failed and drops what they still
/// hold, since it can no longer be delivered.
pub(crate) async fn fail_metadata_sources(
    sources: &mut [Box<dyn MetadataSource>],
    error: &MetadataError,
) {
    for source in sources.iter_mut() {
        source.post_error(error);
        for meta in source.drain_meta().await {
            tracing::warn!("Dropping undelivered {} metadata", meta.kind_name());
        }
    }
}

impl Startable for Outbox {
    fn start(self: Box<Self>, ctx: &StartCtx) {
        let span = tracing::debug_span!(
            "outbox",
            flow_id = %ctx.flow_ctx.id,
            stream_id = %self.stream_id,
            target = %self.target,
        );
        let name = format!("outbox {}", self.stream_id);
        ctx.spawn(name, self.run().instrument(span));
    }
}
