use std::sync::Arc;

use error_stack::ResultExt;
use sluice_api::{producer_message, ConsumerSignal};
use sluice_core::{ColumnType, ConsumerStatus, MetadataError, ProducerMetadata};
use sluice_execinfra::{FlowCtx, FlowStreamServer, RowMessage, RowReceiver};

use crate::error::error_metadata;
use crate::wire::decode_data;
use crate::Error;

/// Consumes the producer side of an inbound stream once it is connected.
#[async_trait::async_trait]
pub trait InboundStreamHandler: Send + Sync {
    /// Reads the producer's messages until the producer finishes, the
    /// consumer closes or the flow is canceled.
    async fn run(
        &self,
        flow_ctx: Arc<FlowCtx>,
        stream: &mut FlowStreamServer,
    ) -> error_stack::Result<(), Error>;

    /// The stream was canceled before its producer connected.
    async fn timeout(&self, err: MetadataError);
}

/// Feeds an inbound stream's rows into a [RowReceiver].
pub struct RowInboundStreamHandler {
    receiver: Arc<dyn RowReceiver>,
    types: Vec<ColumnType>,
}

impl std::fmt::Debug for RowInboundStreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowInboundStreamHandler")
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

impl RowInboundStreamHandler {
    pub fn new(receiver: Arc<dyn RowReceiver>, types: Vec<ColumnType>) -> Self {
        Self { receiver, types }
    }

    async fn process(
        &self,
        flow_ctx: &FlowCtx,
        stream: &mut FlowStreamServer,
    ) -> error_stack::Result<(), Error> {
        let mut types = None;
        let mut drain_sent = false;
        loop {
            let message = tokio::select! {
                biased;
                _ = flow_ctx.cancel.cancelled() => error_stack::bail!(Error::QueryCanceled),
                message = stream.messages.recv() => message.change_context(Error::Receive)?,
            };
            let Some(message) = message else {
                // The producer is done.
                return Ok(());
            };

            let status = match message.value {
                None => error_stack::bail!(Error::UnexpectedMessage("empty message")),
                Some(producer_message::Value::Header(_)) => {
                    error_stack::bail!(Error::UnexpectedMessage("header"))
                }
                Some(producer_message::Value::Data(data)) => {
                    let mut status = ConsumerStatus::NeedMoreRows;
                    for row in decode_data(&data, &mut types, &self.types)? {
                        status = push(flow_ctx, &*self.receiver, RowMessage::Row(row)).await?;
                        if status != ConsumerStatus::NeedMoreRows {
                            break;
                        }
                    }
                    status
                }
                Some(producer_message::Value::Metadata(meta)) => {
                    let meta =
                        ProducerMetadata::try_from(meta).change_context(Error::DecodeMetadata)?;
                    push(flow_ctx, &*self.receiver, RowMessage::Meta(meta)).await?
                }
            };

            match status {
                ConsumerStatus::NeedMoreRows => {}
                ConsumerStatus::DrainRequested => {
                    if !drain_sent {
                        stream
                            .signals
                            .send(&ConsumerSignal::drain_request())
                            .await
                            .change_context(Error::Send)?;
                        drain_sent = true;
                    }
                }
                ConsumerStatus::ConsumerClosed => {
                    if let Err(e) = stream.signals.send(&ConsumerSignal::close()).await {
                        tracing::debug!("Producer went away before close: {e:?}");
                    }
                    return Ok(());
                }
            }
        }
    }
}

async fn push(
    flow_ctx: &FlowCtx,
    receiver: &dyn RowReceiver,
    message: RowMessage,
) -> error_stack::Result<ConsumerStatus, Error> {
    match flow_ctx.or_canceled(receiver.push(message)).await {
        Some(status) => Ok(status),
        None => error_stack::bail!(Error::QueryCanceled),
    }
}

#[async_trait::async_trait]
impl InboundStreamHandler for RowInboundStreamHandler {
    async fn run(
        &self,
        flow_ctx: Arc<FlowCtx>,
        stream: &mut FlowStreamServer,
    ) -> error_stack::Result<(), Error> {
        let result = self.process(&flow_ctx, stream).await;
        if let Err(report) = &result {
            let meta = RowMessage::Meta(error_metadata(report));
            // A canceled flow's consumer may never read again.
            flow_ctx.or_canceled(self.receiver.push(meta)).await;
        }
        self.receiver.producer_done();
        result
    }

    async fn timeout(&self, err: MetadataError) {
        self.receiver
            .push(RowMessage::Meta(ProducerMetadata::Error(err)))
            .await;
        self.receiver.producer_done();
    }
}

#[cfg(test)]
mod tests {
    use sluice_api::{consumer_signal, ProducerMessage};
    use sluice_core::ErrorKind;
    use sluice_execinfra::{flow_stream_pair, RowBuffer};
    use sluice_testing::{int_column, int_row, int_types};

    use super::*;
    use crate::tests::flow_ctx;
    use crate::wire::DataEncoder;

    fn data(rows: &[i64], with_types: bool) -> ProducerMessage {
        let mut encoder = DataEncoder::new(int_types(1));
        if !with_types {
            encoder.flush();
        }
        for i in rows {
            encoder.add_row(&int_row(&[*i]));
        }
        ProducerMessage::data(encoder.flush())
    }

    #[tokio::test]
    async fn test_rows_and_metadata_reach_receiver() {
        let buffer = RowBuffer::new(int_types(1));
        let handler = RowInboundStreamHandler::new(buffer.clone(), int_types(1));
        let (client, mut server) = flow_stream_pair();

        client.messages.send(&data(&[1, 2], true)).await.unwrap();
        client.messages.send(&data(&[3], false)).await.unwrap();
        let meta = ProducerMetadata::Error(MetadataError::new(ErrorKind::Internal, "remote"));
        client
            .messages
            .send(&ProducerMessage::metadata(&meta))
            .await
            .unwrap();
        drop(client);

        handler.run(flow_ctx(), &mut server).await.unwrap();
        let (rows, metas) = buffer.take_all();
        assert_eq!(int_column(&rows, 0), vec![1, 2, 3]);
        assert_eq!(metas, vec![meta]);
        assert!(buffer.is_producer_done());
    }

    #[tokio::test]
    async fn test_drain_and_close_are_signaled() {
        let buffer = RowBuffer::new(int_types(1));
        let handler = RowInboundStreamHandler::new(buffer.clone(), int_types(1));
        let (mut client, mut server) = flow_stream_pair();
        let flow_ctx = flow_ctx();
        let run = tokio::spawn(async move { handler.run(flow_ctx, &mut server).await });

        buffer.set_status(ConsumerStatus::DrainRequested);
        client.messages.send(&data(&[1], true)).await.unwrap();
        let signal = client.signals.recv().await.unwrap().unwrap();
        assert!(matches!(
            signal.value,
            Some(consumer_signal::Value::DrainRequest(_))
        ));

        buffer.set_status(ConsumerStatus::ConsumerClosed);
        client.messages.send(&data(&[2], false)).await.unwrap();
        let signal = client.signals.recv().await.unwrap().unwrap();
        assert!(matches!(signal.value, Some(consumer_signal::Value::Close(_))));

        run.await.unwrap().unwrap();
        assert!(buffer.is_producer_done());
    }

    #[tokio::test]
    async fn test_header_on_established_stream_fails() {
        let buffer = RowBuffer::new(int_types(1));
        let handler = RowInboundStreamHandler::new(buffer.clone(), int_types(1));
        let (client, mut server) = flow_stream_pair();
        client
            .messages
            .send(&ProducerMessage::header(sluice_core::FlowId::new_v4(), 1u32.into()))
            .await
            .unwrap();

        let err = handler.run(flow_ctx(), &mut server).await.unwrap_err();
        assert_eq!(err.current_context(), &Error::UnexpectedMessage("header"));
        let (_, metas) = buffer.take_all();
        assert_eq!(metas[0].error().unwrap().kind, ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_cancel_stops_the_stream() {
        let buffer = RowBuffer::new(int_types(1));
        let handler = RowInboundStreamHandler::new(buffer.clone(), int_types(1));
        let (_client, mut server) = flow_stream_pair();
        let flow_ctx = flow_ctx();
        flow_ctx.cancel.cancel();

        let err = handler.run(flow_ctx, &mut server).await.unwrap_err();
        assert_eq!(err.current_context(), &Error::QueryCanceled);
        let (_, metas) = buffer.take_all();
        assert_eq!(metas[0].error().unwrap().kind, ErrorKind::QueryCanceled);
    }
}
