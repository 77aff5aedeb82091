use std::marker::PhantomData;

use bytes::Bytes;
use error_stack::ResultExt;
use sluice_api::{ConsumerSignal, ProducerMessage};
use sluice_core::NodeId;
use tokio::sync::mpsc;

use crate::Error;

/// Frames buffered per direction of an in-process stream.
const STREAM_BUFFER: usize = 16;

/// Sends protobuf messages as encoded frames.
pub struct FrameSender<M> {
    tx: mpsc::Sender<Bytes>,
    _message: PhantomData<fn(M)>,
}

impl<M: prost::Message> FrameSender<M> {
    pub async fn send(&self, message: &M) -> error_stack::Result<(), Error> {
        self.tx
            .send(sluice_api::encode_frame(message))
            .await
            .map_err(|_| error_stack::Report::new(Error::StreamClosed))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receives protobuf messages from encoded frames.
pub struct FrameReceiver<M> {
    rx: mpsc::Receiver<Bytes>,
    what: &'static str,
    _message: PhantomData<fn() -> M>,
}

impl<M: prost::Message + Default> FrameReceiver<M> {
    /// The next message, or `None` once the peer closed its side.
    pub async fn recv(&mut self) -> error_stack::Result<Option<M>, Error> {
        match self.rx.recv().await {
            Some(frame) => sluice_api::decode_frame(frame, self.what)
                .change_context(Error::Decode(self.what))
                .map(Some),
            None => Ok(None),
        }
    }
}

fn frame_channel<M>(what: &'static str) -> (FrameSender<M>, FrameReceiver<M>) {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    (
        FrameSender {
            tx,
            _message: PhantomData,
        },
        FrameReceiver {
            rx,
            what,
            _message: PhantomData,
        },
    )
}

/// The producer's end of a `FlowStream` RPC.
///
/// Dropping `messages` closes the send direction.
pub struct FlowStreamClient {
    pub messages: FrameSender<ProducerMessage>,
    pub signals: FrameReceiver<ConsumerSignal>,
}

/// The consumer's end of a `FlowStream` RPC.
pub struct FlowStreamServer {
    pub messages: FrameReceiver<ProducerMessage>,
    pub signals: FrameSender<ConsumerSignal>,
}

/// Creates both ends of an in-process `FlowStream`.
pub fn flow_stream_pair() -> (FlowStreamClient, FlowStreamServer) {
    let (message_tx, message_rx) = frame_channel("producer message");
    let (signal_tx, signal_rx) = frame_channel("consumer signal");
    (
        FlowStreamClient {
            messages: message_tx,
            signals: signal_rx,
        },
        FlowStreamServer {
            messages: message_rx,
            signals: signal_tx,
        },
    )
}

/// Opens `FlowStream` RPCs to other nodes.
#[async_trait::async_trait]
pub trait NodeDialer: Send + Sync {
    async fn flow_stream(&self, node: NodeId) -> error_stack::Result<FlowStreamClient, Error>;
}
