use sluice_core::{ErrorKind, FlowId, ProcessorId, StreamId};

/// Errors setting up, registering and running flows.
#[derive(derive_more::Display, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Setup.
    #[display(fmt = "no streams in router")]
    NoStreams,
    #[display(fmt = "{router} router requires at least two streams, got {count}")]
    TooFewStreams { router: &'static str, count: usize },
    #[display(fmt = "hash router requires at least one hash column")]
    NoHashColumns,
    #[display(fmt = "range router requires at least one encoding")]
    NoRangeEncodings,
    #[display(fmt = "span {_0} not after previous span")]
    UnsortedSpan(usize),
    #[display(fmt = "span {span} routes to stream {stream} but the router has {streams} streams")]
    InvalidSpanStream {
        span: usize,
        stream: usize,
        streams: usize,
    },
    #[display(fmt = "mix hash router requires exactly one hash column, got {_0}")]
    MixHashColumns(usize),
    #[display(fmt = "mix hash router supports one or two rules, got {_0}")]
    MixHashRules(usize),
    #[display(fmt = "mix hash rule {_0} has no skew keys")]
    EmptySkewKeys(usize),
    #[display(fmt = "mix hash rules overlap on key {_0}")]
    OverlappingSkewKeys(i64),
    #[display(fmt = "HASH_LOCAL rule requires a local stream")]
    NoLocalStream,
    #[display(fmt = "processor {processor_id} has {count} outputs, only single-output processors are supported")]
    OutputCount {
        processor_id: ProcessorId,
        count: usize,
    },
    #[display(fmt = "PASS_THROUGH output requires exactly one stream, got {_0}")]
    PassThroughStreams(usize),
    #[display(fmt = "input synchronizer of processor {_0} has no streams")]
    EmptyInputSync(ProcessorId),
    #[display(fmt = "duplicate inbound stream {_0}")]
    DuplicateInboundStream(StreamId),
    #[display(fmt = "inbound stream {_0} of type SYNC_RESPONSE")]
    InboundSyncResponse(StreamId),
    #[display(fmt = "remote stream {_0} has no target node")]
    MissingTargetNode(StreamId),
    #[display(fmt = "local stream {_0} has no consumer")]
    UnconnectedStream(StreamId),
    #[display(fmt = "stream {_0} has multiple connections")]
    MultipleConnections(StreamId),
    #[display(fmt = "local stream {_0} has no producer")]
    NoProducer(StreamId),
    #[display(fmt = "flow has a sync response stream but no sync consumer")]
    MissingSyncConsumer,
    #[display(fmt = "processor graph has a cycle")]
    Cycle,
    #[display(fmt = "creating processor {_0}")]
    CreateProcessor(ProcessorId),
    #[display(fmt = "creating router of processor {_0}")]
    CreateRouter(ProcessorId),
    #[display(fmt = "hash column {column}, output with only {width} columns")]
    HashColumnOutOfRange { column: usize, width: usize },
    #[display(fmt = "vectorized execution does not support {_0}")]
    Unsupported(String),
    #[display(fmt = "server is draining")]
    ServerDraining,

    // Registry.
    #[display(fmt = "flow {_0} already registered")]
    AlreadyRegistered(FlowId),
    #[display(fmt = "registry is draining")]
    RegistryDraining,
    #[display(fmt = "flow {_0} not found")]
    FlowNotFound(FlowId),
    #[display(fmt = "stream {stream_id} of flow {flow_id} not found")]
    StreamNotFound { flow_id: FlowId, stream_id: StreamId },
    #[display(fmt = "stream {stream_id} of flow {flow_id} already connected")]
    StreamAlreadyConnected { flow_id: FlowId, stream_id: StreamId },
    #[display(fmt = "stream {stream_id} of flow {flow_id} came too late")]
    StreamTooLate { flow_id: FlowId, stream_id: StreamId },

    // Transport.
    #[display(fmt = "sending handshake")]
    SendHandshake,
    #[display(fmt = "expected stream header, got {_0}")]
    MissingHeader(&'static str),
    #[display(fmt = "unexpected {_0} on established stream")]
    UnexpectedMessage(&'static str),
    #[display(fmt = "decoding rows")]
    DecodeRows,
    #[display(fmt = "decoding metadata")]
    DecodeMetadata,
    #[display(fmt = "receiving from producer")]
    Receive,
    #[display(fmt = "sending to consumer")]
    Send,
    #[display(fmt = "dialing node {_0}")]
    Dial(sluice_core::NodeId),
    #[display(fmt = "incompatible consumer")]
    Handshake,
    #[display(fmt = "stream {_0} failed")]
    Outbox(StreamId),

    // Cancellation.
    #[display(fmt = "query execution canceled")]
    QueryCanceled,
    #[display(fmt = "no inbound stream connection")]
    NoInboundStreamConnection,

    // Resources.
    #[display(fmt = "router output {_0} failed to buffer rows")]
    RouterBuffer(StreamId),
    #[display(fmt = "row does not match any range span")]
    NoRangeSpan,
    #[display(fmt = "encoding routing key")]
    EncodeKey,
    #[display(fmt = "mix hash key in column {_0} is not an integer")]
    MixHashKey(usize),

    // Internal.
    #[display(fmt = "processor panicked: {_0}")]
    Panic(String),
}

impl error_stack::Context for Error {}

impl Error {
    /// The class of this error when it travels as metadata.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AlreadyRegistered(_)
            | Error::RegistryDraining
            | Error::FlowNotFound(_)
            | Error::StreamNotFound { .. }
            | Error::StreamAlreadyConnected { .. }
            | Error::StreamTooLate { .. } => ErrorKind::Registry,
            Error::SendHandshake
            | Error::MissingHeader(_)
            | Error::UnexpectedMessage(_)
            | Error::DecodeRows
            | Error::DecodeMetadata
            | Error::Receive
            | Error::Send
            | Error::Dial(_)
            | Error::Handshake
            | Error::Outbox(_) => ErrorKind::Transport,
            Error::QueryCanceled => ErrorKind::QueryCanceled,
            Error::NoInboundStreamConnection => ErrorKind::NoInboundStreamConnection,
            Error::RouterBuffer(_) => ErrorKind::Resource,
            Error::NoRangeSpan
            | Error::EncodeKey
            | Error::MixHashKey(_)
            | Error::Panic(_) => ErrorKind::Internal,
            _ => ErrorKind::Setup,
        }
    }
}

/// Converts a report into metadata, classifying it by its top context.
pub(crate) fn error_metadata(report: &error_stack::Report<Error>) -> sluice_core::ProducerMetadata {
    sluice_core::ProducerMetadata::from_report(report.current_context().kind(), report)
}
