//! Protobuf messages, declared with `prost` derives.

/// A message on the producer-to-consumer direction of a stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProducerMessage {
    #[prost(oneof = "producer_message::Value", tags = "1, 2, 3")]
    pub value: Option<producer_message::Value>,
}

pub mod producer_message {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        /// Identifies the stream. Sent exactly once, first.
        #[prost(message, tag = "1")]
        Header(super::ProducerHeader),
        #[prost(message, tag = "2")]
        Data(super::ProducerData),
        #[prost(message, tag = "3")]
        Metadata(super::RemoteProducerMetadata),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ProducerHeader {
    /// The 16 bytes of the flow UUID.
    #[prost(bytes = "vec", tag = "1")]
    pub flow_id: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub stream_id: u32,
}

/// A batch of encoded rows.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ProducerData {
    /// Concatenated rows in the preferred key encoding.
    #[prost(bytes = "bytes", tag = "1")]
    pub raw_bytes: bytes::Bytes,
    #[prost(int32, tag = "2")]
    pub num_rows: i32,
    /// Column types of the stream. Set on the first data message only.
    #[prost(enumeration = "WireColumnType", repeated, tag = "3")]
    pub typing: Vec<i32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireColumnType {
    Bool = 0,
    Int = 1,
    Float = 2,
    String = 3,
    Bytes = 4,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoteProducerMetadata {
    #[prost(oneof = "remote_producer_metadata::Value", tags = "1, 2, 3, 4, 5, 6, 7")]
    pub value: Option<remote_producer_metadata::Value>,
}

pub mod remote_producer_metadata {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        RangeInfo(super::RangeInfos),
        #[prost(message, tag = "2")]
        Error(super::WireError),
        #[prost(message, tag = "3")]
        TraceData(super::TraceData),
        #[prost(bytes = "vec", tag = "4")]
        TxnCoordMeta(Vec<u8>),
        #[prost(message, tag = "5")]
        RowNum(super::WireRowNum),
        #[prost(message, tag = "6")]
        SamplerProgress(super::WireSamplerProgress),
        #[prost(message, tag = "7")]
        BulkProcessorProgress(super::WireBulkOpSummary),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RangeInfos {
    #[prost(message, repeated, tag = "1")]
    pub ranges: Vec<WireRangeInfo>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireRangeInfo {
    #[prost(uint64, tag = "1")]
    pub range_id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub end_key: Vec<u8>,
    #[prost(uint32, tag = "4")]
    pub lease_holder: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireError {
    #[prost(enumeration = "WireErrorKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireErrorKind {
    Internal = 0,
    QueryCanceled = 1,
    NoInboundStreamConnection = 2,
    Setup = 3,
    Registry = 4,
    Transport = 5,
    Resource = 6,
    OrderingViolation = 7,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TraceData {
    #[prost(message, repeated, tag = "1")]
    pub spans: Vec<WireSpan>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireSpan {
    #[prost(string, tag = "1")]
    pub operation: String,
    #[prost(btree_map = "string, string", tag = "2")]
    pub tags: std::collections::BTreeMap<String, String>,
    #[prost(uint64, tag = "3")]
    pub duration_micros: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireRowNum {
    #[prost(string, tag = "1")]
    pub sender_id: String,
    #[prost(int32, tag = "2")]
    pub row_num: i32,
    #[prost(bool, tag = "3")]
    pub last_msg: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireSamplerProgress {
    #[prost(uint64, tag = "1")]
    pub rows_processed: u64,
    #[prost(bool, tag = "2")]
    pub histogram_disabled: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WireBulkOpSummary {
    #[prost(int64, tag = "1")]
    pub data_size: i64,
    #[prost(int64, tag = "2")]
    pub rows: i64,
    #[prost(int64, tag = "3")]
    pub index_entries: i64,
}

/// A message on the consumer-to-producer direction of a stream.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConsumerSignal {
    #[prost(oneof = "consumer_signal::Value", tags = "1, 2, 3")]
    pub value: Option<consumer_signal::Value>,
}

pub mod consumer_signal {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Value {
        /// The consumer wants no more rows but still accepts metadata.
        #[prost(message, tag = "1")]
        DrainRequest(super::DrainRequest),
        #[prost(message, tag = "2")]
        Close(super::CloseSignal),
        #[prost(message, tag = "3")]
        Handshake(super::ConsumerHandshake),
    }
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct DrainRequest {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct CloseSignal {}

/// Sent by the consumer before it accepts any rows.
///
/// If the consumer flow was not scheduled when the stream arrived, a first
/// handshake says so along with a deadline, and a second handshake follows
/// once the flow is scheduled.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConsumerHandshake {
    #[prost(bool, tag = "1")]
    pub consumer_scheduled: bool,
    #[prost(message, optional, tag = "2")]
    pub consumer_schedule_deadline: Option<Timestamp>,
    #[prost(uint32, tag = "3")]
    pub version: u32,
    #[prost(uint32, tag = "4")]
    pub min_accepted_version: u32,
}

/// Wall time since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, prost::Message)]
pub struct Timestamp {
    #[prost(int64, tag = "1")]
    pub seconds: i64,
    #[prost(int32, tag = "2")]
    pub nanos: i32,
}
