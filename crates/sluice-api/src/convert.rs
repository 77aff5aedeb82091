use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use error_stack::{IntoReport, ResultExt};
use sluice_core::{
    BulkOpSummary, ColumnType, ErrorKind, FlowId, MetadataError, NodeId, ProducerMetadata,
    RangeInfo, RecordedSpan, RowNum, SamplerProgress, StreamId, TxnCoordMeta,
};

use crate::{
    consumer_signal, producer_message, remote_producer_metadata, CloseSignal, ConsumerHandshake,
    ConsumerSignal, DrainRequest, Error, ProducerData, ProducerHeader, ProducerMessage, RangeInfos,
    RemoteProducerMetadata, Timestamp, TraceData, WireBulkOpSummary, WireColumnType, WireError,
    WireErrorKind, WireRangeInfo, WireRowNum, WireSamplerProgress, WireSpan, MIN_ACCEPTED_VERSION,
    VERSION,
};

/// Encodes a message into a frame for the transport.
pub fn encode_frame<M: prost::Message>(message: &M) -> Bytes {
    Bytes::from(message.encode_to_vec())
}

/// Decodes a frame received from the transport.
pub fn decode_frame<M: prost::Message + Default>(
    frame: Bytes,
    what: &'static str,
) -> error_stack::Result<M, Error> {
    M::decode(frame)
        .into_report()
        .change_context(Error::Decode(what))
}

impl ProducerMessage {
    pub fn header(flow_id: FlowId, stream_id: StreamId) -> Self {
        Self {
            value: Some(producer_message::Value::Header(ProducerHeader {
                flow_id: flow_id.as_bytes().to_vec(),
                stream_id: stream_id.0,
            })),
        }
    }

    pub fn data(data: ProducerData) -> Self {
        Self {
            value: Some(producer_message::Value::Data(data)),
        }
    }

    pub fn metadata(metadata: &ProducerMetadata) -> Self {
        Self {
            value: Some(producer_message::Value::Metadata(metadata.into())),
        }
    }
}

impl ProducerHeader {
    pub fn flow_id(&self) -> error_stack::Result<FlowId, Error> {
        FlowId::from_slice(&self.flow_id)
            .ok_or_else(|| error_stack::Report::new(Error::InvalidFlowId))
    }

    pub fn stream_id(&self) -> StreamId {
        StreamId(self.stream_id)
    }
}

impl ProducerData {
    pub fn set_typing(&mut self, types: &[ColumnType]) {
        self.typing = types
            .iter()
            .map(|t| WireColumnType::from(*t) as i32)
            .collect();
    }

    /// The column types carried by this message, if any.
    pub fn column_types(&self) -> error_stack::Result<Option<Vec<ColumnType>>, Error> {
        if self.typing.is_empty() {
            return Ok(None);
        }
        let types = self
            .typing
            .iter()
            .map(|value| {
                WireColumnType::from_i32(*value)
                    .map(ColumnType::from)
                    .ok_or_else(|| {
                        error_stack::Report::new(Error::UnknownEnumValue {
                            what: "column type",
                            value: *value,
                        })
                    })
            })
            .collect::<error_stack::Result<Vec<_>, _>>()?;
        Ok(Some(types))
    }
}

impl From<ColumnType> for WireColumnType {
    fn from(value: ColumnType) -> Self {
        match value {
            ColumnType::Bool => WireColumnType::Bool,
            ColumnType::Int => WireColumnType::Int,
            ColumnType::Float => WireColumnType::Float,
            ColumnType::String => WireColumnType::String,
            ColumnType::Bytes => WireColumnType::Bytes,
        }
    }
}

impl From<WireColumnType> for ColumnType {
    fn from(value: WireColumnType) -> Self {
        match value {
            WireColumnType::Bool => ColumnType::Bool,
            WireColumnType::Int => ColumnType::Int,
            WireColumnType::Float => ColumnType::Float,
            WireColumnType::String => ColumnType::String,
            WireColumnType::Bytes => ColumnType::Bytes,
        }
    }
}

impl From<ErrorKind> for WireErrorKind {
    fn from(value: ErrorKind) -> Self {
        match value {
            ErrorKind::Internal => WireErrorKind::Internal,
            ErrorKind::QueryCanceled => WireErrorKind::QueryCanceled,
            ErrorKind::NoInboundStreamConnection => WireErrorKind::NoInboundStreamConnection,
            ErrorKind::Setup => WireErrorKind::Setup,
            ErrorKind::Registry => WireErrorKind::Registry,
            ErrorKind::Transport => WireErrorKind::Transport,
            ErrorKind::Resource => WireErrorKind::Resource,
            ErrorKind::OrderingViolation => WireErrorKind::OrderingViolation,
        }
    }
}

impl From<WireErrorKind> for ErrorKind {
    fn from(value: WireErrorKind) -> Self {
        match value {
            WireErrorKind::Internal => ErrorKind::Internal,
            WireErrorKind::QueryCanceled => ErrorKind::QueryCanceled,
            WireErrorKind::NoInboundStreamConnection => ErrorKind::NoInboundStreamConnection,
            WireErrorKind::Setup => ErrorKind::Setup,
            WireErrorKind::Registry => ErrorKind::Registry,
            WireErrorKind::Transport => ErrorKind::Transport,
            WireErrorKind::Resource => ErrorKind::Resource,
            WireErrorKind::OrderingViolation => ErrorKind::OrderingViolation,
        }
    }
}

impl From<&ProducerMetadata> for RemoteProducerMetadata {
    fn from(metadata: &ProducerMetadata) -> Self {
        use remote_producer_metadata::Value;

        let value = match metadata {
            ProducerMetadata::Ranges(ranges) => Value::RangeInfo(RangeInfos {
                ranges: ranges
                    .iter()
                    .map(|range| WireRangeInfo {
                        range_id: range.range_id,
                        start_key: range.start_key.clone(),
                        end_key: range.end_key.clone(),
                        lease_holder: range.lease_holder.0,
                    })
                    .collect(),
            }),
            ProducerMetadata::Error(err) => Value::Error(WireError {
                kind: WireErrorKind::from(err.kind) as i32,
                message: err.message.clone(),
            }),
            ProducerMetadata::TraceData(spans) => Value::TraceData(TraceData {
                spans: spans
                    .iter()
                    .map(|span| WireSpan {
                        operation: span.operation.clone(),
                        tags: span.tags.clone(),
                        duration_micros: span.duration_micros,
                    })
                    .collect(),
            }),
            ProducerMetadata::TxnCoordMeta(meta) => Value::TxnCoordMeta(meta.data.clone()),
            ProducerMetadata::RowNum(row_num) => Value::RowNum(WireRowNum {
                sender_id: row_num.sender_id.clone(),
                row_num: row_num.row_num,
                last_msg: row_num.last_msg,
            }),
            ProducerMetadata::SamplerProgress(progress) => {
                Value::SamplerProgress(WireSamplerProgress {
                    rows_processed: progress.rows_processed,
                    histogram_disabled: progress.histogram_disabled,
                })
            }
            ProducerMetadata::BulkProcessorProgress(summary) => {
                Value::BulkProcessorProgress(WireBulkOpSummary {
                    data_size: summary.data_size,
                    rows: summary.rows,
                    index_entries: summary.index_entries,
                })
            }
        };
        RemoteProducerMetadata { value: Some(value) }
    }
}

impl TryFrom<RemoteProducerMetadata> for ProducerMetadata {
    type Error = error_stack::Report<Error>;

    fn try_from(metadata: RemoteProducerMetadata) -> Result<Self, Self::Error> {
        use remote_producer_metadata::Value;

        let value = metadata
            .value
            .ok_or_else(|| error_stack::Report::new(Error::MissingValue("metadata")))?;
        let metadata = match value {
            Value::RangeInfo(ranges) => ProducerMetadata::Ranges(
                ranges
                    .ranges
                    .into_iter()
                    .map(|range| RangeInfo {
                        range_id: range.range_id,
                        start_key: range.start_key,
                        end_key: range.end_key,
                        lease_holder: NodeId(range.lease_holder),
                    })
                    .collect(),
            ),
            Value::Error(err) => {
                let kind = WireErrorKind::from_i32(err.kind).ok_or_else(|| {
                    error_stack::Report::new(Error::UnknownEnumValue {
                        what: "error kind",
                        value: err.kind,
                    })
                })?;
                ProducerMetadata::Error(MetadataError::new(kind.into(), err.message))
            }
            Value::TraceData(trace) => ProducerMetadata::TraceData(
                trace
                    .spans
                    .into_iter()
                    .map(|span| RecordedSpan {
                        operation: span.operation,
                        tags: span.tags,
                        duration_micros: span.duration_micros,
                    })
                    .collect(),
            ),
            Value::TxnCoordMeta(data) => ProducerMetadata::TxnCoordMeta(TxnCoordMeta { data }),
            Value::RowNum(row_num) => ProducerMetadata::RowNum(RowNum {
                sender_id: row_num.sender_id,
                row_num: row_num.row_num,
                last_msg: row_num.last_msg,
            }),
            Value::SamplerProgress(progress) => ProducerMetadata::SamplerProgress(SamplerProgress {
                rows_processed: progress.rows_processed,
                histogram_disabled: progress.histogram_disabled,
            }),
            Value::BulkProcessorProgress(summary) => {
                ProducerMetadata::BulkProcessorProgress(BulkOpSummary {
                    data_size: summary.data_size,
                    rows: summary.rows,
                    index_entries: summary.index_entries,
                })
            }
        };
        Ok(metadata)
    }
}

impl From<SystemTime> for Timestamp {
    fn from(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs() as i64,
            nanos: since_epoch.subsec_nanos() as i32,
        }
    }
}

impl From<Timestamp> for SystemTime {
    fn from(ts: Timestamp) -> Self {
        UNIX_EPOCH + Duration::new(ts.seconds.max(0) as u64, ts.nanos.max(0) as u32)
    }
}

impl ConsumerHandshake {
    /// A handshake from this node.
    pub fn new(consumer_scheduled: bool, deadline: Option<SystemTime>) -> Self {
        Self {
            consumer_scheduled,
            consumer_schedule_deadline: deadline.map(Timestamp::from),
            version: VERSION,
            min_accepted_version: MIN_ACCEPTED_VERSION,
        }
    }

    /// Checks that a producer on this node can talk to the consumer that sent
    /// this handshake.
    pub fn check_compatible(&self) -> error_stack::Result<(), Error> {
        error_stack::ensure!(
            self.version >= MIN_ACCEPTED_VERSION && self.min_accepted_version <= VERSION,
            Error::VersionMismatch {
                peer_version: self.version,
                peer_min_accepted: self.min_accepted_version,
            }
        );
        Ok(())
    }
}

impl ConsumerSignal {
    pub fn handshake(handshake: ConsumerHandshake) -> Self {
        Self {
            value: Some(consumer_signal::Value::Handshake(handshake)),
        }
    }

    pub fn drain_request() -> Self {
        Self {
            value: Some(consumer_signal::Value::DrainRequest(DrainRequest {})),
        }
    }

    pub fn close() -> Self {
        Self {
            value: Some(consumer_signal::Value::Close(CloseSignal {})),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn test_metadata_through_frame() {
        let metadata = ProducerMetadata::TraceData(vec![RecordedSpan {
            operation: "router output 3".to_owned(),
            tags: BTreeMap::from([("rows".to_owned(), "10".to_owned())]),
            duration_micros: 5,
        }]);
        let frame = encode_frame(&ProducerMessage::metadata(&metadata));
        let message: ProducerMessage = decode_frame(frame, "producer message").unwrap();
        let Some(producer_message::Value::Metadata(remote)) = message.value else {
            panic!("expected metadata")
        };
        assert_eq!(ProducerMetadata::try_from(remote).unwrap(), metadata);
    }

    #[test]
    fn test_metadata_without_value_is_rejected() {
        let err = ProducerMetadata::try_from(RemoteProducerMetadata { value: None }).unwrap_err();
        assert!(matches!(err.current_context(), Error::MissingValue(_)));
    }

    #[test]
    fn test_header_flow_id() {
        let flow_id = FlowId::new_v4();
        let message = ProducerMessage::header(flow_id, StreamId(7));
        let Some(producer_message::Value::Header(header)) = message.value else {
            panic!("expected header")
        };
        assert_eq!(header.flow_id().unwrap(), flow_id);
        assert_eq!(header.stream_id(), StreamId(7));
    }

    #[test]
    fn test_version_compatibility() {
        assert!(ConsumerHandshake::new(true, None).check_compatible().is_ok());

        let mut newer = ConsumerHandshake::new(true, None);
        newer.version = VERSION + 2;
        newer.min_accepted_version = VERSION + 1;
        let err = newer.check_compatible().unwrap_err();
        assert!(matches!(
            err.current_context(),
            Error::VersionMismatch { .. }
        ));
    }

    #[test]
    fn test_typing() {
        let mut data = ProducerData::default();
        assert_eq!(data.column_types().unwrap(), None);
        data.set_typing(&[ColumnType::Int, ColumnType::String]);
        assert_eq!(
            data.column_types().unwrap(),
            Some(vec![ColumnType::Int, ColumnType::String])
        );
    }
}
