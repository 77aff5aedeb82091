use std::collections::BTreeMap;

use crate::NodeId;

/// Trailing information a producer sends alongside its rows.
///
/// Every record carries exactly one kind of information. Metadata is not
/// ordered with respect to rows on the same stream.
#[derive(Clone, Debug, PartialEq, derive_more::From)]
pub enum ProducerMetadata {
    /// Range descriptors the producer learned about.
    Ranges(Vec<RangeInfo>),
    /// An error encountered by the producer or anything upstream of it.
    Error(MetadataError),
    /// Recorded trace spans.
    TraceData(Vec<RecordedSpan>),
    /// Opaque transaction coordinator delta.
    TxnCoordMeta(TxnCoordMeta),
    /// Row-number witness used to check delivery in tests.
    RowNum(RowNum),
    /// Progress of a sampler.
    SamplerProgress(SamplerProgress),
    /// Summary of a bulk operation.
    BulkProcessorProgress(BulkOpSummary),
}

impl ProducerMetadata {
    /// Creates error metadata from an error report.
    pub fn from_report<C>(kind: ErrorKind, report: &error_stack::Report<C>) -> Self {
        ProducerMetadata::Error(MetadataError::from_report(kind, report))
    }

    pub fn error(&self) -> Option<&MetadataError> {
        match self {
            ProducerMetadata::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            ProducerMetadata::Ranges(_) => "ranges",
            ProducerMetadata::Error(_) => "error",
            ProducerMetadata::TraceData(_) => "trace_data",
            ProducerMetadata::TxnCoordMeta(_) => "txn_coord_meta",
            ProducerMetadata::RowNum(_) => "row_num",
            ProducerMetadata::SamplerProgress(_) => "sampler_progress",
            ProducerMetadata::BulkProcessorProgress(_) => "bulk_processor_progress",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeInfo {
    pub range_id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub lease_holder: NodeId,
}

/// A finished trace span with its tags.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordedSpan {
    pub operation: String,
    pub tags: BTreeMap<String, String>,
    pub duration_micros: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnCoordMeta {
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowNum {
    pub sender_id: String,
    pub row_num: i32,
    /// Whether this is the last witness from this sender.
    pub last_msg: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SamplerProgress {
    pub rows_processed: u64,
    pub histogram_disabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BulkOpSummary {
    pub data_size: i64,
    pub rows: i64,
    pub index_entries: i64,
}

/// The class of an error carried through a row stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ErrorKind {
    #[display(fmt = "query canceled")]
    QueryCanceled,
    #[display(fmt = "no inbound stream connection")]
    NoInboundStreamConnection,
    #[display(fmt = "setup")]
    Setup,
    #[display(fmt = "registry")]
    Registry,
    #[display(fmt = "transport")]
    Transport,
    #[display(fmt = "resource")]
    Resource,
    #[display(fmt = "ordering violation")]
    OrderingViolation,
    #[display(fmt = "internal")]
    Internal,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::QueryCanceled,
        ErrorKind::NoInboundStreamConnection,
        ErrorKind::Setup,
        ErrorKind::Registry,
        ErrorKind::Transport,
        ErrorKind::Resource,
        ErrorKind::OrderingViolation,
        ErrorKind::Internal,
    ];
}

/// An error that travels through row streams as metadata.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "{kind}: {message}")]
pub struct MetadataError {
    pub kind: ErrorKind,
    pub message: String,
}

impl error_stack::Context for MetadataError {}

impl MetadataError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Flattens a report into a message, keeping every context in the chain.
    pub fn from_report<C>(kind: ErrorKind, report: &error_stack::Report<C>) -> Self {
        let message = report
            .frames()
            .filter_map(|frame| match frame.kind() {
                error_stack::FrameKind::Context(context) => Some(context.to_string()),
                error_stack::FrameKind::Attachment(_) => None,
            })
            .collect::<Vec<_>>()
            .join(": ");
        Self { kind, message }
    }

    pub fn query_canceled() -> Self {
        Self::new(ErrorKind::QueryCanceled, "query execution canceled")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(derive_more::Display, Debug)]
    #[display(fmt = "outer")]
    struct Outer;
    impl error_stack::Context for Outer {}

    #[derive(derive_more::Display, Debug)]
    #[display(fmt = "inner")]
    struct Inner;
    impl error_stack::Context for Inner {}

    #[test]
    fn test_from_report_keeps_chain() {
        use error_stack::ResultExt;

        let result: error_stack::Result<(), Inner> = Err(error_stack::Report::new(Inner));
        let report = result
            .attach_printable("ignored")
            .change_context(Outer)
            .unwrap_err();
        let err = MetadataError::from_report(ErrorKind::Transport, &report);
        assert_eq!(err.message, "outer: inner");
        assert_eq!(err.to_string(), "transport: outer: inner");
    }
}
