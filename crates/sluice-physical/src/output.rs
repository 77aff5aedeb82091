use sluice_core::encoding::DatumEncoding;

use crate::{StreamEndpointSpec, StreamType};

/// How a processor's output is split across its streams.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OutputRouterSpec {
    #[serde(flatten)]
    pub router: RouterType,
    pub streams: Vec<StreamEndpointSpec>,
    /// Limits the router to a single in-flight output at a time.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable_buffering: bool,
}

impl OutputRouterSpec {
    pub fn pass_through(stream: StreamEndpointSpec) -> Self {
        Self::new(RouterType::PassThrough, vec![stream])
    }

    pub fn new(router: RouterType, streams: Vec<StreamEndpointSpec>) -> Self {
        Self {
            router,
            streams,
            disable_buffering: false,
        }
    }

    /// Index of the first `LOCAL` stream, if any.
    pub fn local_stream_index(&self) -> Option<usize> {
        self.streams
            .iter()
            .position(|stream| stream.stream_type == StreamType::Local)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouterType {
    /// A single stream fed directly by the processor.
    PassThrough,
    /// Every row goes to every stream.
    Mirror,
    /// Rows are partitioned by a hash of the given columns.
    ByHash { hash_columns: Vec<usize> },
    /// Rows are partitioned by the span containing their encoded key.
    ByRange(RangeRouterSpec),
    /// Hash partitioning with special handling of skewed keys.
    ByMixHash {
        hash_columns: Vec<usize>,
        rules: Vec<MixHashRule>,
    },
}

impl RouterType {
    pub fn name(&self) -> &'static str {
        match self {
            RouterType::PassThrough => "PASS_THROUGH",
            RouterType::Mirror => "MIRROR",
            RouterType::ByHash { .. } => "BY_HASH",
            RouterType::ByRange(_) => "BY_RANGE",
            RouterType::ByMixHash { .. } => "BY_MIX_HASH",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RangeRouterSpec {
    /// Sorted, non-overlapping spans.
    pub spans: Vec<RangeSpan>,
    /// The routing columns, in key order.
    pub encodings: Vec<ColumnEncoding>,
    /// Index of the stream receiving rows outside every span.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_dest: Option<usize>,
}

/// The half-open key span `[start, end)` routed to a stream.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RangeSpan {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
    /// Index into the router's streams.
    pub stream: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ColumnEncoding {
    pub column: usize,
    #[serde(default)]
    pub encoding: DatumEncoding,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MixHashMode {
    /// Skewed keys go to every stream.
    HashMirror,
    /// Skewed keys go to the local stream.
    HashLocal,
    /// Skewed keys are spread round-robin.
    HashAverage,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MixHashRule {
    pub mode: MixHashMode,
    pub skew_keys: Vec<i64>,
}
