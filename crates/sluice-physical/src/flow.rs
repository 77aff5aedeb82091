use error_stack::{IntoReport, ResultExt};
use sluice_core::{ColumnType, FlowId, NodeId, ProcessorId, Row, StreamId};

use crate::{Error, InputSyncSpec, OutputRouterSpec, RouterType, StreamType};

/// The portion of a query executed on one node.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FlowSpec {
    pub flow_id: FlowId,
    /// The node that receives the sync response.
    pub gateway: NodeId,
    pub processors: Vec<ProcessorSpec>,
}

impl FlowSpec {
    pub fn from_yaml(yaml: &str) -> error_stack::Result<Self, Error> {
        serde_yaml::from_str(yaml)
            .into_report()
            .change_context(Error::ParseYaml)
    }

    pub fn to_yaml(&self) -> error_stack::Result<String, Error> {
        serde_yaml::to_string(self)
            .into_report()
            .change_context(Error::SerializeYaml)
    }

    /// Whether any processor writes to a `SYNC_RESPONSE` stream.
    pub fn has_sync_response(&self) -> bool {
        self.processors.iter().any(|p| {
            p.outputs.iter().any(|o| {
                o.streams
                    .iter()
                    .any(|s| s.stream_type == StreamType::SyncResponse)
            })
        })
    }

    /// Remote streams this flow receives.
    pub fn inbound_remote_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.processors
            .iter()
            .flat_map(|p| p.inputs.iter())
            .flat_map(|i| i.streams.iter())
            .filter(|s| s.stream_type == StreamType::Remote)
            .map(|s| s.stream_id)
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProcessorSpec {
    pub processor_id: ProcessorId,
    #[serde(default)]
    pub inputs: Vec<InputSyncSpec>,
    pub core: ProcessorCoreSpec,
    #[serde(default)]
    pub post: PostProcessSpec,
    pub outputs: Vec<OutputRouterSpec>,
}

impl ProcessorSpec {
    /// The single pass-through output stream, if that is this processor's
    /// only output.
    pub fn pass_through_stream(&self) -> Option<&crate::StreamEndpointSpec> {
        match self.outputs.as_slice() {
            [output] if output.router == RouterType::PassThrough && output.streams.len() == 1 => {
                output.streams.first()
            }
            _ => None,
        }
    }
}

/// What a processor computes.
///
/// The runtime only knows the built-in cores; everything else is resolved
/// by the processor factory of the server.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessorCoreSpec {
    /// Emits literal rows.
    Values {
        column_types: Vec<ColumnType>,
        rows: Vec<Row>,
    },
    /// Forwards its single input.
    Noop,
    /// A core provided by the processor factory.
    Custom {
        name: String,
        #[serde(default)]
        params: serde_yaml::Value,
    },
}

impl ProcessorCoreSpec {
    pub fn custom(name: impl Into<String>) -> Self {
        ProcessorCoreSpec::Custom {
            name: name.into(),
            params: serde_yaml::Value::Null,
        }
    }
}

/// Projection and limit applied to a processor's rows before they leave it.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PostProcessSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_columns: Option<Vec<usize>>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}
