use sluice_core::{NodeId, StreamId};

/// Where the other end of a stream lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamType {
    /// Both endpoints are on this node.
    Local,
    /// One endpoint is on another node.
    Remote,
    /// The sink returns rows to the client in the same RPC.
    SyncResponse,
}

/// One endpoint of a stream.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StreamEndpointSpec {
    pub stream_id: StreamId,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
    /// The node on the other end of a `REMOTE` stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_node: Option<NodeId>,
}

impl StreamEndpointSpec {
    pub fn local(stream_id: impl Into<StreamId>) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_type: StreamType::Local,
            target_node: None,
        }
    }

    pub fn remote(stream_id: impl Into<StreamId>, target_node: impl Into<NodeId>) -> Self {
        Self {
            stream_id: stream_id.into(),
            stream_type: StreamType::Remote,
            target_node: Some(target_node.into()),
        }
    }

    pub fn sync_response() -> Self {
        Self {
            stream_id: StreamId(0),
            stream_type: StreamType::SyncResponse,
            target_node: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_endpoint_debug() {
        insta::assert_debug_snapshot!(StreamEndpointSpec::remote(3u32, 2u32), @r###"
        StreamEndpointSpec {
            stream_id: StreamId(
                3,
            ),
            stream_type: Remote,
            target_node: Some(
                NodeId(
                    2,
                ),
            ),
        }
        "###);
    }
}
