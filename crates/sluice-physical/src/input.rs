use sluice_core::{ColumnOrdering, ColumnType};

use crate::StreamEndpointSpec;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncType {
    #[default]
    Unordered,
    Ordered,
}

/// Merges one or more streams into a single processor input.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InputSyncSpec {
    #[serde(rename = "type", default)]
    pub sync_type: SyncType,
    pub column_types: Vec<ColumnType>,
    /// The ordering of every input stream, and of the merged output for
    /// `ORDERED` synchronizers.
    #[serde(default, skip_serializing_if = "ColumnOrdering::is_empty")]
    pub ordering: ColumnOrdering,
    pub streams: Vec<StreamEndpointSpec>,
}

impl InputSyncSpec {
    pub fn unordered(column_types: Vec<ColumnType>, streams: Vec<StreamEndpointSpec>) -> Self {
        Self {
            sync_type: SyncType::Unordered,
            column_types,
            ordering: ColumnOrdering::default(),
            streams,
        }
    }

    pub fn ordered(
        column_types: Vec<ColumnType>,
        ordering: ColumnOrdering,
        streams: Vec<StreamEndpointSpec>,
    ) -> Self {
        Self {
            sync_type: SyncType::Ordered,
            column_types,
            ordering,
            streams,
        }
    }
}
