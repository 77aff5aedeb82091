use std::sync::Arc;

use sluice_core::ConsumerStatus;

use super::{BatchSink, ColumnBatch};
use crate::router::hash_bucket_of;

/// Splits batches by the hash of their key columns.
///
/// Rows land on the same output as with the row hash router. Outputs that
/// stopped accepting batches are skipped.
pub struct HashBatchRouter {
    hash_columns: Vec<usize>,
    outputs: Vec<Arc<dyn BatchSink>>,
    statuses: parking_lot::Mutex<Vec<ConsumerStatus>>,
}

impl std::fmt::Debug for HashBatchRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashBatchRouter")
            .field("hash_columns", &self.hash_columns)
            .field("statuses", &self.statuses.lock())
            .finish_non_exhaustive()
    }
}

impl HashBatchRouter {
    pub fn new(hash_columns: Vec<usize>, outputs: Vec<Arc<dyn BatchSink>>) -> Self {
        let statuses = vec![ConsumerStatus::NeedMoreRows; outputs.len()];
        Self {
            hash_columns,
            outputs,
            statuses: parking_lot::Mutex::new(statuses),
        }
    }

    /// Row indices of `batch` per output.
    fn partition(&self, batch: &ColumnBatch) -> Vec<Vec<usize>> {
        let n = self.outputs.len();
        let columns: Vec<_> = self
            .hash_columns
            .iter()
            .map(|c| batch.column(*c).unwrap_or_default())
            .collect();
        let mut selections = vec![Vec::new(); n];
        for row in 0..batch.len() {
            let bucket = hash_bucket_of(columns.iter().filter_map(|column| column.get(row)), n);
            selections[bucket].push(row);
        }
        selections
    }

    fn aggregate(statuses: &[ConsumerStatus]) -> ConsumerStatus {
        if statuses.contains(&ConsumerStatus::NeedMoreRows) {
            ConsumerStatus::NeedMoreRows
        } else if statuses.contains(&ConsumerStatus::DrainRequested) {
            ConsumerStatus::DrainRequested
        } else {
            ConsumerStatus::ConsumerClosed
        }
    }
}

#[async_trait::async_trait]
impl BatchSink for HashBatchRouter {
    async fn push(&self, batch: ColumnBatch) -> ConsumerStatus {
        let selections = self.partition(&batch);
        let current = self.statuses.lock().clone();
        let mut updated = current.clone();
        for (index, selection) in selections.into_iter().enumerate() {
            if selection.is_empty() || current[index] == ConsumerStatus::ConsumerClosed {
                continue;
            }
            updated[index] = self.outputs[index].push(batch.select(&selection)).await;
        }
        let mut statuses = self.statuses.lock();
        for (status, new) in statuses.iter_mut().zip(updated) {
            *status = (*status).max(new);
        }
        Self::aggregate(&statuses)
    }

    fn producer_done(&self) {
        for output in &self.outputs {
            output.producer_done();
        }
    }
}
