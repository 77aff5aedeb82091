use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{AtomicConsumerStatus, ConsumerStatus};
use tokio::sync::mpsc;

use super::ColumnBatch;

/// Batches buffered per sender.
const BATCH_CHANNEL_BUF_SIZE: usize = 4;

/// Where a driver pushes its batches.
#[async_trait::async_trait]
pub trait BatchSink: Send + Sync {
    /// Sends a batch, returning the consumer's status.
    async fn push(&self, batch: ColumnBatch) -> ConsumerStatus;

    /// No more batches follow.
    fn producer_done(&self);
}

/// A bounded FIFO of batches from one or more producers to one consumer.
pub struct BatchChannel;

impl BatchChannel {
    pub fn new(num_senders: usize) -> (Arc<BatchSender>, BatchReceiver) {
        let num_senders = num_senders.max(1);
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_BUF_SIZE * num_senders);
        let status = Arc::new(AtomicConsumerStatus::default());
        let sender = Arc::new(BatchSender {
            status: status.clone(),
            tx: Mutex::new(Some(tx)),
            remaining_senders: AtomicUsize::new(num_senders),
        });
        (sender, BatchReceiver { status, rx })
    }
}

pub struct BatchSender {
    status: Arc<AtomicConsumerStatus>,
    tx: Mutex<Option<mpsc::Sender<ColumnBatch>>>,
    remaining_senders: AtomicUsize,
}

impl std::fmt::Debug for BatchSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSender")
            .field("status", &self.status.load())
            .field("remaining_senders", &self.remaining_senders)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl BatchSink for BatchSender {
    async fn push(&self, batch: ColumnBatch) -> ConsumerStatus {
        let status = self.status.load();
        if status != ConsumerStatus::NeedMoreRows || batch.is_empty() {
            return status;
        }
        let Some(tx) = self.tx.lock().clone() else {
            debug_assert!(false, "push after producer done");
            return ConsumerStatus::ConsumerClosed;
        };
        if tx.send(batch).await.is_err() {
            self.status.advance(ConsumerStatus::ConsumerClosed);
        }
        self.status.load()
    }

    fn producer_done(&self) {
        let previous = self
            .remaining_senders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.tx.lock().take();
            }
            Ok(_) => (),
            Err(_) => debug_assert!(false, "producer_done called too many times"),
        }
    }
}

/// The consumer half of a [BatchChannel].
pub struct BatchReceiver {
    status: Arc<AtomicConsumerStatus>,
    rx: mpsc::Receiver<ColumnBatch>,
}

impl std::fmt::Debug for BatchReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchReceiver")
            .field("status", &self.status.load())
            .finish_non_exhaustive()
    }
}

impl BatchReceiver {
    /// The next batch, or `None` once every sender is done.
    ///
    /// After a drain request batches are discarded until the senders are
    /// done.
    pub async fn next(&mut self) -> Option<ColumnBatch> {
        loop {
            let batch = self.rx.recv().await?;
            if self.status.load() == ConsumerStatus::NeedMoreRows {
                return Some(batch);
            }
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.status.load()
    }

    /// Tells the senders to stop. Buffered batches are dropped.
    pub fn set_status(&mut self, status: ConsumerStatus) {
        self.status.advance(status);
        if status == ConsumerStatus::ConsumerClosed {
            self.rx.close();
        }
    }
}
