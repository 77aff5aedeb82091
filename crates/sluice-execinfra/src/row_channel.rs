use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{AtomicConsumerStatus, ColumnType, ConsumerStatus};
use tokio::sync::mpsc;

use crate::{FlowCtx, RowMessage, RowReceiver, RowSource};

/// Capacity of a row channel per sender.
pub const ROW_CHANNEL_BUF_SIZE: usize = 16;

/// A bounded FIFO from one or more producers to a single consumer.
///
/// The producer half is a [RowReceiver] and the consumer half a [RowSource].
/// The consumer's status is shared through an atomic, so producers see a
/// drain or close on their next push.
pub struct RowChannel;

impl RowChannel {
    /// Creates a channel fed by `num_senders` producers. The channel ends
    /// once every producer has called `producer_done`.
    pub fn new(types: Vec<ColumnType>, num_senders: usize) -> (Arc<RowChannelSender>, RowChannelReceiver) {
        let num_senders = num_senders.max(1);
        let (tx, rx) = mpsc::channel(ROW_CHANNEL_BUF_SIZE * num_senders);
        let shared = Arc::new(Shared {
            types,
            status: AtomicConsumerStatus::default(),
        });
        let sender = Arc::new(RowChannelSender {
            shared: shared.clone(),
            tx: Mutex::new(Some(tx)),
            remaining_senders: AtomicUsize::new(num_senders),
        });
        let receiver = RowChannelReceiver { shared, rx };
        (sender, receiver)
    }
}

struct Shared {
    types: Vec<ColumnType>,
    status: AtomicConsumerStatus,
}

pub struct RowChannelSender {
    shared: Arc<Shared>,
    /// Dropped once every producer is done, which ends the stream.
    tx: Mutex<Option<mpsc::Sender<RowMessage>>>,
    remaining_senders: AtomicUsize,
}

impl std::fmt::Debug for RowChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowChannelSender")
            .field("status", &self.shared.status.load())
            .field("remaining_senders", &self.remaining_senders)
            .finish_non_exhaustive()
    }
}

impl RowChannelSender {
    pub fn types(&self) -> &[ColumnType] {
        &self.shared.types
    }

    pub fn consumer_status(&self) -> ConsumerStatus {
        self.shared.status.load()
    }
}

#[async_trait::async_trait]
impl RowReceiver for RowChannelSender {
    async fn push(&self, msg: RowMessage) -> ConsumerStatus {
        let status = self.shared.status.load();
        let send = match status {
            ConsumerStatus::NeedMoreRows => true,
            ConsumerStatus::DrainRequested => !msg.is_row(),
            ConsumerStatus::ConsumerClosed => false,
        };
        if !send {
            return status;
        }

        // Clone the sender so the lock is not held while waiting for space.
        let Some(tx) = self.tx.lock().clone() else {
            debug_assert!(false, "push after producer done");
            return ConsumerStatus::ConsumerClosed;
        };
        if tx.send(msg).await.is_err() {
            // The consumer went away.
            self.shared.status.advance(ConsumerStatus::ConsumerClosed);
        }
        self.shared.status.load()
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

/// The consumer half of a [RowChannel].
pub struct RowChannelReceiver {
    shared: Arc<Shared>,
    rx: mpsc::Receiver<RowMessage>,
}

impl std::fmt::Debug for RowChannelReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowChannelReceiver")
            .field("status", &self.shared.status.load())
            .finish_non_exhaustive()
    }
}

impl RowChannelReceiver {
    pub fn consumer_status(&self) -> ConsumerStatus {
        self.shared.status.load()
    }
}

#[async_trait::async_trait]
impl RowSource for RowChannelReceiver {
    fn output_types(&self) -> &[ColumnType] {
        &self.shared.types
    }

    fn start(&mut self, _ctx: &Arc<FlowCtx>) {}

    async fn next(&mut self) -> Option<RowMessage> {
        loop {
            let msg = self.rx.recv().await?;
            // Rows that were in flight when the drain started are discarded.
            if msg.is_row() && self.shared.status.load() != ConsumerStatus::NeedMoreRows {
                continue;
            }
            return Some(msg);
        }
    }

    fn consumer_done(&mut self) {
        let _ = self
            .shared
            .status
            .compare_exchange(ConsumerStatus::NeedMoreRows, ConsumerStatus::DrainRequested);
    }

    fn consumer_closed(&mut self) {
        self.shared.status.advance(ConsumerStatus::ConsumerClosed);
        // Fails pending and future sends so producers never block on us.
        self.rx.close();
    }
}

impl Drop for RowChannelReceiver {
    fn drop(&mut self) {
        self.shared.status.advance(ConsumerStatus::ConsumerClosed);
    }
}

#[cfg(test)]
mod tests {
    use sluice_core::{ErrorKind, MetadataError, ProducerMetadata};
    use sluice_testing::int_row;

    use super::*;

    fn meta() -> RowMessage {
        RowMessage::Meta(ProducerMetadata::Error(MetadataError::new(
            ErrorKind::Internal,
            "boom",
        )))
    }

    #[tokio::test]
    async fn test_multiple_senders() {
        let (tx, mut rx) = RowChannel::new(vec![ColumnType::Int], 2);
        assert_eq!(
            tx.push(RowMessage::Row(int_row(&[1]))).await,
            ConsumerStatus::NeedMoreRows
        );
        tx.producer_done();
        tx.push(RowMessage::Row(int_row(&[2]))).await;
        tx.producer_done();

        assert_eq!(rx.next().await, Some(RowMessage::Row(int_row(&[1]))));
        assert_eq!(rx.next().await, Some(RowMessage::Row(int_row(&[2]))));
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn test_drain_drops_rows_keeps_metadata() {
        let (tx, mut rx) = RowChannel::new(vec![ColumnType::Int], 1);
        tx.push(RowMessage::Row(int_row(&[1]))).await;
        rx.consumer_done();
        assert_eq!(
            tx.push(RowMessage::Row(int_row(&[2]))).await,
            ConsumerStatus::DrainRequested
        );
        assert_eq!(tx.push(meta()).await, ConsumerStatus::DrainRequested);
        tx.producer_done();

        // The in-flight row is discarded as well.
        assert_eq!(rx.next().await, Some(meta()));
        assert_eq!(rx.next().await, None);
    }

    #[tokio::test]
    async fn test_closed_refuses_everything() {
        let (tx, mut rx) = RowChannel::new(vec![ColumnType::Int], 1);
        rx.consumer_closed();
        assert_eq!(tx.push(meta()).await, ConsumerStatus::ConsumerClosed);
        assert_eq!(
            tx.push(RowMessage::Row(int_row(&[1]))).await,
            ConsumerStatus::ConsumerClosed
        );
        // Closing does not move back to draining.
        rx.consumer_done();
        assert_eq!(tx.consumer_status(), ConsumerStatus::ConsumerClosed);
    }

    #[tokio::test]
    async fn test_close_unblocks_full_channel() {
        let (tx, mut rx) = RowChannel::new(vec![ColumnType::Int], 1);
        for i in 0..ROW_CHANNEL_BUF_SIZE as i64 {
            tx.push(RowMessage::Row(int_row(&[i]))).await;
        }
        let blocked = tokio::spawn({
            let tx = tx.clone();
            async move { tx.push(RowMessage::Row(int_row(&[99]))).await }
        });
        tokio::task::yield_now().await;
        rx.consumer_closed();
        assert_eq!(blocked.await.unwrap(), ConsumerStatus::ConsumerClosed);
    }
}
