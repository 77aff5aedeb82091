use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{ColumnType, ConsumerStatus, ProducerMetadata, Row};
use tokio::sync::Notify;

use crate::{FlowCtx, RowMessage, RowReceiver, RowSource};

/// An unbounded in-memory receiver that records what it is sent.
///
/// Used as the sync-flow consumer on the gateway and throughout tests. Its
/// status can be set from outside to simulate draining or closed consumers.
pub struct RowBuffer {
    types: Vec<ColumnType>,
    state: Mutex<RowBufferState>,
    changed: Notify,
}

#[derive(Default)]
struct RowBufferState {
    messages: VecDeque<RowMessage>,
    status: ConsumerStatus,
    producer_done: bool,
    /// Statuses returned by push, in order.
    history: Vec<ConsumerStatus>,
}

impl std::fmt::Debug for RowBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RowBuffer")
            .field("messages", &state.messages.len())
            .field("status", &state.status)
            .field("producer_done", &state.producer_done)
            .finish()
    }
}

impl RowBuffer {
    pub fn new(types: Vec<ColumnType>) -> Arc<Self> {
        Arc::new(Self {
            types,
            state: Mutex::default(),
            changed: Notify::new(),
        })
    }

    /// Moves the status forward. Statuses never move back.
    pub fn set_status(&self, status: ConsumerStatus) {
        let mut state = self.state.lock();
        state.status = state.status.max(status);
    }

    pub fn status(&self) -> ConsumerStatus {
        self.state.lock().status
    }

    pub fn is_producer_done(&self) -> bool {
        self.state.lock().producer_done
    }

    /// Waits until the producer signals it is done.
    pub async fn wait_producer_done(&self) {
        loop {
            let notified = self.changed.notified();
            if self.is_producer_done() {
                return;
            }
            notified.await;
        }
    }

    /// Removes and returns everything recorded so far.
    pub fn take_all(&self) -> (Vec<Row>, Vec<ProducerMetadata>) {
        let mut rows = Vec::new();
        let mut metas = Vec::new();
        for msg in self.state.lock().messages.drain(..) {
            match msg {
                RowMessage::Row(row) => rows.push(row),
                RowMessage::Meta(meta) => metas.push(meta),
            }
        }
        (rows, metas)
    }

    /// Statuses returned by every push so far.
    pub fn status_history(&self) -> Vec<ConsumerStatus> {
        self.state.lock().history.clone()
    }
}

#[async_trait::async_trait]
impl RowReceiver for RowBuffer {
    async fn push(&self, msg: RowMessage) -> ConsumerStatus {
        let status = {
            let mut state = self.state.lock();
            debug_assert!(!state.producer_done, "push after producer done");
            let accept = match state.status {
                ConsumerStatus::NeedMoreRows => true,
                ConsumerStatus::DrainRequested => !msg.is_row(),
                ConsumerStatus::ConsumerClosed => false,
            };
            if accept {
                state.messages.push_back(msg);
            }
            let status = state.status;
            state.history.push(status);
            status
        };
        self.changed.notify_waiters();
        status
    }

    fn producer_done(&self) {
        self.state.lock().producer_done = true;
        self.changed.notify_waiters();
    }
}

/// Reading a [RowBuffer] as a source waits for pushes until producer-done.
#[async_trait::async_trait]
impl RowSource for Arc<RowBuffer> {
    fn output_types(&self) -> &[ColumnType] {
        &self.types
    }

    fn start(&mut self, _ctx: &Arc<FlowCtx>) {}

    async fn next(&mut self) -> Option<RowMessage> {
        loop {
            let notified = self.changed.notified();
            {
                let mut state = self.state.lock();
                if let Some(msg) = state.messages.pop_front() {
                    return Some(msg);
                }
                if state.producer_done {
                    return None;
                }
            }
            notified.await;
        }
    }

    fn consumer_done(&mut self) {
        self.set_status(ConsumerStatus::DrainRequested);
    }

    fn consumer_closed(&mut self) {
        self.set_status(ConsumerStatus::ConsumerClosed);
    }
}
