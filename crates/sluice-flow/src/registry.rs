use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use error_stack::ResultExt;
use hashbrown::HashMap;
use parking_lot::Mutex;
use sluice_api::{ConsumerHandshake, ConsumerSignal};
use sluice_core::{ErrorKind, FlowId, MetadataError, NodeId, StreamId};
use sluice_execinfra::{FlowCtx, FrameSender, TestingKnobs};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::pending::PendingParticipant;
use crate::{Error, InboundStreamHandler};

/// Default time given to newly registered flows to connect while draining.
const DEFAULT_EXPECTED_CONNECTION_TIME: Duration = Duration::from_millis(500);

/// An inbound stream of a registered flow.
///
/// A stream ends either `connected` and then `finished`, or `canceled` and
/// `finished`; it finishes exactly once.
pub struct InboundStreamInfo {
    receiver: Arc<dyn InboundStreamHandler>,
    connected: bool,
    canceled: bool,
    finished: bool,
    participant: PendingParticipant,
}

impl std::fmt::Debug for InboundStreamInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStreamInfo")
            .field("connected", &self.connected)
            .field("canceled", &self.canceled)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl InboundStreamInfo {
    pub(crate) fn new(
        receiver: Arc<dyn InboundStreamHandler>,
        participant: PendingParticipant,
    ) -> Self {
        Self {
            receiver,
            connected: false,
            canceled: false,
            finished: false,
            participant,
        }
    }

    fn finish(&mut self) {
        debug_assert!(!self.finished, "inbound stream finished twice");
        if self.finished {
            tracing::error!("Inbound stream finished twice");
            return;
        }
        self.finished = true;
        self.participant.complete();
    }
}

#[derive(Default)]
struct FlowEntry {
    /// Set once the flow is registered.
    flow: Option<Arc<FlowCtx>>,
    /// Held by the registered flow and by every connection waiting for it.
    ref_count: usize,
    /// Notified when the flow registers.
    wait: Option<Arc<Notify>>,
    inbound_streams: HashMap<StreamId, InboundStreamInfo>,
    stream_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    flows: HashMap<FlowId, FlowEntry>,
    draining: bool,
}

/// The flows running on a node, where inbound streams find their flow.
///
/// A stream may connect before its flow registers; the connection then waits
/// for the flow up to the stream timeout.
pub struct FlowRegistry {
    node_id: NodeId,
    state: Mutex<RegistryState>,
    /// Notified whenever a flow entry is removed.
    flow_done: Notify,
    expected_connection_time: Duration,
    drain_sleep_hook: Option<Arc<dyn Fn(Duration) + Send + Sync>>,
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FlowRegistry")
            .field("node_id", &self.node_id)
            .field("flows", &state.flows.len())
            .field("draining", &state.draining)
            .finish_non_exhaustive()
    }
}

/// Finishes a connected inbound stream.
#[must_use]
pub struct InboundStreamCleanup {
    registry: Arc<FlowRegistry>,
    flow_id: FlowId,
    stream_id: StreamId,
    done: bool,
}

impl InboundStreamCleanup {
    pub fn finish(mut self) {
        self.finish_once();
    }

    fn finish_once(&mut self) {
        if std::mem::replace(&mut self.done, true) {
            return;
        }
        let mut state = self.registry.state.lock();
        match state
            .flows
            .get_mut(&self.flow_id)
            .and_then(|entry| entry.inbound_streams.get_mut(&self.stream_id))
        {
            Some(info) => info.finish(),
            None => tracing::error!(
                "Finished stream {} of unknown flow {}",
                self.stream_id,
                self.flow_id
            ),
        }
    }
}

impl Drop for InboundStreamCleanup {
    fn drop(&mut self) {
        self.finish_once();
    }
}

/// What a connecting inbound stream is matched with.
pub struct ConnectedStream {
    pub flow_ctx: Arc<FlowCtx>,
    pub handler: Arc<dyn InboundStreamHandler>,
    pub cleanup: InboundStreamCleanup,
}

type Result<T> = error_stack::Result<T, Error>;

impl FlowRegistry {
    pub fn new(node_id: NodeId, knobs: &TestingKnobs) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            state: Mutex::new(RegistryState::default()),
            flow_done: Notify::new(),
            expected_connection_time: knobs
                .expected_connection_time
                .unwrap_or(DEFAULT_EXPECTED_CONNECTION_TIME),
            drain_sleep_hook: knobs.drain_sleep_hook.clone(),
        })
    }

    pub fn num_flows(&self) -> usize {
        self.state.lock().flows.len()
    }

    pub fn is_draining(&self) -> bool {
        self.state.lock().draining
    }

    /// Registers a flow with its inbound streams.
    ///
    /// Streams that have not connected within `timeout` are canceled and
    /// their handlers told so. On error every stream is finished.
    pub fn register_flow(
        self: &Arc<Self>,
        flow_ctx: Arc<FlowCtx>,
        mut inbound_streams: HashMap<StreamId, InboundStreamInfo>,
        timeout: Duration,
    ) -> Result<()> {
        let id = flow_ctx.id;
        let mut state = self.state.lock();

        let refused = if state.draining {
            Some(Error::RegistryDraining)
        } else if state.flows.get(&id).map_or(false, |e| e.flow.is_some()) {
            Some(Error::AlreadyRegistered(id))
        } else {
            None
        };
        if let Some(error) = refused {
            drop(state);
            for info in inbound_streams.values_mut() {
                info.finish();
            }
            error_stack::bail!(error);
        }

        let has_streams = !inbound_streams.is_empty();
        let entry = state.flows.entry(id).or_default();
        entry.flow = Some(flow_ctx);
        entry.ref_count += 1;
        entry.inbound_streams = inbound_streams;
        if let Some(wait) = entry.wait.take() {
            wait.notify_waiters();
        }

        if has_streams {
            let registry = Arc::downgrade(self);
            let span = tracing::debug_span!("stream timer", flow_id = %id);
            entry.stream_timer = Some(tokio::spawn(
                async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(registry) = registry.upgrade() {
                        let err = MetadataError::new(
                            ErrorKind::NoInboundStreamConnection,
                            format!("no inbound stream connection after {timeout:?}"),
                        );
                        registry.cancel_pending_streams(id, err);
                    }
                }
                .instrument(span),
            ));
        }
        tracing::debug!(flow_id = %id, node_id = %self.node_id, "Registered flow");
        Ok(())
    }

    /// Removes the flow's registration.
    pub fn unregister_flow(&self, id: FlowId) {
        let mut state = self.state.lock();
        let Some(entry) = state.flows.get_mut(&id) else {
            debug_assert!(false, "unregistering unknown flow {id}");
            tracing::error!("Unregistering unknown flow {id}");
            return;
        };
        if let Some(timer) = entry.stream_timer.take() {
            timer.abort();
        }
        entry.flow = None;
        self.release_entry_locked(&mut state, id);
    }

    fn release_entry_locked(&self, state: &mut RegistryState, id: FlowId) {
        let Some(entry) = state.flows.get_mut(&id) else {
            return;
        };
        debug_assert!(entry.ref_count > 0, "flow entry refcount underflow");
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count == 0 {
            state.flows.remove(&id);
            self.flow_done.notify_waiters();
        }
    }

    /// Cancels the streams of flow `id` that have not connected yet and
    /// tells their handlers `err`.
    pub fn cancel_pending_streams(&self, id: FlowId, err: MetadataError) {
        let canceled: Vec<_> = {
            let mut state = self.state.lock();
            let Some(entry) = state.flows.get_mut(&id) else {
                return;
            };
            entry
                .inbound_streams
                .iter_mut()
                .filter(|(_, info)| !info.connected && !info.canceled)
                .map(|(stream_id, info)| {
                    info.canceled = true;
                    info.finish();
                    tracing::debug!(flow_id = %id, stream_id = %stream_id, "Canceled inbound stream");
                    info.receiver.clone()
                })
                .collect()
        };
        for receiver in canceled {
            let err = err.clone();
            tokio::spawn(async move { receiver.timeout(err).await });
        }
    }

    /// Matches an inbound stream with its flow, waiting up to `timeout` for
    /// the flow to register.
    pub async fn connect_inbound_stream(
        self: &Arc<Self>,
        flow_id: FlowId,
        stream_id: StreamId,
        signals: &FrameSender<ConsumerSignal>,
        timeout: Duration,
    ) -> Result<ConnectedStream> {
        self.wait_for_flow(flow_id, signals, timeout).await?;

        let (flow_ctx, handler) = {
            let mut state = self.state.lock();
            let entry = state
                .flows
                .get_mut(&flow_id)
                .ok_or(Error::FlowNotFound(flow_id))?;
            let flow_ctx = entry.flow.clone().ok_or(Error::FlowNotFound(flow_id))?;
            let info = entry
                .inbound_streams
                .get_mut(&stream_id)
                .ok_or(Error::StreamNotFound { flow_id, stream_id })?;
            error_stack::ensure!(
                !info.connected,
                Error::StreamAlreadyConnected { flow_id, stream_id }
            );
            error_stack::ensure!(!info.canceled, Error::StreamTooLate { flow_id, stream_id });
            info.connected = true;
            (flow_ctx, info.receiver.clone())
        };

        let handshake = ConsumerSignal::handshake(ConsumerHandshake::new(true, None));
        if let Err(report) = signals.send(&handshake).await {
            // Leave the stream to the registry's timeout.
            let mut state = self.state.lock();
            if let Some(info) = state
                .flows
                .get_mut(&flow_id)
                .and_then(|entry| entry.inbound_streams.get_mut(&stream_id))
            {
                info.connected = false;
            }
            return Err(report.change_context(Error::SendHandshake));
        }

        Ok(ConnectedStream {
            flow_ctx,
            handler,
            cleanup: InboundStreamCleanup {
                registry: self.clone(),
                flow_id,
                stream_id,
                done: false,
            },
        })
    }

    /// Waits until flow `id` is registered, telling the producer the
    /// consumer is not scheduled yet.
    async fn wait_for_flow(
        &self,
        id: FlowId,
        signals: &FrameSender<ConsumerSignal>,
        timeout: Duration,
    ) -> Result<()> {
        let wait = {
            let mut state = self.state.lock();
            let entry = state.flows.entry(id).or_default();
            if entry.flow.is_some() {
                return Ok(());
            }
            entry.ref_count += 1;
            entry.wait.get_or_insert_with(Default::default).clone()
        };

        let deadline = SystemTime::now() + timeout;
        let handshake = ConsumerSignal::handshake(ConsumerHandshake::new(false, Some(deadline)));
        let sent = signals.send(&handshake).await;

        let registered = sent.is_ok() && {
            let notified = wait.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let already = self
                .state
                .lock()
                .flows
                .get(&id)
                .map_or(false, |entry| entry.flow.is_some());
            already || tokio::time::timeout(timeout, notified).await.is_ok()
        };

        let mut state = self.state.lock();
        let found = registered
            && state
                .flows
                .get(&id)
                .map_or(false, |entry| entry.flow.is_some());
        self.release_entry_locked(&mut state, id);
        drop(state);

        sent.change_context(Error::SendHandshake)?;
        error_stack::ensure!(found, Error::FlowNotFound(id));
        Ok(())
    }

    /// Waits for the node's flows to finish before it shuts down.
    ///
    /// Waits at least `min_flow_drain_wait` for flows about to register and
    /// at most `flow_drain_wait` for registered flows to finish. New flows
    /// are then refused, and flows still running get the expected connection
    /// time for their inbound streams to arrive.
    pub async fn drain(&self, flow_drain_wait: Duration, min_flow_drain_wait: Duration) {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + flow_drain_wait);

        let idle = if self.num_flows() == 0 {
            self.sleep(min_flow_drain_wait).await;
            self.num_flows() == 0
        } else {
            false
        };

        if !idle {
            tracing::info!(flows = self.num_flows(), "Draining flows");
            self.wait_for_flows(deadline).await;

            let waited = start.elapsed();
            if waited < min_flow_drain_wait {
                self.sleep(min_flow_drain_wait - waited).await;
                self.wait_for_flows(deadline).await;
            }
        }

        let remaining = {
            let mut state = self.state.lock();
            state.draining = true;
            state.flows.len()
        };
        if remaining > 0 {
            self.sleep(self.expected_connection_time).await;
        }
        tracing::info!(flows = self.num_flows(), "Flow registry drained");
    }

    /// Accepts new flows again.
    pub fn undrain(&self) {
        self.state.lock().draining = false;
    }

    async fn wait_for_flows(&self, deadline: tokio::time::Instant) {
        loop {
            let notified = self.flow_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.num_flows() == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::info!(flows = self.num_flows(), "Flows still running after drain wait");
                return;
            }
        }
    }

    async fn sleep(&self, duration: Duration) {
        if let Some(hook) = &self.drain_sleep_hook {
            hook(duration);
        }
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests;
