use std::borrow::Cow;
use std::sync::Arc;

use sluice_execinfra::FlowCtx;

use crate::pending::{spawn_participant, PendingSet};

/// A flow component that runs as its own tasks once the flow starts:
/// router outputs, outboxes and vectorized drivers.
pub trait Startable: Send {
    fn start(self: Box<Self>, ctx: &StartCtx);
}

/// What a [Startable] needs to launch its tasks.
#[derive(Debug, Clone)]
pub struct StartCtx {
    pub flow_ctx: Arc<FlowCtx>,
    pub(crate) pending: Arc<PendingSet>,
}

impl StartCtx {
    pub(crate) fn new(flow_ctx: Arc<FlowCtx>, pending: Arc<PendingSet>) -> Self {
        Self { flow_ctx, pending }
    }

    /// Spawns a task the flow waits for before it is done.
    pub fn spawn<F>(&self, name: impl Into<Cow<'static, str>>, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        spawn_participant(&self.pending, name, future);
    }

    /// Number of tasks and inbound streams the flow is still waiting for.
    pub fn pending_count(&self) -> usize {
        self.pending.pending_count()
    }

    /// Waits until every spawned task is done.
    pub async fn wait(&self) {
        self.pending.wait_idle().await
    }
}
