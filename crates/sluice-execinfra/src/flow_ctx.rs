use std::future::Future;
use std::sync::Arc;

use sluice_core::{FlowId, NodeId};
use sluice_mon::BytesMonitor;
use tokio_util::sync::CancellationToken;

use crate::{ServerConfig, Settings};

/// Default number of rows between acquisitions of a router semaphore.
pub const DEFAULT_SEMAPHORE_PERIOD: usize = 8;

/// State shared by every component of one flow.
#[derive(Debug)]
pub struct FlowCtx {
    pub id: FlowId,
    pub cfg: Arc<ServerConfig>,
    /// Accounts for the memory of this flow's components.
    pub mem_monitor: Arc<BytesMonitor>,
    /// Accounts for the disk of this flow's components.
    pub disk_monitor: Arc<BytesMonitor>,
    /// Canceled when the flow is canceled or cleaned up.
    pub cancel: CancellationToken,
    /// Whether components record stats and forward them as trace metadata.
    pub collect_stats: bool,
}

impl FlowCtx {
    pub fn new(id: FlowId, cfg: Arc<ServerConfig>, collect_stats: bool) -> Self {
        let mem_monitor = cfg.root_mem_monitor.new_child(format!("flow {id}"), None);
        let disk_monitor = cfg
            .root_disk_monitor
            .new_child(format!("flow {id} disk"), None);
        Self {
            id,
            cfg,
            mem_monitor,
            disk_monitor,
            cancel: CancellationToken::new(),
            collect_stats,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn settings(&self) -> &Settings {
        &self.cfg.settings
    }

    /// Creates a memory monitor limited to the work memory budget, or to the
    /// testing override.
    pub fn new_limited_monitor(&self, name: impl Into<String>) -> Arc<BytesMonitor> {
        let limit = self
            .cfg
            .testing_knobs
            .memory_limit_bytes
            .unwrap_or(self.cfg.settings.work_mem_bytes);
        self.mem_monitor.new_child(name, Some(limit))
    }

    pub fn semaphore_period(&self) -> usize {
        self.cfg
            .testing_knobs
            .semaphore_period
            .unwrap_or(DEFAULT_SEMAPHORE_PERIOD)
            .max(1)
    }

    /// Awaits `fut` unless the flow is canceled while it is pending.
    ///
    /// Returns `None` on cancellation. A future that is already ready wins
    /// over the cancellation.
    pub async fn or_canceled<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            output = fut => Some(output),
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Stops the flow's monitors. Bytes still allocated are reported.
    pub fn stop_monitors(&self) {
        self.mem_monitor.stop();
        self.disk_monitor.stop();
    }
}
