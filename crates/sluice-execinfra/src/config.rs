use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use error_stack::ResultExt;
use sluice_core::NodeId;
use sluice_mon::{BytesMonitor, MonitorResource};
use sluice_rowcontainer::TempStorage;

use crate::{BuiltinProcessorFactory, Error, NodeDialer, ProcessorFactory, Settings};

/// Per-node configuration shared by every flow on the node.
pub struct ServerConfig {
    pub node_id: NodeId,
    pub settings: Settings,
    /// Parent of every flow's memory monitor.
    pub root_mem_monitor: Arc<BytesMonitor>,
    /// Parent of every flow's disk monitor.
    pub root_disk_monitor: Arc<BytesMonitor>,
    pub temp_storage: Arc<TempStorage>,
    /// Opens streams to other nodes. Flows with remote outputs need one.
    pub dialer: Option<Arc<dyn NodeDialer>>,
    pub processor_factory: Arc<dyn ProcessorFactory>,
    pub testing_knobs: TestingKnobs,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("node_id", &self.node_id)
            .field("settings", &self.settings)
            .field("temp_storage", &self.temp_storage)
            .field("testing_knobs", &self.testing_knobs)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Creates a configuration with unlimited root monitors, temporary
    /// storage under `temp_dir` (or the system temp directory) and the
    /// built-in processors.
    pub fn new(
        node_id: NodeId,
        settings: Settings,
        temp_dir: Option<&Path>,
    ) -> error_stack::Result<Self, Error> {
        let temp_storage = TempStorage::new(temp_dir).change_context(Error::ServerConfig)?;
        Ok(Self {
            node_id,
            settings,
            root_mem_monitor: BytesMonitor::new_root(
                format!("n{node_id}-mem"),
                MonitorResource::Memory,
                None,
            ),
            root_disk_monitor: BytesMonitor::new_root(
                format!("n{node_id}-disk"),
                MonitorResource::Disk,
                None,
            ),
            temp_storage,
            dialer: None,
            processor_factory: Arc::new(BuiltinProcessorFactory::default()),
            testing_knobs: TestingKnobs::default(),
        })
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn NodeDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_processor_factory(mut self, factory: Arc<dyn ProcessorFactory>) -> Self {
        self.processor_factory = factory;
        self
    }

    pub fn with_testing_knobs(mut self, knobs: TestingKnobs) -> Self {
        self.testing_knobs = knobs;
        self
    }
}

/// Hooks and overrides for tests.
#[derive(Clone, Default)]
pub struct TestingKnobs {
    /// Memory limit of router outputs, overriding the work memory setting.
    pub memory_limit_bytes: Option<u64>,
    /// Rows between acquisitions of a router's semaphore.
    pub semaphore_period: Option<usize>,
    /// Called with the duration of each sleep performed while draining.
    pub drain_sleep_hook: Option<Arc<dyn Fn(Duration) + Send + Sync>>,
    /// Time given to newly registered flows to connect while draining.
    pub expected_connection_time: Option<Duration>,
}

impl std::fmt::Debug for TestingKnobs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestingKnobs")
            .field("memory_limit_bytes", &self.memory_limit_bytes)
            .field("semaphore_period", &self.semaphore_period)
            .field("drain_sleep_hook", &self.drain_sleep_hook.is_some())
            .field("expected_connection_time", &self.expected_connection_time)
            .finish()
    }
}
