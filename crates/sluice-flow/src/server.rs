use std::sync::{Arc, Weak};
use std::time::Duration;

use error_stack::ResultExt;
use hashbrown::HashMap;
use parking_lot::RwLock;
use sluice_api::producer_message;
use sluice_core::NodeId;
use sluice_execinfra::{
    flow_stream_pair, FlowStreamClient, FlowStreamServer, NodeDialer, RowReceiver, ServerConfig,
};
use sluice_physical::FlowSpec;
use tracing::Instrument;

use crate::{Error, Flow, FlowRegistry, FlowSetupOptions};

type Result<T> = error_stack::Result<T, Error>;

/// Runs flows on one node and serves their inbound streams.
pub struct FlowServer {
    cfg: Arc<ServerConfig>,
    registry: Arc<FlowRegistry>,
}

impl std::fmt::Debug for FlowServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowServer")
            .field("node_id", &self.cfg.node_id)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl FlowServer {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        let registry = FlowRegistry::new(cfg.node_id, &cfg.testing_knobs);
        Arc::new(Self {
            cfg: Arc::new(cfg),
            registry,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.cfg
    }

    pub fn registry(&self) -> &Arc<FlowRegistry> {
        &self.registry
    }

    /// Sets up a flow on this node. Nothing runs until it is started.
    pub fn setup_flow(
        &self,
        spec: &FlowSpec,
        sync_consumer: Option<Arc<dyn RowReceiver>>,
        options: &FlowSetupOptions,
    ) -> Result<Flow> {
        error_stack::ensure!(!self.registry.is_draining(), Error::ServerDraining);
        Flow::setup(
            self.cfg.clone(),
            self.registry.clone(),
            spec,
            sync_consumer,
            options,
        )
    }

    /// Sets up and starts a flow that feeds other nodes, cleaning it up in
    /// the background once it finishes.
    pub async fn start_flow(&self, spec: &FlowSpec, options: &FlowSetupOptions) -> Result<()> {
        let mut flow = self.setup_flow(spec, None, options)?;
        if let Err(report) = flow.start().await {
            flow.cleanup();
            return Err(report);
        }
        let span = tracing::debug_span!("flow waiter", flow_id = %flow.id());
        tokio::spawn(
            async move {
                flow.wait().await;
                flow.cleanup();
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Runs a gateway flow to completion, delivering its rows to
    /// `consumer`.
    pub async fn run_sync_flow(
        &self,
        spec: &FlowSpec,
        consumer: Arc<dyn RowReceiver>,
        options: &FlowSetupOptions,
    ) -> Result<()> {
        let mut flow = self.setup_flow(spec, Some(consumer), options)?;
        let result = flow.run().await;
        flow.cleanup();
        result
    }

    /// Serves one `FlowStream` RPC: reads the header, connects the stream to
    /// its flow and hands it to the stream's handler.
    pub async fn flow_stream(&self, mut stream: FlowStreamServer) -> Result<()> {
        let header = stream
            .messages
            .recv()
            .await
            .change_context(Error::Receive)?;
        let header = match header.and_then(|message| message.value) {
            Some(producer_message::Value::Header(header)) => header,
            Some(producer_message::Value::Data(_)) => error_stack::bail!(Error::MissingHeader("data")),
            Some(producer_message::Value::Metadata(_)) => {
                error_stack::bail!(Error::MissingHeader("metadata"))
            }
            None => error_stack::bail!(Error::MissingHeader("end of stream")),
        };
        let flow_id = header.flow_id().change_context(Error::MissingHeader("flow id"))?;
        let stream_id = header.stream_id();

        let span = tracing::debug_span!("inbound stream", %flow_id, %stream_id);
        async move {
            let timeout = self.cfg.settings.flow_stream_timeout;
            let connected = self
                .registry
                .connect_inbound_stream(flow_id, stream_id, &stream.signals, timeout)
                .await?;
            tracing::trace!("Inbound stream connected");
            let result = connected.handler.run(connected.flow_ctx, &mut stream).await;
            connected.cleanup.finish();
            result
        }
        .instrument(span)
        .await
    }

    /// Waits for running flows to finish and then refuses new ones.
    pub async fn drain(&self, flow_drain_wait: Duration, min_flow_drain_wait: Duration) {
        self.registry.drain(flow_drain_wait, min_flow_drain_wait).await
    }

    pub fn undrain(&self) {
        self.registry.undrain()
    }
}

/// Connects the flow servers of an in-process cluster.
#[derive(Default)]
pub struct LocalCluster {
    nodes: RwLock<HashMap<NodeId, Weak<FlowServer>>>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut nodes: Vec<_> = self.nodes.read().keys().copied().collect();
        nodes.sort();
        f.debug_struct("LocalCluster").field("nodes", &nodes).finish()
    }
}

impl LocalCluster {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn add_node(&self, server: &Arc<FlowServer>) {
        self.nodes
            .write()
            .insert(server.node_id(), Arc::downgrade(server));
    }

    pub fn remove_node(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }
}

#[async_trait::async_trait]
impl NodeDialer for LocalCluster {
    async fn flow_stream(
        &self,
        node: NodeId,
    ) -> error_stack::Result<FlowStreamClient, sluice_execinfra::Error> {
        let server = self
            .nodes
            .read()
            .get(&node)
            .and_then(Weak::upgrade)
            .ok_or(sluice_execinfra::Error::NodeUnavailable(node))?;

        let (client, stream) = flow_stream_pair();
        let span = tracing::debug_span!("flow stream rpc", %node);
        tokio::spawn(
            async move {
                if let Err(report) = server.flow_stream(stream).await {
                    tracing::warn!("Flow stream failed: {report:?}");
                }
            }
            .instrument(span),
        );
        Ok(client)
    }
}
