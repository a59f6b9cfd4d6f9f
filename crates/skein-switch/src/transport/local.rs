//! In-process cluster: every agent lives in this process

use super::{AgentClient, AgentConnector};
use crate::agent::AgentService;
use crate::blob::BlobStore;
use crate::context::{EngineConfig, NodeContext};
use crate::error::{Result, SwitchError};
use crate::plan::{NodeId, Plan, PlanId};
use crate::stream::ByteStream;
use crate::switch::Results;
use crate::var::VarId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tracing::info;

type Agents = DashMap<NodeId, Arc<AgentService>>;

/// A set of agents reachable without a network
pub struct LocalCluster {
    agents: Arc<Agents>,
    config: EngineConfig,
}

impl LocalCluster {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            agents: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Start an agent for `node` backed by `blobs`
    pub fn add_node(&self, node: NodeId, blobs: Arc<dyn BlobStore>) -> Arc<AgentService> {
        let ctx = NodeContext::node(node, blobs, self.connector(), self.config.clone());
        let agent = Arc::new(AgentService::new(Arc::new(ctx)));
        self.agents.insert(node, agent.clone());
        agent
    }

    pub fn agent(&self, node: NodeId) -> Option<Arc<AgentService>> {
        self.agents.get(&node).map(|a| a.clone())
    }

    /// Take a node down: its running plans are cancelled and every later
    /// call to it fails
    pub fn kill(&self, node: NodeId) {
        if let Some(agent) = self.agent(node) {
            info!(node = %node, "killing local agent");
            agent.shutdown();
        }
    }

    pub fn connector(&self) -> Arc<dyn AgentConnector> {
        Arc::new(LocalConnector {
            agents: Arc::downgrade(&self.agents),
        })
    }

    /// Context for a driver talking to this cluster
    pub fn driver_context(&self) -> Arc<NodeContext> {
        Arc::new(NodeContext::driver(self.connector(), self.config.clone()))
    }
}

/// Connector handed to agents and drivers of a [`LocalCluster`].
///
/// Holds the agent map weakly so agents do not keep each other alive.
pub struct LocalConnector {
    agents: Weak<Agents>,
}

#[async_trait]
impl AgentConnector for LocalConnector {
    async fn connect(&self, node: NodeId) -> Result<Arc<dyn AgentClient>> {
        let agents = self
            .agents
            .upgrade()
            .ok_or_else(|| SwitchError::Transport("local cluster is gone".into()))?;
        let agent = agents
            .get(&node)
            .map(|a| a.clone())
            .ok_or_else(|| SwitchError::Transport(format!("{} is unknown", node)))?;
        if agent.is_shut_down() {
            return Err(SwitchError::Transport(format!("{} is down", node)));
        }
        Ok(Arc::new(LocalClient { agent }))
    }
}

struct LocalClient {
    agent: Arc<AgentService>,
}

impl LocalClient {
    /// Run `call` unless the agent is shut down first
    async fn guarded<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            r = call => r,
            _ = self.agent.shutdown_token().cancelled() => Err(SwitchError::Transport(format!(
                "{} shut down",
                self.agent.context().location()
            ))),
        }
    }
}

#[async_trait]
impl AgentClient for LocalClient {
    async fn execute_plan(&self, plan: Plan) -> Result<Results> {
        self.guarded(self.agent.execute_plan(plan)).await
    }

    async fn send_stream(&self, plan: &PlanId, var: VarId, stream: ByteStream) -> Result<()> {
        self.guarded(self.agent.receive_stream(plan, var, stream))
            .await
    }

    async fn fetch_stream(&self, plan: &PlanId, var: VarId) -> Result<ByteStream> {
        self.guarded(self.agent.serve_stream(plan, var)).await
    }
}
