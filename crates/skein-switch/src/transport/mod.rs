//! Remote plan dispatch.
//!
//! [`AgentClient`] is the driver's (or a peer node's) handle on one agent;
//! [`AgentConnector`] resolves node ids to clients. `local` wires agents
//! together in-process, `tcp` speaks the framed wire protocol from `codec`.

pub mod codec;
pub mod local;
pub mod tcp;

use crate::error::Result;
use crate::plan::{NodeId, Plan, PlanId};
use crate::stream::ByteStream;
use crate::switch::Results;
use crate::var::VarId;
use async_trait::async_trait;
use std::sync::Arc;

pub use local::{LocalCluster, LocalConnector};
pub use tcp::{TcpAgentClient, TcpAgentConnector, TcpAgentServer};

/// Operations an agent offers to remote callers
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Run a plan on the agent and return its results. Dropping the future
    /// aborts the remote plan.
    async fn execute_plan(&self, plan: Plan) -> Result<Results>;

    /// Push `stream` into variable `var` of the agent's switch for `plan`.
    /// Completes once the remote consumer has read it to the end.
    async fn send_stream(&self, plan: &PlanId, var: VarId, stream: ByteStream) -> Result<()>;

    /// Pull the stream the agent's switch for `plan` serves as `var`
    async fn fetch_stream(&self, plan: &PlanId, var: VarId) -> Result<ByteStream>;
}

/// Resolves a node id to a client
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, node: NodeId) -> Result<Arc<dyn AgentClient>>;
}
