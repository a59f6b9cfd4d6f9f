//! Node-side service: hosts switches for plans dispatched to this node

use crate::context::NodeContext;
use crate::error::{Result, SwitchError};
use crate::manager::Manager;
use crate::plan::{Plan, PlanId};
use crate::stream::{ByteStream, track};
use crate::switch::{Results, Switch};
use crate::var::VarId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Executes dispatched plans and moves streams in and out of them
pub struct AgentService {
    manager: Arc<Manager>,
    ctx: Arc<NodeContext>,
    shutdown: CancellationToken,
}

impl AgentService {
    pub fn new(ctx: Arc<NodeContext>) -> Self {
        Self {
            manager: Arc::new(Manager::new()),
            ctx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.ctx
    }

    /// Cancel every running plan and refuse new work
    pub fn shutdown(&self) {
        info!(at = %self.ctx.location(), running = self.manager.len(), "agent shutting down");
        self.shutdown.cancel();
        self.manager.cancel_all();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `plan` to completion.
    ///
    /// The switch is registered for the duration of the call. Dropping the
    /// returned future (the dispatcher went away) cancels and unregisters it.
    pub async fn execute_plan(&self, plan: Plan) -> Result<Results> {
        if self.is_shut_down() {
            return Err(SwitchError::Cancelled);
        }
        plan.validate()?;

        let switch = Switch::new(plan, self.ctx.clone(), &self.shutdown);
        self.manager.add(switch.clone())?;
        let _registration = Registration {
            manager: &self.manager,
            switch: switch.clone(),
        };
        switch.run().await
    }

    /// Deliver a pushed stream into the plan's switch and wait until the
    /// consuming operation has read it to the end.
    pub async fn receive_stream(&self, plan: &PlanId, var: VarId, stream: ByteStream) -> Result<()> {
        let timeout = self.ctx.config().find_switch_timeout();
        let switch = self.manager.find_by_id_timeout(plan, timeout).await?;

        let (stream, drained) = track(stream);
        switch.deliver_inbound(var, stream)?;
        debug!(plan = %plan, at = %self.ctx.location(), var = %var, "stream delivered");

        tokio::select! {
            eof = drained.wait() => {
                if eof {
                    Ok(())
                } else if switch.is_cancelled() {
                    Err(switch.abort_error())
                } else {
                    warn!(plan = %plan, var = %var, "incoming stream dropped before its end");
                    Err(SwitchError::Transport(format!(
                        "stream {} closed before end of data",
                        var
                    )))
                }
            }
            _ = switch.cancellation().cancelled() => Err(switch.abort_error()),
        }
    }

    /// Hand out a stream the plan's switch is serving
    pub async fn serve_stream(&self, plan: &PlanId, var: VarId) -> Result<ByteStream> {
        let timeout = self.ctx.config().find_switch_timeout();
        let switch = self.manager.find_by_id_timeout(plan, timeout).await?;
        let stream = switch.take_outbound(var).await?;
        debug!(plan = %plan, at = %self.ctx.location(), var = %var, "stream served");
        Ok(stream)
    }
}

struct Registration<'a> {
    manager: &'a Manager,
    switch: Arc<Switch>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.switch.cancel();
        self.manager.remove(&self.switch);
    }
}
