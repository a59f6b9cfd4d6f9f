//! The switch: runs one node's operations for one plan instance

mod table;

use crate::context::NodeContext;
use crate::error::{Result, SwitchError};
use crate::plan::{Location, Plan, PlanId};
use crate::stream::ByteStream;
use crate::var::{Payload, Value, VarId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use table::{PortDir, PortTable, VarTable};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Named results produced by `Store` operations
pub type Results = BTreeMap<String, Value>;

/// Per-node runtime of one plan instance.
///
/// Owns the variable table, the port table and the result map. Every
/// operation runs as its own task; the first failure cancels the rest.
pub struct Switch {
    plan: Plan,
    ctx: Arc<NodeContext>,
    vars: VarTable,
    ports: PortTable,
    results: Mutex<Results>,
    cancel: CancellationToken,
    failed: AtomicBool,
    started: AtomicBool,
}

impl Switch {
    /// Create a switch whose cancellation follows `parent`
    pub fn new(plan: Plan, ctx: Arc<NodeContext>, parent: &CancellationToken) -> Arc<Self> {
        let vars = VarTable::new(plan.declared_vars());
        Arc::new(Self {
            plan,
            ctx,
            vars,
            ports: PortTable::new(),
            results: Mutex::new(Results::new()),
            cancel: parent.child_token(),
            failed: AtomicBool::new(false),
            started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &PlanId {
        &self.plan.id
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn context(&self) -> &NodeContext {
        &self.ctx
    }

    pub fn location(&self) -> Location {
        self.ctx.location()
    }

    /// Bind `id` and wake every operation waiting on it
    pub fn bind_variable(&self, id: VarId, payload: Payload) -> Result<()> {
        self.vars.bind(id, payload)?;
        debug!(plan = %self.id(), at = %self.location(), var = %id, "variable bound");
        Ok(())
    }

    pub fn is_bound(&self, id: VarId) -> bool {
        self.vars.is_bound(id)
    }

    /// Wait until every id is bound, then take the payloads in one step.
    ///
    /// Streams move out of the table, signals and scalars are copied.
    pub async fn wait_variables(&self, ids: &[VarId]) -> Result<Vec<Payload>> {
        tokio::select! {
            r = self.vars.wait(ids) => r,
            _ = self.cancel.cancelled() => Err(self.abort_error()),
        }
    }

    pub async fn wait_stream(&self, id: VarId) -> Result<ByteStream> {
        self.take_one(id).await?.into_stream(id)
    }

    pub async fn wait_signal(&self, id: VarId) -> Result<bool> {
        self.take_one(id).await?.into_signal(id)
    }

    pub async fn wait_scalar(&self, id: VarId) -> Result<Value> {
        self.take_one(id).await?.into_scalar(id)
    }

    async fn take_one(&self, id: VarId) -> Result<Payload> {
        self.wait_variables(&[id])
            .await?
            .pop()
            .ok_or(SwitchError::UnknownVariable(id))
    }

    /// Hand a stream to this switch from outside (driver write, network)
    pub fn deliver_inbound(&self, var: VarId, stream: ByteStream) -> Result<()> {
        self.ports.put(PortDir::Inbound, var, stream)
    }

    pub(crate) async fn take_inbound(&self, var: VarId) -> Result<ByteStream> {
        self.take_port(PortDir::Inbound, var).await
    }

    pub(crate) fn offer_outbound(&self, var: VarId, stream: ByteStream) -> Result<()> {
        self.ports.put(PortDir::Outbound, var, stream)
    }

    /// Take a stream this switch hands to the outside (driver read, network)
    pub async fn take_outbound(&self, var: VarId) -> Result<ByteStream> {
        self.take_port(PortDir::Outbound, var).await
    }

    async fn take_port(&self, dir: PortDir, var: VarId) -> Result<ByteStream> {
        tokio::select! {
            r = self.ports.take(dir, var) => r,
            _ = self.cancel.cancelled() => Err(self.abort_error()),
        }
    }

    pub(crate) fn store_result(&self, key: String, value: Value) {
        self.results.lock().insert(key, value);
    }

    pub fn results(&self) -> Results {
        self.results.lock().clone()
    }

    /// Cancel from outside: every pending wait reports `Cancelled`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether an operation of this switch has failed
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn abort_error(&self) -> SwitchError {
        if self.has_failed() {
            SwitchError::PlanAborted
        } else {
            SwitchError::Cancelled
        }
    }

    /// Run every operation to completion.
    ///
    /// Returns the result map, or the first error after every other
    /// operation has been cancelled and joined. Streams still sitting in
    /// the tables are closed before returning.
    pub async fn run(self: &Arc<Self>) -> Result<Results> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(SwitchError::InvalidPlan(format!(
                "switch for plan {} is already running",
                self.id()
            )));
        }

        let plan_id = self.id().clone();
        let at = self.location();
        info!(plan = %plan_id, at = %at, ops = self.plan.ops.len(), "switch starting");

        let mut tasks = JoinSet::new();
        for op in self.plan.ops.iter().cloned() {
            let switch = Arc::clone(self);
            tasks.spawn(async move {
                let kind = op.kind();
                let result = tokio::select! {
                    r = op.execute(&switch) => r,
                    _ = switch.cancel.cancelled() => Err(switch.abort_error()),
                };
                (kind, result)
            });
        }

        let mut first: Option<SwitchError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (kind, result) = match joined {
                Ok(done) => done,
                Err(e) => (
                    "task",
                    Err(SwitchError::Internal(format!("operation task failed: {}", e))),
                ),
            };
            let Err(e) = result else { continue };

            if first.is_none() {
                if !e.is_abort() {
                    warn!(plan = %plan_id, at = %at, op = kind, error = %e, "operation failed, aborting plan");
                    self.failed.store(true, Ordering::Release);
                } else {
                    debug!(plan = %plan_id, at = %at, op = kind, "plan cancelled");
                }
                self.cancel.cancel();
                first = Some(e);
            } else {
                debug!(plan = %plan_id, at = %at, op = kind, error = %e, "operation stopped after abort");
            }
        }

        let closed = self.vars.close_all() + self.ports.close_all();
        if closed > 0 {
            debug!(plan = %plan_id, at = %at, closed, "closed unconsumed streams");
        }

        match first {
            Some(e) => Err(e),
            None => {
                info!(plan = %plan_id, at = %at, "switch finished");
                Ok(self.results())
            }
        }
    }
}

impl std::fmt::Debug for Switch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switch")
            .field("plan", &self.plan.id)
            .field("at", &self.location())
            .field("ops", &self.plan.ops.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;
    use crate::stream::{collect, from_bytes};
    use crate::testutil::driver_context;
    use std::time::Duration;

    fn switch(ops: Vec<Op>) -> Arc<Switch> {
        Switch::new(
            Plan::new(PlanId::new(), ops),
            driver_context(),
            &CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_passthrough_plan() {
        let sw = switch(vec![
            Op::FromDriver { output: VarId(1) },
            Op::ToDriver { input: VarId(1) },
        ]);
        let runner = {
            let sw = sw.clone();
            tokio::spawn(async move { sw.run().await })
        };

        sw.deliver_inbound(VarId(1), from_bytes(&b"hello"[..])).unwrap();
        let out = sw.take_outbound(VarId(1)).await.unwrap();
        assert_eq!(collect(out).await.unwrap(), b"hello");
        assert!(runner.await.unwrap().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bind_twice_is_rejected() {
        let sw = switch(vec![Op::Discard { input: VarId(1) }]);
        sw.bind_variable(VarId(1), Payload::Stream(from_bytes(&b"a"[..])))
            .unwrap();
        let err = sw
            .bind_variable(VarId(1), Payload::Stream(from_bytes(&b"b"[..])))
            .unwrap_err();
        assert!(matches!(err, SwitchError::AlreadyBound(VarId(1))));
        assert!(sw.is_bound(VarId(1)));
    }

    #[tokio::test]
    async fn test_failure_aborts_siblings() {
        // v1 is a signal, so the Discard fails with a type mismatch while
        // FromDriver is still waiting for its input
        let sw = switch(vec![
            Op::FromDriver { output: VarId(2) },
            Op::Discard { input: VarId(1) },
        ]);
        sw.bind_variable(VarId(1), Payload::Signal(true)).unwrap();

        let err = sw.run().await.unwrap_err();
        assert!(matches!(err, SwitchError::TypeMismatch { .. }));
        assert!(sw.has_failed());
        assert!(matches!(sw.abort_error(), SwitchError::PlanAborted));
    }

    #[tokio::test]
    async fn test_external_cancel() {
        let parent = CancellationToken::new();
        let sw = Switch::new(
            Plan::new(PlanId::new(), vec![Op::FromDriver { output: VarId(1) }]),
            driver_context(),
            &parent,
        );
        let runner = {
            let sw = sw.clone();
            tokio::spawn(async move { sw.run().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        parent.cancel();
        assert!(matches!(
            runner.await.unwrap(),
            Err(SwitchError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_run_twice() {
        let sw = switch(vec![]);
        assert!(sw.run().await.is_ok());
        assert!(matches!(sw.run().await, Err(SwitchError::InvalidPlan(_))));
    }

    #[tokio::test]
    async fn test_store_result() {
        let sw = switch(vec![Op::Store {
            input: VarId(1),
            key: "size".into(),
        }]);
        sw.bind_variable(VarId(1), Payload::Scalar(Value::Int(42)))
            .unwrap();
        let results = sw.run().await.unwrap();
        assert_eq!(results.get("size"), Some(&Value::Int(42)));
    }
}
