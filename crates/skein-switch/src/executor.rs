//! Driver-side execution of a compiled plan

use crate::builder::{CompiledPlan, ReadHandle, SignalHandle, WriteHandle};
use crate::context::NodeContext;
use crate::error::{Result, SwitchError};
use crate::ops::transfer::dispatch_error;
use crate::plan::{NodeId, Plan, PlanId};
use crate::stream::{ByteStream, PipeWriter, pipe};
use crate::switch::{Results, Switch};
use crate::transport::AgentConnector;
use crate::var::Payload;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a cancelled dispatch may still deliver the node's own outcome
const CANCEL_GRACE: Duration = Duration::from_millis(200);

/// A running plan, seen from the driver.
///
/// `start` dispatches every node plan and runs the driver plan locally.
/// The caller feeds driver inputs with [`begin_write`](Self::begin_write),
/// pulls driver outputs with [`begin_read`](Self::begin_read) and collects
/// the merged results with [`wait`](Self::wait). Dropping the executor
/// cancels the plan everywhere.
pub struct Executor {
    id: PlanId,
    driver: Arc<Switch>,
    cancel: CancellationToken,
    bind_timeout: Duration,
    pipe_depth: usize,
    task: JoinHandle<Result<Results>>,
}

impl Executor {
    /// Validate `plan` and start it. Must be called within a tokio runtime.
    pub fn start(plan: CompiledPlan, ctx: Arc<NodeContext>) -> Result<Self> {
        plan.driver.validate()?;
        for node_plan in plan.agents.values() {
            node_plan.validate()?;
        }

        let CompiledPlan { id, driver, agents } = plan;
        let config = ctx.config().clone();
        let connector = ctx.connector().clone();
        let cancel = CancellationToken::new();
        let driver = Switch::new(driver, ctx, &cancel);

        info!(plan = %id, nodes = agents.len(), "executing plan");
        let task = tokio::spawn(drive(driver.clone(), agents, connector, cancel.clone()));

        Ok(Self {
            id,
            driver,
            cancel,
            bind_timeout: config.bind_timeout(),
            pipe_depth: config.pipe_depth,
            task,
        })
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.id
    }

    /// Supply the stream for a driver input
    pub fn begin_write(&self, handle: WriteHandle, stream: ByteStream) -> Result<()> {
        self.driver.deliver_inbound(handle.var(), stream)
    }

    /// Supply a driver input through a writer. The input ends cleanly only
    /// once the writer is shut down.
    pub fn open_writer(&self, handle: WriteHandle) -> Result<PipeWriter> {
        let (writer, reader) = pipe(self.pipe_depth);
        self.begin_write(handle, Box::new(reader))?;
        Ok(writer)
    }

    /// Take the stream of a driver output once the plan produces it
    pub async fn begin_read(&self, handle: ReadHandle) -> Result<ByteStream> {
        let var = handle.var();
        tokio::time::timeout(self.bind_timeout, self.driver.take_outbound(var))
            .await
            .map_err(|_| SwitchError::BindingTimeout(var))?
    }

    /// Raise or drop a driver signal
    pub fn signal(&self, handle: SignalHandle, value: bool) -> Result<()> {
        self.driver.bind_variable(handle.var(), Payload::Signal(value))
    }

    /// Abort the plan on every node
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for every node and the driver, returning the merged results.
    ///
    /// Cancelling `caller` aborts the plan and yields `Cancelled`.
    pub async fn wait(mut self, caller: &CancellationToken) -> Result<Results> {
        tokio::select! {
            joined = &mut self.task => flatten(joined),
            _ = caller.cancelled() => {
                self.cancel.cancel();
                let _ = (&mut self.task).await;
                Err(SwitchError::Cancelled)
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("plan", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

fn flatten(joined: std::result::Result<Result<Results>, tokio::task::JoinError>) -> Result<Results> {
    joined.unwrap_or_else(|e| Err(SwitchError::Internal(format!("executor task failed: {}", e))))
}

async fn drive(
    driver: Arc<Switch>,
    agents: BTreeMap<NodeId, Plan>,
    connector: Arc<dyn AgentConnector>,
    cancel: CancellationToken,
) -> Result<Results> {
    let plan_id = driver.id().clone();
    let mut tasks: JoinSet<(Option<NodeId>, Result<Results>)> = JoinSet::new();

    for (node, plan) in agents {
        let connector = connector.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let call = dispatch(connector.as_ref(), node, plan);
            tokio::pin!(call);
            // dropping the dispatch future aborts the remote plan; a node
            // that already failed still gets to report why
            let result = tokio::select! {
                biased;
                r = &mut call => r,
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(CANCEL_GRACE, &mut call).await {
                        Ok(r) => r,
                        Err(_) => Err(SwitchError::Cancelled),
                    }
                }
            };
            (Some(node), result)
        });
    }
    {
        let driver = driver.clone();
        tasks.spawn(async move { (None, driver.run().await) });
    }

    let mut results = Results::new();
    let mut errors = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        let (node, result) = joined.unwrap_or_else(|e| {
            (
                None,
                Err(SwitchError::Internal(format!("dispatch task failed: {}", e))),
            )
        });
        match result {
            Ok(r) => results.extend(r),
            Err(e) => {
                if errors.is_empty() {
                    match node {
                        Some(node) => warn!(plan = %plan_id, node = %node, error = %e, "node plan failed, cancelling"),
                        None => warn!(plan = %plan_id, error = %e, "driver plan failed, cancelling"),
                    }
                    cancel.cancel();
                } else {
                    debug!(plan = %plan_id, error = %e, "plan part stopped after abort");
                }
                errors.push(e);
            }
        }
    }

    match root_cause(errors) {
        Some(e) => Err(e),
        None => {
            info!(plan = %plan_id, results = results.len(), "plan finished");
            Ok(results)
        }
    }
}

async fn dispatch(connector: &dyn AgentConnector, node: NodeId, plan: Plan) -> Result<Results> {
    let client = connector
        .connect(node)
        .await
        .map_err(|e| dispatch_error(node, e))?;
    debug!(plan = %plan.id, node = %node, ops = plan.ops.len(), "dispatching");
    client
        .execute_plan(plan)
        .await
        .map_err(|e| dispatch_error(node, e))
}

/// The error that explains a failed plan: a dispatch failure first, then
/// any error that is not a side effect of the abort, then whatever came first
pub(crate) fn root_cause(mut errors: Vec<SwitchError>) -> Option<SwitchError> {
    if errors.is_empty() {
        return None;
    }
    let pick = errors
        .iter()
        .position(|e| matches!(e, SwitchError::DispatchFailed { .. }))
        .or_else(|| errors.iter().position(|e| !e.is_abort()))
        .unwrap_or(0);
    Some(errors.swap_remove(pick))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PlanBuilder;
    use crate::context::EngineConfig;
    use crate::ops::Op;
    use crate::plan::Location;
    use crate::stream::{collect, from_bytes};
    use crate::testutil::driver_context;
    use crate::transport::LocalCluster;
    use tokio::io::AsyncWriteExt;

    fn passthrough() -> (CompiledPlan, WriteHandle, ReadHandle) {
        let mut b = PlanBuilder::new();
        let (write, var) = b.from_driver();
        let read = b.to_driver(var);
        (b.build(), write, read)
    }

    #[tokio::test]
    async fn test_driver_only_plan() {
        let (plan, write, read) = passthrough();
        let exec = Executor::start(plan, driver_context()).unwrap();

        exec.begin_write(write, from_bytes(&b"payload"[..])).unwrap();
        let out = exec.begin_read(read).await.unwrap();
        assert_eq!(collect(out).await.unwrap(), b"payload");
        assert!(exec.wait(&CancellationToken::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_writer() {
        let (plan, write, read) = passthrough();
        let exec = Executor::start(plan, driver_context()).unwrap();

        let mut writer = exec.open_writer(write).unwrap();
        let out = exec.begin_read(read).await.unwrap();
        let reader = tokio::spawn(collect(out));
        writer.write_all(b"abc").await.unwrap();
        writer.write_all(b"def").await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(reader.await.unwrap().unwrap(), b"abcdef");
        exec.wait(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_begin_read_times_out() {
        let cluster = LocalCluster::new(EngineConfig::default().with_bind_timeout(20));
        let (plan, _write, read) = passthrough();
        let exec = Executor::start(plan, cluster.driver_context()).unwrap();

        let err = exec.begin_read(read).await.err().unwrap();
        assert!(matches!(err, SwitchError::BindingTimeout(v) if v == read.var()));
        exec.cancel();
        assert!(matches!(
            exec.wait(&CancellationToken::new()).await,
            Err(SwitchError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let (plan, _write, _read) = passthrough();
        let exec = Executor::start(plan, driver_context()).unwrap();
        let caller = CancellationToken::new();
        caller.cancel();
        assert!(matches!(exec.wait(&caller).await, Err(SwitchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_signal_releases_hold() {
        let mut b = PlanBuilder::new();
        let (write, input) = b.from_driver();
        let (go, signal) = b.signal();
        let output = b.new_var();
        b.push(
            Location::Driver,
            Op::HoldUntil {
                signal,
                input,
                output,
            },
        );
        let read = b.to_driver(output);
        let exec = Executor::start(b.build(), driver_context()).unwrap();

        exec.begin_write(write, from_bytes(&b"held"[..])).unwrap();
        exec.signal(go, true).unwrap();
        let out = exec.begin_read(read).await.unwrap();
        assert_eq!(collect(out).await.unwrap(), b"held");
        exec.wait(&CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_node_is_dispatch_failure() {
        let cluster = LocalCluster::new(EngineConfig::default());
        let mut b = PlanBuilder::new();
        let (write, var) = b.from_driver();
        let at = b.transfer(var, Location::Driver, Location::Node(NodeId(7)));
        b.push(Location::Node(NodeId(7)), Op::Discard { input: at });
        let exec = Executor::start(b.build(), cluster.driver_context()).unwrap();
        exec.begin_write(write, from_bytes(&b"x"[..])).unwrap();

        let err = exec.wait(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SwitchError::DispatchFailed { node: NodeId(7), .. }));
    }

    #[test]
    fn test_root_cause_order() {
        assert!(root_cause(vec![]).is_none());

        let picked = root_cause(vec![
            SwitchError::Cancelled,
            SwitchError::Blob("disk".into()),
            SwitchError::DispatchFailed {
                node: NodeId(3),
                reason: "down".into(),
            },
        ]);
        assert!(matches!(picked, Some(SwitchError::DispatchFailed { node: NodeId(3), .. })));

        let picked = root_cause(vec![SwitchError::PlanAborted, SwitchError::Blob("disk".into())]);
        assert!(matches!(picked, Some(SwitchError::Blob(_))));

        let picked = root_cause(vec![SwitchError::PlanAborted, SwitchError::Cancelled]);
        assert!(matches!(picked, Some(SwitchError::PlanAborted)));
    }
}
