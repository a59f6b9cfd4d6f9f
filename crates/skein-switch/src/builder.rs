//! Low-level plan construction

use crate::ops::Op;
use crate::plan::{Location, NodeId, Plan, PlanId};
use crate::var::VarId;
use std::collections::BTreeMap;

/// Driver-side handle for feeding a stream into a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteHandle {
    pub(crate) var: VarId,
}

/// Driver-side handle for reading a stream out of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadHandle {
    pub(crate) var: VarId,
}

/// Driver-side handle for raising a signal inside a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalHandle {
    pub(crate) var: VarId,
}

impl WriteHandle {
    pub fn var(&self) -> VarId {
        self.var
    }
}

impl ReadHandle {
    pub fn var(&self) -> VarId {
        self.var
    }
}

impl SignalHandle {
    pub fn var(&self) -> VarId {
        self.var
    }
}

/// Output of plan construction: one plan for the driver and one per node
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan {
    pub id: PlanId,
    pub driver: Plan,
    pub agents: BTreeMap<NodeId, Plan>,
}

impl CompiledPlan {
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.agents.keys().copied()
    }

    pub fn plan_at(&self, at: Location) -> Option<&Plan> {
        match at {
            Location::Driver => Some(&self.driver),
            Location::Node(node) => self.agents.get(&node),
        }
    }

    pub fn op_count(&self) -> usize {
        self.driver.ops.len() + self.agents.values().map(|p| p.ops.len()).sum::<usize>()
    }
}

/// Allocates variables and collects operations per location
#[derive(Debug)]
pub struct PlanBuilder {
    id: PlanId,
    next_var: u32,
    driver: Vec<Op>,
    agents: BTreeMap<NodeId, Vec<Op>>,
}

impl Default for PlanBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::with_id(PlanId::new())
    }

    pub fn with_id(id: PlanId) -> Self {
        Self {
            id,
            next_var: 0,
            driver: Vec::new(),
            agents: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &PlanId {
        &self.id
    }

    pub fn new_var(&mut self) -> VarId {
        let var = VarId(self.next_var);
        self.next_var += 1;
        var
    }

    pub fn push(&mut self, at: Location, op: Op) {
        match at {
            Location::Driver => self.driver.push(op),
            Location::Node(node) => self.agents.entry(node).or_default().push(op),
        }
    }

    /// Stream written by the caller through `Executor::begin_write`
    pub fn from_driver(&mut self) -> (WriteHandle, VarId) {
        let var = self.new_var();
        self.push(Location::Driver, Op::FromDriver { output: var });
        (WriteHandle { var }, var)
    }

    /// Expose a driver-side stream to `Executor::begin_read`
    pub fn to_driver(&mut self, input: VarId) -> ReadHandle {
        self.push(Location::Driver, Op::ToDriver { input });
        ReadHandle { var: input }
    }

    /// Signal raised through `Executor::signal`
    pub fn signal(&mut self) -> (SignalHandle, VarId) {
        let var = self.new_var();
        (SignalHandle { var }, var)
    }

    /// Move a stream from `from` to `to`, returning the variable that
    /// carries it at `to`. The same id names it on both sides.
    pub fn transfer(&mut self, var: VarId, from: Location, to: Location) -> VarId {
        match (from, to) {
            (a, b) if a == b => {}
            (Location::Node(node), Location::Driver) => {
                self.push(from, Op::ServeStream { input: var });
                self.push(Location::Driver, Op::FetchStream { output: var, from: node });
            }
            (_, Location::Node(node)) => {
                self.push(from, Op::SendStream { input: var, to: node });
                self.push(to, Op::ReceiveStream { output: var });
            }
            (Location::Driver, Location::Driver) => {}
        }
        var
    }

    pub fn build(self) -> CompiledPlan {
        let id = self.id;
        CompiledPlan {
            driver: Plan::new(id.clone(), self.driver),
            agents: self
                .agents
                .into_iter()
                .map(|(node, ops)| (node, Plan::new(id.clone(), ops)))
                .collect(),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_pairs() {
        let mut b = PlanBuilder::new();
        let (_, v) = b.from_driver();
        b.transfer(v, Location::Driver, Location::Node(NodeId(1)));
        b.transfer(v, Location::Node(NodeId(1)), Location::Node(NodeId(2)));
        b.transfer(v, Location::Node(NodeId(2)), Location::Driver);
        let plan = b.build();

        assert_eq!(
            plan.driver.ops,
            vec![
                Op::FromDriver { output: v },
                Op::SendStream { input: v, to: NodeId(1) },
                Op::FetchStream { output: v, from: NodeId(2) },
            ]
        );
        assert_eq!(
            plan.agents[&NodeId(1)].ops,
            vec![
                Op::ReceiveStream { output: v },
                Op::SendStream { input: v, to: NodeId(2) },
            ]
        );
        assert_eq!(
            plan.agents[&NodeId(2)].ops,
            vec![Op::ReceiveStream { output: v }, Op::ServeStream { input: v }]
        );
        assert_eq!(plan.op_count(), 7);
    }

    #[test]
    fn test_vars_are_unique() {
        let mut b = PlanBuilder::new();
        let a = b.new_var();
        let (_, s) = b.signal();
        assert_ne!(a, s);
    }
}
