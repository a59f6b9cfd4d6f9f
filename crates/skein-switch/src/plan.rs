//! Plans: the per-node operation lists of one transfer

use crate::error::{Result, SwitchError};
use crate::ops::Op;
use crate::var::VarId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifier shared by every node's sub-plan of one transfer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanId(String);

impl PlanId {
    /// Fresh random id
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for PlanId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage node identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Where an operation runs: the driver process or a storage node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Location {
    Driver,
    Node(NodeId),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Driver => f.write_str("driver"),
            Location::Node(n) => n.fmt(f),
        }
    }
}

/// Operations one node runs for one transfer. Order is not dependency order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub ops: Vec<Op>,
}

impl Plan {
    pub fn new(id: PlanId, ops: Vec<Op>) -> Self {
        Self { id, ops }
    }

    /// Every variable some operation reads or writes
    pub fn declared_vars(&self) -> HashSet<VarId> {
        self.ops
            .iter()
            .flat_map(|op| op.inputs().into_iter().chain(op.outputs()))
            .collect()
    }

    /// Check structural rules: each op's inputs and outputs are disjoint and
    /// no variable has two producers.
    pub fn validate(&self) -> Result<()> {
        let mut produced = HashSet::new();
        for op in &self.ops {
            let inputs = op.inputs();
            let mut seen = HashSet::new();
            if let Some(dup) = inputs.iter().find(|id| !seen.insert(**id)) {
                return Err(SwitchError::InvalidPlan(format!(
                    "{} reads {} twice",
                    op.kind(),
                    dup
                )));
            }
            for out in op.outputs() {
                if inputs.contains(&out) {
                    return Err(SwitchError::InvalidPlan(format!(
                        "{} both reads and writes {}",
                        op.kind(),
                        out
                    )));
                }
                if !produced.insert(out) {
                    return Err(SwitchError::InvalidPlan(format!(
                        "{} is produced more than once",
                        out
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::Op;

    #[test]
    fn test_validate_rejects_double_producer() {
        let plan = Plan::new(
            PlanId::new(),
            vec![
                Op::FromDriver { output: VarId(1) },
                Op::FromDriver { output: VarId(1) },
            ],
        );
        assert!(matches!(plan.validate(), Err(SwitchError::InvalidPlan(_))));
    }

    #[test]
    fn test_validate_rejects_self_loop() {
        let plan = Plan::new(
            PlanId::new(),
            vec![Op::Clone {
                input: VarId(1),
                outputs: vec![VarId(1), VarId(2)],
            }],
        );
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_repeated_input() {
        let plan = Plan::new(
            PlanId::new(),
            vec![Op::ChunkedJoin {
                inputs: vec![VarId(1), VarId(1)],
                output: VarId(2),
                chunk_size: 4,
                size: None,
            }],
        );
        assert!(matches!(plan.validate(), Err(SwitchError::InvalidPlan(_))));
    }

    #[test]
    fn test_declared_vars() {
        let plan = Plan::new(
            PlanId::new(),
            vec![
                Op::FromDriver { output: VarId(1) },
                Op::Discard { input: VarId(1) },
            ],
        );
        assert_eq!(plan.declared_vars(), HashSet::from([VarId(1)]));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_plan_ids_are_unique() {
        assert_ne!(PlanId::new(), PlanId::new());
    }
}
