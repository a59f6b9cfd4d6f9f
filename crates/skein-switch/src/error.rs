//! Error types for the switch engine

use crate::plan::{NodeId, PlanId};
use crate::var::{VarId, VarKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for switch operations
pub type Result<T> = std::result::Result<T, SwitchError>;

/// Errors raised while building, dispatching or running a plan
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("variable {0} is already bound")]
    AlreadyBound(VarId),

    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    #[error("dispatch to node {node} failed: {reason}")]
    DispatchFailed { node: NodeId, reason: String },

    #[error("plan cancelled")]
    Cancelled,

    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("timed out waiting for variable {0} to be bound")]
    BindingTimeout(VarId),

    #[error("plan aborted after another operation failed")]
    PlanAborted,

    #[error("unknown variable {0}")]
    UnknownVariable(VarId),

    #[error("variable {var} holds a {actual:?}, expected {expected:?}")]
    TypeMismatch {
        var: VarId,
        expected: VarKind,
        actual: VarKind,
    },

    #[error("stream in variable {0} was already consumed")]
    StreamConsumed(VarId),

    #[error("no switch registered for plan {0}")]
    SwitchNotFound(PlanId),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("no source can produce {0}")]
    NoSource(String),

    #[error("erasure coding error: {0}")]
    Erasure(#[from] skein_ec::Error),

    #[error("blob store error: {0}")]
    Blob(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("remote failure: {0}")]
    Remote(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchError {
    /// Whether this error only reports that the plan was torn down
    pub fn is_abort(&self) -> bool {
        matches!(self, SwitchError::Cancelled | SwitchError::PlanAborted)
    }
}

impl From<rmp_serde::encode::Error> for SwitchError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SwitchError::Protocol(format!("encode: {}", e))
    }
}

impl From<rmp_serde::decode::Error> for SwitchError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SwitchError::Protocol(format!("decode: {}", e))
    }
}

/// Serializable form of [`SwitchError`] sent back over a dispatch connection.
///
/// Variants the driver reasons about keep their shape; everything else
/// travels as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    InsufficientShards { available: usize, required: usize },
    DispatchFailed { node: NodeId, reason: String },
    Cancelled,
    PlanAborted,
    SwitchNotFound(PlanId),
    InvalidPlan(String),
    NoSource(String),
    Other(String),
}

impl From<&SwitchError> for WireError {
    fn from(e: &SwitchError) -> Self {
        match e {
            SwitchError::InsufficientShards {
                available,
                required,
            } => WireError::InsufficientShards {
                available: *available,
                required: *required,
            },
            SwitchError::Erasure(skein_ec::Error::InsufficientShards {
                available,
                required,
            }) => WireError::InsufficientShards {
                available: *available,
                required: *required,
            },
            SwitchError::DispatchFailed { node, reason } => WireError::DispatchFailed {
                node: *node,
                reason: reason.clone(),
            },
            SwitchError::Cancelled => WireError::Cancelled,
            SwitchError::PlanAborted => WireError::PlanAborted,
            SwitchError::SwitchNotFound(id) => WireError::SwitchNotFound(id.clone()),
            SwitchError::InvalidPlan(msg) => WireError::InvalidPlan(msg.clone()),
            SwitchError::NoSource(msg) => WireError::NoSource(msg.clone()),
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for SwitchError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::InsufficientShards {
                available,
                required,
            } => SwitchError::InsufficientShards {
                available,
                required,
            },
            WireError::DispatchFailed { node, reason } => {
                SwitchError::DispatchFailed { node, reason }
            }
            WireError::Cancelled => SwitchError::Cancelled,
            WireError::PlanAborted => SwitchError::PlanAborted,
            WireError::SwitchNotFound(id) => SwitchError::SwitchNotFound(id),
            WireError::InvalidPlan(msg) => SwitchError::InvalidPlan(msg),
            WireError::NoSource(msg) => SwitchError::NoSource(msg),
            WireError::Other(msg) => SwitchError::Remote(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_error_keeps_shard_counts() {
        let err = SwitchError::Erasure(skein_ec::Error::InsufficientShards {
            available: 3,
            required: 4,
        });
        let back: SwitchError = WireError::from(&err).into();
        assert!(matches!(
            back,
            SwitchError::InsufficientShards {
                available: 3,
                required: 4
            }
        ));
    }

    #[test]
    fn test_wire_error_flattens_the_rest() {
        let err = SwitchError::Blob("disk full".into());
        let wire = WireError::from(&err);
        assert_eq!(wire, WireError::Other("blob store error: disk full".into()));
        assert!(matches!(SwitchError::from(wire), SwitchError::Remote(_)));
    }

    #[test]
    fn test_abort_classification() {
        assert!(SwitchError::Cancelled.is_abort());
        assert!(SwitchError::PlanAborted.is_abort());
        assert!(!SwitchError::TimedOut("x".into()).is_abort());
    }
}
