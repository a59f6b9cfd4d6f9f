//! Variables: single-assignment slots that carry data between operations

use crate::error::{Result, SwitchError};
use crate::stream::ByteStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a variable, unique within one plan instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VarId(pub u32);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// What a variable carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarKind {
    Stream,
    Signal,
    Scalar,
}

/// Opaque scalar value, e.g. a content hash or a byte count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Str(String),
    Int(i64),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            Value::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{}", i),
        }
    }
}

/// Payload bound to a variable.
///
/// A stream has exactly one owner: taking it out of the table moves it.
/// Signals and scalars are copied to every reader.
pub enum Payload {
    Stream(ByteStream),
    Signal(bool),
    Scalar(Value),
}

impl Payload {
    pub fn kind(&self) -> VarKind {
        match self {
            Payload::Stream(_) => VarKind::Stream,
            Payload::Signal(_) => VarKind::Signal,
            Payload::Scalar(_) => VarKind::Scalar,
        }
    }

    /// Copy of a signal or scalar payload, `None` for streams
    pub(crate) fn share(&self) -> Option<Payload> {
        match self {
            Payload::Stream(_) => None,
            Payload::Signal(b) => Some(Payload::Signal(*b)),
            Payload::Scalar(v) => Some(Payload::Scalar(v.clone())),
        }
    }

    pub fn into_stream(self, var: VarId) -> Result<ByteStream> {
        match self {
            Payload::Stream(s) => Ok(s),
            other => Err(mismatch(var, VarKind::Stream, other.kind())),
        }
    }

    pub fn into_signal(self, var: VarId) -> Result<bool> {
        match self {
            Payload::Signal(b) => Ok(b),
            other => Err(mismatch(var, VarKind::Signal, other.kind())),
        }
    }

    pub fn into_scalar(self, var: VarId) -> Result<Value> {
        match self {
            Payload::Scalar(v) => Ok(v),
            other => Err(mismatch(var, VarKind::Scalar, other.kind())),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Stream(_) => f.write_str("Stream(..)"),
            Payload::Signal(b) => f.debug_tuple("Signal").field(b).finish(),
            Payload::Scalar(v) => f.debug_tuple("Scalar").field(v).finish(),
        }
    }
}

fn mismatch(var: VarId, expected: VarKind, actual: VarKind) -> SwitchError {
    SwitchError::TypeMismatch {
        var,
        expected,
        actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_conversions() {
        assert!(Payload::Signal(true).into_signal(VarId(1)).unwrap());
        assert_eq!(
            Payload::Scalar(Value::Int(7)).into_scalar(VarId(2)).unwrap(),
            Value::Int(7)
        );
        let err = Payload::Signal(false).into_scalar(VarId(3)).unwrap_err();
        assert!(matches!(
            err,
            SwitchError::TypeMismatch {
                expected: VarKind::Scalar,
                actual: VarKind::Signal,
                ..
            }
        ));
    }

    #[test]
    fn test_share_skips_streams() {
        let stream: ByteStream = Box::new(std::io::Cursor::new(Vec::<u8>::new()));
        assert!(Payload::Stream(stream).share().is_none());
        assert!(matches!(
            Payload::Scalar(Value::Str("a".into())).share(),
            Some(Payload::Scalar(Value::Str(_)))
        ));
    }
}
