use thiserror::Error;

use crate::runtime::world::AccessError;

/// Anything that ends a dispatch early.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("range error: {0}")]
    Range(String),
    #[error("divide by zero")]
    DivideByZero,
    #[error("instruction limit exceeded ({0})")]
    InstructionLimit(u64),
    #[error("call depth limit exceeded ({0}) - possible infinite recursion")]
    CallDepth(usize),
    #[error("no current actor")]
    NoActor,
    #[error(transparent)]
    Access(#[from] AccessError),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("external gamearray '{0}' is not bound")]
    Unbound(String),
}

impl VmError {
    pub fn range(msg: impl Into<String>) -> Self {
        VmError::Range(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::labels::ObjectKind;

    #[test]
    fn test_display() {
        assert_eq!(
            VmError::range("sprite 7 is dead").to_string(),
            "range error: sprite 7 is dead"
        );
        assert_eq!(
            VmError::InstructionLimit(10).to_string(),
            "instruction limit exceeded (10)"
        );
    }

    #[test]
    fn test_access_error_is_transparent() {
        let e: VmError = AccessError::Unsupported {
            kind: ObjectKind::Wall,
            op: "delete",
        }
        .into();
        assert_eq!(e.to_string(), "cannot delete wall objects");
    }
}
