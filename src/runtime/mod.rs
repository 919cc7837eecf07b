pub mod dispatch;
pub mod iter;
pub mod math;
pub mod runtime_error;
pub mod state;
pub mod vm_bc;
pub mod world;

pub use dispatch::{DispatchOutcome, ScriptRuntime, TickSummary};
pub use runtime_error::VmError;
pub use state::{EngineState, Scope, StateError};
pub use vm_bc::{Context, Flow, Vm, VmConfig};
pub use world::{AccessError, ObjectStore, World};
