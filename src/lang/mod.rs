//! # Engine-facing language tables
//!
//! Static data shared by the compiler and the VM: engine limits, the global
//! event table, and the member-label schema for sectors, walls and sprites.
//!
//! Nothing in here is user-declarable. Scripts can only refer to these names.

pub mod events;
pub mod labels;
pub mod limits;
