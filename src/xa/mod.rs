// XA transaction branch coordination.
//
// The registry tracks one context per active branch and linearizes its
// state transitions; durability stays with the backend. Backend sessions
// are reused across sequential transactions on the same logical session
// and pinned while a branch sits in Prepared.

pub mod registry;
pub mod state;

pub use registry::{TxContextSnapshot, TxRegistry};
pub use state::TxState;
