// Branch lifecycle state.
//
// Transitions follow the XA branch state machine:
//
// ```text
// Nonexistent -> Active             (start, no flags)
// Active      -> Active             (start, join)
// Active      -> Ended              (end)
// Ended       -> Active             (start, resume)
// Ended       -> Prepared           (prepare, XA_OK)
// Ended       -> Committed          (commit, one-phase)
// Ended       -> RolledBack         (rollback)
// Prepared    -> Committed          (commit, two-phase)
// Prepared    -> RolledBack         (rollback)
// Active      -> RolledBack         (rollback direct)
// ```
//
// Committed and RolledBack are terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Nonexistent,
    Active,
    Ended,
    Prepared,
    Committed,
    RolledBack,
}

impl TxState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    /// Whether a rollback is a legal next step from this state.
    #[inline]
    pub fn can_roll_back(&self) -> bool {
        matches!(self, TxState::Active | TxState::Ended | TxState::Prepared)
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Nonexistent => write!(f, "NONEXISTENT"),
            TxState::Active => write!(f, "ACTIVE"),
            TxState::Ended => write!(f, "ENDED"),
            TxState::Prepared => write!(f, "PREPARED"),
            TxState::Committed => write!(f, "COMMITTED"),
            TxState::RolledBack => write!(f, "ROLLEDBACK"),
        }
    }
}
