use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a long-running, externally progressed operation
/// (e.g. a translation request awaiting fulfillment).
///
/// The forward path is `Created → Assigned → Completed → {Verified | Disputed}
/// → Cancelled`; the watcher does not enforce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Created,
    Assigned,
    Completed,
    Verified,
    Disputed,
    Cancelled,
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Verified => "verified",
            Self::Disputed => "disputed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A detected state change of a tracked operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub operation_id: String,
    pub previous: OperationState,
    pub current: OperationState,
}
