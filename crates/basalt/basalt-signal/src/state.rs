//! Node lifecycle states and the allowed transition set.

/// State of one pipeline node, stored as a 32-bit cell.
///
/// Lifecycle: `Idle -> (Waiting)? -> Running -> (Complete | Error)`.
/// `Error` is sticky for the run; only a table-wide reset clears it.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Idle = 0,
    Waiting = 1,
    Running = 2,
    Complete = 3,
    Error = 4,
}

impl NodeState {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(NodeState::Idle),
            1 => Some(NodeState::Waiting),
            2 => Some(NodeState::Running),
            3 => Some(NodeState::Complete),
            4 => Some(NodeState::Error),
            _ => None,
        }
    }

    /// Whether `self -> to` is in the allowed transition set.
    pub fn permits(self, to: NodeState) -> bool {
        use NodeState::*;
        matches!(
            (self, to),
            (Idle, Waiting) | (Idle, Running) | (Waiting, Running) | (Running, Complete) | (Running, Error)
        )
    }

    /// Terminal states end a node's participation in the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Complete | NodeState::Error)
    }
}
