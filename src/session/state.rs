// ============================================================================
// Session State Management
// ============================================================================
//
// A session moves through a small state machine:
//
//   Closed -> Opening -> Open -> Open (run)
//                          |
//                          +--> Committing -> Closed
//                          |
//                          +--> Faulted -> Closed
//
// Only an Open session accepts operations.
//
// ============================================================================

use serde::Serialize;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Acquiring a handle and opening the file
    Opening,

    /// Handle held, accepting operations
    Open,

    /// Saving and returning the handle
    Committing,

    /// Handle returned; terminal
    Closed,

    /// An operation timed out or the engine failed; the handle is evicted
    Faulted,
}

impl SessionState {
    /// Check if the session can run operations
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Open)
    }

    /// Check if the session is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Faulted)
    }

    pub(crate) fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Opening, Open)
                | (Opening, Faulted)
                | (Open, Committing)
                | (Open, Closed)
                | (Open, Faulted)
                | (Committing, Closed)
                | (Committing, Open)
                | (Committing, Faulted)
                | (Faulted, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Opening => write!(f, "OPENING"),
            SessionState::Open => write!(f, "OPEN"),
            SessionState::Committing => write!(f, "COMMITTING"),
            SessionState::Closed => write!(f, "CLOSED"),
            SessionState::Faulted => write!(f, "FAULTED"),
        }
    }
}

/// How a session was started, which decides who commits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Opened and closed around one operation
    SingleShot,

    /// Opened by `begin_batch`; committed only by `commit_batch`
    Batch,

    /// Opened by an explicit open-file action
    Interactive,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionKind::SingleShot => write!(f, "single_shot"),
            SessionKind::Batch => write!(f, "batch"),
            SessionKind::Interactive => write!(f, "interactive"),
        }
    }
}
