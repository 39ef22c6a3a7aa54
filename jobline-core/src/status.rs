//! Batch status state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Engine-level lifecycle state of a job, step, or partition execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Execution record created, nothing has run yet
    Starting,

    /// Execution is running
    Started,

    /// A stop was requested and has not been observed yet
    Stopping,

    /// Execution observed a stop request and ended
    Stopped,

    /// Execution failed
    Failed,

    /// Execution completed
    Completed,

    /// Execution was abandoned by an operator and can no longer be restarted
    Abandoned,
}

impl BatchStatus {
    /// Terminal statuses never change again through normal execution flow
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Stopped | BatchStatus::Abandoned
        )
    }

    /// In-flight statuses belong to executions that have not ended yet
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// Check if a status transition is legal
    ///
    /// # Allowed Transitions
    ///
    /// - Starting → Started, Stopping, Failed
    /// - Started → Completed, Failed, Stopping, Stopped
    /// - Stopping → Stopped, Failed
    /// - Completed, Failed, Stopped → Abandoned
    ///
    /// Setting a status to itself is always accepted.
    pub fn can_transition_to(self, to: BatchStatus) -> bool {
        use BatchStatus::*;

        if self == to {
            return true;
        }

        matches!(
            (self, to),
            (Starting, Started | Stopping | Failed)
                | (Started, Completed | Failed | Stopping | Stopped)
                | (Stopping, Stopped | Failed)
                | (Completed | Failed | Stopped, Abandoned)
        )
    }

    /// Rank used when reducing several partition outcomes to one step outcome.
    ///
    /// Higher wins: FAILED > STOPPED > COMPLETED.
    pub fn severity(self) -> u8 {
        match self {
            BatchStatus::Failed => 3,
            BatchStatus::Stopped | BatchStatus::Stopping => 2,
            BatchStatus::Abandoned => 2,
            BatchStatus::Completed => 1,
            BatchStatus::Starting | BatchStatus::Started => 0,
        }
    }

    /// The worst of two outcomes under [`BatchStatus::severity`]
    pub fn worst(self, other: BatchStatus) -> BatchStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Upper-case name used as the default exit status
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for BatchStatus {
    type Error = crate::Error;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.to_ascii_uppercase().as_str() {
            "STARTING" => Ok(BatchStatus::Starting),
            "STARTED" => Ok(BatchStatus::Started),
            "STOPPING" => Ok(BatchStatus::Stopping),
            "STOPPED" => Ok(BatchStatus::Stopped),
            "FAILED" => Ok(BatchStatus::Failed),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "ABANDONED" => Ok(BatchStatus::Abandoned),
            _ => Err(crate::Error::InvalidStatus(s.to_string())),
        }
    }
}
