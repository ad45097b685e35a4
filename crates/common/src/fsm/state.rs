use std::fmt;

use tokio::time::Instant;

/// Which behavior a machine runs for the next message.
///
/// `Discovering` and `Deleting` do their work as soon as they are entered
///  and never wait on the inbox; every other state handles one message and
///  names its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Reading local history and the master record to pick a role
    Discovering,
    /// Mastered here; serving reads and writes
    Active,
    /// Mastered elsewhere; serving reads only
    Passive,
    /// Recovering from a failure; nothing is handled before `until`
    Backoff { until: Instant },
    /// Being populated from a replication stream
    Receiving,
    /// Removing local data
    Deleting,
    Deleted,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Discovering => "discovering",
            State::Active => "active",
            State::Passive => "passive",
            State::Backoff { .. } => "backoff",
            State::Receiving => "receiving",
            State::Deleting => "deleting",
            State::Deleted => "deleted",
        }
    }

    /// States that run without waiting for a message
    pub fn is_eager(&self) -> bool {
        matches!(self, State::Discovering | State::Deleting)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Deleted)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
