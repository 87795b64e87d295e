use serde::Serialize;

/// Where a job is in its lifecycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    /// Waiting for enough replicas to confirm before becoming visible.
    WaitRepl,
    /// Known to this node but not queued here (e.g. a replica copy).
    Active,
    Queued,
    Acked,
    Deleted,
}

impl JobState {
    /// The single byte used for this state in serialised job records.
    pub fn code(self) -> u8 {
        use JobState::*;

        match self {
            WaitRepl => 0,
            Active => 1,
            Queued => 2,
            Acked => 3,
            Deleted => 4,
        }
    }
}

impl TryFrom<u8> for JobState {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use JobState::*;

        Ok(match value {
            0 => WaitRepl,
            1 => Active,
            2 => Queued,
            3 => Acked,
            4 => Deleted,
            other => return Err(other),
        })
    }
}

// This impl is used to allow job details to be serialised to YAML.
impl Serialize for JobState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use JobState::*;

        serializer.serialize_str(match self {
            WaitRepl => "wait-repl",
            Active => "active",
            Queued => "queued",
            Acked => "acked",
            Deleted => "deleted",
        })
    }
}
