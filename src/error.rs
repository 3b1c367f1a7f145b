use std::{io, path::PathBuf, time::Duration};

use crate::{
    aggregate::RoundState, group::MemberId, table::wire::AbortReason,
};

/// Rejections raised before a round writes anything.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("member list is empty")]
    EmptyMemberList,
    #[error("member {0} appears more than once in the member list")]
    DuplicateMember(MemberId),
    #[error("local index {index} is out of range for {members} members")]
    LocalIndexOutOfRange { index: usize, members: usize },
    #[error("row {index} belongs to member {owner}, not to member {local}")]
    NotLocalMember {
        index: usize,
        owner: MemberId,
        local: MemberId,
    },
    #[error("member index {index} is out of range for {members} members")]
    MemberIndexOutOfRange { index: usize, members: usize },
    #[error("a round needs at least one column")]
    NoColumns,
    #[error("column {column} is out of range for {columns} columns")]
    ColumnOutOfRange { column: usize, columns: usize },
    #[error("no route to member {0}")]
    UnknownMember(MemberId),
    #[error("synchronize called before the local row was published")]
    SynchronizeBeforePublish,
    #[error("{got} reducers given for {expected} columns")]
    ReducerCount { expected: usize, got: usize },
    #[error("cannot {step} a round that is {state:?}")]
    OutOfOrder {
        step: &'static str,
        state: RoundState,
    },
}

/// Errors that abandon a reduction round.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration rejected: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("member {member} could not publish its row: {reason}")]
    PublishFailure { member: MemberId, reason: String },
    #[error(
        "synchronization did not complete within {timeout:?}, still waiting \
         on {waiting_on:?}"
    )]
    SynchronizationTimeout {
        timeout: Duration,
        waiting_on: Vec<MemberId>,
    },
    #[error("round aborted before synchronization completed")]
    RoundAborted,
    #[error("member {member} abandoned the round ({reason})")]
    PeerAborted {
        member: MemberId,
        reason: AbortReason,
    },
    #[error("member {member} is reducing over a different member list")]
    MembershipMismatch { member: MemberId },
    #[error("member {member} published {got} columns, expected {expected}")]
    ColumnMismatch {
        member: MemberId,
        expected: usize,
        got: usize,
    },
    #[error("transport closed while synchronizing")]
    Disconnected,
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{path:?} line {line} is not a throughput value")]
    MalformedResultFile { path: PathBuf, line: usize },
    #[error("workload failed: {0}")]
    Workload(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Returns true if the round may be retried with a fresh table.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SynchronizationTimeout { .. }
                | Error::PeerAborted { .. }
                | Error::PublishFailure { .. }
                | Error::Disconnected
        )
    }
}

/// Malformed frames read off a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("frame truncated: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
    #[error("unknown frame kind {0}")]
    UnknownKind(u8),
    #[error("unknown abort reason {0}")]
    UnknownAbortReason(u8),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("frame length {0} exceeds the limit")]
    FrameTooLarge(usize),
}
