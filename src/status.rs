//! Interaction status codes as carried on the wire.
use crate::error::CodecError;
use std::fmt;

/// Status codes relevant to the invoke interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Status {
    /// Operation succeeded.
    Success = 0x00,
    /// Generic failure.
    Failure = 0x01,
    /// Access control denied the operation.
    UnsupportedAccess = 0x7E,
    /// Target endpoint does not exist.
    UnsupportedEndpoint = 0x7F,
    /// Message was malformed or not allowed at this point.
    InvalidAction = 0x80,
    /// Command id not known to the cluster.
    UnsupportedCommand = 0x81,
    /// Command fields were not acceptable.
    InvalidCommand = 0x85,
    /// A field value violated a constraint.
    ConstraintError = 0x87,
    /// Out of memory, buffers or message space.
    ResourceExhausted = 0x89,
    /// Referenced item not found.
    NotFound = 0x8B,
    /// Transaction expired.
    Timeout = 0x94,
    /// Receiver is busy; retry later.
    Busy = 0x9C,
    /// Cluster not present on the endpoint.
    UnsupportedCluster = 0xC3,
    /// Command must be sent inside a timed interaction.
    NeedsTimedInteraction = 0xC6,
    /// Too many paths in one interaction.
    PathsExhausted = 0xC8,
    /// Timed flag disagrees with the transaction context.
    TimedRequestMismatch = 0xC9,
}

impl Status {
    /// Wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Check whether this is `Success`.
    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl TryFrom<u8> for Status {
    type Error = CodecError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            0x00 => Status::Success,
            0x01 => Status::Failure,
            0x7E => Status::UnsupportedAccess,
            0x7F => Status::UnsupportedEndpoint,
            0x80 => Status::InvalidAction,
            0x81 => Status::UnsupportedCommand,
            0x85 => Status::InvalidCommand,
            0x87 => Status::ConstraintError,
            0x89 => Status::ResourceExhausted,
            0x8B => Status::NotFound,
            0x94 => Status::Timeout,
            0x9C => Status::Busy,
            0xC3 => Status::UnsupportedCluster,
            0xC6 => Status::NeedsTimedInteraction,
            0xC8 => Status::PathsExhausted,
            0xC9 => Status::TimedRequestMismatch,
            other => return Err(CodecError::UnknownStatus(other)),
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:02x})", self, self.code())
    }
}

/// Interaction status plus an optional cluster-specific status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatusIb {
    /// Interaction status.
    pub status: Status,
    /// Cluster-defined status code, if any.
    pub cluster_status: Option<u8>,
}

impl StatusIb {
    /// Status without a cluster status.
    pub fn new(status: Status) -> Self {
        Self { status, cluster_status: None }
    }

    /// Failure carrying a cluster-specific code.
    pub fn cluster_specific(status: Status, cluster_status: u8) -> Self {
        Self { status, cluster_status: Some(cluster_status) }
    }

    /// Shorthand for `Success`.
    pub fn success() -> Self {
        Self::new(Status::Success)
    }

    /// Check whether the interaction status is `Success`.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

impl From<Status> for StatusIb {
    fn from(status: Status) -> Self {
        Self::new(status)
    }
}

impl fmt::Display for StatusIb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cluster_status {
            Some(cs) => write!(f, "{} cluster status 0x{:02x}", self.status, cs),
            None => write!(f, "{}", self.status),
        }
    }
}
