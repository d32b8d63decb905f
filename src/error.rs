//! Crate-wide error types.
//!
//! Each subsystem gets its own `thiserror` enum so call sites can match on
//! specific failure modes; `IpmiError` unifies them for code that just
//! wants to propagate with `?`. Application code (the CLI binary, test
//! helpers) uses `anyhow` on top of this the same way the rest of this
//! codebase splits library errors from application errors.

use thiserror::Error;

/// Errors from the sequence tracking table (C4).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SeqTableError {
    #[error("sequence table full, all 64 slots in use")]
    OutOfSpace,
    #[error("no sequence table entry for the given sequence number")]
    NotPresent,
}

/// Errors from the session table (C5).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("no free session slots (63 max)")]
    TableFull,
    #[error("session handle {0} is not active")]
    NotActive(u8),
    #[error("sequence number rejected by replay window")]
    SequenceRejected,
    #[error("an MC is already associated with this session/payload")]
    Busy,
    #[error("closer list is full (3 max)")]
    CloserListFull,
    #[error("RAKP integrity check failed")]
    AuthFailed,
    #[error("RAKP message received out of order for the session's current state")]
    WrongState,
}

/// Errors from the persistence store (C2).
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("persistence base directory could not be created: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {0:?} not found")]
    NotFound(String),
    #[error("record {0:?} has the wrong type")]
    WrongType(String),
    #[error("malformed persistence record: {0}")]
    Malformed(String),
}

/// Errors from the message router (C7), expressed as IPMI completion
/// codes rather than Rust-native failure reasons — the router's job is
/// to turn every error into a completion code sent back to the peer, so
/// this enum doubles as a friendly name for each code used in §6.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    #[error("command completed normally")]
    Ok = 0x00,
    #[error("payload already active or deactivated")]
    PayloadAlreadyInState = 0x80,
    #[error("node busy")]
    NodeBusy = 0x81,
    #[error("NAK on write")]
    NakOnWrite = 0x83,
    #[error("invalid command")]
    InvalidCommand = 0xC1,
    #[error("out of space")]
    OutOfSpace = 0xC4,
    #[error("data length invalid")]
    DataLengthInvalid = 0xC7,
    #[error("request data not present")]
    NotPresent = 0xCB,
    #[error("invalid data field")]
    InvalidDataField = 0xCC,
    #[error("unknown or unspecified error")]
    Unspecified = 0xFF,
}

impl CompletionCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Errors from the SOL client transport (C9).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SolClientError {
    #[error("activation failed with completion code {0:#04x}")]
    ActivationFailed(u8),
    #[error("activation response had an invalid length")]
    BadActivationResponse,
    #[error("a data packet is already outstanding, try again")]
    TryAgain,
    #[error("the connection is not in a state that allows this operation")]
    WrongState,
    #[error("retransmit retries exhausted, connection closed")]
    RetriesExhausted,
}

/// Top-level crate error, used where call sites need a single error type
/// across subsystem boundaries (e.g. the composition root).
#[derive(Debug, Error)]
pub enum IpmiError {
    #[error(transparent)]
    SeqTable(#[from] SeqTableError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    SolClient(#[from] SolClientError),
    #[error("completion code {0:#04x}")]
    Completion(u8),
}

impl From<CompletionCode> for IpmiError {
    fn from(cc: CompletionCode) -> Self {
        IpmiError::Completion(cc.code())
    }
}
