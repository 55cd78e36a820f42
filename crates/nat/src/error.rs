use thiserror::Error;

/// Errors the NAT table and allocator can report. Callers (the PCP server
/// logic layer) match on these rather than string-matching a log line, per
/// DESIGN.md's rationale for using `thiserror` here instead of turn-rs's
/// looser ad hoc `Error` enum.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NatError {
    /// The requested internal (address, port, protocol) already has a
    /// mapping and the request did not ask to replace it.
    #[error("internal endpoint already mapped")]
    AlreadyMapped,
    /// No entry exists for the given key.
    #[error("no mapping for the given endpoint")]
    NotMapped,
    /// The external endpoint pool has no address/port combination left to
    /// hand out (and, if the client suggested one, that one was taken).
    #[error("no external endpoints available")]
    NoResources,
}

pub type NatResult<T> = Result<T, NatError>;
