use num_enum::{IntoPrimitive, TryFromPrimitive};

/// RFC6887 §7.4 result codes. The numeric values are wire-stable; do not
/// reorder. `Success` doubles as the "no error" sentinel for
/// [`crate::message::PcpRequest::parse_result`] as well as the value a
/// response's `result_code` field carries on the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    UnsuppVersion = 1,
    NotAuthorized = 2,
    MalformedRequest = 3,
    UnsuppOpcode = 4,
    UnsuppOption = 5,
    MalformedOption = 6,
    NetworkFailure = 7,
    NoResources = 8,
    UnsuppProtocol = 9,
    UserExQuota = 10,
    CannotProvideExternal = 11,
    AddressMismatch = 12,
    ExcessiveRemotePeers = 13,
}

impl ResultCode {
    /// Whether the code represents a fatal-to-the-flow error the caller
    /// should log loudly rather than treat as routine (malformed traffic,
    /// protocol confusion). `NoResources` and `CannotProvideExternal` are
    /// pool-exhaustion conditions, routine enough not to warrant `warn!`.
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            ResultCode::UnsuppVersion
                | ResultCode::MalformedRequest
                | ResultCode::UnsuppOpcode
                | ResultCode::UnsuppOption
                | ResultCode::MalformedOption
                | ResultCode::AddressMismatch
        )
    }
}
