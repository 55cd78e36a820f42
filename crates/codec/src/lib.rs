//! ## Port Control Protocol (PCP) wire codec
//!
//! [RFC6887]: https://tools.ietf.org/html/rfc6887
//!
//! PCP lets a client on the private side of a NAT or firewall ask the
//! device controlling that NAT to create, refresh, or remove a mapping
//! between an internal (address, port, protocol) and an external one, and
//! to learn the remote peer an inbound flow should be expected from. This
//! crate implements the wire format only: parsing a datagram into a typed
//! [`PcpMessage`], and serializing a [`PcpResponse`] back to bytes, per
//! [RFC6887] §7 and §11. Option parsing (THIRD_PARTY, PREFER_FAILURE,
//! FILTER) is not implemented.

pub mod decode;
pub mod encode;
pub mod message;
pub mod opcode;
pub mod result_code;

pub use decode::parse;
pub use encode::encode;
pub use message::{
    MapBody, PcpRequest, PcpResponse, PeerBody, RequestBody, RequestHeader, ResponseBody,
    ResponseHeader,
};
pub use opcode::Opcode;
pub use result_code::ResultCode;

/// Size of the common request/response header, in bytes.
pub const COMMON_HEADER_LEN: usize = 24;
/// Size of the MAP opcode-specific payload, in bytes.
pub const MAP_BODY_LEN: usize = 36;
/// Size of the PEER opcode-specific payload, in bytes.
pub const PEER_BODY_LEN: usize = 56;
/// Maximum accepted datagram length (RFC6887 implementations commonly cap
/// below the theoretical option-laden maximum; this server never parses
/// options so 1100 bytes comfortably covers MAP/PEER plus any options a
/// client might still attach).
pub const MAX_DATAGRAM_LEN: usize = 1100;

/// PCP protocol version this server understands. RFC6887 obsoletes NAT-PMP's
/// version 0 and defines version 2; there is no version 1 in the RFC, it
/// belongs to an earlier draft some stacks still probe for.
pub const SUPPORTED_VERSION: u8 = 2;
