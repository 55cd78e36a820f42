use std::net::Ipv6Addr;

use crate::opcode::Opcode;
use crate::result_code::ResultCode;

/// MAP opcode-specific payload. Shared between request and response
/// directions since the wire layout is identical in both; only the meaning
/// of `external_port`/`external_ip` changes (client-suggested vs.
/// server-assigned).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapBody {
    pub nonce: [u8; 12],
    pub protocol: u8,
    pub internal_port: u16,
    pub external_port: u16,
    pub external_ip: Ipv6Addr,
}

/// PEER opcode-specific payload: a MAP body plus the remote peer's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerBody {
    pub map: MapBody,
    pub remote_peer_port: u16,
    pub remote_peer_ip: Ipv6Addr,
}

/// Opcode-tagged request payload. `Announce` carries nothing; this is a sum
/// type rather than a field bag so a handler can never read `external_ip`
/// off an ANNOUNCE by mistake (spec.md §9's "dynamic fields bag" redesign).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBody {
    Announce,
    Map(MapBody),
    Peer(PeerBody),
}

impl RequestBody {
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestBody::Announce => Opcode::Announce,
            RequestBody::Map(_) => Opcode::Map,
            RequestBody::Peer(_) => Opcode::Peer,
        }
    }
}

/// The 24-byte common request header, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    /// Raw opcode byte (low 7 bits), kept even when it does not resolve to
    /// a known [`Opcode`] so an error response can still echo it.
    pub opcode_raw: u8,
    pub lifetime: u32,
    /// Client's internal address, IPv4-mapped (`::ffff:a.b.c.d`) when the
    /// client is IPv4, which is the only case this server's NAT pool
    /// supports.
    pub client_ip: Ipv6Addr,
}

impl RequestHeader {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::try_from(self.opcode_raw).ok()
    }
}

/// A decoded PCP request. `parse_result` is [`ResultCode::Success`] unless
/// [`crate::decode::parse`] detected one of the non-silent error conditions
/// in spec.md §4.1, in which case `body` holds whatever opcode-shaped data
/// could still be recovered (zero-padded where the datagram was too short)
/// so a caller can synthesize a spec-shaped error response without a second
/// parse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpRequest {
    pub common: RequestHeader,
    pub body: RequestBody,
    pub parse_result: ResultCode,
}

impl PcpRequest {
    pub fn is_success(&self) -> bool {
        self.parse_result == ResultCode::Success
    }
}

/// Opcode-tagged response payload, mirroring [`RequestBody`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseBody {
    Announce,
    Map(MapBody),
    Peer(PeerBody),
}

/// The common response header fields that sit above the opcode-specific
/// payload. `client_ip_tail` is only meaningful (and only serialized) when
/// `result_code != Success`; RFC6887 §7.2 has the server echo the low 96
/// bits of the client's address there so a client behind a misbehaving NAT
/// can tell its request was mangled in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub version: u8,
    pub opcode: Opcode,
    pub result_code: ResultCode,
    pub lifetime: u32,
    pub epoch_time: u32,
    pub client_ip_tail: [u8; 12],
}

/// A PCP response ready to serialize with [`crate::encode::encode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpResponse {
    pub common: ResponseHeader,
    pub body: ResponseBody,
}

impl PcpResponse {
    /// Build a response echoing the given opcode and request lifetime,
    /// carrying `body`, with `result_code = Success` and the given
    /// `epoch_time`. Callers on the error path should build `ResponseHeader`
    /// directly so they can fill in `client_ip_tail`.
    pub fn success(opcode: Opcode, lifetime: u32, epoch_time: u32, body: ResponseBody) -> Self {
        PcpResponse {
            common: ResponseHeader {
                version: crate::SUPPORTED_VERSION,
                opcode,
                result_code: ResultCode::Success,
                lifetime,
                epoch_time,
                client_ip_tail: [0; 12],
            },
            body,
        }
    }
}
