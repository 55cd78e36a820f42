use std::net::{Ipv4Addr, Ipv6Addr};

use crate::message::{MapBody, PcpRequest, PeerBody, RequestBody, RequestHeader};
use crate::opcode::Opcode;
use crate::result_code::ResultCode;
use crate::{COMMON_HEADER_LEN, MAP_BODY_LEN, MAX_DATAGRAM_LEN, PEER_BODY_LEN, SUPPORTED_VERSION};

/// Parse a UDP datagram received on the PCP port (5351) into a [`PcpRequest`].
///
/// `source_ip` is the source address from the IP header the datagram
/// arrived on, used for the address-mismatch check in spec.md §4.1.
///
/// Returns `None` for the datagrams that must be silently dropped per
/// spec.md §4.1 (too short to contain even an opcode byte, the R bit set,
/// this server never expects to receive a response, or too short to
/// contain a common header at all once the version is confirmed
/// supported). Every other malformed datagram returns `Some` with
/// `parse_result` set to the appropriate [`ResultCode`] so the caller can
/// build and send an error response.
pub fn parse(bytes: &[u8], source_ip: Ipv4Addr) -> Option<PcpRequest> {
    if bytes.len() < 2 {
        return None;
    }
    if bytes[1] & 0x80 != 0 {
        // R bit set: this is response-shaped, not a request. A PCP server
        // never initiates requests of its own, so nothing we sent could
        // have prompted this; drop it rather than dignify it with a reply.
        return None;
    }
    if bytes.len() < COMMON_HEADER_LEN {
        return None;
    }

    let version = bytes[0];
    let opcode_raw = bytes[1] & 0x7f;
    let lifetime = read_u32(bytes, 4);
    let client_ip = read_ipv6(bytes, 8);

    let common = RequestHeader {
        version,
        opcode_raw,
        lifetime,
        client_ip,
    };

    let opcode = Opcode::try_from(opcode_raw).ok();
    let payload = &bytes[COMMON_HEADER_LEN..];

    let error = |result: ResultCode, body: RequestBody| {
        Some(PcpRequest {
            common,
            body,
            parse_result: result,
        })
    };
    let lenient_body = |opcode: Option<Opcode>| match opcode {
        None | Some(Opcode::Announce) => RequestBody::Announce,
        Some(Opcode::Map) => RequestBody::Map(parse_map_body_lenient(payload)),
        Some(Opcode::Peer) => RequestBody::Peer(parse_peer_body_lenient(payload)),
    };

    if version != SUPPORTED_VERSION {
        return error(ResultCode::UnsuppVersion, lenient_body(opcode));
    }

    let encoded_length = bytes.len();
    if encoded_length % 4 != 0 || encoded_length > MAX_DATAGRAM_LEN {
        return error(ResultCode::MalformedRequest, lenient_body(opcode));
    }

    let Some(opcode) = opcode else {
        return error(ResultCode::UnsuppOpcode, RequestBody::Announce);
    };

    if client_ip.to_ipv4_mapped() != Some(source_ip) {
        return error(ResultCode::AddressMismatch, lenient_body(Some(opcode)));
    }

    match opcode {
        Opcode::Announce => Some(PcpRequest {
            common,
            body: RequestBody::Announce,
            parse_result: ResultCode::Success,
        }),
        Opcode::Map => {
            if payload.len() < MAP_BODY_LEN {
                return error(ResultCode::MalformedRequest, lenient_body(Some(opcode)));
            }
            let map = parse_map_body(payload);
            if let Some(result) = validate_map_semantics(&map, lifetime) {
                return error(result, RequestBody::Map(map));
            }
            Some(PcpRequest {
                common,
                body: RequestBody::Map(map),
                parse_result: ResultCode::Success,
            })
        }
        Opcode::Peer => {
            if payload.len() < PEER_BODY_LEN {
                return error(ResultCode::MalformedRequest, lenient_body(Some(opcode)));
            }
            let peer = parse_peer_body(payload);
            if let Some(result) = validate_map_semantics(&peer.map, lifetime) {
                return error(result, RequestBody::Peer(peer));
            }
            Some(PcpRequest {
                common,
                body: RequestBody::Peer(peer),
                parse_result: ResultCode::Success,
            })
        }
    }
}

/// The MAP-opcode semantic checks from spec.md §4.1/§9, applied to both MAP
/// and the MAP prefix of a PEER payload. Returns the result code to report,
/// or `None` if the payload is semantically valid.
///
/// The first check is spec.md's corrected reading of the original source's
/// malformed-request guard (see DESIGN.md): a client deleting a mapping
/// (`lifetime == 0`) is always allowed to pass `protocol == 0`, but a
/// client *creating or refreshing* one (`lifetime != 0`) with `protocol ==
/// 0` (all protocols) must also set `internal_port == 0`, since "all
/// protocols" and "a specific port" are mutually exclusive asks.
fn validate_map_semantics(map: &MapBody, lifetime: u32) -> Option<ResultCode> {
    if lifetime != 0 && map.protocol == 0 && map.internal_port != 0 {
        return Some(ResultCode::MalformedRequest);
    }
    if lifetime != 0 && map.internal_port == 0 {
        return Some(ResultCode::UnsuppProtocol);
    }
    None
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes(bytes[offset..offset + 2].try_into().unwrap())
}

fn read_ipv6(bytes: &[u8], offset: usize) -> Ipv6Addr {
    let octets: [u8; 16] = bytes[offset..offset + 16].try_into().unwrap();
    Ipv6Addr::from(octets)
}

/// Parse a MAP body from a payload slice known to be at least
/// [`MAP_BODY_LEN`] bytes.
fn parse_map_body(payload: &[u8]) -> MapBody {
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&payload[0..12]);
    MapBody {
        nonce,
        protocol: payload[12],
        // payload[13..16] reserved
        internal_port: read_u16(payload, 16),
        external_port: read_u16(payload, 18),
        external_ip: read_ipv6(payload, 20),
    }
}

/// Parse a MAP body from a payload that may be shorter than
/// [`MAP_BODY_LEN`], zero-padding the missing tail. Used to populate the
/// body of an error response when the datagram itself was too short to
/// satisfy the opcode's minimum length; the codec does not suppress these
/// partially-reconstructed fields (spec.md §9).
fn parse_map_body_lenient(payload: &[u8]) -> MapBody {
    let mut buf = [0u8; MAP_BODY_LEN];
    let n = payload.len().min(MAP_BODY_LEN);
    buf[..n].copy_from_slice(&payload[..n]);
    parse_map_body(&buf)
}

fn parse_peer_body(payload: &[u8]) -> PeerBody {
    PeerBody {
        map: parse_map_body(payload),
        remote_peer_port: read_u16(payload, 36),
        // payload[38..40] reserved
        remote_peer_ip: read_ipv6(payload, 40),
    }
}

fn parse_peer_body_lenient(payload: &[u8]) -> PeerBody {
    let mut buf = [0u8; PEER_BODY_LEN];
    let n = payload.len().min(PEER_BODY_LEN);
    buf[..n].copy_from_slice(&payload[..n]);
    parse_peer_body(&buf)
}
