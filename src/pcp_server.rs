//! PCP server logic (component E, spec.md §4.4): MAP/PEER/ANNOUNCE
//! semantics, lifetime clamping, and response construction. Consults the
//! NAT table and allocator (`pcp_sdn_nat`) and drives the forwarder
//! programmer (component C) to keep flow entries in sync with mappings.

use std::net::Ipv4Addr;

use codec::message::{MapBody, PeerBody, RequestBody};
use codec::{Opcode, PcpRequest, PcpResponse, ResponseBody, ResponseHeader, ResultCode};
use nat::{NatError, NatTable, NatTableEntry, Suggestion};
use parking_lot::Mutex;

use crate::config::Config;
use crate::forwarder::ForwarderChannel;
use crate::openflow::IP_PROTO_UDP;
use crate::programmer::Programmer;

pub struct PcpServer<'a, F: ForwarderChannel> {
    config: &'a Config,
    table: &'a NatTable,
    allocator: &'a Mutex<nat::AllocatorState>,
    programmer: &'a Programmer<'a, F>,
    start_time: u64,
}

impl<'a, F: ForwarderChannel> PcpServer<'a, F> {
    pub fn new(
        config: &'a Config,
        table: &'a NatTable,
        allocator: &'a Mutex<nat::AllocatorState>,
        programmer: &'a Programmer<'a, F>,
        start_time: u64,
    ) -> Self {
        PcpServer {
            config,
            table,
            allocator,
            programmer,
            start_time,
        }
    }

    fn epoch_time(&self, now: u64) -> u32 {
        now.saturating_sub(self.start_time) as u32
    }

    /// Build the response for a parsed request. Step 1 of spec.md §4.4
    /// (dropping on `nil`/silent-drop results, which never reach this
    /// function; the caller only calls this for `Some(request)`) and
    /// step 5 (response construction) both live here; steps 2-4 are
    /// delegated to [`Self::handle_map_or_peer`].
    pub fn handle_request(&self, now: u64, client_ip: Ipv4Addr, request: &PcpRequest) -> PcpResponse {
        if !request.is_success() {
            return self.build_error_response(now, request);
        }

        let opcode = request.body.opcode();
        let lifetime = request.common.lifetime;

        let (body, result_code) = match &request.body {
            RequestBody::Announce => (ResponseBody::Announce, ResultCode::Success),
            RequestBody::Map(map) => {
                let (map, result_code) = self.handle_map_or_peer(now, client_ip, lifetime, *map);
                (ResponseBody::Map(map), result_code)
            }
            RequestBody::Peer(peer) => {
                let (map, result_code) = self.handle_map_or_peer(now, client_ip, lifetime, peer.map);
                (
                    ResponseBody::Peer(PeerBody {
                        map,
                        remote_peer_port: peer.remote_peer_port,
                        remote_peer_ip: peer.remote_peer_ip,
                    }),
                    result_code,
                )
            }
        };

        PcpResponse {
            common: ResponseHeader {
                version: codec::SUPPORTED_VERSION,
                opcode,
                result_code,
                lifetime,
                epoch_time: self.epoch_time(now),
                client_ip_tail: [0; 12],
            },
            body,
        }
    }

    /// Steps 2-4 of spec.md §4.4, shared by MAP and PEER (PEER's extra
    /// remote-peer fields are opaque to the NAT table; spec.md §3 gives
    /// PEER no additional table key beyond MAP's `(internal_ip,
    /// internal_port)`). Returns the result code to report alongside the
    /// body: `Success` except when the pool is exhausted, per spec.md §7
    /// ("internal errors... mapped to NO_RESOURCES where a response is
    /// still possible").
    fn handle_map_or_peer(
        &self,
        now: u64,
        client_ip: Ipv4Addr,
        lifetime: u32,
        map: MapBody,
    ) -> (MapBody, ResultCode) {
        let internal_port = map.internal_port;

        if lifetime == 0 {
            let removed = self.table.remove_entry((client_ip, internal_port));
            if let Ok(entry) = removed {
                self.programmer.remove_mapping(&entry);
                log::info!(
                    "removed mapping {}:{} -> {}:{} (client requested)",
                    entry.internal_ip, entry.internal_port, entry.external_ip, entry.external_port
                );
            }
            // Absence is not an error (spec.md §4.4 step 3); echo the
            // client-supplied external fields back verbatim.
            return (
                MapBody {
                    external_port: map.external_port,
                    external_ip: map.external_ip,
                    ..map
                },
                ResultCode::Success,
            );
        }

        let clamped_lifetime = self.clamp_lifetime(Opcode::Map, lifetime);
        let protocol = if map.protocol == 0 { IP_PROTO_UDP } else { map.protocol };

        if let Some(existing) = self.table.find_entry((client_ip, internal_port)) {
            let refreshed = self
                .table
                .update_entry_lifetime((client_ip, internal_port), clamped_lifetime, now)
                .expect("entry just looked up");
            self.programmer.refresh_mapping(&existing, &refreshed);
            log::info!(
                "refreshed mapping {}:{} -> {}:{} lifetime={}",
                refreshed.internal_ip,
                refreshed.internal_port,
                refreshed.external_ip,
                refreshed.external_port,
                refreshed.lifetime
            );
            return (map_body_from_entry(&refreshed, map.nonce), ResultCode::Success);
        }

        let suggested = suggested_external(&map);
        let allocated = {
            let mut allocator = self.allocator.lock();
            allocator.allocate(suggested, |ip, port| self.table.is_external_taken(ip, port))
        };

        let Ok((external_ip, external_port)) = allocated else {
            log::warn!("external pool exhausted for {client_ip}:{internal_port}");
            return (
                MapBody {
                    external_port: 0,
                    external_ip: Ipv4Addr::UNSPECIFIED.to_ipv6_mapped(),
                    ..map
                },
                ResultCode::NoResources,
            );
        };

        let entry = NatTableEntry {
            internal_ip: client_ip,
            internal_port,
            external_ip,
            external_port,
            protocol,
            client_ip,
            nonce: map.nonce,
            lifetime: clamped_lifetime,
            created_at: now,
        };

        match self.table.add_entry(entry) {
            Ok(()) => {
                self.programmer.install_mapping(&entry);
                log::info!(
                    "created mapping {}:{} -> {}:{} lifetime={}",
                    entry.internal_ip, entry.internal_port, entry.external_ip, entry.external_port, entry.lifetime
                );
                (map_body_from_entry(&entry, map.nonce), ResultCode::Success)
            }
            Err(NatError::AlreadyMapped) => {
                // A concurrent refresh raced us between the lookup above
                // and here; treat it as a bug per spec.md §7, not a client
                // error, and fall back to echoing the request untouched.
                log::error!("add_entry raced an existing mapping for {client_ip}:{internal_port}");
                (map, ResultCode::NetworkFailure)
            }
            Err(_) => (map, ResultCode::NetworkFailure),
        }
    }

    fn clamp_lifetime(&self, opcode: Opcode, lifetime: u32) -> u32 {
        let minimum = match opcode {
            Opcode::Map => self.config.default_pcp_map_assigned_lifetime_seconds,
            Opcode::Peer => self.config.default_pcp_peer_assigned_lifetime_seconds,
            Opcode::Announce => 0,
        };
        lifetime.max(minimum)
    }

    /// Synthesize an error response for a request whose `parse_result`
    /// wasn't SUCCESS. The original source only logged these and dropped
    /// them (spec.md §9 notes this as a TODO); this implementation takes
    /// the spec's own recommendation to align with RFC 6887 and responds.
    fn build_error_response(&self, now: u64, request: &PcpRequest) -> PcpResponse {
        let opcode = request.common.opcode().unwrap_or(Opcode::Announce);
        let mut client_ip_tail = [0u8; 12];
        client_ip_tail.copy_from_slice(&request.common.client_ip.octets()[0..12]);

        let body = match &request.body {
            RequestBody::Announce => ResponseBody::Announce,
            RequestBody::Map(map) => ResponseBody::Map(*map),
            RequestBody::Peer(peer) => ResponseBody::Peer(*peer),
        };

        if request.parse_result.is_client_error() {
            log::warn!("rejecting malformed PCP request: {:?}", request.parse_result);
        } else {
            log::debug!("rejecting PCP request: {:?}", request.parse_result);
        }

        PcpResponse {
            common: ResponseHeader {
                version: codec::SUPPORTED_VERSION,
                opcode,
                result_code: request.parse_result,
                lifetime: request.common.lifetime,
                epoch_time: self.epoch_time(now),
                client_ip_tail,
            },
            body,
        }
    }
}

/// A client can suggest a full (address, port), an address alone (port 0,
/// meaning "any port on this address"), or nothing (an unspecified
/// `external_ip`). Only IPv4-mapped addresses are honored; the allocator
/// pool is IPv4-only.
fn suggested_external(map: &MapBody) -> Option<Suggestion> {
    let ip = map.external_ip.to_ipv4_mapped()?;
    if ip.is_unspecified() {
        return None;
    }
    if map.external_port == 0 {
        Some(Suggestion::IpOnly(ip))
    } else {
        Some(Suggestion::Full(ip, map.external_port))
    }
}

fn map_body_from_entry(entry: &NatTableEntry, nonce: [u8; 12]) -> MapBody {
    MapBody {
        nonce,
        protocol: entry.protocol,
        internal_port: entry.internal_port,
        external_port: entry.external_port,
        external_ip: entry.external_ip.to_ipv6_mapped(),
    }
}
