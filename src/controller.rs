//! Controller event loop (component F, spec.md §4.5): owns one attached
//! forwarder's state and dispatches its events (features, packet-in,
//! flow-removed) to the components that act on them.
//!
//! Per spec.md §5, this is a single-threaded cooperative loop: every method
//! here takes `&self` rather than `&mut self` because the handful of bits of
//! mutable state (the NAT table, the allocator cursor, the learned ARP
//! table) are each wrapped in their own lock, the way turn-rs's `Service`
//! exposes a shared, lock-internal API to its (necessarily concurrent, since
//! it serves many sessions) callers. Here there is only ever one caller at a
//! time, the event source feeding [`Controller::handle_event`], but keeping
//! the locks makes `Controller<F>` trivially `Send + Sync` without forcing
//! every call site to hold a `&mut`.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::net::Ipv4Addr;

use nat::{AllocatorState, NatTable};

use crate::arp::{self, ArpHandler};
use crate::config::Config;
use crate::forwarder::{
    ArpTable, FlowMatch, FlowRemovedReason, FlowTable, ForwarderChannel, ForwarderEvent, Port,
};
use crate::openflow::{ETH_TYPE_ARP, ETH_TYPE_IPV4, IP_PROTO_TCP};
use crate::packet;
use crate::pcp_server::PcpServer;
use crate::programmer::Programmer;

/// Owns everything scoped to one attached forwarder. Per spec.md §1/§6, the
/// controller assumes exactly one; a multi-forwarder deployment would hold
/// one `Controller` per datapath, each fed its own event stream, rather than
/// sharing NAT state across them (spec.md §9's "forwarder-event coupling"
/// note).
pub struct Controller<F: ForwarderChannel> {
    config: Config,
    channel: F,
    table: NatTable,
    allocator: Mutex<AllocatorState>,
    arp_table: Mutex<ArpTable>,
    datapath_mac: Mutex<Option<[u8; 6]>>,
    start_time: u64,
}

impl<F: ForwarderChannel> Controller<F> {
    /// `start_time` is "now" (seconds, any monotonic-enough epoch) at
    /// construction time, used to compute PCP `epoch_time` per spec.md §3.
    pub fn new(config: Config, channel: F, start_time: u64) -> Self {
        let pool = &config.default_nat_pool_config;
        let allocator = AllocatorState::new(pool.external_ips(), pool.external_ports());
        Controller {
            config,
            channel,
            table: NatTable::new(),
            allocator: Mutex::new(allocator),
            arp_table: Mutex::new(ArpTable::new()),
            datapath_mac: Mutex::new(None),
            start_time,
        }
    }

    pub fn table(&self) -> &NatTable {
        &self.table
    }

    pub fn channel(&self) -> &F {
        &self.channel
    }

    fn programmer(&self) -> Programmer<'_, F> {
        Programmer::new(&self.channel, &self.config)
    }

    fn other_port(&self, in_port: u32) -> u32 {
        if in_port == self.config.access_port {
            self.config.external_port
        } else {
            self.config.access_port
        }
    }

    /// Dispatch a single forwarder event. `now` is the caller's current
    /// time (seconds); the core has no clock of its own (spec.md §5).
    pub fn handle_event(&self, now: u64, event: ForwarderEvent) {
        match event {
            ForwarderEvent::Features { datapath_mac } => self.on_features(datapath_mac),
            ForwarderEvent::PacketIn { in_port, raw_bytes } => {
                self.on_packet_in(now, in_port, &raw_bytes)
            }
            ForwarderEvent::FlowRemoved {
                table,
                r#match,
                reason,
            } => self.on_flow_removed(table, r#match, reason),
        }
    }

    /// Forwarder-connect: run the static pipeline install (spec.md §4.3
    /// steps 1-5) and record the datapath MAC for proxy-ARP replies.
    fn on_features(&self, datapath_mac: [u8; 6]) {
        *self.datapath_mac.lock() = Some(datapath_mac);
        self.arp_table.lock().clear();
        self.programmer().on_forwarder_connect();
        log::info!("forwarder connected, datapath_mac={datapath_mac:02x?}");
    }

    fn on_packet_in(&self, now: u64, in_port: u32, raw_bytes: &[u8]) {
        match peek_eth_type(raw_bytes) {
            Some(ETH_TYPE_ARP) => self.on_arp_packet(in_port, raw_bytes),
            Some(ETH_TYPE_IPV4) => self.on_ipv4_packet(now, raw_bytes),
            // Anything else is handled entirely in the data plane and never
            // reaches the controller (spec.md §4.5); nothing to do here.
            _ => {}
        }
    }

    fn on_arp_packet(&self, in_port: u32, raw_bytes: &[u8]) {
        let Some(frame) = arp::parse_arp_frame(raw_bytes) else {
            log::debug!("dropping unparseable ARP packet-in on port {in_port}");
            return;
        };
        let Some(datapath_mac) = *self.datapath_mac.lock() else {
            log::warn!("ARP packet-in before forwarder features handshake; dropping");
            return;
        };

        let programmer = self.programmer();
        let handler = ArpHandler::new(&programmer, &self.channel, datapath_mac);
        let mut arp_table = self.arp_table.lock();

        match frame.operation {
            crate::openflow::ARP_OP_REQUEST => {
                handler.on_request(&mut arp_table, in_port, self.other_port(in_port), &frame)
            }
            crate::openflow::ARP_OP_REPLY => handler.on_reply(&mut arp_table, &frame),
            other => log::debug!("ignoring ARP frame with unknown operation {other}"),
        }
    }

    fn on_ipv4_packet(&self, now: u64, raw_bytes: &[u8]) {
        let Some(frame) = packet::parse_udp_frame(raw_bytes) else {
            log::debug!("dropping packet-in that isn't a UDP/IPv4 frame");
            return;
        };
        if frame.udp_dst != self.config.pcp_server_listening_port {
            log::debug!(
                "dropping UDP packet-in not addressed to the PCP port ({})",
                frame.udp_dst
            );
            return;
        }

        let Some(request) = codec::parse(frame.payload, frame.ip_src) else {
            log::debug!("dropping unparseable PCP datagram from {}", frame.ip_src);
            return;
        };

        let programmer = self.programmer();
        let server = PcpServer::new(
            &self.config,
            &self.table,
            &self.allocator,
            &programmer,
            self.start_time,
        );
        let response = server.handle_request(now, frame.ip_src, &request);
        log::debug!(
            "PCP {:?} from {} -> {:?}",
            response.common.opcode,
            frame.ip_src,
            response.common.result_code
        );

        let mut buf = BytesMut::new();
        codec::encode(&response, &mut buf);
        let reply = packet::build_reply(&frame, &buf);
        self.channel
            .send_packet(reply, Port::Physical(self.config.access_port));
    }

    /// Flow-removed: reconcile an idle-timeout expiry of the authoritative
    /// `nat_internal_to_external` direction back into the NAT table
    /// (spec.md §4.5). The `external_to_internal` direction's expiry is
    /// ignored: both entries share the same idle timeout, so acting on one
    /// is enough, and acting on both would race a double removal.
    fn on_flow_removed(&self, table: FlowTable, r#match: FlowMatch, reason: FlowRemovedReason) {
        if reason != FlowRemovedReason::IdleTimeout || table != FlowTable::NatInternalToExternal {
            return;
        }

        let Some(key) = internal_key_from_match(&r#match) else {
            log::warn!("flow-removed for nat_internal_to_external missing match fields");
            return;
        };

        match self.table.remove_entry(key) {
            Ok(entry) => {
                log::info!(
                    "mapping {}:{} expired (forwarder idle timeout)",
                    entry.internal_ip,
                    entry.internal_port
                );
            }
            Err(_) => log::warn!(
                "flow-removed for unknown internal mapping {}:{}",
                key.0,
                key.1
            ),
        }
    }
}

fn peek_eth_type(bytes: &[u8]) -> Option<u16> {
    if bytes.len() < 14 {
        return None;
    }
    Some(u16::from_be_bytes([bytes[12], bytes[13]]))
}

fn internal_key_from_match(m: &FlowMatch) -> Option<(Ipv4Addr, u16)> {
    let ip = m.ipv4_src?;
    let port = match m.ip_proto {
        Some(IP_PROTO_TCP) => m.tcp_src?,
        _ => m.udp_src?,
    };
    Some((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::MockForwarder;
    use crate::openflow::{ARP_OP_REPLY, ARP_OP_REQUEST};
    use codec::Opcode;

    fn pcp_request_bytes(internal_port: u16, lifetime: u32, client_ip: Ipv4Addr) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut header = vec![0u8; codec::COMMON_HEADER_LEN];
        header[0] = codec::SUPPORTED_VERSION;
        header[1] = u8::from(Opcode::Map);
        header[4..8].copy_from_slice(&lifetime.to_be_bytes());
        header[8..24].copy_from_slice(&client_ip.to_ipv6_mapped().octets());
        buf.extend_from_slice(&header);

        let mut map_body = vec![0u8; codec::MAP_BODY_LEN];
        map_body[12] = crate::openflow::IP_PROTO_UDP;
        map_body[16..18].copy_from_slice(&internal_port.to_be_bytes());
        buf.extend_from_slice(&map_body);
        buf.to_vec()
    }

    fn udp_frame_bytes(client_ip: Ipv4Addr, server_ip: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&[0xaa; 6]);
        bytes.extend_from_slice(&[0xbb; 6]);
        bytes.extend_from_slice(&ETH_TYPE_IPV4.to_be_bytes());

        let total_len = packet::IPV4_HEADER_LEN + packet::UDP_HEADER_LEN + payload.len();
        let mut ip = [0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[9] = crate::openflow::IP_PROTO_UDP;
        ip[12..16].copy_from_slice(&client_ip.octets());
        ip[16..20].copy_from_slice(&server_ip.octets());
        bytes.extend_from_slice(&ip);

        bytes.extend_from_slice(&40000u16.to_be_bytes());
        bytes.extend_from_slice(&5351u16.to_be_bytes());
        bytes.extend_from_slice(&((packet::UDP_HEADER_LEN + payload.len()) as u16).to_be_bytes());
        bytes.extend_from_slice(&0u16.to_be_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    #[test]
    fn features_event_installs_static_pipeline() {
        let forwarder = MockForwarder::new();
        let config = Config::default();
        let controller = Controller::new(config, forwarder, 0);
        controller.handle_event(0, ForwarderEvent::Features { datapath_mac: [9; 6] });
        // Re-running connect twice is idempotent (spec.md §4.3): a second
        // features event clears and reinstalls rather than accumulating.
        controller.handle_event(0, ForwarderEvent::Features { datapath_mac: [9; 6] });
    }

    #[test]
    fn fresh_map_packet_in_creates_mapping_and_replies() {
        let forwarder = MockForwarder::new();
        let config = Config::default();
        let controller = Controller::new(config.clone(), forwarder, 0);
        controller.handle_event(0, ForwarderEvent::Features { datapath_mac: [9; 6] });

        let client_ip = Ipv4Addr::new(172, 16, 0, 5);
        let payload = pcp_request_bytes(1250, 120, client_ip);
        let frame_bytes = udp_frame_bytes(client_ip, Ipv4Addr::new(200, 0, 0, 1), &payload);

        controller.handle_event(
            0,
            ForwarderEvent::PacketIn {
                in_port: config.access_port,
                raw_bytes: frame_bytes,
            },
        );

        let entry = controller
            .table()
            .find_entry((client_ip, 1250))
            .expect("mapping created");
        assert_eq!(entry.external_ip, Ipv4Addr::new(200, 0, 0, 2));
        assert_eq!(entry.external_port, 49152);
        assert_eq!(entry.lifetime, 120);
    }

    #[test]
    fn removal_map_packet_in_clears_mapping() {
        let forwarder = MockForwarder::new();
        let config = Config::default();
        let controller = Controller::new(config.clone(), forwarder, 0);
        controller.handle_event(0, ForwarderEvent::Features { datapath_mac: [9; 6] });

        let client_ip = Ipv4Addr::new(172, 16, 0, 5);
        let create = udp_frame_bytes(
            client_ip,
            Ipv4Addr::new(200, 0, 0, 1),
            &pcp_request_bytes(1250, 120, client_ip),
        );
        controller.handle_event(
            0,
            ForwarderEvent::PacketIn {
                in_port: config.access_port,
                raw_bytes: create,
            },
        );
        assert!(controller.table().find_entry((client_ip, 1250)).is_some());

        let remove = udp_frame_bytes(
            client_ip,
            Ipv4Addr::new(200, 0, 0, 1),
            &pcp_request_bytes(1250, 0, client_ip),
        );
        controller.handle_event(
            1,
            ForwarderEvent::PacketIn {
                in_port: config.access_port,
                raw_bytes: remove,
            },
        );
        assert!(controller.table().find_entry((client_ip, 1250)).is_none());
    }

    #[test]
    fn idle_timeout_flow_removed_clears_mapping() {
        let forwarder = MockForwarder::new();
        let config = Config::default();
        let controller = Controller::new(config.clone(), forwarder, 0);
        controller.handle_event(0, ForwarderEvent::Features { datapath_mac: [9; 6] });

        let client_ip = Ipv4Addr::new(172, 16, 0, 5);
        let create = udp_frame_bytes(
            client_ip,
            Ipv4Addr::new(200, 0, 0, 1),
            &pcp_request_bytes(1250, 120, client_ip),
        );
        controller.handle_event(
            0,
            ForwarderEvent::PacketIn {
                in_port: config.access_port,
                raw_bytes: create,
            },
        );

        let r#match = FlowMatch {
            eth_type: Some(ETH_TYPE_IPV4),
            ip_proto: Some(crate::openflow::IP_PROTO_UDP),
            ipv4_src: Some(client_ip),
            udp_src: Some(1250),
            ..Default::default()
        };
        let removed_before = controller.channel().removed_entries().len();
        controller.handle_event(
            60,
            ForwarderEvent::FlowRemoved {
                table: FlowTable::NatInternalToExternal,
                r#match,
                reason: FlowRemovedReason::IdleTimeout,
            },
        );

        assert!(controller.table().find_entry((client_ip, 1250)).is_none());
        assert_eq!(
            controller.channel().removed_entries().len(),
            removed_before
        );
    }

    #[test]
    fn arp_request_then_reply_learns_peer_and_installs_rewrite() {
        let forwarder = MockForwarder::new();
        let config = Config::default();
        let controller = Controller::new(config.clone(), forwarder, 0);
        controller.handle_event(0, ForwarderEvent::Features { datapath_mac: [9; 6] });

        let request_frame = arp_bytes(
            ARP_OP_REQUEST,
            [2; 6],
            Ipv4Addr::new(172, 16, 0, 5),
            [0; 6],
            Ipv4Addr::new(200, 0, 0, 2),
        );
        controller.handle_event(
            0,
            ForwarderEvent::PacketIn {
                in_port: config.access_port,
                raw_bytes: request_frame,
            },
        );

        let reply_frame = arp_bytes(
            ARP_OP_REPLY,
            [3; 6],
            Ipv4Addr::new(200, 0, 0, 2),
            [2; 6],
            Ipv4Addr::new(172, 16, 0, 5),
        );
        controller.handle_event(
            1,
            ForwarderEvent::PacketIn {
                in_port: config.external_port,
                raw_bytes: reply_frame,
            },
        );
    }

    fn arp_bytes(
        op: u16,
        sender_mac: [u8; 6],
        sender_ip: Ipv4Addr,
        target_mac: [u8; 6],
        target_ip: Ipv4Addr,
    ) -> Vec<u8> {
        let mut bytes = vec![0u8; 14];
        bytes[0..6].copy_from_slice(&target_mac);
        bytes[6..12].copy_from_slice(&sender_mac);
        bytes[12..14].copy_from_slice(&ETH_TYPE_ARP.to_be_bytes());
        bytes.extend_from_slice(&1u16.to_be_bytes());
        bytes.extend_from_slice(&ETH_TYPE_IPV4.to_be_bytes());
        bytes.push(6);
        bytes.push(4);
        bytes.extend_from_slice(&op.to_be_bytes());
        bytes.extend_from_slice(&sender_mac);
        bytes.extend_from_slice(&sender_ip.octets());
        bytes.extend_from_slice(&target_mac);
        bytes.extend_from_slice(&target_ip.octets());
        bytes
    }
}
