//! Proxy-ARP handling (component D, spec.md §4.3's ARP paragraph).
//!
//! Learns the internal-side peer's MAC by answering its ARP request itself
//! (so the peer never learns the forwarder's real topology), then probes
//! for the external-side peer's MAC on its own, and once both are known
//! installs the MAC-rewrite flow entries that let the two sides talk
//! through the forwarder transparently.

use std::net::Ipv4Addr;

use crate::forwarder::{ArpTable, ArpTableEntry, ForwarderChannel, Port};
use crate::openflow::{ARP_OP_REPLY, ARP_OP_REQUEST};
use crate::programmer::Programmer;

/// A parsed ARP frame payload (Ethernet header already stripped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpFrame {
    pub operation: u16,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

/// Parse an ARP-over-Ethernet frame built by [`build_arp_frame`]'s inverse
/// layout. Returns `None` if the bytes are too short or not ARP-shaped; the
/// forwarder only ever puts genuine ARP frames in the controller's path
/// (spec.md §2), so a `None` here means a malformed or truncated packet-in.
pub fn parse_arp_frame(bytes: &[u8]) -> Option<ArpFrame> {
    const ETHERNET_HEADER_LEN: usize = 14;
    const ARP_PAYLOAD_LEN: usize = 28;
    if bytes.len() < ETHERNET_HEADER_LEN + ARP_PAYLOAD_LEN {
        return None;
    }
    let eth_type = u16::from_be_bytes([bytes[12], bytes[13]]);
    if eth_type != crate::openflow::ETH_TYPE_ARP {
        return None;
    }

    let arp = &bytes[ETHERNET_HEADER_LEN..];
    let operation = u16::from_be_bytes([arp[6], arp[7]]);
    let sender_mac: [u8; 6] = arp[8..14].try_into().unwrap();
    let sender_ip = Ipv4Addr::new(arp[14], arp[15], arp[16], arp[17]);
    let target_mac: [u8; 6] = arp[18..24].try_into().unwrap();
    let target_ip = Ipv4Addr::new(arp[24], arp[25], arp[26], arp[27]);

    Some(ArpFrame {
        operation,
        sender_mac,
        sender_ip,
        target_mac,
        target_ip,
    })
}

/// Proxy-ARP logic, operating on a caller-owned [`ArpTable`] rather than
/// holding one itself. Like [`Programmer`], this is cheap to construct fresh
/// per event; the state that must persist across calls (which peers have
/// been learned) lives in the table the caller threads through, the same
/// way the NAT table lives outside [`crate::pcp_server::PcpServer`].
pub struct ArpHandler<'a, F: ForwarderChannel> {
    programmer: &'a Programmer<'a, F>,
    channel: &'a F,
    datapath_mac: [u8; 6],
}

impl<'a, F: ForwarderChannel> ArpHandler<'a, F> {
    pub fn new(programmer: &'a Programmer<'a, F>, channel: &'a F, datapath_mac: [u8; 6]) -> Self {
        ArpHandler {
            programmer,
            channel,
            datapath_mac,
        }
    }

    /// Handle an ARP request arriving at `in_port` for `frame.target_ip`,
    /// acting as proxy ARP: answer the requester directly, then probe for
    /// the real owner of `target_ip` ourselves.
    pub fn on_request(&self, table: &mut ArpTable, in_port: u32, out_port: u32, frame: &ArpFrame) {
        table.insert(
            frame.target_ip,
            ArpTableEntry {
                src_ip: frame.sender_ip,
                dst_ip: frame.target_ip,
                src_mac: frame.sender_mac,
                dst_mac: None,
                datapath_mac: self.datapath_mac,
            },
        );

        self.channel.send_packet(
            build_arp_frame(ArpFrame {
                operation: ARP_OP_REPLY,
                sender_mac: self.datapath_mac,
                sender_ip: frame.target_ip,
                target_mac: frame.sender_mac,
                target_ip: frame.sender_ip,
            }),
            Port::Physical(in_port),
        );

        self.channel.send_packet(
            build_arp_frame(ArpFrame {
                operation: ARP_OP_REQUEST,
                sender_mac: self.datapath_mac,
                sender_ip: frame.sender_ip,
                target_mac: [0; 6],
                target_ip: frame.target_ip,
            }),
            Port::Physical(out_port),
        );
    }

    /// Handle the ARP reply our own probe (from `on_request`) solicited.
    /// Fills in the learned peer MAC and, once both sides of a pair are
    /// known, installs the MAC-rewrite entries.
    pub fn on_reply(&self, table: &mut ArpTable, frame: &ArpFrame) {
        let Some(entry) = table.get_mut(&frame.sender_ip) else {
            return;
        };
        entry.dst_mac = Some(frame.sender_mac);

        let access_peer_mac = entry.src_mac;
        let external_peer_mac = frame.sender_mac;
        self.programmer
            .install_mac_rewrite(self.datapath_mac, access_peer_mac, external_peer_mac);
    }
}

/// Build a minimal ARP-over-Ethernet frame. Only the fields spec.md's ARP
/// paragraph actually inspects are populated; hardware/protocol type and
/// length fields use the standard Ethernet/IPv4 ARP constants.
fn build_arp_frame(frame: ArpFrame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(14 + 28);
    bytes.extend_from_slice(&frame.target_mac);
    bytes.extend_from_slice(&frame.sender_mac);
    bytes.extend_from_slice(&crate::openflow::ETH_TYPE_ARP.to_be_bytes());
    bytes.extend_from_slice(&1u16.to_be_bytes()); // hardware type: Ethernet
    bytes.extend_from_slice(&crate::openflow::ETH_TYPE_IPV4.to_be_bytes()); // protocol type
    bytes.push(6); // hardware address length
    bytes.push(4); // protocol address length
    bytes.extend_from_slice(&frame.operation.to_be_bytes());
    bytes.extend_from_slice(&frame.sender_mac);
    bytes.extend_from_slice(&frame.sender_ip.octets());
    bytes.extend_from_slice(&frame.target_mac);
    bytes.extend_from_slice(&frame.target_ip.octets());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::forwarder::{FlowTable, MockForwarder};

    fn frame(op: u16, sender_ip: Ipv4Addr, target_ip: Ipv4Addr, sender_mac: [u8; 6]) -> ArpFrame {
        ArpFrame {
            operation: op,
            sender_mac,
            sender_ip,
            target_mac: [0; 6],
            target_ip,
        }
    }

    #[test]
    fn request_records_entry_and_emits_reply_and_probe() {
        let forwarder = MockForwarder::new();
        let cfg = Config::default();
        let programmer = Programmer::new(&forwarder, &cfg);
        let handler = ArpHandler::new(&programmer, &forwarder, [1; 6]);
        let mut table = ArpTable::new();

        let req = frame(
            ARP_OP_REQUEST,
            Ipv4Addr::new(172, 16, 0, 5),
            Ipv4Addr::new(200, 0, 0, 2),
            [2; 6],
        );
        handler.on_request(&mut table, cfg.access_port, cfg.external_port, &req);

        assert!(table.get(&Ipv4Addr::new(200, 0, 0, 2)).is_some());
        assert_eq!(forwarder.sent_packets().len(), 2);
    }

    #[test]
    fn reply_installs_mac_rewrite_entries() {
        let forwarder = MockForwarder::new();
        let cfg = Config::default();
        let programmer = Programmer::new(&forwarder, &cfg);
        let handler = ArpHandler::new(&programmer, &forwarder, [1; 6]);
        let mut table = ArpTable::new();

        let req = frame(
            ARP_OP_REQUEST,
            Ipv4Addr::new(172, 16, 0, 5),
            Ipv4Addr::new(200, 0, 0, 2),
            [2; 6],
        );
        handler.on_request(&mut table, cfg.access_port, cfg.external_port, &req);

        let reply = frame(
            ARP_OP_REPLY,
            Ipv4Addr::new(200, 0, 0, 2),
            Ipv4Addr::new(172, 16, 0, 5),
            [3; 6],
        );
        handler.on_reply(&mut table, &reply);

        assert_eq!(
            table.get(&Ipv4Addr::new(200, 0, 0, 2)).unwrap().dst_mac,
            Some([3; 6])
        );
        assert_eq!(
            forwarder
                .added_entries()
                .iter()
                .filter(|e| e.table == FlowTable::PcpMessageForwarding
                    && e.r#match.eth_dst == Some([1; 6]))
                .count(),
            2
        );
    }

    #[test]
    fn parses_request_built_by_build_arp_frame() {
        let built = build_arp_frame(ArpFrame {
            operation: ARP_OP_REQUEST,
            sender_mac: [2; 6],
            sender_ip: Ipv4Addr::new(172, 16, 0, 5),
            target_mac: [0; 6],
            target_ip: Ipv4Addr::new(200, 0, 0, 2),
        });
        let parsed = parse_arp_frame(&built).unwrap();
        assert_eq!(parsed.operation, ARP_OP_REQUEST);
        assert_eq!(parsed.sender_ip, Ipv4Addr::new(172, 16, 0, 5));
        assert_eq!(parsed.target_ip, Ipv4Addr::new(200, 0, 0, 2));
    }

    #[test]
    fn rejects_non_arp_ethertype() {
        let mut bytes = vec![0u8; 14 + 28];
        bytes[12..14].copy_from_slice(&crate::openflow::ETH_TYPE_IPV4.to_be_bytes());
        assert!(parse_arp_frame(&bytes).is_none());
    }
}
