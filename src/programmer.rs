//! Forwarder-programming protocol state machine (component C, spec.md
//! §4.3): projects NAT mappings and static punting rules onto the flow
//! pipeline, and reconciles idle-timeout flow-removed events back into the
//! NAT table.

use std::net::Ipv4Addr;

use nat::NatTableEntry;

use crate::config::Config;
use crate::forwarder::{
    FlowEntry, FlowMatch, FlowTable, FlowTablePipeline, ForwarderChannel, Instructions, Port,
    SetField,
};
use crate::openflow::{ETH_TYPE_ARP, ETH_TYPE_IPV4, IP_PROTO_TCP, IP_PROTO_UDP, OFPP_CONTROLLER};

pub struct Programmer<'a, F: ForwarderChannel> {
    channel: &'a F,
    pipeline: FlowTablePipeline,
    config: &'a Config,
}

impl<'a, F: ForwarderChannel> Programmer<'a, F> {
    pub fn new(channel: &'a F, config: &'a Config) -> Self {
        Programmer {
            channel,
            pipeline: FlowTablePipeline::default(),
            config,
        }
    }

    /// Idempotently (re-)establish the static pipeline, run once per
    /// forwarder-connect event (spec.md §4.5 "Forwarder features").
    pub fn on_forwarder_connect(&self) {
        self.channel.clear_all();
        self.install_arp_punting();
        self.install_pcp_punting();
        self.install_port_classifier();
        self.install_default_forwarding();
    }

    fn access_port(&self) -> u32 {
        self.config.access_port
    }

    fn external_port(&self) -> u32 {
        self.config.external_port
    }

    /// Step 2: per-port ARP-punting entries in table 0.
    fn install_arp_punting(&self) {
        for in_port in [self.access_port(), self.external_port()] {
            self.channel.add_flow_entry(FlowEntry {
                table: FlowTable::PcpMessageForwarding,
                r#match: FlowMatch {
                    eth_type: Some(ETH_TYPE_ARP),
                    in_port: Some(in_port),
                    ..Default::default()
                },
                instructions: Instructions {
                    output: Some(Port::Controller),
                    ..Default::default()
                },
                priority: self.config.default_arp_forwarding_priority,
                idle_timeout: 0,
                send_flow_removed: false,
            });
        }
    }

    /// Step 3: PCP request/response punting in `pcp_message_forwarding`.
    fn install_pcp_punting(&self) {
        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::PcpMessageForwarding,
            r#match: FlowMatch {
                in_port: Some(self.access_port()),
                eth_type: Some(ETH_TYPE_IPV4),
                ip_proto: Some(IP_PROTO_UDP),
                udp_dst: Some(self.config.pcp_server_listening_port),
                ..Default::default()
            },
            instructions: Instructions {
                output: Some(Port::Controller),
                ..Default::default()
            },
            priority: self.config.default_pcp_forwarding_priority,
            idle_timeout: 0,
            send_flow_removed: false,
        });

        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::PcpMessageForwarding,
            r#match: FlowMatch {
                in_port: Some(OFPP_CONTROLLER),
                eth_type: Some(ETH_TYPE_IPV4),
                ip_proto: Some(IP_PROTO_UDP),
                udp_src: Some(self.config.pcp_server_listening_port),
                ..Default::default()
            },
            instructions: Instructions {
                output: Some(Port::Physical(self.access_port())),
                ..Default::default()
            },
            priority: self.config.default_pcp_forwarding_priority,
            idle_timeout: 0,
            send_flow_removed: false,
        });
    }

    /// Step 4: port classifier in `nat_port_match`.
    fn install_port_classifier(&self) {
        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::NatPortMatch,
            r#match: FlowMatch {
                in_port: Some(self.external_port()),
                ..Default::default()
            },
            instructions: Instructions {
                goto_table: Some(FlowTable::NatExternalToInternal),
                ..Default::default()
            },
            priority: self.config.default_nat_flow_entry_priority,
            idle_timeout: 0,
            send_flow_removed: false,
        });
        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::NatPortMatch,
            r#match: FlowMatch::default(),
            instructions: Instructions {
                goto_table: Some(FlowTable::NatInternalToExternal),
                ..Default::default()
            },
            priority: 0,
            idle_timeout: 0,
            send_flow_removed: false,
        });
    }

    /// Step 5: default forwarding between access and external once NAT
    /// translation (if any) has already run.
    fn install_default_forwarding(&self) {
        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::PacketForwarding,
            r#match: FlowMatch {
                in_port: Some(self.access_port()),
                ..Default::default()
            },
            instructions: Instructions {
                output: Some(Port::Physical(self.external_port())),
                ..Default::default()
            },
            priority: self.config.default_nat_flow_entry_priority,
            idle_timeout: 0,
            send_flow_removed: false,
        });
        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::PacketForwarding,
            r#match: FlowMatch {
                in_port: Some(self.external_port()),
                ..Default::default()
            },
            instructions: Instructions {
                output: Some(Port::Physical(self.access_port())),
                ..Default::default()
            },
            priority: self.config.default_nat_flow_entry_priority,
            idle_timeout: 0,
            send_flow_removed: false,
        });
    }

    /// Install the pair of per-mapping NAT flow entries (spec.md §4.3).
    pub fn install_mapping(&self, entry: &NatTableEntry) {
        let eth_type = ETH_TYPE_IPV4;
        let (src_field, dst_field): (fn(u16) -> SetField, fn(u16) -> SetField) =
            match entry.protocol {
                IP_PROTO_TCP => (SetField::TcpSrc, SetField::TcpDst),
                _ => (SetField::UdpSrc, SetField::UdpDst),
            };

        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::NatInternalToExternal,
            r#match: internal_to_external_match(entry, eth_type),
            instructions: Instructions {
                set_fields: vec![SetField::Ipv4Src(entry.external_ip), src_field(entry.external_port)],
                goto_table: self.pipeline.next_table(FlowTable::NatInternalToExternal),
                output: None,
            },
            priority: self.config.default_nat_flow_entry_priority,
            idle_timeout: entry.lifetime,
            send_flow_removed: true,
        });

        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::NatExternalToInternal,
            r#match: external_to_internal_match(entry, eth_type),
            instructions: Instructions {
                set_fields: vec![SetField::Ipv4Dst(entry.internal_ip), dst_field(entry.internal_port)],
                goto_table: self.pipeline.next_table(FlowTable::NatExternalToInternal),
                output: None,
            },
            priority: self.config.default_nat_flow_entry_priority,
            idle_timeout: entry.lifetime,
            send_flow_removed: true,
        });
    }

    /// Remove the pair of per-mapping NAT flow entries.
    pub fn remove_mapping(&self, entry: &NatTableEntry) {
        self.channel.remove_flow_entry(
            FlowTable::NatInternalToExternal,
            internal_to_external_match(entry, ETH_TYPE_IPV4),
            self.config.default_nat_flow_entry_priority,
        );
        self.channel.remove_flow_entry(
            FlowTable::NatExternalToInternal,
            external_to_internal_match(entry, ETH_TYPE_IPV4),
            self.config.default_nat_flow_entry_priority,
        );
    }

    /// Refresh a mapping's idle timeout. The OpenFlow MODIFY command does
    /// not update `idle_timeout`, so this deletes both directions first
    /// and re-adds them with the new lifetime, per spec.md §4.3's
    /// delete-then-add contract. `old` carries the previous lifetime (used
    /// to build the match for the delete; the match fields themselves
    /// don't depend on lifetime, but passing the pre-update entry keeps
    /// the call site from needing to reconstruct it) and `new` the
    /// already-updated entry to (re)install.
    pub fn refresh_mapping(&self, old: &NatTableEntry, new: &NatTableEntry) {
        self.remove_mapping(old);
        self.install_mapping(new);
    }

    /// Install the pair of MAC-rewriting entries for a resolved ARP peer
    /// (spec.md §4.3's ARP handling, step after the reply arrives):
    /// packets arriving addressed to the forwarder's own MAC (because
    /// proxy ARP told the sender that's where `dst_ip` lives) get rewritten
    /// to the real peer MAC and sent on into `nat_port_match`, one entry
    /// per direction.
    pub fn install_mac_rewrite(&self, forwarder_mac: [u8; 6], access_peer_mac: [u8; 6], external_peer_mac: [u8; 6]) {
        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::PcpMessageForwarding,
            r#match: FlowMatch {
                in_port: Some(self.access_port()),
                eth_dst: Some(forwarder_mac),
                ..Default::default()
            },
            instructions: Instructions {
                set_fields: vec![SetField::EthDst(external_peer_mac)],
                goto_table: Some(FlowTable::NatPortMatch),
                output: None,
            },
            priority: self.config.default_mac_modifying_flow_entries_priority,
            idle_timeout: 0,
            send_flow_removed: false,
        });
        self.channel.add_flow_entry(FlowEntry {
            table: FlowTable::PcpMessageForwarding,
            r#match: FlowMatch {
                in_port: Some(self.external_port()),
                eth_dst: Some(forwarder_mac),
                ..Default::default()
            },
            instructions: Instructions {
                set_fields: vec![SetField::EthDst(access_peer_mac)],
                goto_table: Some(FlowTable::NatPortMatch),
                output: None,
            },
            priority: self.config.default_mac_modifying_flow_entries_priority,
            idle_timeout: 0,
            send_flow_removed: false,
        });
    }
}

fn internal_to_external_match(entry: &NatTableEntry, eth_type: u16) -> FlowMatch {
    let mut m = FlowMatch {
        eth_type: Some(eth_type),
        ip_proto: Some(entry.protocol),
        ipv4_src: Some(entry.internal_ip),
        ..Default::default()
    };
    set_port_field(&mut m, entry.protocol, entry.internal_port, true);
    m
}

fn external_to_internal_match(entry: &NatTableEntry, eth_type: u16) -> FlowMatch {
    let mut m = FlowMatch {
        eth_type: Some(eth_type),
        ip_proto: Some(entry.protocol),
        ipv4_dst: Some(entry.external_ip),
        ..Default::default()
    };
    set_port_field(&mut m, entry.protocol, entry.external_port, false);
    m
}

fn set_port_field(m: &mut FlowMatch, protocol: u8, port: u16, is_src: bool) {
    match (protocol, is_src) {
        (IP_PROTO_TCP, true) => m.tcp_src = Some(port),
        (IP_PROTO_TCP, false) => m.tcp_dst = Some(port),
        (_, true) => m.udp_src = Some(port),
        (_, false) => m.udp_dst = Some(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::MockForwarder;

    fn config() -> Config {
        Config::default()
    }

    fn sample_entry() -> NatTableEntry {
        NatTableEntry {
            internal_ip: Ipv4Addr::new(172, 16, 0, 5),
            internal_port: 1250,
            external_ip: Ipv4Addr::new(200, 0, 0, 2),
            external_port: 49152,
            protocol: IP_PROTO_UDP,
            client_ip: Ipv4Addr::new(172, 16, 0, 5),
            nonce: [0; 12],
            lifetime: 120,
            created_at: 0,
        }
    }

    #[test]
    fn connect_installs_static_pipeline() {
        let forwarder = MockForwarder::new();
        let cfg = config();
        let programmer = Programmer::new(&forwarder, &cfg);
        programmer.on_forwarder_connect();

        assert_eq!(forwarder.clear_count(), 1);
        assert!(forwarder
            .find_entry(FlowTable::PcpMessageForwarding, |e| e.r#match.eth_type
                == Some(ETH_TYPE_ARP))
            .is_some());
        assert!(forwarder
            .find_entry(FlowTable::NatPortMatch, |e| e.priority == 0)
            .is_some());
    }

    #[test]
    fn install_mapping_adds_both_directions_with_idle_timeout() {
        let forwarder = MockForwarder::new();
        let cfg = config();
        let programmer = Programmer::new(&forwarder, &cfg);
        let entry = sample_entry();
        programmer.install_mapping(&entry);

        let internal_to_external = forwarder
            .find_entry(FlowTable::NatInternalToExternal, |e| e.idle_timeout == 120)
            .expect("internal->external entry installed");
        assert!(internal_to_external.send_flow_removed);
        assert!(forwarder
            .find_entry(FlowTable::NatExternalToInternal, |e| e.idle_timeout == 120)
            .is_some());
    }

    #[test]
    fn refresh_removes_then_reinstalls_with_new_lifetime() {
        let forwarder = MockForwarder::new();
        let cfg = config();
        let programmer = Programmer::new(&forwarder, &cfg);
        let original = sample_entry();
        programmer.install_mapping(&original);

        let mut refreshed = original;
        refreshed.lifetime = 600;
        programmer.refresh_mapping(&original, &refreshed);

        assert_eq!(forwarder.removed_entries().len(), 2);
        assert!(forwarder
            .find_entry(FlowTable::NatInternalToExternal, |e| e.idle_timeout == 600)
            .is_some());
    }
}
