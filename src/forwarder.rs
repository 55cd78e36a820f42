//! The OpenFlow 1.3 forwarder abstraction and the flow-table pipeline that
//! sits on top of it.
//!
//! `ForwarderChannel` is the black-box boundary between this controller's
//! stateful logic and whatever actually speaks OpenFlow to a datapath; the
//! session transport, hello/features handshake, and message framing are
//! all out of scope and live behind this trait in an integration crate.
//! `MockForwarder` is the in-memory test double used throughout this
//! crate's component tests.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use parking_lot::Mutex;

/// Named flow tables, in pipeline order. The next-table relation used by
/// `goto` instructions is always derived from this ordering, never from
/// the raw numeric ID: two names can alias the same ID (see
/// [`FlowTablePipeline::id_of`]) without that breaking `next_table`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowTable {
    PcpMessageForwarding,
    NatPortMatch,
    NatInternalToExternal,
    NatExternalToInternal,
    PacketForwarding,
}

/// `arp_forwarding` and `mac_overwriting` both alias table 0
/// (`pcp_message_forwarding`): ARP-punting and MAC-rewrite entries share
/// the same physical table as PCP-punting, distinguished only by `eth_type`
/// match and priority.
pub struct FlowTablePipeline {
    order: Vec<FlowTable>,
}

impl Default for FlowTablePipeline {
    fn default() -> Self {
        Self {
            order: vec![
                FlowTable::PcpMessageForwarding,
                FlowTable::NatPortMatch,
                FlowTable::NatInternalToExternal,
                FlowTable::NatExternalToInternal,
                FlowTable::PacketForwarding,
            ],
        }
    }
}

impl FlowTablePipeline {
    /// The numeric table ID for a table name. Aliases (`arp_forwarding`,
    /// `mac_overwriting`) both resolve to the same ID as
    /// `PcpMessageForwarding`; see [`FlowTable::PcpMessageForwarding`]'s
    /// doc comment.
    pub fn id_of(&self, table: FlowTable) -> u8 {
        self.order.iter().position(|t| *t == table).expect("table in pipeline") as u8
    }

    /// The table after `table` in pipeline order. Computed from the
    /// ordered sequence rather than `id + 1`, so it stays correct
    /// regardless of how many names alias a given ID (spec.md §9's
    /// `next_table_id` fix).
    pub fn next_table(&self, table: FlowTable) -> Option<FlowTable> {
        let index = self.order.iter().position(|t| *t == table)?;
        self.order.get(index + 1).copied()
    }
}

/// OpenFlow 1.3 OXM match fields this controller ever sets. Absent fields
/// are wildcarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlowMatch {
    pub in_port: Option<u32>,
    pub eth_type: Option<u16>,
    pub eth_src: Option<[u8; 6]>,
    pub eth_dst: Option<[u8; 6]>,
    pub ip_proto: Option<u8>,
    pub ipv4_src: Option<Ipv4Addr>,
    pub ipv4_dst: Option<Ipv4Addr>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub udp_src: Option<u16>,
    pub udp_dst: Option<u16>,
}

/// A `SET_FIELD` action target, paired with the value to write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetField {
    Ipv4Src(Ipv4Addr),
    Ipv4Dst(Ipv4Addr),
    TcpSrc(u16),
    TcpDst(u16),
    UdpSrc(u16),
    UdpDst(u16),
    EthDst([u8; 6]),
}

/// A virtual or physical output port, per spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Physical(u32),
    Controller,
    Table,
    Any,
}

impl Port {
    pub fn as_u32(self) -> u32 {
        match self {
            Port::Physical(p) => p,
            Port::Controller => crate::openflow::OFPP_CONTROLLER,
            Port::Table => crate::openflow::OFPP_TABLE,
            Port::Any => crate::openflow::OFPP_ANY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Instructions {
    pub set_fields: Vec<SetField>,
    pub output: Option<Port>,
    pub goto_table: Option<FlowTable>,
}

/// An entry as handed to [`ForwarderChannel::add_flow_entry`]. `idle_timeout
/// == 0` means "no expiry" (used for the static entries installed at
/// forwarder-connect time); NAT entries always carry the mapping's
/// lifetime so the forwarder itself ages them out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowEntry {
    pub table: FlowTable,
    pub r#match: FlowMatch,
    pub instructions: Instructions,
    pub priority: u16,
    pub idle_timeout: u32,
    pub send_flow_removed: bool,
}

/// Why the forwarder removed a flow entry, mirroring OpenFlow 1.3's
/// `OFPRR_*` reason codes (spec.md §6); only `IdleTimeout` is acted on,
/// see spec.md §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowRemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    GroupDelete,
}

/// Inbound events a forwarder session delivers to the controller.
#[derive(Debug, Clone)]
pub enum ForwarderEvent {
    /// The forwarder session has completed its OpenFlow features exchange
    /// and is ready to be programmed.
    Features { datapath_mac: [u8; 6] },
    PacketIn {
        in_port: u32,
        raw_bytes: Vec<u8>,
    },
    FlowRemoved {
        table: FlowTable,
        r#match: FlowMatch,
        reason: FlowRemovedReason,
    },
}

/// The black-box boundary to an attached OpenFlow 1.3 datapath. Outbound
/// calls are fire-and-forget, per spec.md §5: the controller does not await
/// a response to its programming messages, it assumes eventual application.
pub trait ForwarderChannel: Send + Sync {
    fn add_flow_entry(&self, entry: FlowEntry);
    fn remove_flow_entry(&self, table: FlowTable, r#match: FlowMatch, priority: u16);
    fn send_packet(&self, packet_bytes: Vec<u8>, out_port: Port);
    fn clear_all(&self);
}

/// In-memory `ForwarderChannel` used by this crate's tests. Records every
/// outbound call so assertions can inspect exactly what the controller
/// asked the (nonexistent) datapath to do.
#[derive(Default)]
pub struct MockForwarder {
    inner: Mutex<MockForwarderState>,
}

#[derive(Default)]
struct MockForwarderState {
    pub added: Vec<FlowEntry>,
    pub removed: Vec<(FlowTable, FlowMatch, u16)>,
    pub sent_packets: Vec<(Vec<u8>, Port)>,
    pub cleared: usize,
}

impl MockForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn added_entries(&self) -> Vec<FlowEntry> {
        self.inner.lock().added.clone()
    }

    pub fn removed_entries(&self) -> Vec<(FlowTable, FlowMatch, u16)> {
        self.inner.lock().removed.clone()
    }

    pub fn sent_packets(&self) -> Vec<(Vec<u8>, Port)> {
        self.inner.lock().sent_packets.clone()
    }

    pub fn clear_count(&self) -> usize {
        self.inner.lock().cleared
    }

    /// Find the install for a `(table, priority)` pair matching `pred`,
    /// used by tests to assert a specific flow entry was installed without
    /// caring about install order.
    pub fn find_entry(&self, table: FlowTable, pred: impl Fn(&FlowEntry) -> bool) -> Option<FlowEntry> {
        self.inner
            .lock()
            .added
            .iter()
            .find(|e| e.table == table && pred(e))
            .cloned()
    }
}

impl ForwarderChannel for MockForwarder {
    fn add_flow_entry(&self, entry: FlowEntry) {
        self.inner.lock().added.push(entry);
    }

    fn remove_flow_entry(&self, table: FlowTable, r#match: FlowMatch, priority: u16) {
        self.inner.lock().removed.push((table, r#match, priority));
    }

    fn send_packet(&self, packet_bytes: Vec<u8>, out_port: Port) {
        self.inner.lock().sent_packets.push((packet_bytes, out_port));
    }

    fn clear_all(&self) {
        self.inner.lock().cleared += 1;
    }
}

/// A `ForwarderChannel` that only logs the calls it receives. `main.rs` wires
/// this in until a real OpenFlow transport is linked; the session layer
/// that would actually speak to a datapath is an external collaborator
/// outside this crate's scope (spec.md §1).
#[derive(Default)]
pub struct LoggingForwarder;

impl ForwarderChannel for LoggingForwarder {
    fn add_flow_entry(&self, entry: FlowEntry) {
        log::debug!("add_flow_entry: {entry:?}");
    }

    fn remove_flow_entry(&self, table: FlowTable, r#match: FlowMatch, priority: u16) {
        log::debug!("remove_flow_entry: table={table:?} match={match:?} priority={priority}");
    }

    fn send_packet(&self, packet_bytes: Vec<u8>, out_port: Port) {
        log::debug!("send_packet: {} bytes to {out_port:?}", packet_bytes.len());
    }

    fn clear_all(&self) {
        log::debug!("clear_all");
    }
}

/// ARP/MAC-rewrite state keyed by `dst_ip`, per spec.md §3.
#[derive(Debug, Clone)]
pub struct ArpTableEntry {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_mac: [u8; 6],
    pub dst_mac: Option<[u8; 6]>,
    pub datapath_mac: [u8; 6],
}

pub type ArpTable = HashMap<Ipv4Addr, ArpTableEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_table_follows_pipeline_order_not_id_arithmetic() {
        let pipeline = FlowTablePipeline::default();
        assert_eq!(
            pipeline.next_table(FlowTable::NatPortMatch),
            Some(FlowTable::NatInternalToExternal)
        );
        assert_eq!(pipeline.next_table(FlowTable::PacketForwarding), None);
    }

    #[test]
    fn mock_forwarder_records_calls() {
        let forwarder = MockForwarder::new();
        forwarder.add_flow_entry(FlowEntry {
            table: FlowTable::NatPortMatch,
            r#match: FlowMatch::default(),
            instructions: Instructions::default(),
            priority: 0,
            idle_timeout: 0,
            send_flow_removed: false,
        });
        forwarder.clear_all();
        assert_eq!(forwarder.added_entries().len(), 1);
        assert_eq!(forwarder.clear_count(), 1);
    }
}
