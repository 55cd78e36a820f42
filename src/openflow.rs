//! OpenFlow 1.3 wire constants this controller actually uses. Kept
//! separate from [`crate::forwarder`]'s types so the trait/data-model
//! boundary doesn't get cluttered with raw protocol numbers.

/// OFPP_CONTROLLER (OpenFlow 1.3 §A.2.1): the reserved virtual port
/// representing the controller itself, usable both as an output target and
/// (per spec.md §4.3) as an `in_port` match when a packet the controller
/// sent is resubmitted through the pipeline via `TABLE`.
pub const OFPP_CONTROLLER: u32 = 0xfffffffd;
/// OFPP_TABLE: "submit to the first table", used by `send_packet`'s
/// `out_port | TABLE` alternative.
pub const OFPP_TABLE: u32 = 0xfffffff9;
/// OFPP_ANY: wildcard port used in flow-mod/flow-removed matches.
pub const OFPP_ANY: u32 = 0xffffffff;

/// EtherType for ARP.
pub const ETH_TYPE_ARP: u16 = 0x0806;
/// EtherType for IPv4.
pub const ETH_TYPE_IPV4: u16 = 0x0800;

/// IANA protocol number for TCP.
pub const IP_PROTO_TCP: u8 = 6;
/// IANA protocol number for UDP.
pub const IP_PROTO_UDP: u8 = 17;

/// ARP opcodes used by the proxy-ARP handler.
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;
