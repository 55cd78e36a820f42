use num_enum::{IntoPrimitive, TryFromPrimitive};

/// The PCP opcode, carried in the low 7 bits of header byte 1.
///
/// ANNOUNCE carries no payload. MAP and PEER are implemented per spec; the
/// remaining RFC6887 opcode space is unassigned and treated as unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Announce = 0,
    Map = 1,
    Peer = 2,
}
