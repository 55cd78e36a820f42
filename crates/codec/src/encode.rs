use bytes::{BufMut, BytesMut};

use crate::message::{MapBody, PcpResponse, PeerBody, ResponseBody};
use crate::result_code::ResultCode;

/// Serialize a [`PcpResponse`] onto `buf` per RFC6887 §7.2/§9.2/§10.2.
pub fn encode(response: &PcpResponse, buf: &mut BytesMut) {
    let common = &response.common;
    buf.reserve(24 + body_len(&response.body));

    buf.put_u8(common.version);
    buf.put_u8(0x80 | u8::from(common.opcode));
    buf.put_u8(0); // reserved
    buf.put_u8(common.result_code.into());
    buf.put_u32(common.lifetime);
    buf.put_u32(common.epoch_time);
    if common.result_code == ResultCode::Success {
        buf.put_bytes(0, 12);
    } else {
        buf.put_slice(&common.client_ip_tail);
    }

    match &response.body {
        ResponseBody::Announce => {}
        ResponseBody::Map(map) => put_map_body(buf, map),
        ResponseBody::Peer(peer) => put_peer_body(buf, peer),
    }
}

fn body_len(body: &ResponseBody) -> usize {
    match body {
        ResponseBody::Announce => 0,
        ResponseBody::Map(_) => crate::MAP_BODY_LEN,
        ResponseBody::Peer(_) => crate::PEER_BODY_LEN,
    }
}

fn put_map_body(buf: &mut BytesMut, map: &MapBody) {
    buf.put_slice(&map.nonce);
    buf.put_u8(map.protocol);
    buf.put_bytes(0, 3); // reserved
    buf.put_u16(map.internal_port);
    buf.put_u16(map.external_port);
    buf.put_slice(&map.external_ip.octets());
}

fn put_peer_body(buf: &mut BytesMut, peer: &PeerBody) {
    put_map_body(buf, &peer.map);
    buf.put_u16(peer.remote_peer_port);
    buf.put_bytes(0, 2); // reserved
    buf.put_slice(&peer.remote_peer_ip.octets());
}
