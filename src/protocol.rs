//! Wire-level identifiers and payload encodings for the discovery/control
//! protocol multiplexed over the bus, plus the UUID → port-number allocator.

use byteorder::{BigEndian, ByteOrder};

/// Upper bound on simultaneously addressable ports. Bounds both the
/// identifier allocator's output range and the control-channel filter band
/// installed on the bus socket (`CTL_FILTER`/`CTL_MASK` below).
pub const MAX_PORTS: u16 = 64;

/// Outbound discovery solicit. Payload is either empty (broadcast) or a
/// big-endian 2-byte target `ctl_id` (targeted re-solicit).
pub const UUID: u32 = 0x001;

/// Inbound discovery response. Payload is a 6-byte UUID.
pub const UUID_RESP: u32 = 0x002;

pub const UUID_FILTER: u32 = UUID_RESP;
pub const UUID_MASK: u32 = 0x7ff;

/// Per-port control channel base. The gateway addresses node `n` on
/// `2*n + CTL_FILTER_BASE` (its `ctl_id`); the node transmits back on
/// `ctl_id - 1` (its `tx_id`).
pub const CTL_FILTER_BASE: u32 = 0x100;
pub const CTL_FILTER: u32 = CTL_FILTER_BASE;
/// Accepts the whole `[0x100, 0x17f]` band that `n in 0..MAX_PORTS` occupies.
pub const CTL_MASK: u32 = 0x780;

/// Outbound id-assignment acknowledgement. Payload is `(2-byte ctl_id,
/// 6-byte uuid)`, big-endian, no padding. Reuses the `UUID` frame id — a SET
/// frame is distinguished from a solicit by its length (8 bytes, never 0 or 2).
pub const SET: u32 = UUID;

pub type Uuid = [u8; 6];

/// Derives a stable `port_number` from a node's UUID.
///
/// Pure and deterministic: XORs the UUID's bytes together and reduces the
/// result modulo `max_ports`. A plain XOR fold is a weak hash — two UUIDs
/// that are permutations of the same byte multiset collide — but this
/// system already treats a collision identically to a legitimate
/// re-discovery (see DESIGN.md), and the node populations this protocol
/// addresses are small enough that the simplicity is worth the trade.
pub fn derive_port_number(uuid: &Uuid, max_ports: u16) -> u16 {
    let folded = uuid.iter().fold(0u8, |acc, byte| acc ^ byte);
    (folded as u16) % max_ports
}

/// The CAN id the gateway addresses a node with this port number on.
pub fn ctl_id(port_number: u16) -> u32 {
    2 * port_number as u32 + CTL_FILTER_BASE
}

/// The CAN id the node transmits back on, given its `ctl_id`.
pub fn tx_id(ctl_id: u32) -> u32 {
    ctl_id - 1
}

/// Encodes a targeted discovery solicit payload (2-byte big-endian `ctl_id`).
pub fn encode_uuid_solicit(target_ctl_id: u32) -> [u8; 2] {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, target_ctl_id as u16);
    buf
}

/// Decodes a UUID_RESP payload. Returns `None` if the payload is not exactly
/// 6 bytes.
pub fn decode_uuid_resp(payload: &[u8]) -> Option<Uuid> {
    if payload.len() != 6 {
        return None;
    }
    let mut uuid = [0u8; 6];
    uuid.copy_from_slice(payload);
    Some(uuid)
}

/// Encodes a SET payload: `ctl_id` (2 bytes, big-endian) followed by the
/// 6-byte UUID.
pub fn encode_set(ctl_id: u32, uuid: &Uuid) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u16(&mut buf[0..2], ctl_id as u16);
    buf[2..8].copy_from_slice(uuid);
    buf
}

/// Twelve lowercase hex digits naming the symlink for this UUID, e.g.
/// `010203040506`.
pub fn uuid_hex(uuid: &Uuid) -> String {
    hex::encode(uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_port_number_is_deterministic() {
        let uuid = [1, 2, 3, 4, 5, 6];
        assert_eq!(
            derive_port_number(&uuid, MAX_PORTS),
            derive_port_number(&uuid, MAX_PORTS)
        );
    }

    #[test]
    fn derive_port_number_is_bounded() {
        for i in 0u8..=255 {
            let uuid = [i, i.wrapping_add(1), i.wrapping_add(2), 0, 0, 0];
            assert!(derive_port_number(&uuid, MAX_PORTS) < MAX_PORTS);
        }
    }

    #[test]
    fn derive_port_number_differs_for_different_uuids() {
        let a = derive_port_number(&[1, 2, 3, 4, 5, 6], MAX_PORTS);
        let b = derive_port_number(&[9, 9, 9, 9, 9, 9], MAX_PORTS);
        assert_ne!(a, b);
    }

    #[test]
    fn derive_port_number_matches_spec_scenario() {
        // scenario 1: UUID 01:02:03:04:05:06 -> port number 7.
        let uuid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert_eq!(derive_port_number(&uuid, MAX_PORTS), 7);
    }

    #[test]
    fn ctl_and_tx_id_scenario_from_spec() {
        // scenario 1: port number 7 -> ctl_id 0x10e, tx_id 0x10d
        let id = ctl_id(7);
        assert_eq!(id, 2 * 7 + CTL_FILTER_BASE);
        assert_eq!(tx_id(id), id - 1);
    }

    #[test]
    fn set_payload_packs_ctl_id_and_uuid() {
        let uuid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        let id = ctl_id(7);
        let payload = encode_set(id, &uuid);
        assert_eq!(BigEndian::read_u16(&payload[0..2]) as u32, id);
        assert_eq!(&payload[2..8], &uuid);
    }

    #[test]
    fn uuid_resp_round_trips_through_decode() {
        let uuid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert_eq!(decode_uuid_resp(&uuid), Some(uuid));
        assert_eq!(decode_uuid_resp(&uuid[..4]), None);
    }

    #[test]
    fn uuid_hex_matches_spec_scenario() {
        let uuid = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
        assert_eq!(uuid_hex(&uuid), "010203040506");
    }
}
