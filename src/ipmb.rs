//! IPMB wire frame encode/decode (C1/C6 boundary).
//!
//! Grounded on `ipmb_ipmi.c`'s frame layout as given in `SPEC_FULL.md`
//! §6: `[rs_addr | netfn<<2|rs_lun | csum1 | rq_addr | rq_seq<<2|rq_lun |
//! cmd | data... | csum2]`, with an optional leading `0x00` broadcast
//! byte. `csum1` covers `rs_addr..rs_lun`; `csum2` covers
//! `rq_addr..data` (everything from the third on-wire byte through the
//! last data byte). This is the thin framing layer that turns router
//! (C7) `Message`s into the bytes that actually cross channel 0's wire,
//! and back.

use crate::codec::ipmb_checksum;
use thiserror::Error;

/// Minimum frame length without the broadcast byte: rs_addr, netfn|lun,
/// csum1, rq_addr, rq_seq|lun, cmd, csum2 — six header/trailer bytes
/// plus zero data bytes.
const MIN_FRAME_LEN: usize = 6;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum IpmbError {
    #[error("frame shorter than the minimum IPMB header+trailer")]
    TooShort,
    #[error("header checksum (rs_addr/netfn) did not validate")]
    BadHeaderChecksum,
    #[error("body checksum (rq_addr..data) did not validate")]
    BadBodyChecksum,
}

/// A decoded IPMB frame, one layer below the router's `Message`: it
/// carries the raw address/netfn/seq/lun bitfields exactly as they sit
/// on the wire, rather than the tagged `Address` the router works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpmbFrame {
    /// True when a leading `0x00` broadcast byte preceded the header.
    pub broadcast: bool,
    pub rs_addr: u8,
    pub netfn: u8,
    pub rs_lun: u8,
    pub rq_addr: u8,
    pub rq_seq: u8,
    pub rq_lun: u8,
    pub cmd: u8,
    pub data: Vec<u8>,
}

impl IpmbFrame {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_FRAME_LEN + self.data.len() + 1);
        if self.broadcast {
            out.push(0x00);
        }
        let header = [self.rs_addr, (self.netfn << 2) | (self.rs_lun & 0x03)];
        let csum1 = ipmb_checksum(&header, 0);
        out.extend_from_slice(&header);
        out.push(csum1);

        let body_start = out.len();
        out.push(self.rq_addr);
        out.push((self.rq_seq << 2) | (self.rq_lun & 0x03));
        out.push(self.cmd);
        out.extend_from_slice(&self.data);
        let csum2 = ipmb_checksum(&out[body_start..], 0);
        out.push(csum2);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IpmbError> {
        let (broadcast, rest) = match bytes.first() {
            Some(0x00) => (true, &bytes[1..]),
            _ => (false, bytes),
        };
        if rest.len() < MIN_FRAME_LEN {
            return Err(IpmbError::TooShort);
        }

        let header = &rest[0..2];
        if ipmb_checksum(&[header[0], header[1], rest[2]], 0) != 0 {
            return Err(IpmbError::BadHeaderChecksum);
        }
        let body = &rest[3..];
        if ipmb_checksum(body, 0) != 0 {
            return Err(IpmbError::BadBodyChecksum);
        }

        let rs_addr = rest[0];
        let netfn = rest[1] >> 2;
        let rs_lun = rest[1] & 0x03;
        let rq_addr = rest[3];
        let rq_seq = rest[4] >> 2;
        let rq_lun = rest[4] & 0x03;
        let cmd = rest[5];
        let data = body[3..body.len() - 1].to_vec();

        Ok(IpmbFrame {
            broadcast,
            rs_addr,
            netfn,
            rs_lun,
            rq_addr,
            rq_seq,
            rq_lun,
            cmd,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(broadcast: bool, data: Vec<u8>) -> IpmbFrame {
        IpmbFrame {
            broadcast,
            rs_addr: 0x20,
            netfn: 0x06,
            rs_lun: 0x00,
            rq_addr: 0x81,
            rq_seq: 0x00,
            rq_lun: 0x00,
            cmd: 0x01, // Get Device ID
            data,
        }
    }

    #[test]
    fn decode_of_encode_round_trips() {
        for broadcast in [false, true] {
            for data in [vec![], vec![0xAA, 0xBB, 0xCC]] {
                let frame = sample(broadcast, data);
                let wire = frame.encode();
                assert_eq!(IpmbFrame::decode(&wire).unwrap(), frame);
            }
        }
    }

    #[test]
    fn header_checksum_validates_on_well_formed_frame() {
        let frame = sample(false, vec![]);
        let wire = frame.encode();
        // rs_addr(0x20) + netfn<<2|lun(0x18) + csum1 sums to zero mod 256.
        assert_eq!(ipmb_checksum(&wire[0..3], 0), 0);
    }

    #[test]
    fn corrupted_header_checksum_is_rejected() {
        let frame = sample(false, vec![0x01]);
        let mut wire = frame.encode();
        wire[2] ^= 0xFF;
        assert_eq!(IpmbFrame::decode(&wire), Err(IpmbError::BadHeaderChecksum));
    }

    #[test]
    fn corrupted_body_checksum_is_rejected() {
        let frame = sample(false, vec![0x01]);
        let mut wire = frame.encode();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert_eq!(IpmbFrame::decode(&wire), Err(IpmbError::BadBodyChecksum));
    }

    #[test]
    fn too_short_frame_is_rejected() {
        assert_eq!(IpmbFrame::decode(&[0x20, 0x18]), Err(IpmbError::TooShort));
    }

    #[test]
    fn get_device_id_broadcast_scenario_decodes_expected_fields() {
        // A full broadcast Get Device ID request/response pair matching
        // the shape of the literal scenario in SPEC_FULL.md §8 (the
        // spec's own 7-byte illustration omits the trailing body
        // checksum byte required by a well-formed frame; this
        // regenerates a complete, checksummed frame with the same
        // header/command fields instead of replaying those bytes as-is).
        let request = IpmbFrame {
            broadcast: true,
            rs_addr: 0x20,
            netfn: 0x06, // NetFn App, request
            rs_lun: 0x00,
            rq_addr: 0x81,
            rq_seq: 0x00,
            rq_lun: 0x00,
            cmd: 0x01, // Get Device ID
            data: vec![],
        };
        let wire = request.encode();
        let decoded = IpmbFrame::decode(&wire).unwrap();
        assert!(decoded.broadcast);
        assert_eq!(decoded.rs_addr, 0x20);
        assert_eq!(decoded.netfn, 0x06);
        assert_eq!(decoded.cmd, 0x01);
        assert!(decoded.data.is_empty());
    }
}
