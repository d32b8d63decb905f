//! Serial-over-LAN packet framing, shared by the server (C8) and client
//! (C9) transports.
//!
//! Grounded on `lanserv/sol.c::handle_sol_payload`/`send_data`/
//! `send_ack`: a 4-byte header plus up to 255 bytes of payload, carried
//! as RMCP+ payload type `0x01`.

pub mod client;
pub mod server;

pub const PAYLOAD_TYPE_SOL: u8 = 0x01;
pub const MAX_PACKET_DATA: usize = 255;
/// Sequence number reserved for the post-activation probe; ordinary
/// data transmission wraps `1..=14` and never emits this value
/// (Open Question (a), resolved in SPEC_FULL.md §9).
pub const TEST_SEQ: u8 = 15;

bitflags::bitflags! {
    /// Status/op bits carried in byte 3 of a SOL packet header.
    #[derive(Default)]
    pub struct SolStatus: u8 {
        /// Server->client only: inbound ring buffer saturated.
        const BUFFER_FULL        = 1 << 6;
        const NACK                = 1 << 6;
        /// Remote->local status: character transfer temporarily
        /// unavailable. Shares a bit with `RING_REQUEST` (op-side
        /// meaning), since the two are only ever meaningful in opposite
        /// directions of the same byte.
        const CHARACTER_TRANSFER_UNAVAIL = 1 << 5;
        const RING_REQUEST        = 1 << 5;
        /// Remote->local status: the SOL payload has been deactivated.
        /// Shares a bit with `GENERATE_BREAK` for the same reason.
        const DEACTIVATED         = 1 << 4;
        const GENERATE_BREAK      = 1 << 4;
        const CTS_PAUSE           = 1 << 3;
        const DEASSERT_DCD_DSR    = 1 << 2;
        const FLUSH_IN            = 1 << 1;
        const FLUSH_OUT           = 1 << 0;
    }
}

/// A decoded SOL packet header plus its data payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolPacket {
    pub seq: u8,
    pub ack_or_nack: u8,
    pub accepted_count: u8,
    pub status: SolStatus,
    pub data: Vec<u8>,
}

impl SolPacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.seq & 0x0f);
        out.push(self.ack_or_nack & 0x0f);
        out.push(self.accepted_count);
        out.push(self.status.bits());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 || bytes.len() > 4 + MAX_PACKET_DATA {
            return None;
        }
        let seq = bytes[0] & 0x0f;
        let data = bytes[4..].to_vec();
        if seq != 0 && data.is_empty() {
            // A non-ACK-only packet must carry data, unless it's the
            // zero-data TEST_SEQ probe (seq == TEST_SEQ is allowed to
            // carry no data).
            if seq != TEST_SEQ {
                return None;
            }
        }
        Some(SolPacket {
            seq,
            ack_or_nack: bytes[1] & 0x0f,
            accepted_count: bytes[2],
            status: SolStatus::from_bits_truncate(bytes[3]),
            data,
        })
    }
}
