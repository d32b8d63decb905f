//! SOL server transport (C8).
//!
//! Grounded exactly on `lanserv/sol.c`: 32-byte inbound/outbound ring
//! buffers per MC, `curr_packet_seq` initialized to 1 and wrapping
//! `16 -> 1`, and the ACK/NACK bookkeeping in `handle_sol_payload`/
//! `send_data`/`send_ack`/`clear_outbuf`.

use super::{SolPacket, SolStatus};
use crate::channel::Mc;
use crate::error::{CompletionCode, SessionError};
use crate::session::{McHandle, SessionTable};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const INBUF_SIZE: usize = 32;
pub const OUTBUF_SIZE: usize = 32;

/// The `set_associated_mc` payload-kind tag SOL registers itself under
/// (`msg->data[0] & 0xf` in `ipmi_sol_activate`, always `0x01` for SOL).
pub const SOL_PAYLOAD_KIND: u8 = 0x01;

pub struct SolServerConnection {
    /// Reference-counted so a session-close callback can clear it
    /// without holding `&mut Mc` — the callback is stored and invoked
    /// by [`SessionTable`] independently of this connection.
    active: Arc<AtomicBool>,

    inbuf: Vec<u8>,
    outbuf: Vec<u8>,

    in_nack: bool,
    read_enabled: bool,
    write_enabled: bool,

    last_acked_packet: u8,
    last_acked_packet_len: u8,
    curr_packet_seq: u8,
}

impl Default for SolServerConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl SolServerConnection {
    pub fn new() -> Self {
        SolServerConnection {
            active: Arc::new(AtomicBool::new(false)),
            inbuf: Vec::with_capacity(INBUF_SIZE),
            outbuf: Vec::with_capacity(OUTBUF_SIZE),
            in_nack: false,
            read_enabled: true,
            write_enabled: false,
            last_acked_packet: 0,
            last_acked_packet_len: 0,
            curr_packet_seq: 1,
        }
    }

    pub fn activate(&mut self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        self.inbuf.clear();
        self.outbuf.clear();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// A handle a session-close callback can flip independently of this
    /// connection, without needing `&mut Mc`.
    pub fn close_handle(&self) -> Arc<AtomicBool> {
        self.active.clone()
    }

    pub fn read_enabled(&self) -> bool {
        self.read_enabled
    }

    pub fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    /// Drain bytes destined for the downstream device (what arrived from
    /// the remote console and should now be written out).
    pub fn take_inbound_for_device(&mut self) -> Vec<u8> {
        let drained = std::mem::take(&mut self.inbuf);
        self.set_write_enable();
        drained
    }

    fn set_read_enable(&mut self) {
        let val = if self.outbuf.len() == OUTBUF_SIZE {
            false
        } else {
            !self.in_nack
        };
        self.read_enabled = val;
    }

    fn set_write_enable(&mut self) {
        self.write_enabled = !self.inbuf.is_empty();
    }

    fn clear_outbuf(&mut self) {
        self.curr_packet_seq += 1;
        if self.curr_packet_seq >= 16 {
            self.curr_packet_seq = 1;
        }
        self.outbuf.clear();
    }

    fn status_byte(&self) -> SolStatus {
        if self.inbuf.len() == INBUF_SIZE {
            SolStatus::BUFFER_FULL
        } else {
            SolStatus::empty()
        }
    }

    /// Build the outbound data packet (current buffer contents, current
    /// sequence number).
    fn data_packet(&self) -> SolPacket {
        SolPacket {
            seq: self.curr_packet_seq,
            ack_or_nack: 0,
            accepted_count: 0,
            status: self.status_byte(),
            data: self.outbuf.clone(),
        }
    }

    /// Build an ACK-only packet (seq 0) for the last accepted inbound
    /// packet.
    fn ack_packet(&self) -> SolPacket {
        SolPacket {
            seq: 0,
            ack_or_nack: self.last_acked_packet,
            accepted_count: self.last_acked_packet_len,
            status: self.status_byte(),
            data: Vec::new(),
        }
    }

    /// New bytes arrived from the device side; append to the outbound
    /// ring (up to capacity) and, if active, return the packet to send.
    pub fn device_data_ready(&mut self, data: &[u8]) -> Option<SolPacket> {
        let room = OUTBUF_SIZE - self.outbuf.len();
        let take = room.min(data.len());
        self.outbuf.extend_from_slice(&data[..take]);

        if !self.is_active() {
            self.outbuf.clear();
            return None;
        }
        self.set_read_enable();
        Some(self.data_packet())
    }

    /// Handle one inbound SOL packet from the remote console, returning
    /// the reply packet to send (if any).
    pub fn handle_inbound(&mut self, pkt: &SolPacket) -> Option<SolPacket> {
        let mut reply = None;

        if pkt.seq != 0 {
            if pkt.seq == self.last_acked_packet {
                reply = Some(self.ack_packet());
            } else if !pkt.data.is_empty() {
                self.last_acked_packet = pkt.seq;
                let room = INBUF_SIZE - self.inbuf.len();
                let accepted = room.min(pkt.data.len());
                self.last_acked_packet_len = accepted as u8;
                self.inbuf.extend_from_slice(&pkt.data[..accepted]);

                reply = Some(self.ack_packet());
                self.set_write_enable();
            }
        }

        if pkt.ack_or_nack != 0 {
            if pkt.status.contains(SolStatus::NACK) {
                self.in_nack = true;
                self.set_read_enable();
            } else {
                self.in_nack = false;
                self.set_read_enable();
                if pkt.accepted_count as usize != self.outbuf.len() {
                    reply = Some(self.data_packet());
                } else {
                    self.clear_outbuf();
                }
            }
        }

        if pkt.status.contains(SolStatus::FLUSH_OUT) {
            self.clear_outbuf();
        }
        if pkt.status.contains(SolStatus::FLUSH_IN) {
            self.inbuf.clear();
        }

        reply
    }
}

/// `ipmi_sol_activate`: register `mc_handle` as the SOL payload owner
/// for `sid` and build the 13-byte `Activate Payload` response. Already
/// active ⇒ `0x80`; the session already owning this `(sid, payload)`
/// pair ⇒ `0x81` (node busy), per `sol.c`'s `EBUSY` mapping.
pub fn ipmi_sol_activate(
    mc: &mut Mc,
    sessions: &mut SessionTable,
    sid: u32,
    mc_handle: McHandle,
    port: u16,
) -> Result<[u8; 13], CompletionCode> {
    if mc.sol.is_active() {
        return Err(CompletionCode::PayloadAlreadyInState);
    }

    let close_handle = mc.sol.close_handle();
    let close_cb: crate::session::CloseCallback = Box::new(move |_session_id| {
        close_handle.store(false, Ordering::SeqCst);
    });

    sessions
        .set_associated_mc(sid, SOL_PAYLOAD_KIND, mc_handle, close_cb)
        .map_err(|e| match e {
            SessionError::Busy => CompletionCode::NodeBusy,
            _ => CompletionCode::Unspecified,
        })?;

    mc.sol.activate();

    let mut resp = [0u8; 13];
    resp[0] = CompletionCode::Ok.code();
    resp[5..7].copy_from_slice(&(INBUF_SIZE as u16).to_le_bytes());
    resp[7..9].copy_from_slice(&(OUTBUF_SIZE as u16).to_le_bytes());
    resp[9..11].copy_from_slice(&port.to_le_bytes());
    resp[11..13].copy_from_slice(&0xFFFFu16.to_le_bytes());
    Ok(resp)
}

/// `ipmi_sol_deactivate`: already-deactivated ⇒ `0x80`; otherwise tears
/// down the SOL connection and clears its session association.
pub fn ipmi_sol_deactivate(mc: &mut Mc, sessions: &mut SessionTable, sid: u32) -> Result<(), CompletionCode> {
    if !mc.sol.is_active() {
        return Err(CompletionCode::PayloadAlreadyInState);
    }
    mc.sol.deactivate();
    sessions.clear_associated_mc(sid, SOL_PAYLOAD_KIND);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn curr_packet_seq_wraps_16_to_1() {
        let mut conn = SolServerConnection::new();
        conn.activate();
        conn.curr_packet_seq = 15;
        conn.outbuf = vec![1, 2, 3];
        // ack matching full outbuf length triggers clear_outbuf + advance
        let ack = SolPacket { seq: 0, ack_or_nack: 1, accepted_count: 3, status: SolStatus::empty(), data: vec![] };
        conn.handle_inbound(&ack);
        assert_eq!(conn.curr_packet_seq, 1);
    }

    #[test]
    fn resend_on_same_seq_without_touching_inbound() {
        let mut conn = SolServerConnection::new();
        conn.activate();
        let first = SolPacket { seq: 1, ack_or_nack: 0, accepted_count: 0, status: SolStatus::empty(), data: vec![9, 9] };
        conn.handle_inbound(&first);
        assert_eq!(conn.inbuf, vec![9, 9]);

        let resend = SolPacket { seq: 1, ack_or_nack: 0, accepted_count: 0, status: SolStatus::empty(), data: vec![9, 9] };
        let reply = conn.handle_inbound(&resend).unwrap();
        assert_eq!(reply.seq, 0); // ack-only, no data re-accepted
        assert_eq!(conn.inbuf, vec![9, 9]); // unchanged
    }

    #[test]
    fn nack_pauses_reader_without_resend() {
        let mut conn = SolServerConnection::new();
        conn.activate();
        conn.outbuf = vec![1, 2, 3];
        let nack = SolPacket { seq: 0, ack_or_nack: 1, accepted_count: 0, status: SolStatus::NACK, data: vec![] };
        let reply = conn.handle_inbound(&nack);
        assert!(conn.in_nack);
        assert!(reply.is_none());
    }

    #[test]
    fn buffer_full_sets_status_bit() {
        let mut conn = SolServerConnection::new();
        conn.activate();
        let full = vec![0xAAu8; INBUF_SIZE];
        let pkt = SolPacket { seq: 1, ack_or_nack: 0, accepted_count: 0, status: SolStatus::empty(), data: full };
        conn.handle_inbound(&pkt);
        assert!(conn.status_byte().contains(SolStatus::BUFFER_FULL));
    }

    #[test]
    fn activate_builds_expected_response_and_registers_session() {
        let mut mc = Mc::new(0x20);
        let mut sessions = SessionTable::new();
        let handle = sessions.create_session(None).unwrap();
        let sid = sessions.get(handle).unwrap().sid;

        let resp = ipmi_sol_activate(&mut mc, &mut sessions, sid, 42, 623).unwrap();
        assert_eq!(resp[0], CompletionCode::Ok.code());
        assert_eq!(u16::from_le_bytes([resp[5], resp[6]]), INBUF_SIZE as u16);
        assert_eq!(u16::from_le_bytes([resp[7], resp[8]]), OUTBUF_SIZE as u16);
        assert_eq!(u16::from_le_bytes([resp[9], resp[10]]), 623);
        assert_eq!(u16::from_le_bytes([resp[11], resp[12]]), 0xFFFF);
        assert!(mc.sol.is_active());
        assert_eq!(sessions.get_associated_mc(sid, SOL_PAYLOAD_KIND), Some(42));
    }

    #[test]
    fn activate_twice_is_already_active() {
        let mut mc = Mc::new(0x20);
        let mut sessions = SessionTable::new();
        let handle = sessions.create_session(None).unwrap();
        let sid = sessions.get(handle).unwrap().sid;

        ipmi_sol_activate(&mut mc, &mut sessions, sid, 1, 623).unwrap();
        assert_eq!(
            ipmi_sol_activate(&mut mc, &mut sessions, sid, 1, 623),
            Err(CompletionCode::PayloadAlreadyInState)
        );
    }

    #[test]
    fn activate_conflicting_mc_is_node_busy() {
        let mut mc_a = Mc::new(0x20);
        let mut mc_b = Mc::new(0x22);
        let mut sessions = SessionTable::new();
        let handle = sessions.create_session(None).unwrap();
        let sid = sessions.get(handle).unwrap().sid;

        ipmi_sol_activate(&mut mc_a, &mut sessions, sid, 1, 623).unwrap();
        assert_eq!(
            ipmi_sol_activate(&mut mc_b, &mut sessions, sid, 2, 623),
            Err(CompletionCode::NodeBusy)
        );
    }

    #[test]
    fn session_close_deactivates_sol_via_close_handle() {
        let mut mc = Mc::new(0x20);
        let mut sessions = SessionTable::new();
        let handle = sessions.create_session(None).unwrap();
        let sid = sessions.get(handle).unwrap().sid;

        ipmi_sol_activate(&mut mc, &mut sessions, sid, 1, 623).unwrap();
        assert!(mc.sol.is_active());

        sessions.close(handle);
        assert!(!mc.sol.is_active());
    }

    #[test]
    fn deactivate_already_inactive_is_already_active_error() {
        let mut mc = Mc::new(0x20);
        let mut sessions = SessionTable::new();
        let handle = sessions.create_session(None).unwrap();
        let sid = sessions.get(handle).unwrap().sid;

        assert_eq!(
            ipmi_sol_deactivate(&mut mc, &mut sessions, sid),
            Err(CompletionCode::PayloadAlreadyInState)
        );
    }

    #[test]
    fn deactivate_clears_association() {
        let mut mc = Mc::new(0x20);
        let mut sessions = SessionTable::new();
        let handle = sessions.create_session(None).unwrap();
        let sid = sessions.get(handle).unwrap().sid;

        ipmi_sol_activate(&mut mc, &mut sessions, sid, 1, 623).unwrap();
        ipmi_sol_deactivate(&mut mc, &mut sessions, sid).unwrap();
        assert!(!mc.sol.is_active());
        assert_eq!(sessions.get_associated_mc(sid, SOL_PAYLOAD_KIND), None);
    }
}
