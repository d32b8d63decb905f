//! SOL client transport (C9).
//!
//! Grounded on `lib/ipmi_sol.c`'s activation ladder and packet state
//! machine, as distilled into the specification's own description of
//! the client's `Activate Payload` response handling, retransmit timer,
//! and reentrant callback queueing. The exact 13-byte activation
//! response layout and the ACK/NACK clamping semantics are shared with
//! [`super::server`] and come directly from `lanserv/sol.c`.

use super::{SolPacket, SolStatus, TEST_SEQ};
use crate::error::SolClientError;
use std::collections::VecDeque;
use std::time::Duration;

/// Default retransmit timeout, matching the original's
/// `ACK_timeout_usec` default of one second.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(1);
/// Default retry count before giving up on a packet.
pub const DEFAULT_ACK_RETRIES: u32 = 3;
/// Size of the outbound staging buffer; data queued beyond this is
/// held back until prior packets are acknowledged.
pub const STAGING_BUFFER_SIZE: usize = 1024;
/// Minimum and maximum plausible buffer-size fields recovered from an
/// activation response (defends against an endian-swapped reading).
const MIN_PLAUSIBLE_BUF_SIZE: u16 = 5;
const MAX_PLAUSIBLE_BUF_SIZE: u16 = 259;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolClientState {
    Closed,
    Connecting,
    Connected,
    /// Connected, but the remote has signaled "character transfer
    /// unavailable" (payload deactivated upstream of us, e.g. by a
    /// conflicting session) — reads are suppressed until reactivated.
    ConnectedCtu,
    Closing,
}

/// Parsed fields of a 13-byte `Activate Payload` response, per
/// `ipmi_sol_activate`'s reply layout. A reading is accepted only if
/// both sizes land in `[MIN_PLAUSIBLE_BUF_SIZE, MAX_PLAUSIBLE_BUF_SIZE]`
/// after a straight little-endian parse; a byte-swapped fallback is
/// tried before giving up, resolving ambiguous-endianness firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationInfo {
    pub max_inbound_payload_size: u16,
    pub max_outbound_payload_size: u16,
    pub port: u16,
}

pub fn parse_activation_response(data: &[u8]) -> Result<ActivationInfo, SolClientError> {
    if data.len() == 1 {
        return match data[0] {
            0x80 => Err(SolClientError::WrongState),
            code => Err(SolClientError::ActivationFailed(code)),
        };
    }
    if data.len() < 13 {
        return Err(SolClientError::BadActivationResponse);
    }
    if data[0] != 0x00 {
        return Err(SolClientError::ActivationFailed(data[0]));
    }

    let try_le = |hi: usize| u16::from_le_bytes([data[hi], data[hi + 1]]);
    let try_be = |hi: usize| u16::from_be_bytes([data[hi], data[hi + 1]]);

    let plausible = |v: u16| v >= MIN_PLAUSIBLE_BUF_SIZE && v <= MAX_PLAUSIBLE_BUF_SIZE;

    let (in_size, out_size) = {
        let (le_in, le_out) = (try_le(5), try_le(7));
        if plausible(le_in) && plausible(le_out) {
            (le_in, le_out)
        } else {
            let (be_in, be_out) = (try_be(5), try_be(7));
            if plausible(be_in) && plausible(be_out) {
                (be_in, be_out)
            } else {
                return Err(SolClientError::BadActivationResponse);
            }
        }
    };

    let port = try_le(9);

    Ok(ActivationInfo {
        max_inbound_payload_size: in_size,
        max_outbound_payload_size: out_size,
        port,
    })
}

/// One outstanding callback, keyed by the staging-buffer byte offset
/// its completion corresponds to. The original keeps a single slot per
/// operation kind (send-complete, break, CTS) rather than an arbitrary
/// map; modeled the same way here.
#[derive(Default)]
struct PendingCallbacks {
    on_send_complete: Option<Box<dyn FnMut(usize) + Send>>,
    on_break: Option<Box<dyn FnMut() + Send>>,
}

pub struct SolClientConnection {
    state: SolClientState,
    info: Option<ActivationInfo>,

    staging: VecDeque<u8>,
    curr_xmit_seq: u8,
    xmit_waiting_ack: bool,
    retries_left: u32,
    ack_timeout: Duration,

    last_received_seq: u8,
    in_nack: bool,

    /// Queue of inbound byte ranges delivered to the application but not
    /// yet drained by the caller (reentrant: a callback invoked from
    /// within packet processing may itself queue more work).
    pending_reads: VecDeque<Vec<u8>>,
    callbacks: PendingCallbacks,

    probed_test_seq: bool,
}

impl Default for SolClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl SolClientConnection {
    pub fn new() -> Self {
        SolClientConnection {
            state: SolClientState::Closed,
            info: None,
            staging: VecDeque::with_capacity(STAGING_BUFFER_SIZE),
            curr_xmit_seq: 1,
            xmit_waiting_ack: false,
            retries_left: DEFAULT_ACK_RETRIES,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            last_received_seq: 0,
            in_nack: false,
            pending_reads: VecDeque::new(),
            callbacks: PendingCallbacks::default(),
            probed_test_seq: false,
        }
    }

    pub fn state(&self) -> SolClientState {
        self.state
    }

    pub fn begin_connect(&mut self) {
        self.state = SolClientState::Connecting;
    }

    /// Consume an `Activate Payload` response. On success the
    /// connection moves to `Connected` and a `TEST_SEQ` probe packet
    /// is returned for the caller to send (validating the session
    /// before any real data flows).
    pub fn on_activation_response(&mut self, data: &[u8]) -> Result<Option<SolPacket>, SolClientError> {
        if self.state != SolClientState::Connecting {
            return Err(SolClientError::WrongState);
        }
        let info = parse_activation_response(data)?;
        self.info = Some(info);
        self.state = SolClientState::Connected;
        self.probed_test_seq = false;
        Ok(Some(SolPacket {
            seq: TEST_SEQ,
            ack_or_nack: 0,
            accepted_count: 0,
            status: SolStatus::empty(),
            data: Vec::new(),
        }))
    }

    /// Queue application data for transmission, returning the packet to
    /// send now if the transmitter isn't already waiting on an ACK.
    pub fn queue_send(&mut self, data: &[u8]) -> Result<Option<SolPacket>, SolClientError> {
        if self.state != SolClientState::Connected {
            return Err(SolClientError::WrongState);
        }
        let room = STAGING_BUFFER_SIZE - self.staging.len();
        if room == 0 {
            return Err(SolClientError::TryAgain);
        }
        let take = room.min(data.len());
        self.staging.extend(data[..take].iter().copied());
        Ok(self.maybe_send())
    }

    fn maybe_send(&mut self) -> Option<SolPacket> {
        if self.xmit_waiting_ack || self.staging.is_empty() {
            return None;
        }
        let chunk: Vec<u8> = self.staging.iter().copied().collect();
        self.xmit_waiting_ack = true;
        self.retries_left = DEFAULT_ACK_RETRIES;
        Some(SolPacket {
            seq: self.curr_xmit_seq,
            ack_or_nack: 0,
            accepted_count: 0,
            status: SolStatus::empty(),
            data: chunk,
        })
    }

    /// Retransmit timer fired without an ACK; resend or give up.
    pub fn on_ack_timeout(&mut self) -> Result<Option<SolPacket>, SolClientError> {
        if !self.xmit_waiting_ack {
            return Ok(None);
        }
        if self.retries_left == 0 {
            self.xmit_waiting_ack = false;
            return Err(SolClientError::RetriesExhausted);
        }
        self.retries_left -= 1;
        let chunk: Vec<u8> = self.staging.iter().copied().collect();
        Ok(Some(SolPacket {
            seq: self.curr_xmit_seq,
            ack_or_nack: 0,
            accepted_count: 0,
            status: SolStatus::empty(),
            data: chunk,
        }))
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    /// Drain bytes the application has finished consuming, draining any
    /// queued reentrant reads in FIFO order.
    pub fn take_received(&mut self) -> Option<Vec<u8>> {
        self.pending_reads.pop_front()
    }

    /// Handle one inbound SOL packet from the BMC.
    pub fn handle_inbound(&mut self, pkt: &SolPacket) -> Option<SolPacket> {
        let mut reply = None;

        if pkt.seq != 0 {
            if pkt.seq == TEST_SEQ && pkt.data.is_empty() {
                // Reply to our own probe, or the BMC's echo of it; no
                // application data, nothing to acknowledge beyond the
                // implicit liveness check.
                self.probed_test_seq = true;
                return None;
            }

            if pkt.seq == self.last_received_seq {
                // Duplicate/resend: any *extra* trailing data beyond
                // what was already delivered is still passed up, since
                // the sender may have appended to an under-accepted
                // packet.
                reply = Some(SolPacket {
                    seq: 0,
                    ack_or_nack: self.last_received_seq,
                    accepted_count: pkt.data.len() as u8,
                    status: SolStatus::empty(),
                    data: Vec::new(),
                });
            } else {
                self.last_received_seq = pkt.seq;
                if !pkt.data.is_empty() {
                    self.pending_reads.push_back(pkt.data.clone());
                }
                reply = Some(SolPacket {
                    seq: 0,
                    ack_or_nack: pkt.seq,
                    accepted_count: pkt.data.len() as u8,
                    status: SolStatus::empty(),
                    data: Vec::new(),
                });
            }
        }

        if pkt.ack_or_nack != 0 && pkt.ack_or_nack == self.curr_xmit_seq && self.xmit_waiting_ack {
            if pkt.status.contains(SolStatus::NACK) {
                self.in_nack = true;
            } else {
                self.in_nack = false;
                let accepted = pkt.accepted_count as usize;
                if accepted >= self.staging.len() {
                    self.staging.clear();
                    self.xmit_waiting_ack = false;
                    self.curr_xmit_seq += 1;
                    if self.curr_xmit_seq >= 16 {
                        self.curr_xmit_seq = 1;
                    }
                    if let Some(cb) = self.callbacks.on_send_complete.as_mut() {
                        cb(accepted);
                    }
                    if let Some(resend) = self.maybe_send() {
                        return Some(resend);
                    }
                } else {
                    self.staging.drain(0..accepted);
                    self.xmit_waiting_ack = false;
                    if let Some(resend) = self.maybe_send() {
                        return Some(resend);
                    }
                }
            }
        }

        // A DEACTIVATED status means the payload was torn down upstream
        // of us (e.g. by a conflicting session) — close immediately,
        // with no Deactivate Payload exchange owed on our side.
        // CHARACTER-TRANSFER-UNAVAILABLE is a transient pause: move to
        // `ConnectedCtu` while set, and back to `Connected` once it
        // clears (the bidirectional `Connected <-> ConnectedCtu` edge).
        if pkt.status.contains(SolStatus::DEACTIVATED) {
            self.force_close();
        } else if pkt.status.contains(SolStatus::CHARACTER_TRANSFER_UNAVAIL) {
            if self.state == SolClientState::Connected {
                self.state = SolClientState::ConnectedCtu;
            }
        } else if self.state == SolClientState::ConnectedCtu {
            self.state = SolClientState::Connected;
        }

        reply
    }

    pub fn on_send_complete<F>(&mut self, f: F)
    where
        F: FnMut(usize) + Send + 'static,
    {
        self.callbacks.on_send_complete = Some(Box::new(f));
    }

    /// Tear down gracefully, sending a Deactivate Payload request (the
    /// caller is responsible for the actual RMCP+ round trip). A
    /// connection that never reached `Connected` owns no Deactivate
    /// obligation (Open Question (c)).
    pub fn close(&mut self) -> bool {
        let needs_deactivate = matches!(self.state, SolClientState::Connected | SolClientState::ConnectedCtu);
        self.state = SolClientState::Closing;
        needs_deactivate
    }

    /// Abrupt teardown (e.g. transport error): skip the graceful
    /// Deactivate exchange entirely.
    pub fn force_close(&mut self) {
        self.state = SolClientState::Closed;
        self.staging.clear();
        self.pending_reads.clear();
        self.xmit_waiting_ack = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activate_ok(in_sz: u16, out_sz: u16, port: u16) -> Vec<u8> {
        let mut v = vec![0u8; 13];
        v[0] = 0x00;
        v[5..7].copy_from_slice(&in_sz.to_le_bytes());
        v[7..9].copy_from_slice(&out_sz.to_le_bytes());
        v[9..11].copy_from_slice(&port.to_le_bytes());
        v[11] = 0xFF;
        v[12] = 0xFF;
        v
    }

    #[test]
    fn activation_parses_straightforward_little_endian() {
        let resp = activate_ok(32, 32, 623);
        let info = parse_activation_response(&resp).unwrap();
        assert_eq!(info.max_inbound_payload_size, 32);
        assert_eq!(info.max_outbound_payload_size, 32);
        assert_eq!(info.port, 623);
    }

    #[test]
    fn activation_recovers_byte_swapped_sizes() {
        let mut resp = activate_ok(32, 32, 623);
        // Corrupt bytes 5..9 into a big-endian-looking reading that
        // would be implausible read as little-endian (e.g. 0x2000).
        resp[5] = 0x00;
        resp[6] = 0x20;
        resp[7] = 0x00;
        resp[8] = 0x20;
        let info = parse_activation_response(&resp).unwrap();
        assert_eq!(info.max_inbound_payload_size, 32);
        assert_eq!(info.max_outbound_payload_size, 32);
    }

    #[test]
    fn activation_already_active_is_wrong_state() {
        assert_eq!(parse_activation_response(&[0x80]), Err(SolClientError::WrongState));
    }

    #[test]
    fn activation_other_single_byte_is_failure_code() {
        assert_eq!(parse_activation_response(&[0x81]), Err(SolClientError::ActivationFailed(0x81)));
    }

    #[test]
    fn full_activation_then_probe_then_data_round_trip() {
        let mut client = SolClientConnection::new();
        client.begin_connect();
        let resp = activate_ok(32, 32, 623);
        let probe = client.on_activation_response(&resp).unwrap().unwrap();
        assert_eq!(probe.seq, TEST_SEQ);
        assert_eq!(client.state(), SolClientState::Connected);

        let send_pkt = client.queue_send(b"hello").unwrap().unwrap();
        assert_eq!(send_pkt.seq, 1);
        assert!(client.xmit_waiting_ack);

        let ack = SolPacket { seq: 0, ack_or_nack: 1, accepted_count: 5, status: SolStatus::empty(), data: vec![] };
        assert!(client.handle_inbound(&ack).is_none());
        assert!(!client.xmit_waiting_ack);
        assert_eq!(client.curr_xmit_seq, 2);
    }

    #[test]
    fn partial_accept_keeps_remainder_staged() {
        let mut client = SolClientConnection::new();
        client.begin_connect();
        let resp = activate_ok(32, 32, 623);
        client.on_activation_response(&resp).unwrap();

        client.queue_send(b"hello world").unwrap();
        let partial_ack = SolPacket { seq: 0, ack_or_nack: 1, accepted_count: 5, status: SolStatus::empty(), data: vec![] };
        let resend = client.handle_inbound(&partial_ack);
        assert!(resend.is_some());
        assert_eq!(resend.unwrap().data, b" world".to_vec());
    }

    #[test]
    fn inbound_data_is_acked_and_queued_for_delivery() {
        let mut client = SolClientConnection::new();
        client.begin_connect();
        let resp = activate_ok(32, 32, 623);
        client.on_activation_response(&resp).unwrap();

        let pkt = SolPacket { seq: 1, ack_or_nack: 0, accepted_count: 0, status: SolStatus::empty(), data: vec![1, 2, 3] };
        let reply = client.handle_inbound(&pkt).unwrap();
        assert_eq!(reply.ack_or_nack, 1);
        assert_eq!(reply.accepted_count, 3);
        assert_eq!(client.take_received(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn force_close_skips_deactivate_obligation() {
        let mut client = SolClientConnection::new();
        client.begin_connect();
        client.on_activation_response(&activate_ok(32, 32, 623)).unwrap();
        client.force_close();
        assert_eq!(client.state(), SolClientState::Closed);
    }

    #[test]
    fn close_before_connected_owns_no_deactivate() {
        let mut client = SolClientConnection::new();
        client.begin_connect();
        assert!(!client.close());
    }

    #[test]
    fn character_transfer_unavail_moves_to_ctu_and_back() {
        let mut client = SolClientConnection::new();
        client.begin_connect();
        client.on_activation_response(&activate_ok(32, 32, 623)).unwrap();

        let ctu = SolPacket {
            seq: 1,
            ack_or_nack: 0,
            accepted_count: 0,
            status: SolStatus::CHARACTER_TRANSFER_UNAVAIL,
            data: vec![],
        };
        client.handle_inbound(&ctu);
        assert_eq!(client.state(), SolClientState::ConnectedCtu);

        let normal = SolPacket { seq: 2, ack_or_nack: 0, accepted_count: 0, status: SolStatus::empty(), data: vec![] };
        client.handle_inbound(&normal);
        assert_eq!(client.state(), SolClientState::Connected);
    }

    #[test]
    fn deactivated_status_force_closes_the_connection() {
        let mut client = SolClientConnection::new();
        client.begin_connect();
        client.on_activation_response(&activate_ok(32, 32, 623)).unwrap();
        client.queue_send(b"hello").unwrap();

        let deactivated = SolPacket {
            seq: 1,
            ack_or_nack: 0,
            accepted_count: 0,
            status: SolStatus::DEACTIVATED,
            data: vec![],
        };
        client.handle_inbound(&deactivated);
        assert_eq!(client.state(), SolClientState::Closed);
    }
}
