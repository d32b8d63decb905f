//! RMCP+ session table (C5).
//!
//! Grounded on `lanserv/OpenIPMI/lanserv.h`'s `session_s` /
//! `lanserv_data_s`: a fixed table of 64 slots (index 0 reserved,
//! `MAX_SESSIONS == 63`), a 4-stage authentication state machine, a
//! sliding sequence-number replay window, a per-session inactivity
//! timer, and up to `LANSERV_NUM_CLOSERS` (3) callbacks run when a
//! session is torn down.

use crate::auth::{hmac_sha1, hmac_sha1_verify};
use crate::error::SessionError;
use rand::RngCore;
use std::net::SocketAddr;

pub const MAX_SESSIONS: usize = 63;
pub const NUM_CLOSERS: usize = 3;
/// Width of the sequence-number replay window (accept seq in
/// `(recv_seq - WINDOW, recv_seq]` if not already seen).
const SEQ_WINDOW: u32 = 16;
/// Inactivity timeout a freshly created session starts with, matching
/// the original's default session-setup timeout (60 seconds) — long
/// enough to complete the RMCP+ Open Session/RAKP1..4 exchange before
/// the 1 Hz tick would otherwise tear it down unauthenticated.
pub const SESSION_SETUP_TIMEOUT_SECONDS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Uninitiated,
    Opened,
    Rakp1,
    Authenticated,
}

/// Which payload type an associated MC is registered for (e.g. SOL),
/// used as half of the `(session_id, payload_kind)` uniqueness key in
/// `set_associated_mc`.
pub type PayloadKind = u8;
pub type McHandle = u32;

/// A registered callback, run when the session closes. Stored as a
/// type-erased closure rather than a raw function pointer + MC handle
/// pair (the original's `struct { close_cb, close_cb_data, mc }`),
/// since Rust closures can already capture the MC handle.
pub type CloseCallback = Box<dyn FnMut(u32) + Send>;

#[derive(Default)]
struct Closers {
    slots: Vec<(McHandle, CloseCallback)>,
}

impl Closers {
    fn add(&mut self, mc: McHandle, cb: CloseCallback) -> Result<(), SessionError> {
        if self.slots.len() >= NUM_CLOSERS {
            return Err(SessionError::CloserListFull);
        }
        self.slots.push((mc, cb));
        Ok(())
    }

    fn fire_all(&mut self, session_id: u32) {
        for (_, cb) in self.slots.iter_mut() {
            cb(session_id);
        }
        self.slots.clear();
    }

    fn has_mc(&self, mc: McHandle) -> bool {
        self.slots.iter().any(|(m, _)| *m == mc)
    }
}

pub struct Session {
    pub handle: u8,
    pub active: bool,
    pub sid: u32,
    pub remote_sid: u32,
    pub state: SessionState,

    pub recv_seq: u32,
    pub xmit_seq: u32,
    pub unauth_recv_seq: u32,
    pub unauth_xmit_seq: u32,
    /// Bitmask of the `SEQ_WINDOW` sequence numbers below `recv_seq`
    /// that have already been seen, to reject duplicates within the
    /// backward window.
    seen_window: u32,

    pub userid: u8,
    pub role: u8,
    pub auth_algo: u8,
    pub integ_algo: u8,
    pub conf_algo: u8,

    pub sik: [u8; 20],
    pub k1: [u8; 20],
    pub k2: [u8; 20],
    pub rand: [u8; 16],
    pub rem_rand: [u8; 16],

    pub privilege: u8,
    pub max_priv: u8,

    pub time_left_seconds: u32,
    pub src_addr: Option<SocketAddr>,

    closers: Closers,
    /// `(payload_kind, mc)` pairs currently associated with this session,
    /// enforcing "at most one MC per (session_id, payload_kind)".
    associated: Vec<(PayloadKind, McHandle)>,

    /// The remote console's username, as sent in RAKP message 1. Used as
    /// part of every RAKP integrity check and SIK derivation.
    pub username: Vec<u8>,
}

impl Session {
    fn new(handle: u8) -> Self {
        Session {
            handle,
            active: false,
            sid: 0,
            remote_sid: 0,
            state: SessionState::Uninitiated,
            recv_seq: 0,
            xmit_seq: 0,
            unauth_recv_seq: 0,
            unauth_xmit_seq: 0,
            seen_window: 0,
            userid: 0,
            role: 0,
            auth_algo: 0,
            integ_algo: 0,
            conf_algo: 0,
            sik: [0; 20],
            k1: [0; 20],
            k2: [0; 20],
            rand: [0; 16],
            rem_rand: [0; 16],
            privilege: 0,
            max_priv: 0,
            time_left_seconds: 0,
            src_addr: None,
            closers: Closers::default(),
            associated: Vec::new(),
            username: Vec::new(),
        }
    }

    /// Accept-or-reject an inbound sequence number against the replay
    /// window, advancing `recv_seq` and the seen-bitmap on acceptance.
    /// `recv_seq` MUST NOT decrease while the session is active.
    pub fn accept_sequence(&mut self, seq: u32) -> bool {
        if seq > self.recv_seq {
            let advance = seq - self.recv_seq;
            if advance >= SEQ_WINDOW {
                self.seen_window = 1; // only the new seq itself is "seen"
            } else {
                self.seen_window = (self.seen_window << advance) | 1;
            }
            self.recv_seq = seq;
            true
        } else {
            let back = self.recv_seq - seq;
            if back == 0 || back >= SEQ_WINDOW {
                false
            } else {
                let bit = 1u32 << back;
                if self.seen_window & bit != 0 {
                    false
                } else {
                    self.seen_window |= bit;
                    true
                }
            }
        }
    }

    pub fn register_closer(&mut self, mc: McHandle, cb: CloseCallback) -> Result<(), SessionError> {
        self.closers.add(mc, cb)
    }

    fn reset(&mut self) {
        let handle = self.handle;
        *self = Session::new(handle);
    }

    /// Process RAKP message 1: record the remote console's session ID,
    /// random number, requested privilege, and username, and advance
    /// `Opened -> Rakp1`. Must follow an `Opened` session (the RMCP+
    /// Open Session Request/Response exchange, handled above this layer).
    pub fn begin_rakp1(
        &mut self,
        remote_sid: u32,
        remote_rand: [u8; 16],
        requested_priv: u8,
        username: &[u8],
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Opened {
            return Err(SessionError::WrongState);
        }
        self.remote_sid = remote_sid;
        self.rem_rand = remote_rand;
        self.max_priv = requested_priv;
        self.username = username.to_vec();
        self.state = SessionState::Rakp1;
        Ok(())
    }

    /// Build the RAKP message 2 key-exchange auth code: HMAC-SHA1 over
    /// `remote_sid || sid || rem_rand || rand || bmc_guid || requested_priv
    /// || username_len || username`, keyed by the user's password (or Kg).
    /// `self.rand` is sent alongside this tag as the BMC's random number.
    pub fn rakp2_auth_code(&self, password: &[u8], bmc_guid: &[u8; 16]) -> [u8; 20] {
        let mut data = Vec::with_capacity(4 + 4 + 16 + 16 + 16 + 1 + 1 + self.username.len());
        data.extend_from_slice(&self.remote_sid.to_le_bytes());
        data.extend_from_slice(&self.sid.to_le_bytes());
        data.extend_from_slice(&self.rem_rand);
        data.extend_from_slice(&self.rand);
        data.extend_from_slice(bmc_guid);
        data.push(self.max_priv);
        data.push(self.username.len() as u8);
        data.extend_from_slice(&self.username);
        hmac_sha1(password, &data)
    }

    /// Verify RAKP message 3's integrity tag against the expected
    /// `rand || sid || requested_priv || username_len || username` HMAC.
    /// On success, derives the session integrity key and K1/K2, raises
    /// the session to its requested privilege, and advances to
    /// `Authenticated`. On failure the session stays in `Rakp1` so the
    /// caller can retry or tear it down.
    pub fn verify_rakp3(&mut self, password: &[u8], peer_tag: &[u8]) -> Result<(), SessionError> {
        if self.state != SessionState::Rakp1 {
            return Err(SessionError::WrongState);
        }
        let mut data = Vec::with_capacity(16 + 4 + 1 + 1 + self.username.len());
        data.extend_from_slice(&self.rand);
        data.extend_from_slice(&self.sid.to_le_bytes());
        data.push(self.max_priv);
        data.push(self.username.len() as u8);
        data.extend_from_slice(&self.username);
        if !hmac_sha1_verify(password, &data, peer_tag) {
            return Err(SessionError::AuthFailed);
        }

        let mut sik_data = Vec::with_capacity(16 + 16 + 1 + 1 + self.username.len());
        sik_data.extend_from_slice(&self.rem_rand);
        sik_data.extend_from_slice(&self.rand);
        sik_data.push(self.max_priv);
        sik_data.push(self.username.len() as u8);
        sik_data.extend_from_slice(&self.username);
        self.sik = hmac_sha1(password, &sik_data);
        self.k1 = hmac_sha1(&self.sik, &[0x01; 20]);
        self.k2 = hmac_sha1(&self.sik, &[0x02; 20]);

        self.privilege = self.max_priv;
        self.state = SessionState::Authenticated;
        Ok(())
    }

    /// Build the RAKP message 4 auth code confirming activation:
    /// HMAC-SHA1 over `rem_rand || sid || bmc_guid`, keyed by SIK.
    pub fn rakp4_auth_code(&self, bmc_guid: &[u8; 16]) -> [u8; 20] {
        let mut data = Vec::with_capacity(16 + 4 + 16);
        data.extend_from_slice(&self.rem_rand);
        data.extend_from_slice(&self.sid.to_le_bytes());
        data.extend_from_slice(bmc_guid);
        hmac_sha1(&self.sik, &data)
    }
}

pub struct SessionTable {
    /// Index 0 is unused (matches `session 0 is not used`); valid
    /// handles are `1..=MAX_SESSIONS`.
    sessions: Vec<Session>,
    last_session: usize,
    next_sid_seq: u32,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        let sessions = (0..=MAX_SESSIONS).map(|i| Session::new(i as u8)).collect();
        SessionTable {
            sessions,
            last_session: 0,
            next_sid_seq: 1,
        }
    }

    fn generate_sid(&mut self, handle: u8) -> u32 {
        let seq = self.next_sid_seq;
        self.next_sid_seq = self.next_sid_seq.wrapping_add(1);
        ((seq & 0x00FF_FFFF) << 8) | handle as u32
    }

    /// Allocate a free session slot, round-robin from the last handle
    /// picked, and move it to `Opened`.
    pub fn create_session(&mut self, src_addr: Option<SocketAddr>) -> Result<u8, SessionError> {
        for offset in 1..=MAX_SESSIONS {
            let idx = 1 + (self.last_session + offset - 1) % MAX_SESSIONS;
            if !self.sessions[idx].active {
                let sid = self.generate_sid(idx as u8);
                let session = &mut self.sessions[idx];
                session.active = true;
                session.sid = sid;
                session.state = SessionState::Opened;
                session.src_addr = src_addr;
                session.time_left_seconds = SESSION_SETUP_TIMEOUT_SECONDS;
                // The local random number sent in RAKP message 2, fed
                // into SIK/K1/K2 derivation alongside the remote's.
                rand::thread_rng().fill_bytes(&mut session.rand);
                self.last_session = idx;
                return Ok(idx as u8);
            }
        }
        Err(SessionError::TableFull)
    }

    pub fn get(&self, handle: u8) -> Option<&Session> {
        self.sessions.get(handle as usize).filter(|s| s.active)
    }

    pub fn get_mut(&mut self, handle: u8) -> Option<&mut Session> {
        self.sessions.get_mut(handle as usize).filter(|s| s.active)
    }

    pub fn find_by_sid(&self, sid: u32) -> Option<&Session> {
        self.sessions.iter().find(|s| s.active && s.sid == sid)
    }

    pub fn find_by_sid_mut(&mut self, sid: u32) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.active && s.sid == sid)
    }

    /// Drive `handle`'s session through RAKP message 1 (`Opened -> Rakp1`).
    pub fn begin_rakp1(
        &mut self,
        handle: u8,
        remote_sid: u32,
        remote_rand: [u8; 16],
        requested_priv: u8,
        username: &[u8],
    ) -> Result<(), SessionError> {
        self.get_mut(handle)
            .ok_or(SessionError::NotActive(handle))?
            .begin_rakp1(remote_sid, remote_rand, requested_priv, username)
    }

    /// Compute `handle`'s RAKP message 2 key-exchange auth code.
    pub fn rakp2_auth_code(
        &self,
        handle: u8,
        password: &[u8],
        bmc_guid: &[u8; 16],
    ) -> Result<[u8; 20], SessionError> {
        Ok(self
            .get(handle)
            .ok_or(SessionError::NotActive(handle))?
            .rakp2_auth_code(password, bmc_guid))
    }

    /// Verify `handle`'s RAKP message 3 and, on success, advance it to
    /// `Authenticated`.
    pub fn verify_rakp3(
        &mut self,
        handle: u8,
        password: &[u8],
        peer_tag: &[u8],
    ) -> Result<(), SessionError> {
        self.get_mut(handle)
            .ok_or(SessionError::NotActive(handle))?
            .verify_rakp3(password, peer_tag)
    }

    /// Compute `handle`'s RAKP message 4 auth code.
    pub fn rakp4_auth_code(&self, handle: u8, bmc_guid: &[u8; 16]) -> Result<[u8; 20], SessionError> {
        Ok(self
            .get(handle)
            .ok_or(SessionError::NotActive(handle))?
            .rakp4_auth_code(bmc_guid))
    }

    /// Associate `mc` with `session_id` for `payload_kind`. At most one
    /// MC may be associated per `(session_id, payload_kind)`; a second
    /// attempt returns `Busy`.
    pub fn set_associated_mc(
        &mut self,
        session_id: u32,
        payload_kind: PayloadKind,
        mc: McHandle,
        close_cb: CloseCallback,
    ) -> Result<(), SessionError> {
        let session = self
            .find_by_sid_mut(session_id)
            .ok_or(SessionError::NotActive(0))?;
        if session.associated.iter().any(|(k, _)| *k == payload_kind) {
            return Err(SessionError::Busy);
        }
        session.register_closer(mc, close_cb)?;
        session.associated.push((payload_kind, mc));
        Ok(())
    }

    pub fn clear_associated_mc(&mut self, session_id: u32, payload_kind: PayloadKind) {
        if let Some(session) = self.find_by_sid_mut(session_id) {
            session.associated.retain(|(k, _)| *k != payload_kind);
        }
    }

    pub fn get_associated_mc(&self, session_id: u32, payload_kind: PayloadKind) -> Option<McHandle> {
        self.find_by_sid(session_id)?
            .associated
            .iter()
            .find(|(k, _)| *k == payload_kind)
            .map(|(_, mc)| *mc)
    }

    /// Decrement every active session's inactivity timer by one second;
    /// sessions reaching zero fire their closers and free their slot.
    pub fn tick(&mut self) {
        for session in self.sessions.iter_mut().skip(1) {
            if !session.active {
                continue;
            }
            if session.time_left_seconds > 0 {
                session.time_left_seconds -= 1;
            }
            if session.time_left_seconds == 0 {
                let sid = session.sid;
                session.closers.fire_all(sid);
                session.reset();
            }
        }
    }

    /// Force-close a session immediately, running its closers.
    pub fn close(&mut self, handle: u8) {
        if let Some(session) = self.sessions.get_mut(handle as usize) {
            if session.active {
                let sid = session.sid;
                session.closers.fire_all(sid);
                session.reset();
            }
        }
    }
}
