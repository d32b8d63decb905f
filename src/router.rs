//! Multi-channel message router (C7) — "the hard part".
//!
//! Grounded on `lanserv/bmc.c`'s dispatch logic (as described by the
//! channel `handle_send_msg`/`return_rsp`/`recv_in_q` hooks in
//! `lanserv.h`) and `lanserv/ipmb_ipmi.c`'s send/receive framing. Five
//! routes, tried in priority order: send-to-host (R1), response path
//! (R2), command-to-MC (R3), Send Message tunneling (R4), disabled
//! target (R5).

use crate::channel::{Address, Mc, Message, SessionSupport, SYSTEM_INTERFACE_CHANNEL};
use crate::error::CompletionCode;
use crate::ipmb::IpmbFrame;
use std::collections::HashMap;

/// Receive-queue capacity per channel, matching the IPMI "Get Message"
/// queue depth convention used throughout this stack.
const RECV_QUEUE_CAPACITY: usize = 16;

pub type HandlerResult = Result<Vec<u8>, CompletionCode>;
pub type Handler = Box<dyn Fn(&mut Mc, &Message) -> HandlerResult + Send + Sync>;

/// Dispatch key: group-extension and IANA-OEM entries are modeled as
/// ordinary `(netfn, cmd)` keys looked up *after* the selector/IANA
/// prefix has already been stripped from the payload by the router, so
/// the handler table itself stays a flat map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct DispatchKey {
    netfn: u8,
    cmd: u8,
}

/// Netfn values that use the group-extension convention: the first
/// payload byte is a group selector consumed before dispatch.
const GROUP_EXTENSION_NETFNS: &[u8] = &[0x2C, 0x2D];
/// Netfn values that carry a 3-byte IANA enterprise-number prefix
/// consumed before dispatch and re-inserted on the response.
const IANA_OEM_NETFNS: &[u8] = &[0x2E, 0x2F];

pub struct Router {
    mcs: HashMap<u8, Mc>,
    handlers: HashMap<DispatchKey, Handler>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Router {
            mcs: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    pub fn add_mc(&mut self, mc: Mc) {
        self.mcs.insert(mc.ipmb_addr, mc);
    }

    pub fn mc(&self, addr: u8) -> Option<&Mc> {
        self.mcs.get(&addr)
    }

    pub fn mc_mut(&mut self, addr: u8) -> Option<&mut Mc> {
        self.mcs.get_mut(&addr)
    }

    pub fn register_handler(&mut self, netfn: u8, cmd: u8, handler: Handler) {
        self.handlers.insert(DispatchKey { netfn, cmd }, handler);
    }

    fn dest_slave_addr(addr: Address) -> Option<u8> {
        match addr {
            Address::Ipmb { slave_addr, .. } => Some(slave_addr),
            _ => None,
        }
    }

    /// Route one message to completion, returning the completion code
    /// that should be reflected back to the sender (`0x00` on success).
    pub fn route(&mut self, mut msg: Message) -> CompletionCode {
        // R1: dst_lun == 2 means "deliver to the host via the system
        // interface's receive queue", regardless of netfn/cmd.
        if msg.dst_lun == 2 {
            return self.route_send_to_host(msg);
        }

        // R2: response netfn goes through the sequence table.
        if msg.is_response() {
            return self.route_response(msg);
        }

        // R4 takes priority over local dispatch: a Send Message command
        // (netfn 0x06, cmd 0x34) arriving on the system interface channel
        // tunnels to another channel.
        const APP_NETFN: u8 = 0x06;
        const SEND_MESSAGE_CMD: u8 = 0x34;
        if msg.origin_channel == SYSTEM_INTERFACE_CHANNEL && msg.netfn == APP_NETFN && msg.cmd == SEND_MESSAGE_CMD {
            return self.route_send_message(msg);
        }

        // R5: an IPMB-addressed target MC that's disabled is rejected
        // before we even look at handlers.
        if let Some(slave) = Self::dest_slave_addr(msg.dst_addr) {
            match self.mcs.get(&slave) {
                Some(mc) if !mc.enabled => return CompletionCode::Unspecified,
                None => return CompletionCode::Unspecified,
                _ => {}
            }
        }

        // R3: command-to-MC, with group-extension / IANA-OEM prefix
        // stripping taking priority over the generic table.
        self.route_command(&mut msg)
    }

    fn route_send_to_host(&mut self, mut msg: Message) -> CompletionCode {
        let host_mc = match self.mcs.get_mut(&host_ipmb_addr(&msg)) {
            Some(mc) => mc,
            None => return CompletionCode::Unspecified,
        };

        // A session-oriented source (LAN or any session-capable channel)
        // gets its request tracked: reserve a sequence slot and
        // overwrite the outbound rq_seq so the eventual response can be
        // correlated back through R2/C4.
        let session_oriented = host_mc
            .channel(msg.origin_channel)
            .map(|c| c.session_support != SessionSupport::SessionLess)
            .unwrap_or(false);
        if session_oriented {
            match host_mc.seq_table.reserve(msg.seq, msg.origin_channel, msg.session_id) {
                Ok(new_seq) => {
                    msg.seq = new_seq;
                    msg.tracked = true;
                }
                Err(_) => return CompletionCode::OutOfSpace,
            }
        }

        let Some(chan) = host_mc.channel_mut(SYSTEM_INTERFACE_CHANNEL) else {
            return CompletionCode::Unspecified;
        };
        match chan.push_recv(msg, RECV_QUEUE_CAPACITY) {
            Ok(()) => CompletionCode::Ok,
            Err(()) => CompletionCode::OutOfSpace,
        }
    }

    fn route_response(&mut self, msg: Message) -> CompletionCode {
        let mc = match self.mcs.get_mut(&host_ipmb_addr(&msg)) {
            Some(mc) => mc,
            None => return CompletionCode::NotPresent,
        };
        match mc.seq_table.find(msg.seq) {
            Ok(restored) => {
                let mut out_msg = msg;
                out_msg.seq = restored.orig_seq;
                out_msg.session_id = restored.orig_sid;
                if let Some(chan) = mc.channel_mut(restored.orig_channel) {
                    let _ = chan.push_recv(out_msg, RECV_QUEUE_CAPACITY);
                }
                CompletionCode::Ok
            }
            Err(_) => CompletionCode::NotPresent,
        }
    }

    /// Strip a group-extension/IANA-OEM prefix, look up a handler by
    /// `{netfn, cmd}`, and invoke it. Returns the handler's raw response
    /// payload alongside the completion code; does not enqueue anything
    /// anywhere — callers decide where the response belongs (R3 delivers
    /// it back onto the request's own channel, R4 re-packages it onto
    /// the tunneling originator's channel).
    fn dispatch(&mut self, msg: &mut Message) -> (CompletionCode, Vec<u8>) {
        let mut netfn = msg.netfn;
        let mut cmd = msg.cmd;
        let mut stripped = 0usize;

        if GROUP_EXTENSION_NETFNS.contains(&netfn) {
            if msg.payload.is_empty() {
                return (CompletionCode::DataLengthInvalid, Vec::new());
            }
            // The selector byte itself becomes part of the dispatch key
            // via `cmd`'s high bits in the original; here we fold it
            // into a synthetic cmd so distinct group selectors land in
            // distinct table slots without widening DispatchKey.
            let selector = msg.payload[0];
            cmd = cmd.wrapping_add(selector);
            stripped = 1;
        } else if IANA_OEM_NETFNS.contains(&netfn) {
            if msg.payload.len() < 3 {
                return (CompletionCode::DataLengthInvalid, Vec::new());
            }
            msg.iana = Some([msg.payload[0], msg.payload[1], msg.payload[2]]);
            stripped = 3;
        }

        let Some(slave) = Self::dest_slave_addr(msg.dst_addr) else {
            return (CompletionCode::Unspecified, Vec::new());
        };
        let Some(mc) = self.mcs.get_mut(&slave) else {
            return (CompletionCode::Unspecified, Vec::new());
        };
        if !mc.enabled {
            return (CompletionCode::Unspecified, Vec::new());
        }

        let key = DispatchKey { netfn, cmd };
        let Some(handler) = self.handlers.get(&key) else {
            return (CompletionCode::InvalidCommand, Vec::new());
        };

        let mut call_msg = msg.clone();
        call_msg.payload.drain(0..stripped);

        match handler(mc, &call_msg) {
            Ok(response_payload) => (CompletionCode::Ok, response_payload),
            Err(cc) => (cc, Vec::new()),
        }
    }

    /// R3: dispatch `msg` to its target MC's handler and deliver the
    /// response (completion code + payload, IANA prefix reinserted)
    /// back onto the request's own origin channel recv queue — the
    /// literal §8 "IPMB broadcast Get Device ID" scenario.
    fn route_command(&mut self, msg: &mut Message) -> CompletionCode {
        let (cc, response_payload) = self.dispatch(msg);

        let Some(slave) = Self::dest_slave_addr(msg.dst_addr) else {
            return cc;
        };
        let Some(mc) = self.mcs.get_mut(&slave) else {
            return cc;
        };

        let mut payload = vec![cc.code()];
        if let Some(iana) = msg.iana {
            payload.extend_from_slice(&iana);
        }
        payload.extend_from_slice(&response_payload);

        let response = Message {
            dst_addr: msg.src_addr,
            dst_lun: msg.src_lun,
            src_addr: msg.dst_addr,
            src_lun: msg.dst_lun,
            netfn: msg.netfn | 1,
            cmd: msg.cmd,
            seq: msg.seq,
            session_id: msg.session_id,
            payload,
            origin_channel: msg.origin_channel,
            tracked: false,
            payload_type: msg.payload_type,
            iana: msg.iana,
        };
        if let Some(chan) = mc.channel_mut(msg.origin_channel) {
            let _ = chan.push_recv(response, RECV_QUEUE_CAPACITY);
        }
        cc
    }

    /// R4: unwrap the tunneled IPMB frame from the Send Message payload
    /// (`payload[0]` is the destination channel selector, `payload[1..]`
    /// the IPMB frame itself), dispatch it to the real target MC, and
    /// re-package the handler's response as an IPMB-shaped message
    /// delivered back onto the originator's own recv queue. Grounded on
    /// `bmc.c`'s `ipmb_handle_send_msg`/`ipmb_format_lun_2`.
    fn route_send_message(&mut self, msg: Message) -> CompletionCode {
        // Minimum length past the opcode byte per §4.3 R4: a channel
        // selector byte plus a full IPMB frame.
        if msg.payload.len() < 8 {
            return CompletionCode::DataLengthInvalid;
        }

        let frame = match IpmbFrame::decode(&msg.payload[1..]) {
            Ok(frame) => frame,
            Err(_) => return CompletionCode::DataLengthInvalid,
        };

        let target_enabled = self.mcs.get(&frame.rs_addr).map(|mc| mc.enabled).unwrap_or(false);
        if !target_enabled {
            return CompletionCode::NakOnWrite;
        }

        if frame.netfn & 1 == 1 {
            // The tunneled payload is itself a response; unsupported.
            return CompletionCode::Unspecified;
        }

        let mut inner = Message {
            dst_addr: Address::Ipmb { channel: msg.payload[0], slave_addr: frame.rs_addr, lun: frame.rs_lun },
            dst_lun: frame.rs_lun,
            src_addr: msg.src_addr,
            src_lun: frame.rq_lun,
            netfn: frame.netfn,
            cmd: frame.cmd,
            seq: frame.rq_seq,
            session_id: msg.session_id,
            payload: frame.data.clone(),
            origin_channel: msg.origin_channel,
            tracked: msg.tracked,
            payload_type: msg.payload_type,
            iana: None,
        };

        // Tracked requests reserve their sequence slot on the
        // originator (the host MC that received the Send Message), not
        // on the target — the response is correlated back here.
        if msg.tracked {
            let Some(host_mc) = self.mcs.get_mut(&host_ipmb_addr(&msg)) else {
                return CompletionCode::Unspecified;
            };
            match host_mc.seq_table.reserve(frame.rq_seq, msg.origin_channel, msg.session_id) {
                Ok(new_seq) => inner.seq = new_seq,
                Err(_) => return CompletionCode::OutOfSpace,
            }
        }

        let (cc, response_payload) = self.dispatch(&mut inner);

        if let Some(origin_mc) = self.mcs.get_mut(&host_ipmb_addr(&msg)) {
            if let Some(chan) = origin_mc.channel_mut(msg.origin_channel) {
                let mut payload = vec![cc.code()];
                payload.extend_from_slice(&response_payload);
                let response = Message {
                    dst_addr: msg.src_addr,
                    dst_lun: frame.rq_lun,
                    src_addr: Address::Ipmb { channel: msg.payload[0], slave_addr: frame.rs_addr, lun: frame.rs_lun },
                    src_lun: frame.rs_lun,
                    netfn: frame.netfn | 1,
                    cmd: frame.cmd,
                    seq: frame.rq_seq,
                    session_id: msg.session_id,
                    payload,
                    origin_channel: msg.origin_channel,
                    tracked: false,
                    payload_type: msg.payload_type,
                    iana: None,
                };
                let _ = chan.push_recv(response, RECV_QUEUE_CAPACITY);
            }
        }

        CompletionCode::Ok
    }
}

/// In the absence of a full "which MC owns channel 15" registry, route
/// send-to-host and response traffic to the IPMB address carried in the
/// message's destination — channel 15 is conventionally hosted on the
/// BMC, address `0x20`, matching the default in `lanserv.h`'s
/// `sys_data_s::bmc_ipmb`.
fn host_ipmb_addr(_msg: &Message) -> u8 {
    0x20
}
