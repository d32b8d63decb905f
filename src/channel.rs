//! Channel / MC model (C6).
//!
//! Grounded on `lanserv/OpenIPMI/lanserv.h`'s `channel_s`/`lmc_data_s`
//! (not shown directly here but referenced by `sys_data_s`): a channel
//! owns a receive queue and an attention line, is tagged with a medium
//! and protocol type, and is either session-less, single-session, or
//! multi-session. Channel 15 is always the BMC's system interface.

use crate::seqtable::SequenceTable;
use bitflags::bitflags;
use std::collections::VecDeque;
use uuid::Uuid;

pub const SYSTEM_INTERFACE_CHANNEL: u8 = 15;
pub const MAX_CHANNELS: usize = 16;

bitflags! {
    /// Mirrors the `HW_OP_*` bitmask in `lanserv.h` (`hw_capabilities`).
    #[derive(Default)]
    pub struct HwOpCapability: u32 {
        const RESET              = 1 << 0;
        const POWER_ON           = 1 << 1;
        const POWER_OFF          = 1 << 2;
        const SEND_NMI           = 1 << 3;
        const IRQ_ENABLE         = 1 << 4;
        const IRQ_DISABLE        = 1 << 5;
        const GRACEFUL_SHUTDOWN  = 1 << 6;
        const CHECK_POWER        = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSupport {
    SessionLess,
    SingleSession,
    MultiSession,
}

/// Tagged source/destination address, matching §3's `Address` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    SystemInterface { channel: u8, lun: u8 },
    Ipmb { channel: u8, slave_addr: u8, lun: u8 },
    Lan { channel: u8, privilege: u8, session_handle: u8, remote_swid: u8, local_swid: u8, lun: u8 },
    RmcppSol,
}

/// The message envelope routed between channels, sessions, and MCs.
#[derive(Debug, Clone)]
pub struct Message {
    pub dst_addr: Address,
    pub dst_lun: u8,
    pub src_addr: Address,
    pub src_lun: u8,
    pub netfn: u8,
    pub cmd: u8,
    pub seq: u8,
    pub session_id: u32,
    pub payload: Vec<u8>,
    pub origin_channel: u8,
    pub tracked: bool,
    pub payload_type: u8,
    /// IANA OEM prefix stripped during R3 dispatch, reinserted on the
    /// response (3 bytes, little-endian enterprise number).
    pub iana: Option<[u8; 3]>,
}

impl Message {
    /// True when `netfn` denotes a response netfn (odd LSB in the
    /// standard IPMI convention: requests use even netfn, responses the
    /// following odd value).
    pub fn is_response(&self) -> bool {
        self.netfn & 1 == 1
    }
}

/// One IPMI channel. Owns a receive queue and tracks whether the
/// attention line (the out-of-band "you have a message" signal) is
/// raised.
pub struct Channel {
    pub number: u8,
    pub medium_type: u8,
    pub protocol_type: u8,
    pub session_support: SessionSupport,
    pub session_count: u8,
    pub recv_queue: VecDeque<Message>,
    pub attention_line: bool,
    pub managed_mc: Option<u32>,
    pub hw_capabilities: HwOpCapability,
}

impl Channel {
    pub fn new(number: u8, medium_type: u8, protocol_type: u8, session_support: SessionSupport) -> Self {
        Channel {
            number,
            medium_type,
            protocol_type,
            session_support,
            session_count: 0,
            recv_queue: VecDeque::new(),
            attention_line: false,
            managed_mc: None,
            hw_capabilities: HwOpCapability::empty(),
        }
    }

    /// Append a message to the receive queue and raise the attention
    /// line, returning `Err` (mapped to completion code `0xC4` by the
    /// caller) if the queue is already at capacity.
    pub fn push_recv(&mut self, msg: Message, capacity: usize) -> Result<(), ()> {
        if self.recv_queue.len() >= capacity {
            return Err(());
        }
        self.recv_queue.push_back(msg);
        self.attention_line = true;
        Ok(())
    }

    pub fn pop_recv(&mut self) -> Option<Message> {
        let msg = self.recv_queue.pop_front();
        if self.recv_queue.is_empty() {
            self.attention_line = false;
        }
        msg
    }
}

/// A single managed controller. `ipmb_addr` uniquely identifies it; at
/// most one MC exists per IPMB address (enforced by the owning
/// registry, not by this type).
pub struct Mc {
    pub ipmb_addr: u8,
    pub enabled: bool,
    pub device_id: u8,
    pub fw_rev: (u8, u8),
    pub product_id: u16,
    pub mfg_id: u32,
    pub guid: Uuid,

    pub sensors: Vec<u8>,
    pub sdrs: Vec<Vec<u8>>,
    pub sel: Vec<Vec<u8>>,
    pub fru: Vec<Vec<u8>>,
    pub leds: Vec<u8>,

    /// Index 0 unused, matching `user 0 is not used`.
    pub users: Vec<Option<UserRecord>>,

    pub channels: Vec<Channel>,
    pub recv_queue: VecDeque<Message>,
    pub seq_table: SequenceTable,
    pub sol: crate::sol::server::SolServerConnection,
}

#[derive(Debug, Clone, Default)]
pub struct UserRecord {
    pub username: String,
    pub password_digest: [u8; 20],
    pub privilege: u8,
    pub enabled: bool,
}

impl Mc {
    pub fn new(ipmb_addr: u8) -> Self {
        let mut channels = Vec::with_capacity(MAX_CHANNELS);
        for n in 0..MAX_CHANNELS as u8 {
            let support = if n == SYSTEM_INTERFACE_CHANNEL {
                SessionSupport::SessionLess
            } else {
                SessionSupport::MultiSession
            };
            channels.push(Channel::new(n, 0, 0, support));
        }
        Mc {
            ipmb_addr,
            enabled: true,
            device_id: 0,
            fw_rev: (0, 0),
            product_id: 0,
            mfg_id: 0,
            guid: Uuid::nil(),
            sensors: Vec::new(),
            sdrs: Vec::new(),
            sel: Vec::new(),
            fru: Vec::new(),
            leds: Vec::new(),
            users: {
                let mut v = Vec::with_capacity(64);
                v.push(None); // user 0 unused
                for _ in 1..64 {
                    v.push(None);
                }
                v
            },
            channels,
            recv_queue: VecDeque::new(),
            seq_table: SequenceTable::new(),
            sol: crate::sol::server::SolServerConnection::new(),
        }
    }

    pub fn channel(&self, number: u8) -> Option<&Channel> {
        self.channels.get(number as usize)
    }

    pub fn channel_mut(&mut self, number: u8) -> Option<&mut Channel> {
        self.channels.get_mut(number as usize)
    }

    /// Persist every configured user slot (1..=63) as its own bundle
    /// named `user_{idx}`, mirroring `lanserv/persist.c`'s one-record-
    /// per-user layout.
    pub fn save_users(&self, store: &crate::persist::Store) -> Result<(), crate::error::PersistError> {
        for (idx, slot) in self.users.iter().enumerate().skip(1) {
            let Some(user) = slot else { continue };
            let mut bundle = store.create(format!("user_{idx}"));
            bundle.add_string("username", user.username.clone());
            bundle.add_bytes("password_digest", user.password_digest.to_vec());
            bundle.add_int("privilege", user.privilege as i64);
            bundle.add_int("enabled", user.enabled as i64);
            store.write(&bundle)?;
        }
        Ok(())
    }

    /// Load every user bundle that exists back into `self.users`. Slots
    /// with no corresponding record, or a malformed one, are left as
    /// they were.
    pub fn load_users(&mut self, store: &crate::persist::Store) {
        for idx in 1..self.users.len() {
            let Ok(bundle) = store.read(&format!("user_{idx}")) else {
                continue;
            };
            let (Ok(username), Ok(password_digest), Ok(privilege), Ok(enabled)) = (
                bundle.find_string("username"),
                bundle.find_bytes("password_digest"),
                bundle.find_int("privilege"),
                bundle.find_int("enabled"),
            ) else {
                continue;
            };
            if password_digest.len() != 20 {
                continue;
            }
            let mut digest = [0u8; 20];
            digest.copy_from_slice(&password_digest);
            self.users[idx] = Some(UserRecord {
                username,
                password_digest: digest,
                privilege: privilege as u8,
                enabled: enabled != 0,
            });
        }
    }
}
