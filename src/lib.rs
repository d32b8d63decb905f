//! # ipmi-core
//!
//! A protocol engine for IPMI BMC simulation and Serial-over-LAN (SOL)
//! session handling: wire codec and checksums, a persistence store for
//! configuration and SEL/SDR/FRU records, RAKP/legacy auth digests, the
//! sequence-number and session tables backing RMCP+ tracking, the
//! channel/MC model, the multi-channel message router, and both the SOL
//! server and client transports.

pub mod auth;
pub mod channel;
pub mod cli;
pub mod codec;
pub mod error;
pub mod ipmb;
pub mod persist;
pub mod router;
pub mod seqtable;
pub mod session;
pub mod sol;

pub use channel::{Address, Channel, Mc, Message};
pub use error::{CompletionCode, IpmiError};
pub use router::Router;
pub use session::{Session, SessionTable};

/// The current version of the engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
