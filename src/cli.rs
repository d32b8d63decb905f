//! Command-line argument parsing and configuration surface.
//!
//! Mirrors the external command's flags directly rather than layering a
//! separate internal config struct on top, since there's no unit
//! conversion or expansion to perform (contrast the old benchmark CLI's
//! duration parsing and mechanism-list expansion).

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// ipmi-core — an IPMI BMC simulator and SOL session engine.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the LAN configuration file.
    #[arg(short = 'c', long = "config", default_value = "/etc/ipmi/lan.conf")]
    pub config_file: PathBuf,

    /// Execute a single command line and exit, instead of entering the
    /// interactive command loop.
    #[arg(short = 'x', long = "command")]
    pub command: Option<String>,

    /// Read commands from a file, one per line, then exit.
    #[arg(short = 'f', long = "command-file")]
    pub command_file: Option<PathBuf>,

    /// Base directory for the persistence store.
    #[arg(short = 's', long = "statedir")]
    pub state_dir: Option<PathBuf>,

    /// Increase debug verbosity. Repeatable:
    ///  -d: raw message bytes (`ipmi_core::raw_msg`)
    ///  -dd: decoded messages (`ipmi_core::msg`)
    ///  -ddd: SOL packet tracing (`ipmi_core::sol`)
    #[arg(short = 'd', action = clap::ArgAction::Count)]
    pub debug: u8,

    /// Print version information and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Disable the interactive stdio command loop.
    #[arg(short = 'n', long = "no-interactive")]
    pub no_interactive: bool,

    /// Disable persistence: state is neither read nor written to disk.
    #[arg(short = 'p', long = "no-persist")]
    pub no_persist: bool,
}

impl Args {
    /// Resolve the effective persistence base directory, falling back to
    /// `$HOME/.ipmi-core` when `-s` was not given.
    pub fn effective_state_dir(&self) -> Option<PathBuf> {
        if self.no_persist {
            return None;
        }
        self.state_dir.clone().or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ipmi-core"))
        })
    }
}
