//! # ipmi-core — entry point
//!
//! Parses CLI arguments, wires up the two tracing layers (clean stdout
//! output plus a detailed rolling log file), constructs the one
//! process-wide [`Router`] and its persistence [`Store`], and either
//! runs a single command, a command file, or the interactive command
//! loop.

use anyhow::{Context, Result};
use clap::Parser;
use ipmi_core::channel::{Address, Mc, Message, SYSTEM_INTERFACE_CHANNEL};
use ipmi_core::cli::Args;
use ipmi_core::persist::Store;
use ipmi_core::router::Router;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ColorizedFormatter;

/// The IPMB address this process answers to as the simulated BMC,
/// matching `lanserv.h`'s conventional default for `sys_data_s::bmc_ipmb`.
const DEFAULT_BMC_IPMB_ADDR: u8 = 0x20;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.version {
        println!("ipmi-core {}", ipmi_core::VERSION);
        std::process::exit(0);
    }

    let log_level = match args.debug {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let file_appender = tracing_appender::rolling::daily(".", "ipmi-core.log");
    let (non_blocking_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    let detailed_log_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_writer)
        .with_ansi(false)
        .with_filter(log_level);

    let stdout_log = if !args.no_interactive {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    match run(args).await {
        Ok(()) => {
            info!("ipmi-core shut down cleanly");
            std::process::exit(0);
        }
        Err(e) => {
            error!("fatal error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    info!("starting ipmi-core, reading configuration from {:?}", args.config_file);

    let store = match args.effective_state_dir() {
        Some(dir) => {
            let store = Store::init(&dir, "ipmi-core", "default")
                .with_context(|| format!("failed to initialize persistence store at {dir:?}"))?;
            store.set_enabled(true);
            Some(store)
        }
        None => None,
    };

    let mut router = Router::new();
    router.add_mc(Mc::new(DEFAULT_BMC_IPMB_ADDR));
    info!("BMC MC registered at IPMB address {:#04x}", DEFAULT_BMC_IPMB_ADDR);

    if let Some(store) = &store {
        if let Some(mc) = router.mc_mut(DEFAULT_BMC_IPMB_ADDR) {
            mc.load_users(store);
        }
    }

    let result = if let Some(cmd) = args.command.as_deref() {
        run_one_command(&mut router, cmd)
    } else if let Some(path) = args.command_file.as_deref() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read command file {path:?}"))?;
        let mut result = Ok(());
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Err(e) = run_one_command(&mut router, line) {
                result = Err(e);
                break;
            }
        }
        result
    } else if args.no_interactive {
        info!("interactive mode disabled and no command given; exiting");
        Ok(())
    } else {
        info!("entering interactive command loop (not a TTY: commands read from stdin)");
        run_interactive(&mut router).await
    };

    if let Some(store) = &store {
        if let Some(mc) = router.mc(DEFAULT_BMC_IPMB_ADDR) {
            mc.save_users(store)?;
        }
    }

    result
}

/// Execute a single administrative command line. Only `raw <ipmb-addr>
/// <netfn> <cmd> [data-bytes...]` (all hex, `0x` prefix optional) is
/// implemented: it builds a request on channel 15 addressed to the
/// given IPMB slave and routes it, logging the resulting completion
/// code. This is intentionally minimal — this binary's job is to host
/// the protocol engine, not to be a full `ipmi_sim` console.
fn run_one_command(router: &mut Router, cmd: &str) -> Result<()> {
    info!("command: {cmd}");

    let mut parts = cmd.split_whitespace();
    match parts.next() {
        Some("raw") => {
            let addr = parts.next().context("raw: missing IPMB address")?;
            let netfn = parts.next().context("raw: missing netfn")?;
            let command = parts.next().context("raw: missing command")?;

            let slave_addr = parse_hex_byte(addr).with_context(|| format!("raw: bad IPMB address {addr:?}"))?;
            let netfn = parse_hex_byte(netfn).with_context(|| format!("raw: bad netfn {netfn:?}"))?;
            let cmd_byte = parse_hex_byte(command).with_context(|| format!("raw: bad command {command:?}"))?;

            let mut payload = Vec::new();
            for byte in parts {
                payload.push(parse_hex_byte(byte).with_context(|| format!("raw: bad payload byte {byte:?}"))?);
            }

            let msg = Message {
                dst_addr: Address::Ipmb { channel: 0, slave_addr, lun: 0 },
                dst_lun: 0,
                src_addr: Address::SystemInterface { channel: SYSTEM_INTERFACE_CHANNEL, lun: 0 },
                src_lun: 0,
                netfn,
                cmd: cmd_byte,
                seq: 0,
                session_id: 0,
                payload,
                origin_channel: SYSTEM_INTERFACE_CHANNEL,
                tracked: false,
                payload_type: 0,
                iana: None,
            };
            let cc = router.route(msg);
            info!("raw command completed with completion code {:#04x}", cc.code());
        }
        Some(other) => info!("unrecognized command {other:?}, ignoring (only `raw` is implemented)"),
        None => {}
    }
    Ok(())
}

fn parse_hex_byte(s: &str) -> Result<u8> {
    u8::from_str_radix(s.trim_start_matches("0x"), 16).context("expected a hex byte")
}

async fn run_interactive(router: &mut Router) -> Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        run_one_command(router, line)?;
    }
    Ok(())
}
