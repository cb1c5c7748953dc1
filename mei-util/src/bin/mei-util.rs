// SPDX-License-Identifier: MIT OR Apache-2.0
/*
 * MEI utility.
 *
 * Copyright (c) 2024 Code Construct
 */
#[allow(unused)]
use log::{debug, error, info, trace, warn};

use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;

use mei::{ClientId, Session};
use mei_linux::MeiNode;
use mkhi::MkhiClient;

#[derive(FromArgs, Debug)]
#[argh(description = "Intel ME interface utility")]
struct Args {
    #[argh(switch, short = 'd')]
    /// debug logging
    debug: bool,

    #[argh(switch)]
    /// trace logging
    trace: bool,

    #[argh(switch, short = 'v')]
    /// report session negotiation and transfers
    verbose: bool,

    /// MEI device node, default /dev/mei0
    #[argh(option, default = "mei_linux::MEI_DEFAULT_DEVICE.to_string()")]
    device: String,

    /// transfer timeout in milliseconds, default 5000. 0 selects the MKHI
    /// default.
    #[argh(option, default = "5000")]
    timeout: u64,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    FwVersion(FwVersionCommand),
    Connect(ConnectCommand),
    AllowFixedAddress(AllowFixedAddressCommand),
    Version(VersionCommand),
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "fw-version",
    description = "Query ME firmware version over MKHI"
)]
struct FwVersionCommand {
    /// enable fixed address clients first
    #[argh(switch)]
    allow_fixed: bool,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "connect",
    description = "Connect to a client and report its properties"
)]
struct ConnectCommand {
    /// client UUID
    #[argh(positional)]
    client: ClientId,

    /// required protocol version, 0 accepts any
    #[argh(option, default = "0")]
    protocol: u8,
}

#[derive(FromArgs, Debug)]
#[argh(
    subcommand,
    name = "allow-fixed-address",
    description = "Enable connections to fixed address clients"
)]
struct AllowFixedAddressCommand {}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "version", description = "Print version")]
struct VersionCommand {}

fn allow_fixed(node: &MeiNode) -> Result<()> {
    node.allow_fixed_address().with_context(|| {
        format!(
            "Can't enable fixed address clients for {}",
            node.path().display()
        )
    })
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();

    let level = if args.trace {
        log::LevelFilter::Trace
    } else if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    let node = MeiNode::new(&args.device);
    let timeout = Duration::from_millis(args.timeout);

    match args.command {
        Command::Version(_) => {
            println!("mei-util version {}", env!("VERSION"));
        }
        Command::AllowFixedAddress(_) => {
            allow_fixed(&node)?;
        }
        Command::Connect(c) => {
            let mut session = Session::new(node, args.verbose);
            let props =
                session.connect(&c.client, c.protocol).with_context(|| {
                    format!("Can't connect to client {}", c.client)
                })?;
            println!("Client {}:", c.client);
            println!("  Max message length: {}", props.max_msg_length);
            println!("  Protocol version:   {}", props.protocol_version);
            session.close();
        }
        Command::FwVersion(f) => {
            if f.allow_fixed {
                allow_fixed(&node)?;
            }
            let mut client = MkhiClient::new(node, timeout, args.verbose)
                .context("MKHI fixed interface failed to initialise")?;
            let r = client
                .get_fw_version()
                .context("Get firmware version failed")?;
            client.session().close();

            println!("Firmware version: {}", r.code);
            println!(
                "  Build Maj Min Hotfix: {:x}, {:x}, {:x}, {:x}",
                r.code.build, r.code.major, r.code.minor, r.code.hotfix
            );
            println!("Recovery version: {}", r.nftp);
        }
    }

    Ok(())
}
