// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Demo host process for the `acd` engine: resolves an interface, opens a
//! live ARP channel, drives the RFC 5227 state machine to completion, and
//! (optionally) keeps the kernel's address table for the interface in sync
//! via `rtnetlink`. One possible consumer of the library; a connection
//! manager embedding the crate directly would wire the same pieces up
//! without a standalone daemon.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::exit;
use std::str::FromStr;

use acd::{
    AcdHost, AsyncStdTimer, Clock, HostEvent, Observer, ObserverAction, OsRandom, PnetArpChannel,
    PnetInterfaceInfo, State, SystemClock,
};
use argh::FromArgs;
use async_std::task::{block_on, spawn};
use chrono::{SecondsFormat, Utc};
use color_eyre::eyre::{eyre, Result};
use env_logger::{Builder as LogBuilder, Target as LogTarget};
use futures::stream::TryStreamExt;
use kv_log_macro::{error, info, warn};
use log::{kv, LevelFilter};
use pnet::{
    datalink::interfaces,
    ipnetwork::IpNetwork,
    util::MacAddr,
};
use rtnetlink::{
    packet::{rtnl::address::nlas::Nla, AddressMessage},
    AddressHandle,
};
use serde::Serialize;

const SOURCE_MAIN: &str = include_str!("acd-hostd.rs");
const SOURCE_CARGO: &str = include_str!("../../Cargo.toml");

/// Probe, announce, and defend an IPv4 address on an interface per RFC 5227.
#[derive(Debug, FromArgs)]
struct Args {
    /// interface to run acd on (required)
    #[argh(option)]
    interface: Option<String>,

    /// ip (optionally with subnet, defaults to /32) to claim (required)
    #[argh(option)]
    ip: Option<IpNetwork>,

    /// mac address override
    #[argh(option)]
    mac: Option<MacAddr>,

    /// log level (default=info)
    ///
    /// [no, error, warn, info, debug, trace]
    #[argh(option, default = "Default::default()")]
    log: LogLevel,

    /// what to do when the engine reports a lost/conflicted address
    /// (default=fail)
    ///
    /// [fail: exit with code=1]
    /// [quit: exit with code=0]
    /// [log: don't exit, only log]
    #[argh(option, default = "Default::default()")]
    watch: Watch,

    /// don't add/remove the ip to/from the interface
    #[argh(switch)]
    unmanaged_ip: bool,

    /// exit with code=1 if the ip exists on the interface already
    #[argh(switch)]
    die_if_ip_exists: bool,

    /// remove the ip from the interface on exit even when we didn't add it ourselves
    #[argh(switch)]
    remove_pre_existing_ip: bool,

    /// print the source
    #[argh(switch)]
    source: bool,

    /// print the version
    #[argh(switch)]
    version: bool,
}

#[derive(Clone, Copy, Debug)]
enum Watch {
    Fail,
    Quit,
    Log,
}

impl Default for Watch {
    fn default() -> Self {
        Self::Fail
    }
}

impl FromStr for Watch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "quit" => Ok(Self::Quit),
            "log" => Ok(Self::Log),
            _ => Err(String::from("invalid --watch value")),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum LogLevel {
    No,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "no" | "none" => Ok(Self::No),
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" | "verbose" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            _ => Err(String::from("invalid --log value")),
        }
    }
}

impl LogLevel {
    fn install(self) -> Result<()> {
        if let Self::No = self {
            return Ok(());
        }

        let mut log = LogBuilder::new();
        log.target(LogTarget::Stdout);

        if let Self::Trace = self {
            log.filter(None, LevelFilter::Trace);
        } else {
            log.filter(
                Some("acd"),
                match self {
                    Self::Error => LevelFilter::Error,
                    Self::Warn => LevelFilter::Warn,
                    Self::Info => LevelFilter::Info,
                    Self::Debug => LevelFilter::Debug,
                    _ => unreachable!(),
                },
            );
        }

        #[derive(Serialize)]
        struct Record<'kv> {
            level: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            module: Option<String>,
            ts: String,
            msg: String,

            #[serde(flatten)]
            #[serde(with = "kv::source::as_map")]
            kvs: &'kv dyn kv::Source,
        }

        log.format(move |mut buf, record| {
            let rec = Record {
                level: record.level().as_str(),
                module: if let Self::Trace = self {
                    record.module_path().map(|m| m.to_string())
                } else {
                    None
                },
                ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                msg: record.args().to_string(),
                kvs: record.key_values(),
            };

            serde_json::to_writer(&mut buf, &rec)?;
            writeln!(buf)?;
            Ok(())
        });

        log.try_init()?;

        Ok(())
    }
}

/// Observer that applies `--watch`'s exit policy and logs every event with
/// the interface index attached as a structured key-value field.
struct CliObserver {
    ifindex: i32,
    watch: Watch,
    want_exit: Option<i32>,
}

impl Observer for CliObserver {
    fn on_available(&mut self) -> ObserverAction {
        info!("address available", { ifindex: self.ifindex });
        ObserverAction::None
    }

    fn on_lost(&mut self) -> ObserverAction {
        warn!("address lost to a conflicting host", { ifindex: self.ifindex });
        match self.watch {
            Watch::Fail => self.want_exit = Some(1),
            Watch::Quit => self.want_exit = Some(0),
            Watch::Log => {}
        }
        ObserverAction::None
    }

    fn on_conflict(&mut self) -> ObserverAction {
        warn!("conflict observed while probing", { ifindex: self.ifindex });
        ObserverAction::None
    }

    fn on_max_conflicts(&mut self) -> ObserverAction {
        error!("max conflicts reached, giving up", { ifindex: self.ifindex });
        self.want_exit = Some(1);
        ObserverAction::None
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;

    if let Some(args) = prep()? {
        if let Err(e) = block_on(run(args)) {
            error!("{}", e);
            exit(1);
        }
    }

    Ok(())
}

fn prep() -> Result<Option<Args>> {
    let args: Args = argh::from_env();
    args.log.install()?;

    if args.source {
        println!("# Cargo.toml\n{}\n\n# src/bin/acd-hostd.rs\n{}", SOURCE_CARGO, SOURCE_MAIN);
        return Ok(None);
    }

    if args.version {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(None);
    }

    if args.ip.is_none() || args.interface.is_none() {
        return Err(eyre!("missing required options: --interface, --ip"));
    }

    Ok(Some(args))
}

async fn run(args: Args) -> Result<()> {
    let interface = interfaces()
        .into_iter()
        .find(|i| Some(&i.name) == args.interface.as_ref())
        .ok_or_else(|| eyre!("interface does not exist"))?;

    let iface_info = PnetInterfaceInfo::default();
    let mac = match args.mac {
        Some(m) => m,
        None => iface_info.validate_for_acd(interface.index as i32)?,
    };

    let ip = args.ip.expect("checked in prep()");
    let ip4 = match ip.ip() {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => return Err(eyre!("ipv6 is out of scope for this engine")),
    };

    let mut ip_managed = !args.unmanaged_ip;
    let (nlconn, nl, _) = rtnetlink::new_connection()?;
    let nlah = AddressHandle::new(nl);

    if ip_managed {
        spawn(nlconn);

        info!("checking if interface has ip", { ip: ip.to_string(), interface: interface.index });
        if find_addr_for_ip(&nlah, &interface, ip).await?.is_some() {
            if args.die_if_ip_exists {
                return Err(eyre!("ip exists on interface, abort"));
            }
            warn!("existing ip on the interface");
            if !args.remove_pre_existing_ip {
                ip_managed = false;
            }
        } else {
            info!("adding ip to interface", { ip: ip.to_string(), interface: interface.index });
            nlah.add(interface.index, ip.ip(), ip.prefix()).execute().await?;
        }
    }

    let clock = SystemClock::new();
    let observer = CliObserver {
        ifindex: interface.index as i32,
        watch: args.watch,
        want_exit: None,
    };

    let mut host: AcdHost<PnetArpChannel, AsyncStdTimer, OsRandom, CliObserver> = AcdHost::new(
        interface.index as i32,
        interface.name.clone(),
        mac,
        AsyncStdTimer::new(),
        OsRandom::default(),
        observer,
    );

    let (ctrlc_tx, ctrlc_rx) = async_std::channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = ctrlc_tx.try_send(());
    })?;

    host.start(ip4)?;

    // ctrl-c is polled non-blockingly rather than raced against
    // `wait_for_event` in the same `select!`: that future borrows `host`
    // for its whole (potentially multi-second) wait, and this loop needs
    // `&mut host` the moment it wakes, so the two are kept in separate
    // statements rather than arms of one expression.
    while host.state() != State::Idle && host.observer().want_exit.is_none() {
        if ctrlc_rx.try_recv().is_ok() {
            info!("ctrl-c received, stopping");
            break;
        }

        // `on_timer_fire` drains any already-queued ARP frame itself
        // before acting on the fire (spec §5's ordering guarantee), so a
        // conflict that arrived before a probe→announce phase advance is
        // classified as a conflict rather than skipped past.
        match host.wait_for_event().await {
            HostEvent::TimerFired(fired) => host.on_timer_fire(fired, clock.now_ms())?,
            HostEvent::ArpReadable => host.poll_arp(clock.now_ms())?,
        }
    }

    host.stop();

    if ip_managed {
        info!("removing ip from interface", { ip: ip.to_string(), interface: interface.index });
        if let Some(addr) = find_addr_for_ip(&nlah, &interface, ip).await? {
            nlah.del(addr).execute().await?;
        }
    }

    if let Some(code) = host.observer().want_exit {
        exit(code);
    }

    Ok(())
}

async fn find_addr_for_ip(
    nlah: &AddressHandle,
    interface: &pnet::datalink::NetworkInterface,
    ip: IpNetwork,
) -> Result<Option<AddressMessage>> {
    let mut addrlist = nlah.get().execute();
    while let Some(addr) = addrlist.try_next().await? {
        if addr.header.index != interface.index {
            continue;
        }

        let addrbytes = match addr.nlas.iter().find(|n| matches!(n, Nla::Address(_))) {
            Some(Nla::Address(a)) => a,
            _ => continue,
        };

        match ip {
            IpNetwork::V4(ip4) => match <[u8; 4]>::try_from(addrbytes.clone()).map(Ipv4Addr::from) {
                Ok(ar) if ar == ip4.ip() => return Ok(Some(addr)),
                _ => continue,
            },
            IpNetwork::V6(ip6) => match <[u8; 16]>::try_from(addrbytes.clone()).map(Ipv6Addr::from) {
                Ok(ar) if ar == ip6.ip() => return Ok(Some(addr)),
                _ => continue,
            },
        };
    }

    Ok(None)
}
