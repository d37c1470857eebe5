//! Address Conflict Detection (RFC 5227) for IPv4.
//!
//! An ACD host probes a candidate IPv4 address on the local segment before
//! a caller commits to using it, then announces and defends it. This crate
//! is the protocol engine only — interface discovery, raw-socket setup, and
//! the surrounding policy of which address to try next are the consuming
//! application's job (see `acd-hostd` for one way to wire it up).
//!
//! The core is [`machine::Machine`], a sans-I/O state machine; [`host::AcdHost`]
//! drives it against real or mock [`arp::ArpChannel`], [`timer::Timer`], and
//! [`rand_source::RandomSource`] adapters and an [`observer::Observer`].

pub mod arp;
pub mod clock;
pub mod constants;
pub mod error;
pub mod host;
pub mod iface;
pub mod machine;
pub mod observer;
pub mod rand_source;
pub mod timer;

pub use arp::{ArpChannel, ArpFrame, MockArpChannel, PnetArpChannel};
pub use clock::{Clock, SystemClock, VirtualClock};
pub use error::AcdError;
pub use host::{AcdHost, HostEvent};
pub use iface::{InterfaceInfo, PnetInterfaceInfo};
pub use machine::{Machine, State};
pub use observer::{NullObserver, Observer, ObserverAction};
pub use rand_source::{FixedSequence, OsRandom, RandomSource};
pub use timer::{AsyncStdTimer, Timer, TimerFired, VirtualTimer};
