use std::net::Ipv4Addr;

use thiserror::Error;

/// Error kinds an ACD host can raise.
#[derive(Debug, Error)]
pub enum AcdError {
    /// Bad interface index, interface down, or no MAC address — returned
    /// synchronously from `start`, no state entered.
    #[error("interface configuration invalid: {0}")]
    Configuration(String),

    /// Socket open failure on `start`; the start operation is aborted.
    #[error("failed to open arp channel on ifindex {ifindex}: {source}")]
    IoFatal {
        ifindex: i32,
        #[source]
        source: std::io::Error,
    },

    /// A send failed; the phase continues regardless, this is logged not
    /// propagated. Kept as a variant so adapters have something to log.
    #[error("transient send failure for {ip}: {source}")]
    IoTransient {
        ip: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },

    /// `start` called on an already-started host, or `reset_conflicts`
    /// called while still running.
    #[error("misuse: {0}")]
    Misuse(&'static str),
}
