//! ARP I/O adapter and RFC 5227 frame classification.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::mpsc as std_mpsc;
use std::thread;

use async_std::channel as astd_channel;
use kv_log_macro::{debug, warn};
use pnet::{
    datalink::{self, Channel, Config, NetworkInterface},
    packet::{
        arp::{ArpHardwareTypes, ArpOperation, ArpOperations, ArpPacket, MutableArpPacket},
        ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket},
        MutablePacket, Packet,
    },
    util::MacAddr,
};

use crate::error::AcdError;

/// One ARP message, already stripped of its Ethernet envelope, bundled as
/// a value instead of being assembled inline at each call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpFrame {
    pub operation: ArpOp,
    pub sender_hw: MacAddr,
    pub sender_proto: Ipv4Addr,
    pub target_hw: MacAddr,
    pub target_proto: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

impl ArpFrame {
    /// An ARP probe: a request asking "is anyone using this IP?" without
    /// claiming it (sender protocol address left unspecified).
    pub fn probe(mac: MacAddr, target: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_hw: mac,
            sender_proto: Ipv4Addr::UNSPECIFIED,
            target_hw: MacAddr::zero(),
            target_proto: target,
        }
    }

    /// A gratuitous ARP request publishing ownership of `ip`.
    pub fn announce(mac: MacAddr, ip: Ipv4Addr) -> Self {
        Self {
            operation: ArpOp::Request,
            sender_hw: mac,
            sender_proto: ip,
            target_hw: MacAddr::zero(),
            target_proto: ip,
        }
    }

    fn to_pnet_operation(self) -> ArpOperation {
        match self.operation {
            ArpOp::Request => ArpOperations::Request,
            ArpOp::Reply => ArpOperations::Reply,
        }
    }
}

/// Outcome of classifying one inbound frame against a host's current
/// candidate IP and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Our own packet looped back, or unrelated traffic.
    Irrelevant,
    /// Another station is using or probing the address we're defending.
    Conflict,
}

/// Classify an inbound frame. `during_probe` selects between the probe-phase
/// rule (also matches another host's probe for the same address) and the
/// announce/monitor/defend rule (only matches an actual claim).
pub fn classify(frame: &ArpFrame, our_mac: MacAddr, our_ip: Ipv4Addr, during_probe: bool) -> Classification {
    if frame.sender_hw == our_mac {
        return Classification::Irrelevant;
    }

    let conflict = if during_probe {
        frame.sender_proto == our_ip
            || (frame.sender_proto == Ipv4Addr::UNSPECIFIED && frame.target_proto == our_ip)
    } else {
        frame.sender_proto == our_ip
    };

    if conflict {
        Classification::Conflict
    } else {
        Classification::Irrelevant
    }
}

/// The link-layer ARP capability the state machine is driven through.
/// `open` binds a fresh channel to `ifindex`; dropping a channel releases
/// its OS resources (idempotent close).
pub trait ArpChannel: Sized {
    fn open(ifindex: i32) -> Result<Self, AcdError>;
    fn send(&mut self, frame: &ArpFrame) -> Result<(), AcdError>;
    /// Non-blocking parse of exactly one ARP frame, or `Ok(None)` if
    /// nothing is queued (`would_block`).
    fn try_receive(&mut self) -> Result<Option<ArpFrame>, AcdError>;
}

/// Live adapter backed by `pnet::datalink`.
pub struct PnetArpChannel {
    ifindex: i32,
    mac: MacAddr,
    tx: Box<dyn datalink::DataLinkSender>,
    inbound_rx: std_mpsc::Receiver<ArpFrame>,
    notify_rx: astd_channel::Receiver<()>,
    _reader: thread::JoinHandle<()>,
}

impl PnetArpChannel {
    fn find_interface(ifindex: i32) -> Result<NetworkInterface, AcdError> {
        datalink::interfaces()
            .into_iter()
            .find(|i| i.index as i32 == ifindex)
            .ok_or_else(|| AcdError::Configuration(format!("no interface with index {}", ifindex)))
    }

    /// Lets the live event loop `.await` the reader thread's wakeups
    /// instead of polling `try_receive` in a busy loop.
    pub async fn readable(&self) {
        // a closed sender (reader thread exited) just means "never again";
        // the loop will next observe it through a try_receive() IoFatal.
        let _ = self.notify_rx.recv().await;
    }
}

impl ArpChannel for PnetArpChannel {
    fn open(ifindex: i32) -> Result<Self, AcdError> {
        let interface = Self::find_interface(ifindex)?;
        let mac = interface
            .mac
            .ok_or_else(|| AcdError::Configuration("interface has no mac address".into()))?;

        let (tx, mut rx) = match datalink::channel(
            &interface,
            Config {
                channel_type: datalink::ChannelType::Layer2,
                promiscuous: true,
                ..Default::default()
            },
        )
        .map_err(|source| AcdError::IoFatal { ifindex, source })?
        {
            Channel::Ethernet(tx, rx) => (tx, rx),
            _ => return Err(AcdError::Configuration("unsupported channel type".into())),
        };

        let (inbound_tx, inbound_rx) = std_mpsc::channel();
        let (notify_tx, notify_rx) = astd_channel::bounded(1);

        let reader = thread::spawn(move || loop {
            let packet = match rx.next() {
                Ok(p) => p,
                Err(_) => return,
            };

            let frame = match EthernetPacket::new(packet).and_then(|eth| {
                if eth.get_ethertype() != EtherTypes::Arp {
                    return None;
                }
                let arp = ArpPacket::new(eth.payload())?;
                let operation = match arp.get_operation() {
                    ArpOperations::Request => ArpOp::Request,
                    ArpOperations::Reply => ArpOp::Reply,
                    _ => return None,
                };
                Some(ArpFrame {
                    operation,
                    sender_hw: arp.get_sender_hw_addr(),
                    sender_proto: arp.get_sender_proto_addr(),
                    target_hw: arp.get_target_hw_addr(),
                    target_proto: arp.get_target_proto_addr(),
                })
            }) {
                Some(f) => f,
                None => continue,
            };

            if inbound_tx.send(frame).is_err() {
                return;
            }
            // bounded(1) + try_send: a pending notify already covers this
            // wakeup, and a closed receiver means the channel was dropped.
            let _ = notify_tx.try_send(());
        });

        Ok(Self {
            ifindex,
            mac,
            tx,
            inbound_rx,
            notify_rx,
            _reader: reader,
        })
    }

    fn send(&mut self, frame: &ArpFrame) -> Result<(), AcdError> {
        let mut arp_buf = vec![0u8; MutableArpPacket::minimum_packet_size()];
        let mut arp = MutableArpPacket::new(&mut arp_buf)
            .expect("buffer sized from minimum_packet_size");

        arp.set_hardware_type(ArpHardwareTypes::Ethernet);
        arp.set_protocol_type(EtherTypes::Ipv4);
        arp.set_hw_addr_len(6);
        arp.set_proto_addr_len(4);
        arp.set_operation(frame.to_pnet_operation());
        arp.set_sender_hw_addr(frame.sender_hw);
        arp.set_sender_proto_addr(frame.sender_proto);
        arp.set_target_hw_addr(frame.target_hw);
        arp.set_target_proto_addr(frame.target_proto);

        let mut eth_buf =
            vec![0u8; MutableEthernetPacket::minimum_packet_size() + arp_buf.len()];
        let mut eth = MutableEthernetPacket::new(&mut eth_buf)
            .expect("buffer sized from minimum_packet_size");
        eth.set_source(self.mac);
        eth.set_destination(MacAddr::broadcast());
        eth.set_ethertype(EtherTypes::Arp);
        eth.set_payload(arp.packet_mut());

        debug!("sending arp frame", { ifindex: self.ifindex, op: format!("{:?}", frame.operation) });

        match self.tx.send_to(eth.packet(), None) {
            Some(Ok(())) => Ok(()),
            Some(Err(source)) => {
                warn!("arp send failed", { ifindex: self.ifindex });
                Err(AcdError::IoTransient {
                    ip: frame.sender_proto,
                    source,
                })
            }
            None => Err(AcdError::IoTransient {
                ip: frame.sender_proto,
                source: std::io::Error::new(std::io::ErrorKind::Other, "unknown send failure"),
            }),
        }
    }

    fn try_receive(&mut self) -> Result<Option<ArpFrame>, AcdError> {
        match self.inbound_rx.try_recv() {
            Ok(frame) => Ok(Some(frame)),
            Err(std_mpsc::TryRecvError::Empty) => Ok(None),
            Err(std_mpsc::TryRecvError::Disconnected) => Err(AcdError::IoFatal {
                ifindex: self.ifindex,
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "arp reader thread exited"),
            }),
        }
    }
}

/// In-memory adapter for tests: an inbound queue to inject frames, and an
/// outbound log to assert on what the host sent.
#[derive(Default)]
pub struct MockArpChannel {
    pub inbound: VecDeque<ArpFrame>,
    pub sent: Vec<ArpFrame>,
    pub opened_for: Option<i32>,
}

impl MockArpChannel {
    pub fn inject(&mut self, frame: ArpFrame) {
        self.inbound.push_back(frame);
    }
}

impl ArpChannel for MockArpChannel {
    fn open(ifindex: i32) -> Result<Self, AcdError> {
        Ok(Self {
            inbound: VecDeque::new(),
            sent: Vec::new(),
            opened_for: Some(ifindex),
        })
    }

    fn send(&mut self, frame: &ArpFrame) -> Result<(), AcdError> {
        self.sent.push(*frame);
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<ArpFrame>, AcdError> {
        Ok(self.inbound.pop_front())
    }
}
