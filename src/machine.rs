//! The RFC 5227 state machine, decoupled from any socket, timer, or clock:
//! a sans-I/O core, state plus event in, a list of `Action`s out, nothing
//! here ever touches the network or sleeps. `host::AcdHost` is what
//! actually executes the actions against real (or mock) adapters.
//!
//! The transition table follows RFC 5227 §2.1 directly.

use std::net::Ipv4Addr;

use pnet::util::MacAddr;

use crate::arp::{classify, ArpFrame, Classification};
use crate::constants::*;
use crate::error::AcdError;
use crate::rand_source::RandomSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Never started, stopped, or abandoned after max conflicts.
    Idle,
    Probe { pending_announce: bool },
    Announce,
    Monitor,
    Defend,
}

/// A side effect the machine wants executed. `host::AcdHost::apply` is the
/// only place these are interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    OpenArpChannel,
    CloseArpChannel,
    Send(ArpFrame),
    ScheduleTimer { delay_ms: u64, generation: u64 },
    CancelTimer,
    NotifyAvailable,
    NotifyLost,
    NotifyConflict,
    NotifyMaxConflicts,
}

pub struct Machine {
    state: State,
    requested_ip: Ipv4Addr,
    mac: MacAddr,
    retry_times: u32,
    conflicts: u32,
    quiesced: bool,
    last_conflict_time_ms: Option<u64>,
    generation: u64,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            requested_ip: Ipv4Addr::UNSPECIFIED,
            mac: MacAddr::zero(),
            retry_times: 0,
            conflicts: 0,
            quiesced: false,
            last_conflict_time_ms: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn requested_ip(&self) -> Ipv4Addr {
        self.requested_ip
    }

    pub fn retry_times(&self) -> u32 {
        self.retry_times
    }

    pub fn conflicts(&self) -> u32 {
        self.conflicts
    }

    pub fn is_running(&self) -> bool {
        self.state != State::Idle
    }

    fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Preconditions: host not already running, `ip != 0`, and not
    /// quiescent from a prior `on_max_conflicts` (cleared only by an
    /// explicit `reset_conflicts`).
    pub fn start(
        &mut self,
        ip: Ipv4Addr,
        mac: MacAddr,
        rand: &mut dyn RandomSource,
    ) -> Result<Vec<Action>, AcdError> {
        if self.is_running() {
            return Err(AcdError::Misuse("acd host is already started"));
        }
        if self.quiesced {
            return Err(AcdError::Misuse(
                "max conflicts reached; call reset_conflicts before restarting",
            ));
        }
        if ip == Ipv4Addr::UNSPECIFIED {
            return Err(AcdError::Configuration("requested ip must not be 0.0.0.0".into()));
        }

        self.requested_ip = ip;
        self.mac = mac;
        self.retry_times = 1;
        self.state = State::Probe {
            pending_announce: false,
        };
        let generation = self.bump_generation();
        let delay_ms = rand.uniform_ms(PROBE_WAIT_MS);

        Ok(vec![
            Action::OpenArpChannel,
            Action::ScheduleTimer { delay_ms, generation },
        ])
    }

    /// Stops the machine. Idempotent; never invokes observer callbacks.
    pub fn stop(&mut self) -> Vec<Action> {
        if !self.is_running() {
            return vec![];
        }
        self.bump_generation();
        self.state = State::Idle;
        vec![Action::CancelTimer, Action::CloseArpChannel]
    }

    /// Clears the lifetime conflict counter and any quiescence. RFC 5227
    /// says only that a host reaching `MAX_CONFLICTS` "should limit the
    /// rate" of further attempts "or deal with the situation in some other
    /// way", without defining what clears that state; this crate exposes
    /// it as an explicit method the caller must invoke after
    /// `on_max_conflicts`, while stopped.
    pub fn reset_conflicts(&mut self) -> Result<(), AcdError> {
        if self.is_running() {
            return Err(AcdError::Misuse("cannot reset conflicts while running"));
        }
        self.conflicts = 0;
        self.quiesced = false;
        self.last_conflict_time_ms = None;
        Ok(())
    }

    /// A scheduled timer fired. `fired_generation` is compared against the
    /// machine's current generation; a stale fire racing a cancellation is
    /// silently dropped.
    pub fn on_timer(&mut self, fired_generation: u64, rand: &mut dyn RandomSource) -> Vec<Action> {
        if fired_generation != self.generation {
            return vec![];
        }

        match self.state {
            State::Probe { pending_announce: false } => {
                let frame = ArpFrame::probe(self.mac, self.requested_ip);
                if self.retry_times < PROBE_NUM {
                    self.retry_times += 1;
                    let generation = self.bump_generation();
                    let delay_ms = PROBE_MIN_MS + rand.uniform_ms(PROBE_MAX_MS - PROBE_MIN_MS);
                    vec![
                        Action::Send(frame),
                        Action::ScheduleTimer { delay_ms, generation },
                    ]
                } else {
                    self.state = State::Probe { pending_announce: true };
                    let generation = self.bump_generation();
                    vec![
                        Action::Send(frame),
                        Action::ScheduleTimer {
                            delay_ms: ANNOUNCE_WAIT_MS,
                            generation,
                        },
                    ]
                }
            }
            State::Probe { pending_announce: true } => {
                self.state = State::Announce;
                self.retry_times = 1;
                let frame = ArpFrame::announce(self.mac, self.requested_ip);
                let generation = self.bump_generation();
                vec![
                    Action::Send(frame),
                    Action::ScheduleTimer {
                        delay_ms: ANNOUNCE_INTERVAL_MS,
                        generation,
                    },
                ]
            }
            State::Announce => {
                if self.retry_times < ANNOUNCE_NUM {
                    self.retry_times += 1;
                    let frame = ArpFrame::announce(self.mac, self.requested_ip);
                    let generation = self.bump_generation();
                    vec![
                        Action::Send(frame),
                        Action::ScheduleTimer {
                            delay_ms: ANNOUNCE_INTERVAL_MS,
                            generation,
                        },
                    ]
                } else {
                    self.state = State::Monitor;
                    vec![Action::NotifyAvailable]
                }
            }
            State::Defend => {
                self.state = State::Monitor;
                vec![]
            }
            State::Monitor | State::Idle => vec![],
        }
    }

    /// An inbound ARP frame was classified as relevant to this candidate
    /// address. RFC 5227 §2.4 tabulates conflict handling for MONITOR and
    /// DEFEND but doesn't give ANNOUNCE its own row, even though its
    /// conflict rule ("address in use by a station other than ourselves")
    /// is identical; this machine treats an ANNOUNCE-phase conflict the
    /// same way as a MONITOR-phase one (see DESIGN.md).
    pub fn on_arp(&mut self, frame: ArpFrame, now_ms: u64) -> Vec<Action> {
        match self.state {
            State::Probe { .. } => {
                if classify(&frame, self.mac, self.requested_ip, true) != Classification::Conflict {
                    return vec![];
                }
                self.conflicts += 1;
                self.bump_generation();
                self.state = State::Idle;

                let mut actions = vec![
                    Action::CancelTimer,
                    Action::CloseArpChannel,
                    Action::NotifyConflict,
                ];
                if self.conflicts >= MAX_CONFLICTS {
                    self.quiesced = true;
                    actions.push(Action::NotifyMaxConflicts);
                }
                actions
            }
            State::Announce | State::Monitor => {
                if classify(&frame, self.mac, self.requested_ip, false) != Classification::Conflict {
                    return vec![];
                }
                self.handle_defend_or_lose(now_ms)
            }
            State::Defend => {
                if classify(&frame, self.mac, self.requested_ip, false) != Classification::Conflict {
                    return vec![];
                }
                self.bump_generation();
                self.state = State::Idle;
                vec![Action::CloseArpChannel, Action::NotifyLost]
            }
            State::Idle => vec![],
        }
    }

    /// External trigger: another subsystem observed a conflict directly
    /// (e.g. via a kernel netlink notification) and asks this host to
    /// defend its address immediately.
    pub fn request_defend(&mut self, now_ms: u64) -> Vec<Action> {
        if self.state != State::Monitor {
            return vec![];
        }
        self.handle_defend_or_lose(now_ms)
    }

    fn handle_defend_or_lose(&mut self, now_ms: u64) -> Vec<Action> {
        let within_rate_limit = self
            .last_conflict_time_ms
            .map(|last| now_ms.saturating_sub(last) < DEFEND_INTERVAL_MS)
            .unwrap_or(false);

        if within_rate_limit {
            self.bump_generation();
            self.state = State::Idle;
            vec![Action::CloseArpChannel, Action::NotifyLost]
        } else {
            self.last_conflict_time_ms = Some(now_ms);
            self.state = State::Defend;
            let frame = ArpFrame::announce(self.mac, self.requested_ip);
            let generation = self.bump_generation();
            vec![
                Action::Send(frame),
                Action::ScheduleTimer {
                    delay_ms: DEFEND_INTERVAL_MS,
                    generation,
                },
            ]
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rand_source::FixedSequence;

    fn mac(n: u8) -> MacAddr {
        MacAddr::new(2, 0, 0, 0, 0, n)
    }

    fn ip(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 0, 2, n)
    }

    #[test]
    fn full_probe_to_available_sequence() {
        let mut m = Machine::new();
        let mut rand = FixedSequence::constant(0);

        let actions = m.start(ip(10), mac(1), &mut rand).unwrap();
        assert_eq!(actions.len(), 2);
        let gen = match actions[1] {
            Action::ScheduleTimer { generation, .. } => generation,
            _ => panic!("expected schedule"),
        };

        let mut sent = Vec::new();
        let mut cur_gen = gen;
        let mut available = false;
        for _ in 0..6 {
            let actions = m.on_timer(cur_gen, &mut rand);
            for a in &actions {
                match a {
                    Action::Send(f) => sent.push(*f),
                    Action::ScheduleTimer { generation, .. } => cur_gen = *generation,
                    Action::NotifyAvailable => available = true,
                    _ => {}
                }
            }
        }

        assert_eq!(sent.len(), 5, "3 probes + 2 announces");
        assert!(sent[0].sender_proto == Ipv4Addr::UNSPECIFIED && sent[0].target_proto == ip(10));
        assert!(sent[2].sender_proto == Ipv4Addr::UNSPECIFIED);
        assert!(sent[3].sender_proto == ip(10) && sent[3].target_proto == ip(10));
        assert!(available);
        assert_eq!(m.state(), State::Monitor);
    }

    #[test]
    fn conflict_during_probe_reports_and_halts() {
        let mut m = Machine::new();
        let mut rand = FixedSequence::constant(0);
        m.start(ip(10), mac(1), &mut rand).unwrap();

        let conflict = ArpFrame {
            operation: crate::arp::ArpOp::Reply,
            sender_hw: mac(2),
            sender_proto: ip(10),
            target_hw: mac(1),
            target_proto: ip(1),
        };
        let actions = m.on_arp(conflict, 1000);
        assert!(actions.contains(&Action::NotifyConflict));
        assert!(actions.contains(&Action::CancelTimer));
        assert_eq!(m.conflicts(), 1);
        assert_eq!(m.state(), State::Idle);
    }

    #[test]
    fn max_conflicts_quiesces_and_blocks_restart() {
        let mut m = Machine::new();
        let mut rand = FixedSequence::constant(0);

        for n in 0..MAX_CONFLICTS {
            m.start(ip(10 + n as u8), mac(1), &mut rand).unwrap();
            let conflict = ArpFrame {
                operation: crate::arp::ArpOp::Reply,
                sender_hw: mac(2),
                sender_proto: ip(10 + n as u8),
                target_hw: mac(1),
                target_proto: ip(1),
            };
            let actions = m.on_arp(conflict, 1000 * n as u64);
            if n + 1 == MAX_CONFLICTS {
                assert!(actions.contains(&Action::NotifyMaxConflicts));
            } else {
                assert!(!actions.contains(&Action::NotifyMaxConflicts));
            }
        }

        assert!(m.start(ip(200), mac(1), &mut rand).is_err());
        m.reset_conflicts().unwrap();
        assert!(m.start(ip(200), mac(1), &mut rand).is_ok());
    }

    #[test]
    fn defend_interval_rate_limits_second_conflict() {
        let mut m = Machine::new();
        let mut rand = FixedSequence::constant(0);
        m.start(ip(10), mac(1), &mut rand).unwrap();

        // drive straight to Monitor
        let mut cur_gen = 1;
        loop {
            let actions = m.on_timer(cur_gen, &mut rand);
            let mut done = false;
            for a in &actions {
                match a {
                    Action::ScheduleTimer { generation, .. } => cur_gen = *generation,
                    Action::NotifyAvailable => done = true,
                    _ => {}
                }
            }
            if done {
                break;
            }
        }
        assert_eq!(m.state(), State::Monitor);

        let conflict = ArpFrame {
            operation: crate::arp::ArpOp::Request,
            sender_hw: mac(2),
            sender_proto: ip(10),
            target_hw: MacAddr::zero(),
            target_proto: ip(10),
        };

        let first = m.on_arp(conflict, 5_000);
        assert!(first.iter().any(|a| matches!(a, Action::Send(_))));
        assert_eq!(m.state(), State::Defend);

        let second = m.on_arp(conflict, 6_000);
        assert!(second.contains(&Action::NotifyLost));
        assert_eq!(m.state(), State::Idle);
    }

    #[test]
    fn stop_after_stop_is_noop() {
        let mut m = Machine::new();
        assert_eq!(m.stop(), Vec::<Action>::new());
        let mut rand = FixedSequence::constant(0);
        m.start(ip(10), mac(1), &mut rand).unwrap();
        assert!(!m.stop().is_empty());
        assert_eq!(m.stop(), Vec::<Action>::new());
    }
}
