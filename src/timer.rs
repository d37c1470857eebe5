//! Timer adapter for RFC 5227's probe/announce/rate-limit delays.
//! Cancellation does not need to race-proof itself against an in-flight
//! fire — `machine::Machine` already tags every scheduled callback with a
//! generation counter and drops stale fires — so adapters here only need
//! to deliver fires promptly, not guarantee a cancelled one never arrives.

use std::collections::BinaryHeap;
use std::cmp::Reverse;

use async_std::channel::{self, Receiver, Sender};
use async_std::task;
use std::time::Duration;

/// One fired timer, tagged with the generation it was scheduled under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub generation: u64,
}

pub trait Timer {
    type Handle;

    fn schedule(&mut self, delay_ms: u64, generation: u64) -> Self::Handle;
    fn cancel(&mut self, handle: Self::Handle);
}

/// Live adapter: spawns an `async-std` task per scheduled timer and
/// delivers fires over a channel the event loop races against arp
/// readability.
pub struct AsyncStdTimer {
    tx: Sender<TimerFired>,
    rx: Receiver<TimerFired>,
}

impl AsyncStdTimer {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Blocks the calling async task until the next timer fires.
    pub async fn wait_fired(&self) -> TimerFired {
        // the sender is always kept alive by `self`, so this never yields None
        self.rx.recv().await.expect("timer sender dropped")
    }
}

impl Default for AsyncStdTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for AsyncStdTimer {
    type Handle = ();

    fn schedule(&mut self, delay_ms: u64, generation: u64) -> Self::Handle {
        let tx = self.tx.clone();
        task::spawn(async move {
            task::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(TimerFired { generation }).await;
        });
    }

    fn cancel(&mut self, _handle: Self::Handle) {
        // Intentionally a no-op: the machine's generation counter is the
        // source of truth for "is this fire still relevant", so there is
        // nothing further to do here — see module docs.
    }
}

/// Deterministic adapter for scenario tests: `schedule` records a due time
/// against a clock the test drives by hand; `advance` fires everything due,
/// in the order they were due.
#[derive(Default)]
pub struct VirtualTimer {
    now_ms: u64,
    pending: BinaryHeap<Reverse<(u64, u64)>>, // (due_at_ms, generation)
}

impl VirtualTimer {
    pub fn new() -> Self {
        Self {
            now_ms: 0,
            pending: BinaryHeap::new(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Advances the virtual clock and returns every timer fire due at or
    /// before the new time, in due-time order.
    pub fn advance(&mut self, ms: u64) -> Vec<TimerFired> {
        self.now_ms += ms;
        let mut fired = Vec::new();
        while let Some(&Reverse((due, generation))) = self.pending.peek() {
            if due > self.now_ms {
                break;
            }
            self.pending.pop();
            fired.push(TimerFired { generation });
        }
        fired
    }
}

impl Timer for VirtualTimer {
    type Handle = ();

    fn schedule(&mut self, delay_ms: u64, generation: u64) -> Self::Handle {
        self.pending.push(Reverse((self.now_ms + delay_ms, generation)));
    }

    fn cancel(&mut self, _handle: Self::Handle) {
        // Stale entries left in `pending` are harmless: `advance` still
        // delivers them, but `Machine::on_timer` drops anything whose
        // generation no longer matches.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_timer_fires_in_due_order() {
        let mut t = VirtualTimer::new();
        t.schedule(500, 1);
        t.schedule(100, 2);
        assert_eq!(t.advance(50), vec![]);
        let fired = t.advance(100);
        assert_eq!(fired, vec![TimerFired { generation: 2 }]);
        let fired = t.advance(400);
        assert_eq!(fired, vec![TimerFired { generation: 1 }]);
    }
}
