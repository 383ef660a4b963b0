//! A deterministic two-node bus simulator for the scenario tests,
//! in the same tick-driven `VirtualNetwork` style used elsewhere in this
//! codebase, but adapted to this crate's callback-based `Bus`/`Clock`
//! collaborators instead of a poll-based `run_cycle`.
//!
//! `LocalNode` owns its `Bus`/`Clock` by value and never exposes them, so
//! this harness can't reach into a node to drain its outbox or fire a
//! due timer directly. Instead `VirtualBus`/`VirtualClock` each keep
//! their real state behind an `Rc<RefCell<_>>` and hand the test driver
//! a second, cheaply-cloned handle onto the same state at construction
//! time — the same trick a platform's `ThreadClock` plays with a channel
//! back to its owning thread, just single-threaded and synchronous here.
//! Firing a due timer therefore never holds a borrow into the owning
//! `LocalNode`: the callback is pulled out of the shared state and
//! invoked only after that borrow has ended, so its re-entry into the
//! node through the usual `self_ptr` discipline never overlaps one.

use canopen_rs::bus::Bus;
use canopen_rs::clock::{Clock, TimerHandle};
use canopen_rs::error::Result;
use canopen_rs::node::{LocalNode, NodeConfig};
use canopen_rs::types::Msg;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

#[derive(Clone)]
pub struct VirtualBus {
    outbox: Rc<RefCell<VecDeque<Msg>>>,
}

pub struct BusHandle {
    outbox: Rc<RefCell<VecDeque<Msg>>>,
}

impl VirtualBus {
    pub fn new() -> (Self, BusHandle) {
        let outbox = Rc::new(RefCell::new(VecDeque::new()));
        (VirtualBus { outbox: outbox.clone() }, BusHandle { outbox })
    }
}

impl Bus for VirtualBus {
    fn write(&mut self, msg: &Msg, _async_send: bool) -> Result<()> {
        self.outbox.borrow_mut().push_back(msg.clone());
        Ok(())
    }
}

struct PendingTimer {
    handle: TimerHandle,
    due: u64,
    period: Option<u64>,
    cb: Option<Box<dyn FnMut() + Send>>,
    cancelled: bool,
}

struct ClockState {
    now: u64,
    next_handle: u64,
    pending: Vec<PendingTimer>,
}

impl ClockState {
    fn schedule(&mut self, ms: u64, cb: Box<dyn FnMut() + Send>, period: Option<u64>) -> TimerHandle {
        self.next_handle += 1;
        let handle = TimerHandle(self.next_handle);
        self.pending.push(PendingTimer { handle, due: self.now + ms, period, cb: Some(cb), cancelled: false });
        handle
    }

    /// Pulls the earliest non-cancelled timer due at or before
    /// `deadline` out of the pending list. Cancelled entries are swept
    /// as they're walked.
    fn take_next_due(&mut self, deadline: u64) -> Option<(TimerHandle, u64, Option<u64>, Box<dyn FnMut() + Send>)> {
        self.pending.retain(|t| !t.cancelled);
        let idx = self.pending.iter().enumerate().filter(|(_, t)| t.due <= deadline).min_by_key(|(_, t)| t.due).map(|(i, _)| i)?;
        let timer = self.pending.remove(idx);
        let cb = timer.cb.expect("pending timer missing its callback");
        Some((timer.handle, timer.due, timer.period, cb))
    }
}

#[derive(Clone)]
pub struct VirtualClock {
    state: Rc<RefCell<ClockState>>,
}

pub struct ClockHandle {
    state: Rc<RefCell<ClockState>>,
}

impl VirtualClock {
    pub fn new() -> (Self, ClockHandle) {
        let state = Rc::new(RefCell::new(ClockState { now: 0, next_handle: 0, pending: Vec::new() }));
        (VirtualClock { state: state.clone() }, ClockHandle { state })
    }
}

impl Clock for VirtualClock {
    fn schedule_delayed(&mut self, ms: u64, cb: Box<dyn FnMut() + Send>) -> TimerHandle {
        self.state.borrow_mut().schedule(ms, cb, None)
    }

    fn schedule_periodic(&mut self, ms: u64, cb: Box<dyn FnMut() + Send>, _staggered_start: bool) -> TimerHandle {
        self.state.borrow_mut().schedule(ms, cb, Some(ms))
    }

    fn delete_timer(&mut self, handle: &TimerHandle) {
        let mut state = self.state.borrow_mut();
        if let Some(t) = state.pending.iter_mut().find(|t| t.handle == *handle) {
            t.cancelled = true;
        }
    }
}

impl ClockHandle {
    /// Advances virtual time by `ms`, firing every timer that falls due
    /// along the way, not just whatever is due at the final instant —
    /// otherwise a single large jump could skip an intermediate firing
    /// that should have superseded a later one.
    pub fn advance(&self, ms: u64) {
        let deadline = self.state.borrow().now + ms;
        loop {
            let next = self.state.borrow_mut().take_next_due(deadline);
            let Some((handle, due, period, mut cb)) = next else { break };
            self.state.borrow_mut().now = due;
            cb();
            if let Some(period) = period {
                self.state.borrow_mut().pending.push(PendingTimer {
                    handle,
                    due: due + period,
                    period: Some(period),
                    cb: Some(cb),
                    cancelled: false,
                });
            }
        }
        self.state.borrow_mut().now = deadline;
    }
}

pub type TestNode = LocalNode<VirtualBus, VirtualClock>;

pub fn make_node(node_id: u8) -> (Box<TestNode>, BusHandle, ClockHandle) {
    let (bus, bus_handle) = VirtualBus::new();
    let (clock, clock_handle) = VirtualClock::new();
    let config = NodeConfig { node_id, device_type: 0, device_name: "scenario-test", sdo_segment_timeout_ms: 500 };
    let node = LocalNode::new(config, bus, clock).unwrap();
    (node, bus_handle, clock_handle)
}

/// Delivers every frame queued in `a`'s outbox to `b`, then whatever `b`
/// queued in response back to `a`, and so on until both are quiet.
/// Models a shared bus without a full broadcast network: the scenario
/// tests only ever need point-to-point exchanges between two nodes.
pub fn pump(a: &mut TestNode, a_bus: &BusHandle, b: &mut TestNode, b_bus: &BusHandle) {
    loop {
        let from_a: Vec<Msg> = a_bus.outbox.borrow_mut().drain(..).collect();
        let from_b: Vec<Msg> = b_bus.outbox.borrow_mut().drain(..).collect();
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
        for msg in from_a {
            b.process_frame(&msg);
        }
        for msg in from_b {
            a.process_frame(&msg);
        }
    }
}
