//! Local NMT state machine, heartbeat producer, and heartbeat-based
//! peer supervision. Incoming command frames drive the local state
//! machine; `set_remote_timeout`/heartbeat reception drive the peer
//! table; `reset_node`/`reset_comms` hooks stay distinct from (and are
//! fired alongside) the state transition itself, by default no-ops.

use crate::bus::Bus;
use crate::clock::{Clock, Generation, GenerationCounter, TimerHandle};
use crate::error::Result;
use crate::od::{constants, ObjectDictionary, OdValue};
use crate::types::{cob, Access, Msg};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, info, warn};

pub const NODE_ALL: u8 = 0;
pub const ALL_NODES: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Bootup = 0x00,
    Stopped = 0x04,
    Operational = 0x05,
    PreOperational = 0x7F,
    /// Not a wire value; the state before the node's first transition.
    Offline = 0xFF,
}

impl NodeState {
    fn from_cs(cs: u8) -> Option<Self> {
        match cs {
            1 => Some(NodeState::Operational),
            2 => Some(NodeState::Stopped),
            0x80 | 0x81 | 0x82 => Some(NodeState::PreOperational),
            _ => None,
        }
    }
}

struct PeerEntry {
    state: NodeState,
    timeout_ms: u32,
    timer: TimerHandle,
    generation: Generation,
}

type RemoteStateCallback = Box<dyn FnMut(u8, NodeState) + Send>;
type ResetHook = Box<dyn FnMut() + Send>;

/// Builds the closure the consumer-heartbeat timeout timer fires for
/// `node`. `LocalNode` supplies this, closing over a raw pointer back to
/// itself so the fired timer can call `heartbeat_timeout` tagged with
/// the generation captured at arming time.
pub type HeartbeatTimeoutCbFactory<'a> = &'a mut dyn FnMut(u8, Generation) -> Box<dyn FnMut() + Send>;

const MAX_REMOTE_CALLBACKS: usize = 4;

/// Owns the local NMT state, the heartbeat producer timer, and the peer
/// table for heartbeat consumption.
pub struct NmtService {
    node_id: u8,
    local_state: NodeState,
    peers: BTreeMap<u8, PeerEntry>,
    producer_timer: Option<TimerHandle>,
    generation: GenerationCounter,
    callbacks: Vec<(u8, RemoteStateCallback)>,
    on_reset_node: Option<ResetHook>,
    on_reset_comms: Option<ResetHook>,
}

impl NmtService {
    pub fn new(node_id: u8) -> Self {
        NmtService {
            node_id,
            local_state: NodeState::Bootup,
            peers: BTreeMap::new(),
            producer_timer: None,
            generation: GenerationCounter::default(),
            callbacks: Vec::new(),
            on_reset_node: None,
            on_reset_comms: None,
        }
    }

    pub fn local_state(&self) -> NodeState {
        self.local_state
    }

    pub fn set_on_reset_node(&mut self, hook: ResetHook) {
        self.on_reset_node = Some(hook);
    }

    pub fn set_on_reset_comms(&mut self, hook: ResetHook) {
        self.on_reset_comms = Some(hook);
    }

    /// Registers a remote-state subscriber for `node` (or `ALL_NODES`).
    /// The subscriber table is fixed-size; a call past the fourth slot
    /// returns an error instead of growing it.
    pub fn subscribe_remote_state(&mut self, node: u8, cb: RemoteStateCallback) -> Result<()> {
        if self.callbacks.len() >= MAX_REMOTE_CALLBACKS {
            return Err(crate::error::CanOpenError::OutOfMemory);
        }
        self.callbacks.push((node, cb));
        Ok(())
    }

    fn notify(&mut self, node: u8, state: NodeState) {
        for (sub_node, cb) in self.callbacks.iter_mut() {
            if *sub_node == node || *sub_node == ALL_NODES {
                cb(node, state);
            }
        }
    }

    /// Processes an NMT command frame (COB-ID 0). Applies only if
    /// addressed to us (`node == 0` or `node == self.node_id`). Returns
    /// `Some(now_operational)` when the command changed whether the node
    /// is `Operational`, so the caller can (de)arm PDO event timers
    /// without this service reaching back into them directly.
    pub fn process_command(&mut self, msg: &Msg) -> Option<bool> {
        if msg.data.len() < 2 {
            warn!("NMT command frame too short");
            return None;
        }
        let cs = msg.data[0];
        let node = msg.data[1];
        if node != NODE_ALL && node != self.node_id {
            return None;
        }
        let Some(new_state) = NodeState::from_cs(cs) else {
            warn!("NMT unknown command specifier {:#04x}", cs);
            return None;
        };
        let was_operational = self.local_state == NodeState::Operational;
        self.local_state = new_state;
        info!("NMT local state -> {:?}", new_state);
        if cs == 0x81 {
            if let Some(hook) = self.on_reset_node.as_mut() {
                hook();
            }
        } else if cs == 0x82 {
            if let Some(hook) = self.on_reset_comms.as_mut() {
                hook();
            }
        }
        let now_operational = new_state == NodeState::Operational;
        (now_operational != was_operational).then_some(now_operational)
    }

    /// Writes the heartbeat producer period to `0x1017[0]` and
    /// (re)arms the periodic transmit timer. A period of 0 disables
    /// the producer.
    pub fn set_heartbeat_producer_time(
        &mut self,
        period_ms: u16,
        od: &mut ObjectDictionary,
        clock: &mut dyn Clock,
        producer_cb: Box<dyn FnMut() + Send>,
    ) -> Result<()> {
        if !od.entry_exists(constants::IDX_PRODUCER_HEARTBEAT_TIME, 0) {
            od.insert(constants::IDX_PRODUCER_HEARTBEAT_TIME, 0, Access::Rw, OdValue::U16(period_ms))?;
        } else {
            od.set_raw(constants::IDX_PRODUCER_HEARTBEAT_TIME, 0, OdValue::U16(period_ms))?;
        }
        if let Some(handle) = self.producer_timer.take() {
            clock.delete_timer(&handle);
        }
        if period_ms != 0 {
            self.producer_timer = Some(clock.schedule_periodic(period_ms as u64, producer_cb, true));
        }
        Ok(())
    }

    /// Emits a one-byte heartbeat frame: `id = 0x700+node_id`, payload
    /// is the current local state.
    pub fn send_heartbeat(&self, bus: &mut dyn Bus) -> Result<()> {
        let frame = Msg::new(cob::heartbeat(self.node_id), &[self.local_state as u8]);
        bus.write(&frame, false)
    }

    /// Persists a consumer timeout for `node` to `0x1016[0]` as
    /// `(node<<16)|timeout_ms` and installs or updates the peer entry.
    pub fn set_remote_timeout(&mut self, node: u8, timeout_ms: u32, od: &mut ObjectDictionary) -> Result<()> {
        let packed = ((node as u32) << 16) | (timeout_ms & 0xFFFF);
        if !od.entry_exists(constants::IDX_CONSUMER_HEARTBEAT_TIME, 0) {
            od.insert(constants::IDX_CONSUMER_HEARTBEAT_TIME, 0, Access::Rw, OdValue::U32(packed))?;
        } else {
            od.set_raw(constants::IDX_CONSUMER_HEARTBEAT_TIME, 0, OdValue::U32(packed))?;
        }
        self.peers.entry(node).or_insert_with(|| PeerEntry {
            state: NodeState::Offline,
            timeout_ms: 0,
            timer: TimerHandle::default(),
            generation: Generation::default(),
        }).timeout_ms = timeout_ms;
        Ok(())
    }

    /// Processes a heartbeat frame from `node` (COB-ID `0x700+node`).
    pub fn process_heartbeat(&mut self, node: u8, msg: &Msg, clock: &mut dyn Clock, make_timeout_cb: HeartbeatTimeoutCbFactory) {
        if msg.data.is_empty() {
            return;
        }
        let Some(new_state) = decode_state(msg.data[0]) else {
            warn!("heartbeat from node {} carries unknown state {:#04x}", node, msg.data[0]);
            return;
        };
        let generation = self.generation.next();
        let timeout_ms = self.peers.get(&node).map(|p| p.timeout_ms).unwrap_or(0);
        let peer = self.peers.entry(node).or_insert_with(|| PeerEntry {
            state: NodeState::Offline,
            timeout_ms,
            timer: TimerHandle::default(),
            generation,
        });
        clock.delete_timer(&peer.timer);
        let changed = peer.state != new_state;
        peer.state = new_state;
        peer.generation = generation;
        if peer.timeout_ms != 0 {
            peer.timer = clock.schedule_delayed(peer.timeout_ms as u64, make_timeout_cb(node, generation));
        }
        debug!("heartbeat from node {}: state {:?}", node, new_state);
        if changed {
            self.notify(node, new_state);
        }
    }

    /// Fired when a peer's heartbeat timeout expires; a stale
    /// generation (a heartbeat arrived since, or the timeout was
    /// reconfigured) is ignored.
    pub fn heartbeat_timeout(&mut self, node: u8, generation: Generation) {
        let Some(peer) = self.peers.get_mut(&node) else { return };
        if peer.generation != generation {
            return;
        }
        warn!("node {} heartbeat timed out, marking offline", node);
        peer.state = NodeState::Offline;
        self.notify(node, NodeState::Offline);
    }

    pub fn remote_state(&self, node: u8) -> Option<NodeState> {
        self.peers.get(&node).map(|p| p.state)
    }
}

fn decode_state(byte: u8) -> Option<NodeState> {
    match byte {
        0x00 => Some(NodeState::Bootup),
        0x04 => Some(NodeState::Stopped),
        0x05 => Some(NodeState::Operational),
        0x7F => Some(NodeState::PreOperational),
        _ => None,
    }
}
