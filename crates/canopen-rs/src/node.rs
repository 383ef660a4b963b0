//! `LocalNode`: the composition root binding the Object Dictionary and
//! the SDO/PDO/NMT/EMCY services to a concrete `Bus` and `Clock`, and
//! the frame dispatcher that routes an inbound CAN frame to the service
//! that owns its function code. Also exposes the convenience API a user
//! of the node reaches for directly (`read`/`write`/`trigger_tpdo`/
//! `auto_add_tpdo`/...).
//!
//! The timer callbacks every service schedules need a way back into
//! that service once the timer fires. Since a `Clock` implementation
//! owns the callback independently of `LocalNode`'s borrow, the only
//! sound way to close the loop without an `Arc<Mutex<_>>` indirection
//! is the same one `OdProxy` uses for a locked entry: a raw pointer
//! back to `LocalNode`. The builder functions below take that pointer
//! by value and only dereference it from *inside* the returned boxed
//! closure, so building a callback never itself borrows `self` — only
//! firing one (later, when the clock invokes it) does, and that only
//! happens while nothing else holds a reference into this node.

use crate::bus::Bus;
use crate::clock::{Clock, Generation, TimerHandle};
use crate::emcy::{EmcyService, ErrorType};
use crate::error::Result;
use crate::nmt::{NmtService, NodeState};
use crate::od::{ObjectDictionary, OdValue};
use crate::pdo::{PdoMappingEntry, PdoService};
use crate::sdo::{CompletionCallback, SdoService};
use crate::types::{cob, Access, FunctionCode, Msg};
use alloc::boxed::Box;
use alloc::vec::Vec;
use log::info;

/// Wraps a raw pointer so it can cross the `Send` bound the `Clock`
/// trait's boxed callbacks require. Sound under the same discipline the
/// struct-level `LocalNode` safety comment documents: the pointer is
/// only ever dereferenced from inside the callback, serialized by
/// whatever lock guards access to the node.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SendPtr<T> {}

/// Fixed configuration a `LocalNode` is built with.
pub struct NodeConfig {
    pub node_id: u8,
    pub device_type: u32,
    pub device_name: &'static str,
    pub sdo_segment_timeout_ms: u64,
}

/// A CANopen node: the Object Dictionary plus every service that reads
/// and mutates it, pinned behind a `Box` so the raw pointers the timer
/// closures below capture stay valid for the node's whole lifetime.
///
/// # Safety
/// `LocalNode::new` returns the node already boxed specifically so that
/// `self as *mut Self`, captured by the timer closures passed to
/// `clock`, remains valid: a `Box<LocalNode<_, _>>` is never moved out
/// of once constructed. A captured pointer is only dereferenced from
/// inside a closure that runs later (when a timer fires), never while
/// building the closure, so it never overlaps a live borrow of `self`
/// taken earlier on the same call stack. Firing a timer callback is
/// assumed to happen only while the caller holds whatever lock
/// serializes access to the node, matching the discipline `OdProxy`
/// documents for a locked entry.
pub struct LocalNode<B: Bus, C: Clock> {
    pub od: ObjectDictionary,
    node_id: u8,
    bus: B,
    clock: C,
    nmt: NmtService,
    pdo: PdoService,
    sdo: SdoService,
    emcy: EmcyService,
    state: NodeState,
}

impl<B: Bus, C: Clock> LocalNode<B, C> {
    /// Builds a node and installs the mandatory bootstrap OD entries
    /// (`0x1000`, `0x1001`, `0x1008`, the static type exemplars).
    pub fn new(config: NodeConfig, bus: B, clock: C) -> Result<Box<Self>> {
        let mut od = ObjectDictionary::new();
        od.install_bootstrap_entries(config.device_type, config.device_name)?;
        Ok(Box::new(LocalNode {
            od,
            node_id: config.node_id,
            bus,
            clock,
            nmt: NmtService::new(config.node_id),
            pdo: PdoService::new(),
            sdo: SdoService::new(config.sdo_segment_timeout_ms),
            emcy: EmcyService::new(config.node_id),
            state: NodeState::Bootup,
        }))
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    // --- Timer callback builders. None of these take `&mut self`: they
    // capture `self_ptr` by value and only dereference it once invoked,
    // so calling one never competes with a borrow already on the stack.

    fn build_sdo_timeout_cb(self_ptr: *mut Self, key: u32, generation: Generation) -> Box<dyn FnMut() + Send> {
        let self_ptr = SendPtr(self_ptr);
        Box::new(move || {
            let self_ptr = self_ptr;
            // SAFETY: see the struct-level comment.
            let node = unsafe { &mut *self_ptr.0 };
            node.sdo.transaction_timeout(key, generation, &mut node.bus, &mut node.clock);
        })
    }

    fn build_rpdo_timeout_cb(self_ptr: *mut Self, cobid: u32, generation: Generation) -> Box<dyn FnMut() + Send> {
        let self_ptr = SendPtr(self_ptr);
        Box::new(move || {
            let self_ptr = self_ptr;
            // SAFETY: see the struct-level comment.
            let node = unsafe { &mut *self_ptr.0 };
            node.pdo.rpdo_timeout(cobid, generation);
        })
    }

    fn build_heartbeat_timeout_cb(self_ptr: *mut Self, peer: u8, generation: Generation) -> Box<dyn FnMut() + Send> {
        let self_ptr = SendPtr(self_ptr);
        Box::new(move || {
            let self_ptr = self_ptr;
            // SAFETY: see the struct-level comment.
            let node = unsafe { &mut *self_ptr.0 };
            node.nmt.heartbeat_timeout(peer, generation);
        })
    }

    fn build_tpdo_event_cb(self_ptr: *mut Self, pdo_num: u16, generation: Generation) -> Box<dyn FnMut() + Send> {
        let self_ptr = SendPtr(self_ptr);
        Box::new(move || {
            let self_ptr = self_ptr;
            // SAFETY: see the struct-level comment.
            let node = unsafe { &mut *self_ptr.0 };
            node.pdo.tpdo_event_fired(pdo_num, generation, &mut node.od, &mut node.bus);
        })
    }

    /// Arms every event-driven TPDO/RPDO timeout timer, wiring each
    /// one's firing back into this node.
    fn enable_pdo_events(&mut self) {
        let self_ptr = self as *mut Self;
        let mut make_rpdo_cb = |cobid: u32, generation: Generation| Self::build_rpdo_timeout_cb(self_ptr, cobid, generation);
        let mut make_tpdo_cb = |pdo_num: u16, generation: Generation| Self::build_tpdo_event_cb(self_ptr, pdo_num, generation);
        self.pdo.enable_pdo_events(&mut self.od, &mut self.clock, &mut make_rpdo_cb, &mut make_tpdo_cb);
    }

    /// Re-arms every TPDO whose COB-ID or event-timer sub-index was
    /// written since the last drain (queued by the OD-change callback
    /// `PdoService::add_tpdo` registers), picking the change up without
    /// waiting for a full `enable_pdo_events` pass.
    fn rearm_dirty_tpdos(&mut self) {
        let pending = self.pdo.take_pending_tpdo_rearms();
        if pending.is_empty() {
            return;
        }
        let self_ptr = self as *mut Self;
        let mut make_tpdo_cb = |pdo_num: u16, generation: Generation| Self::build_tpdo_event_cb(self_ptr, pdo_num, generation);
        self.pdo.rearm_tpdo_events(&pending, &mut self.od, &mut self.clock, &mut make_tpdo_cb);
    }

    /// Routes an inbound frame to the service that owns its function
    /// code. PDO traffic is dropped outside `Operational`.
    pub fn process_frame(&mut self, msg: &Msg) {
        let self_ptr = self as *mut Self;
        match cob::function_code(msg.id) {
            FunctionCode::Nmt => {
                if let Some(now_operational) = self.nmt.process_command(msg) {
                    if now_operational {
                        self.enable_pdo_events();
                    } else {
                        self.pdo.disable_pdo_events(&mut self.clock);
                    }
                }
                self.state = self.nmt.local_state();
            }
            FunctionCode::Emcy => {
                let sender = (msg.id & 0x7F) as u8;
                self.emcy.process_msg(sender, msg);
            }
            FunctionCode::Pdo => {
                if self.state != NodeState::Operational {
                    return;
                }
                let mut make_cb = |cobid: u32, generation: Generation| Self::build_rpdo_timeout_cb(self_ptr, cobid, generation);
                self.pdo.process_msg(msg.id, msg, &mut self.od, &mut self.bus, &mut self.clock, &mut make_cb);
            }
            FunctionCode::Sdo => {
                let mut make_cb = |key: u32, generation: Generation| Self::build_sdo_timeout_cb(self_ptr, key, generation);
                self.sdo.process_msg(msg.id, msg, &mut self.od, &mut self.bus, &mut self.clock, &mut make_cb);
                self.rearm_dirty_tpdos();
            }
            FunctionCode::Heartbeat => {
                let node = (msg.id - cob::HEARTBEAT) as u8;
                let mut make_cb = |peer: u8, generation: Generation| Self::build_heartbeat_timeout_cb(self_ptr, peer, generation);
                self.nmt.process_heartbeat(node, msg, &mut self.clock, &mut make_cb);
            }
            FunctionCode::Sync | FunctionCode::Timestamp | FunctionCode::Unknown => {
                info!("unhandled cobid {:#05x}", msg.id);
            }
        }
    }

    /// Transitions local NMT state, (de)arming PDO event timers on entry
    /// to/exit from `Operational`. A no-op if the state is unchanged.
    pub fn set_state(&mut self, new_state: NodeState) {
        if new_state == self.state {
            return;
        }
        info!("state -> {:?}", new_state);
        if new_state == NodeState::Operational {
            self.enable_pdo_events();
        } else {
            self.pdo.disable_pdo_events(&mut self.clock);
        }
        self.state = new_state;
    }

    /// Registers this node as an SDO server, replying to `sdo_id`'s
    /// convention (`0x600+id` request, `0x580+id` response).
    pub fn add_sdo_server(&mut self, sdo_id: u8, remote_node: u8) {
        self.sdo.add_sdo_server(cob::sdo_server_rx(sdo_id), cob::sdo_server_tx(sdo_id), remote_node);
    }

    /// Registers an SDO client parameter record (`0x1280+i`) targeting
    /// `remote_node`, so `read`/`write` below can find it.
    pub fn add_sdo_client(&mut self, client_idx: u16, remote_node: u8) -> Result<()> {
        let idx = crate::od::constants::IDX_SDO_CLIENT_PARAM_START + client_idx;
        self.od.insert(idx, 1, Access::Ro, OdValue::U32(cob::sdo_server_rx(remote_node)))?;
        self.od.insert(idx, 2, Access::Ro, OdValue::U32(cob::sdo_server_tx(remote_node)))?;
        self.od.insert(idx, 3, Access::Ro, OdValue::U8(remote_node))?;
        Ok(())
    }

    /// Starts an SDO read against `remote_node`'s `(index, sub_index)`.
    pub fn read(&mut self, remote_node: u8, index: u16, sub_index: u8, callback: Option<CompletionCallback>) -> Result<()> {
        let self_ptr = self as *mut Self;
        let mut make_cb = |key: u32, generation: Generation| Self::build_sdo_timeout_cb(self_ptr, key, generation);
        self.sdo.client_transaction(true, remote_node, index, sub_index, &mut self.od, &mut self.bus, &mut self.clock, &mut make_cb, callback)
    }

    /// Starts an SDO write against `remote_node`'s `(index, sub_index)`;
    /// the local OD value at that coordinate is the source transmitted.
    pub fn write(&mut self, remote_node: u8, index: u16, sub_index: u8, callback: Option<CompletionCallback>) -> Result<()> {
        let self_ptr = self as *mut Self;
        let mut make_cb = |key: u32, generation: Generation| Self::build_sdo_timeout_cb(self_ptr, key, generation);
        self.sdo.client_transaction(false, remote_node, index, sub_index, &mut self.od, &mut self.bus, &mut self.clock, &mut make_cb, callback)
    }

    pub fn add_tpdo(&mut self, pdo_num: u16, cobid: u32, mapping: &[PdoMappingEntry], period_ms: u16, enabled: bool) -> Result<()> {
        self.pdo.add_tpdo(pdo_num, cobid, mapping, period_ms, enabled, &mut self.od)?;
        self.rearm_dirty_tpdos();
        Ok(())
    }

    pub fn add_rpdo(&mut self, pdo_num: u16, cobid: u32, mapping: &[PdoMappingEntry], timeout_ms: u16, timeout_callback: Option<Box<dyn FnMut(u32) + Send>>) -> Result<()> {
        self.pdo.add_rpdo(pdo_num, cobid, mapping, timeout_ms, timeout_callback, &mut self.od)
    }

    /// Mapping helper for entries already living in the auto-insert
    /// range: caller provides `(index, sub_index, bit_length)` triples
    /// directly rather than calling `od.auto_insert` itself first.
    pub fn auto_add_tpdo(&mut self, pdo_num: u16, cobid: u32, period_ms: u16, entries: &[(u16, u8, u8)]) -> Result<()> {
        let mapping: Vec<PdoMappingEntry> =
            entries.iter().map(|&(index, sub_index, bit_length)| PdoMappingEntry { index, sub_index, bit_length }).collect();
        self.add_tpdo(pdo_num, cobid, &mapping, period_ms, true)
    }

    pub fn auto_add_rpdo(&mut self, pdo_num: u16, cobid: u32, entries: &[(u16, u8, u8)]) -> Result<()> {
        let mapping: Vec<PdoMappingEntry> =
            entries.iter().map(|&(index, sub_index, bit_length)| PdoMappingEntry { index, sub_index, bit_length }).collect();
        self.add_rpdo(pdo_num, cobid, &mapping, 0, None)
    }

    pub fn trigger_tpdo(&mut self, pdo_num: u16, async_send: bool) -> Result<()> {
        self.pdo.send_tx_pdo(pdo_num, async_send, false, &mut self.od, &mut self.bus)
    }

    pub fn trigger_all_tpdos(&mut self) {
        self.pdo.send_all_tpdos(&mut self.od, &mut self.bus);
    }

    /// Sets this node's heartbeat producer period and arms the periodic
    /// transmit timer that calls `send_heartbeat` on every firing.
    pub fn set_heartbeat_period(&mut self, period_ms: u16) -> Result<()> {
        let self_ptr = SendPtr(self as *mut Self);
        let producer_cb: Box<dyn FnMut() + Send> = Box::new(move || {
            let self_ptr = self_ptr;
            // SAFETY: see the struct-level comment.
            let node = unsafe { &mut *self_ptr.0 };
            let _ = node.nmt.send_heartbeat(&mut node.bus);
        });
        self.nmt.set_heartbeat_producer_time(period_ms, &mut self.od, &mut self.clock, producer_cb)
    }

    pub fn set_remote_timeout(&mut self, node: u8, timeout_ms: u32) -> Result<()> {
        self.nmt.set_remote_timeout(node, timeout_ms, &mut self.od)
    }

    pub fn register_remote_state_cb(&mut self, node: u8, cb: Box<dyn FnMut(u8, NodeState) + Send>) -> Result<()> {
        self.nmt.subscribe_remote_state(node, cb)
    }

    pub fn remote_state(&self, node: u8) -> Option<NodeState> {
        self.nmt.remote_state(node)
    }

    pub fn send_emcy(&mut self, error: u16, specific: [u8; 5], error_type: ErrorType) -> Result<()> {
        self.emcy.send_emcy(error, specific, error_type, &mut self.od, &mut self.bus)
    }

    pub fn clear_emcy(&mut self, error: u16, error_type: ErrorType) -> Result<()> {
        self.emcy.clear_emcy(error, error_type, &mut self.od, &mut self.bus)
    }

    pub fn register_emcy_callback(&mut self, cb: Box<dyn FnMut(u8, u16, [u8; 5]) + Send>) {
        self.emcy.register_callback(cb);
    }

    /// Drops every in-flight SDO transaction, notifying their callbacks.
    /// Used for node teardown.
    pub fn shutdown(&mut self) {
        self.sdo.clear(&mut self.clock);
        self.pdo.disable_pdo_events(&mut self.clock);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct RecordingBus {
        sent: Vec<Msg>,
    }
    impl Bus for RecordingBus {
        fn write(&mut self, msg: &Msg, _async_send: bool) -> Result<()> {
            self.sent.push(msg.clone());
            Ok(())
        }
    }

    struct FakeClock {
        next_handle: u64,
    }
    impl Clock for FakeClock {
        fn schedule_delayed(&mut self, _ms: u64, cb: Box<dyn FnMut() + Send>) -> TimerHandle {
            core::mem::drop(cb);
            self.next_handle += 1;
            TimerHandle(self.next_handle)
        }
        fn schedule_periodic(&mut self, _ms: u64, cb: Box<dyn FnMut() + Send>, _staggered_start: bool) -> TimerHandle {
            core::mem::drop(cb);
            self.next_handle += 1;
            TimerHandle(self.next_handle)
        }
        fn delete_timer(&mut self, _handle: &TimerHandle) {}
    }

    #[test]
    fn heartbeat_frame_updates_peer_state() {
        let config = NodeConfig { node_id: 5, device_type: 0, device_name: "test", sdo_segment_timeout_ms: 500 };
        let mut node = LocalNode::new(config, RecordingBus { sent: Vec::new() }, FakeClock { next_handle: 0 }).unwrap();
        node.set_remote_timeout(3, 1000).unwrap();
        let msg = Msg::new(cob::heartbeat(3), &[NodeState::Operational as u8]);
        node.process_frame(&msg);
        assert_eq!(node.remote_state(3), Some(NodeState::Operational));
    }

    #[test]
    fn expedited_upload_request_answers_on_bus() {
        let config = NodeConfig { node_id: 5, device_type: 0, device_name: "test", sdo_segment_timeout_ms: 500 };
        let mut node = LocalNode::new(config, RecordingBus { sent: Vec::new() }, FakeClock { next_handle: 0 }).unwrap();
        node.od.insert(0x2010, 0, Access::Ro, OdValue::U16(0xBEEF)).unwrap();
        node.add_sdo_server(5, 10);
        let mut req_data = [0u8; 8];
        req_data[0] = crate::sdo::protocol::CS_UPLOAD_INITIATE_REQ << 5;
        req_data[1..3].copy_from_slice(&0x2010u16.to_le_bytes());
        let req = Msg::new(cob::sdo_server_rx(5), &req_data);
        node.process_frame(&req);
        assert_eq!(node.bus.sent.len(), 1);
        assert_eq!(node.bus.sent[0].id, cob::sdo_server_tx(5));
    }

    #[test]
    fn add_tpdo_after_operational_arms_its_event_timer() {
        let config = NodeConfig { node_id: 5, device_type: 0, device_name: "test", sdo_segment_timeout_ms: 500 };
        let mut node = LocalNode::new(config, RecordingBus { sent: Vec::new() }, FakeClock { next_handle: 0 }).unwrap();
        node.set_state(NodeState::Operational);
        let handles_before = node.clock.next_handle;

        node.od.insert(0x6000, 1, Access::Ro, OdValue::U16(0)).unwrap();
        node.auto_add_tpdo(1, 0x181, 100, &[(0x6000, 1, 16)]).unwrap();

        assert!(node.clock.next_handle > handles_before, "adding a TPDO once operational should arm its periodic timer right away");
    }

    #[test]
    fn sdo_write_to_tpdo_event_timer_rearms_it() {
        let config = NodeConfig { node_id: 5, device_type: 0, device_name: "test", sdo_segment_timeout_ms: 500 };
        let mut node = LocalNode::new(config, RecordingBus { sent: Vec::new() }, FakeClock { next_handle: 0 }).unwrap();
        node.od.insert(0x6000, 1, Access::Ro, OdValue::U16(0)).unwrap();
        node.auto_add_tpdo(1, 0x181, 100, &[(0x6000, 1, 16)]).unwrap();
        node.set_state(NodeState::Operational);
        let handles_after_enable = node.clock.next_handle;

        node.add_sdo_server(5, 10);
        let req = crate::sdo::protocol::download_initiate(cob::sdo_server_rx(5), 0x1801, 5, &250u16.to_le_bytes(), None);
        node.process_frame(&req);

        assert!(
            node.clock.next_handle > handles_after_enable,
            "an SDO write to the TPDO's event-timer sub-index should re-arm its timer"
        );
    }

    #[test]
    fn set_state_operational_arms_pdo_events() {
        let config = NodeConfig { node_id: 5, device_type: 0, device_name: "test", sdo_segment_timeout_ms: 500 };
        let mut node = LocalNode::new(config, RecordingBus { sent: Vec::new() }, FakeClock { next_handle: 0 }).unwrap();
        assert_eq!(node.state(), NodeState::Bootup);
        node.set_state(NodeState::Operational);
        assert_eq!(node.state(), NodeState::Operational);
    }
}
