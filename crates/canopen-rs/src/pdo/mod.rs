//! Process Data Object transmission scheduling and reception.
//! `add_tpdo`/`add_rpdo` build the communication + mapping OD records
//! and arm timers, sending packs mapped entries into a frame, and
//! receiving applies a received RPDO's bytes back into the OD.

pub mod mapping;

pub use mapping::PdoMappingEntry;

use crate::bus::Bus;
use crate::clock::{Clock, Generation, GenerationCounter, TimerHandle};
use crate::error::{CanOpenError, Result};
use crate::od::{constants, ChangeCallback, ObjectDictionary, OdValue};
use crate::types::Msg;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, warn};

type RpdoTimeoutCallback = Box<dyn FnMut(u32) + Send>;

/// Wraps a raw pointer so it can cross the `Send` bound `ChangeCallback`
/// requires. Sound under the same single-writer discipline documented
/// at `build_tpdo_dirty_cb`'s call site.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SendPtr<T> {}

/// Builds the closure a timer fires when an RPDO's reception timeout
/// expires. `LocalNode` supplies this, closing over a raw pointer back
/// to itself so the fired timer can call `rpdo_timeout` with the
/// generation captured at arming time.
pub type RpdoTimeoutCbFactory<'a> = &'a mut dyn FnMut(u32, Generation) -> Box<dyn FnMut() + Send>;

/// Builds the closure a periodic timer fires for an event-driven TPDO.
/// Mirrors `RpdoTimeoutCbFactory`.
pub type TpdoEventCbFactory<'a> = &'a mut dyn FnMut(u16, Generation) -> Box<dyn FnMut() + Send>;

struct RpdoTimer {
    handle: TimerHandle,
    generation: Generation,
    period_ms: u64,
    callback: Option<RpdoTimeoutCallback>,
}

struct TpdoTimer {
    handle: TimerHandle,
    generation: Generation,
}

/// Owns PDO transmission/reception timers and the set of configured PDO
/// numbers. Like the other services, carries no reference to the OD,
/// bus, or clock between calls.
pub struct PdoService {
    pdo_enabled: bool,
    tpdo_nums: Vec<u16>,
    rpdo_cobids: Vec<u32>,
    tpdo_timers: BTreeMap<u16, TpdoTimer>,
    rpdo_timers: BTreeMap<u32, RpdoTimer>,
    generation: GenerationCounter,
    /// TPDO numbers whose COB-ID or event-timer sub-index changed since
    /// the last drain. Populated from inside `ObjectDictionary::set_raw`
    /// via a change callback, so it can only ever touch this service's
    /// own fields; re-arming needs the OD and clock, which the callback
    /// doesn't have, so the caller drains this and re-arms once it holds
    /// both again (see `LocalNode::rearm_dirty_tpdos`).
    pending_tpdo_rearm: Vec<u16>,
}

impl Default for PdoService {
    fn default() -> Self {
        PdoService {
            pdo_enabled: false,
            tpdo_nums: Vec::new(),
            rpdo_cobids: Vec::new(),
            tpdo_timers: BTreeMap::new(),
            rpdo_timers: BTreeMap::new(),
            generation: GenerationCounter::default(),
            pending_tpdo_rearm: Vec::new(),
        }
    }
}

impl PdoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers TPDO number `pdo_num`, transmitted on `cobid`, carrying
    /// `mapping` in order. `event_time_ms` arms a periodic timer when
    /// the service is enabled and the entry is `enabled`.
    pub fn add_tpdo(
        &mut self,
        pdo_num: u16,
        cobid: u32,
        mapping: &[PdoMappingEntry],
        event_time_ms: u16,
        enabled: bool,
        od: &mut ObjectDictionary,
    ) -> Result<()> {
        let comm_idx = constants::IDX_TPDO_COMM_PARAM_START + pdo_num;
        if od.entry_exists(comm_idx, constants::SUB_PDO_COBID) {
            return Err(CanOpenError::GeneralParamError);
        }
        if mapping.len() > constants::MAX_MAPPINGS {
            return Err(CanOpenError::PdoMapOverrun);
        }
        let disabled_bit = if enabled { 0 } else { 1u32 << 31 };
        od.insert(comm_idx, constants::SUB_PDO_COBID, crate::types::Access::Rw, OdValue::U32(cobid | disabled_bit))?;
        od.insert(comm_idx, constants::SUB_PDO_TRANSMISSION_TYPE, crate::types::Access::Rw, OdValue::U8(0xFE))?;
        od.insert(comm_idx, constants::SUB_PDO_INHIBIT_TIME, crate::types::Access::Rw, OdValue::U16(0))?;
        od.insert(comm_idx, constants::SUB_PDO_EVENT_TIMER, crate::types::Access::Rw, OdValue::U16(event_time_ms))?;
        let pdo_ptr = self as *mut Self;
        od.register_callback(comm_idx, constants::SUB_PDO_COBID, Self::build_tpdo_dirty_cb(pdo_ptr, pdo_num))?;
        od.register_callback(comm_idx, constants::SUB_PDO_EVENT_TIMER, Self::build_tpdo_dirty_cb(pdo_ptr, pdo_num))?;
        self.insert_mapping(constants::IDX_TPDO_MAPPING_PARAM_START + pdo_num, mapping, od)?;
        self.tpdo_nums.push(pdo_num);
        debug!("PDO registered TPDO {:#06x} -> cobid {:#05x}, {} mapped entries", comm_idx, cobid, mapping.len());
        // Queues this TPDO for its first arming attempt. `enable_pdo_events`
        // also re-arms every `tpdo_nums` entry unconditionally, so this only
        // matters when a TPDO is added after the node is already
        // `Operational` — the caller (`LocalNode::add_tpdo`) drains it
        // immediately, mirroring a fresh TPDO taking effect right away.
        self.mark_tpdo_dirty(pdo_num);
        Ok(())
    }

    /// Builds the OD-change callback registered on a TPDO's COB-ID and
    /// event-timer sub-indices. `ChangeCallback` only carries the
    /// `(index, sub_index)` that changed, not the new value, and firing
    /// synchronously inside `ObjectDictionary::set_raw` means it cannot
    /// safely read the new value back out of the same entry without
    /// racing the write still in progress there — so it only records
    /// intent here, in a field that belongs to this service alone.
    fn build_tpdo_dirty_cb(pdo_ptr: *mut Self, pdo_num: u16) -> ChangeCallback {
        let pdo_ptr = SendPtr(pdo_ptr);
        Box::new(move |_index: u16, _sub_index: u8| {
            let pdo_ptr = pdo_ptr;
            // SAFETY: this fires synchronously out of an OD write (from
            // an inbound SDO download), a call path that never holds a
            // reference into `PdoService` itself, so this is the only
            // live pointer into it at the time it runs.
            let pdo = unsafe { &mut *pdo_ptr.0 };
            pdo.mark_tpdo_dirty(pdo_num);
        })
    }

    fn mark_tpdo_dirty(&mut self, pdo_num: u16) {
        if !self.pending_tpdo_rearm.contains(&pdo_num) {
            self.pending_tpdo_rearm.push(pdo_num);
        }
    }

    /// Drains the set of TPDOs queued for re-arming since the last
    /// drain. The caller re-arms each with `rearm_tpdo_events` once it
    /// holds the OD and clock again.
    pub fn take_pending_tpdo_rearms(&mut self) -> Vec<u16> {
        core::mem::take(&mut self.pending_tpdo_rearm)
    }

    /// Registers an RPDO received on `cobid`. `timeout_ms` and
    /// `timeout_callback` are optional: if both are present, a missing
    /// reception within `timeout_ms` fires the callback with `cobid`.
    pub fn add_rpdo(
        &mut self,
        pdo_num: u16,
        cobid: u32,
        mapping: &[PdoMappingEntry],
        timeout_ms: u16,
        timeout_callback: Option<RpdoTimeoutCallback>,
        od: &mut ObjectDictionary,
    ) -> Result<()> {
        let comm_idx = constants::IDX_RPDO_COMM_PARAM_START + pdo_num;
        if od.entry_exists(comm_idx, constants::SUB_PDO_COBID) {
            return Err(CanOpenError::GeneralParamError);
        }
        if mapping.len() > constants::MAX_MAPPINGS {
            return Err(CanOpenError::PdoMapOverrun);
        }
        let rtr_disallowed_bit = 1u32 << 30;
        od.insert(comm_idx, constants::SUB_PDO_COBID, crate::types::Access::Rw, OdValue::U32(cobid | rtr_disallowed_bit))?;
        od.insert(comm_idx, constants::SUB_PDO_TRANSMISSION_TYPE, crate::types::Access::Rw, OdValue::U8(0xFE))?;
        od.insert(comm_idx, constants::SUB_PDO_INHIBIT_TIME, crate::types::Access::Rw, OdValue::U16(0))?;
        od.insert(comm_idx, constants::SUB_PDO_EVENT_TIMER, crate::types::Access::Rw, OdValue::U16(timeout_ms))?;
        self.insert_mapping(constants::IDX_RPDO_MAPPING_PARAM_START + pdo_num, mapping, od)?;
        self.rpdo_cobids.push(cobid);
        if timeout_ms != 0 && timeout_callback.is_some() {
            self.rpdo_timers.insert(
                cobid,
                RpdoTimer { handle: TimerHandle::default(), generation: Generation::default(), period_ms: timeout_ms as u64, callback: timeout_callback },
            );
        }
        debug!("PDO registered RPDO {:#06x} -> cobid {:#05x}, {} mapped entries", comm_idx, cobid, mapping.len());
        Ok(())
    }

    fn insert_mapping(&self, mapping_idx: u16, mapping: &[PdoMappingEntry], od: &mut ObjectDictionary) -> Result<()> {
        od.insert(mapping_idx, 0, crate::types::Access::Rw, OdValue::U8(mapping.len() as u8))?;
        for (i, m) in mapping.iter().enumerate() {
            od.insert(mapping_idx, (i + 1) as u8, crate::types::Access::Rw, OdValue::U32(m.to_u32()))?;
        }
        Ok(())
    }

    fn read_mapping(&self, mapping_idx: u16, od: &mut ObjectDictionary) -> Result<Vec<PdoMappingEntry>> {
        let count = od.get_u8(mapping_idx, 0)?;
        let mut out = Vec::with_capacity(count as usize);
        for i in 1..=count {
            out.push(PdoMappingEntry::from_u32(od.get_u32(mapping_idx, i)?));
        }
        Ok(out)
    }

    /// Sends a TPDO's current payload. `comm_idx` is the communication
    /// record's index (`0x1800+pdo_num`). All mapped entries are locked
    /// up front; if any is already locked, nothing is sent.
    pub fn send_tx_pdo(&mut self, pdo_num: u16, async_send: bool, rtr: bool, od: &mut ObjectDictionary, bus: &mut dyn Bus) -> Result<()> {
        let comm_idx = constants::IDX_TPDO_COMM_PARAM_START + pdo_num;
        let raw_cobid = od.get_u32(comm_idx, constants::SUB_PDO_COBID)?;
        if raw_cobid & (1 << 31) != 0 {
            return Err(CanOpenError::DataXfer);
        }
        let cobid = raw_cobid & 0x1FFF_FFFF;
        let mapping = self.read_mapping(constants::IDX_TPDO_MAPPING_PARAM_START + pdo_num, od)?;
        let mut proxies = Vec::with_capacity(mapping.len());
        for m in &mapping {
            proxies.push(od.make_proxy(m.index, m.sub_index)?);
        }
        let mut payload = Vec::new();
        for (m, proxy) in mapping.iter().zip(proxies.iter_mut()) {
            let mut buf = alloc::vec![0u8; m.byte_length()];
            proxy.copy_into(&mut buf)?;
            payload.extend_from_slice(&buf);
        }
        if payload.len() > 8 {
            return Err(CanOpenError::GeneralParamError);
        }
        let frame = if rtr { Msg::rtr(cobid) } else { Msg::new(cobid, &payload) };
        bus.write(&frame, async_send)
    }

    /// Fires every enabled, event-driven TPDO the service knows about.
    pub fn send_all_tpdos(&mut self, od: &mut ObjectDictionary, bus: &mut dyn Bus) {
        for pdo_num in self.tpdo_nums.clone() {
            if let Err(e) = self.send_tx_pdo(pdo_num, false, false, od, bus) {
                warn!("PDO could not send TPDO {:#06x}: {}", pdo_num, e);
            }
        }
    }

    /// Requests a peer's TPDO by sending an RTR frame on its COB-ID.
    pub fn request_tx_pdo(&self, cobid: u32, bus: &mut dyn Bus) -> Result<()> {
        bus.write(&Msg::rtr(cobid), false)
    }

    /// Dispatches a frame already classified as PDO traffic. Silently
    /// dropped when the node is not `Operational` (checked by the
    /// caller before invoking this).
    pub fn process_msg(
        &mut self,
        cobid: u32,
        msg: &Msg,
        od: &mut ObjectDictionary,
        bus: &mut dyn Bus,
        clock: &mut dyn Clock,
        make_timeout_cb: RpdoTimeoutCbFactory,
    ) {
        if msg.rtr {
            if let Some(pdo_num) = self.tpdo_nums.iter().find(|&&n| {
                od.get_u32(constants::IDX_TPDO_COMM_PARAM_START + n, constants::SUB_PDO_COBID)
                    .map(|c| c & 0x1FFF_FFFF == cobid)
                    .unwrap_or(false)
            }) {
                let _ = self.send_tx_pdo(*pdo_num, false, false, od, bus);
            }
            return;
        }
        if !self.rpdo_cobids.contains(&cobid) {
            return;
        }
        if let Err(e) = self.apply_rpdo(cobid, msg, od) {
            warn!("PDO could not apply RPDO on {:#05x}: {}", cobid, e);
            return;
        }
        if let Some(timer) = self.rpdo_timers.get_mut(&cobid) {
            if timer.callback.is_some() {
                clock.delete_timer(&timer.handle);
                let generation = self.generation.next();
                if let Some(timer) = self.rpdo_timers.get_mut(&cobid) {
                    timer.generation = generation;
                    timer.handle = clock.schedule_delayed(timer.period_ms, make_timeout_cb(cobid, generation));
                }
            }
        }
    }

    fn apply_rpdo(&self, cobid: u32, msg: &Msg, od: &mut ObjectDictionary) -> Result<()> {
        let pdo_num = self
            .rpdo_pdo_num_for_cobid(cobid, od)
            .ok_or(CanOpenError::IndexNotFound)?;
        let mapping = self.read_mapping(constants::IDX_RPDO_MAPPING_PARAM_START + pdo_num, od)?;
        let mut proxies = Vec::with_capacity(mapping.len());
        for m in &mapping {
            let mut p = od.make_proxy(m.index, m.sub_index)?;
            p.suppress_callbacks();
            proxies.push(p);
        }
        let mut offset = 0usize;
        for (m, proxy) in mapping.iter().zip(proxies.iter_mut()) {
            let len = m.byte_length();
            if offset + len > msg.data.len() {
                return Err(CanOpenError::ParamLengthMismatch);
            }
            proxy.copy_from(&msg.data[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    fn rpdo_pdo_num_for_cobid(&self, cobid: u32, od: &mut ObjectDictionary) -> Option<u16> {
        for i in 0..0x200u16 {
            let comm_idx = constants::IDX_RPDO_COMM_PARAM_START + i;
            if !od.entry_exists(comm_idx, constants::SUB_PDO_COBID) {
                continue;
            }
            if let Ok(raw) = od.get_u32(comm_idx, constants::SUB_PDO_COBID) {
                if raw & 0x1FFF_FFFF == cobid {
                    return Some(i);
                }
            }
        }
        None
    }

    /// Arms periodic timers for every event-driven, enabled TPDO with a
    /// nonzero event time, and delayed timeout timers for every
    /// configured RPDO timeout slot.
    pub fn enable_pdo_events(
        &mut self,
        od: &mut ObjectDictionary,
        clock: &mut dyn Clock,
        make_timeout_cb: RpdoTimeoutCbFactory,
        make_tpdo_cb: TpdoEventCbFactory,
    ) {
        self.pdo_enabled = true;
        for (cobid, timer) in self.rpdo_timers.iter_mut() {
            if timer.callback.is_none() {
                continue;
            }
            let generation = self.generation.next();
            timer.generation = generation;
            timer.handle = clock.schedule_delayed(timer.period_ms, make_timeout_cb(*cobid, generation));
        }
        for pdo_num in self.tpdo_nums.clone() {
            self.rearm_tpdo_event(pdo_num, od, clock, make_tpdo_cb);
        }
        // Every configured TPDO was just re-armed unconditionally above,
        // so anything queued by a change callback in the meantime is moot.
        self.pending_tpdo_rearm.clear();
    }

    /// Re-arms each named TPDO's periodic event timer, reading its
    /// current COB-ID/transmission-type/event-timer out of the OD. Used
    /// to react to an OD write to `0x18xx` sub 1/5 without waiting for a
    /// full `enable_pdo_events` pass.
    pub fn rearm_tpdo_events(&mut self, pdo_nums: &[u16], od: &mut ObjectDictionary, clock: &mut dyn Clock, make_cb: TpdoEventCbFactory) {
        for &pdo_num in pdo_nums {
            self.rearm_tpdo_event(pdo_num, od, clock, make_cb);
        }
    }

    /// Re-arms (or disarms) one TPDO's periodic timer: deletes whatever
    /// is currently scheduled for it, then, if it is still event-driven
    /// (transmission type `0xFE`/`0xFF`), enabled, and carries a nonzero
    /// event time, schedules a fresh periodic timer for it. A no-op
    /// while events aren't enabled at all.
    fn rearm_tpdo_event(&mut self, pdo_num: u16, od: &mut ObjectDictionary, clock: &mut dyn Clock, make_cb: TpdoEventCbFactory) {
        if !self.pdo_enabled {
            return;
        }
        let comm_idx = constants::IDX_TPDO_COMM_PARAM_START + pdo_num;
        let (Ok(raw_cobid), Ok(transmission_type), Ok(event_time_ms)) = (
            od.get_u32(comm_idx, constants::SUB_PDO_COBID),
            od.get_u8(comm_idx, constants::SUB_PDO_TRANSMISSION_TYPE),
            od.get_u16(comm_idx, constants::SUB_PDO_EVENT_TIMER),
        ) else {
            return;
        };
        if let Some(timer) = self.tpdo_timers.remove(&pdo_num) {
            clock.delete_timer(&timer.handle);
        }
        let event_driven = transmission_type == 0xFE || transmission_type == 0xFF;
        let disabled = raw_cobid & (1 << 31) != 0;
        if !event_driven || disabled || event_time_ms == 0 {
            return;
        }
        let generation = self.generation.next();
        let handle = clock.schedule_periodic(event_time_ms as u64, make_cb(pdo_num, generation), false);
        self.tpdo_timers.insert(pdo_num, TpdoTimer { handle, generation });
    }

    /// Fired when an event-driven TPDO's periodic timer ticks; ignored
    /// if `generation` is stale (the timer was deleted or replaced
    /// since it was armed).
    pub fn tpdo_event_fired(&mut self, pdo_num: u16, generation: Generation, od: &mut ObjectDictionary, bus: &mut dyn Bus) {
        let Some(timer) = self.tpdo_timers.get(&pdo_num) else {
            return;
        };
        if timer.generation != generation {
            return;
        }
        if let Err(e) = self.send_tx_pdo(pdo_num, true, false, od, bus) {
            warn!("PDO could not send event-driven TPDO {:#06x}: {}", pdo_num, e);
        }
    }

    /// Cancels every armed timer and bumps generations so any in-flight
    /// callback for a now-cancelled timer becomes a no-op.
    pub fn disable_pdo_events(&mut self, clock: &mut dyn Clock) {
        self.pdo_enabled = false;
        self.pending_tpdo_rearm.clear();
        for (_, timer) in core::mem::take(&mut self.tpdo_timers) {
            clock.delete_timer(&timer.handle);
        }
        for timer in self.rpdo_timers.values_mut() {
            clock.delete_timer(&timer.handle);
            timer.generation = self.generation.next();
        }
    }

    /// Fired when an RPDO timeout timer expires; ignored if `generation`
    /// is stale (a frame arrived, or the timer was re-armed, since).
    pub fn rpdo_timeout(&mut self, cobid: u32, generation: Generation) {
        if let Some(timer) = self.rpdo_timers.get_mut(&cobid) {
            if timer.generation != generation {
                return;
            }
            if let Some(cb) = timer.callback.as_mut() {
                cb(cobid);
            }
        }
    }
}
