//! The Object Dictionary: a coordinate-addressable map of `OdEntry`
//! values, indexed by `(index, sub_index)`. Operations are `get`/`set`/
//! `make_proxy`/`insert`/`auto_insert`/`entry_exists`; Rust's type
//! system checks access-mode and type-tag agreement at compile time
//! where possible, and at runtime where the wire protocol demands it.

pub mod constants;
pub mod entry;
pub mod proxy;
pub mod value;

pub use entry::{ChangeCallback, OdEntry};
pub use proxy::OdProxy;
pub use value::{DynamicVar, OdBuffer, OdValue};

use crate::error::{CanOpenError, Result};
use crate::types::Access;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use log::{debug, info, warn};

/// The node's Object Dictionary: `(index, sub_index) -> OdEntry`.
#[derive(Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<(u16, u8), Box<OdEntry>>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        ObjectDictionary { entries: BTreeMap::new() }
    }

    /// Inserts a new entry. Fails with `GeneralParamError` if the
    /// coordinates are already occupied.
    pub fn insert(&mut self, index: u16, sub_index: u8, access: Access, value: OdValue) -> Result<()> {
        if self.entries.contains_key(&(index, sub_index)) {
            warn!("OD insert rejected, {:#06x}[{}] already exists", index, sub_index);
            return Err(CanOpenError::GeneralParamError);
        }
        debug!("OD insert {:#06x}[{}]", index, sub_index);
        self.entries.insert((index, sub_index), Box::new(OdEntry::new(index, sub_index, access, value)));
        Ok(())
    }

    pub fn entry_exists(&self, index: u16, sub_index: u8) -> bool {
        self.entries.contains_key(&(index, sub_index))
    }

    pub fn entry_size(&self, index: u16, sub_index: u8) -> Result<usize> {
        self.entries
            .get(&(index, sub_index))
            .map(|e| e.value.size())
            .ok_or(CanOpenError::IndexNotFound)
    }

    pub fn generation(&self, index: u16, sub_index: u8) -> Result<u64> {
        self.entries
            .get(&(index, sub_index))
            .map(|e| e.generation())
            .ok_or(CanOpenError::IndexNotFound)
    }

    /// Registers a change callback, fired after every completed mutating
    /// write to this entry.
    pub fn register_callback(&mut self, index: u16, sub_index: u8, cb: ChangeCallback) -> Result<()> {
        let entry = self.entries.get_mut(&(index, sub_index)).ok_or(CanOpenError::IndexNotFound)?;
        entry.add_callback(cb);
        Ok(())
    }

    /// Finds the lowest free `(idx, sub=0)` in `[0x3500, 0x4000)` and
    /// reserves it with `value`, returning the index chosen.
    pub fn auto_insert(&mut self, access: Access, value: OdValue) -> Result<u16> {
        for idx in constants::AUTO_INSERT_RANGE_START..constants::AUTO_INSERT_RANGE_END {
            if !self.entry_exists(idx, 0) {
                self.insert(idx, 0, access, value)?;
                return Ok(idx);
            }
        }
        Err(CanOpenError::OutOfMemory)
    }

    /// Opens a streaming cursor onto `(index, sub_index)`. Acquires the
    /// entry's lock for the proxy's lifetime; fails with
    /// `DataXferLocal` if already locked, `IndexNotFound` if missing
    ///.
    pub fn make_proxy(&mut self, index: u16, sub_index: u8) -> Result<OdProxy> {
        let entry = self.entries.get_mut(&(index, sub_index)).ok_or(CanOpenError::IndexNotFound)?;
        if !entry.lock() {
            return Err(CanOpenError::DataXferLocal);
        }
        Ok(OdProxy::new(entry))
    }

    /// Reads a scalar value, checking the caller's expected type tag
    /// against the stored variant. Fails with `Timeout` if the entry is
    /// currently locked by a live proxy.
    pub fn get_raw(&mut self, index: u16, sub_index: u8) -> Result<OdValue> {
        let entry = self.entries.get_mut(&(index, sub_index)).ok_or(CanOpenError::IndexNotFound)?;
        if entry.is_locked() {
            return Err(CanOpenError::Timeout);
        }
        if !entry.lock() {
            return Err(CanOpenError::Timeout);
        }
        let out = entry.value.clone();
        entry.unlock();
        Ok(out)
    }

    /// Typed scalar read: `get::<u32>(idx, sub)`.
    pub fn get_u8(&mut self, index: u16, sub_index: u8) -> Result<u8> {
        match self.get_raw(index, sub_index)? {
            OdValue::U8(v) => Ok(v),
            other => type_mismatch(other),
        }
    }
    pub fn get_u16(&mut self, index: u16, sub_index: u8) -> Result<u16> {
        match self.get_raw(index, sub_index)? {
            OdValue::U16(v) => Ok(v),
            other => type_mismatch(other),
        }
    }
    pub fn get_u32(&mut self, index: u16, sub_index: u8) -> Result<u32> {
        match self.get_raw(index, sub_index)? {
            OdValue::U32(v) => Ok(v),
            other => type_mismatch(other),
        }
    }
    pub fn get_i32(&mut self, index: u16, sub_index: u8) -> Result<i32> {
        match self.get_raw(index, sub_index)? {
            OdValue::I32(v) => Ok(v),
            other => type_mismatch(other),
        }
    }

    /// Scalar write: bumps generation and fires callbacks on success
    ///.
    pub fn set_raw(&mut self, index: u16, sub_index: u8, value: OdValue) -> Result<()> {
        let entry = self.entries.get_mut(&(index, sub_index)).ok_or(CanOpenError::IndexNotFound)?;
        if core::mem::discriminant(&entry.value) != core::mem::discriminant(&value) {
            return Err(CanOpenError::ParamIncompatibility);
        }
        if entry.is_locked() {
            return Err(CanOpenError::Timeout);
        }
        entry.value = value;
        entry.bump_generation();
        entry.fire_callbacks();
        Ok(())
    }

    pub fn set_u8(&mut self, index: u16, sub_index: u8, value: u8) -> Result<()> {
        self.set_raw(index, sub_index, OdValue::U8(value))
    }
    pub fn set_u16(&mut self, index: u16, sub_index: u8, value: u16) -> Result<()> {
        self.set_raw(index, sub_index, OdValue::U16(value))
    }
    pub fn set_u32(&mut self, index: u16, sub_index: u8, value: u32) -> Result<()> {
        self.set_raw(index, sub_index, OdValue::U32(value))
    }

    /// Inserts `0x1000` (device type), `0x1001` (error register, RW,
    /// initial zero), `0x1008` (device name) and the static type
    /// exemplars `0x0002..0x0008` every node boots with.
    pub fn install_bootstrap_entries(&mut self, device_type: u32, device_name: &'static str) -> Result<()> {
        info!("installing mandatory bootstrap OD entries");
        self.insert(constants::IDX_DEVICE_TYPE, 0, Access::Ro, OdValue::U32(device_type))?;
        self.insert(constants::IDX_ERROR_REGISTER, 0, Access::Rw, OdValue::U8(0))?;
        self.insert(
            constants::IDX_DEVICE_NAME,
            0,
            Access::Ro,
            OdValue::Str(alloc::string::String::from(device_name)),
        )?;
        self.insert(constants::IDX_TYPE_INTEGER8, 0, Access::Ro, OdValue::I8(0))?;
        self.insert(constants::IDX_TYPE_INTEGER16, 0, Access::Ro, OdValue::I16(0))?;
        self.insert(constants::IDX_TYPE_INTEGER32, 0, Access::Ro, OdValue::I32(0))?;
        self.insert(constants::IDX_TYPE_UNSIGNED8, 0, Access::Ro, OdValue::U8(0))?;
        self.insert(constants::IDX_TYPE_UNSIGNED16, 0, Access::Ro, OdValue::U16(0))?;
        self.insert(constants::IDX_TYPE_UNSIGNED32, 0, Access::Ro, OdValue::U32(0))?;
        self.insert(constants::IDX_TYPE_REAL32, 0, Access::Ro, OdValue::F32(0.0))?;
        Ok(())
    }
}

fn type_mismatch<T>(_found: OdValue) -> Result<T> {
    Err(CanOpenError::ParamIncompatibility)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_roundtrip() {
        let mut od = ObjectDictionary::new();
        od.insert(0x2000, 0, Access::Rw, OdValue::U8(42)).unwrap();
        assert_eq!(od.get_u8(0x2000, 0).unwrap(), 42);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut od = ObjectDictionary::new();
        od.insert(0x2000, 0, Access::Rw, OdValue::U8(1)).unwrap();
        assert_eq!(od.insert(0x2000, 0, Access::Rw, OdValue::U8(2)), Err(CanOpenError::GeneralParamError));
    }

    #[test]
    fn generation_bumps_on_every_set_even_same_value() {
        // 
        let mut od = ObjectDictionary::new();
        od.insert(0x2000, 0, Access::Rw, OdValue::U8(42)).unwrap();
        let g0 = od.generation(0x2000, 0).unwrap();
        od.set_u8(0x2000, 0, 43).unwrap();
        let g1 = od.generation(0x2000, 0).unwrap();
        assert_ne!(g0, g1);
        od.set_u8(0x2000, 0, 43).unwrap();
        let g2 = od.generation(0x2000, 0).unwrap();
        assert_ne!(g1, g2);
    }

    #[test]
    fn proxy_holds_exclusive_lock() {
        let mut od = ObjectDictionary::new();
        od.insert(0x2000, 0, Access::Rw, OdValue::Bytes(alloc::vec![0u8; 4])).unwrap();
        let _p = od.make_proxy(0x2000, 0).unwrap();
        assert_eq!(od.make_proxy(0x2000, 0).unwrap_err(), CanOpenError::DataXferLocal);
        assert_eq!(od.get_raw(0x2000, 0).unwrap_err(), CanOpenError::Timeout);
    }

    #[test]
    fn auto_insert_picks_lowest_free_slot() {
        let mut od = ObjectDictionary::new();
        let idx = od.auto_insert(Access::Rw, OdValue::Bytes(alloc::vec![])).unwrap();
        assert_eq!(idx, constants::AUTO_INSERT_RANGE_START);
        let idx2 = od.auto_insert(Access::Rw, OdValue::Bytes(alloc::vec![])).unwrap();
        assert_eq!(idx2, constants::AUTO_INSERT_RANGE_START + 1);
    }
}
