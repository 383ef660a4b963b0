//! A scoped streaming cursor into a single, locked `OdEntry`. Holds a
//! raw `OdEntry*` because OD entries are heap-allocated once at
//! `insert` time and never relocated or removed; the `Drop` impl below
//! unlocks the entry, making the lock scope-bound RAII.

use super::entry::OdEntry;
use super::value::OdValue;
use crate::error::{CanOpenError, Result};
use alloc::string::String;
use alloc::vec::Vec;

/// A one-time cursor over an `OdEntry`'s bytes. Holds the entry's lock
/// for the proxy's lifetime; on drop, bumps generation and fires change
/// callbacks if any write occurred, unless `suppress_callbacks` was
/// called.
pub struct OdProxy {
    // SAFETY: `entry` points at an `OdEntry` owned by a `Box` stored in
    // the `ObjectDictionary`'s map. Entries are never moved or dropped
    // once inserted (the OD only grows), so the pointer stays valid for
    // as long as the dictionary lives. `OdEntry::lock` guarantees at
    // most one live `OdProxy` per entry at a time, and all OD access in
    // this crate happens under a single caller-held lock, so
    // this is never aliased with another mutable access to the same
    // entry.
    entry: *mut OdEntry,
    index: u16,
    sub_index: u8,
    offset: usize,
    len: usize,
    changed: bool,
    suppressed: bool,
}

impl OdProxy {
    /// Constructs a proxy over an already-locked entry. Callers must
    /// have called `entry.lock()` and checked it returned `true` before
    /// building a proxy; `ObjectDictionary::make_proxy` is the only
    /// caller.
    pub(crate) fn new(entry: &mut OdEntry) -> Self {
        debug_assert!(entry.is_locked());
        let len = entry.value.size();
        OdProxy {
            entry: entry as *mut OdEntry,
            index: entry.index,
            sub_index: entry.sub_index,
            offset: 0,
            len,
            changed: false,
            suppressed: false,
        }
    }

    fn entry(&self) -> &OdEntry {
        // SAFETY: see struct-level comment.
        unsafe { &*self.entry }
    }

    fn entry_mut(&mut self) -> &mut OdEntry {
        // SAFETY: see struct-level comment.
        unsafe { &mut *self.entry }
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }

    /// Bytes left to read/write from the cursor's current position.
    pub fn remaining(&self) -> usize {
        self.len - self.offset
    }

    /// Rewinds the cursor to zero and clears the changed flag, without
    /// releasing the lock. Re-reads `len` from the entry, so it reflects
    /// any resize that already happened.
    pub fn reset(&mut self) -> Result<()> {
        self.len = self.entry().value.size();
        self.offset = 0;
        self.changed = false;
        Ok(())
    }

    /// Resizes the backing container (vector/string/dynamic) and resets
    /// the cursor. Fails for fixed-width scalars and external buffers.
    pub fn resize(&mut self, new_size: usize) -> bool {
        let ok = match &mut self.entry_mut().value {
            OdValue::Bytes(v) => {
                v.resize(new_size, 0);
                true
            }
            OdValue::Str(s) => {
                // Strings resize by byte length; pad with NULs like the
                // reference `std::string::resize`.
                let mut bytes = core::mem::take(s).into_bytes();
                bytes.resize(new_size, 0);
                *s = String::from_utf8_lossy(&bytes).into_owned();
                true
            }
            OdValue::Dynamic(d) => d.resize(new_size),
            _ => false,
        };
        if ok {
            let _ = self.reset();
        }
        ok
    }

    /// Reads `buf.len()` bytes starting at the cursor into `buf`,
    /// advancing the cursor. Enforces WO access and length bounds.
    pub fn copy_into(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.remaining() < buf.len() {
            return Err(CanOpenError::ParamLength);
        }
        if !self.entry().access.readable() {
            return Err(CanOpenError::ReadViolation);
        }
        let offset = self.offset;
        match &mut self.entry_mut().value {
            OdValue::Dynamic(d) => d.copy_into(offset, buf)?,
            other => {
                let bytes = other.read_scalar()?;
                buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
            }
        }
        self.offset += buf.len();
        Ok(())
    }

    /// Writes `buf` into the backing store at the cursor, advancing it.
    /// Enforces RO access and length bounds.
    pub fn copy_from(&mut self, buf: &[u8]) -> Result<()> {
        if self.remaining() < buf.len() {
            return Err(CanOpenError::ParamLength);
        }
        if !self.entry().access.writable() {
            return Err(CanOpenError::WriteViolation);
        }
        self.changed = true;
        let offset = self.offset;
        match &mut self.entry_mut().value {
            OdValue::Dynamic(d) => d.copy_from(offset, buf)?,
            OdValue::Bytes(v) => v[offset..offset + buf.len()].copy_from_slice(buf),
            OdValue::Str(s) => {
                let mut bytes = core::mem::take(s).into_bytes();
                bytes[offset..offset + buf.len()].copy_from_slice(buf);
                *s = String::from_utf8_lossy(&bytes).into_owned();
            }
            OdValue::Buffer(b) => b.0[offset..offset + buf.len()].copy_from_slice(buf),
            scalar => {
                let mut bytes = scalar.read_scalar()?;
                bytes[offset..offset + buf.len()].copy_from_slice(buf);
                scalar.write_scalar(&bytes)?;
            }
        }
        self.offset += buf.len();
        Ok(())
    }

    /// Copies `other`'s remaining bytes into this proxy, used by
    /// `ObjectDictionary::get`/`set` to bridge two `OdBuffer` entries.
    pub fn copy_from_proxy(&mut self, other: &mut OdProxy) -> Result<()> {
        let mut buf = alloc::vec![0u8; other.remaining()];
        other.copy_into(&mut buf)?;
        self.copy_from(&buf)
    }

    /// Reads the entry's entire remaining payload into an owned `Vec`.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut buf = alloc::vec![0u8; self.remaining()];
        self.copy_into(&mut buf)?;
        Ok(buf)
    }

    /// Suppresses the post-drop callback firing (used by the PDO
    /// service to defer notification until every mapped entry in an
    /// RPDO frame has been written).
    pub fn suppress_callbacks(&mut self) {
        self.suppressed = true;
    }
}

impl Drop for OdProxy {
    fn drop(&mut self) {
        let changed = self.changed;
        let suppressed = self.suppressed;
        let entry = self.entry_mut();
        entry.unlock();
        if changed {
            entry.bump_generation();
            if !suppressed {
                entry.fire_callbacks();
            }
        }
    }
}
