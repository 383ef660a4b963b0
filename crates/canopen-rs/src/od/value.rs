//! The Object Dictionary's value domain.

use crate::error::{CanOpenError, Result};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// A byte buffer owned by an OD entry. Kept as an owned `Vec` so the
/// type stays `'static` and movable; ownership discipline is enforced by
/// access going exclusively through a locked `OdProxy`.
#[derive(Debug, Clone, PartialEq)]
pub struct OdBuffer(pub Vec<u8>);

/// The handle set a `DynamicVar` trait object must provide:
/// `current_size`/`resize`/`begin_access`/`end_access` plus the two
/// copy primitives below.
pub trait DynamicVar: fmt::Debug {
    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    fn copy_into(&mut self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` into the backing store starting at `offset`.
    fn copy_from(&mut self, offset: usize, buf: &[u8]) -> Result<()>;

    /// The variable's current logical size in bytes.
    fn current_size(&self) -> usize;

    /// Attempts to resize the backing store. Returns `false` if the
    /// variable does not support resizing or the new size is rejected.
    fn resize(&mut self, new_size: usize) -> bool {
        let _ = new_size;
        false
    }

    /// Called when an `OdProxy` begins streaming access to this
    /// variable (i.e. when the owning entry is locked).
    fn begin_access(&mut self) {}

    /// Called when the streaming access ends (the owning entry unlocks).
    fn end_access(&mut self) {}
}

/// A tagged union over every shape of value an OD entry can hold.
pub enum OdValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    Bytes(Vec<u8>),
    Str(String),
    Buffer(OdBuffer),
    Dynamic(Box<dyn DynamicVar + Send>),
}

impl fmt::Debug for OdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Self::I8(v) => f.debug_tuple("I8").field(v).finish(),
            Self::I16(v) => f.debug_tuple("I16").field(v).finish(),
            Self::I32(v) => f.debug_tuple("I32").field(v).finish(),
            Self::I64(v) => f.debug_tuple("I64").field(v).finish(),
            Self::U8(v) => f.debug_tuple("U8").field(v).finish(),
            Self::U16(v) => f.debug_tuple("U16").field(v).finish(),
            Self::U32(v) => f.debug_tuple("U32").field(v).finish(),
            Self::U64(v) => f.debug_tuple("U64").field(v).finish(),
            Self::F32(v) => f.debug_tuple("F32").field(v).finish(),
            Self::Bytes(v) => f.debug_tuple("Bytes").field(v).finish(),
            Self::Str(v) => f.debug_tuple("Str").field(v).finish(),
            Self::Buffer(v) => f.debug_tuple("Buffer").field(v).finish(),
            Self::Dynamic(v) => f.debug_tuple("Dynamic").field(v).finish(),
        }
    }
}

impl Clone for OdValue {
    fn clone(&self) -> Self {
        match self {
            Self::Bool(v) => Self::Bool(*v),
            Self::I8(v) => Self::I8(*v),
            Self::I16(v) => Self::I16(*v),
            Self::I32(v) => Self::I32(*v),
            Self::I64(v) => Self::I64(*v),
            Self::U8(v) => Self::U8(*v),
            Self::U16(v) => Self::U16(*v),
            Self::U32(v) => Self::U32(*v),
            Self::U64(v) => Self::U64(*v),
            Self::F32(v) => Self::F32(*v),
            Self::Bytes(v) => Self::Bytes(v.clone()),
            Self::Str(v) => Self::Str(v.clone()),
            Self::Buffer(v) => Self::Buffer(v.clone()),
            // A DynamicVar is a handle to externally-owned state; cloning
            // the enum variant is only ever done for default-value
            // bootstrapping, which never applies to dynamic entries.
            Self::Dynamic(_) => panic!("OdValue::Dynamic is not cloneable"),
        }
    }
}

impl OdValue {
    /// The logical byte length of the value.
    pub fn size(&self) -> usize {
        match self {
            Self::Bool(_) => 1,
            Self::I8(_) | Self::U8(_) => 1,
            Self::I16(_) | Self::U16(_) => 2,
            Self::I32(_) | Self::U32(_) | Self::F32(_) => 4,
            Self::I64(_) | Self::U64(_) => 8,
            Self::Bytes(v) => v.len(),
            Self::Str(v) => v.len(),
            Self::Buffer(b) => b.0.len(),
            Self::Dynamic(d) => d.current_size(),
        }
    }

    /// Returns the discriminant name, used for `ParamIncompatibility`
    /// checks in scalar `get`/`set` where the caller's slot type must
    /// match the stored variant.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::I8(_) => "i8",
            Self::I16(_) => "i16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::U32(_) => "u32",
            Self::U64(_) => "u64",
            Self::F32(_) => "f32",
            Self::Bytes(_) => "bytes",
            Self::Str(_) => "str",
            Self::Buffer(_) => "buffer",
            Self::Dynamic(_) => "dynamic",
        }
    }

    /// Reads the scalar bytes of a fixed-width value into a caller
    /// buffer, little-endian, for the non-streaming scalar `get` path.
    pub fn read_scalar(&self) -> Result<Vec<u8>> {
        Ok(match self {
            Self::Bool(v) => vec![*v as u8],
            Self::I8(v) => vec![*v as u8],
            Self::U8(v) => vec![*v],
            Self::I16(v) => v.to_le_bytes().to_vec(),
            Self::U16(v) => v.to_le_bytes().to_vec(),
            Self::I32(v) => v.to_le_bytes().to_vec(),
            Self::U32(v) => v.to_le_bytes().to_vec(),
            Self::F32(v) => v.to_le_bytes().to_vec(),
            Self::I64(v) => v.to_le_bytes().to_vec(),
            Self::U64(v) => v.to_le_bytes().to_vec(),
            Self::Bytes(v) => v.clone(),
            Self::Str(v) => v.as_bytes().to_vec(),
            Self::Buffer(b) => b.0.clone(),
            Self::Dynamic(_) => return Err(CanOpenError::UnsupportedAccess),
        })
    }

    /// Writes scalar bytes into a fixed-width value in place, matching
    /// the stored variant's width. Container/dynamic variants are
    /// rejected; they are written through a streaming `OdProxy` instead.
    pub fn write_scalar(&mut self, bytes: &[u8]) -> Result<()> {
        macro_rules! fixed {
            ($variant:ident, $ty:ty) => {{
                let arr: [u8; core::mem::size_of::<$ty>()] =
                    bytes.try_into().map_err(|_| CanOpenError::ParamLengthMismatch)?;
                *self = OdValue::$variant(<$ty>::from_le_bytes(arr));
            }};
        }
        match self {
            Self::Bool(_) => {
                *self = OdValue::Bool(*bytes.first().ok_or(CanOpenError::ParamLengthMismatch)? != 0)
            }
            Self::I8(_) => fixed!(I8, i8),
            Self::U8(_) => fixed!(U8, u8),
            Self::I16(_) => fixed!(I16, i16),
            Self::U16(_) => fixed!(U16, u16),
            Self::I32(_) => fixed!(I32, i32),
            Self::U32(_) => fixed!(U32, u32),
            Self::F32(_) => fixed!(F32, f32),
            Self::I64(_) => fixed!(I64, i64),
            Self::U64(_) => fixed!(U64, u64),
            Self::Bytes(_) | Self::Str(_) | Self::Buffer(_) | Self::Dynamic(_) => {
                return Err(CanOpenError::UnsupportedAccess)
            }
        }
        Ok(())
    }
}
