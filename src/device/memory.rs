//! Simulated CMX local memory.
//!
//! All streaming line buffers live in CMX, a multi-slice on-chip scratch
//! memory. The model keeps it as one flat byte arena; slice boundaries only
//! matter to the chunked line gather/scatter paths, which consult the global
//! slice geometry programmed through [`crate::device::sipp_spec::SIPP_SLC_SIZE`].

use crate::device::sipp_spec::{self, fields};
use crate::device::DeviceError;

/// CMX slice partitioning shared by every chunked buffer.
///
/// Established once by the global slice register; every reader observes the
/// value the last write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceGeometry {
    /// Slice size in bytes
    pub size: u32,
    /// First slice available to chunked buffers
    pub first: u32,
    /// Last slice available to chunked buffers
    pub last: u32,
}

impl SliceGeometry {
    /// Decode from the SLC_SIZE register layout.
    pub fn from_reg(value: u32) -> Self {
        Self {
            size: value & fields::SLICE_SIZE_MASK,
            first: (value >> fields::SLICE_FIRST_SHIFT) & fields::SLICE_FIRST_MASK,
            last: (value >> fields::SLICE_LAST_SHIFT) & fields::SLICE_LAST_MASK,
        }
    }

    /// Reassemble the SLC_SIZE register value.
    pub fn to_reg(self) -> u32 {
        (self.size & fields::SLICE_SIZE_MASK)
            | (self.first & fields::SLICE_FIRST_MASK) << fields::SLICE_FIRST_SHIFT
            | (self.last & fields::SLICE_LAST_MASK) << fields::SLICE_LAST_SHIFT
    }

    /// Step from the slice at `offset` slices past the start slice to the
    /// next chunk's slice: +1, or back to the first slice after the last.
    #[inline]
    pub fn next_slice_step(self, start_slice: u32, offset: u32) -> i32 {
        if start_slice + offset == self.last + 1 {
            self.first as i32 - self.last as i32
        } else {
            1
        }
    }
}

impl Default for SliceGeometry {
    fn default() -> Self {
        Self {
            size: sipp_spec::CMX_SLICE_SIZE,
            first: 0,
            last: sipp_spec::CMX_SLICE_COUNT - 1,
        }
    }
}

/// Flat CMX byte arena.
///
/// Accessors are bounds-checked: buffer geometry that walks outside the arena
/// is driver misuse and surfaces as [`DeviceError::CmxRange`] rather than a
/// panic.
pub struct CmxMemory {
    data: Vec<u8>,
}

impl CmxMemory {
    /// Create a zeroed arena of the full CMX size.
    pub fn new() -> Self {
        Self {
            data: vec![0u8; sipp_spec::CMX_SIZE],
        }
    }

    /// Arena size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: u32, len: usize) -> Result<&[u8], DeviceError> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => Ok(&self.data[start..end]),
            None => Err(DeviceError::CmxRange { offset, len }),
        }
    }

    /// Mutably borrow `len` bytes starting at `offset`.
    pub fn bytes_mut(&mut self, offset: u32, len: usize) -> Result<&mut [u8], DeviceError> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => Ok(&mut self.data[start..end]),
            None => Err(DeviceError::CmxRange { offset, len }),
        }
    }

    /// Read one byte.
    #[inline]
    pub fn read_u8(&self, offset: u32) -> Result<u8, DeviceError> {
        Ok(self.bytes(offset, 1)?[0])
    }

    /// Write one byte.
    #[inline]
    pub fn write_u8(&mut self, offset: u32, value: u8) -> Result<(), DeviceError> {
        self.bytes_mut(offset, 1)?[0] = value;
        Ok(())
    }

    /// Read a little-endian 16-bit value.
    #[inline]
    pub fn read_u16(&self, offset: u32) -> Result<u16, DeviceError> {
        let b = self.bytes(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Write a little-endian 16-bit value.
    #[inline]
    pub fn write_u16(&mut self, offset: u32, value: u16) -> Result<(), DeviceError> {
        self.bytes_mut(offset, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Read a little-endian 32-bit value.
    #[inline]
    pub fn read_u32(&self, offset: u32) -> Result<u32, DeviceError> {
        let b = self.bytes(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Write a little-endian 32-bit value.
    #[inline]
    pub fn write_u32(&mut self, offset: u32, value: u32) -> Result<(), DeviceError> {
        self.bytes_mut(offset, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Copy a byte run into the arena.
    pub fn write_bytes(&mut self, offset: u32, data: &[u8]) -> Result<(), DeviceError> {
        self.bytes_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    /// Copy a byte run out of the arena.
    pub fn read_bytes(&self, offset: u32, buf: &mut [u8]) -> Result<(), DeviceError> {
        buf.copy_from_slice(self.bytes(offset, buf.len())?);
        Ok(())
    }

    /// Zero the whole arena.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

impl Default for CmxMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CmxMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmxMemory").field("len", &self.data.len()).finish()
    }
}
