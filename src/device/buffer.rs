//! Streaming line buffers.
//!
//! Every filter port (input, output, chroma reference) is a [`LineBuffer`]:
//! a circular or linear window over CMX described by five configuration
//! registers, each present in a default and a shadow bank. The working
//! geometry is latched from one bank at the top of each dispatch, so the
//! inactive bank can be reprogrammed while a frame drains.
//!
//! The fill level counts lines holding valid unconsumed data. Producers
//! increment it through the FC register, the filter decrements it as lines
//! are consumed. Over- and underflow are contract breaches surfaced as
//! [`DeviceError`], not clamped.

use log::trace;

use crate::device::memory::{CmxMemory, SliceGeometry};
use crate::device::sipp_spec::fields;
use crate::device::DeviceError;

/// Selects one of the two configuration banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bank {
    #[default]
    Default,
    Shadow,
}

impl Bank {
    /// Bank addressed by one bit of the shadow-select register.
    #[inline]
    pub fn from_bit(bit: bool) -> Self {
        if bit {
            Self::Shadow
        } else {
            Self::Default
        }
    }

    #[inline]
    fn idx(self) -> usize {
        match self {
            Self::Default => 0,
            Self::Shadow => 1,
        }
    }
}

/// Which port a buffer serves. Only used for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Input,
    Output,
    Reference,
}

impl Port {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "in",
            Self::Output => "out",
            Self::Reference => "ref",
        }
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw register words of one configuration bank.
#[derive(Debug, Clone, Copy, Default)]
struct BankRegs {
    base: u32,
    cfg: u32,
    ls: u32,
    ps: u32,
    ir: u32,
}

/// Working geometry decoded from the active bank.
#[derive(Debug, Clone, Copy, Default)]
pub struct Geometry {
    /// Byte offset of the buffer in CMX
    pub base: u32,
    /// Circular depth in lines, 0 = non-wrapping
    pub lines: u32,
    /// Number of planes
    pub planes: u32,
    /// Pixel format in bytes per pixel
    pub format: u32,
    /// First CMX slice of plane 0
    pub start_slice: u32,
    /// Line stride in bytes
    pub line_stride: u32,
    /// Chunk size in bytes, 0 = contiguous lines
    pub chunk_size: u32,
    /// Plane stride in bytes
    pub plane_stride: u32,
    /// Fill level required before the first line of the first frame
    pub start_level: u32,
}

impl Geometry {
    fn decode(regs: &BankRegs) -> Self {
        Self {
            base: regs.base,
            lines: regs.cfg & fields::CFG_LINES_MASK,
            planes: ((regs.cfg >> fields::CFG_PLANES_SHIFT) & fields::CFG_PLANES_MASK) + 1,
            format: ((regs.cfg >> fields::CFG_FORMAT_SHIFT) & fields::CFG_FORMAT_MASK).max(1),
            start_slice: (regs.cfg >> fields::CFG_SLICE_SHIFT) & fields::CFG_SLICE_MASK,
            line_stride: regs.ls & fields::LS_STRIDE_MASK,
            chunk_size: (regs.ls >> fields::LS_CHUNK_SHIFT) & fields::LS_CHUNK_MASK,
            plane_stride: regs.ps,
            start_level: regs.ir & fields::IR_START_LEVEL_MASK,
        }
    }

    /// Bytes occupied by one packed line of `width` pixels.
    #[inline]
    pub fn line_bytes(&self, width: usize) -> usize {
        width * self.format as usize
    }
}

#[inline]
fn wrap(v: u32, modulus: u32) -> u32 {
    if modulus == 0 {
        v
    } else {
        v % modulus
    }
}

/// One filter port: banked geometry registers plus live streaming state.
#[derive(Debug)]
pub struct LineBuffer {
    port: Port,
    banks: [BankRegs; 2],
    geo: Geometry,
    fill_level: u32,
    buffer_idx: u32,
    start_bit: bool,
}

impl LineBuffer {
    pub fn new(port: Port) -> Self {
        Self {
            port,
            banks: [BankRegs::default(); 2],
            geo: Geometry::default(),
            fill_level: 0,
            buffer_idx: 0,
            start_bit: false,
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    // ------------------------------------------------------------------
    // Banked configuration registers
    // ------------------------------------------------------------------

    pub fn set_base(&mut self, value: u32, bank: Bank) {
        self.banks[bank.idx()].base = value;
    }

    pub fn base(&self, bank: Bank) -> u32 {
        self.banks[bank.idx()].base
    }

    pub fn set_cfg(&mut self, value: u32, bank: Bank) {
        self.banks[bank.idx()].cfg = value;
    }

    pub fn cfg(&self, bank: Bank) -> u32 {
        self.banks[bank.idx()].cfg
    }

    pub fn set_line_stride(&mut self, value: u32, bank: Bank) {
        self.banks[bank.idx()].ls = value;
    }

    pub fn line_stride(&self, bank: Bank) -> u32 {
        self.banks[bank.idx()].ls
    }

    pub fn set_plane_stride(&mut self, value: u32, bank: Bank) {
        self.banks[bank.idx()].ps = value;
    }

    pub fn plane_stride(&self, bank: Bank) -> u32 {
        self.banks[bank.idx()].ps
    }

    pub fn set_irq_cfg(&mut self, value: u32, bank: Bank) {
        self.banks[bank.idx()].ir = value;
    }

    pub fn irq_cfg(&self, bank: Bank) -> u32 {
        self.banks[bank.idx()].ir
    }

    /// Latch the working geometry from `bank`. Called once per dispatch.
    pub fn select_bank(&mut self, bank: Bank) {
        self.geo = Geometry::decode(&self.banks[bank.idx()]);
    }

    /// Working geometry latched by the last [`select_bank`](Self::select_bank).
    #[inline]
    pub fn geo(&self) -> Geometry {
        self.geo
    }

    // ------------------------------------------------------------------
    // Fill level
    // ------------------------------------------------------------------

    #[inline]
    pub fn fill_level(&self) -> u32 {
        self.fill_level
    }

    /// Absolute set, used by the FC context-update path.
    pub fn set_fill_level(&mut self, level: u32) {
        self.fill_level = level & fields::NL_MASK;
    }

    /// Add one buffered line. Exceeding a circular buffer's depth is a
    /// contract breach.
    pub fn inc_fill_level(&mut self) -> Result<(), DeviceError> {
        if self.geo.lines > 0 && self.fill_level >= self.geo.lines {
            return Err(DeviceError::FillOverflow {
                port: self.port.as_str(),
                capacity: self.geo.lines,
            });
        }
        self.fill_level += 1;
        trace!("{} buffer fill -> {}", self.port, self.fill_level);
        Ok(())
    }

    /// Consume one buffered line.
    pub fn dec_fill_level(&mut self) -> Result<(), DeviceError> {
        if self.fill_level == 0 {
            return Err(DeviceError::FillUnderflow {
                port: self.port.as_str(),
            });
        }
        self.fill_level -= 1;
        trace!("{} buffer fill -> {}", self.port, self.fill_level);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffer index
    // ------------------------------------------------------------------

    #[inline]
    pub fn buffer_idx(&self) -> u32 {
        self.buffer_idx
    }

    /// Index `offset` lines past the current one, wrapped to the circular
    /// depth. Non-wrapping buffers advance linearly.
    #[inline]
    pub fn buffer_idx_at(&self, offset: u32) -> u32 {
        wrap(self.buffer_idx + offset, self.geo.lines)
    }

    /// Current index reduced modulo the frame height, as reported by the
    /// context registers for non-wrapping buffers.
    #[inline]
    pub fn buffer_idx_no_wrap(&self, height: u32) -> u32 {
        wrap(self.buffer_idx, height)
    }

    pub fn set_buffer_idx(&mut self, value: u32) {
        self.buffer_idx = wrap(value, self.geo.lines);
    }

    pub fn set_buffer_idx_no_wrap(&mut self, value: u32, height: u32) {
        self.buffer_idx = wrap(value, height);
    }

    pub fn inc_buffer_idx(&mut self) {
        self.buffer_idx = self.buffer_idx_at(1);
    }

    pub fn inc_buffer_idx_no_wrap(&mut self, height: u32) {
        self.buffer_idx = wrap(self.buffer_idx + 1, height);
    }

    // ------------------------------------------------------------------
    // Start bit
    // ------------------------------------------------------------------

    pub fn set_start_bit(&mut self, bit: bool) {
        self.start_bit = bit;
    }

    pub fn clr_start_bit(&mut self) {
        self.start_bit = false;
    }

    #[inline]
    pub fn start_bit(&self) -> bool {
        self.start_bit
    }

    // ------------------------------------------------------------------
    // Line addressing and slice-chunked packing
    // ------------------------------------------------------------------

    /// Start slice of `plane`, advancing from the previous plane's start
    /// slice by planeStride worth of slices with wrap from the last slice
    /// back to the first. `prev` is ignored for plane 0.
    pub fn plane_start_slice(&self, slice: SliceGeometry, prev: u32, plane: u32) -> u32 {
        if plane == 0 {
            return self.geo.start_slice;
        }
        let pstride = self.geo.plane_stride / self.geo.format;
        let sstride = (slice.size / self.geo.format).max(1);
        let ss_in_ps = pstride / sstride;
        let over = (prev + ss_in_ps) as i64 - slice.last as i64;
        if over > 0 {
            slice.first + over as u32 - 1
        } else {
            prev + ss_in_ps
        }
    }

    /// Element offset of the first pixel of `buffer_line` in `plane`, given
    /// the plane's start slice.
    fn line_elem_offset(
        &self,
        slice: SliceGeometry,
        plane_slice: u32,
        plane: u32,
        buffer_line: u32,
    ) -> u32 {
        let g = &self.geo;
        let lstride = g.line_stride / g.format;
        let pstride = (g.plane_stride / g.format) % slice.size.max(1);
        let sstride = (slice.size / g.format) * plane_slice;
        sstride + lstride * buffer_line + pstride * plane
    }

    /// Gather one line into a packed scratch row.
    ///
    /// With a zero chunk size the line is one contiguous run. Otherwise the
    /// line is split into chunk-sized runs, one per CMX slice, successive
    /// chunks one slice apart with wrap from the last slice to the first.
    pub fn gather_line(
        &self,
        mem: &CmxMemory,
        slice: SliceGeometry,
        plane_slice: u32,
        plane: u32,
        buffer_line: u32,
        width: usize,
        out: &mut [u8],
    ) -> Result<(), DeviceError> {
        let g = &self.geo;
        let fmt = g.format as usize;
        debug_assert_eq!(out.len(), width * fmt);

        let mut elem = self.line_elem_offset(slice, plane_slice, plane, buffer_line) as i64;
        let chunk_px = (g.chunk_size / g.format) as usize;
        if chunk_px == 0 {
            let off = g.base + (elem as u32) * g.format;
            mem.read_bytes(off, out)?;
            return Ok(());
        }

        let slice_stride = (slice.size / g.format) as i64;
        let full_chunks = width / chunk_px;
        let mut packed = 0usize;
        for crt in 0..full_chunks {
            let off = g.base + (elem as u32) * g.format;
            mem.read_bytes(off, &mut out[packed..packed + chunk_px * fmt])?;
            packed += chunk_px * fmt;
            elem += slice_stride * slice.next_slice_step(plane_slice, (crt + 1) as u32) as i64;
        }
        let remainder = width - full_chunks * chunk_px;
        if remainder > 0 {
            let off = g.base + (elem as u32) * g.format;
            mem.read_bytes(off, &mut out[packed..packed + remainder * fmt])?;
        }
        Ok(())
    }

    /// Scatter one packed line back out, undoing [`gather_line`](Self::gather_line).
    pub fn scatter_line(
        &self,
        mem: &mut CmxMemory,
        slice: SliceGeometry,
        plane_slice: u32,
        plane: u32,
        buffer_line: u32,
        width: usize,
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let g = &self.geo;
        let fmt = g.format as usize;
        debug_assert_eq!(data.len(), width * fmt);

        let mut elem = self.line_elem_offset(slice, plane_slice, plane, buffer_line) as i64;
        let chunk_px = (g.chunk_size / g.format) as usize;
        if chunk_px == 0 {
            let off = g.base + (elem as u32) * g.format;
            mem.write_bytes(off, data)?;
            return Ok(());
        }

        let slice_stride = (slice.size / g.format) as i64;
        let full_chunks = width / chunk_px;
        let mut packed = 0usize;
        for crt in 0..full_chunks {
            let off = g.base + (elem as u32) * g.format;
            mem.write_bytes(off, &data[packed..packed + chunk_px * fmt])?;
            packed += chunk_px * fmt;
            elem += slice_stride * slice.next_slice_step(plane_slice, (crt + 1) as u32) as i64;
        }
        let remainder = width - full_chunks * chunk_px;
        if remainder > 0 {
            let off = g.base + (elem as u32) * g.format;
            mem.write_bytes(off, &data[packed..packed + remainder * fmt])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circular_buffer(lines: u32, format: u32) -> LineBuffer {
        let mut b = LineBuffer::new(Port::Input);
        b.set_cfg(lines | (format << fields::CFG_FORMAT_SHIFT), Bank::Default);
        b.select_bank(Bank::Default);
        b
    }

    #[test]
    fn test_banks_are_independent() {
        let mut b = LineBuffer::new(Port::Input);
        b.set_base(0x1000, Bank::Default);
        b.set_base(0x2000, Bank::Shadow);
        assert_eq!(b.base(Bank::Default), 0x1000);
        assert_eq!(b.base(Bank::Shadow), 0x2000);

        b.select_bank(Bank::Shadow);
        assert_eq!(b.geo().base, 0x2000);
        b.select_bank(Bank::Default);
        assert_eq!(b.geo().base, 0x1000);
    }

    #[test]
    fn test_cfg_decode() {
        let mut b = LineBuffer::new(Port::Input);
        // 6 lines, last plane index 2, 2 bytes/pixel, start slice 3
        b.set_cfg(6 | (2 << 10) | (2 << 16) | (3 << 24), Bank::Default);
        b.set_line_stride(640 | (128 << fields::LS_CHUNK_SHIFT), Bank::Default);
        b.set_plane_stride(0x4000, Bank::Default);
        b.set_irq_cfg(5, Bank::Default);
        b.select_bank(Bank::Default);

        let g = b.geo();
        assert_eq!(g.lines, 6);
        assert_eq!(g.planes, 3);
        assert_eq!(g.format, 2);
        assert_eq!(g.start_slice, 3);
        assert_eq!(g.line_stride, 640);
        assert_eq!(g.chunk_size, 128);
        assert_eq!(g.plane_stride, 0x4000);
        assert_eq!(g.start_level, 5);
    }

    #[test]
    fn test_fill_level_contract() {
        let mut b = circular_buffer(2, 1);
        assert!(b.dec_fill_level().is_err());
        b.inc_fill_level().unwrap();
        b.inc_fill_level().unwrap();
        assert!(matches!(
            b.inc_fill_level(),
            Err(DeviceError::FillOverflow { capacity: 2, .. })
        ));
        b.dec_fill_level().unwrap();
        assert_eq!(b.fill_level(), 1);
    }

    #[test]
    fn test_non_wrapping_fill_is_unbounded() {
        let mut b = circular_buffer(0, 1);
        for _ in 0..100 {
            b.inc_fill_level().unwrap();
        }
        assert_eq!(b.fill_level(), 100);
    }

    #[test]
    fn test_buffer_idx_wraps_to_depth() {
        let mut b = circular_buffer(3, 1);
        assert_eq!(b.buffer_idx_at(0), 0);
        assert_eq!(b.buffer_idx_at(4), 1);
        b.inc_buffer_idx();
        b.inc_buffer_idx();
        b.inc_buffer_idx();
        assert_eq!(b.buffer_idx(), 0);
        b.set_buffer_idx(7);
        assert_eq!(b.buffer_idx(), 1);
    }

    #[test]
    fn test_buffer_idx_no_wrap_uses_height() {
        let mut b = circular_buffer(0, 1);
        for _ in 0..5 {
            b.inc_buffer_idx_no_wrap(4);
        }
        assert_eq!(b.buffer_idx(), 1);
        b.set_buffer_idx_no_wrap(9, 4);
        assert_eq!(b.buffer_idx(), 1);
        assert_eq!(b.buffer_idx_no_wrap(4), 1);
    }

    #[test]
    fn test_gather_contiguous_line() {
        let mut mem = CmxMemory::new();
        let slice = SliceGeometry::default();
        let mut b = circular_buffer(4, 1);
        b.set_base(0x100, Bank::Default);
        b.set_line_stride(8, Bank::Default);
        b.select_bank(Bank::Default);

        mem.write_bytes(0x100 + 8 * 2, &[9, 8, 7, 6]).unwrap();
        let mut row = [0u8; 4];
        b.gather_line(&mem, slice, 0, 0, 2, 4, &mut row).unwrap();
        assert_eq!(row, [9, 8, 7, 6]);
    }

    #[test]
    fn test_gather_chunked_line_steps_slices() {
        let mut mem = CmxMemory::new();
        let slice = SliceGeometry {
            size: 16,
            first: 0,
            last: 1,
        };
        let mut b = circular_buffer(4, 1);
        // chunk of 4 bytes per slice, line stride 4
        b.set_line_stride(4 | (4 << fields::LS_CHUNK_SHIFT), Bank::Default);
        b.select_bank(Bank::Default);

        // line 0 of a 6-pixel frame: one full chunk in slice 0, remainder in slice 1
        mem.write_bytes(0, &[1, 2, 3, 4]).unwrap();
        mem.write_bytes(16, &[5, 6]).unwrap();
        let mut row = [0u8; 6];
        b.gather_line(&mem, slice, 0, 0, 0, 6, &mut row).unwrap();
        assert_eq!(row, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_gather_chunked_wraps_to_first_slice() {
        let mut mem = CmxMemory::new();
        let slice = SliceGeometry {
            size: 16,
            first: 0,
            last: 1,
        };
        let mut b = circular_buffer(4, 1);
        b.set_cfg(4 | (1 << fields::CFG_SLICE_SHIFT), Bank::Default);
        b.set_line_stride(4 | (4 << fields::LS_CHUNK_SHIFT), Bank::Default);
        b.select_bank(Bank::Default);

        // plane starts in the last slice: the second chunk wraps to slice 0
        mem.write_bytes(16, &[1, 2, 3, 4]).unwrap();
        mem.write_bytes(0, &[5, 6]).unwrap();
        let mut row = [0u8; 6];
        b.gather_line(&mem, slice, 1, 0, 0, 6, &mut row).unwrap();
        assert_eq!(row, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_scatter_reverses_gather() {
        let mut mem = CmxMemory::new();
        let slice = SliceGeometry {
            size: 16,
            first: 0,
            last: 1,
        };
        let mut b = circular_buffer(4, 1);
        b.set_line_stride(4 | (4 << fields::LS_CHUNK_SHIFT), Bank::Default);
        b.select_bank(Bank::Default);

        let row = [11, 12, 13, 14, 15, 16];
        b.scatter_line(&mut mem, slice, 0, 0, 0, 6, &row).unwrap();
        assert_eq!(mem.bytes(0, 4).unwrap(), &[11, 12, 13, 14]);
        assert_eq!(mem.bytes(16, 2).unwrap(), &[15, 16]);

        let mut back = [0u8; 6];
        b.gather_line(&mem, slice, 0, 0, 0, 6, &mut back).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_plane_start_slice_advances_and_wraps() {
        let slice = SliceGeometry {
            size: 16,
            first: 0,
            last: 3,
        };
        let mut b = LineBuffer::new(Port::Input);
        // start slice 1, plane stride of two slices
        b.set_cfg(4 | (1 << fields::CFG_SLICE_SHIFT), Bank::Default);
        b.set_plane_stride(32, Bank::Default);
        b.select_bank(Bank::Default);

        let s0 = b.plane_start_slice(slice, 0, 0);
        assert_eq!(s0, 1);
        let s1 = b.plane_start_slice(slice, s0, 1);
        assert_eq!(s1, 3);
        let s2 = b.plane_start_slice(slice, s1, 2);
        assert_eq!(s2, 1); // wrapped past the last slice
    }

    #[test]
    fn test_plane_offset_within_slice() {
        let mut mem = CmxMemory::new();
        let slice = SliceGeometry::default();
        let mut b = LineBuffer::new(Port::Input);
        // 2 planes, plane stride 0x20 within one slice
        b.set_cfg(4 | (1 << fields::CFG_PLANES_SHIFT), Bank::Default);
        b.set_line_stride(8, Bank::Default);
        b.set_plane_stride(0x20, Bank::Default);
        b.select_bank(Bank::Default);

        mem.write_bytes(0x20 + 8, &[42, 43]).unwrap();
        let mut row = [0u8; 2];
        // plane 1, buffer line 1
        b.gather_line(&mem, slice, 0, 1, 1, 2, &mut row).unwrap();
        assert_eq!(row, [42, 43]);
    }
}
