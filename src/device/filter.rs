//! Generic filter unit contract.
//!
//! Every filter shares the same life-cycle: latch working parameters from the
//! active register bank, gate on buffer fill levels, produce one line across
//! all planes, update buffer state, advance the line index, and raise the
//! end-of-frame interrupt when the index wraps. [`FilterCore`] carries that
//! shared state; [`FilterUnit`] layers the per-filter numeric step on top and
//! provides the two dispatch entry points:
//!
//! - [`FilterUnit::try_run`]: the non-blocking re-entrant drain loop, invoked
//!   from both the producer (input fill increment) and the consumer (output
//!   fill decrement) register paths. Concurrent entrants are serialized by a
//!   compare-and-swap flag; the loser does no work and relies on the winner
//!   to drain every currently runnable line.
//! - [`FilterUnit::set_up_and_run`]: the blocking single-line dispatch used
//!   when a whole frame is already resident. No fill gate, synchronous buffer
//!   updates (indices move, fill levels do not), start bit cleared.
//!
//! Frame-edge behavior: a kernel of height k reads k lines centered on the
//! current one; within maxPad = k/2 lines of either edge the missing taps
//! replicate the nearest valid line.

use std::sync::atomic::{AtomicBool, Ordering};

use log::{info, trace, warn};
use smallvec::SmallVec;

use crate::device::buffer::{Bank, LineBuffer, Port};
use crate::device::irq::InterruptController;
use crate::device::memory::{CmxMemory, SliceGeometry};
use crate::device::sipp_spec::{
    fields, IRQ_GROUP_EOF, IRQ_GROUP_INPUT, IRQ_GROUP_OUTPUT, MAX_KERNEL_HEIGHT,
};
use crate::device::DeviceError;

/// Tap list for one vertical kernel window: the buffer line index each of the
/// kernel's rows reads from, edge replication already applied.
pub type KernelTaps = SmallVec<[u32; MAX_KERNEL_HEIGHT]>;

/// State shared by every filter unit: the input/output ports, frame
/// dimensions, line/frame counters and the drain exclusion flag.
#[derive(Debug)]
pub struct FilterCore {
    unit: usize,
    name: &'static str,
    pub in_buf: LineBuffer,
    pub out_buf: LineBuffer,
    frm_dim: [u32; 2],
    width: u32,
    height: u32,
    kernel: usize,
    max_pad: u32,
    line_idx: u32,
    out_line_idx: u32,
    frame_count: u32,
    enabled: bool,
    running: AtomicBool,
}

impl FilterCore {
    pub fn new(unit: usize, name: &'static str, kernel: usize) -> Self {
        Self {
            unit,
            name,
            in_buf: LineBuffer::new(Port::Input),
            out_buf: LineBuffer::new(Port::Output),
            frm_dim: [0; 2],
            width: 0,
            height: 0,
            kernel,
            max_pad: (kernel >> 1) as u32,
            line_idx: 0,
            out_line_idx: 0,
            frame_count: 0,
            enabled: false,
            running: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn unit(&self) -> usize {
        self.unit
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    // ------------------------------------------------------------------
    // Enable / drain exclusion
    // ------------------------------------------------------------------

    pub fn enable(&mut self) {
        if !self.enabled {
            info!("{}: enabled", self.name);
        }
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        if self.enabled {
            info!("{}: disabled", self.name);
        }
        self.enabled = false;
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Claim the drain loop. Returns false when another entrant holds it.
    pub fn try_enter(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the drain loop.
    pub fn leave(&self) {
        self.running.store(false, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Frame dimensions and counters
    // ------------------------------------------------------------------

    pub fn set_frm_dim(&mut self, value: u32, bank: Bank) {
        self.frm_dim[bank as usize] = value;
    }

    pub fn frm_dim(&self, bank: Bank) -> u32 {
        self.frm_dim[bank as usize]
    }

    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height of the latched bank; parameterizes every non-wrapping
    /// index computation.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[inline]
    pub fn kernel(&self) -> usize {
        self.kernel
    }

    #[inline]
    pub fn max_pad(&self) -> u32 {
        self.max_pad
    }

    /// Change the vertical kernel height. Parameter-driven filters call this
    /// from their bank latch.
    pub fn set_kernel(&mut self, kernel: usize) {
        self.kernel = kernel;
        self.max_pad = (kernel >> 1) as u32;
    }

    #[inline]
    pub fn line_idx(&self) -> u32 {
        self.line_idx
    }

    /// Absolute line index set from the input context register.
    pub fn set_line_idx(&mut self, line_idx: u32) {
        self.line_idx = line_idx & fields::IMGDIM_MASK;
    }

    #[inline]
    pub fn out_line_idx(&self) -> u32 {
        self.out_line_idx
    }

    pub fn set_out_line_idx(&mut self, line_idx: u32) {
        self.out_line_idx = line_idx & fields::IMGDIM_MASK;
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    /// Advance to the next frame line; wraps at the frame height and counts
    /// the completed frame. Returns the new line index, 0 meaning the frame
    /// just ended.
    pub fn inc_line_idx(&mut self) -> u32 {
        self.line_idx += 1;
        if self.line_idx >= self.height {
            self.line_idx = 0;
            self.frame_count += 1;
            info!("{}: processed {} frames", self.name, self.frame_count);
        }
        self.line_idx
    }

    /// Advance the output line index, wrapping at the frame height.
    pub fn inc_out_line_idx(&mut self) {
        self.out_line_idx += 1;
        if self.out_line_idx >= self.height {
            self.out_line_idx = 0;
        }
    }

    /// Latch frame dimensions and both port geometries from `bank`.
    pub fn select_parameters(&mut self, bank: Bank) {
        let dim = self.frm_dim[bank as usize];
        self.width = dim & fields::IMGDIM_MASK;
        self.height = dim >> fields::IMGDIM_SIZE;
        self.in_buf.select_bank(bank);
        self.out_buf.select_bank(bank);
    }

    // ------------------------------------------------------------------
    // Run gate
    // ------------------------------------------------------------------

    /// Whether the next line can be produced with a vertical kernel of
    /// `kernel` lines, given current fill levels.
    pub fn can_run(&self, kernel: usize) -> bool {
        let in_geo = self.in_buf.geo();
        let out_geo = self.out_buf.geo();

        // At start of frame wait for the buffer fill level to hit the
        // programmed start level
        if self.frame_count == 0
            && self.line_idx == 0
            && self.in_buf.fill_level() < in_geo.start_level
        {
            return false;
        }

        if in_geo.lines == 0 {
            if out_geo.lines == 0 {
                true
            } else {
                self.out_buf.fill_level() < out_geo.lines
            }
        } else {
            let min_fill = self.min_fill(kernel);
            if out_geo.lines == 0 {
                self.in_buf.fill_level() >= min_fill
            } else {
                self.in_buf.fill_level() >= min_fill
                    && self.out_buf.fill_level() < out_geo.lines
            }
        }
    }

    /// Lines the input buffer must hold before the current line can run:
    /// near the frame edges replication shrinks the requirement below the
    /// kernel height.
    pub fn min_fill(&self, kernel: usize) -> u32 {
        let max_pad = (kernel >> 1) as u32;
        if self.line_idx < max_pad {
            self.line_idx + max_pad + 1
        } else if self.height - self.line_idx <= max_pad {
            max_pad + self.height - self.line_idx
        } else {
            kernel as u32
        }
    }

    // ------------------------------------------------------------------
    // Kernel window assembly
    // ------------------------------------------------------------------

    /// Buffer line index for each row of a `kernel`-line window centered on
    /// the current frame line, replicating the nearest valid line at the
    /// frame edges.
    pub fn kernel_taps(&self, buf: &LineBuffer, kernel: usize) -> KernelTaps {
        let max_pad = (kernel >> 1) as i64;
        let line = self.line_idx as i64;
        let height = self.height as i64;
        let mut taps = KernelTaps::new();

        let top_pad = max_pad - line;
        let bottom_pad = line + max_pad - (height - 1);
        if top_pad > 0 {
            for _ in 0..top_pad {
                taps.push(buf.buffer_idx_at(0));
            }
            for kv in top_pad..kernel as i64 {
                taps.push(buf.buffer_idx_at((kv - top_pad) as u32));
            }
        } else if bottom_pad > 0 {
            for kv in 0..kernel as i64 - bottom_pad {
                taps.push(buf.buffer_idx_at(kv as u32));
            }
            let last = taps.last().copied().unwrap_or_else(|| buf.buffer_idx_at(0));
            for _ in 0..bottom_pad {
                taps.push(last);
            }
        } else {
            for kv in 0..kernel {
                taps.push(buf.buffer_idx_at(kv as u32));
            }
        }
        taps
    }

    /// Gather a full vertical window of packed lines from `buf` into `rows`.
    /// `rows` must hold `kernel` scratch lines of the port's line width.
    pub fn gather_window(
        &self,
        buf: &LineBuffer,
        mem: &CmxMemory,
        slice: SliceGeometry,
        plane_slice: u32,
        plane: u32,
        kernel: usize,
        width: usize,
        rows: &mut [Vec<u8>],
    ) -> Result<(), DeviceError> {
        let taps = self.kernel_taps(buf, kernel);
        for (row, &tap) in rows.iter_mut().zip(taps.iter()) {
            buf.gather_line(mem, slice, plane_slice, plane, tap, width, row)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffer updates after a produced line
    // ------------------------------------------------------------------

    /// Asynchronous update used by the drain loop: fill levels move with the
    /// data, interrupts fire per the port's wrap mode.
    pub fn update_buffers(&mut self, irq: &mut InterruptController) -> Result<(), DeviceError> {
        self.update_output_buffer(irq)?;
        self.update_input_buffer(irq)
    }

    /// Output side of the asynchronous update.
    pub fn update_output_buffer(&mut self, irq: &mut InterruptController) -> Result<(), DeviceError> {
        if self.out_buf.geo().lines == 0 {
            self.out_buf.inc_buffer_idx_no_wrap(self.height);
            if self.out_buf.buffer_idx() == 0 {
                irq.raise(IRQ_GROUP_OUTPUT, self.unit);
            }
        } else {
            self.out_buf.inc_fill_level()?;
            self.out_buf.inc_buffer_idx();
            irq.raise(IRQ_GROUP_OUTPUT, self.unit);
        }
        Ok(())
    }

    /// Input side of the asynchronous update.
    pub fn update_input_buffer(&mut self, irq: &mut InterruptController) -> Result<(), DeviceError> {
        if self.in_buf.geo().lines == 0 {
            if self.line_idx + 1 == self.height {
                // Last line - flush the padded window at the bottom
                for _ in 0..=self.max_pad {
                    self.in_buf.inc_buffer_idx_no_wrap(self.height);
                }
                irq.raise(IRQ_GROUP_INPUT, self.unit);
            } else if self.max_pad as i64 - self.line_idx as i64 <= 0 {
                self.in_buf.inc_buffer_idx_no_wrap(self.height);
            }
        } else if self.line_idx + 1 == self.height {
            // Last line - flush the padded window at the bottom
            for _ in 0..=self.max_pad {
                self.in_buf.dec_fill_level()?;
                self.in_buf.inc_buffer_idx();
            }
            irq.raise(IRQ_GROUP_INPUT, self.unit);
        } else if self.max_pad as i64 - self.line_idx as i64 <= 0 {
            self.in_buf.dec_fill_level()?;
            self.in_buf.inc_buffer_idx();
            irq.raise(IRQ_GROUP_INPUT, self.unit);
        }
        Ok(())
    }

    /// Synchronous update used by the blocking dispatch: indices move and
    /// interrupts fire, fill levels stay put.
    pub fn update_buffers_sync(&mut self, irq: &mut InterruptController) {
        self.update_output_buffer_sync(irq);
        self.update_input_buffer_sync(irq);
    }

    /// Output side of the synchronous update.
    pub fn update_output_buffer_sync(&mut self, irq: &mut InterruptController) {
        self.out_buf.inc_buffer_idx();
        irq.raise(IRQ_GROUP_OUTPUT, self.unit);
    }

    /// Input side of the synchronous update.
    pub fn update_input_buffer_sync(&mut self, irq: &mut InterruptController) {
        if self.line_idx + 1 == self.height {
            for _ in 0..=self.max_pad {
                self.in_buf.inc_buffer_idx();
            }
            irq.raise(IRQ_GROUP_INPUT, self.unit);
        } else if self.max_pad as i64 - self.line_idx as i64 <= 0 {
            self.in_buf.inc_buffer_idx();
            irq.raise(IRQ_GROUP_INPUT, self.unit);
        }
    }
}

/// One filter unit: the shared core plus the per-filter numeric line step.
///
/// The provided methods implement the full dispatch contract; implementors
/// supply parameter latching, validation and the actual line math, and may
/// override the gate and buffer updates when they carry extra ports.
pub trait FilterUnit {
    fn core(&self) -> &FilterCore;
    fn core_mut(&mut self) -> &mut FilterCore;

    /// Latch working parameters from the given register bank. Called once
    /// per dispatch entry before any line runs.
    fn select_parameters(&mut self, bank: Bank);

    /// Validate the latched configuration. Called at line 0 of every frame;
    /// a violation aborts the dispatch.
    fn validate_config(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Produce one line across all planes from the latched state.
    fn run_line(&mut self, mem: &mut CmxMemory, slice: SliceGeometry) -> Result<(), DeviceError>;

    /// Gate for the next line.
    fn can_run(&self) -> bool {
        let core = self.core();
        core.can_run(core.kernel())
    }

    fn update_buffers(&mut self, irq: &mut InterruptController) -> Result<(), DeviceError> {
        self.core_mut().update_buffers(irq)
    }

    fn update_buffers_sync(&mut self, irq: &mut InterruptController) {
        self.core_mut().update_buffers_sync(irq)
    }

    /// Producer-side fill increment, entered from the FC register write.
    fn inc_input_fill(&mut self) -> Result<(), DeviceError> {
        self.core_mut().in_buf.inc_fill_level()
    }

    /// Hook for per-frame latched state, called after the end-of-frame
    /// interrupt is raised.
    fn on_end_of_frame(&mut self) {}

    /// Non-blocking re-entrant drain loop. A losing entrant returns without
    /// doing any work.
    fn try_run(
        &mut self,
        mem: &mut CmxMemory,
        irq: &mut InterruptController,
        slice: SliceGeometry,
        bank: Bank,
    ) -> Result<(), DeviceError> {
        if !self.core().is_enabled() {
            return Ok(());
        }
        if !self.core().try_enter() {
            return Ok(());
        }
        let result = self.drain(mem, irq, slice, bank);
        self.core().leave();
        result
    }

    /// Drain every currently runnable line. Callers hold the exclusion flag.
    fn drain(
        &mut self,
        mem: &mut CmxMemory,
        irq: &mut InterruptController,
        slice: SliceGeometry,
        bank: Bank,
    ) -> Result<(), DeviceError> {
        self.select_parameters(bank);
        while self.can_run() {
            if self.core().line_idx() == 0 {
                self.validate_config()?;
            }
            trace!(
                "{}: line {} frame {}",
                self.core().name(),
                self.core().line_idx(),
                self.core().frame_count()
            );
            self.run_line(mem, slice)?;
            self.update_buffers(irq)?;
            self.core_mut().inc_out_line_idx();
            let line = self.core_mut().inc_line_idx();
            if line == 0 {
                irq.raise(IRQ_GROUP_EOF, self.core().unit());
                self.on_end_of_frame();
                // Disable the filter unless the input buffer is circular
                if self.core().in_buf.geo().lines == 0 {
                    self.core_mut().disable();
                    break;
                }
            }
        }
        Ok(())
    }

    /// Blocking single-line dispatch for frames already resident in CMX.
    fn set_up_and_run(
        &mut self,
        mem: &mut CmxMemory,
        irq: &mut InterruptController,
        slice: SliceGeometry,
        bank: Bank,
    ) -> Result<(), DeviceError> {
        if !self.core().is_enabled() {
            return Ok(());
        }
        self.select_parameters(bank);
        if !self.can_run() {
            warn!(
                "{}: no more data for line {}",
                self.core().name(),
                self.core().line_idx()
            );
            return Ok(());
        }
        if self.core().line_idx() == 0 {
            self.validate_config()?;
        }
        trace!(
            "{}: dispatch line {} frame {}",
            self.core().name(),
            self.core().line_idx(),
            self.core().frame_count()
        );
        self.run_line(mem, slice)?;
        self.core_mut().in_buf.clr_start_bit();
        self.update_buffers_sync(irq);
        self.core_mut().inc_out_line_idx();
        let line = self.core_mut().inc_line_idx();
        if line == 0 {
            irq.raise(IRQ_GROUP_EOF, self.core().unit());
            self.on_end_of_frame();
        }
        Ok(())
    }
}

/// Allocate kernel scratch rows: `kernel` lines of `line_bytes` each.
pub fn alloc_rows(kernel: usize, line_bytes: usize) -> Vec<Vec<u8>> {
    vec![vec![0u8; line_bytes]; kernel]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sipp_spec::fields as f;

    /// Minimal unit for exercising the shared contract: copies the window's
    /// center line to the output.
    struct CopyFilter {
        core: FilterCore,
        rows: Vec<Vec<u8>>,
        out_row: Vec<u8>,
    }

    impl CopyFilter {
        fn new() -> Self {
            Self {
                core: FilterCore::new(0, "copy", 3),
                rows: Vec::new(),
                out_row: Vec::new(),
            }
        }
    }

    impl FilterUnit for CopyFilter {
        fn core(&self) -> &FilterCore {
            &self.core
        }

        fn core_mut(&mut self) -> &mut FilterCore {
            &mut self.core
        }

        fn select_parameters(&mut self, bank: Bank) {
            self.core.select_parameters(bank);
            let width = self.core.width() as usize;
            self.rows = alloc_rows(self.core.kernel(), width);
            self.out_row = vec![0u8; width];
        }

        fn run_line(
            &mut self,
            mem: &mut CmxMemory,
            slice: SliceGeometry,
        ) -> Result<(), DeviceError> {
            let width = self.core.width() as usize;
            let planes = self.core.in_buf.geo().planes;
            let mut in_slice = 0;
            let mut out_slice = 0;
            for pl in 0..planes {
                in_slice = self.core.in_buf.plane_start_slice(slice, in_slice, pl);
                out_slice = self.core.out_buf.plane_start_slice(slice, out_slice, pl);
                self.core.gather_window(
                    &self.core.in_buf,
                    mem,
                    slice,
                    in_slice,
                    pl,
                    self.core.kernel(),
                    width,
                    &mut self.rows,
                )?;
                self.out_row
                    .copy_from_slice(&self.rows[self.core.max_pad() as usize]);
                self.core.out_buf.scatter_line(
                    mem,
                    slice,
                    out_slice,
                    pl,
                    self.core.out_buf.buffer_idx(),
                    width,
                    &self.out_row,
                )?;
            }
            Ok(())
        }
    }

    fn setup(in_lines: u32, out_lines: u32, width: u32, height: u32) -> CopyFilter {
        let mut filt = CopyFilter::new();
        filt.core.set_frm_dim(width | (height << 16), Bank::Default);
        filt.core
            .in_buf
            .set_cfg(in_lines | (1 << f::CFG_FORMAT_SHIFT), Bank::Default);
        filt.core.in_buf.set_base(0x0000, Bank::Default);
        filt.core.in_buf.set_line_stride(width, Bank::Default);
        filt.core
            .out_buf
            .set_cfg(out_lines | (1 << f::CFG_FORMAT_SHIFT), Bank::Default);
        filt.core.out_buf.set_base(0x8000, Bank::Default);
        filt.core.out_buf.set_line_stride(width, Bank::Default);
        filt.core.enable();
        filt
    }

    #[test]
    fn test_kernel_taps_interior() {
        let mut filt = setup(5, 0, 4, 8);
        filt.select_parameters(Bank::Default);
        filt.core.set_line_idx(3);
        let taps = filt.core.kernel_taps(&filt.core.in_buf, 3);
        assert_eq!(taps.as_slice(), &[0, 1, 2]);
    }

    #[test]
    fn test_kernel_taps_top_edge_replicates_first_line() {
        let mut filt = setup(5, 0, 4, 8);
        filt.select_parameters(Bank::Default);
        // line 0 with a 5-line kernel: two taps replicate the first line
        let taps = filt.core.kernel_taps(&filt.core.in_buf, 5);
        assert_eq!(taps.len(), 5);
        assert_eq!(taps.as_slice(), &[0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_kernel_taps_bottom_edge_replicates_last_line() {
        let mut filt = setup(5, 0, 4, 8);
        filt.select_parameters(Bank::Default);
        filt.core.set_line_idx(7);
        let taps = filt.core.kernel_taps(&filt.core.in_buf, 3);
        assert_eq!(taps.len(), 3);
        // One real line then the bottom tap replicated
        assert_eq!(taps[1], taps[2]);
    }

    #[test]
    fn test_min_fill_by_region() {
        let mut filt = setup(5, 0, 4, 8);
        filt.select_parameters(Bank::Default);
        // Top: line 0 needs maxPad+1 lines
        filt.core.set_line_idx(0);
        assert_eq!(filt.core.min_fill(3), 2);
        // Interior: full kernel height
        filt.core.set_line_idx(4);
        assert_eq!(filt.core.min_fill(3), 3);
        // Bottom: height-1 needs maxPad+1
        filt.core.set_line_idx(7);
        assert_eq!(filt.core.min_fill(3), 2);
    }

    #[test]
    fn test_can_run_waits_for_start_level() {
        let mut filt = setup(5, 0, 4, 8);
        filt.core.in_buf.set_irq_cfg(4, Bank::Default);
        filt.select_parameters(Bank::Default);
        for _ in 0..3 {
            filt.core.in_buf.inc_fill_level().unwrap();
        }
        assert!(!filt.can_run());
        filt.core.in_buf.inc_fill_level().unwrap();
        assert!(filt.can_run());
    }

    #[test]
    fn test_can_run_gates_on_output_room() {
        let mut filt = setup(5, 2, 4, 8);
        filt.select_parameters(Bank::Default);
        for _ in 0..5 {
            filt.core.in_buf.inc_fill_level().unwrap();
        }
        assert!(filt.can_run());
        filt.core.out_buf.inc_fill_level().unwrap();
        filt.core.out_buf.inc_fill_level().unwrap();
        assert!(!filt.can_run());
    }

    #[test]
    fn test_try_enter_excludes_second_entrant() {
        let filt = setup(5, 0, 4, 8);
        assert!(filt.core.try_enter());
        assert!(!filt.core.try_enter());
        filt.core.leave();
        assert!(filt.core.try_enter());
    }

    #[test]
    fn test_line_idx_wraps_and_counts_frames() {
        let mut filt = setup(5, 0, 4, 2);
        filt.select_parameters(Bank::Default);
        assert_eq!(filt.core.inc_line_idx(), 1);
        assert_eq!(filt.core.inc_line_idx(), 0);
        assert_eq!(filt.core.frame_count(), 1);
    }

    #[test]
    fn test_drain_copies_frame_and_raises_eof() {
        let mut mem = CmxMemory::new();
        let mut irq = InterruptController::new();
        let slice = SliceGeometry::default();
        let height = 4u32;
        let width = 4u32;

        // Circular input (8 lines), non-wrapping output
        let mut filt = setup(8, 0, width, height);

        // Whole frame resident before the drain starts
        for line in 0..height {
            for x in 0..width {
                mem.write_u8(line * width + x, (10 * (line + 1)) as u8).unwrap();
            }
        }

        for _ in 0..height {
            filt.inc_input_fill().unwrap();
        }
        filt.try_run(&mut mem, &mut irq, slice, Bank::Default).unwrap();

        // Copy filter reproduces every line
        for line in 0..height {
            for x in 0..width {
                assert_eq!(
                    mem.read_u8(0x8000 + line * width + x).unwrap(),
                    (10 * (line + 1)) as u8,
                    "line {} col {}",
                    line,
                    x
                );
            }
        }

        // One end-of-frame event, filter still enabled (circular input)
        assert_eq!(irq.status(IRQ_GROUP_EOF), 1);
        assert!(filt.core.is_enabled());
        assert_eq!(filt.core.frame_count(), 1);
        assert_eq!(filt.core.line_idx(), 0);
        // All buffered input consumed
        assert_eq!(filt.core.in_buf.fill_level(), 0);
    }

    #[test]
    fn test_drain_stops_at_fill_boundary_and_resumes() {
        let mut mem = CmxMemory::new();
        let mut irq = InterruptController::new();
        let slice = SliceGeometry::default();
        let mut filt = setup(8, 0, 4, 4);

        for line in 0..4u32 {
            mem.write_bytes(line * 4, &[line as u8; 4]).unwrap();
        }

        // Two lines buffered: only line 0 can run (line 1 needs 3 lines)
        filt.inc_input_fill().unwrap();
        filt.inc_input_fill().unwrap();
        filt.try_run(&mut mem, &mut irq, slice, Bank::Default).unwrap();
        assert_eq!(filt.core.line_idx(), 1);

        // Remaining lines arrive; the drain finishes the frame
        filt.inc_input_fill().unwrap();
        filt.inc_input_fill().unwrap();
        filt.try_run(&mut mem, &mut irq, slice, Bank::Default).unwrap();
        assert_eq!(filt.core.line_idx(), 0);
        assert_eq!(filt.core.frame_count(), 1);
    }

    #[test]
    fn test_non_circular_input_auto_disables() {
        let mut mem = CmxMemory::new();
        let mut irq = InterruptController::new();
        let slice = SliceGeometry::default();
        // Non-wrapping input: frame fully resident, no fill gating
        let mut filt = setup(0, 0, 4, 4);

        filt.try_run(&mut mem, &mut irq, slice, Bank::Default).unwrap();

        assert_eq!(irq.status(IRQ_GROUP_EOF), 1);
        assert!(!filt.core.is_enabled());
        assert_eq!(filt.core.frame_count(), 1);
    }

    #[test]
    fn test_set_up_and_run_clears_start_bit_and_keeps_fill() {
        let mut mem = CmxMemory::new();
        let mut irq = InterruptController::new();
        let slice = SliceGeometry::default();
        let mut filt = setup(8, 0, 4, 4);
        filt.core.in_buf.set_start_bit(true);
        filt.core.in_buf.set_fill_level(4);

        filt.set_up_and_run(&mut mem, &mut irq, slice, Bank::Default)
            .unwrap();

        assert!(!filt.core.in_buf.start_bit());
        // Synchronous updates leave fill levels alone
        assert_eq!(filt.core.in_buf.fill_level(), 4);
        assert_eq!(filt.core.line_idx(), 1);
    }

    #[test]
    fn test_dispatch_without_data_is_a_no_op() {
        let mut mem = CmxMemory::new();
        let mut irq = InterruptController::new();
        let slice = SliceGeometry::default();
        let mut filt = setup(8, 0, 4, 4);
        // One buffered line cannot satisfy a 3-line kernel at line 0
        filt.core.in_buf.set_fill_level(1);

        filt.set_up_and_run(&mut mem, &mut irq, slice, Bank::Default)
            .unwrap();

        assert_eq!(filt.core.line_idx(), 0);
        assert_eq!(irq.status(IRQ_GROUP_OUTPUT), 0);
    }

    #[test]
    fn test_output_no_wrap_raises_irq_only_at_frame_end() {
        let mut irq = InterruptController::new();
        let mut filt = setup(8, 0, 4, 3);
        filt.select_parameters(Bank::Default);

        for _ in 0..3 {
            filt.core.in_buf.inc_fill_level().unwrap();
        }
        filt.core.update_buffers(&mut irq).unwrap();
        assert_eq!(irq.status(IRQ_GROUP_OUTPUT), 0);
        filt.core.inc_line_idx();
        filt.core.update_buffers(&mut irq).unwrap();
        assert_eq!(irq.status(IRQ_GROUP_OUTPUT), 0);
        filt.core.inc_line_idx();
        filt.core.update_buffers(&mut irq).unwrap();
        // Index wrapped to 0: the output event fires once
        assert_eq!(irq.status(IRQ_GROUP_OUTPUT), 1);
    }
}
