//! Host-side frame driver.
//!
//! [`FrameRunner`] plays the role the streaming firmware does on silicon: it
//! lays the port buffers out in CMX, programs the geometry registers, feeds
//! input lines while pulsing the fill counters, consumes finished lines from
//! the output window and watches the end-of-frame interrupt group. A
//! non-wrapping input region instead loads the whole frame up front and kicks
//! the unit through the context start bit.
//!
//! ```no_run
//! use sipp_emu::device::sipp_spec::conv_regs;
//! use sipp_emu::frame::{Frame, SampleFormat};
//! use sipp_emu::sim::{FilterKind, FrameRunner, PortLayout, RunnerConfig};
//!
//! let cfg = RunnerConfig {
//!     filter: FilterKind::Conv,
//!     width: 64,
//!     height: 48,
//!     input: PortLayout::streamed(4, 1, 2),
//!     output: PortLayout::streamed(2, 1, 2),
//!     reference: None,
//!     slice: Default::default(),
//! };
//! let mut runner = FrameRunner::new(cfg)?;
//! runner.write_param(conv_regs::CFG, 3)?;
//! runner.set_coefficients(&[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0])?;
//! let input = Frame::new(64, 48, 1, SampleFormat::U16);
//! let output = runner.run_frame(&input, None)?;
//! assert_eq!(output.data, input.data);
//! # anyhow::Ok(())
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use log::{debug, warn};

use crate::device::filters::conv::f32_to_f16;
use crate::device::sipp_spec::{
    chroma_regs, conv_regs, fields as f, unit, unit_base, SIPP_CONTROL, SIPP_INT0_STATUS,
    SIPP_INT1_STATUS, SIPP_INT2_CLEAR, SIPP_INT2_ENABLE, SIPP_INT2_STATUS, SIPP_SLC_SIZE,
    UNIT_CHROMA, UNIT_CONV, UNIT_DBYR,
};
use crate::device::{SippDevice, SliceGeometry};
use crate::frame::{Frame, SampleFormat};

/// The filter unit a runner drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Chroma,
    Conv,
    Debayer,
}

impl FilterKind {
    /// Unit id within the register map.
    pub fn unit(self) -> usize {
        match self {
            FilterKind::Chroma => UNIT_CHROMA,
            FilterKind::Conv => UNIT_CONV,
            FilterKind::Debayer => UNIT_DBYR,
        }
    }

    /// Parse a filter name as written in scenario files.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "chroma" | "cdn" => Some(FilterKind::Chroma),
            "conv" | "convolution" => Some(FilterKind::Conv),
            "debayer" | "dbyr" => Some(FilterKind::Debayer),
            _ => None,
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterKind::Chroma => "cdn",
            FilterKind::Conv => "conv",
            FilterKind::Debayer => "dbyr",
        };
        write!(f, "{}", name)
    }
}

/// Shape of one port's CMX window.
#[derive(Debug, Clone, Copy)]
pub struct PortLayout {
    /// Circular depth in lines, 0 for a whole-frame region with no fill
    /// tracking
    pub lines: u32,
    pub planes: u32,
    /// Bytes per pixel (1 or 2)
    pub bytes: u32,
    /// Fill level required before the first line of the first frame runs
    pub start_level: u32,
}

impl PortLayout {
    /// Whole-frame region, no fill tracking.
    pub fn resident(planes: u32, bytes: u32) -> Self {
        Self {
            lines: 0,
            planes,
            bytes,
            start_level: 0,
        }
    }

    /// Circular window of `lines` lines.
    pub fn streamed(lines: u32, planes: u32, bytes: u32) -> Self {
        Self {
            lines,
            planes,
            bytes,
            start_level: 0,
        }
    }
}

/// Everything a [`FrameRunner`] needs to program one filter unit.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub filter: FilterKind,
    pub width: u32,
    pub height: u32,
    pub input: PortLayout,
    pub output: PortLayout,
    /// Chroma denoise only
    pub reference: Option<PortLayout>,
    pub slice: SliceGeometry,
}

/// A port layout resolved to concrete CMX addresses.
#[derive(Debug, Clone, Copy)]
struct PortPlan {
    base: u32,
    lines: u32,
    planes: u32,
    bytes: u32,
    line_stride: u32,
    plane_stride: u32,
    start_level: u32,
}

impl PortPlan {
    fn new(port: &PortLayout, base: u32, width: u32, height: u32) -> Self {
        let region_lines = if port.lines == 0 { height } else { port.lines };
        let line_stride = width * port.bytes;
        Self {
            base,
            lines: port.lines,
            planes: port.planes,
            bytes: port.bytes,
            line_stride,
            plane_stride: region_lines * line_stride,
            start_level: port.start_level,
        }
    }

    fn line_addr(&self, plane: u32, slot: u32) -> u32 {
        self.base + plane * self.plane_stride + slot * self.line_stride
    }

    fn extent(&self) -> u32 {
        self.planes * self.plane_stride
    }

    fn cfg_value(&self) -> u32 {
        self.lines
            | (self.planes - 1) << f::CFG_PLANES_SHIFT
            | self.bytes << f::CFG_FORMAT_SHIFT
    }

    fn format(&self) -> SampleFormat {
        if self.bytes == 1 {
            SampleFormat::U8
        } else {
            SampleFormat::U16
        }
    }
}

/// Drives one filter unit of a [`SippDevice`] through whole frames.
pub struct FrameRunner {
    dev: SippDevice,
    cfg: RunnerConfig,
    base: u32,
    input: PortPlan,
    output: PortPlan,
    reference: Option<PortPlan>,
    eof: Arc<AtomicU32>,
}

impl FrameRunner {
    /// Lay the ports out in CMX and program the unit's geometry registers.
    pub fn new(cfg: RunnerConfig) -> Result<Self> {
        ensure!(
            cfg.width > 0 && cfg.height > 0,
            "frame dimensions must be nonzero"
        );
        ensure!(
            cfg.width <= f::IMGDIM_MASK && cfg.height <= f::IMGDIM_MASK,
            "frame dimensions exceed the 16-bit register fields"
        );
        ensure!(
            cfg.reference.is_none() || cfg.filter == FilterKind::Chroma,
            "only the chroma denoise unit carries a reference stream"
        );
        validate_port(&cfg.input, "input")?;
        validate_port(&cfg.output, "output")?;
        if let Some(port) = &cfg.reference {
            validate_port(port, "reference")?;
        }

        let input = PortPlan::new(&cfg.input, 0, cfg.width, cfg.height);
        let mut next = input.extent();
        let reference = match &cfg.reference {
            Some(port) => {
                let plan = PortPlan::new(port, next, cfg.width, cfg.height);
                next += plan.extent();
                Some(plan)
            }
            None => None,
        };
        let output = PortPlan::new(&cfg.output, next, cfg.width, cfg.height);
        let end = next + output.extent();

        let mut dev = SippDevice::new();
        ensure!(
            end as usize <= dev.mem().len(),
            "frame layout needs {} bytes of CMX, the arena holds {}",
            end,
            dev.mem().len()
        );
        check_plane_stride(&input, cfg.slice, "input")?;
        check_plane_stride(&output, cfg.slice, "output")?;
        if let Some(plan) = &reference {
            check_plane_stride(plan, cfg.slice, "reference")?;
        }

        let base = unit_base(cfg.filter.unit());
        dev.reg_write(SIPP_SLC_SIZE, cfg.slice.to_reg())?;
        dev.reg_write(base + unit::FRM_DIM, cfg.width | cfg.height << f::IMGDIM_SIZE)?;
        program_group(&mut dev, base + unit::IN_GRP, &input)?;
        program_group(&mut dev, base + unit::OUT_GRP, &output)?;
        if let Some(plan) = &reference {
            program_group(&mut dev, base + chroma_regs::REF_GRP, plan)?;
        }
        dev.reg_write(SIPP_INT2_ENABLE, 1 << cfg.filter.unit())?;

        let eof = Arc::new(AtomicU32::new(0));
        let count = eof.clone();
        dev.irq_mut().set_callback(Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
        }));

        debug!(
            "{}: input at {:#x}, output at {:#x}, {} bytes of CMX",
            cfg.filter, input.base, output.base, end
        );

        Ok(Self {
            dev,
            cfg,
            base,
            input,
            output,
            reference,
            eof,
        })
    }

    #[inline]
    pub fn config(&self) -> &RunnerConfig {
        &self.cfg
    }

    #[inline]
    pub fn device(&self) -> &SippDevice {
        &self.dev
    }

    #[inline]
    pub fn device_mut(&mut self) -> &mut SippDevice {
        &mut self.dev
    }

    /// End-of-frame interrupts delivered so far.
    pub fn eof_count(&self) -> u32 {
        self.eof.load(Ordering::SeqCst)
    }

    /// Write a unit-relative parameter register.
    pub fn write_param(&mut self, offset: u32, value: u32) -> Result<()> {
        self.dev.reg_write(self.base + offset, value)?;
        Ok(())
    }

    /// Read a unit-relative register.
    pub fn read_param(&self, offset: u32) -> u32 {
        self.dev.reg_read(self.base + offset)
    }

    /// Program the convolution coefficient registers from row-major taps.
    /// Accepts 9 taps (3x3) or 25 taps (5x5); a 3x3 kernel occupies the
    /// top-left of the coefficient grid.
    pub fn set_coefficients(&mut self, taps: &[f32]) -> Result<()> {
        ensure!(
            self.cfg.filter == FilterKind::Conv,
            "coefficients only apply to the convolution unit"
        );
        let k = match taps.len() {
            9 => 3,
            25 => 5,
            n => bail!("a kernel needs 9 or 25 taps, got {}", n),
        };
        let mut regs = [0u32; conv_regs::COEFF_COUNT];
        for (i, &tap) in taps.iter().enumerate() {
            let row = i / k;
            let col = i % k;
            let reg = 3 * row + col / 2;
            regs[reg] |= u32::from(f32_to_f16(tap)) << ((col % 2) * 16);
        }
        for (i, &value) in regs.iter().enumerate() {
            self.dev
                .reg_write(self.base + conv_regs::coeff_reg(i, false), value)?;
        }
        Ok(())
    }

    /// Push one frame through the filter and collect the produced frame.
    ///
    /// A streamed input is fed line by line through the fill-control
    /// registers; a resident input is loaded wholesale and kicked through
    /// the context start bit. The reference frame is required exactly when
    /// the runner was configured with a reference stream.
    pub fn run_frame(&mut self, input: &Frame, reference: Option<&Frame>) -> Result<Frame> {
        check_frame(input, &self.input, self.cfg.width, self.cfg.height, "input")?;
        match (self.reference, reference) {
            (Some(plan), Some(frame)) => {
                check_frame(frame, &plan, self.cfg.width, self.cfg.height, "reference")?
            }
            (None, None) => {}
            (Some(_), None) => bail!("the configured reference stream needs a reference frame"),
            (None, Some(_)) => bail!("a reference frame needs a configured reference stream"),
        }

        debug!(
            "{}: running a {}x{} frame",
            self.cfg.filter, self.cfg.width, self.cfg.height
        );
        let unit_bit = 1u32 << self.cfg.filter.unit();
        self.dev.reg_write(SIPP_CONTROL, unit_bit)?;

        let mut output = Frame::new(
            self.cfg.width,
            self.cfg.height,
            self.output.planes,
            self.output.format(),
        );
        if self.input.lines == 0 {
            self.run_resident(input, reference)?;
            self.read_region(self.output, &mut output)?;
        } else {
            self.run_streamed(input, reference, &mut output)?;
        }

        let status = self.dev.reg_read(SIPP_INT2_STATUS);
        if status & unit_bit == 0 {
            warn!("{}: no end-of-frame event latched", self.cfg.filter);
        } else {
            self.dev.reg_write(SIPP_INT2_CLEAR, unit_bit)?;
        }
        Ok(output)
    }

    /// Print the unit's observable register state to stdout.
    pub fn print_summary(&self) {
        println!("filter {} (unit {})", self.cfg.filter, self.cfg.filter.unit());
        println!("  enable mask    {:#05b}", self.dev.reg_read(SIPP_CONTROL));
        println!(
            "  input ctx      {:#010x}",
            self.dev.reg_read(self.base + unit::ICTX)
        );
        println!(
            "  output ctx     {:#010x}",
            self.dev.reg_read(self.base + unit::OCTX)
        );
        println!(
            "  fill levels    in={} out={}",
            self.dev.reg_read(self.base + unit::IN_FC),
            self.dev.reg_read(self.base + unit::OUT_FC)
        );
        println!(
            "  irq status     in={:#x} out={:#x} eof={:#x}",
            self.dev.reg_read(SIPP_INT0_STATUS),
            self.dev.reg_read(SIPP_INT1_STATUS),
            self.dev.reg_read(SIPP_INT2_STATUS)
        );
        println!("  eof callbacks  {}", self.eof_count());
    }

    // ------------------------------------------------------------------
    // Frame dispatch paths
    // ------------------------------------------------------------------

    fn run_resident(&mut self, input: &Frame, reference: Option<&Frame>) -> Result<()> {
        ensure!(
            self.output.lines == 0,
            "a resident input feed requires a resident output region"
        );
        if let Some(plan) = self.reference {
            ensure!(
                plan.lines == 0,
                "a resident input feed requires a resident reference region"
            );
        }

        let plan = self.input;
        self.write_region(plan, input)?;
        if let (Some(plan), Some(frame)) = (self.reference, reference) {
            self.write_region(plan, frame)?;
        }
        // Start payload alone: a non-wrapping input dispatches the whole
        // frame from the context register
        self.dev
            .reg_write(self.base + unit::ICTX, 1 << f::START_BIT)?;
        Ok(())
    }

    fn run_streamed(
        &mut self,
        input: &Frame,
        reference: Option<&Frame>,
        output: &mut Frame,
    ) -> Result<()> {
        let in_plan = self.input;
        let height = self.cfg.height;
        let mut consumed = 0u32;

        for y in 0..height {
            // Free window slots before checking for input room
            self.consume_ready(output, &mut consumed)?;
            let fill = self.dev.reg_read(self.base + unit::IN_FC);
            ensure!(
                fill < in_plan.lines,
                "input window full before line {} (fill {})",
                y,
                fill
            );

            let slot = y % in_plan.lines;
            for pl in 0..in_plan.planes {
                self.write_cmx_line(in_plan, pl, slot, input.line(pl, y))?;
            }

            if let (Some(plan), Some(frame)) = (self.reference, reference) {
                let slot = if plan.lines == 0 { y } else { y % plan.lines };
                for pl in 0..plan.planes {
                    self.write_cmx_line(plan, pl, slot, frame.line(pl, y))?;
                }
                // The reference fill only moves by absolute set; keep it in
                // lockstep with the input fill
                let ref_fill = self.dev.reg_read(self.base + chroma_regs::REF_FC);
                self.dev.reg_write(
                    self.base + chroma_regs::REF_FC,
                    (1 << f::CTXUP_BIT) | (ref_fill + 1),
                )?;
            }

            self.dev
                .reg_write(self.base + unit::IN_FC, 1 << f::INCDEC_BIT)?;
        }

        if self.output.lines == 0 {
            self.read_region(self.output, output)?;
        } else {
            while consumed < height {
                let before = consumed;
                self.consume_ready(output, &mut consumed)?;
                ensure!(
                    consumed > before,
                    "output stalled at line {} of {}",
                    consumed,
                    height
                );
            }
        }
        Ok(())
    }

    /// Read every buffered output line into the frame and release its slot.
    fn consume_ready(&mut self, output: &mut Frame, consumed: &mut u32) -> Result<()> {
        let plan = self.output;
        if plan.lines == 0 {
            return Ok(());
        }
        while self.dev.reg_read(self.base + unit::OUT_FC) > 0 {
            ensure!(
                *consumed < self.cfg.height,
                "device produced more lines than the frame holds"
            );
            let slot = *consumed % plan.lines;
            for pl in 0..plan.planes {
                self.read_cmx_line(plan, pl, slot, output.line_mut(pl, *consumed))?;
            }
            // Releasing the slot re-enters the drain
            self.dev
                .reg_write(self.base + unit::OUT_FC, 1 << f::INCDEC_BIT)?;
            *consumed += 1;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // CMX line transfer
    // ------------------------------------------------------------------

    fn write_region(&mut self, plan: PortPlan, frame: &Frame) -> Result<()> {
        for pl in 0..plan.planes {
            for y in 0..frame.height {
                self.write_cmx_line(plan, pl, y, frame.line(pl, y))?;
            }
        }
        Ok(())
    }

    fn read_region(&self, plan: PortPlan, frame: &mut Frame) -> Result<()> {
        for pl in 0..plan.planes {
            for y in 0..frame.height {
                self.read_cmx_line(plan, pl, y, frame.line_mut(pl, y))?;
            }
        }
        Ok(())
    }

    fn write_cmx_line(&mut self, plan: PortPlan, plane: u32, slot: u32, samples: &[u16]) -> Result<()> {
        let bytes = pack_samples(samples, plan.format());
        self.dev
            .mem_mut()
            .write_bytes(plan.line_addr(plane, slot), &bytes)?;
        Ok(())
    }

    fn read_cmx_line(&self, plan: PortPlan, plane: u32, slot: u32, out: &mut [u16]) -> Result<()> {
        let mut raw = vec![0u8; out.len() * plan.bytes as usize];
        self.dev
            .mem()
            .read_bytes(plan.line_addr(plane, slot), &mut raw)?;
        unpack_samples(&raw, plan.format(), out);
        Ok(())
    }
}

fn validate_port(port: &PortLayout, what: &str) -> Result<()> {
    ensure!(port.planes > 0, "{} port needs at least one plane", what);
    ensure!(
        port.planes <= f::CFG_PLANES_MASK + 1,
        "{} port supports at most {} planes, got {}",
        what,
        f::CFG_PLANES_MASK + 1,
        port.planes
    );
    ensure!(
        port.bytes == 1 || port.bytes == 2,
        "{} port moves 1 or 2 bytes per pixel, got {}",
        what,
        port.bytes
    );
    ensure!(
        port.lines <= f::NL_MASK,
        "{} window depth {} exceeds the line-count field",
        what,
        port.lines
    );
    if port.lines > 0 {
        ensure!(
            port.start_level <= port.lines,
            "{} start level {} exceeds the window depth {}",
            what,
            port.start_level,
            port.lines
        );
    }
    Ok(())
}

/// Plane addressing folds the plane stride into one CMX slice; a stride past
/// the slice size would alias other planes.
fn check_plane_stride(plan: &PortPlan, slice: SliceGeometry, what: &str) -> Result<()> {
    if plan.planes > 1 {
        ensure!(
            plan.plane_stride < slice.size,
            "{} plane stride {} must stay inside one {} byte slice",
            what,
            plan.plane_stride,
            slice.size
        );
    }
    Ok(())
}

fn program_group(dev: &mut SippDevice, grp: u32, plan: &PortPlan) -> Result<()> {
    dev.reg_write(grp + unit::GRP_BASE, plan.base)?;
    dev.reg_write(grp + unit::GRP_CFG, plan.cfg_value())?;
    dev.reg_write(grp + unit::GRP_LS, plan.line_stride)?;
    dev.reg_write(grp + unit::GRP_PS, plan.plane_stride)?;
    dev.reg_write(grp + unit::GRP_IR, plan.start_level)?;
    Ok(())
}

fn check_frame(frame: &Frame, plan: &PortPlan, width: u32, height: u32, what: &str) -> Result<()> {
    ensure!(
        frame.width == width && frame.height == height,
        "{} frame is {}x{}, the runner is configured for {}x{}",
        what,
        frame.width,
        frame.height,
        width,
        height
    );
    ensure!(
        frame.planes == plan.planes,
        "{} frame has {} planes, the port is configured for {}",
        what,
        frame.planes,
        plan.planes
    );
    ensure!(
        frame.format.bytes() as u32 == plan.bytes,
        "{} frame stores {} byte samples, the port moves {}",
        what,
        frame.format.bytes(),
        plan.bytes
    );
    Ok(())
}

fn pack_samples(samples: &[u16], format: SampleFormat) -> Vec<u8> {
    match format {
        SampleFormat::U8 => samples.iter().map(|&s| s as u8).collect(),
        SampleFormat::U16 => {
            let mut out = Vec::with_capacity(samples.len() * 2);
            for &s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
            out
        }
    }
}

fn unpack_samples(bytes: &[u8], format: SampleFormat, out: &mut [u16]) {
    match format {
        SampleFormat::U8 => {
            for (dst, &b) in out.iter_mut().zip(bytes) {
                *dst = u16::from(b);
            }
        }
        SampleFormat::U16 => {
            for (dst, pair) in out.iter_mut().zip(bytes.chunks_exact(2)) {
                *dst = u16::from_le_bytes([pair[0], pair[1]]);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sipp_spec::dbyr_regs;

    const IDENTITY_3X3: [f32; 9] = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];

    /// Integer ramp encoded as fp16 bit patterns. Values stay below 2048 so
    /// the fp16 round trip is exact.
    fn f16_gradient(width: u32, height: u32) -> Frame {
        let mut frame = Frame::new(width, height, 1, SampleFormat::U16);
        for y in 0..height {
            for x in 0..width {
                let v = (y * width + x) % 1024;
                frame.set_sample(0, y, x, f32_to_f16(v as f32));
            }
        }
        frame
    }

    fn flat(width: u32, height: u32, planes: u32, format: SampleFormat, value: u16) -> Frame {
        let mut frame = Frame::new(width, height, planes, format);
        frame.data.fill(value);
        frame
    }

    fn conv_identity_runner(input: PortLayout, output: PortLayout) -> FrameRunner {
        let cfg = RunnerConfig {
            filter: FilterKind::Conv,
            width: 8,
            height: 6,
            input,
            output,
            reference: None,
            slice: Default::default(),
        };
        let mut runner = FrameRunner::new(cfg).unwrap();
        runner.write_param(conv_regs::CFG, 3).unwrap();
        runner.set_coefficients(&IDENTITY_3X3).unwrap();
        runner
    }

    #[test]
    fn test_resident_conv_identity() {
        let mut runner =
            conv_identity_runner(PortLayout::resident(1, 2), PortLayout::resident(1, 2));
        let input = f16_gradient(8, 6);
        let output = runner.run_frame(&input, None).unwrap();
        assert_eq!(output.data, input.data);
        assert_eq!(runner.eof_count(), 1);
    }

    #[test]
    fn test_streamed_conv_identity_with_start_level() {
        let mut input_layout = PortLayout::streamed(4, 1, 2);
        input_layout.start_level = 3;
        let mut runner = conv_identity_runner(input_layout, PortLayout::streamed(2, 1, 2));
        let input = f16_gradient(8, 6);
        let output = runner.run_frame(&input, None).unwrap();
        assert_eq!(output.data, input.data);
        assert_eq!(runner.eof_count(), 1);
    }

    #[test]
    fn test_streamed_input_resident_output() {
        let mut runner =
            conv_identity_runner(PortLayout::streamed(4, 1, 2), PortLayout::resident(1, 2));
        let input = f16_gradient(8, 6);
        let output = runner.run_frame(&input, None).unwrap();
        assert_eq!(output.data, input.data);
    }

    #[test]
    fn test_chroma_flat_field_passthrough() {
        let cfg = RunnerConfig {
            filter: FilterKind::Chroma,
            width: 6,
            height: 4,
            input: PortLayout::streamed(4, 2, 1),
            output: PortLayout::streamed(2, 2, 1),
            reference: None,
            slice: Default::default(),
        };
        let mut runner = FrameRunner::new(cfg).unwrap();
        // Limiter wide open, no horizontal passes
        runner.write_param(chroma_regs::CFG, 0xFF0).unwrap();
        runner.write_param(chroma_regs::THRESH, 0x00C8_0001).unwrap();

        let input = flat(6, 4, 2, SampleFormat::U8, 40);
        let output = runner.run_frame(&input, None).unwrap();
        assert_eq!(output.data, input.data);
        assert_eq!(runner.eof_count(), 1);
    }

    #[test]
    fn test_chroma_reference_stream_flat_field() {
        let cfg = RunnerConfig {
            filter: FilterKind::Chroma,
            width: 6,
            height: 4,
            input: PortLayout::streamed(4, 1, 1),
            output: PortLayout::streamed(2, 1, 1),
            reference: Some(PortLayout::streamed(4, 1, 1)),
            slice: Default::default(),
        };
        let mut runner = FrameRunner::new(cfg).unwrap();
        runner.write_param(chroma_regs::CFG, 0xFF8).unwrap();
        runner.write_param(chroma_regs::THRESH, 0x00C8_0001).unwrap();

        let input = flat(6, 4, 1, SampleFormat::U8, 80);
        let reference = flat(6, 4, 1, SampleFormat::U8, 80);
        let output = runner.run_frame(&input, Some(&reference)).unwrap();
        assert_eq!(output.data, input.data);
        assert_eq!(runner.eof_count(), 1);
    }

    #[test]
    fn test_debayer_flat_field_fanout() {
        let cfg = RunnerConfig {
            filter: FilterKind::Debayer,
            width: 12,
            height: 12,
            input: PortLayout::resident(1, 1),
            output: PortLayout::resident(3, 1),
            reference: None,
            slice: Default::default(),
        };
        let mut runner = FrameRunner::new(cfg).unwrap();
        // 8-bit in and out, three output planes per input plane
        runner.write_param(dbyr_regs::CFG, 0x10770).unwrap();

        let input = flat(12, 12, 1, SampleFormat::U8, 64);
        let output = runner.run_frame(&input, None).unwrap();
        assert_eq!(output.planes, 3);
        assert!(output.data.iter().all(|&s| s == 64));
        assert_eq!(runner.eof_count(), 1);
    }

    #[test]
    fn test_resident_input_requires_resident_output() {
        let mut runner =
            conv_identity_runner(PortLayout::resident(1, 2), PortLayout::streamed(2, 1, 2));
        let input = f16_gradient(8, 6);
        assert!(runner.run_frame(&input, None).is_err());
    }

    #[test]
    fn test_frame_geometry_must_match_config() {
        let mut runner =
            conv_identity_runner(PortLayout::resident(1, 2), PortLayout::resident(1, 2));
        let input = f16_gradient(4, 4);
        assert!(runner.run_frame(&input, None).is_err());
    }

    #[test]
    fn test_layout_must_fit_cmx() {
        let cfg = RunnerConfig {
            filter: FilterKind::Conv,
            width: 0x4000,
            height: 100,
            input: PortLayout::resident(1, 2),
            output: PortLayout::resident(1, 2),
            reference: None,
            slice: Default::default(),
        };
        assert!(FrameRunner::new(cfg).is_err());
    }

    #[test]
    fn test_reference_only_on_chroma() {
        let cfg = RunnerConfig {
            filter: FilterKind::Conv,
            width: 8,
            height: 6,
            input: PortLayout::streamed(4, 1, 2),
            output: PortLayout::streamed(2, 1, 2),
            reference: Some(PortLayout::streamed(4, 1, 2)),
            slice: Default::default(),
        };
        assert!(FrameRunner::new(cfg).is_err());
    }

    #[test]
    fn test_filter_names() {
        assert_eq!(FilterKind::from_name("conv"), Some(FilterKind::Conv));
        assert_eq!(FilterKind::from_name("cdn"), Some(FilterKind::Chroma));
        assert_eq!(FilterKind::from_name("debayer"), Some(FilterKind::Debayer));
        assert_eq!(FilterKind::from_name("warp"), None);
        assert_eq!(FilterKind::Debayer.to_string(), "dbyr");
    }
}
