//! Register file front-end for the SIPP block.
//!
//! [`SippDevice`] owns the complete device: the CMX arena, the three filter
//! units, the interrupt controller and the global configuration state. All
//! software interaction goes through 32-bit accesses. A write decodes the
//! address, routes the value to the owning register and runs any drain the
//! access triggers, then delivers the deferred interrupt callback.
//!
//! The address map lives in [`sipp_spec`]: one global block at 0x000 and one
//! 256-byte block per unit. Within a unit block everything below
//! [`unit::PARAMS`] is laid out identically for every filter; the parameter
//! region above it decodes per unit.

use log::{trace, warn};

use crate::device::buffer::{Bank, LineBuffer};
use crate::device::filter::FilterUnit;
use crate::device::filters::{ChromaDenoise, Convolution, Debayer};
use crate::device::irq::InterruptController;
use crate::device::memory::{CmxMemory, SliceGeometry};
use crate::device::sipp_spec::{
    self, chroma_regs, conv_regs, dbyr_regs, fields as f, unit, SIPP_CONTROL, SIPP_INT0_CLEAR,
    SIPP_INT0_ENABLE, SIPP_INT0_STATUS, SIPP_INT1_CLEAR, SIPP_INT1_ENABLE, SIPP_INT1_STATUS,
    SIPP_INT2_CLEAR, SIPP_INT2_ENABLE, SIPP_INT2_STATUS, SIPP_SHADOW_SELECT, SIPP_SLC_SIZE,
    SIPP_SOFTRST, SIPP_START, SIPP_STATUS, UNIT_CHROMA, UNIT_CONV, UNIT_COUNT,
};
use crate::device::DeviceError;

// ============================================================================
// Device
// ============================================================================

/// The SIPP device model: CMX memory, the filter units, the interrupt
/// controller and the register bus tying them together.
///
/// Accesses with side effects (fill-control pulses, context starts, the
/// global start mask) run their drains synchronously inside the access, so
/// [`SippDevice::reg_write`] surfaces any streaming error the drain hits.
/// Unmapped addresses are ignored with a warning and read as zero.
#[derive(Debug)]
pub struct SippDevice {
    mem: CmxMemory,
    slice: SliceGeometry,
    irq: InterruptController,
    chroma: ChromaDenoise,
    conv: Convolution,
    dbyr: Debayer,
    /// Active parameter bank per unit, from the shadow-select register
    banks: [Bank; UNIT_COUNT],
}

impl SippDevice {
    pub fn new() -> Self {
        Self {
            mem: CmxMemory::new(),
            slice: SliceGeometry::default(),
            irq: InterruptController::new(),
            chroma: ChromaDenoise::new(),
            conv: Convolution::new(),
            dbyr: Debayer::new(),
            banks: [Bank::Default; UNIT_COUNT],
        }
    }

    /// CMX arena backing every line buffer.
    pub fn mem(&self) -> &CmxMemory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut CmxMemory {
        &mut self.mem
    }

    /// Interrupt controller, for callback registration and inspection.
    pub fn irq(&self) -> &InterruptController {
        &self.irq
    }

    pub fn irq_mut(&mut self) -> &mut InterruptController {
        &mut self.irq
    }

    // ------------------------------------------------------------------
    // Unit dispatch
    // ------------------------------------------------------------------

    /// Shared view of one filter unit.
    fn filter(&self, unit: usize) -> &dyn FilterUnit {
        match unit {
            UNIT_CHROMA => &self.chroma,
            UNIT_CONV => &self.conv,
            _ => &self.dbyr,
        }
    }

    /// Exclusive view of one filter unit.
    fn filter_mut(&mut self, unit: usize) -> &mut dyn FilterUnit {
        match unit {
            UNIT_CHROMA => &mut self.chroma,
            UNIT_CONV => &mut self.conv,
            _ => &mut self.dbyr,
        }
    }

    /// Run the non-blocking drain loop of `unit` against the shared
    /// streaming state.
    fn try_run_unit(&mut self, unit: usize) -> Result<(), DeviceError> {
        let Self {
            mem,
            slice,
            irq,
            chroma,
            conv,
            dbyr,
            banks,
        } = self;
        let filter: &mut dyn FilterUnit = match unit {
            UNIT_CHROMA => chroma,
            UNIT_CONV => conv,
            _ => dbyr,
        };
        filter.try_run(mem, irq, *slice, banks[unit])
    }

    /// Dispatch one blocking line on `unit`.
    fn start_unit(&mut self, unit: usize) -> Result<(), DeviceError> {
        let Self {
            mem,
            slice,
            irq,
            chroma,
            conv,
            dbyr,
            banks,
        } = self;
        let filter: &mut dyn FilterUnit = match unit {
            UNIT_CHROMA => chroma,
            UNIT_CONV => conv,
            _ => dbyr,
        };
        filter.set_up_and_run(mem, irq, *slice, banks[unit])
    }

    // ------------------------------------------------------------------
    // Register writes
    // ------------------------------------------------------------------

    /// Write one 32-bit register. Streaming errors from a triggered drain
    /// propagate to the caller; the deferred interrupt callback is delivered
    /// either way.
    pub fn reg_write(&mut self, addr: u32, value: u32) -> Result<(), DeviceError> {
        trace!("reg write {addr:#05x} <- {value:#010x}");
        let result = match sipp_spec::split_unit_addr(addr) {
            Some((unit, offset)) => self.write_unit(unit, offset, value),
            None => self.write_global(addr, value),
        };
        // Once per access, after any drain the access triggered
        self.irq.dispatch_pending();
        result
    }

    fn write_global(&mut self, addr: u32, value: u32) -> Result<(), DeviceError> {
        match addr {
            SIPP_CONTROL => {
                for u in 0..UNIT_COUNT {
                    if value & (1 << u) != 0 {
                        self.filter_mut(u).core_mut().enable();
                    }
                }
            }
            SIPP_START => {
                // The start payload rides in the top bit next to the unit mask
                let start = value >> f::START_BIT != 0;
                for u in 0..UNIT_COUNT {
                    if value & (1 << u) != 0 {
                        self.filter_mut(u).core_mut().in_buf.set_start_bit(start);
                        self.start_unit(u)?;
                    }
                }
            }
            SIPP_INT0_STATUS | SIPP_INT1_STATUS | SIPP_INT2_STATUS => {} // read-only
            SIPP_INT0_ENABLE => self.irq.set_enable(0, value),
            SIPP_INT1_ENABLE => self.irq.set_enable(1, value),
            SIPP_INT2_ENABLE => self.irq.set_enable(2, value),
            SIPP_INT0_CLEAR => self.irq.clr_status(0, value),
            SIPP_INT1_CLEAR => self.irq.clr_status(1, value),
            SIPP_INT2_CLEAR => self.irq.clr_status(2, value),
            SIPP_SLC_SIZE => self.slice = SliceGeometry::from_reg(value),
            SIPP_SHADOW_SELECT => {
                for u in 0..UNIT_COUNT {
                    self.banks[u] = Bank::from_bit(value & (1 << u) != 0);
                }
            }
            SIPP_SOFTRST | SIPP_STATUS => {}
            _ => warn!("write to unmapped register {addr:#05x}"),
        }
        Ok(())
    }

    /// Route a write within a unit's register block.
    fn write_unit(&mut self, unit: usize, offset: u32, value: u32) -> Result<(), DeviceError> {
        match offset {
            o if o < unit::OUT_GRP => {
                let buf = &mut self.filter_mut(unit).core_mut().in_buf;
                write_group_reg(buf, o - unit::IN_GRP, value);
            }
            o if o < unit::IN_FC => {
                let buf = &mut self.filter_mut(unit).core_mut().out_buf;
                write_group_reg(buf, o - unit::OUT_GRP, value);
            }
            unit::IN_FC => {
                if value & (1 << f::INCDEC_BIT) != 0 {
                    self.filter_mut(unit).inc_input_fill()?;
                    self.try_run_unit(unit)?;
                }
                if value & (1 << f::CTXUP_BIT) != 0 {
                    let buf = &mut self.filter_mut(unit).core_mut().in_buf;
                    buf.set_fill_level(value & f::NL_MASK);
                }
            }
            unit::OUT_FC => {
                if value & (1 << f::INCDEC_BIT) != 0 {
                    self.filter_mut(unit).core_mut().out_buf.dec_fill_level()?;
                    self.try_run_unit(unit)?;
                }
                if value & (1 << f::CTXUP_BIT) != 0 {
                    let buf = &mut self.filter_mut(unit).core_mut().out_buf;
                    buf.set_fill_level(value & f::NL_MASK);
                }
            }
            unit::ICTX => self.write_input_context(unit, value)?,
            unit::OCTX => self.write_output_context(unit, value),
            unit::FRM_DIM => self
                .filter_mut(unit)
                .core_mut()
                .set_frm_dim(value, Bank::Default),
            unit::FRM_DIM_SHADOW => self
                .filter_mut(unit)
                .core_mut()
                .set_frm_dim(value, Bank::Shadow),
            _ => match unit {
                UNIT_CHROMA => self.write_chroma_param(offset, value),
                UNIT_CONV => self.write_conv_param(offset, value),
                _ => self.write_dbyr_param(offset, value),
            },
        }
        Ok(())
    }

    fn write_input_context(&mut self, unit: usize, value: u32) -> Result<(), DeviceError> {
        let bank = self.banks[unit];
        let core = self.filter_mut(unit).core_mut();
        let lines = core.in_buf.cfg(bank) & f::CFG_LINES_MASK;
        let height = core.frm_dim(bank) >> f::IMGDIM_SIZE;
        if value & (1 << f::CTXUP_BIT) != 0 {
            core.set_line_idx(value & f::IMGDIM_MASK);
            restore_buffer_idx(&mut core.in_buf, value, lines, height);
        }
        if value & (1 << f::START_BIT) != 0 {
            core.in_buf.set_start_bit(true);
            // A non-wrapping stream drains through the fill gate; a circular
            // restore dispatches a single line
            if lines == 0 {
                self.try_run_unit(unit)?;
            } else {
                self.start_unit(unit)?;
            }
        }
        Ok(())
    }

    fn write_output_context(&mut self, unit: usize, value: u32) {
        if value & (1 << f::CTXUP_BIT) == 0 {
            return;
        }
        let bank = self.banks[unit];
        let core = self.filter_mut(unit).core_mut();
        let lines = core.out_buf.cfg(bank) & f::CFG_LINES_MASK;
        let height = core.frm_dim(bank) >> f::IMGDIM_SIZE;
        core.set_out_line_idx(value & f::IMGDIM_MASK);
        restore_buffer_idx(&mut core.out_buf, value, lines, height);
    }

    fn write_chroma_param(&mut self, offset: u32, value: u32) {
        match offset {
            chroma_regs::CFG => self.chroma.set_cfg(value, Bank::Default),
            chroma_regs::CFG_SHADOW => self.chroma.set_cfg(value, Bank::Shadow),
            chroma_regs::THRESH => self.chroma.set_thresh(value, Bank::Default),
            chroma_regs::THRESH_SHADOW => self.chroma.set_thresh(value, Bank::Shadow),
            chroma_regs::THRESH2 => self.chroma.set_thresh2(value, Bank::Default),
            chroma_regs::THRESH2_SHADOW => self.chroma.set_thresh2(value, Bank::Shadow),
            o if o >= chroma_regs::REF_GRP && o < chroma_regs::REF_GRP + unit::GRP_SIZE => {
                write_group_reg(&mut self.chroma.ref_buf, o - chroma_regs::REF_GRP, value);
            }
            chroma_regs::REF_FC => {
                // The reference fill advances with the input fill; only the
                // absolute set is wired here
                if value & (1 << f::CTXUP_BIT) != 0 {
                    self.chroma.ref_buf.set_fill_level(value & f::NL_MASK);
                }
            }
            chroma_regs::REF_ICTX => {
                if value & (1 << f::CTXUP_BIT) != 0 {
                    let bank = self.banks[UNIT_CHROMA];
                    let lines = self.chroma.ref_buf.cfg(bank) & f::CFG_LINES_MASK;
                    let height = self.chroma.core().frm_dim(bank) >> f::IMGDIM_SIZE;
                    restore_buffer_idx(&mut self.chroma.ref_buf, value, lines, height);
                }
            }
            _ => warn!("cdn: write to unmapped offset {offset:#04x}"),
        }
    }

    fn write_conv_param(&mut self, offset: u32, value: u32) {
        match offset {
            conv_regs::CFG => self.conv.set_cfg(value, Bank::Default),
            conv_regs::CFG_SHADOW => self.conv.set_cfg(value, Bank::Shadow),
            conv_regs::ACCUM | conv_regs::ACCUM_CNT => {} // read-only
            o if o >= conv_regs::COEFF_BASE && o < conv_regs::COEFF_SHADOW_BASE => {
                let idx = ((o - conv_regs::COEFF_BASE) / 4) as usize;
                self.conv.set_coeff(idx, value, Bank::Default);
            }
            o if o >= conv_regs::COEFF_SHADOW_BASE
                && o < conv_regs::COEFF_SHADOW_BASE + 4 * conv_regs::COEFF_COUNT as u32 =>
            {
                let idx = ((o - conv_regs::COEFF_SHADOW_BASE) / 4) as usize;
                self.conv.set_coeff(idx, value, Bank::Shadow);
            }
            _ => warn!("conv: write to unmapped offset {offset:#04x}"),
        }
    }

    fn write_dbyr_param(&mut self, offset: u32, value: u32) {
        match offset {
            dbyr_regs::CFG => self.dbyr.set_cfg(value, Bank::Default),
            dbyr_regs::CFG_SHADOW => self.dbyr.set_cfg(value, Bank::Shadow),
            dbyr_regs::THRESH => self.dbyr.set_thresh(value, Bank::Default),
            dbyr_regs::THRESH_SHADOW => self.dbyr.set_thresh(value, Bank::Shadow),
            dbyr_regs::DEWORM => self.dbyr.set_deworm(value, Bank::Default),
            dbyr_regs::DEWORM_SHADOW => self.dbyr.set_deworm(value, Bank::Shadow),
            _ => warn!("dbyr: write to unmapped offset {offset:#04x}"),
        }
    }

    // ------------------------------------------------------------------
    // Register reads
    // ------------------------------------------------------------------

    /// Read one 32-bit register. Unmapped and write-only addresses read
    /// zero.
    pub fn reg_read(&self, addr: u32) -> u32 {
        let data = match sipp_spec::split_unit_addr(addr) {
            Some((unit, offset)) => self.read_unit(unit, offset),
            None => self.read_global(addr),
        };
        trace!("reg read {addr:#05x} -> {data:#010x}");
        data
    }

    fn read_global(&self, addr: u32) -> u32 {
        match addr {
            SIPP_CONTROL => {
                let mut data = 0u32;
                for u in 0..UNIT_COUNT {
                    if self.filter(u).core().is_enabled() {
                        data |= 1 << u;
                    }
                }
                data
            }
            SIPP_INT0_STATUS => self.irq.status(0),
            SIPP_INT1_STATUS => self.irq.status(1),
            SIPP_INT2_STATUS => self.irq.status(2),
            SIPP_INT0_ENABLE => self.irq.enable(0),
            SIPP_INT1_ENABLE => self.irq.enable(1),
            SIPP_INT2_ENABLE => self.irq.enable(2),
            SIPP_SLC_SIZE => self.slice.to_reg(),
            SIPP_SHADOW_SELECT => {
                let mut data = 0u32;
                for (u, bank) in self.banks.iter().enumerate() {
                    if *bank == Bank::Shadow {
                        data |= 1 << u;
                    }
                }
                data
            }
            SIPP_START | SIPP_INT0_CLEAR | SIPP_INT1_CLEAR | SIPP_INT2_CLEAR => 0, // write-only
            SIPP_SOFTRST | SIPP_STATUS => 0,
            _ => {
                warn!("read from unmapped register {addr:#05x}");
                0
            }
        }
    }

    fn read_unit(&self, unit: usize, offset: u32) -> u32 {
        let bank = self.banks[unit];
        let core = self.filter(unit).core();
        match offset {
            o if o < unit::OUT_GRP => read_group_reg(&core.in_buf, o - unit::IN_GRP),
            o if o < unit::IN_FC => read_group_reg(&core.out_buf, o - unit::OUT_GRP),
            unit::IN_FC => core.in_buf.fill_level(),
            unit::OUT_FC => core.out_buf.fill_level(),
            unit::ICTX => {
                let lines = core.in_buf.cfg(bank) & f::CFG_LINES_MASK;
                let height = core.frm_dim(bank) >> f::IMGDIM_SIZE;
                context_reg(&core.in_buf, core.line_idx(), lines, height)
            }
            unit::OCTX => {
                let lines = core.out_buf.cfg(bank) & f::CFG_LINES_MASK;
                let height = core.frm_dim(bank) >> f::IMGDIM_SIZE;
                context_reg(&core.out_buf, core.out_line_idx(), lines, height)
            }
            unit::FRM_DIM => core.frm_dim(Bank::Default),
            unit::FRM_DIM_SHADOW => core.frm_dim(Bank::Shadow),
            _ => match unit {
                UNIT_CHROMA => self.read_chroma_param(offset),
                UNIT_CONV => self.read_conv_param(offset),
                _ => self.read_dbyr_param(offset),
            },
        }
    }

    fn read_chroma_param(&self, offset: u32) -> u32 {
        match offset {
            chroma_regs::CFG => self.chroma.cfg(Bank::Default),
            chroma_regs::CFG_SHADOW => self.chroma.cfg(Bank::Shadow),
            chroma_regs::THRESH => self.chroma.thresh(Bank::Default),
            chroma_regs::THRESH_SHADOW => self.chroma.thresh(Bank::Shadow),
            chroma_regs::THRESH2 => self.chroma.thresh2(Bank::Default),
            chroma_regs::THRESH2_SHADOW => self.chroma.thresh2(Bank::Shadow),
            o if o >= chroma_regs::REF_GRP && o < chroma_regs::REF_GRP + unit::GRP_SIZE => {
                read_group_reg(&self.chroma.ref_buf, o - chroma_regs::REF_GRP)
            }
            chroma_regs::REF_FC => self.chroma.ref_buf.fill_level(),
            chroma_regs::REF_ICTX => {
                let bank = self.banks[UNIT_CHROMA];
                let lines = self.chroma.ref_buf.cfg(bank) & f::CFG_LINES_MASK;
                let height = self.chroma.core().frm_dim(bank) >> f::IMGDIM_SIZE;
                context_reg(&self.chroma.ref_buf, 0, lines, height)
            }
            _ => {
                warn!("cdn: read from unmapped offset {offset:#04x}");
                0
            }
        }
    }

    fn read_conv_param(&self, offset: u32) -> u32 {
        match offset {
            conv_regs::CFG => self.conv.cfg(Bank::Default),
            conv_regs::CFG_SHADOW => self.conv.cfg(Bank::Shadow),
            conv_regs::ACCUM => self.conv.accum_sum(),
            conv_regs::ACCUM_CNT => self.conv.accum_count(),
            o if o >= conv_regs::COEFF_BASE && o < conv_regs::COEFF_SHADOW_BASE => {
                let idx = ((o - conv_regs::COEFF_BASE) / 4) as usize;
                self.conv.coeff(idx, Bank::Default)
            }
            o if o >= conv_regs::COEFF_SHADOW_BASE
                && o < conv_regs::COEFF_SHADOW_BASE + 4 * conv_regs::COEFF_COUNT as u32 =>
            {
                let idx = ((o - conv_regs::COEFF_SHADOW_BASE) / 4) as usize;
                self.conv.coeff(idx, Bank::Shadow)
            }
            _ => {
                warn!("conv: read from unmapped offset {offset:#04x}");
                0
            }
        }
    }

    fn read_dbyr_param(&self, offset: u32) -> u32 {
        match offset {
            dbyr_regs::CFG => self.dbyr.cfg(Bank::Default),
            dbyr_regs::CFG_SHADOW => self.dbyr.cfg(Bank::Shadow),
            dbyr_regs::THRESH => self.dbyr.thresh(Bank::Default),
            dbyr_regs::THRESH_SHADOW => self.dbyr.thresh(Bank::Shadow),
            dbyr_regs::DEWORM => self.dbyr.deworm(Bank::Default),
            dbyr_regs::DEWORM_SHADOW => self.dbyr.deworm(Bank::Shadow),
            _ => {
                warn!("dbyr: read from unmapped offset {offset:#04x}");
                0
            }
        }
    }
}

impl Default for SippDevice {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Port group routing
// ============================================================================

/// Route one write within a port's register group (five registers plus
/// their shadow twins).
fn write_group_reg(buf: &mut LineBuffer, rel: u32, value: u32) {
    let (reg, bank) = if rel >= unit::GRP_SHADOW {
        (rel - unit::GRP_SHADOW, Bank::Shadow)
    } else {
        (rel, Bank::Default)
    };
    match reg {
        unit::GRP_BASE => buf.set_base(value, bank),
        unit::GRP_CFG => buf.set_cfg(value, bank),
        unit::GRP_LS => buf.set_line_stride(value, bank),
        unit::GRP_PS => buf.set_plane_stride(value, bank),
        unit::GRP_IR => buf.set_irq_cfg(value, bank),
        _ => warn!(
            "{} port: write to misaligned group offset {rel:#04x}",
            buf.port()
        ),
    }
}

fn read_group_reg(buf: &LineBuffer, rel: u32) -> u32 {
    let (reg, bank) = if rel >= unit::GRP_SHADOW {
        (rel - unit::GRP_SHADOW, Bank::Shadow)
    } else {
        (rel, Bank::Default)
    };
    match reg {
        unit::GRP_BASE => buf.base(bank),
        unit::GRP_CFG => buf.cfg(bank),
        unit::GRP_LS => buf.line_stride(bank),
        unit::GRP_PS => buf.plane_stride(bank),
        unit::GRP_IR => buf.irq_cfg(bank),
        _ => 0,
    }
}

/// Restore a buffer index from a context-register write. Wrap by the
/// as-programmed depth; the latched geometry may still describe the
/// previous context.
fn restore_buffer_idx(buf: &mut LineBuffer, value: u32, lines: u32, height: u32) {
    let idx = (value >> f::CBL_OFFSET) & f::NL_MASK;
    let modulus = if lines == 0 { height } else { lines };
    buf.set_buffer_idx_no_wrap(idx, modulus);
}

/// Assemble a context register: line index in the low half, buffer index in
/// the CBL field. Non-wrapping buffers report their index reduced modulo
/// the frame height.
fn context_reg(buf: &LineBuffer, line_idx: u32, lines: u32, height: u32) -> u32 {
    let idx = if lines == 0 {
        buf.buffer_idx_no_wrap(height)
    } else {
        buf.buffer_idx()
    };
    (line_idx & f::IMGDIM_MASK) | (idx << f::CBL_OFFSET)
}

// ============================================================================
// Tests
// ============================================================================
