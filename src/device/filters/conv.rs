//! Programmable convolution filter unit.
//!
//! Convolves half-precision pixel data with a programmable 3x3 or 5x5
//! coefficient matrix. All arithmetic runs in 32-bit float on values widened
//! from half precision; partial sums pair up in a fixed order so results
//! reproduce the hardware's rounding bit for bit. The per-pixel result can
//! optionally be absolute-valued, squared, accumulated into a per-frame
//! sum/count when it exceeds a threshold, and clamped to [0, 1] before being
//! narrowed back to half precision and written out.
//!
//! With output disabled the unit runs as a pure statistics engine: pixels
//! are consumed and accumulated but no output line is produced and the
//! output buffer does not advance.
//!
//! The frame accumulator latches into read-only registers at end of frame
//! and resets, so software always reads the totals of the last complete
//! frame while the next one accumulates.

use log::debug;

use crate::device::buffer::{Bank, Port};
use crate::device::filter::{alloc_rows, FilterCore, FilterUnit};
use crate::device::irq::InterruptController;
use crate::device::memory::{CmxMemory, SliceGeometry};
use crate::device::sipp_spec::{conv, conv_regs, UNIT_CONV};
use crate::device::DeviceError;

// ============================================================================
// Half-precision conversion
// ============================================================================

/// Widen an IEEE binary16 bit pattern to f32.
#[inline]
pub fn f16_to_f32(bits: u16) -> f32 {
    let sign = (bits as u32 >> 15) << 31;
    let exp = (bits >> 10) & 0x1F;
    let frac = (bits & 0x3FF) as u32;

    let word = match (exp, frac) {
        (0, 0) => sign,
        (0, _) => {
            // Subnormal: renormalize into an f32 normal
            let mut exp32 = 113u32;
            let mut frac32 = frac;
            while frac32 & 0x400 == 0 {
                frac32 <<= 1;
                exp32 -= 1;
            }
            sign | (exp32 << 23) | ((frac32 & 0x3FF) << 13)
        }
        (0x1F, 0) => sign | 0x7F80_0000,
        (0x1F, _) => sign | 0x7FC0_0000 | (frac << 13),
        _ => sign | ((exp as u32 + 112) << 23) | (frac << 13),
    };
    f32::from_bits(word)
}

/// Narrow an f32 to an IEEE binary16 bit pattern, round to nearest even.
#[inline]
pub fn f32_to_f16(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let frac = bits & 0x7F_FFFF;

    if exp == 0xFF {
        // Inf and NaN, NaN payload truncated but kept quiet
        return if frac != 0 {
            sign | 0x7E00 | ((frac >> 13) as u16 & 0x1FF)
        } else {
            sign | 0x7C00
        };
    }

    let unbiased = exp - 127;
    if unbiased > 15 {
        return sign | 0x7C00;
    }
    if unbiased >= -14 {
        let exp16 = (unbiased + 15) as u32;
        let mut mant = frac >> 13;
        let rem = frac & 0x1FFF;
        if rem > 0x1000 || (rem == 0x1000 && mant & 1 != 0) {
            mant += 1;
        }
        // A mantissa carry bumps the exponent, overflowing to infinity
        return sign | ((exp16 << 10) + mant) as u16;
    }
    if unbiased >= -25 {
        // Subnormal result
        let drop = (13 - 14 - unbiased) as u32;
        let mant32 = 0x80_0000 | frac;
        let mut mant = mant32 >> drop;
        let rem = mant32 & ((1 << drop) - 1);
        let half = 1u32 << (drop - 1);
        if rem > half || (rem == half && mant & 1 != 0) {
            mant += 1;
        }
        return sign | mant as u16;
    }
    sign
}

// ============================================================================
// Convolution math
// ============================================================================

/// Sum partial products pairing leftward: ((v0+v1) + (v2+v3)) + v4 for five
/// values, (v0+v1) + v2 for three.
#[inline]
fn chunk_sum(vals: &[f32]) -> f32 {
    match vals.len() {
        3 => (vals[0] + vals[1]) + vals[2],
        5 => ((vals[0] + vals[1]) + (vals[2] + vals[3])) + vals[4],
        _ => vals.iter().sum(),
    }
}

/// Horizontal tap with edge replication.
#[inline]
fn clamp_tap(line: &[f32], x: i64) -> f32 {
    line[x.clamp(0, line.len() as i64 - 1) as usize]
}

/// Convolve one pixel: per-row tap products summed in chunk order, row
/// results combined the same way. The coefficient array is 5-wide row-major;
/// a 3x3 kernel uses its top-left corner.
fn convolve(window: &[Vec<f32>], coeffs: &[f32; conv::COEFF_COUNT], size: usize, x: usize) -> f32 {
    let center = (size >> 1) as i64;
    let mut row_sums = [0f32; conv::COEFF_DIM];
    for (r, row) in window.iter().enumerate().take(size) {
        let mut taps = [0f32; conv::COEFF_DIM];
        for (k, tap) in taps.iter_mut().enumerate().take(size) {
            let sx = x as i64 + k as i64 - center;
            *tap = clamp_tap(row, sx) * coeffs[conv::COEFF_DIM * r + k];
        }
        row_sums[r] = chunk_sum(&taps[..size]);
    }
    chunk_sum(&row_sums[..size])
}

/// Working parameters latched from one register bank.
#[derive(Debug, Clone, Copy)]
struct ConvParams {
    kernel: u32,
    clamp: bool,
    abs: bool,
    sq: bool,
    accum: bool,
    output_disable: bool,
    threshold: f32,
    coeffs: [f32; conv::COEFF_COUNT],
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            kernel: 0,
            clamp: false,
            abs: false,
            sq: false,
            accum: false,
            output_disable: false,
            threshold: 0.0,
            coeffs: [0.0; conv::COEFF_COUNT],
        }
    }
}

impl ConvParams {
    fn decode(cfg: u32, coeff_regs: &[u32; conv_regs::COEFF_COUNT]) -> Self {
        let mut coeffs = [0f32; conv::COEFF_COUNT];
        // Three registers per row: two packed pairs then the fifth
        // coefficient alone in the low half
        for r in 0..conv::COEFF_DIM {
            let w0 = coeff_regs[3 * r];
            let w1 = coeff_regs[3 * r + 1];
            let w2 = coeff_regs[3 * r + 2];
            coeffs[conv::COEFF_DIM * r] = f16_to_f32(w0 as u16);
            coeffs[conv::COEFF_DIM * r + 1] = f16_to_f32((w0 >> 16) as u16);
            coeffs[conv::COEFF_DIM * r + 2] = f16_to_f32(w1 as u16);
            coeffs[conv::COEFF_DIM * r + 3] = f16_to_f32((w1 >> 16) as u16);
            coeffs[conv::COEFF_DIM * r + 4] = f16_to_f32(w2 as u16);
        }
        Self {
            kernel: cfg & conv::KERNEL_SIZE_MASK,
            clamp: (cfg >> conv::OUTPUT_CLAMP_BIT) & 1 != 0,
            abs: (cfg >> conv::ABS_BIT) & 1 != 0,
            sq: (cfg >> conv::SQ_BIT) & 1 != 0,
            accum: (cfg >> conv::ACCUM_BIT) & 1 != 0,
            output_disable: (cfg >> conv::OUTPUT_DISABLE_BIT) & 1 != 0,
            threshold: f16_to_f32(((cfg >> conv::THRESHOLD_SHIFT) & conv::THRESHOLD_MASK) as u16),
            coeffs,
        }
    }
}

/// The programmable convolution unit.
#[derive(Debug)]
pub struct Convolution {
    core: FilterCore,
    cfg: [u32; 2],
    coeff_regs: [[u32; conv_regs::COEFF_COUNT]; 2],
    params: ConvParams,
    acc_sum: f32,
    acc_count: u32,
    latched_sum: u32,
    latched_count: u32,
    rows: Vec<Vec<u8>>,
    window: Vec<Vec<f32>>,
    out_row: Vec<u8>,
}

impl Convolution {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new(UNIT_CONV, "conv", 3),
            cfg: [0; 2],
            coeff_regs: [[0; conv_regs::COEFF_COUNT]; 2],
            params: ConvParams::default(),
            acc_sum: 0.0,
            acc_count: 0,
            latched_sum: 0,
            latched_count: 0,
            rows: Vec::new(),
            window: Vec::new(),
            out_row: Vec::new(),
        }
    }

    pub fn set_cfg(&mut self, value: u32, bank: Bank) {
        self.cfg[bank as usize] = value;
    }

    pub fn cfg(&self, bank: Bank) -> u32 {
        self.cfg[bank as usize]
    }

    pub fn set_coeff(&mut self, idx: usize, value: u32, bank: Bank) {
        if idx < conv_regs::COEFF_COUNT {
            self.coeff_regs[bank as usize][idx] = value;
        }
    }

    pub fn coeff(&self, idx: usize, bank: Bank) -> u32 {
        if idx < conv_regs::COEFF_COUNT {
            self.coeff_regs[bank as usize][idx]
        } else {
            0
        }
    }

    /// Frame accumulator sum latched at the last end of frame, as f32 bits.
    pub fn accum_sum(&self) -> u32 {
        self.latched_sum
    }

    /// Frame accumulator count latched at the last end of frame.
    pub fn accum_count(&self) -> u32 {
        self.latched_count
    }
}

impl Default for Convolution {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterUnit for Convolution {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn select_parameters(&mut self, bank: Bank) {
        self.core.select_parameters(bank);
        self.params = ConvParams::decode(self.cfg[bank as usize], &self.coeff_regs[bank as usize]);
        self.core.set_kernel(self.params.kernel as usize);

        let width = self.core.width() as usize;
        let kernel = self.core.kernel();
        self.rows = alloc_rows(kernel, width * 2);
        self.window = vec![vec![0f32; width]; kernel];
        self.out_row = vec![0u8; width * 2];
    }

    fn validate_config(&self) -> Result<(), DeviceError> {
        match self.params.kernel {
            3 | 5 => Ok(()),
            size => Err(DeviceError::InvalidKernelSize { size }),
        }
    }

    fn run_line(&mut self, mem: &mut CmxMemory, slice: SliceGeometry) -> Result<(), DeviceError> {
        let params = self.params;
        let width = self.core.width() as usize;
        let kernel = self.core.kernel();
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
                kernel,
                width,
                &mut self.rows,
            )?;
            for (row, widened) in self.rows.iter().zip(self.window.iter_mut()) {
                for (x, w) in widened.iter_mut().enumerate() {
                    *w = f16_to_f32(u16::from_le_bytes([row[2 * x], row[2 * x + 1]]));
                }
            }

            for x in 0..width {
                let mut result = convolve(&self.window, &params.coeffs, kernel, x);
                if params.abs {
                    result = result.abs();
                }
                if params.sq {
                    result *= result;
                }
                if params.accum && result > params.threshold {
                    self.acc_sum += result;
                    self.acc_count += 1;
                }
                if params.clamp {
                    result = result.clamp(0.0, 1.0);
                }
                if !params.output_disable {
                    let bits = f32_to_f16(result);
                    self.out_row[2 * x..2 * x + 2].copy_from_slice(&bits.to_le_bytes());
                }
            }

            if !params.output_disable {
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
        }
        Ok(())
    }

    /// With output disabled the output port stays untouched.
    fn update_buffers(&mut self, irq: &mut InterruptController) -> Result<(), DeviceError> {
        if self.params.output_disable {
            self.core.update_input_buffer(irq)
        } else {
            self.core.update_buffers(irq)
        }
    }

    fn update_buffers_sync(&mut self, irq: &mut InterruptController) {
        if self.params.output_disable {
            self.core.update_input_buffer_sync(irq);
        } else {
            self.core.update_buffers_sync(irq);
        }
    }

    fn on_end_of_frame(&mut self) {
        debug!(
            "conv: frame accumulator sum={} count={}",
            self.acc_sum, self.acc_count
        );
        self.latched_sum = self.acc_sum.to_bits();
        self.latched_count = self.acc_count;
        self.acc_sum = 0.0;
        self.acc_count = 0;
    }
}
