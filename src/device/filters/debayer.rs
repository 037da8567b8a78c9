//! Debayer (demosaic) filter unit.
//!
//! Reconstructs full-color pixels from raw Bayer data by blending two
//! estimates:
//!
//! - a cheap bilinear estimate from the 3x3 neighborhood with fixed
//!   averaging weights, and
//! - an adaptive homogeneity-directed estimate: green interpolated
//!   horizontally and vertically with a second-derivative correction,
//!   red/blue interpolated with an analogous green-Laplacian correction
//!   whose form depends on whether the source pixel was green, both
//!   candidate images converted to a CIELAB-like opponent space through a
//!   fixed-point matrix, and a per-pixel homogeneity vote picking the
//!   direction whose neighbors stay closer than the direction-wise minima.
//!
//! A luma ramp (two thresholds) and a gradient ramp (one multiplier) drive
//! the blend factor, fading toward the bilinear estimate in dark and flat
//! regions. The deworm line bounds the green correction term to keep
//! maze/worm artifacts out of low-light frames.
//!
//! Frame edges reflect instead of replicating: mirroring preserves the
//! two-line Bayer period, so the color lattice continues across borders and
//! a flat field stays flat on the first and last lines.
//!
//! Bayer phase, input/output significant bits, output channel order, a
//! luma-only mode, a forced-zero red/blue mode and the output plane fan-out
//! per Bayer plane are all register-programmable.

use log::debug;

use crate::device::buffer::Bank;
use crate::device::filter::{alloc_rows, FilterCore, FilterUnit};
use crate::device::memory::{CmxMemory, SliceGeometry};
use crate::device::sipp_spec::{dbyr, DBYR_KERNEL, UNIT_DBYR};
use crate::device::DeviceError;

/// First window row with a directional green estimate (rows 2..=8).
const GREEN_BASE: usize = 2;
const GREEN_ROWS: usize = 7;

/// First window row with a full directional RGB estimate (rows 3..=7).
const RGB_BASE: usize = 3;
const RGB_ROWS: usize = 5;

/// Center row of the 11-line window, the line being produced.
const CENTER: usize = DBYR_KERNEL / 2;

/// RGB to CIELAB-like conversion, Q16: a BT.601 luma row plus two zero-sum
/// opponent rows.
const LAB_MTX: [[i64; 3]; 3] = [
    [19595, 38470, 7471],
    [32768, -27030, -5738],
    [-16384, -16384, 32768],
];

/// Output channel per plane slot for each image-order code; codes 6 and 7
/// alias RGB.
const ORDERS: [[usize; 3]; 6] = [
    [0, 1, 2],
    [0, 2, 1],
    [1, 0, 2],
    [1, 2, 0],
    [2, 0, 1],
    [2, 1, 0],
];

const HORIZONTAL: usize = 0;
const VERTICAL: usize = 1;

/// What a Bayer cell holds at a given row/column parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Red,
    /// Green pixel in a red row: red neighbors sit left/right
    GreenR,
    /// Green pixel in a blue row: red neighbors sit above/below
    GreenB,
    Blue,
}

/// Working parameters latched from one register bank.
#[derive(Debug, Clone, Copy, Default)]
struct DbyrParams {
    red_y: u32,
    red_x: u32,
    luma_only: bool,
    force_rb_zero: bool,
    in_width: u32,
    out_width: u32,
    order: [usize; 3],
    fanout: u32,
    gradient_mul: i32,
    luma_low: i32,
    luma_high: i32,
    deworm_slope: i64,
    deworm_offset: i64,
    max_in: i32,
}

impl DbyrParams {
    fn decode(cfg: u32, thresh: u32, deworm: u32) -> Self {
        let pattern = cfg & dbyr::BAYER_PATTERN_MASK;
        let order_code = ((cfg >> dbyr::IMAGE_ORDER_SHIFT) & dbyr::IMAGE_ORDER_MASK) as usize;
        let in_width = ((cfg >> dbyr::IN_WIDTH_SHIFT) & dbyr::IN_WIDTH_MASK) + 1;
        Self {
            red_y: pattern >> 1,
            red_x: pattern & 1,
            luma_only: (cfg >> dbyr::LUMA_ONLY_BIT) & 1 != 0,
            force_rb_zero: (cfg >> dbyr::FORCE_RB_ZERO_BIT) & 1 != 0,
            in_width,
            out_width: ((cfg >> dbyr::OUT_WIDTH_SHIFT) & dbyr::OUT_WIDTH_MASK) + 1,
            order: ORDERS.get(order_code).copied().unwrap_or(ORDERS[0]),
            fanout: ((cfg >> dbyr::PLANE_MULTIPLE_SHIFT) & dbyr::PLANE_MULTIPLE_MASK) + 1,
            gradient_mul: ((cfg >> dbyr::GRADIENT_MUL_SHIFT) & dbyr::GRADIENT_MUL_MASK) as i32,
            luma_low: (thresh & dbyr::THRESH1_MASK) as i32,
            luma_high: ((thresh >> dbyr::THRESH2_SHIFT) & dbyr::THRESH2_MASK) as i32,
            deworm_slope: (deworm & dbyr::DEWORM_SLOPE_MASK) as i64,
            deworm_offset: (deworm >> dbyr::DEWORM_OFFSET_SHIFT) as i64,
            max_in: ((1u32 << in_width) - 1) as i32,
        }
    }

    fn cell(&self, row_parity: u32, col_parity: u32) -> Cell {
        if row_parity == self.red_y {
            if col_parity == self.red_x {
                Cell::Red
            } else {
                Cell::GreenR
            }
        } else if col_parity == self.red_x {
            Cell::GreenB
        } else {
            Cell::Blue
        }
    }

    /// Magnitude bound for the green correction term at source brightness
    /// `center`.
    fn deworm_limit(&self, center: i32) -> i64 {
        self.deworm_offset + ((self.deworm_slope * center as i64) >> 8)
    }
}

/// Reflect an index into `0..len`, preserving Bayer parity at the borders.
#[inline]
fn refl_idx(x: i64, len: usize) -> usize {
    let last = len as i64 - 1;
    let r = if x < 0 {
        -x
    } else if x > last {
        2 * last - x
    } else {
        x
    };
    r.clamp(0, last.max(0)) as usize
}

/// Border-reflected sample.
#[inline]
fn at(row: &[i32], x: i64) -> i32 {
    row[refl_idx(x, row.len())]
}

#[inline]
fn avg2(a: i32, b: i32) -> i32 {
    (a + b + 1) >> 1
}

fn lab_of(rgb: [i32; 3]) -> [i32; 3] {
    let mut lab = [0i32; 3];
    for (l, row) in lab.iter_mut().zip(LAB_MTX.iter()) {
        let v = row[0] * rgb[0] as i64 + row[1] * rgb[1] as i64 + row[2] * rgb[2] as i64;
        *l = (v >> 16) as i32;
    }
    lab
}

/// Scale a channel from input to output significant bits.
fn scale_out(p: &DbyrParams, v: i32) -> i32 {
    let shift = p.out_width as i32 - p.in_width as i32;
    let scaled = if shift >= 0 { v << shift } else { v >> -shift };
    scaled.clamp(0, ((1u32 << p.out_width) - 1) as i32)
}

/// Directional green interpolation over window rows 2..=8.
///
/// At green pixels the sample passes through. Elsewhere the two same-axis
/// green neighbors average, corrected by half the second derivative of the
/// center color along the same axis; the correction magnitude is held to the
/// deworm limit.
fn interp_green(
    p: &DbyrParams,
    raw: &[Vec<i32>],
    row_par: &[u32; DBYR_KERNEL],
    dir: usize,
    out: &mut [Vec<i32>],
) {
    let width = raw[0].len();
    for r in GREEN_BASE..GREEN_BASE + GREEN_ROWS {
        for x in 0..width {
            let cell = p.cell(row_par[r], x as u32 & 1);
            let value = match cell {
                Cell::GreenR | Cell::GreenB => raw[r][x],
                Cell::Red | Cell::Blue => {
                    let c = raw[r][x];
                    let xi = x as i64;
                    let (g1, g2, c1, c2) = if dir == HORIZONTAL {
                        (
                            at(&raw[r], xi - 1),
                            at(&raw[r], xi + 1),
                            at(&raw[r], xi - 2),
                            at(&raw[r], xi + 2),
                        )
                    } else {
                        (raw[r - 1][x], raw[r + 1][x], raw[r - 2][x], raw[r + 2][x])
                    };
                    let corr = (2 * c - c1 - c2 + 2) >> 2;
                    let limit = p.deworm_limit(c).clamp(0, i32::MAX as i64) as i32;
                    avg2(g1, g2) + corr.clamp(-limit, limit)
                }
            };
            out[r - GREEN_BASE][x] = value.clamp(0, p.max_in);
        }
    }
}

/// Directional red/blue interpolation over window rows 3..=7, producing the
/// full RGB triple from the raw window and one directional green plane.
///
/// Green pixels take their missing colors from the two same-color neighbors
/// on the axis the Bayer pattern provides them, red/blue pixels take the
/// opposite color from the four diagonals; both corrected by the matching
/// green Laplacian.
fn interp_rb(
    p: &DbyrParams,
    raw: &[Vec<i32>],
    row_par: &[u32; DBYR_KERNEL],
    green: &[Vec<i32>],
    out: &mut [Vec<[i32; 3]>],
) {
    let width = raw[0].len();
    // Pair interpolation along one axis with the green-difference correction
    let pair = |n1: i32, n2: i32, gc: i32, g1: i32, g2: i32, max: i32| {
        ((n1 + n2 + 2 * gc - g1 - g2 + 1) >> 1).clamp(0, max)
    };
    for r in RGB_BASE..RGB_BASE + RGB_ROWS {
        let g = |rr: usize, x: i64| at(&green[rr - GREEN_BASE], x);
        for x in 0..width {
            let xi = x as i64;
            let gc = green[r - GREEN_BASE][x];
            let diag = || {
                let sum_raw = at(&raw[r - 1], xi - 1)
                    + at(&raw[r - 1], xi + 1)
                    + at(&raw[r + 1], xi - 1)
                    + at(&raw[r + 1], xi + 1);
                let sum_g = g(r - 1, xi - 1) + g(r - 1, xi + 1) + g(r + 1, xi - 1) + g(r + 1, xi + 1);
                ((sum_raw + 4 * gc - sum_g + 2) >> 2).clamp(0, p.max_in)
            };
            let horiz = || {
                pair(
                    at(&raw[r], xi - 1),
                    at(&raw[r], xi + 1),
                    gc,
                    g(r, xi - 1),
                    g(r, xi + 1),
                    p.max_in,
                )
            };
            let vert = || pair(raw[r - 1][x], raw[r + 1][x], gc, g(r - 1, xi), g(r + 1, xi), p.max_in);

            out[r - RGB_BASE][x] = match p.cell(row_par[r], x as u32 & 1) {
                Cell::Red => [raw[r][x], gc, diag()],
                Cell::Blue => [diag(), gc, raw[r][x]],
                Cell::GreenR => [horiz(), raw[r][x], vert()],
                Cell::GreenB => [vert(), raw[r][x], horiz()],
            };
        }
    }
}

/// Fixed-weight bilinear estimate for the center row.
fn bilinear(p: &DbyrParams, raw: &[Vec<i32>], row_par: &[u32; DBYR_KERNEL], out: &mut [[i32; 3]]) {
    let above = &raw[CENTER - 1];
    let row = &raw[CENTER];
    let below = &raw[CENTER + 1];
    for (x, px) in out.iter_mut().enumerate() {
        let xi = x as i64;
        let cross = (above[x] + below[x] + at(row, xi - 1) + at(row, xi + 1) + 2) >> 2;
        let diag =
            (at(above, xi - 1) + at(above, xi + 1) + at(below, xi - 1) + at(below, xi + 1) + 2) >> 2;
        let h2 = avg2(at(row, xi - 1), at(row, xi + 1));
        let v2 = avg2(above[x], below[x]);
        *px = match p.cell(row_par[CENTER], x as u32 & 1) {
            Cell::Red => [row[x], cross, diag],
            Cell::Blue => [diag, cross, row[x]],
            Cell::GreenR => [h2, row[x], v2],
            Cell::GreenB => [v2, row[x], h2],
        };
    }
}

/// Homogeneity votes for both candidate directions at one cell.
///
/// Luma and chroma distances to the four neighbors are compared against the
/// direction-wise minima: the horizontal candidate supplies the left/right
/// bound, the vertical one the up/down bound. A neighbor votes for a
/// direction when both its distances stay within the bounds.
fn homogeneity(
    lab_h: &[Vec<[i32; 3]>],
    lab_v: &[Vec<[i32; 3]>],
    r: usize,
    x: i64,
) -> (u32, u32) {
    let width = lab_h[0].len();
    let xc = refl_idx(x, width);
    let neighbors = [
        (r, refl_idx(x - 1, width)),
        (r, refl_idx(x + 1, width)),
        (r - 1, xc),
        (r + 1, xc),
    ];

    let dists = |lab: &[Vec<[i32; 3]>]| {
        let c = lab[r][xc];
        let mut dl = [0i32; 4];
        let mut dc = [0i64; 4];
        for (i, &(nr, nx)) in neighbors.iter().enumerate() {
            let n = lab[nr][nx];
            dl[i] = (c[0] - n[0]).abs();
            let da = (c[1] - n[1]) as i64;
            let db = (c[2] - n[2]) as i64;
            dc[i] = da * da + db * db;
        }
        (dl, dc)
    };
    let (dl_h, dc_h) = dists(lab_h);
    let (dl_v, dc_v) = dists(lab_v);

    let eps_l = dl_h[0].max(dl_h[1]).min(dl_v[2].max(dl_v[3]));
    let eps_c = dc_h[0].max(dc_h[1]).min(dc_v[2].max(dc_v[3]));

    let count = |dl: &[i32; 4], dc: &[i64; 4]| {
        (0..4)
            .filter(|&i| dl[i] <= eps_l && dc[i] <= eps_c)
            .count() as u32
    };
    (count(&dl_h, &dc_h), count(&dl_v, &dc_v))
}

/// The debayer unit.
#[derive(Debug)]
pub struct Debayer {
    core: FilterCore,
    cfg: [u32; 2],
    thresh: [u32; 2],
    deworm: [u32; 2],
    params: DbyrParams,
    rows: Vec<Vec<u8>>,
    raw: Vec<Vec<i32>>,
    row_par: [u32; DBYR_KERNEL],
    green: [Vec<Vec<i32>>; 2],
    rgb: [Vec<Vec<[i32; 3]>>; 2],
    lab: [Vec<Vec<[i32; 3]>>; 2],
    bil: Vec<[i32; 3]>,
    pix: Vec<[i32; 3]>,
    luma_row: Vec<i32>,
    out_row: Vec<u8>,
}

impl Debayer {
    pub fn new() -> Self {
        Self {
            core: FilterCore::new(UNIT_DBYR, "dbyr", DBYR_KERNEL),
            cfg: [0; 2],
            thresh: [0; 2],
            deworm: [0; 2],
            params: DbyrParams::default(),
            rows: Vec::new(),
            raw: Vec::new(),
            row_par: [0; DBYR_KERNEL],
            green: [Vec::new(), Vec::new()],
            rgb: [Vec::new(), Vec::new()],
            lab: [Vec::new(), Vec::new()],
            bil: Vec::new(),
            pix: Vec::new(),
            luma_row: Vec::new(),
            out_row: Vec::new(),
        }
    }

    pub fn set_cfg(&mut self, value: u32, bank: Bank) {
        self.cfg[bank as usize] = value;
    }

    pub fn cfg(&self, bank: Bank) -> u32 {
        self.cfg[bank as usize]
    }

    pub fn set_thresh(&mut self, value: u32, bank: Bank) {
        self.thresh[bank as usize] = value;
    }

    pub fn thresh(&self, bank: Bank) -> u32 {
        self.thresh[bank as usize]
    }

    pub fn set_deworm(&mut self, value: u32, bank: Bank) {
        self.deworm[bank as usize] = value;
    }

    pub fn deworm(&self, bank: Bank) -> u32 {
        self.deworm[bank as usize]
    }

    /// Blend factor toward the adaptive estimate, 0..=256.
    fn blend_alpha(&self, luma: i32, grad: i32) -> i32 {
        let p = &self.params;
        let luma_ramp = if p.luma_high > p.luma_low {
            ((luma - p.luma_low) * 256 / (p.luma_high - p.luma_low)).clamp(0, 256)
        } else if luma >= p.luma_low {
            256
        } else {
            0
        };
        let grad_ramp = ((grad * p.gradient_mul) >> 4).min(256);
        (luma_ramp * grad_ramp) >> 8
    }

    /// Run the full estimate pipeline for the gathered window and fill the
    /// blended center-line pixels and their luma.
    fn process_window(&mut self) {
        let p = self.params;
        let width = self.raw[0].len();

        for dir in [HORIZONTAL, VERTICAL] {
            interp_green(&p, &self.raw, &self.row_par, dir, &mut self.green[dir]);
            interp_rb(&p, &self.raw, &self.row_par, &self.green[dir], &mut self.rgb[dir]);
            for (rgb_row, lab_row) in self.rgb[dir].iter().zip(self.lab[dir].iter_mut()) {
                for (rgb, lab) in rgb_row.iter().zip(lab_row.iter_mut()) {
                    *lab = lab_of(*rgb);
                }
            }
        }
        bilinear(&p, &self.raw, &self.row_par, &mut self.bil);

        for x in 0..width {
            // Vote over the 3x3 neighborhood of the center cell
            let mut score_h = 0u32;
            let mut score_v = 0u32;
            for r in CENTER - 1..=CENTER + 1 {
                for dx in -1i64..=1 {
                    let (h, v) =
                        homogeneity(&self.lab[HORIZONTAL], &self.lab[VERTICAL], r - RGB_BASE, x as i64 + dx);
                    score_h += h;
                    score_v += v;
                }
            }
            let hx = self.rgb[HORIZONTAL][CENTER - RGB_BASE][x];
            let vx = self.rgb[VERTICAL][CENTER - RGB_BASE][x];
            let ahd = if score_h > score_v {
                hx
            } else if score_v > score_h {
                vx
            } else {
                [avg2(hx[0], vx[0]), avg2(hx[1], vx[1]), avg2(hx[2], vx[2])]
            };

            let bil = self.bil[x];
            let luma = lab_of(bil)[0];
            let xi = x as i64;
            let grad = (at(&self.raw[CENTER], xi + 1) - at(&self.raw[CENTER], xi - 1)).abs()
                + (self.raw[CENTER + 1][x] - self.raw[CENTER - 1][x]).abs();
            let alpha = self.blend_alpha(luma, grad);

            let mut out = [0i32; 3];
            for c in 0..3 {
                out[c] = bil[c] + (((ahd[c] - bil[c]) * alpha) >> 8);
            }
            self.luma_row[x] = lab_of(out)[0];
            if p.force_rb_zero {
                out[0] = 0;
                out[2] = 0;
            }
            self.pix[x] = out;
        }
    }

    /// Pack one output plane from the blended pixels into the scatter row.
    fn pack_plane(&mut self, slot: u32) {
        let p = self.params;
        let fmt = self.core.out_buf.geo().format as usize;
        let channel = if p.luma_only || slot >= 3 {
            None
        } else {
            Some(p.order[slot as usize])
        };
        for (x, chunk) in self.out_row.chunks_exact_mut(fmt).enumerate() {
            let v = match channel {
                Some(c) => self.pix[x][c],
                None => self.luma_row[x],
            };
            let v = scale_out(&p, v) as u32;
            chunk[0] = v as u8;
            if fmt > 1 {
                chunk[1] = (v >> 8) as u8;
            }
        }
    }
}

impl Default for Debayer {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterUnit for Debayer {
    fn core(&self) -> &FilterCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut FilterCore {
        &mut self.core
    }

    fn select_parameters(&mut self, bank: Bank) {
        self.core.select_parameters(bank);
        let b = bank as usize;
        self.params = DbyrParams::decode(self.cfg[b], self.thresh[b], self.deworm[b]);
        debug!(
            "dbyr: pattern ({},{}) widths {}->{} fanout {} luma_only {}",
            self.params.red_y,
            self.params.red_x,
            self.params.in_width,
            self.params.out_width,
            self.params.fanout,
            self.params.luma_only
        );

        let width = self.core.width() as usize;
        let in_fmt = self.core.in_buf.geo().format as usize;
        let out_fmt = self.core.out_buf.geo().format as usize;
        self.rows = alloc_rows(DBYR_KERNEL, width * in_fmt);
        self.raw = vec![vec![0; width]; DBYR_KERNEL];
        self.green = [
            vec![vec![0; width]; GREEN_ROWS],
            vec![vec![0; width]; GREEN_ROWS],
        ];
        self.rgb = [
            vec![vec![[0; 3]; width]; RGB_ROWS],
            vec![vec![[0; 3]; width]; RGB_ROWS],
        ];
        self.lab = [
            vec![vec![[0; 3]; width]; RGB_ROWS],
            vec![vec![[0; 3]; width]; RGB_ROWS],
        ];
        self.bil = vec![[0; 3]; width];
        self.pix = vec![[0; 3]; width];
        self.luma_row = vec![0; width];
        self.out_row = vec![0; width * out_fmt];
    }

    fn validate_config(&self) -> Result<(), DeviceError> {
        let p = &self.params;
        let in_bytes = self.core.in_buf.geo().format;
        let out_bytes = self.core.out_buf.geo().format;
        if p.in_width.div_ceil(8) > in_bytes {
            return Err(DeviceError::DataWidth {
                width: p.in_width,
                bytes: in_bytes,
            });
        }
        if p.out_width.div_ceil(8) > out_bytes {
            return Err(DeviceError::DataWidth {
                width: p.out_width,
                bytes: out_bytes,
            });
        }
        Ok(())
    }

    fn run_line(&mut self, mem: &mut CmxMemory, slice: SliceGeometry) -> Result<(), DeviceError> {
        let width = self.core.width() as usize;
        let height = self.core.height() as i64;
        let line = self.core.line_idx() as i64;
        let in_fmt = self.core.in_buf.geo().format as usize;
        let in_planes = self.core.in_buf.geo().planes;
        let fanout = self.params.fanout;
        let mask = self.params.max_in;

        // The shared gather replicates the nearest frame line at the edges,
        // which would break the Bayer period. Remap each window row to the
        // reflected source line instead; every reflected line is already
        // among the gathered rows, and the virtual parity carries on across
        // the border.
        let first = line - CENTER as i64;
        let last = (height - 1).max(0);
        let mut slot = [0usize; DBYR_KERNEL];
        for (w, par) in self.row_par.iter_mut().enumerate() {
            let virt = first + w as i64;
            let src = if virt < 0 {
                -virt
            } else if virt > last {
                2 * last - virt
            } else {
                virt
            }
            .clamp(0, last);
            slot[w] = (src - first).clamp(0, DBYR_KERNEL as i64 - 1) as usize;
            *par = (virt & 1) as u32;
        }

        let mut in_slice = 0;
        let mut out_slice = 0;
        for pl in 0..in_planes {
            in_slice = self.core.in_buf.plane_start_slice(slice, in_slice, pl);
            self.core.gather_window(
                &self.core.in_buf,
                mem,
                slice,
                in_slice,
                pl,
                DBYR_KERNEL,
                width,
                &mut self.rows,
            )?;
            for (w, widened) in self.raw.iter_mut().enumerate() {
                let row = &self.rows[slot[w]];
                for (x, v) in widened.iter_mut().enumerate() {
                    let s = if in_fmt > 1 {
                        u16::from_le_bytes([row[2 * x], row[2 * x + 1]]) as i32
                    } else {
                        row[x] as i32
                    };
                    *v = s & mask;
                }
            }

            self.process_window();

            for slot in 0..fanout {
                let out_pl = pl * fanout + slot;
                out_slice = self.core.out_buf.plane_start_slice(slice, out_slice, out_pl);
                self.pack_plane(slot);
                self.core.out_buf.scatter_line(
                    mem,
                    slice,
                    out_slice,
                    out_pl,
                    self.core.out_buf.buffer_idx(),
                    width,
                    &self.out_row,
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::irq::InterruptController;
    use crate::device::sipp_spec::fields as f;
    use crate::device::sipp_spec::IRQ_GROUP_EOF;

    const IN_BASE: u32 = 0x0000;
    const OUT_BASE: u32 = 0x10000;
    const WIDTH: u32 = 12;
    const HEIGHT: u32 = 12;

    fn cfg_word(
        pattern: u32,
        luma_only: bool,
        force_rb: bool,
        in_bits: u32,
        out_bits: u32,
        order: u32,
        fanout: u32,
        gradient_mul: u32,
    ) -> u32 {
        pattern
            | (luma_only as u32) << dbyr::LUMA_ONLY_BIT
            | (force_rb as u32) << dbyr::FORCE_RB_ZERO_BIT
            | (in_bits - 1) << dbyr::IN_WIDTH_SHIFT
            | (out_bits - 1) << dbyr::OUT_WIDTH_SHIFT
            | order << dbyr::IMAGE_ORDER_SHIFT
            | (fanout - 1) << dbyr::PLANE_MULTIPLE_SHIFT
            | gradient_mul << dbyr::GRADIENT_MUL_SHIFT
    }

    fn setup(in_fmt: u32, out_fmt: u32) -> Debayer {
        let mut db = Debayer::new();
        db.core.set_frm_dim(WIDTH | (HEIGHT << 16), Bank::Default);
        db.core
            .in_buf
            .set_cfg(16 | (in_fmt << f::CFG_FORMAT_SHIFT), Bank::Default);
        db.core.in_buf.set_base(IN_BASE, Bank::Default);
        db.core.in_buf.set_line_stride(WIDTH * in_fmt, Bank::Default);
        db.core
            .out_buf
            .set_cfg(out_fmt << f::CFG_FORMAT_SHIFT, Bank::Default);
        db.core.out_buf.set_base(OUT_BASE, Bank::Default);
        db.core.out_buf.set_line_stride(WIDTH * out_fmt, Bank::Default);
        db.core
            .out_buf
            .set_plane_stride(WIDTH * HEIGHT * out_fmt, Bank::Default);
        db.core.enable();
        db
    }

    /// Flat mosaic: `tl` at even/even cells, `tr` right of it, `bl` below,
    /// `br` diagonal.
    fn write_mosaic(mem: &mut CmxMemory, tl: u8, tr: u8, bl: u8, br: u8) {
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let v = match (y & 1, x & 1) {
                    (0, 0) => tl,
                    (0, 1) => tr,
                    (1, 0) => bl,
                    _ => br,
                };
                mem.write_u8(IN_BASE + y * WIDTH + x, v).unwrap();
            }
        }
    }

    fn run_frame(db: &mut Debayer, mem: &mut CmxMemory) -> InterruptController {
        let mut irq = InterruptController::new();
        for _ in 0..HEIGHT {
            db.inc_input_fill().unwrap();
        }
        db.try_run(mem, &mut irq, SliceGeometry::default(), Bank::Default)
            .unwrap();
        irq
    }

    fn out_pixel(mem: &CmxMemory, plane: u32, y: u32, x: u32) -> u8 {
        mem.read_u8(OUT_BASE + plane * WIDTH * HEIGHT + y * WIDTH + x)
            .unwrap()
    }

    #[test]
    fn test_flat_field_reproduces_cell_colors() {
        let mut mem = CmxMemory::new();
        let mut db = setup(1, 1);
        db.set_cfg(cfg_word(0, false, false, 8, 8, 0, 3, 255), Bank::Default);
        // RGGB: red 200, green 100, blue 50
        write_mosaic(&mut mem, 200, 100, 100, 50);

        let irq = run_frame(&mut db, &mut mem);

        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                assert_eq!(out_pixel(&mem, 0, y, x), 200, "red at {y},{x}");
                assert_eq!(out_pixel(&mem, 1, y, x), 100, "green at {y},{x}");
                assert_eq!(out_pixel(&mem, 2, y, x), 50, "blue at {y},{x}");
            }
        }
        assert_eq!(irq.status(IRQ_GROUP_EOF), 1 << UNIT_DBYR);
        assert_eq!(db.core.in_buf.fill_level(), 0);
    }

    #[test]
    fn test_green_correction_follows_deworm_limit() {
        // Flat green 100 with one brighter red sample: the second derivative
        // under the spike pulls the green estimate up by 20
        let mut raw = vec![vec![100i32; 12]; DBYR_KERNEL];
        raw[4][6] = 140;
        let mut row_par = [0u32; DBYR_KERNEL];
        for (w, par) in row_par.iter_mut().enumerate() {
            *par = (w & 1) as u32;
        }
        let mut green = vec![vec![0i32; 12]; GREEN_ROWS];

        let run = |deworm: u32, green: &mut Vec<Vec<i32>>| {
            let p = DbyrParams::decode(cfg_word(0, false, false, 8, 8, 0, 1, 0), 0, deworm);
            interp_green(&p, &raw, &row_par, HORIZONTAL, green);
            green[4 - GREEN_BASE][6]
        };

        // Unlimited correction, clamped to 5, suppressed entirely
        assert_eq!(run(0xFFFF_0000, &mut green), 120);
        assert_eq!(run(0x0005_0000, &mut green), 105);
        assert_eq!(run(0, &mut green), 100);
    }

    #[test]
    fn test_homogeneity_votes_prefer_uniform_direction() {
        // Horizontal candidate smears a step over three columns, vertical
        // candidate keeps it sharp; every row identical
        let lh: Vec<[i32; 3]> = [0, 0, 50, 100, 100].iter().map(|&l| [l, 0, 0]).collect();
        let lv: Vec<[i32; 3]> = [0, 0, 0, 100, 100].iter().map(|&l| [l, 0, 0]).collect();
        let lab_h = vec![lh; 5];
        let lab_v = vec![lv; 5];

        let (h, v) = homogeneity(&lab_h, &lab_v, 2, 2);
        assert_eq!(h, 2);
        assert_eq!(v, 3);
    }

    #[test]
    fn test_vertical_edge_stays_sharp() {
        let mut mem = CmxMemory::new();
        let mut db = setup(1, 1);
        db.set_cfg(cfg_word(0, false, false, 8, 8, 0, 3, 255), Bank::Default);
        db.set_deworm(0xFFFF_0000, Bank::Default);

        // Gray step: every channel 40 on the left half, 200 on the right.
        // Vertical interpolation reconstructs it exactly; the votes must
        // reject the smeared horizontal candidate at every edge column.
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                let v = if x < 6 { 40 } else { 200 };
                mem.write_u8(IN_BASE + y * WIDTH + x, v).unwrap();
            }
        }

        run_frame(&mut db, &mut mem);

        for plane in 0..3 {
            for y in 0..HEIGHT {
                for x in 0..WIDTH {
                    let want = if x < 6 { 40 } else { 200 };
                    assert_eq!(out_pixel(&mem, plane, y, x), want, "plane {plane} at {y},{x}");
                }
            }
        }
    }

    #[test]
    fn test_luma_only_output() {
        let mut mem = CmxMemory::new();
        let mut db = setup(1, 1);
        db.set_cfg(cfg_word(0, true, false, 8, 8, 0, 1, 0), Bank::Default);
        write_mosaic(&mut mem, 200, 100, 100, 50);

        run_frame(&mut db, &mut mem);

        // BT.601 luma of (200, 100, 50), floor
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                assert_eq!(out_pixel(&mem, 0, y, x), 124, "at {y},{x}");
            }
        }
    }

    #[test]
    fn test_force_rb_zero() {
        let mut mem = CmxMemory::new();
        let mut db = setup(1, 1);
        db.set_cfg(cfg_word(0, false, true, 8, 8, 0, 3, 0), Bank::Default);
        write_mosaic(&mut mem, 200, 100, 100, 50);

        run_frame(&mut db, &mut mem);

        assert_eq!(out_pixel(&mem, 0, 5, 5), 0);
        assert_eq!(out_pixel(&mem, 1, 5, 5), 100);
        assert_eq!(out_pixel(&mem, 2, 5, 5), 0);
    }

    #[test]
    fn test_output_width_scaling() {
        let mut mem = CmxMemory::new();
        // 10-bit samples in 2-byte cells, narrowed to 8 bits on the way out
        let mut db = setup(2, 1);
        db.set_cfg(cfg_word(0, false, false, 10, 8, 0, 3, 0), Bank::Default);
        for y in 0..HEIGHT {
            for x in 0..WIDTH {
                mem.write_u16(IN_BASE + (y * WIDTH + x) * 2, 515).unwrap();
            }
        }

        run_frame(&mut db, &mut mem);

        for plane in 0..3 {
            assert_eq!(out_pixel(&mem, plane, 6, 6), 128, "plane {plane}");
        }
    }

    #[test]
    fn test_bayer_phase_swaps_channels() {
        let mut mem = CmxMemory::new();
        let mut db = setup(1, 1);
        // Same mosaic as the RGGB flat test, decoded as BGGR
        db.set_cfg(cfg_word(3, false, false, 8, 8, 0, 3, 0), Bank::Default);
        write_mosaic(&mut mem, 200, 100, 100, 50);

        run_frame(&mut db, &mut mem);

        assert_eq!(out_pixel(&mem, 0, 5, 5), 50);
        assert_eq!(out_pixel(&mem, 1, 5, 5), 100);
        assert_eq!(out_pixel(&mem, 2, 5, 5), 200);
    }

    #[test]
    fn test_plane_fanout_adds_luma_plane() {
        let mut mem = CmxMemory::new();
        let mut db = setup(1, 1);
        db.set_cfg(cfg_word(0, false, false, 8, 8, 0, 4, 0), Bank::Default);
        write_mosaic(&mut mem, 200, 100, 100, 50);

        run_frame(&mut db, &mut mem);

        assert_eq!(out_pixel(&mem, 0, 5, 5), 200);
        assert_eq!(out_pixel(&mem, 1, 5, 5), 100);
        assert_eq!(out_pixel(&mem, 2, 5, 5), 50);
        assert_eq!(out_pixel(&mem, 3, 5, 5), 124);
    }

    #[test]
    fn test_data_width_must_fit_format() {
        let mut mem = CmxMemory::new();
        let mut db = setup(1, 1);
        // 12 significant bits cannot live in 1-byte cells
        db.set_cfg(cfg_word(0, false, false, 12, 8, 0, 3, 0), Bank::Default);

        let mut irq = InterruptController::new();
        for _ in 0..HEIGHT {
            db.inc_input_fill().unwrap();
        }
        let err = db
            .try_run(&mut mem, &mut irq, SliceGeometry::default(), Bank::Default)
            .unwrap_err();
        assert_eq!(err, DeviceError::DataWidth { width: 12, bytes: 1 });
    }
}
