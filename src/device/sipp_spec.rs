//! SIPP Register Address Specification
//!
//! All addresses and bit field layouts for the streaming image processing
//! pipeline (SIPP) accelerator block. This module centralizes register
//! addresses to eliminate magic numbers throughout the codebase.
//!
//! The register bus exposes one global block at offset 0x000 and one 256-byte
//! block per filter unit at `0x100 * (1 + unit_id)`. Every configurable buffer
//! and parameter field has a default register and a shadow twin so the next
//! frame can be programmed while the current one drains.

// ============================================================================
// Address Space Layout
// ============================================================================

/// Chroma denoise unit id (bit position in enable/start/interrupt masks)
pub const UNIT_CHROMA: usize = 0;

/// Programmable convolution unit id
pub const UNIT_CONV: usize = 1;

/// Debayer (demosaic) unit id
pub const UNIT_DBYR: usize = 2;

/// Number of filter units in the model
pub const UNIT_COUNT: usize = 3;

/// Size of each per-unit register block in bytes
pub const UNIT_BLOCK_SIZE: u32 = 0x100;

/// End of the decoded register address space (exclusive)
pub const ADDRESS_SPACE_END: u32 = UNIT_BLOCK_SIZE * (1 + UNIT_COUNT as u32);

/// Base address of a unit's register block
#[inline]
pub const fn unit_base(unit: usize) -> u32 {
    UNIT_BLOCK_SIZE * (1 + unit as u32)
}

/// Split an absolute address into (unit id, offset within the unit block).
/// Returns `None` for addresses in the global block or past the last unit.
#[inline]
pub const fn split_unit_addr(addr: u32) -> Option<(usize, u32)> {
    if addr < UNIT_BLOCK_SIZE || addr >= ADDRESS_SPACE_END {
        return None;
    }
    let unit = (addr / UNIT_BLOCK_SIZE - 1) as usize;
    Some((unit, addr % UNIT_BLOCK_SIZE))
}

// ============================================================================
// Global Registers (block at 0x000)
// ============================================================================

/// Filter enable mask. Writing a set bit enables that unit; reads assemble
/// the current enable state. Bits are never cleared through this register.
pub const SIPP_CONTROL: u32 = 0x000;

/// Filter start mask (write-only). For every set bit, the start payload in
/// [`fields::START_BIT`] is stored on that unit's input buffer and the
/// blocking single-line dispatch runs.
pub const SIPP_START: u32 = 0x004;

/// Interrupt group 0 (input fill-decrement events): status, read-only
pub const SIPP_INT0_STATUS: u32 = 0x008;
/// Interrupt group 0: enable mask
pub const SIPP_INT0_ENABLE: u32 = 0x00C;
/// Interrupt group 0: clear, write-only (reads 0)
pub const SIPP_INT0_CLEAR: u32 = 0x010;

/// Interrupt group 1 (output fill-increment events): status, read-only
pub const SIPP_INT1_STATUS: u32 = 0x014;
/// Interrupt group 1: enable mask
pub const SIPP_INT1_ENABLE: u32 = 0x018;
/// Interrupt group 1: clear, write-only (reads 0)
pub const SIPP_INT1_CLEAR: u32 = 0x01C;

/// Interrupt group 2 (end-of-frame events): status, read-only
pub const SIPP_INT2_STATUS: u32 = 0x020;
/// Interrupt group 2: enable mask
pub const SIPP_INT2_ENABLE: u32 = 0x024;
/// Interrupt group 2: clear, write-only (reads 0)
pub const SIPP_INT2_CLEAR: u32 = 0x028;

/// CMX slice geometry: size [19:0], first slice [27:24], last slice [31:28]
pub const SIPP_SLC_SIZE: u32 = 0x02C;

/// Shadow bank select, one bit per filter unit (0 = default, 1 = shadow)
pub const SIPP_SHADOW_SELECT: u32 = 0x030;

/// Soft reset. Writes are accepted and ignored.
pub const SIPP_SOFTRST: u32 = 0x034;

/// Global status. Reads 0.
pub const SIPP_STATUS: u32 = 0x038;

// ============================================================================
// Per-Unit Register Block Layout
// ============================================================================

pub mod unit {
    //! Register offsets within a unit's 256-byte block.
    //!
    //! Each buffer port carries a five-register group (BASE, CFG, LS, PS, IR)
    //! followed by its five shadow twins. Filter parameter registers start at
    //! [`PARAMS`]; their layout is unit-specific.

    /// Port group register: buffer base address in CMX
    pub const GRP_BASE: u32 = 0x00;
    /// Port group register: buffer configuration (lines, planes, format, slice)
    pub const GRP_CFG: u32 = 0x04;
    /// Port group register: line stride and chunk size
    pub const GRP_LS: u32 = 0x08;
    /// Port group register: plane stride
    pub const GRP_PS: u32 = 0x0C;
    /// Port group register: interrupt/start-level configuration
    pub const GRP_IR: u32 = 0x10;

    /// Offset from a group register to its shadow twin
    pub const GRP_SHADOW: u32 = 0x14;

    /// Size of a full port group (five registers plus five shadows)
    pub const GRP_SIZE: u32 = 0x28;

    /// Input buffer port group
    pub const IN_GRP: u32 = 0x00;

    /// Output buffer port group
    pub const OUT_GRP: u32 = 0x28;

    /// Input fill control: INCDEC increments, CTXUP sets absolute level,
    /// reads return the current fill level
    pub const IN_FC: u32 = 0x50;

    /// Output fill control: INCDEC decrements, CTXUP sets absolute level
    pub const OUT_FC: u32 = 0x54;

    /// Input context: line index [15:0], buffer index at CBL_OFFSET, start
    /// payload in the top bit
    pub const ICTX: u32 = 0x58;

    /// Output context: line index [15:0], buffer index at CBL_OFFSET
    pub const OCTX: u32 = 0x5C;

    /// Frame dimensions: width [15:0], height [31:16]
    pub const FRM_DIM: u32 = 0x60;

    /// Frame dimensions, shadow bank
    pub const FRM_DIM_SHADOW: u32 = 0x64;

    /// Start of the unit-specific parameter region
    pub const PARAMS: u32 = 0x68;
}

pub mod chroma_regs {
    //! Chroma denoise parameter registers (offsets within unit block 0x100).

    /// Filter configuration, see [`super::chroma`] for the field layout
    pub const CFG: u32 = 0x68;
    /// Filter configuration, shadow bank
    pub const CFG_SHADOW: u32 = 0x6C;

    /// Pass 0 thresholds: hor1 [7:0], hor2 [15:8], ver1 [23:16], ver2 [31:24]
    pub const THRESH: u32 = 0x70;
    /// Pass 0 thresholds, shadow bank
    pub const THRESH_SHADOW: u32 = 0x74;

    /// Plane 2 thresholds: hor3 [7:0], ver3 [23:16]
    pub const THRESH2: u32 = 0x78;
    /// Plane 2 thresholds, shadow bank
    pub const THRESH2_SHADOW: u32 = 0x7C;

    /// Reference buffer port group (BASE..IR plus shadows, same layout as the
    /// input group). The reference FC register supports only absolute set and
    /// its buffer updates never raise interrupts.
    pub const REF_GRP: u32 = 0x80;

    /// Reference fill control (CTXUP absolute set only)
    pub const REF_FC: u32 = 0xA8;

    /// Reference context register (CTXUP only, no start bit)
    pub const REF_ICTX: u32 = 0xAC;
}

pub mod conv_regs {
    //! Convolution parameter registers (offsets within unit block 0x200).

    /// Filter configuration, see [`super::conv`] for the field layout
    pub const CFG: u32 = 0x68;
    /// Filter configuration, shadow bank
    pub const CFG_SHADOW: u32 = 0x6C;

    /// Latched accumulator sum (f32 bit pattern), read-only
    pub const ACCUM: u32 = 0x70;
    /// Latched accumulator count, read-only
    pub const ACCUM_CNT: u32 = 0x74;

    /// First of 15 coefficient registers, two fp16 values per register:
    /// c01:c00, c03:c02, c04, c11:c10, ... c44 (row-major, low half first)
    pub const COEFF_BASE: u32 = 0x78;

    /// Number of packed coefficient registers (25 taps, two per register,
    /// one register per row remainder)
    pub const COEFF_COUNT: usize = 15;

    /// First shadow coefficient register
    pub const COEFF_SHADOW_BASE: u32 = 0xB4;

    /// Coefficient register address for (index, shadow bank)
    #[inline]
    pub const fn coeff_reg(idx: usize, shadow: bool) -> u32 {
        let base = if shadow { COEFF_SHADOW_BASE } else { COEFF_BASE };
        base + (idx as u32) * 4
    }
}

pub mod dbyr_regs {
    //! Debayer parameter registers (offsets within unit block 0x300).

    /// Filter configuration, see [`super::dbyr`] for the field layout
    pub const CFG: u32 = 0x68;
    /// Filter configuration, shadow bank
    pub const CFG_SHADOW: u32 = 0x6C;

    /// Luma thresholds: threshold1 [12:0], threshold2 [24:13]
    pub const THRESH: u32 = 0x70;
    /// Luma thresholds, shadow bank
    pub const THRESH_SHADOW: u32 = 0x74;

    /// Deworm line: slope [15:0], offset [31:16]
    pub const DEWORM: u32 = 0x78;
    /// Deworm line, shadow bank
    pub const DEWORM_SHADOW: u32 = 0x7C;
}

// ============================================================================
// Register Field Layouts
// ============================================================================

pub mod fields {
    //! Command bits and field masks shared by the context, fill-control and
    //! buffer configuration registers.

    /// Line-count mask (fill levels, buffer lines, buffer indices): 10 bits
    pub const NL_MASK: u32 = 0x3FF;

    /// Image dimension mask (width, height, line index): 16 bits
    pub const IMGDIM_MASK: u32 = 0xFFFF;

    /// Shift separating width from height in the frame dimensions register
    pub const IMGDIM_SIZE: u32 = 16;

    /// Buffer index position in the context registers (bits 25:16)
    pub const CBL_OFFSET: u32 = 16;

    /// Context-update command bit (FC absolute set, ICTX/OCTX index set)
    pub const CTXUP_BIT: u32 = 30;

    /// Fill-control increment/decrement command bit
    pub const INCDEC_BIT: u32 = 31;

    /// Start payload bit (ICTX writes and the global start mask)
    pub const START_BIT: u32 = 31;

    // Buffer CFG register

    /// CFG: circular buffer depth in lines [9:0] (0 = non-wrapping)
    pub const CFG_LINES_MASK: u32 = 0x3FF;
    /// CFG: last plane index [13:10]
    pub const CFG_PLANES_SHIFT: u32 = 10;
    pub const CFG_PLANES_MASK: u32 = 0xF;
    /// CFG: pixel format in bytes per pixel [18:16]
    pub const CFG_FORMAT_SHIFT: u32 = 16;
    pub const CFG_FORMAT_MASK: u32 = 0x7;
    /// CFG: start slice [27:24]
    pub const CFG_SLICE_SHIFT: u32 = 24;
    pub const CFG_SLICE_MASK: u32 = 0xF;

    // Buffer LS register

    /// LS: line stride in bytes [19:0]
    pub const LS_STRIDE_MASK: u32 = 0xFFFFF;
    /// LS: chunk size in bytes [31:20] (0 = contiguous lines)
    pub const LS_CHUNK_SHIFT: u32 = 20;
    pub const LS_CHUNK_MASK: u32 = 0xFFF;

    // Buffer IR register

    /// IR: start level [9:0], the fill level required before the first line
    /// of the first frame may run
    pub const IR_START_LEVEL_MASK: u32 = 0x3FF;

    // Slice geometry register

    /// SLC_SIZE: slice size in bytes [19:0]
    pub const SLICE_SIZE_MASK: u32 = 0xFFFFF;
    /// SLC_SIZE: first slice [27:24]
    pub const SLICE_FIRST_SHIFT: u32 = 24;
    pub const SLICE_FIRST_MASK: u32 = 0xF;
    /// SLC_SIZE: last slice [31:28]
    pub const SLICE_LAST_SHIFT: u32 = 28;
    pub const SLICE_LAST_MASK: u32 = 0xF;
}

pub mod chroma {
    //! Chroma denoise CFG register fields.

    /// Horizontal pass enable mask [2:0], one bit per pass
    pub const HOR_ENABLE_MASK: u32 = 0x7;
    /// Reference stream enable (bit 3)
    pub const REF_ENABLE_BIT: u32 = 3;
    /// Limiter distance [11:4]
    pub const LIMIT_SHIFT: u32 = 4;
    pub const LIMIT_MASK: u32 = 0xFF;
    /// Force all horizontal weights to 1 (bit 12)
    pub const FORCE_WT_HOR_BIT: u32 = 12;
    /// Force all vertical weights to 1 (bit 13)
    pub const FORCE_WT_VER_BIT: u32 = 13;
    /// Three-plane shared-weight mode (bit 14)
    pub const THREE_PLANE_BIT: u32 = 14;

    // THRESH register

    /// Horizontal threshold 1 [7:0]
    pub const T_HOR1_SHIFT: u32 = 0;
    /// Horizontal threshold 2 [15:8]
    pub const T_HOR2_SHIFT: u32 = 8;
    /// Vertical threshold 1 [23:16]
    pub const T_VER1_SHIFT: u32 = 16;
    /// Vertical threshold 2 [31:24]
    pub const T_VER2_SHIFT: u32 = 24;

    // THRESH2 register

    /// Plane 2 horizontal threshold [7:0]
    pub const T_HOR3_SHIFT: u32 = 0;
    /// Plane 2 vertical threshold [23:16]
    pub const T_VER3_SHIFT: u32 = 16;

    pub const THRESH_MASK: u32 = 0xFF;
}

pub mod conv {
    //! Convolution CFG register fields.

    /// Kernel size code [2:0], valid values are 3 and 5
    pub const KERNEL_SIZE_MASK: u32 = 0x7;
    /// Clamp output to [0,1] (bit 3)
    pub const OUTPUT_CLAMP_BIT: u32 = 3;
    /// Absolute value of the convolution sum (bit 4)
    pub const ABS_BIT: u32 = 4;
    /// Square the (possibly absolute) sum (bit 5)
    pub const SQ_BIT: u32 = 5;
    /// Accumulate results above the threshold (bit 6)
    pub const ACCUM_BIT: u32 = 6;
    /// Output disable: consume pixels for accumulation only (bit 7)
    pub const OUTPUT_DISABLE_BIT: u32 = 7;
    /// Accumulation threshold as fp16 bits [23:8]
    pub const THRESHOLD_SHIFT: u32 = 8;
    pub const THRESHOLD_MASK: u32 = 0xFFFF;

    /// Coefficient matrix side and tap count
    pub const COEFF_DIM: usize = 5;
    pub const COEFF_COUNT: usize = COEFF_DIM * COEFF_DIM;
}

pub mod dbyr {
    //! Debayer CFG register fields.

    /// Bayer phase of pixel (0,0) [1:0]: 0=RGGB, 1=GRBG, 2=GBRG, 3=BGGR
    pub const BAYER_PATTERN_MASK: u32 = 0x3;
    /// Output luma only (bit 2)
    pub const LUMA_ONLY_BIT: u32 = 2;
    /// Force red/blue output channels to zero (bit 3)
    pub const FORCE_RB_ZERO_BIT: u32 = 3;
    /// Input data width in bits [7:4]
    pub const IN_WIDTH_SHIFT: u32 = 4;
    pub const IN_WIDTH_MASK: u32 = 0xF;
    /// Output data width in bits [11:8]
    pub const OUT_WIDTH_SHIFT: u32 = 8;
    pub const OUT_WIDTH_MASK: u32 = 0xF;
    /// Output channel order [14:12]
    pub const IMAGE_ORDER_SHIFT: u32 = 12;
    pub const IMAGE_ORDER_MASK: u32 = 0x7;
    /// Output planes per input Bayer plane [16:15]
    pub const PLANE_MULTIPLE_SHIFT: u32 = 15;
    pub const PLANE_MULTIPLE_MASK: u32 = 0x3;
    /// Gradient blend multiplier [31:24]
    pub const GRADIENT_MUL_SHIFT: u32 = 24;
    pub const GRADIENT_MUL_MASK: u32 = 0xFF;

    // THRESH register

    /// Luma threshold 1 [12:0]
    pub const THRESH1_MASK: u32 = 0x1FFF;
    /// Luma threshold 2 [24:13]
    pub const THRESH2_SHIFT: u32 = 13;
    pub const THRESH2_MASK: u32 = 0xFFF;

    // DEWORM register

    /// Deworm slope [15:0]
    pub const DEWORM_SLOPE_MASK: u32 = 0xFFFF;
    /// Deworm offset [31:16]
    pub const DEWORM_OFFSET_SHIFT: u32 = 16;
}

// ============================================================================
// Interrupt Groups
// ============================================================================

/// Interrupt group raised when a filter consumes input lines
pub const IRQ_GROUP_INPUT: usize = 0;

/// Interrupt group raised when a filter produces an output line
pub const IRQ_GROUP_OUTPUT: usize = 1;

/// Interrupt group raised at end-of-frame
pub const IRQ_GROUP_EOF: usize = 2;

/// Number of interrupt status/enable/clear groups
pub const IRQ_GROUP_COUNT: usize = 3;

// ============================================================================
// Kernel Geometry
// ============================================================================

/// Chroma denoise vertical kernel height
pub const CDN_VER_KERNEL: usize = 3;

/// Chroma denoise horizontal pass widths, pass 0 through 2
pub const CDN_HOR_KERNELS: [usize; 3] = [3, 5, 7];

/// Chroma denoise reference stream kernel height
pub const CDN_REF_KERNEL: usize = 3;

/// Debayer kernel height (AHD window plus homogeneity neighborhood)
pub const DBYR_KERNEL: usize = 11;

/// Largest vertical kernel any unit uses; sizes per-line scratch storage
pub const MAX_KERNEL_HEIGHT: usize = DBYR_KERNEL;

/// Largest plane count any buffer configuration can express
pub const MAX_PLANES: usize = 16;

// ============================================================================
// CMX Memory
// ============================================================================

/// Size of one CMX slice in bytes
pub const CMX_SLICE_SIZE: u32 = 0x20000;

/// Number of CMX slices in the local memory arena
pub const CMX_SLICE_COUNT: u32 = 16;

/// Total CMX arena size in bytes
pub const CMX_SIZE: usize = (CMX_SLICE_SIZE * CMX_SLICE_COUNT) as usize;

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_block_bases() {
        assert_eq!(unit_base(UNIT_CHROMA), 0x100);
        assert_eq!(unit_base(UNIT_CONV), 0x200);
        assert_eq!(unit_base(UNIT_DBYR), 0x300);
        assert_eq!(ADDRESS_SPACE_END, 0x400);
    }

    #[test]
    fn test_split_unit_addr() {
        assert_eq!(split_unit_addr(0x000), None);
        assert_eq!(split_unit_addr(0x0FF), None);
        assert_eq!(split_unit_addr(0x100), Some((UNIT_CHROMA, 0x00)));
        assert_eq!(split_unit_addr(0x158), Some((UNIT_CHROMA, unit::ICTX)));
        assert_eq!(split_unit_addr(0x278), Some((UNIT_CONV, conv_regs::COEFF_BASE)));
        assert_eq!(split_unit_addr(0x37C), Some((UNIT_DBYR, dbyr_regs::DEWORM_SHADOW)));
        assert_eq!(split_unit_addr(0x400), None);
    }

    #[test]
    fn test_port_groups_do_not_overlap() {
        assert_eq!(unit::IN_GRP + unit::GRP_SIZE, unit::OUT_GRP);
        assert_eq!(unit::OUT_GRP + unit::GRP_SIZE, unit::IN_FC);
        // Shadow twins stay inside their group
        assert!(unit::GRP_IR + unit::GRP_SHADOW < unit::GRP_SIZE);
    }

    #[test]
    fn test_conv_coefficients_fit_unit_block() {
        let last = conv_regs::coeff_reg(conv_regs::COEFF_COUNT - 1, true);
        assert!(last + 4 <= UNIT_BLOCK_SIZE);
        assert_eq!(conv_regs::coeff_reg(0, false), conv_regs::COEFF_BASE);
        assert_eq!(
            conv_regs::coeff_reg(0, true),
            conv_regs::COEFF_BASE + conv_regs::COEFF_COUNT as u32 * 4
        );
    }

    #[test]
    fn test_reference_group_fits_unit_block() {
        let last_shadow = chroma_regs::REF_GRP + unit::GRP_IR + unit::GRP_SHADOW;
        assert!(last_shadow < chroma_regs::REF_FC);
        assert!(chroma_regs::REF_ICTX + 4 <= UNIT_BLOCK_SIZE);
    }

    #[test]
    fn test_kernel_heights_are_odd() {
        assert_eq!(CDN_VER_KERNEL % 2, 1);
        assert_eq!(DBYR_KERNEL % 2, 1);
        for k in CDN_HOR_KERNELS {
            assert_eq!(k % 2, 1);
        }
    }
}
