//! Device model and register definitions for the SIPP accelerator.
//!
//! This module provides:
//! - The register address map for the global block and the filter units
//! - CMX memory with the sliced line-buffer addressing scheme
//! - Banked line-buffer state (fill levels, buffer indices, start bits)
//! - The shared filter dispatch contract and the three filter units
//! - The register file front-end that ties everything together
//!
//! # Architecture Overview
//!
//! The SIPP block is a set of fixed-function image filters streaming lines
//! through circular buffers in CMX memory:
//!
//! ```text
//!              +-------------------------------+
//!              |          CMX memory           |
//!              |   16 slices x 128 KiB each    |
//!              +---^------------^------------^-+
//!                  |            |            |      line buffers
//!          +-------+---+  +-----+-----+  +---+-------+
//!          |  chroma   |  |  conv     |  |  AHD      |
//!          |  denoise  |  |  5x5      |  |  debayer  |
//!          |  unit 0   |  |  unit 1   |  |  unit 2   |
//!          +-----------+  +-----------+  +-----------+
//!                  register file, 0x000 - 0x400
//! ```
//!
//! Software programs buffer geometry and filter parameters through 32-bit
//! register writes, then drives the pipeline by reporting line production
//! and consumption through the fill-control registers. Each such report can
//! trigger a drain: the filter produces every line its buffers currently
//! allow, raising buffer and end-of-frame interrupts along the way.
//!
//! # Example
//!
//! ```
//! use sipp_emu::device::{SippDevice, sipp_spec};
//!
//! let mut dev = SippDevice::new();
//!
//! // Program the convolution unit for a 64x48 frame
//! let base = sipp_spec::unit_base(sipp_spec::UNIT_CONV);
//! dev.reg_write(base + sipp_spec::unit::FRM_DIM, (48 << 16) | 64).unwrap();
//! assert_eq!(dev.reg_read(base + sipp_spec::unit::FRM_DIM), (48 << 16) | 64);
//! ```

pub mod sipp_spec;
pub mod memory;
pub mod buffer;
pub mod irq;
pub mod filter;
pub mod filters;
pub mod registers;

pub use memory::{CmxMemory, SliceGeometry};
pub use buffer::{Bank, Geometry, LineBuffer, Port};
pub use irq::{InterruptController, IrqCallback};
pub use filter::{FilterCore, FilterUnit};
pub use filters::{ChromaDenoise, Convolution, Debayer};
pub use registers::SippDevice;

use thiserror::Error;

/// Errors surfaced by the device model. Real hardware has no error path on
/// the register interface; these mark host programming mistakes that silicon
/// would turn into silent corruption or a hang.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// Access past the end of CMX.
    #[error("CMX access out of range: offset 0x{offset:08X} len {len}")]
    CmxRange { offset: u32, len: usize },

    /// Fill level decremented below zero.
    #[error("Fill level underflow on {port} buffer")]
    FillUnderflow { port: &'static str },

    /// Fill level incremented past the circular depth.
    #[error("Fill level overflow on {port} buffer: capacity {capacity} lines")]
    FillOverflow { port: &'static str, capacity: u32 },

    /// Convolution kernel size code outside the supported set.
    #[error("Unsupported convolution kernel size {size}, must be 3 or 5")]
    InvalidKernelSize { size: u32 },

    /// Chroma denoise thresholds would zero the filter weight.
    #[error("Invalid denoise thresholds: every axis needs a non-zero threshold")]
    DenoiseThresholds,

    /// Sample width wider than the buffer cell format holds.
    #[error("Data width {width} bits does not fit a {bytes}-byte sample cell")]
    DataWidth { width: u32, bytes: u32 },

    /// Plane count outside what the configured mode supports.
    #[error("Unsupported plane count {planes}, at most {max}")]
    PlaneCount { planes: u32, max: u32 },
}

/// Diagnostic name of a filter unit.
pub fn unit_name(unit: usize) -> &'static str {
    match unit {
        sipp_spec::UNIT_CHROMA => "cdn",
        sipp_spec::UNIT_CONV => "conv",
        sipp_spec::UNIT_DBYR => "dbyr",
        _ => "???",
    }
}
