//! The filter units.
//!
//! Each filter owns a [`FilterCore`](crate::device::filter::FilterCore) and
//! implements [`FilterUnit`](crate::device::filter::FilterUnit) with its own
//! parameter latch, validation and per-line numerics:
//!
//! - [`chroma`]: weighted-average chroma denoise with an optional reference
//!   stream and a shared-weight three-plane mode
//! - [`conv`]: programmable 3x3/5x5 convolution over fp16 data with a
//!   statistics accumulator
//! - [`debayer`]: adaptive homogeneity-directed demosaic of raw Bayer data

pub mod chroma;
pub mod conv;
pub mod debayer;

pub use chroma::ChromaDenoise;
pub use conv::Convolution;
pub use debayer::Debayer;
