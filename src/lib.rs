//! sipp-emu library
//!
//! Behavioral emulation of the SIPP image signal processing accelerator.

pub mod config;
pub mod device;
pub mod frame;
pub mod sim;
pub mod testing;
