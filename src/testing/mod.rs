//! Scenario harness for end-to-end filter runs.
//!
//! Scenarios are TOML files pairing synthetic input frames with an expected
//! outcome. The harness builds a [`FrameRunner`](crate::sim::FrameRunner)
//! from the file, pushes the frame through the filter and grades every
//! produced sample.

pub mod scenario;

pub use scenario::{Mismatch, PixelFormat, Scenario, ScenarioOutcome};
