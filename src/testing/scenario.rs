//! TOML-described filter scenarios.
//!
//! A scenario names the filter to drive, the frame geometry, the port buffer
//! windows, the parameter registers to program and the expectation to grade
//! the produced frame against:
//!
//! ```toml
//! [scenario]
//! name = "conv_identity"
//! description = "3x3 identity kernel reproduces the input"
//!
//! [pipeline]
//! filter = "conv"
//! width = 16
//! height = 8
//!
//! [buffers.input]
//! lines = 4
//! format = "f16"
//!
//! [buffers.input.pattern]
//! type = "sequential"
//! start = 0
//! step = 1
//!
//! [buffers.output]
//! lines = 2
//! format = "f16"
//!
//! [params]
//! cfg = 3
//! coeffs = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0]
//!
//! [expected]
//! type = "identity"
//! ```
//!
//! Buffer tables are named `input`, `output` and (for the chroma unit)
//! `reference`. A buffer with `lines = 0` holds the whole frame; a positive
//! line count makes it a circular window fed through the fill counters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use serde::Deserialize;

use crate::device::filters::conv::f32_to_f16;
use crate::device::memory::SliceGeometry;
use crate::device::sipp_spec::{chroma_regs, conv_regs, dbyr_regs};
use crate::frame::{Frame, SampleFormat};
use crate::sim::{FilterKind, FrameRunner, PortLayout, RunnerConfig};

/// One scenario file.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub scenario: ScenarioInfo,
    pub pipeline: PipelineDef,
    pub buffers: HashMap<String, BufferDef>,
    #[serde(default)]
    pub params: ParamsDef,
    pub expected: ExpectedDef,
    /// Directory the scenario was loaded from; resolves `file` patterns.
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// Scenario metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Filter selection and frame geometry.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineDef {
    pub filter: String,
    pub width: u32,
    pub height: u32,
}

/// One port buffer: window shape plus an optional synthesis pattern.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferDef {
    /// Circular depth in lines, 0 for a whole-frame region
    #[serde(default)]
    pub lines: u32,
    pub format: String,
    #[serde(default = "default_planes")]
    pub planes: u32,
    #[serde(default)]
    pub start_level: u32,
    #[serde(default)]
    pub pattern: Option<PatternDef>,
}

fn default_planes() -> u32 {
    1
}

/// Pattern for synthesizing frame data.
#[derive(Debug, Clone, Deserialize)]
pub struct PatternDef {
    #[serde(rename = "type")]
    pub pattern_type: String,
    #[serde(default)]
    pub value: i64,
    #[serde(default)]
    pub start: i64,
    #[serde(default = "default_step")]
    pub step: i64,
    #[serde(default)]
    pub file: Option<String>,
}

fn default_step() -> i64 {
    1
}

/// Parameter registers to program, routed per filter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ParamsDef {
    pub cfg: Option<u32>,
    pub thresh: Option<u32>,
    pub thresh2: Option<u32>,
    pub deworm: Option<u32>,
    pub coeffs: Option<Vec<f32>>,
}

/// Expected frame definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ExpectedDef {
    #[serde(rename = "type")]
    pub expected_type: String,
    #[serde(default)]
    pub value: Option<i64>,
}

/// Sample encoding used by a scenario buffer. `F16` stores half-float bit
/// patterns in 16-bit samples; integer pattern values are encoded through
/// the float conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    U8,
    U16,
    F16,
}

impl PixelFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "u8" => Some(PixelFormat::U8),
            "u16" => Some(PixelFormat::U16),
            "f16" => Some(PixelFormat::F16),
            _ => None,
        }
    }

    /// Bytes per pixel on the wire.
    pub fn bytes(self) -> u32 {
        match self {
            PixelFormat::U8 => 1,
            PixelFormat::U16 | PixelFormat::F16 => 2,
        }
    }

    /// Storage format of the backing frame.
    pub fn storage(self) -> SampleFormat {
        match self {
            PixelFormat::U8 => SampleFormat::U8,
            PixelFormat::U16 | PixelFormat::F16 => SampleFormat::U16,
        }
    }

    /// Encode an integer pattern value as a stored sample.
    pub fn encode(self, value: i64) -> u16 {
        match self {
            PixelFormat::U8 => value as u8 as u16,
            PixelFormat::U16 => value as u16,
            PixelFormat::F16 => f32_to_f16(value as f32),
        }
    }
}

/// Result of running one scenario.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    /// Samples compared
    pub checked: usize,
    pub mismatches: usize,
    pub first_mismatch: Option<Mismatch>,
    /// End-of-frame interrupts delivered during the run
    pub eof_count: u32,
    pub output: Frame,
}

/// First sample that differed, in stored sample bits.
#[derive(Debug, Clone, Copy)]
pub struct Mismatch {
    pub plane: u32,
    pub line: u32,
    pub column: u32,
    pub expected: u16,
    pub actual: u16,
}

impl ScenarioOutcome {
    /// Print a pass/fail line (and the first mismatch) to stdout.
    pub fn print_summary(&self) {
        if self.passed {
            println!(
                "PASS {} ({} samples, {} eof)",
                self.name, self.checked, self.eof_count
            );
        } else {
            println!(
                "FAIL {} ({} of {} samples wrong)",
                self.name, self.mismatches, self.checked
            );
            if let Some(m) = &self.first_mismatch {
                println!(
                    "  first mismatch at plane {} line {} col {}: expected {:#06x}, got {:#06x}",
                    m.plane, m.line, m.column, m.expected, m.actual
                );
            }
        }
    }
}

impl Scenario {
    /// Load a scenario from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        let mut scenario: Scenario = toml::from_str(&content)
            .with_context(|| format!("parsing scenario {}", path.display()))?;
        scenario.base_dir = path.parent().map(Path::to_path_buf);
        Ok(scenario)
    }

    /// Resolve the runner configuration the scenario describes.
    pub fn runner_config(&self) -> Result<RunnerConfig> {
        let filter = FilterKind::from_name(&self.pipeline.filter)
            .with_context(|| format!("unknown filter '{}'", self.pipeline.filter))?;
        Ok(RunnerConfig {
            filter,
            width: self.pipeline.width,
            height: self.pipeline.height,
            input: self.port_layout("input")?,
            output: self.port_layout("output")?,
            reference: match self.buffers.contains_key("reference") {
                true => Some(self.port_layout("reference")?),
                false => None,
            },
            slice: Default::default(),
        })
    }

    /// Build a runner and program the scenario's parameter registers.
    pub fn build_runner(&self) -> Result<FrameRunner> {
        self.build_runner_with(None)
    }

    /// Build a runner with an overridden CMX slice geometry.
    pub fn build_runner_with(&self, slice: Option<SliceGeometry>) -> Result<FrameRunner> {
        let mut config = self.runner_config()?;
        if let Some(slice) = slice {
            config.slice = slice;
        }
        let mut runner = FrameRunner::new(config)?;
        self.apply_params(&mut runner)?;
        Ok(runner)
    }

    /// Run the scenario end to end.
    pub fn run(&self) -> Result<ScenarioOutcome> {
        let mut runner = self.build_runner()?;
        self.run_with(&mut runner)
    }

    /// Run the scenario on an already-built runner.
    pub fn run_with(&self, runner: &mut FrameRunner) -> Result<ScenarioOutcome> {
        let input = self.synthesize("input")?;
        let reference = match self.buffers.contains_key("reference") {
            true => Some(self.synthesize("reference")?),
            false => None,
        };
        let output = runner.run_frame(&input, reference.as_ref())?;
        self.judge(&input, output, runner.eof_count())
    }

    /// Synthesize the named buffer's frame from its pattern.
    pub fn synthesize(&self, name: &str) -> Result<Frame> {
        let def = self.buffer(name)?;
        let fmt = self.pixel_format(name)?;
        let pattern = def
            .pattern
            .as_ref()
            .with_context(|| format!("buffer '{}' has no pattern", name))?;
        let width = self.pipeline.width;
        let height = self.pipeline.height;

        if pattern.pattern_type == "file" {
            let file = pattern
                .file
                .as_ref()
                .with_context(|| format!("buffer '{}' needs a file path", name))?;
            let path = match &self.base_dir {
                Some(dir) => dir.join(file),
                None => PathBuf::from(file),
            };
            let frame = Frame::from_file(&path)
                .with_context(|| format!("loading frame {}", path.display()))?;
            ensure!(
                frame.width == width && frame.height == height && frame.planes == def.planes,
                "frame file {} does not match the pipeline geometry",
                path.display()
            );
            ensure!(
                frame.format == fmt.storage(),
                "frame file {} stores a different sample width",
                path.display()
            );
            return Ok(frame);
        }

        let mut frame = Frame::new(width, height, def.planes, fmt.storage());
        match pattern.pattern_type.as_str() {
            "constant" => frame.data.fill(fmt.encode(pattern.value)),
            "sequential" => {
                for (i, sample) in frame.data.iter_mut().enumerate() {
                    *sample = fmt.encode(pattern.start + i as i64 * pattern.step);
                }
            }
            "zeros" => {}
            other => bail!("unknown pattern type '{}'", other),
        }
        Ok(frame)
    }

    fn buffer(&self, name: &str) -> Result<&BufferDef> {
        self.buffers
            .get(name)
            .with_context(|| format!("scenario defines no [buffers.{}] table", name))
    }

    fn pixel_format(&self, name: &str) -> Result<PixelFormat> {
        let def = self.buffer(name)?;
        PixelFormat::from_name(&def.format)
            .with_context(|| format!("buffer '{}' has unknown format '{}'", name, def.format))
    }

    fn port_layout(&self, name: &str) -> Result<PortLayout> {
        let def = self.buffer(name)?;
        let fmt = self.pixel_format(name)?;
        Ok(PortLayout {
            lines: def.lines,
            planes: def.planes,
            bytes: fmt.bytes(),
            start_level: def.start_level,
        })
    }

    /// Program the parameter registers that apply to the scenario's filter.
    fn apply_params(&self, runner: &mut FrameRunner) -> Result<()> {
        let p = &self.params;
        match runner.config().filter {
            FilterKind::Chroma => {
                write_opt(runner, chroma_regs::CFG, p.cfg)?;
                write_opt(runner, chroma_regs::THRESH, p.thresh)?;
                write_opt(runner, chroma_regs::THRESH2, p.thresh2)?;
                ensure!(
                    p.deworm.is_none() && p.coeffs.is_none(),
                    "deworm and coeffs do not apply to the chroma denoise unit"
                );
            }
            FilterKind::Conv => {
                write_opt(runner, conv_regs::CFG, p.cfg)?;
                if let Some(coeffs) = &p.coeffs {
                    runner.set_coefficients(coeffs)?;
                }
                ensure!(
                    p.thresh.is_none() && p.thresh2.is_none() && p.deworm.is_none(),
                    "threshold and deworm registers do not apply to the convolution unit"
                );
            }
            FilterKind::Debayer => {
                write_opt(runner, dbyr_regs::CFG, p.cfg)?;
                write_opt(runner, dbyr_regs::THRESH, p.thresh)?;
                write_opt(runner, dbyr_regs::DEWORM, p.deworm)?;
                ensure!(
                    p.thresh2.is_none() && p.coeffs.is_none(),
                    "thresh2 and coeffs do not apply to the debayer unit"
                );
            }
        }
        Ok(())
    }

    /// Grade the produced frame against the expectation.
    fn judge(&self, input: &Frame, output: Frame, eof_count: u32) -> Result<ScenarioOutcome> {
        let expected: Vec<u16> = match self.expected.expected_type.as_str() {
            "identity" => {
                ensure!(
                    output.data.len() == input.data.len(),
                    "an identity expectation needs matching input and output sizes"
                );
                input.data.clone()
            }
            "constant" => {
                let value = self
                    .expected
                    .value
                    .context("a constant expectation needs a value")?;
                let fmt = self.pixel_format("output")?;
                vec![fmt.encode(value); output.data.len()]
            }
            other => bail!("unknown expectation type '{}'", other),
        };

        let mut mismatches = 0usize;
        let mut first_mismatch = None;
        for (i, (&want, &got)) in expected.iter().zip(output.data.iter()).enumerate() {
            if want != got {
                mismatches += 1;
                if first_mismatch.is_none() {
                    let i = i as u32;
                    let per_plane = output.width * output.height;
                    first_mismatch = Some(Mismatch {
                        plane: i / per_plane,
                        line: i % per_plane / output.width,
                        column: i % output.width,
                        expected: want,
                        actual: got,
                    });
                }
            }
        }

        Ok(ScenarioOutcome {
            name: self.scenario.name.clone(),
            passed: mismatches == 0,
            checked: expected.len(),
            mismatches,
            first_mismatch,
            eof_count,
            output,
        })
    }
}

fn write_opt(runner: &mut FrameRunner, offset: u32, value: Option<u32>) -> Result<()> {
    if let Some(v) = value {
        runner.write_param(offset, v)?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
