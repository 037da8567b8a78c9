//! sipp-emu: behavioral emulator for the SIPP image filter block

use std::env;
use std::path::{Path, PathBuf};

use sipp_emu::config::Config;
use sipp_emu::frame::Frame;
use sipp_emu::testing::Scenario;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args: Vec<String> = env::args().collect();

    // Parse options
    let mut dump_state = false;
    let mut save_output: Option<String> = None;
    let mut path: Option<String> = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dump-state" => dump_state = true,
            "--save-output" => {
                save_output = iter.next().cloned();
                if save_output.is_none() {
                    anyhow::bail!("--save-output needs a file path");
                }
            }
            "--sample-config" => {
                print!("{}", Config::sample_config());
                return Ok(());
            }
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other if !other.starts_with('-') => path = Some(other.to_string()),
            other => anyhow::bail!("unknown option '{}'", other),
        }
    }

    let path = match path {
        Some(p) => p,
        None => {
            print_usage();
            return Ok(());
        }
    };
    println!("Loading: {}", path);
    println!();

    // Detect format by extension
    if path.ends_with(".toml") {
        return run_scenario(&path, dump_state, save_output.as_deref());
    }

    show_frame(&path)
}

fn print_usage() {
    println!("Usage: sipp-emu [OPTIONS] <scenario.toml | frame file>");
    println!();
    println!("Runs a filter scenario against the emulated SIPP block, or prints");
    println!("a summary of a stored frame file.");
    println!();
    println!("Options:");
    println!("  --dump-state          print the device register state after the run");
    println!("  --save-output <path>  save the produced frame");
    println!("  --sample-config       print a sample config file and exit");
    println!("  --help, -h            show this message");
}

/// Run a scenario file and grade the frame it produces.
fn run_scenario(path: &str, dump_state: bool, save_output: Option<&str>) -> anyhow::Result<()> {
    let resolved = resolve(path, &Config::get().scenario_dir());
    let scenario = Scenario::from_file(&resolved)?;
    let mut runner = scenario.build_runner_with(Config::get().slice_geometry())?;
    let outcome = scenario.run_with(&mut runner)?;

    outcome.print_summary();

    if dump_state {
        println!();
        runner.print_summary();
    }

    if let Some(out_path) = save_output {
        outcome.output.save(out_path)?;
        println!();
        println!("Saved output frame to {}", out_path);
    }

    if !outcome.passed {
        anyhow::bail!("scenario '{}' failed", outcome.name);
    }

    Ok(())
}

/// Load and summarize a stored frame file.
fn show_frame(path: &str) -> anyhow::Result<()> {
    let resolved = resolve(path, &Config::get().frame_dir());
    let frame = Frame::from_file(&resolved)?;
    frame.print_summary();
    Ok(())
}

/// Resolve a path directly, then against the configured directory.
fn resolve(path: &str, dir: &str) -> PathBuf {
    let direct = PathBuf::from(path);
    if direct.exists() {
        return direct;
    }
    let nested = Path::new(dir).join(path);
    if nested.exists() {
        log::info!("Resolved {} to {}", path, nested.display());
        return nested;
    }
    direct
}
