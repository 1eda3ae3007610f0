use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use cavern_scripts::script_harness::{golden_path, load_fixture, matches_golden, run_fixture, HarnessOutput};
use env_logger::{Builder, Env};

const EXIT_ERROR: u8 = 1;
const EXIT_GOLDEN_MISMATCH: u8 = 2;
const EXIT_SCRIPT_FAILURES: u8 = 3;

fn main() -> ExitCode {
    Builder::from_env(Env::default().default_filter_or("warn")).init();
    match run_cli() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            log::error!(target: "harness", "{err:?}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run_cli() -> Result<u8> {
    let opts = parse_args()?;
    let mut mismatches = 0;
    let mut unclean = 0;

    for fixture_path in &opts.fixtures {
        let fixture = load_fixture(fixture_path)?;
        let output = run_fixture(&fixture)?;
        let label = fixture_label(fixture_path);
        println!("{}", output.summary_line(&label));
        report_problems(&output);
        if !output.is_clean() {
            unclean += 1;
        }

        if let Some(dir) = &opts.out_dir {
            write_output(&output, &dir.join(format!("{label}.json")))?;
        }
        if opts.bless {
            write_output(&output, &golden_path(fixture_path))?;
        } else if opts.check {
            let golden = golden_path(fixture_path);
            if !matches_golden(&output, &golden)? {
                mismatches += 1;
                println!("  golden mismatch: {} (rerun with --bless to refresh)", golden.display());
            }
        }
        if !opts.check && !opts.bless && opts.out_dir.is_none() {
            serde_json::to_writer_pretty(std::io::stdout(), &output).context("serializing harness output")?;
            println!();
        }
    }

    if mismatches > 0 {
        return Ok(EXIT_GOLDEN_MISMATCH);
    }
    if unclean > 0 && !opts.allow_failures {
        log::warn!(target: "harness", "{unclean} fixture(s) had rejected scripts or step failures");
        return Ok(EXIT_SCRIPT_FAILURES);
    }
    Ok(0)
}

fn report_problems(output: &HarnessOutput) {
    for rejected in &output.rejected {
        println!("  rejected {rejected}");
    }
    for step in &output.results {
        for failure in &step.failures {
            println!("  step {} failed {failure}", step.step);
        }
    }
}

fn write_output(output: &HarnessOutput, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating output directory '{}'", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("writing harness output to '{}'", path.display()))?;
    serde_json::to_writer_pretty(file, output).context("serializing harness output")?;
    log::info!(target: "harness", "wrote {}", path.display());
    Ok(())
}

fn fixture_label(path: &Path) -> String {
    path.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_else(|| "fixture".to_string())
}

struct CliOptions {
    fixtures: Vec<PathBuf>,
    out_dir: Option<PathBuf>,
    check: bool,
    bless: bool,
    allow_failures: bool,
}

fn parse_args() -> Result<CliOptions> {
    let mut opts = CliOptions { fixtures: Vec::new(), out_dir: None, check: false, bless: false, allow_failures: false };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--out-dir" | "-o" => {
                opts.out_dir = Some(args.next().map(PathBuf::from).ok_or_else(|| anyhow!("--out-dir needs a path"))?)
            }
            "--check" | "-c" => opts.check = true,
            "--bless" => opts.bless = true,
            "--allow-failures" => opts.allow_failures = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            flag if flag.starts_with('-') => return Err(anyhow!("unknown argument '{flag}'")),
            fixture => opts.fixtures.push(PathBuf::from(fixture)),
        }
    }
    if opts.fixtures.is_empty() {
        return Err(anyhow!("at least one fixture path is required"));
    }
    Ok(opts)
}

fn print_help() {
    println!("Usage: script_harness [--check | --bless] [--out-dir <dir>] [--allow-failures] <fixture.json>...");
    println!("  -c, --check          Compare each run with <fixture stem>.golden.json next to the fixture");
    println!("      --bless          Rewrite the golden files from this run");
    println!("  -o, --out-dir        Write <fixture stem>.json outputs into this directory");
    println!("      --allow-failures Exit 0 even when scripts were rejected or steps failed");
    println!("Exit codes: 1 error, 2 golden mismatch, 3 rejected scripts or step failures");
}
