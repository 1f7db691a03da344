use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;

const EBPF_PACKAGE: &str = "qscope-ebpf";
const EBPF_BIN: &str = "qscope";

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Build the probe object embedded by the qscope build script
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
    },
    /// Build everything and run qscope as root
    Run {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Arguments passed through to qscope
        #[arg(last = true)]
        qscope_args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target } => build_ebpf(&target)?,
        Cmd::Run { target, qscope_args } => {
            build_ebpf(&target)?;
            run(&qscope_args)?;
        }
    }

    Ok(())
}

fn build_ebpf(target: &str) -> Result<()> {
    // Release only: debug builds pull in formatting code the BPF linker rejects
    let status = Command::new("cargo")
        .arg("+nightly")
        .arg("build")
        .arg("--package")
        .arg(EBPF_PACKAGE)
        .arg("--target")
        .arg(target)
        .arg("-Z")
        .arg("build-std=core")
        .arg("--release")
        .status()
        .context("Failed to build eBPF program")?;

    if !status.success() {
        bail!("Failed to build eBPF program");
    }

    let object = PathBuf::from("target").join(target).join("release").join(EBPF_BIN);
    println!("✓ eBPF program built successfully");
    println!("  Object: {}", object.display());

    Ok(())
}

fn run(qscope_args: &[String]) -> Result<()> {
    let status = Command::new("cargo")
        .args(["build", "--package", "qscope", "--release"])
        .status()
        .context("Failed to build qscope")?;
    if !status.success() {
        bail!("Failed to build qscope");
    }

    let status = Command::new("sudo")
        .arg("-E")
        .arg("target/release/qscope")
        .args(qscope_args)
        .status()
        .context("Failed to run qscope")?;
    if !status.success() {
        bail!("qscope exited with {status}");
    }
    Ok(())
}
