use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};

const EBPF_DIR: &str = "crates/ebpf-engine/ebpf";
const EBPF_TARGET: &str = "bpfel-unknown-none";
const EBPF_BIN: &str = "infw-ebpf";

/// infw 빌드 태스크
#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// XDP 분류기 빌드
    BuildEbpf {
        /// 릴리스 모드로 빌드
        #[arg(long)]
        release: bool,

        /// 빌드된 오브젝트를 복사할 경로 (`firewall.bpf_object`)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::BuildEbpf { release, out } => build_ebpf(release, out.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("{msg}");
            ExitCode::FAILURE
        }
    }
}

fn build_ebpf(release: bool, out: Option<&Path>) -> Result<(), String> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(EBPF_DIR);

    cmd.args([
        "+nightly",
        "build",
        &format!("--target={EBPF_TARGET}"),
        "-Z",
        "build-std=core",
    ]);

    if release {
        cmd.arg("--release");
    }

    let status = cmd
        .status()
        .map_err(|e| format!("failed to run cargo for the eBPF program: {e}"))?;
    if !status.success() {
        return Err(format!("eBPF build failed ({status})"));
    }

    let profile = if release { "release" } else { "debug" };
    let artifact = Path::new(EBPF_DIR)
        .join("target")
        .join(EBPF_TARGET)
        .join(profile)
        .join(EBPF_BIN);
    println!("eBPF build succeeded: {}", artifact.display());

    if let Some(out) = out {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
        }
        std::fs::copy(&artifact, out).map_err(|e| {
            format!(
                "failed to copy {} to {}: {e}",
                artifact.display(),
                out.display()
            )
        })?;
        println!("copied to {}", out.display());
    }

    Ok(())
}
