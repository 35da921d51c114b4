// ============================================
// FFU Builder - main.rs
// ============================================
// Command-line entry point.
//
//   ffubuilder build   --config build.toml   run a full build
//   ffubuilder check   --config build.toml   validate config + host readiness
//   ffubuilder cleanup --work-dir C:\FFU      sweep state left by a crashed build
//
// This file only wires the real Windows tools into a Toolchain and reports
// the result. Everything else lives in the library.
// ============================================

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use ffubuilder::cleanup;
use ffubuilder::config::{BuildConfig, BuildContext};
use ffubuilder::disk::diskpart::DiskpartBackend;
use ffubuilder::disk::native::NativeBackend;
use ffubuilder::disk::{self, BackendKind, DiskBackend};
use ffubuilder::dism::Dism;
use ffubuilder::hypervisor::{HyperV, HypervisorProvider};
use ffubuilder::media::DiskImageCmdlets;
use ffubuilder::partition::StorageCmdlets;
use ffubuilder::pipeline::{self, Toolchain};
use ffubuilder::registry::RegExe;
use ffubuilder::services::{ScServiceControl, ServiceReadinessChecker};
use ffubuilder::volume;

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Parser, Debug)]
#[command(name = "ffubuilder", version, about = "Build flashable Windows FFU images")]
struct Cli {
    /// env_logger-style filter string (e.g. "info,ffubuilder::disk=debug"); overrides RUST_LOG
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full build from a .toml config or .json profile
    Build {
        #[arg(long)]
        config: PathBuf,
    },
    /// Validate a config and check the imaging services, without changing anything
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Remove stale mounts and orphaned temporary disks from an earlier build
    Cleanup {
        #[arg(long)]
        work_dir: PathBuf,
    },
}

fn init_logging(cli_filter: Option<&str>) {
    let env = Env::default().default_filter_or(DEFAULT_LOG_FILTER);
    let mut builder = env_logger::Builder::from_env(env);
    if let Some(filter) = cli_filter {
        builder.parse_filters(filter);
    }
    builder.format_timestamp_secs();
    builder.format(|buf, record| {
        let ts = buf.timestamp();
        writeln!(buf, "[{} {:<5} {}] {}", ts, record.level(), record.target(), record.args())
    });
    builder.init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_filter.as_deref());
    log::info!("FFU Builder v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Command::Build { config } => build(&config),
        Command::Check { config } => check(&config),
        Command::Cleanup { work_dir } => sweep(&work_dir),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: &Path) -> Result<BuildConfig> {
    let config = BuildConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

// ============================================
// BUILD
// ============================================

fn build(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let ctx = BuildContext::from_config(&config);

    let kind = disk::choose_backend(ctx.disk.backend, &ctx.disk.path, NativeBackend::is_available());
    log::info!("Using the {} disk backend", kind);
    let native = NativeBackend;
    let diskpart = DiskpartBackend::new(ctx.script_dir());
    let disks: &dyn DiskBackend = match kind {
        BackendKind::Native => &native,
        BackendKind::Diskpart => &diskpart,
    };

    let partitions = StorageCmdlets::new(ctx.script_dir());
    let imaging = Dism::new(Some(ctx.work_dir.join("Logs").join("dism.log")));
    let media = DiskImageCmdlets;
    let services = ScServiceControl;
    let registry = RegExe;
    let hyperv = HyperV;
    let hypervisor: Option<&dyn HypervisorProvider> = ctx.vm.as_ref().map(|_| &hyperv as &dyn HypervisorProvider);

    let tools = Toolchain {
        disks,
        partitions: &partitions,
        imaging: &imaging,
        media: &media,
        services: &services,
        registry: &registry,
        hypervisor,
    };

    match pipeline::run(&ctx, &tools) {
        Ok(outcome) => {
            log::info!("FFU ready: {}", outcome.ffu.display());
            if let Some(version) = &outcome.os_version {
                log::info!("Image: {} {} build {}", version.release(), version.sku(), version.build());
            }
            for failure in &outcome.cleanup_failures {
                log::warn!("Left behind: {}", failure);
            }
            Ok(())
        }
        Err(e) => {
            log::error!("Build failed: {}", e);
            log::error!("Things to try:");
            for (i, step) in e.remediation().iter().enumerate() {
                log::error!("  {}. {}", i + 1, step);
            }
            Err(e.into())
        }
    }
}

// ============================================
// CHECK
// ============================================

fn check(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let ctx = BuildContext::from_config(&config);
    log::info!("Config is valid");

    let services = ScServiceControl;
    if !ServiceReadinessChecker::new(&services, &ctx.timings).ensure_ready() {
        anyhow::bail!("imaging services are not ready; see the warnings above");
    }

    let probe = if ctx.capture_dir.exists() { &ctx.capture_dir } else { &ctx.work_dir };
    match volume::free_space(probe) {
        Some(free) => log::info!("Free space at {}: {}", probe.display(), volume::format_size(free)),
        None => log::info!("Free space at {} could not be determined", probe.display()),
    }
    log::info!("Host is ready to build");
    Ok(())
}

// ============================================
// CLEANUP
// ============================================

fn sweep(work_dir: &Path) -> Result<()> {
    let imaging = Dism::new(None);
    // diskpart detaches by file path whether or not Hyper-V is installed
    let disks = DiskpartBackend::new(work_dir.join("scripts"));
    let report = cleanup::sweep_stale_state(work_dir, &imaging, &disks);
    log::info!("Cleanup released {} item(s)", report.released);
    for failure in &report.failures {
        log::warn!("Could not clean up {}", failure);
    }
    Ok(())
}
