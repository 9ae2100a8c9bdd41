//! Hot-plug validator entry point.
//!
//! Resolves the requested resources, runs remove/add/recover cycles against
//! sysfs (or the in-memory simulation) and writes the run report.

mod signals;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hotplug_common::{
    Clock, DeviceClass, HotplugConfig, ManualClock, OrderingKind, PollWaiter, ResourceDescriptor,
    SystemClock,
};
use hotplug_runtime::{
    CancelFlag, LifecycleOrchestrator, OrchestratorConfig, RecoverySuite, RunReport,
};
use hotplug_sysfs::{
    simulated_resource, AddressRegistry, ExcludedResource, LinkProbe, MultipathdProbe,
    OrderingStrategy, PathProbe, PingProbe, ReachabilityProbe, Resolution, ResourceControl,
    SimulatedControl, SimulatedLinkProbe, SimulatedPathProbe, SimulatedReachability, SysfsControl,
    SysfsLinkProbe,
};
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::signals::SignalHandler;

/// Exit code for a run where some resource failed.
const EXIT_FAILED: u8 = 1;
/// Exit code for configuration and setup errors.
const EXIT_CONFIG: u8 = 2;

/// Link-up delay of the simulated adapters.
const SIMULATED_LINK_DELAY: Duration = Duration::from_secs(3);

/// Hot-plug validator command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "hotplug-cli",
    about = "Hot-plug validator - remove, re-add and verify recovery of PCI adapters and CPUs",
    version,
    long_about = None
)]
struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run hot-plug cycles.
    Run(RunArgs),
    /// Print the effective configuration.
    Config(RunArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Resource descriptor: PCI address, `cpuN`, a CPU index or `core:N`. Repeatable.
    #[arg(long = "resource", short = 'r', value_name = "DESCRIPTOR")]
    resources: Vec<String>,

    /// Cycles per resource.
    #[arg(long, short = 'n')]
    iterations: Option<u32>,

    /// Shuffle the order every iteration.
    #[arg(long)]
    random_order: bool,

    /// Seed for the random order (implies --random-order).
    #[arg(long)]
    seed: Option<u64>,

    /// Peer address for network reachability checks.
    #[arg(long)]
    peer: Option<IpAddr>,

    /// One worker thread per control path.
    #[arg(long)]
    parallel: bool,

    /// Wall-clock budget for the whole run ("90m", "2h").
    #[arg(long, value_parser = humantime::parse_duration)]
    budget: Option<Duration>,

    /// Use the in-memory simulation instead of sysfs.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Write the JSON run report to this file.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting hot-plug validator");

    let result = match &cli.command {
        Command::Run(args) => run(&cli, args),
        Command::Config(args) => show_config(&cli, args),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "hotplug_cli={level},hotplug_runtime={level},hotplug_sysfs={level},hotplug_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `HOTPLUG_CONFIG_PATH` environment variable
/// 3. `/etc/hotplug/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(cli: &Cli) -> Result<HotplugConfig> {
    // 1. Command-line argument (highest priority)
    if let Some(config_path) = &cli.config {
        info!(?config_path, "Loading config from command-line argument");
        return HotplugConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    // 2. Environment variable
    if let Ok(env_path) = std::env::var("HOTPLUG_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from HOTPLUG_CONFIG_PATH");
            return HotplugConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from HOTPLUG_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "HOTPLUG_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    // 3. System path
    let system_path = PathBuf::from("/etc/hotplug/config.toml");
    if system_path.exists() {
        info!(?system_path, "Loading config from system path");
        return HotplugConfig::from_file(&system_path)
            .with_context(|| format!("Failed to load config from {system_path:?}"));
    }

    // 4. Local development path
    let local_path = PathBuf::from("config/default.toml");
    if local_path.exists() {
        info!(?local_path, "Loading config from local path");
        return HotplugConfig::from_file(&local_path)
            .with_context(|| format!("Failed to load config from {local_path:?}"));
    }

    // 5. Built-in defaults
    info!("No config file found, using built-in defaults");
    Ok(HotplugConfig::default())
}

/// Apply command-line overrides on top of the file configuration.
fn apply_overrides(config: &mut HotplugConfig, args: &RunArgs) {
    if !args.resources.is_empty() {
        config.resources.clone_from(&args.resources);
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if args.random_order || args.seed.is_some() {
        config.ordering.strategy = OrderingKind::SeededRandom;
    }
    if args.seed.is_some() {
        config.ordering.seed = args.seed;
    }
    if args.peer.is_some() {
        config.recovery.network.peer = args.peer;
    }
    if args.parallel {
        config.run.parallel = true;
    }
    if args.budget.is_some() {
        config.run.budget = args.budget;
    }
}

fn show_config(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let mut config = load_config(cli)?;
    apply_overrides(&mut config, args);
    print!("{}", config.to_toml().context("Failed to serialize config")?);
    Ok(ExitCode::SUCCESS)
}

fn run(cli: &Cli, args: &RunArgs) -> Result<ExitCode> {
    let mut config = load_config(cli)?;
    apply_overrides(&mut config, args);

    if config.resources.is_empty() {
        bail!("no resources given; pass --resource or set `resources` in the config file");
    }

    let strategy = OrderingStrategy::from_config(&config.ordering);
    info!(
        iterations = config.iterations,
        %strategy,
        peer = ?config.recovery.network.peer,
        sysfs_root = %config.sysfs.root.display(),
        "Configuration loaded"
    );

    let cancel = CancelFlag::new();
    let signal_handler =
        SignalHandler::new(cancel.clone()).context("Failed to set up signal handlers")?;

    let (resolution, orchestrator) = if args.simulated {
        build_simulated(&config)
    } else {
        build_sysfs(&config)
    };
    if resolution.resources.is_empty() {
        bail!("none of the requested resources could be resolved");
    }

    let report = orchestrator
        .with_cancel(cancel)
        .run_resolution(&resolution, strategy);

    if signal_handler.cancelled() {
        warn!(signals = signal_handler.state().signal_count(), "Run cancelled by signal");
    }

    write_report(&report, args.report.as_ref())?;
    Ok(exit_code(&report))
}

/// Real sysfs control and probes.
fn build_sysfs(config: &HotplugConfig) -> (Resolution, LifecycleOrchestrator) {
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root, control writes will likely be refused");
    }

    let root = config.sysfs.root.clone();
    let resolution = AddressRegistry::new(root.clone()).resolve_all(&config.resources);

    let control: Arc<dyn ResourceControl> = Arc::new(SysfsControl::new(root.clone()));
    let link: Arc<dyn LinkProbe> = Arc::new(SysfsLinkProbe::new(root.clone()));
    let reach: Arc<dyn ReachabilityProbe> = Arc::new(PingProbe::new(root.clone()));
    let paths: Arc<dyn PathProbe> = Arc::new(MultipathdProbe::new(root));

    let orchestrator = assemble(config, Arc::new(SystemClock), control, link, reach, paths);
    (resolution, orchestrator)
}

/// In-memory control and probes on a virtual clock.
fn build_simulated(config: &HotplugConfig) -> (Resolution, LifecycleOrchestrator) {
    info!("Simulated run, no sysfs writes");
    let clock = ManualClock::shared();

    let mut resolution = Resolution::default();
    for descriptor in &config.resources {
        match descriptor.parse::<ResourceDescriptor>() {
            Ok(ResourceDescriptor::Core(_)) => resolution.excluded.push(ExcludedResource {
                descriptor: descriptor.clone(),
                reason: "core expansion needs a real CPU topology".into(),
            }),
            Ok(parsed) => {
                let class = match parsed {
                    ResourceDescriptor::Pci(_) => DeviceClass::Network,
                    _ => DeviceClass::Generic,
                };
                let resource = simulated_resource(&parsed, class);
                if !resolution.resources.iter().any(|r| r.id == resource.id) {
                    resolution.resources.push(resource);
                }
            }
            Err(e) => resolution.excluded.push(ExcludedResource {
                descriptor: descriptor.clone(),
                reason: e.to_string(),
            }),
        }
    }

    let present: Vec<String> = resolution.resources.iter().map(|r| r.id.clone()).collect();
    let control: Arc<dyn ResourceControl> =
        Arc::new(SimulatedControl::new(clock.clone(), present));
    let link: Arc<dyn LinkProbe> = Arc::new(SimulatedLinkProbe::new(
        clock.clone(),
        Some(SIMULATED_LINK_DELAY),
    ));
    let reach: Arc<dyn ReachabilityProbe> = Arc::new(SimulatedReachability::new(true));
    let paths: Arc<dyn PathProbe> = Arc::new(SimulatedPathProbe::new());

    let orchestrator = assemble(config, clock, control, link, reach, paths);
    (resolution, orchestrator)
}

fn assemble(
    config: &HotplugConfig,
    clock: Arc<dyn Clock>,
    control: Arc<dyn ResourceControl>,
    link: Arc<dyn LinkProbe>,
    reach: Arc<dyn ReachabilityProbe>,
    paths: Arc<dyn PathProbe>,
) -> LifecycleOrchestrator {
    let suite = RecoverySuite::from_config(config, Arc::clone(&control), link, reach, paths);
    LifecycleOrchestrator::new(
        control,
        suite,
        PollWaiter::new(clock),
        OrchestratorConfig::from_config(config),
    )
}

fn write_report(report: &RunReport, path: Option<&PathBuf>) -> Result<()> {
    let summary = report.summary();
    for line in &summary.detail {
        warn!("{line}");
    }
    for excluded in &report.excluded {
        warn!(descriptor = %excluded.descriptor, reason = %excluded.reason, "Excluded");
    }
    if let Some(seed) = report.seed {
        info!(seed, "Replay this order with --seed {seed}");
    }
    println!("{report}");

    if let Some(path) = path {
        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write report to {path:?}"))?;
        info!(?path, "Report written");
    }
    Ok(())
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.summary().passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    }
}
