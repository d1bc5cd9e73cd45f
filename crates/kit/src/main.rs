//! iSCSI Boot Verification Kit (ibvk) - verify netboot of OS images from
//! container-managed iSCSI targets.

use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{Report, Result};

mod command_run;
mod config;
mod errors;
mod install;
mod iscsi_boot;
mod machine;
mod progress;
mod retry;
mod scenario;
mod ssh;
mod target;
mod verify;

use iscsi_boot::RunPolicy;
use machine::{MachineBackend, MachineOptions, RoutedNetworkBackend, UserNetworkBackend};
use ssh::SshRunner;
use target::ReadinessPolicy;

/// Orchestrates multi-machine boot verification: a target VM exposing an
/// iSCSI LUN, an installer driving the LUN, and a nested machine netbooting
/// from it, with the pass/fail verdict taken from a completion signal.
#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one registered scenario to a pass/fail verdict
    Run(RunOpts),

    /// List registered scenarios and their selection metadata
    List(ListOpts),
}

/// How the test cluster resolves the iSCSI discovery address.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendKind {
    /// Single-host cluster; the iSCSI port is forwarded to the host
    User,
    /// Routed cluster; machines have reachable private addresses
    Routed,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::User => "user",
            BackendKind::Routed => "routed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Parser)]
struct RunOpts {
    /// Scenario name (see `ibvk list`)
    scenario: String,

    #[clap(long, value_enum, default_value_t = BackendKind::User)]
    backend: BackendKind,

    /// Overall window for the nested machine to report multi-user, in seconds
    #[clap(long, default_value_t = 300)]
    verify_timeout: u64,

    /// Discovery attempts before target setup is declared failed
    #[clap(long, default_value_t = 30)]
    readiness_attempts: u32,

    /// Delay between discovery attempts, in seconds
    #[clap(long, default_value_t = 10)]
    readiness_delay: u64,

    /// Name for the target machine (derived from the container otherwise)
    #[clap(long)]
    name: Option<String>,

    /// Memory size for the target machine (e.g. 4G, 2048M)
    #[clap(long, default_value = "4G")]
    memory: String,

    #[clap(long, default_value_t = 2)]
    vcpus: u32,
}

#[derive(Parser)]
struct ListOpts {
    /// Emit machine-readable JSON
    #[clap(long)]
    json: bool,
}

fn run_scenario(opts: RunOpts) -> Result<errors::TestOutcome> {
    let scenario = scenario::find(&opts.scenario).ok_or_else(|| {
        color_eyre::eyre::eyre!(
            "unknown scenario '{}'; see `ibvk list` for registered scenarios",
            opts.scenario
        )
    })?;

    let runner = SshRunner::default();
    let backend: Box<dyn MachineBackend> = match opts.backend {
        BackendKind::User => Box::new(UserNetworkBackend { runner }),
        BackendKind::Routed => Box::new(RoutedNetworkBackend { runner }),
    };
    let machine_opts = MachineOptions {
        name: opts.name.clone(),
        memory: opts.memory.clone(),
        vcpus: opts.vcpus,
    };
    let policy = RunPolicy {
        readiness: ReadinessPolicy {
            max_attempts: opts.readiness_attempts,
            delay: Duration::from_secs(opts.readiness_delay),
        },
        verify_timeout: Duration::from_secs(opts.verify_timeout),
    };

    Ok(scenario.run(&*backend, &machine_opts, &policy))
}

fn list_scenarios(opts: ListOpts) -> Result<()> {
    if opts.json {
        let metas: Vec<_> = scenario::scenarios().iter().map(|s| &s.meta).collect();
        println!("{}", serde_json::to_string_pretty(&metas)?);
    } else {
        for s in scenario::scenarios() {
            println!(
                "{:<22} [{}] {}",
                s.meta.name,
                s.meta.tags.join(","),
                s.meta.description
            );
        }
    }
    Ok(())
}

/// Install and configure the tracing/logging system.
///
/// Structured logging with environment-based filtering, error layer
/// integration, and compact console output on stderr. Filtered by RUST_LOG,
/// defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(opts) => {
            let outcome = run_scenario(opts)?;
            println!("{outcome}");
            if !outcome.passed() {
                std::process::exit(1);
            }
        }
        Commands::List(opts) => list_scenarios(opts)?,
    }
    Ok(())
}
