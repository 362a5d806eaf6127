/*
 * Command line front-end.
 *
 *   cluster-provisioner provision --cluster cluster.toml [--teardown] [--json]
 *   cluster-provisioner delete    --cluster cluster.toml
 *   cluster-provisioner plan      --cluster cluster.toml
 *   cluster-provisioner init      [--force]
 *
 * Settings come from --config FILE or the layered config/ directory,
 * see config/settings.rs.
 */

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use crate::cluster::{ClusterOrchestrator, ClusterReport, FailurePolicy};
use crate::config::{load_cluster_spec, LoggingSettings, Settings};
use crate::core::errors::ProvisionError;
use crate::core::hypervisor::Hypervisor;
use crate::core::libvirt::LibvirtManager;
use crate::core::lifecycle::VmLifecycleManager;
use crate::core::resources::translate;
use crate::remote::ssh_transport;

#[derive(Parser)]
#[command(name = "cluster-provisioner")]
#[command(about = "Provision and bootstrap VM clusters on a libvirt host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Debug logging regardless of configuration
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create every node and join the workers to the head
    Provision {
        #[arg(short, long, value_name = "FILE")]
        cluster: PathBuf,
        /// Delete the whole cluster if provisioning fails
        #[arg(long)]
        teardown: bool,
        /// Print the resulting report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every node of a cluster and its storage
    Delete {
        #[arg(short, long, value_name = "FILE")]
        cluster: PathBuf,
    },
    /// Print the domain definitions without touching the host
    Plan {
        #[arg(short, long, value_name = "FILE")]
        cluster: PathBuf,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::new_from_file(path)?,
        None => Settings::new()?,
    };
    setup_logging(&settings.logging, cli.verbose)?;

    match cli.command {
        Commands::Provision {
            cluster,
            teardown,
            json,
        } => handle_provision(&cluster, teardown, json, settings).await?,
        Commands::Delete { cluster } => handle_delete(&cluster, &settings).await?,
        Commands::Plan { cluster } => handle_plan(&cluster, &settings)?,
        Commands::Init { force } => handle_init_command(force)?,
    }

    Ok(())
}

fn setup_logging(logging: &LoggingSettings, verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("invalid log level")?
        .add_directive("russh=warn".parse()?)
        .add_directive("russh_keys=warn".parse()?);

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.json {
        registry.with(fmt::layer().json().with_target(false)).try_init()?;
    } else {
        registry.with(fmt::layer().with_target(false).compact()).try_init()?;
    }
    Ok(())
}

fn orchestrator(settings: &Settings) -> ClusterOrchestrator {
    let hypervisor: Arc<dyn Hypervisor> = Arc::new(LibvirtManager::new(&settings.hypervisor));
    let transport = ssh_transport(
        settings.ssh.credentials(),
        settings.ssh.jump_host.clone(),
        settings.readiness.connect_timeout,
    );
    ClusterOrchestrator::from_settings(settings, hypervisor, transport)
}

async fn handle_provision(
    path: &Path,
    teardown: bool,
    json: bool,
    mut settings: Settings,
) -> anyhow::Result<()> {
    let spec = load_cluster_spec(path)
        .with_context(|| format!("cannot load cluster from {}", path.display()))?;
    if teardown {
        settings.orchestrator.on_failure = FailurePolicy::Teardown;
    }

    info!(
        cluster = %spec.name,
        uri = %settings.hypervisor.connection_uri(),
        nodes = spec.all_nodes().count(),
        "provisioning cluster"
    );
    match orchestrator(&settings).provision_cluster(&spec).await {
        Ok(report) if json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            print_failure(&e);
            Err(e.into())
        }
    }
}

fn print_report(report: &ClusterReport) {
    println!("{} Cluster '{}' is up", "✓".green(), report.name.bold());
    println!("  head    {} ({})", report.head.name, report.head.address);
    for worker in &report.workers {
        println!("  worker  {} ({})", worker.name, worker.address);
    }
}

fn print_failure(e: &ProvisionError) {
    eprintln!("{} {}", "✗".red(), e.to_string().red());
    if let ProvisionError::PartialCluster {
        ready, failed_node, ..
    } = e
    {
        for node in ready {
            eprintln!("  {} {}", "ready ".green(), node);
        }
        eprintln!("  {} {}", "failed".red(), failed_node);
        eprintln!("  cause: {}", e.root_cause());
    }
}

async fn handle_delete(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let spec = load_cluster_spec(path)
        .with_context(|| format!("cannot load cluster from {}", path.display()))?;

    let results = orchestrator(settings).delete_cluster(&spec).await;
    println!("{}", format!("Cluster '{}':", spec.name).bold());
    for (node, deleted) in &results {
        let status = if *deleted {
            "deleted".green()
        } else {
            "absent or failed".yellow()
        };
        println!("- {} ({})", node, status);
    }
    Ok(())
}

fn handle_plan(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let spec = load_cluster_spec(path)
        .with_context(|| format!("cannot load cluster from {}", path.display()))?;

    for node in spec.all_nodes() {
        let resources = translate(&node.resources);
        let disk = format!("{}:{}", settings.hypervisor.pool, node.volume_name());
        let descriptor = VmLifecycleManager::describe(node, &disk)?;
        println!(
            "{} {} ({} vCPU, {} MiB, {} GiB disk)",
            "#".blue(),
            node.name.bold(),
            resources.vcpus,
            resources.memory_mb,
            node.disk_size_gb
        );
        println!("{}", descriptor.to_xml());
    }
    Ok(())
}

fn handle_init_command(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from("config");
    if config_dir.join("default.toml").exists() && !force {
        error!("Configuration already exists. Use --force to overwrite.");
        return Ok(());
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(config_dir.join("default.toml"), config_str)?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}
