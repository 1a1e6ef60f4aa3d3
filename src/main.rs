use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use imagecycle::{
    config::AppConfig,
    gateway::ImageGateway,
    observability::{init_tracing, run_span},
    policy::{InstanceGroups, RetentionPolicy, TagScheme},
    producer::{CreateReport, ImageProducer},
    resolver::InstanceResolver,
    retention::{ReclaimReport, RetentionEngine},
};
use serde::Serialize;
use tracing::Instrument;

const DEFAULT_CONFIG_PATH: &str = "imagecycle.toml";

/// CLI arguments for imagecycle
#[derive(Parser, Debug)]
#[command(version, about = "Machine image snapshot and retention tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Correlation id attached to every log line of this run (defaults to a random UUID)
    #[arg(long, global = true)]
    correlation_id: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Request a new image of every configured instance
    Create {
        /// Resolve instances and log what would be created without creating anything
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Deregister expired images and delete their snapshots
    Reclaim {
        /// Evaluate images without deregistering or deleting anything
        #[arg(long)]
        dry_run: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the instance ids each environment resolves to
    Resolve {
        /// Only resolve this environment
        #[arg(short, long)]
        environment: Option<String>,
    },
    /// Initialize a new configuration file
    Init {
        /// Path to create the config file (defaults to ./imagecycle.toml)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Load and validate the configuration, then print the effective policy
    CheckConfig,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Create { .. } => "create",
            Command::Reclaim { .. } => "reclaim",
            Command::Resolve { .. } => "resolve",
            Command::Init { .. } => "init",
            Command::CheckConfig => "check-config",
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Command::Init { output, force } = &args.command {
        run_init(output.clone(), *force);
        return;
    }

    let config = load_config(&args.config);

    if let Err(e) = init_tracing(&config.observability.logging) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }

    let span = run_span(args.command.name(), args.correlation_id.as_deref());

    async move {
        match args.command {
            Command::Create { dry_run, json } => run_create(&config, dry_run, json).await,
            Command::Reclaim { dry_run, json } => run_reclaim(&config, dry_run, json).await,
            Command::Resolve { environment } => run_resolve(&config, environment).await,
            Command::CheckConfig => run_check_config(&config),
            Command::Init { .. } => {}
        }
    }
    .instrument(span)
    .await
}

fn load_config(path: &Path) -> AppConfig {
    match AppConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    }
}

#[cfg(feature = "aws")]
async fn build_gateway(config: &AppConfig) -> Arc<dyn ImageGateway> {
    let gateway =
        imagecycle::gateway::Ec2Gateway::new(&config.provider, config.tags.name_key.clone()).await;
    Arc::new(gateway)
}

#[cfg(not(feature = "aws"))]
async fn build_gateway(_config: &AppConfig) -> Arc<dyn ImageGateway> {
    eprintln!("Error: talking to the cloud provider requires the 'aws' feature to be enabled");
    eprintln!("Rebuild with: cargo build --features aws");
    std::process::exit(1);
}

async fn run_create(config: &AppConfig, dry_run: bool, json: bool) {
    let gateway = build_gateway(config).await;
    let producer = ImageProducer::new(gateway.clone(), TagScheme::from(&config.tags))
        .with_no_reboot(config.creation.no_reboot)
        .with_dry_run(dry_run || config.creation.dry_run);
    let resolver = InstanceResolver::new(gateway);
    let groups = InstanceGroups::from_config(config);

    match producer.run_create_cycle(&groups, &resolver).await {
        Ok(report) => print_report(&report, json, summarize_create),
        Err(e) => {
            tracing::error!(error = %e, "Create cycle aborted");
            std::process::exit(1);
        }
    }
}

async fn run_reclaim(config: &AppConfig, dry_run: bool, json: bool) {
    let mut safety = config.retention.safety.clone();
    safety.dry_run |= dry_run;

    let engine = RetentionEngine::new(
        build_gateway(config).await,
        RetentionPolicy::from_config(config),
        TagScheme::from(&config.tags),
    )
    .with_safety(safety);

    // Per-image failures are in the report; only an aborted cycle fails the process
    match engine.reclaim().await {
        Ok(report) => print_report(&report, json, summarize_reclaim),
        Err(e) => {
            tracing::error!(error = %e, "Reclaim cycle aborted");
            std::process::exit(1);
        }
    }
}

async fn run_resolve(config: &AppConfig, environment: Option<String>) {
    let groups = InstanceGroups::from_config(config);
    if let Some(label) = &environment
        && groups.get(label).is_none()
    {
        eprintln!("Environment '{label}' has no configured instances");
        std::process::exit(1);
    }

    let resolver = InstanceResolver::new(build_gateway(config).await);
    for (label, candidates) in groups.iter() {
        if environment.as_deref().is_some_and(|e| e != label.as_str()) {
            continue;
        }
        match resolver.resolve_detailed(candidates).await {
            Ok(resolution) => {
                let ids: Vec<&str> = resolution.resolved.iter().map(String::as_str).collect();
                println!("{label}: {}", ids.join(", "));
                for miss in &resolution.unmatched {
                    println!("  unmatched: {miss}");
                }
            }
            Err(e) => {
                tracing::error!(environment = %label, error = %e, "Failed to resolve instances");
                std::process::exit(1);
            }
        }
    }
}

fn run_check_config(config: &AppConfig) {
    let policy = RetentionPolicy::from_config(config);
    let tags = TagScheme::from(&config.tags);

    println!("Configuration OK");
    println!("Owner filter: {}={}", tags.owner_key, tags.owner_marker);
    for (label, env) in &config.environments {
        let retention = policy
            .retention_for(label)
            .map(|d| format!("{}h", d.num_hours()))
            .unwrap_or_else(|| "keep forever".to_string());
        println!(
            "  {label}: retention {retention}, {} instance(s)",
            env.instances.len()
        );
    }
    if config.retention.safety.dry_run {
        println!("Reclaim runs in dry-run mode");
    }
}

fn print_report<T: Serialize>(report: &T, json: bool, summarize: fn(&T) -> String) {
    if json {
        match serde_json::to_string_pretty(report) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("Failed to serialize report: {e}");
                std::process::exit(1);
            }
        }
    } else {
        println!("{}", summarize(report));
    }
}

fn summarize_create(report: &CreateReport) -> String {
    let prefix = if report.dry_run { "DRY RUN: " } else { "" };
    format!(
        "{prefix}{} image(s) started, {} failed, {} instance(s) evaluated",
        report.started_count(),
        report.failed_count(),
        report.instances.len()
    )
}

fn summarize_reclaim(report: &ReclaimReport) -> String {
    let prefix = if report.dry_run { "DRY RUN: " } else { "" };
    let mut line = format!(
        "{prefix}{} image(s) deleted, {} kept, {} failure(s) out of {} evaluated",
        report.deleted_count(),
        report.kept_count(),
        report.failure_count(),
        report.images.len()
    );
    if report.truncated {
        line.push_str(&format!(" (truncated, {} left for next run)", report.unevaluated));
    }
    line
}

/// Write the default configuration file.
fn run_init(output: Option<PathBuf>, force: bool) {
    let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if output_path.exists() && !force {
        eprintln!(
            "Config file already exists: {}\nUse --force to overwrite.",
            output_path.display()
        );
        std::process::exit(1);
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        eprintln!("Failed to create directory {}: {}", parent.display(), e);
        std::process::exit(1);
    }

    if let Err(e) = std::fs::write(&output_path, imagecycle::config::default_config_toml()) {
        eprintln!("Failed to write config file: {}", e);
        std::process::exit(1);
    }

    println!("Created config file: {}", output_path.display());
    println!();
    println!("Add instances to each environment, then run:");
    println!("  imagecycle --config {} create", output_path.display());
}
