// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use mediafetch::fetch::{
    ActivationPolicy, FetchCategory, FetchLocation, FetchManager, FetchRequest, InMemoryBackend,
    LocationKey, MediaResource, MessageId, PeerId, ResourceKind, ResourceStatus,
};
use mediafetch::FetchConfig;

/// mediafetch - media fetch coordination
#[derive(Parser)]
#[command(name = "mediafetch", version, about)]
struct Cli {
    /// Config file (defaults to ~/.mediafetch/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch simulated resources and print every status transition
    ///
    /// Examples:
    ///   mediafetch demo --resources 5 --policy top-priority-only
    ///   mediafetch demo --elevated 0,2 --user-initiated 4
    Demo {
        /// Number of resources to fetch
        #[arg(long, default_value_t = 4)]
        resources: usize,

        /// Progress updates per simulated transfer
        #[arg(long, default_value_t = 5)]
        steps: u32,

        /// Delay between progress updates, in milliseconds
        #[arg(long, default_value_t = 100)]
        step_ms: u64,

        /// Activation policy (overrides the config file)
        #[arg(long)]
        policy: Option<ActivationPolicy>,

        /// Indices of resources requested with elevated priority
        #[arg(long, value_delimiter = ',')]
        elevated: Vec<usize>,

        /// Indices of resources requested as user-initiated
        #[arg(long, value_delimiter = ',')]
        user_initiated: Vec<usize>,
    },

    /// Print the effective configuration as JSON
    Config,
}

fn load_config(path: Option<&PathBuf>) -> Result<FetchConfig> {
    let mut config = match path {
        Some(path) => FetchConfig::load_from(path)?,
        None => FetchConfig::load_from(&FetchConfig::config_path()?)?,
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn status_label(status: &ResourceStatus) -> colored::ColoredString {
    match status {
        ResourceStatus::Local => status.to_string().green(),
        ResourceStatus::Remote => status.to_string().red(),
        ResourceStatus::Fetching { is_active: false, .. } => status.to_string().yellow(),
        ResourceStatus::Fetching { is_active: true, .. } => status.to_string().cyan(),
    }
}

async fn run_demo(
    config: FetchConfig,
    resources: usize,
    steps: u32,
    step_ms: u64,
    elevated: Vec<usize>,
    user_initiated: Vec<usize>,
) -> Result<()> {
    let backend = Arc::new(InMemoryBackend::simulated(steps, Duration::from_millis(step_ms)));
    let manager = FetchManager::with_config(backend.clone(), &config);
    let peer = PeerId(1);

    println!(
        "{} {} resources, policy {}",
        "[*]".cyan(),
        resources,
        config.activation_policy.to_string().bold()
    );

    let mut printers = Vec::with_capacity(resources);
    let mut fetches = Vec::with_capacity(resources);

    for index in 0..resources {
        let resource = MediaResource::new(format!("demo-{}", index), ResourceKind::Document)
            .with_file_name(format!("demo-{}.bin", index));
        let location = FetchLocation::Chat(peer);
        let location_key = LocationKey::Message(MessageId::new(peer, index as i32 + 1));

        let mut status =
            manager.fetch_status(FetchCategory::File, location, location_key, &resource);
        let name = resource.id.clone();
        printers.push(tokio::spawn(async move {
            while let Some(update) = status.next().await {
                println!("  {:<10} {}", name.to_string().bold(), status_label(&update));
            }
        }));

        let mut request = FetchRequest::new(FetchCategory::File, location, location_key, resource);
        if elevated.contains(&index) {
            request = request.elevated();
        }
        if user_initiated.contains(&index) {
            request = request.user_initiated();
        }
        fetches.push(manager.interactively_fetched(request));
    }

    for printer in printers {
        printer.await.context("Status printer panicked")?;
    }

    let snapshot = manager.snapshot().await?;
    println!(
        "{} All resources local: {} fetches started, at most {} at once",
        "[OK]".green(),
        backend.started(),
        backend.peak_running()
    );
    if !snapshot.is_idle() {
        println!("{} Scheduler still holds state:", "[!]".yellow());
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    drop(fetches);
    manager.shutdown().await
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Demo {
            resources,
            steps,
            step_ms,
            policy,
            elevated,
            user_initiated,
        } => {
            if let Some(policy) = policy {
                config.activation_policy = policy;
            }
            init_logging(&config.log_level);

            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(run_demo(
                config,
                resources,
                steps,
                step_ms,
                elevated,
                user_initiated,
            ))
        }
    }
}
