// MediChain AI Gate - Main Entry Point
//
// CLI for the gate that sits in front of the upstream AI service:
// - serve: status server and gated generation endpoint
// - simulate: replay a burst of requests against the quotas on a virtual clock
// - check-config: load and validate the configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medichain_gate::ai::{AssistantService, Completion, HttpCompletionClient};
use medichain_gate::config::Config;
use medichain_gate::logging;
use medichain_gate::metrics;
use medichain_gate::rate_limit::config::{GateConfig, PER_HOUR, PER_MINUTE};
use medichain_gate::rate_limit::{ManualClock, RateLimitedGate};
use medichain_gate::status_server::{self, AppState};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// MediChain AI Gate: rate-limited access to the upstream AI service
#[derive(Parser, Debug)]
#[command(name = "medichain-gate")]
#[command(author = "MediChain Contributors")]
#[command(version)]
#[command(about = "Quota-aware admission gate for the MediChain AI service", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the status server with the gated generation endpoint
    Serve {
        /// Override the listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Push a burst of requests through the gate on a virtual clock
    Simulate {
        /// Number of requests to submit
        #[arg(long, default_value_t = 100)]
        requests: u32,

        /// Override the per-minute quota
        #[arg(long)]
        per_minute: Option<u32>,

        /// Override the per-hour quota
        #[arg(long)]
        per_hour: Option<u32>,
    },
    /// Validate the configuration and print the effective quotas
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(Config::config_path);
    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;

    // Config source is logged once the subscriber exists
    logging::init_tracing(&config.logging, args.verbose)?;
    if config_path.exists() {
        info!("Loaded configuration from {}", config_path.display());
    } else {
        info!("No config file at {}, using defaults", config_path.display());
    }

    match args.command {
        Some(Commands::Serve { port }) => {
            let mut config = config;
            if let Some(port) = port {
                config.server.port = port;
            }
            serve(config).await?;
        }
        Some(Commands::Simulate {
            requests,
            per_minute,
            per_hour,
        }) => {
            let mut gate_config = config.gate.clone();
            if let Some(capacity) = per_minute {
                set_capacity(&mut gate_config, PER_MINUTE, capacity);
            }
            if let Some(capacity) = per_hour {
                set_capacity(&mut gate_config, PER_HOUR, capacity);
            }
            simulate(gate_config, requests).await?;
        }
        Some(Commands::CheckConfig) => check_config(&config)?,
        None => {
            println!("No command specified. Use \"medichain-gate --help\" for usage.");
        }
    }

    Ok(())
}

fn set_capacity(config: &mut GateConfig, name: &str, capacity: u32) {
    if let Some(quota) = config.quota_mut(name) {
        quota.capacity = capacity;
    }
}

/// Run the HTTP server until Ctrl-C
async fn serve(config: Config) -> Result<()> {
    metrics::init().context("Failed to initialize metrics")?;

    let gate = RateLimitedGate::new(config.gate.clone()).context("Invalid gate configuration")?;

    let client: Option<Arc<dyn Completion>> = if config.upstream.is_configured() {
        let client = HttpCompletionClient::from_config(&config.upstream)
            .context("Failed to create upstream client")?;
        Some(Arc::new(client))
    } else {
        warn!("Upstream AI service not configured; /generate will return fallback text");
        None
    };

    let assistant = AssistantService::new(gate, client, config.upstream.retry.clone());
    let state = AppState::new(assistant, config.dashboard.clone());
    status_server::serve(&config.server, state).await
}

/// Replay `requests` back-to-back calls on a virtual clock
async fn simulate(gate_config: GateConfig, requests: u32) -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let gate = RateLimitedGate::with_clock(gate_config.without_refill_tick(), clock.clone())
        .context("Invalid gate configuration")?;

    info!(requests, "Starting simulation");

    let order = Arc::new(Mutex::new(Vec::with_capacity(requests as usize)));
    let calls: Vec<_> = (0..requests)
        .map(|i| {
            let order = Arc::clone(&order);
            gate.execute(format!("sim-{i}"), move || async move {
                order
                    .lock()
                    .map_err(|_| "order log poisoned".to_string())?
                    .push(i);
                Ok::<_, String>(i)
            })
        })
        .collect();

    let mut completed = 0u32;
    for result in futures::future::join_all(calls).await {
        result.map_err(|e| anyhow::anyhow!("Simulated request failed: {}", e))?;
        completed += 1;
    }

    let in_order = order
        .lock()
        .map_err(|_| anyhow::anyhow!("order log poisoned"))?
        .windows(2)
        .all(|pair| pair[0] < pair[1]);

    let elapsed = clock.elapsed();
    let minutes = elapsed.as_secs() / 60;
    println!(
        "Completed {} of {} requests in {} virtual seconds (~{} minute windows)",
        completed,
        requests,
        elapsed.as_secs(),
        minutes
    );
    println!("FIFO order preserved: {}", if in_order { "yes" } else { "no" });

    let status = gate.status();
    for (name, quota) in &status.quotas {
        println!("{}: {}/{} tokens left", name, quota.available, quota.capacity);
    }

    if !in_order {
        anyhow::bail!("Requests were not invoked in submission order");
    }
    Ok(())
}

/// Print the effective configuration
fn check_config(config: &Config) -> Result<()> {
    println!("Configuration OK");
    for quota in &config.gate.quotas {
        println!(
            "  quota {}: {} per {:?}",
            quota.name,
            quota.capacity,
            Duration::from_millis(quota.window_ms)
        );
    }
    println!(
        "  backoff: base {}ms, max {}ms, max exponent {}",
        config.gate.backoff.base_delay_ms,
        config.gate.backoff.max_delay_ms,
        config.gate.backoff.max_exponent
    );
    println!("  server: {}:{}", config.server.host, config.server.port);
    println!(
        "  upstream: {}",
        config
            .upstream
            .base_url
            .as_deref()
            .unwrap_or("not configured")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_simulate_args() {
        let args = Args::parse_from(["medichain-gate", "simulate", "--requests", "10", "--per-minute", "2"]);
        match args.command {
            Some(Commands::Simulate { requests, per_minute, per_hour }) => {
                assert_eq!(requests, 10);
                assert_eq!(per_minute, Some(2));
                assert_eq!(per_hour, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_simulate_small_burst() {
        let config = GateConfig::with_quotas(vec![
            medichain_gate::rate_limit::QuotaConfig::per_minute(2),
        ]);
        simulate(config, 5).await.unwrap();
    }
}
