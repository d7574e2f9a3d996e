//! Gangsim Simulation Engine CLI
//!
//! ## Usage
//!
//! ```bash
//! # Single local participant, default catalog and synthetic forecasts
//! gangsim simulate
//!
//! # Three participants in lockstep inside this process
//! gangsim simulate --participants 3 --simulation-length 20
//!
//! # One participant of a distributed run (start gangsim-coordinator first)
//! gangsim simulate --real --endpoint 10.0.0.5:2181 --participants 4
//! ```

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gangsim_core::{Barrier, DecisionPolicy, ForecastProvider, Workload};
use gangsim_simulation_engine::{
    SimulationConfig, SimulationResult,
    barrier::{LocalBarrier, TcpBarrier},
    bootstrap::build_simulator,
    forecast::{StaticForecast, SyntheticForecast},
    policies::{ConstantPolicy, GapFollowingPolicy, LinearPolicy},
    workloads::{default_catalog, load_catalog},
};

#[derive(Parser)]
#[command(name = "gangsim")]
#[command(about = "MPC simulation of gang-scheduled batch workloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble the participants and run the simulation
    Simulate(SimulateArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyKind {
    /// Scale toward observed demand
    Gap,
    /// Always hold the predicted allocation
    Hold,
    /// Linear model artifact (requires --model-path)
    Model,
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Simulation config (JSON); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workload catalog (JSON array); built-in catalog if omitted
    #[arg(short, long)]
    workloads: Option<PathBuf>,

    /// Forecast file with predicted/actual demand; synthetic if omitted
    #[arg(short, long)]
    forecast: Option<PathBuf>,

    /// Relative forecast error for synthetic demand
    #[arg(long, default_value_t = 0.1)]
    forecast_noise: f64,

    /// Decision policy
    #[arg(short, long, value_enum, default_value_t = PolicyKind::Gap)]
    policy: PolicyKind,

    /// Linear model artifact for --policy model
    #[arg(long)]
    model_path: Option<PathBuf>,

    /// Observation window size
    #[arg(long)]
    window_size: Option<usize>,

    /// Number of simulator steps
    #[arg(long)]
    simulation_length: Option<u64>,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Synchronize through a remote coordinator
    #[arg(long)]
    real: bool,

    /// Barrier path shared by all participants
    #[arg(long)]
    barrier_path: Option<String>,

    /// Coordinator endpoint (host:port)
    #[arg(long, env = "GANGSIM_BARRIER_ENDPOINT")]
    endpoint: Option<String>,

    /// Participants in the gang (local tasks, or expected remote members with --real)
    #[arg(long)]
    participants: Option<usize>,

    /// Participant name for --real (random if omitted)
    #[arg(long)]
    participant_id: Option<String>,

    /// Output JSON file path (optional)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl SimulateArgs {
    fn resolve_config(&self) -> anyhow::Result<SimulationConfig> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => SimulationConfig::default(),
        };

        if let Some(window_size) = self.window_size {
            config.window_size = window_size;
        }
        if let Some(length) = self.simulation_length {
            config.simulation_length = length;
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if let Some(path) = &self.barrier_path {
            config.barrier_path = path.clone();
        }
        if let Some(endpoint) = &self.endpoint {
            config.barrier_endpoint = endpoint.clone();
        }
        if let Some(participants) = self.participants {
            config.participants = participants;
        }
        if self.real {
            config.real_simulation = true;
        }

        config.validate().context("Invalid simulation config")?;
        Ok(config)
    }

    fn build_policy(&self) -> anyhow::Result<Box<dyn DecisionPolicy>> {
        Ok(match self.policy {
            PolicyKind::Gap => Box::new(GapFollowingPolicy::default()),
            PolicyKind::Hold => Box::new(ConstantPolicy::hold()),
            PolicyKind::Model => {
                let Some(path) = &self.model_path else {
                    bail!("--policy model requires --model-path");
                };
                let policy = LinearPolicy::load(path)
                    .with_context(|| format!("Failed to load model {}", path.display()))?;
                Box::new(policy)
            }
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gangsim=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate(args) => simulate(args).await,
    }
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let config = args.resolve_config()?;

    let catalog: Vec<Workload> = match &args.workloads {
        Some(path) => load_catalog(path)
            .with_context(|| format!("Failed to load workloads {}", path.display()))?,
        None => default_catalog(),
    };

    let forecast: Box<dyn ForecastProvider> = match &args.forecast {
        Some(path) => Box::new(
            StaticForecast::from_file(path)
                .with_context(|| format!("Failed to load forecast {}", path.display()))?,
        ),
        None => Box::new(SyntheticForecast::generate(&catalog, args.forecast_noise, config.seed)?),
    };

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  Gangsim Simulation Engine                               ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!("Configuration:");
    println!("  Workloads: {}", catalog.len());
    println!("  Window size: {}", config.window_size);
    println!("  Time step: {}s", config.time_step);
    println!("  Actions: {}", config.num_actions);
    println!("  Batch duration: {}-{} min", config.duration_low, config.duration_high);
    println!("  Simulation length: {} steps", config.simulation_length);
    println!("  Participants: {}", config.participants);
    if config.real_simulation {
        println!("  Barrier: {} @ {}", config.barrier_path, config.barrier_endpoint);
    }
    println!();

    let sequencer = Arc::new(AtomicU64::new(0));
    let mut simulators = Vec::new();

    if config.real_simulation {
        let participant = args
            .participant_id
            .clone()
            .unwrap_or_else(|| format!("participant-{}", uuid::Uuid::new_v4()));
        let barrier: Box<dyn Barrier> = Box::new(TcpBarrier::new(
            config.barrier_endpoint.clone(),
            participant,
            config.participants,
        ));
        simulators.push(build_simulator(
            &config,
            &catalog,
            forecast.as_ref(),
            args.build_policy()?,
            Some(barrier),
        )?);
    } else if config.participants > 1 {
        // Lockstep participants inside this process
        let local = LocalBarrier::new(config.participants);
        for i in 0..config.participants {
            let mut participant_config = config.clone().with_barrier(config.barrier_path.clone(), config.participants);
            participant_config.seed = participant_seed(config.seed, i);

            let barrier: Box<dyn Barrier> = Box::new(local.participant(format!("participant-{i}")));
            let simulator = build_simulator(
                &participant_config,
                &catalog,
                forecast.as_ref(),
                args.build_policy()?,
                Some(barrier),
            )?
            .with_sequencer(Arc::clone(&sequencer));
            simulators.push(simulator);
        }
    } else {
        simulators.push(build_simulator(&config, &catalog, forecast.as_ref(), args.build_policy()?, None)?);
    }

    info!(participants = simulators.len(), "Running simulation");
    let outcomes = futures::future::join_all(simulators.iter_mut().map(|s| s.simulate())).await;

    let mut results: Vec<SimulationResult> = Vec::new();
    let mut failures = Vec::new();
    for (simulator, outcome) in simulators.iter().zip(outcomes) {
        match outcome {
            Ok(result) => results.push(result),
            Err(e) => {
                error!(participant = simulator.participant(), error = %e, "Participant failed");
                failures.push(format!("{}: {e}", simulator.participant()));
                // Keep whatever was recorded before the failure
                results.push(simulator.result());
            }
        }
    }

    print_results(&results);

    // Output to JSON if requested
    if let Some(output_path) = &args.output {
        println!("\nWriting results to {}...", output_path.display());
        let json = serde_json::to_string_pretty(&results)?;
        fs::write(output_path, json)
            .with_context(|| format!("Failed to write {}", output_path.display()))?;
        println!("  Results saved");
    }

    if !failures.is_empty() {
        bail!("Simulation failed:\n  {}", failures.join("\n  "));
    }

    println!("\n✅ Simulation complete!\n");
    Ok(())
}

/// Distinct seed per local participant
fn participant_seed(base: Option<u64>, index: usize) -> Option<u64> {
    base.map(|s| s.wrapping_add(index as u64))
}

fn print_results(results: &[SimulationResult]) {
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  Simulation Results                                      ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!(
        "{:<48} {:<16} {:>8} {:>10} {:>12} {:>12} {:>12}",
        "Participant", "Policy", "Steps", "Episodes", "Total Rwd", "Mean Rwd", "Mean |Gap|"
    );
    println!("{}", "-".repeat(124));

    for result in results {
        println!(
            "{:<48} {:<16} {:>8} {:>10} {:>12.3} {:>12.4} {:>12.2}",
            result.participant,
            result.policy_name,
            result.steps_completed,
            result.episodes_finished,
            result.total_reward,
            result.mean_reward,
            result.mean_abs_gap,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_seed_wraps() {
        assert_eq!(participant_seed(Some(7), 2), Some(9));
        assert_eq!(participant_seed(Some(u64::MAX), 1), Some(0));
        assert_eq!(participant_seed(None, 3), None);
    }
}
