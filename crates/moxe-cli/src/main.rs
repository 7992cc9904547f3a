//! CLI entry point for moxe.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use moxe_train::config::MoxeConfig;
use moxe_train::layers::LayerSelector;
use moxe_train::logging::{init_console_logging, init_logging};
use moxe_train::mesh::MeshTopology;
use moxe_train::synthetic::simulate_mesh;

/// A preset name, or a path to a `.toml` / `.json` config file.
fn resolve_config(config: &str) -> Result<MoxeConfig> {
    match config {
        "dp4-tp2" | "dp4_tp2" => Ok(MoxeConfig::dp4_tp2()),
        "tiny-cpu" | "tiny_cpu" => Ok(MoxeConfig::tiny_cpu()),
        path => MoxeConfig::from_file(path)
            .with_context(|| format!("Unknown preset or unreadable config file: {}", path)),
    }
}

#[derive(Parser)]
#[command(
    name = "moxe",
    about = "Check MoE loss configs and run them on a simulated device mesh"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config and print the resolved monitored layers
    Validate {
        #[arg(long, default_value = "dp4-tp2")]
        config: String,

        /// Number of workers the job will launch with
        #[arg(long)]
        world_size: Option<usize>,
    },

    /// Print every worker's coordinate and groups as JSON
    Mesh {
        #[arg(long, default_value = "dp4-tp2")]
        config: String,
    },

    /// Train the synthetic model on an in-process mesh
    Simulate {
        #[arg(long, default_value = "tiny-cpu")]
        config: String,

        #[arg(long, default_value = "3")]
        steps: usize,

        /// Emit JSON log lines instead of pretty console output
        #[arg(long, default_value = "false")]
        json_logs: bool,
    },
}

fn validate(config: &str, world_size: Option<usize>) -> Result<()> {
    let cfg = resolve_config(config)?;
    if let Err(errors) = cfg.validate() {
        for error in &errors {
            tracing::error!("{}", error);
        }
        bail!("config {} has {} error(s)", config, errors.len());
    }

    let world_size = world_size.unwrap_or_else(|| cfg.world_size());
    MeshTopology::build(&cfg.axis_names, &cfg.mesh_shape, world_size)
        .with_context(|| format!("mesh {:?} cannot cover {} workers", cfg.mesh_shape, world_size))?;
    let selection = LayerSelector::resolve(
        &cfg.monitored_layers,
        cfg.monitored_layers_policy,
        cfg.num_layers,
    )?;

    let enabled: Vec<String> = cfg.enabled_losses().iter().map(|k| k.to_string()).collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "world_size": world_size,
            "mesh_shape": cfg.mesh_shape,
            "monitored_layers": selection.indices(),
            "enabled_losses": enabled,
            "expert_groups": cfg.expert_groups(cfg.tp_size()),
        }))?
    );
    Ok(())
}

fn mesh(config: &str) -> Result<()> {
    let cfg = resolve_config(config)?.validated()?;
    let topology = MeshTopology::build(&cfg.axis_names, &cfg.mesh_shape, cfg.world_size())?;
    let workers = (0..topology.world_size())
        .map(|rank| topology.worker(rank))
        .collect::<Result<Vec<_>, _>>()?;
    println!("{}", serde_json::to_string_pretty(&workers)?);
    Ok(())
}

fn simulate(config: &str, steps: usize) -> Result<()> {
    if steps == 0 {
        bail!("--steps must be > 0");
    }
    let cfg = resolve_config(config)?;
    let reports = simulate_mesh(&cfg, steps).map_err(|err| {
        tracing::error!(step = ?err.step(), error = %err, "Simulation halted");
        err
    })?;

    // One line per step from rank 0; every dp replica reports its own loss.
    for report in reports.first().into_iter().flatten() {
        println!("{}", serde_json::to_string(report)?);
    }
    let finals: Vec<f64> = reports
        .iter()
        .filter_map(|r| r.last().map(|last| last.mean_total))
        .collect();
    tracing::info!(ranks = reports.len(), final_losses = ?finals, "Simulation complete");
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config, world_size } => {
            init_console_logging();
            validate(&config, world_size)
        }
        Commands::Mesh { config } => {
            init_console_logging();
            mesh(&config)
        }
        Commands::Simulate {
            config,
            steps,
            json_logs,
        } => {
            if json_logs {
                init_logging();
            } else {
                init_console_logging();
            }
            simulate(&config, steps)
        }
    }
}
