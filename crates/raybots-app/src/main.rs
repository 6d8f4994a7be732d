//! Headless runner for the raybots maze simulation.
//!
//! Builds the reference maze, spawns a feedforward-controlled population,
//! and steps the world until the requested number of generations have
//! elapsed. Ticks either fast-forward on a manual clock or pace against the
//! wall clock with `--realtime`.

use anyhow::{Context, ensure};
use clap::Parser;
use raybots_brain::feedforward_factory;
use raybots_core::{
    DeathRecord, GenerationSummary, ManualClock, Position, RaybotsConfig, WorldState,
    reference_maze,
};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Headless maze-exploration runner.
#[derive(Debug, Parser)]
#[command(name = "raybots", version, about)]
struct Args {
    /// RNG seed for reproducible runs (random when omitted).
    #[arg(long)]
    seed: Option<u64>,

    /// Number of generations to simulate before exiting.
    #[arg(long, default_value_t = 5)]
    generations: u32,

    /// Simulation tick rate in Hz.
    #[arg(long, default_value_t = 60.0)]
    tick_hz: f32,

    /// Pace ticks against the wall clock instead of fast-forwarding.
    #[arg(long)]
    realtime: bool,

    /// Load a JSON world configuration; omitted fields keep their defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write a JSON run report to this path.
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct RunReport {
    seed: Option<u64>,
    ticks: u64,
    generations: u32,
    wall_time_secs: f64,
    summaries: Vec<GenerationSummary>,
    agents: Vec<AgentReport>,
}

/// Final state of one agent, flattened into a report row.
#[derive(Debug, Serialize)]
struct AgentReport {
    slot: usize,
    color: [f32; 3],
    position: Position,
    heading: f32,
    fitness: u32,
    cells_visited: usize,
    trail_points: usize,
    death: Option<DeathRecord>,
}

enum Pacing {
    FastForward(ManualClock),
    Realtime,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    ensure!(
        args.tick_hz.is_finite() && args.tick_hz > 0.0,
        "tick-hz must be a positive number"
    );
    if args.generations == 0 {
        warn!("--generations is 0, the world will not be stepped");
    }

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => RaybotsConfig::default(),
    };
    // The command line wins over a seed carried in the config file.
    if args.seed.is_some() {
        config.rng_seed = args.seed;
    }
    let seed = config.rng_seed;
    config.validate().context("validating configuration")?;
    let factory = feedforward_factory(config.sensor_len(), &config.controller)
        .context("building the controller factory")?;

    let environment = reference_maze();
    info!(
        seed = ?seed,
        agents = config.palette.len(),
        walls = environment.len(),
        realtime = args.realtime,
        "starting run"
    );

    let dt = Duration::from_secs_f32(1.0 / args.tick_hz);
    let (mut world, pacing) = if args.realtime {
        let world = WorldState::new(config, environment, factory)?;
        (world, Pacing::Realtime)
    } else {
        let clock = ManualClock::new();
        let world =
            WorldState::with_clock(config, environment, factory, Box::new(clock.clone()))?;
        (world, Pacing::FastForward(clock))
    };

    let started = Instant::now();
    let ticks = run_world(&mut world, args.generations, dt, &pacing);
    let wall_time_secs = started.elapsed().as_secs_f64();

    let report = RunReport {
        seed,
        ticks,
        generations: world.generation().0,
        wall_time_secs,
        summaries: world.history().cloned().collect(),
        agents: final_agent_stats(&world),
    };
    info!(
        ticks = report.ticks,
        generations = report.generations,
        wall_time_secs = report.wall_time_secs,
        "run complete"
    );

    if let Some(path) = &args.report {
        write_report(path, &report)?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

/// Steps the world until `target_generations` replacements have happened,
/// returning the number of ticks executed.
fn run_world(world: &mut WorldState, target_generations: u32, dt: Duration, pacing: &Pacing) -> u64 {
    let mut ticks = 0u64;
    let mut deadline = Instant::now() + dt;
    while world.generation().0 < target_generations {
        match pacing {
            Pacing::FastForward(clock) => clock.advance(dt),
            Pacing::Realtime => {
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
                deadline += dt;
            }
        }
        let events = world.step();
        ticks += 1;
        if events.generation_rolled
            && let Some(summary) = world.history().last()
        {
            info!(
                generation = summary.generation.0,
                best_slot = summary.best_slot,
                best_fitness = summary.best_fitness,
                mean_fitness = summary.mean_fitness,
                collisions = summary.collision_deaths,
                timeouts = summary.timeout_deaths,
                survivors = summary.survivors,
                "generation complete"
            );
        }
    }
    ticks
}

/// Reads a JSON `RaybotsConfig`; missing fields keep their defaults.
fn load_config(path: &Path) -> anyhow::Result<RaybotsConfig> {
    let file = File::open(path)
        .with_context(|| format!("opening config file {}", path.display()))?;
    let config = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

/// Collects one report row per roster slot from the final population.
fn final_agent_stats(world: &WorldState) -> Vec<AgentReport> {
    world
        .roster()
        .iter()
        .filter_map(|&id| {
            let data = world.agent(id)?;
            let runtime = world.agent_runtime(id)?;
            Some(AgentReport {
                slot: data.slot,
                color: data.color,
                position: data.position,
                heading: data.heading,
                fitness: runtime.fitness,
                cells_visited: runtime.visited.len(),
                trail_points: runtime.trail.len(),
                death: data.death,
            })
        })
        .collect()
}

fn write_report(path: &Path, report: &RunReport) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("creating report file {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
        .context("serializing run report")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished_world(seed: u64, ticks: u32) -> WorldState {
        let config = RaybotsConfig {
            rng_seed: Some(seed),
            ..RaybotsConfig::default()
        };
        let factory = feedforward_factory(config.sensor_len(), &config.controller)
            .expect("factory builds");
        let clock = ManualClock::new();
        let mut world =
            WorldState::with_clock(config, reference_maze(), factory, Box::new(clock.clone()))
                .expect("world builds");
        for _ in 0..ticks {
            clock.advance(Duration::from_millis(50));
            world.step();
        }
        world
    }

    #[test]
    fn report_carries_final_stats_for_every_agent() {
        let world = finished_world(7, 120);
        let agents = final_agent_stats(&world);
        assert_eq!(agents.len(), world.agent_count());
        for (slot, agent) in agents.iter().enumerate() {
            assert_eq!(agent.slot, slot);
            // The spawn area is open, so every controller commits at least
            // its first move and counts the spawn cell.
            assert!(agent.fitness >= 1);
            assert_eq!(agent.cells_visited, agent.fitness as usize);
            assert!(agent.trail_points >= 1);
        }
    }

    #[test]
    fn report_json_includes_agent_rows() {
        let world = finished_world(11, 40);
        let report = RunReport {
            seed: Some(11),
            ticks: 40,
            generations: world.generation().0,
            wall_time_secs: 0.0,
            summaries: world.history().cloned().collect(),
            agents: final_agent_stats(&world),
        };
        let value = serde_json::to_value(&report).expect("report serializes");
        let rows = value["agents"].as_array().expect("agents array");
        assert_eq!(rows.len(), world.agent_count());
        assert!(rows[0].get("fitness").is_some());
        assert!(rows[0].get("position").is_some());
        assert!(rows[0].get("death").is_some());
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let path =
            std::env::temp_dir().join(format!("raybots-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{ "num_rays": 5, "rng_seed": 99 }"#).expect("write config");
        let config = load_config(&path).expect("config loads");
        std::fs::remove_file(&path).ok();
        assert_eq!(config.num_rays, 5);
        assert_eq!(config.rng_seed, Some(99));
        assert_eq!(config.ray_length, 600.0);
        assert_eq!(config.palette.len(), 8);
        config.validate().expect("loaded config validates");
    }

    #[test]
    fn missing_config_files_fail_with_context() {
        let err = load_config(Path::new("raybots-no-such-config.json")).unwrap_err();
        assert!(err.to_string().contains("opening config file"));
    }
}
