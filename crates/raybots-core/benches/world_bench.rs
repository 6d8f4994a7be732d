//! Criterion benchmarks for the world tick and the ray casting hot path.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use raybots_core::{
    BrainFactory, BrainRunner, ManualClock, MotorCommand, Position, RayReach, RaybotsConfig,
    WorldState, cast_ray, reference_maze,
};
use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};
use std::hint::black_box;
use std::sync::Arc;

struct CirclingBrain {
    inputs: usize,
}

impl BrainRunner for CirclingBrain {
    fn kind(&self) -> &'static str {
        "bench.circling"
    }

    fn input_size(&self) -> usize {
        self.inputs
    }

    fn decide(&self, _sensors: &[f32]) -> MotorCommand {
        // A tight orbit near the spawn keeps every agent alive for the
        // whole measurement.
        MotorCommand {
            thrust: 1.0,
            brake: 0.0,
            turn: 1.0,
        }
    }
}

fn palette_of(slots: usize) -> Vec<[f32; 3]> {
    (0..slots)
        .map(|slot| {
            let t = slot as f32 / slots.max(1) as f32;
            [t, 0.5, 1.0 - t]
        })
        .collect()
}

fn bench_world_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_step");
    for &agents in &[8usize, 32, 128] {
        group.bench_function(BenchmarkId::from_parameter(agents), |b| {
            let config = RaybotsConfig {
                rng_seed: Some(1),
                palette: palette_of(agents),
                ..RaybotsConfig::default()
            };
            let inputs = config.sensor_len();
            let factory: BrainFactory = Box::new(move |_rng| Arc::new(CirclingBrain { inputs }));
            // A manual clock that never advances keeps lifespans and
            // generations inert across iterations.
            let mut world = WorldState::with_clock(
                config,
                reference_maze(),
                factory,
                Box::new(ManualClock::new()),
            )
            .expect("world builds");
            b.iter(|| black_box(world.step()));
        });
    }
    group.finish();
}

fn bench_ray_fan(c: &mut Criterion) {
    let maze = reference_maze();
    let origin = Position::new(200.0, 200.0);
    c.bench_function("cast_ray_fan", |b| {
        b.iter(|| {
            let mut total = 0.0f32;
            for i in 0..7 {
                let theta = -FRAC_PI_4 + i as f32 * (FRAC_PI_2 / 6.0);
                let tip = Position::new(
                    origin.x + 600.0 * theta.cos(),
                    origin.y + 600.0 * theta.sin(),
                );
                total += cast_ray(&maze, origin, tip, 600.0, RayReach::Unbounded).distance;
            }
            black_box(total)
        });
    });
}

fn configured() -> Criterion {
    let mut criterion = Criterion::default();
    if let Ok(samples) = std::env::var("WORLD_BENCH_SAMPLES")
        && let Ok(parsed) = samples.parse::<usize>()
    {
        criterion = criterion.sample_size(parsed.max(10));
    }
    criterion
}

criterion_group! {
    name = benches;
    config = configured();
    targets = bench_world_step, bench_ray_fan
}
criterion_main!(benches);
