//! Core simulation state for the Raybots workspace.
//!
//! A population of circular agents explores a static maze. Each tick every
//! live agent casts a fan of rays against the wall set, feeds the readings to
//! its controller, and applies the resulting thrust/brake/turn command.
//! Exploration is scored on a coarse grid, and on a fixed wall-clock interval
//! the whole population is replaced, carrying exactly one elite controller
//! forward by reference.

use ordered_float::OrderedFloat;
use rand::{RngCore, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::collections::{HashSet, VecDeque};
use std::f32::consts::{FRAC_PI_2, PI, TAU};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Convenience alias for associating side data with agents.
pub type AgentMap<T> = SecondaryMap<AgentId, T>;

/// Number of proprioceptive inputs appended after the per-ray distances:
/// position x/y, velocity x/y, heading.
pub const BODY_INPUTS: usize = 5;
/// Number of motor outputs every controller must produce.
pub const MOTOR_OUTPUTS: usize = 3;

/// Monotonically increasing simulation tick counter.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next tick value.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The zero tick.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Counter of completed population replacements.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
pub struct Generation(pub u32);

impl Generation {
    /// Advances to the next generation.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The initial generation.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Axis-aligned 2D position in world units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Position displaced by one velocity step.
    #[must_use]
    pub fn offset(self, velocity: Velocity) -> Self {
        Self::new(self.x + velocity.vx, self.y + velocity.vy)
    }

    /// Euclidean distance to another position.
    #[must_use]
    pub fn distance_to(self, other: Self) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// World-space velocity applied once per committed move.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

impl Velocity {
    /// Construct a new velocity vector.
    #[must_use]
    pub const fn new(vx: f32, vy: f32) -> Self {
        Self { vx, vy }
    }
}

/// Closed set of activation functions available to controllers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActivationKind {
    Relu,
    Tanh,
    Sigmoid,
}

impl ActivationKind {
    /// Applies the activation to a single pre-activation value.
    #[must_use]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::Relu => x.max(0.0),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
        }
    }
}

/// Motor command decoded from a controller's output layer.
///
/// `thrust` and `brake` sit in `(0, 1)` under the default sigmoid outputs and
/// `turn` in `(-1, 1)` under tanh; no additional clamping is applied.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MotorCommand {
    pub thrust: f32,
    pub brake: f32,
    pub turn: f32,
}

impl MotorCommand {
    /// Command with all levels at zero.
    #[must_use]
    pub const fn coast() -> Self {
        Self {
            thrust: 0.0,
            brake: 0.0,
            turn: 0.0,
        }
    }
}

/// Thin trait object used to drive controller evaluations without coupling to
/// concrete brain crates.
///
/// Evaluation takes `&self`: controllers are immutable once built, which is
/// what makes sharing one instance across generations by `Arc` sound.
pub trait BrainRunner: Send + Sync {
    /// Static identifier of the controller implementation.
    fn kind(&self) -> &'static str;

    /// Length of the sensor vector this controller expects.
    fn input_size(&self) -> usize;

    /// Evaluate one motor command for the provided sensors.
    fn decide(&self, sensors: &[f32]) -> MotorCommand;
}

/// Factory producing freshly initialized controllers at each generation.
///
/// A factory must produce controllers of one fixed input size; the world
/// validates the size at construction and debug-asserts it on every later
/// spawn.
pub type BrainFactory = Box<dyn Fn(&mut dyn RngCore) -> Arc<dyn BrainRunner> + Send + Sync>;

/// Category assigned to a wall segment. Doubles as the recorded cause when an
/// agent dies against it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WallKind {
    /// Outer perimeter of the maze.
    Boundary,
    /// Interior partition.
    Partition,
}

/// One immutable wall segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Wall {
    pub start: Position,
    pub end: Position,
    pub kind: WallKind,
}

impl Wall {
    /// Construct a new wall segment.
    #[must_use]
    pub const fn new(start: Position, end: Position, kind: WallKind) -> Self {
        Self { start, end, kind }
    }

    /// Segment length.
    #[must_use]
    pub fn length(&self) -> f32 {
        self.start.distance_to(self.end)
    }

    fn is_finite(&self) -> bool {
        self.start.x.is_finite()
            && self.start.y.is_finite()
            && self.end.x.is_finite()
            && self.end.y.is_finite()
    }
}

/// Immutable wall set shared read-only by every agent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Environment {
    walls: Vec<Wall>,
}

impl Environment {
    /// Validates and freezes a wall set.
    ///
    /// Zero-length or non-finite segments are rejected here so the collision
    /// test never divides by a zero segment length mid-run.
    pub fn new(walls: Vec<Wall>) -> Result<Self, WorldError> {
        for (index, wall) in walls.iter().enumerate() {
            if !wall.is_finite() || wall.length() <= 0.0 {
                return Err(WorldError::DegenerateWall { index });
            }
        }
        Ok(Self { walls })
    }

    /// An environment with no walls at all.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Ordered wall list.
    #[must_use]
    pub fn walls(&self) -> &[Wall] {
        &self.walls
    }

    /// Number of walls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.walls.len()
    }

    /// Whether the wall set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.walls.is_empty()
    }
}

/// The reference labyrinth: a rectangular boundary enclosing an S-shaped
/// chain of partitions, sized to pair with the default configuration.
#[must_use]
pub fn reference_maze() -> Environment {
    let boundary = |x1: f32, y1: f32, x2: f32, y2: f32| {
        Wall::new(
            Position::new(x1, y1),
            Position::new(x2, y2),
            WallKind::Boundary,
        )
    };
    let partition = |x1: f32, y1: f32, x2: f32, y2: f32| {
        Wall::new(
            Position::new(x1, y1),
            Position::new(x2, y2),
            WallKind::Partition,
        )
    };
    let walls = vec![
        boundary(100.0, 100.0, 1900.0, 100.0),
        boundary(1900.0, 100.0, 1900.0, 1400.0),
        boundary(1900.0, 1400.0, 100.0, 1400.0),
        boundary(100.0, 1400.0, 100.0, 100.0),
        partition(100.0, 400.0, 1600.0, 400.0),
        partition(1600.0, 400.0, 1600.0, 1100.0),
        partition(1600.0, 1100.0, 600.0, 1100.0),
        partition(600.0, 1100.0, 600.0, 600.0),
        partition(600.0, 600.0, 1300.0, 600.0),
        partition(1300.0, 600.0, 1300.0, 900.0),
        partition(1300.0, 900.0, 300.0, 900.0),
        partition(300.0, 900.0, 300.0, 1200.0),
    ];
    Environment { walls }
}

/// Policy for ray hits reported beyond the nominal ray length.
///
/// The reference intersection test bounds the ray parameter from below but
/// not above, so perception reaches arbitrarily far along the ray direction
/// and the nominal length only feeds the no-hit sentinel. That behavior is
/// kept as the default rather than silently corrected.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum RayReach {
    /// Hits register at any forward distance.
    #[default]
    Unbounded,
    /// Hits farther than the nominal length are discarded and the ray
    /// reports the sentinel instead.
    Clipped,
}

/// Intersection of a ray with one wall segment.
///
/// `origin` and `tip` describe the ray: `tip` is the origin displaced by the
/// direction vector scaled to the nominal ray length, so the ray parameter is
/// 1.0 exactly at the nominal reach. Returns `None` for parallel pairs
/// (singular system), for hits outside the segment, and for hits at or behind
/// the origin. The ray parameter is deliberately not capped above; see
/// [`RayReach`].
#[must_use]
pub fn ray_segment_intersection(origin: Position, tip: Position, wall: &Wall) -> Option<Position> {
    let (x1, y1) = (wall.start.x, wall.start.y);
    let (x2, y2) = (wall.end.x, wall.end.y);
    let (x3, y3) = (origin.x, origin.y);
    let (x4, y4) = (tip.x, tip.y);

    let denom = (x1 - x2) * (y3 - y4) - (y1 - y2) * (x3 - x4);
    if denom == 0.0 {
        return None;
    }

    let t = ((x1 - x3) * (y3 - y4) - (y1 - y3) * (x3 - x4)) / denom;
    let u = -((x1 - x2) * (y1 - y3) - (y1 - y2) * (x1 - x3)) / denom;

    if (0.0..=1.0).contains(&t) && u > 0.0 {
        Some(Position::new(x1 + t * (x2 - x1), y1 + t * (y2 - y1)))
    } else {
        None
    }
}

/// Whether a circle at `center` touches the wall segment.
///
/// Projects the center onto the segment's carrier line and reports a hit when
/// the projection falls inside the segment's bounding box on both axes and
/// lies within `radius` of the center. Assumes a non-degenerate wall; the
/// [`Environment`] constructor guarantees that.
#[must_use]
pub fn segment_intersects_circle(wall: &Wall, center: Position, radius: f32) -> bool {
    let (ax, ay) = (wall.start.x, wall.start.y);
    let (bx, by) = (wall.end.x, wall.end.y);
    let (cx, cy) = (center.x, center.y);

    let lab = (bx - ax).hypot(by - ay);
    let dx = (bx - ax) / lab;
    let dy = (by - ay) / lab;
    let t = dx * (cx - ax) + dy * (cy - ay);
    let ex = t * dx + ax;
    let ey = t * dy + ay;
    let lec = (ex - cx).hypot(ey - cy);

    lec <= radius
        && (ax.min(bx)..=ax.max(bx)).contains(&ex)
        && (ay.min(by)..=ay.max(by)).contains(&ey)
}

/// Closest wall hit recorded for one sensing ray.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RaySample {
    /// Distance from the agent to the hit, or the sentinel when `hit` is
    /// `None`.
    pub distance: f32,
    /// Hit point, or the ray tip at nominal length when nothing was hit.
    pub point: Position,
    /// Kind of the struck wall, if any.
    pub hit: Option<WallKind>,
}

/// Casts one ray from `origin` toward `tip` against every wall, keeping the
/// closest admissible hit (ties go to the first wall in iteration order).
///
/// With no admissible hit the sample carries exactly `ray_length` as its
/// distance and the ray tip as its point.
#[must_use]
pub fn cast_ray(
    environment: &Environment,
    origin: Position,
    tip: Position,
    ray_length: f32,
    reach: RayReach,
) -> RaySample {
    let mut closest: Option<(f32, Position, WallKind)> = None;
    for wall in environment.walls() {
        let Some(point) = ray_segment_intersection(origin, tip, wall) else {
            continue;
        };
        let distance = origin.distance_to(point);
        if reach == RayReach::Clipped && distance > ray_length {
            continue;
        }
        match closest {
            Some((best, _, _)) if distance >= best => {}
            _ => closest = Some((distance, point, wall.kind)),
        }
    }
    match closest {
        Some((distance, point, kind)) => RaySample {
            distance,
            point,
            hit: Some(kind),
        },
        None => RaySample {
            distance: ray_length,
            point: tip,
            hit: None,
        },
    }
}

/// Why an agent died.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeathCause {
    /// Struck a wall of the given kind.
    Collision(WallKind),
    /// Outlived the configured maximum lifespan.
    Timeout,
}

/// Terminal record set exactly once when an agent dies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeathRecord {
    pub cause: DeathCause,
    /// Seconds between spawn and death.
    pub lifespan_secs: f32,
}

/// Errors surfaced when constructing or reconfiguring a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A wall segment has zero length or non-finite coordinates.
    #[error("wall segment {index} is degenerate (zero length or non-finite)")]
    DegenerateWall { index: usize },
    /// A controller's input size does not match the configured sensor vector.
    #[error("controller expects {actual} inputs but the sensor vector has {expected}")]
    SensorShape { expected: usize, actual: usize },
    /// A palette slot index beyond the configured population.
    #[error("palette slot {slot} is out of range for a population of {slots}")]
    UnknownSlot { slot: usize, slots: usize },
}

/// Controller topology settings consumed by brain factories.
///
/// The world itself never interprets these; they travel with the
/// configuration so an application can build its factory from one document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerSettings {
    /// Hidden layer widths between the sensor layer and the motor layer.
    pub hidden_layers: Vec<usize>,
    /// Activation applied uniformly across each hidden layer.
    pub hidden_activations: Vec<ActivationKind>,
    /// Activation applied per motor output unit.
    pub output_activations: Vec<ActivationKind>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            hidden_layers: vec![8, 6],
            hidden_activations: vec![ActivationKind::Relu, ActivationKind::Tanh],
            output_activations: vec![
                ActivationKind::Sigmoid,
                ActivationKind::Sigmoid,
                ActivationKind::Tanh,
            ],
        }
    }
}

fn default_palette() -> Vec<[f32; 3]> {
    vec![
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [0.0, 0.0, 1.0],
        [1.0, 1.0, 0.0],
        [1.0, 0.0, 1.0],
        [0.0, 1.0, 1.0],
        [1.0, 0.647, 0.0],
        [0.502, 0.0, 0.502],
    ]
}

/// Static configuration for a Raybots world.
///
/// Deserialization fills missing fields from [`Default`], so a configuration
/// document only needs to name the fields it overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RaybotsConfig {
    /// Number of rays in each agent's sensing fan.
    pub num_rays: usize,
    /// Total field of view covered by the fan, centered on heading (radians).
    pub ray_fov: f32,
    /// Nominal ray reach in world units; doubles as the no-hit sentinel.
    pub ray_length: f32,
    /// Policy for hits reported beyond the nominal reach.
    pub ray_reach: RayReach,
    /// Distance covered per tick at full thrust or brake.
    pub move_speed: f32,
    /// Radians turned per tick at full turn output.
    pub rotate_speed: f32,
    /// Body radius used for wall collision.
    pub collision_radius: f32,
    /// Edge length of one exploration-scoring grid cell.
    pub fitness_cell_size: f32,
    /// Seconds an agent may live before timing out.
    pub max_lifespan_secs: f32,
    /// Seconds between population replacements.
    pub generation_secs: f32,
    /// Spawn position shared by every agent.
    pub spawn_point: Position,
    /// Spawn heading in radians.
    pub spawn_heading: f32,
    /// One agent per color; slot 0 receives the carried elite controller.
    pub palette: Vec<[f32; 3]>,
    /// Controller topology forwarded to the brain factory.
    pub controller: ControllerSettings,
    /// Number of generation summaries retained; 0 disables history.
    pub history_capacity: usize,
    /// Optional RNG seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for RaybotsConfig {
    fn default() -> Self {
        Self {
            num_rays: 7,
            ray_fov: FRAC_PI_2,
            ray_length: 600.0,
            ray_reach: RayReach::default(),
            move_speed: 5.0,
            rotate_speed: PI / 36.0,
            collision_radius: 10.0,
            fitness_cell_size: 300.0,
            max_lifespan_secs: 10.0,
            generation_secs: 10.0,
            spawn_point: Position::new(200.0, 200.0),
            spawn_heading: 0.0,
            palette: default_palette(),
            controller: ControllerSettings::default(),
            history_capacity: 256,
            rng_seed: None,
        }
    }
}

impl RaybotsConfig {
    /// Validates every field the simulation depends on.
    pub fn validate(&self) -> Result<(), WorldError> {
        if self.num_rays == 0 {
            return Err(WorldError::InvalidConfig("num_rays must be at least 1"));
        }
        if !(self.ray_fov > 0.0 && self.ray_fov <= TAU) {
            return Err(WorldError::InvalidConfig("ray_fov must be in (0, tau]"));
        }
        if !(self.ray_length > 0.0 && self.ray_length.is_finite()) {
            return Err(WorldError::InvalidConfig(
                "ray_length must be positive and finite",
            ));
        }
        if !(self.move_speed > 0.0 && self.move_speed.is_finite()) {
            return Err(WorldError::InvalidConfig(
                "move_speed must be positive and finite",
            ));
        }
        if !(self.rotate_speed > 0.0 && self.rotate_speed.is_finite()) {
            return Err(WorldError::InvalidConfig(
                "rotate_speed must be positive and finite",
            ));
        }
        if !(self.collision_radius > 0.0 && self.collision_radius.is_finite()) {
            return Err(WorldError::InvalidConfig(
                "collision_radius must be positive and finite",
            ));
        }
        if !(self.fitness_cell_size > 0.0 && self.fitness_cell_size.is_finite()) {
            return Err(WorldError::InvalidConfig(
                "fitness_cell_size must be positive and finite",
            ));
        }
        if !(self.max_lifespan_secs > 0.0 && self.max_lifespan_secs.is_finite()) {
            return Err(WorldError::InvalidConfig(
                "max_lifespan_secs must be positive and finite",
            ));
        }
        if !(self.generation_secs > 0.0 && self.generation_secs.is_finite()) {
            return Err(WorldError::InvalidConfig(
                "generation_secs must be positive and finite",
            ));
        }
        if !(self.spawn_point.x.is_finite() && self.spawn_point.y.is_finite()) {
            return Err(WorldError::InvalidConfig("spawn_point must be finite"));
        }
        if !self.spawn_heading.is_finite() {
            return Err(WorldError::InvalidConfig("spawn_heading must be finite"));
        }
        if self.palette.is_empty() {
            return Err(WorldError::InvalidConfig(
                "palette must contain at least one color slot",
            ));
        }
        Ok(())
    }

    /// Length of the sensor vector produced for each agent.
    #[must_use]
    pub const fn sensor_len(&self) -> usize {
        self.num_rays + BODY_INPUTS
    }

    /// Angular offsets of the ray fan relative to heading, endpoints
    /// inclusive. A single-ray fan degenerates to heading-aligned.
    #[must_use]
    pub fn ray_offsets(&self) -> Vec<f32> {
        if self.num_rays == 1 {
            return vec![0.0];
        }
        let half = self.ray_fov / 2.0;
        let step = self.ray_fov / (self.num_rays - 1) as f32;
        (0..self.num_rays)
            .map(|i| -half + i as f32 * step)
            .collect()
    }

    /// Lifespan timeout as a duration.
    #[must_use]
    pub fn max_lifespan(&self) -> Duration {
        Duration::from_secs_f32(self.max_lifespan_secs)
    }

    /// Replacement interval as a duration.
    #[must_use]
    pub fn generation_interval(&self) -> Duration {
        Duration::from_secs_f32(self.generation_secs)
    }

    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Body state for a single agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Position,
    pub velocity: Velocity,
    pub heading: f32,
    pub color: [f32; 3],
    /// Palette slot this agent occupies; also its roster index.
    pub slot: usize,
    /// Clock reading at spawn time.
    pub spawned_at: Duration,
    /// Set exactly once; `None` while the agent is alive.
    pub death: Option<DeathRecord>,
}

impl AgentData {
    /// Fresh body state at the spawn point.
    #[must_use]
    pub const fn spawned(
        position: Position,
        heading: f32,
        color: [f32; 3],
        slot: usize,
        at: Duration,
    ) -> Self {
        Self {
            position,
            velocity: Velocity::new(0.0, 0.0),
            heading,
            color,
            slot,
            spawned_at: at,
            death: None,
        }
    }

    /// Whether the agent is still alive.
    #[must_use]
    pub const fn is_alive(&self) -> bool {
        self.death.is_none()
    }
}

/// Per-tick state attached to an agent: sensors, ray samples, the last motor
/// command, exploration scoring, and the controller handle.
#[derive(Clone)]
pub struct AgentRuntime {
    /// Sensor vector in wire order: ray distances, then position, velocity,
    /// heading.
    pub sensors: Vec<f32>,
    /// One sample per ray, refreshed each sense stage.
    pub rays: Vec<RaySample>,
    /// Most recent controller output.
    pub command: MotorCommand,
    /// Count of distinct grid cells entered.
    pub fitness: u32,
    /// Grid cells entered so far.
    pub visited: HashSet<(i32, i32)>,
    /// Pre-move positions of every committed move.
    pub trail: Vec<Position>,
    /// Shared controller handle; the elite slot aliases the previous
    /// generation's allocation.
    pub brain: Arc<dyn BrainRunner>,
}

impl AgentRuntime {
    /// Fresh runtime state around a controller handle.
    #[must_use]
    pub fn fresh(brain: Arc<dyn BrainRunner>, sensor_len: usize) -> Self {
        Self {
            sensors: vec![0.0; sensor_len],
            rays: Vec::new(),
            command: MotorCommand::coast(),
            fitness: 0,
            visited: HashSet::new(),
            trail: Vec::new(),
            brain,
        }
    }
}

impl fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("brain", &self.brain.kind())
            .field("command", &self.command)
            .field("fitness", &self.fitness)
            .field("trail_len", &self.trail.len())
            .finish_non_exhaustive()
    }
}

/// Combined snapshot of one agent for read-only consumers.
#[derive(Debug, Clone)]
pub struct AgentState {
    pub id: AgentId,
    pub data: AgentData,
    pub runtime: AgentRuntime,
}

/// Events emitted after processing one world tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickEvents {
    pub tick: Tick,
    /// Agents that died during this tick.
    pub deaths: usize,
    /// Whether this tick ended with a population replacement.
    pub generation_rolled: bool,
}

/// Aggregate statistics for one completed generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSummary {
    pub generation: Generation,
    /// Seconds the generation ran before replacement.
    pub duration_secs: f32,
    /// Palette slot of the elite whose controller was carried forward.
    pub best_slot: usize,
    pub best_fitness: u32,
    pub mean_fitness: f32,
    pub collision_deaths: usize,
    pub timeout_deaths: usize,
    /// Agents still alive at the replacement boundary.
    pub survivors: usize,
    /// Longest lifespan observed, counting survivors up to the boundary.
    pub longest_lifespan_secs: f32,
}

/// Monotonic time provider driving lifespan and generation timing.
pub trait TimeSource: Send {
    /// Elapsed time since the source's epoch.
    fn now(&self) -> Duration;
}

/// Wall-clock time source backed by [`Instant`].
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Clock whose epoch is the moment of this call.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Manually driven time source for deterministic runs and tests.
///
/// Handles are cheap clones sharing one reading: keep one clone outside the
/// world and advance it between steps.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    micros: Arc<AtomicU64>,
}

impl ManualClock {
    /// Clock starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the clock forward.
    pub fn advance(&self, delta: Duration) {
        self.micros
            .fetch_add(delta.as_micros() as u64, Ordering::Relaxed);
    }

    /// Sets the absolute reading.
    pub fn set(&self, elapsed: Duration) {
        self.micros
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::Relaxed))
    }
}

struct CarriedElite {
    brain: Arc<dyn BrainRunner>,
    color: [f32; 3],
}

/// Aggregate world state owned by the simulation loop and read by renderers.
pub struct WorldState {
    config: RaybotsConfig,
    environment: Environment,
    tick: Tick,
    generation: Generation,
    rng: SmallRng,
    clock: Box<dyn TimeSource>,
    brain_factory: BrainFactory,
    agents: SlotMap<AgentId, AgentData>,
    runtime: AgentMap<AgentRuntime>,
    roster: Vec<AgentId>,
    ray_offsets: Vec<f32>,
    generation_started: Duration,
    last_deaths: usize,
    history: VecDeque<GenerationSummary>,
}

impl fmt::Debug for WorldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorldState")
            .field("tick", &self.tick)
            .field("generation", &self.generation)
            .field("agent_count", &self.roster.len())
            .field("walls", &self.environment.len())
            .finish_non_exhaustive()
    }
}

impl WorldState {
    /// Builds a world on the system monotonic clock and spawns generation 0.
    pub fn new(
        config: RaybotsConfig,
        environment: Environment,
        factory: BrainFactory,
    ) -> Result<Self, WorldError> {
        Self::with_clock(config, environment, factory, Box::new(MonotonicClock::new()))
    }

    /// Builds a world on the supplied clock and spawns generation 0.
    ///
    /// The factory's output shape is checked here once; the sensor contract
    /// between config and controllers cannot drift afterwards.
    pub fn with_clock(
        config: RaybotsConfig,
        environment: Environment,
        factory: BrainFactory,
        clock: Box<dyn TimeSource>,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let sample = (factory)(&mut rng);
        let expected = config.sensor_len();
        if sample.input_size() != expected {
            return Err(WorldError::SensorShape {
                expected,
                actual: sample.input_size(),
            });
        }
        drop(sample);

        let ray_offsets = config.ray_offsets();
        let history_capacity = config.history_capacity;
        let now = clock.now();
        let mut world = Self {
            environment,
            tick: Tick::zero(),
            generation: Generation::zero(),
            rng,
            clock,
            brain_factory: factory,
            agents: SlotMap::with_key(),
            runtime: AgentMap::new(),
            roster: Vec::with_capacity(config.palette.len()),
            ray_offsets,
            generation_started: now,
            last_deaths: 0,
            history: VecDeque::with_capacity(history_capacity),
            config,
        };
        world.populate(now, None);
        Ok(world)
    }

    /// Execute one simulation tick, returning emitted events.
    pub fn step(&mut self) -> TickEvents {
        let now = self.clock.now();

        self.stage_sense();
        self.stage_decide();
        self.stage_act(now);
        self.stage_lifespan(now);
        let generation_rolled = self.stage_generation(now);

        self.tick = self.tick.next();
        let events = TickEvents {
            tick: self.tick,
            deaths: self.last_deaths,
            generation_rolled,
        };
        self.last_deaths = 0;
        events
    }

    fn stage_sense(&mut self) {
        let bodies: Vec<(AgentId, Position, Velocity, f32)> = self
            .roster
            .iter()
            .filter_map(|&id| {
                let data = self.agents.get(id)?;
                data.is_alive()
                    .then_some((id, data.position, data.velocity, data.heading))
            })
            .collect();
        if bodies.is_empty() {
            return;
        }

        let environment = &self.environment;
        let offsets = self.ray_offsets.as_slice();
        let ray_length = self.config.ray_length;
        let reach = self.config.ray_reach;

        let readings: Vec<(AgentId, Vec<f32>, Vec<RaySample>)> = bodies
            .par_iter()
            .map(|&(id, position, velocity, heading)| {
                let (sensors, rays) = sense_agent(
                    environment,
                    offsets,
                    ray_length,
                    reach,
                    position,
                    velocity,
                    heading,
                );
                (id, sensors, rays)
            })
            .collect();

        for (id, sensors, rays) in readings {
            if let Some(runtime) = self.runtime.get_mut(id) {
                runtime.sensors = sensors;
                runtime.rays = rays;
            }
        }
    }

    fn stage_decide(&mut self) {
        for &id in &self.roster {
            let Some(data) = self.agents.get(id) else {
                continue;
            };
            if !data.is_alive() {
                continue;
            }
            if let Some(runtime) = self.runtime.get_mut(id) {
                runtime.command = runtime.brain.decide(&runtime.sensors);
            }
        }
    }

    fn stage_act(&mut self, now: Duration) {
        let ids: Vec<AgentId> = self.roster.clone();
        for id in ids {
            let Some(command) = self.runtime.get(id).map(|runtime| runtime.command) else {
                continue;
            };
            self.apply_move(id, command.thrust, now);
            self.apply_move(id, -command.brake, now);
            self.apply_turn(id, command.turn);
        }
    }

    /// Applies one signed move: velocity is always recorded, position only
    /// commits when the candidate stays clear of every wall. A blocked
    /// candidate kills the agent on the spot.
    fn apply_move(&mut self, id: AgentId, level: f32, now: Duration) {
        let speed = self.config.move_speed;
        let radius = self.config.collision_radius;
        let cell = self.config.fitness_cell_size;

        let mut committed: Option<(Position, Position)> = None;
        let mut died = false;
        if let Some(data) = self.agents.get_mut(id)
            && data.is_alive()
        {
            let velocity = Velocity::new(
                level * speed * data.heading.cos(),
                level * speed * data.heading.sin(),
            );
            data.velocity = velocity;
            let candidate = data.position.offset(velocity);
            let blocker = self
                .environment
                .walls()
                .iter()
                .find(|wall| segment_intersects_circle(wall, candidate, radius))
                .map(|wall| wall.kind);
            match blocker {
                Some(kind) => {
                    let lifespan = now.saturating_sub(data.spawned_at).as_secs_f32();
                    data.death = Some(DeathRecord {
                        cause: DeathCause::Collision(kind),
                        lifespan_secs: lifespan,
                    });
                    died = true;
                }
                None => {
                    let previous = data.position;
                    data.position = candidate;
                    committed = Some((previous, candidate));
                }
            }
        }

        if died {
            self.last_deaths += 1;
        }
        if let Some((previous, landed)) = committed
            && let Some(runtime) = self.runtime.get_mut(id)
        {
            runtime.trail.push(previous);
            let cell_key = (
                (landed.x / cell).floor() as i32,
                (landed.y / cell).floor() as i32,
            );
            if runtime.visited.insert(cell_key) {
                runtime.fitness += 1;
            }
        }
    }

    fn apply_turn(&mut self, id: AgentId, turn: f32) {
        let rotate_speed = self.config.rotate_speed;
        if let Some(data) = self.agents.get_mut(id)
            && data.is_alive()
        {
            data.heading += turn * rotate_speed;
        }
    }

    fn stage_lifespan(&mut self, now: Duration) {
        let max_lifespan = self.config.max_lifespan();
        for &id in &self.roster {
            if let Some(data) = self.agents.get_mut(id)
                && data.is_alive()
            {
                let elapsed = now.saturating_sub(data.spawned_at);
                if elapsed > max_lifespan {
                    data.death = Some(DeathRecord {
                        cause: DeathCause::Timeout,
                        lifespan_secs: elapsed.as_secs_f32(),
                    });
                    self.last_deaths += 1;
                }
            }
        }
    }

    fn stage_generation(&mut self, now: Duration) -> bool {
        if now.saturating_sub(self.generation_started) < self.config.generation_interval() {
            return false;
        }
        let Some(best) = self.best_agent() else {
            return false;
        };

        let carried = match (self.agents.get(best), self.runtime.get(best)) {
            (Some(data), Some(runtime)) => Some(CarriedElite {
                brain: Arc::clone(&runtime.brain),
                color: data.color,
            }),
            _ => None,
        };

        let summary = self.summarize_generation(now, best);
        self.record_summary(summary);

        self.populate(now, carried);
        self.generation = self.generation.next();
        self.generation_started = now;
        true
    }

    /// Agent with the highest fitness; ties resolve to the lowest palette
    /// slot because the roster is kept in slot order.
    #[must_use]
    pub fn best_agent(&self) -> Option<AgentId> {
        let mut best: Option<(u32, AgentId)> = None;
        for &id in &self.roster {
            let fitness = self.runtime.get(id).map_or(0, |runtime| runtime.fitness);
            match best {
                Some((top, _)) if fitness <= top => {}
                _ => best = Some((fitness, id)),
            }
        }
        best.map(|(_, id)| id)
    }

    fn summarize_generation(&self, now: Duration, best: AgentId) -> GenerationSummary {
        let mut collision_deaths = 0;
        let mut timeout_deaths = 0;
        let mut survivors = 0;
        let mut fitness_sum = 0u64;
        let mut lifespans: Vec<f32> = Vec::with_capacity(self.roster.len());

        for &id in &self.roster {
            let Some(data) = self.agents.get(id) else {
                continue;
            };
            match data.death {
                Some(record) => {
                    match record.cause {
                        DeathCause::Collision(_) => collision_deaths += 1,
                        DeathCause::Timeout => timeout_deaths += 1,
                    }
                    lifespans.push(record.lifespan_secs);
                }
                None => {
                    survivors += 1;
                    lifespans.push(now.saturating_sub(data.spawned_at).as_secs_f32());
                }
            }
            fitness_sum += u64::from(self.runtime.get(id).map_or(0, |runtime| runtime.fitness));
        }

        let population = self.roster.len().max(1);
        let longest_lifespan_secs = lifespans
            .iter()
            .copied()
            .map(OrderedFloat)
            .max()
            .map_or(0.0, OrderedFloat::into_inner);

        GenerationSummary {
            generation: self.generation,
            duration_secs: now.saturating_sub(self.generation_started).as_secs_f32(),
            best_slot: self.agents.get(best).map_or(0, |data| data.slot),
            best_fitness: self.runtime.get(best).map_or(0, |runtime| runtime.fitness),
            mean_fitness: fitness_sum as f32 / population as f32,
            collision_deaths,
            timeout_deaths,
            survivors,
            longest_lifespan_secs,
        }
    }

    fn record_summary(&mut self, summary: GenerationSummary) {
        if self.config.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    /// Replaces the whole population: one fresh agent per palette slot, each
    /// with a factory-built controller; slot 0 takes the carried elite's
    /// controller (and color) when one is supplied.
    fn populate(&mut self, now: Duration, carried: Option<CarriedElite>) {
        self.agents.clear();
        self.runtime.clear();
        self.roster.clear();

        let palette = self.config.palette.clone();
        let spawn_point = self.config.spawn_point;
        let spawn_heading = self.config.spawn_heading;
        let sensor_len = self.config.sensor_len();

        for (slot, slot_color) in palette.into_iter().enumerate() {
            let (brain, color) = match (&carried, slot) {
                (Some(elite), 0) => (Arc::clone(&elite.brain), elite.color),
                _ => (self.next_brain(), slot_color),
            };
            let data = AgentData::spawned(spawn_point, spawn_heading, color, slot, now);
            let id = self.agents.insert(data);
            self.runtime.insert(id, AgentRuntime::fresh(brain, sensor_len));
            self.roster.push(id);
        }
    }

    fn next_brain(&mut self) -> Arc<dyn BrainRunner> {
        let brain = (self.brain_factory)(&mut self.rng);
        debug_assert_eq!(
            brain.input_size(),
            self.config.sensor_len(),
            "brain factories must keep a fixed input size"
        );
        brain
    }

    /// Installs a controller into the agent occupying `slot`, replacing its
    /// current one. Fails fast on shape mismatch instead of reshaping.
    pub fn install_brain(
        &mut self,
        slot: usize,
        brain: Arc<dyn BrainRunner>,
    ) -> Result<(), WorldError> {
        let expected = self.config.sensor_len();
        if brain.input_size() != expected {
            return Err(WorldError::SensorShape {
                expected,
                actual: brain.input_size(),
            });
        }
        let &id = self.roster.get(slot).ok_or(WorldError::UnknownSlot {
            slot,
            slots: self.roster.len(),
        })?;
        if let Some(runtime) = self.runtime.get_mut(id) {
            runtime.brain = brain;
        }
        Ok(())
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &RaybotsConfig {
        &self.config
    }

    /// The immutable wall set.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Current simulation tick.
    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    /// Current generation counter.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Current reading of the world clock.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock.now()
    }

    /// Clock reading when the current generation spawned.
    #[must_use]
    pub const fn generation_started(&self) -> Duration {
        self.generation_started
    }

    /// Population handles in palette-slot order.
    #[must_use]
    pub fn roster(&self) -> &[AgentId] {
        &self.roster
    }

    /// Number of agents in the population.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.roster.len()
    }

    /// Number of agents still alive.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.roster
            .iter()
            .filter(|&&id| self.agents.get(id).is_some_and(AgentData::is_alive))
            .count()
    }

    /// Body state for one agent.
    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&AgentData> {
        self.agents.get(id)
    }

    /// Runtime state for one agent.
    #[must_use]
    pub fn agent_runtime(&self, id: AgentId) -> Option<&AgentRuntime> {
        self.runtime.get(id)
    }

    /// Combined snapshot of one agent for read-only consumers.
    #[must_use]
    pub fn snapshot_agent(&self, id: AgentId) -> Option<AgentState> {
        let data = *self.agents.get(id)?;
        let runtime = self.runtime.get(id)?.clone();
        Some(AgentState { id, data, runtime })
    }

    /// Iterate over retained generation summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &GenerationSummary> {
        self.history.iter()
    }
}

fn sense_agent(
    environment: &Environment,
    offsets: &[f32],
    ray_length: f32,
    reach: RayReach,
    position: Position,
    velocity: Velocity,
    heading: f32,
) -> (Vec<f32>, Vec<RaySample>) {
    let mut sensors = Vec::with_capacity(offsets.len() + BODY_INPUTS);
    let mut rays = Vec::with_capacity(offsets.len());
    for &offset in offsets {
        let theta = heading + offset;
        let tip = Position::new(
            position.x + ray_length * theta.cos(),
            position.y + ray_length * theta.sin(),
        );
        let sample = cast_ray(environment, position, tip, ray_length, reach);
        sensors.push(sample.distance);
        rays.push(sample);
    }
    sensors.extend_from_slice(&[position.x, position.y, velocity.vx, velocity.vy, heading]);
    (sensors, rays)
}
