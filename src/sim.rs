//! Synthetic data: ground-truth trajectories, noisy position fixes, a demo
//! route graph and simulated recognizers.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{NavError, NavResult};
use crate::map_match::{NodeId, NodeType, RouteGraph};
use crate::recognizer::{CameraFrame, Recognizer};
use crate::types::{
    wrap_angle, ClueCandidate, LatLon, LocClue, Point2, Polar2, Pose2, PositionFix, RelativeObservation,
};

// ─── Noise ───────────────────────────────────────────────────────────────────

/// Seeded Gaussian noise source
///
/// Seed 0 draws from entropy, any other seed is reproducible.
#[derive(Clone, Debug)]
pub struct NoiseGenerator {
    rng: StdRng,
}

impl NoiseGenerator {
    pub fn new(seed: u64) -> Self {
        let rng = if seed == 0 {
            StdRng::from_entropy()
        } else {
            StdRng::seed_from_u64(seed)
        };
        Self { rng }
    }

    pub fn gaussian(&mut self, stddev: f64) -> f64 {
        if stddev <= 0.0 {
            return 0.0;
        }
        let n: f64 = self.rng.sample(StandardNormal);
        n * stddev
    }
}

// ─── Trajectories ────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrajectoryKind {
    Stop,
    Line,
    Circle,
    Sine,
    Square,
}

impl TrajectoryKind {
    pub fn all() -> [TrajectoryKind; 5] {
        [
            TrajectoryKind::Stop,
            TrajectoryKind::Line,
            TrajectoryKind::Circle,
            TrajectoryKind::Sine,
            TrajectoryKind::Square,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrajectoryKind::Stop => "Stop",
            TrajectoryKind::Line => "Line",
            TrajectoryKind::Circle => "Circle",
            TrajectoryKind::Sine => "Sine",
            TrajectoryKind::Square => "Square",
        }
    }
}

impl fmt::Display for TrajectoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TrajectoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrajectoryKind::all()
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown trajectory '{}'", s))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrajectoryConfig {
    pub speed: f64,
    pub duration: f64,
    pub circle_radius: f64,
    pub sine_amplitude: f64,
    pub sine_wavelength: f64,
    pub square_side: f64,
    pub start: Pose2,
}

impl Default for TrajectoryConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            duration: 60.0,
            circle_radius: 10.0,
            sine_amplitude: 5.0,
            sine_wavelength: 40.0,
            square_side: 20.0,
            start: Pose2::new(100.0, 100.0, 0.0),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TruthSample {
    pub timestamp: f64,
    pub pose: Pose2,
    pub velocity: Polar2,
}

/// Sample a trajectory at `freq_hz` from t = 0 to the configured duration
pub fn generate_trajectory(kind: TrajectoryKind, freq_hz: f64, config: &TrajectoryConfig) -> Vec<TruthSample> {
    if !(freq_hz > 0.0) || !(config.duration >= 0.0) {
        return Vec::new();
    }
    let n = (config.duration * freq_hz).floor() as usize;
    (0..=n)
        .map(|i| {
            let t = i as f64 / freq_hz;
            truth_at(kind, t, config)
        })
        .collect()
}

/// Closed-form ground truth at time `t`
pub fn truth_at(kind: TrajectoryKind, t: f64, config: &TrajectoryConfig) -> TruthSample {
    let v = config.speed;
    // Local frame: start at origin heading +x
    let (local, lin, ang) = match kind {
        TrajectoryKind::Stop => (Pose2::new(0.0, 0.0, 0.0), 0.0, 0.0),
        TrajectoryKind::Line => (Pose2::new(v * t, 0.0, 0.0), v, 0.0),
        TrajectoryKind::Circle => {
            let r = config.circle_radius;
            let w = v / r;
            let theta = w * t;
            (Pose2::new(r * theta.sin(), r * (1.0 - theta.cos()), theta), v, w)
        }
        TrajectoryKind::Sine => {
            let a = config.sine_amplitude;
            let k = 2.0 * PI / config.sine_wavelength;
            let u = v * t;
            let slope = a * k * (k * u).cos();
            let theta = slope.atan();
            let dtheta_du = -a * k * k * (k * u).sin() / (1.0 + slope * slope);
            (
                Pose2::new(u, a * (k * u).sin(), theta),
                v * (1.0 + slope * slope).sqrt(),
                dtheta_du * v,
            )
        }
        TrajectoryKind::Square => {
            let side = config.square_side;
            let s = (v * t) % (4.0 * side);
            let leg = (s / side).floor().min(3.0);
            let along = s - leg * side;
            let corners = [(0.0, 0.0), (side, 0.0), (side, side), (0.0, side)];
            let (cx, cy) = corners[leg as usize];
            let heading = leg * FRAC_PI_2;
            (
                Pose2::new(cx + along * heading.cos(), cy + along * heading.sin(), wrap_angle(heading)),
                v,
                0.0,
            )
        }
    };

    let start = config.start;
    let (c, s) = (start.theta.cos(), start.theta.sin());
    TruthSample {
        timestamp: t,
        pose: Pose2::new(
            start.x + c * local.x - s * local.y,
            start.y + s * local.x + c * local.y,
            wrap_angle(start.theta + local.theta),
        ),
        velocity: Polar2::new(lin, ang),
    }
}

// ─── Position fixes ──────────────────────────────────────────────────────────

/// Noisy position fixes from an antenna mounted at `offset` in the body frame
#[derive(Clone, Debug)]
pub struct GpsSimulator {
    pub noise: f64,
    pub offset: Polar2,
    rng: NoiseGenerator,
}

impl GpsSimulator {
    pub fn new(noise: f64, offset: Polar2, seed: u64) -> Self {
        Self {
            noise,
            offset,
            rng: NoiseGenerator::new(seed),
        }
    }

    pub fn observe(&mut self, pose: &Pose2, timestamp: f64) -> PositionFix {
        let heading = pose.theta + self.offset.ang;
        PositionFix::new(
            pose.x + self.offset.lin * heading.cos() + self.rng.gaussian(self.noise),
            pose.y + self.offset.lin * heading.sin() + self.rng.gaussian(self.noise),
            timestamp,
        )
    }

    pub fn observe_all(&mut self, truth: &[TruthSample]) -> Vec<PositionFix> {
        truth.iter().map(|s| self.observe(&s.pose, s.timestamp)).collect()
    }
}

// ─── Demo map ────────────────────────────────────────────────────────────────

/// Reference point of the demo map
pub const DEMO_REFERENCE: LatLon = LatLon {
    lat: 36.383837659737,
    lon: 127.367880828442,
};

/// Id of grid node (row, col)
pub fn grid_node_id(cols: usize, row: usize, col: usize) -> NodeId {
    (row * cols + col + 1) as NodeId
}

/// Rectangular street grid with 4-neighbour roads
///
/// Nodes on row 0 with an odd column are crossings, the top-right corner is a
/// building entry.
pub fn demo_grid_map(rows: usize, cols: usize, spacing: f64) -> NavResult<RouteGraph> {
    if rows < 2 || cols < 2 {
        return Err(NavError::InvalidGraph(format!("grid {}x{} is too small", rows, cols)));
    }
    let mut graph = RouteGraph::new(DEMO_REFERENCE);
    for row in 0..rows {
        for col in 0..cols {
            let node_type = if row == rows - 1 && col == cols - 1 {
                NodeType::BuildingEntry
            } else if row == 0 && col % 2 == 1 {
                NodeType::Crossing
            } else {
                NodeType::Junction
            };
            graph.add_node_at(
                grid_node_id(cols, row, col),
                Point2::new(col as f64 * spacing, row as f64 * spacing),
                node_type,
            )?;
        }
    }
    for row in 0..rows {
        for col in 0..cols {
            let id = grid_node_id(cols, row, col);
            if col + 1 < cols {
                graph.add_road(id, grid_node_id(cols, row, col + 1))?;
            }
            if row + 1 < rows {
                graph.add_road(id, grid_node_id(cols, row + 1, col))?;
            }
        }
    }
    Ok(graph)
}

/// East along row 0, then north up the last column
pub fn demo_route(rows: usize, cols: usize) -> Vec<NodeId> {
    let east = (0..cols).map(|col| grid_node_id(cols, 0, col));
    let north = (1..rows).map(|row| grid_node_id(cols, row, cols - 1));
    east.chain(north).collect()
}

/// Constant-speed walk along a node route
#[derive(Clone, Debug)]
pub struct RouteWalker {
    points: Vec<Point2>,
    cumulative: Vec<f64>,
    speed: f64,
}

impl RouteWalker {
    pub fn new(graph: &RouteGraph, route: &[NodeId], speed: f64) -> NavResult<Self> {
        if route.len() < 2 {
            return Err(NavError::InvalidPath("route needs at least two nodes".into()));
        }
        if !(speed > 0.0) {
            return Err(NavError::InvalidPath(format!("walking speed {} must be positive", speed)));
        }
        let points = route
            .iter()
            .map(|&id| graph.node(id).map(|n| n.position))
            .collect::<NavResult<Vec<_>>>()?;
        let mut cumulative = vec![0.0];
        for w in points.windows(2) {
            let last = cumulative.last().copied().unwrap_or(0.0);
            cumulative.push(last + w[0].distance(&w[1]));
        }
        Ok(Self {
            points,
            cumulative,
            speed,
        })
    }

    pub fn length(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    pub fn duration(&self) -> f64 {
        self.length() / self.speed
    }

    /// Pose at time `t`, clamped to the route ends
    pub fn pose_at(&self, t: f64) -> Pose2 {
        let s = (t * self.speed).clamp(0.0, self.length());
        let seg = self
            .cumulative
            .windows(2)
            .position(|w| s <= w[1])
            .unwrap_or(self.points.len() - 2);
        let (a, b) = (self.points[seg], self.points[seg + 1]);
        let len = self.cumulative[seg + 1] - self.cumulative[seg];
        let frac = if len > 0.0 { (s - self.cumulative[seg]) / len } else { 0.0 };
        Pose2::new(
            a.x + (b.x - a.x) * frac,
            a.y + (b.y - a.y) * frac,
            (b.y - a.y).atan2(b.x - a.x),
        )
    }
}

// ─── Simulated recognizers ───────────────────────────────────────────────────

fn frame_truth(frame: &CameraFrame) -> NavResult<Pose2> {
    frame
        .ground_truth
        .ok_or_else(|| NavError::Recognizer("frame carries no capture pose".into()))
}

/// Reports the direction of the road being walked
pub struct RoadDirectionRecognizer {
    pub noise: f64,
    pub confidence: f64,
    rng: NoiseGenerator,
}

impl RoadDirectionRecognizer {
    pub fn new(noise: f64, confidence: f64, seed: u64) -> Self {
        Self {
            noise,
            confidence,
            rng: NoiseGenerator::new(seed),
        }
    }
}

impl Recognizer for RoadDirectionRecognizer {
    fn name(&self) -> &str {
        "road_direction"
    }

    fn apply(&mut self, frame: &CameraFrame, timestamp: f64) -> NavResult<Option<LocClue>> {
        let truth = frame_truth(frame)?;
        let theta = wrap_angle(truth.theta + self.rng.gaussian(self.noise));
        Ok(Some(LocClue::heading(theta, self.confidence, timestamp)))
    }
}

/// Recognizes graph nodes in view and reports them as range/bearing landmarks
///
/// Up to `max_candidates` nodes within `range` are returned, nearest first, with
/// confidence falling off with distance.
pub struct PlaceRecognizer {
    graph: Arc<RouteGraph>,
    pub range: f64,
    pub range_noise: f64,
    pub bearing_noise: f64,
    pub max_candidates: usize,
    rng: NoiseGenerator,
}

impl PlaceRecognizer {
    pub fn new(graph: Arc<RouteGraph>, range: f64, seed: u64) -> Self {
        Self {
            graph,
            range,
            range_noise: 0.5,
            bearing_noise: 0.05,
            max_candidates: 2,
            rng: NoiseGenerator::new(seed),
        }
    }
}

impl Recognizer for PlaceRecognizer {
    fn name(&self) -> &str {
        "place"
    }

    fn apply(&mut self, frame: &CameraFrame, timestamp: f64) -> NavResult<Option<LocClue>> {
        let truth = frame_truth(frame)?;
        let here = truth.position();

        let mut visible: Vec<(NodeId, Point2, f64)> = self
            .graph
            .nodes()
            .map(|n| (n.id, n.position, n.position.distance(&here)))
            .filter(|(_, _, d)| *d <= self.range)
            .collect();
        if visible.is_empty() {
            return Ok(None);
        }
        visible.sort_by(|a, b| a.2.total_cmp(&b.2).then(a.0.cmp(&b.0)));
        visible.truncate(self.max_candidates.max(1));

        let candidates = visible
            .into_iter()
            .map(|(id, p, d)| {
                let bearing = (p.y - here.y).atan2(p.x - here.x) - truth.theta;
                ClueCandidate {
                    landmark: Some(id),
                    observation: RelativeObservation::Polar {
                        distance: (d + self.rng.gaussian(self.range_noise)).max(0.0),
                        bearing: wrap_angle(bearing + self.rng.gaussian(self.bearing_noise)),
                    },
                    confidence: (1.0 - d / self.range).clamp(0.05, 0.95),
                }
            })
            .collect();
        Ok(Some(LocClue::new(candidates, timestamp)))
    }
}
