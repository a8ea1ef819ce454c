/// Planar Extended Kalman Filter localizer
///
/// State Vector (5D):
/// [0-1]: Position (x, y) in the local metric frame (meters, x east / y north)
/// [2]:   Heading theta (rad, CCW from east)
/// [3]:   Linear velocity v (m/s)
/// [4]:   Angular velocity w (rad/s)
///
/// Fuses absolute position fixes and vision clues (heading, landmark range/bearing,
/// landmark identity) and keeps a topometric pose on the loaded route graph.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use nalgebra::{Matrix1, Matrix2, Vector1, Vector2};

use super::kalman::joseph_update;
use super::motion_model::{MotionModel, MotionModelKind};
use crate::error::{NavError, NavResult};
use crate::map_match::graph_io::load_graph;
use crate::map_match::matcher::{topometric_to_metric, TopometricProjector};
use crate::map_match::route_graph::{NodeId, RouteGraph};
use crate::map_match::GeoConverter;
use crate::types::{
    wrap_angle, ClueCandidate, JacobianAngle, JacobianPolar, JacobianPos, LatLon, LocClue, Point2,
    Polar2, PosNoise, PosVec, Pose2, PositionFix, RelativeObservation, StateMat, StateVec,
    TopometricPose, IDX_THETA, IDX_V, IDX_W, IDX_X, IDX_Y,
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Axis-aligned metric rectangle where position fixes are rejected
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadZone {
    pub min: Point2,
    pub max: Point2,
}

impl DeadZone {
    pub fn new(a: Point2, b: Point2) -> Self {
        Self {
            min: Point2::new(a.x.min(b.x), a.y.min(b.y)),
            max: Point2::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min.x && x <= self.max.x && y >= self.min.y && y <= self.max.y
    }
}

/// How the candidates of one clue are fused
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClueFusionPolicy {
    /// Every usable candidate, descending confidence, as independent updates
    #[default]
    Sequential,
    /// Only the highest-ranked usable candidate
    BestOnly,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    pub motion_model: MotionModelKind,

    // ── Process noise (random walk on v, w) ──
    pub motion_noise_lin: f64,
    pub motion_noise_ang: f64,

    // ── Position fixes ──
    pub gps_noise: f64,
    /// Antenna offset from the robot center (distance, angle from heading)
    pub gps_offset: Polar2,
    pub dead_zones: Vec<DeadZone>,

    // ── Clues ──
    pub heading_noise: f64,
    pub landmark_range_noise: f64,
    pub landmark_bearing_noise: f64,
    pub landmark_position_noise: f64,
    pub fusion_policy: ClueFusionPolicy,

    // ── Topometric projection ──
    pub projection_search_radius: f64,

    // ── Confidence ──
    pub confidence_reference_var: f64,
    pub confidence_decay: f64,
    pub lost_confidence_threshold: f64,

    // ── Initial uncertainty ──
    pub init_position_var: f64,
    pub init_heading_var: f64,
    pub init_lin_vel_var: f64,
    pub init_ang_vel_var: f64,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            motion_model: MotionModelKind::Standard,
            motion_noise_lin: 0.1,
            motion_noise_ang: 0.1,
            gps_noise: 0.5,
            gps_offset: Polar2::default(),
            dead_zones: Vec::new(),
            heading_noise: 0.2,
            landmark_range_noise: 2.0,
            landmark_bearing_noise: 0.1,
            landmark_position_noise: 5.0,
            fusion_policy: ClueFusionPolicy::Sequential,
            projection_search_radius: 10.0,
            confidence_reference_var: 2.0,
            confidence_decay: 0.05,
            lost_confidence_threshold: 0.2,
            init_position_var: 100.0,
            init_heading_var: 10.0,
            init_lin_vel_var: 1.0,
            init_ang_vel_var: 0.25,
        }
    }
}

fn require(ok: bool, what: &str, value: f64) -> NavResult<()> {
    if ok {
        Ok(())
    } else {
        Err(NavError::InvalidConfig(format!("{} = {}", what, value)))
    }
}

impl LocalizerConfig {
    /// Reject noise and radius values that would break the filter arithmetic
    pub fn validate(&self) -> NavResult<()> {
        self.motion_model.validate()?;
        let positive = |v: f64| v.is_finite() && v > 0.0;
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        require(non_negative(self.motion_noise_lin), "motion_noise_lin", self.motion_noise_lin)?;
        require(non_negative(self.motion_noise_ang), "motion_noise_ang", self.motion_noise_ang)?;
        require(positive(self.gps_noise), "gps_noise", self.gps_noise)?;
        require(positive(self.heading_noise), "heading_noise", self.heading_noise)?;
        require(positive(self.landmark_range_noise), "landmark_range_noise", self.landmark_range_noise)?;
        require(
            positive(self.landmark_bearing_noise),
            "landmark_bearing_noise",
            self.landmark_bearing_noise,
        )?;
        require(
            non_negative(self.landmark_position_noise),
            "landmark_position_noise",
            self.landmark_position_noise,
        )?;
        require(
            positive(self.projection_search_radius),
            "projection_search_radius",
            self.projection_search_radius,
        )?;
        require(
            positive(self.confidence_reference_var),
            "confidence_reference_var",
            self.confidence_reference_var,
        )?;
        Ok(())
    }
}

// ─── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalizerStatus {
    Uninitialized,
    Ready,
    Tracking,
}

/// Exact copy of the estimate, for before/after comparisons
#[derive(Clone, Debug, PartialEq)]
pub struct LocalizerSnapshot {
    pub state: StateVec,
    pub covariance: StateMat,
    pub timestamp: Option<f64>,
    pub topometric: Option<TopometricPose>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LocalizerState {
    pub pose: Pose2,
    pub velocity: Polar2,
    pub covariance_trace: f64,
    pub confidence: f64,
    pub topometric: Option<TopometricPose>,
    pub status: LocalizerStatus,

    /// Update counters
    pub position_updates: u64,
    pub clue_updates: u64,
    pub rejected: u64,
}

/// Result of applying one clue
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClueOutcome {
    pub applied: usize,
    pub skipped: usize,
}

// Candidate resolved against the map, ready for a measurement update
#[derive(Clone, Copy, Debug)]
enum Measurement {
    Heading(f64),
    RangeBearing { landmark: Point2, range: f64, bearing: f64 },
    Bearing { landmark: Point2, bearing: f64 },
    LandmarkPosition(Point2),
}

// ─── Localizer ───────────────────────────────────────────────────────────────

pub struct EkfLocalizer {
    config: LocalizerConfig,
    model: Box<dyn MotionModel>,
    converter: GeoConverter,
    map: Option<Arc<RouteGraph>>,
    projector: Option<TopometricProjector>,
    route_hint: Vec<NodeId>,

    /// State vector [5D]
    state: StateVec,

    /// Covariance matrix [5x5]
    covariance: StateMat,

    /// Last accepted observation time [s]
    timestamp: Option<f64>,
    state_set: bool,
    position_known: bool,
    topometric: Option<TopometricPose>,

    /// Update counters
    position_updates: u64,
    clue_updates: u64,
    rejected: u64,
}

impl EkfLocalizer {
    pub fn new(config: LocalizerConfig) -> NavResult<Self> {
        config.validate()?;
        let model = config.motion_model.build()?;
        let covariance = Self::initial_covariance(&config, model.as_ref());
        Ok(Self {
            config,
            model,
            converter: GeoConverter::new(),
            map: None,
            projector: None,
            route_hint: Vec::new(),
            state: StateVec::zeros(),
            covariance,
            timestamp: None,
            state_set: false,
            position_known: false,
            topometric: None,
            position_updates: 0,
            clue_updates: 0,
            rejected: 0,
        })
    }

    fn initial_covariance(config: &LocalizerConfig, model: &dyn MotionModel) -> StateMat {
        let w_var = if model.tracks_angular_velocity() {
            config.init_ang_vel_var
        } else {
            0.0
        };
        StateMat::from_diagonal(&StateVec::from_column_slice(&[
            config.init_position_var,
            config.init_position_var,
            config.init_heading_var,
            config.init_lin_vel_var,
            w_var,
        ]))
    }

    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    // ─── Setup ───────────────────────────────────────────────────────────────

    /// Fix the metric frame origin
    ///
    /// A loaded map and an already-known position are carried over to the new frame.
    pub fn set_reference(&mut self, reference: LatLon) -> NavResult<()> {
        let old = self.converter;
        if old.reference() == Some(reference) {
            return Ok(());
        }
        self.converter.set_reference(reference);

        if self.position_known && old.is_initialized() {
            let ll = old.to_latlon(Point2::new(self.state[IDX_X], self.state[IDX_Y]))?;
            let p = self.converter.to_metric(ll)?;
            self.state[IDX_X] = p.x;
            self.state[IDX_Y] = p.y;
        }

        if let Some(map) = self.map.as_mut() {
            Arc::make_mut(map).rebase(reference)?;
            self.rebuild_projector();
        }
        log::info!("Localizer reference set to ({:.6}, {:.6})", reference.lat, reference.lon);
        Ok(())
    }

    /// Load the route graph used for landmarks and topometric projection
    ///
    /// If no reference is set yet, the graph's own reference is adopted.
    pub fn load_map(&mut self, graph: RouteGraph) -> NavResult<()> {
        let mut graph = graph;
        match self.converter.reference() {
            Some(reference) => {
                if graph.converter().reference() != Some(reference) {
                    graph.rebase(reference)?;
                }
            }
            None => {
                let reference = graph.converter().reference().ok_or(NavError::UninitializedReference)?;
                self.converter.set_reference(reference);
            }
        }
        log::info!(
            "Localizer map loaded: {} nodes, {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        self.map = Some(Arc::new(graph));
        self.rebuild_projector();
        self.refresh_topometric();
        Ok(())
    }

    /// Load a persisted graph (`.json` / `.json.gz`)
    pub fn load_map_file(&mut self, path: &Path) -> NavResult<()> {
        let graph = load_graph(path)?;
        self.load_map(graph)
    }

    pub fn map(&self) -> Option<Arc<RouteGraph>> {
        self.map.clone()
    }

    fn rebuild_projector(&mut self) {
        self.projector = self.map.as_ref().map(|map| {
            let mut projector = TopometricProjector::new(map, self.config.projection_search_radius);
            if !self.route_hint.is_empty() {
                projector.set_route_order(&self.route_hint);
            }
            projector
        });
    }

    /// Route node order used to orient topometric poses toward route start
    pub fn set_route_hint(&mut self, nodes: &[NodeId]) {
        self.route_hint = nodes.to_vec();
        if let Some(projector) = self.projector.as_mut() {
            if nodes.is_empty() {
                projector.clear_route_order();
            } else {
                projector.set_route_order(nodes);
            }
        }
    }

    /// Overwrite the state estimate (pose and velocity)
    pub fn set_state(&mut self, pose: Pose2, velocity: Polar2) {
        self.state = StateVec::from_column_slice(&[
            pose.x,
            pose.y,
            wrap_angle(pose.theta),
            velocity.lin,
            if self.model.tracks_angular_velocity() {
                velocity.ang
            } else {
                0.0
            },
        ]);
        self.state_set = true;
        self.position_known = true;
        if let Some(projector) = self.projector.as_mut() {
            projector.reset();
        }
        self.refresh_topometric();
    }

    pub fn set_motion_noise(&mut self, lin: f64, ang: f64) -> NavResult<()> {
        require(lin.is_finite() && lin >= 0.0, "motion_noise_lin", lin)?;
        require(ang.is_finite() && ang >= 0.0, "motion_noise_ang", ang)?;
        self.config.motion_noise_lin = lin;
        self.config.motion_noise_ang = ang;
        Ok(())
    }

    pub fn set_gps_noise(&mut self, sigma: f64) -> NavResult<()> {
        require(sigma.is_finite() && sigma > 0.0, "gps_noise", sigma)?;
        self.config.gps_noise = sigma;
        Ok(())
    }

    pub fn set_gps_offset(&mut self, offset: Polar2) {
        self.config.gps_offset = offset;
    }

    pub fn set_fusion_policy(&mut self, policy: ClueFusionPolicy) {
        self.config.fusion_policy = policy;
    }

    /// Reject every position fix inside the rectangle spanned by `a` and `b`
    pub fn add_gps_dead_zone(&mut self, a: Point2, b: Point2) {
        self.config.dead_zones.push(DeadZone::new(a, b));
    }

    pub fn clear_gps_dead_zones(&mut self) {
        self.config.dead_zones.clear();
    }

    /// Drop the estimate; reference, map and parameters are kept
    pub fn reset(&mut self) {
        self.state = StateVec::zeros();
        self.covariance = Self::initial_covariance(&self.config, self.model.as_ref());
        self.timestamp = None;
        self.state_set = false;
        self.position_known = false;
        self.topometric = None;
        if let Some(projector) = self.projector.as_mut() {
            projector.reset();
        }
    }

    pub fn status(&self) -> LocalizerStatus {
        let ready = self.state_set || (self.converter.is_initialized() && self.map.is_some());
        match (ready, self.timestamp) {
            (false, _) => LocalizerStatus::Uninitialized,
            (true, None) => LocalizerStatus::Ready,
            (true, Some(_)) => LocalizerStatus::Tracking,
        }
    }

    // ─── Observations ────────────────────────────────────────────────────────

    /// Fuse a position fix in the local metric frame
    ///
    /// # Errors
    /// - `UninitializedLocalizer` before reference+map or `set_state`
    /// - `InvalidObservation` for non-finite values or a non-positive noise scale
    /// - `StaleObservation` when older than the last accepted observation
    /// - `OutlierRejected` inside a dead zone
    ///
    /// The estimate is unchanged on every error.
    pub fn apply_position(&mut self, fix: &PositionFix) -> NavResult<()> {
        if self.status() == LocalizerStatus::Uninitialized {
            return Err(NavError::UninitializedLocalizer);
        }
        if !(fix.x.is_finite() && fix.y.is_finite() && fix.timestamp.is_finite()) {
            return Err(NavError::InvalidObservation("non-finite position fix".to_string()));
        }
        if !(fix.noise_scale.is_finite() && fix.noise_scale > 0.0) {
            return Err(NavError::InvalidObservation(format!(
                "noise scale {} must be positive",
                fix.noise_scale
            )));
        }
        self.check_stale(fix.timestamp)?;
        if self.config.dead_zones.iter().any(|z| z.contains(fix.x, fix.y)) {
            self.rejected += 1;
            log::debug!("Position fix ({:.1}, {:.1}) inside dead zone", fix.x, fix.y);
            return Err(NavError::OutlierRejected { x: fix.x, y: fix.y });
        }

        let var = self.config.gps_noise * self.config.gps_noise * fix.noise_scale;

        if !self.position_known {
            // First fix seeds the position; heading stays unknown
            let (ox, oy) = self.antenna_offset(self.state[IDX_THETA]);
            self.state[IDX_X] = fix.x - ox;
            self.state[IDX_Y] = fix.y - oy;
            self.covariance[(IDX_X, IDX_X)] = var;
            self.covariance[(IDX_Y, IDX_Y)] = var;
            self.position_known = true;
            log::info!("Localizer initialized at ({:.2}, {:.2})", fix.x, fix.y);
        } else {
            self.predict(fix.timestamp);

            let theta = self.state[IDX_THETA];
            let (ox, oy) = self.antenna_offset(theta);
            let mut h = JacobianPos::zeros();
            h[(0, IDX_X)] = 1.0;
            h[(1, IDX_Y)] = 1.0;
            h[(0, IDX_THETA)] = -oy;
            h[(1, IDX_THETA)] = ox;

            let innovation = PosVec::new(
                fix.x - (self.state[IDX_X] + ox),
                fix.y - (self.state[IDX_Y] + oy),
            );
            let r = PosNoise::identity() * var;
            if joseph_update(&mut self.state, &mut self.covariance, &h, &innovation, &r).is_none() {
                log::warn!("Singular innovation covariance on position update, skipped");
            }
            self.normalize_state();
        }

        self.timestamp = Some(fix.timestamp);
        self.position_updates += 1;
        self.refresh_topometric();
        Ok(())
    }

    /// Fuse a geodetic position fix through the reference frame
    pub fn apply_gps(&mut self, ll: LatLon, timestamp: f64, noise_scale: f64) -> NavResult<()> {
        let p = self.converter.to_metric(ll)?;
        self.apply_position(&PositionFix::new(p.x, p.y, timestamp).with_noise_scale(noise_scale))
    }

    /// Fuse a localization clue
    ///
    /// Candidates are ranked by descending confidence (ties: no-id first, then
    /// ascending id) and applied as independent updates, or only the first one
    /// under [`ClueFusionPolicy::BestOnly`]. Zero-confidence candidates, unknown
    /// landmarks and id-less candidates without a bearing are skipped. When no
    /// candidate is usable the estimate is unchanged.
    ///
    /// # Errors
    /// - `UninitializedLocalizer` before the position is known
    /// - `InvalidObservation` for confidences outside [0, 1] or malformed geometry
    /// - `StaleObservation` when older than the last accepted observation
    pub fn apply_loc_clue(&mut self, clue: &LocClue) -> NavResult<ClueOutcome> {
        if self.status() == LocalizerStatus::Uninitialized || !self.position_known {
            return Err(NavError::UninitializedLocalizer);
        }
        if !clue.timestamp.is_finite() {
            return Err(NavError::InvalidObservation("non-finite clue timestamp".to_string()));
        }
        for c in &clue.candidates {
            validate_candidate(c)?;
        }
        self.check_stale(clue.timestamp)?;

        let mut ranked: Vec<&ClueCandidate> = clue.candidates.iter().collect();
        ranked.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.landmark.cmp(&b.landmark))
        });

        let mut outcome = ClueOutcome::default();
        let mut usable: Vec<(Measurement, f64)> = Vec::new();
        for c in ranked {
            match self.resolve(c) {
                Some(m) if usable.is_empty() || self.config.fusion_policy == ClueFusionPolicy::Sequential => {
                    usable.push((m, c.confidence))
                }
                _ => outcome.skipped += 1,
            }
        }
        if usable.is_empty() {
            return Ok(outcome);
        }

        self.predict(clue.timestamp);
        for (measurement, confidence) in usable {
            if self.apply_measurement(measurement, confidence) {
                outcome.applied += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        self.timestamp = Some(clue.timestamp);
        self.clue_updates += 1;
        self.refresh_topometric();
        log::debug!(
            "Clue t={:.2}: {} applied, {} skipped",
            clue.timestamp,
            outcome.applied,
            outcome.skipped
        );
        Ok(outcome)
    }

    fn check_stale(&self, timestamp: f64) -> NavResult<()> {
        match self.timestamp {
            Some(last) if timestamp < last => Err(NavError::StaleObservation { timestamp, last }),
            _ => Ok(()),
        }
    }

    fn resolve(&self, c: &ClueCandidate) -> Option<Measurement> {
        if c.confidence <= 0.0 {
            return None;
        }
        let Some(id) = c.landmark else {
            return c.observation.bearing().map(Measurement::Heading);
        };
        let landmark = match self.map.as_ref().and_then(|m| m.find_node(id)) {
            Some(node) => node.position,
            None => {
                log::warn!("Clue references unknown landmark {}, skipped", id);
                return None;
            }
        };
        Some(match c.observation {
            RelativeObservation::Polar { distance, bearing } => Measurement::RangeBearing {
                landmark,
                range: distance,
                bearing,
            },
            RelativeObservation::Bearing(bearing) => Measurement::Bearing { landmark, bearing },
            RelativeObservation::None => Measurement::LandmarkPosition(landmark),
        })
    }

    // Returns false when the measurement is degenerate at the current estimate
    fn apply_measurement(&mut self, measurement: Measurement, confidence: f64) -> bool {
        let (x, y, theta) = (self.state[IDX_X], self.state[IDX_Y], self.state[IDX_THETA]);
        let applied = match measurement {
            Measurement::Heading(heading) => {
                let mut h = JacobianAngle::zeros();
                h[(0, IDX_THETA)] = 1.0;
                let innovation = Vector1::new(wrap_angle(heading - theta));
                let r = Matrix1::new(self.config.heading_noise.powi(2) / confidence);
                joseph_update(&mut self.state, &mut self.covariance, &h, &innovation, &r)
            }
            Measurement::RangeBearing { landmark, range, bearing } => {
                let (dx, dy) = (landmark.x - x, landmark.y - y);
                let q = dx * dx + dy * dy;
                if q < 1e-6 {
                    return false;
                }
                let expected_range = q.sqrt();
                let expected_bearing = wrap_angle(dy.atan2(dx) - theta);

                let mut h = JacobianPolar::zeros();
                h[(0, IDX_X)] = -dx / expected_range;
                h[(0, IDX_Y)] = -dy / expected_range;
                h[(1, IDX_X)] = dy / q;
                h[(1, IDX_Y)] = -dx / q;
                h[(1, IDX_THETA)] = -1.0;
                let innovation = Vector2::new(
                    range - expected_range,
                    wrap_angle(bearing - expected_bearing),
                );
                let r = Matrix2::new(
                    self.config.landmark_range_noise.powi(2),
                    0.0,
                    0.0,
                    self.config.landmark_bearing_noise.powi(2),
                ) / confidence;
                joseph_update(&mut self.state, &mut self.covariance, &h, &innovation, &r)
            }
            Measurement::Bearing { landmark, bearing } => {
                let (dx, dy) = (landmark.x - x, landmark.y - y);
                let q = dx * dx + dy * dy;
                if q < 1e-6 {
                    return false;
                }
                let mut h = JacobianAngle::zeros();
                h[(0, IDX_X)] = dy / q;
                h[(0, IDX_Y)] = -dx / q;
                h[(0, IDX_THETA)] = -1.0;
                let innovation = Vector1::new(wrap_angle(bearing - (dy.atan2(dx) - theta)));
                let r = Matrix1::new(self.config.landmark_bearing_noise.powi(2) / confidence);
                joseph_update(&mut self.state, &mut self.covariance, &h, &innovation, &r)
            }
            Measurement::LandmarkPosition(landmark) => {
                let mut h = JacobianPos::zeros();
                h[(0, IDX_X)] = 1.0;
                h[(1, IDX_Y)] = 1.0;
                let innovation = PosVec::new(landmark.x - x, landmark.y - y);
                let r = PosNoise::identity() * (self.config.landmark_position_noise.powi(2) / confidence);
                joseph_update(&mut self.state, &mut self.covariance, &h, &innovation, &r)
            }
        };
        self.normalize_state();
        applied.is_some()
    }

    fn predict(&mut self, timestamp: f64) {
        let dt = match self.timestamp {
            Some(last) => timestamp - last,
            None => 0.0,
        };
        if dt <= 0.0 {
            return;
        }

        let f = self.model.jacobian(&self.state, dt);
        let q = self.model.process_noise(
            &self.state,
            dt,
            self.config.motion_noise_lin,
            self.config.motion_noise_ang,
        );
        self.state = self.model.transition(&self.state, dt);
        let p = f * self.covariance * f.transpose() + q;
        self.covariance = (p + p.transpose()) * 0.5;
    }

    fn normalize_state(&mut self) {
        self.state[IDX_THETA] = wrap_angle(self.state[IDX_THETA]);
        if !self.model.tracks_angular_velocity() {
            self.state[IDX_W] = 0.0;
        }
    }

    fn antenna_offset(&self, theta: f64) -> (f64, f64) {
        let offset = self.config.gps_offset;
        let a = theta + offset.ang;
        (offset.lin * a.cos(), offset.lin * a.sin())
    }

    fn refresh_topometric(&mut self) {
        if !self.position_known {
            self.topometric = None;
            return;
        }
        let pose = self.pose();
        if let (Some(map), Some(projector)) = (self.map.as_ref(), self.projector.as_mut()) {
            self.topometric = projector.project(map, &pose);
        }
    }

    // ─── Outputs ─────────────────────────────────────────────────────────────

    pub fn pose(&self) -> Pose2 {
        Pose2::new(self.state[IDX_X], self.state[IDX_Y], self.state[IDX_THETA])
    }

    /// Current position as latitude/longitude
    pub fn pose_gps(&self) -> NavResult<LatLon> {
        self.converter
            .to_latlon(Point2::new(self.state[IDX_X], self.state[IDX_Y]))
    }

    pub fn topometric(&self) -> Option<TopometricPose> {
        self.topometric
    }

    pub fn velocity(&self) -> Polar2 {
        Polar2::new(self.state[IDX_V], self.state[IDX_W])
    }

    pub fn covariance(&self) -> StateMat {
        self.covariance
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    /// Confidence at the time of the last accepted observation
    pub fn pose_confidence(&self) -> f64 {
        match self.timestamp {
            Some(t) => self.pose_confidence_at(t),
            None => 0.0,
        }
    }

    /// Confidence in [0, 1], decayed by the time elapsed since the last update
    pub fn pose_confidence_at(&self, now: f64) -> f64 {
        let Some(last) = self.timestamp else {
            return 0.0;
        };
        let trace_xy = self.covariance[(IDX_X, IDX_X)] + self.covariance[(IDX_Y, IDX_Y)];
        let v_ref = self.config.confidence_reference_var;
        let base = v_ref / (v_ref + trace_xy.max(0.0));
        let elapsed = (now - last).max(0.0);
        (base * (-self.config.confidence_decay * elapsed).exp()).clamp(0.0, 1.0)
    }

    pub fn is_lost(&self, now: f64) -> bool {
        self.pose_confidence_at(now) < self.config.lost_confidence_threshold
    }

    pub fn to_metric(&self, ll: LatLon) -> NavResult<Point2> {
        self.converter.to_metric(ll)
    }

    pub fn to_latlon(&self, p: Point2) -> NavResult<LatLon> {
        self.converter.to_latlon(p)
    }

    pub fn topometric_to_metric(&self, tp: &TopometricPose) -> Option<Pose2> {
        self.map.as_ref().and_then(|map| topometric_to_metric(map, tp))
    }

    pub fn snapshot(&self) -> LocalizerSnapshot {
        LocalizerSnapshot {
            state: self.state,
            covariance: self.covariance,
            timestamp: self.timestamp,
            topometric: self.topometric,
        }
    }

    pub fn get_state(&self) -> LocalizerState {
        LocalizerState {
            pose: self.pose(),
            velocity: self.velocity(),
            covariance_trace: self.covariance.trace(),
            confidence: self.pose_confidence(),
            topometric: self.topometric,
            status: self.status(),
            position_updates: self.position_updates,
            clue_updates: self.clue_updates,
            rejected: self.rejected,
        }
    }
}

fn validate_candidate(c: &ClueCandidate) -> NavResult<()> {
    if !(0.0..=1.0).contains(&c.confidence) {
        return Err(NavError::InvalidObservation(format!(
            "confidence {} outside [0, 1]",
            c.confidence
        )));
    }
    match c.observation {
        RelativeObservation::Polar { distance, bearing } => {
            if !(distance.is_finite() && distance >= 0.0 && bearing.is_finite()) {
                return Err(NavError::InvalidObservation(format!(
                    "invalid polar observation ({}, {})",
                    distance, bearing
                )));
            }
        }
        RelativeObservation::Bearing(bearing) => {
            if !bearing.is_finite() {
                return Err(NavError::InvalidObservation("non-finite bearing".to_string()));
            }
        }
        RelativeObservation::None => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_match::route_graph::NodeType;
    use approx::assert_relative_eq;

    fn test_graph() -> RouteGraph {
        let mut graph = RouteGraph::new(LatLon::new(36.38, 127.37));
        graph.add_node_at(1, Point2::new(0.0, 0.0), NodeType::Junction).unwrap();
        graph.add_node_at(2, Point2::new(50.0, 0.0), NodeType::Junction).unwrap();
        graph.add_node_at(3, Point2::new(50.0, 50.0), NodeType::Junction).unwrap();
        graph.add_node_at(5, Point2::new(20.0, 0.0), NodeType::Junction).unwrap();
        graph.add_road(1, 2).unwrap();
        graph.add_road(2, 3).unwrap();
        graph
    }

    fn mapped_localizer() -> EkfLocalizer {
        let mut loc = EkfLocalizer::new(LocalizerConfig::default()).unwrap();
        loc.load_map(test_graph()).unwrap();
        loc
    }

    fn tracking_localizer() -> EkfLocalizer {
        let mut loc = mapped_localizer();
        loc.set_state(Pose2::new(0.0, 0.0, 0.0), Polar2::default());
        loc.apply_position(&PositionFix::new(0.0, 0.0, 0.0)).unwrap();
        loc
    }

    #[test]
    fn test_uninitialized() {
        let mut loc = EkfLocalizer::new(LocalizerConfig::default()).unwrap();
        assert_eq!(loc.status(), LocalizerStatus::Uninitialized);
        assert!(matches!(
            loc.apply_position(&PositionFix::new(1.0, 1.0, 0.0)),
            Err(NavError::UninitializedLocalizer)
        ));
        assert!(matches!(
            loc.apply_gps(LatLon::new(36.38, 127.37), 0.0, 1.0),
            Err(NavError::UninitializedReference)
        ));
        assert!(matches!(
            loc.apply_loc_clue(&LocClue::heading(0.0, 1.0, 0.0)),
            Err(NavError::UninitializedLocalizer)
        ));
        assert!(loc.pose_gps().is_err());
    }

    #[test]
    fn test_status_transitions() {
        let mut loc = mapped_localizer();
        assert_eq!(loc.status(), LocalizerStatus::Ready);
        loc.apply_position(&PositionFix::new(3.0, 4.0, 1.0)).unwrap();
        assert_eq!(loc.status(), LocalizerStatus::Tracking);
        loc.reset();
        assert_eq!(loc.status(), LocalizerStatus::Ready);
        assert!(loc.timestamp().is_none());
        assert!(loc.topometric().is_none());
    }

    #[test]
    fn test_first_fix_initializes_position() {
        let mut loc = mapped_localizer();
        loc.apply_position(&PositionFix::new(3.0, 4.0, 1.0)).unwrap();
        assert_relative_eq!(loc.pose().x, 3.0);
        assert_relative_eq!(loc.pose().y, 4.0);
        assert_relative_eq!(loc.covariance()[(0, 0)], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_convergence_and_non_increasing_trace() {
        let mut loc = EkfLocalizer::new(LocalizerConfig::default()).unwrap();
        loc.set_state(Pose2::new(10.0, -5.0, 0.0), Polar2::default());

        let mut last_trace = loc.covariance().trace();
        for _ in 0..10 {
            loc.apply_position(&PositionFix::new(3.0, 4.0, 0.0)).unwrap();
            let trace = loc.covariance().trace();
            assert!(trace <= last_trace + 1e-12, "trace grew: {} -> {}", last_trace, trace);
            last_trace = trace;
        }
        let pose = loc.pose();
        assert!((pose.x - 3.0).abs() < 0.05 && (pose.y - 4.0).abs() < 0.05, "{:?}", pose);
    }

    #[test]
    fn test_stale_observation_leaves_state() {
        let mut loc = tracking_localizer();
        loc.apply_position(&PositionFix::new(1.0, 0.0, 2.0)).unwrap();
        let before = loc.snapshot();

        let result = loc.apply_position(&PositionFix::new(5.0, 5.0, 1.0));
        assert!(matches!(result, Err(NavError::StaleObservation { .. })));
        assert_eq!(loc.snapshot(), before);

        let result = loc.apply_loc_clue(&LocClue::heading(1.0, 1.0, 1.5));
        assert!(matches!(result, Err(NavError::StaleObservation { .. })));
        assert_eq!(loc.snapshot(), before);
    }

    #[test]
    fn test_equal_timestamp_is_accepted() {
        let mut loc = tracking_localizer();
        loc.apply_position(&PositionFix::new(1.0, 0.0, 2.0)).unwrap();
        assert!(loc.apply_position(&PositionFix::new(1.0, 0.0, 2.0)).is_ok());
    }

    #[test]
    fn test_dead_zone_rejection() {
        let mut loc = tracking_localizer();
        loc.add_gps_dead_zone(Point2::new(10.0, 10.0), Point2::new(-10.0, 5.0));
        let before = loc.snapshot();

        let result = loc.apply_position(&PositionFix::new(2.0, 7.0, 1.0));
        assert!(matches!(result, Err(NavError::OutlierRejected { .. })));
        assert_eq!(loc.snapshot(), before);
        assert_eq!(loc.get_state().rejected, 1);

        // Outside the zone still works
        assert!(loc.apply_position(&PositionFix::new(2.0, 4.0, 1.0)).is_ok());
    }

    #[test]
    fn test_invalid_observations_leave_state() {
        let mut loc = tracking_localizer();
        let before = loc.snapshot();

        let bad_conf = LocClue::heading(0.3, 1.5, 1.0);
        assert!(matches!(loc.apply_loc_clue(&bad_conf), Err(NavError::InvalidObservation(_))));

        let bad_scale = PositionFix::new(1.0, 1.0, 1.0).with_noise_scale(0.0);
        assert!(matches!(loc.apply_position(&bad_scale), Err(NavError::InvalidObservation(_))));

        let bad_polar = LocClue::new(
            vec![ClueCandidate {
                landmark: Some(5),
                observation: RelativeObservation::Polar { distance: -1.0, bearing: 0.0 },
                confidence: 0.5,
            }],
            1.0,
        );
        assert!(matches!(loc.apply_loc_clue(&bad_polar), Err(NavError::InvalidObservation(_))));
        assert_eq!(loc.snapshot(), before);
    }

    #[test]
    fn test_unusable_candidates_leave_state() {
        let mut loc = tracking_localizer();
        let before = loc.snapshot();

        let clue = LocClue::new(
            vec![
                ClueCandidate { landmark: None, observation: RelativeObservation::Bearing(1.0), confidence: 0.0 },
                ClueCandidate { landmark: Some(999), observation: RelativeObservation::None, confidence: 0.9 },
                ClueCandidate { landmark: None, observation: RelativeObservation::None, confidence: 0.9 },
            ],
            3.0,
        );
        let outcome = loc.apply_loc_clue(&clue).unwrap();
        assert_eq!(outcome, ClueOutcome { applied: 0, skipped: 3 });
        assert_eq!(loc.snapshot(), before);
    }

    #[test]
    fn test_heading_clue_scaled_by_confidence() {
        let mut strong = tracking_localizer();
        let mut weak = tracking_localizer();

        strong.apply_loc_clue(&LocClue::heading(0.5, 1.0, 0.0)).unwrap();
        weak.apply_loc_clue(&LocClue::heading(0.5, 0.1, 0.0)).unwrap();

        let (ts, tw) = (strong.pose().theta, weak.pose().theta);
        assert!(ts > tw && tw > 0.0, "strong {} weak {}", ts, tw);
        assert!(ts <= 0.5 + 1e-12);
        assert!(strong.covariance()[(2, 2)] < weak.covariance()[(2, 2)]);
        // Heading-only clue does not move position
        assert_relative_eq!(strong.pose().x, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_range_bearing_landmark() {
        let mut loc = mapped_localizer();
        loc.set_state(Pose2::new(0.0, 0.0, 0.0), Polar2::default());

        // Node 5 sits at (20, 0); seen 15 m straight ahead -> robot near (5, 0)
        let clue = LocClue::new(
            vec![ClueCandidate {
                landmark: Some(5),
                observation: RelativeObservation::Polar { distance: 15.0, bearing: 0.0 },
                confidence: 1.0,
            }],
            0.0,
        );
        let outcome = loc.apply_loc_clue(&clue).unwrap();
        assert_eq!(outcome.applied, 1);
        let pose = loc.pose();
        assert!(pose.x > 4.0 && pose.x < 5.5, "x = {}", pose.x);
        assert!(pose.y.abs() < 1e-9);
    }

    #[test]
    fn test_landmark_identity_pulls_position() {
        let mut loc = tracking_localizer();
        let clue = LocClue::new(
            vec![ClueCandidate { landmark: Some(3), observation: RelativeObservation::None, confidence: 1.0 }],
            0.0,
        );
        loc.apply_loc_clue(&clue).unwrap();
        let pose = loc.pose();
        assert!(pose.x > 0.0 && pose.y > 0.0);
        assert!(pose.x < 50.0 && pose.y < 50.0);
    }

    #[test]
    fn test_sequential_fuses_more_than_best_only() {
        let clue = LocClue::from_parts(
            &[Some(3), Some(2)],
            &[RelativeObservation::None, RelativeObservation::None],
            &[0.6, 0.9],
            0.0,
        )
        .unwrap();

        let mut seq = tracking_localizer();
        let mut best = tracking_localizer();
        best.set_fusion_policy(ClueFusionPolicy::BestOnly);

        assert_eq!(seq.apply_loc_clue(&clue).unwrap(), ClueOutcome { applied: 2, skipped: 0 });
        assert_eq!(best.apply_loc_clue(&clue).unwrap(), ClueOutcome { applied: 1, skipped: 1 });
        assert!(seq.covariance().trace() < best.covariance().trace());

        // Best-only used the 0.9 candidate (node 2 on the x axis)
        assert!(best.pose().x > 0.0);
        assert_relative_eq!(best.pose().y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_candidate_order_is_deterministic() {
        let a = LocClue::from_parts(
            &[Some(3), Some(2), None],
            &[RelativeObservation::None, RelativeObservation::None, RelativeObservation::Bearing(0.2)],
            &[0.5, 0.5, 0.5],
            0.0,
        )
        .unwrap();
        let mut b = a.clone();
        b.candidates.reverse();

        let mut la = tracking_localizer();
        let mut lb = tracking_localizer();
        la.apply_loc_clue(&a).unwrap();
        lb.apply_loc_clue(&b).unwrap();
        assert_eq!(la.snapshot(), lb.snapshot());
    }

    #[test]
    fn test_topometric_after_update() {
        let mut loc = mapped_localizer();
        loc.apply_position(&PositionFix::new(20.0, 0.5, 0.0)).unwrap();
        let tp = loc.topometric().unwrap();
        assert_eq!(tp.node_id, 1);
        assert_eq!(tp.edge_idx, Some(0));
        assert_relative_eq!(tp.dist, 20.0, epsilon = 1e-9);

        let back = loc.topometric_to_metric(&tp).unwrap();
        assert_relative_eq!(back.x, 20.0, epsilon = 1e-6);
        assert_relative_eq!(back.y, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_confidence_decays() {
        let mut loc = tracking_localizer();
        for i in 1..=5 {
            loc.apply_position(&PositionFix::new(0.0, 0.0, i as f64 * 0.1)).unwrap();
        }
        let c = loc.pose_confidence();
        assert!(c > 0.0 && c <= 1.0);
        assert!(loc.pose_confidence_at(10.0) < c);
        assert!(!loc.is_lost(0.5));
        assert!(loc.is_lost(100.0));
        assert_eq!(EkfLocalizer::new(LocalizerConfig::default()).unwrap().pose_confidence(), 0.0);
    }

    #[test]
    fn test_gps_offset_is_compensated() {
        let mut loc = EkfLocalizer::new(LocalizerConfig::default()).unwrap();
        loc.set_gps_offset(Polar2::new(1.0, 0.0));
        loc.set_state(Pose2::new(10.0, 0.0, 0.0), Polar2::default());
        for _ in 0..5 {
            loc.apply_position(&PositionFix::new(11.0, 0.0, 0.0)).unwrap();
        }
        assert_relative_eq!(loc.pose().x, 10.0, epsilon = 1e-9);
        assert_relative_eq!(loc.pose().theta, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gps_round_trip_and_reference_change() {
        let mut loc = mapped_localizer();
        let ll = loc.to_latlon(Point2::new(30.0, 0.0)).unwrap();
        loc.apply_gps(ll, 0.0, 1.0).unwrap();
        assert_relative_eq!(loc.pose().x, 30.0, epsilon = 1e-6);
        let back = loc.pose_gps().unwrap();
        assert_relative_eq!(back.lat, ll.lat, epsilon = 1e-9);

        // Moving the origin onto node 2 (50, 0) shifts the pose to (-20, 0)
        let n2 = loc.map().unwrap().find_node(2).unwrap().latlon;
        loc.set_reference(n2).unwrap();
        assert_relative_eq!(loc.pose().x, -20.0, epsilon = 1e-3);
        assert_relative_eq!(loc.map().unwrap().find_node(1).unwrap().position.x, -50.0, epsilon = 1e-3);
    }

    #[test]
    fn test_every_motion_model_tracks_a_line() {
        for kind in MotionModelKind::all() {
            let config = LocalizerConfig { motion_model: kind, ..LocalizerConfig::default() };
            let mut loc = EkfLocalizer::new(config).unwrap();
            loc.set_state(Pose2::new(0.0, 0.0, 0.0), Polar2::default());

            for i in 0..=120 {
                let t = i as f64 * 0.5;
                loc.apply_position(&PositionFix::new(t, 0.0, t)).unwrap();
            }
            let pose = loc.pose();
            assert!((pose.x - 60.0).abs() < 0.5, "{}: x = {}", kind.abbreviation(), pose.x);
            assert!(pose.y.abs() < 0.5, "{}: y = {}", kind.abbreviation(), pose.y);
            assert!((loc.velocity().lin - 1.0).abs() < 0.2, "{}: v = {}", kind.abbreviation(), loc.velocity().lin);
        }
    }

    #[test]
    fn test_degenerate_config_rejected() {
        let hyper = LocalizerConfig {
            motion_model: MotionModelKind::HyperTan { max_turn_rate: 0.0 },
            ..LocalizerConfig::default()
        };
        assert!(matches!(EkfLocalizer::new(hyper), Err(NavError::InvalidConfig(_))));

        let silent_gps = LocalizerConfig { gps_noise: 0.0, ..LocalizerConfig::default() };
        assert!(matches!(EkfLocalizer::new(silent_gps), Err(NavError::InvalidConfig(_))));

        let mut loc = EkfLocalizer::new(LocalizerConfig::default()).unwrap();
        assert!(loc.set_gps_noise(f64::NAN).is_err());
        assert!(loc.set_motion_noise(-0.1, 0.1).is_err());
        assert_eq!(loc.config().gps_noise, 0.5);
    }
}
