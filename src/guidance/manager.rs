use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::motion::{classify_turn, Motion};
use super::path::Path;
use crate::error::{NavError, NavResult};
use crate::map_match::route_graph::{EdgeId, NodeId, RouteGraph};
use crate::types::TopometricPose;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuidanceConfig {
    /// Straight band half-width and back band width [deg]
    pub turn_threshold_deg: f64,
    /// Poses this close to a route node count as on it [m]
    pub on_node_tolerance: f64,
    /// How far along an off-route edge a pose may stray from a route node [m]
    pub off_path_tolerance: f64,
    /// Upcoming non-forward actions reported per guidance
    pub lookahead_actions: usize,
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            turn_threshold_deg: 15.0,
            on_node_tolerance: 2.0,
            off_path_tolerance: 5.0,
            lookahead_actions: 2,
        }
    }
}

// ─── Guidance output ─────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MoveStatus {
    OnEdge,
    OnNode,
    OutOfPath,
    Arrived,
}

/// Action precomputed for one route node
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GuidanceAction {
    pub motion: Motion,
    pub node_id: NodeId,
    /// Route edge leaving the node, `None` at the destination
    pub edge_id: Option<EdgeId>,
    /// Position of the node in the route
    pub route_index: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Guidance {
    /// Upcoming actions, nearest first
    pub actions: Vec<GuidanceAction>,
    /// Route distance to the first action's node [m]
    pub distance_to_remain: f64,
    pub message: String,
}

/// Route position: `along` metres past route point `index` toward `index + 1`
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RouteProgress {
    pub index: usize,
    pub along: f64,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Turns topometric poses into route progress and spoken-style instructions
///
/// Lifecycle: [`set_path_n_map`](Self::set_path_n_map), then
/// [`initialize_guides`](Self::initialize_guides), then alternate
/// [`apply_pose`](Self::apply_pose) and [`get_guidance`](Self::get_guidance).
/// `Arrived` is sticky until [`reset`](Self::reset) or a new path is set.
#[derive(Debug)]
pub struct GuidanceManager {
    config: GuidanceConfig,
    path: Option<Path>,
    map: Option<Arc<RouteGraph>>,
    guides: Vec<GuidanceAction>,
    progress: RouteProgress,
    status: Option<MoveStatus>,
    last_node: Option<NodeId>,
}

impl GuidanceManager {
    pub fn new(config: GuidanceConfig) -> Self {
        Self {
            config,
            path: None,
            map: None,
            guides: Vec::new(),
            progress: RouteProgress::default(),
            status: None,
            last_node: None,
        }
    }

    pub fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    /// Install a route and the graph it runs through; guides must be rebuilt afterwards
    pub fn set_path_n_map(&mut self, path: Path, map: Arc<RouteGraph>) -> NavResult<()> {
        path.validate(&map)?;
        info!(
            "Guidance route set: {} nodes, {:.1} m",
            path.len(),
            path.total_length()
        );
        self.path = Some(path);
        self.map = Some(map);
        self.guides.clear();
        self.reset();
        Ok(())
    }

    /// Classify the turn at every route node
    pub fn initialize_guides(&mut self) -> NavResult<()> {
        let guides = {
            let (path, map) = self.route()?;
            build_guides(path, map, self.config.turn_threshold_deg)?
        };
        let instructions = guides.iter().filter(|g| !g.motion.is_plain_forward()).count();
        info!("Guidance initialized: {} instructions", instructions);
        self.guides = guides;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        !self.guides.is_empty()
    }

    pub fn guides(&self) -> &[GuidanceAction] {
        &self.guides
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }

    /// Status from the last applied pose
    pub fn status(&self) -> Option<MoveStatus> {
        self.status
    }

    pub fn progress(&self) -> RouteProgress {
        self.progress
    }

    /// Route node at the current progress index; the destination once arrived
    pub fn route_node(&self) -> Option<NodeId> {
        self.path
            .as_ref()?
            .points()
            .get(self.progress.index)
            .map(|p| p.node_id)
    }

    /// Restart from the route start, keeping path and guides
    pub fn reset(&mut self) {
        self.progress = RouteProgress::default();
        self.status = None;
        self.last_node = None;
    }

    /// Locate a pose on the route and update progress
    pub fn apply_pose(&mut self, pose: &TopometricPose) -> NavResult<MoveStatus> {
        if !self.is_ready() {
            return Err(NavError::UninitializedGuidance);
        }
        if self.status == Some(MoveStatus::Arrived) {
            return Ok(MoveStatus::Arrived);
        }

        let (located, last_index) = {
            let (path, map) = self.route()?;
            (
                locate(path, map, &self.config, self.progress, pose),
                path.len() - 1,
            )
        };
        self.last_node = Some(pose.node_id);

        let status = match located {
            Some(progress) => {
                self.progress = progress;
                if progress.along > 0.0 {
                    MoveStatus::OnEdge
                } else if progress.index == last_index {
                    MoveStatus::Arrived
                } else {
                    MoveStatus::OnNode
                }
            }
            None => MoveStatus::OutOfPath,
        };

        if self.status != Some(status) {
            debug!(
                "Move status {:?} -> {:?} (route index {}, {:.1} m along)",
                self.status, status, self.progress.index, self.progress.along
            );
        }
        self.status = Some(status);
        if status == MoveStatus::Arrived {
            info!("Arrived at node {}", self.route_node().unwrap_or(pose.node_id));
        }
        Ok(status)
    }

    /// Next instruction for the given status
    ///
    /// `status` should be the value the last [`apply_pose`](Self::apply_pose)
    /// returned. Once a pose has been applied the stored status wins over a
    /// different argument, so an off-route walker never gets route guidance.
    ///
    /// # Errors
    /// `UninitializedGuidance` before guides exist, `OutOfPath` when the pose left the route
    pub fn get_guidance(&self, status: MoveStatus) -> NavResult<Guidance> {
        if !self.is_ready() {
            return Err(NavError::UninitializedGuidance);
        }
        let (path, _) = self.route()?;
        let status = match self.status {
            Some(current) if current != status => {
                warn!("Guidance asked for {:?} while the last pose was {:?}", status, current);
                current
            }
            _ => status,
        };

        match status {
            MoveStatus::OutOfPath => Err(NavError::OutOfPath {
                node_id: self
                    .last_node
                    .or_else(|| path.start().map(|p| p.node_id))
                    .unwrap_or_default(),
            }),
            MoveStatus::Arrived => Ok(self.arrived_guidance()),
            MoveStatus::OnNode | MoveStatus::OnEdge => {
                let RouteProgress { index, along } = self.progress;
                // An action at the node we stand on is still due; once past it, look further
                let from = if along > 0.0 { index + 1 } else { index };
                let actions: Vec<GuidanceAction> = self
                    .guides
                    .get(from..)
                    .unwrap_or(&[])
                    .iter()
                    .filter(|g| !g.motion.is_plain_forward())
                    .take(self.config.lookahead_actions.max(1))
                    .copied()
                    .collect();

                let Some(next) = actions.first() else {
                    return Ok(self.arrived_guidance());
                };
                let points = path.points();
                let distance_to_remain = (points[next.route_index].cumulative_distance
                    - points[index].cumulative_distance
                    - along)
                    .max(0.0);

                let message = if distance_to_remain < self.config.on_node_tolerance {
                    format!("{} now", next.motion)
                } else {
                    format!("{} in {:.0} m", next.motion, distance_to_remain)
                };

                Ok(Guidance {
                    actions,
                    distance_to_remain,
                    message,
                })
            }
        }
    }

    fn arrived_guidance(&self) -> Guidance {
        Guidance {
            actions: self.guides.last().copied().into_iter().collect(),
            distance_to_remain: 0.0,
            message: "Arrived at the destination".to_string(),
        }
    }

    fn route(&self) -> NavResult<(&Path, &RouteGraph)> {
        match (&self.path, &self.map) {
            (Some(path), Some(map)) => Ok((path, map.as_ref())),
            _ => Err(NavError::UninitializedGuidance),
        }
    }
}

// ─── Route geometry ──────────────────────────────────────────────────────────

fn build_guides(path: &Path, map: &RouteGraph, threshold_deg: f64) -> NavResult<Vec<GuidanceAction>> {
    let points = path.points();
    let last = points.len().saturating_sub(1);
    let mut guides = Vec::with_capacity(points.len());

    for (i, point) in points.iter().enumerate() {
        let outgoing = points.get(i + 1).and_then(|p| p.edge_id);
        let motion = if i == 0 {
            Motion::GoForward
        } else if i == last {
            Motion::Arrive
        } else {
            let prev = points[i - 1].node_id;
            let heading_in = point.edge_id.and_then(|e| map.heading_from(e, prev));
            let heading_out = outgoing.and_then(|e| map.heading_from(e, point.node_id));
            let (Some(h_in), Some(h_out)) = (heading_in, heading_out) else {
                return Err(NavError::InvalidPath(format!(
                    "route point {} is not joined to its neighbours",
                    i
                )));
            };
            let node_type = map.node(point.node_id)?.node_type;
            Motion::from_turn(classify_turn((h_out - h_in).to_degrees(), threshold_deg), node_type)
        };
        guides.push(GuidanceAction {
            motion,
            node_id: point.node_id,
            edge_id: outgoing,
            route_index: i,
        });
    }
    Ok(guides)
}

/// Candidate closest to the current progress, preferring forward on ties
fn nearest_index(candidates: impl Iterator<Item = usize>, current: usize) -> Option<usize> {
    candidates.min_by_key(|&k| (k.abs_diff(current), k < current))
}

fn snap(index: usize, along: f64, length: f64, tolerance: f64) -> RouteProgress {
    if along <= tolerance {
        RouteProgress { index, along: 0.0 }
    } else if length - along <= tolerance {
        RouteProgress {
            index: index + 1,
            along: 0.0,
        }
    } else {
        RouteProgress { index, along }
    }
}

fn locate(
    path: &Path,
    map: &RouteGraph,
    config: &GuidanceConfig,
    current: RouteProgress,
    pose: &TopometricPose,
) -> Option<RouteProgress> {
    let at_node = |node: NodeId| {
        nearest_index(path.indices_of(node), current.index).map(|index| RouteProgress { index, along: 0.0 })
    };

    // Snapped to an edge, but too far beside it to be walking it
    if pose.residual > config.off_path_tolerance {
        return None;
    }

    let edge = pose
        .edge_idx
        .and_then(|i| map.incident_edges(pose.node_id).get(i).copied());
    let Some(edge) = edge else {
        return at_node(pose.node_id);
    };
    let length = map.edge(edge)?.length;

    if let Some(start) = nearest_index(path.segments_on(edge).map(|k| k - 1), current.index) {
        let points = path.points();
        let along = if points[start].node_id == pose.node_id {
            pose.dist
        } else {
            length - pose.dist
        };
        return Some(snap(start, along.clamp(0.0, length), length, config.on_node_tolerance));
    }

    // Off-route edge: still attached if close to a route node at either end
    if pose.dist <= config.off_path_tolerance {
        if let Some(progress) = at_node(pose.node_id) {
            return Some(progress);
        }
    }
    let far = map.other_end(edge, pose.node_id)?;
    if length - pose.dist <= config.off_path_tolerance {
        return at_node(far);
    }
    None
}
