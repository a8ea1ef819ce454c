pub mod linalg;

pub use linalg::*;

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use crate::error::{NavError, NavResult};
use crate::map_match::route_graph::NodeId;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2 {
    pub x: f64,
    pub y: f64,
}

impl Point2 {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

impl LatLon {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Planar pose, heading in radians CCW from +x (east)
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2 {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose2 {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Self { x, y, theta }
    }

    pub fn position(&self) -> Point2 {
        Point2::new(self.x, self.y)
    }
}

/// Polar pair, used for antenna offsets and (linear, angular) velocity
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Polar2 {
    pub lin: f64,
    pub ang: f64,
}

impl Polar2 {
    pub fn new(lin: f64, ang: f64) -> Self {
        Self { lin, ang }
    }
}

/// Wrap an angle to (-π, π]
pub fn wrap_angle(angle: f64) -> f64 {
    let mut a = angle % (2.0 * PI);
    if a <= -PI {
        a += 2.0 * PI;
    } else if a > PI {
        a -= 2.0 * PI;
    }
    a
}

// ─── Observations ────────────────────────────────────────────────────────────

/// Absolute position fix in the local metric frame
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub x: f64,
    pub y: f64,
    pub timestamp: f64,
    /// Multiplier on the configured position variance (1.0 = nominal)
    pub noise_scale: f64,
}

impl PositionFix {
    pub fn new(x: f64, y: f64, timestamp: f64) -> Self {
        Self {
            x,
            y,
            timestamp,
            noise_scale: 1.0,
        }
    }

    pub fn with_noise_scale(mut self, noise_scale: f64) -> Self {
        self.noise_scale = noise_scale;
        self
    }
}

/// Geometry attached to a clue candidate, relative to the robot
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum RelativeObservation {
    /// Distance [m] and bearing [rad] from robot heading to the landmark
    Polar { distance: f64, bearing: f64 },
    /// Bearing only [rad]
    Bearing(f64),
    /// Landmark recognized without geometry
    None,
}

impl RelativeObservation {
    pub fn bearing(&self) -> Option<f64> {
        match self {
            RelativeObservation::Polar { bearing, .. } => Some(*bearing),
            RelativeObservation::Bearing(b) => Some(*b),
            RelativeObservation::None => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClueCandidate {
    /// Matched landmark node, `None` when the clue carries no identity
    pub landmark: Option<NodeId>,
    pub observation: RelativeObservation,
    /// Match confidence in [0, 1]; 0 means ignore
    pub confidence: f64,
}

/// Localization clue from a vision producer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocClue {
    pub candidates: Vec<ClueCandidate>,
    pub timestamp: f64,
}

impl LocClue {
    pub fn new(candidates: Vec<ClueCandidate>, timestamp: f64) -> Self {
        Self {
            candidates,
            timestamp,
        }
    }

    /// Heading-only clue without landmark identity (road direction)
    pub fn heading(theta: f64, confidence: f64, timestamp: f64) -> Self {
        Self::new(
            vec![ClueCandidate {
                landmark: None,
                observation: RelativeObservation::Bearing(theta),
                confidence,
            }],
            timestamp,
        )
    }

    /// Build a clue from parallel arrays of ids, observations and confidences
    ///
    /// # Errors
    /// `InvalidObservation` when the array lengths differ.
    pub fn from_parts(
        ids: &[Option<NodeId>],
        observations: &[RelativeObservation],
        confidences: &[f64],
        timestamp: f64,
    ) -> NavResult<Self> {
        if ids.len() != observations.len() || ids.len() != confidences.len() {
            return Err(NavError::InvalidObservation(format!(
                "array lengths differ: {} ids, {} observations, {} confidences",
                ids.len(),
                observations.len(),
                confidences.len()
            )));
        }
        let candidates = ids
            .iter()
            .zip(observations)
            .zip(confidences)
            .map(|((landmark, observation), confidence)| ClueCandidate {
                landmark: *landmark,
                observation: *observation,
                confidence: *confidence,
            })
            .collect();
        Ok(Self::new(candidates, timestamp))
    }
}

// ─── Topometric pose ─────────────────────────────────────────────────────────

/// Pose expressed against the route graph
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopometricPose {
    /// Last passed node
    pub node_id: NodeId,
    /// Index into `node_id`'s incident edge list, `None` when off any edge
    pub edge_idx: Option<usize>,
    /// Distance along the edge from `node_id` [m]
    pub dist: f64,
    /// Heading relative to the edge direction leaving `node_id` [rad]
    pub head: f64,
    /// Distance from the metric pose to the edge [m]
    #[serde(default)]
    pub residual: f64,
}

impl TopometricPose {
    pub fn at_node(node_id: NodeId) -> Self {
        Self {
            node_id,
            edge_idx: None,
            dist: 0.0,
            head: 0.0,
            residual: 0.0,
        }
    }

    pub fn on_edge(node_id: NodeId, edge_idx: usize, dist: f64) -> Self {
        Self {
            node_id,
            edge_idx: Some(edge_idx),
            dist,
            head: 0.0,
            residual: 0.0,
        }
    }
}
