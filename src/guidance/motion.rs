use serde::{Deserialize, Serialize};
use std::fmt;

use crate::map_match::route_graph::NodeType;

/// Navigation action attached to a route node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Motion {
    GoForward,
    TurnLeft,
    TurnRight,
    TurnBack,
    CrossForward,
    CrossLeft,
    CrossRight,
    EnterForward,
    EnterLeft,
    EnterRight,
    ExitForward,
    ExitLeft,
    ExitRight,
    /// Destination reached
    Arrive,
}

/// Geometric turn class before node tags are considered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnBucket {
    Forward,
    Left,
    Right,
    Back,
}

/// Bucket a signed turn angle
///
/// # Arguments
/// * `delta_deg` - Outgoing minus incoming heading, any range (normalized to (−180°, 180°])
/// * `threshold_deg` - θ: straight band half-width and back band width
pub fn classify_turn(delta_deg: f64, threshold_deg: f64) -> TurnBucket {
    let delta = normalize_deg(delta_deg);
    if delta.abs() < threshold_deg {
        TurnBucket::Forward
    } else if delta >= threshold_deg && delta < 180.0 - threshold_deg {
        TurnBucket::Left
    } else if delta <= -threshold_deg && delta > -(180.0 - threshold_deg) {
        TurnBucket::Right
    } else {
        TurnBucket::Back
    }
}

/// Wrap to (−180°, 180°] without leaving degrees, so band edges stay exact
fn normalize_deg(deg: f64) -> f64 {
    let d = deg % 360.0;
    if d > 180.0 {
        d - 360.0
    } else if d <= -180.0 {
        d + 360.0
    } else {
        d
    }
}

impl Motion {
    /// Specialize a turn bucket by the node's tag; turning back is never specialized
    pub fn from_turn(bucket: TurnBucket, node_type: NodeType) -> Self {
        match (bucket, node_type) {
            (TurnBucket::Back, _) => Motion::TurnBack,
            (TurnBucket::Forward, NodeType::Junction) => Motion::GoForward,
            (TurnBucket::Left, NodeType::Junction) => Motion::TurnLeft,
            (TurnBucket::Right, NodeType::Junction) => Motion::TurnRight,
            (TurnBucket::Forward, NodeType::Crossing) => Motion::CrossForward,
            (TurnBucket::Left, NodeType::Crossing) => Motion::CrossLeft,
            (TurnBucket::Right, NodeType::Crossing) => Motion::CrossRight,
            (TurnBucket::Forward, NodeType::BuildingEntry) => Motion::EnterForward,
            (TurnBucket::Left, NodeType::BuildingEntry) => Motion::EnterLeft,
            (TurnBucket::Right, NodeType::BuildingEntry) => Motion::EnterRight,
            (TurnBucket::Forward, NodeType::BuildingExit) => Motion::ExitForward,
            (TurnBucket::Left, NodeType::BuildingExit) => Motion::ExitLeft,
            (TurnBucket::Right, NodeType::BuildingExit) => Motion::ExitRight,
        }
    }

    /// Plain forward needs no instruction
    pub fn is_plain_forward(&self) -> bool {
        *self == Motion::GoForward
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Motion::GoForward => "Go forward",
            Motion::TurnLeft => "Turn left",
            Motion::TurnRight => "Turn right",
            Motion::TurnBack => "Turn back",
            Motion::CrossForward => "Cross and go forward",
            Motion::CrossLeft => "Cross and turn left",
            Motion::CrossRight => "Cross and turn right",
            Motion::EnterForward => "Enter the building straight ahead",
            Motion::EnterLeft => "Enter the building on the left",
            Motion::EnterRight => "Enter the building on the right",
            Motion::ExitForward => "Exit the building straight ahead",
            Motion::ExitLeft => "Exit the building to the left",
            Motion::ExitRight => "Exit the building to the right",
            Motion::Arrive => "Arrive at the destination",
        }
    }
}

impl fmt::Display for Motion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_at_15_degrees() {
        assert_eq!(classify_turn(0.0, 15.0), TurnBucket::Forward);
        assert_eq!(classify_turn(14.9, 15.0), TurnBucket::Forward);
        assert_eq!(classify_turn(-14.9, 15.0), TurnBucket::Forward);
        assert_eq!(classify_turn(15.0, 15.0), TurnBucket::Left);
        assert_eq!(classify_turn(90.0, 15.0), TurnBucket::Left);
        assert_eq!(classify_turn(-15.0, 15.0), TurnBucket::Right);
        assert_eq!(classify_turn(-90.0, 15.0), TurnBucket::Right);
        assert_eq!(classify_turn(165.0, 15.0), TurnBucket::Back);
        assert_eq!(classify_turn(-165.0, 15.0), TurnBucket::Back);
        assert_eq!(classify_turn(180.0, 15.0), TurnBucket::Back);
    }

    #[test]
    fn test_delta_is_normalized() {
        // 270° left is a 90° right
        assert_eq!(classify_turn(270.0, 15.0), TurnBucket::Right);
        assert_eq!(classify_turn(-350.0, 15.0), TurnBucket::Forward);
        assert_eq!(classify_turn(-180.0, 15.0), TurnBucket::Back);
    }

    #[test]
    fn test_band_edges_are_exact() {
        for theta in [10.0, 15.0, 30.0, 45.0] {
            assert_eq!(classify_turn(theta, theta), TurnBucket::Left, "+{}", theta);
            assert_eq!(classify_turn(-theta, theta), TurnBucket::Right, "-{}", theta);
            assert_eq!(classify_turn(180.0 - theta, theta), TurnBucket::Back, "180-{}", theta);
            assert_eq!(classify_turn(theta - 180.0, theta), TurnBucket::Back, "{}-180", theta);
            assert_eq!(classify_turn(360.0 + theta, theta), TurnBucket::Left, "360+{}", theta);
            assert_eq!(classify_turn(theta - 360.0, theta), TurnBucket::Left, "{}-360", theta);
        }
    }

    #[test]
    fn test_tag_specialization() {
        assert_eq!(Motion::from_turn(TurnBucket::Left, NodeType::Junction), Motion::TurnLeft);
        assert_eq!(Motion::from_turn(TurnBucket::Forward, NodeType::Crossing), Motion::CrossForward);
        assert_eq!(Motion::from_turn(TurnBucket::Right, NodeType::BuildingEntry), Motion::EnterRight);
        assert_eq!(Motion::from_turn(TurnBucket::Left, NodeType::BuildingExit), Motion::ExitLeft);
        assert_eq!(Motion::from_turn(TurnBucket::Back, NodeType::Crossing), Motion::TurnBack);
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(serde_json::to_string(&Motion::GoForward).unwrap(), "\"GO_FORWARD\"");
        assert_eq!(serde_json::to_string(&Motion::CrossLeft).unwrap(), "\"CROSS_LEFT\"");
    }
}
