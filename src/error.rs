use thiserror::Error;

use crate::map_match::route_graph::NodeId;

/// Navigation error types
///
/// Every localizer and guidance operation reports failures through this enum.
/// None of them leave partially-applied state behind: a rejected call is a no-op.
#[derive(Error, Debug)]
pub enum NavError {
    #[error("Reference point not set")]
    UninitializedReference,

    #[error("Localizer not initialized (reference or map missing)")]
    UninitializedLocalizer,

    #[error("Invalid observation: {0}")]
    InvalidObservation(String),

    #[error("Stale observation: t={timestamp:.3} is older than last accepted t={last:.3}")]
    StaleObservation { timestamp: f64, last: f64 },

    #[error("Position fix ({x:.1}, {y:.1}) rejected inside a dead zone")]
    OutlierRejected { x: f64, y: f64 },

    #[error("Guidance not initialized (call set_path_n_map and initialize_guides)")]
    UninitializedGuidance,

    #[error("Pose at node {node_id} is off the planned route")]
    OutOfPath { node_id: NodeId },

    #[error("Node {0} not found in route graph")]
    NodeNotFound(NodeId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Recognizer failed: {0}")]
    Recognizer(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for navigation operations
pub type NavResult<T> = Result<T, NavError>;
