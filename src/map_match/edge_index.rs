use geo::{EuclideanDistance, Line, Point};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use super::route_graph::EdgeId;
use crate::types::Point2;

/// Metric segment of a route-graph edge with its bounding envelope
#[derive(Clone, Debug)]
pub struct SpatialEdge {
    pub edge_id: EdgeId,
    pub line: Line<f64>,
    envelope: AABB<[f64; 2]>,
}

impl SpatialEdge {
    pub fn new(edge_id: EdgeId, a: Point2, b: Point2) -> Self {
        let envelope = AABB::from_corners([a.x, a.y], [b.x, b.y]);
        Self {
            edge_id,
            line: Line::new((a.x, a.y), (b.x, b.y)),
            envelope,
        }
    }
}

impl RTreeObject for SpatialEdge {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

impl PointDistance for SpatialEdge {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let d = Point::new(point[0], point[1]).euclidean_distance(&self.line);
        d * d
    }
}

/// R-Tree spatial index over route-graph edges in the local metric frame
///
/// # Architecture
/// - Indexes edges by bounding box (envelope)
/// - Used as the fallback when incremental topometric search loses track
/// - Distances are exact point-to-segment distances in meters
pub struct EdgeIndex {
    tree: RTree<SpatialEdge>,
    edge_count: usize,
}

impl EdgeIndex {
    /// Build index from a collection of edges
    ///
    /// # Arguments
    /// * `edges` - Spatial edges to index
    pub fn from_edges(edges: Vec<SpatialEdge>) -> Self {
        let edge_count = edges.len();
        EdgeIndex {
            tree: RTree::bulk_load(edges),
            edge_count,
        }
    }

    /// Nearest edge to a point
    ///
    /// # Returns
    /// `(edge_id, distance_m)` or `None` if the index is empty
    pub fn nearest_edge(&self, point: Point2) -> Option<(EdgeId, f64)> {
        self.tree
            .nearest_neighbor_iter_with_distance_2(&[point.x, point.y])
            .next()
            .map(|(edge, d2)| (edge.edge_id, d2.sqrt()))
    }

    /// Find all edges within `max_distance_m` of point
    ///
    /// # Returns
    /// `(edge_id, distance_m)` pairs sorted by distance, ties by edge id
    pub fn nearest_edges(&self, point: Point2, max_distance_m: f64) -> Vec<(EdgeId, f64)> {
        let mut candidates: Vec<(EdgeId, f64)> = self
            .tree
            .locate_within_distance([point.x, point.y], max_distance_m * max_distance_m)
            .map(|edge| (edge.edge_id, edge.distance_2(&[point.x, point.y]).sqrt()))
            .collect();

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        candidates
    }

    /// Total edges in index
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }
}
