use log::debug;
use std::collections::HashMap;

use super::edge_index::EdgeIndex;
use super::route_graph::{EdgeId, NodeId, RouteGraph};
use crate::types::{wrap_angle, Point2, Pose2, TopometricPose};

/// Orthogonal projection of a metric point onto one edge
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EdgeProjection {
    pub edge_id: EdgeId,
    /// Distance from the edge's stored `from` node to the foot point [m]
    pub along: f64,
    /// Distance from the point to the foot point [m]
    pub residual: f64,
}

/// Project a point onto an edge segment
///
/// # Returns
/// `None` if the edge does not exist. Degenerate (zero-length) edges project
/// onto their `from` node.
pub fn project_onto_edge(graph: &RouteGraph, edge_id: EdgeId, p: Point2) -> Option<EdgeProjection> {
    let edge = graph.edge(edge_id)?;
    let a = graph.find_node(edge.from)?.position;
    let b = graph.find_node(edge.to)?.position;

    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let length_sq = dx * dx + dy * dy;
    if length_sq < 1e-12 {
        return Some(EdgeProjection {
            edge_id,
            along: 0.0,
            residual: p.distance(&a),
        });
    }

    // t = (p - a) · (b - a) / |b - a|²
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / length_sq).clamp(0.0, 1.0);
    let foot = Point2::new(a.x + t * dx, a.y + t * dy);
    Some(EdgeProjection {
        edge_id,
        along: t * length_sq.sqrt(),
        residual: p.distance(&foot),
    })
}

/// Convert a topometric pose back to a metric pose
pub fn topometric_to_metric(graph: &RouteGraph, tp: &TopometricPose) -> Option<Pose2> {
    let node = graph.find_node(tp.node_id)?;
    let Some(edge_idx) = tp.edge_idx else {
        return Some(Pose2::new(node.position.x, node.position.y, tp.head));
    };
    let edge_id = *graph.incident_edges(tp.node_id).get(edge_idx)?;
    let heading = graph.heading_from(edge_id, tp.node_id)?;
    Some(Pose2::new(
        node.position.x + tp.dist * heading.cos(),
        node.position.y + tp.dist * heading.sin(),
        wrap_angle(heading + tp.head),
    ))
}

/// Incremental topometric projector
///
/// # Architecture
/// - Searches edges around the previously reported node (one hop)
/// - Falls back to the R-Tree when the best local residual exceeds `search_radius`:
///   first every edge within the radius (ties by edge id), then the nearest edge at any range
/// - Orients the result by route order when one is set, otherwise by heading
pub struct TopometricProjector {
    index: EdgeIndex,
    search_radius: f64,
    last_node: Option<NodeId>,
    route_order: HashMap<NodeId, usize>,
    incremental_hits: u64,
    fallback_count: u64,
}

impl TopometricProjector {
    /// Create projector for a graph
    ///
    /// # Arguments
    /// * `graph` - Route graph in its current metric frame
    /// * `search_radius` - Residual [m] above which the full index is queried
    pub fn new(graph: &RouteGraph, search_radius: f64) -> Self {
        let index = graph.build_edge_index();
        debug!("Projector indexed {} edges, search radius {:.1} m", index.edge_count(), search_radius);
        Self {
            index,
            search_radius,
            last_node: None,
            route_order: HashMap::new(),
            incremental_hits: 0,
            fallback_count: 0,
        }
    }

    /// Route node order used to pick the edge endpoint nearer to route start
    pub fn set_route_order(&mut self, nodes: &[NodeId]) {
        self.route_order = nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    }

    pub fn clear_route_order(&mut self) {
        self.route_order.clear();
    }

    /// Forget the previous node so the next projection searches globally
    pub fn reset(&mut self) {
        self.last_node = None;
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallback_count
    }

    pub fn incremental_hits(&self) -> u64 {
        self.incremental_hits
    }

    /// Project a metric pose onto the graph
    ///
    /// # Returns
    /// `None` only when the graph has no edges
    pub fn project(&mut self, graph: &RouteGraph, pose: &Pose2) -> Option<TopometricPose> {
        let p = pose.position();

        let local = self.last_node.and_then(|node| self.best_local(graph, node, p));
        let best = match local {
            Some(proj) if proj.residual <= self.search_radius => {
                self.incremental_hits += 1;
                proj
            }
            _ => {
                self.fallback_count += 1;
                let global = self
                    .index
                    .nearest_edges(p, self.search_radius)
                    .first()
                    .copied()
                    .or_else(|| self.index.nearest_edge(p))
                    .and_then(|(edge_id, _)| project_onto_edge(graph, edge_id, p));
                match (global, local) {
                    (Some(g), Some(l)) if l.residual <= g.residual => l,
                    (Some(g), _) => g,
                    (None, l) => l?,
                }
            }
        };

        let tp = self.orient(graph, &best, pose)?;
        self.last_node = Some(tp.node_id);
        Some(tp)
    }

    fn best_local(&self, graph: &RouteGraph, node: NodeId, p: Point2) -> Option<EdgeProjection> {
        let mut candidates: Vec<EdgeId> = graph.incident_edges(node).to_vec();
        for &e in graph.incident_edges(node) {
            if let Some(neighbor) = graph.other_end(e, node) {
                candidates.extend_from_slice(graph.incident_edges(neighbor));
            }
        }
        candidates.sort_unstable();
        candidates.dedup();

        candidates
            .into_iter()
            .filter_map(|e| project_onto_edge(graph, e, p))
            .min_by(|a, b| a.residual.total_cmp(&b.residual).then(a.edge_id.cmp(&b.edge_id)))
    }

    fn orient(&self, graph: &RouteGraph, proj: &EdgeProjection, pose: &Pose2) -> Option<TopometricPose> {
        let edge = graph.edge(proj.edge_id)?;

        let from_first = match (self.route_order.get(&edge.from), self.route_order.get(&edge.to)) {
            (Some(i), Some(j)) => i <= j,
            _ => wrap_angle(pose.theta - edge.heading).abs() <= std::f64::consts::FRAC_PI_2,
        };
        let (node_id, dist) = if from_first {
            (edge.from, proj.along)
        } else {
            (edge.to, edge.length - proj.along)
        };

        let edge_idx = graph.incident_edges(node_id).iter().position(|&e| e == edge.id)?;
        let heading = graph.heading_from(edge.id, node_id)?;
        Some(TopometricPose {
            node_id,
            edge_idx: Some(edge_idx),
            dist: dist.clamp(0.0, edge.length),
            head: wrap_angle(pose.theta - heading),
            residual: proj.residual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_match::route_graph::NodeType;
    use crate::types::LatLon;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    // 1 --- 2 --- 3        (x axis, 50 m spacing)
    //       |
    //       4              (50 m south of 2)
    //
    // 9 --- 8              (isolated, far away)
    fn t_graph() -> RouteGraph {
        let mut graph = RouteGraph::new(LatLon::new(36.38, 127.37));
        graph.add_node_at(1, Point2::new(0.0, 0.0), NodeType::Junction).unwrap();
        graph.add_node_at(2, Point2::new(50.0, 0.0), NodeType::Junction).unwrap();
        graph.add_node_at(3, Point2::new(100.0, 0.0), NodeType::Junction).unwrap();
        graph.add_node_at(4, Point2::new(50.0, -50.0), NodeType::Junction).unwrap();
        graph.add_node_at(9, Point2::new(1000.0, 1000.0), NodeType::Junction).unwrap();
        graph.add_node_at(8, Point2::new(1100.0, 1000.0), NodeType::Junction).unwrap();
        graph.add_road(1, 2).unwrap(); // e0
        graph.add_road(2, 3).unwrap(); // e1
        graph.add_road(4, 2).unwrap(); // e2 (stored 4 -> 2)
        graph.add_road(9, 8).unwrap(); // e3
        graph
    }

    #[test]
    fn test_project_onto_edge_clamps() {
        let graph = t_graph();
        let proj = project_onto_edge(&graph, 0, Point2::new(-10.0, 5.0)).unwrap();
        assert_relative_eq!(proj.along, 0.0);
        assert_relative_eq!(proj.residual, 125.0_f64.sqrt(), epsilon = 1e-9);
        assert!(project_onto_edge(&graph, 42, Point2::new(0.0, 0.0)).is_none());
    }

    #[test]
    fn test_exact_distance_along_edge() {
        let graph = t_graph();
        let mut projector = TopometricProjector::new(&graph, 10.0);

        for d in [12.5, 37.0] {
            projector.reset();
            let tp = projector.project(&graph, &Pose2::new(50.0 + d, 0.0, 0.0)).unwrap();
            assert_eq!(tp.node_id, 2);
            assert_eq!(tp.edge_idx, Some(1), "e1 is node 2's second incident edge");
            assert_relative_eq!(tp.dist, d, epsilon = 1e-6);
        }

        // Nodes are shared by several edges; only the metric point is unique
        for d in [0.0, 50.0] {
            projector.reset();
            let tp = projector.project(&graph, &Pose2::new(50.0 + d, 0.0, 0.0)).unwrap();
            let back = topometric_to_metric(&graph, &tp).unwrap();
            assert_relative_eq!(back.x, 50.0 + d, epsilon = 1e-6);
            assert_relative_eq!(back.y, 0.0, epsilon = 1e-6);
        }

        projector.reset();
        let tp = projector.project(&graph, &Pose2::new(73.0, 0.0, 0.0)).unwrap();
        assert_relative_eq!(tp.dist, 23.0, epsilon = 1e-6);
        assert_relative_eq!(tp.head, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_heading_orients_node() {
        let graph = t_graph();
        let mut projector = TopometricProjector::new(&graph, 10.0);

        // Walking north on e2 (stored 4 -> 2): last passed node is 4
        let tp = projector.project(&graph, &Pose2::new(50.0, -20.0, PI / 2.0)).unwrap();
        assert_eq!(tp.node_id, 4);
        assert_relative_eq!(tp.dist, 30.0, epsilon = 1e-6);

        // Walking south on the same spot: last passed node is 2
        let tp = projector.project(&graph, &Pose2::new(50.0, -20.0, -PI / 2.0)).unwrap();
        assert_eq!(tp.node_id, 2);
        assert_relative_eq!(tp.dist, 20.0, epsilon = 1e-6);
        assert_eq!(graph.incident_edges(2)[tp.edge_idx.unwrap()], 2);
    }

    #[test]
    fn test_route_order_overrides_heading() {
        let graph = t_graph();
        let mut projector = TopometricProjector::new(&graph, 10.0);
        projector.set_route_order(&[3, 2, 1]);

        // Facing east on e1, but the route runs 3 -> 2
        let tp = projector.project(&graph, &Pose2::new(60.0, 1.0, 0.0)).unwrap();
        assert_eq!(tp.node_id, 3);
        assert_relative_eq!(tp.dist, 40.0, epsilon = 1e-6);
        assert_relative_eq!(tp.head.abs(), PI, epsilon = 1e-9);
    }

    #[test]
    fn test_incremental_then_fallback() {
        let graph = t_graph();
        let mut projector = TopometricProjector::new(&graph, 10.0);

        projector.project(&graph, &Pose2::new(10.0, 1.0, 0.0)).unwrap();
        assert_eq!(projector.fallback_count(), 1, "First projection is global");

        projector.project(&graph, &Pose2::new(30.0, 1.0, 0.0)).unwrap();
        projector.project(&graph, &Pose2::new(70.0, -1.0, 0.0)).unwrap();
        assert_eq!(projector.incremental_hits(), 2);

        // Jump to the isolated edge
        let tp = projector.project(&graph, &Pose2::new(1050.0, 1002.0, 0.0)).unwrap();
        assert_eq!(tp.node_id, 9);
        assert_relative_eq!(tp.dist, 50.0, epsilon = 1e-6);
        assert_eq!(projector.fallback_count(), 2);
    }

    #[test]
    fn test_residual_is_carried() {
        let graph = t_graph();
        let mut projector = TopometricProjector::new(&graph, 10.0);

        let tp = projector.project(&graph, &Pose2::new(20.0, 3.0, 0.0)).unwrap();
        assert_eq!(tp.node_id, 1);
        assert_relative_eq!(tp.residual, 3.0, epsilon = 1e-9);

        // Well south of e0 the pose still snaps to it, with the gap as residual
        let tp = projector.project(&graph, &Pose2::new(10.0, -30.0, 0.0)).unwrap();
        assert_eq!(graph.incident_edges(tp.node_id)[tp.edge_idx.unwrap()], 0);
        assert_relative_eq!(tp.residual, 30.0, epsilon = 1e-9);
    }

    #[test]
    fn test_fallback_tie_breaks_on_edge_id() {
        let graph = t_graph();
        let mut projector = TopometricProjector::new(&graph, 10.0);

        // Node 2 touches e0, e1 and e2 at zero residual
        let tp = projector.project(&graph, &Pose2::new(50.0, 0.0, 0.0)).unwrap();
        assert_eq!(graph.incident_edges(tp.node_id)[tp.edge_idx.unwrap()], 0);
        assert_eq!(projector.fallback_count(), 1);
    }

    #[test]
    fn test_empty_graph() {
        let graph = RouteGraph::new(LatLon::new(36.38, 127.37));
        let mut projector = TopometricProjector::new(&graph, 10.0);
        assert!(projector.project(&graph, &Pose2::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_node_only_pose_to_metric() {
        let graph = t_graph();
        let tp = TopometricPose::at_node(4);
        let pose = topometric_to_metric(&graph, &tp).unwrap();
        assert_relative_eq!(pose.y, -50.0, epsilon = 1e-6);
    }
}
