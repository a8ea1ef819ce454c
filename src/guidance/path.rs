use serde::{Deserialize, Serialize};

use crate::error::{NavError, NavResult};
use crate::map_match::route_graph::{EdgeId, NodeId, RouteGraph};

/// One node of a planned route
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutePoint {
    pub node_id: NodeId,
    /// Edge arriving at this node from the previous route point, `None` at the start
    pub edge_id: Option<EdgeId>,
    /// Route distance from the start to this node [m]
    pub cumulative_distance: f64,
}

/// Ordered node/edge sequence through the route graph
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Path {
    points: Vec<RoutePoint>,
}

impl Path {
    /// Build a path from consecutive node ids; every consecutive pair must share an edge
    pub fn from_nodes(graph: &RouteGraph, node_ids: &[NodeId]) -> NavResult<Self> {
        if node_ids.len() < 2 {
            return Err(NavError::InvalidPath(format!(
                "route needs at least two nodes, got {}",
                node_ids.len()
            )));
        }

        let first = graph.node(node_ids[0])?;
        let mut points = vec![RoutePoint {
            node_id: first.id,
            edge_id: None,
            cumulative_distance: 0.0,
        }];

        for pair in node_ids.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            graph.node(b)?;
            let edge_id = graph
                .edge_between(a, b)
                .ok_or_else(|| NavError::InvalidPath(format!("no edge between {} and {}", a, b)))?;
            let length = graph.edge(edge_id).map(|e| e.length).unwrap_or(0.0);
            let previous = points.last().map(|p| p.cumulative_distance).unwrap_or(0.0);
            points.push(RoutePoint {
                node_id: b,
                edge_id: Some(edge_id),
                cumulative_distance: previous + length,
            });
        }

        Ok(Self { points })
    }

    /// Check that the path is consistent with `graph` (edges exist and join consecutive nodes)
    pub fn validate(&self, graph: &RouteGraph) -> NavResult<()> {
        if self.points.len() < 2 {
            return Err(NavError::InvalidPath("route needs at least two nodes".into()));
        }
        for (i, pair) in self.points.windows(2).enumerate() {
            let (a, b) = (pair[0], pair[1]);
            graph.node(a.node_id)?;
            graph.node(b.node_id)?;
            let edge = b
                .edge_id
                .ok_or_else(|| NavError::InvalidPath(format!("route point {} has no edge", i + 1)))?;
            if graph.other_end(edge, a.node_id) != Some(b.node_id) {
                return Err(NavError::InvalidPath(format!(
                    "edge {} does not join {} and {}",
                    edge, a.node_id, b.node_id
                )));
            }
        }
        Ok(())
    }

    pub fn points(&self) -> &[RoutePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn start(&self) -> Option<&RoutePoint> {
        self.points.first()
    }

    pub fn destination(&self) -> Option<&RoutePoint> {
        self.points.last()
    }

    pub fn total_length(&self) -> f64 {
        self.points.last().map(|p| p.cumulative_distance).unwrap_or(0.0)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.points.iter().map(|p| p.node_id).collect()
    }

    /// Route indices whose node is `node_id` (several when the route revisits a node)
    pub fn indices_of(&self, node_id: NodeId) -> impl Iterator<Item = usize> + '_ {
        self.points
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.node_id == node_id)
            .map(|(i, _)| i)
    }

    /// Route indices `k` whose arriving edge is `edge_id` (segment `k-1 → k`)
    pub fn segments_on(&self, edge_id: EdgeId) -> impl Iterator<Item = usize> + '_ {
        self.points
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.edge_id == Some(edge_id))
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_match::route_graph::NodeType;
    use crate::types::{LatLon, Point2};
    use approx::assert_relative_eq;

    fn line_graph() -> RouteGraph {
        let mut g = RouteGraph::new(LatLon::new(37.5, 127.0));
        for (id, x) in [(1, 0.0), (2, 10.0), (3, 30.0), (4, 45.0)] {
            g.add_node_at(id, Point2::new(x, 0.0), NodeType::Junction).unwrap();
        }
        g.add_road(1, 2).unwrap();
        g.add_road(2, 3).unwrap();
        g.add_road(3, 4).unwrap();
        g
    }

    #[test]
    fn test_cumulative_distances() {
        let g = line_graph();
        let path = Path::from_nodes(&g, &[1, 2, 3, 4]).unwrap();
        let cum: Vec<f64> = path.points().iter().map(|p| p.cumulative_distance).collect();
        assert_relative_eq!(cum[0], 0.0);
        assert_relative_eq!(cum[1], 10.0, epsilon = 1e-6);
        assert_relative_eq!(cum[2], 30.0, epsilon = 1e-6);
        assert_relative_eq!(cum[3], 45.0, epsilon = 1e-6);
        assert_relative_eq!(path.total_length(), 45.0, epsilon = 1e-6);
        assert_eq!(path.start().unwrap().edge_id, None);
        assert!(path.validate(&g).is_ok());
    }

    #[test]
    fn test_reverse_traversal() {
        let g = line_graph();
        let path = Path::from_nodes(&g, &[4, 3, 2]).unwrap();
        assert_eq!(path.node_ids(), vec![4, 3, 2]);
        assert_eq!(path.points()[1].edge_id, g.edge_between(3, 4));
    }

    #[test]
    fn test_rejects_disconnected_nodes() {
        let g = line_graph();
        assert!(matches!(Path::from_nodes(&g, &[1, 3]), Err(NavError::InvalidPath(_))));
        assert!(matches!(Path::from_nodes(&g, &[1, 9]), Err(NavError::NodeNotFound(9))));
        assert!(matches!(Path::from_nodes(&g, &[1]), Err(NavError::InvalidPath(_))));
    }

    #[test]
    fn test_revisited_node_indices() {
        let g = line_graph();
        let path = Path::from_nodes(&g, &[1, 2, 3, 2]).unwrap();
        assert_eq!(path.indices_of(2).collect::<Vec<_>>(), vec![1, 3]);
        let e23 = g.edge_between(2, 3).unwrap();
        assert_eq!(path.segments_on(e23).collect::<Vec<_>>(), vec![2, 3]);
    }
}
