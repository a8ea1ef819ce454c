use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;

use super::converter::GeoConverter;
use super::edge_index::{EdgeIndex, SpatialEdge};
use crate::error::{NavError, NavResult};
use crate::types::{wrap_angle, LatLon, Point2};

pub type NodeId = u64;
pub type EdgeId = usize;

/// Node tag that specializes guidance at that node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    #[default]
    Junction,
    Crossing,
    BuildingEntry,
    BuildingExit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub latlon: LatLon,
    /// Derived from `latlon` through the graph's converter
    pub position: Point2,
    pub node_type: NodeType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Edge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    /// Metric length [m]
    pub length: f64,
    /// Heading from `from` to `to` [rad, CCW from east]
    pub heading: f64,
}

/// Route graph: id-indexed node arena plus undirected adjacency
///
/// Edges keep their stored endpoint order but are traversed in both directions.
/// Metric coordinates are derived from the graph's reference point and can be
/// recomputed with [`RouteGraph::rebase`].
#[derive(Clone, Debug)]
pub struct RouteGraph {
    converter: GeoConverter,
    nodes: HashMap<NodeId, Node>,
    node_order: Vec<NodeId>,
    edges: Vec<Edge>,
    adjacency: HashMap<NodeId, Vec<EdgeId>>,
}

impl RouteGraph {
    pub fn new(reference: LatLon) -> Self {
        Self {
            converter: GeoConverter::with_reference(reference),
            nodes: HashMap::new(),
            node_order: Vec::new(),
            edges: Vec::new(),
            adjacency: HashMap::new(),
        }
    }

    pub fn converter(&self) -> &GeoConverter {
        &self.converter
    }

    /// Add a node from geodetic coordinates
    pub fn add_node(&mut self, id: NodeId, latlon: LatLon, node_type: NodeType) -> NavResult<()> {
        if self.nodes.contains_key(&id) {
            return Err(NavError::InvalidGraph(format!("duplicate node id {}", id)));
        }
        let position = self.converter.to_metric(latlon)?;
        self.nodes.insert(
            id,
            Node {
                id,
                latlon,
                position,
                node_type,
            },
        );
        self.node_order.push(id);
        self.adjacency.entry(id).or_default();
        Ok(())
    }

    /// Add a node from local metric coordinates
    pub fn add_node_at(&mut self, id: NodeId, position: Point2, node_type: NodeType) -> NavResult<()> {
        let latlon = self.converter.to_latlon(position)?;
        self.add_node(id, latlon, node_type)
    }

    /// Connect two existing nodes
    ///
    /// # Returns
    /// Id of the new edge (its insertion index)
    pub fn add_road(&mut self, a: NodeId, b: NodeId) -> NavResult<EdgeId> {
        if a == b {
            return Err(NavError::InvalidGraph(format!("self loop at node {}", a)));
        }
        let pa = self.node(a)?.position;
        let pb = self.node(b)?.position;

        let id = self.edges.len();
        self.edges.push(Edge {
            id,
            from: a,
            to: b,
            length: pa.distance(&pb),
            heading: (pb.y - pa.y).atan2(pb.x - pa.x),
        });
        self.adjacency.entry(a).or_default().push(id);
        self.adjacency.entry(b).or_default().push(id);
        Ok(id)
    }

    pub fn find_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Like [`RouteGraph::find_node`] but as a `NodeNotFound` error
    pub fn node(&self, id: NodeId) -> NavResult<&Node> {
        self.nodes.get(&id).ok_or(NavError::NodeNotFound(id))
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// Nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Edge ids incident to a node, in insertion order (empty for unknown nodes)
    pub fn incident_edges(&self, id: NodeId) -> &[EdgeId] {
        self.adjacency.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edge_between(&self, a: NodeId, b: NodeId) -> Option<EdgeId> {
        self.incident_edges(a)
            .iter()
            .copied()
            .find(|&e| self.other_end(e, a) == Some(b))
    }

    /// Endpoint of `edge` opposite to `node`, `None` if `node` is not an endpoint
    pub fn other_end(&self, edge: EdgeId, node: NodeId) -> Option<NodeId> {
        let e = self.edges.get(edge)?;
        if e.from == node {
            Some(e.to)
        } else if e.to == node {
            Some(e.from)
        } else {
            None
        }
    }

    /// Heading of `edge` when traversed away from `node`
    pub fn heading_from(&self, edge: EdgeId, node: NodeId) -> Option<f64> {
        let e = self.edges.get(edge)?;
        if e.from == node {
            Some(e.heading)
        } else if e.to == node {
            Some(wrap_angle(e.heading + PI))
        } else {
            None
        }
    }

    /// Recompute metric positions, lengths and headings against a new reference
    pub fn rebase(&mut self, reference: LatLon) -> NavResult<()> {
        self.converter.set_reference(reference);
        for node in self.nodes.values_mut() {
            node.position = self.converter.to_metric(node.latlon)?;
        }
        for edge in self.edges.iter_mut() {
            let pa = self.nodes[&edge.from].position;
            let pb = self.nodes[&edge.to].position;
            edge.length = pa.distance(&pb);
            edge.heading = (pb.y - pa.y).atan2(pb.x - pa.x);
        }
        Ok(())
    }

    /// Spatial index over the current metric edges
    pub fn build_edge_index(&self) -> EdgeIndex {
        EdgeIndex::from_edges(
            self.edges
                .iter()
                .map(|e| SpatialEdge::new(e.id, self.nodes[&e.from].position, self.nodes[&e.to].position))
                .collect(),
        )
    }
}
