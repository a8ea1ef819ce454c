pub mod converter;
pub mod edge_index;
pub mod graph_io;
pub mod matcher;
pub mod route_graph;

pub use converter::GeoConverter;
pub use edge_index::{EdgeIndex, SpatialEdge};
pub use graph_io::{graph_to_json, load_graph, parse_graph_json, save_graph};
pub use matcher::{project_onto_edge, topometric_to_metric, EdgeProjection, TopometricProjector};
pub use route_graph::{Edge, EdgeId, Node, NodeId, NodeType, RouteGraph};
