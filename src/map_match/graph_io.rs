use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use super::route_graph::{NodeId, NodeType, RouteGraph};
use crate::error::{NavError, NavResult};
use crate::types::LatLon;

// Persisted form: node records then edge records, replayed in file order
#[derive(Debug, Serialize, Deserialize)]
struct GraphFile {
    #[serde(default)]
    reference: Option<LatLon>,
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NodeRecord {
    id: NodeId,
    lat: f64,
    lon: f64,
    #[serde(default, rename = "type")]
    node_type: NodeType,
}

#[derive(Debug, Serialize, Deserialize)]
struct EdgeRecord {
    from: NodeId,
    to: NodeId,
}

/// Parse a graph document
///
/// The reference point is taken from the document, or from the first node
/// when the document has none.
pub fn parse_graph_json(json: &str) -> NavResult<RouteGraph> {
    let file: GraphFile = serde_json::from_str(json)?;
    build_graph(file)
}

/// Serialize a graph to its persisted JSON form
pub fn graph_to_json(graph: &RouteGraph) -> NavResult<String> {
    Ok(serde_json::to_string_pretty(&to_file(graph))?)
}

/// Load a graph from `.json` or gzip-compressed `.json.gz`
pub fn load_graph(path: &Path) -> NavResult<RouteGraph> {
    let file = File::open(path)?;
    let doc: GraphFile = if is_gzip(path) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?
    } else {
        serde_json::from_reader(BufReader::new(file))?
    };
    let graph = build_graph(doc)?;
    log::info!(
        "Loaded route graph {} ({} nodes, {} edges)",
        path.display(),
        graph.node_count(),
        graph.edge_count()
    );
    Ok(graph)
}

/// Save a graph as `.json`, or gzip-compressed when the path ends in `.gz`
pub fn save_graph(graph: &RouteGraph, path: &Path) -> NavResult<()> {
    let doc = to_file(graph);
    let file = File::create(path)?;
    if is_gzip(path) {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &doc)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &doc)?;
        writer.flush()?;
    }
    Ok(())
}

fn is_gzip(path: &Path) -> bool {
    path.extension().map(|e| e == "gz").unwrap_or(false)
}

fn to_file(graph: &RouteGraph) -> GraphFile {
    GraphFile {
        reference: graph.converter().reference(),
        nodes: graph
            .nodes()
            .map(|n| NodeRecord {
                id: n.id,
                lat: n.latlon.lat,
                lon: n.latlon.lon,
                node_type: n.node_type,
            })
            .collect(),
        edges: graph
            .edges()
            .iter()
            .map(|e| EdgeRecord { from: e.from, to: e.to })
            .collect(),
    }
}

fn build_graph(doc: GraphFile) -> NavResult<RouteGraph> {
    let reference = doc
        .reference
        .or_else(|| doc.nodes.first().map(|n| LatLon::new(n.lat, n.lon)))
        .ok_or_else(|| NavError::InvalidGraph("graph has no nodes and no reference".to_string()))?;

    let mut graph = RouteGraph::new(reference);
    for node in &doc.nodes {
        graph.add_node(node.id, LatLon::new(node.lat, node.lon), node.node_type)?;
    }
    for edge in &doc.edges {
        graph.add_road(edge.from, edge.to)?;
    }
    Ok(graph)
}
