use std::sync::{Arc, Mutex};

use approx::assert_relative_eq;

use route_tracker_rs::fusion::PipelineEvent;
use route_tracker_rs::guidance::{GuidanceConfig, Motion};
use route_tracker_rs::map_match::{load_graph, save_graph};
use route_tracker_rs::sim::{demo_grid_map, demo_route, GpsSimulator, RouteWalker};
use route_tracker_rs::types::Polar2;
use route_tracker_rs::{EkfLocalizer, GuidanceManager, GuidancePipeline, LocalizerConfig, MoveStatus};

#[test]
fn simulated_walk_on_demo_grid_arrives() {
    let graph = demo_grid_map(3, 4, 30.0).unwrap();
    let route = demo_route(3, 4);
    let walker = RouteWalker::new(&graph, &route, 1.4).unwrap();

    let mut localizer = EkfLocalizer::new(LocalizerConfig::default()).unwrap();
    localizer.load_map(graph).unwrap();
    let mut pipeline = GuidancePipeline::new(
        Arc::new(Mutex::new(localizer)),
        GuidanceManager::new(GuidanceConfig::default()),
    );
    pipeline.set_route(&route).unwrap();

    let mut gps = GpsSimulator::new(0.3, Polar2::new(0.0, 0.0), 42);
    let mut saw_turn = false;
    let mut arrived_at = None;
    let end = walker.duration() + 10.0;
    let mut t = 0.0;
    while t <= end {
        let report = pipeline.tick(Some(gps.observe(&walker.pose_at(t), t)));
        if let Some(g) = &report.guidance {
            saw_turn |= g.actions.iter().any(|a| a.motion == Motion::CrossLeft);
        }
        arrived_at = report.events.iter().find_map(|e| match e {
            PipelineEvent::Arrived { node_id } => Some(*node_id),
            _ => None,
        });
        if arrived_at.is_some() {
            break;
        }
        t += 1.0;
    }

    assert!(saw_turn, "the corner crossing should be announced");
    assert_eq!(arrived_at, route.last().copied(), "arrival names the destination");
    assert_eq!(pipeline.guidance().status(), Some(MoveStatus::Arrived));
}

#[test]
fn saved_map_loads_back() {
    let graph = demo_grid_map(2, 3, 25.0).unwrap();
    let path = std::env::temp_dir().join("route_tracker_guided_walk_map.json.gz");
    save_graph(&graph, &path).unwrap();
    let loaded = load_graph(&path).unwrap();
    let _ = std::fs::remove_file(&path);

    assert_eq!(loaded.node_count(), graph.node_count());
    assert_eq!(loaded.edge_count(), graph.edge_count());
    let route = demo_route(2, 3);
    let a = RouteWalker::new(&graph, &route, 1.0).unwrap();
    let b = RouteWalker::new(&loaded, &route, 1.0).unwrap();
    assert_relative_eq!(a.length(), b.length(), epsilon = 1e-6);
}
