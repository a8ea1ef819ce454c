use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Duration;

use route_tracker_rs::fusion::{lock_localizer, PipelineEvent};
use route_tracker_rs::mailbox::FrameFanout;
use route_tracker_rs::map_match::{load_graph, save_graph, NodeId};
use route_tracker_rs::recognizer::{spawn_producer, CameraFrame};
use route_tracker_rs::recorder::Recorder;
use route_tracker_rs::sensors::{camera_loop, gps_loop, SimClock};
use route_tracker_rs::sim::{
    demo_grid_map, demo_route, GpsSimulator, PlaceRecognizer, RoadDirectionRecognizer, RouteWalker,
};
use route_tracker_rs::types::PositionFix;
use route_tracker_rs::{AppConfig, EkfLocalizer, GuidanceManager, GuidancePipeline};

#[derive(Parser, Debug)]
#[command(name = "route_tracker")]
#[command(about = "Simulated guided walk: EKF localization + turn-by-turn guidance", long_about = None)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Route graph (.json or .json.gz); a demo grid is generated when omitted
    #[arg(long)]
    map: Option<PathBuf>,

    /// Route as comma-separated node ids (required with --map)
    #[arg(long, value_delimiter = ',')]
    route: Vec<NodeId>,

    /// Demo grid rows
    #[arg(long, default_value = "3")]
    rows: usize,

    /// Demo grid columns
    #[arg(long, default_value = "4")]
    cols: usize,

    /// Demo grid spacing [m]
    #[arg(long, default_value = "30")]
    spacing: f64,

    /// Walking speed [m/s]
    #[arg(long, default_value = "1.4")]
    speed: f64,

    /// Simulated seconds per wall-clock second
    #[arg(long, default_value = "20")]
    speedup: f64,

    /// RNG seed (0 = random)
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Save the route graph used for the run
    #[arg(long)]
    save_map: Option<PathBuf>,

    /// Disable the session recorder
    #[arg(long)]
    no_record: bool,

    /// Output directory (overrides config)
    #[arg(long)]
    output_dir: Option<String>,
}

fn derive_seed(seed: u64, stream: u64) -> u64 {
    if seed == 0 {
        0
    } else {
        seed.wrapping_add(stream)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(dir) = &args.output_dir {
        config.pipeline.output_dir = dir.clone();
    }
    if args.no_record {
        config.pipeline.record = false;
    }

    println!("[{}] Route Tracker Starting", ts_now());
    println!("  Motion model: {:?}", config.localizer.motion_model);
    println!("  GPS: {:.1} Hz, σ = {:.2} m", config.pipeline.gps_rate_hz, config.localizer.gps_noise);
    println!("  Camera: {:.1} Hz", config.pipeline.camera_rate_hz);
    println!("  Speedup: {:.0}x", args.speedup);

    // Map and route
    let graph = match &args.map {
        Some(path) => load_graph(path).with_context(|| format!("loading map {}", path.display()))?,
        None => demo_grid_map(args.rows, args.cols, args.spacing)?,
    };
    if let Some(path) = &args.save_map {
        save_graph(&graph, path)?;
        info!("Map saved to {}", path.display());
    }
    let route = if !args.route.is_empty() {
        args.route.clone()
    } else if args.map.is_some() {
        bail!("--route is required together with --map");
    } else {
        demo_route(args.rows, args.cols)
    };
    let walker = Arc::new(RouteWalker::new(&graph, &route, args.speed)?);
    println!(
        "  Route: {} nodes, {:.0} m, ~{:.0} s",
        route.len(),
        walker.length(),
        walker.duration()
    );

    // Localizer + guidance
    let mut localizer = EkfLocalizer::new(config.localizer.clone())?;
    localizer.load_map(graph)?;
    let localizer = Arc::new(Mutex::new(localizer));

    let mut pipeline = GuidancePipeline::new(localizer.clone(), GuidanceManager::new(config.guidance.clone()));
    if config.pipeline.record {
        pipeline = pipeline.with_recorder(Recorder::new(&config.pipeline.output_dir));
    }
    pipeline.set_route(&route)?;

    // Recognizer threads, fed by the camera task
    let running = Arc::new(AtomicBool::new(true));
    let poll = Duration::from_millis(config.pipeline.recognizer_poll_ms);
    let map = lock_localizer(&localizer).map().context("localizer has no map")?;
    let mut fanout: FrameFanout<CameraFrame> = FrameFanout::new();
    let producers = vec![
        spawn_producer(
            RoadDirectionRecognizer::new(0.1, 0.6, derive_seed(args.seed, 1)),
            fanout.subscribe(),
            pipeline.add_clue_source(),
            running.clone(),
            poll,
        ),
        spawn_producer(
            PlaceRecognizer::new(map, 15.0, derive_seed(args.seed, 2)),
            fanout.subscribe(),
            pipeline.add_clue_source(),
            running.clone(),
            poll,
        ),
    ];

    // Sensor tasks
    let clock = SimClock::new(args.speedup);
    let (gps_tx, mut gps_rx) = mpsc::channel::<PositionFix>(100);
    let gps = GpsSimulator::new(
        config.localizer.gps_noise,
        config.localizer.gps_offset,
        derive_seed(args.seed, 3),
    );
    let _gps_handle = tokio::spawn(gps_loop(
        gps_tx,
        walker.clone(),
        gps,
        clock,
        config.pipeline.gps_rate_hz,
        10.0,
    ));
    let camera_handle = tokio::spawn(camera_loop(
        fanout,
        walker.clone(),
        clock,
        config.pipeline.camera_rate_hz,
        running.clone(),
    ));

    // Fusion loop: one tick per position fix
    let mut last_message = String::new();
    while let Some(fix) = gps_rx.recv().await {
        let report = pipeline.tick(Some(fix));

        for event in &report.events {
            match event {
                PipelineEvent::StatusChanged { from, to } => {
                    info!("[{}] Status {:?} -> {:?}", ts_now(), from, to)
                }
                PipelineEvent::OffRoute { node_id } => warn!("Off route near node {}", node_id),
                PipelineEvent::LocalizerLost { confidence } => {
                    warn!("Localization lost (confidence {:.2})", confidence)
                }
                _ => {}
            }
        }

        if let Some(guidance) = &report.guidance {
            if guidance.message != last_message {
                println!(
                    "[{}] t={:6.1}s ({:7.1}, {:7.1}) conf={:.2}  {}",
                    ts_now(),
                    report.timestamp,
                    report.pose.x,
                    report.pose.y,
                    report.confidence,
                    guidance.message
                );
                last_message = guidance.message.clone();
            }
        }

        if pipeline.is_arrived() {
            println!("[{}] Destination reached at t={:.1}s", ts_now(), report.timestamp);
            break;
        }
    }

    // Shutdown: stop producers, then flush the recorder
    running.store(false, Ordering::Relaxed);
    if let Err(e) = camera_handle.await {
        warn!("Camera task failed: {}", e);
    }
    for producer in producers {
        let name = producer.name().to_string();
        let stats = producer.stop();
        info!(
            "Recognizer '{}': {} frames, {} clues, {} errors",
            name, stats.frames, stats.clues, stats.errors
        );
    }

    let arrived = pipeline.is_arrived();
    let ticks = pipeline.ticks();
    let final_state = lock_localizer(&localizer).get_state();
    let recorder = pipeline.finish();

    println!("\n=== Final Stats ===");
    println!("Ticks: {}", ticks);
    println!("Arrived: {}", arrived);
    println!(
        "Position updates: {}, clue updates: {}, rejected: {}",
        final_state.position_updates, final_state.clue_updates, final_state.rejected
    );
    if let Some(recorder) = recorder {
        let summary = recorder.summary();
        println!("Distance travelled: {:.1} m", summary.distance_travelled);
        println!("Session: {}", summary.session_id);
    }

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
