use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use ndarray::Array1;
use serde_json::json;

use route_tracker_rs::filters::{EkfLocalizer, LocalizerConfig, MotionModelKind};
use route_tracker_rs::sim::{generate_trajectory, GpsSimulator, TrajectoryConfig, TrajectoryKind, TruthSample};
use route_tracker_rs::types::{wrap_angle, Polar2, Pose2, PositionFix};

/// Compare motion models on synthetic trajectories with simulated GPS
#[derive(Parser, Debug)]
struct Args {
    /// Trials per (model, trajectory)
    #[arg(long, default_value = "10")]
    trials: usize,

    /// Motion models by abbreviation (CV, ZG, HT, ST); all when omitted
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,

    /// Trajectories (Stop, Line, Circle, Sine, Square); all when omitted
    #[arg(long, value_delimiter = ',')]
    trajectories: Vec<TrajectoryKind>,

    /// GPS rate [Hz]
    #[arg(long, default_value = "10")]
    gps_freq: f64,

    /// GPS noise std [m]
    #[arg(long, default_value = "0.5")]
    gps_noise: f64,

    /// GPS antenna offset ahead of the body [m]
    #[arg(long, default_value = "1.0")]
    gps_offset: f64,

    /// Motion noise for both linear and angular channels
    #[arg(long, default_value = "0.1")]
    motion_noise: f64,

    /// Initial pose "x,y,theta_deg"
    #[arg(long, value_delimiter = ',', default_value = "100,100,-30")]
    init: Vec<f64>,

    /// Trajectory duration [s]
    #[arg(long, default_value = "60")]
    duration: f64,

    /// Seconds excluded from the error statistics while the filter converges
    #[arg(long, default_value = "0")]
    skip_secs: f64,

    /// RNG seed (0 = random)
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Write every estimated trajectory as CSV into this directory
    #[arg(long)]
    csv_dir: Option<PathBuf>,
}

struct RunResult {
    pos_rmse: f64,
    head_rmse: f64,
    rejected: usize,
    estimates: Vec<(f64, Pose2, Polar2)>,
}

fn rmse(errors: &[f64]) -> f64 {
    if errors.is_empty() {
        return f64::INFINITY;
    }
    let e = Array1::from_vec(errors.to_vec());
    e.mapv(|v| v * v).mean().unwrap_or(f64::INFINITY).sqrt()
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn parse_models(names: &[String]) -> anyhow::Result<Vec<MotionModelKind>> {
    if names.is_empty() {
        return Ok(MotionModelKind::all().to_vec());
    }
    names
        .iter()
        .map(|name| {
            MotionModelKind::all()
                .into_iter()
                .find(|k| k.abbreviation().eq_ignore_ascii_case(name))
                .ok_or_else(|| anyhow::anyhow!("unknown motion model '{}'", name))
        })
        .collect()
}

fn run_once(
    model: MotionModelKind,
    truth: &[TruthSample],
    fixes: &[PositionFix],
    init: Pose2,
    args: &Args,
) -> anyhow::Result<RunResult> {
    let config = LocalizerConfig {
        motion_model: model,
        motion_noise_lin: args.motion_noise,
        motion_noise_ang: args.motion_noise,
        gps_noise: args.gps_noise,
        gps_offset: Polar2::new(args.gps_offset, 0.0),
        ..LocalizerConfig::default()
    };
    let mut localizer = EkfLocalizer::new(config)?;
    localizer.set_state(init, Polar2::new(0.0, 0.0));

    let mut pos_errors = Vec::with_capacity(truth.len());
    let mut head_errors = Vec::with_capacity(truth.len());
    let mut estimates = Vec::with_capacity(truth.len());
    let mut rejected = 0;

    for (sample, fix) in truth.iter().zip(fixes) {
        if localizer.apply_position(fix).is_err() {
            rejected += 1;
            continue;
        }
        let pose = localizer.pose();
        estimates.push((fix.timestamp, pose, localizer.velocity()));
        if sample.timestamp < args.skip_secs {
            continue;
        }
        pos_errors.push(pose.position().distance(&sample.pose.position()));
        head_errors.push(wrap_angle(pose.theta - sample.pose.theta));
    }

    Ok(RunResult {
        pos_rmse: rmse(&pos_errors),
        head_rmse: rmse(&head_errors),
        rejected,
        estimates,
    })
}

fn save_estimates(path: &Path, estimates: &[(f64, Pose2, Polar2)]) -> anyhow::Result<()> {
    let mut out = String::from("# Time[sec], X[m], Y[m], Theta[rad], LinVel[m/s], AngVel[rad/s]\n");
    for (t, p, v) in estimates {
        out.push_str(&format!(
            "{:.6}, {:.6}, {:.6}, {:.6}, {:.6}, {:.6}\n",
            t, p.x, p.y, p.theta, v.lin, v.ang
        ));
    }
    fs::write(path, out)?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    if args.init.len() != 3 {
        anyhow::bail!("--init expects x,y,theta_deg");
    }
    if args.trials == 0 {
        anyhow::bail!("--trials must be at least 1");
    }
    let init = Pose2::new(args.init[0], args.init[1], args.init[2].to_radians());
    let models = parse_models(&args.models)?;
    let trajectories = if args.trajectories.is_empty() {
        TrajectoryKind::all().to_vec()
    } else {
        args.trajectories.clone()
    };
    if let Some(dir) = &args.csv_dir {
        fs::create_dir_all(dir)?;
    }

    let traj_config = TrajectoryConfig {
        duration: args.duration,
        ..TrajectoryConfig::default()
    };

    let mut results = Vec::new();
    for traj in &trajectories {
        let truth = generate_trajectory(*traj, args.gps_freq, &traj_config);
        if truth.is_empty() {
            anyhow::bail!("trajectory {} produced no samples (check --gps-freq and --duration)", traj);
        }

        let mut pos = vec![Vec::with_capacity(args.trials); models.len()];
        let mut head = vec![Vec::with_capacity(args.trials); models.len()];
        let mut rejected = vec![0usize; models.len()];

        for trial in 0..args.trials {
            // Every model sees the same fixes within a trial
            let seed = if args.seed == 0 { 0 } else { args.seed + trial as u64 };
            let fixes = GpsSimulator::new(args.gps_noise, Polar2::new(args.gps_offset, 0.0), seed)
                .observe_all(&truth);

            for (m, model) in models.iter().enumerate() {
                let run = run_once(*model, &truth, &fixes, init, &args)?;
                pos[m].push(run.pos_rmse);
                head[m].push(run.head_rmse.to_degrees());
                rejected[m] += run.rejected;

                if let Some(dir) = &args.csv_dir {
                    let name = format!("{}_{}_{:03}.csv", traj, model.abbreviation(), trial);
                    if let Err(e) = save_estimates(&dir.join(&name), &run.estimates) {
                        eprintln!("Failed to write {}: {}", name, e);
                    }
                }
            }
        }

        for (m, model) in models.iter().enumerate() {
            results.push(json!({
                "trajectory": traj.name(),
                "model": model.abbreviation(),
                "motion_model": model,
                "trials": args.trials,
                "samples": truth.len(),
                "gps_freq": args.gps_freq,
                "gps_noise": args.gps_noise,
                "gps_offset": args.gps_offset,
                "motion_noise": args.motion_noise,
                "median_pos_rmse": median(&mut pos[m]),
                "median_head_rmse_deg": median(&mut head[m]),
                "rejected_fixes": rejected[m],
            }));
        }
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_and_rmse() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), 2.5);
        assert!((rmse(&[3.0, -3.0]) - 3.0).abs() < 1e-12);
        assert!(rmse(&[]).is_infinite());
    }

    #[test]
    fn test_model_selection() {
        let models = parse_models(&["cv".to_string(), "HT".to_string()]).unwrap();
        assert_eq!(models[0], MotionModelKind::Standard);
        assert_eq!(models[1].abbreviation(), "HT");
        assert!(parse_models(&["XX".to_string()]).is_err());
        assert_eq!(parse_models(&[]).unwrap().len(), 4);
    }
}
