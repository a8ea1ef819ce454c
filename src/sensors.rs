use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, Duration};

use crate::mailbox::FrameFanout;
use crate::recognizer::CameraFrame;
use crate::sim::{GpsSimulator, RouteWalker};
use crate::types::PositionFix;

/// Simulation time, optionally running faster than wall time
#[derive(Clone, Copy, Debug)]
pub struct SimClock {
    start: Instant,
    speedup: f64,
}

impl SimClock {
    pub fn new(speedup: f64) -> Self {
        Self {
            start: Instant::now(),
            speedup: speedup.max(1e-3),
        }
    }

    /// Simulated seconds since start
    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * self.speedup
    }

    /// Wall-clock period for a simulated rate
    pub fn period(&self, rate_hz: f64) -> Duration {
        Duration::from_secs_f64(1.0 / (rate_hz.max(1e-3) * self.speedup))
    }
}

/// Position fixes along the walk until it ends (plus `linger` seconds)
pub async fn gps_loop(
    tx: Sender<PositionFix>,
    walker: Arc<RouteWalker>,
    mut gps: GpsSimulator,
    clock: SimClock,
    rate_hz: f64,
    linger: f64,
) {
    let mut interval = interval(clock.period(rate_hz));
    let mut fix_count = 0u64;

    loop {
        interval.tick().await;
        let t = clock.now();
        if t > walker.duration() + linger {
            info!("[gps] Walk finished after {} fixes", fix_count);
            break;
        }

        let fix = gps.observe(&walker.pose_at(t), t);
        match tx.try_send(fix) {
            Ok(_) => {
                fix_count += 1;
                if fix_count % 10 == 0 {
                    debug!("[gps] {} fixes", fix_count);
                }
            }
            Err(TrySendError::Closed(_)) => {
                info!("[gps] Channel closed after {} fixes", fix_count);
                break;
            }
            Err(TrySendError::Full(_)) => {
                // Fusion loop behind, drop this fix
            }
        }
    }
}

/// Simulated camera: publishes a frame per tick to every recognizer mailbox
pub async fn camera_loop(
    fanout: FrameFanout<CameraFrame>,
    walker: Arc<RouteWalker>,
    clock: SimClock,
    rate_hz: f64,
    running: Arc<AtomicBool>,
) {
    let mut interval = interval(clock.period(rate_hz));
    let mut frame_count = 0u64;
    let mut overwritten = 0usize;

    while running.load(Ordering::Relaxed) {
        interval.tick().await;
        let t = clock.now();
        overwritten += fanout.publish(CameraFrame::simulated(t, walker.pose_at(t)));
        frame_count += 1;
    }
    info!(
        "[camera] Stopped after {} frames ({} dropped unread)",
        frame_count, overwritten
    );
}
