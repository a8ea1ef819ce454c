// fusion.rs: synchronous fusion loop
//
// One tick per position fix: drain the newest clue from every recognizer
// mailbox, feed clues and the fix to the localizer in timestamp order, then
// project the result through the guidance manager and into the recorder.
// The localizer mutex is held for one batch of writes or one batch of reads,
// never together with any other lock.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{NavError, NavResult};
use crate::filters::EkfLocalizer;
use crate::guidance::{Guidance, GuidanceManager, MoveStatus, Path};
use crate::mailbox::Mailbox;
use crate::map_match::NodeId;
use crate::recorder::{Recorder, TrackRow};
use crate::types::{LocClue, Polar2, Pose2, PositionFix, TopometricPose};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Position fix rate of the sensor task [Hz]
    pub gps_rate_hz: f64,
    /// Frame rate of the camera task [Hz]
    pub camera_rate_hz: f64,
    /// Stop-flag polling interval of recognizer threads [ms]
    pub recognizer_poll_ms: u64,
    pub record: bool,
    pub output_dir: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            gps_rate_hz: 1.0,
            camera_rate_hz: 5.0,
            recognizer_poll_ms: 10,
            record: true,
            output_dir: "route_tracker_sessions".to_string(),
        }
    }
}

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    PositionRejected { timestamp: f64, reason: String },
    ClueApplied { timestamp: f64, applied: usize, skipped: usize },
    ClueRejected { timestamp: f64, reason: String },
    LocalizerLost { confidence: f64 },
    StatusChanged { from: Option<MoveStatus>, to: MoveStatus },
    OffRoute { node_id: NodeId },
    Arrived { node_id: NodeId },
}

// ─── Tick output ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct TickReport {
    pub timestamp: f64,
    pub pose: Pose2,
    pub velocity: Polar2,
    pub confidence: f64,
    pub topometric: Option<TopometricPose>,
    pub status: Option<MoveStatus>,
    pub guidance: Option<Guidance>,
    pub events: Vec<PipelineEvent>,
}

enum Observation {
    Fix(PositionFix),
    Clue(LocClue),
}

impl Observation {
    fn timestamp(&self) -> f64 {
        match self {
            Observation::Fix(f) => f.timestamp,
            Observation::Clue(c) => c.timestamp,
        }
    }
}

/// Lock the localizer, recovering the guard if a producer panicked while holding it
pub fn lock_localizer(localizer: &Mutex<EkfLocalizer>) -> MutexGuard<'_, EkfLocalizer> {
    localizer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Pipeline ────────────────────────────────────────────────────────────────

pub struct GuidancePipeline {
    localizer: Arc<Mutex<EkfLocalizer>>,
    guidance: GuidanceManager,
    clue_sources: Vec<Mailbox<LocClue>>,
    recorder: Option<Recorder>,
    last_status: Option<MoveStatus>,
    ticks: u64,
}

impl GuidancePipeline {
    pub fn new(localizer: Arc<Mutex<EkfLocalizer>>, guidance: GuidanceManager) -> Self {
        Self {
            localizer,
            guidance,
            clue_sources: Vec::new(),
            recorder: None,
            last_status: None,
            ticks: 0,
        }
    }

    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Mailbox a recognizer producer publishes into
    pub fn add_clue_source(&mut self) -> Mailbox<LocClue> {
        let mailbox = Mailbox::new();
        self.clue_sources.push(mailbox.clone());
        mailbox
    }

    pub fn localizer(&self) -> Arc<Mutex<EkfLocalizer>> {
        self.localizer.clone()
    }

    pub fn guidance(&self) -> &GuidanceManager {
        &self.guidance
    }

    pub fn recorder(&self) -> Option<&Recorder> {
        self.recorder.as_ref()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Plan guidance along `nodes` over the localizer's map
    pub fn set_route(&mut self, nodes: &[NodeId]) -> NavResult<()> {
        let map = lock_localizer(&self.localizer)
            .map()
            .ok_or(NavError::UninitializedLocalizer)?;
        let path = Path::from_nodes(&map, nodes)?;

        self.guidance.set_path_n_map(path, map)?;
        self.guidance.initialize_guides()?;
        lock_localizer(&self.localizer).set_route_hint(nodes);
        self.last_status = None;
        Ok(())
    }

    /// Run one fusion step
    ///
    /// Observation rejections are reported as events, not errors.
    pub fn tick(&mut self, fix: Option<PositionFix>) -> TickReport {
        self.ticks += 1;
        let mut events = Vec::new();

        let mut observations: Vec<Observation> = self
            .clue_sources
            .iter()
            .filter_map(Mailbox::take)
            .map(Observation::Clue)
            .collect();
        observations.extend(fix.map(Observation::Fix));
        observations.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));

        if !observations.is_empty() {
            let mut localizer = lock_localizer(&self.localizer);
            for obs in &observations {
                match obs {
                    Observation::Fix(f) => {
                        if let Err(e) = localizer.apply_position(f) {
                            debug!("Position fix at t={:.2} rejected: {}", f.timestamp, e);
                            events.push(PipelineEvent::PositionRejected {
                                timestamp: f.timestamp,
                                reason: e.to_string(),
                            });
                        }
                    }
                    Observation::Clue(c) => match localizer.apply_loc_clue(c) {
                        Ok(outcome) => events.push(PipelineEvent::ClueApplied {
                            timestamp: c.timestamp,
                            applied: outcome.applied,
                            skipped: outcome.skipped,
                        }),
                        Err(e) => {
                            debug!("Clue at t={:.2} rejected: {}", c.timestamp, e);
                            events.push(PipelineEvent::ClueRejected {
                                timestamp: c.timestamp,
                                reason: e.to_string(),
                            });
                        }
                    },
                }
            }
        }

        let now = observations
            .iter()
            .map(Observation::timestamp)
            .fold(f64::NEG_INFINITY, f64::max);
        let (pose, velocity, topometric, confidence, timestamp, lost) = {
            let localizer = lock_localizer(&self.localizer);
            let timestamp = localizer.timestamp().unwrap_or(0.0).max(now);
            (
                localizer.pose(),
                localizer.velocity(),
                localizer.topometric(),
                localizer.pose_confidence_at(timestamp),
                timestamp,
                localizer.timestamp().is_some() && localizer.is_lost(timestamp),
            )
        };
        if lost {
            events.push(PipelineEvent::LocalizerLost { confidence });
        }

        let (status, guidance) = self.drive_guidance(topometric.as_ref(), &mut events);

        if let Some(recorder) = self.recorder.as_mut() {
            let mut row = TrackRow::new(timestamp, pose, velocity, confidence)
                .with_guidance(status, guidance.as_ref());
            row.topometric = topometric;
            recorder.push(row);
        }

        TickReport {
            timestamp,
            pose,
            velocity,
            confidence,
            topometric,
            status,
            guidance,
            events,
        }
    }

    fn drive_guidance(
        &mut self,
        topometric: Option<&TopometricPose>,
        events: &mut Vec<PipelineEvent>,
    ) -> (Option<MoveStatus>, Option<Guidance>) {
        let Some(tp) = topometric else {
            return (self.last_status, None);
        };
        if !self.guidance.is_ready() {
            return (None, None);
        }

        let status = match self.guidance.apply_pose(tp) {
            Ok(status) => status,
            Err(e) => {
                warn!("Guidance rejected pose: {}", e);
                return (self.last_status, None);
            }
        };

        if self.last_status != Some(status) {
            events.push(PipelineEvent::StatusChanged {
                from: self.last_status,
                to: status,
            });
            match status {
                MoveStatus::Arrived => events.push(PipelineEvent::Arrived {
                    node_id: self.guidance.route_node().unwrap_or(tp.node_id),
                }),
                MoveStatus::OutOfPath => events.push(PipelineEvent::OffRoute { node_id: tp.node_id }),
                _ => {}
            }
            self.last_status = Some(status);
        }

        let guidance = match self.guidance.get_guidance(status) {
            Ok(g) => Some(g),
            Err(NavError::OutOfPath { .. }) => None,
            Err(e) => {
                warn!("Guidance unavailable: {}", e);
                None
            }
        };
        (Some(status), guidance)
    }

    pub fn is_arrived(&self) -> bool {
        self.last_status == Some(MoveStatus::Arrived)
    }

    /// Flush the recorder (best effort) and hand it back
    pub fn finish(mut self) -> Option<Recorder> {
        let mut recorder = self.recorder.take()?;
        recorder.set_localizer_state(lock_localizer(&self.localizer).get_state());
        let paths = recorder.flush_best_effort();
        info!(
            "Pipeline finished after {} ticks, {} files written",
            self.ticks,
            paths.len()
        );
        Some(recorder)
    }
}
