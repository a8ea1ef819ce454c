use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::NavResult;
use crate::filters::LocalizerState;
use crate::guidance::{Guidance, MoveStatus};
use crate::map_match::NodeId;
use crate::types::{Polar2, Pose2, TopometricPose};

pub const CSV_HEADER: &str = "# Time[sec], X[m], Y[m], Theta[rad], LinVel[m/s], AngVel[rad/s], \
Confidence, NodeId, EdgeIdx, EdgeDist[m], Status, Remain[m], Message";

/// One fusion tick worth of output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackRow {
    pub timestamp: f64,
    pub pose: Pose2,
    pub velocity: Polar2,
    pub confidence: f64,
    pub topometric: Option<TopometricPose>,
    pub status: Option<MoveStatus>,
    pub distance_to_remain: Option<f64>,
    pub message: Option<String>,
}

impl TrackRow {
    pub fn new(timestamp: f64, pose: Pose2, velocity: Polar2, confidence: f64) -> Self {
        Self {
            timestamp,
            pose,
            velocity,
            confidence,
            topometric: None,
            status: None,
            distance_to_remain: None,
            message: None,
        }
    }

    pub fn with_guidance(mut self, status: Option<MoveStatus>, guidance: Option<&Guidance>) -> Self {
        self.status = status;
        self.distance_to_remain = guidance.map(|g| g.distance_to_remain);
        self.message = guidance.map(|g| g.message.clone());
        self
    }

    fn to_csv_line(&self) -> String {
        let tp = self.topometric.as_ref();
        format!(
            "{:.3}, {:.3}, {:.3}, {:.4}, {:.3}, {:.4}, {:.3}, {}, {}, {}, {}, {}, \"{}\"",
            self.timestamp,
            self.pose.x,
            self.pose.y,
            self.pose.theta,
            self.velocity.lin,
            self.velocity.ang,
            self.confidence,
            opt(tp.map(|t| t.node_id)),
            opt(tp.and_then(|t| t.edge_idx)),
            opt(tp.map(|t| format!("{:.2}", t.dist))),
            opt(self.status.map(|s| format!("{:?}", s))),
            opt(self.distance_to_remain.map(|d| format!("{:.1}", d))),
            self.message.as_deref().unwrap_or("").replace('"', "'"),
        )
    }
}

fn opt<T: ToString>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_default()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub rows: usize,
    pub duration_secs: f64,
    pub distance_travelled: f64,
    pub arrived: bool,
    pub final_pose: Option<Pose2>,
    pub visited_nodes: Vec<NodeId>,
    pub localizer: Option<LocalizerState>,
}

/// Collects the pose/guidance time series of a session
pub struct Recorder {
    output_dir: PathBuf,
    session_id: String,
    rows: Vec<TrackRow>,
    localizer: Option<LocalizerState>,
}

impl Recorder {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            session_id: Utc::now().format("%Y%m%d_%H%M%S").to_string(),
            rows: Vec::new(),
            localizer: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn push(&mut self, row: TrackRow) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[TrackRow] {
        &self.rows
    }

    /// Final localizer counters for the summary
    pub fn set_localizer_state(&mut self, state: LocalizerState) {
        self.localizer = Some(state);
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::with_capacity(64 * (self.rows.len() + 1));
        out.push_str(CSV_HEADER);
        out.push('\n');
        for row in &self.rows {
            let _ = writeln!(out, "{}", row.to_csv_line());
        }
        out
    }

    pub fn summary(&self) -> SessionSummary {
        let duration_secs = match (self.rows.first(), self.rows.last()) {
            (Some(a), Some(b)) => b.timestamp - a.timestamp,
            _ => 0.0,
        };
        let distance_travelled = self
            .rows
            .windows(2)
            .map(|w| w[0].pose.position().distance(&w[1].pose.position()))
            .sum();

        let mut visited_nodes: Vec<NodeId> = Vec::new();
        for node in self.rows.iter().filter_map(|r| r.topometric.map(|t| t.node_id)) {
            if visited_nodes.last() != Some(&node) {
                visited_nodes.push(node);
            }
        }

        SessionSummary {
            session_id: self.session_id.clone(),
            rows: self.rows.len(),
            duration_secs,
            distance_travelled,
            arrived: self.rows.iter().any(|r| r.status == Some(MoveStatus::Arrived)),
            final_pose: self.rows.last().map(|r| r.pose),
            visited_nodes,
            localizer: self.localizer.clone(),
        }
    }

    pub fn save_csv(&self, path: &Path) -> NavResult<()> {
        fs::write(path, self.to_csv())?;
        Ok(())
    }

    pub fn save_summary(&self, path: &Path) -> NavResult<()> {
        let json = serde_json::to_string_pretty(&self.summary())?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Write `track_<session>.csv` and `session_<session>.json` into the output directory
    pub fn flush(&self) -> NavResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir)?;
        let csv = self.output_dir.join(format!("track_{}.csv", self.session_id));
        let summary = self.output_dir.join(format!("session_{}.json", self.session_id));
        self.save_csv(&csv)?;
        self.save_summary(&summary)?;
        info!("Saved {} rows to {}", self.rows.len(), csv.display());
        Ok(vec![csv, summary])
    }

    /// Like [`flush`](Self::flush) but failures are only logged
    pub fn flush_best_effort(&self) -> Vec<PathBuf> {
        match self.flush() {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Failed to save session {}: {}", self.session_id, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn row(t: f64, x: f64, node: u64, status: MoveStatus) -> TrackRow {
        let mut r = TrackRow::new(t, Pose2::new(x, 0.0, 0.0), Polar2::new(1.0, 0.0), 0.8);
        r.topometric = Some(TopometricPose::on_edge(node, 0, x));
        r.status = Some(status);
        r
    }

    #[test]
    fn test_csv_has_header_and_rows() {
        let mut rec = Recorder::new(std::env::temp_dir());
        rec.push(row(0.0, 0.0, 1, MoveStatus::OnNode));
        rec.push(row(1.0, 1.5, 1, MoveStatus::OnEdge).with_guidance(Some(MoveStatus::OnEdge), None));

        let csv = rec.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("# Time[sec], X[m], Y[m], Theta[rad], LinVel[m/s], AngVel[rad/s]"));
        assert!(lines[2].starts_with("1.000, 1.500, 0.000"));
        assert!(lines[2].contains("OnEdge"));
    }

    #[test]
    fn test_summary_tracks_distance_and_arrival() {
        let mut rec = Recorder::new(std::env::temp_dir());
        rec.push(row(0.0, 0.0, 1, MoveStatus::OnNode));
        rec.push(row(2.0, 3.0, 1, MoveStatus::OnEdge));
        rec.push(row(4.0, 7.0, 2, MoveStatus::Arrived));

        let s = rec.summary();
        assert_eq!(s.rows, 3);
        assert_relative_eq!(s.duration_secs, 4.0);
        assert_relative_eq!(s.distance_travelled, 7.0);
        assert!(s.arrived);
        assert_eq!(s.visited_nodes, vec![1, 2]);
    }

    #[test]
    fn test_flush_writes_files() {
        let dir = std::env::temp_dir().join(format!("route_tracker_rec_{}", std::process::id()));
        let mut rec = Recorder::new(&dir);
        rec.push(row(0.0, 0.0, 1, MoveStatus::OnNode));

        let paths = rec.flush().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.exists()));
        let summary: SessionSummary =
            serde_json::from_str(&fs::read_to_string(&paths[1]).unwrap()).unwrap();
        assert_eq!(summary.rows, 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
