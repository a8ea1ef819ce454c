use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::NavResult;
use crate::mailbox::Mailbox;
use crate::types::{LocClue, Pose2};

/// Captured camera frame
///
/// Pixel data is shared so fanning a frame out to several recognizers does not copy it.
#[derive(Clone, Debug)]
pub struct CameraFrame {
    pub timestamp: f64,
    pub width: u32,
    pub height: u32,
    pub pixels: Arc<Vec<u8>>,
    /// Pose the frame was taken from; only simulated cameras know it
    pub ground_truth: Option<Pose2>,
}

impl CameraFrame {
    pub fn new(timestamp: f64, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            timestamp,
            width,
            height,
            pixels: Arc::new(pixels),
            ground_truth: None,
        }
    }

    /// Frame without image content, carrying only the capture pose
    pub fn simulated(timestamp: f64, ground_truth: Pose2) -> Self {
        Self {
            timestamp,
            width: 0,
            height: 0,
            pixels: Arc::new(Vec::new()),
            ground_truth: Some(ground_truth),
        }
    }
}

/// Vision module turning frames into localization clues
pub trait Recognizer: Send {
    fn name(&self) -> &str;

    /// Analyze one frame
    ///
    /// # Returns
    /// `Ok(None)` when nothing was recognized
    fn apply(&mut self, frame: &CameraFrame, timestamp: f64) -> NavResult<Option<LocClue>>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub frames: u64,
    pub clues: u64,
    pub errors: u64,
}

/// Running recognizer thread
#[derive(Debug)]
pub struct ProducerHandle {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<ProducerStats>>,
}

impl ProducerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Raise the stop flag and wait for the thread
    pub fn stop(mut self) -> ProducerStats {
        self.running.store(false, Ordering::Relaxed);
        self.join()
    }

    fn join(&mut self) -> ProducerStats {
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(stats)) => stats,
            Some(Err(_)) => {
                warn!("Recognizer '{}' thread panicked", self.name);
                ProducerStats::default()
            }
            None => ProducerStats::default(),
        }
    }
}

impl Drop for ProducerHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.join();
    }
}

/// Run `recognizer` on its own thread
///
/// Each frame taken from `frames` is analyzed and any clue published into
/// `clues`. The loop polls the stop flag at least every `poll`. Recognizer
/// errors are logged and the frame skipped.
pub fn spawn_producer<R>(
    mut recognizer: R,
    frames: Mailbox<CameraFrame>,
    clues: Mailbox<LocClue>,
    running: Arc<AtomicBool>,
    poll: Duration,
) -> ProducerHandle
where
    R: Recognizer + 'static,
{
    let name = recognizer.name().to_string();
    let thread_running = running.clone();
    let thread_name = name.clone();

    let handle = thread::spawn(move || {
        info!("Recognizer '{}' started", thread_name);
        let mut stats = ProducerStats::default();

        while thread_running.load(Ordering::Relaxed) {
            let Some(frame) = frames.take_timeout(poll) else {
                continue;
            };
            stats.frames += 1;

            match recognizer.apply(&frame, frame.timestamp) {
                Ok(Some(clue)) => {
                    stats.clues += 1;
                    if clues.publish(clue) {
                        debug!("Recognizer '{}' overwrote an unread clue", thread_name);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    stats.errors += 1;
                    warn!("Recognizer '{}' failed at t={:.2}: {}", thread_name, frame.timestamp, e);
                }
            }
        }

        info!(
            "Recognizer '{}' stopped: {} frames, {} clues, {} errors",
            thread_name, stats.frames, stats.clues, stats.errors
        );
        stats
    });

    ProducerHandle {
        name,
        running,
        handle: Some(handle),
    }
}
