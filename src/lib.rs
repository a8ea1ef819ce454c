//! Route tracking for guided walking: an EKF localizer fusing position fixes
//! and vision clues, topometric projection onto a route graph, and a guidance
//! state machine producing turn-by-turn instructions.

pub mod config;
pub mod error;
pub mod filters;
pub mod fusion;
pub mod guidance;
pub mod mailbox;
pub mod map_match;
pub mod recognizer;
pub mod recorder;
pub mod sensors;
pub mod sim;
pub mod types;

pub use config::AppConfig;
pub use error::{NavError, NavResult};
pub use filters::{EkfLocalizer, LocalizerConfig};
pub use fusion::{GuidancePipeline, PipelineConfig, TickReport};
pub use guidance::{Guidance, GuidanceManager, MoveStatus, Path};
pub use map_match::{GeoConverter, RouteGraph};
