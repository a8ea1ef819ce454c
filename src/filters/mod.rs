pub mod ekf_localizer;
pub mod kalman;
pub mod motion_model;

pub use ekf_localizer::{
    ClueFusionPolicy, ClueOutcome, DeadZone, EkfLocalizer, LocalizerConfig, LocalizerSnapshot,
    LocalizerState, LocalizerStatus,
};
pub use motion_model::{MotionModel, MotionModelKind};
