pub mod manager;
pub mod motion;
pub mod path;

pub use manager::{Guidance, GuidanceAction, GuidanceConfig, GuidanceManager, MoveStatus, RouteProgress};
pub use motion::{classify_turn, Motion, TurnBucket};
pub use path::{Path, RoutePoint};
