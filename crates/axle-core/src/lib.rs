//! Core data structures for the axle robot engine.
//!
//! This crate defines the pose frame tree, the actuator event channel, the
//! action outcome taxonomy, track locking, and framework configuration.
//! The action framework itself lives in `axle-action`.

pub mod angle;
pub mod config;
pub mod error;
pub mod event;
pub mod pose;
pub mod result;
pub mod types;

pub use angle::Radians;
pub use config::{
    ActionConfig, DockingConfig, DriveConfig, EngineConfig, FrameworkConfig, TurnConfig,
};
pub use error::{AxleError, PoseError, Result};
pub use event::{EventChannel, EventKind, RobotEvent, Subscription};
pub use pose::{heading, planar_transform, z_angle, PoseId, PoseTree, Transform, MAX_PARENT_HOPS};
pub use result::{ActionResult, ResultCategory};
pub use types::{
    ActionTag, AnimTag, MarkerCode, MotorActionId, ObjectId, TagAllocator, Track, TrackLocks,
    Tracks,
};
