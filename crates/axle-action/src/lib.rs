//! Action framework for the axle robot engine.
//!
//! Decomposes high-level intentions ("pick up a cube", "drive to a pose
//! and dock") into supervised, resumable, cancelable units of work that
//! poll hardware state each control tick until they succeed, fail, or
//! time out. The docking geometry lives in [`resolver`]; the lifecycle
//! contract in [`runner`].

pub mod basic;
pub mod compound;
pub mod context;
pub mod dock;
pub mod drive;
pub mod engine;
pub mod resolver;
pub mod runner;
pub mod testing;

pub use basic::{
    turn_profile_duration, MoveHeadToAngleAction, MoveLiftToHeightAction, TurnInPlaceAction,
    TurnTowardsObjectAction, VisuallyVerifyNoObjectAtPoseAction, VisuallyVerifyObjectAction,
    WaitAction,
};
pub use compound::{IgnoreFailure, ParallelAction, SequentialAction};
pub use context::{
    Actuator, AnimTrigger, CompletionRecord, DockCommand, DockMove, DockingMethod, DriveStatus,
    Interaction, MarkerSnapshot, ObjectSnapshot, Planner, PreActionPose, RobotCtx, RobotState,
    SendError, WorldModel,
};
pub use dock::{Alignment, DockInteraction, DockingAction};
pub use drive::{DriveToObjectAction, DriveToPoseAction};
pub use engine::{ActionList, Engine};
pub use resolver::{distance_threshold, remove_matching_goals, resolve, Resolution, ResolverOptions};
pub use runner::{Action, ActionRunner};
