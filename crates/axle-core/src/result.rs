//! The closed outcome taxonomy every action reports through.
//!
//! An action's outcome is a value, not an error: callers branch on the
//! variant to decide whether to retry, substitute a strategy, or give up.
//! `category()` is an exhaustive match with no wildcard arm, so adding a
//! variant without classifying it fails to compile.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of updating an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    // Non-terminal
    NotStarted,
    Running,

    // Terminal success
    Success,

    // Cancellation
    Cancelled,

    // Precondition failures (detected in init)
    BadObject,
    BadPose,
    BadMarker,
    BadTag,
    NoPreActionPoses,
    NoGoalSet,
    NoDistanceSet,
    StillCarryingObject,
    NotCarryingObjectAbort,
    ShouldntDriveOnCharger,
    TracksLocked,
    MismatchedUpAxis,

    // Progress-stall failures (detected mid-poll)
    DidNotReachPreActionPose,
    MotorStoppedMakingProgress,
    FailedTraversingPath,
    FollowingPathButNotTraversing,
    PathPlanningFailedAbort,
    PathPlanningFailedRetry,

    // Verification failures (maneuver reportedly done, checks disagree)
    LastPickAndPlaceFailed,
    NotCarryingObjectRetry,
    UnexpectedPitchAngle,
    PickupObjectUnexpectedlyMoving,
    PickupObjectUnexpectedlyNotMoving,
    VisualObservationFailed,
    UnexpectedDockAction,

    // Framework-imposed
    Timeout,

    // Transport
    SendMessageFailed,
}

/// Default classification of a result, mirroring how the framework and
/// compounds react to it. A parent may still override the reaction to a
/// specific failure via its per-child ignore predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCategory {
    Running,
    Success,
    /// Worth trying again without caller intervention (the retry budget
    /// applies to these).
    Retry,
    /// Not retryable by the framework; the caller must decide.
    Abort,
    Cancelled,
}

impl ActionResult {
    pub fn category(self) -> ResultCategory {
        use ActionResult::*;
        // Exhaustive on purpose: a new variant must be classified here
        // before the crate compiles.
        match self {
            NotStarted | Running => ResultCategory::Running,
            Success => ResultCategory::Success,
            Cancelled => ResultCategory::Cancelled,

            DidNotReachPreActionPose
            | PathPlanningFailedRetry
            | FailedTraversingPath
            | LastPickAndPlaceFailed
            | NotCarryingObjectRetry
            | VisualObservationFailed
            | MotorStoppedMakingProgress
            | PickupObjectUnexpectedlyNotMoving => ResultCategory::Retry,

            BadObject
            | BadPose
            | BadMarker
            | BadTag
            | NoPreActionPoses
            | NoGoalSet
            | NoDistanceSet
            | StillCarryingObject
            | NotCarryingObjectAbort
            | ShouldntDriveOnCharger
            | TracksLocked
            | MismatchedUpAxis
            | FollowingPathButNotTraversing
            | PathPlanningFailedAbort
            | UnexpectedPitchAngle
            | PickupObjectUnexpectedlyMoving
            | UnexpectedDockAction
            | Timeout
            | SendMessageFailed => ResultCategory::Abort,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self.category(), ResultCategory::Running)
    }

    pub fn is_failure(self) -> bool {
        matches!(self.category(), ResultCategory::Retry | ResultCategory::Abort)
    }
}

impl fmt::Display for ActionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
