//! The robot context handed to every action, and the collaborator
//! interfaces it bundles.
//!
//! Actions never hold a reference to the robot. Each `init`/`check_if_done`
//! call receives `&mut RobotCtx`, re-resolves whatever it needs (object
//! snapshots, poses, actuator flags) and returns. The world model may move
//! or delete objects between any two ticks, so snapshots are taken fresh
//! per call and never cached across ticks.

use chrono::{DateTime, Utc};
use nalgebra::UnitQuaternion;
use uuid::Uuid;

use axle_core::angle::Radians;
use axle_core::config::FrameworkConfig;
use axle_core::event::EventChannel;
use axle_core::pose::{PoseId, PoseTree, Transform};
use axle_core::result::ActionResult;
use axle_core::types::{
    ActionTag, AnimTag, MarkerCode, MotorActionId, ObjectId, TagAllocator, TrackLocks,
};

// =============================================================================
// World model
// =============================================================================

/// The kind of interaction a pre-action pose supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interaction {
    Docking,
    PlaceRelative,
    PlaceOnGround,
    Rolling,
}

/// A marker on an object face, as currently known to the world model.
#[derive(Clone)]
pub struct MarkerSnapshot {
    pub code: MarkerCode,
    /// Pose node of the marker (child of the object's pose).
    pub pose: PoseId,
    /// Whether the vision pipeline currently observes this marker.
    pub observed: bool,
}

/// A point-in-time view of one object. Taken fresh each tick; holding one
/// across ticks defeats the re-validation the shared world model requires.
#[derive(Clone)]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    /// Pose node of the object center.
    pub pose: PoseId,
    /// Object height above its own base, mm.
    pub height_mm: f32,
    /// Whether the object is short enough to pick up or roll.
    pub is_carryable_height: bool,
    pub markers: Vec<MarkerSnapshot>,
    /// Marker expected to face up after a roll.
    pub top_marker: Option<MarkerCode>,
    /// Symmetry rotations under which this object looks identical.
    pub rotation_ambiguities: Vec<UnitQuaternion<f32>>,
    /// Whether the object's accelerometer currently reports motion.
    pub is_moving: bool,
    /// Engine time the object last reported motion.
    pub last_moved_at_s: f32,
}

/// One candidate pose a robot must occupy before an interaction can be
/// attempted. Already filtered against known obstacles by the world model.
#[derive(Clone, Debug)]
pub struct PreActionPose {
    pub interaction: Interaction,
    /// Pose node of the candidate (child of the object or its marker).
    pub pose: PoseId,
    /// Marker this pose approaches; interactions that are not marker-based
    /// docking may have none.
    pub marker: Option<MarkerCode>,
}

/// Spatial world model: stores and queries object poses.
///
/// Out of scope to implement here; the engine process provides the real
/// one and [`crate::testing`] provides mocks.
pub trait WorldModel: Send {
    /// Look up an object. `None` means it no longer exists.
    fn object(&self, id: ObjectId) -> Option<ObjectSnapshot>;

    /// Candidate approach poses for an interaction type, already filtered
    /// against known obstacles. `offset_x_mm` pushes the poses away from
    /// the marker along its normal.
    fn pre_action_poses(
        &self,
        id: ObjectId,
        interaction: Interaction,
        offset_x_mm: f32,
    ) -> Vec<PreActionPose>;

    /// Mark an object as the current interaction target (drives indicator
    /// lights and visualization).
    fn select_object(&mut self, id: ObjectId);
    fn deselect_object(&mut self);

    /// Forget an object's located pose (verification concluded it is not
    /// where we thought).
    fn clear_object(&mut self, id: ObjectId);

    /// Whether any located object of the same type as `id` is currently
    /// observed within `dist_mm` of the given origin-frame transform.
    fn observed_object_near(
        &self,
        tree: &PoseTree,
        exemplar: ObjectId,
        pose: &Transform,
        dist_mm: f32,
    ) -> Option<ObjectId>;
}

// =============================================================================
// Actuator
// =============================================================================

/// Low-level docking controller behavior in the actuator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockingMethod {
    Blind,
    Tracker,
    Hybrid,
    /// Used when placing at a lateral offset, where the tracker would lose
    /// the marker anyway.
    EvenBlinder,
}

/// The concrete low-level maneuver the actuator performs at the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockMove {
    PickupLow,
    PickupHigh,
    PlaceLow,
    PlaceHigh,
    RollLow,
    DeepRollLow,
    Align,
    AlignSpecial,
    PopAWheelie,
}

/// Everything the actuator needs to execute a dock.
#[derive(Debug, Clone)]
pub struct DockCommand {
    pub tag: ActionTag,
    pub object: ObjectId,
    pub dock_move: DockMove,
    pub speed_mmps: f32,
    pub accel_mmps2: f32,
    pub decel_mmps2: f32,
    pub marker: MarkerCode,
    pub marker2: Option<MarkerCode>,
    pub placement_offset_x_mm: f32,
    pub placement_offset_y_mm: f32,
    pub placement_offset_angle: Radians,
    pub num_retries: u8,
    pub method: DockingMethod,
}

/// Animation clips actions can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimTrigger {
    DockGetIn,
    DockLoop,
    DockGetOut,
    DrivingEnd,
    PlanningLoop,
}

/// The command could not be delivered to the actuator process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("failed to send command to actuator")]
pub struct SendError;

/// Fire-and-acknowledge command surface of the actuator process. Commands
/// return correlation ids; completion arrives later on the event channel.
pub trait Actuator: Send {
    fn turn_in_place(
        &mut self,
        target_angle: Radians,
        max_speed_rad_per_s: f32,
        accel_rad_per_s2: f32,
        tolerance: Radians,
        num_half_revolutions: u16,
        is_absolute: bool,
    ) -> Result<MotorActionId, SendError>;

    fn move_head_to_angle(&mut self, angle: Radians) -> Result<MotorActionId, SendError>;

    fn move_lift_to_height(&mut self, height_mm: f32) -> Result<MotorActionId, SendError>;

    fn dock_with_object(&mut self, command: &DockCommand) -> Result<(), SendError>;
    fn abort_docking(&mut self);

    fn stop_all_motors(&mut self);

    fn play_animation(&mut self, trigger: AnimTrigger) -> Result<AnimTag, SendError>;
    fn cancel_animation(&mut self, anim: AnimTag);

    // Robot-reported state, refreshed by the actuator process every tick.
    fn is_picking_or_placing(&self) -> bool;
    fn last_pick_or_place_succeeded(&self) -> bool;
    fn is_moving(&self) -> bool;
    fn is_head_moving(&self) -> bool;
    fn is_lift_moving(&self) -> bool;
    fn are_wheels_moving(&self) -> bool;
    fn is_animation_playing(&self, anim: AnimTag) -> bool;

    /// Reports received from the actuator process since the last pump.
    /// The engine publishes these to the event channel before updating any
    /// action.
    fn drain_reports(&mut self) -> Vec<axle_core::event::RobotEvent> {
        Vec::new()
    }
}

// =============================================================================
// Planner
// =============================================================================

/// Status of the external path planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    /// No drive in progress.
    Idle,
    ComputingPath,
    FollowingPath,
    /// Done driving (successfully or not — the action checks the pose).
    Ready,
    Failed,
}

/// The external motion planner. It picks among multiple goal options and
/// reports which one it selected.
pub trait Planner: Send {
    /// Begin producing and following a path toward one of `goals`
    /// (origin-frame transforms).
    fn start_driving_to_poses(&mut self, goals: &[Transform]) -> Result<(), SendError>;

    fn status(&self) -> DriveStatus;

    /// Index into the goal list of the goal the planner chose.
    fn selected_goal_index(&self) -> usize;

    fn abort(&mut self);
    fn is_active(&self) -> bool;

    /// True when the full final path reached the actuator (used to tell
    /// "finished but off-goal" apart from "path never arrived").
    fn last_path_fully_delivered(&self) -> bool;
}

// =============================================================================
// Robot state & context
// =============================================================================

/// Per-tick robot state maintained by the localizer and component layer.
pub struct RobotState {
    /// Pose node of the robot in the pose tree.
    pub pose: PoseId,
    /// Increments whenever the localizer re-bases the robot pose
    /// (relocalization).
    pub pose_frame_id: u32,
    pub pitch: Radians,
    /// Object currently attached to the lift, if any.
    pub carrying: Option<ObjectId>,
    /// Marker of the carried object facing the robot.
    pub carrying_marker: Option<MarkerCode>,
    pub on_charger: bool,
    pub held_in_palm: bool,
}

/// Telemetry record emitted when an action reaches a terminal state.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub id: Uuid,
    pub tag: ActionTag,
    pub name: String,
    pub result: ActionResult,
    pub completed_at: DateTime<Utc>,
}

/// The context handle injected into every action call.
///
/// Owns the pose tree, event channel, track locks, tag allocator, robot
/// state, and the collaborator interfaces. Constructed once per robot and
/// threaded through the engine tick loop.
pub struct RobotCtx {
    pub config: FrameworkConfig,
    /// Engine time in seconds, advanced once per tick by the engine.
    pub time_s: f32,
    pub poses: PoseTree,
    pub events: EventChannel,
    pub locks: TrackLocks,
    pub tags: TagAllocator,
    pub robot: RobotState,
    pub world: Box<dyn WorldModel>,
    pub actuator: Box<dyn Actuator>,
    pub planner: Box<dyn Planner>,
    completions: Vec<CompletionRecord>,
}

impl RobotCtx {
    /// Build a context with a fresh pose tree containing one origin and
    /// the robot pose at its identity.
    pub fn new(
        config: FrameworkConfig,
        world: Box<dyn WorldModel>,
        actuator: Box<dyn Actuator>,
        planner: Box<dyn Planner>,
    ) -> Self {
        let mut poses = PoseTree::new();
        let origin = poses.add_origin();
        let robot_pose = poses.add_pose(origin, Transform::identity());
        Self {
            config,
            time_s: 0.0,
            poses,
            events: EventChannel::new(),
            locks: TrackLocks::new(),
            tags: TagAllocator::new(),
            robot: RobotState {
                pose: robot_pose,
                pose_frame_id: 0,
                pitch: Radians::new(0.0),
                carrying: None,
                carrying_marker: None,
                on_charger: false,
                held_in_palm: false,
            },
            world,
            actuator,
            planner,
            completions: Vec::new(),
        }
    }

    pub fn advance_time(&mut self, dt_s: f32) {
        self.time_s += dt_s;
    }

    /// Record completion telemetry for a finished action.
    pub fn record_completion(&mut self, tag: ActionTag, name: &str, result: ActionResult) {
        tracing::info!(%tag, name, %result, "Action completed");
        self.completions.push(CompletionRecord {
            id: Uuid::new_v4(),
            tag,
            name: name.to_string(),
            result,
            completed_at: Utc::now(),
        });
    }

    pub fn completions(&self) -> &[CompletionRecord] {
        &self.completions
    }
}
