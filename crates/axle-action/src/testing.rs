//! Test support: mock collaborators and a rig that assembles a
//! [`RobotCtx`] around them.
//!
//! The mocks share their state through `Arc<Mutex<_>>` handles so tests
//! can poke robot-reported flags between ticks while the context owns the
//! boxed trait objects.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nalgebra::UnitQuaternion;

use axle_core::angle::Radians;
use axle_core::config::FrameworkConfig;
use axle_core::event::{EventChannel, RobotEvent};
use axle_core::pose::{planar_translation, z_angle, PoseId, PoseTree, Transform};
use axle_core::result::ActionResult;
use axle_core::types::{AnimTag, MarkerCode, MotorActionId, ObjectId, Tracks};

use crate::context::{
    Actuator, AnimTrigger, DockCommand, DriveStatus, Interaction, MarkerSnapshot, ObjectSnapshot,
    Planner, PreActionPose, RobotCtx, SendError, WorldModel,
};
use crate::runner::Action;

/// Heading tolerance accepted by the mock's same-type pose matching when
/// the exemplar has no rotation ambiguities.
const MOCK_POSE_ANGLE_TOL_RAD: f32 = 0.45;

// =============================================================================
// Mock world
// =============================================================================

struct MockObject {
    pose: PoseId,
    type_id: u32,
    height_mm: f32,
    is_carryable_height: bool,
    markers: Vec<(MarkerCode, PoseId, bool)>,
    top_marker: Option<MarkerCode>,
    rotation_ambiguities: Vec<UnitQuaternion<f32>>,
    is_moving: bool,
    last_moved_at_s: f32,
    pre_action_poses: Vec<(Interaction, PoseId, Option<MarkerCode>)>,
}

#[derive(Default)]
pub struct WorldState {
    objects: std::collections::HashMap<ObjectId, MockObject>,
    pub selected: Option<ObjectId>,
    pub deselected: bool,
    pub cleared: Vec<ObjectId>,
}

#[derive(Clone)]
pub struct MockWorld {
    state: Arc<Mutex<WorldState>>,
}

impl WorldModel for MockWorld {
    fn object(&self, id: ObjectId) -> Option<ObjectSnapshot> {
        let state = self.state.lock().unwrap();
        let object = state.objects.get(&id)?;
        Some(ObjectSnapshot {
            id,
            pose: object.pose,
            height_mm: object.height_mm,
            is_carryable_height: object.is_carryable_height,
            markers: object
                .markers
                .iter()
                .map(|(code, pose, observed)| MarkerSnapshot {
                    code: *code,
                    pose: *pose,
                    observed: *observed,
                })
                .collect(),
            top_marker: object.top_marker,
            rotation_ambiguities: object.rotation_ambiguities.clone(),
            is_moving: object.is_moving,
            last_moved_at_s: object.last_moved_at_s,
        })
    }

    fn pre_action_poses(
        &self,
        id: ObjectId,
        interaction: Interaction,
        _offset_x_mm: f32,
    ) -> Vec<PreActionPose> {
        let state = self.state.lock().unwrap();
        let Some(object) = state.objects.get(&id) else {
            return Vec::new();
        };
        object
            .pre_action_poses
            .iter()
            .filter(|(kind, _, _)| *kind == interaction)
            .map(|(kind, pose, marker)| PreActionPose {
                interaction: *kind,
                pose: *pose,
                marker: *marker,
            })
            .collect()
    }

    fn select_object(&mut self, id: ObjectId) {
        self.state.lock().unwrap().selected = Some(id);
    }

    fn deselect_object(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.selected = None;
        state.deselected = true;
    }

    fn clear_object(&mut self, id: ObjectId) {
        self.state.lock().unwrap().cleared.push(id);
    }

    fn observed_object_near(
        &self,
        tree: &PoseTree,
        exemplar: ObjectId,
        pose: &Transform,
        dist_mm: f32,
    ) -> Option<ObjectId> {
        let state = self.state.lock().unwrap();
        let exemplar_type = state.objects.get(&exemplar)?.type_id;
        let ambiguities = state
            .objects
            .get(&exemplar)
            .map(|o| o.rotation_ambiguities.clone())
            .unwrap_or_default();
        let (px, py) = planar_translation(pose);

        for (id, object) in state.objects.iter() {
            if object.type_id != exemplar_type {
                continue;
            }
            let observed = object.markers.iter().any(|(_, _, seen)| *seen);
            if !observed {
                continue;
            }
            let Ok(parent) = tree.origin_of(object.pose) else {
                continue;
            };
            let Ok(object_t) = tree.with_respect_to(object.pose, parent) else {
                continue;
            };
            let (ox, oy) = planar_translation(&object_t);
            let dist_sq = (ox - px) * (ox - px) + (oy - py) * (oy - py);
            if dist_sq > dist_mm * dist_mm {
                continue;
            }
            // Heading must match under some symmetry rotation of the
            // exemplar (any heading matches when none are declared).
            let heading_matches = if ambiguities.is_empty() {
                true
            } else {
                let object_rot = object_t.rotation;
                ambiguities.iter().any(|q| {
                    let residual = q.inverse() * (pose.rotation.inverse() * object_rot);
                    Radians::new(z_angle(&residual))
                        .is_near(Radians::new(0.0), MOCK_POSE_ANGLE_TOL_RAD)
                })
            };
            if heading_matches {
                return Some(*id);
            }
        }
        None
    }
}

/// Builder for seeding objects into the mock world.
pub struct MockObjectBuilder {
    id: ObjectId,
    type_id: u32,
    pose: Transform,
    height_mm: f32,
    is_carryable_height: bool,
    markers: Vec<(MarkerCode, bool)>,
    top_marker: Option<MarkerCode>,
    rotation_ambiguities: Vec<UnitQuaternion<f32>>,
    pre_action_poses: Vec<(Interaction, Transform, Option<MarkerCode>)>,
}

impl MockObjectBuilder {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            type_id: 1,
            pose: Transform::identity(),
            height_mm: 44.0,
            is_carryable_height: true,
            markers: Vec::new(),
            top_marker: None,
            rotation_ambiguities: Vec::new(),
            pre_action_poses: Vec::new(),
        }
    }

    pub fn type_id(mut self, type_id: u32) -> Self {
        self.type_id = type_id;
        self
    }

    pub fn pose(mut self, pose: Transform) -> Self {
        self.pose = pose;
        self
    }

    pub fn height(mut self, height_mm: f32) -> Self {
        self.height_mm = height_mm;
        self
    }

    pub fn not_carryable(mut self) -> Self {
        self.is_carryable_height = false;
        self
    }

    pub fn marker(mut self, code: MarkerCode, observed: bool) -> Self {
        self.markers.push((code, observed));
        self
    }

    pub fn top_marker(mut self, code: MarkerCode) -> Self {
        self.top_marker = Some(code);
        self
    }

    pub fn ambiguities(mut self, ambiguities: Vec<UnitQuaternion<f32>>) -> Self {
        self.rotation_ambiguities = ambiguities;
        self
    }

    pub fn docking_pose(mut self, pose: Transform) -> Self {
        self.pre_action_poses.push((Interaction::Docking, pose, None));
        self
    }

    pub fn docking_pose_with_marker(mut self, pose: Transform, marker: MarkerCode) -> Self {
        self.pre_action_poses
            .push((Interaction::Docking, pose, Some(marker)));
        self
    }

    pub fn place_relative_pose_with_marker(mut self, pose: Transform, marker: MarkerCode) -> Self {
        self.pre_action_poses
            .push((Interaction::PlaceRelative, pose, Some(marker)));
        self
    }

    pub fn rolling_pose_with_marker(mut self, pose: Transform, marker: MarkerCode) -> Self {
        self.pre_action_poses
            .push((Interaction::Rolling, pose, Some(marker)));
        self
    }

    /// Materialize the object: pose nodes go into the rig's tree, the
    /// record into the mock world. Candidate poses are given in the
    /// robot's origin frame.
    pub fn build(self, rig: &mut TestRig) -> ObjectId {
        let origin = rig
            .ctx
            .poses
            .origin_of(rig.ctx.robot.pose)
            .expect("rig robot pose has an origin");
        let object_node = rig.ctx.poses.add_pose(origin, self.pose);
        let markers = self
            .markers
            .into_iter()
            .map(|(code, observed)| {
                let node = rig.ctx.poses.add_pose(object_node, Transform::identity());
                (code, node, observed)
            })
            .collect();
        let pre_action_poses = self
            .pre_action_poses
            .into_iter()
            .map(|(kind, pose, marker)| {
                let node = rig.ctx.poses.add_pose(origin, pose);
                (kind, node, marker)
            })
            .collect();

        rig.world_state.lock().unwrap().objects.insert(
            self.id,
            MockObject {
                pose: object_node,
                type_id: self.type_id,
                height_mm: self.height_mm,
                is_carryable_height: self.is_carryable_height,
                markers,
                top_marker: self.top_marker,
                rotation_ambiguities: self.rotation_ambiguities,
                is_moving: false,
                last_moved_at_s: 0.0,
                pre_action_poses,
            },
        );
        self.id
    }
}

// =============================================================================
// Mock actuator
// =============================================================================

#[derive(Default)]
pub struct ActuatorState {
    pub turn_commands: u32,
    pub head_commands: u32,
    pub lift_commands: u32,
    pub dock_commands: Vec<DockCommand>,
    pub dock_aborted: bool,
    pub stop_all_calls: u32,
    pub played_animations: Vec<AnimTrigger>,
    pub cancelled_animations: Vec<AnimTag>,

    pub picking_or_placing: bool,
    pub last_pick_or_place_succeeded: bool,
    pub moving: bool,
    pub head_moving: bool,
    pub lift_moving: bool,
    pub wheels_moving: bool,

    pub fail_sends: bool,
    pub auto_ack: bool,
    pub hold_animations: bool,
    pub last_motor_id: u32,
    next_anim_tag: u32,
    playing_animations: std::collections::HashSet<AnimTag>,
    pending_reports: Vec<RobotEvent>,
    channel: Option<EventChannel>,
}

#[derive(Clone)]
pub struct MockActuator {
    state: Arc<Mutex<ActuatorState>>,
}

impl MockActuator {
    fn next_motor(state: &mut ActuatorState) -> Result<MotorActionId, SendError> {
        if state.fail_sends {
            return Err(SendError);
        }
        state.last_motor_id += 1;
        let id = MotorActionId(state.last_motor_id);
        if state.auto_ack {
            if let Some(channel) = &state.channel {
                channel.publish(RobotEvent::MotorAck { motor_action: id });
            }
        }
        Ok(id)
    }
}

impl Actuator for MockActuator {
    fn turn_in_place(
        &mut self,
        _target_angle: Radians,
        _max_speed_rad_per_s: f32,
        _accel_rad_per_s2: f32,
        _tolerance: Radians,
        _num_half_revolutions: u16,
        _is_absolute: bool,
    ) -> Result<MotorActionId, SendError> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_motor(&mut state)?;
        state.turn_commands += 1;
        Ok(id)
    }

    fn move_head_to_angle(&mut self, _angle: Radians) -> Result<MotorActionId, SendError> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_motor(&mut state)?;
        state.head_commands += 1;
        Ok(id)
    }

    fn move_lift_to_height(&mut self, _height_mm: f32) -> Result<MotorActionId, SendError> {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_motor(&mut state)?;
        state.lift_commands += 1;
        Ok(id)
    }

    fn dock_with_object(&mut self, command: &DockCommand) -> Result<(), SendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(SendError);
        }
        state.dock_commands.push(command.clone());
        Ok(())
    }

    fn abort_docking(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.dock_aborted = true;
        state.picking_or_placing = false;
    }

    fn stop_all_motors(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.stop_all_calls += 1;
        state.moving = false;
        state.head_moving = false;
        state.lift_moving = false;
        state.wheels_moving = false;
    }

    fn play_animation(&mut self, trigger: AnimTrigger) -> Result<AnimTag, SendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(SendError);
        }
        state.next_anim_tag += 1;
        let tag = AnimTag(state.next_anim_tag);
        state.played_animations.push(trigger);
        if state.hold_animations {
            state.playing_animations.insert(tag);
        }
        Ok(tag)
    }

    fn cancel_animation(&mut self, anim: AnimTag) {
        let mut state = self.state.lock().unwrap();
        state.cancelled_animations.push(anim);
        state.playing_animations.remove(&anim);
    }

    fn is_picking_or_placing(&self) -> bool {
        self.state.lock().unwrap().picking_or_placing
    }

    fn last_pick_or_place_succeeded(&self) -> bool {
        self.state.lock().unwrap().last_pick_or_place_succeeded
    }

    fn is_moving(&self) -> bool {
        self.state.lock().unwrap().moving
    }

    fn is_head_moving(&self) -> bool {
        self.state.lock().unwrap().head_moving
    }

    fn is_lift_moving(&self) -> bool {
        self.state.lock().unwrap().lift_moving
    }

    fn are_wheels_moving(&self) -> bool {
        self.state.lock().unwrap().wheels_moving
    }

    fn is_animation_playing(&self, anim: AnimTag) -> bool {
        self.state.lock().unwrap().playing_animations.contains(&anim)
    }

    fn drain_reports(&mut self) -> Vec<RobotEvent> {
        std::mem::take(&mut self.state.lock().unwrap().pending_reports)
    }
}

// =============================================================================
// Mock planner
// =============================================================================

#[derive(Default)]
pub struct PlannerState {
    pub status: Option<DriveStatus>,
    pub selected_goal: usize,
    pub goals: Vec<Transform>,
    pub start_calls: u32,
    pub aborted: bool,
    pub active: bool,
    pub last_path_delivered: bool,
    pub fail_start: bool,
}

#[derive(Clone)]
pub struct MockPlanner {
    state: Arc<Mutex<PlannerState>>,
}

impl Planner for MockPlanner {
    fn start_driving_to_poses(&mut self, goals: &[Transform]) -> Result<(), SendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_start {
            return Err(SendError);
        }
        state.goals = goals.to_vec();
        state.start_calls += 1;
        state.active = true;
        if state.status.is_none() {
            state.status = Some(DriveStatus::ComputingPath);
        }
        Ok(())
    }

    fn status(&self) -> DriveStatus {
        self.state.lock().unwrap().status.unwrap_or(DriveStatus::Idle)
    }

    fn selected_goal_index(&self) -> usize {
        self.state.lock().unwrap().selected_goal
    }

    fn abort(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.aborted = true;
        state.active = false;
        state.status = Some(DriveStatus::Idle);
    }

    fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    fn last_path_fully_delivered(&self) -> bool {
        self.state.lock().unwrap().last_path_delivered
    }
}

// =============================================================================
// Test rig
// =============================================================================

/// Assembles a [`RobotCtx`] around the mocks and exposes shortcuts for
/// manipulating mock state between ticks.
pub struct TestRig {
    pub ctx: RobotCtx,
    world_state: Arc<Mutex<WorldState>>,
    actuator_state: Arc<Mutex<ActuatorState>>,
    planner_state: Arc<Mutex<PlannerState>>,
}

/// Engine time advanced per simulated tick.
pub const TICK_S: f32 = 0.1;

impl TestRig {
    pub fn new() -> Self {
        Self::with_config(FrameworkConfig::default())
    }

    pub fn with_config(config: FrameworkConfig) -> Self {
        let world_state = Arc::new(Mutex::new(WorldState::default()));
        let actuator_state = Arc::new(Mutex::new(ActuatorState::default()));
        let planner_state = Arc::new(Mutex::new(PlannerState::default()));

        let ctx = RobotCtx::new(
            config,
            Box::new(MockWorld {
                state: Arc::clone(&world_state),
            }),
            Box::new(MockActuator {
                state: Arc::clone(&actuator_state),
            }),
            Box::new(MockPlanner {
                state: Arc::clone(&planner_state),
            }),
        );
        actuator_state.lock().unwrap().channel = Some(ctx.events.clone());

        Self {
            ctx,
            world_state,
            actuator_state,
            planner_state,
        }
    }

    /// Advance engine time by one simulated tick.
    pub fn tick(&mut self) {
        self.ctx.advance_time(TICK_S);
    }

    pub fn advance(&mut self, dt_s: f32) {
        self.ctx.advance_time(dt_s);
    }

    pub fn set_robot_pose(&mut self, pose: Transform) {
        self.ctx
            .poses
            .set_transform(self.ctx.robot.pose, pose)
            .expect("robot pose node exists");
    }

    // ---- actuator shortcuts ----

    pub fn actuator(&self) -> MutexGuard<'_, ActuatorState> {
        self.actuator_state.lock().unwrap()
    }

    pub fn set_wheels_moving(&mut self, moving: bool) {
        let mut state = self.actuator_state.lock().unwrap();
        state.wheels_moving = moving;
        state.moving = moving;
    }

    pub fn set_head_moving(&mut self, moving: bool) {
        self.actuator_state.lock().unwrap().head_moving = moving;
    }

    pub fn set_lift_moving(&mut self, moving: bool) {
        self.actuator_state.lock().unwrap().lift_moving = moving;
    }

    pub fn set_picking_or_placing(&mut self, picking: bool) {
        self.actuator_state.lock().unwrap().picking_or_placing = picking;
    }

    pub fn set_last_pick_or_place_succeeded(&mut self, succeeded: bool) {
        self.actuator_state.lock().unwrap().last_pick_or_place_succeeded = succeeded;
    }

    pub fn fail_sends(&mut self, fail: bool) {
        self.actuator_state.lock().unwrap().fail_sends = fail;
    }

    pub fn set_auto_ack(&mut self, auto: bool) {
        self.actuator_state.lock().unwrap().auto_ack = auto;
    }

    pub fn hold_animations(&mut self, hold: bool) {
        self.actuator_state.lock().unwrap().hold_animations = hold;
    }

    pub fn finish_all_animations(&mut self) {
        self.actuator_state.lock().unwrap().playing_animations.clear();
    }

    /// Acknowledge the most recently issued motor command.
    pub fn ack_last_motor_command(&mut self) {
        let id = self.actuator_state.lock().unwrap().last_motor_id;
        self.ctx.events.publish(RobotEvent::MotorAck {
            motor_action: MotorActionId(id),
        });
    }

    pub fn publish_lift_load(&mut self, has_load: bool) {
        self.ctx.events.publish(RobotEvent::LiftLoad { has_load });
    }

    pub fn push_report(&mut self, event: RobotEvent) {
        self.actuator_state.lock().unwrap().pending_reports.push(event);
    }

    // ---- world shortcuts ----

    pub fn world(&self) -> MutexGuard<'_, WorldState> {
        self.world_state.lock().unwrap()
    }

    pub fn move_object(&mut self, id: ObjectId, pose: Transform) {
        let node = self
            .world_state
            .lock()
            .unwrap()
            .objects
            .get(&id)
            .map(|o| o.pose)
            .expect("object exists");
        self.ctx.poses.set_transform(node, pose).unwrap();
    }

    pub fn set_object_observed(&mut self, id: ObjectId, observed: bool) {
        let mut state = self.world_state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&id) {
            for marker in &mut object.markers {
                marker.2 = observed;
            }
        }
    }

    pub fn set_marker_observed(&mut self, id: ObjectId, code: MarkerCode, observed: bool) {
        let mut state = self.world_state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&id) {
            for marker in &mut object.markers {
                if marker.0 == code {
                    marker.2 = observed;
                }
            }
        }
    }

    pub fn set_object_last_moved(&mut self, id: ObjectId, time_s: f32) {
        let mut state = self.world_state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&id) {
            object.last_moved_at_s = time_s;
        }
    }

    pub fn set_object_moving(&mut self, id: ObjectId, moving: bool) {
        let mut state = self.world_state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&id) {
            object.is_moving = moving;
        }
    }

    pub fn remove_object(&mut self, id: ObjectId) {
        self.world_state.lock().unwrap().objects.remove(&id);
    }

    pub fn world_deselected(&self) -> bool {
        self.world_state.lock().unwrap().deselected
    }

    // ---- planner shortcuts ----

    pub fn planner(&self) -> MutexGuard<'_, PlannerState> {
        self.planner_state.lock().unwrap()
    }

    pub fn set_drive_status(&mut self, status: DriveStatus) {
        self.planner_state.lock().unwrap().status = Some(status);
    }

    pub fn set_selected_goal(&mut self, index: usize) {
        self.planner_state.lock().unwrap().selected_goal = index;
    }

    pub fn set_last_path_delivered(&mut self, delivered: bool) {
        self.planner_state.lock().unwrap().last_path_delivered = delivered;
    }

    pub fn fail_planner_start(&mut self, fail: bool) {
        self.planner_state.lock().unwrap().fail_start = fail;
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Counting action
// =============================================================================

/// Call counters observable from outside a boxed action.
#[derive(Default)]
pub struct Counters {
    pub init_calls: AtomicU32,
    pub poll_calls: AtomicU32,
    pub cancel_calls: AtomicU32,
}

/// Scripted action that succeeds (or fails) after a fixed number of polls
/// while counting every lifecycle call.
pub struct CountingAction {
    name: String,
    tracks: Tracks,
    polls_until_done: u32,
    polls_done: u32,
    terminal: ActionResult,
    counters: Arc<Counters>,
}

impl CountingAction {
    pub fn succeeding_after(polls: u32) -> (Self, Arc<Counters>) {
        Self::named("Counting", polls, None)
    }

    pub fn failing_after(polls: u32, failure: ActionResult) -> (Self, Arc<Counters>) {
        Self::named("Counting", polls, Some(failure))
    }

    pub fn with_tracks(tracks: Tracks, polls: u32) -> (Self, Arc<Counters>) {
        let (mut action, counters) = Self::named("Counting", polls, None);
        action.tracks = tracks;
        (action, counters)
    }

    pub fn named(
        name: impl Into<String>,
        polls: u32,
        failure: Option<ActionResult>,
    ) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        (
            Self {
                name: name.into(),
                tracks: Tracks::NONE,
                polls_until_done: polls,
                polls_done: 0,
                terminal: failure.unwrap_or(ActionResult::Success),
                counters: Arc::clone(&counters),
            },
            counters,
        )
    }
}

impl Action for CountingAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn tracks(&self) -> Tracks {
        self.tracks
    }

    fn init(&mut self, _ctx: &mut RobotCtx) -> ActionResult {
        self.counters.init_calls.fetch_add(1, Ordering::SeqCst);
        ActionResult::Running
    }

    fn check_if_done(&mut self, _ctx: &mut RobotCtx) -> ActionResult {
        self.counters.poll_calls.fetch_add(1, Ordering::SeqCst);
        self.polls_done += 1;
        if self.polls_done >= self.polls_until_done {
            self.terminal
        } else {
            ActionResult::Running
        }
    }

    fn on_cancel(&mut self, _ctx: &mut RobotCtx) {
        self.counters.cancel_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reset(&mut self, _ctx: &mut RobotCtx) {
        self.polls_done = 0;
    }
}
