//! Basic motion actions: point turns, head/lift moves, waits, and the
//! visual verification actions other actions compose.

use tracing::{debug, info, warn};

use axle_core::angle::{wrap, Radians};
use axle_core::config::FrameworkConfig;
use axle_core::event::{EventKind, RobotEvent, Subscription};
use axle_core::pose::{z_angle, Transform};
use axle_core::result::ActionResult;
use axle_core::types::{MarkerCode, MotorActionId, ObjectId, Tracks};

use crate::context::RobotCtx;
use crate::runner::{Action, ActionRunner};

/// Largest relative turn accepted, in full revolutions.
const MAX_RELATIVE_TURN_REVS: f32 = 2.0;

/// Consecutive stalled polls tolerated before a turn fails for lack of
/// progress.
const MAX_STALL_POLLS: u32 = 30;

/// Stall budget while held in a palm, where tread slip is routine. Must
/// stay below the movement layer's unexpected-movement threshold or the
/// stall detector never fires before the movement layer gives up.
const HELD_IN_PALM_STALL_BUDGET: u32 = 11;
const UNEXPECTED_MOVEMENT_THRESHOLD: u32 = 12;
const _: () = assert!(HELD_IN_PALM_STALL_BUDGET < UNEXPECTED_MOVEMENT_THRESHOLD);

/// Window given to visual verification before it fails.
const VISUAL_VERIFY_WINDOW_S: f32 = 1.5;

/// Heading error under which a turn-towards is skipped entirely.
const FACING_TOLERANCE_RAD: f32 = 0.09; // ~5 degrees

// =============================================================================
// Turn in place
// =============================================================================

/// Closed-form duration of a point turn: trapezoidal profile when the
/// distance is long enough to reach max speed (`|d*a| >= v^2`), otherwise
/// triangular. Used to size timeouts, never to command the motor.
pub fn turn_profile_duration(distance_rad: f32, max_speed: f32, accel: f32) -> f32 {
    let d = distance_rad.abs();
    let v = max_speed.abs();
    let a = accel.abs();
    if v <= f32::EPSILON || a <= f32::EPSILON {
        return 0.0;
    }
    if d * a >= v * v {
        // t_total = t_accel + t_decel + cruise = v/a + d/v
        v / a + d / v
    } else {
        // Never reaches max speed: d/2 = (a/2)(t/2)^2  =>  t = sqrt(4d/a)
        (4.0 * d / a).sqrt()
    }
}

/// Rotate the body in place to an absolute heading or by a relative angle.
pub struct TurnInPlaceAction {
    requested_angle_rad: f32,
    is_absolute: bool,
    max_speed: Option<f32>,
    accel: Option<f32>,
    tolerance: Option<Radians>,
    computed_timeout_s: Option<f32>,

    target_angle: Radians,
    expected_dist_rad: f32,
    traversed_rad: f32,
    previous_angle: Radians,
    motor_id: Option<MotorActionId>,
    acked: bool,
    ack_sub: Option<Subscription>,
    prev_pose_frame_id: u32,
    relocalized: u32,
    turn_started: bool,
    stall_polls: u32,
    stall_budget: u32,
}

impl TurnInPlaceAction {
    pub fn absolute(target: Radians) -> Self {
        Self::new(target.value(), true)
    }

    pub fn relative(angle_rad: f32) -> Self {
        Self::new(angle_rad, false)
    }

    fn new(angle_rad: f32, is_absolute: bool) -> Self {
        Self {
            requested_angle_rad: angle_rad,
            is_absolute,
            max_speed: None,
            accel: None,
            tolerance: None,
            computed_timeout_s: None,
            target_angle: Radians::new(0.0),
            expected_dist_rad: 0.0,
            traversed_rad: 0.0,
            previous_angle: Radians::new(0.0),
            motor_id: None,
            acked: false,
            ack_sub: None,
            prev_pose_frame_id: 0,
            relocalized: 0,
            turn_started: false,
            stall_polls: 0,
            stall_budget: MAX_STALL_POLLS,
        }
    }

    pub fn set_max_speed(&mut self, speed_rad_per_s: f32) {
        self.max_speed = Some(speed_rad_per_s);
    }

    pub fn set_accel(&mut self, accel_rad_per_s2: f32) {
        self.accel = Some(accel_rad_per_s2);
    }

    pub fn set_tolerance(&mut self, tolerance: Radians) {
        self.tolerance = Some(tolerance);
    }

    fn current_heading(&self, ctx: &RobotCtx) -> Result<Radians, ActionResult> {
        let origin = ctx
            .poses
            .origin_of(ctx.robot.pose)
            .map_err(|_| ActionResult::BadPose)?;
        let t = ctx
            .poses
            .with_respect_to(ctx.robot.pose, origin)
            .map_err(|_| ActionResult::BadPose)?;
        Ok(Radians::new(z_angle(&t.rotation)))
    }

    fn effective_tolerance(&self, ctx: &RobotCtx) -> Radians {
        self.tolerance
            .unwrap_or(Radians::new(ctx.config.turn.angle_tolerance_rad))
    }

    fn body_in_position(&self, current: Radians, tolerance: Radians, ctx: &RobotCtx) -> bool {
        let near = if self.is_absolute {
            current.is_near(self.target_angle, tolerance.value())
        } else {
            let remaining = (self.expected_dist_rad - self.traversed_rad).abs();
            // Only compare headings once within one revolution of the goal
            // (relative turns may exceed 360 degrees).
            if remaining < std::f32::consts::PI {
                current.is_near(self.target_angle, tolerance.value() + 1e-4)
                    || (self.relocalized != 0 && remaining < tolerance.value().abs())
            } else {
                false
            }
        };
        near && !ctx.actuator.are_wheels_moving()
    }
}

impl Action for TurnInPlaceAction {
    fn name(&self) -> &str {
        "TurnInPlace"
    }

    fn tracks(&self) -> Tracks {
        Tracks::BODY
    }

    fn timeout_s(&self, config: &FrameworkConfig) -> f32 {
        self.computed_timeout_s
            .unwrap_or(config.action.default_timeout_s)
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if ctx.robot.on_charger {
            return ActionResult::ShouldntDriveOnCharger;
        }

        let current = match self.current_heading(ctx) {
            Ok(angle) => angle,
            Err(result) => return result,
        };

        if self.is_absolute {
            self.target_angle = Radians::new(self.requested_angle_rad);
            self.expected_dist_rad = (self.target_angle - current).value();
        } else {
            if self.requested_angle_rad.abs()
                > 2.0 * std::f32::consts::PI * MAX_RELATIVE_TURN_REVS
            {
                warn!(
                    angle_deg = self.requested_angle_rad.to_degrees(),
                    "Relative turn angle too large"
                );
                return ActionResult::BadPose;
            }
            // On a retry, only the un-traversed remainder is re-commanded.
            self.requested_angle_rad -= self.traversed_rad;
            self.target_angle = Radians::new(current.value() + self.requested_angle_rad);
            self.expected_dist_rad = self.requested_angle_rad;
        }

        let mut max_speed = self
            .max_speed
            .unwrap_or(ctx.config.turn.max_speed_rad_per_s);
        let accel = self.accel.unwrap_or(ctx.config.turn.accel_rad_per_s2);
        if !self.is_absolute {
            // The sign of the speed tells the actuator which way to turn.
            max_speed = max_speed.copysign(self.requested_angle_rad);
        }

        let mut tolerance = self.effective_tolerance(ctx);
        self.stall_budget = MAX_STALL_POLLS;
        if ctx.robot.held_in_palm {
            // Treads slip constantly in a palm; relax the tolerance and
            // tighten the stall budget.
            tolerance = Radians::new(ctx.config.turn.held_in_palm_tolerance_rad);
            self.tolerance = Some(tolerance);
            self.stall_budget = HELD_IN_PALM_STALL_BUDGET;
        }

        let profile = turn_profile_duration(self.expected_dist_rad, max_speed, accel);
        self.computed_timeout_s =
            Some((ctx.config.turn.timeout_factor * profile).max(ctx.config.turn.min_timeout_s));

        self.traversed_rad = 0.0;
        self.previous_angle = current;
        self.prev_pose_frame_id = ctx.robot.pose_frame_id;
        self.turn_started = false;
        self.stall_polls = 0;
        self.acked = false;

        if self.body_in_position(current, tolerance, ctx) {
            debug!(target_deg = self.target_angle.to_degrees(), "Already at target angle");
            return ActionResult::Success;
        }

        self.ack_sub = Some(ctx.events.subscribe(EventKind::MotorAck));
        let num_half_revs = if self.is_absolute {
            0
        } else {
            (self.expected_dist_rad.abs() / std::f32::consts::PI).floor() as u16
        };
        match ctx.actuator.turn_in_place(
            self.target_angle,
            max_speed,
            accel,
            tolerance,
            num_half_revs,
            self.is_absolute,
        ) {
            Ok(motor_id) => {
                self.motor_id = Some(motor_id);
                ActionResult::Running
            }
            Err(_) => ActionResult::SendMessageFailed,
        }
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        // Nothing counts until the actuator acknowledges the command.
        if !self.acked {
            let motor_id = self.motor_id;
            if let Some(sub) = &self.ack_sub {
                self.acked = sub.drain_any(|e| {
                    matches!(e, RobotEvent::MotorAck { motor_action }
                             if Some(*motor_action) == motor_id)
                });
            }
            if !self.acked {
                return ActionResult::Running;
            }
            info!(?motor_id, "Turn command acknowledged");
        }

        // A relocalization jumps the pose; switch to traversed-distance
        // bookkeeping from the new frame.
        if self.prev_pose_frame_id != ctx.robot.pose_frame_id {
            self.relocalized += 1;
            self.prev_pose_frame_id = ctx.robot.pose_frame_id;
            if let Ok(current) = self.current_heading(ctx) {
                self.previous_angle = current;
            }
        }

        let current = match self.current_heading(ctx) {
            Ok(angle) => angle,
            Err(result) => return result,
        };
        self.traversed_rad += wrap(current.value() - self.previous_angle.value());
        self.previous_angle = current;

        if ctx.actuator.are_wheels_moving() {
            self.turn_started = true;
            self.stall_polls = 0;
        }

        let tolerance = self.effective_tolerance(ctx);
        if self.body_in_position(current, tolerance, ctx) {
            info!(
                current_deg = current.to_degrees(),
                target_deg = self.target_angle.to_degrees(),
                traversed_deg = self.traversed_rad.to_degrees(),
                "Turn complete"
            );
            return ActionResult::Success;
        }

        if self.turn_started && !ctx.actuator.are_wheels_moving() {
            self.stall_polls += 1;
            if self.stall_polls > self.stall_budget {
                warn!(stall_polls = self.stall_polls, "Turn stopped short of target");
                return ActionResult::MotorStoppedMakingProgress;
            }
        }

        ActionResult::Running
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        ctx.actuator.stop_all_motors();
        self.ack_sub = None;
    }

    fn on_reset(&mut self, _ctx: &mut RobotCtx) {
        self.ack_sub = None;
        self.motor_id = None;
        self.acked = false;
        self.turn_started = false;
        self.stall_polls = 0;
    }
}

// =============================================================================
// Head / lift moves
// =============================================================================

/// Move the head to an angle and wait for it to settle.
pub struct MoveHeadToAngleAction {
    angle: Radians,
    motor_id: Option<MotorActionId>,
    acked: bool,
    ack_sub: Option<Subscription>,
}

impl MoveHeadToAngleAction {
    pub fn new(angle: Radians) -> Self {
        Self {
            angle,
            motor_id: None,
            acked: false,
            ack_sub: None,
        }
    }
}

impl Action for MoveHeadToAngleAction {
    fn name(&self) -> &str {
        "MoveHeadToAngle"
    }

    fn tracks(&self) -> Tracks {
        Tracks::HEAD
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        self.ack_sub = Some(ctx.events.subscribe(EventKind::MotorAck));
        match ctx.actuator.move_head_to_angle(self.angle) {
            Ok(motor_id) => {
                self.motor_id = Some(motor_id);
                ActionResult::Running
            }
            Err(_) => ActionResult::SendMessageFailed,
        }
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if !self.acked {
            let motor_id = self.motor_id;
            if let Some(sub) = &self.ack_sub {
                self.acked = sub.drain_any(|e| {
                    matches!(e, RobotEvent::MotorAck { motor_action }
                             if Some(*motor_action) == motor_id)
                });
            }
            if !self.acked {
                return ActionResult::Running;
            }
        }
        if ctx.actuator.is_head_moving() {
            ActionResult::Running
        } else {
            ActionResult::Success
        }
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        ctx.actuator.stop_all_motors();
        self.ack_sub = None;
    }
}

/// Move the lift to a height and wait for it to settle.
pub struct MoveLiftToHeightAction {
    height_mm: f32,
    motor_id: Option<MotorActionId>,
    acked: bool,
    ack_sub: Option<Subscription>,
}

impl MoveLiftToHeightAction {
    pub fn new(height_mm: f32) -> Self {
        Self {
            height_mm,
            motor_id: None,
            acked: false,
            ack_sub: None,
        }
    }
}

impl Action for MoveLiftToHeightAction {
    fn name(&self) -> &str {
        "MoveLiftToHeight"
    }

    fn tracks(&self) -> Tracks {
        Tracks::LIFT
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        self.ack_sub = Some(ctx.events.subscribe(EventKind::MotorAck));
        match ctx.actuator.move_lift_to_height(self.height_mm) {
            Ok(motor_id) => {
                self.motor_id = Some(motor_id);
                ActionResult::Running
            }
            Err(_) => ActionResult::SendMessageFailed,
        }
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if !self.acked {
            let motor_id = self.motor_id;
            if let Some(sub) = &self.ack_sub {
                self.acked = sub.drain_any(|e| {
                    matches!(e, RobotEvent::MotorAck { motor_action }
                             if Some(*motor_action) == motor_id)
                });
            }
            if !self.acked {
                return ActionResult::Running;
            }
        }
        if ctx.actuator.is_lift_moving() {
            ActionResult::Running
        } else {
            ActionResult::Success
        }
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        ctx.actuator.stop_all_motors();
        self.ack_sub = None;
    }
}

// =============================================================================
// Wait
// =============================================================================

/// Do nothing for a fixed duration.
pub struct WaitAction {
    duration_s: f32,
    until_s: f32,
}

impl WaitAction {
    pub fn new(duration_s: f32) -> Self {
        Self {
            duration_s,
            until_s: -1.0,
        }
    }
}

impl Action for WaitAction {
    fn name(&self) -> &str {
        "Wait"
    }

    fn tracks(&self) -> Tracks {
        Tracks::NONE
    }

    fn timeout_s(&self, _config: &FrameworkConfig) -> f32 {
        self.duration_s + 5.0
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if self.duration_s <= 0.0 {
            return ActionResult::Success;
        }
        self.until_s = ctx.time_s + self.duration_s;
        ActionResult::Running
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if ctx.time_s >= self.until_s {
            ActionResult::Success
        } else {
            ActionResult::Running
        }
    }
}

// =============================================================================
// Visual verification
// =============================================================================

/// Turn to face an object, then (optionally) confirm a marker on it is
/// currently observed.
pub struct TurnTowardsObjectAction {
    object: ObjectId,
    /// `None` accepts any observed marker on the object.
    marker: Option<MarkerCode>,
    verify_when_done: bool,
    turn: Option<ActionRunner>,
    verify_deadline_s: f32,
}

impl TurnTowardsObjectAction {
    pub fn new(object: ObjectId, marker: Option<MarkerCode>, verify_when_done: bool) -> Self {
        Self {
            object,
            marker,
            verify_when_done,
            turn: None,
            verify_deadline_s: -1.0,
        }
    }

    fn marker_observed(&self, ctx: &RobotCtx) -> Option<bool> {
        let snapshot = ctx.world.object(self.object)?;
        Some(snapshot.markers.iter().any(|m| {
            m.observed
                && match self.marker {
                    Some(code) => m.code == code,
                    None => true,
                }
        }))
    }
}

impl Action for TurnTowardsObjectAction {
    fn name(&self) -> &str {
        "TurnTowardsObject"
    }

    fn tracks(&self) -> Tracks {
        Tracks::HEAD | Tracks::BODY
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let snapshot = match ctx.world.object(self.object) {
            Some(s) => s,
            None => return ActionResult::BadObject,
        };

        let rel = match ctx.poses.with_respect_to(snapshot.pose, ctx.robot.pose) {
            Ok(t) => t,
            Err(_) => return ActionResult::BadPose,
        };
        let bearing = rel.translation.y.atan2(rel.translation.x);

        if bearing.abs() > FACING_TOLERANCE_RAD {
            let mut runner = ActionRunner::new(
                ctx,
                Box::new(TurnInPlaceAction::relative(bearing)),
            );
            runner.suppress_track_locking(true);
            // Prime the turn so its command goes out this tick.
            let primed = runner.update(ctx);
            if primed.is_terminal() && primed != ActionResult::Success {
                return primed;
            }
            if primed == ActionResult::Running {
                self.turn = Some(runner);
            }
        }
        ActionResult::Running
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if let Some(turn) = &mut self.turn {
            let result = turn.update(ctx);
            if result == ActionResult::Running {
                return ActionResult::Running;
            }
            if result != ActionResult::Success {
                return result;
            }
            self.turn = None;
        }

        if !self.verify_when_done {
            return ActionResult::Success;
        }

        match self.marker_observed(ctx) {
            None => ActionResult::BadObject,
            Some(true) => ActionResult::Success,
            Some(false) => {
                if self.verify_deadline_s < 0.0 {
                    self.verify_deadline_s = ctx.time_s + VISUAL_VERIFY_WINDOW_S;
                }
                if ctx.time_s >= self.verify_deadline_s {
                    debug!(object = %self.object, "Marker not observed after turn");
                    ActionResult::VisualObservationFailed
                } else {
                    ActionResult::Running
                }
            }
        }
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        if let Some(turn) = &mut self.turn {
            turn.cancel(ctx);
        }
    }
}

/// Confirm that a specific marker (or any marker) on an object is
/// currently observed, without moving.
pub struct VisuallyVerifyObjectAction {
    object: ObjectId,
    marker: Option<MarkerCode>,
    deadline_s: f32,
}

impl VisuallyVerifyObjectAction {
    pub fn new(object: ObjectId, marker: Option<MarkerCode>) -> Self {
        Self {
            object,
            marker,
            deadline_s: -1.0,
        }
    }
}

impl Action for VisuallyVerifyObjectAction {
    fn name(&self) -> &str {
        "VisuallyVerifyObject"
    }

    fn tracks(&self) -> Tracks {
        Tracks::NONE
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if ctx.world.object(self.object).is_none() {
            return ActionResult::BadObject;
        }
        self.deadline_s = ctx.time_s + VISUAL_VERIFY_WINDOW_S;
        ActionResult::Running
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let snapshot = match ctx.world.object(self.object) {
            Some(s) => s,
            None => return ActionResult::BadObject,
        };
        let observed = snapshot.markers.iter().any(|m| {
            m.observed
                && match self.marker {
                    Some(code) => m.code == code,
                    None => true,
                }
        });
        if observed {
            ActionResult::Success
        } else if ctx.time_s >= self.deadline_s {
            ActionResult::VisualObservationFailed
        } else {
            ActionResult::Running
        }
    }
}

/// Confirm that no object of the exemplar's type is observed near a pose
/// (e.g. the spot a block was just picked up from).
pub struct VisuallyVerifyNoObjectAtPoseAction {
    exemplar: ObjectId,
    pose: Transform,
    dist_thresh_mm: f32,
    deadline_s: f32,
}

impl VisuallyVerifyNoObjectAtPoseAction {
    pub fn new(exemplar: ObjectId, pose: Transform, dist_thresh_mm: f32) -> Self {
        Self {
            exemplar,
            pose,
            dist_thresh_mm,
            deadline_s: -1.0,
        }
    }
}

impl Action for VisuallyVerifyNoObjectAtPoseAction {
    fn name(&self) -> &str {
        "VisuallyVerifyNoObjectAtPose"
    }

    fn tracks(&self) -> Tracks {
        Tracks::NONE
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        self.deadline_s = ctx.time_s + VISUAL_VERIFY_WINDOW_S;
        ActionResult::Running
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if let Some(found) = ctx.world.observed_object_near(
            &ctx.poses,
            self.exemplar,
            &self.pose,
            self.dist_thresh_mm,
        ) {
            debug!(%found, "Object still observed where it should not be");
            return ActionResult::VisualObservationFailed;
        }
        if ctx.time_s >= self.deadline_s {
            ActionResult::Success
        } else {
            ActionResult::Running
        }
    }
}
