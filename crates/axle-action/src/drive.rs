//! Driving actions: follow a planned path to one of several goal poses,
//! or to an object's pre-action pose.

use tracing::{debug, info, warn};

use axle_core::angle::Radians;
use axle_core::pose::{heading, planar_translation, PoseId, Transform};
use axle_core::result::ActionResult;
use axle_core::types::{AnimTag, ObjectId, Tracks};

use crate::basic::TurnTowardsObjectAction;
use crate::compound::SequentialAction;
use crate::context::{AnimTrigger, DriveStatus, Interaction, RobotCtx};
use crate::resolver::{self, ResolverOptions};
use crate::runner::{Action, ActionRunner};

// =============================================================================
// DriveToPoseAction
// =============================================================================

/// Drive to one of several candidate goal poses. The external planner
/// picks among the goals and reports which one it selected; this action
/// supervises the drive and checks the final pose.
pub struct DriveToPoseAction {
    goal_ids: Vec<PoseId>,
    goals_in_origin: Vec<Transform>,
    /// Object pose the goals were generated from, when they came from a
    /// pre-action pose query. The success threshold is recomputed from the
    /// object's *current* pose at completion time.
    object_pose_source: Option<PoseId>,
    dist_threshold_mm: Option<(f32, f32)>,
    angle_threshold: Option<Radians>,
    planning_abort_at_s: f32,
    path_started: bool,
    end_anim: Option<AnimTag>,
    pending_result: Option<ActionResult>,
}

impl DriveToPoseAction {
    pub fn new(goals: Vec<PoseId>) -> Self {
        Self {
            goal_ids: goals,
            goals_in_origin: Vec::new(),
            object_pose_source: None,
            dist_threshold_mm: None,
            angle_threshold: None,
            planning_abort_at_s: -1.0,
            path_started: false,
            end_anim: None,
            pending_result: None,
        }
    }

    /// Record that the goals were generated from this object's pose.
    pub fn set_object_pose_source(&mut self, object_pose: PoseId) {
        self.object_pose_source = Some(object_pose);
    }

    pub fn set_goal_thresholds(&mut self, dist_mm: (f32, f32), angle: Radians) {
        self.dist_threshold_mm = Some(dist_mm);
        self.angle_threshold = Some(angle);
    }

    fn thresholds(&self, ctx: &RobotCtx, selected_goal: &Transform) -> ((f32, f32), Radians) {
        let angle = self
            .angle_threshold
            .unwrap_or(Radians::new(ctx.config.drive.goal_angle_threshold_rad));
        let default_dist = self.dist_threshold_mm.unwrap_or((
            ctx.config.drive.goal_dist_threshold_mm,
            ctx.config.drive.goal_dist_threshold_mm,
        ));

        // Goals derived from an object scale their threshold with the
        // object's current distance, same formula as the resolver.
        let dist = match self.object_pose_source {
            Some(object_pose) => {
                let origin = match ctx.poses.origin_of(ctx.robot.pose) {
                    Ok(o) => o,
                    Err(_) => return (default_dist, angle),
                };
                match ctx.poses.with_respect_to(object_pose, origin) {
                    Ok(object_t) => {
                        let delta = object_t.translation.vector - selected_goal.translation.vector;
                        resolver::distance_threshold(
                            delta.norm(),
                            angle,
                            ctx.config.docking.x_threshold_scalar,
                        )
                        .unwrap_or(default_dist)
                    }
                    Err(_) => default_dist,
                }
            }
            None => default_dist,
        };
        (dist, angle)
    }

    fn finish_through_anim(&mut self, ctx: &mut RobotCtx, result: ActionResult) -> ActionResult {
        // The drive itself is done, but the driving-end animation may
        // still need to run; hold the terminal result until it finishes.
        if self.path_started {
            if let Ok(anim) = ctx.actuator.play_animation(AnimTrigger::DrivingEnd) {
                if ctx.actuator.is_animation_playing(anim) {
                    self.end_anim = Some(anim);
                    self.pending_result = Some(result);
                    return ActionResult::Running;
                }
            }
        }
        result
    }
}

impl Action for DriveToPoseAction {
    fn name(&self) -> &str {
        "DriveToPose"
    }

    fn tracks(&self) -> Tracks {
        Tracks::BODY
    }

    fn timeout_s(&self, config: &axle_core::config::FrameworkConfig) -> f32 {
        config.drive.drive_timeout_s
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if self.goal_ids.is_empty() {
            warn!("Goal must be set before running a drive action");
            return ActionResult::NoGoalSet;
        }

        let origin = match ctx.poses.origin_of(ctx.robot.pose) {
            Ok(o) => o,
            Err(_) => return ActionResult::BadPose,
        };
        self.goals_in_origin.clear();
        for goal in &self.goal_ids {
            match ctx.poses.with_respect_to(*goal, origin) {
                Ok(t) => self.goals_in_origin.push(t),
                Err(_) => {
                    // A goal in a different origin than the robot cannot
                    // be driven to.
                    warn!("Could not express goal pose in the robot's origin");
                    return ActionResult::BadPose;
                }
            }
        }

        self.planning_abort_at_s = -1.0;
        self.path_started = false;
        info!(goals = self.goals_in_origin.len(), "Starting drive");
        match ctx.planner.start_driving_to_poses(&self.goals_in_origin) {
            Ok(()) => ActionResult::Running,
            Err(_) => ActionResult::PathPlanningFailedAbort,
        }
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        // Still running while the driving-end animation plays.
        if let Some(anim) = self.end_anim {
            if ctx.actuator.is_animation_playing(anim) {
                return ActionResult::Running;
            }
            self.end_anim = None;
            return self.pending_result.take().unwrap_or(ActionResult::Success);
        }

        match ctx.planner.status() {
            DriveStatus::Failed => {
                info!("Planner reported drive failure");
                self.planning_abort_at_s = -1.0;
                ActionResult::PathPlanningFailedAbort
            }

            DriveStatus::Idle => ActionResult::Running,

            DriveStatus::ComputingPath => {
                if self.planning_abort_at_s < 0.0 {
                    self.planning_abort_at_s = ctx.time_s + ctx.config.drive.max_planning_time_s;
                } else if ctx.time_s >= self.planning_abort_at_s {
                    warn!(
                        max_s = ctx.config.drive.max_planning_time_s,
                        "Planner exceeded its time budget, aborting"
                    );
                    ctx.planner.abort();
                    self.planning_abort_at_s = -1.0;
                    return ActionResult::PathPlanningFailedAbort;
                }
                ActionResult::Running
            }

            DriveStatus::FollowingPath => {
                self.planning_abort_at_s = -1.0;
                self.path_started = true;
                ActionResult::Running
            }

            DriveStatus::Ready => {
                self.planning_abort_at_s = -1.0;
                let selected = ctx.planner.selected_goal_index();
                let Some(goal) = self.goals_in_origin.get(selected).copied() else {
                    warn!(selected, "Planner selected an out-of-range goal");
                    return ActionResult::PathPlanningFailedAbort;
                };

                let origin = match ctx.poses.origin_of(ctx.robot.pose) {
                    Ok(o) => o,
                    Err(_) => return ActionResult::BadPose,
                };
                let robot_t = match ctx.poses.with_respect_to(ctx.robot.pose, origin) {
                    Ok(t) => t,
                    Err(_) => return ActionResult::BadPose,
                };

                let ((tx, ty), angle_thresh) = self.thresholds(ctx, &goal);
                let (rx, ry) = planar_translation(&robot_t);
                let (gx, gy) = planar_translation(&goal);
                let heading_ok = heading(&robot_t)
                    .is_near(heading(&goal), angle_thresh.value());
                let in_place =
                    (rx - gx).abs() <= tx && (ry - gy).abs() <= ty && heading_ok;

                if in_place {
                    info!(
                        dx = rx - gx,
                        dy = ry - gy,
                        "Finished following path at the goal"
                    );
                    self.finish_through_anim(ctx, ActionResult::Success)
                } else if ctx.planner.last_path_fully_delivered() {
                    // Done driving, path fully delivered, but off goal:
                    // retryable by the caller.
                    info!(
                        dx = rx - gx,
                        dy = ry - gy,
                        "Done traversing path but not in position"
                    );
                    ActionResult::FailedTraversingPath
                } else {
                    warn!("Not at the goal and the robot never received the full path");
                    ActionResult::FollowingPathButNotTraversing
                }
            }
        }
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        if ctx.planner.is_active() {
            ctx.planner.abort();
        }
        if let Some(anim) = self.end_anim.take() {
            ctx.actuator.cancel_animation(anim);
        }
    }

    fn on_reset(&mut self, _ctx: &mut RobotCtx) {
        self.planning_abort_at_s = -1.0;
        self.path_started = false;
        self.end_anim = None;
        self.pending_result = None;
    }
}

// =============================================================================
// DriveToObjectAction
// =============================================================================

/// Drive to one of an object's pre-action poses (or to a plain distance
/// from it), confirming the object afterwards and re-checking position
/// against the object's possibly-updated pose.
pub struct DriveToObjectAction {
    object: ObjectId,
    interaction: Option<Interaction>,
    distance_mm: Option<f32>,
    approach_angle: Option<Radians>,
    visually_verify_when_done: bool,
    position_check_on_completion: bool,
    inner: Option<ActionRunner>,
}

impl DriveToObjectAction {
    /// Drive to a pre-action pose of the given interaction type.
    pub fn to_pre_action_pose(object: ObjectId, interaction: Interaction) -> Self {
        Self {
            object,
            interaction: Some(interaction),
            distance_mm: None,
            approach_angle: None,
            visually_verify_when_done: true,
            position_check_on_completion: true,
            inner: None,
        }
    }

    /// Drive until the robot is within `distance_mm` of the object.
    pub fn to_distance(object: ObjectId, distance_mm: f32) -> Self {
        Self {
            object,
            interaction: None,
            distance_mm: Some(distance_mm),
            approach_angle: None,
            visually_verify_when_done: true,
            position_check_on_completion: true,
            inner: None,
        }
    }

    pub fn set_approach_angle(&mut self, angle: Radians) {
        self.approach_angle = Some(angle);
    }

    pub fn set_visually_verify_when_done(&mut self, verify: bool) {
        self.visually_verify_when_done = verify;
    }

    pub fn set_position_check_on_completion(&mut self, check: bool) {
        self.position_check_on_completion = check;
    }

    /// Re-evaluate whether the robot stands at a valid pre-action pose
    /// (or within the plain distance) against the object's current pose.
    fn in_position_now(&self, ctx: &RobotCtx) -> Result<bool, ActionResult> {
        match self.interaction {
            Some(interaction) => {
                let mut options = ResolverOptions::for_driving(ctx);
                options.approach_angle = self.approach_angle;
                let res = resolver::resolve(ctx, self.object, interaction, &options)?;
                Ok(res.robot_in_position)
            }
            None => {
                let distance = self.distance_mm.ok_or(ActionResult::NoDistanceSet)?;
                let snapshot = ctx.world.object(self.object).ok_or(ActionResult::BadObject)?;
                let origin = ctx
                    .poses
                    .origin_of(ctx.robot.pose)
                    .map_err(|_| ActionResult::BadPose)?;
                let object_t = ctx
                    .poses
                    .with_respect_to(snapshot.pose, origin)
                    .map_err(|_| ActionResult::BadPose)?;
                let robot_t = ctx
                    .poses
                    .with_respect_to(ctx.robot.pose, origin)
                    .map_err(|_| ActionResult::BadPose)?;
                let (ox, oy) = planar_translation(&object_t);
                let (rx, ry) = planar_translation(&robot_t);
                let dist_sq = (ox - rx) * (ox - rx) + (oy - ry) * (oy - ry);
                Ok(dist_sq <= distance * distance)
            }
        }
    }
}

impl Action for DriveToObjectAction {
    fn name(&self) -> &str {
        "DriveToObject"
    }

    fn tracks(&self) -> Tracks {
        Tracks::HEAD | Tracks::BODY
    }

    fn timeout_s(&self, config: &axle_core::config::FrameworkConfig) -> f32 {
        config.drive.drive_timeout_s
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let snapshot = match ctx.world.object(self.object) {
            Some(s) => s,
            None => {
                warn!(object = %self.object, "No object to drive to");
                return ActionResult::BadObject;
            }
        };

        let mut goal_ids: Vec<PoseId> = Vec::new();
        let mut already_in_position = false;

        match self.interaction {
            Some(interaction) => {
                let mut options = ResolverOptions::for_driving(ctx);
                options.approach_angle = self.approach_angle;
                let res = match resolver::resolve(ctx, self.object, interaction, &options) {
                    Ok(res) => res,
                    Err(failure) => return failure,
                };
                already_in_position = res.robot_in_position;
                goal_ids = res.candidates.iter().map(|c| c.pose).collect();
            }
            None => {
                let Some(distance) = self.distance_mm else {
                    warn!("Drive-to-object has neither interaction type nor distance");
                    return ActionResult::NoDistanceSet;
                };
                let origin = match ctx.poses.origin_of(ctx.robot.pose) {
                    Ok(o) => o,
                    Err(_) => return ActionResult::BadPose,
                };
                let object_t = match ctx.poses.with_respect_to(snapshot.pose, origin) {
                    Ok(t) => t,
                    Err(_) => return ActionResult::BadPose,
                };
                let robot_t = match ctx.poses.with_respect_to(ctx.robot.pose, origin) {
                    Ok(t) => t,
                    Err(_) => return ActionResult::BadPose,
                };
                let (ox, oy) = planar_translation(&object_t);
                let (rx, ry) = planar_translation(&robot_t);
                let (dx, dy) = (rx - ox, ry - oy);
                let current_dist = (dx * dx + dy * dy).sqrt();
                if current_dist <= distance {
                    already_in_position = true;
                } else {
                    let (ux, uy) = (dx / current_dist, dy / current_dist);
                    let goal = axle_core::pose::planar_transform(
                        ox + ux * distance,
                        oy + uy * distance,
                        robot_t.translation.z,
                        Radians::new((-uy).atan2(-ux)),
                    );
                    goal_ids.push(ctx.poses.add_pose(origin, goal));
                }
            }
        }

        let mut sequence = SequentialAction::new("DriveToObjectSteps");
        if !already_in_position {
            let mut drive = DriveToPoseAction::new(goal_ids);
            if self.interaction.is_some() {
                drive.set_object_pose_source(snapshot.pose);
            }
            sequence.add(ctx, Box::new(drive));
        }
        // Confirm the object once there, unless we are carrying it (a
        // carried object can never be seen).
        if ctx.robot.carrying != Some(self.object) {
            sequence.add(
                ctx,
                Box::new(TurnTowardsObjectAction::new(
                    self.object,
                    None,
                    self.visually_verify_when_done,
                )),
            );
        }
        if sequence.is_empty() {
            debug!("Nothing to do, already at the object");
            return ActionResult::Success;
        }

        let mut runner = ActionRunner::new(ctx, Box::new(sequence));
        runner.suppress_track_locking(true);
        let primed = runner.update(ctx);
        match primed {
            ActionResult::Running => {
                self.inner = Some(runner);
                ActionResult::Running
            }
            // Everything finished within the priming tick.
            ActionResult::Success => ActionResult::Success,
            failure => failure,
        }
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let result = match &mut self.inner {
            Some(inner) => inner.update(ctx),
            None => ActionResult::Success,
        };
        if result != ActionResult::Success {
            return result;
        }

        if !self.position_check_on_completion {
            return ActionResult::Success;
        }

        // Driving and verification may have refined the object's pose;
        // the pre-action pose picked at init may no longer be valid.
        match self.in_position_now(ctx) {
            Err(failure) => failure,
            Ok(true) => ActionResult::Success,
            Ok(false) => {
                info!(object = %self.object, "Drive finished but not in position");
                ActionResult::DidNotReachPreActionPose
            }
        }
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        if let Some(inner) = &mut self.inner {
            inner.cancel(ctx);
        }
    }

    fn on_reset(&mut self, ctx: &mut RobotCtx) {
        if let Some(mut inner) = self.inner.take() {
            inner.cancel(ctx);
        }
    }
}
