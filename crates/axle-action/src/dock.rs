//! Docking: approach a marked object and manipulate it.
//!
//! One generic [`DockingAction`] runs the four-stage pipeline (visual
//! pre-verify, command, wait for physical completion, verify); what varies
//! between picking up, placing, rolling, and aligning is data — a
//! [`DockInteraction`] value supplying the command-selection and
//! verification strategies.

use tracing::{debug, info, warn};

use axle_core::angle::Radians;
use axle_core::event::{EventKind, RobotEvent, Subscription};
use axle_core::pose::{z_angle, PoseId, Transform};
use axle_core::result::ActionResult;
use axle_core::types::{ActionTag, AnimTag, MarkerCode, ObjectId, Tracks};

use crate::basic::{
    MoveHeadToAngleAction, TurnTowardsObjectAction, VisuallyVerifyNoObjectAtPoseAction,
    VisuallyVerifyObjectAction,
};
use crate::compound::SequentialAction;
use crate::context::{AnimTrigger, DockCommand, DockMove, DockingMethod, RobotCtx};
use crate::resolver::{self, ResolverOptions};
use crate::runner::{Action, ActionRunner};

/// Robot body height, mm. Objects sitting higher than half of this
/// relative to the robot need the high variant of a maneuver (or cannot be
/// manipulated at all).
const ROBOT_HEIGHT_MM: f32 = 70.0;

/// Head angle for looking down at a just-rolled object.
const LOOK_DOWN_ANGLE_RAD: f32 = -0.35;

/// Distance window used when checking an object is no longer at its
/// pre-pickup pose.
const ORIG_POSE_DIST_THRESH_MM: f32 = 40.0;

/// Pitch above which a pop-a-wheelie counts as achieved.
const WHEELIE_MIN_PITCH_RAD: f32 = 1.0;

// Alignment stop distances from the marker, mm.
const LIFT_FINGER_OFFSET_MM: f32 = 25.0;
const BODY_OFFSET_MM: f32 = 40.0;
const CUSTOM_DISTANCE_OFFSET_MM: f32 = 15.0;

/// What part of the robot to align with the marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Alignment {
    LiftFinger,
    LiftPlate,
    Body,
    /// Stop at a caller-chosen distance from the marker.
    Custom(f32),
}

/// The interaction a docking action performs, with its parameters. Data,
/// not subclasses: each variant supplies the command selection and
/// verification strategy.
#[derive(Debug, Clone)]
pub enum DockInteraction {
    PickUp,
    PlaceRelative {
        offset_x_mm: f32,
        offset_y_mm: f32,
        on_ground: bool,
        /// When false the offsets are relative to the object's own axes
        /// and must be re-expressed against the robot's approach heading.
        relative_current_marker: bool,
    },
    PlaceOnGround,
    Roll,
    Align {
        alignment: Alignment,
    },
    PopAWheelie,
}

impl DockInteraction {
    /// Which pre-action pose family this interaction approaches from.
    pub fn pre_action_interaction(&self) -> crate::context::Interaction {
        use crate::context::Interaction;
        match self {
            DockInteraction::PickUp | DockInteraction::Roll | DockInteraction::PopAWheelie => {
                Interaction::Docking
            }
            DockInteraction::PlaceRelative { .. } => Interaction::PlaceRelative,
            DockInteraction::PlaceOnGround => Interaction::PlaceOnGround,
            DockInteraction::Align { alignment } => match alignment {
                Alignment::LiftPlate => Interaction::Docking,
                _ => Interaction::PlaceRelative,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DockStage {
    VisualPreVerify,
    Commanding,
    WaitingForCompletion,
    Verifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DockAnimPhase {
    NotStarted,
    GetIn,
    Loop,
    GetOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LiftLoadState {
    Unknown,
    HasLoad,
    HasNoLoad,
}

/// Approach and manipulate a target object via its marker.
pub struct DockingAction {
    object: ObjectId,
    interaction: DockInteraction,
    require_proximity: bool,
    first_turn_towards_object: bool,
    use_approach_angle: Option<Radians>,
    method: DockingMethod,
    deep_roll: bool,
    play_dock_animations: bool,

    stage: DockStage,
    dock_move: Option<DockMove>,
    dock_marker: Option<MarkerCode>,
    command_tag: Option<ActionTag>,
    placement_offset: (f32, f32, Radians),

    /// Object pose at command-selection time, pinned as a fresh node so
    /// later mutation of the live object pose cannot disturb it.
    original_object_pose: Option<PoseId>,
    carry_object: Option<ObjectId>,

    pre_verify: Option<ActionRunner>,
    maneuver_started: bool,
    settle_until_s: f32,

    dock_ack_sub: Option<Subscription>,
    lift_moving_sub: Option<Subscription>,
    lift_load_sub: Option<Subscription>,
    object_deleted_sub: Option<Subscription>,
    object_deleted: bool,

    anim_phase: DockAnimPhase,
    current_anim: Option<AnimTag>,

    lift_load: LiftLoadState,
    lift_load_deadline_s: f32,
    first_verify_time_s: f32,
    verify_action: Option<ActionRunner>,
    verify_action_done: bool,

    cleaned_up: bool,
}

impl DockingAction {
    pub fn new(object: ObjectId, interaction: DockInteraction) -> Self {
        let placement_offset = match &interaction {
            DockInteraction::PlaceRelative {
                offset_x_mm,
                offset_y_mm,
                ..
            } => (*offset_x_mm, *offset_y_mm, Radians::new(0.0)),
            _ => (0.0, 0.0, Radians::new(0.0)),
        };
        // Placing at an offset cannot check predock proximity: the pose of
        // interest is deliberately away from the canonical one.
        let require_proximity = !matches!(
            &interaction,
            DockInteraction::PlaceRelative { offset_x_mm, offset_y_mm, .. }
                if offset_x_mm.abs() > f32::EPSILON || offset_y_mm.abs() > f32::EPSILON
        );
        Self {
            object,
            interaction,
            require_proximity,
            first_turn_towards_object: true,
            use_approach_angle: None,
            method: DockingMethod::Hybrid,
            deep_roll: false,
            play_dock_animations: true,
            stage: DockStage::VisualPreVerify,
            dock_move: None,
            dock_marker: None,
            command_tag: None,
            placement_offset,
            original_object_pose: None,
            carry_object: None,
            pre_verify: None,
            maneuver_started: false,
            settle_until_s: -1.0,
            dock_ack_sub: None,
            lift_moving_sub: None,
            lift_load_sub: None,
            object_deleted_sub: None,
            object_deleted: false,
            anim_phase: DockAnimPhase::NotStarted,
            current_anim: None,
            lift_load: LiftLoadState::Unknown,
            lift_load_deadline_s: -1.0,
            first_verify_time_s: -1.0,
            verify_action: None,
            verify_action_done: false,
            cleaned_up: false,
        }
    }

    /// Skip the proximity check and dock with whatever marker is nearest.
    pub fn set_require_proximity(&mut self, require: bool) {
        self.require_proximity = require;
    }

    pub fn set_first_turn_towards_object(&mut self, turn: bool) {
        self.first_turn_towards_object = turn;
    }

    pub fn set_approach_angle(&mut self, angle: Radians) {
        self.use_approach_angle = Some(angle);
    }

    pub fn set_docking_method(&mut self, method: DockingMethod) {
        self.method = method;
    }

    pub fn set_play_dock_animations(&mut self, play: bool) {
        self.play_dock_animations = play;
    }

    /// A failed roll verification flips this so the next attempt digs
    /// deeper; callers may inspect or override it.
    pub fn is_deep_roll(&self) -> bool {
        self.deep_roll
    }

    pub fn set_deep_roll(&mut self, deep: bool) {
        self.deep_roll = deep;
    }

    pub fn selected_dock_move(&self) -> Option<DockMove> {
        self.dock_move
    }

    // ---- init helpers ----

    /// Pin the object's current pose as a standalone node under the
    /// robot's origin, so verification can compare against where the
    /// object *was* even after the world model moves it.
    fn pin_object_pose(&mut self, ctx: &mut RobotCtx, object_pose: PoseId) -> Result<(), ActionResult> {
        let origin = ctx
            .poses
            .origin_of(ctx.robot.pose)
            .map_err(|_| ActionResult::BadPose)?;
        let transform = ctx
            .poses
            .with_respect_to(object_pose, origin)
            .map_err(|_| ActionResult::BadPose)?;
        self.original_object_pose = Some(ctx.poses.add_pose(origin, transform));
        Ok(())
    }

    fn object_height_wrt_robot(&self, ctx: &RobotCtx, object_pose: PoseId) -> Result<f32, ActionResult> {
        let origin = ctx
            .poses
            .origin_of(ctx.robot.pose)
            .map_err(|_| ActionResult::BadPose)?;
        let object_t = ctx
            .poses
            .with_respect_to(object_pose, origin)
            .map_err(|_| ActionResult::BadPose)?;
        let robot_t = ctx
            .poses
            .with_respect_to(ctx.robot.pose, origin)
            .map_err(|_| ActionResult::BadPose)?;
        Ok(object_t.translation.z - robot_t.translation.z)
    }

    /// Choose the concrete low-level maneuver for this interaction, based
    /// on object height and carrying state.
    fn select_command(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let snapshot = match ctx.world.object(self.object) {
            Some(s) => s,
            None => return ActionResult::BadObject,
        };
        let height = match self.object_height_wrt_robot(ctx, snapshot.pose) {
            Ok(h) => h,
            Err(r) => return r,
        };
        let carrying = ctx.robot.carrying.is_some();
        let is_high = height > 0.5 * ROBOT_HEIGHT_MM;

        let interaction = self.interaction.clone();
        let dock_move = match interaction {
            DockInteraction::PickUp => {
                if carrying {
                    info!("Already carrying an object, cannot pick up");
                    return ActionResult::StillCarryingObject;
                }
                if let Err(r) = self.pin_object_pose(ctx, snapshot.pose) {
                    return r;
                }
                if is_high {
                    DockMove::PickupHigh
                } else {
                    DockMove::PickupLow
                }
            }
            DockInteraction::Roll => {
                if carrying {
                    return ActionResult::StillCarryingObject;
                }
                if is_high {
                    info!("Object too high to roll");
                    return ActionResult::BadObject;
                }
                if snapshot.top_marker.is_none() {
                    warn!(object = %self.object, "Object has no top marker to verify a roll");
                    return ActionResult::BadObject;
                }
                if let Err(r) = self.pin_object_pose(ctx, snapshot.pose) {
                    return r;
                }
                if self.deep_roll {
                    DockMove::DeepRollLow
                } else {
                    DockMove::RollLow
                }
            }
            DockInteraction::PlaceRelative {
                on_ground,
                relative_current_marker,
                ..
            } => {
                if !carrying {
                    return ActionResult::NotCarryingObjectAbort;
                }
                self.carry_object = ctx.robot.carrying;
                if !on_ground && !snapshot.is_carryable_height {
                    warn!(object = %self.object, "Cannot stack on this object");
                    return ActionResult::BadObject;
                }
                if !relative_current_marker {
                    if let Err(r) = self.transform_placement_offsets(ctx) {
                        return r;
                    }
                }
                // A lateral offset makes the tracker lose the marker on
                // purpose; go in blind.
                if self.placement_offset.1.abs() > f32::EPSILON {
                    self.method = DockingMethod::EvenBlinder;
                }
                if on_ground {
                    DockMove::PlaceLow
                } else {
                    DockMove::PlaceHigh
                }
            }
            DockInteraction::PlaceOnGround => {
                if !carrying {
                    return ActionResult::NotCarryingObjectAbort;
                }
                self.carry_object = ctx.robot.carrying;
                DockMove::PlaceLow
            }
            DockInteraction::Align { alignment } => {
                self.placement_offset.0 = match alignment {
                    Alignment::LiftFinger => LIFT_FINGER_OFFSET_MM,
                    Alignment::LiftPlate => 0.0,
                    Alignment::Body => BODY_OFFSET_MM,
                    Alignment::Custom(distance) => distance - CUSTOM_DISTANCE_OFFSET_MM,
                };
                if matches!(alignment, Alignment::LiftPlate) {
                    DockMove::AlignSpecial
                } else {
                    DockMove::Align
                }
            }
            DockInteraction::PopAWheelie => {
                if carrying {
                    return ActionResult::StillCarryingObject;
                }
                if is_high {
                    info!("Object too high to pop a wheelie off of");
                    return ActionResult::BadObject;
                }
                DockMove::PopAWheelie
            }
        };

        self.dock_move = Some(dock_move);
        ActionResult::Running
    }

    /// Re-express object-relative placement offsets into the robot's
    /// approach frame. The relative heading must sit near one of four 90
    /// degree buckets; anything between is unsupported and errors out.
    fn transform_placement_offsets(&mut self, ctx: &RobotCtx) -> Result<(), ActionResult> {
        let snapshot = ctx.world.object(self.object).ok_or(ActionResult::BadObject)?;
        let rel = ctx
            .poses
            .with_respect_to(snapshot.pose, ctx.robot.pose)
            .map_err(|_| ActionResult::BadPose)?;
        let rotation = Radians::new(z_angle(&rel.rotation));
        let tolerance = ctx.config.docking.placement_snap_tolerance_rad;

        let (rel_x, rel_y) = (self.placement_offset.0, self.placement_offset.1);
        let quarter = std::f32::consts::FRAC_PI_2;
        let (abs_x, abs_y) = if rotation.is_near(Radians::new(0.0), tolerance) {
            (-rel_x, rel_y)
        } else if rotation.is_near(Radians::new(quarter), tolerance) {
            (rel_y, rel_x)
        } else if rotation.is_near(Radians::new(-quarter), tolerance) {
            (-rel_y, -rel_x)
        } else if rotation.is_near(Radians::new(std::f32::consts::PI), tolerance) {
            (rel_x, -rel_y)
        } else {
            warn!(
                rotation_deg = rotation.to_degrees(),
                "Robot/object heading not near a supported alignment"
            );
            return Err(ActionResult::DidNotReachPreActionPose);
        };

        if abs_x < -ctx.config.docking.max_negative_x_offset_mm {
            warn!(abs_x, "Placement offset would push through the object");
            return Err(ActionResult::BadPose);
        }
        self.placement_offset.0 = abs_x;
        self.placement_offset.1 = abs_y;
        Ok(())
    }

    /// Nearest currently observed marker on the object.
    fn nearest_observed_marker(&self, ctx: &RobotCtx) -> Result<MarkerCode, ActionResult> {
        let snapshot = ctx.world.object(self.object).ok_or(ActionResult::BadObject)?;
        let mut best: Option<(f32, MarkerCode)> = None;
        for marker in snapshot.markers.iter().filter(|m| m.observed) {
            let Ok(rel) = ctx.poses.with_respect_to(marker.pose, ctx.robot.pose) else {
                continue;
            };
            let dist_sq = rel.translation.vector.norm_squared();
            if best.map_or(true, |(d, _)| dist_sq < d) {
                best = Some((dist_sq, marker.code));
            }
        }
        match best {
            Some((_, code)) => Ok(code),
            None => {
                warn!(object = %self.object, "No currently observed marker to dock with");
                Err(ActionResult::VisualObservationFailed)
            }
        }
    }

    fn issue_dock_command(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let (Some(dock_move), Some(marker), Some(tag)) =
            (self.dock_move, self.dock_marker, self.command_tag)
        else {
            return ActionResult::UnexpectedDockAction;
        };
        let cfg = &ctx.config.docking;
        let command = DockCommand {
            tag,
            object: self.object,
            dock_move,
            speed_mmps: cfg.dock_speed_mmps,
            accel_mmps2: cfg.dock_accel_mmps2,
            decel_mmps2: cfg.dock_decel_mmps2,
            marker,
            marker2: None,
            placement_offset_x_mm: self.placement_offset.0,
            placement_offset_y_mm: self.placement_offset.1,
            placement_offset_angle: self.placement_offset.2,
            num_retries: cfg.num_docking_retries,
            method: self.method,
        };
        info!(object = %self.object, ?dock_move, "Issuing dock command");
        match ctx.actuator.dock_with_object(&command) {
            Ok(()) => {
                self.maneuver_started = false;
                ActionResult::Running
            }
            Err(_) => ActionResult::SendMessageFailed,
        }
    }

    // ---- animation plumbing ----

    fn play_anim(&mut self, ctx: &mut RobotCtx, trigger: AnimTrigger, phase: DockAnimPhase) {
        if !self.play_dock_animations {
            return;
        }
        if let Some(current) = self.current_anim.take() {
            ctx.actuator.cancel_animation(current);
        }
        match ctx.actuator.play_animation(trigger) {
            Ok(tag) => {
                self.current_anim = Some(tag);
                self.anim_phase = phase;
            }
            Err(_) => {
                // Animations are cosmetic; a failed send never fails the
                // dock.
                debug!(?trigger, "Failed to start dock animation");
                self.anim_phase = phase;
            }
        }
    }

    fn update_dock_anim(&mut self, ctx: &mut RobotCtx) {
        // The post-dock lift motion report triggers the get-out clip.
        let get_out = match (&self.lift_moving_sub, self.command_tag) {
            (Some(sub), Some(tag)) => sub.drain_any(
                |e| matches!(e, RobotEvent::MovingLiftPostDock { tag: t } if *t == tag),
            ),
            _ => false,
        };
        if get_out && self.anim_phase != DockAnimPhase::GetOut {
            self.play_anim(ctx, AnimTrigger::DockGetOut, DockAnimPhase::GetOut);
            return;
        }

        if let Some(anim) = self.current_anim {
            if !ctx.actuator.is_animation_playing(anim) {
                self.current_anim = None;
                // Get-in finished: hold the loop until the get-out fires.
                if self.anim_phase == DockAnimPhase::GetIn {
                    self.play_anim(ctx, AnimTrigger::DockLoop, DockAnimPhase::Loop);
                }
            }
        }
    }

    // ---- verification ----

    fn drain_lift_load(&mut self) {
        if let Some(sub) = &self.lift_load_sub {
            for event in sub.drain() {
                if let RobotEvent::LiftLoad { has_load } = event {
                    self.lift_load = if has_load {
                        LiftLoadState::HasLoad
                    } else {
                        LiftLoadState::HasNoLoad
                    };
                }
            }
        }
    }

    /// Run (and lazily create) the verification sub-action; returns
    /// `None` while it is still running.
    fn run_verify_action(
        &mut self,
        ctx: &mut RobotCtx,
        build: impl FnOnce(&mut RobotCtx) -> Box<dyn Action>,
    ) -> Option<ActionResult> {
        if self.verify_action_done {
            return Some(ActionResult::Success);
        }
        if self.verify_action.is_none() {
            let action = build(ctx);
            let mut runner = ActionRunner::new(ctx, action);
            runner.suppress_track_locking(true);
            self.verify_action = Some(runner);
        }
        let Some(runner) = self.verify_action.as_mut() else {
            return Some(ActionResult::UnexpectedDockAction);
        };
        let result = runner.update(ctx);
        if result.is_terminal() {
            self.verify_action = None;
            self.verify_action_done = true;
            Some(result)
        } else {
            None
        }
    }

    fn verify(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let now = ctx.time_s;
        if self.first_verify_time_s < 0.0 {
            self.first_verify_time_s = now;
        }
        self.drain_lift_load();
        let pick_succeeded = ctx.actuator.last_pick_or_place_succeeded();

        match self.interaction.clone() {
            DockInteraction::PickUp => self.verify_pickup(ctx, now, pick_succeeded),
            DockInteraction::Roll => self.verify_roll(ctx, pick_succeeded),
            DockInteraction::PlaceRelative { .. } | DockInteraction::PlaceOnGround => {
                self.verify_place(ctx, pick_succeeded)
            }
            DockInteraction::Align { .. } => self.verify_align(ctx, pick_succeeded),
            DockInteraction::PopAWheelie => self.verify_wheelie(ctx, pick_succeeded),
        }
    }

    fn verify_pickup(&mut self, ctx: &mut RobotCtx, now: f32, pick_succeeded: bool) -> ActionResult {
        if pick_succeeded {
            // Lift-load first; a reported load short-circuits the motion
            // checks.
            let check_motion = match self.lift_load {
                LiftLoadState::Unknown => {
                    if self.lift_load_deadline_s < 0.0 {
                        self.lift_load_deadline_s =
                            now + ctx.config.docking.lift_load_timeout_s;
                        return ActionResult::Running;
                    }
                    if now <= self.lift_load_deadline_s {
                        return ActionResult::Running;
                    }
                    warn!("Lift load report timed out, falling back to motion check");
                    true
                }
                LiftLoadState::HasNoLoad => true,
                LiftLoadState::HasLoad => false,
            };

            if check_motion {
                let snapshot = match ctx.world.object(self.object) {
                    Some(s) => s,
                    None => return ActionResult::BadObject,
                };
                if snapshot.is_moving {
                    // Still moving long after the robot stopped: the cube
                    // is probably in someone's hand.
                    if now > self.first_verify_time_s
                        + ctx.config.docking.max_object_moving_after_stop_s
                    {
                        info!("Picked object still moving, assuming hijacked");
                        return ActionResult::PickupObjectUnexpectedlyMoving;
                    }
                    return ActionResult::Running;
                }
                if self.first_verify_time_s
                    > snapshot.last_moved_at_s
                        + ctx.config.docking.max_object_not_moved_before_stop_s
                {
                    info!(
                        last_moved = snapshot.last_moved_at_s,
                        "Object never moved during pickup, assuming we missed"
                    );
                    return ActionResult::PickupObjectUnexpectedlyNotMoving;
                }
            }
        }

        // Look at where the object used to be and confirm it is gone.
        let Some(orig_pose) = self.original_object_pose else {
            return ActionResult::UnexpectedDockAction;
        };
        let orig_transform = match origin_transform(ctx, orig_pose) {
            Ok(t) => t,
            Err(r) => return r,
        };
        let exemplar = self.object;
        if self
            .run_verify_action(ctx, move |_| {
                Box::new(VisuallyVerifyNoObjectAtPoseAction::new(
                    exemplar,
                    orig_transform,
                    ORIG_POSE_DIST_THRESH_MM,
                ))
            })
            .is_none()
        {
            return ActionResult::Running;
        }

        if ctx.robot.carrying.is_none() {
            warn!("Expected to be carrying an object after pickup");
            return ActionResult::NotCarryingObjectRetry;
        }

        if let Some(seen) = ctx.world.observed_object_near(
            &ctx.poses,
            self.object,
            &orig_transform,
            ORIG_POSE_DIST_THRESH_MM,
        ) {
            // The world model still claims a twin at the original pose;
            // trust the lift and log it.
            info!(%seen, "An object is still observed at the original pose");
        }

        info!(object = %self.object, "Pickup verified");
        ActionResult::Success
    }

    fn verify_roll(&mut self, ctx: &mut RobotCtx, pick_succeeded: bool) -> ActionResult {
        if !pick_succeeded {
            info!("Actuator reported roll failure, assuming docking failed");
            return ActionResult::LastPickAndPlaceFailed;
        }
        if ctx.robot.carrying.is_some() {
            warn!("Not expecting to carry anything after a roll");
            return ActionResult::StillCarryingObject;
        }

        let object = self.object;
        let expected_marker = match ctx.world.object(object).and_then(|s| s.top_marker) {
            Some(marker) => marker,
            None => return ActionResult::BadObject,
        };
        // The roll moved the block toward us; look down before verifying.
        let result = self.run_verify_action(ctx, move |inner_ctx| {
            let mut seq = SequentialAction::new("RollVerify");
            seq.add(
                inner_ctx,
                Box::new(MoveHeadToAngleAction::new(Radians::new(LOOK_DOWN_ANGLE_RAD))),
            );
            seq.add(
                inner_ctx,
                Box::new(VisuallyVerifyObjectAction::new(object, Some(expected_marker))),
            );
            Box::new(seq)
        });
        match result {
            None => ActionResult::Running,
            Some(ActionResult::Success) => {
                info!(object = %self.object, "Roll verified");
                ActionResult::Success
            }
            Some(_) => {
                // Next attempt digs deeper. Visible to and overridable by
                // the caller through set_deep_roll.
                info!("Roll verification failed, enabling deep roll for a retry");
                self.deep_roll = true;
                ActionResult::VisualObservationFailed
            }
        }
    }

    fn verify_place(&mut self, ctx: &mut RobotCtx, pick_succeeded: bool) -> ActionResult {
        if !pick_succeeded {
            info!("Actuator reported placement failure, probably still holding the object");
            return ActionResult::LastPickAndPlaceFailed;
        }
        if ctx.robot.carrying.is_some() {
            warn!("Expected to have released the carried object");
            return ActionResult::StillCarryingObject;
        }
        let Some(carried) = self.carry_object else {
            return ActionResult::UnexpectedDockAction;
        };

        let result = self.run_verify_action(ctx, move |_| {
            Box::new(TurnTowardsObjectAction::new(carried, None, true))
        });
        match result {
            None => ActionResult::Running,
            Some(ActionResult::Success) => {
                info!(object = %carried, "Placement verified");
                ActionResult::Success
            }
            Some(_) => {
                warn!(object = %carried, "Placement verification failed, clearing object");
                ctx.world.clear_object(carried);
                ActionResult::VisualObservationFailed
            }
        }
    }

    fn verify_align(&mut self, ctx: &mut RobotCtx, pick_succeeded: bool) -> ActionResult {
        if ctx.actuator.is_picking_or_placing() {
            return ActionResult::LastPickAndPlaceFailed;
        }
        if ctx.planner.is_active() {
            return ActionResult::FailedTraversingPath;
        }
        if !pick_succeeded {
            return ActionResult::LastPickAndPlaceFailed;
        }
        info!(object = %self.object, "Alignment verified");
        ActionResult::Success
    }

    fn verify_wheelie(&mut self, ctx: &mut RobotCtx, pick_succeeded: bool) -> ActionResult {
        if !pick_succeeded {
            return ActionResult::LastPickAndPlaceFailed;
        }
        if ctx.robot.pitch.value() < WHEELIE_MIN_PITCH_RAD {
            info!(
                pitch_deg = ctx.robot.pitch.to_degrees(),
                "Pitch too small for a wheelie"
            );
            return ActionResult::UnexpectedPitchAngle;
        }
        ActionResult::Success
    }

    // ---- cleanup ----

    fn cleanup(&mut self, ctx: &mut RobotCtx) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;

        ctx.world.deselect_object();
        if ctx.planner.is_active() {
            ctx.planner.abort();
        }
        if ctx.actuator.is_picking_or_placing() {
            ctx.actuator.abort_docking();
        }
        if let Some(anim) = self.current_anim.take() {
            ctx.actuator.cancel_animation(anim);
        }
        if let Some(mut runner) = self.pre_verify.take() {
            runner.cancel(ctx);
        }
        if let Some(mut runner) = self.verify_action.take() {
            runner.cancel(ctx);
        }
        if let Some(tag) = self.command_tag.take() {
            ctx.tags.release(tag);
        }
        self.dock_ack_sub = None;
        self.lift_moving_sub = None;
        self.lift_load_sub = None;
        self.object_deleted_sub = None;
    }

    fn step(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        // An external deletion of the target ends the action promptly.
        if let Some(sub) = &self.object_deleted_sub {
            let target = self.object;
            if sub.drain_any(
                |e| matches!(e, RobotEvent::ObjectDeleted { object } if *object == target),
            ) {
                self.object_deleted = true;
            }
        }
        if self.object_deleted {
            info!(object = %self.object, "Dock target deleted, stopping");
            return ActionResult::BadObject;
        }

        match self.stage {
            DockStage::VisualPreVerify => {
                if let Some(pre_verify) = &mut self.pre_verify {
                    match pre_verify.update(ctx) {
                        ActionResult::Running => return ActionResult::Running,
                        ActionResult::Success => {
                            self.pre_verify = None;
                        }
                        failure => {
                            warn!(%failure, "Visual pre-verification failed");
                            return failure;
                        }
                    }
                }
                let issued = self.issue_dock_command(ctx);
                if issued != ActionResult::Running {
                    return issued;
                }
                self.stage = DockStage::Commanding;
                ActionResult::Running
            }

            DockStage::Commanding | DockStage::WaitingForCompletion => {
                // A negative acknowledgement means the command never took.
                if let (Some(sub), Some(tag)) = (&self.dock_ack_sub, self.command_tag) {
                    if sub.drain_any(|e| {
                        matches!(e, RobotEvent::DockAck { tag: t, started } if *t == tag && !*started)
                    }) {
                        return ActionResult::SendMessageFailed;
                    }
                }

                if !self.maneuver_started {
                    if ctx.actuator.is_picking_or_placing() {
                        // The physical maneuver has begun; only from here
                        // on can "no longer picking" mean completion.
                        self.maneuver_started = true;
                        self.stage = DockStage::WaitingForCompletion;
                        if self.anim_phase == DockAnimPhase::NotStarted {
                            self.play_anim(ctx, AnimTrigger::DockGetIn, DockAnimPhase::GetIn);
                        }
                    }
                    self.update_dock_anim(ctx);
                    return ActionResult::Running;
                }

                if !ctx.actuator.is_picking_or_placing() && !ctx.actuator.is_moving() {
                    // Head moving on its own resets the settle clock.
                    if ctx.actuator.is_head_moving() {
                        self.settle_until_s = -1.0;
                        return ActionResult::Running;
                    }
                    if self.settle_until_s < 0.0 {
                        self.settle_until_s = ctx.time_s + ctx.config.docking.settle_delay_s;
                    }
                    if ctx.time_s >= self.settle_until_s {
                        debug!("Dock maneuver settled, verifying");
                        self.stage = DockStage::Verifying;
                        return self.verify(ctx);
                    }
                    return ActionResult::Running;
                }

                self.update_dock_anim(ctx);
                ActionResult::Running
            }

            DockStage::Verifying => self.verify(ctx),
        }
    }
}

fn origin_transform(ctx: &RobotCtx, pose: PoseId) -> Result<Transform, ActionResult> {
    let origin = ctx
        .poses
        .origin_of(ctx.robot.pose)
        .map_err(|_| ActionResult::BadPose)?;
    ctx.poses
        .with_respect_to(pose, origin)
        .map_err(|_| ActionResult::BadPose)
}

impl Action for DockingAction {
    fn name(&self) -> &str {
        match &self.interaction {
            DockInteraction::PickUp => "PickupObject",
            DockInteraction::PlaceRelative { .. } => "PlaceRelObject",
            DockInteraction::PlaceOnGround => "PlaceObjectOnGround",
            DockInteraction::Roll => {
                if self.deep_roll {
                    "DeepRollObject"
                } else {
                    "RollObject"
                }
            }
            DockInteraction::Align { .. } => "AlignWithObject",
            DockInteraction::PopAWheelie => "PopAWheelie",
        }
    }

    fn tracks(&self) -> Tracks {
        Tracks::HEAD | Tracks::LIFT | Tracks::BODY
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if ctx.world.object(self.object).is_none() {
            warn!(object = %self.object, "Dock object no longer exists");
            return ActionResult::BadObject;
        }
        if ctx.robot.carrying == Some(self.object) {
            warn!(object = %self.object, "Cannot dock with the carried object");
            return ActionResult::BadObject;
        }
        ctx.world.select_object(self.object);

        // When proximity is required, the resolver decides whether docking
        // may start at all; its failures propagate verbatim.
        let resolution = if self.require_proximity {
            let mut options = ResolverOptions::for_docking(ctx);
            options.approach_angle = self.use_approach_angle;
            match resolver::resolve(
                ctx,
                self.object,
                self.interaction.pre_action_interaction(),
                &options,
            ) {
                Ok(res) => Some(res),
                Err(failure) => return failure,
            }
        } else {
            None
        };

        let selection = self.select_command(ctx);
        if selection != ActionResult::Running {
            return selection;
        }

        // Marker: the one tied to the chosen pre-action pose when a
        // proximity check ran, otherwise whatever observed marker is
        // nearest.
        self.dock_marker = match &resolution {
            Some(res) => match res.candidates[res.closest_index].marker {
                Some(marker) => Some(marker),
                None => return ActionResult::BadMarker,
            },
            None => match self.nearest_observed_marker(ctx) {
                Ok(marker) => Some(marker),
                Err(failure) => return failure,
            },
        };

        self.command_tag = Some(ctx.tags.allocate());
        self.dock_ack_sub = Some(ctx.events.subscribe(EventKind::DockAck));
        self.lift_moving_sub = Some(ctx.events.subscribe(EventKind::MovingLiftPostDock));
        self.lift_load_sub = Some(ctx.events.subscribe(EventKind::LiftLoad));
        self.object_deleted_sub = Some(ctx.events.subscribe(EventKind::ObjectDeleted));

        if self.first_turn_towards_object {
            let mut runner = ActionRunner::new(
                ctx,
                Box::new(TurnTowardsObjectAction::new(
                    self.object,
                    self.dock_marker,
                    true,
                )),
            );
            runner.suppress_track_locking(true);
            // Prime once now so the turn command goes out this tick.
            let primed = runner.update(ctx);
            match primed {
                ActionResult::Running => self.pre_verify = Some(runner),
                ActionResult::Success => {}
                failure => return failure,
            }
        }

        self.stage = DockStage::VisualPreVerify;
        ActionResult::Running
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let result = self.step(ctx);
        if result.is_terminal() {
            self.cleanup(ctx);
        }
        result
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        self.cleanup(ctx);
    }

    fn on_reset(&mut self, ctx: &mut RobotCtx) {
        // Fresh attempt: init re-subscribes and re-selects. Deep-roll
        // state intentionally survives resets.
        self.cleanup(ctx);
        self.cleaned_up = false;
        self.stage = DockStage::VisualPreVerify;
        self.dock_move = None;
        self.dock_marker = None;
        self.maneuver_started = false;
        self.settle_until_s = -1.0;
        self.object_deleted = false;
        self.anim_phase = DockAnimPhase::NotStarted;
        self.lift_load = LiftLoadState::Unknown;
        self.lift_load_deadline_s = -1.0;
        self.first_verify_time_s = -1.0;
        self.verify_action_done = false;
    }
}
