//! Pre-action pose resolution.
//!
//! Given a target object and an interaction type, ranks the object's
//! candidate approach poses by distance from the robot and decides whether
//! the robot already stands close enough to one of them to skip driving.
//! Pure given the world query result: no side effects, deterministic, safe
//! to call once while driving and again right before committing to dock.

use tracing::debug;

use axle_core::angle::Radians;
use axle_core::pose::{planar_translation, z_angle, PoseTree, Transform};
use axle_core::result::ActionResult;
use axle_core::types::ObjectId;

use crate::context::{Interaction, PreActionPose, RobotCtx};

/// Candidates whose heading is further than this from a requested approach
/// angle are discarded.
const APPROACH_ANGLE_CUTOFF: f32 = std::f32::consts::FRAC_PI_4;

/// Options controlling one resolution.
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Only keep candidates roughly aligned with this world-frame heading.
    pub approach_angle: Option<Radians>,
    /// Tolerance scaling the "close enough" distance threshold. Not
    /// positive means no proximity check is meaningful.
    pub angle_tolerance: Radians,
    /// Fail with `DidNotReachPreActionPose` when the robot is not already
    /// near a candidate (used by docking); otherwise just report it.
    pub require_in_position: bool,
    /// Extra distance pushed onto each candidate along the marker normal.
    pub offset_x_mm: f32,
}

impl ResolverOptions {
    pub fn for_docking(ctx: &RobotCtx) -> Self {
        Self {
            approach_angle: None,
            angle_tolerance: Radians::new(ctx.config.docking.pre_action_angle_tolerance_rad),
            require_in_position: true,
            offset_x_mm: 0.0,
        }
    }

    pub fn for_driving(ctx: &RobotCtx) -> Self {
        Self {
            approach_angle: None,
            angle_tolerance: Radians::new(ctx.config.docking.pre_action_angle_tolerance_rad),
            require_in_position: false,
            offset_x_mm: 0.0,
        }
    }
}

/// Output of a successful resolution.
#[derive(Debug)]
pub struct Resolution {
    /// Surviving candidates, in world-model order.
    pub candidates: Vec<PreActionPose>,
    /// Origin-frame transform of each surviving candidate (parallel to
    /// `candidates`).
    pub candidate_transforms: Vec<Transform>,
    /// Index of the candidate nearest the robot.
    pub closest_index: usize,
    /// Absolute (x, y) displacement of the robot from the closest
    /// candidate, origin frame, mm.
    pub closest_displacement: (f32, f32),
    /// Distance threshold used for the proximity decision, mm. `None` when
    /// the angle tolerance made no check meaningful.
    pub distance_threshold: Option<(f32, f32)>,
    /// Whether the robot already stands at the closest candidate (within
    /// the distance threshold and angle tolerance).
    pub robot_in_position: bool,
}

/// Distance threshold for "close enough to a pre-action pose", scaled by
/// how far the pose sits from the object: the further away, the more slop
/// is allowed. Returns `(x, y)` thresholds in mm, or `None` when
/// `angle_tolerance` is not positive.
pub fn distance_threshold(
    object_distance_mm: f32,
    angle_tolerance: Radians,
    x_threshold_scalar: f32,
) -> Option<(f32, f32)> {
    if angle_tolerance.value() <= 0.0 {
        return None;
    }
    let thresh_y = object_distance_mm * angle_tolerance.value().sin();
    // Radial (x) slop matters less than tangential slop near a marker.
    Some((thresh_y * x_threshold_scalar, thresh_y))
}

/// Resolve the approach geometry for `object`.
///
/// Fails with `BadObject` (missing or carried target), `NoPreActionPoses`
/// (no surviving candidates), `BadPose` (no candidate reconcilable with
/// the robot's frame), or `DidNotReachPreActionPose` (proximity demanded
/// but not met).
pub fn resolve(
    ctx: &RobotCtx,
    object_id: ObjectId,
    interaction: Interaction,
    options: &ResolverOptions,
) -> Result<Resolution, ActionResult> {
    let object = ctx.world.object(object_id).ok_or(ActionResult::BadObject)?;
    if ctx.robot.carrying == Some(object_id) {
        debug!(%object_id, "Robot is carrying the target object");
        return Err(ActionResult::BadObject);
    }

    let tree = &ctx.poses;
    let robot_origin = tree
        .origin_of(ctx.robot.pose)
        .map_err(|_| ActionResult::BadPose)?;

    let mut candidates = ctx
        .world
        .pre_action_poses(object_id, interaction, options.offset_x_mm);

    // Approach-angle filter. A well-formed object should always keep at
    // least one candidate, but an empty result must still be tolerated.
    if let Some(approach) = options.approach_angle {
        candidates.retain(|candidate| {
            match tree.with_respect_to(candidate.pose, robot_origin) {
                Ok(t) => {
                    let diff = Radians::new(z_angle(&t.rotation)) - approach;
                    diff.abs() < APPROACH_ANGLE_CUTOFF
                }
                Err(_) => false,
            }
        });
    }

    if candidates.is_empty() {
        return Err(ActionResult::NoPreActionPoses);
    }

    let robot_transform = tree
        .with_respect_to(ctx.robot.pose, robot_origin)
        .map_err(|_| ActionResult::BadPose)?;
    let (robot_x, robot_y) = planar_translation(&robot_transform);

    // Keep only candidates whose frame reconciles with the robot's; an
    // individual failure is a per-candidate skip, not a resolver failure.
    let mut surviving = Vec::with_capacity(candidates.len());
    let mut transforms = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match tree.with_respect_to(candidate.pose, robot_origin) {
            Ok(t) => {
                surviving.push(candidate);
                transforms.push(t);
            }
            Err(e) => {
                debug!(error = %e, "Skipping candidate in unreconcilable frame");
            }
        }
    }
    if surviving.is_empty() {
        return Err(ActionResult::BadPose);
    }

    let mut closest_index = 0;
    let mut closest_dist_sq = f32::MAX;
    let mut closest_displacement = (0.0, 0.0);
    for (index, transform) in transforms.iter().enumerate() {
        let (cx, cy) = planar_translation(transform);
        let (dx, dy) = (robot_x - cx, robot_y - cy);
        let dist_sq = dx * dx + dy * dy;
        if dist_sq < closest_dist_sq {
            closest_dist_sq = dist_sq;
            closest_index = index;
            closest_displacement = (dx.abs(), dy.abs());
        }
    }

    // Threshold scales with the closest candidate's distance from the
    // object.
    let threshold = match tree.with_respect_to(object.pose, surviving[closest_index].pose) {
        Ok(object_wrt_candidate) => distance_threshold(
            object_wrt_candidate.translation.vector.norm(),
            options.angle_tolerance,
            ctx.config.docking.x_threshold_scalar,
        ),
        Err(_) => {
            debug!("Could not express object pose w.r.t. closest candidate");
            None
        }
    };

    let mut robot_in_position = false;
    if let Some((tx, ty)) = threshold {
        let (dx, dy) = closest_displacement;
        if dx > tx || dy > ty {
            if options.require_in_position {
                debug!(dx, dy, tx, ty, "Robot too far from pre-action pose");
                return Err(ActionResult::DidNotReachPreActionPose);
            }
        } else {
            // Within the distance threshold; also require the candidate's
            // heading relative to the robot to be within tolerance.
            if let Ok(rel) = tree.with_respect_to(surviving[closest_index].pose, ctx.robot.pose) {
                if Radians::new(z_angle(&rel.rotation)).abs()
                    < options.angle_tolerance.value().abs()
                {
                    robot_in_position = true;
                }
            }
        }
    }

    Ok(Resolution {
        candidates: surviving,
        candidate_transforms: transforms,
        closest_index,
        closest_displacement,
        distance_threshold: threshold,
        robot_in_position,
    })
}

/// Remove from `goals` every transform matching `pose` within the given
/// thresholds (planar distance + heading). Returns true if anything was
/// removed. Used by retry flows to rule out a predock pose that already
/// failed.
pub fn remove_matching_goals(
    goals: &mut Vec<Transform>,
    pose: &Transform,
    dist_thresh_mm: f32,
    angle_thresh: Radians,
) -> bool {
    let before = goals.len();
    let (px, py) = planar_translation(pose);
    let pose_heading = Radians::new(z_angle(&pose.rotation));
    goals.retain(|goal| {
        let (gx, gy) = planar_translation(goal);
        let dist_sq = (gx - px) * (gx - px) + (gy - py) * (gy - py);
        let heading = Radians::new(z_angle(&goal.rotation));
        let same = dist_sq <= dist_thresh_mm * dist_thresh_mm
            && heading.is_near(pose_heading, angle_thresh.value());
        !same
    });
    goals.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockObjectBuilder, TestRig};
    use axle_core::pose::planar_transform;
    use std::f32::consts::PI;

    /// Scenario A/B geometry: object 100mm ahead of the robot, one docking
    /// candidate at (80, 0) facing the robot (heading 180 degrees).
    fn dock_scenario(rig: &mut TestRig) -> ObjectId {
        MockObjectBuilder::new(ObjectId(1))
            .pose(planar_transform(100.0, 0.0, 0.0, Radians::new(PI)))
            .docking_pose(planar_transform(80.0, 0.0, 0.0, Radians::new(PI)))
            .build(rig)
    }

    #[test]
    fn test_scenario_a_not_in_position() {
        let mut rig = TestRig::new();
        let object = dock_scenario(&mut rig);

        let options = ResolverOptions::for_driving(&rig.ctx);
        let res = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap();

        assert_eq!(res.candidates.len(), 1);
        assert_eq!(res.closest_index, 0);
        assert!(!res.robot_in_position);
        // Robot at origin, candidate at (80, 0).
        assert!((res.closest_displacement.0 - 80.0).abs() < 1e-3);
        assert!(res.closest_displacement.1.abs() < 1e-3);
    }

    #[test]
    fn test_scenario_b_already_in_position() {
        let mut rig = TestRig::new();
        let object = dock_scenario(&mut rig);
        // Robot at (82, 1) facing the object (heading 180 degrees): within
        // a couple of millimeters and degrees of the candidate.
        rig.set_robot_pose(planar_transform(82.0, 1.0, 0.0, Radians::new(PI)));

        let options = ResolverOptions::for_driving(&rig.ctx);
        let res = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap();

        assert!(res.robot_in_position);
        assert!(res.distance_threshold.is_some());
    }

    #[test]
    fn test_require_in_position_fails_when_far() {
        let mut rig = TestRig::new();
        let object = dock_scenario(&mut rig);

        let options = ResolverOptions::for_docking(&rig.ctx);
        let err = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap_err();
        assert_eq!(err, ActionResult::DidNotReachPreActionPose);
    }

    #[test]
    fn test_missing_object_is_bad_object() {
        let rig = TestRig::new();
        let options = ResolverOptions::for_driving(&rig.ctx);
        let err = resolve(&rig.ctx, ObjectId(99), Interaction::Docking, &options).unwrap_err();
        assert_eq!(err, ActionResult::BadObject);
    }

    #[test]
    fn test_carried_object_is_bad_object() {
        let mut rig = TestRig::new();
        let object = dock_scenario(&mut rig);
        rig.ctx.robot.carrying = Some(object);

        let options = ResolverOptions::for_driving(&rig.ctx);
        let err = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap_err();
        assert_eq!(err, ActionResult::BadObject);
    }

    #[test]
    fn test_no_candidates_for_interaction() {
        let mut rig = TestRig::new();
        let object = dock_scenario(&mut rig);

        let options = ResolverOptions::for_driving(&rig.ctx);
        let err = resolve(&rig.ctx, object, Interaction::Rolling, &options).unwrap_err();
        assert_eq!(err, ActionResult::NoPreActionPoses);
    }

    #[test]
    fn test_approach_angle_filters_candidates() {
        let mut rig = TestRig::new();
        // Two candidates on opposite sides of the object.
        let object = MockObjectBuilder::new(ObjectId(2))
            .pose(planar_transform(100.0, 0.0, 0.0, Radians::new(0.0)))
            .docking_pose(planar_transform(80.0, 0.0, 0.0, Radians::new(PI)))
            .docking_pose(planar_transform(120.0, 0.0, 0.0, Radians::new(0.0)))
            .build(&mut rig);

        let mut options = ResolverOptions::for_driving(&rig.ctx);
        options.approach_angle = Some(Radians::new(PI));
        let res = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap();
        assert_eq!(res.candidates.len(), 1);
        assert!(
            (heading_of(&res.candidate_transforms[0]).abs() - PI).abs() < 1e-3,
            "surviving candidate faces the approach angle"
        );

        // Filtering can legally empty the set.
        options.approach_angle = Some(Radians::new(PI / 2.0));
        let err = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap_err();
        assert_eq!(err, ActionResult::NoPreActionPoses);
    }

    fn heading_of(t: &Transform) -> f32 {
        z_angle(&t.rotation)
    }

    #[test]
    fn test_closest_candidate_selected() {
        let mut rig = TestRig::new();
        let object = MockObjectBuilder::new(ObjectId(3))
            .pose(planar_transform(100.0, 0.0, 0.0, Radians::new(0.0)))
            .docking_pose(planar_transform(150.0, 0.0, 0.0, Radians::new(0.0)))
            .docking_pose(planar_transform(60.0, 0.0, 0.0, Radians::new(PI)))
            .build(&mut rig);

        let options = ResolverOptions::for_driving(&rig.ctx);
        let res = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap();
        assert_eq!(res.closest_index, 1);
    }

    #[test]
    fn test_resolver_determinism() {
        let mut rig = TestRig::new();
        let object = dock_scenario(&mut rig);
        let options = ResolverOptions::for_driving(&rig.ctx);

        let first = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap();
        let second = resolve(&rig.ctx, object, Interaction::Docking, &options).unwrap();

        assert_eq!(first.closest_index, second.closest_index);
        assert_eq!(first.robot_in_position, second.robot_in_position);
        assert_eq!(first.candidates.len(), second.candidates.len());
        assert_eq!(first.distance_threshold, second.distance_threshold);
    }

    #[test]
    fn test_distance_threshold_monotonic_in_object_distance() {
        let tolerance = Radians::from_degrees(10.0);
        let mut previous = 0.0;
        for distance in [10.0, 20.0, 50.0, 100.0, 250.0, 1000.0] {
            let (tx, ty) = distance_threshold(distance, tolerance, 1.5).unwrap();
            assert!(ty > previous, "threshold must grow with distance");
            assert!((tx - ty * 1.5).abs() < 1e-4);
            previous = ty;
        }
    }

    #[test]
    fn test_distance_threshold_invalid_for_nonpositive_tolerance() {
        assert!(distance_threshold(100.0, Radians::new(0.0), 1.5).is_none());
        assert!(distance_threshold(100.0, Radians::from_degrees(-5.0), 1.5).is_none());
    }

    #[test]
    fn test_remove_matching_goals() {
        let keep = planar_transform(500.0, 0.0, 0.0, Radians::new(0.0));
        let near_duplicate = planar_transform(30.0, 20.0, 0.0, Radians::from_degrees(10.0));
        let mut goals = vec![keep, near_duplicate];

        let target = planar_transform(0.0, 0.0, 0.0, Radians::new(0.0));
        let removed = remove_matching_goals(
            &mut goals,
            &target,
            100.0,
            Radians::from_degrees(30.0),
        );
        assert!(removed);
        assert_eq!(goals.len(), 1);
        assert!((goals[0].translation.x - 500.0).abs() < 1e-3);
    }

    #[test]
    fn test_remove_matching_goals_respects_heading() {
        // Same spot, opposite heading: not a match.
        let mut goals = vec![planar_transform(10.0, 0.0, 0.0, Radians::new(PI))];
        let target = planar_transform(0.0, 0.0, 0.0, Radians::new(0.0));
        let removed = remove_matching_goals(
            &mut goals,
            &target,
            100.0,
            Radians::from_degrees(30.0),
        );
        assert!(!removed);
        assert_eq!(goals.len(), 1);
    }
}
