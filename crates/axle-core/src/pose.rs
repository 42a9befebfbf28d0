//! Pose frame tree.
//!
//! Every pose in the system is a rigid transform expressed relative to a
//! parent pose; poses with no parent are origin roots (one per localization
//! epoch — a relocalization starts a fresh origin). Two poses can only be
//! compared after re-expressing one with respect to a common ancestor, and
//! that operation fails when the poses live under different origins.
//!
//! Nodes are owned by an arena ([`PoseTree`]) and referred to by stable
//! [`PoseId`] indices. Holders of a `PoseId` re-resolve through the tree on
//! every use; nothing keeps a reference into the arena across ticks.

use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

use crate::angle::Radians;
use crate::error::PoseError;

/// A rigid 3D transform (rotation + translation).
pub type Transform = Isometry3<f32>;

/// Maximum parent hops allowed when walking to a root. A well-formed tree
/// is never this deep; hitting the bound means the tree is corrupted.
pub const MAX_PARENT_HOPS: usize = 64;

/// Stable handle to a node in a [`PoseTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoseId(usize);

struct PoseNode {
    parent: Option<PoseId>,
    transform: Transform,
}

/// Arena of pose nodes forming a forest of frame trees.
#[derive(Default)]
pub struct PoseTree {
    nodes: Vec<PoseNode>,
}

impl PoseTree {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Add a new origin root (identity transform, no parent).
    pub fn add_origin(&mut self) -> PoseId {
        self.push(None, Transform::identity())
    }

    /// Add a pose expressed relative to `parent`.
    pub fn add_pose(&mut self, parent: PoseId, transform: Transform) -> PoseId {
        self.push(Some(parent), transform)
    }

    fn push(&mut self, parent: Option<PoseId>, transform: Transform) -> PoseId {
        let id = PoseId(self.nodes.len());
        self.nodes.push(PoseNode { parent, transform });
        id
    }

    fn node(&self, id: PoseId) -> Result<&PoseNode, PoseError> {
        self.nodes.get(id.0).ok_or(PoseError::UnknownNode)
    }

    /// The transform of `id` relative to its parent.
    pub fn transform_of(&self, id: PoseId) -> Result<Transform, PoseError> {
        Ok(self.node(id)?.transform)
    }

    pub fn parent_of(&self, id: PoseId) -> Result<Option<PoseId>, PoseError> {
        Ok(self.node(id)?.parent)
    }

    /// Replace the transform of `id` (same parent). Only the owning
    /// subsystem should call this: the world model for objects, the
    /// localizer for the robot.
    pub fn set_transform(&mut self, id: PoseId, transform: Transform) -> Result<(), PoseError> {
        let node = self.nodes.get_mut(id.0).ok_or(PoseError::UnknownNode)?;
        node.transform = transform;
        Ok(())
    }

    /// Reattach `id` under a new parent, keeping its relative transform.
    /// Fails if the new parent is `id` itself or one of its descendants.
    pub fn set_parent(&mut self, id: PoseId, new_parent: PoseId) -> Result<(), PoseError> {
        // Walk up from the proposed parent; if we reach `id`, it's a cycle.
        let mut cursor = Some(new_parent);
        for _ in 0..=MAX_PARENT_HOPS {
            match cursor {
                None => break,
                Some(c) if c == id => return Err(PoseError::WouldCycle),
                Some(c) => cursor = self.node(c)?.parent,
            }
        }
        let node = self.nodes.get_mut(id.0).ok_or(PoseError::UnknownNode)?;
        node.parent = Some(new_parent);
        Ok(())
    }

    /// The origin root above `id`, plus the composed root-from-node
    /// transform.
    fn chain_to_root(&self, id: PoseId) -> Result<(PoseId, Transform), PoseError> {
        let mut acc = self.node(id)?.transform;
        let mut cursor = id;
        for _ in 0..MAX_PARENT_HOPS {
            match self.node(cursor)?.parent {
                None => return Ok((cursor, acc)),
                Some(parent) => {
                    acc = self.node(parent)?.transform * acc;
                    cursor = parent;
                }
            }
        }
        Err(PoseError::DepthExceeded(MAX_PARENT_HOPS))
    }

    /// The origin root above `id`.
    pub fn origin_of(&self, id: PoseId) -> Result<PoseId, PoseError> {
        self.chain_to_root(id).map(|(root, _)| root)
    }

    /// Re-express the pose of `node` in the frame of `target`.
    ///
    /// Fails with [`PoseError::NoCommonAncestor`] when the two nodes live
    /// under different origin roots.
    pub fn with_respect_to(&self, node: PoseId, target: PoseId) -> Result<Transform, PoseError> {
        let (node_root, root_from_node) = self.chain_to_root(node)?;
        let (target_root, root_from_target) = self.chain_to_root(target)?;
        if node_root != target_root {
            return Err(PoseError::NoCommonAncestor);
        }
        Ok(root_from_target.inverse() * root_from_node)
    }

    /// Per-axis translation + Z-heading equality after re-expression in a
    /// common frame.
    pub fn is_same_as(
        &self,
        node: PoseId,
        other: PoseId,
        dist_threshold: Vector3<f32>,
        angle_threshold: Radians,
    ) -> Result<bool, PoseError> {
        let rel = self.with_respect_to(node, other)?;
        Ok(transform_within(&rel, dist_threshold, angle_threshold))
    }

    /// Pose equality under rotation ambiguity: a symmetric object looks the
    /// same under any of its symmetry rotations, so `node` matches `other`
    /// if it matches under *any* supplied ambiguity. The identity rotation
    /// must be included by the caller if exact alignment should match too.
    pub fn is_same_as_with_ambiguity(
        &self,
        node: PoseId,
        other: PoseId,
        ambiguities: &[UnitQuaternion<f32>],
        dist_threshold: Vector3<f32>,
        angle_threshold: Radians,
    ) -> Result<bool, PoseError> {
        let rel = self.with_respect_to(node, other)?;
        let within_dist = translation_within(&rel, dist_threshold);
        if !within_dist {
            return Ok(false);
        }
        let matched = ambiguities.iter().any(|ambiguity| {
            let residual = ambiguity.inverse() * rel.rotation;
            Radians::new(z_angle(&residual)).is_near(Radians::new(0.0), angle_threshold.abs())
        });
        Ok(matched)
    }
}

/// The heading (rotation about the parent Z axis) of a transform.
pub fn z_angle(rotation: &UnitQuaternion<f32>) -> f32 {
    rotation.euler_angles().2
}

/// The heading of a full transform.
pub fn heading(transform: &Transform) -> Radians {
    Radians::new(z_angle(&transform.rotation))
}

/// Planar (X, Y) translation of a transform.
pub fn planar_translation(transform: &Transform) -> (f32, f32) {
    (transform.translation.x, transform.translation.y)
}

fn translation_within(rel: &Transform, dist_threshold: Vector3<f32>) -> bool {
    let t = rel.translation.vector;
    t.x.abs() <= dist_threshold.x && t.y.abs() <= dist_threshold.y && t.z.abs() <= dist_threshold.z
}

fn transform_within(rel: &Transform, dist_threshold: Vector3<f32>, angle_threshold: Radians) -> bool {
    translation_within(rel, dist_threshold)
        && Radians::new(z_angle(&rel.rotation)).abs() <= angle_threshold.abs()
}

/// Build a planar transform: translation (x, y, z) plus a heading about Z.
pub fn planar_transform(x: f32, y: f32, z: f32, heading: Radians) -> Transform {
    Isometry3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_axis_angle(&Vector3::z_axis(), heading.value()),
    )
}
