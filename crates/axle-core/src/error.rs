//! Error types shared across the axle workspace.

use thiserror::Error;

/// Top-level error type for core data structures.
///
/// Action-level failures are not errors in this sense: they are values of
/// the closed [`ActionResult`](crate::result::ActionResult) taxonomy. This
/// enum covers the structural failures underneath (frame reconciliation,
/// configuration, I/O).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AxleError {
    #[error("Pose error: {0}")]
    Pose(#[from] PoseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from pose-tree operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoseError {
    /// The two poses bottom out in different origin roots, so no common
    /// frame exists to compare them in (e.g. after a relocalization).
    #[error("Poses have no common ancestor origin")]
    NoCommonAncestor,

    /// Walking parent references exceeded the bounded hop count.
    #[error("Pose parent chain exceeded {0} hops")]
    DepthExceeded(usize),

    /// A pose id referred to a node not present in the tree.
    #[error("Unknown pose node")]
    UnknownNode,

    /// Reparenting would have created a cycle.
    #[error("Reparenting would create a cycle")]
    WouldCycle,
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, AxleError>;
