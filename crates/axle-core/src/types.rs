//! Identifiers, correlation tags, and actuator track locking.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::warn;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of an object in the world model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object-{}", self.0)
    }
}

/// Code of a visual marker printed on an object face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarkerCode(pub u16);

/// Correlation id returned by the actuator for an individual motor command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MotorActionId(pub u32);

/// Correlation id for an animation playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnimTag(pub u32);

// =============================================================================
// Action tags
// =============================================================================

/// Identifier attached to an outgoing command, matched against the
/// asynchronous acknowledgement that arrives later on the event channel.
/// Unique per live action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionTag(pub u32);

impl ActionTag {
    pub const INVALID: ActionTag = ActionTag(0);
}

impl fmt::Display for ActionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// First tag handed out by the engine-side allocator. Lower values are
/// reserved for externally assigned (SDK) tags.
const FIRST_ENGINE_TAG: u32 = 1_000_000;
const LAST_ENGINE_TAG: u32 = u32::MAX;

/// Allocates unique action tags within the engine range, wrapping at the
/// end of the range and skipping tags still in use.
pub struct TagAllocator {
    next: u32,
    in_use: HashSet<u32>,
}

impl Default for TagAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagAllocator {
    pub fn new() -> Self {
        Self {
            next: FIRST_ENGINE_TAG,
            in_use: HashSet::new(),
        }
    }

    /// Allocate the next free engine tag.
    pub fn allocate(&mut self) -> ActionTag {
        loop {
            let candidate = self.next;
            self.next = if self.next == LAST_ENGINE_TAG {
                FIRST_ENGINE_TAG
            } else {
                self.next + 1
            };
            if self.in_use.insert(candidate) {
                return ActionTag(candidate);
            }
            warn!(tag = candidate, "Tag already in use, skipping");
        }
    }

    /// Claim a caller-chosen tag. Fails on the invalid tag or one already
    /// in use.
    pub fn claim(&mut self, tag: ActionTag) -> bool {
        if tag == ActionTag::INVALID {
            return false;
        }
        self.in_use.insert(tag.0)
    }

    /// Release a tag when its action is destroyed.
    pub fn release(&mut self, tag: ActionTag) {
        self.in_use.remove(&tag.0);
    }

    pub fn is_in_use(&self, tag: ActionTag) -> bool {
        self.in_use.contains(&tag.0)
    }
}

// =============================================================================
// Tracks
// =============================================================================

/// Named actuator subsystems subject to mutual-exclusion locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Head,
    Lift,
    Body,
}

impl Track {
    pub const ALL: [Track; 3] = [Track::Head, Track::Lift, Track::Body];

    fn bit(self) -> u8 {
        match self {
            Track::Head => 0b001,
            Track::Lift => 0b010,
            Track::Body => 0b100,
        }
    }
}

/// A set of tracks, stored as a bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracks(u8);

impl Tracks {
    pub const NONE: Tracks = Tracks(0);
    pub const HEAD: Tracks = Tracks(0b001);
    pub const LIFT: Tracks = Tracks(0b010);
    pub const BODY: Tracks = Tracks(0b100);
    pub const ALL: Tracks = Tracks(0b111);

    pub fn contains(self, track: Track) -> bool {
        self.0 & track.bit() != 0
    }

    pub fn union(self, other: Tracks) -> Tracks {
        Tracks(self.0 | other.0)
    }

    pub fn intersects(self, other: Tracks) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Track> {
        Track::ALL.into_iter().filter(move |t| self.contains(*t))
    }
}

impl fmt::Display for Tracks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for track in self.iter() {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{:?}", track)?;
            first = false;
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

impl std::ops::BitOr for Tracks {
    type Output = Tracks;
    fn bitor(self, rhs: Tracks) -> Tracks {
        self.union(rhs)
    }
}

/// Mutual-exclusion registry: each track is held by at most one action tag.
/// The framework, not individual actions, prevents two concurrently running
/// top-level actions from locking the same track.
#[derive(Default)]
pub struct TrackLocks {
    owners: HashMap<Track, ActionTag>,
}

impl TrackLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if any of `tracks` is currently held (by any tag).
    pub fn are_any_locked(&self, tracks: Tracks) -> bool {
        tracks.iter().any(|t| self.owners.contains_key(&t))
    }

    /// True if every track in `tracks` is held by `tag`.
    pub fn all_locked_by(&self, tracks: Tracks, tag: ActionTag) -> bool {
        tracks.iter().all(|t| self.owners.get(&t) == Some(&tag))
    }

    /// Lock all of `tracks` for `tag`. Fails (locking nothing) if any is
    /// already held by a different tag.
    pub fn lock(&mut self, tracks: Tracks, tag: ActionTag) -> bool {
        for track in tracks.iter() {
            if let Some(owner) = self.owners.get(&track) {
                if *owner != tag {
                    warn!(%tracks, %tag, owner = %owner, "Track lock contention");
                    return false;
                }
            }
        }
        for track in tracks.iter() {
            self.owners.insert(track, tag);
        }
        true
    }

    /// Unlock the tracks in `tracks` that are held by `tag`. Tracks held by
    /// other tags are left alone.
    pub fn unlock(&mut self, tracks: Tracks, tag: ActionTag) {
        for track in tracks.iter() {
            if self.owners.get(&track) == Some(&tag) {
                self.owners.remove(&track);
            }
        }
    }

    /// All tracks currently held by `tag`.
    pub fn held_by(&self, tag: ActionTag) -> Tracks {
        let mut held = Tracks::NONE;
        for (track, owner) in &self.owners {
            if *owner == tag {
                held = held.union(match track {
                    Track::Head => Tracks::HEAD,
                    Track::Lift => Tracks::LIFT,
                    Track::Body => Tracks::BODY,
                });
            }
        }
        held
    }

    /// Owner of a single track, if locked.
    pub fn owner(&self, track: Track) -> Option<ActionTag> {
        self.owners.get(&track).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- TagAllocator ----

    #[test]
    fn test_allocate_unique_tags() {
        let mut alloc = TagAllocator::new();
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, b);
        assert!(alloc.is_in_use(a));
        assert!(alloc.is_in_use(b));
    }

    #[test]
    fn test_release_frees_tag() {
        let mut alloc = TagAllocator::new();
        let a = alloc.allocate();
        alloc.release(a);
        assert!(!alloc.is_in_use(a));
    }

    #[test]
    fn test_claim_custom_tag() {
        let mut alloc = TagAllocator::new();
        assert!(alloc.claim(ActionTag(42)));
        assert!(!alloc.claim(ActionTag(42)), "tag already in use");
        assert!(!alloc.claim(ActionTag::INVALID));
    }

    #[test]
    fn test_allocate_skips_claimed_tag() {
        let mut alloc = TagAllocator::new();
        // Claim the tag the allocator would hand out next.
        assert!(alloc.claim(ActionTag(FIRST_ENGINE_TAG)));
        let tag = alloc.allocate();
        assert_ne!(tag, ActionTag(FIRST_ENGINE_TAG));
    }

    // ---- Tracks ----

    #[test]
    fn test_tracks_union_and_contains() {
        let t = Tracks::HEAD | Tracks::BODY;
        assert!(t.contains(Track::Head));
        assert!(t.contains(Track::Body));
        assert!(!t.contains(Track::Lift));
        assert!(t.intersects(Tracks::BODY));
        assert!(!t.intersects(Tracks::LIFT));
    }

    #[test]
    fn test_tracks_display() {
        assert_eq!((Tracks::HEAD | Tracks::LIFT).to_string(), "Head+Lift");
        assert_eq!(Tracks::NONE.to_string(), "none");
    }

    #[test]
    fn test_tracks_all_iter() {
        let collected: Vec<Track> = Tracks::ALL.iter().collect();
        assert_eq!(collected, vec![Track::Head, Track::Lift, Track::Body]);
    }

    // ---- TrackLocks ----

    #[test]
    fn test_lock_and_unlock() {
        let mut locks = TrackLocks::new();
        let tag = ActionTag(1);
        assert!(locks.lock(Tracks::HEAD | Tracks::BODY, tag));
        assert!(locks.are_any_locked(Tracks::BODY));
        assert!(locks.all_locked_by(Tracks::HEAD | Tracks::BODY, tag));

        locks.unlock(Tracks::HEAD | Tracks::BODY, tag);
        assert!(!locks.are_any_locked(Tracks::ALL));
    }

    #[test]
    fn test_lock_contention_fails_atomically() {
        let mut locks = TrackLocks::new();
        assert!(locks.lock(Tracks::BODY, ActionTag(1)));
        // Second action wants head+body; body is taken, so nothing locks.
        assert!(!locks.lock(Tracks::HEAD | Tracks::BODY, ActionTag(2)));
        assert!(!locks.are_any_locked(Tracks::HEAD));
        assert_eq!(locks.owner(Track::Body), Some(ActionTag(1)));
    }

    #[test]
    fn test_relock_by_same_tag_is_ok() {
        let mut locks = TrackLocks::new();
        assert!(locks.lock(Tracks::BODY, ActionTag(1)));
        assert!(locks.lock(Tracks::BODY, ActionTag(1)));
    }

    #[test]
    fn test_unlock_ignores_other_owners() {
        let mut locks = TrackLocks::new();
        assert!(locks.lock(Tracks::BODY, ActionTag(1)));
        locks.unlock(Tracks::BODY, ActionTag(2));
        assert!(locks.are_any_locked(Tracks::BODY));
    }

    #[test]
    fn test_held_by() {
        let mut locks = TrackLocks::new();
        locks.lock(Tracks::HEAD | Tracks::LIFT, ActionTag(7));
        assert_eq!(locks.held_by(ActionTag(7)), Tracks::HEAD | Tracks::LIFT);
        assert_eq!(locks.held_by(ActionTag(8)), Tracks::NONE);
    }

    // ---- Ids ----

    #[test]
    fn test_object_id_display() {
        assert_eq!(ObjectId(3).to_string(), "object-3");
    }

    #[test]
    fn test_action_tag_display() {
        assert_eq!(ActionTag(12).to_string(), "[12]");
    }

    #[test]
    fn test_id_serde_round_trip() {
        let id = ObjectId(9);
        let json = serde_json::to_string(&id).unwrap();
        let rt: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, rt);

        let tag = ActionTag(5);
        let json = serde_json::to_string(&tag).unwrap();
        let rt: ActionTag = serde_json::from_str(&json).unwrap();
        assert_eq!(tag, rt);
    }
}
