//! Event channel between the actuator process and the engine.
//!
//! Reports from the actuator (command acknowledgements, lift load, object
//! deletions) are published here once per engine tick, strictly before any
//! action is updated, so by the time an action polls its subscription all
//! events for the tick are already visible.
//!
//! Subscriptions are scoped handles: dropping one unsubscribes. There are
//! no callbacks — each subscription owns a mailbox that the subscriber
//! drains, so the correlation between a sent command and its later
//! acknowledgement is an explicit query by tag, never a closure over
//! action state.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

use crate::types::{ActionTag, AnimTag, MotorActionId, ObjectId};

/// A report delivered from the actuator process or world model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotEvent {
    /// A motor command (turn, head, lift) was accepted by the actuator.
    MotorAck { motor_action: MotorActionId },
    /// A dock command was acknowledged.
    DockAck { tag: ActionTag, started: bool },
    /// The lift began its post-dock motion (triggers the get-out clip).
    MovingLiftPostDock { tag: ActionTag },
    /// Result of the lift load sensor check after a pickup.
    LiftLoad { has_load: bool },
    /// The world model deleted an object out from under everyone.
    ObjectDeleted { object: ObjectId },
    /// An animation finished playing.
    AnimationEnded { anim: AnimTag },
}

/// Key used to route events to subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MotorAck,
    DockAck,
    MovingLiftPostDock,
    LiftLoad,
    ObjectDeleted,
    AnimationEnded,
}

impl RobotEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RobotEvent::MotorAck { .. } => EventKind::MotorAck,
            RobotEvent::DockAck { .. } => EventKind::DockAck,
            RobotEvent::MovingLiftPostDock { .. } => EventKind::MovingLiftPostDock,
            RobotEvent::LiftLoad { .. } => EventKind::LiftLoad,
            RobotEvent::ObjectDeleted { .. } => EventKind::ObjectDeleted,
            RobotEvent::AnimationEnded { .. } => EventKind::AnimationEnded,
        }
    }
}

type Mailbox = Arc<Mutex<VecDeque<RobotEvent>>>;
type Registry = Mutex<HashMap<Uuid, (EventKind, Mailbox)>>;

/// Publish/subscribe bus keyed by [`EventKind`].
#[derive(Clone, Default)]
pub struct EventChannel {
    registry: Arc<Registry>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one kind of event. The returned handle unsubscribes on
    /// drop.
    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        let mailbox: Mailbox = Arc::new(Mutex::new(VecDeque::new()));
        let id = Uuid::new_v4();
        self.registry
            .lock()
            .expect("event registry poisoned")
            .insert(id, (kind, Arc::clone(&mailbox)));
        Subscription {
            id,
            mailbox,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event into every matching subscription's mailbox.
    pub fn publish(&self, event: RobotEvent) {
        let kind = event.kind();
        let registry = self.registry.lock().expect("event registry poisoned");
        for (sub_kind, mailbox) in registry.values() {
            if *sub_kind == kind {
                mailbox
                    .lock()
                    .expect("event mailbox poisoned")
                    .push_back(event.clone());
            }
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().expect("event registry poisoned").len()
    }
}

/// Scoped subscription handle owning a mailbox of pending events.
pub struct Subscription {
    id: Uuid,
    mailbox: Mailbox,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Take every pending event.
    pub fn drain(&self) -> Vec<RobotEvent> {
        self.mailbox
            .lock()
            .expect("event mailbox poisoned")
            .drain(..)
            .collect()
    }

    /// Take pending events, returning whether any satisfied `pred`.
    /// Non-matching events are discarded along with matching ones; a
    /// subscription is scoped to a single consumer.
    pub fn drain_any(&self, pred: impl Fn(&RobotEvent) -> bool) -> bool {
        self.drain().iter().any(|e| pred(e))
    }

    /// Peek at the most recent pending event without consuming.
    pub fn latest(&self) -> Option<RobotEvent> {
        self.mailbox
            .lock()
            .expect("event mailbox poisoned")
            .back()
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.lock().expect("event mailbox poisoned").is_empty()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .expect("event registry poisoned")
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_reaches_matching_subscription() {
        let channel = EventChannel::new();
        let sub = channel.subscribe(EventKind::LiftLoad);

        channel.publish(RobotEvent::LiftLoad { has_load: true });
        let events = sub.drain();
        assert_eq!(events, vec![RobotEvent::LiftLoad { has_load: true }]);
        assert!(sub.is_empty());
    }

    #[test]
    fn test_publish_skips_other_kinds() {
        let channel = EventChannel::new();
        let sub = channel.subscribe(EventKind::DockAck);

        channel.publish(RobotEvent::LiftLoad { has_load: false });
        assert!(sub.is_empty());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let channel = EventChannel::new();
        let sub = channel.subscribe(EventKind::MotorAck);
        assert_eq!(channel.subscriber_count(), 1);
        drop(sub);
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[test]
    fn test_drain_any_matches_by_tag() {
        let channel = EventChannel::new();
        let sub = channel.subscribe(EventKind::MotorAck);

        channel.publish(RobotEvent::MotorAck {
            motor_action: MotorActionId(7),
        });
        channel.publish(RobotEvent::MotorAck {
            motor_action: MotorActionId(9),
        });

        let matched = sub.drain_any(|e| {
            matches!(e, RobotEvent::MotorAck { motor_action } if *motor_action == MotorActionId(9))
        });
        assert!(matched);
        // Drained; a second query finds nothing.
        assert!(!sub.drain_any(|_| true));
    }

    #[test]
    fn test_multiple_subscribers_each_get_a_copy() {
        let channel = EventChannel::new();
        let a = channel.subscribe(EventKind::ObjectDeleted);
        let b = channel.subscribe(EventKind::ObjectDeleted);

        channel.publish(RobotEvent::ObjectDeleted {
            object: ObjectId(3),
        });
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn test_latest_does_not_consume() {
        let channel = EventChannel::new();
        let sub = channel.subscribe(EventKind::LiftLoad);
        channel.publish(RobotEvent::LiftLoad { has_load: false });
        channel.publish(RobotEvent::LiftLoad { has_load: true });

        assert_eq!(sub.latest(), Some(RobotEvent::LiftLoad { has_load: true }));
        assert_eq!(sub.drain().len(), 2);
    }

    #[test]
    fn test_event_kind_mapping() {
        assert_eq!(
            RobotEvent::AnimationEnded { anim: AnimTag(1) }.kind(),
            EventKind::AnimationEnded
        );
        assert_eq!(
            RobotEvent::DockAck {
                tag: ActionTag(1),
                started: true
            }
            .kind(),
            EventKind::DockAck
        );
    }

    #[test]
    fn test_event_serde_round_trip() {
        let event = RobotEvent::DockAck {
            tag: ActionTag(11),
            started: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        let rt: RobotEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, rt);
    }
}
