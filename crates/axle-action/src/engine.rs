//! The engine tick loop: pump actuator reports, then update actions.
//!
//! Scheduling is single-threaded cooperative polling. All asynchronous
//! events for a tick are published to the event channel strictly before
//! any action's `update` runs, so subscription mailboxes already reflect
//! them by the time `check_if_done` polls.

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use axle_core::result::ActionResult;
use axle_core::types::ActionTag;

use crate::context::RobotCtx;
use crate::runner::ActionRunner;

/// The set of concurrently running top-level actions. Track mutual
/// exclusion between them is enforced by the runners' lock acquisition: a
/// newcomer whose tracks are taken fails with `TracksLocked`.
#[derive(Default)]
pub struct ActionList {
    runners: Vec<ActionRunner>,
}

impl ActionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a runner to be ticked. Returns its tag for later cancellation.
    pub fn queue(&mut self, runner: ActionRunner) -> ActionTag {
        let tag = runner.tag();
        debug!(%tag, name = runner.name(), "Queued action");
        self.runners.push(runner);
        tag
    }

    /// Tick every runner once; completed runners are removed (their
    /// completion records live on in the context).
    pub fn update_all(&mut self, ctx: &mut RobotCtx) {
        for runner in &mut self.runners {
            runner.update(ctx);
        }
        self.runners.retain(|r| !r.is_terminal());
    }

    /// Cancel a queued action by tag. Returns false if no such action.
    pub fn cancel(&mut self, ctx: &mut RobotCtx, tag: ActionTag) -> bool {
        let Some(index) = self.runners.iter().position(|r| r.tag() == tag) else {
            return false;
        };
        self.runners[index].cancel(ctx);
        self.runners.remove(index);
        true
    }

    /// Cancel everything (e.g. on behavior switch).
    pub fn cancel_all(&mut self, ctx: &mut RobotCtx) {
        for runner in &mut self.runners {
            runner.cancel(ctx);
        }
        self.runners.clear();
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    pub fn contains(&self, tag: ActionTag) -> bool {
        self.runners.iter().any(|r| r.tag() == tag)
    }

    pub fn state_of(&self, tag: ActionTag) -> Option<ActionResult> {
        self.runners
            .iter()
            .find(|r| r.tag() == tag)
            .map(|r| r.state())
    }
}

/// Drives the action list at the configured tick rate until shut down.
pub struct Engine {
    pub actions: ActionList,
    shutdown: Arc<Notify>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            actions: ActionList::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// One engine tick: pump actuator reports into the event channel,
    /// advance engine time, update every action.
    pub fn tick_once(ctx: &mut RobotCtx, actions: &mut ActionList) {
        let reports = ctx.actuator.drain_reports();
        for event in reports {
            ctx.events.publish(event);
        }
        let dt = 1.0 / ctx.config.engine.tick_hz.max(1.0);
        ctx.advance_time(dt);
        actions.update_all(ctx);
    }

    /// Run the tick loop. Returns on shutdown signal.
    pub async fn run(&mut self, ctx: &mut RobotCtx) {
        let dt = 1.0 / ctx.config.engine.tick_hz.max(1.0);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs_f32(dt));
        let shutdown = Arc::clone(&self.shutdown);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    Self::tick_once(ctx, &mut self.actions);
                }
                _ = shutdown.notified() => {
                    return; // Graceful shutdown
                }
            }
        }
    }

    /// Signal the engine to shut down gracefully.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingAction, TestRig};
    use axle_core::event::{EventKind, RobotEvent};
    use axle_core::types::{MotorActionId, Tracks};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_reports_pumped_before_updates() {
        let mut rig = TestRig::new();
        let sub = rig.ctx.events.subscribe(EventKind::MotorAck);
        rig.push_report(RobotEvent::MotorAck {
            motor_action: MotorActionId(3),
        });

        let mut actions = ActionList::new();
        Engine::tick_once(&mut rig.ctx, &mut actions);

        // The report reached subscribers during the pump step.
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn test_action_list_removes_completed() {
        let mut rig = TestRig::new();
        let (action, _) = CountingAction::succeeding_after(2);
        let runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        let mut actions = ActionList::new();
        let tag = actions.queue(runner);
        assert_eq!(actions.len(), 1);

        Engine::tick_once(&mut rig.ctx, &mut actions);
        assert!(actions.contains(tag));
        Engine::tick_once(&mut rig.ctx, &mut actions);
        assert!(!actions.contains(tag));
        assert!(actions.is_empty());

        let records = rig.ctx.completions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, ActionResult::Success);
    }

    #[test]
    fn test_concurrent_actions_with_disjoint_tracks_both_run() {
        let mut rig = TestRig::new();
        let (head, head_counts) = CountingAction::with_tracks(Tracks::HEAD, 3);
        let (body, body_counts) = CountingAction::with_tracks(Tracks::BODY, 3);

        let mut actions = ActionList::new();
        actions.queue(ActionRunner::new(&mut rig.ctx, Box::new(head)));
        actions.queue(ActionRunner::new(&mut rig.ctx, Box::new(body)));

        Engine::tick_once(&mut rig.ctx, &mut actions);
        assert_eq!(head_counts.poll_calls.load(Ordering::SeqCst), 1);
        assert_eq!(body_counts.poll_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conflicting_tracks_fail_second_action() {
        let mut rig = TestRig::new();
        let (first, _) = CountingAction::with_tracks(Tracks::BODY, 10);
        let (second, second_counts) = CountingAction::with_tracks(Tracks::BODY, 10);

        let mut actions = ActionList::new();
        actions.queue(ActionRunner::new(&mut rig.ctx, Box::new(first)));
        let second_tag = actions.queue(ActionRunner::new(&mut rig.ctx, Box::new(second)));

        Engine::tick_once(&mut rig.ctx, &mut actions);
        // The second action never got to run and is gone.
        assert!(!actions.contains(second_tag));
        assert_eq!(second_counts.init_calls.load(Ordering::SeqCst), 0);
        let failed = rig
            .ctx
            .completions()
            .iter()
            .find(|r| r.tag == second_tag)
            .unwrap();
        assert_eq!(failed.result, ActionResult::TracksLocked);
    }

    #[test]
    fn test_cancel_by_tag() {
        let mut rig = TestRig::new();
        let (action, counts) = CountingAction::succeeding_after(100);
        let runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        let mut actions = ActionList::new();
        let tag = actions.queue(runner);
        Engine::tick_once(&mut rig.ctx, &mut actions);

        assert!(actions.cancel(&mut rig.ctx, tag));
        assert_eq!(counts.cancel_calls.load(Ordering::SeqCst), 1);
        assert!(actions.is_empty());
        assert!(!actions.cancel(&mut rig.ctx, tag));
    }

    #[test]
    fn test_cancel_all() {
        let mut rig = TestRig::new();
        let (a, a_counts) = CountingAction::with_tracks(Tracks::HEAD, 100);
        let (b, b_counts) = CountingAction::with_tracks(Tracks::BODY, 100);

        let mut actions = ActionList::new();
        actions.queue(ActionRunner::new(&mut rig.ctx, Box::new(a)));
        actions.queue(ActionRunner::new(&mut rig.ctx, Box::new(b)));
        Engine::tick_once(&mut rig.ctx, &mut actions);

        actions.cancel_all(&mut rig.ctx);
        assert_eq!(a_counts.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_counts.cancel_calls.load(Ordering::SeqCst), 1);
        assert!(!rig.ctx.locks.are_any_locked(Tracks::ALL));
    }

    #[tokio::test]
    async fn test_engine_shutdown() {
        let mut rig = TestRig::new();
        let mut engine = Engine::new();

        engine.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), engine.run(&mut rig.ctx))
            .await
            .expect("Engine should shut down within timeout");
    }

    #[tokio::test]
    async fn test_engine_runs_actions_until_shutdown() {
        let mut rig = TestRig::new();
        let mut engine = Engine::new();
        let (action, counts) = CountingAction::succeeding_after(2);
        engine
            .actions
            .queue(ActionRunner::new(&mut rig.ctx, Box::new(action)));

        // Run a few ticks manually, then confirm the loop honors shutdown.
        Engine::tick_once(&mut rig.ctx, &mut engine.actions);
        Engine::tick_once(&mut rig.ctx, &mut engine.actions);
        assert!(counts.poll_calls.load(Ordering::SeqCst) >= 2);

        engine.shutdown();
        tokio::time::timeout(std::time::Duration::from_secs(2), engine.run(&mut rig.ctx))
            .await
            .expect("Engine should shut down within timeout");
    }
}
