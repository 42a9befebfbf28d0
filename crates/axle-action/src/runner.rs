//! The action lifecycle contract and its externally driven runner.
//!
//! An [`Action`] supplies the three hooks (`init`, `check_if_done`,
//! `on_cancel`); the [`ActionRunner`] owns everything else: state caching,
//! track locking, timeout enforcement, the retry budget, and completion
//! telemetry. Neither side ever blocks — work that takes real time happens
//! in the actuator process and is observed through the event channel.

use tracing::{debug, info, warn};

use axle_core::config::FrameworkConfig;
use axle_core::result::{ActionResult, ResultCategory};
use axle_core::types::{ActionTag, Tracks};

use crate::context::RobotCtx;

/// A polling, cancelable unit of robot task execution.
///
/// Contract:
/// - `init` validates preconditions and optionally issues the first
///   command. `Success` means the action is already done (trivial case,
///   e.g. a zero-distance drive); `Running` means a command was issued and
///   polling should begin; any failure is terminal.
/// - `check_if_done` is called once per tick while running. It polls
///   robot-reported state and subscription mailboxes and returns `Running`
///   until a completion condition is met.
/// - `on_cancel` must synchronously release actuator-side holds (abort
///   in-flight paths or dock commands, cancel sub-actions). Track unlocking
///   is the runner's job.
pub trait Action: Send {
    fn name(&self) -> &str;

    /// Tracks this action locks for its whole run.
    fn tracks(&self) -> Tracks;

    /// Seconds before the framework force-fails the action. Overridable
    /// per action (e.g. scaled by expected travel time).
    fn timeout_s(&self, config: &FrameworkConfig) -> f32 {
        config.action.default_timeout_s
    }

    /// Delay before the first `init` call.
    fn start_delay_s(&self) -> f32 {
        0.0
    }

    /// Delay between a successful `init` and the first `check_if_done`.
    fn poll_delay_s(&self) -> f32 {
        0.0
    }

    fn init(&mut self, ctx: &mut RobotCtx) -> ActionResult;

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult;

    fn on_cancel(&mut self, _ctx: &mut RobotCtx) {}

    /// Called when the runner consumes a retry: clear per-attempt state so
    /// the next `init` starts clean.
    fn on_reset(&mut self, _ctx: &mut RobotCtx) {}
}

/// Drives one [`Action`] through its lifecycle.
pub struct ActionRunner {
    action: Box<dyn Action>,
    tag: ActionTag,
    state: ActionResult,
    start_time_s: f32,
    initialized: bool,
    retries_remaining: u8,
    suppress_track_locking: bool,
    completion_recorded: bool,
}

impl ActionRunner {
    /// Wrap an action, allocating it a unique correlation tag.
    pub fn new(ctx: &mut RobotCtx, action: Box<dyn Action>) -> Self {
        let tag = ctx.tags.allocate();
        Self {
            action,
            tag,
            state: ActionResult::NotStarted,
            start_time_s: -1.0,
            initialized: false,
            retries_remaining: ctx.config.action.default_num_retries,
            suppress_track_locking: false,
            completion_recorded: false,
        }
    }

    pub fn tag(&self) -> ActionTag {
        self.tag
    }

    pub fn name(&self) -> &str {
        self.action.name()
    }

    pub fn state(&self) -> ActionResult {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn has_started(&self) -> bool {
        self.state != ActionResult::NotStarted
    }

    /// How many retry-category failures may be absorbed before failing out.
    pub fn set_num_retries(&mut self, retries: u8) {
        self.retries_remaining = retries;
    }

    /// Children of compounds run under the parent's already-acquired
    /// locks; they suppress their own locking.
    pub fn suppress_track_locking(&mut self, suppress: bool) {
        if self.has_started() {
            warn!(tag = %self.tag, "Cannot change track locking after start");
            return;
        }
        self.suppress_track_locking = suppress;
    }

    pub fn is_suppressing_track_locking(&self) -> bool {
        self.suppress_track_locking
    }

    /// Seconds since the first update, or zero before it.
    pub fn run_time_s(&self, ctx: &RobotCtx) -> f32 {
        if self.start_time_s < 0.0 {
            0.0
        } else {
            ctx.time_s - self.start_time_s
        }
    }

    /// Tick the action once. Idempotent after a terminal result: the cached
    /// result is returned without re-invoking anything.
    pub fn update(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if self.state.is_terminal() {
            return self.state;
        }

        if self.state == ActionResult::NotStarted {
            if !self.suppress_track_locking {
                let tracks = self.action.tracks();
                if !ctx.locks.lock(tracks, self.tag) {
                    warn!(tag = %self.tag, name = self.action.name(), %tracks,
                          "Not running: required tracks are locked");
                    self.finish(ctx, ActionResult::TracksLocked);
                    return self.state;
                }
            }
            self.state = ActionResult::Running;
            debug!(tag = %self.tag, name = self.action.name(), "Action running");
        }

        let result = self.update_internal(ctx);

        if result.is_terminal() {
            self.finish(ctx, result);
        }
        self.state
    }

    fn update_internal(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        let now = ctx.time_s;
        if self.start_time_s < 0.0 {
            self.start_time_s = now;
        }

        // Timeout is enforced here, not by the action, and is measured in
        // engine time since the first update regardless of tick count.
        let timeout_at = self.start_time_s + self.action.timeout_s(&ctx.config);
        let mut result = if now >= timeout_at {
            warn!(tag = %self.tag, name = self.action.name(),
                  timeout_s = self.action.timeout_s(&ctx.config),
                  "Action timed out");
            ActionResult::Timeout
        } else {
            self.poll(ctx, now)
        };

        if result.category() == ResultCategory::Retry && self.retries_remaining > 0 {
            self.retries_remaining -= 1;
            info!(tag = %self.tag, name = self.action.name(), %result,
                  remaining = self.retries_remaining, "Action failed, retrying");
            // Keep tracks locked across the retry; restart timing and init.
            self.start_time_s = -1.0;
            self.initialized = false;
            self.action.on_reset(ctx);
            result = ActionResult::Running;
        }
        result
    }

    fn poll(&mut self, ctx: &mut RobotCtx, now: f32) -> ActionResult {
        let wait_until = self.start_time_s
            + self.action.start_delay_s()
            + if self.initialized {
                self.action.poll_delay_s()
            } else {
                0.0
            };
        if now < wait_until {
            return ActionResult::Running;
        }

        if !self.initialized {
            let result = self.action.init(ctx);
            match result {
                // Trivial action: initialization alone completed it.
                ActionResult::Success => return ActionResult::Success,
                ActionResult::Running => {
                    self.initialized = true;
                    // Fall through to the first poll on the same tick
                    // (unless a poll delay pushes it out) so a whole tick
                    // is not wasted.
                    if now < self.start_time_s + self.action.start_delay_s() + self.action.poll_delay_s()
                    {
                        return ActionResult::Running;
                    }
                }
                failure => return failure,
            }
        }

        self.action.check_if_done(ctx)
    }

    fn finish(&mut self, ctx: &mut RobotCtx, result: ActionResult) {
        self.state = result;
        self.unlock_tracks(ctx);
        if !self.completion_recorded {
            self.completion_recorded = true;
            ctx.record_completion(self.tag, self.action.name(), result);
        }
        ctx.tags.release(self.tag);
    }

    fn unlock_tracks(&mut self, ctx: &mut RobotCtx) {
        if !self.suppress_track_locking && self.has_started() {
            ctx.locks.unlock(self.action.tracks(), self.tag);
        }
        // Belt and braces: nothing of ours may stay locked.
        let leftover = ctx.locks.held_by(self.tag);
        if !leftover.is_empty() {
            warn!(tag = %self.tag, tracks = %leftover, "Tracks still locked at completion");
            ctx.locks.unlock(leftover, self.tag);
        }
    }

    /// Cancel the action. Synchronously releases locked tracks and tells
    /// the action to release actuator-side holds; afterwards `update` is a
    /// no-op returning `Cancelled`.
    pub fn cancel(&mut self, ctx: &mut RobotCtx) {
        if self.state.is_terminal() {
            return;
        }
        if self.state == ActionResult::Running {
            self.action.on_cancel(ctx);
        }
        self.finish(ctx, ActionResult::Cancelled);
    }

    /// Reset to not-started for a fresh attempt (compound retry path).
    pub(crate) fn reset(&mut self, ctx: &mut RobotCtx, unlock_tracks: bool) {
        if unlock_tracks {
            self.unlock_tracks(ctx);
        }
        self.state = ActionResult::NotStarted;
        self.start_time_s = -1.0;
        self.initialized = false;
        self.completion_recorded = false;
        self.action.on_reset(ctx);
    }

    /// Borrow the inner action (for compound bookkeeping such as proxy
    /// name reporting).
    pub(crate) fn action(&self) -> &dyn Action {
        self.action.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRig;
    use axle_core::types::Track;

    /// Scripted action for exercising the runner.
    struct ScriptedAction {
        name: String,
        tracks: Tracks,
        init_result: ActionResult,
        poll_results: Vec<ActionResult>,
        poll_index: usize,
        init_calls: u32,
        poll_calls: u32,
        cancelled: bool,
        timeout_s: f32,
    }

    impl ScriptedAction {
        fn new(init: ActionResult, polls: Vec<ActionResult>) -> Self {
            Self {
                name: "Scripted".to_string(),
                tracks: Tracks::BODY,
                init_result: init,
                poll_results: polls,
                poll_index: 0,
                init_calls: 0,
                poll_calls: 0,
                cancelled: false,
                timeout_s: 30.0,
            }
        }
    }

    impl Action for ScriptedAction {
        fn name(&self) -> &str {
            &self.name
        }
        fn tracks(&self) -> Tracks {
            self.tracks
        }
        fn timeout_s(&self, _config: &FrameworkConfig) -> f32 {
            self.timeout_s
        }
        fn init(&mut self, _ctx: &mut RobotCtx) -> ActionResult {
            self.init_calls += 1;
            self.init_result
        }
        fn check_if_done(&mut self, _ctx: &mut RobotCtx) -> ActionResult {
            self.poll_calls += 1;
            let result = self
                .poll_results
                .get(self.poll_index)
                .copied()
                .unwrap_or(ActionResult::Running);
            if self.poll_index + 1 < self.poll_results.len() {
                self.poll_index += 1;
            }
            result
        }
        fn on_cancel(&mut self, _ctx: &mut RobotCtx) {
            self.cancelled = true;
        }
        fn on_reset(&mut self, _ctx: &mut RobotCtx) {
            self.poll_index = 0;
        }
    }

    #[test]
    fn test_trivial_init_success_completes_action() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Success, vec![]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Success);
        assert!(runner.is_terminal());
    }

    #[test]
    fn test_init_running_polls_same_tick() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(
            ActionResult::Running,
            vec![ActionResult::Running, ActionResult::Success],
        );
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        // First tick: init + first poll happen together.
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Running);
        rig.tick();
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Success);
    }

    #[test]
    fn test_idempotent_terminal_state() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Running, vec![ActionResult::Success]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        runner.update(&mut rig.ctx);
        assert_eq!(runner.state(), ActionResult::Success);

        // Terminal results are cached: no further init/poll calls.
        for _ in 0..3 {
            rig.tick();
            assert_eq!(runner.update(&mut rig.ctx), ActionResult::Success);
        }
    }

    #[test]
    fn test_init_failure_is_terminal() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::BadObject, vec![]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        assert_eq!(runner.update(&mut rig.ctx), ActionResult::BadObject);
        assert!(runner.is_terminal());
    }

    #[test]
    fn test_tracks_locked_while_running_released_on_completion() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(
            ActionResult::Running,
            vec![ActionResult::Running, ActionResult::Success],
        );
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        runner.update(&mut rig.ctx);
        assert_eq!(rig.ctx.locks.owner(Track::Body), Some(runner.tag()));

        rig.tick();
        runner.update(&mut rig.ctx);
        assert_eq!(rig.ctx.locks.owner(Track::Body), None);
    }

    #[test]
    fn test_track_contention_fails_second_action() {
        let mut rig = TestRig::new();
        let first = ScriptedAction::new(ActionResult::Running, vec![ActionResult::Running]);
        let mut first_runner = ActionRunner::new(&mut rig.ctx, Box::new(first));
        first_runner.update(&mut rig.ctx);

        let second = ScriptedAction::new(ActionResult::Running, vec![ActionResult::Running]);
        let mut second_runner = ActionRunner::new(&mut rig.ctx, Box::new(second));
        assert_eq!(second_runner.update(&mut rig.ctx), ActionResult::TracksLocked);
    }

    #[test]
    fn test_cancel_releases_tracks_and_is_idempotent() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Running, vec![ActionResult::Running]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));
        runner.update(&mut rig.ctx);

        runner.cancel(&mut rig.ctx);
        assert_eq!(runner.state(), ActionResult::Cancelled);
        assert_eq!(rig.ctx.locks.owner(Track::Body), None);

        // A subsequent update is a no-op.
        rig.tick();
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Cancelled);
    }

    #[test]
    fn test_cancel_before_start_does_not_call_on_cancel() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Running, vec![]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));
        runner.cancel(&mut rig.ctx);
        assert_eq!(runner.state(), ActionResult::Cancelled);
    }

    #[test]
    fn test_timeout_force_fails_without_polling() {
        let mut rig = TestRig::new();
        let mut action = ScriptedAction::new(ActionResult::Running, vec![ActionResult::Running]);
        action.timeout_s = 1.0;
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        runner.update(&mut rig.ctx);
        rig.advance(2.0);
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Timeout);
    }

    #[test]
    fn test_retry_budget_consumes_retry_failures() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(
            ActionResult::Running,
            vec![ActionResult::FailedTraversingPath],
        );
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));
        runner.set_num_retries(1);

        // First failure consumed by the retry budget.
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Running);
        // Second failure is terminal.
        rig.tick();
        assert_eq!(
            runner.update(&mut rig.ctx),
            ActionResult::FailedTraversingPath
        );
    }

    #[test]
    fn test_abort_failures_ignore_retry_budget() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Running, vec![ActionResult::BadObject]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));
        runner.set_num_retries(3);

        assert_eq!(runner.update(&mut rig.ctx), ActionResult::BadObject);
    }

    #[test]
    fn test_completion_telemetry_recorded_once() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Running, vec![ActionResult::Success]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));

        runner.update(&mut rig.ctx);
        rig.tick();
        runner.update(&mut rig.ctx);

        let records = rig.ctx.completions();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].result, ActionResult::Success);
        assert_eq!(records[0].name, "Scripted");
    }

    #[test]
    fn test_suppressed_locking_leaves_locks_alone() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Running, vec![ActionResult::Success]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));
        runner.suppress_track_locking(true);

        runner.update(&mut rig.ctx);
        assert_eq!(rig.ctx.locks.owner(Track::Body), None);
    }

    #[test]
    fn test_tag_released_after_completion() {
        let mut rig = TestRig::new();
        let action = ScriptedAction::new(ActionResult::Success, vec![]);
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(action));
        let tag = runner.tag();
        runner.update(&mut rig.ctx);
        assert!(!rig.ctx.tags.is_in_use(tag));
    }
}
