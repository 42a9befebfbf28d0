//! Compound actions: groups of actions run in series or in parallel.
//!
//! A compound owns its children by value (a `Vec` of runners); nothing
//! outside the compound holds a pointer to a child. Each child may carry a
//! predicate deciding whether its failure is ignorable; an ignored failure
//! advances the group like a success but is retained for bookkeeping.

use tracing::{debug, info};

use axle_core::config::FrameworkConfig;
use axle_core::result::{ActionResult, ResultCategory};
use axle_core::types::Tracks;

use crate::context::RobotCtx;
use crate::runner::{Action, ActionRunner};

/// Predicate evaluated against a child's terminal result.
pub type IgnoreFailure = Box<dyn Fn(ActionResult) -> bool + Send>;

struct ChildSlot {
    runner: ActionRunner,
    ignore: Option<IgnoreFailure>,
}

impl ChildSlot {
    fn should_ignore(&self, result: ActionResult) -> bool {
        match &self.ignore {
            Some(pred) => pred(result),
            None => false,
        }
    }
}

fn add_child(
    children: &mut Vec<ChildSlot>,
    ctx: &mut RobotCtx,
    action: Box<dyn Action>,
    ignore: Option<IgnoreFailure>,
) -> usize {
    let mut runner = ActionRunner::new(ctx, action);
    // Children run under the compound's locks.
    runner.suppress_track_locking(true);
    children.push(ChildSlot { runner, ignore });
    children.len() - 1
}

fn union_tracks(children: &[ChildSlot]) -> Tracks {
    children
        .iter()
        .fold(Tracks::NONE, |acc, c| acc.union(c.runner.action().tracks()))
}

// =============================================================================
// Sequential
// =============================================================================

/// Runs children one at a time, in order. Exactly one child is ever
/// active; a later child's `init` is not called until every earlier child
/// reached a terminal (or ignored-failure) state.
pub struct SequentialAction {
    name: String,
    children: Vec<ChildSlot>,
    cursor: usize,
    delay_between_s: f32,
    wait_until_s: f32,
    last_ignored_failure: Option<ActionResult>,
    proxy: Option<usize>,
}

impl SequentialAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            cursor: 0,
            delay_between_s: 0.0,
            wait_until_s: -1.0,
            last_ignored_failure: None,
            proxy: None,
        }
    }

    /// Append a child; ownership transfers to the compound. Returns the
    /// child's index for proxy designation.
    pub fn add(&mut self, ctx: &mut RobotCtx, action: Box<dyn Action>) -> usize {
        add_child(&mut self.children, ctx, action, None)
    }

    pub fn add_with_ignore(
        &mut self,
        ctx: &mut RobotCtx,
        action: Box<dyn Action>,
        ignore: IgnoreFailure,
    ) -> usize {
        add_child(&mut self.children, ctx, action, Some(ignore))
    }

    /// Fixed delay between one child finishing and the next starting.
    pub fn set_delay_between(&mut self, seconds: f32) {
        self.delay_between_s = seconds;
    }

    /// Designate the child whose name/result callers should see.
    pub fn set_proxy(&mut self, index: usize) {
        self.proxy = Some(index);
    }

    /// The failure most recently absorbed by an ignore predicate, kept for
    /// "did a step fail" queries.
    pub fn last_ignored_failure(&self) -> Option<ActionResult> {
        self.last_ignored_failure
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Terminal result of the proxy child, if one is set and finished.
    pub fn proxy_result(&self) -> Option<ActionResult> {
        let idx = self.proxy?;
        let runner = &self.children.get(idx)?.runner;
        runner.is_terminal().then(|| runner.state())
    }

    fn advance(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        self.cursor += 1;
        if self.cursor >= self.children.len() {
            return ActionResult::Success;
        }
        if self.delay_between_s > 0.0 {
            self.wait_until_s = ctx.time_s + self.delay_between_s;
            return ActionResult::Running;
        }

        // Tick the new child immediately so a full engine tick is not
        // wasted between children.
        let child = &mut self.children[self.cursor];
        debug!(name = child.runner.name(), "Sequential moving to next child");
        let result = child.runner.update(ctx);
        match result.category() {
            ResultCategory::Running => ActionResult::Running,
            ResultCategory::Success => {
                self.cursor += 1;
                if self.cursor >= self.children.len() {
                    ActionResult::Success
                } else {
                    ActionResult::Running
                }
            }
            _ => {
                if self.children[self.cursor].should_ignore(result) {
                    self.last_ignored_failure = Some(result);
                    self.cursor += 1;
                    if self.cursor >= self.children.len() {
                        ActionResult::Success
                    } else {
                        ActionResult::Running
                    }
                } else {
                    result
                }
            }
        }
    }
}

impl Action for SequentialAction {
    fn name(&self) -> &str {
        match self.proxy.and_then(|i| self.children.get(i)) {
            Some(child) => child.runner.name(),
            None => &self.name,
        }
    }

    fn tracks(&self) -> Tracks {
        union_tracks(&self.children)
    }

    fn timeout_s(&self, config: &FrameworkConfig) -> f32 {
        // The compound outlives each child's own timeout; children enforce
        // theirs through their runners.
        config.action.default_timeout_s * (self.children.len().max(1) as f32)
    }

    fn init(&mut self, _ctx: &mut RobotCtx) -> ActionResult {
        if self.children.is_empty() {
            ActionResult::Success
        } else {
            ActionResult::Running
        }
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        if self.cursor >= self.children.len() {
            return ActionResult::Success;
        }
        if self.wait_until_s >= 0.0 && ctx.time_s < self.wait_until_s {
            return ActionResult::Running;
        }
        self.wait_until_s = -1.0;

        let child = &mut self.children[self.cursor];
        let result = child.runner.update(ctx);
        match result.category() {
            ResultCategory::Running => ActionResult::Running,
            ResultCategory::Success => self.advance(ctx),
            _ => {
                if self.children[self.cursor].should_ignore(result) {
                    info!(%result, "Sequential ignoring child failure");
                    self.last_ignored_failure = Some(result);
                    self.advance(ctx)
                } else {
                    result
                }
            }
        }
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        // Depth-first: the active child releases its holds before the
        // compound reports terminal. Un-started children have nothing to
        // release.
        if let Some(child) = self.children.get_mut(self.cursor) {
            child.runner.cancel(ctx);
        }
    }

    fn on_reset(&mut self, ctx: &mut RobotCtx) {
        self.cursor = 0;
        self.wait_until_s = -1.0;
        self.last_ignored_failure = None;
        for child in &mut self.children {
            child.runner.reset(ctx, false);
        }
    }
}

// =============================================================================
// Parallel
// =============================================================================

/// Runs all children concurrently. Done when all children are done; a
/// single non-ignored failure fails the group and cancels the rest.
pub struct ParallelAction {
    name: String,
    children: Vec<ChildSlot>,
    end_when_first_completes: bool,
    last_ignored_failure: Option<ActionResult>,
    proxy: Option<usize>,
}

impl ParallelAction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            children: Vec::new(),
            end_when_first_completes: false,
            last_ignored_failure: None,
            proxy: None,
        }
    }

    pub fn add(&mut self, ctx: &mut RobotCtx, action: Box<dyn Action>) -> usize {
        add_child(&mut self.children, ctx, action, None)
    }

    pub fn add_with_ignore(
        &mut self,
        ctx: &mut RobotCtx,
        action: Box<dyn Action>,
        ignore: IgnoreFailure,
    ) -> usize {
        add_child(&mut self.children, ctx, action, Some(ignore))
    }

    /// End the group the moment any child ends, instead of waiting for the
    /// longest.
    pub fn set_end_when_first_completes(&mut self, end: bool) {
        self.end_when_first_completes = end;
    }

    pub fn set_proxy(&mut self, index: usize) {
        self.proxy = Some(index);
    }

    pub fn last_ignored_failure(&self) -> Option<ActionResult> {
        self.last_ignored_failure
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn proxy_result(&self) -> Option<ActionResult> {
        let idx = self.proxy?;
        let runner = &self.children.get(idx)?.runner;
        runner.is_terminal().then(|| runner.state())
    }

    fn cancel_running_children(&mut self, ctx: &mut RobotCtx) {
        for child in &mut self.children {
            if !child.runner.is_terminal() {
                child.runner.cancel(ctx);
            }
        }
    }
}

impl Action for ParallelAction {
    fn name(&self) -> &str {
        match self.proxy.and_then(|i| self.children.get(i)) {
            Some(child) => child.runner.name(),
            None => &self.name,
        }
    }

    fn tracks(&self) -> Tracks {
        union_tracks(&self.children)
    }

    fn init(&mut self, _ctx: &mut RobotCtx) -> ActionResult {
        if self.children.is_empty() {
            ActionResult::Success
        } else {
            ActionResult::Running
        }
    }

    fn check_if_done(&mut self, ctx: &mut RobotCtx) -> ActionResult {
        // Success unless something below is still running or fails. The
        // group reports success on the tick after the last child finishes
        // at the latest; often the same tick.
        let mut result = ActionResult::Success;

        for index in 0..self.children.len() {
            let child_result = self.children[index].runner.update(ctx);
            match child_result.category() {
                ResultCategory::Success => {
                    if self.end_when_first_completes {
                        self.cancel_running_children(ctx);
                        return child_result;
                    }
                }
                ResultCategory::Running => {
                    result = ActionResult::Running;
                }
                _ => {
                    if self.children[index].should_ignore(child_result) {
                        info!(result = %child_result, "Parallel ignoring child failure");
                        self.last_ignored_failure = Some(child_result);
                        if self.end_when_first_completes {
                            self.cancel_running_children(ctx);
                            return ActionResult::Success;
                        }
                    } else {
                        // One real failure sinks the whole group; siblings
                        // must not keep moving.
                        self.cancel_running_children(ctx);
                        return child_result;
                    }
                }
            }
        }
        result
    }

    fn on_cancel(&mut self, ctx: &mut RobotCtx) {
        self.cancel_running_children(ctx);
    }

    fn on_reset(&mut self, ctx: &mut RobotCtx) {
        self.last_ignored_failure = None;
        for child in &mut self.children {
            child.runner.reset(ctx, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingAction, TestRig};
    use std::sync::atomic::Ordering;

    fn run_to_completion(
        rig: &mut TestRig,
        runner: &mut ActionRunner,
        max_ticks: usize,
    ) -> ActionResult {
        let mut result = runner.update(&mut rig.ctx);
        let mut ticks = 0;
        while !result.is_terminal() && ticks < max_ticks {
            rig.tick();
            result = runner.update(&mut rig.ctx);
            ticks += 1;
        }
        result
    }

    // ---- Sequential ----

    #[test]
    fn test_sequential_runs_children_in_order() {
        let mut rig = TestRig::new();
        let (a, a_counts) = CountingAction::succeeding_after(1);
        let (b, b_counts) = CountingAction::succeeding_after(1);

        let mut seq = SequentialAction::new("Seq");
        seq.add(&mut rig.ctx, Box::new(a));
        seq.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(seq));

        // Tick 1: child a runs (init + poll); b untouched.
        runner.update(&mut rig.ctx);
        assert_eq!(a_counts.init_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_counts.init_calls.load(Ordering::SeqCst), 0);

        let result = run_to_completion(&mut rig, &mut runner, 10);
        assert_eq!(result, ActionResult::Success);
        assert_eq!(b_counts.init_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sequential_second_child_not_initialized_before_first_done() {
        let mut rig = TestRig::new();
        let (a, _a_counts) = CountingAction::succeeding_after(3);
        let (b, b_counts) = CountingAction::succeeding_after(1);

        let mut seq = SequentialAction::new("Seq");
        seq.add(&mut rig.ctx, Box::new(a));
        seq.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(seq));

        runner.update(&mut rig.ctx);
        rig.tick();
        runner.update(&mut rig.ctx);
        // a still running: b must not have been started.
        assert_eq!(b_counts.init_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sequential_next_child_ticked_same_tick_on_success() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::succeeding_after(1);
        let (b, b_counts) = CountingAction::succeeding_after(2);

        let mut seq = SequentialAction::new("Seq");
        seq.add(&mut rig.ctx, Box::new(a));
        seq.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(seq));

        // a finishes on the first poll; b is primed on the same tick.
        runner.update(&mut rig.ctx);
        assert_eq!(b_counts.init_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sequential_failure_stops_group() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::failing_after(1, ActionResult::BadObject);
        let (b, b_counts) = CountingAction::succeeding_after(1);

        let mut seq = SequentialAction::new("Seq");
        seq.add(&mut rig.ctx, Box::new(a));
        seq.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(seq));

        let result = run_to_completion(&mut rig, &mut runner, 10);
        assert_eq!(result, ActionResult::BadObject);
        assert_eq!(b_counts.init_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sequential_ignored_failure_advances() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::failing_after(1, ActionResult::VisualObservationFailed);
        let (b, _) = CountingAction::succeeding_after(1);

        let mut seq = SequentialAction::new("Seq");
        seq.add_with_ignore(&mut rig.ctx, Box::new(a), Box::new(|_| true));
        seq.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(seq));

        let result = run_to_completion(&mut rig, &mut runner, 10);
        assert_eq!(result, ActionResult::Success);
    }

    #[test]
    fn test_sequential_records_ignored_failure() {
        // Drive the compound directly (not through a runner) so the
        // bookkeeping stays observable.
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::failing_after(1, ActionResult::VisualObservationFailed);

        let mut seq = SequentialAction::new("Seq");
        seq.add_with_ignore(&mut rig.ctx, Box::new(a), Box::new(|_| true));

        assert_eq!(seq.init(&mut rig.ctx), ActionResult::Running);
        let mut result = seq.check_if_done(&mut rig.ctx);
        let mut guard = 0;
        while result == ActionResult::Running && guard < 10 {
            rig.tick();
            result = seq.check_if_done(&mut rig.ctx);
            guard += 1;
        }
        assert_eq!(result, ActionResult::Success);
        assert_eq!(
            seq.last_ignored_failure(),
            Some(ActionResult::VisualObservationFailed)
        );
    }

    #[test]
    fn test_sequential_empty_succeeds_immediately() {
        let mut rig = TestRig::new();
        let seq = SequentialAction::new("Empty");
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(seq));
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Success);
    }

    #[test]
    fn test_sequential_cancel_propagates_to_active_child() {
        let mut rig = TestRig::new();
        let (a, a_counts) = CountingAction::succeeding_after(10);

        let mut seq = SequentialAction::new("Seq");
        seq.add(&mut rig.ctx, Box::new(a));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(seq));
        runner.update(&mut rig.ctx);

        runner.cancel(&mut rig.ctx);
        assert_eq!(a_counts.cancel_calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.state(), ActionResult::Cancelled);
    }

    #[test]
    fn test_sequential_proxy_name() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::named("Inner", 1, None);
        let mut seq = SequentialAction::new("Wrapper");
        let idx = seq.add(&mut rig.ctx, Box::new(a));
        seq.set_proxy(idx);
        assert_eq!(seq.name(), "Inner");
    }

    // ---- Parallel ----

    #[test]
    fn test_parallel_success_when_all_succeed() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::succeeding_after(1);
        let (b, _) = CountingAction::succeeding_after(3);

        let mut par = ParallelAction::new("Par");
        par.add(&mut rig.ctx, Box::new(a));
        par.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));

        let result = run_to_completion(&mut rig, &mut runner, 10);
        assert_eq!(result, ActionResult::Success);
    }

    #[test]
    fn test_parallel_join_timing() {
        // The compound succeeds exactly when the slowest child does.
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::succeeding_after(1);
        let (b, _) = CountingAction::succeeding_after(3);

        let mut par = ParallelAction::new("Par");
        par.add(&mut rig.ctx, Box::new(a));
        par.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));

        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Running);
        rig.tick();
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Running);
        rig.tick();
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Success);
    }

    #[test]
    fn test_parallel_all_children_ticked_every_tick() {
        let mut rig = TestRig::new();
        let (a, a_counts) = CountingAction::succeeding_after(5);
        let (b, b_counts) = CountingAction::succeeding_after(5);

        let mut par = ParallelAction::new("Par");
        par.add(&mut rig.ctx, Box::new(a));
        par.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));

        runner.update(&mut rig.ctx);
        rig.tick();
        runner.update(&mut rig.ctx);

        assert_eq!(a_counts.poll_calls.load(Ordering::SeqCst), 2);
        assert_eq!(b_counts.poll_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_parallel_failure_cancels_siblings() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::failing_after(2, ActionResult::Timeout);
        let (b, b_counts) = CountingAction::succeeding_after(10);

        let mut par = ParallelAction::new("Par");
        par.add(&mut rig.ctx, Box::new(a));
        par.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));

        let result = run_to_completion(&mut rig, &mut runner, 10);
        assert_eq!(result, ActionResult::Timeout);
        assert_eq!(b_counts.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_parallel_ignored_failure_still_succeeds() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::failing_after(1, ActionResult::VisualObservationFailed);
        let (b, _) = CountingAction::succeeding_after(2);

        let mut par = ParallelAction::new("Par");
        par.add_with_ignore(&mut rig.ctx, Box::new(a), Box::new(|_| true));
        par.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));

        let result = run_to_completion(&mut rig, &mut runner, 10);
        assert_eq!(result, ActionResult::Success);
    }

    #[test]
    fn test_parallel_end_when_first_completes() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::succeeding_after(1);
        let (b, b_counts) = CountingAction::succeeding_after(20);

        let mut par = ParallelAction::new("Par");
        par.set_end_when_first_completes(true);
        par.add(&mut rig.ctx, Box::new(a));
        par.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));

        let result = run_to_completion(&mut rig, &mut runner, 10);
        assert_eq!(result, ActionResult::Success);
        assert_eq!(b_counts.cancel_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_compound_tracks_are_union_of_children() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::with_tracks(Tracks::HEAD, 1);
        let (b, _) = CountingAction::with_tracks(Tracks::BODY, 1);

        let mut par = ParallelAction::new("Par");
        par.add(&mut rig.ctx, Box::new(a));
        par.add(&mut rig.ctx, Box::new(b));
        assert_eq!(par.tracks(), Tracks::HEAD | Tracks::BODY);
    }

    #[test]
    fn test_compound_holds_union_lock_while_running() {
        let mut rig = TestRig::new();
        let (a, _) = CountingAction::with_tracks(Tracks::HEAD, 3);
        let (b, _) = CountingAction::with_tracks(Tracks::BODY, 3);

        let mut par = ParallelAction::new("Par");
        par.add(&mut rig.ctx, Box::new(a));
        par.add(&mut rig.ctx, Box::new(b));
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));
        runner.update(&mut rig.ctx);

        assert!(rig.ctx.locks.are_any_locked(Tracks::HEAD));
        assert!(rig.ctx.locks.are_any_locked(Tracks::BODY));

        runner.cancel(&mut rig.ctx);
        assert!(!rig.ctx.locks.are_any_locked(Tracks::ALL));
    }

    #[test]
    fn test_parallel_empty_succeeds() {
        let mut rig = TestRig::new();
        let par = ParallelAction::new("Empty");
        let mut runner = ActionRunner::new(&mut rig.ctx, Box::new(par));
        assert_eq!(runner.update(&mut rig.ctx), ActionResult::Success);
    }
}
