/// Execution Scheduler - Budgeted Parallel Execution
///
/// **Core Responsibility:**
/// Walk an execution tree (suite → groups → units), running parallel batches
/// on a shared worker pool under one global time budget, and tell a
/// `RunListener` what happened to every unit.
///
/// **Budget accounting:**
/// - a parallel batch reads the remaining budget once, waits for its children
///   until `now + max(remaining, 0)`, then charges its own elapsed wall time
/// - time spent waiting for pool permits is part of the wait, so it is charged
/// - the budget only ever decreases and may go negative
/// - a unit's effective deadline is the earliest deadline of any enclosing
///   batch
///
/// **Cancellation:**
/// Jobs still running when a batch gives up are detached, never killed. The
/// batch cancels its token; units notice through their `UnitContext`. A unit
/// that returns after cancellation or after its deadline is reported as
/// abandoned and is never scored.
///
/// **Knows nothing about:**
/// - scoring (the listener's job)
/// - where groups come from (the loader's job)

use crate::descriptor::RunAbort;
use crate::loader::GroupDefinition;
use crate::unit::{CancelToken, Statics, Unit, UnitContext, UnitFailure, UnitResult};
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use qrunner_common::types::{Failure, RunReport, UnitId};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives unit lifecycle events, possibly from many threads at once
pub trait RunListener: Send + Sync {
    /// An `Err` aborts the whole run
    fn unit_started(&self, id: &UnitId) -> Result<(), RunAbort>;
    fn unit_failed(&self, failure: &Failure);
    fn unit_finished(&self, id: &UnitId);
    /// The unit was cancelled or overran its deadline
    fn unit_abandoned(&self, id: &UnitId);
}

/// Remaining global time, in nanoseconds. Negative once overrun.
#[derive(Debug)]
pub struct Budget {
    remaining_ns: AtomicI64,
}

impl Budget {
    pub fn new(total: Duration) -> Self {
        Self {
            remaining_ns: AtomicI64::new(nanos(total)),
        }
    }

    pub fn remaining_nanos(&self) -> i64 {
        self.remaining_ns.load(Ordering::Acquire)
    }

    /// Remaining time clamped at zero
    pub fn remaining(&self) -> Duration {
        Duration::from_nanos(self.remaining_nanos().max(0) as u64)
    }

    /// Subtracts `elapsed` and returns what is left
    pub fn charge(&self, elapsed: Duration) -> i64 {
        let spent = nanos(elapsed);
        self.remaining_ns.fetch_sub(spent, Ordering::AcqRel) - spent
    }
}

fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Shared pool unit bodies run on. Bounded pools hand out one permit per
/// running body; cached pools never make a body wait.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Option<Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn bounded(workers: usize) -> Self {
        Self {
            permits: Some(Arc::new(Semaphore::new(workers.max(1)))),
        }
    }

    pub fn cached() -> Self {
        Self { permits: None }
    }

    pub fn from_workers(workers: Option<usize>) -> Self {
        workers.map_or_else(Self::cached, Self::bounded)
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        match &self.permits {
            Some(permits) => permits.clone().acquire_owned().await.ok(),
            None => None,
        }
    }
}

/// Which levels of the tree run their children in parallel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Concurrency {
    pub groups: bool,
    pub units: bool,
}

impl Concurrency {
    pub fn classes() -> Self {
        Self { groups: true, units: false }
    }

    pub fn units() -> Self {
        Self { groups: false, units: true }
    }

    pub fn both() -> Self {
        Self { groups: true, units: true }
    }

    pub fn sequential() -> Self {
        Self { groups: false, units: false }
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self::classes()
    }
}

/// A unit body bound to its identity and the statics of its definition
#[derive(Clone)]
pub struct ScheduledUnit {
    pub id: UnitId,
    pub unit: Arc<dyn Unit>,
    pub statics: Arc<Statics>,
}

impl ScheduledUnit {
    pub fn new(id: UnitId, unit: Arc<dyn Unit>, statics: Arc<Statics>) -> Self {
        Self { id, unit, statics }
    }
}

impl fmt::Debug for ScheduledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledUnit").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Batch {
    pub name: String,
    pub parallel: bool,
    pub setup: Option<ScheduledUnit>,
    pub teardown: Option<ScheduledUnit>,
    pub children: Vec<ExecutionNode>,
}

impl Batch {
    pub fn new(name: impl Into<String>, parallel: bool, children: Vec<ExecutionNode>) -> Self {
        Self {
            name: name.into(),
            parallel,
            setup: None,
            teardown: None,
            children,
        }
    }

    pub fn with_setup(mut self, hook: ScheduledUnit) -> Self {
        self.setup = Some(hook);
        self
    }

    pub fn with_teardown(mut self, hook: ScheduledUnit) -> Self {
        self.teardown = Some(hook);
        self
    }
}

#[derive(Debug)]
pub enum ExecutionNode {
    Unit(ScheduledUnit),
    Batch(Batch),
}

impl ExecutionNode {
    fn unit_count(&self) -> usize {
        match self {
            ExecutionNode::Unit(_) => 1,
            ExecutionNode::Batch(batch) => batch.children.iter().map(ExecutionNode::unit_count).sum(),
        }
    }
}

#[derive(Debug)]
pub struct ExecutionTree {
    pub root: Batch,
}

impl ExecutionTree {
    pub fn new(root: Batch) -> Self {
        Self { root }
    }

    pub fn group_count(&self) -> usize {
        self.root.children.len()
    }

    pub fn unit_count(&self) -> usize {
        self.root.children.iter().map(ExecutionNode::unit_count).sum()
    }
}

/// Suite node over one node per group, each holding that group's units
pub fn build_plan(groups: &[Arc<GroupDefinition>], concurrency: Concurrency) -> ExecutionTree {
    let children = groups
        .iter()
        .map(|group| {
            let bind = |id: UnitId, unit: &Arc<dyn Unit>| ScheduledUnit::new(id, unit.clone(), group.statics().clone());
            let units = group
                .units()
                .iter()
                .map(|spec| ExecutionNode::Unit(bind(UnitId::new(group.name(), &spec.name), &spec.unit)))
                .collect();

            let mut batch = Batch::new(group.name(), concurrency.units, units);
            if let Some(hook) = group.setup() {
                batch = batch.with_setup(bind(UnitId::group_scope(group.name()), hook));
            }
            if let Some(hook) = group.teardown() {
                batch = batch.with_teardown(bind(UnitId::group_scope(group.name()), hook));
            }
            ExecutionNode::Batch(batch)
        })
        .collect();

    ExecutionTree::new(Batch::new("suite", concurrency.groups, children))
}

#[derive(Debug, Clone)]
struct NodeContext {
    token: CancelToken,
    deadline: Option<Instant>,
}

impl NodeContext {
    fn overran(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone, Copy)]
struct BatchOutcome {
    completed: usize,
    complete: bool,
}

struct RunState {
    pool: WorkerPool,
    budget: Arc<Budget>,
    listener: Arc<dyn RunListener>,
    root: CancelToken,
    timed_out: AtomicBool,
    abort: Mutex<Option<RunAbort>>,
}

impl RunState {
    fn record_abort(&self, abort: RunAbort) {
        let mut slot = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            error!(error = %abort, "Aborting run");
            *slot = Some(abort);
        }
        self.root.cancel();
    }

    fn take_abort(&self) -> Option<RunAbort> {
        self.abort.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

pub struct Scheduler {
    pool: WorkerPool,
    budget: Arc<Budget>,
    listener: Arc<dyn RunListener>,
}

impl Scheduler {
    pub fn new(pool: WorkerPool, budget: Arc<Budget>, listener: Arc<dyn RunListener>) -> Self {
        Self {
            pool,
            budget,
            listener,
        }
    }

    pub fn budget(&self) -> &Arc<Budget> {
        &self.budget
    }

    /// Runs the whole tree. Returns once every batch has finished or given up.
    pub async fn run(&self, tree: ExecutionTree) -> Result<RunReport, RunAbort> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let total = tree.group_count();

        info!(
            run_id = %run_id,
            groups = total,
            units = tree.unit_count(),
            budget_ms = self.budget.remaining().as_millis() as u64,
            "Starting run"
        );

        let state = Arc::new(RunState {
            pool: self.pool.clone(),
            budget: self.budget.clone(),
            listener: self.listener.clone(),
            root: CancelToken::new(),
            timed_out: AtomicBool::new(false),
            abort: Mutex::new(None),
        });
        let ctx = NodeContext {
            token: state.root.clone(),
            deadline: None,
        };

        let outcome = run_batch(state.clone(), tree.root, ctx).await;

        if let Some(abort) = state.take_abort() {
            return Err(abort);
        }

        let report = RunReport {
            run_id,
            started_at,
            completed: outcome.completed,
            total,
            timed_out: state.timed_out.load(Ordering::Acquire),
            elapsed_ms: start.elapsed().as_millis() as u64,
            remaining_budget_ms: self.budget.remaining_nanos() / 1_000_000,
        };

        info!(
            run_id = %run_id,
            completed = report.completed,
            total = report.total,
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed_ms,
            remaining_ms = report.remaining_budget_ms,
            "Run finished"
        );
        Ok(report)
    }
}

fn run_node(state: Arc<RunState>, node: ExecutionNode, ctx: NodeContext) -> BoxFuture<'static, bool> {
    async move {
        match node {
            ExecutionNode::Unit(unit) => run_unit(&state, unit, &ctx).await,
            ExecutionNode::Batch(batch) => run_batch(state, batch, ctx).await.complete,
        }
    }
    .boxed()
}

async fn run_batch(state: Arc<RunState>, batch: Batch, ctx: NodeContext) -> BatchOutcome {
    let Batch {
        name,
        parallel,
        setup,
        teardown,
        children,
    } = batch;
    let total = children.len();

    if let Some(hook) = setup {
        if !run_hook(&state, hook, &ctx, "setup").await {
            warn!(group = %name, skipped = total, "Setup did not complete; skipping units");
            if let Some(hook) = teardown {
                run_hook(&state, hook, &ctx, "teardown").await;
            }
            return BatchOutcome {
                completed: 0,
                complete: !ctx.overran(),
            };
        }
    }

    let completed = if parallel {
        run_parallel(&state, &name, children, &ctx).await
    } else {
        run_sequential(&state, children, &ctx).await
    };

    if let Some(hook) = teardown {
        run_hook(&state, hook, &ctx, "teardown").await;
    }

    BatchOutcome {
        completed,
        complete: completed == total,
    }
}

async fn run_sequential(state: &Arc<RunState>, children: Vec<ExecutionNode>, ctx: &NodeContext) -> usize {
    let mut completed = 0;
    for child in children {
        if ctx.overran() {
            break;
        }
        if run_node(state.clone(), child, ctx.clone()).await {
            completed += 1;
        }
    }
    completed
}

async fn run_parallel(state: &Arc<RunState>, name: &str, children: Vec<ExecutionNode>, ctx: &NodeContext) -> usize {
    if children.is_empty() {
        return 0;
    }
    let total = children.len();

    if state.budget.remaining_nanos() <= 0 {
        cut_off_unstarted(state, name, total);
        return 0;
    }

    let start = Instant::now();
    let remaining = state.budget.remaining();
    let own_deadline = start + remaining;
    let deadline = ctx.deadline.map_or(own_deadline, |outer| outer.min(own_deadline));
    let token = ctx.token.child();
    let child_ctx = NodeContext {
        token: token.clone(),
        deadline: Some(deadline),
    };

    debug!(batch = name, children = total, remaining_ms = remaining.as_millis() as u64, "Starting parallel batch");

    let mut jobs = JoinSet::new();
    for child in children {
        let state = state.clone();
        let ctx = child_ctx.clone();
        jobs.spawn(async move {
            let complete = run_node(state, child, ctx).await;
            (complete, Instant::now())
        });
    }

    let mut completed = 0;
    let drained = tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), async {
        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((true, finished_at)) if finished_at <= deadline => completed += 1,
                Ok(_) => {}
                Err(e) => error!(batch = name, error = %e, "Batch job failed"),
            }
        }
    })
    .await;

    if drained.is_err() {
        let outstanding = jobs.len();
        token.cancel();
        // Still-running jobs are left to observe the cancellation and report themselves abandoned.
        jobs.detach_all();
        state.timed_out.store(true, Ordering::Release);
        warn!(batch = name, outstanding, completed, total, "Batch ran out of time");
    }

    let elapsed = start.elapsed();
    let remaining_ns = state.budget.charge(elapsed);
    debug!(
        batch = name,
        completed,
        elapsed_ms = elapsed.as_millis() as u64,
        remaining_ms = remaining_ns / 1_000_000,
        "Parallel batch finished"
    );
    completed
}

/// A batch reached with the budget already spent starts none of its children
fn cut_off_unstarted(state: &RunState, name: &str, total: usize) {
    state.timed_out.store(true, Ordering::Release);
    warn!(batch = name, outstanding = total, "Budget exhausted before batch started");
}

async fn run_unit(state: &RunState, unit: ScheduledUnit, ctx: &NodeContext) -> bool {
    if ctx.overran() {
        debug!(group = %unit.id.group, unit = %unit.id.unit, "Not starting unit after cut-off");
        return false;
    }
    if let Err(abort) = state.listener.unit_started(&unit.id) {
        state.record_abort(abort);
        return false;
    }

    let result = execute_body(state, &unit, ctx).await;

    if ctx.overran() {
        state.listener.unit_abandoned(&unit.id);
        return false;
    }
    if let Err(failure) = result {
        state
            .listener
            .unit_failed(&Failure::new(unit.id.clone(), failure.message).with_trace(failure.trace));
    }
    state.listener.unit_finished(&unit.id);
    true
}

/// Runs a group hook; its failures belong to the group scope
async fn run_hook(state: &RunState, hook: ScheduledUnit, ctx: &NodeContext, phase: &str) -> bool {
    if ctx.overran() {
        return false;
    }
    match execute_body(state, &hook, ctx).await {
        Ok(()) => true,
        Err(failure) => {
            state.listener.unit_failed(
                &Failure::new(hook.id.clone(), format!("{} failed: {}", phase, failure.message))
                    .with_trace(failure.trace),
            );
            false
        }
    }
}

/// Runs one body on a blocking thread, holding a pool permit until the body returns
async fn execute_body(state: &RunState, unit: &ScheduledUnit, ctx: &NodeContext) -> UnitResult {
    let permit = state.pool.acquire().await;
    let body = unit.unit.clone();
    let unit_ctx = UnitContext::new(unit.id.clone(), ctx.token.clone(), ctx.deadline, unit.statics.clone());

    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        panic::catch_unwind(AssertUnwindSafe(|| body.run(&unit_ctx)))
    })
    .await;

    match joined {
        Ok(Ok(result)) => result,
        Ok(Err(payload)) => Err(UnitFailure::new(format!("panicked: {}", panic_message(&*payload)))),
        Err(e) => Err(UnitFailure::new(format!("unit task failed: {}", e))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrunner_common::types::ScoreDescriptor;

    #[test]
    fn test_budget_goes_negative() {
        let budget = Budget::new(Duration::from_millis(100));
        assert_eq!(budget.charge(Duration::from_millis(40)), 60_000_000);
        assert_eq!(budget.charge(Duration::from_millis(100)), -40_000_000);
        assert_eq!(budget.remaining(), Duration::ZERO);
        assert_eq!(budget.remaining_nanos(), -40_000_000);
    }

    #[test]
    fn test_concurrency_presets() {
        assert_eq!(Concurrency::default(), Concurrency::classes());
        assert!(Concurrency::both().groups && Concurrency::both().units);
        assert!(!Concurrency::sequential().groups && !Concurrency::sequential().units);
        assert!(!Concurrency::units().groups && Concurrency::units().units);
    }

    #[test]
    fn test_build_plan_shape() {
        let noop = |_: &UnitContext| -> UnitResult { Ok(()) };
        let list = Arc::new(
            GroupDefinition::builder("hw1.ListTest")
                .unit("testAdd", ScoreDescriptor::regular(1.0, "add"), noop)
                .unit("testRemove", ScoreDescriptor::regular(1.0, "remove"), noop)
                .setup(noop)
                .build(),
        );
        let tree_group = Arc::new(
            GroupDefinition::builder("hw1.TreeTest")
                .unit("testInsert", ScoreDescriptor::regular(1.0, "insert"), noop)
                .build(),
        );

        let tree = build_plan(&[list.clone(), tree_group], Concurrency::both());
        assert_eq!(tree.root.name, "suite");
        assert!(tree.root.parallel);
        assert_eq!(tree.group_count(), 2);
        assert_eq!(tree.unit_count(), 3);

        let ExecutionNode::Batch(first) = &tree.root.children[0] else {
            panic!("expected a group batch");
        };
        assert_eq!(first.name, "hw1.ListTest");
        assert!(first.parallel);
        assert!(first.setup.as_ref().unwrap().id.is_group_scope());
        assert!(first.teardown.is_none());

        let ExecutionNode::Unit(unit) = &first.children[1] else {
            panic!("expected a unit");
        };
        assert_eq!(unit.id, UnitId::new("hw1.ListTest", "testRemove"));
        assert!(Arc::ptr_eq(&unit.statics, list.statics()));
    }

    #[test]
    fn test_panic_message() {
        let payload = panic::catch_unwind(|| panic!("index out of bounds")).unwrap_err();
        assert_eq!(panic_message(&*payload), "index out of bounds");
        let payload = panic::catch_unwind(|| panic!("{} != {}", 3, 4)).unwrap_err();
        assert_eq!(panic_message(&*payload), "3 != 4");
    }
}
