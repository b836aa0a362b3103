/// Outcome Aggregator - Partial-Credit Scoring
///
/// **Core Responsibility:**
/// Observe unit lifecycle events raised by the scheduler and turn them into
/// earned/available points per category per group.
///
/// **Lifecycle per unit:**
/// `NOT_STARTED → RUNNING → {FAILED → FINISHED} | FINISHED`
/// - start creates the unit's `RunState` (duplicate starts are ignored)
/// - failure flags the `RunState`; a failure with no `RunState` is an orphan
/// - finish removes the `RunState`, emits one score line and merges the
///   pass/fail delta into the group's earned points
/// - abandon (cancelled or past the deadline) removes the `RunState` without
///   scoring; the unit is reported as incomplete
///
/// **Concurrency:**
/// Events arrive from many worker threads at once. Every compound step
/// (check-then-create on start, remove on finish, accumulate-merge on the
/// group totals) happens under a single guard, so concurrent finishers never
/// lose updates.
///
/// **Knows nothing about:**
/// - how units execute (scheduler's job)
/// - where descriptors come from (descriptor source's job)

use crate::descriptor::{DescriptorResolver, RunAbort};
use crate::failure::{FailureConsumer, FirstFailure};
use crate::formatter::{OutcomeFormatter, ScoreLineFormatter};
use crate::scheduler::RunListener;
use qrunner_common::types::{
    Category, CategoryPoints, Failure, GroupScore, ScoreDescriptor, ScoreSummary, TestStatus, UnitId,
};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

pub type Sink = Box<dyn Write + Send>;

#[derive(Debug)]
struct RunState {
    q: ScoreDescriptor,
    failed: bool,
}

#[derive(Debug, Default)]
struct GroupTotals {
    available: BTreeMap<Category, f64>,
    earned: BTreeMap<Category, f64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Aggregator {
    resolver: DescriptorResolver,
    formatter: Arc<dyn OutcomeFormatter>,
    failures: Arc<dyn FailureConsumer>,
    output: Mutex<Sink>,
    scores: Mutex<Sink>,
    running: Mutex<HashMap<UnitId, RunState>>,
    groups: Mutex<BTreeMap<String, GroupTotals>>,
    orphans: Mutex<Vec<Failure>>,
    incomplete: Mutex<Vec<UnitId>>,
    units_run: AtomicUsize,
    units_failed: AtomicUsize,
}

impl Aggregator {
    /// `output` receives failure details and the summary; `scores` receives one line per finished unit
    pub fn new(resolver: DescriptorResolver, output: Sink, scores: Sink) -> Self {
        Self {
            resolver,
            formatter: Arc::new(ScoreLineFormatter),
            failures: Arc::new(FirstFailure::new()),
            output: Mutex::new(output),
            scores: Mutex::new(scores),
            running: Mutex::default(),
            groups: Mutex::default(),
            orphans: Mutex::default(),
            incomplete: Mutex::default(),
            units_run: AtomicUsize::new(0),
            units_failed: AtomicUsize::new(0),
        }
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn OutcomeFormatter>) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_failure_consumer(mut self, failures: Arc<dyn FailureConsumer>) -> Self {
        self.failures = failures;
        self
    }

    fn totals_for<'a>(&self, groups: &'a mut BTreeMap<String, GroupTotals>, group: &str) -> &'a mut GroupTotals {
        groups.entry(group.to_string()).or_insert_with(|| {
            let mut totals = GroupTotals::default();
            for q in self.resolver.declared(group) {
                *totals.available.entry(q.category).or_insert(0.0) += q.points;
                totals.earned.entry(q.category).or_insert(0.0);
            }
            debug!(group, available = ?totals.available, "Observed group");
            totals
        })
    }

    /// Units currently between start and finish, with their descriptors
    pub fn in_flight(&self) -> Vec<(UnitId, ScoreDescriptor)> {
        let mut running: Vec<_> = lock(&self.running)
            .iter()
            .map(|(id, state)| (id.clone(), state.q.clone()))
            .collect();
        running.sort_by(|a, b| a.0.cmp(&b.0));
        running
    }

    pub fn summary(&self) -> ScoreSummary {
        let mut summary = ScoreSummary::default();

        for (group, totals) in lock(&self.groups).iter() {
            let mut points: BTreeMap<Category, CategoryPoints> = BTreeMap::new();
            for (category, available) in &totals.available {
                points.entry(*category).or_default().available += available;
            }
            for (category, earned) in &totals.earned {
                points.entry(*category).or_default().earned += earned;
            }
            for (category, p) in &points {
                let total = summary.totals.entry(*category).or_default();
                total.available += p.available;
                total.earned += p.earned;
            }
            summary.groups.push(GroupScore {
                group: group.clone(),
                points,
            });
        }

        summary.orphan_failures = lock(&self.orphans).clone();
        // Units still running when the summary is taken never finished either
        summary.incomplete = lock(&self.incomplete).clone();
        summary.incomplete.extend(self.in_flight().into_iter().map(|(id, _)| id));
        summary.incomplete.sort();
        summary.incomplete.dedup();
        summary.units_run = self.units_run.load(Ordering::Acquire);
        summary.units_failed = self.units_failed.load(Ordering::Acquire);
        summary
    }

    /// Writes the end-of-run summary: orphan failures, counts, totals and per-group breakdown
    pub fn render_summary(&self, out: &mut dyn Write) -> io::Result<()> {
        let summary = self.summary();

        if !summary.orphan_failures.is_empty() {
            writeln!(out, "Other failures:")?;
            for failure in &summary.orphan_failures {
                writeln!(out, "{}", failure)?;
                if !failure.trace.is_empty() {
                    writeln!(out, "{}", failure.trace.trim_end())?;
                }
            }
        }

        if summary.was_successful() {
            writeln!(out, "All tests ran successfully!")?;
        } else {
            writeln!(
                out,
                "Ran {} total test(s) with {} failure(s).",
                summary.units_run,
                summary.units_failed + summary.orphan_failures.len()
            )?;
        }

        if !summary.incomplete.is_empty() {
            let names: Vec<String> = summary.incomplete.iter().map(UnitId::to_string).collect();
            writeln!(out, "Did not finish {} test(s): {}", names.len(), names.join(" "))?;
        }

        for (category, p) in &summary.totals {
            writeln!(out, "Total points ({}): {:.1} out of {:.1}.", category, p.earned, p.available)?;
        }

        writeln!(out, "Points breakdown:")?;
        for group in &summary.groups {
            for (category, p) in &group.points {
                writeln!(
                    out,
                    "  {} ({}): {:.1} out of {:.1}.",
                    group.group, category, p.earned, p.available
                )?;
            }
        }
        Ok(())
    }

    /// Renders the summary to the output sink and flushes both sinks
    pub fn finish_run(&self) -> io::Result<()> {
        {
            let mut output = lock(&self.output);
            self.render_summary(&mut **output)?;
            output.flush()?;
        }
        lock(&self.scores).flush()
    }
}

impl RunListener for Aggregator {
    fn unit_started(&self, id: &UnitId) -> Result<(), RunAbort> {
        let mut running = lock(&self.running);
        let slot = match running.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(group = %id.group, unit = %id.unit, "Duplicate start ignored");
                return Ok(());
            }
            Entry::Vacant(slot) => slot,
        };

        self.totals_for(&mut lock(&self.groups), &id.group);
        let q = self.resolver.resolve(id)?;
        slot.insert(RunState { q, failed: false });
        Ok(())
    }

    fn unit_failed(&self, failure: &Failure) {
        let q = lock(&self.running).get_mut(&failure.id).map(|state| {
            state.failed = true;
            state.q.clone()
        });

        match q {
            Some(q) => {
                let mut output = lock(&self.output);
                if let Err(e) = self.failures.accept(&q, failure, &mut **output) {
                    error!(error = %e, "Failed to write failure details");
                }
            }
            None => {
                warn!(group = %failure.id.group, unit = %failure.id.unit, message = %failure.message, "Failure outside any running unit");
                lock(&self.orphans).push(failure.clone());
            }
        }
    }

    fn unit_finished(&self, id: &UnitId) {
        let Some(state) = lock(&self.running).remove(id) else {
            debug!(group = %id.group, unit = %id.unit, "Finish for a unit that is not running");
            return;
        };

        let status = if state.failed { TestStatus::Fail } else { TestStatus::Pass };
        let line = self.formatter.format(&state.q, status);
        {
            let mut scores = lock(&self.scores);
            if let Err(e) = scores.write_all(line.as_bytes()) {
                error!(error = %e, group = %id.group, unit = %id.unit, "Failed to write score line");
            }
        }

        let delta = state.q.points_for(status);
        {
            let mut groups = lock(&self.groups);
            *self
                .totals_for(&mut groups, &id.group)
                .earned
                .entry(state.q.category)
                .or_insert(0.0) += delta;
        }

        self.units_run.fetch_add(1, Ordering::AcqRel);
        if state.failed {
            self.units_failed.fetch_add(1, Ordering::AcqRel);
        }
        debug!(group = %id.group, unit = %id.unit, status = ?status, delta, "Unit finished");
    }

    fn unit_abandoned(&self, id: &UnitId) {
        lock(&self.running).remove(id);
        warn!(group = %id.group, unit = %id.unit, "Unit did not finish in time");
        lock(&self.incomplete).push(id.clone());
    }
}
