// Per-unit outcome lines written to the score sink at finish time
use qrunner_common::types::{Category, ScoreDescriptor, TestStatus};

pub trait OutcomeFormatter: Send + Sync {
    fn format(&self, q: &ScoreDescriptor, status: TestStatus) -> String;
}

impl<F> OutcomeFormatter for F
where
    F: Fn(&ScoreDescriptor, TestStatus) -> String + Send + Sync,
{
    fn format(&self, q: &ScoreDescriptor, status: TestStatus) -> String {
        self(q, status)
    }
}

/// `points|extraCreditFlag|description`, one line per finished unit.
/// This is the row layout of the scores table the grader imports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreLineFormatter;

impl OutcomeFormatter for ScoreLineFormatter {
    fn format(&self, q: &ScoreDescriptor, status: TestStatus) -> String {
        let extra_credit = if q.category == Category::ExtraCredit { 1 } else { 0 };
        format!("{:.6}|{}|{}\n", q.points_for(status), extra_credit, q.description)
    }
}
