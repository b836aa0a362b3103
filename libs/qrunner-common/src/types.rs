use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unit name used for failures that belong to a whole group (setup/teardown)
pub const GROUP_SCOPE: &str = "<group>";

/// Credit category a unit's points count towards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    #[default]
    Regular,
    ExtraCredit,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Regular => write!(f, "REGULAR"),
            Category::ExtraCredit => write!(f, "EXTRA_CREDIT"),
        }
    }
}

/// Identity of a scheduled unit: the group it belongs to plus its own name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitId {
    pub group: String,
    pub unit: String,
}

impl UnitId {
    pub fn new(group: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            unit: unit.into(),
        }
    }

    /// Identity used for failures raised outside any single unit
    pub fn group_scope(group: impl Into<String>) -> Self {
        Self::new(group, GROUP_SCOPE)
    }

    pub fn is_group_scope(&self) -> bool {
        self.unit == GROUP_SCOPE
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.unit, self.group)
    }
}

/// Declarative scoring for one unit
///
/// Field names on the wire match the question manifest: `desc`, `points`,
/// `incorrect` and `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDescriptor {
    #[serde(rename = "desc")]
    pub description: String,
    pub points: f64,
    #[serde(default)]
    pub incorrect: f64,
    #[serde(rename = "type", default)]
    pub category: Category,
}

impl ScoreDescriptor {
    pub fn new(category: Category, points: f64, incorrect: f64, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            points,
            incorrect,
            category,
        }
    }

    pub fn regular(points: f64, description: impl Into<String>) -> Self {
        Self::new(Category::Regular, points, 0.0, description)
    }

    pub fn extra_credit(points: f64, description: impl Into<String>) -> Self {
        Self::new(Category::ExtraCredit, points, 0.0, description)
    }

    /// Descriptor worth nothing either way
    pub fn zero(description: impl Into<String>) -> Self {
        Self::new(Category::Regular, 0.0, 0.0, description)
    }

    pub fn with_incorrect(mut self, incorrect: f64) -> Self {
        self.incorrect = incorrect;
        self
    }

    /// Points contributed by a finished unit with the given status
    pub fn points_for(&self, status: TestStatus) -> f64 {
        match status {
            TestStatus::Pass => self.points,
            TestStatus::Fail => self.incorrect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
}

/// An error or assertion raised while running a unit, a hook, or a group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub id: UnitId,
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

impl Failure {
    pub fn new(id: UnitId, message: impl Into<String>) -> Self {
        Self {
            id,
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.message)
    }
}

/// What the scheduler reports once a run returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Top-level groups that finished inside the budget
    pub completed: usize,
    pub total: usize,
    pub timed_out: bool,
    pub elapsed_ms: u64,
    /// Negative once the budget has been overrun
    pub remaining_budget_ms: i64,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        !self.timed_out && self.completed == self.total
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryPoints {
    pub earned: f64,
    pub available: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupScore {
    pub group: String,
    pub points: BTreeMap<Category, CategoryPoints>,
}

/// Final scoring snapshot produced by the aggregator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub totals: BTreeMap<Category, CategoryPoints>,
    pub groups: Vec<GroupScore>,
    pub orphan_failures: Vec<Failure>,
    pub units_run: usize,
    pub units_failed: usize,
    pub incomplete: Vec<UnitId>,
}

impl ScoreSummary {
    pub fn was_successful(&self) -> bool {
        self.units_failed == 0 && self.orphan_failures.is_empty() && self.incomplete.is_empty()
    }

    pub fn earned(&self, category: Category) -> f64 {
        self.totals.get(&category).map(|p| p.earned).unwrap_or(0.0)
    }

    pub fn available(&self, category: Category) -> f64 {
        self.totals.get(&category).map(|p| p.available).unwrap_or(0.0)
    }

    pub fn group(&self, group: &str) -> Option<&GroupScore> {
        self.groups.iter().find(|g| g.group == group)
    }
}

/// Machine-readable record of one whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub report: RunReport,
    pub summary: ScoreSummary,
    pub not_found: Vec<String>,
}
