// Score descriptor resolution: declared descriptors first, policy second
use crate::loader::GroupDefinition;
use qrunner_common::config::MissingDescriptor;
use qrunner_common::types::{ScoreDescriptor, UnitId};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Conditions that stop the whole run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunAbort {
    #[error("missing score descriptor for {0}")]
    MissingDescriptor(UnitId),
}

/// Where declared descriptors come from
pub trait DescriptorSource: Send + Sync {
    fn descriptor(&self, id: &UnitId) -> Option<ScoreDescriptor>;

    /// Every descriptor declared by a group, used for its available points
    fn declared(&self, group: &str) -> Vec<ScoreDescriptor>;
}

/// Descriptors collected from loaded group definitions
#[derive(Debug, Default)]
pub struct CatalogDescriptors {
    by_unit: HashMap<UnitId, ScoreDescriptor>,
    by_group: HashMap<String, Vec<ScoreDescriptor>>,
}

impl CatalogDescriptors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups<'a>(groups: impl IntoIterator<Item = &'a Arc<GroupDefinition>>) -> Self {
        let mut catalog = Self::new();
        for group in groups {
            catalog.add_group(group);
        }
        catalog
    }

    pub fn add_group(&mut self, group: &GroupDefinition) {
        for spec in group.units() {
            if let Some(q) = &spec.descriptor {
                self.insert(UnitId::new(group.name(), &spec.name), q.clone());
            }
        }
        self.by_group.entry(group.name().to_string()).or_default();
    }

    pub fn insert(&mut self, id: UnitId, q: ScoreDescriptor) {
        self.by_group.entry(id.group.clone()).or_default().push(q.clone());
        self.by_unit.insert(id, q);
    }
}

impl DescriptorSource for CatalogDescriptors {
    fn descriptor(&self, id: &UnitId) -> Option<ScoreDescriptor> {
        self.by_unit.get(id).cloned()
    }

    fn declared(&self, group: &str) -> Vec<ScoreDescriptor> {
        self.by_group.get(group).cloned().unwrap_or_default()
    }
}

/// Decides what a unit without a declared descriptor is worth
pub trait MissingDescriptorPolicy: Send + Sync {
    fn resolve(&self, id: &UnitId) -> Result<ScoreDescriptor, RunAbort>;
}

impl<F> MissingDescriptorPolicy for F
where
    F: Fn(&UnitId) -> Result<ScoreDescriptor, RunAbort> + Send + Sync,
{
    fn resolve(&self, id: &UnitId) -> Result<ScoreDescriptor, RunAbort> {
        self(id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AbortOnMissing;

impl MissingDescriptorPolicy for AbortOnMissing {
    fn resolve(&self, id: &UnitId) -> Result<ScoreDescriptor, RunAbort> {
        error!(group = %id.group, unit = %id.unit, "Missing score descriptor for {} in group {}", id.unit, id.group);
        Err(RunAbort::MissingDescriptor(id.clone()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroOnMissing;

impl MissingDescriptorPolicy for ZeroOnMissing {
    fn resolve(&self, id: &UnitId) -> Result<ScoreDescriptor, RunAbort> {
        warn!(group = %id.group, unit = %id.unit, "Missing score descriptor; scoring as zero");
        Ok(ScoreDescriptor::zero(id.to_string()))
    }
}

pub fn policy_for(setting: MissingDescriptor) -> Arc<dyn MissingDescriptorPolicy> {
    match setting {
        MissingDescriptor::Abort => Arc::new(AbortOnMissing),
        MissingDescriptor::Zero => Arc::new(ZeroOnMissing),
    }
}

/// Source plus fallback policy, as consumed by the aggregator
#[derive(Clone)]
pub struct DescriptorResolver {
    source: Arc<dyn DescriptorSource>,
    policy: Arc<dyn MissingDescriptorPolicy>,
}

impl DescriptorResolver {
    pub fn new(source: Arc<dyn DescriptorSource>, policy: Arc<dyn MissingDescriptorPolicy>) -> Self {
        Self { source, policy }
    }

    pub fn resolve(&self, id: &UnitId) -> Result<ScoreDescriptor, RunAbort> {
        match self.source.descriptor(id) {
            Some(q) => Ok(q),
            None => self.policy.resolve(id),
        }
    }

    pub fn declared(&self, group: &str) -> Vec<ScoreDescriptor> {
        self.source.declared(group)
    }
}
