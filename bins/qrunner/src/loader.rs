/// Group Loading and Isolation
///
/// Groups are resolved by dotted name (`hw1.ListTest`) from resource bytes
/// found at `hw1/ListTest.json`. Three resolvers compose:
///
/// - `SharedResolver`: process-wide. The same name always yields the very
///   same definition, so state held by common groups is shared.
/// - `ChildFirstResolver`: searches its own locations (the classpath) before
///   asking its parent.
/// - `IsolatingLoader`: names under the isolated prefix are re-read from raw
///   bytes and defined fresh in this loader instance; everything else is
///   delegated. Two loaders never share an isolated definition, so a
///   submission's static state cannot leak from one run into the next.

use crate::unit::{CommandUnit, Statics, Unit};
use qrunner_common::types::ScoreDescriptor;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

pub const RESOURCE_SUFFIX: &str = ".json";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("group not found: {0}")]
    NotFound(String),

    #[error("failed to read group {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("malformed group definition {name}: {reason}")]
    Malformed { name: String, reason: String },
}

impl LoadError {
    /// Only I/O failures abort a run; a missing or malformed group is skipped
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::Io { .. })
    }
}

/// Resource path for a dotted group name
pub fn resource_path(name: &str) -> String {
    format!("{}{}", name.replace('.', "/"), RESOURCE_SUFFIX)
}

#[derive(Debug, Deserialize)]
struct GroupManifest {
    #[serde(default)]
    units: Vec<UnitManifest>,
    #[serde(default)]
    setup: Option<Vec<String>>,
    #[serde(default)]
    teardown: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct UnitManifest {
    name: String,
    command: Vec<String>,
    #[serde(default)]
    q: Option<ScoreDescriptor>,
}

/// One unit as declared by its group
#[derive(Clone)]
pub struct UnitSpec {
    pub name: String,
    pub descriptor: Option<ScoreDescriptor>,
    pub unit: Arc<dyn Unit>,
}

impl fmt::Debug for UnitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitSpec")
            .field("name", &self.name)
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// A loaded group: its units, optional hooks, and its own static state
pub struct GroupDefinition {
    name: String,
    units: Vec<UnitSpec>,
    setup: Option<Arc<dyn Unit>>,
    teardown: Option<Arc<dyn Unit>>,
    statics: Arc<Statics>,
}

impl fmt::Debug for GroupDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupDefinition")
            .field("name", &self.name)
            .field("units", &self.units)
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

impl GroupDefinition {
    pub fn builder(name: impl Into<String>) -> GroupBuilder {
        GroupBuilder {
            name: name.into(),
            units: Vec::new(),
            setup: None,
            teardown: None,
        }
    }

    /// Synthesizes a definition from raw manifest bytes
    pub fn define(name: &str, bytes: &[u8]) -> Result<Self, LoadError> {
        let malformed = |reason: String| LoadError::Malformed {
            name: name.to_string(),
            reason,
        };

        let manifest: GroupManifest =
            serde_json::from_slice(bytes).map_err(|e| malformed(e.to_string()))?;

        let command = |argv: &[String], what: &str| -> Result<Arc<dyn Unit>, LoadError> {
            CommandUnit::from_argv(argv)
                .map(|unit| Arc::new(unit) as Arc<dyn Unit>)
                .ok_or_else(|| malformed(format!("{} has an empty command", what)))
        };

        let mut builder = Self::builder(name);
        for unit in &manifest.units {
            builder.units.push(UnitSpec {
                name: unit.name.clone(),
                descriptor: unit.q.clone(),
                unit: command(&unit.command, &unit.name)?,
            });
        }
        if let Some(argv) = &manifest.setup {
            builder.setup = Some(command(argv, "setup")?);
        }
        if let Some(argv) = &manifest.teardown {
            builder.teardown = Some(command(argv, "teardown")?);
        }
        Ok(builder.build())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn units(&self) -> &[UnitSpec] {
        &self.units
    }

    pub fn setup(&self) -> Option<&Arc<dyn Unit>> {
        self.setup.as_ref()
    }

    pub fn teardown(&self) -> Option<&Arc<dyn Unit>> {
        self.teardown.as_ref()
    }

    pub fn statics(&self) -> &Arc<Statics> {
        &self.statics
    }
}

pub struct GroupBuilder {
    name: String,
    units: Vec<UnitSpec>,
    setup: Option<Arc<dyn Unit>>,
    teardown: Option<Arc<dyn Unit>>,
}

impl GroupBuilder {
    pub fn unit(mut self, name: impl Into<String>, q: ScoreDescriptor, unit: impl Unit + 'static) -> Self {
        self.units.push(UnitSpec {
            name: name.into(),
            descriptor: Some(q),
            unit: Arc::new(unit),
        });
        self
    }

    /// Adds a unit with no score descriptor; the missing-descriptor policy decides its fate
    pub fn undescribed(mut self, name: impl Into<String>, unit: impl Unit + 'static) -> Self {
        self.units.push(UnitSpec {
            name: name.into(),
            descriptor: None,
            unit: Arc::new(unit),
        });
        self
    }

    pub fn setup(mut self, unit: impl Unit + 'static) -> Self {
        self.setup = Some(Arc::new(unit));
        self
    }

    pub fn teardown(mut self, unit: impl Unit + 'static) -> Self {
        self.teardown = Some(Arc::new(unit));
        self
    }

    pub fn build(self) -> GroupDefinition {
        GroupDefinition {
            name: self.name,
            units: self.units,
            setup: self.setup,
            teardown: self.teardown,
            statics: Arc::new(Statics::default()),
        }
    }
}

pub type ResourceStream = Box<dyn Read + Send>;

/// A location group bytes can be read from
pub trait ResourceSource: Send + Sync {
    /// `Ok(None)` when the location has no such resource
    fn open(&self, path: &str) -> io::Result<Option<ResourceStream>>;
}

/// Classpath directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ResourceSource for DirectorySource {
    fn open(&self, path: &str) -> io::Result<Option<ResourceStream>> {
        match File::open(self.root.join(path)) {
            Ok(file) => Ok(Some(Box::new(BufReader::new(file)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    entries: HashMap<String, Vec<u8>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the manifest for a dotted group name
    pub fn with_group(mut self, name: &str, manifest: impl Into<Vec<u8>>) -> Self {
        self.entries.insert(resource_path(name), manifest.into());
        self
    }
}

impl ResourceSource for MemorySource {
    fn open(&self, path: &str) -> io::Result<Option<ResourceStream>> {
        Ok(self
            .entries
            .get(path)
            .map(|bytes| Box::new(Cursor::new(bytes.clone())) as ResourceStream))
    }
}

/// Capability that turns a group name into a loaded definition
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Arc<GroupDefinition>, LoadError>;

    fn open_resource(&self, path: &str) -> Result<Option<ResourceStream>, LoadError>;
}

fn open_first(sources: &[Box<dyn ResourceSource>], path: &str) -> Result<Option<ResourceStream>, LoadError> {
    for source in sources {
        let opened = source.open(path).map_err(|source| LoadError::Io {
            name: path.to_string(),
            source,
        })?;
        if opened.is_some() {
            return Ok(opened);
        }
    }
    Ok(None)
}

fn read_definition(name: &str, mut stream: ResourceStream) -> Result<GroupDefinition, LoadError> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).map_err(|source| LoadError::Io {
        name: name.to_string(),
        source,
    })?;
    GroupDefinition::define(name, &bytes)
}

type DefinitionCache = Mutex<HashMap<String, Arc<GroupDefinition>>>;

/// Process-wide resolver; identical name, identical definition
#[derive(Default)]
pub struct SharedResolver {
    sources: Vec<Box<dyn ResourceSource>>,
    defined: DefinitionCache,
}

impl SharedResolver {
    pub fn new(sources: Vec<Box<dyn ResourceSource>>) -> Self {
        Self {
            sources,
            defined: Mutex::default(),
        }
    }

    /// Makes an in-code definition resolvable; an existing one wins
    pub fn register(&self, definition: GroupDefinition) -> Arc<GroupDefinition> {
        let mut defined = self.defined.lock().unwrap_or_else(PoisonError::into_inner);
        defined
            .entry(definition.name().to_string())
            .or_insert_with(|| Arc::new(definition))
            .clone()
    }
}

impl Resolver for SharedResolver {
    fn resolve(&self, name: &str) -> Result<Arc<GroupDefinition>, LoadError> {
        let mut defined = self.defined.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(definition) = defined.get(name) {
            return Ok(definition.clone());
        }
        let stream = open_first(&self.sources, &resource_path(name))?
            .ok_or_else(|| LoadError::NotFound(name.to_string()))?;
        let definition = Arc::new(read_definition(name, stream)?);
        defined.insert(name.to_string(), definition.clone());
        debug!(group = name, "Defined shared group");
        Ok(definition)
    }

    fn open_resource(&self, path: &str) -> Result<Option<ResourceStream>, LoadError> {
        open_first(&self.sources, path)
    }
}

/// Resolver that prefers its own locations over its parent's
pub struct ChildFirstResolver {
    sources: Vec<Box<dyn ResourceSource>>,
    parent: Arc<dyn Resolver>,
    defined: DefinitionCache,
}

impl ChildFirstResolver {
    pub fn new(sources: Vec<Box<dyn ResourceSource>>, parent: Arc<dyn Resolver>) -> Self {
        Self {
            sources,
            parent,
            defined: Mutex::default(),
        }
    }

    pub fn from_classpath(classpath: &[PathBuf], parent: Arc<dyn Resolver>) -> Self {
        let sources = classpath
            .iter()
            .map(|dir| Box::new(DirectorySource::new(dir)) as Box<dyn ResourceSource>)
            .collect();
        Self::new(sources, parent)
    }
}

impl Resolver for ChildFirstResolver {
    fn resolve(&self, name: &str) -> Result<Arc<GroupDefinition>, LoadError> {
        {
            let mut defined = self.defined.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(definition) = defined.get(name) {
                return Ok(definition.clone());
            }
            if let Some(stream) = open_first(&self.sources, &resource_path(name))? {
                let definition = Arc::new(read_definition(name, stream)?);
                defined.insert(name.to_string(), definition.clone());
                debug!(group = name, "Defined group from classpath");
                return Ok(definition);
            }
        }
        self.parent.resolve(name)
    }

    fn open_resource(&self, path: &str) -> Result<Option<ResourceStream>, LoadError> {
        match open_first(&self.sources, path)? {
            Some(stream) => Ok(Some(stream)),
            None => self.parent.open_resource(path),
        }
    }
}

/// Loader that defines isolated-namespace groups afresh for each instance
pub struct IsolatingLoader {
    prefix: String,
    parent: Arc<dyn Resolver>,
    defined: DefinitionCache,
}

impl IsolatingLoader {
    pub fn new(prefix: impl Into<String>, parent: Arc<dyn Resolver>) -> Self {
        Self {
            prefix: prefix.into(),
            parent,
            defined: Mutex::default(),
        }
    }

    pub fn is_isolated(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }
}

impl Resolver for IsolatingLoader {
    fn resolve(&self, name: &str) -> Result<Arc<GroupDefinition>, LoadError> {
        if !self.is_isolated(name) {
            return self.parent.resolve(name);
        }
        let mut defined = self.defined.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(definition) = defined.get(name) {
            return Ok(definition.clone());
        }
        let stream = match self.parent.open_resource(&resource_path(name))? {
            Some(stream) => stream,
            None => {
                warn!(group = name, "No resource for isolated group");
                return Err(LoadError::NotFound(name.to_string()));
            }
        };
        let definition = Arc::new(read_definition(name, stream)?);
        defined.insert(name.to_string(), definition.clone());
        debug!(group = name, units = definition.units().len(), "Defined isolated group");
        Ok(definition)
    }

    fn open_resource(&self, path: &str) -> Result<Option<ResourceStream>, LoadError> {
        self.parent.open_resource(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{UnitContext, UnitResult};
    use qrunner_common::types::Category;
    use serde_json::Value;
    use std::io::Write;

    const LIST_TEST: &str = r#"{
        "units": [
            {"name": "testAdd", "command": ["true"], "q": {"desc": "add works", "points": 2}},
            {"name": "testBonus", "command": ["true"],
             "q": {"desc": "bonus", "points": 1, "incorrect": -0.5, "type": "EXTRA_CREDIT"}},
            {"name": "testUndeclared", "command": ["true"]}
        ],
        "setup": ["true"]
    }"#;

    const HELPER: &str = r#"{"units": [{"name": "check", "command": ["true"]}]}"#;

    fn make_parent() -> Arc<dyn Resolver> {
        let shared = SharedResolver::new(vec![Box::new(
            MemorySource::new()
                .with_group("hw1.ListTest", LIST_TEST)
                .with_group("lib.Helper", HELPER),
        )]);
        shared.register(GroupDefinition::builder("common.Fixtures").build());
        Arc::new(shared)
    }

    struct BrokenSource;

    struct BrokenStream;

    impl Read for BrokenStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }
    }

    impl ResourceSource for BrokenSource {
        fn open(&self, _path: &str) -> io::Result<Option<ResourceStream>> {
            Ok(Some(Box::new(BrokenStream)))
        }
    }

    #[test]
    fn test_resource_path() {
        assert_eq!(resource_path("hw1.ListTest"), "hw1/ListTest.json");
        assert_eq!(resource_path("Flat"), "Flat.json");
    }

    #[test]
    fn test_define_reads_units_and_descriptors() {
        let definition = GroupDefinition::define("hw1.ListTest", LIST_TEST.as_bytes()).unwrap();
        assert_eq!(definition.name(), "hw1.ListTest");
        assert_eq!(definition.units().len(), 3);
        assert!(definition.setup().is_some());
        assert!(definition.teardown().is_none());

        let bonus = definition.units()[1].descriptor.as_ref().unwrap();
        assert_eq!(bonus.category, Category::ExtraCredit);
        assert_eq!(bonus.incorrect, -0.5);
        assert!(definition.units()[2].descriptor.is_none());
    }

    #[test]
    fn test_define_rejects_empty_command() {
        let err = GroupDefinition::define("hw1.Bad", br#"{"units": [{"name": "x", "command": []}]}"#)
            .unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_define_rejects_garbage() {
        let err = GroupDefinition::define("hw1.Bad", b"\xca\xfe\xba\xbe").unwrap_err();
        assert!(matches!(err, LoadError::Malformed { .. }));
    }

    #[test]
    fn test_isolated_definitions_differ_between_loaders() {
        let parent = make_parent();
        let first = IsolatingLoader::new("hw", parent.clone());
        let second = IsolatingLoader::new("hw", parent);

        let a = first.resolve("hw1.ListTest").unwrap();
        let b = second.resolve("hw1.ListTest").unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_isolated_statics_do_not_leak() {
        let parent = make_parent();
        let first = IsolatingLoader::new("hw", parent.clone());
        let second = IsolatingLoader::new("hw", parent);

        let a = first.resolve("hw1.ListTest").unwrap();
        a.statics().set("size", Value::from(42));

        let b = second.resolve("hw1.ListTest").unwrap();
        assert_eq!(b.statics().get("size"), None);
        assert_eq!(a.statics().get("size"), Some(Value::from(42)));
    }

    #[test]
    fn test_isolated_resolution_is_idempotent_per_loader() {
        let loader = IsolatingLoader::new("hw", make_parent());
        let a = loader.resolve("hw1.ListTest").unwrap();
        let b = loader.resolve("hw1.ListTest").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_shared_definitions_are_identical() {
        let parent = make_parent();
        let first = IsolatingLoader::new("hw", parent.clone());
        let second = IsolatingLoader::new("hw", parent);

        let a = first.resolve("common.Fixtures").unwrap();
        let b = second.resolve("common.Fixtures").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = first.resolve("lib.Helper").unwrap();
        let d = second.resolve("lib.Helper").unwrap();
        assert!(Arc::ptr_eq(&c, &d));
    }

    #[test]
    fn test_unknown_isolated_name_not_found() {
        let loader = IsolatingLoader::new("hw", make_parent());
        let err = loader.resolve("hw0.NonExistent").unwrap_err();
        assert!(matches!(err, LoadError::NotFound(ref name) if name == "hw0.NonExistent"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unknown_shared_name_not_found() {
        let loader = IsolatingLoader::new("hw", make_parent());
        assert!(matches!(loader.resolve("lib.Missing"), Err(LoadError::NotFound(_))));
    }

    #[test]
    fn test_read_failure_is_fatal() {
        let parent: Arc<dyn Resolver> = Arc::new(SharedResolver::new(vec![Box::new(BrokenSource)]));
        let loader = IsolatingLoader::new("hw", parent);
        let err = loader.resolve("hw1.ListTest").unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_child_first_precedence() {
        let parent = make_parent();
        let override_helper = r#"{"units": [
            {"name": "check", "command": ["true"]},
            {"name": "extra", "command": ["true"]}
        ]}"#;
        let child = ChildFirstResolver::new(
            vec![Box::new(MemorySource::new().with_group("lib.Helper", override_helper))],
            parent.clone(),
        );

        assert_eq!(child.resolve("lib.Helper").unwrap().units().len(), 2);
        assert_eq!(parent.resolve("lib.Helper").unwrap().units().len(), 1);

        // Misses fall through to the parent's shared definition
        let fixtures = child.resolve("common.Fixtures").unwrap();
        assert!(Arc::ptr_eq(&fixtures, &parent.resolve("common.Fixtures").unwrap()));
    }

    #[test]
    fn test_isolating_loader_reads_classpath_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hw2")).unwrap();
        let mut file = File::create(dir.path().join("hw2/TreeTest.json")).unwrap();
        file.write_all(HELPER.as_bytes()).unwrap();

        let classpath: Arc<dyn Resolver> = Arc::new(ChildFirstResolver::from_classpath(
            &[dir.path().to_path_buf()],
            Arc::new(SharedResolver::default()),
        ));
        let loader = IsolatingLoader::new("hw", classpath);
        let definition = loader.resolve("hw2.TreeTest").unwrap();
        assert_eq!(definition.units()[0].name, "check");
    }

    #[test]
    fn test_builder_units_run_against_own_statics() {
        let definition = GroupDefinition::builder("hw3.Counter")
            .unit("testCount", ScoreDescriptor::regular(1.0, "counts"), |ctx: &UnitContext| -> UnitResult {
                ctx.statics().increment("count");
                Ok(())
            })
            .build();
        let spec = &definition.units()[0];
        let ctx = UnitContext::new(
            qrunner_common::types::UnitId::new("hw3.Counter", "testCount"),
            crate::unit::CancelToken::new(),
            None,
            definition.statics().clone(),
        );
        spec.unit.run(&ctx).unwrap();
        assert_eq!(definition.statics().get("count"), Some(Value::from(1)));
    }
}
