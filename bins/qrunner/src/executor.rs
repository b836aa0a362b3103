/// Run Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Turn a configuration and a list of group names into one scored run.
///
/// **Architecture:**
/// 1. Load every group through a fresh isolating loader (loader.rs)
/// 2. Collect declared descriptors and wire up the aggregator (aggregator.rs)
/// 3. Build the execution tree and run it under the budget (scheduler.rs)
/// 4. Render the summary and return a machine-readable record
///
/// This module is the glue layer - it knows nothing about:
/// - How groups are isolated (loader's job)
/// - How units are timed (scheduler's job)
/// - How points are counted (aggregator's job)

use crate::aggregator::{Aggregator, Sink};
use crate::descriptor::{policy_for, CatalogDescriptors, DescriptorResolver};
use crate::failure::consumer_for;
use crate::formatter::ScoreLineFormatter;
use crate::loader::{ChildFirstResolver, GroupDefinition, IsolatingLoader, Resolver, SharedResolver};
use crate::scheduler::{build_plan, Budget, Concurrency, RunListener, Scheduler, WorkerPool};
use anyhow::{Context, Result};
use qrunner_common::config::RunnerConfig;
use qrunner_common::types::RunRecord;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct Executor {
    config: RunnerConfig,
    shared: Arc<SharedResolver>,
}

impl Executor {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(SharedResolver::default()),
        }
    }

    /// Replaces the process-level resolver that classpath lookups fall back to
    pub fn with_shared(mut self, shared: Arc<SharedResolver>) -> Self {
        self.shared = shared;
        self
    }

    /// Loads each named group in its own isolating loader.
    ///
    /// Returns the loaded definitions and the names that could not be found.
    /// Only I/O failures are errors.
    pub fn load_groups(&self, names: &[String]) -> Result<(Vec<Arc<GroupDefinition>>, Vec<String>)> {
        let classpath: Arc<dyn Resolver> = Arc::new(ChildFirstResolver::from_classpath(
            &self.config.classpath,
            self.shared.clone(),
        ));

        let mut groups = Vec::new();
        let mut not_found = Vec::new();
        for name in names {
            let loader = IsolatingLoader::new(&self.config.isolated_prefix, classpath.clone());
            match loader.resolve(name) {
                Ok(group) => groups.push(group),
                Err(e) if e.is_fatal() => {
                    return Err(e).with_context(|| format!("Failed to load group {}", name));
                }
                Err(e) => {
                    error!(group = %name, error = %e, "Could not load group");
                    not_found.push(name.clone());
                }
            }
        }

        if !not_found.is_empty() {
            error!("Cannot find tests: {}", not_found.join(" "));
        }
        Ok((groups, not_found))
    }

    /// Runs the named groups, writing failures and the summary to `output` and score lines to `scores`
    pub async fn execute(&self, names: &[String], output: Sink, scores: Sink) -> Result<RunRecord> {
        let (groups, not_found) = self.load_groups(names)?;
        if groups.is_empty() {
            info!("No tests to run!");
        } else {
            let loaded: Vec<&str> = groups.iter().map(|g| g.name()).collect();
            info!("Starting tests: {}", loaded.join(" "));
        }

        let resolver = DescriptorResolver::new(
            Arc::new(CatalogDescriptors::from_groups(&groups)),
            policy_for(self.config.missing_descriptor),
        );
        let aggregator = Arc::new(
            Aggregator::new(resolver, output, scores)
                .with_formatter(Arc::new(ScoreLineFormatter))
                .with_failure_consumer(consumer_for(self.config.failure_display)),
        );

        let listener: Arc<dyn RunListener> = aggregator.clone();
        let scheduler = Scheduler::new(
            WorkerPool::from_workers(self.config.workers),
            Arc::new(Budget::new(Duration::from_secs(self.config.timeout_secs))),
            listener,
        );
        let concurrency = Concurrency {
            groups: self.config.parallel_groups,
            units: self.config.parallel_units,
        };

        let report = scheduler.run(build_plan(&groups, concurrency)).await?;

        if report.timed_out {
            let running: Vec<String> = aggregator
                .in_flight()
                .iter()
                .map(|(id, q)| format!("{} [{}]", id, q.description))
                .collect();
            error!(
                timeout_secs = self.config.timeout_secs,
                "Exceeded timeout of {} seconds. Running test(s): {}",
                self.config.timeout_secs,
                running.join(", ")
            );
        }

        if let Err(e) = aggregator.finish_run() {
            warn!(error = %e, "Failed to write run summary");
        }
        info!(
            completed = report.completed,
            total = report.total,
            "Executed {} out of {} total test groups.",
            report.completed,
            report.total
        );

        Ok(RunRecord {
            report,
            summary: aggregator.summary(),
            not_found,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemorySource;
    use crate::unit::{UnitContext, UnitFailure, UnitResult};
    use qrunner_common::config::MissingDescriptor;
    use qrunner_common::types::{Category, ScoreDescriptor};
    use std::io::{self, Write};
    use std::sync::{Mutex, PoisonError};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap_or_else(PoisonError::into_inner).extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn make_config() -> RunnerConfig {
        RunnerConfig {
            timeout_secs: 5,
            workers: Some(2),
            ..RunnerConfig::default()
        }
    }

    fn make_shared() -> Arc<SharedResolver> {
        let shared = SharedResolver::default();
        shared.register(
            GroupDefinition::builder("lib.Checks")
                .unit("testPasses", ScoreDescriptor::regular(2.0, "passes"), |_: &UnitContext| -> UnitResult {
                    Ok(())
                })
                .unit(
                    "testFails",
                    ScoreDescriptor::regular(3.0, "fails").with_incorrect(-1.0),
                    |_: &UnitContext| -> UnitResult { Err(UnitFailure::new("expected 1 but was 2")) },
                )
                .unit("testBonus", ScoreDescriptor::extra_credit(1.0, "bonus"), |_: &UnitContext| -> UnitResult {
                    Ok(())
                })
                .build(),
        );
        Arc::new(shared)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_execute_scores_registered_group() {
        let executor = Executor::new(make_config()).with_shared(make_shared());
        let output = SharedBuffer::default();
        let scores = SharedBuffer::default();

        let record = executor
            .execute(&["lib.Checks".to_string()], Box::new(output.clone()), Box::new(scores.clone()))
            .await
            .unwrap();

        assert!(record.report.is_complete());
        assert!(record.not_found.is_empty());
        assert_eq!(record.summary.earned(Category::Regular), 1.0);
        assert_eq!(record.summary.earned(Category::ExtraCredit), 1.0);

        let lines = scores.text();
        assert!(lines.contains("2.000000|0|passes\n"));
        assert!(lines.contains("-1.000000|0|fails\n"));
        assert!(lines.contains("1.000000|1|bonus\n"));

        let text = output.text();
        assert!(text.contains("First failure (correct = 3.000000 points, incorrect = -1.000000 points): fails"));
        assert!(text.contains("Ran 3 total test(s) with 1 failure(s)."));
        assert!(text.contains("Total points (REGULAR): 1.0 out of 5.0."));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_group_is_reported_not_fatal() {
        let executor = Executor::new(make_config()).with_shared(make_shared());
        let record = executor
            .execute(
                &["lib.Checks".to_string(), "hw0.NonExistent".to_string()],
                Box::new(io::sink()),
                Box::new(io::sink()),
            )
            .await
            .unwrap();

        assert_eq!(record.not_found, vec!["hw0.NonExistent".to_string()]);
        assert_eq!(record.report.total, 1);
        assert_eq!(record.report.completed, 1);
    }

    #[test]
    fn test_isolated_groups_load_fresh_per_name() {
        let manifest = r#"{"units": [{"name": "testA", "command": ["true"], "q": {"desc": "a", "points": 1}}]}"#;
        let shared = Arc::new(SharedResolver::new(vec![Box::new(
            MemorySource::new().with_group("hw1.ListTest", manifest),
        )]));
        let executor = Executor::new(make_config()).with_shared(shared.clone());

        let names = vec!["hw1.ListTest".to_string(), "hw1.ListTest".to_string()];
        let (groups, not_found) = executor.load_groups(&names).unwrap();
        assert!(not_found.is_empty());
        assert_eq!(groups.len(), 2);
        assert!(!Arc::ptr_eq(&groups[0], &groups[1]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_descriptor_abort_is_an_error() {
        let shared = SharedResolver::default();
        shared.register(
            GroupDefinition::builder("lib.Bare")
                .undescribed("testNoScore", |_: &UnitContext| -> UnitResult { Ok(()) })
                .build(),
        );
        let config = RunnerConfig {
            missing_descriptor: MissingDescriptor::Abort,
            ..make_config()
        };
        let executor = Executor::new(config).with_shared(Arc::new(shared));

        let err = executor
            .execute(&["lib.Bare".to_string()], Box::new(io::sink()), Box::new(io::sink()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing score descriptor"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_command_units_from_classpath() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("hw2")).unwrap();
        std::fs::write(
            dir.path().join("hw2/Shell.json"),
            r#"{"units": [
                {"name": "testTrue", "command": ["true"], "q": {"desc": "true exits 0", "points": 2}},
                {"name": "testFalse", "command": ["false"], "q": {"desc": "false exits 1", "points": 2}}
            ]}"#,
        )
        .unwrap();

        let config = RunnerConfig {
            classpath: vec![dir.path().to_path_buf()],
            failure_display: qrunner_common::config::FailureDisplay::All,
            ..make_config()
        };
        let record = Executor::new(config)
            .execute(&["hw2.Shell".to_string()], Box::new(io::sink()), Box::new(io::sink()))
            .await
            .unwrap();

        assert_eq!(record.summary.units_run, 2);
        assert_eq!(record.summary.units_failed, 1);
        assert_eq!(record.summary.earned(Category::Regular), 2.0);
        assert_eq!(record.summary.available(Category::Regular), 4.0);
    }
}
