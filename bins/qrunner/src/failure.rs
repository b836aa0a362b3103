// Failure detail policies for the output sink
use qrunner_common::config::FailureDisplay;
use qrunner_common::types::{Failure, ScoreDescriptor};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives every attributed unit failure. Implementations must be thread-safe.
pub trait FailureConsumer: Send + Sync {
    fn accept(&self, q: &ScoreDescriptor, failure: &Failure, out: &mut dyn Write) -> io::Result<()>;
}

fn write_failure(
    out: &mut dyn Write,
    heading: &str,
    q: &ScoreDescriptor,
    failure: &Failure,
) -> io::Result<()> {
    writeln!(
        out,
        "{} (correct = {:.6} points, incorrect = {:.6} points): {}",
        heading, q.points, q.incorrect, q.description
    )?;
    writeln!(out, "{}", failure)?;
    if !failure.trace.is_empty() {
        write!(out, "{}", failure.trace)?;
        if !failure.trace.ends_with('\n') {
            writeln!(out)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllFailures;

impl FailureConsumer for AllFailures {
    fn accept(&self, q: &ScoreDescriptor, failure: &Failure, out: &mut dyn Write) -> io::Result<()> {
        write_failure(out, "Failure", q, failure)
    }
}

/// Shows only the first failure seen by this consumer, across all threads
#[derive(Debug, Default)]
pub struct FirstFailure {
    shown: AtomicBool,
}

impl FirstFailure {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FailureConsumer for FirstFailure {
    fn accept(&self, q: &ScoreDescriptor, failure: &Failure, out: &mut dyn Write) -> io::Result<()> {
        if self
            .shown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }
        write_failure(out, "First failure", q, failure)
    }
}

pub fn consumer_for(display: FailureDisplay) -> Arc<dyn FailureConsumer> {
    match display {
        FailureDisplay::First => Arc::new(FirstFailure::new()),
        FailureDisplay::All => Arc::new(AllFailures),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrunner_common::types::UnitId;
    use std::thread;

    fn make_failure(unit: &str) -> Failure {
        Failure::new(UnitId::new("hw1.ListTest", unit), "expected:<3> but was:<4>")
            .with_trace("at hw1.ListTest.testAdd(ListTest.java:12)")
    }

    #[test]
    fn test_all_failures_writes_each() {
        let q = ScoreDescriptor::regular(2.0, "add works").with_incorrect(-1.0);
        let mut out = Vec::new();
        AllFailures.accept(&q, &make_failure("testAdd"), &mut out).unwrap();
        AllFailures.accept(&q, &make_failure("testRemove"), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("Failure (correct = 2.000000 points, incorrect = -1.000000 points)").count(), 2);
        assert!(text.contains("testAdd(hw1.ListTest): expected:<3> but was:<4>\n"));
        assert!(text.contains("ListTest.java:12)\n"));
    }

    #[test]
    fn test_first_failure_is_one_shot() {
        let q = ScoreDescriptor::regular(1.0, "d");
        let consumer = FirstFailure::new();
        let mut out = Vec::new();
        consumer.accept(&q, &make_failure("testAdd"), &mut out).unwrap();
        consumer.accept(&q, &make_failure("testRemove"), &mut out).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("First failure"));
        assert!(!text.contains("testRemove"));
    }

    #[test]
    fn test_first_failure_across_threads() {
        let consumer = Arc::new(FirstFailure::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let consumer = consumer.clone();
                thread::spawn(move || {
                    let mut out = Vec::new();
                    let q = ScoreDescriptor::regular(1.0, "d");
                    consumer.accept(&q, &make_failure(&format!("test{}", i)), &mut out).unwrap();
                    out.len()
                })
            })
            .collect();
        let written = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|len| *len > 0)
            .count();
        assert_eq!(written, 1);
    }
}
