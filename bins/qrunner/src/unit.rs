/// Executable Units
///
/// A unit is the smallest scheduled item: one test case. The scheduler hands
/// every execution a fresh `UnitContext` carrying the unit's identity, its
/// cancellation token, the effective deadline and the `Statics` arena of the
/// group definition it was loaded from.
///
/// Cancellation is cooperative. Nothing here ever kills a thread; units are
/// expected to poll `is_cancelled()` (or use `sleep()`), and command units
/// kill their own child process when asked to stop.

use qrunner_common::types::UnitId;
use serde_json::Value;
use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Error raised by a unit body; recorded against the unit, never propagated
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub message: String,
    pub trace: String,
}

impl UnitFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: String::new(),
        }
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = trace.into();
        self
    }

    pub fn cancelled() -> Self {
        Self::new("cancelled")
    }
}

pub type UnitResult = Result<(), UnitFailure>;

pub trait Unit: Send + Sync {
    fn run(&self, ctx: &UnitContext) -> UnitResult;
}

impl<F> Unit for F
where
    F: Fn(&UnitContext) -> UnitResult + Send + Sync,
{
    fn run(&self, ctx: &UnitContext) -> UnitResult {
        self(ctx)
    }
}

/// Hierarchical cancellation flag. Cancelling a token cancels every token
/// derived from it through `child()`.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    node: Arc<TokenNode>,
}

#[derive(Debug, Default)]
struct TokenNode {
    cancelled: AtomicBool,
    parent: Option<Arc<TokenNode>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            node: Arc::new(TokenNode {
                cancelled: AtomicBool::new(false),
                parent: Some(self.node.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.node.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        let mut node = Some(&self.node);
        while let Some(current) = node {
            if current.cancelled.load(Ordering::Acquire) {
                return true;
            }
            node = current.parent.as_ref();
        }
        false
    }
}

/// Mutable "static" state of one group definition.
///
/// Every definition owns its own arena, so a group loaded fresh for a run
/// starts from empty state no matter what earlier runs stored.
#[derive(Debug, Default)]
pub struct Statics {
    slots: Mutex<HashMap<String, Value>>,
}

impl Statics {
    pub fn get(&self, key: &str) -> Option<Value> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value)
    }

    /// Increments an integer slot (missing counts as 0) and returns the new value
    pub fn increment(&self, key: &str) -> i64 {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let next = slots.get(key).and_then(Value::as_i64).unwrap_or(0) + 1;
        slots.insert(key.to_string(), Value::from(next));
        next
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

/// Everything a unit may observe about its own execution
#[derive(Debug, Clone)]
pub struct UnitContext {
    id: UnitId,
    token: CancelToken,
    deadline: Option<Instant>,
    statics: Arc<Statics>,
}

impl UnitContext {
    pub fn new(id: UnitId, token: CancelToken, deadline: Option<Instant>, statics: Arc<Statics>) -> Self {
        Self {
            id,
            token,
            deadline,
            statics,
        }
    }

    pub fn id(&self) -> &UnitId {
        &self.id
    }

    pub fn statics(&self) -> &Statics {
        &self.statics
    }

    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// True once the enclosing batch gave up on this unit or its deadline passed
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.past_deadline()
    }

    /// Sleeps in short slices, returning early with a failure if cancelled
    pub fn sleep(&self, duration: Duration) -> UnitResult {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return Err(UnitFailure::cancelled());
            }
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL.min(until - now));
        }
    }
}

/// A unit backed by an external command: exit status 0 passes, anything
/// else fails with the captured stderr (or stdout) as the trace.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandUnit {
    program: String,
    args: Vec<String>,
}

impl CommandUnit {
    /// Builds a unit from an argv list; `None` if the list is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Unit for CommandUnit {
    fn run(&self, ctx: &UnitContext) -> UnitResult {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("QRUNNER_GROUP", &ctx.id().group)
            .env("QRUNNER_UNIT", &ctx.id().unit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| UnitFailure::new(format!("failed to spawn {}: {}", self.program, e)))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(e) => {
                    return Err(UnitFailure::new(format!("failed to wait on {}: {}", self.program, e)));
                }
            }
            if ctx.is_cancelled() {
                // The process is ours to stop; the thread running us is not.
                let _ = child.kill();
                let _ = child.wait();
                return Err(UnitFailure::cancelled());
            }
            thread::sleep(POLL_INTERVAL);
        };

        // Background processes may still hold the pipes open after the child exits
        while !drained(&stdout) || !drained(&stderr) {
            if ctx.is_cancelled() {
                return Err(UnitFailure::cancelled());
            }
            thread::sleep(POLL_INTERVAL);
        }

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if status.success() {
            Ok(())
        } else {
            let trace = if stderr.trim().is_empty() { stdout } else { stderr };
            Err(UnitFailure::new(format!("{} exited with {}", self.program, status)).with_trace(trace))
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn drained(reader: &Option<JoinHandle<String>>) -> bool {
    reader.as_ref().map_or(true, JoinHandle::is_finished)
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|handle| handle.join().ok()).unwrap_or_default()
}
