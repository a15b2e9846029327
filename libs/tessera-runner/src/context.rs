//! Per-run bookkeeping.
//!
//! A [`RunContext`] belongs to exactly one run and is written by exactly one
//! executor. It tracks the open class and method, collects assertions, and
//! derives every status from what was recorded: callers never set one.
//!
//! ```text
//! NotStarted --begin--> Running --end--> Finished
//!                 start_class .. [start_method .. end_method]* .. end_class
//! ```

use crate::error::RunnerError;
use crate::host::AssertionEvent;
use std::time::Instant;
use tessera_common::types::{Assertion, ClassResult, ExecutionResult, MethodResult, Status, Summary};
use tracing::debug;

pub const FAULT_ACTION: &str = "Fault";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Running,
    Finished,
}

struct OpenMethod {
    name: String,
    started: Instant,
    assertions: Vec<Assertion>,
    notes: Vec<Assertion>,
    messages: Vec<String>,
    faulted: bool,
    skip_reason: Option<String>,
}

struct OpenClass {
    name: String,
    started: Instant,
    methods: Vec<MethodResult>,
    error: Option<String>,
    notes: Vec<Assertion>,
}

pub struct RunContext {
    phase: Phase,
    started: Instant,
    summary: Summary,
    classes: Vec<ClassResult>,
    class: Option<OpenClass>,
    method: Option<OpenMethod>,
    cancelled: bool,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            phase: Phase::NotStarted,
            started: Instant::now(),
            summary: Summary::default(),
            classes: Vec::new(),
            class: None,
            method: None,
            cancelled: false,
        }
    }

    pub fn begin(&mut self) -> Result<(), RunnerError> {
        if self.phase != Phase::NotStarted {
            return Err(out_of_order("begin", "run already started"));
        }
        self.phase = Phase::Running;
        self.started = Instant::now();
        self.summary = Summary::default();
        Ok(())
    }

    pub fn start_class(&mut self, name: &str) -> Result<(), RunnerError> {
        self.expect_running("start_class")?;
        if let Some(open) = &self.class {
            return Err(out_of_order(
                "start_class",
                &format!("class {} is still open", open.name),
            ));
        }
        self.class = Some(OpenClass {
            name: name.to_string(),
            started: Instant::now(),
            methods: Vec::new(),
            error: None,
            notes: Vec::new(),
        });
        Ok(())
    }

    /// Mark the open class as failed before any method ran.
    pub fn fail_class(&mut self, message: &str) -> Result<(), RunnerError> {
        let class = self.open_class("fail_class")?;
        class.error = Some(message.to_string());
        Ok(())
    }

    /// Class-level note, e.g. a failing `OnAfterAllTests`.
    pub fn record_class_note(&mut self, action: &str, description: &str, success: bool) -> Result<(), RunnerError> {
        let class = self.open_class("record_class_note")?;
        class.notes.push(assertion(action, description, success));
        Ok(())
    }

    pub fn start_method(&mut self, name: &str) -> Result<(), RunnerError> {
        self.open_class("start_method")?;
        if let Some(open) = &self.method {
            return Err(out_of_order(
                "start_method",
                &format!("method {} is still open", open.name),
            ));
        }
        self.method = Some(OpenMethod {
            name: name.to_string(),
            started: Instant::now(),
            assertions: Vec::new(),
            notes: Vec::new(),
            messages: Vec::new(),
            faulted: false,
            skip_reason: None,
        });
        Ok(())
    }

    pub fn record_event(&mut self, event: AssertionEvent) -> Result<(), RunnerError> {
        let method = self.open_method("record_event")?;
        method.assertions.push(event.into());
        Ok(())
    }

    pub fn record_message(&mut self, message: &str) -> Result<(), RunnerError> {
        let method = self.open_method("record_message")?;
        method.messages.push(message.to_string());
        Ok(())
    }

    /// Uncaught fault in the open method: marks it `error` and keeps the
    /// message as a failed synthetic assertion.
    pub fn record_fault(&mut self, message: &str) -> Result<(), RunnerError> {
        let method = self.open_method("record_fault")?;
        method.faulted = true;
        method.assertions.push(assertion(FAULT_ACTION, message, false));
        Ok(())
    }

    pub fn record_skip(&mut self, reason: &str) -> Result<(), RunnerError> {
        let method = self.open_method("record_skip")?;
        method.skip_reason = Some(reason.to_string());
        Ok(())
    }

    /// Note attached to the open method that does not affect its status.
    pub fn record_note(&mut self, action: &str, description: &str, success: bool) -> Result<(), RunnerError> {
        let method = self.open_method("record_note")?;
        method.notes.push(assertion(action, description, success));
        Ok(())
    }

    pub fn end_method(&mut self) -> Result<Status, RunnerError> {
        let method = self
            .method
            .take()
            .ok_or_else(|| out_of_order("end_method", "no method is open"))?;

        let status = if method.faulted {
            Status::Error
        } else if method.assertions.iter().any(|a| !a.success) {
            Status::Failed
        } else if method.skip_reason.is_some() {
            Status::Skipped
        } else {
            Status::Passed
        };

        let result = MethodResult {
            name: method.name,
            status,
            duration_ms: method.started.elapsed().as_millis() as u64,
            assertions: method.assertions,
            notes: method.notes,
            messages: method.messages,
            skip_reason: method.skip_reason,
        };
        debug!(method = %result.name, status = %status, assertions = result.assertions.len(), "Method finished");

        self.summary.count(status);
        self.open_class("end_method")?.methods.push(result);
        Ok(status)
    }

    /// Record a method that never ran.
    pub fn skip_method(&mut self, name: &str, reason: &str) -> Result<Status, RunnerError> {
        self.start_method(name)?;
        self.record_skip(reason)?;
        self.end_method()
    }

    pub fn end_class(&mut self) -> Result<Status, RunnerError> {
        if let Some(open) = &self.method {
            return Err(out_of_order(
                "end_class",
                &format!("method {} is still open", open.name),
            ));
        }
        let class = self
            .class
            .take()
            .ok_or_else(|| out_of_order("end_class", "no class is open"))?;

        let status = if class.error.is_some() {
            Status::Error
        } else {
            Status::worst(class.methods.iter().map(|m| m.status))
        };

        debug!(class = %class.name, status = %status, methods = class.methods.len(), "Class finished");
        self.classes.push(ClassResult {
            name: class.name,
            status,
            duration_ms: class.started.elapsed().as_millis() as u64,
            methods: class.methods,
            error: class.error,
            notes: class.notes,
        });
        Ok(status)
    }

    /// The run stopped early because cancellation was requested.
    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Close the run and hand over the finished document.
    pub fn end(mut self) -> Result<ExecutionResult, RunnerError> {
        self.expect_running("end")?;
        if self.class.is_some() {
            return Err(out_of_order("end", "a class is still open"));
        }
        self.phase = Phase::Finished;
        self.summary.duration_ms = self.started.elapsed().as_millis() as u64;

        Ok(ExecutionResult {
            status: Status::worst(self.classes.iter().map(|c| c.status)),
            cancelled: self.cancelled,
            summary: self.summary,
            classes: self.classes,
        })
    }

    fn expect_running(&self, op: &str) -> Result<(), RunnerError> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::NotStarted => Err(out_of_order(op, "run has not begun")),
            Phase::Finished => Err(out_of_order(op, "run has finished")),
        }
    }

    fn open_class(&mut self, op: &str) -> Result<&mut OpenClass, RunnerError> {
        self.expect_running(op)?;
        self.class
            .as_mut()
            .ok_or_else(|| out_of_order(op, "no class is open"))
    }

    fn open_method(&mut self, op: &str) -> Result<&mut OpenMethod, RunnerError> {
        self.expect_running(op)?;
        self.method
            .as_mut()
            .ok_or_else(|| out_of_order(op, "no method is open"))
    }
}

fn assertion(action: &str, description: &str, success: bool) -> Assertion {
    Assertion {
        action: action.to_string(),
        description: description.to_string(),
        success,
    }
}

fn out_of_order(op: &str, reason: &str) -> RunnerError {
    RunnerError::Context(format!("{}: {}", op, reason))
}
