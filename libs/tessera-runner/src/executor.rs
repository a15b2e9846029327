//! Manifest Executor
//!
//! **Responsibility:**
//! Walk a [`Manifest`] in order, drive every class and method through the
//! host, and feed what comes back into a fresh [`RunContext`].
//!
//! **Containment rules:**
//! - A class that cannot be instantiated (or whose `OnBeforeAllTests`
//!   faults) is recorded as `error` and the run moves on to the next class
//! - A method that faults or times out is recorded as `error` with the
//!   message as a failed assertion; siblings still run
//! - Teardown problems become notes and never change a method's status
//! - Cancellation is checked between methods only; everything after the
//!   checkpoint is recorded as skipped
//!
//! - An instance created after its `instantiate` call was abandoned is
//!   released as soon as it arrives
//!
//! Every executor owns its own context. Nothing here is shared between runs.

use crate::context::RunContext;
use crate::error::{CallError, RunnerError};
use crate::guard::TimeoutGuard;
use crate::host::{
    InstanceHandle, Invocation, RemoteTestHost, AFTER_ALL_TESTS, AFTER_ONE_TEST, BEFORE_ALL_TESTS,
    BEFORE_ONE_TEST,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_common::config::RunnerConfig;
use tessera_common::types::{ClassManifest, ExecutionResult, Manifest};
use tracing::{debug, info, instrument, warn};

const CANCELLED_REASON: &str = "cancelled before execution";

/// Cooperative cancellation flag shared between a job record and its run.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Lifecycle hooks a class overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Hooks {
    before_all: bool,
    after_all: bool,
    before_each: bool,
    after_each: bool,
}

/// Host-side instance that must be released exactly once.
///
/// `release` is the normal path; `Drop` covers a run future that is dropped
/// mid-class (job deadline) and releases on a blocking thread.
struct InstanceGuard {
    host: Arc<dyn RemoteTestHost>,
    handle: Option<InstanceHandle>,
}

impl InstanceGuard {
    fn new(host: Arc<dyn RemoteTestHost>, handle: InstanceHandle) -> Self {
        Self {
            host,
            handle: Some(handle),
        }
    }

    fn handle(&self) -> Option<&InstanceHandle> {
        self.handle.as_ref()
    }

    async fn release(mut self, guard: &TimeoutGuard) {
        if let Some(handle) = self.handle.take() {
            let host = Arc::clone(&self.host);
            let label = format!("release({})", handle.token);
            let released = guard
                .call(&label, move || {
                    host.release(&handle);
                    Ok(())
                })
                .await;
            if let Err(e) = released {
                warn!(error = %e, "Failed to release host instance");
            }
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let host = Arc::clone(&self.host);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || host.release(&handle));
                }
                Err(_) => host.release(&handle),
            }
        }
    }
}

pub struct Executor {
    host: Arc<dyn RemoteTestHost>,
    method_guard: TimeoutGuard,
    probe_guard: TimeoutGuard,
    cancel: CancelFlag,
}

impl Executor {
    pub fn new(host: Arc<dyn RemoteTestHost>, config: &RunnerConfig, cancel: CancelFlag) -> Self {
        Self {
            host,
            method_guard: TimeoutGuard::new(config.method_timeout()),
            probe_guard: TimeoutGuard::new(config.call_timeout()),
            cancel,
        }
    }

    /// Execute every class and method of `manifest` in order.
    pub async fn run(&self, manifest: &Manifest) -> Result<ExecutionResult, RunnerError> {
        let mut ctx = RunContext::new();
        ctx.begin()?;

        info!(
            package = %manifest.package_prefix,
            classes = manifest.classes.len(),
            methods = manifest.method_count(),
            "Executing manifest"
        );

        for class in &manifest.classes {
            if self.cancel.is_cancelled() {
                ctx.mark_cancelled();
                skip_class(&mut ctx, class)?;
                continue;
            }
            self.run_class(&mut ctx, class).await?;
        }

        let result = ctx.end()?;
        info!(
            status = %result.status,
            total = result.summary.total,
            passed = result.summary.passed,
            failed = result.summary.failed,
            errors = result.summary.errors,
            skipped = result.summary.skipped,
            cancelled = result.cancelled,
            duration_ms = result.summary.duration_ms,
            "Manifest executed"
        );
        Ok(result)
    }

    #[instrument(skip(self, ctx, class), fields(class = %class.class_name))]
    async fn run_class(&self, ctx: &mut RunContext, class: &ClassManifest) -> Result<(), RunnerError> {
        ctx.start_class(&class.class_name)?;

        let host = Arc::clone(&self.host);
        let late_host = Arc::clone(&self.host);
        let name = class.class_name.clone();
        let label = format!("instantiate({})", class.class_name);
        let handle = match self
            .method_guard
            .call_reclaiming(
                &label,
                move || host.instantiate(&name),
                move |handle: InstanceHandle| {
                    warn!(token = %handle.token, "Releasing instance created after its deadline");
                    late_host.release(&handle);
                },
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "Instantiation failed; skipping class");
                ctx.fail_class(&format!("instantiation failed: {}", e))?;
                ctx.end_class()?;
                return Ok(());
            }
        };
        let instance = InstanceGuard::new(Arc::clone(&self.host), handle);
        let hooks = self.detect_hooks(&class.class_name).await;

        if hooks.before_all {
            if let Some(failure) = hook_failure(self.invoke(&instance, BEFORE_ALL_TESTS).await) {
                warn!(error = %failure, "OnBeforeAllTests failed; skipping class");
                ctx.fail_class(&format!("{}: {}", BEFORE_ALL_TESTS, failure))?;
                ctx.end_class()?;
                instance.release(&self.probe_guard).await;
                return Ok(());
            }
        }

        for (idx, method) in class.methods.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!(
                    completed = idx,
                    remaining = class.methods.len() - idx,
                    "Cancellation requested; skipping remaining methods"
                );
                ctx.mark_cancelled();
                for rest in &class.methods[idx..] {
                    ctx.skip_method(rest, CANCELLED_REASON)?;
                }
                break;
            }
            self.run_method(ctx, &instance, hooks, method).await?;
        }

        if hooks.after_all {
            if let Some(failure) = hook_failure(self.invoke(&instance, AFTER_ALL_TESTS).await) {
                warn!(error = %failure, "OnAfterAllTests failed");
                ctx.record_class_note(AFTER_ALL_TESTS, &failure, false)?;
            }
        }

        ctx.end_class()?;
        instance.release(&self.probe_guard).await;
        Ok(())
    }

    async fn run_method(
        &self,
        ctx: &mut RunContext,
        instance: &InstanceGuard,
        hooks: Hooks,
        method: &str,
    ) -> Result<(), RunnerError> {
        ctx.start_method(method)?;

        let mut setup_ok = true;
        if hooks.before_each {
            match self.invoke(instance, BEFORE_ONE_TEST).await {
                Ok(invocation) => {
                    setup_ok = invocation.fault.is_none();
                    absorb(ctx, invocation, Some(BEFORE_ONE_TEST))?;
                }
                Err(e) => {
                    setup_ok = false;
                    ctx.record_fault(&format!("{}: {}", BEFORE_ONE_TEST, e))?;
                }
            }
        }

        if setup_ok {
            match self.invoke(instance, method).await {
                Ok(invocation) => absorb(ctx, invocation, None)?,
                Err(e) => {
                    warn!(method, error = %e, "Test method did not complete");
                    ctx.record_fault(&e.to_string())?;
                }
            }

            if hooks.after_each {
                match self.invoke(instance, AFTER_ONE_TEST).await {
                    Ok(invocation) => {
                        for event in invocation.assertions {
                            ctx.record_note(&event.action, &event.description, event.success)?;
                        }
                        if let Some(fault) = invocation.fault {
                            ctx.record_note(AFTER_ONE_TEST, &fault, false)?;
                        }
                    }
                    Err(e) => ctx.record_note(AFTER_ONE_TEST, &e.to_string(), false)?,
                }
            }
        }

        let status = ctx.end_method()?;
        debug!(method, status = %status, "Test method finished");
        Ok(())
    }

    async fn invoke(&self, instance: &InstanceGuard, method: &str) -> Result<Invocation, CallError> {
        let handle = instance
            .handle()
            .cloned()
            .ok_or_else(|| CallError::Aborted("instance already released".to_string()))?;
        let host = Arc::clone(&self.host);
        let method_name = method.to_string();
        let label = format!("{}.{}", handle.class_name, method);

        self.method_guard
            .call(&label, move || host.invoke_method(&handle, &method_name))
            .await
    }

    async fn detect_hooks(&self, class_name: &str) -> Hooks {
        Hooks {
            before_all: self.responds_to(class_name, BEFORE_ALL_TESTS).await,
            after_all: self.responds_to(class_name, AFTER_ALL_TESTS).await,
            before_each: self.responds_to(class_name, BEFORE_ONE_TEST).await,
            after_each: self.responds_to(class_name, AFTER_ONE_TEST).await,
        }
    }

    async fn responds_to(&self, class_name: &str, hook: &str) -> bool {
        let host = Arc::clone(&self.host);
        let class = class_name.to_string();
        let method = hook.to_string();
        let label = format!("responds_to({}, {})", class_name, hook);

        match self
            .probe_guard
            .call(&label, move || host.responds_to(&class, &method))
            .await
        {
            Ok(found) => found,
            Err(e) => {
                debug!(class = class_name, hook, error = %e, "Hook probe failed; assuming absent");
                false
            }
        }
    }
}

/// Feed one invocation into the open method. `hook` prefixes fault text
/// when the invocation was a lifecycle hook.
fn absorb(ctx: &mut RunContext, invocation: Invocation, hook: Option<&str>) -> Result<(), RunnerError> {
    for event in invocation.assertions {
        ctx.record_event(event)?;
    }
    for message in &invocation.messages {
        ctx.record_message(message)?;
    }
    if let Some(reason) = &invocation.skipped {
        ctx.record_skip(reason)?;
    }
    if let Some(fault) = &invocation.fault {
        match hook {
            Some(hook) => ctx.record_fault(&format!("{}: {}", hook, fault))?,
            None => ctx.record_fault(fault)?,
        }
    }
    Ok(())
}

/// Failure text of a class-level hook call, if it failed.
fn hook_failure(result: Result<Invocation, CallError>) -> Option<String> {
    match result {
        Ok(invocation) => invocation.fault.or_else(|| {
            invocation
                .assertions
                .iter()
                .find(|a| !a.success)
                .map(|a| format!("{} failed: {}", a.action, a.description))
        }),
        Err(e) => Some(e.to_string()),
    }
}

fn skip_class(ctx: &mut RunContext, class: &ClassManifest) -> Result<(), RunnerError> {
    ctx.start_class(&class.class_name)?;
    for method in &class.methods {
        ctx.skip_method(method, CANCELLED_REASON)?;
    }
    ctx.end_class()?;
    Ok(())
}
