//! Remote Test Host - the only way the runner touches the system under test
//!
//! **Boundary:**
//! - The host knows how to introspect classes and call methods by name
//! - The host does NOT know about jobs, manifests or status rules
//! - How a method is actually dispatched on the far side (direct call,
//!   call-by-name, indirection through a temporary) is the adapter's
//!   business and never leaks into the runner
//!
//! Calls are synchronous. The runner moves each one onto a blocking thread
//! behind a [`crate::guard::TimeoutGuard`], so an adapter may block freely.
//! Adapters acquire whatever connection they need per call and release it
//! before returning.

use crate::error::HostFault;
use serde::{Deserialize, Serialize};
use tessera_common::types::Assertion;

pub const BEFORE_ALL_TESTS: &str = "OnBeforeAllTests";
pub const AFTER_ALL_TESTS: &str = "OnAfterAllTests";
pub const BEFORE_ONE_TEST: &str = "OnBeforeOneTest";
pub const AFTER_ONE_TEST: &str = "OnAfterOneTest";

/// Opaque reference to a test-class instance living on the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub class_name: String,
    pub token: String,
}

/// One check reported by the host while a method ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionEvent {
    #[serde(default = "default_action")]
    pub action: String,
    #[serde(default)]
    pub description: String,
    pub success: bool,
}

fn default_action() -> String {
    "Assert".to_string()
}

impl AssertionEvent {
    pub fn new(action: impl Into<String>, description: impl Into<String>, success: bool) -> Self {
        Self {
            action: action.into(),
            description: description.into(),
            success,
        }
    }
}

impl From<AssertionEvent> for Assertion {
    fn from(event: AssertionEvent) -> Self {
        Assertion {
            action: event.action,
            description: event.description,
            success: event.success,
        }
    }
}

/// Everything the host observed while invoking one method.
///
/// A `fault` means the method raised an error it did not handle; the
/// assertions recorded before the fault are still reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(default)]
    pub assertions: Vec<AssertionEvent>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub fault: Option<String>,
    #[serde(default)]
    pub skipped: Option<String>,
}

pub trait RemoteTestHost: Send + Sync {
    /// Every class whose name starts with `prefix` followed by a dot.
    fn list_classes(&self, prefix: &str) -> Result<Vec<String>, HostFault>;

    fn class_exists(&self, name: &str) -> Result<bool, HostFault>;

    /// Superclasses of `name`. Direct parents are enough; discovery walks
    /// the chain itself.
    fn get_ancestry(&self, name: &str) -> Result<Vec<String>, HostFault>;

    /// Methods declared on the class itself, in declaration order.
    fn list_declared_methods(&self, class_name: &str) -> Result<Vec<String>, HostFault>;

    /// Whether the class overrides `method_name`. Used for lifecycle hooks.
    fn responds_to(&self, _class_name: &str, _method_name: &str) -> Result<bool, HostFault> {
        Ok(false)
    }

    fn instantiate(&self, class_name: &str) -> Result<InstanceHandle, HostFault>;

    fn invoke_method(
        &self,
        handle: &InstanceHandle,
        method_name: &str,
    ) -> Result<Invocation, HostFault>;

    /// Drop the host-side instance. Called once per successful `instantiate`.
    fn release(&self, _handle: &InstanceHandle) {}
}
