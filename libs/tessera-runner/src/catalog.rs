//! In-memory host backed by a class catalog.
//!
//! Each catalog class declares its superclasses and its methods. A method
//! carries the outcome the host should report when it is invoked, so a
//! catalog doubles as a replay of a real host session. Lifecycle hooks are
//! ordinary declared methods (`OnBeforeOneTest`, ...).

use crate::error::HostFault;
use crate::host::{AssertionEvent, InstanceHandle, Invocation, RemoteTestHost};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMethod {
    pub name: String,
    #[serde(default)]
    pub assertions: Vec<AssertionEvent>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub fault: Option<String>,
    #[serde(default)]
    pub skip: Option<String>,
    #[serde(default)]
    pub delay_ms: u64,
}

impl CatalogMethod {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn assert(mut self, action: &str, description: &str, success: bool) -> Self {
        self.assertions
            .push(AssertionEvent::new(action, description, success));
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.messages.push(message.to_string());
        self
    }

    pub fn fault(mut self, message: &str) -> Self {
        self.fault = Some(message.to_string());
        self
    }

    pub fn skip(mut self, reason: &str) -> Self {
        self.skip = Some(reason.to_string());
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    fn invocation(&self) -> Invocation {
        Invocation {
            assertions: self.assertions.clone(),
            messages: self.messages.clone(),
            fault: self.fault.clone(),
            skipped: self.skip.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogClass {
    pub name: String,
    #[serde(default)]
    pub extends: Vec<String>,
    #[serde(default)]
    pub methods: Vec<CatalogMethod>,
    #[serde(default)]
    pub instantiate_fault: Option<String>,
    #[serde(default)]
    pub instantiate_delay_ms: u64,
    #[serde(default)]
    pub introspect_fault: Option<String>,
    /// Fault for method listing only; ancestry still resolves.
    #[serde(default)]
    pub methods_fault: Option<String>,
    #[serde(default)]
    pub introspect_delay_ms: u64,
}

impl CatalogClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.extends.push(parent.to_string());
        self
    }

    pub fn method(mut self, method: CatalogMethod) -> Self {
        self.methods.push(method);
        self
    }

    pub fn instantiate_fault(mut self, message: &str) -> Self {
        self.instantiate_fault = Some(message.to_string());
        self
    }

    pub fn instantiate_delay_ms(mut self, delay_ms: u64) -> Self {
        self.instantiate_delay_ms = delay_ms;
        self
    }

    pub fn methods_fault(mut self, message: &str) -> Self {
        self.methods_fault = Some(message.to_string());
        self
    }

    pub fn introspect_fault(mut self, message: &str) -> Self {
        self.introspect_fault = Some(message.to_string());
        self
    }

    pub fn introspect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.introspect_delay_ms = delay_ms;
        self
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    classes: Vec<CatalogClass>,
}

pub struct CatalogHost {
    classes: BTreeMap<String, CatalogClass>,
    next_token: AtomicU64,
    live: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl CatalogHost {
    pub fn new(classes: impl IntoIterator<Item = CatalogClass>) -> Self {
        Self {
            classes: classes.into_iter().map(|c| (c.name.clone(), c)).collect(),
            next_token: AtomicU64::new(1),
            live: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Load a catalog from a JSON file of the form `{ "classes": [...] }`
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse catalog {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let file: CatalogFile = serde_json::from_str(content)?;
        Ok(Self::new(file.classes))
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Instances created and not yet released.
    pub fn live_instances(&self) -> usize {
        self.live.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Instances ever created, released or not.
    pub fn instances_created(&self) -> u64 {
        self.next_token.load(Ordering::SeqCst) - 1
    }

    /// `Class.Method` for every invocation, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn class(&self, name: &str) -> Result<&CatalogClass, HostFault> {
        self.classes
            .get(name)
            .ok_or_else(|| HostFault::new(format!("Class '{}' does not exist", name)))
    }

    fn introspect(&self, name: &str) -> Result<&CatalogClass, HostFault> {
        let class = self.class(name)?;
        if class.introspect_delay_ms > 0 {
            thread::sleep(Duration::from_millis(class.introspect_delay_ms));
        }
        match &class.introspect_fault {
            Some(message) => Err(HostFault::new(message.clone())),
            None => Ok(class),
        }
    }
}

impl RemoteTestHost for CatalogHost {
    fn list_classes(&self, prefix: &str) -> Result<Vec<String>, HostFault> {
        let scope = format!("{}.", prefix);
        Ok(self
            .classes
            .keys()
            .filter(|name| name.starts_with(&scope))
            .cloned()
            .collect())
    }

    fn class_exists(&self, name: &str) -> Result<bool, HostFault> {
        Ok(self.classes.contains_key(name))
    }

    fn get_ancestry(&self, name: &str) -> Result<Vec<String>, HostFault> {
        Ok(self.introspect(name)?.extends.clone())
    }

    fn list_declared_methods(&self, class_name: &str) -> Result<Vec<String>, HostFault> {
        let class = self.introspect(class_name)?;
        if let Some(message) = &class.methods_fault {
            return Err(HostFault::new(message.clone()));
        }
        Ok(class
            .methods
            .iter()
            .map(|m| m.name.clone())
            .collect())
    }

    fn responds_to(&self, class_name: &str, method_name: &str) -> Result<bool, HostFault> {
        Ok(self
            .class(class_name)?
            .methods
            .iter()
            .any(|m| m.name == method_name))
    }

    fn instantiate(&self, class_name: &str) -> Result<InstanceHandle, HostFault> {
        let class = self.class(class_name)?;
        if class.instantiate_delay_ms > 0 {
            thread::sleep(Duration::from_millis(class.instantiate_delay_ms));
        }
        if let Some(message) = &class.instantiate_fault {
            return Err(HostFault::new(message.clone()));
        }

        let token = format!(
            "{}#{}",
            class_name,
            self.next_token.fetch_add(1, Ordering::SeqCst)
        );
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.clone());

        Ok(InstanceHandle {
            class_name: class_name.to_string(),
            token,
        })
    }

    fn invoke_method(
        &self,
        handle: &InstanceHandle,
        method_name: &str,
    ) -> Result<Invocation, HostFault> {
        let is_live = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&handle.token);
        if !is_live {
            return Err(HostFault::new(format!(
                "Instance '{}' is not live",
                handle.token
            )));
        }

        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(format!("{}.{}", handle.class_name, method_name));

        let class = self.class(&handle.class_name)?;
        let method = class
            .methods
            .iter()
            .find(|m| m.name == method_name)
            .ok_or_else(|| {
                HostFault::new(format!(
                    "Method '{}' does not exist in class '{}'",
                    method_name, handle.class_name
                ))
            })?;

        if method.delay_ms > 0 {
            thread::sleep(Duration::from_millis(method.delay_ms));
        }

        Ok(method.invocation())
    }

    fn release(&self, handle: &InstanceHandle) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "classes": [
            {
                "name": "Demo.Tests.MathTest",
                "extends": ["%UnitTest.TestCase"],
                "methods": [
                    { "name": "TestAdd", "assertions": [{ "action": "AssertEquals", "description": "1+1=2", "success": true }] },
                    { "name": "Helper" }
                ]
            },
            { "name": "Demo.Util", "extends": ["%RegisteredObject"] }
        ]
    }"#;

    #[test]
    fn test_from_json() {
        let host = CatalogHost::from_json(CATALOG).unwrap();
        assert_eq!(host.class_count(), 2);
        assert_eq!(
            host.list_classes("Demo.Tests").unwrap(),
            vec!["Demo.Tests.MathTest".to_string()]
        );
        assert_eq!(
            host.list_declared_methods("Demo.Tests.MathTest").unwrap(),
            vec!["TestAdd".to_string(), "Helper".to_string()]
        );
        assert!(host.class_exists("Demo.Util").unwrap());
        assert!(!host.class_exists("Demo.Missing").unwrap());
    }

    #[test]
    fn test_list_classes_requires_dot_boundary() {
        let host = CatalogHost::new([
            CatalogClass::new("Demo.Test.A"),
            CatalogClass::new("Demo.Tests.B"),
        ]);
        assert_eq!(
            host.list_classes("Demo.Test").unwrap(),
            vec!["Demo.Test.A".to_string()]
        );
    }

    #[test]
    fn test_instance_lifecycle() {
        let host = CatalogHost::from_json(CATALOG).unwrap();
        let handle = host.instantiate("Demo.Tests.MathTest").unwrap();
        assert_eq!(host.live_instances(), 1);

        let invocation = host.invoke_method(&handle, "TestAdd").unwrap();
        assert_eq!(invocation.assertions.len(), 1);
        assert!(invocation.assertions[0].success);

        host.release(&handle);
        assert_eq!(host.live_instances(), 0);
        assert!(host.invoke_method(&handle, "TestAdd").is_err());
        assert_eq!(host.calls(), vec!["Demo.Tests.MathTest.TestAdd".to_string()]);
    }

    #[test]
    fn test_faults() {
        let host = CatalogHost::new([CatalogClass::new("Demo.Broken")
            .instantiate_fault("<UNDEFINED> %OnNew")
            .introspect_fault("class not compiled")]);
        assert_eq!(
            host.instantiate("Demo.Broken"),
            Err(HostFault::new("<UNDEFINED> %OnNew"))
        );
        assert!(host.get_ancestry("Demo.Broken").is_err());
        assert!(host.get_ancestry("Demo.Nowhere").is_err());
    }
}
