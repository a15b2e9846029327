//! Test Discovery - Manifest Construction
//!
//! **Core Responsibility:**
//! Ask the host which classes under a package are test classes and which of
//! their methods are test methods, and freeze the answer into a [`Manifest`].
//!
//! **Rules:**
//! - A test class has the test-case class somewhere in its ancestry, at any
//!   depth. Ancestry is walked breadth-first with a visited set, so diamond
//!   and cyclic hierarchies terminate.
//! - A test method is declared on the class itself and starts with the
//!   configured prefix. Signatures are not checked here; a bad one shows up
//!   as a method error at execution time.
//! - Classes are ordered by name, methods by declaration order, so repeated
//!   discovery against an unchanged host yields the same manifest.
//! - A class that cannot be introspected is left out with a warning. Host
//!   timeouts abort discovery.

use crate::error::{CallError, RunnerError};
use crate::guard::TimeoutGuard;
use crate::host::RemoteTestHost;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tessera_common::config::RunnerConfig;
use tessera_common::types::{ClassManifest, Manifest};
use tracing::{debug, info, warn};

pub struct Discovery {
    host: Arc<dyn RemoteTestHost>,
    guard: TimeoutGuard,
    test_case_class: String,
    method_prefix: String,
    recursive: bool,
}

impl Discovery {
    pub fn new(host: Arc<dyn RemoteTestHost>, config: &RunnerConfig) -> Self {
        Self {
            host,
            guard: TimeoutGuard::new(config.call_timeout()),
            test_case_class: config.test_case_class.clone(),
            method_prefix: config.test_method_prefix.clone(),
            recursive: true,
        }
    }

    /// Restrict package discovery to direct members when `false`.
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// Test classes under `package_prefix`, sorted by name.
    pub async fn discover_test_classes(
        &self,
        package_prefix: &str,
    ) -> Result<Vec<String>, RunnerError> {
        let host = Arc::clone(&self.host);
        let prefix = package_prefix.to_string();
        let label = format!("list_classes({})", package_prefix);

        let mut candidates = self
            .guard
            .call(&label, move || host.list_classes(&prefix))
            .await
            .map_err(|e| RunnerError::from_discovery_call(&label, e))?;

        let scope = format!("{}.", package_prefix);
        candidates.retain(|name| match name.strip_prefix(&scope) {
            Some(rest) => !rest.is_empty() && (self.recursive || !rest.contains('.')),
            None => false,
        });
        candidates.sort();
        candidates.dedup();

        let mut classes = Vec::new();
        for candidate in candidates {
            if self.is_test_class(&candidate).await? {
                classes.push(candidate);
            } else {
                debug!(class = %candidate, "Not a test class");
            }
        }

        info!(
            package = package_prefix,
            recursive = self.recursive,
            classes = classes.len(),
            "Discovered test classes"
        );
        Ok(classes)
    }

    /// Whether `class_name` inherits the test-case class, directly or
    /// through any number of intermediate classes.
    pub async fn is_test_class(&self, class_name: &str) -> Result<bool, RunnerError> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier = VecDeque::new();
        visited.insert(class_name.to_string());
        frontier.push_back(class_name.to_string());

        while let Some(current) = frontier.pop_front() {
            let host = Arc::clone(&self.host);
            let name = current.clone();
            let label = format!("get_ancestry({})", current);

            let parents = match self
                .guard
                .call(&label, move || host.get_ancestry(&name))
                .await
            {
                Ok(parents) => parents,
                Err(e @ CallError::Timeout { .. }) => {
                    return Err(RunnerError::from_discovery_call(&label, e));
                }
                Err(e) if current == class_name => {
                    warn!(class = class_name, error = %e, "Cannot introspect class; excluding it");
                    return Ok(false);
                }
                Err(e) => {
                    debug!(class = class_name, ancestor = %current, error = %e, "Ancestor not introspectable");
                    continue;
                }
            };

            for parent in parents {
                if parent == self.test_case_class {
                    return Ok(true);
                }
                if visited.insert(parent.clone()) {
                    frontier.push_back(parent);
                }
            }
        }

        Ok(false)
    }

    /// Test methods declared on `class_name`, in declaration order.
    pub async fn discover_test_methods(&self, class_name: &str) -> Result<Vec<String>, RunnerError> {
        let host = Arc::clone(&self.host);
        let name = class_name.to_string();
        let label = format!("list_declared_methods({})", class_name);

        let declared = self
            .guard
            .call(&label, move || host.list_declared_methods(&name))
            .await
            .map_err(|e| RunnerError::from_discovery_call(&label, e))?;

        Ok(declared
            .into_iter()
            .filter(|m| m.starts_with(&self.method_prefix))
            .collect())
    }

    /// Full package discovery.
    pub async fn build_test_manifest(&self, package_prefix: &str) -> Result<Manifest, RunnerError> {
        let mut classes = Vec::new();

        for class_name in self.discover_test_classes(package_prefix).await? {
            match self.discover_test_methods(&class_name).await {
                Ok(methods) if methods.is_empty() => {
                    debug!(class = %class_name, "No test methods; skipping class");
                }
                Ok(methods) => classes.push(ClassManifest { class_name, methods }),
                Err(e @ RunnerError::Timeout { .. }) => return Err(e),
                Err(e) => {
                    warn!(class = %class_name, error = %e, "Cannot list methods; excluding class");
                }
            }
        }

        let manifest = Manifest::new(package_prefix, classes);
        info!(
            package = package_prefix,
            classes = manifest.classes.len(),
            methods = manifest.method_count(),
            "Built test manifest"
        );
        Ok(manifest)
    }

    /// Discovery narrowed to one class. A class that is not a test class
    /// yields an empty manifest.
    pub async fn build_class_manifest(&self, class_name: &str) -> Result<Manifest, RunnerError> {
        let package = class_name
            .rsplit_once('.')
            .map(|(pkg, _)| pkg)
            .unwrap_or_default();

        if !self.is_test_class(class_name).await? {
            info!(class = class_name, "Class is not a test class; nothing to run");
            return Ok(Manifest::new(package, Vec::new()));
        }

        let methods = self.discover_test_methods(class_name).await?;
        Ok(Manifest::new(
            package,
            vec![ClassManifest {
                class_name: class_name.to_string(),
                methods,
            }],
        ))
    }
}
