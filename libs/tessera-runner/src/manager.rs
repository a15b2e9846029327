//! Run Manager - one test run, start to finish
//!
//! Resolves a parsed spec against the host, builds the manifest, and hands
//! it to a fresh [`Executor`]. A manager is created per job and dropped
//! with it; there is no process-wide test manager.
//!
//! Target resolution:
//! - `Pkg.Class:Method` - single-method manifest, no discovery
//! - `Pkg.Class` (class exists on the host) - discovery narrowed to the class
//! - anything else - package discovery under that prefix

use crate::discovery::Discovery;
use crate::error::RunnerError;
use crate::executor::{CancelFlag, Executor};
use crate::guard::TimeoutGuard;
use crate::host::RemoteTestHost;
use std::sync::Arc;
use tessera_common::config::RunnerConfig;
use tessera_common::spec::{Qualifiers, TestSpec};
use tessera_common::types::{ClassManifest, ExecutionResult, Manifest};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Package(String),
    Class(String),
    Method { class_name: String, method: String },
}

pub struct Manager {
    host: Arc<dyn RemoteTestHost>,
    config: RunnerConfig,
    cancel: CancelFlag,
}

impl Manager {
    pub fn new(host: Arc<dyn RemoteTestHost>, config: &RunnerConfig, cancel: CancelFlag) -> Self {
        Self {
            host,
            config: config.clone(),
            cancel,
        }
    }

    /// Parse raw spec and qualifier strings, then run.
    pub async fn run_spec(&self, spec: &str, qualifiers: &str) -> Result<ExecutionResult, RunnerError> {
        let spec = TestSpec::parse(spec)?;
        let qualifiers = Qualifiers::parse(qualifiers)?;
        self.run(&spec, &qualifiers).await
    }

    pub async fn run(
        &self,
        spec: &TestSpec,
        qualifiers: &Qualifiers,
    ) -> Result<ExecutionResult, RunnerError> {
        let manifest = self.build_manifest(spec, qualifiers).await?;
        let executor = Executor::new(Arc::clone(&self.host), &self.config, self.cancel.clone());
        executor.run(&manifest).await
    }

    pub async fn resolve(&self, spec: &TestSpec) -> Result<Target, RunnerError> {
        if let Some(method) = &spec.method {
            return Ok(Target::Method {
                class_name: spec.target.clone(),
                method: method.clone(),
            });
        }

        let host = Arc::clone(&self.host);
        let name = spec.target.clone();
        let label = format!("class_exists({})", spec.target);
        let exists = TimeoutGuard::new(self.config.call_timeout())
            .call(&label, move || host.class_exists(&name))
            .await
            .map_err(|e| RunnerError::from_discovery_call(&label, e))?;

        Ok(if exists {
            Target::Class(spec.target.clone())
        } else {
            Target::Package(spec.target.clone())
        })
    }

    pub async fn build_manifest(
        &self,
        spec: &TestSpec,
        qualifiers: &Qualifiers,
    ) -> Result<Manifest, RunnerError> {
        let target = self.resolve(spec).await?;
        info!(spec = %spec, qualifiers = %qualifiers, target = ?target, "Resolved test spec");

        match target {
            Target::Method { class_name, method } => {
                let package = spec.parent_package().unwrap_or_default().to_string();
                Ok(Manifest::new(
                    package,
                    vec![ClassManifest {
                        class_name,
                        methods: vec![method],
                    }],
                ))
            }
            Target::Class(class_name) => {
                Discovery::new(Arc::clone(&self.host), &self.config)
                    .build_class_manifest(&class_name)
                    .await
            }
            Target::Package(prefix) => {
                Discovery::new(Arc::clone(&self.host), &self.config)
                    .recursive(qualifiers.recursive())
                    .build_test_manifest(&prefix)
                    .await
            }
        }
    }
}
