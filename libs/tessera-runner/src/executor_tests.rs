/// Executor behavior against an in-memory catalog host
///
/// Covers:
/// 1. Status derivation and summary counts
/// 2. Containment of instantiation failures, faults and method timeouts
/// 3. Lifecycle hook ordering and hook failures
/// 4. Cancellation at method boundaries
/// 5. Every host instance is released, including ones created after
///    their instantiate call timed out

#[cfg(test)]
mod execution_tests {
    use crate::catalog::{CatalogClass, CatalogHost, CatalogMethod};
    use crate::executor::{CancelFlag, Executor};
    use crate::host::{AFTER_ALL_TESTS, AFTER_ONE_TEST, BEFORE_ALL_TESTS, BEFORE_ONE_TEST};
    use std::sync::Arc;
    use std::time::Duration;
    use tessera_common::config::RunnerConfig;
    use tessera_common::types::{ClassManifest, ExecutionResult, Manifest, Status};

    const TEST_CASE: &str = "%UnitTest.TestCase";

    fn manifest(classes: &[(&str, &[&str])]) -> Manifest {
        Manifest::new(
            "Demo",
            classes
                .iter()
                .map(|(name, methods)| ClassManifest {
                    class_name: name.to_string(),
                    methods: methods.iter().map(|m| m.to_string()).collect(),
                })
                .collect(),
        )
    }

    async fn execute(host: &Arc<CatalogHost>, config: &RunnerConfig, manifest: &Manifest) -> ExecutionResult {
        Executor::new(host.clone(), config, CancelFlag::new())
            .run(manifest)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pass_fail_summary() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Math")
            .extends(TEST_CASE)
            .method(
                CatalogMethod::new("TestX")
                    .assert("AssertEquals", "1+1=2", true)
                    .assert("AssertTrue", "1>0", true),
            )
            .method(
                CatalogMethod::new("TestY")
                    .assert("AssertEquals", "2*2=4", true)
                    .assert("AssertEquals", "2*2=5", false),
            )]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.Math", &["TestX", "TestY"])]),
        )
        .await;

        assert_eq!(result.summary.total, 2);
        assert_eq!(result.summary.passed, 1);
        assert_eq!(result.summary.failed, 1);
        assert_eq!(result.summary.errors, 0);
        assert_eq!(result.status, Status::Failed);
        assert!(!result.cancelled);

        let class = &result.classes[0];
        assert_eq!(class.status, Status::Failed);
        assert_eq!(class.methods[0].assertions.len(), 2);
        assert_eq!(class.methods[1].status, Status::Failed);
        assert!(!class.methods[1].assertions[1].success);
        assert_eq!(host.live_instances(), 0);
    }

    #[tokio::test]
    async fn test_instantiation_failure_does_not_stop_siblings() {
        let host = Arc::new(CatalogHost::new([
            CatalogClass::new("Demo.Broken")
                .extends(TEST_CASE)
                .instantiate_fault("<UNDEFINED> %OnNew")
                .method(CatalogMethod::new("TestA")),
            CatalogClass::new("Demo.Fine")
                .extends(TEST_CASE)
                .method(CatalogMethod::new("TestB").assert("AssertTrue", "ok", true)),
        ]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.Broken", &["TestA"]), ("Demo.Fine", &["TestB"])]),
        )
        .await;

        let broken = &result.classes[0];
        assert_eq!(broken.status, Status::Error);
        assert!(broken.methods.is_empty());
        assert!(broken
            .error
            .as_deref()
            .unwrap()
            .starts_with("instantiation failed"));

        assert_eq!(result.classes[1].status, Status::Passed);
        assert_eq!(result.summary.total, 1);
        assert_eq!(result.summary.passed, 1);
        assert_eq!(result.status, Status::Error);
    }

    #[tokio::test]
    async fn test_late_instance_is_released() {
        let host = Arc::new(CatalogHost::new([
            CatalogClass::new("Demo.SlowStart")
                .extends(TEST_CASE)
                .instantiate_delay_ms(200)
                .method(CatalogMethod::new("TestA")),
            CatalogClass::new("Demo.Fine")
                .extends(TEST_CASE)
                .method(CatalogMethod::new("TestB").assert("AssertTrue", "ok", true)),
        ]));
        let config = RunnerConfig {
            method_timeout_ms: 20,
            ..RunnerConfig::default()
        };

        let result = execute(
            &host,
            &config,
            &manifest(&[("Demo.SlowStart", &["TestA"]), ("Demo.Fine", &["TestB"])]),
        )
        .await;

        let slow = &result.classes[0];
        assert_eq!(slow.status, Status::Error);
        assert!(slow.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(result.classes[1].status, Status::Passed);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while host.instances_created() < 2 || host.live_instances() > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "created {}, live {}",
                host.instances_created(),
                host.live_instances()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!host.calls().contains(&"Demo.SlowStart.TestA".to_string()));
    }

    #[tokio::test]
    async fn test_fault_is_contained_to_method() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Faulty")
            .extends(TEST_CASE)
            .method(
                CatalogMethod::new("TestBoom")
                    .assert("AssertTrue", "before fault", true)
                    .fault("<DIVIDE> zTestBoom+3"),
            )
            .method(CatalogMethod::new("TestAfter").assert("AssertTrue", "still runs", true))]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.Faulty", &["TestBoom", "TestAfter"])]),
        )
        .await;

        let methods = &result.classes[0].methods;
        assert_eq!(methods[0].status, Status::Error);
        assert_eq!(methods[0].assertions.len(), 2);
        assert!(methods[0].assertions[0].success);
        assert_eq!(methods[0].assertions[1].description, "<DIVIDE> zTestBoom+3");
        assert_eq!(methods[1].status, Status::Passed);
        assert_eq!(result.summary.errors, 1);
        assert_eq!(result.summary.passed, 1);
    }

    #[tokio::test]
    async fn test_method_timeout_is_method_error() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Slow")
            .extends(TEST_CASE)
            .method(CatalogMethod::new("TestHang").delay_ms(1_000))
            .method(CatalogMethod::new("TestQuick").assert("AssertTrue", "quick", true))]));
        let config = RunnerConfig {
            method_timeout_ms: 50,
            ..RunnerConfig::default()
        };

        let started = std::time::Instant::now();
        let result = execute(
            &host,
            &config,
            &manifest(&[("Demo.Slow", &["TestHang", "TestQuick"])]),
        )
        .await;

        assert!(started.elapsed() < Duration::from_millis(900));
        let methods = &result.classes[0].methods;
        assert_eq!(methods[0].status, Status::Error);
        assert!(methods[0].assertions[0].description.contains("timed out"));
        assert_eq!(methods[1].status, Status::Passed);
    }

    #[tokio::test]
    async fn test_hooks_run_in_order() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Hooked")
            .extends(TEST_CASE)
            .method(CatalogMethod::new(BEFORE_ALL_TESTS))
            .method(CatalogMethod::new(AFTER_ALL_TESTS))
            .method(CatalogMethod::new(BEFORE_ONE_TEST))
            .method(CatalogMethod::new(AFTER_ONE_TEST))
            .method(CatalogMethod::new("TestA"))
            .method(CatalogMethod::new("TestB"))]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.Hooked", &["TestA", "TestB"])]),
        )
        .await;

        assert_eq!(result.status, Status::Passed);
        let expected: Vec<String> = [
            BEFORE_ALL_TESTS,
            BEFORE_ONE_TEST,
            "TestA",
            AFTER_ONE_TEST,
            BEFORE_ONE_TEST,
            "TestB",
            AFTER_ONE_TEST,
            AFTER_ALL_TESTS,
        ]
        .iter()
        .map(|m| format!("Demo.Hooked.{}", m))
        .collect();
        assert_eq!(host.calls(), expected);
        assert_eq!(host.live_instances(), 0);
    }

    #[tokio::test]
    async fn test_setup_fault_skips_body_and_teardown() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Setup")
            .extends(TEST_CASE)
            .method(CatalogMethod::new(BEFORE_ONE_TEST).fault("fixture missing"))
            .method(CatalogMethod::new(AFTER_ONE_TEST))
            .method(CatalogMethod::new("TestA"))]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.Setup", &["TestA"])]),
        )
        .await;

        let method = &result.classes[0].methods[0];
        assert_eq!(method.status, Status::Error);
        assert_eq!(
            method.assertions[0].description,
            format!("{}: fixture missing", BEFORE_ONE_TEST)
        );
        assert_eq!(host.calls(), vec![format!("Demo.Setup.{}", BEFORE_ONE_TEST)]);
    }

    #[tokio::test]
    async fn test_teardown_failure_is_note_only() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Teardown")
            .extends(TEST_CASE)
            .method(CatalogMethod::new(AFTER_ONE_TEST).fault("cleanup failed"))
            .method(CatalogMethod::new("TestA").assert("AssertTrue", "ok", true))]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.Teardown", &["TestA"])]),
        )
        .await;

        let method = &result.classes[0].methods[0];
        assert_eq!(method.status, Status::Passed);
        assert_eq!(method.notes.len(), 1);
        assert_eq!(method.notes[0].description, "cleanup failed");
        assert!(!method.notes[0].success);
    }

    #[tokio::test]
    async fn test_class_hook_failures() {
        let host = Arc::new(CatalogHost::new([
            CatalogClass::new("Demo.NoSetup")
                .extends(TEST_CASE)
                .method(CatalogMethod::new(BEFORE_ALL_TESTS).fault("no database"))
                .method(CatalogMethod::new("TestA")),
            CatalogClass::new("Demo.NoCleanup")
                .extends(TEST_CASE)
                .method(CatalogMethod::new(AFTER_ALL_TESTS).fault("drop failed"))
                .method(CatalogMethod::new("TestB").assert("AssertTrue", "ok", true)),
        ]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.NoSetup", &["TestA"]), ("Demo.NoCleanup", &["TestB"])]),
        )
        .await;

        let no_setup = &result.classes[0];
        assert_eq!(no_setup.status, Status::Error);
        assert!(no_setup.methods.is_empty());
        assert!(no_setup.error.as_deref().unwrap().contains("no database"));

        let no_cleanup = &result.classes[1];
        assert_eq!(no_cleanup.status, Status::Passed);
        assert_eq!(no_cleanup.notes.len(), 1);
        assert_eq!(no_cleanup.notes[0].description, "drop failed");

        assert!(!host.calls().contains(&"Demo.NoSetup.TestA".to_string()));
        assert_eq!(host.live_instances(), 0);
    }

    #[tokio::test]
    async fn test_messages_and_skip() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Skippy")
            .extends(TEST_CASE)
            .method(
                CatalogMethod::new("TestSkipped")
                    .message("checking platform")
                    .skip("not supported on this platform"),
            )]));

        let result = execute(
            &host,
            &RunnerConfig::default(),
            &manifest(&[("Demo.Skippy", &["TestSkipped"])]),
        )
        .await;

        let method = &result.classes[0].methods[0];
        assert_eq!(method.status, Status::Skipped);
        assert_eq!(method.messages, vec!["checking platform".to_string()]);
        assert_eq!(
            method.skip_reason.as_deref(),
            Some("not supported on this platform")
        );
        assert_eq!(result.summary.skipped, 1);
        assert_eq!(result.status, Status::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_everything() {
        let host = Arc::new(CatalogHost::new([CatalogClass::new("Demo.Math")
            .extends(TEST_CASE)
            .method(CatalogMethod::new("TestA"))
            .method(CatalogMethod::new("TestB"))]));
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = Executor::new(host.clone(), &RunnerConfig::default(), cancel)
            .run(&manifest(&[("Demo.Math", &["TestA", "TestB"])]))
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.summary.total, 2);
        assert_eq!(result.summary.skipped, 2);
        assert!(result.classes[0]
            .methods
            .iter()
            .all(|m| m.skip_reason.as_deref() == Some("cancelled before execution")));
        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_mid_run_keeps_completed_methods() {
        let host = Arc::new(CatalogHost::new([
            CatalogClass::new("Demo.First")
                .extends(TEST_CASE)
                .method(
                    CatalogMethod::new("TestSlow")
                        .delay_ms(300)
                        .assert("AssertTrue", "slow", true),
                )
                .method(CatalogMethod::new("TestNext")),
            CatalogClass::new("Demo.Second")
                .extends(TEST_CASE)
                .method(CatalogMethod::new("TestOther")),
        ]));
        let cancel = CancelFlag::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = Executor::new(host.clone(), &RunnerConfig::default(), cancel)
            .run(&manifest(&[
                ("Demo.First", &["TestSlow", "TestNext"]),
                ("Demo.Second", &["TestOther"]),
            ]))
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.classes[0].methods[0].status, Status::Passed);
        assert_eq!(result.classes[0].methods[1].status, Status::Skipped);
        assert_eq!(result.classes[1].methods[0].status, Status::Skipped);
        assert_eq!(result.summary.total, 3);
        assert_eq!(result.summary.passed, 1);
        assert_eq!(result.summary.skipped, 2);
        assert_eq!(host.calls(), vec!["Demo.First.TestSlow".to_string()]);
        assert_eq!(host.live_instances(), 0);
    }
}
