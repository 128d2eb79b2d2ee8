/// Docker integration tests for the isolation runner and grading entry points
///
/// These tests verify against a real daemon that:
/// 1. Passing and failing submissions are graded correctly
/// 2. Runaway programs are stopped within the timeout plus grace
/// 3. Sandboxes have no network access
/// 4. No sandbox container outlives its run, even when the run is cancelled
/// 5. Output floods are cut off at the output limit
///
/// Run with `cargo test -p tutor-grader -- --ignored` on a host with Docker.

#[cfg(test)]
mod docker_tests {
    use crate::engine::{DockerBackend, IsolationRunner, WAIT_GRACE};
    use crate::executor::Grader;
    use crate::language::Runtime;
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tutor_common::config::SandboxLimits;
    use tutor_common::types::{parse_test_case_list, Correctness, FailureKind};

    fn docker() -> Arc<DockerBackend> {
        Arc::new(DockerBackend::connect().expect("Failed to connect to Docker"))
    }

    fn grader(backend: &Arc<DockerBackend>) -> Grader {
        Grader::new(
            IsolationRunner::new(backend.clone(), SandboxLimits::default()),
            Runtime::python(),
        )
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_free_function_submission() {
        let backend = docker();
        let cases = parse_test_case_list(
            "[{'input': {'a': 1, 'b': 2}, 'expected_output': 3}, \
              {'input': {'a': -4, 'b': 4}, 'expected_output': 0}]",
        )
        .unwrap();

        let verdicts = grader(&backend)
            .run_test_cases_with_function("def add(a, b):\n    return a + b\n", "add", &cases)
            .await;

        assert_eq!(verdicts.len(), 2);
        assert!(verdicts.iter().all(|v| v.correct == Correctness::Yes), "{:?}", verdicts);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_bare_script_submission() {
        let backend = docker();
        let cases = parse_test_case_list("[{'input': {'a': 2, 'b': 5}, 'expected_output': 7}]").unwrap();

        let verdicts = grader(&backend).run_test_cases_without_function("print(a + b)", &cases).await;

        assert_eq!(verdicts[0].correct, Correctness::Yes, "{:?}", verdicts[0]);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_class_method_submission() {
        let backend = docker();
        let code = "class Point:\n    def __init__(self, x, y):\n        self.x, self.y = x, y\n\
                    \n    def equals(self, other):\n        return (self.x, self.y) == (other.x, other.y)\n";
        let cases = parse_test_case_list(
            "[{'input': {'x': 1, 'y': 2}, 'expected_output': True, 'method_to_test': 'equals', \
               'class_initialization_value': {'x': 1, 'y': 2}, 'input_type': 'class_object'}]",
        )
        .unwrap();

        let verdicts = grader(&backend).run_test_cases_with_class(code, "Point", &cases).await;

        assert_eq!(verdicts[0].correct, Correctness::Yes, "{:?}", verdicts[0]);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_runtime_error_submission() {
        let backend = docker();
        let cases = parse_test_case_list("[{'input': {}, 'expected_output': 1}]").unwrap();

        let verdicts = grader(&backend)
            .run_test_cases_without_function("raise RuntimeError('boom')", &cases)
            .await;

        assert_eq!(verdicts[0].correct, Correctness::No);
        assert!(verdicts[0].error.as_deref().unwrap_or("").contains("RuntimeError"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_infinite_loop_is_stopped() {
        let backend = docker();
        let runner = IsolationRunner::new(backend.clone(), SandboxLimits::default());

        // Pull ahead of time so the measurement covers only the run
        backend.ensure_image(&Runtime::python().image).await.unwrap();

        let started = Instant::now();
        let result = runner
            .run(&Runtime::python(), "while True:\n    pass\n", Duration::from_secs(2))
            .await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
        assert!(started.elapsed() < Duration::from_secs(2) + WAIT_GRACE);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_network_is_disabled() {
        let backend = docker();
        let runner = IsolationRunner::new(backend.clone(), SandboxLimits::default());
        let connect_attempt = "import socket\n\
                     try:\n    socket.create_connection(('1.1.1.1', 53), timeout=2)\n    print('online')\n\
                     except OSError:\n    print('offline')\n";

        let result = runner.run(&Runtime::python(), connect_attempt, Duration::from_secs(10)).await;

        assert!(result.success, "{:?}", result);
        assert_eq!(result.raw_output.trim(), "offline");
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_no_sandbox_outlives_its_run() {
        let backend = docker();
        let runner = IsolationRunner::new(backend.clone(), SandboxLimits::default());

        runner.run(&Runtime::python(), "print(1)", Duration::from_secs(10)).await;
        runner.run(&Runtime::python(), "import sys; sys.exit(3)", Duration::from_secs(10)).await;
        runner.run(&Runtime::python(), "while True: pass", Duration::from_secs(1)).await;

        assert!(backend.live_sandboxes().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_run_cancelled_during_start_leaves_no_sandbox() {
        let backend = docker();
        backend.ensure_image(&Runtime::python().image).await.unwrap();
        let runner = IsolationRunner::new(backend.clone(), SandboxLimits::default());

        // Cut runs off at several points inside create/start
        for delay_ms in [1, 5, 20, 50, 200] {
            let abandoned = tokio::time::timeout(
                Duration::from_millis(delay_ms),
                runner.run(&Runtime::python(), "import time\ntime.sleep(60)\n", Duration::from_secs(60)),
            )
            .await;
            assert!(abandoned.is_err());
        }

        // Let the spawned removals reach the daemon
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(backend.live_sandboxes().await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_output_flood_is_capped() {
        let backend = docker();
        let limits = SandboxLimits::default().with_output_limit_kb(64).unwrap();
        let runner = IsolationRunner::new(backend.clone(), limits);

        let result = runner
            .run(&Runtime::python(), "import sys\nsys.stdout.write('x' * 10_000_000)\n", Duration::from_secs(20))
            .await;

        assert_eq!(result.failure, Some(FailureKind::ExecutionError));
        assert!(result.raw_output.contains("output limit exceeded"));
    }
}
