/// Grading entry points - High-Level Orchestration
///
/// **Responsibility:**
/// For every test case: build the program (dispatcher.rs), run it in a
/// sandbox (engine.rs) and judge the output (evaluator.rs).
///
/// **Guarantees:**
/// - Exactly one verdict per test case, in test case order
/// - Every test case runs, even after earlier failures
/// - A broken test case becomes a failing verdict; it never aborts the batch
///
/// With concurrency above 1, test cases run in parallel through an
/// order-preserving buffered stream.
use crate::dispatcher::build_program;
use crate::engine::IsolationRunner;
use crate::evaluator;
use crate::language::Runtime;
use crate::materializer::keyword_arguments;
use futures_util::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{info, warn};
use tutor_common::types::{EvaluationVerdict, ExecutionResult, InvocationSpec, SubmissionReport, TestCase};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct Grader {
    runner: IsolationRunner,
    runtime: Runtime,
    timeout: Duration,
    concurrency: usize,
}

impl Grader {
    /// A strictly sequential grader using the 10 second default timeout
    pub fn new(runner: IsolationRunner, runtime: Runtime) -> Self {
        Self {
            runner,
            runtime,
            timeout: DEFAULT_TIMEOUT,
            concurrency: 1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Bare scripts: inputs are bound as variables ahead of the code
    pub async fn run_test_cases_without_function(
        &self,
        user_code: &str,
        test_cases: &[TestCase],
    ) -> Vec<EvaluationVerdict> {
        self.grade(user_code, &InvocationSpec::BareScript, test_cases).await
    }

    pub async fn run_test_cases_with_function(
        &self,
        user_code: &str,
        function_name: &str,
        test_cases: &[TestCase],
    ) -> Vec<EvaluationVerdict> {
        let invocation = InvocationSpec::FreeFunction {
            function_name: function_name.to_string(),
        };
        self.grade(user_code, &invocation, test_cases).await
    }

    pub async fn run_test_cases_with_class(
        &self,
        user_code: &str,
        class_name: &str,
        test_cases: &[TestCase],
    ) -> Vec<EvaluationVerdict> {
        let invocation = InvocationSpec::ClassMethod {
            class_name: class_name.to_string(),
        };
        self.grade(user_code, &invocation, test_cases).await
    }

    #[tracing::instrument(
        skip(self, user_code, invocation, test_cases),
        fields(kind = invocation.kind(), test_count = test_cases.len())
    )]
    pub async fn grade(
        &self,
        user_code: &str,
        invocation: &InvocationSpec,
        test_cases: &[TestCase],
    ) -> Vec<EvaluationVerdict> {
        let verdicts: Vec<EvaluationVerdict> = stream::iter(test_cases)
            .map(|test_case| self.grade_one(user_code, invocation, test_case))
            .buffered(self.concurrency)
            .collect()
            .await;

        let passed = verdicts.iter().filter(|v| v.is_correct()).count();
        info!(passed, total = verdicts.len(), "Grading finished");
        verdicts
    }

    /// `grade` plus the aggregate pass/fail
    pub async fn grade_report(
        &self,
        user_code: &str,
        invocation: &InvocationSpec,
        test_cases: &[TestCase],
    ) -> SubmissionReport {
        SubmissionReport::from_verdicts(self.grade(user_code, invocation, test_cases).await)
    }

    /// Playground run: execute `code` once and return the raw result
    pub async fn execute(&self, runtime: &Runtime, code: &str) -> ExecutionResult {
        self.runner.run(runtime, code, self.timeout).await
    }

    async fn grade_one(
        &self,
        user_code: &str,
        invocation: &InvocationSpec,
        test_case: &TestCase,
    ) -> EvaluationVerdict {
        let program = match build_program(user_code, invocation, test_case) {
            Ok(program) => program,
            Err(e) => {
                warn!(error = %e, "Test case cannot be dispatched");
                let display = keyword_arguments(test_case.input.iter());
                return evaluator::rejected(&test_case.expected_output, &display, e.to_string());
            }
        };

        let result = self.runner.run(&self.runtime, &program.source, self.timeout).await;
        evaluator::evaluate(&result, &test_case.expected_output, &program.display)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, Scripted};
    use std::sync::Arc;
    use tutor_common::config::SandboxLimits;
    use tutor_common::literal::Value;
    use tutor_common::types::{parse_test_case_list, Bindings, Correctness, InputType};

    fn grader(backend: &Arc<FakeBackend>) -> Grader {
        Grader::new(IsolationRunner::new(backend.clone(), SandboxLimits::default()), Runtime::python())
    }

    /// Prints back the `n` keyword argument of the driver line
    fn echo_argument(program: &str) -> Scripted {
        let n = program
            .rsplit_once("(n=")
            .and_then(|(_, rest)| rest.split_once(')'))
            .map(|(n, _)| n)
            .unwrap_or("");
        Scripted::exit(0, &format!("{}\n", n), "")
    }

    #[tokio::test]
    async fn test_free_function_end_to_end() {
        let backend = FakeBackend::new(|_| Scripted::exit(0, "3\n", ""));
        let cases = parse_test_case_list("[{'input': {'a': 1, 'b': 2}, 'expected_output': 3}]").unwrap();

        let verdicts = grader(&backend)
            .run_test_cases_with_function("def add(a,b): return a+b", "add", &cases)
            .await;

        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].correct, Correctness::Yes);
        assert_eq!(verdicts[0].program_output, Some(Value::Int(3)));
        assert_eq!(verdicts[0].test_input_to_code, "print(add(a=1, b=2))");
        assert_eq!(
            backend.sources(),
            vec!["def add(a,b): return a+b\n\nprint(add(a=1, b=2))\n".to_string()]
        );
    }

    #[tokio::test]
    async fn test_bare_script_end_to_end() {
        let backend = FakeBackend::new(|_| Scripted::exit(0, "7\n", ""));
        let cases = parse_test_case_list("[{'input': {'a': 2, 'b': 5}, 'expected_output': 7}]").unwrap();

        let verdicts = grader(&backend).run_test_cases_without_function("print(a+b)", &cases).await;

        assert!(verdicts[0].is_correct());
        assert!(backend.sources()[0].starts_with("a = 2\nb = 5\n"));
        assert!(backend.sources()[0].ends_with("print(a+b)"));
    }

    #[tokio::test]
    async fn test_runtime_error_end_to_end() {
        let backend = FakeBackend::new(|_| Scripted::exit(1, "", "RuntimeError: boom\n"));
        let cases = parse_test_case_list("[{'input': {}, 'expected_output': 1}]").unwrap();

        let verdicts = grader(&backend)
            .run_test_cases_without_function("raise RuntimeError('boom')", &cases)
            .await;

        assert_eq!(verdicts[0].correct, Correctness::No);
        assert!(verdicts[0].error.as_deref().unwrap().contains("boom"));
        assert_eq!(verdicts[0].program_output, None);
    }

    #[tokio::test]
    async fn test_class_method_with_unsupported_input_type() {
        let backend = FakeBackend::new(|_| Scripted::exit(0, "True\n", ""));
        let mut ctor = Bindings::new();
        ctor.insert("x", Value::Int(1)).unwrap();
        let mut input = Bindings::new();
        input.insert("y", Value::Int(2)).unwrap();
        let good = TestCase::new(input, Value::Bool(true)).with_method("ok", ctor.clone());
        let bad = good.clone().with_input_type(InputType::Unsupported("dict".to_string()));

        let verdicts = grader(&backend)
            .run_test_cases_with_class("class P: ...", "P", &[bad, good])
            .await;

        assert_eq!(verdicts.len(), 2);
        assert!(!verdicts[0].is_correct());
        assert!(verdicts[0].error.as_deref().unwrap().contains("unsupported input_type"));
        assert_eq!(verdicts[0].test_input_to_code, "y=2");
        assert!(verdicts[1].is_correct());
        // Only the valid case reached a sandbox
        assert_eq!(backend.started(), 1);
    }

    #[tokio::test]
    async fn test_every_case_runs_after_failures() {
        let backend = FakeBackend::new(|program| {
            if program.contains("n=2") {
                Scripted::FailWait
            } else {
                Scripted::exit(1, "", "ValueError")
            }
        });
        let cases = parse_test_case_list(
            "[{'input': {'n': 1}, 'expected_output': 1}, {'input': {'n': 2}, 'expected_output': 2}, \
              {'input': {'n': 3}, 'expected_output': 3}]",
        )
        .unwrap();

        let verdicts = grader(&backend).run_test_cases_with_function("", "f", &cases).await;

        assert_eq!(verdicts.len(), 3);
        assert!(verdicts.iter().all(|v| !v.is_correct() && v.error.is_some()));
        assert_eq!(backend.started(), 3);
        assert_eq!(backend.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_grading_preserves_order() {
        // Earlier cases finish last
        let backend = FakeBackend::new(|program| {
            if program.contains("n=0") {
                Scripted::Hang
            } else {
                echo_argument(program)
            }
        });
        let cases: Vec<TestCase> = (0..6)
            .map(|n| {
                let mut input = Bindings::new();
                input.insert("n", Value::Int(n)).unwrap();
                TestCase::new(input, Value::Int(n))
            })
            .collect();
        let grader = grader(&backend).with_concurrency(4).with_timeout(Duration::from_secs(1));
        let verdicts = grader.run_test_cases_with_function("def f(n): return n", "f", &cases).await;

        assert_eq!(verdicts.len(), 6);
        assert_eq!(
            verdicts[0].error.as_deref(),
            Some("Execution timed out: program did not finish within 1.0s")
        );
        for (n, verdict) in verdicts.iter().enumerate().skip(1) {
            assert!(verdict.is_correct());
            assert_eq!(verdict.expected_output, Value::Int(n as i64));
            assert_eq!(verdict.test_input_to_code, format!("print(f(n={}))", n));
        }
        assert_eq!(backend.live_count(), 0);
    }

    #[tokio::test]
    async fn test_report_aggregates() {
        let backend = FakeBackend::new(|program| {
            if program.contains("x = 1") {
                Scripted::exit(0, "1", "")
            } else {
                Scripted::exit(0, "0", "")
            }
        });
        let cases = parse_test_case_list(
            "[{'input': {'x': 1}, 'expected_output': 1}, {'input': {'x': 2}, 'expected_output': 2}]",
        )
        .unwrap();

        let report = grader(&backend)
            .grade_report("print(x)", &InvocationSpec::BareScript, &cases)
            .await;

        assert!(!report.all_passed);
        assert_eq!(report.passed_count(), 1);
    }

    #[tokio::test]
    async fn test_playground_execute_returns_raw_result() {
        let backend = FakeBackend::new(|_| Scripted::exit(0, "hello\n", ""));
        let result = grader(&backend).execute(&Runtime::javascript(), "console.log('hello')").await;
        assert_eq!(result, ExecutionResult::completed("hello\n"));
    }
}
