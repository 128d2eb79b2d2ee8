use crate::literal::{parse_literal, LiteralError, Value};
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Whether `name` can be used as a variable, keyword argument, function, class
/// or method name in generated programs. Only ASCII identifiers are accepted.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let starts_well = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    starts_well
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !PYTHON_KEYWORDS.contains(&name)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TestCaseError {
    #[error("`{0}` is not a valid identifier")]
    InvalidIdentifier(String),
    #[error("malformed test case list: {0}")]
    Literal(#[from] LiteralError),
    #[error("malformed test case: {0}")]
    Shape(String),
}

/// Named input values in definition order
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(try_from = "serde_json::Map<String, serde_json::Value>")]
pub struct Bindings(Vec<(String, Value)>);

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name`; rebinding an existing name keeps its original position
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Result<(), TestCaseError> {
        let name = name.into();
        if !is_identifier(&name) {
            return Err(TestCaseError::InvalidIdentifier(name));
        }
        match self.0.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TryFrom<serde_json::Map<String, serde_json::Value>> for Bindings {
    type Error = TestCaseError;

    fn try_from(map: serde_json::Map<String, serde_json::Value>) -> Result<Self, Self::Error> {
        let mut bindings = Bindings::new();
        for (name, value) in map {
            bindings.insert(name, Value::from(value))?;
        }
        Ok(bindings)
    }
}

impl TryFrom<Value> for Bindings {
    type Error = TestCaseError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Dict(pairs) = value else {
            return Err(TestCaseError::Shape(format!("expected a dict of named values, got {}", value)));
        };
        let mut bindings = Bindings::new();
        for (key, value) in pairs {
            match key {
                Value::Str(name) => bindings.insert(name, value)?,
                other => return Err(TestCaseError::InvalidIdentifier(other.to_literal())),
            }
        }
        Ok(bindings)
    }
}

impl Serialize for Bindings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// How a class-method test passes its input to the method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InputType {
    /// The argument is another instance of the class under test
    ClassObject,
    Unsupported(String),
}

impl From<String> for InputType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "class_object" => InputType::ClassObject,
            _ => InputType::Unsupported(name),
        }
    }
}

impl From<InputType> for String {
    fn from(input_type: InputType) -> Self {
        match input_type {
            InputType::ClassObject => "class_object".to_string(),
            InputType::Unsupported(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub input: Bindings,
    pub expected_output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_to_test: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_initialization_value: Option<Bindings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<InputType>,
}

impl TestCase {
    pub fn new(input: Bindings, expected_output: Value) -> Self {
        Self {
            input,
            expected_output,
            method_to_test: None,
            class_initialization_value: None,
            input_type: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>, constructor_args: Bindings) -> Self {
        self.method_to_test = Some(method.into());
        self.class_initialization_value = Some(constructor_args);
        self
    }

    pub fn with_input_type(mut self, input_type: InputType) -> Self {
        self.input_type = Some(input_type);
        self
    }

    fn from_literal(value: Value) -> Result<Self, TestCaseError> {
        let Value::Dict(fields) = value else {
            return Err(TestCaseError::Shape(format!("expected a dict, got {}", value)));
        };

        let mut input = Bindings::new();
        let mut expected_output = None;
        let mut method_to_test = None;
        let mut class_initialization_value = None;
        let mut input_type = None;

        for (key, value) in fields {
            match key.as_str() {
                Some("input") => input = Bindings::try_from(value)?,
                Some("expected_output") => expected_output = Some(value),
                Some("method_to_test") => method_to_test = Some(expect_string("method_to_test", value)?),
                Some("class_initialization_value") => {
                    class_initialization_value = Some(Bindings::try_from(value)?)
                }
                Some("input_type") => {
                    input_type = Some(InputType::from(expect_string("input_type", value)?))
                }
                _ => {}
            }
        }

        Ok(TestCase {
            input,
            expected_output: expected_output
                .ok_or_else(|| TestCaseError::Shape("missing `expected_output`".to_string()))?,
            method_to_test,
            class_initialization_value,
            input_type,
        })
    }
}

fn expect_string(field: &str, value: Value) -> Result<String, TestCaseError> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(TestCaseError::Shape(format!("`{}` must be a string, got {}", field, other))),
    }
}

/// Decode a test case list stored in literal-text form, e.g.
/// `[{'input': {'a': 1}, 'expected_output': 2}]`
pub fn parse_test_case_list(text: &str) -> Result<Vec<TestCase>, TestCaseError> {
    match parse_literal(text)? {
        Value::List(items) | Value::Tuple(items) => items.into_iter().map(TestCase::from_literal).collect(),
        other => Err(TestCaseError::Shape(format!("expected a list of test cases, got {}", other))),
    }
}

/// How student code is invoked for every test case of a question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvocationSpec {
    /// Inputs are bound as variables ahead of the script; the script prints its answer
    BareScript,
    /// `print(function_name(**input))` is appended to the submission
    FreeFunction { function_name: String },
    /// `print(ClassName(*ctor).method(*input))` is appended to the submission
    ClassMethod { class_name: String },
}

impl InvocationSpec {
    /// Select the invocation the way question metadata is interpreted:
    /// a non-blank function name wins, then a class name, else a bare script
    pub fn from_question_metadata(function_name: Option<&str>, class_name: Option<&str>) -> Self {
        let function_name = function_name.map(str::trim).filter(|name| !name.is_empty());
        let class_name = class_name.map(str::trim).filter(|name| !name.is_empty());
        match (function_name, class_name) {
            (Some(function_name), _) => InvocationSpec::FreeFunction {
                function_name: function_name.to_string(),
            },
            (None, Some(class_name)) => InvocationSpec::ClassMethod {
                class_name: class_name.to_string(),
            },
            (None, None) => InvocationSpec::BareScript,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InvocationSpec::BareScript => "bare_script",
            InvocationSpec::FreeFunction { .. } => "free_function",
            InvocationSpec::ClassMethod { .. } => "class_method",
        }
    }
}

/// Why a sandbox run produced no usable output. Diagnostic only: callers
/// treat every failure the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExecutionError,
    Platform,
    Timeout,
    Unexpected,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::ExecutionError => "Execution error",
            FailureKind::Platform => "Sandbox platform error",
            FailureKind::Timeout => "Execution timed out",
            FailureKind::Unexpected => "Unexpected error",
        }
    }
}

/// Outcome of one sandbox run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub raw_output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl ExecutionResult {
    pub fn completed(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            raw_output: stdout.into(),
            failure: None,
        }
    }

    pub fn failed(kind: FailureKind, detail: impl fmt::Display) -> Self {
        Self {
            success: false,
            raw_output: format!("{}: {}", kind.label(), detail),
            failure: Some(kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Correctness {
    Yes,
    No,
}

impl From<bool> for Correctness {
    fn from(correct: bool) -> Self {
        if correct {
            Correctness::Yes
        } else {
            Correctness::No
        }
    }
}

/// Per-test-case grading record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationVerdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_output: Option<Value>,
    pub expected_output: Value,
    pub test_input_to_code: String,
    pub correct: Correctness,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EvaluationVerdict {
    pub fn is_correct(&self) -> bool {
        self.correct == Correctness::Yes
    }
}

/// Verdicts for one submission plus the aggregate pass/fail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReport {
    pub all_passed: bool,
    pub verdicts: Vec<EvaluationVerdict>,
}

impl SubmissionReport {
    pub fn from_verdicts(verdicts: Vec<EvaluationVerdict>) -> Self {
        Self {
            all_passed: verdicts.iter().all(EvaluationVerdict::is_correct),
            verdicts,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.verdicts.iter().filter(|v| v.is_correct()).count()
    }
}

fn default_language() -> String {
    "python".to_string()
}

/// Work item carried over the Redis queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Grade a submission against its test cases
    Grade {
        user_code: String,
        invocation: InvocationSpec,
        test_cases: Vec<TestCase>,
    },
    /// Playground run: execute the code once and return whatever it printed
    Run {
        #[serde(default = "default_language")]
        language: String,
        code: String,
    },
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timeout_secs: None,
            payload,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Passed,
    Failed,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobOutcome {
    Graded(SubmissionReport),
    Ran(ExecutionResult),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Graded(report) if report.all_passed => JobStatus::Passed,
            JobOutcome::Graded(_) => JobStatus::Failed,
            JobOutcome::Ran(result) if result.success => JobStatus::Completed,
            JobOutcome::Ran(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: Uuid,
    pub completed_at: DateTime<Utc>,
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn new(job_id: Uuid, outcome: JobOutcome) -> Self {
        Self {
            job_id,
            completed_at: Utc::now(),
            outcome,
        }
    }
}
