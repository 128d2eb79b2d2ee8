/// Invocation Strategy Dispatcher
///
/// **Core Responsibility:**
/// Assemble the complete program for one `(student code, test case)` pair.
///
/// **Shapes:**
/// - Bare script: input preamble, then the student code, which prints its own answer
/// - Free function: student code, then `print(f(name=value, ...))`
/// - Class method: student code, then `print(C(ctor...).method(args...))`
///
/// Every name spliced into generated source is checked as an identifier first.
use crate::materializer::{keyword_arguments, materialize, positional_arguments};
use thiserror::Error;
use tutor_common::literal::{parse_literal, Value};
use tutor_common::types::{is_identifier, Bindings, InputType, InvocationSpec, TestCase};

/// Marker for stored callable arguments, passed through as source
const LAMBDA_MARKER: &str = "[lambda";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unsupported input_type `{0}` for a class method test")]
    UnsupportedInputType(String),
    #[error("class method test case has no `method_to_test`")]
    MissingMethod,
    #[error("invalid {1} name `{0}`")]
    InvalidName(String, &'static str),
}

/// A generated program plus the human-readable form of what was fed to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub source: String,
    pub display: String,
}

pub fn build_program(
    student_code: &str,
    invocation: &InvocationSpec,
    test_case: &TestCase,
) -> Result<Program, DispatchError> {
    match invocation {
        InvocationSpec::BareScript => Ok(bare_script(student_code, &test_case.input)),
        InvocationSpec::FreeFunction { function_name } => {
            free_function(student_code, function_name, &test_case.input)
        }
        InvocationSpec::ClassMethod { class_name } => class_method(student_code, class_name, test_case),
    }
}

fn bare_script(student_code: &str, input: &Bindings) -> Program {
    let preamble = materialize(input);
    Program {
        source: format!("{}\n{}", preamble, student_code),
        display: preamble.trim_end_matches('\n').to_string(),
    }
}

fn free_function(student_code: &str, function_name: &str, input: &Bindings) -> Result<Program, DispatchError> {
    check_name(function_name, "function")?;

    let arguments: Vec<(&str, Value)> = input
        .iter()
        .map(|(name, value)| (name, decode_argument(value)))
        .collect();
    let call = format!(
        "print({}({}))",
        function_name,
        keyword_arguments(arguments.iter().map(|(name, value)| (*name, value)))
    );

    Ok(Program {
        source: format!("{}\n\n{}\n", student_code, call),
        display: call,
    })
}

fn class_method(student_code: &str, class_name: &str, test_case: &TestCase) -> Result<Program, DispatchError> {
    check_name(class_name, "class")?;
    let method = test_case.method_to_test.as_deref().ok_or(DispatchError::MissingMethod)?;
    check_name(method, "method")?;

    let constructor_args = test_case
        .class_initialization_value
        .as_ref()
        .map(|ctor| positional_arguments(ctor.values()))
        .unwrap_or_default();
    let instance = format!("{}({})", class_name, constructor_args);

    let method_args = match &test_case.input_type {
        None => positional_arguments(test_case.input.values()),
        Some(InputType::ClassObject) => {
            format!("{}({})", class_name, positional_arguments(test_case.input.values()))
        }
        Some(InputType::Unsupported(name)) => return Err(DispatchError::UnsupportedInputType(name.clone())),
    };

    let call = format!("print({}.{}({}))", instance, method, method_args);
    Ok(Program {
        source: format!("{}\n\n{}", student_code, call),
        display: call,
    })
}

/// Stored arguments may hold richer values as text: lambdas are passed through
/// as source, and list/tuple text is decoded. Text that fails to decode stays a string.
fn decode_argument(value: &Value) -> Value {
    match value {
        Value::Str(text) if text.starts_with(LAMBDA_MARKER) => Value::Expr(text.clone()),
        Value::Str(text) if text.starts_with('(') || text.starts_with('[') => {
            parse_literal(text).unwrap_or_else(|_| value.clone())
        }
        other => other.clone(),
    }
}

fn check_name(name: &str, what: &'static str) -> Result<(), DispatchError> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(DispatchError::InvalidName(name.to_string(), what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings(pairs: Vec<(&str, Value)>) -> Bindings {
        let mut bindings = Bindings::new();
        for (name, value) in pairs {
            bindings.insert(name, value).unwrap();
        }
        bindings
    }

    fn free(name: &str) -> InvocationSpec {
        InvocationSpec::FreeFunction { function_name: name.to_string() }
    }

    fn class(name: &str) -> InvocationSpec {
        InvocationSpec::ClassMethod { class_name: name.to_string() }
    }

    #[test]
    fn test_bare_script_prepends_preamble() {
        let tc = TestCase::new(bindings(vec![("a", Value::Int(2)), ("b", Value::Int(5))]), Value::Int(7));
        let program = build_program("print(a+b)", &InvocationSpec::BareScript, &tc).unwrap();
        assert_eq!(program.source, "a = 2\nb = 5\n\nprint(a+b)");
        assert_eq!(program.display, "a = 2\nb = 5");
    }

    #[test]
    fn test_free_function_driver_line() {
        let tc = TestCase::new(bindings(vec![("a", Value::Int(1)), ("b", Value::Int(2))]), Value::Int(3));
        let program = build_program("def add(a,b): return a+b", &free("add"), &tc).unwrap();
        assert_eq!(program.source, "def add(a,b): return a+b\n\nprint(add(a=1, b=2))\n");
        assert_eq!(program.display, "print(add(a=1, b=2))");
    }

    #[test]
    fn test_free_function_decodes_sequence_text() {
        let tc = TestCase::new(
            bindings(vec![
                ("xs", Value::str("[1, 2, 3]")),
                ("pair", Value::str("('a', 1)")),
                ("key", Value::str("[lambda x: -x][0]")),
                ("broken", Value::str("[not a literal")),
                ("plain", Value::str("hello")),
            ]),
            Value::None,
        );
        let program = build_program("", &free("f"), &tc).unwrap();
        assert_eq!(
            program.display,
            "print(f(xs=[1, 2, 3], pair=('a', 1), key=[lambda x: -x][0], broken='[not a literal', plain='hello'))"
        );
    }

    #[test]
    fn test_class_method_driver_line() {
        let tc = TestCase::new(bindings(vec![("amount", Value::Int(5))]), Value::Int(15))
            .with_method("deposit", bindings(vec![("balance", Value::Int(10)), ("owner", Value::str("ann"))]));
        let program = build_program("class Account: ...", &class("Account"), &tc).unwrap();
        assert_eq!(program.display, "print(Account(10, 'ann').deposit(5))");
        assert_eq!(program.source, "class Account: ...\n\nprint(Account(10, 'ann').deposit(5))");
    }

    #[test]
    fn test_class_object_input_builds_sibling_instance() {
        let tc = TestCase::new(bindings(vec![("x", Value::Int(1)), ("y", Value::Int(2))]), Value::Bool(true))
            .with_method("equals", bindings(vec![("x", Value::Int(1)), ("y", Value::Int(2))]))
            .with_input_type(InputType::ClassObject);
        let program = build_program("", &class("Point"), &tc).unwrap();
        assert_eq!(program.display, "print(Point(1, 2).equals(Point(1, 2)))");
    }

    #[test]
    fn test_unsupported_input_type_is_an_error() {
        let tc = TestCase::new(Bindings::new(), Value::None)
            .with_method("m", Bindings::new())
            .with_input_type(InputType::Unsupported("dict".to_string()));
        assert_eq!(
            build_program("", &class("C"), &tc),
            Err(DispatchError::UnsupportedInputType("dict".to_string()))
        );
    }

    #[test]
    fn test_missing_method_and_bad_names() {
        let tc = TestCase::new(Bindings::new(), Value::None);
        assert_eq!(build_program("", &class("C"), &tc), Err(DispatchError::MissingMethod));

        let with_method = tc.clone().with_method("__import__('os')", Bindings::new());
        assert!(matches!(
            build_program("", &class("C"), &with_method),
            Err(DispatchError::InvalidName(_, "method"))
        ));
        assert!(matches!(
            build_program("", &free("f(); g"), &tc),
            Err(DispatchError::InvalidName(_, "function"))
        ));
    }
}
