/// Output Normalizer & Comparator
///
/// **Core Responsibility:**
/// Turn the text a program printed back into a typed value and judge it
/// against the expected output.
///
/// **Critical Properties:**
/// - Knows nothing about Docker or how the program was built
/// - Pure function: (execution result, expected output) -> verdict
///
/// **Normalization Order (first match wins):**
/// 1. `true` / `false` (any case) -> bool
/// 2. `none` (any case) -> None
/// 3. integer (exact at any size), then float, else the trimmed text
/// 4. text starting with `(` or `[` is decoded as a literal sequence
///
/// A program that prints the word `True` as a string is indistinguishable
/// from one returning the boolean. Exercises rely on this, so it stays.
///
/// **Comparison:**
/// - Expected list: output must be a list of the same length, equal pairwise
/// - Float output: `isclose` with relative tolerance 1e-9. Printed integers
///   are never compared by closeness.
/// - Anything else: Python equality
use tutor_common::literal::{parse_literal, Value};
use tutor_common::types::{Correctness, EvaluationVerdict, ExecutionResult};

const REL_TOL: f64 = 1e-9;

/// Decode printed text into the richest value it unambiguously represents
pub fn normalize_output(raw: &str) -> Value {
    let trimmed = raw.trim();

    let scalar = if trimmed.eq_ignore_ascii_case("true") {
        Value::Bool(true)
    } else if trimmed.eq_ignore_ascii_case("false") {
        Value::Bool(false)
    } else if trimmed.eq_ignore_ascii_case("none") {
        Value::None
    } else if let Some(integer) = Value::integer(trimmed) {
        integer
    } else if let Ok(f) = trimmed.parse::<f64>() {
        Value::Float(f)
    } else {
        Value::str(trimmed)
    };

    decode_sequence(scalar)
}

/// Expected outputs stored as sequence text are decoded the same way
pub fn normalize_expected(expected: &Value) -> Value {
    decode_sequence(expected.clone())
}

fn decode_sequence(value: Value) -> Value {
    if let Value::Str(text) = &value {
        if text.starts_with('(') || text.starts_with('[') {
            if let Ok(decoded) = parse_literal(text) {
                return decoded;
            }
        }
    }
    value
}

/// `math.isclose(a, b)` with default tolerances
pub fn is_close(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    if a.is_infinite() || b.is_infinite() {
        return false;
    }
    let diff = (a - b).abs();
    diff <= REL_TOL * b.abs() || diff <= REL_TOL * a.abs()
}

/// Type-aware comparison of a normalized output against a normalized expectation
pub fn outputs_match(program_output: &Value, expected: &Value) -> bool {
    if let Value::List(expected_items) = expected {
        return match program_output {
            Value::List(items) => {
                items.len() == expected_items.len()
                    && items.iter().zip(expected_items).all(|(a, b)| a.py_eq(b))
            }
            _ => false,
        };
    }

    if let Value::Float(actual) = program_output {
        // Non-numeric expectations cannot be close to a float
        return expected.as_f64().is_some_and(|e| is_close(*actual, e));
    }

    program_output.py_eq(expected)
}

/// Judge one sandbox run. Failed runs are never parsed.
pub fn evaluate(result: &ExecutionResult, expected_output: &Value, input_display: &str) -> EvaluationVerdict {
    if !result.success {
        let error = if result.raw_output.is_empty() {
            "Unknown error".to_string()
        } else {
            result.raw_output.clone()
        };
        return rejected(expected_output, input_display, error);
    }

    let program_output = normalize_output(&result.raw_output);
    let expected_output = normalize_expected(expected_output);
    let correct = outputs_match(&program_output, &expected_output);

    EvaluationVerdict {
        program_output: Some(program_output),
        expected_output,
        test_input_to_code: input_display.to_string(),
        correct: Correctness::from(correct),
        error: None,
    }
}

/// Verdict for a test case that never produced usable output
pub fn rejected(expected_output: &Value, input_display: &str, error: impl Into<String>) -> EvaluationVerdict {
    EvaluationVerdict {
        program_output: None,
        expected_output: expected_output.clone(),
        test_input_to_code: input_display.to_string(),
        correct: Correctness::No,
        error: Some(error.into()),
    }
}
