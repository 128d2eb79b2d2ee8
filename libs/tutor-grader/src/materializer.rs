/// Input Materializer
///
/// Turns a test case's named inputs into source text. Values are written in
/// their literal form, so nested structures survive intact and the output is
/// byte-identical for identical bindings.
use tutor_common::literal::Value;
use tutor_common::types::Bindings;

/// One `name = literal` assignment per binding, in binding order
pub fn materialize(bindings: &Bindings) -> String {
    let mut preamble = String::new();
    for (name, value) in bindings.iter() {
        preamble.push_str(name);
        preamble.push_str(" = ");
        preamble.push_str(&value.to_literal());
        preamble.push('\n');
    }
    preamble
}

/// `name=literal` pairs joined for a call site, e.g. `a=1, b=[2, 3]`
pub fn keyword_arguments<'a>(arguments: impl IntoIterator<Item = (&'a str, &'a Value)>) -> String {
    arguments
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value.to_literal()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Literals joined for a call site, names dropped
pub fn positional_arguments<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    values
        .into_iter()
        .map(Value::to_literal)
        .collect::<Vec<_>>()
        .join(", ")
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

    #[test]
    fn test_preamble_binds_in_order() {
        let input = bindings(vec![("a", Value::Int(2)), ("b", Value::Int(5))]);
        assert_eq!(materialize(&input), "a = 2\nb = 5\n");
    }

    #[test]
    fn test_preamble_is_deterministic() {
        let input = bindings(vec![
            ("zeta", Value::str("it's")),
            ("alpha", Value::List(vec![Value::Tuple(vec![Value::Int(1)]), Value::Bool(true)])),
        ]);
        let first = materialize(&input);
        assert_eq!(first, materialize(&input));
        assert_eq!(first, "zeta = \"it's\"\nalpha = [(1,), True]\n");
    }

    #[test]
    fn test_nested_values_are_not_stringified() {
        let input = bindings(vec![(
            "grid",
            Value::Dict(vec![(Value::str("rows"), Value::List(vec![Value::List(vec![Value::Float(0.5)])]))]),
        )]);
        assert_eq!(materialize(&input), "grid = {'rows': [[0.5]]}\n");
    }

    #[test]
    fn test_empty_bindings() {
        assert_eq!(materialize(&Bindings::new()), "");
        assert_eq!(keyword_arguments(Bindings::new().iter()), "");
    }

    #[test]
    fn test_large_integer_input_is_written_exactly() {
        let cases = tutor_common::types::parse_test_case_list(
            "[{'input': {'n': 12345678901234567890123}, 'expected_output': 15511210043330985984000000}]",
        )
        .unwrap();
        assert_eq!(materialize(&cases[0].input), "n = 12345678901234567890123\n");
    }

    #[test]
    fn test_call_arguments() {
        let input = bindings(vec![("a", Value::Int(1)), ("s", Value::str("x"))]);
        assert_eq!(keyword_arguments(input.iter()), "a=1, s='x'");
        assert_eq!(positional_arguments(input.values()), "1, 'x'");
    }
}
