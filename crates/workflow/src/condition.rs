//! Condition evaluation for decision routing.
//!
//! Expressions are JsonLogic-shaped JSON documents evaluated against a
//! read-only view of execution state. Evaluation is pure and deterministic;
//! referencing an absent state path is an error rather than an implicit
//! false, so a missing key can never silently route an execution.
//!
//! Supported operators: `var` (dotted/indexed state read), `==`, `!=`, `>`,
//! `<`, `>=`, `<=`, `and`, `or`, `not`. New operators must be additive and
//! must not change the semantics of existing ones.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The key-value execution state a condition reads from.
pub type StateMap = HashMap<String, Value>;

/// Expression grammar identifier. Closed set; new languages are additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConditionLanguage {
    /// JsonLogic-shaped operator trees.
    #[default]
    JsonLogic,
}

/// Errors raised during condition evaluation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConditionError {
    /// Expression referenced a state path that does not exist.
    #[error("state path not found: {0}")]
    MissingPath(String),

    /// Expression is structurally malformed.
    #[error("malformed expression: {0}")]
    Malformed(String),

    /// Expression used an operator outside the grammar.
    #[error("unknown operator: {0}")]
    UnknownOperator(String),

    /// Operands cannot be compared or combined.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Top-level expression did not produce a boolean.
    #[error("expression did not evaluate to a boolean")]
    NotBoolean,
}

/// Evaluate a routing condition against read-only state.
///
/// Same `(expression, state)` always yields the same result; the state is
/// never mutated.
pub fn evaluate(
    expression: &Value,
    language: ConditionLanguage,
    state: &StateMap,
) -> Result<bool, ConditionError> {
    match language {
        ConditionLanguage::JsonLogic => match eval_expr(expression, state)? {
            Value::Bool(b) => Ok(b),
            _ => Err(ConditionError::NotBoolean),
        },
    }
}

/// Evaluate a sub-expression to a JSON value.
///
/// An object with exactly one key is an operator application; everything
/// else is a literal.
fn eval_expr(expression: &Value, state: &StateMap) -> Result<Value, ConditionError> {
    let map = match expression {
        Value::Object(map) => map,
        literal => return Ok(literal.clone()),
    };

    if map.len() != 1 {
        return Err(ConditionError::Malformed(format!(
            "operator object must have exactly one key, found {}",
            map.len()
        )));
    }

    let (op, args) = map.iter().next().expect("len checked above");

    match op.as_str() {
        "var" => {
            let path = match args {
                Value::String(s) => s.as_str(),
                Value::Array(items) => match items.first() {
                    Some(Value::String(s)) => s.as_str(),
                    _ => {
                        return Err(ConditionError::Malformed(
                            "'var' takes a string path".to_string(),
                        ))
                    }
                },
                _ => {
                    return Err(ConditionError::Malformed(
                        "'var' takes a string path".to_string(),
                    ))
                }
            };
            read_path(state, path)
        }
        "==" => {
            let (left, right) = binary_operands(op, args, state)?;
            Ok(Value::Bool(values_equal(&left, &right)))
        }
        "!=" => {
            let (left, right) = binary_operands(op, args, state)?;
            Ok(Value::Bool(!values_equal(&left, &right)))
        }
        ">" => compare(op, args, state, |o| o == std::cmp::Ordering::Greater),
        "<" => compare(op, args, state, |o| o == std::cmp::Ordering::Less),
        ">=" => compare(op, args, state, |o| o != std::cmp::Ordering::Less),
        "<=" => compare(op, args, state, |o| o != std::cmp::Ordering::Greater),
        "and" => {
            for operand in operand_list(op, args)? {
                if !eval_bool(operand, state)? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        "or" => {
            for operand in operand_list(op, args)? {
                if eval_bool(operand, state)? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        "not" => {
            let operand = match args {
                Value::Array(items) if items.len() == 1 => &items[0],
                Value::Array(_) => {
                    return Err(ConditionError::Malformed(
                        "'not' takes exactly one operand".to_string(),
                    ))
                }
                single => single,
            };
            Ok(Value::Bool(!eval_bool(operand, state)?))
        }
        other => Err(ConditionError::UnknownOperator(other.to_string())),
    }
}

/// Evaluate an operand that must produce a boolean.
fn eval_bool(expression: &Value, state: &StateMap) -> Result<bool, ConditionError> {
    match eval_expr(expression, state)? {
        Value::Bool(b) => Ok(b),
        other => Err(ConditionError::TypeMismatch(format!(
            "logical operand is not a boolean: {}",
            other
        ))),
    }
}

/// The operand list of an n-ary operator.
fn operand_list<'a>(op: &str, args: &'a Value) -> Result<&'a [Value], ConditionError> {
    match args {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(ConditionError::Malformed(format!(
            "'{}' takes a non-empty operand array",
            op
        ))),
    }
}

/// Evaluate the two operands of a binary operator.
fn binary_operands(
    op: &str,
    args: &Value,
    state: &StateMap,
) -> Result<(Value, Value), ConditionError> {
    match args {
        Value::Array(items) if items.len() == 2 => {
            let left = eval_expr(&items[0], state)?;
            let right = eval_expr(&items[1], state)?;
            Ok((left, right))
        }
        _ => Err(ConditionError::Malformed(format!(
            "'{}' takes exactly two operands",
            op
        ))),
    }
}

/// Ordering comparison over numbers or strings of the same type.
fn compare(
    op: &str,
    args: &Value,
    state: &StateMap,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> Result<Value, ConditionError> {
    let (left, right) = binary_operands(op, args, state)?;

    let ordering = match (&left, &right) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().ok_or_else(|| {
                ConditionError::TypeMismatch(format!("not a finite number: {}", a))
            })?;
            let b = b.as_f64().ok_or_else(|| {
                ConditionError::TypeMismatch(format!("not a finite number: {}", b))
            })?;
            a.partial_cmp(&b).ok_or_else(|| {
                ConditionError::TypeMismatch("numbers are not comparable".to_string())
            })?
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (a, b) => {
            return Err(ConditionError::TypeMismatch(format!(
                "cannot order {} against {}",
                a, b
            )))
        }
    };

    Ok(Value::Bool(accept(ordering)))
}

/// Loose equality: numbers compare by value, everything else structurally.
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a == b,
            _ => a == b,
        },
        (a, b) => a == b,
    }
}

/// Dereference a dotted/indexed path (`user.scores[0].value`) into the
/// state map. Any missing segment fails the whole read.
fn read_path(state: &StateMap, path: &str) -> Result<Value, ConditionError> {
    let missing = || ConditionError::MissingPath(path.to_string());

    let mut segments = path.split('.');
    let first = segments.next().filter(|s| !s.is_empty()).ok_or_else(|| {
        ConditionError::Malformed(format!("empty state path: '{}'", path))
    })?;

    let (key, indices) = split_indices(first, path)?;
    let mut current = state.get(key).ok_or_else(missing)?;
    for index in indices {
        current = current.get(index).ok_or_else(missing)?;
    }

    for segment in segments {
        let (key, indices) = split_indices(segment, path)?;
        current = current.get(key).ok_or_else(missing)?;
        for index in indices {
            current = current.get(index).ok_or_else(missing)?;
        }
    }

    Ok(current.clone())
}

/// Split a path segment like `scores[0][1]` into its key and indices.
fn split_indices<'a>(
    segment: &'a str,
    full_path: &str,
) -> Result<(&'a str, Vec<usize>), ConditionError> {
    let malformed = || ConditionError::Malformed(format!("malformed state path: '{}'", full_path));

    match segment.find('[') {
        None => {
            if segment.is_empty() {
                return Err(malformed());
            }
            Ok((segment, Vec::new()))
        }
        Some(start) => {
            let key = &segment[..start];
            if key.is_empty() {
                return Err(malformed());
            }
            let mut indices = Vec::new();
            let mut rest = &segment[start..];
            while !rest.is_empty() {
                let inner = rest
                    .strip_prefix('[')
                    .and_then(|r| r.split_once(']'))
                    .ok_or_else(malformed)?;
                let index: usize = inner.0.parse().map_err(|_| malformed())?;
                indices.push(index);
                rest = inner.1;
            }
            Ok((key, indices))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(value: Value) -> StateMap {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            _ => panic!("state fixture must be an object"),
        }
    }

    fn eval(expr: Value, st: &StateMap) -> Result<bool, ConditionError> {
        evaluate(&expr, ConditionLanguage::JsonLogic, st)
    }

    #[test]
    fn test_score_threshold() {
        let st = state(json!({"score": 0.82}));
        assert!(eval(json!({">": [{"var": "score"}, 0.8]}), &st).unwrap());
        assert!(!eval(json!({">": [{"var": "score"}, 0.9]}), &st).unwrap());
    }

    #[test]
    fn test_missing_key_is_an_error_not_false() {
        let st = state(json!({}));
        let err = eval(json!({">": [{"var": "score"}, 0.8]}), &st).unwrap_err();
        assert_eq!(err, ConditionError::MissingPath("score".to_string()));
    }

    #[test]
    fn test_equality_with_numeric_coercion() {
        let st = state(json!({"count": 3}));
        assert!(eval(json!({"==": [{"var": "count"}, 3.0]}), &st).unwrap());
        assert!(eval(json!({"!=": [{"var": "count"}, 4]}), &st).unwrap());
        assert!(eval(json!({"==": [{"var": "count"}, {"var": "count"}]}), &st).unwrap());
    }

    #[test]
    fn test_string_comparison() {
        let st = state(json!({"tier": "gold"}));
        assert!(eval(json!({"==": [{"var": "tier"}, "gold"]}), &st).unwrap());
        assert!(eval(json!({"<": ["alpha", "beta"]}), &st).unwrap());
    }

    #[test]
    fn test_logical_operators() {
        let st = state(json!({"a": 1, "b": 2}));
        let expr = json!({"and": [
            {"<": [{"var": "a"}, {"var": "b"}]},
            {"not": {"==": [{"var": "a"}, {"var": "b"}]}}
        ]});
        assert!(eval(expr, &st).unwrap());

        let expr = json!({"or": [
            {">": [{"var": "a"}, 10]},
            {">": [{"var": "b"}, 1]}
        ]});
        assert!(eval(expr, &st).unwrap());
    }

    #[test]
    fn test_logical_short_circuit() {
        // 'and' stops at the first false operand, so the missing path in the
        // second operand is never read.
        let st = state(json!({"flag": false}));
        let expr = json!({"and": [
            {"var": "flag"},
            {">": [{"var": "missing"}, 1]}
        ]});
        assert!(!eval(expr, &st).unwrap());
    }

    #[test]
    fn test_nested_and_indexed_paths() {
        let st = state(json!({"user": {"scores": [{"value": 7}, {"value": 9}]}}));
        assert!(eval(json!({">=": [{"var": "user.scores[1].value"}, 9]}), &st).unwrap());

        let err = eval(json!({"==": [{"var": "user.scores[5].value"}, 1]}), &st).unwrap_err();
        assert!(matches!(err, ConditionError::MissingPath(_)));
    }

    #[test]
    fn test_unknown_operator() {
        let st = state(json!({}));
        let err = eval(json!({"xor": [true, false]}), &st).unwrap_err();
        assert_eq!(err, ConditionError::UnknownOperator("xor".to_string()));
    }

    #[test]
    fn test_type_mismatch_on_ordering() {
        let st = state(json!({"name": "relay"}));
        let err = eval(json!({">": [{"var": "name"}, 3]}), &st).unwrap_err();
        assert!(matches!(err, ConditionError::TypeMismatch(_)));
    }

    #[test]
    fn test_non_boolean_result_is_rejected() {
        let st = state(json!({"score": 0.5}));
        let err = eval(json!({"var": "score"}), &st).unwrap_err();
        assert_eq!(err, ConditionError::NotBoolean);
    }

    #[test]
    fn test_evaluation_is_deterministic_and_read_only() {
        let st = state(json!({"score": 0.82, "tier": "gold"}));
        let before = st.clone();
        let expr = json!({"and": [
            {">": [{"var": "score"}, 0.8]},
            {"==": [{"var": "tier"}, "gold"]}
        ]});

        let first = eval(expr.clone(), &st).unwrap();
        let second = eval(expr, &st).unwrap();

        assert_eq!(first, second);
        assert_eq!(st, before);
    }

    #[test]
    fn test_malformed_expressions() {
        let st = state(json!({}));
        assert!(matches!(
            eval(json!({"==": [1]}), &st),
            Err(ConditionError::Malformed(_))
        ));
        assert!(matches!(
            eval(json!({"and": []}), &st),
            Err(ConditionError::Malformed(_))
        ));
        assert!(matches!(
            eval(json!({"var": 7}), &st),
            Err(ConditionError::Malformed(_))
        ));
    }
}
