//! Condition grammar and evaluation.
//!
//! Conditions gate step execution, drive branch steps and select decision
//! branches. They are pure functions over a snapshot of workflow state; the
//! evaluator never touches the store.

use crate::model::{DecisionNode, StateMap};
use crate::OrchestrationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "not_contains")]
    NotContains,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "matches")]
    Matches,
}

/// A condition as written in workflow documents.
///
/// Simple comparisons carry a dotted field path; composites nest. The
/// `expression` and `custom` forms are parsed for forward compatibility but
/// rejected at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Simple {
        field: String,
        operator: Operator,
        value: Value,
    },
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
    Not { not: Box<Condition> },
    Expression { expression: String },
    Custom { custom: String },
}

/// Walk a dotted path (`a.b.c`) through nested objects. A missing segment
/// resolves to `null`, mirroring how agents see absent state keys.
pub fn resolve_path(state: &StateMap, path: &str) -> Value {
    let mut segments = path.split('.');
    let first = match segments.next() {
        Some(first) => first,
        None => return Value::Null,
    };
    let mut current = match state.get(first) {
        Some(value) => value.clone(),
        None => return Value::Null,
    };
    for segment in segments {
        current = match current {
            Value::Object(ref map) => match map.get(segment) {
                Some(value) => value.clone(),
                None => return Value::Null,
            },
            _ => return Value::Null,
        };
    }
    current
}

pub fn evaluate(condition: &Condition, state: &StateMap) -> Result<bool, OrchestrationError> {
    match condition {
        Condition::Simple { field, operator, value } => {
            let actual = resolve_path(state, field);
            compare(*operator, &actual, value)
        }
        Condition::And { and } => {
            for inner in and {
                if !evaluate(inner, state)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Or { or } => {
            for inner in or {
                if evaluate(inner, state)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Condition::Not { not } => Ok(!evaluate(not, state)?),
        Condition::Expression { expression } => Err(OrchestrationError::Validation {
            message: format!("expression conditions are not supported: {}", expression),
        }),
        Condition::Custom { custom } => Err(OrchestrationError::Validation {
            message: format!("custom conditions are not supported: {}", custom),
        }),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn compare(operator: Operator, actual: &Value, expected: &Value) -> Result<bool, OrchestrationError> {
    match operator {
        Operator::Eq => Ok(actual == expected),
        Operator::Ne => Ok(actual != expected),
        Operator::Gt | Operator::Ge | Operator::Lt | Operator::Le => {
            match (numeric(actual), numeric(expected)) {
                (Some(a), Some(b)) => Ok(match operator {
                    Operator::Gt => a > b,
                    Operator::Ge => a >= b,
                    Operator::Lt => a < b,
                    Operator::Le => a <= b,
                    _ => unreachable!(),
                }),
                // Non-numeric operands never satisfy an ordering.
                _ => Ok(false),
            }
        }
        Operator::Contains => Ok(contains(actual, expected)),
        Operator::NotContains => Ok(!contains(actual, expected)),
        Operator::In => Ok(membership(actual, expected)),
        Operator::NotIn => Ok(!membership(actual, expected)),
        Operator::Matches => {
            let pattern = expected.as_str().ok_or_else(|| OrchestrationError::Validation {
                message: "matches operator requires a string pattern".to_string(),
            })?;
            let regex = regex::Regex::new(pattern).map_err(|e| OrchestrationError::Validation {
                message: format!("invalid regex {:?}: {}", pattern, e),
            })?;
            Ok(actual.as_str().map(|s| regex.is_match(s)).unwrap_or(false))
        }
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => expected
            .as_str()
            .map(|needle| haystack.contains(needle))
            .unwrap_or(false),
        Value::Array(items) => items.iter().any(|item| item == expected),
        _ => false,
    }
}

fn membership(actual: &Value, expected: &Value) -> bool {
    match expected {
        Value::Array(items) => items.iter().any(|item| item == actual),
        _ => false,
    }
}

/// Select the branch of a decision node: branches are tried in descending
/// priority order and the first whose condition holds wins. A branch without
/// a condition always matches. Falls back to the declared default branch.
pub fn select_branch(node: &DecisionNode, state: &StateMap) -> Result<String, OrchestrationError> {
    let mut branches: Vec<_> = node.branches.iter().collect();
    branches.sort_by(|a, b| b.priority.cmp(&a.priority));

    for branch in branches {
        let matched = match &branch.condition {
            Some(condition) => evaluate(condition, state)?,
            None => true,
        };
        if matched {
            return Ok(branch.id.clone());
        }
    }

    node.default_branch
        .clone()
        .ok_or(OrchestrationError::NoBranchMatched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DecisionBranch;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> StateMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn simple(field: &str, operator: Operator, value: Value) -> Condition {
        Condition::Simple {
            field: field.to_string(),
            operator,
            value,
        }
    }

    #[test]
    fn dotted_path_walks_nested_objects() {
        let state = state(&[("user", json!({"profile": {"age": 42}}))]);
        assert_eq!(resolve_path(&state, "user.profile.age"), json!(42));
        assert_eq!(resolve_path(&state, "user.profile.missing"), Value::Null);
        assert_eq!(resolve_path(&state, "nothing.at.all"), Value::Null);
    }

    #[test]
    fn numeric_comparisons_coerce_to_float() {
        let state = state(&[("score", json!(0.9)), ("count", json!(3))]);
        assert!(evaluate(&simple("score", Operator::Ge, json!(0.9)), &state).unwrap());
        assert!(evaluate(&simple("count", Operator::Gt, json!(2.5)), &state).unwrap());
        assert!(!evaluate(&simple("count", Operator::Lt, json!(3)), &state).unwrap());
    }

    #[test]
    fn ordering_on_non_numeric_is_false() {
        let state = state(&[("name", json!("abc"))]);
        assert!(!evaluate(&simple("name", Operator::Gt, json!(1)), &state).unwrap());
    }

    #[test]
    fn equality_is_structural() {
        let state = state(&[("tags", json!(["a", "b"]))]);
        assert!(evaluate(&simple("tags", Operator::Eq, json!(["a", "b"])), &state).unwrap());
        assert!(evaluate(&simple("tags", Operator::Ne, json!(["b", "a"])), &state).unwrap());
    }

    #[test]
    fn contains_on_strings_and_arrays() {
        let state = state(&[("message", json!("hello world")), ("items", json!([1, 2, 3]))]);
        assert!(evaluate(&simple("message", Operator::Contains, json!("world")), &state).unwrap());
        assert!(evaluate(&simple("items", Operator::Contains, json!(2)), &state).unwrap());
        assert!(evaluate(&simple("items", Operator::NotContains, json!(9)), &state).unwrap());
    }

    #[test]
    fn membership_in_literal_array() {
        let state = state(&[("env", json!("staging"))]);
        assert!(evaluate(
            &simple("env", Operator::In, json!(["dev", "staging"])),
            &state
        )
        .unwrap());
        assert!(evaluate(
            &simple("env", Operator::NotIn, json!(["prod"])),
            &state
        )
        .unwrap());
    }

    #[test]
    fn matches_compiles_pattern() {
        let state = state(&[("version", json!("v1.2.3"))]);
        assert!(evaluate(
            &simple("version", Operator::Matches, json!(r"^v\d+\.\d+\.\d+$")),
            &state
        )
        .unwrap());
        assert!(evaluate(&simple("version", Operator::Matches, json!("(")), &state).is_err());
    }

    #[test]
    fn composites_nest() {
        let state = state(&[("a", json!(1)), ("b", json!(2))]);
        let condition = Condition::And {
            and: vec![
                simple("a", Operator::Eq, json!(1)),
                Condition::Or {
                    or: vec![
                        simple("b", Operator::Eq, json!(99)),
                        Condition::Not {
                            not: Box::new(simple("b", Operator::Eq, json!(99))),
                        },
                    ],
                },
            ],
        };
        assert!(evaluate(&condition, &state).unwrap());
    }

    #[test]
    fn expression_form_is_rejected() {
        let condition: Condition = serde_json::from_value(json!({"expression": "a > b"})).unwrap();
        assert!(evaluate(&condition, &StateMap::new()).is_err());
    }

    #[test]
    fn condition_json_shape_roundtrips() {
        let condition: Condition = serde_json::from_value(json!({
            "and": [
                {"field": "score", "operator": ">=", "value": 0.5},
                {"not": {"field": "env", "operator": "==", "value": "prod"}}
            ]
        }))
        .unwrap();
        let state = state(&[("score", json!(0.7)), ("env", json!("dev"))]);
        assert!(evaluate(&condition, &state).unwrap());
    }

    #[test]
    fn decision_prefers_highest_priority_match() {
        let node = DecisionNode {
            branches: vec![
                DecisionBranch {
                    id: "medium".to_string(),
                    condition: Some(simple("score", Operator::Ge, json!(0.5))),
                    priority: 5,
                    next_steps: vec![],
                    sub_workflow: None,
                },
                DecisionBranch {
                    id: "high".to_string(),
                    condition: Some(simple("score", Operator::Ge, json!(0.9))),
                    priority: 10,
                    next_steps: vec![],
                    sub_workflow: None,
                },
            ],
            default_branch: Some("low".to_string()),
        };
        let high = state(&[("score", json!(0.9))]);
        assert_eq!(select_branch(&node, &high).unwrap(), "high");
        let medium = state(&[("score", json!(0.6))]);
        assert_eq!(select_branch(&node, &medium).unwrap(), "medium");
        let low = state(&[("score", json!(0.1))]);
        assert_eq!(select_branch(&node, &low).unwrap(), "low");
    }

    #[test]
    fn decision_without_default_errors_when_nothing_matches() {
        let node = DecisionNode {
            branches: vec![DecisionBranch {
                id: "only".to_string(),
                condition: Some(simple("score", Operator::Ge, json!(1.0))),
                priority: 1,
                next_steps: vec![],
                sub_workflow: None,
            }],
            default_branch: None,
        };
        let state = state(&[("score", json!(0.2))]);
        assert!(matches!(
            select_branch(&node, &state),
            Err(OrchestrationError::NoBranchMatched)
        ));
    }
}
