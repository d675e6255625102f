//! Declarative predicates over an event's field map
//!
//! A [`FieldPredicate`] names a field, a comparator and a literal. A [`Rule`]
//! is a named conjunction of predicates. Evaluation never fails outward: a
//! type mismatch is reported as [`PipelineError::PredicateEvaluation`] by
//! [`FieldPredicate::evaluate`] and treated as a non-match by
//! [`FieldPredicate::matches`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{PipelineError, Result};

/// Comparison operator of a field predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Gt,
    Lt,
    Ge,
    Le,
    /// Exact match against any value of a candidate list
    In,
}

impl Comparator {
    fn is_numeric(self) -> bool {
        matches!(self, Self::Gt | Self::Lt | Self::Ge | Self::Le)
    }
}

/// A single `field <op> literal` matcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldPredicate {
    pub field: String,
    pub op: Comparator,
    pub value: Value,
}

impl FieldPredicate {
    pub fn new(field: impl Into<String>, op: Comparator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Comparator::Eq, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Comparator::Gt, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Comparator::Lt, value)
    }

    pub fn ge(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Comparator::Ge, value)
    }

    pub fn le(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Comparator::Le, value)
    }

    pub fn one_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let list: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::new(field, Comparator::In, Value::Array(list))
    }

    /// Check that the literal fits the comparator
    pub fn validate(&self) -> Result<()> {
        if self.field.trim().is_empty() {
            return Err(PipelineError::Config("predicate field name is empty".into()));
        }
        match self.op {
            op if op.is_numeric() => {
                if !self.value.is_number() {
                    return Err(PipelineError::Config(format!(
                        "`{:?}` on `{}` needs a numeric literal, got {}",
                        op, self.field, self.value
                    )));
                }
            }
            Comparator::In => match &self.value {
                Value::Array(items) if !items.is_empty() && items.iter().all(is_scalar) => {}
                _ => {
                    return Err(PipelineError::Config(format!(
                        "`in` on `{}` needs a non-empty list of scalar values",
                        self.field
                    )))
                }
            },
            _ => {
                if !is_scalar(&self.value) {
                    return Err(PipelineError::Config(format!(
                        "`eq` on `{}` needs a scalar literal",
                        self.field
                    )));
                }
            }
        }
        Ok(())
    }

    /// Evaluate against `fields`.
    ///
    /// An absent field is `Ok(false)`. A numeric comparison against a
    /// non-numeric field is a `PredicateEvaluation` error.
    pub fn evaluate(&self, fields: &Map<String, Value>) -> Result<bool> {
        let Some(actual) = fields.get(&self.field) else {
            return Ok(false);
        };

        match self.op {
            Comparator::Eq => Ok(scalar_eq(actual, &self.value)),
            Comparator::In => Ok(match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| scalar_eq(actual, c)),
                _ => false,
            }),
            op => {
                let (Some(lhs), Some(rhs)) = (actual.as_f64(), self.value.as_f64()) else {
                    return Err(PipelineError::PredicateEvaluation(format!(
                        "field `{}` = {} is not comparable to {}",
                        self.field, actual, self.value
                    )));
                };
                Ok(match op {
                    Comparator::Gt => lhs > rhs,
                    Comparator::Lt => lhs < rhs,
                    Comparator::Ge => lhs >= rhs,
                    _ => lhs <= rhs,
                })
            }
        }
    }

    /// Evaluate, treating evaluation errors as a non-match
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        match self.evaluate(fields) {
            Ok(matched) => matched,
            Err(e) => {
                debug!(field = %self.field, "Predicate treated as non-match: {}", e);
                false
            }
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(value, Value::Bool(_) | Value::Number(_) | Value::String(_))
}

/// Exact equality of two scalars; numbers compare by value (`3` equals `3.0`)
fn scalar_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => match (a.as_i64(), b.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => a.as_f64() == b.as_f64(),
        },
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => false,
    }
}

/// A named conjunction of field predicates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(rename = "match", default)]
    pub predicates: Vec<FieldPredicate>,
}

impl Rule {
    /// Build and validate a rule
    pub fn new(name: impl Into<String>, predicates: Vec<FieldPredicate>) -> Result<Self> {
        let rule = Self {
            name: name.into(),
            predicates,
        };
        rule.validate()?;
        Ok(rule)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("rule name is empty".into()));
        }
        for predicate in &self.predicates {
            predicate.validate()?;
        }
        Ok(())
    }

    /// True iff every predicate matches; an empty rule matches everything
    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        self.predicates.iter().all(|p| p.matches(fields))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DerivedEvent;
    use serde_json::json;

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_gt_ten_boundary() {
        let rule = Rule::new("long", vec![FieldPredicate::gt("derivedMetric", 10)]).unwrap();
        let at = |n| DerivedEvent::metric_computed("n", n).fields();
        assert!(!rule.matches(&at(10)));
        assert!(!rule.matches(&at(3)));
        assert!(rule.matches(&at(11)));
    }

    #[test]
    fn test_numeric_comparators() {
        let f = fields(json!({"x": 5}));
        assert!(FieldPredicate::ge("x", 5).matches(&f));
        assert!(!FieldPredicate::gt("x", 5).matches(&f));
        assert!(FieldPredicate::le("x", 5.0).matches(&f));
        assert!(FieldPredicate::lt("x", 5.5).matches(&f));
        assert!(!FieldPredicate::lt("x", 5).matches(&f));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let f = fields(json!({"noteId": "n1", "kind": "metricComputed"}));
        let p = FieldPredicate::gt("derivedMetric", 10);
        assert_eq!(p.evaluate(&f), Ok(false));
        assert!(!p.matches(&f));
        assert!(!FieldPredicate::equals("missing", "x").matches(&f));
    }

    #[test]
    fn test_non_numeric_field_is_evaluation_error_and_non_match() {
        let f = fields(json!({"derivedMetric": "eleven"}));
        let p = FieldPredicate::gt("derivedMetric", 10);
        assert!(matches!(
            p.evaluate(&f),
            Err(PipelineError::PredicateEvaluation(_))
        ));
        assert!(!p.matches(&f));
    }

    #[test]
    fn test_eq_and_in_are_exact() {
        let f = fields(json!({"kind": "metricComputed", "n": 3}));
        assert!(FieldPredicate::equals("kind", "metricComputed").matches(&f));
        assert!(!FieldPredicate::equals("kind", "MetricComputed").matches(&f));
        assert!(FieldPredicate::equals("n", 3.0).matches(&f));
        assert!(!FieldPredicate::equals("n", "3").matches(&f));

        assert!(FieldPredicate::one_of("kind", ["other", "metricComputed"]).matches(&f));
        assert!(!FieldPredicate::one_of("kind", ["other"]).matches(&f));
        assert!(FieldPredicate::one_of("n", [1, 2, 3]).matches(&f));
    }

    #[test]
    fn test_rule_is_conjunction() {
        let rule = Rule::new(
            "both",
            vec![
                FieldPredicate::gt("derivedMetric", 10),
                FieldPredicate::equals("kind", "metricComputed"),
            ],
        )
        .unwrap();
        assert!(rule.matches(&fields(json!({"derivedMetric": 12, "kind": "metricComputed"}))));
        assert!(!rule.matches(&fields(json!({"derivedMetric": 12, "kind": "other"}))));
        assert!(!rule.matches(&fields(json!({"derivedMetric": 2, "kind": "metricComputed"}))));
    }

    #[test]
    fn test_empty_rule_matches_everything() {
        let rule = Rule::new("all", vec![]).unwrap();
        assert!(rule.matches(&fields(json!({}))));
    }

    #[test]
    fn test_validation_rejects_bad_literals() {
        assert!(Rule::new("r", vec![FieldPredicate::gt("x", "ten")]).is_err());
        assert!(Rule::new("r", vec![FieldPredicate::new("x", Comparator::In, json!([]))]).is_err());
        assert!(Rule::new("r", vec![FieldPredicate::new("x", Comparator::In, json!(3))]).is_err());
        assert!(Rule::new("r", vec![FieldPredicate::equals("x", json!({"a": 1}))]).is_err());
        assert!(Rule::new("r", vec![FieldPredicate::equals("", 1)]).is_err());
        assert!(Rule::new(" ", vec![]).is_err());
    }

    #[test]
    fn test_rule_deserializes_from_yaml() {
        let yaml = r#"
name: long-notes
match:
  - field: derivedMetric
    op: gt
    value: 10
  - field: kind
    op: in
    value: [metricComputed]
"#;
        let rule: Rule = serde_yaml::from_str(yaml).unwrap();
        rule.validate().unwrap();
        assert_eq!(rule.predicates.len(), 2);
        assert_eq!(rule.predicates[0].op, Comparator::Gt);
        assert!(rule.matches(&DerivedEvent::metric_computed("n", 11).fields()));
    }
}
