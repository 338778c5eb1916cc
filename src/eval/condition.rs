//! MongoDB-style targeting conditions.
//!
//! Conditions arrive as JSON inside feature rules and are parsed once into a [`Condition`]
//! tree. Evaluation never fails: a comparison that can't be applied (missing attribute,
//! type mismatch, invalid pattern, unknown operator) simply doesn't match.

use log::warn;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// Maximum nesting of condition objects accepted by [`Condition::parse`].
pub const MAX_CONDITION_DEPTH: usize = 64;

/// Reasons a condition can't be parsed.
#[derive(Error, Debug, PartialEq)]
pub enum ConditionError {
    /// A condition (or a logical operand) is not a JSON object. Holds the JSON type found.
    #[error("condition must be a JSON object, got {0}")]
    NotAnObject(&'static str),
    /// `$and`, `$or` or `$nor` was given something other than an array.
    #[error("'{0}' expects an array of conditions")]
    ExpectedArray(String),
    /// The condition exceeds [`MAX_CONDITION_DEPTH`].
    #[error("condition is nested deeper than {MAX_CONDITION_DEPTH} levels")]
    TooDeep,
}

/// A parsed targeting condition.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Every nested condition must match. An empty list matches.
    And(Vec<Condition>),
    /// At least one nested condition must match. An empty list matches.
    Or(Vec<Condition>),
    /// No nested condition may match. An empty list doesn't match.
    Nor(Vec<Condition>),
    /// Negation of the nested condition.
    Not(Box<Condition>),
    /// Test of the attribute at a dot-separated path.
    Field(String, ValueCondition),
}

/// The right-hand side of a [`Condition::Field`].
#[derive(Debug, Clone)]
pub enum ValueCondition {
    /// Shorthand comparison against a literal value.
    Literal(Value),
    /// Object of `$` operators, all of which must match.
    Operators(Vec<Operator>),
}

/// A single `$` operator of a [`ValueCondition::Operators`] object.
#[derive(Debug, Clone)]
pub enum Operator {
    /// `$eq`
    Eq(Value),
    /// `$ne`
    Ne(Value),
    /// `$lt`
    Lt(Value),
    /// `$lte`
    Lte(Value),
    /// `$gt`
    Gt(Value),
    /// `$gte`
    Gte(Value),
    /// `None` when the pattern is not a string or doesn't compile.
    Regex(Option<Regex>),
    /// `None` when the comparison value is not an array.
    In(Option<Vec<Value>>),
    /// `$nin`, the negation of `$in`.
    Nin(Option<Vec<Value>>),
    /// `$exists`
    Exists(bool),
    /// `$type`, compared against the JSON type name of the attribute.
    Type(Option<String>),
    /// `$size`, applied to the length of an array attribute.
    Size(Box<ValueCondition>),
    /// `$elemMatch`
    ElemMatch(ElemMatch),
    /// `$all`: every listed condition matches some element of an array attribute.
    All(Option<Vec<ValueCondition>>),
    /// `$not`
    Not(Box<ValueCondition>),
    /// `$veq`, `$vne`, `$vgt`, `$vgte`, `$vlt` and `$vlte` with the padded version operand.
    Version(VersionOp, String),
    /// An operator this crate doesn't know. Never matches.
    Unknown(String),
}

/// Operand of `$elemMatch`. Operator objects test elements directly, anything else is
/// evaluated as a condition against each element.
#[derive(Debug, Clone)]
pub enum ElemMatch {
    /// An object made of `$` operators.
    Value(Box<ValueCondition>),
    /// A field condition.
    Condition(Box<Condition>),
}

/// Comparison of a version operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VersionOp {
    /// `$veq`
    Eq,
    /// `$vne`
    Ne,
    /// `$vgt`
    Gt,
    /// `$vgte`
    Gte,
    /// `$vlt`
    Lt,
    /// `$vlte`
    Lte,
}

impl Condition {
    /// Parses a JSON condition object.
    ///
    /// # Errors
    ///
    /// Fails if the condition (or a nested logical operand) is not an object, a logical
    /// operator doesn't hold an array, or the tree is nested deeper than [`MAX_CONDITION_DEPTH`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// use featgate::Condition;
    /// use serde_json::json;
    ///
    /// let condition = Condition::parse(&json!({"country": {"$in": ["US", "CA"]}})).unwrap();
    /// assert!(condition.eval(&json!({"country": "US"})));
    /// assert!(!condition.eval(&json!({"country": "FR"})));
    /// ```
    pub fn parse(value: &Value) -> Result<Condition, ConditionError> {
        parse_condition(value, 0)
    }

    /// Evaluates the condition against an attribute object.
    pub fn eval(&self, attributes: &Value) -> bool {
        eval_condition(attributes, self)
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Condition::parse(&value).map_err(serde::de::Error::custom)
    }
}

fn parse_condition(value: &Value, depth: usize) -> Result<Condition, ConditionError> {
    if depth > MAX_CONDITION_DEPTH {
        return Err(ConditionError::TooDeep);
    }
    let obj = value
        .as_object()
        .ok_or_else(|| ConditionError::NotAnObject(type_of(Some(value))))?;
    let mut nodes = Vec::with_capacity(obj.len());
    for (key, val) in obj {
        let node = match key.as_str() {
            "$and" => Condition::And(parse_list(key, val, depth)?),
            "$or" => Condition::Or(parse_list(key, val, depth)?),
            "$nor" => Condition::Nor(parse_list(key, val, depth)?),
            "$not" => Condition::Not(Box::new(parse_condition(val, depth + 1)?)),
            _ => Condition::Field(key.clone(), parse_value_condition(val, depth + 1)?),
        };
        nodes.push(node);
    }
    if nodes.len() == 1 {
        if let Some(node) = nodes.pop() {
            return Ok(node);
        }
    }
    Ok(Condition::And(nodes))
}

fn parse_list(key: &str, value: &Value, depth: usize) -> Result<Vec<Condition>, ConditionError> {
    let items = value
        .as_array()
        .ok_or_else(|| ConditionError::ExpectedArray(key.to_owned()))?;
    items
        .iter()
        .map(|item| parse_condition(item, depth + 1))
        .collect()
}

fn parse_value_condition(value: &Value, depth: usize) -> Result<ValueCondition, ConditionError> {
    if depth > MAX_CONDITION_DEPTH {
        return Err(ConditionError::TooDeep);
    }
    match as_operator_object(value) {
        Some(ops) => Ok(ValueCondition::Operators(
            ops.iter()
                .map(|(name, expected)| parse_operator(name, expected, depth))
                .collect::<Result<_, _>>()?,
        )),
        None => Ok(ValueCondition::Literal(value.clone())),
    }
}

fn parse_operator(name: &str, expected: &Value, depth: usize) -> Result<Operator, ConditionError> {
    let op = match name {
        "$eq" => Operator::Eq(expected.clone()),
        "$ne" => Operator::Ne(expected.clone()),
        "$lt" => Operator::Lt(expected.clone()),
        "$lte" => Operator::Lte(expected.clone()),
        "$gt" => Operator::Gt(expected.clone()),
        "$gte" => Operator::Gte(expected.clone()),
        "$regex" => Operator::Regex(expected.as_str().and_then(|pattern| {
            Regex::new(pattern)
                .map_err(|err| warn!(event_id = 4002; "Invalid regex in condition '{pattern}': {err}"))
                .ok()
        })),
        "$in" => Operator::In(expected.as_array().cloned()),
        "$nin" => Operator::Nin(expected.as_array().cloned()),
        "$exists" => Operator::Exists(is_truthy(Some(expected))),
        "$type" => Operator::Type(expected.as_str().map(str::to_owned)),
        "$size" => Operator::Size(Box::new(parse_value_condition(expected, depth + 1)?)),
        "$elemMatch" => Operator::ElemMatch(if expected.is_object() && as_operator_object(expected).is_none() {
            ElemMatch::Condition(Box::new(parse_condition(expected, depth + 1)?))
        } else {
            ElemMatch::Value(Box::new(parse_value_condition(expected, depth + 1)?))
        }),
        "$all" => Operator::All(match expected.as_array() {
            Some(items) => Some(
                items
                    .iter()
                    .map(|item| parse_value_condition(item, depth + 1))
                    .collect::<Result<_, _>>()?,
            ),
            None => None,
        }),
        "$not" => Operator::Not(Box::new(parse_value_condition(expected, depth + 1)?)),
        "$veq" => Operator::Version(VersionOp::Eq, version_operand(expected)),
        "$vne" => Operator::Version(VersionOp::Ne, version_operand(expected)),
        "$vgt" => Operator::Version(VersionOp::Gt, version_operand(expected)),
        "$vgte" => Operator::Version(VersionOp::Gte, version_operand(expected)),
        "$vlt" => Operator::Version(VersionOp::Lt, version_operand(expected)),
        "$vlte" => Operator::Version(VersionOp::Lte, version_operand(expected)),
        unknown => {
            warn!(event_id = 4001; "Unknown condition operator '{unknown}', it will never match");
            Operator::Unknown(unknown.to_owned())
        }
    };
    Ok(op)
}

fn version_operand(expected: &Value) -> String {
    padded_version(to_js_string(Some(expected)).unwrap_or_default().as_str())
}

/// Returns the object when it's non-empty and every key is an operator.
fn as_operator_object(value: &Value) -> Option<&Map<String, Value>> {
    let obj = value.as_object()?;
    if !obj.is_empty() && obj.keys().all(|k| k.starts_with('$')) {
        Some(obj)
    } else {
        None
    }
}

/// Evaluates `condition` against `attributes`.
pub fn eval_condition(attributes: &Value, condition: &Condition) -> bool {
    match condition {
        Condition::And(items) => items.iter().all(|c| eval_condition(attributes, c)),
        Condition::Or(items) => items.is_empty() || items.iter().any(|c| eval_condition(attributes, c)),
        Condition::Nor(items) => {
            !(items.is_empty() || items.iter().any(|c| eval_condition(attributes, c)))
        }
        Condition::Not(inner) => !eval_condition(attributes, inner),
        Condition::Field(path, value_condition) => {
            eval_value_condition(value_condition, get_path(attributes, path))
        }
    }
}

/// Looks up a dot-separated path. Array elements are addressed by their index.
pub(crate) fn get_path<'a>(attributes: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(attributes, |current, part| match current {
        Value::Object(obj) => obj.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn eval_value_condition(condition: &ValueCondition, actual: Option<&Value>) -> bool {
    match condition {
        ValueCondition::Operators(ops) => ops.iter().all(|op| eval_operator(op, actual)),
        ValueCondition::Literal(expected) => match expected {
            Value::String(s) => to_js_string(actual).is_some_and(|a| a == *s),
            Value::Number(n) => to_number(actual).is_some_and(|a| Some(a) == n.as_f64()),
            Value::Bool(b) => is_truthy(actual) == *b,
            Value::Null => is_nullish(actual),
            Value::Array(_) | Value::Object(_) => actual.is_some_and(|a| json_eq(a, expected)),
        },
    }
}

fn eval_operator(op: &Operator, actual: Option<&Value>) -> bool {
    match op {
        Operator::Eq(expected) => eq_nullable(actual, expected),
        Operator::Ne(expected) => !eq_nullable(actual, expected),
        Operator::Lt(expected) => compare(actual, expected) == Some(Ordering::Less),
        Operator::Lte(expected) => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operator::Gt(expected) => compare(actual, expected) == Some(Ordering::Greater),
        Operator::Gte(expected) => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operator::Regex(regex) => match (regex, actual) {
            (Some(regex), Some(Value::String(s))) => regex.is_match(s),
            _ => false,
        },
        Operator::In(Some(list)) => is_in(actual, list),
        Operator::Nin(Some(list)) => !is_in(actual, list),
        Operator::In(None) | Operator::Nin(None) => false,
        Operator::Exists(should_exist) => !is_nullish(actual) == *should_exist,
        Operator::Type(expected) => expected.as_deref() == Some(type_of(actual)),
        Operator::Size(inner) => match actual {
            Some(Value::Array(items)) => {
                eval_value_condition(inner, Some(&Value::from(items.len())))
            }
            _ => false,
        },
        Operator::ElemMatch(elem_match) => match actual {
            Some(Value::Array(items)) => items.iter().any(|item| match elem_match {
                ElemMatch::Value(inner) => eval_value_condition(inner, Some(item)),
                ElemMatch::Condition(inner) => eval_condition(item, inner),
            }),
            _ => false,
        },
        Operator::All(Some(expected)) => match actual {
            Some(Value::Array(items)) => expected
                .iter()
                .all(|cond| items.iter().any(|item| eval_value_condition(cond, Some(item)))),
            _ => false,
        },
        Operator::All(None) => false,
        Operator::Not(inner) => !eval_value_condition(inner, actual),
        Operator::Version(version_op, expected) => {
            let actual = match actual {
                Some(val @ (Value::String(_) | Value::Number(_))) => to_js_string(Some(val)),
                _ => None,
            };
            let Some(actual) = actual else {
                return false;
            };
            let actual = padded_version(actual.as_str());
            let ord = actual.as_str().cmp(expected.as_str());
            match version_op {
                VersionOp::Eq => ord == Ordering::Equal,
                VersionOp::Ne => ord != Ordering::Equal,
                VersionOp::Gt => ord == Ordering::Greater,
                VersionOp::Gte => ord != Ordering::Less,
                VersionOp::Lt => ord == Ordering::Less,
                VersionOp::Lte => ord != Ordering::Greater,
            }
        }
        Operator::Unknown(_) => false,
    }
}

fn is_in(actual: Option<&Value>, list: &[Value]) -> bool {
    match actual {
        Some(Value::Array(items)) => items
            .iter()
            .any(|item| list.iter().any(|expected| json_eq(item, expected))),
        _ => list.iter().any(|expected| eq_nullable(actual, expected)),
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn eq_nullable(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        Some(actual) => json_eq(actual, expected),
        None => expected.is_null(),
    }
}

/// Structural JSON equality where numbers compare by value (`1 == 1.0`).
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| json_eq(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len() && x.iter().all(|(k, l)| y.get(k).is_some_and(|r| json_eq(l, r)))
        }
        _ => a == b,
    }
}

fn is_nullish(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn type_of(value: Option<&Value>) -> &'static str {
    match value {
        None => "undefined",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}

fn to_number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        _ => None,
    }
}

/// Renders scalars the way the other SDKs stringify them, so `1.0` becomes `"1"`.
pub(crate) fn to_js_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(number_to_js_string(n)),
        _ => None,
    }
}

fn number_to_js_string(n: &Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e21 => format!("{f:.0}"),
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

/// Turns a version into a string that sorts correctly: `v1.2.3-rc.1+build` becomes
/// `"    1-    2-    3-rc-    1"` and release versions get a trailing `~`.
pub(crate) fn padded_version(input: &str) -> String {
    let trimmed = input.strip_prefix('v').unwrap_or(input);
    let without_build = trimmed.split('+').next().unwrap_or_default();
    let mut parts: Vec<&str> = without_build.split(['-', '.']).collect();
    if parts.len() == 3 {
        parts.push("~");
    }
    parts
        .iter()
        .map(|part| {
            if !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                format!("{part:>5}")
            } else {
                (*part).to_owned()
            }
        })
        .collect::<Vec<String>>()
        .join("-")
}
