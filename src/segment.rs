//! Segment matching: AND-combined attribute conditions evaluated against an
//! [`EvaluationContext`].
use std::cmp::Ordering;

use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::{models::TryParse, EvaluationContext, EvaluationError, UserSegment};

/// Evaluate `segment` against `context`.
///
/// An empty condition list matches unconditionally. Every condition is evaluated, so a
/// misconfigured condition is reported even when an earlier one already failed.
pub fn evaluate_segment(
    segment: &UserSegment,
    context: &EvaluationContext,
) -> Result<bool, EvaluationError> {
    segment
        .conditions
        .iter()
        .try_fold(true, |matched, condition| {
            Ok(condition.evaluate(context)? && matched)
        })
}

/// Return keys of all `segments` that `context` belongs to.
///
/// Segments that fail to evaluate are skipped.
pub fn evaluate_user_in_segments(
    segments: &[UserSegment],
    context: &EvaluationContext,
) -> Vec<String> {
    segments
        .iter()
        .filter(|segment| match evaluate_segment(segment, context) {
            Ok(matched) => matched,
            Err(err) => {
                log::debug!(target: "flagwise",
                            segment_key:display = segment.key;
                            "skipping segment that failed to evaluate: {err}");
                false
            }
        })
        .map(|segment| segment.key.clone())
        .collect()
}

/// A single `{attribute, operator, value}` triple.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Condition {
    pub attribute: String,
    /// Wrapped in `TryParse` so that an unknown operator fails evaluation of this segment only.
    pub operator: TryParse<ConditionOperator>,
    #[serde(default)]
    pub value: ConditionValue,
}

impl Condition {
    pub fn new(
        attribute: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<ConditionValue>,
    ) -> Condition {
        Condition {
            attribute: attribute.into(),
            operator: TryParse::Parsed(operator),
            value: value.into(),
        }
    }

    pub fn evaluate(&self, context: &EvaluationContext) -> Result<bool, EvaluationError> {
        let operator = match &self.operator {
            TryParse::Parsed(operator) => operator,
            TryParse::ParseFailed(raw) => {
                let name = raw.as_str().map_or_else(|| raw.to_string(), str::to_owned);
                return Err(EvaluationError::UnknownOperator(name));
            }
        };
        operator.eval(context.resolve(&self.attribute).as_ref(), &self.value)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ConditionValue {
    Multiple(Vec<serde_json::Value>),
    Single(serde_json::Value),
}

impl Default for ConditionValue {
    fn default() -> ConditionValue {
        ConditionValue::Single(serde_json::Value::Null)
    }
}

impl From<serde_json::Value> for ConditionValue {
    fn from(value: serde_json::Value) -> ConditionValue {
        match value {
            serde_json::Value::Array(values) => ConditionValue::Multiple(values),
            value => ConditionValue::Single(value),
        }
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> ConditionValue {
        ConditionValue::Single(value.into())
    }
}

impl ConditionValue {
    fn as_slice(&self) -> &[serde_json::Value] {
        match self {
            ConditionValue::Multiple(values) => values,
            ConditionValue::Single(value) => std::slice::from_ref(value),
        }
    }

    fn single(&self) -> Option<&serde_json::Value> {
        match self {
            ConditionValue::Single(value) => Some(value),
            ConditionValue::Multiple(_) => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne")]
    NotEquals,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Regex,
    Exists,
    NotExists,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    VersionEquals,
    VersionGreaterThan,
    VersionGreaterThanOrEqual,
    VersionLessThan,
    VersionLessThanOrEqual,
}

impl ConditionOperator {
    /// Apply the operator to a resolved attribute. An unresolved attribute fails every operator
    /// except `exists`/`not_exists`.
    fn eval(
        self,
        attribute: Option<&serde_json::Value>,
        condition_value: &ConditionValue,
    ) -> Result<bool, EvaluationError> {
        let attribute = match (self, attribute) {
            (Self::Exists, attribute) => return Ok(attribute.is_some()),
            (Self::NotExists, attribute) => return Ok(attribute.is_none()),
            (_, None) => return Ok(false),
            (_, Some(attribute)) => attribute,
        };

        let result = match self {
            Self::Equals | Self::NotEquals => {
                let Some(expected) = condition_value.single() else {
                    return Ok(false);
                };
                values_equal(attribute, expected) == (self == Self::Equals)
            }

            Self::In | Self::NotIn => {
                let is_one_of = condition_value
                    .as_slice()
                    .iter()
                    .any(|expected| values_equal(attribute, expected));
                is_one_of == (self == Self::In)
            }

            Self::Contains | Self::NotContains => {
                let Some(expected) = condition_value.single() else {
                    return Ok(false);
                };
                let contains = match attribute {
                    serde_json::Value::Array(items) => {
                        items.iter().any(|item| values_equal(item, expected))
                    }
                    serde_json::Value::String(s) => match scalar_text(expected) {
                        Some(needle) => s.contains(needle.as_str()),
                        None => return Ok(false),
                    },
                    _ => return Ok(false),
                };
                contains == (self == Self::Contains)
            }

            Self::StartsWith | Self::EndsWith => {
                let (Some(s), Some(affix)) = (
                    scalar_text(attribute),
                    condition_value.single().and_then(scalar_text),
                ) else {
                    return Ok(false);
                };
                if self == Self::StartsWith {
                    s.starts_with(affix.as_str())
                } else {
                    s.ends_with(affix.as_str())
                }
            }

            Self::Regex => {
                let Some(serde_json::Value::String(pattern)) = condition_value.single() else {
                    return Ok(false);
                };
                let regex = Regex::new(pattern).map_err(|err| EvaluationError::InvalidRegex {
                    pattern: pattern.clone(),
                    message: err.to_string(),
                })?;
                let Some(s) = scalar_text(attribute) else {
                    return Ok(false);
                };
                regex.is_match(&s)
            }

            Self::GreaterThan | Self::GreaterThanOrEqual | Self::LessThan | Self::LessThanOrEqual => {
                let (Some(attribute_value), Some(condition_value)) = (
                    as_number(attribute),
                    condition_value.single().and_then(as_number),
                ) else {
                    return Ok(false);
                };
                match self {
                    Self::GreaterThan => attribute_value > condition_value,
                    Self::GreaterThanOrEqual => attribute_value >= condition_value,
                    Self::LessThan => attribute_value < condition_value,
                    _ => attribute_value <= condition_value,
                }
            }

            Self::VersionEquals
            | Self::VersionGreaterThan
            | Self::VersionGreaterThanOrEqual
            | Self::VersionLessThan
            | Self::VersionLessThanOrEqual => {
                let (Some(attribute_version), Some(condition_version)) = (
                    scalar_text(attribute).as_deref().and_then(parse_version),
                    condition_value
                        .single()
                        .and_then(scalar_text)
                        .as_deref()
                        .and_then(parse_version),
                ) else {
                    return Ok(false);
                };
                let ordering = attribute_version.cmp(&condition_version);
                match self {
                    Self::VersionEquals => ordering == Ordering::Equal,
                    Self::VersionGreaterThan => ordering == Ordering::Greater,
                    Self::VersionGreaterThanOrEqual => ordering != Ordering::Less,
                    Self::VersionLessThan => ordering == Ordering::Less,
                    _ => ordering != Ordering::Greater,
                }
            }

            Self::Exists | Self::NotExists => {
                // handled above
                return Ok(false);
            }
        };

        Ok(result)
    }
}

/// Textual form of a scalar. Numbers and booleans compare against strings this way.
fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn values_equal(attribute: &serde_json::Value, expected: &serde_json::Value) -> bool {
    if attribute == expected {
        return true;
    }
    if let (serde_json::Value::Number(a), serde_json::Value::Number(b)) = (attribute, expected) {
        return a.as_f64() == b.as_f64();
    }
    matches!((scalar_text(attribute), scalar_text(expected)), (Some(a), Some(b)) if a == b)
}

/// Parse a version leniently: a leading `v` is ignored and missing minor/patch components are
/// treated as zero, so `v2` and `1.4` are accepted.
fn parse_version(s: &str) -> Option<Version> {
    let s = s.trim();
    let s = s.strip_prefix(|c: char| c == 'v' || c == 'V').unwrap_or(s);
    if let Ok(version) = Version::parse(s) {
        return Some(version);
    }

    let split_at = s.find(|c: char| c == '-' || c == '+').unwrap_or(s.len());
    let (core, suffix) = s.split_at(split_at);
    let mut components = core.split('.').collect::<Vec<_>>();
    if components.is_empty() || components.len() > 3 {
        return None;
    }
    components.resize(3, "0");
    Version::parse(&format!("{}{}", components.join("."), suffix)).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        evaluate_segment, evaluate_user_in_segments, parse_version, Condition, ConditionOperator,
        ConditionValue,
    };
    use crate::{EvaluationContext, EvaluationError, UserSegment};

    fn eval(
        operator: ConditionOperator,
        attribute: Option<serde_json::Value>,
        value: serde_json::Value,
    ) -> bool {
        operator
            .eval(attribute.as_ref(), &ConditionValue::from(value))
            .unwrap()
    }

    fn segment(key: &str, conditions: Vec<Condition>) -> UserSegment {
        UserSegment {
            key: key.to_owned(),
            name: key.to_owned(),
            conditions,
        }
    }

    #[test]
    fn equals_and_aliases() {
        assert!(eval(ConditionOperator::Equals, Some(json!("pro")), json!("pro")));
        assert!(!eval(ConditionOperator::Equals, Some(json!("free")), json!("pro")));
        assert!(eval(ConditionOperator::Equals, Some(json!(42)), json!("42")));
        assert!(eval(ConditionOperator::Equals, Some(json!(42)), json!(42.0)));
        assert!(eval(ConditionOperator::Equals, Some(json!(true)), json!("true")));
        assert!(eval(ConditionOperator::NotEquals, Some(json!("free")), json!("pro")));

        let condition: Condition =
            serde_json::from_value(json!({"attribute": "plan", "operator": "eq", "value": "pro"}))
                .unwrap();
        assert_eq!(
            condition.operator,
            crate::models::TryParse::Parsed(ConditionOperator::Equals)
        );
    }

    #[test]
    fn in_and_not_in() {
        let regions = json!(["US", "CA"]);
        assert!(eval(ConditionOperator::In, Some(json!("US")), regions.clone()));
        assert!(!eval(ConditionOperator::In, Some(json!("EU")), regions.clone()));
        assert!(eval(ConditionOperator::NotIn, Some(json!("EU")), regions.clone()));
        assert!(!eval(ConditionOperator::NotIn, Some(json!("CA")), regions.clone()));

        // NOT_IN fails when attribute is not specified
        assert!(!eval(ConditionOperator::NotIn, None, regions));
    }

    #[test]
    fn contains_strings_and_arrays() {
        assert!(eval(ConditionOperator::Contains, Some(json!("alice@example.com")), json!("@example")));
        assert!(eval(ConditionOperator::Contains, Some(json!(["a", "b"])), json!("b")));
        assert!(!eval(ConditionOperator::Contains, Some(json!(["a", "b"])), json!("c")));
        assert!(eval(ConditionOperator::NotContains, Some(json!("alice@test.com")), json!("@example")));
        assert!(!eval(ConditionOperator::NotContains, None, json!("@example")));
    }

    #[test]
    fn prefixes_and_suffixes() {
        assert!(eval(ConditionOperator::StartsWith, Some(json!("enterprise-eu")), json!("enterprise")));
        assert!(!eval(ConditionOperator::StartsWith, Some(json!("team")), json!("enterprise")));
        assert!(eval(ConditionOperator::EndsWith, Some(json!("alice@example.com")), json!(".com")));
    }

    #[test]
    fn matches_regex() {
        assert!(eval(ConditionOperator::Regex, Some(json!("test@example.com")), json!("^test.*")));
        assert!(!eval(ConditionOperator::Regex, Some(json!("example@test.com")), json!("^test.*")));
        assert!(eval(ConditionOperator::Regex, Some(json!(12345)), json!("^\\d+$")));
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let result = ConditionOperator::Regex.eval(Some(&json!("abc")), &"(unclosed".into());
        assert!(matches!(result, Err(EvaluationError::InvalidRegex { .. })));
    }

    #[test]
    fn exists_and_not_exists() {
        assert!(eval(ConditionOperator::Exists, Some(json!("x")), json!(null)));
        assert!(!eval(ConditionOperator::Exists, None, json!(null)));
        assert!(eval(ConditionOperator::NotExists, None, json!(null)));
        assert!(!eval(ConditionOperator::NotExists, Some(json!(0)), json!(null)));
    }

    #[test]
    fn numeric_comparisons() {
        assert!(eval(ConditionOperator::GreaterThanOrEqual, Some(json!(18)), json!(18)));
        assert!(!eval(ConditionOperator::GreaterThanOrEqual, Some(json!(17)), json!(18)));
        assert!(eval(ConditionOperator::GreaterThan, Some(json!(19)), json!(18)));
        assert!(!eval(ConditionOperator::GreaterThan, Some(json!(18)), json!(18)));
        assert!(eval(ConditionOperator::LessThanOrEqual, Some(json!("18")), json!(18)));
        assert!(eval(ConditionOperator::LessThan, Some(json!(17.5)), json!("18")));
    }

    #[test]
    fn numeric_comparison_needs_numbers() {
        assert!(!eval(ConditionOperator::GreaterThan, Some(json!("abc")), json!(1)));
        assert!(!eval(ConditionOperator::LessThan, Some(json!(1)), json!("abc")));
        assert!(!eval(ConditionOperator::LessThan, Some(json!(true)), json!(2)));
    }

    #[test]
    fn version_comparisons() {
        assert!(eval(ConditionOperator::VersionGreaterThan, Some(json!("1.10.0")), json!("1.2.0")));
        assert!(eval(ConditionOperator::VersionGreaterThan, Some(json!("v10")), json!("v2")));
        assert!(eval(ConditionOperator::VersionGreaterThanOrEqual, Some(json!("1.0.0")), json!("1.0")));
        assert!(!eval(ConditionOperator::VersionGreaterThanOrEqual, Some(json!("0.9.9")), json!("1.0.0")));
        assert!(eval(ConditionOperator::VersionLessThan, Some(json!("1.2.0")), json!("1.10.0")));
        assert!(!eval(ConditionOperator::VersionLessThan, Some(json!("1.13.0")), json!("1.5.0")));
        assert!(eval(ConditionOperator::VersionLessThanOrEqual, Some(json!("2.0.0")), json!("2")));
        assert!(eval(ConditionOperator::VersionEquals, Some(json!("v1.4")), json!("1.4.0")));
        assert!(!eval(ConditionOperator::VersionEquals, Some(json!("not-a-version")), json!("1.0.0")));
    }

    #[test]
    fn lenient_version_parsing() {
        assert_eq!(parse_version("v2").unwrap().to_string(), "2.0.0");
        assert_eq!(parse_version("1.4-beta.1").unwrap().to_string(), "1.4.0-beta.1");
        assert!(parse_version("1.2.3.4").is_none());
        assert!(parse_version("").is_none());
    }

    #[test]
    fn empty_segment_matches() {
        let context = EvaluationContext::new("production");
        assert!(evaluate_segment(&segment("everyone", vec![]), &context).unwrap());
    }

    #[test]
    fn conditions_are_and_combined() {
        let pro_north_america = segment(
            "pro-na",
            vec![
                Condition::new("plan", ConditionOperator::Equals, "pro"),
                Condition::new("region", ConditionOperator::In, json!(["US", "CA"])),
            ],
        );

        let us = EvaluationContext::new("production")
            .with_user_attribute("plan", "pro")
            .with_user_attribute("region", "US");
        let eu = EvaluationContext::new("production")
            .with_user_attribute("plan", "pro")
            .with_user_attribute("region", "EU");

        assert!(evaluate_segment(&pro_north_america, &us).unwrap());
        assert!(!evaluate_segment(&pro_north_america, &eu).unwrap());
    }

    #[test]
    fn builtin_attributes_are_resolvable() {
        let staff = segment(
            "staff",
            vec![
                Condition::new("user_id", ConditionOperator::EndsWith, "@corp.example"),
                Condition::new("environment", ConditionOperator::Equals, "staging"),
            ],
        );
        let context = EvaluationContext::new("staging").with_user_id("bob@corp.example");
        assert!(evaluate_segment(&staff, &context).unwrap());
    }

    #[test]
    fn unknown_operator_is_an_error() {
        let broken: UserSegment = serde_json::from_value(json!({
            "key": "broken",
            "conditions": [
                {"attribute": "plan", "operator": "equals", "value": "enterprise"},
                {"attribute": "plan", "operator": "sounds_like", "value": "pro"}
            ]
        }))
        .unwrap();
        let context = EvaluationContext::new("production").with_user_attribute("plan", "pro");

        assert_eq!(
            evaluate_segment(&broken, &context),
            Err(EvaluationError::UnknownOperator("sounds_like".to_owned()))
        );
    }

    #[test]
    fn user_in_segments_skips_errors() {
        let segments = vec![
            segment("everyone", vec![]),
            segment(
                "pro",
                vec![Condition::new("plan", ConditionOperator::Equals, "pro")],
            ),
            segment(
                "enterprise",
                vec![Condition::new("plan", ConditionOperator::Equals, "enterprise")],
            ),
            segment(
                "broken",
                vec![Condition::new("email", ConditionOperator::Regex, "(")],
            ),
        ];
        let context = EvaluationContext::new("production")
            .with_user_attribute("plan", "pro")
            .with_user_attribute("email", "a@b.c");

        assert_eq!(
            evaluate_user_in_segments(&segments, &context),
            vec!["everyone".to_owned(), "pro".to_owned()]
        );
    }
}
