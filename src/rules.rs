//! Segment rules.
//!
//! On the wire a rule is a flat object `{key, type, operator, values, match}`. Here `type` selects
//! a [`Condition`] variant that carries operands already typed for that kind of comparison.
use semver::Prerelease;
use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Attributes};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Rule {
    /// Attribute name. `id` resolves to the user id when not set explicitly.
    pub key: String,
    #[serde(flatten)]
    pub condition: Condition,
    /// Result of the comparison that counts as a match. `false` negates the operator.
    #[serde(rename = "match")]
    pub expected: bool,
}

impl Rule {
    /// Return `true` if the user (described by `augmented_attributes`, which already carry `id`)
    /// matches the rule.
    ///
    /// Missing and null attributes never match, regardless of [`Rule::expected`].
    pub(crate) fn eval(&self, augmented_attributes: &Attributes) -> bool {
        let attribute = match augmented_attributes.get(&self.key) {
            None | Some(AttributeValue::Null) => return false,
            Some(attribute) => attribute,
        };

        self.condition
            .try_eval(attribute)
            .is_some_and(|result| result == self.expected)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Condition {
    Int(NumberCondition),
    Double(NumberCondition),
    Bool(BoolCondition),
    String(StringCondition),
    Version(VersionCondition),
    /// Rule type this SDK does not know. Never matches.
    #[serde(other)]
    Unsupported,
}

impl Condition {
    /// Compare `attribute` against the operands, returning `None` if the comparison cannot be
    /// performed (type mismatch, missing operand, unknown operator).
    fn try_eval(&self, attribute: &AttributeValue) -> Option<bool> {
        match self {
            Condition::Int(condition) | Condition::Double(condition) => condition.try_eval(attribute),
            Condition::Bool(condition) => condition.try_eval(attribute),
            Condition::String(condition) => condition.try_eval(attribute),
            Condition::Version(condition) => condition.try_eval(attribute),
            Condition::Unsupported => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NumberOperator {
    Lt,
    Lte,
    Eq,
    Gt,
    Gte,
    Iof,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NumberCondition {
    pub operator: NumberOperator,
    pub values: Vec<f64>,
}

impl NumberCondition {
    fn try_eval(&self, attribute: &AttributeValue) -> Option<bool> {
        let AttributeValue::Number(n) = attribute else {
            return None;
        };
        let n = *n;

        Some(match self.operator {
            NumberOperator::Lt => n < *self.values.first()?,
            NumberOperator::Lte => n <= *self.values.first()?,
            NumberOperator::Eq => n == *self.values.first()?,
            NumberOperator::Gt => n > *self.values.first()?,
            NumberOperator::Gte => n >= *self.values.first()?,
            NumberOperator::Iof => self.values.contains(&n),
            NumberOperator::Unsupported => return None,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoolOperator {
    Eq,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BoolCondition {
    pub operator: BoolOperator,
    pub values: Vec<bool>,
}

impl BoolCondition {
    fn try_eval(&self, attribute: &AttributeValue) -> Option<bool> {
        let AttributeValue::Boolean(b) = attribute else {
            return None;
        };
        match self.operator {
            BoolOperator::Eq => Some(*b == *self.values.first()?),
            BoolOperator::Unsupported => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StringOperator {
    Eq,
    /// Substring.
    Has,
    /// Starts with.
    Sw,
    /// Ends with.
    Ew,
    /// One of.
    Iof,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StringCondition {
    pub operator: StringOperator,
    pub values: Vec<String>,
}

impl StringCondition {
    fn try_eval(&self, attribute: &AttributeValue) -> Option<bool> {
        let AttributeValue::String(s) = attribute else {
            return None;
        };
        let first = || self.values.first().map(String::as_str);

        Some(match self.operator {
            StringOperator::Eq => s == first()?,
            StringOperator::Has => s.contains(first()?),
            StringOperator::Sw => s.starts_with(first()?),
            StringOperator::Ew => s.ends_with(first()?),
            StringOperator::Iof => self.values.iter().any(|v| v == s),
            StringOperator::Unsupported => return None,
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionOperator {
    Lt,
    Lte,
    Eq,
    Gt,
    Gte,
    Iof,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VersionCondition {
    pub operator: VersionOperator,
    pub values: Vec<String>,
}

impl VersionCondition {
    fn try_eval(&self, attribute: &AttributeValue) -> Option<bool> {
        // Invalid versions on the user side are treated as 0.0, invalid versions in the rule make
        // it inapplicable.
        let attribute_version = match attribute {
            AttributeValue::String(s) => parse_version(s),
            _ => None,
        }
        .unwrap_or_default();

        let first = || self.values.first().and_then(|v| parse_version(v));

        Some(match self.operator {
            VersionOperator::Lt => attribute_version < first()?,
            VersionOperator::Lte => attribute_version <= first()?,
            VersionOperator::Eq => attribute_version == first()?,
            VersionOperator::Gt => attribute_version > first()?,
            VersionOperator::Gte => attribute_version >= first()?,
            VersionOperator::Iof => {
                let mut any = false;
                for value in &self.values {
                    if parse_version(value)? == attribute_version {
                        any = true;
                        break;
                    }
                }
                any
            }
            VersionOperator::Unsupported => return None,
        })
    }
}

/// Version as compared by version rules: up to four numeric release components followed by an
/// optional pre-release.
///
/// Release components are compared numerically first, so `1.2.3.5-beta` is newer than `1.2.3.4`.
/// With equal release components a pre-release sorts before the release itself.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LooseVersion {
    release: [u64; 4],
    pre: Prerelease,
}

impl LooseVersion {
    #[cfg(test)]
    pub(crate) fn new(release: [u64; 4]) -> LooseVersion {
        LooseVersion {
            release,
            pre: Prerelease::EMPTY,
        }
    }
}

/// Parse a loosely formatted version (`1`, `1.2`, `v1.2.3-beta+build`, `1.2.3.4`).
///
/// Missing components default to zero, so `1.2` and `1.2.0.0` are equal. Build metadata is
/// dropped as it doesn't participate in ordering.
pub(crate) fn parse_version(s: &str) -> Option<LooseVersion> {
    let s = s.strip_prefix(&['v', 'V'][..]).unwrap_or(s);
    let s = s.split_once('+').map_or(s, |(version, _build)| version);

    let (core, pre) = match s.split_once('-') {
        Some((core, pre)) => (core, Prerelease::new(pre).ok()?),
        None => (s, Prerelease::EMPTY),
    };

    let mut release = [0; 4];
    let mut components = core.split('.');
    for (i, component) in components.by_ref().take(4).enumerate() {
        if component.is_empty() || !component.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        release[i] = component.parse().ok()?;
    }
    if components.next().is_some() {
        return None;
    }

    Some(LooseVersion { release, pre })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{
        parse_version, BoolCondition, BoolOperator, Condition, LooseVersion, NumberCondition,
        NumberOperator, Rule, StringCondition, StringOperator, VersionCondition, VersionOperator,
    };
    use crate::AttributeValue;

    fn int_rule(operator: NumberOperator, values: Vec<f64>, expected: bool) -> Rule {
        Rule {
            key: "age".into(),
            condition: Condition::Int(NumberCondition { operator, values }),
            expected,
        }
    }

    fn string_rule(operator: StringOperator, values: &[&str], expected: bool) -> Rule {
        Rule {
            key: "email".into(),
            condition: Condition::String(StringCondition {
                operator,
                values: values.iter().map(|v| v.to_string()).collect(),
            }),
            expected,
        }
    }

    fn version_rule(operator: VersionOperator, values: &[&str]) -> Rule {
        Rule {
            key: "app_version".into(),
            condition: Condition::Version(VersionCondition {
                operator,
                values: values.iter().map(|v| v.to_string()).collect(),
            }),
            expected: true,
        }
    }

    fn attrs(key: &str, value: impl Into<AttributeValue>) -> HashMap<String, AttributeValue> {
        HashMap::from([(key.to_owned(), value.into())])
    }

    #[test]
    fn int_eq() {
        assert!(int_rule(NumberOperator::Eq, vec![5.0], true).eval(&attrs("age", 5.0)));
        assert!(!int_rule(NumberOperator::Eq, vec![5.0], false).eval(&attrs("age", 5.0)));
        assert!(int_rule(NumberOperator::Eq, vec![5.0], false).eval(&attrs("age", 6.0)));
    }

    #[test]
    fn number_comparisons() {
        let age = attrs("age", 18.0);
        assert!(int_rule(NumberOperator::Gte, vec![18.0], true).eval(&age));
        assert!(!int_rule(NumberOperator::Gt, vec![18.0], true).eval(&age));
        assert!(int_rule(NumberOperator::Lte, vec![18.0], true).eval(&age));
        assert!(!int_rule(NumberOperator::Lt, vec![18.0], true).eval(&age));
        assert!(int_rule(NumberOperator::Iof, vec![1.0, 18.0], true).eval(&age));
        assert!(!int_rule(NumberOperator::Iof, vec![1.0, 2.0], true).eval(&age));
    }

    #[test]
    fn number_rule_does_not_coerce_strings() {
        assert!(!int_rule(NumberOperator::Eq, vec![5.0], true).eval(&attrs("age", "5")));
        // type mismatch is a non-match even for negated rules
        assert!(!int_rule(NumberOperator::Eq, vec![5.0], false).eval(&attrs("age", "5")));
    }

    #[test]
    fn missing_or_null_attribute_never_matches() {
        let rule = int_rule(NumberOperator::Eq, vec![5.0], false);
        assert!(!rule.eval(&HashMap::new()));
        assert!(!rule.eval(&attrs("age", AttributeValue::Null)));
    }

    #[test]
    fn missing_operand_never_matches() {
        assert!(!int_rule(NumberOperator::Lt, vec![], true).eval(&attrs("age", 1.0)));
        assert!(!int_rule(NumberOperator::Lt, vec![], false).eval(&attrs("age", 1.0)));
    }

    #[test]
    fn bool_eq() {
        let rule = Rule {
            key: "beta".into(),
            condition: Condition::Bool(BoolCondition {
                operator: BoolOperator::Eq,
                values: vec![true],
            }),
            expected: true,
        };
        assert!(rule.eval(&attrs("beta", true)));
        assert!(!rule.eval(&attrs("beta", false)));
        assert!(!rule.eval(&attrs("beta", "true")));
    }

    #[test]
    fn string_operators() {
        let email = attrs("email", "alice@example.com");
        assert!(string_rule(StringOperator::Eq, &["alice@example.com"], true).eval(&email));
        assert!(string_rule(StringOperator::Has, &["@example"], true).eval(&email));
        assert!(string_rule(StringOperator::Sw, &["alice"], true).eval(&email));
        assert!(string_rule(StringOperator::Ew, &[".com"], true).eval(&email));
        assert!(!string_rule(StringOperator::Ew, &[".org"], true).eval(&email));
        assert!(string_rule(StringOperator::Iof, &["bob@example.com", "alice@example.com"], true)
            .eval(&email));
        // not in
        assert!(string_rule(StringOperator::Iof, &["bob@example.com"], false).eval(&email));
    }

    #[test]
    fn unsupported_operator_never_matches() {
        let email = attrs("email", "alice@example.com");
        assert!(!string_rule(StringOperator::Unsupported, &["alice"], true).eval(&email));
        assert!(!string_rule(StringOperator::Unsupported, &["alice"], false).eval(&email));
    }

    #[test]
    fn version_comparisons() {
        let v = attrs("app_version", "1.10.0");
        assert!(version_rule(VersionOperator::Gt, &["1.2.0"]).eval(&v));
        assert!(version_rule(VersionOperator::Gte, &["1.10"]).eval(&v));
        assert!(version_rule(VersionOperator::Eq, &["1.10"]).eval(&v));
        assert!(version_rule(VersionOperator::Lt, &["2"]).eval(&v));
        assert!(!version_rule(VersionOperator::Lte, &["1.9.9"]).eval(&v));
        assert!(version_rule(VersionOperator::Iof, &["1.0.0", "v1.10.0"]).eval(&v));
    }

    #[test]
    fn invalid_attribute_version_is_zero() {
        let rule = version_rule(VersionOperator::Lt, &["1.0.0"]);
        assert!(rule.eval(&attrs("app_version", "abc")));
        assert!(version_rule(VersionOperator::Eq, &["0.0"]).eval(&attrs("app_version", "abc")));
    }

    #[test]
    fn invalid_rule_version_never_matches() {
        let rule = version_rule(VersionOperator::Lt, &["not-a-version"]);
        assert!(!rule.eval(&attrs("app_version", "1.0.0")));
    }

    #[test]
    fn parses_loose_versions() {
        assert_eq!(parse_version("1"), Some(LooseVersion::new([1, 0, 0, 0])));
        assert_eq!(parse_version("v1.2"), Some(LooseVersion::new([1, 2, 0, 0])));
        assert_eq!(parse_version("1.2.3+build.7"), Some(LooseVersion::new([1, 2, 3, 0])));
        assert!(parse_version("1.2.3-beta") < parse_version("1.2.3"));
        assert_eq!(parse_version("1.2.3.4.5"), None);
        assert_eq!(parse_version("1..2"), None);
        assert_eq!(parse_version("abc"), None);
    }

    #[test]
    fn four_component_versions() {
        assert_eq!(parse_version("1.2.3.4"), Some(LooseVersion::new([1, 2, 3, 4])));
        assert_eq!(parse_version("1.2.3.0"), parse_version("1.2.3"));
        assert!(parse_version("1.2.3.4") > parse_version("1.2.3"));
        assert!(parse_version("1.2.3.10") > parse_version("1.2.3.9"));
        assert!(parse_version("1.2.3.5-beta") > parse_version("1.2.3.4"));

        let build = attrs("app_version", "1.2.3.4");
        assert!(version_rule(VersionOperator::Gt, &["1.2.3"]).eval(&build));
        assert!(version_rule(VersionOperator::Lt, &["1.2.3.5"]).eval(&build));
        assert!(version_rule(VersionOperator::Eq, &["v1.2.3.4"]).eval(&build));
        assert!(!version_rule(VersionOperator::Lt, &["1.0.0"]).eval(&build));
    }

    #[test]
    fn deserializes_flat_rule() {
        let rule: Rule = serde_json::from_str(
            r#"{ "key": "age", "type": "INT", "operator": "GTE", "values": [21], "match": true }"#,
        )
        .unwrap();
        assert!(matches!(
            rule.condition,
            Condition::Int(NumberCondition {
                operator: NumberOperator::Gte,
                ..
            })
        ));
        assert!(rule.eval(&attrs("age", 30.0)));

        let rule: Rule = serde_json::from_str(
            r#"{ "key": "email", "type": "STRING", "operator": "REGEX", "values": [".*"], "match": true }"#,
        )
        .unwrap();
        assert!(matches!(
            rule.condition,
            Condition::String(StringCondition {
                operator: StringOperator::Unsupported,
                ..
            })
        ));
    }
}
