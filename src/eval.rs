//! Flag evaluation.
//!
//! Evaluation is a pure function of a configuration snapshot and the call arguments. It never
//! performs I/O and never blocks, so it's safe to call from any thread.
use serde::{Deserialize, Serialize};

use crate::{
    error::EvaluationError,
    model::{Configuration, Flag, FlagStatus, Segment, Traffic, TryParse},
    sharder::{Murmur3Sharder, Sharder},
    Attributes,
};

/// Result of evaluating a flag for a user: the variant key and its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// Variant key.
    pub key: String,
    /// Variant value as configured on the server.
    pub value: serde_json::Value,
}

impl Variation {
    /// Create a new variation.
    pub fn new(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Variation {
        Variation {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Evaluate `flag_id` for the given user against `configuration`.
///
/// `configuration` is `None` if no configuration has been published yet.
pub fn evaluate(
    configuration: Option<&Configuration>,
    user_id: &str,
    attributes: &Attributes,
    flag_id: &str,
) -> Result<Variation, EvaluationError> {
    evaluate_with_sharder(configuration, user_id, attributes, flag_id, &Murmur3Sharder)
}

pub(crate) fn evaluate_with_sharder(
    configuration: Option<&Configuration>,
    user_id: &str,
    attributes: &Attributes,
    flag_id: &str,
    sharder: &impl Sharder,
) -> Result<Variation, EvaluationError> {
    let configuration = configuration.ok_or(EvaluationError::NotReady)?;

    if user_id.is_empty() || flag_id.is_empty() {
        return Err(EvaluationError::BadRequest);
    }

    let flag = match configuration.flags.get(flag_id) {
        Some(TryParse::Parsed(flag)) => flag,
        Some(TryParse::ParseFailed(_)) => return Err(EvaluationError::ConfigurationParseError),
        None => return Err(EvaluationError::FlagNotFound),
    };

    // Augmenting attributes with id, so that user_id can be used in the rules.
    let augmented_attributes = {
        let mut attributes = attributes.clone();
        attributes
            .entry("id".into())
            .or_insert_with(|| user_id.into());
        attributes
    };

    let key = flag.variant_key(configuration, user_id, &augmented_attributes, sharder)?;

    let variant = flag.variants.get(key).ok_or_else(|| {
        log::warn!(target: "flagsense",
                   flag_id,
                   user_id,
                   variant_key = key;
                   "internal: unable to find variant");
        EvaluationError::ConfigurationError
    })?;

    log::trace!(target: "flagsense",
                flag_id,
                user_id,
                variant_key = key;
                "evaluated a flag");

    Ok(Variation {
        key: key.to_owned(),
        value: variant.value.clone(),
    })
}

impl Flag {
    /// Run the targeting waterfall and return the key of the variant the user gets. The first
    /// matching step wins:
    ///
    /// 1. inactive flag serves the off variant;
    /// 2. any failing prerequisite serves the off variant;
    /// 3. explicitly targeted users get their variant;
    /// 4. the first matching target segment allocates from its distribution;
    /// 5. everyone else is allocated from the default distribution.
    fn variant_key<'a>(
        &'a self,
        configuration: &Configuration,
        user_id: &str,
        augmented_attributes: &Attributes,
        sharder: &impl Sharder,
    ) -> Result<&'a str, EvaluationError> {
        let env_data = &self.env_data;

        if env_data.status == FlagStatus::Inactive {
            return Ok(&env_data.off_variant);
        }

        let prerequisites_match = env_data
            .prerequisites
            .iter()
            .all(|segment_id| is_user_in_segment(configuration, segment_id, augmented_attributes));
        if !prerequisites_match {
            return Ok(&env_data.off_variant);
        }

        if let Some(key) = env_data.target_users.get(user_id) {
            return Ok(key);
        }

        let matching_segment = env_data
            .target_segments_order
            .iter()
            .find(|segment_id| is_user_in_segment(configuration, segment_id, augmented_attributes));
        let traffic = match matching_segment {
            Some(segment_id) => env_data.target_segments.get(segment_id).ok_or_else(|| {
                log::warn!(target: "flagsense",
                           flag_id:display = self.id,
                           segment_id:display;
                           "internal: target segment has no traffic distribution");
                EvaluationError::ConfigurationError
            })?,
            None => &env_data.traffic,
        };

        self.allocate(user_id, traffic, sharder)
            .ok_or(EvaluationError::ConfigurationError)
    }

    /// Pick a variant from `traffic` using consistent hashing of the user and flag ids.
    ///
    /// Returns `None` only if the flag has no variants at all.
    pub(crate) fn allocate<'a>(
        &'a self,
        user_id: &str,
        traffic: &'a Traffic,
        sharder: &impl Sharder,
    ) -> Option<&'a str> {
        if traffic.len() == 1 {
            return traffic.keys().next().map(String::as_str);
        }

        let bucket = sharder.bucket(&format!("{}{}", user_id, self.id), self.seed);

        let mut end_of_range = 0u32;
        for variant in &self.variants_order {
            end_of_range = end_of_range.saturating_add(traffic.get(variant).copied().unwrap_or(0));
            if bucket < end_of_range {
                return Some(variant);
            }
        }

        // Weights didn't cover the bucket.
        self.variants_order.last().map(String::as_str)
    }
}

fn is_user_in_segment(
    configuration: &Configuration,
    segment_id: &str,
    augmented_attributes: &Attributes,
) -> bool {
    configuration
        .segment(segment_id)
        .is_some_and(|segment| segment.matches(augmented_attributes))
}

impl Segment {
    /// Conjunction of disjunctions: every group must contain at least one matching rule.
    pub(crate) fn matches(&self, augmented_attributes: &Attributes) -> bool {
        self.rules
            .iter()
            .all(|group| group.iter().any(|rule| rule.eval(augmented_attributes)))
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Arc};

    use proptest::prelude::*;
    use serde_json::json;

    use super::{evaluate, evaluate_with_sharder, Variation};
    use crate::{
        error::EvaluationError,
        model::{Configuration, EnvData, Flag, FlagStatus, Segment, Traffic, TryParse, Variant},
        rules::{Condition, Rule, StringCondition, StringOperator},
        sharder::{DeterministicSharder, Murmur3Sharder},
        Attributes,
    };

    fn traffic(weights: &[(&str, u32)]) -> Traffic {
        weights.iter().map(|(k, w)| (k.to_string(), *w)).collect()
    }

    fn flag(id: &str, env_data: EnvData) -> Flag {
        Flag {
            id: id.to_owned(),
            seed: 17,
            variants_order: vec!["A".into(), "B".into(), "C".into()],
            variants: HashMap::from([
                ("A".into(), Variant { value: json!("a") }),
                ("B".into(), Variant { value: json!("b") }),
                ("C".into(), Variant { value: json!("c") }),
            ]),
            env_data,
        }
    }

    fn env_data() -> EnvData {
        EnvData {
            status: FlagStatus::Active,
            off_variant: "C".into(),
            prerequisites: vec![],
            target_users: HashMap::new(),
            target_segments_order: vec![],
            target_segments: HashMap::new(),
            traffic: traffic(&[("A", 500), ("B", 500)]),
        }
    }

    fn country_segment(id: &str, countries: &[&str]) -> Segment {
        Segment {
            id: id.to_owned(),
            rules: vec![vec![Rule {
                key: "country".into(),
                condition: Condition::String(StringCondition {
                    operator: StringOperator::Iof,
                    values: countries.iter().map(|c| c.to_string()).collect(),
                }),
                expected: true,
            }]],
        }
    }

    fn configuration(flags: Vec<Flag>, segments: Vec<Segment>) -> Configuration {
        Configuration {
            last_updated_on: 1,
            segments: Arc::new(
                segments
                    .into_iter()
                    .map(|s| (s.id.clone(), TryParse::Parsed(s)))
                    .collect(),
            ),
            flags: Arc::new(
                flags
                    .into_iter()
                    .map(|f| (f.id.clone(), TryParse::Parsed(f)))
                    .collect(),
            ),
            experiments: Arc::new(HashMap::new()),
        }
    }

    fn attrs(pairs: &[(&str, &str)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), (*v).into()))
            .collect()
    }

    #[test]
    fn not_ready_without_configuration() {
        assert_eq!(
            evaluate(None, "user", &Attributes::new(), "flag"),
            Err(EvaluationError::NotReady)
        );
    }

    #[test]
    fn bad_request_on_empty_ids() {
        let config = configuration(vec![flag("f1", env_data())], vec![]);
        assert_eq!(
            evaluate(Some(&config), "", &Attributes::new(), "f1"),
            Err(EvaluationError::BadRequest)
        );
        assert_eq!(
            evaluate(Some(&config), "user", &Attributes::new(), ""),
            Err(EvaluationError::BadRequest)
        );
    }

    #[test]
    fn flag_not_found() {
        let config = configuration(vec![flag("f1", env_data())], vec![]);
        assert_eq!(
            evaluate(Some(&config), "user", &Attributes::new(), "f2"),
            Err(EvaluationError::FlagNotFound)
        );
    }

    #[test]
    fn inactive_flag_returns_off_variant() {
        let mut env = env_data();
        env.status = FlagStatus::Inactive;
        env.target_users = HashMap::from([("alice".into(), "A".into())]);
        let config = configuration(vec![flag("f1", env)], vec![]);

        assert_eq!(
            evaluate(Some(&config), "alice", &Attributes::new(), "f1"),
            Ok(Variation::new("C", "c"))
        );
    }

    #[test]
    fn failing_prerequisite_returns_off_variant() {
        let mut env = env_data();
        env.prerequisites = vec!["india".into()];
        env.traffic = traffic(&[("A", 1000)]);
        let config = configuration(
            vec![flag("f1", env)],
            vec![country_segment("india", &["IN"])],
        );

        assert_eq!(
            evaluate(Some(&config), "u", &attrs(&[("country", "US")]), "f1").unwrap().key,
            "C"
        );
        assert_eq!(
            evaluate(Some(&config), "u", &attrs(&[("country", "IN")]), "f1").unwrap().key,
            "A"
        );
    }

    #[test]
    fn missing_prerequisite_segment_does_not_match() {
        let mut env = env_data();
        env.prerequisites = vec!["deleted".into()];
        let config = configuration(vec![flag("f1", env)], vec![]);

        assert_eq!(
            evaluate(Some(&config), "u", &Attributes::new(), "f1").unwrap().key,
            "C"
        );
    }

    #[test]
    fn target_users_win_over_segments_and_traffic() {
        let mut env = env_data();
        env.target_users = HashMap::from([("alice".into(), "B".into())]);
        env.target_segments_order = vec!["india".into()];
        env.target_segments = HashMap::from([("india".into(), traffic(&[("A", 1000)]))]);
        env.traffic = traffic(&[("C", 1000)]);
        let config = configuration(
            vec![flag("f1", env)],
            vec![country_segment("india", &["IN"])],
        );

        let india = attrs(&[("country", "IN")]);
        assert_eq!(evaluate(Some(&config), "alice", &india, "f1").unwrap().key, "B");
        assert_eq!(evaluate(Some(&config), "bob", &india, "f1").unwrap().key, "A");
        assert_eq!(
            evaluate(Some(&config), "bob", &attrs(&[("country", "US")]), "f1").unwrap().key,
            "C"
        );
    }

    #[test]
    fn first_matching_segment_wins() {
        let mut env = env_data();
        env.target_segments_order = vec!["asia".into(), "india".into()];
        env.target_segments = HashMap::from([
            ("asia".into(), traffic(&[("B", 1000)])),
            ("india".into(), traffic(&[("A", 1000)])),
        ]);
        let config = configuration(
            vec![flag("f1", env)],
            vec![
                country_segment("asia", &["IN", "JP"]),
                country_segment("india", &["IN"]),
            ],
        );

        assert_eq!(
            evaluate(Some(&config), "u", &attrs(&[("country", "IN")]), "f1").unwrap().key,
            "B"
        );
    }

    #[test]
    fn segment_without_distribution_is_configuration_error() {
        let mut env = env_data();
        env.target_segments_order = vec!["india".into()];
        let config = configuration(
            vec![flag("f1", env)],
            vec![country_segment("india", &["IN"])],
        );

        assert_eq!(
            evaluate(Some(&config), "u", &attrs(&[("country", "IN")]), "f1"),
            Err(EvaluationError::ConfigurationError)
        );
    }

    #[test]
    fn id_rule_resolves_to_user_id() {
        let mut env = env_data();
        env.target_segments_order = vec!["staff".into()];
        env.target_segments = HashMap::from([("staff".into(), traffic(&[("B", 1000)]))]);
        env.traffic = traffic(&[("A", 1000)]);
        let segment = Segment {
            id: "staff".into(),
            rules: vec![vec![Rule {
                key: "id".into(),
                condition: Condition::String(StringCondition {
                    operator: StringOperator::Sw,
                    values: vec!["staff-".into()],
                }),
                expected: true,
            }]],
        };
        let config = configuration(vec![flag("f1", env)], vec![segment]);

        let none = Attributes::new();
        assert_eq!(evaluate(Some(&config), "staff-7", &none, "f1").unwrap().key, "B");
        assert_eq!(evaluate(Some(&config), "user-7", &none, "f1").unwrap().key, "A");
        // explicit attribute shadows the user id
        assert_eq!(
            evaluate(Some(&config), "staff-7", &attrs(&[("id", "x")]), "f1").unwrap().key,
            "A"
        );
    }

    #[test]
    fn segment_is_conjunction_of_disjunctions() {
        let rule = |key: &str, value: &str| Rule {
            key: key.into(),
            condition: Condition::String(StringCondition {
                operator: StringOperator::Eq,
                values: vec![value.into()],
            }),
            expected: true,
        };
        let segment = Segment {
            id: "s".into(),
            rules: vec![
                vec![rule("country", "IN"), rule("country", "US")],
                vec![rule("plan", "pro")],
            ],
        };

        assert!(segment.matches(&attrs(&[("country", "US"), ("plan", "pro")])));
        assert!(!segment.matches(&attrs(&[("country", "US"), ("plan", "free")])));
        assert!(!segment.matches(&attrs(&[("country", "UK"), ("plan", "pro")])));
        assert!(Segment { id: "empty".into(), rules: vec![] }.matches(&Attributes::new()));
    }

    #[test]
    fn single_entry_distribution_skips_hashing() {
        let f = flag("f1", env_data());
        let t = traffic(&[("B", 1000)]);
        // An empty sharder would put everyone in bucket 0, i.e. variant "A".
        let sharder = DeterministicSharder(HashMap::new());
        assert_eq!(f.allocate("u", &t, &sharder), Some("B"));
    }

    #[test]
    fn allocation_walks_variants_order() {
        let f = flag("f1", env_data());
        let t = traffic(&[("A", 250), ("B", 250), ("C", 500)]);
        let sharder = DeterministicSharder(HashMap::from([
            ("u0f1".to_owned(), 0),
            // bucket 249
            ("u1f1".to_owned(), 1_070_000_000),
            // bucket 250
            ("u2f1".to_owned(), 1_073_741_824),
            // bucket 999
            ("u3f1".to_owned(), u32::MAX),
        ]));

        assert_eq!(f.allocate("u0", &t, &sharder), Some("A"));
        assert_eq!(f.allocate("u1", &t, &sharder), Some("A"));
        assert_eq!(f.allocate("u2", &t, &sharder), Some("B"));
        assert_eq!(f.allocate("u3", &t, &sharder), Some("C"));
    }

    #[test]
    fn short_distribution_falls_back_to_last_variant() {
        let f = flag("f1", env_data());
        let t = traffic(&[("A", 100), ("B", 100)]);
        let sharder = DeterministicSharder(HashMap::from([("uf1".to_owned(), u32::MAX)]));
        assert_eq!(f.allocate("u", &t, &sharder), Some("C"));
    }

    #[test]
    fn evaluation_uses_sharder() {
        let config = configuration(vec![flag("f1", env_data())], vec![]);
        let sharder = DeterministicSharder(HashMap::from([("bobf1".to_owned(), u32::MAX)]));
        let result = evaluate_with_sharder(Some(&config), "bob", &Attributes::new(), "f1", &sharder);
        assert_eq!(result, Ok(Variation::new("B", "b")));
    }

    #[test]
    fn parse_failed_flag() {
        let config = Configuration {
            flags: Arc::new(HashMap::from([(
                "f1".to_owned(),
                TryParse::ParseFailed(json!({"id": "f1"})),
            )])),
            ..Configuration::default()
        };
        assert_eq!(
            evaluate(Some(&config), "u", &Attributes::new(), "f1"),
            Err(EvaluationError::ConfigurationParseError)
        );
    }

    /// Weights over `variants_order` that sum to exactly 1000.
    fn distribution() -> impl Strategy<Value = Traffic> {
        (0u32..=1000, 0u32..=1000).prop_map(|(x, y)| {
            let (lo, hi) = if x <= y { (x, y) } else { (y, x) };
            traffic(&[("A", lo), ("B", hi - lo), ("C", 1000 - hi)])
        })
    }

    proptest! {
        #[test]
        fn allocation_is_deterministic_and_total(
            user_id in "[a-zA-Z0-9-]{1,24}",
            flag_id in "[a-z0-9_]{1,16}",
            seed in any::<u32>(),
            t in distribution(),
        ) {
            let mut f = flag(&flag_id, env_data());
            f.seed = seed;

            let first = f.allocate(&user_id, &t, &Murmur3Sharder);
            let second = f.allocate(&user_id, &t, &Murmur3Sharder);

            prop_assert_eq!(first, second);
            let key = first.unwrap();
            prop_assert!(f.variants_order.iter().any(|v| v == key));
        }

        #[test]
        fn evaluation_is_deterministic(user_id in "[a-zA-Z0-9-]{1,24}", country in "[A-Z]{2}") {
            let mut env = env_data();
            env.target_segments_order = vec!["india".into()];
            env.target_segments = HashMap::from([("india".into(), traffic(&[("A", 300), ("C", 700)]))]);
            let config = configuration(vec![flag("f1", env)], vec![country_segment("india", &["IN"])]);
            let attributes = attrs(&[("country", country.as_str())]);

            let first = evaluate(Some(&config), &user_id, &attributes, "f1");
            let second = evaluate(Some(&config), &user_id, &attributes, "f1");
            prop_assert_eq!(first, second);
        }
    }
}
