//! Server-provided targeting configuration.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use serde::{Deserialize, Deserializer, Serialize};

use crate::rules::Rule;

/// Weighted partition of variants, in thousandths. Weights of a valid distribution sum to 1000.
pub type Traffic = HashMap<String, u32>;

/// An immutable snapshot of everything the SDK needs to evaluate flags.
///
/// Collections are reference-counted so that a new snapshot can reuse the collections the server
/// reported as unchanged.
#[derive(Debug, Default, Clone)]
pub struct Configuration {
    /// Server timestamp of the data this snapshot was built from. `0` for the empty snapshot.
    pub last_updated_on: i64,
    /// Segments by segment id.
    pub segments: Arc<HashMap<String, TryParse<Segment>>>,
    /// Flags by flag id.
    ///
    /// Value is wrapped in `TryParse` so that if we fail to parse one flag (e.g., new server
    /// format), we can still serve other flags.
    pub flags: Arc<HashMap<String, TryParse<Flag>>>,
    /// Experiments by flag id.
    pub experiments: Arc<HashMap<String, Experiment>>,
}

impl Configuration {
    /// Look up a segment by id.
    ///
    /// Segments that failed to parse are reported as missing.
    pub fn segment(&self, segment_id: &str) -> Option<&Segment> {
        self.segments.get(segment_id).and_then(Option::from)
    }

    /// Look up the experiment registered for `flag_id`.
    pub fn experiment(&self, flag_id: &str) -> Option<&Experiment> {
        self.experiments.get(flag_id)
    }
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl<'a, T> From<&'a TryParse<T>> for Option<&'a T> {
    fn from(value: &TryParse<T>) -> Option<&T> {
        match value {
            TryParse::Parsed(v) => Some(v),
            TryParse::ParseFailed(_) => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Flag {
    pub id: String,
    /// Salt for traffic bucketing.
    #[serde(default)]
    pub seed: u32,
    /// Order of variants. Defines traffic ranges and the fallback variant.
    pub variants_order: Vec<String>,
    pub variants: HashMap<String, Variant>,
    pub env_data: EnvData,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct Variant {
    pub value: serde_json::Value,
}

/// Targeting configuration of a flag for one environment.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct EnvData {
    pub status: FlagStatus,
    /// Variant served when the flag is inactive or prerequisites don't match.
    pub off_variant: String,
    /// Segment ids the user must all match.
    #[serde(default, deserialize_with = "null_as_default")]
    pub prerequisites: Vec<String>,
    /// Explicit user id → variant key overrides.
    #[serde(default, deserialize_with = "null_as_default")]
    pub target_users: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub target_segments_order: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub target_segments: HashMap<String, Traffic>,
    /// Default distribution.
    pub traffic: Traffic,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum FlagStatus {
    Active,
    Inactive,
}

/// A reusable user-membership predicate.
///
/// `rules` is a conjunction of disjunctions: every inner list must have at least one matching
/// rule.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Segment {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub rules: Vec<Vec<Rule>>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Experiment {
    pub flag_id: String,
    /// Names of events that may be recorded against this flag.
    #[serde(default, deserialize_with = "null_as_default")]
    pub event_names: HashSet<String>,
}

/// Treat explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
