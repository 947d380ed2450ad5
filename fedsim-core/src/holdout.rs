//! Holdout partitioning of tensor dictionaries.
//!
//! A federation plan declares name patterns for parameters that must never
//! leave the local side ("holdout tensors"). [`split`] partitions a
//! [`TensorDict`] into the shared subset exchanged with the aggregator and
//! the holdout subset kept local; [`merge`] is the two-sided inverse used
//! when aggregated shared weights come back and local training resumes.

use std::str::FromStr;

use derive_more::Display;
use thiserror::Error;

use crate::tensor::TensorDict;

#[derive(Debug, Error, PartialEq)]
/// Errors related to parsing holdout patterns.
pub enum PatternError {
    #[error("empty holdout pattern")]
    Empty,
    #[error("invalid holdout pattern {0:?}: a wildcard may only appear at one edge")]
    Wildcard(String),
}

/// A single name-matching rule of a holdout specification.
///
/// The plan syntax is `name` for an exact match, `prefix*` for a prefix
/// match and `*suffix` for a suffix match.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum HoldoutRule {
    #[display(fmt = "{}", _0)]
    Exact(String),
    #[display(fmt = "{}*", _0)]
    Prefix(String),
    #[display(fmt = "*{}", _0)]
    Suffix(String),
}

impl HoldoutRule {
    /// Checks whether this rule matches `name`.
    pub fn matches(&self, name: &str) -> bool {
        match self {
            HoldoutRule::Exact(exact) => name == exact,
            HoldoutRule::Prefix(prefix) => name.starts_with(prefix.as_str()),
            HoldoutRule::Suffix(suffix) => name.ends_with(suffix.as_str()),
        }
    }
}

impl FromStr for HoldoutRule {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PatternError::Empty);
        }
        let inner_wildcard = |t: &str| t.contains('*');
        if let Some(prefix) = s.strip_suffix('*') {
            if inner_wildcard(prefix) {
                return Err(PatternError::Wildcard(s.to_string()));
            }
            return Ok(HoldoutRule::Prefix(prefix.to_string()));
        }
        if let Some(suffix) = s.strip_prefix('*') {
            if inner_wildcard(suffix) {
                return Err(PatternError::Wildcard(s.to_string()));
            }
            return Ok(HoldoutRule::Suffix(suffix.to_string()));
        }
        if inner_wildcard(s) {
            return Err(PatternError::Wildcard(s.to_string()));
        }
        Ok(HoldoutRule::Exact(s.to_string()))
    }
}

/// The set of holdout rules declared once per federation plan.
///
/// Immutable for the run. A rule that matches no tensor of a given
/// dictionary is not an error, it simply matches nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoldoutSpec(Vec<HoldoutRule>);

impl HoldoutSpec {
    /// Creates a specification from already parsed rules.
    pub fn new(rules: Vec<HoldoutRule>) -> Self {
        Self(rules)
    }

    /// Parses a specification from plan pattern strings.
    pub fn parse<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns
            .into_iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Checks whether any rule matches `name`.
    pub fn matches(&self, name: &str) -> bool {
        self.0.iter().any(|rule| rule.matches(name))
    }

    /// Gets the rules of this specification.
    pub fn rules(&self) -> &[HoldoutRule] {
        &self.0
    }
}

/// The result of partitioning a dictionary: two disjoint dictionaries whose
/// name union equals the input's names.
#[derive(Debug, Clone, PartialEq)]
pub struct Partition {
    pub shared: TensorDict,
    pub holdout: TensorDict,
}

/// Splits `dict` into its shared and holdout subsets according to `spec`.
///
/// Values are moved, not copied; insertion order is preserved within each
/// subset.
pub fn split(dict: TensorDict, spec: &HoldoutSpec) -> Partition {
    let mut shared = TensorDict::new();
    let mut holdout = TensorDict::new();
    for (name, tensor) in dict {
        if spec.matches(&name) {
            holdout.insert(name, tensor);
        } else {
            shared.insert(name, tensor);
        }
    }
    Partition { shared, holdout }
}

#[derive(Debug, Error, PartialEq)]
/// Errors related to re-merging a partitioned dictionary.
pub enum MergeError {
    #[error("tensor {name} is present in both the shared and the holdout dictionary")]
    NameConflict { name: String },
    #[error("expected tensors are missing from the merged dictionary: {}", .missing.join(", "))]
    Incomplete { missing: Vec<String> },
}

/// Merges a shared and a holdout dictionary back into one.
///
/// Fails with [`MergeError::NameConflict`] if any name appears in both.
/// Completeness is the caller's concern, see [`merge_complete`].
pub fn merge(shared: TensorDict, holdout: TensorDict) -> Result<TensorDict, MergeError> {
    let mut merged = shared;
    for (name, tensor) in holdout {
        if merged.contains(&name) {
            return Err(MergeError::NameConflict { name });
        }
        merged.insert(name, tensor);
    }
    Ok(merged)
}

/// Merges like [`merge`] and additionally checks that every name in
/// `expected` is present in the result.
///
/// The full expected name set is model-defined, not spec-defined, which is
/// why completeness detection is a separate entry point.
pub fn merge_complete<'a, I>(
    shared: TensorDict,
    holdout: TensorDict,
    expected: I,
) -> Result<TensorDict, MergeError>
where
    I: IntoIterator<Item = &'a str>,
{
    let merged = merge(shared, holdout)?;
    let missing: Vec<String> = expected
        .into_iter()
        .filter(|name| !merged.contains(name))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(MergeError::Incomplete { missing });
    }
    Ok(merged)
}
